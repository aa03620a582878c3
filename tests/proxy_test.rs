use bytes::{BufMut, Bytes, BytesMut};
use pg_tap::proxy::protocol::{
    BackendMessage, FrameReader, FrontendMessage, RawFrame, PROTOCOL_VERSION_3,
};
use pg_tap::{EventOp, PgProxy, ProxyConfig};
use std::time::Duration;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// Spawns a minimal scripted PostgreSQL backend on an ephemeral port:
/// trust auth, one CommandComplete per Query / Execute, ReadyForQuery after
/// Query and Sync.
async fn start_scripted_upstream() -> String {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind upstream");
    let addr = listener.local_addr().expect("upstream addr").to_string();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(serve_session(stream));
        }
    });

    addr
}

async fn serve_session(stream: TcpStream) {
    let (read, mut write) = tokio::io::split(stream);
    let mut reader = FrameReader::new(read);

    loop {
        let startup = match reader.next_startup().await {
            Ok(Some(s)) => s,
            _ => return,
        };
        if startup.is_negotiation_request() {
            if write.write_all(b"N").await.is_err() {
                return;
            }
            continue;
        }
        if startup.is_cancel_request() {
            return;
        }
        break;
    }

    let mut buf = BytesMut::new();
    authentication_ok().encode(&mut buf);
    BackendMessage::ReadyForQuery { status: b'I' }.encode(&mut buf);
    if write.write_all(&buf).await.is_err() {
        return;
    }

    loop {
        let frame = match reader.next_frame().await {
            Ok(Some(f)) => f,
            _ => return,
        };
        let msg = match FrontendMessage::decode(frame) {
            Ok(m) => m,
            Err(_) => return,
        };
        let mut buf = BytesMut::new();
        match &msg {
            FrontendMessage::Query { sql } => {
                BackendMessage::CommandComplete {
                    tag: format!("SELECT {}", sql.len()),
                }
                .encode(&mut buf);
                BackendMessage::ReadyForQuery { status: b'I' }.encode(&mut buf);
            }
            FrontendMessage::Parse { .. } => {
                BackendMessage::Other {
                    tag: b'1',
                    body: Bytes::new(),
                }
                .encode(&mut buf);
            }
            FrontendMessage::Bind { .. } => {
                BackendMessage::Other {
                    tag: b'2',
                    body: Bytes::new(),
                }
                .encode(&mut buf);
            }
            FrontendMessage::Execute { .. } => {
                BackendMessage::CommandComplete {
                    tag: "SELECT 1".to_string(),
                }
                .encode(&mut buf);
            }
            FrontendMessage::Other { tag: b'S', .. } => {
                BackendMessage::ReadyForQuery { status: b'I' }.encode(&mut buf);
            }
            FrontendMessage::Other { tag: b'X', .. } => return,
            FrontendMessage::Other { .. } => {}
        }
        if !buf.is_empty() && write.write_all(&buf).await.is_err() {
            return;
        }
    }
}

fn authentication_ok() -> BackendMessage {
    BackendMessage::Other {
        tag: b'R',
        body: Bytes::from_static(&[0, 0, 0, 0]),
    }
}

/// Reserves an ephemeral listen address the proxy can bind afterwards.
async fn reserve_listen_addr() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("reserve");
    let addr = listener.local_addr().expect("addr").to_string();
    drop(listener);
    addr
}

struct ProxyHarness {
    listen_addr: String,
    events: mpsc::Receiver<pg_tap::Event>,
    cancel: CancellationToken,
    run_task: tokio::task::JoinHandle<pg_tap::Result<()>>,
}

async fn start_proxy(upstream_addr: &str, event_capacity: usize) -> ProxyHarness {
    let listen_addr = reserve_listen_addr().await;
    let mut proxy = PgProxy::new(
        ProxyConfig::new(listen_addr.clone(), upstream_addr).with_event_capacity(event_capacity),
    );
    let events = proxy.events().expect("events");
    let cancel = proxy.cancellation_token();
    let run_task = tokio::spawn(async move { proxy.run().await });

    // Wait until the listener accepts connections.
    for _ in 0..50 {
        if TcpStream::connect(&listen_addr).await.is_ok() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    ProxyHarness {
        listen_addr,
        events,
        cancel,
        run_task,
    }
}

fn startup_bytes() -> Bytes {
    let mut body = BytesMut::new();
    body.put_u32(PROTOCOL_VERSION_3);
    body.put(&b"user\0test\0database\0test\0\0"[..]);
    let mut wire = BytesMut::new();
    wire.put_u32(body.len() as u32 + 4);
    wire.put(body);
    wire.freeze()
}

struct Client {
    reader: FrameReader<ReadHalf<TcpStream>>,
    writer: WriteHalf<TcpStream>,
}

impl Client {
    /// Connects and completes the startup handshake through to
    /// ReadyForQuery.
    async fn connect(addr: &str) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect");
        let (read, writer) = tokio::io::split(stream);
        let mut client = Client {
            reader: FrameReader::new(read),
            writer,
        };
        client
            .writer
            .write_all(&startup_bytes())
            .await
            .expect("startup");
        let frames = client.read_until_ready().await;
        assert_eq!(frames.len(), 2, "expected auth ok + ready for query");
        client
    }

    async fn send(&mut self, msg: FrontendMessage) {
        let mut buf = BytesMut::new();
        msg.encode(&mut buf);
        self.writer.write_all(&buf).await.expect("send");
    }

    /// Collects raw frames until ReadyForQuery, inclusive.
    async fn read_until_ready(&mut self) -> Vec<RawFrame> {
        let mut frames = Vec::new();
        loop {
            let frame = timeout(Duration::from_secs(5), self.reader.next_frame())
                .await
                .expect("response timeout")
                .expect("read frame")
                .expect("unexpected eof");
            let done = frame.tag == b'Z';
            frames.push(frame);
            if done {
                return frames;
            }
        }
    }

    async fn query(&mut self, sql: &str) -> Vec<RawFrame> {
        self.send(FrontendMessage::Query {
            sql: sql.to_string(),
        })
        .await;
        self.read_until_ready().await
    }
}

/// Runs one scripted session and returns every backend frame received, for
/// byte-level comparison between proxied and direct connections.
async fn drive_session(addr: &str) -> Vec<RawFrame> {
    let mut client = Client::connect(addr).await;
    let mut frames = Vec::new();

    frames.extend(client.query("SELECT 1").await);

    client
        .send(FrontendMessage::Parse {
            name: String::new(),
            query: "SELECT $1::int + $2::int".to_string(),
            param_types: vec![],
        })
        .await;
    client
        .send(FrontendMessage::Bind {
            portal: String::new(),
            statement: String::new(),
            param_formats: vec![],
            params: vec![Some(b"1".to_vec()), Some(b"2".to_vec())],
            result_formats: vec![],
        })
        .await;
    client
        .send(FrontendMessage::Execute {
            portal: String::new(),
            max_rows: 0,
        })
        .await;
    client
        .send(FrontendMessage::Other {
            tag: b'S',
            body: Bytes::new(),
        })
        .await;
    frames.extend(client.read_until_ready().await);

    client
        .send(FrontendMessage::Other {
            tag: b'X',
            body: Bytes::new(),
        })
        .await;
    frames
}

#[tokio::test]
async fn proxied_session_is_byte_identical_to_direct() {
    let upstream = start_scripted_upstream().await;
    let mut harness = start_proxy(&upstream, 64).await;

    let through_proxy = drive_session(&harness.listen_addr).await;
    let direct = drive_session(&upstream).await;
    assert_eq!(through_proxy, direct);

    // The proxied session also produced capture events.
    let first = harness.events.recv().await.expect("event");
    assert_eq!(first.op, EventOp::Query);
    assert_eq!(first.query, "SELECT 1");
    let second = harness.events.recv().await.expect("event");
    assert_eq!(second.op, EventOp::Execute);
    assert_eq!(second.query, "SELECT $1::int + $2::int");
    assert_eq!(
        second.args,
        Some(vec!["1".to_string(), "2".to_string()])
    );

    harness.cancel.cancel();
    harness.run_task.await.expect("join").expect("run");
}

#[tokio::test]
async fn transaction_events_share_one_identifier_end_to_end() {
    let upstream = start_scripted_upstream().await;
    let mut harness = start_proxy(&upstream, 64).await;

    let mut client = Client::connect(&harness.listen_addr).await;
    client.query("BEGIN").await;
    client.query("INSERT INTO t VALUES (1)").await;
    client.query("COMMIT").await;
    client.query("SELECT 1").await;

    let begin = harness.events.recv().await.expect("begin");
    let insert = harness.events.recv().await.expect("insert");
    let commit = harness.events.recv().await.expect("commit");
    let outside = harness.events.recv().await.expect("outside");

    assert_eq!(begin.op, EventOp::Begin);
    assert!(!begin.tx_id.is_empty());
    assert_eq!(insert.tx_id, begin.tx_id);
    assert_eq!(commit.op, EventOp::Commit);
    assert_eq!(commit.tx_id, begin.tx_id);
    assert_eq!(outside.tx_id, "");
    assert_eq!(
        [begin.id, insert.id, commit.id, outside.id],
        ["1", "2", "3", "4"].map(String::from)
    );

    harness.cancel.cancel();
    harness.run_task.await.expect("join").expect("run");
}

#[tokio::test]
async fn slow_subscriber_loses_events_but_no_traffic() {
    let upstream = start_scripted_upstream().await;
    let capacity = 8;
    let mut harness = start_proxy(&upstream, capacity).await;

    let mut client = Client::connect(&harness.listen_addr).await;
    // Nobody drains the event channel while 100 queries flow through.
    for i in 0..100 {
        let frames = client.query(&format!("SELECT {i}")).await;
        assert_eq!(frames.len(), 2);
    }

    harness.cancel.cancel();
    harness.run_task.await.expect("join").expect("run");

    // Exactly the channel capacity's worth of events was retained.
    let mut delivered = Vec::new();
    while let Ok(event) = harness.events.try_recv() {
        delivered.push(event);
    }
    assert_eq!(delivered.len(), capacity);
    let ids: Vec<&str> = delivered.iter().map(|e| e.id.as_str()).collect();
    assert_eq!(ids, ["1", "2", "3", "4", "5", "6", "7", "8"]);
}

#[tokio::test]
async fn upstream_dial_failure_drops_client_but_keeps_accepting() {
    // A reserved-then-released port refuses connections.
    let dead_upstream = reserve_listen_addr().await;
    let harness = start_proxy(&dead_upstream, 8).await;

    for _ in 0..2 {
        let mut stream = TcpStream::connect(&harness.listen_addr)
            .await
            .expect("accepted");
        // The relay may already be gone; a failed write is part of the point.
        let _ = stream.write_all(&startup_bytes()).await;
        // The proxy drops the connection instead of crashing.
        let mut buf = [0u8; 1];
        let n = timeout(Duration::from_secs(5), stream.peek(&mut buf))
            .await
            .expect("timeout")
            .unwrap_or(0);
        assert_eq!(n, 0, "expected the client connection to be closed");
    }

    harness.cancel.cancel();
    harness.run_task.await.expect("join").expect("run");
}

#[tokio::test]
async fn shutdown_joins_in_flight_relays() {
    let upstream = start_scripted_upstream().await;
    let harness = start_proxy(&upstream, 8).await;

    let mut client = Client::connect(&harness.listen_addr).await;
    client.query("SELECT 1").await;

    harness.cancel.cancel();
    harness.run_task.await.expect("join").expect("run");

    // The relay was torn down with the proxy; the client sees end-of-stream.
    let eof = timeout(Duration::from_secs(5), client.reader.next_frame())
        .await
        .expect("timeout");
    assert!(matches!(eof, Ok(None) | Err(_)));
}
