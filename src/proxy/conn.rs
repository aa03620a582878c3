//! Per-connection relay: startup pass-through, bidirectional message pumps,
//! and capture of query events.
//!
//! The relay never rewrites traffic. Every message is decoded, optionally
//! inspected by the capture hooks, then re-encoded and forwarded; the codec's
//! exact round-trip guarantee keeps the byte stream identical to a direct
//! connection.

use std::collections::HashMap;

use bytes::BytesMut;
use chrono::{DateTime, Utc};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::event::{Event, EventOp};
use crate::proxy::protocol::{BackendMessage, FrameReader, FrontendMessage};
use crate::{Error, Result};

/// How the startup phase ended.
enum StartupOutcome {
    /// The upstream reached ReadyForQuery; the session enters the query phase.
    Ready,
    /// The client sent a CancelRequest; the connection carries no queries.
    CancelRequest,
}

/// Relays one client/upstream socket pair until either side closes.
///
/// Runs the startup pass-through first, then two concurrent pumps. When one
/// pump returns the other is torn down, which closes both sockets, and the
/// first error (if any) is reported.
pub(crate) async fn run_relay<C, U>(
    client: C,
    upstream: U,
    events: mpsc::Sender<Event>,
    cancel: CancellationToken,
) -> Result<()>
where
    C: AsyncRead + AsyncWrite + Send + 'static,
    U: AsyncRead + AsyncWrite + Send + 'static,
{
    let (client_read, mut client_write) = tokio::io::split(client);
    let (upstream_read, mut upstream_write) = tokio::io::split(upstream);
    let mut client_read = FrameReader::new(client_read);
    let mut upstream_read = FrameReader::new(upstream_read);

    let startup = tokio::select! {
        _ = cancel.cancelled() => return Ok(()),
        outcome = relay_startup(
            &mut client_read,
            &mut client_write,
            &mut upstream_read,
            &mut upstream_write,
        ) => outcome?,
    };
    if let StartupOutcome::CancelRequest = startup {
        return Ok(());
    }

    let mut client_to_upstream = tokio::spawn(pump_client_to_upstream(
        client_read,
        upstream_write,
        events,
        cancel.clone(),
    ));
    let mut upstream_to_client =
        tokio::spawn(pump_upstream_to_client(upstream_read, client_write, cancel));

    // Whichever pump finishes first aborts the peer; aborting drops the
    // peer's socket halves, which unblocks any pending read or write.
    let (first, second) = tokio::select! {
        res = &mut client_to_upstream => {
            upstream_to_client.abort();
            (res, upstream_to_client.await)
        }
        res = &mut upstream_to_client => {
            client_to_upstream.abort();
            (res, client_to_upstream.await)
        }
    };

    join_pump(first).and(join_pump(second))
}

fn join_pump(res: std::result::Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
    match res {
        Ok(outcome) => outcome,
        Err(e) if e.is_cancelled() => Ok(()),
        Err(e) => Err(Error::Protocol(format!("relay pump failed: {e}"))),
    }
}

/// Copies the startup and authentication exchange verbatim in both
/// directions until the upstream reports ReadyForQuery.
///
/// SSLRequest / GSSENCRequest and the upstream's single-byte answer pass
/// through unchanged; an accepted TLS upgrade ends the relay because an
/// encrypted session cannot be observed.
async fn relay_startup<CR, CW, UR, UW>(
    client_read: &mut FrameReader<CR>,
    client_write: &mut CW,
    upstream_read: &mut FrameReader<UR>,
    upstream_write: &mut UW,
) -> Result<StartupOutcome>
where
    CR: AsyncRead + Unpin,
    CW: AsyncWrite + Unpin,
    UR: AsyncRead + Unpin,
    UW: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(1024);

    loop {
        let startup = client_read
            .next_startup()
            .await?
            .ok_or_else(|| Error::Startup("client closed before startup".to_string()))?;
        buf.clear();
        startup.encode(&mut buf);
        upstream_write.write_all(&buf).await?;
        upstream_write.flush().await?;

        if startup.is_negotiation_request() {
            let answer = upstream_read.next_byte().await?;
            client_write.write_all(&[answer]).await?;
            client_write.flush().await?;
            if answer == b'S' {
                return Err(Error::Startup(
                    "upstream accepted TLS; encrypted sessions cannot be observed".to_string(),
                ));
            }
            // Rejected; the client re-sends a plain startup message.
            continue;
        }
        if startup.is_cancel_request() {
            return Ok(StartupOutcome::CancelRequest);
        }
        if let Some(user) = startup.parameter("user") {
            debug!(user, "session startup");
        }
        break;
    }

    // Authentication may require client responses (password, SASL), so the
    // exchange is pumped in both directions until ReadyForQuery.
    loop {
        tokio::select! {
            backend = upstream_read.next_frame() => {
                let frame = backend?.ok_or_else(|| {
                    Error::Startup("upstream closed during startup".to_string())
                })?;
                let msg = BackendMessage::decode(frame)?;
                buf.clear();
                msg.encode(&mut buf);
                client_write.write_all(&buf).await?;
                client_write.flush().await?;
                match &msg {
                    BackendMessage::ReadyForQuery { .. } => return Ok(StartupOutcome::Ready),
                    BackendMessage::ErrorResponse { .. } => {
                        // The client has already been shown the real error.
                        return Err(Error::Startup(format!(
                            "upstream rejected session: {}",
                            msg.error_message().unwrap_or("unknown error")
                        )));
                    }
                    _ => {}
                }
            }
            frontend = client_read.next_frame() => {
                let frame = frontend?.ok_or_else(|| {
                    Error::Startup("client closed during startup".to_string())
                })?;
                let msg = FrontendMessage::decode(frame)?;
                buf.clear();
                msg.encode(&mut buf);
                upstream_write.write_all(&buf).await?;
                upstream_write.flush().await?;
            }
        }
    }
}

/// Client-to-upstream pump. Owns the session capture state: it is the only
/// writer, so no lock is needed.
async fn pump_client_to_upstream<R, W>(
    mut reader: FrameReader<R>,
    mut writer: W,
    events: mpsc::Sender<Event>,
    cancel: CancellationToken,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut state = SessionState::default();
    let mut buf = BytesMut::with_capacity(8 * 1024);
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            frame = reader.next_frame() => frame,
        };
        let Some(frame) = frame? else {
            return Ok(());
        };
        let msg = FrontendMessage::decode(frame)?;
        capture_frontend(&msg, &mut state, &events);
        buf.clear();
        msg.encode(&mut buf);
        if let Err(e) = write_forward(&mut writer, &buf).await {
            return disconnect_ok(e);
        }
    }
}

/// Upstream-to-client pump. Reads nothing into session state: events are
/// emitted at request time, so completion and error payloads are only
/// surfaced as diagnostics.
async fn pump_upstream_to_client<R, W>(
    mut reader: FrameReader<R>,
    mut writer: W,
    cancel: CancellationToken,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(8 * 1024);
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            frame = reader.next_frame() => frame,
        };
        let Some(frame) = frame? else {
            return Ok(());
        };
        let msg = BackendMessage::decode(frame)?;
        capture_backend(&msg);
        buf.clear();
        msg.encode(&mut buf);
        if let Err(e) = write_forward(&mut writer, &buf).await {
            return disconnect_ok(e);
        }
    }
}

async fn write_forward<W: AsyncWrite + Unpin>(
    writer: &mut W,
    buf: &[u8],
) -> std::result::Result<(), std::io::Error> {
    writer.write_all(buf).await?;
    writer.flush().await
}

/// A write failing because the peer pump already closed the socket is a
/// clean shutdown, not a relay error.
fn disconnect_ok(e: std::io::Error) -> Result<()> {
    use std::io::ErrorKind;
    match e.kind() {
        ErrorKind::BrokenPipe
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::NotConnected => Ok(()),
        _ => Err(e.into()),
    }
}

fn capture_frontend(msg: &FrontendMessage, state: &mut SessionState, events: &mpsc::Sender<Event>) {
    match msg {
        FrontendMessage::Query { sql } => emit(events, state.on_query(sql)),
        FrontendMessage::Parse { name, query, .. } => state.on_parse(name, query),
        FrontendMessage::Bind {
            statement, params, ..
        } => state.on_bind(statement, params),
        FrontendMessage::Execute { .. } => emit(events, state.on_execute()),
        FrontendMessage::Other { .. } => {}
    }
}

fn capture_backend(msg: &BackendMessage) {
    match msg {
        BackendMessage::CommandComplete { tag } => {
            // The event was already emitted when the request was observed.
            trace!(tag = %tag, rows = rows_affected(tag), "command complete");
        }
        BackendMessage::ErrorResponse { .. } => {
            if let Some(message) = msg.error_message() {
                trace!(error = %message, "upstream error response");
            }
        }
        _ => {}
    }
}

/// Non-blocking event delivery: a full channel drops the event rather than
/// stalling the relay.
fn emit(events: &mpsc::Sender<Event>, event: Event) {
    match events.try_send(event) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) => trace!("event channel full; dropping event"),
        Err(TrySendError::Closed(_)) => {}
    }
}

/// Mutable capture state for one relayed connection.
#[derive(Debug, Default)]
pub(crate) struct SessionState {
    /// Named prepared statements seen on Parse. Entries are never evicted.
    prepared_stmts: HashMap<String, String>,
    /// Query text of the most recent Parse, named or unnamed.
    last_parse: String,
    /// Statement name referenced by the most recent Bind.
    last_bind_stmt: String,
    /// Stringified parameter values from the most recent Bind.
    last_bind_args: Vec<String>,
    /// When the most recent Execute was observed.
    execute_start: Option<DateTime<Utc>>,
    /// Synthetic transaction identifier, empty outside a transaction.
    active_tx_id: String,
    /// Event id counter; the first event of a connection gets "1".
    next_id: u64,
}

impl SessionState {
    /// When the most recent Execute was observed, if any.
    #[allow(dead_code)]
    pub(crate) fn execute_started_at(&self) -> Option<DateTime<Utc>> {
        self.execute_start
    }

    fn next_event_id(&mut self) -> String {
        self.next_id += 1;
        self.next_id.to_string()
    }

    pub(crate) fn on_query(&mut self, sql: &str) -> Event {
        let (op, query, tx_id) = self.stamp_transaction(sql, EventOp::Query);
        Event {
            id: self.next_event_id(),
            op,
            query,
            args: None,
            start_time: Utc::now(),
            tx_id,
        }
    }

    pub(crate) fn on_parse(&mut self, name: &str, query: &str) {
        self.last_parse = query.to_string();
        if !name.is_empty() {
            self.prepared_stmts
                .insert(name.to_string(), query.to_string());
        }
    }

    pub(crate) fn on_bind(&mut self, statement: &str, params: &[Option<Vec<u8>>]) {
        self.last_bind_stmt = statement.to_string();
        // Parameter bytes are interpreted as text regardless of the format
        // code; binary-format values may stringify as garbage.
        self.last_bind_args = params
            .iter()
            .map(|p| {
                p.as_deref()
                    .map(|b| String::from_utf8_lossy(b).into_owned())
                    .unwrap_or_default()
            })
            .collect();
    }

    pub(crate) fn on_execute(&mut self) -> Event {
        let mut resolved = self.last_parse.clone();
        if !self.last_bind_stmt.is_empty() {
            if let Some(stored) = self.prepared_stmts.get(&self.last_bind_stmt) {
                resolved = stored.clone();
            }
        }

        let now = Utc::now();
        self.execute_start = Some(now);
        let (op, query, tx_id) = self.stamp_transaction(&resolved, EventOp::Execute);
        let args = if op == EventOp::Execute {
            Some(self.last_bind_args.clone())
        } else {
            None
        };
        Event {
            id: self.next_event_id(),
            op,
            query,
            args,
            start_time: now,
            tx_id,
        }
    }

    /// Applies transaction detection to the text about to produce an event.
    ///
    /// BEGIN mints a fresh identifier; COMMIT / ROLLBACK hand out the
    /// expiring identifier before clearing it, so the terminating event still
    /// correlates with its transaction. Returns `(op, event query text,
    /// event tx id)`; boundary events carry an empty query text because the
    /// triggering SQL is just the keyword.
    fn stamp_transaction(&mut self, sql: &str, default_op: EventOp) -> (EventOp, String, String) {
        match classify_transaction(sql) {
            Some(TxBoundary::Begin) => {
                // A nested BEGIN replaces the identifier; the server rejects
                // it anyway and the next COMMIT clears it.
                self.active_tx_id = Uuid::new_v4().to_string();
                (EventOp::Begin, String::new(), self.active_tx_id.clone())
            }
            Some(TxBoundary::Commit) => (
                EventOp::Commit,
                String::new(),
                std::mem::take(&mut self.active_tx_id),
            ),
            Some(TxBoundary::Rollback) => (
                EventOp::Rollback,
                String::new(),
                std::mem::take(&mut self.active_tx_id),
            ),
            None => (default_op, sql.to_string(), self.active_tx_id.clone()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TxBoundary {
    Begin,
    Commit,
    Rollback,
}

/// Detects transaction-control keywords by prefix over an uppercased leading
/// window. `BEGIN TRANSACTION`, `COMMIT WORK`, and `ROLLBACK TO SAVEPOINT`
/// all count; `SAVEPOINT` and `RELEASE SAVEPOINT` leave state untouched.
/// BEGIN inside multi-statement strings or behind comments is not seen.
pub(crate) fn classify_transaction(sql: &str) -> Option<TxBoundary> {
    let head: String = sql
        .trim_start()
        .chars()
        .take(9)
        .collect::<String>()
        .to_ascii_uppercase();
    if starts_with_keyword(&head, "BEGIN") {
        Some(TxBoundary::Begin)
    } else if starts_with_keyword(&head, "COMMIT") {
        Some(TxBoundary::Commit)
    } else if starts_with_keyword(&head, "ROLLBACK") {
        Some(TxBoundary::Rollback)
    } else {
        None
    }
}

fn starts_with_keyword(head: &str, keyword: &str) -> bool {
    head.starts_with(keyword)
        && head[keyword.len()..]
            .chars()
            .next()
            .map_or(true, |c| !c.is_ascii_alphanumeric() && c != '_')
}

/// Extracts the trailing row count from a CommandComplete tag, e.g.
/// `INSERT 0 5` -> 5, `SELECT 3` -> 3, `CREATE TABLE` -> 0.
pub(crate) fn rows_affected(tag: &str) -> i64 {
    tag.rsplit(' ')
        .next()
        .and_then(|n| n.parse().ok())
        .unwrap_or(0)
}
