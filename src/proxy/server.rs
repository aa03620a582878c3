//! TCP listener and relay task management.

use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ProxyConfig;
use crate::event::Event;
use crate::proxy::conn;
use crate::{Error, Result};

/// A transparent PostgreSQL proxy.
///
/// Accepts client connections on the configured listen address, dials the
/// upstream server for each one, and relays the session byte-for-byte while
/// emitting captured query events on a bounded channel.
///
/// # Example
///
/// ```rust,no_run
/// use pg_tap::{PgProxy, ProxyConfig};
///
/// #[tokio::main]
/// async fn main() -> pg_tap::Result<()> {
///     let mut proxy = PgProxy::new(ProxyConfig::new("127.0.0.1:6432", "127.0.0.1:5432"));
///     let mut events = proxy.events().expect("events not yet taken");
///
///     tokio::spawn(async move {
///         while let Some(event) = events.recv().await {
///             println!("{} {:?} {}", event.id, event.op, event.query);
///         }
///     });
///
///     proxy.run().await
/// }
/// ```
pub struct PgProxy {
    config: ProxyConfig,
    events_tx: mpsc::Sender<Event>,
    events_rx: Option<mpsc::Receiver<Event>>,
    cancel: CancellationToken,
}

impl PgProxy {
    pub fn new(config: ProxyConfig) -> Self {
        let (events_tx, events_rx) = mpsc::channel(config.event_capacity);
        Self {
            config,
            events_tx,
            events_rx: Some(events_rx),
            cancel: CancellationToken::new(),
        }
    }

    /// Takes the receiving end of the event channel. There is a single
    /// consumer; subsequent calls return `None`.
    pub fn events(&mut self) -> Option<mpsc::Receiver<Event>> {
        self.events_rx.take()
    }

    /// Token that cancels the accept loop and every in-flight relay.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Requests a graceful shutdown; `run` joins all relays before returning.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Runs the accept loop until the cancellation token fires or the
    /// listener fails. In-flight relays are joined before returning.
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.config.listen_addr).await?;
        info!(
            listen_addr = %self.config.listen_addr,
            upstream_addr = %self.config.upstream_addr,
            "proxy listening"
        );

        let mut relays = JoinSet::new();
        let result = loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break Ok(()),
                accepted = listener.accept() => match accepted {
                    Ok((client, peer)) => {
                        let upstream_addr = self.config.upstream_addr.clone();
                        let events = self.events_tx.clone();
                        let cancel = self.cancel.clone();
                        relays.spawn(async move {
                            handle_client(client, peer, upstream_addr, events, cancel).await;
                        });
                    }
                    Err(e) => break Err(Error::Io(e)),
                },
                Some(_) = relays.join_next(), if !relays.is_empty() => {}
            }
        };

        drop(listener);
        // Relays stop on the same token; a listener failure also tears them
        // down so the join below terminates.
        self.cancel.cancel();
        while relays.join_next().await.is_some() {}
        result
    }

    /// The address the proxy listens on.
    pub fn listen_addr(&self) -> &str {
        &self.config.listen_addr
    }
}

async fn handle_client(
    client: TcpStream,
    peer: SocketAddr,
    upstream_addr: String,
    events: mpsc::Sender<Event>,
    cancel: CancellationToken,
) {
    debug!(%peer, "client connected");

    let upstream = match TcpStream::connect(&upstream_addr).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(
                %peer,
                upstream_addr = %upstream_addr,
                error = %e,
                "upstream dial failed; dropping client connection"
            );
            return;
        }
    };

    // Relayed traffic is latency sensitive; disable Nagle on both legs.
    let _ = client.set_nodelay(true);
    let _ = upstream.set_nodelay(true);

    match conn::run_relay(client, upstream, events, cancel).await {
        Ok(()) => debug!(%peer, "relay closed"),
        Err(e) => warn!(%peer, error = %e, "relay ended with error"),
    }
}
