//! # pg-tap
//!
//! A transparent observability proxy for PostgreSQL wire traffic. It sits on
//! a TCP port between a database client and a real PostgreSQL server,
//! forwards every byte in both directions, and emits structured query events
//! (what SQL ran, under which transaction, with which bound parameters) as a
//! side effect of parsing the wire protocol.
//!
//! ## Overview
//!
//! `pg-tap` accepts client connections, dials the configured upstream for
//! each one, and relays the session with full protocol fidelity:
//!
//! - **Transparent relay** - authentication, parameter status, and notices
//!   flow unchanged; recognized messages round-trip byte-for-byte
//! - **Simple and extended protocol capture** - `Query` as well as
//!   `Parse`/`Bind`/`Execute` correlation with named prepared statements
//! - **Transaction correlation** - BEGIN/COMMIT/ROLLBACK detection with a
//!   synthetic per-transaction identifier
//! - **Lossy by design** - events ride a bounded channel with non-blocking
//!   sends; a slow consumer drops events, never traffic
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pg_tap::{Config, PgProxy, Result};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     // Load configuration from environment variables
//!     let config = Config::from_env()?;
//!
//!     let mut proxy = PgProxy::new(config.proxy);
//!     let mut events = proxy.events().expect("events already taken");
//!
//!     tokio::spawn(async move {
//!         while let Some(event) = events.recv().await {
//!             println!("{} {:?} {}", event.id, event.op, event.query);
//!         }
//!     });
//!
//!     proxy.run().await
//! }
//! ```
//!
//! ## Configuration
//!
//! Configuration is loaded from environment variables. Required:
//!
//! - `PGTAP_UPSTREAM_ADDR` - `host:port` of the PostgreSQL server
//!
//! See [`Config`] for all available options.
//!
//! ## Event Format
//!
//! Events serialize to JSON for downstream consumers:
//!
//! ```json
//! {
//!   "id": "3",
//!   "op": "EXECUTE",
//!   "query": "SELECT $1::int + $2::int",
//!   "args": ["1", "2"],
//!   "start_time": "2025-06-01T12:00:00Z",
//!   "tx_id": "2b6860ec-6b3c-4e12-9f54-9e6e9f2a3c11"
//! }
//! ```
//!
//! ## Limitations
//!
//! Only plaintext sessions are observable; when the upstream accepts an SSL
//! upgrade the relay ends. Bind parameters are stringified as text whatever
//! their format code, so binary-format values may be unreadable. Transaction
//! detection matches keyword prefixes and misses BEGIN hidden inside
//! multi-statement strings or comments.
//!
//! ## Architecture
//!
//! - [`proxy`] - listener, per-connection relay, and wire codec
//! - [`broker`] - in-process event fan-out to subscribers
//! - [`explain`] - EXPLAIN runner over an independent connection
//! - [`config`] - configuration structures and parsing
//! - [`event`] - the captured event schema
//! - [`error`] - error types and handling

/// In-process event fan-out to subscribers
pub mod broker;

/// Configuration structures and environment variable parsing
pub mod config;

/// Error types and result handling
pub mod error;

/// Captured query event schema
pub mod event;

/// EXPLAIN runner over an independent database connection
pub mod explain;

/// TCP listener, per-connection relay, and PostgreSQL wire codec
pub mod proxy;

pub use broker::Broker;
pub use config::{Config, ExplainConfig, ProxyConfig};
pub use error::{Error, Result};
pub use event::{Event, EventOp};
pub use explain::{ExplainClient, ExplainMode, ExplainOutput};
pub use proxy::PgProxy;
