//! EXPLAIN collaborator.
//!
//! Re-executes captured queries over an independent database connection to
//! extract their plans. The runner only shares the [`Event`](crate::Event)
//! schema with the relay; it never touches a relayed session.

use std::time::{Duration, Instant};

use tokio_postgres::types::ToSql;
use tokio_postgres::{Config, NoTls};
use tracing::{debug, error, info};

use crate::config::ExplainConfig;
use crate::Result;

/// Selects between `EXPLAIN` (plan only) and `EXPLAIN ANALYZE` (plan plus
/// actual execution). `Analyze` really runs the query; point it at a
/// database where that is acceptable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExplainMode {
    Plan,
    Analyze,
}

impl ExplainMode {
    fn prefix(self) -> &'static str {
        match self {
            ExplainMode::Plan => "EXPLAIN ",
            ExplainMode::Analyze => "EXPLAIN ANALYZE ",
        }
    }
}

impl std::fmt::Display for ExplainMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExplainMode::Plan => f.write_str("EXPLAIN"),
            ExplainMode::Analyze => f.write_str("EXPLAIN ANALYZE"),
        }
    }
}

/// The output of one EXPLAIN run.
#[derive(Debug, Clone)]
pub struct ExplainOutput {
    /// Plan rows joined with newlines, as the server printed them.
    pub plan: String,
    /// Wall-clock time of the EXPLAIN round trip.
    pub duration: Duration,
}

/// A database client dedicated to running EXPLAIN statements.
pub struct ExplainClient {
    client: tokio_postgres::Client,
    connection_task: tokio::task::JoinHandle<()>,
}

impl ExplainClient {
    /// Connects using the configured DSN. The connection is driven by a
    /// background task for the lifetime of the client.
    pub async fn connect(config: &ExplainConfig) -> Result<Self> {
        let pg_config = config.dsn.parse::<Config>()?;
        let (client, connection) = pg_config.connect(NoTls).await?;

        let connection_task = tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("explain connection error: {}", e);
            }
        });

        info!("explain client connected");
        Ok(Self {
            client,
            connection_task,
        })
    }

    /// Runs EXPLAIN or EXPLAIN ANALYZE for a captured query with its
    /// captured textual arguments.
    pub async fn run(
        &self,
        mode: ExplainMode,
        query: &str,
        args: &[String],
    ) -> Result<ExplainOutput> {
        let statement = format!("{}{}", mode.prefix(), query);
        let params: Vec<&(dyn ToSql + Sync)> =
            args.iter().map(|a| a as &(dyn ToSql + Sync)).collect();

        let start = Instant::now();
        let rows = self.client.query(statement.as_str(), &params).await?;

        let mut lines = Vec::with_capacity(rows.len());
        for row in &rows {
            lines.push(row.try_get::<_, String>(0)?);
        }

        let output = ExplainOutput {
            plan: lines.join("\n"),
            duration: start.elapsed(),
        };
        debug!(mode = %mode, duration_ms = output.duration.as_millis() as u64, "explain completed");
        Ok(output)
    }

    /// Drops the client and stops the connection task.
    pub async fn close(self) {
        drop(self.client);
        self.connection_task.abort();
    }
}
