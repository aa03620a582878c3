use std::sync::Arc;

use clap::Parser;
use pg_tap::{Broker, Config, EventOp, ExplainClient, ExplainMode, PgProxy, Result};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Parser, Debug)]
#[command(name = "pg-tap")]
#[command(about = "Transparent observability proxy for PostgreSQL", long_about = None)]
#[command(version)]
struct Args {
    #[arg(short, long, help = "Listen address, overrides PGTAP_LISTEN_ADDR")]
    listen: Option<String>,

    #[arg(short, long, help = "Upstream address, overrides PGTAP_UPSTREAM_ADDR")]
    upstream: Option<String>,

    #[arg(short, long, help = "Enable JSON output for logs")]
    json_logs: bool,

    #[arg(short, long, help = "Verbose logging")]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(args.json_logs, args.verbose);

    info!("Starting pg-tap v{}", env!("CARGO_PKG_VERSION"));

    if let Some(upstream) = &args.upstream {
        std::env::set_var("PGTAP_UPSTREAM_ADDR", upstream);
    }
    if let Some(listen) = &args.listen {
        std::env::set_var("PGTAP_LISTEN_ADDR", listen);
    }

    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            eprintln!("\nRequired environment variables (or flags):");
            eprintln!("  PGTAP_UPSTREAM_ADDR   - host:port of the PostgreSQL server (--upstream)");
            eprintln!("\nOptional:");
            eprintln!("  PGTAP_LISTEN_ADDR     - listen address, default 127.0.0.1:6432 (--listen)");
            eprintln!("  PGTAP_EVENT_CAPACITY  - event channel capacity, default 256");
            eprintln!("  PGTAP_EXPLAIN_DSN     - enables the EXPLAIN runner");
            eprintln!("  PGTAP_EXPLAIN_ANALYZE - true to run EXPLAIN ANALYZE");
            std::process::exit(1);
        }
    };

    info!(
        listen_addr = %config.proxy.listen_addr,
        upstream_addr = %config.proxy.upstream_addr,
        event_capacity = config.proxy.event_capacity,
        explain = config.explain.is_some(),
        "Configuration summary"
    );

    let mut proxy = PgProxy::new(config.proxy.clone());
    let broker = Arc::new(Broker::new(config.proxy.event_capacity));

    if let Some(events) = proxy.events() {
        let broker = broker.clone();
        tokio::spawn(async move { broker.run(events).await });
    }

    // Default observer: stream captured events to stdout as JSON Lines.
    let mut console = broker.subscribe().await;
    tokio::spawn(async move {
        while let Some(event) = console.recv().await {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{line}"),
                Err(e) => warn!(error = %e, "event serialization failed"),
            }
        }
    });

    if let Some(explain_cfg) = &config.explain {
        match ExplainClient::connect(explain_cfg).await {
            Ok(client) => {
                let mode = if explain_cfg.analyze {
                    ExplainMode::Analyze
                } else {
                    ExplainMode::Plan
                };
                let mut events = broker.subscribe().await;
                tokio::spawn(async move {
                    while let Some(event) = events.recv().await {
                        if !matches!(event.op, EventOp::Query | EventOp::Execute)
                            || event.query.is_empty()
                        {
                            continue;
                        }
                        let args = event.args.as_deref().unwrap_or(&[]);
                        match client.run(mode, &event.query, args).await {
                            Ok(output) => info!(
                                query = %event.query,
                                duration_ms = output.duration.as_millis() as u64,
                                plan = %output.plan,
                                "explain"
                            ),
                            Err(e) => warn!(query = %event.query, error = %e, "explain failed"),
                        }
                    }
                });
            }
            Err(e) => warn!(error = %e, "explain client unavailable; continuing without it"),
        }
    }

    let cancel = proxy.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            cancel.cancel();
        }
    });

    match proxy.run().await {
        Ok(()) => {
            info!("Proxy stopped");
            Ok(())
        }
        Err(e) => {
            error!("Proxy failed: {}", e);
            Err(e)
        }
    }
}

fn init_logging(json: bool, verbose: bool) {
    let env_filter = if verbose {
        EnvFilter::new("pg_tap=debug,info")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("pg_tap=info,warn"))
    };

    let fmt_layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .with_span_list(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
