//! Modelhost Worker
//!
//! The program behind process isolation. A coordinator spawns it, writes
//! framed requests to its stdin, and reads framed events from its stdout.
//! Logs go to stderr so they never mix with the frames.
//!
//! # Usage
//!
//! ```bash
//! # Normally spawned by a coordinator in process mode
//! MODELHOST_ISOLATION=process my-app
//!
//! # Slow every operation down, with verbose logging
//! RUST_LOG=debug modelhost-worker --latency-ms 200
//! ```
//!
//! # Environment Variables
//!
//! - `MODELHOST_WORKER_LATENCY_MS`: per-operation delay of the echo runtime
//! - `MODELHOST_CONTEXT_ID`: set by the coordinator, tagged on every log line
//! - `RUST_LOG`: Log level (trace, debug, info, warn, error)

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};

use modelhost_core::{isolation::process::CONTEXT_ID_ENV, worker, EchoRuntime};

/// Serve one model over framed stdin/stdout
#[derive(Debug, Parser)]
#[command(name = "modelhost-worker", version, about)]
struct Args {
    /// Delay every operation by this many milliseconds
    #[arg(long, env = "MODELHOST_WORKER_LATENCY_MS", default_value_t = 0)]
    latency_ms: u64,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("modelhost_worker=info".parse()?)
                .add_directive("modelhost_core=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .with_target(true)
        .init();

    let args = Args::parse();
    let context = std::env::var(CONTEXT_ID_ENV).unwrap_or_else(|_| "standalone".to_string());
    info!(context = %context, pid = std::process::id(), "worker starting");

    let runtime = EchoRuntime::new().with_latency(Duration::from_millis(args.latency_ms));
    match worker::serve(tokio::io::stdin(), tokio::io::stdout(), Arc::new(runtime)).await {
        Ok(()) => {
            info!(context = %context, "worker finished");
            Ok(())
        }
        Err(e) => {
            error!(context = %context, error = %e, "worker transport failed");
            Err(e.into())
        }
    }
}
