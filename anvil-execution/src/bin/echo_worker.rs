//! Demonstration worker used by the integration tests
//!
//! Understands a handful of unit kinds: `echo` reports its payload back as
//! output, `fail` fails the unit, `sleep` stalls for the given number of
//! milliseconds, and `exit` terminates the process abruptly to simulate a
//! crash.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use anvil_execution::{run_worker_stdio, ResultPublisher, WorkerEntry, WorkUnit};
use anvil_execution::worker::WorkerEnv;

struct EchoEntry;

#[async_trait]
impl WorkerEntry for EchoEntry {
    async fn execute(&self, unit: WorkUnit, results: &ResultPublisher) -> anyhow::Result<()> {
        match unit.kind.as_str() {
            "echo" => {
                let text = unit.payload.as_str().unwrap_or_default();
                results.output(unit.id, format!("done:{}", text)).await?;
                Ok(())
            }
            "fail" => {
                let message = unit.payload.as_str().unwrap_or("unit failed");
                anyhow::bail!("{}", message)
            }
            "sleep" => {
                let millis = unit.payload.as_u64().unwrap_or(0);
                tokio::time::sleep(std::time::Duration::from_millis(millis)).await;
                Ok(())
            }
            "exit" => {
                let code = unit.payload.as_i64().unwrap_or(1) as i32;
                std::process::exit(code);
            }
            other => anyhow::bail!("unknown unit kind {}", other),
        }
    }
}

#[tokio::main]
async fn main() {
    // stdout carries the channel; diagnostics must go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let env = WorkerEnv::from_env();
    info!("echo worker {} starting", env.worker_id);

    match run_worker_stdio(Arc::new(EchoEntry), env.worker_id).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("worker failed: {}", e);
            std::process::exit(1);
        }
    }
}
