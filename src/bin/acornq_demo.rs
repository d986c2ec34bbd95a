//! Minimal demo: connects to a local store, starts a server with one queue and
//! a handler that logs and succeeds, enqueues a task, and waits for SIGTERM.

use std::sync::Arc;

use acornq::{Broker, Client, Config, EnqueueOptions, Outcome, QueueWeight, Server, TaskHandler, TaskInfo};
use anyhow::Context;
use async_trait::async_trait;
use tracing::info;
use tracing_subscriber::EnvFilter;

struct LoggingHandler;

#[async_trait]
impl TaskHandler for LoggingHandler {
    async fn handle(&self, task: &TaskInfo) -> Outcome {
        info!(id = %task.id, kind = %task.type_name, "processing task");
        Outcome::Success
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let redis_url = std::env::var("ACORNQ_REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1/".to_string());
    let client = redis::Client::open(redis_url).context("invalid redis url")?;
    let conn = client
        .get_multiplexed_tokio_connection()
        .await
        .context("connecting to store")?;
    let broker = Arc::new(Broker::new(conn));

    let config = Config {
        queues: vec![QueueWeight {
            name: "default".to_string(),
            priority: 1,
        }],
        concurrency: 4,
        ..Config::default()
    };
    let mut server = Server::new(broker.clone(), config).context("invalid server config")?;
    server
        .start(Some(Arc::new(LoggingHandler)))
        .await
        .context("starting server")?;

    let producer = Client::new(broker);
    producer
        .enqueue("demo:greet", "{\"name\":\"world\"}", EnqueueOptions::default())
        .await
        .context("enqueueing demo task")?;

    info!("acornq demo running, waiting for SIGTERM");
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("installing SIGTERM handler")?;
    tokio::select! {
        _ = sigterm.recv() => {}
        _ = tokio::signal::ctrl_c() => {}
    }

    server.shutdown().await;
    Ok(())
}
