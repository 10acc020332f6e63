use std::time::Duration;

use meridian_client::commands::GetClusterTopologyCommand;
use meridian_client::{Conventions, ExecutorEvent, RequestExecutor};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    setup_tracing();

    let url = std::env::var("MERIDIAN_URL").unwrap_or_else(|_| "http://localhost:8080".to_string());
    let database = std::env::var("MERIDIAN_DATABASE").unwrap_or_else(|_| "orders".to_string());

    let executor = RequestExecutor::builder()
        .set_urls(&[url])
        .set_database(&database)
        .set_conventions(Conventions::default().with_request_timeout(Duration::from_secs(5)))
        .build()?;

    let mut events = executor.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ExecutorEvent::TopologyUpdated { etag } => {
                    tracing::info!("topology updated to etag {etag}")
                }
                ExecutorEvent::RequestFailed { url } => tracing::warn!("request failed on {url}"),
                ExecutorEvent::RequestSucceeded { url } => {
                    tracing::debug!("request succeeded on {url}")
                }
            }
        }
    });

    let mut command = GetClusterTopologyCommand::new();
    match executor.execute(&mut command, None).await {
        Ok(()) => println!("{:#?}", command.result()),
        Err(e) => {
            tracing::error!("Error happened: {}", &e);
            return Err(e.into());
        }
    }

    for statistics in executor.node_statistics() {
        println!(
            "{}: {} requests, {} failures",
            statistics.node.url, statistics.requests_sent, statistics.failures
        );
    }

    Ok(())
}

fn setup_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    Registry::default()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
