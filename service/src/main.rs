//! `stayflow` binary: the saga services, the activity command writer and the metrics
//! projection in one process, over Postgres and Redpanda.

use anyhow::Context;
use metrics_exporter_prometheus::PrometheusBuilder;
use stayflow_postgres::{PostgresEventStore, PostgresSubscription, SubscriptionConfig};
use stayflow_redpanda::RedpandaChannel;
use stayflow_runtime::retry::{RetryPolicy, retry_with_backoff};
use stayflow_service::{ServiceConfig, Stayflow};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);
const STARTUP_CONNECT_RETRIES: usize = 5;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ServiceConfig::from_env().context("invalid configuration")?;
    tracing::info!(
        kafka_brokers = %config.kafka_brokers,
        command_subject = %config.command_subject,
        reply_subject = %config.reply_subject,
        "Configuration loaded"
    );

    if let Some(addr) = config.metrics_addr {
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("failed to install Prometheus exporter")?;
        stayflow_service::metrics::describe_metrics();
        tracing::info!(%addr, "Prometheus metrics exported");
    }

    // The database may still be starting next to us
    let connect = RetryPolicy::builder()
        .max_retries(STARTUP_CONNECT_RETRIES)
        .initial_delay(config.reconnect_initial_delay)
        .max_delay(config.reconnect_max_delay)
        .build();
    let event_store = retry_with_backoff(connect, || PostgresEventStore::new(&config.database_url))
        .await
        .context("failed to connect to the event store")?;
    event_store
        .migrate()
        .await
        .context("failed to migrate the event store")?;
    let subscription = PostgresSubscription::with_config(
        event_store.pool().clone(),
        SubscriptionConfig {
            poll_interval: config.subscription_poll_interval,
            ..SubscriptionConfig::default()
        },
    );

    let channel = RedpandaChannel::new(&config.kafka_brokers)
        .context("failed to create the Redpanda channel")?;

    let stayflow = Stayflow::start(
        &config,
        Arc::new(channel),
        Arc::new(event_store),
        Arc::new(subscription),
    )
    .await
    .context("failed to start services")?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    stayflow.shutdown(SHUTDOWN_TIMEOUT).await;
    Ok(())
}
