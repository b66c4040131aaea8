//! LEGA data-out exporter - consumes export requests from the queue
//!
//! Each delivery names a file or a released dataset; the exporter
//! re-encrypts every resolved file for the job's recipient key and writes
//! it to the caller's outbox. Deliveries are acked exactly once whatever
//! the outcome - failed jobs are logged, never requeued.

use anyhow::{Context, Result};
use clap::Parser;
use futures::StreamExt;
use lapin::options::{BasicAckOptions, BasicConsumeOptions, QueueDeclareOptions};
use lapin::types::FieldTable;
use lapin::{Connection, ConnectionProperties};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use service::{export, Config, ServiceState};

/// LEGA data-out exporter - consumes export requests from the queue
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// AMQP broker URL (overrides BROKER_URL)
    #[arg(long)]
    broker: Option<String>,

    /// Queue to consume export requests from (overrides OUTBOX_QUEUE)
    #[arg(long)]
    queue: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let (non_blocking_writer, _guard) = tracing_appender::non_blocking(std::io::stdout());
    let log_level: tracing::Level = args.log_level.parse().unwrap_or(tracing::Level::INFO);
    let env_filter = EnvFilter::builder()
        .with_default_directive(log_level.into())
        .from_env_lossy();

    let stdout_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_writer(non_blocking_writer)
        .with_filter(env_filter);

    tracing_subscriber::registry().with(stdout_layer).init();

    tracing::info!("Starting LEGA data-out exporter");

    let mut config = Config::from_env()?;
    if let Some(broker) = args.broker {
        config.broker.url = broker;
    }
    if let Some(queue) = args.queue {
        config.broker.queue = queue;
    }

    let state = ServiceState::from_config(&config)
        .await
        .context("failed to create service state")?;
    let outbox = state
        .outbox()
        .context("no outbox configured; set OUTBOX_TYPE to POSIX or S3")?
        .clone();

    let connection = Connection::connect(&config.broker.url, ConnectionProperties::default())
        .await
        .context("failed to connect to the broker")?;
    let channel = connection.create_channel().await?;
    channel
        .queue_declare(
            &config.broker.queue,
            QueueDeclareOptions {
                durable: false,
                exclusive: true,
                auto_delete: true,
                ..QueueDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await?;
    let mut consumer = channel
        .basic_consume(
            &config.broker.queue,
            "lega-exporter",
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await?;

    tracing::info!(queue = %config.broker.queue, "consuming export requests");

    loop {
        tokio::select! {
            delivery = consumer.next() => {
                let Some(delivery) = delivery else {
                    tracing::warn!("consumer stream closed");
                    break;
                };
                let delivery = match delivery {
                    Ok(delivery) => delivery,
                    Err(err) => {
                        tracing::error!(error = %err, "broker delivery error");
                        continue;
                    }
                };

                // at-most-one attempt: ack regardless of the outcome
                if let Err(err) = export::process_message(
                    state.database(),
                    state.archive(),
                    &outbox,
                    state.authorizer(),
                    state.server_key(),
                    &delivery.data,
                )
                .await
                {
                    tracing::error!(error = %err, "export request failed");
                }
                if let Err(err) = delivery.acker.ack(BasicAckOptions::default()).await {
                    tracing::error!(error = %err, "failed to ack delivery");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received shutdown signal");
                break;
            }
        }
    }

    tracing::info!("Exporter shutdown complete");
    Ok(())
}
