mod config;

use std::net::IpAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use anyhow::{Context, Result};
use lanlink::registry::{self, Communication, CommunicationKind, DiscoveryKind, ServiceDiscovery};
use lanlink::{Mode, PubSubError, PubSubOptions, ServiceDescription};
use shared::types::{AddressRanking, ServiceRecord};
use crate::config::{Config, PublisherConfig, Role, SubscriberConfig};

const THERMAL_ZONE: &str = "/sys/class/thermal/thermal_zone0/temp";

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("lanlink=info,lanlink_sample=info"))
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/etc/lanlink/sample.toml".to_string());

    let mut config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;

    tracing::info!("Loaded config from {}", config_path);

    // A publisher bound to one address advertises that address
    if let Some(publisher) = &config.publisher {
        if config.role == Role::Publisher && config.discovery.address.is_none() {
            let bind: IpAddr = publisher
                .bind
                .parse()
                .with_context(|| format!("Invalid bind address: {}", publisher.bind))?;
            if !bind.is_unspecified() {
                config.discovery.address = Some(bind);
            }
        }
    }

    let discovery = registry::discovery(DiscoveryKind::Local, &config.discovery)
        .context("Failed to start service discovery")?;

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("Shutdown signal received"),
            Err(e) => tracing::error!("Failed to listen for ctrl-c: {}", e),
        }
        shutdown.cancel();
    });

    let result = match config.role {
        Role::Subscriber => {
            let subscriber = config
                .subscriber
                .context("role = \"subscriber\" needs a [subscriber] section")?;
            run_subscriber(discovery.as_ref(), &subscriber, &config.pubsub, cancel).await
        }
        Role::Publisher => {
            let publisher = config
                .publisher
                .context("role = \"publisher\" needs a [publisher] section")?;
            run_publisher(discovery.as_ref(), &publisher, &config.pubsub, cancel).await
        }
    };

    if let Err(e) = discovery.shutdown() {
        tracing::error!("Failed to shutdown discovery: {}", e);
    }

    tracing::info!("Shutdown complete");
    result
}

/// Follow the configured service and print every message on the topic.
/// A re-advertisement with new addresses moves the subscription over.
async fn run_subscriber(
    discovery: &dyn ServiceDiscovery,
    config: &SubscriberConfig,
    options: &PubSubOptions,
    cancel: CancellationToken,
) -> Result<()> {
    let (found_tx, found_rx) = flume::unbounded::<(ServiceRecord, AddressRanking)>();
    let session = discovery
        .discover_services(
            config.service.clone(),
            None,
            Box::new(move |record: ServiceRecord, ranked: AddressRanking| {
                let _ = found_tx.send((record, ranked));
            }),
        )
        .with_context(|| format!("Failed to discover {}", config.service))?;

    let failures = session.failures();
    let mut client: Option<Box<dyn Communication>> = None;
    let mut client_errors: Option<flume::Receiver<PubSubError>> = None;

    tracing::info!("Looking for {}", config.service);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            found = found_rx.recv_async() => {
                let Ok((record, ranked)) = found else { break };
                let Some(best) = ranked.best() else { continue };
                tracing::info!(
                    "Found {} at {}:{} ({} addresses)",
                    record.instance_name,
                    best,
                    record.port,
                    ranked.len()
                );

                if let Some(previous) = client.take() {
                    previous.close();
                }

                let next = registry::communication(CommunicationKind::PubSub, best, record.port, Mode::Sub, options);
                next.subscribe(&config.topic, Arc::new(|topic: &str, message: &[u8]| {
                    tracing::info!("{}: {}", topic, String::from_utf8_lossy(message));
                }))?;
                tracing::info!("Waiting for messages on {}", config.topic);
                client_errors = Some(next.errors());
                client = Some(next);
            }

            error = async {
                match &client_errors {
                    Some(errors) => errors.recv_async().await.ok(),
                    None => std::future::pending().await,
                }
            } => {
                if let Some(error) = error {
                    tracing::error!("Subscriber closed: {}", error);
                }
                // Wait for the next advertisement of the service
                client_errors = None;
            }

            failure = failures.recv_async() => {
                if let Ok(failure) = failure {
                    tracing::warn!("Could not use {}: {}", failure.instance, failure.reason);
                }
            }
        }
    }

    session.stop();
    if let Some(client) = client {
        client.close();
    }
    Ok(())
}

/// Advertise the described service and publish the board temperature on
/// the configured topic until cancelled
async fn run_publisher(
    discovery: &dyn ServiceDiscovery,
    config: &PublisherConfig,
    options: &PubSubOptions,
    cancel: CancellationToken,
) -> Result<()> {
    let description = ServiceDescription::load(&config.description)?;
    let bind: IpAddr = config
        .bind
        .parse()
        .with_context(|| format!("Invalid bind address: {}", config.bind))?;

    let client = registry::communication(CommunicationKind::PubSub, bind, description.port, Mode::Pub, options);
    let advertisement = discovery
        .advertise_service(&description)
        .context("Failed to advertise service")?;

    let mut interval = tokio::time::interval(config.publish_interval());
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            _ = interval.tick() => {
                if client.state().is_closed() {
                    tracing::error!("Publisher closed: {:?}", client.state());
                    break;
                }

                match read_temperature() {
                    Ok(reading) => {
                        tracing::debug!("Publishing {} on {}", reading, config.topic);
                        if let Err(e) = client.publish(&config.topic, reading.as_bytes()) {
                            tracing::error!("Failed to publish: {}", e);
                            break;
                        }
                    }
                    Err(e) => tracing::warn!("Failed to read temperature: {:#}", e),
                }
            }
        }
    }

    if let Err(e) = advertisement.withdraw() {
        tracing::error!("Failed to withdraw advertisement: {}", e);
    }
    client.close();
    Ok(())
}

/// Board temperature formatted like "23.5C"
fn read_temperature() -> Result<String> {
    let raw = std::fs::read_to_string(THERMAL_ZONE)
        .with_context(|| format!("Failed to read {}", THERMAL_ZONE))?;
    let millidegrees: i64 = raw
        .trim()
        .parse()
        .with_context(|| format!("Unexpected contents in {}", THERMAL_ZONE))?;
    Ok(format!("{:.1}C", millidegrees as f64 / 1000.0))
}
