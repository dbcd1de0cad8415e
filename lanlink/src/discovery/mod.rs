//! Browsing and advertising services over multicast DNS.
//!
//! Re-advertisement policy: a result callback fires for every newly seen
//! instance and again whenever that instance's address set or port
//! changes. Identical repeats are suppressed. An instance that leaves the
//! network and comes back is reported as new.

pub mod advertise;
pub mod backend;
pub mod browser;
pub mod description;
pub mod queries;
pub mod ranking;
pub mod tracker;

use std::net::IpAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use shared::types::{AddressRanking, ServiceFilter, ServiceRecord};
use crate::config::{DiscoveryConfig, DiscoveryOptions};
use self::backend::{BrowseBackend, MdnsBackend};
use self::browser::Query;
use self::queries::QueryHub;

pub use self::advertise::Advertisement;
pub use self::description::ServiceDescription;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("invalid service filter: {0}")]
    InvalidFilter(String),

    /// The multicast transport could not be opened or has been shut down
    #[error("discovery unavailable: {0}")]
    DiscoveryUnavailable(String),

    #[error("invalid service description {source_name}: {reason}")]
    InvalidDescription { source_name: String, reason: String },

    #[error("failed to advertise {name}: {reason}")]
    AdvertiseFailed { name: String, reason: String },
}

/// A resolved advertisement that could not be turned into a record.
/// Reported on the session's failure channel, never fatal to the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolveFailure {
    pub instance: String,
    pub reason: String,
}

/// Check the parts of a filter the type system cannot
pub fn validate_filter(filter: &ServiceFilter) -> Result<(), DiscoveryError> {
    validate_label("service name", &filter.name)?;
    for subtype in &filter.subtypes {
        validate_label("subtype", subtype)?;
    }
    Ok(())
}

fn validate_label(what: &str, label: &str) -> Result<(), DiscoveryError> {
    if label.is_empty() {
        return Err(DiscoveryError::InvalidFilter(format!("{} is empty", what)));
    }

    // Labels are written without their leading underscore
    if label.starts_with('_') || label.starts_with('-') {
        return Err(DiscoveryError::InvalidFilter(format!(
            "{} '{}' must start with a letter or digit",
            what, label
        )));
    }

    if let Some(bad) = label.chars().find(|c| !(c.is_ascii_alphanumeric() || *c == '-')) {
        return Err(DiscoveryError::InvalidFilter(format!(
            "{} '{}' contains invalid character '{}'",
            what, label, bad
        )));
    }

    Ok(())
}

/// Finds services on the local network.
///
/// Each resolver owns its own backend and therefore its own multicast
/// socket; call [`DiscoveryResolver::shutdown`] to release it.
pub struct DiscoveryResolver {
    hub: Arc<QueryHub>,
    defaults: DiscoveryOptions,
    advertise_address: Option<IpAddr>,
}

impl DiscoveryResolver {
    /// Create a resolver backed by an mDNS daemon
    pub fn new(config: &DiscoveryConfig) -> Result<Self, DiscoveryError> {
        let backend = MdnsBackend::new(config)?;
        Ok(Self::with_backend(Arc::new(backend), config.options.clone()).with_advertise_address(config.address))
    }

    pub fn with_backend(backend: Arc<dyn BrowseBackend>, defaults: DiscoveryOptions) -> Self {
        Self {
            hub: Arc::new(QueryHub::new(backend)),
            defaults,
            advertise_address: None,
        }
    }

    /// Address to announce for advertised services. None announces every
    /// address of every enabled interface.
    pub fn with_advertise_address(mut self, address: Option<IpAddr>) -> Self {
        self.advertise_address = address;
        self
    }

    /// Start an open ended browse for services matching `filter`.
    ///
    /// Returns as soon as the queries are issued. `on_result` is invoked on a
    /// background task once per new or materially changed instance, in the
    /// order instances resolve. Sessions on one resolver are independent:
    /// they share the underlying queries and stopping one leaves the others
    /// running. Must be called inside a tokio runtime.
    pub fn discover_services<F>(
        &self,
        filter: ServiceFilter,
        options: Option<DiscoveryOptions>,
        on_result: F,
    ) -> Result<DiscoverySession, DiscoveryError>
    where
        F: FnMut(ServiceRecord, AddressRanking) + Send + 'static,
    {
        validate_filter(&filter)?;
        let options = options.unwrap_or_else(|| self.defaults.clone());

        let mut queries = Vec::new();
        let mut attached = Vec::new();
        for (subtype, query) in filter.browse_queries() {
            match self.hub.attach(&query) {
                Ok((id, events)) => {
                    queries.push(Query { subtype, events });
                    attached.push((query, id));
                }
                Err(e) => {
                    for (started, id) in &attached {
                        let _ = self.hub.detach(started, *id);
                    }
                    return Err(e);
                }
            }
        }

        let (failures_tx, failures) = flume::unbounded();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(browser::run_browser(
            filter,
            options,
            queries,
            Box::new(on_result),
            failures_tx,
            cancel.clone(),
        ));

        Ok(DiscoverySession {
            hub: self.hub.clone(),
            queries: attached,
            cancel,
            task: Some(task),
            failures,
        })
    }

    /// Announce a service instance on the local network
    pub fn advertise_service(&self, description: &ServiceDescription) -> Result<Advertisement, DiscoveryError> {
        let addresses: Vec<IpAddr> = self.advertise_address.into_iter().collect();
        advertise::register_service(self.hub.backend().clone(), description, &addresses)
    }

    /// Release the multicast socket. Running sessions stop receiving events.
    pub fn shutdown(&self) -> Result<(), DiscoveryError> {
        tracing::info!("Shutting down discovery");
        self.hub.backend().shutdown()
    }
}

/// A running browse. Dropping the session stops it.
pub struct DiscoverySession {
    hub: Arc<QueryHub>,
    queries: Vec<(String, u64)>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    failures: flume::Receiver<ResolveFailure>,
}

impl DiscoverySession {
    /// Advertisements that resolved but could not be used
    pub fn failures(&self) -> flume::Receiver<ResolveFailure> {
        self.failures.clone()
    }

    pub fn is_active(&self) -> bool {
        !self.cancel.is_cancelled() && self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Stop browsing and release this session's queries. Idempotent.
    pub fn stop(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();

        for (query, id) in &self.queries {
            if let Err(e) = self.hub.detach(query, *id) {
                tracing::warn!("Failed to stop browsing {}: {}", query, e);
            }
        }
    }

    /// Stop browsing and wait for the session task to finish
    pub async fn join(mut self) {
        self.stop();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::error!("Browse task failed: {}", e);
            }
        }
    }
}

impl Drop for DiscoverySession {
    fn drop(&mut self) {
        self.stop();
    }
}
