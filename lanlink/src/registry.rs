//! Enum keyed lookup of the discovery and communication implementations.
//!
//! Callers pick a component by kind and hold it as a trait object, so a new
//! implementation only adds a variant here.

use std::net::IpAddr;
use shared::types::ServiceFilter;
use crate::config::{DiscoveryConfig, DiscoveryOptions, PubSubOptions};
use crate::discovery::browser::ResultCallback;
use crate::discovery::{Advertisement, DiscoveryError, DiscoveryResolver, DiscoverySession, ServiceDescription};
use crate::pubsub::{ConnectionState, Handler, Mode, PubSubClient, PubSubError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiscoveryKind {
    /// mDNS / DNS-SD on the local link
    Local,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommunicationKind {
    /// Topic based publish/subscribe over TCP
    PubSub,
}

pub trait ServiceDiscovery: Send + Sync {
    fn discover_services(
        &self,
        filter: ServiceFilter,
        options: Option<DiscoveryOptions>,
        on_result: ResultCallback,
    ) -> Result<DiscoverySession, DiscoveryError>;

    fn advertise_service(&self, description: &ServiceDescription) -> Result<Advertisement, DiscoveryError>;

    fn shutdown(&self) -> Result<(), DiscoveryError>;
}

pub trait Communication: Send + Sync {
    fn subscribe(&self, topic: &str, handler: Handler) -> Result<(), PubSubError>;

    fn unsubscribe(&self, topic: &str) -> Result<(), PubSubError>;

    fn publish(&self, topic: &str, message: &[u8]) -> Result<(), PubSubError>;

    fn state(&self) -> ConnectionState;

    /// Transport failures, reported once each
    fn errors(&self) -> flume::Receiver<PubSubError>;

    fn close(&self);
}

impl ServiceDiscovery for DiscoveryResolver {
    fn discover_services(
        &self,
        filter: ServiceFilter,
        options: Option<DiscoveryOptions>,
        on_result: ResultCallback,
    ) -> Result<DiscoverySession, DiscoveryError> {
        DiscoveryResolver::discover_services(self, filter, options, on_result)
    }

    fn advertise_service(&self, description: &ServiceDescription) -> Result<Advertisement, DiscoveryError> {
        DiscoveryResolver::advertise_service(self, description)
    }

    fn shutdown(&self) -> Result<(), DiscoveryError> {
        DiscoveryResolver::shutdown(self)
    }
}

impl Communication for PubSubClient {
    fn subscribe(&self, topic: &str, handler: Handler) -> Result<(), PubSubError> {
        self.subscribe_handler(topic, handler)
    }

    fn unsubscribe(&self, topic: &str) -> Result<(), PubSubError> {
        PubSubClient::unsubscribe(self, topic)
    }

    fn publish(&self, topic: &str, message: &[u8]) -> Result<(), PubSubError> {
        PubSubClient::publish(self, topic, message)
    }

    fn state(&self) -> ConnectionState {
        PubSubClient::state(self)
    }

    fn errors(&self) -> flume::Receiver<PubSubError> {
        PubSubClient::errors(self)
    }

    fn close(&self) {
        PubSubClient::close(self)
    }
}

/// Create the discovery component of the given kind
pub fn discovery(kind: DiscoveryKind, config: &DiscoveryConfig) -> Result<Box<dyn ServiceDiscovery>, DiscoveryError> {
    match kind {
        DiscoveryKind::Local => Ok(Box::new(DiscoveryResolver::new(config)?)),
    }
}

/// Create the communication component of the given kind. Must be called
/// inside a tokio runtime.
pub fn communication(
    kind: CommunicationKind,
    address: IpAddr,
    port: u16,
    mode: Mode,
    options: &PubSubOptions,
) -> Box<dyn Communication> {
    match kind {
        CommunicationKind::PubSub => Box::new(PubSubClient::with_options(address, port, mode, options.clone())),
    }
}
