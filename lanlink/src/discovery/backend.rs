use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use futures::{Stream, StreamExt};
use mdns_sd::{IfKind, ServiceDaemon, ServiceEvent, ServiceInfo};
use shared::protocol::SUBTYPE_LABEL;
use super::DiscoveryError;
use crate::config::DiscoveryConfig;

/// An advertisement after the backend resolved its host, addresses and port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedService {
    /// Full instance name, e.g. "sensor-1._zmq._tcp.local."
    pub fullname: String,
    /// Parent service type, e.g. "_zmq._tcp.local."
    pub service_type: String,
    /// Bare subtype label the advertisement carries, e.g. "cpuTemp"
    pub subtype: Option<String>,
    pub hostname: String,
    pub addresses: Vec<IpAddr>,
    pub port: u16,
    pub txt: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrowseEvent {
    Resolved(ResolvedService),
    /// Full instance name of a service that left the network
    Removed(String),
}

pub type BrowseStream = Pin<Box<dyn Stream<Item = BrowseEvent> + Send>>;

/// Everything needed to announce one service instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRegistration {
    pub instance_name: String,
    /// Parent service type, e.g. "_zmq._tcp.local."
    pub service_type: String,
    /// Bare subtype label, e.g. "cpuTemp"
    pub subtype: Option<String>,
    /// Host name ending in ".local."
    pub hostname: String,
    /// Empty means every address of every enabled interface
    pub addresses: Vec<IpAddr>,
    pub port: u16,
    pub txt: HashMap<String, String>,
}

impl ServiceRegistration {
    pub fn fullname(&self) -> String {
        format!("{}.{}", self.instance_name, self.service_type)
    }

    fn registered_type(&self) -> String {
        match &self.subtype {
            Some(sub) => subtype_query(sub, &self.service_type),
            None => self.service_type.clone(),
        }
    }
}

fn subtype_query(subtype: &str, service_type: &str) -> String {
    format!("_{}.{}.{}", subtype, SUBTYPE_LABEL, service_type)
}

/// The multicast side of discovery. One backend owns one socket set and is
/// exclusive to the resolver that created it.
pub trait BrowseBackend: Send + Sync {
    /// Start a continuous query for a service type or subtype query. A
    /// backend holds at most one browse per query name; starting it again
    /// may replace the earlier stream.
    fn browse(&self, query: &str) -> Result<BrowseStream, DiscoveryError>;

    /// Stop this backend's browse of `query`
    fn stop_browse(&self, query: &str) -> Result<(), DiscoveryError>;

    fn register(&self, registration: &ServiceRegistration) -> Result<(), DiscoveryError>;

    fn unregister(&self, fullname: &str) -> Result<(), DiscoveryError>;

    /// Release the sockets; every later call fails
    fn shutdown(&self) -> Result<(), DiscoveryError>;
}

fn unavailable(context: &'static str) -> impl FnOnce(mdns_sd::Error) -> DiscoveryError {
    move |e| DiscoveryError::DiscoveryUnavailable(format!("{}: {}", context, e))
}

/// Backend speaking multicast DNS through an `mdns-sd` daemon
pub struct MdnsBackend {
    daemon: ServiceDaemon,
}

impl MdnsBackend {
    pub fn new(config: &DiscoveryConfig) -> Result<Self, DiscoveryError> {
        let daemon = ServiceDaemon::new().map_err(unavailable("Failed to create mDNS daemon"))?;

        if let Some(interface) = &config.interface {
            daemon
                .disable_interface(IfKind::All)
                .map_err(unavailable("Failed to disable default interfaces"))?;
            daemon
                .enable_interface(interface.as_str())
                .map_err(unavailable("Failed to enable interface"))?;
            tracing::info!("mDNS restricted to interface {}", interface);
        }

        Ok(Self { daemon })
    }
}

impl BrowseBackend for MdnsBackend {
    fn browse(&self, query: &str) -> Result<BrowseStream, DiscoveryError> {
        let receiver = self
            .daemon
            .browse(query)
            .map_err(unavailable("Failed to start browse"))?;

        let events = receiver
            .into_stream()
            .filter_map(|event| futures::future::ready(convert_event(event)));

        Ok(Box::pin(events))
    }

    fn stop_browse(&self, query: &str) -> Result<(), DiscoveryError> {
        self.daemon
            .stop_browse(query)
            .map_err(unavailable("Failed to stop browse"))
    }

    fn register(&self, registration: &ServiceRegistration) -> Result<(), DiscoveryError> {
        let failed = |e: mdns_sd::Error| DiscoveryError::AdvertiseFailed {
            name: registration.instance_name.clone(),
            reason: e.to_string(),
        };

        let addresses = registration
            .addresses
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");

        let mut info = ServiceInfo::new(
            &registration.registered_type(),
            &registration.instance_name,
            &registration.hostname,
            addresses.as_str(),
            registration.port,
            registration.txt.clone(),
        )
        .map_err(failed)?;

        if registration.addresses.is_empty() {
            info = info.enable_addr_auto();
        }

        self.daemon.register(info).map_err(failed)
    }

    fn unregister(&self, fullname: &str) -> Result<(), DiscoveryError> {
        self.daemon
            .unregister(fullname)
            .map(|_| ())
            .map_err(unavailable("Failed to unregister service"))
    }

    fn shutdown(&self) -> Result<(), DiscoveryError> {
        self.daemon
            .shutdown()
            .map(|_| ())
            .map_err(unavailable("Failed to shut down mDNS daemon"))
    }
}

fn convert_event(event: ServiceEvent) -> Option<BrowseEvent> {
    match event {
        ServiceEvent::ServiceResolved(info) => Some(BrowseEvent::Resolved(convert_service_info(&info))),
        ServiceEvent::ServiceRemoved(_typ, fullname) => Some(BrowseEvent::Removed(fullname)),
        _ => None,
    }
}

/// Convert an mdns-sd ServiceInfo to our ResolvedService
fn convert_service_info(info: &ServiceInfo) -> ResolvedService {
    // A single answer carries an unordered set; sort so repeated answers
    // produce the same address order
    let mut addresses: Vec<IpAddr> = info.get_addresses().iter().copied().collect();
    addresses.sort();

    let txt: HashMap<String, String> = info
        .get_properties()
        .iter()
        .map(|prop| (prop.key().to_string(), prop.val_str().to_string()))
        .collect();

    ResolvedService {
        fullname: info.get_fullname().to_string(),
        service_type: info.get_type().to_string(),
        subtype: info.get_subtype().as_deref().and_then(subtype_label),
        hostname: info.get_hostname().to_string(),
        addresses,
        port: info.get_port(),
        txt,
    }
}

/// "_cpuTemp._sub._zmq._tcp.local." -> "cpuTemp"
fn subtype_label(sub_domain: &str) -> Option<String> {
    let marker = format!(".{}.", SUBTYPE_LABEL);
    let (label, _) = sub_domain.split_once(marker.as_str())?;
    Some(label.trim_start_matches('_').to_string())
}

/// In-process stand-in for the local network.
///
/// Registrations are delivered to every matching browse, including browses
/// started later, the way a multicast responder answers new queries. Clones
/// are the same host; [`MemoryBackend::peer`] adds another host on the
/// same network with its own browses.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    host: u64,
    network: Arc<Mutex<MemoryNetwork>>,
}

#[derive(Default)]
struct MemoryNetwork {
    browsers: HashMap<String, Vec<(u64, flume::Sender<BrowseEvent>)>>,
    services: BTreeMap<String, ServiceRegistration>,
    unavailable: bool,
    hosts: u64,
    shut_down: HashSet<u64>,
}

impl MemoryNetwork {
    fn reachable(&self, host: u64) -> bool {
        !self.unavailable && !self.shut_down.contains(&host)
    }

    fn deliver(&mut self, queries: &[String], event: &BrowseEvent) {
        for query in queries {
            if let Some(senders) = self.browsers.get_mut(query) {
                senders.retain(|(_, tx)| tx.send(event.clone()).is_ok());
            }
        }
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Another host on the same network. Its browses are independent of
    /// this one's; registrations are seen by both.
    pub fn peer(&self) -> Self {
        let mut network = self.network();
        network.hosts += 1;
        Self {
            host: network.hosts,
            network: self.network.clone(),
        }
    }

    /// Make every later browse fail as if no multicast socket could be opened
    pub fn set_unavailable(&self, unavailable: bool) {
        self.network().unavailable = unavailable;
    }

    /// Browses currently open across every host on the network
    pub fn active_browses(&self) -> usize {
        self.network().browsers.values().map(Vec::len).sum()
    }

    fn network(&self) -> MutexGuard<'_, MemoryNetwork> {
        self.network.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn queries_for(registration: &ServiceRegistration) -> Vec<String> {
    let mut queries = vec![registration.service_type.clone()];
    if let Some(sub) = &registration.subtype {
        queries.push(subtype_query(sub, &registration.service_type));
    }
    queries
}

fn resolve(registration: &ServiceRegistration) -> ResolvedService {
    ResolvedService {
        fullname: registration.fullname(),
        service_type: registration.service_type.clone(),
        subtype: registration.subtype.clone(),
        hostname: registration.hostname.clone(),
        addresses: registration.addresses.clone(),
        port: registration.port,
        txt: registration.txt.clone(),
    }
}

impl BrowseBackend for MemoryBackend {
    fn browse(&self, query: &str) -> Result<BrowseStream, DiscoveryError> {
        let mut network = self.network();
        if !network.reachable(self.host) {
            return Err(DiscoveryError::DiscoveryUnavailable(
                "no multicast interface available".to_string(),
            ));
        }

        let (tx, rx) = flume::unbounded();
        for registration in network.services.values() {
            if queries_for(registration).iter().any(|q| q == query) {
                let _ = tx.send(BrowseEvent::Resolved(resolve(registration)));
            }
        }
        network.browsers.entry(query.to_string()).or_default().push((self.host, tx));

        Ok(Box::pin(rx.into_stream()))
    }

    fn stop_browse(&self, query: &str) -> Result<(), DiscoveryError> {
        let mut network = self.network();
        if let Some(senders) = network.browsers.get_mut(query) {
            senders.retain(|(host, _)| *host != self.host);
            if senders.is_empty() {
                network.browsers.remove(query);
            }
        }
        Ok(())
    }

    fn register(&self, registration: &ServiceRegistration) -> Result<(), DiscoveryError> {
        let mut network = self.network();
        if !network.reachable(self.host) {
            return Err(DiscoveryError::AdvertiseFailed {
                name: registration.instance_name.clone(),
                reason: "no multicast interface available".to_string(),
            });
        }

        network
            .services
            .insert(registration.fullname(), registration.clone());
        network.deliver(
            &queries_for(registration),
            &BrowseEvent::Resolved(resolve(registration)),
        );
        Ok(())
    }

    fn unregister(&self, fullname: &str) -> Result<(), DiscoveryError> {
        let mut network = self.network();
        if let Some(registration) = network.services.remove(fullname) {
            network.deliver(
                &queries_for(&registration),
                &BrowseEvent::Removed(fullname.to_string()),
            );
        }
        Ok(())
    }

    fn shutdown(&self) -> Result<(), DiscoveryError> {
        let mut network = self.network();
        for senders in network.browsers.values_mut() {
            senders.retain(|(host, _)| *host != self.host);
        }
        network.browsers.retain(|_, senders| !senders.is_empty());
        network.shut_down.insert(self.host);
        Ok(())
    }
}
