use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use chrono::Utc;
use shared::types::{ServiceFilter, ServiceRecord};
use super::backend::ResolvedService;

/// Outcome of feeding one resolved advertisement into the tracker
#[derive(Debug, Clone, PartialEq)]
pub enum Observation {
    New(ServiceRecord),
    /// Address set or port differs from the last reported record
    Changed(ServiceRecord),
    Unchanged,
}

/// Instances seen during one browse session, keyed by full instance name.
/// Addresses are never part of the key since a host can renumber.
#[derive(Debug, Default)]
pub struct InstanceTracker {
    instances: HashMap<String, ServiceRecord>,
}

impl InstanceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an advertisement. The caller has already rejected services
    /// with no address or a zero port.
    pub fn observe(&mut self, descriptor: ServiceFilter, service: ResolvedService) -> Observation {
        let current = dedup_in_order(&service.addresses);

        let (observation, record) = match self.instances.get(&service.fullname) {
            None => {
                let record = ServiceRecord {
                    service_type: descriptor,
                    instance_name: service.fullname.clone(),
                    hostname: service.hostname,
                    addresses: current,
                    port: service.port,
                    txt: service.txt,
                    first_seen: Utc::now(),
                };
                (Observation::New(record.clone()), record)
            }
            Some(previous) => {
                if same_set(&previous.addresses, &current) && previous.port == service.port {
                    return Observation::Unchanged;
                }

                let record = ServiceRecord {
                    service_type: previous.service_type.clone(),
                    instance_name: service.fullname.clone(),
                    hostname: service.hostname,
                    addresses: merge_addresses(&previous.addresses, &current),
                    port: service.port,
                    txt: service.txt,
                    first_seen: previous.first_seen,
                };
                (Observation::Changed(record.clone()), record)
            }
        };

        self.instances.insert(service.fullname, record);
        observation
    }

    /// Forget an instance so a later advertisement counts as new again
    pub fn remove(&mut self, fullname: &str) -> bool {
        self.instances.remove(fullname).is_some()
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}

fn dedup_in_order(addresses: &[IpAddr]) -> Vec<IpAddr> {
    let mut seen = HashSet::new();
    addresses.iter().copied().filter(|a| seen.insert(*a)).collect()
}

fn same_set(a: &[IpAddr], b: &[IpAddr]) -> bool {
    a.len() == b.len() && a.iter().collect::<HashSet<_>>() == b.iter().collect::<HashSet<_>>()
}

/// Keep surviving addresses in the order they were first discovered and
/// append the new ones after them.
fn merge_addresses(previous: &[IpAddr], current: &[IpAddr]) -> Vec<IpAddr> {
    let mut merged: Vec<IpAddr> = previous
        .iter()
        .filter(|a| current.contains(a))
        .copied()
        .collect();
    merged.extend(current.iter().filter(|a| !previous.contains(a)).copied());
    merged
}
