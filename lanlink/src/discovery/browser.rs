use std::net::IpAddr;
use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use shared::types::{AddressRanking, ServiceFilter, ServiceRecord};
use super::backend::{BrowseEvent, BrowseStream, ResolvedService};
use super::ranking::rank_addresses;
use super::tracker::{InstanceTracker, Observation};
use super::ResolveFailure;
use crate::config::DiscoveryOptions;

pub type ResultCallback = Box<dyn FnMut(ServiceRecord, AddressRanking) + Send>;

/// One open query, tagged with the subtype it was issued for
pub struct Query {
    pub subtype: Option<String>,
    pub events: BrowseStream,
}

/// Drive a browse session until it is cancelled or every query ends.
/// Callbacks fire on this task in the order instances resolve.
pub async fn run_browser(
    filter: ServiceFilter,
    options: DiscoveryOptions,
    queries: Vec<Query>,
    mut on_result: ResultCallback,
    failures: flume::Sender<ResolveFailure>,
    cancel: CancellationToken,
) {
    tracing::info!("Browsing for {}", filter);

    let mut events = stream::select_all(queries.into_iter().map(|query| {
        let subtype = query.subtype;
        query.events.map(move |event| (subtype.clone(), event))
    }));
    let mut tracker = InstanceTracker::new();
    let service_type = filter.service_type();

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                tracing::info!("Browse for {} stopped", filter);
                break;
            }

            next = events.next() => {
                match next {
                    Some((subtype, BrowseEvent::Resolved(service))) => {
                        if !service.service_type.eq_ignore_ascii_case(&service_type) {
                            tracing::debug!(
                                "Ignoring {} of type {}",
                                service.fullname,
                                service.service_type
                            );
                            continue;
                        }

                        let service = match usable(service, &options) {
                            Ok(service) => service,
                            Err(failure) => {
                                tracing::debug!(
                                    "Could not resolve {}: {}",
                                    failure.instance,
                                    failure.reason
                                );
                                let _ = failures.send(failure);
                                continue;
                            }
                        };

                        let descriptor = descriptor_for(&filter, subtype.or_else(|| service.subtype.clone()));
                        match tracker.observe(descriptor, service) {
                            Observation::New(record) | Observation::Changed(record) => {
                                tracing::debug!(
                                    "Resolved {} at {:?}:{}",
                                    record.instance_name,
                                    record.addresses,
                                    record.port
                                );
                                let ranked = rank_addresses(&record.addresses);
                                on_result(record, ranked);
                            }
                            Observation::Unchanged => {}
                        }
                    }
                    Some((_, BrowseEvent::Removed(fullname))) => {
                        if tracker.remove(&fullname) {
                            tracing::debug!("Service removed: {}", fullname);
                        }
                    }
                    None => {
                        tracing::warn!("All queries for {} ended", filter);
                        break;
                    }
                }
            }
        }
    }
}

fn descriptor_for(filter: &ServiceFilter, subtype: Option<String>) -> ServiceFilter {
    ServiceFilter {
        name: filter.name.clone(),
        protocol: filter.protocol,
        subtypes: subtype.into_iter().collect(),
    }
}

/// Reject advertisements a client could not connect to
fn usable(mut service: ResolvedService, options: &DiscoveryOptions) -> Result<ResolvedService, ResolveFailure> {
    if options.ipv4_only {
        service.addresses.retain(IpAddr::is_ipv4);
    }

    let reason = if service.port == 0 {
        "advertised port is 0"
    } else if service.addresses.is_empty() {
        "no usable address"
    } else {
        return Ok(service);
    };

    Err(ResolveFailure {
        instance: service.fullname,
        reason: reason.to_string(),
    })
}
