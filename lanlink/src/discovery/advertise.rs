use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use super::backend::{BrowseBackend, ServiceRegistration};
use super::{DiscoveryError, ServiceDescription};

/// A registered service instance. Stays announced until withdrawn or the
/// resolver shuts down.
pub struct Advertisement {
    backend: Arc<dyn BrowseBackend>,
    fullname: String,
    withdrawn: AtomicBool,
}

impl Advertisement {
    /// Full instance name, e.g. "edison-temperature._zmq._tcp.local."
    pub fn fullname(&self) -> &str {
        &self.fullname
    }

    /// Stop announcing the instance. Idempotent.
    pub fn withdraw(&self) -> Result<(), DiscoveryError> {
        if self.withdrawn.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.backend.unregister(&self.fullname)?;
        tracing::info!("Unregistered {}", self.fullname);
        Ok(())
    }
}

/// Register `description` on `backend`. An empty `addresses` announces every
/// address of every enabled interface.
pub fn register_service(
    backend: Arc<dyn BrowseBackend>,
    description: &ServiceDescription,
    addresses: &[IpAddr],
) -> Result<Advertisement, DiscoveryError> {
    let hostname = hostname::get()
        .map_err(|e| DiscoveryError::AdvertiseFailed {
            name: description.service_name.clone(),
            reason: format!("failed to get system hostname: {}", e),
        })?
        .to_string_lossy()
        .to_string();

    // A DNS-SD registration carries at most one subtype
    let subtypes = &description.service_type.subtypes;
    if subtypes.len() > 1 {
        tracing::warn!(
            "{} lists {} subtypes, advertising only {}",
            description.service_name,
            subtypes.len(),
            subtypes[0]
        );
    }

    let registration = ServiceRegistration {
        instance_name: description.service_name.clone(),
        service_type: description.service_type.service_type(),
        subtype: subtypes.first().cloned(),
        hostname: format!("{}.local.", hostname),
        addresses: addresses.to_vec(),
        port: description.port,
        txt: description.txt_records(),
    };

    backend.register(&registration)?;

    let fullname = registration.fullname();
    if addresses.is_empty() {
        tracing::info!(
            "Registered {} as {} on port {}",
            description.service_type,
            fullname,
            description.port
        );
    } else {
        tracing::info!(
            "Registered {} as {} at {:?} port {}",
            description.service_type,
            fullname,
            addresses,
            description.port
        );
    }

    Ok(Advertisement {
        backend,
        fullname,
        withdrawn: AtomicBool::new(false),
    })
}
