//! Local network service discovery and topic based publish/subscribe.
//!
//! [`DiscoveryResolver`] browses mDNS for services matching a
//! [`ServiceFilter`] and reports each resolved instance with its addresses
//! ranked best first. [`PubSubClient`] either binds a topic endpoint and fans
//! published messages out to subscribers, or connects to one and delivers
//! matching messages to registered handlers.
//!
//! The two halves share no state; a caller typically feeds the best address
//! and port of a discovered record into a subscriber client:
//!
//! ```rust,no_run
//! use lanlink::{DiscoveryResolver, Mode, PubSubClient};
//! use shared::types::{Protocol, ServiceFilter};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let resolver = DiscoveryResolver::new(&Default::default())?;
//! let filter = ServiceFilter::new("zmq", Protocol::Tcp).with_subtype("cpuTemp");
//!
//! let (tx, rx) = flume::unbounded();
//! let _session = resolver.discover_services(filter, None, move |record, ranked| {
//!     let _ = tx.send((record, ranked));
//! })?;
//!
//! let (record, ranked) = rx.recv_async().await?;
//! if let Some(best) = ranked.best() {
//!     let client = PubSubClient::new(best, record.port, Mode::Sub);
//!     client.subscribe("/Intel/temperature", |topic, message| {
//!         println!("{}: {}", topic, String::from_utf8_lossy(message));
//!     })?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod discovery;
pub mod pubsub;
pub mod registry;

pub use config::{DiscoveryConfig, DiscoveryOptions, LanlinkConfig, PubSubOptions};
pub use discovery::{
    Advertisement, DiscoveryError, DiscoveryResolver, DiscoverySession, ResolveFailure,
    ServiceDescription,
};
pub use pubsub::{ConnectionState, Handler, Mode, PubSubClient, PubSubError};
pub use registry::{Communication, CommunicationKind, DiscoveryKind, ServiceDiscovery};
