//! Topic based publish/subscribe over TCP.
//!
//! A `pub` client binds an endpoint and fans every published message out to
//! the connected subscribers whose topic filters match. A `sub` client
//! connects to such an endpoint and hands matching messages to its
//! handlers. Delivery is at-most-once with no persistence: messages
//! published while nobody is subscribed are lost, and a subscriber that
//! falls more than `high_water_mark` messages behind loses the excess.

pub mod codec;
pub mod publisher;
pub mod subscriber;
pub mod topics;

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::{Arc, OnceLock};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use shared::protocol::MAX_FRAME_LEN;
use crate::config::PubSubOptions;
use self::codec::Frame;
use self::publisher::Peers;
use self::topics::Subscriptions;

pub use self::topics::Handler;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Pub,
    Sub,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Mode::Pub => "pub",
            Mode::Sub => "sub",
        })
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pub" => Ok(Mode::Pub),
            "sub" => Ok(Mode::Sub),
            other => Err(format!("unknown mode '{}'", other)),
        }
    }
}

/// Disconnected -> Connecting -> Connected | Closed, Connected -> Closed.
/// Nothing leaves Closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Carries the transport error, or None after an explicit close
    Closed(Option<String>),
}

impl ConnectionState {
    pub fn is_closed(&self) -> bool {
        matches!(self, ConnectionState::Closed(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PubSubError {
    #[error("connection error: {0}")]
    ConnectionError(String),

    #[error("operation not valid on a {0} client")]
    InvalidMode(Mode),

    #[error("client is closed")]
    ClientClosed,

    #[error("invalid topic: {0}")]
    InvalidTopic(String),

    #[error("message frame of {size} bytes exceeds the {limit} byte limit")]
    MessageTooLarge { size: usize, limit: usize },
}

/// State a client shares with its connection task
pub(crate) struct Link {
    state: watch::Sender<ConnectionState>,
    errors: flume::Sender<PubSubError>,
}

impl Link {
    fn connecting(&self) {
        self.state.send_if_modified(|state| {
            if *state == ConnectionState::Disconnected {
                *state = ConnectionState::Connecting;
                true
            } else {
                false
            }
        });
    }

    /// Returns false if the client was closed before the transport came up
    pub(crate) fn connected(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == ConnectionState::Connecting {
                *state = ConnectionState::Connected;
                true
            } else {
                false
            }
        })
    }

    /// Close because of a transport error and report it on the error channel
    pub(crate) fn fail(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let failed = self.state.send_if_modified(|state| {
            if state.is_closed() {
                false
            } else {
                *state = ConnectionState::Closed(Some(reason.clone()));
                true
            }
        });

        if failed {
            tracing::warn!("Pub/sub connection failed: {}", reason);
            let _ = self.errors.send(PubSubError::ConnectionError(reason));
        }
    }

    fn close(&self) -> bool {
        self.state.send_if_modified(|state| {
            if state.is_closed() {
                false
            } else {
                *state = ConnectionState::Closed(None);
                true
            }
        })
    }

    fn is_closed(&self) -> bool {
        self.state.borrow().is_closed()
    }
}

enum Role {
    Publisher {
        peers: Arc<Peers>,
        local_addr: Arc<OnceLock<SocketAddr>>,
    },
    Subscriber {
        subscriptions: Arc<Subscriptions>,
    },
}

/// One end of a topic transport. Every method returns immediately; the
/// connection lives on a background task.
pub struct PubSubClient {
    mode: Mode,
    endpoint: SocketAddr,
    role: Role,
    link: Arc<Link>,
    state: watch::Receiver<ConnectionState>,
    errors: flume::Receiver<PubSubError>,
    outbound: mpsc::UnboundedSender<Frame>,
    cancel: CancellationToken,
}

impl PubSubClient {
    /// Connect (`sub`) to or bind (`pub`) `address:port` with default options.
    /// Must be called inside a tokio runtime.
    pub fn new(address: IpAddr, port: u16, mode: Mode) -> Self {
        Self::with_options(address, port, mode, PubSubOptions::default())
    }

    /// Connection failures never surface here; they move the client to
    /// `Closed` and are reported on [`PubSubClient::errors`].
    pub fn with_options(address: IpAddr, port: u16, mode: Mode, options: PubSubOptions) -> Self {
        let endpoint = SocketAddr::new(address, port);
        let (state_tx, state) = watch::channel(ConnectionState::Disconnected);
        let (errors_tx, errors) = flume::unbounded();
        let link = Arc::new(Link {
            state: state_tx,
            errors: errors_tx,
        });
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        link.connecting();
        tracing::info!("Starting {} client for {}", mode, endpoint);

        let role = match mode {
            Mode::Sub => {
                let subscriptions = Arc::new(Subscriptions::new());
                tokio::spawn(subscriber::run(
                    endpoint,
                    options,
                    subscriptions.clone(),
                    outbound_rx,
                    link.clone(),
                    cancel.clone(),
                ));
                Role::Subscriber { subscriptions }
            }
            Mode::Pub => {
                let peers = Arc::new(Peers::new());
                let local_addr = Arc::new(OnceLock::new());
                tokio::spawn(publisher::run(
                    endpoint,
                    options,
                    peers.clone(),
                    local_addr.clone(),
                    outbound_rx,
                    link.clone(),
                    cancel.clone(),
                ));
                Role::Publisher { peers, local_addr }
            }
        };

        Self {
            mode,
            endpoint,
            role,
            link,
            state,
            errors,
            outbound,
            cancel,
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// The address this client was constructed with
    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    /// Address a `pub` client actually bound, once it is connected
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.role {
            Role::Publisher { local_addr, .. } => local_addr.get().copied(),
            Role::Subscriber { .. } => None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Asynchronous connection errors
    pub fn errors(&self) -> flume::Receiver<PubSubError> {
        self.errors.clone()
    }

    /// Wait until the transport is up, or report why it never came up
    pub async fn wait_connected(&self) -> Result<(), PubSubError> {
        let mut state = self.state.clone();
        let settled = state
            .wait_for(|s| matches!(s, ConnectionState::Connected | ConnectionState::Closed(_)))
            .await
            .map_err(|_| PubSubError::ClientClosed)?
            .clone();

        match settled {
            ConnectionState::Closed(Some(reason)) => Err(PubSubError::ConnectionError(reason)),
            ConnectionState::Closed(None) => Err(PubSubError::ClientClosed),
            _ => Ok(()),
        }
    }

    /// Number of connected subscribers whose filters match `topic`.
    /// Always 0 on a `sub` client.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        match &self.role {
            Role::Publisher { peers, .. } => peers.subscriber_count(topic),
            Role::Subscriber { .. } => 0,
        }
    }

    fn ensure_open(&self) -> Result<(), PubSubError> {
        if self.link.is_closed() {
            Err(PubSubError::ClientClosed)
        } else {
            Ok(())
        }
    }

    /// A topic must fit the u16 length field of a MESSAGE frame, which also
    /// keeps SUBSCRIBE / UNSUBSCRIBE frames well under the frame limit
    fn check_topic(topic: &str) -> Result<(), PubSubError> {
        if topic.len() > usize::from(u16::MAX) {
            return Err(PubSubError::InvalidTopic(format!(
                "topic of {} bytes exceeds {}",
                topic.len(),
                u16::MAX
            )));
        }
        Ok(())
    }

    fn subscriptions(&self) -> Result<&Subscriptions, PubSubError> {
        self.ensure_open()?;
        match &self.role {
            Role::Subscriber { subscriptions } => Ok(subscriptions.as_ref()),
            Role::Publisher { .. } => Err(PubSubError::InvalidMode(self.mode)),
        }
    }

    /// Deliver messages whose topic starts with `topic` to `handler`.
    /// Subscribing to a topic again replaces its handler and sends nothing
    /// to the publisher.
    pub fn subscribe<F>(&self, topic: &str, handler: F) -> Result<(), PubSubError>
    where
        F: Fn(&str, &[u8]) + Send + Sync + 'static,
    {
        self.subscribe_handler(topic, Arc::new(handler))
    }

    pub fn subscribe_handler(&self, topic: &str, handler: Handler) -> Result<(), PubSubError> {
        let subscriptions = self.subscriptions()?;
        Self::check_topic(topic)?;
        if subscriptions.insert(topic, handler) {
            tracing::debug!("Subscribing to {}", topic);
            self.outbound
                .send(Frame::Subscribe(topic.to_string()))
                .map_err(|_| PubSubError::ClientClosed)?;
        }
        Ok(())
    }

    pub fn unsubscribe(&self, topic: &str) -> Result<(), PubSubError> {
        let subscriptions = self.subscriptions()?;
        Self::check_topic(topic)?;
        if subscriptions.remove(topic) {
            tracing::debug!("Unsubscribing from {}", topic);
            self.outbound
                .send(Frame::Unsubscribe(topic.to_string()))
                .map_err(|_| PubSubError::ClientClosed)?;
        }
        Ok(())
    }

    pub fn publish(&self, topic: &str, message: impl AsRef<[u8]>) -> Result<(), PubSubError> {
        self.ensure_open()?;
        if self.mode != Mode::Pub {
            return Err(PubSubError::InvalidMode(self.mode));
        }
        Self::check_topic(topic)?;

        let message = message.as_ref();
        let size = Frame::message_len(topic, message.len());
        if size > MAX_FRAME_LEN {
            return Err(PubSubError::MessageTooLarge {
                size,
                limit: MAX_FRAME_LEN,
            });
        }

        self.outbound
            .send(Frame::Message {
                topic: topic.to_string(),
                payload: Bytes::copy_from_slice(message),
            })
            .map_err(|_| PubSubError::ClientClosed)
    }

    /// Mark the client closed right away and tear the transport down in the
    /// background. Idempotent.
    pub fn close(&self) {
        if self.link.close() {
            tracing::info!("Closed {} client for {}", self.mode, self.endpoint);
        }
        self.cancel.cancel();
    }
}

impl Drop for PubSubClient {
    fn drop(&mut self) {
        self.link.close();
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::sync::Mutex;
    use std::time::Duration;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    async fn bound_publisher() -> PubSubClient {
        let publisher = PubSubClient::new(LOCALHOST, 0, Mode::Pub);
        publisher.wait_connected().await.unwrap();
        publisher
    }

    async fn wait_for_subscribers(publisher: &PubSubClient, topic: &str, count: usize) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while publisher.subscriber_count(topic) < count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("subscriber never registered");
    }

    fn recorder() -> (
        impl Fn(&str, &[u8]) + Send + Sync + 'static,
        flume::Receiver<(String, Vec<u8>)>,
    ) {
        let (tx, rx) = flume::unbounded();
        let handler = move |topic: &str, message: &[u8]| {
            let _ = tx.send((topic.to_string(), message.to_vec()));
        };
        (handler, rx)
    }

    async fn recv(rx: &flume::Receiver<(String, Vec<u8>)>) -> (String, Vec<u8>) {
        tokio::time::timeout(Duration::from_secs(2), rx.recv_async())
            .await
            .expect("timed out waiting for a message")
            .unwrap()
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!("pub".parse::<Mode>(), Ok(Mode::Pub));
        assert_eq!("sub".parse::<Mode>(), Ok(Mode::Sub));
        assert!("push".parse::<Mode>().is_err());
    }

    #[tokio::test]
    async fn test_subscribe_on_publisher_is_invalid_mode() {
        let publisher = bound_publisher().await;

        let result = publisher.subscribe("/Intel/temperature", |_, _| {});
        assert_eq!(result, Err(PubSubError::InvalidMode(Mode::Pub)));
        assert_eq!(publisher.unsubscribe("/Intel/temperature"), Err(PubSubError::InvalidMode(Mode::Pub)));
        assert_eq!(publisher.subscriber_count("/Intel/temperature"), 0);
        assert_eq!(publisher.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_publish_on_subscriber_is_invalid_mode() {
        let publisher = bound_publisher().await;
        let port = publisher.local_addr().unwrap().port();
        let subscriber = PubSubClient::new(LOCALHOST, port, Mode::Sub);

        assert_eq!(
            subscriber.publish("/Intel/temperature", "23.5C"),
            Err(PubSubError::InvalidMode(Mode::Sub))
        );
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_final() {
        let publisher = bound_publisher().await;
        let subscriber = PubSubClient::new(LOCALHOST, publisher.local_addr().unwrap().port(), Mode::Sub);

        for client in [&publisher, &subscriber] {
            client.close();
            assert_eq!(client.state(), ConnectionState::Closed(None));
            client.close();
            assert_eq!(client.state(), ConnectionState::Closed(None));
        }

        assert_eq!(publisher.publish("/t", "m"), Err(PubSubError::ClientClosed));
        assert_eq!(publisher.subscribe("/t", |_, _| {}), Err(PubSubError::ClientClosed));
        assert_eq!(subscriber.subscribe("/t", |_, _| {}), Err(PubSubError::ClientClosed));
        assert_eq!(subscriber.unsubscribe("/t"), Err(PubSubError::ClientClosed));
        assert_eq!(subscriber.wait_connected().await, Err(PubSubError::ClientClosed));
    }

    #[tokio::test]
    async fn test_messages_on_one_topic_arrive_in_order() {
        let publisher = bound_publisher().await;
        let subscriber = PubSubClient::new(LOCALHOST, publisher.local_addr().unwrap().port(), Mode::Sub);
        let (handler, rx) = recorder();
        subscriber.subscribe("/Intel/temperature", handler).unwrap();
        subscriber.wait_connected().await.unwrap();
        wait_for_subscribers(&publisher, "/Intel/temperature", 1).await;

        for message in ["M1", "M2", "M3"] {
            publisher.publish("/Intel/temperature", message).unwrap();
        }

        for expected in ["M1", "M2", "M3"] {
            let (topic, message) = recv(&rx).await;
            assert_eq!(topic, "/Intel/temperature");
            assert_eq!(message, expected.as_bytes());
        }
    }

    #[tokio::test]
    async fn test_only_matching_topics_are_delivered() {
        let publisher = bound_publisher().await;
        let subscriber = PubSubClient::new(LOCALHOST, publisher.local_addr().unwrap().port(), Mode::Sub);
        let (handler, rx) = recorder();
        subscriber.subscribe("/Intel", handler).unwrap();
        wait_for_subscribers(&publisher, "/Intel/temperature", 1).await;

        publisher.publish("/AMD/temperature", "ignored").unwrap();
        publisher.publish("/Intel/temperature", "23.5C").unwrap();

        assert_eq!(recv(&rx).await, ("/Intel/temperature".to_string(), b"23.5C".to_vec()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.is_empty());
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let publisher = bound_publisher().await;
        let subscriber = PubSubClient::new(LOCALHOST, publisher.local_addr().unwrap().port(), Mode::Sub);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        subscriber
            .subscribe("/t", move |_, message| sink.lock().unwrap().push(message.to_vec()))
            .unwrap();
        wait_for_subscribers(&publisher, "/t", 1).await;

        subscriber.unsubscribe("/t").unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while publisher.subscriber_count("/t") > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        publisher.publish("/t", "late").unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_oversized_message_rejected_and_subscribers_kept() {
        let publisher = bound_publisher().await;
        let subscriber = PubSubClient::new(LOCALHOST, publisher.local_addr().unwrap().port(), Mode::Sub);
        let (handler, rx) = recorder();
        subscriber.subscribe("/t", handler).unwrap();
        wait_for_subscribers(&publisher, "/t", 1).await;

        let result = publisher.publish("/t", vec![0u8; 2 * MAX_FRAME_LEN]);
        assert!(matches!(
            result,
            Err(PubSubError::MessageTooLarge { limit: MAX_FRAME_LEN, .. })
        ));

        // The largest message that still fits goes through
        let fits = MAX_FRAME_LEN - Frame::message_len("/t", 0);
        publisher.publish("/t", vec![7u8; fits]).unwrap();
        publisher.publish("/t", "23.5C").unwrap();

        let (_, big) = recv(&rx).await;
        assert_eq!(big.len(), fits);
        assert_eq!(recv(&rx).await, ("/t".to_string(), b"23.5C".to_vec()));
        assert_eq!(publisher.subscriber_count("/t"), 1);
        assert_eq!(subscriber.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_oversized_topic_rejected_without_closing() {
        let publisher = bound_publisher().await;
        let subscriber = PubSubClient::new(LOCALHOST, publisher.local_addr().unwrap().port(), Mode::Sub);
        subscriber.wait_connected().await.unwrap();

        let topic = "t".repeat(usize::from(u16::MAX) + 1);
        assert!(matches!(subscriber.subscribe(&topic, |_, _| {}), Err(PubSubError::InvalidTopic(_))));
        assert!(matches!(subscriber.unsubscribe(&topic), Err(PubSubError::InvalidTopic(_))));
        assert!(matches!(publisher.publish(&topic, "m"), Err(PubSubError::InvalidTopic(_))));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(subscriber.state(), ConnectionState::Connected);
        assert_eq!(publisher.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_resubscribe_replaces_handler_and_keeps_one_filter() {
        let publisher = bound_publisher().await;
        let subscriber = PubSubClient::new(LOCALHOST, publisher.local_addr().unwrap().port(), Mode::Sub);
        let (first, first_rx) = recorder();
        let (second, second_rx) = recorder();

        subscriber.subscribe("/Intel/temperature", first).unwrap();
        wait_for_subscribers(&publisher, "/Intel/temperature", 1).await;
        subscriber.subscribe("/Intel/temperature", second).unwrap();

        publisher.publish("/Intel/temperature", "23.5C").unwrap();

        assert_eq!(
            recv(&second_rx).await,
            ("/Intel/temperature".to_string(), b"23.5C".to_vec())
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(first_rx.is_empty());
        assert!(second_rx.is_empty());

        let Role::Publisher { peers, .. } = &publisher.role else {
            panic!("publisher has no peers");
        };
        assert_eq!(peers.len(), 1);
        assert_eq!(peers.filter_count(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_surfaces_error() {
        // Bind and drop a listener to get a port nobody listens on
        let listener = tokio::net::TcpListener::bind((LOCALHOST, 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let options = PubSubOptions {
            connect_retries: 1,
            retry_delay_ms: 10,
            ..PubSubOptions::default()
        };
        let subscriber = PubSubClient::with_options(LOCALHOST, port, Mode::Sub, options);
        let errors = subscriber.errors();

        assert!(matches!(
            subscriber.wait_connected().await,
            Err(PubSubError::ConnectionError(_))
        ));
        assert!(matches!(subscriber.state(), ConnectionState::Closed(Some(_))));
        assert!(matches!(errors.try_recv(), Ok(PubSubError::ConnectionError(_))));
        assert_eq!(subscriber.subscribe("/t", |_, _| {}), Err(PubSubError::ClientClosed));
    }

    #[tokio::test]
    async fn test_publisher_close_drops_subscriber() {
        let publisher = bound_publisher().await;
        let subscriber = PubSubClient::new(LOCALHOST, publisher.local_addr().unwrap().port(), Mode::Sub);
        subscriber.wait_connected().await.unwrap();

        publisher.close();

        let mut state = subscriber.watch_state();
        tokio::time::timeout(Duration::from_secs(2), state.wait_for(ConnectionState::is_closed))
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(subscriber.state(), ConnectionState::Closed(Some(_))));
    }

    #[tokio::test]
    async fn test_bind_conflict_surfaces_error() {
        let publisher = bound_publisher().await;
        let port = publisher.local_addr().unwrap().port();

        let second = PubSubClient::new(LOCALHOST, port, Mode::Pub);
        assert!(matches!(
            second.wait_connected().await,
            Err(PubSubError::ConnectionError(_))
        ));
    }
}
