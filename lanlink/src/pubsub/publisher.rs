use std::collections::{HashMap, HashSet};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use super::codec::{handshake, Frame, FrameCodec};
use super::topics::topic_matches;
use super::Link;
use crate::config::PubSubOptions;

struct Peer {
    addr: SocketAddr,
    filters: HashSet<String>,
    queue: mpsc::Sender<Frame>,
}

/// Subscribers connected to a publisher and the filters each registered
#[derive(Default)]
pub struct Peers {
    next_id: AtomicU64,
    peers: Mutex<HashMap<u64, Peer>>,
}

impl Peers {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, Peer>> {
        self.peers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn add(&self, addr: SocketAddr, queue: mpsc::Sender<Frame>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().insert(
            id,
            Peer {
                addr,
                filters: HashSet::new(),
                queue,
            },
        );
        id
    }

    fn remove(&self, id: u64) {
        self.lock().remove(&id);
    }

    fn subscribe(&self, id: u64, topic: String) {
        if let Some(peer) = self.lock().get_mut(&id) {
            tracing::debug!("Subscriber {} subscribed to {}", peer.addr, topic);
            peer.filters.insert(topic);
        }
    }

    fn unsubscribe(&self, id: u64, topic: &str) {
        if let Some(peer) = self.lock().get_mut(&id) {
            tracing::debug!("Subscriber {} unsubscribed from {}", peer.addr, topic);
            peer.filters.remove(topic);
        }
    }

    /// Connected subscribers with at least one filter matching `topic`
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.lock()
            .values()
            .filter(|peer| peer.filters.iter().any(|f| topic_matches(f, topic)))
            .count()
    }

    /// Topic filters registered across all subscribers
    pub fn filter_count(&self) -> usize {
        self.lock().values().map(|peer| peer.filters.len()).sum()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Queue a message for every matching subscriber without waiting.
    /// Returns how many subscribers it was queued for.
    pub fn fan_out(&self, topic: &str, payload: &Bytes) -> usize {
        let mut queued = 0;
        for peer in self.lock().values() {
            if !peer.filters.iter().any(|f| topic_matches(f, topic)) {
                continue;
            }

            let frame = Frame::Message {
                topic: topic.to_string(),
                payload: payload.clone(),
            };
            match peer.queue.try_send(frame) {
                Ok(()) => queued += 1,
                Err(TrySendError::Full(_)) => {
                    tracing::debug!("Dropping message on {} for {}: high-water mark reached", topic, peer.addr);
                }
                Err(TrySendError::Closed(_)) => {}
            }
        }
        queued
    }
}

const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(10);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Delay before accepting again after `consecutive` failed accepts, so a
/// persistent error such as running out of descriptors does not spin
fn accept_backoff(consecutive: u32) -> Duration {
    let exponent = consecutive.saturating_sub(1).min(16);
    ACCEPT_BACKOFF_MIN
        .saturating_mul(1 << exponent)
        .min(ACCEPT_BACKOFF_MAX)
}

/// Bind the endpoint, then accept subscribers and fan published messages
/// out until cancelled
pub(crate) async fn run(
    endpoint: SocketAddr,
    options: PubSubOptions,
    peers: Arc<Peers>,
    local_addr: Arc<OnceLock<SocketAddr>>,
    mut outbound: mpsc::UnboundedReceiver<Frame>,
    link: Arc<Link>,
    cancel: CancellationToken,
) {
    let listener = match TcpListener::bind(endpoint).await {
        Ok(listener) => listener,
        Err(e) => {
            link.fail(format!("failed to bind {}: {}", endpoint, e));
            return;
        }
    };

    let bound = listener.local_addr().unwrap_or(endpoint);
    let _ = local_addr.set(bound);
    if !link.connected() {
        return;
    }
    tracing::info!("Publishing on {}", bound);

    let tracker = TaskTracker::new();
    let mut accept_errors = 0u32;

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            Some(frame) = outbound.recv() => {
                if let Frame::Message { topic, payload } = frame {
                    let queued = peers.fan_out(&topic, &payload);
                    tracing::trace!("Published on {} to {} subscribers", topic, queued);
                }
            }

            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, addr)) => {
                        accept_errors = 0;
                        let (queue_tx, queue_rx) = mpsc::channel(options.high_water_mark.max(1));
                        let id = peers.add(addr, queue_tx);
                        tracker.spawn(serve_peer(
                            id,
                            addr,
                            stream,
                            peers.clone(),
                            queue_rx,
                            options.connect_timeout(),
                            cancel.child_token(),
                        ));
                    }
                    Err(e) => {
                        accept_errors = accept_errors.saturating_add(1);
                        let delay = accept_backoff(accept_errors);
                        tracing::warn!("Failed to accept subscriber: {}, retrying in {:?}", e, delay);
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }
            }
        }
    }

    drop(listener);
    tracker.close();
    tracker.wait().await;
    tracing::info!("Stopped publishing on {}", bound);
}

async fn serve_peer(
    id: u64,
    addr: SocketAddr,
    stream: TcpStream,
    peers: Arc<Peers>,
    mut queue: mpsc::Receiver<Frame>,
    handshake_timeout: Duration,
    cancel: CancellationToken,
) {
    let _ = stream.set_nodelay(true);
    let mut framed = Framed::new(stream, FrameCodec::new());

    let greeted = tokio::select! {
        biased;
        _ = cancel.cancelled() => Err("publisher closed".to_string()),
        result = handshake(&mut framed, handshake_timeout) => result,
    };
    if let Err(reason) = greeted {
        tracing::warn!("Rejected subscriber {}: {}", addr, reason);
        peers.remove(id);
        return;
    }
    tracing::debug!("Subscriber {} connected", addr);

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            frame = framed.next() => {
                match frame {
                    Some(Ok(Frame::Subscribe(topic))) => peers.subscribe(id, topic),
                    Some(Ok(Frame::Unsubscribe(topic))) => peers.unsubscribe(id, &topic),
                    Some(Ok(other)) => {
                        tracing::debug!("Ignoring {:?} from subscriber {}", other, addr);
                    }
                    Some(Err(e)) => {
                        tracing::debug!("Subscriber {} sent a bad frame: {}", addr, e);
                        break;
                    }
                    None => break,
                }
            }

            Some(frame) = queue.recv() => {
                match framed.send(frame).await {
                    Ok(()) => {}
                    // Rejected by the encoder before anything was written
                    Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                        tracing::warn!("Dropping unencodable frame for {}: {}", addr, e);
                    }
                    Err(e) => {
                        tracing::debug!("Failed to write to subscriber {}: {}", addr, e);
                        break;
                    }
                }
            }
        }
    }

    peers.remove(id);
    tracing::debug!("Subscriber {} disconnected", addr);
}
