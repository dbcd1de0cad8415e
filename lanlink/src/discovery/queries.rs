use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use super::backend::{BrowseBackend, BrowseEvent, BrowseStream, ResolvedService};
use super::DiscoveryError;

/// Sessions attached to one backend query, plus the services the query
/// currently knows about so a late session starts from the same view
#[derive(Default)]
struct Listeners {
    senders: HashMap<u64, flume::Sender<BrowseEvent>>,
    resolved: BTreeMap<String, ResolvedService>,
    ended: bool,
}

impl Listeners {
    fn deliver(&mut self, event: BrowseEvent) {
        match &event {
            BrowseEvent::Resolved(service) => {
                self.resolved.insert(service.fullname.clone(), service.clone());
            }
            BrowseEvent::Removed(fullname) => {
                self.resolved.remove(fullname);
            }
        }
        self.senders.retain(|_, tx| tx.send(event.clone()).is_ok());
    }

    fn attach(&mut self, id: u64) -> flume::Receiver<BrowseEvent> {
        let (tx, rx) = flume::unbounded();
        for service in self.resolved.values() {
            let _ = tx.send(BrowseEvent::Resolved(service.clone()));
        }
        self.senders.insert(id, tx);
        rx
    }
}

fn lock(listeners: &Mutex<Listeners>) -> MutexGuard<'_, Listeners> {
    listeners.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct SharedQuery {
    listeners: Arc<Mutex<Listeners>>,
    cancel: CancellationToken,
}

/// Backend queries shared by every session of one resolver.
///
/// A backend keeps one browse per query name, so each query is started on
/// the first session that needs it, fanned out to every attached session,
/// and stopped when the last of them detaches.
pub struct QueryHub {
    backend: Arc<dyn BrowseBackend>,
    queries: Mutex<HashMap<String, SharedQuery>>,
    next_id: AtomicU64,
}

impl QueryHub {
    pub fn new(backend: Arc<dyn BrowseBackend>) -> Self {
        Self {
            backend,
            queries: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn backend(&self) -> &Arc<dyn BrowseBackend> {
        &self.backend
    }

    fn queries(&self) -> MutexGuard<'_, HashMap<String, SharedQuery>> {
        self.queries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Attach to `query`, starting the backend browse if no session holds
    /// it yet. Returns the attachment id to pass to [`QueryHub::detach`].
    /// Must be called inside a tokio runtime.
    pub fn attach(&self, query: &str) -> Result<(u64, BrowseStream), DiscoveryError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut queries = self.queries();

        if let Some(shared) = queries.get(query) {
            let mut listeners = lock(&shared.listeners);
            if !listeners.ended {
                let rx = listeners.attach(id);
                tracing::debug!("Joined running browse for {} ({} sessions)", query, listeners.senders.len());
                return Ok((id, Box::pin(rx.into_stream())));
            }
        }

        let events = self.backend.browse(query)?;
        let listeners = Arc::new(Mutex::new(Listeners::default()));
        let rx = lock(&listeners).attach(id);
        let cancel = CancellationToken::new();
        tokio::spawn(pump(query.to_string(), events, listeners.clone(), cancel.clone()));

        if let Some(stale) = queries.insert(query.to_string(), SharedQuery { listeners, cancel }) {
            stale.cancel.cancel();
        }
        tracing::debug!("Started browse for {}", query);

        Ok((id, Box::pin(rx.into_stream())))
    }

    /// Detach one session from `query`, stopping the backend browse once
    /// nobody is left on it
    pub fn detach(&self, query: &str, id: u64) -> Result<(), DiscoveryError> {
        let mut queries = self.queries();
        let Some(shared) = queries.get(query) else {
            return Ok(());
        };

        let remaining = {
            let mut listeners = lock(&shared.listeners);
            listeners.senders.remove(&id);
            listeners.senders.len()
        };
        if remaining > 0 {
            return Ok(());
        }

        if let Some(shared) = queries.remove(query) {
            shared.cancel.cancel();
        }
        tracing::debug!("Stopped browse for {}", query);
        self.backend.stop_browse(query)
    }

    /// Number of backend queries currently running
    pub fn active(&self) -> usize {
        self.queries().len()
    }
}

/// Forward one backend stream to every attached session
async fn pump(query: String, mut events: BrowseStream, listeners: Arc<Mutex<Listeners>>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            event = events.next() => match event {
                Some(event) => lock(&listeners).deliver(event),
                None => {
                    tracing::debug!("Browse for {} ended", query);
                    break;
                }
            },
        }
    }

    // Dropping the senders ends every attached session's stream
    let mut listeners = lock(&listeners);
    listeners.ended = true;
    listeners.senders.clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;
    use crate::discovery::backend::{MemoryBackend, ServiceRegistration};

    const QUERY: &str = "_zmq._tcp.local.";

    fn registration(instance: &str) -> ServiceRegistration {
        ServiceRegistration {
            instance_name: instance.to_string(),
            service_type: QUERY.to_string(),
            subtype: None,
            hostname: "edison.local.".to_string(),
            addresses: vec![IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5))],
            port: 5556,
            txt: HashMap::new(),
        }
    }

    async fn next(stream: &mut BrowseStream) -> Option<BrowseEvent> {
        tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("timed out waiting for a browse event")
    }

    #[tokio::test]
    async fn test_one_backend_browse_per_query() {
        let backend = MemoryBackend::new();
        let hub = QueryHub::new(Arc::new(backend.clone()));

        let (first, mut a) = hub.attach(QUERY).unwrap();
        let (second, mut b) = hub.attach(QUERY).unwrap();
        assert_eq!(backend.active_browses(), 1);
        assert_eq!(hub.active(), 1);

        backend.register(&registration("sensor")).unwrap();
        assert!(matches!(next(&mut a).await, Some(BrowseEvent::Resolved(_))));
        assert!(matches!(next(&mut b).await, Some(BrowseEvent::Resolved(_))));

        hub.detach(QUERY, first).unwrap();
        assert_eq!(backend.active_browses(), 1);

        backend.unregister("sensor._zmq._tcp.local.").unwrap();
        assert_eq!(
            next(&mut b).await,
            Some(BrowseEvent::Removed("sensor._zmq._tcp.local.".to_string()))
        );

        hub.detach(QUERY, second).unwrap();
        assert_eq!(backend.active_browses(), 0);
        assert_eq!(hub.active(), 0);
    }

    #[tokio::test]
    async fn test_late_session_sees_known_services() {
        let backend = MemoryBackend::new();
        let hub = QueryHub::new(Arc::new(backend.clone()));

        let (_first, mut a) = hub.attach(QUERY).unwrap();
        backend.register(&registration("sensor")).unwrap();
        assert!(matches!(next(&mut a).await, Some(BrowseEvent::Resolved(_))));

        let (_second, mut b) = hub.attach(QUERY).unwrap();
        match next(&mut b).await {
            Some(BrowseEvent::Resolved(service)) => assert_eq!(service.fullname, "sensor._zmq._tcp.local."),
            other => panic!("expected the known service, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_ended_query_restarts_on_next_attach() {
        let backend = MemoryBackend::new();
        let hub = QueryHub::new(Arc::new(backend.clone()));

        let (_id, mut a) = hub.attach(QUERY).unwrap();
        backend.stop_browse(QUERY).unwrap();
        assert_eq!(next(&mut a).await, None);

        let (_id, mut b) = hub.attach(QUERY).unwrap();
        assert_eq!(backend.active_browses(), 1);
        backend.register(&registration("sensor")).unwrap();
        assert!(matches!(next(&mut b).await, Some(BrowseEvent::Resolved(_))));
    }
}
