//! SFU Session
//!
//! A session is the set of transports in one call. Transports inside a
//! session are automatically subscribed to each other's tracks.

use std::collections::HashMap;
use std::fmt::Write;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::TransportError;
use crate::router::{Router, Sender, Track};

/// Per-participant connection endpoint, as seen by the routing core.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Stable identifier, unique within a session.
    fn id(&self) -> &str;

    /// Routers for every track this transport currently publishes.
    async fn routers(&self) -> Vec<Arc<Router>>;

    /// Start forwarding `track` to this transport's remote peer.
    async fn new_sender(&self, track: &Track) -> Result<Arc<dyn Sender>, TransportError>;

    /// Human-readable summary for logging.
    async fn stats(&self) -> String;
}

type CloseHandler = Box<dyn FnOnce() + Send + Sync>;

#[derive(Default)]
struct SessionState {
    transports: HashMap<String, Arc<dyn Transport>>,
    on_close: Option<CloseHandler>,
}

pub struct Session {
    id: String,
    /// Guards membership and every router mutation made on behalf of it.
    state: RwLock<SessionState>,
}

impl Session {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            state: RwLock::new(SessionState::default()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Insert a transport. An existing entry with the same ID is replaced.
    pub async fn add_transport(&self, transport: Arc<dyn Transport>) {
        let mut state = self.state.write().await;
        let tid = transport.id().to_string();

        if state.transports.insert(tid.clone(), transport).is_some() {
            tracing::warn!("Replaced transport {} in session {}", tid, self.id);
        } else {
            tracing::debug!("Added transport {} to session {}", tid, self.id);
        }
    }

    /// Insert a transport and wire it both ways: it is subscribed to every
    /// track the other members publish, and they to every track it already
    /// publishes.
    pub async fn join(&self, transport: Arc<dyn Transport>) {
        let mut state = self.state.write().await;
        let tid = transport.id().to_string();

        for (other_id, other) in state.transports.iter() {
            if *other_id == tid {
                continue;
            }
            for router in other.routers().await {
                if !router.has_sender(&tid).await {
                    subscribe(&tid, transport.as_ref(), &router).await;
                }
            }
        }

        let routers = transport.routers().await;
        state.transports.insert(tid.clone(), transport);

        for router in &routers {
            fan_out(&state.transports, router).await;
        }

        tracing::info!(
            "Transport {} joined session {} ({} transports, {} tracks published)",
            tid,
            self.id,
            state.transports.len(),
            routers.len()
        );
    }

    /// Remove a transport and drop its subscriptions to every remaining
    /// transport's tracks. Fires the close handler once the session empties.
    pub async fn remove_transport(&self, tid: &str) {
        let mut state = self.state.write().await;
        let removed = state.transports.remove(tid).is_some();

        for transport in state.transports.values() {
            for router in transport.routers().await {
                router.del_sub(tid).await;
            }
        }

        if removed {
            tracing::info!("Removed transport {} from session {}", tid, self.id);
        }

        if removed && state.transports.is_empty() {
            if let Some(on_close) = state.on_close.take() {
                tracing::info!("Session {} is empty, closing", self.id);
                on_close();
            }
        }
    }

    /// Fan a newly published track out to every transport except its owner.
    ///
    /// Only transports without a sender for this router are asked to create
    /// one, so calling this again for the same router never replaces a live
    /// forwarding path. A transport that fails to create a sender is logged
    /// and skipped.
    pub async fn add_router(&self, router: &Arc<Router>) {
        let state = self.state.write().await;
        fan_out(&state.transports, router).await;
    }

    /// Snapshot of the current membership.
    pub async fn transports(&self) -> HashMap<String, Arc<dyn Transport>> {
        self.state.read().await.transports.clone()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.transports.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.transports.is_empty()
    }

    /// Register the handler run when the last transport leaves. Runs at most
    /// once; a later registration replaces an earlier one.
    pub async fn on_close<F>(&self, f: F)
    where
        F: FnOnce() + Send + Sync + 'static,
    {
        self.state.write().await.on_close = Some(Box::new(f));
    }

    pub async fn stats(&self) -> String {
        let mut info = format!("\nsession: {}\n", self.id);

        let state = self.state.read().await;
        for transport in state.transports.values() {
            let _ = write!(info, "{}", transport.stats().await);
        }

        info
    }
}

async fn fan_out(transports: &HashMap<String, Arc<dyn Transport>>, router: &Router) {
    for (tid, transport) in transports.iter() {
        // Don't sub to self
        if tid == router.owner_transport_id() {
            continue;
        }
        if router.has_sender(tid).await {
            tracing::debug!("Transport {} already subscribed to track {}", tid, router.track().id);
            continue;
        }
        tracing::info!("AddRouter ssrc {} to {}", router.track().ssrc(), tid);
        subscribe(tid, transport.as_ref(), router).await;
    }
}

async fn subscribe(tid: &str, transport: &dyn Transport, router: &Router) {
    match transport.new_sender(router.track()).await {
        Ok(sender) => router.add_sender(tid, sender).await,
        Err(e) => {
            tracing::error!(
                "Error subscribing transport {} to track {}: {}",
                tid,
                router.track().id,
                e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::tests::{video_track, CountingSender};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct StubTransport {
        id: String,
        routers: Mutex<Vec<Arc<Router>>>,
    }

    impl StubTransport {
        fn new(id: &str) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                routers: Mutex::new(vec![]),
            })
        }

        fn publish(&self, track_id: &str, ssrc: u32) -> Arc<Router> {
            let router = Arc::new(Router::new(&self.id, video_track(track_id, ssrc)));
            self.routers.lock().unwrap().push(router.clone());
            router
        }
    }

    #[async_trait]
    impl Transport for StubTransport {
        fn id(&self) -> &str {
            &self.id
        }

        async fn routers(&self) -> Vec<Arc<Router>> {
            self.routers.lock().unwrap().clone()
        }

        async fn new_sender(&self, track: &Track) -> Result<Arc<dyn Sender>, TransportError> {
            Ok(CountingSender::new(&format!("{}-{}", self.id, track.id)))
        }

        async fn stats(&self) -> String {
            format!("transport: {}\n", self.id)
        }
    }

    #[tokio::test]
    async fn test_add_transport_last_write_wins() {
        let session = Session::new("room");
        session.add_transport(StubTransport::new("a")).await;
        session.add_transport(StubTransport::new("a")).await;
        assert_eq!(session.len().await, 1);
    }

    #[tokio::test]
    async fn test_join_subscribes_to_existing_tracks() {
        let session = Session::new("room");
        let a = StubTransport::new("a");
        let router = a.publish("cam", 1);
        session.join(a.clone()).await;

        let b = StubTransport::new("b");
        session.join(b.clone()).await;

        assert_eq!(router.subscriber_ids().await, vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn test_join_fans_out_joiners_existing_tracks() {
        let session = Session::new("room");
        let b = StubTransport::new("b");
        session.join(b.clone()).await;

        // Tracks published before joining, with no add_router call
        let a = StubTransport::new("a");
        let router = a.publish("cam", 1);
        session.join(a.clone()).await;

        assert_eq!(router.subscriber_ids().await, vec!["b".to_string()]);
        assert!(!router.has_sender("a").await);
    }

    #[tokio::test]
    async fn test_add_router_keeps_existing_sender() {
        let session = Session::new("room");
        let a = StubTransport::new("a");
        let b = StubTransport::new("b");
        session.join(b.clone()).await;
        session.join(a.clone()).await;

        let router = a.publish("cam", 1);
        let first = CountingSender::new("first");
        router.add_sender("b", first.clone()).await;
        session.add_router(&router).await;

        assert_eq!(router.sender_count().await, 1);
        assert_eq!(first.closed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_close_fires_once_when_emptied() {
        let session = Session::new("room");
        let closed = Arc::new(AtomicUsize::new(0));
        let counter = closed.clone();
        session
            .on_close(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .await;

        session.remove_transport("ghost").await;
        assert_eq!(closed.load(Ordering::SeqCst), 0);

        session.add_transport(StubTransport::new("a")).await;
        session.remove_transport("a").await;
        session.remove_transport("a").await;
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stats_lists_transports() {
        let session = Session::new("room");
        session.add_transport(StubTransport::new("a")).await;
        let stats = session.stats().await;
        assert!(stats.contains("session: room"));
        assert!(stats.contains("transport: a"));
    }
}
