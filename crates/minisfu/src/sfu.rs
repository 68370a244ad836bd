//! SFU Session Manager
//!
//! Owns every live session, negotiates peer connections for transports
//! joining them and drops a session once its last transport leaves.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

use tokio::sync::{mpsc, RwLock};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::APIBuilder;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::config::SfuConfig;
use crate::error::{Result, SfuError, TransportError};
use crate::media_engine::MediaEngine;
use crate::session::{Session, Transport};
use crate::transport::WebRtcTransport;

type TransportKey = (String, String);

pub struct Sfu {
    config: SfuConfig,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    /// (session ID, transport ID) -> transport. `None` while connecting.
    transports: RwLock<HashMap<TransportKey, Option<Arc<WebRtcTransport>>>>,
    /// Sessions whose last transport left, waiting to be dropped
    emptied: mpsc::UnboundedSender<Weak<Session>>,
}

impl Sfu {
    /// Create the manager and start its session reaper. Must be called from
    /// within a Tokio runtime.
    pub fn new(config: SfuConfig) -> Arc<Self> {
        let (emptied, mut emptied_rx) = mpsc::unbounded_channel::<Weak<Session>>();
        let sfu = Arc::new(Self {
            config,
            sessions: RwLock::new(HashMap::new()),
            transports: RwLock::new(HashMap::new()),
            emptied,
        });

        let weak_sfu = Arc::downgrade(&sfu);
        tokio::spawn(async move {
            while let Some(session) = emptied_rx.recv().await {
                let Some(sfu) = weak_sfu.upgrade() else {
                    break;
                };
                if let Some(session) = session.upgrade() {
                    sfu.reap(&session).await;
                }
            }
        });

        sfu
    }

    pub fn config(&self) -> &SfuConfig {
        &self.config
    }

    /// Get or create a session
    pub async fn get_or_create_session(&self, session_id: &str) -> Arc<Session> {
        let mut sessions = self.sessions.write().await;
        self.session_entry(&mut sessions, session_id).await
    }

    async fn session_entry(
        &self,
        sessions: &mut HashMap<String, Arc<Session>>,
        session_id: &str,
    ) -> Arc<Session> {
        if let Some(session) = sessions.get(session_id) {
            return session.clone();
        }

        let session = Arc::new(Session::new(session_id));
        self.register_close_hook(&session).await;
        sessions.insert(session_id.to_string(), session.clone());
        tracing::info!("Created new SFU session {}", session_id);

        session
    }

    pub async fn session(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(session_id).cloned()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    async fn register_close_hook(&self, session: &Arc<Session>) {
        let emptied = self.emptied.clone();
        let weak_session = Arc::downgrade(session);

        session
            .on_close(move || {
                let _ = emptied.send(weak_session);
            })
            .await;
    }

    /// Drop an emptied session. A session that gained members again before
    /// this ran is kept and re-armed.
    async fn reap(&self, session: &Arc<Session>) {
        let mut sessions = self.sessions.write().await;

        let is_current = sessions
            .get(session.id())
            .is_some_and(|current| Arc::ptr_eq(current, session));
        if !is_current {
            return;
        }

        if session.is_empty().await {
            sessions.remove(session.id());
            tracing::info!("Removed SFU session {}", session.id());
        } else {
            tracing::debug!("Session {} was revived, keeping it", session.id());
            self.register_close_hook(session).await;
        }
    }

    /// Claim `key` for a connect in progress.
    async fn reserve_transport(&self, key: &TransportKey) -> Result<()> {
        match self.transports.write().await.entry(key.clone()) {
            Entry::Occupied(_) => Err(SfuError::DuplicateTransport(
                key.1.clone(),
                key.0.clone(),
            )),
            Entry::Vacant(slot) => {
                slot.insert(None);
                Ok(())
            }
        }
    }

    /// Negotiate a peer connection for `transport_id` from its offer and join
    /// it to the session. Returns the transport and the local answer.
    ///
    /// On failure the session is left as it was and the peer connection, if
    /// one was created, is closed.
    pub async fn connect(
        self: &Arc<Self>,
        session_id: &str,
        transport_id: &str,
        offer: RTCSessionDescription,
    ) -> Result<(Arc<WebRtcTransport>, RTCSessionDescription)> {
        let key = (session_id.to_string(), transport_id.to_string());
        self.reserve_transport(&key).await?;

        let (transport, answer) = match self.negotiate(&key, offer).await {
            Ok(negotiated) => negotiated,
            Err(e) => {
                self.transports.write().await.remove(&key);
                tracing::warn!(
                    "Failed to connect transport {} to session {}: {}",
                    transport_id,
                    session_id,
                    e
                );
                return Err(e);
            }
        };

        self.transports
            .write()
            .await
            .insert(key, Some(transport.clone()));

        // Joined under the manager lock so the reaper can't drop the session
        // between lookup and join
        {
            let mut sessions = self.sessions.write().await;
            let session = self.session_entry(&mut sessions, session_id).await;
            session.join(transport.clone()).await;
        }

        tracing::info!(
            "Transport {} connected to session {}",
            transport_id,
            session_id
        );

        Ok((transport, answer))
    }

    async fn negotiate(
        self: &Arc<Self>,
        key: &TransportKey,
        offer: RTCSessionDescription,
    ) -> Result<(Arc<WebRtcTransport>, RTCSessionDescription)> {
        let mut media_engine = MediaEngine::new();
        media_engine.populate_from_description(&offer)?;
        let mut rtc_media_engine = media_engine.into_registry().into_rtc_media_engine()?;

        let registry = register_default_interceptors(Registry::new(), &mut rtc_media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(rtc_media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: self.config.ice_servers(),
            ..Default::default()
        };
        let peer_connection = Arc::new(api.new_peer_connection(rtc_config).await?);

        let transport = Arc::new(WebRtcTransport::new(
            &key.1,
            peer_connection.clone(),
            self.config.forward_log_interval,
        ));
        self.wire_handlers(key, &transport);

        match answer(&peer_connection, offer).await {
            Ok(answer) => Ok((transport, answer)),
            Err(e) => {
                if let Err(close_err) = peer_connection.close().await {
                    tracing::warn!(
                        "Error closing peer connection of transport {}: {}",
                        key.1,
                        close_err
                    );
                }
                Err(e)
            }
        }
    }

    fn wire_handlers(self: &Arc<Self>, key: &TransportKey, transport: &Arc<WebRtcTransport>) {
        let peer_connection = transport.peer_connection();

        let sfu = Arc::downgrade(self);
        let weak_transport = Arc::downgrade(transport);
        let sid = key.0.clone();
        peer_connection.on_track(Box::new(move |track, _receiver, _transceiver| {
            let sfu = sfu.upgrade();
            let transport = weak_transport.upgrade();
            let sid = sid.clone();

            Box::pin(async move {
                let (Some(sfu), Some(transport)) = (sfu, transport) else {
                    return;
                };
                match sfu.session(&sid).await {
                    Some(session) => {
                        transport.publish(&session, track).await;
                    }
                    None => tracing::warn!(
                        "Dropping track {} of transport {}: session {} is gone",
                        track.id(),
                        transport.id(),
                        sid
                    ),
                }
            })
        }));

        let sfu = Arc::downgrade(self);
        let weak_transport = Arc::downgrade(transport);
        let key = key.clone();
        peer_connection.on_peer_connection_state_change(Box::new(
            move |state: RTCPeerConnectionState| {
                tracing::debug!("Transport {} connection state: {}", key.1, state);
                if matches!(
                    state,
                    RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed
                ) {
                    if let (Some(sfu), Some(transport)) = (sfu.upgrade(), weak_transport.upgrade())
                    {
                        let key = key.clone();
                        tokio::spawn(async move {
                            if let Err(e) = sfu.detach(&key, Some(&transport)).await {
                                tracing::warn!("Error disconnecting transport {}: {}", key.1, e);
                            }
                        });
                    }
                }
                Box::pin(async {})
            },
        ));
    }

    /// Remove a transport from its session and close it. Returns whether the
    /// transport was known.
    pub async fn disconnect(&self, session_id: &str, transport_id: &str) -> Result<bool> {
        let key = (session_id.to_string(), transport_id.to_string());
        self.detach(&key, None).await
    }

    /// Take the connected transport under `key` out of the manager. With
    /// `expected` set, only that exact transport is removed, so a stale
    /// state callback never tears down a newer connection under the same key.
    async fn detach(
        &self,
        key: &TransportKey,
        expected: Option<&Arc<WebRtcTransport>>,
    ) -> Result<bool> {
        let transport = {
            let mut transports = self.transports.write().await;
            let matches = match (transports.get(key), expected) {
                (Some(Some(current)), Some(expected)) => Arc::ptr_eq(current, expected),
                (Some(Some(_)), None) => true,
                _ => false,
            };
            if !matches {
                return Ok(false);
            }
            transports.remove(key).flatten()
        };
        let Some(transport) = transport else {
            return Ok(false);
        };

        if let Some(session) = self.session(&key.0).await {
            session.remove_transport(&key.1).await;
        }

        transport.close().await?;
        Ok(true)
    }
}

/// Apply the remote offer and produce the local answer once ICE gathering
/// is complete.
async fn answer(
    peer_connection: &RTCPeerConnection,
    offer: RTCSessionDescription,
) -> Result<RTCSessionDescription> {
    peer_connection.set_remote_description(offer).await?;
    let answer = peer_connection.create_answer(None).await?;

    let mut gather_complete = peer_connection.gathering_complete_promise().await;
    peer_connection.set_local_description(answer).await?;
    let _ = gather_complete.recv().await;

    let answer = peer_connection
        .local_description()
        .await
        .ok_or(TransportError::Closed)?;
    Ok(answer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NegotiationError;
    use crate::router::{Router, Sender, Track};
    use crate::session::Transport;
    use async_trait::async_trait;
    use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;

    const AUDIO_OFFER: &str = "v=0\r\n\
        o=- 4215775240449105457 2 IN IP4 127.0.0.1\r\n\
        s=-\r\n\
        t=0 0\r\n\
        m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
        c=IN IP4 0.0.0.0\r\n\
        a=mid:0\r\n\
        a=rtpmap:111 opus/48000/2\r\n";

    struct Member {
        id: String,
    }

    impl Member {
        fn new(id: &str) -> Arc<Self> {
            Arc::new(Self { id: id.to_string() })
        }
    }

    #[async_trait]
    impl Transport for Member {
        fn id(&self) -> &str {
            &self.id
        }

        async fn routers(&self) -> Vec<Arc<Router>> {
            vec![]
        }

        async fn new_sender(&self, _track: &Track) -> std::result::Result<Arc<dyn Sender>, TransportError> {
            Err(TransportError::Closed)
        }

        async fn stats(&self) -> String {
            String::new()
        }
    }

    async fn settle() {
        tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
    }

    fn garbage_offer() -> RTCSessionDescription {
        let mut offer = RTCSessionDescription::default();
        offer.sdp_type = RTCSdpType::Offer;
        offer.sdp = "not a session description".to_string();
        offer
    }

    #[tokio::test]
    async fn test_empty_session_is_dropped() {
        let sfu = Sfu::new(SfuConfig::default());
        let session = sfu.get_or_create_session("room").await;
        assert_eq!(sfu.session_count().await, 1);

        sfu.reap(&session).await;
        assert_eq!(sfu.session_count().await, 0);
        assert!(sfu.session("room").await.is_none());
    }

    #[tokio::test]
    async fn test_last_leave_drops_session() {
        let sfu = Sfu::new(SfuConfig::default());
        let session = sfu.get_or_create_session("room").await;
        session.add_transport(Member::new("a")).await;

        session.remove_transport("a").await;
        settle().await;

        assert_eq!(sfu.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_revived_session_is_kept_and_rearmed() {
        let sfu = Sfu::new(SfuConfig::default());
        let session = sfu.get_or_create_session("room").await;
        session.add_transport(Member::new("a")).await;

        {
            // Hold the reaper off until the session has a member again
            let _sessions = sfu.sessions.read().await;
            session.remove_transport("a").await;
            tokio::task::yield_now().await;
            session.add_transport(Member::new("b")).await;
        }
        settle().await;

        let current = sfu.session("room").await.unwrap();
        assert!(Arc::ptr_eq(&current, &session));

        session.remove_transport("b").await;
        settle().await;
        assert_eq!(sfu.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_get_or_create_returns_same_session() {
        let sfu = Sfu::new(SfuConfig::default());
        let first = sfu.get_or_create_session("room").await;
        let second = sfu.get_or_create_session("room").await;
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_disconnect_unknown_transport() {
        let sfu = Sfu::new(SfuConfig::default());
        assert!(!sfu.disconnect("room", "nobody").await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_negotiation_leaves_no_state() {
        let sfu = Sfu::new(SfuConfig::default());

        let first = sfu.connect("room", "a", garbage_offer()).await;
        assert!(matches!(
            first,
            Err(SfuError::Negotiation(NegotiationError::Parse(_)))
        ));

        // The key was released, so a retry fails the same way
        let second = sfu.connect("room", "a", garbage_offer()).await;
        assert!(matches!(second, Err(SfuError::Negotiation(_))));

        assert_eq!(sfu.session_count().await, 0);
        assert!(sfu.transports.read().await.is_empty());
    }

    #[tokio::test]
    async fn test_failed_answer_closes_peer_connection_and_releases_key() {
        let sfu = Sfu::new(SfuConfig::default());

        // An answer can't be applied to a fresh peer connection
        let not_an_offer = RTCSessionDescription::answer(AUDIO_OFFER.to_string()).unwrap();
        let result = sfu.connect("room", "a", not_an_offer).await;
        assert!(result.is_err());
        assert!(!matches!(result, Err(SfuError::DuplicateTransport(_, _))));

        assert_eq!(sfu.session_count().await, 0);
        assert!(sfu.transports.read().await.is_empty());
    }

    #[tokio::test]
    async fn test_connect_rejects_reserved_key() {
        let sfu = Sfu::new(SfuConfig::default());
        let key = ("room".to_string(), "a".to_string());
        sfu.reserve_transport(&key).await.unwrap();

        let result = sfu.connect("room", "a", garbage_offer()).await;
        assert!(matches!(
            result,
            Err(SfuError::DuplicateTransport(tid, sid)) if tid == "a" && sid == "room"
        ));

        // A rejected duplicate must not release the original reservation
        assert!(sfu.transports.read().await.contains_key(&key));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_reservations_admit_one() {
        let sfu = Sfu::new(SfuConfig::default());

        let mut handles = vec![];
        for _ in 0..16 {
            let sfu = sfu.clone();
            handles.push(tokio::spawn(async move {
                let key = ("room".to_string(), "a".to_string());
                sfu.reserve_transport(&key).await.is_ok()
            }));
        }

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 1);
    }
}
