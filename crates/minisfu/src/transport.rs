//! WebRTC transport
//!
//! `Transport` and `Sender` implementations over a `webrtc` peer connection.
//! Forwarding uses `TrackLocalStaticRTP` so packets reach subscribers with
//! their packetization untouched.

use std::fmt::Write;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tokio::sync::RwLock;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};
use webrtc::track::track_remote::TrackRemote;

use crate::error::TransportError;
use crate::router::{Router, Sender, Track};
use crate::session::{Session, Transport};

const RECEIVER_READY_RETRIES: u32 = 50;

/// Forwarding path into one subscriber's peer connection.
pub struct WebRtcSender {
    id: String,
    local_track: Arc<TrackLocalStaticRTP>,
    rtp_sender: Arc<RTCRtpSender>,
    peer_connection: Weak<RTCPeerConnection>,
}

#[async_trait]
impl Sender for WebRtcSender {
    fn id(&self) -> &str {
        &self.id
    }

    async fn write_rtp(&self, packet: &Packet) -> Result<(), TransportError> {
        self.local_track.write_rtp(packet).await?;
        Ok(())
    }

    async fn close(&self) {
        let Some(pc) = self.peer_connection.upgrade() else {
            return;
        };
        if pc.connection_state() == RTCPeerConnectionState::Closed {
            return;
        }
        if let Err(e) = pc.remove_track(&self.rtp_sender).await {
            tracing::warn!("Error removing track {} from peer connection: {}", self.id, e);
        }
    }
}

pub struct WebRtcTransport {
    id: String,
    peer_connection: Arc<RTCPeerConnection>,
    /// Routers for the tracks this transport publishes
    routers: RwLock<Vec<Arc<Router>>>,
    forward_log_interval: u64,
}

impl WebRtcTransport {
    pub fn new(
        id: impl Into<String>,
        peer_connection: Arc<RTCPeerConnection>,
        forward_log_interval: u64,
    ) -> Self {
        Self {
            id: id.into(),
            peer_connection,
            routers: RwLock::new(vec![]),
            forward_log_interval,
        }
    }

    pub fn peer_connection(&self) -> &Arc<RTCPeerConnection> {
        &self.peer_connection
    }

    /// Route a track received from the remote peer: register a router for
    /// it, fan it out to the session and start the forwarding loop.
    pub async fn publish(&self, session: &Session, remote: Arc<TrackRemote>) -> Arc<Router> {
        let router = Arc::new(Router::new(&self.id, Track::from_remote(&remote)));

        tracing::info!(
            "Received track {} ({:?}, ssrc {}) from transport {} in session {}",
            router.track().id,
            router.track().kind,
            router.track().ssrc,
            self.id,
            session.id()
        );

        self.add_router(router.clone()).await;
        session.add_router(&router).await;

        tokio::spawn(forward(router.clone(), remote, self.forward_log_interval));

        router
    }

    pub async fn add_router(&self, router: Arc<Router>) {
        self.routers.write().await.push(router);
    }

    /// Take every published router off this transport.
    pub async fn remove_routers(&self) -> Vec<Arc<Router>> {
        self.routers.write().await.drain(..).collect()
    }

    /// Close owned routers and the peer connection. Call after the transport
    /// has left its session.
    pub async fn close(&self) -> Result<(), TransportError> {
        for router in self.remove_routers().await {
            router.close().await;
        }

        self.peer_connection.close().await?;
        tracing::info!("Closed transport {}", self.id);
        Ok(())
    }
}

#[async_trait]
impl Transport for WebRtcTransport {
    fn id(&self) -> &str {
        &self.id
    }

    async fn routers(&self) -> Vec<Arc<Router>> {
        self.routers.read().await.clone()
    }

    async fn new_sender(&self, track: &Track) -> Result<Arc<dyn Sender>, TransportError> {
        if self.peer_connection.connection_state() == RTCPeerConnectionState::Closed {
            return Err(TransportError::Closed);
        }
        if track.codec.capability.mime_type.is_empty() {
            return Err(TransportError::NoCodec(track.id.clone()));
        }

        let sender_id = format!("{}-{}", track.id, self.id);
        let local_track = Arc::new(TrackLocalStaticRTP::new(
            track.codec.capability.clone(),
            sender_id.clone(),
            track.stream_id.clone(),
        ));

        let rtp_sender = self
            .peer_connection
            .add_track(Arc::clone(&local_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await?;

        // Incoming RTCP must be drained for the interceptors to run
        let rtcp_sender = rtp_sender.clone();
        tokio::spawn(async move {
            let mut rtcp_buf = vec![0u8; 1500];
            while let Ok((_, _)) = rtcp_sender.read(&mut rtcp_buf).await {}
        });

        Ok(Arc::new(WebRtcSender {
            id: sender_id,
            local_track,
            rtp_sender,
            peer_connection: Arc::downgrade(&self.peer_connection),
        }))
    }

    async fn stats(&self) -> String {
        let mut info = format!(
            "  transport: {} ({})\n",
            self.id,
            self.peer_connection.connection_state()
        );

        for router in self.routers.read().await.iter() {
            let _ = writeln!(
                info,
                "    track: {} ssrc {} subscribers {}",
                router.track().id,
                router.track().ssrc,
                router.sender_count().await
            );
        }

        info
    }
}

/// Read RTP from the publisher's track and copy it to every subscriber
/// until the track ends.
async fn forward(router: Arc<Router>, remote: Arc<TrackRemote>, log_interval: u64) {
    tracing::info!(
        "Starting RTP forwarding for track {} from transport {}",
        router.track().id,
        router.owner_transport_id()
    );

    let mut packet_count = 0u64;
    let mut retry_count = 0u32;

    loop {
        match remote.read_rtp().await {
            Ok((packet, _attributes)) => {
                packet_count += 1;
                if log_interval > 0 && (packet_count - 1) % log_interval == 0 {
                    tracing::debug!(
                        "Forwarding RTP packet {} of track {} (seq: {}) to {} subscribers",
                        packet_count,
                        router.track().id,
                        packet.header.sequence_number,
                        router.sender_count().await
                    );
                }
                router.forward_rtp(&packet).await;
            }
            Err(e) => {
                // The receiver may not be attached right after on_track fires
                if matches!(e, webrtc::Error::ErrRTPReceiverNil)
                    && retry_count < RECEIVER_READY_RETRIES
                {
                    retry_count += 1;
                    tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
                    continue;
                }

                tracing::info!(
                    "Source track {} ended after {} packets: {}",
                    router.track().id,
                    packet_count,
                    e
                );
                break;
            }
        }
    }
}
