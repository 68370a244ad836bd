//! Track Router
//!
//! One router per published track. Holds the forwarding path ("sender") of
//! every transport subscribed to that track and copies RTP packets to them
//! unchanged.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecParameters, RTPCodecType};
use webrtc::track::track_remote::TrackRemote;

use crate::error::TransportError;

/// Identifying metadata of a published stream.
#[derive(Debug, Clone)]
pub struct Track {
    pub id: String,
    pub stream_id: String,
    pub ssrc: u32,
    pub kind: RTPCodecType,
    pub codec: RTCRtpCodecParameters,
}

impl Track {
    pub fn from_remote(track: &TrackRemote) -> Self {
        Self {
            id: track.id().to_string(),
            stream_id: track.stream_id().to_string(),
            ssrc: track.ssrc(),
            kind: track.kind(),
            codec: track.codec(),
        }
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }
}

/// One active forwarding path from a router to a subscriber transport.
#[async_trait]
pub trait Sender: Send + Sync {
    fn id(&self) -> &str;

    async fn write_rtp(&self, packet: &Packet) -> Result<(), TransportError>;

    /// Stop forwarding. Called once when the router drops the sender.
    async fn close(&self);
}

pub struct Router {
    /// Transport that published the track; never subscribed to it
    owner_transport_id: String,
    track: Track,
    /// Subscriber transport ID -> forwarding path.
    ///
    /// Only mutated from inside `Session` operations, which already hold the
    /// session write lock. The lock here lets the forwarding task read.
    senders: RwLock<HashMap<String, Arc<dyn Sender>>>,
}

impl Router {
    pub fn new(owner_transport_id: impl Into<String>, track: Track) -> Self {
        Self {
            owner_transport_id: owner_transport_id.into(),
            track,
            senders: RwLock::new(HashMap::new()),
        }
    }

    pub fn owner_transport_id(&self) -> &str {
        &self.owner_transport_id
    }

    pub fn track(&self) -> &Track {
        &self.track
    }

    /// Bind a forwarding path to a subscriber, replacing any previous one.
    pub async fn add_sender(&self, subscriber_id: &str, sender: Arc<dyn Sender>) {
        if subscriber_id == self.owner_transport_id {
            tracing::warn!(
                "Refusing to subscribe transport {} to its own track {}",
                subscriber_id,
                self.track.id
            );
            return;
        }

        let previous = self
            .senders
            .write()
            .await
            .insert(subscriber_id.to_string(), sender);

        if let Some(previous) = previous {
            previous.close().await;
        }

        tracing::info!(
            "Added subscriber {} to track {} (ssrc {}, publisher: {})",
            subscriber_id,
            self.track.id,
            self.track.ssrc,
            self.owner_transport_id
        );
    }

    /// Remove the forwarding path of a subscriber. Returns whether one existed.
    pub async fn del_sub(&self, subscriber_id: &str) -> bool {
        let removed = self.senders.write().await.remove(subscriber_id);

        match removed {
            Some(sender) => {
                sender.close().await;
                tracing::info!(
                    "Removed subscriber {} from track {}",
                    subscriber_id,
                    self.track.id
                );
                true
            }
            None => false,
        }
    }

    pub async fn subscriber_ids(&self) -> Vec<String> {
        self.senders.read().await.keys().cloned().collect()
    }

    pub async fn sender_count(&self) -> usize {
        self.senders.read().await.len()
    }

    pub async fn has_sender(&self, subscriber_id: &str) -> bool {
        self.senders.read().await.contains_key(subscriber_id)
    }

    /// Forward an RTP packet to all subscribers
    pub async fn forward_rtp(&self, packet: &Packet) {
        let senders = self.senders.read().await;

        for (subscriber_id, sender) in senders.iter() {
            if let Err(e) = sender.write_rtp(packet).await {
                tracing::warn!(
                    "Failed to forward RTP to subscriber {}: {}",
                    subscriber_id,
                    e
                );
            }
        }
    }

    /// Close and drop every sender.
    pub async fn close(&self) {
        let senders: Vec<_> = self.senders.write().await.drain().collect();
        for (_, sender) in senders {
            sender.close().await;
        }
        tracing::info!("Track router {} closed", self.track.id);
    }
}
