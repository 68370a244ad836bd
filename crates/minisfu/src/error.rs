use thiserror::Error;

/// Failure while deriving a codec set from a remote session description.
///
/// Negotiation is all-or-nothing: any of these aborts the attempt and
/// leaves the engine's registry as it was.
#[derive(Error, Debug)]
pub enum NegotiationError {
    #[error("Malformed session description: {0}")]
    Parse(String),

    #[error("Format parse error: {0:?} is not a payload type")]
    InvalidFormat(String),

    #[error("Could not find codec for payload type {0}")]
    UnknownPayloadType(u8),

    #[error("Media engine error: {0}")]
    Engine(webrtc::Error),
}

/// Failure reported by a transport or one of its senders.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Transport is closed")]
    Closed,

    #[error("No codec registered for {0}")]
    NoCodec(String),

    #[error("WebRTC error: {0}")]
    WebRtc(#[from] webrtc::Error),
}

#[derive(Error, Debug)]
pub enum SfuError {
    #[error("Negotiation failed: {0}")]
    Negotiation(#[from] NegotiationError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("WebRTC error: {0}")]
    WebRtc(#[from] webrtc::Error),

    #[error("Transport {0} already joined session {1}")]
    DuplicateTransport(String, String),
}

pub type Result<T> = std::result::Result<T, SfuError>;
