//! minisfu
//!
//! Routing core of a selective forwarding unit. Each client publishes
//! tracks into a session; the SFU forwards every track to all other
//! participants without any processing or transcoding.

pub mod config;
pub mod error;
pub mod media_engine;
pub mod router;
pub mod session;
pub mod sfu;
pub mod transport;

pub use config::SfuConfig;
pub use error::{NegotiationError, Result, SfuError, TransportError};
pub use media_engine::{CodecRegistry, MediaEngine};
pub use router::{Router, Sender, Track};
pub use session::{Session, Transport};
pub use sfu::Sfu;
pub use transport::{WebRtcSender, WebRtcTransport};
