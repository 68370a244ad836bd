//! Codec negotiation
//!
//! Derives the codec set the relay forwards from a remote session description.
//! Only Opus, VP8, VP9 and H.264 are recognized; every one of those families
//! ends up registered, either with the negotiated parameters or a default.

use std::io::Cursor;

use webrtc::api::media_engine::{
    MediaEngine as RtcMediaEngine, MIME_TYPE_H264, MIME_TYPE_OPUS, MIME_TYPE_VP8, MIME_TYPE_VP9,
};
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType};
use webrtc::rtp_transceiver::RTCPFeedback;
use webrtc::sdp::description::session::SessionDescription;

use crate::error::NegotiationError;

const MEDIA_NAME_AUDIO: &str = "audio";
const MEDIA_NAME_VIDEO: &str = "video";

pub const DEFAULT_PAYLOAD_TYPE_OPUS: u8 = 111;
pub const DEFAULT_PAYLOAD_TYPE_VP8: u8 = 96;
pub const DEFAULT_PAYLOAD_TYPE_VP9: u8 = 98;
pub const DEFAULT_PAYLOAD_TYPE_H264: u8 = 102;

const OPUS_CLOCK_RATE: u32 = 48000;
const VIDEO_CLOCK_RATE: u32 = 90000;
const OPUS_CHANNELS: u16 = 2;

/// Dynamic RTP payload type range.
const DYNAMIC_PAYLOAD_TYPES: std::ops::RangeInclusive<u8> = 96..=127;

/// The codec families the relay knows how to forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecFamily {
    Opus,
    Vp8,
    Vp9,
    H264,
}

impl CodecFamily {
    pub const ALL: [CodecFamily; 4] = [
        CodecFamily::Opus,
        CodecFamily::Vp8,
        CodecFamily::Vp9,
        CodecFamily::H264,
    ];

    /// Case-insensitive lookup by rtpmap encoding name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|family| family.name().eq_ignore_ascii_case(name))
    }

    pub fn name(self) -> &'static str {
        match self {
            CodecFamily::Opus => "opus",
            CodecFamily::Vp8 => "VP8",
            CodecFamily::Vp9 => "VP9",
            CodecFamily::H264 => "H264",
        }
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            CodecFamily::Opus => MIME_TYPE_OPUS,
            CodecFamily::Vp8 => MIME_TYPE_VP8,
            CodecFamily::Vp9 => MIME_TYPE_VP9,
            CodecFamily::H264 => MIME_TYPE_H264,
        }
    }

    pub fn kind(self) -> RTPCodecType {
        match self {
            CodecFamily::Opus => RTPCodecType::Audio,
            _ => RTPCodecType::Video,
        }
    }

    fn default_payload_type(self) -> u8 {
        match self {
            CodecFamily::Opus => DEFAULT_PAYLOAD_TYPE_OPUS,
            CodecFamily::Vp8 => DEFAULT_PAYLOAD_TYPE_VP8,
            CodecFamily::Vp9 => DEFAULT_PAYLOAD_TYPE_VP9,
            CodecFamily::H264 => DEFAULT_PAYLOAD_TYPE_H264,
        }
    }

    fn default_clock_rate(self) -> u32 {
        match self {
            CodecFamily::Opus => OPUS_CLOCK_RATE,
            _ => VIDEO_CLOCK_RATE,
        }
    }
}

/// Feedback mechanisms attached to every registered codec.
pub fn rtcp_feedback() -> Vec<RTCPFeedback> {
    [
        ("goog-remb", ""),
        ("ccm", "fir"),
        ("nack", ""),
        ("nack", "pli"),
        ("transport-cc", ""),
    ]
    .into_iter()
    .map(|(typ, parameter)| RTCPFeedback {
        typ: typ.to_string(),
        parameter: parameter.to_string(),
    })
    .collect()
}

/// Build codec parameters for a family. Audio never carries an fmtp line.
pub fn codec_parameters(
    family: CodecFamily,
    payload_type: u8,
    clock_rate: u32,
    channels: u16,
    fmtp: &str,
) -> RTCRtpCodecParameters {
    let (channels, sdp_fmtp_line) = match family.kind() {
        RTPCodecType::Audio => (channels, String::new()),
        _ => (0, fmtp.to_string()),
    };

    RTCRtpCodecParameters {
        capability: RTCRtpCodecCapability {
            mime_type: family.mime_type().to_string(),
            clock_rate,
            channels,
            sdp_fmtp_line,
            rtcp_feedback: rtcp_feedback(),
        },
        payload_type,
        ..Default::default()
    }
}

/// Codecs keyed by media kind and payload type.
#[derive(Debug, Clone, Default)]
pub struct CodecRegistry {
    audio: Vec<RTCRtpCodecParameters>,
    video: Vec<RTCRtpCodecParameters>,
}

impl CodecRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a codec. A codec already registered under the same kind and
    /// payload type is replaced.
    pub fn register_codec(&mut self, codec: RTCRtpCodecParameters, kind: RTPCodecType) {
        let codecs = match kind {
            RTPCodecType::Audio => &mut self.audio,
            RTPCodecType::Video => &mut self.video,
            _ => {
                tracing::warn!("Ignoring codec {} of unspecified kind", codec.capability.mime_type);
                return;
            }
        };

        match codecs
            .iter_mut()
            .find(|existing| existing.payload_type == codec.payload_type)
        {
            Some(existing) => *existing = codec,
            None => codecs.push(codec),
        }
    }

    /// Whether any codec, of either kind, already uses `payload_type`.
    pub fn has_payload_type(&self, payload_type: u8) -> bool {
        self.audio
            .iter()
            .chain(self.video.iter())
            .any(|codec| codec.payload_type == payload_type)
    }

    /// `preferred` if no codec uses it, otherwise the lowest free dynamic
    /// payload type.
    fn free_payload_type(&self, preferred: u8) -> Option<u8> {
        if !self.has_payload_type(preferred) {
            return Some(preferred);
        }
        DYNAMIC_PAYLOAD_TYPES.find(|pt| !self.has_payload_type(*pt))
    }

    pub fn codecs(&self, kind: RTPCodecType) -> &[RTCRtpCodecParameters] {
        match kind {
            RTPCodecType::Audio => &self.audio,
            RTPCodecType::Video => &self.video,
            _ => &[],
        }
    }

    /// Codecs whose MIME subtype matches `name`, ignoring case.
    pub fn codecs_by_name(&self, name: &str) -> Vec<&RTCRtpCodecParameters> {
        self.audio
            .iter()
            .chain(self.video.iter())
            .filter(|codec| {
                let mime = codec.capability.mime_type.as_str();
                let subtype = mime.split_once('/').map_or(mime, |(_, subtype)| subtype);
                subtype.eq_ignore_ascii_case(name)
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.audio.len() + self.video.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Register every codec into a `webrtc` media engine for building an API.
    pub fn into_rtc_media_engine(self) -> Result<RtcMediaEngine, NegotiationError> {
        let mut engine = RtcMediaEngine::default();

        for codec in self.audio {
            engine
                .register_codec(codec, RTPCodecType::Audio)
                .map_err(NegotiationError::Engine)?;
        }
        for codec in self.video {
            engine
                .register_codec(codec, RTPCodecType::Video)
                .map_err(NegotiationError::Engine)?;
        }

        Ok(engine)
    }
}

/// Codec negotiator wrapping a [`CodecRegistry`].
#[derive(Debug, Clone, Default)]
pub struct MediaEngine {
    registry: CodecRegistry,
}

impl MediaEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registry(&self) -> &CodecRegistry {
        &self.registry
    }

    pub fn into_registry(self) -> CodecRegistry {
        self.registry
    }

    pub fn populate_from_description(
        &mut self,
        description: &RTCSessionDescription,
    ) -> Result<(), NegotiationError> {
        self.populate_from_sdp(&description.sdp)
    }

    /// Register the codecs offered by `sdp`, then fill in a default for every
    /// family the description did not provide.
    ///
    /// On error nothing is registered.
    pub fn populate_from_sdp(&mut self, sdp: &str) -> Result<(), NegotiationError> {
        let description = SessionDescription::unmarshal(&mut Cursor::new(sdp.as_bytes()))
            .map_err(|e| NegotiationError::Parse(e.to_string()))?;

        let mut registry = self.registry.clone();

        for media in &description.media_descriptions {
            let media_name = media.media_name.media.as_str();
            if media_name != MEDIA_NAME_AUDIO && media_name != MEDIA_NAME_VIDEO {
                continue;
            }

            for format in &media.media_name.formats {
                let payload_type: u8 = format
                    .parse()
                    .map_err(|_| NegotiationError::InvalidFormat(format.clone()))?;

                let codec = description
                    .get_codec_for_payload_type(payload_type)
                    .map_err(|_| NegotiationError::UnknownPayloadType(payload_type))?;

                let Some(family) = CodecFamily::from_name(&codec.name) else {
                    tracing::debug!("Ignoring codec {} (payload type {})", codec.name, payload_type);
                    continue;
                };

                let channels = codec.encoding_parameters.parse().unwrap_or(OPUS_CHANNELS);
                registry.register_codec(
                    codec_parameters(family, payload_type, codec.clock_rate, channels, &codec.fmtp),
                    family.kind(),
                );
            }
        }

        for family in CodecFamily::ALL {
            if !registry.codecs_by_name(family.name()).is_empty() {
                continue;
            }

            // A default never takes the payload type of a negotiated codec
            let Some(payload_type) = registry.free_payload_type(family.default_payload_type())
            else {
                tracing::warn!("No free payload type left for default {}", family.name());
                continue;
            };

            tracing::debug!(
                "No {} in remote description, registering default payload type {}",
                family.name(),
                payload_type
            );
            registry.register_codec(
                codec_parameters(
                    family,
                    payload_type,
                    family.default_clock_rate(),
                    OPUS_CHANNELS,
                    "",
                ),
                family.kind(),
            );
        }

        self.registry = registry;
        Ok(())
    }
}
