// Video decoder strategy set
// Three interchangeable back-ends behind one contract
//
// Selection priority:
// 1. Explicit caller preference
// 2. Best variant the device reports support for
// 3. Fixed default order: webcodecs -> mse -> jmuxer

pub mod annexb;
pub mod jmuxer;
pub mod mse;
pub mod webcodecs;

use crate::surface::RenderSurface;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DecoderError {
    #[error("Failed to initialize decoder: {0}")]
    InitError(String),
    #[error("Decoding failed: {0}")]
    DecodeError(String),
    #[error("Hardware decoder not available")]
    HardwareNotAvailable,
    #[error("Invalid data: {0}")]
    InvalidData(String),
}

impl DecoderError {
    /// Whether the session can keep running after this error.
    /// Transient faults recover at the next keyframe; the rest are terminal.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::DecodeError(_) | Self::InvalidData(_))
    }
}

/// Decoder back-end identifier
///
/// The string forms are stable: they are what device agents report in their
/// capability list and what stored user preferences contain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecoderType {
    /// Software mux: assembles the raw NAL stream into timed frames
    Jmuxer,
    /// Hardware-accelerated path via the surface's codec sink
    Webcodecs,
    /// Media-source path: init segment plus batched media segments
    Mse,
}

/// Fixed fallback precedence: hardware first, software mux last
pub const FALLBACK_ORDER: [DecoderType; 3] =
    [DecoderType::Webcodecs, DecoderType::Mse, DecoderType::Jmuxer];

impl DecoderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecoderType::Jmuxer => "jmuxer",
            DecoderType::Webcodecs => "webcodecs",
            DecoderType::Mse => "mse",
        }
    }
}

impl fmt::Display for DecoderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DecoderType {
    type Err = DecoderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "jmuxer" => Ok(Self::Jmuxer),
            "webcodecs" => Ok(Self::Webcodecs),
            "mse" => Ok(Self::Mse),
            _ => Err(DecoderError::InvalidData(format!(
                "Unknown decoder type: {}",
                s
            ))),
        }
    }
}

/// Decoder session configuration
///
/// Immutable once a session is created; changing it requires a new session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecoderConfig {
    pub device_id: u64,
    pub device_ip: Option<String>,
    pub width: u32,
    pub height: u32,
    /// Start consuming the stream as soon as the session is created
    pub auto_start: bool,
    /// Nominal stream rate, used to synthesize frame timestamps
    pub fps_hint: u32,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            device_id: 0,
            device_ip: None,
            width: 1920,
            height: 1080,
            auto_start: false,
            fps_hint: 30,
        }
    }
}

impl DecoderConfig {
    pub fn for_device(device_id: u64) -> Self {
        Self {
            device_id,
            ..Self::default()
        }
    }

    /// Frame duration in milliseconds derived from the fps hint
    pub fn frame_duration_ms(&self) -> u64 {
        1000 / self.fps_hint.max(1) as u64
    }
}

/// Decoder paths a device agent reports it can serve
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceCapabilities {
    decoders: Vec<DecoderType>,
}

impl DeviceCapabilities {
    pub fn new(decoders: Vec<DecoderType>) -> Self {
        Self { decoders }
    }

    /// Parse the capability strings carried by the fleet handshake.
    /// Unknown entries are skipped.
    pub fn from_strings<S: AsRef<str>>(strings: &[S]) -> Self {
        let decoders = strings
            .iter()
            .filter_map(|s| match s.as_ref().parse::<DecoderType>() {
                Ok(t) => Some(t),
                Err(_) => {
                    log::debug!("Ignoring unknown capability: {}", s.as_ref());
                    None
                }
            })
            .collect();
        Self { decoders }
    }

    pub fn supports(&self, decoder: DecoderType) -> bool {
        self.decoders.contains(&decoder)
    }

    pub fn is_empty(&self) -> bool {
        self.decoders.is_empty()
    }
}

/// What a back-end hands to the rendering surface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Codec configuration payload preceding media data
    Init,
    Key,
    Delta,
}

/// Packaged frame ready for the surface
#[derive(Debug, Clone)]
pub struct MediaFrame {
    pub kind: FrameKind,
    /// Presentation timestamp in milliseconds
    pub timestamp: u64,
    pub data: Bytes,
    /// Back-end that produced the frame
    pub decoder: DecoderType,
}

impl MediaFrame {
    pub fn init(decoder: DecoderType, data: Bytes) -> Self {
        Self {
            kind: FrameKind::Init,
            timestamp: 0,
            data,
            decoder,
        }
    }

    pub fn key(decoder: DecoderType, timestamp: u64, data: Bytes) -> Self {
        Self {
            kind: FrameKind::Key,
            timestamp,
            data,
            decoder,
        }
    }

    pub fn delta(decoder: DecoderType, timestamp: u64, data: Bytes) -> Self {
        Self {
            kind: FrameKind::Delta,
            timestamp,
            data,
            decoder,
        }
    }

    pub fn is_key(&self) -> bool {
        self.kind == FrameKind::Key
    }
}

/// Decoder back-end trait
///
/// All variants honor the same contract so the console can swap between them
/// transparently: no panics, all failure is a typed `DecoderError`, and a
/// transient error leaves the back-end usable (it resynchronizes at the next
/// keyframe on its own).
pub trait DecodeBackend: Send {
    /// Prepare the back-end and verify the surface accepts this decode path.
    /// Fails fast rather than silently degrading.
    fn init(
        &mut self,
        config: &DecoderConfig,
        surface: &dyn RenderSurface,
    ) -> Result<(), DecoderError>;

    /// Consume raw stream bytes, producing zero or more frames for the surface
    fn push(&mut self, data: &[u8]) -> Result<Vec<MediaFrame>, DecoderError>;

    /// Drain buffered output
    fn flush(&mut self) -> Vec<MediaFrame>;

    /// Drop buffered state; output resumes at the next keyframe
    fn reset(&mut self);

    /// Get back-end info
    fn info(&self) -> &str;
}

/// Create the back-end for a decoder type
pub fn create_backend(decoder: DecoderType) -> Box<dyn DecodeBackend> {
    match decoder {
        DecoderType::Jmuxer => Box::new(jmuxer::JmuxerBackend::new()),
        DecoderType::Webcodecs => Box::new(webcodecs::WebcodecsBackend::new()),
        DecoderType::Mse => Box::new(mse::MseBackend::new()),
    }
}

/// Pick the decoder type for a session
///
/// Precedence: explicit caller preference, else the first variant of the
/// fixed order the device reports support for, else the fixed default order.
pub fn select_decoder(
    capabilities: Option<&DeviceCapabilities>,
    preferred: Option<DecoderType>,
) -> DecoderType {
    if let Some(preferred) = preferred {
        log::info!("Using caller-preferred decoder: {}", preferred);
        return preferred;
    }

    if let Some(caps) = capabilities {
        for candidate in FALLBACK_ORDER {
            if caps.supports(candidate) {
                log::info!("Using capability-matched decoder: {}", candidate);
                return candidate;
            }
        }
        log::warn!("Device reports no known decoder capability, using default order");
    }

    FALLBACK_ORDER[0]
}

/// The next variant to try after `decoder`, per the fixed order
pub fn fallback_after(decoder: DecoderType) -> Option<DecoderType> {
    let pos = FALLBACK_ORDER.iter().position(|t| *t == decoder)?;
    FALLBACK_ORDER.get(pos + 1).copied()
}
