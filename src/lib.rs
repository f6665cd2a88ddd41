// Fleet Console - live device screens with pluggable video decoders
// Main library entry point

pub mod console;
pub mod decoder;
pub mod events;
pub mod prefs;
pub mod surface;
pub mod transport;

pub use console::{DecoderConsole, SessionHandle, SessionId, SessionState};
pub use decoder::{
    select_decoder, DecoderConfig, DecoderType, DeviceCapabilities, FrameKind, MediaFrame,
};
pub use events::{DecoderEvent, EventReceiver};
pub use prefs::{DashboardPrefs, PrefsStore};
pub use surface::RenderSurface;
pub use transport::{StreamChunk, StreamConnection, StreamSource};
