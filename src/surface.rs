// Rendering surface seam
// The Host UI owns the visual region; sessions drive it through this trait

use crate::decoder::{DecoderType, MediaFrame};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SurfaceError {
    #[error("Surface unavailable: {0}")]
    Unavailable(String),
    #[error("Surface rejected frame: {0}")]
    Rejected(String),
}

/// A host-owned rendering surface
///
/// One surface is exclusively owned by the single active session for its
/// console region; the console enforces this by stopping the prior session
/// before the next back-end submits to it.
pub trait RenderSurface: Send + Sync {
    /// Whether the surface can present frames from this decoder path.
    /// Back-ends check this in `init` and fail fast when unsupported.
    fn supports(&self, decoder: DecoderType) -> bool;

    /// Present a packaged frame
    fn submit(&self, frame: MediaFrame) -> Result<(), SurfaceError>;

    /// Release everything the session bound to the surface
    fn clear(&self);
}
