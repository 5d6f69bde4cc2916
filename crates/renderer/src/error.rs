//! Error types for the renderer.

use thiserror::Error;

use renderer_assets::AssetError;
use renderer_rhi::RhiError;

/// Error type for engine-level operations.
#[derive(Error, Debug)]
pub enum RenderError {
    /// GPU backend failure.
    #[error(transparent)]
    Rhi(#[from] RhiError),

    /// Asset could not be read or decoded.
    #[error(transparent)]
    Asset(#[from] AssetError),

    /// Configuration or variable registry failure.
    #[error(transparent)]
    Core(#[from] renderer_core::Error),

    /// Lookup of a resource that was never registered.
    #[error("Unknown {kind} '{name}'")]
    UnknownResource { kind: &'static str, name: String },

    /// More render objects than the per-frame object buffer holds.
    #[error("Object buffer holds {capacity} objects, {count} requested")]
    TooManyObjects { count: usize, capacity: u32 },

    /// An asset the GPU path cannot use.
    #[error("Unsupported asset: {0}")]
    Unsupported(String),

    /// A frame operation was called out of protocol order.
    #[error("Frame protocol violation: {0}")]
    FrameOrder(&'static str),

    /// The renderer was used after `shutdown`.
    #[error("Renderer has been shut down")]
    ShutDown,
}

impl RenderError {
    /// Returns true if the device is gone and the renderer cannot continue.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RenderError::Rhi(e) if e.is_fatal())
    }
}

/// Result type alias using [`RenderError`].
pub type RenderResult<T> = Result<T, RenderError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(RenderError::from(RhiError::DeviceLost("reset".to_string())).is_fatal());
        assert!(!RenderError::from(RhiError::OutOfDate).is_fatal());
        assert!(!RenderError::ShutDown.is_fatal());
    }

    #[test]
    fn test_unknown_resource_message() {
        let err = RenderError::UnknownResource {
            kind: "mesh",
            name: "monkey".to_string(),
        };
        assert_eq!(err.to_string(), "Unknown mesh 'monkey'");
    }
}
