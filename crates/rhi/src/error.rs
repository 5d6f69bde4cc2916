//! RHI-specific error types.

use std::time::Duration;

use thiserror::Error;

/// RHI-specific error type.
///
/// Errors fall into two groups. Recoverable ones ([`is_recoverable`](Self::is_recoverable))
/// leave the device usable: the caller retries, recreates the swapchain or grabs
/// another descriptor pool. Fatal ones ([`is_fatal`](Self::is_fatal)) mean the device
/// can no longer be trusted and the renderer should shut down.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RhiError {
    /// A fence or acquire wait did not complete in time
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// The swapchain no longer matches the surface
    #[error("Swapchain is out of date")]
    OutOfDate,

    /// The presentation surface went away
    #[error("Surface lost")]
    SurfaceLost,

    /// The device stopped responding
    #[error("Device lost: {0}")]
    DeviceLost(String),

    /// Device memory exhausted
    #[error("Out of device memory")]
    OutOfDeviceMemory,

    /// Host memory exhausted
    #[error("Out of host memory")]
    OutOfHostMemory,

    /// Descriptor pool has no room left for the requested set
    #[error("Descriptor pool exhausted")]
    OutOfPoolMemory,

    /// Descriptor pool has room but it is fragmented
    #[error("Descriptor pool fragmented")]
    FragmentedPool,

    /// Shader module loading error
    #[error("Shader error: {0}")]
    ShaderError(String),

    /// Pipeline creation error
    #[error("Pipeline error: {0}")]
    PipelineError(String),

    /// Invalid handle error
    #[error("Invalid handle: {0}")]
    InvalidHandle(String),

    /// An operation was issued out of order or with bad arguments
    #[error("Invalid usage: {0}")]
    InvalidUsage(String),
}

impl RhiError {
    /// Whether the caller can carry on after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            RhiError::Timeout(_)
                | RhiError::OutOfDate
                | RhiError::OutOfPoolMemory
                | RhiError::FragmentedPool
        )
    }

    /// Whether the device must be considered unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RhiError::DeviceLost(_)
                | RhiError::SurfaceLost
                | RhiError::OutOfDeviceMemory
                | RhiError::OutOfHostMemory
        )
    }
}

/// Result type alias for RHI operations.
pub type RhiResult<T> = std::result::Result<T, RhiError>;
