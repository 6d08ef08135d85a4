// error.rs — crate-wide error type.
//
// Every fallible operation returns `Result<T>`. Nothing here is retried:
// errors surface to the immediate caller, who decides whether to retry,
// reroute through a host-only path, or abort.

use thiserror::Error;

use crate::depth::Depth;

#[derive(Debug, Error)]
pub enum Error {
    /// The device cannot satisfy a shape/depth request (budget, limits, OOM).
    #[error("allocation failed: {0}")]
    Allocation(String),

    /// Host ↔ device copy failed.
    #[error("transfer failed: {0}")]
    Transfer(String),

    /// A caller-supplied buffer does not match the required size, channel
    /// count or depth. Always a programming error.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// Opaque failure reported by the device while running an operation.
    #[error("device error: {0}")]
    Device(String),

    /// The backend has no kernel for this operation at this depth.
    #[error("{op} is not supported for {depth} on this device")]
    Unsupported { op: &'static str, depth: Depth },

    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    pub(crate) fn shape(msg: impl Into<String>) -> Self {
        Self::ShapeMismatch(msg.into())
    }

    pub(crate) fn device(msg: impl Into<String>) -> Self {
        Self::Device(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
