//! Error types for the relay core

use thiserror::Error;

use crate::endpoint::StreamDirection;

/// Result type alias using RelayError
pub type Result<T> = std::result::Result<T, RelayError>;

/// Everything that can go wrong inside the relay.
///
/// Per-frame failures ([`RelayError::PoolExhausted`],
/// [`RelayError::FormatConstructionFailed`]) are swallowed at the pump
/// boundary. Initialization failures propagate out of
/// [`RelayDevice::new`](crate::relay::RelayDevice::new) and keep the device
/// from ever reporting itself ready.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Every pool slot is checked out
    #[error("frame pool exhausted ({capacity} buffers outstanding)")]
    PoolExhausted { capacity: usize },

    /// The pool could not be allocated at all
    #[error("failed to create frame pool of {capacity} x {buffer_size} bytes")]
    PoolCreationFailed { capacity: usize, buffer_size: usize },

    /// Format or geometry metadata could not be built for a single frame
    #[error("format description failed: {0}")]
    FormatConstructionFailed(String),

    /// A client drove an endpoint through an illegal transition
    #[error("client protocol violation: {0}")]
    ClientProtocolViolation(String),

    /// Device configuration is unusable
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The authorization hook refused a client
    #[error("client {client} not authorized for {direction} stream")]
    Unauthorized {
        client: String,
        direction: StreamDirection,
    },

    /// The device was built outside a tokio runtime
    #[error("relay device must be created inside a tokio runtime")]
    NoRuntime,

    /// Configuration source could not be read or deserialized
    #[error("config error: {0}")]
    Config(#[from] config::ConfigError),
}

impl RelayError {
    /// True for failures that only cost a single frame.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RelayError::PoolExhausted { .. } | RelayError::FormatConstructionFailed(_)
        )
    }

    pub(crate) fn format(msg: impl Into<String>) -> Self {
        Self::FormatConstructionFailed(msg.into())
    }

    pub(crate) fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfiguration(msg.into())
    }
}
