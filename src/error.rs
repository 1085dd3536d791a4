//! Error types for rtb-bridge

use thiserror::Error;

/// Errors that can occur at the bridge boundary
///
/// Every native null or failure return is converted into one of these
/// variants by the engine proxy; host code never sees a raw null.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Engine bootstrap failed (bad path, bad content, or null native return)
    #[error("Failed to initialize engine from '{bootstrap}': {reason}")]
    Initialization {
        bootstrap: String,
        reason: String,
    },

    /// Handle was never created here, or was already released explicitly
    #[error("Invalid handle: {0}")]
    InvalidHandle(String),

    /// An active agent with this name already exists under the system
    #[error("Duplicate agent name: {0}")]
    DuplicateAgentName(String),

    /// Operation attempted on a released handle
    #[error("Use after free: {0}")]
    UseAfterFree(String),

    /// Opaque native failure
    #[error("Engine error {code}: {message}")]
    Engine {
        code: i32,
        message: String,
    },

    /// Agent or handler lookup failed
    #[error("Not found: {0}")]
    NotFound(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Dispatch loop management failure
    #[error("Dispatch error: {0}")]
    Dispatch(String),

    /// Internal lock poisoned by a panicking thread
    #[error("Lock poisoned: {0}")]
    Lock(String),
}

impl BridgeError {
    /// Whether the caller can reasonably retry with a different name or handle
    ///
    /// Bootstrap and engine failures are fatal for whatever depends on the
    /// system handle.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            BridgeError::InvalidHandle(_)
                | BridgeError::DuplicateAgentName(_)
                | BridgeError::NotFound(_)
        )
    }
}

/// Result type alias for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;
