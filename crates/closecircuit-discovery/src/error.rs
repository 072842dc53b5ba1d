//! Error types for the discovery client

use std::net::IpAddr;
use thiserror::Error;

/// Result type alias for discovery operations
pub type Result<T> = std::result::Result<T, DiscoveryError>;

/// Errors that can occur while operating the discovery client
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// Operation requires a listening client
    #[error("Discovery client is not initialized")]
    NotInitialized,

    /// `initialize` called on a client that is already listening
    #[error("Discovery client is already initialized")]
    AlreadyInitialized,

    /// No socket could be bound for the interface
    #[error("Failed to bind discovery socket on {interface}: {reason}")]
    Bind { interface: String, reason: String },

    /// Multicast group membership could not be established
    #[error("Failed to join {group} on {interface}: {reason}")]
    Join {
        group: IpAddr,
        interface: String,
        reason: String,
    },

    /// Named interface does not exist on this host
    #[error("Network interface not found: {0}")]
    InterfaceNotFound(String),

    /// The caller's cancellation token fired; not a failure
    #[error("Operation cancelled")]
    Cancelled,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DiscoveryError {
    /// True for errors caused by calling an operation in the wrong state
    pub fn is_state_error(&self) -> bool {
        matches!(
            self,
            DiscoveryError::NotInitialized | DiscoveryError::AlreadyInitialized
        )
    }
}
