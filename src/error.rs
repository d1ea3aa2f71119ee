//! Error types for the onion service stack
//!
//! This module provides the error taxonomy used across the crate:
//! - Detailed variants for the different failure modes
//! - Error classification (fatal vs retryable vs silently dropped)
//! - Helpers for DESTROY reason codes

use thiserror::Error;

pub type Result<T> = std::result::Result<T, TorError>;

/// Main error type for the onion service stack
#[derive(Error, Debug)]
pub enum TorError {
    // ===== Transport Errors =====
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection timeout")]
    Timeout,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    // ===== Protocol Errors =====
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Unexpected cell: expected {expected}, got {got}")]
    UnexpectedCell { expected: String, got: String },

    #[error("Relay cell was not recognized at any hop")]
    Unrecognized,

    #[error("Circuit destroyed: reason={reason} ({})", destroy_reason_name(*reason))]
    CircuitDestroyed { reason: u8 },

    #[error("Certificate verification failed: {0}")]
    CertificateError(String),

    // ===== Cryptographic Errors =====
    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Handshake authentication failed")]
    AuthMismatch,

    // ===== Directory Errors =====
    #[error("Directory error: {0}")]
    Directory(String),

    #[error("Consensus is stale (past valid-until)")]
    StaleDirectory,

    #[error("No suitable relays: {0}")]
    NoSuitableRelays(String),

    // ===== Resource Errors =====
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    // ===== Storage Errors =====
    #[error("Storage error: {0}")]
    Storage(String),

    // ===== Silently dropped =====
    #[error("Replayed rendezvous cookie")]
    Replay,

    #[error("Stale or unverifiable introduction")]
    StaleIntroduction,

    // ===== State Errors =====
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl TorError {
    /// Whether this error can be recovered by rebuilding the circuit
    /// with different relays.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TorError::ConnectionFailed(_)
                | TorError::Timeout
                | TorError::Io(_)
                | TorError::Tls(_)
                | TorError::CircuitDestroyed { .. }
                | TorError::Protocol(_)
                | TorError::UnexpectedCell { .. }
                | TorError::Unrecognized
        )
    }

    /// Whether this error aborts the operation outright (no retry).
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TorError::Crypto(_) | TorError::AuthMismatch | TorError::Storage(_)
        )
    }

    /// Whether this error must be swallowed without any reply on the wire.
    pub fn is_silent_drop(&self) -> bool {
        matches!(self, TorError::Replay | TorError::StaleIntroduction)
    }
}

/// DESTROY cell reason codes, tor-spec 5.4
pub fn destroy_reason_name(reason: u8) -> &'static str {
    match reason {
        0 => "NONE",
        1 => "PROTOCOL",
        2 => "INTERNAL",
        3 => "REQUESTED",
        4 => "HIBERNATING",
        5 => "RESOURCELIMIT",
        6 => "CONNECTFAILED",
        7 => "OR_IDENTITY",
        8 => "CHANNEL_CLOSED",
        9 => "FINISHED",
        10 => "TIMEOUT",
        11 => "DESTROYED",
        12 => "NOSUCHSERVICE",
        _ => "UNKNOWN",
    }
}
