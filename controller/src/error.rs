//! Unified error type for the controller core.
//!
//! Mirrors the error-kind taxonomy a Matter controller contract exposes to
//! callers (spec §7): most kinds are either terminal (`UnknownPeer`),
//! transient and handled internally by the reconnect/backoff machinery
//! (`Transient`, `NotConnected`), or surfaced verbatim to the caller who
//! issued a read/write/invoke (`ProtocolFlow`, `Constraint`).

use thiserror::Error;

/// Unified controller error.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// A reconnect is already in progress; caller should wait or retry.
    #[error("not connected: reconnect in progress")]
    NotConnected,

    /// Channel status response or generic status response from the device;
    /// triggers the reconnect schedule rather than failing the caller.
    #[error("transient device error: {0}")]
    Transient(String),

    /// The peer does not recognize us as a fabric member. Terminal.
    #[error("peer does not recognize this fabric: {0:?}")]
    UnknownPeer(crate::collab::PeerAddress),

    /// Report shape violated the expected protocol contract (e.g. more than
    /// one attribute in a single-attribute read reply).
    #[error("unexpected report shape: {0}")]
    ProtocolFlow(String),

    /// The invoked operation is not supported by the device.
    #[error("unsupported operation: {0}")]
    Constraint(String),

    /// An internal invariant failed (unresolved endpoint cycle, missing
    /// handler). Logged at error level; the process continues.
    #[error("internal invariant violated: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, ControllerError>;

impl ControllerError {
    /// Errors of this shape are absorbed by the PairedNode's background
    /// initialization path (logged + reconnect scheduled) rather than
    /// propagated, per spec §4.G "Failure semantics".
    pub fn is_background_recoverable(&self) -> bool {
        matches!(self, ControllerError::Transient(_) | ControllerError::NotConnected)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ControllerError::UnknownPeer(_))
    }
}
