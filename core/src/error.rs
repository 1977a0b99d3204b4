// SPDX-License-Identifier: MIT

//! Error kinds raised by the command execution core.
//!
//! Every variant carries enough context (a command code, a short string) to
//! log or display without ever embedding key material, nonces, or HMAC tags.

use thiserror::Error;

/// The result type used throughout this crate.
pub type TpmResult<T> = Result<T, TpmCoreError>;

/// Errors raised while building, submitting, or parsing a TPM command.
///
/// This is a closed set: callers match on it exhaustively rather than
/// inspecting an open trait object, mirroring the protocol's own closed set
/// of failure classes (`TPM_RC_*` vs. core-side failures).
#[derive(Debug, Error)]
pub enum TpmCoreError {
    /// The platform transport refused or failed the call.
    #[error("transport failure for command {command_code:#010x}: {context}")]
    TransportFailure {
        command_code: u32,
        context: String,
    },

    /// A response underflowed or otherwise violated a structural invariant.
    #[error("malformed response to command {command_code:#010x}: {context}")]
    Malformed {
        command_code: u32,
        context: String,
    },

    /// A session's HMAC verification failed. The session is now poisoned.
    #[error("response integrity check failed for command {command_code:#010x}")]
    IntegrityFailure { command_code: u32 },

    /// The TPM returned a non-zero response code. Surfaced verbatim.
    #[error("TPM returned {rc} ({rc:#06x}) for command {command_code:#010x}")]
    TpmResponse { command_code: u32, rc: u32 },

    /// The caller attempted to use a session that previously failed
    /// integrity verification.
    #[error("session is poisoned, command {command_code:#010x} was not sent")]
    SessionPoisoned { command_code: u32 },

    /// The sensitive pool could not satisfy a rent request.
    #[error("sensitive pool exhausted while renting {requested} bytes")]
    PoolExhausted { requested: usize },

    /// Caller-side misuse: zero-length rent, double release, unregistered
    /// mandatory command, mismatched handle type, and similar programmer
    /// errors. In debug builds these should generally be caught earlier by
    /// a `debug_assert!`; this variant exists for the release-build path.
    #[error("precondition violated: {context}")]
    Precondition { context: String },
}

impl TpmCoreError {
    /// The command code this error occurred while processing, if any.
    #[must_use]
    pub fn command_code(&self) -> Option<u32> {
        match self {
            Self::TransportFailure { command_code, .. }
            | Self::Malformed { command_code, .. }
            | Self::IntegrityFailure { command_code }
            | Self::TpmResponse { command_code, .. }
            | Self::SessionPoisoned { command_code } => Some(*command_code),
            Self::PoolExhausted { .. } | Self::Precondition { .. } => None,
        }
    }
}
