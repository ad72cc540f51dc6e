//! Error types for the signing workflow.

use thiserror::Error;

use crate::request::{RequestStatus, SigningPhase};

/// Errors that can occur while driving a signature request through its
/// verification gates.
///
/// All variants except [`SigningError::RequestExpired`],
/// [`SigningError::RequestAlreadyTerminal`], and
/// [`SigningError::IllegalTransition`] are recoverable by retrying the
/// same operation; those three are fatal to the current attempt.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SigningError {
    /// The supplied long-term credential did not match the identity store.
    #[error("invalid credential for subject {subject_id} ({remaining_attempts} attempts remaining)")]
    InvalidCredential {
        /// The subject whose credential was re-checked.
        subject_id: String,
        /// Failures remaining before the subject is rate limited.
        remaining_attempts: u32,
    },

    /// Too many consecutive credential failures; attempts are refused
    /// until the cooldown window elapses.
    #[error("rate limited for subject {subject_id}: retry after {retry_after_seconds}s")]
    RateLimited {
        /// The subject being rate limited.
        subject_id: String,
        /// Seconds until the cooldown window ends.
        retry_after_seconds: i64,
    },

    /// The supplied one-time code did not match the live challenge.
    #[error("one-time code mismatch ({remaining_attempts} attempts remaining)")]
    OtpMismatch {
        /// Attempts remaining before the challenge is void.
        remaining_attempts: u32,
    },

    /// The live challenge has expired or was already consumed.
    #[error("one-time code expired")]
    OtpExpired,

    /// The live challenge's attempt cap has been reached; a new
    /// challenge must be issued.
    #[error("one-time code attempts exhausted")]
    OtpAttemptsExhausted,

    /// No challenge has been issued for this request, or the previous
    /// one was invalidated by a re-issue.
    #[error("no live one-time code challenge for request {request_id}")]
    NoActiveChallenge {
        /// The request missing a challenge.
        request_id: String,
    },

    /// The submitted consent phrase did not match the required phrase.
    #[error("consent phrase mismatch ({remaining_attempts} attempts remaining)")]
    PhraseMismatch {
        /// Attempts remaining before phrase verification is exhausted.
        remaining_attempts: u32,
    },

    /// The request's due date has elapsed; the request is now EXPIRED
    /// and a new request must be created.
    #[error("signature request expired: {request_id}")]
    RequestExpired {
        /// The expired request.
        request_id: String,
    },

    /// The request is already in a terminal status and admits no
    /// further transitions.
    #[error("signature request {request_id} already terminal: {status}")]
    RequestAlreadyTerminal {
        /// The terminal request.
        request_id: String,
        /// Its terminal status.
        status: RequestStatus,
    },

    /// The operation is not legal in the request's current phase.
    #[error("illegal transition: {operation} not permitted in phase {phase}")]
    IllegalTransition {
        /// The attempted operation.
        operation: &'static str,
        /// The phase the request is in.
        phase: SigningPhase,
    },

    /// The bounded attempt count for the current sub-state has been
    /// exceeded; administrative reissue is required.
    #[error("verification attempts exhausted in phase {phase}")]
    VerificationExhausted {
        /// The phase whose attempt bound was exceeded.
        phase: SigningPhase,
    },

    /// No signature request exists with the given id.
    #[error("signature request not found: {request_id}")]
    RequestNotFound {
        /// The unknown request id.
        request_id: String,
    },

    /// An internal lock was poisoned by a panicking thread.
    #[error("internal lock poisoned")]
    LockPoisoned,
}

impl SigningError {
    /// Returns `true` if the caller may retry the same operation.
    ///
    /// Expiry, terminal status, and illegal transitions are fatal to
    /// the current attempt; everything else surfaces a "try again"
    /// signal.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::RequestExpired { .. }
                | Self::RequestAlreadyTerminal { .. }
                | Self::IllegalTransition { .. }
                | Self::RequestNotFound { .. }
                | Self::VerificationExhausted { .. }
                | Self::LockPoisoned
        )
    }
}
