//! One-time code issuance and verification.
//!
//! Two delivery methods back one `verify` contract: an emailed numeric
//! code compared constant-time against the challenge, or a delegation
//! to the subject's existing authenticator secret (no code is sent).
//! A challenge is void once expired, attempt-capped, or consumed, and
//! re-issuing always invalidates the predecessor.

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use thiserror::Error;
use uuid::Uuid;

use crate::config::OtpPolicy;
use crate::error::SigningError;

/// Delivery method for a one-time code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OtpMethod {
    /// A server-generated code delivered out of band by email.
    Email,
    /// A code generated by the subject's authenticator device and
    /// verified against their pre-shared secret.
    Authenticator,
}

impl OtpMethod {
    /// Returns the canonical string representation of this method.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Email => "EMAIL",
            Self::Authenticator => "AUTHENTICATOR",
        }
    }

    /// Parses a method from its canonical string form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "EMAIL" => Some(Self::Email),
            "AUTHENTICATOR" => Some(Self::Authenticator),
            _ => None,
        }
    }
}

impl std::fmt::Display for OtpMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Failure delivering a code through the notification collaborator.
///
/// Delivery failures are logged, never fatal to challenge issuance.
#[derive(Debug, Error)]
#[error("code delivery failed: {reason}")]
pub struct DeliveryError {
    /// Collaborator-supplied failure description.
    pub reason: String,
}

/// Notification dispatcher collaborator: delivers a code out of band.
pub trait NotificationDispatcher: Send + Sync {
    /// Sends `code` to the subject over the given method.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError` if delivery fails; the caller logs and
    /// continues.
    fn send_code(&self, subject_id: &str, method: OtpMethod, code: &str)
        -> Result<(), DeliveryError>;
}

/// Authenticator secret store collaborator: verifies a device code
/// against the subject's pre-shared secret.
pub trait AuthenticatorStore: Send + Sync {
    /// Returns `true` if `code` is currently valid for `subject_id`.
    fn verify_authenticator_code(&self, subject_id: &str, code: &str) -> bool;
}

/// A live one-time code challenge owned by one signature request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OtpChallenge {
    /// Unique challenge id.
    pub id: String,
    /// What the code authorizes, recorded in evidence.
    pub purpose: String,
    /// The expected code. Empty for the authenticator method, where
    /// verification delegates to the secret store.
    pub code: String,
    /// Delivery method.
    pub method: OtpMethod,
    /// Issuance time.
    pub issued_at: DateTime<Utc>,
    /// Expiry time (`issued_at` + TTL), compared lazily on verify.
    pub expires_at: DateTime<Utc>,
    /// Failed verification attempts so far.
    pub attempt_count: u32,
    /// Set on successful verification; the challenge is then consumed.
    pub verified: bool,
}

impl OtpChallenge {
    /// Returns `true` if the challenge is past its expiry at `now`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Issues and verifies one-time code challenges under one policy.
#[derive(Debug, Clone, Copy)]
pub struct OtpChannel {
    policy: OtpPolicy,
}

impl OtpChannel {
    /// Creates a channel with the given policy.
    #[must_use]
    pub const fn new(policy: OtpPolicy) -> Self {
        Self { policy }
    }

    /// Issues a fresh challenge.
    ///
    /// For the email method a fixed-length numeric code is generated;
    /// delivery is the caller's concern. For the authenticator method
    /// no code is generated, only the obligation to verify against the
    /// subject's authenticator secret.
    #[must_use]
    pub fn issue(&self, purpose: impl Into<String>, method: OtpMethod, now: DateTime<Utc>) -> OtpChallenge {
        let code = match method {
            OtpMethod::Email => generate_code(self.policy.code_length),
            OtpMethod::Authenticator => String::new(),
        };
        OtpChallenge {
            id: Uuid::new_v4().to_string(),
            purpose: purpose.into(),
            code,
            method,
            issued_at: now,
            expires_at: now + Duration::seconds(self.policy.ttl_seconds),
            attempt_count: 0,
            verified: false,
        }
    }

    /// Verifies `supplied` against the challenge.
    ///
    /// # Errors
    ///
    /// - `SigningError::OtpExpired` if the challenge was already
    ///   consumed (single-use) or its TTL has elapsed.
    /// - `SigningError::OtpAttemptsExhausted` if the attempt cap was
    ///   reached.
    /// - `SigningError::OtpMismatch` if the code does not match; the
    ///   attempt counter is incremented.
    ///
    /// On success the challenge is marked `verified` and becomes
    /// single-use.
    pub fn verify(
        &self,
        challenge: &mut OtpChallenge,
        subject_id: &str,
        supplied: &str,
        authenticator: &dyn AuthenticatorStore,
        now: DateTime<Utc>,
    ) -> Result<(), SigningError> {
        if challenge.verified || challenge.is_expired(now) {
            return Err(SigningError::OtpExpired);
        }
        if challenge.attempt_count >= self.policy.attempt_cap {
            return Err(SigningError::OtpAttemptsExhausted);
        }

        let matched = match challenge.method {
            OtpMethod::Email => {
                bool::from(challenge.code.as_bytes().ct_eq(supplied.as_bytes()))
            },
            OtpMethod::Authenticator => {
                authenticator.verify_authenticator_code(subject_id, supplied)
            },
        };

        if matched {
            challenge.verified = true;
            Ok(())
        } else {
            challenge.attempt_count += 1;
            if challenge.attempt_count >= self.policy.attempt_cap {
                Err(SigningError::OtpAttemptsExhausted)
            } else {
                Err(SigningError::OtpMismatch {
                    remaining_attempts: self.policy.attempt_cap - challenge.attempt_count,
                })
            }
        }
    }
}

/// Generates a fixed-length numeric code.
fn generate_code(length: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..length)
        .map(|_| char::from(b'0' + rng.gen_range(0..10u8)))
        .collect()
}
