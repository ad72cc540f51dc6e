//! Password re-verification with per-subject rate limiting.
//!
//! Re-checks the already-authenticated caller's long-term credential
//! against the identity store (defense in depth for a hijacked
//! session) without creating a new session. A per-subject failure
//! counter applies an exponential-backoff cooldown once the failure
//! cap is reached.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Duration, Utc};
use secrecy::SecretString;

use crate::config::ReverifyPolicy;
use crate::error::SigningError;

/// Identity store collaborator: checks a subject's long-term
/// credential.
pub trait IdentityStore: Send + Sync {
    /// Returns `true` if `secret` matches the stored credential for
    /// `subject_id`.
    fn check_credential(&self, subject_id: &str, secret: &SecretString) -> bool;
}

/// Per-subject failure tracking.
#[derive(Debug, Clone, Copy, Default)]
struct FailureCounter {
    consecutive_failures: u32,
    locked_until: Option<DateTime<Utc>>,
}

/// Stateless-per-request password re-verifier with per-subject
/// failure counters.
///
/// Shared across requests: the counter is keyed by subject, so a
/// subject hammering one request cannot reset their budget by opening
/// another.
pub struct PasswordReverifier {
    policy: ReverifyPolicy,
    counters: RwLock<HashMap<String, FailureCounter>>,
}

impl PasswordReverifier {
    /// Creates a re-verifier with the given policy.
    #[must_use]
    pub fn new(policy: ReverifyPolicy) -> Self {
        Self {
            policy,
            counters: RwLock::new(HashMap::new()),
        }
    }

    /// Re-validates `secret` against the identity store.
    ///
    /// # Errors
    ///
    /// - `SigningError::RateLimited` if the subject is inside a
    ///   cooldown window; no credential check is performed.
    /// - `SigningError::InvalidCredential` if the check fails; the
    ///   failure counter is incremented and, once the cap is reached,
    ///   a cooldown window engages (doubling per excess failure, up to
    ///   the configured maximum).
    ///
    /// A successful check clears the subject's counter.
    pub fn reverify(
        &self,
        identity: &dyn IdentityStore,
        subject_id: &str,
        secret: &SecretString,
        now: DateTime<Utc>,
    ) -> Result<(), SigningError> {
        {
            let counters = self.counters.read().map_err(|_| SigningError::LockPoisoned)?;
            if let Some(counter) = counters.get(subject_id) {
                if let Some(locked_until) = counter.locked_until {
                    if now < locked_until {
                        return Err(SigningError::RateLimited {
                            subject_id: subject_id.to_string(),
                            retry_after_seconds: (locked_until - now).num_seconds().max(1),
                        });
                    }
                }
            }
        }

        if identity.check_credential(subject_id, secret) {
            let mut counters = self.counters.write().map_err(|_| SigningError::LockPoisoned)?;
            counters.remove(subject_id);
            return Ok(());
        }

        let mut counters = self.counters.write().map_err(|_| SigningError::LockPoisoned)?;
        let counter = counters.entry(subject_id.to_string()).or_default();
        counter.consecutive_failures += 1;
        if counter.consecutive_failures >= self.policy.failure_cap {
            counter.locked_until = Some(now + Duration::seconds(self.cooldown_seconds(counter.consecutive_failures)));
        }
        Err(SigningError::InvalidCredential {
            subject_id: subject_id.to_string(),
            remaining_attempts: self
                .policy
                .failure_cap
                .saturating_sub(counter.consecutive_failures),
        })
    }

    /// Cooldown window for the given failure count: base doubled per
    /// failure beyond the cap, bounded by the configured maximum.
    fn cooldown_seconds(&self, failures: u32) -> i64 {
        let excess = failures.saturating_sub(self.policy.failure_cap).min(16);
        let window = self
            .policy
            .cooldown_base_seconds
            .saturating_mul(1_i64 << excess);
        window.min(self.policy.cooldown_max_seconds)
    }
}
