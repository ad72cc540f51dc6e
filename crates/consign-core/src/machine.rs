//! Signing workflow state machine.
//!
//! Orchestrates the verification gates into an ordered workflow over
//! one `SignatureRequest`, enforcing transition legality and emitting
//! the final signed artifact.
//!
//! # State Machine
//!
//! ```text
//! PENDING(View) --[read threshold met]--> PASSWORD_CHECK
//! PASSWORD_CHECK --[reverify ok]--------> OTP_CHECK
//! PASSWORD_CHECK --[reverify failed]----> PASSWORD_CHECK (retry)
//! OTP_CHECK ------[issue]---------------> OTP_CHECK (code in flight)
//! OTP_CHECK ------[verify ok]-----------> PHRASE_CHECK
//! OTP_CHECK ------[verify failed]-------> OTP_CHECK (retry)
//! PHRASE_CHECK ---[phrase match]--------> SIGNED (terminal)
//! PHRASE_CHECK ---[phrase mismatch]-----> PHRASE_CHECK (retry)
//! any state ------[withdraw]------------> REJECTED (terminal)
//! any state ------[due date elapsed]----> EXPIRED (terminal)
//! ```
//!
//! Only forward progress or intra-state retry is legal; a passed gate
//! is never re-entered. The due date is checked lazily on every
//! transition attempt. Every outcome, positive or negative, is
//! appended to the request's evidence trail as part of the same
//! mutation.

use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

use crate::config::SigningConfig;
use crate::error::SigningError;
use crate::evidence::{EvidenceKind, EvidenceTrail};
use crate::otp::{AuthenticatorStore, OtpChallenge, OtpChannel, OtpMethod};
use crate::password::{IdentityStore, PasswordReverifier};
use crate::phrase;
use crate::reading::{ReadingSession, ReadingState};
use crate::request::{RequestStatus, SignatureRequest, SigningPhase};

/// A document as served by the document store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DocumentSource {
    /// Inline document content.
    Inline(String),
    /// Reference to externally stored content.
    FileRef(String),
}

/// Errors from the document store collaborator.
#[derive(Debug, Error)]
pub enum DocumentStoreError {
    /// No document exists with the given id.
    #[error("document not found: {document_id}")]
    NotFound {
        /// The unknown document id.
        document_id: String,
    },

    /// The store could not serve the request.
    #[error("document store unavailable: {reason}")]
    Unavailable {
        /// Store-supplied failure description.
        reason: String,
    },
}

/// Document store collaborator.
pub trait DocumentStore: Send + Sync {
    /// Fetches the document to be signed.
    ///
    /// # Errors
    ///
    /// Returns `DocumentStoreError` if the document cannot be served.
    fn get_document(&self, document_id: &str) -> Result<DocumentSource, DocumentStoreError>;

    /// Archives the final signed artifact.
    ///
    /// # Errors
    ///
    /// Returns `DocumentStoreError` if archival fails.
    fn archive_signed_artifact(&self, artifact: &SignedArtifact) -> Result<(), DocumentStoreError>;
}

/// The final signed-artifact descriptor emitted on entering SIGNED.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedArtifact {
    /// The signed document.
    pub document_id: String,
    /// The signing subject.
    pub subject_id: String,
    /// When the signature completed.
    pub signed_at: DateTime<Utc>,
    /// Reading-progress summary captured when the view phase was left.
    pub read_summary: ReadingState,
    /// Verification methods satisfied, in gate order.
    pub verification_methods: Vec<String>,
    /// Optional caller-supplied geolocation.
    pub geolocation: Option<String>,
}

/// The signing state machine for one request.
///
/// Owns the request aggregate for the duration of an operation: the
/// request row, its live reading session and challenge, the phrase
/// failure counter, and the evidence trail. Every method checks the
/// due date first and records its outcome in the trail, so a caller
/// persisting the machine's parts after each operation keeps the
/// transition and its evidence atomic.
#[derive(Debug)]
pub struct SigningStateMachine {
    config: SigningConfig,
    request: SignatureRequest,
    reading: Option<ReadingSession>,
    challenge: Option<OtpChallenge>,
    phrase_failures: u32,
    trail: EvidenceTrail,
}

impl SigningStateMachine {
    /// Wraps a freshly created request.
    #[must_use]
    pub fn start(config: SigningConfig, request: SignatureRequest) -> Self {
        Self {
            config,
            request,
            reading: Some(ReadingSession::new()),
            challenge: None,
            phrase_failures: 0,
            trail: EvidenceTrail::new(),
        }
    }

    /// Reconstructs the machine from persisted aggregate parts.
    #[must_use]
    pub fn resume(
        config: SigningConfig,
        request: SignatureRequest,
        reading: Option<ReadingSession>,
        challenge: Option<OtpChallenge>,
        phrase_failures: u32,
        trail: EvidenceTrail,
    ) -> Self {
        Self {
            config,
            request,
            reading,
            challenge,
            phrase_failures,
            trail,
        }
    }

    /// Returns the request aggregate root.
    #[must_use]
    pub fn request(&self) -> &SignatureRequest {
        &self.request
    }

    /// Returns the evidence trail.
    #[must_use]
    pub fn trail(&self) -> &EvidenceTrail {
        &self.trail
    }

    /// Returns the live challenge, if any.
    #[must_use]
    pub fn challenge(&self) -> Option<&OtpChallenge> {
        self.challenge.as_ref()
    }

    /// Decomposes the machine into its persistable parts:
    /// `(request, reading, challenge, phrase_failures, trail)`.
    #[must_use]
    pub fn into_parts(
        self,
    ) -> (
        SignatureRequest,
        Option<ReadingSession>,
        Option<OtpChallenge>,
        u32,
        EvidenceTrail,
    ) {
        (
            self.request,
            self.reading,
            self.challenge,
            self.phrase_failures,
            self.trail,
        )
    }

    /// Refuses terminal requests and force-expires past-due ones.
    ///
    /// Called at the top of every operation: expiry is lazy, checked
    /// against the wall clock on each transition attempt rather than
    /// by a background timer.
    fn ensure_live(&mut self, now: DateTime<Utc>) -> Result<(), SigningError> {
        if self.request.is_terminal() {
            return Err(SigningError::RequestAlreadyTerminal {
                request_id: self.request.id.clone(),
                status: self.request.status,
            });
        }
        if self.request.is_past_due(now) {
            self.request.status = RequestStatus::Expired;
            self.reading = None;
            self.challenge = None;
            self.trail.append(
                EvidenceKind::Expired,
                now,
                json!({
                    "due_date": self.request.due_date.map(|d| d.to_rfc3339()),
                }),
            );
            return Err(SigningError::RequestExpired {
                request_id: self.request.id.clone(),
            });
        }
        Ok(())
    }

    fn require_phase(
        &self,
        operation: &'static str,
        phase: SigningPhase,
    ) -> Result<(), SigningError> {
        if self.request.phase == phase {
            Ok(())
        } else {
            Err(SigningError::IllegalTransition {
                operation,
                phase: self.request.phase,
            })
        }
    }

    /// Merges a reading-progress report into the view phase.
    ///
    /// When the report satisfies the read gate, the session is
    /// summarized into a `READ_SUMMARY` evidence record and discarded,
    /// and the request advances to `PASSWORD_CHECK` (status `VIEWED`).
    ///
    /// # Errors
    ///
    /// Returns `RequestExpired`/`RequestAlreadyTerminal` per the
    /// liveness check, or `IllegalTransition` outside the view phase.
    pub fn report_read_progress(
        &mut self,
        scroll_percentage: u8,
        elapsed_seconds: u32,
        now: DateTime<Utc>,
    ) -> Result<ReadingState, SigningError> {
        self.ensure_live(now)?;
        self.require_phase("report_read_progress", SigningPhase::View)?;

        let session = self.reading.get_or_insert_with(ReadingSession::new);
        session.observe(scroll_percentage, elapsed_seconds);
        let state = session.state(&self.config.read_gate);

        if state.threshold_met {
            self.trail.append(
                EvidenceKind::ReadSummary,
                now,
                json!({
                    "max_scroll_percentage": state.max_scroll_percentage,
                    "elapsed_seconds": state.elapsed_seconds,
                    "threshold_met": true,
                }),
            );
            self.reading = None;
            self.request.phase = SigningPhase::PasswordCheck;
            self.request.status = RequestStatus::Viewed;
        }

        Ok(state)
    }

    /// Re-verifies the subject's long-term credential.
    ///
    /// # Errors
    ///
    /// Returns the liveness errors, `IllegalTransition` outside
    /// `PASSWORD_CHECK`, or the re-verifier's `InvalidCredential` /
    /// `RateLimited`. Failures are recorded in the trail and leave the
    /// request in `PASSWORD_CHECK`.
    pub fn submit_password(
        &mut self,
        reverifier: &PasswordReverifier,
        identity: &dyn IdentityStore,
        secret: &SecretString,
        now: DateTime<Utc>,
    ) -> Result<(), SigningError> {
        self.ensure_live(now)?;
        self.require_phase("submit_password", SigningPhase::PasswordCheck)?;

        match reverifier.reverify(identity, &self.request.subject_id, secret, now) {
            Ok(()) => {
                self.trail.append(
                    EvidenceKind::PasswordVerified,
                    now,
                    json!({ "subject_id": self.request.subject_id }),
                );
                self.request.phase = SigningPhase::OtpCheck;
                Ok(())
            },
            Err(err) => {
                self.trail.append(
                    EvidenceKind::PasswordFailed,
                    now,
                    json!({ "reason": err.to_string() }),
                );
                Err(err)
            },
        }
    }

    /// Issues a one-time code challenge, invalidating any predecessor.
    ///
    /// The generated code (email method) is delivered by the caller;
    /// issuance never blocks on delivery.
    ///
    /// # Errors
    ///
    /// Returns the liveness errors or `IllegalTransition` outside
    /// `OTP_CHECK`.
    pub fn request_otp(
        &mut self,
        channel: &OtpChannel,
        method: OtpMethod,
        now: DateTime<Utc>,
    ) -> Result<&OtpChallenge, SigningError> {
        self.ensure_live(now)?;
        self.require_phase("request_otp", SigningPhase::OtpCheck)?;

        let challenge = channel.issue("signature-consent", method, now);
        self.trail.append(
            EvidenceKind::OtpSent,
            now,
            json!({
                "challenge_id": challenge.id,
                "method": challenge.method.as_str(),
                "expires_at": challenge.expires_at.to_rfc3339(),
            }),
        );
        // At most one live challenge per request: replacing the slot
        // invalidates the previous code.
        Ok(self.challenge.insert(challenge))
    }

    /// Verifies a submitted one-time code against the live challenge.
    ///
    /// # Errors
    ///
    /// Returns the liveness errors, `IllegalTransition` outside
    /// `OTP_CHECK`, `NoActiveChallenge` if nothing was issued, or the
    /// channel's `OtpMismatch` / `OtpExpired` /
    /// `OtpAttemptsExhausted`. On success the consumed challenge is
    /// discarded and the request advances to `PHRASE_CHECK`.
    pub fn submit_otp(
        &mut self,
        channel: &OtpChannel,
        authenticator: &dyn AuthenticatorStore,
        code: &str,
        now: DateTime<Utc>,
    ) -> Result<(), SigningError> {
        self.ensure_live(now)?;
        self.require_phase("submit_otp", SigningPhase::OtpCheck)?;

        let subject_id = self.request.subject_id.clone();
        let challenge = self
            .challenge
            .as_mut()
            .ok_or_else(|| SigningError::NoActiveChallenge {
                request_id: self.request.id.clone(),
            })?;
        let challenge_id = challenge.id.clone();
        let method = challenge.method;

        match channel.verify(challenge, &subject_id, code, authenticator, now) {
            Ok(()) => {
                self.trail.append(
                    EvidenceKind::OtpVerified,
                    now,
                    json!({
                        "challenge_id": challenge_id,
                        "method": method.as_str(),
                    }),
                );
                self.challenge = None;
                self.request.phase = SigningPhase::PhraseCheck;
                Ok(())
            },
            Err(err) => {
                self.trail.append(
                    EvidenceKind::OtpFailed,
                    now,
                    json!({
                        "challenge_id": challenge_id,
                        "reason": err.to_string(),
                    }),
                );
                Err(err)
            },
        }
    }

    /// Validates the typed consent phrase and, on match, completes the
    /// signature.
    ///
    /// On success the request becomes `SIGNED` and the returned
    /// artifact carries the read summary, the satisfied verification
    /// methods in gate order, and the optional geolocation. The caller
    /// forwards the artifact to the document store.
    ///
    /// # Errors
    ///
    /// Returns the liveness errors, `IllegalTransition` outside
    /// `PHRASE_CHECK`, `PhraseMismatch` with the remaining-attempt
    /// count, or `VerificationExhausted` once the attempt bound is
    /// spent.
    pub fn submit_phrase(
        &mut self,
        submitted: &str,
        geolocation: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<SignedArtifact, SigningError> {
        self.ensure_live(now)?;
        self.require_phase("submit_phrase", SigningPhase::PhraseCheck)?;

        let cap = self.config.phrase.attempt_cap;
        if self.phrase_failures >= cap {
            self.trail.append(
                EvidenceKind::PhraseFailed,
                now,
                json!({ "reason": "attempts exhausted" }),
            );
            return Err(SigningError::VerificationExhausted {
                phase: SigningPhase::PhraseCheck,
            });
        }

        if !phrase::matches_required(submitted, &self.config.phrase.required_phrase) {
            self.phrase_failures += 1;
            let remaining = cap - self.phrase_failures;
            self.trail.append(
                EvidenceKind::PhraseFailed,
                now,
                json!({ "remaining_attempts": remaining }),
            );
            if self.phrase_failures >= cap {
                return Err(SigningError::VerificationExhausted {
                    phase: SigningPhase::PhraseCheck,
                });
            }
            return Err(SigningError::PhraseMismatch {
                remaining_attempts: remaining,
            });
        }

        self.trail
            .append(EvidenceKind::PhraseConfirmed, now, json!({}));

        let artifact = SignedArtifact {
            document_id: self.request.document_id.clone(),
            subject_id: self.request.subject_id.clone(),
            signed_at: now,
            read_summary: self.read_summary(),
            verification_methods: self.verification_methods(),
            geolocation,
        };
        self.request.status = RequestStatus::Signed;
        self.trail.append(
            EvidenceKind::Signed,
            now,
            json!({
                "document_id": artifact.document_id,
                "subject_id": artifact.subject_id,
                "signed_at": artifact.signed_at.to_rfc3339(),
                "read_summary": {
                    "max_scroll_percentage": artifact.read_summary.max_scroll_percentage,
                    "elapsed_seconds": artifact.read_summary.elapsed_seconds,
                    "threshold_met": artifact.read_summary.threshold_met,
                },
                "verification_methods": artifact.verification_methods,
                "geolocation": artifact.geolocation,
            }),
        );
        Ok(artifact)
    }

    /// Withdraws a non-terminal request to `REJECTED`.
    ///
    /// Returns `Ok(true)` if the request was withdrawn, `Ok(false)` if
    /// it was already terminal (idempotent no-op: no evidence entry,
    /// no error) or force-expired by a past due date.
    ///
    /// # Errors
    ///
    /// Never fails today; the `Result` leaves room for storage-backed
    /// implementations.
    pub fn withdraw(&mut self, now: DateTime<Utc>) -> Result<bool, SigningError> {
        if self.request.is_terminal() {
            return Ok(false);
        }
        if self.request.is_past_due(now) {
            // Expiry takes precedence over withdrawal.
            let _ = self.ensure_live(now);
            return Ok(false);
        }
        self.request.status = RequestStatus::Rejected;
        self.reading = None;
        self.challenge = None;
        self.trail.append(
            EvidenceKind::Rejected,
            now,
            json!({ "reason": "withdrawn" }),
        );
        Ok(true)
    }

    /// Read summary recorded when the view phase was left. A request
    /// past the view phase always carries one structurally; an empty
    /// fallback covers hand-built aggregates.
    fn read_summary(&self) -> ReadingState {
        self.trail
            .first_of_kind(EvidenceKind::ReadSummary)
            .and_then(|record| serde_json::from_value(record.payload.clone()).ok())
            .unwrap_or(ReadingState {
                max_scroll_percentage: 0,
                elapsed_seconds: 0,
                threshold_met: false,
            })
    }

    /// Verification methods satisfied so far, in gate order.
    fn verification_methods(&self) -> Vec<String> {
        let otp_method = self
            .trail
            .first_of_kind(EvidenceKind::OtpVerified)
            .and_then(|record| record.payload.get("method"))
            .and_then(|v| v.as_str())
            .unwrap_or("UNKNOWN")
            .to_string();
        vec![
            "PASSWORD".to_string(),
            format!("OTP_{otp_method}"),
            "PHRASE".to_string(),
        ]
    }
}
