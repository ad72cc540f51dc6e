//! The `SignatureRequest` aggregate and its status/phase enums.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Coarse lifecycle status of a signature request.
///
/// This is the externally visible contract: the surrounding CRUD layer
/// creates requests in `Pending` and later reads the terminal status.
/// `Signed`, `Rejected`, and `Expired` are terminal; once reached, no
/// further transition is permitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestStatus {
    /// Created; the subject has not yet met the read threshold.
    Pending,
    /// The read threshold has been met; verification gates in progress.
    Viewed,
    /// All gates passed; the signed artifact has been emitted.
    Signed,
    /// Withdrawn by an external admin action.
    Rejected,
    /// The due date elapsed before signing completed.
    Expired,
}

impl RequestStatus {
    /// Returns `true` if no further transition is permitted.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Signed | Self::Rejected | Self::Expired)
    }

    /// Returns the canonical string representation of this status.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Viewed => "VIEWED",
            Self::Signed => "SIGNED",
            Self::Rejected => "REJECTED",
            Self::Expired => "EXPIRED",
        }
    }

    /// Parses a status from its canonical string form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "PENDING" => Some(Self::Pending),
            "VIEWED" => Some(Self::Viewed),
            "SIGNED" => Some(Self::Signed),
            "REJECTED" => Some(Self::Rejected),
            "EXPIRED" => Some(Self::Expired),
            _ => None,
        }
    }
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Fine-grained gate position while the request is non-terminal.
///
/// Phases only move forward: `View` -> `PasswordCheck` -> `OtpCheck`
/// -> `PhraseCheck`. There is no backward transition once a gate has
/// been passed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SigningPhase {
    /// Waiting for the subject to plausibly read the document.
    View,
    /// Waiting for long-term credential re-verification.
    PasswordCheck,
    /// Waiting for one-time code verification.
    OtpCheck,
    /// Waiting for the typed consent phrase.
    PhraseCheck,
}

impl SigningPhase {
    /// Returns the canonical string representation of this phase.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::View => "VIEW",
            Self::PasswordCheck => "PASSWORD_CHECK",
            Self::OtpCheck => "OTP_CHECK",
            Self::PhraseCheck => "PHRASE_CHECK",
        }
    }

    /// Parses a phase from its canonical string form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "VIEW" => Some(Self::View),
            "PASSWORD_CHECK" => Some(Self::PasswordCheck),
            "OTP_CHECK" => Some(Self::OtpCheck),
            "PHRASE_CHECK" => Some(Self::PhraseCheck),
            _ => None,
        }
    }
}

impl std::fmt::Display for SigningPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Dispatch priority assigned by the creating collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Priority {
    /// Below-normal urgency.
    Low,
    /// Default urgency.
    #[default]
    Normal,
    /// Above-normal urgency.
    High,
}

impl Priority {
    /// Returns the canonical string representation of this priority.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Normal => "NORMAL",
            Self::High => "HIGH",
        }
    }

    /// Parses a priority from its canonical string form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "LOW" => Some(Self::Low),
            "NORMAL" => Some(Self::Normal),
            "HIGH" => Some(Self::High),
            _ => None,
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One document awaiting one specific subject's signature.
///
/// Created by an external collaborator (document dispatch), mutated
/// only by the signing state machine, never deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureRequest {
    /// Unique request id.
    pub id: String,
    /// The document to be signed.
    pub document_id: String,
    /// The subject whose signature is requested.
    pub subject_id: String,
    /// Coarse lifecycle status.
    pub status: RequestStatus,
    /// Gate position while non-terminal.
    pub phase: SigningPhase,
    /// Creation time.
    pub requested_at: DateTime<Utc>,
    /// Optional deadline; once elapsed, any transition attempt
    /// force-moves the request to `Expired`.
    pub due_date: Option<DateTime<Utc>>,
    /// Dispatch priority.
    pub priority: Priority,
}

impl SignatureRequest {
    /// Creates a new pending request with a fresh id.
    #[must_use]
    pub fn new(
        document_id: impl Into<String>,
        subject_id: impl Into<String>,
        priority: Priority,
        due_date: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            document_id: document_id.into(),
            subject_id: subject_id.into(),
            status: RequestStatus::Pending,
            phase: SigningPhase::View,
            requested_at: now,
            due_date,
            priority,
        }
    }

    /// Returns `true` if the request is in a terminal status.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Returns `true` if the due date has elapsed at `now`.
    #[must_use]
    pub fn is_past_due(&self, now: DateTime<Utc>) -> bool {
        self.due_date.is_some_and(|due| now > due)
    }
}

#[cfg(test)]
mod unit_tests {
    use chrono::TimeZone;

    use super::*;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn test_status_roundtrip() {
        for status in [
            RequestStatus::Pending,
            RequestStatus::Viewed,
            RequestStatus::Signed,
            RequestStatus::Rejected,
            RequestStatus::Expired,
        ] {
            assert_eq!(RequestStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(RequestStatus::parse("garbage"), None);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!RequestStatus::Pending.is_terminal());
        assert!(!RequestStatus::Viewed.is_terminal());
        assert!(RequestStatus::Signed.is_terminal());
        assert!(RequestStatus::Rejected.is_terminal());
        assert!(RequestStatus::Expired.is_terminal());
    }

    #[test]
    fn test_phase_roundtrip() {
        for phase in [
            SigningPhase::View,
            SigningPhase::PasswordCheck,
            SigningPhase::OtpCheck,
            SigningPhase::PhraseCheck,
        ] {
            assert_eq!(SigningPhase::parse(phase.as_str()), Some(phase));
        }
        assert_eq!(SigningPhase::parse(""), None);
    }

    #[test]
    fn test_new_request_is_pending() {
        let req = SignatureRequest::new("doc-1", "subject-1", Priority::High, None, t(100));
        assert_eq!(req.status, RequestStatus::Pending);
        assert_eq!(req.phase, SigningPhase::View);
        assert!(!req.is_terminal());
        assert!(!req.id.is_empty());
    }

    #[test]
    fn test_past_due() {
        let mut req = SignatureRequest::new("doc-1", "subject-1", Priority::Normal, None, t(100));
        assert!(!req.is_past_due(t(1_000_000)));

        req.due_date = Some(t(200));
        assert!(!req.is_past_due(t(200)));
        assert!(req.is_past_due(t(201)));
    }
}
