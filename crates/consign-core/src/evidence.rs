//! Append-only evidence trail.
//!
//! Each signature request owns an ordered sequence of immutable
//! evidence records documenting every verification outcome, positive
//! and negative. Records are never updated or deleted; the trail is
//! the artifact that defends the signature's validity in a dispute.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind classification for evidence records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub enum EvidenceKind {
    /// Final reading-progress summary when the view phase was left.
    ReadSummary,
    /// Long-term credential re-verification succeeded.
    PasswordVerified,
    /// Long-term credential re-verification failed.
    PasswordFailed,
    /// A one-time code challenge was issued.
    OtpSent,
    /// A one-time code was verified.
    OtpVerified,
    /// A one-time code verification failed.
    OtpFailed,
    /// The consent phrase matched.
    PhraseConfirmed,
    /// The consent phrase did not match.
    PhraseFailed,
    /// The request reached SIGNED; payload is the signed artifact.
    Signed,
    /// The request was withdrawn to REJECTED.
    Rejected,
    /// The request's due date elapsed; it was force-moved to EXPIRED.
    Expired,
}

impl EvidenceKind {
    /// Returns the canonical string representation of this kind.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ReadSummary => "READ_SUMMARY",
            Self::PasswordVerified => "PASSWORD_VERIFIED",
            Self::PasswordFailed => "PASSWORD_FAILED",
            Self::OtpSent => "OTP_SENT",
            Self::OtpVerified => "OTP_VERIFIED",
            Self::OtpFailed => "OTP_FAILED",
            Self::PhraseConfirmed => "PHRASE_CONFIRMED",
            Self::PhraseFailed => "PHRASE_FAILED",
            Self::Signed => "SIGNED",
            Self::Rejected => "REJECTED",
            Self::Expired => "EXPIRED",
        }
    }

    /// Parses a kind from its canonical string form.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "READ_SUMMARY" => Some(Self::ReadSummary),
            "PASSWORD_VERIFIED" => Some(Self::PasswordVerified),
            "PASSWORD_FAILED" => Some(Self::PasswordFailed),
            "OTP_SENT" => Some(Self::OtpSent),
            "OTP_VERIFIED" => Some(Self::OtpVerified),
            "OTP_FAILED" => Some(Self::OtpFailed),
            "PHRASE_CONFIRMED" => Some(Self::PhraseConfirmed),
            "PHRASE_FAILED" => Some(Self::PhraseFailed),
            "SIGNED" => Some(Self::Signed),
            "REJECTED" => Some(Self::Rejected),
            "EXPIRED" => Some(Self::Expired),
            _ => None,
        }
    }

    /// Returns all known kinds.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[
            Self::ReadSummary,
            Self::PasswordVerified,
            Self::PasswordFailed,
            Self::OtpSent,
            Self::OtpVerified,
            Self::OtpFailed,
            Self::PhraseConfirmed,
            Self::PhraseFailed,
            Self::Signed,
            Self::Rejected,
            Self::Expired,
        ]
    }

    /// Returns `true` if this kind documents a positive verification
    /// outcome required on the path to SIGNED.
    #[must_use]
    pub const fn is_required_positive(&self) -> bool {
        matches!(
            self,
            Self::PasswordVerified | Self::OtpVerified | Self::PhraseConfirmed
        )
    }
}

impl std::fmt::Display for EvidenceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One immutable fact in a request's evidence trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceRecord {
    /// Per-request monotone sequence number, starting at 0.
    pub seq: u64,
    /// Kind of fact recorded.
    pub kind: EvidenceKind,
    /// When the fact was recorded.
    pub timestamp: DateTime<Utc>,
    /// Kind-specific payload.
    pub payload: serde_json::Value,
}

/// Append-only sequence of evidence records for one request.
///
/// The only mutation is `append`; no update or delete operation
/// exists.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceTrail {
    records: Vec<EvidenceRecord>,
}

impl EvidenceTrail {
    /// Creates an empty trail.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reconstructs a trail from persisted records.
    ///
    /// Records are expected in sequence order; the next appended
    /// record continues from the highest existing `seq`.
    #[must_use]
    pub fn from_records(records: Vec<EvidenceRecord>) -> Self {
        Self { records }
    }

    /// Appends a record, assigning the next sequence number.
    pub fn append(
        &mut self,
        kind: EvidenceKind,
        timestamp: DateTime<Utc>,
        payload: serde_json::Value,
    ) -> &EvidenceRecord {
        let seq = self.records.last().map_or(0, |r| r.seq + 1);
        self.records.push(EvidenceRecord {
            seq,
            kind,
            timestamp,
            payload,
        });
        &self.records[self.records.len() - 1]
    }

    /// Returns the ordered records.
    #[must_use]
    pub fn records(&self) -> &[EvidenceRecord] {
        &self.records
    }

    /// Returns the number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns `true` if no records have been appended.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Returns the first record of the given kind, if any.
    #[must_use]
    pub fn first_of_kind(&self, kind: EvidenceKind) -> Option<&EvidenceRecord> {
        self.records.iter().find(|r| r.kind == kind)
    }

    /// Returns the positive verification kinds present, in trail
    /// order. For a SIGNED request this is exactly
    /// `[PASSWORD_VERIFIED, OTP_VERIFIED, PHRASE_CONFIRMED]`.
    #[must_use]
    pub fn positive_outcomes(&self) -> Vec<EvidenceKind> {
        self.records
            .iter()
            .filter(|r| r.kind.is_required_positive())
            .map(|r| r.kind)
            .collect()
    }
}
