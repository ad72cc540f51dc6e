//! consign-core - Electronic-Signature Consent Workflow
//!
//! A guarded state machine that proves a named subject read a document
//! and affirmatively consented to it, producing evidence defensible in
//! a dispute. The surrounding CRUD layer creates [`SignatureRequest`]s
//! and later reads their terminal state; everything between is driven
//! through the [`SigningStateMachine`].
//!
//! # Workflow
//!
//! ```text
//! PENDING(view) --[read threshold]--> PASSWORD_CHECK --[reverify ok]-->
//! OTP_CHECK --[code verified]--> PHRASE_CHECK --[phrase match]--> SIGNED
//! ```
//!
//! Each gate's exit condition is satisfied by one collaborator: the
//! reading-progress tracker, the password re-verifier, the one-time
//! code channel, and the phrase validator. Every transition, including
//! failed attempts, is appended to the request's immutable evidence
//! trail.
//!
//! # Modules
//!
//! - [`request`]: the `SignatureRequest` aggregate and its enums
//! - [`reading`]: reading-progress accumulation and the read gate
//! - [`password`]: credential re-verification with rate limiting
//! - [`otp`]: one-time code issuance and verification
//! - [`phrase`]: consent-phrase confirmation
//! - [`evidence`]: the append-only evidence trail
//! - [`machine`]: the orchestrating state machine
//! - [`config`]: workflow thresholds, TOML-loadable
//! - [`error`]: the workflow error taxonomy
//!
//! This crate is pure domain logic: no storage, no network, no
//! runtime. Expiry is a lazy wall-clock comparison against a
//! caller-supplied `now`, so behavior is fully deterministic under
//! test. Durable persistence and request-level serialization live in
//! `consign-service`.

pub mod config;
pub mod error;
pub mod evidence;
pub mod machine;
pub mod otp;
pub mod password;
pub mod phrase;
pub mod reading;
pub mod request;

pub use config::{ConfigError, OtpPolicy, PhraseConfig, ReadGateConfig, ReverifyPolicy, SigningConfig};
pub use error::SigningError;
pub use evidence::{EvidenceKind, EvidenceRecord, EvidenceTrail};
pub use machine::{
    DocumentSource, DocumentStore, DocumentStoreError, SignedArtifact, SigningStateMachine,
};
pub use otp::{
    AuthenticatorStore, DeliveryError, NotificationDispatcher, OtpChallenge, OtpChannel, OtpMethod,
};
pub use password::{IdentityStore, PasswordReverifier};
pub use reading::{ReadingSession, ReadingState};
pub use request::{Priority, RequestStatus, SignatureRequest, SigningPhase};
