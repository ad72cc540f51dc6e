//! The signing service: the workflow API exposed to the CRUD layer.
//!
//! Wraps the domain state machine with durable storage and a
//! per-request exclusive section. Concurrent operations on different
//! requests proceed fully in parallel; operations on the same request
//! are serialized (single-writer discipline), so two clients can never
//! race a state transition. Each operation loads the aggregate, drives
//! the machine once, and persists the transition together with its
//! evidence in one transaction — including failed attempts, which are
//! evidence too.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use consign_core::{
    AuthenticatorStore, DocumentStore, DocumentStoreError, EvidenceRecord, IdentityStore,
    NotificationDispatcher, OtpChannel, OtpMethod, PasswordReverifier, Priority, ReadingState,
    SignatureRequest, SignedArtifact, SigningConfig, SigningError, SigningStateMachine,
};
use secrecy::SecretString;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::store::{SqliteRequestStore, StoreError, StoredAggregate};

/// Errors surfaced by the signing service.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// A workflow rule refused the operation.
    #[error(transparent)]
    Workflow(#[from] SigningError),

    /// Durable storage failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The document store collaborator failed.
    #[error(transparent)]
    Document(#[from] DocumentStoreError),
}

/// External collaborators consumed by the service.
pub struct Collaborators {
    /// Identity store for credential re-verification.
    pub identity: Arc<dyn IdentityStore>,
    /// Out-of-band code delivery.
    pub dispatcher: Arc<dyn NotificationDispatcher>,
    /// Document fetch and signed-artifact archival.
    pub documents: Arc<dyn DocumentStore>,
    /// Authenticator secret verification.
    pub authenticator: Arc<dyn AuthenticatorStore>,
}

/// Durable, serialized front door for the signing workflow.
pub struct SigningService {
    store: SqliteRequestStore,
    config: SigningConfig,
    reverifier: PasswordReverifier,
    otp: OtpChannel,
    collaborators: Collaborators,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl SigningService {
    /// Creates a service over the given store and collaborators.
    #[must_use]
    pub fn new(
        store: SqliteRequestStore,
        config: SigningConfig,
        collaborators: Collaborators,
    ) -> Self {
        let reverifier = PasswordReverifier::new(config.password);
        let otp = OtpChannel::new(config.otp);
        Self {
            store,
            config,
            reverifier,
            otp,
            collaborators,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Creates a new PENDING signature request after confirming the
    /// document exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the document store cannot serve the
    /// document or the insert fails.
    pub async fn create_signature_request(
        &self,
        document_id: &str,
        subject_id: &str,
        priority: Priority,
        due_date: Option<DateTime<Utc>>,
    ) -> Result<SignatureRequest, ServiceError> {
        self.collaborators.documents.get_document(document_id)?;
        let request = SignatureRequest::new(document_id, subject_id, priority, due_date, Utc::now());
        self.store.insert_new(&request)?;
        info!(
            request_id = %request.id,
            document_id,
            subject_id,
            "signature request created"
        );
        Ok(request)
    }

    /// Merges a reading-progress report into the request's view phase.
    ///
    /// # Errors
    ///
    /// Returns the workflow's liveness and phase errors, or a storage
    /// error.
    pub async fn report_read_progress(
        &self,
        request_id: &str,
        scroll_percentage: u8,
        elapsed_seconds: u32,
    ) -> Result<ReadingState, ServiceError> {
        self.with_request(request_id, |machine, now| {
            machine.report_read_progress(scroll_percentage, elapsed_seconds, now)
        })
        .await
    }

    /// Re-verifies the subject's long-term credential.
    ///
    /// # Errors
    ///
    /// Returns `InvalidCredential`/`RateLimited` on failure (recorded
    /// as evidence), the liveness and phase errors, or a storage
    /// error.
    pub async fn submit_password_check(
        &self,
        request_id: &str,
        secret: SecretString,
    ) -> Result<(), ServiceError> {
        self.with_request(request_id, |machine, now| {
            machine.submit_password(
                &self.reverifier,
                self.collaborators.identity.as_ref(),
                &secret,
                now,
            )
        })
        .await
    }

    /// Issues a one-time code challenge, invalidating any predecessor.
    ///
    /// For the email method the code is dispatched out of band after
    /// the challenge is durably recorded; the call never blocks on
    /// delivery, and delivery failures are logged, not fatal.
    ///
    /// # Errors
    ///
    /// Returns the liveness and phase errors, or a storage error.
    pub async fn request_otp(
        &self,
        request_id: &str,
        method: OtpMethod,
    ) -> Result<(), ServiceError> {
        let (subject_id, code) = self
            .with_request(request_id, |machine, now| {
                let subject_id = machine.request().subject_id.clone();
                let challenge = machine.request_otp(&self.otp, method, now)?;
                Ok((subject_id, challenge.code.clone()))
            })
            .await?;

        if method == OtpMethod::Email {
            let dispatcher = Arc::clone(&self.collaborators.dispatcher);
            tokio::task::spawn_blocking(move || {
                if let Err(err) = dispatcher.send_code(&subject_id, OtpMethod::Email, &code) {
                    warn!(subject_id = %subject_id, error = %err, "one-time code delivery failed");
                }
            });
        }
        Ok(())
    }

    /// Verifies a submitted one-time code.
    ///
    /// # Errors
    ///
    /// Returns the channel's `OtpMismatch`/`OtpExpired`/
    /// `OtpAttemptsExhausted` (recorded as evidence), the liveness and
    /// phase errors, or a storage error.
    pub async fn submit_otp(&self, request_id: &str, code: &str) -> Result<(), ServiceError> {
        self.with_request(request_id, |machine, now| {
            machine.submit_otp(
                &self.otp,
                self.collaborators.authenticator.as_ref(),
                code,
                now,
            )
        })
        .await
    }

    /// Validates the typed consent phrase; on match the request is
    /// SIGNED and the artifact is archived with the document store.
    ///
    /// # Errors
    ///
    /// Returns `PhraseMismatch`/`VerificationExhausted` (recorded as
    /// evidence), the liveness and phase errors, a storage error, or
    /// an archival error (the request is already durably SIGNED when
    /// archival fails).
    pub async fn submit_phrase(
        &self,
        request_id: &str,
        text: &str,
        geolocation: Option<String>,
    ) -> Result<SignedArtifact, ServiceError> {
        let artifact = self
            .with_request(request_id, |machine, now| {
                machine.submit_phrase(text, geolocation.clone(), now)
            })
            .await?;

        info!(request_id, subject_id = %artifact.subject_id, "signature request signed");
        if let Err(err) = self
            .collaborators
            .documents
            .archive_signed_artifact(&artifact)
        {
            error!(request_id, error = %err, "signed artifact archival failed");
            return Err(err.into());
        }
        Ok(artifact)
    }

    /// Withdraws a non-terminal request to REJECTED. A no-op on
    /// already-terminal requests.
    ///
    /// # Errors
    ///
    /// Returns `RequestNotFound` or a storage error.
    pub async fn withdraw(&self, request_id: &str) -> Result<(), ServiceError> {
        let withdrawn = self
            .with_request(request_id, |machine, now| machine.withdraw(now))
            .await?;
        if withdrawn {
            info!(request_id, "signature request withdrawn");
        }
        Ok(())
    }

    /// Returns the ordered evidence trail, for audit and dispute
    /// resolution.
    ///
    /// # Errors
    ///
    /// Returns `RequestNotFound` or a storage error.
    pub async fn get_evidence_trail(
        &self,
        request_id: &str,
    ) -> Result<Vec<EvidenceRecord>, ServiceError> {
        if !self.store.exists(request_id)? {
            return Err(SigningError::RequestNotFound {
                request_id: request_id.to_string(),
            }
            .into());
        }
        Ok(self.store.evidence_trail(request_id)?)
    }

    /// Lists a subject's requests for the CRUD layer's inbox.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub async fn list_for_subject(
        &self,
        subject_id: &str,
    ) -> Result<Vec<SignatureRequest>, ServiceError> {
        Ok(self.store.list_for_subject(subject_id)?)
    }

    /// Number of requests currently holding an exclusive-section
    /// entry. Entries exist only while an operation on the request is
    /// in flight.
    #[must_use]
    pub fn active_request_locks(&self) -> usize {
        self.locks.lock().map(|locks| locks.len()).unwrap_or(0)
    }

    /// Runs one operation under the request's exclusive section.
    ///
    /// The aggregate is loaded, the machine driven once, and the
    /// resulting state persisted whether the operation succeeded or
    /// failed — negative outcomes carry evidence that must survive.
    /// The operation's own error is surfaced after a successful
    /// persist; a persist failure takes precedence, since the
    /// transition did not durably happen.
    async fn with_request<T>(
        &self,
        request_id: &str,
        operation: impl FnOnce(&mut SigningStateMachine, DateTime<Utc>) -> Result<T, SigningError>,
    ) -> Result<T, ServiceError> {
        let lock = self.request_lock(request_id)?;
        let outcome = {
            let _guard = lock.lock().await;
            self.drive_machine(request_id, operation)
        };
        self.release_request_lock(request_id, &lock);
        outcome
    }

    fn drive_machine<T>(
        &self,
        request_id: &str,
        operation: impl FnOnce(&mut SigningStateMachine, DateTime<Utc>) -> Result<T, SigningError>,
    ) -> Result<T, ServiceError> {
        let aggregate = self
            .store
            .load(request_id)?
            .ok_or_else(|| SigningError::RequestNotFound {
                request_id: request_id.to_string(),
            })?;
        let mut machine = SigningStateMachine::resume(
            self.config.clone(),
            aggregate.request,
            aggregate.reading,
            aggregate.challenge,
            aggregate.phrase_failures,
            aggregate.trail,
        );

        let result = operation(&mut machine, Utc::now());

        let (request, reading, challenge, phrase_failures, trail) = machine.into_parts();
        self.store.persist(&StoredAggregate {
            request,
            reading,
            challenge,
            phrase_failures,
            trail,
        })?;

        result.map_err(ServiceError::from)
    }

    fn request_lock(&self, request_id: &str) -> Result<Arc<tokio::sync::Mutex<()>>, ServiceError> {
        let mut locks = self.locks.lock().map_err(|_| SigningError::LockPoisoned)?;
        Ok(Arc::clone(
            locks.entry(request_id.to_string()).or_default(),
        ))
    }

    /// Drops the table entry once no other task holds the lock.
    ///
    /// At two strong handles the only holders are the table and this
    /// caller; cloning requires the table mutex, which is held here,
    /// so no task can acquire the entry between the count check and
    /// the removal.
    fn release_request_lock(&self, request_id: &str, lock: &Arc<tokio::sync::Mutex<()>>) {
        if let Ok(mut locks) = self.locks.lock() {
            if Arc::strong_count(lock) == 2 {
                locks.remove(request_id);
            }
        }
    }
}
