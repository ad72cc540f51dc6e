//! End-to-end signing workflow scenarios.
//!
//! Drives the full service surface against a temp-file SQLite store
//! with in-memory collaborators:
//!
//! 1. Happy path: read -> password -> emailed code -> phrase (case
//!    differs) -> SIGNED with the expected evidence trail.
//! 2. Wrong password six times: the sixth attempt is rate limited and
//!    the request stays in the password gate.
//! 3. Past due date: any transition attempt expires the request.
//! 4. Withdrawal is idempotent on terminal requests.
//! 5. State survives a service restart on the same database file.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use consign_core::{
    AuthenticatorStore, DeliveryError, DocumentSource, DocumentStore, DocumentStoreError,
    EvidenceKind, IdentityStore, NotificationDispatcher, OtpMethod, Priority, RequestStatus,
    SignedArtifact, SigningConfig, SigningError, SigningPhase,
};
use consign_service::{Collaborators, ServiceError, SigningService, SqliteRequestStore};
use secrecy::{ExposeSecret, SecretString};
use tempfile::TempDir;

struct MemoryIdentity {
    secrets: HashMap<String, String>,
}

impl IdentityStore for MemoryIdentity {
    fn check_credential(&self, subject_id: &str, secret: &SecretString) -> bool {
        self.secrets
            .get(subject_id)
            .is_some_and(|expected| expected == secret.expose_secret())
    }
}

#[derive(Default)]
struct RecordingDispatcher {
    sent: Mutex<Vec<(String, String)>>,
}

impl NotificationDispatcher for RecordingDispatcher {
    fn send_code(
        &self,
        subject_id: &str,
        _method: OtpMethod,
        code: &str,
    ) -> Result<(), DeliveryError> {
        self.sent
            .lock()
            .unwrap()
            .push((subject_id.to_string(), code.to_string()));
        Ok(())
    }
}

#[derive(Default)]
struct MemoryDocuments {
    archived: Mutex<Vec<SignedArtifact>>,
}

impl DocumentStore for MemoryDocuments {
    fn get_document(&self, document_id: &str) -> Result<DocumentSource, DocumentStoreError> {
        if document_id == "missing-doc" {
            return Err(DocumentStoreError::NotFound {
                document_id: document_id.to_string(),
            });
        }
        Ok(DocumentSource::Inline("terms and conditions".to_string()))
    }

    fn archive_signed_artifact(&self, artifact: &SignedArtifact) -> Result<(), DocumentStoreError> {
        self.archived.lock().unwrap().push(artifact.clone());
        Ok(())
    }
}

struct DenyAllAuthenticator;

impl AuthenticatorStore for DenyAllAuthenticator {
    fn verify_authenticator_code(&self, _subject_id: &str, _code: &str) -> bool {
        false
    }
}

struct Harness {
    service: SigningService,
    db_path: PathBuf,
    dispatcher: Arc<RecordingDispatcher>,
    documents: Arc<MemoryDocuments>,
    _dir: TempDir,
}

fn harness() -> Harness {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("consign.db");
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let documents = Arc::new(MemoryDocuments::default());
    let service = build_service(&db_path, &dispatcher, &documents);
    Harness {
        service,
        db_path,
        dispatcher,
        documents,
        _dir: dir,
    }
}

fn build_service(
    db_path: &PathBuf,
    dispatcher: &Arc<RecordingDispatcher>,
    documents: &Arc<MemoryDocuments>,
) -> SigningService {
    let store = SqliteRequestStore::open(db_path).unwrap();
    let identity = MemoryIdentity {
        secrets: HashMap::from([("subject-1".to_string(), "hunter2".to_string())]),
    };
    SigningService::new(
        store,
        SigningConfig::default(),
        Collaborators {
            identity: Arc::new(identity),
            dispatcher: Arc::clone(dispatcher) as Arc<dyn NotificationDispatcher>,
            documents: Arc::clone(documents) as Arc<dyn DocumentStore>,
            authenticator: Arc::new(DenyAllAuthenticator),
        },
    )
}

/// Reads the live challenge code through a second store handle on the
/// same database file; the challenge is durably recorded before
/// `request_otp` returns.
fn live_code(db_path: &PathBuf, request_id: &str) -> String {
    let store = SqliteRequestStore::open(db_path).unwrap();
    store
        .load(request_id)
        .unwrap()
        .unwrap()
        .challenge
        .unwrap()
        .code
}

fn secret(s: &str) -> SecretString {
    SecretString::new(s.to_string())
}

#[tokio::test(flavor = "multi_thread")]
async fn happy_path_produces_signed_request_with_full_trail() {
    let h = harness();

    let request = h
        .service
        .create_signature_request("doc-1", "subject-1", Priority::Normal, None)
        .await
        .unwrap();
    assert_eq!(request.status, RequestStatus::Pending);

    let state = h
        .service
        .report_read_progress(&request.id, 95, 40)
        .await
        .unwrap();
    assert!(state.threshold_met);

    h.service
        .submit_password_check(&request.id, secret("hunter2"))
        .await
        .unwrap();

    h.service
        .request_otp(&request.id, OtpMethod::Email)
        .await
        .unwrap();
    let code = live_code(&h.db_path, &request.id);
    h.service.submit_otp(&request.id, &code).await.unwrap();

    // Required phrase with differing case; normalization absorbs it.
    let artifact = h
        .service
        .submit_phrase(
            &request.id,
            "I HAVE READ AND AGREE TO THIS DOCUMENT",
            Some("52.52N 13.40E".to_string()),
        )
        .await
        .unwrap();
    assert_eq!(artifact.document_id, "doc-1");
    assert_eq!(artifact.read_summary.max_scroll_percentage, 95);
    assert_eq!(
        artifact.verification_methods,
        vec!["PASSWORD", "OTP_EMAIL", "PHRASE"]
    );
    assert_eq!(artifact.geolocation.as_deref(), Some("52.52N 13.40E"));

    // The artifact reached the document store.
    assert_eq!(h.documents.archived.lock().unwrap().len(), 1);

    // Evidence: the three positive entries in gate order, plus the
    // READ_SUMMARY before them and SIGNED at the end.
    let trail = h.service.get_evidence_trail(&request.id).await.unwrap();
    let kinds: Vec<EvidenceKind> = trail.iter().map(|r| r.kind).collect();
    assert_eq!(
        kinds,
        vec![
            EvidenceKind::ReadSummary,
            EvidenceKind::PasswordVerified,
            EvidenceKind::OtpSent,
            EvidenceKind::OtpVerified,
            EvidenceKind::PhraseConfirmed,
            EvidenceKind::Signed,
        ]
    );
    let seqs: Vec<u64> = trail.iter().map(|r| r.seq).collect();
    assert_eq!(seqs, vec![0, 1, 2, 3, 4, 5]);

    // Terminal: no further transition is permitted.
    let err = h
        .service
        .report_read_progress(&request.id, 10, 1)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ServiceError::Workflow(SigningError::RequestAlreadyTerminal { .. })
    ));

    // The emailed code was eventually dispatched out of band.
    let mut delivered = false;
    for _ in 0..100 {
        if let Some((subject, sent_code)) = h.dispatcher.sent.lock().unwrap().first().cloned() {
            assert_eq!(subject, "subject-1");
            assert_eq!(sent_code, code);
            delivered = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(delivered, "code was never dispatched");
}

#[tokio::test(flavor = "multi_thread")]
async fn sixth_wrong_password_is_rate_limited() {
    let h = harness();
    let request = h
        .service
        .create_signature_request("doc-1", "subject-1", Priority::High, None)
        .await
        .unwrap();
    h.service
        .report_read_progress(&request.id, 95, 40)
        .await
        .unwrap();

    for _ in 0..5 {
        let err = h
            .service
            .submit_password_check(&request.id, secret("wrong"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ServiceError::Workflow(SigningError::InvalidCredential { .. })
        ));
    }
    let err = h
        .service
        .submit_password_check(&request.id, secret("wrong"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ServiceError::Workflow(SigningError::RateLimited { .. })
    ));

    // Still parked in the password gate, with every failure recorded.
    let listed = h.service.list_for_subject("subject-1").await.unwrap();
    assert_eq!(listed[0].status, RequestStatus::Viewed);
    assert_eq!(listed[0].phase, SigningPhase::PasswordCheck);

    let trail = h.service.get_evidence_trail(&request.id).await.unwrap();
    let failures = trail
        .iter()
        .filter(|r| r.kind == EvidenceKind::PasswordFailed)
        .count();
    assert_eq!(failures, 6);
}

#[tokio::test(flavor = "multi_thread")]
async fn past_due_request_expires_on_any_transition() {
    let h = harness();
    let request = h
        .service
        .create_signature_request(
            "doc-1",
            "subject-1",
            Priority::Normal,
            Some(Utc::now() - ChronoDuration::hours(1)),
        )
        .await
        .unwrap();

    let err = h
        .service
        .report_read_progress(&request.id, 95, 40)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ServiceError::Workflow(SigningError::RequestExpired { .. })
    ));

    let listed = h.service.list_for_subject("subject-1").await.unwrap();
    assert_eq!(listed[0].status, RequestStatus::Expired);

    let trail = h.service.get_evidence_trail(&request.id).await.unwrap();
    assert_eq!(trail.len(), 1);
    assert_eq!(trail[0].kind, EvidenceKind::Expired);
}

#[tokio::test(flavor = "multi_thread")]
async fn withdraw_is_idempotent() {
    let h = harness();
    let request = h
        .service
        .create_signature_request("doc-1", "subject-1", Priority::Low, None)
        .await
        .unwrap();

    h.service.withdraw(&request.id).await.unwrap();
    let trail = h.service.get_evidence_trail(&request.id).await.unwrap();
    assert_eq!(trail.len(), 1);
    assert_eq!(trail[0].kind, EvidenceKind::Rejected);

    // Second withdraw: no error, no new evidence.
    h.service.withdraw(&request.id).await.unwrap();
    let trail = h.service.get_evidence_trail(&request.id).await.unwrap();
    assert_eq!(trail.len(), 1);

    let listed = h.service.list_for_subject("subject-1").await.unwrap();
    assert_eq!(listed[0].status, RequestStatus::Rejected);
}

#[tokio::test(flavor = "multi_thread")]
async fn reissue_invalidates_stale_code() {
    let h = harness();
    let request = h
        .service
        .create_signature_request("doc-1", "subject-1", Priority::Normal, None)
        .await
        .unwrap();
    h.service
        .report_read_progress(&request.id, 95, 40)
        .await
        .unwrap();
    h.service
        .submit_password_check(&request.id, secret("hunter2"))
        .await
        .unwrap();

    h.service
        .request_otp(&request.id, OtpMethod::Email)
        .await
        .unwrap();
    let stale = live_code(&h.db_path, &request.id);

    // Re-issue until the live code differs from the stale one, so the
    // stale submission below cannot accidentally match.
    let mut fresh = stale.clone();
    while fresh == stale {
        h.service
            .request_otp(&request.id, OtpMethod::Email)
            .await
            .unwrap();
        fresh = live_code(&h.db_path, &request.id);
    }

    let err = h.service.submit_otp(&request.id, &stale).await.unwrap_err();
    assert!(matches!(
        err,
        ServiceError::Workflow(SigningError::OtpMismatch { .. })
    ));

    h.service.submit_otp(&request.id, &fresh).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn state_survives_service_restart() {
    let h = harness();
    let request = h
        .service
        .create_signature_request("doc-1", "subject-1", Priority::Normal, None)
        .await
        .unwrap();
    h.service
        .report_read_progress(&request.id, 95, 40)
        .await
        .unwrap();
    h.service
        .submit_password_check(&request.id, secret("hunter2"))
        .await
        .unwrap();
    h.service
        .request_otp(&request.id, OtpMethod::Email)
        .await
        .unwrap();
    let code = live_code(&h.db_path, &request.id);
    drop(h.service);

    // A fresh service over the same database resumes mid-workflow.
    let service = build_service(&h.db_path, &h.dispatcher, &h.documents);
    service.submit_otp(&request.id, &code).await.unwrap();
    service
        .submit_phrase(&request.id, "I have read and agree to this document", None)
        .await
        .unwrap();

    let listed = service.list_for_subject("subject-1").await.unwrap();
    assert_eq!(listed[0].status, RequestStatus::Signed);
}

#[tokio::test(flavor = "multi_thread")]
async fn lock_table_drains_after_operations() {
    let h = harness();
    let service = Arc::new(build_service(&h.db_path, &h.dispatcher, &h.documents));
    drop(h.service);

    let mut ids = Vec::new();
    for _ in 0..3 {
        let request = service
            .create_signature_request("doc-1", "subject-1", Priority::Normal, None)
            .await
            .unwrap();
        ids.push(request.id);
    }

    // Contended partial-progress reports on every request; none meets
    // the read threshold, so each request stays in the view phase.
    let mut tasks = Vec::new();
    for id in &ids {
        for _ in 0..4 {
            let service = Arc::clone(&service);
            let id = id.clone();
            tasks.push(tokio::spawn(async move {
                service.report_read_progress(&id, 10, 1).await.unwrap();
            }));
        }
    }
    for task in tasks {
        task.await.unwrap();
    }
    assert_eq!(service.active_request_locks(), 0);

    // Failing operations release their entry as well.
    let err = service
        .report_read_progress("no-such-request", 50, 5)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ServiceError::Workflow(SigningError::RequestNotFound { .. })
    ));
    assert_eq!(service.active_request_locks(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_document_refuses_creation() {
    let h = harness();
    let err = h
        .service
        .create_signature_request("missing-doc", "subject-1", Priority::Normal, None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ServiceError::Document(DocumentStoreError::NotFound { .. })
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_request_is_reported() {
    let h = harness();
    let err = h
        .service
        .get_evidence_trail("no-such-request")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ServiceError::Workflow(SigningError::RequestNotFound { .. })
    ));

    let err = h
        .service
        .report_read_progress("no-such-request", 50, 5)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ServiceError::Workflow(SigningError::RequestNotFound { .. })
    ));
}
