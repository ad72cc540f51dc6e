//! Durable request storage using `SQLite`.
//!
//! Persists the full request aggregate between calls: the request row,
//! its live reading session and one-time code challenge, the phrase
//! failure counter, and the append-only evidence trail. A state
//! transition and the evidence documenting it are written inside one
//! `BEGIN IMMEDIATE` transaction, so they succeed or fail together.
//!
//! # Schema
//!
//! - `signature_requests`: one row per request (status, phase, dates,
//!   priority, phrase failure counter).
//! - `reading_sessions`: at most one live row per request during the
//!   view phase.
//! - `otp_challenges`: at most one live row per request during the
//!   OTP phase.
//! - `evidence_records`: append-only, keyed by `(request_id, seq)`;
//!   rows are never updated or deleted.

use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use consign_core::{
    EvidenceKind, EvidenceRecord, EvidenceTrail, OtpChallenge, OtpMethod, Priority,
    ReadingSession, RequestStatus, SignatureRequest, SigningPhase,
};
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;

/// Errors from the request store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying `SQLite` operation failed.
    #[error("sqlite operation failed: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Evidence payload could not be (de)serialized.
    #[error("payload serialization failed: {0}")]
    Serde(#[from] serde_json::Error),

    /// A persisted value could not be decoded.
    #[error("corrupt row: {column} = {value:?}")]
    Corrupt {
        /// The offending column.
        column: &'static str,
        /// The value that failed to decode.
        value: String,
    },

    /// The connection lock was poisoned by a panicking thread.
    #[error("store lock poisoned")]
    LockPoisoned,
}

/// The persisted aggregate for one signature request.
#[derive(Debug, Clone)]
pub struct StoredAggregate {
    /// The request row.
    pub request: SignatureRequest,
    /// Live reading session, present only during the view phase.
    pub reading: Option<ReadingSession>,
    /// Live challenge, present only inside the OTP phase.
    pub challenge: Option<OtpChallenge>,
    /// Consent-phrase mismatches so far.
    pub phrase_failures: u32,
    /// The full evidence trail, in sequence order.
    pub trail: EvidenceTrail,
}

/// `SQLite`-backed store for signature request aggregates.
#[derive(Debug, Clone)]
pub struct SqliteRequestStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteRequestStore {
    /// Opens (or creates) a store at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or the schema
    /// cannot be created.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// Opens an in-memory store, for tests.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema cannot be created.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_schema(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS signature_requests (
                id TEXT PRIMARY KEY,
                document_id TEXT NOT NULL,
                subject_id TEXT NOT NULL,
                status TEXT NOT NULL,
                phase TEXT NOT NULL,
                requested_at INTEGER NOT NULL,
                due_date INTEGER,
                priority TEXT NOT NULL,
                phrase_failures INTEGER NOT NULL DEFAULT 0
            );
            CREATE TABLE IF NOT EXISTS reading_sessions (
                request_id TEXT PRIMARY KEY,
                max_scroll_percentage INTEGER NOT NULL,
                elapsed_seconds INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS otp_challenges (
                request_id TEXT PRIMARY KEY,
                challenge_id TEXT NOT NULL,
                purpose TEXT NOT NULL,
                code TEXT NOT NULL,
                method TEXT NOT NULL,
                issued_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL,
                attempt_count INTEGER NOT NULL,
                verified INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS evidence_records (
                request_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                kind TEXT NOT NULL,
                timestamp_ms INTEGER NOT NULL,
                payload TEXT NOT NULL,
                PRIMARY KEY (request_id, seq)
            );
            CREATE INDEX IF NOT EXISTS idx_requests_subject
                ON signature_requests (subject_id, requested_at);",
        )?;
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }

    /// Inserts a freshly created request with an empty reading session.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails (including a duplicate id).
    pub fn insert_new(&self, request: &SignatureRequest) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute_batch("BEGIN IMMEDIATE TRANSACTION;")?;
        let result = (|| -> Result<(), StoreError> {
            conn.execute(
                "INSERT INTO signature_requests
                    (id, document_id, subject_id, status, phase, requested_at, due_date, priority, phrase_failures)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0)",
                params![
                    request.id,
                    request.document_id,
                    request.subject_id,
                    request.status.as_str(),
                    request.phase.as_str(),
                    request.requested_at.timestamp_millis(),
                    request.due_date.map(|d| d.timestamp_millis()),
                    request.priority.as_str(),
                ],
            )?;
            conn.execute(
                "INSERT INTO reading_sessions (request_id, max_scroll_percentage, elapsed_seconds)
                 VALUES (?1, 0, 0)",
                params![request.id],
            )?;
            Ok(())
        })();
        finish_transaction(&conn, result)
    }

    /// Loads the full aggregate for a request, if it exists.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure or a row that cannot be
    /// decoded.
    pub fn load(&self, request_id: &str) -> Result<Option<StoredAggregate>, StoreError> {
        let conn = self.lock()?;

        let row = conn
            .query_row(
                "SELECT id, document_id, subject_id, status, phase, requested_at, due_date,
                        priority, phrase_failures
                 FROM signature_requests WHERE id = ?1",
                params![request_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, i64>(5)?,
                        row.get::<_, Option<i64>>(6)?,
                        row.get::<_, String>(7)?,
                        row.get::<_, u32>(8)?,
                    ))
                },
            )
            .optional()?;

        let Some((id, document_id, subject_id, status, phase, requested_at, due_date, priority, phrase_failures)) =
            row
        else {
            return Ok(None);
        };

        let request = SignatureRequest {
            id,
            document_id,
            subject_id,
            status: RequestStatus::parse(&status).ok_or(StoreError::Corrupt {
                column: "status",
                value: status.clone(),
            })?,
            phase: SigningPhase::parse(&phase).ok_or(StoreError::Corrupt {
                column: "phase",
                value: phase.clone(),
            })?,
            requested_at: decode_timestamp("requested_at", requested_at)?,
            due_date: due_date
                .map(|ms| decode_timestamp("due_date", ms))
                .transpose()?,
            priority: Priority::parse(&priority).ok_or(StoreError::Corrupt {
                column: "priority",
                value: priority.clone(),
            })?,
        };

        let reading = conn
            .query_row(
                "SELECT max_scroll_percentage, elapsed_seconds
                 FROM reading_sessions WHERE request_id = ?1",
                params![request_id],
                |row| {
                    Ok(ReadingSession {
                        max_scroll_percentage: row.get(0)?,
                        elapsed_seconds: row.get(1)?,
                    })
                },
            )
            .optional()?;

        let challenge = conn
            .query_row(
                "SELECT challenge_id, purpose, code, method, issued_at, expires_at,
                        attempt_count, verified
                 FROM otp_challenges WHERE request_id = ?1",
                params![request_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, i64>(5)?,
                        row.get::<_, u32>(6)?,
                        row.get::<_, bool>(7)?,
                    ))
                },
            )
            .optional()?;
        let challenge = challenge
            .map(
                |(challenge_id, purpose, code, method, issued_at, expires_at, attempt_count, verified)| {
                    Ok::<_, StoreError>(OtpChallenge {
                        id: challenge_id,
                        purpose,
                        code,
                        method: OtpMethod::parse(&method).ok_or(StoreError::Corrupt {
                            column: "method",
                            value: method.clone(),
                        })?,
                        issued_at: decode_timestamp("issued_at", issued_at)?,
                        expires_at: decode_timestamp("expires_at", expires_at)?,
                        attempt_count,
                        verified,
                    })
                },
            )
            .transpose()?;

        let trail = EvidenceTrail::from_records(Self::evidence_records(&conn, request_id)?);

        Ok(Some(StoredAggregate {
            request,
            reading,
            challenge,
            phrase_failures,
            trail,
        }))
    }

    /// Persists an aggregate: the request row, the live session and
    /// challenge, and any evidence records appended since the last
    /// persist. One transaction covers all of it.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure; the transaction is rolled
    /// back and nothing is written.
    pub fn persist(&self, aggregate: &StoredAggregate) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute_batch("BEGIN IMMEDIATE TRANSACTION;")?;
        let result = (|| -> Result<(), StoreError> {
            let request = &aggregate.request;
            conn.execute(
                "UPDATE signature_requests
                 SET status = ?2, phase = ?3, due_date = ?4, phrase_failures = ?5
                 WHERE id = ?1",
                params![
                    request.id,
                    request.status.as_str(),
                    request.phase.as_str(),
                    request.due_date.map(|d| d.timestamp_millis()),
                    aggregate.phrase_failures,
                ],
            )?;

            conn.execute(
                "DELETE FROM reading_sessions WHERE request_id = ?1",
                params![request.id],
            )?;
            if let Some(reading) = &aggregate.reading {
                conn.execute(
                    "INSERT INTO reading_sessions (request_id, max_scroll_percentage, elapsed_seconds)
                     VALUES (?1, ?2, ?3)",
                    params![request.id, reading.max_scroll_percentage, reading.elapsed_seconds],
                )?;
            }

            conn.execute(
                "DELETE FROM otp_challenges WHERE request_id = ?1",
                params![request.id],
            )?;
            if let Some(challenge) = &aggregate.challenge {
                conn.execute(
                    "INSERT INTO otp_challenges
                        (request_id, challenge_id, purpose, code, method, issued_at, expires_at,
                         attempt_count, verified)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    params![
                        request.id,
                        challenge.id,
                        challenge.purpose,
                        challenge.code,
                        challenge.method.as_str(),
                        challenge.issued_at.timestamp_millis(),
                        challenge.expires_at.timestamp_millis(),
                        challenge.attempt_count,
                        challenge.verified,
                    ],
                )?;
            }

            // Evidence is append-only: insert only records beyond the
            // highest persisted sequence number.
            let persisted: i64 = conn.query_row(
                "SELECT COALESCE(MAX(seq), -1) FROM evidence_records WHERE request_id = ?1",
                params![request.id],
                |row| row.get(0),
            )?;
            for record in aggregate.trail.records() {
                let seq = i64::try_from(record.seq).unwrap_or(i64::MAX);
                if seq <= persisted {
                    continue;
                }
                conn.execute(
                    "INSERT INTO evidence_records (request_id, seq, kind, timestamp_ms, payload)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        request.id,
                        seq,
                        record.kind.as_str(),
                        record.timestamp.timestamp_millis(),
                        serde_json::to_string(&record.payload)?,
                    ],
                )?;
            }
            Ok(())
        })();
        finish_transaction(&conn, result)
    }

    /// Returns `true` if a request with the given id exists.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure.
    pub fn exists(&self, request_id: &str) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM signature_requests WHERE id = ?1",
                params![request_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Returns the ordered evidence trail for a request.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure or an undecodable row.
    pub fn evidence_trail(&self, request_id: &str) -> Result<Vec<EvidenceRecord>, StoreError> {
        let conn = self.lock()?;
        Self::evidence_records(&conn, request_id)
    }

    fn evidence_records(
        conn: &Connection,
        request_id: &str,
    ) -> Result<Vec<EvidenceRecord>, StoreError> {
        let mut stmt = conn.prepare(
            "SELECT seq, kind, timestamp_ms, payload
             FROM evidence_records WHERE request_id = ?1 ORDER BY seq",
        )?;
        let rows = stmt.query_map(params![request_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (seq, kind, timestamp_ms, payload) = row?;
            records.push(EvidenceRecord {
                seq: u64::try_from(seq).map_err(|_| StoreError::Corrupt {
                    column: "seq",
                    value: seq.to_string(),
                })?,
                kind: EvidenceKind::parse(&kind).ok_or(StoreError::Corrupt {
                    column: "kind",
                    value: kind.clone(),
                })?,
                timestamp: decode_timestamp("timestamp_ms", timestamp_ms)?,
                payload: serde_json::from_str(&payload)?,
            });
        }
        Ok(records)
    }

    /// Lists a subject's requests in creation order, for the external
    /// CRUD layer's pending-signature inbox.
    ///
    /// # Errors
    ///
    /// Returns an error on storage failure or an undecodable row.
    pub fn list_for_subject(&self, subject_id: &str) -> Result<Vec<SignatureRequest>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, document_id, subject_id, status, phase, requested_at, due_date, priority
             FROM signature_requests WHERE subject_id = ?1 ORDER BY requested_at",
        )?;
        let rows = stmt.query_map(params![subject_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, i64>(5)?,
                row.get::<_, Option<i64>>(6)?,
                row.get::<_, String>(7)?,
            ))
        })?;

        let mut requests = Vec::new();
        for row in rows {
            let (id, document_id, subject_id, status, phase, requested_at, due_date, priority) =
                row?;
            requests.push(SignatureRequest {
                id,
                document_id,
                subject_id,
                status: RequestStatus::parse(&status).ok_or(StoreError::Corrupt {
                    column: "status",
                    value: status.clone(),
                })?,
                phase: SigningPhase::parse(&phase).ok_or(StoreError::Corrupt {
                    column: "phase",
                    value: phase.clone(),
                })?,
                requested_at: decode_timestamp("requested_at", requested_at)?,
                due_date: due_date
                    .map(|ms| decode_timestamp("due_date", ms))
                    .transpose()?,
                priority: Priority::parse(&priority).ok_or(StoreError::Corrupt {
                    column: "priority",
                    value: priority.clone(),
                })?,
            });
        }
        Ok(requests)
    }
}

fn finish_transaction(conn: &Connection, result: Result<(), StoreError>) -> Result<(), StoreError> {
    match result {
        Ok(()) => {
            conn.execute_batch("COMMIT;")?;
            Ok(())
        },
        Err(err) => {
            let _ = conn.execute_batch("ROLLBACK;");
            Err(err)
        },
    }
}

fn decode_timestamp(column: &'static str, ms: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(ms).ok_or(StoreError::Corrupt {
        column,
        value: ms.to_string(),
    })
}
