//! consign-service - Durable Signing Workflow Service
//!
//! Server-side home of the electronic-signature consent workflow. The
//! domain state machine in `consign-core` is pure and in-memory; this
//! crate makes it durable and safe to drive from concurrent clients:
//!
//! - [`store::SqliteRequestStore`] persists each request aggregate
//!   (status, phase, live reading session and challenge, and the
//!   append-only evidence trail) between calls, so the evidentiary
//!   guarantee survives client disconnects.
//! - [`service::SigningService`] exposes the workflow API consumed by
//!   the surrounding CRUD layer, serializing operations per request id
//!   and writing each transition together with its evidence in one
//!   transaction.
//!
//! # Runtime Requirements
//!
//! [`SigningService`] methods are async and dispatch one-time code
//! delivery on the tokio blocking pool; run it inside a tokio runtime.

pub mod service;
pub mod store;

pub use service::{Collaborators, ServiceError, SigningService};
pub use store::{SqliteRequestStore, StoreError, StoredAggregate};
