//! # Sealbox Core
//!
//! Identifiers, the document model, and the storage collaborator traits
//! shared by every Sealbox crate.
//!
//! The envelope layer never talks to a concrete backend. It sees:
//!
//! - [`DocumentStore`]: a map-of-maps keyed by collection and document id,
//!   with field patches (array union/remove, map entries, counters,
//!   server timestamps) and revision-guarded conditional writes
//! - [`BlobStore`]: opaque bytes addressed by path
//! - [`Clock`]: time source for server-assigned timestamps
//!
//! ## Key Types
//!
//! - [`UserId`] / [`ResourceId`]: opaque string identifiers
//! - [`ResourceKind`]: file, folder, group or conversation
//! - [`Revision`]: monotonically increasing document version used for
//!   compare-and-swap updates
//! - [`Patch`] / [`Precondition`]: how documents are mutated

pub mod document;
pub mod error;
pub mod ids;
pub mod traits;

pub use document::{Document, Fields, Patch, Precondition};
pub use error::{StoreError, StoreResult};
pub use ids::{ResourceId, ResourceKind, Revision, UserId};
pub use traits::{BlobStore, Clock, DocumentStore, SystemClock};

/// Tracing target for integrity failures that may indicate tampering
pub const AUDIT_TARGET: &str = "sealbox::audit";
