//! Storage collaborator traits
//!
//! Sealbox treats its backend as an external collaborator with a narrow
//! contract. These traits are that contract; `sealbox-storage` provides
//! in-memory and filesystem implementations.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::document::{Document, Fields, Patch, Precondition};
use crate::error::StoreError;
use crate::ids::Revision;

/// Document store keyed by `(collection, id)`
///
/// Every successful write bumps the document's [`Revision`]. Writes that
/// carry [`Precondition::Revision`] are compare-and-swap: they fail with
/// [`StoreError::RevisionConflict`] if another writer got there first.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Fetch a document
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError>;

    /// Create a document; fails with [`StoreError::AlreadyExists`] if present
    async fn create(&self, collection: &str, id: &str, fields: Fields) -> Result<Revision, StoreError>;

    /// Replace (or create) a document wholesale
    async fn set(
        &self,
        collection: &str,
        id: &str,
        fields: Fields,
        precondition: Precondition,
    ) -> Result<Revision, StoreError>;

    /// Apply patches to an existing document, all-or-nothing
    async fn update(
        &self,
        collection: &str,
        id: &str,
        patches: Vec<Patch>,
        precondition: Precondition,
    ) -> Result<Revision, StoreError>;

    /// Delete a document; deleting a missing document is not an error
    async fn delete(&self, collection: &str, id: &str, precondition: Precondition) -> Result<(), StoreError>;

    /// List every document in a collection, ordered by id
    async fn list(&self, collection: &str) -> Result<Vec<(String, Document)>, StoreError>;
}

/// Blob store addressed by path
///
/// Content is opaque bytes; encryption happens before `put`.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Read a blob
    async fn get(&self, path: &str) -> Result<Bytes, StoreError>;

    /// Write a blob, returning its stored size in bytes
    async fn put(&self, path: &str, data: Bytes) -> Result<u64, StoreError>;

    /// Remove a blob; removing a missing blob is not an error
    async fn delete(&self, path: &str) -> Result<(), StoreError>;

    /// Check whether a blob exists
    async fn exists(&self, path: &str) -> Result<bool, StoreError>;
}

/// Time abstraction for testability
pub trait Clock: Send + Sync {
    /// Get the current UTC datetime
    fn now_utc(&self) -> DateTime<Utc>;
}

/// Real clock implementation using system time
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
