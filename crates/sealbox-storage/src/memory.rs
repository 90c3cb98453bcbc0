//! In-memory storage implementations
//!
//! This module provides in-memory implementations of the storage traits,
//! suitable for tests and single-process deployments.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::{debug, trace};

use sealbox_core::{
    BlobStore, Clock, Document, DocumentStore, Fields, Patch, Precondition, Revision, StoreError, SystemClock,
};

type DocKey = (String, String);

/// In-memory implementation of [`DocumentStore`]
///
/// Uses `DashMap` for concurrent access. Each write holds the entry's
/// shard lock from precondition check to commit, so conditional writes
/// are true compare-and-swap operations.
///
/// Server timestamps are strictly increasing across the whole store even
/// if the clock stalls or steps backwards.
pub struct InMemoryDocumentStore {
    documents: DashMap<DocKey, Document>,
    clock: Arc<dyn Clock>,
    last_timestamp: AtomicI64,
    max_documents: Option<usize>,
}

impl Default for InMemoryDocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryDocumentStore {
    /// Create a new store on the system clock
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a store with a custom clock
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            documents: DashMap::new(),
            clock,
            last_timestamp: AtomicI64::new(0),
            max_documents: None,
        }
    }

    /// Limit the number of documents the store accepts
    pub fn with_capacity_limit(mut self, max_documents: usize) -> Self {
        self.max_documents = Some(max_documents);
        self
    }

    /// Total number of documents across all collections
    pub fn len(&self) -> usize {
        self.documents.len()
    }

    /// Check if the store is empty
    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// Next server timestamp in Unix millis, strictly greater than the last
    fn next_timestamp(&self) -> i64 {
        let now = self.clock.now_utc().timestamp_millis();
        let previous = self
            .last_timestamp
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| Some(now.max(last + 1)))
            .unwrap_or_else(|last| last);
        now.max(previous + 1)
    }

    fn check_capacity(&self) -> Result<(), StoreError> {
        match self.max_documents {
            Some(max) if self.documents.len() >= max => Err(StoreError::CapacityExceeded),
            _ => Ok(()),
        }
    }

    fn new_document(&self, fields: Fields, revision: Revision) -> Document {
        Document {
            revision,
            updated_at: self.clock.now_utc(),
            fields,
        }
    }
}

fn key(collection: &str, id: &str) -> DocKey {
    (collection.to_string(), id.to_string())
}

fn describe(collection: &str, id: &str) -> String {
    format!("{}/{}", collection, id)
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError> {
        Ok(self.documents.get(&key(collection, id)).map(|doc| doc.clone()))
    }

    async fn create(&self, collection: &str, id: &str, fields: Fields) -> Result<Revision, StoreError> {
        self.check_capacity()?;

        match self.documents.entry(key(collection, id)) {
            Entry::Occupied(_) => Err(StoreError::AlreadyExists(describe(collection, id))),
            Entry::Vacant(slot) => {
                slot.insert(self.new_document(fields, Revision::INITIAL));
                debug!(collection, id, "Created document");
                Ok(Revision::INITIAL)
            }
        }
    }

    async fn set(
        &self,
        collection: &str,
        id: &str,
        fields: Fields,
        precondition: Precondition,
    ) -> Result<Revision, StoreError> {
        let doc_key = key(collection, id);
        // Capacity is checked before taking the entry lock; `len` locks every shard
        if !self.documents.contains_key(&doc_key) {
            self.check_capacity()?;
        }

        match self.documents.entry(doc_key) {
            Entry::Occupied(mut slot) => {
                let current = slot.get().revision;
                precondition.check(current)?;
                let revision = current.next();
                slot.insert(self.new_document(fields, revision));
                trace!(collection, id, revision = %revision, "Replaced document");
                Ok(revision)
            }
            Entry::Vacant(slot) => {
                if let Precondition::Revision(_) = precondition {
                    return Err(StoreError::not_found(describe(collection, id)));
                }
                slot.insert(self.new_document(fields, Revision::INITIAL));
                trace!(collection, id, "Created document via set");
                Ok(Revision::INITIAL)
            }
        }
    }

    async fn update(
        &self,
        collection: &str,
        id: &str,
        patches: Vec<Patch>,
        precondition: Precondition,
    ) -> Result<Revision, StoreError> {
        let mut slot = self
            .documents
            .get_mut(&key(collection, id))
            .ok_or_else(|| StoreError::not_found(describe(collection, id)))?;

        let current = slot.revision;
        if let Err(e) = precondition.check(current) {
            debug!(collection, id, current = %current, "Conditional update lost the race");
            return Err(e);
        }

        // Apply to a copy so a failing patch leaves the document untouched
        let now = self.next_timestamp();
        let mut fields = slot.fields.clone();
        for patch in &patches {
            sealbox_core::document::apply_patch(&mut fields, patch, now)?;
        }

        let revision = current.next();
        *slot = self.new_document(fields, revision);
        trace!(collection, id, patches = patches.len(), revision = %revision, "Updated document");
        Ok(revision)
    }

    async fn delete(&self, collection: &str, id: &str, precondition: Precondition) -> Result<(), StoreError> {
        match self.documents.entry(key(collection, id)) {
            Entry::Occupied(slot) => {
                precondition.check(slot.get().revision)?;
                slot.remove();
                debug!(collection, id, "Deleted document");
                Ok(())
            }
            Entry::Vacant(_) => match precondition {
                Precondition::None => Ok(()),
                Precondition::Revision(_) => Err(StoreError::not_found(describe(collection, id))),
            },
        }
    }

    async fn list(&self, collection: &str) -> Result<Vec<(String, Document)>, StoreError> {
        let ordered: BTreeMap<String, Document> = self
            .documents
            .iter()
            .filter(|entry| entry.key().0 == collection)
            .map(|entry| (entry.key().1.clone(), entry.value().clone()))
            .collect();
        Ok(ordered.into_iter().collect())
    }
}

impl std::fmt::Debug for InMemoryDocumentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryDocumentStore")
            .field("documents", &self.documents.len())
            .field("max_documents", &self.max_documents)
            .finish()
    }
}

/// In-memory implementation of [`BlobStore`]
#[derive(Debug, Default)]
pub struct InMemoryBlobStore {
    blobs: DashMap<String, Bytes>,
    max_blob_size: Option<u64>,
}

impl InMemoryBlobStore {
    /// Create a new in-memory blob store
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject blobs larger than `max_blob_size` bytes
    pub fn with_max_blob_size(mut self, max_blob_size: u64) -> Self {
        self.max_blob_size = Some(max_blob_size);
        self
    }

    /// Number of stored blobs
    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    /// Check if the store is empty
    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn get(&self, path: &str) -> Result<Bytes, StoreError> {
        self.blobs
            .get(path)
            .map(|blob| blob.clone())
            .ok_or_else(|| StoreError::not_found(path))
    }

    async fn put(&self, path: &str, data: Bytes) -> Result<u64, StoreError> {
        crate::blobs::validate_path(path)?;
        let size = data.len() as u64;
        if self.max_blob_size.is_some_and(|max| size > max) {
            return Err(StoreError::CapacityExceeded);
        }

        self.blobs.insert(path.to_string(), data);
        trace!(path, size, "Stored blob");
        Ok(size)
    }

    async fn delete(&self, path: &str) -> Result<(), StoreError> {
        self.blobs.remove(path);
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool, StoreError> {
        Ok(self.blobs.contains_key(path))
    }
}
