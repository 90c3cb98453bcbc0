//! # Sealbox Storage
//!
//! Storage backends for Sealbox.
//!
//! The envelope layer only needs a document store with conditional writes
//! and a path-addressed blob store. This crate provides:
//!
//! - **InMemoryDocumentStore**: revisioned documents with compare-and-swap
//!   updates and strictly monotonic server timestamps
//! - **InMemoryBlobStore**: blobs in memory, for tests
//! - **FsBlobStore**: blobs as files, written atomically via temp-file rename
//!
//! ## Example
//!
//! ```rust,ignore
//! use sealbox_core::{DocumentStore, Patch, Precondition};
//! use sealbox_storage::InMemoryDocumentStore;
//!
//! let store = InMemoryDocumentStore::new();
//! let rev = store.create("groups", "g1", Default::default()).await?;
//!
//! // Only applies if nobody else wrote since we read `rev`
//! store
//!     .update("groups", "g1", vec![Patch::set("name", "x")], Precondition::Revision(rev))
//!     .await?;
//! ```

pub mod blobs;
pub mod memory;

// Re-exports
pub use blobs::{FsBlobStore, FsBlobStoreConfig, validate_path};
pub use memory::{InMemoryBlobStore, InMemoryDocumentStore};

// Re-export the collaborator traits for convenience
pub use sealbox_core::{BlobStore, DocumentStore, StoreError};
