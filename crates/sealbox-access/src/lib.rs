//! # Sealbox Access
//!
//! Envelope encryption applied to stored resources.
//!
//! Each file, folder, group or conversation has one random resource key.
//! Content and metadata are encrypted with it exactly once, and the key is
//! wrapped separately for every member with their Kyber768 public key. The
//! storage backend only ever sees wraps and ciphertext.
//!
//! ## Components
//!
//! - [`ResourceKeyManager`]: create and open resources, encrypted fields,
//!   content blobs, favorites and tags
//! - [`GroupRekeyingService`]: add and remove members, rotate keys
//! - [`ConversationKeyManager`]: per-recipient encrypted chat messages
//! - [`IdentityProvider`]: public key lookup for user ids
//!
//! ## Concurrency
//!
//! Every read-modify-write of a resource document is a compare-and-swap on
//! the document revision, retried from a fresh read when another writer
//! wins. Concurrent additions and removals therefore never undo each other.
//!
//! ## Revocation
//!
//! Removing a member deletes their wrap. Whether the resource key is also
//! rotated is a deployment decision, see [`RevocationPolicy`].
//!
//! ## Example
//!
//! ```rust,ignore
//! let resources = Arc::new(ResourceKeyManager::new(documents, blobs, directory, config, os_key_source())?);
//! let file = resources
//!     .create_resource(&alice, ResourceKind::File, &[bob_id], &[("name", "notes.txt")])
//!     .await?;
//! resources.put_content(&alice, ResourceKind::File, &file.record.id, b"hello").await?;
//! let text = resources.read_content(&bob, ResourceKind::File, &file.record.id).await?;
//! ```

pub mod audit;
pub mod config;
pub mod conversation;
pub mod error;
pub mod identity;
pub mod record;
pub mod rekey;
pub mod resources;

pub use audit::{AuditEvent, AuditLog, AuditSink, MemoryAuditSink, TracingAuditSink};
pub use config::{AccessConfig, RevocationPolicy};
pub use conversation::{ChatMessage, ConversationKeyManager, PREVIEW_CHARS, SentMessage};
pub use error::{AccessError, AccessResult};
pub use identity::{IdentityProvider, InMemoryDirectory, Principal};
pub use record::{INITIAL_KEY_EPOCH, MessageRecord, ResourceRecord, encrypted_field, message_id, messages_collection};
pub use rekey::{GroupRekeyingService, RemovalOutcome};
pub use resources::{OpenedResource, ResourceKeyManager, human_size};
