//! Typed views of stored resource and message documents
//!
//! A resource document holds its wrap map next to the plaintext roster.
//! The roster is informational; the wrap map is the access boundary.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use sealbox_core::{Document, Fields, ResourceId, ResourceKind, Revision, StoreError, UserId};
use sealbox_crypto::{EncryptedMetadata, Envelope, SealedValue};

use crate::error::{AccessError, AccessResult};

/// Document field names
pub(crate) mod field {
    pub const KIND: &str = "kind";
    pub const OWNER: &str = "owner";
    pub const MEMBERS: &str = "members";
    pub const WRAPS: &str = "wraps";
    pub const ENCRYPTED_FIELDS: &str = "encryptedFields";
    pub const FAVORITES: &str = "favorites";
    pub const TAGS: &str = "tags";
    pub const CONTENT_PATH: &str = "contentPath";
    pub const KEY_EPOCH: &str = "keyEpoch";
    pub const RETIRED_KEYS: &str = "retiredKeys";
    pub const PREVIEWS: &str = "previews";
    pub const MESSAGE_COUNT: &str = "messageCount";
    pub const LAST_MESSAGE_AT: &str = "lastMessageAt";
    pub const LAST_SENDER: &str = "lastSender";
    pub const SENT_AT: &str = "sentAt";
}

/// Encrypted field names used by the managers
pub mod encrypted_field {
    /// Display name of any resource
    pub const NAME: &str = "name";
    /// Human-readable content size of a file
    pub const SIZE: &str = "size";
    /// Group description
    pub const DESCRIPTION: &str = "description";
}

/// First key epoch of a new resource
pub const INITIAL_KEY_EPOCH: u64 = 1;

/// A resource document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRecord {
    #[serde(skip, default = "empty_id")]
    pub id: ResourceId,
    #[serde(skip, default = "initial_revision")]
    pub revision: Revision,

    pub kind: ResourceKind,
    pub owner: UserId,
    #[serde(default)]
    pub members: Vec<UserId>,
    #[serde(default)]
    pub wraps: Envelope,
    /// Short fields, in either stored ciphertext shape
    #[serde(default)]
    pub encrypted_fields: BTreeMap<String, SealedValue>,
    #[serde(default)]
    pub favorites: BTreeMap<UserId, bool>,
    /// Per-member tag lists, each encrypted under the resource key
    #[serde(default)]
    pub tags: BTreeMap<UserId, EncryptedMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_path: Option<String>,
    #[serde(default = "initial_epoch")]
    pub key_epoch: u64,
    /// Keys of earlier epochs, each sealed under the current key. Only
    /// chat resources keep them: their messages live outside the record
    /// and move to a new key after the rotation commits.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub retired_keys: BTreeMap<u64, EncryptedMetadata>,

    /// Per-recipient encrypted preview of the latest message
    #[serde(default)]
    pub previews: BTreeMap<UserId, EncryptedMetadata>,
    #[serde(default)]
    pub message_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sender: Option<UserId>,
}

fn empty_id() -> ResourceId {
    ResourceId::new("")
}

fn initial_revision() -> Revision {
    Revision::INITIAL
}

fn initial_epoch() -> u64 {
    INITIAL_KEY_EPOCH
}

impl ResourceRecord {
    /// A fresh record with no wraps or fields yet
    pub fn new(id: ResourceId, kind: ResourceKind, owner: UserId) -> Self {
        Self {
            id,
            revision: Revision::INITIAL,
            kind,
            owner: owner.clone(),
            members: vec![owner],
            wraps: Envelope::new(),
            encrypted_fields: BTreeMap::new(),
            favorites: BTreeMap::new(),
            tags: BTreeMap::new(),
            content_path: None,
            key_epoch: INITIAL_KEY_EPOCH,
            retired_keys: BTreeMap::new(),
            previews: BTreeMap::new(),
            message_count: 0,
            last_message_at: None,
            last_sender: None,
        }
    }

    /// Decode a stored document, checking it is of the expected kind
    pub fn from_document(id: &ResourceId, expected: ResourceKind, document: &Document) -> AccessResult<Self> {
        let mut record: Self = document
            .decode()
            .map_err(|e| AccessError::invalid_record(format!("{} {}: {}", expected, id, e)))?;

        if record.kind != expected {
            return Err(AccessError::invalid_record(format!(
                "{} is a {}, not a {}",
                id, record.kind, expected
            )));
        }

        record.id = id.clone();
        record.revision = document.revision;
        Ok(record)
    }

    /// Encode for a whole-document write
    pub fn to_fields(&self) -> AccessResult<Fields> {
        match serde_json::to_value(self).map_err(StoreError::from)? {
            Value::Object(fields) => Ok(fields),
            _ => Err(AccessError::invalid_record("record did not encode to an object")),
        }
    }

    /// Whether `user` holds a wrap
    pub fn has_access(&self, user: &UserId) -> bool {
        self.wraps.contains(user)
    }

    /// Users holding a wrap
    pub fn recipients(&self) -> Vec<UserId> {
        self.wraps.recipients().cloned().collect()
    }

    /// Roster entries without a wrap, or wraps missing from the roster.
    ///
    /// Conditional writes keep these in step; a non-empty result points at
    /// a document written outside this crate.
    pub fn roster_drift(&self) -> Vec<UserId> {
        let mut drift: Vec<UserId> = self
            .members
            .iter()
            .filter(|m| !self.wraps.contains(m))
            .cloned()
            .collect();
        drift.extend(self.wraps.recipients().filter(|r| !self.members.contains(r)).cloned());
        drift
    }
}

/// A stored chat message: one encrypted copy per recipient
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    pub sender: UserId,
    pub seq: u64,
    pub key_epoch: u64,
    pub copies: BTreeMap<UserId, EncryptedMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<i64>,
}

impl MessageRecord {
    pub fn from_document(document: &Document) -> AccessResult<Self> {
        document
            .decode()
            .map_err(|e| AccessError::invalid_record(format!("message: {}", e)))
    }

    pub fn to_fields(&self) -> AccessResult<Fields> {
        match serde_json::to_value(self).map_err(StoreError::from)? {
            Value::Object(fields) => Ok(fields),
            _ => Err(AccessError::invalid_record("message did not encode to an object")),
        }
    }
}

/// Collection holding the messages of one conversation or group
pub fn messages_collection(kind: ResourceKind, id: &ResourceId) -> String {
    format!("{}/{}/messages", kind.collection(), id)
}

/// Document id of the message with sequence number `seq`.
///
/// Zero-padded so listing order is sending order.
pub fn message_id(seq: u64) -> String {
    format!("{:012}", seq)
}

/// Encode any value for a patch
pub(crate) fn to_value<T: Serialize>(value: &T) -> AccessResult<Value> {
    Ok(serde_json::to_value(value).map_err(StoreError::from)?)
}
