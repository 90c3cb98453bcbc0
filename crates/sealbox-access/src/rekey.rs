//! Membership changes and key rotation
//!
//! Adding members wraps the existing resource key for the newcomers and
//! leaves every other wrap untouched. Removing members deletes their wraps
//! and per-member state. Under [`RevocationPolicy::AccessMapOnly`] that is
//! all: the resource key stays the same, so a removed member who kept a
//! copy of it can still read ciphertext they obtain some other way.
//! [`RevocationPolicy::RotateKey`] follows every removal with
//! [`GroupRekeyingService::rotate_key`], which re-encrypts everything under
//! a fresh key that only the remaining members receive.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use sealbox_core::{Patch, Precondition, ResourceId, ResourceKind, StoreError, UserId};
use sealbox_crypto::{EncryptedMetadata, Recipient, ResourceKey, SealedValue, create_envelope, wrap_for};

use crate::config::RevocationPolicy;
use crate::error::{AccessError, AccessResult};
use crate::identity::Principal;
use crate::record::{MessageRecord, ResourceRecord, field, messages_collection, to_value};
use crate::resources::ResourceKeyManager;

/// Result of [`GroupRekeyingService::remove_members`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovalOutcome {
    /// Users whose wraps were deleted
    pub removed: Vec<UserId>,
    /// New key epoch, if the removal rotated the key
    pub rotated: Option<u64>,
}

/// How a rotation attempt ended
enum Rotation {
    Committed { epoch: u64, key: ResourceKey },
    /// Another writer rotated first; its key already excludes anyone
    /// removed before it committed.
    Superseded { epoch: u64 },
}

/// Adds and removes members, and rotates resource keys
#[derive(Debug, Clone)]
pub struct GroupRekeyingService {
    resources: Arc<ResourceKeyManager>,
}

impl GroupRekeyingService {
    pub fn new(resources: Arc<ResourceKeyManager>) -> Self {
        Self { resources }
    }

    /// Grant access to `new_members`.
    ///
    /// The caller proves access by opening their own wrap. Only the new
    /// members get wraps; existing wraps stay byte-for-byte identical.
    /// Returns the users that were actually added.
    #[instrument(skip(self, principal, new_members), fields(user = %principal.user_id(), resource = %id))]
    pub async fn add_members(
        &self,
        principal: &Principal,
        kind: ResourceKind,
        id: &ResourceId,
        new_members: &[UserId],
    ) -> AccessResult<Vec<UserId>> {
        let mut recipients: Vec<Recipient> = Vec::with_capacity(new_members.len());
        for user in new_members {
            if recipients.iter().any(|r| r.user_id == *user) {
                continue;
            }
            let public_key = self.resources.identity().public_key(user).await?;
            recipients.push(Recipient::new(user.clone(), public_key));
        }
        let recipients = recipients.as_slice();

        let added = self
            .resources
            .with_retry("add_members", move || self.add_members_once(principal, kind, id, recipients))
            .await?;

        if !added.is_empty() {
            info!(added = added.len(), "Added members");
        }
        Ok(added)
    }

    async fn add_members_once(
        &self,
        principal: &Principal,
        kind: ResourceKind,
        id: &ResourceId,
        recipients: &[Recipient],
    ) -> AccessResult<Vec<UserId>> {
        let record = self.resources.load(kind, id).await?;
        let key = self.resources.open_key(principal, &record)?;

        let mut patches = Vec::new();
        let mut added = Vec::new();
        for recipient in recipients {
            if record.has_access(&recipient.user_id) {
                continue;
            }
            let wrap = wrap_for(&key, &recipient.public_key, self.resources.source())?;
            patches.push(Patch::map_entry(field::WRAPS, recipient.user_id.as_str(), to_value(&wrap)?));
            added.push(recipient.user_id.clone());
        }
        if added.is_empty() {
            return Ok(added);
        }

        patches.push(Patch::ArrayUnion {
            field: field::MEMBERS.to_string(),
            values: user_values(&added),
        });
        self.resources
            .documents()
            .update(
                kind.collection(),
                id.as_str(),
                patches,
                Precondition::Revision(record.revision),
            )
            .await?;
        Ok(added)
    }

    /// Revoke access for `removed_members`.
    ///
    /// The owner can remove anyone but themselves; other members can only
    /// remove themselves. Wraps, roster entries, favorites, tags and
    /// previews of removed users are deleted together.
    #[instrument(skip(self, principal, removed_members), fields(user = %principal.user_id(), resource = %id))]
    pub async fn remove_members(
        &self,
        principal: &Principal,
        kind: ResourceKind,
        id: &ResourceId,
        removed_members: &[UserId],
    ) -> AccessResult<RemovalOutcome> {
        let (removed, epoch, key) = self
            .resources
            .with_retry("remove_members", move || {
                self.remove_members_once(principal, kind, id, removed_members)
            })
            .await?;

        if removed.is_empty() {
            return Ok(RemovalOutcome { removed, rotated: None });
        }
        info!(removed = removed.len(), "Removed members");

        let rotated = match self.resources.config().revocation {
            RevocationPolicy::AccessMapOnly => {
                debug!("Resource key unchanged after removal");
                None
            }
            RevocationPolicy::RotateKey => Some(self.rotate_from(principal.user_id(), kind, id, epoch, &key).await?),
        };
        Ok(RemovalOutcome { removed, rotated })
    }

    /// One removal attempt. Also returns the key and epoch current at the
    /// committed revision, so a rotation can follow even when the caller
    /// removed themselves.
    async fn remove_members_once(
        &self,
        principal: &Principal,
        kind: ResourceKind,
        id: &ResourceId,
        removed_members: &[UserId],
    ) -> AccessResult<(Vec<UserId>, u64, ResourceKey)> {
        let record = self.resources.load(kind, id).await?;
        let key = self.resources.open_key(principal, &record)?;
        let caller = principal.user_id();

        for user in removed_members {
            if *user == record.owner {
                return Err(AccessError::PermissionDenied(format!(
                    "the owner cannot be removed from {} {}",
                    kind, id
                )));
            }
            if *caller != record.owner && user != caller {
                return Err(AccessError::PermissionDenied(format!(
                    "only the owner may remove other members of {} {}",
                    kind, id
                )));
            }
        }

        let mut removed: Vec<UserId> = Vec::new();
        for user in removed_members {
            if (record.has_access(user) || record.members.contains(user)) && !removed.contains(user) {
                removed.push(user.clone());
            }
        }
        if removed.is_empty() {
            return Ok((removed, record.key_epoch, key));
        }

        let mut patches = Vec::new();
        for user in &removed {
            for map in [field::WRAPS, field::FAVORITES, field::TAGS, field::PREVIEWS] {
                patches.push(Patch::RemoveMapEntry {
                    field: map.to_string(),
                    key: user.to_string(),
                });
            }
        }
        patches.push(Patch::ArrayRemove {
            field: field::MEMBERS.to_string(),
            values: user_values(&removed),
        });

        self.resources
            .documents()
            .update(
                kind.collection(),
                id.as_str(),
                patches,
                Precondition::Revision(record.revision),
            )
            .await?;
        Ok((removed, record.key_epoch, key))
    }

    /// Replace the resource key.
    ///
    /// Fields, tags, previews, content and message history are re-encrypted
    /// under a new key wrapped for the current members only, and the key
    /// epoch is bumped. Legacy passphrase-format fields are not under the
    /// resource key and are left as they are. Returns the new epoch.
    ///
    /// Message history moves after the record commits. A chat record keeps
    /// every earlier key sealed under the current one, so messages the pass
    /// has not reached stay readable and the next rotation moves them.
    #[instrument(skip(self, principal), fields(user = %principal.user_id(), resource = %id))]
    pub async fn rotate_key(&self, principal: &Principal, kind: ResourceKind, id: &ResourceId) -> AccessResult<u64> {
        let opened = self.resources.open(principal, kind, id).await?;
        self.rotate_from(principal.user_id(), kind, id, opened.record.key_epoch, &opened.key)
            .await
    }

    async fn rotate_from(
        &self,
        actor: &UserId,
        kind: ResourceKind,
        id: &ResourceId,
        epoch: u64,
        old_key: &ResourceKey,
    ) -> AccessResult<u64> {
        let rotation = self
            .resources
            .with_retry("rotate_key", move || self.rotate_once(actor, kind, id, epoch, old_key))
            .await?;

        match rotation {
            Rotation::Committed { epoch: new_epoch, key } => {
                if kind.is_chat() {
                    self.reencrypt_messages(actor, kind, id, new_epoch, &key).await?;
                }
                info!(epoch = new_epoch, "Rotated resource key");
                Ok(new_epoch)
            }
            Rotation::Superseded { epoch } => {
                debug!(epoch, "Key already rotated by another writer");
                Ok(epoch)
            }
        }
    }

    async fn rotate_once(
        &self,
        actor: &UserId,
        kind: ResourceKind,
        id: &ResourceId,
        epoch: u64,
        old_key: &ResourceKey,
    ) -> AccessResult<Rotation> {
        let record = self.resources.load(kind, id).await?;
        if record.key_epoch != epoch {
            return Ok(Rotation::Superseded {
                epoch: record.key_epoch,
            });
        }

        let source = self.resources.source();
        let new_key = ResourceKey::generate(source);

        let mut recipients = Vec::with_capacity(record.wraps.len());
        for user in record.wraps.recipients() {
            let public_key = self.resources.identity().public_key(user).await?;
            recipients.push(Recipient::new(user.clone(), public_key));
        }
        let wraps = create_envelope(&new_key, &recipients, source)?;

        let mut fields = BTreeMap::new();
        for (name, value) in &record.encrypted_fields {
            let value = match value {
                SealedValue::Envelope(sealed) => {
                    SealedValue::Envelope(self.reseal(&record, actor, sealed, old_key, &new_key)?)
                }
                SealedValue::Legacy(_) => value.clone(),
            };
            fields.insert(name.clone(), value);
        }
        let tags = self.reseal_map(&record, actor, &record.tags, old_key, &new_key)?;
        let previews = self.reseal_map(&record, actor, &record.previews, old_key, &new_key)?;

        let new_epoch = epoch + 1;
        let mut patches = vec![
            Patch::set(field::WRAPS, to_value(&wraps)?),
            Patch::set(field::ENCRYPTED_FIELDS, to_value(&fields)?),
            Patch::set(field::TAGS, to_value(&tags)?),
            Patch::set(field::PREVIEWS, to_value(&previews)?),
            Patch::set(field::KEY_EPOCH, new_epoch),
        ];
        if kind.is_chat() {
            let retired = self.retire_keys(&record, actor, old_key, &new_key)?;
            patches.push(Patch::set(field::RETIRED_KEYS, to_value(&retired)?));
        }

        let new_blob = match &record.content_path {
            Some(path) => {
                let blob = self.resources.blobs().get(path).await?;
                let content = old_key
                    .decrypt_content(&blob)
                    .map_err(|e| self.resources.audited(&record, actor, "rotate_key", e))?;
                let reencrypted = new_key.encrypt_content(&content, source)?;
                let (new_path, _) = self
                    .resources
                    .store_new_blob(kind, id, Bytes::from(reencrypted))
                    .await?;
                patches.push(Patch::set(field::CONTENT_PATH, new_path.clone()));
                Some(new_path)
            }
            None => None,
        };

        let result = self
            .resources
            .documents()
            .update(
                kind.collection(),
                id.as_str(),
                patches,
                Precondition::Revision(record.revision),
            )
            .await;

        match result {
            Ok(_) => {
                if let (Some(old), Some(_)) = (&record.content_path, &new_blob) {
                    self.resources.delete_blob_quietly(old).await;
                }
                Ok(Rotation::Committed {
                    epoch: new_epoch,
                    key: new_key,
                })
            }
            Err(e) => {
                if let Some(path) = &new_blob {
                    self.resources.delete_blob_quietly(path).await;
                }
                Err(e.into())
            }
        }
    }

    /// Every earlier key plus `old_key`, re-sealed under `new_key`
    fn retire_keys(
        &self,
        record: &ResourceRecord,
        actor: &UserId,
        old_key: &ResourceKey,
        new_key: &ResourceKey,
    ) -> AccessResult<BTreeMap<u64, EncryptedMetadata>> {
        let source = self.resources.source();
        let mut retired = BTreeMap::new();
        for (epoch, sealed) in &record.retired_keys {
            let key = old_key
                .open_retired(sealed)
                .map_err(|e| self.resources.audited(record, actor, "rotate_key", e))?;
            retired.insert(*epoch, new_key.seal_retired(&key, source)?);
        }
        retired.insert(record.key_epoch, new_key.seal_retired(old_key, source)?);
        Ok(retired)
    }

    fn reseal(
        &self,
        record: &ResourceRecord,
        actor: &UserId,
        sealed: &EncryptedMetadata,
        old_key: &ResourceKey,
        new_key: &ResourceKey,
    ) -> AccessResult<EncryptedMetadata> {
        let plaintext = sealed
            .open(old_key.as_symmetric())
            .map_err(|e| self.resources.audited(record, actor, "rotate_key", e))?;
        Ok(EncryptedMetadata::seal(
            &plaintext,
            new_key.as_symmetric(),
            self.resources.source(),
        )?)
    }

    fn reseal_map(
        &self,
        record: &ResourceRecord,
        actor: &UserId,
        map: &BTreeMap<UserId, EncryptedMetadata>,
        old_key: &ResourceKey,
        new_key: &ResourceKey,
    ) -> AccessResult<BTreeMap<UserId, EncryptedMetadata>> {
        map.iter()
            .filter(|(user, _)| record.has_access(user))
            .map(|(user, sealed)| {
                self.reseal(record, actor, sealed, old_key, new_key)
                    .map(|resealed| (user.clone(), resealed))
            })
            .collect()
    }

    /// Move every message from an earlier epoch to the new key.
    ///
    /// Runs after the record commit. Until a message is moved it stays
    /// readable through the retired keys in the record, so a pass that stops
    /// early loses nothing and the next rotation picks up where it left off.
    /// A message created under the old key after the commit cannot commit
    /// its own record update and is withdrawn by its sender; finding it gone
    /// here is harmless.
    async fn reencrypt_messages(
        &self,
        actor: &UserId,
        kind: ResourceKind,
        id: &ResourceId,
        new_epoch: u64,
        new_key: &ResourceKey,
    ) -> AccessResult<()> {
        let record = self.resources.load(kind, id).await?;
        if record.key_epoch != new_epoch {
            debug!(epoch = record.key_epoch, "Later rotation moves the message history");
            return Ok(());
        }
        let keys = self.resources.epoch_keys(&record, actor, new_key);
        let collection = messages_collection(kind, id);
        let collection = collection.as_str();
        let (record, keys) = (&record, &keys);

        let mut moved = 0usize;
        for (message_id, _) in self.resources.documents().list(collection).await? {
            let message_id = message_id.as_str();
            let result = self
                .resources
                .with_retry("reencrypt_message", move || {
                    self.reencrypt_message_once(record, actor, collection, message_id, keys, new_epoch, new_key)
                })
                .await;
            match result {
                Ok(true) => moved += 1,
                Ok(false) => {}
                Err(AccessError::Store(StoreError::NotFound(_))) => {
                    debug!(message = message_id, "Message withdrawn during rotation");
                }
                Err(e) => {
                    warn!(message = message_id, moved, error = %e, "Message re-encryption stopped early");
                    return Err(e);
                }
            }
        }
        debug!(moved, "Re-encrypted message history");
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn reencrypt_message_once(
        &self,
        record: &ResourceRecord,
        actor: &UserId,
        collection: &str,
        message_id: &str,
        keys: &BTreeMap<u64, ResourceKey>,
        new_epoch: u64,
        new_key: &ResourceKey,
    ) -> AccessResult<bool> {
        let documents = self.resources.documents();
        let Some(document) = documents.get(collection, message_id).await? else {
            return Err(StoreError::not_found(format!("{}/{}", collection, message_id)).into());
        };
        let mut message = MessageRecord::from_document(&document)?;
        if message.key_epoch >= new_epoch {
            return Ok(false);
        }
        let Some(old_key) = keys.get(&message.key_epoch) else {
            warn!(message = message_id, epoch = message.key_epoch, "No key for message epoch, leaving it in place");
            return Ok(false);
        };

        let mut copies = BTreeMap::new();
        for (user, sealed) in &message.copies {
            if !record.has_access(user) {
                continue;
            }
            copies.insert(user.clone(), self.reseal(record, actor, sealed, old_key, new_key)?);
        }
        if copies.is_empty() {
            warn!(message = message_id, "No current member held a copy of this message");
        }
        message.copies = copies;
        message.key_epoch = new_epoch;

        documents
            .set(
                collection,
                message_id,
                message.to_fields()?,
                Precondition::Revision(document.revision),
            )
            .await?;
        Ok(true)
    }
}

fn user_values(users: &[UserId]) -> Vec<Value> {
    users.iter().map(|u| Value::String(u.to_string())).collect()
}
