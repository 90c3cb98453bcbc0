//! Resource key management over the document and blob stores
//!
//! Every resource (file, folder, group, conversation) has one random
//! [`ResourceKey`]. The key encrypts the resource's fields and content and
//! is wrapped once per member; the wrap map lives in the resource document.
//!
//! All mutations are read-modify-write cycles guarded by
//! [`Precondition::Revision`]. A lost race re-reads and tries again, up to
//! [`AccessConfig::max_update_attempts`].

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info, instrument, warn};

use sealbox_core::{
    BlobStore, DocumentStore, Patch, Precondition, ResourceId, ResourceKind, Revision, StoreError, UserId,
};
use sealbox_crypto::{
    CryptoError, CryptoResult, DecryptionContext, EncryptedMetadata, KeySource, MigrationAdapter, Recipient,
    ResourceKey, SealedValue, SharedKeySource, create_envelope, display_or_placeholder, open_envelope,
};

use crate::audit::AuditLog;
use crate::config::AccessConfig;
use crate::error::{AccessError, AccessResult};
use crate::identity::{IdentityProvider, Principal};
use crate::record::{ResourceRecord, encrypted_field, field, messages_collection, to_value};

/// A resource record together with its unwrapped key
#[derive(Debug)]
pub struct OpenedResource {
    pub record: ResourceRecord,
    pub key: ResourceKey,
}

/// Creates, opens and mutates encrypted resources
pub struct ResourceKeyManager {
    documents: Arc<dyn DocumentStore>,
    blobs: Arc<dyn BlobStore>,
    identity: Arc<dyn IdentityProvider>,
    config: AccessConfig,
    source: SharedKeySource,
    adapter: MigrationAdapter,
    audit: AuditLog,
}

impl ResourceKeyManager {
    /// Create a manager. Fails if `config` does not validate.
    pub fn new(
        documents: Arc<dyn DocumentStore>,
        blobs: Arc<dyn BlobStore>,
        identity: Arc<dyn IdentityProvider>,
        config: AccessConfig,
        source: SharedKeySource,
    ) -> AccessResult<Self> {
        config.validate()?;
        let adapter = MigrationAdapter::new(config.legacy_kdf.clone());
        Ok(Self {
            documents,
            blobs,
            identity,
            config,
            source,
            adapter,
            audit: AuditLog::default(),
        })
    }

    /// Replace the audit log
    pub fn with_audit(mut self, audit: AuditLog) -> Self {
        self.audit = audit;
        self
    }

    pub fn config(&self) -> &AccessConfig {
        &self.config
    }

    pub(crate) fn documents(&self) -> &dyn DocumentStore {
        self.documents.as_ref()
    }

    pub(crate) fn blobs(&self) -> &dyn BlobStore {
        self.blobs.as_ref()
    }

    pub(crate) fn identity(&self) -> &dyn IdentityProvider {
        self.identity.as_ref()
    }

    pub(crate) fn source(&self) -> &dyn KeySource {
        self.source.as_ref()
    }

    pub(crate) fn audit(&self) -> &AuditLog {
        &self.audit
    }

    // ========================================================================
    // Creating and opening
    // ========================================================================

    /// Create a resource owned by `principal` and shared with `members`.
    ///
    /// `initial_fields` are encrypted under the new resource key before
    /// anything is written. The owner is always a member.
    #[instrument(skip(self, principal, kind, members, initial_fields), fields(owner = %principal.user_id(), kind = %kind))]
    pub async fn create_resource(
        &self,
        principal: &Principal,
        kind: ResourceKind,
        members: &[UserId],
        initial_fields: &[(&str, &str)],
    ) -> AccessResult<OpenedResource> {
        let id = ResourceId::generate();
        let owner = principal.user_id().clone();

        let mut recipients = vec![Recipient::new(owner.clone(), principal.public_key())];
        for member in members {
            if *member == owner || recipients.iter().any(|r| r.user_id == *member) {
                continue;
            }
            let public_key = self.identity.public_key(member).await?;
            recipients.push(Recipient::new(member.clone(), public_key));
        }

        let key = ResourceKey::generate(self.source());
        let mut record = ResourceRecord::new(id.clone(), kind, owner);
        record.wraps = create_envelope(&key, &recipients, self.source())?;
        record.members = recipients.iter().map(|r| r.user_id.clone()).collect();
        for (name, value) in initial_fields {
            let sealed = key.encrypt_metadata(value, self.source())?;
            record.encrypted_fields.insert((*name).to_string(), sealed.into());
        }

        record.revision = self.documents.create(kind.collection(), id.as_str(), record.to_fields()?).await?;

        info!(resource = %id, members = record.members.len(), "Created resource");
        Ok(OpenedResource { record, key })
    }

    /// Read a resource record
    pub async fn load(&self, kind: ResourceKind, id: &ResourceId) -> AccessResult<ResourceRecord> {
        let document = self
            .documents
            .get(kind.collection(), id.as_str())
            .await?
            .ok_or_else(|| AccessError::ResourceNotFound {
                kind,
                id: id.clone(),
            })?;
        ResourceRecord::from_document(id, kind, &document)
    }

    /// Unwrap the resource key with the principal's private key.
    ///
    /// Fails with `AccessDenied` when the principal holds no wrap, and
    /// with `Corruption` (audited) when their wrap does not authenticate.
    pub fn open_key(&self, principal: &Principal, record: &ResourceRecord) -> AccessResult<ResourceKey> {
        open_envelope(&record.wraps, principal.user_id(), principal.key_pair())
            .map_err(|e| self.audited(record, principal.user_id(), "open_key", e))
    }

    /// Load a resource and unwrap its key
    pub async fn open(&self, principal: &Principal, kind: ResourceKind, id: &ResourceId) -> AccessResult<OpenedResource> {
        let record = self.load(kind, id).await?;
        let key = self.open_key(principal, &record)?;
        Ok(OpenedResource { record, key })
    }

    /// Every resource of `kind` the principal holds a wrap for
    pub async fn list_accessible(&self, principal: &Principal, kind: ResourceKind) -> AccessResult<Vec<ResourceRecord>> {
        let mut accessible = Vec::new();
        for (id, document) in self.documents.list(kind.collection()).await? {
            let id = ResourceId::new(id);
            match ResourceRecord::from_document(&id, kind, &document) {
                Ok(record) if record.has_access(principal.user_id()) => accessible.push(record),
                Ok(_) => {}
                Err(e) => warn!(resource = %id, error = %e, "Skipping unreadable resource record"),
            }
        }
        Ok(accessible)
    }

    // ========================================================================
    // Encrypted fields
    // ========================================================================

    /// Encrypt `value` into the named field
    #[instrument(skip(self, principal, value), fields(user = %principal.user_id(), resource = %id))]
    pub async fn encrypt_field(
        &self,
        principal: &Principal,
        kind: ResourceKind,
        id: &ResourceId,
        name: &str,
        value: &str,
    ) -> AccessResult<Revision> {
        self.with_retry("encrypt_field", move || {
            self.encrypt_field_once(principal, kind, id, name, value)
        })
        .await
    }

    async fn encrypt_field_once(
        &self,
        principal: &Principal,
        kind: ResourceKind,
        id: &ResourceId,
        name: &str,
        value: &str,
    ) -> AccessResult<Revision> {
        let opened = self.open(principal, kind, id).await?;
        let sealed = opened.key.encrypt_metadata(value, self.source())?;
        let revision = self
            .documents
            .update(
                kind.collection(),
                id.as_str(),
                vec![Patch::map_entry(field::ENCRYPTED_FIELDS, name, to_value(&sealed)?)],
                Precondition::Revision(opened.record.revision),
            )
            .await?;
        debug!(field = name, "Encrypted field");
        Ok(revision)
    }

    /// Decrypt the named field, or `None` if it is not set.
    ///
    /// A field still in the legacy passphrase format is decrypted with the
    /// principal's legacy passphrase and rewritten in envelope format. The
    /// rewrite is best effort: losing the race to another writer leaves the
    /// legacy value for the next reader.
    #[instrument(skip(self, principal), fields(user = %principal.user_id(), resource = %id))]
    pub async fn read_field(
        &self,
        principal: &Principal,
        kind: ResourceKind,
        id: &ResourceId,
        name: &str,
    ) -> AccessResult<Option<String>> {
        let opened = self.open(principal, kind, id).await?;
        let Some(value) = opened.record.encrypted_fields.get(name) else {
            return Ok(None);
        };

        let plaintext = if value.is_legacy() {
            let upgraded = self.upgrade_legacy(principal, &opened, name, value)?;
            self.write_back_upgrade(kind, &opened.record, name, &upgraded).await;
            upgraded.open(opened.key.as_symmetric())?
        } else {
            self.decrypt_value(principal, &opened, value, "read_field")?
        };

        String::from_utf8(plaintext)
            .map(Some)
            .map_err(|_| CryptoError::corruption(format!("field {} is not UTF-8", name)).into())
    }

    /// Decrypt every field for display, substituting a placeholder for any
    /// value that cannot be decrypted
    pub async fn read_fields_for_display(
        &self,
        principal: &Principal,
        kind: ResourceKind,
        id: &ResourceId,
    ) -> AccessResult<BTreeMap<String, String>> {
        let opened = self.open(principal, kind, id).await?;
        Ok(opened
            .record
            .encrypted_fields
            .iter()
            .map(|(name, value)| {
                let result = self.decrypt_value(principal, &opened, value, "read_field");
                (name.clone(), display_or_placeholder(result, name))
            })
            .collect())
    }

    fn upgrade_legacy(
        &self,
        principal: &Principal,
        opened: &OpenedResource,
        name: &str,
        value: &SealedValue,
    ) -> AccessResult<EncryptedMetadata> {
        let passphrase = principal
            .legacy_passphrase()
            .ok_or(CryptoError::MissingSecret("passphrase"))?;
        let context = DecryptionContext::with_passphrase(passphrase);
        let upgraded = self
            .adapter
            .upgrade(value, &context, opened.key.as_symmetric(), self.source())?
            .ok_or_else(|| AccessError::invalid_record(format!("field {} is not in legacy format", name)))?;
        Ok(upgraded)
    }

    async fn write_back_upgrade(
        &self,
        kind: ResourceKind,
        record: &ResourceRecord,
        name: &str,
        upgraded: &EncryptedMetadata,
    ) {
        let patch = match to_value(upgraded) {
            Ok(value) => Patch::map_entry(field::ENCRYPTED_FIELDS, name, value),
            Err(e) => {
                warn!(resource = %record.id, field = name, error = %e, "Could not encode upgraded field");
                return;
            }
        };
        match self
            .documents
            .update(
                kind.collection(),
                record.id.as_str(),
                vec![patch],
                Precondition::Revision(record.revision),
            )
            .await
        {
            Ok(_) => info!(resource = %record.id, field = name, "Migrated legacy field to envelope format"),
            Err(e) => debug!(resource = %record.id, field = name, error = %e, "Legacy field rewrite skipped"),
        }
    }

    /// Decrypt a stored field with everything the principal can offer
    fn decrypt_value(
        &self,
        principal: &Principal,
        opened: &OpenedResource,
        value: &SealedValue,
        operation: &'static str,
    ) -> CryptoResult<Vec<u8>> {
        let mut context = DecryptionContext::with_key(opened.key.as_symmetric().clone());
        if let Some(passphrase) = principal.legacy_passphrase() {
            context = context.and_passphrase(passphrase);
        }
        let result = self.adapter.decrypt_any(value, &context);
        self.audit_result(&opened.record, principal.user_id(), operation, result)
    }

    // ========================================================================
    // Content
    // ========================================================================

    /// Encrypt and store a file's content, replacing any previous content.
    ///
    /// The human-readable size is stored as an encrypted field. Returns the
    /// stored (encrypted) blob size.
    #[instrument(skip(self, principal, content), fields(user = %principal.user_id(), resource = %id, size = content.len()))]
    pub async fn put_content(
        &self,
        principal: &Principal,
        kind: ResourceKind,
        id: &ResourceId,
        content: &[u8],
    ) -> AccessResult<u64> {
        let size_text = human_size(content.len() as u64);
        let size_text = size_text.as_str();
        self.with_retry("put_content", move || {
            self.put_content_once(principal, kind, id, content, size_text)
        })
        .await
    }

    async fn put_content_once(
        &self,
        principal: &Principal,
        kind: ResourceKind,
        id: &ResourceId,
        content: &[u8],
        size_text: &str,
    ) -> AccessResult<u64> {
        let opened = self.open(principal, kind, id).await?;
        let blob = opened.key.encrypt_content(content, self.source())?;
        let sealed_size = opened.key.encrypt_metadata(size_text, self.source())?;
        let (path, stored) = self.store_new_blob(kind, id, Bytes::from(blob)).await?;

        let result = self
            .documents
            .update(
                kind.collection(),
                id.as_str(),
                vec![
                    Patch::set(field::CONTENT_PATH, path.clone()),
                    Patch::map_entry(field::ENCRYPTED_FIELDS, encrypted_field::SIZE, to_value(&sealed_size)?),
                ],
                Precondition::Revision(opened.record.revision),
            )
            .await;

        match result {
            Ok(_) => {
                if let Some(previous) = &opened.record.content_path {
                    self.delete_blob_quietly(previous).await;
                }
                debug!(path = %path, "Stored content");
                Ok(stored)
            }
            Err(e) => {
                self.delete_blob_quietly(&path).await;
                Err(e.into())
            }
        }
    }

    /// Read and decrypt a file's content
    #[instrument(skip(self, principal), fields(user = %principal.user_id(), resource = %id))]
    pub async fn read_content(&self, principal: &Principal, kind: ResourceKind, id: &ResourceId) -> AccessResult<Vec<u8>> {
        let opened = self.open(principal, kind, id).await?;
        let path = opened
            .record
            .content_path
            .as_deref()
            .ok_or_else(|| StoreError::not_found(format!("content of {}", id)))?;

        let blob = self.blobs.get(path).await?;
        opened
            .key
            .decrypt_content(&blob)
            .map_err(|e| self.audited(&opened.record, principal.user_id(), "read_content", e))
    }

    /// Upload to a path no other write uses, returning `(path, size)`
    pub(crate) async fn store_new_blob(
        &self,
        kind: ResourceKind,
        id: &ResourceId,
        data: Bytes,
    ) -> AccessResult<(String, u64)> {
        let path = format!(
            "{}/{}/{}/{}",
            self.config.content_prefix,
            kind.collection(),
            id,
            ResourceId::generate()
        );
        let size = self.blobs.put(&path, data).await?;
        Ok((path, size))
    }

    /// Remove a blob that is no longer referenced. Failures only leave an
    /// orphan behind, so they are logged and dropped.
    pub(crate) async fn delete_blob_quietly(&self, path: &str) {
        if let Err(e) = self.blobs.delete(path).await {
            warn!(path, error = %e, "Failed to delete unreferenced blob");
        }
    }

    // ========================================================================
    // Per-member state
    // ========================================================================

    /// Mark or unmark the resource as a favorite of the principal
    pub async fn set_favorite(
        &self,
        principal: &Principal,
        kind: ResourceKind,
        id: &ResourceId,
        favorite: bool,
    ) -> AccessResult<()> {
        self.with_retry("set_favorite", move || {
            self.set_favorite_once(principal.user_id(), kind, id, favorite)
        })
        .await
    }

    async fn set_favorite_once(
        &self,
        user: &UserId,
        kind: ResourceKind,
        id: &ResourceId,
        favorite: bool,
    ) -> AccessResult<()> {
        let record = self.load(kind, id).await?;
        if !record.has_access(user) {
            return Err(AccessError::NotAMember { user: user.clone() });
        }
        self.documents
            .update(
                kind.collection(),
                id.as_str(),
                vec![Patch::map_entry(field::FAVORITES, user.as_str(), favorite)],
                Precondition::Revision(record.revision),
            )
            .await?;
        Ok(())
    }

    /// Replace the principal's tags on this resource. Tags are encrypted
    /// under the resource key.
    pub async fn set_tags(
        &self,
        principal: &Principal,
        kind: ResourceKind,
        id: &ResourceId,
        tags: &[String],
    ) -> AccessResult<()> {
        let encoded = serde_json::to_string(tags).map_err(StoreError::from)?;
        let encoded = encoded.as_str();
        self.with_retry("set_tags", move || self.set_tags_once(principal, kind, id, encoded))
            .await
    }

    async fn set_tags_once(
        &self,
        principal: &Principal,
        kind: ResourceKind,
        id: &ResourceId,
        encoded: &str,
    ) -> AccessResult<()> {
        let user = principal.user_id();
        let record = self.load(kind, id).await?;
        if !record.has_access(user) {
            return Err(AccessError::NotAMember { user: user.clone() });
        }
        let key = self.open_key(principal, &record)?;
        let sealed = key.encrypt_metadata(encoded, self.source())?;
        self.documents
            .update(
                kind.collection(),
                id.as_str(),
                vec![Patch::map_entry(field::TAGS, user.as_str(), to_value(&sealed)?)],
                Precondition::Revision(record.revision),
            )
            .await?;
        Ok(())
    }

    /// The principal's tags on this resource
    pub async fn read_tags(&self, principal: &Principal, kind: ResourceKind, id: &ResourceId) -> AccessResult<Vec<String>> {
        let opened = self.open(principal, kind, id).await?;
        let Some(sealed) = opened.record.tags.get(principal.user_id()) else {
            return Ok(Vec::new());
        };
        let text = opened
            .key
            .decrypt_metadata(sealed)
            .map_err(|e| self.audited(&opened.record, principal.user_id(), "read_tags", e))?;
        serde_json::from_str(&text).map_err(|e| AccessError::invalid_record(format!("tags: {}", e)))
    }

    // ========================================================================
    // Deletion
    // ========================================================================

    /// Delete a resource, its content and any messages. Owner only.
    ///
    /// Messages go first and the record last, so a failure part way leaves
    /// the record in place and the owner can simply call this again.
    #[instrument(skip(self, principal), fields(user = %principal.user_id(), resource = %id))]
    pub async fn delete_resource(&self, principal: &Principal, kind: ResourceKind, id: &ResourceId) -> AccessResult<()> {
        let record = self
            .with_retry("delete_resource", move || self.delete_record_once(principal, kind, id))
            .await?;

        if let Some(path) = &record.content_path {
            self.delete_blob_quietly(path).await;
        }
        info!("Deleted resource");
        Ok(())
    }

    async fn delete_record_once(
        &self,
        principal: &Principal,
        kind: ResourceKind,
        id: &ResourceId,
    ) -> AccessResult<ResourceRecord> {
        let record = self.load(kind, id).await?;
        if record.owner != *principal.user_id() {
            return Err(AccessError::PermissionDenied(format!(
                "only the owner may delete {} {}",
                kind, id
            )));
        }
        if kind.is_chat() {
            // A message sent after this listing bumps the record revision,
            // so the delete below conflicts and the next attempt sweeps again.
            let collection = messages_collection(kind, id);
            for (message_id, _) in self.documents.list(&collection).await? {
                self.documents.delete(&collection, &message_id, Precondition::None).await?;
            }
        }
        self.documents
            .delete(kind.collection(), id.as_str(), Precondition::Revision(record.revision))
            .await?;
        Ok(record)
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    /// Run a read-modify-write attempt until it stops losing revision races
    pub(crate) async fn with_retry<T, F, Fut>(&self, operation: &'static str, mut attempt: F) -> AccessResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = AccessResult<T>>,
    {
        let max = self.config.max_update_attempts;
        for n in 1..=max {
            match attempt().await {
                Err(e) if e.is_lost_race() => {
                    debug!(operation, attempt = n, "Revision conflict, retrying from a fresh read");
                    tokio::task::yield_now().await;
                }
                result => return result,
            }
        }
        warn!(operation, attempts = max, "Giving up after repeated revision conflicts");
        Err(AccessError::UpdateContention { attempts: max })
    }

    /// Record integrity failures before handing the error back
    pub(crate) fn audited(
        &self,
        record: &ResourceRecord,
        user: &UserId,
        operation: &'static str,
        error: CryptoError,
    ) -> AccessError {
        if error.is_integrity_failure() {
            self.audit.integrity_failure(&record.id, user, operation, &error);
        }
        error.into()
    }

    /// Same as [`Self::audited`], for results that stay in the crypto layer
    pub(crate) fn audit_result<T>(
        &self,
        record: &ResourceRecord,
        user: &UserId,
        operation: &'static str,
        result: CryptoResult<T>,
    ) -> CryptoResult<T> {
        if let Err(e) = &result {
            if e.is_integrity_failure() {
                self.audit.integrity_failure(&record.id, user, operation, e);
            }
        }
        result
    }

    /// Every key `current` can reach, by epoch: itself plus each retired
    /// key sealed in the record. A retired key that fails to open is
    /// audited and left out.
    pub(crate) fn epoch_keys(
        &self,
        record: &ResourceRecord,
        user: &UserId,
        current: &ResourceKey,
    ) -> BTreeMap<u64, ResourceKey> {
        let mut keys = BTreeMap::new();
        for (epoch, sealed) in &record.retired_keys {
            match self.audit_result(record, user, "open_retired_key", current.open_retired(sealed)) {
                Ok(key) => {
                    keys.insert(*epoch, key);
                }
                Err(e) => warn!(epoch, error = %e, "Retired key unavailable"),
            }
        }
        keys.insert(record.key_epoch, current.clone());
        keys
    }
}

impl std::fmt::Debug for ResourceKeyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceKeyManager")
            .field("config", &self.config)
            .field("audit", &self.audit)
            .finish_non_exhaustive()
    }
}

/// Size string shown next to a file, e.g. `1.5 KB`
pub fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    if bytes < 1024 {
        return format!("{} B", bytes);
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", value, UNITS[unit])
}
