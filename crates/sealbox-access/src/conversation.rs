//! Encrypted chat on top of resource keys
//!
//! A conversation (or group chat) is a resource whose key encrypts every
//! message. Each message is sealed once per current wrap holder, each copy
//! with its own random nonce, so no nonce is ever reused for a
//! `(conversation, recipient)` pair.
//!
//! Sending is a two-document write. The message document is created first
//! at the next sequence number, which doubles as a claim on that number.
//! The conversation record is then updated under its revision: counter,
//! last-message timestamp and per-recipient preview. If that update loses
//! a race the message is withdrawn and the whole send starts over, so a
//! message is never left behind under a key that has since been rotated.
//! History written before a rotation moves to the new key afterwards; until
//! it does, the record's retired keys still open it.

use std::sync::Arc;

use tracing::{debug, instrument, warn};

use sealbox_core::{Patch, Precondition, ResourceId, ResourceKind, UserId};
use sealbox_crypto::{CryptoError, CryptoResult};

use crate::error::{AccessError, AccessResult};
use crate::identity::Principal;
use crate::record::{MessageRecord, encrypted_field, field, message_id, messages_collection, to_value};
use crate::resources::{OpenedResource, ResourceKeyManager};

/// Characters of a message kept in the conversation preview
pub const PREVIEW_CHARS: usize = 80;

/// Where a sent message landed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub seq: u64,
    pub message_id: String,
}

/// A message as seen by one reader
#[derive(Debug)]
pub struct ChatMessage {
    pub seq: u64,
    pub sender: UserId,
    /// Server-assigned send time, Unix millis
    pub sent_at: Option<i64>,
    /// The reader's copy, decrypted. Failures stay per message.
    pub text: CryptoResult<String>,
}

/// Chat operations for conversations and groups
#[derive(Debug, Clone)]
pub struct ConversationKeyManager {
    resources: Arc<ResourceKeyManager>,
}

impl ConversationKeyManager {
    pub fn new(resources: Arc<ResourceKeyManager>) -> Self {
        Self { resources }
    }

    /// Start a conversation or group chat with `participants`
    pub async fn create_conversation(
        &self,
        principal: &Principal,
        kind: ResourceKind,
        participants: &[UserId],
        name: Option<&str>,
    ) -> AccessResult<OpenedResource> {
        ensure_chat(kind)?;
        let fields: Vec<(&str, &str)> = name.map(|n| (encrypted_field::NAME, n)).into_iter().collect();
        self.resources
            .create_resource(principal, kind, participants, &fields)
            .await
    }

    /// Send `text` to every current member
    #[instrument(skip(self, principal, text), fields(user = %principal.user_id(), resource = %id))]
    pub async fn send_message(
        &self,
        principal: &Principal,
        kind: ResourceKind,
        id: &ResourceId,
        text: &str,
    ) -> AccessResult<SentMessage> {
        ensure_chat(kind)?;
        let sent = self
            .resources
            .with_retry("send_message", move || self.send_once(principal, kind, id, text))
            .await?;
        debug!(seq = sent.seq, "Sent message");
        Ok(sent)
    }

    async fn send_once(
        &self,
        principal: &Principal,
        kind: ResourceKind,
        id: &ResourceId,
        text: &str,
    ) -> AccessResult<SentMessage> {
        let record = self.resources.load(kind, id).await?;
        let key = self.resources.open_key(principal, &record)?;
        let source = self.resources.source();
        let documents = self.resources.documents();

        let seq = record.message_count + 1;
        let mut message = MessageRecord {
            sender: principal.user_id().clone(),
            seq,
            key_epoch: record.key_epoch,
            copies: Default::default(),
            sent_at: None,
        };
        let preview = preview_of(text);
        let mut patches = Vec::with_capacity(record.wraps.len() + 3);
        for recipient in record.wraps.recipients() {
            message
                .copies
                .insert(recipient.clone(), key.encrypt_metadata(text, source)?);
            let sealed_preview = key.encrypt_metadata(&preview, source)?;
            patches.push(Patch::map_entry(
                field::PREVIEWS,
                recipient.as_str(),
                to_value(&sealed_preview)?,
            ));
        }
        patches.push(Patch::Increment {
            field: field::MESSAGE_COUNT.to_string(),
            by: 1,
        });
        patches.push(Patch::ServerTimestamp {
            field: field::LAST_MESSAGE_AT.to_string(),
        });
        patches.push(Patch::set(field::LAST_SENDER, principal.user_id().as_str()));

        let collection = messages_collection(kind, id);
        let message_id = message_id(seq);
        documents.create(&collection, &message_id, message.to_fields()?).await?;

        let committed = async {
            documents
                .update(
                    &collection,
                    &message_id,
                    vec![Patch::ServerTimestamp {
                        field: field::SENT_AT.to_string(),
                    }],
                    Precondition::None,
                )
                .await?;
            documents
                .update(
                    kind.collection(),
                    id.as_str(),
                    patches,
                    Precondition::Revision(record.revision),
                )
                .await
        }
        .await;

        match committed {
            Ok(_) => Ok(SentMessage { seq, message_id }),
            Err(e) => {
                if let Err(cleanup) = documents.delete(&collection, &message_id, Precondition::None).await {
                    warn!(message = %message_id, error = %cleanup, "Failed to withdraw uncommitted message");
                }
                Err(e.into())
            }
        }
    }

    /// Every message, oldest first, decrypted with the reader's copy.
    ///
    /// A message the reader has no copy of (sent before they joined) or
    /// that fails to decrypt is returned with an error in `text`; the rest
    /// of the history is unaffected.
    #[instrument(skip(self, principal), fields(user = %principal.user_id(), resource = %id))]
    pub async fn read_messages(
        &self,
        principal: &Principal,
        kind: ResourceKind,
        id: &ResourceId,
    ) -> AccessResult<Vec<ChatMessage>> {
        ensure_chat(kind)?;
        let opened = self.resources.open(principal, kind, id).await?;
        let reader = principal.user_id();
        // Messages a rotation has not moved yet are still under a retired key
        let keys = self.resources.epoch_keys(&opened.record, reader, &opened.key);

        let documents = self
            .resources
            .documents()
            .list(&messages_collection(kind, id))
            .await?;

        let mut messages = Vec::with_capacity(documents.len());
        for (message_id, document) in documents {
            let message = match MessageRecord::from_document(&document) {
                Ok(message) => message,
                Err(e) => {
                    warn!(message = %message_id, error = %e, "Skipping unreadable message");
                    continue;
                }
            };

            let text = match (message.copies.get(reader), keys.get(&message.key_epoch)) {
                (None, _) => Err(CryptoError::AccessDenied { user: reader.clone() }),
                (Some(_), None) => Err(CryptoError::MissingSecret("key for an earlier epoch")),
                (Some(copy), Some(key)) => {
                    let result = key.decrypt_metadata(copy);
                    self.resources
                        .audit_result(&opened.record, reader, "read_messages", result)
                }
            };

            messages.push(ChatMessage {
                seq: message.seq,
                sender: message.sender,
                sent_at: message.sent_at,
                text,
            });
        }
        Ok(messages)
    }

    /// Preview of the latest message, as addressed to the reader
    pub async fn read_preview(
        &self,
        principal: &Principal,
        kind: ResourceKind,
        id: &ResourceId,
    ) -> AccessResult<Option<String>> {
        ensure_chat(kind)?;
        let opened = self.resources.open(principal, kind, id).await?;
        let Some(sealed) = opened.record.previews.get(principal.user_id()) else {
            return Ok(None);
        };
        let text = opened
            .key
            .decrypt_metadata(sealed)
            .map_err(|e| self.resources.audited(&opened.record, principal.user_id(), "read_preview", e))?;
        Ok(Some(text))
    }

    /// Set the conversation's encrypted name
    pub async fn rename(&self, principal: &Principal, kind: ResourceKind, id: &ResourceId, name: &str) -> AccessResult<()> {
        ensure_chat(kind)?;
        self.resources
            .encrypt_field(principal, kind, id, encrypted_field::NAME, name)
            .await?;
        Ok(())
    }

    /// The conversation's name, if it has one
    pub async fn conversation_name(
        &self,
        principal: &Principal,
        kind: ResourceKind,
        id: &ResourceId,
    ) -> AccessResult<Option<String>> {
        ensure_chat(kind)?;
        self.resources
            .read_field(principal, kind, id, encrypted_field::NAME)
            .await
    }
}

fn ensure_chat(kind: ResourceKind) -> AccessResult<()> {
    if kind.is_chat() {
        Ok(())
    } else {
        Err(AccessError::UnsupportedKind(kind))
    }
}

fn preview_of(text: &str) -> String {
    let mut chars = text.chars();
    let preview: String = chars.by_ref().take(PREVIEW_CHARS).collect();
    if chars.next().is_some() {
        format!("{}...", preview)
    } else {
        preview
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    use crate::config::AccessConfig;
    use crate::identity::InMemoryDirectory;
    use crate::rekey::GroupRekeyingService;
    use sealbox_crypto::{KemKeyPair, os_key_source};
    use sealbox_storage::{InMemoryBlobStore, InMemoryDocumentStore};

    struct Fixture {
        chat: ConversationKeyManager,
        rekey: GroupRekeyingService,
        resources: Arc<ResourceKeyManager>,
        directory: Arc<InMemoryDirectory>,
    }

    fn fixture() -> Fixture {
        let directory = Arc::new(InMemoryDirectory::new());
        let resources = Arc::new(
            ResourceKeyManager::new(
                Arc::new(InMemoryDocumentStore::new()),
                Arc::new(InMemoryBlobStore::new()),
                directory.clone(),
                AccessConfig::testing(),
                os_key_source(),
            )
            .unwrap(),
        );
        Fixture {
            chat: ConversationKeyManager::new(resources.clone()),
            rekey: GroupRekeyingService::new(resources.clone()),
            resources,
            directory,
        }
    }

    fn principal(fixture: &Fixture, name: &str) -> Principal {
        let principal = Principal::new(name, KemKeyPair::generate());
        fixture.directory.register(principal.public_record());
        principal
    }

    #[test]
    fn test_preview_truncation() {
        assert_eq!(preview_of("short"), "short");
        let long = "é".repeat(PREVIEW_CHARS + 5);
        let preview = preview_of(&long);
        assert_eq!(preview.chars().count(), PREVIEW_CHARS + 3);
        assert!(preview.ends_with("..."));
    }

    #[tokio::test]
    async fn test_files_are_not_chats() {
        let fx = fixture();
        let alice = principal(&fx, "alice");
        let result = fx.chat.create_conversation(&alice, ResourceKind::File, &[], None).await;
        assert!(matches!(result, Err(AccessError::UnsupportedKind(ResourceKind::File))));
    }

    #[tokio::test]
    async fn test_send_and_read() {
        let fx = fixture();
        let alice = principal(&fx, "alice");
        let bob = principal(&fx, "bob");
        let created = fx
            .chat
            .create_conversation(&alice, ResourceKind::Conversation, &[bob.user_id().clone()], Some("Lunch"))
            .await
            .unwrap();
        let id = created.record.id;

        let first = fx
            .chat
            .send_message(&alice, ResourceKind::Conversation, &id, "noon?")
            .await
            .unwrap();
        let second = fx
            .chat
            .send_message(&bob, ResourceKind::Conversation, &id, "works for me")
            .await
            .unwrap();
        assert_eq!((first.seq, second.seq), (1, 2));

        for reader in [&alice, &bob] {
            let messages = fx
                .chat
                .read_messages(reader, ResourceKind::Conversation, &id)
                .await
                .unwrap();
            let texts: Vec<_> = messages.iter().map(|m| m.text.as_deref().unwrap()).collect();
            assert_eq!(texts, vec!["noon?", "works for me"]);
            assert!(messages[0].sent_at.unwrap() < messages[1].sent_at.unwrap());
        }

        let record = fx.resources.load(ResourceKind::Conversation, &id).await.unwrap();
        assert_eq!(record.message_count, 2);
        assert_eq!(record.last_sender.as_ref(), Some(bob.user_id()));
        assert!(record.last_message_at.is_some());

        let preview = fx
            .chat
            .read_preview(&alice, ResourceKind::Conversation, &id)
            .await
            .unwrap();
        assert_eq!(preview.as_deref(), Some("works for me"));
        assert_eq!(
            fx.chat
                .conversation_name(&bob, ResourceKind::Conversation, &id)
                .await
                .unwrap()
                .as_deref(),
            Some("Lunch")
        );
    }

    #[tokio::test]
    async fn test_copies_use_distinct_nonces() {
        let fx = fixture();
        let alice = principal(&fx, "alice");
        let others: Vec<Principal> = (0..5).map(|i| principal(&fx, &format!("user-{}", i))).collect();
        let ids: Vec<UserId> = others.iter().map(|p| p.user_id().clone()).collect();
        let created = fx
            .chat
            .create_conversation(&alice, ResourceKind::Group, &ids, None)
            .await
            .unwrap();
        let id = created.record.id;

        for _ in 0..10 {
            fx.chat
                .send_message(&alice, ResourceKind::Group, &id, "same text every time")
                .await
                .unwrap();
        }

        let mut nonces = HashSet::new();
        let mut total = 0;
        let collection = messages_collection(ResourceKind::Group, &id);
        for (_, document) in fx.resources.documents().list(&collection).await.unwrap() {
            let message = MessageRecord::from_document(&document).unwrap();
            assert_eq!(message.copies.len(), 6);
            for copy in message.copies.values() {
                nonces.insert(copy.nonce);
                total += 1;
            }
        }
        assert_eq!(total, 60);
        assert_eq!(nonces.len(), total);
    }

    #[tokio::test]
    async fn test_late_joiner_sees_only_new_messages() {
        let fx = fixture();
        let alice = principal(&fx, "alice");
        let carol = principal(&fx, "carol");
        let created = fx
            .chat
            .create_conversation(&alice, ResourceKind::Group, &[], None)
            .await
            .unwrap();
        let id = created.record.id;

        fx.chat
            .send_message(&alice, ResourceKind::Group, &id, "before")
            .await
            .unwrap();
        fx.rekey
            .add_members(&alice, ResourceKind::Group, &id, &[carol.user_id().clone()])
            .await
            .unwrap();
        fx.chat
            .send_message(&alice, ResourceKind::Group, &id, "after")
            .await
            .unwrap();

        let messages = fx.chat.read_messages(&carol, ResourceKind::Group, &id).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert!(matches!(messages[0].text, Err(CryptoError::AccessDenied { .. })));
        assert_eq!(messages[1].text.as_deref().unwrap(), "after");
    }

    #[tokio::test]
    async fn test_outsider_cannot_send() {
        let fx = fixture();
        let alice = principal(&fx, "alice");
        let eve = principal(&fx, "eve");
        let created = fx
            .chat
            .create_conversation(&alice, ResourceKind::Conversation, &[], None)
            .await
            .unwrap();

        let result = fx
            .chat
            .send_message(&eve, ResourceKind::Conversation, &created.record.id, "hi")
            .await;
        assert!(result.unwrap_err().is_access_denied());
        let record = fx
            .resources
            .load(ResourceKind::Conversation, &created.record.id)
            .await
            .unwrap();
        assert_eq!(record.message_count, 0);
    }

    #[tokio::test]
    async fn test_history_survives_rotation() {
        let fx = fixture();
        let alice = principal(&fx, "alice");
        let bob = principal(&fx, "bob");
        let created = fx
            .chat
            .create_conversation(&alice, ResourceKind::Group, &[bob.user_id().clone()], Some("Ops"))
            .await
            .unwrap();
        let id = created.record.id;

        fx.chat.send_message(&bob, ResourceKind::Group, &id, "one").await.unwrap();
        fx.chat.send_message(&alice, ResourceKind::Group, &id, "two").await.unwrap();

        let epoch = fx.rekey.rotate_key(&alice, ResourceKind::Group, &id).await.unwrap();
        assert_eq!(epoch, 2);

        let messages = fx.chat.read_messages(&bob, ResourceKind::Group, &id).await.unwrap();
        let texts: Vec<_> = messages.iter().map(|m| m.text.as_deref().unwrap()).collect();
        assert_eq!(texts, vec!["one", "two"]);

        fx.chat.rename(&alice, ResourceKind::Group, &id, "Ops (new)").await.unwrap();
        assert_eq!(
            fx.chat
                .conversation_name(&bob, ResourceKind::Group, &id)
                .await
                .unwrap()
                .as_deref(),
            Some("Ops (new)")
        );
        assert_eq!(
            fx.chat.read_preview(&bob, ResourceKind::Group, &id).await.unwrap().as_deref(),
            Some("two")
        );
    }
}
