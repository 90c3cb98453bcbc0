//! Concurrency tests for sealbox-access
//!
//! Membership changes and message sends are read-modify-write cycles on
//! one resource document. These tests run many of them at once and check
//! that none is lost.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use sealbox_access::{
    AccessConfig, ConversationKeyManager, GroupRekeyingService, InMemoryDirectory, Principal, ResourceKeyManager,
};
use sealbox_core::{ResourceKind, UserId};
use sealbox_crypto::{KemKeyPair, open_envelope, os_key_source};
use sealbox_storage::{InMemoryBlobStore, InMemoryDocumentStore};

struct World {
    directory: Arc<InMemoryDirectory>,
    resources: Arc<ResourceKeyManager>,
    rekey: Arc<GroupRekeyingService>,
    chat: Arc<ConversationKeyManager>,
}

fn world() -> World {
    sealbox_logging::init_testing();
    let directory = Arc::new(InMemoryDirectory::new());
    let resources = Arc::new(
        ResourceKeyManager::new(
            Arc::new(InMemoryDocumentStore::new()),
            Arc::new(InMemoryBlobStore::new()),
            directory.clone(),
            AccessConfig {
                max_update_attempts: 1_000,
                ..AccessConfig::testing()
            },
            os_key_source(),
        )
        .unwrap(),
    );
    World {
        directory,
        rekey: Arc::new(GroupRekeyingService::new(resources.clone())),
        chat: Arc::new(ConversationKeyManager::new(resources.clone())),
        resources,
    }
}

fn user(world: &World, name: &str) -> Arc<Principal> {
    let principal = Principal::new(name, KemKeyPair::generate());
    world.directory.register(principal.public_record());
    Arc::new(principal)
}

/// Concurrent additions all land, each with a working wrap
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_adds_keep_every_member() {
    let world = world();
    let owner = user(&world, "owner");
    let group = world
        .resources
        .create_resource(&owner, ResourceKind::Group, &[], &[])
        .await
        .unwrap();
    let id = group.record.id.clone();

    let newcomers: Vec<Arc<Principal>> = (0..16).map(|i| user(&world, &format!("member-{}", i))).collect();

    let start = Instant::now();
    let mut handles = vec![];
    for member in &newcomers {
        let rekey = Arc::clone(&world.rekey);
        let owner = Arc::clone(&owner);
        let id = id.clone();
        let member_id = member.user_id().clone();
        handles.push(tokio::spawn(async move {
            rekey
                .add_members(&owner, ResourceKind::Group, &id, &[member_id])
                .await
                .expect("add failed")
        }));
    }
    for handle in handles {
        assert_eq!(handle.await.expect("Task panicked").len(), 1);
    }
    println!("16 concurrent adds took {:?}", start.elapsed());

    let record = world.resources.load(ResourceKind::Group, &id).await.unwrap();
    assert_eq!(record.wraps.len(), 17);
    assert_eq!(record.members.len(), 17);
    assert!(record.roster_drift().is_empty());
    for member in &newcomers {
        let key = open_envelope(&record.wraps, member.user_id(), member.key_pair()).unwrap();
        assert_eq!(key, group.key);
    }
}

/// An addition racing a removal never undoes it, and vice versa
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_add_and_remove_do_not_undo_each_other() {
    let world = world();
    let owner = user(&world, "owner");
    let leavers: Vec<Arc<Principal>> = (0..8).map(|i| user(&world, &format!("leaver-{}", i))).collect();
    let joiners: Vec<Arc<Principal>> = (0..8).map(|i| user(&world, &format!("joiner-{}", i))).collect();

    let leaver_ids: Vec<UserId> = leavers.iter().map(|p| p.user_id().clone()).collect();
    let group = world
        .resources
        .create_resource(&owner, ResourceKind::Group, &leaver_ids, &[])
        .await
        .unwrap();
    let id = group.record.id.clone();

    let mut handles = vec![];
    for (leaver, joiner) in leavers.iter().zip(&joiners) {
        let rekey = Arc::clone(&world.rekey);
        let leaver = Arc::clone(leaver);
        let id_remove = id.clone();
        handles.push(tokio::spawn(async move {
            rekey
                .remove_members(&leaver, ResourceKind::Group, &id_remove, &[leaver.user_id().clone()])
                .await
                .expect("remove failed");
        }));

        let rekey = Arc::clone(&world.rekey);
        let owner = Arc::clone(&owner);
        let id_add = id.clone();
        let joiner_id = joiner.user_id().clone();
        handles.push(tokio::spawn(async move {
            rekey
                .add_members(&owner, ResourceKind::Group, &id_add, &[joiner_id])
                .await
                .expect("add failed");
        }));
    }
    for handle in handles {
        handle.await.expect("Task panicked");
    }

    let record = world.resources.load(ResourceKind::Group, &id).await.unwrap();
    let holders: HashSet<&UserId> = record.wraps.recipients().collect();
    for leaver in &leavers {
        assert!(!holders.contains(leaver.user_id()), "{} still has a wrap", leaver.user_id());
    }
    for joiner in &joiners {
        assert!(holders.contains(joiner.user_id()), "{} lost their wrap", joiner.user_id());
    }
    assert_eq!(holders.len(), 1 + joiners.len());
    assert!(record.roster_drift().is_empty());
}

/// Concurrent senders each get a distinct sequence number
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_sends_are_all_delivered() {
    let world = world();
    let senders: Vec<Arc<Principal>> = (0..4).map(|i| user(&world, &format!("sender-{}", i))).collect();
    let others: Vec<UserId> = senders[1..].iter().map(|p| p.user_id().clone()).collect();
    let chat = world
        .chat
        .create_conversation(&senders[0], ResourceKind::Conversation, &others, None)
        .await
        .unwrap();
    let id = chat.record.id.clone();

    let per_sender = 10;
    let mut handles = vec![];
    for sender in &senders {
        let chat = Arc::clone(&world.chat);
        let sender = Arc::clone(sender);
        let id = id.clone();
        handles.push(tokio::spawn(async move {
            let mut seqs = vec![];
            for i in 0..per_sender {
                let text = format!("{} says {}", sender.user_id(), i);
                let sent = chat
                    .send_message(&sender, ResourceKind::Conversation, &id, &text)
                    .await
                    .expect("send failed");
                seqs.push(sent.seq);
            }
            seqs
        }));
    }

    let mut all_seqs = HashSet::new();
    for handle in handles {
        for seq in handle.await.expect("Task panicked") {
            assert!(all_seqs.insert(seq), "sequence {} issued twice", seq);
        }
    }
    let total = senders.len() * per_sender;
    assert_eq!(all_seqs.len(), total);

    let record = world.resources.load(ResourceKind::Conversation, &id).await.unwrap();
    assert_eq!(record.message_count, total as u64);

    let history = world
        .chat
        .read_messages(&senders[2], ResourceKind::Conversation, &id)
        .await
        .unwrap();
    assert_eq!(history.len(), total);
    let seqs: Vec<u64> = history.iter().map(|m| m.seq).collect();
    assert_eq!(seqs, (1..=total as u64).collect::<Vec<_>>());
    assert!(history.iter().all(|m| m.text.is_ok()));
}

/// Messages sent while the key rotates all end up under the new key
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_sends_during_rotation_stay_readable() {
    let world = world();
    let a = user(&world, "a");
    let b = user(&world, "b");
    let chat = world
        .chat
        .create_conversation(&a, ResourceKind::Group, &[b.user_id().clone()], None)
        .await
        .unwrap();
    let id = chat.record.id.clone();

    let sender = {
        let chat = Arc::clone(&world.chat);
        let b = Arc::clone(&b);
        let id = id.clone();
        tokio::spawn(async move {
            for i in 0..20 {
                chat.send_message(&b, ResourceKind::Group, &id, &format!("message {}", i))
                    .await
                    .expect("send failed");
            }
        })
    };
    let rotator = {
        let rekey = Arc::clone(&world.rekey);
        let a = Arc::clone(&a);
        let id = id.clone();
        tokio::spawn(async move {
            let mut epoch = 0;
            for _ in 0..3 {
                epoch = rekey
                    .rotate_key(&a, ResourceKind::Group, &id)
                    .await
                    .expect("rotation failed");
                tokio::task::yield_now().await;
            }
            epoch
        })
    };

    sender.await.expect("Task panicked");
    let epoch = rotator.await.expect("Task panicked");
    assert_eq!(epoch, 4);

    let history = world.chat.read_messages(&a, ResourceKind::Group, &id).await.unwrap();
    assert_eq!(history.len(), 20);
    for (i, message) in history.iter().enumerate() {
        assert_eq!(message.text.as_deref().unwrap(), format!("message {}", i));
    }
}
