#![cfg(unix)]

use grimoire_embedding_store::EmbeddingStore;
use grimoire_home::{EnvStore, GrimoireHome};
use grimoire_lifecycle::{process_alive, LifecycleManager, SpellLifecycle};
use std::collections::HashSet;

async fn manager_in(
    dir: &std::path::Path,
) -> (std::sync::Arc<LifecycleManager>, EmbeddingStore) {
    let store = EmbeddingStore::load(dir.join("embeddings.msgpack"))
        .await
        .expect("store");
    let env_store = EnvStore::new(GrimoireHome::at(dir));
    let (manager, _events) =
        LifecycleManager::new(store.clone(), env_store, HashSet::new(), None);
    (manager, store)
}

#[tokio::test]
async fn orphan_pid_is_probed_and_killed() {
    let tmp = tempfile::tempdir().expect("tempdir");

    // Simulate a previous gateway run: a live child whose PID was
    // persisted, then the gateway died without shutdown.
    let mut orphan = std::process::Command::new("sleep")
        .arg("300")
        .spawn()
        .expect("spawn orphan");
    let pid = orphan.id();

    {
        let store = EmbeddingStore::load(tmp.path().join("embeddings.msgpack"))
            .await
            .expect("store");
        store.update_lifecycle(|meta| {
            meta.turn_counter = 17;
            meta.last_used_turn.insert("postgres".to_string(), 12);
            meta.active_pids.insert("postgres".to_string(), pid);
        });
        store.flush().await.expect("flush");
    }

    // A fresh process starts up against the same grimoire dir.
    let (manager, store) = manager_in(tmp.path()).await;
    let reaped = manager.load_from_storage().await;

    assert_eq!(reaped, vec![pid]);
    let _ = orphan.wait();
    #[allow(clippy::cast_possible_wrap)]
    {
        assert!(!process_alive(pid as i32), "orphan must be dead");
    }

    let meta = store.lifecycle();
    assert!(meta.active_pids.is_empty(), "pid map must be cleared");
    assert_eq!(meta.turn_counter, 17, "turn counter must be restored");
    assert_eq!(
        meta.last_used_turn.get("postgres"),
        Some(&12),
        "last-used map must be restored"
    );
}

#[tokio::test]
async fn dead_recorded_pid_is_cleared_without_signalling() {
    let tmp = tempfile::tempdir().expect("tempdir");

    // A recorded PID whose process exited long ago.
    let mut child = std::process::Command::new("true")
        .spawn()
        .expect("spawn short-lived child");
    let pid = child.id();
    let _ = child.wait();

    {
        let store = EmbeddingStore::load(tmp.path().join("embeddings.msgpack"))
            .await
            .expect("store");
        store.update_lifecycle(|meta| {
            meta.active_pids.insert("ghost".to_string(), pid);
        });
        store.flush().await.expect("flush");
    }

    let (manager, store) = manager_in(tmp.path()).await;
    let reaped = manager.load_from_storage().await;
    assert!(reaped.is_empty(), "nothing live, nothing reaped");
    assert!(store.lifecycle().active_pids.is_empty());
}

#[tokio::test]
async fn turn_and_usage_bookkeeping() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let (manager, store) = manager_in(tmp.path()).await;

    assert_eq!(manager.increment_turn().await, 1);
    assert_eq!(manager.increment_turn().await, 2);
    manager.mark_used("cap-js").await;

    let meta = store.lifecycle();
    assert_eq!(meta.turn_counter, 2);
    assert_eq!(meta.last_used_turn.get("cap-js"), Some(&2));

    // No backends are active, so cleanup has nothing to kill even at a
    // much later turn.
    for _ in 0..10 {
        manager.increment_turn().await;
    }
    assert!(manager.cleanup_inactive(5).await.is_empty());
    assert!(manager.active_spells().await.is_empty());
}
