//! Operation lifecycle against an in-memory provider
//!
//! Covers conflict detection before provider calls, overwrite, provider
//! failures, per-container serialisation, and listener delivery across the
//! durable and temporary registries.

use std::sync::Arc;
use std::time::Duration;

use overcast_core::ports::StorageProvider;
use overcast_core::{Container, ContainerKind, Operation, OperationState, StorageError};
use overcast_memory::MemoryProvider;

use crate::common;

fn child(folder: &Container, name: &str, kind: ContainerKind) -> Arc<Container> {
    folder.find_child(name, kind).unwrap()
}

// ------------------------------------------------------------------
// Conflicts
// ------------------------------------------------------------------

#[tokio::test]
async fn test_copy_onto_existing_name_fails_before_provider_call() {
    let (provider, _ctx, root) = common::seeded_tree().await;
    let a = child(&root, "a.txt", ContainerKind::File);
    let docs = child(&root, "Docs", ContainerKind::Folder);
    let before = common::names(&docs);
    let (listener, mut rx) = common::listener();

    let err = a.copy(&docs, false, &[listener]).await.unwrap_err();

    assert_eq!(err, StorageError::AlreadyExists("/Docs/a.txt".to_string()));
    assert_eq!(provider.calls().copy, 0);
    assert_eq!(provider.calls().mutations(), 0);
    assert_eq!(common::names(&docs), before);
    assert_eq!(child(&docs, "a.txt", ContainerKind::File).size(), 5);

    let events = common::drain(&mut rx);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].state, OperationState::Failed);
    assert_eq!(events[0].operation, Operation::Copy);
}

#[tokio::test]
async fn test_copy_with_overwrite_replaces_existing() {
    let (provider, _ctx, root) = common::seeded_tree().await;
    let a = child(&root, "a.txt", ContainerKind::File);
    let docs = child(&root, "Docs", ContainerKind::Folder);
    let old = child(&docs, "a.txt", ContainerKind::File);

    let copy = a.copy(&docs, true, &[]).await.unwrap();

    assert_eq!(provider.calls().delete, 1);
    assert_eq!(provider.calls().copy, 1);
    assert_eq!(copy.path(), "/Docs/a.txt");
    assert_eq!(copy.size(), 3);
    assert_ne!(copy.id(), old.id());
    assert!(old.parent().is_none());
    assert_eq!(docs.files().len(), 2);
    assert_eq!(provider.handle_at("/Docs/a.txt").unwrap().size, 3);
    // The original stays where it was.
    assert!(root.contains_id(&a.id()));
}

#[tokio::test]
async fn test_rename_onto_sibling_fails() {
    let (provider, _ctx, root) = common::seeded_tree().await;
    let docs = child(&root, "Docs", ContainerKind::Folder);
    let b = child(&docs, "b.txt", ContainerKind::File);

    let err = b.rename("a.txt", &[]).await.unwrap_err();

    assert!(err.is_already_exists());
    assert_eq!(provider.calls().rename, 0);
    assert_eq!(b.name(), "b.txt");
}

#[tokio::test]
async fn test_same_name_of_other_kind_is_no_conflict() {
    let (provider, _ctx, root) = common::seeded_tree().await;
    let archive = child(&root, "Archive", ContainerKind::Folder);
    provider.add_folder("/Archive", "a.txt").unwrap();
    archive.build_tree(0).await.unwrap();

    let a = child(&root, "a.txt", ContainerKind::File);
    let copy = a.copy(&archive, false, &[]).await.unwrap();

    assert!(copy.is_file());
    assert_eq!(archive.child_count(), 2);
}

#[tokio::test]
async fn test_invalid_name_rejected() {
    let (provider, _ctx, root) = common::seeded_tree().await;
    let a = child(&root, "a.txt", ContainerKind::File);

    let err = a.rename("bad/name", &[]).await.unwrap_err();

    assert!(matches!(err, StorageError::InvalidName(_)));
    assert_eq!(provider.calls().rename, 0);
}

// ------------------------------------------------------------------
// Structural effects
// ------------------------------------------------------------------

#[tokio::test]
async fn test_move_relinks_container() {
    let (provider, _ctx, root) = common::seeded_tree().await;
    let a = child(&root, "a.txt", ContainerKind::File);
    let archive = child(&root, "Archive", ContainerKind::Folder);

    a.move_to(&archive, false, &[]).await.unwrap();

    assert!(root.find_child("a.txt", ContainerKind::File).is_none());
    assert!(Arc::ptr_eq(&a.parent().unwrap(), &archive));
    assert_eq!(a.path(), "/Archive/a.txt");
    assert!(provider.contains("/Archive/a.txt"));
    assert!(!provider.contains("/a.txt"));
}

#[tokio::test]
async fn test_rename_folder_updates_descendant_paths() {
    let (provider, _ctx, root) = common::seeded_tree().await;
    let docs = child(&root, "Docs", ContainerKind::Folder);
    let b = child(&docs, "b.txt", ContainerKind::File);

    docs.rename("Papers", &[]).await.unwrap();

    assert_eq!(docs.path(), "/Papers");
    assert_eq!(b.path(), "/Papers/b.txt");
    assert!(provider.contains("/Papers/b.txt"));
}

#[tokio::test]
async fn test_delete_folder_detaches_it() {
    let (provider, _ctx, root) = common::seeded_tree().await;
    let docs = child(&root, "Docs", ContainerKind::Folder);

    docs.delete(&[]).await.unwrap();

    assert!(docs.parent().is_none());
    assert_eq!(common::names(&root), vec!["Archive", "a.txt"]);
    assert!(!provider.contains("/Docs/b.txt"));
}

#[tokio::test]
async fn test_copy_across_providers_rejected() {
    let (provider, _ctx, root) = common::seeded_tree().await;
    let other = MemoryProvider::new("other");
    let other_ctx = common::connect(&other).await;
    let other_root = other_ctx.init_tree().await.unwrap();

    let a = child(&root, "a.txt", ContainerKind::File);
    let err = a.copy(&other_root, false, &[]).await.unwrap_err();

    assert!(matches!(err, StorageError::OperationFailure { ref action, .. } if action == "copy"));
    assert_eq!(provider.calls().copy, 0);
}

#[tokio::test]
async fn test_create_folder_rejects_duplicate() {
    let (provider, _ctx, root) = common::seeded_tree().await;

    let photos = root.create_folder("Photos").await.unwrap();
    assert_eq!(photos.path(), "/Photos");
    assert!(provider.contains("/Photos"));

    let err = root.create_folder("Photos").await.unwrap_err();
    assert!(matches!(err, StorageError::CreationFailure(_)));
    assert_eq!(provider.calls().create_folder, 1);
}

// ------------------------------------------------------------------
// Provider failures
// ------------------------------------------------------------------

#[tokio::test]
async fn test_provider_failure_notifies_failed_and_keeps_tree() {
    let (provider, _ctx, root) = common::seeded_tree().await;
    provider.fail("rename");
    let a = child(&root, "a.txt", ContainerKind::File);
    let (listener, mut rx) = common::listener();

    let err = a.rename("z.txt", &[Arc::clone(&listener)]).await.unwrap_err();

    match err {
        StorageError::OperationFailure { action, message } => {
            assert_eq!(action, "rename");
            assert!(message.contains("simulated rename failure"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(a.name(), "a.txt");

    let events = common::drain(&mut rx);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].state, OperationState::Failed);
    assert_eq!(events[0].progress, 0.0);
    assert!(!a.has_listener(&listener));
}

#[tokio::test]
async fn test_exists_reflects_provider() {
    let (provider, _ctx, root) = common::seeded_tree().await;
    let a = child(&root, "a.txt", ContainerKind::File);

    assert!(a.exists().await.unwrap());
    provider.remove("/a.txt");
    assert!(!a.exists().await.unwrap());

    provider.fail("exists");
    assert!(matches!(a.exists().await, Err(StorageError::AccessFailure(_))));
}

#[tokio::test]
async fn test_update_from_source_picks_up_remote_changes() {
    let (provider, _ctx, root) = common::seeded_tree().await;
    let a = child(&root, "a.txt", ContainerKind::File);

    // Renamed behind the tree's back.
    let handle = a.source().unwrap();
    provider.rename(&handle, "z.txt").await.unwrap();
    assert_eq!(a.name(), "a.txt");

    a.update_from_source().await.unwrap();
    assert_eq!(a.name(), "z.txt");
    assert_eq!(a.size(), 3);

    provider.remove("/z.txt");
    let err = a.update_from_source().await.unwrap_err();
    assert!(matches!(err, StorageError::OperationFailure { ref action, .. } if action == "update"));
}

// ------------------------------------------------------------------
// Concurrency
// ------------------------------------------------------------------

async fn paced_tree() -> (Arc<MemoryProvider>, Arc<Container>) {
    let provider = MemoryProvider::builder("memory")
        .mutation_delay(Duration::from_millis(50))
        .build();
    let (provider, _ctx, root) = common::seeded_tree_on(provider).await;
    (provider, root)
}

/// Awaits every task, failing the test if they take longer than a few seconds
async fn join_all<T: Send + 'static>(tasks: Vec<tokio::task::JoinHandle<T>>) -> Vec<T> {
    tokio::time::timeout(Duration::from_secs(5), async {
        let mut results = Vec::with_capacity(tasks.len());
        for task in tasks {
            results.push(task.await.unwrap());
        }
        results
    })
    .await
    .expect("operations did not finish")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_operations_on_one_container_run_one_at_a_time() {
    let (provider, root) = paced_tree().await;
    let a = child(&root, "a.txt", ContainerKind::File);

    let tasks = ["one.txt", "two.txt", "three.txt"]
        .into_iter()
        .map(|name| {
            let a = Arc::clone(&a);
            tokio::spawn(async move { a.rename(name, &[]).await })
        })
        .collect();
    let results = join_all(tasks).await;

    assert!(results.iter().all(Result::is_ok));
    assert_eq!(provider.max_in_flight(), 1);
    assert_eq!(provider.calls().rename, 3);
    assert_eq!(root.files().len(), 1);
    assert!(provider.contains(&format!("/{}", a.name())));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_operations_on_different_containers_overlap() {
    let (provider, root) = paced_tree().await;
    let a = child(&root, "a.txt", ContainerKind::File);
    let b = child(&child(&root, "Docs", ContainerKind::Folder), "b.txt", ContainerKind::File);

    let tasks = vec![
        tokio::spawn(async move { a.rename("x.txt", &[]).await }),
        tokio::spawn(async move { b.rename("y.txt", &[]).await }),
    ];
    let results = join_all(tasks).await;

    assert!(results.iter().all(Result::is_ok));
    assert_eq!(provider.max_in_flight(), 2);
    assert!(provider.contains("/x.txt"));
    assert!(provider.contains("/Docs/y.txt"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_crossed_overwriting_copies_both_finish() {
    let (_provider, root) = paced_tree().await;
    let docs = child(&root, "Docs", ContainerKind::Folder);
    let top = child(&root, "a.txt", ContainerKind::File);
    let nested = child(&docs, "a.txt", ContainerKind::File);

    let tasks = vec![
        {
            let (top, docs) = (Arc::clone(&top), Arc::clone(&docs));
            tokio::spawn(async move { top.copy(&docs, true, &[]).await.map(|_| ()) })
        },
        {
            let (nested, root) = (Arc::clone(&nested), Arc::clone(&root));
            tokio::spawn(async move { nested.copy(&root, true, &[]).await.map(|_| ()) })
        },
    ];
    let results = join_all(tasks).await;

    // Whichever runs second finds its source already overwritten.
    assert!(results.iter().any(Result::is_ok));
    let copies = [&root, &docs]
        .iter()
        .filter(|folder| folder.find_child("a.txt", ContainerKind::File).is_some())
        .count();
    assert_eq!(copies, 1);
}

// ------------------------------------------------------------------
// Listener delivery
// ------------------------------------------------------------------

#[tokio::test]
async fn test_durable_and_temporary_listener_notified_once() {
    let (_provider, _ctx, root) = common::seeded_tree().await;
    let a = child(&root, "a.txt", ContainerKind::File);
    let archive = child(&root, "Archive", ContainerKind::Folder);
    let (listener, mut rx) = common::listener();

    a.add_listener(Arc::clone(&listener), Operation::Copy);
    let copy = a.copy(&archive, false, &[Arc::clone(&listener)]).await.unwrap();

    let events = common::drain(&mut rx);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].state, OperationState::Completed);
    assert_eq!(events[0].progress, 1.0);
    assert!(Arc::ptr_eq(events[0].affected.as_ref().unwrap(), &copy));
    // Passing a durable listener for one call leaves it durable.
    assert!(a.is_listening(&listener, Operation::Copy));
}

#[tokio::test]
async fn test_temporary_listener_scoped_to_call() {
    let (_provider, _ctx, root) = common::seeded_tree().await;
    let a = child(&root, "a.txt", ContainerKind::File);
    let (listener, mut rx) = common::listener();

    a.rename("first.txt", &[Arc::clone(&listener)]).await.unwrap();
    a.rename("second.txt", &[]).await.unwrap();

    let events = common::drain(&mut rx);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].operation, Operation::Rename);
    assert!(!a.has_listener(&listener));
}

#[tokio::test]
async fn test_durable_listener_only_hears_its_operation() {
    let (_provider, _ctx, root) = common::seeded_tree().await;
    let a = child(&root, "a.txt", ContainerKind::File);
    let archive = child(&root, "Archive", ContainerKind::Folder);
    let (listener, mut rx) = common::listener();

    a.add_listener(Arc::clone(&listener), Operation::Delete);
    a.rename("b.txt", &[]).await.unwrap();
    a.move_to(&archive, false, &[]).await.unwrap();
    assert!(common::drain(&mut rx).is_empty());

    a.delete(&[]).await.unwrap();
    let events = common::drain(&mut rx);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].operation, Operation::Delete);
    assert!(events[0].affected.is_none());
}

#[tokio::test]
async fn test_every_distinct_listener_notified() {
    let (_provider, _ctx, root) = common::seeded_tree().await;
    let a = child(&root, "a.txt", ContainerKind::File);
    let (durable, mut durable_rx) = common::listener();
    let (temporary, mut temporary_rx) = common::listener();

    a.add_listener(Arc::clone(&durable), Operation::Rename);
    a.rename("c.txt", &[temporary]).await.unwrap();

    assert_eq!(common::drain(&mut durable_rx).len(), 1);
    assert_eq!(common::drain(&mut temporary_rx).len(), 1);
}
