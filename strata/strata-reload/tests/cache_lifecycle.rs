//! Publication, merging, change tracking and eviction of cached states.

mod common;

use common::{Mock, Profile, epoch, project_with, service, service_with, test_config};
use filetime::FileTime;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use strata_core::{Quality, RequestContext, StateRequest};
use strata_reload::{
    FileEvent, OperationState, ReloadError, SaveHook, SnapshotEvent, StateSnapshot, Subscription,
};
use tempfile::TempDir;

type EventLog = Arc<Mutex<Vec<SnapshotEvent>>>;

fn record_events(snapshot: &StateSnapshot) -> (EventLog, Subscription) {
    let events: EventLog = Arc::default();
    let sink = Arc::clone(&events);
    let subscription = snapshot.subscribe(move |event| sink.lock().push(event.clone()));
    (events, subscription)
}

fn set_mtime(path: &Path, time: SystemTime) {
    filetime::set_file_mtime(path, FileTime::from_system_time(time)).unwrap();
}

#[tokio::test]
async fn test_equivalent_reload_merges_into_cached_state() {
    let service = service();
    let a = Mock::new("a");
    let project = project_with(&service, &[&a]);

    let first = service
        .request_state(project, StateRequest::load())
        .await
        .unwrap();
    let merged = service
        .request_state(project, StateRequest::reload())
        .await
        .unwrap();

    assert_eq!(merged.id(), first.id());
    assert!(first.is_valid());
    assert_eq!(a.calls(), 2);

    service.flush().await;
    assert_eq!(a.released(), 1, "the discarded duplicate is released");

    // The participant still holds the discarded data; its changes reach the
    // cached state.
    let discarded = a.last_produced().unwrap();
    discarded.fire_changed(false, true);
    service.flush().await;
    assert!(!first.is_consistent());
}

#[tokio::test]
async fn test_changed_reload_supersedes_cached_state() {
    let service = service();
    let a = Mock::new("a");
    let project = project_with(&service, &[&a]);

    let first = service
        .request_state(project, StateRequest::load())
        .await
        .unwrap();
    let (events, _subscription) = record_events(&first);

    a.configure(|b| b.timestamp = epoch() + Duration::from_secs(1));
    let second = service
        .request_state(project, StateRequest::reload())
        .await
        .unwrap();

    assert_ne!(second.id(), first.id());
    assert_eq!(second.predecessor_id(), Some(first.id()));
    assert_eq!(second.predecessor().map(|p| p.id()), Some(first.id()));
    assert!(!first.is_valid());
    assert_eq!(service.get_current_state(project).id(), second.id());

    service.flush().await;
    assert_eq!(
        events.lock().as_slice(),
        &[SnapshotEvent::Invalidated { snapshot: first.id() }]
    );
    assert_eq!(a.released(), 0, "the old state is still referenced");

    drop(first);
    service.flush().await;
    assert_eq!(a.released(), 1);
    assert!(second.predecessor().is_none());
}

#[tokio::test]
async fn test_modified_file_invalidates_consistency() {
    let service = service();
    let dir = TempDir::new().unwrap();
    let build_file = dir.path().join("build.conf");
    std::fs::write(&build_file, "modules = core").unwrap();

    let base = SystemTime::now() - Duration::from_secs(3600);
    set_mtime(&build_file, base);

    let a = Mock::new("a");
    a.configure(|b| {
        b.files = vec![build_file.clone()];
        b.timestamp = base + Duration::from_secs(10);
    });
    let project = project_with(&service, &[&a]);

    let first = service
        .request_state(project, StateRequest::refresh())
        .await
        .unwrap();
    assert!(first.is_consistent());
    assert!(service.watcher().is_watching(&build_file));
    assert!(service.watcher().watched_dirs().contains(dir.path()));

    let (events, _subscription) = record_events(&first);

    // An event older than the snapshot changes nothing.
    service.watcher().handle_event(&FileEvent::modified(build_file.clone()));
    assert!(first.is_consistent());

    set_mtime(&build_file, base + Duration::from_secs(20));
    service.watcher().handle_event(&FileEvent::modified(build_file.clone()));
    assert!(!first.is_consistent());
    assert!(first.changed_files().contains(&build_file));
    service.flush().await;
    assert_eq!(
        events.lock().as_slice(),
        &[SnapshotEvent::Changed {
            snapshot: first.id(),
            consistent: false
        }]
    );

    // A load request does not demand consistency.
    let loaded = service
        .request_state(project, StateRequest::load())
        .await
        .unwrap();
    assert_eq!(loaded.id(), first.id());

    a.configure(|b| b.timestamp = base + Duration::from_secs(30));
    let refreshed = service
        .request_state(project, StateRequest::refresh())
        .await
        .unwrap();

    assert!(refreshed.is_consistent());
    assert_eq!(refreshed.predecessor_id(), Some(first.id()));
    assert!(!first.is_valid());
    assert_eq!(a.calls(), 2);

    service.flush().await;
    assert_eq!(
        events.lock().as_slice(),
        &[
            SnapshotEvent::Changed {
                snapshot: first.id(),
                consistent: false
            },
            SnapshotEvent::Invalidated { snapshot: first.id() },
        ]
    );
}

#[tokio::test]
async fn test_new_file_next_to_loaded_files_reloads_its_neighbour() {
    let service = service();
    let dir = TempDir::new().unwrap();
    let build_file = dir.path().join("build.conf");
    std::fs::write(&build_file, "modules = core").unwrap();
    let base = SystemTime::now() - Duration::from_secs(3600);
    set_mtime(&build_file, base);

    let a = Mock::new("a");
    a.configure(|b| {
        b.files = vec![build_file.clone()];
        b.timestamp = base + Duration::from_secs(10);
    });
    let other = Mock::new("other");
    other.configure(|b| b.files = vec![PathBuf::from("/virtual/other/settings.conf")]);
    let project = project_with(&service, &[&a, &other]);

    let first = service
        .request_state(project, StateRequest::refresh())
        .await
        .unwrap();
    assert!(first.is_consistent());

    let module = dir.path().join("module.conf");
    std::fs::write(&module, "name = extra").unwrap();
    service.watcher().handle_event(&FileEvent::created(module.clone()));
    assert!(!first.is_consistent());
    assert!(first.changed_files().contains(&module));

    let second = service
        .request_state(project, StateRequest::refresh())
        .await
        .unwrap();
    assert_eq!(a.calls(), 2, "the owner of the directory reloads");
    assert_eq!(other.calls(), 1);
    assert!(second.is_consistent());
    assert_ne!(second.id(), first.id());
    assert!(!first.is_valid());
}

#[tokio::test]
async fn test_change_nobody_owns_reloads_everyone() {
    let service = service();
    let a = Mock::new("a");
    let b = Mock::new("b");
    a.configure(|x| x.files = vec![PathBuf::from("/virtual/a/build.conf")]);
    let project = project_with(&service, &[&a, &b]);

    let first = service
        .request_state(project, StateRequest::refresh())
        .await
        .unwrap();
    first.mark_inconsistent([PathBuf::from("/virtual/unrelated/notes.txt")]);

    let second = service
        .request_state(project, StateRequest::refresh())
        .await
        .unwrap();
    assert_eq!(a.calls(), 2);
    assert_eq!(b.calls(), 2);
    assert!(second.is_consistent());
    assert_ne!(second.id(), first.id());
}

#[tokio::test]
async fn test_file_modified_during_load_is_loaded_again() {
    let service = service();
    let dir = TempDir::new().unwrap();
    let build_file = dir.path().join("build.conf");
    std::fs::write(&build_file, "modules = core").unwrap();
    let base = SystemTime::now() - Duration::from_secs(3600);
    set_mtime(&build_file, base);

    let a = Mock::new("a");
    a.configure(|b| {
        b.files = vec![build_file.clone()];
        b.timestamp = base + Duration::from_secs(10);
        b.touch_files = Some(Duration::from_secs(5));
    });
    let project = project_with(&service, &[&a]);

    let snapshot = service
        .request_state(project, StateRequest::refresh())
        .await
        .unwrap();

    assert_eq!(a.calls(), 2);
    assert!(snapshot.is_consistent());
    assert!(snapshot.changed_files().is_empty());
    assert_eq!(snapshot.timestamp(), Some(base + Duration::from_secs(20)));
}

#[tokio::test]
async fn test_deleted_file_forces_reload() {
    let service = service();
    let file = PathBuf::from("/virtual/app/module.conf");
    let a = Mock::new("a");
    a.configure(|b| b.files = vec![file.clone()]);
    let project = project_with(&service, &[&a]);

    let first = service
        .request_state(project, StateRequest::refresh())
        .await
        .unwrap();
    service.watcher().handle_event(&FileEvent::deleted(file.clone()));
    assert!(!first.is_consistent());

    a.configure(|b| b.timestamp = epoch() + Duration::from_secs(5));
    let second = service
        .request_state(project, StateRequest::refresh())
        .await
        .unwrap();
    assert_ne!(second.id(), first.id());
    assert_eq!(a.calls(), 2);
}

#[tokio::test]
async fn test_unsaved_edits_need_saving() {
    let service = service();
    let file = PathBuf::from("/virtual/app/build.conf");
    let a = Mock::new("a");
    a.configure(|b| b.files = vec![file.clone()]);
    let project = project_with(&service, &[&a]);

    let first = service
        .request_state(project, StateRequest::refresh())
        .await
        .unwrap();

    service.edits().set_modified(file.clone(), true);
    assert!(!first.is_consistent());
    assert!(first.edited_files().contains(&file));

    let err = service
        .request_state(project, StateRequest::refresh())
        .await
        .unwrap_err();
    match &err {
        ReloadError::OutOfSync { files, .. } => assert_eq!(files, &vec![file.clone()]),
        other => panic!("expected out of sync, got {}", other),
    }
    assert_eq!(err.state(), OperationState::OutOfSync);

    let saved = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&saved);
    let hook: SaveHook = Arc::new(move |path: &Path| -> anyhow::Result<()> {
        sink.lock().push(path.to_path_buf());
        Ok(())
    });
    service.edits().set_save_hook(hook);

    let second = service
        .request_state(project, StateRequest::refresh().save_modifications())
        .await
        .unwrap();

    assert_eq!(*saved.lock(), vec![file.clone()]);
    assert!(!service.edits().is_modified(&file));
    assert!(second.is_consistent());
    assert_eq!(second.predecessor_id(), Some(first.id()));
}

#[tokio::test]
async fn test_context_variants_are_cached_separately() {
    let service = service();
    let a = Mock::new("a");
    a.configure(|b| b.profile_variant = true);
    let project = project_with(&service, &[&a]);

    let debug = RequestContext::new().with(Profile("debug"));
    let key = service.key_for(project, &debug);
    assert!(key.to_string().ends_with("[a=debug]"));

    let variant = service
        .request_state(project, StateRequest::load().context(debug.clone()))
        .await
        .unwrap();
    let plain = service
        .request_state(project, StateRequest::load())
        .await
        .unwrap();

    assert_ne!(variant.id(), plain.id());
    assert_eq!(variant.key(), &key);
    assert!(plain.key().is_plain());
    assert_eq!(service.cache().keys_for(&project).len(), 2);
    assert_eq!(a.calls(), 2);

    let again = service
        .request_state(project, StateRequest::load().context(debug))
        .await
        .unwrap();
    assert_eq!(again.id(), variant.id());
}

#[tokio::test(start_paused = true)]
async fn test_events_are_postponed_and_coalesced_during_reload() {
    let service = service();
    let a = Mock::new("a");
    let project = project_with(&service, &[&a]);

    let first = service
        .request_state(project, StateRequest::load())
        .await
        .unwrap();
    let (events, _subscription) = record_events(&first);

    a.configure(|b| b.delay = Some(Duration::from_millis(100)));
    let reload = service.request_state(project, StateRequest::reload());
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(service.is_busy(&project));

    first.mark_inconsistent([PathBuf::from("/virtual/a")]);
    first.mark_edited(Path::new("/virtual/b"));
    service.flush().await;
    assert!(events.lock().is_empty(), "events wait for the reload to finish");

    let second = reload.await.unwrap();
    assert_ne!(second.id(), first.id());

    service.flush().await;
    assert_eq!(
        events.lock().as_slice(),
        &[SnapshotEvent::Invalidated { snapshot: first.id() }]
    );
}

#[tokio::test(start_paused = true)]
async fn test_idle_state_is_evicted() {
    let mut config = test_config();
    config.reload.state_timeout_ms = 1_000;
    let service = service_with(config);

    let file = PathBuf::from("/virtual/app/build.conf");
    let a = Mock::new("a");
    a.configure(|b| b.files = vec![file.clone()]);
    let project = project_with(&service, &[&a]);

    let snapshot = service
        .request_state(project, StateRequest::load())
        .await
        .unwrap();
    let id = snapshot.id();
    drop(snapshot);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(service.cache().len(), 1, "still within the hold window");

    tokio::time::sleep(Duration::from_secs(3)).await;
    service.flush().await;

    assert!(service.cache().is_empty());
    assert!(!service.watcher().is_watching(&file));
    assert_eq!(a.released(), 1);

    let placeholder = service.get_current_state(project);
    assert!(placeholder.is_synthetic());
    assert_ne!(placeholder.id(), id);
}

#[tokio::test(start_paused = true)]
async fn test_held_state_survives_eviction() {
    let mut config = test_config();
    config.reload.state_timeout_ms = 1_000;
    let service = service_with(config);

    let a = Mock::new("a");
    let project = project_with(&service, &[&a]);
    let snapshot = service
        .request_state(project, StateRequest::load())
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(service.cache().len(), 1);
    assert_eq!(service.get_current_state(project).id(), snapshot.id());
    assert_eq!(snapshot.quality(), Quality::Loaded);
    assert_eq!(a.released(), 0);
}
