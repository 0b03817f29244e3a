//! Tests for the work modes and the daemon's pid-file handling

use std::sync::Arc;
use std::time::Duration as StdDuration;

use serde_json::json;

use super::support::{new_log, t0, Behavior, ManualClock, ScriptedFactory};
use crate::store::{ReadFilter, TaskStore};
use crate::{Defer, MemoryStore, QueueDef, Scheduler};

#[tokio::test]
async fn test_serially_works_at_most_the_requested_steps_per_queue() {
    let log = new_log();
    let store = Arc::new(MemoryStore::new());
    let scheduler = Scheduler::builder()
        .clock(ManualClock::at(t0()))
        .default_store(store.clone())
        .define_queue(QueueDef::new(
            "q",
            ScriptedFactory::new(&log, Behavior::Succeed(json!(1))),
        ))
        .build()
        .unwrap();
    for _ in 0..3 {
        scheduler.defer(None, Defer::new()).await.unwrap();
    }

    scheduler.work(&[]).unwrap().serially(2).await.unwrap();
    assert_eq!(store.read(&ReadFilter::all()).await.unwrap().len(), 1);

    // Steps beyond the backlog are not an error.
    scheduler.work(&[]).unwrap().serially(5).await.unwrap();
    assert!(store.read(&ReadFilter::all()).await.unwrap().is_empty());
    assert_eq!(log.lock().unwrap().runs, 3);
}

#[tokio::test]
async fn test_serially_visits_queues_in_declaration_order() {
    let log = new_log();
    let store = Arc::new(MemoryStore::new());
    let scheduler = Scheduler::builder()
        .clock(ManualClock::at(t0()))
        .default_store(store.clone())
        .define_queue(QueueDef::new(
            "first",
            ScriptedFactory::new(&log, Behavior::Succeed(json!(1))),
        ))
        .define_queue(QueueDef::new(
            "second",
            ScriptedFactory::new(&log, Behavior::Succeed(json!(1))),
        ))
        .build()
        .unwrap();
    scheduler.defer(Some("second"), Defer::new()).await.unwrap();
    scheduler.defer(Some("first"), Defer::new()).await.unwrap();

    scheduler.work(&[]).unwrap().serially(1).await.unwrap();

    let log = log.lock().unwrap();
    assert_eq!(log.queues, vec!["first".to_string(), "second".to_string()]);
}

#[tokio::test]
async fn test_work_can_be_restricted_to_named_queues() {
    let log = new_log();
    let store = Arc::new(MemoryStore::new());
    let scheduler = Scheduler::builder()
        .clock(ManualClock::at(t0()))
        .default_store(store.clone())
        .define_queue(QueueDef::new(
            "wanted",
            ScriptedFactory::new(&log, Behavior::Succeed(json!(1))),
        ))
        .define_queue(QueueDef::new(
            "ignored",
            ScriptedFactory::new(&log, Behavior::Succeed(json!(1))),
        ))
        .build()
        .unwrap();
    scheduler.defer(Some("wanted"), Defer::new()).await.unwrap();
    scheduler.defer(Some("ignored"), Defer::new()).await.unwrap();

    scheduler.work(&["wanted"]).unwrap().serially(1).await.unwrap();

    let remaining = store.read(&ReadFilter::all()).await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].queue, "ignored");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_threaded_workers_drain_their_queues_and_halt_on_timeout() {
    let log = new_log();
    let store = Arc::new(MemoryStore::new());
    let scheduler = Scheduler::builder()
        .clock(ManualClock::at(t0()))
        .default_store(store.clone())
        .define_queue(
            QueueDef::new(
                "fast",
                ScriptedFactory::new(&log, Behavior::Succeed(json!(1))),
            )
            .poll_period(StdDuration::from_millis(10)),
        )
        .build()
        .unwrap();
    for _ in 0..3 {
        scheduler.defer(None, Defer::new()).await.unwrap();
    }

    scheduler
        .work(&[])
        .unwrap()
        .threaded(Some(StdDuration::from_millis(400)))
        .await
        .unwrap();

    assert!(store.read(&ReadFilter::all()).await.unwrap().is_empty());
    assert_eq!(log.lock().unwrap().runs, 3);
}

#[cfg(unix)]
mod pid_files {
    use std::fs;

    use tempfile::TempDir;

    use crate::runtime::{check_pid_file, resolve_pid_path};
    use crate::SchedulingError;

    #[test]
    fn test_paths_with_the_pid_extension_are_used_as_is() {
        let resolved = resolve_pid_path(Some("/var/run/worker.pid".as_ref()));
        assert_eq!(resolved, std::path::PathBuf::from("/var/run/worker.pid"));
    }

    #[test]
    fn test_other_paths_are_treated_as_directories() {
        let temp_dir = TempDir::new().unwrap();
        let resolved = resolve_pid_path(Some(temp_dir.path()));
        assert_eq!(resolved.parent().unwrap(), temp_dir.path());
        assert_eq!(resolved.extension().unwrap(), "pid");
    }

    #[test]
    fn test_omitted_paths_resolve_under_the_working_directory() {
        let resolved = resolve_pid_path(None);
        assert!(resolved.is_absolute());
        assert_eq!(resolved.extension().unwrap(), "pid");
    }

    #[test]
    fn test_a_missing_pid_file_is_fine() {
        let temp_dir = TempDir::new().unwrap();
        check_pid_file(&temp_dir.path().join("absent.pid")).unwrap();
    }

    #[test]
    fn test_a_live_process_in_the_pid_file_blocks_startup() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("live.pid");
        fs::write(&path, format!("{}\n", std::process::id())).unwrap();

        let error = check_pid_file(&path).unwrap_err();
        assert!(matches!(
            error.downcast_ref::<SchedulingError>(),
            Some(SchedulingError::ProcessExists(_))
        ));
        assert!(path.exists(), "a live pid file must not be removed");
    }

    #[test]
    fn test_a_stale_pid_file_is_replaced() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("stale.pid");

        // A reaped child's pid is known-dead.
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let dead_pid = child.id();
        child.wait().unwrap();
        fs::write(&path, format!("{dead_pid}\n")).unwrap();

        check_pid_file(&path).unwrap();
        assert!(!path.exists(), "a stale pid file is removed");
    }

    #[test]
    fn test_an_unparseable_pid_file_counts_as_stale() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("garbled.pid");
        fs::write(&path, "not a pid\n").unwrap();

        check_pid_file(&path).unwrap();
        assert!(!path.exists());
    }
}
