#![cfg(unix)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{FakeResolver, ShellTool, eventually, harness};
use hlsd::launcher::{FixedStrategy, PipelineLauncher, StopReport};
use hlsd::progress::PollerSettings;
use hlsd::session::{ProcessState, SessionRegistry};
use hlsd::{Admission, ArtifactStore, Error, LifecyclePhase, PipelineStrategy, SessionEvent, StopReason};
use tempfile::TempDir;
use tokio::sync::broadcast;

const LOCATOR_1: &str = "magnet:?xt=urn:btih:1111";
const LOCATOR_2: &str = "magnet:?xt=urn:btih:2222";
const LOCATOR_3: &str = "magnet:?xt=urn:btih:3333";

#[tokio::test]
async fn test_start_runs_pipeline() {
    let temp = TempDir::new().unwrap();
    let h = harness(temp.path(), 4);

    let admission = h.orchestrator.start_session("a", LOCATOR_1, 0, Some(1)).await.unwrap();
    assert_eq!(admission, Admission::Admitted);

    let session = h.orchestrator.session("a").unwrap();
    assert_eq!(session.phase, LifecyclePhase::Running);
    assert!(session.running);
    assert!(matches!(session.process, ProcessState::Alive { .. }));
    assert!(session.has_poller);
    assert_eq!(session.context.subtitle_index, Some(1));
    assert!(h.orchestrator.artifacts().session_dir("a").is_dir());

    let report = h.orchestrator.is_active("a");
    assert!(report.active);
    assert!(report.is_remote_content);

    h.orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_cap_rejects_third_session() {
    let temp = TempDir::new().unwrap();
    let h = harness(temp.path(), 2);

    h.orchestrator.start_session("a", LOCATOR_1, 0, None).await.unwrap();
    h.orchestrator.start_session("b", LOCATOR_2, 0, None).await.unwrap();
    let err = h.orchestrator.start_session("c", LOCATOR_3, 0, None).await.unwrap_err();

    assert!(matches!(err, Error::CapacityExceeded { running: 2, cap: 2 }));
    assert!(err.is_retryable());
    assert!(h.orchestrator.session("c").is_none());
    assert_eq!(h.orchestrator.registry().running_count(), 2);
    assert!(h.tool.requests.lock().iter().all(|r| r.session_id != "c"));

    // Freeing a slot lets the rejected content in.
    h.orchestrator.stop_session("a", true).await;
    let admission = h.orchestrator.start_session("c", LOCATOR_3, 0, None).await.unwrap();
    assert_eq!(admission, Admission::Admitted);
    assert_eq!(h.orchestrator.session("c").unwrap().phase, LifecyclePhase::Running);
    assert_eq!(h.orchestrator.registry().running_count(), 2);

    h.orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_admissions_respect_cap() {
    let temp = TempDir::new().unwrap();
    let h = harness(temp.path(), 2);

    let ids: Vec<String> = (0..6).map(|i| format!("s{i}")).collect();
    let locators: Vec<String> = (0..6).map(|i| format!("magnet:?xt=urn:btih:{i}")).collect();
    let results = futures::future::join_all(
        ids.iter()
            .zip(locators.iter())
            .map(|(id, locator)| h.orchestrator.start_session(id, locator, 0, None)),
    )
    .await;

    let admitted = results.iter().filter(|r| r.is_ok()).count();
    let rejected = results
        .iter()
        .filter(|r| matches!(r, Err(Error::CapacityExceeded { .. })))
        .count();
    assert_eq!(admitted, 2);
    assert_eq!(rejected, 4);
    assert_eq!(h.orchestrator.registry().running_count(), 2);

    h.orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_same_content_preempts_previous_session() {
    let temp = TempDir::new().unwrap();
    let h = harness(temp.path(), 4);

    h.orchestrator.start_session("a", LOCATOR_1, 0, None).await.unwrap();
    let dir_a = h.orchestrator.artifacts().session_dir("a");
    assert!(dir_a.is_dir());

    let admission = h.orchestrator.start_session("b", LOCATOR_1, 0, None).await.unwrap();

    assert_eq!(
        admission,
        Admission::Preempted {
            evicted: vec!["a".to_string()]
        }
    );
    assert!(h.orchestrator.session("a").is_none());
    assert!(!dir_a.exists());
    assert_eq!(h.orchestrator.session("b").unwrap().phase, LifecyclePhase::Running);
    assert_eq!(h.orchestrator.registry().running_count(), 1);

    h.orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_starts_on_one_locator_leave_one_holder() {
    let temp = TempDir::new().unwrap();
    let h = harness(temp.path(), 4);

    h.orchestrator.start_session("old", LOCATOR_1, 0, None).await.unwrap();
    let (x, y) = tokio::join!(
        h.orchestrator.start_session("x", LOCATOR_1, 0, None),
        h.orchestrator.start_session("y", LOCATOR_1, 0, None),
    );

    let holders: Vec<String> = h
        .orchestrator
        .registry()
        .snapshot()
        .into_iter()
        .filter(|(_, s)| s.context.locator == LOCATOR_1)
        .map(|(id, _)| id)
        .collect();
    assert_eq!(holders.len(), 1, "x={x:?} y={y:?} holders={holders:?}");
    assert!(h.orchestrator.session("old").is_none());

    let winner = if holders[0] == "x" { &x } else { &y };
    assert!(winner.is_ok());
    assert_eq!(h.orchestrator.session(&holders[0]).unwrap().phase, LifecyclePhase::Running);
    assert_eq!(h.orchestrator.registry().running_count(), 1);

    h.orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_preempting_missing_session_is_noop() {
    let temp = TempDir::new().unwrap();
    let registry = Arc::new(SessionRegistry::new());
    let (events, mut rx) = broadcast::channel(16);
    let launcher = PipelineLauncher::new(
        registry.clone(),
        Arc::new(FakeResolver::default()),
        Arc::new(ShellTool::sleeping()),
        Arc::new(FixedStrategy(PipelineStrategy::Remux)),
        ArtifactStore::new(temp.path()),
        events,
        PollerSettings::default(),
        Duration::from_secs(1),
    );

    let report = launcher.stop("gone", StopReason::Preempted, true).await;

    assert_eq!(
        report,
        StopReport {
            found: false,
            terminated: None
        }
    );
    assert!(rx.try_recv().is_err());
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_start_with_same_id_replaces_session() {
    let temp = TempDir::new().unwrap();
    let h = harness(temp.path(), 1);

    h.orchestrator.start_session("a", LOCATOR_1, 0, None).await.unwrap();
    let first = h.orchestrator.session("a").unwrap().generation;

    // The cap is full, but the old record's slot is released first.
    h.orchestrator.start_session("a", LOCATOR_2, 3, None).await.unwrap();
    let session = h.orchestrator.session("a").unwrap();

    assert!(session.generation > first);
    assert_eq!(session.context.locator, LOCATOR_2);
    assert_eq!(session.context.index, 3);
    assert_eq!(h.orchestrator.registry().len(), 1);

    h.orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let temp = TempDir::new().unwrap();
    let h = harness(temp.path(), 4);

    h.orchestrator.stop_session("unknown", true).await;
    h.orchestrator.stop_session("unknown", false).await;

    h.orchestrator.start_session("a", LOCATOR_1, 0, None).await.unwrap();
    h.orchestrator.stop_session("a", true).await;
    h.orchestrator.stop_session("a", true).await;

    assert!(h.orchestrator.session("a").is_none());
    assert!(!h.orchestrator.artifacts().session_dir("a").exists());
}

#[tokio::test]
async fn test_soft_stop_keeps_record_and_artifacts() {
    let temp = TempDir::new().unwrap();
    let h = harness(temp.path(), 4);

    h.orchestrator.start_session("a", LOCATOR_1, 0, None).await.unwrap();
    h.orchestrator.stop_session("a", false).await;

    let session = h.orchestrator.session("a").unwrap();
    assert_eq!(session.phase, LifecyclePhase::Terminated);
    assert!(!session.running);
    assert_eq!(session.process, ProcessState::None);
    assert!(!session.has_poller);
    assert!(h.orchestrator.artifacts().session_dir("a").is_dir());

    let report = h.orchestrator.is_active("a");
    assert!(!report.active);
    assert!(report.has_context);
    assert_eq!(report.context.unwrap().locator, LOCATOR_1);
}

#[tokio::test]
async fn test_soft_stop_twice_keeps_terminated_state() {
    let temp = TempDir::new().unwrap();
    let h = harness(temp.path(), 4);

    h.orchestrator.start_session("a", LOCATOR_1, 0, None).await.unwrap();
    h.orchestrator.stop_session("a", false).await;
    let first = h.orchestrator.session("a").unwrap();
    h.orchestrator.stop_session("a", false).await;
    let second = h.orchestrator.session("a").unwrap();

    for session in [&first, &second] {
        assert_eq!(session.phase, LifecyclePhase::Terminated);
        assert!(!session.running);
        assert_eq!(session.process, ProcessState::None);
        assert!(!session.has_poller);
    }
    // Already terminated: no new transition.
    assert_eq!(second.last_transition, first.last_transition);
    assert!(h.orchestrator.artifacts().session_dir("a").is_dir());
}

#[tokio::test]
async fn test_operation_locks_are_released() {
    let temp = TempDir::new().unwrap();
    let h = harness(temp.path(), 1);

    h.orchestrator.start_session("a", LOCATOR_1, 0, None).await.unwrap();
    assert!(h.orchestrator.locks().is_empty());

    for i in 0..5 {
        let id = format!("retry{i}");
        let err = h.orchestrator.start_session(&id, LOCATOR_2, 0, None).await.unwrap_err();
        assert!(matches!(err, Error::CapacityExceeded { .. }));
    }
    assert!(h.orchestrator.locks().is_empty());

    // Preemption evicts "a" without leaving its entry behind.
    h.orchestrator.start_session("b", LOCATOR_1, 0, None).await.unwrap();
    assert!(h.orchestrator.locks().is_empty());

    h.tool.set_fail(true);
    h.orchestrator.start_session("b", LOCATOR_2, 0, None).await.unwrap_err();
    assert!(h.orchestrator.locks().is_empty());

    h.orchestrator.restart_session("b").await.unwrap_err();
    h.orchestrator.shutdown().await;
    assert!(h.orchestrator.locks().is_empty());
}

#[tokio::test]
async fn test_launch_failure_terminates_and_frees_slot() {
    let temp = TempDir::new().unwrap();
    let h = harness(temp.path(), 1);
    h.tool.set_fail(true);

    let err = h.orchestrator.start_session("a", LOCATOR_1, 0, None).await.unwrap_err();
    assert!(matches!(err, Error::LaunchFailure { .. }));

    let session = h.orchestrator.session("a").unwrap();
    assert_eq!(session.phase, LifecyclePhase::Terminated);
    assert!(!session.running);
    assert!(session.status_message.starts_with("Error:"));
    assert!(!h.orchestrator.artifacts().session_dir("a").exists());

    h.tool.set_fail(false);
    h.orchestrator.start_session("b", LOCATOR_2, 0, None).await.unwrap();
    h.orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_heartbeat() {
    let temp = TempDir::new().unwrap();
    let h = harness(temp.path(), 4);

    assert!(matches!(
        h.orchestrator.heartbeat("missing"),
        Err(Error::InvalidSession { .. })
    ));

    h.orchestrator.start_session("a", LOCATOR_1, 0, None).await.unwrap();
    let before = h.orchestrator.session("a").unwrap().last_client_seen;
    tokio::time::sleep(Duration::from_millis(5)).await;
    h.orchestrator.heartbeat("a").unwrap();
    assert!(h.orchestrator.session("a").unwrap().last_client_seen > before);

    h.orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_invalid_requests() {
    let temp = TempDir::new().unwrap();
    let h = harness(temp.path(), 4);

    for id in ["", "../escape", "a/b"] {
        let err = h.orchestrator.start_session(id, LOCATOR_1, 0, None).await.unwrap_err();
        assert!(matches!(err, Error::InvalidSession { .. }), "{id:?}");
    }
    let err = h.orchestrator.start_session("a", "  ", 0, None).await.unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
    assert!(h.orchestrator.registry().is_empty());
}

#[tokio::test]
async fn test_progress_is_polled() {
    let temp = TempDir::new().unwrap();
    let h = harness(temp.path(), 4);
    assert!(h.orchestrator.progress("a").is_empty());

    h.resolver.set_bytes_completed(42_000);
    h.orchestrator.start_session("a", LOCATOR_1, 0, None).await.unwrap();

    let polled = eventually(Duration::from_secs(2), || {
        h.orchestrator.progress("a").bytes_completed == 42_000
    })
    .await;
    assert!(polled);

    h.orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_events_are_broadcast() {
    let temp = TempDir::new().unwrap();
    let h = harness(temp.path(), 4);
    let mut events = h.orchestrator.subscribe();

    h.orchestrator.start_session("a", LOCATOR_1, 0, None).await.unwrap();
    h.orchestrator.stop_session("a", true).await;

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    assert!(matches!(seen.first(), Some(SessionEvent::Admitted { session_id, .. }) if session_id == "a"));
    assert!(seen.iter().any(|e| matches!(e, SessionEvent::Running { .. })));
    assert!(seen.iter().any(|e| matches!(e, SessionEvent::Stopped { cleanup: true, .. })));
}

#[tokio::test]
async fn test_shutdown_stops_everything() {
    let temp = TempDir::new().unwrap();
    let h = harness(temp.path(), 4);
    h.orchestrator.spawn_reaper();

    h.orchestrator.start_session("a", LOCATOR_1, 0, None).await.unwrap();
    h.orchestrator.start_session("b", LOCATOR_2, 0, None).await.unwrap();
    h.orchestrator.shutdown().await;

    assert!(h.orchestrator.registry().is_empty());
    assert!(!h.orchestrator.artifacts().session_dir("a").exists());
    assert!(!h.orchestrator.artifacts().session_dir("b").exists());
}

#[tokio::test]
async fn test_list_files_delegates_to_resolver() {
    let temp = TempDir::new().unwrap();
    let h = harness(temp.path(), 4);
    h.resolver.files.lock().push(hlsd::ContentFile {
        path: "Film/film.mkv".to_string(),
        size: 1024,
    });

    let files = h.orchestrator.list_files(LOCATOR_1).await.unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].path, "Film/film.mkv");
    assert!(h.orchestrator.list_files("").await.is_err());
}
