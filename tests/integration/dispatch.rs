//! Dispatch pipeline integration tests.

use std::sync::atomic::Ordering;

use herd::lifecycle::EventKind;
use herd::metadata::DispatchMetadata;
use herd::orchestration::DispatchOutcome;
use herd::registry::NO_WORKSPACE_LABEL;
use herd::DispatchRequest;

use crate::fixtures::{drain, Harness};

/// Test: Dispatch scenario for T-1
/// Given a task T-1 with a stale log file
/// When dispatched with "fix bug" and a workspace
/// Then the worktree, session name, log and label follow from the task id
#[tokio::test]
async fn test_dispatch_t1_scenario() {
    let h = Harness::new();
    let log_path = h.config.log_path("T-1");
    std::fs::create_dir_all(log_path.parent().unwrap()).unwrap();
    std::fs::write(&log_path, "stale output from a previous run\n").unwrap();
    h.tracker.add_issue("T-1", "Crash on start", "Segfault in init.", "open");

    let outcome = h.orchestrator.dispatch(DispatchRequest::new("T-1", "fix bug")).await;

    let DispatchOutcome::Dispatched { entry } = outcome else {
        panic!("expected dispatched, got {:?}", outcome);
    };
    assert_eq!(entry.workspace_path, h.parent().join("T-1"));
    assert_eq!(entry.supervisor_session, "T_1");
    assert_eq!(entry.branch_label, "T-1");
    assert_eq!(entry.control_port, 4100);
    assert_eq!(entry.session_id, "ses_4100");
    assert!(log_path.ends_with("agent-T-1.log"));

    let log = std::fs::read_to_string(&log_path).unwrap();
    assert!(!log.contains("stale output"), "log should be truncated: {}", log);

    let specs = h.supervisor.specs.lock().unwrap().clone();
    assert_eq!(specs.len(), 1);
    assert_eq!(specs[0].name, "T_1");
    assert_eq!(specs[0].cwd, h.parent().join("T-1"));
    assert_eq!(specs[0].output_log.as_deref(), Some(log_path.as_path()));

    assert_eq!(h.orchestrator.registry().size(), 1);
    assert_eq!(h.orchestrator.registry().get("T-1"), Some(entry));
}

/// Test: Steps run in order and the tracker ends up holding the metadata
#[tokio::test]
async fn test_dispatch_call_order_and_metadata() {
    let h = Harness::new();
    h.tracker.add_issue("T-1", "Crash on start", "Segfault in init.", "open");

    let outcome = h.orchestrator.dispatch(DispatchRequest::new("T-1", "fix bug")).await;
    assert!(outcome.is_success());

    assert_eq!(
        h.calls.all(),
        vec![
            "tracker.show T-1",
            "tracker.update T-1 status=in_progress",
            "workspace.create T-1",
            "tmux.new T_1",
            "worker.session 4100",
            "worker.prompt 4100",
            "tracker.update T-1 description",
        ]
    );

    let issue = h.tracker.issue("T-1").unwrap();
    assert_eq!(issue.status, "in_progress");
    assert!(issue.description.starts_with("Segfault in init."));
    assert_eq!(
        DispatchMetadata::parse(&issue.description),
        Some(DispatchMetadata::new(4100, "T_1", "ses_4100"))
    );

    let prompts = h.worker.prompts.lock().unwrap().clone();
    assert_eq!(prompts.len(), 1);
    assert_eq!(
        prompts[0].2,
        "Task T-1: Crash on start\n\nSegfault in init.\n\nfix bug"
    );
}

/// Test: Lifecycle events of a successful dispatch
#[tokio::test]
async fn test_dispatch_emits_claimed_then_running() {
    let h = Harness::new();
    let mut rx = h.orchestrator.events().subscribe();

    h.orchestrator.dispatch(DispatchRequest::new("T-1", "fix bug")).await;

    let events = drain(&mut rx);
    let kinds: Vec<EventKind> = events.iter().map(|e| e.kind).collect();
    assert_eq!(kinds, vec![EventKind::Claimed, EventKind::Running]);
    assert_eq!(events[1].branch_label.as_deref(), Some("T-1"));
    assert_eq!(events[1].control_port, Some(4100));
}

/// Test: Missing task context degrades to the plain prompt
#[tokio::test]
async fn test_dispatch_without_tracker_context() {
    let h = Harness::new();

    let outcome = h.orchestrator.dispatch(DispatchRequest::new("T-9", "fix bug")).await;

    assert!(outcome.is_success());
    assert_eq!(h.worker.prompts.lock().unwrap()[0].2, "fix bug");
}

/// Test: Duplicate dispatch
/// Given T-1 already dispatched
/// When dispatched again
/// Then the first entry is returned and no external call is made
#[tokio::test]
async fn test_duplicate_dispatch_has_no_side_effects() {
    let h = Harness::new();
    let first = h.orchestrator.dispatch(DispatchRequest::new("T-1", "fix bug")).await;
    let first_entry = first.entry().cloned().unwrap();
    let calls_before = h.calls.len();

    let second = h
        .orchestrator
        .dispatch(DispatchRequest::new("T-1", "something else").branch("other"))
        .await;

    assert_eq!(second, DispatchOutcome::Duplicate { entry: first_entry });
    assert_eq!(h.calls.len(), calls_before);
    assert_eq!(h.orchestrator.registry().size(), 1);
}

/// Test: Skip-workspace dispatch runs in the root with the sentinel label
#[tokio::test]
async fn test_dispatch_without_workspace() {
    let h = Harness::new();

    let outcome = h
        .orchestrator
        .dispatch(DispatchRequest::new("T-2", "fix bug").skip_workspace())
        .await;

    let entry = outcome.entry().unwrap();
    assert_eq!(entry.branch_label, NO_WORKSPACE_LABEL);
    assert_eq!(entry.workspace_path, h.root);
    assert!(!h.calls.contains("workspace.create"));
}

/// Test: Branch override and model selection reach the collaborators
#[tokio::test]
async fn test_dispatch_branch_override_and_model() {
    let h = Harness::new();

    let outcome = h
        .orchestrator
        .dispatch(
            DispatchRequest::new("T-3", "fix bug")
                .branch("fix/crash")
                .model("anthropic", "claude-sonnet"),
        )
        .await;

    let entry = outcome.entry().unwrap();
    assert_eq!(entry.branch_label, "fix/crash");
    assert_eq!(entry.workspace_path, h.parent().join("fix-crash"));
    let model = h.worker.prompts.lock().unwrap()[0].3.clone().unwrap();
    assert_eq!(model.provider_id, "anthropic");
    assert_eq!(model.model_id, "claude-sonnet");
}

/// Test: Failed dispatch
/// Given a worker that never announces its port
/// When dispatched
/// Then the outcome is failed with a timeout, no entry exists and errored is emitted
#[tokio::test]
async fn test_port_discovery_timeout_leaves_no_entry() {
    let h = Harness::new();
    h.supervisor.announce.store(false, Ordering::SeqCst);
    let mut rx = h.orchestrator.events().subscribe();

    let outcome = h.orchestrator.dispatch(DispatchRequest::new("T-1", "fix bug")).await;

    let DispatchOutcome::Failed { error, .. } = outcome else {
        panic!("expected failure, got {:?}", outcome);
    };
    assert!(error.contains("timed out"), "unexpected error: {}", error);
    assert_eq!(h.orchestrator.registry().size(), 0);
    assert!(!h.calls.contains("worker.session"));

    let events = drain(&mut rx);
    let last = events.last().unwrap();
    assert_eq!(last.kind, EventKind::Errored);
    assert_eq!(last.error_detail.as_deref(), Some(error.as_str()));
}

#[tokio::test]
async fn test_failure_at_each_core_step_leaves_no_entry() {
    type Breaker = fn(&Harness);
    let breakers: [(&str, Breaker); 6] = [
        ("claim", |h| h.tracker.fail_updates.store(true, Ordering::SeqCst)),
        ("workspace", |h| h.workspaces.fail_create.store(true, Ordering::SeqCst)),
        ("tmux", |h| h.supervisor.fail_create.store(true, Ordering::SeqCst)),
        ("session", |h| h.worker.fail_create.store(true, Ordering::SeqCst)),
        ("prompt", |h| h.worker.fail_prompt.store(true, Ordering::SeqCst)),
        ("metadata", |h| {
            h.tracker.fail_description_updates.store(true, Ordering::SeqCst)
        }),
    ];

    for (step, breaker) in breakers {
        let h = Harness::new();
        breaker(&h);

        let outcome = h.orchestrator.dispatch(DispatchRequest::new("T-1", "fix bug")).await;

        assert!(
            matches!(outcome, DispatchOutcome::Failed { .. }),
            "{} failure should fail dispatch, got {:?}",
            step,
            outcome
        );
        assert_eq!(h.orchestrator.registry().size(), 0, "{} left an entry", step);
    }
}

#[tokio::test]
async fn test_tmux_failure_stops_before_worker_calls() {
    let h = Harness::new();
    h.supervisor.fail_create.store(true, Ordering::SeqCst);

    let outcome = h.orchestrator.dispatch(DispatchRequest::new("T-1", "fix bug")).await;

    let DispatchOutcome::Failed { error, .. } = outcome else {
        panic!("expected failure, got {:?}", outcome);
    };
    assert!(error.contains("duplicate session"), "unexpected error: {}", error);
    assert!(!h.calls.contains("worker.session"));
}

/// Test: Metadata write failure
/// Given a tracker that rejects description updates
/// When dispatched
/// Then the worker was prompted but no entry is registered and errored is emitted
#[tokio::test]
async fn test_metadata_write_failure_leaves_no_entry() {
    let h = Harness::new();
    h.tracker.add_issue("T-1", "Crash on start", "Segfault in init.", "open");
    h.tracker.fail_description_updates.store(true, Ordering::SeqCst);
    let mut rx = h.orchestrator.events().subscribe();

    let outcome = h.orchestrator.dispatch(DispatchRequest::new("T-1", "fix bug")).await;

    assert!(matches!(outcome, DispatchOutcome::Failed { ref error, .. } if error.contains("description rejected")));
    assert!(h.calls.contains("worker.prompt"));
    assert!(!h.orchestrator.registry().has("T-1"));
    assert_eq!(h.tracker.issue("T-1").unwrap().description, "Segfault in init.");
    assert_eq!(drain(&mut rx).last().unwrap().kind, EventKind::Errored);
}

/// Test: Tracker context unavailable at dispatch start
/// Given a task with a description whose first read times out
/// When dispatched
/// Then the description is re-read and kept alongside the metadata
#[tokio::test]
async fn test_dispatch_keeps_description_when_first_read_fails() {
    let h = Harness::new();
    h.tracker
        .add_issue("T-1", "Crash on start", "Important user-written description.", "open");
    h.tracker.failing_shows.store(1, Ordering::SeqCst);

    let outcome = h.orchestrator.dispatch(DispatchRequest::new("T-1", "fix bug")).await;

    assert!(outcome.is_success(), "{:?}", outcome);
    assert_eq!(h.worker.prompts.lock().unwrap()[0].2, "fix bug");
    let description = h.tracker.issue("T-1").unwrap().description;
    assert!(
        description.starts_with("Important user-written description."),
        "description lost: {}",
        description
    );
    assert_eq!(
        DispatchMetadata::parse(&description),
        Some(DispatchMetadata::new(4100, "T_1", "ses_4100"))
    );
}

/// Test: Tracker unreadable throughout
/// Given every read of the task fails
/// When dispatched
/// Then the dispatch fails rather than overwriting the description
#[tokio::test]
async fn test_dispatch_never_overwrites_unknown_description() {
    let h = Harness::new();
    h.tracker
        .add_issue("T-1", "Crash on start", "Important user-written description.", "open");
    h.tracker.failing_shows.store(2, Ordering::SeqCst);

    let outcome = h.orchestrator.dispatch(DispatchRequest::new("T-1", "fix bug")).await;

    assert!(!outcome.is_success());
    assert!(!h.calls.contains("tracker.update T-1 description"));
    assert_eq!(
        h.tracker.issue("T-1").unwrap().description,
        "Important user-written description."
    );
    assert_eq!(h.orchestrator.registry().size(), 0);
}

/// Test: A failed dispatch can be retried
#[tokio::test]
async fn test_retry_after_failure() {
    let h = Harness::new();
    h.worker.fail_prompt.store(true, Ordering::SeqCst);
    assert!(!h
        .orchestrator
        .dispatch(DispatchRequest::new("T-1", "fix bug"))
        .await
        .is_success());

    h.worker.fail_prompt.store(false, Ordering::SeqCst);
    let outcome = h.orchestrator.dispatch(DispatchRequest::new("T-1", "fix bug")).await;
    assert!(matches!(outcome, DispatchOutcome::Dispatched { .. }));
    assert_eq!(h.orchestrator.registry().size(), 1);
}

/// Test: Concurrent dispatches of one id create a single entry
#[tokio::test]
async fn test_concurrent_dispatch_same_id() {
    let h = Harness::new();

    let (a, b) = tokio::join!(
        h.orchestrator.dispatch(DispatchRequest::new("T-1", "fix bug")),
        h.orchestrator.dispatch(DispatchRequest::new("T-1", "fix bug")),
    );

    let dispatched = [&a, &b]
        .iter()
        .filter(|o| matches!(o, DispatchOutcome::Dispatched { .. }))
        .count();
    assert_eq!(dispatched, 1, "outcomes: {:?} / {:?}", a, b);
    assert_eq!(h.orchestrator.registry().size(), 1);
    assert_eq!(h.supervisor.specs.lock().unwrap().len(), 1);
}

/// Test: Different tasks dispatch independently
#[tokio::test]
async fn test_concurrent_dispatch_different_ids() {
    let h = Harness::new();

    let (a, b) = tokio::join!(
        h.orchestrator.dispatch(DispatchRequest::new("T-1", "one")),
        h.orchestrator.dispatch(DispatchRequest::new("T-2", "two")),
    );

    assert!(a.is_success() && b.is_success());
    assert_ne!(
        a.entry().unwrap().control_port,
        b.entry().unwrap().control_port
    );
    assert_eq!(h.orchestrator.registry().size(), 2);
}

#[tokio::test]
async fn test_empty_task_id_is_rejected() {
    let h = Harness::new();
    let outcome = h.orchestrator.dispatch(DispatchRequest::new("  ", "fix bug")).await;
    assert!(!outcome.is_success());
    assert_eq!(h.calls.len(), 0);
}
