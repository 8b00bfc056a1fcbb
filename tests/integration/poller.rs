//! Poller integration tests.

use std::time::Duration;

use herd::lifecycle::EventKind;
use herd::Poller;
use tokio_util::sync::CancellationToken;

use crate::fixtures::{assistant_completed, assistant_streaming, drain, Harness, WorkerReply};

/// Test: Poller over two workers
/// Given one worker answering HTTP 500 and one finished worker
/// When polled once
/// Then exactly one errored and one finished event are emitted
#[tokio::test]
async fn test_poll_errored_and_finished() {
    let h = Harness::new();
    h.register("T-1", 4201);
    h.register("T-2", 4202);
    h.worker.reply(4201, WorkerReply::HttpStatus(500));
    h.worker.reply(4202, WorkerReply::Messages(vec![assistant_completed("done")]));
    let mut rx = h.orchestrator.events().subscribe();
    let poller = Poller::new(h.orchestrator.clone());

    let emitted = poller.poll_once().await;

    assert_eq!(emitted.len(), 2);
    let mut seen: Vec<(String, EventKind)> = drain(&mut rx)
        .into_iter()
        .map(|e| (e.task_id, e.kind))
        .collect();
    seen.sort_by(|a, b| a.0.cmp(&b.0));
    assert_eq!(
        seen,
        vec![
            ("T-1".to_string(), EventKind::Errored),
            ("T-2".to_string(), EventKind::Finished),
        ]
    );
    // The poller never removes entries.
    assert_eq!(h.orchestrator.registry().size(), 2);
}

#[tokio::test]
async fn test_poll_emits_only_on_change() {
    let h = Harness::new();
    h.register("T-1", 4201);
    h.worker.reply(4201, WorkerReply::Messages(vec![assistant_streaming("working")]));
    let poller = Poller::new(h.orchestrator.clone());

    assert!(poller.poll_once().await.is_empty());

    h.worker.reply(4201, WorkerReply::Messages(vec![assistant_completed("done")]));
    let events = poller.poll_once().await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, EventKind::Finished);

    assert!(poller.poll_once().await.is_empty());

    h.worker.reply(4201, WorkerReply::HttpStatus(500));
    assert_eq!(poller.poll_once().await[0].kind, EventKind::Errored);
    h.worker.reply(4201, WorkerReply::HttpStatus(502));
    assert!(poller.poll_once().await.is_empty());
}

#[tokio::test]
async fn test_poll_forgets_unregistered_tasks() {
    let h = Harness::new();
    h.register("T-1", 4201);
    h.worker.reply(4201, WorkerReply::Messages(vec![assistant_completed("done")]));
    let poller = Poller::new(h.orchestrator.clone());
    assert_eq!(poller.poll_once().await.len(), 1);

    h.orchestrator.registry().delete("T-1");
    assert!(poller.poll_once().await.is_empty());

    h.register("T-1", 4201);
    assert_eq!(poller.poll_once().await.len(), 1);
}

/// Test: A hung worker does not stall the others
#[tokio::test]
async fn test_poll_isolates_hung_probe() {
    let h = Harness::new();
    h.register("T-1", 4201);
    h.register("T-2", 4202);
    h.worker.reply(4201, WorkerReply::Hang);
    h.worker.reply(4202, WorkerReply::Messages(vec![assistant_completed("done")]));
    let poller = Poller::new(h.orchestrator.clone());

    let mut events = poller.poll_once().await;
    events.sort_by(|a, b| a.task_id.cmp(&b.task_id));

    assert_eq!(events.len(), 2);
    assert_eq!(events[0].kind, EventKind::Errored);
    assert!(events[0].error_detail.as_deref().unwrap().contains("timed out"));
    assert_eq!(events[1].kind, EventKind::Finished);
}

#[tokio::test]
async fn test_run_stops_on_cancel() {
    let h = Harness::new();
    h.register("T-1", 4201);
    h.worker.reply(4201, WorkerReply::Messages(vec![assistant_completed("done")]));
    let mut rx = h.orchestrator.events().subscribe();
    let poller = Poller::new(h.orchestrator.clone());
    let cancel = CancellationToken::new();

    let stop = cancel.clone();
    let run = tokio::spawn(async move {
        poller.run(Duration::from_millis(10), stop).await;
    });

    let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("poller never emitted")
        .unwrap();
    assert_eq!(event.kind, EventKind::Finished);

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(2), run)
        .await
        .expect("poller did not stop")
        .unwrap();
}
