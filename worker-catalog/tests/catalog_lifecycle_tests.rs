//! Worker catalog lifecycle tests
//!
//! Covers the start/stop contract of the catalog:
//! - one live worker per session, duplicate starts rejected
//! - failed, erroring and panicking starts leave the session workerless
//! - stop waiting for a slow start, giving up on one that never registers
//! - bounded retry of failing stops

mod mock_worker;

use mock_worker::{capture_logs, catalog_with, StartBehavior, WorkerScript};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Barrier;
use tokio::time::Instant;
use worker_catalog::{CatalogError, LogLevel, SessionDescriptor, StopOutcome, WorkerState};

#[tokio::test(start_paused = true)]
async fn test_duplicate_start_is_rejected_while_starting_and_running() {
    let (catalog, factory) = catalog_with(WorkerScript::starting_after(Duration::from_secs(2)));
    let session = SessionDescriptor::new("orders.sql");

    let handle = catalog.start(session.clone()).unwrap();
    match catalog.start(session.clone()) {
        Err(CatalogError::DuplicateSession { session_id }) => assert_eq!(session_id, session.id),
        Ok(_) => panic!("second start while starting must fail"),
    }

    handle.await.unwrap();
    assert!(catalog.lookup(&session.id).is_some());
    assert!(matches!(
        catalog.start(session.clone()),
        Err(CatalogError::DuplicateSession { .. })
    ));

    // the rejected starts found the slot taken and never reached the factory
    assert_eq!(factory.workers_for(&session.id).len(), 1);
    assert_eq!(catalog.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_starts_create_exactly_one_worker() {
    let (catalog, factory) = catalog_with(WorkerScript::default());

    for round in 0..50 {
        let session = SessionDescriptor::new(format!("race-{round}.csx"));
        let barrier = Arc::new(Barrier::new(8));
        let attempts: Vec<_> = (0..8)
            .map(|_| {
                let catalog = catalog.clone();
                let session = session.clone();
                let barrier = barrier.clone();
                tokio::spawn(async move {
                    barrier.wait().await;
                    catalog.start(session).is_ok()
                })
            })
            .collect();

        let mut accepted = 0;
        for attempt in attempts {
            if attempt.await.unwrap() {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 1, "round {round}");
        assert_eq!(factory.workers_for(&session.id).len(), 1, "round {round}");
    }
}

#[tokio::test(start_paused = true)]
async fn test_failed_starts_leave_session_without_worker() {
    for behavior in [
        StartBehavior::ReportFailure,
        StartBehavior::Error,
        StartBehavior::Panic,
    ] {
        let (catalog, factory) = catalog_with(WorkerScript::with_start(behavior));
        let session = SessionDescriptor::new("broken.csx");

        let handle = catalog.start(session.clone()).unwrap();
        handle
            .await
            .unwrap_or_else(|e| panic!("{behavior:?} escaped the start task: {e}"));

        assert!(catalog.lookup(&session.id).is_none(), "{behavior:?}");
        assert!(catalog.is_empty(), "{behavior:?}");
        assert_eq!(factory.created()[0].start_calls(), 1);

        // the session may be started again once the failed attempt is gone
        factory.set_script(WorkerScript::default());
        catalog.start(session.clone()).unwrap().await.unwrap();
        assert!(catalog.lookup(&session.id).is_some(), "{behavior:?}");
    }
}

#[tokio::test(start_paused = true)]
async fn test_start_failure_is_logged() {
    let (logs, _guard) = capture_logs();
    let (catalog, _factory) = catalog_with(WorkerScript::with_start(StartBehavior::Error));
    let session = SessionDescriptor::new("broken.csx");

    catalog.start(session.clone()).unwrap().await.unwrap();

    let errors = logs.find("Error occurred starting worker");
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].level, LogLevel::Error);
    assert_eq!(errors[0].field("session"), Some(session.id.to_string().as_str()));
}

#[tokio::test(start_paused = true)]
async fn test_stop_waits_for_slow_start() {
    let (catalog, factory) = catalog_with(WorkerScript::starting_after(Duration::from_millis(4500)));
    let session = SessionDescriptor::new("slow.csx");
    let started = Instant::now();

    catalog.start(session.clone()).unwrap();
    let outcome = catalog.stop(&session).await;

    assert_eq!(outcome, StopOutcome::Stopped { attempts: 1 });
    // found on the sixth poll, one second apart
    assert_eq!(started.elapsed(), Duration::from_secs(5));
    let worker = &factory.workers_for(&session.id)[0];
    assert_eq!(worker.stop_calls(), 1);
    assert!(catalog.lookup(&session.id).is_none());
    assert!(catalog.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_stop_gives_up_when_worker_never_registers() {
    let (logs, _guard) = capture_logs();
    let (catalog, factory) = catalog_with(WorkerScript::with_start(StartBehavior::Hang));
    let session = SessionDescriptor::new("stuck.csx");
    let started = Instant::now();

    catalog.start(session.clone()).unwrap();
    let outcome = catalog.stop(&session).await;

    assert_eq!(outcome, StopOutcome::NotFound);
    // ten polls, nine delays between them
    assert_eq!(started.elapsed(), Duration::from_secs(9));
    assert_eq!(factory.created()[0].stop_calls(), 0);

    let not_found = logs.find("No worker found to stop");
    assert_eq!(not_found.len(), 1);
    assert_eq!(not_found[0].level, LogLevel::Info);
    assert_eq!(catalog.sessions()[0].state, WorkerState::Starting);
}

#[tokio::test(start_paused = true)]
async fn test_stop_of_unknown_session_is_a_no_op() {
    let (catalog, _factory) = catalog_with(WorkerScript::default());
    let outcome = catalog.stop(&SessionDescriptor::new("never-started")).await;
    assert_eq!(outcome, StopOutcome::NotFound);
}

#[tokio::test(start_paused = true)]
async fn test_stop_retries_failing_worker_stop() {
    let (catalog, factory) = catalog_with(WorkerScript::failing_stops(2));
    let session = SessionDescriptor::new("flaky.csx");
    catalog.start(session.clone()).unwrap().await.unwrap();

    let started = Instant::now();
    let outcome = catalog.stop(&session).await;

    assert_eq!(outcome, StopOutcome::Stopped { attempts: 3 });
    assert_eq!(started.elapsed(), Duration::from_secs(2));
    assert_eq!(factory.created()[0].stop_calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_stop_retry_exhaustion_is_logged_not_raised() {
    let (logs, _guard) = capture_logs();
    let (catalog, factory) = catalog_with(WorkerScript::failing_stops(u32::MAX));
    let session = SessionDescriptor::new("immortal.csx");
    catalog.start(session.clone()).unwrap().await.unwrap();

    let outcome = catalog.stop(&session).await;

    assert_eq!(outcome, StopOutcome::Failed { attempts: 5 });
    assert_eq!(factory.created()[0].stop_calls(), 5);
    // the entry was removed before stopping, even though the stop failed
    assert!(catalog.lookup(&session.id).is_none());

    assert_eq!(logs.find("Stop attempt failed").len(), 5);
    let failures = logs.find("Error stopping worker");
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].level, LogLevel::Error);
    assert_eq!(failures[0].field("attempts"), Some("5"));
}

#[tokio::test(start_paused = true)]
async fn test_session_being_stopped_is_absent_from_snapshots() {
    let (catalog, factory) = catalog_with(WorkerScript::failing_stops(2));
    let session = SessionDescriptor::new("closing.csx");
    catalog.start(session.clone()).unwrap().await.unwrap();

    let stopping = tokio::spawn({
        let catalog = catalog.clone();
        let session = session.clone();
        async move { catalog.stop(&session).await }
    });
    tokio::time::sleep(Duration::from_millis(500)).await;

    // first stop attempt failed, the retry is pending
    assert_eq!(factory.created()[0].stop_calls(), 1);
    assert!(catalog.sessions().is_empty());
    assert!(catalog.lookup(&session.id).is_none());

    assert_eq!(
        stopping.await.unwrap(),
        StopOutcome::Stopped { attempts: 3 }
    );
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_stops_act_on_the_worker_once() {
    let (catalog, factory) = catalog_with(WorkerScript::default());
    let session = SessionDescriptor::new("shared.csx");
    catalog.start(session.clone()).unwrap().await.unwrap();

    let (first, second) = tokio::join!(catalog.stop(&session), catalog.stop(&session));

    let mut outcomes = [first, second];
    outcomes.sort_by_key(|outcome| matches!(outcome, StopOutcome::NotFound));
    assert_eq!(
        outcomes,
        [StopOutcome::Stopped { attempts: 1 }, StopOutcome::NotFound]
    );
    assert_eq!(factory.created()[0].stop_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_slow_session_does_not_block_others() {
    let (catalog, factory) = catalog_with(WorkerScript::with_start(StartBehavior::Hang));
    let stuck = SessionDescriptor::new("stuck.csx");
    catalog.start(stuck.clone()).unwrap();

    factory.set_script(WorkerScript::default());
    let healthy = SessionDescriptor::new("healthy.csx");
    catalog.start(healthy.clone()).unwrap().await.unwrap();

    assert!(catalog.lookup(&healthy.id).is_some());
    assert!(catalog.lookup(&stuck.id).is_none());
    assert_eq!(
        catalog.stop(&healthy).await,
        StopOutcome::Stopped { attempts: 1 }
    );
}

#[tokio::test(start_paused = true)]
async fn test_session_can_restart_after_stop() {
    let (catalog, factory) = catalog_with(WorkerScript::default());
    let session = SessionDescriptor::new("reopened.csx");

    catalog.start(session.clone()).unwrap().await.unwrap();
    assert_eq!(
        catalog.stop(&session).await,
        StopOutcome::Stopped { attempts: 1 }
    );
    catalog.start(session.clone()).unwrap().await.unwrap();

    assert!(catalog.lookup(&session.id).is_some());
    assert_eq!(factory.workers_for(&session.id).len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_stop_all_stops_every_session() {
    let (catalog, factory) = catalog_with(WorkerScript::default());
    let sessions: Vec<SessionDescriptor> = ["a.csx", "b.csx", "c.csx"]
        .into_iter()
        .map(SessionDescriptor::new)
        .collect();
    for session in &sessions {
        catalog.start(session.clone()).unwrap().await.unwrap();
    }

    let outcomes = catalog.stop_all().await;

    assert_eq!(outcomes.len(), 3);
    assert!(outcomes
        .iter()
        .all(|(_, outcome)| *outcome == StopOutcome::Stopped { attempts: 1 }));
    assert!(catalog.is_empty());
    assert!(factory.created().iter().all(|w| w.stop_calls() == 1));
}
