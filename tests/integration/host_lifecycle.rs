//! Integration tests for host startup and shutdown
//!
//! Tests cover:
//! - Startup work order (location, modules, profiles)
//! - Single winner among concurrent starts
//! - Factory failure surfacing as a start fault
//! - Idempotent stop and submissions after stop
//! - Pending work canceled by stop

use crate::integration::test_utils::{poll_options, FakeFactory, Harness, WAIT};
use psic::error::HostError;
use psic::host::{ExecutionOptions, HostStartOptions, TaskOutcome};
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_startup_items_run_before_start_completes() {
    let options = HostStartOptions {
        initial_working_directory: Some(PathBuf::from("/work")),
        module_paths: vec![PathBuf::from("a.psm1"), PathBuf::from("b.psm1")],
        profile_paths: vec![PathBuf::from("profile.ps1")],
        ..poll_options()
    };
    let harness = Harness::start(FakeFactory::echo(), options).await;

    assert_eq!(
        harness.factory.commands(),
        vec![
            "location:/work".to_string(),
            "import:a.psm1".to_string(),
            "import:b.psm1".to_string(),
            ". 'profile.ps1'".to_string(),
        ]
    );
    assert!(harness.host.is_started());
    assert_eq!(harness.host.frame_depth(), 1);
    harness.shutdown().await;
}

#[tokio::test]
async fn test_failed_startup_item_is_reported_not_fatal() {
    let options = HostStartOptions {
        profile_paths: vec![PathBuf::from("broken.ps1")],
        ..poll_options()
    };
    let factory = FakeFactory::new(crate::integration::test_utils::handler(
        |_engine, _callbacks, command, _token| match &command.kind {
            psic::engine::CommandKind::File(_) => Err(psic::error::EngineError::Runtime(
                "profile exploded".to_string(),
            )),
            _ => crate::integration::test_utils::default_response(command),
        },
    ));
    let harness = Harness::start(factory, options).await;

    let warnings = harness.surface.warnings();
    assert_eq!(warnings.len(), 1);
    assert!(warnings[0].starts_with("Run profile broken.ps1 failed"));
    assert!(warnings[0].contains("profile exploded"));
    assert!(!harness.host.is_stopped());
    harness.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_try_start_has_one_winner() {
    let harness = Harness::build(FakeFactory::echo());
    let other = harness.host.clone();
    let cancel = CancellationToken::new();

    let (first, second) = tokio::join!(
        harness.host.try_start(poll_options(), &cancel),
        other.try_start(poll_options(), &cancel),
    );

    let mut results = vec![first.unwrap(), second.unwrap()];
    results.sort();
    assert_eq!(results, vec![false, true]);
    assert_eq!(harness.factory.created(), 1);

    // A late caller also sees the host as already started
    assert!(!other.try_start(poll_options(), &cancel).await.unwrap());
    harness.shutdown().await;
}

#[tokio::test]
async fn test_factory_failure_faults_start() {
    let harness = Harness::build(FakeFactory::failing());
    let err = harness
        .host
        .try_start(poll_options(), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, HostError::Faulted(ref msg) if msg.contains("no engine available")));
    assert!(harness.host.is_stopped());
    assert!(harness.host.fault().is_some());
    assert!(matches!(harness.host.stop().await, Err(HostError::Faulted(_))));
}

#[tokio::test]
async fn test_stop_before_start_prevents_start() {
    let harness = Harness::build(FakeFactory::echo());
    harness.host.stop().await.unwrap();

    let err = harness
        .host
        .try_start(poll_options(), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, HostError::Stopped));
    assert_eq!(harness.factory.created(), 0);
}

#[tokio::test]
async fn test_stop_is_idempotent_and_refuses_new_work() {
    let harness = Harness::start(FakeFactory::echo(), poll_options()).await;

    harness.host.stop().await.unwrap();
    harness.host.stop().await.unwrap();
    assert!(harness.host.is_stopped());
    assert!(harness.host.fault().is_none());

    let err = harness
        .host
        .execute_delegate("late", ExecutionOptions::default(), |_ctx, _token| Ok(()))
        .await
        .unwrap_err();
    assert!(matches!(err, HostError::ShuttingDown));
}

#[tokio::test]
async fn test_stop_cancels_running_and_pending_work() {
    let harness = Harness::start(FakeFactory::echo(), poll_options()).await;
    let (started_tx, started_rx) = std::sync::mpsc::channel();

    let running = harness
        .host
        .submit("wait for stop", ExecutionOptions::default(), None, move |_ctx, token| {
            started_tx.send(()).unwrap();
            if token.wait_timeout(WAIT) {
                Err(HostError::Canceled)
            } else {
                Ok(())
            }
        })
        .unwrap();
    started_rx.recv_timeout(WAIT).unwrap();

    let pending = harness
        .host
        .submit("never runs", ExecutionOptions::default(), None, |_ctx, _token| Ok(()))
        .unwrap();

    harness.host.stop().await.unwrap();

    assert!(running.await.is_canceled());
    assert!(matches!(pending.await, TaskOutcome::Canceled));
    let stats = harness.host.stats();
    assert_eq!(stats.canceled, 2);
    assert_eq!(stats.pending, 0);
}

#[tokio::test]
async fn test_canceled_start_wait_returns_canceled() {
    let harness = Harness::build(FakeFactory::echo());
    let blocker = harness.host.clone();
    let cancel = CancellationToken::new();
    cancel.cancel();

    // The winner still starts the thread; only its wait is abandoned
    let result = blocker.try_start(poll_options(), &cancel).await;
    assert!(matches!(result, Ok(true) | Err(HostError::Canceled)));

    tokio::time::timeout(Duration::from_secs(5), async {
        while !harness.host.is_started() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    harness.shutdown().await;
}
