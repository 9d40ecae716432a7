//! Integration tests for work item ordering and serialization
//!
//! Tests cover:
//! - Next priority ahead of Normal priority, FIFO among Next items
//! - FIFO order within Normal priority
//! - One work item at a time, always on the pipeline thread
//! - Blocking waits refused on the pipeline thread
//! - Requester cancellation, faults and panics

use crate::integration::test_utils::{poll_options, FakeFactory, Harness, WAIT};
use parking_lot::Mutex;
use psic::engine::Command;
use psic::error::{EngineError, HostError};
use psic::host::{CommandOptions, ExecutionOptions, TaskOutcome, PIPELINE_THREAD_NAME};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Occupies the pipeline thread until released
fn hold_pipeline(harness: &Harness) -> std::sync::mpsc::Sender<()> {
    let (started_tx, started_rx) = std::sync::mpsc::channel();
    let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
    harness
        .host
        .submit("gate", ExecutionOptions::default(), None, move |_ctx, _token| {
            started_tx.send(()).unwrap();
            let _ = release_rx.recv_timeout(WAIT);
            Ok(())
        })
        .unwrap();
    started_rx.recv_timeout(WAIT).unwrap();
    release_tx
}

#[tokio::test]
async fn test_next_priority_runs_before_normal() {
    let harness = Harness::start(FakeFactory::echo(), poll_options()).await;
    let order = Arc::new(Mutex::new(Vec::new()));
    let release = hold_pipeline(&harness);

    let mut handles = Vec::new();
    for (label, options) in [
        ("a", ExecutionOptions::default()),
        ("b", ExecutionOptions::default()),
        ("c", ExecutionOptions::next()),
        ("d", ExecutionOptions::next()),
    ] {
        let order = Arc::clone(&order);
        handles.push(
            harness
                .host
                .submit(label, options, None, move |_ctx, _token| {
                    order.lock().push(label);
                    Ok(())
                })
                .unwrap(),
        );
    }
    release.send(()).unwrap();
    for handle in handles {
        handle.await.into_result().unwrap();
    }

    assert_eq!(*order.lock(), vec!["c", "d", "a", "b"]);
    harness.shutdown().await;
}

#[tokio::test]
async fn test_next_items_run_in_submission_order() {
    let harness = Harness::start(FakeFactory::echo(), poll_options()).await;
    let order = Arc::new(Mutex::new(Vec::new()));
    let release = hold_pipeline(&harness);

    let mut handles = Vec::new();
    for (label, options) in [
        ("normal-1", ExecutionOptions::default()),
        ("next-1", ExecutionOptions::next()),
        ("next-2", ExecutionOptions::next()),
        ("normal-2", ExecutionOptions::default()),
        ("next-3", ExecutionOptions::next()),
    ] {
        let order = Arc::clone(&order);
        handles.push(
            harness
                .host
                .submit(label, options, None, move |_ctx, _token| {
                    order.lock().push(label);
                    Ok(())
                })
                .unwrap(),
        );
    }
    release.send(()).unwrap();
    for handle in handles {
        handle.await.into_result().unwrap();
    }

    assert_eq!(
        *order.lock(),
        vec!["next-1", "next-2", "next-3", "normal-1", "normal-2"]
    );
    harness.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_items_never_overlap_and_run_on_pipeline_thread() {
    let harness = Harness::start(FakeFactory::echo(), poll_options()).await;
    let running = Arc::new(AtomicUsize::new(0));
    let max_running = Arc::new(AtomicUsize::new(0));

    let mut producers = Vec::new();
    for producer in 0..4 {
        let host = harness.host.clone();
        let running = Arc::clone(&running);
        let max_running = Arc::clone(&max_running);
        producers.push(tokio::spawn(async move {
            for item in 0..10 {
                let running = Arc::clone(&running);
                let max_running = Arc::clone(&max_running);
                let thread_name = host
                    .execute_delegate(
                        format!("producer {} item {}", producer, item),
                        ExecutionOptions::default(),
                        move |_ctx, _token| {
                            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                            max_running.fetch_max(now, Ordering::SeqCst);
                            std::thread::sleep(std::time::Duration::from_millis(1));
                            running.fetch_sub(1, Ordering::SeqCst);
                            Ok(std::thread::current().name().map(str::to_string))
                        },
                    )
                    .await
                    .unwrap();
                assert_eq!(thread_name.as_deref(), Some(PIPELINE_THREAD_NAME));
            }
        }));
    }
    for producer in producers {
        producer.await.unwrap();
    }

    assert_eq!(max_running.load(Ordering::SeqCst), 1);
    assert_eq!(harness.host.stats().completed, 40);
    harness.shutdown().await;
}

#[tokio::test]
async fn test_blocking_wait_on_pipeline_thread_is_refused() {
    let harness = Harness::start(FakeFactory::echo(), poll_options()).await;
    let inner_host = harness.host.clone();

    let refused = harness
        .host
        .execute_delegate("outer", ExecutionOptions::default(), move |_ctx, _token| {
            let result = inner_host.execute_delegate_blocking(
                "inner",
                ExecutionOptions::default(),
                |_ctx, _token| Ok(()),
            );
            Ok(matches!(result, Err(HostError::Reentrant(_))))
        })
        .await
        .unwrap();

    assert!(refused);
    harness.shutdown().await;
}

#[tokio::test]
async fn test_blocking_wait_from_plain_thread() {
    let harness = Harness::start(FakeFactory::echo(), poll_options()).await;
    let host = harness.host.clone();

    let values = tokio::task::spawn_blocking(move || {
        host.execute_command_blocking(Command::script("hello"), CommandOptions::default())
    })
    .await
    .unwrap()
    .unwrap();

    assert_eq!(values, vec![serde_json::Value::from("hello")]);
    harness.shutdown().await;
}

#[tokio::test]
async fn test_requester_cancellation_skips_item() {
    let harness = Harness::start(FakeFactory::echo(), poll_options()).await;
    let ran = Arc::new(AtomicUsize::new(0));
    let release = hold_pipeline(&harness);

    let cancel = CancellationToken::new();
    let ran_in_item = Arc::clone(&ran);
    let handle = harness
        .host
        .submit("skipped", ExecutionOptions::default(), Some(cancel.clone()), move |_ctx, _token| {
            ran_in_item.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();
    cancel.cancel();
    release.send(()).unwrap();

    assert!(matches!(handle.await, TaskOutcome::Canceled));
    assert_eq!(ran.load(Ordering::SeqCst), 0);
    harness.shutdown().await;
}

#[tokio::test]
async fn test_panicking_item_faults_without_stopping_host() {
    let harness = Harness::start(FakeFactory::echo(), poll_options()).await;

    let outcome = harness
        .host
        .submit("explode", ExecutionOptions::default(), None, |_ctx, _token| -> Result<(), HostError> {
            panic!("boom");
        })
        .unwrap()
        .await;
    assert!(matches!(outcome, TaskOutcome::Faulted(HostError::Faulted(ref msg)) if msg == "boom"));

    let depth = harness
        .host
        .execute_delegate("after", ExecutionOptions::default(), |ctx, _token| Ok(ctx.frame_depth()))
        .await
        .unwrap();
    assert_eq!(depth, 1);
    assert!(!harness.host.is_stopped());
    assert_eq!(harness.host.stats().faulted, 1);
    harness.shutdown().await;
}

#[tokio::test]
async fn test_command_faults_follow_throw_on_error() {
    let factory = FakeFactory::new(crate::integration::test_utils::handler(
        |_engine, _callbacks, command, _token| {
            if command.to_string() == "fail" {
                return Err(EngineError::Runtime("bad input".to_string()));
            }
            crate::integration::test_utils::default_response(command)
        },
    ));
    let harness = Harness::start(factory, poll_options()).await;

    let err = harness
        .host
        .execute_command(Command::script("fail"), CommandOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, HostError::Engine(EngineError::Runtime(_))));

    let quiet = CommandOptions {
        throw_on_error: false,
        ..CommandOptions::default()
    };
    let values = harness
        .host
        .execute_command(Command::script("fail"), quiet)
        .await
        .unwrap();
    assert!(values.is_empty());
    assert_eq!(harness.surface.errors(), vec!["Runtime error: bad input".to_string()]);
    harness.shutdown().await;
}

#[tokio::test]
async fn test_command_output_written_when_requested() {
    let harness = Harness::start(FakeFactory::echo(), poll_options()).await;
    let options = CommandOptions {
        write_output_to_host: true,
        ..CommandOptions::default()
    };

    harness
        .host
        .execute_command(Command::script("visible"), options)
        .await
        .unwrap();
    harness
        .host
        .execute_command(Command::script("hidden"), CommandOptions::default())
        .await
        .unwrap();

    let output = harness.surface.output_text();
    assert!(output.contains("visible\n"));
    assert!(!output.contains("hidden"));
    harness.shutdown().await;
}
