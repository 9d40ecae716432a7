//! Integration tests for the interactive prompt
//!
//! Tests cover:
//! - Work picked up by idle processing while the reader waits
//! - Foreground work yielding the prompt
//! - Typed lines, blank lines and failing lines
//! - Prompt fallback and idle engine events
//! - Reader closure, reader replacement and secure reads

use crate::integration::test_utils::{
    default_response, handler, poll_options, repl_options, wait_until, FakeFactory, Harness,
    RecordingSurface, ScriptedReader, WAIT,
};
use psic::engine::{CommandKind, EngineFactory};
use psic::error::{EngineError, HostError};
use psic::host::{ExecutionHost, ExecutionOptions};
use psic::reader::{InteractiveReader, InteractiveSurface};
use secrecy::ExposeSecret;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn failing_line_factory() -> FakeFactory {
    FakeFactory::new(handler(|_engine, _callbacks, command, token| {
        match command.to_string().as_str() {
            "fail" => Err(EngineError::Runtime("bad input".to_string())),
            "wait" => {
                if token.wait_timeout(WAIT) {
                    Err(EngineError::Canceled)
                } else {
                    Ok(Vec::new())
                }
            }
            _ => default_response(command),
        }
    }))
}

async fn started_repl(factory: FakeFactory) -> Harness {
    let harness = Harness::start(factory, repl_options()).await;
    assert!(wait_until(|| harness.host.is_awaiting_input()).await);
    harness
}

#[tokio::test]
async fn test_background_item_runs_while_prompt_waits() {
    let harness = started_repl(FakeFactory::echo()).await;
    let reads = harness.reader.reads.load(Ordering::SeqCst);

    let idle = harness
        .host
        .execute_delegate("background", ExecutionOptions::default(), |ctx, _token| Ok(ctx.is_idle()))
        .await
        .unwrap();

    assert!(idle);
    // The pending read was never interrupted
    assert_eq!(harness.reader.reads.load(Ordering::SeqCst), reads);
    assert!(harness.host.is_awaiting_input());
    harness.shutdown().await;
}

#[tokio::test]
async fn test_foreground_item_takes_over_prompt() {
    let harness = started_repl(FakeFactory::echo()).await;

    let idle = harness
        .host
        .execute_delegate("foreground", ExecutionOptions::foreground(), |ctx, _token| Ok(ctx.is_idle()))
        .await
        .unwrap();

    assert!(!idle);
    assert!(wait_until(|| harness.host.is_awaiting_input()).await);
    harness.shutdown().await;
}

#[tokio::test]
async fn test_typed_line_runs_and_writes_output() {
    let harness = started_repl(FakeFactory::echo()).await;

    harness.reader.push_line("Get-Greeting");

    assert!(wait_until(|| harness.surface.output_text().contains("Get-Greeting\n")).await);
    assert!(harness.factory.commands().contains(&"Get-Greeting".to_string()));
    assert!(harness.surface.output_text().starts_with("TEST> "));
    harness.shutdown().await;
}

#[tokio::test]
async fn test_empty_line_is_not_invoked() {
    let harness = started_repl(FakeFactory::echo()).await;

    harness.reader.push_line("");
    harness.reader.push_line("after");

    assert!(wait_until(|| harness.factory.commands().contains(&"after".to_string())).await);
    assert_eq!(harness.factory.commands(), vec!["after".to_string()]);
    harness.shutdown().await;
}

#[tokio::test]
async fn test_whitespace_line_is_invoked() {
    let harness = started_repl(FakeFactory::echo()).await;

    harness.reader.push_line("   ");
    harness.reader.push_line("after");

    assert!(wait_until(|| harness.factory.commands().contains(&"after".to_string())).await);
    assert_eq!(
        harness.factory.commands(),
        vec!["   ".to_string(), "after".to_string()]
    );
    harness.shutdown().await;
}

#[tokio::test]
async fn test_failing_line_is_reported_and_prompt_continues() {
    let harness = started_repl(failing_line_factory()).await;
    let reads = harness.reader.reads.load(Ordering::SeqCst);

    harness.reader.push_line("fail");

    assert!(wait_until(|| !harness.surface.errors().is_empty()).await);
    let errors = harness.surface.errors();
    assert!(errors[0].starts_with("An error occurred while running the REPL loop"));
    assert!(errors[0].contains("bad input"));
    assert!(wait_until(|| harness.reader.reads.load(Ordering::SeqCst) > reads).await);
    assert!(!harness.host.is_stopped());
    harness.shutdown().await;
}

#[tokio::test]
async fn test_cancel_current_task_cancels_typed_line() {
    let harness = started_repl(failing_line_factory()).await;

    harness.reader.push_line("wait");
    assert!(wait_until(|| harness.factory.commands().contains(&"wait".to_string())).await);
    assert!(wait_until(|| !harness.host.is_awaiting_input()).await);

    harness.host.cancel_current_task();

    assert!(wait_until(|| harness.host.is_awaiting_input()).await);
    // Cancellation is not an error worth showing
    assert!(harness.surface.errors().is_empty());
    harness.shutdown().await;
}

#[tokio::test]
async fn test_prompt_failure_falls_back_to_default_prompt() {
    let factory = FakeFactory::new(handler(|_engine, _callbacks, command, _token| {
        match command.kind {
            CommandKind::Prompt => Err(EngineError::Runtime("prompt is broken".to_string())),
            _ => default_response(command),
        }
    }));
    let harness = started_repl(factory).await;

    assert!(harness.surface.output_text().starts_with("PSIC> "));
    assert!(harness.surface.errors().is_empty());
    harness.shutdown().await;
}

#[tokio::test]
async fn test_idle_event_subscribers_get_pipeline_runs() {
    let harness = started_repl(FakeFactory::echo().with_subscribers(&["engine.idle"])).await;

    assert!(wait_until(|| harness.factory.events.load(Ordering::SeqCst) > 0).await);
    assert!(wait_until(|| harness.factory.commands().contains(&"<inert>".to_string())).await);
    harness.shutdown().await;
}

#[tokio::test]
async fn test_idle_event_skipped_without_subscribers() {
    let harness = started_repl(FakeFactory::echo()).await;

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(harness.factory.events.load(Ordering::SeqCst), 0);
    assert!(harness.factory.commands().is_empty());
    harness.shutdown().await;
}

#[tokio::test]
async fn test_closed_reader_switches_to_poll_mode() {
    let harness = started_repl(FakeFactory::echo()).await;

    harness.reader.close();

    assert!(wait_until(|| !harness.host.is_awaiting_input()).await);
    let idle = harness
        .host
        .execute_delegate("after close", ExecutionOptions::default(), |ctx, _token| Ok(ctx.is_idle()))
        .await
        .unwrap();
    assert!(!idle);
    assert!(!harness.host.is_stopped());
    harness.shutdown().await;
}

#[tokio::test]
async fn test_replacing_closed_reader_restores_prompt() {
    let harness = started_repl(FakeFactory::echo()).await;
    harness.reader.close();
    assert!(wait_until(|| !harness.host.is_awaiting_input()).await);

    let replacement = Arc::new(ScriptedReader::default());
    replacement.push_line("after swap");
    harness
        .host
        .set_reader(Arc::clone(&replacement) as Arc<dyn InteractiveReader>);

    assert!(wait_until(|| harness.factory.commands().contains(&"after swap".to_string())).await);
    assert!(wait_until(|| harness.host.is_awaiting_input()).await);
    assert!(replacement.reads.load(Ordering::SeqCst) > 0);
    harness.shutdown().await;
}

#[tokio::test]
async fn test_reader_set_after_start_enables_prompt() {
    let factory = Arc::new(FakeFactory::echo());
    let surface = Arc::new(RecordingSurface::default());
    // Without a reader every read reports a closed stream
    let host = ExecutionHost::builder(Arc::clone(&factory) as Arc<dyn EngineFactory>)
        .surface(Arc::clone(&surface) as Arc<dyn InteractiveSurface>)
        .build();
    assert!(host.try_start(repl_options(), &CancellationToken::new()).await.unwrap());
    let idle = host
        .execute_delegate("before reader", ExecutionOptions::default(), |ctx, _token| Ok(ctx.is_idle()))
        .await
        .unwrap();
    assert!(!idle);
    assert!(!host.is_awaiting_input());

    let reader = Arc::new(ScriptedReader::default());
    reader.push_line("typed later");
    host.set_reader(Arc::clone(&reader) as Arc<dyn InteractiveReader>);

    assert!(wait_until(|| factory.commands().contains(&"typed later".to_string())).await);
    assert!(wait_until(|| host.is_awaiting_input()).await);
    host.stop().await.unwrap();
}

#[tokio::test]
async fn test_secure_line_read_through_host() {
    let harness = Harness::start(FakeFactory::echo(), poll_options()).await;
    harness.reader.push_line("hunter2");

    let secret = harness.host.read_secure_line().await.unwrap();

    assert_eq!(secret.expose_secret(), "hunter2");
    assert!(harness.surface.output_text().is_empty());
    harness.shutdown().await;
}

#[tokio::test]
async fn test_secure_read_canceled_by_stop() {
    let harness = Harness::start(FakeFactory::echo(), poll_options()).await;
    let host = harness.host.clone();

    let pending = tokio::spawn(async move { host.read_secure_line().await });
    assert!(wait_until(|| harness.host.stats().processing == 1).await);
    harness.host.stop().await.unwrap();

    let result = pending.await.unwrap();
    assert!(matches!(result, Err(HostError::Canceled)));
}

#[tokio::test]
async fn test_secure_read_canceled_by_cancel_current_task() {
    let harness = Harness::start(FakeFactory::echo(), poll_options()).await;
    let host = harness.host.clone();

    let pending = tokio::spawn(async move { host.read_secure_line().await });
    assert!(wait_until(|| harness.host.stats().processing == 1).await);
    harness.host.cancel_current_task();

    let result = pending.await.unwrap();
    assert!(matches!(result, Err(HostError::Canceled)));
    assert!(wait_until(|| harness.host.stats().canceled == 1).await);
    assert_eq!(harness.host.stats().faulted, 0);
    assert!(!harness.host.is_stopped());
    harness.shutdown().await;
}
