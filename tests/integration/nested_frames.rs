//! Integration tests for nested loops and pushed sessions
//!
//! Tests cover:
//! - Exit refused at the top-level frame
//! - Nested prompts entered by the engine and exited through the host
//! - Push/pop symmetry of remote sessions with session change notifications
//! - Maximum nesting depth
//! - Remote prompt decoration

use crate::integration::test_utils::{
    default_response, handler, poll_options, repl_options, wait_until, FakeFactory, FakeSession,
    Harness,
};
use psic::engine::{Command, Session};
use psic::error::{EngineError, HostError};
use psic::host::{CommandOptions, ExecutionOptions, FrameKind, HostStartOptions};
use psic::notify::{HostNotification, SessionChangeReason};
use std::sync::Arc;

fn nesting_factory() -> FakeFactory {
    FakeFactory::new(handler(|_engine, callbacks, command, _token| {
        if command.to_string() == "nest" {
            callbacks.enter_nested_prompt()?;
            return Ok(vec![serde_json::Value::from("left nested prompt")]);
        }
        default_response(command)
    }))
}

async fn runspace_depth(harness: &Harness) -> usize {
    harness
        .host
        .execute_delegate("runspace depth", ExecutionOptions::default(), |ctx, _token| {
            Ok(ctx.runspace_depth())
        })
        .await
        .unwrap()
}

fn session_changes(harness: &Harness) -> Vec<SessionChangeReason> {
    harness
        .drain_notifications()
        .into_iter()
        .filter_map(|notification| match notification {
            HostNotification::SessionChanged { reason, .. } => Some(reason),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_exit_refused_at_top_level() {
    let harness = Harness::start(FakeFactory::echo(), poll_options()).await;

    let err = harness.host.request_exit().await.unwrap_err();
    assert!(matches!(err, HostError::ExitRefused(_)));
    assert_eq!(harness.host.frame_depth(), 1);
    assert!(!harness.host.is_stopped());
    harness.shutdown().await;
}

#[tokio::test]
async fn test_nested_prompt_runs_queued_work_until_exit() {
    let harness = Harness::start(nesting_factory(), poll_options()).await;

    let nest = harness
        .host
        .submit_command(Command::script("nest"), CommandOptions::default(), None)
        .unwrap();
    assert!(wait_until(|| harness.host.frame_depth() == 2).await);
    assert!(harness.host.frame_kind().contains(FrameKind::NESTED));

    // Work queued now runs inside the nested loop
    let depth = harness
        .host
        .execute_delegate("inside", ExecutionOptions::default(), |ctx, _token| Ok(ctx.frame_depth()))
        .await
        .unwrap();
    assert_eq!(depth, 2);

    harness.host.request_exit().await.unwrap();
    let values = nest.await.into_result().unwrap();
    assert_eq!(values, vec![serde_json::Value::from("left nested prompt")]);
    assert!(wait_until(|| harness.host.frame_depth() == 1).await);
    harness.shutdown().await;
}

#[tokio::test]
async fn test_push_and_pop_sessions_are_symmetric() {
    let harness = Harness::start(FakeFactory::echo(), poll_options()).await;
    assert_eq!(session_changes(&harness), vec![SessionChangeReason::Enter]);

    let remotes: Vec<Arc<FakeSession>> = (0..3)
        .map(|i| FakeSession::remote(&format!("remote{}", i)))
        .collect();
    for (i, remote) in remotes.iter().enumerate() {
        harness
            .host
            .push_session(Arc::clone(remote) as Arc<dyn Session>)
            .await
            .unwrap();
        assert_eq!(harness.host.frame_depth(), i + 2);
        assert!(harness.host.frame_kind().contains(FrameKind::REMOTE));
    }
    assert_eq!(runspace_depth(&harness).await, 4);
    assert!(remotes[2].has_sink());
    assert!(!remotes[1].has_sink());
    assert_eq!(session_changes(&harness), vec![SessionChangeReason::Enter; 3]);

    for i in (0..3).rev() {
        harness.host.pop_session().await.unwrap();
        assert!(wait_until(|| harness.host.frame_depth() == i + 1).await);
    }
    assert_eq!(runspace_depth(&harness).await, 1);
    assert!(!remotes[0].has_sink());
    assert_eq!(session_changes(&harness), vec![SessionChangeReason::Exit; 3]);

    let err = harness.host.pop_session().await.unwrap_err();
    assert!(matches!(err, HostError::ExitRefused(_)));
    harness.shutdown().await;
}

#[tokio::test]
async fn test_push_beyond_max_depth_is_refused() {
    let options = HostStartOptions {
        max_nesting_depth: 2,
        ..poll_options()
    };
    let harness = Harness::start(FakeFactory::echo(), options).await;

    harness
        .host
        .push_session(FakeSession::remote("one") as Arc<dyn Session>)
        .await
        .unwrap();
    let err = harness
        .host
        .push_session(FakeSession::remote("two") as Arc<dyn Session>)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        HostError::Engine(EngineError::Other(ref msg)) if msg.contains("maximum nesting depth of 2")
    ));
    assert_eq!(harness.host.frame_depth(), 2);
    harness.shutdown().await;
}

#[tokio::test]
async fn test_remote_prompt_is_decorated() {
    let harness = Harness::start(FakeFactory::echo(), repl_options()).await;
    assert!(wait_until(|| harness.host.is_awaiting_input()).await);

    harness
        .host
        .push_session(FakeSession::remote("build01") as Arc<dyn Session>)
        .await
        .unwrap();

    assert!(wait_until(|| harness.surface.output_text().contains("[build01]: TEST> ")).await);
    harness.shutdown().await;
}
