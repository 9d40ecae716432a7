//! Property-based tests for idle parent cancellation over scope stacks

use proptest::prelude::*;
use psic::host::CancellationContext;

/// Index of the lowest scope `cancel_idle_parent_task` reaches, if any
fn lowest_cancelled(idle_flags: &[bool]) -> Option<usize> {
    let top_idle = idle_flags.iter().rposition(|idle| *idle)?;
    let parent = idle_flags[..top_idle].iter().rposition(|idle| !*idle);
    Some(parent.unwrap_or(0))
}

#[test]
fn test_idle_parent_cancellation_matches_model() {
    let mut runner = proptest::test_runner::TestRunner::default();

    runner
        .run(&prop::collection::vec(any::<bool>(), 1..12), |idle_flags| {
            let ctx = CancellationContext::new();
            let scopes: Vec<_> = idle_flags
                .iter()
                .map(|idle| ctx.enter_scope(*idle, None))
                .collect();

            ctx.cancel_idle_parent_task();

            let expected = lowest_cancelled(&idle_flags);
            for (index, scope) in scopes.iter().enumerate() {
                let should_cancel = matches!(expected, Some(lowest) if index >= lowest);
                prop_assert_eq!(scope.is_cancelled(), should_cancel, "scope {}", index);
            }
            Ok(())
        })
        .unwrap();
}

/// Dropping scopes in any order of entry leaves the stack empty
#[test]
fn test_scope_stack_balances_on_drop() {
    let mut runner = proptest::test_runner::TestRunner::default();

    runner
        .run(&prop::collection::vec(any::<bool>(), 0..12), |idle_flags| {
            let ctx = CancellationContext::new();
            {
                let _scopes: Vec<_> = idle_flags
                    .iter()
                    .map(|idle| ctx.enter_scope(*idle, None))
                    .collect();
                prop_assert_eq!(ctx.depth(), idle_flags.len());
            }
            prop_assert_eq!(ctx.depth(), 0);
            Ok(())
        })
        .unwrap();
}
