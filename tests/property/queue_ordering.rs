//! Property-based tests for task queue ordering

use proptest::prelude::*;
use psic::host::TaskQueue;
use std::collections::VecDeque;

#[derive(Debug, Clone)]
enum QueueOp {
    Append(u32),
    Prepend(u32),
    InsertNext(u32),
    Take,
}

fn queue_op() -> impl Strategy<Value = QueueOp> {
    prop_oneof![
        any::<u32>().prop_map(QueueOp::Append),
        any::<u32>().prop_map(QueueOp::Prepend),
        any::<u32>().prop_map(QueueOp::InsertNext),
        Just(QueueOp::Take),
    ]
}

/// Any interleaving of operations matches a deque whose head holds a
/// priority band of known length
#[test]
fn test_queue_matches_deque_model() {
    let mut runner = proptest::test_runner::TestRunner::default();

    runner
        .run(&prop::collection::vec(queue_op(), 0..64), |ops| {
            let queue = TaskQueue::<u32>::new();
            let mut model = VecDeque::new();
            let mut band = 0usize;

            for op in ops {
                match op {
                    QueueOp::Append(value) => {
                        queue.append(value).unwrap();
                        model.push_back(value);
                    }
                    QueueOp::Prepend(value) => {
                        queue.prepend(value).unwrap();
                        model.push_front(value);
                        band += 1;
                    }
                    QueueOp::InsertNext(value) => {
                        queue.insert_next(value).unwrap();
                        model.insert(band, value);
                        band += 1;
                    }
                    QueueOp::Take => {
                        let expected = model.pop_front();
                        if expected.is_some() {
                            band = band.saturating_sub(1);
                        }
                        prop_assert_eq!(queue.take_now(), expected);
                    }
                }
                prop_assert_eq!(queue.len(), model.len());
            }

            Ok(())
        })
        .unwrap();
}

/// Items appended at Normal priority come out in submission order
#[test]
fn test_appended_items_stay_fifo() {
    let mut runner = proptest::test_runner::TestRunner::default();

    runner
        .run(&prop::collection::vec(any::<u16>(), 1..50), |values| {
            let queue = TaskQueue::new();
            for value in &values {
                queue.append(*value).unwrap();
            }
            let drained: Vec<u16> = std::iter::from_fn(|| queue.take_now()).collect();
            prop_assert_eq!(drained, values);
            Ok(())
        })
        .unwrap();
}

/// Next items keep submission order among themselves and run before every
/// Normal item, however the two are interleaved
#[test]
fn test_next_items_stay_fifo_ahead_of_normal() {
    let mut runner = proptest::test_runner::TestRunner::default();

    runner
        .run(&prop::collection::vec((any::<bool>(), any::<u16>()), 1..50), |submissions| {
            let queue = TaskQueue::new();
            for (next, value) in &submissions {
                if *next {
                    queue.insert_next((true, *value)).unwrap();
                } else {
                    queue.append((false, *value)).unwrap();
                }
            }
            let drained: Vec<(bool, u16)> = std::iter::from_fn(|| queue.take_now()).collect();
            let expected: Vec<(bool, u16)> = submissions
                .iter()
                .filter(|(next, _)| *next)
                .chain(submissions.iter().filter(|(next, _)| !*next))
                .copied()
                .collect();
            prop_assert_eq!(drained, expected);
            Ok(())
        })
        .unwrap();
}
