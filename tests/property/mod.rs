//! Property-based tests for queue ordering and scope cancellation

mod queue_ordering;
mod scope_cancellation;
