//! Execution host: a single pipeline thread that owns the engine, a task
//! queue feeding it, and the cancellation and frame bookkeeping around both.

pub mod breakpoints;
pub mod cancellation;
pub mod debug;
pub mod events;
pub mod facade;
pub mod frame;
pub mod options;
pub mod pipeline;
pub mod queue;
pub(crate) mod shared;
pub mod state;
pub mod task;

pub use breakpoints::BreakpointDetails;
pub use cancellation::{CancellationContext, CancellationScope, LinkedToken};
pub use events::SessionEventSink;
pub use facade::{ExecutionHost, ExecutionHostBuilder, PIPELINE_THREAD_NAME};
pub use frame::FrameKind;
pub use options::{CommandOptions, ExecutionOptions, HostStartOptions, Priority};
pub use pipeline::PipelineContext;
pub use queue::{ConsumerBlock, TaskQueue};
pub use shared::HostStats;
pub use task::{DelegateTask, OutcomeKind, SynchronousTask, TaskHandle, TaskId, TaskOutcome, WorkItem};
