//! Error types for the PSIC execution host.

use thiserror::Error;

/// Faults raised by the script engine collaborator
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("Runtime error: {0}")]
    Runtime(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Session unavailable: {0}")]
    SessionUnavailable(String),

    #[error("Operation canceled")]
    Canceled,

    #[error("Engine error: {0}")]
    Other(String),
}

/// Interactive reader errors
#[derive(Debug, Error)]
pub enum ReadError {
    #[error("Input stream closed")]
    Closed,

    #[error("Read canceled")]
    Canceled,

    #[error("Reader I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors visible to producers submitting work to the host
#[derive(Debug, Error)]
pub enum HostError {
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Task was canceled")]
    Canceled,

    #[error("Host has not been started")]
    NotStarted,

    #[error("Host is shutting down")]
    ShuttingDown,

    #[error("Host has stopped")]
    Stopped,

    #[error("Exit refused: {0}")]
    ExitRefused(String),

    #[error("Synchronous wait on the pipeline thread would deadlock: {0}")]
    Reentrant(String),

    #[error("Task queue is closed")]
    QueueClosed,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Pipeline faulted: {0}")]
    Faulted(String),

    #[error("Reader error: {0}")]
    Reader(#[from] ReadError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl HostError {
    /// True for every flavour of cancellation, including an engine that observed its token
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            HostError::Canceled
                | HostError::Engine(EngineError::Canceled)
                | HostError::Reader(ReadError::Canceled)
        )
    }
}

impl From<config::ConfigError> for HostError {
    fn from(err: config::ConfigError) -> Self {
        HostError::Config(err.to_string())
    }
}
