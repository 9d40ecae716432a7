//! Interactive reader and surface collaborators.

use crate::error::ReadError;
use crate::host::cancellation::LinkedToken;
use parking_lot::RwLock;
use secrecy::SecretString;
use std::sync::Arc;

/// Called by the reader while it waits for a keystroke
pub trait IdleHandler {
    fn on_idle(&mut self, token: &LinkedToken);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    Line(String),
    /// The read token fired before a line was completed
    Canceled,
    /// The user pressed the interrupt key
    Interrupted,
}

/// Cancellable blocking line reader
pub trait InteractiveReader: Send + Sync {
    /// Read one line. Implementations call `idle` whenever no input is
    /// pending and return [`ReadOutcome::Canceled`] once `token` fires.
    fn read_line(
        &self,
        idle: &mut dyn IdleHandler,
        token: &LinkedToken,
    ) -> Result<ReadOutcome, ReadError>;

    /// Read one line without echo. Fails with [`ReadError::Canceled`] once
    /// `token` fires.
    fn read_secure_line(&self, token: &LinkedToken) -> Result<SecretString, ReadError>;
}

/// Where prompts, output and diagnostics are written
pub trait InteractiveSurface: Send + Sync {
    fn write(&self, text: &str);

    fn write_line(&self, text: &str) {
        self.write(text);
        self.write("\n");
    }

    fn write_warning_line(&self, text: &str);

    fn write_error_line(&self, text: &str);
}

/// Reader that can be replaced at runtime. Every replacement starts a new
/// generation, so state tied to one reader (such as having seen it close)
/// does not outlive it.
#[derive(Clone)]
pub struct ReaderSlot {
    inner: Arc<RwLock<(Arc<dyn InteractiveReader>, u64)>>,
}

impl ReaderSlot {
    pub fn new(reader: Arc<dyn InteractiveReader>) -> Self {
        Self {
            inner: Arc::new(RwLock::new((reader, 0))),
        }
    }

    /// Reader to use for the next read; a swap never interrupts a read in progress
    pub fn current(&self) -> Arc<dyn InteractiveReader> {
        Arc::clone(&self.inner.read().0)
    }

    /// Current reader together with its generation
    pub fn snapshot(&self) -> (Arc<dyn InteractiveReader>, u64) {
        let guard = self.inner.read();
        (Arc::clone(&guard.0), guard.1)
    }

    pub fn generation(&self) -> u64 {
        self.inner.read().1
    }

    pub fn replace(&self, reader: Arc<dyn InteractiveReader>) {
        let mut guard = self.inner.write();
        let generation = guard.1.wrapping_add(1);
        *guard = (reader, generation);
    }
}

/// Reader for hosts without interactive input; every read reports a closed stream
#[derive(Debug, Default, Clone, Copy)]
pub struct NullReader;

impl InteractiveReader for NullReader {
    fn read_line(
        &self,
        _idle: &mut dyn IdleHandler,
        _token: &LinkedToken,
    ) -> Result<ReadOutcome, ReadError> {
        Err(ReadError::Closed)
    }

    fn read_secure_line(&self, _token: &LinkedToken) -> Result<SecretString, ReadError> {
        Err(ReadError::Closed)
    }
}

/// Surface that discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSurface;

impl InteractiveSurface for NullSurface {
    fn write(&self, _text: &str) {}

    fn write_warning_line(&self, _text: &str) {}

    fn write_error_line(&self, _text: &str) {}
}
