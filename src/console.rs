//! Terminal reader and surface used by the `psic` binary.
//!
//! Standard input is read on a background thread so a pending read can be
//! cancelled and can run idle work while the user is not typing.

use crate::error::ReadError;
use crate::host::cancellation::LinkedToken;
use crate::reader::{IdleHandler, InteractiveReader, InteractiveSurface, ReadOutcome};
use owo_colors::OwoColorize;
use parking_lot::Mutex;
use secrecy::SecretString;
use std::io::{BufRead, IsTerminal, Write};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError};
use std::time::Duration;
use tracing::debug;

const IDLE_INTERVAL: Duration = Duration::from_millis(50);

type LineResult = std::io::Result<String>;

/// Line reader over standard input
pub struct StdinReader {
    lines: Mutex<Option<Receiver<LineResult>>>,
    idle_interval: Duration,
}

impl Default for StdinReader {
    fn default() -> Self {
        Self::new()
    }
}

impl StdinReader {
    pub fn new() -> Self {
        Self {
            lines: Mutex::new(None),
            idle_interval: IDLE_INTERVAL,
        }
    }

    pub fn with_idle_interval(mut self, interval: Duration) -> Self {
        self.idle_interval = interval;
        self
    }

    /// Start the stdin thread on first use
    fn ensure_started(lines: &mut Option<Receiver<LineResult>>) -> Result<(), ReadError> {
        if lines.is_some() {
            return Ok(());
        }
        let (tx, rx) = channel();
        std::thread::Builder::new()
            .name("psic-stdin".to_string())
            .spawn(move || {
                let stdin = std::io::stdin();
                let mut handle = stdin.lock();
                loop {
                    let mut line = String::new();
                    let result = match handle.read_line(&mut line) {
                        Ok(0) => break,
                        Ok(_) => Ok(line.trim_end_matches(['\r', '\n']).to_string()),
                        Err(err) => Err(err),
                    };
                    if tx.send(result).is_err() {
                        break;
                    }
                }
                debug!("Standard input closed");
            })?;
        *lines = Some(rx);
        Ok(())
    }

    fn next_line(
        &self,
        mut idle: Option<&mut dyn IdleHandler>,
        token: &LinkedToken,
    ) -> Result<Option<String>, ReadError> {
        loop {
            if token.is_cancelled() {
                return Ok(None);
            }
            // Released before idle work runs, which may read a line itself
            let received = {
                let mut lines = self.lines.lock();
                Self::ensure_started(&mut lines)?;
                match lines.as_ref() {
                    Some(rx) => rx.recv_timeout(self.idle_interval),
                    None => Err(RecvTimeoutError::Disconnected),
                }
            };
            match received {
                Ok(Ok(line)) => return Ok(Some(line)),
                Ok(Err(err)) => return Err(err.into()),
                Err(RecvTimeoutError::Disconnected) => return Err(ReadError::Closed),
                Err(RecvTimeoutError::Timeout) => {
                    if let Some(handler) = idle.as_deref_mut() {
                        handler.on_idle(token);
                    }
                }
            }
        }
    }
}

impl InteractiveReader for StdinReader {
    fn read_line(
        &self,
        idle: &mut dyn IdleHandler,
        token: &LinkedToken,
    ) -> Result<ReadOutcome, ReadError> {
        Ok(match self.next_line(Some(idle), token)? {
            Some(line) => ReadOutcome::Line(line),
            None => ReadOutcome::Canceled,
        })
    }

    /// Echo suppression is left to the terminal
    fn read_secure_line(&self, token: &LinkedToken) -> Result<SecretString, ReadError> {
        match self.next_line(None, token)? {
            Some(line) => Ok(SecretString::from(line)),
            None => Err(ReadError::Canceled),
        }
    }
}

/// Writes to standard output, diagnostics to standard error
#[derive(Debug)]
pub struct TerminalSurface {
    color: bool,
}

impl Default for TerminalSurface {
    fn default() -> Self {
        Self {
            color: std::io::stderr().is_terminal(),
        }
    }
}

impl TerminalSurface {
    pub fn new(color: bool) -> Self {
        Self { color }
    }
}

impl InteractiveSurface for TerminalSurface {
    fn write(&self, text: &str) {
        let mut stdout = std::io::stdout().lock();
        // A closed stdout leaves nothing to report to
        let _ = stdout.write_all(text.as_bytes());
        let _ = stdout.flush();
    }

    fn write_warning_line(&self, text: &str) {
        let mut stderr = std::io::stderr().lock();
        let _ = if self.color {
            writeln!(stderr, "{}", text.yellow())
        } else {
            writeln!(stderr, "WARNING: {}", text)
        };
    }

    fn write_error_line(&self, text: &str) {
        let mut stderr = std::io::stderr().lock();
        let _ = if self.color {
            writeln!(stderr, "{}", text.red())
        } else {
            writeln!(stderr, "ERROR: {}", text)
        };
    }
}
