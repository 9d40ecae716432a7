//! Breakpoint batches applied against a session debugger.
//!
//! Each breakpoint is verified on its own; a bad entry never aborts the batch.

use crate::engine::{Breakpoint, BreakpointSpec, Debugger};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{debug, warn};

/// Verification result for one requested breakpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakpointDetails {
    pub id: Option<u32>,
    pub verified: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub script_path: PathBuf,
    pub line: u32,
}

impl BreakpointDetails {
    fn verified(breakpoint: Breakpoint) -> Self {
        Self {
            id: Some(breakpoint.id),
            verified: true,
            message: None,
            script_path: breakpoint.script_path,
            line: breakpoint.line,
        }
    }

    fn rejected(spec: &BreakpointSpec, message: impl Into<String>) -> Self {
        Self {
            id: None,
            verified: false,
            message: Some(message.into()),
            script_path: spec.script_path.clone(),
            line: spec.line,
        }
    }
}

fn precheck(spec: &BreakpointSpec) -> Option<&'static str> {
    if spec.script_path.as_os_str().is_empty() {
        return Some("Breakpoint has no script path");
    }
    if spec.line == 0 {
        return Some("Line numbers start at 1");
    }
    if matches!(spec.column, Some(0)) {
        return Some("Column numbers start at 1");
    }
    None
}

/// Set every breakpoint in `specs`, one result per input in the same order
pub fn apply_breakpoints(debugger: &dyn Debugger, specs: &[BreakpointSpec]) -> Vec<BreakpointDetails> {
    specs
        .iter()
        .map(|spec| {
            if let Some(reason) = precheck(spec) {
                debug!(path = %spec.script_path.display(), line = spec.line, reason, "Rejected breakpoint");
                return BreakpointDetails::rejected(spec, reason);
            }
            match debugger.set_breakpoint(spec) {
                Ok(breakpoint) => BreakpointDetails::verified(breakpoint),
                Err(err) => {
                    warn!(path = %spec.script_path.display(), line = spec.line, error = %err, "Failed to set breakpoint");
                    BreakpointDetails::rejected(spec, err.to_string())
                }
            }
        })
        .collect()
}

/// Remove breakpoints by id. Returns the ids that could not be removed.
pub fn remove_breakpoints(debugger: &dyn Debugger, ids: &[u32]) -> Vec<u32> {
    ids.iter()
        .copied()
        .filter(|id| match debugger.remove_breakpoint(*id) {
            Ok(()) => false,
            Err(err) => {
                warn!(breakpoint = id, error = %err, "Failed to remove breakpoint");
                true
            }
        })
        .collect()
}
