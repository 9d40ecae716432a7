//! PSIC: Pipeline-Serialized Interactive Console
//!
//! An execution host for an interactive scripting engine. Editor features,
//! debugger requests and the user's own REPL all share one engine, so every
//! engine call is serialized onto a single pipeline thread fed by a
//! prioritized, cancellable task queue.

pub mod config;
pub mod console;
pub mod engine;
pub mod error;
pub mod host;
pub mod logging;
pub mod notify;
pub mod reader;
pub mod shell;
