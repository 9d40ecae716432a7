//! Merge rules: built-in defaults beneath every other source.

use config::builder::DefaultState;
use config::Config;
use config::ConfigBuilder;
use config::ConfigError;

/// Create a Config builder with the host defaults applied.
pub fn builder_with_defaults() -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    Config::builder()
        .set_default("host.repl_enabled", true)?
        .set_default("host.poll_interval_ms", 100_u64)?
        .set_default("host.default_prompt", "PSIC> ")?
        .set_default("host.max_nesting_depth", 64_u64)?
        .set_default("host.idle_event_name", "engine.idle")?
        .set_default("logging.level", "info")?
        .set_default("logging.output", "stderr")
}
