//! PSIC Binary
//!
//! Runs the execution host over the terminal with the POSIX shell engine.

use anyhow::Context;
use clap::Parser;
use psic::config::{ConfigLoader, HostConfig};
use psic::console::{StdinReader, TerminalSurface};
use psic::engine::Command;
use psic::host::{CommandOptions, ExecutionHost, HostStartOptions};
use psic::logging::{default_log_file, init_logging, LoggingConfig};
use psic::shell::ShellEngineFactory;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "psic")]
#[command(about = "Interactive console over a single-threaded script engine host")]
#[command(version)]
pub struct Cli {
    /// Workspace root directory
    #[arg(long, default_value = ".")]
    pub workspace: PathBuf,

    /// Configuration file path (overrides default config loading)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Run one command, print its output and exit
    #[arg(short = 'c', long = "command")]
    pub command: Option<String>,

    /// Disable the interactive prompt and only serve queued work
    #[arg(long)]
    pub no_repl: bool,

    /// Enable verbose logging
    #[arg(long, default_value = "false")]
    pub verbose: bool,

    /// Disable logging entirely
    #[arg(long, default_value = "false")]
    pub quiet: bool,

    /// Log level (trace, debug, info, warn, error, off)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Log format (json, text)
    #[arg(long)]
    pub log_format: Option<String>,

    /// Log output (stdout, stderr, file, file+stderr)
    #[arg(long)]
    pub log_output: Option<String>,

    /// Log file path (if output includes "file")
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

fn main() {
    let cli = Cli::parse();

    let logging_config = build_logging_config(&cli);
    if let Err(e) = init_logging(Some(&logging_config)) {
        eprintln!("Failed to initialize logging: {}", e);
        process::exit(1);
    }

    info!("PSIC starting");

    if let Err(e) = run(cli) {
        error!("PSIC failed: {:#}", e);
        eprintln!("{:#}", e);
        process::exit(1);
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(&cli)?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build async runtime")?;
    runtime.block_on(serve(cli, config))
}

fn load_config(cli: &Cli) -> anyhow::Result<HostConfig> {
    let config = match cli.config {
        Some(ref path) => ConfigLoader::load_from_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => ConfigLoader::load(&cli.workspace).context("failed to load configuration")?,
    };
    Ok(config)
}

fn start_options(cli: &Cli, config: &HostConfig) -> HostStartOptions {
    let mut options = HostStartOptions::from(&config.host);
    if cli.no_repl || cli.command.is_some() {
        options.repl_enabled = false;
    }
    options
}

async fn serve(cli: Cli, config: HostConfig) -> anyhow::Result<()> {
    let workspace = cli
        .workspace
        .canonicalize()
        .with_context(|| format!("workspace not found: {}", cli.workspace.display()))?;
    let options = start_options(&cli, &config);

    let host = ExecutionHost::builder(Arc::new(ShellEngineFactory::new(workspace)))
        .reader(Arc::new(StdinReader::new()))
        .surface(Arc::new(TerminalSurface::default()))
        .build();

    let cancel = CancellationToken::new();
    let startup = host.try_start(options, &cancel);
    tokio::select! {
        started = startup => { started.context("execution host failed to start")?; }
        _ = tokio::signal::ctrl_c() => {
            cancel.cancel();
            host.stop().await?;
            return Ok(());
        }
    }

    if let Some(script) = cli.command {
        let options = CommandOptions {
            write_output_to_host: true,
            ..CommandOptions::default()
        };
        let result = host.execute_command(Command::script(script), options).await;
        host.stop().await?;
        return result.map(|_| ()).context("command failed");
    }

    loop {
        tokio::select! {
            stopped = host.wait_for_stopped() => {
                stopped.context("execution host stopped with a fault")?;
                return Ok(());
            }
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    warn!(error = %e, "Could not listen for interrupts, shutting down");
                    break;
                }
                if host.is_awaiting_input() {
                    info!("Interrupt at the prompt, shutting down");
                    break;
                }
                info!("Interrupt received, cancelling current command");
                host.cancel_current_task();
            }
        }
    }

    host.stop().await?;
    info!("PSIC stopped");
    Ok(())
}

/// Build logging configuration from CLI args, environment, and config file.
/// Precedence: CLI flags override config file override defaults.
fn build_logging_config(cli: &Cli) -> LoggingConfig {
    let mut config = if let Some(ref config_path) = cli.config {
        ConfigLoader::load_from_file(config_path)
            .ok()
            .map(|c| c.logging)
            .unwrap_or_default()
    } else {
        ConfigLoader::load(&cli.workspace)
            .ok()
            .map(|c| c.logging)
            .unwrap_or_default()
    };

    if cli.quiet {
        config.enabled = false;
    }
    if cli.verbose {
        config.level = "debug".to_string();
        if config.output == "file" {
            config.output = "file+stderr".to_string();
        }
    }
    if let Some(ref level) = cli.log_level {
        config.level = level.clone();
    }
    if let Some(ref format) = cli.log_format {
        config.format = format.clone();
    }
    if let Some(ref output) = cli.log_output {
        config.output = output.clone();
    }
    if let Some(ref file) = cli.log_file {
        config.file = Some(file.clone());
    }

    let output_uses_file = config.output == "file" || config.output == "file+stderr";
    if config.enabled && output_uses_file && config.file.is_none() {
        config.file = Some(default_log_file());
    }

    config
}
