//! remora — a shell wrapper with an AI assistant
//!
//! Spawns the configured shell on a PTY, puts the terminal in raw mode,
//! and hands both byte streams to the multiplexer. Start a line with a
//! capital letter to ask the model a question, with `!` to give it a goal;
//! everything else is your shell, untouched.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use portable_pty::{native_pty_system, CommandBuilder, PtySize};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use remora_core::config::{self, Config, LoggingConfig};
use remora_core::llm::{LlmClient, OpenAiClient};
use remora_core::mux::{
    shared_writer, spawn_byte_reader, spawn_parent_reader, MultiplexerOptions, ShellMultiplexer,
};
use remora_core::prompts::PromptLibrary;
use remora_core::ps1::{self, ShellDialect};

/// Exported into the child so nested invocations can detect the wrapper.
const SHELL_ENV_MARKER: &str = "REMORA_SHELL";

#[derive(Parser)]
#[command(name = "remora")]
#[command(about = "A shell wrapper that adds an AI assistant to your terminal")]
#[command(version)]
struct Cli {
    /// Path to the config file
    #[arg(long, default_value = "~/.config/remora/remora.json")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Wrap the configured shell in the multiplexer
    Shell {
        /// Shell binary to wrap (overrides the config)
        #[arg(long)]
        shell: Option<String>,

        /// Disable inline suggestions for this session
        #[arg(long)]
        no_autosuggest: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = config::load(&cli.config)?;

    match cli.command {
        Command::Shell {
            shell,
            no_autosuggest,
        } => {
            if let Some(shell) = shell {
                config.shell.binary = shell;
            }
            if no_autosuggest {
                config.autosuggest.enabled = false;
            }
            run_shell(config).await
        }
    }
}

async fn run_shell(config: Config) -> Result<()> {
    if std::env::var(SHELL_ENV_MARKER).is_ok() {
        bail!("already inside a remora shell");
    }

    init_logging(&config.logging)?;
    info!(shell = %config.shell.binary, "starting remora shell");

    let api_key = config.provider.resolve_api_key();
    if api_key.is_empty() {
        warn!(
            env = %config.provider.api_key_env,
            "no API key configured, model requests will fail"
        );
    }
    let llm: Arc<dyn LlmClient> = Arc::new(OpenAiClient::new(&config.provider.base_url, &api_key));
    let prompts = Arc::new(PromptLibrary::default());

    // allocate the PTY and spawn the shell
    let (cols, rows) = crossterm::terminal::size().context("failed to read terminal size")?;
    let pty_system = native_pty_system();
    let pair = pty_system
        .openpty(PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        })
        .context("failed to open pty")?;

    let mut cmd = CommandBuilder::new(&config.shell.binary);
    for (key, value) in std::env::vars() {
        cmd.env(key, value);
    }
    cmd.env(SHELL_ENV_MARKER, "1");

    let mut child = pair
        .slave
        .spawn_command(cmd)
        .context("failed to spawn shell")?;
    let child_writer = pair.master.take_writer().context("failed to get pty writer")?;
    let child_reader = pair
        .master
        .try_clone_reader()
        .context("failed to get pty reader")?;
    // dropping the master closes the pty, keep it for the whole session
    let _master = pair.master;

    let cancel = CancellationToken::new();

    // raw mode for the whole multiplexer lifetime, restored on drop
    let _raw = RawModeGuard::enable()?;

    // reader tasks feed the multiplexer through channels
    let mut child_out_rx = spawn_byte_reader(child_reader);
    let (parent_in_rx, cursor_rx) = spawn_parent_reader(Box::new(std::io::stdin()));
    let child_in = shared_writer(child_writer);
    let parent_out = shared_writer(std::io::stdout());

    // redefine the child's prompt so exit codes and prompt boundaries are
    // recoverable from its output; unknown dialects degrade silently
    match ShellDialect::detect(&config.shell.binary) {
        Some(dialect) => {
            let statement = ps1::injection_statement(dialect, &config.shell.command_prompt);
            if let Ok(mut writer) = child_in.lock() {
                use std::io::Write;
                let _ = writer.write_all(statement.as_bytes());
                let _ = writer.flush();
            }
            // swallow the echoed assignment, then elicit a fresh prompt
            drain_child_output(&mut child_out_rx, Duration::from_millis(100)).await;
            if let Ok(mut writer) = child_in.lock() {
                use std::io::Write;
                let _ = writer.write_all(b"\n");
                let _ = writer.flush();
            }
        }
        None => {
            warn!(
                shell = %config.shell.binary,
                "unknown shell dialect, exit status reporting disabled"
            );
        }
    }

    // SIGWINCH -> fresh width on the resize channel
    let (resize_tx, resize_rx) = mpsc::channel(4);
    tokio::spawn(async move {
        let mut sigwinch = match signal(SignalKind::window_change()) {
            Ok(signal) => signal,
            Err(err) => {
                warn!(error = %err, "failed to install SIGWINCH handler");
                return;
            }
        };
        while sigwinch.recv().await.is_some() {
            if let Ok((width, _)) = crossterm::terminal::size() {
                if resize_tx.send(width as usize).await.is_err() {
                    return;
                }
            }
        }
    });

    // child exit ends the session
    let cancel_on_exit = cancel.clone();
    tokio::task::spawn_blocking(move || {
        let status = child.wait();
        info!(status = ?status, "child shell exited");
        cancel_on_exit.cancel();
    });

    let mut mux = ShellMultiplexer::new(MultiplexerOptions {
        config,
        llm,
        prompts,
        cancel,
        child_in,
        parent_out,
        child_out_rx,
        parent_in_rx,
        cursor_rx,
        resize_rx,
        term_width: cols as usize,
    });

    mux.run().await
}

/// Consume child output until it goes quiet for `idle`.
async fn drain_child_output(rx: &mut mpsc::Receiver<Vec<u8>>, idle: Duration) {
    loop {
        match tokio::time::timeout(idle, rx.recv()).await {
            Ok(Some(_)) => continue,
            _ => return,
        }
    }
}

fn init_logging(config: &LoggingConfig) -> Result<()> {
    let path = config::resolve_path(Path::new(&config.file));
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create log directory: {}", parent.display()))?;
    }
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("failed to open log file: {}", path.display()))?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.clone()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::sync::Mutex::new(file))
        .with_ansi(false)
        .init();
    Ok(())
}

/// Raw mode for the lifetime of the multiplexer, restored on every exit
/// path including panics.
struct RawModeGuard;

impl RawModeGuard {
    fn enable() -> Result<Self> {
        enable_raw_mode().context("failed to enable raw mode")?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
    }
}
