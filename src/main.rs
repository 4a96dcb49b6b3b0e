//! vmbridge CLI entry point.
//!
//! Runs an asyncified guest core with its serial port attached to the
//! terminal: stdin feeds the guest's input queue, guest output goes to
//! stdout, and logs go to stderr.

use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, ValueEnum};
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use vmbridge_common::{BridgeConfig, ConfigFile, KeydownPolicy};
use vmbridge_core::{CompiledModule, InputSender, OutputReceiver};
use vmbridge_driver::Session;

/// Run an asyncified WebAssembly core over stdin/stdout.
#[derive(Debug, Parser)]
#[command(name = "vmbridge", version, about)]
struct Cli {
    /// Guest module (`.wasm` or `.wat`); overrides `[guest] path`.
    #[arg(long, env = "VMBRIDGE_GUEST")]
    guest: Option<PathBuf>,

    /// TOML configuration file.
    #[arg(long, env = "VMBRIDGE_CONFIG")]
    config: Option<PathBuf>,

    /// Output substring that marks the guest as booted.
    #[arg(long)]
    sentinel: Option<String>,

    /// Steps per burst once the guest is booted.
    #[arg(long)]
    quantum: Option<u32>,

    /// Behavior of `keydown` when no input is queued.
    #[arg(long, value_enum)]
    keydown: Option<KeydownArg>,

    /// Emit logs as JSON lines.
    #[arg(long, env = "VMBRIDGE_LOG_JSON")]
    log_json: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum KeydownArg {
    Poll,
    Suspend,
}

impl From<KeydownArg> for KeydownPolicy {
    fn from(arg: KeydownArg) -> Self {
        match arg {
            KeydownArg::Poll => KeydownPolicy::Poll,
            KeydownArg::Suspend => KeydownPolicy::Suspend,
        }
    }
}

impl Cli {
    /// Apply command-line overrides on top of the file configuration.
    fn apply(&self, config: &mut BridgeConfig) {
        if let Some(sentinel) = &self.sentinel {
            config.io.sentinel.clone_from(sentinel);
        }
        if let Some(quantum) = self.quantum {
            config.driver.quantum = quantum;
        }
        if let Some(keydown) = self.keydown {
            config.io.keydown_policy = keydown.into();
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    info!("Starting vmbridge");

    let file = match &cli.config {
        Some(path) => ConfigFile::from_file(path)
            .with_context(|| format!("Failed to load config file {}", path.display()))?,
        None => ConfigFile::default(),
    };

    let mut config = file.bridge;
    cli.apply(&mut config);

    let guest_path = cli
        .guest
        .clone()
        .or_else(|| file.guest.map(|guest| PathBuf::from(guest.path)))
        .context("No guest module given. Pass --guest or set [guest] path in the config file")?;

    let session = Session::new(config).context("Invalid bridge configuration")?;
    let module = load_guest(&session, &guest_path)?;

    info!(
        guest = %guest_path.display(),
        content_hash = %module.content_hash(),
        "Guest loaded"
    );

    let (driver, handle) = session.start(&module).context("Failed to start guest")?;
    let (input, output, _ready) = handle.into_parts();

    spawn_stdin_pump(input)?;
    let writer = tokio::spawn(write_output(output));
    let run = driver
        .spawn_thread()
        .context("Failed to start run loop thread")?;
    let run = tokio::task::spawn_blocking(move || run.join());

    tokio::select! {
        result = run => match result {
            Ok(Ok(Err(e))) => return Err(anyhow::Error::new(e).context("Guest stopped")),
            Ok(Ok(Ok(never))) => match never {},
            Ok(Err(_)) => anyhow::bail!("Run loop thread panicked"),
            Err(e) => return Err(anyhow::Error::new(e).context("Run loop join failed")),
        },
        () = shutdown_signal() => {},
    }

    writer.abort();
    info!("Shutdown complete");

    // The run loop thread has no cancellation point
    std::process::exit(0);
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| "info,vmbridge=debug".into());
    let registry = tracing_subscriber::registry().with(filter);

    // stdout carries guest output only
    if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn load_guest(session: &Session, path: &Path) -> anyhow::Result<CompiledModule> {
    let module = if path.extension().is_some_and(|ext| ext == "wat") {
        let wat = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        session.load_wat(&wat)?
    } else {
        session
            .load_file(path)
            .with_context(|| format!("Failed to load {}", path.display()))?
    };

    if !module.is_asyncified() {
        warn!(
            missing = ?module.missing_control_exports(),
            "Guest lacks asyncify control exports"
        );
    }
    Ok(module)
}

/// Forward stdin to the guest byte by byte from a dedicated thread.
fn spawn_stdin_pump(input: InputSender) -> anyhow::Result<()> {
    std::thread::Builder::new()
        .name("stdin-pump".into())
        .spawn(move || {
            let mut stdin = std::io::stdin().lock();
            let mut buf = [0u8; 256];
            loop {
                match stdin.read(&mut buf) {
                    Ok(0) => {
                        info!("stdin closed");
                        return;
                    }
                    Ok(n) => {
                        for &byte in &buf[..n] {
                            if input.send(u32::from(byte)).is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                    Err(e) => {
                        warn!(error = %e, "Failed to read stdin");
                        return;
                    }
                }
            }
        })
        .context("Failed to spawn stdin thread")?;
    Ok(())
}

/// Write guest output to stdout as it arrives.
async fn write_output(mut output: OutputReceiver) -> std::io::Result<()> {
    let mut stdout = tokio::io::stdout();
    let mut buf = Vec::new();

    while let Some(code) = output.recv().await {
        encode_output(code, &mut buf);
        while let Ok(code) = output.try_recv() {
            encode_output(code, &mut buf);
        }

        stdout.write_all(&buf).await?;
        stdout.flush().await?;
        buf.clear();
    }
    Ok(())
}

/// Codes up to 0xFF are raw serial bytes; anything larger is a code point.
fn encode_output(code: u32, buf: &mut Vec<u8>) {
    match u8::try_from(code) {
        Ok(byte) => buf.push(byte),
        Err(_) => {
            let c = char::from_u32(code).unwrap_or(char::REPLACEMENT_CHARACTER);
            buf.extend_from_slice(c.encode_utf8(&mut [0u8; 4]).as_bytes());
        }
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
}
