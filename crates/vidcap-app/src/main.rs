//! Vidcap - capture media URLs from a desktop client's traffic.
//!
//! Subcommands:
//! - `run`: start the capture proxy, optionally flip the OS proxy and save
//!   captures to a folder, until Ctrl-C
//! - `download`: fetch one URL to a file
//! - `instructions`: print manual proxy setup steps
//! - `system-proxy`: turn the OS proxy on or off, or report its state

use std::panic;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use directories::ProjectDirs;
use tokio::task::JoinSet;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use vidcap_app::{destination_for, watch_new_assets};
use vidcap_core::{Downloader, DownloaderConfig};
use vidcap_proxy::{
    manual_proxy_instructions, platform_controller, CaptureService, ProxyConfig,
    DEFAULT_PROXY_PORT,
};

const PROXY_HOST: &str = "127.0.0.1";

/// Vidcap - local proxy that captures media URLs
#[derive(Parser, Debug)]
#[command(name = "vidcap", version, about)]
struct Args {
    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the capture proxy until Ctrl-C
    Run {
        /// Preferred port; the next free one is used if taken
        #[arg(long, default_value_t = DEFAULT_PROXY_PORT)]
        port: u16,

        /// Point the OS proxy at the capture proxy while running
        #[arg(long)]
        system_proxy: bool,

        /// Save every capture into this folder
        #[arg(long)]
        download_dir: Option<PathBuf>,

        /// Upstream connect timeout in seconds
        #[arg(long, default_value_t = 10)]
        connect_timeout: u64,
    },

    /// Download one URL to a file
    Download {
        /// URL to fetch
        url: String,

        /// Destination file
        dest: PathBuf,

        /// Give up after this many seconds
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Print manual proxy setup steps
    Instructions {
        #[arg(long, default_value_t = DEFAULT_PROXY_PORT)]
        port: u16,
    },

    /// Turn the OS proxy on or off, or check where it points
    SystemProxy {
        #[arg(value_enum)]
        state: Toggle,

        #[arg(long, default_value_t = DEFAULT_PROXY_PORT)]
        port: u16,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Toggle {
    On,
    Off,
    Status,
}

/// Get the logs directory path.
fn logs_dir() -> Option<PathBuf> {
    ProjectDirs::from("", "vidcap", "Vidcap").map(|dirs| dirs.data_dir().join("logs"))
}

/// Initialize console logging plus a rotating log file when possible.
fn init_logging(args: &Args) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let log_level = if args.debug { "debug" } else { &args.log_level };

    // Targets are prefix-matched, so this also covers the vidcap_* crates.
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("vidcap={},warn", log_level)));

    if let Some(log_dir) = logs_dir() {
        if std::fs::create_dir_all(&log_dir).is_ok() {
            let file_appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .max_log_files(5)
                .filename_prefix("vidcap")
                .filename_suffix("log")
                .build(&log_dir)
                .ok();

            if let Some(appender) = file_appender {
                let (non_blocking, guard) = tracing_appender::non_blocking(appender);

                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().with_writer(std::io::stderr))
                    .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
                    .init();

                tracing::debug!("Logging to {:?}", log_dir);
                return Some(guard);
            }
        }
    }

    // Fallback: console logging only
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    tracing::warn!("File logging unavailable, using console only");
    None
}

/// Runs the capture proxy until Ctrl-C, then reverts everything it changed.
async fn run(
    port: u16,
    system_proxy: bool,
    download_dir: Option<PathBuf>,
    connect_timeout: u64,
) -> anyhow::Result<()> {
    let config = ProxyConfig::new()
        .with_port(port)
        .with_connect_timeout(Duration::from_secs(connect_timeout));
    let service = CaptureService::new(config).context("Failed to set up capture service")?;

    let downloader = match &download_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {:?}", dir))?;
            Some(Downloader::new()?)
        }
        None => None,
    };

    let mut captures = watch_new_assets(service.registry());
    let mut downloads = JoinSet::new();

    let status = service.start_proxy(None).await;
    if !status.running {
        anyhow::bail!(
            "Capture proxy failed to start: {}",
            status.error.unwrap_or_default()
        );
    }
    println!("Capture proxy listening on {}:{}", PROXY_HOST, status.port);

    if system_proxy {
        let result = service.enable_system_proxy();
        if result.success {
            println!("{}", result.message);
            if !service.system_proxy_active() {
                tracing::warn!("System proxy was set but does not read back as pointing here");
            }
        } else {
            tracing::warn!(
                "Could not enable system proxy: {}",
                result.error.as_deref().unwrap_or(&result.message)
            );
            println!("{}", service.manual_proxy_instructions());
        }
    } else {
        println!("{}", service.manual_proxy_instructions());
    }

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            asset = captures.recv() => {
                let Some(asset) = asset else { break };
                println!("[{}] {} ({}) {}", asset.quality, asset.title, asset.id, asset.url);

                if let (Some(dir), Some(downloader)) = (&download_dir, &downloader) {
                    let dest = destination_for(dir, &asset);
                    let downloader = downloader.clone();
                    downloads.spawn(async move {
                        let result = downloader.download_asset(&asset, &dest).await;
                        if result.success {
                            println!("Saved {}", dest.display());
                        }
                    });
                }
            }
            Some(joined) = downloads.join_next(), if !downloads.is_empty() => {
                if let Err(e) = joined {
                    tracing::error!("Download task failed: {}", e);
                }
            }
            signal = &mut shutdown => {
                if let Err(e) = signal {
                    tracing::error!("Failed to listen for Ctrl-C: {}", e);
                }
                tracing::info!("Shutting down");
                break;
            }
        }
    }

    if !downloads.is_empty() {
        tracing::info!("Cancelling {} unfinished download(s)", downloads.len());
    }
    // Aborted downloads remove their partial files as they unwind.
    downloads.shutdown().await;

    let status = service.stop_proxy().await;
    if status.proxy_enabled {
        tracing::warn!("System proxy is still enabled; run `vidcap system-proxy off`");
    }
    println!("Captured {} asset(s) this session", status.captured_count);
    Ok(())
}

async fn download(url: &str, dest: PathBuf, timeout: Option<u64>) -> anyhow::Result<()> {
    let mut config = DownloaderConfig::default();
    if let Some(secs) = timeout {
        config = config.with_timeout(Duration::from_secs(secs));
    }

    let downloader = Downloader::with_config(config)?;
    let outcome = downloader
        .download(url, &dest)
        .await
        .with_context(|| format!("Failed to download {}", url))?;

    println!(
        "Saved {} bytes to {} ({} redirect(s))",
        outcome.bytes,
        outcome.path.display(),
        outcome.redirects
    );
    Ok(())
}

fn toggle_system_proxy(state: Toggle, port: u16) -> anyhow::Result<()> {
    let controller = platform_controller();
    let result = match state {
        Toggle::On => controller.enable(PROXY_HOST, port),
        Toggle::Off => controller.disable(),
        Toggle::Status => {
            if controller.is_enabled(PROXY_HOST, port) {
                println!("System proxy points at {}:{}", PROXY_HOST, port);
            } else {
                println!("System proxy does not point at {}:{}", PROXY_HOST, port);
            }
            return Ok(());
        }
    };

    if !result.success {
        anyhow::bail!(
            "{}: {}",
            result.message,
            result.error.unwrap_or_default()
        );
    }
    println!("{}", result.message);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging (keep guard alive for the duration of the program)
    let _log_guard = init_logging(&args);

    let default_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        tracing::error!("PANIC: {}", panic_info);
        default_hook(panic_info);
    }));

    tracing::debug!("Args: {:?}", args);

    match args.command {
        Command::Run {
            port,
            system_proxy,
            download_dir,
            connect_timeout,
        } => run(port, system_proxy, download_dir, connect_timeout).await,
        Command::Download { url, dest, timeout } => download(&url, dest, timeout).await,
        Command::Instructions { port } => {
            println!("{}", manual_proxy_instructions(PROXY_HOST, port));
            Ok(())
        }
        Command::SystemProxy { state, port } => toggle_system_proxy(state, port),
    }
}
