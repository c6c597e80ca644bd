use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fontresolve::daemon;
use fontresolve::server::{
    get_endpoint, get_pid_path, is_daemon_running, read_pid, ClientCache, FontAgent, QueryOutcome,
};
use fontresolve::utils::{AppConfig, VersionSegment};
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

/// Environment variable holding a tracing filter directive
const LOG_ENV: &str = "FONTRESOLVE_LOG";

#[derive(Parser)]
#[command(name = "fontresolve")]
#[command(about = "Per-user font name resolution service")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to config.json in the app data directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage the font server daemon
    Daemon {
        #[command(subcommand)]
        action: DaemonAction,
    },
    /// Ask the running daemon to reload its face index
    Reload,
    /// Resolve a font name through the running daemon
    Query {
        /// Family, full or PostScript name
        name: String,
    },
    /// Report font files that were just loaded
    Feedback {
        #[arg(required = true)]
        paths: Vec<String>,
    },
}

#[derive(Subcommand)]
enum DaemonAction {
    /// Start the daemon in background
    Start,
    /// Stop the running daemon
    Stop,
    /// Check daemon status
    Status,
    /// Run daemon in foreground (for debugging)
    Foreground,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => AppConfig::load_from(path)?,
        None => AppConfig::load()?,
    };
    setup_tracing(&config.log_filter);

    match cli.command {
        Commands::Daemon { action } => handle_daemon_command(action, config)?,
        Commands::Reload => {
            if !is_daemon_running() {
                println!("Daemon is not running. Start it with 'fontresolve daemon start'");
                return Ok(());
            }
            if daemon::signal_reload()? {
                println!("Reload requested");
            } else {
                println!("Failed to signal the daemon");
            }
        }
        Commands::Query { name } => {
            let agent = FontAgent::new(ClientCache::open(), get_endpoint());
            match agent.query(&name) {
                QueryOutcome::Resolved(faces) if faces.is_empty() => {
                    println!("No faces found for {:?}", name);
                }
                QueryOutcome::Resolved(faces) => {
                    for face in faces {
                        println!(
                            "{}#{}\tweight={}{}{}",
                            face.path,
                            face.face_index,
                            face.weight,
                            if face.oblique { " oblique" } else { "" },
                            if face.ps_outline { " cff" } else { "" },
                        );
                    }
                }
                QueryOutcome::Cached => println!("Already resolved"),
                QueryOutcome::Unavailable => {
                    anyhow::bail!("Font server at {} is not available", get_endpoint().display())
                }
            }
        }
        Commands::Feedback { paths } => {
            FontAgent::new(ClientCache::with_segment(None), get_endpoint()).feedback(paths);
        }
    }

    Ok(())
}

fn setup_tracing(default_filter: &str) {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn handle_daemon_command(action: DaemonAction, config: AppConfig) -> Result<()> {
    match action {
        DaemonAction::Start => {
            if is_daemon_running() {
                println!("Daemon is already running");
                return Ok(());
            }

            println!("Starting fontresolve daemon...");
            daemon::daemonize(config)?;

            // Wait a moment for daemon to start
            for _ in 0..20 {
                thread::sleep(Duration::from_millis(100));
                if is_daemon_running() {
                    println!("Daemon started (endpoint: {})", get_endpoint().display());
                    return Ok(());
                }
            }
            println!(
                "Daemon may have failed to start. Check {}",
                get_pid_path().with_extension("err").display()
            );
        }
        DaemonAction::Stop => {
            if !is_daemon_running() {
                println!("Daemon is not running");
                return Ok(());
            }

            println!("Stopping daemon...");
            daemon::stop_daemon()?;
            println!("Daemon stopped");
        }
        DaemonAction::Status => {
            if !is_daemon_running() {
                println!("Daemon is not running");
                return Ok(());
            }

            println!("fontresolve daemon status:");
            if let Some(pid) = read_pid() {
                println!("  PID: {}", pid);
            }
            println!("  Endpoint: {}", get_endpoint().display());
            match VersionSegment::open() {
                Ok(segment) => println!("  Index version: {}", segment.load()),
                Err(e) => println!("  Index version: unavailable ({})", e),
            }
        }
        DaemonAction::Foreground => {
            if is_daemon_running() {
                println!(
                    "Daemon is already running in background. Stop it first with 'fontresolve daemon stop'"
                );
                return Ok(());
            }

            println!("Running daemon in foreground (Ctrl+C to stop)...");
            daemon::run_foreground(config).context("Daemon failed")?;
        }
    }

    Ok(())
}
