//! Daemon process: owns the index, the prefetch list and the server
//!
//! [`Daemon::run`] is a single-threaded event loop. Anything that wants the
//! daemon to act (signals, a failed background task, the CLI in foreground
//! mode) sends an event through a cloned [`DaemonHandle`].

use crate::index::loader::load_all;
use crate::index::store::IndexStore;
use crate::query::QueryResolver;
use crate::server::daemon::{FeedbackHandler, RpcServer};
use crate::server::prefetch::Prefetch;
use crate::server::{get_endpoint, get_pid_path, read_pid};
use crate::utils::app_data::AppConfig;
use crate::utils::version_segment::{default_segment_path, VersionSegment};
use anyhow::{Context, Result};
use std::fs;
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};

/// Requests processed by the daemon loop
#[derive(Debug)]
pub enum DaemonEvent {
    Reload,
    Failure(anyhow::Error),
    Exit,
}

/// Sends events to a running [`Daemon`]
#[derive(Debug, Clone)]
pub struct DaemonHandle {
    tx: mpsc::Sender<DaemonEvent>,
}

impl DaemonHandle {
    pub fn request_reload(&self) {
        self.send(DaemonEvent::Reload);
    }

    pub fn report_failure(&self, error: anyhow::Error) {
        self.send(DaemonEvent::Failure(error));
    }

    pub fn request_exit(&self) {
        self.send(DaemonEvent::Exit);
    }

    fn send(&self, event: DaemonEvent) {
        // The loop only goes away when the daemon is already exiting
        let _ = self.tx.send(event);
    }
}

/// Filesystem locations the daemon claims
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonPaths {
    pub endpoint: PathBuf,
    pub segment: PathBuf,
    pub pid: PathBuf,
}

impl DaemonPaths {
    /// Per-user locations
    pub fn for_current_user() -> Self {
        Self {
            endpoint: get_endpoint(),
            segment: default_segment_path(),
            pid: get_pid_path(),
        }
    }
}

pub struct Daemon {
    config: AppConfig,
    store: Arc<IndexStore>,
    prefetch: Arc<Prefetch>,
    server: Option<RpcServer>,
    pid_path: PathBuf,
    handle: DaemonHandle,
    events: mpsc::Receiver<DaemonEvent>,
}

impl Daemon {
    /// Start a daemon at the per-user locations
    pub fn new(config: AppConfig) -> Result<Self> {
        Self::with_paths(config, DaemonPaths::for_current_user())
    }

    /// Claim the shared segment, start serving and write the PID file
    ///
    /// The index starts empty; [`Daemon::run`] performs the first load.
    pub fn with_paths(config: AppConfig, paths: DaemonPaths) -> Result<Self> {
        let segment = VersionSegment::create_at(&paths.segment).with_context(|| {
            format!("Failed to create version segment {}", paths.segment.display())
        })?;
        let store = Arc::new(IndexStore::new(segment));

        let prefetch_path = config.effective_prefetch_path()?;
        let prefetch = Arc::new(Prefetch::new(config.prefetch_count, Some(prefetch_path)));
        if let Err(e) = prefetch.load() {
            warn!("ignoring prefetch list: {:#}", e);
        }

        let mut server_config = config.server_config();
        server_config.endpoint = paths.endpoint;
        let server = RpcServer::start(
            server_config,
            Arc::new(QueryResolver::new(Arc::clone(&store))),
            Arc::clone(&prefetch) as Arc<dyn FeedbackHandler>,
        )?;

        if let Some(parent) = paths.pid.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&paths.pid, std::process::id().to_string())
            .with_context(|| format!("Failed to write PID file {}", paths.pid.display()))?;

        let (tx, events) = mpsc::channel();
        Ok(Self {
            config,
            store,
            prefetch,
            server: Some(server),
            pid_path: paths.pid,
            handle: DaemonHandle { tx },
            events,
        })
    }

    pub fn handle(&self) -> DaemonHandle {
        self.handle.clone()
    }

    pub fn store(&self) -> &Arc<IndexStore> {
        &self.store
    }

    pub fn server(&self) -> Option<&RpcServer> {
        self.server.as_ref()
    }

    /// Load the index, then process events until asked to exit
    pub fn run(self) -> Result<()> {
        self.reload();

        while let Ok(event) = self.events.recv() {
            match event {
                DaemonEvent::Reload => self.reload(),
                DaemonEvent::Failure(e) => error!("{:#}", e),
                DaemonEvent::Exit => break,
            }
        }

        info!("daemon exiting");
        Ok(())
    }

    /// Rebuild the index from the configured sources
    ///
    /// Failures are reported and leave the active generation in place.
    pub fn reload(&self) {
        if self.config.index_files.is_empty() {
            warn!("no index files configured; serving an empty index");
        }

        let loaded = load_all(&self.config.index_files)
            .and_then(|records| self.store.load(records).map_err(anyhow::Error::from));
        if let Err(e) = loaded {
            self.handle
                .report_failure(e.context("Index reload failed, keeping the previous index"));
        }
    }
}

impl Drop for Daemon {
    fn drop(&mut self) {
        if let Some(server) = self.server.take() {
            server.shutdown();
        }
        if let Err(e) = self.prefetch.save() {
            warn!("{:#}", e);
        }
        // Another daemon may have claimed the PID file since
        let ours = fs::read_to_string(&self.pid_path)
            .is_ok_and(|pid| pid.trim() == std::process::id().to_string());
        if ours {
            let _ = fs::remove_file(&self.pid_path);
        }
    }
}

/// Route process signals to the daemon
///
/// SIGHUP reloads; SIGTERM and SIGINT exit.
#[cfg(unix)]
pub fn spawn_signal_listener(handle: DaemonHandle) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to start signal runtime")?;

    let (mut hangup, mut terminate, mut interrupt) = {
        let _guard = runtime.enter();
        (
            signal(SignalKind::hangup())?,
            signal(SignalKind::terminate())?,
            signal(SignalKind::interrupt())?,
        )
    };

    thread::Builder::new()
        .name("fontresolve-signals".to_string())
        .spawn(move || {
            runtime.block_on(async move {
                loop {
                    tokio::select! {
                        _ = hangup.recv() => {
                            info!("SIGHUP received, reloading");
                            handle.request_reload();
                        }
                        _ = terminate.recv() => break,
                        _ = interrupt.recv() => break,
                    }
                }
                handle.request_exit();
            });
        })?;
    Ok(())
}

/// Route Ctrl-C to the daemon
#[cfg(windows)]
pub fn spawn_signal_listener(handle: DaemonHandle) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to start signal runtime")?;

    thread::Builder::new()
        .name("fontresolve-signals".to_string())
        .spawn(move || {
            runtime.block_on(async {
                if tokio::signal::ctrl_c().await.is_ok() {
                    handle.request_exit();
                }
            });
        })?;
    Ok(())
}

/// Run the daemon in the current process until it is told to exit
pub fn run_foreground(config: AppConfig) -> Result<()> {
    let daemon = Daemon::new(config)?;
    spawn_signal_listener(daemon.handle())?;
    daemon.run()
}

/// Daemonize the current process
#[cfg(unix)]
pub fn daemonize(config: AppConfig) -> Result<()> {
    // Fork using double-fork technique for proper daemonization
    match unsafe { libc::fork() } {
        -1 => anyhow::bail!("First fork failed"),
        0 => {
            if unsafe { libc::setsid() } == -1 {
                anyhow::bail!("setsid failed");
            }

            // Second fork to prevent acquiring a controlling terminal
            match unsafe { libc::fork() } {
                -1 => anyhow::bail!("Second fork failed"),
                0 => {
                    unsafe {
                        let null = libc::open(c"/dev/null".as_ptr(), libc::O_RDWR);
                        if null != -1 {
                            libc::dup2(null, 0);
                            libc::dup2(null, 1);
                            libc::dup2(null, 2);
                            if null > 2 {
                                libc::close(null);
                            }
                        }
                    }

                    // Avoid holding mounts
                    let _ = std::env::set_current_dir("/");

                    let code = match run_foreground(config) {
                        Ok(()) => 0,
                        Err(e) => {
                            // stderr is gone; leave the reason next to the PID file
                            let log = get_pid_path().with_extension("err");
                            let _ = fs::write(log, format!("{:#}\n", e));
                            1
                        }
                    };
                    std::process::exit(code);
                }
                _ => std::process::exit(0),
            }
        }
        _ => {
            // Parent: reap the first child
            unsafe {
                let mut status: libc::c_int = 0;
                libc::wait(&mut status);
            }
            Ok(())
        }
    }
}

/// Start the daemon as a detached background process
#[cfg(windows)]
pub fn daemonize(_config: AppConfig) -> Result<()> {
    use std::os::windows::process::CommandExt;
    use std::process::{Command, Stdio};

    const CREATE_NO_WINDOW: u32 = 0x08000000;
    const DETACHED_PROCESS: u32 = 0x00000008;

    let exe = std::env::current_exe()?;
    Command::new(&exe)
        .args(["daemon", "foreground"])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .creation_flags(CREATE_NO_WINDOW | DETACHED_PROCESS)
        .spawn()
        .context("Failed to spawn daemon process")?;

    Ok(())
}

/// Stop the running daemon; returns false if none was running
#[cfg(unix)]
pub fn stop_daemon() -> Result<bool> {
    let Some(pid) = read_pid() else {
        return Ok(false);
    };
    let pid = pid as libc::pid_t;

    unsafe {
        if libc::kill(pid, libc::SIGTERM) != 0 {
            let _ = fs::remove_file(get_pid_path());
            return Ok(false);
        }
    }

    // Wait for the orderly shutdown, then insist
    for _ in 0..30 {
        thread::sleep(Duration::from_millis(100));
        if unsafe { libc::kill(pid, 0) } != 0 {
            return Ok(true);
        }
    }
    warn!("daemon {} ignored SIGTERM, killing it", pid);
    unsafe {
        libc::kill(pid, libc::SIGKILL);
    }

    let _ = fs::remove_file(get_endpoint());
    let _ = fs::remove_file(get_pid_path());
    Ok(true)
}

/// Stop the running daemon; returns false if none was running
#[cfg(windows)]
pub fn stop_daemon() -> Result<bool> {
    const PROCESS_TERMINATE: u32 = 0x0001;

    #[link(name = "kernel32")]
    unsafe extern "system" {
        fn OpenProcess(access: u32, inherit: i32, pid: u32) -> *mut std::ffi::c_void;
        fn TerminateProcess(process: *mut std::ffi::c_void, exit_code: u32) -> i32;
        fn CloseHandle(handle: *mut std::ffi::c_void) -> i32;
    }

    let Some(pid) = read_pid() else {
        return Ok(false);
    };

    let terminated = unsafe {
        let process = OpenProcess(PROCESS_TERMINATE, 0, pid);
        if process.is_null() {
            false
        } else {
            let ok = TerminateProcess(process, 0) != 0;
            CloseHandle(process);
            ok
        }
    };

    thread::sleep(Duration::from_millis(500));
    let _ = fs::remove_file(get_pid_path());
    Ok(terminated)
}

/// Ask the running daemon to reload its index
#[cfg(unix)]
pub fn signal_reload() -> Result<bool> {
    let Some(pid) = read_pid() else {
        return Ok(false);
    };
    Ok(unsafe { libc::kill(pid as libc::pid_t, libc::SIGHUP) } == 0)
}

/// Ask the running daemon to reload its index
#[cfg(windows)]
pub fn signal_reload() -> Result<bool> {
    anyhow::bail!("Reloading a running daemon is only supported on Unix; restart it instead")
}
