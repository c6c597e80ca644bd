//! Font query server and its clients
//!
//! Architecture:
//! - [`daemon`]: worker pool, listener slots and shutdown ([`RpcServer`])
//! - [`connection`]: per-connection request/response state machine
//! - [`transport`]: per-user Unix socket or named pipe
//! - [`protocol`]: length-prefixed JSON messages
//! - [`client`]: blocking client used by font-loading processes and the CLI
//! - [`cache`]: client-side cache invalidated by the shared version counter
//! - [`prefetch`]: feedback handler remembering recently loaded fonts

pub mod cache;
pub mod client;
pub mod connection;
pub mod daemon;
pub mod prefetch;
pub mod protocol;
pub mod transport;

pub use cache::{ClientCache, FontAgent, QueryOutcome};
pub use client::{ClientError, FontClient};
pub use daemon::{
    FeedbackHandler, IgnoreFeedback, RequestHandler, RpcServer, ServerConfig, ServerError,
};
pub use prefetch::Prefetch;

use crate::utils::app_data::{get_runtime_dir, runtime_file_name};
use std::path::PathBuf;

/// Per-user endpoint of the font server
#[cfg(unix)]
pub fn get_endpoint() -> PathBuf {
    get_runtime_dir().join(runtime_file_name("sock"))
}

/// Per-user endpoint of the font server
#[cfg(windows)]
pub fn get_endpoint() -> PathBuf {
    PathBuf::from(format!(
        r"\\.\pipe\fontresolve-{}",
        crate::utils::app_data::user_identity()
    ))
}

/// Get the PID file path for the daemon
pub fn get_pid_path() -> PathBuf {
    get_runtime_dir().join(runtime_file_name("pid"))
}

/// Check if the daemon is running
pub fn is_daemon_running() -> bool {
    read_pid().is_some_and(process_exists)
}

/// PID recorded by the running daemon, if any
pub fn read_pid() -> Option<u32> {
    let pid = std::fs::read_to_string(get_pid_path()).ok()?;
    pid.trim().parse().ok()
}

#[cfg(unix)]
fn process_exists(pid: u32) -> bool {
    // Signal 0 only checks that the process exists
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(windows)]
fn process_exists(pid: u32) -> bool {
    const PROCESS_QUERY_LIMITED_INFORMATION: u32 = 0x1000;

    #[link(name = "kernel32")]
    unsafe extern "system" {
        fn OpenProcess(access: u32, inherit: i32, pid: u32) -> *mut std::ffi::c_void;
        fn CloseHandle(handle: *mut std::ffi::c_void) -> i32;
    }

    unsafe {
        let handle = OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, 0, pid);
        if handle.is_null() {
            return false;
        }
        CloseHandle(handle);
        true
    }
}
