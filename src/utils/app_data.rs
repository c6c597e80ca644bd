use crate::server::daemon::{
    default_worker_threads, ServerConfig, DEFAULT_IO_TIMEOUT, DEFAULT_LISTENER_SLOTS,
};
use crate::server::protocol::DEFAULT_MAX_MESSAGE_LEN;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const APP_NAME: &str = "fontresolve";
const CONFIG_FILE: &str = "config.json";
const PREFETCH_FILE: &str = "prefetch.lru";

/// Daemon configuration stored in the app data directory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Face-record files loaded on startup and on every reload
    #[serde(default)]
    pub index_files: Vec<PathBuf>,

    /// Number of recently loaded font paths remembered for prefetch (0 disables it)
    #[serde(default = "default_prefetch_count")]
    pub prefetch_count: usize,

    /// Where the prefetch list is persisted between daemon runs
    /// If None, uses `prefetch.lru` in the app data directory
    #[serde(default)]
    pub prefetch_path: Option<PathBuf>,

    /// Worker threads serving connections
    /// If 0, uses the number of CPU cores (capped at 8)
    #[serde(default)]
    pub worker_threads: usize,

    /// Concurrent accept slots on the endpoint
    #[serde(default = "default_listener_slots")]
    pub listener_slots: usize,

    /// Largest accepted message payload in bytes
    #[serde(default = "default_max_message_len")]
    pub max_message_len: u32,

    /// Seconds a connection may stall on one read or write before it is closed
    #[serde(default = "default_io_timeout_secs")]
    pub io_timeout_secs: u64,

    /// Log filter directive used when FONTRESOLVE_LOG is not set
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

fn default_prefetch_count() -> usize {
    100
}

fn default_listener_slots() -> usize {
    DEFAULT_LISTENER_SLOTS
}

fn default_max_message_len() -> u32 {
    DEFAULT_MAX_MESSAGE_LEN
}

fn default_io_timeout_secs() -> u64 {
    DEFAULT_IO_TIMEOUT.as_secs()
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            index_files: Vec::new(),
            prefetch_count: default_prefetch_count(),
            prefetch_path: None,
            worker_threads: 0,
            listener_slots: default_listener_slots(),
            max_message_len: default_max_message_len(),
            io_timeout_secs: default_io_timeout_secs(),
            log_filter: default_log_filter(),
        }
    }
}

impl AppConfig {
    /// Load config from the app data directory, or return default if not found
    pub fn load() -> Result<Self> {
        Self::load_from(&get_config_path()?)
    }

    /// Load config from an explicit path, or return default if it does not exist
    pub fn load_from(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file {}", config_path.display()))?;
        let config: AppConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", config_path.display()))?;
        Ok(config)
    }

    /// Save config to the app data directory
    pub fn save(&self) -> Result<()> {
        self.save_to(&get_config_path()?)
    }

    pub fn save_to(&self, config_path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(config_path, content).context("Failed to write config file")?;
        Ok(())
    }

    /// Get the effective worker count (resolves 0 to CPU count, capped)
    pub fn effective_worker_threads(&self) -> usize {
        if self.worker_threads == 0 {
            default_worker_threads()
        } else {
            self.worker_threads
        }
    }

    /// Resolve the prefetch list location
    pub fn effective_prefetch_path(&self) -> Result<PathBuf> {
        match &self.prefetch_path {
            Some(path) => Ok(path.clone()),
            None => Ok(get_app_data_dir()?.join(PREFETCH_FILE)),
        }
    }

    /// Server settings for the per-user endpoint
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            endpoint: crate::server::get_endpoint(),
            worker_threads: self.effective_worker_threads(),
            listener_slots: self.listener_slots.max(1),
            max_message_len: self.max_message_len,
            io_timeout: Duration::from_secs(self.io_timeout_secs.max(1)),
        }
    }
}

/// Get the path to the config file
pub fn get_config_path() -> Result<PathBuf> {
    let app_dir = get_app_data_dir()?;
    Ok(app_dir.join(CONFIG_FILE))
}

/// Get the application data directory
pub fn get_app_data_dir() -> Result<PathBuf> {
    let base = if cfg!(target_os = "macos") {
        dirs::home_dir().map(|h| h.join("Library").join("Application Support"))
    } else if cfg!(target_os = "windows") {
        dirs::data_local_dir()
    } else {
        // Linux/Unix: use XDG_DATA_HOME or ~/.local/share
        dirs::data_dir()
    };

    let base = base.context("Could not determine app data directory")?;
    let app_dir = base.join(APP_NAME);

    fs::create_dir_all(&app_dir)?;
    Ok(app_dir)
}

/// Per-user directory for the socket, PID file and version segment
pub fn get_runtime_dir() -> PathBuf {
    // Try XDG_RUNTIME_DIR first (most secure, tmpfs-backed)
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        return PathBuf::from(runtime_dir);
    }

    if cfg!(target_os = "windows")
        && let Some(local) = dirs::data_local_dir()
    {
        return local.join(APP_NAME);
    }

    if let Some(home) = dirs::home_dir() {
        return home.join(".local").join("run");
    }

    std::env::temp_dir()
}

/// Stable identity of the current user, used to isolate per-user channels
#[cfg(unix)]
pub fn user_identity() -> String {
    let uid = unsafe { libc::getuid() };
    uid.to_string()
}

/// Stable identity of the current user, used to isolate per-user channels
///
/// The string form of the process token's user SID, e.g. `S-1-5-21-...`.
#[cfg(windows)]
pub fn user_identity() -> String {
    match token_sid::current_user_sid() {
        Ok(sid) => sanitize(&sid),
        Err(e) => {
            tracing::warn!("failed to read the user SID: {}", e);
            "unknown".to_string()
        }
    }
}

#[cfg(windows)]
mod token_sid {
    use std::ffi::c_void;
    use std::io;
    use std::ptr;

    type Handle = *mut c_void;

    const TOKEN_QUERY: u32 = 0x0008;
    /// `TOKEN_INFORMATION_CLASS::TokenUser`
    const TOKEN_USER: i32 = 1;

    #[repr(C)]
    struct SidAndAttributes {
        sid: *mut c_void,
        attributes: u32,
    }

    #[link(name = "kernel32")]
    unsafe extern "system" {
        fn GetCurrentProcess() -> Handle;
        fn CloseHandle(handle: Handle) -> i32;
        fn LocalFree(mem: *mut c_void) -> *mut c_void;
    }

    #[link(name = "advapi32")]
    unsafe extern "system" {
        fn OpenProcessToken(process: Handle, access: u32, token: *mut Handle) -> i32;
        fn GetTokenInformation(
            token: Handle,
            class: i32,
            info: *mut c_void,
            len: u32,
            return_len: *mut u32,
        ) -> i32;
        fn ConvertSidToStringSidW(sid: *mut c_void, string_sid: *mut *mut u16) -> i32;
    }

    pub fn current_user_sid() -> io::Result<String> {
        let mut token: Handle = ptr::null_mut();
        if unsafe { OpenProcessToken(GetCurrentProcess(), TOKEN_QUERY, &mut token) } == 0 {
            return Err(io::Error::last_os_error());
        }
        let sid = token_user_sid(token);
        unsafe {
            CloseHandle(token);
        }
        sid
    }

    fn token_user_sid(token: Handle) -> io::Result<String> {
        // First call only reports the size
        let mut len = 0u32;
        unsafe {
            GetTokenInformation(token, TOKEN_USER, ptr::null_mut(), 0, &mut len);
        }
        if len == 0 {
            return Err(io::Error::last_os_error());
        }

        // u64 words keep the buffer pointer-aligned
        let mut buf = vec![0u64; (len as usize).div_ceil(8)];
        let ok = unsafe {
            GetTokenInformation(token, TOKEN_USER, buf.as_mut_ptr().cast(), len, &mut len)
        };
        if ok == 0 {
            return Err(io::Error::last_os_error());
        }

        // Safety: on success the buffer starts with a TOKEN_USER whose SID
        // points into the same buffer
        let user = unsafe { &*buf.as_ptr().cast::<SidAndAttributes>() };
        let mut wide: *mut u16 = ptr::null_mut();
        if unsafe { ConvertSidToStringSidW(user.sid, &mut wide) } == 0 {
            return Err(io::Error::last_os_error());
        }

        // Safety: ConvertSidToStringSidW returns a NUL-terminated LocalAlloc string
        let sid = unsafe {
            let len = (0..).take_while(|&i| *wide.add(i) != 0).count();
            let sid = String::from_utf16_lossy(std::slice::from_raw_parts(wide, len));
            LocalFree(wide.cast());
            sid
        };
        Ok(sid)
    }
}

#[cfg_attr(unix, allow(dead_code))]
fn sanitize(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_alphanumeric() || *c == '-' || *c == '_')
        .collect()
}

/// Name of a per-user runtime file, e.g. `fontresolve-1000.sock`
pub fn runtime_file_name(extension: &str) -> String {
    format!("{}-{}.{}", APP_NAME, user_identity(), extension)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_config_default() {
        let config = AppConfig::default();
        assert!(config.index_files.is_empty());
        assert_eq!(config.prefetch_count, 100);
        assert_eq!(config.worker_threads, 0);
        assert_eq!(config.max_message_len, 4 * 1024 * 1024);
    }

    #[test]
    fn test_app_config_effective_worker_threads() {
        let mut config = AppConfig::default();

        // 0 should resolve to CPU count, capped
        let workers = config.effective_worker_threads();
        assert!(workers >= 1);
        assert!(workers <= crate::server::daemon::MAX_WORKER_THREADS);

        // Explicit value should be used as-is
        config.worker_threads = 12;
        assert_eq!(config.effective_worker_threads(), 12);
    }

    #[test]
    fn test_app_config_partial_json() {
        // Should use defaults for missing fields
        let json = r#"{"index_files": ["/fonts/index.json"], "listener_slots": 2}"#;
        let config: AppConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.index_files, vec![PathBuf::from("/fonts/index.json")]);
        assert_eq!(config.listener_slots, 2);
        assert_eq!(config.prefetch_count, 100);
        assert_eq!(config.log_filter, "info");
    }

    #[test]
    fn test_server_config_io_timeout() {
        let config: AppConfig = serde_json::from_str(r#"{"io_timeout_secs": 5}"#).unwrap();
        assert_eq!(config.server_config().io_timeout, Duration::from_secs(5));

        // Zero would close every connection immediately
        let config: AppConfig = serde_json::from_str(r#"{"io_timeout_secs": 0}"#).unwrap();
        assert_eq!(config.server_config().io_timeout, Duration::from_secs(1));

        assert_eq!(AppConfig::default().server_config().io_timeout, DEFAULT_IO_TIMEOUT);
    }

    #[test]
    fn test_app_config_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        // Missing file means defaults
        assert_eq!(AppConfig::load_from(&path).unwrap(), AppConfig::default());

        let config = AppConfig {
            worker_threads: 3,
            prefetch_path: Some(dir.path().join("lru")),
            ..AppConfig::default()
        };
        config.save_to(&path).unwrap();
        assert_eq!(AppConfig::load_from(&path).unwrap(), config);
    }

    #[test]
    fn test_app_config_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "not json").unwrap();
        assert!(AppConfig::load_from(&path).is_err());
    }

    #[test]
    fn test_runtime_file_name_is_per_user() {
        let name = runtime_file_name("sock");
        assert!(name.starts_with("fontresolve-"));
        assert!(name.ends_with(".sock"));
        assert!(name.contains(&user_identity()));
    }

    #[cfg(windows)]
    #[test]
    fn test_user_identity_is_token_sid() {
        let identity = user_identity();
        assert!(identity.starts_with("S-1-"), "{identity}");
        assert_eq!(identity, user_identity());
    }

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize("CORP-jane doe"), "CORP-janedoe");
    }
}
