//! Local IPC listener
//!
//! Unix domain sockets on unix, named pipes on Windows. Both are reachable
//! only by the current user: the socket file is created with mode 0600 and
//! pipes reject remote clients and live under a per-user name.

use std::io;
use std::path::{Path, PathBuf};

#[cfg(unix)]
pub use unix::{Listener, Stream};
#[cfg(windows)]
pub use windows::{Listener, Stream};

#[cfg(unix)]
mod unix {
    use super::*;
    use std::fs;
    use std::os::unix::fs::{MetadataExt, PermissionsExt};
    use tokio::net::{UnixListener, UnixStream};
    use tracing::debug;

    pub type Stream = UnixStream;

    /// Bound Unix socket; the socket file is removed on drop
    #[derive(Debug)]
    pub struct Listener {
        inner: UnixListener,
        path: PathBuf,
        /// (device, inode) of the socket file this listener created
        file_id: (u64, u64),
    }

    impl Listener {
        /// Bind the endpoint, replacing a stale socket file
        ///
        /// Fails with `AddrInUse` if another process is accepting on `path`.
        /// Must be called within a tokio runtime.
        pub fn bind(path: &Path) -> io::Result<Self> {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }

            if fs::symlink_metadata(path).is_ok() {
                if std::os::unix::net::UnixStream::connect(path).is_ok() {
                    return Err(io::Error::new(
                        io::ErrorKind::AddrInUse,
                        format!("{} is served by another process", path.display()),
                    ));
                }
                debug!("removing stale socket {}", path.display());
                fs::remove_file(path)?;
            }

            let inner = UnixListener::bind(path)?;
            fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
            let meta = fs::symlink_metadata(path)?;

            Ok(Self {
                inner,
                path: path.to_path_buf(),
                file_id: (meta.dev(), meta.ino()),
            })
        }

        /// Wait for the next client; safe to call from several tasks at once
        pub async fn accept(&self) -> io::Result<Stream> {
            let (stream, _) = self.inner.accept().await?;
            Ok(stream)
        }

        pub fn path(&self) -> &Path {
            &self.path
        }
    }

    impl Drop for Listener {
        fn drop(&mut self) {
            // Leave a socket that was replaced by someone else alone
            let ours = fs::symlink_metadata(&self.path)
                .is_ok_and(|meta| (meta.dev(), meta.ino()) == self.file_id);
            if !ours {
                debug!("socket {} no longer ours, leaving it", self.path.display());
                return;
            }
            if let Err(e) = fs::remove_file(&self.path) {
                debug!("failed to remove socket {}: {}", self.path.display(), e);
            }
        }
    }
}

#[cfg(windows)]
mod windows {
    use super::*;
    use std::sync::Mutex;
    use tokio::net::windows::named_pipe::{NamedPipeServer, ServerOptions};

    pub type Stream = NamedPipeServer;

    /// Named pipe endpoint
    ///
    /// Every accept call owns one pipe instance, so concurrent callers act as
    /// independent listening slots.
    #[derive(Debug)]
    pub struct Listener {
        first: Mutex<Option<NamedPipeServer>>,
        path: PathBuf,
    }

    impl Listener {
        /// Create the first pipe instance, failing if another process owns the name
        ///
        /// Must be called within a tokio runtime.
        pub fn bind(path: &Path) -> io::Result<Self> {
            let first = ServerOptions::new()
                .first_pipe_instance(true)
                .reject_remote_clients(true)
                .create(path)?;
            Ok(Self {
                first: Mutex::new(Some(first)),
                path: path.to_path_buf(),
            })
        }

        pub async fn accept(&self) -> io::Result<Stream> {
            let reserved = self
                .first
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .take();
            let server = match reserved {
                Some(server) => server,
                None => ServerOptions::new()
                    .reject_remote_clients(true)
                    .create(&self.path)?,
            };
            server.connect().await?;
            Ok(server)
        }

        pub fn path(&self) -> &Path {
            &self.path
        }
    }
}
