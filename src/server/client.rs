//! Blocking client for the font query server

use crate::index::types::FaceDescriptor;
use crate::server::protocol::{
    read_response, write_message, ProtocolError, Request, DEFAULT_MAX_MESSAGE_LEN,
};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Read/write timeout
#[cfg_attr(windows, allow(dead_code))]
const IO_TIMEOUT: Duration = Duration::from_secs(30);

/// How long to wait for a free pipe instance before giving up
#[cfg_attr(unix, allow(dead_code))]
const BUSY_TIMEOUT: Duration = Duration::from_secs(2);

/// Result type for client operations
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors that can occur in client operations
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("font server is not running at {}", .0.display())]
    NotRunning(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Protocol(ProtocolError),
}

impl From<ProtocolError> for ClientError {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::Io(e) => ClientError::Io(e),
            other => ClientError::Protocol(other),
        }
    }
}

/// One connection to the server
///
/// Requests are answered in order, so a connection may be reused for any
/// number of queries.
pub struct FontClient {
    reader: BufReader<Box<dyn Read + Send>>,
    writer: BufWriter<Box<dyn Write + Send>>,
    max_message_len: u32,
}

impl FontClient {
    /// Connect to the endpoint
    pub fn connect(endpoint: &Path) -> ClientResult<Self> {
        let (reader, writer) = platform::connect(endpoint)?;
        Ok(Self {
            reader: BufReader::new(reader),
            writer: BufWriter::new(writer),
            max_message_len: DEFAULT_MAX_MESSAGE_LEN,
        })
    }

    /// Resolve a font name
    pub fn query(&mut self, name: &str) -> ClientResult<Vec<FaceDescriptor>> {
        write_message(&mut self.writer, &Request::query(name), self.max_message_len)?;
        let response = read_response(&mut self.reader, self.max_message_len)?;
        Ok(response.faces)
    }

    /// Report recently loaded font files; the server never replies
    pub fn feedback(&mut self, paths: Vec<String>) -> ClientResult<()> {
        write_message(&mut self.writer, &Request::feedback(paths), self.max_message_len)?;
        Ok(())
    }
}

#[cfg(unix)]
mod platform {
    use super::*;
    use std::io::ErrorKind;
    use std::os::unix::net::UnixStream;

    pub(super) fn connect(
        endpoint: &Path,
    ) -> ClientResult<(Box<dyn Read + Send>, Box<dyn Write + Send>)> {
        let stream = match UnixStream::connect(endpoint) {
            Ok(s) => s,
            Err(e) if matches!(e.kind(), ErrorKind::NotFound | ErrorKind::ConnectionRefused) => {
                return Err(ClientError::NotRunning(endpoint.to_path_buf()));
            }
            Err(e) => return Err(e.into()),
        };

        stream.set_read_timeout(Some(IO_TIMEOUT))?;
        stream.set_write_timeout(Some(IO_TIMEOUT))?;

        let reader = stream.try_clone()?;
        Ok((Box::new(reader), Box::new(stream)))
    }
}

#[cfg(windows)]
mod platform {
    use super::*;
    use std::fs::OpenOptions;
    use std::os::windows::ffi::OsStrExt;
    use std::time::Instant;

    const ERROR_FILE_NOT_FOUND: i32 = 2;
    const ERROR_PIPE_BUSY: i32 = 231;

    #[link(name = "kernel32")]
    unsafe extern "system" {
        fn WaitNamedPipeW(lpNamedPipeName: *const u16, nTimeOut: u32) -> i32;
    }

    pub(super) fn connect(
        endpoint: &Path,
    ) -> ClientResult<(Box<dyn Read + Send>, Box<dyn Write + Send>)> {
        let wide: Vec<u16> = endpoint.as_os_str().encode_wide().chain(Some(0)).collect();
        let deadline = Instant::now() + BUSY_TIMEOUT;

        loop {
            match OpenOptions::new().read(true).write(true).open(endpoint) {
                Ok(pipe) => {
                    let reader = pipe.try_clone()?;
                    return Ok((Box::new(reader), Box::new(pipe)));
                }
                Err(e) if e.raw_os_error() == Some(ERROR_FILE_NOT_FOUND) => {
                    return Err(ClientError::NotRunning(endpoint.to_path_buf()));
                }
                Err(e) if e.raw_os_error() == Some(ERROR_PIPE_BUSY) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(e.into());
                    }
                    // Returns early once an instance frees up; failure just means retry
                    unsafe {
                        WaitNamedPipeW(wide.as_ptr(), remaining.as_millis() as u32);
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_connect_when_not_running() {
        let dir = tempfile::tempdir().unwrap();
        let err = FontClient::connect(&dir.path().join("nobody.sock"))
            .err()
            .unwrap();
        assert!(matches!(err, ClientError::NotRunning(_)));
    }

    #[test]
    fn test_protocol_errors_keep_io_separate() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone");
        assert!(matches!(ClientError::from(ProtocolError::Io(io)), ClientError::Io(_)));
        assert!(matches!(
            ClientError::from(ProtocolError::UnsupportedVersion(7)),
            ClientError::Protocol(_)
        ));
    }
}
