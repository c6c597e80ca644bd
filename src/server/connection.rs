//! Per-connection state machine
//!
//! Each accepted client is driven by one task that owns the stream and both
//! buffers. [`Connection::step`] consumes the current [`ConnectionState`]
//! and performs exactly one unit of work, so every suspension point is an
//! explicit state. Pending reads and writes race the server's cancellation
//! token and the I/O timeout, finishing as [`CloseReason::Cancelled`] or
//! [`CloseReason::Timeout`].

use crate::server::daemon::{FeedbackHandler, RequestHandler};
use crate::server::protocol::{decode_request, encode, ProtocolError, Response};
use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Where a connection is in its request/response cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// Just accepted
    Connected,
    /// Waiting for the 4-byte length of the next request
    ReadLengthPrefix,
    /// Reading a request body of `len` bytes
    ReadMessage { len: u32 },
    /// Resolving a query; a response follows
    ProcessQuery(String),
    /// Handing feedback to its handler; no response follows
    ProcessFeedback(Vec<String>),
    /// Sending the length of the encoded response
    WriteLengthPrefix,
    /// Sending the encoded response body
    WriteMessage,
    Closed(CloseReason),
}

/// Why a connection ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Orderly EOF between requests
    PeerClosed,
    Io,
    /// No progress on a read or write within the I/O timeout
    Timeout,
    MessageTooLarge,
    Malformed,
    UnsupportedVersion,
    /// Request had neither a query nor feedback
    EmptyRequest,
    Cancelled,
}

impl From<&ProtocolError> for CloseReason {
    fn from(err: &ProtocolError) -> Self {
        match err {
            ProtocolError::TooLarge { .. } => CloseReason::MessageTooLarge,
            ProtocolError::Malformed(_) => CloseReason::Malformed,
            ProtocolError::UnsupportedVersion(_) => CloseReason::UnsupportedVersion,
            ProtocolError::Io(_) => CloseReason::Io,
        }
    }
}

/// One client connection and everything it owns
pub struct Connection<S> {
    stream: S,
    read_buf: Vec<u8>,
    write_buf: Vec<u8>,
    max_message_len: u32,
    io_timeout: Duration,
    requests: Arc<dyn RequestHandler>,
    feedback: Arc<dyn FeedbackHandler>,
    cancel: CancellationToken,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(
        stream: S,
        max_message_len: u32,
        io_timeout: Duration,
        requests: Arc<dyn RequestHandler>,
        feedback: Arc<dyn FeedbackHandler>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            stream,
            read_buf: Vec::new(),
            write_buf: Vec::new(),
            max_message_len,
            io_timeout,
            requests,
            feedback,
            cancel,
        }
    }

    /// Drive the connection until it closes
    pub async fn run(mut self) -> CloseReason {
        let mut state = ConnectionState::Connected;
        loop {
            state = self.step(state).await;
            if let ConnectionState::Closed(reason) = state {
                match reason {
                    CloseReason::PeerClosed => trace!("connection closed by peer"),
                    CloseReason::Cancelled => debug!("connection cancelled"),
                    CloseReason::Io => debug!("connection closed after I/O error"),
                    CloseReason::Timeout => debug!("connection timed out"),
                    other => warn!("closing connection: {:?}", other),
                }
                return reason;
            }
        }
    }

    /// Perform one transition
    pub async fn step(&mut self, state: ConnectionState) -> ConnectionState {
        let cancel = self.cancel.clone();
        let limit = self.io_timeout;

        match state {
            ConnectionState::Connected => ConnectionState::ReadLengthPrefix,

            ConnectionState::ReadLengthPrefix => {
                let read = guarded(&cancel, limit, read_length_prefix(&mut self.stream)).await;
                match read {
                    Err(reason) => ConnectionState::Closed(reason),
                    Ok(Ok(None)) => ConnectionState::Closed(CloseReason::PeerClosed),
                    Ok(Err(e)) => {
                        debug!("read error: {}", e);
                        ConnectionState::Closed(CloseReason::Io)
                    }
                    Ok(Ok(Some(len))) if len > self.max_message_len => {
                        warn!("request of {} bytes exceeds {}", len, self.max_message_len);
                        ConnectionState::Closed(CloseReason::MessageTooLarge)
                    }
                    Ok(Ok(Some(len))) => ConnectionState::ReadMessage { len },
                }
            }

            ConnectionState::ReadMessage { len } => {
                // Grows with the bytes that actually arrive
                self.read_buf.clear();
                let mut body = (&mut self.stream).take(u64::from(len));
                let read = guarded(&cancel, limit, body.read_to_end(&mut self.read_buf)).await;
                match read {
                    Err(reason) => return ConnectionState::Closed(reason),
                    Ok(Err(e)) => {
                        debug!("read error mid-message: {}", e);
                        return ConnectionState::Closed(CloseReason::Io);
                    }
                    Ok(Ok(read)) if read < len as usize => {
                        debug!("peer closed after {} of {} bytes", read, len);
                        return ConnectionState::Closed(CloseReason::Io);
                    }
                    Ok(Ok(_)) => {}
                }

                match decode_request(&self.read_buf) {
                    Err(e) => {
                        warn!("rejecting request: {}", e);
                        ConnectionState::Closed(CloseReason::from(&e))
                    }
                    Ok(request) => match (request.feedback, request.query) {
                        (Some(feedback), _) => ConnectionState::ProcessFeedback(feedback.paths),
                        (None, Some(query)) => ConnectionState::ProcessQuery(query),
                        (None, None) => ConnectionState::Closed(CloseReason::EmptyRequest),
                    },
                }
            }

            ConnectionState::ProcessQuery(query) => {
                let faces = self.requests.handle_query(&query);
                match encode(&Response::new(faces)) {
                    Ok(body) if body.len() <= self.max_message_len as usize => {
                        self.write_buf = body;
                        ConnectionState::WriteLengthPrefix
                    }
                    Ok(body) => {
                        warn!("response of {} bytes for {:?} exceeds limit", body.len(), query);
                        ConnectionState::Closed(CloseReason::MessageTooLarge)
                    }
                    Err(e) => {
                        warn!("failed to encode response: {}", e);
                        ConnectionState::Closed(CloseReason::Malformed)
                    }
                }
            }

            ConnectionState::ProcessFeedback(paths) => {
                self.feedback.handle_feedback(&paths);
                ConnectionState::ReadLengthPrefix
            }

            ConnectionState::WriteLengthPrefix => {
                let len = self.write_buf.len() as u32;
                match guarded(&cancel, limit, self.stream.write_u32_le(len)).await {
                    Err(reason) => ConnectionState::Closed(reason),
                    Ok(Err(e)) => {
                        debug!("write error: {}", e);
                        ConnectionState::Closed(CloseReason::Io)
                    }
                    Ok(Ok(())) => ConnectionState::WriteMessage,
                }
            }

            ConnectionState::WriteMessage => {
                let write = guarded(&cancel, limit, async {
                    self.stream.write_all(&self.write_buf).await?;
                    self.stream.flush().await
                })
                .await;
                match write {
                    Err(reason) => ConnectionState::Closed(reason),
                    Ok(Err(e)) => {
                        debug!("write error: {}", e);
                        ConnectionState::Closed(CloseReason::Io)
                    }
                    Ok(Ok(())) => {
                        self.write_buf.clear();
                        ConnectionState::ReadLengthPrefix
                    }
                }
            }

            closed @ ConnectionState::Closed(_) => closed,
        }
    }
}

/// Read a little-endian length; `None` on EOF before its first byte
async fn read_length_prefix<S>(stream: &mut S) -> io::Result<Option<u32>>
where
    S: AsyncRead + Unpin,
{
    let mut prefix = [0u8; 4];
    let mut filled = 0;
    while filled < prefix.len() {
        match stream.read(&mut prefix[filled..]).await? {
            0 if filled == 0 => return Ok(None),
            0 => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("length prefix cut off after {} bytes", filled),
                ));
            }
            n => filled += n,
        }
    }
    Ok(Some(u32::from_le_bytes(prefix)))
}

/// Race an I/O future against shutdown and the I/O timeout
async fn guarded<F, T>(cancel: &CancellationToken, limit: Duration, io: F) -> Result<T, CloseReason>
where
    F: Future<Output = T>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(CloseReason::Cancelled),
        out = tokio::time::timeout(limit, io) => out.map_err(|_| CloseReason::Timeout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::types::FaceDescriptor;
    use crate::server::protocol::{
        decode_response, read_frame_async, write_frame_async, Request, DEFAULT_MAX_MESSAGE_LEN,
    };
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::io::DuplexStream;

    const IO_TIMEOUT: Duration = Duration::from_secs(30);

    struct EchoResolver;

    impl RequestHandler for EchoResolver {
        fn handle_query(&self, query: &str) -> Vec<FaceDescriptor> {
            vec![FaceDescriptor {
                path: format!("{query}.ttf"),
                face_index: 0,
                weight: 400,
                oblique: false,
                ps_outline: false,
                family_names: vec![query.to_string()],
                full_names: Vec::new(),
                postscript_names: Vec::new(),
            }]
        }
    }

    #[derive(Default)]
    struct RecordingFeedback {
        seen: Mutex<Vec<Vec<String>>>,
    }

    impl FeedbackHandler for RecordingFeedback {
        fn handle_feedback(&self, paths: &[String]) {
            self.seen.lock().unwrap().push(paths.to_vec());
        }
    }

    fn spawn_connection(
        max_len: u32,
    ) -> (
        DuplexStream,
        Arc<RecordingFeedback>,
        CancellationToken,
        tokio::task::JoinHandle<CloseReason>,
    ) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let feedback = Arc::new(RecordingFeedback::default());
        let cancel = CancellationToken::new();
        let connection = Connection::new(
            server,
            max_len,
            IO_TIMEOUT,
            Arc::new(EchoResolver),
            feedback.clone(),
            cancel.clone(),
        );
        (client, feedback, cancel, tokio::spawn(connection.run()))
    }

    async fn send(client: &mut DuplexStream, request: &Request) {
        let body = encode(request).unwrap();
        write_frame_async(client, &body, DEFAULT_MAX_MESSAGE_LEN).await.unwrap();
    }

    #[tokio::test]
    async fn test_query_gets_one_response() {
        let (mut client, _, _, task) = spawn_connection(DEFAULT_MAX_MESSAGE_LEN);

        for name in ["Arial", "Times New Roman"] {
            send(&mut client, &Request::query(name)).await;
            let body = read_frame_async(&mut client, DEFAULT_MAX_MESSAGE_LEN).await.unwrap();
            let response = decode_response(&body).unwrap();
            assert_eq!(response.faces.len(), 1);
            assert_eq!(response.faces[0].family_names, vec![name]);
        }

        drop(client);
        assert_eq!(task.await.unwrap(), CloseReason::PeerClosed);
    }

    #[tokio::test]
    async fn test_feedback_is_one_way() {
        let (mut client, feedback, _, task) = spawn_connection(DEFAULT_MAX_MESSAGE_LEN);

        send(&mut client, &Request::feedback(vec!["a.ttf".into(), "b.otf".into()])).await;
        // The next reply must belong to the query, not the feedback
        send(&mut client, &Request::query("Arial")).await;
        let body = read_frame_async(&mut client, DEFAULT_MAX_MESSAGE_LEN).await.unwrap();
        assert_eq!(decode_response(&body).unwrap().faces[0].path, "Arial.ttf");

        drop(client);
        assert_eq!(task.await.unwrap(), CloseReason::PeerClosed);
        assert_eq!(
            *feedback.seen.lock().unwrap(),
            vec![vec!["a.ttf".to_string(), "b.otf".to_string()]]
        );
    }

    #[tokio::test]
    async fn test_feedback_takes_precedence_over_query() {
        let (mut client, feedback, _, task) = spawn_connection(DEFAULT_MAX_MESSAGE_LEN);

        let mut request = Request::feedback(vec!["a.ttf".into()]);
        request.query = Some("Arial".into());
        send(&mut client, &request).await;
        drop(client);

        assert_eq!(task.await.unwrap(), CloseReason::PeerClosed);
        assert_eq!(feedback.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_oversized_prefix_closes_without_reading_body() {
        let (mut client, _, _, task) = spawn_connection(1024);
        client.write_u32_le(1025).await.unwrap();

        assert_eq!(task.await.unwrap(), CloseReason::MessageTooLarge);
        // Server side is gone: reading yields EOF, not a response
        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_version_mismatch_closes() {
        let (mut client, _, _, task) = spawn_connection(DEFAULT_MAX_MESSAGE_LEN);
        let mut request = Request::query("Arial");
        request.version = 2;
        send(&mut client, &request).await;

        assert_eq!(task.await.unwrap(), CloseReason::UnsupportedVersion);
    }

    #[tokio::test]
    async fn test_malformed_and_empty_requests_close() {
        let (mut client, _, _, task) = spawn_connection(DEFAULT_MAX_MESSAGE_LEN);
        write_frame_async(&mut client, b"{nope", DEFAULT_MAX_MESSAGE_LEN).await.unwrap();
        assert_eq!(task.await.unwrap(), CloseReason::Malformed);

        let (mut client, _, _, task) = spawn_connection(DEFAULT_MAX_MESSAGE_LEN);
        write_frame_async(&mut client, br#"{"version":1}"#, DEFAULT_MAX_MESSAGE_LEN)
            .await
            .unwrap();
        assert_eq!(task.await.unwrap(), CloseReason::EmptyRequest);
    }

    #[tokio::test]
    async fn test_eof_mid_message_is_io_error() {
        let (mut client, _, _, task) = spawn_connection(DEFAULT_MAX_MESSAGE_LEN);
        client.write_u32_le(100).await.unwrap();
        client.write_all(b"{\"version\"").await.unwrap();
        drop(client);

        assert_eq!(task.await.unwrap(), CloseReason::Io);
    }

    #[tokio::test]
    async fn test_eof_inside_length_prefix_is_io_error() {
        let (mut client, _, _, task) = spawn_connection(DEFAULT_MAX_MESSAGE_LEN);
        client.write_all(&[0x10, 0x00]).await.unwrap();
        drop(client);

        assert_eq!(task.await.unwrap(), CloseReason::Io);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_body_times_out() {
        let (mut client, _, _, task) = spawn_connection(DEFAULT_MAX_MESSAGE_LEN);
        // Announce a maximal body, send a few bytes, then go quiet
        client.write_u32_le(DEFAULT_MAX_MESSAGE_LEN).await.unwrap();
        client.write_all(b"{\"version\"").await.unwrap();

        let started = tokio::time::Instant::now();
        assert_eq!(task.await.unwrap(), CloseReason::Timeout);
        assert!(started.elapsed() >= IO_TIMEOUT);
        drop(client);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_connection_times_out() {
        let (client, _, _, task) = spawn_connection(DEFAULT_MAX_MESSAGE_LEN);
        assert_eq!(task.await.unwrap(), CloseReason::Timeout);
        drop(client);
    }

    #[tokio::test]
    async fn test_body_buffer_grows_with_received_bytes() {
        let (mut client, server) = tokio::io::duplex(1024);
        let mut connection = Connection::new(
            server,
            DEFAULT_MAX_MESSAGE_LEN,
            IO_TIMEOUT,
            Arc::new(EchoResolver),
            Arc::new(RecordingFeedback::default()),
            CancellationToken::new(),
        );

        client.write_all(&encode(&Request::query("Arial")).unwrap()).await.unwrap();
        drop(client);

        // The announced length is far larger than what arrives
        let next = connection
            .step(ConnectionState::ReadMessage { len: DEFAULT_MAX_MESSAGE_LEN })
            .await;
        assert_eq!(next, ConnectionState::Closed(CloseReason::Io));
        assert!(connection.read_buf.capacity() < DEFAULT_MAX_MESSAGE_LEN as usize);
    }

    #[tokio::test]
    async fn test_byte_at_a_time_request() {
        let (mut client, _, _, task) = spawn_connection(DEFAULT_MAX_MESSAGE_LEN);

        let body = encode(&Request::query("Segoe UI")).unwrap();
        let mut frame = (body.len() as u32).to_le_bytes().to_vec();
        frame.extend_from_slice(&body);
        for byte in frame {
            client.write_all(&[byte]).await.unwrap();
            tokio::task::yield_now().await;
        }

        let body = read_frame_async(&mut client, DEFAULT_MAX_MESSAGE_LEN).await.unwrap();
        assert_eq!(decode_response(&body).unwrap().faces[0].path, "Segoe UI.ttf");

        drop(client);
        assert_eq!(task.await.unwrap(), CloseReason::PeerClosed);
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_pending_read() {
        let (client, _, cancel, task) = spawn_connection(DEFAULT_MAX_MESSAGE_LEN);

        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();

        let reason = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("connection did not observe cancellation")
            .unwrap();
        assert_eq!(reason, CloseReason::Cancelled);
        drop(client);
    }

    #[tokio::test]
    async fn test_step_transitions() {
        let (_client, server) = tokio::io::duplex(1024);
        let mut connection = Connection::new(
            server,
            DEFAULT_MAX_MESSAGE_LEN,
            IO_TIMEOUT,
            Arc::new(EchoResolver),
            Arc::new(RecordingFeedback::default()),
            CancellationToken::new(),
        );

        assert_eq!(
            connection.step(ConnectionState::Connected).await,
            ConnectionState::ReadLengthPrefix
        );
        assert_eq!(
            connection.step(ConnectionState::ProcessQuery("Arial".into())).await,
            ConnectionState::WriteLengthPrefix
        );
        assert_eq!(
            connection.step(ConnectionState::ProcessFeedback(Vec::new())).await,
            ConnectionState::ReadLengthPrefix
        );
        let closed = ConnectionState::Closed(CloseReason::Io);
        assert_eq!(connection.step(closed.clone()).await, closed);
    }
}
