//! Real-time application logs over a WebSocket.
//!
//! The server sends one protobuf [`Envelope`] per binary message. Reading is
//! blocking and happens on the thread that calls [`LogStreamClient::watch`];
//! any other thread stops it through a [`CloseHandle`].

use crate::config::endpoint_url;
use crate::envelope::Envelope;
use crate::error::{ClientError, Result};
use crate::multipart::{boundary_from_content_type, parse_parts};
use crate::response::Response;
use crate::session::Session;
use std::io::ErrorKind;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};
use std::time::Duration;
use tracing::{debug, info, warn};
use tungstenite::client::IntoClientRequest;
use tungstenite::handshake::HandshakeError;
use tungstenite::http::HeaderValue;
use tungstenite::stream::MaybeTlsStream;
use tungstenite::{Connector, Message, WebSocket};
use url::Url;

type Socket = WebSocket<MaybeTlsStream<TcpStream>>;

/// Lifecycle of a log stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Disconnected,
    Connecting,
    Connected,
    Streaming,
    Closed,
    Error,
}

/// State shared with close handles
struct Shared {
    state: Mutex<StreamState>,
    closed: AtomicBool,
    /// Second handle on the TCP socket, used to unblock a pending read
    tcp: Mutex<Option<TcpStream>>,
    /// Held for the duration of each handler call
    dispatch: Mutex<()>,
    watcher: Mutex<Option<ThreadId>>,
    dropped: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn state(&self) -> StreamState {
        *lock(&self.state)
    }

    fn set_state(&self, state: StreamState) {
        *lock(&self.state) = state;
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(tcp) = lock(&self.tcp).as_ref() {
            // The peer may already be gone
            let _ = tcp.shutdown(Shutdown::Both);
        }

        let watcher = *lock(&self.watcher);
        if watcher != Some(thread::current().id()) {
            // Wait for an in-flight handler call to return
            drop(lock(&self.dispatch));
        }
        self.set_state(StreamState::Closed);
        debug!("log stream closed");
    }
}

/// Stops a stream from any thread
#[derive(Clone)]
pub struct CloseHandle {
    shared: Arc<Shared>,
}

impl CloseHandle {
    /// Stop the stream. Once this returns the handler is not called again.
    pub fn close(&self) {
        self.shared.close();
    }
}

impl std::fmt::Debug for CloseHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloseHandle")
            .field("state", &self.shared.state())
            .finish()
    }
}

/// Client for one application's log stream
pub struct LogStreamClient {
    session: Arc<Session>,
    app_guid: String,
    endpoint: Option<Url>,
    socket: Option<Socket>,
    shared: Arc<Shared>,
}

impl LogStreamClient {
    /// A disconnected client using the session's logging endpoint
    pub fn new(session: Arc<Session>, app_guid: impl Into<String>) -> Self {
        LogStreamClient {
            session,
            app_guid: app_guid.into(),
            endpoint: None,
            socket: None,
            shared: Arc::new(Shared {
                state: Mutex::new(StreamState::Disconnected),
                closed: AtomicBool::new(false),
                tcp: Mutex::new(None),
                dispatch: Mutex::new(()),
                watcher: Mutex::new(None),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Use another logging endpoint than the discovered one
    pub fn with_endpoint(mut self, endpoint: Url) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    /// Current state
    pub fn state(&self) -> StreamState {
        self.shared.state()
    }

    /// Frames that could not be decoded since the client was created
    pub fn dropped_frames(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    /// A handle that can stop [`LogStreamClient::watch`] from another thread
    pub fn close_handle(&self) -> CloseHandle {
        CloseHandle {
            shared: self.shared.clone(),
        }
    }

    /// Stop the stream
    pub fn close(&self) {
        self.shared.close();
    }

    fn logging_endpoint(&self) -> Result<&Url> {
        self.endpoint
            .as_ref()
            .or(self.session.endpoints().logging.as_ref())
            .ok_or_else(|| ClientError::InvalidState("no logging endpoint is known".to_string()))
    }

    /// The WebSocket URL of the stream
    pub fn stream_url(&self) -> Result<Url> {
        let base = self.logging_endpoint()?;
        endpoint_url(base, &format!("apps/{}/stream", self.app_guid))
    }

    /// The HTTP URL of the recent-logs buffer
    pub fn recent_logs_url(&self) -> Result<Url> {
        let mut url = endpoint_url(self.logging_endpoint()?, &format!("apps/{}/recentlogs", self.app_guid))?;
        let scheme = match url.scheme() {
            "wss" => "https",
            "ws" => "http",
            other => other,
        }
        .to_string();
        url.set_scheme(&scheme)
            .map_err(|_| ClientError::RequestBuild(format!("cannot use {scheme} for {url}")))?;
        Ok(url)
    }

    /// Open the stream. Allowed from `Disconnected`, `Closed` and `Error`.
    pub fn connect(&mut self) -> Result<()> {
        match self.state() {
            StreamState::Connecting | StreamState::Connected | StreamState::Streaming => {
                return Err(ClientError::InvalidState(format!(
                    "cannot connect while {:?}",
                    self.state()
                )));
            }
            _ => {}
        }
        self.socket = None;
        self.shared.closed.store(false, Ordering::SeqCst);
        self.shared.set_state(StreamState::Connecting);

        match self.open() {
            Ok(socket) if !self.shared.closed.load(Ordering::SeqCst) => {
                self.socket = Some(socket);
                self.shared.set_state(StreamState::Connected);
                info!(app_guid = %self.app_guid, "log stream connected");
                Ok(())
            }
            Ok(_) => {
                self.release();
                Err(ClientError::InvalidState("stream was closed while connecting".to_string()))
            }
            Err(e) => {
                self.release();
                if self.shared.closed.load(Ordering::SeqCst) {
                    self.shared.set_state(StreamState::Closed);
                } else {
                    self.shared.set_state(StreamState::Error);
                }
                Err(e)
            }
        }
    }

    fn open(&self) -> Result<Socket> {
        let token = self.session.ensure_valid()?;
        let url = self.stream_url()?;
        let addrs = url.socket_addrs(|| None)?;
        let tcp = connect_tcp(&addrs, self.session.config().connect_timeout)?;
        *lock(&self.shared.tcp) = Some(tcp.try_clone()?);
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(ClientError::InvalidState("stream was closed while connecting".to_string()));
        }

        let mut request = url.as_str().into_client_request()?;
        let authorization = HeaderValue::from_str(&format!("bearer {token}"))
            .map_err(|e| ClientError::RequestBuild(e.to_string()))?;
        request.headers_mut().insert("Authorization", authorization);

        let connector = if url.scheme() == "wss" {
            let tls_verify = self.session.config().tls_verify;
            let tls = native_tls::TlsConnector::builder()
                .danger_accept_invalid_certs(!tls_verify)
                .danger_accept_invalid_hostnames(!tls_verify)
                .build()
                .map_err(|e| ClientError::RequestBuild(format!("TLS setup failed: {e}")))?;
            Connector::NativeTls(tls)
        } else {
            Connector::Plain
        };

        debug!(url = %url, "opening log stream");
        match tungstenite::client_tls_with_config(request, tcp, None, Some(connector)) {
            Ok((socket, _)) => Ok(socket),
            Err(HandshakeError::Failure(e)) => Err(e.into()),
            Err(HandshakeError::Interrupted(_)) => {
                Err(ClientError::InvalidState("WebSocket handshake interrupted".to_string()))
            }
        }
    }

    fn release(&mut self) {
        self.socket = None;
        *lock(&self.shared.tcp) = None;
    }

    /// Read envelopes until the stream ends or is closed, passing each one
    /// to `handler` before reading the next.
    ///
    /// Frames that fail to decode are counted and skipped. Returns `Ok(())`
    /// after [`LogStreamClient::close`] or a close from the server.
    pub fn watch<F>(&mut self, mut handler: F) -> Result<()>
    where
        F: FnMut(Envelope),
    {
        if self.state() != StreamState::Connected {
            return Err(ClientError::InvalidState(format!(
                "cannot watch while {:?}",
                self.state()
            )));
        }
        let Some(mut socket) = self.socket.take() else {
            return Err(ClientError::InvalidState("no open socket".to_string()));
        };

        self.shared.set_state(StreamState::Streaming);
        *lock(&self.shared.watcher) = Some(thread::current().id());
        let result = self.read_loop(&mut socket, &mut handler);
        *lock(&self.shared.watcher) = None;
        drop(socket);
        self.release();

        match result {
            Ok(()) => {
                self.shared.set_state(StreamState::Closed);
                Ok(())
            }
            Err(e) => {
                warn!(app_guid = %self.app_guid, error = %e, "log stream failed");
                self.shared.set_state(StreamState::Error);
                Err(e)
            }
        }
    }

    fn read_loop<F>(&self, socket: &mut Socket, handler: &mut F) -> Result<()>
    where
        F: FnMut(Envelope),
    {
        let shared = &self.shared;
        while !shared.closed.load(Ordering::SeqCst) {
            let message = match socket.read() {
                Ok(message) => message,
                Err(_) if shared.closed.load(Ordering::SeqCst) => break,
                Err(tungstenite::Error::ConnectionClosed) => break,
                Err(e) => return Err(e.into()),
            };

            let frame = match message {
                Message::Binary(frame) => frame,
                Message::Close(_) => {
                    debug!("server closed the log stream");
                    break;
                }
                _ => continue,
            };

            match Envelope::from_frame(&frame) {
                Ok(envelope) => {
                    let _dispatch = lock(&shared.dispatch);
                    if shared.closed.load(Ordering::SeqCst) {
                        break;
                    }
                    handler(envelope);
                }
                Err(e) => {
                    let dropped = shared.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    warn!(error = %e, len = frame.len(), dropped, "dropping undecodable log frame");
                }
            }
        }
        Ok(())
    }

    /// Fetch the buffered recent logs, oldest first
    pub fn fetch_recent(&self) -> Result<Vec<Envelope>> {
        let url = self.recent_logs_url()?;
        let response = self
            .session
            .send_authorized(&mut (), |_, token| self.get_recent(&url, token), |_| true)?;
        if !response.is_success() {
            return Err(ClientError::from_response(response));
        }

        let content_type = response
            .headers()
            .get("Content-Type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        let boundary = boundary_from_content_type(content_type).ok_or_else(|| {
            ClientError::InvalidState(format!("recent logs response is not multipart: {content_type:?}"))
        })?;

        let mut envelopes = Vec::new();
        for part in parse_parts(response.raw(), &boundary) {
            match Envelope::from_frame(part) {
                Ok(envelope) => envelopes.push(envelope),
                Err(e) => warn!(error = %e, len = part.len(), "skipping undecodable recent log"),
            }
        }
        envelopes.sort_by_key(|envelope| envelope.time().map(|t| t.unix_nanos()).unwrap_or_default());
        debug!(count = envelopes.len(), "fetched recent logs");
        Ok(envelopes)
    }

    fn get_recent(&self, url: &Url, token: &str) -> Result<Response> {
        let http_response = self
            .session
            .http()
            .get(url.clone())
            .header("Authorization", format!("bearer {token}"))
            .send()?;
        let status = http_response.status().as_u16();
        let headers = http_response.headers().clone();
        let body = http_response.bytes()?;
        debug!(url = %url, status, "recent logs");
        // Protobuf bodies are not JSON; only error bodies are worth parsing
        if (200..300).contains(&status) {
            return Ok(Response::from_binary(status, headers, body.to_vec()));
        }
        Response::from_parts(status, headers, body.to_vec())
    }
}

fn connect_tcp(addrs: &[SocketAddr], timeout: Duration) -> Result<TcpStream> {
    let mut last = None;
    for addr in addrs {
        match TcpStream::connect_timeout(addr, timeout) {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Err(e) => last = Some(e),
        }
    }
    let error = last.unwrap_or_else(|| std::io::Error::new(ErrorKind::NotFound, "host did not resolve"));
    Err(error.into())
}

impl std::fmt::Debug for LogStreamClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogStreamClient")
            .field("app_guid", &self.app_guid)
            .field("state", &self.state())
            .field("dropped_frames", &self.dropped_frames())
            .finish()
    }
}

impl Drop for LogStreamClient {
    fn drop(&mut self) {
        if let Some(tcp) = lock(&self.shared.tcp).take() {
            let _ = tcp.shutdown(Shutdown::Both);
        }
    }
}
