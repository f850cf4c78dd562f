use std::collections::HashSet;
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rustls::{ServerConfig as TlsServerConfig, ServerConnection, StreamOwned};
use serde::Serialize;
use serde_json::json;

use crate::auth::AuthCache;
use crate::config::ServerConfig;
use crate::ingest::IngestQueue;
use crate::logging::{LogLevel, Logger};
use crate::records::StreamRecord;
use crate::shutdown::ShutdownSignal;
use crate::wire::ack::AckCode;
use crate::wire::codec::decode_frame;
use crate::wire::framing::{FrameScanner, FramingError};

const SESSION_CONTEXT: &str = "wire::session";
const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionSettings {
    pub idle_timeout: Duration,
    pub read_buffer_bytes: usize,
    pub max_frame_bytes: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from(&ServerConfig::default())
    }
}

impl From<&ServerConfig> for SessionSettings {
    fn from(config: &ServerConfig) -> Self {
        Self {
            idle_timeout: Duration::from_millis(config.idle_timeout_ms),
            read_buffer_bytes: config.read_buffer_bytes.max(1),
            max_frame_bytes: config.max_frame_bytes,
        }
    }
}

/// Everything a connection handler shares with the rest of the server.
#[derive(Clone)]
pub struct SessionContext {
    pub auth: Arc<AuthCache>,
    pub queue: Arc<IngestQueue>,
    pub logger: Arc<Logger>,
    pub shutdown: ShutdownSignal,
    pub tls: Option<Arc<TlsServerConfig>>,
    pub settings: SessionSettings,
}

#[derive(Debug)]
pub enum SessionError {
    ConfigureSocket { source: io::Error },
    TlsSetup { source: rustls::Error },
    Handshake { source: io::Error },
    Read { source: io::Error },
    WriteAck { source: io::Error },
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConfigureSocket { source } => {
                write!(f, "failed to configure connection socket: {source}")
            }
            Self::TlsSetup { source } => write!(f, "failed to create TLS session: {source}"),
            Self::Handshake { source } => write!(f, "TLS handshake failed: {source}"),
            Self::Read { source } => write!(f, "socket read failed: {source}"),
            Self::WriteAck { source } => write!(f, "failed to write acknowledgment: {source}"),
        }
    }
}

impl std::error::Error for SessionError {}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    PeerClosed,
    IdleTimeout,
    Shutdown,
    FrameTooLarge,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub frames: u64,
    pub accepted_records: u64,
    pub bad_requests: u64,
    pub auth_rejections: u64,
}

enum ConnectionStream {
    Plain(TcpStream),
    Tls(Box<StreamOwned<ServerConnection, TcpStream>>),
}

impl ConnectionStream {
    fn establish(
        tcp: TcpStream,
        tls: Option<&Arc<TlsServerConfig>>,
    ) -> Result<Self, SessionError> {
        let Some(tls) = tls else {
            return Ok(Self::Plain(tcp));
        };

        let mut tcp = tcp;
        let mut connection = ServerConnection::new(Arc::clone(tls))
            .map_err(|source| SessionError::TlsSetup { source })?;
        while connection.is_handshaking() {
            let (read, written) = connection
                .complete_io(&mut tcp)
                .map_err(|source| SessionError::Handshake { source })?;
            if read == 0 && written == 0 && connection.is_handshaking() {
                return Err(SessionError::Handshake {
                    source: io::Error::from(io::ErrorKind::UnexpectedEof),
                });
            }
        }

        Ok(Self::Tls(Box::new(StreamOwned::new(connection, tcp))))
    }

    fn is_tls(&self) -> bool {
        matches!(self, Self::Tls(_))
    }
}

impl Read for ConnectionStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Plain(stream) => stream.read(buf),
            Self::Tls(stream) => stream.read(buf),
        }
    }
}

impl Write for ConnectionStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Plain(stream) => stream.write(buf),
            Self::Tls(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Plain(stream) => stream.flush(),
            Self::Tls(stream) => stream.flush(),
        }
    }
}

/// Owns one accepted socket from handshake to close.
///
/// Frames are acknowledged in arrival order with exactly one line each. A
/// frame's records reach the ingestion queue only if the whole frame decodes
/// and every (api key, device) pair in it is authenticated.
pub struct ConnectionHandler {
    connection_id: u64,
    peer_addr: SocketAddr,
    context: SessionContext,
    scanner: FrameScanner,
    stats: SessionStats,
}

impl ConnectionHandler {
    pub fn new(connection_id: u64, peer_addr: SocketAddr, context: SessionContext) -> Self {
        let scanner = FrameScanner::new(context.settings.max_frame_bytes);
        Self {
            connection_id,
            peer_addr,
            context,
            scanner,
            stats: SessionStats::default(),
        }
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    pub fn run(&mut self, tcp: TcpStream) -> Result<CloseReason, SessionError> {
        let settings = self.context.settings;
        tcp.set_nodelay(true)
            .and_then(|_| tcp.set_nonblocking(false))
            .and_then(|_| tcp.set_read_timeout(Some(settings.idle_timeout)))
            .and_then(|_| tcp.set_write_timeout(Some(settings.idle_timeout)))
            .map_err(|source| SessionError::ConfigureSocket { source })?;
        let poll_socket = tcp
            .try_clone()
            .map_err(|source| SessionError::ConfigureSocket { source })?;

        let mut stream = ConnectionStream::establish(tcp, self.context.tls.as_ref())?;
        poll_socket
            .set_read_timeout(Some(settings.idle_timeout.min(SHUTDOWN_POLL_INTERVAL)))
            .map_err(|source| SessionError::ConfigureSocket { source })?;
        drop(poll_socket);

        self.context.logger.log(
            LogLevel::Debug,
            Some(SESSION_CONTEXT),
            &format!("connection {} established", self.connection_id),
            Some(json!({
                "peer": self.peer_addr.to_string(),
                "tls": stream.is_tls()
            })),
        );

        let mut read_buffer = vec![0_u8; settings.read_buffer_bytes];
        let mut last_activity = Instant::now();

        loop {
            if self.context.shutdown.is_triggered() {
                return Ok(CloseReason::Shutdown);
            }

            match stream.read(&mut read_buffer) {
                Ok(0) => return Ok(CloseReason::PeerClosed),
                Ok(size) => {
                    last_activity = Instant::now();
                    self.scanner.push(&read_buffer[..size]);
                    if let Some(reason) = self.drain_frames(&mut stream)? {
                        return Ok(reason);
                    }
                }
                Err(error)
                    if matches!(
                        error.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                    ) =>
                {
                    if last_activity.elapsed() >= settings.idle_timeout {
                        return Ok(CloseReason::IdleTimeout);
                    }
                }
                Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
                Err(error)
                    if matches!(
                        error.kind(),
                        io::ErrorKind::UnexpectedEof
                            | io::ErrorKind::ConnectionReset
                            | io::ErrorKind::ConnectionAborted
                    ) =>
                {
                    return Ok(CloseReason::PeerClosed);
                }
                Err(source) => return Err(SessionError::Read { source }),
            }
        }
    }

    fn drain_frames(
        &mut self,
        stream: &mut ConnectionStream,
    ) -> Result<Option<CloseReason>, SessionError> {
        loop {
            match self.scanner.next_frame() {
                Ok(Some(frame)) => {
                    let ack = self.process_frame(&frame);
                    write_ack(stream, ack)?;
                }
                Ok(None) => return Ok(None),
                Err(error @ FramingError::MismatchedDelimiter { .. }) => {
                    self.stats.frames += 1;
                    self.stats.bad_requests += 1;
                    self.context.logger.warn(
                        Some(SESSION_CONTEXT),
                        &format!(
                            "connection {}: {error}; frame rejected",
                            self.connection_id
                        ),
                    );
                    write_ack(stream, AckCode::BadRequest)?;
                }
                Err(error @ FramingError::FrameTooLarge { .. }) => {
                    self.stats.bad_requests += 1;
                    self.context.logger.warn(
                        Some(SESSION_CONTEXT),
                        &format!(
                            "connection {}: {error}; closing connection",
                            self.connection_id
                        ),
                    );
                    write_ack(stream, AckCode::BadRequest)?;
                    return Ok(Some(CloseReason::FrameTooLarge));
                }
            }
        }
    }

    fn process_frame(&mut self, frame: &[u8]) -> AckCode {
        self.stats.frames += 1;

        let records = match decode_frame(frame) {
            Ok(records) => records,
            Err(error) => {
                self.stats.bad_requests += 1;
                self.context.logger.log(
                    LogLevel::Debug,
                    Some(SESSION_CONTEXT),
                    &format!("connection {}: rejected frame", self.connection_id),
                    Some(json!({
                        "reason": error.to_string(),
                        "frame_bytes": frame.len()
                    })),
                );
                return AckCode::BadRequest;
            }
        };

        if let Some(device_id) = self.first_unauthenticated(&records) {
            self.stats.auth_rejections += 1;
            self.context.logger.log(
                LogLevel::Info,
                Some(SESSION_CONTEXT),
                &format!(
                    "connection {}: frame rejected for authentication",
                    self.connection_id
                ),
                Some(json!({
                    "device_id": device_id,
                    "records": records.len()
                })),
            );
            return AckCode::AuthenticationError;
        }

        self.stats.accepted_records += records.len() as u64;
        self.context.queue.enqueue_all(records);
        AckCode::Success
    }

    /// Validates each distinct (api key, device) pair once, stopping at the first rejection.
    fn first_unauthenticated<'a>(&self, records: &'a [StreamRecord]) -> Option<&'a str> {
        let mut checked = HashSet::new();
        records
            .iter()
            .map(|record| (record.api_key.as_str(), record.device_id()))
            .filter(|pair| checked.insert(*pair))
            .find(|(api_key, device_id)| !self.context.auth.validate(api_key, device_id))
            .map(|(_, device_id)| device_id)
    }
}

fn write_ack(stream: &mut ConnectionStream, ack: AckCode) -> Result<(), SessionError> {
    stream
        .write_all(&ack.encode())
        .and_then(|_| stream.flush())
        .map_err(|source| SessionError::WriteAck { source })
}
