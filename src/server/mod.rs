pub mod tls;

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::{IpAddr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde_json::json;

use crate::config;
use crate::logging::LogLevel;
use crate::wire::session::{ConnectionHandler, SessionContext};

const LISTENER_CONTEXT: &str = "server::listener";
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListenerConfig {
    pub host: String,
    pub port: u16,
    /// Empty admits every peer.
    pub allowed_ips: Vec<IpAddr>,
    pub shutdown_grace: Duration,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_owned(),
            port: 8472,
            allowed_ips: Vec::new(),
            shutdown_grace: Duration::from_millis(3_000),
        }
    }
}

impl TryFrom<&config::ServerConfig> for ListenerConfig {
    type Error = ServerError;

    fn try_from(value: &config::ServerConfig) -> Result<Self, Self::Error> {
        let allowed_ips = value
            .allowed_ips
            .iter()
            .map(|raw| {
                raw.trim()
                    .parse::<IpAddr>()
                    .map_err(|_| ServerError::InvalidAllowedIp { value: raw.clone() })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            host: value.host.clone(),
            port: value.port,
            allowed_ips,
            shutdown_grace: Duration::from_millis(value.shutdown_grace_ms),
        })
    }
}

#[derive(Debug)]
pub enum ServerError {
    Bind {
        address: String,
        source: io::Error,
    },
    SetNonBlocking {
        source: io::Error,
    },
    InvalidAllowedIp {
        value: String,
    },
    Accept {
        source: io::Error,
    },
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bind { address, source } => {
                write!(f, "failed to bind TCP listener on {address}: {source}")
            }
            Self::SetNonBlocking { source } => {
                write!(f, "failed to set TCP listener to non-blocking mode: {source}")
            }
            Self::InvalidAllowedIp { value } => {
                write!(f, "server.allowed_ips entry '{value}' is not an IP address")
            }
            Self::Accept { source } => write!(f, "failed to accept TCP connection: {source}"),
        }
    }
}

impl std::error::Error for ServerError {}

/// Accept loop handing every admitted socket to its own connection handler thread.
pub struct TelemetryListener {
    listener: TcpListener,
    config: ListenerConfig,
    context: SessionContext,
    next_connection_id: AtomicU64,
    active_connections: Arc<Mutex<HashMap<u64, TcpStream>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl TelemetryListener {
    pub fn bind(config: ListenerConfig, context: SessionContext) -> Result<Self, ServerError> {
        let address = format!("{}:{}", config.host, config.port);
        let listener = TcpListener::bind(&address).map_err(|source| ServerError::Bind {
            address,
            source,
        })?;
        listener
            .set_nonblocking(true)
            .map_err(|source| ServerError::SetNonBlocking { source })?;

        Ok(Self {
            listener,
            config,
            context,
            next_connection_id: AtomicU64::new(1),
            active_connections: Arc::new(Mutex::new(HashMap::new())),
            workers: Mutex::new(Vec::new()),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn is_allowed(&self, ip: IpAddr) -> bool {
        self.config.allowed_ips.is_empty() || self.config.allowed_ips.contains(&ip)
    }

    pub fn connection_count(&self) -> usize {
        lock(&self.active_connections).len()
    }

    /// Accepts connections until the shutdown signal fires, then waits up to
    /// the grace period for handlers before force-closing the rest.
    pub fn run(&self) {
        let shutdown = self.context.shutdown.clone();
        while !shutdown.is_triggered() {
            match self.try_accept() {
                Ok(true) => {}
                Ok(false) => thread::sleep(ACCEPT_POLL_INTERVAL),
                Err(error) => {
                    self.context.logger.warn(Some(LISTENER_CONTEXT), &error.to_string());
                    thread::sleep(ACCEPT_POLL_INTERVAL);
                }
            }
        }

        self.context.logger.log(
            LogLevel::Info,
            Some(LISTENER_CONTEXT),
            "Listener stopped accepting connections",
            Some(json!({
                "active_connections": self.connection_count(),
                "grace_ms": self.config.shutdown_grace.as_millis() as u64
            })),
        );
        self.close_connections();
    }

    /// Returns `Ok(false)` when no connection was pending.
    pub fn try_accept(&self) -> Result<bool, ServerError> {
        let (stream, peer_addr) = match self.listener.accept() {
            Ok(accepted) => accepted,
            Err(source) if source.kind() == io::ErrorKind::WouldBlock => return Ok(false),
            Err(source) => return Err(ServerError::Accept { source }),
        };

        if !self.is_allowed(peer_addr.ip()) {
            self.context.logger.log(
                LogLevel::Info,
                Some(LISTENER_CONTEXT),
                "Rejected connection from address outside allow-list",
                Some(json!({ "peer": peer_addr.to_string() })),
            );
            let _ = stream.shutdown(Shutdown::Both);
            return Ok(true);
        }

        let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        match stream.try_clone() {
            Ok(registered) => {
                lock(&self.active_connections).insert(connection_id, registered);
            }
            Err(error) => {
                self.context.logger.warn(
                    Some(LISTENER_CONTEXT),
                    &format!(
                        "failed to register connection {connection_id} for shutdown: {error}; closing it"
                    ),
                );
                let _ = stream.shutdown(Shutdown::Both);
                return Ok(true);
            }
        }

        let context = self.context.clone();
        let registry = Arc::clone(&self.active_connections);
        let worker = thread::spawn(move || {
            let logger = Arc::clone(&context.logger);
            let mut handler = ConnectionHandler::new(connection_id, peer_addr, context);
            let outcome = handler.run(stream);
            lock(&registry).remove(&connection_id);

            match outcome {
                Ok(reason) => logger.log(
                    LogLevel::Debug,
                    Some("wire::session"),
                    &format!("connection {connection_id} closed"),
                    Some(json!({
                        "peer": peer_addr.to_string(),
                        "reason": reason,
                        "stats": handler.stats()
                    })),
                ),
                Err(error) => logger.log(
                    LogLevel::Warn,
                    Some("wire::session"),
                    &format!("connection {connection_id} ended with error: {error}"),
                    Some(json!({
                        "peer": peer_addr.to_string(),
                        "stats": handler.stats()
                    })),
                ),
            }
        });

        let mut workers = lock(&self.workers);
        workers.retain(|handle| !handle.is_finished());
        workers.push(worker);
        Ok(true)
    }

    fn close_connections(&self) {
        let deadline = Instant::now() + self.config.shutdown_grace;
        while self.connection_count() > 0 && Instant::now() < deadline {
            thread::sleep(ACCEPT_POLL_INTERVAL);
        }

        let stragglers: Vec<(u64, TcpStream)> = lock(&self.active_connections).drain().collect();
        if !stragglers.is_empty() {
            self.context.logger.warn(
                Some(LISTENER_CONTEXT),
                &format!(
                    "force-closing {} connection(s) after shutdown grace period",
                    stragglers.len()
                ),
            );
        }
        for (_, stream) in stragglers {
            let _ = stream.shutdown(Shutdown::Both);
        }

        let workers: Vec<JoinHandle<()>> = lock(&self.workers).drain(..).collect();
        for worker in workers {
            let _ = worker.join();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use std::io::{BufRead, BufReader, ErrorKind, Read, Write};
    use std::net::{IpAddr, TcpStream};
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    use crate::auth::{AuthAuthority, AuthCache, AuthorityError};
    use crate::config::ServerConfig as AppServerConfig;
    use crate::ingest::{Batcher, BatcherSettings, IngestQueue};
    use crate::logging::{LogLevel, Logger, LoggerConfig};
    use crate::shutdown::ShutdownSignal;
    use crate::storage::{MemoryStorage, SampleQuery, SampleWindow, StorageBackend};
    use crate::wire::ack::AckCode;
    use crate::wire::session::{SessionContext, SessionSettings};

    use super::{ListenerConfig, ServerError, TelemetryListener};

    struct FixedAuthority(bool);

    impl AuthAuthority for FixedAuthority {
        fn authorize(&self, _api_key: &str, _device_id: &str) -> Result<bool, AuthorityError> {
            Ok(self.0)
        }
    }

    fn quiet_logger() -> Arc<Logger> {
        Arc::new(Logger::new(LoggerConfig {
            min_level: LogLevel::Error,
            human_friendly: false,
        }))
    }

    fn context(accept: bool) -> SessionContext {
        let logger = quiet_logger();
        SessionContext {
            auth: Arc::new(AuthCache::new(
                Arc::new(FixedAuthority(accept)),
                Arc::clone(&logger),
            )),
            queue: Arc::new(IngestQueue::new()),
            logger,
            shutdown: ShutdownSignal::new(),
            tls: None,
            settings: SessionSettings {
                idle_timeout: Duration::from_secs(5),
                read_buffer_bytes: 4096,
                max_frame_bytes: 1024 * 1024,
            },
        }
    }

    fn loopback_config(allowed_ips: Vec<IpAddr>) -> ListenerConfig {
        ListenerConfig {
            host: "127.0.0.1".to_owned(),
            port: 0,
            allowed_ips,
            shutdown_grace: Duration::from_millis(200),
        }
    }

    /// Runs the listener on a background thread; returns its address and join handle.
    fn start(listener: TelemetryListener) -> (std::net::SocketAddr, thread::JoinHandle<()>) {
        let address = listener.local_addr().expect("listener address");
        let handle = thread::spawn(move || listener.run());
        (address, handle)
    }

    fn connect(address: std::net::SocketAddr) -> TcpStream {
        let stream = TcpStream::connect(address).expect("connect to listener");
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .expect("client read timeout");
        stream
    }

    fn sample_frame() -> &'static str {
        r#"[{"stream_data_type":"6","api_key":"k1","device_id":"d1","id":"x1","timestamp":1700000000000,"sequence":1,"cdata":"5.0"}]"#
    }

    #[test]
    fn listener_config_parses_allowed_ips() {
        let mut app = AppServerConfig::default();
        app.allowed_ips = vec!["127.0.0.1".to_owned(), " ::1 ".to_owned()];
        let config = ListenerConfig::try_from(&app).expect("valid ips");
        assert_eq!(config.allowed_ips.len(), 2);
        assert_eq!(config.port, 8472);

        app.allowed_ips = vec!["not-an-ip".to_owned()];
        let err = ListenerConfig::try_from(&app).expect_err("invalid ip should fail");
        assert!(matches!(err, ServerError::InvalidAllowedIp { .. }));
    }

    #[test]
    fn tcp_listener_is_non_blocking() {
        let listener = TelemetryListener::bind(loopback_config(Vec::new()), context(true))
            .expect("listener should bind");
        assert!(!listener.try_accept().expect("accept should not fail"));
    }

    #[test]
    fn accepted_sample_is_persisted_after_one_drain() {
        let context = context(true);
        let queue = Arc::clone(&context.queue);
        let shutdown = context.shutdown.clone();
        let listener =
            TelemetryListener::bind(loopback_config(Vec::new()), context).expect("bind");
        let (address, handle) = start(listener);

        let client = connect(address);
        let mut writer = client.try_clone().expect("clone client");
        let mut reader = BufReader::new(client);
        writer.write_all(sample_frame().as_bytes()).expect("write frame");
        let mut line = String::new();
        reader.read_line(&mut line).expect("read ack");
        assert_eq!(AckCode::parse(&line), Some(AckCode::Success));

        let storage = Arc::new(MemoryStorage::new());
        let batcher = Batcher::new(
            queue,
            storage.clone(),
            quiet_logger(),
            BatcherSettings::default(),
        );
        let report = batcher.drain_once();
        assert_eq!(report.persisted, 1);

        let archived = storage
            .read_samples(&SampleQuery::new("d1", SampleWindow::Last(10)))
            .expect("read archived");
        assert_eq!(archived.len(), 1);
        let current = storage
            .read_current_samples("d1", &["x1".to_owned()])
            .expect("read current");
        assert_eq!(current.len(), 1);
        assert_eq!(current[0].cdata, "5.0");

        shutdown.trigger();
        handle.join().expect("listener thread");
    }

    #[test]
    fn rejected_key_leaves_queue_empty() {
        let context = context(false);
        let queue = Arc::clone(&context.queue);
        let shutdown = context.shutdown.clone();
        let listener =
            TelemetryListener::bind(loopback_config(Vec::new()), context).expect("bind");
        let (address, handle) = start(listener);

        let client = connect(address);
        let mut writer = client.try_clone().expect("clone client");
        let mut reader = BufReader::new(client);
        writer.write_all(sample_frame().as_bytes()).expect("write frame");
        let mut line = String::new();
        reader.read_line(&mut line).expect("read ack");
        assert_eq!(AckCode::parse(&line), Some(AckCode::AuthenticationError));
        assert!(queue.is_empty());

        shutdown.trigger();
        handle.join().expect("listener thread");
    }

    #[test]
    fn peers_outside_allow_list_are_closed_immediately() {
        let allowed: IpAddr = "10.255.255.1".parse().expect("ip literal");
        let context = context(true);
        let queue = Arc::clone(&context.queue);
        let shutdown = context.shutdown.clone();
        let listener =
            TelemetryListener::bind(loopback_config(vec![allowed]), context).expect("bind");
        let (address, handle) = start(listener);

        let mut client = connect(address);
        let mut buffer = [0_u8; 8];
        match client.read(&mut buffer) {
            Ok(read) => assert_eq!(read, 0),
            Err(error) => assert_eq!(error.kind(), ErrorKind::ConnectionReset),
        }
        assert!(queue.is_empty());

        shutdown.trigger();
        handle.join().expect("listener thread");
    }

    #[test]
    fn idle_client_is_disconnected_by_the_server() {
        let mut context = context(true);
        context.settings.idle_timeout = Duration::from_millis(150);
        let shutdown = context.shutdown.clone();
        let listener =
            TelemetryListener::bind(loopback_config(Vec::new()), context).expect("bind");
        let (address, handle) = start(listener);

        let mut client = connect(address);
        let started = Instant::now();
        let mut buffer = [0_u8; 8];
        match client.read(&mut buffer) {
            Ok(read) => assert_eq!(read, 0),
            Err(error) => assert_eq!(error.kind(), ErrorKind::ConnectionReset),
        }
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_secs(5));

        shutdown.trigger();
        handle.join().expect("listener thread");
    }

    #[test]
    fn shutdown_closes_open_connections_within_grace() {
        let context = context(true);
        let shutdown = context.shutdown.clone();
        let listener =
            TelemetryListener::bind(loopback_config(Vec::new()), context).expect("bind");
        let (address, handle) = start(listener);

        let mut client = connect(address);
        client.write_all(b"[").expect("start a frame");
        thread::sleep(Duration::from_millis(100));

        let started = Instant::now();
        shutdown.trigger();
        handle.join().expect("listener thread");
        assert!(started.elapsed() < Duration::from_secs(3));

        let mut buffer = [0_u8; 8];
        match client.read(&mut buffer) {
            Ok(read) => assert_eq!(read, 0),
            Err(error) => assert_eq!(error.kind(), ErrorKind::ConnectionReset),
        }
    }
}
