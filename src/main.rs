use std::process;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use millstream::auth::{AuthCache, AuthRevalidator};
use millstream::config::AppConfig;
use millstream::ingest::{Batcher, BatcherSettings, BatcherWorker, IngestQueue};
use millstream::logging::{LogLevel, Logger, LoggerConfig};
use millstream::server::{self, ListenerConfig, TelemetryListener};
use millstream::shutdown::ShutdownHooks;
use millstream::storage::StorageFacade;
use millstream::utils::startup_banner::print_startup_banner;
use millstream::utils::timing::measure_execution;
use millstream::wire::session::{SessionContext, SessionSettings};

fn main() {
    print_startup_banner();

    let app_config = load_config_or_exit();
    let logger_config = LoggerConfig::from_app_config(&app_config.logging).unwrap_or_else(|error| {
        eprintln!("{error}. Allowed values: error, warn, info, debug, verbose");
        process::exit(2);
    });
    let logger = Arc::new(Logger::new(logger_config));

    let storage = measure_execution("storage.initialize", Some("main::storage"), &logger, || {
        StorageFacade::initialize(&app_config, &logger)
    })
    .unwrap_or_else(|error| {
        eprintln!("storage initialization error: {error}");
        process::exit(2);
    });

    let auth_cache = Arc::new(
        AuthCache::from_config(&app_config.auth, Arc::clone(&logger)).unwrap_or_else(|error| {
            eprintln!("authentication setup error: {error}");
            process::exit(2);
        }),
    );
    let queue = Arc::new(IngestQueue::new());

    let tls = server::tls::server_config_from(&app_config.server.tls).unwrap_or_else(|error| {
        eprintln!("TLS setup error: {error}");
        process::exit(2);
    });
    let listener_config = ListenerConfig::try_from(&app_config.server).unwrap_or_else(|error| {
        eprintln!("server configuration error: {error}");
        process::exit(2);
    });

    let shutdown_hooks = ShutdownHooks::install().unwrap_or_else(|error| {
        eprintln!("failed to install shutdown hooks: {error}");
        process::exit(2);
    });
    logger.info(
        Some("main::shutdown"),
        "Shutdown hooks installed for SIGINT/SIGTERM",
    );

    let listener = TelemetryListener::bind(
        listener_config,
        SessionContext {
            auth: Arc::clone(&auth_cache),
            queue: Arc::clone(&queue),
            logger: Arc::clone(&logger),
            shutdown: shutdown_hooks.signal(),
            tls: tls.clone(),
            settings: SessionSettings::from(&app_config.server),
        },
    )
    .unwrap_or_else(|error| {
        eprintln!("server startup error: {error}");
        process::exit(2);
    });
    let bound_addr = listener.local_addr().unwrap_or_else(|error| {
        eprintln!("server startup error: failed to read local address: {error}");
        process::exit(2);
    });
    logger.log(
        LogLevel::Info,
        Some("main::server"),
        &format!(
            "{} v{} listening for device agents",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION")
        ),
        Some(json!({
            "bind_address": bound_addr.to_string(),
            "tls_enabled": tls.is_some(),
            "allowed_ips": app_config.server.allowed_ips,
            "idle_timeout_ms": app_config.server.idle_timeout_ms,
            "max_frame_bytes": app_config.server.max_frame_bytes
        })),
    );

    let mut revalidator = AuthRevalidator::new(
        Arc::clone(&auth_cache),
        Duration::from_millis(app_config.auth.revalidate_interval_ms),
        Arc::clone(&logger),
    );
    if let Err(error) = revalidator.start() {
        eprintln!("auth revalidator startup error: {error}");
        process::exit(2);
    }

    let batcher = Arc::new(Batcher::new(
        Arc::clone(&queue),
        storage.backend(),
        Arc::clone(&logger),
        BatcherSettings::from(&app_config.ingest),
    ));
    let mut batcher_worker = BatcherWorker::new(batcher);
    if let Err(error) = batcher_worker.start() {
        eprintln!("batcher startup error: {error}");
        process::exit(2);
    }
    logger.log(
        LogLevel::Info,
        Some("main::ingest"),
        "Batcher started",
        Some(json!({
            "drain_interval_ms": app_config.ingest.drain_interval_ms,
            "max_batch_size": app_config.ingest.max_batch_size,
            "storage_engine": storage.engine().as_str()
        })),
    );

    listener.run();

    logger.info(
        Some("main::shutdown"),
        "Shutdown signal received, stopping background workers",
    );
    if let Err(error) = revalidator.stop() {
        logger.warn(Some("main::shutdown"), &error.to_string());
    }

    match batcher_worker.stop() {
        Ok(report) => logger.log(
            LogLevel::Info,
            Some("main::shutdown"),
            "Final drain completed",
            Some(json!({ "report": report })),
        ),
        Err(error) => logger.warn(Some("main::shutdown"), &error.to_string()),
    }
    if !queue.is_empty() {
        logger.log(
            LogLevel::Warn,
            Some("main::shutdown"),
            "Records left unpersisted after final drain",
            Some(json!({ "queue_len": queue.len() })),
        );
    }

    if let Err(error) = storage.flush() {
        eprintln!("storage flush error during shutdown: {error}");
        process::exit(2);
    }
    logger.log(
        LogLevel::Info,
        Some("main::shutdown"),
        "Shutdown completed",
        Some(json!({ "auth": auth_cache.stats() })),
    );
}

fn load_config_or_exit() -> AppConfig {
    match AppConfig::load_with_discovery(std::env::args().skip(1)) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("configuration error: {error}");
            process::exit(2);
        }
    }
}
