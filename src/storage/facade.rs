use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::json;

use crate::config::AppConfig;
use crate::logging::{LogLevel, Logger};

use super::{
    MemoryStorage, SledMode, SledStorage, StorageBackend, StorageEngine, StorageError,
    expand_home_path,
};

/// Startup selection of the storage backend named by `storage.engine`.
pub struct StorageFacade {
    engine: StorageEngine,
    data_path: Option<PathBuf>,
    backend: Arc<dyn StorageBackend>,
}

impl StorageFacade {
    pub fn initialize(app_config: &AppConfig, logger: &Logger) -> Result<Self, StorageError> {
        let storage = &app_config.storage;
        let Some(engine) = StorageEngine::parse(&storage.engine) else {
            return Err(StorageError::UnsupportedEngine {
                engine: storage.engine.clone(),
            });
        };

        logger.log(
            LogLevel::Info,
            Some("storage::init"),
            "Initializing storage backend",
            Some(json!({
                "engine": engine.as_str(),
                "configured_path": storage.path,
                "sled": {
                    "cache_capacity": storage.sled.cache_capacity,
                    "mode": storage.sled.mode
                }
            })),
        );

        let (backend, data_path): (Arc<dyn StorageBackend>, Option<PathBuf>) = match engine {
            StorageEngine::Memory => {
                logger.warn(
                    Some("storage::init"),
                    "Memory storage selected; persisted telemetry is lost on exit",
                );
                (Arc::new(MemoryStorage::new()), None)
            }
            StorageEngine::Sled => {
                let data_path = expand_home_path(&storage.path)?;
                fs::create_dir_all(&data_path).map_err(|source| StorageError::CreateDataDir {
                    path: data_path.clone(),
                    source,
                })?;

                let mode = SledMode::parse(&storage.sled.mode).ok_or_else(|| {
                    StorageError::InvalidSledMode {
                        mode: storage.sled.mode.clone(),
                    }
                })?;

                let backend = SledStorage::open(
                    &data_path,
                    Some(storage.sled.cache_capacity),
                    Some(mode),
                )?;
                (Arc::new(backend), Some(data_path))
            }
        };

        logger.log(
            LogLevel::Info,
            Some("storage::init"),
            "Storage backend initialized",
            Some(json!({
                "engine": engine.as_str(),
                "durable": engine.is_durable(),
                "resolved_path": data_path.as_ref().map(|path| path.display().to_string()),
            })),
        );

        Ok(Self {
            engine,
            data_path,
            backend,
        })
    }

    pub fn engine(&self) -> StorageEngine {
        self.engine
    }

    pub fn data_path(&self) -> Option<&PathBuf> {
        self.data_path.as_ref()
    }

    pub fn backend(&self) -> Arc<dyn StorageBackend> {
        Arc::clone(&self.backend)
    }

    pub fn flush(&self) -> Result<(), StorageError> {
        self.backend.flush()
    }
}
