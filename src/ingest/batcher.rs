use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

use crate::config::IngestConfig;
use crate::logging::{LogLevel, Logger};
use crate::records::{RecordData, RecordKind, Sample, StreamKind, StreamRecord};
use crate::storage::{StorageBackend, StorageError};
use crate::utils::timing::{measure_execution, sleep_unless_stopped};

use super::IngestQueue;

const BATCHER_CONTEXT: &str = "ingest::batcher";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BatcherSettings {
    pub drain_interval: Duration,
    pub max_batch_size: usize,
    pub queue_warn_threshold: usize,
}

impl Default for BatcherSettings {
    fn default() -> Self {
        Self::from(&IngestConfig::default())
    }
}

impl From<&IngestConfig> for BatcherSettings {
    fn from(config: &IngestConfig) -> Self {
        Self {
            drain_interval: Duration::from_millis(config.drain_interval_ms),
            max_batch_size: config.max_batch_size.max(1),
            queue_warn_threshold: config.queue_warn_threshold,
        }
    }
}

/// Outcome of one drain cycle.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub snapshot: usize,
    pub persisted: usize,
    pub failed_kinds: Vec<String>,
    pub queue_len: usize,
}

impl DrainReport {
    pub fn is_clean(&self) -> bool {
        self.failed_kinds.is_empty()
    }
}

/// Moves queued records into the storage backend, one group per record kind.
pub struct Batcher {
    queue: Arc<IngestQueue>,
    backend: Arc<dyn StorageBackend>,
    logger: Arc<Logger>,
    settings: BatcherSettings,
}

impl Batcher {
    pub fn new(
        queue: Arc<IngestQueue>,
        backend: Arc<dyn StorageBackend>,
        logger: Arc<Logger>,
        settings: BatcherSettings,
    ) -> Self {
        Self {
            queue,
            backend,
            logger,
            settings,
        }
    }

    pub fn settings(&self) -> BatcherSettings {
        self.settings
    }

    /// Snapshots the oldest records of every kind (`max_batch_size` per kind),
    /// writes each kind group, and removes the groups that were persisted.
    /// Failed groups stay queued for the next cycle.
    pub fn drain_once(&self) -> DrainReport {
        let snapshot = self.queue.snapshot_per_kind(self.settings.max_batch_size);
        if snapshot.is_empty() {
            return DrainReport {
                queue_len: self.queue.len(),
                ..DrainReport::default()
            };
        }

        let snapshot_len = snapshot.len();
        let (persisted_ids, failed_kinds) =
            measure_execution("ingest.drain", Some(BATCHER_CONTEXT), &self.logger, || {
                self.persist_groups(snapshot)
            });

        let persisted = self.queue.remove(&persisted_ids);
        let report = DrainReport {
            snapshot: snapshot_len,
            persisted,
            failed_kinds,
            queue_len: self.queue.len(),
        };

        self.logger.log(
            if report.is_clean() {
                LogLevel::Debug
            } else {
                LogLevel::Warn
            },
            Some(BATCHER_CONTEXT),
            "Drain cycle finished",
            Some(json!({ "report": report })),
        );

        if report.queue_len > self.settings.queue_warn_threshold {
            self.logger.log(
                LogLevel::Warn,
                Some(BATCHER_CONTEXT),
                "Ingestion queue above warning threshold",
                Some(json!({
                    "queue_len": report.queue_len,
                    "threshold": self.settings.queue_warn_threshold
                })),
            );
        }

        report
    }

    fn persist_groups(&self, snapshot: Vec<StreamRecord>) -> (HashSet<Uuid>, Vec<String>) {
        let mut groups: BTreeMap<RecordKind, Vec<StreamRecord>> = BTreeMap::new();
        for record in snapshot {
            groups.entry(record.kind()).or_default().push(record);
        }

        let mut persisted_ids = HashSet::new();
        let mut failed_kinds = Vec::new();
        for (kind, records) in groups {
            match self.write_group(kind, &records) {
                Ok(()) => persisted_ids.extend(records.iter().map(|record| record.entry_id)),
                Err(error) => {
                    self.logger.log(
                        LogLevel::Error,
                        Some(BATCHER_CONTEXT),
                        "Storage write failed; group kept for retry",
                        Some(json!({
                            "kind": kind.as_str(),
                            "records": records.len(),
                            "error": error.to_string()
                        })),
                    );
                    failed_kinds.push(kind.as_str().to_owned());
                }
            }
        }

        (persisted_ids, failed_kinds)
    }

    fn write_group(&self, kind: RecordKind, records: &[StreamRecord]) -> Result<(), StorageError> {
        macro_rules! rows_of {
            ($variant:ident) => {
                records
                    .iter()
                    .filter_map(|record| match &record.data {
                        RecordData::$variant(row) => Some(row.clone()),
                        _ => None,
                    })
                    .collect::<Vec<_>>()
            };
        }

        match kind {
            RecordKind::Connection => self.backend.write_connections(&rows_of!(Connection)),
            RecordKind::Agent => self.backend.write_agents(&rows_of!(Agent)),
            RecordKind::Device => self.backend.write_devices(&rows_of!(Device)),
            RecordKind::Component => self.backend.write_components(&rows_of!(Component)),
            RecordKind::DataItem => self.backend.write_data_items(&rows_of!(DataItem)),
            RecordKind::Status => self.backend.upsert_statuses(&rows_of!(Status)),
            RecordKind::Sample => {
                let (archived, current) = split_samples(rows_of!(Sample));
                if !archived.is_empty() {
                    self.backend.write_archived_samples(&archived)?;
                }
                self.backend.upsert_current_samples(&current)
            }
        }
    }
}

/// Splits a sample group into the archive sub-batch and one current-value
/// candidate per (device_id, id): the greatest (timestamp, sequence) of either kind.
fn split_samples(samples: Vec<Sample>) -> (Vec<Sample>, Vec<Sample>) {
    let mut current: HashMap<(String, String), Sample> = HashMap::new();
    let mut archived = Vec::new();

    for sample in samples {
        let key = (sample.device_id.clone(), sample.id.clone());
        let newer = current
            .get(&key)
            .map_or(true, |best| crate::storage::sample_supersedes(&sample, best));
        if newer {
            current.insert(key, sample.clone());
        }
        if sample.stream_kind == StreamKind::Archived {
            archived.push(sample);
        }
    }

    (archived, current.into_values().collect())
}

#[derive(Debug)]
pub enum BatcherError {
    AlreadyRunning,
    JoinFailed,
}

impl fmt::Display for BatcherError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyRunning => write!(f, "batcher worker is already running"),
            Self::JoinFailed => write!(f, "batcher worker thread join failed"),
        }
    }
}

impl std::error::Error for BatcherError {}

/// Background thread calling [`Batcher::drain_once`] every drain interval.
/// Stopping runs one last drain on the caller's thread.
pub struct BatcherWorker {
    batcher: Arc<Batcher>,
    stop_signal: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl BatcherWorker {
    pub fn new(batcher: Arc<Batcher>) -> Self {
        Self {
            batcher,
            stop_signal: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }

    pub fn start(&mut self) -> Result<(), BatcherError> {
        if self.worker.is_some() {
            return Err(BatcherError::AlreadyRunning);
        }

        self.stop_signal.store(false, Ordering::SeqCst);
        let stop_signal = Arc::clone(&self.stop_signal);
        let batcher = Arc::clone(&self.batcher);
        let interval = batcher.settings().drain_interval;

        self.worker = Some(thread::spawn(move || {
            while sleep_unless_stopped(&stop_signal, interval) {
                batcher.drain_once();
            }
        }));

        Ok(())
    }

    pub fn stop(&mut self) -> Result<DrainReport, BatcherError> {
        self.stop_signal.store(true, Ordering::SeqCst);

        if let Some(handle) = self.worker.take() {
            handle.join().map_err(|_| BatcherError::JoinFailed)?;
        }

        Ok(self.batcher.drain_once())
    }
}

impl Drop for BatcherWorker {
    fn drop(&mut self) {
        self.stop_signal.store(true, Ordering::SeqCst);
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}
