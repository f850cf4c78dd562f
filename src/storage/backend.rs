use crate::records::{
    AgentDefinition, ComponentDefinition, ConnectionDefinition, DataItemDefinition,
    DeviceDefinition, EpochMillis, Sample, Status,
};

use super::StorageError;

/// Which archived samples a [`SampleQuery`] selects for every matching id.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SampleWindow {
    /// Inclusive on both ends.
    Range { from: EpochMillis, to: EpochMillis },
    /// The trailing `n` samples.
    Last(usize),
    /// The newest sample at or before the instant.
    AsOf(EpochMillis),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SampleQuery {
    pub device_id: String,
    /// Empty selects every id of the device.
    pub ids: Vec<String>,
    pub window: SampleWindow,
}

impl SampleQuery {
    pub fn new(device_id: impl Into<String>, window: SampleWindow) -> Self {
        Self {
            device_id: device_id.into(),
            ids: Vec::new(),
            window,
        }
    }

    pub fn with_ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ids = ids.into_iter().map(Into::into).collect();
        self
    }
}

/// Durable read/write target of the ingestion pipeline.
///
/// Definition rows and archived samples are insert-if-absent. Current samples
/// and statuses are upserted only when the incoming row is newer; backends
/// enforce that predicate atomically per key so concurrent batches cannot
/// regress a value. Every write reports success for the whole slice.
pub trait StorageBackend: Send + Sync {
    fn flush(&self) -> Result<(), StorageError>;

    fn write_connections(&self, rows: &[ConnectionDefinition]) -> Result<(), StorageError>;
    fn write_agents(&self, rows: &[AgentDefinition]) -> Result<(), StorageError>;
    fn write_devices(&self, rows: &[DeviceDefinition]) -> Result<(), StorageError>;
    fn write_components(&self, rows: &[ComponentDefinition]) -> Result<(), StorageError>;
    fn write_data_items(&self, rows: &[DataItemDefinition]) -> Result<(), StorageError>;
    fn write_archived_samples(&self, rows: &[Sample]) -> Result<(), StorageError>;
    fn upsert_current_samples(&self, rows: &[Sample]) -> Result<(), StorageError>;
    fn upsert_statuses(&self, rows: &[Status]) -> Result<(), StorageError>;

    fn read_agent(&self, device_id: &str) -> Result<Option<AgentDefinition>, StorageError>;
    fn read_device(
        &self,
        device_id: &str,
        agent_instance_id: i64,
    ) -> Result<Option<DeviceDefinition>, StorageError>;
    fn read_components(
        &self,
        device_id: &str,
        agent_instance_id: i64,
    ) -> Result<Vec<ComponentDefinition>, StorageError>;
    fn read_data_items(
        &self,
        device_id: &str,
        agent_instance_id: i64,
    ) -> Result<Vec<DataItemDefinition>, StorageError>;
    /// Results are ordered by id, then ascending timestamp.
    fn read_samples(&self, query: &SampleQuery) -> Result<Vec<Sample>, StorageError>;
    /// An empty `ids` slice returns every current sample of the device.
    fn read_current_samples(
        &self,
        device_id: &str,
        ids: &[String],
    ) -> Result<Vec<Sample>, StorageError>;
    fn read_connections(
        &self,
        device_id: Option<&str>,
    ) -> Result<Vec<ConnectionDefinition>, StorageError>;
    fn read_status(&self, device_id: &str) -> Result<Option<Status>, StorageError>;
}

/// Update-if-newer predicate for current samples. Sequence breaks timestamp
/// ties so the final state does not depend on arrival order.
pub fn sample_supersedes(incoming: &Sample, stored: &Sample) -> bool {
    (incoming.timestamp, incoming.sequence) > (stored.timestamp, stored.sequence)
}

/// Update-if-newer predicate for device status; equal timestamps let the
/// latest report win.
pub fn status_supersedes(incoming: &Status, stored: &Status) -> bool {
    incoming.timestamp >= stored.timestamp
}

/// Narrows one id's samples, already sorted by ascending timestamp, to a window.
pub(crate) fn select_window(samples: Vec<Sample>, window: SampleWindow) -> Vec<Sample> {
    match window {
        SampleWindow::Range { from, to } => samples
            .into_iter()
            .filter(|sample| sample.timestamp >= from && sample.timestamp <= to)
            .collect(),
        SampleWindow::Last(count) => {
            let skip = samples.len().saturating_sub(count);
            samples.into_iter().skip(skip).collect()
        }
        SampleWindow::AsOf(instant) => samples
            .into_iter()
            .filter(|sample| sample.timestamp <= instant)
            .last()
            .into_iter()
            .collect(),
    }
}
