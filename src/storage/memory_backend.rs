use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use crate::records::{
    AgentDefinition, ComponentDefinition, ConnectionDefinition, DataItemDefinition,
    DeviceDefinition, EpochMillis, Sample, Status,
};

use super::backend::select_window;
use super::{
    SampleQuery, StorageBackend, StorageError, sample_supersedes, status_supersedes,
};

#[derive(Default)]
struct Tables {
    connections: BTreeMap<(String, String, u16), ConnectionDefinition>,
    agents: BTreeMap<(String, i64), AgentDefinition>,
    devices: BTreeMap<(String, i64), DeviceDefinition>,
    components: BTreeMap<(String, i64, String), ComponentDefinition>,
    data_items: BTreeMap<(String, i64, String), DataItemDefinition>,
    archived_samples: BTreeMap<(String, String, EpochMillis), Sample>,
    current_samples: BTreeMap<(String, String), Sample>,
    statuses: BTreeMap<String, Status>,
}

/// Volatile backend keeping every table in ordered maps behind one mutex.
#[derive(Default)]
pub struct MemoryStorage {
    tables: Mutex<Tables>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> Result<MutexGuard<'_, Tables>, StorageError> {
        self.tables.lock().map_err(|_| StorageError::Unavailable {
            reason: "memory storage lock poisoned".to_owned(),
        })
    }
}

fn insert_if_absent<K: Ord, V: Clone>(table: &mut BTreeMap<K, V>, key: K, row: &V) {
    table.entry(key).or_insert_with(|| row.clone());
}

impl StorageBackend for MemoryStorage {
    fn flush(&self) -> Result<(), StorageError> {
        Ok(())
    }

    fn write_connections(&self, rows: &[ConnectionDefinition]) -> Result<(), StorageError> {
        let mut tables = self.tables()?;
        for row in rows {
            let key = (row.device_id.clone(), row.address.clone(), row.port);
            insert_if_absent(&mut tables.connections, key, row);
        }
        Ok(())
    }

    fn write_agents(&self, rows: &[AgentDefinition]) -> Result<(), StorageError> {
        let mut tables = self.tables()?;
        for row in rows {
            let key = (row.device_id.clone(), row.instance_id);
            insert_if_absent(&mut tables.agents, key, row);
        }
        Ok(())
    }

    fn write_devices(&self, rows: &[DeviceDefinition]) -> Result<(), StorageError> {
        let mut tables = self.tables()?;
        for row in rows {
            let key = (row.device_id.clone(), row.agent_instance_id);
            insert_if_absent(&mut tables.devices, key, row);
        }
        Ok(())
    }

    fn write_components(&self, rows: &[ComponentDefinition]) -> Result<(), StorageError> {
        let mut tables = self.tables()?;
        for row in rows {
            let key = (row.device_id.clone(), row.agent_instance_id, row.id.clone());
            insert_if_absent(&mut tables.components, key, row);
        }
        Ok(())
    }

    fn write_data_items(&self, rows: &[DataItemDefinition]) -> Result<(), StorageError> {
        let mut tables = self.tables()?;
        for row in rows {
            let key = (row.device_id.clone(), row.agent_instance_id, row.id.clone());
            insert_if_absent(&mut tables.data_items, key, row);
        }
        Ok(())
    }

    fn write_archived_samples(&self, rows: &[Sample]) -> Result<(), StorageError> {
        let mut tables = self.tables()?;
        for row in rows {
            let key = (row.device_id.clone(), row.id.clone(), row.timestamp);
            insert_if_absent(&mut tables.archived_samples, key, row);
        }
        Ok(())
    }

    fn upsert_current_samples(&self, rows: &[Sample]) -> Result<(), StorageError> {
        let mut tables = self.tables()?;
        for row in rows {
            let key = (row.device_id.clone(), row.id.clone());
            let newer = tables
                .current_samples
                .get(&key)
                .map_or(true, |stored| sample_supersedes(row, stored));
            if newer {
                tables.current_samples.insert(key, row.clone());
            }
        }
        Ok(())
    }

    fn upsert_statuses(&self, rows: &[Status]) -> Result<(), StorageError> {
        let mut tables = self.tables()?;
        for row in rows {
            let newer = tables
                .statuses
                .get(&row.device_id)
                .map_or(true, |stored| status_supersedes(row, stored));
            if newer {
                tables.statuses.insert(row.device_id.clone(), row.clone());
            }
        }
        Ok(())
    }

    fn read_agent(&self, device_id: &str) -> Result<Option<AgentDefinition>, StorageError> {
        let tables = self.tables()?;
        Ok(tables
            .agents
            .values()
            .filter(|agent| agent.device_id == device_id)
            .max_by_key(|agent| agent.timestamp)
            .cloned())
    }

    fn read_device(
        &self,
        device_id: &str,
        agent_instance_id: i64,
    ) -> Result<Option<DeviceDefinition>, StorageError> {
        let tables = self.tables()?;
        Ok(tables
            .devices
            .get(&(device_id.to_owned(), agent_instance_id))
            .cloned())
    }

    fn read_components(
        &self,
        device_id: &str,
        agent_instance_id: i64,
    ) -> Result<Vec<ComponentDefinition>, StorageError> {
        let tables = self.tables()?;
        Ok(tables
            .components
            .values()
            .filter(|row| row.device_id == device_id && row.agent_instance_id == agent_instance_id)
            .cloned()
            .collect())
    }

    fn read_data_items(
        &self,
        device_id: &str,
        agent_instance_id: i64,
    ) -> Result<Vec<DataItemDefinition>, StorageError> {
        let tables = self.tables()?;
        Ok(tables
            .data_items
            .values()
            .filter(|row| row.device_id == device_id && row.agent_instance_id == agent_instance_id)
            .cloned()
            .collect())
    }

    fn read_samples(&self, query: &SampleQuery) -> Result<Vec<Sample>, StorageError> {
        let tables = self.tables()?;
        let mut by_id: BTreeMap<&str, Vec<Sample>> = BTreeMap::new();
        for sample in tables
            .archived_samples
            .values()
            .filter(|sample| sample.device_id == query.device_id)
            .filter(|sample| query.ids.is_empty() || query.ids.contains(&sample.id))
        {
            by_id.entry(sample.id.as_str()).or_default().push(sample.clone());
        }

        Ok(by_id
            .into_values()
            .flat_map(|samples| select_window(samples, query.window))
            .collect())
    }

    fn read_current_samples(
        &self,
        device_id: &str,
        ids: &[String],
    ) -> Result<Vec<Sample>, StorageError> {
        let tables = self.tables()?;
        Ok(tables
            .current_samples
            .values()
            .filter(|sample| sample.device_id == device_id)
            .filter(|sample| ids.is_empty() || ids.contains(&sample.id))
            .cloned()
            .collect())
    }

    fn read_connections(
        &self,
        device_id: Option<&str>,
    ) -> Result<Vec<ConnectionDefinition>, StorageError> {
        let tables = self.tables()?;
        Ok(tables
            .connections
            .values()
            .filter(|row| device_id.map_or(true, |device_id| row.device_id == device_id))
            .cloned()
            .collect())
    }

    fn read_status(&self, device_id: &str) -> Result<Option<Status>, StorageError> {
        let tables = self.tables()?;
        Ok(tables.statuses.get(device_id).cloned())
    }
}
