use std::collections::BTreeSet;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::records::{
    AgentDefinition, ComponentDefinition, ConnectionDefinition, DataItemDefinition,
    DeviceDefinition, Sample, Status,
};

use super::{
    SampleQuery, SampleWindow, SledMode, StorageBackend, StorageError, sample_supersedes,
    status_supersedes,
};

const CONNECTIONS_TREE: &str = "v1:connections";
const AGENTS_TREE: &str = "v1:agents";
const DEVICES_TREE: &str = "v1:devices";
const COMPONENTS_TREE: &str = "v1:components";
const DATA_ITEMS_TREE: &str = "v1:data_items";
const ARCHIVED_SAMPLES_TREE: &str = "v1:samples:archived";
const CURRENT_SAMPLES_TREE: &str = "v1:samples:current";
const STATUSES_TREE: &str = "v1:statuses";

const ESCAPE: u8 = 0x00;
const ESCAPED_NUL: u8 = 0xFF;
const TEXT_TERMINATOR: [u8; 2] = [ESCAPE, 0x01];
const ORDERED_I64_LEN: usize = 8;

pub struct SledStorage {
    db: sled::Db,
    connections: sled::Tree,
    agents: sled::Tree,
    devices: sled::Tree,
    components: sled::Tree,
    data_items: sled::Tree,
    archived_samples: sled::Tree,
    current_samples: sled::Tree,
    statuses: sled::Tree,
}

impl SledStorage {
    pub fn open(
        data_path: &Path,
        cache_capacity: Option<u64>,
        mode: Option<SledMode>,
    ) -> Result<Self, StorageError> {
        let mut config = sled::Config::new().path(data_path);

        if let Some(cache_capacity) = cache_capacity {
            config = config.cache_capacity(cache_capacity);
        }

        if let Some(mode) = mode {
            config = config.mode(match mode {
                SledMode::LowSpace => sled::Mode::LowSpace,
                SledMode::HighThroughput => sled::Mode::HighThroughput,
            });
        }

        let db = config.open().map_err(StorageError::Sled)?;
        let open_tree = |name: &str| db.open_tree(name).map_err(StorageError::Sled);

        Ok(Self {
            connections: open_tree(CONNECTIONS_TREE)?,
            agents: open_tree(AGENTS_TREE)?,
            devices: open_tree(DEVICES_TREE)?,
            components: open_tree(COMPONENTS_TREE)?,
            data_items: open_tree(DATA_ITEMS_TREE)?,
            archived_samples: open_tree(ARCHIVED_SAMPLES_TREE)?,
            current_samples: open_tree(CURRENT_SAMPLES_TREE)?,
            statuses: open_tree(STATUSES_TREE)?,
            db,
        })
    }
}

/// Big-endian with the sign bit flipped, so byte order matches numeric order.
fn ordered_i64(value: i64) -> [u8; ORDERED_I64_LEN] {
    ((value as u64) ^ (1 << 63)).to_be_bytes()
}

/// Appends `value` with NUL escaped as `00 FF` and a `00 01` terminator, so
/// one text part can never be a prefix of another and byte order still
/// follows string order.
fn push_text(key: &mut Vec<u8>, value: &str) {
    for &byte in value.as_bytes() {
        key.push(byte);
        if byte == ESCAPE {
            key.push(ESCAPED_NUL);
        }
    }
    key.extend_from_slice(&TEXT_TERMINATOR);
}

fn unescape_text(raw: &[u8]) -> String {
    let mut bytes = Vec::with_capacity(raw.len());
    let mut iter = raw.iter().copied().peekable();
    while let Some(byte) = iter.next() {
        bytes.push(byte);
        if byte == ESCAPE && iter.peek() == Some(&ESCAPED_NUL) {
            iter.next();
        }
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

struct KeyBuilder(Vec<u8>);

impl KeyBuilder {
    fn new(device_id: &str) -> Self {
        let mut key = Vec::with_capacity(device_id.len() + 32);
        push_text(&mut key, device_id);
        Self(key)
    }

    fn text(mut self, value: &str) -> Self {
        push_text(&mut self.0, value);
        self
    }

    fn number(mut self, value: i64) -> Self {
        self.0.extend_from_slice(&ordered_i64(value));
        self
    }

    fn port(mut self, value: u16) -> Self {
        self.0.extend_from_slice(&value.to_be_bytes());
        self
    }

    fn build(self) -> Vec<u8> {
        self.0
    }
}

fn encode<T: Serialize>(table: &'static str, row: &T) -> Result<Vec<u8>, StorageError> {
    serde_json::to_vec(row).map_err(|source| StorageError::Serialize { table, source })
}

fn decode<T: DeserializeOwned>(table: &'static str, raw: &[u8]) -> Result<T, StorageError> {
    serde_json::from_slice(raw).map_err(|source| StorageError::Deserialize { table, source })
}

fn insert_if_absent<T: Serialize>(
    tree: &sled::Tree,
    table: &'static str,
    key: Vec<u8>,
    row: &T,
) -> Result<(), StorageError> {
    let value = encode(table, row)?;
    // A compare-and-swap mismatch means the row already exists.
    let _ = tree
        .compare_and_swap(key, None::<&[u8]>, Some(value))
        .map_err(StorageError::Sled)?;
    Ok(())
}

fn upsert_if_newer<T, F>(
    tree: &sled::Tree,
    table: &'static str,
    key: Vec<u8>,
    row: &T,
    supersedes: F,
) -> Result<(), StorageError>
where
    T: Serialize + DeserializeOwned,
    F: Fn(&T, &T) -> bool,
{
    let value = encode(table, row)?;
    let mut decode_error = None;
    tree.fetch_and_update(key, |stored| {
        let Some(stored) = stored else {
            return Some(value.clone());
        };
        match decode::<T>(table, stored) {
            Ok(stored_row) if supersedes(row, &stored_row) => Some(value.clone()),
            Ok(_) => Some(stored.to_vec()),
            Err(error) => {
                decode_error = Some(error);
                Some(stored.to_vec())
            }
        }
    })
    .map_err(StorageError::Sled)?;

    match decode_error {
        Some(error) => Err(error),
        None => Ok(()),
    }
}

fn collect_rows<T, I>(table: &'static str, entries: I) -> Result<Vec<T>, StorageError>
where
    T: DeserializeOwned,
    I: Iterator<Item = sled::Result<(sled::IVec, sled::IVec)>>,
{
    entries
        .map(|entry| {
            let (_, value) = entry.map_err(StorageError::Sled)?;
            decode(table, &value)
        })
        .collect()
}

impl SledStorage {
    fn sample_ids_for_device(&self, device_id: &str) -> Result<BTreeSet<String>, StorageError> {
        let prefix = KeyBuilder::new(device_id).build();
        let mut ids = BTreeSet::new();
        for entry in self.archived_samples.scan_prefix(&prefix) {
            let (key, _) = entry.map_err(StorageError::Sled)?;
            let id_end = key
                .len()
                .saturating_sub(ORDERED_I64_LEN + TEXT_TERMINATOR.len());
            if id_end >= prefix.len() {
                ids.insert(unescape_text(&key[prefix.len()..id_end]));
            }
        }
        Ok(ids)
    }

    fn samples_for_id(
        &self,
        device_id: &str,
        id: &str,
        window: SampleWindow,
    ) -> Result<Vec<Sample>, StorageError> {
        let table = ARCHIVED_SAMPLES_TREE;
        let id_key = |timestamp: i64| KeyBuilder::new(device_id).text(id).number(timestamp).build();

        match window {
            SampleWindow::Range { from, to } => {
                if from > to {
                    return Ok(Vec::new());
                }
                collect_rows(table, self.archived_samples.range(id_key(from)..=id_key(to)))
            }
            SampleWindow::Last(count) => {
                let prefix = KeyBuilder::new(device_id).text(id).build();
                let mut rows: Vec<Sample> =
                    collect_rows(table, self.archived_samples.scan_prefix(prefix).rev().take(count))?;
                rows.reverse();
                Ok(rows)
            }
            SampleWindow::AsOf(instant) => {
                let latest = self
                    .archived_samples
                    .range(id_key(i64::MIN)..=id_key(instant))
                    .next_back();
                collect_rows(table, latest.into_iter())
            }
        }
    }
}

impl StorageBackend for SledStorage {
    fn flush(&self) -> Result<(), StorageError> {
        self.db.flush().map(|_| ()).map_err(StorageError::Sled)
    }

    fn write_connections(&self, rows: &[ConnectionDefinition]) -> Result<(), StorageError> {
        for row in rows {
            let key = KeyBuilder::new(&row.device_id)
                .text(&row.address)
                .port(row.port)
                .build();
            insert_if_absent(&self.connections, CONNECTIONS_TREE, key, row)?;
        }
        Ok(())
    }

    fn write_agents(&self, rows: &[AgentDefinition]) -> Result<(), StorageError> {
        for row in rows {
            let key = KeyBuilder::new(&row.device_id).number(row.instance_id).build();
            insert_if_absent(&self.agents, AGENTS_TREE, key, row)?;
        }
        Ok(())
    }

    fn write_devices(&self, rows: &[DeviceDefinition]) -> Result<(), StorageError> {
        for row in rows {
            let key = KeyBuilder::new(&row.device_id)
                .number(row.agent_instance_id)
                .build();
            insert_if_absent(&self.devices, DEVICES_TREE, key, row)?;
        }
        Ok(())
    }

    fn write_components(&self, rows: &[ComponentDefinition]) -> Result<(), StorageError> {
        for row in rows {
            let key = KeyBuilder::new(&row.device_id)
                .number(row.agent_instance_id)
                .text(&row.id)
                .build();
            insert_if_absent(&self.components, COMPONENTS_TREE, key, row)?;
        }
        Ok(())
    }

    fn write_data_items(&self, rows: &[DataItemDefinition]) -> Result<(), StorageError> {
        for row in rows {
            let key = KeyBuilder::new(&row.device_id)
                .number(row.agent_instance_id)
                .text(&row.id)
                .build();
            insert_if_absent(&self.data_items, DATA_ITEMS_TREE, key, row)?;
        }
        Ok(())
    }

    fn write_archived_samples(&self, rows: &[Sample]) -> Result<(), StorageError> {
        for row in rows {
            let key = KeyBuilder::new(&row.device_id)
                .text(&row.id)
                .number(row.timestamp)
                .build();
            insert_if_absent(&self.archived_samples, ARCHIVED_SAMPLES_TREE, key, row)?;
        }
        Ok(())
    }

    fn upsert_current_samples(&self, rows: &[Sample]) -> Result<(), StorageError> {
        for row in rows {
            let key = KeyBuilder::new(&row.device_id).text(&row.id).build();
            upsert_if_newer(
                &self.current_samples,
                CURRENT_SAMPLES_TREE,
                key,
                row,
                sample_supersedes,
            )?;
        }
        Ok(())
    }

    fn upsert_statuses(&self, rows: &[Status]) -> Result<(), StorageError> {
        for row in rows {
            let key = KeyBuilder::new(&row.device_id).build();
            upsert_if_newer(&self.statuses, STATUSES_TREE, key, row, status_supersedes)?;
        }
        Ok(())
    }

    fn read_agent(&self, device_id: &str) -> Result<Option<AgentDefinition>, StorageError> {
        let prefix = KeyBuilder::new(device_id).build();
        let agents: Vec<AgentDefinition> =
            collect_rows(AGENTS_TREE, self.agents.scan_prefix(prefix))?;
        Ok(agents.into_iter().max_by_key(|agent| agent.timestamp))
    }

    fn read_device(
        &self,
        device_id: &str,
        agent_instance_id: i64,
    ) -> Result<Option<DeviceDefinition>, StorageError> {
        let key = KeyBuilder::new(device_id).number(agent_instance_id).build();
        self.devices
            .get(key)
            .map_err(StorageError::Sled)?
            .map(|raw| decode(DEVICES_TREE, &raw))
            .transpose()
    }

    fn read_components(
        &self,
        device_id: &str,
        agent_instance_id: i64,
    ) -> Result<Vec<ComponentDefinition>, StorageError> {
        let prefix = KeyBuilder::new(device_id).number(agent_instance_id).build();
        collect_rows(COMPONENTS_TREE, self.components.scan_prefix(prefix))
    }

    fn read_data_items(
        &self,
        device_id: &str,
        agent_instance_id: i64,
    ) -> Result<Vec<DataItemDefinition>, StorageError> {
        let prefix = KeyBuilder::new(device_id).number(agent_instance_id).build();
        collect_rows(DATA_ITEMS_TREE, self.data_items.scan_prefix(prefix))
    }

    fn read_samples(&self, query: &SampleQuery) -> Result<Vec<Sample>, StorageError> {
        let ids: BTreeSet<String> = if query.ids.is_empty() {
            self.sample_ids_for_device(&query.device_id)?
        } else {
            query.ids.iter().cloned().collect()
        };

        let mut samples = Vec::new();
        for id in &ids {
            samples.extend(self.samples_for_id(&query.device_id, id, query.window)?);
        }
        Ok(samples)
    }

    fn read_current_samples(
        &self,
        device_id: &str,
        ids: &[String],
    ) -> Result<Vec<Sample>, StorageError> {
        if ids.is_empty() {
            let prefix = KeyBuilder::new(device_id).build();
            return collect_rows(CURRENT_SAMPLES_TREE, self.current_samples.scan_prefix(prefix));
        }

        let unique: BTreeSet<&String> = ids.iter().collect();
        let mut samples = Vec::with_capacity(unique.len());
        for id in unique {
            let key = KeyBuilder::new(device_id).text(id).build();
            if let Some(raw) = self.current_samples.get(key).map_err(StorageError::Sled)? {
                samples.push(decode(CURRENT_SAMPLES_TREE, &raw)?);
            }
        }
        Ok(samples)
    }

    fn read_connections(
        &self,
        device_id: Option<&str>,
    ) -> Result<Vec<ConnectionDefinition>, StorageError> {
        match device_id {
            Some(device_id) => {
                let prefix = KeyBuilder::new(device_id).build();
                collect_rows(CONNECTIONS_TREE, self.connections.scan_prefix(prefix))
            }
            None => collect_rows(CONNECTIONS_TREE, self.connections.iter()),
        }
    }

    fn read_status(&self, device_id: &str) -> Result<Option<Status>, StorageError> {
        let key = KeyBuilder::new(device_id).build();
        self.statuses
            .get(key)
            .map_err(StorageError::Sled)?
            .map(|raw| decode(STATUSES_TREE, &raw))
            .transpose()
    }
}
