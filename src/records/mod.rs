use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unix epoch milliseconds, the only timestamp representation stored or compared.
pub type EpochMillis = i64;

pub const CONNECTION_DEFINITION_CODE: i64 = 1;
pub const AGENT_DEFINITION_CODE: i64 = 2;
pub const DEVICE_DEFINITION_CODE: i64 = 3;
pub const COMPONENT_DEFINITION_CODE: i64 = 4;
pub const DATA_ITEM_DEFINITION_CODE: i64 = 5;
pub const SAMPLE_CODE: i64 = 6;
pub const STATUS_CODE: i64 = 7;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RecordKind {
    Connection,
    Agent,
    Device,
    Component,
    DataItem,
    Sample,
    Status,
}

impl RecordKind {
    pub const ALL: [RecordKind; 7] = [
        Self::Connection,
        Self::Agent,
        Self::Device,
        Self::Component,
        Self::DataItem,
        Self::Sample,
        Self::Status,
    ];

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            CONNECTION_DEFINITION_CODE => Some(Self::Connection),
            AGENT_DEFINITION_CODE => Some(Self::Agent),
            DEVICE_DEFINITION_CODE => Some(Self::Device),
            COMPONENT_DEFINITION_CODE => Some(Self::Component),
            DATA_ITEM_DEFINITION_CODE => Some(Self::DataItem),
            SAMPLE_CODE => Some(Self::Sample),
            STATUS_CODE => Some(Self::Status),
            _ => None,
        }
    }

    pub fn code(self) -> i64 {
        match self {
            Self::Connection => CONNECTION_DEFINITION_CODE,
            Self::Agent => AGENT_DEFINITION_CODE,
            Self::Device => DEVICE_DEFINITION_CODE,
            Self::Component => COMPONENT_DEFINITION_CODE,
            Self::DataItem => DATA_ITEM_DEFINITION_CODE,
            Self::Sample => SAMPLE_CODE,
            Self::Status => STATUS_CODE,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connection => "connection",
            Self::Agent => "agent",
            Self::Device => "device",
            Self::Component => "component",
            Self::DataItem => "data_item",
            Self::Sample => "sample",
            Self::Status => "status",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a sample is historized (archived) or only refreshes the latest value.
///
/// Archived samples also feed the current-value table; current samples never
/// reach the archive.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    #[default]
    Archived,
    Current,
}

impl StreamKind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "archived" | "archive" | "0" => Some(Self::Archived),
            "current" | "1" => Some(Self::Current),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionDefinition {
    pub device_id: String,
    pub address: String,
    pub port: u16,
    pub physical_address: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentDefinition {
    pub device_id: String,
    pub instance_id: i64,
    pub sender: String,
    pub version: String,
    pub buffer_size: i64,
    pub test_indicator: String,
    pub timestamp: EpochMillis,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceDefinition {
    pub device_id: String,
    pub agent_instance_id: i64,
    pub id: String,
    pub uuid: String,
    pub name: String,
    pub native_name: String,
    pub sample_interval: f64,
    pub sample_rate: f64,
    pub iso_841_class: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentDefinition {
    pub device_id: String,
    pub agent_instance_id: i64,
    pub id: String,
    pub uuid: String,
    pub name: String,
    pub native_name: String,
    #[serde(rename = "type")]
    pub component_type: String,
    pub parent_id: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataItemDefinition {
    pub device_id: String,
    pub agent_instance_id: i64,
    pub id: String,
    pub name: String,
    pub category: String,
    #[serde(rename = "type")]
    pub data_item_type: String,
    pub sub_type: String,
    pub units: String,
    pub parent_id: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sample {
    pub device_id: String,
    pub id: String,
    pub timestamp: EpochMillis,
    pub sequence: i64,
    pub cdata: String,
    pub condition: String,
    pub agent_instance_id: i64,
    pub stream_kind: StreamKind,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub device_id: String,
    pub timestamp: EpochMillis,
    pub connected: bool,
    pub available: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub enum RecordData {
    Connection(ConnectionDefinition),
    Agent(AgentDefinition),
    Device(DeviceDefinition),
    Component(ComponentDefinition),
    DataItem(DataItemDefinition),
    Sample(Sample),
    Status(Status),
}

impl RecordData {
    pub fn kind(&self) -> RecordKind {
        match self {
            Self::Connection(_) => RecordKind::Connection,
            Self::Agent(_) => RecordKind::Agent,
            Self::Device(_) => RecordKind::Device,
            Self::Component(_) => RecordKind::Component,
            Self::DataItem(_) => RecordKind::DataItem,
            Self::Sample(_) => RecordKind::Sample,
            Self::Status(_) => RecordKind::Status,
        }
    }

    pub fn device_id(&self) -> &str {
        match self {
            Self::Connection(value) => &value.device_id,
            Self::Agent(value) => &value.device_id,
            Self::Device(value) => &value.device_id,
            Self::Component(value) => &value.device_id,
            Self::DataItem(value) => &value.device_id,
            Self::Sample(value) => &value.device_id,
            Self::Status(value) => &value.device_id,
        }
    }
}

/// One decoded unit of ingested data.
///
/// `entry_id` only locates the record inside the ingestion queue and is never
/// written to storage. `api_key` travels with every record because a single
/// connection may carry several devices and keys over its lifetime.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamRecord {
    pub entry_id: Uuid,
    pub api_key: String,
    pub data: RecordData,
}

impl StreamRecord {
    pub fn new(api_key: impl Into<String>, data: RecordData) -> Self {
        Self {
            entry_id: Uuid::new_v4(),
            api_key: api_key.into(),
            data,
        }
    }

    pub fn kind(&self) -> RecordKind {
        self.data.kind()
    }

    pub fn device_id(&self) -> &str {
        self.data.device_id()
    }
}

#[cfg(test)]
mod tests {
    use super::{RecordData, RecordKind, Sample, StreamKind, StreamRecord};

    #[test]
    fn kind_codes_are_stable_and_reversible() {
        for kind in RecordKind::ALL {
            assert_eq!(RecordKind::from_code(kind.code()), Some(kind));
        }
        assert_eq!(RecordKind::from_code(6), Some(RecordKind::Sample));
        assert_eq!(RecordKind::from_code(0), None);
        assert_eq!(RecordKind::from_code(8), None);
    }

    #[test]
    fn new_records_get_distinct_entry_ids() {
        let sample = RecordData::Sample(Sample {
            device_id: "d1".to_owned(),
            id: "x1".to_owned(),
            ..Sample::default()
        });
        let first = StreamRecord::new("key", sample.clone());
        let second = StreamRecord::new("key", sample);

        assert_ne!(first.entry_id, second.entry_id);
        assert_eq!(first.device_id(), "d1");
        assert_eq!(first.kind(), RecordKind::Sample);
    }

    #[test]
    fn stream_kind_parses_names_and_numeric_codes() {
        assert_eq!(StreamKind::parse("CURRENT"), Some(StreamKind::Current));
        assert_eq!(StreamKind::parse("archived"), Some(StreamKind::Archived));
        assert_eq!(StreamKind::parse("1"), Some(StreamKind::Current));
        assert_eq!(StreamKind::parse("later"), None);
        assert_eq!(StreamKind::default(), StreamKind::Archived);
    }
}
