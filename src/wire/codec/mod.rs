use std::fmt;

use chrono::DateTime;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::records::{
    AgentDefinition, ComponentDefinition, ConnectionDefinition, DataItemDefinition,
    DeviceDefinition, EpochMillis, RecordData, RecordKind, Sample, Status, StreamKind,
    StreamRecord,
};

pub const STREAM_DATA_TYPE_FIELD: &str = "stream_data_type";
pub const DEVICE_ID_FIELD: &str = "device_id";
pub const API_KEY_FIELD: &str = "api_key";

#[derive(Debug)]
pub enum DecodeError {
    Malformed { reason: String },
    UnknownType { discriminator: String },
    MissingDeviceId { index: usize },
}

impl DecodeError {
    fn malformed(reason: impl Into<String>) -> Self {
        Self::Malformed {
            reason: reason.into(),
        }
    }
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Malformed { reason } => write!(f, "malformed frame: {reason}"),
            Self::UnknownType { discriminator } => {
                write!(f, "unknown stream_data_type '{discriminator}'")
            }
            Self::MissingDeviceId { index } => {
                write!(f, "record #{index} has an empty device_id")
            }
        }
    }
}

impl std::error::Error for DecodeError {}

#[derive(Debug)]
pub enum EncodeError {
    Serialize(serde_json::Error),
    RecordMustBeObject,
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Serialize(source) => write!(f, "failed to serialize record: {source}"),
            Self::RecordMustBeObject => write!(f, "record did not serialize to a JSON object"),
        }
    }
}

impl std::error::Error for EncodeError {}

/// Decodes one frame (a JSON array of record objects) into stream records.
///
/// Every record gets a fresh entry id. The whole frame fails if any element
/// fails, so callers never see a partially decoded frame.
pub fn decode_frame(frame: &[u8]) -> Result<Vec<StreamRecord>, DecodeError> {
    let value: Value = serde_json::from_slice(frame)
        .map_err(|source| DecodeError::malformed(format!("invalid JSON: {source}")))?;

    let Value::Array(elements) = value else {
        return Err(DecodeError::malformed("frame must be a JSON array"));
    };

    elements
        .iter()
        .enumerate()
        .map(|(index, element)| decode_record(index, element))
        .collect()
}

fn decode_record(index: usize, element: &Value) -> Result<StreamRecord, DecodeError> {
    let Value::Object(fields) = element else {
        return Err(DecodeError::malformed(format!(
            "element #{index} must be a JSON object"
        )));
    };

    let kind = parse_discriminator(fields)?;
    let reader = FieldReader { fields };
    let device_id = reader.string(DEVICE_ID_FIELD)?;
    if device_id.is_empty() {
        return Err(DecodeError::MissingDeviceId { index });
    }
    let api_key = reader.string(API_KEY_FIELD)?;

    let data = match kind {
        RecordKind::Connection => RecordData::Connection(ConnectionDefinition {
            device_id,
            address: reader.string("address")?,
            port: reader.port("port")?,
            physical_address: reader.string("physical_address")?,
        }),
        RecordKind::Agent => RecordData::Agent(AgentDefinition {
            device_id,
            instance_id: reader.integer("instance_id")?,
            sender: reader.string("sender")?,
            version: reader.string("version")?,
            buffer_size: reader.integer("buffer_size")?,
            test_indicator: reader.string("test_indicator")?,
            timestamp: reader.timestamp("timestamp")?,
        }),
        RecordKind::Device => RecordData::Device(DeviceDefinition {
            device_id,
            agent_instance_id: reader.integer("agent_instance_id")?,
            id: reader.string("id")?,
            uuid: reader.string("uuid")?,
            name: reader.string("name")?,
            native_name: reader.string("native_name")?,
            sample_interval: reader.float("sample_interval")?,
            sample_rate: reader.float("sample_rate")?,
            iso_841_class: reader.string("iso_841_class")?,
        }),
        RecordKind::Component => RecordData::Component(ComponentDefinition {
            device_id,
            agent_instance_id: reader.integer("agent_instance_id")?,
            id: reader.string("id")?,
            uuid: reader.string("uuid")?,
            name: reader.string("name")?,
            native_name: reader.string("native_name")?,
            component_type: reader.string("type")?,
            parent_id: reader.string("parent_id")?,
        }),
        RecordKind::DataItem => RecordData::DataItem(DataItemDefinition {
            device_id,
            agent_instance_id: reader.integer("agent_instance_id")?,
            id: reader.string("id")?,
            name: reader.string("name")?,
            category: reader.string("category")?,
            data_item_type: reader.string("type")?,
            sub_type: reader.string("sub_type")?,
            units: reader.string("units")?,
            parent_id: reader.string("parent_id")?,
        }),
        RecordKind::Sample => RecordData::Sample(Sample {
            device_id,
            id: reader.string("id")?,
            timestamp: reader.timestamp("timestamp")?,
            sequence: reader.integer("sequence")?,
            cdata: reader.string("cdata")?,
            condition: reader.string("condition")?,
            agent_instance_id: reader.integer("agent_instance_id")?,
            stream_kind: reader.stream_kind("stream_kind")?,
        }),
        RecordKind::Status => RecordData::Status(Status {
            device_id,
            timestamp: reader.timestamp("timestamp")?,
            connected: reader.boolean("connected")?,
            available: reader.boolean("available")?,
        }),
    };

    Ok(StreamRecord::new(api_key, data))
}

fn parse_discriminator(fields: &Map<String, Value>) -> Result<RecordKind, DecodeError> {
    let raw = fields.get(STREAM_DATA_TYPE_FIELD).ok_or_else(|| {
        DecodeError::malformed(format!("missing field '{STREAM_DATA_TYPE_FIELD}'"))
    })?;

    let code = match raw {
        Value::Number(number) => number.as_i64(),
        Value::String(text) => text.trim().parse::<i64>().ok(),
        _ => {
            return Err(DecodeError::malformed(format!(
                "field '{STREAM_DATA_TYPE_FIELD}' must be a number or string"
            )));
        }
    };

    code.and_then(RecordKind::from_code)
        .ok_or_else(|| DecodeError::UnknownType {
            discriminator: match raw {
                Value::String(text) => text.clone(),
                other => other.to_string(),
            },
        })
}

/// Lenient typed access to a record object: absent or null fields read as the
/// zero value, numbers and numeric strings are interchangeable.
struct FieldReader<'a> {
    fields: &'a Map<String, Value>,
}

impl FieldReader<'_> {
    fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field).filter(|value| !value.is_null())
    }

    fn string(&self, field: &str) -> Result<String, DecodeError> {
        match self.get(field) {
            None => Ok(String::new()),
            Some(Value::String(text)) => Ok(text.clone()),
            Some(Value::Number(number)) => Ok(number.to_string()),
            Some(Value::Bool(flag)) => Ok(flag.to_string()),
            Some(_) => Err(invalid_type(field, "string")),
        }
    }

    fn integer(&self, field: &str) -> Result<i64, DecodeError> {
        match self.get(field) {
            None => Ok(0),
            Some(Value::Number(number)) => number
                .as_i64()
                .or_else(|| number.as_f64().and_then(whole_f64_to_i64))
                .ok_or_else(|| invalid_type(field, "integer")),
            Some(Value::String(text)) if text.trim().is_empty() => Ok(0),
            Some(Value::String(text)) => text
                .trim()
                .parse::<i64>()
                .map_err(|_| invalid_type(field, "integer")),
            Some(_) => Err(invalid_type(field, "integer")),
        }
    }

    fn float(&self, field: &str) -> Result<f64, DecodeError> {
        match self.get(field) {
            None => Ok(0.0),
            Some(Value::Number(number)) => number
                .as_f64()
                .filter(|value| value.is_finite())
                .ok_or_else(|| invalid_type(field, "a finite number")),
            Some(Value::String(text)) if text.trim().is_empty() => Ok(0.0),
            Some(Value::String(text)) => text
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|value| value.is_finite())
                .ok_or_else(|| invalid_type(field, "a finite number")),
            Some(_) => Err(invalid_type(field, "number")),
        }
    }

    fn boolean(&self, field: &str) -> Result<bool, DecodeError> {
        match self.get(field) {
            None => Ok(false),
            Some(Value::Bool(flag)) => Ok(*flag),
            Some(Value::Number(number)) => Ok(number.as_i64().is_some_and(|v| v != 0)),
            Some(Value::String(text)) => match text.trim().to_ascii_lowercase().as_str() {
                "" | "false" | "0" => Ok(false),
                "true" | "1" => Ok(true),
                _ => Err(invalid_type(field, "boolean")),
            },
            Some(_) => Err(invalid_type(field, "boolean")),
        }
    }

    fn port(&self, field: &str) -> Result<u16, DecodeError> {
        let raw = self.integer(field)?;
        u16::try_from(raw).map_err(|_| {
            DecodeError::malformed(format!("field '{field}' value {raw} is not a valid port"))
        })
    }

    fn timestamp(&self, field: &str) -> Result<EpochMillis, DecodeError> {
        match self.get(field) {
            Some(Value::String(text)) => {
                let text = text.trim();
                if text.is_empty() {
                    return Ok(0);
                }
                if let Ok(millis) = text.parse::<i64>() {
                    return Ok(millis);
                }
                DateTime::parse_from_rfc3339(text)
                    .map(|parsed| parsed.timestamp_millis())
                    .map_err(|_| invalid_type(field, "epoch milliseconds or RFC 3339 timestamp"))
            }
            _ => self.integer(field),
        }
    }

    fn stream_kind(&self, field: &str) -> Result<StreamKind, DecodeError> {
        match self.get(field) {
            None => Ok(StreamKind::default()),
            Some(Value::String(text)) => {
                StreamKind::parse(text.trim()).ok_or_else(|| invalid_type(field, "stream kind"))
            }
            Some(Value::Number(number)) => match number.as_i64() {
                Some(0) => Ok(StreamKind::Archived),
                Some(1) => Ok(StreamKind::Current),
                _ => Err(invalid_type(field, "stream kind")),
            },
            Some(_) => Err(invalid_type(field, "stream kind")),
        }
    }
}

/// Whole floats inside the i64 range; `i64::MAX as f64` rounds up to 2^63.
fn whole_f64_to_i64(value: f64) -> Option<i64> {
    const LOWER: f64 = i64::MIN as f64;
    const UPPER: f64 = i64::MAX as f64;
    (value.fract() == 0.0 && value >= LOWER && value < UPPER).then_some(value as i64)
}

fn invalid_type(field: &str, expected: &str) -> DecodeError {
    DecodeError::malformed(format!("field '{field}' must be {expected}"))
}

/// Encodes records into one frame. Used to build fixtures and client payloads.
pub fn encode_frame(records: &[StreamRecord]) -> Result<Vec<u8>, EncodeError> {
    let elements = records
        .iter()
        .map(encode_record)
        .collect::<Result<Vec<_>, _>>()?;
    serde_json::to_vec(&Value::Array(elements)).map_err(EncodeError::Serialize)
}

fn encode_record(record: &StreamRecord) -> Result<Value, EncodeError> {
    let mut object = match &record.data {
        RecordData::Connection(value) => to_object(value)?,
        RecordData::Agent(value) => to_object(value)?,
        RecordData::Device(value) => to_object(value)?,
        RecordData::Component(value) => to_object(value)?,
        RecordData::DataItem(value) => to_object(value)?,
        RecordData::Sample(value) => to_object(value)?,
        RecordData::Status(value) => to_object(value)?,
    };
    object.insert(
        STREAM_DATA_TYPE_FIELD.to_owned(),
        Value::String(record.kind().code().to_string()),
    );
    object.insert(
        API_KEY_FIELD.to_owned(),
        Value::String(record.api_key.clone()),
    );
    Ok(Value::Object(object))
}

fn to_object<T: Serialize>(value: &T) -> Result<Map<String, Value>, EncodeError> {
    match serde_json::to_value(value).map_err(EncodeError::Serialize)? {
        Value::Object(object) => Ok(object),
        _ => Err(EncodeError::RecordMustBeObject),
    }
}

#[cfg(test)]
mod tests {
    use crate::records::{
        AgentDefinition, ComponentDefinition, ConnectionDefinition, DataItemDefinition,
        DeviceDefinition, RecordData, RecordKind, Sample, Status, StreamKind, StreamRecord,
    };

    use super::{decode_frame, encode_frame, DecodeError};

    fn decode_single(frame: &str) -> StreamRecord {
        let mut records = decode_frame(frame.as_bytes()).expect("frame should decode");
        assert_eq!(records.len(), 1);
        records.remove(0)
    }

    #[test]
    fn decodes_sample_with_string_discriminator() {
        let record = decode_single(
            r#"[{"stream_data_type":"6","api_key":"k1","device_id":"d1","id":"x1",
                "timestamp":1700000000000,"sequence":1,"cdata":"5.0"}]"#,
        );

        assert_eq!(record.api_key, "k1");
        assert_eq!(
            record.data,
            RecordData::Sample(Sample {
                device_id: "d1".to_owned(),
                id: "x1".to_owned(),
                timestamp: 1_700_000_000_000,
                sequence: 1,
                cdata: "5.0".to_owned(),
                condition: String::new(),
                agent_instance_id: 0,
                stream_kind: StreamKind::Archived,
            })
        );
    }

    #[test]
    fn decodes_every_variant_field_for_field() {
        let frame = r#"[
            {"stream_data_type":1,"device_id":"d1","address":"10.0.0.5","port":5000,"physical_address":"aa:bb"},
            {"stream_data_type":2,"device_id":"d1","instance_id":1234,"sender":"agent-a","version":"1.3",
             "buffer_size":131072,"test_indicator":"false","timestamp":"1700000000000"},
            {"stream_data_type":3,"device_id":"d1","agent_instance_id":1234,"id":"dev","uuid":"u-1",
             "name":"VMC","native_name":"vmc-3axis","sample_interval":"10.5","sample_rate":100,"iso_841_class":"6"},
            {"stream_data_type":4,"device_id":"d1","agent_instance_id":1234,"id":"c1","uuid":"u-2",
             "name":"X","native_name":"x-axis","type":"Linear","parent_id":"dev"},
            {"stream_data_type":5,"device_id":"d1","agent_instance_id":1234,"id":"xpos","name":"Xact",
             "category":"SAMPLE","type":"POSITION","sub_type":"ACTUAL","units":"MILLIMETER","parent_id":"c1"},
            {"stream_data_type":6,"device_id":"d1","id":"xpos","timestamp":"2023-11-14T22:13:20.5Z",
             "sequence":"77","cdata":"12.5","condition":"NORMAL","agent_instance_id":1234,"stream_kind":"current"},
            {"stream_data_type":7,"device_id":"d1","timestamp":1700000000000,"connected":true,"available":"1"}
        ]"#;

        let records = decode_frame(frame.as_bytes()).expect("frame should decode");
        let kinds = records.iter().map(StreamRecord::kind).collect::<Vec<_>>();
        assert_eq!(kinds, RecordKind::ALL.to_vec());

        assert_eq!(
            records[0].data,
            RecordData::Connection(ConnectionDefinition {
                device_id: "d1".to_owned(),
                address: "10.0.0.5".to_owned(),
                port: 5000,
                physical_address: "aa:bb".to_owned(),
            })
        );
        assert_eq!(
            records[1].data,
            RecordData::Agent(AgentDefinition {
                device_id: "d1".to_owned(),
                instance_id: 1234,
                sender: "agent-a".to_owned(),
                version: "1.3".to_owned(),
                buffer_size: 131_072,
                test_indicator: "false".to_owned(),
                timestamp: 1_700_000_000_000,
            })
        );
        assert_eq!(
            records[2].data,
            RecordData::Device(DeviceDefinition {
                device_id: "d1".to_owned(),
                agent_instance_id: 1234,
                id: "dev".to_owned(),
                uuid: "u-1".to_owned(),
                name: "VMC".to_owned(),
                native_name: "vmc-3axis".to_owned(),
                sample_interval: 10.5,
                sample_rate: 100.0,
                iso_841_class: "6".to_owned(),
            })
        );
        assert_eq!(
            records[3].data,
            RecordData::Component(ComponentDefinition {
                device_id: "d1".to_owned(),
                agent_instance_id: 1234,
                id: "c1".to_owned(),
                uuid: "u-2".to_owned(),
                name: "X".to_owned(),
                native_name: "x-axis".to_owned(),
                component_type: "Linear".to_owned(),
                parent_id: "dev".to_owned(),
            })
        );
        assert_eq!(
            records[4].data,
            RecordData::DataItem(DataItemDefinition {
                device_id: "d1".to_owned(),
                agent_instance_id: 1234,
                id: "xpos".to_owned(),
                name: "Xact".to_owned(),
                category: "SAMPLE".to_owned(),
                data_item_type: "POSITION".to_owned(),
                sub_type: "ACTUAL".to_owned(),
                units: "MILLIMETER".to_owned(),
                parent_id: "c1".to_owned(),
            })
        );
        assert_eq!(
            records[5].data,
            RecordData::Sample(Sample {
                device_id: "d1".to_owned(),
                id: "xpos".to_owned(),
                timestamp: 1_700_000_000_500,
                sequence: 77,
                cdata: "12.5".to_owned(),
                condition: "NORMAL".to_owned(),
                agent_instance_id: 1234,
                stream_kind: StreamKind::Current,
            })
        );
        assert_eq!(
            records[6].data,
            RecordData::Status(Status {
                device_id: "d1".to_owned(),
                timestamp: 1_700_000_000_000,
                connected: true,
                available: true,
            })
        );
    }

    #[test]
    fn missing_optional_fields_take_zero_values() {
        let record = decode_single(r#"[{"stream_data_type":7,"device_id":"d9","connected":null}]"#);

        assert_eq!(
            record.data,
            RecordData::Status(Status {
                device_id: "d9".to_owned(),
                timestamp: 0,
                connected: false,
                available: false,
            })
        );
        assert!(record.api_key.is_empty());
    }

    #[test]
    fn unknown_discriminators_are_reported_as_unknown_type() {
        for frame in [
            r#"[{"stream_data_type":"99","device_id":"d1"}]"#,
            r#"[{"stream_data_type":0,"device_id":"d1"}]"#,
            r#"[{"stream_data_type":"SAMPLE","device_id":"d1"}]"#,
        ] {
            let error = decode_frame(frame.as_bytes()).expect_err("unknown type should fail");
            assert!(
                matches!(error, DecodeError::UnknownType { .. }),
                "unexpected error for {frame}: {error}"
            );
        }
    }

    #[test]
    fn structural_problems_are_malformed() {
        for frame in [
            "[{\"stream_data_type\":6,",
            r#"{"stream_data_type":6,"device_id":"d1"}"#,
            r#"[42]"#,
            r#"[{"device_id":"d1"}]"#,
            r#"[{"stream_data_type":6,"device_id":"d1","sequence":"many"}]"#,
            r#"[{"stream_data_type":1,"device_id":"d1","port":70000}]"#,
            r#"[{"stream_data_type":6,"device_id":"d1","timestamp":"yesterday"}]"#,
        ] {
            let error = decode_frame(frame.as_bytes()).expect_err("frame should be malformed");
            assert!(
                matches!(error, DecodeError::Malformed { .. }),
                "unexpected error for {frame}: {error}"
            );
        }
    }

    #[test]
    fn non_finite_floats_are_malformed() {
        for raw in [r#""NaN""#, r#""inf""#, r#""-inf""#, r#""infinity""#] {
            let frame = format!(
                r#"[{{"stream_data_type":3,"device_id":"d1","agent_instance_id":1,"sample_interval":{raw}}}]"#
            );
            let error = decode_frame(frame.as_bytes()).expect_err("non-finite float should fail");
            assert!(
                matches!(error, DecodeError::Malformed { .. }),
                "unexpected error for {raw}: {error}"
            );
        }
    }

    #[test]
    fn integers_outside_i64_range_are_malformed() {
        for raw in ["1e300", "-1e300", "9223372036854775808.0"] {
            let frame = format!(r#"[{{"stream_data_type":6,"device_id":"d1","sequence":{raw}}}]"#);
            let error = decode_frame(frame.as_bytes()).expect_err("out-of-range integer should fail");
            assert!(
                matches!(error, DecodeError::Malformed { .. }),
                "unexpected error for {raw}: {error}"
            );
        }

        let record = decode_single(r#"[{"stream_data_type":6,"device_id":"d1","sequence":42.0}]"#);
        match record.data {
            RecordData::Sample(sample) => assert_eq!(sample.sequence, 42),
            other => panic!("unexpected record {other:?}"),
        }
    }

    #[test]
    fn empty_device_id_is_rejected() {
        let error = decode_frame(br#"[{"stream_data_type":6,"device_id":""}]"#)
            .expect_err("empty device id should fail");
        assert!(matches!(error, DecodeError::MissingDeviceId { index: 0 }));
    }

    #[test]
    fn encoded_frames_decode_back_to_the_same_data() {
        let records = vec![
            StreamRecord::new(
                "k1",
                RecordData::Component(ComponentDefinition {
                    device_id: "d1".to_owned(),
                    id: "c1".to_owned(),
                    component_type: "Rotary".to_owned(),
                    ..ComponentDefinition::default()
                }),
            ),
            StreamRecord::new(
                "k1",
                RecordData::Sample(Sample {
                    device_id: "d1".to_owned(),
                    id: "s1".to_owned(),
                    timestamp: 5,
                    stream_kind: StreamKind::Current,
                    ..Sample::default()
                }),
            ),
        ];

        let frame = encode_frame(&records).expect("frame should encode");
        let decoded = decode_frame(&frame).expect("frame should decode");

        assert_eq!(decoded.len(), 2);
        for (original, decoded) in records.iter().zip(&decoded) {
            assert_eq!(original.data, decoded.data);
            assert_eq!(original.api_key, decoded.api_key);
            assert_ne!(original.entry_id, decoded.entry_id);
        }
    }
}
