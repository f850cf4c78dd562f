use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use toml::Value;

pub const DEFAULT_CONFIG_FILE: &str = "millstream.toml";
pub const CONFIG_PATH_ARG: &str = "--config";

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub ingest: IngestConfig,
    pub storage: StorageConfig,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub human_friendly: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            human_friendly: false,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub allowed_ips: Vec<String>,
    pub idle_timeout_ms: u64,
    pub read_buffer_bytes: usize,
    pub max_frame_bytes: usize,
    pub shutdown_grace_ms: u64,
    pub tls: TlsConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_owned(),
            port: 8472,
            allowed_ips: Vec::new(),
            idle_timeout_ms: 60_000,
            read_buffer_bytes: 8 * 1024,
            max_frame_bytes: 8 * 1024 * 1024,
            shutdown_grace_ms: 3_000,
            tls: TlsConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct TlsConfig {
    pub enabled: bool,
    pub cert_path: String,
    pub key_path: String,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct AuthConfig {
    /// Empty disables authentication entirely.
    pub authority_url: String,
    pub revalidate_interval_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            authority_url: String::new(),
            revalidate_interval_ms: 300_000,
            request_timeout_ms: 5_000,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct IngestConfig {
    pub drain_interval_ms: u64,
    pub max_batch_size: usize,
    pub queue_warn_threshold: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            drain_interval_ms: 500,
            max_batch_size: 5_000,
            queue_warn_threshold: 100_000,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct StorageConfig {
    pub engine: String,
    pub path: String,
    pub sled: SledConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            engine: "sled".to_owned(),
            path: "~/.millstream/data".to_owned(),
            sled: SledConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct SledConfig {
    pub cache_capacity: u64,
    /// `low_space` or `high_throughput`.
    pub mode: String,
}

impl Default for SledConfig {
    fn default() -> Self {
        Self {
            cache_capacity: 256 * 1024 * 1024,
            mode: "high_throughput".to_owned(),
        }
    }
}

impl AppConfig {
    /// Loads `--config <path>` (first argument pair) or `millstream.toml` from the
    /// working directory when present, then applies `--section.key value` overrides.
    pub fn load_with_discovery(args: impl IntoIterator<Item = String>) -> Result<Self, ConfigError> {
        let mut args = args.into_iter().peekable();
        let explicit_path = if args.peek().map(String::as_str) == Some(CONFIG_PATH_ARG) {
            args.next();
            let path = args.next().ok_or_else(|| ConfigError::MissingValueForArg {
                key: CONFIG_PATH_ARG.trim_start_matches("--").to_owned(),
            })?;
            Some(PathBuf::from(path))
        } else {
            None
        };

        match explicit_path {
            Some(path) => Self::load_from_toml_with_args(path, args),
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::load_from_toml_with_args(DEFAULT_CONFIG_FILE, args)
            }
            None => Self::load_from_str_with_args("", "<defaults>", args),
        }
    }

    pub fn load_from_toml_with_args(
        path: impl AsRef<Path>,
        args: impl IntoIterator<Item = String>,
    ) -> Result<Self, ConfigError> {
        let path_label = path.as_ref().to_string_lossy().to_string();
        let toml_content = fs::read_to_string(path.as_ref()).map_err(|source| ConfigError::Io {
            path: path_label.clone(),
            source,
        })?;

        Self::load_from_str_with_args(&toml_content, &path_label, args)
    }

    fn load_from_str_with_args(
        toml_content: &str,
        path_label: &str,
        args: impl IntoIterator<Item = String>,
    ) -> Result<Self, ConfigError> {
        let file_table: toml::Table =
            toml_content
                .parse()
                .map_err(|source| ConfigError::TomlParse {
                    path: path_label.to_owned(),
                    source,
                })?;

        let mut root_value =
            Value::try_from(AppConfig::default()).map_err(ConfigError::SerializeDefaults)?;
        merge_values(&mut root_value, Value::Table(file_table));

        let overrides = parse_cli_overrides(args)?;
        for (key_path, raw_value) in overrides {
            apply_override(&mut root_value, &key_path, &raw_value)?;
        }

        let config: Self = root_value.try_into().map_err(ConfigError::Deserialize)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("server.idle_timeout_ms", self.server.idle_timeout_ms as u128),
            ("server.read_buffer_bytes", self.server.read_buffer_bytes as u128),
            ("server.max_frame_bytes", self.server.max_frame_bytes as u128),
            ("auth.revalidate_interval_ms", self.auth.revalidate_interval_ms as u128),
            ("auth.request_timeout_ms", self.auth.request_timeout_ms as u128),
            ("ingest.drain_interval_ms", self.ingest.drain_interval_ms as u128),
            ("ingest.max_batch_size", self.ingest.max_batch_size as u128),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    key: key.to_owned(),
                    reason: "must be greater than zero".to_owned(),
                });
            }
        }

        if self.server.tls.enabled {
            for (key, value) in [
                ("server.tls.cert_path", &self.server.tls.cert_path),
                ("server.tls.key_path", &self.server.tls.key_path),
            ] {
                if value.trim().is_empty() {
                    return Err(ConfigError::InvalidValue {
                        key: key.to_owned(),
                        reason: "required when server.tls.enabled is true".to_owned(),
                    });
                }
            }
        }

        Ok(())
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io {
        path: String,
        source: std::io::Error,
    },
    TomlParse {
        path: String,
        source: toml::de::Error,
    },
    SerializeDefaults(toml::ser::Error),
    Deserialize(toml::de::Error),
    MissingValueForArg {
        key: String,
    },
    InvalidArgFormat {
        arg: String,
    },
    InvalidPath {
        key: String,
    },
    UnknownPath {
        key: String,
    },
    UnsupportedOverrideType {
        key: String,
    },
    InvalidValueForType {
        key: String,
        expected: &'static str,
        value: String,
    },
    InvalidValue {
        key: String,
        reason: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, source } => {
                write!(f, "failed to read config file '{path}': {source}")
            }
            Self::TomlParse { path, source } => {
                write!(f, "failed to parse TOML config '{path}': {source}")
            }
            Self::SerializeDefaults(source) => {
                write!(f, "failed to render default config: {source}")
            }
            Self::Deserialize(source) => write!(f, "failed to deserialize config: {source}"),
            Self::MissingValueForArg { key } => {
                write!(f, "missing value for CLI argument '--{key}'")
            }
            Self::InvalidArgFormat { arg } => write!(
                f,
                "invalid CLI argument format '{arg}', expected '--section.key value'"
            ),
            Self::InvalidPath { key } => write!(f, "invalid override key path '{key}'"),
            Self::UnknownPath { key } => write!(f, "unknown override key path '{key}'"),
            Self::UnsupportedOverrideType { key } => {
                write!(f, "override not supported for complex TOML type at '{key}'")
            }
            Self::InvalidValueForType {
                key,
                expected,
                value,
            } => write!(
                f,
                "invalid value '{value}' for '{key}', expected type {expected}"
            ),
            Self::InvalidValue { key, reason } => write!(f, "invalid value for '{key}': {reason}"),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Overlays `overlay` onto `base`, recursing into tables and replacing leaves.
fn merge_values(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Table(base_table), Value::Table(overlay_table)) => {
            for (key, overlay_value) in overlay_table {
                match base_table.get_mut(&key) {
                    Some(base_value) => merge_values(base_value, overlay_value),
                    None => {
                        base_table.insert(key, overlay_value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

fn parse_cli_overrides(
    args: impl IntoIterator<Item = String>,
) -> Result<Vec<(String, String)>, ConfigError> {
    let mut parsed = Vec::new();
    let mut iter = args.into_iter();

    while let Some(arg) = iter.next() {
        let Some(stripped) = arg.strip_prefix("--") else {
            return Err(ConfigError::InvalidArgFormat { arg });
        };

        if stripped.is_empty() {
            return Err(ConfigError::InvalidArgFormat { arg });
        }

        let value = iter.next().ok_or_else(|| ConfigError::MissingValueForArg {
            key: stripped.to_owned(),
        })?;

        parsed.push((stripped.to_owned(), value));
    }

    Ok(parsed)
}

fn apply_override(root: &mut Value, key_path: &str, raw_value: &str) -> Result<(), ConfigError> {
    let parts: Vec<&str> = key_path.split('.').collect();
    if parts.iter().any(|part| part.is_empty()) {
        return Err(ConfigError::InvalidPath {
            key: key_path.to_owned(),
        });
    }

    let unknown = || ConfigError::UnknownPath {
        key: key_path.to_owned(),
    };

    let (final_key, sections) = parts.split_last().ok_or_else(unknown)?;
    let mut current = root;
    for section in sections {
        current = current
            .as_table_mut()
            .and_then(|table| table.get_mut(*section))
            .ok_or_else(unknown)?;
    }

    let current_value = current
        .as_table_mut()
        .and_then(|table| table.get_mut(*final_key))
        .ok_or_else(unknown)?;

    *current_value = parse_value_using_current_type(key_path, raw_value, current_value)?;
    Ok(())
}

fn parse_value_using_current_type(
    key_path: &str,
    raw_value: &str,
    current_value: &Value,
) -> Result<Value, ConfigError> {
    let invalid = |expected: &'static str| ConfigError::InvalidValueForType {
        key: key_path.to_owned(),
        expected,
        value: raw_value.to_owned(),
    };

    match current_value {
        Value::String(_) => Ok(Value::String(raw_value.to_owned())),
        Value::Integer(_) => raw_value
            .parse::<i64>()
            .map(Value::Integer)
            .map_err(|_| invalid("integer")),
        Value::Float(_) => raw_value
            .parse::<f64>()
            .map(Value::Float)
            .map_err(|_| invalid("float")),
        Value::Boolean(_) => raw_value
            .parse::<bool>()
            .map(Value::Boolean)
            .map_err(|_| invalid("boolean")),
        Value::Array(items) if items.iter().all(Value::is_str) => Ok(Value::Array(
            raw_value
                .split(',')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(|item| Value::String(item.to_owned()))
                .collect(),
        )),
        Value::Datetime(_) | Value::Array(_) | Value::Table(_) => {
            Err(ConfigError::UnsupportedOverrideType {
                key: key_path.to_owned(),
            })
        }
    }
}
