//! The declarative post-write operation language found in `device-type.json`.
//!
//! Operations arrive as [`OperationSpec`]s, still carrying their `when`
//! clause and partition references in either addressing scheme. Filtering and
//! [`OperationSpec::normalize`] turn the survivors into [`Operation`]s whose
//! partitions are plain indices.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use super::ConfigureError;

/// MBR primary slots occupy indices 1 to 4; logical partitions follow.
pub const MBR_LAST_PRIMARY_PARTITION: u32 = 4;

/// A partition reference as written in `device-type.json`.
///
/// Any JSON value is accepted while parsing. Shapes that are neither an index
/// nor a legacy object are kept as [`PartitionRef::Other`] and rejected by
/// [`PartitionRef::resolve`], so an operation filtered out by its `when`
/// clause never fails the run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum PartitionRef {
    /// Current format: the partition index.
    Index(u32),
    /// Old format: `{ "primary": 4 }` or `{ "primary": 4, "logical": 1 }`.
    Legacy {
        #[serde(skip_serializing_if = "Option::is_none")]
        primary: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        logical: Option<u32>,
    },
    Other(Value),
}

impl<'de> Deserialize<'de> for PartitionRef {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Value::deserialize(deserializer).map(Self::from)
    }
}

impl From<Value> for PartitionRef {
    fn from(value: Value) -> Self {
        match &value {
            Value::Number(n) => match n.as_u64().and_then(|n| u32::try_from(n).ok()) {
                Some(index) => Self::Index(index),
                None => Self::Other(value),
            },
            Value::Object(map) => match (legacy_slot(map, "primary"), legacy_slot(map, "logical")) {
                (Some(primary), Some(logical)) => Self::Legacy { primary, logical },
                _ => Self::Other(value),
            },
            _ => Self::Other(value),
        }
    }
}

/// `Some(None)` when `key` is absent, `None` when present but not a `u32`.
fn legacy_slot(map: &Map<String, Value>, key: &str) -> Option<Option<u32>> {
    match map.get(key) {
        None => Some(None),
        Some(v) => v.as_u64().and_then(|n| u32::try_from(n).ok()).map(Some),
    }
}

impl PartitionRef {
    pub fn primary(n: u32) -> Self {
        Self::Legacy {
            primary: Some(n),
            logical: None,
        }
    }

    pub fn logical(n: u32) -> Self {
        Self::Legacy {
            primary: None,
            logical: Some(n),
        }
    }

    /// Resolve to a flat partition index. A logical number wins over a
    /// primary one when both are present.
    pub fn resolve(&self) -> Result<u32, ConfigureError> {
        match self {
            Self::Index(index) => Ok(*index),
            Self::Legacy {
                logical: Some(n), ..
            } => n
                .checked_add(MBR_LAST_PRIMARY_PARTITION)
                .ok_or_else(|| ConfigureError::invalid_partition(self)),
            Self::Legacy {
                primary: Some(n), ..
            } => Ok(*n),
            Self::Legacy { .. } | Self::Other(_) => Err(ConfigureError::invalid_partition(self)),
        }
    }
}

/// A file inside a partition. `P` is [`PartitionRef`] before normalization
/// and `u32` after.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRef<P = PartitionRef> {
    pub partition: P,
    pub path: String,
}

impl FileRef {
    fn normalize(&self) -> Result<FileRef<u32>, ConfigureError> {
        Ok(FileRef {
            partition: self.partition.resolve()?,
            path: self.path.clone(),
        })
    }
}

/// An operation as parsed, before filtering and normalization. Unknown
/// `command` values fail to parse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "lowercase")]
pub enum OperationSpec {
    Configure {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        when: Option<Map<String, Value>>,
        partition: PartitionRef,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },
    Copy {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        when: Option<Map<String, Value>>,
        from: FileRef,
        to: FileRef,
    },
}

impl OperationSpec {
    pub fn when(&self) -> Option<&Map<String, Value>> {
        match self {
            Self::Configure { when, .. } | Self::Copy { when, .. } => when.as_ref(),
        }
    }

    /// Kept only if every `when` key matches the option of the same name.
    pub fn applies_to(&self, options: &ConfigureOptions) -> bool {
        self.when().is_none_or(|clause| {
            clause
                .iter()
                .all(|(key, expected)| options.get(key) == Some(expected))
        })
    }

    pub fn normalize(&self) -> Result<Operation, ConfigureError> {
        match self {
            Self::Configure {
                partition, data, ..
            } => Ok(Operation::Configure {
                partition: partition.resolve()?,
                data: data.clone(),
            }),
            Self::Copy { from, to, .. } => Ok(Operation::Copy {
                from: from.normalize()?,
                to: to.normalize()?,
            }),
        }
    }
}

/// A filtered, normalized operation ready to run against a disk.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    /// Write `data` as JSON into the configuration file of `partition`.
    Configure { partition: u32, data: Option<Value> },
    /// Copy a file between partitions of the same disk.
    Copy { from: FileRef<u32>, to: FileRef<u32> },
}

impl Operation {
    pub fn command(&self) -> &'static str {
        match self {
            Self::Configure { .. } => "configure",
            Self::Copy { .. } => "copy",
        }
    }
}

/// Caller-supplied options: matched against `when` clauses, and the source of
/// the `configure` payload under the `config` key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfigureOptions(Map<String, Value>);

impl ConfigureOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Payload for the synthesized `configure` operation.
    pub fn config(&self) -> Option<&Value> {
        self.get("config")
    }
}

impl From<Map<String, Value>> for ConfigureOptions {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}
