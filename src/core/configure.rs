//! Post-write configuration of a flashed disk.
//!
//! Images can embed a `device-type.json` on a FAT partition describing
//! operations to run after flashing: writing a configuration payload into a
//! partition, or copying files between partitions. [`configure`] finds that
//! metadata, filters the operations against caller options, resolves every
//! partition reference and runs the result in order.
//!
//! Callers must serialize runs per disk; operations mutate the disk in place
//! and later ones may depend on files written by earlier ones.

mod disk;
mod operation;

pub use disk::{Disk, DiskError, PartitionFilesystem, PartitionInfo, with_partition_filesystem};
pub use operation::{
    ConfigureOptions, FileRef, MBR_LAST_PRIMARY_PARTITION, Operation, OperationSpec, PartitionRef,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Where image metadata lives on the FAT partition.
pub const DEVICE_TYPE_PATH: &str = "/device-type.json";

/// File a `configure` operation writes its payload to.
pub const CONFIG_FILE_PATH: &str = "/config.json";

#[derive(Debug, Error)]
pub enum ConfigureError {
    #[error("invalid partition: {0}")]
    InvalidPartition(String),

    #[error("malformed device metadata: {0}")]
    Metadata(#[from] serde_json::Error),

    #[error(transparent)]
    Disk(#[from] DiskError),
}

impl ConfigureError {
    pub(crate) fn invalid_partition(partition: &PartitionRef) -> Self {
        let shown = serde_json::to_string(partition).unwrap_or_else(|_| format!("{partition:?}"));
        Self::InvalidPartition(shown)
    }
}

/// Parsed `device-type.json`. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configuration: Option<ConfigurationSection>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigurationSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operations: Option<Vec<OperationSpec>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<ConfigTarget>,
}

/// Partition that receives the caller's configuration payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigTarget {
    pub partition: PartitionRef,
}

impl DeviceMetadata {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, ConfigureError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Find and parse `device-type.json` on the first FAT partition that has a
/// readable one. Unreadable or missing metadata is `Ok(None)`.
pub async fn read_device_metadata(disk: &dyn Disk) -> Result<Option<DeviceMetadata>, ConfigureError> {
    for partition in disk.list_partitions().await? {
        if !partition.is_fat() {
            continue;
        }

        let contents = with_partition_filesystem(disk, partition.index, |fs| {
            Box::pin(async move {
                match fs.read_file(DEVICE_TYPE_PATH).await {
                    Ok(bytes) => Ok(Some(bytes)),
                    Err(e) => {
                        debug!(error = %e, "No readable device metadata");
                        Ok(None)
                    }
                }
            })
        })
        .await;

        match contents {
            Ok(Some(bytes)) => {
                info!(partition = partition.index, "Found device metadata");
                return DeviceMetadata::from_slice(&bytes).map(Some);
            }
            Ok(None) => {}
            Err(e) => warn!(partition = partition.index, error = %e, "Failed to inspect partition"),
        }
    }

    Ok(None)
}

/// Build the filtered, normalized list of operations to run.
///
/// The metadata is only read; operations are copied out of it so a plan can
/// be built again from the same metadata with the same result. Every
/// partition reference is resolved before anything is returned, so an invalid
/// one aborts the whole batch.
pub fn plan_operations(
    metadata: Option<&DeviceMetadata>,
    options: &ConfigureOptions,
) -> Result<Vec<Operation>, ConfigureError> {
    let configuration = metadata.and_then(|m| m.configuration.as_ref());

    let mut specs: Vec<OperationSpec> = configuration
        .and_then(|c| c.operations.clone())
        .unwrap_or_default();

    if let Some(target) = configuration.and_then(|c| c.config.as_ref()) {
        specs.push(OperationSpec::Configure {
            when: None,
            partition: target.partition.clone(),
            data: options.config().cloned(),
        });
    }

    specs
        .iter()
        .filter(|spec| spec.applies_to(options))
        .map(OperationSpec::normalize)
        .collect()
}

/// Run a single operation against the disk.
pub async fn execute_operation(disk: &dyn Disk, operation: &Operation) -> Result<(), ConfigureError> {
    match operation {
        Operation::Configure { partition, data } => {
            let Some(data) = data else {
                debug!(partition, "No configuration payload supplied, skipping");
                return Ok(());
            };
            let payload = serde_json::to_vec(data)?;
            info!(partition, path = CONFIG_FILE_PATH, bytes = payload.len(), "Writing configuration");

            with_partition_filesystem(disk, *partition, |fs| {
                Box::pin(async move { fs.write_file(CONFIG_FILE_PATH, &payload).await })
            })
            .await?;
        }
        Operation::Copy { from, to } => {
            info!(
                from_partition = from.partition,
                from_path = %from.path,
                to_partition = to.partition,
                to_path = %to.path,
                "Copying file between partitions"
            );

            let source = from.path.clone();
            let contents = with_partition_filesystem(disk, from.partition, |fs| {
                Box::pin(async move { fs.read_file(&source).await })
            })
            .await?;

            let target = to.path.clone();
            with_partition_filesystem(disk, to.partition, |fs| {
                Box::pin(async move { fs.write_file(&target, &contents).await })
            })
            .await?;
        }
    }
    Ok(())
}

/// Apply the disk's embedded configuration operations, returning the
/// operations that ran, in order.
pub async fn configure(
    disk: &dyn Disk,
    options: &ConfigureOptions,
) -> Result<Vec<Operation>, ConfigureError> {
    let metadata = read_device_metadata(disk).await?;
    if metadata.is_none() {
        info!("No device metadata on disk, nothing to configure");
    }

    let operations = plan_operations(metadata.as_ref(), options)?;
    info!(operations = operations.len(), "Running configuration operations");

    for operation in &operations {
        debug!(command = operation.command(), "Executing operation");
        execute_operation(disk, operation).await?;
    }

    Ok(operations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn metadata(value: serde_json::Value) -> DeviceMetadata {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_metadata_tolerates_missing_fields() {
        assert_eq!(metadata(json!({})), DeviceMetadata::default());
        assert!(metadata(json!({"configuration": {}}))
            .configuration
            .unwrap()
            .operations
            .is_none());
        // Unrelated device-type fields are ignored.
        metadata(json!({"slug": "raspberrypi4-64", "name": "Raspberry Pi 4"}));
    }

    #[test]
    fn test_plan_without_metadata_is_empty() {
        let plan = plan_operations(None, &ConfigureOptions::new()).unwrap();
        assert!(plan.is_empty());
    }

    #[test]
    fn test_plan_appends_config_operation_last() {
        let meta = metadata(json!({
            "configuration": {
                "operations": [
                    {"command": "copy", "from": {"partition": 1, "path": "/a"}, "to": {"partition": 2, "path": "/b"}}
                ],
                "config": {"partition": {"primary": 1}}
            }
        }));
        let options = ConfigureOptions::new().with("config", json!({"hostname": "pi"}));

        let plan = plan_operations(Some(&meta), &options).unwrap();
        assert_eq!(plan.len(), 2);
        assert_eq!(plan[0].command(), "copy");
        assert_eq!(
            plan[1],
            Operation::Configure {
                partition: 1,
                data: Some(json!({"hostname": "pi"})),
            }
        );
    }

    #[test]
    fn test_plan_filter_preserves_order() {
        let meta = metadata(json!({
            "configuration": {
                "operations": [
                    {"command": "configure", "partition": 1, "data": 1},
                    {"command": "configure", "partition": 2, "data": 2, "when": {"board": "x"}},
                    {"command": "configure", "partition": 3, "data": 3, "when": {"board": "y"}},
                    {"command": "configure", "partition": 4, "data": 4}
                ]
            }
        }));
        let options = ConfigureOptions::new().with("board", "y");

        let partitions: Vec<u32> = plan_operations(Some(&meta), &options)
            .unwrap()
            .into_iter()
            .map(|op| match op {
                Operation::Configure { partition, .. } => partition,
                Operation::Copy { .. } => unreachable!(),
            })
            .collect();
        assert_eq!(partitions, vec![1, 3, 4]);
    }

    #[test]
    fn test_invalid_partition_aborts_whole_plan() {
        let meta = metadata(json!({
            "configuration": {
                "operations": [
                    {"command": "configure", "partition": 1},
                    {"command": "configure", "partition": {}}
                ]
            }
        }));

        let err = plan_operations(Some(&meta), &ConfigureOptions::new()).unwrap_err();
        assert!(matches!(err, ConfigureError::InvalidPartition(_)));
    }

    #[test]
    fn test_filtered_out_invalid_partition_is_not_an_error() {
        let meta = metadata(json!({
            "configuration": {
                "operations": [
                    {"command": "configure", "partition": {}, "when": {"never": true}}
                ]
            }
        }));

        assert!(plan_operations(Some(&meta), &ConfigureOptions::new())
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_planning_leaves_metadata_untouched() {
        let meta = metadata(json!({
            "configuration": {
                "operations": [
                    {"command": "copy", "from": {"partition": {"primary": 1}, "path": "/a"}, "to": {"partition": {"logical": 1}, "path": "/b"}}
                ],
                "config": {"partition": {"logical": 2}}
            }
        }));
        let before = meta.clone();
        let options = ConfigureOptions::new().with("config", json!({"x": 1}));

        let mut plan = plan_operations(Some(&meta), &options).unwrap();
        if let Operation::Copy { to, .. } = &mut plan[0] {
            to.partition = 99;
            to.path.push_str("-mutated");
        }
        plan.clear();

        assert_eq!(meta, before);
        assert_eq!(
            meta.configuration.as_ref().unwrap().operations.as_ref().unwrap().len(),
            1
        );

        // Planning again yields the same result.
        let again = plan_operations(Some(&meta), &options).unwrap();
        assert_eq!(again, plan_operations(Some(&before), &options).unwrap());
    }
}
