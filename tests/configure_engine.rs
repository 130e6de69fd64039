//! End-to-end tests for the post-write configuration engine against an
//! in-memory partitioned disk.

use multiflash::adapters::MemoryDisk;
use multiflash::core::configure::{
    CONFIG_FILE_PATH, ConfigureError, ConfigureOptions, DEVICE_TYPE_PATH, FileRef, Operation,
    configure, read_device_metadata,
};
use serde_json::json;

const FAT32_LBA: u8 = 0x0C;
const LINUX: u8 = 0x83;
const EXTENDED: u8 = 0x05;

/// A disk laid out like a typical image: FAT boot partition, a root
/// partition, an extended container and one logical partition.
fn disk_with_metadata(metadata: serde_json::Value) -> MemoryDisk {
    MemoryDisk::new()
        .with_partition(1, FAT32_LBA)
        .with_partition(2, LINUX)
        .with_partition(4, EXTENDED)
        .with_partition(5, LINUX)
        .with_file(1, DEVICE_TYPE_PATH, metadata.to_string())
        .with_file(1, "/network/wifi", "ssid=lab")
}

fn copy_when_foo_is_bar() -> serde_json::Value {
    json!({
        "slug": "raspberrypi3",
        "configuration": {
            "operations": [{
                "command": "copy",
                "when": {"foo": "bar"},
                "from": {"partition": 1, "path": "/network/wifi"},
                "to": {"partition": {"logical": 1}, "path": "/etc/wifi"}
            }]
        }
    })
}

#[tokio::test]
async fn test_copy_runs_when_condition_matches() {
    let disk = disk_with_metadata(copy_when_foo_is_bar());
    let options = ConfigureOptions::new().with("foo", "bar");

    let ran = configure(&disk, &options).await.unwrap();

    assert_eq!(
        ran,
        vec![Operation::Copy {
            from: FileRef {
                partition: 1,
                path: "/network/wifi".to_string()
            },
            to: FileRef {
                partition: 5,
                path: "/etc/wifi".to_string()
            },
        }]
    );
    assert_eq!(disk.file(5, "/etc/wifi").unwrap(), b"ssid=lab");
    // One session to find the metadata, then one per side of the copy.
    assert_eq!(disk.sessions(), vec![1, 1, 5]);
    assert_eq!(disk.open_sessions(), 0);
}

#[tokio::test]
async fn test_nothing_runs_when_condition_differs() {
    let disk = disk_with_metadata(copy_when_foo_is_bar());
    let options = ConfigureOptions::new().with("foo", "baz");

    let ran = configure(&disk, &options).await.unwrap();

    assert!(ran.is_empty());
    assert!(disk.file(5, "/etc/wifi").is_none());
    assert_eq!(disk.sessions(), vec![1]);
}

#[tokio::test]
async fn test_repeated_runs_are_identical() {
    let disk = disk_with_metadata(copy_when_foo_is_bar());
    let options = ConfigureOptions::new().with("foo", "bar");

    let first = configure(&disk, &options).await.unwrap();
    let second = configure(&disk, &options).await.unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_config_payload_written_to_target_partition() {
    let disk = disk_with_metadata(json!({
        "configuration": {
            "config": {"partition": {"primary": 1}}
        }
    }));
    let payload = json!({"hostname": "kiosk-7", "persistentLogging": true});
    let options = ConfigureOptions::new().with("config", payload.clone());

    let ran = configure(&disk, &options).await.unwrap();
    assert_eq!(ran.len(), 1);

    let written = disk.file(1, CONFIG_FILE_PATH).unwrap();
    let parsed: serde_json::Value = serde_json::from_slice(&written).unwrap();
    assert_eq!(parsed, payload);
}

#[tokio::test]
async fn test_config_without_payload_is_skipped() {
    let disk = disk_with_metadata(json!({
        "configuration": {"config": {"partition": 1}}
    }));

    let ran = configure(&disk, &ConfigureOptions::new()).await.unwrap();

    assert_eq!(
        ran,
        vec![Operation::Configure {
            partition: 1,
            data: None
        }]
    );
    assert!(disk.file(1, CONFIG_FILE_PATH).is_none());
}

#[tokio::test]
async fn test_operations_run_in_order() {
    let disk = disk_with_metadata(json!({
        "configuration": {
            "operations": [
                {"command": "copy", "from": {"partition": 1, "path": "/network/wifi"}, "to": {"partition": 2, "path": "/stage"}},
                {"command": "copy", "from": {"partition": 2, "path": "/stage"}, "to": {"partition": {"logical": 1}, "path": "/final"}}
            ]
        }
    }));

    let ran = configure(&disk, &ConfigureOptions::new()).await.unwrap();

    assert_eq!(ran.len(), 2);
    assert_eq!(disk.file(5, "/final").unwrap(), b"ssid=lab");
}

#[tokio::test]
async fn test_invalid_partition_aborts_before_any_operation() {
    let disk = disk_with_metadata(json!({
        "configuration": {
            "operations": [
                {"command": "copy", "from": {"partition": 1, "path": "/network/wifi"}, "to": {"partition": 2, "path": "/copied"}},
                {"command": "configure", "partition": {}, "data": {"a": 1}}
            ]
        }
    }));

    let err = configure(&disk, &ConfigureOptions::new()).await.unwrap_err();

    assert!(matches!(err, ConfigureError::InvalidPartition(_)));
    assert!(disk.file(2, "/copied").is_none());
    assert_eq!(disk.sessions(), vec![1]);
}

#[tokio::test]
async fn test_malformed_partition_ignored_when_operation_filtered_out() {
    let disk = disk_with_metadata(json!({
        "configuration": {
            "operations": [
                {"command": "configure", "partition": "2", "when": {"never": true}, "data": {"a": 1}}
            ]
        }
    }));

    let ran = configure(&disk, &ConfigureOptions::new()).await.unwrap();
    assert!(ran.is_empty());
}

#[tokio::test]
async fn test_malformed_partition_is_invalid_when_operation_kept() {
    for partition in [json!("2"), json!(-1), json!(1.5), json!([1])] {
        let disk = disk_with_metadata(json!({
            "configuration": {
                "operations": [
                    {"command": "copy", "from": {"partition": 1, "path": "/network/wifi"}, "to": {"partition": partition.clone(), "path": "/x"}}
                ]
            }
        }));

        let err = configure(&disk, &ConfigureOptions::new()).await.unwrap_err();
        assert!(
            matches!(err, ConfigureError::InvalidPartition(_)),
            "unexpected error for {partition}: {err:?}"
        );
        assert_eq!(disk.sessions(), vec![1]);
    }
}

#[tokio::test]
async fn test_missing_metadata_means_no_operations() {
    let disk = MemoryDisk::new()
        .with_partition(1, FAT32_LBA)
        .with_partition(2, LINUX);

    assert!(read_device_metadata(&disk).await.unwrap().is_none());
    assert!(configure(&disk, &ConfigureOptions::new()).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_metadata_only_read_from_fat_partitions() {
    let disk = MemoryDisk::new()
        .with_partition(1, LINUX)
        .with_file(1, DEVICE_TYPE_PATH, copy_when_foo_is_bar().to_string());

    assert!(read_device_metadata(&disk).await.unwrap().is_none());
    assert!(disk.sessions().is_empty());
}

#[tokio::test]
async fn test_unreadable_metadata_falls_through_to_next_fat_partition() {
    let disk = MemoryDisk::new()
        .with_partition(1, FAT32_LBA)
        .with_partition(2, 0x0E)
        .with_file(1, DEVICE_TYPE_PATH, "{}")
        .with_unreadable(1, DEVICE_TYPE_PATH)
        .with_file(2, DEVICE_TYPE_PATH, copy_when_foo_is_bar().to_string());

    let metadata = read_device_metadata(&disk).await.unwrap().unwrap();
    let operations = metadata.configuration.unwrap().operations.unwrap();
    assert_eq!(operations.len(), 1);
    assert_eq!(disk.sessions(), vec![1, 2]);
    assert_eq!(disk.open_sessions(), 0);
}

#[tokio::test]
async fn test_unknown_command_is_a_metadata_error() {
    let disk = disk_with_metadata(json!({
        "configuration": {
            "operations": [{"command": "format", "partition": 2}]
        }
    }));

    let err = configure(&disk, &ConfigureOptions::new()).await.unwrap_err();
    assert!(matches!(err, ConfigureError::Metadata(_)));
}

#[tokio::test]
async fn test_copy_of_missing_file_fails() {
    let disk = disk_with_metadata(json!({
        "configuration": {
            "operations": [
                {"command": "copy", "from": {"partition": 2, "path": "/nope"}, "to": {"partition": 5, "path": "/x"}}
            ]
        }
    }));

    let err = configure(&disk, &ConfigureOptions::new()).await.unwrap_err();
    assert!(matches!(err, ConfigureError::Disk(_)));
    assert_eq!(disk.open_sessions(), 0);
}
