//! Capture device lookup
//!
//! Resolves a human-readable device name to a `/dev/video*` handle path by
//! scanning the kernel's video4linux sysfs hierarchy. Each node there
//! carries a `name` file with the driver-advertised card name.

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{AppError, Result};

const SYSFS_VIDEO4LINUX: &str = "/sys/class/video4linux";

/// An enumerated capture device: advertised name plus its device node.
#[derive(Debug, Clone)]
pub struct LocatedDevice {
    /// Driver-advertised card name
    pub name: String,
    /// Device node path (e.g. /dev/video0)
    pub path: PathBuf,
}

/// Enumerate all video4linux devices, in directory order.
///
/// Directory order is not stable across driver reloads; callers must not
/// depend on which device wins when several names match a query.
pub fn enumerate_devices() -> Result<Vec<LocatedDevice>> {
    enumerate_devices_at(Path::new(SYSFS_VIDEO4LINUX))
}

fn enumerate_devices_at(sysfs_dir: &Path) -> Result<Vec<LocatedDevice>> {
    let mut devices = Vec::new();

    let entries = match std::fs::read_dir(sysfs_dir) {
        Ok(entries) => entries,
        Err(e) => {
            debug!("No video4linux hierarchy at {:?}: {}", sysfs_dir, e);
            return Ok(devices);
        }
    };

    for entry in entries {
        let entry = match entry {
            Ok(e) => e,
            Err(_) => continue,
        };

        let node = entry.file_name();
        let name = match std::fs::read_to_string(entry.path().join("name")) {
            Ok(name) => name.trim().to_string(),
            Err(_) => continue,
        };

        let path = Path::new("/dev").join(&node);
        info!("found video input device: {} - {}", path.display(), name);
        devices.push(LocatedDevice { name, path });
    }

    Ok(devices)
}

/// Resolve a device name substring to the first matching device.
pub fn locate_device(name_substr: &str) -> Result<LocatedDevice> {
    locate_device_at(Path::new(SYSFS_VIDEO4LINUX), name_substr)
}

fn locate_device_at(sysfs_dir: &Path, name_substr: &str) -> Result<LocatedDevice> {
    enumerate_devices_at(sysfs_dir)?
        .into_iter()
        .find(|dev| dev.name.contains(name_substr))
        .ok_or_else(|| AppError::DeviceNotFound(name_substr.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_sysfs(devices: &[(&str, &str)]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for (node, name) in devices {
            let node_dir = dir.path().join(node);
            std::fs::create_dir(&node_dir).unwrap();
            std::fs::write(node_dir.join("name"), format!("{}\n", name)).unwrap();
        }
        dir
    }

    #[test]
    fn finds_device_by_name_substring() {
        let sysfs = fake_sysfs(&[
            ("video0", "Integrated Webcam: Integrated W"),
            ("video2", "USB3 HDMI Capture: USB3 HDMI Ca"),
        ]);

        let dev = locate_device_at(sysfs.path(), "HDMI Capture").unwrap();
        assert_eq!(dev.path, PathBuf::from("/dev/video2"));
        assert!(dev.name.contains("HDMI"));
    }

    #[test]
    fn unknown_name_is_device_not_found() {
        let sysfs = fake_sysfs(&[("video0", "Integrated Webcam")]);

        match locate_device_at(sysfs.path(), "NoSuchCamera") {
            Err(AppError::DeviceNotFound(name)) => assert_eq!(name, "NoSuchCamera"),
            other => panic!("expected DeviceNotFound, got {:?}", other.map(|d| d.name)),
        }
    }

    #[test]
    fn missing_hierarchy_yields_empty_enumeration() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("does-not-exist");
        assert!(enumerate_devices_at(&missing).unwrap().is_empty());
    }
}
