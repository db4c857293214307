//! Block-device resolution on the node.
//!
//! On Nitro instances the device name passed to the EC2 attach call is a
//! hint: the kernel surfaces the volume as an NVMe namespace with a name of
//! its own. The volume id travels in the NVMe serial number ("vol" prefix,
//! dashes stripped), which sysfs exposes, so resolution never shells out.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use tokio::time::sleep;

use crate::errors::{Error, Result};

const BY_ID_PREFIX: &str = "nvme-Amazon_Elastic_Block_Store_";

/// Resolves publish-context device hints to real block devices. The roots
/// are injectable so tests can lay out a fake sysfs.
#[derive(Debug, Clone)]
pub struct DeviceResolver {
    sys_nvme_root: PathBuf,
    dev_root: PathBuf,
    by_id_root: PathBuf,
    /// Total time budget for a device to appear after attach.
    pub wait_timeout: Duration,
}

impl Default for DeviceResolver {
    fn default() -> Self {
        Self {
            sys_nvme_root: PathBuf::from("/sys/class/nvme"),
            dev_root: PathBuf::from("/dev"),
            by_id_root: PathBuf::from("/dev/disk/by-id"),
            wait_timeout: Duration::from_secs(5),
        }
    }
}

/// NVMe volume serial for an EBS volume id: "vol-0abc" -> "vol0abc".
pub fn volume_serial(volume_id: &str) -> String {
    volume_id.replace('-', "")
}

impl DeviceResolver {
    pub fn with_roots(
        sys_nvme_root: impl Into<PathBuf>,
        dev_root: impl Into<PathBuf>,
        by_id_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            sys_nvme_root: sys_nvme_root.into(),
            dev_root: dev_root.into(),
            by_id_root: by_id_root.into(),
            ..Self::default()
        }
    }

    /// Resolves "device_hint" (the name the controller attached under) to an
    /// existing block device for "volume_id", waiting with backoff for the
    /// kernel to surface it.
    pub async fn resolve(&self, device_hint: &str, volume_id: &str) -> Result<PathBuf> {
        let mut interval = Duration::from_millis(100);
        let mut elapsed = Duration::ZERO;

        loop {
            if let Some(path) = self.try_resolve(device_hint, volume_id) {
                return Ok(path);
            }
            if elapsed >= self.wait_timeout {
                break;
            }
            sleep(interval).await;
            elapsed += interval;
            interval = (interval * 2).min(Duration::from_secs(1));
        }

        Err(Error::not_found(
            volume_id,
            format!(
                "no block device for '{}' (hint '{}') within {:?}",
                volume_id, device_hint, self.wait_timeout
            ),
        ))
    }

    fn try_resolve(&self, device_hint: &str, volume_id: &str) -> Option<PathBuf> {
        let hint = Path::new(device_hint);
        if hint.exists() {
            return Some(hint.to_path_buf());
        }

        let serial = volume_serial(volume_id);

        // by-id symlinks are maintained by udev and resolve without a scan
        let link = self.by_id_root.join(format!("{}{}", BY_ID_PREFIX, serial));
        if let Ok(target) = std::fs::canonicalize(&link) {
            return Some(target);
        }

        self.scan_sysfs(&serial)
    }

    /// Walks /sys/class/nvme and matches controller serial files against the
    /// volume serial, then picks the controller's first namespace.
    fn scan_sysfs(&self, serial: &str) -> Option<PathBuf> {
        let controllers = std::fs::read_dir(&self.sys_nvme_root).ok()?;
        for ctrl in controllers.flatten() {
            let ctrl_path = ctrl.path();
            let reported = match std::fs::read_to_string(ctrl_path.join("serial")) {
                Ok(s) => s.trim().to_string(),
                Err(_) => continue,
            };
            if reported != serial {
                continue;
            }

            let ctrl_name = ctrl.file_name().to_string_lossy().to_string();
            let namespaces = std::fs::read_dir(&ctrl_path).ok()?;
            for entry in namespaces.flatten() {
                let name = entry.file_name().to_string_lossy().to_string();
                // namespace dirs look like "nvme0n1" under controller "nvme0"
                if name.starts_with(&ctrl_name) && name[ctrl_name.len()..].starts_with('n') {
                    let dev = self.dev_root.join(&name);
                    if dev.exists() {
                        return Some(dev);
                    }
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn fake_host() -> (tempfile::TempDir, DeviceResolver) {
        let root = tempfile::tempdir().unwrap();
        let sys = root.path().join("sys/class/nvme");
        let dev = root.path().join("dev");
        let by_id = root.path().join("dev/disk/by-id");
        fs::create_dir_all(&sys).unwrap();
        fs::create_dir_all(&dev).unwrap();
        fs::create_dir_all(&by_id).unwrap();
        let mut resolver = DeviceResolver::with_roots(&sys, &dev, &by_id);
        resolver.wait_timeout = Duration::from_millis(50);
        (root, resolver)
    }

    #[test]
    fn serial_strips_dashes() {
        assert_eq!(volume_serial("vol-0a1b2c3d"), "vol0a1b2c3d");
    }

    #[tokio::test]
    async fn hint_wins_when_present() {
        let (root, resolver) = fake_host();
        let hint = root.path().join("dev/xvdba");
        fs::write(&hint, b"").unwrap();

        let resolved = resolver
            .resolve(hint.to_str().unwrap(), "vol-0a1b2c3d")
            .await
            .unwrap();
        assert_eq!(resolved, hint);
    }

    #[tokio::test]
    async fn sysfs_serial_scan_resolves_nvme_name() {
        let (root, resolver) = fake_host();
        let ctrl = root.path().join("sys/class/nvme/nvme0");
        fs::create_dir_all(ctrl.join("nvme0n1")).unwrap();
        fs::write(ctrl.join("serial"), "vol0a1b2c3d\n").unwrap();
        fs::write(root.path().join("dev/nvme0n1"), b"").unwrap();

        let resolved = resolver.resolve("/dev/xvdba", "vol-0a1b2c3d").await.unwrap();
        assert_eq!(resolved, root.path().join("dev/nvme0n1"));
    }

    #[tokio::test]
    async fn mismatched_serial_is_not_found() {
        let (root, resolver) = fake_host();
        let ctrl = root.path().join("sys/class/nvme/nvme0");
        fs::create_dir_all(ctrl.join("nvme0n1")).unwrap();
        fs::write(ctrl.join("serial"), "vol9999\n").unwrap();
        fs::write(root.path().join("dev/nvme0n1"), b"").unwrap();

        let err = resolver
            .resolve("/dev/xvdba", "vol-0a1b2c3d")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }
}
