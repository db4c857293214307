//! CreateVolume / ControllerModifyVolume parameter parsing.
//!
//! Unknown keys are rejected up front with `InvalidArgument`; the admissible
//! iops/throughput ranges are enforced per volume type once the negotiated
//! size is known.

use std::collections::HashMap;

use crate::{
    cloud::{round_up_to_gib, DiskType, ModifyDiskOptions, GIB},
    errors::{Error, Result},
    mount::{
        CTX_BIG_ALLOC, CTX_BLOCK_SIZE, CTX_BYTES_PER_INODE, CTX_CLUSTER_SIZE, CTX_FS_TYPE,
        CTX_INODE_SIZE, CTX_NUMBER_OF_INODES, FormatOptions, FsType,
    },
};

pub const PARAM_TYPE: &str = "type";
pub const PARAM_IOPS_PER_GB: &str = "iopsPerGB";
pub const PARAM_IOPS: &str = "iops";
pub const PARAM_THROUGHPUT: &str = "throughput";
pub const PARAM_ENCRYPTED: &str = "encrypted";
pub const PARAM_KMS_KEY_ID: &str = "kmsKeyId";
pub const PARAM_TAG_PREFIX: &str = "tagSpecification_";
pub const PARAM_INITIALIZATION_RATE: &str = "volumeInitializationRate";
pub const PARAM_BLOCK_ATTACH_UNTIL_INITIALIZED: &str = "blockAttachUntilInitialized";
pub const PARAM_FSR_AVAILABILITY_ZONES: &str = "fastSnapshotRestoreAvailabilityZones";

/// Parsed CreateVolume parameters.
#[derive(Debug, Clone, Default)]
pub struct VolumeParams {
    pub volume_type: Option<DiskType>,
    pub iops: Option<i32>,
    pub iops_per_gb: Option<i32>,
    pub throughput: Option<i32>,
    pub encrypted: bool,
    pub kms_key_id: Option<String>,
    pub fs_type: Option<String>,
    /// Raw format-option keys, echoed into the volume context for the node.
    pub format_options: HashMap<String, String>,
    pub extra_tags: HashMap<String, String>,
    pub initialization_rate: Option<i32>,
    pub block_attach_until_initialized: bool,
    pub fast_snapshot_restore_zones: Vec<String>,
}

impl VolumeParams {
    pub fn parse(parameters: &HashMap<String, String>) -> Result<Self> {
        let mut out = VolumeParams::default();

        for (key, value) in parameters {
            match key.as_str() {
                PARAM_TYPE => out.volume_type = Some(DiskType::parse(value)?),
                PARAM_IOPS => out.iops = Some(parse_i32(key, value)?),
                PARAM_IOPS_PER_GB => out.iops_per_gb = Some(parse_i32(key, value)?),
                PARAM_THROUGHPUT => out.throughput = Some(parse_i32(key, value)?),
                PARAM_ENCRYPTED => out.encrypted = parse_bool(key, value)?,
                PARAM_KMS_KEY_ID => out.kms_key_id = Some(value.clone()),
                CTX_FS_TYPE => {
                    FsType::parse(value)?;
                    out.fs_type = Some(value.clone());
                }
                CTX_BLOCK_SIZE | CTX_INODE_SIZE | CTX_BYTES_PER_INODE | CTX_NUMBER_OF_INODES
                | CTX_CLUSTER_SIZE => {
                    parse_i32(key, value)?;
                    out.format_options.insert(key.clone(), value.clone());
                }
                CTX_BIG_ALLOC => {
                    parse_bool(key, value)?;
                    out.format_options.insert(key.clone(), value.clone());
                }
                PARAM_INITIALIZATION_RATE => {
                    out.initialization_rate = Some(parse_i32(key, value)?)
                }
                PARAM_BLOCK_ATTACH_UNTIL_INITIALIZED => {
                    out.block_attach_until_initialized = parse_bool(key, value)?
                }
                PARAM_FSR_AVAILABILITY_ZONES => {
                    out.fast_snapshot_restore_zones = split_zones(value);
                }
                _ if key.starts_with(PARAM_TAG_PREFIX) => {
                    let (k, v) = parse_tag(value)?;
                    out.extra_tags.insert(k, v);
                }
                // the orchestrator prefixes its own bookkeeping parameters
                _ if key.starts_with("csi.storage.k8s.io/") => {}
                _ => {
                    return Err(Error::invalid_argument(format!(
                        "unknown parameter key '{}'",
                        key
                    )));
                }
            }
        }

        // format options only make sense next to a filesystem; validate the
        // allow-list early so invalid classes never reach the node
        if !out.format_options.is_empty() {
            let fs = FsType::parse(out.fs_type.as_deref().unwrap_or("ext4"))?;
            FormatOptions::from_context(fs, &out.format_options)?;
        }

        Ok(out)
    }

    /// The resolved type; gp3 is the default class.
    pub fn disk_type(&self) -> DiskType {
        self.volume_type.unwrap_or(DiskType::Gp3)
    }

    /// Computes and validates the provisioned IOPS for the negotiated size.
    pub fn resolve_iops(&self, size_gib: i64) -> Result<Option<i32>> {
        let disk_type = self.disk_type();

        if (self.iops.is_some() || self.iops_per_gb.is_some()) && !disk_type.supports_iops() {
            return Err(Error::invalid_argument(format!(
                "'{}' volumes do not take provisioned iops",
                disk_type.as_str()
            )));
        }
        if self.iops.is_some() && self.iops_per_gb.is_some() {
            return Err(Error::invalid_argument(
                "'iops' and 'iopsPerGB' are mutually exclusive",
            ));
        }

        let iops = match (self.iops, self.iops_per_gb) {
            (Some(direct), _) => Some(direct),
            (None, Some(per_gb)) => Some((per_gb as i64 * size_gib).min(i32::MAX as i64) as i32),
            (None, None) => return Ok(None),
        };
        let iops = iops.unwrap_or(0);

        let (min, max, max_per_gib) = match disk_type {
            DiskType::Gp3 => (3000, 16000, 500),
            DiskType::Io1 => (100, 64000, 50),
            DiskType::Io2 => (100, 256000, 500),
            _ => unreachable!("supports_iops checked above"),
        };
        if iops < min || iops > max {
            return Err(Error::invalid_argument(format!(
                "iops {} outside the {}..{} range of '{}'",
                iops,
                min,
                max,
                disk_type.as_str()
            )));
        }
        if i64::from(iops) > size_gib * max_per_gib {
            return Err(Error::invalid_argument(format!(
                "iops {} exceeds {} IOPS/GiB for a {} GiB '{}' volume",
                iops,
                max_per_gib,
                size_gib,
                disk_type.as_str()
            )));
        }
        Ok(Some(iops))
    }

    /// Validates the throughput request for the resolved type.
    pub fn resolve_throughput(&self) -> Result<Option<i32>> {
        let Some(tp) = self.throughput else {
            return Ok(None);
        };
        let disk_type = self.disk_type();
        if !disk_type.supports_throughput() {
            return Err(Error::invalid_argument(format!(
                "'{}' volumes do not take provisioned throughput",
                disk_type.as_str()
            )));
        }
        if !(125..=1000).contains(&tp) {
            return Err(Error::invalid_argument(format!(
                "throughput {} MiB/s outside the 125..1000 range",
                tp
            )));
        }
        Ok(Some(tp))
    }
}

/// Parsed CreateSnapshot parameters.
#[derive(Debug, Clone, Default)]
pub struct SnapshotParams {
    pub extra_tags: HashMap<String, String>,
    pub fast_snapshot_restore_zones: Vec<String>,
}

impl SnapshotParams {
    pub fn parse(parameters: &HashMap<String, String>) -> Result<Self> {
        let mut out = SnapshotParams::default();
        for (key, value) in parameters {
            match key.as_str() {
                PARAM_FSR_AVAILABILITY_ZONES => {
                    out.fast_snapshot_restore_zones = split_zones(value);
                }
                _ if key.starts_with(PARAM_TAG_PREFIX) => {
                    let (k, v) = parse_tag(value)?;
                    out.extra_tags.insert(k, v);
                }
                _ if key.starts_with("csi.storage.k8s.io/") => {}
                _ => {
                    return Err(Error::invalid_argument(format!(
                        "unknown snapshot parameter key '{}'",
                        key
                    )));
                }
            }
        }
        Ok(out)
    }
}

/// Parsed ControllerModifyVolume mutable parameters.
#[derive(Debug, Clone, Default)]
pub struct ModifyParams {
    pub options: ModifyDiskOptions,
    pub tags: HashMap<String, String>,
}

impl ModifyParams {
    pub fn parse(parameters: &HashMap<String, String>) -> Result<Self> {
        let mut out = ModifyParams::default();
        for (key, value) in parameters {
            match key.as_str() {
                PARAM_TYPE => out.options.volume_type = Some(DiskType::parse(value)?),
                PARAM_IOPS => out.options.iops = Some(parse_i32(key, value)?),
                PARAM_THROUGHPUT => out.options.throughput = Some(parse_i32(key, value)?),
                _ if key.starts_with(PARAM_TAG_PREFIX) => {
                    let (k, v) = parse_tag(value)?;
                    out.tags.insert(k, v);
                }
                _ => {
                    return Err(Error::invalid_argument(format!(
                        "unknown mutable parameter key '{}'",
                        key
                    )));
                }
            }
        }
        Ok(out)
    }
}

/// Picks the smallest admissible size in GiB for the requested range.
pub fn negotiate_size_gib(
    required_bytes: i64,
    limit_bytes: i64,
    disk_type: DiskType,
) -> Result<i64> {
    if required_bytes < 0 || limit_bytes < 0 || (limit_bytes > 0 && required_bytes > limit_bytes) {
        return Err(Error::invalid_argument(format!(
            "malformed capacity range [{}, {}]",
            required_bytes, limit_bytes
        )));
    }

    let required = if required_bytes == 0 { GIB } else { required_bytes };
    let size_gib = round_up_to_gib(required).max(disk_type.min_size_gib());

    if limit_bytes > 0 && size_gib * GIB > limit_bytes {
        return Err(Error::invalid_argument(format!(
            "no admissible '{}' size >= {} bytes fits under the {} byte limit",
            disk_type.as_str(),
            required_bytes,
            limit_bytes
        )));
    }
    Ok(size_gib)
}

fn parse_i32(key: &str, v: &str) -> Result<i32> {
    v.parse::<i32>()
        .map_err(|_| Error::invalid_argument(format!("parameter '{}'='{}' is not a number", key, v)))
}

fn parse_bool(key: &str, v: &str) -> Result<bool> {
    match v {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(Error::invalid_argument(format!(
            "parameter '{}'='{}' is not a boolean",
            key, v
        ))),
    }
}

fn parse_tag(value: &str) -> Result<(String, String)> {
    match value.split_once('=') {
        Some((k, v)) if !k.is_empty() => Ok((k.to_string(), v.to_string())),
        _ => Err(Error::invalid_argument(format!(
            "tag specification '{}' is not 'key=value'",
            value
        ))),
    }
}

fn split_zones(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|z| !z.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn parses_the_full_key_set() {
        let p = VolumeParams::parse(&params(&[
            ("type", "gp3"),
            ("iops", "4000"),
            ("throughput", "200"),
            ("encrypted", "true"),
            ("kmsKeyId", "arn:aws:kms:key/abc"),
            ("fsType", "ext4"),
            ("blockSize", "4096"),
            ("ext4BigAlloc", "true"),
            ("tagSpecification_1", "team=storage"),
            ("tagSpecification_2", "env=prod"),
            ("volumeInitializationRate", "200"),
            ("blockAttachUntilInitialized", "true"),
            ("fastSnapshotRestoreAvailabilityZones", "us-west-2a, us-west-2b"),
        ]))
        .unwrap();

        assert_eq!(p.disk_type(), DiskType::Gp3);
        assert_eq!(p.iops, Some(4000));
        assert_eq!(p.throughput, Some(200));
        assert!(p.encrypted);
        assert_eq!(p.fs_type.as_deref(), Some("ext4"));
        assert_eq!(p.extra_tags.get("team").map(String::as_str), Some("storage"));
        assert_eq!(p.extra_tags.len(), 2);
        assert!(p.block_attach_until_initialized);
        assert_eq!(
            p.fast_snapshot_restore_zones,
            vec!["us-west-2a".to_string(), "us-west-2b".to_string()]
        );
    }

    #[test]
    fn unknown_key_is_rejected() {
        let err = VolumeParams::parse(&params(&[("volumeKind", "gp3")])).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { .. }));
    }

    #[test]
    fn orchestrator_bookkeeping_keys_are_tolerated() {
        let p = VolumeParams::parse(&params(&[(
            "csi.storage.k8s.io/pvc/name",
            "data-volume",
        )]))
        .unwrap();
        assert!(p.extra_tags.is_empty());
    }

    #[test]
    fn malformed_tag_specification_is_rejected() {
        let err = VolumeParams::parse(&params(&[("tagSpecification_1", "noequals")])).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { .. }));
    }

    #[test]
    fn format_options_checked_against_fs_type() {
        let err = VolumeParams::parse(&params(&[
            ("fsType", "xfs"),
            ("inodeSize", "512"),
        ]))
        .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { .. }));
    }

    #[test]
    fn iops_per_gb_scales_with_size() {
        let p = VolumeParams::parse(&params(&[("type", "io1"), ("iopsPerGB", "50")])).unwrap();
        assert_eq!(p.resolve_iops(100).unwrap(), Some(5000));
    }

    #[test]
    fn iops_ratio_cap_enforced() {
        let p = VolumeParams::parse(&params(&[("type", "io2"), ("iops", "5000")])).unwrap();
        // 5000 IOPS on 4 GiB breaks the 500 IOPS/GiB ceiling
        let err = p.resolve_iops(4).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { .. }));
        assert_eq!(p.resolve_iops(10).unwrap(), Some(5000));
    }

    #[test]
    fn iops_rejected_for_types_without_iops() {
        let p = VolumeParams::parse(&params(&[("type", "st1"), ("iops", "500")])).unwrap();
        assert!(p.resolve_iops(500).is_err());
    }

    #[test]
    fn throughput_range_and_type() {
        let p = VolumeParams::parse(&params(&[("type", "gp3"), ("throughput", "1001")])).unwrap();
        assert!(p.resolve_throughput().is_err());

        let p = VolumeParams::parse(&params(&[("type", "io2"), ("throughput", "500")])).unwrap();
        assert!(p.resolve_throughput().is_err());

        let p = VolumeParams::parse(&params(&[("type", "gp3"), ("throughput", "1000")])).unwrap();
        assert_eq!(p.resolve_throughput().unwrap(), Some(1000));
    }

    #[test]
    fn size_negotiation_rounds_and_clamps() {
        // rounds up to the next GiB
        assert_eq!(negotiate_size_gib(GIB + 1, 0, DiskType::Gp3).unwrap(), 2);
        // per-type minimum wins over a small request
        assert_eq!(negotiate_size_gib(GIB, 0, DiskType::Io2).unwrap(), 4);
        assert_eq!(negotiate_size_gib(0, 0, DiskType::St1).unwrap(), 500);
        // limit below the admissible size fails
        assert!(negotiate_size_gib(GIB, 2 * GIB, DiskType::Io2).is_err());
        // malformed range fails
        assert!(negotiate_size_gib(4 * GIB, GIB, DiskType::Gp3).is_err());
    }

    #[test]
    fn snapshot_params_parse_and_reject() {
        let p = SnapshotParams::parse(&params(&[
            ("tagSpecification_1", "backup=nightly"),
            ("fastSnapshotRestoreAvailabilityZones", "us-west-2a,us-west-2b"),
        ]))
        .unwrap();
        assert_eq!(p.extra_tags.get("backup").map(String::as_str), Some("nightly"));
        assert_eq!(p.fast_snapshot_restore_zones.len(), 2);

        assert!(SnapshotParams::parse(&params(&[("type", "gp3")])).is_err());
    }

    #[test]
    fn modify_params_parse_and_reject() {
        let p = ModifyParams::parse(&params(&[
            ("type", "io2"),
            ("iops", "6000"),
            ("tagSpecification_1", "tier=hot"),
        ]))
        .unwrap();
        assert_eq!(p.options.volume_type, Some(DiskType::Io2));
        assert_eq!(p.options.iops, Some(6000));
        assert_eq!(p.tags.get("tier").map(String::as_str), Some("hot"));

        assert!(ModifyParams::parse(&params(&[("size", "10")])).is_err());
    }
}
