//! Cloud-side model types and the API surface the gRPC services consume.
//!
//! The cloud owns disks and snapshots; the driver holds ids and re-reads
//! authoritative state from describe calls. `CloudApi` is the seam between
//! the services and EC2 so the lifecycle semantics are testable against an
//! in-memory implementation.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};

pub const GIB: i64 = 1024 * 1024 * 1024;

/// Tag carrying the CSI volume name; doubles as the idempotency lookup key.
pub const VOLUME_NAME_TAG: &str = "CSIVolumeName";
/// Tag carrying the CSI snapshot name.
pub const SNAPSHOT_NAME_TAG: &str = "CSISnapshotName";
/// Marker tag stamped on every resource the driver creates.
pub const CLUSTER_MARKER_TAG: &str = "ebs.csi.aws.com/cluster";
/// Ownership tag prefix applied when a cluster id is configured.
pub const KUBERNETES_CLUSTER_TAG_PREFIX: &str = "kubernetes.io/cluster/";

/// Rounds a byte count up to the next full GiB.
pub fn round_up_to_gib(bytes: i64) -> i64 {
    (bytes + GIB - 1) / GIB
}

/// EBS volume performance class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskType {
    Gp2,
    Gp3,
    Io1,
    Io2,
    St1,
    Sc1,
    Standard,
}

impl DiskType {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "gp2" => Ok(DiskType::Gp2),
            "gp3" => Ok(DiskType::Gp3),
            "io1" => Ok(DiskType::Io1),
            "io2" => Ok(DiskType::Io2),
            "st1" => Ok(DiskType::St1),
            "sc1" => Ok(DiskType::Sc1),
            "standard" => Ok(DiskType::Standard),
            other => Err(Error::invalid_argument(format!(
                "unknown volume type '{}'",
                other
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DiskType::Gp2 => "gp2",
            DiskType::Gp3 => "gp3",
            DiskType::Io1 => "io1",
            DiskType::Io2 => "io2",
            DiskType::St1 => "st1",
            DiskType::Sc1 => "sc1",
            DiskType::Standard => "standard",
        }
    }

    /// Smallest admissible size for the class.
    pub fn min_size_gib(&self) -> i64 {
        match self {
            DiskType::Gp2 | DiskType::Gp3 => 1,
            DiskType::Io1 | DiskType::Io2 => 4,
            DiskType::St1 | DiskType::Sc1 => 500,
            DiskType::Standard => 10,
        }
    }

    pub fn supports_iops(&self) -> bool {
        matches!(self, DiskType::Gp3 | DiskType::Io1 | DiskType::Io2)
    }

    pub fn supports_throughput(&self) -> bool {
        matches!(self, DiskType::Gp3)
    }

    /// Multi-attach is an io1/io2 capability.
    pub fn supports_multi_attach(&self) -> bool {
        matches!(self, DiskType::Io1 | DiskType::Io2)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiskState {
    Creating,
    Available,
    InUse,
    Deleting,
    Deleted,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentState {
    Attaching,
    Attached,
    Detaching,
    Detached,
    Busy,
}

/// Progress of background block fetching for volumes created from snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitializationState {
    Uninitialized,
    Initializing,
    Initialized,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskAttachment {
    pub instance_id: String,
    pub device: String,
    pub state: AttachmentState,
}

/// The cloud representation of a block volume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Disk {
    pub volume_id: String,
    pub capacity_bytes: i64,
    pub volume_type: DiskType,
    pub iops: Option<i32>,
    pub throughput: Option<i32>,
    pub availability_zone: String,
    pub encrypted: bool,
    pub kms_key_id: Option<String>,
    pub outpost_arn: Option<String>,
    pub multi_attach: bool,
    pub snapshot_id: Option<String>,
    pub tags: HashMap<String, String>,
    pub created_at: Option<DateTime<Utc>>,
    pub state: DiskState,
    pub attachments: Vec<DiskAttachment>,
}

impl Disk {
    /// The CSI name recorded at creation, if the disk was created by this
    /// driver.
    pub fn csi_name(&self) -> Option<&str> {
        self.tags.get(VOLUME_NAME_TAG).map(String::as_str)
    }

    pub fn attachment_for(&self, instance_id: &str) -> Option<&DiskAttachment> {
        self.attachments
            .iter()
            .find(|a| a.instance_id == instance_id && a.state != AttachmentState::Detached)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotState {
    Pending,
    Completed,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub snapshot_id: String,
    pub source_volume_id: String,
    pub size_bytes: i64,
    pub state: SnapshotState,
    pub created_at: Option<DateTime<Utc>>,
    pub tags: HashMap<String, String>,
}

impl Snapshot {
    pub fn csi_name(&self) -> Option<&str> {
        self.tags.get(SNAPSHOT_NAME_TAG).map(String::as_str)
    }

    pub fn ready(&self) -> bool {
        self.state == SnapshotState::Completed
    }
}

/// Everything needed to create a disk; capacity is already negotiated and
/// is a whole number of GiB.
#[derive(Debug, Clone, Default)]
pub struct CreateDiskOptions {
    pub capacity_bytes: i64,
    pub volume_type: Option<DiskType>,
    pub iops: Option<i32>,
    pub throughput: Option<i32>,
    pub availability_zone: String,
    pub encrypted: bool,
    pub kms_key_id: Option<String>,
    pub outpost_arn: Option<String>,
    pub multi_attach: bool,
    /// Restore source; mutually exclusive with `source_volume_id`.
    pub snapshot_id: Option<String>,
    /// Clone source; realized through an intermediate snapshot.
    pub source_volume_id: Option<String>,
    /// MiB/s hydration rate for snapshot restores.
    pub initialization_rate: Option<i32>,
    pub tags: HashMap<String, String>,
    /// Deterministic idempotency token derived from the CSI name.
    pub client_token: String,
}

/// Mutable attributes for ControllerModifyVolume.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModifyDiskOptions {
    pub volume_type: Option<DiskType>,
    pub iops: Option<i32>,
    pub throughput: Option<i32>,
}

impl ModifyDiskOptions {
    pub fn is_empty(&self) -> bool {
        *self == ModifyDiskOptions::default()
    }
}

/// The EC2 surface the services call through. One implementation wraps the
/// real API; tests provide an in-memory cloud with the same semantics.
#[async_trait]
pub trait CloudApi: Send + Sync {
    async fn create_disk(&self, name: &str, opts: CreateDiskOptions) -> Result<Disk>;

    /// Resolves the idempotency tag to an existing disk, if any.
    async fn find_disk_by_name(&self, name: &str) -> Result<Option<Disk>>;

    async fn describe_disk(&self, volume_id: &str) -> Result<Disk>;

    /// Returns false when the disk was already gone.
    async fn delete_disk(&self, volume_id: &str) -> Result<bool>;

    /// Issues the attach and returns once the cloud accepted it; completion
    /// is observed through `wait_for_attachment_state`.
    async fn attach_disk(&self, volume_id: &str, instance_id: &str, device: &str) -> Result<()>;

    async fn detach_disk(&self, volume_id: &str, instance_id: &str) -> Result<()>;

    async fn wait_for_attachment_state(
        &self,
        volume_id: &str,
        instance_id: &str,
        device: &str,
        target: AttachmentState,
    ) -> Result<()>;

    /// Grows the disk; returns the resulting size in bytes.
    async fn resize_disk(&self, volume_id: &str, new_bytes: i64) -> Result<i64>;

    async fn modify_disk(&self, volume_id: &str, opts: ModifyDiskOptions) -> Result<()>;

    /// Reconciles resource tags toward "desired" (driver-reserved tags are
    /// never removed).
    async fn sync_tags(&self, resource_id: &str, desired: HashMap<String, String>) -> Result<()>;

    async fn create_snapshot(
        &self,
        name: &str,
        volume_id: &str,
        tags: HashMap<String, String>,
    ) -> Result<Snapshot>;

    async fn find_snapshot_by_name(&self, name: &str) -> Result<Option<Snapshot>>;

    async fn describe_snapshot(&self, snapshot_id: &str) -> Result<Snapshot>;

    /// Returns false when the snapshot was already gone.
    async fn delete_snapshot(&self, snapshot_id: &str) -> Result<bool>;

    async fn wait_for_snapshot_completed(&self, snapshot_id: &str) -> Result<()>;

    /// Enables fast snapshot restore in each zone and waits for `enabled`.
    async fn enable_fast_snapshot_restores(
        &self,
        snapshot_id: &str,
        availability_zones: &[String],
    ) -> Result<()>;

    async fn list_disks(
        &self,
        max_entries: i32,
        starting_token: Option<String>,
    ) -> Result<(Vec<Disk>, Option<String>)>;

    async fn list_snapshots(
        &self,
        source_volume_id: Option<&str>,
        snapshot_id: Option<&str>,
        max_entries: i32,
        starting_token: Option<String>,
    ) -> Result<(Vec<Snapshot>, Option<String>)>;

    /// Polls the volume-status initialization detail until `initialized`.
    async fn wait_for_volume_initialized(&self, volume_id: &str) -> Result<()>;

    /// Device names currently occupied on the instance per the latest
    /// describe output.
    async fn instance_device_names(&self, instance_id: &str) -> Result<Vec<String>>;
}
