//! An in-memory cloud with EBS semantics, shared by the service test
//! suites. Attach exclusivity, name tags, client tokens and pagination
//! behave like the real API so the lifecycle invariants are observable
//! without credentials.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use chrono::Utc;

use ebs_csi_driver::{
    cloud::{
        AttachmentState, CloudApi, CreateDiskOptions, Disk, DiskAttachment, DiskState,
        ModifyDiskOptions, Snapshot, SnapshotState, CLUSTER_MARKER_TAG,
        KUBERNETES_CLUSTER_TAG_PREFIX, SNAPSHOT_NAME_TAG, VOLUME_NAME_TAG,
    },
    controller::ControllerService,
    coordination::OperationLocks,
    device::{DeviceAllocator, DeviceNaming},
    errors::{Error, Result},
};

#[derive(Default)]
struct CloudState {
    disks: HashMap<String, Disk>,
    snapshots: HashMap<String, Snapshot>,
    tokens: HashMap<String, String>,
    fast_restores: HashMap<String, Vec<String>>,
    counter: u64,
}

#[derive(Default)]
pub struct FakeCloud {
    state: Mutex<CloudState>,
    /// When set, enable_fast_snapshot_restores fails once.
    pub fail_fast_restore: Mutex<bool>,
}

impl FakeCloud {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn disk(&self, volume_id: &str) -> Option<Disk> {
        self.state.lock().unwrap().disks.get(volume_id).cloned()
    }

    pub fn snapshot_count(&self) -> usize {
        self.state.lock().unwrap().snapshots.len()
    }

    /// Plants an attachment record directly, for exercising reconciliation
    /// against attaches the driver did not issue itself.
    pub fn set_attachment(
        &self,
        volume_id: &str,
        instance_id: &str,
        device: &str,
        state: AttachmentState,
    ) {
        let mut st = self.state.lock().unwrap();
        if let Some(disk) = st.disks.get_mut(volume_id) {
            disk.attachments.retain(|a| a.instance_id != instance_id);
            disk.attachments.push(DiskAttachment {
                instance_id: instance_id.to_string(),
                device: device.to_string(),
                state,
            });
        }
    }

    pub fn fast_restore_zones(&self, snapshot_id: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .fast_restores
            .get(snapshot_id)
            .cloned()
            .unwrap_or_default()
    }

    fn next_id(state: &mut CloudState, prefix: &str) -> String {
        state.counter += 1;
        format!("{}-{:08x}", prefix, state.counter)
    }
}

#[async_trait]
impl CloudApi for FakeCloud {
    async fn create_disk(&self, _name: &str, opts: CreateDiskOptions) -> Result<Disk> {
        let mut state = self.state.lock().unwrap();

        if let Some(existing) = state.tokens.get(&opts.client_token) {
            let disk = state.disks.get(existing).cloned();
            if let Some(disk) = disk {
                return Ok(disk);
            }
        }

        let mut snapshot_id = opts.snapshot_id.clone();
        if let Some(source) = &opts.source_volume_id {
            if !state.disks.contains_key(source) {
                return Err(Error::not_found(source.clone(), "clone source missing"));
            }
            let id = Self::next_id(&mut state, "snap");
            let snap = Snapshot {
                snapshot_id: id.clone(),
                source_volume_id: source.clone(),
                size_bytes: state.disks[source].capacity_bytes,
                state: SnapshotState::Completed,
                created_at: Some(Utc::now()),
                tags: HashMap::new(),
            };
            state.snapshots.insert(id.clone(), snap);
            snapshot_id = Some(id);
        }

        let volume_id = Self::next_id(&mut state, "vol");
        let disk = Disk {
            volume_id: volume_id.clone(),
            capacity_bytes: opts.capacity_bytes,
            volume_type: opts.volume_type.unwrap_or(ebs_csi_driver::cloud::DiskType::Gp3),
            iops: opts.iops,
            throughput: opts.throughput,
            availability_zone: opts.availability_zone.clone(),
            encrypted: opts.encrypted,
            kms_key_id: opts.kms_key_id.clone(),
            outpost_arn: opts.outpost_arn.clone(),
            multi_attach: opts.multi_attach,
            snapshot_id,
            tags: opts.tags.clone(),
            created_at: Some(Utc::now()),
            state: DiskState::Available,
            attachments: Vec::new(),
        };
        state.tokens.insert(opts.client_token, volume_id.clone());
        state.disks.insert(volume_id, disk.clone());
        Ok(disk)
    }

    async fn find_disk_by_name(&self, name: &str) -> Result<Option<Disk>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .disks
            .values()
            .find(|d| d.tags.get(VOLUME_NAME_TAG).map(String::as_str) == Some(name))
            .cloned())
    }

    async fn describe_disk(&self, volume_id: &str) -> Result<Disk> {
        self.disk(volume_id)
            .ok_or_else(|| Error::not_found(volume_id, "no such volume"))
    }

    async fn delete_disk(&self, volume_id: &str) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        match state.disks.get(volume_id) {
            Some(d)
                if d.attachments
                    .iter()
                    .any(|a| a.state != AttachmentState::Detached) =>
            {
                Err(Error::internal(format!(
                    "volume '{}' is attached and cannot be deleted",
                    volume_id
                )))
            }
            Some(_) => {
                state.disks.remove(volume_id);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn attach_disk(&self, volume_id: &str, instance_id: &str, device: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();

        let occupied: Vec<(String, String)> = state
            .disks
            .values()
            .flat_map(|d| d.attachments.iter())
            .filter(|a| a.instance_id == instance_id && a.state != AttachmentState::Detached)
            .map(|a| (a.device.clone(), a.instance_id.clone()))
            .collect();

        let disk = state
            .disks
            .get_mut(volume_id)
            .ok_or_else(|| Error::not_found(volume_id, "no such volume"))?;

        // repeated attach to the same instance settles in place
        if disk
            .attachments
            .iter()
            .any(|a| a.instance_id == instance_id && a.state != AttachmentState::Detached)
        {
            return Ok(());
        }

        if !disk.multi_attach
            && disk
                .attachments
                .iter()
                .any(|a| a.state != AttachmentState::Detached)
        {
            return Err(Error::internal(format!(
                "VolumeInUse: '{}' is attached to another instance",
                volume_id
            )));
        }

        // a device name collision on the node is a cloud-side invariant
        if occupied.iter().any(|(d, _)| d == device) {
            return Err(Error::internal(format!(
                "InvalidParameterValue: device '{}' is in use on '{}'",
                device, instance_id
            )));
        }

        disk.attachments.push(DiskAttachment {
            instance_id: instance_id.to_string(),
            device: device.to_string(),
            state: AttachmentState::Attached,
        });
        disk.state = DiskState::InUse;
        Ok(())
    }

    async fn detach_disk(&self, volume_id: &str, instance_id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(disk) = state.disks.get_mut(volume_id) {
            disk.attachments.retain(|a| a.instance_id != instance_id);
            if disk.attachments.is_empty() {
                disk.state = DiskState::Available;
            }
        }
        Ok(())
    }

    /// The real waiter polls until a transition settles; the fake settles
    /// the transitional states in one step instead. Only a state with no
    /// path to the target (e.g. waiting for `attached` with nothing
    /// attaching) exceeds the deadline.
    async fn wait_for_attachment_state(
        &self,
        volume_id: &str,
        instance_id: &str,
        _device: &str,
        target: AttachmentState,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let Some(disk) = state.disks.get_mut(volume_id) else {
            return match target {
                AttachmentState::Detached => Ok(()),
                _ => Err(Error::DeadlineExceeded {
                    message: format!("attachment of '{}' never settled", volume_id),
                }),
            };
        };

        match target {
            AttachmentState::Attached => {
                let converging = disk.attachments.iter_mut().find(|a| {
                    a.instance_id == instance_id && a.state != AttachmentState::Detached
                });
                match converging {
                    Some(att) => {
                        att.state = AttachmentState::Attached;
                        Ok(())
                    }
                    None => Err(Error::DeadlineExceeded {
                        message: format!("attachment of '{}' never settled", volume_id),
                    }),
                }
            }
            AttachmentState::Detached => {
                disk.attachments
                    .retain(|a| a.instance_id != instance_id || a.state == AttachmentState::Attached);
                let still_attached = disk
                    .attachments
                    .iter()
                    .any(|a| a.instance_id == instance_id);
                if still_attached {
                    Err(Error::DeadlineExceeded {
                        message: format!("detach of '{}' never settled", volume_id),
                    })
                } else {
                    if disk.attachments.is_empty() {
                        disk.state = DiskState::Available;
                    }
                    Ok(())
                }
            }
            _ => Err(Error::DeadlineExceeded {
                message: format!("attachment of '{}' never settled", volume_id),
            }),
        }
    }

    async fn resize_disk(&self, volume_id: &str, new_bytes: i64) -> Result<i64> {
        let mut state = self.state.lock().unwrap();
        let disk = state
            .disks
            .get_mut(volume_id)
            .ok_or_else(|| Error::not_found(volume_id, "no such volume"))?;
        if new_bytes > disk.capacity_bytes {
            disk.capacity_bytes = new_bytes;
        }
        Ok(disk.capacity_bytes)
    }

    async fn modify_disk(&self, volume_id: &str, opts: ModifyDiskOptions) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let disk = state
            .disks
            .get_mut(volume_id)
            .ok_or_else(|| Error::not_found(volume_id, "no such volume"))?;
        if let Some(t) = opts.volume_type {
            disk.volume_type = t;
        }
        if let Some(iops) = opts.iops {
            disk.iops = Some(iops);
        }
        if let Some(tp) = opts.throughput {
            disk.throughput = Some(tp);
        }
        Ok(())
    }

    async fn sync_tags(&self, resource_id: &str, desired: HashMap<String, String>) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let tags = if let Some(d) = state.disks.get_mut(resource_id) {
            &mut d.tags
        } else if let Some(s) = state.snapshots.get_mut(resource_id) {
            &mut s.tags
        } else {
            return Err(Error::not_found(resource_id, "no such resource"));
        };

        tags.retain(|k, _| {
            desired.contains_key(k)
                || k == VOLUME_NAME_TAG
                || k == SNAPSHOT_NAME_TAG
                || k == CLUSTER_MARKER_TAG
                || k.starts_with(KUBERNETES_CLUSTER_TAG_PREFIX)
        });
        tags.extend(desired);
        Ok(())
    }

    async fn create_snapshot(
        &self,
        _name: &str,
        volume_id: &str,
        tags: HashMap<String, String>,
    ) -> Result<Snapshot> {
        let mut state = self.state.lock().unwrap();
        let size = state
            .disks
            .get(volume_id)
            .ok_or_else(|| Error::not_found(volume_id, "no such volume"))?
            .capacity_bytes;

        let id = Self::next_id(&mut state, "snap");
        let snap = Snapshot {
            snapshot_id: id.clone(),
            source_volume_id: volume_id.to_string(),
            size_bytes: size,
            state: SnapshotState::Completed,
            created_at: Some(Utc::now()),
            tags,
        };
        state.snapshots.insert(id, snap.clone());
        Ok(snap)
    }

    async fn find_snapshot_by_name(&self, name: &str) -> Result<Option<Snapshot>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .snapshots
            .values()
            .find(|s| s.tags.get(SNAPSHOT_NAME_TAG).map(String::as_str) == Some(name))
            .cloned())
    }

    async fn describe_snapshot(&self, snapshot_id: &str) -> Result<Snapshot> {
        self.state
            .lock()
            .unwrap()
            .snapshots
            .get(snapshot_id)
            .cloned()
            .ok_or_else(|| Error::not_found(snapshot_id, "no such snapshot"))
    }

    async fn delete_snapshot(&self, snapshot_id: &str) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        Ok(state.snapshots.remove(snapshot_id).is_some())
    }

    async fn wait_for_snapshot_completed(&self, snapshot_id: &str) -> Result<()> {
        self.describe_snapshot(snapshot_id).await.map(|_| ())
    }

    async fn enable_fast_snapshot_restores(
        &self,
        snapshot_id: &str,
        availability_zones: &[String],
    ) -> Result<()> {
        {
            let mut fail = self.fail_fast_restore.lock().unwrap();
            if *fail {
                *fail = false;
                return Err(Error::internal("fast snapshot restore rejected"));
            }
        }
        self.state
            .lock()
            .unwrap()
            .fast_restores
            .insert(snapshot_id.to_string(), availability_zones.to_vec());
        Ok(())
    }

    async fn list_disks(
        &self,
        max_entries: i32,
        starting_token: Option<String>,
    ) -> Result<(Vec<Disk>, Option<String>)> {
        let state = self.state.lock().unwrap();
        let mut disks: Vec<Disk> = state.disks.values().cloned().collect();
        disks.sort_by(|a, b| a.volume_id.cmp(&b.volume_id));
        paginate(disks, max_entries, starting_token)
    }

    async fn list_snapshots(
        &self,
        source_volume_id: Option<&str>,
        snapshot_id: Option<&str>,
        max_entries: i32,
        starting_token: Option<String>,
    ) -> Result<(Vec<Snapshot>, Option<String>)> {
        let state = self.state.lock().unwrap();
        let mut snapshots: Vec<Snapshot> = state
            .snapshots
            .values()
            .filter(|s| source_volume_id.map(|v| s.source_volume_id == v).unwrap_or(true))
            .filter(|s| snapshot_id.map(|id| s.snapshot_id == id).unwrap_or(true))
            .cloned()
            .collect();
        snapshots.sort_by(|a, b| a.snapshot_id.cmp(&b.snapshot_id));
        paginate(snapshots, max_entries, starting_token)
    }

    async fn wait_for_volume_initialized(&self, _volume_id: &str) -> Result<()> {
        Ok(())
    }

    async fn instance_device_names(&self, instance_id: &str) -> Result<Vec<String>> {
        if !instance_id.starts_with("i-") {
            return Err(Error::not_found(instance_id, "no such instance"));
        }
        let state = self.state.lock().unwrap();
        Ok(state
            .disks
            .values()
            .flat_map(|d| d.attachments.iter())
            .filter(|a| a.instance_id == instance_id && a.state != AttachmentState::Detached)
            .map(|a| a.device.clone())
            .collect())
    }
}

fn paginate<T>(
    items: Vec<T>,
    max_entries: i32,
    starting_token: Option<String>,
) -> Result<(Vec<T>, Option<String>)> {
    let start = match starting_token {
        Some(t) => t
            .parse::<usize>()
            .map_err(|_| Error::invalid_argument(format!("bad token '{}'", t)))?,
        None => 0,
    };
    let total = items.len();
    let page: Vec<T> = if max_entries > 0 {
        items
            .into_iter()
            .skip(start)
            .take(max_entries as usize)
            .collect()
    } else {
        items.into_iter().skip(start).collect()
    };
    let consumed = start + page.len();
    let next = (consumed < total).then(|| consumed.to_string());
    Ok((page, next))
}

pub struct Harness {
    pub cloud: Arc<FakeCloud>,
    pub locks: Arc<OperationLocks>,
    pub controller: ControllerService,
}

/// Controller wired to the in-memory cloud, one Linux-named allocator and a
/// default zone, the way the binary assembles it.
pub fn harness() -> Harness {
    harness_with_allocator(DeviceAllocator::new(DeviceNaming::Linux))
}

pub fn harness_with_allocator(allocator: DeviceAllocator) -> Harness {
    let cloud = FakeCloud::new();
    let locks = OperationLocks::new();
    let controller = ControllerService::new(
        Arc::clone(&cloud) as Arc<dyn CloudApi>,
        Arc::clone(&locks),
        Arc::new(allocator),
        HashMap::new(),
        Some("test-cluster".to_string()),
        Some("us-west-2a".to_string()),
    );
    Harness {
        cloud,
        locks,
        controller,
    }
}
