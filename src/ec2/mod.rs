//! EC2 orchestration.
//!
//! Every EC2 API call the driver makes flows through [`Manager`]. Mutating
//! calls carry deterministic client tokens, throttling and
//! eventual-consistency failures retry locally, and state transitions are
//! observed through the shared polling helper. Describe lookups on the hot
//! path coalesce through the batcher.

pub mod batcher;
pub mod metadata;
pub mod retry;
pub mod waiter;

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use aws_sdk_ec2::types::{
    Filter, ResourceType, Tag, TagSpecification, Volume, VolumeAttachmentState,
    VolumeModificationState, VolumeState, VolumeType,
};
use aws_sdk_ec2::Client;
use aws_smithy_runtime_api::client::result::SdkError;
use aws_smithy_types::error::metadata::ProvideErrorMetadata;
use aws_types::SdkConfig as AwsSdkConfig;
use chrono::{DateTime, Utc};

use crate::{
    cloud::{
        AttachmentState, CloudApi, CreateDiskOptions, Disk, DiskAttachment, DiskState, DiskType,
        ModifyDiskOptions, Snapshot, SnapshotState, CLUSTER_MARKER_TAG,
        KUBERNETES_CLUSTER_TAG_PREFIX, SNAPSHOT_NAME_TAG, VOLUME_NAME_TAG, GIB,
    },
    errors::{is_sdk_err_retryable, sdk_err_code, Error, Result},
};

use batcher::Batcher;
use retry::{with_retries, BackoffPolicy};
use waiter::poll_until;

/// EC2 error codes that mean a hard account or placement limit.
const LIMIT_CODES: &[&str] = &[
    "VolumeLimitExceeded",
    "AttachmentLimitExceeded",
    "MaxIOPSLimitExceeded",
    "SnapshotLimitExceeded",
];

/// Deterministic idempotency token for a CSI logical name.
pub fn client_token(name: &str) -> String {
    use sha2::{Digest, Sha256};
    let digest = Sha256::digest(name.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// How long a described volume stays served from memory. Long enough to
/// absorb bursts, short enough that waiters never poll faster than it
/// expires.
const DESCRIBE_CACHE_TTL: Duration = Duration::from_secs(1);

struct CachedVolume {
    at: Instant,
    volume: Volume,
}

/// Implements the EC2 manager.
#[derive(Clone)]
pub struct Manager {
    #[allow(dead_code)]
    shared_config: AwsSdkConfig,
    pub cli: Client,
    policy: BackoffPolicy,
    describe_batcher: Option<Batcher<Volume>>,
    describe_cache: Arc<RwLock<HashMap<String, CachedVolume>>>,
}

impl Manager {
    pub fn new(shared_config: &AwsSdkConfig) -> Self {
        let cloned = shared_config.clone();
        let cli = Client::new(shared_config);
        Self {
            shared_config: cloned,
            cli,
            policy: BackoffPolicy::default(),
            describe_batcher: None,
            describe_cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Drops the cached view of a volume after a mutation touches it.
    fn invalidate(&self, volume_id: &str) {
        self.describe_cache.write().unwrap().remove(volume_id);
    }

    /// Enables describe coalescing. Must run inside a tokio runtime.
    pub fn with_describe_batching(mut self) -> Self {
        let cli = self.cli.clone();
        let policy = self.policy;
        self.describe_batcher = Some(Batcher::spawn(
            batcher::BATCH_WINDOW,
            batcher::BATCH_FLUSH_COUNT,
            batcher::BATCH_MAX_IDS,
            move |ids| {
                let cli = cli.clone();
                async move {
                    let resp = with_retries(&policy, "describe_volumes", || {
                        let req = cli.describe_volumes().set_volume_ids(Some(ids.clone()));
                        async move {
                            req.send()
                                .await
                                .map_err(|e| wrap_err("describe_volumes", &e))
                        }
                    })
                    .await?;
                    let mut out = HashMap::new();
                    for v in resp.volumes() {
                        if let Some(id) = v.volume_id() {
                            out.insert(id.to_string(), v.clone());
                        }
                    }
                    Ok(out)
                }
            },
        ));
        self
    }

    /// Fetches one volume, serving seconds-fresh state from the cache and
    /// coalescing with concurrent lookups when batching is enabled.
    /// NotFound surfaces as `Error::NotFound`.
    async fn volume(&self, volume_id: &str) -> Result<Volume> {
        {
            let cache = self.describe_cache.read().unwrap();
            if let Some(hit) = cache.get(volume_id) {
                if hit.at.elapsed() < DESCRIBE_CACHE_TTL {
                    return Ok(hit.volume.clone());
                }
            }
        }

        let fetched = self.volume_uncached(volume_id).await?;
        self.describe_cache.write().unwrap().insert(
            volume_id.to_string(),
            CachedVolume {
                at: Instant::now(),
                volume: fetched.clone(),
            },
        );
        Ok(fetched)
    }

    async fn volume_uncached(&self, volume_id: &str) -> Result<Volume> {
        if let Some(b) = &self.describe_batcher {
            return b.get(volume_id).await;
        }

        let resp = with_retries(&self.policy, "describe_volumes", || {
            let req = self.cli.describe_volumes().volume_ids(volume_id);
            async move {
                req.send().await.map_err(|e| {
                    if sdk_err_code(&e).as_deref() == Some("InvalidVolume.NotFound") {
                        Error::not_found(volume_id, "no such volume")
                    } else {
                        wrap_err("describe_volumes", &e)
                    }
                })
            }
        })
        .await?;

        resp.volumes()
            .first()
            .cloned()
            .ok_or_else(|| Error::not_found(volume_id, "no such volume"))
    }

    async fn volume_by_filters(&self, filters: Vec<Filter>) -> Result<Option<Volume>> {
        let resp = with_retries(&self.policy, "describe_volumes", || {
            let req = self
                .cli
                .describe_volumes()
                .set_filters(Some(filters.clone()));
            async move {
                req.send()
                    .await
                    .map_err(|e| wrap_err("describe_volumes", &e))
            }
        })
        .await?;

        Ok(resp.volumes().first().cloned())
    }

    async fn snapshot_raw(&self, snapshot_id: &str) -> Result<aws_sdk_ec2::types::Snapshot> {
        let resp = with_retries(&self.policy, "describe_snapshots", || {
            let req = self.cli.describe_snapshots().snapshot_ids(snapshot_id);
            async move {
                req.send().await.map_err(|e| {
                    if sdk_err_code(&e).as_deref() == Some("InvalidSnapshot.NotFound") {
                        Error::not_found(snapshot_id, "no such snapshot")
                    } else {
                        wrap_err("describe_snapshots", &e)
                    }
                })
            }
        })
        .await?;

        resp.snapshots()
            .first()
            .cloned()
            .ok_or_else(|| Error::not_found(snapshot_id, "no such snapshot"))
    }

    /// Waits for a freshly created volume to leave `creating`. NotFound is
    /// eventual consistency here and keeps the poll going.
    async fn wait_for_volume_created(&self, volume_id: &str) -> Result<Disk> {
        poll_until(waiter::CREATE, "volume create", || async {
            match self.volume(volume_id).await {
                Ok(v) => match v.state() {
                    Some(VolumeState::Available) | Some(VolumeState::InUse) => {
                        Ok(Some(disk_from_volume(&v)?))
                    }
                    Some(VolumeState::Error) => Err(Error::internal(format!(
                        "volume '{}' entered error state during create",
                        volume_id
                    ))),
                    _ => Ok(None),
                },
                Err(Error::NotFound { .. }) => Ok(None),
                Err(e) => Err(e),
            }
        })
        .await
    }

    /// Creates the intermediate snapshot realizing a volume-clone source.
    async fn clone_source_snapshot(&self, name: &str, source_volume_id: &str) -> Result<Snapshot> {
        let snapshot_name = format!("{}-clone-src", name);
        if let Some(existing) = self.find_snapshot_by_name(&snapshot_name).await? {
            return Ok(existing);
        }

        let mut tags = HashMap::new();
        tags.insert(SNAPSHOT_NAME_TAG.to_string(), snapshot_name.clone());
        tags.insert(CLUSTER_MARKER_TAG.to_string(), "true".to_string());
        self.create_snapshot(&snapshot_name, source_volume_id, tags)
            .await
    }

    /// Polls modify-volume progress until `optimizing` or `completed`.
    async fn wait_for_modification_settled(&self, volume_id: &str) -> Result<()> {
        let what = format!("modification of '{}'", volume_id);
        poll_until(waiter::MODIFY, &what, || async {
            let ret = with_retries(&self.policy, "describe_volumes_modifications", || {
                let req = self
                    .cli
                    .describe_volumes_modifications()
                    .volume_ids(volume_id);
                async move {
                    req.send().await.map_err(|e| {
                        if sdk_err_code(&e).as_deref()
                            == Some("InvalidVolumeModification.NotFound")
                        {
                            // no record: the change settled long ago
                            Error::not_found(volume_id, "no modification in progress")
                        } else {
                            wrap_err("describe_volumes_modifications", &e)
                        }
                    })
                }
            })
            .await;

            let resp = match ret {
                Ok(r) => r,
                Err(Error::NotFound { .. }) => return Ok(Some(())),
                Err(e) => return Err(e),
            };

            match resp
                .volumes_modifications()
                .first()
                .and_then(|m| m.modification_state())
            {
                Some(VolumeModificationState::Optimizing)
                | Some(VolumeModificationState::Completed)
                | None => Ok(Some(())),
                Some(VolumeModificationState::Failed) => Err(Error::internal(format!(
                    "modification of volume '{}' failed",
                    volume_id
                ))),
                _ => Ok(None),
            }
        })
        .await
    }
}

#[async_trait]
impl CloudApi for Manager {
    async fn create_disk(&self, name: &str, opts: CreateDiskOptions) -> Result<Disk> {
        let size_gib = opts.capacity_bytes / GIB;
        log::info!(
            "creating volume '{}' ({} GiB, {:?}) in '{}'",
            name,
            size_gib,
            opts.volume_type,
            opts.availability_zone
        );

        // a clone source becomes a restore through an intermediate snapshot
        let mut snapshot_id = opts.snapshot_id.clone();
        let mut intermediate_snapshot = None;
        if let Some(source) = &opts.source_volume_id {
            let snap = self.clone_source_snapshot(name, source).await?;
            self.wait_for_snapshot_completed(&snap.snapshot_id).await?;
            intermediate_snapshot = Some(snap.snapshot_id.clone());
            snapshot_id = Some(snap.snapshot_id);
        }

        let tag_spec = tag_specification(ResourceType::Volume, &opts.tags);
        let resp = with_retries(&self.policy, "create_volume", || {
            let mut req = self
                .cli
                .create_volume()
                .availability_zone(&opts.availability_zone)
                .size(size_gib as i32)
                .client_token(&opts.client_token)
                .encrypted(opts.encrypted)
                .tag_specifications(tag_spec.clone());
            if let Some(t) = opts.volume_type {
                req = req.volume_type(to_sdk_volume_type(t));
            }
            if let Some(iops) = opts.iops {
                req = req.iops(iops);
            }
            if let Some(tp) = opts.throughput {
                req = req.throughput(tp);
            }
            if let Some(kms) = &opts.kms_key_id {
                req = req.kms_key_id(kms);
            }
            if let Some(arn) = &opts.outpost_arn {
                req = req.outpost_arn(arn);
            }
            if opts.multi_attach {
                req = req.multi_attach_enabled(true);
            }
            if let Some(snap) = &snapshot_id {
                req = req.snapshot_id(snap);
            }
            if let Some(rate) = opts.initialization_rate {
                req = req.volume_initialization_rate(rate);
            }
            async move {
                req.send()
                    .await
                    .map_err(|e| map_limit_err("create_volume", &e))
            }
        })
        .await?;

        let volume_id = resp
            .volume_id()
            .ok_or_else(|| Error::internal("create_volume response carried no volume id"))?
            .to_string();

        let disk = self.wait_for_volume_created(&volume_id).await?;

        // the restore no longer needs the intermediate snapshot
        if let Some(snap) = intermediate_snapshot {
            if let Err(e) = self.delete_snapshot(&snap).await {
                log::warn!(
                    "leaving intermediate snapshot '{}' behind: {}",
                    snap,
                    e.message()
                );
            }
        }

        log::info!("created volume '{}' as '{}'", name, disk.volume_id);
        Ok(disk)
    }

    async fn find_disk_by_name(&self, name: &str) -> Result<Option<Disk>> {
        let filters = vec![Filter::builder()
            .name(format!("tag:{}", VOLUME_NAME_TAG))
            .values(name)
            .build()];
        match self.volume_by_filters(filters).await? {
            Some(v) => {
                // a deleted volume can linger in describe output
                match v.state() {
                    Some(VolumeState::Deleted) | Some(VolumeState::Deleting) => Ok(None),
                    _ => Ok(Some(disk_from_volume(&v)?)),
                }
            }
            None => Ok(None),
        }
    }

    async fn describe_disk(&self, volume_id: &str) -> Result<Disk> {
        let v = self.volume(volume_id).await?;
        disk_from_volume(&v)
    }

    async fn delete_disk(&self, volume_id: &str) -> Result<bool> {
        log::info!("deleting volume '{}'", volume_id);
        let ret = with_retries(&self.policy, "delete_volume", || {
            let req = self.cli.delete_volume().volume_id(volume_id);
            async move {
                req.send().await.map_err(|e| {
                    if sdk_err_code(&e).as_deref() == Some("InvalidVolume.NotFound") {
                        Error::not_found(volume_id, "no such volume")
                    } else {
                        wrap_err("delete_volume", &e)
                    }
                })
            }
        })
        .await;

        self.invalidate(volume_id);
        match ret {
            Ok(_) => Ok(true),
            Err(Error::NotFound { .. }) => {
                log::warn!("volume '{}' already deleted", volume_id);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn attach_disk(&self, volume_id: &str, instance_id: &str, device: &str) -> Result<()> {
        log::info!(
            "attaching volume '{}' to '{}' at '{}'",
            volume_id,
            instance_id,
            device
        );
        let ret = with_retries(&self.policy, "attach_volume", || {
            let req = self
                .cli
                .attach_volume()
                .volume_id(volume_id)
                .instance_id(instance_id)
                .device(device);
            async move {
                req.send().await.map_err(|e| {
                    // another attach or a trailing detach is still settling;
                    // back off and retry until the policy gives up
                    if sdk_err_code(&e).as_deref() == Some("VolumeInUse") {
                        Error::API {
                            message: format!("failed attach_volume {:?}", e),
                            retryable: true,
                        }
                    } else {
                        map_limit_err("attach_volume", &e)
                    }
                })
            }
        })
        .await;

        self.invalidate(volume_id);
        match ret {
            Ok(_) => Ok(()),
            Err(e) => {
                // reconcile: the volume may already sit on this instance
                if let Ok(disk) = self.describe_disk(volume_id).await {
                    if disk.attachment_for(instance_id).is_some() {
                        log::warn!(
                            "volume '{}' already attached to '{}', treating attach as settled",
                            volume_id,
                            instance_id
                        );
                        return Ok(());
                    }
                }
                Err(e)
            }
        }
    }

    async fn detach_disk(&self, volume_id: &str, instance_id: &str) -> Result<()> {
        log::info!("detaching volume '{}' from '{}'", volume_id, instance_id);
        let ret = with_retries(&self.policy, "detach_volume", || {
            let req = self
                .cli
                .detach_volume()
                .volume_id(volume_id)
                .instance_id(instance_id);
            async move {
                req.send().await.map_err(|e| {
                    match sdk_err_code(&e).as_deref() {
                        // already gone either way
                        Some("InvalidAttachment.NotFound")
                        | Some("InvalidVolume.NotFound")
                        | Some("IncorrectState") => {
                            Error::not_found(volume_id, "attachment already gone")
                        }
                        _ => wrap_err("detach_volume", &e),
                    }
                })
            }
        })
        .await;

        self.invalidate(volume_id);
        match ret {
            Ok(_) => Ok(()),
            Err(Error::NotFound { .. }) => {
                log::warn!("volume '{}' not attached to '{}'", volume_id, instance_id);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn wait_for_attachment_state(
        &self,
        volume_id: &str,
        instance_id: &str,
        device: &str,
        target: AttachmentState,
    ) -> Result<()> {
        let what = format!("attachment of '{}' to '{}'", volume_id, instance_id);
        poll_until(waiter::ATTACHMENT, &what, || async {
            let v = match self.volume(volume_id).await {
                Ok(v) => v,
                Err(Error::NotFound { .. }) if target == AttachmentState::Detached => {
                    return Ok(Some(()));
                }
                Err(e) => return Err(e),
            };

            let current = v
                .attachments()
                .iter()
                .find(|a| {
                    a.instance_id() == Some(instance_id)
                        && (target != AttachmentState::Attached || a.device() == Some(device))
                })
                .and_then(|a| a.state())
                .map(attachment_state_from_sdk);

            let settled = match target {
                AttachmentState::Detached => {
                    matches!(current, None | Some(AttachmentState::Detached))
                }
                t => current == Some(t),
            };
            Ok(settled.then_some(()))
        })
        .await
    }

    async fn resize_disk(&self, volume_id: &str, new_bytes: i64) -> Result<i64> {
        let target_gib = crate::cloud::round_up_to_gib(new_bytes);
        let disk = self.describe_disk(volume_id).await?;
        let current_gib = disk.capacity_bytes / GIB;
        if current_gib >= target_gib {
            log::info!(
                "volume '{}' already {} GiB, skipping modify",
                volume_id,
                current_gib
            );
            return Ok(current_gib * GIB);
        }

        log::info!(
            "resizing volume '{}' from {} GiB to {} GiB",
            volume_id,
            current_gib,
            target_gib
        );
        with_retries(&self.policy, "modify_volume", || {
            let req = self
                .cli
                .modify_volume()
                .volume_id(volume_id)
                .size(target_gib as i32);
            async move {
                req.send()
                    .await
                    .map_err(|e| map_limit_err("modify_volume", &e))
            }
        })
        .await?;

        self.invalidate(volume_id);
        self.wait_for_modification_settled(volume_id).await?;
        Ok(target_gib * GIB)
    }

    async fn modify_disk(&self, volume_id: &str, opts: ModifyDiskOptions) -> Result<()> {
        if opts.is_empty() {
            return Ok(());
        }
        log::info!("modifying volume '{}' with {:?}", volume_id, opts);
        with_retries(&self.policy, "modify_volume", || {
            let mut req = self.cli.modify_volume().volume_id(volume_id);
            if let Some(t) = opts.volume_type {
                req = req.volume_type(to_sdk_volume_type(t));
            }
            if let Some(iops) = opts.iops {
                req = req.iops(iops);
            }
            if let Some(tp) = opts.throughput {
                req = req.throughput(tp);
            }
            async move {
                req.send()
                    .await
                    .map_err(|e| map_limit_err("modify_volume", &e))
            }
        })
        .await?;

        self.invalidate(volume_id);
        self.wait_for_modification_settled(volume_id).await
    }

    async fn sync_tags(&self, resource_id: &str, desired: HashMap<String, String>) -> Result<()> {
        let resp = with_retries(&self.policy, "describe_tags", || {
            let req = self.cli.describe_tags().filters(
                Filter::builder()
                    .name("resource-id")
                    .values(resource_id)
                    .build(),
            );
            async move { req.send().await.map_err(|e| wrap_err("describe_tags", &e)) }
        })
        .await?;

        let mut current = HashMap::new();
        for t in resp.tags() {
            if let (Some(k), Some(v)) = (t.key(), t.value()) {
                current.insert(k.to_string(), v.to_string());
            }
        }

        let (to_add, to_remove) = diff_tags(&current, &desired);
        log::info!(
            "syncing tags on '{}': {} upserts, {} removals",
            resource_id,
            to_add.len(),
            to_remove.len()
        );

        if !to_add.is_empty() {
            with_retries(&self.policy, "create_tags", || {
                let mut req = self.cli.create_tags().resources(resource_id);
                for (k, v) in &to_add {
                    req = req.tags(Tag::builder().key(k).value(v).build());
                }
                async move { req.send().await.map_err(|e| wrap_err("create_tags", &e)) }
            })
            .await?;
        }

        if !to_remove.is_empty() {
            with_retries(&self.policy, "delete_tags", || {
                let mut req = self.cli.delete_tags().resources(resource_id);
                for k in &to_remove {
                    req = req.tags(Tag::builder().key(k).build());
                }
                async move { req.send().await.map_err(|e| wrap_err("delete_tags", &e)) }
            })
            .await?;
        }

        Ok(())
    }

    async fn create_snapshot(
        &self,
        name: &str,
        volume_id: &str,
        tags: HashMap<String, String>,
    ) -> Result<Snapshot> {
        log::info!("creating snapshot '{}' of volume '{}'", name, volume_id);
        let tag_spec = tag_specification(ResourceType::Snapshot, &tags);
        let resp = with_retries(&self.policy, "create_snapshot", || {
            let req = self
                .cli
                .create_snapshot()
                .volume_id(volume_id)
                .description(format!("snapshot '{}' created by ebs-csi-driver", name))
                .tag_specifications(tag_spec.clone());
            async move {
                req.send().await.map_err(|e| {
                    if sdk_err_code(&e).as_deref() == Some("InvalidVolume.NotFound") {
                        Error::not_found(volume_id, "snapshot source volume missing")
                    } else {
                        map_limit_err("create_snapshot", &e)
                    }
                })
            }
        })
        .await?;

        let snapshot_id = resp
            .snapshot_id()
            .ok_or_else(|| Error::internal("create_snapshot response carried no snapshot id"))?
            .to_string();

        Ok(Snapshot {
            snapshot_id,
            source_volume_id: volume_id.to_string(),
            size_bytes: resp.volume_size().unwrap_or(0) as i64 * GIB,
            state: resp
                .state()
                .map(snapshot_state_from_sdk)
                .unwrap_or(SnapshotState::Pending),
            created_at: resp.start_time().and_then(datetime_from_sdk),
            tags,
        })
    }

    async fn find_snapshot_by_name(&self, name: &str) -> Result<Option<Snapshot>> {
        let resp = with_retries(&self.policy, "describe_snapshots", || {
            let req = self.cli.describe_snapshots().owner_ids("self").filters(
                Filter::builder()
                    .name(format!("tag:{}", SNAPSHOT_NAME_TAG))
                    .values(name)
                    .build(),
            );
            async move {
                req.send()
                    .await
                    .map_err(|e| wrap_err("describe_snapshots", &e))
            }
        })
        .await?;

        Ok(resp.snapshots().first().map(snapshot_from_sdk))
    }

    async fn describe_snapshot(&self, snapshot_id: &str) -> Result<Snapshot> {
        let s = self.snapshot_raw(snapshot_id).await?;
        Ok(snapshot_from_sdk(&s))
    }

    async fn delete_snapshot(&self, snapshot_id: &str) -> Result<bool> {
        log::info!("deleting snapshot '{}'", snapshot_id);
        let ret = with_retries(&self.policy, "delete_snapshot", || {
            let req = self.cli.delete_snapshot().snapshot_id(snapshot_id);
            async move {
                req.send().await.map_err(|e| {
                    if sdk_err_code(&e).as_deref() == Some("InvalidSnapshot.NotFound") {
                        Error::not_found(snapshot_id, "no such snapshot")
                    } else {
                        wrap_err("delete_snapshot", &e)
                    }
                })
            }
        })
        .await;

        match ret {
            Ok(_) => Ok(true),
            Err(Error::NotFound { .. }) => {
                log::warn!("snapshot '{}' already deleted", snapshot_id);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn wait_for_snapshot_completed(&self, snapshot_id: &str) -> Result<()> {
        let what = format!("snapshot '{}' completion", snapshot_id);
        poll_until(waiter::SNAPSHOT, &what, || async {
            let s = self.snapshot_raw(snapshot_id).await?;
            match s.state() {
                Some(aws_sdk_ec2::types::SnapshotState::Completed) => Ok(Some(())),
                Some(aws_sdk_ec2::types::SnapshotState::Error) => Err(Error::internal(format!(
                    "snapshot '{}' entered error state",
                    snapshot_id
                ))),
                _ => Ok(None),
            }
        })
        .await
    }

    async fn enable_fast_snapshot_restores(
        &self,
        snapshot_id: &str,
        availability_zones: &[String],
    ) -> Result<()> {
        if availability_zones.is_empty() {
            return Ok(());
        }
        log::info!(
            "enabling fast snapshot restore for '{}' in {:?}",
            snapshot_id,
            availability_zones
        );

        let resp = with_retries(&self.policy, "enable_fast_snapshot_restores", || {
            let req = self
                .cli
                .enable_fast_snapshot_restores()
                .set_availability_zones(Some(availability_zones.to_vec()))
                .source_snapshot_ids(snapshot_id);
            async move {
                req.send()
                    .await
                    .map_err(|e| wrap_err("enable_fast_snapshot_restores", &e))
            }
        })
        .await?;

        if !resp.unsuccessful().is_empty() {
            return Err(Error::internal(format!(
                "fast snapshot restore rejected for '{}': {:?}",
                snapshot_id,
                resp.unsuccessful()
            )));
        }

        let wanted = availability_zones.len();
        let what = format!("fast snapshot restore for '{}'", snapshot_id);
        poll_until(waiter::FAST_RESTORE, &what, || async {
            let resp = with_retries(&self.policy, "describe_fast_snapshot_restores", || {
                let req = self.cli.describe_fast_snapshot_restores().filters(
                    Filter::builder()
                        .name("snapshot-id")
                        .values(snapshot_id)
                        .build(),
                );
                async move {
                    req.send()
                        .await
                        .map_err(|e| wrap_err("describe_fast_snapshot_restores", &e))
                }
            })
            .await?;

            let enabled = resp
                .fast_snapshot_restores()
                .iter()
                .filter(|item| {
                    matches!(
                        item.state(),
                        Some(aws_sdk_ec2::types::FastSnapshotRestoreStateCode::Enabled)
                    )
                })
                .count();
            Ok((enabled >= wanted).then_some(()))
        })
        .await
    }

    async fn list_disks(
        &self,
        max_entries: i32,
        starting_token: Option<String>,
    ) -> Result<(Vec<Disk>, Option<String>)> {
        let resp = with_retries(&self.policy, "describe_volumes", || {
            let mut req = self.cli.describe_volumes().filters(
                Filter::builder()
                    .name("tag-key")
                    .values(VOLUME_NAME_TAG)
                    .build(),
            );
            if max_entries > 0 {
                // EC2 bounds MaxResults to 5..=500
                req = req.max_results(max_entries.clamp(5, 500));
            }
            if let Some(token) = &starting_token {
                req = req.next_token(token);
            }
            async move {
                req.send()
                    .await
                    .map_err(|e| wrap_err("describe_volumes", &e))
            }
        })
        .await?;

        let mut disks = Vec::new();
        for v in resp.volumes() {
            disks.push(disk_from_volume(v)?);
        }
        Ok((disks, resp.next_token().map(str::to_string)))
    }

    async fn list_snapshots(
        &self,
        source_volume_id: Option<&str>,
        snapshot_id: Option<&str>,
        max_entries: i32,
        starting_token: Option<String>,
    ) -> Result<(Vec<Snapshot>, Option<String>)> {
        if let Some(id) = snapshot_id {
            // a lookup for one id returns empty rather than NotFound
            return match self.snapshot_raw(id).await {
                Ok(s) => Ok((vec![snapshot_from_sdk(&s)], None)),
                Err(Error::NotFound { .. }) => Ok((Vec::new(), None)),
                Err(e) => Err(e),
            };
        }

        let resp = with_retries(&self.policy, "describe_snapshots", || {
            let mut req = self.cli.describe_snapshots().owner_ids("self").filters(
                Filter::builder()
                    .name("tag-key")
                    .values(SNAPSHOT_NAME_TAG)
                    .build(),
            );
            if let Some(vol) = source_volume_id {
                req = req.filters(Filter::builder().name("volume-id").values(vol).build());
            }
            if max_entries > 0 {
                req = req.max_results(max_entries.clamp(5, 500));
            }
            if let Some(token) = &starting_token {
                req = req.next_token(token);
            }
            async move {
                req.send()
                    .await
                    .map_err(|e| wrap_err("describe_snapshots", &e))
            }
        })
        .await?;

        let snapshots = resp.snapshots().iter().map(snapshot_from_sdk).collect();
        Ok((snapshots, resp.next_token().map(str::to_string)))
    }

    async fn wait_for_volume_initialized(&self, volume_id: &str) -> Result<()> {
        let what = format!("initialization of '{}'", volume_id);
        poll_until(waiter::INITIALIZATION, &what, || async {
            let resp = with_retries(&self.policy, "describe_volume_status", || {
                let req = self.cli.describe_volume_status().volume_ids(volume_id);
                async move {
                    req.send()
                        .await
                        .map_err(|e| wrap_err("describe_volume_status", &e))
                }
            })
            .await?;

            let state = resp
                .volume_statuses()
                .first()
                .and_then(|item| item.volume_status())
                .and_then(|info| {
                    info.details()
                        .iter()
                        .find(|d| d.name().map(|n| n.as_str()) == Some("initialization-state"))
                        .and_then(|d| d.status())
                })
                .map(str::to_string);

            match state.as_deref() {
                // volumes not created from a snapshot report no detail at all
                Some("initialized") | Some("completed") | None => Ok(Some(())),
                other => {
                    log::debug!("volume '{}' initialization-state {:?}", volume_id, other);
                    Ok(None)
                }
            }
        })
        .await
    }

    async fn instance_device_names(&self, instance_id: &str) -> Result<Vec<String>> {
        let resp = with_retries(&self.policy, "describe_instances", || {
            let req = self.cli.describe_instances().instance_ids(instance_id);
            async move {
                req.send().await.map_err(|e| {
                    if sdk_err_code(&e)
                        .as_deref()
                        .map(|c| c.starts_with("InvalidInstanceID"))
                        .unwrap_or(false)
                    {
                        Error::not_found(instance_id, "no such instance")
                    } else {
                        wrap_err("describe_instances", &e)
                    }
                })
            }
        })
        .await?;

        let instance = resp
            .reservations()
            .iter()
            .flat_map(|r| r.instances())
            .find(|i| i.instance_id() == Some(instance_id))
            .ok_or_else(|| Error::not_found(instance_id, "no such instance"))?;

        Ok(instance
            .block_device_mappings()
            .iter()
            .filter_map(|m| m.device_name().map(str::to_string))
            .collect())
    }
}

fn wrap_err<E, R>(op: &str, e: &SdkError<E, R>) -> Error
where
    E: ProvideErrorMetadata + std::fmt::Debug,
    R: std::fmt::Debug,
{
    let code = sdk_err_code(e);
    let retryable =
        is_sdk_err_retryable(e) || code.as_deref().map(retry::is_throttle).unwrap_or(false);
    Error::API {
        message: format!("failed {} {:?}", op, e),
        retryable,
    }
}

/// Like [`wrap_err`] but turns hard limit codes into `ResourceExhausted`.
fn map_limit_err<E, R>(op: &str, e: &SdkError<E, R>) -> Error
where
    E: ProvideErrorMetadata + std::fmt::Debug,
    R: std::fmt::Debug,
{
    if let Some(code) = sdk_err_code(e) {
        if LIMIT_CODES.contains(&code.as_str()) {
            return Error::ResourceExhausted {
                message: format!("failed {} ({})", op, code),
            };
        }
    }
    wrap_err(op, e)
}

fn to_sdk_volume_type(t: DiskType) -> VolumeType {
    match t {
        DiskType::Gp2 => VolumeType::Gp2,
        DiskType::Gp3 => VolumeType::Gp3,
        DiskType::Io1 => VolumeType::Io1,
        DiskType::Io2 => VolumeType::Io2,
        DiskType::St1 => VolumeType::St1,
        DiskType::Sc1 => VolumeType::Sc1,
        DiskType::Standard => VolumeType::Standard,
    }
}

fn tag_specification(
    resource_type: ResourceType,
    tags: &HashMap<String, String>,
) -> TagSpecification {
    let mut builder = TagSpecification::builder().resource_type(resource_type);
    // deterministic order keeps request logs diffable
    let mut keys: Vec<&String> = tags.keys().collect();
    keys.sort();
    for k in keys {
        builder = builder.tags(Tag::builder().key(k).value(&tags[k]).build());
    }
    builder.build()
}

/// Tag reconciliation: upsert everything in "desired", remove current tags
/// absent from it, but never strip the driver-reserved identity tags.
fn diff_tags(
    current: &HashMap<String, String>,
    desired: &HashMap<String, String>,
) -> (Vec<(String, String)>, Vec<String>) {
    let mut to_add: Vec<(String, String)> = desired
        .iter()
        .filter(|(k, v)| current.get(*k) != Some(*v))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    to_add.sort();

    let mut to_remove: Vec<String> = current
        .keys()
        .filter(|k| !desired.contains_key(*k))
        .filter(|k| {
            k.as_str() != VOLUME_NAME_TAG
                && k.as_str() != SNAPSHOT_NAME_TAG
                && k.as_str() != CLUSTER_MARKER_TAG
                && !k.starts_with(KUBERNETES_CLUSTER_TAG_PREFIX)
        })
        .cloned()
        .collect();
    to_remove.sort();

    (to_add, to_remove)
}

fn attachment_state_from_sdk(s: &VolumeAttachmentState) -> AttachmentState {
    match s {
        VolumeAttachmentState::Attached => AttachmentState::Attached,
        VolumeAttachmentState::Attaching => AttachmentState::Attaching,
        VolumeAttachmentState::Busy => AttachmentState::Busy,
        VolumeAttachmentState::Detaching => AttachmentState::Detaching,
        _ => AttachmentState::Detached,
    }
}

fn snapshot_state_from_sdk(s: &aws_sdk_ec2::types::SnapshotState) -> SnapshotState {
    match s {
        aws_sdk_ec2::types::SnapshotState::Completed => SnapshotState::Completed,
        aws_sdk_ec2::types::SnapshotState::Error => SnapshotState::Error,
        _ => SnapshotState::Pending,
    }
}

fn datetime_from_sdk(dt: &aws_smithy_types::DateTime) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp(dt.secs(), dt.subsec_nanos())
}

fn tags_from_sdk(tags: &[Tag]) -> HashMap<String, String> {
    tags.iter()
        .filter_map(|t| match (t.key(), t.value()) {
            (Some(k), Some(v)) => Some((k.to_string(), v.to_string())),
            _ => None,
        })
        .collect()
}

fn disk_from_volume(v: &Volume) -> Result<Disk> {
    let volume_id = v
        .volume_id()
        .ok_or_else(|| Error::internal("describe returned a volume without an id"))?
        .to_string();

    let volume_type = v
        .volume_type()
        .map(|t| DiskType::parse(t.as_str()))
        .transpose()?
        .unwrap_or(DiskType::Gp2);

    let state = match v.state() {
        Some(VolumeState::Available) => DiskState::Available,
        Some(VolumeState::Creating) => DiskState::Creating,
        Some(VolumeState::InUse) => DiskState::InUse,
        Some(VolumeState::Deleting) => DiskState::Deleting,
        Some(VolumeState::Deleted) => DiskState::Deleted,
        _ => DiskState::Error,
    };

    Ok(Disk {
        volume_id,
        capacity_bytes: v.size().unwrap_or(0) as i64 * GIB,
        volume_type,
        iops: v.iops(),
        throughput: v.throughput(),
        availability_zone: v.availability_zone().unwrap_or_default().to_string(),
        encrypted: v.encrypted().unwrap_or(false),
        kms_key_id: v.kms_key_id().map(str::to_string),
        outpost_arn: v.outpost_arn().map(str::to_string),
        multi_attach: v.multi_attach_enabled().unwrap_or(false),
        snapshot_id: v
            .snapshot_id()
            .filter(|s| !s.is_empty())
            .map(str::to_string),
        tags: tags_from_sdk(v.tags()),
        created_at: v.create_time().and_then(datetime_from_sdk),
        state,
        attachments: v
            .attachments()
            .iter()
            .filter_map(|a| {
                Some(DiskAttachment {
                    instance_id: a.instance_id()?.to_string(),
                    device: a.device().unwrap_or_default().to_string(),
                    state: a
                        .state()
                        .map(attachment_state_from_sdk)
                        .unwrap_or(AttachmentState::Detached),
                })
            })
            .collect(),
    })
}

fn snapshot_from_sdk(s: &aws_sdk_ec2::types::Snapshot) -> Snapshot {
    Snapshot {
        snapshot_id: s.snapshot_id().unwrap_or_default().to_string(),
        source_volume_id: s.volume_id().unwrap_or_default().to_string(),
        size_bytes: s.volume_size().unwrap_or(0) as i64 * GIB,
        state: s
            .state()
            .map(snapshot_state_from_sdk)
            .unwrap_or(SnapshotState::Pending),
        created_at: s.start_time().and_then(datetime_from_sdk),
        tags: tags_from_sdk(s.tags()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_token_is_deterministic_and_hex() {
        let a = client_token("pvc-7d2f1e9a");
        let b = client_token("pvc-7d2f1e9a");
        let c = client_token("pvc-other");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|ch| ch.is_ascii_hexdigit()));
    }

    #[test]
    fn tag_diffing_upserts_and_removes() {
        let mut current = HashMap::new();
        current.insert("team".to_string(), "storage".to_string());
        current.insert("env".to_string(), "dev".to_string());
        current.insert(VOLUME_NAME_TAG.to_string(), "pvc-1".to_string());
        current.insert(
            format!("{}{}", KUBERNETES_CLUSTER_TAG_PREFIX, "prod"),
            "owned".to_string(),
        );

        let mut desired = HashMap::new();
        desired.insert("env".to_string(), "prod".to_string());
        desired.insert("owner".to_string(), "db".to_string());

        let (to_add, to_remove) = diff_tags(&current, &desired);
        assert_eq!(
            to_add,
            vec![
                ("env".to_string(), "prod".to_string()),
                ("owner".to_string(), "db".to_string())
            ]
        );
        // reserved tags survive even though they are absent from desired
        assert_eq!(to_remove, vec!["team".to_string()]);
    }

    #[test]
    fn unchanged_tags_are_not_rewritten() {
        let mut current = HashMap::new();
        current.insert("env".to_string(), "prod".to_string());
        let desired = current.clone();
        let (to_add, to_remove) = diff_tags(&current, &desired);
        assert!(to_add.is_empty());
        assert!(to_remove.is_empty());
    }
}
