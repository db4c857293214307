//! CSI Controller service: the create/delete/attach/detach/snapshot/modify/
//! expand authority.
//!
//! Controller operations fast-fail on per-resource conflicts (`Aborted`, the
//! CSI sidecars retry) instead of queueing, and every cloud mutation funnels
//! through [`CloudApi`].

pub mod params;

use std::{collections::HashMap, sync::Arc};

use tonic::{Request, Response, Status};

use crate::{
    cloud::{
        AttachmentState, CloudApi, CreateDiskOptions, Disk, DiskState, ModifyDiskOptions,
        CLUSTER_MARKER_TAG, GIB, KUBERNETES_CLUSTER_TAG_PREFIX, SNAPSHOT_NAME_TAG,
        VOLUME_NAME_TAG,
    },
    coordination::OperationLocks,
    csi::{
        self, controller_server::Controller, controller_service_capability,
        list_volumes_response, validate_volume_capabilities_response, volume_capability,
        volume_content_source, ControllerServiceCapability, Topology, VolumeCapability,
    },
    device::DeviceAllocator,
    ec2::client_token,
    errors::{Error, Result},
    ZONE_TOPOLOGY_KEY,
};

/// Publish-context key carrying the attach device name to the node.
pub const CONTEXT_DEVICE_PATH: &str = "devicePath";

/// The well-known zone key some orchestrators use instead of ours.
const KUBERNETES_ZONE_KEY: &str = "topology.kubernetes.io/zone";

pub struct ControllerService {
    cloud: Arc<dyn CloudApi>,
    locks: Arc<OperationLocks>,
    allocator: Arc<DeviceAllocator>,
    extra_tags: HashMap<String, String>,
    cluster_id: Option<String>,
    /// Zone used when a request carries no topology requirement.
    default_zone: Option<String>,
}

impl ControllerService {
    pub fn new(
        cloud: Arc<dyn CloudApi>,
        locks: Arc<OperationLocks>,
        allocator: Arc<DeviceAllocator>,
        extra_tags: HashMap<String, String>,
        cluster_id: Option<String>,
        default_zone: Option<String>,
    ) -> Self {
        Self {
            cloud,
            locks,
            allocator,
            extra_tags,
            cluster_id,
            default_zone,
        }
    }

    /// Base tag set stamped on every resource the driver creates.
    fn base_tags(&self, name_tag: &str, name: &str) -> HashMap<String, String> {
        let mut tags = self.extra_tags.clone();
        tags.insert(name_tag.to_string(), name.to_string());
        tags.insert(CLUSTER_MARKER_TAG.to_string(), "true".to_string());
        if let Some(id) = &self.cluster_id {
            tags.insert(
                format!("{}{}", KUBERNETES_CLUSTER_TAG_PREFIX, id),
                "owned".to_string(),
            );
        }
        tags
    }

    fn begin(&self, key: &str) -> Result<crate::coordination::InFlightGuard> {
        self.locks.try_begin(key).ok_or(Error::OperationPending {
            resource: key.to_string(),
        })
    }

    async fn do_create_volume(
        &self,
        req: csi::CreateVolumeRequest,
    ) -> Result<csi::CreateVolumeResponse> {
        if req.name.is_empty() {
            return Err(Error::invalid_argument("volume name missing"));
        }
        let caps = summarize_capabilities(&req.volume_capabilities)?;
        let p = params::VolumeParams::parse(&req.parameters)?;

        let multi_attach = caps.multi_writer;
        if multi_attach && (!caps.raw_block || !p.disk_type().supports_multi_attach()) {
            return Err(Error::invalid_argument(
                "MULTI_NODE_MULTI_WRITER requires a raw-block io1/io2 volume",
            ));
        }

        let (required, limit) = req
            .capacity_range
            .as_ref()
            .map(|r| (r.required_bytes, r.limit_bytes))
            .unwrap_or((0, 0));
        let size_gib = params::negotiate_size_gib(required, limit, p.disk_type())?;

        let _guard = self.begin(&req.name)?;

        // content source checks before any mutation
        let mut snapshot_source = None;
        let mut volume_source = None;
        match req.volume_content_source.as_ref().and_then(|s| s.r#type.as_ref()) {
            Some(volume_content_source::Type::Snapshot(s)) => {
                let snap = self.cloud.describe_snapshot(&s.snapshot_id).await?;
                if snap.size_bytes > size_gib * GIB {
                    return Err(Error::invalid_argument(format!(
                        "requested size {} GiB is below snapshot '{}' size",
                        size_gib, snap.snapshot_id
                    )));
                }
                // cutting first-access latency for the restore
                if !p.fast_snapshot_restore_zones.is_empty() {
                    self.cloud
                        .enable_fast_snapshot_restores(
                            &snap.snapshot_id,
                            &p.fast_snapshot_restore_zones,
                        )
                        .await?;
                }
                snapshot_source = Some(snap.snapshot_id);
            }
            Some(volume_content_source::Type::Volume(v)) => {
                let src = self.cloud.describe_disk(&v.volume_id).await?;
                if src.capacity_bytes > size_gib * GIB {
                    return Err(Error::invalid_argument(format!(
                        "a clone of '{}' needs at least {} bytes",
                        src.volume_id, src.capacity_bytes
                    )));
                }
                volume_source = Some(src.volume_id);
            }
            None => {}
        }

        // the name is an idempotency token: compatible reuse returns the
        // same disk, incompatible reuse is AlreadyExists
        if let Some(existing) = self.cloud.find_disk_by_name(&req.name).await? {
            check_existing_compatible(
                &existing,
                &req.name,
                size_gib,
                &p,
                snapshot_source.as_deref(),
            )?;
            log::info!(
                "volume '{}' already exists as '{}'",
                req.name,
                existing.volume_id
            );
            return Ok(csi::CreateVolumeResponse {
                volume: Some(self.csi_volume(&existing, &req, &p, &caps)),
            });
        }

        let zone = pick_zone(
            req.accessibility_requirements.as_ref(),
            self.default_zone.as_deref(),
        )?;
        let iops = p.resolve_iops(size_gib)?;
        let throughput = p.resolve_throughput()?;

        let mut tags = self.base_tags(VOLUME_NAME_TAG, &req.name);
        tags.extend(p.extra_tags.clone());

        let disk = self
            .cloud
            .create_disk(
                &req.name,
                CreateDiskOptions {
                    capacity_bytes: size_gib * GIB,
                    volume_type: Some(p.disk_type()),
                    iops,
                    throughput,
                    availability_zone: zone,
                    encrypted: p.encrypted,
                    kms_key_id: p.kms_key_id.clone(),
                    outpost_arn: None,
                    multi_attach,
                    snapshot_id: snapshot_source,
                    source_volume_id: volume_source,
                    initialization_rate: p.initialization_rate,
                    tags,
                    client_token: client_token(&req.name),
                },
            )
            .await?;

        Ok(csi::CreateVolumeResponse {
            volume: Some(self.csi_volume(&disk, &req, &p, &caps)),
        })
    }

    /// Builds the CSI volume answer: id, size, single-zone topology and the
    /// context the node service needs.
    fn csi_volume(
        &self,
        disk: &Disk,
        req: &csi::CreateVolumeRequest,
        p: &params::VolumeParams,
        caps: &CapabilitySummary,
    ) -> csi::Volume {
        let mut context = HashMap::new();
        if !caps.raw_block {
            context.insert(
                crate::mount::CTX_FS_TYPE.to_string(),
                p.fs_type.clone().unwrap_or_else(|| "ext4".to_string()),
            );
            context.extend(p.format_options.clone());
        }
        if p.block_attach_until_initialized {
            context.insert(
                crate::mount::CTX_BLOCK_ATTACH_UNTIL_INITIALIZED.to_string(),
                "true".to_string(),
            );
        }

        csi::Volume {
            capacity_bytes: disk.capacity_bytes,
            volume_id: disk.volume_id.clone(),
            volume_context: context,
            content_source: req.volume_content_source.clone(),
            accessible_topology: vec![zone_topology(&disk.availability_zone)],
        }
    }

    async fn do_publish(
        &self,
        req: csi::ControllerPublishVolumeRequest,
    ) -> Result<csi::ControllerPublishVolumeResponse> {
        if req.volume_id.is_empty() || req.node_id.is_empty() {
            return Err(Error::invalid_argument("volume id or node id missing"));
        }
        if let Some(cap) = &req.volume_capability {
            summarize_capabilities(std::slice::from_ref(cap))?;
        }

        let _guard = self.begin(&req.volume_id)?;

        // the instance must exist; its device names seed the allocator
        let in_use = self.cloud.instance_device_names(&req.node_id).await?;
        let disk = self.cloud.describe_disk(&req.volume_id).await?;

        if let Some(att) = disk.attachment_for(&req.node_id) {
            match att.state {
                AttachmentState::Attached => {
                    // reconcile a publish that died between attach and confirm
                    self.allocator.confirm(&req.node_id, &att.device);
                    let mut ctx = HashMap::new();
                    ctx.insert(CONTEXT_DEVICE_PATH.to_string(), att.device.clone());
                    return Ok(csi::ControllerPublishVolumeResponse {
                        publish_context: ctx,
                    });
                }
                AttachmentState::Attaching | AttachmentState::Busy => {
                    // an attach for this node is already settling; wait on it
                    // instead of issuing a second one
                    let device = att.device.clone();
                    self.cloud
                        .wait_for_attachment_state(
                            &req.volume_id,
                            &req.node_id,
                            &device,
                            AttachmentState::Attached,
                        )
                        .await?;
                    self.allocator.confirm(&req.node_id, &device);
                    let mut ctx = HashMap::new();
                    ctx.insert(CONTEXT_DEVICE_PATH.to_string(), device);
                    return Ok(csi::ControllerPublishVolumeResponse {
                        publish_context: ctx,
                    });
                }
                _ => {
                    // a trailing detach must drain before the slot is reusable
                    self.cloud
                        .wait_for_attachment_state(
                            &req.volume_id,
                            &req.node_id,
                            &att.device,
                            AttachmentState::Detached,
                        )
                        .await?;
                }
            }
        } else if !disk.multi_attach
            && disk
                .attachments
                .iter()
                .any(|a| a.state != AttachmentState::Detached)
        {
            return Err(Error::FailedPrecondition {
                message: format!(
                    "volume '{}' is attached to another node",
                    req.volume_id
                ),
            });
        }

        let device = self
            .allocator
            .reserve(&req.node_id, &req.volume_id, &in_use)?;

        let attach = async {
            self.cloud
                .attach_disk(&req.volume_id, &req.node_id, &device)
                .await?;
            self.cloud
                .wait_for_attachment_state(
                    &req.volume_id,
                    &req.node_id,
                    &device,
                    AttachmentState::Attached,
                )
                .await
        };

        match attach.await {
            Ok(()) => {
                self.allocator.confirm(&req.node_id, &device);
                let mut ctx = HashMap::new();
                ctx.insert(CONTEXT_DEVICE_PATH.to_string(), device);
                Ok(csi::ControllerPublishVolumeResponse {
                    publish_context: ctx,
                })
            }
            Err(e) => {
                self.allocator.release(&req.node_id, &device);
                Err(e)
            }
        }
    }

    async fn do_unpublish(
        &self,
        req: csi::ControllerUnpublishVolumeRequest,
    ) -> Result<csi::ControllerUnpublishVolumeResponse> {
        if req.volume_id.is_empty() || req.node_id.is_empty() {
            return Err(Error::invalid_argument("volume id or node id missing"));
        }
        let _guard = self.begin(&req.volume_id)?;

        // a volume that is already gone counts as unpublished
        match self.cloud.describe_disk(&req.volume_id).await {
            Ok(disk) => {
                if disk.attachment_for(&req.node_id).is_none() {
                    log::info!(
                        "volume '{}' not attached to '{}', unpublish is a no-op",
                        req.volume_id,
                        req.node_id
                    );
                } else {
                    self.cloud.detach_disk(&req.volume_id, &req.node_id).await?;
                    self.cloud
                        .wait_for_attachment_state(
                            &req.volume_id,
                            &req.node_id,
                            "",
                            AttachmentState::Detached,
                        )
                        .await?;
                }
            }
            Err(Error::NotFound { .. }) => {
                log::warn!("volume '{}' gone, unpublish is a no-op", req.volume_id);
            }
            Err(e) => return Err(e),
        }

        if let Some(device) = self
            .allocator
            .device_for_volume(&req.node_id, &req.volume_id)
        {
            self.allocator.release(&req.node_id, &device);
        }
        Ok(csi::ControllerUnpublishVolumeResponse {})
    }

    async fn do_create_snapshot(
        &self,
        req: csi::CreateSnapshotRequest,
    ) -> Result<csi::CreateSnapshotResponse> {
        if req.name.is_empty() || req.source_volume_id.is_empty() {
            return Err(Error::invalid_argument("snapshot name or source missing"));
        }
        let p = params::SnapshotParams::parse(&req.parameters)?;
        let _guard = self.begin(&req.name)?;

        if let Some(existing) = self.cloud.find_snapshot_by_name(&req.name).await? {
            if existing.source_volume_id != req.source_volume_id {
                return Err(Error::already_exists(
                    req.name.clone(),
                    format!(
                        "snapshot exists with a different source volume '{}'",
                        existing.source_volume_id
                    ),
                ));
            }
            return Ok(csi::CreateSnapshotResponse {
                snapshot: Some(csi_snapshot(&existing)),
            });
        }

        let mut tags = self.base_tags(SNAPSHOT_NAME_TAG, &req.name);
        tags.extend(p.extra_tags.clone());

        let snap = self
            .cloud
            .create_snapshot(&req.name, &req.source_volume_id, tags)
            .await?;

        if !p.fast_snapshot_restore_zones.is_empty() {
            let enable = async {
                self.cloud
                    .wait_for_snapshot_completed(&snap.snapshot_id)
                    .await?;
                self.cloud
                    .enable_fast_snapshot_restores(
                        &snap.snapshot_id,
                        &p.fast_snapshot_restore_zones,
                    )
                    .await
            };
            if let Err(e) = enable.await {
                // roll the snapshot back so a retry starts clean
                log::warn!(
                    "rolling back snapshot '{}' after fast-restore failure: {}",
                    snap.snapshot_id,
                    e.message()
                );
                if let Err(del) = self.cloud.delete_snapshot(&snap.snapshot_id).await {
                    log::warn!(
                        "snapshot '{}' rollback failed: {}",
                        snap.snapshot_id,
                        del.message()
                    );
                }
                return Err(e);
            }
            let settled = self.cloud.describe_snapshot(&snap.snapshot_id).await?;
            return Ok(csi::CreateSnapshotResponse {
                snapshot: Some(csi_snapshot(&settled)),
            });
        }

        Ok(csi::CreateSnapshotResponse {
            snapshot: Some(csi_snapshot(&snap)),
        })
    }

    async fn do_expand(
        &self,
        req: csi::ControllerExpandVolumeRequest,
    ) -> Result<csi::ControllerExpandVolumeResponse> {
        if req.volume_id.is_empty() {
            return Err(Error::invalid_argument("volume id missing"));
        }
        let range = req
            .capacity_range
            .as_ref()
            .ok_or_else(|| Error::invalid_argument("capacity range missing"))?;

        let _guard = self.begin(&req.volume_id)?;
        let disk = self.cloud.describe_disk(&req.volume_id).await?;

        let target_gib =
            params::negotiate_size_gib(range.required_bytes, range.limit_bytes, disk.volume_type)?;

        // capacity never shrinks
        if range.limit_bytes > 0 && range.limit_bytes < disk.capacity_bytes {
            return Err(Error::invalid_argument(format!(
                "limit {} is below the current size of '{}'",
                range.limit_bytes, req.volume_id
            )));
        }

        let node_expansion_required = !req
            .volume_capability
            .as_ref()
            .map(is_block_capability)
            .unwrap_or(false);

        if disk.capacity_bytes >= target_gib * GIB {
            // already satisfied, no cloud call
            return Ok(csi::ControllerExpandVolumeResponse {
                capacity_bytes: disk.capacity_bytes,
                node_expansion_required,
            });
        }

        let new_bytes = self
            .cloud
            .resize_disk(&req.volume_id, target_gib * GIB)
            .await?;
        Ok(csi::ControllerExpandVolumeResponse {
            capacity_bytes: new_bytes,
            node_expansion_required,
        })
    }

    async fn do_modify(
        &self,
        req: csi::ControllerModifyVolumeRequest,
    ) -> Result<csi::ControllerModifyVolumeResponse> {
        if req.volume_id.is_empty() {
            return Err(Error::invalid_argument("volume id missing"));
        }
        let p = params::ModifyParams::parse(&req.mutable_parameters)?;
        let _guard = self.begin(&req.volume_id)?;

        let disk = self.cloud.describe_disk(&req.volume_id).await?;
        validate_modify_targets(&disk, &p.options)?;

        if !p.options.is_empty() {
            self.cloud.modify_disk(&req.volume_id, p.options.clone()).await?;
        }

        // tag reconciliation runs after the hardware change; a failure here
        // leaves the volume partially modified and surfaces as an error
        if !p.tags.is_empty() {
            let mut desired = self.base_tags(VOLUME_NAME_TAG, disk.csi_name().unwrap_or_default());
            desired.extend(p.tags.clone());
            self.cloud.sync_tags(&req.volume_id, desired).await?;
        }

        Ok(csi::ControllerModifyVolumeResponse {})
    }
}

#[tonic::async_trait]
impl Controller for ControllerService {
    async fn create_volume(
        &self,
        request: Request<csi::CreateVolumeRequest>,
    ) -> std::result::Result<Response<csi::CreateVolumeResponse>, Status> {
        let req = request.into_inner();
        log::debug!("CreateVolume: {:?}", req);
        self.do_create_volume(req)
            .await
            .map(Response::new)
            .map_err(Into::into)
    }

    async fn delete_volume(
        &self,
        request: Request<csi::DeleteVolumeRequest>,
    ) -> std::result::Result<Response<csi::DeleteVolumeResponse>, Status> {
        let req = request.into_inner();
        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument("volume id missing"));
        }
        let _guard = self.begin(&req.volume_id).map_err(Status::from)?;

        // deleting a volume that is already gone succeeds
        self.cloud
            .delete_disk(&req.volume_id)
            .await
            .map_err(Status::from)?;
        Ok(Response::new(csi::DeleteVolumeResponse {}))
    }

    async fn controller_publish_volume(
        &self,
        request: Request<csi::ControllerPublishVolumeRequest>,
    ) -> std::result::Result<Response<csi::ControllerPublishVolumeResponse>, Status> {
        let req = request.into_inner();
        log::debug!("ControllerPublishVolume: {:?}", req);
        self.do_publish(req)
            .await
            .map(Response::new)
            .map_err(Into::into)
    }

    async fn controller_unpublish_volume(
        &self,
        request: Request<csi::ControllerUnpublishVolumeRequest>,
    ) -> std::result::Result<Response<csi::ControllerUnpublishVolumeResponse>, Status> {
        let req = request.into_inner();
        self.do_unpublish(req)
            .await
            .map(Response::new)
            .map_err(Into::into)
    }

    async fn validate_volume_capabilities(
        &self,
        request: Request<csi::ValidateVolumeCapabilitiesRequest>,
    ) -> std::result::Result<Response<csi::ValidateVolumeCapabilitiesResponse>, Status> {
        let req = request.into_inner();
        if req.volume_id.is_empty() {
            return Err(Status::invalid_argument("volume id missing"));
        }
        if req.volume_capabilities.is_empty() {
            return Err(Status::invalid_argument("volume capabilities missing"));
        }

        // the volume must exist for the validation to mean anything
        self.cloud
            .describe_disk(&req.volume_id)
            .await
            .map_err(Status::from)?;

        let resp = match summarize_capabilities(&req.volume_capabilities) {
            Ok(_) => csi::ValidateVolumeCapabilitiesResponse {
                confirmed: Some(validate_volume_capabilities_response::Confirmed {
                    volume_context: req.volume_context,
                    volume_capabilities: req.volume_capabilities,
                    parameters: req.parameters,
                    mutable_parameters: req.mutable_parameters,
                }),
                message: String::new(),
            },
            Err(e) => csi::ValidateVolumeCapabilitiesResponse {
                confirmed: None,
                message: e.message(),
            },
        };
        Ok(Response::new(resp))
    }

    async fn list_volumes(
        &self,
        request: Request<csi::ListVolumesRequest>,
    ) -> std::result::Result<Response<csi::ListVolumesResponse>, Status> {
        let req = request.into_inner();
        let token = (!req.starting_token.is_empty()).then(|| req.starting_token.clone());
        let (disks, next) = self
            .cloud
            .list_disks(req.max_entries, token)
            .await
            .map_err(Status::from)?;

        let entries = disks
            .iter()
            .map(|d| list_volumes_response::Entry {
                volume: Some(csi::Volume {
                    capacity_bytes: d.capacity_bytes,
                    volume_id: d.volume_id.clone(),
                    volume_context: Default::default(),
                    content_source: None,
                    accessible_topology: vec![zone_topology(&d.availability_zone)],
                }),
                status: Some(list_volumes_response::VolumeStatus {
                    published_node_ids: d
                        .attachments
                        .iter()
                        .filter(|a| a.state != AttachmentState::Detached)
                        .map(|a| a.instance_id.clone())
                        .collect(),
                }),
            })
            .collect();

        Ok(Response::new(csi::ListVolumesResponse {
            entries,
            // the cloud's token travels back verbatim
            next_token: next.unwrap_or_default(),
        }))
    }

    async fn get_capacity(
        &self,
        _request: Request<csi::GetCapacityRequest>,
    ) -> std::result::Result<Response<csi::GetCapacityResponse>, Status> {
        // EBS exposes no per-zone free-capacity signal
        Ok(Response::new(csi::GetCapacityResponse {
            available_capacity: 0,
        }))
    }

    async fn controller_get_capabilities(
        &self,
        _request: Request<csi::ControllerGetCapabilitiesRequest>,
    ) -> std::result::Result<Response<csi::ControllerGetCapabilitiesResponse>, Status> {
        use controller_service_capability::rpc::Type;
        let rpcs = [
            Type::CreateDeleteVolume,
            Type::PublishUnpublishVolume,
            Type::ListVolumes,
            Type::GetCapacity,
            Type::CreateDeleteSnapshot,
            Type::ListSnapshots,
            Type::CloneVolume,
            Type::ExpandVolume,
            Type::ModifyVolume,
        ];
        Ok(Response::new(csi::ControllerGetCapabilitiesResponse {
            capabilities: rpcs
                .into_iter()
                .map(|t| ControllerServiceCapability {
                    r#type: Some(controller_service_capability::Type::Rpc(
                        controller_service_capability::Rpc { r#type: t as i32 },
                    )),
                })
                .collect(),
        }))
    }

    async fn create_snapshot(
        &self,
        request: Request<csi::CreateSnapshotRequest>,
    ) -> std::result::Result<Response<csi::CreateSnapshotResponse>, Status> {
        let req = request.into_inner();
        log::debug!("CreateSnapshot: {:?}", req);
        self.do_create_snapshot(req)
            .await
            .map(Response::new)
            .map_err(Into::into)
    }

    async fn delete_snapshot(
        &self,
        request: Request<csi::DeleteSnapshotRequest>,
    ) -> std::result::Result<Response<csi::DeleteSnapshotResponse>, Status> {
        let req = request.into_inner();
        if req.snapshot_id.is_empty() {
            return Err(Status::invalid_argument("snapshot id missing"));
        }
        let _guard = self.begin(&req.snapshot_id).map_err(Status::from)?;
        self.cloud
            .delete_snapshot(&req.snapshot_id)
            .await
            .map_err(Status::from)?;
        Ok(Response::new(csi::DeleteSnapshotResponse {}))
    }

    async fn list_snapshots(
        &self,
        request: Request<csi::ListSnapshotsRequest>,
    ) -> std::result::Result<Response<csi::ListSnapshotsResponse>, Status> {
        let req = request.into_inner();
        let token = (!req.starting_token.is_empty()).then(|| req.starting_token.clone());
        let source = (!req.source_volume_id.is_empty()).then_some(req.source_volume_id.as_str());
        let id = (!req.snapshot_id.is_empty()).then_some(req.snapshot_id.as_str());

        let (snapshots, next) = self
            .cloud
            .list_snapshots(source, id, req.max_entries, token)
            .await
            .map_err(Status::from)?;

        Ok(Response::new(csi::ListSnapshotsResponse {
            entries: snapshots
                .iter()
                .map(|s| csi::list_snapshots_response::Entry {
                    snapshot: Some(csi_snapshot(s)),
                })
                .collect(),
            next_token: next.unwrap_or_default(),
        }))
    }

    async fn controller_expand_volume(
        &self,
        request: Request<csi::ControllerExpandVolumeRequest>,
    ) -> std::result::Result<Response<csi::ControllerExpandVolumeResponse>, Status> {
        let req = request.into_inner();
        self.do_expand(req)
            .await
            .map(Response::new)
            .map_err(Into::into)
    }

    async fn controller_modify_volume(
        &self,
        request: Request<csi::ControllerModifyVolumeRequest>,
    ) -> std::result::Result<Response<csi::ControllerModifyVolumeResponse>, Status> {
        let req = request.into_inner();
        self.do_modify(req)
            .await
            .map(Response::new)
            .map_err(Into::into)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CapabilitySummary {
    pub raw_block: bool,
    pub multi_writer: bool,
}

/// Checks every capability against the supported access modes and types.
pub fn summarize_capabilities(caps: &[VolumeCapability]) -> Result<CapabilitySummary> {
    if caps.is_empty() {
        return Err(Error::invalid_argument("volume capabilities missing"));
    }

    let mut summary = CapabilitySummary::default();
    for cap in caps {
        match cap.access_type.as_ref() {
            Some(volume_capability::AccessType::Block(_)) => summary.raw_block = true,
            Some(volume_capability::AccessType::Mount(_)) => {}
            None => return Err(Error::invalid_argument("capability access type missing")),
        }

        let mode = cap
            .access_mode
            .as_ref()
            .map(|m| m.mode)
            .unwrap_or_default();
        match volume_capability::access_mode::Mode::try_from(mode) {
            Ok(volume_capability::access_mode::Mode::SingleNodeWriter) => {}
            Ok(volume_capability::access_mode::Mode::MultiNodeMultiWriter) => {
                if !matches!(
                    cap.access_type,
                    Some(volume_capability::AccessType::Block(_))
                ) {
                    return Err(Error::invalid_argument(
                        "MULTI_NODE_MULTI_WRITER is supported for raw block only",
                    ));
                }
                summary.multi_writer = true;
            }
            other => {
                return Err(Error::invalid_argument(format!(
                    "unsupported access mode {:?}",
                    other
                )));
            }
        }
    }
    Ok(summary)
}

fn is_block_capability(cap: &VolumeCapability) -> bool {
    matches!(
        cap.access_type,
        Some(volume_capability::AccessType::Block(_))
    )
}

fn zone_topology(az: &str) -> Topology {
    let mut segments = HashMap::new();
    segments.insert(ZONE_TOPOLOGY_KEY.to_string(), az.to_string());
    Topology { segments }
}

fn zone_of(t: &Topology) -> Option<&str> {
    t.segments
        .get(ZONE_TOPOLOGY_KEY)
        .or_else(|| t.segments.get(KUBERNETES_ZONE_KEY))
        .map(String::as_str)
}

/// Zone selection: the first preferred zone still admissible under the
/// requisite set, else the first requisite zone, else the configured
/// default.
pub fn pick_zone(
    requirement: Option<&csi::TopologyRequirement>,
    default_zone: Option<&str>,
) -> Result<String> {
    if let Some(req) = requirement {
        let requisite: Vec<&str> = req.requisite.iter().filter_map(zone_of).collect();
        for preferred in &req.preferred {
            if let Some(zone) = zone_of(preferred) {
                if requisite.is_empty() || requisite.contains(&zone) {
                    return Ok(zone.to_string());
                }
            }
        }
        if let Some(first) = requisite.first() {
            return Ok(first.to_string());
        }
    }
    default_zone
        .map(str::to_string)
        .ok_or_else(|| Error::invalid_argument("no availability zone could be determined"))
}

/// Idempotency comparison for a reused volume name.
fn check_existing_compatible(
    existing: &Disk,
    name: &str,
    size_gib: i64,
    p: &params::VolumeParams,
    snapshot_source: Option<&str>,
) -> Result<()> {
    if existing.state == DiskState::Deleting || existing.state == DiskState::Deleted {
        return Err(Error::already_exists(
            name.to_string(),
            "previous volume with this name is still deleting",
        ));
    }
    if existing.capacity_bytes != size_gib * GIB {
        return Err(Error::already_exists(
            name.to_string(),
            format!(
                "exists with size {} but {} was requested",
                existing.capacity_bytes,
                size_gib * GIB
            ),
        ));
    }
    if existing.volume_type != p.disk_type() {
        return Err(Error::already_exists(
            name.to_string(),
            format!(
                "exists with type '{}' but '{}' was requested",
                existing.volume_type.as_str(),
                p.disk_type().as_str()
            ),
        ));
    }
    if p.encrypted != existing.encrypted {
        return Err(Error::already_exists(
            name.to_string(),
            "exists with a different encryption setting",
        ));
    }
    if let Some(snap) = snapshot_source {
        if existing.snapshot_id.as_deref() != Some(snap) {
            return Err(Error::already_exists(
                name.to_string(),
                format!(
                    "exists with content source {:?} but snapshot '{}' was requested",
                    existing.snapshot_id, snap
                ),
            ));
        }
    }
    Ok(())
}

/// ModifyVolume targets must stay admissible for the resulting type.
fn validate_modify_targets(disk: &Disk, opts: &ModifyDiskOptions) -> Result<()> {
    let target_type = opts.volume_type.unwrap_or(disk.volume_type);
    if opts.iops.is_some() && !target_type.supports_iops() {
        return Err(Error::invalid_argument(format!(
            "'{}' volumes do not take provisioned iops",
            target_type.as_str()
        )));
    }
    if opts.throughput.is_some() && !target_type.supports_throughput() {
        return Err(Error::invalid_argument(format!(
            "'{}' volumes do not take provisioned throughput",
            target_type.as_str()
        )));
    }
    Ok(())
}

fn csi_snapshot(s: &crate::cloud::Snapshot) -> csi::Snapshot {
    csi::Snapshot {
        size_bytes: s.size_bytes,
        snapshot_id: s.snapshot_id.clone(),
        source_volume_id: s.source_volume_id.clone(),
        creation_time: s.created_at.map(|dt| prost_types::Timestamp {
            seconds: dt.timestamp(),
            nanos: dt.timestamp_subsec_nanos() as i32,
        }),
        ready_to_use: s.ready(),
    }
}
