//! CSI Node service: stage/publish plumbing on the host.
//!
//! Stage mounts the attached device at the node-global staging path;
//! publish bind-mounts staging onto the pod path. Raw-block volumes skip
//! the filesystem entirely and bind the device node itself. Every operation
//! serializes on the (volume, path) pair through the blocking side of the
//! coordination core.

use std::{collections::HashMap, path::Path, sync::Arc};

use tonic::{Request, Response, Status};

use crate::{
    cloud::CloudApi,
    coordination::OperationLocks,
    csi::{
        self, node_server::Node, node_service_capability, volume_capability, NodeServiceCapability,
        Topology, VolumeUsage,
    },
    device::discovery::DeviceResolver,
    ec2::metadata::NodeMeta,
    errors::{Error, Result},
    mount::{
        signature_matches, FormatOptions, FsType, Mount, CTX_BLOCK_ATTACH_UNTIL_INITIALIZED,
        CTX_FS_TYPE,
    },
    ZONE_TOPOLOGY_KEY,
};

use crate::controller::CONTEXT_DEVICE_PATH;

pub struct NodeService {
    mounter: Arc<dyn Mount>,
    resolver: DeviceResolver,
    locks: Arc<OperationLocks>,
    meta: NodeMeta,
    /// Present when the node can reach EC2; used only for the
    /// wait-until-initialized stage option.
    cloud: Option<Arc<dyn CloudApi>>,
    attach_limit_override: Option<i64>,
}

impl NodeService {
    pub fn new(
        mounter: Arc<dyn Mount>,
        resolver: DeviceResolver,
        locks: Arc<OperationLocks>,
        meta: NodeMeta,
        cloud: Option<Arc<dyn CloudApi>>,
        attach_limit_override: Option<i64>,
    ) -> Self {
        Self {
            mounter,
            resolver,
            locks,
            meta,
            cloud,
            attach_limit_override,
        }
    }

    fn lock_key(volume_id: &str, path: &str) -> String {
        format!("{}@{}", volume_id, path)
    }

    async fn do_stage(&self, req: csi::NodeStageVolumeRequest) -> Result<()> {
        if req.volume_id.is_empty() || req.staging_target_path.is_empty() {
            return Err(Error::invalid_argument(
                "volume id or staging target path missing",
            ));
        }
        let cap = req
            .volume_capability
            .as_ref()
            .ok_or_else(|| Error::invalid_argument("volume capability missing"))?;

        let _lock = self
            .locks
            .lock(&Self::lock_key(&req.volume_id, &req.staging_target_path))
            .await;

        let mount_cap = match cap.access_type.as_ref() {
            // raw block volumes stage as a no-op; publish binds the device
            Some(volume_capability::AccessType::Block(_)) => return Ok(()),
            Some(volume_capability::AccessType::Mount(m)) => m,
            None => return Err(Error::invalid_argument("capability access type missing")),
        };

        let fs = resolve_fs_type(&req.volume_context, &mount_cap.fs_type)?;
        let format_opts = FormatOptions::from_context(fs, &req.volume_context)?;

        let hint = req
            .publish_context
            .get(CONTEXT_DEVICE_PATH)
            .ok_or_else(|| Error::invalid_argument("publish context carries no device path"))?;
        let device = self.resolver.resolve(hint, &req.volume_id).await?;

        if req
            .volume_context
            .get(CTX_BLOCK_ATTACH_UNTIL_INITIALIZED)
            .map(String::as_str)
            == Some("true")
        {
            match &self.cloud {
                Some(cloud) => cloud.wait_for_volume_initialized(&req.volume_id).await?,
                None => log::warn!(
                    "volume '{}' asked to block until initialized but the node has no cloud access",
                    req.volume_id
                ),
            }
        }

        if let Some(existing) = self.mounter.find_mount(Path::new(&req.staging_target_path)).await? {
            if existing.source == device.to_string_lossy() {
                log::info!(
                    "volume '{}' already staged at '{}'",
                    req.volume_id,
                    req.staging_target_path
                );
                return Ok(());
            }
            return Err(Error::already_exists(
                req.staging_target_path.clone(),
                format!("staging path is mounted from '{}'", existing.source),
            ));
        }

        std::fs::create_dir_all(&req.staging_target_path).map_err(|e| Error::Other {
            message: format!(
                "failed to create staging path '{}' {:?}",
                req.staging_target_path, e
            ),
            retryable: false,
        })?;

        match self.mounter.detect_filesystem(&device).await? {
            Some(found) => {
                // never re-format a device that already carries data
                if !signature_matches(found, fs) {
                    return Err(Error::FailedPrecondition {
                        message: format!(
                            "device '{}' carries a '{}' filesystem but '{}' was requested",
                            device.display(),
                            found,
                            fs.as_str()
                        ),
                    });
                }
                log::info!(
                    "device '{}' already formatted, skipping mkfs",
                    device.display()
                );
            }
            None => {
                let volume_bytes = self.mounter.device_size_bytes(&device).await.ok();
                self.mounter
                    .format(&device, fs, &format_opts, volume_bytes)
                    .await?;
            }
        }

        self.mounter
            .mount(
                &device,
                Path::new(&req.staging_target_path),
                Some(fs),
                &mount_cap.mount_flags,
            )
            .await?;
        log::info!(
            "staged volume '{}' at '{}'",
            req.volume_id,
            req.staging_target_path
        );
        Ok(())
    }

    async fn do_unstage(&self, req: csi::NodeUnstageVolumeRequest) -> Result<()> {
        if req.volume_id.is_empty() || req.staging_target_path.is_empty() {
            return Err(Error::invalid_argument(
                "volume id or staging target path missing",
            ));
        }
        let _lock = self
            .locks
            .lock(&Self::lock_key(&req.volume_id, &req.staging_target_path))
            .await;

        match self
            .mounter
            .find_mount(Path::new(&req.staging_target_path))
            .await?
        {
            Some(_) => {
                self.mounter
                    .unmount(Path::new(&req.staging_target_path))
                    .await?;
                log::info!(
                    "unstaged volume '{}' from '{}'",
                    req.volume_id,
                    req.staging_target_path
                );
            }
            None => log::info!(
                "volume '{}' not staged at '{}', unstage is a no-op",
                req.volume_id,
                req.staging_target_path
            ),
        }
        Ok(())
    }

    async fn do_publish(&self, req: csi::NodePublishVolumeRequest) -> Result<()> {
        if req.volume_id.is_empty() || req.target_path.is_empty() {
            return Err(Error::invalid_argument("volume id or target path missing"));
        }
        let cap = req
            .volume_capability
            .as_ref()
            .ok_or_else(|| Error::invalid_argument("volume capability missing"))?;

        let _lock = self
            .locks
            .lock(&Self::lock_key(&req.volume_id, &req.target_path))
            .await;

        if self
            .mounter
            .find_mount(Path::new(&req.target_path))
            .await?
            .is_some()
        {
            log::info!(
                "volume '{}' already published at '{}'",
                req.volume_id,
                req.target_path
            );
            return Ok(());
        }

        match cap.access_type.as_ref() {
            Some(volume_capability::AccessType::Block(_)) => {
                let hint = req
                    .publish_context
                    .get(CONTEXT_DEVICE_PATH)
                    .ok_or_else(|| {
                        Error::invalid_argument("publish context carries no device path")
                    })?;
                let device = self.resolver.resolve(hint, &req.volume_id).await?;

                // the bind target must exist as a file node
                if let Some(parent) = Path::new(&req.target_path).parent() {
                    std::fs::create_dir_all(parent).map_err(|e| Error::Other {
                        message: format!("failed to create '{}' {:?}", parent.display(), e),
                        retryable: false,
                    })?;
                }
                if !Path::new(&req.target_path).exists() {
                    std::fs::File::create(&req.target_path).map_err(|e| Error::Other {
                        message: format!("failed to create '{}' {:?}", req.target_path, e),
                        retryable: false,
                    })?;
                }
                if let Err(e) = self
                    .mounter
                    .bind_mount(&device, Path::new(&req.target_path), req.readonly)
                    .await
                {
                    // a failed publish must leave no leftover file node
                    let _ = std::fs::remove_file(&req.target_path);
                    return Err(e);
                }
            }
            Some(volume_capability::AccessType::Mount(_)) => {
                if req.staging_target_path.is_empty() {
                    return Err(Error::invalid_argument("staging target path missing"));
                }
                if self
                    .mounter
                    .find_mount(Path::new(&req.staging_target_path))
                    .await?
                    .is_none()
                {
                    return Err(Error::FailedPrecondition {
                        message: format!(
                            "volume '{}' is not staged at '{}'",
                            req.volume_id, req.staging_target_path
                        ),
                    });
                }
                std::fs::create_dir_all(&req.target_path).map_err(|e| Error::Other {
                    message: format!("failed to create '{}' {:?}", req.target_path, e),
                    retryable: false,
                })?;
                if let Err(e) = self
                    .mounter
                    .bind_mount(
                        Path::new(&req.staging_target_path),
                        Path::new(&req.target_path),
                        req.readonly,
                    )
                    .await
                {
                    // a failed publish must leave no leftover directory
                    let _ = std::fs::remove_dir(&req.target_path);
                    return Err(e);
                }
            }
            None => return Err(Error::invalid_argument("capability access type missing")),
        }

        log::info!(
            "published volume '{}' at '{}'",
            req.volume_id,
            req.target_path
        );
        Ok(())
    }

    async fn do_unpublish(&self, req: csi::NodeUnpublishVolumeRequest) -> Result<()> {
        if req.volume_id.is_empty() || req.target_path.is_empty() {
            return Err(Error::invalid_argument("volume id or target path missing"));
        }
        let _lock = self
            .locks
            .lock(&Self::lock_key(&req.volume_id, &req.target_path))
            .await;

        let target = Path::new(&req.target_path);
        if self.mounter.find_mount(target).await?.is_some() {
            self.mounter.unmount(target).await?;
        }

        // leave nothing behind at the pod path
        match std::fs::metadata(target) {
            Ok(meta) => {
                let removed = if meta.is_dir() {
                    std::fs::remove_dir(target)
                } else {
                    std::fs::remove_file(target)
                };
                if let Err(e) = removed {
                    log::warn!("failed to remove '{}': {}", req.target_path, e);
                }
            }
            Err(_) => {
                log::info!("target '{}' already gone", req.target_path);
            }
        }
        Ok(())
    }

    async fn do_get_volume_stats(
        &self,
        req: csi::NodeGetVolumeStatsRequest,
    ) -> Result<csi::NodeGetVolumeStatsResponse> {
        if req.volume_id.is_empty() || req.volume_path.is_empty() {
            return Err(Error::invalid_argument("volume id or volume path missing"));
        }
        let path = Path::new(&req.volume_path);
        let meta = std::fs::metadata(path).map_err(|_| {
            Error::not_found(
                req.volume_id.clone(),
                format!("volume path '{}' does not exist", req.volume_path),
            )
        })?;

        if meta.is_dir() {
            let stats = self.mounter.fs_stats(path).await?;
            Ok(csi::NodeGetVolumeStatsResponse {
                usage: vec![
                    VolumeUsage {
                        available: stats.available_bytes as i64,
                        total: stats.total_bytes as i64,
                        used: stats.used_bytes as i64,
                        unit: csi::volume_usage::Unit::Bytes as i32,
                    },
                    VolumeUsage {
                        available: stats.free_inodes as i64,
                        total: stats.total_inodes as i64,
                        used: stats.used_inodes as i64,
                        unit: csi::volume_usage::Unit::Inodes as i32,
                    },
                ],
            })
        } else {
            // raw block: only the device size is knowable
            let size = self.mounter.device_size_bytes(path).await?;
            Ok(csi::NodeGetVolumeStatsResponse {
                usage: vec![VolumeUsage {
                    available: 0,
                    total: size as i64,
                    used: 0,
                    unit: csi::volume_usage::Unit::Bytes as i32,
                }],
            })
        }
    }

    async fn do_expand(
        &self,
        req: csi::NodeExpandVolumeRequest,
    ) -> Result<csi::NodeExpandVolumeResponse> {
        if req.volume_id.is_empty() || req.volume_path.is_empty() {
            return Err(Error::invalid_argument("volume id or volume path missing"));
        }
        let _lock = self
            .locks
            .lock(&Self::lock_key(&req.volume_id, &req.volume_path))
            .await;

        let required = req
            .capacity_range
            .as_ref()
            .map(|r| r.required_bytes)
            .unwrap_or(0);

        if req
            .volume_capability
            .as_ref()
            .map(|c| {
                matches!(
                    c.access_type,
                    Some(volume_capability::AccessType::Block(_))
                )
            })
            .unwrap_or(false)
        {
            // raw block sees the grown device immediately
            return Ok(csi::NodeExpandVolumeResponse {
                capacity_bytes: required,
            });
        }

        let entry = self
            .mounter
            .find_mount(Path::new(&req.volume_path))
            .await?
            .ok_or_else(|| {
                Error::not_found(
                    req.volume_id.clone(),
                    format!("no filesystem mounted at '{}'", req.volume_path),
                )
            })?;

        let fs = FsType::parse(&entry.fs_type)?;
        let device = Path::new(&entry.source).to_path_buf();
        let device_bytes = self.mounter.device_size_bytes(&device).await?;
        if required > 0 && (device_bytes as i64) < required {
            // controller-side expansion has not reached the device yet
            return Err(Error::FailedPrecondition {
                message: format!(
                    "device '{}' is {} bytes, smaller than the requested {}",
                    entry.source, device_bytes, required
                ),
            });
        }

        self.mounter
            .resize(&device, Path::new(&req.volume_path), fs)
            .await?;
        log::info!(
            "grew {} filesystem for volume '{}' at '{}'",
            fs.as_str(),
            req.volume_id,
            req.volume_path
        );
        Ok(csi::NodeExpandVolumeResponse {
            capacity_bytes: device_bytes as i64,
        })
    }
}

fn resolve_fs_type(context: &HashMap<String, String>, capability_fs: &str) -> Result<FsType> {
    if let Some(fs) = context.get(CTX_FS_TYPE) {
        return FsType::parse(fs);
    }
    if !capability_fs.is_empty() {
        return FsType::parse(capability_fs);
    }
    Ok(FsType::Ext4)
}

#[tonic::async_trait]
impl Node for NodeService {
    async fn node_stage_volume(
        &self,
        request: Request<csi::NodeStageVolumeRequest>,
    ) -> std::result::Result<Response<csi::NodeStageVolumeResponse>, Status> {
        let req = request.into_inner();
        log::debug!("NodeStageVolume: {:?}", req);
        self.do_stage(req)
            .await
            .map(|_| Response::new(csi::NodeStageVolumeResponse {}))
            .map_err(Into::into)
    }

    async fn node_unstage_volume(
        &self,
        request: Request<csi::NodeUnstageVolumeRequest>,
    ) -> std::result::Result<Response<csi::NodeUnstageVolumeResponse>, Status> {
        let req = request.into_inner();
        self.do_unstage(req)
            .await
            .map(|_| Response::new(csi::NodeUnstageVolumeResponse {}))
            .map_err(Into::into)
    }

    async fn node_publish_volume(
        &self,
        request: Request<csi::NodePublishVolumeRequest>,
    ) -> std::result::Result<Response<csi::NodePublishVolumeResponse>, Status> {
        let req = request.into_inner();
        log::debug!("NodePublishVolume: {:?}", req);
        self.do_publish(req)
            .await
            .map(|_| Response::new(csi::NodePublishVolumeResponse {}))
            .map_err(Into::into)
    }

    async fn node_unpublish_volume(
        &self,
        request: Request<csi::NodeUnpublishVolumeRequest>,
    ) -> std::result::Result<Response<csi::NodeUnpublishVolumeResponse>, Status> {
        let req = request.into_inner();
        self.do_unpublish(req)
            .await
            .map(|_| Response::new(csi::NodeUnpublishVolumeResponse {}))
            .map_err(Into::into)
    }

    async fn node_get_volume_stats(
        &self,
        request: Request<csi::NodeGetVolumeStatsRequest>,
    ) -> std::result::Result<Response<csi::NodeGetVolumeStatsResponse>, Status> {
        let req = request.into_inner();
        self.do_get_volume_stats(req)
            .await
            .map(Response::new)
            .map_err(Into::into)
    }

    async fn node_expand_volume(
        &self,
        request: Request<csi::NodeExpandVolumeRequest>,
    ) -> std::result::Result<Response<csi::NodeExpandVolumeResponse>, Status> {
        let req = request.into_inner();
        self.do_expand(req)
            .await
            .map(Response::new)
            .map_err(Into::into)
    }

    async fn node_get_capabilities(
        &self,
        _request: Request<csi::NodeGetCapabilitiesRequest>,
    ) -> std::result::Result<Response<csi::NodeGetCapabilitiesResponse>, Status> {
        use node_service_capability::rpc::Type;
        let rpcs = [
            Type::StageUnstageVolume,
            Type::GetVolumeStats,
            Type::ExpandVolume,
        ];
        Ok(Response::new(csi::NodeGetCapabilitiesResponse {
            capabilities: rpcs
                .into_iter()
                .map(|t| NodeServiceCapability {
                    r#type: Some(node_service_capability::Type::Rpc(
                        node_service_capability::Rpc { r#type: t as i32 },
                    )),
                })
                .collect(),
        }))
    }

    async fn node_get_info(
        &self,
        _request: Request<csi::NodeGetInfoRequest>,
    ) -> std::result::Result<Response<csi::NodeGetInfoResponse>, Status> {
        let max_volumes = self
            .attach_limit_override
            .unwrap_or(self.meta.max_attachable_volumes);

        let mut segments = HashMap::new();
        segments.insert(
            ZONE_TOPOLOGY_KEY.to_string(),
            self.meta.availability_zone.clone(),
        );

        Ok(Response::new(csi::NodeGetInfoResponse {
            node_id: self.meta.instance_id.clone(),
            max_volumes_per_node: max_volumes,
            accessible_topology: Some(Topology { segments }),
        }))
    }
}
