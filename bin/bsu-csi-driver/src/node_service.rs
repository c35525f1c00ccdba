//! CSI Node service (design spec §4.7): wires incoming RPCs onto
//! [`NodeBlockLayer`].

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};

use bsu_node_block::{ExpandVolumeParams, LuksFormatOptions, NodeBlockLayer, PublishVolumeParams, StageVolumeParams, UnstageVolumeParams};

use bsu_csi_proto::csi::node_server::Node;
use bsu_csi_proto::csi::node_service_capability::rpc::Type as NodeRpc;
use bsu_csi_proto::csi::node_service_capability::Rpc as NodeRpcCapability;
use bsu_csi_proto::csi::volume_capability::access_type::Type as AccessType;
use bsu_csi_proto::csi::volume_usage::Unit;
use bsu_csi_proto::csi::{
    node_service_capability, NodeExpandVolumeRequest, NodeExpandVolumeResponse, NodeGetCapabilitiesRequest,
    NodeGetCapabilitiesResponse, NodeGetInfoRequest, NodeGetInfoResponse, NodeGetVolumeStatsRequest,
    NodeGetVolumeStatsResponse, NodePublishVolumeRequest, NodePublishVolumeResponse, NodeServiceCapability,
    NodeStageVolumeRequest, NodeStageVolumeResponse, NodeUnpublishVolumeRequest, NodeUnpublishVolumeResponse,
    NodeUnstageVolumeRequest, NodeUnstageVolumeResponse, Topology, VolumeUsage,
};

use crate::error_map::to_status;

pub struct NodeService {
    layer: Arc<NodeBlockLayer>,
    node_id: String,
    sub_region: String,
    max_volumes_per_node: u32,
    luks_open_flags: Vec<String>,
}

impl NodeService {
    #[must_use]
    pub fn new(
        layer: Arc<NodeBlockLayer>,
        node_id: String,
        sub_region: String,
        max_volumes_per_node: u32,
        luks_open_flags: Vec<String>,
    ) -> Self {
        Self {
            layer,
            node_id,
            sub_region,
            max_volumes_per_node,
            luks_open_flags,
        }
    }
}

fn require_field<'a>(value: &'a str, name: &str) -> Result<&'a str, Status> {
    if value.is_empty() {
        Err(Status::invalid_argument(format!("{name} is required")))
    } else {
        Ok(value)
    }
}

fn capability(ty: NodeRpc) -> NodeServiceCapability {
    NodeServiceCapability {
        r#type: Some(node_service_capability::Type::Rpc(NodeRpcCapability { r#type: ty as i32 })),
    }
}

/// `"true"`/`"1"` count as true; anything else (including absence) is false.
fn context_bool(context: &std::collections::HashMap<String, String>, key: &str) -> bool {
    context.get(key).is_some_and(|v| v == "true" || v == "1")
}

#[tonic::async_trait]
impl Node for NodeService {
    async fn node_stage_volume(
        &self,
        request: Request<NodeStageVolumeRequest>,
    ) -> Result<Response<NodeStageVolumeResponse>, Status> {
        let req = request.into_inner();
        let volume_id = require_field(&req.volume_id, "volume_id")?.to_string();
        let device_path = require_field(&req.publish_context_device_path, "publish_context_device_path")?.to_string();
        let staging_path = require_field(&req.staging_target_path, "staging_target_path")?.to_string();

        let (fstype, mount_options) = match req.volume_capability.as_ref().and_then(|c| c.access_type.clone()) {
            Some(AccessType::Mount(mount)) => (
                (!mount.fs_type.is_empty()).then_some(mount.fs_type),
                mount.mount_flags,
            ),
            _ => (None, Vec::new()),
        };
        let fstype = req.volume_context.get("fstype").cloned().or(fstype);

        let encrypted = context_bool(&req.volume_context, "encrypted");
        let passphrase = req.secrets.get("passphrase").cloned();
        let luks_format_options = LuksFormatOptions {
            cipher: req.volume_context.get("luks-cipher").cloned(),
            hash: req.volume_context.get("luks-hash").cloned(),
            key_size: req.volume_context.get("luks-key-size").cloned(),
        };

        let cancel = CancellationToken::new();
        self.layer
            .stage_volume(
                StageVolumeParams {
                    volume_id,
                    published_device_path: device_path,
                    staging_path,
                    fstype,
                    mount_options,
                    encrypted,
                    passphrase,
                    luks_format_options,
                    luks_open_flags: self.luks_open_flags.clone(),
                },
                &cancel,
            )
            .await
            .map_err(to_status)?;

        Ok(Response::new(NodeStageVolumeResponse {}))
    }

    async fn node_unstage_volume(
        &self,
        request: Request<NodeUnstageVolumeRequest>,
    ) -> Result<Response<NodeUnstageVolumeResponse>, Status> {
        let req = request.into_inner();
        let volume_id = require_field(&req.volume_id, "volume_id")?.to_string();
        let staging_path = require_field(&req.staging_target_path, "staging_target_path")?.to_string();

        // NodeUnstageVolumeRequest carries no volume_context; recover
        // encryption state from whether the LUKS mapping is open.
        let encrypted = self.layer.is_encrypted(&volume_id);
        self.layer
            .unstage_volume(UnstageVolumeParams {
                volume_id,
                staging_path,
                encrypted,
            })
            .await
            .map_err(to_status)?;

        Ok(Response::new(NodeUnstageVolumeResponse {}))
    }

    async fn node_publish_volume(
        &self,
        request: Request<NodePublishVolumeRequest>,
    ) -> Result<Response<NodePublishVolumeResponse>, Status> {
        let req = request.into_inner();
        let staging_path = require_field(&req.staging_target_path, "staging_target_path")?.to_string();
        let publish_path = require_field(&req.target_path, "target_path")?.to_string();

        let (block_mode, mount_options) = match req.volume_capability.as_ref().and_then(|c| c.access_type.clone()) {
            Some(AccessType::Block(_)) => (true, Vec::new()),
            Some(AccessType::Mount(mount)) => (false, mount.mount_flags),
            None => (false, Vec::new()),
        };

        self.layer
            .publish_volume(PublishVolumeParams {
                staging_path,
                publish_path,
                read_only: req.readonly,
                block_mode,
                mount_options,
            })
            .await
            .map_err(to_status)?;

        Ok(Response::new(NodePublishVolumeResponse {}))
    }

    async fn node_unpublish_volume(
        &self,
        request: Request<NodeUnpublishVolumeRequest>,
    ) -> Result<Response<NodeUnpublishVolumeResponse>, Status> {
        let req = request.into_inner();
        let target_path = require_field(&req.target_path, "target_path")?;
        self.layer.unpublish_volume(target_path).await.map_err(to_status)?;
        Ok(Response::new(NodeUnpublishVolumeResponse {}))
    }

    async fn node_get_volume_stats(
        &self,
        request: Request<NodeGetVolumeStatsRequest>,
    ) -> Result<Response<NodeGetVolumeStatsResponse>, Status> {
        let req = request.into_inner();
        let volume_path = require_field(&req.volume_path, "volume_path")?;

        let stats = self.layer.volume_stats(volume_path).await.map_err(to_status)?;

        Ok(Response::new(NodeGetVolumeStatsResponse {
            usage: vec![
                VolumeUsage {
                    available: stats.available_bytes as i64,
                    total: stats.capacity_bytes as i64,
                    used: stats.used_bytes as i64,
                    unit: Unit::Bytes as i32,
                },
                VolumeUsage {
                    available: stats.free_inodes as i64,
                    total: stats.total_inodes as i64,
                    used: stats.used_inodes as i64,
                    unit: Unit::Inodes as i32,
                },
            ],
        }))
    }

    async fn node_expand_volume(
        &self,
        request: Request<NodeExpandVolumeRequest>,
    ) -> Result<Response<NodeExpandVolumeResponse>, Status> {
        let req = request.into_inner();
        let volume_id = require_field(&req.volume_id, "volume_id")?.to_string();
        let staging_path = require_field(&req.staging_target_path, "staging_target_path")?.to_string();

        // NodeExpandVolumeRequest carries no device path; recover what
        // NodeStageVolume resolved from the staging mount itself.
        let published_device_path = self
            .layer
            .staged_device(&staging_path)
            .await
            .map_err(to_status)?
            .ok_or_else(|| Status::failed_precondition(format!("{staging_path} is not staged")))?;
        let encrypted = self.layer.is_encrypted(&volume_id);

        let cancel = CancellationToken::new();
        self.layer
            .expand_volume(
                ExpandVolumeParams {
                    volume_id,
                    staging_path,
                    published_device_path,
                    encrypted,
                    fstype: None,
                },
                &cancel,
            )
            .await
            .map_err(to_status)?;

        let stats = self.layer.volume_stats(&req.volume_path).await.map_err(to_status)?;
        Ok(Response::new(NodeExpandVolumeResponse {
            capacity_bytes: stats.capacity_bytes as i64,
        }))
    }

    async fn node_get_capabilities(
        &self,
        _request: Request<NodeGetCapabilitiesRequest>,
    ) -> Result<Response<NodeGetCapabilitiesResponse>, Status> {
        Ok(Response::new(NodeGetCapabilitiesResponse {
            capabilities: vec![
                capability(NodeRpc::StageUnstageVolume),
                capability(NodeRpc::GetVolumeStats),
                capability(NodeRpc::ExpandVolume),
            ],
        }))
    }

    async fn node_get_info(
        &self,
        _request: Request<NodeGetInfoRequest>,
    ) -> Result<Response<NodeGetInfoResponse>, Status> {
        Ok(Response::new(NodeGetInfoResponse {
            node_id: self.node_id.clone(),
            max_volumes_per_node: i64::from(self.max_volumes_per_node),
            accessible_topology: Some(Topology {
                segments: [("topology.bsu.csi.driver/zone".to_string(), self.sub_region.clone())]
                    .into_iter()
                    .collect(),
            }),
        }))
    }
}
