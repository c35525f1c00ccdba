//! CSI Controller service (design spec §4.6): validates inputs, resolves
//! storage-class parameters and sub-region, and delegates to the
//! [`Coordinator`].

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};

use bsu_common::types::Tags;
use bsu_coordinator::{Coordinator, CreateSnapshotParams, CreateVolumeParams, ListSnapshotsQuery};

use bsu_csi_proto::csi::controller_server::Controller;
use bsu_csi_proto::csi::controller_service_capability::rpc::Type as ControllerRpc;
use bsu_csi_proto::csi::controller_service_capability::Rpc as ControllerRpcCapability;
use bsu_csi_proto::csi::volume_content_source::Type as ContentSourceType;
use bsu_csi_proto::csi::{
    controller_service_capability, validate_volume_capabilities_response, ControllerExpandVolumeRequest,
    ControllerExpandVolumeResponse, ControllerGetCapabilitiesRequest, ControllerGetCapabilitiesResponse,
    ControllerModifyVolumeRequest, ControllerModifyVolumeResponse, ControllerPublishVolumeRequest,
    ControllerPublishVolumeResponse, ControllerServiceCapability, ControllerUnpublishVolumeRequest,
    ControllerUnpublishVolumeResponse, CreateSnapshotRequest, CreateSnapshotResponse, CreateVolumeRequest,
    CreateVolumeResponse, DeleteSnapshotRequest, DeleteSnapshotResponse, DeleteVolumeRequest,
    DeleteVolumeResponse, ListSnapshotsRequest, ListSnapshotsResponse, Snapshot as ProtoSnapshot,
    Topology, ValidateVolumeCapabilitiesRequest, ValidateVolumeCapabilitiesResponse, Volume as ProtoVolume,
};

use crate::error_map::to_status;
use crate::params::{
    parse_capacity_range, parse_parameters, require_single_node_writer, to_accessibility_requirements,
    volume_context,
};
use crate::topology::resolve_sub_region;

pub struct ControllerService {
    coordinator: Arc<Coordinator>,
    extra_volume_tags: Tags,
    extra_snapshot_tags: Tags,
}

impl ControllerService {
    #[must_use]
    pub fn new(coordinator: Arc<Coordinator>, extra_volume_tags: Tags, extra_snapshot_tags: Tags) -> Self {
        Self {
            coordinator,
            extra_volume_tags,
            extra_snapshot_tags,
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

fn capability(ty: ControllerRpc) -> ControllerServiceCapability {
    ControllerServiceCapability {
        r#type: Some(controller_service_capability::Type::Rpc(ControllerRpcCapability {
            r#type: ty as i32,
        })),
    }
}

fn proto_volume(volume: &bsu_common::types::Volume, context: std::collections::HashMap<String, String>) -> ProtoVolume {
    ProtoVolume {
        capacity_bytes: volume.capacity_bytes() as i64,
        volume_id: volume.id.clone(),
        volume_context: context,
        content_source: None,
        accessible_topology: vec![Topology {
            segments: [("topology.bsu.csi.driver/zone".to_string(), volume.sub_region.0.clone())]
                .into_iter()
                .collect(),
        }],
    }
}

fn proto_snapshot(snapshot: &bsu_common::types::Snapshot) -> ProtoSnapshot {
    ProtoSnapshot {
        size_bytes: snapshot.size_bytes as i64,
        snapshot_id: snapshot.id.clone(),
        source_volume_id: snapshot.source_volume_id.clone(),
        creation_time_unix_seconds: snapshot.creation_time.timestamp(),
        ready_to_use: snapshot.ready_to_use(),
    }
}

#[tonic::async_trait]
impl Controller for ControllerService {
    async fn create_volume(
        &self,
        request: Request<CreateVolumeRequest>,
    ) -> Result<Response<CreateVolumeResponse>, Status> {
        let req = request.into_inner();
        let name = require_field(&req.name, "name")?;

        for cap in &req.volume_capabilities {
            require_single_node_writer(Some(cap)).map_err(to_status)?;
        }

        let params = parse_parameters(&req.parameters).map_err(to_status)?;
        let (required_bytes, limit_bytes) = parse_capacity_range(req.capacity_range.as_ref());
        let sub_region = resolve_sub_region(&to_accessibility_requirements(req.accessibility_requirements.as_ref()));

        let snapshot_source = req.volume_content_source.as_ref().and_then(|source| match &source.r#type {
            Some(ContentSourceType::Snapshot(snapshot)) => Some(snapshot.snapshot_id.clone()),
            None => None,
        });

        let tags = self.extra_volume_tags.clone();

        let create_params = CreateVolumeParams {
            name: name.to_string(),
            required_bytes,
            limit_bytes,
            volume_type: params.volume_type,
            iops_per_gib: params.iops_per_gib,
            encrypted: params.encrypted,
            kms_key_id: params.kms_key_id.clone(),
            snapshot_source,
            sub_region,
            tags,
        };

        let cancel = CancellationToken::new();
        let volume = self
            .coordinator
            .create_volume(create_params, &cancel)
            .await
            .map_err(to_status)?;

        Ok(Response::new(CreateVolumeResponse {
            volume: Some(proto_volume(&volume, volume_context(&params))),
        }))
    }

    async fn delete_volume(
        &self,
        request: Request<DeleteVolumeRequest>,
    ) -> Result<Response<DeleteVolumeResponse>, Status> {
        let req = request.into_inner();
        let volume_id = require_field(&req.volume_id, "volume_id")?;
        let cancel = CancellationToken::new();
        self.coordinator
            .delete_volume(volume_id, &cancel)
            .await
            .map_err(to_status)?;
        Ok(Response::new(DeleteVolumeResponse {}))
    }

    async fn controller_publish_volume(
        &self,
        request: Request<ControllerPublishVolumeRequest>,
    ) -> Result<Response<ControllerPublishVolumeResponse>, Status> {
        let req = request.into_inner();
        let volume_id = require_field(&req.volume_id, "volume_id")?;
        let node_id = require_field(&req.node_id, "node_id")?;
        require_single_node_writer(req.volume_capability.as_ref()).map_err(to_status)?;

        let cancel = CancellationToken::new();
        let device_path = self
            .coordinator
            .attach_volume(volume_id, &node_id.into(), &cancel)
            .await
            .map_err(to_status)?;

        Ok(Response::new(ControllerPublishVolumeResponse {
            publish_context: [("devicePath".to_string(), device_path)].into_iter().collect(),
        }))
    }

    async fn controller_unpublish_volume(
        &self,
        request: Request<ControllerUnpublishVolumeRequest>,
    ) -> Result<Response<ControllerUnpublishVolumeResponse>, Status> {
        let req = request.into_inner();
        let volume_id = require_field(&req.volume_id, "volume_id")?;
        let node_id = require_field(&req.node_id, "node_id")?;

        let cancel = CancellationToken::new();
        self.coordinator
            .detach_volume(volume_id, &node_id.into(), &cancel)
            .await
            .map_err(to_status)?;

        Ok(Response::new(ControllerUnpublishVolumeResponse {}))
    }

    async fn validate_volume_capabilities(
        &self,
        request: Request<ValidateVolumeCapabilitiesRequest>,
    ) -> Result<Response<ValidateVolumeCapabilitiesResponse>, Status> {
        let req = request.into_inner();
        require_field(&req.volume_id, "volume_id")?;
        if req.volume_capabilities.is_empty() {
            return Err(Status::invalid_argument("volume_capabilities is required"));
        }
        for cap in &req.volume_capabilities {
            require_single_node_writer(Some(cap)).map_err(to_status)?;
        }

        Ok(Response::new(ValidateVolumeCapabilitiesResponse {
            confirmed: Some(validate_volume_capabilities_response::Confirmed {
                volume_context: req.volume_context,
                volume_capabilities: req.volume_capabilities,
                parameters: req.parameters,
            }),
            message: String::new(),
        }))
    }

    async fn controller_get_capabilities(
        &self,
        _request: Request<ControllerGetCapabilitiesRequest>,
    ) -> Result<Response<ControllerGetCapabilitiesResponse>, Status> {
        Ok(Response::new(ControllerGetCapabilitiesResponse {
            capabilities: vec![
                capability(ControllerRpc::CreateDeleteVolume),
                capability(ControllerRpc::PublishUnpublishVolume),
                capability(ControllerRpc::CreateDeleteSnapshot),
                capability(ControllerRpc::ListSnapshots),
                capability(ControllerRpc::ExpandVolume),
                capability(ControllerRpc::ModifyVolume),
            ],
        }))
    }

    async fn create_snapshot(
        &self,
        request: Request<CreateSnapshotRequest>,
    ) -> Result<Response<CreateSnapshotResponse>, Status> {
        let req = request.into_inner();
        let name = require_field(&req.name, "name")?;
        let source_volume_id = require_field(&req.source_volume_id, "source_volume_id")?;

        let params = CreateSnapshotParams {
            name: name.to_string(),
            source_volume_id: source_volume_id.to_string(),
            tags: self.extra_snapshot_tags.clone(),
        };

        let cancel = CancellationToken::new();
        let snapshot = self
            .coordinator
            .create_snapshot(params, &cancel)
            .await
            .map_err(to_status)?;

        Ok(Response::new(CreateSnapshotResponse {
            snapshot: Some(proto_snapshot(&snapshot)),
        }))
    }

    async fn delete_snapshot(
        &self,
        request: Request<DeleteSnapshotRequest>,
    ) -> Result<Response<DeleteSnapshotResponse>, Status> {
        let req = request.into_inner();
        let snapshot_id = require_field(&req.snapshot_id, "snapshot_id")?;
        self.coordinator
            .delete_snapshot(snapshot_id)
            .await
            .map_err(to_status)?;
        Ok(Response::new(DeleteSnapshotResponse {}))
    }

    async fn list_snapshots(
        &self,
        request: Request<ListSnapshotsRequest>,
    ) -> Result<Response<ListSnapshotsResponse>, Status> {
        let req = request.into_inner();
        let query = ListSnapshotsQuery {
            id: (!req.snapshot_id.is_empty()).then_some(req.snapshot_id),
            source_volume_id: (!req.source_volume_id.is_empty()).then_some(req.source_volume_id),
            max_entries: (req.max_entries > 0).then_some(req.max_entries as u32),
            page_token: (!req.starting_token.is_empty()).then_some(req.starting_token),
        };

        let page = self.coordinator.list_snapshots(query).await.map_err(to_status)?;

        Ok(Response::new(ListSnapshotsResponse {
            entries: page
                .items
                .iter()
                .map(|s| bsu_csi_proto::csi::list_snapshots_response::Entry {
                    snapshot: Some(proto_snapshot(s)),
                })
                .collect(),
            next_token: page.next_page_token.unwrap_or_default(),
        }))
    }

    async fn controller_expand_volume(
        &self,
        request: Request<ControllerExpandVolumeRequest>,
    ) -> Result<Response<ControllerExpandVolumeResponse>, Status> {
        let req = request.into_inner();
        let volume_id = require_field(&req.volume_id, "volume_id")?;
        let (required_bytes, _limit_bytes) = parse_capacity_range(req.capacity_range.as_ref());
        let required_bytes = required_bytes
            .ok_or_else(|| Status::invalid_argument("capacity_range.required_bytes is required"))?;

        let cancel = CancellationToken::new();
        let new_size = self
            .coordinator
            .resize_volume(volume_id, required_bytes, &cancel)
            .await
            .map_err(to_status)?;

        Ok(Response::new(ControllerExpandVolumeResponse {
            capacity_bytes: new_size as i64,
            node_expansion_required: true,
        }))
    }

    async fn controller_modify_volume(
        &self,
        request: Request<ControllerModifyVolumeRequest>,
    ) -> Result<Response<ControllerModifyVolumeResponse>, Status> {
        let req = request.into_inner();
        let volume_id = require_field(&req.volume_id, "volume_id")?;

        let params: std::collections::BTreeMap<String, String> =
            req.mutable_parameters.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        let parsed = bsu_common::types::StorageClassParams::parse(&params).map_err(to_status)?;

        let new_type = params
            .keys()
            .any(|k| k.eq_ignore_ascii_case("type"))
            .then_some(parsed.volume_type);

        let cancel = CancellationToken::new();
        self.coordinator
            .modify_volume(volume_id, new_type, parsed.iops_per_gib, &cancel)
            .await
            .map_err(to_status)?;

        Ok(Response::new(ControllerModifyVolumeResponse {}))
    }
}
