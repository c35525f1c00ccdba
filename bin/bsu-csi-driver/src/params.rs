//! Conversions between the CSI wire types and the core domain/param types
//! (design spec §4.6).

use std::collections::BTreeMap;

use bsu_common::error::{DriverError, Result};
use bsu_common::types::{AccessibilityRequirements, StorageClassParams};

use bsu_csi_proto::csi::volume_capability::AccessMode;
use bsu_csi_proto::csi::{CapacityRange, Topology, TopologyRequirement, VolumeCapability};

/// Only `SINGLE_NODE_WRITER` is supported (design spec §4.6).
pub fn require_single_node_writer(capability: Option<&VolumeCapability>) -> Result<()> {
    let capability = capability
        .ok_or_else(|| DriverError::InvalidArgument("volume_capability is required".into()))?;
    if capability.access_mode != AccessMode::SingleNodeWriter as i32 {
        return Err(DriverError::InvalidArgument(format!(
            "unsupported access mode {}; only SINGLE_NODE_WRITER is supported",
            capability.access_mode
        )));
    }
    Ok(())
}

pub fn parse_parameters(raw: &std::collections::HashMap<String, String>) -> Result<StorageClassParams> {
    let params: BTreeMap<String, String> = raw.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    StorageClassParams::parse(&params)
}

pub fn parse_capacity_range(range: Option<&CapacityRange>) -> (Option<u64>, Option<u64>) {
    match range {
        Some(r) => (
            non_negative(r.required_bytes),
            non_negative(r.limit_bytes),
        ),
        None => (None, None),
    }
}

fn non_negative(value: i64) -> Option<u64> {
    if value > 0 {
        Some(value as u64)
    } else {
        None
    }
}

pub fn to_accessibility_requirements(req: Option<&TopologyRequirement>) -> AccessibilityRequirements {
    match req {
        Some(req) => AccessibilityRequirements {
            preferred: req.preferred.iter().map(topology_segments).collect(),
            requisite: req.requisite.iter().map(topology_segments).collect(),
        },
        None => AccessibilityRequirements::default(),
    }
}

fn topology_segments(topology: &Topology) -> BTreeMap<String, String> {
    topology.segments.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
}

/// Volume context echoed back on `CreateVolume`/`ControllerPublishVolume` so
/// `NodeStageVolume` can reconstruct staging parameters without re-reading
/// the storage class (the node service never sees secrets twice).
pub fn volume_context(params: &StorageClassParams) -> std::collections::HashMap<String, String> {
    let mut ctx = std::collections::HashMap::new();
    ctx.insert("type".to_string(), params.volume_type.as_str().to_string());
    ctx.insert("encrypted".to_string(), params.encrypted.to_string());
    if let Some(fstype) = &params.fstype {
        ctx.insert("fstype".to_string(), fstype.clone());
    }
    if let Some(cipher) = &params.luks_cipher {
        ctx.insert("luks-cipher".to_string(), cipher.clone());
    }
    if let Some(hash) = &params.luks_hash {
        ctx.insert("luks-hash".to_string(), hash.clone());
    }
    if let Some(key_size) = &params.luks_key_size {
        ctx.insert("luks-key-size".to_string(), key_size.clone());
    }
    ctx
}
