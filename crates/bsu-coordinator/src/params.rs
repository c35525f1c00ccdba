//! Coordinator operation inputs (design spec §4.5).

use bsu_common::types::{SubRegion, Tags, VolumeType};

/// §4.5.1 `CreateVolume` inputs. `sub_region` is resolved from CSI
/// accessibility requirements one layer up, in the Controller Service
/// (§4.6), so it always arrives here already decided.
#[derive(Debug, Clone)]
pub struct CreateVolumeParams {
    pub name: String,
    pub required_bytes: Option<u64>,
    pub limit_bytes: Option<u64>,
    pub volume_type: VolumeType,
    pub iops_per_gib: Option<u32>,
    pub encrypted: bool,
    pub kms_key_id: Option<String>,
    pub snapshot_source: Option<String>,
    pub sub_region: SubRegion,
    pub tags: Tags,
}

/// §4.5.7 `CreateSnapshot` inputs.
#[derive(Debug, Clone)]
pub struct CreateSnapshotParams {
    pub name: String,
    pub source_volume_id: String,
    pub tags: Tags,
}
