//! Cloud Adapter (design spec §4.2): a thin typed wrapper over the cloud's
//! volume/snapshot/VM HTTP API. Concrete cloud errors are classified into
//! the driver-wide error taxonomy exactly once, here; nothing upstream
//! re-interprets a `DriverError`'s kind.

pub mod http;
pub mod metrics;
pub mod model;

use async_trait::async_trait;
use bsu_common::error::Result;
use bsu_common::types::{SubRegion, Tags, VmId};

pub use http::HttpCloudAdapter;
pub use metrics::{AdapterMetrics, ErrorClass, Snapshot as MetricsSnapshot};
pub use model::*;

/// Capability set of the cloud's block-storage/compute control plane,
/// exposed as an interface so tests can substitute a deterministic mock
/// (design spec §9).
#[async_trait]
pub trait CloudAdapter: Send + Sync {
    async fn create_volume(&self, request: CreateVolumeRequest) -> Result<CloudVolume>;
    async fn delete_volume(&self, volume_id: &str) -> Result<()>;
    async fn read_volumes(&self, filter: VolumeFilter) -> Result<Vec<CloudVolume>>;
    async fn update_volume(&self, request: UpdateVolumeRequest) -> Result<CloudVolume>;
    async fn attach_volume(&self, volume_id: &str, vm_id: &VmId, device: &str) -> Result<()>;
    async fn detach_volume(&self, volume_id: &str, vm_id: &VmId) -> Result<()>;
    async fn create_snapshot(&self, request: CreateSnapshotRequest) -> Result<CloudSnapshot>;
    async fn delete_snapshot(&self, snapshot_id: &str) -> Result<()>;
    /// Page-token-through for explicitly paginated callers (ListSnapshots,
    /// §4.5.9): one HTTP call per invocation, caller drives pagination.
    async fn read_snapshots_page(&self, query: SnapshotQuery) -> Result<SnapshotPage>;
    /// Transparently follows `next_token` until exhausted and returns the
    /// assembled result (§4.2 "pagination is hidden").
    async fn read_snapshots(&self, filter: SnapshotFilter) -> Result<Vec<CloudSnapshot>> {
        let mut out = Vec::new();
        let mut page_token = None;
        loop {
            let page = self
                .read_snapshots_page(SnapshotQuery {
                    filter: filter.clone(),
                    max_entries: None,
                    page_token,
                })
                .await?;
            out.extend(page.items);
            page_token = page.next_page_token;
            if page_token.is_none() {
                break;
            }
        }
        Ok(out)
    }
    async fn read_vms(&self, filter: VmFilter) -> Result<Vec<bsu_common::types::VmInfo>>;
}

#[derive(Debug, Clone, Default)]
pub struct VolumeFilter {
    pub id: Option<String>,
    pub name_tag: Option<String>,
    pub sub_region: Option<SubRegion>,
}

impl VolumeFilter {
    #[must_use]
    pub fn by_id(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn by_name_tag(name_tag: impl Into<String>) -> Self {
        Self {
            name_tag: Some(name_tag.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SnapshotFilter {
    pub id: Option<String>,
    pub name_tag: Option<String>,
    pub source_volume_id: Option<String>,
}

impl SnapshotFilter {
    #[must_use]
    pub fn by_id(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct SnapshotQuery {
    pub filter: SnapshotFilter,
    pub max_entries: Option<u32>,
    pub page_token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SnapshotPage {
    pub items: Vec<CloudSnapshot>,
    pub next_page_token: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct VmFilter {
    pub vm_id: Option<VmId>,
}

#[derive(Debug, Clone)]
pub struct CreateVolumeRequest {
    pub capacity_gib: u64,
    pub volume_type: bsu_common::types::VolumeType,
    pub iops_per_gib: Option<u32>,
    pub sub_region: SubRegion,
    pub encrypted: bool,
    pub kms_key_id: Option<String>,
    pub snapshot_source: Option<String>,
    pub tags: Tags,
}

#[derive(Debug, Clone)]
pub struct UpdateVolumeRequest {
    pub volume_id: String,
    pub capacity_gib: Option<u64>,
    pub iops_per_gib: Option<u32>,
    pub volume_type: Option<bsu_common::types::VolumeType>,
}

#[derive(Debug, Clone)]
pub struct CreateSnapshotRequest {
    pub source_volume_id: String,
    pub tags: Tags,
}
