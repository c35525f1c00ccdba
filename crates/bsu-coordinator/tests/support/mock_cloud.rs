//! Deterministic `CloudAdapter` test double (design spec §9: "the Cloud
//! Adapter is an interface... so that tests can substitute a deterministic
//! mock").

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use bsu_cloud::{
    CloudAdapter, CreateSnapshotRequest, CreateVolumeRequest, SnapshotFilter, SnapshotPage,
    SnapshotQuery, UpdateVolumeRequest, VmFilter, VolumeFilter,
};
use bsu_common::error::{DriverError, Result};
use bsu_common::types::{
    Attachment, AttachmentState, Snapshot, SnapshotState, Volume, VolumeState, VmId, VmInfo,
};

/// In-memory cloud: every submitted operation takes effect immediately
/// (no `creating`/`optimizing` transient window) unless a test arranges
/// otherwise via the failure hooks below.
#[derive(Default)]
pub struct MockCloudAdapter {
    volumes: Mutex<HashMap<String, Volume>>,
    snapshots: Mutex<HashMap<String, Snapshot>>,
    vms: Mutex<HashMap<String, VmInfo>>,
    next_id: AtomicU64,
    pub create_volume_calls: AtomicU32,
    /// Number of remaining `attach_volume` calls (per volume id) that
    /// should fail before succeeding — scenario 5, "attach after taint".
    fail_attach_n_times: Mutex<HashMap<String, u32>>,
}

impl MockCloudAdapter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_vm(&self, id: &str, sub_region: &str) {
        self.vms.lock().insert(
            id.to_string(),
            VmInfo {
                id: VmId::from(id),
                sub_region: sub_region.into(),
            },
        );
    }

    pub fn fail_next_attach(&self, volume_id: &str, times: u32) {
        self.fail_attach_n_times
            .lock()
            .insert(volume_id.to_string(), times);
    }

    pub fn seed_snapshots(&self, count: usize, source_volume_id: &str) {
        let mut snapshots = self.snapshots.lock();
        for i in 0..count {
            let id = format!("snap-{i:04}");
            snapshots.insert(
                id.clone(),
                Snapshot {
                    id,
                    source_volume_id: source_volume_id.to_string(),
                    size_bytes: 0,
                    creation_time: chrono::DateTime::from_timestamp(i as i64, 0).unwrap(),
                    state: SnapshotState::Completed,
                    tags: Default::default(),
                },
            );
        }
    }

    fn next_id(&self, prefix: &str) -> String {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        format!("{prefix}-{n}")
    }
}

#[async_trait]
impl CloudAdapter for MockCloudAdapter {
    async fn create_volume(&self, request: CreateVolumeRequest) -> Result<Volume> {
        self.create_volume_calls.fetch_add(1, Ordering::SeqCst);
        let id = self.next_id("vol");
        let volume = Volume {
            id: id.clone(),
            name: request
                .tags
                .get("name")
                .cloned()
                .unwrap_or_else(|| id.clone()),
            capacity_gib: request.capacity_gib,
            volume_type: request.volume_type,
            iops_per_gib: request.iops_per_gib,
            sub_region: request.sub_region,
            snapshot_source: request.snapshot_source,
            state: VolumeState::Available,
            attachment: None,
            tags: request.tags,
        };
        self.volumes.lock().insert(id, volume.clone());
        Ok(volume)
    }

    async fn delete_volume(&self, volume_id: &str) -> Result<()> {
        match self.volumes.lock().remove(volume_id) {
            Some(_) => Ok(()),
            None => Err(DriverError::NotFound(volume_id.to_string())),
        }
    }

    async fn read_volumes(&self, filter: VolumeFilter) -> Result<Vec<Volume>> {
        let volumes = self.volumes.lock();
        Ok(volumes
            .values()
            .filter(|v| filter.id.as_deref().is_none_or(|id| id == v.id))
            .filter(|v| {
                filter
                    .name_tag
                    .as_deref()
                    .is_none_or(|name| v.tags.get("name").map(String::as_str) == Some(name))
            })
            .cloned()
            .collect())
    }

    async fn update_volume(&self, request: UpdateVolumeRequest) -> Result<Volume> {
        let mut volumes = self.volumes.lock();
        let volume = volumes
            .get_mut(&request.volume_id)
            .ok_or_else(|| DriverError::NotFound(request.volume_id.clone()))?;
        if let Some(capacity_gib) = request.capacity_gib {
            volume.capacity_gib = capacity_gib;
        }
        if let Some(iops_per_gib) = request.iops_per_gib {
            volume.iops_per_gib = Some(iops_per_gib);
        }
        if let Some(volume_type) = request.volume_type {
            volume.volume_type = volume_type;
        }
        Ok(volume.clone())
    }

    async fn attach_volume(&self, volume_id: &str, vm_id: &VmId, device: &str) -> Result<()> {
        // The attach takes effect regardless of whether this call reports
        // success: a scheduled failure simulates the ambiguous case where
        // the cloud processed the request but the response was lost
        // (§4.5.3's reason for tainting instead of releasing).
        {
            let mut volumes = self.volumes.lock();
            let volume = volumes
                .get_mut(volume_id)
                .ok_or_else(|| DriverError::NotFound(volume_id.to_string()))?;
            volume.attachment = Some(Attachment {
                volume_id: volume_id.to_string(),
                vm_id: vm_id.clone(),
                device_path: device.to_string(),
                state: AttachmentState::Attached,
            });
            volume.state = VolumeState::InUse;
        }

        let mut remaining = self.fail_attach_n_times.lock();
        if let Some(n) = remaining.get_mut(volume_id) {
            if *n > 0 {
                *n -= 1;
                return Err(DriverError::Unavailable(
                    "simulated attach failure (ambiguous — cloud may have processed it)".into(),
                ));
            }
        }
        Ok(())
    }

    async fn detach_volume(&self, volume_id: &str, _vm_id: &VmId) -> Result<()> {
        let mut volumes = self.volumes.lock();
        let volume = volumes
            .get_mut(volume_id)
            .ok_or_else(|| DriverError::NotFound(volume_id.to_string()))?;
        volume.attachment = None;
        volume.state = VolumeState::Available;
        Ok(())
    }

    async fn create_snapshot(&self, request: CreateSnapshotRequest) -> Result<Snapshot> {
        let id = self.next_id("snap");
        let snapshot = Snapshot {
            id: id.clone(),
            source_volume_id: request.source_volume_id,
            size_bytes: 0,
            creation_time: chrono::DateTime::from_timestamp(0, 0).unwrap(),
            state: SnapshotState::Completed,
            tags: request.tags,
        };
        self.snapshots.lock().insert(id, snapshot.clone());
        Ok(snapshot)
    }

    async fn delete_snapshot(&self, snapshot_id: &str) -> Result<()> {
        match self.snapshots.lock().remove(snapshot_id) {
            Some(_) => Ok(()),
            None => Err(DriverError::NotFound(snapshot_id.to_string())),
        }
    }

    async fn read_snapshots_page(&self, query: SnapshotQuery) -> Result<SnapshotPage> {
        let snapshots = self.snapshots.lock();
        let mut matching: Vec<Snapshot> = snapshots
            .values()
            .filter(|s| {
                query
                    .filter
                    .id
                    .as_deref()
                    .is_none_or(|id| id == s.id)
            })
            .filter(|s| {
                query
                    .filter
                    .name_tag
                    .as_deref()
                    .is_none_or(|name| s.tags.get("name").map(String::as_str) == Some(name))
            })
            .filter(|s| {
                query
                    .filter
                    .source_volume_id
                    .as_deref()
                    .is_none_or(|id| id == s.source_volume_id)
            })
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.id.cmp(&b.id));

        let start = query
            .page_token
            .as_deref()
            .and_then(|t| t.parse::<usize>().ok())
            .unwrap_or(0);
        let page_size = query.max_entries.map_or(matching.len(), |n| n as usize);
        let end = (start + page_size).min(matching.len());
        let items = matching[start..end].to_vec();
        let next_page_token = if end < matching.len() {
            Some(end.to_string())
        } else {
            None
        };

        Ok(SnapshotPage {
            items,
            next_page_token,
        })
    }

    async fn read_vms(&self, filter: VmFilter) -> Result<Vec<VmInfo>> {
        let vms = self.vms.lock();
        Ok(vms
            .values()
            .filter(|vm| filter.vm_id.as_ref().is_none_or(|id| *id == vm.id))
            .cloned()
            .collect())
    }
}
