//! The Cloud Coordinator (design spec §4.5): idempotent Create/Delete/
//! Attach/Detach/Resize/Modify/Snapshot operations, each convergent on the
//! cloud's observed state and serialized per fingerprint where the
//! operation is idempotent on a user-supplied name.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use bsu_attach::{device_path, AttachmentTracker, TrackerError};
use bsu_backoff::{BackoffError, BackoffPolicy, Step};
use bsu_cloud::{
    CloudAdapter, CreateSnapshotRequest, CreateVolumeRequest, SnapshotFilter, SnapshotPage,
    SnapshotQuery, UpdateVolumeRequest, VmFilter, VolumeFilter,
};
use bsu_common::error::{DriverError, Result};
use bsu_common::types::{
    bytes_to_gib_round_up, gib_to_bytes, AttachmentState, Snapshot, SnapshotState, VmId, Volume,
    VolumeState, VolumeType,
};

use crate::fingerprint::Coalescer;
use crate::params::{CreateSnapshotParams, CreateVolumeParams};

/// Per-volume IOPS ceiling enforced by the cloud (design spec §4.5.1,
/// §4.5.6: clamp, never fail, on excess user input).
const MAX_VOLUME_IOPS: u64 = 64_000;

const NAME_TAG_KEY: &str = "name";

/// §4.5.9 `ListSnapshots` query. Either a single id lookup, or a
/// source-volume-scoped, paginated listing.
#[derive(Debug, Clone, Default)]
pub struct ListSnapshotsQuery {
    pub id: Option<String>,
    pub source_volume_id: Option<String>,
    pub max_entries: Option<u32>,
    pub page_token: Option<String>,
}

pub struct Coordinator {
    cloud: Arc<dyn CloudAdapter>,
    tracker: Arc<AttachmentTracker>,
    backoff: BackoffPolicy,
    default_volume_gib: u64,
    create_volume_inflight: Coalescer<Volume>,
    create_snapshot_inflight: Coalescer<Snapshot>,
}

impl Coordinator {
    pub fn new(
        cloud: Arc<dyn CloudAdapter>,
        tracker: Arc<AttachmentTracker>,
        backoff: BackoffPolicy,
        default_volume_gib: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            cloud,
            tracker,
            backoff,
            default_volume_gib,
            create_volume_inflight: Coalescer::new(),
            create_snapshot_inflight: Coalescer::new(),
        })
    }

    async fn read_volume_by_id(&self, volume_id: &str) -> Result<Volume> {
        let mut matches = self
            .cloud
            .read_volumes(VolumeFilter::by_id(volume_id))
            .await?;
        match matches.len() {
            0 => Err(DriverError::NotFound(format!("volume {volume_id}"))),
            1 => Ok(matches.remove(0)),
            _ => Err(DriverError::Internal(format!(
                "multiple volumes matched id {volume_id}"
            ))),
        }
    }

    async fn read_snapshot_by_id(&self, snapshot_id: &str) -> Result<Snapshot> {
        let mut matches = self
            .cloud
            .read_snapshots(SnapshotFilter::by_id(snapshot_id))
            .await?;
        match matches.len() {
            0 => Err(DriverError::NotFound(format!("snapshot {snapshot_id}"))),
            1 => Ok(matches.remove(0)),
            _ => Err(DriverError::Internal(format!(
                "multiple snapshots matched id {snapshot_id}"
            ))),
        }
    }

    // ---- 4.5.1 CreateVolume --------------------------------------------

    pub async fn create_volume(
        self: &Arc<Self>,
        params: CreateVolumeParams,
        cancel: &CancellationToken,
    ) -> Result<Volume> {
        let key = params.name.clone();
        let this = Arc::clone(self);
        let cancel = cancel.clone();
        self.create_volume_inflight
            .run(key, move || {
                Box::pin(async move { this.create_volume_inner(params, &cancel).await })
            })
            .await
    }

    async fn create_volume_inner(
        &self,
        params: CreateVolumeParams,
        cancel: &CancellationToken,
    ) -> Result<Volume> {
        let requested_gib =
            resolve_capacity_gib(params.required_bytes, params.limit_bytes, self.default_volume_gib)?;

        let existing = self
            .cloud
            .read_volumes(VolumeFilter::by_name_tag(params.name.clone()))
            .await
            .map_err(|e| e.with_context(format!("create-volume({})", params.name)))?;

        match existing.len() {
            0 => {}
            1 => return match_existing_volume(&existing[0], &params, requested_gib),
            _ => {
                return Err(DriverError::Internal(format!(
                    "multiple volumes matched name {}",
                    params.name
                )))
            }
        }

        let mut tags = params.tags.clone();
        tags.insert(NAME_TAG_KEY.to_string(), params.name.clone());
        let iops_per_gib = clamp_iops(params.iops_per_gib, requested_gib);

        let created = self
            .cloud
            .create_volume(CreateVolumeRequest {
                capacity_gib: requested_gib,
                volume_type: params.volume_type,
                iops_per_gib,
                sub_region: params.sub_region.clone(),
                encrypted: params.encrypted,
                kms_key_id: params.kms_key_id.clone(),
                snapshot_source: params.snapshot_source.clone(),
                tags,
            })
            .await
            .map_err(|e| e.with_context(format!("create-volume({})", params.name)))?;

        let volume_id = created.id.clone();
        let result = self
            .backoff
            .run(cancel, || async {
                match self.read_volume_by_id(&volume_id).await {
                    Ok(volume) if volume.state == VolumeState::Available => Step::Done(volume),
                    Ok(volume) if volume.state == VolumeState::Error => Step::Fail(
                        DriverError::Internal(format!("volume {volume_id} entered error state")),
                    ),
                    Ok(volume) if volume.state == VolumeState::Creating => Step::Retry,
                    Ok(volume) => Step::Done(volume),
                    Err(e) => Step::Fail(e),
                }
            })
            .await;

        map_backoff(result, || format!("create-volume({})", params.name))
    }

    // ---- 4.5.2 DeleteVolume ---------------------------------------------

    pub async fn delete_volume(&self, volume_id: &str, cancel: &CancellationToken) -> Result<()> {
        match self.cloud.delete_volume(volume_id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e.with_context(format!("delete-volume({volume_id})"))),
        }

        let result = self
            .backoff
            .run(cancel, || async {
                match self.read_volume_by_id(volume_id).await {
                    Ok(volume) if volume.state == VolumeState::Deleting => Step::Done(()),
                    Ok(_) => Step::Retry,
                    Err(e) if e.is_not_found() => Step::Done(()),
                    Err(e) => Step::Fail(e),
                }
            })
            .await;

        map_backoff(result, || format!("delete-volume({volume_id})"))
    }

    // ---- 4.5.3 AttachVolume -----------------------------------------------

    pub async fn attach_volume(
        &self,
        volume_id: &str,
        vm_id: &VmId,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let vms = self
            .cloud
            .read_vms(VmFilter {
                vm_id: Some(vm_id.clone()),
            })
            .await
            .map_err(|e| e.with_context(format!("attach-volume({volume_id})")))?;
        if vms.is_empty() {
            return Err(DriverError::NotFound(format!("vm {vm_id}")));
        }

        let (suffix, already_assigned) = self
            .tracker
            .new_device(vm_id, volume_id)
            .map_err(map_tracker_error)?;
        let path = device_path(&suffix);

        if !already_assigned {
            if let Err(e) = self.cloud.attach_volume(volume_id, vm_id, &path).await {
                // Root cause unknown: the cloud may still process this
                // submission. Keep the reservation so a concurrent caller
                // cannot receive the same suffix underneath it (§4.4/§9).
                let _ = self.tracker.taint(vm_id, &suffix);
                return Err(e.with_context(format!("attach-volume({volume_id})")));
            }
        }

        let result = self
            .backoff
            .run(cancel, || async {
                match self.read_volume_by_id(volume_id).await {
                    Ok(volume) => match &volume.attachment {
                        Some(a) if a.vm_id == *vm_id && a.state == AttachmentState::Attached => {
                            Step::Done(())
                        }
                        Some(_) | None => Step::Retry,
                    },
                    Err(e) => Step::Fail(e),
                }
            })
            .await;

        if result.is_err() {
            let _ = self.tracker.taint(vm_id, &suffix);
        }

        map_backoff(result, || format!("attach-volume({volume_id})"))?;
        Ok(path)
    }

    // ---- 4.5.4 DetachVolume -----------------------------------------------

    pub async fn detach_volume(
        &self,
        volume_id: &str,
        vm_id: &VmId,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let device = self.tracker.get_device(vm_id, volume_id);

        match self.read_volume_by_id(volume_id).await {
            Ok(_) => {}
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e.with_context(format!("detach-volume({volume_id})"))),
        }

        self.cloud
            .detach_volume(volume_id, vm_id)
            .await
            .map_err(|e| e.with_context(format!("detach-volume({volume_id})")))?;

        let result = self
            .backoff
            .run(cancel, || async {
                match self.read_volume_by_id(volume_id).await {
                    Ok(volume) => match &volume.attachment {
                        None => Step::Done(()),
                        Some(a) if a.state == AttachmentState::Detached => Step::Done(()),
                        Some(_) => Step::Retry,
                    },
                    Err(e) if e.is_not_found() => Step::Done(()),
                    Err(e) => Step::Fail(e),
                }
            })
            .await;

        map_backoff(result, || format!("detach-volume({volume_id})"))?;

        if let Some(device) = device {
            let _ = self.tracker.release(vm_id, &device, false);
        }
        Ok(())
    }

    // ---- 4.5.5 ResizeVolume -----------------------------------------------

    pub async fn resize_volume(
        &self,
        volume_id: &str,
        new_bytes: u64,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let current = self.read_volume_by_id(volume_id).await?;
        let new_gib = bytes_to_gib_round_up(new_bytes);

        if current.capacity_gib >= new_gib {
            return Ok(current.capacity_bytes());
        }

        self.cloud
            .update_volume(UpdateVolumeRequest {
                volume_id: volume_id.to_string(),
                capacity_gib: Some(new_gib),
                iops_per_gib: None,
                volume_type: None,
            })
            .await
            .map_err(|e| e.with_context(format!("resize-volume({volume_id})")))?;

        let result = self
            .backoff
            .run(cancel, || async {
                match self.read_volume_by_id(volume_id).await {
                    Ok(volume)
                        if volume.capacity_gib >= new_gib
                            || volume.state == VolumeState::Optimizing =>
                    {
                        Step::Done(())
                    }
                    Ok(_) => Step::Retry,
                    Err(e) => Step::Fail(e),
                }
            })
            .await;

        map_backoff(result, || format!("resize-volume({volume_id})"))?;
        Ok(gib_to_bytes(new_gib))
    }

    // ---- 4.5.6 ModifyVolume -----------------------------------------------

    pub async fn modify_volume(
        &self,
        volume_id: &str,
        new_type: Option<VolumeType>,
        new_iops_per_gib: Option<u32>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let current = self.read_volume_by_id(volume_id).await?;
        let iops_per_gib = clamp_iops(new_iops_per_gib, current.capacity_gib);

        self.cloud
            .update_volume(UpdateVolumeRequest {
                volume_id: volume_id.to_string(),
                capacity_gib: None,
                iops_per_gib,
                volume_type: new_type,
            })
            .await
            .map_err(|e| e.with_context(format!("modify-volume({volume_id})")))?;

        let result = self
            .backoff
            .run(cancel, || async {
                match self.read_volume_by_id(volume_id).await {
                    Ok(volume) => {
                        let type_ok = new_type.is_none_or(|t| volume.volume_type == t);
                        let iops_ok = iops_per_gib.is_none_or(|v| volume.iops_per_gib == Some(v));
                        if type_ok && iops_ok {
                            Step::Done(())
                        } else {
                            Step::Retry
                        }
                    }
                    Err(e) => Step::Fail(e),
                }
            })
            .await;

        map_backoff(result, || format!("modify-volume({volume_id})"))
    }

    // ---- 4.5.7 CreateSnapshot ----------------------------------------------

    pub async fn create_snapshot(
        self: &Arc<Self>,
        params: CreateSnapshotParams,
        cancel: &CancellationToken,
    ) -> Result<Snapshot> {
        let key = params.name.clone();
        let this = Arc::clone(self);
        let cancel = cancel.clone();
        self.create_snapshot_inflight
            .run(key, move || {
                Box::pin(async move { this.create_snapshot_inner(params, &cancel).await })
            })
            .await
    }

    async fn create_snapshot_inner(
        &self,
        params: CreateSnapshotParams,
        cancel: &CancellationToken,
    ) -> Result<Snapshot> {
        let existing = self
            .cloud
            .read_snapshots(SnapshotFilter {
                id: None,
                name_tag: Some(params.name.clone()),
                source_volume_id: None,
            })
            .await
            .map_err(|e| e.with_context(format!("create-snapshot({})", params.name)))?;

        match existing.len() {
            0 => {}
            1 => {
                let snapshot = &existing[0];
                if snapshot.source_volume_id != params.source_volume_id {
                    return Err(DriverError::AlreadyExists(format!(
                        "snapshot {} exists for a different source volume",
                        params.name
                    )));
                }
                if snapshot.state == SnapshotState::Error {
                    // Terminal at this layer (design spec §9): the
                    // orchestrator's sidecar is expected to delete and
                    // retry, not this driver.
                    return Err(DriverError::ResourceExhausted(format!(
                        "snapshot {} is in error state",
                        params.name
                    )));
                }
                return Ok(snapshot.clone());
            }
            _ => {
                return Err(DriverError::Internal(format!(
                    "multiple snapshots matched name {}",
                    params.name
                )))
            }
        }

        let mut tags = params.tags.clone();
        tags.insert(NAME_TAG_KEY.to_string(), params.name.clone());

        let created = self
            .cloud
            .create_snapshot(CreateSnapshotRequest {
                source_volume_id: params.source_volume_id.clone(),
                tags,
            })
            .await
            .map_err(|e| e.with_context(format!("create-snapshot({})", params.name)))?;

        let snapshot_id = created.id.clone();
        let result = self
            .backoff
            .run(cancel, || async {
                match self.read_snapshot_by_id(&snapshot_id).await {
                    Ok(snapshot) if snapshot.ready_to_use() => Step::Done(snapshot),
                    Ok(snapshot) if snapshot.state == SnapshotState::Error => Step::Fail(
                        DriverError::ResourceExhausted(format!(
                            "snapshot {snapshot_id} entered error state"
                        )),
                    ),
                    Ok(_) => Step::Retry,
                    Err(e) => Step::Fail(e),
                }
            })
            .await;

        map_backoff(result, || format!("create-snapshot({})", params.name))
    }

    // ---- 4.5.8 DeleteSnapshot ---------------------------------------------

    pub async fn delete_snapshot(&self, snapshot_id: &str) -> Result<()> {
        match self.cloud.delete_snapshot(snapshot_id).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e.with_context(format!("delete-snapshot({snapshot_id})"))),
        }
    }

    // ---- 4.5.9 ListSnapshots -----------------------------------------------

    pub async fn list_snapshots(&self, query: ListSnapshotsQuery) -> Result<SnapshotPage> {
        if let Some(id) = &query.id {
            return match self.read_snapshot_by_id(id).await {
                Ok(snapshot) => Ok(SnapshotPage {
                    items: vec![snapshot],
                    next_page_token: None,
                }),
                Err(e) if e.is_not_found() => Ok(SnapshotPage {
                    items: vec![],
                    next_page_token: None,
                }),
                Err(e) => Err(e),
            };
        }

        self.cloud
            .read_snapshots_page(SnapshotQuery {
                filter: SnapshotFilter {
                    id: None,
                    name_tag: None,
                    source_volume_id: query.source_volume_id,
                },
                max_entries: query.max_entries,
                page_token: query.page_token,
            })
            .await
    }
}

fn match_existing_volume(
    volume: &Volume,
    params: &CreateVolumeParams,
    requested_gib: u64,
) -> Result<Volume> {
    if volume.capacity_gib != requested_gib {
        return Err(DriverError::AlreadyExists(format!(
            "volume {} exists with capacityGiB={} (requested {requested_gib})",
            params.name, volume.capacity_gib
        )));
    }
    if volume.snapshot_source != params.snapshot_source {
        return Err(DriverError::AlreadyExists(format!(
            "volume {} exists with a different snapshot source",
            params.name
        )));
    }
    if volume.sub_region != params.sub_region {
        return Err(DriverError::AlreadyExists(format!(
            "volume {} exists in sub-region {} (requested {})",
            params.name, volume.sub_region, params.sub_region
        )));
    }
    Ok(volume.clone())
}

/// §4.5.1 step 1: round up to GiB, applying the configured default when no
/// range is given, failing `invalid-argument` if the range's upper bound
/// can't hold the rounded-up requirement.
fn resolve_capacity_gib(
    required_bytes: Option<u64>,
    limit_bytes: Option<u64>,
    default_gib: u64,
) -> Result<u64> {
    let requested_gib = match required_bytes {
        Some(bytes) if bytes > 0 => bytes_to_gib_round_up(bytes),
        _ => default_gib,
    };

    if let Some(limit) = limit_bytes {
        if gib_to_bytes(requested_gib) > limit {
            return Err(DriverError::InvalidArgument(format!(
                "requested {requested_gib} GiB exceeds capacity range limit of {limit} bytes"
            )));
        }
    }

    Ok(requested_gib)
}

/// Clamp `iopsPerGiB` so the cloud's per-volume IOPS ceiling isn't
/// exceeded; higher user input is accepted silently, never rejected
/// (design spec §4.5.1).
fn clamp_iops(iops_per_gib: Option<u32>, capacity_gib: u64) -> Option<u32> {
    iops_per_gib.map(|requested| {
        let capacity_gib = capacity_gib.max(1);
        let ceiling = MAX_VOLUME_IOPS / capacity_gib;
        let clamped = u64::from(requested).min(ceiling).min(u64::from(u32::MAX));
        if clamped < u64::from(requested) {
            debug!(requested, clamped, capacity_gib, "clamped iopsPerGiB to cloud ceiling");
        }
        clamped as u32
    })
}

fn map_tracker_error(err: TrackerError) -> DriverError {
    match err {
        TrackerError::Device(_) => DriverError::ResourceExhausted(err.to_string()),
        TrackerError::Conflict(_) | TrackerError::NotReserved(_) => {
            warn!(%err, "unexpected attachment tracker error");
            DriverError::Internal(err.to_string())
        }
    }
}

/// Translate a backoff outcome into the driver error taxonomy (§7):
/// exhaustion is `deadline-exceeded`, cancellation is `unavailable`
/// (retriable, the caller's scope ended before convergence), a terminal
/// attempt failure keeps its original kind untouched.
fn map_backoff<T>(
    result: std::result::Result<T, BackoffError<DriverError>>,
    context: impl FnOnce() -> String,
) -> Result<T> {
    result.map_err(|e| match e {
        BackoffError::Cancelled => {
            DriverError::Unavailable(format!("{}: operation cancelled", context()))
        }
        BackoffError::Exhausted => {
            DriverError::DeadlineExceeded(format!("{}: backoff steps exhausted", context()))
        }
        BackoffError::Attempt(err) => err,
    })
}
