//! The Cloud Coordinator (design spec §4.5) — idempotent volume/snapshot
//! lifecycle management on top of an asynchronous, per-call-throttled cloud
//! API.

mod coordinator;
mod fingerprint;
mod params;

pub use coordinator::{Coordinator, ListSnapshotsQuery};
pub use params::{CreateSnapshotParams, CreateVolumeParams};
