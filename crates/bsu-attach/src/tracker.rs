//! Attachment tracker (design spec §4.4).
//!
//! Per-VM bookkeeping of which device-name suffix a volume currently
//! occupies. Mirrors the `RwLock<HashMap<...>>` bookkeeping style used for
//! volume state elsewhere in this workspace, but keyed per-VM and guarded
//! with `parking_lot::Mutex` since reservations are always read-modify-write.

use std::collections::HashMap;

use parking_lot::Mutex;
use thiserror::Error;

use crate::allocator::{self, DeviceError};
use bsu_common::types::VmId;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TrackerError {
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error("device {0} is reserved for a different volume")]
    Conflict(String),
    #[error("no reservation found for device {0}")]
    NotReserved(String),
}

#[derive(Debug, Clone)]
struct Reservation {
    volume_id: String,
    /// Set when a release was ambiguous (the cloud call may or may not have
    /// taken effect). A tainted reservation survives a non-forced `release`
    /// so a retried attach converges on the same device instead of risking
    /// two devices mapped to the same volume.
    tainted: bool,
}

#[derive(Default)]
struct VmState {
    /// suffix -> reservation
    reservations: HashMap<String, Reservation>,
}

/// Tracks per-VM device reservations across concurrent attach/detach calls.
pub struct AttachmentTracker {
    vms: Mutex<HashMap<String, VmState>>,
}

impl AttachmentTracker {
    #[must_use]
    pub fn new() -> Self {
        Self {
            vms: Mutex::new(HashMap::new()),
        }
    }

    /// Reserve a device name for `volume_id` on `vm`. Idempotent: if
    /// `volume_id` already holds a reservation on this VM, returns the same
    /// suffix with `already_assigned = true` instead of allocating a new one
    /// (design spec §4.4).
    pub fn new_device(
        &self,
        vm: &VmId,
        volume_id: &str,
    ) -> Result<(String, bool), TrackerError> {
        let mut vms = self.vms.lock();
        let state = vms.entry(vm.to_string()).or_default();

        if let Some((suffix, _)) = state
            .reservations
            .iter()
            .find(|(_, r)| r.volume_id == volume_id)
        {
            return Ok((suffix.clone(), true));
        }

        let taken: std::collections::HashSet<String> =
            state.reservations.keys().cloned().collect();
        let suffix = allocator::first_free(&taken)?;
        state.reservations.insert(
            suffix.clone(),
            Reservation {
                volume_id: volume_id.to_string(),
                tainted: false,
            },
        );
        Ok((suffix, false))
    }

    /// Look up the device name already reserved for `volume_id` on `vm`,
    /// without allocating a new one.
    pub fn get_device(&self, vm: &VmId, volume_id: &str) -> Option<String> {
        let vms = self.vms.lock();
        vms.get(vm.as_str())?
            .reservations
            .iter()
            .find(|(_, r)| r.volume_id == volume_id)
            .map(|(suffix, _)| suffix.clone())
    }

    /// Mark the reservation backing `device` on `vm` as tainted: a later
    /// non-forced `release` will refuse to free it.
    pub fn taint(&self, vm: &VmId, device: &str) -> Result<(), TrackerError> {
        let mut vms = self.vms.lock();
        let state = vms
            .get_mut(vm.as_str())
            .ok_or_else(|| TrackerError::NotReserved(device.to_string()))?;
        let reservation = state
            .reservations
            .get_mut(device)
            .ok_or_else(|| TrackerError::NotReserved(device.to_string()))?;
        reservation.tainted = true;
        Ok(())
    }

    /// Release the reservation for `device` on `vm`. A tainted reservation
    /// is kept unless `force` is set (design spec §9: do not release an
    /// ambiguous in-flight reservation on a plain retry).
    pub fn release(&self, vm: &VmId, device: &str, force: bool) -> Result<(), TrackerError> {
        let mut vms = self.vms.lock();
        let Some(state) = vms.get_mut(vm.as_str()) else {
            return Ok(());
        };

        let Some(reservation) = state.reservations.get(device) else {
            return Ok(());
        };

        if reservation.tainted && !force {
            return Ok(());
        }

        state.reservations.remove(device);
        Ok(())
    }
}

impl Default for AttachmentTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vm(id: &str) -> VmId {
        VmId::from(id.to_string())
    }

    #[test]
    fn device_uniqueness_across_volumes() {
        let tracker = AttachmentTracker::new();
        let (a, _) = tracker.new_device(&vm("i-1"), "vol-a").unwrap();
        let (b, _) = tracker.new_device(&vm("i-1"), "vol-b").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn device_name_order_is_stable() {
        let tracker = AttachmentTracker::new();
        let names: Vec<String> = (0..5)
            .map(|i| tracker.new_device(&vm("i-1"), &format!("vol-{i}")).unwrap().0)
            .collect();
        assert_eq!(names, vec!["b", "c", "d", "e", "f"]);
    }

    #[test]
    fn new_device_is_idempotent_on_volume_id() {
        let tracker = AttachmentTracker::new();
        let (first, first_assigned) = tracker.new_device(&vm("i-1"), "vol-a").unwrap();
        assert!(!first_assigned);
        let (second, second_assigned) = tracker.new_device(&vm("i-1"), "vol-a").unwrap();
        assert_eq!(first, second);
        assert!(second_assigned);
    }

    #[test]
    fn fortieth_reservation_fails() {
        let tracker = AttachmentTracker::new();
        for i in 0..39 {
            tracker
                .new_device(&vm("i-1"), &format!("vol-{i}"))
                .unwrap();
        }
        let err = tracker.new_device(&vm("i-1"), "vol-39").unwrap_err();
        assert!(matches!(err, TrackerError::Device(DeviceError::NoNamesAvailable)));
    }

    #[test]
    fn release_respects_taint_unless_forced() {
        let tracker = AttachmentTracker::new();
        let (device, _) = tracker.new_device(&vm("i-1"), "vol-a").unwrap();
        tracker.taint(&vm("i-1"), &device).unwrap();

        tracker.release(&vm("i-1"), &device, false).unwrap();
        assert_eq!(tracker.get_device(&vm("i-1"), "vol-a"), Some(device.clone()));

        tracker.release(&vm("i-1"), &device, true).unwrap();
        assert_eq!(tracker.get_device(&vm("i-1"), "vol-a"), None);
    }

    #[test]
    fn release_of_unknown_device_is_a_noop() {
        let tracker = AttachmentTracker::new();
        assert!(tracker.release(&vm("i-1"), "z", false).is_ok());
    }
}
