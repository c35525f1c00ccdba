//! Device-name allocation and per-VM attachment bookkeeping (design spec
//! §4.3, §4.4).

pub mod allocator;
pub mod tracker;

pub use allocator::{device_path, DeviceError};
pub use tracker::{AttachmentTracker, TrackerError};
