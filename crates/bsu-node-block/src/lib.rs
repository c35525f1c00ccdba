//! Node Block Layer (design spec §4.7) — device discovery, LUKS, and
//! filesystem format/mount/resize, run per-volume on exactly one node.

mod capacity;
mod crypto;
mod layer;
mod mounter;
mod params;

pub use capacity::max_volumes_per_node;
pub use crypto::{mapping_name, Crypto, LuksFormatOptions, OsCrypto};
pub use layer::NodeBlockLayer;
pub use mounter::{FsStats, Mounter, OsMounter};
pub use params::{ExpandVolumeParams, PublishVolumeParams, StageVolumeParams, UnstageVolumeParams};
