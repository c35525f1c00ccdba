//! Adapter-level record shapes. These are exactly the domain types defined
//! in `bsu_common::types` — the Cloud Adapter does not keep its own parallel
//! volume/snapshot representation, it just produces the one the rest of the
//! driver consumes.

pub use bsu_common::types::Snapshot as CloudSnapshot;
pub use bsu_common::types::Volume as CloudVolume;
