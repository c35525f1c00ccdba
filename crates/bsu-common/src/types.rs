//! Core type definitions for the bsu-csi-driver (design spec §3).

use std::collections::BTreeMap;
use std::fmt;

/// Tag set attached to cloud volumes/snapshots. `BTreeMap` so that two tag
/// sets built in different orders still compare equal and hash the same —
/// load-bearing for the idempotent-on-name lookups of §4.5.1/§4.5.7.
pub type Tags = BTreeMap<String, String>;

/// One GiB in bytes.
pub const GIB: u64 = 1024 * 1024 * 1024;

/// Round a byte count up to the nearest whole GiB.
#[must_use]
pub fn bytes_to_gib_round_up(bytes: u64) -> u64 {
    bytes.div_ceil(GIB)
}

/// Convert a GiB count back to bytes.
#[must_use]
pub fn gib_to_bytes(gib: u64) -> u64 {
    gib * GIB
}

/// Availability zone / sub-region a volume lives in.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubRegion(pub String);

impl fmt::Display for SubRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for SubRegion {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for SubRegion {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl SubRegion {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Cloud-assigned VM identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VmId(pub String);

impl fmt::Display for VmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for VmId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for VmId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl VmId {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Cloud volume type (design spec §3, §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VolumeType {
    Standard,
    #[default]
    Gp2,
    Io1,
}

impl VolumeType {
    /// Parse the `type` storage-class parameter value (case-insensitive).
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "standard" => Some(Self::Standard),
            "gp2" => Some(Self::Gp2),
            "io1" => Some(Self::Io1),
            _ => None,
        }
    }

    /// Wire/API representation of the type.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::Gp2 => "gp2",
            Self::Io1 => "io1",
        }
    }

    /// Whether `iopsPerGiB` is required for this type (§3, §6).
    #[must_use]
    pub fn requires_iops(self) -> bool {
        matches!(self, Self::Io1)
    }
}

/// Volume lifecycle state (design spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeState {
    Creating,
    Available,
    InUse,
    Deleting,
    Error,
    /// The cloud reports an in-progress resize; size changes are only
    /// guaranteed to have taken effect once this state is observed (§4.5.5).
    Optimizing,
}

/// Snapshot lifecycle state (design spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotState {
    Pending,
    Completed,
    Error,
    Deleting,
}

/// A cloud block-storage volume (design spec §3).
#[derive(Debug, Clone)]
pub struct Volume {
    pub id: String,
    pub name: String,
    pub capacity_gib: u64,
    pub volume_type: VolumeType,
    pub iops_per_gib: Option<u32>,
    pub sub_region: SubRegion,
    pub snapshot_source: Option<String>,
    pub state: VolumeState,
    pub attachment: Option<Attachment>,
    pub tags: Tags,
}

impl Volume {
    #[must_use]
    pub fn capacity_bytes(&self) -> u64 {
        gib_to_bytes(self.capacity_gib)
    }
}

/// A point-in-time snapshot of a volume (design spec §3).
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub id: String,
    pub source_volume_id: String,
    pub size_bytes: u64,
    pub creation_time: chrono::DateTime<chrono::Utc>,
    pub state: SnapshotState,
    pub tags: Tags,
}

impl Snapshot {
    /// `readyToUse` is true iff `state == Completed` (design spec §3).
    #[must_use]
    pub fn ready_to_use(&self) -> bool {
        matches!(self.state, SnapshotState::Completed)
    }
}

/// Attachment lifecycle state (design spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentState {
    Attaching,
    Attached,
    Detaching,
    Detached,
}

/// A volume-to-VM attachment (design spec §3).
#[derive(Debug, Clone)]
pub struct Attachment {
    pub volume_id: String,
    pub vm_id: VmId,
    pub device_path: String,
    pub state: AttachmentState,
}

/// A VM as reported by the cloud (just enough to verify existence, §4.5.3).
#[derive(Debug, Clone)]
pub struct VmInfo {
    pub id: VmId,
    pub sub_region: SubRegion,
}

/// Parsed, validated storage-class parameters (design spec §6).
#[derive(Debug, Clone)]
pub struct StorageClassParams {
    pub volume_type: VolumeType,
    pub iops_per_gib: Option<u32>,
    pub encrypted: bool,
    pub kms_key_id: Option<String>,
    pub luks_cipher: Option<String>,
    pub luks_hash: Option<String>,
    pub luks_key_size: Option<String>,
    pub fstype: Option<String>,
}

impl Default for StorageClassParams {
    fn default() -> Self {
        Self {
            volume_type: VolumeType::Gp2,
            iops_per_gib: None,
            encrypted: false,
            kms_key_id: None,
            luks_cipher: None,
            luks_hash: None,
            luks_key_size: None,
            fstype: None,
        }
    }
}

impl StorageClassParams {
    /// Parse CSI `CreateVolumeRequest.parameters` (design spec §6). Keys are
    /// matched case-insensitively; the deprecated `fstype` key is accepted
    /// with a warning in favor of `csi.storage.k8s.io/fstype`; any other
    /// unrecognized key is rejected.
    pub fn parse(params: &BTreeMap<String, String>) -> crate::error::Result<Self> {
        use crate::error::DriverError;

        let mut out = Self::default();
        for (key, value) in params {
            match key.to_ascii_lowercase().as_str() {
                "type" => {
                    out.volume_type = VolumeType::parse(value).ok_or_else(|| {
                        DriverError::InvalidArgument(format!("unknown volume type {value:?}"))
                    })?;
                }
                "iopspergb" => {
                    let parsed: u32 = value.parse().map_err(|_| {
                        DriverError::InvalidArgument(format!("invalid iopsPerGB {value:?}"))
                    })?;
                    out.iops_per_gib = Some(parsed);
                }
                "encrypted" => {
                    out.encrypted = value.parse().map_err(|_| {
                        DriverError::InvalidArgument(format!("invalid encrypted {value:?}"))
                    })?;
                }
                "kmskeyid" => out.kms_key_id = Some(value.clone()),
                "luks-cipher" => out.luks_cipher = Some(value.clone()),
                "luks-hash" => out.luks_hash = Some(value.clone()),
                "luks-key-size" => out.luks_key_size = Some(value.clone()),
                "csi.storage.k8s.io/fstype" => out.fstype = Some(value.clone()),
                "fstype" => {
                    tracing::warn!(
                        "storage-class parameter \"fstype\" is deprecated, use csi.storage.k8s.io/fstype"
                    );
                    out.fstype = Some(value.clone());
                }
                _ => {
                    return Err(DriverError::InvalidArgument(format!(
                        "unknown storage-class parameter {key:?}"
                    )))
                }
            }
        }

        if out.volume_type.requires_iops() && out.iops_per_gib.is_none() {
            return Err(DriverError::InvalidArgument(
                "iopsPerGB is required when type=io1".into(),
            ));
        }

        Ok(out)
    }
}

/// Accessibility requirements as CSI passes them: a preferred list and a
/// requisite list of topology segment maps (design spec §4.6).
#[derive(Debug, Clone, Default)]
pub struct AccessibilityRequirements {
    pub preferred: Vec<BTreeMap<String, String>>,
    pub requisite: Vec<BTreeMap<String, String>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DriverError;

    #[test]
    fn round_up_to_gib() {
        assert_eq!(bytes_to_gib_round_up(0), 0);
        assert_eq!(bytes_to_gib_round_up(1), 1);
        assert_eq!(bytes_to_gib_round_up(GIB), 1);
        assert_eq!(bytes_to_gib_round_up(GIB + 1), 2);
    }

    #[test]
    fn volume_type_parse_case_insensitive() {
        assert_eq!(VolumeType::parse("IO1"), Some(VolumeType::Io1));
        assert_eq!(VolumeType::parse("gp2"), Some(VolumeType::Gp2));
        assert_eq!(VolumeType::parse("bogus"), None);
    }

    #[test]
    fn io1_requires_iops() {
        assert!(VolumeType::Io1.requires_iops());
        assert!(!VolumeType::Gp2.requires_iops());
    }

    #[test]
    fn storage_class_params_case_insensitive_keys() {
        let mut raw = BTreeMap::new();
        raw.insert("TYPE".to_string(), "IO1".to_string());
        raw.insert("iopsPerGB".to_string(), "50".to_string());
        raw.insert("Encrypted".to_string(), "true".to_string());
        let parsed = StorageClassParams::parse(&raw).unwrap();
        assert_eq!(parsed.volume_type, VolumeType::Io1);
        assert_eq!(parsed.iops_per_gib, Some(50));
        assert!(parsed.encrypted);
    }

    #[test]
    fn storage_class_params_unknown_key_rejected() {
        let mut raw = BTreeMap::new();
        raw.insert("bogus".to_string(), "x".to_string());
        assert!(matches!(
            StorageClassParams::parse(&raw),
            Err(DriverError::InvalidArgument(_))
        ));
    }

    #[test]
    fn storage_class_params_io1_without_iops_rejected() {
        let mut raw = BTreeMap::new();
        raw.insert("type".to_string(), "io1".to_string());
        assert!(matches!(
            StorageClassParams::parse(&raw),
            Err(DriverError::InvalidArgument(_))
        ));
    }

    #[test]
    fn storage_class_params_deprecated_fstype_alias() {
        let mut raw = BTreeMap::new();
        raw.insert("fstype".to_string(), "xfs".to_string());
        let parsed = StorageClassParams::parse(&raw).unwrap();
        assert_eq!(parsed.fstype, Some("xfs".to_string()));
    }
}
