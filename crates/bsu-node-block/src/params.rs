//! Request parameters for the node staging pipeline (design spec §4.7).

use crate::crypto::LuksFormatOptions;

#[derive(Debug, Clone)]
pub struct StageVolumeParams {
    pub volume_id: String,
    /// The device path as attached by the controller (e.g. `/dev/xvdb`).
    pub published_device_path: String,
    pub staging_path: String,
    pub fstype: Option<String>,
    pub mount_options: Vec<String>,
    pub encrypted: bool,
    /// Passphrase from the node-stage secret; required when `encrypted`.
    pub passphrase: Option<String>,
    pub luks_format_options: LuksFormatOptions,
    /// Extra arguments forwarded verbatim to `cryptsetup luksOpen`, from the
    /// node service's repeatable `--luks-open-flags` CLI flag.
    pub luks_open_flags: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct UnstageVolumeParams {
    pub volume_id: String,
    pub staging_path: String,
    pub encrypted: bool,
}

#[derive(Debug, Clone)]
pub struct PublishVolumeParams {
    pub staging_path: String,
    pub publish_path: String,
    pub read_only: bool,
    /// Raw block-device publish (no filesystem) instead of a bind mount.
    pub block_mode: bool,
    pub mount_options: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ExpandVolumeParams {
    pub volume_id: String,
    pub staging_path: String,
    pub published_device_path: String,
    pub encrypted: bool,
    pub fstype: Option<String>,
}
