//! Node staging pipeline (design spec §4.7).

use std::sync::Arc;

use bsu_backoff::{BackoffError, BackoffPolicy, Step};
use bsu_common::error::{DriverError, Result};
use tokio_util::sync::CancellationToken;

use crate::crypto::{mapping_name, Crypto};
use crate::mounter::{FsStats, Mounter};
use crate::params::{ExpandVolumeParams, PublishVolumeParams, StageVolumeParams, UnstageVolumeParams};

/// Ties the `Mounter`/`Crypto` seams together into the idempotent
/// stage/unstage/publish/unpublish/expand pipeline.
pub struct NodeBlockLayer {
    mounter: Arc<dyn Mounter>,
    crypto: Arc<dyn Crypto>,
    backoff: BackoffPolicy,
    default_fstype: String,
}

impl NodeBlockLayer {
    #[must_use]
    pub fn new(
        mounter: Arc<dyn Mounter>,
        crypto: Arc<dyn Crypto>,
        backoff: BackoffPolicy,
        default_fstype: impl Into<String>,
    ) -> Self {
        Self {
            mounter,
            crypto,
            backoff,
            default_fstype: default_fstype.into(),
        }
    }

    async fn resolve_device(
        &self,
        published_device_path: &str,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let result = self
            .backoff
            .run(cancel, || async {
                match self.mounter.resolve_device(published_device_path).await {
                    Ok(Some(path)) => Step::Done(path),
                    Ok(None) => Step::Retry,
                    Err(e) => Step::Fail(e),
                }
            })
            .await;
        map_backoff(result, || format!("resolve-device {published_device_path}"))
    }

    /// Open (formatting first if needed) the LUKS mapping for `volume_id`
    /// over `device`, returning the mapping device path to mount.
    async fn ensure_luks_open(
        &self,
        volume_id: &str,
        device: &str,
        passphrase: &str,
        options: &crate::crypto::LuksFormatOptions,
        extra_open_flags: &[String],
    ) -> Result<String> {
        let mapping_path = self.crypto.mapping_path(volume_id);
        if self.crypto.is_open(volume_id) {
            return Ok(mapping_path);
        }

        if !self.crypto.is_luks(device).await? {
            self.crypto.luks_format(device, passphrase, options).await?;
        }
        self.crypto
            .luks_open(device, &mapping_name(volume_id), passphrase, extra_open_flags)
            .await?;
        Ok(mapping_path)
    }

    pub async fn stage_volume(
        &self,
        params: StageVolumeParams,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let device = self
            .resolve_device(&params.published_device_path, cancel)
            .await?;

        let device = if params.encrypted {
            let passphrase = params.passphrase.as_deref().ok_or_else(|| {
                DriverError::InvalidArgument(
                    "encrypted volume requires a node-stage secret passphrase".into(),
                )
            })?;
            self.ensure_luks_open(
                &params.volume_id,
                &device,
                passphrase,
                &params.luks_format_options,
                &params.luks_open_flags,
            )
            .await?
        } else {
            device
        };

        if let Some(existing) = self.mounter.mount_options(&params.staging_path).await? {
            return if options_satisfied(&existing, &params.mount_options) {
                Ok(())
            } else {
                Err(DriverError::FailedPrecondition(format!(
                    "{} already staged with different mount options",
                    params.staging_path
                )))
            };
        }

        let fstype = params
            .fstype
            .clone()
            .unwrap_or_else(|| self.default_fstype.clone());

        if self.mounter.needs_format(&device).await?.is_none() {
            self.mounter.mkfs(&device, &fstype).await?;
        }

        self.mounter
            .mount(&device, &params.staging_path, &fstype, &params.mount_options)
            .await
    }

    pub async fn unstage_volume(&self, params: UnstageVolumeParams) -> Result<()> {
        self.mounter.unmount(&params.staging_path).await?;

        if params.encrypted && self.crypto.is_open(&params.volume_id) {
            self.crypto.luks_close(&mapping_name(&params.volume_id)).await?;
        }
        Ok(())
    }

    /// Bind-mounts the staging path at the publish path (the block-mode /
    /// filesystem-mode distinction lives in what was staged, not in how the
    /// publish bind mount itself is performed).
    pub async fn publish_volume(&self, params: PublishVolumeParams) -> Result<()> {
        if self.mounter.is_mounted(&params.publish_path).await? {
            return Ok(());
        }

        let mut options = params.mount_options.clone();
        if params.read_only {
            options.push("ro".to_string());
        }
        self.mounter
            .bind_mount(&params.staging_path, &params.publish_path, &options)
            .await
    }

    pub async fn unpublish_volume(&self, publish_path: &str) -> Result<()> {
        self.mounter.unmount(publish_path).await
    }

    pub async fn expand_volume(
        &self,
        params: ExpandVolumeParams,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let device = self
            .resolve_device(&params.published_device_path, cancel)
            .await?;

        let device = if params.encrypted {
            self.crypto.luks_resize(&mapping_name(&params.volume_id)).await?;
            self.crypto.mapping_path(&params.volume_id)
        } else {
            device
        };

        let fstype = match params.fstype {
            Some(f) => f,
            None => self
                .mounter
                .needs_format(&device)
                .await?
                .unwrap_or_else(|| self.default_fstype.clone()),
        };

        self.mounter.resize_fs(&device, &fstype).await
    }

    pub async fn volume_stats(&self, path: &str) -> Result<FsStats> {
        self.mounter.stat(path).await
    }

    /// The device currently backing an already-staged `staging_path`, used
    /// by `NodeExpandVolume` (which carries no device path of its own) to
    /// recover what `NodeStageVolume` resolved.
    pub async fn staged_device(&self, staging_path: &str) -> Result<Option<String>> {
        self.mounter.device_for(staging_path).await
    }

    /// Whether `volume_id`'s LUKS mapping is currently open, used by
    /// `NodeExpandVolume`/`NodeUnstageVolume` (neither carries an
    /// `encrypted` flag of its own).
    #[must_use]
    pub fn is_encrypted(&self, volume_id: &str) -> bool {
        self.crypto.is_open(volume_id)
    }
}

/// A remount is a no-op only when every option the caller is asking for is
/// already in effect; this is a subset check rather than set equality
/// because `mount(8)` fills in defaults the caller never asked for.
fn options_satisfied(existing: &[String], requested: &[String]) -> bool {
    requested.iter().all(|opt| existing.contains(opt))
}

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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_satisfied_is_a_subset_check() {
        let existing = vec!["rw".to_string(), "relatime".to_string(), "noatime".to_string()];
        assert!(options_satisfied(&existing, &["noatime".to_string()]));
        assert!(!options_satisfied(&existing, &["ro".to_string()]));
    }
}
