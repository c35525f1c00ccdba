//! Filesystem/mount seam (design spec §4.7).
//!
//! `Mounter` is the trait node-block logic programs against; `OsMounter`
//! backs it by shelling out to host utilities, each invocation bounded by a
//! timeout so a hung `mkfs` or `mount` can't block the node indefinitely
//! (design spec §5).

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use bsu_common::error::{DriverError, Result};
use tokio::process::Command;

/// Filesystem usage as reported by `statfs` (design spec §4.7,
/// `NodeGetVolumeStats`).
#[derive(Debug, Clone, Copy, Default)]
pub struct FsStats {
    pub capacity_bytes: u64,
    pub available_bytes: u64,
    pub used_bytes: u64,
    pub total_inodes: u64,
    pub free_inodes: u64,
    pub used_inodes: u64,
}

/// Host mount/filesystem operations, abstracted so tests can substitute a
/// deterministic double instead of shelling out.
#[async_trait]
pub trait Mounter: Send + Sync {
    /// Resolve the device path CSI handed the node plugin (e.g. the raw
    /// `/dev/xvdb` the driver attached) to a stable host path, trying
    /// `/dev/disk/by-id/...` first and falling back to `lsblk`/`blkid`.
    /// Returns `Ok(None)` when the kernel hasn't enumerated the device yet —
    /// the caller retries with backoff rather than treating it as failure.
    async fn resolve_device(&self, published_device_path: &str) -> Result<Option<String>>;

    async fn is_mounted(&self, target: &str) -> Result<bool>;

    /// Current mount options for `target`, if mounted.
    async fn mount_options(&self, target: &str) -> Result<Option<Vec<String>>>;

    /// The device currently mounted at `target`, if any. Used to recover
    /// the backing device for an already-staged volume when a request
    /// (e.g. `NodeExpandVolume`) doesn't carry it.
    async fn device_for(&self, target: &str) -> Result<Option<String>>;

    async fn mount(
        &self,
        device: &str,
        target: &str,
        fstype: &str,
        options: &[String],
    ) -> Result<()>;

    async fn bind_mount(&self, source: &str, target: &str, options: &[String]) -> Result<()>;

    async fn unmount(&self, target: &str) -> Result<()>;

    /// `None` when the device is unformatted; otherwise the detected
    /// filesystem type.
    async fn needs_format(&self, device: &str) -> Result<Option<String>>;

    async fn mkfs(&self, device: &str, fstype: &str) -> Result<()>;

    async fn resize_fs(&self, device: &str, fstype: &str) -> Result<()>;

    async fn stat(&self, path: &str) -> Result<FsStats>;
}

/// Host-shelling `Mounter`, invoking `mount(8)`, `mkfs.ext2/3/4`,
/// `mkfs.xfs`, `resize2fs`, `xfs_growfs`, `blkid`, `lsblk`.
pub struct OsMounter {
    command_timeout: Duration,
}

impl Default for OsMounter {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

impl OsMounter {
    #[must_use]
    pub fn new(command_timeout: Duration) -> Self {
        Self { command_timeout }
    }

    async fn run(&self, program: &str, args: &[&str]) -> Result<std::process::Output> {
        let fut = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output();
        match tokio::time::timeout(self.command_timeout, fut).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(DriverError::Internal(format!(
                "{program} failed to start: {e}"
            ))),
            Err(_) => Err(DriverError::Unavailable(format!(
                "{program} timed out after {:?}",
                self.command_timeout
            ))),
        }
    }

    async fn run_ok(&self, program: &str, args: &[&str]) -> Result<()> {
        let output = self.run(program, args).await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(DriverError::Internal(format!(
                "{program} {:?} failed: {}",
                args,
                String::from_utf8_lossy(&output.stderr)
            )))
        }
    }

    fn mkfs_program(fstype: &str) -> &'static str {
        match fstype {
            "xfs" => "mkfs.xfs",
            "ext3" => "mkfs.ext3",
            "ext2" => "mkfs.ext2",
            _ => "mkfs.ext4",
        }
    }
}

#[async_trait]
impl Mounter for OsMounter {
    async fn resolve_device(&self, published_device_path: &str) -> Result<Option<String>> {
        let by_id_root = std::path::Path::new("/dev/disk/by-id");
        if by_id_root.exists() {
            if let Ok(entries) = std::fs::read_dir(by_id_root) {
                for entry in entries.flatten() {
                    let link = entry.path();
                    if let Ok(target) = std::fs::canonicalize(&link) {
                        if target == std::path::Path::new(published_device_path) {
                            return Ok(Some(link.to_string_lossy().into_owned()));
                        }
                    }
                }
            }
        }

        if std::path::Path::new(published_device_path).exists() {
            return Ok(Some(published_device_path.to_string()));
        }

        Ok(None)
    }

    async fn is_mounted(&self, target: &str) -> Result<bool> {
        Ok(self.mount_options(target).await?.is_some())
    }

    async fn mount_options(&self, target: &str) -> Result<Option<Vec<String>>> {
        let mounts = tokio::fs::read_to_string("/proc/mounts")
            .await
            .map_err(|e| DriverError::Internal(format!("reading /proc/mounts: {e}")))?;
        for line in mounts.lines() {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() >= 4 && fields[1] == target {
                let options = fields[3].split(',').map(str::to_string).collect();
                return Ok(Some(options));
            }
        }
        Ok(None)
    }

    async fn device_for(&self, target: &str) -> Result<Option<String>> {
        let mounts = tokio::fs::read_to_string("/proc/mounts")
            .await
            .map_err(|e| DriverError::Internal(format!("reading /proc/mounts: {e}")))?;
        for line in mounts.lines() {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() >= 2 && fields[1] == target {
                return Ok(Some(fields[0].to_string()));
            }
        }
        Ok(None)
    }

    async fn mount(
        &self,
        device: &str,
        target: &str,
        fstype: &str,
        options: &[String],
    ) -> Result<()> {
        tokio::fs::create_dir_all(target)
            .await
            .map_err(|e| DriverError::Internal(format!("creating {target}: {e}")))?;

        let mut args = vec!["-t", fstype];
        let opts_joined;
        if !options.is_empty() {
            opts_joined = options.join(",");
            args.push("-o");
            args.push(&opts_joined);
        }
        args.push(device);
        args.push(target);
        self.run_ok("mount", &args).await
    }

    async fn bind_mount(&self, source: &str, target: &str, options: &[String]) -> Result<()> {
        tokio::fs::create_dir_all(target)
            .await
            .map_err(|e| DriverError::Internal(format!("creating {target}: {e}")))?;

        let mut bind_options = vec!["bind".to_string()];
        bind_options.extend_from_slice(options);
        let opts_joined = bind_options.join(",");
        self.run_ok("mount", &["-o", &opts_joined, source, target])
            .await
    }

    async fn unmount(&self, target: &str) -> Result<()> {
        if !self.is_mounted(target).await? {
            return Ok(());
        }
        self.run_ok("umount", &[target]).await
    }

    async fn needs_format(&self, device: &str) -> Result<Option<String>> {
        let output = self
            .run("blkid", &["-o", "value", "-s", "TYPE", device])
            .await?;
        let fstype = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if fstype.is_empty() {
            Ok(None)
        } else {
            Ok(Some(fstype))
        }
    }

    async fn mkfs(&self, device: &str, fstype: &str) -> Result<()> {
        self.run_ok(Self::mkfs_program(fstype), &[device]).await
    }

    async fn resize_fs(&self, device: &str, fstype: &str) -> Result<()> {
        match fstype {
            "xfs" => self.run_ok("xfs_growfs", &[device]).await,
            _ => self.run_ok("resize2fs", &[device]).await,
        }
    }

    async fn stat(&self, path: &str) -> Result<FsStats> {
        let statvfs = nix::sys::statvfs::statvfs(path)
            .map_err(|e| DriverError::Internal(format!("statfs {path}: {e}")))?;
        let block_size = statvfs.fragment_size();
        Ok(FsStats {
            capacity_bytes: statvfs.blocks() * block_size,
            available_bytes: statvfs.blocks_available() * block_size,
            used_bytes: (statvfs.blocks() - statvfs.blocks_free()) * block_size,
            total_inodes: statvfs.files(),
            free_inodes: statvfs.files_free(),
            used_inodes: statvfs.files() - statvfs.files_free(),
        })
    }
}
