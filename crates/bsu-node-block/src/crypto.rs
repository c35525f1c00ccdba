//! LUKS encryption seam (design spec §4.7).

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use bsu_common::error::{DriverError, Result};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Cipher/hash/key-size knobs accepted from storage-class parameters
/// (design spec §6).
#[derive(Debug, Clone, Default)]
pub struct LuksFormatOptions {
    pub cipher: Option<String>,
    pub hash: Option<String>,
    pub key_size: Option<String>,
}

/// LUKS operations, abstracted so tests can substitute a deterministic
/// double instead of shelling out to `cryptsetup`.
#[async_trait]
pub trait Crypto: Send + Sync {
    async fn is_luks(&self, device: &str) -> Result<bool>;

    async fn luks_format(
        &self,
        device: &str,
        passphrase: &str,
        options: &LuksFormatOptions,
    ) -> Result<()>;

    async fn luks_open(
        &self,
        device: &str,
        mapping_name: &str,
        passphrase: &str,
        extra_flags: &[String],
    ) -> Result<()>;

    async fn luks_close(&self, mapping_name: &str) -> Result<()>;

    async fn luks_resize(&self, mapping_name: &str) -> Result<()>;

    /// Mapping name is derived deterministically from the volume id
    /// (design spec §4.7).
    fn mapping_path(&self, volume_id: &str) -> String {
        format!("/dev/mapper/{}", mapping_name(volume_id))
    }

    /// Whether the mapping for `volume_id` is currently open. The default
    /// implementation checks for the `/dev/mapper/...` device file; test
    /// doubles override this instead of touching the real filesystem.
    fn is_open(&self, volume_id: &str) -> bool {
        std::path::Path::new(&self.mapping_path(volume_id)).exists()
    }
}

/// The LUKS mapping name itself, without the `/dev/mapper/` prefix.
#[must_use]
pub fn mapping_name(volume_id: &str) -> String {
    format!("bsu-{volume_id}")
}

/// Host-shelling `Crypto`, backed by `cryptsetup`. The passphrase is always
/// piped over stdin, never passed as an argument.
pub struct OsCrypto {
    command_timeout: Duration,
}

impl Default for OsCrypto {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

impl OsCrypto {
    #[must_use]
    pub fn new(command_timeout: Duration) -> Self {
        Self { command_timeout }
    }

    async fn run_with_passphrase(&self, args: &[&str], passphrase: &str) -> Result<()> {
        let mut child = Command::new("cryptsetup")
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| DriverError::Internal(format!("cryptsetup failed to start: {e}")))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| DriverError::Internal("cryptsetup stdin unavailable".into()))?;
        let passphrase = passphrase.to_string();
        let write = async move {
            stdin.write_all(passphrase.as_bytes()).await?;
            stdin.write_all(b"\n").await
        };

        match tokio::time::timeout(self.command_timeout, async {
            write.await.ok();
            child.wait_with_output().await
        })
        .await
        {
            Ok(Ok(output)) if output.status.success() => Ok(()),
            Ok(Ok(output)) => Err(DriverError::Internal(format!(
                "cryptsetup {:?} failed: {}",
                args,
                String::from_utf8_lossy(&output.stderr)
            ))),
            Ok(Err(e)) => Err(DriverError::Internal(format!("cryptsetup wait failed: {e}"))),
            Err(_) => Err(DriverError::Unavailable(format!(
                "cryptsetup timed out after {:?}",
                self.command_timeout
            ))),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<std::process::Output> {
        let fut = Command::new("cryptsetup")
            .args(args)
            .stdin(Stdio::null())
            .output();
        match tokio::time::timeout(self.command_timeout, fut).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(DriverError::Internal(format!(
                "cryptsetup failed to start: {e}"
            ))),
            Err(_) => Err(DriverError::Unavailable(format!(
                "cryptsetup timed out after {:?}",
                self.command_timeout
            ))),
        }
    }
}

#[async_trait]
impl Crypto for OsCrypto {
    async fn is_luks(&self, device: &str) -> Result<bool> {
        let output = self.run(&["isLuks", device]).await?;
        Ok(output.status.success())
    }

    async fn luks_format(
        &self,
        device: &str,
        passphrase: &str,
        options: &LuksFormatOptions,
    ) -> Result<()> {
        let mut args = vec!["luksFormat", "--batch-mode"];
        if let Some(cipher) = &options.cipher {
            args.push("--cipher");
            args.push(cipher);
        }
        if let Some(hash) = &options.hash {
            args.push("--hash");
            args.push(hash);
        }
        if let Some(key_size) = &options.key_size {
            args.push("--key-size");
            args.push(key_size);
        }
        args.push(device);
        self.run_with_passphrase(&args, passphrase).await
    }

    async fn luks_open(
        &self,
        device: &str,
        mapping_name: &str,
        passphrase: &str,
        extra_flags: &[String],
    ) -> Result<()> {
        let mut args = vec!["luksOpen".to_string(), device.to_string(), mapping_name.to_string()];
        args.extend(extra_flags.iter().cloned());
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run_with_passphrase(&args, passphrase).await
    }

    async fn luks_close(&self, mapping_name: &str) -> Result<()> {
        let output = self.run(&["luksClose", mapping_name]).await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(DriverError::Internal(format!(
                "cryptsetup luksClose {mapping_name} failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )))
        }
    }

    async fn luks_resize(&self, mapping_name: &str) -> Result<()> {
        let output = self.run(&["resize", mapping_name]).await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(DriverError::Internal(format!(
                "cryptsetup resize {mapping_name} failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )))
        }
    }
}
