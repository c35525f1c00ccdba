use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use bsu_common::error::Result;
use bsu_node_block::{FsStats, Mounter};

#[derive(Default)]
pub struct MockMounter {
    /// Number of `resolve_device` calls before it starts returning `Some`.
    pub resolve_after: u32,
    pub resolve_calls: AtomicU32,
    /// target -> (device, mount options) currently in effect
    mounts: Mutex<HashMap<String, (String, Vec<String>)>>,
    /// devices already carrying a filesystem, and which one
    formatted: Mutex<HashMap<String, String>>,
    pub mkfs_calls: AtomicU32,
    pub mount_calls: AtomicU32,
    pub resize_calls: AtomicU32,
}

impl MockMounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_resolve_after(resolve_after: u32) -> Self {
        Self {
            resolve_after,
            ..Self::default()
        }
    }

    pub fn mark_formatted(&self, device: &str, fstype: &str) {
        self.formatted
            .lock()
            .insert(device.to_string(), fstype.to_string());
    }

    pub fn is_mounted_at(&self, target: &str) -> bool {
        self.mounts.lock().contains_key(target)
    }
}

#[async_trait]
impl Mounter for MockMounter {
    async fn resolve_device(&self, published_device_path: &str) -> Result<Option<String>> {
        let n = self.resolve_calls.fetch_add(1, Ordering::SeqCst);
        if n >= self.resolve_after {
            Ok(Some(published_device_path.to_string()))
        } else {
            Ok(None)
        }
    }

    async fn is_mounted(&self, target: &str) -> Result<bool> {
        Ok(self.mounts.lock().contains_key(target))
    }

    async fn mount_options(&self, target: &str) -> Result<Option<Vec<String>>> {
        Ok(self.mounts.lock().get(target).map(|(_, opts)| opts.clone()))
    }

    async fn device_for(&self, target: &str) -> Result<Option<String>> {
        Ok(self.mounts.lock().get(target).map(|(device, _)| device.clone()))
    }

    async fn mount(
        &self,
        device: &str,
        target: &str,
        _fstype: &str,
        options: &[String],
    ) -> Result<()> {
        self.mount_calls.fetch_add(1, Ordering::SeqCst);
        self.mounts
            .lock()
            .insert(target.to_string(), (device.to_string(), options.to_vec()));
        Ok(())
    }

    async fn bind_mount(&self, source: &str, target: &str, options: &[String]) -> Result<()> {
        self.mount_calls.fetch_add(1, Ordering::SeqCst);
        self.mounts
            .lock()
            .insert(target.to_string(), (source.to_string(), options.to_vec()));
        Ok(())
    }

    async fn unmount(&self, target: &str) -> Result<()> {
        self.mounts.lock().remove(target);
        Ok(())
    }

    async fn needs_format(&self, device: &str) -> Result<Option<String>> {
        Ok(self.formatted.lock().get(device).cloned())
    }

    async fn mkfs(&self, device: &str, fstype: &str) -> Result<()> {
        self.mkfs_calls.fetch_add(1, Ordering::SeqCst);
        self.formatted
            .lock()
            .insert(device.to_string(), fstype.to_string());
        Ok(())
    }

    async fn resize_fs(&self, _device: &str, _fstype: &str) -> Result<()> {
        self.resize_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stat(&self, _path: &str) -> Result<FsStats> {
        Ok(FsStats {
            capacity_bytes: 1024,
            available_bytes: 512,
            used_bytes: 512,
            total_inodes: 100,
            free_inodes: 90,
            used_inodes: 10,
        })
    }
}
