use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use bsu_common::error::Result;
use bsu_node_block::{Crypto, LuksFormatOptions};

#[derive(Default)]
pub struct MockCrypto {
    luks_devices: Mutex<HashSet<String>>,
    open_mappings: Mutex<HashSet<String>>,
    pub format_calls: AtomicU32,
    pub open_calls: AtomicU32,
    pub close_calls: AtomicU32,
    pub resize_calls: AtomicU32,
}

impl MockCrypto {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_luks(&self, device: &str) {
        self.luks_devices.lock().insert(device.to_string());
    }
}

#[async_trait]
impl Crypto for MockCrypto {
    async fn is_luks(&self, device: &str) -> Result<bool> {
        Ok(self.luks_devices.lock().contains(device))
    }

    async fn luks_format(
        &self,
        device: &str,
        _passphrase: &str,
        _options: &LuksFormatOptions,
    ) -> Result<()> {
        self.format_calls.fetch_add(1, Ordering::SeqCst);
        self.luks_devices.lock().insert(device.to_string());
        Ok(())
    }

    async fn luks_open(
        &self,
        _device: &str,
        mapping_name: &str,
        _passphrase: &str,
        _extra_flags: &[String],
    ) -> Result<()> {
        self.open_calls.fetch_add(1, Ordering::SeqCst);
        self.open_mappings.lock().insert(mapping_name.to_string());
        Ok(())
    }

    async fn luks_close(&self, mapping_name: &str) -> Result<()> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.open_mappings.lock().remove(mapping_name);
        Ok(())
    }

    async fn luks_resize(&self, _mapping_name: &str) -> Result<()> {
        self.resize_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn is_open(&self, volume_id: &str) -> bool {
        self.open_mappings
            .lock()
            .contains(&bsu_node_block::mapping_name(volume_id))
    }
}
