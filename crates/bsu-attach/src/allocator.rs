//! Device-name allocator (design spec §4.3).
//!
//! Given the suffixes already in use on a VM, returns the first free one in
//! deterministic order: `b`, `c`, ..., `z`, `aa`, `ab`, ..., `an` (39 slots).
//! The 40th slot, `ao`, is intentionally never generated (design spec §9:
//! "the cloud allows at most ~40 block devices per VM in practice").

use std::collections::HashSet;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeviceError {
    #[error("no device names available")]
    NoNamesAvailable,
}

/// The full ordered pool of 39 device-name suffixes.
fn suffix_pool() -> impl Iterator<Item = String> {
    let singles = (b'b'..=b'z').map(|c| (c as char).to_string());
    let doubles = (b'a'..=b'n').map(|c| format!("a{}", c as char));
    singles.chain(doubles)
}

/// Return the first suffix in `b..z,aa..an` that is not present in `taken`.
pub fn first_free(taken: &HashSet<String>) -> Result<String, DeviceError> {
    suffix_pool()
        .find(|candidate| !taken.contains(candidate))
        .ok_or(DeviceError::NoNamesAvailable)
}

/// Render a device-name suffix as a full device path, e.g. `"b" ->
/// "/dev/xvdb"`.
#[must_use]
pub fn device_path(suffix: &str) -> String {
    format!("/dev/xvd{suffix}")
}
