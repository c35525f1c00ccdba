//! Node volume-attach capacity (design spec §4.7, "Max attachable volumes
//! per node").

use std::path::Path;

/// Mirrors `bsu-attach::allocator`'s 39-slot device-suffix pool.
const MAX_DEVICE_SLOTS: u32 = 39;

/// Count devices already occupying a driver-managed slot, so they aren't
/// double-counted against the pool. The root disk (`xvda`) is excluded —
/// it never goes through the allocator.
fn count_in_use_slots() -> u32 {
    let Ok(entries) = std::fs::read_dir(Path::new("/sys/block")) else {
        return 0;
    };
    entries
        .flatten()
        .filter(|entry| {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            name.starts_with("xvd") && name != "xvda"
        })
        .count() as u32
}

/// Inspect the node's existing block-device inventory and return the
/// number of additional volumes it can accept, capped at the device
/// allocator's 39-slot pool. `override_max` lets an operator pin a lower
/// ceiling via `MAX_BSU_VOLUMES`; it can never raise the ceiling above the
/// pool size.
#[must_use]
pub fn max_volumes_per_node(override_max: Option<u32>) -> u32 {
    let available = MAX_DEVICE_SLOTS.saturating_sub(count_in_use_slots());
    match override_max {
        Some(n) => n.min(available),
        None => available,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn override_never_exceeds_device_pool() {
        assert!(max_volumes_per_node(Some(1000)) <= MAX_DEVICE_SLOTS);
    }

    #[test]
    fn override_of_zero_yields_zero() {
        assert_eq!(max_volumes_per_node(Some(0)), 0);
    }
}
