//! Process-wide registry of tracee scratch regions.
//!
//! Scratch regions are deliberately volatile and excluded from checksum
//! and dump passes. Regions are registered once per task at buffer-init
//! time and never unregistered; task teardown does not shrink the table.

use crate::address_space::memory_range::MemoryRange;
use crate::remote_ptr::{RemotePtr, Void};
use std::sync::RwLock;

/// Upper bound on registered regions. One region per task; exceeding
/// this means task creation has run away.
pub const MAX_TRACKED_TASKS: usize = 1000;

lazy_static! {
    static ref SCRATCH_REGIONS: RwLock<Vec<MemoryRange>> = RwLock::new(Vec::new());
}

/// Record `[addr, addr + num_bytes)` as a scratch region.
pub fn register_scratch_region(addr: RemotePtr<Void>, num_bytes: usize) {
    let mut regions = SCRATCH_REGIONS.write().unwrap();
    if regions.len() >= MAX_TRACKED_TASKS {
        fatal!(
            "Tracking more than {} tasks' scratch regions",
            MAX_TRACKED_TASKS
        );
    }
    regions.push(MemoryRange::new_range(addr, num_bytes));
}

/// Is `addr` the start of some registered scratch region?
pub fn is_start_of_scratch_region(addr: RemotePtr<Void>) -> bool {
    let regions = SCRATCH_REGIONS.read().unwrap();
    regions.iter().any(|r| r.start() == addr)
}

#[cfg(test)]
mod tests {
    use super::*;

    // The registry is process-global and append-only, so a single test
    // exercises it to avoid cross-test interference.
    #[test]
    fn append_and_membership() {
        register_scratch_region(0x70000000.into(), 0x8000);
        register_scratch_region(0x70010000.into(), 0x8000);
        assert!(is_start_of_scratch_region(0x70000000.into()));
        assert!(is_start_of_scratch_region(0x70010000.into()));
        // Interior and unrelated addresses are not starts.
        assert!(!is_start_of_scratch_region(0x70000100.into()));
        assert!(!is_start_of_scratch_region(0x60000000.into()));
    }
}
