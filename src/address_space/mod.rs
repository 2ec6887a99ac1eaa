//! Enumeration of a tracee's memory map, via /proc/<tid>/maps.

pub mod kernel_map_iterator;
pub mod kernel_mapping;
pub mod memory_range;

use crate::remote_ptr::{RemotePtr, Void};
use crate::task::Task;
use kernel_map_iterator::KernelMapIterator;
use kernel_mapping::KernelMapping;

/// Returned by an iteration callback to continue or cut short the walk.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum IterationAction {
    Continue,
    Stop,
}

/// Whether `iterate_memory_map` materializes each segment's bytes before
/// invoking the callback.
pub enum ReadPolicy<'a> {
    /// Never read segment contents; `mem` is always empty.
    Never,
    /// Read the contents of every segment.
    Always,
    /// Read contents only for segments the predicate accepts.
    Predicate(&'a dyn Fn(&KernelMapping) -> bool),
}

impl<'a> ReadPolicy<'a> {
    fn wants_contents(&self, km: &KernelMapping) -> bool {
        match self {
            ReadPolicy::Never => false,
            ReadPolicy::Always => true,
            ReadPolicy::Predicate(p) => p(km),
        }
    }
}

/// One enumerated segment as handed to the iteration callback.
pub struct MapIteratorData {
    pub map: KernelMapping,
    /// The raw /proc maps line `map` was parsed from, without the
    /// trailing newline.
    pub raw_map_line: String,
    /// Segment contents per the read policy. If the tracee's memory
    /// could only be partially read, this holds the prefix that was
    /// readable; iteration still continues.
    pub mem: Vec<u8>,
}

/// Walk `t`'s memory map in address order, invoking `f` once per segment
/// until it returns Stop or the map is exhausted.
pub fn iterate_memory_map<F>(t: &Task, mut f: F, read_policy: ReadPolicy)
where
    F: FnMut(&MapIteratorData) -> IterationAction,
{
    for entry in KernelMapIterator::new(t) {
        let mem = if read_policy.wants_contents(&entry.map) {
            t.read_mem_partial(entry.map.start(), entry.map.size())
        } else {
            Vec::new()
        };
        let data = MapIteratorData {
            map: entry.map,
            raw_map_line: entry.raw_line,
            mem,
        };
        if f(&data) == IterationAction::Stop {
            return;
        }
    }
}

/// The first of `maps` whose half-open range contains `addr`.
fn first_containing<I>(maps: I, addr: RemotePtr<Void>) -> Option<KernelMapping>
where
    I: IntoIterator<Item = KernelMapping>,
{
    maps.into_iter().find(|km| km.contains_ptr(addr))
}

/// Fresh walk of the live mapping table; no caching.
pub fn find_segment_containing(t: &Task, addr: RemotePtr<Void>) -> Option<KernelMapping> {
    first_containing(
        KernelMapIterator::new(t).map(|entry| entry.map),
        addr,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::mman::{MapFlags, ProtFlags};

    fn km(start: usize, end: usize) -> KernelMapping {
        KernelMapping::new_with_opts(
            start.into(),
            end.into(),
            "",
            0,
            0,
            ProtFlags::PROT_READ,
            MapFlags::MAP_PRIVATE,
            0,
        )
    }

    #[test]
    fn locator_hit_and_miss() {
        let maps = vec![km(0x1000, 0x2000), km(0x4000, 0x6000)];
        let hit = first_containing(maps.clone(), 0x4fff.into()).unwrap();
        assert_eq!(hit.start().as_usize(), 0x4000);
        // End addresses are exclusive; gaps and out-of-range miss.
        assert!(first_containing(maps.clone(), 0x2000.into()).is_none());
        assert!(first_containing(maps.clone(), 0x3000.into()).is_none());
        assert!(first_containing(maps, 0x6000.into()).is_none());
    }

    #[test]
    fn locator_prefers_first_match() {
        let maps = vec![km(0x1000, 0x3000), km(0x2000, 0x4000)];
        let hit = first_containing(maps, 0x2800.into()).unwrap();
        assert_eq!(hit.start().as_usize(), 0x1000);
    }
}
