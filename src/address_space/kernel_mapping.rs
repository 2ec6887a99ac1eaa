use super::memory_range::MemoryRange;
use crate::remote_ptr::{RemotePtr, Void};
use libc::{dev_t, ino_t};
use nix::sys::mman::{MapFlags, ProtFlags};
use nix::sys::stat::{major, minor};
use std::fmt::{Display, Formatter, Result};
use std::ops::Deref;

pub const NO_DEVICE: dev_t = 0;
pub const NO_INODE: ino_t = 0;

/// One segment of a tracee's address space, as the kernel describes it in
/// /proc/<tid>/maps.
#[derive(Clone, Debug)]
pub struct KernelMapping {
    mr: MemoryRange,
    /// The kernel's name for the mapping. Empty for anonymous mappings.
    fsname_: String,
    device_: dev_t,
    inode_: ino_t,
    prot_: ProtFlags,
    flags_: MapFlags,
    offset: u64,
}

impl KernelMapping {
    pub fn new_with_opts(
        start: RemotePtr<Void>,
        end: RemotePtr<Void>,
        fsname: &str,
        device: dev_t,
        inode: ino_t,
        prot: ProtFlags,
        flags: MapFlags,
        offset: u64,
    ) -> KernelMapping {
        KernelMapping {
            mr: MemoryRange::from_range(start, end),
            fsname_: fsname.into(),
            device_: device,
            inode_: inode,
            prot_: prot,
            flags_: flags,
            offset,
        }
    }

    pub fn fsname(&self) -> &str {
        &self.fsname_
    }
    pub fn device(&self) -> dev_t {
        self.device_
    }
    pub fn inode(&self) -> ino_t {
        self.inode_
    }
    pub fn prot(&self) -> ProtFlags {
        self.prot_
    }
    pub fn flags(&self) -> MapFlags {
        self.flags_
    }
    pub fn file_offset_bytes(&self) -> u64 {
        self.offset
    }

    /// Return true if this mapping is/was backed by an external device,
    /// as opposed to a transient RAM mapping.
    pub fn is_real_device(&self) -> bool {
        self.device() > NO_DEVICE
    }
    pub fn is_stack(&self) -> bool {
        self.fsname_.starts_with("[stack")
    }

    fn prot_string(&self) -> String {
        let mut s = String::with_capacity(4);
        s.push(if self.prot_.contains(ProtFlags::PROT_READ) {
            'r'
        } else {
            '-'
        });
        s.push(if self.prot_.contains(ProtFlags::PROT_WRITE) {
            'w'
        } else {
            '-'
        });
        s.push(if self.prot_.contains(ProtFlags::PROT_EXEC) {
            'x'
        } else {
            '-'
        });
        s.push(if self.flags_.contains(MapFlags::MAP_SHARED) {
            's'
        } else {
            'p'
        });
        s
    }
}

impl Deref for KernelMapping {
    type Target = MemoryRange;

    fn deref(&self) -> &Self::Target {
        &self.mr
    }
}

/// Renders in the format of a /proc/<tid>/maps line.
impl Display for KernelMapping {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        write!(
            f,
            "{:x}-{:x} {} {:08x} {:02x}:{:02x} {} {}",
            self.start().as_usize(),
            self.end().as_usize(),
            self.prot_string(),
            self.offset,
            major(self.device()),
            minor(self.device()),
            self.inode(),
            self.fsname_
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_like_proc_maps() {
        let km = KernelMapping::new_with_opts(
            0x7f0000000000usize.into(),
            0x7f0000002000usize.into(),
            "/usr/lib/libc.so.6",
            nix::sys::stat::makedev(8, 1),
            123456,
            ProtFlags::PROT_READ | ProtFlags::PROT_EXEC,
            MapFlags::MAP_PRIVATE,
            0x1000,
        );
        assert_eq!(
            km.to_string(),
            "7f0000000000-7f0000002000 r-xp 00001000 08:01 123456 /usr/lib/libc.so.6"
        );
        assert_eq!(km.size(), 0x2000);
        assert!(km.is_real_device());
    }
}
