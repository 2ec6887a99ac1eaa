use crate::config::EngineConfig;
use crate::log::{LogDebug, LogWarn};
use crate::remote_ptr::{RemotePtr, Void};
use crate::scoped_fd::ScopedFd;
use nix::sys::mman::{MapFlags, ProtFlags};
use nix::sys::stat::stat;
use nix::sys::statfs::{statfs, TMPFS_MAGIC};
use nix::unistd::{access, ftruncate, sysconf, AccessFlags, SysconfVar};
use std::path::Path;

lazy_static! {
    static ref PAGE_SIZE: usize = init_page_size();
}

fn init_page_size() -> usize {
    match sysconf(SysconfVar::PAGE_SIZE) {
        Ok(Some(sz)) => sz as usize,
        _ => fatal!("Could not obtain page size"),
    }
}

pub fn page_size() -> usize {
    *PAGE_SIZE
}

pub fn ceil_page_size(sz: usize) -> usize {
    (sz + page_size() - 1) & !(page_size() - 1)
}

pub fn floor_page_size(sz: usize) -> usize {
    sz & !(page_size() - 1)
}

pub fn floor_page_size_remote(addr: RemotePtr<Void>) -> RemotePtr<Void> {
    RemotePtr::new_from_val(floor_page_size(addr.as_usize()))
}

/// View any sized value as its raw bytes. The tracee I/O paths use this
/// to ship `#[repr(C)]` ABI structs over /proc/<tid>/mem.
pub fn u8_slice<T>(v: &T) -> &[u8] {
    unsafe { std::slice::from_raw_parts(v as *const T as *const u8, std::mem::size_of::<T>()) }
}

pub fn u8_slice_mut<T>(v: &mut T) -> &mut [u8] {
    unsafe { std::slice::from_raw_parts_mut(v as *mut T as *mut u8, std::mem::size_of::<T>()) }
}

/// Everything the mutability classifier needs to know about a mapped
/// file, gathered in one place so the decision itself is a pure function.
#[derive(Copy, Clone, Debug)]
pub struct FileMetadata {
    /// Is the file on a tmpfs filesystem?
    pub on_tmpfs: bool,
    /// Can this process write the file? This uses our euid as an
    /// approximation of whether the tracee can write it. If the tracee
    /// is messing around with set*[gu]id(), the real answer may differ.
    pub host_can_write: bool,
    pub uid: libc::uid_t,
    pub mode: libc::mode_t,
}

impl FileMetadata {
    /// Probe `path`. None if the file can't be stat()ed, in which case
    /// the caller can't classify the mapping and must treat it as
    /// mutable.
    pub fn for_path<P: AsRef<Path>>(path: P) -> Option<FileMetadata> {
        let path = path.as_ref();
        let st = stat(path).ok()?;
        let on_tmpfs = match statfs(path) {
            Ok(sfs) => sfs.filesystem_type() == TMPFS_MAGIC,
            Err(_) => false,
        };
        let host_can_write = access(path, AccessFlags::W_OK).is_ok();
        Some(FileMetadata {
            on_tmpfs,
            host_can_write,
            uid: st.st_uid,
            mode: st.st_mode as libc::mode_t,
        })
    }
}

/// Decide whether the bytes of a file-backed mapping must be saved at
/// mmap time because the underlying file may change out from under a
/// future replay. Returns true if the region should be copied, false if
/// replay can safely re-map the original file.
///
/// The rules are ordered; the first that applies wins.
pub fn should_copy_mmap_region(
    fsname: &str,
    meta: &FileMetadata,
    prot: ProtFlags,
    flags: MapFlags,
    warn_shared_writeable: bool,
) -> bool {
    let private_mapping = flags.contains(MapFlags::MAP_PRIVATE);

    if meta.on_tmpfs {
        // tmpfs files are ephemeral almost by definition.
        log!(LogDebug, "  copying {} on tmpfs", fsname);
        return true;
    }
    if private_mapping && prot.contains(ProtFlags::PROT_EXEC) {
        // We currently don't record the images that we exec(). Since
        // we're being optimistic there (*cough* *cough*), we're doing no
        // worse (in theory) by being optimistic about the shared
        // libraries too, most of which are system libraries.
        log!(LogDebug, "  (no copy for +x private mapping {})", fsname);
        return false;
    }
    if private_mapping && (0o111 & meta.mode != 0) {
        // A private mapping of an executable file usually indicates
        // mapping data sections of object files. Since we're already
        // assuming those change very infrequently, we can avoid copying
        // the data sections too.
        log!(
            LogDebug,
            "  (no copy for private mapping of +x {})",
            fsname
        );
        return false;
    }

    if !meta.host_can_write && 0 == meta.uid {
        // Mapping a file owned by root: we don't care if this was a
        // PRIVATE or SHARED mapping, because unless the program is
        // disastrously buggy or unlucky, the mapping is effectively
        // PRIVATE. Bad luck can come from this program running during a
        // system update, or a user being added, which is probably less
        // frequent than even system updates.
        log!(LogDebug, "  (no copy for root-owned {})", fsname);
        return false;
    }
    if private_mapping {
        // Some programs (at least Firefox) have been observed to use
        // cache files that are expected to be consistent and unchanged
        // during the bulk of execution, but may be destroyed or mutated
        // at shutdown in preparation for the next session. We don't
        // otherwise know what to do with private mappings, so err on the
        // safe side.
        log!(
            LogDebug,
            "  copying private mapping of non-system -x {}",
            fsname
        );
        return true;
    }
    if 0o222 & meta.mode == 0 {
        // We couldn't write the file because it's read only. But it's
        // not a root-owned file (therefore not a system file), so it's
        // likely that it could be temporary. Copy it.
        log!(LogDebug, "  copying read-only, non-system file {}", fsname);
        return true;
    }
    if !meta.host_can_write {
        // mmap'ing another user's (non-system) files? Highly irregular.
        fatal!(
            "Unhandled mmap {} (prot:{:?}{}); uid:{} mode:{:o}",
            fsname,
            prot,
            if flags.contains(MapFlags::MAP_SHARED) {
                ";SHARED"
            } else {
                ""
            },
            meta.uid,
            meta.mode
        );
    }
    // Shared mapping that we can write. Should assume that the mapping
    // is likely to change.
    log!(LogDebug, "  copying writeable SHARED mapping {}", fsname);
    if warn_shared_writeable {
        log!(
            LogWarn,
            "{} is SHARED|WRITEABLE; that's not handled correctly yet. \
             Optimistically hoping it's not written by programs outside \
             the tracee tree.",
            fsname
        );
    }
    true
}

/// Recording-time entry point for the classifier. Same decision as
/// `should_copy_mmap_region`, with the shared-writable warning gated on
/// the engine config; the checksum paths call the classifier directly
/// and never warn.
pub fn should_copy_mmap_region_for_recording(
    fsname: &str,
    meta: &FileMetadata,
    prot: ProtFlags,
    flags: MapFlags,
    config: &EngineConfig,
) -> bool {
    should_copy_mmap_region(
        fsname,
        meta,
        prot,
        flags,
        !config.suppress_environment_warnings(),
    )
}

/// Grow a freshly created shared-memory file to `num_bytes`.
pub fn resize_shmem_segment(fd: &ScopedFd, num_bytes: usize) {
    if let Err(e) = ftruncate(fd.as_raw(), num_bytes as libc::off_t) {
        fatal!("Failed to resize shmem to {} bytes: {}", num_bytes, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(on_tmpfs: bool, host_can_write: bool, uid: libc::uid_t, mode: libc::mode_t) -> FileMetadata {
        FileMetadata {
            on_tmpfs,
            host_can_write,
            uid,
            mode,
        }
    }

    #[test]
    fn page_helpers() {
        let ps = page_size();
        assert!(ps.is_power_of_two());
        assert_eq!(ceil_page_size(0), 0);
        assert_eq!(ceil_page_size(1), ps);
        assert_eq!(ceil_page_size(ps), ps);
        assert_eq!(floor_page_size(ps + 1), ps);
        assert_eq!(
            floor_page_size_remote(RemotePtr::new_from_val(ps + 7)).as_usize(),
            ps
        );
    }

    #[test]
    fn tmpfs_always_copied() {
        // Even a root-owned executable mapping is copied when on tmpfs.
        let m = meta(true, false, 0, 0o755);
        assert!(should_copy_mmap_region(
            "/dev/shm/foo",
            &m,
            ProtFlags::PROT_READ | ProtFlags::PROT_EXEC,
            MapFlags::MAP_PRIVATE,
            false
        ));
    }

    #[test]
    fn private_executable_mapping_not_copied() {
        let m = meta(false, false, 1000, 0o755);
        assert!(!should_copy_mmap_region(
            "/usr/lib/libfoo.so",
            &m,
            ProtFlags::PROT_READ | ProtFlags::PROT_EXEC,
            MapFlags::MAP_PRIVATE,
            false
        ));
        // Data section of the same +x file: still no copy.
        assert!(!should_copy_mmap_region(
            "/usr/lib/libfoo.so",
            &m,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_PRIVATE,
            false
        ));
    }

    #[test]
    fn root_owned_unwritable_not_copied() {
        let m = meta(false, false, 0, 0o644);
        assert!(!should_copy_mmap_region(
            "/etc/ld.so.cache",
            &m,
            ProtFlags::PROT_READ,
            MapFlags::MAP_PRIVATE,
            false
        ));
    }

    #[test]
    fn private_non_executable_user_file_copied() {
        let m = meta(false, true, 1000, 0o644);
        assert!(should_copy_mmap_region(
            "/home/user/cache.db",
            &m,
            ProtFlags::PROT_READ,
            MapFlags::MAP_PRIVATE,
            false
        ));
    }

    #[test]
    fn shared_read_only_user_file_copied() {
        let m = meta(false, false, 1000, 0o444);
        assert!(should_copy_mmap_region(
            "/home/user/data",
            &m,
            ProtFlags::PROT_READ,
            MapFlags::MAP_SHARED,
            false
        ));
    }

    #[test]
    fn shared_writable_copied() {
        let m = meta(false, true, 1000, 0o644);
        assert!(should_copy_mmap_region(
            "/home/user/shared.dat",
            &m,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_SHARED,
            true
        ));
    }

    // The suppression knob only silences the shared-writable warning;
    // the classification itself must not move.
    #[test]
    fn warning_suppression_does_not_change_classification() {
        let m = meta(false, true, 1000, 0o644);
        for &suppress in &[false, true] {
            let config = EngineConfig::builder()
                .trace_dir("/tmp/trace")
                .suppress_environment_warnings(suppress)
                .build();
            assert!(should_copy_mmap_region_for_recording(
                "/home/user/shared.dat",
                &m,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &config
            ));
        }
    }
}
