//! Segment-by-segment memory checksums for divergence detection.
//!
//! During recording, `checksum_process_memory` stores one checksum per
//! interesting segment; at the same point during replay,
//! `validate_process_memory` walks the live map in lockstep with the
//! stored records and flags any segment whose contents differ.

use crate::address_space::kernel_mapping::KernelMapping;
use crate::address_space::{iterate_memory_map, IterationAction, MapIteratorData, ReadPolicy};
use crate::config::EngineConfig;
use crate::log::LogDebug;
use crate::registers::MismatchBehavior;
use crate::remote_ptr::RemotePtr;
use crate::scratch::is_start_of_scratch_region;
use crate::syscallbuf::{syscallbuf_hdr, syscallbuf_record, SYSCALLBUF_SHMEM_PATH_PREFIX};
use crate::task::Task;
use crate::trace_dir::{checksum_file_path, dump_file_path, FrameTime};
use crate::util::{should_copy_mmap_region, FileMetadata};
use nix::sys::mman::ProtFlags;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::mem::size_of;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ChecksumMode {
    StoreChecksums,
    ValidateChecksums,
}

/// Additive checksum over little-endian 32-bit words. A trailing partial
/// word does not participate.
pub fn checksum_bytes(buf: &[u8]) -> u32 {
    let mut checksum: u32 = 0;
    for chunk in buf.chunks_exact(4) {
        checksum =
            checksum.wrapping_add(u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
    }
    checksum
}

pub fn format_checksum_record(checksum: u32, raw_map_line: &str) -> String {
    format!("({:x}) {}", checksum, raw_map_line)
}

/// The parts of a stored checksum record that validation consumes: the
/// checksum and the address range from the persisted raw map line.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct ChecksumRecord {
    pub checksum: u32,
    pub start: usize,
    pub end: usize,
}

pub fn parse_checksum_record(line: &str) -> Option<ChecksumRecord> {
    let rest = line.strip_prefix('(')?;
    let close = rest.find(')')?;
    let checksum = u32::from_str_radix(&rest[..close], 16).ok()?;
    let rest = rest[close + 1..].trim_start_matches(' ');
    let range = rest.split(' ').next()?;
    let mut addrs = range.split('-');
    let start = usize::from_str_radix(addrs.next()?, 16).ok()?;
    let end = usize::from_str_radix(addrs.next()?, 16).ok()?;
    Some(ChecksumRecord {
        checksum,
        start,
        end,
    })
}

/// Decide whether a segment is worth checksumming. If the backing
/// resource is effectively immutable the checksum is a waste of time,
/// except when the mapping itself is writable (e.g. the rw data segment
/// of a system library).
fn checksum_segment_filter(km: &KernelMapping) -> bool {
    let may_diverge = match FileMetadata::for_path(km.fsname()) {
        None => {
            // No persistent resource backs this mapping; expect it to
            // change.
            log!(LogDebug, "CHECKSUMMING unlinked '{}'", km.fsname());
            return true;
        }
        Some(meta) => {
            should_copy_mmap_region(km.fsname(), &meta, km.prot(), km.flags(), false)
                || km.prot().contains(ProtFlags::PROT_WRITE)
        }
    };
    log!(
        LogDebug,
        "{} '{}'",
        if may_diverge { "CHECKSUMMING" } else { "  skipping" },
        km.fsname()
    );
    may_diverge
}

/// How many leading bytes of this segment are deterministic wrt trace
/// events. The syscallbuf shmem consists of committed records (plus
/// possibly one pending record's metadata), which are deterministic, and
/// "extra data" beyond that which behaves like scratch. Everything else
/// is checksummed whole.
fn deterministic_prefix_len(t: &Task, data: &MapIteratorData) -> usize {
    if data.map.fsname().starts_with(SYSCALLBUF_SHMEM_PATH_PREFIX) {
        let hdr: syscallbuf_hdr = t.read_val(RemotePtr::cast(data.map.start()));
        let len =
            size_of::<syscallbuf_hdr>() + hdr.num_rec_bytes as usize + size_of::<syscallbuf_record>();
        len.min(data.mem.len())
    } else {
        data.mem.len()
    }
}

fn notify_checksum_error(
    t: &Task,
    config: &EngineConfig,
    time: FrameTime,
    checksum: u32,
    rec_checksum: u32,
    data: &MapIteratorData,
) {
    dump_process_memory(t, config, time, "checksum_error");

    let cur_dump = dump_file_path(config, time, t.rec_tid, "checksum_error");
    let rec_dump = dump_file_path(config, time, t.rec_tid, "rec");

    let behavior = config.checksum_mismatch_behavior();
    if behavior >= MismatchBehavior::BailOnMismatch {
        ed_assert!(
            t,
            checksum == rec_checksum,
            "Divergence in contents of memory segment at time {}:\n\
             \n\
             {}\n\
                 (recorded checksum:{:#x}; replaying checksum:{:#x})\n\
             \n\
             Dumped current memory contents to {:?}; compare with {:?} from\n\
             the recording to determine which memory cells differ.",
            time,
            data.raw_map_line,
            rec_checksum,
            checksum,
            cur_dump,
            rec_dump
        );
    } else if behavior >= MismatchBehavior::LogMismatches {
        log!(
            crate::log::LogError,
            "Checksum mismatch at time {} for {} (recorded {:#x}, live {:#x})",
            time,
            data.raw_map_line,
            rec_checksum,
            checksum
        );
    }
}

/// Either create and store checksums for each segment mapped in `t`'s
/// address space, or validate previously stored ones. Behavior is
/// selected by `mode`.
fn iterate_checksums(t: &Task, config: &EngineConfig, mode: ChecksumMode, time: FrameTime) {
    let path = checksum_file_path(config, time, t.rec_tid);

    let mut writer;
    let mut reader;
    match mode {
        ChecksumMode::StoreChecksums => {
            let file = match File::create(&path) {
                Ok(f) => f,
                Err(e) => fatal!("Failed to create checksum file {:?}: {}", path, e),
            };
            writer = Some(BufWriter::new(file));
            reader = None;
        }
        ChecksumMode::ValidateChecksums => {
            let file = match File::open(&path) {
                Ok(f) => f,
                Err(e) => fatal!("Failed to open checksum file {:?}: {}", path, e),
            };
            reader = Some(BufReader::new(file).lines());
            writer = None;
        }
    }

    iterate_memory_map(
        t,
        |data| {
            let valid_len = deterministic_prefix_len(t, data);
            let checksum = checksum_bytes(&data.mem[..valid_len]);

            match mode {
                ChecksumMode::StoreChecksums => {
                    let out = writer.as_mut().unwrap();
                    if let Err(e) =
                        writeln!(out, "{}", format_checksum_record(checksum, &data.raw_map_line))
                    {
                        fatal!("Failed to write checksum record: {}", e);
                    }
                }
                ChecksumMode::ValidateChecksums => {
                    let line = match reader.as_mut().unwrap().next() {
                        Some(Ok(line)) => line,
                        _ => {
                            ed_assert!(
                                t,
                                false,
                                "No stored checksum for segment {}",
                                data.raw_map_line
                            );
                            return IterationAction::Stop;
                        }
                    };
                    let rec = match parse_checksum_record(&line) {
                        Some(rec) => rec,
                        None => {
                            ed_assert!(t, false, "Unparseable checksum record `{}'", line);
                            return IterationAction::Stop;
                        }
                    };
                    ed_assert!(
                        t,
                        rec.start == data.map.start().as_usize()
                            && rec.end == data.map.end().as_usize(),
                        "Segment {:#x}-{:#x} changed to {}??",
                        rec.start,
                        rec.end,
                        data.map
                    );
                    if is_start_of_scratch_region(rec.start.into()) {
                        // Replay doesn't touch scratch regions, so their
                        // contents are allowed to diverge. Tracees can't
                        // observe those segments unless they do something
                        // sneaky (or disastrously buggy).
                        log!(
                            LogDebug,
                            "Not validating scratch starting at {:#x}",
                            rec.start
                        );
                        return IterationAction::Continue;
                    }
                    if checksum != rec.checksum {
                        notify_checksum_error(t, config, time, checksum, rec.checksum, data);
                    }
                }
            }
            IterationAction::Continue
        },
        ReadPolicy::Predicate(&checksum_segment_filter),
    );

    // Stored records beyond the end of the live map mean a trailing
    // segment was unmapped since the store; that's legal, but worth a
    // trace when debugging lockstep trouble.
    if let ChecksumMode::ValidateChecksums = mode {
        let leftover = reader.as_mut().unwrap().filter(|l| l.is_ok()).count();
        if leftover > 0 {
            log!(
                LogDebug,
                "Ignoring {} stored checksum record(s) with no live segment",
                leftover
            );
        }
    }
}

pub fn checksum_process_memory(t: &Task, config: &EngineConfig, time: FrameTime) {
    iterate_checksums(t, config, ChecksumMode::StoreChecksums, time);
}

pub fn validate_process_memory(t: &Task, config: &EngineConfig, time: FrameTime) {
    iterate_checksums(t, config, ChecksumMode::ValidateChecksums, time);
}

/// Write `label`, then one line per 32-bit word of `buf`.
fn dump_binary_chunk(
    out: &mut dyn Write,
    label: &str,
    buf: &[u8],
    start_addr: usize,
) -> std::io::Result<()> {
    writeln!(out, "{}", label)?;
    for (i, chunk) in buf.chunks_exact(4).enumerate() {
        let word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        writeln!(out, "0x{:08x} | [0x{:x}]", word, start_addr + i * 4)?;
    }
    Ok(())
}

/// Write a human-readable dump of all of `t`'s non-scratch memory to the
/// trace directory, tagged so multiple dumps of one frame coexist.
pub fn dump_process_memory(t: &Task, config: &EngineConfig, time: FrameTime, tag: &str) {
    let path = dump_file_path(config, time, t.rec_tid, tag);
    let file = match File::create(&path) {
        Ok(f) => f,
        Err(e) => fatal!("Failed to create dump file {:?}: {}", path, e),
    };
    let mut out = BufWriter::new(file);

    iterate_memory_map(
        t,
        |data| {
            // Scratch regions will diverge between recording/replay, so
            // including them makes comparing record/replay dumps very
            // noisy.
            if is_start_of_scratch_region(data.map.start()) {
                return IterationAction::Continue;
            }
            if let Err(e) = dump_binary_chunk(
                &mut out,
                &data.raw_map_line,
                &data.mem,
                data.map.start().as_usize(),
            ) {
                fatal!("Failed to write dump file {:?}: {}", path, e);
            }
            IterationAction::Continue
        },
        ReadPolicy::Always,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_is_additive_over_le_words() {
        assert_eq!(checksum_bytes(&[]), 0);
        assert_eq!(checksum_bytes(&[1, 0, 0, 0]), 1);
        assert_eq!(checksum_bytes(&[1, 0, 0, 0, 2, 0, 0, 0]), 3);
        // Trailing partial word is ignored.
        assert_eq!(checksum_bytes(&[1, 0, 0, 0, 0xff, 0xff, 0xff]), 1);
        // Word sums wrap.
        assert_eq!(
            checksum_bytes(&[0xff, 0xff, 0xff, 0xff, 2, 0, 0, 0]),
            1
        );
    }

    #[test]
    fn record_format_round_trips() {
        let raw = "7f0000000000-7f0000002000 rw-p 00000000 00:00 0 ";
        let line = format_checksum_record(0xdeadbeef, raw);
        assert_eq!(line, "(deadbeef) 7f0000000000-7f0000002000 rw-p 00000000 00:00 0 ");
        let rec = parse_checksum_record(&line).unwrap();
        assert_eq!(rec.checksum, 0xdeadbeef);
        assert_eq!(rec.start, 0x7f0000000000);
        assert_eq!(rec.end, 0x7f0000002000);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(parse_checksum_record("").is_none());
        assert!(parse_checksum_record("deadbeef 1000-2000").is_none());
        assert!(parse_checksum_record("(zzz) 1000-2000").is_none());
        assert!(parse_checksum_record("(12) 1000+2000").is_none());
    }

    // Store-then-validate over synthetic segments, exercising the same
    // record pipeline the live passes use.
    #[test]
    fn synthetic_store_validate_detects_single_mutation() {
        let segments: Vec<(String, Vec<u8>)> = (0..3)
            .map(|i| {
                let start = 0x1000 * (i + 1);
                let raw = format!("{:x}-{:x} rw-p 00000000 00:00 0 ", start, start + 0x1000);
                let mem = vec![i as u8 + 1; 64];
                (raw, mem)
            })
            .collect();

        let mut stored = String::new();
        for (raw, mem) in &segments {
            stored.push_str(&format_checksum_record(checksum_bytes(mem), raw));
            stored.push('\n');
        }

        // Unmutated: every segment matches.
        for (line, (_, mem)) in stored.lines().zip(&segments) {
            let rec = parse_checksum_record(line).unwrap();
            assert_eq!(rec.checksum, checksum_bytes(mem));
        }

        // Mutate one byte in the middle segment: exactly that segment
        // mismatches.
        let mut mutated = segments.clone();
        mutated[1].1[5] ^= 0x40;
        let mismatches: Vec<usize> = stored
            .lines()
            .zip(&mutated)
            .enumerate()
            .filter(|(_, (line, (_, mem)))| {
                parse_checksum_record(line).unwrap().checksum != checksum_bytes(mem)
            })
            .map(|(i, _)| i)
            .collect();
        assert_eq!(mismatches, vec![1]);
    }

    #[test]
    fn dump_chunk_renders_words_with_addresses() {
        let mut out = Vec::new();
        dump_binary_chunk(
            &mut out,
            "1000-2000 rw-p 00000000 00:00 0 ",
            &[0x78, 0x56, 0x34, 0x12, 0, 0, 0, 0],
            0x1000,
        )
        .unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(
            text,
            "1000-2000 rw-p 00000000 00:00 0 \n\
             0x12345678 | [0x1000]\n\
             0x00000000 | [0x1004]\n"
        );
    }

    // STORE then VALIDATE over a live address space. A SIGSTOPped fork
    // child is frozen, so the two passes see identical memory and even
    // the strictest mismatch setting stays quiet.
    #[test]
    fn store_then_validate_stopped_child() {
        use crate::address_space::kernel_map_iterator::{parse_rawline, KernelMapIterator};
        use nix::sys::signal::{kill, Signal};
        use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
        use nix::unistd::{fork, getpid, ForkResult};
        use std::fs;

        let child = match unsafe { fork() } {
            Ok(ForkResult::Child) => unsafe {
                libc::raise(libc::SIGSTOP);
                libc::_exit(0)
            },
            Ok(ForkResult::Parent { child }) => child,
            Err(e) => panic!("fork failed: {}", e),
        };
        match waitpid(child, Some(WaitPidFlag::WUNTRACED)) {
            Ok(WaitStatus::Stopped(_, Signal::SIGSTOP)) => (),
            other => panic!("child never stopped: {:?}", other),
        }

        let dir = std::env::temp_dir().join(format!("rde-checksum-test-{}", getpid()));
        fs::create_dir_all(&dir).unwrap();
        let config = EngineConfig::builder()
            .trace_dir(&dir)
            .checksum_mismatch_behavior(MismatchBehavior::BailOnMismatch)
            .build();
        let t = Task::new(child.as_raw(), child.as_raw());
        let time: FrameTime = 1;

        checksum_process_memory(&t, &config, time);

        // One well-formed record per maps line, in enumeration order,
        // carrying that line's exact range.
        let path = checksum_file_path(&config, time, t.rec_tid);
        let stored = fs::read_to_string(&path).unwrap();
        let live: Vec<String> = KernelMapIterator::new_from_tid(t.tid)
            .map(|entry| entry.raw_line)
            .collect();
        let lines: Vec<&str> = stored.lines().collect();
        assert_eq!(lines.len(), live.len());
        for (line, raw) in lines.iter().zip(&live) {
            let rec = parse_checksum_record(line).unwrap();
            assert_eq!(*line, format_checksum_record(rec.checksum, raw));
            let km = parse_rawline(raw).unwrap();
            assert_eq!(rec.start, km.start().as_usize());
            assert_eq!(rec.end, km.end().as_usize());
        }

        validate_process_memory(&t, &config, time);

        // A stored record past the end of the live map is ignored, not
        // fatal.
        let mut extended = stored;
        extended.push_str(&format_checksum_record(
            0,
            "fffff7ff8000-fffff7ffa000 rw-p 00000000 00:00 0 ",
        ));
        extended.push('\n');
        fs::write(&path, extended).unwrap();
        validate_process_memory(&t, &config, time);

        kill(child, Signal::SIGKILL).unwrap();
        let _ = waitpid(child, None);
        let _ = fs::remove_dir_all(&dir);
    }
}
