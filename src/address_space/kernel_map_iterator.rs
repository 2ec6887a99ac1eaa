use crate::address_space::kernel_mapping::KernelMapping;
use crate::remote_ptr::{RemotePtr, Void};
use crate::task::Task;
use libc::{ino_t, pid_t};
use nix::sys::mman::{MapFlags, ProtFlags};
use nix::sys::stat::makedev;
use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader};

/// A /proc/<tid>/maps line that could not be parsed. The kernel's output
/// is assumed well-formed, so the iterator treats this as fatal; the
/// parser surfaces it so tests can exercise malformed input.
#[derive(Debug, Eq, PartialEq)]
pub struct MapsParseError {
    pub line: String,
    pub what: &'static str,
}

impl fmt::Display for MapsParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} in maps line `{}'", self.what, self.line)
    }
}

/// One entry from /proc/<tid>/maps: the parsed mapping plus the raw line
/// it came from. Checksum records persist the raw text, so it is carried
/// through the iteration.
pub struct MapsEntry {
    pub map: KernelMapping,
    pub raw_line: String,
}

/// Lazy line-by-line reader of /proc/<tid>/maps.
pub struct KernelMapIterator {
    tid: pid_t,
    buf_reader: BufReader<File>,
}

impl Iterator for KernelMapIterator {
    type Item = MapsEntry;

    fn next(&mut self) -> Option<MapsEntry> {
        let mut raw_line: String = String::new();
        match self.buf_reader.read_line(&mut raw_line) {
            Ok(0) => None,
            Ok(_) => {
                let map = match parse_rawline(&raw_line) {
                    Ok(map) => map,
                    Err(e) => fatal!("Corrupt /proc/{}/maps: {}", self.tid, e),
                };
                let raw_line = raw_line.trim_end_matches('\n').to_owned();
                Some(MapsEntry { map, raw_line })
            }
            Err(_) => fatal!("Error reading /proc/{}/maps", self.tid),
        }
    }
}

impl KernelMapIterator {
    pub fn new(task: &Task) -> KernelMapIterator {
        Self::new_from_tid(task.tid)
    }

    pub fn new_from_tid(tid: pid_t) -> KernelMapIterator {
        let maps_path = format!("/proc/{}/maps", tid);
        match File::open(&maps_path) {
            Ok(file) => KernelMapIterator {
                tid,
                buf_reader: BufReader::new(file),
            },
            Err(_) => fatal!("Failed to open {}", maps_path),
        }
    }
}

fn err(line: &str, what: &'static str) -> MapsParseError {
    MapsParseError {
        line: line.trim_end_matches('\n').to_owned(),
        what,
    }
}

/// Parse one line of /proc/<tid>/maps output.
pub fn parse_rawline(raw_line: &str) -> Result<KernelMapping, MapsParseError> {
    let mut iter = raw_line.splitn(6, ' ');
    let addr_range = iter.next().ok_or_else(|| err(raw_line, "missing address range"))?;
    let perms_s = iter.next().ok_or_else(|| err(raw_line, "missing permissions"))?;
    let offset_s = iter.next().ok_or_else(|| err(raw_line, "missing offset"))?;
    let device = iter.next().ok_or_else(|| err(raw_line, "missing device"))?;
    let inode_s = iter.next().ok_or_else(|| err(raw_line, "missing inode"))?;
    // The filename column may be absent for anonymous mappings. Leading
    // spaces are column padding; a trailing newline is not part of the
    // name.
    let fsname_unescaped = iter
        .next()
        .unwrap_or("")
        .trim_start_matches(' ')
        .trim_end_matches('\n');

    let mut addr_iter = addr_range.split('-');
    let addr_low_s = addr_iter
        .next()
        .ok_or_else(|| err(raw_line, "bad address range"))?;
    let addr_high_s = addr_iter
        .next()
        .ok_or_else(|| err(raw_line, "bad address range"))?;

    let mut dev_iter = device.split(':');
    let dev_major_s = dev_iter.next().ok_or_else(|| err(raw_line, "bad device"))?;
    let dev_minor_s = dev_iter.next().ok_or_else(|| err(raw_line, "bad device"))?;

    let addr_low: RemotePtr<Void> = usize::from_str_radix(addr_low_s, 16)
        .map_err(|_| err(raw_line, "bad start address"))?
        .into();
    let addr_high: RemotePtr<Void> = usize::from_str_radix(addr_high_s, 16)
        .map_err(|_| err(raw_line, "bad end address"))?
        .into();
    if addr_high < addr_low {
        return Err(err(raw_line, "end address below start address"));
    }
    let offset =
        u64::from_str_radix(offset_s, 16).map_err(|_| err(raw_line, "bad offset"))?;
    let dev_major =
        u64::from_str_radix(dev_major_s, 16).map_err(|_| err(raw_line, "bad device major"))?;
    let dev_minor =
        u64::from_str_radix(dev_minor_s, 16).map_err(|_| err(raw_line, "bad device minor"))?;
    let inode: ino_t = inode_s
        .parse::<ino_t>()
        .map_err(|_| err(raw_line, "bad inode"))?;

    // /proc escapes embedded newlines in filenames as "\012".
    let mut fsname = String::new();
    let mut chars = fsname_unescaped.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            let c1 = chars.next();
            let c2 = chars.next();
            let c3 = chars.next();
            if c1 == Some('0') && c2 == Some('1') && c3 == Some('2') {
                fsname.push('\n');
            } else {
                fsname.push(c);
                c1.map_or((), |c| fsname.push(c));
                c2.map_or((), |c| fsname.push(c));
                c3.map_or((), |c| fsname.push(c));
            }
        } else {
            fsname.push(c);
        }
    }

    Ok(KernelMapping::new_with_opts(
        addr_low,
        addr_high,
        &fsname,
        makedev(dev_major, dev_minor),
        inode,
        get_prot(perms_s),
        get_map_flags(perms_s),
        offset,
    ))
}

fn get_prot(perms_s: &str) -> ProtFlags {
    let mut prot = ProtFlags::empty();
    if perms_s.contains('r') {
        prot |= ProtFlags::PROT_READ;
    }
    if perms_s.contains('w') {
        prot |= ProtFlags::PROT_WRITE;
    }
    if perms_s.contains('x') {
        prot |= ProtFlags::PROT_EXEC;
    }
    prot
}

fn get_map_flags(perms_s: &str) -> MapFlags {
    let mut map_flags = MapFlags::empty();
    if perms_s.contains('p') {
        map_flags |= MapFlags::MAP_PRIVATE;
    }
    if perms_s.contains('s') {
        map_flags |= MapFlags::MAP_SHARED;
    }
    map_flags
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::getpid;

    #[test]
    fn parses_file_backed_line() {
        let line = "7f1234560000-7f1234580000 r-xp 00002000 08:01 393241 /usr/lib/libz.so.1\n";
        let km = parse_rawline(line).unwrap();
        assert_eq!(km.start().as_usize(), 0x7f1234560000);
        assert_eq!(km.end().as_usize(), 0x7f1234580000);
        assert_eq!(km.prot(), ProtFlags::PROT_READ | ProtFlags::PROT_EXEC);
        assert_eq!(km.flags(), MapFlags::MAP_PRIVATE);
        assert_eq!(km.file_offset_bytes(), 0x2000);
        assert_eq!(km.inode(), 393241);
        assert_eq!(km.fsname(), "/usr/lib/libz.so.1");
    }

    #[test]
    fn parses_anonymous_line() {
        let line = "7ffd1000-7ffd3000 rw-p 00000000 00:00 0 \n";
        let km = parse_rawline(line).unwrap();
        assert_eq!(km.fsname(), "");
        assert!(!km.is_real_device());
        assert_eq!(km.flags(), MapFlags::MAP_PRIVATE);
    }

    #[test]
    fn unescapes_newline_in_filename() {
        let line = "1000-2000 rw-s 00000000 08:01 5 /tmp/a\\012b\n";
        let km = parse_rawline(line).unwrap();
        assert_eq!(km.fsname(), "/tmp/a\nb");
        assert_eq!(km.flags(), MapFlags::MAP_SHARED);
    }

    #[test]
    fn rejects_malformed_lines() {
        assert!(parse_rawline("garbage\n").is_err());
        assert!(parse_rawline("zzzz-2000 rw-p 00000000 00:00 0 \n").is_err());
        assert!(parse_rawline("2000-1000 rw-p 00000000 00:00 0 \n").is_err());
        assert!(parse_rawline("1000-2000 rw-p 00000000 0000 0 \n").is_err());
    }

    #[test]
    fn own_maps_enumerate_in_address_order() {
        let entries: Vec<MapsEntry> =
            KernelMapIterator::new_from_tid(getpid().as_raw()).collect();
        assert!(!entries.is_empty());
        for w in entries.windows(2) {
            assert!(w[0].map.start() < w[1].map.start());
            assert!(w[0].map.end() <= w[1].map.start());
        }
    }
}
