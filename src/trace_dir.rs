use crate::config::EngineConfig;
use libc::pid_t;
use std::path::PathBuf;

/// A global event counter value identifying a point in the trace.
pub type FrameTime = u64;

/// Checksum files are keyed by (time, recorded tid) so record and replay
/// passes over the same frame land on the same file.
pub fn checksum_file_path(config: &EngineConfig, time: FrameTime, rec_tid: pid_t) -> PathBuf {
    config.trace_dir().join(format!("{}_{}", time, rec_tid))
}

/// Memory dumps additionally carry a caller-supplied tag so multiple
/// dumps of the same frame don't clobber each other. Takes (time, tid)
/// in the same order as `checksum_file_path`.
pub fn dump_file_path(
    config: &EngineConfig,
    time: FrameTime,
    rec_tid: pid_t,
    tag: &str,
) -> PathBuf {
    config
        .trace_dir()
        .join(format!("{}_{}_{}", rec_tid, time, tag))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn paths_are_keyed_by_time_and_tid() {
        let config = EngineConfig::builder().trace_dir("/tmp/trace0").build();
        assert_eq!(
            checksum_file_path(&config, 1234, 567),
            Path::new("/tmp/trace0/1234_567")
        );
        assert_eq!(
            dump_file_path(&config, 1234, 567, "rec"),
            Path::new("/tmp/trace0/567_1234_rec")
        );
    }
}
