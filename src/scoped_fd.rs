use nix::fcntl::{open, OFlag};
use nix::sys::stat::Mode;
use nix::unistd::close;
use nix::NixPath;
use std::fmt;
use std::os::unix::io::RawFd;

/// RAII file descriptor. We DON'T want this to be Copy or Clone because
/// of the Drop.
pub struct ScopedFd {
    fd: RawFd,
}

impl ScopedFd {
    pub fn new() -> Self {
        ScopedFd { fd: -1 }
    }

    pub fn from_raw(fd: RawFd) -> Self {
        ScopedFd { fd }
    }

    pub fn open_path<P: ?Sized + NixPath>(path: &P, oflag: OFlag) -> Self {
        let rawfd = open(path, oflag, Mode::empty()).unwrap_or(-1);
        ScopedFd { fd: rawfd }
    }

    pub fn open_path_with_mode<P: ?Sized + NixPath>(path: &P, oflag: OFlag, mode: Mode) -> Self {
        let rawfd = open(path, oflag, mode).unwrap_or(-1);
        ScopedFd { fd: rawfd }
    }

    pub fn close(&mut self) {
        if self.fd >= 0 {
            // We swallow any error on close.
            close(self.fd).unwrap_or(());
        }
        self.fd = -1;
    }

    pub fn is_open(&self) -> bool {
        self.fd >= 0
    }

    pub fn as_raw(&self) -> RawFd {
        self.fd
    }

    /// Hand the descriptor to the caller, leaving this wrapper closed.
    pub fn extract(&mut self) -> RawFd {
        let result = self.fd;
        self.fd = -1;
        result
    }
}

impl Default for ScopedFd {
    fn default() -> Self {
        ScopedFd::new()
    }
}

impl fmt::Debug for ScopedFd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ScopedFd({})", self.fd)
    }
}

impl Drop for ScopedFd {
    fn drop(&mut self) {
        self.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_closed() {
        let fd = ScopedFd::new();
        assert!(!fd.is_open());
        assert_eq!(fd.as_raw(), -1);
    }

    #[test]
    fn extract_leaves_closed() {
        let mut fd = ScopedFd::open_path("/dev/null", OFlag::O_RDONLY);
        assert!(fd.is_open());
        let raw = fd.extract();
        assert!(raw >= 0);
        assert!(!fd.is_open());
        // We took ownership; close it by hand.
        nix::unistd::close(raw).unwrap();
    }
}
