use libc::{WEXITSTATUS, WIFEXITED, WIFSIGNALED, WIFSTOPPED, WSTOPSIG, WTERMSIG};
use std::fmt;

/// Kernels before the one that introduced PTRACE_EVENT_SECCOMP == 7
/// shipped it as event number 8 (seen on ubuntu 12.04). We must skip both
/// when they interpose on an injected syscall.
pub const PTRACE_EVENT_SECCOMP_OBSOLETE: i32 = 8;

pub fn is_ptrace_seccomp_event(event: i32) -> bool {
    event == libc::PTRACE_EVENT_SECCOMP || event == PTRACE_EVENT_SECCOMP_OBSOLETE
}

/// A raw waitpid() status word, with accessors that keep the WIF* macro
/// noise in one place.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub struct WaitStatus {
    status: i32,
}

impl WaitStatus {
    pub fn new(status: i32) -> WaitStatus {
        WaitStatus { status }
    }

    pub fn get(&self) -> i32 {
        self.status
    }

    /// Exit code if the task exited normally, otherwise None.
    pub fn exit_code(&self) -> Option<i32> {
        if unsafe { WIFEXITED(self.status) } {
            Some(unsafe { WEXITSTATUS(self.status) })
        } else {
            None
        }
    }

    /// Terminating signal if the task was killed by one, otherwise None.
    pub fn fatal_sig(&self) -> Option<i32> {
        if unsafe { WIFSIGNALED(self.status) } {
            Some(unsafe { WTERMSIG(self.status) })
        } else {
            None
        }
    }

    pub fn exited(&self) -> bool {
        self.exit_code().is_some() || self.fatal_sig().is_some()
    }

    pub fn is_stopped(&self) -> bool {
        unsafe { WIFSTOPPED(self.status) }
    }

    /// The stop signal, with the PTRACE_O_TRACESYSGOOD high bit intact.
    /// Only meaningful if is_stopped().
    pub fn raw_stop_sig(&self) -> i32 {
        unsafe { WSTOPSIG(self.status) }
    }

    /// True for a syscall-entry or syscall-exit trap under
    /// PTRACE_O_TRACESYSGOOD.
    pub fn is_syscall_stop(&self) -> bool {
        self.is_stopped() && self.raw_stop_sig() == (libc::SIGTRAP | 0x80)
    }

    /// The ptrace event number packed above the stop signal, or 0 if this
    /// stop carries no event.
    pub fn ptrace_event(&self) -> i32 {
        if self.is_stopped() {
            (self.status >> 16) & 0xff
        } else {
            0
        }
    }
}

impl fmt::Display for WaitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stopped_with(sig: i32, event: i32) -> WaitStatus {
        WaitStatus::new(0x7f | (sig << 8) | (event << 16))
    }

    #[test]
    fn normal_exit() {
        let s = WaitStatus::new(0x4200); // exit code 0x42
        assert_eq!(s.exit_code(), Some(0x42));
        assert!(s.exited());
        assert!(!s.is_stopped());
        assert_eq!(s.ptrace_event(), 0);
    }

    #[test]
    fn fatal_signal() {
        let s = WaitStatus::new(libc::SIGKILL);
        assert_eq!(s.fatal_sig(), Some(libc::SIGKILL));
        assert!(s.exited());
    }

    #[test]
    fn syscall_stop() {
        let s = stopped_with(libc::SIGTRAP | 0x80, 0);
        assert!(s.is_stopped());
        assert!(s.is_syscall_stop());
        assert_eq!(s.ptrace_event(), 0);
    }

    #[test]
    fn seccomp_event_stop() {
        let s = stopped_with(libc::SIGTRAP, libc::PTRACE_EVENT_SECCOMP);
        assert!(s.is_stopped());
        assert!(!s.is_syscall_stop());
        assert!(is_ptrace_seccomp_event(s.ptrace_event()));
        let obsolete = stopped_with(libc::SIGTRAP, PTRACE_EVENT_SECCOMP_OBSOLETE);
        assert!(is_ptrace_seccomp_event(obsolete.ptrace_event()));
    }
}
