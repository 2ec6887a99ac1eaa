//! Static name-lookup tables for syscalls, signals, ptrace events and
//! errno values, used by diagnostics. These are plain match tables built
//! into the binary; nothing here allocates except the fallback formatting
//! for values we have no name for.

/// Name an x86_64 syscall number. Covers the syscalls this engine injects
/// or verifies plus the common ones that show up in diagnostics; anything
/// else is formatted numerically.
pub fn syscall_name(syscall: i64) -> String {
    match syscall {
        libc::SYS_read => "read".into(),
        libc::SYS_write => "write".into(),
        libc::SYS_open => "open".into(),
        libc::SYS_openat => "openat".into(),
        libc::SYS_close => "close".into(),
        libc::SYS_mmap => "mmap".into(),
        libc::SYS_munmap => "munmap".into(),
        libc::SYS_mprotect => "mprotect".into(),
        libc::SYS_brk => "brk".into(),
        libc::SYS_ioctl => "ioctl".into(),
        libc::SYS_socket => "socket".into(),
        libc::SYS_connect => "connect".into(),
        libc::SYS_accept => "accept".into(),
        libc::SYS_sendmsg => "sendmsg".into(),
        libc::SYS_recvmsg => "recvmsg".into(),
        libc::SYS_bind => "bind".into(),
        libc::SYS_listen => "listen".into(),
        libc::SYS_clone => "clone".into(),
        libc::SYS_fork => "fork".into(),
        libc::SYS_vfork => "vfork".into(),
        libc::SYS_execve => "execve".into(),
        libc::SYS_exit => "exit".into(),
        libc::SYS_exit_group => "exit_group".into(),
        libc::SYS_wait4 => "wait4".into(),
        libc::SYS_kill => "kill".into(),
        libc::SYS_futex => "futex".into(),
        libc::SYS_restart_syscall => "restart_syscall".into(),
        _ => format!("syscall({})", syscall),
    }
}

pub fn signal_name(sig: i32) -> String {
    /* strsignal() would be nice to use here, but it provides TMI. */
    if 32 <= sig && sig <= 64 {
        return format!("SIGRT{}", sig);
    }

    match sig {
        libc::SIGHUP => "SIGHUP".into(),
        libc::SIGINT => "SIGINT".into(),
        libc::SIGQUIT => "SIGQUIT".into(),
        libc::SIGILL => "SIGILL".into(),
        libc::SIGTRAP => "SIGTRAP".into(),
        libc::SIGABRT => "SIGABRT".into(),
        libc::SIGBUS => "SIGBUS".into(),
        libc::SIGFPE => "SIGFPE".into(),
        libc::SIGKILL => "SIGKILL".into(),
        libc::SIGUSR1 => "SIGUSR1".into(),
        libc::SIGSEGV => "SIGSEGV".into(),
        libc::SIGUSR2 => "SIGUSR2".into(),
        libc::SIGPIPE => "SIGPIPE".into(),
        libc::SIGALRM => "SIGALRM".into(),
        libc::SIGTERM => "SIGTERM".into(),
        libc::SIGSTKFLT => "SIGSTKFLT".into(),
        libc::SIGCHLD => "SIGCHLD".into(),
        libc::SIGCONT => "SIGCONT".into(),
        libc::SIGSTOP => "SIGSTOP".into(),
        libc::SIGTSTP => "SIGTSTP".into(),
        libc::SIGTTIN => "SIGTTIN".into(),
        libc::SIGTTOU => "SIGTTOU".into(),
        libc::SIGURG => "SIGURG".into(),
        libc::SIGXCPU => "SIGXCPU".into(),
        libc::SIGXFSZ => "SIGXFSZ".into(),
        libc::SIGVTALRM => "SIGVTALRM".into(),
        libc::SIGPROF => "SIGPROF".into(),
        libc::SIGWINCH => "SIGWINCH".into(),
        libc::SIGIO => "SIGIO".into(),
        libc::SIGPWR => "SIGPWR".into(),
        libc::SIGSYS => "SIGSYS".into(),
        /* Special-case this so we don't need to format!() in this common
         * case: assertions often pass signal_name(sig) when sig is 0. */
        0 => "signal(0)".into(),
        _ => format!("signal({})", sig),
    }
}

pub fn ptrace_event_name(event: i32) -> String {
    match event {
        libc::PTRACE_EVENT_FORK => "PTRACE_EVENT_FORK".into(),
        libc::PTRACE_EVENT_VFORK => "PTRACE_EVENT_VFORK".into(),
        libc::PTRACE_EVENT_CLONE => "PTRACE_EVENT_CLONE".into(),
        libc::PTRACE_EVENT_EXEC => "PTRACE_EVENT_EXEC".into(),
        libc::PTRACE_EVENT_VFORK_DONE => "PTRACE_EVENT_VFORK_DONE".into(),
        libc::PTRACE_EVENT_EXIT => "PTRACE_EVENT_EXIT".into(),
        libc::PTRACE_EVENT_SECCOMP => "PTRACE_EVENT_SECCOMP".into(),
        /* Special-case this: assertions often pass ptrace_event_name(event)
         * when event is 0. */
        0 => "PTRACE_EVENT(0)".into(),
        _ => format!("PTRACE_EVENT({})", event),
    }
}

pub fn errno_name(err: i32) -> String {
    match err {
        0 => "SUCCESS".into(),
        libc::EPERM => "EPERM".into(),
        libc::ENOENT => "ENOENT".into(),
        libc::ESRCH => "ESRCH".into(),
        libc::EINTR => "EINTR".into(),
        libc::EIO => "EIO".into(),
        libc::EBADF => "EBADF".into(),
        libc::ECHILD => "ECHILD".into(),
        libc::EAGAIN => "EAGAIN".into(),
        libc::ENOMEM => "ENOMEM".into(),
        libc::EACCES => "EACCES".into(),
        libc::EFAULT => "EFAULT".into(),
        libc::EBUSY => "EBUSY".into(),
        libc::EEXIST => "EEXIST".into(),
        libc::ENODEV => "ENODEV".into(),
        libc::ENOTDIR => "ENOTDIR".into(),
        libc::EISDIR => "EISDIR".into(),
        libc::EINVAL => "EINVAL".into(),
        libc::ENFILE => "ENFILE".into(),
        libc::EMFILE => "EMFILE".into(),
        libc::ENOSPC => "ENOSPC".into(),
        libc::EPIPE => "EPIPE".into(),
        libc::ECONNREFUSED => "ECONNREFUSED".into(),
        libc::EADDRINUSE => "EADDRINUSE".into(),
        libc::ENOSYS => "ENOSYS".into(),
        _ => format!("errno({})", err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_known_values() {
        assert_eq!(syscall_name(libc::SYS_mprotect), "mprotect");
        assert_eq!(signal_name(libc::SIGTRAP), "SIGTRAP");
        assert_eq!(signal_name(35), "SIGRT35");
        assert_eq!(ptrace_event_name(libc::PTRACE_EVENT_SECCOMP), "PTRACE_EVENT_SECCOMP");
        assert_eq!(errno_name(libc::ECHILD), "ECHILD");
    }

    #[test]
    fn formats_unknown_values() {
        assert_eq!(syscall_name(99999), "syscall(99999)");
        assert_eq!(signal_name(0), "signal(0)");
        assert_eq!(ptrace_event_name(0), "PTRACE_EVENT(0)");
    }
}
