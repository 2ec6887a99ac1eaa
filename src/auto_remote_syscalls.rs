use crate::address_space::find_segment_containing;
use crate::kernel_metadata::syscall_name;
use crate::registers::Registers;
use crate::remote_ptr::{RemotePtr, Void};
use crate::task::Task;
use crate::util::floor_page_size_remote;
use crate::wait_status::is_ptrace_seccomp_event;
use nix::sys::mman::ProtFlags;
use std::ops::{Deref, DerefMut};

/// The x86_64 `syscall` instruction.
const SYSCALL_INSN: [u8; 2] = [0x0f, 0x05];

/// An RAII session for injecting syscalls into a stopped tracee.
///
/// On construction the task's registers are snapshotted and a `syscall`
/// instruction is written over the bytes at its current ip; both are
/// restored on drop. The exclusive borrow of the Task guarantees a
/// single session per task.
///
/// NBBB! Before using this, the caller must ensure the task will not
/// receive signals while the session is live; a handler running with the
/// stomped instruction in place would go badly wrong.
pub struct AutoRemoteSyscalls<'a> {
    t: &'a mut Task,
    /// The register snapshot that will be restored on drop. Callers may
    /// tweak this (e.g. to plant a syscall result) before the session
    /// ends.
    pub initial_regs: Registers,
    initial_ip: RemotePtr<Void>,
    initial_sp: RemotePtr<Void>,
    saved_insn: Vec<u8>,
    /// Syscall started with `syscall_nowait` that has not been waited
    /// on yet.
    pending_syscallno: Option<i64>,
}

impl<'a> AutoRemoteSyscalls<'a> {
    pub fn new(t: &'a mut Task) -> AutoRemoteSyscalls<'a> {
        let initial_regs = t.regs();
        let initial_ip = initial_regs.ip();
        let initial_sp = initial_regs.sp();
        let saved_insn = t.read_mem(initial_ip, SYSCALL_INSN.len());
        t.write_mem(initial_ip, &SYSCALL_INSN);
        AutoRemoteSyscalls {
            t,
            initial_regs,
            initial_ip,
            initial_sp,
            saved_insn,
            pending_syscallno: None,
        }
    }

    pub fn task(&self) -> &Task {
        self.t
    }

    pub fn task_mut(&mut self) -> &mut Task {
        self.t
    }

    /// Inject `syscallno` and block until it completes, returning its
    /// raw result register.
    pub fn syscall(&mut self, syscallno: i64, args: &[usize]) -> isize {
        self.start_syscall(syscallno, args);
        self.wait_syscall(syscallno)
    }

    /// Inject `syscallno` and return as soon as the tracee has entered
    /// the kernel. Used when the syscall itself blocks on an action the
    /// host has yet to perform; the result must be collected later with
    /// `wait_syscall`.
    pub fn syscall_nowait(&mut self, syscallno: i64, args: &[usize]) {
        self.start_syscall(syscallno, args);
        self.pending_syscallno = Some(syscallno);
    }

    /// Block until the tracee reaches the exit of `syscallno`, returning
    /// its raw result register.
    pub fn wait_syscall(&mut self, syscallno: i64) -> isize {
        if let Some(pending) = self.pending_syscallno.take() {
            ed_assert_eq!(
                self.t,
                pending,
                syscallno,
                "Waiting for {} but {} is outstanding",
                syscall_name(syscallno),
                syscall_name(pending)
            );
        }
        // Wait for the syscall-exit trap.
        self.t.wait();
        let regs = self.t.regs();
        ed_assert!(
            self.t,
            regs.original_syscallno() == syscallno,
            "Should be exiting {}, but instead at {}",
            syscall_name(syscallno),
            syscall_name(regs.original_syscallno())
        );
        regs.syscall_result_signed()
    }

    fn start_syscall(&mut self, syscallno: i64, args: &[usize]) {
        ed_assert!(
            self.t,
            self.pending_syscallno.is_none(),
            "Attempt to nest remote syscalls"
        );

        let mut callregs = self.initial_regs;
        callregs.set_syscallno(syscallno);
        callregs.set_syscall_args(args);
        self.t.set_regs(&callregs);

        // Advance to syscall entry.
        self.t.resume_syscall();
        let mut status = self.t.wait();

        // Skip past a seccomp trace, if we happened to see one. An
        // interposed filter reports before the syscall-entry trap.
        if is_ptrace_seccomp_event(status.ptrace_event()) {
            self.t.resume_syscall();
            status = self.t.wait();
        }
        ed_assert_eq!(self.t, status.ptrace_event(), 0);

        let entry_regs = self.t.regs();
        ed_assert!(
            self.t,
            entry_regs.original_syscallno() == syscallno,
            "Should be entering {}, but instead at {}",
            syscall_name(syscallno),
            syscall_name(entry_regs.original_syscallno())
        );

        // Start running the syscall.
        self.t.resume_syscall();
    }
}

impl<'a> Drop for AutoRemoteSyscalls<'a> {
    fn drop(&mut self) {
        ed_assert!(
            self.t,
            self.pending_syscallno.is_none(),
            "Session ended with a syscall still outstanding"
        );
        // Every AutoRestoreMem must have been popped by now.
        ed_assert_eq!(self.t, self.initial_regs.sp(), self.initial_sp);
        self.t.write_mem(self.initial_ip, &self.saved_insn);
        self.t.set_regs(&self.initial_regs);
    }
}

/// A scoped stack allocation in the tracee: decrements the saved sp,
/// saves the bytes it will overwrite, writes the payload, and undoes all
/// of it on drop. Allocations must be released in LIFO order.
pub struct AutoRestoreMem<'a, 'b> {
    remote: &'b mut AutoRemoteSyscalls<'a>,
    addr: RemotePtr<Void>,
    saved_data: Vec<u8>,
    saved_sp: RemotePtr<Void>,
}

impl<'a, 'b> AutoRestoreMem<'a, 'b> {
    /// Push `s` plus a terminating NUL byte.
    pub fn push_cstr(remote: &'b mut AutoRemoteSyscalls<'a>, s: &str) -> AutoRestoreMem<'a, 'b> {
        let mut data = s.as_bytes().to_vec();
        data.push(0);
        Self::new(remote, &data)
    }

    fn new(remote: &'b mut AutoRemoteSyscalls<'a>, data: &[u8]) -> AutoRestoreMem<'a, 'b> {
        let saved_sp = remote.initial_regs.sp();
        let addr = saved_sp - data.len();
        remote.initial_regs.set_sp(addr);
        let saved_data = remote.task().read_mem(addr, data.len());
        remote.task().write_mem(addr, data);
        AutoRestoreMem {
            remote,
            addr,
            saved_data,
            saved_sp,
        }
    }

    /// Tracee address of the pushed bytes.
    pub fn get(&self) -> RemotePtr<Void> {
        self.addr
    }
}

impl<'a, 'b> Drop for AutoRestoreMem<'a, 'b> {
    fn drop(&mut self) {
        // LIFO: nothing pushed after us may still be live.
        ed_assert_eq!(self.remote.task(), self.remote.initial_regs.sp(), self.addr);
        self.remote.task().write_mem(self.addr, &self.saved_data);
        self.remote.initial_regs.set_sp(self.saved_sp);
    }
}

impl<'a, 'b> Deref for AutoRestoreMem<'a, 'b> {
    type Target = AutoRemoteSyscalls<'a>;

    fn deref(&self) -> &Self::Target {
        self.remote
    }
}

impl<'a, 'b> DerefMut for AutoRestoreMem<'a, 'b> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.remote
    }
}

/// Change the protection of the segment containing `addr`, from the page
/// containing `addr` to the end of the segment. MAP_GROWSDOWN segments
/// can grow without updating /proc/<tid>/maps, so the containing
/// segment's bounds are looked up fresh.
pub fn mprotect_child_region(
    remote: &mut AutoRemoteSyscalls,
    addr: RemotePtr<Void>,
    prot: ProtFlags,
) {
    let addr = floor_page_size_remote(addr);
    let km = match find_segment_containing(remote.task(), addr) {
        Some(km) => km,
        None => fatal!("No mapping contains {}", addr),
    };
    let length = km.end() - addr;
    let ret = remote.syscall(
        libc::SYS_mprotect,
        &[addr.as_usize(), length, prot.bits() as usize],
    );
    ed_assert_eq!(remote.task(), ret, 0, "mprotect({}, {}) failed", addr, length);
}
