use crate::log::{LogError, LogInfo};
use crate::remote_ptr::{RemotePtr, Void};
use crate::task::Task;
use std::fmt;
use std::io::Write;
use std::mem::zeroed;

/// How to react to a divergence found while comparing two register files
/// or two memory checksums. Only the relative order of the variants is
/// meaningful: anything >= LogMismatches prints, anything >=
/// BailOnMismatch aborts.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Debug)]
pub enum MismatchBehavior {
    ExpectMismatches,
    LogMismatches,
    BailOnMismatch,
}

/* The following are eflags that have been observed to be nondeterministic
 * in practice. We need to mask them off when comparing registers to
 * prevent replay from diverging. */

/// The linux kernel has been observed to report this as zero in some
/// states during system calls. It always seems to be 1 during user-space
/// execution so we should be able to ignore it.
pub const X86_RESERVED_FLAG_1: u64 = 1 << 1;
/// The RF flag temporarily disables debug exceptions so an instruction
/// can be restarted after one without immediately raising another. It
/// appears to be set by `int3` breakpoints, which replay uses to reach
/// execution targets but recording never does.
pub const X86_RESUME_FLAG: u64 = 1 << 16;
/// The ID flag. It's no longer known why this bit is ignored.
pub const X86_CPUID_ENABLED_FLAG: u64 = 1 << 21;

const DETERMINISTIC_FLAGS_MASK: u64 =
    !(X86_RESERVED_FLAG_1 | X86_RESUME_FLAG | X86_CPUID_ENABLED_FLAG);

bitflags! {
    /// One bit per register field that can diverge between two register
    /// files. The flags register is compared (masked) as a single field.
    pub struct RegMismatch: u32 {
        const RAX    = 1 << 0;
        const RBX    = 1 << 1;
        const RCX    = 1 << 2;
        const RDX    = 1 << 3;
        const RSI    = 1 << 4;
        const RDI    = 1 << 5;
        const RBP    = 1 << 6;
        const RSP    = 1 << 7;
        const R8     = 1 << 8;
        const R9     = 1 << 9;
        const R10    = 1 << 10;
        const R11    = 1 << 11;
        const R12    = 1 << 12;
        const R13    = 1 << 13;
        const R14    = 1 << 14;
        const R15    = 1 << 15;
        const RIP    = 1 << 16;
        const RFLAGS = 1 << 17;
    }
}

/// An x86_64 general-purpose register file captured from a tracee.
#[derive(Copy, Clone)]
pub struct Registers {
    u: libc::user_regs_struct,
}

impl Registers {
    pub fn from_ptrace(regs: libc::user_regs_struct) -> Registers {
        Registers { u: regs }
    }

    pub fn get_ptrace(&self) -> libc::user_regs_struct {
        self.u
    }

    pub fn ip(&self) -> RemotePtr<Void> {
        RemotePtr::new_from_val(self.u.rip as usize)
    }

    pub fn set_ip(&mut self, addr: RemotePtr<Void>) {
        self.u.rip = addr.as_usize() as u64;
    }

    pub fn sp(&self) -> RemotePtr<Void> {
        RemotePtr::new_from_val(self.u.rsp as usize)
    }

    pub fn set_sp(&mut self, addr: RemotePtr<Void>) {
        self.u.rsp = addr.as_usize() as u64;
    }

    /// The syscall number register (rax), as loaded before a syscall
    /// instruction executes.
    pub fn syscallno(&self) -> i64 {
        self.u.rax as i64
    }

    pub fn set_syscallno(&mut self, syscallno: i64) {
        self.u.rax = syscallno as u64;
    }

    /// The syscall number the kernel latched at syscall entry (orig_rax).
    /// This is what identifies the syscall at entry and exit traps, after
    /// rax has been clobbered by the kernel.
    pub fn original_syscallno(&self) -> i64 {
        self.u.orig_rax as i64
    }

    pub fn syscall_result(&self) -> usize {
        self.u.rax as usize
    }

    pub fn syscall_result_signed(&self) -> isize {
        self.u.rax as isize
    }

    pub fn set_syscall_result(&mut self, result: usize) {
        self.u.rax = result as u64;
    }

    /// First syscall argument register (rdi).
    pub fn arg1(&self) -> usize {
        self.u.rdi as usize
    }

    /// Load up to six arguments into the x86_64 syscall argument
    /// registers rdi, rsi, rdx, r10, r8, r9. Missing arguments are zeroed
    /// so stale tracee values can't leak into the injected call.
    pub fn set_syscall_args(&mut self, args: &[usize]) {
        debug_assert!(args.len() <= 6);
        let mut padded = [0usize; 6];
        padded[..args.len()].copy_from_slice(args);
        self.u.rdi = padded[0] as u64;
        self.u.rsi = padded[1] as u64;
        self.u.rdx = padded[2] as u64;
        self.u.r10 = padded[3] as u64;
        self.u.r8 = padded[4] as u64;
        self.u.r9 = padded[5] as u64;
    }

    pub fn flags(&self) -> u64 {
        self.u.eflags
    }

    pub fn set_flags(&mut self, value: u64) {
        self.u.eflags = value;
    }

    /// Write all fields in a fixed order, for the fatal-mismatch diff.
    pub fn write_register_file(&self, out: &mut dyn Write) -> std::io::Result<()> {
        writeln!(out, "Printing register file:")?;
        writeln!(out, "rax: {:x}", self.u.rax)?;
        writeln!(out, "rbx: {:x}", self.u.rbx)?;
        writeln!(out, "rcx: {:x}", self.u.rcx)?;
        writeln!(out, "rdx: {:x}", self.u.rdx)?;
        writeln!(out, "rsi: {:x}", self.u.rsi)?;
        writeln!(out, "rdi: {:x}", self.u.rdi)?;
        writeln!(out, "rbp: {:x}", self.u.rbp)?;
        writeln!(out, "rsp: {:x}", self.u.rsp)?;
        writeln!(out, "r8:  {:x}", self.u.r8)?;
        writeln!(out, "r9:  {:x}", self.u.r9)?;
        writeln!(out, "r10: {:x}", self.u.r10)?;
        writeln!(out, "r11: {:x}", self.u.r11)?;
        writeln!(out, "r12: {:x}", self.u.r12)?;
        writeln!(out, "r13: {:x}", self.u.r13)?;
        writeln!(out, "r14: {:x}", self.u.r14)?;
        writeln!(out, "r15: {:x}", self.u.r15)?;
        writeln!(out, "rip: {:x}", self.u.rip)?;
        writeln!(out, "eflags: {:x}", self.u.eflags)?;
        writeln!(out, "orig_rax: {:x}", self.u.orig_rax)
    }
}

impl Default for Registers {
    fn default() -> Self {
        Registers {
            // user_regs_struct is plain old data.
            u: unsafe { zeroed() },
        }
    }
}

impl fmt::Debug for Registers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Registers {{ rip: {:#x}, rsp: {:#x}, rax: {:#x} }}",
            self.u.rip, self.u.rsp, self.u.rax
        )
    }
}

fn maybe_log_reg_mismatch(
    mismatch_behavior: MismatchBehavior,
    regname: &str,
    label1: &str,
    val1: u64,
    label2: &str,
    val2: u64,
) {
    if mismatch_behavior >= MismatchBehavior::BailOnMismatch {
        log!(
            LogError,
            "{} {:#x} != {:#x} ({} vs. {})",
            regname,
            val1,
            val2,
            label1,
            label2
        );
    } else if mismatch_behavior >= MismatchBehavior::LogMismatches {
        log!(
            LogInfo,
            "{} {:#x} != {:#x} ({} vs. {})",
            regname,
            val1,
            val2,
            label1,
            label2
        );
    }
}

/// Compare two register files field by field, returning a mask with one
/// bit set per mismatching field. The flags register is compared with the
/// known-nondeterministic bits masked off. With BailOnMismatch, any
/// nonzero result aborts after the per-field diff has been printed.
///
/// `maybe_t` provides task context for the fatal diagnostic when the
/// caller has one.
pub fn compare_register_files(
    maybe_t: Option<&Task>,
    name1: &str,
    reg1: &Registers,
    name2: &str,
    reg2: &Registers,
    mismatch_behavior: MismatchBehavior,
) -> RegMismatch {
    let mut err = RegMismatch::empty();

    macro_rules! regcmp {
        ($field:ident, $bit:ident) => {
            if reg1.u.$field != reg2.u.$field {
                maybe_log_reg_mismatch(
                    mismatch_behavior,
                    stringify!($field),
                    name1,
                    reg1.u.$field,
                    name2,
                    reg2.u.$field,
                );
                err |= RegMismatch::$bit;
            }
        };
    }

    regcmp!(rax, RAX);
    regcmp!(rbx, RBX);
    regcmp!(rcx, RCX);
    regcmp!(rdx, RDX);
    regcmp!(rsi, RSI);
    regcmp!(rdi, RDI);
    regcmp!(rbp, RBP);
    regcmp!(rsp, RSP);
    regcmp!(r8, R8);
    regcmp!(r9, R9);
    regcmp!(r10, R10);
    regcmp!(r11, R11);
    regcmp!(r12, R12);
    regcmp!(r13, R13);
    regcmp!(r14, R14);
    regcmp!(r15, R15);
    regcmp!(rip, RIP);

    // Check the deterministic eflags.
    let flags1 = reg1.flags() & DETERMINISTIC_FLAGS_MASK;
    let flags2 = reg2.flags() & DETERMINISTIC_FLAGS_MASK;
    if flags1 != flags2 {
        maybe_log_reg_mismatch(
            mismatch_behavior,
            "deterministic eflags",
            name1,
            flags1,
            name2,
            flags2,
        );
        err |= RegMismatch::RFLAGS;
    }

    if !err.is_empty() && mismatch_behavior >= MismatchBehavior::BailOnMismatch {
        let stderr = std::io::stderr();
        let mut out = stderr.lock();
        reg1.write_register_file(&mut out).unwrap_or(());
        reg2.write_register_file(&mut out).unwrap_or(());
        drop(out);
        match maybe_t {
            Some(t) => ed_assert!(t, false, "Fatal register mismatch ({:?})", err),
            None => fatal!("Fatal register mismatch ({:?})", err),
        }
    }

    if err.is_empty() && mismatch_behavior == MismatchBehavior::LogMismatches {
        log!(
            LogInfo,
            "(register files are the same for {} and {})",
            name1,
            name2
        );
    }

    err
}

#[cfg(test)]
mod tests {
    use super::*;
    use MismatchBehavior::*;

    fn regs() -> Registers {
        let mut r = Registers::default();
        r.u.rax = 0x1111;
        r.u.rbx = 0x2222;
        r.u.rsp = 0x7fff_0000;
        r.u.rip = 0x40_0000;
        r.u.eflags = 0x246;
        r
    }

    #[test]
    fn identical_files_match() {
        let a = regs();
        let b = a;
        let err = compare_register_files(None, "a", &a, "b", &b, ExpectMismatches);
        assert!(err.is_empty());
    }

    #[test]
    fn single_gpr_mismatch_sets_single_bit() {
        let a = regs();
        let mut b = a;
        b.u.rbx += 1;
        let err = compare_register_files(None, "a", &a, "b", &b, ExpectMismatches);
        assert_eq!(err, RegMismatch::RBX);
    }

    #[test]
    fn masked_flag_bits_are_ignored() {
        let a = regs();
        for bit in &[X86_RESERVED_FLAG_1, X86_RESUME_FLAG, X86_CPUID_ENABLED_FLAG] {
            let mut b = a;
            b.u.eflags ^= bit;
            let err = compare_register_files(None, "a", &a, "b", &b, ExpectMismatches);
            assert!(err.is_empty(), "flag bit {:#x} should be masked", bit);
        }
    }

    #[test]
    fn unmasked_flag_bit_sets_flags_bit() {
        let a = regs();
        let mut b = a;
        b.u.eflags ^= 1 << 11; // OF
        let err = compare_register_files(None, "a", &a, "b", &b, ExpectMismatches);
        assert_eq!(err, RegMismatch::RFLAGS);
    }

    #[test]
    fn syscall_args_are_zero_padded() {
        let mut r = Registers::default();
        r.u.r9 = 0xdead;
        r.set_syscall_args(&[1, 2, 3]);
        assert_eq!(r.u.rdi, 1);
        assert_eq!(r.u.rsi, 2);
        assert_eq!(r.u.rdx, 3);
        assert_eq!(r.u.r10, 0);
        assert_eq!(r.u.r9, 0);
    }
}
