//! The low-level engine behind a deterministic record-and-replay debugger.
//!
//! This crate provides the mechanism, not the policy: remote syscall
//! injection into a stopped tracee (`auto_remote_syscalls`), memory-map
//! enumeration and checksumming for divergence detection (`address_space`,
//! `checksum`), register-file comparison (`registers`), and the
//! shared-memory syscall-buffer bootstrap handshake (`syscallbuf`).
//! The recorder/replayer control loops that decide *when* to call into
//! this engine live elsewhere.

#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate memoffset;
#[macro_use]
extern crate static_assertions;

#[macro_use]
pub mod log;
pub mod address_space;
pub mod auto_remote_syscalls;
pub mod checksum;
pub mod config;
pub mod kernel_metadata;
pub mod registers;
pub mod remote_ptr;
pub mod scoped_fd;
pub mod scratch;
pub mod syscallbuf;
pub mod task;
pub mod trace_dir;
pub mod util;
pub mod wait_status;
