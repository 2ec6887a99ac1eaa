//! Bootstrap of the shared syscall buffer between host and tracee.
//!
//! When the preload library starts up inside the tracee it issues a
//! private "init buffers" call and blocks, all signals masked, with its
//! parameter block address in arg1. `init_buffers` services that call:
//! it rendezvouses with the tracee over a unix socket named for the
//! *recorded* tid, exchanges fds by SCM_RIGHTS, and maps one shmem
//! segment into both address spaces.

use crate::auto_remote_syscalls::AutoRemoteSyscalls;
use crate::kernel_metadata::errno_name;
use crate::remote_ptr::{RemotePtr, Void};
use crate::scoped_fd::ScopedFd;
use crate::task::Task;
use crate::util::{resize_shmem_segment, u8_slice, u8_slice_mut};
use libc::pid_t;
use nix::fcntl::OFlag;
use nix::sys::mman::{mmap, MapFlags, ProtFlags};
use nix::sys::socket::{
    accept, bind, listen, recvmsg, sendmsg, socket, AddressFamily, ControlMessage,
    ControlMessageOwned, MsgFlags, SockAddr, SockFlag, SockType, UnixAddr,
};
use nix::sys::stat::Mode;
use nix::sys::uio::IoVec;
use nix::unistd::unlink;
use std::mem::size_of;
use std::os::unix::io::RawFd;
use std::ptr;

pub const SYSCALLBUF_BUFFER_SIZE: usize = 1 << 20;

/// Mappings of the shared buffer are recognized in /proc maps output by
/// this fsname prefix.
pub const SYSCALLBUF_SHMEM_PATH_PREFIX: &str = "/dev/shm/rde-tracee-shmem-";

/// During replay the desched event fd is not shared; the tracee is given
/// this sentinel instead so its fd table layout stays identical to
/// recording.
pub const REPLAY_DESCHED_EVENT_FD: i32 = -123;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum DeschedEventSharing {
    Share,
    DontShare,
}

/// Three-slot argument staging block inside the tracee. On x86_64 the
/// socket calls take their arguments in registers, but the preload
/// protocol still stages them in tracee memory; we keep writing (and
/// finally zeroing) the block so the tracee-visible bytes are identical
/// across record and replay.
#[repr(C)]
#[derive(Copy, Clone, Default, Debug)]
#[allow(non_camel_case_types)]
pub struct socketcall_args {
    pub args: [u64; 3],
}

/// Parameter block of the tracee's init-buffers call. In/out; pointers
/// are tracee addresses, stored as u64 to keep the layout fixed.
#[repr(C)]
#[derive(Copy, Clone, Debug)]
#[allow(non_camel_case_types)]
pub struct rdecall_init_buffers_params {
    /// In: tracee address of the sockaddr_un it will connect() with.
    pub sockaddr: u64,
    /// In: tracee address of the msghdr used for fd passing.
    pub msg: u64,
    /// In: tracee address of the int slot the received fd lands in.
    pub fdptr: u64,
    /// In: tracee address of the argument staging block.
    pub args_vec: u64,
    /// In: entry ip of the untraced syscall in the preload library.
    pub untraced_syscall_ip: u64,
    /// Out: the tracee's scratch region.
    pub scratch_ptr: u64,
    pub num_scratch_bytes: u64,
    /// Out: where the syscall buffer got mapped in the tracee.
    pub syscallbuf_ptr: u64,
    pub num_syscallbuf_bytes: u64,
    /// In: nonzero when the tracee was launched with buffering enabled.
    pub syscallbuf_enabled: i32,
    pub _padding: i32,
}

/// One buffered syscall. Variable-length: extra recorded outparam data
/// is stored inline after the struct.
#[repr(C)]
#[derive(Copy, Clone, Default, Debug)]
#[allow(non_camel_case_types)]
pub struct syscallbuf_record {
    /// Return value from the syscall. Can be a memory address, so must
    /// be as big as one.
    pub ret: i64,
    pub syscallno: u16,
    /// Did the tracee arm/disarm the desched notification for this
    /// syscall?
    pub desched: u8,
    pub _padding: u8,
    /// Size of the whole record in bytes, this struct plus the inline
    /// extra data, not including alignment padding.
    pub size: u32,
}

/// Header at the start of the shared buffer, followed by the records.
#[repr(C)]
#[derive(Copy, Clone, Default, Debug)]
#[allow(non_camel_case_types)]
pub struct syscallbuf_hdr {
    /// Number of valid record bytes in the buffer, not counting this
    /// header.
    pub num_rec_bytes: u32,
    /// Nonzero while the tracee holds the buffer lock.
    pub locked: u8,
    /// Set when the in-progress record must be discarded.
    pub abort_commit: u8,
    pub _padding: [u8; 2],
}

const_assert_eq!(size_of::<socketcall_args>(), 24);
const_assert_eq!(size_of::<syscallbuf_record>(), 16);
const_assert_eq!(size_of::<syscallbuf_hdr>(), 8);
const_assert_eq!(size_of::<rdecall_init_buffers_params>(), 80);

/// The rendezvous socket name is derived from the *recorded* tid: the
/// sockaddr was prepared by the tracee before recording diverged from
/// replay, so both runs must compute the same name.
pub fn syscallbuf_socket_path(rec_tid: pid_t) -> String {
    format!("/tmp/rde-tracee-rendezvous-{}", rec_tid)
}

fn shmem_path(tid: pid_t) -> String {
    format!("{}{}", SYSCALLBUF_SHMEM_PATH_PREFIX, tid)
}

fn write_staged_socket_args(
    t: &Task,
    args_vec: RemotePtr<socketcall_args>,
    arg1: u64,
    arg2: u64,
    arg3: u64,
) {
    let args = socketcall_args {
        args: [arg1, arg2, arg3],
    };
    t.write_val(args_vec, &args);
}

/// Share `fd` to the other side of `sock`.
fn send_fd(fd: RawFd, sock: RawFd) {
    // We must always send the same payload value so that
    // nondeterministic values, like fd numbers in this process, don't
    // leak into the tracee's address space.
    let dummy_fd: i32 = 0;
    let iov = [IoVec::from_slice(u8_slice(&dummy_fd))];
    let fds = [fd];
    let cmsg = [ControlMessage::ScmRights(&fds)];
    match sendmsg(sock, &iov, &cmsg, MsgFlags::empty(), None) {
        Ok(nsent) if nsent > 0 => (),
        _ => fatal!("Failed to send fd"),
    }
}

/// Block until the other side of `sock` shares an fd with us. Returns
/// the received fd (valid in this address space) and the fd number the
/// sender knows it by.
fn recv_fd(sock: RawFd) -> (ScopedFd, i32) {
    let mut remote_fd: i32 = -1;
    let fd = {
        let iov = [IoVec::from_mut_slice(u8_slice_mut(&mut remote_fd))];
        let mut cmsgspace = nix::cmsg_space!(RawFd);
        let msg = match recvmsg(sock, &iov, Some(&mut cmsgspace), MsgFlags::empty()) {
            Ok(msg) if msg.bytes > 0 => msg,
            _ => fatal!("Failed to receive fd"),
        };
        let mut received: Option<RawFd> = None;
        for cmsg in msg.cmsgs() {
            if let ControlMessageOwned::ScmRights(fds) = cmsg {
                received = fds.first().copied();
            }
        }
        match received {
            Some(fd) => fd,
            None => fatal!("Expected SCM_RIGHTS control message"),
        }
    };
    (ScopedFd::from_raw(fd), remote_fd)
}

fn init_syscall_buffer(
    remote: &mut AutoRemoteSyscalls,
    args: &mut rdecall_init_buffers_params,
    map_hint: RemotePtr<Void>,
    share_desched_fd: DeschedEventSharing,
) -> RemotePtr<Void> {
    remote.task_mut().untraced_syscall_ip =
        RemotePtr::new_from_val(args.untraced_syscall_ip as usize);
    let args_vec = RemotePtr::<socketcall_args>::new_from_val(args.args_vec as usize);
    let fdptr = RemotePtr::<i32>::new_from_val(args.fdptr as usize);

    let shmem_filename = shmem_path(remote.task().tid);
    let sock_path = syscallbuf_socket_path(remote.task().rec_tid);

    // Create the segment we'll share with the tracee.
    let shmem_fd = ScopedFd::open_path_with_mode(
        shmem_filename.as_str(),
        OFlag::O_CREAT | OFlag::O_RDWR,
        Mode::from_bits_truncate(0o640),
    );
    if !shmem_fd.is_open() {
        fatal!("Failed to open shmem file {}", shmem_filename);
    }
    // Remove the fs name; we're about to "anonymously" share our fd to
    // the tracee.
    unlink(shmem_filename.as_str()).unwrap_or(());
    resize_shmem_segment(&shmem_fd, SYSCALLBUF_BUFFER_SIZE);

    // Bind the server socket, but don't start listening yet.
    let listen_sock = match socket(
        AddressFamily::Unix,
        SockType::Stream,
        SockFlag::empty(),
        None,
    ) {
        Ok(fd) => ScopedFd::from_raw(fd),
        Err(e) => fatal!("Failed to create listen socket: {}", e),
    };
    let addr = match UnixAddr::new(sock_path.as_str()) {
        Ok(addr) => addr,
        Err(e) => fatal!("Bad rendezvous socket path {}: {}", sock_path, e),
    };
    if bind(listen_sock.as_raw(), &SockAddr::Unix(addr)).is_err() {
        fatal!("Failed to bind listen socket {}", sock_path);
    }
    if listen(listen_sock.as_raw(), 1).is_err() {
        fatal!("Failed to mark listening for listen socket");
    }

    // Initiate the tracee's connect(), but don't wait for it to finish:
    // it can't complete until we accept().
    write_staged_socket_args(
        remote.task(),
        args_vec,
        libc::AF_UNIX as u64,
        libc::SOCK_STREAM as u64,
        0,
    );
    let child_sock = remote.syscall(
        libc::SYS_socket,
        &[libc::AF_UNIX as usize, libc::SOCK_STREAM as usize, 0],
    );
    if child_sock < 0 {
        fatal!(
            "Failed to create child socket: {}",
            errno_name(-child_sock as i32)
        );
    }
    write_staged_socket_args(
        remote.task(),
        args_vec,
        child_sock as u64,
        args.sockaddr,
        size_of::<libc::sockaddr_un>() as u64,
    );
    remote.syscall_nowait(
        libc::SYS_connect,
        &[
            child_sock as usize,
            args.sockaddr as usize,
            size_of::<libc::sockaddr_un>(),
        ],
    );
    // Now the child is waiting for us to accept it.

    let sock = match accept(listen_sock.as_raw()) {
        Ok(fd) => ScopedFd::from_raw(fd),
        Err(e) => fatal!("Failed to accept() tracee connection: {}", e),
    };
    let child_ret = remote.wait_syscall(libc::SYS_connect);
    if child_ret != 0 {
        fatal!(
            "Failed to connect() in tracee: {}",
            errno_name(-child_ret as i32)
        );
    }
    // Socket name not needed anymore.
    unlink(sock_path.as_str()).unwrap_or(());

    if share_desched_fd == DeschedEventSharing::Share {
        // Pull the puppet strings to have the child share its desched
        // counter with us. As with connect above, DON'T WAIT on the call
        // to finish, since it's not defined whether the sendmsg() may
        // block on our recvmsg()ing what the tracee sent us (in which
        // case we would deadlock with the tracee).
        write_staged_socket_args(remote.task(), args_vec, child_sock as u64, args.msg, 0);
        remote.syscall_nowait(
            libc::SYS_sendmsg,
            &[child_sock as usize, args.msg as usize, 0],
        );
        // Child may be waiting on our recvmsg().

        let (desched_fd, desched_fd_child) = recv_fd(sock.as_raw());
        remote.task_mut().desched_fd = desched_fd;
        remote.task_mut().desched_fd_child = desched_fd_child;
        let child_ret = remote.wait_syscall(libc::SYS_sendmsg);
        if child_ret <= 0 {
            fatal!(
                "Failed to sendmsg() in tracee: {}",
                errno_name(-child_ret as i32)
            );
        }
    } else {
        remote.task_mut().desched_fd_child = REPLAY_DESCHED_EVENT_FD;
    }

    // Share the shmem fd with the child. It's ok to reuse the tracee's
    // msghdr scratch.
    send_fd(shmem_fd.as_raw(), sock.as_raw());
    write_staged_socket_args(remote.task(), args_vec, child_sock as u64, args.msg, 0);
    let child_ret = remote.syscall(
        libc::SYS_recvmsg,
        &[child_sock as usize, args.msg as usize, 0],
    );
    if child_ret <= 0 {
        fatal!(
            "Failed to recvmsg() shared fd in tracee: {}",
            errno_name(-child_ret as i32)
        );
    }

    // Get the newly-allocated fd.
    let child_shmem_fd: i32 = remote.task().read_val(fdptr);

    // Zero out the tracee buffers we used here. They contain "real"
    // fds, which in general will not be the same across record/replay.
    write_staged_socket_args(remote.task(), args_vec, 0, 0, 0);
    remote.task().write_val(fdptr, &0i32);

    // Socket magic is now done.
    drop(listen_sock);
    drop(sock);
    remote.syscall(libc::SYS_close, &[child_sock as usize]);

    // Map the segment in our address space and in the tracee's.
    let prot = ProtFlags::PROT_READ | ProtFlags::PROT_WRITE;
    let map_addr = match unsafe {
        mmap(
            ptr::null_mut(),
            SYSCALLBUF_BUFFER_SIZE,
            prot,
            MapFlags::MAP_SHARED,
            shmem_fd.as_raw(),
            0,
        )
    } {
        Ok(addr) => addr,
        Err(e) => fatal!("Failed to mmap shmem region: {}", e),
    };
    args.num_syscallbuf_bytes = SYSCALLBUF_BUFFER_SIZE as u64;
    remote.task_mut().num_syscallbuf_bytes = SYSCALLBUF_BUFFER_SIZE;
    let child_map_addr = remote.syscall(
        libc::SYS_mmap,
        &[
            map_hint.as_usize(),
            SYSCALLBUF_BUFFER_SIZE,
            prot.bits() as usize,
            MapFlags::MAP_SHARED.bits() as usize,
            child_shmem_fd as usize,
            0,
        ],
    );
    if child_map_addr < 0 {
        fatal!(
            "Failed to mmap shmem region in tracee: {}",
            errno_name(-child_map_addr as i32)
        );
    }
    let child_map_addr = RemotePtr::<Void>::new_from_val(child_map_addr as usize);
    args.syscallbuf_ptr = child_map_addr.as_usize() as u64;
    remote.task_mut().syscallbuf_child = child_map_addr;
    remote.task_mut().syscallbuf_local = map_addr as *mut u8;
    // No entries to begin with.
    unsafe {
        ptr::write_bytes(map_addr as *mut u8, 0, size_of::<syscallbuf_hdr>());
    }

    drop(shmem_fd);
    remote.syscall(libc::SYS_close, &[child_shmem_fd as usize]);

    child_map_addr
}

/// Service the tracee's init-buffers call. The tracee is stopped at the
/// entry of that call with the parameter block address in arg1, and has
/// masked off all signals, so a remote-syscall session is safe.
///
/// Returns the tracee address the buffer was mapped at (null when
/// buffering is disabled). The address is also planted in the call's
/// result register so replay can verify the segment lands at the
/// recorded address.
pub fn init_buffers(
    t: &mut Task,
    map_hint: RemotePtr<Void>,
    share_desched_fd: DeschedEventSharing,
) -> RemotePtr<Void> {
    let mut remote = AutoRemoteSyscalls::new(t);

    let child_args =
        RemotePtr::<rdecall_init_buffers_params>::new_from_val(remote.initial_regs.arg1());
    let mut args: rdecall_init_buffers_params = remote.task().read_val(child_args);

    args.scratch_ptr = remote.task().scratch_ptr.as_usize() as u64;
    args.num_scratch_bytes = remote.task().scratch_size as u64;
    let child_map_addr = if args.syscallbuf_enabled != 0 {
        init_syscall_buffer(&mut remote, &mut args, map_hint, share_desched_fd)
    } else {
        args.syscallbuf_ptr = 0;
        args.num_syscallbuf_bytes = 0;
        RemotePtr::null()
    };

    // Return the mapped buffers to the child.
    remote.task().write_val(child_args, &args);

    remote.initial_regs.set_syscall_result(child_map_addr.as_usize());
    child_map_addr
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};

    #[test]
    fn rendezvous_path_is_deterministic_in_rec_tid() {
        assert_eq!(
            syscallbuf_socket_path(42),
            syscallbuf_socket_path(42)
        );
        assert_eq!(syscallbuf_socket_path(42), "/tmp/rde-tracee-rendezvous-42");
        assert_ne!(syscallbuf_socket_path(42), syscallbuf_socket_path(43));
    }

    #[test]
    fn desched_sentinel_is_stable() {
        assert_eq!(REPLAY_DESCHED_EVENT_FD, -123);
    }

    #[test]
    fn header_layout() {
        assert_eq!(offset_of!(syscallbuf_hdr, num_rec_bytes), 0);
        assert_eq!(offset_of!(syscallbuf_record, ret), 0);
        assert_eq!(offset_of!(syscallbuf_record, size), 12);
        assert_eq!(offset_of!(rdecall_init_buffers_params, syscallbuf_enabled), 72);
    }

    #[test]
    fn fd_passing_round_trip() {
        let (a, b) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::empty(),
        )
        .unwrap();
        let devnull = ScopedFd::open_path("/dev/null", OFlag::O_RDONLY);
        assert!(devnull.is_open());

        send_fd(devnull.as_raw(), a);
        let (received, payload) = recv_fd(b);
        assert!(received.is_open());
        // The wire payload is a constant, never the sender's fd number.
        assert_eq!(payload, 0);
        assert_ne!(received.as_raw(), devnull.as_raw());

        nix::unistd::close(a).unwrap();
        nix::unistd::close(b).unwrap();
    }
}
