//! Operation table: the tagged union of awaiter kinds.
//!
//! Every awaiter carries an [`OpSpec`] describing the kernel operation and
//! its parameters; [`build_entry`] is the single place that turns a spec
//! into a typed submission entry. The `*_direct` variants run against the
//! registered-file table instead of per-op fd lookup.

use io_uring::{opcode, squeue, types};
use std::os::unix::io::RawFd;

/// One kernel operation, parameters in syscall order. Raw pointers point
/// into the awaiter frame or its borrowed buffers, which outlive the
/// submission (awaiter lifetime is tied to the suspended task frame).
pub enum OpSpec {
    Read {
        fd: RawFd,
        buf: *mut u8,
        len: u32,
        offset: u64,
    },
    Write {
        fd: RawFd,
        buf: *const u8,
        len: u32,
        offset: u64,
    },
    Writev {
        fd: RawFd,
        iov: *const libc::iovec,
        nr: u32,
        offset: u64,
    },
    Accept {
        fd: RawFd,
        addr: *mut libc::sockaddr,
        addrlen: *mut libc::socklen_t,
        flags: i32,
    },
    ReadDirect {
        index: u32,
        buf: *mut u8,
        len: u32,
        offset: u64,
    },
    WriteDirect {
        index: u32,
        buf: *const u8,
        len: u32,
        offset: u64,
    },
    WritevDirect {
        index: u32,
        iov: *const libc::iovec,
        nr: u32,
        offset: u64,
    },
    AcceptDirect {
        fd: RawFd,
        addr: *mut libc::sockaddr,
        addrlen: *mut libc::socklen_t,
        flags: i32,
    },
    CloseDirect {
        index: u32,
    },
    CancelFd {
        fd: RawFd,
    },
    /// Standalone timer; the timespec lives in the awaiter frame.
    Timeout,
}

/// Build the submission entry for `spec`. `ts` is the awaiter's timespec
/// storage, used by the `Timeout` variant.
pub(crate) fn build_entry(spec: &OpSpec, ts: &types::Timespec) -> squeue::Entry {
    match *spec {
        OpSpec::Read { fd, buf, len, offset } => opcode::Read::new(types::Fd(fd), buf, len)
            .offset(offset)
            .build(),
        OpSpec::Write { fd, buf, len, offset } => opcode::Write::new(types::Fd(fd), buf, len)
            .offset(offset)
            .build(),
        OpSpec::Writev { fd, iov, nr, offset } => opcode::Writev::new(types::Fd(fd), iov, nr)
            .offset(offset)
            .build(),
        OpSpec::Accept { fd, addr, addrlen, flags } => {
            opcode::Accept::new(types::Fd(fd), addr, addrlen)
                .flags(flags)
                .build()
        }
        OpSpec::ReadDirect { index, buf, len, offset } => {
            opcode::Read::new(types::Fixed(index), buf, len)
                .offset(offset)
                .build()
        }
        OpSpec::WriteDirect { index, buf, len, offset } => {
            opcode::Write::new(types::Fixed(index), buf, len)
                .offset(offset)
                .build()
        }
        OpSpec::WritevDirect { index, iov, nr, offset } => {
            opcode::Writev::new(types::Fixed(index), iov, nr)
                .offset(offset)
                .build()
        }
        OpSpec::AcceptDirect { fd, addr, addrlen, flags } => {
            opcode::Accept::new(types::Fd(fd), addr, addrlen)
                .flags(flags)
                .file_index(Some(types::DestinationSlot::auto_target()))
                .build()
        }
        OpSpec::CloseDirect { index } => opcode::Close::new(types::Fixed(index)).build(),
        OpSpec::CancelFd { fd } => {
            opcode::AsyncCancel2::new(types::CancelBuilder::fd(types::Fd(fd))).build()
        }
        OpSpec::Timeout => opcode::Timeout::new(ts as *const types::Timespec).build(),
    }
}
