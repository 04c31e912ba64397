//! Operation encoders.
//!
//! Each opcode is a small builder that fills the fields the kernel
//! documents for it and produces a [`squeue::Entry`](crate::squeue::Entry).
//! The `user_data` field is left untouched; the engine assigns the
//! completion token at staging time.

#![allow(clippy::new_without_default)]

use std::os::unix::io::RawFd;

use crate::squeue::Entry;
use crate::sys;

pub use sys::open_how as OpenHow;
pub use sys::__kernel_timespec as Timespec;

macro_rules! assign_fd {
    ( $sqe:ident . fd = $opfd:expr ) => {
        match $opfd {
            Target::Fd(fd) => $sqe.fd = fd,
            Target::Fixed(i) => {
                $sqe.fd = i as _;
                $sqe.flags |= crate::squeue::Flags::FIXED_FILE.bits();
            }
        }
    };
}

macro_rules! opcode {
    (
        $( #[$outer:meta] )*
        pub struct $name:ident {
            $( #[$new_meta:meta] )*
            $( $field:ident : $tname:ty ),* $(,)?
            ;;
            $(
                $( #[$opt_meta:meta] )*
                $opt_field:ident : $opt_tname:ty = $default:expr
            ),* $(,)?
        }
    ) => {
        $( #[$outer] )*
        pub struct $name {
            $( $field : $tname, )*
            $( $opt_field : $opt_tname, )*
        }

        impl $name {
            $( #[$new_meta] )*
            pub const fn new( $( $field : $tname ),* ) -> Self {
                $name {
                    $( $field , )*
                    $( $opt_field: $default, )*
                }
            }

            $(
                $( #[$opt_meta] )*
                pub const fn $opt_field(mut self, $opt_field: $opt_tname) -> Self {
                    self.$opt_field = $opt_field;
                    self
                }
            )*
        }
    }
}

/// How an operation names its file.
#[derive(Debug, Clone, Copy)]
pub enum Target {
    Fd(RawFd),

    /// The index of a registered fd.
    Fixed(u32),
}

#[inline]
fn sqe_zeroed() -> sys::io_uring_sqe {
    unsafe { std::mem::zeroed() }
}

opcode!(
    /// Do not perform any I/O.
    ///
    /// Useful for testing the engine itself: the completion carries
    /// `result == 0`.
    #[derive(Debug)]
    pub struct Nop { ;; }
);

opcode!(
    /// Vectored read, similar to `preadv2 (2)`.
    ///
    /// The completion result matches the return values documented in the
    /// `preadv2 (2)` man page.
    #[derive(Debug)]
    pub struct Readv {
        fd: Target,
        iovec: *const libc::iovec,
        len: u32,
        ;;
        ioprio: u16 = 0,
        offset: i64 = 0,
        /// A bitwise OR of per-I/O flags, as described in the
        /// `preadv2 (2)` man page.
        rw_flags: i32 = 0
    }
);

opcode!(
    /// Vectored write, similar to `pwritev2 (2)`.
    ///
    /// The completion result matches the return values documented in the
    /// `pwritev2 (2)` man page.
    #[derive(Debug)]
    pub struct Writev {
        fd: Target,
        iovec: *const libc::iovec,
        len: u32,
        ;;
        ioprio: u16 = 0,
        offset: i64 = 0,
        rw_flags: i32 = 0
    }
);

opcode!(
    /// Read into a plain buffer, similar to `pread (2)`.
    #[derive(Debug)]
    pub struct Read {
        fd: Target,
        buf: *mut u8,
        len: u32,
        ;;
        ioprio: u16 = 0,
        offset: i64 = 0,
        rw_flags: i32 = 0
    }
);

opcode!(
    /// Write from a plain buffer, similar to `pwrite (2)`.
    #[derive(Debug)]
    pub struct Write {
        fd: Target,
        buf: *const u8,
        len: u32,
        ;;
        ioprio: u16 = 0,
        offset: i64 = 0,
        rw_flags: i32 = 0
    }
);

opcode!(
    /// Read into a pre-registered buffer.
    #[derive(Debug)]
    pub struct ReadFixed {
        /// `buf_index` is an index into an array of fixed buffers, and is
        /// only valid if fixed buffers were registered.
        fd: Target,
        buf: *mut u8,
        len: u32,
        buf_index: u16,
        ;;
        ioprio: u16 = 0,
        offset: i64 = 0,
        rw_flags: i32 = 0
    }
);

opcode!(
    /// Write from a pre-registered buffer.
    #[derive(Debug)]
    pub struct WriteFixed {
        fd: Target,
        buf: *const u8,
        len: u32,
        buf_index: u16,
        ;;
        ioprio: u16 = 0,
        offset: i64 = 0,
        rw_flags: i32 = 0
    }
);

opcode!(
    /// File sync, see `fsync (2)`.
    ///
    /// Completion order relative to prior writes is not implied; chain with
    /// [`Flags::IO_LINK`](crate::squeue::Flags::IO_LINK) if ordering matters.
    #[derive(Debug)]
    pub struct Fsync {
        fd: Target,
        ;;
        /// 0 for full integrity sync, or `IORING_FSYNC_DATASYNC` for
        /// `fdatasync (2)` semantics.
        flags: u32 = 0
    }
);

opcode!(
    /// One-shot poll of an fd.
    ///
    /// Unlike `poll (2)`, always one-shot: after it completes, it must be
    /// submitted again.
    #[derive(Debug)]
    pub struct PollAdd {
        /// `flags` takes the event bits from `<poll.h>`, as documented in
        /// `poll (2)`.
        fd: Target,
        flags: i16,
        ;;
    }
);

opcode!(
    /// Remove a pending poll request by its completion token.
    ///
    /// Completes with 0 when found, `-ENOENT` otherwise.
    #[derive(Debug)]
    pub struct PollRemove {
        target_token: u64
        ;;
    }
);

opcode!(
    /// `sync_file_range (2)`.
    #[derive(Debug)]
    pub struct SyncFileRange {
        fd: Target,
        len: u32,
        ;;
        offset: i64 = 0,
        flags: u32 = 0
    }
);

opcode!(
    /// `sendmsg (2)`.
    ///
    /// `fd` must be a socket, `msg` a pointer to a `msghdr` that stays
    /// valid for the duration of the operation.
    #[derive(Debug)]
    pub struct SendMsg {
        fd: Target,
        msg: *const libc::msghdr,
        ;;
        ioprio: u16 = 0,
        flags: u32 = 0
    }
);

opcode!(
    /// `recvmsg (2)`.
    ///
    /// See the description of [`SendMsg`].
    #[derive(Debug)]
    pub struct RecvMsg {
        fd: Target,
        msg: *mut libc::msghdr,
        ;;
        ioprio: u16 = 0,
        flags: u32 = 0
    }
);

opcode!(
    /// A timeout operation.
    ///
    /// Completes with `-ETIME` when the timespec expires, or 0 when `count`
    /// other submissions complete first. Canceled timeouts complete with
    /// `-ECANCELED`.
    #[derive(Debug)]
    pub struct Timeout {
        timespec: *const Timespec,
        ;;
        /// Completion-event count that satisfies the timeout; defaults to
        /// expiry only.
        count: u32 = 0,
        /// `IORING_TIMEOUT_ABS` for an absolute timespec, 0 for relative.
        flags: u32 = 0
    }
);

opcode!(
    /// Remove a pending [`Timeout`] by its completion token.
    #[derive(Debug)]
    pub struct TimeoutRemove {
        target_token: u64,
        ;;
        flags: u32 = 0
    }
);

opcode!(
    /// `accept4 (2)`.
    ///
    /// The completion result is the accepted socket's fd, or a negated
    /// errno.
    #[derive(Debug)]
    pub struct Accept {
        fd: Target,
        addr: *mut libc::sockaddr,
        addrlen: *mut libc::socklen_t,
        ;;
        flags: i32 = 0
    }
);

opcode!(
    /// Request cancellation of a pending operation by its completion token.
    ///
    /// Best-effort: the target completes with its own result (typically
    /// `-ECANCELED`), and this operation's result reports whether the
    /// cancellation landed.
    #[derive(Debug)]
    pub struct AsyncCancel {
        target_token: u64
        ;;
    }
);

opcode!(
    /// `connect (2)`.
    #[derive(Debug)]
    pub struct Connect {
        fd: Target,
        addr: *const libc::sockaddr,
        addrlen: libc::socklen_t,
        ;;
    }
);

opcode!(
    /// A timeout bound to the previous linked submission.
    #[derive(Debug)]
    pub struct LinkTimeout {
        timespec: *const Timespec,
        ;;
        flags: u32 = 0
    }
);

opcode!(
    /// `send (2)`.
    #[derive(Debug)]
    pub struct Send {
        fd: Target,
        buf: *const u8,
        len: u32,
        ;;
        flags: i32 = 0
    }
);

opcode!(
    /// `recv (2)`.
    #[derive(Debug)]
    pub struct Recv {
        fd: Target,
        buf: *mut u8,
        len: u32,
        ;;
        flags: i32 = 0
    }
);

opcode!(
    /// `fallocate (2)`.
    #[derive(Debug)]
    pub struct Fallocate {
        fd: Target,
        len: i64,
        ;;
        offset: i64 = 0,
        mode: i32 = 0
    }
);

opcode!(
    /// `openat (2)`.
    ///
    /// The completion result is the opened fd, or a negated errno.
    #[derive(Debug)]
    pub struct OpenAt {
        dirfd: RawFd,
        pathname: *const libc::c_char,
        ;;
        flags: i32 = 0,
        mode: libc::mode_t = 0
    }
);

opcode!(
    /// `openat2 (2)`.
    #[derive(Debug)]
    pub struct OpenAt2 {
        dirfd: RawFd,
        pathname: *const libc::c_char,
        how: *const OpenHow,
        ;;
    }
);

opcode!(
    /// `close (2)`.
    #[derive(Debug)]
    pub struct Close {
        fd: RawFd
        ;;
    }
);

opcode!(
    /// Replace fds in the registered-files table, like
    /// `register_files_update` but asynchronous.
    #[derive(Debug)]
    pub struct FilesUpdate {
        fds: *const RawFd,
        len: u32,
        ;;
        offset: i32 = 0
    }
);

opcode!(
    /// `statx (2)`.
    #[derive(Debug)]
    pub struct Statx {
        dirfd: RawFd,
        pathname: *const libc::c_char,
        statxbuf: *mut u8,
        ;;
        flags: i32 = 0,
        mask: u32 = 0
    }
);

opcode!(
    /// `posix_fadvise (2)`.
    #[derive(Debug)]
    pub struct Fadvise {
        fd: Target,
        len: libc::off_t,
        advice: i32,
        ;;
        offset: i64 = 0
    }
);

opcode!(
    /// `madvise (2)`.
    #[derive(Debug)]
    pub struct Madvise {
        addr: *const libc::c_void,
        len: libc::off_t,
        advice: i32,
        ;;
    }
);

opcode!(
    /// `epoll_ctl (2)`.
    #[derive(Debug)]
    pub struct EpollCtl {
        epfd: Target,
        fd: RawFd,
        op: i32,
        ev: *const libc::epoll_event,
        ;;
    }
);

impl Nop {
    pub fn build(self) -> Entry {
        let Nop {} = self;

        let mut sqe = sqe_zeroed();
        sqe.opcode = sys::IORING_OP_NOP;
        sqe.fd = -1;
        Entry(sqe)
    }
}

impl Readv {
    pub fn build(self) -> Entry {
        let Readv {
            fd,
            iovec,
            len,
            ioprio,
            offset,
            rw_flags,
        } = self;

        let mut sqe = sqe_zeroed();
        sqe.opcode = sys::IORING_OP_READV;
        assign_fd!(sqe.fd = fd);
        sqe.ioprio = ioprio;
        sqe.addr = iovec as _;
        sqe.len = len;
        sqe.off = offset as _;
        sqe.op_flags.rw_flags = rw_flags;
        Entry(sqe)
    }
}

impl Writev {
    pub fn build(self) -> Entry {
        let Writev {
            fd,
            iovec,
            len,
            ioprio,
            offset,
            rw_flags,
        } = self;

        let mut sqe = sqe_zeroed();
        sqe.opcode = sys::IORING_OP_WRITEV;
        assign_fd!(sqe.fd = fd);
        sqe.ioprio = ioprio;
        sqe.addr = iovec as _;
        sqe.len = len;
        sqe.off = offset as _;
        sqe.op_flags.rw_flags = rw_flags;
        Entry(sqe)
    }
}

impl Read {
    pub fn build(self) -> Entry {
        let Read {
            fd,
            buf,
            len,
            ioprio,
            offset,
            rw_flags,
        } = self;

        let mut sqe = sqe_zeroed();
        sqe.opcode = sys::IORING_OP_READ;
        assign_fd!(sqe.fd = fd);
        sqe.ioprio = ioprio;
        sqe.addr = buf as _;
        sqe.len = len;
        sqe.off = offset as _;
        sqe.op_flags.rw_flags = rw_flags;
        Entry(sqe)
    }
}

impl Write {
    pub fn build(self) -> Entry {
        let Write {
            fd,
            buf,
            len,
            ioprio,
            offset,
            rw_flags,
        } = self;

        let mut sqe = sqe_zeroed();
        sqe.opcode = sys::IORING_OP_WRITE;
        assign_fd!(sqe.fd = fd);
        sqe.ioprio = ioprio;
        sqe.addr = buf as _;
        sqe.len = len;
        sqe.off = offset as _;
        sqe.op_flags.rw_flags = rw_flags;
        Entry(sqe)
    }
}

impl ReadFixed {
    pub fn build(self) -> Entry {
        let ReadFixed {
            fd,
            buf,
            len,
            buf_index,
            ioprio,
            offset,
            rw_flags,
        } = self;

        let mut sqe = sqe_zeroed();
        sqe.opcode = sys::IORING_OP_READ_FIXED;
        assign_fd!(sqe.fd = fd);
        sqe.ioprio = ioprio;
        sqe.addr = buf as _;
        sqe.len = len;
        sqe.off = offset as _;
        sqe.op_flags.rw_flags = rw_flags;
        sqe.buf_index = buf_index;
        Entry(sqe)
    }
}

impl WriteFixed {
    pub fn build(self) -> Entry {
        let WriteFixed {
            fd,
            buf,
            len,
            buf_index,
            ioprio,
            offset,
            rw_flags,
        } = self;

        let mut sqe = sqe_zeroed();
        sqe.opcode = sys::IORING_OP_WRITE_FIXED;
        assign_fd!(sqe.fd = fd);
        sqe.ioprio = ioprio;
        sqe.addr = buf as _;
        sqe.len = len;
        sqe.off = offset as _;
        sqe.op_flags.rw_flags = rw_flags;
        sqe.buf_index = buf_index;
        Entry(sqe)
    }
}

impl Fsync {
    pub fn build(self) -> Entry {
        let Fsync { fd, flags } = self;

        let mut sqe = sqe_zeroed();
        sqe.opcode = sys::IORING_OP_FSYNC;
        assign_fd!(sqe.fd = fd);
        sqe.op_flags.fsync_flags = flags;
        Entry(sqe)
    }
}

impl PollAdd {
    pub fn build(self) -> Entry {
        let PollAdd { fd, flags } = self;

        let mut sqe = sqe_zeroed();
        sqe.opcode = sys::IORING_OP_POLL_ADD;
        assign_fd!(sqe.fd = fd);
        sqe.op_flags.poll_events = flags as u16;
        Entry(sqe)
    }
}

impl PollRemove {
    pub fn build(self) -> Entry {
        let PollRemove { target_token } = self;

        let mut sqe = sqe_zeroed();
        sqe.opcode = sys::IORING_OP_POLL_REMOVE;
        sqe.fd = -1;
        sqe.addr = target_token;
        Entry(sqe)
    }
}

impl SyncFileRange {
    pub fn build(self) -> Entry {
        let SyncFileRange {
            fd,
            len,
            offset,
            flags,
        } = self;

        let mut sqe = sqe_zeroed();
        sqe.opcode = sys::IORING_OP_SYNC_FILE_RANGE;
        assign_fd!(sqe.fd = fd);
        sqe.len = len;
        sqe.off = offset as _;
        sqe.op_flags.sync_range_flags = flags;
        Entry(sqe)
    }
}

impl SendMsg {
    pub fn build(self) -> Entry {
        let SendMsg {
            fd,
            msg,
            ioprio,
            flags,
        } = self;

        let mut sqe = sqe_zeroed();
        sqe.opcode = sys::IORING_OP_SENDMSG;
        assign_fd!(sqe.fd = fd);
        sqe.ioprio = ioprio;
        sqe.addr = msg as _;
        sqe.len = 1;
        sqe.op_flags.msg_flags = flags;
        Entry(sqe)
    }
}

impl RecvMsg {
    pub fn build(self) -> Entry {
        let RecvMsg {
            fd,
            msg,
            ioprio,
            flags,
        } = self;

        let mut sqe = sqe_zeroed();
        sqe.opcode = sys::IORING_OP_RECVMSG;
        assign_fd!(sqe.fd = fd);
        sqe.ioprio = ioprio;
        sqe.addr = msg as _;
        sqe.len = 1;
        sqe.op_flags.msg_flags = flags;
        Entry(sqe)
    }
}

impl Timeout {
    pub fn build(self) -> Entry {
        let Timeout {
            timespec,
            count,
            flags,
        } = self;

        let mut sqe = sqe_zeroed();
        sqe.opcode = sys::IORING_OP_TIMEOUT;
        sqe.fd = -1;
        sqe.addr = timespec as _;
        sqe.len = 1;
        sqe.off = count as _;
        sqe.op_flags.timeout_flags = flags;
        Entry(sqe)
    }
}

impl TimeoutRemove {
    pub fn build(self) -> Entry {
        let TimeoutRemove {
            target_token,
            flags,
        } = self;

        let mut sqe = sqe_zeroed();
        sqe.opcode = sys::IORING_OP_TIMEOUT_REMOVE;
        sqe.fd = -1;
        sqe.addr = target_token;
        sqe.op_flags.timeout_flags = flags;
        Entry(sqe)
    }
}

impl Accept {
    pub fn build(self) -> Entry {
        let Accept {
            fd,
            addr,
            addrlen,
            flags,
        } = self;

        let mut sqe = sqe_zeroed();
        sqe.opcode = sys::IORING_OP_ACCEPT;
        assign_fd!(sqe.fd = fd);
        sqe.addr = addr as _;
        sqe.off = addrlen as _;
        sqe.op_flags.accept_flags = flags as u32;
        Entry(sqe)
    }
}

impl AsyncCancel {
    pub fn build(self) -> Entry {
        let AsyncCancel { target_token } = self;

        let mut sqe = sqe_zeroed();
        sqe.opcode = sys::IORING_OP_ASYNC_CANCEL;
        sqe.fd = -1;
        sqe.addr = target_token;
        Entry(sqe)
    }
}

impl Connect {
    pub fn build(self) -> Entry {
        let Connect { fd, addr, addrlen } = self;

        let mut sqe = sqe_zeroed();
        sqe.opcode = sys::IORING_OP_CONNECT;
        assign_fd!(sqe.fd = fd);
        sqe.addr = addr as _;
        sqe.off = addrlen as _;
        Entry(sqe)
    }
}

impl LinkTimeout {
    pub fn build(self) -> Entry {
        let LinkTimeout { timespec, flags } = self;

        let mut sqe = sqe_zeroed();
        sqe.opcode = sys::IORING_OP_LINK_TIMEOUT;
        sqe.fd = -1;
        sqe.addr = timespec as _;
        sqe.len = 1;
        sqe.op_flags.timeout_flags = flags;
        Entry(sqe)
    }
}

impl Send {
    pub fn build(self) -> Entry {
        let Send { fd, buf, len, flags } = self;

        let mut sqe = sqe_zeroed();
        sqe.opcode = sys::IORING_OP_SEND;
        assign_fd!(sqe.fd = fd);
        sqe.addr = buf as _;
        sqe.len = len;
        sqe.op_flags.msg_flags = flags as u32;
        Entry(sqe)
    }
}

impl Recv {
    pub fn build(self) -> Entry {
        let Recv { fd, buf, len, flags } = self;

        let mut sqe = sqe_zeroed();
        sqe.opcode = sys::IORING_OP_RECV;
        assign_fd!(sqe.fd = fd);
        sqe.addr = buf as _;
        sqe.len = len;
        sqe.op_flags.msg_flags = flags as u32;
        Entry(sqe)
    }
}

impl Fallocate {
    pub fn build(self) -> Entry {
        let Fallocate {
            fd,
            len,
            offset,
            mode,
        } = self;

        let mut sqe = sqe_zeroed();
        sqe.opcode = sys::IORING_OP_FALLOCATE;
        assign_fd!(sqe.fd = fd);
        sqe.addr = len as _;
        sqe.len = mode as _;
        sqe.off = offset as _;
        Entry(sqe)
    }
}

impl OpenAt {
    pub fn build(self) -> Entry {
        let OpenAt {
            dirfd,
            pathname,
            flags,
            mode,
        } = self;

        let mut sqe = sqe_zeroed();
        sqe.opcode = sys::IORING_OP_OPENAT;
        sqe.fd = dirfd;
        sqe.addr = pathname as _;
        sqe.len = mode as _;
        sqe.op_flags.open_flags = flags as u32;
        Entry(sqe)
    }
}

impl OpenAt2 {
    pub fn build(self) -> Entry {
        let OpenAt2 {
            dirfd,
            pathname,
            how,
        } = self;

        let mut sqe = sqe_zeroed();
        sqe.opcode = sys::IORING_OP_OPENAT2;
        sqe.fd = dirfd;
        sqe.addr = pathname as _;
        sqe.len = std::mem::size_of::<OpenHow>() as _;
        sqe.off = how as _;
        Entry(sqe)
    }
}

impl Close {
    pub fn build(self) -> Entry {
        let Close { fd } = self;

        let mut sqe = sqe_zeroed();
        sqe.opcode = sys::IORING_OP_CLOSE;
        sqe.fd = fd;
        Entry(sqe)
    }
}

impl FilesUpdate {
    pub fn build(self) -> Entry {
        let FilesUpdate { fds, len, offset } = self;

        let mut sqe = sqe_zeroed();
        sqe.opcode = sys::IORING_OP_FILES_UPDATE;
        sqe.fd = -1;
        sqe.addr = fds as _;
        sqe.len = len;
        sqe.off = offset as _;
        Entry(sqe)
    }
}

impl Statx {
    pub fn build(self) -> Entry {
        let Statx {
            dirfd,
            pathname,
            statxbuf,
            flags,
            mask,
        } = self;

        let mut sqe = sqe_zeroed();
        sqe.opcode = sys::IORING_OP_STATX;
        sqe.fd = dirfd;
        sqe.addr = pathname as _;
        sqe.len = mask;
        sqe.off = statxbuf as _;
        sqe.op_flags.statx_flags = flags as u32;
        Entry(sqe)
    }
}

impl Fadvise {
    pub fn build(self) -> Entry {
        let Fadvise {
            fd,
            len,
            advice,
            offset,
        } = self;

        let mut sqe = sqe_zeroed();
        sqe.opcode = sys::IORING_OP_FADVISE;
        assign_fd!(sqe.fd = fd);
        sqe.len = len as _;
        sqe.off = offset as _;
        sqe.op_flags.fadvise_advice = advice as u32;
        Entry(sqe)
    }
}

impl Madvise {
    pub fn build(self) -> Entry {
        let Madvise { addr, len, advice } = self;

        let mut sqe = sqe_zeroed();
        sqe.opcode = sys::IORING_OP_MADVISE;
        sqe.fd = -1;
        sqe.addr = addr as _;
        sqe.len = len as _;
        sqe.op_flags.fadvise_advice = advice as u32;
        Entry(sqe)
    }
}

impl EpollCtl {
    pub fn build(self) -> Entry {
        let EpollCtl { epfd, fd, op, ev } = self;

        let mut sqe = sqe_zeroed();
        sqe.opcode = sys::IORING_OP_EPOLL_CTL;
        assign_fd!(sqe.fd = epfd);
        sqe.addr = ev as _;
        sqe.len = op as _;
        sqe.off = fd as _;
        Entry(sqe)
    }
}
