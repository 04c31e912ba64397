//! The unblock handle.
//!
//! An `eventfd` with a read permanently pending inside the ring. A producer
//! that stages work while a reaper is parked in `io_uring_enter` writes to
//! the eventfd; the kernel completes the pending read, which wakes the
//! parked reaper without touching submission-queue state. The read re-arms
//! itself after every completion.

use std::cell::UnsafeCell;
use std::io;
use std::sync::atomic::{AtomicI32, AtomicU64, AtomicU8, Ordering};

use crate::error::{Error, Result};
use crate::opcode::{Readv, Target};
use crate::squeue::{Entry, SubmissionQueue};

/// Sentinel stored in the fd slot once the handle is disposed.
const DISPOSED: i32 = 0;

/// The read is staged or inside the kernel; a parked reaper can be woken.
const INFLIGHT: u8 = 0;
/// A reaper dequeued the read's completion and owns the re-arm.
const FIRED: u8 = 1;
/// Re-arming hit a full submission queue; the boss retries during its
/// next synchronize.
const PENDING: u8 = 2;

pub(crate) struct UnblockHandle {
    fd: AtomicI32,
    state: AtomicU8,
    /// Token of the in-flight read; matched against completions before the
    /// registry lookup.
    token: AtomicU64,
    buf: UnsafeCell<u64>,
    iov: UnsafeCell<libc::iovec>,
}

unsafe impl Send for UnblockHandle {}
unsafe impl Sync for UnblockHandle {}

impl UnblockHandle {
    pub fn new() -> io::Result<UnblockHandle> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(UnblockHandle {
            fd: AtomicI32::new(fd),
            state: AtomicU8::new(PENDING),
            token: AtomicU64::new(0),
            buf: UnsafeCell::new(0),
            iov: UnsafeCell::new(libc::iovec {
                iov_base: std::ptr::null_mut(),
                iov_len: 0,
            }),
        })
    }

    /// The 8-byte read against the eventfd.
    ///
    /// Only the current owner of the re-arm duty may call this; the iovec
    /// is rewritten in place and must not be concurrently read by the
    /// kernel, which is guaranteed while no read is in flight.
    pub(crate) fn entry(&self) -> Entry {
        let fd = self.fd.load(Ordering::Acquire);
        unsafe {
            *self.iov.get() = libc::iovec {
                iov_base: self.buf.get() as *mut libc::c_void,
                iov_len: 8,
            };
        }
        Readv::new(Target::Fd(fd), self.iov.get(), 1).build()
    }

    pub fn is_inflight(&self) -> bool {
        self.state.load(Ordering::SeqCst) == INFLIGHT
    }

    pub fn rearm_pending(&self) -> bool {
        self.state.load(Ordering::SeqCst) == PENDING
    }

    /// Record a successfully staged read.
    pub fn armed(&self, token: u64) {
        self.token.store(token, Ordering::SeqCst);
        self.state.store(INFLIGHT, Ordering::SeqCst);
    }

    /// Whether `token` belongs to the in-flight read.
    pub fn matches(&self, token: u64) -> bool {
        self.is_inflight() && self.token.load(Ordering::SeqCst) == token
    }

    /// Handle the read's completion; called by the reaper that dequeued it.
    ///
    /// Re-arms inline so the boss can observe an in-flight read before it
    /// decides to park again. Results other than 8 bytes or `-EINTR` during
    /// normal operation are unexpected but re-armed anyway; completions
    /// after dispose are a teardown race and are dropped.
    pub(crate) fn on_completion(&self, result: i32, sq: &SubmissionQueue) {
        self.state.store(FIRED, Ordering::SeqCst);

        if self.fd.load(Ordering::Acquire) == DISPOSED {
            log::trace!("unblock read completed after dispose: {}", result);
            return;
        }
        if result < 0 && result != -libc::EINTR {
            log::warn!("unblock read failed: {}", result);
        }

        match sq.stage_one(self.entry(), None) {
            Ok(outcome) => {
                self.armed(outcome.token);
                if outcome.unblock {
                    self.signal();
                }
            }
            Err(Error::SubmissionQueueFull) => {
                self.state.store(PENDING, Ordering::SeqCst);
            }
            Err(err) => {
                log::warn!("unblock re-arm failed: {}", err);
                self.state.store(PENDING, Ordering::SeqCst);
            }
        }
    }

    /// Stage the initial read at ring construction.
    pub(crate) fn arm(&self, sq: &SubmissionQueue) -> Result<()> {
        let outcome = sq.stage_one(self.entry(), None)?;
        self.armed(outcome.token);
        Ok(())
    }

    /// Wake a parked reaper with a direct eventfd write.
    ///
    /// Must be called after the submission-queue monitor is released; doing
    /// it under the monitor would invert priority against the parked boss.
    pub fn signal(&self) {
        let fd = self.fd.load(Ordering::Acquire);
        if fd == DISPOSED {
            return;
        }

        let value: u64 = 1;
        loop {
            let ret = unsafe {
                libc::write(fd, &value as *const u64 as *const libc::c_void, 8)
            };
            if ret >= 0 {
                return;
            }
            match io::Error::last_os_error().raw_os_error() {
                Some(libc::EINTR) => continue,
                // Counter saturated: the pending read is already signaled.
                Some(libc::EAGAIN) => return,
                // Closed under us: benign teardown race.
                Some(libc::EBADF) => {
                    log::trace!("unblock write hit closed eventfd");
                    return;
                }
                err => {
                    log::warn!("unblock write failed: {:?}", err);
                    return;
                }
            }
        }
    }

    /// Close the eventfd. Pending reads complete with an error that
    /// [`on_completion`](Self::on_completion) drops.
    pub fn dispose(&self) {
        let fd = self.fd.swap(DISPOSED, Ordering::AcqRel);
        if fd != DISPOSED {
            unsafe {
                libc::close(fd);
            }
        }
    }
}

impl Drop for UnblockHandle {
    fn drop(&mut self) {
        self.dispose();
    }
}
