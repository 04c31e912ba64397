//! Completion Queue Adapter.

use std::os::unix::io::RawFd;
use std::sync::atomic;
use std::{io, ptr};

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::sys;
use crate::util::{unsync_load, Mmap};

/// A dequeued completion event.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Completion {
    pub token: u64,
    /// `>= 0` success value, `< 0` negated errno.
    pub result: i32,
}

pub(crate) struct CompletionQueue {
    head: *const atomic::AtomicU32,
    tail: *const atomic::AtomicU32,
    ring_mask: u32,
    ring_entries: u32,
    overflow: *const atomic::AtomicU32,
    cqes: *const sys::io_uring_cqe,

    io_polled: bool,
    ring_fd: RawFd,

    monitor: Mutex<()>,
}

unsafe impl Send for CompletionQueue {}
unsafe impl Sync for CompletionQueue {}

impl CompletionQueue {
    #[rustfmt::skip]
    pub(crate) unsafe fn new(
        cq_mmap: &Mmap,
        p: &sys::io_uring_params,
        ring_fd: RawFd,
    ) -> CompletionQueue {
        let head         = cq_mmap.offset(p.cq_off.head        ) as *const atomic::AtomicU32;
        let tail         = cq_mmap.offset(p.cq_off.tail        ) as *const atomic::AtomicU32;
        let ring_mask    = cq_mmap.offset(p.cq_off.ring_mask   ).cast::<u32>().read();
        let ring_entries = cq_mmap.offset(p.cq_off.ring_entries).cast::<u32>().read();
        let overflow     = cq_mmap.offset(p.cq_off.overflow    ) as *const atomic::AtomicU32;
        let cqes         = cq_mmap.offset(p.cq_off.cqes        ) as *const sys::io_uring_cqe;

        CompletionQueue {
            head,
            tail,
            ring_mask,
            ring_entries,
            overflow,
            cqes,
            io_polled: p.flags & sys::IORING_SETUP_IOPOLL != 0,
            ring_fd,
            monitor: Mutex::new(()),
        }
    }

    /// Total number of entries in the completion queue ring buffer.
    #[inline]
    pub fn capacity(&self) -> u32 {
        self.ring_entries
    }

    /// Whether any unread completions are queued.
    pub fn is_empty(&self) -> bool {
        let _guard = self.monitor.lock();
        unsafe {
            let head = unsync_load(self.head);
            let tail = (*self.tail).load(atomic::Ordering::Acquire);
            head == tail
        }
    }

    /// Dequeue one completion if any is available.
    ///
    /// With I/O polling enabled an empty ring first asks the kernel to reap
    /// polled completions before giving up. A non-zero overflow counter is
    /// terminal: events were lost and their callbacks will never fire.
    pub(crate) fn try_read(&self) -> Result<Option<Completion>> {
        let _guard = self.monitor.lock();
        unsafe {
            let head = unsync_load(self.head);
            let mut tail = (*self.tail).load(atomic::Ordering::Acquire);

            if head == tail && self.io_polled {
                self.getevents(0)?;
                tail = (*self.tail).load(atomic::Ordering::Acquire);
            }
            if head == tail {
                return Ok(None);
            }

            let overflow = (*self.overflow).load(atomic::Ordering::Acquire);
            if overflow != 0 {
                return Err(Error::CompletionQueueOverflow);
            }

            let cqe = *self.cqes.add((head & self.ring_mask) as usize);
            (*self.head).store(head.wrapping_add(1), atomic::Ordering::Release);

            Ok(Some(Completion {
                token: cqe.user_data,
                result: cqe.res,
            }))
        }
    }

    /// Dequeue one completion, blocking in the kernel between misses.
    pub(crate) fn read(&self) -> Result<Completion> {
        loop {
            if let Some(completion) = self.try_read()? {
                return Ok(completion);
            }
            self.getevents(1)?;
        }
    }

    fn getevents(&self, min_complete: u32) -> Result<()> {
        loop {
            let ret = unsafe {
                sys::io_uring_enter(
                    self.ring_fd,
                    0,
                    min_complete,
                    sys::IORING_ENTER_GETEVENTS,
                    ptr::null(),
                )
            };
            if ret >= 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) | Some(libc::EAGAIN) | Some(libc::EBUSY) => continue,
                _ => return Err(Error::Os(err)),
            }
        }
    }
}
