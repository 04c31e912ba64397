//! Submission Queue Adapter.
//!
//! Staging is two-phase: producers copy entries into ring slots behind an
//! internal tail, and a later [`notify`](SubmissionQueue::notify) publishes
//! the staged span to the kernel by advancing the kernel-visible tail. All
//! mutation happens under the adapter's monitor; the kernel-shared words are
//! accessed with the orderings the kernel ABI documents.

use core::fmt::{self, Debug, Formatter};
use std::os::unix::io::RawFd;
use std::sync::{atomic, Arc};
use std::{io, mem, ptr};

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::op::{Operation, Registry};
use crate::sys;
use crate::unblock::UnblockHandle;
use crate::util::{unsync_load, Mmap};

bitflags::bitflags! {
    /// Per-operation submission flags. These flow into the kernel unchanged.
    pub struct Flags: u8 {
        /// Interpret the entry's fd as an index into the registered-files table.
        const FIXED_FILE = sys::IOSQE_FIXED_FILE;

        /// Do not start this operation until all prior entries have completed.
        const IO_DRAIN = sys::IOSQE_IO_DRAIN;

        /// Chain this operation to the next staged entry; the next entry
        /// starts only after this one completes successfully.
        const IO_LINK = sys::IOSQE_IO_LINK;

        /// Like [`IO_LINK`](Self::IO_LINK), but the chain survives a failed
        /// completion of this operation.
        const IO_HARDLINK = sys::IOSQE_IO_HARDLINK;

        /// Always execute from async context instead of trying a
        /// non-blocking issue first.
        const ASYNC = sys::IOSQE_ASYNC;
    }
}

/// A 64-byte submission queue entry, built by the [`opcode`](crate::opcode)
/// encoders.
///
/// The `user_data` field is owned by the engine: it is overwritten with the
/// completion token at staging time.
#[derive(Clone)]
pub struct Entry(pub(crate) sys::io_uring_sqe);

impl Entry {
    /// Set the submission [flags](Flags).
    #[inline]
    pub fn flags(mut self, flags: Flags) -> Entry {
        self.0.flags |= flags.bits();
        self
    }

    /// Set the I/O priority, as in `ioprio_set (2)`.
    #[inline]
    pub fn ioprio(mut self, ioprio: u16) -> Entry {
        self.0.ioprio = ioprio;
        self
    }
}

impl Debug for Entry {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("op_code", &self.0.opcode)
            .field("flags", &self.0.flags)
            .finish()
    }
}

/// Outcome of staging: the issued token(s) and whether the caller must
/// signal the unblock handle now that the monitor is released.
pub(crate) struct StageOutcome {
    pub token: u64,
    pub unblock: bool,
}

pub(crate) struct StageManyOutcome {
    pub tokens: Vec<u64>,
    pub unblock: bool,
}

/// Submit/park plan computed by [`SubmissionQueue::prepare_reap`].
pub(crate) struct ReapPlan {
    pub to_submit: u32,
    pub min_complete: u32,
    pub flags: u32,
    pub enter: bool,
}

/// Result of `io_uring_enter`.
pub(crate) enum Enter {
    Submitted(u32),
    /// EAGAIN/EBUSY: the kernel wants completions drained before it accepts
    /// more work.
    AwaitCompletions,
}

struct Staging {
    /// Next slot to stage into; ahead of the kernel-visible tail until
    /// publication.
    tail_internal: u32,
    /// First staged slot not yet published. When submission polling is off
    /// this doubles as the head the app believes the kernel has consumed to
    /// (entries are consumed during `enter`).
    head_internal: u32,
    /// A reaper is parked; the next producer to stage must signal the
    /// unblock handle after releasing the monitor.
    should_unblock: bool,
}

pub(crate) struct SubmissionQueue {
    head: *const atomic::AtomicU32,
    tail: *const atomic::AtomicU32,
    ring_mask: u32,
    ring_entries: u32,
    flags: *const atomic::AtomicU32,
    dropped: *const atomic::AtomicU32,
    array: *mut u32,
    sqes: *mut sys::io_uring_sqe,

    sq_polled: bool,
    io_polled: bool,
    ring_fd: RawFd,

    registry: Arc<Registry>,
    staging: Mutex<Staging>,
}

unsafe impl Send for SubmissionQueue {}
unsafe impl Sync for SubmissionQueue {}

impl SubmissionQueue {
    #[rustfmt::skip]
    pub(crate) unsafe fn new(
        sq_mmap: &Mmap,
        sqe_mmap: &Mmap,
        p: &sys::io_uring_params,
        ring_fd: RawFd,
        registry: Arc<Registry>,
    ) -> SubmissionQueue {
        let head         = sq_mmap.offset(p.sq_off.head        ) as *const atomic::AtomicU32;
        let tail         = sq_mmap.offset(p.sq_off.tail        ) as *const atomic::AtomicU32;
        let ring_mask    = sq_mmap.offset(p.sq_off.ring_mask   ).cast::<u32>().read();
        let ring_entries = sq_mmap.offset(p.sq_off.ring_entries).cast::<u32>().read();
        let flags        = sq_mmap.offset(p.sq_off.flags       ) as *const atomic::AtomicU32;
        let dropped      = sq_mmap.offset(p.sq_off.dropped     ) as *const atomic::AtomicU32;
        let array        = sq_mmap.offset(p.sq_off.array       ) as *mut u32;

        let sqes         = sqe_mmap.as_mut_ptr() as *mut sys::io_uring_sqe;

        let tail_now = (*tail).load(atomic::Ordering::Acquire);

        SubmissionQueue {
            head,
            tail,
            ring_mask,
            ring_entries,
            flags,
            dropped,
            array,
            sqes,
            sq_polled: p.flags & sys::IORING_SETUP_SQPOLL != 0,
            io_polled: p.flags & sys::IORING_SETUP_IOPOLL != 0,
            ring_fd,
            registry,
            staging: Mutex::new(Staging {
                tail_internal: tail_now,
                head_internal: tail_now,
                should_unblock: false,
            }),
        }
    }

    /// Total number of entries in the submission queue ring buffer.
    #[inline]
    pub fn capacity(&self) -> u32 {
        self.ring_entries
    }

    /// Number of staged or in-flight entries.
    pub fn used(&self) -> u32 {
        let staging = self.staging.lock();
        staging
            .tail_internal
            .wrapping_sub(self.effective_head(&staging))
    }

    /// Free entries available for staging.
    pub fn available(&self) -> u32 {
        self.ring_entries - self.used()
    }

    /// The head producers measure fullness against: the kernel's own head
    /// when it polls the queue itself, the app-side published head otherwise.
    fn effective_head(&self, staging: &Staging) -> u32 {
        if self.sq_polled {
            unsafe { (*self.head).load(atomic::Ordering::Acquire) }
        } else {
            staging.head_internal
        }
    }

    fn token(fd: i32, tail: u32) -> u64 {
        ((fd as u32 as u64) << 32) | tail as u64
    }

    /// Copy one record into its ring slot and register its token.
    ///
    /// The record is registered before the monitor is released, so its
    /// completion can never be observed ahead of the registry entry.
    fn stage_locked(
        &self,
        staging: &mut Staging,
        mut sqe: sys::io_uring_sqe,
        op: Option<Operation>,
    ) -> Result<u64> {
        let next = staging.tail_internal.wrapping_add(1);
        let head = self.effective_head(staging);
        if next.wrapping_sub(head) > self.ring_entries {
            return Err(Error::SubmissionQueueFull);
        }

        let token = Self::token(sqe.fd, staging.tail_internal);
        sqe.user_data = token;
        unsafe {
            *self
                .sqes
                .add((staging.tail_internal & self.ring_mask) as usize) = sqe;
        }
        if let Some(op) = op {
            self.registry.insert(token, op);
        }
        staging.tail_internal = next;
        Ok(token)
    }

    /// Stage a single entry. `op` is `None` only for the engine's own
    /// unblock read, which is tracked by the handle instead of the registry.
    pub(crate) fn stage_one(&self, entry: Entry, op: Option<Operation>) -> Result<StageOutcome> {
        let mut staging = self.staging.lock();
        let token = self.stage_locked(&mut staging, entry.0, op)?;
        let unblock = mem::replace(&mut staging.should_unblock, false);
        Ok(StageOutcome { token, unblock })
    }

    /// Stage a group of entries as a unit.
    ///
    /// Rejects the whole batch when the span does not fit; partial staging
    /// would leave a linked chain malformed. Tokens are sequential within
    /// the batch.
    pub(crate) fn stage_many(
        &self,
        ops: Vec<(Entry, Operation)>,
    ) -> Result<StageManyOutcome> {
        let mut staging = self.staging.lock();

        let used = staging
            .tail_internal
            .wrapping_sub(self.effective_head(&staging));
        if ops.len() as u32 > self.ring_entries - used {
            return Err(Error::SubmissionQueueFull);
        }

        let mut tokens = Vec::with_capacity(ops.len());
        for (entry, op) in ops {
            let token = self.stage_locked(&mut staging, entry.0, Some(op))?;
            tokens.push(token);
        }
        let unblock = mem::replace(&mut staging.should_unblock, false);
        Ok(StageManyOutcome { tokens, unblock })
    }

    /// Publish every staged entry to the kernel-visible ring.
    ///
    /// Returns the number of entries the kernel has not yet consumed.
    pub(crate) fn notify(&self) -> u32 {
        let mut staging = self.staging.lock();
        self.notify_locked(&mut staging)
    }

    fn notify_locked(&self, staging: &mut Staging) -> u32 {
        unsafe {
            // The engine is the only user-space writer of the tail.
            let mut tail = unsync_load(self.tail);

            while staging.head_internal != staging.tail_internal {
                *self.array.add((tail & self.ring_mask) as usize) =
                    staging.head_internal & self.ring_mask;
                tail = tail.wrapping_add(1);
                staging.head_internal = staging.head_internal.wrapping_add(1);
            }

            (*self.tail).store(tail, atomic::Ordering::Release);

            let dropped = (*self.dropped).load(atomic::Ordering::Acquire);
            if dropped != 0 {
                // Well-formed entries never drop; an advance here is a bug.
                log::error!("kernel dropped {} submission entries", dropped);
                debug_assert_eq!(dropped, 0);
            }

            tail.wrapping_sub((*self.head).load(atomic::Ordering::Acquire))
        }
    }

    /// Whether `io_uring_enter` is needed to move published entries along,
    /// and the extra enter flags if so.
    fn should_enter(&self) -> (bool, u32) {
        if !self.sq_polled {
            return (true, 0);
        }
        // The wakeup bit is written by the kernel poll thread as it goes to
        // sleep; the fence orders our tail store against its flag store.
        atomic::fence(atomic::Ordering::SeqCst);
        let flags = unsafe { (*self.flags).load(atomic::Ordering::Relaxed) };
        if flags & sys::IORING_SQ_NEED_WAKEUP != 0 {
            (true, sys::IORING_ENTER_SQ_WAKEUP)
        } else {
            (false, 0)
        }
    }

    /// The boss reaper's locked half of submit-and-wait: publish staged
    /// entries, retry a deferred unblock re-arm, and decide whether to park.
    ///
    /// Parking (`min_complete = 1`) is only chosen while the unblock read is
    /// staged or in flight; that is what guarantees a producer-side eventfd
    /// write can always interrupt the wait. Checking the handle under the
    /// monitor makes the check race-free against a concurrent re-arm.
    pub(crate) fn prepare_reap(&self, cq_empty: bool, unblock: &UnblockHandle) -> ReapPlan {
        let mut staging = self.staging.lock();

        if unblock.rearm_pending() {
            if let Ok(token) = self.stage_locked(&mut staging, unblock.entry().0, None) {
                unblock.armed(token);
            }
        }

        let to_submit = self.notify_locked(&mut staging);
        let (enter_needed, mut flags) = self.should_enter();

        let mut min_complete = 0;
        if to_submit == 0 {
            staging.should_unblock = true;
            if cq_empty && unblock.is_inflight() {
                min_complete = 1;
            }
        }
        drop(staging);

        if min_complete > 0 || self.io_polled {
            flags |= sys::IORING_ENTER_GETEVENTS;
        }

        ReapPlan {
            to_submit,
            min_complete,
            flags,
            enter: enter_needed || min_complete > 0,
        }
    }

    /// Publish and enter in one call; used by paths that are not the boss
    /// loop (initial arming, tests).
    pub(crate) fn submit_and_wait(&self, min_complete: u32) -> Result<Enter> {
        let to_submit = self.notify();
        let (enter_needed, mut flags) = self.should_enter();

        if min_complete > 0 || self.io_polled {
            flags |= sys::IORING_ENTER_GETEVENTS;
        }
        if !enter_needed && min_complete == 0 {
            return Ok(Enter::Submitted(0));
        }

        self.enter(to_submit, min_complete, flags)
    }

    /// `io_uring_enter`, retried on EINTR.
    pub(crate) fn enter(&self, to_submit: u32, min_complete: u32, flags: u32) -> Result<Enter> {
        loop {
            let ret = unsafe {
                sys::io_uring_enter(self.ring_fd, to_submit, min_complete, flags, ptr::null())
            };
            if ret >= 0 {
                return Ok(Enter::Submitted(ret as u32));
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EAGAIN) | Some(libc::EBUSY) => return Ok(Enter::AwaitCompletions),
                _ => return Err(Error::Os(err)),
            }
        }
    }
}
