//! A thread-safe, callback-driven submission engine for Linux `io_uring`.
//!
//! Any number of producer threads submit operations against a single
//! kernel ring; a pool of dedicated reaper threads publishes staged
//! entries, parks in the kernel while idle, and dispatches completions to
//! the continuation supplied with each submission.
//!
//! ```no_run
//! # fn main() -> Result<(), uring_engine::Error> {
//! use std::sync::mpsc;
//! use uring_engine::{opcode, Ring};
//!
//! let ring = Ring::new(8)?;
//! let (done, wait) = mpsc::channel();
//!
//! unsafe {
//!     ring.submit(opcode::Nop::new().build(), move |result| {
//!         done.send(result).ok();
//!     })?;
//! }
//!
//! assert_eq!(wait.recv().unwrap(), 0);
//! # Ok(())
//! # }
//! ```
//!
//! Operation encoders live in [`opcode`]; completion results carry the raw
//! kernel convention (`>= 0` success value, negated errno otherwise).

mod cqueue;
mod dispatch;
mod error;
mod op;
pub mod opcode;
mod reaper;
pub mod squeue;
mod sys;
mod unblock;
mod util;

use std::convert::TryInto;
use std::mem::ManuallyDrop;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::{cmp, mem};

use cqueue::CompletionQueue;
use dispatch::Dispatcher;
use op::{Pool, Registry};
use squeue::SubmissionQueue;
use unblock::UnblockHandle;
use util::{Fd, Mmap};

pub use error::{Error, Result};
pub use op::Callback;
pub use squeue::{Entry, Flags};

/// A live io_uring engine.
///
/// Cheap to share by reference across producer threads; all submission
/// entry points take `&self`.
pub struct Ring {
    core: Arc<RingCore>,
    reapers: Vec<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
    disposed: bool,
}

pub(crate) struct RingCore {
    fd: ManuallyDrop<Fd>,
    params: Parameters,
    memory: ManuallyDrop<MemoryMap>,
    pub(crate) sq: SubmissionQueue,
    pub(crate) cq: CompletionQueue,
    pub(crate) registry: Arc<Registry>,
    pub(crate) pool: Arc<Pool>,
    pub(crate) unblock: UnblockHandle,
    pub(crate) dispatcher: Dispatcher,
    pub(crate) shutdown: AtomicBool,
}

#[allow(dead_code)]
struct MemoryMap {
    sq_mmap: Mmap,
    sqe_mmap: Mmap,
    cq_mmap: Option<Mmap>,
}

/// Engine build options.
#[derive(Clone)]
pub struct Builder {
    dontfork: bool,
    completion_threads: usize,
    dispatch_async: bool,
    params: sys::io_uring_params,
}

/// The ring parameters negotiated with the kernel.
#[derive(Clone)]
pub struct Parameters(sys::io_uring_params);

unsafe impl Send for RingCore {}
unsafe impl Sync for RingCore {}

impl RingCore {
    /// Set up the kernel ring, map the queues, and wire the components.
    /// The caller spawns the reapers.
    fn with_params(
        entries: u32,
        mut p: sys::io_uring_params,
        completion_threads: usize,
        dispatch_async: bool,
    ) -> Result<(Arc<RingCore>, Vec<JoinHandle<()>>)> {
        // NOTE: The `SubmissionQueue` and `CompletionQueue` hold pointers
        // into `MemoryMap`; the map must outlive both, which `RingCore`'s
        // drop order guarantees.
        #[inline]
        unsafe fn setup_queue(
            fd: &Fd,
            p: &sys::io_uring_params,
            registry: Arc<Registry>,
        ) -> Result<(MemoryMap, SubmissionQueue, CompletionQueue)> {
            let sq_len = p.sq_off.array as usize + p.sq_entries as usize * mem::size_of::<u32>();
            let cq_len = p.cq_off.cqes as usize
                + p.cq_entries as usize * mem::size_of::<sys::io_uring_cqe>();
            let sqe_len = p.sq_entries as usize * mem::size_of::<sys::io_uring_sqe>();
            let sqe_mmap = Mmap::new(fd, sys::IORING_OFF_SQES, sqe_len)?;

            if p.features & sys::IORING_FEAT_SINGLE_MMAP != 0 {
                // One region serves both queues; keep one unmap capability
                // and alias it.
                let scq_mmap = Mmap::new(fd, sys::IORING_OFF_SQ_RING, cmp::max(sq_len, cq_len))?;

                let sq =
                    SubmissionQueue::new(&scq_mmap, &sqe_mmap, p, fd.as_raw_fd(), registry);
                let cq = CompletionQueue::new(&scq_mmap, p, fd.as_raw_fd());
                let mm = MemoryMap {
                    sq_mmap: scq_mmap,
                    cq_mmap: None,
                    sqe_mmap,
                };

                Ok((mm, sq, cq))
            } else {
                let sq_mmap = Mmap::new(fd, sys::IORING_OFF_SQ_RING, sq_len)?;
                let cq_mmap = Mmap::new(fd, sys::IORING_OFF_CQ_RING, cq_len)?;

                let sq =
                    SubmissionQueue::new(&sq_mmap, &sqe_mmap, p, fd.as_raw_fd(), registry);
                let cq = CompletionQueue::new(&cq_mmap, p, fd.as_raw_fd());
                let mm = MemoryMap {
                    cq_mmap: Some(cq_mmap),
                    sq_mmap,
                    sqe_mmap,
                };

                Ok((mm, sq, cq))
            }
        }

        let fd: Fd = unsafe {
            sys::io_uring_setup(entries, &mut p)
                .try_into()
                .map_err(Error::Os)?
        };

        let registry = Arc::new(Registry::new());
        let (mm, sq, cq) = unsafe { setup_queue(&fd, &p, registry.clone())? };

        let pool = Arc::new(Pool::new(p.sq_entries as usize * 2));
        let (dispatcher, workers) = if dispatch_async {
            Dispatcher::with_workers(completion_threads, pool.clone())?
        } else {
            Dispatcher::inline()
        };
        let unblock = UnblockHandle::new().map_err(Error::Os)?;

        log::debug!(
            "ring ready: sq={} cq={} features={:#x} flags={:#x}",
            p.sq_entries,
            p.cq_entries,
            p.features,
            p.flags
        );

        let core = Arc::new(RingCore {
            fd: ManuallyDrop::new(fd),
            params: Parameters(p),
            memory: ManuallyDrop::new(mm),
            sq,
            cq,
            registry,
            pool,
            unblock,
            dispatcher,
            shutdown: AtomicBool::new(false),
        });

        // The read rides the ring from the start; its first publication
        // happens on the boss's first synchronize.
        core.unblock.arm(&core.sq)?;

        Ok((core, workers))
    }
}

impl Drop for RingCore {
    fn drop(&mut self) {
        unsafe {
            // Close the ring fd before the queues are unmapped.
            ManuallyDrop::drop(&mut self.fd);
            ManuallyDrop::drop(&mut self.memory);
        }
    }
}

impl Ring {
    /// Create an engine with one reaper thread and inline dispatch.
    ///
    /// `entries` sets the size of the submission queue and should be a
    /// power of two; the kernel sizes the completion queue itself (usually
    /// twice as large).
    #[inline]
    pub fn new(entries: u32) -> Result<Ring> {
        Builder::default().build(entries)
    }

    /// Start building an engine with non-default options.
    pub fn builder() -> Builder {
        Builder::default()
    }

    /// Submit one operation. Returns the completion token.
    ///
    /// `callback` runs exactly once with the raw kernel result (`>= 0`
    /// success value, negated errno otherwise), either on a reaper thread
    /// or on a dispatch worker depending on
    /// [`dispatch_async`](Builder::dispatch_async).
    ///
    /// The token doubles as the target for [`AsyncCancel`],
    /// [`PollRemove`] and [`TimeoutRemove`]. It encodes the entry's fd and
    /// staging slot and is not globally unique over the life of the ring;
    /// treat it as an opaque handle.
    ///
    /// # Safety
    ///
    /// Buffers and structures the entry points at must stay valid until the
    /// callback has run, otherwise the kernel reads or writes freed memory.
    ///
    /// [`AsyncCancel`]: crate::opcode::AsyncCancel
    /// [`PollRemove`]: crate::opcode::PollRemove
    /// [`TimeoutRemove`]: crate::opcode::TimeoutRemove
    pub unsafe fn submit<F>(&self, entry: Entry, callback: F) -> Result<u64>
    where
        F: FnOnce(i32) + Send + 'static,
    {
        if self.core.shutdown.load(Ordering::SeqCst) {
            return Err(Error::Disposed);
        }
        let op = self.core.pool.acquire(Box::new(callback));
        let outcome = self.core.sq.stage_one(entry, Some(op))?;
        if outcome.unblock {
            self.core.unblock.signal();
        }
        Ok(outcome.token)
    }

    /// Submit a group of operations as a unit; all staged or none.
    ///
    /// This is the only way to build linked chains: give every entry but
    /// the last [`Flags::IO_LINK`] and the kernel orders the chain.
    /// Tokens are returned in submission order.
    ///
    /// # Safety
    ///
    /// Same contract as [`submit`](Self::submit), for every entry in the
    /// batch.
    pub unsafe fn submit_many(&self, ops: Vec<(Entry, Callback)>) -> Result<Vec<u64>> {
        if self.core.shutdown.load(Ordering::SeqCst) {
            return Err(Error::Disposed);
        }
        let ops = ops
            .into_iter()
            .map(|(entry, callback)| (entry, self.core.pool.acquire(callback)))
            .collect();
        let outcome = self.core.sq.stage_many(ops)?;
        if outcome.unblock {
            self.core.unblock.signal();
        }
        Ok(outcome.tokens)
    }

    /// Total number of submission queue entries.
    pub fn submission_queue_size(&self) -> u32 {
        self.core.sq.capacity()
    }

    /// Total number of completion queue entries.
    pub fn completion_queue_size(&self) -> u32 {
        self.core.cq.capacity()
    }

    /// Entries currently staged or in flight.
    pub fn submission_entries_used(&self) -> u32 {
        self.core.sq.used()
    }

    /// Entries free for staging.
    pub fn submission_entries_available(&self) -> u32 {
        self.core.sq.available()
    }

    /// The negotiated ring parameters and kernel feature bits.
    pub fn params(&self) -> &Parameters {
        &self.core.params
    }

    /// Shut the engine down.
    ///
    /// Pending operations are abandoned: their callbacks never fire.
    /// Idempotent; also runs on drop.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;

        self.core.shutdown.store(true, Ordering::SeqCst);
        // Free a boss parked in the kernel.
        self.core.unblock.signal();
        for handle in self.reapers.drain(..) {
            let _ = handle.join();
        }

        self.core.dispatcher.shutdown();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }

        self.core.unblock.dispose();
        log::debug!("ring disposed");
    }
}

impl Drop for Ring {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl AsRawFd for Ring {
    fn as_raw_fd(&self) -> RawFd {
        self.core.fd.as_raw_fd()
    }
}

impl Default for Builder {
    fn default() -> Builder {
        Builder {
            dontfork: false,
            completion_threads: 1,
            dispatch_async: false,
            params: sys::io_uring_params::default(),
        }
    }
}

impl Builder {
    /// Number of reaper threads. Clamped to at least one.
    pub fn completion_threads(&mut self, n: usize) -> &mut Self {
        self.completion_threads = cmp::max(1, n);
        self
    }

    /// Run continuations on a background worker pool instead of the reaper
    /// threads. Use this when callbacks may block, or submit further
    /// operations aggressively.
    pub fn dispatch_async(&mut self, enabled: bool) -> &mut Self {
        self.dispatch_async = enabled;
        self
    }

    /// Do not make the ring mappings accessible to child processes after a
    /// `fork`.
    pub fn dontfork(&mut self) -> &mut Self {
        self.dontfork = true;
        self
    }

    /// Busy-wait for I/O completions instead of IRQ notification. Only
    /// meaningful for fds opened with `O_DIRECT` on polled block devices.
    pub fn setup_iopoll(&mut self) -> &mut Self {
        self.params.flags |= sys::IORING_SETUP_IOPOLL;
        self
    }

    /// Create a kernel thread that polls the submission queue, letting the
    /// engine submit without entering the kernel. `idle` is the time in
    /// milliseconds before the poll thread sleeps.
    pub fn setup_sqpoll(&mut self, idle: impl Into<Option<u32>>) -> &mut Self {
        self.params.flags |= sys::IORING_SETUP_SQPOLL;
        self.params.sq_thread_idle = idle.into().unwrap_or(0);
        self
    }

    /// Bind the submission poll thread to the given cpu. Only meaningful
    /// together with [`setup_sqpoll`](Self::setup_sqpoll).
    pub fn setup_sqpoll_cpu(&mut self, n: u32) -> &mut Self {
        self.params.flags |= sys::IORING_SETUP_SQ_AFF;
        self.params.sq_thread_cpu = n;
        self
    }

    /// Build a [Ring].
    pub fn build(&self, entries: u32) -> Result<Ring> {
        let (core, workers) = RingCore::with_params(
            entries,
            self.params,
            self.completion_threads,
            self.dispatch_async,
        )?;

        if self.dontfork {
            core.memory.sq_mmap.dontfork()?;
            core.memory.sqe_mmap.dontfork()?;
            if let Some(cq_mmap) = core.memory.cq_mmap.as_ref() {
                cq_mmap.dontfork()?;
            }
        }

        let reapers = reaper::spawn(&core, self.completion_threads)?;

        Ok(Ring {
            core,
            reapers,
            workers,
            disposed: false,
        })
    }
}

impl Parameters {
    pub fn is_setup_sqpoll(&self) -> bool {
        self.0.flags & sys::IORING_SETUP_SQPOLL != 0
    }

    pub fn is_setup_iopoll(&self) -> bool {
        self.0.flags & sys::IORING_SETUP_IOPOLL != 0
    }

    /// Whether both rings live in one mapping. Purely informational; the
    /// engine handles either layout.
    pub fn is_feature_single_mmap(&self) -> bool {
        self.0.features & sys::IORING_FEAT_SINGLE_MMAP != 0
    }

    /// Whether the kernel buffers completion events internally when the CQ
    /// ring is full instead of dropping them. Without it a slow consumer
    /// can hit [`Error::CompletionQueueOverflow`].
    pub fn is_feature_nodrop(&self) -> bool {
        self.0.features & sys::IORING_FEAT_NODROP != 0
    }

    /// Whether submission data is fully consumed by the time the submit
    /// call returns, so entry-referenced memory can be reused immediately.
    pub fn is_feature_submit_stable(&self) -> bool {
        self.0.features & sys::IORING_FEAT_SUBMIT_STABLE != 0
    }

    /// Whether read/write operations accept `offset == -1` to mean the
    /// current file position.
    pub fn is_feature_rw_cur_pos(&self) -> bool {
        self.0.features & sys::IORING_FEAT_RW_CUR_POS != 0
    }

    /// Whether requests run with the credentials of the task that entered
    /// the kernel rather than the one that created the ring.
    pub fn is_feature_cur_personality(&self) -> bool {
        self.0.features & sys::IORING_FEAT_CUR_PERSONALITY != 0
    }

    pub fn sq_entries(&self) -> u32 {
        self.0.sq_entries
    }

    pub fn cq_entries(&self) -> u32 {
        self.0.cq_entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::squeue::Enter;

    // A core without reapers: exercises the adapters directly.
    #[test]
    fn test_core_stage_submit_read() -> Result<()> {
        let (core, _workers) = RingCore::with_params(4, Default::default(), 1, false)?;

        let op = core.pool.acquire(Box::new(|_| {}));
        let outcome = core.sq.stage_one(opcode::Nop::new().build(), Some(op))?;
        assert_eq!(core.registry.pending(), 1);

        match core.sq.submit_and_wait(0)? {
            Enter::Submitted(_) => {}
            Enter::AwaitCompletions => panic!("empty ring cannot be busy"),
        }

        // The armed unblock read never completes without a signal, so the
        // blocking read returns the nop.
        let completion = core.cq.read()?;
        assert_eq!(completion.token, outcome.token);
        assert_eq!(completion.result, 0);

        let mut op = core.registry.remove(completion.token).unwrap();
        op.invoke(completion.result);
        core.pool.release(op);
        assert_eq!(core.registry.pending(), 0);
        Ok(())
    }

    #[test]
    fn test_core_full_queue_accounting() -> Result<()> {
        let (core, _workers) = RingCore::with_params(4, Default::default(), 1, false)?;

        // One slot is taken by the unblock read.
        assert_eq!(core.sq.used(), 1);
        for _ in 0..3 {
            let op = core.pool.acquire(Box::new(|_| {}));
            core.sq.stage_one(opcode::Nop::new().build(), Some(op))?;
        }
        assert_eq!(core.sq.used(), 4);
        assert_eq!(core.sq.available(), 0);

        let op = core.pool.acquire(Box::new(|_| {}));
        match core.sq.stage_one(opcode::Nop::new().build(), Some(op)) {
            Err(Error::SubmissionQueueFull) => {}
            _ => panic!("expected full queue"),
        }
        Ok(())
    }

    #[test]
    fn test_core_linked_batch_rejected_whole() -> Result<()> {
        let (core, _workers) = RingCore::with_params(4, Default::default(), 1, false)?;

        // Leave exactly one free slot (the unblock read holds another).
        for _ in 0..2 {
            let op = core.pool.acquire(Box::new(|_| {}));
            core.sq.stage_one(opcode::Nop::new().build(), Some(op))?;
        }
        assert_eq!(core.sq.available(), 1);
        let pending = core.registry.pending();

        let pair = vec![
            (
                opcode::Nop::new().build().flags(Flags::IO_LINK),
                core.pool.acquire(Box::new(|_| {})),
            ),
            (
                opcode::Nop::new().build(),
                core.pool.acquire(Box::new(|_| {})),
            ),
        ];
        match core.sq.stage_many(pair) {
            Err(Error::SubmissionQueueFull) => {}
            _ => panic!("expected atomic rejection"),
        }
        // Neither half staged, no token issued.
        assert_eq!(core.registry.pending(), pending);
        assert_eq!(core.sq.available(), 1);

        let op = core.pool.acquire(Box::new(|_| {}));
        core.sq.stage_one(opcode::Nop::new().build(), Some(op))?;
        assert_eq!(core.sq.available(), 0);
        Ok(())
    }
}
