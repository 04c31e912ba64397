//! Completion dispatch: inline on the reaper, or handed to a worker pool.

use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Sender};
use parking_lot::Mutex;

use crate::op::{Operation, Pool};

pub(crate) struct Dispatcher {
    /// `None` means inline dispatch. The sender is taken at shutdown so the
    /// workers observe a disconnect and drain out.
    sender: Mutex<Option<Sender<Operation>>>,
}

impl Dispatcher {
    /// Callbacks run directly on the reaper that dequeued the completion.
    pub fn inline() -> (Dispatcher, Vec<JoinHandle<()>>) {
        (
            Dispatcher {
                sender: Mutex::new(None),
            },
            Vec::new(),
        )
    }

    /// Callbacks run on `workers` background threads.
    pub fn with_workers(
        workers: usize,
        pool: Arc<Pool>,
    ) -> io::Result<(Dispatcher, Vec<JoinHandle<()>>)> {
        let (sender, receiver) = unbounded::<Operation>();

        let handles = (0..workers)
            .map(|i| {
                let receiver = receiver.clone();
                let pool = pool.clone();
                thread::Builder::new()
                    .name(format!("uring-dispatch-{}", i))
                    .spawn(move || {
                        for mut op in receiver.iter() {
                            run_contained(|| op.invoke_cached());
                            pool.release(op);
                        }
                    })
            })
            .collect::<io::Result<Vec<_>>>()?;

        Ok((
            Dispatcher {
                sender: Mutex::new(Some(sender)),
            },
            handles,
        ))
    }

    /// Dispatch one completed operation and return its record to the pool.
    ///
    /// The monitor is not held while the continuation runs; a continuation
    /// is free to submit new operations.
    pub fn dispatch(&self, mut op: Operation, result: i32, pool: &Pool) {
        let sender = self.sender.lock().clone();
        if let Some(sender) = sender {
            op.cache_result(result);
            if let Err(err) = sender.send(op) {
                // Workers already gone; run the continuation here rather
                // than dropping it.
                let mut op = err.into_inner();
                run_contained(|| op.invoke_cached());
                pool.release(op);
            }
        } else {
            run_contained(|| op.invoke(result));
            pool.release(op);
        }
    }

    /// Disconnect the workers. They finish queued continuations and exit.
    pub fn shutdown(&self) {
        self.sender.lock().take();
    }
}

/// A panicking continuation must not take down a reaper or desync the
/// reaper barrier.
fn run_contained<F: FnOnce()>(f: F) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        log::error!("completion callback panicked");
    }
}
