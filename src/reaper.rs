//! The reaper pool.
//!
//! `N >= 1` threads drive the kernel. Each cycle the boss (thread 0)
//! publishes staged submissions and makes the `io_uring_enter` call,
//! parking in the kernel when the engine is idle; all members then meet at
//! a barrier and cooperatively drain the completion queue. Shutdown raises
//! a flag and wakes the boss through the unblock handle, and every thread
//! observes the flag at the common post-barrier point and exits.

use std::io;
use std::sync::atomic::Ordering;
use std::sync::{mpsc, Arc, Barrier};
use std::thread::{self, JoinHandle};

use crate::squeue::Enter;
use crate::RingCore;

pub(crate) fn spawn(core: &Arc<RingCore>, threads: usize) -> io::Result<Vec<JoinHandle<()>>> {
    let mut handles = Vec::with_capacity(threads);
    let mut gates = Vec::with_capacity(threads);

    // The shared barrier is handed over only once every member thread
    // exists; a failed spawn drops the gates and the already-running
    // threads exit before their first wait.
    for i in 0..threads {
        let core = core.clone();
        let (gate_tx, gate_rx) = mpsc::channel::<Arc<Barrier>>();
        let handle = thread::Builder::new()
            .name(format!("uring-reaper-{}", i))
            .spawn(move || {
                let barrier = match gate_rx.recv() {
                    Ok(barrier) => barrier,
                    Err(_) => return,
                };
                reaper_main(core, barrier, i == 0);
            })?;
        handles.push(handle);
        gates.push(gate_tx);
    }

    let barrier = Arc::new(Barrier::new(threads));
    for gate in gates {
        gate.send(barrier.clone()).ok();
    }

    Ok(handles)
}

fn reaper_main(core: Arc<RingCore>, barrier: Arc<Barrier>, boss: bool) {
    log::debug!("reaper started (boss: {})", boss);

    loop {
        if boss && !core.shutdown.load(Ordering::SeqCst) {
            synchronize(&core);
        }

        // Every member passes the barrier exactly once per cycle, so a
        // thread may only leave the loop at the common point below.
        barrier.wait();

        if core.shutdown.load(Ordering::SeqCst) {
            break;
        }

        drain(&core);
    }

    log::debug!("reaper exiting");
}

/// Publish staged entries and enter the kernel, parking when idle.
fn synchronize(core: &RingCore) {
    let plan = core.sq.prepare_reap(core.cq.is_empty(), &core.unblock);
    if !plan.enter {
        return;
    }

    match core.sq.enter(plan.to_submit, plan.min_complete, plan.flags) {
        Ok(Enter::Submitted(_)) => {}
        // EAGAIN/EBUSY: the drain below frees completion slots, then the
        // next cycle resubmits.
        Ok(Enter::AwaitCompletions) => {}
        Err(err) => {
            log::error!("io_uring_enter failed, shutting down ring: {}", err);
            core.shutdown.store(true, Ordering::SeqCst);
        }
    }
}

/// Dequeue completions until the queue reads empty, dispatching each one.
fn drain(core: &RingCore) {
    loop {
        match core.cq.try_read() {
            Ok(Some(completion)) => {
                if core.unblock.matches(completion.token) {
                    core.unblock.on_completion(completion.result, &core.sq);
                    continue;
                }
                match core.registry.remove(completion.token) {
                    Some(op) => core.dispatcher.dispatch(op, completion.result, &core.pool),
                    None => {
                        log::warn!("completion for unknown token {:#x}", completion.token)
                    }
                }
            }
            Ok(None) => break,
            Err(err) => {
                // Completion overflow is terminal: callbacks were lost.
                log::error!("aborting reapers: {}", err);
                core.shutdown.store(true, Ordering::SeqCst);
                core.unblock.signal();
                break;
            }
        }
    }
}
