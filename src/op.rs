//! Pending operations: the record, the freelist pool, and the token registry.

use std::collections::HashMap;

use parking_lot::Mutex;

/// A completion continuation. Receives the raw kernel result: `>= 0` is the
/// operation's success value, `< 0` a negated errno.
pub type Callback = Box<dyn FnOnce(i32) + Send + 'static>;

/// A pending operation: its continuation and, during deferred dispatch,
/// the cached kernel result.
pub(crate) struct Operation {
    callback: Option<Callback>,
    result: i32,
}

impl Operation {
    fn empty() -> Operation {
        Operation {
            callback: None,
            result: 0,
        }
    }

    /// Stash the result for a worker thread to dispatch later.
    pub fn cache_result(&mut self, result: i32) {
        self.result = result;
    }

    /// Invoke the continuation with the cached result.
    ///
    /// The record gives up its callback here; a second call is a no-op,
    /// which keeps the single-dispatch rule even on a buggy path.
    pub fn invoke_cached(&mut self) {
        let result = self.result;
        self.invoke(result);
    }

    /// Invoke the continuation with `result`.
    pub fn invoke(&mut self, result: i32) {
        if let Some(callback) = self.callback.take() {
            callback(result);
        }
    }
}

/// Freelist of operation record shells.
///
/// A record is reachable from exactly one of the registry, the dispatch
/// path, or this pool.
pub(crate) struct Pool {
    free: Mutex<Vec<Operation>>,
    capacity: usize,
}

impl Pool {
    /// `capacity` bounds how many idle shells are retained.
    pub fn new(capacity: usize) -> Pool {
        Pool {
            free: Mutex::new(Vec::new()),
            capacity,
        }
    }

    pub fn acquire(&self, callback: Callback) -> Operation {
        let mut op = self.free.lock().pop().unwrap_or_else(Operation::empty);
        op.callback = Some(callback);
        op.result = 0;
        op
    }

    pub fn release(&self, mut op: Operation) {
        debug_assert!(op.callback.is_none(), "released operation still armed");
        op.callback = None;
        let mut free = self.free.lock();
        if free.len() < self.capacity {
            free.push(op);
        }
    }
}

/// Concurrent map from user-data token to pending operation.
///
/// A token is inserted while the submission queue monitor is held and
/// removed by exactly one reaper when its completion is dequeued.
pub(crate) struct Registry {
    map: Mutex<HashMap<u64, Operation>>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry {
            map: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert(&self, token: u64, op: Operation) {
        let prev = self.map.lock().insert(token, op);
        debug_assert!(prev.is_none(), "token {:#x} already pending", token);
    }

    pub fn remove(&self, token: u64) -> Option<Operation> {
        self.map.lock().remove(&token)
    }

    /// Number of staged-but-not-yet-completed tokens.
    pub fn pending(&self) -> usize {
        self.map.lock().len()
    }
}
