//! Background WAL-checkpoint worker.
//!
//! Spec.md §4.3. Absorbs checkpoint latency off the foreground dedup loop.
//! Lazily started on the first [`Checkpointer::please_checkpoint`] call, and
//! owns its own database connection so it never contends with the
//! foreground one (see `SqliteCatalog::open_checkpoint_connection`).
//!
//! The signal is a single-slot, coalescing condition variable rather than a
//! channel: several requests issued before the worker wakes collapse into
//! one checkpoint, matching the "boolean event flag" of the original tool
//! (design note in spec.md §9).

use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use log::warn;
use rusqlite::Connection;

/// Both flags live behind one mutex so `please_checkpoint`/`close` and the
/// worker loop can never acquire them in opposite orders.
#[derive(Default)]
struct State {
    pending: bool,
    done: bool,
}

struct Signal {
    state: Mutex<State>,
    cvar: Condvar,
}

/// Runs WAL checkpoints on a background thread, decoupling foreground
/// commit latency from checkpoint work.
pub struct Checkpointer {
    signal: Arc<Signal>,
    worker: Mutex<Option<JoinHandle<()>>>,
    connect: Arc<dyn Fn() -> rusqlite::Result<Connection> + Send + Sync>,
}

impl Checkpointer {
    /// Builds a checkpointer that will open its own connection via
    /// `connect` the first time it is asked to run.
    pub fn new<F>(connect: F) -> Self
    where
        F: Fn() -> rusqlite::Result<Connection> + Send + Sync + 'static,
    {
        Self {
            signal: Arc::new(Signal {
                state: Mutex::new(State::default()),
                cvar: Condvar::new(),
            }),
            worker: Mutex::new(None),
            connect: Arc::new(connect),
        }
    }

    /// Signals a one-shot checkpoint request. Idempotent: multiple calls
    /// before the worker wakes up collapse into a single checkpoint. Starts
    /// the worker thread on first use.
    pub fn please_checkpoint(&self) {
        {
            let mut state = self.signal.state.lock().unwrap();
            state.pending = true;
        }
        self.signal.cvar.notify_one();

        let mut worker = self.worker.lock().unwrap();
        if worker.is_none() {
            let signal = Arc::clone(&self.signal);
            let connect = Arc::clone(&self.connect);
            *worker = Some(
                std::thread::Builder::new()
                    .name("checkpointer".into())
                    .spawn(move || worker_loop(signal, connect.as_ref()))
                    .expect("failed to spawn checkpointer thread"),
            );
        }
    }

    /// Signals termination and waits for the worker to exit. A no-op if the
    /// worker was never started.
    pub fn close(&self) {
        {
            let mut state = self.signal.state.lock().unwrap();
            state.done = true;
            state.pending = true;
        }
        self.signal.cvar.notify_one();
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

fn worker_loop(signal: Arc<Signal>, connect: &(dyn Fn() -> rusqlite::Result<Connection> + Send + Sync)) {
    let conn = match connect() {
        Ok(c) => c,
        Err(e) => {
            warn!("checkpointer: failed to open database connection: {e}");
            return;
        }
    };
    loop {
        let mut state = signal.state.lock().unwrap();
        while !state.pending {
            state = signal.cvar.wait(state).unwrap();
        }
        if let Err(e) = conn.execute_batch("PRAGMA wal_checkpoint;") {
            // Checkpoints are best-effort; failures are non-fatal per
            // spec.md §7.
            warn!("checkpointer: WAL checkpoint failed: {e}");
        }
        state.pending = false;
        let terminate = state.done;
        drop(state);
        if terminate {
            return;
        }
    }
}

impl Drop for Checkpointer {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkpoint_requests_coalesce_and_close_joins_worker() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cp.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.pragma_update(None, "journal_mode", "WAL").unwrap();
            conn.execute_batch("CREATE TABLE t (x INTEGER);").unwrap();
        }
        let path_for_connect = path.clone();
        let cp = Checkpointer::new(move || Connection::open(&path_for_connect));
        cp.please_checkpoint();
        cp.please_checkpoint();
        cp.please_checkpoint();
        cp.close();
    }
}
