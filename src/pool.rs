// SPDX-License-Identifier: MPL-2.0

//! The bounded worker pool and its condition-variable handoff protocol.
//!
//! A band (a priority level's modules, or the due entries in the schedule
//! queue) is driven by a small fixed pool of worker threads plus the thread
//! that called `Loop::run`. Each worker free-runs `FreeAsync` and
//! `BoundedAsync` units as it claims them; when it claims a
//! `SingleThreaded` unit it instead stops and waits, because that unit must
//! run on the driving thread. Once every worker has either exhausted the
//! band (`Done`) or is waiting on a `SingleThreaded` unit (`Passing`), the
//! driving thread runs that one unit itself and releases the workers to
//! continue. A mix of `Done` and `Passing` across workers is impossible by
//! construction: the band is a single ordered sequence and a worker only
//! stops at the first `SingleThreaded` unit it would otherwise skip past.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use log::debug;

use crate::module::ExecutionType;

/// A single runnable item of work within a band, tagged with how it should
/// be dispatched.
pub(crate) struct Unit {
    pub(crate) exec_type: ExecutionType,
    pub(crate) run: Box<dyn FnOnce() + Send>,
}

/// What a worker found when it tried to claim the next unit in a band.
pub(crate) enum Claim {
    /// The band is exhausted; this worker is done.
    Empty,
    /// A unit this worker should run itself (`FreeAsync`: detach a thread;
    /// `BoundedAsync`: run inline).
    Ready(Unit),
    /// The next unit is `SingleThreaded`; the worker must stop and wait for
    /// the driving thread to run it.
    SingleThreaded,
}

/// Where a band's units come from. Implemented once for a fixed slice (a
/// priority band's modules) and once for the live schedule queue (which is
/// drained dynamically, since new jobs may be due only as tick time
/// advances within the drain).
pub(crate) trait UnitSource: Send + Sync {
    /// Atomically inspects and, if appropriate, claims the next unit.
    fn try_claim(&self) -> Claim;

    /// Removes and returns the `SingleThreaded` unit `try_claim` last
    /// reported. Called only by the driving thread, only after every
    /// worker has reported `Passing`.
    fn take_single_threaded(&self) -> Unit;
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum WorkerState {
    Ready,
    Working,
    Passing,
    Done,
}

struct PoolState {
    worker_states: Vec<WorkerState>,
    terminate: bool,
    source: Option<Arc<dyn UnitSource>>,
}

struct PoolShared {
    state: Mutex<PoolState>,
    condvar: Condvar,
}

/// A bounded pool of worker threads, spun up for the duration of one
/// `Loop::run` call and torn down when it returns.
pub(crate) struct WorkerPool {
    shared: Arc<PoolShared>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub(crate) fn new(worker_count: usize) -> Self {
        let worker_count = worker_count.max(1);
        let shared = Arc::new(PoolShared {
            state: Mutex::new(PoolState {
                worker_states: vec![WorkerState::Ready; worker_count],
                terminate: false,
                source: None,
            }),
            condvar: Condvar::new(),
        });
        debug!("worker pool starting with {worker_count} threads");
        let workers = (0..worker_count)
            .map(|id| {
                let shared = Arc::clone(&shared);
                std::thread::Builder::new()
                    .name(format!("taskloop-worker-{id}"))
                    .spawn(move || worker_loop(id, shared))
                    .expect("failed to spawn worker thread")
            })
            .collect();
        WorkerPool { shared, workers }
    }

    /// Runs `source` to exhaustion, handing `SingleThreaded` units back to
    /// the calling thread as they come up. Blocks until the whole band has
    /// been consumed.
    pub(crate) fn run_band(&self, source: Arc<dyn UnitSource>) {
        {
            let mut state = self.shared.state.lock().unwrap_or_else(|e| e.into_inner());
            state.source = Some(Arc::clone(&source));
            for s in state.worker_states.iter_mut() {
                *s = WorkerState::Ready;
            }
        }
        self.shared.condvar.notify_all();

        loop {
            let mut state = self.shared.state.lock().unwrap_or_else(|e| e.into_inner());
            state = self
                .shared
                .condvar
                .wait_while(state, |s| {
                    let all_done = s.worker_states.iter().all(|w| *w == WorkerState::Done);
                    let all_passing = s.worker_states.iter().all(|w| *w == WorkerState::Passing);
                    !all_done && !all_passing
                })
                .unwrap_or_else(|e| e.into_inner());

            let all_done = state.worker_states.iter().all(|w| *w == WorkerState::Done);
            if all_done {
                return;
            }

            drop(state);
            let unit = source.take_single_threaded();
            (unit.run)();

            let mut state = self.shared.state.lock().unwrap_or_else(|e| e.into_inner());
            for s in state.worker_states.iter_mut() {
                *s = WorkerState::Ready;
            }
            drop(state);
            self.shared.condvar.notify_all();
        }
    }

    /// Signals every worker to exit and joins them. Blocks until all
    /// threads have terminated.
    pub(crate) fn shutdown(mut self) {
        {
            let mut state = self.shared.state.lock().unwrap_or_else(|e| e.into_inner());
            state.terminate = true;
            for s in state.worker_states.iter_mut() {
                *s = WorkerState::Ready;
            }
        }
        self.shared.condvar.notify_all();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        debug!("worker pool shut down");
    }
}

fn worker_loop(id: usize, shared: Arc<PoolShared>) {
    'outer: loop {
        let mut state = shared.state.lock().unwrap_or_else(|e| e.into_inner());
        state = shared
            .condvar
            .wait_while(state, |s| s.worker_states[id] != WorkerState::Ready)
            .unwrap_or_else(|e| e.into_inner());

        if state.terminate {
            state.worker_states[id] = WorkerState::Done;
            drop(state);
            shared.condvar.notify_all();
            return;
        }
        let source = state.source.clone();
        state.worker_states[id] = WorkerState::Working;
        drop(state);

        let Some(source) = source else {
            // No band has been posted yet; nothing to do but report done.
            let mut state = shared.state.lock().unwrap_or_else(|e| e.into_inner());
            state.worker_states[id] = WorkerState::Done;
            drop(state);
            shared.condvar.notify_all();
            continue 'outer;
        };

        loop {
            match source.try_claim() {
                Claim::Empty => {
                    let mut state = shared.state.lock().unwrap_or_else(|e| e.into_inner());
                    state.worker_states[id] = WorkerState::Done;
                    drop(state);
                    shared.condvar.notify_all();
                    continue 'outer;
                }
                Claim::Ready(unit) => match unit.exec_type {
                    ExecutionType::FreeAsync => {
                        let run = unit.run;
                        std::thread::spawn(move || run());
                    }
                    _ => (unit.run)(),
                },
                Claim::SingleThreaded => {
                    let mut state = shared.state.lock().unwrap_or_else(|e| e.into_inner());
                    state.worker_states[id] = WorkerState::Passing;
                    drop(state);
                    shared.condvar.notify_all();
                    continue 'outer;
                }
            }
        }
    }
}
