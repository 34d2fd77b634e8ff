// SPDX-License-Identifier: MPL-2.0

//! The prioritized, multi-threaded tick loop.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use log::{debug, info};

use crate::error::Error;
use crate::module::{ExecutionType, Module, ModuleHandle, Priority};
use crate::module_list::ModuleList;
use crate::pool::{Claim, Unit, UnitSource, WorkerPool};
use crate::prelude::Result;
use crate::schedule::{ExceptionHandler, ScheduledJob, ScheduledTask, ScheduleQueue};
use crate::sync::RecursiveMutex;
use crate::time::LoopClock;

/// Tuning knobs for a [`Loop`].
///
/// There is currently exactly one: how many worker threads to spin up per
/// `run()` call. Everything else about the tick algorithm (band ordering,
/// the zero band, the three execution disciplines) is part of the engine's
/// contract, not something to configure away.
#[derive(Debug, Clone, Default)]
pub struct LoopConfig {
    worker_count: Option<usize>,
}

impl LoopConfig {
    /// Creates a default configuration: worker count taken from
    /// [`std::thread::available_parallelism`].
    pub fn new() -> Self {
        LoopConfig::default()
    }

    /// Overrides the worker pool size. Values are clamped to at least `1`.
    pub fn worker_count(mut self, count: usize) -> Self {
        self.worker_count = Some(count.max(1));
        self
    }

    fn resolve_worker_count(&self) -> usize {
        self.worker_count.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }
}

struct LoopState {
    running: bool,
    stop_requested: bool,
    start_time: Option<Instant>,
    clock: LoopClock,
    schedules: ScheduleQueue,
}

impl LoopState {
    fn new() -> Self {
        LoopState {
            running: false,
            stop_requested: false,
            start_time: None,
            clock: LoopClock::default(),
            schedules: ScheduleQueue::new(),
        }
    }
}

pub(crate) struct LoopInner {
    state: RecursiveMutex<LoopState>,
    modules: ModuleList,
    config: LoopConfig,
}

impl LoopInner {
    pub(crate) fn is_running(&self) -> bool {
        self.state.shared_lock().running
    }

    pub(crate) fn time(&self) -> f64 {
        self.state.shared_lock().clock.time()
    }

    pub(crate) fn time_diff(&self) -> f64 {
        self.state.shared_lock().clock.time_diff()
    }

    pub(crate) fn present_time(&self) -> f64 {
        let guard = self.state.shared_lock();
        match guard.start_time {
            Some(start) => start.elapsed().as_secs_f64(),
            None => 0.0,
        }
    }

    /// Pushes a job into the schedule queue. Shared by [`Loop::schedule`]
    /// and [`ModuleHandle::schedule`] (which additionally wires the
    /// module's own `on_exception` as the handler).
    pub(crate) fn schedule(
        &self,
        fire_time: f64,
        exec_type: ExecutionType,
        task: ScheduledTask,
        on_exception: Option<ExceptionHandler>,
    ) -> Result<()> {
        let mut guard = self.state.lock()?;
        guard.schedules.push(
            fire_time,
            ScheduledJob {
                exec_type,
                task,
                on_exception,
            },
        );
        Ok(())
    }
}

/// A prioritized, multi-threaded loop that drives attached [`Module`]s
/// through tick-based update cycles, interleaved with a time-keyed
/// schedule queue.
///
/// Cloning a `Loop` is cheap and shares the same underlying engine; this is
/// the handle callers pass around (and the handle a [`ModuleHandle`] holds
/// a weak reference to, so it can call back into the loop it is attached
/// to without keeping it alive unilaterally).
#[derive(Clone)]
pub struct Loop {
    inner: Arc<LoopInner>,
}

impl Default for Loop {
    fn default() -> Self {
        Loop::new()
    }
}

impl Loop {
    /// Creates a new, stopped loop with default configuration.
    pub fn new() -> Self {
        Loop::with_config(LoopConfig::default())
    }

    /// Creates a new, stopped loop with the given configuration.
    pub fn with_config(config: LoopConfig) -> Self {
        Loop {
            inner: Arc::new(LoopInner {
                state: RecursiveMutex::new(LoopState::new()),
                modules: ModuleList::new(),
                config,
            }),
        }
    }

    /// Returns a handle for attaching, detaching, and replacing modules.
    pub fn modules(&self) -> Modules<'_> {
        Modules { inner: &self.inner }
    }

    /// Whether the loop is currently inside a `run()` call.
    pub fn is_running(&self) -> bool {
        self.inner.is_running()
    }

    /// The elapsed time, in seconds, since `run()` was called, frozen for
    /// the current tick.
    pub fn time(&self) -> f64 {
        self.inner.time()
    }

    /// The elapsed time, in seconds, since the previous tick.
    pub fn time_diff(&self) -> f64 {
        self.inner.time_diff()
    }

    /// The elapsed time since `run()` was called, read live from the clock
    /// rather than frozen to the current tick.
    pub fn present_time(&self) -> f64 {
        self.inner.present_time()
    }

    /// Requests that the loop stop. Takes effect at the end of the
    /// in-progress band; has no effect if the loop is not running.
    pub fn stop(&self) {
        self.inner.state.lock().expect("stop is never reentered into a reader").stop_requested = true;
    }

    /// Schedules `task` to run once, at `fire_time` seconds on the loop's
    /// clock, dispatched under `exec_type`. `on_exception` is invoked (on
    /// whichever thread runs the task) if `task` returns an error;
    /// defaults to logging a warning if not supplied.
    pub fn schedule(
        &self,
        fire_time: f64,
        exec_type: ExecutionType,
        task: ScheduledTask,
        on_exception: Option<ExceptionHandler>,
    ) -> Result<()> {
        self.inner.schedule(fire_time, exec_type, task, on_exception)
    }

    /// Convenience form of [`Loop::schedule`] for a `BoundedAsync` task
    /// with no custom exception handler, time-first.
    pub fn schedule_at(&self, fire_time: f64, task: ScheduledTask) -> Result<()> {
        self.schedule(fire_time, ExecutionType::BoundedAsync, task, None)
    }

    /// Convenience form of [`Loop::schedule`], task-first, for callers that
    /// would rather lead with the closure than the fire time.
    pub fn schedule_task(
        &self,
        task: ScheduledTask,
        fire_time: f64,
        exec_type: ExecutionType,
    ) -> Result<()> {
        self.schedule(fire_time, exec_type, task, None)
    }

    /// Runs the loop until [`Loop::stop`] is called or every module is
    /// detached. Returns an error if the loop is already running, or if a
    /// module's `on_start`/`on_enable` raised during startup.
    pub fn run(&self) -> Result<()> {
        {
            let mut guard = self.inner.state.lock()?;
            if guard.running {
                return Err(Error::usage("loop is already running"));
            }
            guard.running = true;
            guard.stop_requested = false;
            guard.start_time = Some(Instant::now());
            guard.clock = LoopClock::default();

            // Hooks run while the exclusive guard above is still held: a
            // module's on_start attaching another module recursively needs
            // the reentrant shared-lock path, which RecursiveMutex
            // supports and std::sync::RwLock does not guarantee.
            let snapshot = self.inner.modules.snapshot();
            for handle in &snapshot {
                handle.start_and_enable()?;
            }
        }
        info!("loop started");

        let pool = WorkerPool::new(self.inner.config.resolve_worker_count());
        loop {
            let (stop_requested, is_empty) = self.run_one_tick(&pool)?;
            if stop_requested || is_empty {
                break;
            }
        }
        pool.shutdown();

        {
            let mut guard = self.inner.state.lock()?;
            let snapshot = self.inner.modules.snapshot();
            let mut first_err = None;
            for handle in snapshot.iter().rev() {
                if let Err(err) = handle.disable_and_stop() {
                    first_err.get_or_insert(err);
                }
            }
            guard.running = false;
            guard.schedules.clear();
            guard.clock = LoopClock::default();
            guard.start_time = None;
            if let Some(err) = first_err {
                return Err(err);
            }
        }
        info!("loop stopped");
        Ok(())
    }

    /// Runs one tick: recomputes the clock, drains the schedule queue at
    /// the zero band, and walks every module band in ascending priority
    /// order. Returns `(stop_requested, modules_now_empty)`.
    fn run_one_tick(&self, pool: &WorkerPool) -> Result<(bool, bool)> {
        {
            let mut guard = self.inner.state.lock()?;
            let now = guard
                .start_time
                .expect("start_time is set before the first tick")
                .elapsed()
                .as_secs_f64();
            guard.clock.tick(now);
        }

        let snapshot = self.inner.modules.snapshot();
        let mut schedule_drained = false;
        let mut current_priority: i16 = i8::MIN as i16;
        let mut idx = 0usize;

        loop {
            let next_priority = snapshot.get(idx).map(|h| h.priority().value() as i16);
            match next_priority {
                None if current_priority <= 0 && !schedule_drained => current_priority = 0,
                None => break,
                Some(p) if current_priority < p => {
                    if current_priority <= 0 && p > 0 && !schedule_drained {
                        current_priority = 0;
                    } else {
                        current_priority = p;
                    }
                }
                Some(_) => {}
            }

            if current_priority == 0 && !schedule_drained {
                schedule_drained = true;
                self.drain_schedules(pool);
            }

            let band_start = idx;
            while snapshot
                .get(idx)
                .is_some_and(|h| h.priority().value() as i16 == current_priority)
            {
                idx += 1;
            }
            if band_start < idx {
                self.run_module_band(&snapshot[band_start..idx], pool);
            }

            if self.inner.state.shared_lock().stop_requested {
                return Ok((true, snapshot.is_empty()));
            }
            if idx >= snapshot.len() && schedule_drained && current_priority >= i8::MAX as i16 {
                break;
            }
        }

        let is_empty = self.inner.modules.is_empty();
        let stop_requested = self.inner.state.shared_lock().stop_requested;
        Ok((stop_requested, is_empty))
    }

    fn run_module_band(&self, band: &[Arc<ModuleHandle>], pool: &WorkerPool) {
        let source: Arc<dyn UnitSource> = Arc::new(ModuleBandSource {
            units: band.to_vec(),
            cursor: AtomicUsize::new(0),
        });
        pool.run_band(source);
    }

    fn drain_schedules(&self, pool: &WorkerPool) {
        let now = self.inner.state.shared_lock().clock.time();
        let source: Arc<dyn UnitSource> = Arc::new(ScheduleBandSource {
            state: Arc::clone(&self.inner),
            now,
        });
        pool.run_band(source);
    }
}

struct ModuleBandSource {
    units: Vec<Arc<ModuleHandle>>,
    cursor: AtomicUsize,
}

impl UnitSource for ModuleBandSource {
    fn try_claim(&self) -> Claim {
        loop {
            let i = self.cursor.load(Ordering::Acquire);
            if i >= self.units.len() {
                return Claim::Empty;
            }
            let exec_type = self.units[i].execution_type();
            if exec_type == ExecutionType::SingleThreaded {
                return Claim::SingleThreaded;
            }
            if self
                .cursor
                .compare_exchange(i, i + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                let handle = Arc::clone(&self.units[i]);
                return Claim::Ready(Unit {
                    exec_type,
                    run: Box::new(move || handle.run_update()),
                });
            }
        }
    }

    fn take_single_threaded(&self) -> Unit {
        let i = self.cursor.fetch_add(1, Ordering::AcqRel);
        let handle = Arc::clone(&self.units[i]);
        Unit {
            exec_type: ExecutionType::SingleThreaded,
            run: Box::new(move || handle.run_update()),
        }
    }
}

struct ScheduleBandSource {
    state: Arc<LoopInner>,
    now: f64,
}

impl UnitSource for ScheduleBandSource {
    fn try_claim(&self) -> Claim {
        let mut guard = self.state.state.lock().expect("schedule drain never deadlocks");
        match guard.schedules.peek_due(self.now) {
            None => Claim::Empty,
            Some(ExecutionType::SingleThreaded) => Claim::SingleThreaded,
            Some(exec_type) => {
                let job = guard
                    .schedules
                    .pop_due(self.now)
                    .expect("peek_due just confirmed a due entry");
                Claim::Ready(Unit {
                    exec_type,
                    run: Box::new(move || job.run()),
                })
            }
        }
    }

    fn take_single_threaded(&self) -> Unit {
        let mut guard = self.state.state.lock().expect("schedule drain never deadlocks");
        let job = guard
            .schedules
            .pop_due(self.now)
            .expect("caller only calls this after try_claim reported SingleThreaded");
        Unit {
            exec_type: ExecutionType::SingleThreaded,
            run: Box::new(move || job.run()),
        }
    }
}

/// A handle for attaching, detaching, and replacing a [`Loop`]'s modules.
pub struct Modules<'a> {
    inner: &'a Arc<LoopInner>,
}

impl Modules<'_> {
    /// Attaches `module` at `priority`, starting it synchronously on the
    /// calling thread if the loop is currently running.
    pub fn add(&self, module: Arc<dyn Module>, priority: Priority) -> Result<Arc<ModuleHandle>> {
        let handle = ModuleHandle::new(module, priority);
        let guard = self.inner.state.shared_lock();
        let is_running = guard.running;
        self.inner
            .modules
            .add(Arc::clone(&handle), Arc::downgrade(self.inner), is_running)?;
        Ok(handle)
    }

    /// Detaches `handle`, stopping it synchronously on the calling thread
    /// if the loop is currently running.
    pub fn remove(&self, handle: &Arc<ModuleHandle>) -> Result<()> {
        let guard = self.inner.state.shared_lock();
        let is_running = guard.running;
        self.inner.modules.remove(handle, is_running)
    }

    /// Replaces the module at `index` (in priority order) with `module`,
    /// which must share the same priority as the module it replaces.
    pub fn set_item(
        &self,
        index: usize,
        module: Arc<dyn Module>,
        priority: Priority,
    ) -> Result<Arc<ModuleHandle>> {
        let replacement = ModuleHandle::new(module, priority);
        let guard = self.inner.state.shared_lock();
        let is_running = guard.running;
        self.inner.modules.set_item(
            index,
            Arc::clone(&replacement),
            Arc::downgrade(self.inner),
            is_running,
        )?;
        Ok(replacement)
    }

    /// Detaches and stops every module, in reverse registration order.
    pub fn clear(&self) -> Result<()> {
        let guard = self.inner.state.shared_lock();
        let is_running = guard.running;
        self.inner.modules.clear(is_running)
    }

    /// The number of attached modules.
    pub fn len(&self) -> usize {
        self.inner.modules.len()
    }

    /// Whether there are no attached modules.
    pub fn is_empty(&self) -> bool {
        self.inner.modules.is_empty()
    }
}

// Only constructed through `Loop`; keeps `Mutex`/`Weak` imports honest for
// the module graph without leaking internal wiring into the public API.
#[allow(dead_code)]
fn _assert_send_sync() {
    fn assert<T: Send + Sync>() {}
    assert::<Loop>();
    assert::<Weak<LoopInner>>();
    assert::<Mutex<()>>();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn schedule_at_and_schedule_task_both_queue_a_job() {
        let app = Loop::new();
        let fired = Arc::new(AtomicBool::new(false));

        let f = Arc::clone(&fired);
        app.schedule_at(
            0.0,
            Box::new(move || {
                f.store(true, Ordering::SeqCst);
                Ok(())
            }),
        )
        .unwrap();
        assert_eq!(app.inner.state.shared_lock().schedules.peek_due(0.0), Some(ExecutionType::BoundedAsync));

        let second_fired = Arc::new(AtomicBool::new(false));
        let f = Arc::clone(&second_fired);
        app.schedule_task(
            Box::new(move || {
                f.store(true, Ordering::SeqCst);
                Ok(())
            }),
            0.0,
            ExecutionType::SingleThreaded,
        )
        .unwrap();

        let mut guard = app.inner.state.lock().unwrap();
        let first = guard.schedules.pop_due(0.0).unwrap();
        assert_eq!(first.exec_type, ExecutionType::BoundedAsync);
        first.run();
        let second = guard.schedules.pop_due(0.0).unwrap();
        assert_eq!(second.exec_type, ExecutionType::SingleThreaded);
        second.run();
        drop(guard);

        assert!(fired.load(Ordering::SeqCst));
        assert!(second_fired.load(Ordering::SeqCst));
    }

    #[test]
    fn run_fails_if_already_running() {
        let app = Loop::new();
        app.inner.state.lock().unwrap().running = true;
        let err = app.run().unwrap_err();
        assert!(matches!(err, Error::Usage(_)));
    }
}
