// SPDX-License-Identifier: MPL-2.0

//! The unit of work the loop drives: [`Module`] and its runtime handle.

use std::any::type_name;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, OnceLock, Weak};

use log::warn;

use crate::error::Error;
use crate::loop_engine::LoopInner;
use crate::prelude::Result;
use crate::schedule::{ExceptionHandler, ScheduledTask};
use crate::sync::SharedCell;

/// A band ordering, lowest-to-highest, in which the loop drives modules.
///
/// Priority is fixed for the lifetime of a module: it is set once, at
/// registration, and never changes. Band `0` is special: it is always
/// visited at least once per tick (even with no modules registered there),
/// immediately before or after the schedule queue is drained, so that
/// time-keyed jobs have a consistent place in the ordering relative to
/// negative- and positive-priority modules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Priority(i8);

impl Priority {
    /// The lowest priority band, visited first each tick.
    pub const MIN: Priority = Priority(i8::MIN);
    /// The highest priority band, visited last each tick.
    pub const MAX: Priority = Priority(i8::MAX);
    /// The default priority new modules are given if none is specified.
    pub const ZERO: Priority = Priority(0);

    /// Creates a priority from a raw band value.
    pub const fn new(value: i8) -> Self {
        Priority(value)
    }

    /// Returns the raw band value.
    pub const fn value(self) -> i8 {
        self.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::ZERO
    }
}

impl From<i8> for Priority {
    fn from(value: i8) -> Self {
        Priority::new(value)
    }
}

/// How the loop dispatches a module's `on_update` (or a scheduled job) each
/// time its band comes up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionType {
    /// Detached onto its own thread; the band does not wait for it to
    /// finish and makes no ordering guarantee relative to other units in
    /// the same band.
    FreeAsync,
    /// Claimed by a worker from the bounded pool; the band waits for every
    /// `BoundedAsync` unit to finish before moving on.
    BoundedAsync,
    /// Forces the worker pool to idle and runs on the thread driving the
    /// tick, in band order, before the band continues.
    SingleThreaded,
}

impl Default for ExecutionType {
    fn default() -> Self {
        ExecutionType::BoundedAsync
    }
}

/// The set of module identities (by data-pointer address, not handle
/// address) currently attached to some loop. Enforces "a Module is
/// attached to at most one Loop at any time" across the process, since a
/// fresh [`ModuleHandle`] is created every time a module is registered and
/// so cannot by itself carry that invariant across two registrations of
/// the same `Arc<dyn Module>`.
fn attached_modules() -> &'static Mutex<HashSet<usize>> {
    static REGISTRY: OnceLock<Mutex<HashSet<usize>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashSet::new()))
}

/// User-supplied work driven by the loop.
///
/// Implementors provide the five lifecycle hooks; `priority` and
/// `execution_type` are read once at registration (`execution_type` may
/// also be read again on re-enable) and are not expected to change
/// afterwards. All hooks are invoked only by the [`crate::Loop`] that owns
/// this module — never called directly by user code.
pub trait Module: Send + Sync {
    /// Called once, synchronously, when the module is attached to a running
    /// loop, or when the loop it is already attached to starts running.
    /// An error here aborts the attachment (or the loop's startup) and
    /// propagates to the caller.
    fn on_start(&self) -> Result<()> {
        Ok(())
    }

    /// Called once, synchronously, immediately after `on_start`, and again
    /// any time the module transitions from disabled to enabled.
    fn on_enable(&self) -> Result<()> {
        Ok(())
    }

    /// Called once per tick, on this module's priority band, while the
    /// module is enabled. An error is routed to [`Module::on_exception`]
    /// rather than propagated to the caller of `Loop::run`.
    fn on_update(&self) -> Result<()>;

    /// Called once, synchronously, when the module transitions from
    /// enabled to disabled.
    fn on_disable(&self) -> Result<()> {
        Ok(())
    }

    /// Called once, synchronously, when the module is detached from a
    /// running loop, or when the loop it is attached to stops.
    fn on_stop(&self) -> Result<()> {
        Ok(())
    }

    /// Called when `on_update` (or a scheduled job this module owns)
    /// returns an error. The default implementation logs at `warn` and
    /// swallows it.
    fn on_exception(&self, error: &Error) {
        warn!("module {} raised from on_update: {error}", self.get_name());
    }

    /// How the loop dispatches this module's `on_update`. Read once at
    /// registration; defaults to [`ExecutionType::BoundedAsync`].
    fn execution_type(&self) -> ExecutionType {
        ExecutionType::default()
    }

    /// A human-readable name, used in logs. Defaults to the module's Rust
    /// type name.
    fn get_name(&self) -> &str {
        type_name::<Self>()
    }
}

/// The loop's runtime handle on an attached [`Module`].
///
/// Wraps the user's [`Module`] implementation together with the state the
/// loop itself needs to track: the immutable priority, the enabled flag
/// (toggleable from any thread), and a weak back-reference to the owning
/// loop so the module can call back into it (`enable`/`disable`/`schedule`)
/// without keeping the loop alive on its own.
pub struct ModuleHandle {
    logic: Arc<dyn Module>,
    priority: Priority,
    enabled: SharedCell<bool>,
    loop_ref: Mutex<Option<Weak<LoopInner>>>,
}

impl ModuleHandle {
    /// Wraps `logic` for registration with a loop, at the given priority.
    pub fn new(logic: Arc<dyn Module>, priority: Priority) -> Arc<Self> {
        Arc::new(ModuleHandle {
            logic,
            priority,
            enabled: SharedCell::new(true),
            loop_ref: Mutex::new(None),
        })
    }

    /// The priority this module was registered with. Never changes.
    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Whether this module currently runs its `on_update` each tick.
    pub fn is_enabled(&self) -> bool {
        self.enabled.get()
    }

    /// Whether this module is attached to a loop that is currently running.
    pub fn is_running(&self) -> bool {
        self.loop_inner()
            .map(|inner| inner.is_running())
            .unwrap_or(false)
    }

    /// This module's execution discipline, as reported by the wrapped
    /// [`Module`].
    pub fn execution_type(&self) -> ExecutionType {
        self.logic.execution_type()
    }

    /// This module's name, as reported by the wrapped [`Module`].
    pub fn get_name(&self) -> &str {
        self.logic.get_name()
    }

    /// Enables the module, invoking `on_enable` synchronously on the
    /// calling thread if it was previously disabled and the owning loop is
    /// running. A no-op if already enabled.
    pub fn enable(&self) -> Result<()> {
        if self.enabled.compare_exchange(false, true) && self.is_running() {
            return self.logic.on_enable();
        }
        Ok(())
    }

    /// The owning loop's tick clock, in seconds, frozen for the current
    /// tick. Returns `0.0` if this module is detached.
    pub fn get_time(&self) -> f64 {
        self.loop_inner().map(|inner| inner.time()).unwrap_or(0.0)
    }

    /// The elapsed time since the previous tick, in seconds. Returns `0.0`
    /// if this module is detached.
    pub fn get_time_diff(&self) -> f64 {
        self.loop_inner().map(|inner| inner.time_diff()).unwrap_or(0.0)
    }

    /// A live read of the owning loop's clock, not frozen to the current
    /// tick, for callers that need sub-tick precision. Returns `0.0` if
    /// this module is detached or its loop has not started running.
    pub fn get_present_time(&self) -> f64 {
        self.loop_inner().map(|inner| inner.present_time()).unwrap_or(0.0)
    }

    /// Schedules `task` on the owning loop, wiring this module's own
    /// [`Module::on_exception`] as the handler if `task` returns an error.
    /// Fails if this module is not currently attached to a loop.
    pub fn schedule(&self, at: f64, exec_type: ExecutionType, task: ScheduledTask) -> Result<()> {
        let inner = self
            .loop_inner()
            .ok_or_else(|| Error::usage("module is not attached to a loop"))?;
        let logic = Arc::clone(&self.logic);
        let on_exception: ExceptionHandler = Box::new(move |err| logic.on_exception(err));
        inner.schedule(at, exec_type, task, Some(on_exception))
    }

    /// Disables the module, invoking `on_disable` synchronously on the
    /// calling thread if it was previously enabled and the owning loop is
    /// running. A no-op if already disabled.
    pub fn disable(&self) -> Result<()> {
        if self.enabled.compare_exchange(true, false) && self.is_running() {
            return self.logic.on_disable();
        }
        Ok(())
    }

    pub(crate) fn run_update(&self) {
        if !self.is_enabled() {
            return;
        }
        if let Err(err) = self.logic.on_update() {
            self.logic.on_exception(&err);
        }
    }

    pub(crate) fn start_and_enable(&self) -> Result<()> {
        self.logic.on_start()?;
        if self.is_enabled() {
            self.logic.on_enable()?;
        }
        Ok(())
    }

    pub(crate) fn disable_and_stop(&self) -> Result<()> {
        if self.is_enabled() {
            self.logic.on_disable()?;
        }
        self.logic.on_stop()
    }

    /// Registers this handle's underlying [`Module`] as attached, failing
    /// if that same module (by identity, not by handle: re-wrapping one
    /// `Arc<dyn Module>` in a second `ModuleHandle` is still a second
    /// attachment) is already attached to a loop.
    ///
    /// Identity is tracked process-wide rather than per-loop, since the
    /// invariant this enforces ("a Module is attached to at most one Loop
    /// at any time", spec data model) is about the module, not about which
    /// loop's list it sits in.
    pub(crate) fn attach(&self, loop_ref: Weak<LoopInner>) -> Result<()> {
        if !attached_modules().lock().unwrap_or_else(|e| e.into_inner()).insert(self.module_ptr()) {
            return Err(Error::usage("module is already attached to a loop"));
        }
        *self.loop_ref.lock().unwrap_or_else(|e| e.into_inner()) = Some(loop_ref);
        Ok(())
    }

    pub(crate) fn detach(&self) {
        attached_modules()
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.module_ptr());
        *self.loop_ref.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// A stable per-object identity for the wrapped module, used only to
    /// detect double-attachment; never dereferenced.
    fn module_ptr(&self) -> usize {
        Arc::as_ptr(&self.logic) as *const () as usize
    }

    fn loop_inner(&self) -> Option<Arc<LoopInner>> {
        self.loop_ref
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .and_then(Weak::upgrade)
    }
}
