// SPDX-License-Identifier: MPL-2.0

//! A prioritized, multi-threaded module loop, and the recursive
//! reader/writer mutex it is built on.
//!
//! [`Loop`] drives a set of user-supplied [`Module`]s through a steady-state
//! tick cycle: each tick walks the attached modules in ascending priority
//! order, running each priority band under whichever [`ExecutionType`] its
//! members declare, and drains a time-keyed [`Loop::schedule`] queue at the
//! band boundary where priority crosses zero. A bounded [`pool`] of worker
//! threads parallelizes `BoundedAsync` work within a band; `SingleThreaded`
//! work forces the pool to idle while it runs on the thread that called
//! [`Loop::run`].
//!
//! The loop's internal state (the running flag, the tick clock, the
//! schedule queue) is guarded by [`sync::RecursiveMutex`], a read/write
//! mutex that is reentrant by the same thread across all three of its lock
//! flavors (exclusive, shared, upgradable-shared). It exists because
//! module callbacks routinely call back into the loop that is driving them
//! — a module scheduling a job from `on_start`, or removing itself from
//! `on_update` — and `std::sync::RwLock` gives no such guarantee.
//!
//! ```no_run
//! use std::sync::Arc;
//! use taskloop::{ExecutionType, Loop, Module, Priority, Result};
//!
//! struct Heartbeat;
//!
//! impl Module for Heartbeat {
//!     fn on_update(&self) -> Result<()> {
//!         println!("tick");
//!         Ok(())
//!     }
//! }
//!
//! let app = Loop::new();
//! app.modules().add(Arc::new(Heartbeat), Priority::ZERO)?;
//! // app.run()?; // blocks until `app.stop()` is called from another thread
//! # Ok::<(), taskloop::Error>(())
//! ```

mod error;
mod loop_engine;
mod module;
mod module_list;
mod pool;
mod schedule;
pub mod sync;
mod time;

pub mod prelude;

pub use crate::error::{Error, LockErrorKind};
pub use crate::loop_engine::{Loop, LoopConfig, Modules};
pub use crate::module::{ExecutionType, Module, ModuleHandle, Priority};
pub use crate::prelude::Result;
pub use crate::schedule::{ExceptionHandler, ScheduledTask};
pub use crate::time::LoopClock;
