// SPDX-License-Identifier: MPL-2.0

//! Synchronization primitives used by the engine.

mod recursive_mutex;
mod shared_cell;

pub use recursive_mutex::{
    LockGuard, RecursiveMutex, SharedLockGuard, UpgradableSharedLockGuard,
};
pub use shared_cell::SharedCell;
