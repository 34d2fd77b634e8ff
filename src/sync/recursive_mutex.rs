// SPDX-License-Identifier: MPL-2.0

//! A reentrant, three-flavor reader/writer mutex.
//!
//! [`std::sync::RwLock`] explicitly does not guarantee that a thread can
//! take a second read lock while already holding one; depending on the
//! platform's pthread implementation, a writer-preferring lock can starve
//! that second acquisition forever. The engine's tick loop routinely calls
//! back into itself from module callbacks while already holding one of its
//! own locks (a module's `on_start` scheduling a job, a module removing
//! itself from inside `on_update`), so it needs a lock that is reentrant by
//! construction. `RecursiveMutex` tracks lock ownership by [`ThreadId`]
//! instead of relying on the platform lock's own notion of ownership.
//!
//! Three lock flavors are supported, matching the states a thread can hold
//! at once: plain shared (any number of threads, any number of times each),
//! upgradable-shared (at most one thread, promotable to exclusive), and
//! exclusive (at most one thread, excludes every shared and upgradable
//! holder but the promoting thread itself).

use std::cell::UnsafeCell;
use std::collections::HashMap;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::thread::ThreadId;

use log::trace;

use crate::error::LockErrorKind;
use crate::prelude::Result;

struct State {
    writer: Option<ThreadId>,
    writer_guards: usize,
    readers: HashMap<ThreadId, usize>,
    upgradable: Option<ThreadId>,
    upgradable_guards: usize,
    /// Set while an upgradable-holder is draining readers to promote to
    /// exclusive. Blocks *new* readers from joining so the drain is
    /// guaranteed to make progress; a straightforward adaptation of the
    /// `BEING_UPGRADED` bit in a bit-packed atomic reader/writer lock to a
    /// mutex-and-condvar design.
    being_upgraded: bool,
}

impl State {
    fn new() -> Self {
        State {
            writer: None,
            writer_guards: 0,
            readers: HashMap::new(),
            upgradable: None,
            upgradable_guards: 0,
            being_upgraded: false,
        }
    }
}

/// A reentrant read/write/upgradable-shared mutex guarding a value of type
/// `T`.
pub struct RecursiveMutex<T: ?Sized> {
    state: Mutex<State>,
    condvar: Condvar,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for RecursiveMutex<T> {}
unsafe impl<T: ?Sized + Send> Sync for RecursiveMutex<T> {}

impl<T> RecursiveMutex<T> {
    /// Creates a new mutex wrapping `value`.
    pub fn new(value: T) -> Self {
        RecursiveMutex {
            state: Mutex::new(State::new()),
            condvar: Condvar::new(),
            data: UnsafeCell::new(value),
        }
    }

    /// Consumes the mutex, returning the wrapped value.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

/// What a non-blocking acquisition attempt found, used internally to decide
/// whether to hand back a fresh guard, reenter reentrantly, or report
/// `None` — the three-way distinction the original engine's `TryResult`
/// exposed, kept here as plumbing rather than part of the public contract.
enum TryOutcome {
    /// Some other thread holds a conflicting lock; the caller gets `None`.
    LockedByOtherThread,
    /// The calling thread already holds a lock that this acquisition
    /// reenters; the caller gets a fresh guard sharing the recursion count.
    LockedByThisThread,
    /// Nothing conflicts; the caller gets a newly granted guard.
    LockSuccessful,
}

impl<T: ?Sized> RecursiveMutex<T> {
    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn tid() -> ThreadId {
        std::thread::current().id()
    }

    fn classify_exclusive(state: &State, tid: ThreadId) -> TryOutcome {
        if state.writer == Some(tid) {
            TryOutcome::LockedByThisThread
        } else if state.upgradable == Some(tid) {
            if state.readers.is_empty() {
                TryOutcome::LockSuccessful
            } else {
                TryOutcome::LockedByOtherThread
            }
        } else if state.writer.is_none() && state.readers.is_empty() && state.upgradable.is_none()
        {
            TryOutcome::LockSuccessful
        } else {
            TryOutcome::LockedByOtherThread
        }
    }

    fn classify_shared(state: &State, tid: ThreadId) -> TryOutcome {
        if state.readers.get(&tid).is_some_and(|&count| count > 0) || state.writer == Some(tid) {
            TryOutcome::LockedByThisThread
        } else if state.writer.is_none() && !state.being_upgraded {
            TryOutcome::LockSuccessful
        } else {
            TryOutcome::LockedByOtherThread
        }
    }

    fn classify_upgradable(state: &State, tid: ThreadId) -> TryOutcome {
        if state.upgradable == Some(tid) {
            TryOutcome::LockedByThisThread
        } else if state.upgradable.is_none() && (state.writer.is_none() || state.writer == Some(tid))
        {
            TryOutcome::LockSuccessful
        } else {
            TryOutcome::LockedByOtherThread
        }
    }

    /// Blocks until this thread holds the exclusive lock, reentering if it
    /// already does.
    ///
    /// Returns [`LockErrorKind::Deadlock`] if this thread holds only a plain
    /// shared lock: no other thread can ever drain that reader, so blocking
    /// would hang forever.
    pub fn lock(&self) -> Result<LockGuard<'_, T>> {
        let tid = Self::tid();
        let mut state = self.lock_state();
        loop {
            if state.writer == Some(tid) {
                state.writer_guards += 1;
                return Ok(LockGuard { mutex: self });
            }
            if state.upgradable == Some(tid) {
                // Promote from upgradable to exclusive: wait for every
                // *other* reader to drain, then grant.
                state.being_upgraded = true;
                while !state.readers.is_empty() {
                    trace!("lock: upgradable {tid:?} draining {} reader(s)", state.readers.len());
                    state = self.condvar.wait(state).unwrap_or_else(|e| e.into_inner());
                }
                state.being_upgraded = false;
                state.writer = Some(tid);
                state.writer_guards = 1;
                return Ok(LockGuard { mutex: self });
            }
            if let Some(&count) = state.readers.get(&tid) {
                if count > 0 {
                    return Err(LockErrorKind::Deadlock.into());
                }
            }
            if state.writer.is_none() && state.readers.is_empty() && state.upgradable.is_none() {
                state.writer = Some(tid);
                state.writer_guards = 1;
                return Ok(LockGuard { mutex: self });
            }
            trace!("lock: {tid:?} contended, blocking");
            state = self.condvar.wait(state).unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Non-blocking form of [`RecursiveMutex::lock`].
    ///
    /// Returns `Ok(None)` if some other thread currently holds a
    /// conflicting lock, and `Err(LockErrorKind::PossibleLivelock)` if this
    /// thread holds only a plain shared lock: unlike the blocking form this
    /// call never hangs, but no amount of retrying would ever succeed
    /// either.
    pub fn try_lock(&self) -> Result<Option<LockGuard<'_, T>>> {
        let tid = Self::tid();
        let mut state = self.lock_state();
        if state.readers.get(&tid).is_some_and(|&count| count > 0) && state.writer != Some(tid) {
            return Err(LockErrorKind::PossibleLivelock.into());
        }
        match Self::classify_exclusive(&state, tid) {
            TryOutcome::LockedByThisThread => {
                state.writer_guards += 1;
                Ok(Some(LockGuard { mutex: self }))
            }
            TryOutcome::LockSuccessful => {
                state.writer = Some(tid);
                state.writer_guards = 1;
                Ok(Some(LockGuard { mutex: self }))
            }
            TryOutcome::LockedByOtherThread => Ok(None),
        }
    }

    /// Blocks until this thread holds a plain shared lock, reentering if it
    /// already does.
    ///
    /// If this thread already holds the exclusive lock, this call is the
    /// write-to-read downgrade path: it registers a reader entry for this
    /// thread without blocking, which remains in effect after the last
    /// exclusive guard is dropped.
    pub fn shared_lock(&self) -> SharedLockGuard<'_, T> {
        let tid = Self::tid();
        let mut state = self.lock_state();
        loop {
            if let Some(count) = state.readers.get_mut(&tid) {
                *count += 1;
                return SharedLockGuard { mutex: self };
            }
            if state.writer == Some(tid) {
                state.readers.insert(tid, 1);
                return SharedLockGuard { mutex: self };
            }
            if state.writer.is_none() && !state.being_upgraded {
                state.readers.insert(tid, 1);
                return SharedLockGuard { mutex: self };
            }
            trace!("shared_lock: {tid:?} contended, blocking");
            state = self.condvar.wait(state).unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Non-blocking form of [`RecursiveMutex::shared_lock`].
    pub fn try_shared_lock(&self) -> Option<SharedLockGuard<'_, T>> {
        let tid = Self::tid();
        let mut state = self.lock_state();
        match Self::classify_shared(&state, tid) {
            TryOutcome::LockedByThisThread => {
                *state.readers.entry(tid).or_insert(0) += 1;
                Some(SharedLockGuard { mutex: self })
            }
            TryOutcome::LockSuccessful => {
                state.readers.insert(tid, 1);
                Some(SharedLockGuard { mutex: self })
            }
            TryOutcome::LockedByOtherThread => None,
        }
    }

    /// Blocks until this thread holds the upgradable-shared lock,
    /// reentering if it already does.
    ///
    /// Returns [`LockErrorKind::UpgradableAfterShared`] if this thread
    /// already holds a plain shared lock: upgradable-shared is reserved for
    /// whichever thread acquired it fresh, since a thread that is already a
    /// reader could never drain itself while waiting to promote.
    pub fn upgradable_shared_lock(&self) -> Result<UpgradableSharedLockGuard<'_, T>> {
        let tid = Self::tid();
        let mut state = self.lock_state();
        loop {
            if state.upgradable == Some(tid) {
                state.upgradable_guards += 1;
                return Ok(UpgradableSharedLockGuard { mutex: self });
            }
            if state.readers.contains_key(&tid) {
                return Err(LockErrorKind::UpgradableAfterShared.into());
            }
            if state.upgradable.is_none() && (state.writer.is_none() || state.writer == Some(tid))
            {
                state.upgradable = Some(tid);
                state.upgradable_guards = 1;
                return Ok(UpgradableSharedLockGuard { mutex: self });
            }
            trace!("upgradable_shared_lock: {tid:?} contended, blocking");
            state = self.condvar.wait(state).unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Non-blocking form of [`RecursiveMutex::upgradable_shared_lock`].
    pub fn try_upgradable_shared_lock(&self) -> Result<Option<UpgradableSharedLockGuard<'_, T>>> {
        let tid = Self::tid();
        let mut state = self.lock_state();
        if state.upgradable != Some(tid) && state.readers.contains_key(&tid) {
            return Err(LockErrorKind::UpgradableAfterShared.into());
        }
        match Self::classify_upgradable(&state, tid) {
            TryOutcome::LockedByThisThread => {
                state.upgradable_guards += 1;
                Ok(Some(UpgradableSharedLockGuard { mutex: self }))
            }
            TryOutcome::LockSuccessful => {
                state.upgradable = Some(tid);
                state.upgradable_guards = 1;
                Ok(Some(UpgradableSharedLockGuard { mutex: self }))
            }
            TryOutcome::LockedByOtherThread => Ok(None),
        }
    }

    fn release_writer(&self, _tid: ThreadId) {
        let mut state = self.lock_state();
        state.writer_guards -= 1;
        if state.writer_guards == 0 {
            state.writer = None;
            self.condvar.notify_all();
        }
    }

    fn release_reader(&self, tid: ThreadId) {
        let mut state = self.lock_state();
        if let Some(count) = state.readers.get_mut(&tid) {
            *count -= 1;
            if *count == 0 {
                state.readers.remove(&tid);
            }
        }
        self.condvar.notify_all();
    }

    fn release_upgradable(&self, tid: ThreadId) {
        let mut state = self.lock_state();
        state.upgradable_guards -= 1;
        if state.upgradable_guards == 0 {
            debug_assert_eq!(state.upgradable, Some(tid));
            state.upgradable = None;
            self.condvar.notify_one();
        }
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for RecursiveMutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.try_shared_lock() {
            Some(guard) => f.debug_struct("RecursiveMutex").field("data", &*guard).finish(),
            None => f.write_str("RecursiveMutex {{ <locked> }}"),
        }
    }
}

/// An RAII guard granting exclusive access to a [`RecursiveMutex`]'s data.
pub struct LockGuard<'a, T: ?Sized> {
    mutex: &'a RecursiveMutex<T>,
}

impl<'a, T: ?Sized> LockGuard<'a, T> {
    /// Re-enters the exclusive lock, returning an independent guard that
    /// shares the same underlying recursion count.
    pub fn clone_guard(&self) -> Self {
        let tid = RecursiveMutex::<T>::tid();
        let mut state = self.mutex.lock_state();
        debug_assert_eq!(state.writer, Some(tid));
        state.writer_guards += 1;
        LockGuard { mutex: self.mutex }
    }

    /// Acquires a shared lock on the same mutex without releasing this
    /// thread's exclusive hold: the write-to-read downgrade path.
    pub fn downgrade(self) -> SharedLockGuard<'a, T> {
        let guard = self.mutex.shared_lock();
        drop(self);
        guard
    }
}

impl<T: ?Sized> Deref for LockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T: ?Sized> DerefMut for LockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T: ?Sized> Drop for LockGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.release_writer(RecursiveMutex::<T>::tid());
    }
}

/// An RAII guard granting shared access to a [`RecursiveMutex`]'s data.
pub struct SharedLockGuard<'a, T: ?Sized> {
    mutex: &'a RecursiveMutex<T>,
}

impl<T: ?Sized> SharedLockGuard<'_, T> {
    /// Re-enters the shared lock, returning an independent guard that
    /// shares the same underlying recursion count.
    pub fn clone_guard(&self) -> Self {
        let tid = RecursiveMutex::<T>::tid();
        let mut state = self.mutex.lock_state();
        let count = state.readers.entry(tid).or_insert(0);
        *count += 1;
        SharedLockGuard { mutex: self.mutex }
    }
}

impl<T: ?Sized> Deref for SharedLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T: ?Sized> Drop for SharedLockGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.release_reader(RecursiveMutex::<T>::tid());
    }
}

/// An RAII guard granting upgradable-shared access to a [`RecursiveMutex`]'s
/// data: read access, with an exclusive path to promote to a [`LockGuard`].
pub struct UpgradableSharedLockGuard<'a, T: ?Sized> {
    mutex: &'a RecursiveMutex<T>,
}

impl<'a, T: ?Sized> UpgradableSharedLockGuard<'a, T> {
    /// Re-enters the upgradable-shared lock.
    pub fn clone_guard(&self) -> Self {
        let tid = RecursiveMutex::<T>::tid();
        let mut state = self.mutex.lock_state();
        debug_assert_eq!(state.upgradable, Some(tid));
        state.upgradable_guards += 1;
        UpgradableSharedLockGuard { mutex: self.mutex }
    }

    /// Blocks until every other reader drains, then promotes this guard to
    /// an exclusive [`LockGuard`].
    ///
    /// The upgradable hold is retained underneath: once the returned guard
    /// (and any guards cloned from it) are dropped, this thread is back to
    /// holding the upgradable-shared lock rather than nothing.
    pub fn upgrade(self) -> LockGuard<'a, T> {
        let tid = RecursiveMutex::<T>::tid();
        let mutex = self.mutex;
        std::mem::forget(self);
        let mut state = mutex.lock_state();
        state.being_upgraded = true;
        while !state.readers.is_empty() {
            trace!("upgrade: {tid:?} draining {} reader(s)", state.readers.len());
            state = mutex.condvar.wait(state).unwrap_or_else(|e| e.into_inner());
        }
        state.being_upgraded = false;
        state.writer = Some(tid);
        state.writer_guards = 1;
        LockGuard { mutex }
    }

    /// Non-blocking form of [`UpgradableSharedLockGuard::upgrade`].
    ///
    /// Returns the guard back via `Err` if other readers are still present.
    pub fn try_upgrade(self) -> std::result::Result<LockGuard<'a, T>, Self> {
        let tid = RecursiveMutex::<T>::tid();
        let mut state = self.mutex.lock_state();
        if state.readers.is_empty() {
            let mutex = self.mutex;
            std::mem::forget(self);
            state.writer = Some(tid);
            state.writer_guards = 1;
            Ok(LockGuard { mutex })
        } else {
            drop(state);
            Err(self)
        }
    }
}

impl<T: ?Sized> Deref for UpgradableSharedLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T: ?Sized> Drop for UpgradableSharedLockGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.release_upgradable(RecursiveMutex::<T>::tid());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn exclusive_excludes_other_threads() {
        let mutex = Arc::new(RecursiveMutex::new(0));
        let guard = mutex.lock().unwrap();
        let other = Arc::clone(&mutex);
        let handle = thread::spawn(move || other.try_lock().unwrap().is_none());
        assert!(handle.join().unwrap());
        drop(guard);
    }

    #[test]
    fn reentrant_exclusive_same_thread() {
        let mutex = RecursiveMutex::new(0);
        let mut outer = mutex.lock().unwrap();
        *outer += 1;
        {
            let mut inner = mutex.lock().unwrap();
            *inner += 1;
        }
        assert_eq!(*outer, 2);
    }

    #[test]
    fn shared_readers_do_not_exclude_each_other() {
        let mutex = Arc::new(RecursiveMutex::new(42));
        let a = mutex.shared_lock();
        let b = mutex.shared_lock();
        assert_eq!(*a, 42);
        assert_eq!(*b, 42);
    }

    #[test]
    fn shared_then_exclusive_same_thread_deadlocks() {
        let mutex = RecursiveMutex::new(0);
        let _reader = mutex.shared_lock();
        let err = mutex.try_lock().unwrap_err();
        assert!(err.is_lock_kind(LockErrorKind::PossibleLivelock));
    }

    #[test]
    fn downgrade_then_drop_leaves_reader() {
        let mutex = RecursiveMutex::new(0);
        let writer = mutex.lock().unwrap();
        let reader = writer.downgrade();
        assert_eq!(*reader, 0);
    }

    #[test]
    fn upgrade_promotes_once_readers_drain() {
        let mutex = Arc::new(RecursiveMutex::new(0));
        let upgradable = mutex.upgradable_shared_lock().unwrap();
        let writer = upgradable.upgrade();
        assert_eq!(*writer, 0);
    }

    #[test]
    fn upgradable_after_shared_is_rejected() {
        let mutex = RecursiveMutex::new(0);
        let _reader = mutex.shared_lock();
        let err = mutex.upgradable_shared_lock().unwrap_err();
        assert!(err.is_lock_kind(LockErrorKind::UpgradableAfterShared));
    }

    #[test]
    fn exclusive_waits_for_shared_from_other_thread() {
        let mutex = Arc::new(RecursiveMutex::new(0));
        let reader = mutex.shared_lock();
        let other = Arc::clone(&mutex);
        let handle = thread::spawn(move || {
            let mut guard = other.lock().unwrap();
            *guard = 7;
        });
        thread::sleep(Duration::from_millis(20));
        drop(reader);
        handle.join().unwrap();
        assert_eq!(*mutex.lock().unwrap(), 7);
    }
}
