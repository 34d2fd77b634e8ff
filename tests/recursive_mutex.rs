// SPDX-License-Identifier: MPL-2.0

//! Cross-thread invariants for [`RecursiveMutex`] (S5, S6, and the
//! recursive-release invariant) that need more than one thread to exercise.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use taskloop::sync::RecursiveMutex;
use taskloop::LockErrorKind;

/// S5. Thread A holds shared, thread B holds shared, thread A calls the
/// blocking exclusive lock: it must raise `DeadlockError` immediately, not
/// hang waiting for B (who never competes for A's own reader slot) to drain.
#[test]
fn s5_shared_then_exclusive_deadlocks_with_other_reader_present() {
    let mutex = Arc::new(RecursiveMutex::new(0));

    let a_reader = mutex.shared_lock();

    let other = Arc::clone(&mutex);
    let b_reader_holds = Arc::new(std::sync::Barrier::new(2));
    let barrier = Arc::clone(&b_reader_holds);
    let b = thread::spawn(move || {
        let _reader = other.shared_lock();
        barrier.wait();
        thread::sleep(Duration::from_millis(50));
    });
    b_reader_holds.wait();

    // A attempts to upgrade its own shared hold to exclusive. This must
    // fail synchronously: A itself is a reader, so blocking could never be
    // satisfied even once B eventually drops its reader.
    let err = mutex.lock().unwrap_err();
    assert!(err.is_lock_kind(LockErrorKind::Deadlock));

    drop(a_reader);
    b.join().unwrap();
}

/// S6. Upgradable round-trip: T1 holds upgradable, T2 holds shared, T1's
/// `lock()` blocks until T2 releases, then returns; dropping the promoted
/// guard returns T1 to upgradable (not to unheld); dropping the upgradable
/// guard finally leaves the mutex unheld.
#[test]
fn s6_upgradable_round_trip() {
    let mutex = Arc::new(RecursiveMutex::new(0));

    let upgradable = mutex.upgradable_shared_lock().unwrap();

    let other = Arc::clone(&mutex);
    let reader_acquired = Arc::new(std::sync::Barrier::new(2));
    let barrier = Arc::clone(&reader_acquired);
    let t2 = thread::spawn(move || {
        let reader = other.shared_lock();
        barrier.wait();
        thread::sleep(Duration::from_millis(60));
        drop(reader);
    });
    reader_acquired.wait();

    // `upgrade()` blocks until T2's reader drains.
    let writer = upgradable.upgrade();
    t2.join().unwrap();

    // While the promoted guard is alive, no other thread can read or write.
    let other = Arc::clone(&mutex);
    let blocked = thread::spawn(move || other.try_shared_lock().is_none()).join().unwrap();
    assert!(blocked);

    // Dropping the exclusive guard reverts this thread to upgradable-shared,
    // not to "no lock": another thread can still read (upgradable coexists
    // with readers) but not take the upgradable slot itself.
    drop(writer);
    let other = Arc::clone(&mutex);
    let other_can_read = thread::spawn(move || other.try_shared_lock().is_some())
        .join()
        .unwrap();
    assert!(other_can_read);
    let other = Arc::clone(&mutex);
    let other_cannot_upgrade = thread::spawn(move || other.try_upgradable_shared_lock().unwrap().is_none())
        .join()
        .unwrap();
    assert!(other_cannot_upgrade);

    // Dropping the upgradable guard itself finally leaves the mutex
    // unheld by this thread.
    drop(mutex.upgradable_shared_lock().unwrap());
}

/// Invariant 6: N nested `lock()` calls on the same thread yield N
/// independent guards; the mutex is only released once all of them (in any
/// order) have dropped.
#[test]
fn recursive_exclusive_releases_only_after_last_guard_drops() {
    let mutex = Arc::new(RecursiveMutex::new(0));

    let g1 = mutex.lock().unwrap();
    let g2 = mutex.lock().unwrap();
    let g3 = mutex.lock().unwrap();

    // Drop out of acquisition order.
    drop(g2);

    let other = Arc::clone(&mutex);
    assert!(thread::spawn(move || other.try_lock().unwrap().is_none())
        .join()
        .unwrap());

    drop(g1);
    let other = Arc::clone(&mutex);
    assert!(thread::spawn(move || other.try_lock().unwrap().is_none())
        .join()
        .unwrap());

    drop(g3);
    let other = Arc::clone(&mutex);
    assert!(thread::spawn(move || other.try_lock().unwrap().is_some())
        .join()
        .unwrap());
}

/// Invariant 8: downgrading (lock, then shared_lock, then drop the
/// exclusive guard) leaves the thread holding a shared lock: another thread
/// can still read, but not write.
#[test]
fn downgrade_leaves_thread_as_reader_only() {
    let mutex = Arc::new(RecursiveMutex::new(0));

    let writer = mutex.lock().unwrap();
    let reader = writer.downgrade();

    let other = Arc::clone(&mutex);
    assert!(thread::spawn(move || other.try_shared_lock().is_some())
        .join()
        .unwrap());
    let other = Arc::clone(&mutex);
    assert!(thread::spawn(move || other.try_lock().unwrap().is_none())
        .join()
        .unwrap());

    drop(reader);
    let other = Arc::clone(&mutex);
    assert!(thread::spawn(move || other.try_lock().unwrap().is_some())
        .join()
        .unwrap());
}
