// SPDX-License-Identifier: MPL-2.0

//! The error type returned from the APIs of this crate.

use std::fmt;

/// The error type which is returned from the APIs of this crate.
///
/// The four kinds mirror the recovery policy of the engine: usage and lock
/// errors are raised synchronously from the call that triggered them, while a
/// task error is something the caller handed to the engine (a module's
/// `on_update`, or a scheduled job) and is routed to the relevant exception
/// handler rather than ever reaching here directly.
#[derive(Debug)]
pub enum Error {
    /// A caller-visible misuse of the API: attaching a module to two loops,
    /// calling `run` while already running, an out-of-range index, a
    /// duplicate module, or a priority mismatch on `set_item`.
    Usage(String),
    /// A `RecursiveMutex` transition that would deadlock or livelock the
    /// calling thread.
    Lock(LockErrorKind),
    /// A module's `on_update` or a scheduled job returned an error.
    ///
    /// This variant is only ever handed to an `on_exception` handler; it is
    /// never returned from `Loop::run`.
    Task(Box<dyn std::error::Error + Send + Sync>),
    /// An invariant internal to the engine was violated (e.g. the worker
    /// pool observed a mix of states that should be impossible). Treated as
    /// fatal: the loop aborts rather than continuing with corrupted state.
    Internal(String),
}

/// The specific way a `RecursiveMutex` transition was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockErrorKind {
    /// The calling thread holds only a plain shared lock and called the
    /// blocking exclusive-lock entry point; blocking would deadlock because
    /// no other thread can ever release the reader that only this thread
    /// controls.
    Deadlock,
    /// The calling thread holds only a plain shared lock and called the
    /// non-blocking exclusive-lock entry point. Unlike `Deadlock` this call
    /// would not hang, but returning `None` as if "some other thread has it"
    /// would be misleading, since no amount of retrying ever succeeds.
    PossibleLivelock,
    /// The calling thread already holds a plain shared lock and tried to
    /// acquire the upgradable-shared lock, which is reserved for the one
    /// thread that got there first via a fresh (non-shared) acquisition.
    UpgradableAfterShared,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Usage(msg) => write!(f, "usage error: {msg}"),
            Error::Lock(kind) => write!(f, "lock error: {kind}"),
            Error::Task(err) => write!(f, "task error: {err}"),
            Error::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl fmt::Display for LockErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockErrorKind::Deadlock => write!(f, "acquiring the exclusive lock would deadlock"),
            LockErrorKind::PossibleLivelock => {
                write!(f, "acquiring the exclusive lock would never succeed for this thread")
            }
            LockErrorKind::UpgradableAfterShared => write!(
                f,
                "cannot acquire an upgradable-shared lock while already holding a shared lock"
            ),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Task(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl Error {
    pub(crate) fn usage(msg: impl Into<String>) -> Self {
        Error::Usage(msg.into())
    }

    /// Returns `true` if this is a lock error of the given kind.
    pub fn is_lock_kind(&self, kind: LockErrorKind) -> bool {
        matches!(self, Error::Lock(k) if *k == kind)
    }
}

impl From<LockErrorKind> for Error {
    fn from(kind: LockErrorKind) -> Self {
        Error::Lock(kind)
    }
}
