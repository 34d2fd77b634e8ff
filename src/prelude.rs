// SPDX-License-Identifier: MPL-2.0

//! Commonly used types, re-exported for convenience.

pub use crate::error::{Error, LockErrorKind};

/// The result type used throughout this crate.
pub type Result<T> = core::result::Result<T, Error>;

pub use crate::module::{ExecutionType, Module, ModuleHandle, Priority};
pub use crate::sync::RecursiveMutex;
pub use crate::Loop;
