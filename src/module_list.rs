// SPDX-License-Identifier: MPL-2.0

//! The sorted collection of modules attached to a [`crate::Loop`].

use std::sync::{Arc, Mutex, Weak};

use crate::error::Error;
use crate::loop_engine::LoopInner;
use crate::module::ModuleHandle;
use crate::prelude::Result;

/// Modules sorted ascending by priority, with a contiguous "zero band"
/// bracket tracked separately so priority-`0` modules (almost always the
/// majority in a typical application) can be appended in registration
/// order without a binary search on every insert.
#[derive(Default)]
struct Storage {
    modules: Vec<Arc<ModuleHandle>>,
    /// `modules[zero_band_start..zero_band_end]` all have priority `0`.
    zero_band_start: usize,
    zero_band_end: usize,
}

impl Storage {
    fn insertion_index(&self, priority: i8) -> usize {
        use std::cmp::Ordering;
        match priority.cmp(&0) {
            Ordering::Equal => self.zero_band_end,
            Ordering::Less => {
                let slice = &self.modules[..self.zero_band_start];
                slice.partition_point(|m| m.priority().value() <= priority)
            }
            Ordering::Greater => {
                let slice = &self.modules[self.zero_band_end..];
                self.zero_band_end + slice.partition_point(|m| m.priority().value() <= priority)
            }
        }
    }

    fn insert(&mut self, index: usize, handle: Arc<ModuleHandle>) {
        let priority = handle.priority().value();
        self.modules.insert(index, handle);
        if priority < 0 {
            self.zero_band_start += 1;
            self.zero_band_end += 1;
        } else if priority == 0 {
            self.zero_band_end += 1;
        }
    }

    fn remove_at(&mut self, index: usize) -> Arc<ModuleHandle> {
        let removed = self.modules.remove(index);
        if index < self.zero_band_start {
            self.zero_band_start -= 1;
            self.zero_band_end -= 1;
        } else if index < self.zero_band_end {
            self.zero_band_end -= 1;
        }
        removed
    }

    fn find(&self, handle: &Arc<ModuleHandle>) -> Option<usize> {
        self.modules.iter().position(|m| Arc::ptr_eq(m, handle))
    }
}

/// The collection of modules attached to a loop.
///
/// Mutating methods invoke the relevant lifecycle hooks synchronously, on
/// the calling thread, if the owning loop is currently running: the hooks
/// themselves run outside of any internal lock, so a hook that calls back
/// into this same `ModuleList` (attaching or detaching another module) does
/// not deadlock.
pub struct ModuleList {
    storage: Mutex<Storage>,
}

impl Default for ModuleList {
    fn default() -> Self {
        ModuleList::new()
    }
}

impl ModuleList {
    pub(crate) fn new() -> Self {
        ModuleList {
            storage: Mutex::new(Storage::default()),
        }
    }

    /// Attaches `handle` to the loop identified by `loop_ref`, starting and
    /// enabling it synchronously if `is_running` is true.
    ///
    /// Rejects `handle` if its underlying module is already attached
    /// somewhere (including this same list): the module is inserted
    /// speculatively, then `ModuleHandle::attach`'s own process-wide
    /// duplicate check runs, and a failure there rolls the speculative
    /// insert back out before the error reaches the caller.
    ///
    /// On a start/enable failure the module is detached again before the
    /// error is returned, so the loop never ends up with a module that is
    /// present but never started.
    pub(crate) fn add(
        &self,
        handle: Arc<ModuleHandle>,
        loop_ref: Weak<LoopInner>,
        is_running: bool,
    ) -> Result<()> {
        {
            let mut storage = self.storage.lock().unwrap_or_else(|e| e.into_inner());
            let index = storage.insertion_index(handle.priority().value());
            storage.insert(index, Arc::clone(&handle));
        }
        if let Err(err) = handle.attach(loop_ref) {
            let mut storage = self.storage.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(index) = storage.find(&handle) {
                storage.remove_at(index);
            }
            return Err(err);
        }
        if is_running {
            if let Err(err) = handle.start_and_enable() {
                handle.detach();
                let mut storage = self.storage.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(index) = storage.find(&handle) {
                    storage.remove_at(index);
                }
                return Err(err);
            }
        }
        Ok(())
    }

    /// Detaches `handle`, stopping and disabling it synchronously if
    /// `is_running` is true.
    pub(crate) fn remove(&self, handle: &Arc<ModuleHandle>, is_running: bool) -> Result<()> {
        {
            let storage = self.storage.lock().unwrap_or_else(|e| e.into_inner());
            if storage.find(handle).is_none() {
                return Err(Error::usage("module is not attached to this loop"));
            }
        }
        if is_running {
            handle.disable_and_stop()?;
        }
        handle.detach();
        let mut storage = self.storage.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(index) = storage.find(handle) {
            storage.remove_at(index);
        }
        Ok(())
    }

    /// Replaces the module at `index` with `replacement`, stopping the old
    /// module and starting the new one (if the loop is running). The
    /// replacement keeps the old module's position, so its priority must
    /// match.
    pub(crate) fn set_item(
        &self,
        index: usize,
        replacement: Arc<ModuleHandle>,
        loop_ref: Weak<LoopInner>,
        is_running: bool,
    ) -> Result<()> {
        let old = {
            let storage = self.storage.lock().unwrap_or_else(|e| e.into_inner());
            storage
                .modules
                .get(index)
                .cloned()
                .ok_or_else(|| Error::usage("module index out of range"))?
        };
        if old.priority() != replacement.priority() {
            return Err(Error::usage(
                "replacement module must have the same priority as the module it replaces",
            ));
        }
        if is_running {
            old.disable_and_stop()?;
        }
        old.detach();
        // Attach the replacement (which fails if it is already attached
        // elsewhere) before committing it into the slot, so a rejected
        // replacement never gets mistaken for a live one.
        if let Err(err) = replacement.attach(loop_ref) {
            return Err(err);
        }
        {
            let mut storage = self.storage.lock().unwrap_or_else(|e| e.into_inner());
            storage.modules[index] = Arc::clone(&replacement);
        }
        if is_running {
            if let Err(err) = replacement.start_and_enable() {
                replacement.detach();
                return Err(err);
            }
        }
        Ok(())
    }

    /// Detaches and stops every module, in reverse registration order.
    pub(crate) fn clear(&self, is_running: bool) -> Result<()> {
        let all = {
            let mut storage = self.storage.lock().unwrap_or_else(|e| e.into_inner());
            let all = std::mem::take(&mut storage.modules);
            storage.zero_band_start = 0;
            storage.zero_band_end = 0;
            all
        };
        let mut first_err = None;
        for handle in all.into_iter().rev() {
            if is_running {
                if let Err(err) = handle.disable_and_stop() {
                    first_err.get_or_insert(err);
                }
            }
            handle.detach();
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// A point-in-time copy of the attached modules, sorted ascending by
    /// priority. The tick loop walks a snapshot rather than the live list
    /// so that concurrent attach/detach calls from module callbacks do not
    /// invalidate an in-progress band walk.
    pub(crate) fn snapshot(&self) -> Vec<Arc<ModuleHandle>> {
        self.storage.lock().unwrap_or_else(|e| e.into_inner()).modules.clone()
    }

    pub(crate) fn len(&self) -> usize {
        self.storage.lock().unwrap_or_else(|e| e.into_inner()).modules.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
