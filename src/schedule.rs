// SPDX-License-Identifier: MPL-2.0

//! The time-keyed queue of one-off jobs handed to `Loop::schedule`.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use log::warn;

use crate::error::Error;
use crate::module::ExecutionType;
use crate::prelude::Result;

/// A scheduled job's callback.
pub type ScheduledTask = Box<dyn FnOnce() -> Result<()> + Send>;
/// A scheduled job's exception handler, invoked if the task returns an
/// error. Defaults to logging at `warn` when not supplied.
pub type ExceptionHandler = Box<dyn Fn(&Error) + Send>;

pub(crate) struct ScheduledJob {
    pub(crate) exec_type: ExecutionType,
    pub(crate) task: ScheduledTask,
    pub(crate) on_exception: Option<ExceptionHandler>,
}

impl ScheduledJob {
    pub(crate) fn run(self) {
        if let Err(err) = (self.task)() {
            match self.on_exception {
                Some(handler) => handler(&err),
                None => warn!("scheduled job raised: {err}"),
            }
        }
    }
}

struct Entry {
    fire_time: f64,
    seq: u64,
    job: ScheduledJob,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.fire_time == other.fire_time && self.seq == other.seq
    }
}
impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    /// Reversed so [`BinaryHeap`] (a max-heap) behaves as a min-heap keyed
    /// by `fire_time`, ties broken by insertion order (earlier pushes fire
    /// first).
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .fire_time
            .partial_cmp(&self.fire_time)
            .unwrap_or(Ordering::Equal)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// A min-priority-queue of jobs keyed by fire time, ties broken in FIFO
/// order.
#[derive(Default)]
pub(crate) struct ScheduleQueue {
    heap: BinaryHeap<Entry>,
    next_seq: u64,
}

impl ScheduleQueue {
    pub(crate) fn new() -> Self {
        ScheduleQueue {
            heap: BinaryHeap::new(),
            next_seq: 0,
        }
    }

    pub(crate) fn push(&mut self, fire_time: f64, job: ScheduledJob) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Entry {
            fire_time,
            seq,
            job,
        });
    }

    /// Returns the execution type of the earliest job, if it is due by
    /// `now`, without removing it.
    pub(crate) fn peek_due(&self, now: f64) -> Option<ExecutionType> {
        self.heap.peek().and_then(|entry| {
            if entry.fire_time <= now {
                Some(entry.job.exec_type)
            } else {
                None
            }
        })
    }

    /// Removes and returns the earliest job, if it is due by `now`.
    pub(crate) fn pop_due(&mut self, now: f64) -> Option<ScheduledJob> {
        match self.heap.peek() {
            Some(entry) if entry.fire_time <= now => self.heap.pop().map(|e| e.job),
            _ => None,
        }
    }

    pub(crate) fn clear(&mut self) {
        self.heap.clear();
    }
}
