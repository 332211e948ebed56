//! Timed tasks and the scheduling queue.
//!
//! A [`Task`] carries a [`Schedule`] (fire time, repeat period, remaining
//! attempts) and a `run` body that gets mutable access to the scheduler
//! context. [`TaskQueue`] is a min-heap ordered by fire time with a
//! monotonically increasing sequence number as deterministic tie-break.

use crate::error::Result;
use crate::server::ServerCtx;
use crate::time::Time;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::Duration;

/// Repeat-forever marker for [`Schedule::remaining_attempts`].
pub const REPEAT_FOREVER: i32 = -1;

/// When and how often a task fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    fire_at: Time,
    period: Duration,
    remaining_attempts: i32,
}

impl Schedule {
    /// A task that fires once at `fire_at`.
    #[must_use]
    pub const fn once_at(fire_at: Time) -> Self {
        Self {
            fire_at,
            period: Duration::ZERO,
            remaining_attempts: 1,
        }
    }

    /// A task that fires at `fire_at` and repeats every `period` while
    /// attempts remain ([`REPEAT_FOREVER`] never runs out).
    #[must_use]
    pub const fn repeating(fire_at: Time, period: Duration, attempts: i32) -> Self {
        Self {
            fire_at,
            period,
            remaining_attempts: attempts,
        }
    }

    /// The next fire time.
    #[must_use]
    pub const fn fire_at(&self) -> Time {
        self.fire_at
    }

    /// The repeat period; zero means non-repeating.
    #[must_use]
    pub const fn period(&self) -> Duration {
        self.period
    }

    /// Attempts left; `-1` repeats forever.
    #[must_use]
    pub const fn remaining_attempts(&self) -> i32 {
        self.remaining_attempts
    }

    /// Whether the task repeats.
    #[must_use]
    pub const fn has_period(&self) -> bool {
        !self.period.is_zero()
    }

    /// Books one completed run and decides whether to requeue.
    ///
    /// Positive attempt counts are decremented; the task is requeued with
    /// `fire_at = now + period` iff attempts remain and a period is set.
    pub fn complete_run(&mut self, now: Time) -> bool {
        if self.remaining_attempts > 0 {
            self.remaining_attempts -= 1;
        }
        if self.remaining_attempts != 0 && self.has_period() {
            self.fire_at = now + self.period;
            true
        } else {
            false
        }
    }
}

/// A scheduled unit of work.
pub trait Task {
    /// The task's schedule.
    fn schedule(&self) -> &Schedule;

    /// Mutable access to the schedule (used by the scheduler to requeue).
    fn schedule_mut(&mut self) -> &mut Schedule;

    /// Executes the task.
    fn run(&mut self, ctx: &mut ServerCtx) -> Result<()>;
}

struct QueuedTask {
    task: Box<dyn Task>,
    seq: u64,
}

impl QueuedTask {
    fn key(&self) -> (Time, u64) {
        (self.task.schedule().fire_at(), self.seq)
    }
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for QueuedTask {}

impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse ordering for a min-heap: earliest fire time first, then
        // insertion order.
        other.key().cmp(&self.key())
    }
}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A min-heap of tasks ordered by fire time.
#[derive(Default)]
pub struct TaskQueue {
    heap: BinaryHeap<QueuedTask>,
    next_seq: u64,
}

impl TaskQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of queued tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Returns true if no task is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Queues a task.
    pub fn push(&mut self, task: Box<dyn Task>) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(QueuedTask { task, seq });
    }

    /// The earliest fire time, if any task is queued.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Time> {
        self.heap.peek().map(|q| q.task.schedule().fire_at())
    }

    /// Pops the earliest task if its fire time is at or before `now`.
    pub fn pop_due(&mut self, now: Time) -> Option<Box<dyn Task>> {
        if self.heap.peek()?.task.schedule().fire_at() <= now {
            self.heap.pop().map(|q| q.task)
        } else {
            None
        }
    }
}

impl std::fmt::Debug for TaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueue").field("len", &self.heap.len()).finish()
    }
}
