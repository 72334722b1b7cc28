//! Cron-like periodic jobs.
//!
//! Each job gets its own task that sleeps until the next aligned wake-up
//! and then sends the job key to the owning engine loop. The loop does
//! the work, so jobs never touch engine state concurrently.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::types::{add_duration, elapsed, now};

/// Evenly spaced wake-ups, aligned to multiples of the interval since the
/// Unix epoch, shifted by an offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    interval: Duration,
    offset: Duration,
}

impl Schedule {
    /// Wake up every `interval`. Sub-millisecond intervals are raised to 1 ms.
    pub fn every(interval: Duration) -> Self {
        Self {
            interval: interval.max(Duration::from_millis(1)),
            offset: Duration::ZERO,
        }
    }

    /// Shift every wake-up by `offset`, reduced modulo the interval.
    pub fn with_offset(mut self, offset: Duration) -> Self {
        let interval_ms = self.interval.as_millis().max(1);
        self.offset = Duration::from_millis((offset.as_millis() % interval_ms) as u64);
        self
    }

    /// Random offset within the interval.
    pub fn with_jitter(self) -> Self {
        let interval_ms = u64::try_from(self.interval.as_millis()).unwrap_or(u64::MAX);
        self.with_offset(Duration::from_millis(rand::random_range(0..interval_ms.max(1))))
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn offset(&self) -> Duration {
        self.offset
    }

    /// First wake-up strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> DateTime<Utc> {
        let interval_ms = i64::try_from(self.interval.as_millis()).unwrap_or(i64::MAX);
        let offset_ms = self.offset.as_millis() as i64;
        let t = after.timestamp_millis();
        let slot = (t - offset_ms).div_euclid(interval_ms) + 1;
        slot.checked_mul(interval_ms)
            .and_then(|ms| ms.checked_add(offset_ms))
            .and_then(DateTime::from_timestamp_millis)
            .unwrap_or_else(|| add_duration(after, self.interval))
    }
}

/// Owns the timer tasks of an engine, keyed by job.
pub struct Scheduler<J> {
    jobs: HashMap<J, (Schedule, JoinHandle<()>)>,
    fire_tx: mpsc::UnboundedSender<J>,
}

impl<J> Scheduler<J>
where
    J: Clone + Eq + Hash + Debug + Send + 'static,
{
    /// A scheduler and the receiver its jobs fire into.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<J>) {
        let (fire_tx, fire_rx) = mpsc::unbounded_channel();
        (
            Self {
                jobs: HashMap::new(),
                fire_tx,
            },
            fire_rx,
        )
    }

    /// Installs `job`, replacing any previous schedule for the same key.
    ///
    /// Must be called from within a tokio runtime.
    pub fn add_job(&mut self, job: J, schedule: Schedule) {
        self.remove_job(&job);
        tracing::debug!(?job, interval = ?schedule.interval(), "scheduling job");
        let task = tokio::spawn(run_job(job.clone(), schedule, self.fire_tx.clone()));
        self.jobs.insert(job, (schedule, task));
    }

    pub fn remove_job(&mut self, job: &J) -> bool {
        match self.jobs.remove(job) {
            Some((_, task)) => {
                task.abort();
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, job: &J) -> bool {
        self.jobs.contains_key(job)
    }

    pub fn schedule_of(&self, job: &J) -> Option<Schedule> {
        self.jobs.get(job).map(|(schedule, _)| *schedule)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn shutdown(&mut self) {
        for (_, (_, task)) in self.jobs.drain() {
            task.abort();
        }
    }
}

impl<J> Drop for Scheduler<J> {
    fn drop(&mut self) {
        for (_, task) in self.jobs.values() {
            task.abort();
        }
    }
}

async fn run_job<J: Clone>(job: J, schedule: Schedule, fire_tx: mpsc::UnboundedSender<J>) {
    let mut cursor = now();
    loop {
        let current = now();
        let next = schedule.next_after(cursor.max(current));
        tokio::time::sleep(elapsed(current, next)).await;
        if fire_tx.send(job.clone()).is_err() {
            break;
        }
        cursor = next;
    }
}
