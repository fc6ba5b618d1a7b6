//! Cooperative monotonic-time job queue.
//!
//! Driven by the network loop's periodic tick: `sync_time()` captures one
//! `now` per tick so every job fired in that tick sees the same clock, then
//! `run()` drains everything due. Jobs are plain values handed back to the
//! caller; fixed-interval jobs re-arm themselves without drift.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};
use std::time::{Duration, Instant};

/// Cancellation handle for a scheduled job.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct JobHandle(u64);

struct Entry<T> {
    due: Instant,
    seq: u64,
    id: u64,
    period: Option<Duration>,
    job: T,
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl<T> Eq for Entry<T> {}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Entry<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.due.cmp(&other.due).then(self.seq.cmp(&other.seq))
    }
}

pub struct Scheduler<T> {
    now: Instant,
    next_id: u64,
    next_seq: u64,
    jobs: BinaryHeap<Reverse<Entry<T>>>,
    canceled: HashSet<u64>,
}

impl<T: Clone> Scheduler<T> {
    pub fn new() -> Scheduler<T> {
        Scheduler {
            now: Instant::now(),
            next_id: 1,
            next_seq: 0,
            jobs: BinaryHeap::new(),
            canceled: HashSet::new(),
        }
    }

    /// Capture the tick's clock; all jobs run in this tick see this value.
    pub fn sync_time(&mut self) {
        self.now = Instant::now();
    }

    pub fn now(&self) -> Instant {
        self.now
    }

    pub fn len(&self) -> usize {
        self.jobs.len() - self.canceled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Schedule `job` once, `delay` from the current tick clock.
    pub fn add(&mut self, delay: Duration, job: T) -> JobHandle {
        self.push(self.now + delay, None, job)
    }

    /// Schedule `job` every `period`, first firing after `initial_delay`.
    pub fn add_periodic(&mut self, initial_delay: Duration, period: Duration, job: T) -> JobHandle {
        self.push(self.now + initial_delay, Some(period), job)
    }

    fn push(&mut self, due: Instant, period: Option<Duration>, job: T) -> JobHandle {
        let id = self.next_id;
        self.next_id += 1;
        let seq = self.next_seq;
        self.next_seq += 1;
        self.jobs.push(Reverse(Entry {
            due,
            seq,
            id,
            period,
            job,
        }));
        JobHandle(id)
    }

    pub fn cancel(&mut self, handle: JobHandle) {
        self.canceled.insert(handle.0);
    }

    /// Pop every job due at the captured clock; periodic jobs re-arm.
    pub fn run(&mut self) -> Vec<T> {
        let mut due = Vec::new();
        while let Some(Reverse(head)) = self.jobs.peek() {
            if head.due > self.now {
                break;
            }
            let Reverse(entry) = self.jobs.pop().expect("peeked");
            if self.canceled.remove(&entry.id) {
                continue;
            }
            if let Some(period) = entry.period {
                self.jobs.push(Reverse(Entry {
                    due: entry.due + period,
                    seq: {
                        let seq = self.next_seq;
                        self.next_seq += 1;
                        seq
                    },
                    id: entry.id,
                    period: Some(period),
                    job: entry.job.clone(),
                }));
            }
            due.push(entry.job);
        }
        due
    }

    #[cfg(test)]
    fn advance(&mut self, delta: Duration) {
        self.now += delta;
    }
}

impl<T: Clone> Default for Scheduler<T> {
    fn default() -> Self {
        Self::new()
    }
}
