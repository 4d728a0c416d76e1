//! Batch commit control.
//!
//! Records are committed in batches: the checkpoint advances once
//! `size_threshold` records are pending, or once the batch is non-empty and
//! `flush_interval` has passed since the previous advance.
//!
//! A record that failed to persist is never pushed, so no checkpoint passes it
//! while it is being redelivered. [`Redeliveries`] bounds how often that happens.
use std::{collections::HashMap, time::Duration};

use tokio::time::Instant;

pub const DEFAULT_BATCH_SIZE: usize = 50;
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_DELIVERY_ATTEMPTS: u32 = 3;

/// Position of a record in the log
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Position {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

impl Position {
    pub fn new(topic: impl Into<String>, partition: i32, offset: i64) -> Self {
        Position {
            topic: topic.into(),
            partition,
            offset,
        }
    }

    fn key(&self) -> (String, i32) {
        (self.topic.clone(), self.partition)
    }
}

/// Offsets to commit: for each topic partition, the next offset to consume
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Checkpoint {
    offsets: HashMap<(String, i32), i64>,
}

impl Checkpoint {
    pub fn offset(&self, topic: &str, partition: i32) -> Option<i64> {
        self.offsets.get(&(topic.to_string(), partition)).copied()
    }

    pub fn offsets(&self) -> &HashMap<(String, i32), i64> {
        &self.offsets
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    fn advance(&mut self, position: &Position) {
        let next = position.offset + 1;
        self.offsets
            .entry(position.key())
            .and_modify(|offset| *offset = (*offset).max(next))
            .or_insert(next);
    }
}

pub struct CommitBatch {
    pending: Vec<Position>,
    size_threshold: usize,
    flush_interval: Duration,
    last_advance: Instant,
}

impl CommitBatch {
    pub fn new(size_threshold: usize, flush_interval: Duration) -> Self {
        CommitBatch {
            pending: Vec::with_capacity(size_threshold),
            size_threshold,
            flush_interval,
            last_advance: Instant::now(),
        }
    }

    /// Adds a successfully persisted record
    pub fn push(&mut self, position: Position) {
        self.pending.push(position);
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn size_reached(&self) -> bool {
        self.pending.len() >= self.size_threshold
    }

    pub fn interval_elapsed(&self, now: Instant) -> bool {
        !self.pending.is_empty() && now.duration_since(self.last_advance) > self.flush_interval
    }

    /// Builds the checkpoint for everything pending and clears the batch.
    /// Returns `None` when nothing is pending.
    pub fn take_checkpoint(&mut self, now: Instant) -> Option<Checkpoint> {
        if self.pending.is_empty() {
            return None;
        }
        let mut checkpoint = Checkpoint::default();
        for position in self.pending.drain(..) {
            checkpoint.advance(&position);
        }
        self.last_advance = now;
        Some(checkpoint)
    }

    /// Forgets pending records, for a fresh consumer session
    pub fn reset(&mut self, now: Instant) {
        self.pending.clear();
        self.last_advance = now;
    }
}

/// Failed delivery attempts per record.
///
/// A failed record is read again from its own offset until it persists or
/// runs out of attempts; after that it is given up and committed past.
pub struct Redeliveries {
    attempts: HashMap<Position, u32>,
    max_attempts: u32,
}

/// What to do with a record that failed to persist
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Redelivery {
    /// rewind the partition to the record, this was attempt `attempt`
    Retry { attempt: u32 },
    /// out of attempts, acknowledge the record as handled
    GiveUp { attempts: u32 },
}

impl Redeliveries {
    pub fn new(max_attempts: u32) -> Self {
        Redeliveries {
            attempts: HashMap::new(),
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn failed(&mut self, position: &Position) -> Redelivery {
        let attempts = self.attempts.entry(position.clone()).or_insert(0);
        *attempts += 1;
        let attempt = *attempts;
        if attempt < self.max_attempts {
            Redelivery::Retry { attempt }
        } else {
            self.attempts.remove(position);
            Redelivery::GiveUp { attempts: attempt }
        }
    }

    pub fn succeeded(&mut self, position: &Position) {
        if !self.attempts.is_empty() {
            self.attempts.remove(position);
        }
    }

    pub fn clear(&mut self) {
        self.attempts.clear();
    }

    pub fn len(&self) -> usize {
        self.attempts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attempts.is_empty()
    }
}
