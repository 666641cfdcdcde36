use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::error::{OrchestratorError, Result};
use crate::scheduler::job::JobNode;

pub const MIN_PRIORITY: u8 = 1;
pub const MAX_PRIORITY: u8 = 10;

/// Opaque handle for one delivery of a queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Receipt(pub Uuid);

impl Receipt {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for Receipt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub job_id: String,
    pub execution_id: Uuid,
    pub priority: u8,
    pub enqueued_at: DateTime<Utc>,
    pub attempt: u32,
    pub required_capabilities: BTreeSet<String>,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    /// Not dispatchable before this instant (retry backoff)
    pub available_at: DateTime<Utc>,
}

impl QueueEntry {
    pub fn for_node(execution_id: Uuid, node: &JobNode, attempt: u32, now: DateTime<Utc>) -> Self {
        Self {
            job_id: node.id.clone(),
            execution_id,
            priority: node.priority,
            enqueued_at: now,
            attempt,
            required_capabilities: node.required_capabilities.clone(),
            max_attempts: node.retry_policy.max_attempts,
            backoff_base_ms: node.retry_policy.backoff_base_ms,
            available_at: now,
        }
    }

    fn key(&self) -> (Uuid, String) {
        (self.execution_id, self.job_id.clone())
    }
}

/// Result of returning a failed delivery to the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NackOutcome {
    Requeued {
        receipt: Receipt,
        attempt: u32,
        delay: Duration,
    },
    DeadLettered {
        attempt: u32,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub entry: QueueEntry,
    pub reason: String,
    pub dead_lettered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Pending entries, including those waiting out a backoff
    pub depth: usize,
    pub delayed: usize,
    pub in_flight: usize,
    pub oldest_entry_age_ms: Option<i64>,
    pub dead_letter_count: usize,
    /// Pending entries no live worker is capable of running
    pub unschedulable: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct OrderKey {
    priority: Reverse<u8>,
    enqueued_at: DateTime<Utc>,
    seq: u64,
}

/// Priority queue of dispatchable jobs.
///
/// Strict priority order with FIFO tie-break on `enqueued_at`. Dequeued
/// entries stay in flight until acked or nacked; nacked entries come back
/// with `attempt + 1` after an exponential backoff, or are dead-lettered
/// once they run out of attempts.
#[derive(Debug)]
pub struct JobQueue {
    order: BTreeMap<OrderKey, Receipt>,
    pending: HashMap<Receipt, (OrderKey, QueueEntry)>,
    in_flight: HashMap<Receipt, QueueEntry>,
    by_job: HashMap<(Uuid, String), Receipt>,
    dead_letters: Vec<DeadLetter>,
    capacity: usize,
    max_backoff_ms: u64,
    seq: u64,
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new(&QueueConfig::default())
    }
}

impl JobQueue {
    pub fn new(config: &QueueConfig) -> Self {
        Self {
            order: BTreeMap::new(),
            pending: HashMap::new(),
            in_flight: HashMap::new(),
            by_job: HashMap::new(),
            dead_letters: Vec::new(),
            capacity: config.capacity,
            max_backoff_ms: config.max_backoff_ms,
            seq: 0,
        }
    }

    /// Insert an entry at `priority`. Enqueueing a job that is already
    /// pending or in flight returns its existing receipt.
    pub fn enqueue(&mut self, mut entry: QueueEntry, priority: u8) -> Result<Receipt> {
        if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&priority) {
            return Err(OrchestratorError::InvalidPriority(priority));
        }
        if let Some(existing) = self.by_job.get(&entry.key()) {
            return Ok(*existing);
        }
        if self.is_full() {
            return Err(OrchestratorError::QueueFull(self.capacity));
        }
        entry.priority = priority;
        let receipt = Receipt::new();
        self.insert_pending(receipt, entry);
        Ok(receipt)
    }

    /// Remove and return the highest-priority available entry whose required
    /// capabilities are a subset of `capabilities`.
    pub fn dequeue(
        &mut self,
        capabilities: &BTreeSet<String>,
        now: DateTime<Utc>,
    ) -> Option<(Receipt, QueueEntry)> {
        let receipt = self.order.values().copied().find(|receipt| {
            self.pending.get(receipt).is_some_and(|(_, entry)| {
                entry.available_at <= now && entry.required_capabilities.is_subset(capabilities)
            })
        })?;

        let (key, entry) = self.pending.remove(&receipt)?;
        self.order.remove(&key);
        self.in_flight.insert(receipt, entry.clone());
        Some((receipt, entry))
    }

    /// Permanently remove a dispatched entry.
    pub fn ack(&mut self, receipt: Receipt) -> bool {
        match self.in_flight.remove(&receipt) {
            Some(entry) => {
                self.by_job.remove(&entry.key());
                true
            }
            None => false,
        }
    }

    /// Return a dispatched entry after a failure. Returns `None` for an
    /// unknown or already settled receipt.
    pub fn nack(&mut self, receipt: Receipt, reason: &str, now: DateTime<Utc>) -> Option<NackOutcome> {
        let mut entry = self.in_flight.remove(&receipt)?;
        let next_attempt = entry.attempt + 1;

        if next_attempt >= entry.max_attempts {
            entry.attempt = next_attempt;
            self.bury(entry, reason, now);
            return Some(NackOutcome::DeadLettered {
                attempt: next_attempt,
            });
        }

        let delay = self.backoff_delay(entry.backoff_base_ms, entry.attempt);
        entry.attempt = next_attempt;
        entry.enqueued_at = now;
        entry.available_at = now + chrono::Duration::milliseconds(delay.as_millis() as i64);

        self.by_job.remove(&entry.key());
        let new_receipt = Receipt::new();
        tracing::debug!(
            job_id = %entry.job_id,
            execution_id = %entry.execution_id,
            attempt = next_attempt,
            delay_ms = delay.as_millis() as u64,
            reason,
            "Entry requeued with backoff"
        );
        self.insert_pending(new_receipt, entry);
        Some(NackOutcome::Requeued {
            receipt: new_receipt,
            attempt: next_attempt,
            delay,
        })
    }

    /// Dead-letter a dispatched entry regardless of its remaining attempts.
    pub fn reject(&mut self, receipt: Receipt, reason: &str, now: DateTime<Utc>) -> bool {
        match self.in_flight.remove(&receipt) {
            Some(mut entry) => {
                entry.attempt += 1;
                self.bury(entry, reason, now);
                true
            }
            None => false,
        }
    }

    /// Put a dispatched entry back in its original position without
    /// consuming an attempt.
    pub fn release(&mut self, receipt: Receipt) -> bool {
        let Some(entry) = self.in_flight.remove(&receipt) else {
            return false;
        };
        self.by_job.remove(&entry.key());
        self.insert_pending(receipt, entry);
        true
    }

    /// Remove a pending or in-flight entry without consuming an attempt.
    pub fn withdraw(&mut self, execution_id: Uuid, job_id: &str) -> Option<QueueEntry> {
        let receipt = self.by_job.remove(&(execution_id, job_id.to_string()))?;
        if let Some((key, entry)) = self.pending.remove(&receipt) {
            self.order.remove(&key);
            return Some(entry);
        }
        self.in_flight.remove(&receipt)
    }

    /// `base * 2^attempt`, capped at the configured maximum.
    pub fn backoff_delay(&self, base_ms: u64, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        Duration::from_millis(base_ms.saturating_mul(factor).min(self.max_backoff_ms))
    }

    pub fn stats(&self, now: DateTime<Utc>) -> QueueStats {
        let delayed = self
            .pending
            .values()
            .filter(|(_, entry)| entry.available_at > now)
            .count();
        let oldest_entry_age_ms = self
            .pending
            .values()
            .map(|(_, entry)| entry.enqueued_at)
            .min()
            .map(|oldest| (now - oldest).num_milliseconds().max(0));

        QueueStats {
            depth: self.pending.len(),
            delayed,
            in_flight: self.in_flight.len(),
            oldest_entry_age_ms,
            dead_letter_count: self.dead_letters.len(),
            unschedulable: 0,
        }
    }

    pub fn dead_letters(&self) -> &[DeadLetter] {
        &self.dead_letters
    }

    /// Pending entries in dispatch order.
    pub fn pending_entries(&self) -> Vec<&QueueEntry> {
        self.order
            .values()
            .filter_map(|receipt| self.pending.get(receipt).map(|(_, entry)| entry))
            .collect()
    }

    pub fn in_flight_entry(&self, receipt: Receipt) -> Option<&QueueEntry> {
        self.in_flight.get(&receipt)
    }

    pub fn contains(&self, execution_id: Uuid, job_id: &str) -> bool {
        self.by_job
            .contains_key(&(execution_id, job_id.to_string()))
    }

    /// Pending plus in-flight entries
    pub fn len(&self) -> usize {
        self.pending.len() + self.in_flight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    fn insert_pending(&mut self, receipt: Receipt, entry: QueueEntry) {
        self.seq += 1;
        let key = OrderKey {
            priority: Reverse(entry.priority),
            enqueued_at: entry.enqueued_at,
            seq: self.seq,
        };
        self.by_job.insert(entry.key(), receipt);
        self.order.insert(key, receipt);
        self.pending.insert(receipt, (key, entry));
    }

    fn bury(&mut self, entry: QueueEntry, reason: &str, now: DateTime<Utc>) {
        tracing::warn!(
            job_id = %entry.job_id,
            execution_id = %entry.execution_id,
            attempt = entry.attempt,
            reason,
            "Entry dead-lettered"
        );
        self.by_job.remove(&entry.key());
        self.dead_letters.push(DeadLetter {
            entry,
            reason: reason.to_string(),
            dead_lettered_at: now,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(job: &str, now: DateTime<Utc>) -> QueueEntry {
        QueueEntry::for_node(Uuid::new_v4(), &JobNode::new(job, "echo"), 0, now)
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let queue = JobQueue::new(&QueueConfig {
            capacity: 10,
            max_backoff_ms: 5_000,
        });
        assert_eq!(queue.backoff_delay(1_000, 0), Duration::from_millis(1_000));
        assert_eq!(queue.backoff_delay(1_000, 1), Duration::from_millis(2_000));
        assert_eq!(queue.backoff_delay(1_000, 2), Duration::from_millis(4_000));
        assert_eq!(queue.backoff_delay(1_000, 3), Duration::from_millis(5_000));
        assert_eq!(queue.backoff_delay(1_000, 80), Duration::from_millis(5_000));
    }

    #[test]
    fn enqueue_is_idempotent_per_job() {
        let now = Utc::now();
        let mut queue = JobQueue::default();
        let e = entry("a", now);
        let r1 = queue.enqueue(e.clone(), 5).unwrap();
        let r2 = queue.enqueue(e, 5).unwrap();
        assert_eq!(r1, r2);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn enqueue_rejects_out_of_range_priority() {
        let now = Utc::now();
        let mut queue = JobQueue::default();
        assert!(matches!(
            queue.enqueue(entry("a", now), 0),
            Err(OrchestratorError::InvalidPriority(0))
        ));
        assert!(matches!(
            queue.enqueue(entry("a", now), 11),
            Err(OrchestratorError::InvalidPriority(11))
        ));
    }

    #[test]
    fn release_keeps_attempt_and_position() {
        let now = Utc::now();
        let mut queue = JobQueue::default();
        queue.enqueue(entry("first", now), 5).unwrap();
        queue
            .enqueue(entry("second", now + chrono::Duration::milliseconds(1)), 5)
            .unwrap();

        let caps = BTreeSet::new();
        let (receipt, first) = queue.dequeue(&caps, now).unwrap();
        assert_eq!(first.job_id, "first");
        assert!(queue.release(receipt));

        let (_, again) = queue.dequeue(&caps, now).unwrap();
        assert_eq!(again.job_id, "first");
        assert_eq!(again.attempt, 0);
    }

    #[test]
    fn withdraw_removes_pending_and_in_flight() {
        let now = Utc::now();
        let mut queue = JobQueue::default();
        let pending = entry("pending", now);
        let flying = entry("flying", now);
        queue.enqueue(pending.clone(), 5).unwrap();
        queue.enqueue(flying.clone(), 9).unwrap();
        let (receipt, _) = queue.dequeue(&BTreeSet::new(), now).unwrap();

        assert!(queue.withdraw(pending.execution_id, "pending").is_some());
        assert!(queue.withdraw(flying.execution_id, "flying").is_some());
        assert!(queue.is_empty());
        assert!(!queue.ack(receipt));
    }
}
