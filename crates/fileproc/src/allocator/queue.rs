//! Indexed priority queue of waiting jobs.
//!
//! A binary heap ordered by (score desc, sequence asc)
//! plus an id → entry map. Removal by id drops the map entry and leaves a
//! stale heap node that is skipped on the next peek/pop, so cancel and
//! claim are O(1) and pops stay O(log n) amortized.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::models::{JobPriority, ProcessingType};

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct QueuedJob {
    pub job_id: String,
    pub priority: JobPriority,
    pub processing_types: Vec<ProcessingType>,
    pub priority_score: i64,
    pub queued_at: DateTime<Utc>,
    /// Insertion order; kept across requeues so an entry never loses its place.
    pub seq: u64,
}

#[derive(Debug, PartialEq, Eq)]
struct HeapNode {
    score: i64,
    seq: u64,
    job_id: String,
}

impl Ord for HeapNode {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .cmp(&other.score)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for HeapNode {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
pub struct JobQueue {
    heap: BinaryHeap<HeapNode>,
    entries: HashMap<String, QueuedJob>,
    next_seq: u64,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a job, replacing any entry already queued under the same id.
    pub fn push(
        &mut self,
        job_id: &str,
        priority: JobPriority,
        processing_types: Vec<ProcessingType>,
        priority_score: i64,
    ) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.requeue(QueuedJob {
            job_id: job_id.to_string(),
            priority,
            processing_types,
            priority_score,
            queued_at: Utc::now(),
            seq,
        });
        seq
    }

    /// Puts a previously popped entry back with its original sequence number.
    pub fn requeue(&mut self, entry: QueuedJob) {
        self.heap.push(HeapNode {
            score: entry.priority_score,
            seq: entry.seq,
            job_id: entry.job_id.clone(),
        });
        self.entries.insert(entry.job_id.clone(), entry);
        self.maybe_compact();
    }

    pub fn peek(&mut self) -> Option<&QueuedJob> {
        self.prune_stale_top();
        let top = self.heap.peek()?;
        self.entries.get(&top.job_id)
    }

    pub fn pop(&mut self) -> Option<QueuedJob> {
        self.prune_stale_top();
        let top = self.heap.pop()?;
        self.entries.remove(&top.job_id)
    }

    pub fn remove(&mut self, job_id: &str) -> Option<QueuedJob> {
        self.entries.remove(job_id)
    }

    pub fn get(&self, job_id: &str) -> Option<&QueuedJob> {
        self.entries.get(job_id)
    }

    pub fn contains(&self, job_id: &str) -> bool {
        self.entries.contains_key(job_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Queued entries in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = &QueuedJob> {
        self.entries.values()
    }

    fn is_live(&self, node: &HeapNode) -> bool {
        self.entries
            .get(&node.job_id)
            .is_some_and(|e| e.seq == node.seq && e.priority_score == node.score)
    }

    fn prune_stale_top(&mut self) {
        while let Some(top) = self.heap.peek() {
            if self.is_live(top) {
                break;
            }
            self.heap.pop();
        }
    }

    fn maybe_compact(&mut self) {
        if self.heap.len() <= 2 * self.entries.len() + 16 {
            return;
        }
        let live: Vec<HeapNode> = std::mem::take(&mut self.heap)
            .into_iter()
            .filter(|n| self.is_live(n))
            .collect();
        self.heap = BinaryHeap::from(live);
    }
}
