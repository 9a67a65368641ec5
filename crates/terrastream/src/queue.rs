//! Priority queue of pending downloads.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;

use crate::layer::LayerDescriptor;
use crate::tile::TileKey;

/// Priority given to re-queued retries, below every layer priority.
pub const RETRY_PRIORITY: i32 = i32::MIN;

/// One fetch of one layer of one tile.
#[derive(Debug, Clone)]
pub struct DownloadTask {
    /// The tile to fetch.
    pub key: TileKey,
    /// The layer being fetched.
    pub layer: Arc<LayerDescriptor>,
    /// Queue priority; higher runs first.
    pub priority: i32,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Request generation, used to recognize stale results.
    pub generation: u64,
    /// FIFO tie-break among equal priorities, assigned on push.
    seq: u64,
}

impl DownloadTask {
    /// A first attempt at the layer's own priority.
    #[must_use]
    pub fn new(key: TileKey, layer: Arc<LayerDescriptor>, generation: u64) -> Self {
        Self {
            key,
            priority: layer.priority,
            layer,
            attempt: 1,
            generation,
            seq: 0,
        }
    }

    /// The follow-up attempt, queued behind all first attempts.
    #[must_use]
    pub fn retry(&self) -> Self {
        Self {
            key: self.key,
            layer: Arc::clone(&self.layer),
            priority: RETRY_PRIORITY,
            attempt: self.attempt + 1,
            generation: self.generation,
            seq: 0,
        }
    }

    /// Resolved request URL.
    #[must_use]
    pub fn url(&self, token: Option<&str>) -> String {
        self.layer.resolve_url(self.key, token)
    }

    /// Whether this task fetches `layer` of `key`.
    #[must_use]
    pub fn matches(&self, key: TileKey, layer: &str) -> bool {
        self.key == key && self.layer.layer_type == layer
    }
}

impl PartialEq for DownloadTask {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for DownloadTask {}

impl PartialOrd for DownloadTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DownloadTask {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Max-heap of download tasks: highest priority first, FIFO within a priority.
#[derive(Debug, Default)]
pub struct FetchQueue {
    heap: BinaryHeap<DownloadTask>,
    next_seq: u64,
}

impl FetchQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a task behind every queued task of the same priority.
    pub fn push(&mut self, mut task: DownloadTask) {
        task.seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(task);
    }

    /// Take the next task to run.
    pub fn pop(&mut self) -> Option<DownloadTask> {
        self.heap.pop()
    }

    /// Remove the queued task for `layer` of `key`. Returns whether one was
    /// queued.
    pub fn remove(&mut self, key: TileKey, layer: &str) -> bool {
        let before = self.heap.len();
        self.heap.retain(|task| !task.matches(key, layer));
        self.heap.len() != before
    }

    /// Remove every queued task matching `predicate`. Returns how many were
    /// removed.
    pub fn remove_where(&mut self, mut predicate: impl FnMut(&DownloadTask) -> bool) -> usize {
        let before = self.heap.len();
        self.heap.retain(|task| !predicate(task));
        before - self.heap.len()
    }

    /// Number of queued tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Whether no tasks are queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}
