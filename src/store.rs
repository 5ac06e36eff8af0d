//! Partial-response preservation.
//!
//! When an attempt dies after emitting chunks, the worker persists them here
//! so the client can still render something. Records are keyed by task id,
//! TTL-bounded, and overwritten wholesale on re-persist (last-writer-wins:
//! only the owning worker writes a given key).
//!
//! [`ChunkTracker`] is the in-process staging half: it assigns monotone
//! indices and timestamps while the attempt runs; nothing touches the store
//! until persistence is triggered. [`reconstruct`] rebuilds the text in
//! `chunk_index` order regardless of input order.

use crate::error::Result;
use crate::types::{epoch_nanos, epoch_secs, Chunk};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// A persisted partial response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialRecord {
    /// Owning task.
    pub task_id: String,
    /// Chunks from the last failed attempt.
    pub chunks: Vec<Chunk>,
    /// Context captured at persist time (error, attempt, kind).
    pub metadata: serde_json::Value,
    /// Epoch seconds at persist time.
    pub saved_at: f64,
    /// Convenience count, equal to `chunks.len()`.
    pub total_chunks: usize,
}

impl PartialRecord {
    /// Build a record from staged chunks, stamping `saved_at` now.
    pub fn new(task_id: impl Into<String>, chunks: Vec<Chunk>, metadata: serde_json::Value) -> Self {
        let total_chunks = chunks.len();
        Self {
            task_id: task_id.into(),
            chunks,
            metadata,
            saved_at: epoch_secs(),
            total_chunks,
        }
    }
}

/// Keyed, TTL-bounded storage for partial responses.
///
/// Persist is best-effort from the worker's point of view: a failing store
/// degrades "show partial on failure" to "show error only", it never fails
/// the task.
#[async_trait]
pub trait PartialStore: Send + Sync {
    /// Commit a record, overwriting any previous record for the same task.
    /// Idempotent for identical input.
    async fn persist(&self, record: PartialRecord) -> Result<()>;

    /// Fetch the persisted record, if present and not expired.
    async fn read(&self, task_id: &str) -> Result<Option<PartialRecord>>;

    /// Drop the persisted record. No-op when absent.
    async fn delete(&self, task_id: &str) -> Result<()>;
}

/// In-process [`PartialStore`] backed by a TTL map.
pub struct MemoryPartialStore {
    ttl: Duration,
    entries: Mutex<HashMap<String, (PartialRecord, Instant)>>,
}

impl MemoryPartialStore {
    /// Create a store with the given record TTL.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Number of live (unexpired) records.
    pub fn len(&self) -> usize {
        let mut entries = self.entries.lock().expect("store lock poisoned");
        let ttl = self.ttl;
        entries.retain(|_, (_, stored)| stored.elapsed() < ttl);
        entries.len()
    }

    /// Whether the store holds no live records.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryPartialStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(3600))
    }
}

#[async_trait]
impl PartialStore for MemoryPartialStore {
    async fn persist(&self, record: PartialRecord) -> Result<()> {
        let mut entries = self.entries.lock().expect("store lock poisoned");
        entries.insert(record.task_id.clone(), (record, Instant::now()));
        Ok(())
    }

    async fn read(&self, task_id: &str) -> Result<Option<PartialRecord>> {
        let mut entries = self.entries.lock().expect("store lock poisoned");
        let expired = match entries.get(task_id) {
            Some((_, stored)) => stored.elapsed() >= self.ttl,
            None => return Ok(None),
        };
        if expired {
            entries.remove(task_id);
            return Ok(None);
        }
        Ok(entries.get(task_id).map(|(record, _)| record.clone()))
    }

    async fn delete(&self, task_id: &str) -> Result<()> {
        let mut entries = self.entries.lock().expect("store lock poisoned");
        entries.remove(task_id);
        Ok(())
    }
}

/// Rebuild the streamed text from chunks: sort ascending by `chunk_index`,
/// concatenate `content`. Order-independent in its input.
pub fn reconstruct(chunks: &[Chunk]) -> String {
    let mut sorted: Vec<&Chunk> = chunks.iter().collect();
    sorted.sort_by_key(|c| c.chunk_index);
    sorted.iter().map(|c| c.content.as_str()).collect()
}

/// In-process staging for one task's chunks.
///
/// Indices restart at 0 for each attempt (`clear` between attempts);
/// timestamps stay monotonic across the task via an epoch base captured at
/// construction plus elapsed time.
#[derive(Debug)]
pub struct ChunkTracker {
    chunks: Vec<Chunk>,
    base_ns: u64,
    started: Instant,
}

impl ChunkTracker {
    /// Start tracking a new task.
    pub fn new() -> Self {
        Self {
            chunks: Vec::new(),
            base_ns: epoch_nanos(),
            started: Instant::now(),
        }
    }

    /// Append a chunk, assigning the next index and a monotonic timestamp.
    pub fn push(&mut self, content: &str, speaker: Option<&str>) -> Chunk {
        let chunk = Chunk {
            content: content.to_string(),
            timestamp_ns: self.base_ns + self.started.elapsed().as_nanos() as u64,
            chunk_index: self.chunks.len() as u64,
            speaker: speaker.map(str::to_string),
        };
        self.chunks.push(chunk.clone());
        chunk
    }

    /// Drop staged chunks (attempt boundary: the provider regenerates).
    pub fn clear(&mut self) {
        self.chunks.clear();
    }

    /// Staged chunks, in emission order.
    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    /// Number of staged chunks.
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    /// Whether nothing is staged.
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

impl Default for ChunkTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn chunk(index: u64, content: &str) -> Chunk {
        Chunk {
            content: content.to_string(),
            timestamp_ns: index,
            chunk_index: index,
            speaker: None,
        }
    }

    #[tokio::test]
    async fn test_persist_then_read_round_trip() {
        let store = MemoryPartialStore::default();
        let record = PartialRecord::new("t1", vec![chunk(0, "par"), chunk(1, "tial")], json!({}));
        store.persist(record.clone()).await.unwrap();

        let read = store.read("t1").await.unwrap().expect("record present");
        assert_eq!(read.chunks, record.chunks);
        assert_eq!(read.total_chunks, 2);
    }

    #[tokio::test]
    async fn test_read_after_delete_yields_nothing() {
        let store = MemoryPartialStore::default();
        store
            .persist(PartialRecord::new("t1", vec![chunk(0, "x")], json!({})))
            .await
            .unwrap();
        store.delete("t1").await.unwrap();
        assert!(store.read("t1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_missing_is_noop() {
        let store = MemoryPartialStore::default();
        store.delete("never-existed").await.unwrap();
    }

    #[tokio::test]
    async fn test_persist_overwrites_previous_record() {
        let store = MemoryPartialStore::default();
        store
            .persist(PartialRecord::new("t1", vec![chunk(0, "old")], json!({})))
            .await
            .unwrap();
        store
            .persist(PartialRecord::new(
                "t1",
                vec![chunk(0, "new"), chunk(1, "er")],
                json!({"attempt": 1}),
            ))
            .await
            .unwrap();

        let read = store.read("t1").await.unwrap().unwrap();
        assert_eq!(reconstruct(&read.chunks), "newer");
        assert_eq!(read.metadata["attempt"], 1);
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let store = MemoryPartialStore::new(Duration::ZERO);
        store
            .persist(PartialRecord::new("t1", vec![chunk(0, "x")], json!({})))
            .await
            .unwrap();
        assert!(store.read("t1").await.unwrap().is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_reconstruct_orders_by_index() {
        let chunks = vec![chunk(2, "!"), chunk(0, "Hi"), chunk(1, " there")];
        assert_eq!(reconstruct(&chunks), "Hi there!");
    }

    #[test]
    fn test_reconstruct_shuffle_stable() {
        let original = vec![chunk(0, "a"), chunk(1, "b"), chunk(2, "c"), chunk(3, "d")];
        let mut shuffled = original.clone();
        shuffled.reverse();
        shuffled.swap(0, 2);
        assert_eq!(reconstruct(&original), reconstruct(&shuffled));
    }

    #[test]
    fn test_reconstruct_empty() {
        assert_eq!(reconstruct(&[]), "");
    }

    #[test]
    fn test_tracker_monotone_indices_no_gaps() {
        let mut tracker = ChunkTracker::new();
        tracker.push("a", None);
        tracker.push("b", None);
        tracker.push("c", Some("Alice"));

        let indices: Vec<u64> = tracker.chunks().iter().map(|c| c.chunk_index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        assert_eq!(tracker.chunks()[2].speaker.as_deref(), Some("Alice"));
    }

    #[test]
    fn test_tracker_timestamps_monotone() {
        let mut tracker = ChunkTracker::new();
        tracker.push("a", None);
        tracker.push("b", None);
        let ts: Vec<u64> = tracker.chunks().iter().map(|c| c.timestamp_ns).collect();
        assert!(ts[0] <= ts[1]);
    }

    #[test]
    fn test_tracker_clear_restarts_indices() {
        let mut tracker = ChunkTracker::new();
        tracker.push("a", None);
        tracker.push("b", None);
        tracker.clear();
        assert!(tracker.is_empty());
        let chunk = tracker.push("c", None);
        assert_eq!(chunk.chunk_index, 0);
    }

    #[test]
    fn test_reconstruct_matches_tracker_emission_order() {
        let mut tracker = ChunkTracker::new();
        tracker.push("Hi", None);
        tracker.push(" there", None);
        tracker.push("!", None);
        assert_eq!(reconstruct(tracker.chunks()), "Hi there!");
    }
}
