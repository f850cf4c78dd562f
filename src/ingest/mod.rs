mod batcher;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use uuid::Uuid;

use crate::records::{RecordKind, StreamRecord};

pub use batcher::{Batcher, BatcherError, BatcherSettings, BatcherWorker, DrainReport};

/// FIFO of accepted records awaiting persistence.
///
/// Records leave the queue only after the batcher has written them, so a
/// record is either queued or durably stored.
#[derive(Debug, Default)]
pub struct IngestQueue {
    entries: Mutex<VecDeque<StreamRecord>>,
}

impl IngestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, VecDeque<StreamRecord>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn enqueue(&self, record: StreamRecord) {
        self.entries().push_back(record);
    }

    /// Appends a whole frame under one lock acquisition.
    pub fn enqueue_all(&self, records: impl IntoIterator<Item = StreamRecord>) {
        self.entries().extend(records);
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Clones the `max` oldest records without removing them.
    pub fn snapshot(&self, max: usize) -> Vec<StreamRecord> {
        self.entries().iter().take(max).cloned().collect()
    }

    /// Clones the oldest records of each kind, at most `max_per_kind` per kind,
    /// in queue order. A backlog of one kind never hides the other kinds.
    pub fn snapshot_per_kind(&self, max_per_kind: usize) -> Vec<StreamRecord> {
        let entries = self.entries();
        let mut taken: HashMap<RecordKind, usize> = HashMap::new();
        let mut saturated = 0;
        let mut snapshot = Vec::new();

        for record in entries.iter() {
            if saturated == RecordKind::ALL.len() {
                break;
            }
            let count = taken.entry(record.kind()).or_default();
            if *count >= max_per_kind {
                continue;
            }
            *count += 1;
            if *count == max_per_kind {
                saturated += 1;
            }
            snapshot.push(record.clone());
        }

        snapshot
    }

    /// Drops every record whose `entry_id` is listed; returns how many were removed.
    pub fn remove(&self, entry_ids: &HashSet<Uuid>) -> usize {
        if entry_ids.is_empty() {
            return 0;
        }
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|record| !entry_ids.contains(&record.entry_id));
        before - entries.len()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use crate::records::{RecordData, RecordKind, Sample, Status, StreamRecord};

    use super::IngestQueue;

    fn status_record(device_id: &str, timestamp: i64) -> StreamRecord {
        StreamRecord::new(
            "key",
            RecordData::Status(Status {
                device_id: device_id.to_owned(),
                timestamp,
                connected: true,
                available: true,
            }),
        )
    }

    #[test]
    fn snapshot_is_oldest_first_and_non_destructive() {
        let queue = IngestQueue::new();
        queue.enqueue(status_record("a", 1));
        queue.enqueue_all(vec![status_record("b", 2), status_record("c", 3)]);

        let snapshot = queue.snapshot(2);
        let devices: Vec<&str> = snapshot.iter().map(StreamRecord::device_id).collect();
        assert_eq!(devices, vec!["a", "b"]);
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn per_kind_snapshot_reaches_past_a_single_kind_backlog() {
        let queue = IngestQueue::new();
        queue.enqueue_all((0..4).map(|timestamp| status_record("a", timestamp)));
        queue.enqueue(StreamRecord::new(
            "key",
            RecordData::Sample(Sample {
                device_id: "a".to_owned(),
                id: "spindle".to_owned(),
                ..Sample::default()
            }),
        ));

        let snapshot = queue.snapshot_per_kind(2);
        let kinds: Vec<RecordKind> = snapshot.iter().map(StreamRecord::kind).collect();
        assert_eq!(
            kinds,
            vec![RecordKind::Status, RecordKind::Status, RecordKind::Sample]
        );
        assert_eq!(queue.len(), 5);
        assert!(queue.snapshot_per_kind(0).is_empty());
    }

    #[test]
    fn remove_only_touches_listed_entries() {
        let queue = IngestQueue::new();
        let first = status_record("a", 1);
        let second = status_record("b", 2);
        let first_id = first.entry_id;
        queue.enqueue_all(vec![first, second]);

        // Arrived after the snapshot, must survive removal.
        queue.enqueue(status_record("c", 3));

        let removed = queue.remove(&HashSet::from([first_id]));
        assert_eq!(removed, 1);
        let remaining: Vec<String> = queue
            .snapshot(10)
            .iter()
            .map(|record| record.device_id().to_owned())
            .collect();
        assert_eq!(remaining, vec!["b".to_owned(), "c".to_owned()]);
        assert_eq!(queue.remove(&HashSet::new()), 0);
        assert!(!queue.is_empty());
    }
}
