// ============================================================================
// Pending Operations
// ============================================================================
//
// The buffer behind a Batch. Each buffered operation carries a sequence
// number so that a flush can commit a frozen copy while the caller keeps
// writing, then settle only what it committed.
//
// Point operations are keyed by encoded key (last write wins). Range deletes
// discard buffered operations they cover, so any point operation still
// buffered is newer than every range that contains its key.
//
// ============================================================================

use crate::core::KeyRange;
use std::collections::BTreeMap;

/// A single buffered mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingOp {
    Put(Vec<u8>),
    Delete,
}

#[derive(Debug, Clone)]
struct Staged {
    op: PendingOp,
    seq: u64,
}

/// Outcome of looking a key up in the buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    /// A buffered put
    Put(Vec<u8>),
    /// A buffered delete or a covering range delete
    Deleted,
    /// Nothing buffered; read through
    Miss,
}

/// Immutable copy of a buffer, handed to the commit path.
#[derive(Debug, Clone, Default)]
pub struct PendingOps {
    entries: BTreeMap<Vec<u8>, PendingOp>,
    ranges: Vec<KeyRange>,
}

impl PendingOps {
    /// Point operations in key order
    pub fn entries(&self) -> impl Iterator<Item = (&Vec<u8>, &PendingOp)> {
        self.entries.iter()
    }

    /// Range deletes in issue order; applied before point operations
    pub fn ranges(&self) -> impl Iterator<Item = &KeyRange> {
        self.ranges.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len() + self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.ranges.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct BatchCore {
    entries: BTreeMap<Vec<u8>, Staged>,
    ranges: Vec<(KeyRange, u64)>,
    seq: u64,
    recycled: bool,
}

impl BatchCore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        let seq = self.next_seq();
        self.entries.insert(
            key,
            Staged {
                op: PendingOp::Put(value),
                seq,
            },
        );
    }

    pub fn delete(&mut self, key: Vec<u8>) {
        let seq = self.next_seq();
        self.entries.insert(
            key,
            Staged {
                op: PendingOp::Delete,
                seq,
            },
        );
    }

    pub fn delete_range(&mut self, range: KeyRange) {
        if range.is_empty() {
            return;
        }
        let seq = self.next_seq();
        self.entries.retain(|key, _| !range.contains(key));
        self.ranges.push((range, seq));
    }

    pub fn lookup(&self, key: &[u8]) -> Lookup {
        if let Some(staged) = self.entries.get(key) {
            return match &staged.op {
                PendingOp::Put(value) => Lookup::Put(value.clone()),
                PendingOp::Delete => Lookup::Deleted,
            };
        }
        if self.ranges.iter().any(|(range, _)| range.contains(key)) {
            return Lookup::Deleted;
        }
        Lookup::Miss
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.entries.contains_key(key)
    }

    /// Number of buffered operations
    pub fn len(&self) -> usize {
        self.entries.len() + self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.ranges.is_empty()
    }

    /// Copy the buffer for commit. The returned watermark identifies every
    /// operation included in the copy.
    pub fn freeze(&self) -> (PendingOps, u64) {
        let ops = PendingOps {
            entries: self
                .entries
                .iter()
                .map(|(key, staged)| (key.clone(), staged.op.clone()))
                .collect(),
            ranges: self.ranges.iter().map(|(range, _)| range.clone()).collect(),
        };
        (ops, self.seq)
    }

    /// Drop operations committed under `watermark`; later ones stay buffered.
    pub fn settle(&mut self, watermark: u64) {
        self.entries.retain(|_, staged| staged.seq > watermark);
        self.ranges.retain(|(_, seq)| *seq > watermark);
    }

    /// Clear everything for reuse from a pool.
    pub fn reset(&mut self) {
        self.entries.clear();
        self.ranges.clear();
        self.seq = 0;
        self.recycled = false;
    }

    pub fn mark_recycled(&mut self) {
        self.recycled = true;
    }

    pub fn is_recycled(&self) -> bool {
        self.recycled
    }

    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }
}
