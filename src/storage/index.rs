// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Chunk index: maps (dataset, chunk offset) → ChunkLocation.
//!
//! The index lives in memory while a container is open but is **persistent**:
//! on open, the container file is scanned sequentially and the index is
//! rebuilt from the chunk records embedded in the data stream. No separate
//! index structure is written, so chunk writes remain pure appends.

use std::collections::{BTreeMap, HashMap};

/// Physical placement of a chunk's stored bytes inside the container file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkLocation {
    /// Byte offset of the first payload byte.
    pub address: u64,
    /// Stored (possibly filtered) size in bytes.
    pub size: u64,
    pub filter_mask: u32,
}

/// A chunk record recovered by scanning a container file.
#[derive(Debug, Clone)]
pub struct ScannedChunk {
    pub dataset: String,
    pub offset: Vec<u64>,
    pub location: ChunkLocation,
}

/// In-memory index of every allocated chunk, per dataset.
///
/// Offsets are ordered lexicographically, which is row-major chunk-grid order.
#[derive(Default)]
pub struct ChunkIndex {
    entries: HashMap<String, BTreeMap<Vec<u64>, ChunkLocation>>,
}

impl ChunkIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the latest location of a chunk. Returns the superseded one, if any.
    pub fn insert(
        &mut self,
        dataset: &str,
        offset: &[u64],
        location: ChunkLocation,
    ) -> Option<ChunkLocation> {
        self.entries
            .entry(dataset.to_string())
            .or_default()
            .insert(offset.to_vec(), location)
    }

    pub fn get(&self, dataset: &str, offset: &[u64]) -> Option<ChunkLocation> {
        self.entries.get(dataset)?.get(offset).copied()
    }

    /// The `n`-th allocated chunk of `dataset` in chunk-grid order.
    pub fn nth(&self, dataset: &str, n: usize) -> Option<(&[u64], ChunkLocation)> {
        self.entries
            .get(dataset)?
            .iter()
            .nth(n)
            .map(|(offset, loc)| (offset.as_slice(), *loc))
    }

    pub fn count(&self, dataset: &str) -> usize {
        self.entries.get(dataset).map_or(0, BTreeMap::len)
    }

    /// Number of indexed chunks across all datasets.
    pub fn total_chunks(&self) -> usize {
        self.entries.values().map(BTreeMap::len).sum()
    }

    /// Merge records recovered by scanning the container.
    /// Later records for the same offset supersede earlier ones.
    pub fn extend_from_scanned(&mut self, records: Vec<ScannedChunk>) {
        for r in records {
            self.insert(&r.dataset, &r.offset, r.location);
        }
    }
}
