// Copyright 2023 Greptime Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The partition index of an SSTable and its promoted per-partition index.

use store_api::storage::{ClusteringKey, DecoratedKey};

/// One block of the promoted index of a partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromotedBlock {
    /// File offset of the first unfiltered of the block.
    pub offset: u64,
    /// Clustering key of the first unfiltered of the block.
    pub first_key: ClusteringKey,
}

/// Index entry of one partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionIndexEntry {
    /// Key of the partition.
    pub key: DecoratedKey,
    /// File offset the partition starts at.
    pub offset: u64,
    /// Byte length of the partition, including its end-of-partition flag.
    pub len: u64,
    /// Promoted index blocks, in clustering order.
    pub promoted: Vec<PromotedBlock>,
}

/// Index of all partitions of an SSTable, in token order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SsTableIndex {
    pub entries: Vec<PartitionIndexEntry>,
}

impl SsTableIndex {
    /// Finds the entry of `key`.
    pub fn find(&self, key: &DecoratedKey) -> Option<&PartitionIndexEntry> {
        self.entries.iter().find(|e| &e.key == key)
    }
}

/// Reader over one partition's promoted index.
///
/// Gives the reverse data source its seek hints: the offset of the last
/// promoted block and a monotone non-increasing `data_end` cursor used to
/// express skipping. The cursor always points at an unfiltered boundary;
/// the unfiltered at the cursor is the first one beyond the remaining
/// clustering range.
#[derive(Debug, Clone)]
pub struct IndexReader {
    entry: PartitionIndexEntry,
    data_end: Option<u64>,
}

impl IndexReader {
    pub fn new(entry: PartitionIndexEntry) -> IndexReader {
        IndexReader {
            entry,
            data_end: None,
        }
    }

    /// The indexed partition entry.
    pub fn entry(&self) -> &PartitionIndexEntry {
        &self.entry
    }

    /// Offset of the last promoted block, or `None` when the partition has
    /// at most one block.
    pub fn last_block_offset(&self) -> Option<u64> {
        if self.entry.promoted.len() <= 1 {
            return None;
        }
        self.entry.promoted.last().map(|b| b.offset)
    }

    /// Current end cursor, if any reduction was applied.
    pub fn data_end(&self) -> Option<u64> {
        self.data_end
    }

    /// Lowers the end cursor to `end`. Reductions only.
    pub fn set_data_end(&mut self, end: u64) {
        match self.data_end {
            Some(current) => {
                assert!(end <= current, "index end cursor may only decrease");
                self.data_end = Some(end);
            }
            None => self.data_end = Some(end),
        }
    }

    /// Lowers the end cursor so that rows with a clustering key greater
    /// than `bound` can be skipped, at promoted block granularity.
    pub fn advance_upper_bound(&mut self, bound: &ClusteringKey) {
        let Some(block) = self.entry.promoted.iter().find(|b| &b.first_key > bound) else {
            return;
        };
        let offset = block.offset;
        match self.data_end {
            Some(current) if offset >= current => {}
            _ => self.set_data_end(offset),
        }
    }
}

#[cfg(test)]
mod tests {
    use store_api::storage::{PartitionKey, Value};

    use super::*;

    fn ck(v: i32) -> ClusteringKey {
        ClusteringKey::new([Value::Int32(v)])
    }

    fn entry(blocks: &[(u64, i32)]) -> PartitionIndexEntry {
        PartitionIndexEntry {
            key: PartitionKey::new([Value::Int32(1)]).decorate(),
            offset: 0,
            len: 1000,
            promoted: blocks
                .iter()
                .map(|(offset, v)| PromotedBlock {
                    offset: *offset,
                    first_key: ck(*v),
                })
                .collect(),
        }
    }

    #[test]
    fn test_last_block_offset() {
        let single = IndexReader::new(entry(&[(10, 1)]));
        assert!(single.last_block_offset().is_none());

        let multi = IndexReader::new(entry(&[(10, 1), (200, 5), (400, 9)]));
        assert_eq!(Some(400), multi.last_block_offset());
    }

    #[test]
    fn test_end_cursor_monotone() {
        let mut reader = IndexReader::new(entry(&[(10, 1)]));
        assert!(reader.data_end().is_none());
        reader.set_data_end(500);
        reader.set_data_end(300);
        assert_eq!(Some(300), reader.data_end());
    }

    #[test]
    #[should_panic(expected = "only decrease")]
    fn test_end_cursor_rejects_increase() {
        let mut reader = IndexReader::new(entry(&[(10, 1)]));
        reader.set_data_end(300);
        reader.set_data_end(500);
    }

    #[test]
    fn test_advance_upper_bound() {
        let mut reader = IndexReader::new(entry(&[(10, 1), (200, 5), (400, 9)]));
        // Everything up to key 6 stays; the block starting at key 9 is cut.
        reader.advance_upper_bound(&ck(6));
        assert_eq!(Some(400), reader.data_end());
        // A wider bound never raises the cursor again.
        reader.advance_upper_bound(&ck(100));
        assert_eq!(Some(400), reader.data_end());
        // A narrower bound lowers it further.
        reader.advance_upper_bound(&ck(3));
        assert_eq!(Some(200), reader.data_end());
    }
}
