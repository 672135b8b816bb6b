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

//! Result of a mutation query page.

use store_api::storage::{DecoratedKey, DeletionTime};

use crate::read::compact::{CompactedFragmentsConsumer, StopIteration};
use crate::read::{
    ClusteringRow, MutationFragment, PartitionStart, RangeTombstone, StaticRow,
};

/// One partition of a [MutationResult].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultPartition {
    pub key: DecoratedKey,
    pub partition_tombstone: DeletionTime,
    pub static_row: Option<StaticRow>,
    pub rows: Vec<ClusteringRow>,
    pub range_tombstones: Vec<RangeTombstone>,
}

/// The reconciled result of one page of a mutation query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MutationResult {
    partitions: Vec<ResultPartition>,
    row_count: u64,
    short_read: bool,
}

impl MutationResult {
    /// Partitions of the result, in stream order.
    pub fn partitions(&self) -> &[ResultPartition] {
        &self.partitions
    }

    /// Number of rows in the result; a partition with only static content
    /// counts as one row.
    pub fn row_count(&self) -> u64 {
        self.row_count
    }

    /// Returns whether the page was terminated by the memory limit.
    pub fn is_short_read(&self) -> bool {
        self.short_read
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }

    /// Flattens the result back into a fragment stream. Used to compare
    /// paginated and unpaginated reads.
    pub fn to_fragments(&self) -> Vec<MutationFragment> {
        let mut fragments = Vec::new();
        for partition in &self.partitions {
            fragments.push(MutationFragment::PartitionStart(PartitionStart {
                key: partition.key.clone(),
                deletion: partition.partition_tombstone,
            }));
            if let Some(static_row) = &partition.static_row {
                fragments.push(MutationFragment::StaticRow(static_row.clone()));
            }
            for rt in &partition.range_tombstones {
                fragments.push(MutationFragment::RangeTombstone(rt.clone()));
            }
            for row in &partition.rows {
                fragments.push(MutationFragment::ClusteringRow(row.clone()));
            }
            fragments.push(MutationFragment::PartitionEnd);
        }
        fragments
    }

    /// Merges `page` onto this result, concatenating split partitions.
    pub fn extend_with_page(&mut self, page: MutationResult) {
        self.row_count += page.row_count;
        self.short_read = page.short_read;
        for partition in page.partitions {
            match self.partitions.last_mut() {
                Some(last) if last.key == partition.key => {
                    last.rows.extend(partition.rows);
                    last.range_tombstones.extend(partition.range_tombstones);
                    if last.static_row.is_none() {
                        last.static_row = partition.static_row;
                    }
                }
                _ => self.partitions.push(partition),
            }
        }
    }
}

/// Builds a [MutationResult] while accounting result memory.
///
/// When the accounted size exceeds `max_size` and short reads are allowed,
/// the builder stops the page; the result is then marked as a short read.
pub struct MutationResultBuilder {
    partitions: Vec<ResultPartition>,
    current: Option<ResultPartition>,
    row_count: u64,
    bytes_used: u64,
    max_size: u64,
    allow_short_read: bool,
    short_read: bool,
}

impl MutationResultBuilder {
    pub fn new(max_size: u64, allow_short_read: bool) -> MutationResultBuilder {
        MutationResultBuilder {
            partitions: Vec::new(),
            current: None,
            row_count: 0,
            bytes_used: 0,
            max_size,
            allow_short_read,
            short_read: false,
        }
    }

    fn account(&mut self, bytes: usize) -> StopIteration {
        self.bytes_used += bytes as u64;
        if self.bytes_used > self.max_size && self.allow_short_read {
            self.short_read = true;
            StopIteration::Yes
        } else {
            StopIteration::No
        }
    }

    fn flush_current(&mut self) {
        if let Some(partition) = self.current.take() {
            let has_rows = !partition.rows.is_empty();
            let has_static = partition.static_row.is_some();
            if has_rows || has_static || !partition.partition_tombstone.is_live() {
                if has_rows {
                    self.row_count += partition.rows.len() as u64;
                } else if has_static {
                    self.row_count += 1;
                }
                self.partitions.push(partition);
            }
        }
    }
}

impl CompactedFragmentsConsumer for MutationResultBuilder {
    type Output = MutationResult;

    fn consume_new_partition(&mut self, partition_start: &PartitionStart) {
        self.flush_current();
        self.bytes_used += partition_start.estimated_size() as u64;
        self.current = Some(ResultPartition {
            key: partition_start.key.clone(),
            partition_tombstone: partition_start.deletion,
            static_row: None,
            rows: Vec::new(),
            range_tombstones: Vec::new(),
        });
    }

    fn consume_partition_tombstone(&mut self, tombstone: DeletionTime) {
        if let Some(current) = &mut self.current {
            current.partition_tombstone = current.partition_tombstone.merge(tombstone);
        }
    }

    fn consume_static_row(&mut self, row: StaticRow) -> StopIteration {
        let bytes = row.estimated_size();
        if let Some(current) = &mut self.current {
            current.static_row = Some(row);
        }
        self.account(bytes)
    }

    fn consume_clustering_row(&mut self, row: ClusteringRow) -> StopIteration {
        let bytes = row.estimated_size();
        if let Some(current) = &mut self.current {
            current.rows.push(row);
        }
        self.account(bytes)
    }

    fn consume_range_tombstone(&mut self, tombstone: RangeTombstone) -> StopIteration {
        let bytes = tombstone.estimated_size();
        if let Some(current) = &mut self.current {
            current.range_tombstones.push(tombstone);
        }
        self.account(bytes)
    }

    fn consume_end_of_partition(&mut self) -> StopIteration {
        self.flush_current();
        StopIteration::No
    }

    fn consume_end_of_stream(mut self) -> MutationResult {
        self.flush_current();
        MutationResult {
            partitions: self.partitions,
            row_count: self.row_count,
            short_read: self.short_read,
        }
    }
}
