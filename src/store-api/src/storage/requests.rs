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

//! Read requests: partition slices and read commands.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::metadata::{ColumnId, TableId, TableMetadata};
use crate::storage::keys::PartitionKey;
use crate::storage::range::{ClusteringBound, ClusteringRange};

/// Maximum number of rows of one partition a slice may request.
pub const PARTITION_MAX_ROWS: u64 = u64::MAX;

/// Boolean options of a [PartitionSlice].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SliceOptions {
    /// Serve each partition's clustering rows in reverse schema order.
    pub reversed: bool,
    /// Allow terminating the page early when the result memory limit is
    /// reached.
    pub allow_short_read: bool,
    /// Return the static row even when no clustering row matches.
    pub always_return_static_content: bool,
}

/// Declares what to read from each partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionSlice {
    /// Ids of static columns to return.
    pub static_columns: Vec<ColumnId>,
    /// Ids of regular columns to return.
    pub regular_columns: Vec<ColumnId>,
    /// Default clustering ranges, in clustering order.
    pub clustering_ranges: Vec<ClusteringRange>,
    /// Per-partition overrides of the clustering ranges.
    pub per_partition_ranges: Vec<(PartitionKey, Vec<ClusteringRange>)>,
    /// Maximum number of rows to return per partition.
    pub partition_row_limit: u64,
    /// Boolean options.
    pub options: SliceOptions,
}

impl PartitionSlice {
    /// A slice selecting all columns of `metadata` over the full
    /// clustering range.
    pub fn full(metadata: &TableMetadata) -> PartitionSlice {
        PartitionSlice {
            static_columns: metadata.static_column_ids(),
            regular_columns: metadata.regular_column_ids(),
            clustering_ranges: vec![ClusteringRange::full()],
            per_partition_ranges: Vec::new(),
            partition_row_limit: PARTITION_MAX_ROWS,
            options: SliceOptions::default(),
        }
    }

    /// Creates a slice with explicit columns and ranges.
    pub fn new(
        static_columns: Vec<ColumnId>,
        regular_columns: Vec<ColumnId>,
        clustering_ranges: Vec<ClusteringRange>,
        options: SliceOptions,
    ) -> PartitionSlice {
        PartitionSlice {
            static_columns,
            regular_columns,
            clustering_ranges,
            per_partition_ranges: Vec::new(),
            partition_row_limit: PARTITION_MAX_ROWS,
            options,
        }
    }

    /// Sets the per-partition row limit.
    pub fn set_partition_row_limit(&mut self, limit: u64) {
        self.partition_row_limit = limit;
    }

    /// Overrides the clustering ranges for one partition. Used by paging to
    /// resume the first partition after its last returned row.
    pub fn set_range(&mut self, key: PartitionKey, ranges: Vec<ClusteringRange>) {
        if let Some(entry) = self
            .per_partition_ranges
            .iter_mut()
            .find(|(k, _)| *k == key)
        {
            entry.1 = ranges;
        } else {
            self.per_partition_ranges.push((key, ranges));
        }
    }

    /// Effective clustering ranges for `key`.
    pub fn ranges_for(&self, key: &PartitionKey) -> &[ClusteringRange] {
        self.per_partition_ranges
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, ranges)| ranges.as_slice())
            .unwrap_or(&self.clustering_ranges)
    }

    /// First clustering bound of the page for `key`, in iteration order.
    pub fn first_bound_for(&self, key: &PartitionKey) -> Option<&ClusteringBound> {
        let ranges = self.ranges_for(key);
        if self.options.reversed {
            ranges.last()?.first_bound(true)
        } else {
            ranges.first()?.first_bound(false)
        }
    }

    /// Returns whether the slice is reversed.
    pub fn is_reversed(&self) -> bool {
        self.options.reversed
    }
}

/// Fully describes one page of a read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadCommand {
    /// Id of the table to read.
    pub table_id: TableId,
    /// Schema version the slice was built against.
    pub schema_version: u64,
    /// What to read from each partition.
    pub slice: PartitionSlice,
    /// Maximum number of rows for the whole query.
    pub row_limit: u64,
    /// Maximum number of partitions for the whole query.
    pub partition_limit: u32,
    /// Query time in seconds, used for TTL evaluation.
    pub query_time: u32,
    /// Stable identifier of the query across its pages, if stateful.
    pub query_id: Option<Uuid>,
    /// True on the first page of a query; no cached querier is expected.
    pub is_first_page: bool,
    /// Read timestamp of the query.
    pub read_timestamp: i64,
    /// Maximum size of the result in bytes.
    pub max_result_size: u64,
}

impl ReadCommand {
    /// A command reading everything from `metadata` in one page.
    pub fn full(metadata: &TableMetadata, query_time: u32) -> ReadCommand {
        ReadCommand {
            table_id: metadata.table_id,
            schema_version: metadata.schema_version,
            slice: PartitionSlice::full(metadata),
            row_limit: u64::MAX,
            partition_limit: u32::MAX,
            query_time,
            query_id: None,
            is_first_page: true,
            read_timestamp: i64::from(query_time) * 1_000_000,
            max_result_size: u64::MAX,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{ColumnKind, TableMetadata};
    use crate::storage::value::{ColumnType, Value};
    use crate::storage::ClusteringKey;

    fn metadata() -> TableMetadata {
        TableMetadata::builder("t", 1)
            .push_column(0, "p", ColumnType::Int32, ColumnKind::PartitionKey)
            .push_column(1, "c", ColumnType::Int32, ColumnKind::ClusteringKey)
            .push_column(2, "v", ColumnType::Text, ColumnKind::Regular)
            .build()
            .unwrap()
    }

    #[test]
    fn test_full_slice() {
        let slice = PartitionSlice::full(&metadata());
        assert_eq!(vec![2], slice.regular_columns);
        assert!(slice.static_columns.is_empty());
        assert_eq!(1, slice.clustering_ranges.len());
        assert!(!slice.is_reversed());
    }

    #[test]
    fn test_per_partition_override() {
        let mut slice = PartitionSlice::full(&metadata());
        let key = PartitionKey::new([Value::Int32(1)]);
        let narrowed = vec![ClusteringRange::singular(ClusteringKey::new([
            Value::Int32(3),
        ]))];
        slice.set_range(key.clone(), narrowed.clone());

        assert_eq!(&narrowed[..], slice.ranges_for(&key));
        let other = PartitionKey::new([Value::Int32(2)]);
        assert_eq!(&slice.clustering_ranges[..], slice.ranges_for(&other));

        // Overriding again replaces the previous override.
        slice.set_range(key.clone(), vec![ClusteringRange::full()]);
        assert_eq!(1, slice.per_partition_ranges.len());
    }

    #[test]
    fn test_first_bound_for_reversed() {
        let mut slice = PartitionSlice::full(&metadata());
        let key = PartitionKey::new([Value::Int32(1)]);
        assert!(slice.first_bound_for(&key).is_none());

        slice.clustering_ranges = vec![ClusteringRange::singular(ClusteringKey::new([
            Value::Int32(7),
        ]))];
        slice.options.reversed = true;
        let bound = slice.first_bound_for(&key).unwrap();
        assert_eq!(ClusteringKey::new([Value::Int32(7)]), bound.key);
    }
}
