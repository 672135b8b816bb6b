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

//! Utilities for testing.

use std::collections::VecDeque;
use std::time::Instant;

use async_trait::async_trait;
use store_api::metadata::{ColumnKind, TableMetadata, TableMetadataRef};
use store_api::storage::{
    ClusteringKey, ColumnType, PartitionKey, PartitionRange, PartitionSlice, Value,
};

use crate::error::Result;
use crate::memtable::Memtable;
use crate::read::{
    Cell, ClusteringRow, FastForwardTo, FragmentReader, FragmentSource, Mutation,
    MutationFragment, MutationSource, PartitionForwarding, RangeForwarding,
};
use crate::semaphore::ReaderPermit;

/// Id of the partition key column in [new_metadata].
pub(crate) const COL_P: u32 = 0;
/// Id of the clustering key column in [new_metadata].
pub(crate) const COL_C: u32 = 1;
/// Id of the static column in [new_metadata].
pub(crate) const COL_S: u32 = 2;
/// Id of the regular column in [new_metadata].
pub(crate) const COL_V: u32 = 3;

/// Metadata of the table `(p int, c int, s int static, v text)` with
/// primary key `(p, c)`.
pub(crate) fn new_metadata() -> TableMetadataRef {
    std::sync::Arc::new(
        TableMetadata::builder("test", 1)
            .push_column(COL_P, "p", ColumnType::Int32, ColumnKind::PartitionKey)
            .push_column(COL_C, "c", ColumnType::Int32, ColumnKind::ClusteringKey)
            .push_column(COL_S, "s", ColumnType::Int32, ColumnKind::Static)
            .push_column(COL_V, "v", ColumnType::Text, ColumnKind::Regular)
            .build()
            .unwrap(),
    )
}

/// A clustering row fragment `(c, v)` written at timestamp 1.
pub(crate) fn row_fragment(c: i32, v: &str) -> MutationFragment {
    MutationFragment::ClusteringRow(ClusteringRow::new(
        ClusteringKey::new([Value::Int32(c)]),
        vec![Cell::live(COL_V, 1, Value::Text(v.to_string()))],
    ))
}

/// A mutation upserting `rows` of `(c, v)` pairs into partition `p`,
/// written at timestamp 1.
pub(crate) fn new_row_mutation(p: i32, rows: &[(i32, &str)]) -> Mutation {
    let mut mutation = Mutation::new(PartitionKey::new([Value::Int32(p)]).decorate());
    for (c, v) in rows {
        mutation.rows.push(ClusteringRow::new(
            ClusteringKey::new([Value::Int32(*c)]),
            vec![Cell::live(COL_V, 1, Value::Text(v.to_string()))],
        ));
    }
    mutation
}

/// Upserts one `(p, c) -> v` row written at `timestamp`.
pub(crate) fn insert_row(memtable: &Memtable, p: i32, c: i32, v: &str, timestamp: i64) {
    let mut mutation = Mutation::new(PartitionKey::new([Value::Int32(p)]).decorate());
    mutation.rows.push(ClusteringRow::new(
        ClusteringKey::new([Value::Int32(c)]),
        vec![Cell::live(COL_V, timestamp, Value::Text(v.to_string()))],
    ));
    memtable.apply(mutation);
}

/// Upserts the static column of partition `p`.
pub(crate) fn insert_static(memtable: &Memtable, p: i32, s: i32, timestamp: i64) {
    let mut mutation = Mutation::new(PartitionKey::new([Value::Int32(p)]).decorate());
    mutation
        .static_cells
        .push(Cell::live(COL_S, timestamp, Value::Int32(s)));
    memtable.apply(mutation);
}

/// A full-slice reader over `memtable`.
pub(crate) fn reader_over_memtable(memtable: &Memtable, reversed: bool) -> FragmentReader {
    let mut slice = PartitionSlice::full(memtable.metadata());
    slice.options.reversed = reversed;
    memtable
        .make_reader(
            memtable.metadata().clone(),
            ReaderPermit::untracked(),
            &PartitionRange::full(),
            &slice,
            None,
            PartitionForwarding::No,
            RangeForwarding::No,
        )
        .unwrap()
}

/// Drains `reader` into a vector.
pub(crate) async fn collect_fragments(
    reader: &mut FragmentReader,
    deadline: Instant,
) -> Vec<MutationFragment> {
    let mut fragments = Vec::new();
    while let Some(fragment) = reader.next_fragment(deadline).await.unwrap() {
        fragments.push(fragment);
    }
    fragments
}

/// Asserts that `fragments` form a well formed stream: per partition one
/// start, at most one static row, then rows and tombstones, one end.
pub(crate) fn assert_well_formed(fragments: &[MutationFragment]) {
    let mut in_partition = false;
    let mut saw_static = false;
    let mut saw_row = false;
    for fragment in fragments {
        match fragment {
            MutationFragment::PartitionStart(_) => {
                assert!(!in_partition, "partition start inside a partition");
                in_partition = true;
                saw_static = false;
                saw_row = false;
            }
            MutationFragment::StaticRow(_) => {
                assert!(in_partition, "static row outside a partition");
                assert!(!saw_static, "second static row");
                assert!(!saw_row, "static row after clustering rows");
                saw_static = true;
            }
            MutationFragment::ClusteringRow(_) | MutationFragment::RangeTombstone(_) => {
                assert!(in_partition, "row outside a partition");
                saw_row = true;
            }
            MutationFragment::PartitionEnd => {
                assert!(in_partition, "partition end outside a partition");
                in_partition = false;
            }
        }
    }
    assert!(!in_partition, "stream ended inside a partition");
}

/// Fragment source over a fixed fragment list.
pub(crate) struct VecSource {
    metadata: TableMetadataRef,
    fragments: VecDeque<MutationFragment>,
}

impl VecSource {
    pub(crate) fn new(fragments: Vec<MutationFragment>) -> VecSource {
        VecSource {
            metadata: new_metadata(),
            fragments: fragments.into(),
        }
    }

    pub(crate) fn empty() -> VecSource {
        VecSource::new(Vec::new())
    }
}

#[async_trait]
impl FragmentSource for VecSource {
    fn metadata(&self) -> &TableMetadataRef {
        &self.metadata
    }

    async fn fill_buffer(&mut self, buffer: &mut VecDeque<MutationFragment>) -> Result<bool> {
        // Yield a few fragments per call to exercise refills.
        for _ in 0..3 {
            match self.fragments.pop_front() {
                Some(fragment) => buffer.push_back(fragment),
                None => return Ok(true),
            }
        }
        Ok(self.fragments.is_empty())
    }

    async fn next_partition(&mut self) -> Result<()> {
        while let Some(fragment) = self.fragments.pop_front() {
            if fragment.is_partition_end() {
                break;
            }
        }
        Ok(())
    }

    async fn fast_forward_to(&mut self, _target: FastForwardTo) -> Result<()> {
        Ok(())
    }
}
