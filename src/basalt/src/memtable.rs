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

//! Memtables are write buffers for tables.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use store_api::metadata::TableMetadataRef;
use store_api::storage::{
    ClusteringKey, ClusteringRange, DecoratedKey, DeletionTime, PartitionRange, PartitionSlice,
};

use crate::error::Result;
use crate::read::reverse::ReversingSource;
use crate::read::{
    Cell, ClusteringRow, FastForwardTo, FragmentReader, FragmentSource, Mutation,
    MutationFragment, MutationSource, PartitionForwarding, PartitionStart, RangeForwarding,
    RangeTombstone, StaticRow, TraceState,
};
use crate::semaphore::ReaderPermit;

/// Id for memtables.
///
/// Should be unique under the same table shard.
pub type MemtableId = u32;

/// Number of fragments one `fill_buffer` call produces.
const FILL_BATCH_SIZE: usize = 32;

#[derive(Debug, Default, Clone)]
struct MemPartition {
    deletion: DeletionTime,
    static_row: Option<StaticRow>,
    rows: BTreeMap<ClusteringKey, ClusteringRow>,
    range_tombstones: Vec<RangeTombstone>,
}

#[derive(Debug, Default)]
struct MemtableInner {
    partitions: BTreeMap<DecoratedKey, MemPartition>,
}

/// In memory write buffer, ordered by token then clustering key.
#[derive(Debug)]
pub struct Memtable {
    id: MemtableId,
    metadata: TableMetadataRef,
    inner: RwLock<MemtableInner>,
}

pub type MemtableRef = Arc<Memtable>;

impl Memtable {
    /// Returns a new memtable with specific `id`.
    pub fn new(id: MemtableId, metadata: TableMetadataRef) -> Memtable {
        Memtable {
            id,
            metadata,
            inner: RwLock::new(MemtableInner::default()),
        }
    }

    /// Returns the id of this memtable.
    pub fn id(&self) -> MemtableId {
        self.id
    }

    /// Metadata of the table the memtable buffers.
    pub fn metadata(&self) -> &TableMetadataRef {
        &self.metadata
    }

    /// Returns whether the memtable holds no data.
    pub fn is_empty(&self) -> bool {
        self.inner.read().unwrap().partitions.is_empty()
    }

    /// Applies a mutation.
    pub fn apply(&self, mutation: Mutation) {
        let mut inner = self.inner.write().unwrap();
        let partition = inner.partitions.entry(mutation.key).or_default();

        partition.deletion = partition.deletion.merge(mutation.partition_tombstone);

        if !mutation.static_cells.is_empty() {
            let static_row = partition.static_row.get_or_insert_with(StaticRow::default);
            for cell in mutation.static_cells {
                upsert_cell(&mut static_row.cells, cell);
            }
        }

        for row in mutation.rows {
            match partition.rows.get_mut(&row.key) {
                Some(existing) => {
                    existing.row_tombstone = existing.row_tombstone.merge(row.row_tombstone);
                    for cell in row.cells {
                        upsert_cell(&mut existing.cells, cell);
                    }
                }
                None => {
                    partition.rows.insert(row.key.clone(), row);
                }
            }
        }

        for rt in mutation.range_tombstones {
            partition.range_tombstones.push(rt);
        }
        partition
            .range_tombstones
            .sort_by(|a, b| a.start.key.cmp(&b.start.key));
    }

    /// Snapshots the partitions within `range` as fragment lists obeying
    /// `slice`, in token order.
    fn snapshot(&self, range: &PartitionRange, slice: &PartitionSlice) -> Vec<Vec<MutationFragment>> {
        let inner = self.inner.read().unwrap();
        inner
            .partitions
            .iter()
            .filter(|(key, _)| range.contains(key))
            .map(|(key, partition)| partition_fragments(key, partition, slice))
            .collect()
    }
}

/// Replaces the cell of the same column if the new write wins.
fn upsert_cell(cells: &mut Vec<Cell>, cell: Cell) {
    match cells.iter_mut().find(|c| c.column_id == cell.column_id) {
        Some(existing) => {
            if cell.timestamp >= existing.timestamp {
                *existing = cell;
            }
        }
        None => cells.push(cell),
    }
}

/// Builds the forward fragment list of one partition restricted to `slice`.
fn partition_fragments(
    key: &DecoratedKey,
    partition: &MemPartition,
    slice: &PartitionSlice,
) -> Vec<MutationFragment> {
    let ranges = slice.ranges_for(&key.key);

    let mut fragments = Vec::new();
    fragments.push(MutationFragment::PartitionStart(PartitionStart {
        key: key.clone(),
        deletion: partition.deletion,
    }));

    if let Some(static_row) = &partition.static_row {
        let wants_static =
            !slice.static_columns.is_empty() || slice.options.always_return_static_content;
        if wants_static {
            let cells = project_cells(&static_row.cells, &slice.static_columns);
            if !cells.is_empty() {
                fragments.push(MutationFragment::StaticRow(StaticRow::new(cells)));
            }
        }
    }

    // Rows and tombstones interleaved in clustering order; a range
    // tombstone is positioned by its start bound.
    let mut items: Vec<(ClusteringKey, bool, MutationFragment)> = Vec::new();
    for (row_key, row) in &partition.rows {
        if !ranges.iter().any(|r| r.contains(row_key)) {
            continue;
        }
        let row = ClusteringRow {
            key: row.key.clone(),
            row_tombstone: row.row_tombstone,
            cells: project_cells(&row.cells, &slice.regular_columns),
        };
        items.push((row_key.clone(), false, MutationFragment::ClusteringRow(row)));
    }
    for rt in &partition.range_tombstones {
        if !tombstone_intersects(rt, ranges) {
            continue;
        }
        let position = rt.start.key.clone();
        items.push((position, true, MutationFragment::RangeTombstone(rt.clone())));
    }

    // Tombstones sort before rows at equal positions.
    items.sort_by(|(ka, ma, _), (kb, mb, _)| ka.cmp(kb).then_with(|| mb.cmp(ma)));
    fragments.extend(items.into_iter().map(|(_, _, f)| f));

    fragments.push(MutationFragment::PartitionEnd);
    fragments
}

/// Returns whether `rt` intersects any of `ranges`.
fn tombstone_intersects(rt: &RangeTombstone, ranges: &[ClusteringRange]) -> bool {
    ranges.iter().any(|r| {
        r.contains(&rt.start.key)
            || r.contains(&rt.end.key)
            || r.start.as_ref().map(|b| rt.covers(&b.key)).unwrap_or(false)
            || r.end.as_ref().map(|b| rt.covers(&b.key)).unwrap_or(false)
    })
}

fn project_cells(cells: &[Cell], columns: &[store_api::metadata::ColumnId]) -> Vec<Cell> {
    cells
        .iter()
        .filter(|c| columns.contains(&c.column_id))
        .cloned()
        .collect()
}

/// Source over a memtable snapshot.
struct MemtableReaderSource {
    memtable: MemtableRef,
    slice: PartitionSlice,
    partitions: VecDeque<VecDeque<MutationFragment>>,
    /// Clustering window applied to the current partition after a fast
    /// forward, if any.
    clustering_window: Option<ClusteringRange>,
}

impl MemtableReaderSource {
    fn new(memtable: MemtableRef, range: &PartitionRange, slice: PartitionSlice) -> Self {
        let partitions = memtable
            .snapshot(range, &slice)
            .into_iter()
            .map(VecDeque::from)
            .collect();
        MemtableReaderSource {
            memtable,
            slice,
            partitions,
            clustering_window: None,
        }
    }

    fn in_window(&self, fragment: &MutationFragment) -> bool {
        let Some(window) = &self.clustering_window else {
            return true;
        };
        match fragment {
            MutationFragment::ClusteringRow(row) => window.contains(&row.key),
            MutationFragment::RangeTombstone(rt) => {
                window.contains(&rt.start.key) || window.contains(&rt.end.key)
            }
            _ => true,
        }
    }
}

#[async_trait]
impl FragmentSource for MemtableReaderSource {
    fn metadata(&self) -> &TableMetadataRef {
        self.memtable.metadata()
    }

    async fn fill_buffer(&mut self, buffer: &mut VecDeque<MutationFragment>) -> Result<bool> {
        let mut produced = 0;
        while produced < FILL_BATCH_SIZE {
            let Some(partition) = self.partitions.front_mut() else {
                return Ok(true);
            };
            match partition.pop_front() {
                Some(fragment) => {
                    let done = fragment.is_partition_end();
                    if done {
                        self.partitions.pop_front();
                        self.clustering_window = None;
                    }
                    if self.in_window(&fragment) {
                        buffer.push_back(fragment);
                        produced += 1;
                    }
                }
                None => {
                    self.partitions.pop_front();
                }
            }
        }
        Ok(self.partitions.is_empty())
    }

    async fn next_partition(&mut self) -> Result<()> {
        self.partitions.pop_front();
        self.clustering_window = None;
        Ok(())
    }

    async fn fast_forward_to(&mut self, target: FastForwardTo) -> Result<()> {
        match target {
            FastForwardTo::Clustering(range) => {
                self.clustering_window = Some(range);
            }
            FastForwardTo::Partitions(range) => {
                self.partitions = self
                    .memtable
                    .snapshot(&range, &self.slice)
                    .into_iter()
                    .map(VecDeque::from)
                    .collect();
                self.clustering_window = None;
            }
        }
        Ok(())
    }
}

impl MutationSource for Memtable {
    fn make_reader(
        &self,
        metadata: TableMetadataRef,
        permit: ReaderPermit,
        range: &PartitionRange,
        slice: &PartitionSlice,
        trace: Option<&TraceState>,
        _partition_fwd: PartitionForwarding,
        _range_fwd: RangeForwarding,
    ) -> Result<FragmentReader> {
        if let Some(trace) = trace {
            trace.trace(&format!("make memtable reader, memtable: {}", self.id));
        }
        // The memtable cannot hand out `self` as an Arc, snapshot through a
        // cheap re-wrap instead.
        let snapshot = Memtable {
            id: self.id,
            metadata: self.metadata.clone(),
            inner: RwLock::new(MemtableInner {
                partitions: self.inner.read().unwrap().partitions.clone(),
            }),
        };
        let source = MemtableReaderSource::new(Arc::new(snapshot), range, slice.clone());
        // The snapshot is forward ordered; reversed slices go through the
        // partition buffering adapter.
        let source: Box<dyn FragmentSource> = if slice.is_reversed() {
            Box::new(ReversingSource::new(Box::new(source)))
        } else {
            Box::new(source)
        };
        Ok(FragmentReader::new(metadata, permit, source))
    }
}
