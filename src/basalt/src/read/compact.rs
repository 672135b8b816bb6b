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

//! Tombstone aware compaction of a fragment stream into one page.

use std::time::Instant;

use store_api::storage::{ClusteringKey, DecoratedKey, DeletionTime, PartitionSlice};

use crate::error::Result;
use crate::read::{
    Cell, ClusteringRow, FragmentKind, FragmentReader, MutationFragment, PartitionStart,
    RangeTombstone, StaticRow,
};

/// Tells the producer whether to keep feeding fragments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopIteration {
    Yes,
    No,
}

/// Consumer of compacted fragments.
pub trait CompactedFragmentsConsumer {
    type Output;

    fn consume_new_partition(&mut self, partition_start: &PartitionStart);
    fn consume_partition_tombstone(&mut self, tombstone: DeletionTime);
    fn consume_static_row(&mut self, row: StaticRow) -> StopIteration;
    fn consume_clustering_row(&mut self, row: ClusteringRow) -> StopIteration;
    fn consume_range_tombstone(&mut self, tombstone: RangeTombstone) -> StopIteration;
    fn consume_end_of_partition(&mut self) -> StopIteration;
    fn consume_end_of_stream(self) -> Self::Output;
}

/// Compaction state carried across the pages of one query.
///
/// Tracks the budgets of the current page, the tombstones currently in
/// effect and the partition header needed to resume (or dismantle) a read
/// that stopped mid-partition.
#[derive(Debug)]
pub struct CompactionState {
    emit_only_live: bool,
    query_time: u32,
    row_limit: u64,
    partition_limit: u32,
    rows_consumed: u64,
    partitions_consumed: u32,
    partition_row_limit: u64,
    rows_in_partition: u64,
    static_row_emitted: bool,
    current_partition: Option<PartitionStart>,
    static_row: Option<StaticRow>,
    open_tombstones: Vec<RangeTombstone>,
}

/// The per-partition pieces of a [CompactionState], handed back to the
/// owning shard when a multishard page is dismantled.
#[derive(Debug, Clone)]
pub struct DetachedCompactionState {
    pub partition_start: PartitionStart,
    pub static_row: Option<StaticRow>,
    pub range_tombstones: Vec<RangeTombstone>,
}

impl CompactionState {
    /// Creates a state. `emit_only_live` selects data query semantics
    /// (only live rows) over mutation query semantics (all fragments).
    pub fn new(emit_only_live: bool, partition_row_limit: u64) -> CompactionState {
        CompactionState {
            emit_only_live,
            query_time: 0,
            row_limit: 0,
            partition_limit: 0,
            rows_consumed: 0,
            partitions_consumed: 0,
            partition_row_limit,
            rows_in_partition: 0,
            static_row_emitted: false,
            current_partition: None,
            static_row: None,
            open_tombstones: Vec::new(),
        }
    }

    /// Starts a new page. When the next fragment continues the current
    /// partition the partition level state is kept.
    pub fn start_new_page(
        &mut self,
        row_limit: u64,
        partition_limit: u32,
        query_time: u32,
        next_fragment_kind: Option<FragmentKind>,
    ) {
        self.row_limit = row_limit;
        self.partition_limit = partition_limit;
        self.query_time = query_time;
        self.rows_consumed = 0;
        self.partitions_consumed = 0;
        if !matches!(
            next_fragment_kind,
            Some(FragmentKind::StaticRow)
                | Some(FragmentKind::ClusteringRow)
                | Some(FragmentKind::RangeTombstone)
                | Some(FragmentKind::PartitionEnd)
        ) {
            self.current_partition = None;
            self.static_row = None;
            self.open_tombstones.clear();
            self.rows_in_partition = 0;
            self.static_row_emitted = false;
        }
    }

    /// Returns whether the page budgets are exhausted.
    pub fn are_limits_reached(&self) -> bool {
        self.rows_consumed >= self.row_limit || self.partitions_consumed >= self.partition_limit
    }

    /// Key of the partition being consumed, if any.
    pub fn current_partition(&self) -> Option<&DecoratedKey> {
        self.current_partition.as_ref().map(|ps| &ps.key)
    }

    /// Detaches the per-partition state for dismantling. Returns `None`
    /// when the read stopped between partitions.
    pub fn detach_state(&mut self) -> Option<DetachedCompactionState> {
        let partition_start = self.current_partition.take()?;
        Some(DetachedCompactionState {
            partition_start,
            static_row: self.static_row.take(),
            range_tombstones: std::mem::take(&mut self.open_tombstones),
        })
    }

    fn effective_tombstone(&self, key: &ClusteringKey) -> DeletionTime {
        let mut tombstone = self
            .current_partition
            .as_ref()
            .map(|ps| ps.deletion)
            .unwrap_or(DeletionTime::LIVE);
        for rt in &self.open_tombstones {
            if rt.covers(key) {
                tombstone = tombstone.merge(rt.deletion);
            }
        }
        tombstone
    }

    /// Drops the cells of `cells` that are shadowed by `tombstone` or, for
    /// data queries, expired at the query time.
    fn compact_cells(&self, cells: Vec<Cell>, tombstone: DeletionTime) -> Vec<Cell> {
        cells
            .into_iter()
            .filter(|cell| {
                if tombstone.deletes(cell.timestamp) {
                    return false;
                }
                if self.emit_only_live {
                    cell.is_live_at(self.query_time)
                } else {
                    true
                }
            })
            .collect()
    }
}

/// Wraps a consumer and records the key of the last clustering row seen,
/// reset at each partition start.
pub struct ClusteringPositionTracker<C> {
    consumer: C,
    last_ckey: Option<ClusteringKey>,
}

impl<C: CompactedFragmentsConsumer> ClusteringPositionTracker<C> {
    pub fn new(consumer: C) -> Self {
        ClusteringPositionTracker {
            consumer,
            last_ckey: None,
        }
    }

    fn consume_new_partition(&mut self, partition_start: &PartitionStart) {
        self.last_ckey = None;
        self.consumer.consume_new_partition(partition_start);
    }

    fn consume_clustering_row(&mut self, row: ClusteringRow) -> StopIteration {
        self.last_ckey = Some(row.key.clone());
        self.consumer.consume_clustering_row(row)
    }

    fn consume_end_of_partition(&mut self) -> StopIteration {
        self.last_ckey = None;
        self.consumer.consume_end_of_partition()
    }

    fn into_parts(self) -> (Option<ClusteringKey>, C) {
        (self.last_ckey, self.consumer)
    }
}

/// Consume a page worth of data from the reader.
///
/// Feeds each fragment through tombstone aware compaction into `consumer`
/// and stops when the row or partition budget is exhausted or the consumer
/// asks to stop (e.g. a result builder hitting its memory ceiling, which is
/// a permitted short read). Returns the key of the last clustering row
/// consumed, or `None` if the last fragment was not a clustering row, along
/// with the consumer's output.
#[allow(clippy::too_many_arguments)]
pub async fn consume_page<C: CompactedFragmentsConsumer>(
    reader: &mut FragmentReader,
    state: &mut CompactionState,
    slice: &PartitionSlice,
    consumer: C,
    row_limit: u64,
    partition_limit: u32,
    query_time: u32,
    deadline: Instant,
) -> Result<(Option<ClusteringKey>, C::Output)> {
    let next_kind = reader.peek(deadline).await?.map(MutationFragment::kind);
    state.start_new_page(row_limit, partition_limit, query_time, next_kind);

    let mut tracker = ClusteringPositionTracker::new(consumer);

    // A page resuming mid-partition replays the partition header so the
    // consumer sees a well formed stream.
    if let Some(partition_start) = state.current_partition.clone() {
        if next_kind.is_some() {
            tracker.consume_new_partition(&partition_start);
            tracker
                .consumer
                .consume_partition_tombstone(partition_start.deletion);
        }
    }

    while let Some(fragment) = reader.next_fragment(deadline).await? {
        let stop = match fragment {
            MutationFragment::PartitionStart(partition_start) => {
                state.rows_in_partition = 0;
                state.static_row_emitted = false;
                state.static_row = None;
                state.open_tombstones.clear();
                tracker.consume_new_partition(&partition_start);
                tracker
                    .consumer
                    .consume_partition_tombstone(partition_start.deletion);
                state.current_partition = Some(partition_start);
                StopIteration::No
            }
            MutationFragment::StaticRow(static_row) => {
                let tombstone = state
                    .current_partition
                    .as_ref()
                    .map(|ps| ps.deletion)
                    .unwrap_or(DeletionTime::LIVE);
                let cells = state.compact_cells(static_row.cells, tombstone);
                if cells.is_empty() && !slice.options.always_return_static_content {
                    StopIteration::No
                } else {
                    let compacted = StaticRow::new(cells);
                    state.static_row = Some(compacted.clone());
                    state.static_row_emitted = true;
                    tracker.consumer.consume_static_row(compacted)
                }
            }
            MutationFragment::ClusteringRow(row) => {
                if state.rows_in_partition >= state.partition_row_limit {
                    StopIteration::No
                } else {
                    let tombstone = state
                        .effective_tombstone(&row.key)
                        .merge(row.row_tombstone);
                    let cells = state.compact_cells(row.cells, tombstone);
                    let live = cells.iter().any(|c| c.is_live_at(query_time));
                    let keep = if state.emit_only_live {
                        live
                    } else {
                        !cells.is_empty() || !row.row_tombstone.is_live()
                    };
                    if keep {
                        state.rows_consumed += 1;
                        state.rows_in_partition += 1;
                        tracker.consume_clustering_row(ClusteringRow {
                            key: row.key,
                            row_tombstone: row.row_tombstone,
                            cells,
                        })
                    } else {
                        StopIteration::No
                    }
                }
            }
            MutationFragment::RangeTombstone(tombstone) => {
                state.open_tombstones.push(tombstone.clone());
                if state.emit_only_live {
                    StopIteration::No
                } else {
                    tracker.consumer.consume_range_tombstone(tombstone)
                }
            }
            MutationFragment::PartitionEnd => {
                if state.rows_in_partition > 0 || state.static_row_emitted {
                    if state.rows_in_partition == 0 {
                        // A partition with only static content counts as
                        // one row towards the limits.
                        state.rows_consumed += 1;
                    }
                    state.partitions_consumed += 1;
                }
                state.current_partition = None;
                state.static_row = None;
                state.open_tombstones.clear();
                state.rows_in_partition = 0;
                state.static_row_emitted = false;
                tracker.consume_end_of_partition()
            }
        };

        if stop == StopIteration::Yes || state.are_limits_reached() {
            break;
        }
    }

    let (last_ckey, consumer) = tracker.into_parts();
    Ok((last_ckey, consumer.consume_end_of_stream()))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use store_api::storage::{ClusteringBound, PartitionKey, Value};

    use super::*;
    use crate::memtable::Memtable;
    use crate::read::result::MutationResultBuilder;
    use crate::read::Mutation;
    use crate::test_util::{insert_row, new_metadata, reader_over_memtable};

    fn far_deadline() -> Instant {
        Instant::now() + Duration::from_secs(60)
    }

    fn builder() -> MutationResultBuilder {
        MutationResultBuilder::new(u64::MAX, false)
    }

    #[tokio::test]
    async fn test_consume_whole_stream() {
        let memtable = Memtable::new(0, new_metadata());
        insert_row(&memtable, 1, 1, "a", 1);
        insert_row(&memtable, 1, 2, "b", 1);
        let mut reader = reader_over_memtable(&memtable, false);

        let mut state = CompactionState::new(false, u64::MAX);
        let (last_ckey, result) = consume_page(
            &mut reader,
            &mut state,
            &store_api::storage::PartitionSlice::full(&new_metadata()),
            builder(),
            u64::MAX,
            u32::MAX,
            100,
            far_deadline(),
        )
        .await
        .unwrap();

        // The stream ended after a partition end.
        assert!(last_ckey.is_none());
        assert_eq!(2, result.row_count());
        assert!(!state.are_limits_reached());
        assert!(state.detach_state().is_none());
    }

    #[tokio::test]
    async fn test_row_limit_stops_mid_partition() {
        let memtable = Memtable::new(0, new_metadata());
        for c in 1..=5 {
            insert_row(&memtable, 1, c, "v", 1);
        }
        let mut reader = reader_over_memtable(&memtable, false);

        let mut state = CompactionState::new(false, u64::MAX);
        let (last_ckey, result) = consume_page(
            &mut reader,
            &mut state,
            &store_api::storage::PartitionSlice::full(&new_metadata()),
            builder(),
            2,
            u32::MAX,
            100,
            far_deadline(),
        )
        .await
        .unwrap();

        assert_eq!(
            Some(ClusteringKey::new([Value::Int32(2)])),
            last_ckey
        );
        assert_eq!(2, result.row_count());
        assert!(state.are_limits_reached());
        // The partition is still open; its header is detachable.
        let detached = state.detach_state().unwrap();
        assert_eq!(
            PartitionKey::new([Value::Int32(1)]).decorate(),
            detached.partition_start.key
        );
    }

    #[tokio::test]
    async fn test_expired_cells_dropped_for_data_queries() {
        let metadata = new_metadata();
        let memtable = Memtable::new(0, metadata.clone());
        let key = PartitionKey::new([Value::Int32(1)]).decorate();
        let mut mutation = Mutation::new(key);
        mutation.rows.push(ClusteringRow::new(
            ClusteringKey::new([Value::Int32(1)]),
            vec![Cell::expiring(3, 1, Value::Text("gone".into()), 10, 50)],
        ));
        mutation.rows.push(ClusteringRow::new(
            ClusteringKey::new([Value::Int32(2)]),
            vec![Cell::live(3, 1, Value::Text("kept".into()))],
        ));
        memtable.apply(mutation);
        let mut reader = reader_over_memtable(&memtable, false);

        let mut state = CompactionState::new(true, u64::MAX);
        // Query time 100 is past the expiry at 60.
        let (_, result) = consume_page(
            &mut reader,
            &mut state,
            &store_api::storage::PartitionSlice::full(&metadata),
            builder(),
            u64::MAX,
            u32::MAX,
            100,
            far_deadline(),
        )
        .await
        .unwrap();

        assert_eq!(1, result.row_count());
        assert_eq!(
            ClusteringKey::new([Value::Int32(2)]),
            result.partitions()[0].rows[0].key
        );
    }

    #[tokio::test]
    async fn test_range_tombstone_shadows_rows() {
        let metadata = new_metadata();
        let memtable = Memtable::new(0, metadata.clone());
        insert_row(&memtable, 1, 1, "a", 1);
        insert_row(&memtable, 1, 3, "dead", 1);
        insert_row(&memtable, 1, 6, "b", 1);
        let key = PartitionKey::new([Value::Int32(1)]).decorate();
        let mut mutation = Mutation::new(key);
        mutation.range_tombstones.push(RangeTombstone::new(
            ClusteringBound::inclusive(ClusteringKey::new([Value::Int32(2)])),
            ClusteringBound::inclusive(ClusteringKey::new([Value::Int32(5)])),
            DeletionTime::new(5, 1),
        ));
        memtable.apply(mutation);
        let mut reader = reader_over_memtable(&memtable, false);

        let mut state = CompactionState::new(true, u64::MAX);
        let (_, result) = consume_page(
            &mut reader,
            &mut state,
            &store_api::storage::PartitionSlice::full(&metadata),
            builder(),
            u64::MAX,
            u32::MAX,
            100,
            far_deadline(),
        )
        .await
        .unwrap();

        let keys: Vec<_> = result.partitions()[0]
            .rows
            .iter()
            .map(|r| r.key.clone())
            .collect();
        assert_eq!(
            vec![
                ClusteringKey::new([Value::Int32(1)]),
                ClusteringKey::new([Value::Int32(6)]),
            ],
            keys
        );
    }

    #[tokio::test]
    async fn test_partition_limit() {
        let memtable = Memtable::new(0, new_metadata());
        for p in 1..=4 {
            insert_row(&memtable, p, 1, "v", 1);
        }
        let mut reader = reader_over_memtable(&memtable, false);

        let mut state = CompactionState::new(false, u64::MAX);
        let (_, result) = consume_page(
            &mut reader,
            &mut state,
            &store_api::storage::PartitionSlice::full(&new_metadata()),
            builder(),
            u64::MAX,
            2,
            100,
            far_deadline(),
        )
        .await
        .unwrap();

        assert_eq!(2, result.partitions().len());
        assert!(state.are_limits_reached());
    }
}
