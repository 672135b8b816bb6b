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

//! Common structs and utilities for reading data.

pub mod compact;
pub mod merge;
pub mod result;
pub mod reverse;

use std::collections::VecDeque;
use std::fmt;
use std::mem;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use store_api::metadata::{ColumnId, TableMetadataRef};
use store_api::storage::{
    ClusteringBound, ClusteringKey, ClusteringRange, DecoratedKey, DeletionTime, PartitionRange,
    PartitionSlice, Value,
};

use crate::error::{Result, TimeoutSnafu};
use crate::semaphore::ReaderPermit;

/// One cell of a row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    /// Id of the column the cell belongs to.
    pub column_id: ColumnId,
    /// Write timestamp of the cell.
    pub timestamp: i64,
    /// Time to live in seconds, if the cell expires.
    pub ttl: Option<u32>,
    /// For live cells with a ttl: the second the cell expires.
    /// For tombstone cells: the second the deletion was issued.
    pub local_deletion_time: u32,
    /// Value of the cell; `None` marks a cell tombstone.
    pub value: Option<Value>,
}

impl Cell {
    /// A live cell without expiry.
    pub fn live(column_id: ColumnId, timestamp: i64, value: Value) -> Cell {
        Cell {
            column_id,
            timestamp,
            ttl: None,
            local_deletion_time: u32::MAX,
            value: Some(value),
        }
    }

    /// A live cell expiring `ttl` seconds after `written_at`.
    pub fn expiring(
        column_id: ColumnId,
        timestamp: i64,
        value: Value,
        ttl: u32,
        written_at: u32,
    ) -> Cell {
        Cell {
            column_id,
            timestamp,
            ttl: Some(ttl),
            local_deletion_time: written_at.saturating_add(ttl),
            value: Some(value),
        }
    }

    /// A cell tombstone issued at `deleted_at`.
    pub fn tombstone(column_id: ColumnId, timestamp: i64, deleted_at: u32) -> Cell {
        Cell {
            column_id,
            timestamp,
            ttl: None,
            local_deletion_time: deleted_at,
            value: None,
        }
    }

    /// Returns whether the cell is a tombstone.
    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }

    /// Returns whether the cell is live at `query_time`, ignoring
    /// covering tombstones.
    pub fn is_live_at(&self, query_time: u32) -> bool {
        if self.is_tombstone() {
            return false;
        }
        match self.ttl {
            Some(_) => self.local_deletion_time > query_time,
            None => true,
        }
    }

    /// Estimated memory used by the cell.
    pub fn estimated_size(&self) -> usize {
        mem::size_of::<Cell>()
            + self
                .value
                .as_ref()
                .map(Value::estimated_size)
                .unwrap_or(0)
    }
}

/// The static row of a partition.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StaticRow {
    pub cells: Vec<Cell>,
}

impl StaticRow {
    pub fn new(cells: Vec<Cell>) -> StaticRow {
        StaticRow { cells }
    }

    pub fn estimated_size(&self) -> usize {
        mem::size_of::<Self>() + self.cells.iter().map(Cell::estimated_size).sum::<usize>()
    }
}

/// A clustering row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusteringRow {
    pub key: ClusteringKey,
    /// Deletion shadowing the whole row.
    pub row_tombstone: DeletionTime,
    pub cells: Vec<Cell>,
}

impl ClusteringRow {
    pub fn new(key: ClusteringKey, cells: Vec<Cell>) -> ClusteringRow {
        ClusteringRow {
            key,
            row_tombstone: DeletionTime::LIVE,
            cells,
        }
    }

    pub fn estimated_size(&self) -> usize {
        self.key.estimated_size() + self.cells.iter().map(Cell::estimated_size).sum::<usize>()
    }
}

/// Start of a partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionStart {
    pub key: DecoratedKey,
    /// Deletion shadowing the whole partition.
    pub deletion: DeletionTime,
}

impl PartitionStart {
    pub fn new(key: DecoratedKey) -> PartitionStart {
        PartitionStart {
            key,
            deletion: DeletionTime::LIVE,
        }
    }

    pub fn estimated_size(&self) -> usize {
        self.key.estimated_size() + mem::size_of::<DeletionTime>()
    }
}

/// A range tombstone: deletes all clustering rows between its bounds.
///
/// In a forward stream `start <= end`; a reversed stream carries the bounds
/// swapped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeTombstone {
    pub start: ClusteringBound,
    pub end: ClusteringBound,
    pub deletion: DeletionTime,
}

impl RangeTombstone {
    pub fn new(
        start: ClusteringBound,
        end: ClusteringBound,
        deletion: DeletionTime,
    ) -> RangeTombstone {
        RangeTombstone {
            start,
            end,
            deletion,
        }
    }

    /// The tombstone with its bounds swapped, as emitted by reversed reads.
    pub fn reversed(mut self) -> RangeTombstone {
        mem::swap(&mut self.start, &mut self.end);
        self
    }

    /// Returns whether `key` falls between the bounds. Accepts both bound
    /// orientations.
    pub fn covers(&self, key: &ClusteringKey) -> bool {
        let (lo, hi) = if self.start.key <= self.end.key {
            (&self.start, &self.end)
        } else {
            (&self.end, &self.start)
        };
        let after_lo = if lo.inclusive {
            key >= &lo.key
        } else {
            key > &lo.key
        };
        let before_hi = if hi.inclusive {
            key <= &hi.key
        } else {
            key < &hi.key
        };
        after_lo && before_hi
    }

    pub fn estimated_size(&self) -> usize {
        self.start.key.estimated_size()
            + self.end.key.estimated_size()
            + mem::size_of::<DeletionTime>()
    }
}

/// Kind of a mutation fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentKind {
    PartitionStart,
    StaticRow,
    ClusteringRow,
    RangeTombstone,
    PartitionEnd,
}

/// An element of a mutation stream.
///
/// A well formed stream is, for each partition: one partition start, at most
/// one static row, clustering rows and range tombstones in clustering order,
/// one partition end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationFragment {
    PartitionStart(PartitionStart),
    StaticRow(StaticRow),
    ClusteringRow(ClusteringRow),
    RangeTombstone(RangeTombstone),
    PartitionEnd,
}

impl MutationFragment {
    pub fn kind(&self) -> FragmentKind {
        match self {
            MutationFragment::PartitionStart(_) => FragmentKind::PartitionStart,
            MutationFragment::StaticRow(_) => FragmentKind::StaticRow,
            MutationFragment::ClusteringRow(_) => FragmentKind::ClusteringRow,
            MutationFragment::RangeTombstone(_) => FragmentKind::RangeTombstone,
            MutationFragment::PartitionEnd => FragmentKind::PartitionEnd,
        }
    }

    pub fn is_partition_start(&self) -> bool {
        matches!(self, MutationFragment::PartitionStart(_))
    }

    pub fn is_partition_end(&self) -> bool {
        matches!(self, MutationFragment::PartitionEnd)
    }

    pub fn as_partition_start(&self) -> Option<&PartitionStart> {
        match self {
            MutationFragment::PartitionStart(ps) => Some(ps),
            _ => None,
        }
    }

    /// Estimated memory used by the fragment.
    pub fn memory_usage(&self) -> usize {
        match self {
            MutationFragment::PartitionStart(ps) => ps.estimated_size(),
            MutationFragment::StaticRow(sr) => sr.estimated_size(),
            MutationFragment::ClusteringRow(cr) => cr.estimated_size(),
            MutationFragment::RangeTombstone(rt) => rt.estimated_size(),
            MutationFragment::PartitionEnd => mem::size_of::<MutationFragment>(),
        }
    }
}

/// A set of changes to one partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mutation {
    pub key: DecoratedKey,
    pub partition_tombstone: DeletionTime,
    pub static_cells: Vec<Cell>,
    pub rows: Vec<ClusteringRow>,
    pub range_tombstones: Vec<RangeTombstone>,
}

impl Mutation {
    pub fn new(key: DecoratedKey) -> Mutation {
        Mutation {
            key,
            partition_tombstone: DeletionTime::LIVE,
            static_cells: Vec::new(),
            rows: Vec::new(),
            range_tombstones: Vec::new(),
        }
    }

    /// Folds `other` into this mutation. Both must target the same
    /// partition.
    pub fn apply(&mut self, other: Mutation) {
        debug_assert_eq!(self.key, other.key);
        self.partition_tombstone = self.partition_tombstone.merge(other.partition_tombstone);
        self.static_cells.extend(other.static_cells);
        self.rows.extend(other.rows);
        self.range_tombstones.extend(other.range_tombstones);
    }
}

/// Whether the consumer may fast forward inside a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionForwarding {
    No,
    Yes,
}

/// Whether the consumer may fast forward to another partition range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeForwarding {
    No,
    Yes,
}

/// Target of a fast forward call.
#[derive(Debug, Clone)]
pub enum FastForwardTo {
    /// A clustering range inside the current partition. Requires
    /// [PartitionForwarding::Yes].
    Clustering(ClusteringRange),
    /// A new partition range. Requires [RangeForwarding::Yes].
    Partitions(PartitionRange),
}

/// Lightweight tracing context threaded through the read path.
#[derive(Clone)]
pub struct TraceState {
    label: Arc<str>,
}

impl TraceState {
    pub fn new(label: impl Into<Arc<str>>) -> TraceState {
        TraceState {
            label: label.into(),
        }
    }

    /// Records a trace message.
    pub fn trace(&self, message: &str) {
        common_telemetry::debug!("[{}] {}", self.label, message);
    }
}

impl fmt::Debug for TraceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TraceState").field("label", &self.label).finish()
    }
}

/// Implementation side of a [FragmentReader]: produces batches of fragments.
#[async_trait]
pub trait FragmentSource: Send {
    /// Metadata of the table the source reads.
    fn metadata(&self) -> &TableMetadataRef;

    /// Fills `buffer` with at least one fragment unless the stream ended.
    /// Returns true when the stream ended.
    async fn fill_buffer(&mut self, buffer: &mut VecDeque<MutationFragment>) -> Result<bool>;

    /// Skips the rest of the current partition.
    async fn next_partition(&mut self) -> Result<()>;

    /// Fast forwards the source. Positions already emitted are never
    /// produced again.
    async fn fast_forward_to(&mut self, target: FastForwardTo) -> Result<()>;
}

/// A lazy, buffer owning reader of mutation fragments.
pub struct FragmentReader {
    metadata: TableMetadataRef,
    permit: ReaderPermit,
    source: Box<dyn FragmentSource>,
    buffer: VecDeque<MutationFragment>,
    end_of_stream: bool,
    pending_next_partition: bool,
}

impl fmt::Debug for FragmentReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FragmentReader")
            .field("buffered", &self.buffer.len())
            .field("end_of_stream", &self.end_of_stream)
            .finish()
    }
}

impl FragmentReader {
    /// Creates a reader over `source`.
    pub fn new(
        metadata: TableMetadataRef,
        permit: ReaderPermit,
        source: Box<dyn FragmentSource>,
    ) -> FragmentReader {
        FragmentReader {
            metadata,
            permit,
            source,
            buffer: VecDeque::new(),
            end_of_stream: false,
            pending_next_partition: false,
        }
    }

    /// Metadata of the table the reader reads.
    pub fn metadata(&self) -> &TableMetadataRef {
        &self.metadata
    }

    /// Permit backing the reader.
    pub fn permit(&self) -> &ReaderPermit {
        &self.permit
    }

    /// Peeks the next fragment without consuming it.
    pub async fn peek(&mut self, deadline: Instant) -> Result<Option<&MutationFragment>> {
        self.ensure_buffer(deadline).await?;
        Ok(self.buffer.front())
    }

    /// Returns the next fragment, or `None` at end of stream.
    pub async fn next_fragment(&mut self, deadline: Instant) -> Result<Option<MutationFragment>> {
        self.ensure_buffer(deadline).await?;
        Ok(self.buffer.pop_front())
    }

    /// Feeds fragments into `consumer` until it asks to stop or the
    /// stream ends.
    pub async fn consume<F>(&mut self, mut consumer: F, deadline: Instant) -> Result<()>
    where
        F: FnMut(MutationFragment) -> compact::StopIteration + Send,
    {
        while let Some(fragment) = self.next_fragment(deadline).await? {
            if consumer(fragment) == compact::StopIteration::Yes {
                break;
            }
        }
        Ok(())
    }

    /// Pushes a fragment back to the front of the buffer; it is returned
    /// again by the next `next_fragment` call.
    pub fn unpop_fragment(&mut self, fragment: MutationFragment) {
        self.buffer.push_front(fragment);
    }

    /// Detaches and returns the reader's buffer.
    pub fn detach_buffer(&mut self) -> VecDeque<MutationFragment> {
        mem::take(&mut self.buffer)
    }

    /// Estimated bytes buffered by the reader.
    pub fn buffer_size(&self) -> usize {
        self.buffer.iter().map(MutationFragment::memory_usage).sum()
    }

    /// Number of fragments buffered by the reader.
    pub fn buffer_len(&self) -> usize {
        self.buffer.len()
    }

    /// Returns whether a `next_partition` call has not reached the source
    /// yet.
    pub fn has_pending_next_partition(&self) -> bool {
        self.pending_next_partition
    }

    /// Skips the rest of the current partition.
    ///
    /// Buffered fragments of the current partition are dropped; if the
    /// partition end is not buffered yet, the skip is deferred to the
    /// source before the next fill.
    pub fn next_partition(&mut self) {
        if let Some(end) = self.buffer.iter().position(MutationFragment::is_partition_end) {
            self.buffer.drain(..=end);
        } else {
            self.buffer.clear();
            if !self.end_of_stream {
                self.pending_next_partition = true;
            }
        }
    }

    /// Fast forwards the reader, clearing its buffer.
    pub async fn fast_forward_to(&mut self, target: FastForwardTo) -> Result<()> {
        self.buffer.clear();
        self.pending_next_partition = false;
        self.end_of_stream = false;
        self.source.fast_forward_to(target).await
    }

    async fn ensure_buffer(&mut self, deadline: Instant) -> Result<()> {
        if self.pending_next_partition {
            self.pending_next_partition = false;
            self.source.next_partition().await?;
        }
        while self.buffer.is_empty() && !self.end_of_stream {
            if Instant::now() >= deadline {
                return TimeoutSnafu {
                    operation: "fill reader buffer",
                }
                .fail();
            }
            self.end_of_stream = self.source.fill_buffer(&mut self.buffer).await?;
        }
        Ok(())
    }
}

/// A factory of readers over some underlying data: a memtable, a set of
/// SSTables, or the combined remote shards of a multishard read.
pub trait MutationSource: Send + Sync {
    /// Creates a reader over `range` restricted to `slice`.
    ///
    /// The returned reader is lazy: I/O happens when it is first polled.
    fn make_reader(
        &self,
        metadata: TableMetadataRef,
        permit: ReaderPermit,
        range: &PartitionRange,
        slice: &PartitionSlice,
        trace: Option<&TraceState>,
        partition_fwd: PartitionForwarding,
        range_fwd: RangeForwarding,
    ) -> Result<FragmentReader>;
}

pub type MutationSourceRef = Arc<dyn MutationSource>;

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use store_api::storage::PartitionKey;

    use super::*;
    use crate::test_util::{collect_fragments, new_metadata, row_fragment, VecSource};

    fn partition(p: i32, rows: &[i32]) -> Vec<MutationFragment> {
        let key = PartitionKey::new([Value::Int32(p)]).decorate();
        let mut fragments = vec![MutationFragment::PartitionStart(PartitionStart::new(key))];
        for c in rows {
            fragments.push(row_fragment(*c, "x"));
        }
        fragments.push(MutationFragment::PartitionEnd);
        fragments
    }

    fn far_deadline() -> Instant {
        Instant::now() + Duration::from_secs(60)
    }

    fn reader_of(fragments: Vec<MutationFragment>) -> FragmentReader {
        FragmentReader::new(
            new_metadata(),
            ReaderPermit::untracked(),
            Box::new(VecSource::new(fragments)),
        )
    }

    #[tokio::test]
    async fn test_peek_and_next() {
        let mut reader = reader_of(partition(1, &[1, 2]));
        let deadline = far_deadline();

        assert!(reader.peek(deadline).await.unwrap().unwrap().is_partition_start());
        // Peeking does not consume.
        assert!(reader.peek(deadline).await.unwrap().unwrap().is_partition_start());

        let fragments = collect_fragments(&mut reader, deadline).await;
        assert_eq!(4, fragments.len());
        assert!(reader.next_fragment(deadline).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unpop_round_trip() {
        let mut reader = reader_of(partition(1, &[1]));
        let deadline = far_deadline();

        let first = reader.next_fragment(deadline).await.unwrap().unwrap();
        reader.unpop_fragment(first.clone());
        let again = reader.next_fragment(deadline).await.unwrap().unwrap();
        assert_eq!(first, again);
    }

    #[tokio::test]
    async fn test_next_partition_drops_buffered() {
        let mut fragments = partition(1, &[1, 2]);
        fragments.extend(partition(2, &[3]));
        let mut reader = reader_of(fragments);
        let deadline = far_deadline();

        // Buffer everything, then skip the first partition.
        reader.peek(deadline).await.unwrap();
        reader.next_partition();
        let rest = collect_fragments(&mut reader, deadline).await;
        let MutationFragment::PartitionStart(ps) = &rest[0] else {
            panic!("expected partition start, got {:?}", rest[0]);
        };
        assert_eq!(
            PartitionKey::new([Value::Int32(2)]).decorate(),
            ps.key
        );
    }

    #[tokio::test]
    async fn test_next_partition_defers_to_source() {
        let mut reader = reader_of(partition(1, &[1]));
        reader.next_partition();
        assert!(reader.has_pending_next_partition());
        let deadline = far_deadline();
        assert!(reader.next_fragment(deadline).await.unwrap().is_none());
        assert!(!reader.has_pending_next_partition());
    }

    #[tokio::test]
    async fn test_deadline_expired() {
        let mut reader = reader_of(partition(1, &[1]));
        let err = reader
            .next_fragment(Instant::now() - Duration::from_millis(1))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[test]
    fn test_range_tombstone_covers() {
        let rt = RangeTombstone::new(
            ClusteringBound::inclusive(ClusteringKey::new([Value::Int32(2)])),
            ClusteringBound::inclusive(ClusteringKey::new([Value::Int32(5)])),
            DeletionTime::new(10, 1),
        );
        assert!(rt.covers(&ClusteringKey::new([Value::Int32(3)])));
        assert!(!rt.covers(&ClusteringKey::new([Value::Int32(6)])));
        // Bounds swapped by a reversed read still cover the same keys.
        let reversed = rt.reversed();
        assert!(reversed.covers(&ClusteringKey::new([Value::Int32(3)])));
    }
}
