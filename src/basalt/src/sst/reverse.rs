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

//! Data source that reads one partition's bytes as if its rows had been
//! written in reverse clustering order.
//!
//! The source first emits the partition header (and static row) unchanged,
//! then walks the unfiltereds backwards using their `prev_length` back
//! pointers, starting from the last unfiltered located through the
//! promoted index. Range tombstone markers get their kind byte rewritten
//! to the reverse kind and, for boundaries, their two deletion time pairs
//! swapped in place. A final synthetic one-byte buffer carries the
//! end-of-partition flag so downstream parsers remain unchanged.
//!
//! Skipping is expressed only through the index reader's end cursor: when
//! it drops below the current row, the walk restarts from the new end.
//! Reads go through a cache that grows geometrically and is positioned so
//! the next unfiltered to emit sits at its tail; emitted rows are trimmed
//! off the tail.

use bytes::Bytes;
use store_api::metadata::TableMetadataRef;

use crate::access::AccessLayerRef;
use crate::error::{MalformedSsTableSnafu, Result};
use crate::sst::format::{reverse_bound_kind, FLAG_END_OF_PARTITION};
use crate::sst::index::{IndexReader, PartitionIndexEntry};
use crate::sst::parse::{
    PartitionHeaderParser, ReadStatus, TombstoneReversingInfo, UnfilteredSkipParser,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReverseState {
    /// Looking for the last unfiltered of the clustering range being read.
    RangeEnd,
    /// Returning one unfiltered per call, backwards.
    Rows,
    /// Returning the end-of-partition flag.
    PartitionEnd,
    /// Nothing more to return.
    Finished,
}

/// The reversing byte source over one partition.
pub struct PartitionReversingSource {
    access: AccessLayerRef,
    path: String,
    metadata: TableMetadataRef,
    index: IndexReader,
    partition_start: u64,
    partition_end: u64,
    clustering_range_start: u64,
    /// Start of the unfiltered to emit next; never lands inside a row.
    row_start: u64,
    /// End of the unfiltered to emit next.
    row_end: u64,
    cached: Vec<u8>,
    current_read_size: u64,
    max_read_size: u64,
    header_done: bool,
    state: ReverseState,
}

impl PartitionReversingSource {
    pub fn new(
        access: AccessLayerRef,
        path: impl Into<String>,
        metadata: TableMetadataRef,
        entry: PartitionIndexEntry,
        initial_read_size: u64,
        max_read_size: u64,
    ) -> PartitionReversingSource {
        let partition_start = entry.offset;
        let partition_end = entry.offset + entry.len;
        PartitionReversingSource {
            access,
            path: path.into(),
            metadata,
            index: IndexReader::new(entry),
            partition_start,
            partition_end,
            clustering_range_start: partition_start,
            row_start: partition_end,
            row_end: partition_end,
            cached: Vec::new(),
            current_read_size: initial_read_size.max(1),
            max_read_size: max_read_size.max(initial_read_size),
            header_done: false,
            state: ReverseState::RangeEnd,
        }
    }

    /// The index reader steering this source.
    pub fn index_mut(&mut self) -> &mut IndexReader {
        &mut self.index
    }

    /// Current position of the source in the data file: the partition end
    /// or the start of some unfiltered. Can only decrease.
    pub fn current_position(&self) -> u64 {
        self.row_start
    }

    /// Returns the next buffer of the reversed stream; an empty buffer
    /// marks the end.
    pub async fn get(&mut self) -> Result<Bytes> {
        if !self.header_done {
            return self.read_header().await;
        }

        // The index may have reduced its end below the current row; snap
        // to the new end and look for its last row again.
        if let Some(end) = self.index.data_end() {
            if end < self.row_start {
                self.row_start = end;
                let cache_len = self.cached.len() as u64;
                if cache_len + end >= self.row_end {
                    // The cache tail past the new end is no longer needed.
                    self.cached
                        .truncate((cache_len - (self.row_end - end)) as usize);
                } else {
                    self.cached.clear();
                }
                self.state = ReverseState::RangeEnd;
            }
        }

        loop {
            match self.state {
                ReverseState::RangeEnd => {
                    if let Some(buffer) = self.find_range_end().await? {
                        return Ok(buffer);
                    }
                    self.state = ReverseState::Rows;
                }
                ReverseState::Rows => return self.next_row().await,
                ReverseState::PartitionEnd => {
                    self.state = ReverseState::Finished;
                    return Ok(end_of_partition());
                }
                ReverseState::Finished => return Ok(Bytes::new()),
            }
        }
    }

    async fn read_header(&mut self) -> Result<Bytes> {
        let mut parser = PartitionHeaderParser::new(self.partition_start);
        let mut feeder = ChunkFeeder::new(self.partition_start, self.partition_end);
        loop {
            let chunk = feeder
                .next_chunk(&self.access, &self.path, self.current_read_size)
                .await?
                .ok_or_else(|| self.malformed("truncated partition header"))?;
            let mut input = &chunk[..];
            if parser.process(&mut input)? == ReadStatus::Ready {
                break;
            }
        }
        self.clustering_range_start = parser.header_end_pos();
        self.header_done = true;
        self.access
            .read_range(&self.path, self.partition_start, self.clustering_range_start)
            .await
    }

    /// Finds the last unfiltered of the current range. Returns the final
    /// buffer directly when the range turns out to be empty.
    async fn find_range_end(&mut self) -> Result<Option<Bytes>> {
        let mut look_in_last_block = false;
        if self.row_start >= self.row_end {
            debug_assert_eq!(self.row_start, self.row_end);
            look_in_last_block = true;
        } else {
            // The unfiltered at `row_start` is the first one beyond the
            // range; its back pointer locates the last one inside it.
            let mut parser = self.skip_parser(self.row_start);
            self.drive_parser(&mut parser, self.row_end).await?;
            if parser.end_of_partition() {
                look_in_last_block = true;
            } else {
                self.row_end = self.row_start;
                self.row_start -= parser.prev_len();
            }
        }

        if look_in_last_block {
            self.cached.clear();
            self.row_start = self
                .index
                .last_block_offset()
                .unwrap_or(self.clustering_range_start);
            let mut last_row_start = self.row_start;
            let mut parser = self.skip_parser(self.row_start);
            self.drive_parser(&mut parser, self.partition_end).await?;
            while !parser.end_of_partition() {
                last_row_start = self.row_start;
                self.row_start = parser.position();
                parser.reset();
                self.drive_parser(&mut parser, self.partition_end).await?;
            }
            self.row_end = self.row_start;
            self.row_start = last_row_start;
            if self.row_start == self.row_end {
                // Empty partition.
                self.state = ReverseState::Finished;
                return Ok(Some(end_of_partition()));
            }
        }

        if self.row_start < self.clustering_range_start {
            // The first index block starts after the range being read,
            // i.e. the range being read is empty.
            self.row_start = self.clustering_range_start;
            self.state = ReverseState::Finished;
            return Ok(Some(end_of_partition()));
        }

        Ok(None)
    }

    /// Emits the unfiltered at `[row_start, row_end)` and steps back.
    async fn next_row(&mut self) -> Result<Bytes> {
        let row_size = self.row_end - self.row_start;
        if (self.cached.len() as u64) < row_size {
            let start = if self.clustering_range_start + self.current_read_size < self.row_end {
                (self.row_end - self.current_read_size).min(self.row_end - row_size)
            } else {
                self.clustering_range_start
            };
            self.cached = self
                .access
                .read_range(&self.path, start, self.row_end)
                .await?
                .to_vec();
            self.current_read_size = (self.current_read_size * 2).min(self.max_read_size);
        }

        let tail_start = self.cached.len() - row_size as usize;
        let mut parser = self.skip_parser(self.row_start);
        let mut input = &self.cached[tail_start..];
        if parser.process(&mut input)? != ReadStatus::Ready {
            return Err(self.malformed("truncated unfiltered"));
        }
        if let Some(info) = parser.tombstone_info().cloned() {
            self.reverse_cached_tombstone(&info);
        }

        let buffer = Bytes::copy_from_slice(&self.cached[tail_start..]);
        self.cached.truncate(tail_start);
        let prev_len = parser.prev_len();
        if prev_len > self.row_start - self.partition_start {
            return Err(self.malformed("back pointer runs before the partition"));
        }
        self.row_end = self.row_start;
        self.row_start -= prev_len;
        if self.row_end == self.clustering_range_start {
            self.state = ReverseState::PartitionEnd;
        }
        Ok(buffer)
    }

    /// Rewrites the cached marker bytes for reverse order: the kind byte
    /// becomes its reverse and boundary markers get their two deletion
    /// time pairs swapped.
    fn reverse_cached_tombstone(&mut self, info: &TombstoneReversingInfo) {
        let cache_len = self.cached.len();
        let to_cache = |file_offset: u64| cache_len - (self.row_end - file_offset) as usize;

        let kind_index = to_cache(info.kind_offset);
        self.cached[kind_index] = reverse_bound_kind(info.kind) as u8;

        if info.kind.is_boundary() {
            let first_start = to_cache(info.first_deletion_time_offset);
            let first_end = to_cache(info.after_first_deletion_time_offset);
            // The second pair runs to the end of the marker. The pairs are
            // varints of possibly different lengths, so copy both aside
            // before overwriting.
            let first = self.cached[first_start..first_end].to_vec();
            let second = self.cached[first_end..].to_vec();
            self.cached[first_start..first_start + second.len()].copy_from_slice(&second);
            self.cached[first_start + second.len()..].copy_from_slice(&first);
        }
    }

    fn skip_parser(&self, start: u64) -> UnfilteredSkipParser {
        UnfilteredSkipParser::new(start, self.metadata.clustering_key_len(), &self.path)
    }

    /// Streams chunks into `parser` until it completes one unfiltered.
    async fn drive_parser(&self, parser: &mut UnfilteredSkipParser, end: u64) -> Result<()> {
        let mut feeder = ChunkFeeder::new(parser.position(), end);
        loop {
            let chunk = feeder
                .next_chunk(&self.access, &self.path, self.current_read_size)
                .await?
                .ok_or_else(|| self.malformed("truncated unfiltered"))?;
            let mut input = &chunk[..];
            // Waiting implies the chunk was fully consumed.
            if parser.process(&mut input)? == ReadStatus::Ready {
                return Ok(());
            }
        }
    }

    fn malformed(&self, reason: impl Into<String>) -> crate::error::Error {
        MalformedSsTableSnafu {
            path: self.path.clone(),
            reason: reason.into(),
        }
        .build()
    }
}

/// Sequential chunk reads over a byte range.
struct ChunkFeeder {
    pos: u64,
    end: u64,
}

impl ChunkFeeder {
    fn new(pos: u64, end: u64) -> ChunkFeeder {
        ChunkFeeder { pos, end }
    }

    async fn next_chunk(
        &mut self,
        access: &AccessLayerRef,
        path: &str,
        chunk_size: u64,
    ) -> Result<Option<Bytes>> {
        if self.pos >= self.end {
            return Ok(None);
        }
        let end = (self.pos + chunk_size.max(1)).min(self.end);
        let chunk = access.read_range(path, self.pos, end).await?;
        self.pos = end;
        Ok(Some(chunk))
    }
}

/// A one-byte buffer holding the end-of-partition flag.
fn end_of_partition() -> Bytes {
    Bytes::from_static(&[FLAG_END_OF_PARTITION])
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use store_api::storage::{ClusteringBound, ClusteringKey, DeletionTime, Value};

    use super::*;
    use crate::access::AccessLayer;
    use crate::read::{Mutation, RangeTombstone};
    use crate::sst::format::{BoundKind, UnfilteredFlags};
    use crate::sst::reader::{Cursor, PartitionDecoder, Unfiltered};
    use crate::sst::writer::SsTableWriter;
    use crate::test_util::{new_metadata, new_row_mutation};

    async fn reversed_unfiltereds(
        source: &mut PartitionReversingSource,
        metadata: &TableMetadataRef,
    ) -> Vec<Unfiltered> {
        let decoder = PartitionDecoder::new(metadata.clone());

        // Header buffer first.
        let header = source.get().await.unwrap();
        let mut cursor = Cursor::new(&header, "sst");
        decoder.decode_header(&mut cursor).unwrap();
        assert!(cursor.is_empty());

        let mut out = Vec::new();
        loop {
            let buffer = source.get().await.unwrap();
            if buffer.is_empty() {
                break;
            }
            let mut cursor = Cursor::new(&buffer, "sst");
            let unfiltered = decoder.decode_unfiltered(&mut cursor).unwrap();
            let end = matches!(unfiltered, Unfiltered::EndOfPartition);
            out.push(unfiltered);
            if end {
                assert!(source.get().await.unwrap().is_empty());
                break;
            }
        }
        out
    }

    fn source_for(
        access: &Arc<AccessLayer>,
        sst: &crate::sst::file::SsTableRef,
        initial_read: u64,
    ) -> PartitionReversingSource {
        PartitionReversingSource::new(
            access.clone(),
            sst.data_path.clone(),
            sst.metadata.clone(),
            sst.index.entries[0].clone(),
            initial_read,
            128 * 1024,
        )
    }

    fn ck(v: i32) -> ClusteringKey {
        ClusteringKey::new([Value::Int32(v)])
    }

    #[tokio::test]
    async fn test_reverse_rows() {
        let metadata = new_metadata();
        let access = Arc::new(AccessLayer::memory());
        let writer =
            SsTableWriter::new(metadata.clone(), access.clone()).with_promoted_block_rows(2);
        let sst = writer
            .write(&[new_row_mutation(1, &[(1, "a"), (2, "b"), (3, "c")])])
            .await
            .unwrap();

        // Tiny initial reads force the cache to refill and grow.
        for initial_read in [1, 4, 4096] {
            let mut source = source_for(&access, &sst, initial_read);
            let unfiltereds = reversed_unfiltereds(&mut source, &metadata).await;
            let keys: Vec<_> = unfiltereds
                .iter()
                .filter_map(|u| match u {
                    Unfiltered::Row(row) => Some(row.key.clone()),
                    _ => None,
                })
                .collect();
            assert_eq!(vec![ck(3), ck(2), ck(1)], keys, "read size {initial_read}");
            assert!(matches!(
                unfiltereds.last().unwrap(),
                Unfiltered::EndOfPartition
            ));
        }
    }

    #[tokio::test]
    async fn test_reverse_swaps_marker_kinds() {
        let metadata = new_metadata();
        let access = Arc::new(AccessLayer::memory());
        let writer = SsTableWriter::new(metadata.clone(), access.clone());

        let mut mutation = new_row_mutation(1, &[(1, "a"), (6, "b")]);
        mutation.range_tombstones.push(RangeTombstone::new(
            ClusteringBound::inclusive(ck(2)),
            ClusteringBound::inclusive(ck(5)),
            DeletionTime::new(10, 1),
        ));
        let sst = writer.write(&[mutation]).await.unwrap();

        let mut source = source_for(&access, &sst, 4096);
        let unfiltereds = reversed_unfiltereds(&mut source, &metadata).await;

        // row(6), incl_start(5), incl_end(2), row(1), end.
        let kinds: Vec<_> = unfiltereds
            .iter()
            .filter_map(|u| match u {
                Unfiltered::Marker(m) => Some((m.key.clone(), m.kind)),
                _ => None,
            })
            .collect();
        assert_eq!(
            vec![(ck(5), BoundKind::InclStart), (ck(2), BoundKind::InclEnd)],
            kinds
        );
        let Unfiltered::Row(first) = &unfiltereds[0] else {
            panic!("expected row first");
        };
        assert_eq!(ck(6), first.key);
    }

    #[tokio::test]
    async fn test_reverse_swaps_boundary_pairs() {
        let metadata = new_metadata();
        let access = Arc::new(AccessLayer::memory());
        let writer = SsTableWriter::new(metadata.clone(), access.clone());

        let mut mutation = Mutation::new(
            store_api::storage::PartitionKey::new([Value::Int32(1)]).decorate(),
        );
        // Two adjacent deletions form a boundary marker at 4.
        mutation.range_tombstones.push(RangeTombstone::new(
            ClusteringBound::inclusive(ck(1)),
            ClusteringBound::exclusive(ck(4)),
            DeletionTime::new(10, 1),
        ));
        mutation.range_tombstones.push(RangeTombstone::new(
            ClusteringBound::inclusive(ck(4)),
            ClusteringBound::inclusive(ck(8)),
            DeletionTime::new(20, 2),
        ));
        let sst = writer.write(&[mutation]).await.unwrap();

        let mut source = source_for(&access, &sst, 4096);
        let unfiltereds = reversed_unfiltereds(&mut source, &metadata).await;

        let markers: Vec<_> = unfiltereds
            .iter()
            .filter_map(|u| match u {
                Unfiltered::Marker(m) => Some(m.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(3, markers.len());
        // Reversed: incl_start(8), boundary at 4 with kinds and pairs
        // swapped, incl_end(1).
        assert_eq!(BoundKind::InclStart, markers[0].kind);
        assert_eq!(ck(8), markers[0].key);
        assert_eq!(BoundKind::InclEndExclStart, markers[1].kind);
        assert_eq!(DeletionTime::new(20, 2), markers[1].first);
        assert_eq!(Some(DeletionTime::new(10, 1)), markers[1].second);
        assert_eq!(BoundKind::InclEnd, markers[2].kind);
        assert_eq!(ck(1), markers[2].key);
    }

    #[tokio::test]
    async fn test_reverse_empty_partition() {
        let metadata = new_metadata();
        let access = Arc::new(AccessLayer::memory());
        let writer = SsTableWriter::new(metadata.clone(), access.clone());
        let sst = writer.write(&[new_row_mutation(1, &[])]).await.unwrap();

        let mut source = source_for(&access, &sst, 4096);
        let header = source.get().await.unwrap();
        assert!(!header.is_empty());
        let flag = source.get().await.unwrap();
        assert_eq!(1, flag.len());
        assert!(UnfilteredFlags(flag[0]).is_end_of_partition());
        assert!(source.get().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_index_end_cursor_skips_tail() {
        let metadata = new_metadata();
        let access = Arc::new(AccessLayer::memory());
        let writer =
            SsTableWriter::new(metadata.clone(), access.clone()).with_promoted_block_rows(2);
        let sst = writer
            .write(&[new_row_mutation(
                1,
                &[(1, "a"), (2, "b"), (3, "c"), (4, "d"), (5, "e"), (6, "f")],
            )])
            .await
            .unwrap();

        let mut source = source_for(&access, &sst, 4096);
        // Skip rows beyond 3 before the first read.
        source.index_mut().advance_upper_bound(&ck(3));

        let unfiltereds = reversed_unfiltereds(&mut source, &metadata).await;
        let keys: Vec<_> = unfiltereds
            .iter()
            .filter_map(|u| match u {
                Unfiltered::Row(row) => Some(row.key.clone()),
                _ => None,
            })
            .collect();
        // Block granularity two: rows 5 and 6 are cut, 4 survives the
        // block boundary and 3, 2, 1 follow.
        assert_eq!(vec![ck(4), ck(3), ck(2), ck(1)], keys);
    }
}
