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

//! SSTable writer.
//!
//! Within a partition the layout is: a header (key length, key, partition
//! deletion time), an optional static row, a sequence of unfiltereds in
//! clustering order each carrying a `prev_length` back-pointer, and a
//! terminal end-of-partition flag byte.

use std::cmp::Ordering;
use std::sync::Arc;

use store_api::metadata::TableMetadataRef;
use store_api::storage::{ClusteringKey, DeletionTime};

use crate::access::AccessLayerRef;
use crate::error::Result;
use crate::read::{Cell, ClusteringRow, Mutation, RangeTombstone};
use crate::sst::file::{FileId, SsTable, SsTableRef};
use crate::sst::format::{
    encode_vint, vint_size, BoundKind, EXT_FLAG_IS_STATIC, FLAG_END_OF_PARTITION,
    FLAG_HAS_EXTENDED_FLAGS, FLAG_IS_RANGE_TOMBSTONE,
};
use crate::sst::index::{PartitionIndexEntry, PromotedBlock, SsTableIndex};

/// Default number of unfiltereds per promoted index block.
const DEFAULT_PROMOTED_BLOCK_ROWS: usize = 8;

/// Writes partitions into a new SSTable data file and builds its index.
pub struct SsTableWriter {
    metadata: TableMetadataRef,
    access: AccessLayerRef,
    promoted_block_rows: usize,
}

impl SsTableWriter {
    pub fn new(metadata: TableMetadataRef, access: AccessLayerRef) -> SsTableWriter {
        SsTableWriter {
            metadata,
            access,
            promoted_block_rows: DEFAULT_PROMOTED_BLOCK_ROWS,
        }
    }

    /// Sets the promoted index granularity.
    pub fn with_promoted_block_rows(mut self, rows: usize) -> SsTableWriter {
        self.promoted_block_rows = rows.max(1);
        self
    }

    /// Writes one mutation per partition. Partitions are sorted into token
    /// order; rows inside each mutation are sorted into clustering order.
    pub async fn write(&self, mutations: &[Mutation]) -> Result<SsTableRef> {
        let mut mutations: Vec<_> = mutations.to_vec();
        mutations.sort_by(|a, b| a.key.cmp(&b.key));

        let mut data = Vec::new();
        let mut entries = Vec::with_capacity(mutations.len());
        for mutation in &mutations {
            let offset = data.len() as u64;
            let promoted = self.encode_partition(mutation, &mut data);
            entries.push(PartitionIndexEntry {
                key: mutation.key.clone(),
                offset,
                len: data.len() as u64 - offset,
                promoted,
            });
        }

        let file_id = FileId::random();
        let data_path = SsTable::data_file_path(file_id);
        let file_size = data.len() as u64;
        self.access.write(&data_path, data).await?;

        Ok(Arc::new(SsTable {
            file_id,
            data_path,
            metadata: self.metadata.clone(),
            index: SsTableIndex { entries },
            file_size,
        }))
    }

    /// Encodes one partition, returning its promoted index blocks.
    fn encode_partition(&self, mutation: &Mutation, out: &mut Vec<u8>) -> Vec<PromotedBlock> {
        let partition_offset = out.len() as u64;

        // Header: key length, key, partition deletion time.
        let key_bytes = mutation.key.key.to_bytes();
        out.extend_from_slice(&(key_bytes.len() as u16).to_be_bytes());
        out.extend_from_slice(&key_bytes);
        out.extend_from_slice(&mutation.partition_tombstone.local_deletion_time.to_be_bytes());
        out.extend_from_slice(
            &(mutation.partition_tombstone.marked_for_delete_at as u64).to_be_bytes(),
        );

        // Static row.
        if !mutation.static_cells.is_empty() {
            out.push(FLAG_HAS_EXTENDED_FLAGS);
            out.push(EXT_FLAG_IS_STATIC);
            let body = encode_row_body(None, &mutation.static_cells);
            encode_vint(body.len() as u64, out);
            out.extend_from_slice(&body);
        }

        let clustering_range_start = out.len() as u64;

        // Interleave rows and range tombstone markers in clustering order.
        let mut rows: Vec<_> = mutation.rows.iter().collect();
        rows.sort_by(|a, b| a.key.cmp(&b.key));
        let items = interleave(rows, &mutation.range_tombstones);

        let mut promoted = Vec::new();
        // The back-pointer of the first unfiltered spans the header and the
        // static row, so stepping back from it lands at the partition start.
        let mut prev_len = clustering_range_start - partition_offset;
        for (index, item) in items.iter().enumerate() {
            if index % self.promoted_block_rows == 0 {
                promoted.push(PromotedBlock {
                    offset: out.len() as u64,
                    first_key: item.key().clone(),
                });
            }
            let unfiltered = encode_unfiltered(item, prev_len);
            prev_len = unfiltered.len() as u64;
            out.extend_from_slice(&unfiltered);
        }

        out.push(FLAG_END_OF_PARTITION);
        promoted
    }
}

/// One unfiltered to serialize.
enum WriteItem<'a> {
    Row(&'a ClusteringRow),
    Marker {
        key: ClusteringKey,
        kind: BoundKind,
        /// Deletion pair of the marker; for boundaries the closing pair.
        first: DeletionTime,
        /// Opening pair of a boundary marker.
        second: Option<DeletionTime>,
    },
}

impl WriteItem<'_> {
    fn key(&self) -> &ClusteringKey {
        match self {
            WriteItem::Row(row) => &row.key,
            WriteItem::Marker { key, .. } => key,
        }
    }
}

/// A marker event before boundary merging.
struct MarkerEvent {
    key: ClusteringKey,
    /// Position relative to a row with the same key: -1 before, 1 after.
    weight: i8,
    is_start: bool,
    inclusive: bool,
    deletion: DeletionTime,
}

impl MarkerEvent {
    fn kind(&self) -> BoundKind {
        match (self.is_start, self.inclusive) {
            (true, true) => BoundKind::InclStart,
            (true, false) => BoundKind::ExclStart,
            (false, true) => BoundKind::InclEnd,
            (false, false) => BoundKind::ExclEnd,
        }
    }
}

/// Sorts rows and tombstone bounds into clustering order and merges
/// adjacent end/start markers into boundary markers.
fn interleave<'a>(
    rows: Vec<&'a ClusteringRow>,
    tombstones: &[RangeTombstone],
) -> Vec<WriteItem<'a>> {
    let mut events = Vec::with_capacity(tombstones.len() * 2);
    for rt in tombstones {
        events.push(MarkerEvent {
            key: rt.start.key.clone(),
            weight: if rt.start.inclusive { -1 } else { 1 },
            is_start: true,
            inclusive: rt.start.inclusive,
            deletion: rt.deletion,
        });
        events.push(MarkerEvent {
            key: rt.end.key.clone(),
            weight: if rt.end.inclusive { 1 } else { -1 },
            is_start: false,
            inclusive: rt.end.inclusive,
            deletion: rt.deletion,
        });
    }
    // Ends sort before starts at equal positions so boundary pairs come out
    // adjacent and in closing-then-opening order.
    events.sort_by(|a, b| {
        a.key
            .cmp(&b.key)
            .then_with(|| a.weight.cmp(&b.weight))
            .then_with(|| a.is_start.cmp(&b.is_start))
    });

    let mut items: Vec<WriteItem<'a>> = Vec::with_capacity(rows.len() + events.len());
    let mut rows = rows.into_iter().peekable();
    let mut events = events.into_iter().peekable();
    loop {
        let take_event = match (rows.peek(), events.peek()) {
            (None, None) => break,
            (None, Some(_)) => true,
            (Some(_), None) => false,
            (Some(row), Some(event)) => match event.key.cmp(&row.key) {
                Ordering::Less => true,
                Ordering::Greater => false,
                Ordering::Equal => event.weight < 0,
            },
        };
        if !take_event {
            items.push(WriteItem::Row(rows.next().unwrap()));
            continue;
        }

        let event = events.next().unwrap();
        // An end marker directly followed by a start marker at the same
        // position forms a boundary.
        let merge = !event.is_start
            && events
                .peek()
                .map(|next| next.is_start && next.key == event.key && next.weight == event.weight)
                .unwrap_or(false);
        if merge {
            let opening = events.next().unwrap();
            let kind = if event.inclusive {
                BoundKind::InclEndExclStart
            } else {
                BoundKind::ExclEndInclStart
            };
            items.push(WriteItem::Marker {
                key: event.key,
                kind,
                first: event.deletion,
                second: Some(opening.deletion),
            });
        } else {
            items.push(WriteItem::Marker {
                kind: event.kind(),
                key: event.key,
                first: event.deletion,
                second: None,
            });
        }
    }
    items
}

/// Serializes one unfiltered with its `prev_length` back-pointer.
fn encode_unfiltered(item: &WriteItem<'_>, prev_len: u64) -> Vec<u8> {
    let mut out = Vec::new();
    let body = match item {
        WriteItem::Row(row) => {
            out.push(0);
            // Clustering blocks of a row cover every clustering column.
            encode_clustering_blocks(&row.key, &mut out);
            let row_tombstone =
                (!row.row_tombstone.is_live()).then_some(row.row_tombstone);
            encode_row_body(row_tombstone, &row.cells)
        }
        WriteItem::Marker {
            key,
            kind,
            first,
            second,
        } => {
            out.push(FLAG_IS_RANGE_TOMBSTONE);
            out.push(*kind as u8);
            out.extend_from_slice(&(key.values.len() as u16).to_be_bytes());
            if !key.values.is_empty() {
                encode_clustering_blocks(key, &mut out);
            }
            let mut body = Vec::new();
            encode_deletion_pair(first, &mut body);
            if let Some(second) = second {
                encode_deletion_pair(second, &mut body);
            }
            body
        }
    };
    let body_size = vint_size(prev_len) as u64 + body.len() as u64;
    encode_vint(body_size, &mut out);
    encode_vint(prev_len, &mut out);
    out.extend_from_slice(&body);
    out
}

/// Clustering blocks: a presence header followed by length-prefixed
/// component values.
fn encode_clustering_blocks(key: &ClusteringKey, out: &mut Vec<u8>) {
    encode_vint(0, out);
    for value in &key.values {
        let bytes = value.to_bytes();
        encode_vint(bytes.len() as u64, out);
        out.extend_from_slice(&bytes);
    }
}

fn encode_deletion_pair(deletion: &DeletionTime, out: &mut Vec<u8>) {
    encode_vint(deletion.marked_for_delete_at as u64, out);
    encode_vint(u64::from(deletion.local_deletion_time), out);
}

fn encode_row_body(row_tombstone: Option<DeletionTime>, cells: &[Cell]) -> Vec<u8> {
    let mut out = Vec::new();
    match row_tombstone {
        Some(deletion) => {
            out.push(1);
            encode_deletion_pair(&deletion, &mut out);
        }
        None => out.push(0),
    }
    encode_vint(cells.len() as u64, &mut out);
    for cell in cells {
        encode_cell(cell, &mut out);
    }
    out
}

/// Cell flags bit: the cell carries a value.
pub(crate) const CELL_FLAG_HAS_VALUE: u8 = 0x01;
/// Cell flags bit: the cell expires.
pub(crate) const CELL_FLAG_HAS_TTL: u8 = 0x02;

fn encode_cell(cell: &Cell, out: &mut Vec<u8>) {
    encode_vint(u64::from(cell.column_id), out);
    let mut flags = 0;
    if cell.value.is_some() {
        flags |= CELL_FLAG_HAS_VALUE;
    }
    if cell.ttl.is_some() {
        flags |= CELL_FLAG_HAS_TTL;
    }
    out.push(flags);
    encode_vint(cell.timestamp as u64, out);
    if let Some(ttl) = cell.ttl {
        encode_vint(u64::from(ttl), out);
        encode_vint(u64::from(cell.local_deletion_time), out);
    }
    match &cell.value {
        Some(value) => {
            let bytes = value.to_bytes();
            encode_vint(bytes.len() as u64, out);
            out.extend_from_slice(&bytes);
        }
        None => {
            // A cell tombstone carries only its deletion second.
            encode_vint(u64::from(cell.local_deletion_time), out);
        }
    }
}
