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

//! Decoder of partition bytes into mutation fragments.
//!
//! Consumes the output of both the forward data path and the reversing
//! data source; the reversed stream reuses the forward representation, so
//! one decoder serves both directions.

use store_api::metadata::TableMetadataRef;
use store_api::storage::{ClusteringBound, ClusteringKey, DeletionTime, PartitionKey};

use crate::error::{Error, MalformedSsTableSnafu, Result};
use crate::read::{Cell, ClusteringRow, PartitionStart, RangeTombstone, StaticRow};
use crate::sst::format::{
    decode_vint, BoundKind, UnfilteredExtendedFlags, UnfilteredFlags,
};
use crate::sst::writer::{CELL_FLAG_HAS_TTL, CELL_FLAG_HAS_VALUE};

/// A bounds checked cursor over partition bytes.
pub struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
    path: &'a str,
}

impl<'a> Cursor<'a> {
    pub fn new(bytes: &'a [u8], path: &'a str) -> Cursor<'a> {
        Cursor {
            bytes,
            pos: 0,
            path,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn malformed(&self, reason: impl Into<String>) -> Error {
        MalformedSsTableSnafu {
            path: self.path.to_string(),
            reason: reason.into(),
        }
        .build()
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.bytes.len() - self.pos < len {
            return Err(self.malformed("truncated partition"));
        }
        let slice = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn peek_u8(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn read_u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn read_vint(&mut self) -> Result<u64> {
        let (value, consumed) = decode_vint(&self.bytes[self.pos..])
            .ok_or_else(|| self.malformed("truncated vint"))?;
        self.pos += consumed;
        Ok(value)
    }
}

/// A decoded range tombstone marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Marker {
    pub key: ClusteringKey,
    pub kind: BoundKind,
    /// Deletion pair of the marker; for boundaries the closing pair.
    pub first: DeletionTime,
    /// Opening pair of a boundary marker.
    pub second: Option<DeletionTime>,
}

/// A decoded unfiltered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Unfiltered {
    Row(ClusteringRow),
    Marker(Marker),
    EndOfPartition,
}

/// Decoder of one partition's bytes.
pub struct PartitionDecoder {
    metadata: TableMetadataRef,
}

impl PartitionDecoder {
    pub fn new(metadata: TableMetadataRef) -> PartitionDecoder {
        PartitionDecoder { metadata }
    }

    /// Decodes the partition header and the static row, if present.
    pub fn decode_header(
        &self,
        cursor: &mut Cursor<'_>,
    ) -> Result<(PartitionStart, Option<StaticRow>)> {
        let key_len = cursor.read_u16()?;
        let key_bytes = cursor.take(usize::from(key_len))?;
        let types = self.metadata.partition_key_types();
        let key = PartitionKey::decode(key_bytes, &types)
            .map_err(|e| cursor.malformed(format!("bad partition key: {e}")))?;
        let local_deletion_time = cursor.read_u32()?;
        let marked_for_delete_at = cursor.read_u64()? as i64;

        let partition_start = PartitionStart {
            key: key.decorate(),
            deletion: DeletionTime {
                marked_for_delete_at,
                local_deletion_time,
            },
        };

        // A static row follows when the next unfiltered carries the
        // static extended flag.
        let static_row = match cursor.peek_u8() {
            Some(byte)
                if UnfilteredFlags(byte).has_extended_flags()
                    && !UnfilteredFlags(byte).is_end_of_partition()
                    && !UnfilteredFlags(byte).is_range_tombstone() =>
            {
                let flags_pos = cursor.pos;
                cursor.read_u8()?;
                let ext = UnfilteredExtendedFlags(cursor.read_u8()?);
                if ext.is_static() {
                    let body_len = cursor.read_vint()? as usize;
                    let body = cursor.take(body_len)?;
                    let mut body_cursor = Cursor::new(body, cursor.path);
                    let (_, cells) = self.decode_row_body(&mut body_cursor)?;
                    Some(StaticRow::new(cells))
                } else {
                    cursor.pos = flags_pos;
                    None
                }
            }
            _ => None,
        };

        Ok((partition_start, static_row))
    }

    /// Decodes one unfiltered.
    pub fn decode_unfiltered(&self, cursor: &mut Cursor<'_>) -> Result<Unfiltered> {
        let flags = UnfilteredFlags(cursor.read_u8()?);
        if flags.is_end_of_partition() {
            return Ok(Unfiltered::EndOfPartition);
        }

        if flags.is_range_tombstone() {
            let kind_byte = cursor.read_u8()?;
            let kind = BoundKind::from_byte(kind_byte)
                .ok_or_else(|| cursor.malformed(format!("invalid bound kind {kind_byte}")))?;
            let component_count = usize::from(cursor.read_u16()?);
            let key = self.decode_clustering_blocks(cursor, component_count)?;
            let _body_size = cursor.read_vint()?;
            let _prev_len = cursor.read_vint()?;
            let first = decode_deletion_pair(cursor)?;
            let second = kind
                .is_boundary()
                .then(|| decode_deletion_pair(cursor))
                .transpose()?;
            return Ok(Unfiltered::Marker(Marker {
                key,
                kind,
                first,
                second,
            }));
        }

        if flags.has_extended_flags() {
            let ext = UnfilteredExtendedFlags(cursor.read_u8()?);
            if ext.is_static() {
                return Err(cursor.malformed("static row between clustering rows"));
            }
        }

        let key = self.decode_clustering_blocks(cursor, self.metadata.clustering_key_len())?;
        let _body_size = cursor.read_vint()?;
        let _prev_len = cursor.read_vint()?;
        let (row_tombstone, cells) = self.decode_row_body(cursor)?;
        Ok(Unfiltered::Row(ClusteringRow {
            key,
            row_tombstone,
            cells,
        }))
    }

    fn decode_clustering_blocks(
        &self,
        cursor: &mut Cursor<'_>,
        component_count: usize,
    ) -> Result<ClusteringKey> {
        if component_count == 0 {
            return Ok(ClusteringKey::empty());
        }
        let _header = cursor.read_vint()?;
        let types = self.metadata.clustering_key_types();
        if component_count > types.len() {
            return Err(cursor.malformed(format!(
                "clustering key with {component_count} components, schema has {}",
                types.len()
            )));
        }
        let mut values = Vec::with_capacity(component_count);
        for column_type in types.iter().take(component_count) {
            let len = cursor.read_vint()? as usize;
            let bytes = cursor.take(len)?;
            let value = column_type
                .decode(bytes)
                .map_err(|e| cursor.malformed(format!("bad clustering value: {e}")))?;
            values.push(value);
        }
        Ok(ClusteringKey::new(values))
    }

    fn decode_row_body(&self, cursor: &mut Cursor<'_>) -> Result<(DeletionTime, Vec<Cell>)> {
        let row_flags = cursor.read_u8()?;
        let row_tombstone = if row_flags & 1 != 0 {
            decode_deletion_pair(cursor)?
        } else {
            DeletionTime::LIVE
        };

        let cell_count = cursor.read_vint()? as usize;
        let mut cells = Vec::with_capacity(cell_count);
        for _ in 0..cell_count {
            cells.push(self.decode_cell(cursor)?);
        }
        Ok((row_tombstone, cells))
    }

    fn decode_cell(&self, cursor: &mut Cursor<'_>) -> Result<Cell> {
        let column_id = cursor.read_vint()? as u32;
        let flags = cursor.read_u8()?;
        let timestamp = cursor.read_vint()? as i64;

        let (ttl, mut local_deletion_time) = if flags & CELL_FLAG_HAS_TTL != 0 {
            let ttl = cursor.read_vint()? as u32;
            let ldt = cursor.read_vint()? as u32;
            (Some(ttl), ldt)
        } else {
            (None, u32::MAX)
        };

        let value = if flags & CELL_FLAG_HAS_VALUE != 0 {
            let len = cursor.read_vint()? as usize;
            let bytes = cursor.take(len)?;
            let column = self
                .metadata
                .column_by_id(column_id)
                .ok_or_else(|| cursor.malformed(format!("unknown column {column_id}")))?;
            Some(
                column
                    .column_type
                    .decode(bytes)
                    .map_err(|e| cursor.malformed(format!("bad cell value: {e}")))?,
            )
        } else {
            local_deletion_time = cursor.read_vint()? as u32;
            None
        };

        Ok(Cell {
            column_id,
            timestamp,
            ttl,
            local_deletion_time,
            value,
        })
    }
}

/// Pairs range tombstone markers back into range tombstones.
///
/// Works for both stream directions: a reversed stream has its marker
/// kinds swapped, so opening markers still arrive first.
#[derive(Debug, Default)]
pub struct MarkerPairer {
    open: Option<(ClusteringBound, DeletionTime)>,
}

impl MarkerPairer {
    /// Feeds a marker; returns the completed tombstone, if any.
    pub fn on_marker(&mut self, marker: Marker, path: &str) -> Result<Option<RangeTombstone>> {
        let bound = ClusteringBound {
            key: marker.key,
            inclusive: marker.kind.is_inclusive(),
        };
        if marker.kind.is_boundary() {
            let Some((start, deletion)) = self.open.take() else {
                return malformed(path, "boundary marker without an open range");
            };
            // The closing side of a boundary is inclusive exactly when the
            // opening side is not.
            let end = ClusteringBound {
                key: bound.key.clone(),
                inclusive: marker.kind == BoundKind::InclEndExclStart,
            };
            let opening_deletion = marker
                .second
                .ok_or_else(|| {
                    crate::error::MalformedSsTableSnafu {
                        path: path.to_string(),
                        reason: "boundary marker with one deletion pair".to_string(),
                    }
                    .build()
                })?;
            let opening = ClusteringBound {
                key: bound.key,
                inclusive: marker.kind == BoundKind::ExclEndInclStart,
            };
            self.open = Some((opening, opening_deletion));
            return Ok(Some(RangeTombstone {
                start,
                end,
                deletion,
            }));
        }
        if marker.kind.is_start() {
            if self.open.is_some() {
                return malformed(path, "start marker while a range is open");
            }
            self.open = Some((bound, marker.first));
            return Ok(None);
        }
        let Some((start, deletion)) = self.open.take() else {
            return malformed(path, "end marker without an open range");
        };
        Ok(Some(RangeTombstone {
            start,
            end: bound,
            deletion,
        }))
    }

    /// Returns whether a range is still open.
    pub fn has_open(&self) -> bool {
        self.open.is_some()
    }
}

fn malformed<T>(path: &str, reason: &str) -> Result<T> {
    MalformedSsTableSnafu {
        path: path.to_string(),
        reason: reason.to_string(),
    }
    .fail()
}

fn decode_deletion_pair(cursor: &mut Cursor<'_>) -> Result<DeletionTime> {
    let marked_for_delete_at = cursor.read_vint()? as i64;
    let local_deletion_time = cursor.read_vint()? as u32;
    Ok(DeletionTime {
        marked_for_delete_at,
        local_deletion_time,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use store_api::storage::Value;

    use super::*;
    use crate::access::AccessLayer;
    use crate::sst::writer::SsTableWriter;
    use crate::test_util::{new_metadata, new_row_mutation};

    #[tokio::test]
    async fn test_decode_written_partition() {
        let metadata = new_metadata();
        let access = Arc::new(AccessLayer::memory());
        let writer = SsTableWriter::new(metadata.clone(), access.clone());
        let sst = writer
            .write(&[new_row_mutation(1, &[(1, "a"), (2, "b")])])
            .await
            .unwrap();

        let entry = &sst.index.entries[0];
        let bytes = access
            .read_range(&sst.data_path, entry.offset, entry.offset + entry.len)
            .await
            .unwrap();

        let decoder = PartitionDecoder::new(metadata);
        let mut cursor = Cursor::new(&bytes, &sst.data_path);
        let (partition_start, static_row) = decoder.decode_header(&mut cursor).unwrap();
        assert_eq!(entry.key, partition_start.key);
        assert!(partition_start.deletion.is_live());
        assert!(static_row.is_none());

        let Unfiltered::Row(first) = decoder.decode_unfiltered(&mut cursor).unwrap() else {
            panic!("expected row");
        };
        assert_eq!(
            ClusteringKey::new([Value::Int32(1)]),
            first.key
        );
        assert_eq!(Some(Value::Text("a".into())), first.cells[0].value);

        let Unfiltered::Row(_) = decoder.decode_unfiltered(&mut cursor).unwrap() else {
            panic!("expected row");
        };
        assert!(matches!(
            decoder.decode_unfiltered(&mut cursor).unwrap(),
            Unfiltered::EndOfPartition
        ));
        assert!(cursor.is_empty());
    }

    #[test]
    fn test_marker_pairer_bounds() {
        let mut pairer = MarkerPairer::default();
        let start = Marker {
            key: ClusteringKey::new([Value::Int32(2)]),
            kind: BoundKind::InclStart,
            first: DeletionTime::new(10, 1),
            second: None,
        };
        assert!(pairer.on_marker(start, "sst").unwrap().is_none());
        assert!(pairer.has_open());

        let end = Marker {
            key: ClusteringKey::new([Value::Int32(5)]),
            kind: BoundKind::InclEnd,
            first: DeletionTime::new(10, 1),
            second: None,
        };
        let rt = pairer.on_marker(end, "sst").unwrap().unwrap();
        assert_eq!(DeletionTime::new(10, 1), rt.deletion);
        assert!(rt.start.inclusive && rt.end.inclusive);
        assert!(!pairer.has_open());
    }

    #[test]
    fn test_marker_pairer_boundary() {
        let mut pairer = MarkerPairer::default();
        let start = Marker {
            key: ClusteringKey::new([Value::Int32(1)]),
            kind: BoundKind::InclStart,
            first: DeletionTime::new(10, 1),
            second: None,
        };
        pairer.on_marker(start, "sst").unwrap();

        let boundary = Marker {
            key: ClusteringKey::new([Value::Int32(4)]),
            kind: BoundKind::ExclEndInclStart,
            first: DeletionTime::new(10, 1),
            second: Some(DeletionTime::new(20, 2)),
        };
        let rt = pairer.on_marker(boundary, "sst").unwrap().unwrap();
        assert_eq!(DeletionTime::new(10, 1), rt.deletion);
        assert!(!rt.end.inclusive);

        let end = Marker {
            key: ClusteringKey::new([Value::Int32(8)]),
            kind: BoundKind::InclEnd,
            first: DeletionTime::new(20, 2),
            second: None,
        };
        let rt = pairer.on_marker(end, "sst").unwrap().unwrap();
        assert_eq!(DeletionTime::new(20, 2), rt.deletion);
        assert!(rt.start.inclusive);
        assert!(!pairer.has_open());
    }

    #[test]
    fn test_marker_pairer_rejects_orphan_end() {
        let mut pairer = MarkerPairer::default();
        let end = Marker {
            key: ClusteringKey::new([Value::Int32(5)]),
            kind: BoundKind::InclEnd,
            first: DeletionTime::new(10, 1),
            second: None,
        };
        assert!(pairer.on_marker(end, "sst").is_err());
    }
}
