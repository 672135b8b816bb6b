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

//! Resumable stream parsers for the SSTable data format.
//!
//! Every parser consumes input chunk by chunk: `process` reads what it can
//! and returns [ReadStatus::Waiting] when the chunk is exhausted mid
//! record; re-entering with the next chunk resumes at the saved state.

use snafu::OptionExt;

use crate::error::{MalformedSsTableSnafu, Result};
use crate::sst::format::{
    decode_vint, vint_extra_bytes, BoundKind, UnfilteredExtendedFlags, UnfilteredFlags,
};

/// Outcome of feeding a chunk to a parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// The parser finished its record.
    Ready,
    /// The chunk was exhausted; feed the next one.
    Waiting,
}

/// Offsets needed to rewrite a range tombstone marker for reverse order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TombstoneReversingInfo {
    /// File offset of the marker's kind byte.
    pub kind_offset: u64,
    /// Kind of the marker.
    pub kind: BoundKind,
    /// File offset of the first deletion time pair.
    pub first_deletion_time_offset: u64,
    /// File offset one past the first deletion time pair. For boundary
    /// markers this is where the second pair starts.
    pub after_first_deletion_time_offset: u64,
}

/// Resumable primitive reads shared by the parsers.
#[derive(Debug, Default)]
struct Primitives {
    pending: Vec<u8>,
    consumed: u64,
    skip_remaining: Option<u64>,
}

impl Primitives {
    fn take_byte(&mut self, input: &mut &[u8]) -> Option<u8> {
        let (&byte, rest) = input.split_first()?;
        *input = rest;
        self.consumed += 1;
        Some(byte)
    }

    fn read_u8(&mut self, input: &mut &[u8]) -> Option<u8> {
        self.take_byte(input)
    }

    fn read_u16(&mut self, input: &mut &[u8]) -> Option<u16> {
        while self.pending.len() < 2 {
            let byte = self.take_byte(input)?;
            self.pending.push(byte);
        }
        let value = u16::from_be_bytes([self.pending[0], self.pending[1]]);
        self.pending.clear();
        Some(value)
    }

    fn read_vint(&mut self, input: &mut &[u8]) -> Option<u64> {
        if self.pending.is_empty() {
            let first = self.take_byte(input)?;
            self.pending.push(first);
        }
        let total = 1 + vint_extra_bytes(self.pending[0]);
        while self.pending.len() < total {
            let byte = self.take_byte(input)?;
            self.pending.push(byte);
        }
        // The buffer holds exactly one full vint here.
        let (value, _) = decode_vint(&self.pending).unwrap();
        self.pending.clear();
        Some(value)
    }

    /// Skips `total` bytes, armed on first call and drained across chunks.
    fn skip(&mut self, input: &mut &[u8], total: u64) -> bool {
        let remaining = self.skip_remaining.get_or_insert(total);
        let take = (*remaining).min(input.len() as u64) as usize;
        *input = &input[take..];
        self.consumed += take as u64;
        *remaining -= take as u64;
        if *remaining == 0 {
            self.skip_remaining = None;
            true
        } else {
            false
        }
    }
}

/// Parser for the partition header and the static row, if present.
///
/// After consuming the input, `header_end_pos` gives the file offset where
/// the sequence of unfiltereds begins.
#[derive(Debug)]
pub struct PartitionHeaderParser {
    state: HeaderState,
    prims: Primitives,
    start: u64,
    skip_len: u64,
    header_end_pos: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HeaderState {
    KeyLen,
    SkipKeyAndDeletion,
    Flags,
    ExtendedFlags,
    StaticRowSize,
    Finished,
}

impl PartitionHeaderParser {
    /// Creates a parser for a partition starting at file offset `start`.
    pub fn new(start: u64) -> PartitionHeaderParser {
        PartitionHeaderParser {
            state: HeaderState::KeyLen,
            prims: Primitives::default(),
            start,
            skip_len: 0,
            header_end_pos: 0,
        }
    }

    fn position(&self) -> u64 {
        self.start + self.prims.consumed
    }

    /// File offset where the clustering rows start.
    pub fn header_end_pos(&self) -> u64 {
        debug_assert_eq!(HeaderState::Finished, self.state);
        self.header_end_pos
    }

    /// Feeds one chunk.
    pub fn process(&mut self, input: &mut &[u8]) -> Result<ReadStatus> {
        loop {
            match self.state {
                HeaderState::KeyLen => {
                    let Some(key_len) = self.prims.read_u16(input) else {
                        return Ok(ReadStatus::Waiting);
                    };
                    // Key bytes plus the partition deletion time pair.
                    self.skip_len = u64::from(key_len) + 4 + 8;
                    self.state = HeaderState::SkipKeyAndDeletion;
                }
                HeaderState::SkipKeyAndDeletion => {
                    if !self.prims.skip(input, self.skip_len) {
                        return Ok(ReadStatus::Waiting);
                    }
                    self.state = HeaderState::Flags;
                }
                HeaderState::Flags => {
                    let Some(byte) = self.prims.read_u8(input) else {
                        return Ok(ReadStatus::Waiting);
                    };
                    let flags = UnfilteredFlags(byte);
                    if flags.is_end_of_partition()
                        || flags.is_range_tombstone()
                        || !flags.has_extended_flags()
                    {
                        // The byte belongs to the first unfiltered.
                        self.header_end_pos = self.position() - 1;
                        self.state = HeaderState::Finished;
                        return Ok(ReadStatus::Ready);
                    }
                    self.state = HeaderState::ExtendedFlags;
                }
                HeaderState::ExtendedFlags => {
                    let Some(byte) = self.prims.read_u8(input) else {
                        return Ok(ReadStatus::Waiting);
                    };
                    if !UnfilteredExtendedFlags(byte).is_static() {
                        self.header_end_pos = self.position() - 2;
                        self.state = HeaderState::Finished;
                        return Ok(ReadStatus::Ready);
                    }
                    self.state = HeaderState::StaticRowSize;
                }
                HeaderState::StaticRowSize => {
                    let Some(body_size) = self.prims.read_vint(input) else {
                        return Ok(ReadStatus::Waiting);
                    };
                    self.header_end_pos = self.position() + body_size;
                    self.state = HeaderState::Finished;
                    return Ok(ReadStatus::Ready);
                }
                HeaderState::Finished => return Ok(ReadStatus::Ready),
            }
        }
    }
}

/// Parser of unfiltereds that skips their bodies.
///
/// Parses one unfiltered per [UnfilteredSkipParser::process] completion.
/// After a completed parse, `prev_len` gives the byte length of the
/// immediately preceding unfiltered and `tombstone_info` describes the
/// marker if the unfiltered was one. Reading the end-of-partition flag sets
/// `end_of_partition` instead. Call `reset` to parse the next unfiltered.
///
/// The parser does not handle the static row, only clustering rows and
/// range tombstone markers.
#[derive(Debug)]
pub struct UnfilteredSkipParser {
    state: SkipState,
    prims: Primitives,
    start: u64,
    path: String,
    clustering_columns: usize,
    end_of_partition: bool,
    prev_len: u64,
    next_row_offset: u64,
    ck_remaining: usize,
    ck_value_len: u64,
    tombstone: Option<TombstoneReversingInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SkipState {
    Flags,
    ExtendedFlags,
    RangeTombstoneKind,
    RangeTombstoneCkCount,
    CkHeader,
    CkValueLen,
    CkValueSkip,
    BodySize,
    PrevSize,
    RtFirstPairTimestamp,
    RtFirstPairLdt,
    SkipRest,
    FinishedRow,
}

impl UnfilteredSkipParser {
    /// Creates a parser for unfiltereds starting at file offset `start`.
    /// `clustering_columns` is the table's clustering key width.
    pub fn new(start: u64, clustering_columns: usize, path: impl Into<String>) -> Self {
        UnfilteredSkipParser {
            state: SkipState::Flags,
            prims: Primitives::default(),
            start,
            path: path.into(),
            clustering_columns,
            end_of_partition: false,
            prev_len: 0,
            next_row_offset: 0,
            ck_remaining: 0,
            ck_value_len: 0,
            tombstone: None,
        }
    }

    /// Absolute file position of the next byte to consume.
    pub fn position(&self) -> u64 {
        self.start + self.prims.consumed
    }

    /// Returns whether the last parsed unfiltered was the partition end.
    pub fn end_of_partition(&self) -> bool {
        self.end_of_partition
    }

    /// Byte length of the unfiltered immediately preceding the parsed one.
    pub fn prev_len(&self) -> u64 {
        self.prev_len
    }

    /// Marker reversing info of the parsed unfiltered, if it was a range
    /// tombstone marker.
    pub fn tombstone_info(&self) -> Option<&TombstoneReversingInfo> {
        self.tombstone.as_ref()
    }

    /// Prepares parsing the next unfiltered.
    pub fn reset(&mut self) {
        self.state = SkipState::Flags;
    }

    fn malformed(&self, reason: impl Into<String>) -> crate::error::Error {
        MalformedSsTableSnafu {
            path: self.path.clone(),
            reason: reason.into(),
        }
        .build()
    }

    /// Feeds one chunk.
    pub fn process(&mut self, input: &mut &[u8]) -> Result<ReadStatus> {
        loop {
            match self.state {
                SkipState::Flags => {
                    let Some(byte) = self.prims.read_u8(input) else {
                        return Ok(ReadStatus::Waiting);
                    };
                    let flags = UnfilteredFlags(byte);
                    self.tombstone = None;
                    if flags.is_end_of_partition() {
                        self.end_of_partition = true;
                        return Ok(ReadStatus::Ready);
                    }
                    if flags.is_range_tombstone() {
                        self.tombstone = Some(TombstoneReversingInfo {
                            kind_offset: self.position(),
                            kind: BoundKind::InclStart,
                            first_deletion_time_offset: 0,
                            after_first_deletion_time_offset: 0,
                        });
                        self.state = SkipState::RangeTombstoneKind;
                        continue;
                    }
                    if flags.has_extended_flags() {
                        self.state = SkipState::ExtendedFlags;
                        continue;
                    }
                    self.ck_remaining = self.clustering_columns;
                    self.state = if self.ck_remaining == 0 {
                        SkipState::BodySize
                    } else {
                        SkipState::CkHeader
                    };
                }
                SkipState::ExtendedFlags => {
                    let Some(byte) = self.prims.read_u8(input) else {
                        return Ok(ReadStatus::Waiting);
                    };
                    if UnfilteredExtendedFlags(byte).is_static() {
                        return Err(
                            self.malformed("static row between clustering rows")
                        );
                    }
                    self.ck_remaining = self.clustering_columns;
                    self.state = if self.ck_remaining == 0 {
                        SkipState::BodySize
                    } else {
                        SkipState::CkHeader
                    };
                }
                SkipState::RangeTombstoneKind => {
                    let Some(byte) = self.prims.read_u8(input) else {
                        return Ok(ReadStatus::Waiting);
                    };
                    let kind = BoundKind::from_byte(byte)
                        .context(MalformedSsTableSnafu {
                            path: self.path.clone(),
                            reason: format!("invalid bound kind {byte}"),
                        })?;
                    // The info is present in this state.
                    self.tombstone.as_mut().unwrap().kind = kind;
                    self.state = SkipState::RangeTombstoneCkCount;
                }
                SkipState::RangeTombstoneCkCount => {
                    let Some(count) = self.prims.read_u16(input) else {
                        return Ok(ReadStatus::Waiting);
                    };
                    self.ck_remaining = usize::from(count);
                    self.state = if self.ck_remaining == 0 {
                        SkipState::BodySize
                    } else {
                        SkipState::CkHeader
                    };
                }
                SkipState::CkHeader => {
                    if self.prims.read_vint(input).is_none() {
                        return Ok(ReadStatus::Waiting);
                    }
                    self.state = SkipState::CkValueLen;
                }
                SkipState::CkValueLen => {
                    if self.ck_remaining == 0 {
                        self.state = SkipState::BodySize;
                        continue;
                    }
                    let Some(len) = self.prims.read_vint(input) else {
                        return Ok(ReadStatus::Waiting);
                    };
                    self.ck_value_len = len;
                    self.state = SkipState::CkValueSkip;
                }
                SkipState::CkValueSkip => {
                    if !self.prims.skip(input, self.ck_value_len) {
                        return Ok(ReadStatus::Waiting);
                    }
                    self.ck_remaining -= 1;
                    self.state = SkipState::CkValueLen;
                }
                SkipState::BodySize => {
                    let Some(body_size) = self.prims.read_vint(input) else {
                        return Ok(ReadStatus::Waiting);
                    };
                    self.next_row_offset = self.position() + body_size;
                    self.state = SkipState::PrevSize;
                }
                SkipState::PrevSize => {
                    let Some(prev) = self.prims.read_vint(input) else {
                        return Ok(ReadStatus::Waiting);
                    };
                    self.prev_len = prev;
                    let position = self.position();
                    match &mut self.tombstone {
                        Some(info) => {
                            info.first_deletion_time_offset = position;
                            self.state = SkipState::RtFirstPairTimestamp;
                        }
                        None => self.state = SkipState::SkipRest,
                    }
                }
                SkipState::RtFirstPairTimestamp => {
                    if self.prims.read_vint(input).is_none() {
                        return Ok(ReadStatus::Waiting);
                    }
                    self.state = SkipState::RtFirstPairLdt;
                }
                SkipState::RtFirstPairLdt => {
                    if self.prims.read_vint(input).is_none() {
                        return Ok(ReadStatus::Waiting);
                    }
                    // The info is present in this state.
                    self.tombstone.as_mut().unwrap().after_first_deletion_time_offset =
                        self.position();
                    self.state = SkipState::SkipRest;
                }
                SkipState::SkipRest => {
                    // `total` only matters when the skip is armed; on
                    // re-entry the remaining count is already tracked.
                    if self.prims.skip_remaining.is_none() && self.next_row_offset < self.position()
                    {
                        return Err(self.malformed("unfiltered body overruns its size"));
                    }
                    let total = self.next_row_offset.saturating_sub(self.position());
                    if !self.prims.skip(input, total) {
                        return Ok(ReadStatus::Waiting);
                    }
                    self.state = SkipState::FinishedRow;
                    return Ok(ReadStatus::Ready);
                }
                SkipState::FinishedRow => return Ok(ReadStatus::Ready),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sst::format::encode_vint;

    /// Drives a header parser over `bytes` in `chunk` sized pieces.
    fn drive_header(parser: &mut PartitionHeaderParser, bytes: &[u8], chunk: usize) {
        let mut offset = 0;
        while offset < bytes.len() {
            let end = (offset + chunk).min(bytes.len());
            let mut input = &bytes[offset..end];
            let status = parser.process(&mut input).unwrap();
            offset = end - input.len();
            if status == ReadStatus::Ready {
                return;
            }
        }
        panic!("parser did not finish");
    }

    fn header_bytes(key: &[u8], static_body: Option<&[u8]>) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(key.len() as u16).to_be_bytes());
        out.extend_from_slice(key);
        out.extend_from_slice(&[0; 12]);
        if let Some(body) = static_body {
            out.push(crate::sst::format::FLAG_HAS_EXTENDED_FLAGS);
            out.push(crate::sst::format::EXT_FLAG_IS_STATIC);
            encode_vint(body.len() as u64, &mut out);
            out.extend_from_slice(body);
        }
        out
    }

    #[test]
    fn test_header_without_static_row() {
        let mut bytes = header_bytes(b"key", None);
        let header_len = bytes.len() as u64;
        // First unfiltered: a plain row flags byte.
        bytes.push(0);

        for chunk in [1, 3, bytes.len()] {
            let mut parser = PartitionHeaderParser::new(100);
            drive_header(&mut parser, &bytes, chunk);
            assert_eq!(100 + header_len, parser.header_end_pos(), "chunk {chunk}");
        }
    }

    #[test]
    fn test_header_with_static_row() {
        let mut bytes = header_bytes(b"key", Some(&[9, 9, 9, 9]));
        let header_len = bytes.len() as u64;
        bytes.push(0);

        for chunk in [1, 2, bytes.len()] {
            let mut parser = PartitionHeaderParser::new(0);
            drive_header(&mut parser, &bytes, chunk);
            assert_eq!(header_len, parser.header_end_pos(), "chunk {chunk}");
        }
    }

    #[test]
    fn test_header_end_of_partition() {
        let mut bytes = header_bytes(b"k", None);
        let header_len = bytes.len() as u64;
        bytes.push(crate::sst::format::FLAG_END_OF_PARTITION);

        let mut parser = PartitionHeaderParser::new(0);
        drive_header(&mut parser, &bytes, bytes.len());
        assert_eq!(header_len, parser.header_end_pos());
    }

    /// A minimal clustering row unfiltered with one ck component.
    fn row_bytes(prev_len: u64) -> Vec<u8> {
        let mut out = vec![0u8];
        encode_vint(0, &mut out);
        encode_vint(4, &mut out);
        out.extend_from_slice(&1i32.to_be_bytes());
        let body = vec![0u8, 0u8];
        encode_vint(vint_len(prev_len) + body.len() as u64, &mut out);
        encode_vint(prev_len, &mut out);
        out.extend_from_slice(&body);
        out
    }

    fn vint_len(v: u64) -> u64 {
        crate::sst::format::vint_size(v) as u64
    }

    #[test]
    fn test_skip_parser_reads_prev_len() {
        let bytes = row_bytes(42);
        for chunk in [1, 2, bytes.len()] {
            let mut parser = UnfilteredSkipParser::new(0, 1, "sst");
            let mut offset = 0;
            loop {
                let end = (offset + chunk).min(bytes.len());
                let mut input = &bytes[offset..end];
                let status = parser.process(&mut input).unwrap();
                offset = end - input.len();
                if status == ReadStatus::Ready {
                    break;
                }
                assert!(offset < bytes.len(), "chunk {chunk}");
            }
            assert!(!parser.end_of_partition());
            assert_eq!(42, parser.prev_len(), "chunk {chunk}");
            assert_eq!(bytes.len() as u64, parser.position());
            assert!(parser.tombstone_info().is_none());
        }
    }

    #[test]
    fn test_skip_parser_end_of_partition() {
        let bytes = [crate::sst::format::FLAG_END_OF_PARTITION];
        let mut parser = UnfilteredSkipParser::new(7, 1, "sst");
        let mut input = &bytes[..];
        assert_eq!(ReadStatus::Ready, parser.process(&mut input).unwrap());
        assert!(parser.end_of_partition());
    }

    #[test]
    fn test_skip_parser_consecutive_rows() {
        let first = row_bytes(10);
        let second = row_bytes(first.len() as u64);
        let mut bytes = first.clone();
        bytes.extend_from_slice(&second);

        let mut parser = UnfilteredSkipParser::new(0, 1, "sst");
        let mut input = &bytes[..];
        assert_eq!(ReadStatus::Ready, parser.process(&mut input).unwrap());
        assert_eq!(10, parser.prev_len());

        parser.reset();
        assert_eq!(ReadStatus::Ready, parser.process(&mut input).unwrap());
        assert_eq!(first.len() as u64, parser.prev_len());
        assert_eq!(bytes.len() as u64, parser.position());
    }

    #[test]
    fn test_skip_parser_invalid_bound_kind() {
        let bytes = [crate::sst::format::FLAG_IS_RANGE_TOMBSTONE, 9];
        let mut parser = UnfilteredSkipParser::new(0, 1, "sst");
        let mut input = &bytes[..];
        assert!(parser.process(&mut input).is_err());
    }
}
