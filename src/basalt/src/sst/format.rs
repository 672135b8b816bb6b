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

//! Byte level primitives of the SSTable data format: variable length
//! integers, unfiltered flags and range tombstone bound kinds.

/// The unfiltered is the end-of-partition record.
pub const FLAG_END_OF_PARTITION: u8 = 0x01;
/// The unfiltered is a range tombstone marker.
pub const FLAG_IS_RANGE_TOMBSTONE: u8 = 0x02;
/// An extended flags byte follows.
pub const FLAG_HAS_EXTENDED_FLAGS: u8 = 0x80;
/// Extended flags bit: the row is the static row.
pub const EXT_FLAG_IS_STATIC: u8 = 0x01;

/// Flags byte of an unfiltered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnfilteredFlags(pub u8);

impl UnfilteredFlags {
    pub fn is_end_of_partition(&self) -> bool {
        self.0 & FLAG_END_OF_PARTITION != 0
    }

    pub fn is_range_tombstone(&self) -> bool {
        self.0 & FLAG_IS_RANGE_TOMBSTONE != 0
    }

    pub fn has_extended_flags(&self) -> bool {
        self.0 & FLAG_HAS_EXTENDED_FLAGS != 0
    }
}

/// Extended flags byte of an unfiltered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnfilteredExtendedFlags(pub u8);

impl UnfilteredExtendedFlags {
    pub fn is_static(&self) -> bool {
        self.0 & EXT_FLAG_IS_STATIC != 0
    }
}

/// Kind byte of a range tombstone marker.
///
/// Bound markers open or close one range; boundary markers close one range
/// and open another at the same position and carry two deletion time pairs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BoundKind {
    ExclEnd = 0,
    InclStart = 1,
    ExclEndInclStart = 2,
    InclEndExclStart = 5,
    InclEnd = 6,
    ExclStart = 7,
}

impl BoundKind {
    /// Decodes a kind byte.
    pub fn from_byte(byte: u8) -> Option<BoundKind> {
        match byte {
            0 => Some(BoundKind::ExclEnd),
            1 => Some(BoundKind::InclStart),
            2 => Some(BoundKind::ExclEndInclStart),
            5 => Some(BoundKind::InclEndExclStart),
            6 => Some(BoundKind::InclEnd),
            7 => Some(BoundKind::ExclStart),
            _ => None,
        }
    }

    /// Returns whether the marker opens a range (when read forward).
    pub fn is_start(&self) -> bool {
        matches!(self, BoundKind::InclStart | BoundKind::ExclStart)
    }

    /// Returns whether the marker closes a range (when read forward).
    pub fn is_end(&self) -> bool {
        matches!(self, BoundKind::InclEnd | BoundKind::ExclEnd)
    }

    /// Returns whether the marker is a boundary between adjacent ranges.
    pub fn is_boundary(&self) -> bool {
        matches!(
            self,
            BoundKind::ExclEndInclStart | BoundKind::InclEndExclStart
        )
    }

    /// Returns whether the bound at this marker includes its own position.
    ///
    /// For boundaries this describes the closing side.
    pub fn is_inclusive(&self) -> bool {
        matches!(
            self,
            BoundKind::InclStart | BoundKind::InclEnd | BoundKind::InclEndExclStart
        )
    }
}

/// The kind a marker takes when the stream is read in reverse clustering
/// order: starts become ends and vice versa.
pub fn reverse_bound_kind(kind: BoundKind) -> BoundKind {
    match kind {
        BoundKind::ExclEnd => BoundKind::ExclStart,
        BoundKind::InclStart => BoundKind::InclEnd,
        BoundKind::ExclEndInclStart => BoundKind::InclEndExclStart,
        BoundKind::InclEndExclStart => BoundKind::ExclEndInclStart,
        BoundKind::InclEnd => BoundKind::InclStart,
        BoundKind::ExclStart => BoundKind::ExclEnd,
    }
}

/// Number of bytes the unsigned vint encoding of `value` occupies.
pub fn vint_size(value: u64) -> usize {
    let bits = 64 - (value | 1).leading_zeros() as usize;
    for total in 1..=8 {
        if bits <= 7 * total {
            return total;
        }
    }
    9
}

/// Appends the unsigned vint encoding of `value` to `buf`.
///
/// The count of leading one bits in the first byte gives the number of
/// extra bytes (1 to 9 bytes total).
pub fn encode_vint(value: u64, buf: &mut Vec<u8>) {
    let total = vint_size(value);
    match total {
        1 => buf.push(value as u8),
        2..=8 => {
            let extra = total - 1;
            let mask = (0xffu16 << (9 - total as u16)) as u8;
            buf.push(mask | (value >> (8 * extra)) as u8);
            for i in (0..extra).rev() {
                buf.push((value >> (8 * i)) as u8);
            }
        }
        _ => {
            buf.push(0xff);
            buf.extend_from_slice(&value.to_be_bytes());
        }
    }
}

/// Number of extra bytes following a first vint byte.
pub fn vint_extra_bytes(first_byte: u8) -> usize {
    first_byte.leading_ones() as usize
}

/// Decodes an unsigned vint from `bytes`. Returns the value and the number
/// of bytes consumed, or `None` if `bytes` is too short.
pub fn decode_vint(bytes: &[u8]) -> Option<(u64, usize)> {
    let first = *bytes.first()?;
    let extra = vint_extra_bytes(first);
    if bytes.len() < 1 + extra {
        return None;
    }
    if extra == 0 {
        return Some((u64::from(first), 1));
    }
    let mut value = if extra == 8 {
        0
    } else {
        u64::from(first) & (0xff >> (extra + 1))
    };
    for byte in &bytes[1..=extra] {
        value = (value << 8) | u64::from(*byte);
    }
    Some((value, 1 + extra))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vint_round_trip() {
        let values = [
            0,
            1,
            127,
            128,
            0x3fff,
            0x4000,
            0xffff_ffff,
            u64::from(u32::MAX) + 1,
            u64::MAX - 1,
            u64::MAX,
        ];
        for value in values {
            let mut buf = Vec::new();
            encode_vint(value, &mut buf);
            assert_eq!(vint_size(value), buf.len());
            let (decoded, consumed) = decode_vint(&buf).unwrap();
            assert_eq!(value, decoded, "value {value}");
            assert_eq!(buf.len(), consumed);
        }
    }

    #[test]
    fn test_vint_sizes() {
        assert_eq!(1, vint_size(127));
        assert_eq!(2, vint_size(128));
        assert_eq!(2, vint_size(0x3fff));
        assert_eq!(3, vint_size(0x4000));
        assert_eq!(9, vint_size(u64::MAX));
    }

    #[test]
    fn test_vint_truncated() {
        let mut buf = Vec::new();
        encode_vint(100_000, &mut buf);
        assert!(decode_vint(&buf[..buf.len() - 1]).is_none());
        assert!(decode_vint(&[]).is_none());
    }

    #[test]
    fn test_reverse_bound_kind_is_involution() {
        for kind in [
            BoundKind::ExclEnd,
            BoundKind::InclStart,
            BoundKind::ExclEndInclStart,
            BoundKind::InclEndExclStart,
            BoundKind::InclEnd,
            BoundKind::ExclStart,
        ] {
            assert_eq!(kind, reverse_bound_kind(reverse_bound_kind(kind)));
        }
        assert_eq!(
            BoundKind::InclEnd,
            reverse_bound_kind(BoundKind::InclStart)
        );
        assert_eq!(
            BoundKind::InclEndExclStart,
            reverse_bound_kind(BoundKind::ExclEndInclStart)
        );
    }

    #[test]
    fn test_flags() {
        let flags = UnfilteredFlags(FLAG_IS_RANGE_TOMBSTONE);
        assert!(flags.is_range_tombstone());
        assert!(!flags.is_end_of_partition());
        assert!(!flags.has_extended_flags());
        assert!(UnfilteredExtendedFlags(EXT_FLAG_IS_STATIC).is_static());
    }

    #[test]
    fn test_bound_kind_round_trip() {
        for byte in [0u8, 1, 2, 5, 6, 7] {
            assert_eq!(byte, BoundKind::from_byte(byte).unwrap() as u8);
        }
        assert!(BoundKind::from_byte(3).is_none());
        assert!(BoundKind::from_byte(9).is_none());
    }
}
