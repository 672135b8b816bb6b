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

//! Partition and clustering ranges.

use std::cmp::Ordering;
use std::ops::Bound;

use serde::{Deserialize, Serialize};

use crate::storage::keys::{ClusteringKey, DecoratedKey};

/// An interval of partitions in token order, possibly singular.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionRange {
    pub start: Bound<DecoratedKey>,
    pub end: Bound<DecoratedKey>,
}

impl PartitionRange {
    /// The range covering the whole ring.
    pub fn full() -> PartitionRange {
        PartitionRange {
            start: Bound::Unbounded,
            end: Bound::Unbounded,
        }
    }

    /// A range containing exactly one partition.
    pub fn singular(key: DecoratedKey) -> PartitionRange {
        PartitionRange {
            start: Bound::Included(key.clone()),
            end: Bound::Included(key),
        }
    }

    /// A range with explicit bounds.
    pub fn new(start: Bound<DecoratedKey>, end: Bound<DecoratedKey>) -> PartitionRange {
        PartitionRange { start, end }
    }

    /// Returns whether the range holds exactly one partition.
    pub fn is_singular(&self) -> bool {
        match (&self.start, &self.end) {
            (Bound::Included(s), Bound::Included(e)) => s == e,
            _ => false,
        }
    }

    /// Key of the start bound, if bounded.
    pub fn start_key(&self) -> Option<&DecoratedKey> {
        match &self.start {
            Bound::Included(k) | Bound::Excluded(k) => Some(k),
            Bound::Unbounded => None,
        }
    }

    /// Key of the end bound, if bounded.
    pub fn end_key(&self) -> Option<&DecoratedKey> {
        match &self.end {
            Bound::Included(k) | Bound::Excluded(k) => Some(k),
            Bound::Unbounded => None,
        }
    }

    /// Returns whether `key` lies inside the range.
    pub fn contains(&self, key: &DecoratedKey) -> bool {
        let after_start = match &self.start {
            Bound::Included(s) => key >= s,
            Bound::Excluded(s) => key > s,
            Bound::Unbounded => true,
        };
        let before_end = match &self.end {
            Bound::Included(e) => key <= e,
            Bound::Excluded(e) => key < e,
            Bound::Unbounded => true,
        };
        after_start && before_end
    }
}

/// One bound of a clustering range. The key may be a prefix of the
/// clustering columns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusteringBound {
    pub key: ClusteringKey,
    pub inclusive: bool,
}

impl ClusteringBound {
    pub fn inclusive(key: ClusteringKey) -> ClusteringBound {
        ClusteringBound {
            key,
            inclusive: true,
        }
    }

    pub fn exclusive(key: ClusteringKey) -> ClusteringBound {
        ClusteringBound {
            key,
            inclusive: false,
        }
    }
}

/// An interval of clustering keys inside one partition. `None` bounds are
/// open ended. Bounds are stored in forward clustering order; reversed
/// slices flip the iteration direction, not the stored bounds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ClusteringRange {
    pub start: Option<ClusteringBound>,
    pub end: Option<ClusteringBound>,
}

impl ClusteringRange {
    /// The range covering the whole partition.
    pub fn full() -> ClusteringRange {
        ClusteringRange {
            start: None,
            end: None,
        }
    }

    /// A range containing exactly one clustering key.
    pub fn singular(key: ClusteringKey) -> ClusteringRange {
        ClusteringRange {
            start: Some(ClusteringBound::inclusive(key.clone())),
            end: Some(ClusteringBound::inclusive(key)),
        }
    }

    /// A range with explicit bounds.
    pub fn new(start: Option<ClusteringBound>, end: Option<ClusteringBound>) -> ClusteringRange {
        ClusteringRange { start, end }
    }

    /// Returns whether `key` lies inside the range.
    pub fn contains(&self, key: &ClusteringKey) -> bool {
        let after_start = match &self.start {
            Some(b) if b.inclusive => key >= &b.key,
            Some(b) => key > &b.key,
            None => true,
        };
        let before_end = match &self.end {
            Some(b) if b.inclusive => key <= &b.key,
            Some(b) => key < &b.key,
            None => true,
        };
        after_start && before_end
    }

    /// The first bound in iteration order: the start for forward reads,
    /// the end for reversed ones.
    pub fn first_bound(&self, reversed: bool) -> Option<&ClusteringBound> {
        if reversed {
            self.end.as_ref()
        } else {
            self.start.as_ref()
        }
    }

    /// Sorts ranges and merges overlapping or adjacent ones.
    pub fn deoverlap(mut ranges: Vec<ClusteringRange>) -> Vec<ClusteringRange> {
        if ranges.len() <= 1 {
            return ranges;
        }
        ranges.sort_by(|a, b| cmp_start(&a.start, &b.start));

        let mut deoverlapped: Vec<ClusteringRange> = Vec::with_capacity(ranges.len());
        for range in ranges {
            match deoverlapped.last_mut() {
                Some(last) if overlaps_or_adjacent(last, &range) => {
                    if cmp_end(&range.end, &last.end) == Ordering::Greater {
                        last.end = range.end;
                    }
                }
                _ => deoverlapped.push(range),
            }
        }
        deoverlapped
    }
}

fn cmp_start(a: &Option<ClusteringBound>, b: &Option<ClusteringBound>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => a
            .key
            .cmp(&b.key)
            // An inclusive start covers the key itself, so it sorts first.
            .then_with(|| b.inclusive.cmp(&a.inclusive)),
    }
}

fn cmp_end(a: &Option<ClusteringBound>, b: &Option<ClusteringBound>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(a), Some(b)) => a
            .key
            .cmp(&b.key)
            .then_with(|| a.inclusive.cmp(&b.inclusive)),
    }
}

/// Returns whether `next` starts at or before the end of `prev`, assuming
/// `prev.start <= next.start`.
fn overlaps_or_adjacent(prev: &ClusteringRange, next: &ClusteringRange) -> bool {
    let (Some(end), Some(start)) = (&prev.end, &next.start) else {
        return true;
    };
    match start.key.cmp(&end.key) {
        Ordering::Less => true,
        Ordering::Equal => start.inclusive || end.inclusive,
        Ordering::Greater => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::keys::PartitionKey;
    use crate::storage::value::Value;

    fn ck(v: i32) -> ClusteringKey {
        ClusteringKey::new([Value::Int32(v)])
    }

    fn range(start: i32, end: i32) -> ClusteringRange {
        ClusteringRange::new(
            Some(ClusteringBound::inclusive(ck(start))),
            Some(ClusteringBound::inclusive(ck(end))),
        )
    }

    #[test]
    fn test_partition_range_contains() {
        let a = PartitionKey::new([Value::Int32(1)]).decorate();
        let b = PartitionKey::new([Value::Int32(2)]).decorate();

        assert!(PartitionRange::full().contains(&a));
        let singular = PartitionRange::singular(a.clone());
        assert!(singular.is_singular());
        assert!(singular.contains(&a));
        assert!(!singular.contains(&b));
    }

    #[test]
    fn test_clustering_range_contains() {
        let r = ClusteringRange::new(
            Some(ClusteringBound::exclusive(ck(2))),
            Some(ClusteringBound::inclusive(ck(5))),
        );
        assert!(!r.contains(&ck(2)));
        assert!(r.contains(&ck(3)));
        assert!(r.contains(&ck(5)));
        assert!(!r.contains(&ck(6)));
    }

    #[test]
    fn test_first_bound_reversed() {
        let r = range(2, 5);
        assert_eq!(ck(2), r.first_bound(false).unwrap().key);
        assert_eq!(ck(5), r.first_bound(true).unwrap().key);
    }

    #[test]
    fn test_deoverlap_merges() {
        let merged = ClusteringRange::deoverlap(vec![range(4, 8), range(1, 5), range(10, 12)]);
        assert_eq!(vec![range(1, 8), range(10, 12)], merged);
    }

    #[test]
    fn test_deoverlap_adjacent_inclusive() {
        let merged = ClusteringRange::deoverlap(vec![range(1, 4), range(4, 6)]);
        assert_eq!(vec![range(1, 6)], merged);
    }

    #[test]
    fn test_deoverlap_keeps_disjoint_exclusive() {
        let left = ClusteringRange::new(
            Some(ClusteringBound::inclusive(ck(1))),
            Some(ClusteringBound::exclusive(ck(4))),
        );
        let right = ClusteringRange::new(
            Some(ClusteringBound::exclusive(ck(4))),
            Some(ClusteringBound::inclusive(ck(6))),
        );
        let merged = ClusteringRange::deoverlap(vec![right.clone(), left.clone()]);
        assert_eq!(vec![left, right], merged);
    }
}
