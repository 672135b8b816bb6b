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

//! Mutation source over a set of SSTables.
//!
//! Partitions are served in token order. The SSTables of one source must
//! not overlap in partitions; overlapping sets are rejected at reader
//! creation.

use std::collections::VecDeque;
use std::mem;

use async_trait::async_trait;
use store_api::metadata::{ColumnId, TableMetadataRef};
use store_api::storage::{ClusteringBound, ClusteringRange, PartitionRange, PartitionSlice};

use crate::access::AccessLayerRef;
use crate::error::{InternalInvariantSnafu, Result};
use crate::read::{
    Cell, FastForwardTo, FragmentReader, FragmentSource, MutationFragment, MutationSource,
    PartitionForwarding, RangeForwarding, RangeTombstone, StaticRow, TraceState,
};
use crate::semaphore::ReaderPermit;
use crate::sst::file::SsTableRef;
use crate::sst::index::PartitionIndexEntry;
use crate::sst::reader::{Cursor, MarkerPairer, PartitionDecoder, Unfiltered};
use crate::sst::reverse::PartitionReversingSource;

/// A mutation source over immutable SSTables.
pub struct SsTableSource {
    access: AccessLayerRef,
    sstables: Vec<SsTableRef>,
    initial_read_size: u64,
    max_read_size: u64,
}

impl SsTableSource {
    pub fn new(access: AccessLayerRef, sstables: Vec<SsTableRef>) -> SsTableSource {
        SsTableSource {
            access,
            sstables,
            initial_read_size: 4 * 1024,
            max_read_size: 128 * 1024,
        }
    }

    /// Sets the reverse read cache growth bounds.
    pub fn with_read_sizes(mut self, initial: u64, max: u64) -> SsTableSource {
        self.initial_read_size = initial.max(1);
        self.max_read_size = max.max(initial);
        self
    }
}

impl MutationSource for SsTableSource {
    fn make_reader(
        &self,
        metadata: TableMetadataRef,
        permit: ReaderPermit,
        range: &PartitionRange,
        slice: &PartitionSlice,
        trace: Option<&TraceState>,
        partition_fwd: PartitionForwarding,
        _range_fwd: RangeForwarding,
    ) -> Result<FragmentReader> {
        if slice.is_reversed() && partition_fwd == PartitionForwarding::Yes {
            return InternalInvariantSnafu {
                reason: "reversed slices do not support partition forwarding",
            }
            .fail();
        }

        let queue = collect_partitions(&self.sstables, range)?;
        if let Some(trace) = trace {
            trace.trace(&format!(
                "make sstable reader, sstables: {}, partitions: {}",
                self.sstables.len(),
                queue.len()
            ));
        }
        let source = SstFragmentSource {
            access: self.access.clone(),
            metadata: metadata.clone(),
            sstables: self.sstables.clone(),
            slice: slice.clone(),
            queue,
            progress: PartitionProgress::None,
            window: None,
            initial_read_size: self.initial_read_size,
            max_read_size: self.max_read_size,
        };
        Ok(FragmentReader::new(metadata, permit, Box::new(source)))
    }
}

/// Collects the partitions of `sstables` inside `range`, in token order.
fn collect_partitions(
    sstables: &[SsTableRef],
    range: &PartitionRange,
) -> Result<VecDeque<(String, PartitionIndexEntry)>> {
    let mut entries: Vec<(String, PartitionIndexEntry)> = Vec::new();
    for sst in sstables {
        for entry in &sst.index.entries {
            if range.contains(&entry.key) {
                entries.push((sst.data_path.clone(), entry.clone()));
            }
        }
    }
    entries.sort_by(|a, b| a.1.key.cmp(&b.1.key));
    for pair in entries.windows(2) {
        if pair[0].1.key == pair[1].1.key {
            return InternalInvariantSnafu {
                reason: format!(
                    "partition {:?} appears in multiple sstables of one source",
                    pair[0].1.key
                ),
            }
            .fail();
        }
    }
    Ok(entries.into())
}

/// Streaming state of the current reversed partition.
struct ReverseProgress {
    source: Box<PartitionReversingSource>,
    pairer: MarkerPairer,
    path: String,
    header_done: bool,
}

enum PartitionProgress {
    /// Between partitions.
    None,
    /// Decoded fragments of the current forward partition.
    Forward(VecDeque<MutationFragment>),
    /// Streaming the current partition in reverse.
    Reverse(ReverseProgress),
}

struct SstFragmentSource {
    access: AccessLayerRef,
    metadata: TableMetadataRef,
    sstables: Vec<SsTableRef>,
    slice: PartitionSlice,
    queue: VecDeque<(String, PartitionIndexEntry)>,
    progress: PartitionProgress,
    /// Clustering filter of the current partition: the slice's covering
    /// range for reversed reads, or a fast forward window.
    window: Option<ClusteringRange>,
    initial_read_size: u64,
    max_read_size: u64,
}

impl SstFragmentSource {
    fn wants_static(&self) -> bool {
        !self.slice.static_columns.is_empty() || self.slice.options.always_return_static_content
    }

    fn in_window(&self, fragment: &MutationFragment) -> bool {
        let Some(window) = &self.window else {
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

    /// Starts the next queued partition. Returns false when exhausted.
    async fn start_partition(&mut self) -> Result<bool> {
        let Some((path, entry)) = self.queue.pop_front() else {
            return Ok(false);
        };
        if self.slice.is_reversed() {
            let mut source = PartitionReversingSource::new(
                self.access.clone(),
                path.clone(),
                self.metadata.clone(),
                entry.clone(),
                self.initial_read_size,
                self.max_read_size,
            );
            // Rows beyond the highest selected clustering position are
            // skipped through the index end cursor.
            if let Some(bound) = highest_end_bound(self.slice.ranges_for(&entry.key.key)) {
                source.index_mut().advance_upper_bound(&bound.key);
            }
            self.progress = PartitionProgress::Reverse(ReverseProgress {
                source: Box::new(source),
                pairer: MarkerPairer::default(),
                path,
                header_done: false,
            });
        } else {
            let fragments = self.decode_forward(&path, &entry).await?;
            self.progress = PartitionProgress::Forward(fragments);
        }
        Ok(true)
    }

    /// Reads and decodes one whole partition for a forward scan.
    async fn decode_forward(
        &self,
        path: &str,
        entry: &PartitionIndexEntry,
    ) -> Result<VecDeque<MutationFragment>> {
        let bytes = self
            .access
            .read_range(path, entry.offset, entry.offset + entry.len)
            .await?;
        let decoder = PartitionDecoder::new(self.metadata.clone());
        let mut cursor = Cursor::new(&bytes, path);

        let (partition_start, static_row) = decoder.decode_header(&mut cursor)?;
        let ranges = self.slice.ranges_for(&partition_start.key.key).to_vec();

        let mut fragments = VecDeque::new();
        fragments.push_back(MutationFragment::PartitionStart(partition_start));
        if let Some(static_row) = static_row.filter(|_| self.wants_static()) {
            let cells = project_cells(&static_row.cells, &self.slice.static_columns);
            if !cells.is_empty() {
                fragments.push_back(MutationFragment::StaticRow(StaticRow::new(cells)));
            }
        }

        let mut pairer = MarkerPairer::default();
        loop {
            match decoder.decode_unfiltered(&mut cursor)? {
                Unfiltered::Row(mut row) => {
                    if ranges.iter().any(|r| r.contains(&row.key)) {
                        row.cells = project_cells(&row.cells, &self.slice.regular_columns);
                        fragments.push_back(MutationFragment::ClusteringRow(row));
                    }
                }
                Unfiltered::Marker(marker) => {
                    if let Some(rt) = pairer.on_marker(marker, path)? {
                        if tombstone_selected(&rt, &ranges) {
                            fragments.push_back(MutationFragment::RangeTombstone(rt));
                        }
                    }
                }
                Unfiltered::EndOfPartition => break,
            }
        }
        fragments.push_back(MutationFragment::PartitionEnd);
        Ok(fragments)
    }

    /// Advances the current reversed partition by one step. Returns the
    /// decoded fragments and the state to continue with, if any.
    async fn advance_reversed(
        &mut self,
        mut state: ReverseProgress,
    ) -> Result<(Vec<MutationFragment>, Option<ReverseProgress>)> {
        let decoder = PartitionDecoder::new(self.metadata.clone());

        if !state.header_done {
            let buffer = state.source.get().await?;
            let mut cursor = Cursor::new(&buffer, &state.path);
            let (partition_start, static_row) = decoder.decode_header(&mut cursor)?;
            state.header_done = true;

            let key = partition_start.key.key.clone();
            let mut out = Vec::new();
            out.push(MutationFragment::PartitionStart(partition_start));
            if let Some(static_row) = static_row.filter(|_| self.wants_static()) {
                let cells = project_cells(&static_row.cells, &self.slice.static_columns);
                if !cells.is_empty() {
                    out.push(MutationFragment::StaticRow(StaticRow::new(cells)));
                }
            }
            if self.window.is_none() {
                self.window = collapse_ranges(self.slice.ranges_for(&key));
            }
            return Ok((out, Some(state)));
        }

        loop {
            let buffer = state.source.get().await?;
            if buffer.is_empty() {
                return Ok((Vec::new(), None));
            }
            let mut cursor = Cursor::new(&buffer, &state.path);
            match decoder.decode_unfiltered(&mut cursor)? {
                Unfiltered::Row(mut row) => {
                    row.cells = project_cells(&row.cells, &self.slice.regular_columns);
                    return Ok((
                        vec![MutationFragment::ClusteringRow(row)],
                        Some(state),
                    ));
                }
                Unfiltered::Marker(marker) => {
                    if let Some(rt) = state.pairer.on_marker(marker, &state.path)? {
                        return Ok((
                            vec![MutationFragment::RangeTombstone(rt)],
                            Some(state),
                        ));
                    }
                }
                Unfiltered::EndOfPartition => {
                    return Ok((vec![MutationFragment::PartitionEnd], None));
                }
            }
        }
    }
}

#[async_trait]
impl FragmentSource for SstFragmentSource {
    fn metadata(&self) -> &TableMetadataRef {
        &self.metadata
    }

    async fn fill_buffer(&mut self, buffer: &mut VecDeque<MutationFragment>) -> Result<bool> {
        loop {
            match mem::replace(&mut self.progress, PartitionProgress::None) {
                PartitionProgress::None => {
                    if !self.start_partition().await? {
                        return Ok(true);
                    }
                }
                PartitionProgress::Forward(mut pending) => {
                    let mut partition_done = false;
                    while let Some(fragment) = pending.pop_front() {
                        let end = fragment.is_partition_end();
                        if self.in_window(&fragment) {
                            buffer.push_back(fragment);
                        }
                        if end {
                            partition_done = true;
                            break;
                        }
                    }
                    if partition_done || pending.is_empty() {
                        self.window = None;
                    } else {
                        self.progress = PartitionProgress::Forward(pending);
                    }
                    if !buffer.is_empty() {
                        return Ok(self.queue.is_empty()
                            && matches!(self.progress, PartitionProgress::None));
                    }
                }
                PartitionProgress::Reverse(state) => {
                    let (fragments, next) = self.advance_reversed(state).await?;
                    let partition_done = next.is_none();
                    if let Some(next) = next {
                        self.progress = PartitionProgress::Reverse(next);
                    } else {
                        self.window = None;
                    }
                    let mut produced = false;
                    for fragment in fragments {
                        if self.in_window(&fragment) {
                            buffer.push_back(fragment);
                            produced = true;
                        }
                    }
                    if produced {
                        return Ok(partition_done && self.queue.is_empty());
                    }
                }
            }
        }
    }

    async fn next_partition(&mut self) -> Result<()> {
        self.progress = PartitionProgress::None;
        self.window = None;
        Ok(())
    }

    async fn fast_forward_to(&mut self, target: FastForwardTo) -> Result<()> {
        match target {
            FastForwardTo::Clustering(range) => {
                self.window = Some(range);
            }
            FastForwardTo::Partitions(range) => {
                self.queue = collect_partitions(&self.sstables, &range)?;
                self.progress = PartitionProgress::None;
                self.window = None;
            }
        }
        Ok(())
    }
}

fn project_cells(cells: &[Cell], columns: &[ColumnId]) -> Vec<Cell> {
    cells
        .iter()
        .filter(|c| columns.contains(&c.column_id))
        .cloned()
        .collect()
}

/// The highest end bound across `ranges`, or `None` when any range is open
/// ended upwards.
fn highest_end_bound(ranges: &[ClusteringRange]) -> Option<ClusteringBound> {
    let mut highest: Option<ClusteringBound> = None;
    for range in ranges {
        let bound = range.end.as_ref()?;
        match &highest {
            Some(current) if current.key >= bound.key => {}
            _ => highest = Some(bound.clone()),
        }
    }
    highest
}

/// Collapses the selected ranges into one covering window for filtering a
/// reversed partition, or `None` when everything is selected.
fn collapse_ranges(ranges: &[ClusteringRange]) -> Option<ClusteringRange> {
    if ranges.len() == 1 {
        let only = &ranges[0];
        if only.start.is_none() && only.end.is_none() {
            return None;
        }
        return Some(only.clone());
    }
    let first = ranges.first()?;
    let last = ranges.last()?;
    Some(ClusteringRange::new(first.start.clone(), last.end.clone()))
}

/// Returns whether `rt` intersects any of `ranges`.
fn tombstone_selected(rt: &RangeTombstone, ranges: &[ClusteringRange]) -> bool {
    ranges.iter().any(|r| {
        r.contains(&rt.start.key)
            || r.contains(&rt.end.key)
            || r.start.as_ref().map(|b| rt.covers(&b.key)).unwrap_or(false)
            || r.end.as_ref().map(|b| rt.covers(&b.key)).unwrap_or(false)
    })
}
