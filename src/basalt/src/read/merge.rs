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

//! Merge reader implementation.
//!
//! Merges the partition streams of several readers into one stream in
//! global token order (or its reverse). One partition lives wholly in one
//! input, so the merge works at partition granularity: the node owning the
//! smallest next partition streams it to completion before the heap is
//! consulted again. Ties on token are broken by the full partition key;
//! equal keys in two inputs violate the non-overlap contract and fail the
//! read.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use common_telemetry::debug;
use store_api::metadata::TableMetadataRef;

use crate::error::{InternalInvariantSnafu, Result};
use crate::read::{FastForwardTo, FragmentReader, FragmentSource, MutationFragment};

/// Number of fragments one `fill_buffer` call produces.
const FILL_BATCH_SIZE: usize = 32;

/// Creates the input readers of a merge on first use.
#[async_trait]
pub trait ReaderFactory: Send {
    /// Creates the reader of input `tag`.
    async fn create_reader(&mut self, tag: u32) -> Result<FragmentReader>;
}

/// A factory over pre-built readers, for merges whose inputs already
/// exist.
pub struct PrebuiltReaders {
    readers: Vec<Option<FragmentReader>>,
}

impl PrebuiltReaders {
    pub fn new(readers: Vec<FragmentReader>) -> PrebuiltReaders {
        PrebuiltReaders {
            readers: readers.into_iter().map(Some).collect(),
        }
    }
}

#[async_trait]
impl ReaderFactory for PrebuiltReaders {
    async fn create_reader(&mut self, tag: u32) -> Result<FragmentReader> {
        self.readers
            .get_mut(tag as usize)
            .and_then(Option::take)
            .ok_or_else(|| {
                InternalInvariantSnafu {
                    reason: format!("input {tag} requested twice"),
                }
                .build()
            })
    }
}

/// Shared destination for the input readers once the merge is dropped.
///
/// The merge hands its inputs back here (with their pending partition
/// starts pushed back) so the owner can dismantle or save them.
#[derive(Clone, Default)]
pub struct ShardReaderSink {
    inner: Arc<Mutex<Vec<(u32, FragmentReader)>>>,
}

impl ShardReaderSink {
    pub fn new() -> ShardReaderSink {
        ShardReaderSink::default()
    }

    /// Takes the readers deposited so far.
    pub fn take(&self) -> Vec<(u32, FragmentReader)> {
        std::mem::take(&mut self.inner.lock().unwrap())
    }

    fn deposit(&self, tag: u32, reader: FragmentReader) {
        self.inner.lock().unwrap().push((tag, reader));
    }
}

/// An input whose next partition is known.
struct Node {
    tag: u32,
    reader: FragmentReader,
    /// The peeked partition start of the input's next partition.
    next_start: MutationFragment,
    descending: bool,
}

impl Node {
    fn key(&self) -> &store_api::storage::DecoratedKey {
        // Only partition starts are stored in `next_start`.
        &self.next_start.as_partition_start().unwrap().key
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Node) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Node {}

impl PartialOrd for Node {
    fn partial_cmp(&self, other: &Node) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Node {
    fn cmp(&self, other: &Node) -> Ordering {
        // The std binary heap is a max heap; reverse the comparison so the
        // smallest partition is popped first (or the largest when
        // descending).
        let ordering = other.key().cmp(self.key());
        if self.descending {
            ordering.reverse()
        } else {
            ordering
        }
    }
}

/// Local metrics of a merge.
#[derive(Debug, Default)]
struct Metrics {
    num_inputs: usize,
    num_partitions: usize,
    num_fragments: usize,
}

/// Fragment source merging the partition streams of its inputs.
pub struct MergingSource {
    metadata: TableMetadataRef,
    tags: Vec<u32>,
    factory: Box<dyn ReaderFactory>,
    heap: BinaryHeap<Node>,
    /// Node currently streaming its partition.
    current: Option<Node>,
    exhausted: Vec<(u32, FragmentReader)>,
    descending: bool,
    deadline: Instant,
    sink: ShardReaderSink,
    initialized: bool,
    metrics: Metrics,
}

impl MergingSource {
    pub fn new(
        metadata: TableMetadataRef,
        tags: Vec<u32>,
        factory: Box<dyn ReaderFactory>,
        descending: bool,
        deadline: Instant,
        sink: ShardReaderSink,
    ) -> MergingSource {
        MergingSource {
            metadata,
            tags,
            factory,
            heap: BinaryHeap::new(),
            current: None,
            exhausted: Vec::new(),
            descending,
            deadline,
            sink,
            initialized: false,
            metrics: Metrics::default(),
        }
    }

    /// Creates the input readers and primes the heap.
    async fn init(&mut self) -> Result<()> {
        self.initialized = true;
        self.metrics.num_inputs = self.tags.len();
        for tag in std::mem::take(&mut self.tags) {
            let mut reader = self.factory.create_reader(tag).await?;
            match reader.next_fragment(self.deadline).await? {
                Some(fragment) if fragment.is_partition_start() => {
                    self.heap.push(Node {
                        tag,
                        reader,
                        next_start: fragment,
                        descending: self.descending,
                    });
                }
                None => self.exhausted.push((tag, reader)),
                Some(fragment) => {
                    return InternalInvariantSnafu {
                        reason: format!(
                            "input {tag} started with {:?} instead of a partition start",
                            fragment.kind()
                        ),
                    }
                    .fail();
                }
            }
        }
        self.check_no_overlap()?;
        Ok(())
    }

    fn check_no_overlap(&self) -> Result<()> {
        let mut keys: Vec<_> = self.heap.iter().map(|node| node.key()).collect();
        keys.sort();
        for pair in keys.windows(2) {
            if pair[0] == pair[1] {
                return InternalInvariantSnafu {
                    reason: format!("partition {:?} found in two merge inputs", pair[0]),
                }
                .fail();
            }
        }
        Ok(())
    }

    /// Finishes the current node's partition bookkeeping and re-heaps it.
    async fn advance_current(&mut self, mut node: Node) -> Result<()> {
        match node.reader.next_fragment(self.deadline).await? {
            Some(fragment) if fragment.is_partition_start() => {
                node.next_start = fragment;
                self.heap.push(node);
                self.check_no_overlap()?;
            }
            None => self.exhausted.push((node.tag, node.reader)),
            Some(fragment) => {
                return InternalInvariantSnafu {
                    reason: format!(
                        "input {} continued with {:?} after a partition end",
                        node.tag,
                        fragment.kind()
                    ),
                }
                .fail();
            }
        }
        Ok(())
    }
}

impl Drop for MergingSource {
    fn drop(&mut self) {
        debug!("Merge source finished, metrics: {:?}", self.metrics);

        // Hand every input back with its pending partition start restored.
        for node in std::mem::take(&mut self.heap).into_sorted_vec() {
            let Node {
                tag,
                mut reader,
                next_start,
                ..
            } = node;
            reader.unpop_fragment(next_start);
            self.sink.deposit(tag, reader);
        }
        if let Some(Node { tag, reader, .. }) = self.current.take() {
            self.sink.deposit(tag, reader);
        }
        for (tag, reader) in std::mem::take(&mut self.exhausted) {
            self.sink.deposit(tag, reader);
        }
    }
}

#[async_trait]
impl FragmentSource for MergingSource {
    fn metadata(&self) -> &TableMetadataRef {
        &self.metadata
    }

    async fn fill_buffer(&mut self, buffer: &mut VecDeque<MutationFragment>) -> Result<bool> {
        if !self.initialized {
            self.init().await?;
        }

        let mut produced = 0;
        while produced < FILL_BATCH_SIZE {
            let mut node = match self.current.take() {
                Some(node) => node,
                None => {
                    let Some(mut node) = self.heap.pop() else {
                        return Ok(true);
                    };
                    // Entering a new partition: emit its start.
                    self.metrics.num_partitions += 1;
                    self.metrics.num_fragments += 1;
                    let start = std::mem::replace(
                        &mut node.next_start,
                        MutationFragment::PartitionEnd,
                    );
                    buffer.push_back(start);
                    produced += 1;
                    node
                }
            };

            let Some(fragment) = node.reader.next_fragment(self.deadline).await? else {
                // A partition must be closed before its input ends.
                return InternalInvariantSnafu {
                    reason: format!("input {} ended mid partition", node.tag),
                }
                .fail();
            };
            let end = fragment.is_partition_end();
            self.metrics.num_fragments += 1;
            buffer.push_back(fragment);
            produced += 1;
            if end {
                self.advance_current(node).await?;
            } else {
                self.current = Some(node);
            }
        }
        Ok(self.current.is_none() && self.heap.is_empty())
    }

    async fn next_partition(&mut self) -> Result<()> {
        if let Some(mut node) = self.current.take() {
            node.reader.next_partition();
            self.advance_current(node).await?;
        }
        Ok(())
    }

    async fn fast_forward_to(&mut self, _target: FastForwardTo) -> Result<()> {
        InternalInvariantSnafu {
            reason: "merge readers do not support fast forwarding",
        }
        .fail()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use store_api::storage::{PartitionKey, Value};

    use super::*;
    use crate::read::{FragmentKind, PartitionStart};
    use crate::semaphore::ReaderPermit;
    use crate::test_util::{collect_fragments, new_metadata, row_fragment, VecSource};

    fn far_deadline() -> Instant {
        Instant::now() + Duration::from_secs(60)
    }

    fn partition(p: i32, rows: &[i32]) -> Vec<MutationFragment> {
        let key = PartitionKey::new([Value::Int32(p)]).decorate();
        let mut fragments = vec![MutationFragment::PartitionStart(PartitionStart::new(key))];
        for c in rows {
            fragments.push(row_fragment(*c, "x"));
        }
        fragments.push(MutationFragment::PartitionEnd);
        fragments
    }

    fn reader_of(fragments: Vec<MutationFragment>) -> FragmentReader {
        FragmentReader::new(
            new_metadata(),
            ReaderPermit::untracked(),
            Box::new(VecSource::new(fragments)),
        )
    }

    fn merge_reader(
        inputs: Vec<Vec<MutationFragment>>,
        descending: bool,
        sink: ShardReaderSink,
    ) -> FragmentReader {
        let readers: Vec<_> = inputs.into_iter().map(reader_of).collect();
        let tags = (0..readers.len() as u32).collect();
        let source = MergingSource::new(
            new_metadata(),
            tags,
            Box::new(PrebuiltReaders::new(readers)),
            descending,
            far_deadline(),
            sink,
        );
        FragmentReader::new(new_metadata(), ReaderPermit::untracked(), Box::new(source))
    }

    #[tokio::test]
    async fn test_merge_empty() {
        let mut reader = merge_reader(Vec::new(), false, ShardReaderSink::new());
        assert!(reader.next_fragment(far_deadline()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_merge_orders_partitions_by_token() {
        let mut inputs = vec![Vec::new(), Vec::new()];
        // Distribute partitions over two inputs the way a sharder would;
        // each input is filled in token order.
        let mut expected: Vec<_> = (0..8)
            .map(|p| PartitionKey::new([Value::Int32(p)]).decorate())
            .collect();
        expected.sort();
        for key in &expected {
            let shard = (key.token.0 % 2) as usize;
            let Value::Int32(v) = key.key.values[0] else {
                unreachable!();
            };
            inputs[shard].extend(partition(v, &[1]));
        }

        let mut reader = merge_reader(inputs, false, ShardReaderSink::new());
        let fragments = collect_fragments(&mut reader, far_deadline()).await;
        let starts: Vec<_> = fragments
            .iter()
            .filter_map(|f| f.as_partition_start().map(|ps| ps.key.clone()))
            .collect();
        assert_eq!(expected, starts);
    }

    #[tokio::test]
    async fn test_merge_descending() {
        let mut inputs = vec![Vec::new(), Vec::new()];
        let mut keys: Vec<_> = (0..6)
            .map(|p| PartitionKey::new([Value::Int32(p)]).decorate())
            .collect();
        keys.sort();
        for key in &keys {
            let shard = (key.token.0 % 2) as usize;
            let Value::Int32(v) = key.key.values[0] else {
                unreachable!();
            };
            inputs[shard].extend(partition(v, &[1]));
        }
        // Each input itself must be descending for a reversed merge.
        inputs.iter_mut().for_each(|input| {
            let mut partitions: Vec<Vec<MutationFragment>> = Vec::new();
            for fragment in input.drain(..) {
                if fragment.is_partition_start() {
                    partitions.push(Vec::new());
                }
                partitions.last_mut().unwrap().push(fragment);
            }
            partitions.reverse();
            input.extend(partitions.into_iter().flatten());
        });
        keys.reverse();

        let mut reader = merge_reader(inputs, true, ShardReaderSink::new());
        let fragments = collect_fragments(&mut reader, far_deadline()).await;
        let starts: Vec<_> = fragments
            .iter()
            .filter_map(|f| f.as_partition_start().map(|ps| ps.key.clone()))
            .collect();
        assert_eq!(keys, starts);
    }

    #[tokio::test]
    async fn test_merge_rejects_overlap() {
        let inputs = vec![partition(1, &[1]), partition(1, &[2])];
        let mut reader = merge_reader(inputs, false, ShardReaderSink::new());
        let err = reader.next_fragment(far_deadline()).await.unwrap_err();
        assert!(err.to_string().contains("two merge inputs"));
    }

    #[tokio::test]
    async fn test_drop_returns_readers_to_sink() {
        let sink = ShardReaderSink::new();
        let inputs = vec![partition(1, &[1, 2]), partition(2, &[3])];
        let mut reader = merge_reader(inputs, false, sink.clone());

        // Consume only the first fragments, then drop the merge.
        reader.next_fragment(far_deadline()).await.unwrap();
        drop(reader);

        let mut returned = sink.take();
        returned.sort_by_key(|(tag, _)| *tag);
        assert_eq!(2, returned.len());
        // The input that was not being streamed still has its whole
        // partition, starting with the unpopped partition start.
        let mut starts = 0;
        for (_, reader) in &mut returned {
            let fragments = collect_fragments(reader, far_deadline()).await;
            starts += fragments
                .iter()
                .filter(|f| f.kind() == FragmentKind::PartitionStart)
                .count();
        }
        assert_eq!(1, starts);
    }
}
