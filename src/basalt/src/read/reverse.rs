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

//! Adapter turning a forward fragment stream into a reversed one.
//!
//! Buffers one partition at a time: the partition's clustering rows and
//! range tombstones are re-emitted in reverse clustering order with
//! tombstone bounds swapped. Sources that reverse natively (the SSTable
//! reversing data source) do not need it; the memtable path does.

use std::collections::VecDeque;

use async_trait::async_trait;
use store_api::metadata::TableMetadataRef;

use crate::error::{InternalInvariantSnafu, Result};
use crate::read::{FastForwardTo, FragmentSource, MutationFragment};

/// Fragment source emitting each partition of an underlying forward
/// source in reverse clustering order.
pub struct ReversingSource {
    inner: Box<dyn FragmentSource>,
    /// Forward fragments pulled past the current partition's end.
    carry: VecDeque<MutationFragment>,
    /// The reversed fragments of the current partition, ready to emit.
    pending: VecDeque<MutationFragment>,
    inner_done: bool,
}

impl ReversingSource {
    pub fn new(inner: Box<dyn FragmentSource>) -> ReversingSource {
        ReversingSource {
            inner,
            carry: VecDeque::new(),
            pending: VecDeque::new(),
            inner_done: false,
        }
    }

    /// Buffers the next partition of the inner source, reversed, into
    /// `pending`. Returns false when the inner source is exhausted.
    async fn buffer_partition(&mut self) -> Result<bool> {
        debug_assert!(self.pending.is_empty());
        let mut forward = VecDeque::new();
        let mut saw_end = false;

        while let Some(fragment) = self.carry.pop_front() {
            let end = fragment.is_partition_end();
            forward.push_back(fragment);
            if end {
                saw_end = true;
                break;
            }
        }
        while !saw_end && !self.inner_done {
            let mut chunk = VecDeque::new();
            self.inner_done = self.inner.fill_buffer(&mut chunk).await?;
            while let Some(fragment) = chunk.pop_front() {
                let end = fragment.is_partition_end();
                forward.push_back(fragment);
                if end {
                    // Fragments past the end belong to the next partition.
                    self.carry.append(&mut chunk);
                    saw_end = true;
                    break;
                }
            }
        }

        if forward.is_empty() {
            return Ok(false);
        }

        // Header fragments keep their order, the rest is reversed with
        // tombstone bounds swapped.
        let mut reversed = VecDeque::with_capacity(forward.len());
        let mut tail = Vec::new();
        for fragment in forward {
            match fragment {
                MutationFragment::PartitionStart(_) | MutationFragment::StaticRow(_) => {
                    reversed.push_back(fragment)
                }
                MutationFragment::PartitionEnd => {}
                MutationFragment::RangeTombstone(rt) => {
                    tail.push(MutationFragment::RangeTombstone(rt.reversed()))
                }
                other => tail.push(other),
            }
        }
        reversed.extend(tail.into_iter().rev());
        reversed.push_back(MutationFragment::PartitionEnd);
        self.pending = reversed;
        Ok(true)
    }
}

#[async_trait]
impl FragmentSource for ReversingSource {
    fn metadata(&self) -> &TableMetadataRef {
        self.inner.metadata()
    }

    async fn fill_buffer(&mut self, buffer: &mut VecDeque<MutationFragment>) -> Result<bool> {
        if self.pending.is_empty() && !self.buffer_partition().await? {
            return Ok(true);
        }
        buffer.append(&mut self.pending);
        Ok(self.carry.is_empty() && self.inner_done)
    }

    async fn next_partition(&mut self) -> Result<()> {
        if !self.pending.is_empty() {
            // The buffered partition is the current one.
            self.pending.clear();
            return Ok(());
        }
        // Carried fragments are an unfinished prefix of the partition the
        // inner source is positioned in.
        self.carry.clear();
        self.inner.next_partition().await
    }

    async fn fast_forward_to(&mut self, target: FastForwardTo) -> Result<()> {
        match target {
            FastForwardTo::Clustering(_) => InternalInvariantSnafu {
                reason: "reversed slices do not support partition forwarding",
            }
            .fail(),
            FastForwardTo::Partitions(range) => {
                self.pending.clear();
                self.carry.clear();
                self.inner_done = false;
                self.inner
                    .fast_forward_to(FastForwardTo::Partitions(range))
                    .await
            }
        }
    }
}
