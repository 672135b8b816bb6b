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

//! Multishard reads.
//!
//! A [ReadContext] coordinates one page of a read that spans every shard.
//! It looks up suspended shard readers at the start of the page, creates
//! fresh ones for the combining reader as needed, and at the end of the
//! page dismantles the combined buffer back into per-shard buffers and
//! parks each surviving reader in its shard's querier cache.
//!
//! A failure to save or stop a shard reader never fails the page: the
//! fragments already returned are valid, only the resumption of that shard
//! is lost. Such failures are counted instead.

use std::collections::VecDeque;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use common_telemetry::{debug, warn};
use futures::future;
use store_api::metadata::TableMetadataRef;
use store_api::storage::{
    ClusteringKey, DecoratedKey, PartitionRange, PartitionSlice, ReadCommand, ShardId,
};

use crate::error::{InternalInvariantSnafu, Result};
use crate::metrics::{
    MULTISHARD_FAILED_READER_SAVES, MULTISHARD_FAILED_READER_STOPS, MULTISHARD_TOTAL_READS,
    MULTISHARD_TOTAL_READS_FAILED, MULTISHARD_UNPOPPED_BYTES, MULTISHARD_UNPOPPED_FRAGMENTS,
    SHORT_MUTATION_QUERIES,
};
use crate::querier::ShardMutationQuerier;
use crate::read::compact::{consume_page, CompactionState, DetachedCompactionState};
use crate::read::merge::{MergingSource, ReaderFactory, ShardReaderSink};
use crate::read::result::{MutationResult, MutationResultBuilder};
use crate::read::{
    FragmentReader, MutationFragment, PartitionForwarding, RangeForwarding, TraceState,
};
use crate::semaphore::{InactiveHandle, ReaderPermit};
use crate::shard::{OperationGuard, ShardGroupRef};

/// Per-group counters of the multishard read path.
#[derive(Debug, Default)]
pub struct MultishardStats {
    pub total_reads: AtomicU64,
    pub total_reads_failed: AtomicU64,
    pub short_mutation_queries: AtomicU64,
    pub failed_reader_saves: AtomicU64,
    pub failed_reader_stops: AtomicU64,
    pub unpopped_fragments: AtomicU64,
    pub unpopped_bytes: AtomicU64,
}

/// The parts of a shard reader owned by its shard.
struct RemoteParts {
    permit: ReaderPermit,
    range: PartitionRange,
    slice: PartitionSlice,
    /// Keeps the table's data referenced while the read is in progress.
    read_guard: Option<OperationGuard>,
}

/// Per-shard reader state machine.
///
/// ```text
///              ( )    (O)
///               |      ^
///               |      |
///         +--- Inexistent ---+
///         |                  |
/// lookup  |           create |
///         |                  |
///  SuccessfulLookup          |
///     |         |            |
///     |         |   create   |
///     |         +---------> Used
///save |                      |
///     |              destroy |
///     |                      |
///     +-----------------> Saving --- save / stop ---> (O)
/// ```
enum ReaderState {
    Inexistent,
    SuccessfulLookup {
        parts: RemoteParts,
        handle: InactiveHandle,
    },
    Used {
        parts: RemoteParts,
    },
    Saving {
        parts: RemoteParts,
        handle: InactiveHandle,
        has_pending_next_partition: bool,
        buffer: VecDeque<MutationFragment>,
    },
}

impl ReaderState {
    fn name(&self) -> &'static str {
        match self {
            ReaderState::Inexistent => "inexistent",
            ReaderState::SuccessfulLookup { .. } => "successful_lookup",
            ReaderState::Used { .. } => "used",
            ReaderState::Saving { .. } => "saving",
        }
    }
}

/// Bookkeeping of one dismantling pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DismantleStats {
    pub partitions: usize,
    pub fragments: usize,
    pub bytes: usize,
    pub discarded_partitions: usize,
    pub discarded_fragments: usize,
    pub discarded_bytes: usize,
}

impl DismantleStats {
    fn add(&mut self, fragment: &MutationFragment) {
        self.partitions += usize::from(fragment.is_partition_start());
        self.fragments += 1;
        self.bytes += fragment.memory_usage();
    }

    fn add_discarded(&mut self, fragment: &MutationFragment) {
        self.discarded_partitions += usize::from(fragment.is_partition_start());
        self.discarded_fragments += 1;
        self.discarded_bytes += fragment.memory_usage();
    }
}

/// Context object for one page of a multishard read.
///
/// Intended usage, each step only after the previous finished:
/// create, `lookup_readers`, run the combining read, `destroy_reader` for
/// every shard reader handed back, `save_readers` if more pages are
/// expected, `stop`.
pub struct ReadContext {
    group: ShardGroupRef,
    metadata: TableMetadataRef,
    cmd: ReadCommand,
    ranges: Vec<PartitionRange>,
    trace: Option<TraceState>,
    /// One state machine per shard, indexed by shard id.
    readers: Vec<Mutex<ReaderState>>,
    /// Dismantling barrier: `save_readers` and `stop` wait for every
    /// `destroy_reader` that began before them.
    dismantling: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl ReadContext {
    pub fn new(
        group: ShardGroupRef,
        metadata: TableMetadataRef,
        cmd: ReadCommand,
        ranges: Vec<PartitionRange>,
        trace: Option<TraceState>,
    ) -> Arc<ReadContext> {
        let readers = (0..group.shard_count())
            .map(|_| Mutex::new(ReaderState::Inexistent))
            .collect();
        Arc::new(ReadContext {
            group,
            metadata,
            cmd,
            ranges,
            trace,
            readers,
            dismantling: Mutex::new(Vec::new()),
        })
    }

    fn stats(&self) -> &MultishardStats {
        self.group.multishard_stats()
    }

    fn take_state(&self, shard: ShardId) -> ReaderState {
        mem::replace(
            &mut *self.readers[shard as usize].lock().unwrap(),
            ReaderState::Inexistent,
        )
    }

    /// Finds saved readers from the previous page, in parallel on every
    /// shard. Hits are parked as inactive handles until the combining
    /// reader resumes them.
    pub async fn lookup_readers(&self) -> Result<()> {
        let Some(key) = self.cmd.query_id else {
            return Ok(());
        };
        if self.cmd.is_first_page {
            return Ok(());
        }

        let lookups = (0..self.group.shard_count()).map(|shard| {
            let metadata = self.metadata.clone();
            let ranges = self.ranges.clone();
            let slice = self.cmd.slice.clone();
            let table_id = self.cmd.table_id;
            let trace = self.trace.clone();
            async move {
                let outcome = self
                    .group
                    .invoke_on(shard, move |state| {
                        let querier = state.querier_cache.lookup_shard_mutation_querier(
                            key,
                            &metadata,
                            &ranges,
                            &slice,
                            trace.as_ref(),
                        );
                        let Some(querier) = querier else {
                            return Ok(None);
                        };
                        if let Some(semaphore) = querier.permit().semaphore() {
                            if !semaphore.is_same(&state.semaphore) {
                                return InternalInvariantSnafu {
                                    reason: format!(
                                        "looked-up reader belongs to semaphore {} instead of {}",
                                        semaphore.name(),
                                        state.semaphore.name()
                                    ),
                                }
                                .fail();
                            }
                        }
                        let table = state.find_table(table_id)?;
                        let read_guard = table.read_in_progress();
                        let (range, slice, reader, permit) = querier.into_reader_parts();
                        let handle = state.semaphore.register_inactive(reader, None);
                        Ok(Some((permit, range, slice, read_guard, handle)))
                    })
                    .await??;
                Ok::<_, crate::error::Error>((shard, outcome))
            }
        });

        for (shard, outcome) in future::try_join_all(lookups).await? {
            let state = match outcome {
                Some((permit, range, slice, read_guard, handle)) => ReaderState::SuccessfulLookup {
                    parts: RemoteParts {
                        permit,
                        range,
                        slice,
                        read_guard: Some(read_guard),
                    },
                    handle,
                },
                None => ReaderState::Inexistent,
            };
            *self.readers[shard as usize].lock().unwrap() = state;
        }
        Ok(())
    }

    /// Creates (or resumes) the reader of `shard` for the combining
    /// reader.
    pub async fn create_reader(&self, shard: ShardId) -> Result<FragmentReader> {
        let state = self.take_state(shard);
        let existing_permit = match state {
            ReaderState::Saving { .. } => {
                let name = state.name();
                *self.readers[shard as usize].lock().unwrap() = state;
                warn!(
                    "Unexpected request to create reader for shard {}. The reader is expected \
                     to be in either `used`, `successful_lookup` or `inexistent` state, but is \
                     in `{}` state instead",
                    shard, name
                );
                return InternalInvariantSnafu {
                    reason: format!("reader of shard {shard} created while in state {name}"),
                }
                .fail();
            }
            ReaderState::SuccessfulLookup { parts, handle } => {
                let reader = self
                    .group
                    .invoke_on(shard, move |state| state.semaphore.try_resume(handle))
                    .await?;
                if let Some(reader) = reader {
                    *self.readers[shard as usize].lock().unwrap() = ReaderState::Used { parts };
                    return Ok(reader);
                }
                // Evicted while parked; build a fresh reader reusing the
                // looked-up permit.
                Some(parts.permit)
            }
            // A repeated creation reuses the shard's permit.
            ReaderState::Used { parts } => Some(parts.permit),
            ReaderState::Inexistent => None,
        };

        let metadata = self.metadata.clone();
        let table_id = self.cmd.table_id;
        let range = reading_envelope(&self.ranges);
        let slice = self.cmd.slice.clone();
        let trace = self.trace.clone();
        let (reader, parts) = self
            .group
            .invoke_on(shard, move |state| {
                let table = state.find_table(table_id)?;
                let permit = match existing_permit {
                    Some(permit) => permit,
                    None => state.semaphore.make_permit()?,
                };
                let read_guard = table.read_in_progress();
                let source = table.as_mutation_source(&state.access);
                let reader = source.make_reader(
                    metadata,
                    permit.clone(),
                    &range,
                    &slice,
                    trace.as_ref(),
                    PartitionForwarding::No,
                    RangeForwarding::Yes,
                )?;
                Ok::<_, crate::error::Error>((
                    reader,
                    RemoteParts {
                        permit,
                        range,
                        slice,
                        read_guard: Some(read_guard),
                    },
                ))
            })
            .await??;

        *self.readers[shard as usize].lock().unwrap() = ReaderState::Used { parts };
        Ok(reader)
    }

    /// Called when the combining reader stops using a shard's reader:
    /// parks the reader on its owning shard and captures its unconsumed
    /// buffer, behind the dismantling barrier.
    pub fn destroy_reader(
        self: &Arc<Self>,
        shard: ShardId,
        reader_result: Result<FragmentReader>,
    ) {
        let ctx = self.clone();
        let handle = tokio::spawn(async move {
            let mut reader = match reader_result {
                Ok(reader) => reader,
                Err(error) => {
                    debug!("Failed to stop reader on shard {}: {}", shard, error);
                    ctx.stats().failed_reader_stops.fetch_add(1, Ordering::Relaxed);
                    MULTISHARD_FAILED_READER_STOPS.inc();
                    *ctx.readers[shard as usize].lock().unwrap() = ReaderState::Inexistent;
                    return;
                }
            };

            let has_pending_next_partition = reader.has_pending_next_partition();
            let buffer = reader.detach_buffer();
            let parked = ctx
                .group
                .invoke_on(shard, move |state| {
                    state.semaphore.register_inactive(reader, None)
                })
                .await;
            let handle = match parked {
                Ok(handle) => handle,
                Err(error) => {
                    debug!("Failed to stop reader on shard {}: {}", shard, error);
                    ctx.stats().failed_reader_stops.fetch_add(1, Ordering::Relaxed);
                    MULTISHARD_FAILED_READER_STOPS.inc();
                    *ctx.readers[shard as usize].lock().unwrap() = ReaderState::Inexistent;
                    return;
                }
            };

            let state = ctx.take_state(shard);
            match state {
                ReaderState::Used { parts } => {
                    *ctx.readers[shard as usize].lock().unwrap() = ReaderState::Saving {
                        parts,
                        handle,
                        has_pending_next_partition,
                        buffer,
                    };
                }
                other => {
                    warn!(
                        "Unexpected request to dismantle reader in state `{}` for shard {}. \
                         Reader was not created nor is in the process of being created",
                        other.name(),
                        shard
                    );
                    *ctx.readers[shard as usize].lock().unwrap() = other;
                    let _ = ctx
                        .group
                        .invoke_on(shard, move |state| {
                            state.semaphore.unregister_inactive_read(handle)
                        })
                        .await;
                }
            }
        });
        self.dismantling.lock().unwrap().push(handle);
    }

    /// Closes the dismantling barrier.
    async fn close_barrier(&self) {
        let handles = mem::take(&mut *self.dismantling.lock().unwrap());
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Saves the readers of every shard still holding one, dismantling the
    /// combined buffer and the compaction state back to their owners
    /// first. Failures are swallowed: only resumption is lost.
    pub async fn save_readers(
        &self,
        combined_buffer: VecDeque<MutationFragment>,
        compaction_state: Option<DetachedCompactionState>,
        last_ckey: Option<ClusteringKey>,
    ) {
        let Some(key) = self.cmd.query_id else {
            return;
        };
        self.close_barrier().await;

        let Some(compaction_state) = compaction_state else {
            // The page stopped at a partition boundary; there is no
            // partition to hand back and no nominal position to save at.
            return;
        };
        let last_pkey = compaction_state.partition_start.key.clone();

        let buffer_stats = self.dismantle_combined_buffer(combined_buffer, &last_pkey);
        if let Some(trace) = &self.trace {
            trace.trace(&format!("dismantled combined buffer: {buffer_stats:?}"));
        }
        debug!("Dismantled combined buffer: {:?}", buffer_stats);

        let state_stats = self.dismantle_compaction_state(compaction_state);
        if let Some(trace) = &self.trace {
            trace.trace(&format!("dismantled compaction state: {state_stats:?}"));
        }
        debug!("Dismantled compaction state: {:?}", state_stats);

        let saves = (0..self.group.shard_count()).filter_map(|shard| {
            let state = self.readers[shard as usize].lock().unwrap();
            matches!(
                &*state,
                ReaderState::SuccessfulLookup { .. } | ReaderState::Saving { .. }
            )
            .then(|| self.save_reader(shard, key, last_pkey.clone(), last_ckey.clone()))
        });
        future::join_all(saves).await;
    }

    /// Parks one shard's reader in its local querier cache, with the
    /// unconsumed fragments pushed back in reverse so they reappear in
    /// original order.
    async fn save_reader(
        &self,
        shard: ShardId,
        key: uuid::Uuid,
        last_pkey: DecoratedKey,
        last_ckey: Option<ClusteringKey>,
    ) {
        let (parts, handle, has_pending_next_partition, buffer) = match self.take_state(shard) {
            ReaderState::Saving {
                parts,
                handle,
                has_pending_next_partition,
                buffer,
            } => (parts, handle, has_pending_next_partition, buffer),
            ReaderState::SuccessfulLookup { parts, handle } => {
                (parts, handle, false, VecDeque::new())
            }
            // Checked by the caller.
            _ => return,
        };

        let query_ranges = self.ranges.clone();
        let trace = self.trace.clone();
        let saved = self
            .group
            .invoke_on(shard, move |state| {
                let Some(mut reader) = state.semaphore.try_resume(handle) else {
                    // Evicted while parked; nothing left to save.
                    return Ok((0u64, 0u64));
                };
                if has_pending_next_partition {
                    reader.next_partition();
                }

                let fragments = buffer.len() as u64;
                let size_before = reader.buffer_size();
                for fragment in buffer.into_iter().rev() {
                    reader.unpop_fragment(fragment);
                }
                let size_after = reader.buffer_size();

                let querier = ShardMutationQuerier::new(
                    query_ranges,
                    parts.range,
                    parts.slice,
                    reader,
                    parts.permit,
                    last_pkey,
                    last_ckey,
                );
                state
                    .querier_cache
                    .insert_shard_mutation_querier(key, querier, trace.as_ref());
                drop(parts.read_guard);
                Ok::<_, crate::error::Error>((fragments, (size_after - size_before) as u64))
            })
            .await
            .and_then(|inner| inner);

        match saved {
            Ok((fragments, bytes)) => {
                self.stats()
                    .unpopped_fragments
                    .fetch_add(fragments, Ordering::Relaxed);
                self.stats().unpopped_bytes.fetch_add(bytes, Ordering::Relaxed);
                MULTISHARD_UNPOPPED_FRAGMENTS.inc_by(fragments);
                MULTISHARD_UNPOPPED_BYTES.inc_by(bytes);
            }
            Err(error) => {
                // We don't want to fail a read just because of a failure
                // to save any of the readers.
                debug!("Failed to save reader on shard {}: {}", shard, error);
                self.stats().failed_reader_saves.fetch_add(1, Ordering::Relaxed);
                MULTISHARD_FAILED_READER_SAVES.inc();
            }
        }
    }

    /// Splits the combined buffer back into per-shard buffers by the
    /// token of each partition's key.
    ///
    /// The scan runs in reverse so the accumulated tail of each partition
    /// can be front-pushed into its shard's buffer in original order with
    /// a single pass. Partitions whose reader is gone (failed stop or
    /// evicted) are discarded.
    fn dismantle_combined_buffer(
        &self,
        combined_buffer: VecDeque<MutationFragment>,
        last_pkey: &DecoratedKey,
    ) -> DismantleStats {
        let sharder = self.group.sharder();
        let mut stats = DismantleStats::default();
        let mut tmp: Vec<MutationFragment> = Vec::new();

        for fragment in combined_buffer.into_iter().rev() {
            if !fragment.is_partition_start() {
                tmp.push(fragment);
                continue;
            }
            let key = &fragment.as_partition_start().unwrap().key;
            let shard = sharder.shard_of(key.token);
            let mut state = self.readers[shard as usize].lock().unwrap();
            match &mut *state {
                ReaderState::Saving { buffer, .. } => {
                    for tail_fragment in tmp.drain(..) {
                        stats.add(&tail_fragment);
                        buffer.push_front(tail_fragment);
                    }
                    stats.add(&fragment);
                    buffer.push_front(fragment);
                }
                _ => {
                    for tail_fragment in tmp.drain(..) {
                        stats.add_discarded(&tail_fragment);
                    }
                    stats.add_discarded(&fragment);
                }
            }
        }

        // Leftover fragments belong to the partition being consumed when
        // the page ended.
        let shard = sharder.shard_of(last_pkey.token);
        let mut state = self.readers[shard as usize].lock().unwrap();
        match &mut *state {
            ReaderState::Saving { buffer, .. } => {
                for fragment in tmp.drain(..) {
                    stats.add(&fragment);
                    buffer.push_front(fragment);
                }
            }
            _ => {
                for fragment in tmp.drain(..) {
                    stats.add_discarded(&fragment);
                }
            }
        }
        stats
    }

    /// Hands the detached compaction state (partition start, static row,
    /// open range tombstones) back to the shard owning the partition.
    fn dismantle_compaction_state(
        &self,
        compaction_state: DetachedCompactionState,
    ) -> DismantleStats {
        let mut stats = DismantleStats::default();
        let shard = self
            .group
            .sharder()
            .shard_of(compaction_state.partition_start.key.token);

        let mut state = self.readers[shard as usize].lock().unwrap();
        let ReaderState::Saving { buffer, .. } = &mut *state else {
            for rt in compaction_state.range_tombstones {
                stats.add_discarded(&MutationFragment::RangeTombstone(rt));
            }
            if let Some(static_row) = compaction_state.static_row {
                stats.add_discarded(&MutationFragment::StaticRow(static_row));
            }
            stats.add_discarded(&MutationFragment::PartitionStart(
                compaction_state.partition_start,
            ));
            return stats;
        };

        for rt in compaction_state.range_tombstones.into_iter().rev() {
            let fragment = MutationFragment::RangeTombstone(rt);
            stats.add(&fragment);
            buffer.push_front(fragment);
        }
        if let Some(static_row) = compaction_state.static_row {
            let fragment = MutationFragment::StaticRow(static_row);
            stats.add(&fragment);
            buffer.push_front(fragment);
        }
        let fragment = MutationFragment::PartitionStart(compaction_state.partition_start);
        stats.add(&fragment);
        buffer.push_front(fragment);
        stats
    }

    /// Closes the dismantling barrier and destroys any reader that was
    /// not saved.
    pub async fn stop(&self) {
        self.close_barrier().await;
        for shard in 0..self.group.shard_count() {
            if let ReaderState::Saving { handle, parts, .. } = self.take_state(shard) {
                let result = self
                    .group
                    .invoke_on(shard, move |state| {
                        state.semaphore.unregister_inactive_read(handle);
                        drop(parts);
                    })
                    .await;
                if let Err(error) = result {
                    debug!("Failed to stop reader on shard {}: {}", shard, error);
                    self.stats().failed_reader_stops.fetch_add(1, Ordering::Relaxed);
                    MULTISHARD_FAILED_READER_STOPS.inc();
                }
            }
        }
    }
}

/// The envelope range covering every query range: readers are created over
/// it and each shard's data is filtered by ownership.
fn reading_envelope(ranges: &[PartitionRange]) -> PartitionRange {
    match (ranges.first(), ranges.last()) {
        (Some(first), Some(last)) => PartitionRange::new(first.start.clone(), last.end.clone()),
        _ => PartitionRange::full(),
    }
}

/// Reader factory backed by a [ReadContext].
struct ContextReaderFactory {
    ctx: Arc<ReadContext>,
}

#[async_trait]
impl ReaderFactory for ContextReaderFactory {
    async fn create_reader(&mut self, tag: u32) -> Result<FragmentReader> {
        self.ctx.create_reader(tag).await
    }
}

/// Executes one page of a mutation query across all shards.
pub async fn query_mutations_on_all_shards(
    group: ShardGroupRef,
    metadata: TableMetadataRef,
    cmd: ReadCommand,
    ranges: Vec<PartitionRange>,
    trace: Option<TraceState>,
    deadline: Instant,
) -> Result<MutationResult> {
    if cmd.row_limit == 0 || cmd.slice.partition_row_limit == 0 || cmd.partition_limit == 0 {
        return Ok(MutationResult::default());
    }

    let ctx = ReadContext::new(group.clone(), metadata.clone(), cmd, ranges, trace);
    let result = do_query_mutations(&ctx, metadata, deadline).await;
    let stats = group.multishard_stats();
    match result {
        Ok(result) => {
            stats.total_reads.fetch_add(1, Ordering::Relaxed);
            MULTISHARD_TOTAL_READS.inc();
            if result.is_short_read() {
                stats.short_mutation_queries.fetch_add(1, Ordering::Relaxed);
                SHORT_MUTATION_QUERIES.inc();
            }
            Ok(result)
        }
        Err(error) => {
            stats.total_reads_failed.fetch_add(1, Ordering::Relaxed);
            MULTISHARD_TOTAL_READS_FAILED.inc();
            Err(error)
        }
    }
}

async fn do_query_mutations(
    ctx: &Arc<ReadContext>,
    metadata: TableMetadataRef,
    deadline: Instant,
) -> Result<MutationResult> {
    ctx.lookup_readers().await?;

    let sink = ShardReaderSink::new();
    let tags: Vec<u32> = (0..ctx.group.shard_count()).collect();
    let merging = MergingSource::new(
        metadata.clone(),
        tags,
        Box::new(ContextReaderFactory { ctx: ctx.clone() }),
        false,
        deadline,
        sink.clone(),
    );
    let mut reader = FragmentReader::new(
        metadata.clone(),
        ReaderPermit::untracked(),
        Box::new(merging),
    );

    let cmd = ctx.cmd.clone();
    let mut compaction_state = CompactionState::new(false, cmd.slice.partition_row_limit);
    let builder =
        MutationResultBuilder::new(cmd.max_result_size, cmd.slice.options.allow_short_read);
    let page = consume_page(
        &mut reader,
        &mut compaction_state,
        &cmd.slice,
        builder,
        cmd.row_limit,
        cmd.partition_limit,
        cmd.query_time,
        deadline,
    )
    .await;

    // Dismantle the combining reader: its buffer is the combined buffer,
    // dropping it hands each shard reader back for parking.
    let combined_buffer = reader.detach_buffer();
    drop(reader);
    for (shard, shard_reader) in sink.take() {
        ctx.destroy_reader(shard, Ok(shard_reader));
    }

    let (last_ckey, result) = match page {
        Ok(page) => page,
        Err(error) => {
            ctx.stop().await;
            return Err(error);
        }
    };

    if compaction_state.are_limits_reached() || result.is_short_read() {
        ctx.save_readers(combined_buffer, compaction_state.detach_state(), last_ckey)
            .await;
    }
    ctx.stop().await;
    Ok(result)
}
