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

//! Queriers serve the pages of one query; the querier cache parks them
//! between pages.
//!
//! A querier is created on the first page of a query, then saved at the end
//! of every page that leaves data unread and looked up at the beginning of
//! the next one. Lookup always removes the entry. On a schema or position
//! mismatch the entry is dropped and the caller starts from scratch.
//! Cached readers are registered as inactive with the shard's admission
//! semaphore so it can evict them under memory pressure; the cache itself
//! additionally enforces a TTL and a total memory ceiling.

use std::collections::VecDeque;
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use common_telemetry::debug;
use store_api::metadata::{TableId, TableMetadataRef};
use store_api::storage::{
    ClusteringKey, DecoratedKey, PartitionRange, PartitionSlice,
};
use uuid::Uuid;

use crate::error::Result;
use crate::metrics::{
    CACHE_DROPS, CACHE_INSERTS, CACHE_LOOKUPS, CACHE_MEMORY_BASED_EVICTIONS, CACHE_MISSES,
    CACHE_RESOURCE_BASED_EVICTIONS, CACHE_TIME_BASED_EVICTIONS, QUERIER_CACHE_EVENTS,
    QUERIER_CACHE_POPULATION,
};
use crate::read::compact::{consume_page, CompactedFragmentsConsumer, CompactionState};
use crate::read::{FragmentReader, MutationSource, TraceState};
use crate::semaphore::{InactiveHandle, ReaderPermit, ReaderSemaphore};

/// Default TTL of a cache entry.
pub const DEFAULT_ENTRY_TTL: Duration = Duration::from_secs(10);

/// Position of a suspended reader: the last partition key seen and, if the
/// last fragment was a clustering row, its key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReaderPosition {
    pub partition_key: Option<DecoratedKey>,
    pub clustering_key: Option<ClusteringKey>,
}

/// One-stop object for serving the pages of a query range on one shard.
///
/// Create it on the first page, consume pages from it, and save it in the
/// querier cache between pages while more are expected.
pub struct Querier {
    metadata: TableMetadataRef,
    permit: ReaderPermit,
    range: PartitionRange,
    slice: PartitionSlice,
    reader: FragmentReader,
    compaction_state: CompactionState,
    last_ckey: Option<ClusteringKey>,
    emit_only_live: bool,
}

impl Querier {
    /// Creates a querier reading `range` of `source`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: &dyn MutationSource,
        metadata: TableMetadataRef,
        permit: ReaderPermit,
        range: PartitionRange,
        slice: PartitionSlice,
        trace: Option<&TraceState>,
        emit_only_live: bool,
    ) -> Result<Querier> {
        let reader = source.make_reader(
            metadata.clone(),
            permit.clone(),
            &range,
            &slice,
            trace,
            crate::read::PartitionForwarding::No,
            crate::read::RangeForwarding::No,
        )?;
        let partition_row_limit = slice.partition_row_limit;
        Ok(Querier {
            metadata,
            permit,
            range,
            slice,
            reader,
            compaction_state: CompactionState::new(emit_only_live, partition_row_limit),
            last_ckey: None,
            emit_only_live,
        })
    }

    /// Consumes one page into `consumer`.
    pub async fn consume_page<C: CompactedFragmentsConsumer>(
        &mut self,
        consumer: C,
        row_limit: u64,
        partition_limit: u32,
        query_time: u32,
        deadline: Instant,
    ) -> Result<C::Output> {
        let (last_ckey, output) = consume_page(
            &mut self.reader,
            &mut self.compaction_state,
            &self.slice,
            consumer,
            row_limit,
            partition_limit,
            query_time,
            deadline,
        )
        .await?;
        self.last_ckey = last_ckey;
        Ok(output)
    }

    /// Returns whether the last page exhausted its budgets.
    pub fn are_limits_reached(&self) -> bool {
        self.compaction_state.are_limits_reached()
    }

    /// Current position of the querier.
    pub fn position(&self) -> ReaderPosition {
        ReaderPosition {
            partition_key: self.compaction_state.current_partition().cloned(),
            clustering_key: self.last_ckey.clone(),
        }
    }

    /// Estimated memory used by the suspended querier.
    pub fn memory_usage(&self) -> usize {
        self.reader.buffer_size()
    }

    pub fn metadata(&self) -> &TableMetadataRef {
        &self.metadata
    }

    pub fn permit(&self) -> &ReaderPermit {
        &self.permit
    }

    fn into_parts(self) -> (QuerierParts, FragmentReader) {
        (
            QuerierParts {
                metadata: self.metadata,
                permit: self.permit,
                range: self.range,
                slice: self.slice,
                compaction_state: self.compaction_state,
                last_ckey: self.last_ckey,
                emit_only_live: self.emit_only_live,
            },
            self.reader,
        )
    }

    fn from_parts(parts: QuerierParts, reader: FragmentReader) -> Querier {
        Querier {
            metadata: parts.metadata,
            permit: parts.permit,
            range: parts.range,
            slice: parts.slice,
            reader,
            compaction_state: parts.compaction_state,
            last_ckey: parts.last_ckey,
            emit_only_live: parts.emit_only_live,
        }
    }
}

struct QuerierParts {
    metadata: TableMetadataRef,
    permit: ReaderPermit,
    range: PartitionRange,
    slice: PartitionSlice,
    compaction_state: CompactionState,
    last_ckey: Option<ClusteringKey>,
    emit_only_live: bool,
}

/// Shard local state of a suspended multishard query.
///
/// Not used to read pages directly; it stores one shard's reader between
/// the pages of a multishard read together with the parameters it was
/// created with. Its position is the nominal position of the whole query.
pub struct ShardMutationQuerier {
    metadata: TableMetadataRef,
    query_ranges: Vec<PartitionRange>,
    reader_range: PartitionRange,
    reader_slice: PartitionSlice,
    reader: FragmentReader,
    permit: ReaderPermit,
    nominal_pkey: DecoratedKey,
    nominal_ckey: Option<ClusteringKey>,
}

impl ShardMutationQuerier {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        query_ranges: Vec<PartitionRange>,
        reader_range: PartitionRange,
        reader_slice: PartitionSlice,
        reader: FragmentReader,
        permit: ReaderPermit,
        nominal_pkey: DecoratedKey,
        nominal_ckey: Option<ClusteringKey>,
    ) -> ShardMutationQuerier {
        ShardMutationQuerier {
            metadata: reader.metadata().clone(),
            query_ranges,
            reader_range,
            reader_slice,
            reader,
            permit,
            nominal_pkey,
            nominal_ckey,
        }
    }

    pub fn position(&self) -> ReaderPosition {
        ReaderPosition {
            partition_key: Some(self.nominal_pkey.clone()),
            clustering_key: self.nominal_ckey.clone(),
        }
    }

    pub fn memory_usage(&self) -> usize {
        self.reader.buffer_size()
    }

    pub fn permit(&self) -> &ReaderPermit {
        &self.permit
    }

    /// Takes the querier apart for resumption on the owning shard.
    pub fn into_reader_parts(self) -> (PartitionRange, PartitionSlice, FragmentReader, ReaderPermit) {
        (
            self.reader_range,
            self.reader_slice,
            self.reader,
            self.permit,
        )
    }

    fn into_parts(self) -> (ShardQuerierParts, FragmentReader) {
        (
            ShardQuerierParts {
                metadata: self.metadata,
                query_ranges: self.query_ranges,
                reader_range: self.reader_range,
                reader_slice: self.reader_slice,
                permit: self.permit,
                nominal_pkey: self.nominal_pkey,
                nominal_ckey: self.nominal_ckey,
            },
            self.reader,
        )
    }

    fn from_parts(parts: ShardQuerierParts, reader: FragmentReader) -> ShardMutationQuerier {
        ShardMutationQuerier {
            metadata: parts.metadata,
            query_ranges: parts.query_ranges,
            reader_range: parts.reader_range,
            reader_slice: parts.reader_slice,
            reader,
            permit: parts.permit,
            nominal_pkey: parts.nominal_pkey,
            nominal_ckey: parts.nominal_ckey,
        }
    }
}

struct ShardQuerierParts {
    metadata: TableMetadataRef,
    query_ranges: Vec<PartitionRange>,
    reader_range: PartitionRange,
    reader_slice: PartitionSlice,
    permit: ReaderPermit,
    nominal_pkey: DecoratedKey,
    nominal_ckey: Option<ClusteringKey>,
}

/// Statistics of a [QuerierCache].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QuerierCacheStats {
    /// The number of inserts into the cache.
    pub inserts: u64,
    /// The number of cache lookups.
    pub lookups: u64,
    /// The subset of lookups that missed.
    pub misses: u64,
    /// The subset of lookups that hit but the looked up querier had to be
    /// dropped due to a schema or position mismatch.
    pub drops: u64,
    /// The number of queriers evicted due to their TTL expiring.
    pub time_based_evictions: u64,
    /// The number of queriers evicted to free up resources for new
    /// readers.
    pub resource_based_evictions: u64,
    /// The number of queriers evicted because the maximum memory usage was
    /// reached.
    pub memory_based_evictions: u64,
    /// The number of queriers currently in the cache.
    pub population: u64,
}

enum CachedValue {
    Data(QuerierParts),
    Mutation(QuerierParts),
    ShardMutation(ShardQuerierParts),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Variant {
    Data,
    Mutation,
    ShardMutation,
}

impl CachedValue {
    fn variant(&self) -> Variant {
        match self {
            CachedValue::Data(_) => Variant::Data,
            CachedValue::Mutation(_) => Variant::Mutation,
            CachedValue::ShardMutation(_) => Variant::ShardMutation,
        }
    }

    fn table_id(&self) -> TableId {
        match self {
            CachedValue::Data(parts) | CachedValue::Mutation(parts) => parts.metadata.table_id,
            CachedValue::ShardMutation(parts) => parts.metadata.table_id,
        }
    }
}

struct Entry {
    id: u64,
    key: Uuid,
    expires: Instant,
    memory: usize,
    value: CachedValue,
    handle: InactiveHandle,
}

struct CacheInner {
    semaphore: ReaderSemaphore,
    max_memory: usize,
    entries: Mutex<VecDeque<Entry>>,
    entry_ttl: Mutex<Duration>,
    stats: Mutex<QuerierCacheStats>,
    next_entry_id: AtomicU64,
}

/// Special purpose cache for saving queriers between pages.
#[derive(Clone)]
pub struct QuerierCache {
    inner: Arc<CacheInner>,
}

impl QuerierCache {
    pub fn new(semaphore: ReaderSemaphore, max_memory: usize, entry_ttl: Duration) -> QuerierCache {
        QuerierCache {
            inner: Arc::new(CacheInner {
                semaphore,
                max_memory,
                entries: Mutex::new(VecDeque::new()),
                entry_ttl: Mutex::new(entry_ttl),
                stats: Mutex::new(QuerierCacheStats::default()),
                next_entry_id: AtomicU64::new(0),
            }),
        }
    }

    /// The admission semaphore cached readers are parked on.
    pub fn semaphore(&self) -> &ReaderSemaphore {
        &self.inner.semaphore
    }

    /// Saves a data querier under `key`.
    pub fn insert_data_querier(&self, key: Uuid, querier: Querier, trace: Option<&TraceState>) {
        let (parts, reader) = querier.into_parts();
        self.insert_value(key, CachedValue::Data(parts), reader, trace);
    }

    /// Saves a mutation querier under `key`.
    pub fn insert_mutation_querier(&self, key: Uuid, querier: Querier, trace: Option<&TraceState>) {
        let (parts, reader) = querier.into_parts();
        self.insert_value(key, CachedValue::Mutation(parts), reader, trace);
    }

    /// Saves a shard mutation querier under `key`.
    pub fn insert_shard_mutation_querier(
        &self,
        key: Uuid,
        querier: ShardMutationQuerier,
        trace: Option<&TraceState>,
    ) {
        let (parts, reader) = querier.into_parts();
        self.insert_value(key, CachedValue::ShardMutation(parts), reader, trace);
    }

    fn insert_value(
        &self,
        key: Uuid,
        value: CachedValue,
        reader: FragmentReader,
        trace: Option<&TraceState>,
    ) {
        let memory = reader.buffer_size();
        if let Some(trace) = trace {
            trace.trace(&format!("insert querier {key}, memory: {memory}"));
        }

        // Make room below the memory ceiling first, oldest entries go.
        let mut evicted = Vec::new();
        {
            let mut entries = self.inner.entries.lock().unwrap();
            let mut used: usize = entries.iter().map(|e| e.memory).sum();
            while used + memory > self.inner.max_memory && !entries.is_empty() {
                let entry = entries.pop_front().unwrap();
                used -= entry.memory;
                evicted.push(entry);
            }
        }
        for entry in evicted {
            self.count_eviction(CACHE_MEMORY_BASED_EVICTIONS);
            self.inner.semaphore.unregister_inactive_read(entry.handle);
        }

        let id = self.inner.next_entry_id.fetch_add(1, Ordering::Relaxed);
        let cache = Arc::downgrade(&self.inner);
        let handle = self.inner.semaphore.register_inactive(
            reader,
            Some(Box::new(move || on_resource_eviction(cache, id))),
        );

        let expires = Instant::now() + *self.inner.entry_ttl.lock().unwrap();
        self.inner.entries.lock().unwrap().push_back(Entry {
            id,
            key,
            expires,
            memory,
            value,
            handle,
        });

        let mut stats = self.inner.stats.lock().unwrap();
        stats.inserts += 1;
        stats.population += 1;
        QUERIER_CACHE_EVENTS.with_label_values(&[CACHE_INSERTS]).inc();
        QUERIER_CACHE_POPULATION.set(stats.population as i64);
    }

    /// Lookup a data querier in the cache.
    ///
    /// Queriers are found based on `key` and `range`; since a query may
    /// run several queriers in parallel over split, non-overlapping
    /// ranges, either bound of a non-singular range (or the start of a
    /// singular one) identifies the entry. The found querier is validated
    /// against the caller's schema version and page start position; on a
    /// mismatch it is dropped and the lookup misses.
    pub fn lookup_data_querier(
        &self,
        key: Uuid,
        metadata: &TableMetadataRef,
        range: &PartitionRange,
        slice: &PartitionSlice,
        trace: Option<&TraceState>,
    ) -> Option<Querier> {
        let ranges = std::slice::from_ref(range);
        let entry = self.lookup_entry(key, Variant::Data, ranges, metadata, slice, trace)?;
        let CachedValue::Data(parts) = entry.value else {
            unreachable!("variant checked in lookup_entry");
        };
        let reader = self.resume_entry_reader(entry.handle)?;
        Some(Querier::from_parts(parts, reader))
    }

    /// Lookup a mutation querier in the cache. See `lookup_data_querier`.
    pub fn lookup_mutation_querier(
        &self,
        key: Uuid,
        metadata: &TableMetadataRef,
        range: &PartitionRange,
        slice: &PartitionSlice,
        trace: Option<&TraceState>,
    ) -> Option<Querier> {
        let ranges = std::slice::from_ref(range);
        let entry = self.lookup_entry(key, Variant::Mutation, ranges, metadata, slice, trace)?;
        let CachedValue::Mutation(parts) = entry.value else {
            unreachable!("variant checked in lookup_entry");
        };
        let reader = self.resume_entry_reader(entry.handle)?;
        Some(Querier::from_parts(parts, reader))
    }

    /// Lookup a shard mutation querier in the cache. See
    /// `lookup_data_querier`.
    pub fn lookup_shard_mutation_querier(
        &self,
        key: Uuid,
        metadata: &TableMetadataRef,
        ranges: &[PartitionRange],
        slice: &PartitionSlice,
        trace: Option<&TraceState>,
    ) -> Option<ShardMutationQuerier> {
        let entry = self.lookup_entry(key, Variant::ShardMutation, ranges, metadata, slice, trace)?;
        let CachedValue::ShardMutation(parts) = entry.value else {
            unreachable!("variant checked in lookup_entry");
        };
        let reader = self.resume_entry_reader(entry.handle)?;
        Some(ShardMutationQuerier::from_parts(parts, reader))
    }

    fn lookup_entry(
        &self,
        key: Uuid,
        variant: Variant,
        ranges: &[PartitionRange],
        metadata: &TableMetadataRef,
        slice: &PartitionSlice,
        trace: Option<&TraceState>,
    ) -> Option<Entry> {
        {
            let mut stats = self.inner.stats.lock().unwrap();
            stats.lookups += 1;
        }
        QUERIER_CACHE_EVENTS.with_label_values(&[CACHE_LOOKUPS]).inc();

        let entry = {
            let mut entries = self.inner.entries.lock().unwrap();
            let index = entries.iter().position(|e| {
                e.key == key
                    && e.value.variant() == variant
                    && ranges_match(entry_ranges(&e.value), ranges)
            });
            match index {
                Some(index) => entries.remove(index).unwrap(),
                None => {
                    drop(entries);
                    self.count_miss(trace, key, "no matching entry");
                    return None;
                }
            }
        };
        {
            let mut stats = self.inner.stats.lock().unwrap();
            stats.population = stats.population.saturating_sub(1);
            QUERIER_CACHE_POPULATION.set(stats.population as i64);
        }

        // Schema validation.
        let entry_version = match &entry.value {
            CachedValue::Data(parts) | CachedValue::Mutation(parts) => {
                parts.metadata.schema_version
            }
            CachedValue::ShardMutation(parts) => parts.metadata.schema_version,
        };
        if entry_version != metadata.schema_version {
            self.drop_entry(entry, trace, "schema version mismatch");
            return None;
        }

        // Position validation: the entry's position must be the page
        // start.
        let position = match &entry.value {
            CachedValue::Data(parts) | CachedValue::Mutation(parts) => ReaderPosition {
                partition_key: parts.compaction_state.current_partition().cloned(),
                clustering_key: parts.last_ckey.clone(),
            },
            CachedValue::ShardMutation(parts) => ReaderPosition {
                partition_key: Some(parts.nominal_pkey.clone()),
                clustering_key: parts.nominal_ckey.clone(),
            },
        };
        if !position_matches_page_start(&position, ranges, slice) {
            self.drop_entry(entry, trace, "position mismatch");
            return None;
        }

        Some(entry)
    }

    fn resume_entry_reader(&self, handle: InactiveHandle) -> Option<FragmentReader> {
        match self.inner.semaphore.try_resume(handle) {
            Some(reader) => Some(reader),
            None => {
                // Evicted between the entry removal and the resume.
                self.count_miss(None, Uuid::nil(), "reader already evicted");
                None
            }
        }
    }

    fn drop_entry(&self, entry: Entry, trace: Option<&TraceState>, reason: &str) {
        if let Some(trace) = trace {
            trace.trace(&format!("dropping querier {}: {reason}", entry.key));
        }
        debug!("Dropping cached querier {}: {}", entry.key, reason);
        self.inner.semaphore.unregister_inactive_read(entry.handle);
        let mut stats = self.inner.stats.lock().unwrap();
        stats.drops += 1;
        QUERIER_CACHE_EVENTS.with_label_values(&[CACHE_DROPS]).inc();
    }

    fn count_miss(&self, trace: Option<&TraceState>, key: Uuid, reason: &str) {
        if let Some(trace) = trace {
            trace.trace(&format!("querier {key} lookup miss: {reason}"));
        }
        let mut stats = self.inner.stats.lock().unwrap();
        stats.misses += 1;
        QUERIER_CACHE_EVENTS.with_label_values(&[CACHE_MISSES]).inc();
    }

    fn count_eviction(&self, kind: &str) {
        let mut stats = self.inner.stats.lock().unwrap();
        match kind {
            CACHE_TIME_BASED_EVICTIONS => stats.time_based_evictions += 1,
            CACHE_RESOURCE_BASED_EVICTIONS => stats.resource_based_evictions += 1,
            _ => stats.memory_based_evictions += 1,
        }
        stats.population = stats.population.saturating_sub(1);
        QUERIER_CACHE_EVENTS.with_label_values(&[kind]).inc();
        QUERIER_CACHE_POPULATION.set(stats.population as i64);
    }

    /// Replaces the TTL used for entries inserted from now on.
    pub fn set_entry_ttl(&self, entry_ttl: Duration) {
        *self.inner.entry_ttl.lock().unwrap() = entry_ttl;
    }

    /// Evicts the oldest querier to free up resources. Returns false when
    /// the cache is empty.
    pub fn evict_one(&self) -> bool {
        let entry = self.inner.entries.lock().unwrap().pop_front();
        match entry {
            Some(entry) => {
                self.count_eviction(CACHE_RESOURCE_BASED_EVICTIONS);
                self.inner.semaphore.unregister_inactive_read(entry.handle);
                true
            }
            None => false,
        }
    }

    /// Evicts all queriers of a table. Used when dropping the table.
    pub fn evict_all_for_table(&self, table_id: TableId) {
        let removed = {
            let mut entries = self.inner.entries.lock().unwrap();
            let mut kept = VecDeque::with_capacity(entries.len());
            let mut removed = Vec::new();
            while let Some(entry) = entries.pop_front() {
                if entry.value.table_id() == table_id {
                    removed.push(entry);
                } else {
                    kept.push_back(entry);
                }
            }
            *entries = kept;
            removed
        };
        let count = removed.len() as u64;
        for entry in removed {
            self.inner.semaphore.unregister_inactive_read(entry.handle);
        }
        let mut stats = self.inner.stats.lock().unwrap();
        stats.population = stats.population.saturating_sub(count);
        QUERIER_CACHE_POPULATION.set(stats.population as i64);
    }

    /// Evicts entries whose TTL expired at `now`.
    pub fn evict_expired(&self, now: Instant) {
        let expired = {
            let mut entries = self.inner.entries.lock().unwrap();
            let mut expired = Vec::new();
            while let Some(front) = entries.front() {
                if front.expires <= now {
                    expired.push(entries.pop_front().unwrap());
                } else {
                    break;
                }
            }
            expired
        };
        for entry in expired {
            self.count_eviction(CACHE_TIME_BASED_EVICTIONS);
            self.inner.semaphore.unregister_inactive_read(entry.handle);
        }
    }

    /// Snapshot of the cache statistics.
    pub fn stats(&self) -> QuerierCacheStats {
        self.inner.stats.lock().unwrap().clone()
    }
}

/// Binds a querier cache to one query's identifier and first-page flag.
///
/// Inserts and lookups short circuit when the query is stateless (no
/// identifier); lookups additionally short circuit on the first page,
/// where no cached querier is expected to exist.
#[derive(Clone, Default)]
pub struct QuerierCacheContext {
    cache: Option<QuerierCache>,
    key: Option<Uuid>,
    is_first_page: bool,
}

impl QuerierCacheContext {
    pub fn new(cache: QuerierCache, key: Option<Uuid>, is_first_page: bool) -> QuerierCacheContext {
        QuerierCacheContext {
            cache: Some(cache),
            key,
            is_first_page,
        }
    }

    fn for_insert(&self) -> Option<(&QuerierCache, Uuid)> {
        Some((self.cache.as_ref()?, self.key?))
    }

    fn for_lookup(&self) -> Option<(&QuerierCache, Uuid)> {
        if self.is_first_page {
            return None;
        }
        self.for_insert()
    }

    pub fn insert_data_querier(&self, querier: Querier, trace: Option<&TraceState>) {
        if let Some((cache, key)) = self.for_insert() {
            cache.insert_data_querier(key, querier, trace);
        }
    }

    pub fn insert_mutation_querier(&self, querier: Querier, trace: Option<&TraceState>) {
        if let Some((cache, key)) = self.for_insert() {
            cache.insert_mutation_querier(key, querier, trace);
        }
    }

    pub fn insert_shard_mutation_querier(
        &self,
        querier: ShardMutationQuerier,
        trace: Option<&TraceState>,
    ) {
        if let Some((cache, key)) = self.for_insert() {
            cache.insert_shard_mutation_querier(key, querier, trace);
        }
    }

    pub fn lookup_data_querier(
        &self,
        metadata: &TableMetadataRef,
        range: &PartitionRange,
        slice: &PartitionSlice,
        trace: Option<&TraceState>,
    ) -> Option<Querier> {
        let (cache, key) = self.for_lookup()?;
        cache.lookup_data_querier(key, metadata, range, slice, trace)
    }

    pub fn lookup_mutation_querier(
        &self,
        metadata: &TableMetadataRef,
        range: &PartitionRange,
        slice: &PartitionSlice,
        trace: Option<&TraceState>,
    ) -> Option<Querier> {
        let (cache, key) = self.for_lookup()?;
        cache.lookup_mutation_querier(key, metadata, range, slice, trace)
    }

    pub fn lookup_shard_mutation_querier(
        &self,
        metadata: &TableMetadataRef,
        ranges: &[PartitionRange],
        slice: &PartitionSlice,
        trace: Option<&TraceState>,
    ) -> Option<ShardMutationQuerier> {
        let (cache, key) = self.for_lookup()?;
        cache.lookup_shard_mutation_querier(key, metadata, ranges, slice, trace)
    }
}

/// Spawns the TTL scan task of `cache`, ticking at `period`.
pub fn spawn_ttl_reaper(cache: QuerierCache, period: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            cache.evict_expired(Instant::now());
        }
    })
}

fn on_resource_eviction(cache: Weak<CacheInner>, entry_id: u64) {
    let Some(inner) = cache.upgrade() else {
        return;
    };
    let cache = QuerierCache { inner };
    let removed = {
        let mut entries = cache.inner.entries.lock().unwrap();
        let index = entries.iter().position(|e| e.id == entry_id);
        index.and_then(|index| entries.remove(index))
    };
    if let Some(entry) = removed {
        cache.count_eviction(CACHE_RESOURCE_BASED_EVICTIONS);
        // The semaphore already destroyed the reader; dropping the handle
        // is enough.
        drop(entry);
    }
}

fn entry_ranges(value: &CachedValue) -> &[PartitionRange] {
    match value {
        CachedValue::Data(parts) | CachedValue::Mutation(parts) => {
            std::slice::from_ref(&parts.range)
        }
        CachedValue::ShardMutation(parts) => &parts.query_ranges,
    }
}

/// Range matching between a cached entry and a caller.
///
/// The coordinator splits a query into non-overlapping ranges, so either
/// bound of a non-singular range is unique; singular ranges match on their
/// start. Subsequent pages narrow the start of the first range, so the end
/// of the last range is compared as well.
fn ranges_match(entry: &[PartitionRange], caller: &[PartitionRange]) -> bool {
    let (Some(entry_first), Some(caller_first)) = (entry.first(), caller.first()) else {
        return entry.is_empty() && caller.is_empty();
    };
    if caller_first.is_singular() {
        return entry_first.start == caller_first.start;
    }
    let entry_last = entry.last().unwrap();
    let caller_last = caller.last().unwrap();
    entry_first.start == caller_first.start || entry_last.end == caller_last.end
}

/// Returns whether `position` is exactly the start of the page described
/// by `ranges` and `slice`.
fn position_matches_page_start(
    position: &ReaderPosition,
    ranges: &[PartitionRange],
    slice: &PartitionSlice,
) -> bool {
    let Some(pkey) = &position.partition_key else {
        return true;
    };

    if let Some(first) = ranges.first() {
        let before_start = match &first.start {
            Bound::Included(start) | Bound::Excluded(start) => pkey < start,
            Bound::Unbounded => false,
        };
        if before_start {
            return false;
        }
    }
    if let Some(last) = ranges.last() {
        let after_end = match &last.end {
            Bound::Included(end) => pkey > end,
            Bound::Excluded(end) => pkey >= end,
            Bound::Unbounded => false,
        };
        if after_end {
            return false;
        }
    }

    let Some(ckey) = &position.clustering_key else {
        return true;
    };
    match slice.first_bound_for(&pkey.key) {
        // An unchanged slice continues from the reader's own position.
        None => true,
        // The only valid narrowed slice resumes exactly after the last
        // returned row.
        Some(bound) => !bound.inclusive && bound.key == *ckey,
    }
}
