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

//! Engine metrics.

use lazy_static::lazy_static;
use prometheus::*;

lazy_static! {
    /// Counters of the querier cache, labeled by event kind:
    /// `inserts`, `lookups`, `misses`, `drops`, `time_based_evictions`,
    /// `resource_based_evictions`, `memory_based_evictions`.
    pub static ref QUERIER_CACHE_EVENTS: IntCounterVec = register_int_counter_vec!(
        "basalt_querier_cache_events",
        "querier cache events",
        &["kind"]
    )
    .unwrap();

    /// Number of queriers currently cached.
    pub static ref QUERIER_CACHE_POPULATION: IntGauge = register_int_gauge!(
        "basalt_querier_cache_population",
        "number of cached queriers"
    )
    .unwrap();

    /// Total number of multishard reads served.
    pub static ref MULTISHARD_TOTAL_READS: IntCounter = register_int_counter!(
        "basalt_multishard_total_reads",
        "total multishard reads"
    )
    .unwrap();

    /// Total number of failed multishard reads.
    pub static ref MULTISHARD_TOTAL_READS_FAILED: IntCounter = register_int_counter!(
        "basalt_multishard_total_reads_failed",
        "total failed multishard reads"
    )
    .unwrap();

    /// Number of mutation queries terminated by the result memory limit.
    pub static ref SHORT_MUTATION_QUERIES: IntCounter = register_int_counter!(
        "basalt_multishard_short_mutation_queries",
        "mutation queries that were terminated by the memory limit"
    )
    .unwrap();

    /// Shard reader saves that failed at the end of a page.
    pub static ref MULTISHARD_FAILED_READER_SAVES: IntCounter = register_int_counter!(
        "basalt_multishard_query_failed_reader_saves",
        "failed shard reader saves"
    )
    .unwrap();

    /// Shard reader stops that failed at the end of a page.
    pub static ref MULTISHARD_FAILED_READER_STOPS: IntCounter = register_int_counter!(
        "basalt_multishard_query_failed_reader_stops",
        "failed shard reader stops"
    )
    .unwrap();

    /// Fragments pushed back into shard readers while saving them.
    pub static ref MULTISHARD_UNPOPPED_FRAGMENTS: IntCounter = register_int_counter!(
        "basalt_multishard_query_unpopped_fragments",
        "fragments pushed back into saved shard readers"
    )
    .unwrap();

    /// Bytes pushed back into shard readers while saving them.
    pub static ref MULTISHARD_UNPOPPED_BYTES: IntCounter = register_int_counter!(
        "basalt_multishard_query_unpopped_bytes",
        "bytes pushed back into saved shard readers"
    )
    .unwrap();

    /// Number of tasks waiting to register staging SSTables.
    pub static ref VIEW_UPDATE_PENDING_REGISTRATIONS: IntGauge = register_int_gauge!(
        "basalt_view_update_generator_pending_registrations",
        "tasks waiting to register staging sstables"
    )
    .unwrap();

    /// Number of SSTable sets queued for view update generation.
    pub static ref VIEW_UPDATE_QUEUED_BATCHES: IntGauge = register_int_gauge!(
        "basalt_view_update_generator_queued_batches_count",
        "sstable sets queued for view update generation"
    )
    .unwrap();

    /// Number of processed SSTable sets waiting to leave staging.
    pub static ref VIEW_UPDATE_SSTABLES_TO_MOVE: IntGauge = register_int_gauge!(
        "basalt_view_update_generator_sstables_to_move_count",
        "processed sstable sets waiting to be moved out of staging"
    )
    .unwrap();
}

/// Label of querier cache insert events.
pub const CACHE_INSERTS: &str = "inserts";
/// Label of querier cache lookup events.
pub const CACHE_LOOKUPS: &str = "lookups";
/// Label of querier cache miss events.
pub const CACHE_MISSES: &str = "misses";
/// Label of querier cache drop events.
pub const CACHE_DROPS: &str = "drops";
/// Label of TTL driven evictions.
pub const CACHE_TIME_BASED_EVICTIONS: &str = "time_based_evictions";
/// Label of semaphore driven evictions.
pub const CACHE_RESOURCE_BASED_EVICTIONS: &str = "resource_based_evictions";
/// Label of memory ceiling driven evictions.
pub const CACHE_MEMORY_BASED_EVICTIONS: &str = "memory_based_evictions";
