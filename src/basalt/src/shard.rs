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

//! Shards and their worker tasks.
//!
//! The process is sharded: each shard owns its tables, querier cache and
//! admission semaphore, and a worker task that is the only place this
//! state is touched. Cross-shard work goes through [ShardGroup::invoke_on]
//! which runs a closure against the target shard's state on its worker;
//! objects move between shards only inside those closures.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common_telemetry::info;
use snafu::ResultExt;
use store_api::metadata::{TableId, TableMetadataRef};
use store_api::storage::{ShardId, Sharder};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::access::AccessLayerRef;
use crate::config::BasaltConfig;
use crate::error::{RecvSnafu, Result, ShardStoppedSnafu, TableNotFoundSnafu};
use crate::memtable::{Memtable, MemtableRef};
use crate::querier::{spawn_ttl_reaper, QuerierCache};
use crate::read::{Mutation, MutationSourceRef};
use crate::semaphore::ReaderSemaphore;
use crate::sst::file::SsTableRef;
use crate::sst::source::SsTableSource;

/// Cadence of the querier cache TTL scan.
const TTL_SCAN_PERIOD: Duration = Duration::from_secs(1);

/// Tracks reads in progress against one table shard.
#[derive(Debug, Default)]
pub struct ReadTracker {
    reads: Arc<AtomicUsize>,
}

impl ReadTracker {
    /// Returns a guard held for the duration of one read.
    pub fn begin_read(&self) -> OperationGuard {
        self.reads.fetch_add(1, Ordering::Relaxed);
        OperationGuard {
            reads: self.reads.clone(),
        }
    }

    /// Number of reads currently in progress.
    pub fn reads_in_progress(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }
}

/// Guard of one read in progress.
#[derive(Debug)]
pub struct OperationGuard {
    reads: Arc<AtomicUsize>,
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        self.reads.fetch_sub(1, Ordering::Relaxed);
    }
}

/// One shard's slice of a table.
pub struct TableShard {
    pub metadata: TableMetadataRef,
    pub memtable: MemtableRef,
    pub sstables: Vec<SsTableRef>,
    read_tracker: ReadTracker,
}

impl TableShard {
    pub fn new(metadata: TableMetadataRef) -> TableShard {
        TableShard {
            memtable: Arc::new(Memtable::new(0, metadata.clone())),
            metadata,
            sstables: Vec::new(),
            read_tracker: ReadTracker::default(),
        }
    }

    /// The mutation source serving reads of this table shard: its
    /// SSTables when flushed data exists, the memtable otherwise.
    pub fn as_mutation_source(&self, access: &AccessLayerRef) -> MutationSourceRef {
        if self.sstables.is_empty() {
            self.memtable.clone()
        } else {
            Arc::new(SsTableSource::new(access.clone(), self.sstables.clone()))
        }
    }

    /// Marks a read in progress; the guard keeps the table shard's data
    /// referenced until it is dropped.
    pub fn read_in_progress(&self) -> OperationGuard {
        self.read_tracker.begin_read()
    }
}

/// State owned by one shard, touched only on its worker task.
pub struct ShardState {
    pub shard_id: ShardId,
    pub semaphore: ReaderSemaphore,
    pub querier_cache: QuerierCache,
    pub access: AccessLayerRef,
    tables: HashMap<TableId, TableShard>,
}

impl ShardState {
    /// Finds a table shard.
    pub fn find_table(&self, table_id: TableId) -> Result<&TableShard> {
        self.tables
            .get(&table_id)
            .ok_or_else(|| TableNotFoundSnafu { table_id }.build())
    }

    /// Finds a table shard for modification.
    pub fn find_table_mut(&mut self, table_id: TableId) -> Result<&mut TableShard> {
        self.tables
            .get_mut(&table_id)
            .ok_or_else(|| TableNotFoundSnafu { table_id }.build())
    }

    /// Creates the shard's slice of a table.
    pub fn create_table(&mut self, metadata: TableMetadataRef) {
        self.tables
            .entry(metadata.table_id)
            .or_insert_with(|| TableShard::new(metadata));
    }

    /// Drops the shard's slice of a table, evicting its cached queriers.
    pub fn drop_table(&mut self, table_id: TableId) {
        if self.tables.remove(&table_id).is_some() {
            self.querier_cache.evict_all_for_table(table_id);
        }
    }
}

type ShardTask = Box<dyn FnOnce(&mut ShardState) + Send>;

struct ShardWorker {
    id: ShardId,
    sender: mpsc::UnboundedSender<ShardTask>,
    handle: Mutex<Option<JoinHandle<()>>>,
    ttl_reaper: Mutex<Option<JoinHandle<()>>>,
    running: Arc<AtomicBool>,
}

impl ShardWorker {
    fn start(id: ShardId, config: &BasaltConfig, access: AccessLayerRef) -> ShardWorker {
        let semaphore = ReaderSemaphore::new(
            format!("shard-{id}"),
            config.reader_semaphore_capacity,
            config.reader_permit_weight,
        );
        let querier_cache = QuerierCache::new(
            semaphore.clone(),
            config.querier_cache_memory_limit,
            config.querier_cache_entry_ttl,
        );
        let ttl_reaper = spawn_ttl_reaper(querier_cache.clone(), TTL_SCAN_PERIOD);

        let (sender, mut receiver) = mpsc::unbounded_channel::<ShardTask>();
        let running = Arc::new(AtomicBool::new(true));
        let mut state = ShardState {
            shard_id: id,
            semaphore,
            querier_cache,
            access,
            tables: HashMap::new(),
        };

        let running_flag = running.clone();
        let handle = tokio::spawn(async move {
            info!("Start shard worker {}", id);
            while running_flag.load(Ordering::Relaxed) {
                match receiver.recv().await {
                    Some(task) => task(&mut state),
                    None => break,
                }
            }
            info!("Exit shard worker {}", id);
        });

        ShardWorker {
            id,
            sender,
            handle: Mutex::new(Some(handle)),
            ttl_reaper: Mutex::new(Some(ttl_reaper)),
            running,
        }
    }

    async fn stop(&self) -> Result<()> {
        if let Some(reaper) = self.ttl_reaper.lock().unwrap().take() {
            reaper.abort();
        }
        let handle = self.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            info!("Stop shard worker {}", self.id);
            self.running.store(false, Ordering::Relaxed);
            // Wake the worker so it observes the flag.
            let _ = self.sender.send(Box::new(|_| {}));
            handle.await.context(crate::error::JoinSnafu)?;
        }
        Ok(())
    }
}

/// A fixed size group of shards, one worker task each.
pub struct ShardGroup {
    workers: Vec<ShardWorker>,
    sharder: Sharder,
    access: AccessLayerRef,
    multishard_stats: crate::multishard::MultishardStats,
}

pub type ShardGroupRef = Arc<ShardGroup>;

impl ShardGroup {
    /// Starts a shard group.
    pub fn start(config: &BasaltConfig, access: AccessLayerRef) -> ShardGroupRef {
        let mut config = config.clone();
        config.sanitize();
        let workers = (0..config.num_shards)
            .map(|id| ShardWorker::start(id, &config, access.clone()))
            .collect();
        Arc::new(ShardGroup {
            workers,
            sharder: Sharder::new(config.num_shards),
            access,
            multishard_stats: crate::multishard::MultishardStats::default(),
        })
    }

    /// Counters of the multishard read path.
    pub fn multishard_stats(&self) -> &crate::multishard::MultishardStats {
        &self.multishard_stats
    }

    /// Stops all shard workers.
    pub async fn stop(&self) -> Result<()> {
        info!("Stop shard group");
        for worker in &self.workers {
            worker.stop().await?;
        }
        Ok(())
    }

    /// Number of shards.
    pub fn shard_count(&self) -> u32 {
        self.workers.len() as u32
    }

    /// The sharder dispatching tokens over this group.
    pub fn sharder(&self) -> Sharder {
        self.sharder
    }

    /// The access layer shared by all shards.
    pub fn access(&self) -> &AccessLayerRef {
        &self.access
    }

    /// Runs `f` against `shard`'s state on its worker task and returns the
    /// result.
    pub async fn invoke_on<R, F>(&self, shard: ShardId, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut ShardState) -> R + Send + 'static,
    {
        let worker = self
            .workers
            .get(shard as usize)
            .ok_or_else(|| ShardStoppedSnafu { shard }.build())?;
        let (tx, rx) = oneshot::channel();
        worker
            .sender
            .send(Box::new(move |state| {
                let _ = tx.send(f(state));
            }))
            .map_err(|_| ShardStoppedSnafu { shard }.build())?;
        rx.await.context(RecvSnafu)
    }

    /// Creates a table on every shard.
    pub async fn create_table(&self, metadata: TableMetadataRef) -> Result<()> {
        for shard in 0..self.shard_count() {
            let metadata = metadata.clone();
            self.invoke_on(shard, move |state| state.create_table(metadata))
                .await?;
        }
        Ok(())
    }

    /// Applies a mutation on the shard owning its partition.
    pub async fn apply_mutation(&self, table_id: TableId, mutation: Mutation) -> Result<()> {
        let shard = self.sharder.shard_of(mutation.key.token);
        self.invoke_on(shard, move |state| {
            let table = state.find_table(table_id)?;
            table.memtable.apply(mutation);
            Ok(())
        })
        .await?
    }

    /// Installs an SSTable into one shard's slice of a table.
    pub async fn install_sstable(
        &self,
        shard: ShardId,
        table_id: TableId,
        sstable: SsTableRef,
    ) -> Result<()> {
        self.invoke_on(shard, move |state| {
            let table = state.find_table_mut(table_id)?;
            table.sstables.push(sstable);
            Ok(())
        })
        .await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{new_metadata, new_row_mutation};

    fn test_config(shards: u32) -> BasaltConfig {
        BasaltConfig {
            num_shards: shards,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_invoke_on_runs_on_target_shard() {
        let group = ShardGroup::start(&test_config(2), Arc::new(crate::access::AccessLayer::memory()));
        let id = group.invoke_on(1, |state| state.shard_id).await.unwrap();
        assert_eq!(1, id);
        assert!(group.invoke_on(7, |_| ()).await.is_err());
        group.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_mutations_routed_by_token() {
        let group = ShardGroup::start(&test_config(2), Arc::new(crate::access::AccessLayer::memory()));
        let metadata = new_metadata();
        group.create_table(metadata.clone()).await.unwrap();

        let mutation = new_row_mutation(1, &[(1, "a")]);
        let owner = group.sharder().shard_of(mutation.key.token);
        group
            .apply_mutation(metadata.table_id, mutation)
            .await
            .unwrap();

        for shard in 0..group.shard_count() {
            let table_id = metadata.table_id;
            let empty = group
                .invoke_on(shard, move |state| {
                    state.find_table(table_id).unwrap().memtable.is_empty()
                })
                .await
                .unwrap();
            assert_eq!(shard != owner, empty, "shard {shard}");
        }
        group.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_table() {
        let group = ShardGroup::start(&test_config(1), Arc::new(crate::access::AccessLayer::memory()));
        let err = group
            .apply_mutation(99, new_row_mutation(1, &[(1, "a")]))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not found"));
        group.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_read_tracker() {
        let table = TableShard::new(new_metadata());
        assert_eq!(0, table.read_tracker.reads_in_progress());
        let guard = table.read_in_progress();
        assert_eq!(1, table.read_tracker.reads_in_progress());
        drop(guard);
        assert_eq!(0, table.read_tracker.reads_in_progress());
    }
}
