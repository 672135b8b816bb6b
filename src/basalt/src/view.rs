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

//! View update generation from staging SSTables.
//!
//! SSTables land in a staging area first; the generator drains them table
//! by table, derives view updates by reading them, then moves them out of
//! staging. Registration is throttled through a semaphore while the loop
//! is busy; on stop the semaphore is closed so pending registrations fail
//! fast, and queued work is dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use common_telemetry::{info, trace, warn};
use store_api::metadata::{TableId, TableMetadataRef};
use store_api::storage::{PartitionRange, PartitionSlice};
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;

use crate::access::AccessLayerRef;
use crate::error::{AbortRequestedSnafu, Result};
use crate::metrics::{
    VIEW_UPDATE_PENDING_REGISTRATIONS, VIEW_UPDATE_QUEUED_BATCHES, VIEW_UPDATE_SSTABLES_TO_MOVE,
};
use crate::read::{
    FragmentReader, MutationSource, PartitionForwarding, RangeForwarding,
};
use crate::semaphore::ReaderPermit;
use crate::sst::file::{FileId, SsTableRef};
use crate::sst::source::SsTableSource;

/// The table-side contract of the generator.
#[async_trait]
pub trait StagingTarget: Send + Sync {
    /// Metadata of the base table.
    fn metadata(&self) -> TableMetadataRef;

    /// Derives and applies the view updates of one staging SSTable set by
    /// draining `reader`.
    async fn apply_view_updates(&self, reader: &mut FragmentReader) -> Result<()>;

    /// Moves processed SSTables out of the staging area.
    async fn move_sstables_from_staging(&self, sstables: &[FileId]) -> Result<()>;
}

pub type StagingTargetRef = Arc<dyn StagingTarget>;

type StagingSets = HashMap<TableId, (StagingTargetRef, Vec<SsTableRef>)>;

struct GeneratorInner {
    access: AccessLayerRef,
    /// SSTable sets queued for processing, grouped by table.
    queued: StdMutex<StagingSets>,
    /// Processed sets waiting to leave the staging area.
    to_move: StdMutex<StagingSets>,
    pending_sstables: Notify,
    abort: AtomicBool,
    registration_sem: Semaphore,
}

impl GeneratorInner {
    fn update_gauges(&self) {
        VIEW_UPDATE_QUEUED_BATCHES.set(self.queued.lock().unwrap().len() as i64);
        VIEW_UPDATE_SSTABLES_TO_MOVE.set(self.to_move.lock().unwrap().len() as i64);
    }
}

/// Background generator of view updates from staging SSTables.
pub struct ViewUpdateGenerator {
    inner: Arc<GeneratorInner>,
    started: StdMutex<Option<JoinHandle<()>>>,
}

impl ViewUpdateGenerator {
    pub fn new(access: AccessLayerRef, registration_units: usize) -> ViewUpdateGenerator {
        ViewUpdateGenerator {
            inner: Arc::new(GeneratorInner {
                access,
                queued: StdMutex::new(HashMap::new()),
                to_move: StdMutex::new(HashMap::new()),
                pending_sstables: Notify::new(),
                abort: AtomicBool::new(false),
                registration_sem: Semaphore::new(registration_units.max(1)),
            }),
            started: StdMutex::new(None),
        }
    }

    /// Starts the processing loop.
    pub fn start(&self) {
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            run_generator(inner).await;
        });
        *self.started.lock().unwrap() = Some(handle);
    }

    /// Stops the loop, dropping queued work. Pending registrations are
    /// unblocked with an abort signal.
    pub async fn stop(&self) {
        self.inner.abort.store(true, Ordering::Release);
        self.inner.pending_sstables.notify_one();
        self.inner.registration_sem.close();
        let handle = self.started.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        // Clear sstable references so nothing keeps staging files alive.
        let to_move = std::mem::take(&mut *self.inner.to_move.lock().unwrap());
        let queued = std::mem::take(&mut *self.inner.queued.lock().unwrap());
        info!(
            "leaving {} unstaged sstable sets unprocessed, {} sets still queued",
            to_move.len(),
            queued.len()
        );
        self.inner.update_gauges();
    }

    /// Queues a staging SSTable for processing. Waits on the registration
    /// semaphore while the generator is busy.
    pub async fn register_staging_sstable(
        &self,
        sstable: SsTableRef,
        target: StagingTargetRef,
    ) -> Result<()> {
        if self.inner.abort.load(Ordering::Acquire) {
            return Ok(());
        }

        VIEW_UPDATE_PENDING_REGISTRATIONS.inc();
        let permit = self.inner.registration_sem.acquire().await;
        VIEW_UPDATE_PENDING_REGISTRATIONS.dec();
        match permit {
            // The unit is returned by the loop once the sstable was
            // processed.
            Ok(permit) => permit.forget(),
            Err(_) => return AbortRequestedSnafu.fail(),
        }

        let table_id = target.metadata().table_id;
        {
            let mut queued = self.inner.queued.lock().unwrap();
            let entry = queued
                .entry(table_id)
                .or_insert_with(|| (target, Vec::new()));
            entry.1.push(sstable);
        }
        self.inner.update_gauges();
        self.inner.pending_sstables.notify_one();
        Ok(())
    }

    /// Number of SSTable sets queued for processing.
    pub fn queued_batches(&self) -> usize {
        self.inner.queued.lock().unwrap().len()
    }

    /// Number of processed sets waiting to be moved out of staging.
    pub fn sstables_to_move(&self) -> usize {
        self.inner.to_move.lock().unwrap().len()
    }
}

async fn run_generator(inner: Arc<GeneratorInner>) {
    let mut wait_for_wake = false;
    while !inner.abort.load(Ordering::Acquire) {
        if wait_for_wake || inner.queued.lock().unwrap().is_empty() {
            inner.pending_sstables.notified().await;
            wait_for_wake = false;
            continue;
        }

        // To ensure we don't race with registrations, take the entire
        // content and work on it locally.
        let batch = std::mem::take(&mut *inner.queued.lock().unwrap());
        inner.update_gauges();

        for (table_id, (target, sstables)) in batch {
            if inner.abort.load(Ordering::Acquire) {
                return;
            }
            let metadata = target.metadata();
            trace!(
                "Processing {}: {} staging sstables",
                metadata.name,
                sstables.len()
            );
            let num_sstables = sstables.len();

            match process_table(&inner, &metadata, &target, &sstables).await {
                Ok(()) => {
                    let mut to_move = inner.to_move.lock().unwrap();
                    let entry = to_move
                        .entry(table_id)
                        .or_insert_with(|| (target.clone(), Vec::new()));
                    entry.1.extend(sstables);
                }
                Err(error) => {
                    warn!(
                        "Processing {} staging sstables failed for table {}: {}. Will retry...",
                        num_sstables, metadata.name, error
                    );
                    // Put the sstables back so the table is retried on the
                    // next wake. By then it may have received more.
                    let mut queued = inner.queued.lock().unwrap();
                    let entry = queued
                        .entry(table_id)
                        .or_insert_with(|| (target.clone(), Vec::new()));
                    entry.1.extend(sstables);
                    wait_for_wake = true;
                    break;
                }
            }
            inner.registration_sem.add_permits(num_sstables);
        }
        inner.update_gauges();

        // Move processed sets out of the staging area.
        let to_move = std::mem::take(&mut *inner.to_move.lock().unwrap());
        for (_, (target, sstables)) in to_move {
            let ids: Vec<_> = sstables.iter().map(|sst| sst.file_id).collect();
            if let Err(error) = target.move_sstables_from_staging(&ids).await {
                // Move from staging will be retried upon restart.
                warn!(
                    "Moving some sstables of {} from staging failed: {}. Ignoring...",
                    target.metadata().name,
                    error
                );
            }
        }
        inner.update_gauges();
    }
}

/// Reads one table's staging set end to end to derive its view updates.
async fn process_table(
    inner: &Arc<GeneratorInner>,
    metadata: &TableMetadataRef,
    target: &StagingTargetRef,
    sstables: &[SsTableRef],
) -> Result<()> {
    let source = SsTableSource::new(inner.access.clone(), sstables.to_vec());
    let mut reader = source.make_reader(
        metadata.clone(),
        ReaderPermit::untracked(),
        &PartitionRange::full(),
        &PartitionSlice::full(metadata),
        None,
        PartitionForwarding::No,
        RangeForwarding::No,
    )?;
    target.apply_view_updates(&mut reader).await
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};

    use super::*;
    use crate::access::AccessLayer;
    use crate::sst::writer::SsTableWriter;
    use crate::test_util::{new_metadata, new_row_mutation};

    struct MockTarget {
        metadata: TableMetadataRef,
        applied: AtomicUsize,
        moved: AtomicUsize,
        fail_applies: AtomicUsize,
    }

    impl MockTarget {
        fn new() -> MockTarget {
            MockTarget {
                metadata: new_metadata(),
                applied: AtomicUsize::new(0),
                moved: AtomicUsize::new(0),
                fail_applies: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl StagingTarget for MockTarget {
        fn metadata(&self) -> TableMetadataRef {
            self.metadata.clone()
        }

        async fn apply_view_updates(&self, reader: &mut FragmentReader) -> Result<()> {
            if self.fail_applies.load(Ordering::Relaxed) > 0 {
                self.fail_applies.fetch_sub(1, Ordering::Relaxed);
                return crate::error::InternalInvariantSnafu {
                    reason: "injected failure",
                }
                .fail();
            }
            let deadline = Instant::now() + Duration::from_secs(30);
            while reader.next_fragment(deadline).await?.is_some() {}
            self.applied.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }

        async fn move_sstables_from_staging(&self, sstables: &[FileId]) -> Result<()> {
            self.moved.fetch_add(sstables.len(), Ordering::Relaxed);
            Ok(())
        }
    }

    async fn staging_sstable(access: &AccessLayerRef) -> SsTableRef {
        SsTableWriter::new(new_metadata(), access.clone())
            .write(&[new_row_mutation(1, &[(1, "a"), (2, "b")])])
            .await
            .unwrap()
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_process_and_move() {
        let access: AccessLayerRef = Arc::new(AccessLayer::memory());
        let generator = ViewUpdateGenerator::new(access.clone(), 4);
        generator.start();

        let target = Arc::new(MockTarget::new());
        let sst = staging_sstable(&access).await;
        generator
            .register_staging_sstable(sst, target.clone())
            .await
            .unwrap();

        wait_until(|| target.moved.load(Ordering::Relaxed) == 1).await;
        assert_eq!(1, target.applied.load(Ordering::Relaxed));
        assert_eq!(0, generator.queued_batches());
        assert_eq!(0, generator.sstables_to_move());
        generator.stop().await;
    }

    #[tokio::test]
    async fn test_failed_processing_retries_on_next_wake() {
        let access: AccessLayerRef = Arc::new(AccessLayer::memory());
        let generator = ViewUpdateGenerator::new(access.clone(), 4);
        generator.start();

        let target = Arc::new(MockTarget::new());
        target.fail_applies.store(1, Ordering::Relaxed);
        let sst = staging_sstable(&access).await;
        generator
            .register_staging_sstable(sst, target.clone())
            .await
            .unwrap();

        // The first attempt fails and the set is re-queued.
        wait_until(|| generator.queued_batches() == 1).await;
        assert_eq!(0, target.applied.load(Ordering::Relaxed));

        // The next registration wakes the loop and the retry succeeds.
        let sst = staging_sstable(&access).await;
        generator
            .register_staging_sstable(sst, target.clone())
            .await
            .unwrap();
        wait_until(|| target.applied.load(Ordering::Relaxed) >= 1).await;
        generator.stop().await;
    }

    #[tokio::test]
    async fn test_stop_unblocks_registration() {
        let access: AccessLayerRef = Arc::new(AccessLayer::memory());
        // One unit: the first registration consumes it, the second waits.
        let generator = Arc::new(ViewUpdateGenerator::new(access.clone(), 1));
        // Not started: units are never returned.
        let target = Arc::new(MockTarget::new());
        let sst = staging_sstable(&access).await;
        generator
            .register_staging_sstable(sst, target.clone())
            .await
            .unwrap();

        let blocked = {
            let generator = generator.clone();
            let target = target.clone();
            let sst = staging_sstable(&access).await;
            tokio::spawn(async move { generator.register_staging_sstable(sst, target).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!blocked.is_finished());

        generator.stop().await;
        let result = blocked.await.unwrap();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_register_after_abort_is_noop() {
        let access: AccessLayerRef = Arc::new(AccessLayer::memory());
        let generator = ViewUpdateGenerator::new(access.clone(), 4);
        generator.start();
        generator.stop().await;

        let target = Arc::new(MockTarget::new());
        let sst = staging_sstable(&access).await;
        generator
            .register_staging_sstable(sst, target.clone())
            .await
            .unwrap();
        assert_eq!(0, generator.queued_batches());
    }
}
