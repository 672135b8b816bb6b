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

//! Reader admission control.
//!
//! Each shard owns one [ReaderSemaphore]. Holding a [ReaderPermit] is a
//! precondition to owning a live reader. A suspended reader can be parked as
//! an inactive handle; parked readers return their permit weight to the pool
//! and become evictable when the semaphore runs out of memory.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use common_telemetry::debug;

use crate::error::{PermitDeniedSnafu, Result};
use crate::read::FragmentReader;

/// Callback fired when the semaphore evicts an inactive reader to
/// reclaim memory.
pub type EvictionCallback = Box<dyn FnOnce() + Send>;

struct InactiveEntry {
    reader: FragmentReader,
    on_evict: Option<EvictionCallback>,
}

#[derive(Default)]
struct SemaphoreState {
    used: usize,
    next_handle_id: u64,
    inactive: BTreeMap<u64, InactiveEntry>,
}

struct SemaphoreInner {
    name: String,
    capacity: usize,
    permit_weight: usize,
    state: Mutex<SemaphoreState>,
}

/// Admission semaphore for readers of one shard.
#[derive(Clone)]
pub struct ReaderSemaphore {
    inner: Arc<SemaphoreInner>,
}

impl fmt::Debug for ReaderSemaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReaderSemaphore")
            .field("name", &self.inner.name)
            .field("capacity", &self.inner.capacity)
            .finish()
    }
}

impl ReaderSemaphore {
    /// Creates a semaphore with `capacity` bytes, handing out permits of
    /// `permit_weight` bytes.
    pub fn new(name: impl Into<String>, capacity: usize, permit_weight: usize) -> ReaderSemaphore {
        ReaderSemaphore {
            inner: Arc::new(SemaphoreInner {
                name: name.into(),
                capacity,
                permit_weight: permit_weight.min(capacity),
                state: Mutex::new(SemaphoreState::default()),
            }),
        }
    }

    /// Name of the semaphore.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Returns whether both handles refer to the same semaphore.
    pub fn is_same(&self, other: &ReaderSemaphore) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Mints a permit, evicting inactive readers if the pool is exhausted.
    pub fn make_permit(&self) -> Result<ReaderPermit> {
        let weight = self.inner.permit_weight;
        let mut evicted = Vec::new();
        {
            let mut state = self.inner.state.lock().unwrap();
            while state.used + weight > self.inner.capacity {
                let Some((&id, _)) = state.inactive.iter().next() else {
                    break;
                };
                // Entry callbacks run outside of the lock.
                evicted.push(state.inactive.remove(&id).unwrap());
            }
            if state.used + weight > self.inner.capacity {
                drop(state);
                self.run_eviction_callbacks(evicted);
                return PermitDeniedSnafu {
                    semaphore: self.inner.name.clone(),
                }
                .fail();
            }
            state.used += weight;
        }
        if !evicted.is_empty() {
            debug!(
                "Semaphore {} evicted {} inactive readers under pressure",
                self.inner.name,
                evicted.len()
            );
            self.run_eviction_callbacks(evicted);
        }
        Ok(ReaderPermit {
            inner: Arc::new(PermitInner {
                sem: Some(self.clone()),
                weight,
                parked: AtomicBool::new(false),
            }),
        })
    }

    /// Parks `reader` as an inactive handle. The reader's permit weight
    /// returns to the pool until the handle is resumed.
    pub fn register_inactive(
        &self,
        reader: FragmentReader,
        on_evict: Option<EvictionCallback>,
    ) -> InactiveHandle {
        reader.permit().park();
        let mut state = self.inner.state.lock().unwrap();
        let id = state.next_handle_id;
        state.next_handle_id += 1;
        state.inactive.insert(id, InactiveEntry { reader, on_evict });
        InactiveHandle {
            id,
            sem: self.clone(),
        }
    }

    /// Resumes the reader behind `handle`, or returns `None` if it was
    /// evicted in the meantime.
    pub fn try_resume(&self, handle: InactiveHandle) -> Option<FragmentReader> {
        assert!(
            self.is_same(&handle.sem),
            "inactive handle resumed on a foreign semaphore"
        );
        let entry = self.inner.state.lock().unwrap().inactive.remove(&handle.id)?;
        entry.reader.permit().unpark();
        Some(entry.reader)
    }

    /// Destroys the parked reader behind `handle` without firing its
    /// eviction callback.
    pub fn unregister_inactive_read(&self, handle: InactiveHandle) {
        let entry = self.inner.state.lock().unwrap().inactive.remove(&handle.id);
        // Dropped outside of the lock.
        drop(entry);
    }

    /// Evicts the oldest inactive reader. Returns false if none is parked.
    pub fn evict_one_inactive(&self) -> bool {
        let entry = {
            let mut state = self.inner.state.lock().unwrap();
            let Some((&id, _)) = state.inactive.iter().next() else {
                return false;
            };
            state.inactive.remove(&id)
        };
        self.run_eviction_callbacks(entry.into_iter().collect());
        true
    }

    /// Number of parked readers.
    pub fn inactive_count(&self) -> usize {
        self.inner.state.lock().unwrap().inactive.len()
    }

    /// Bytes currently admitted.
    pub fn used(&self) -> usize {
        self.inner.state.lock().unwrap().used
    }

    fn run_eviction_callbacks(&self, evicted: Vec<InactiveEntry>) {
        for entry in evicted {
            drop(entry.reader);
            if let Some(on_evict) = entry.on_evict {
                on_evict();
            }
        }
    }

    fn release(&self, weight: usize) {
        let mut state = self.inner.state.lock().unwrap();
        state.used = state.used.saturating_sub(weight);
    }

    fn reacquire(&self, weight: usize) {
        // Resuming never fails; the pool may briefly overcommit.
        let mut state = self.inner.state.lock().unwrap();
        state.used += weight;
    }
}

struct PermitInner {
    sem: Option<ReaderSemaphore>,
    weight: usize,
    parked: AtomicBool,
}

impl Drop for PermitInner {
    fn drop(&mut self) {
        if let Some(sem) = &self.sem {
            if !self.parked.load(Ordering::Acquire) {
                sem.release(self.weight);
            }
        }
    }
}

/// A token minted by a [ReaderSemaphore]. Cheap to clone; the weight is
/// returned when the last clone is dropped.
#[derive(Clone)]
pub struct ReaderPermit {
    inner: Arc<PermitInner>,
}

impl fmt::Debug for ReaderPermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReaderPermit")
            .field("weight", &self.inner.weight)
            .finish()
    }
}

impl ReaderPermit {
    /// A permit tracked by no semaphore. Used by readers whose memory is
    /// accounted elsewhere, e.g. the combining reader of a multishard read.
    pub fn untracked() -> ReaderPermit {
        ReaderPermit {
            inner: Arc::new(PermitInner {
                sem: None,
                weight: 0,
                parked: AtomicBool::new(false),
            }),
        }
    }

    /// Semaphore the permit belongs to.
    pub fn semaphore(&self) -> Option<&ReaderSemaphore> {
        self.inner.sem.as_ref()
    }

    fn park(&self) {
        if let Some(sem) = &self.inner.sem {
            if !self.inner.parked.swap(true, Ordering::AcqRel) {
                sem.release(self.inner.weight);
            }
        }
    }

    fn unpark(&self) {
        if let Some(sem) = &self.inner.sem {
            if self.inner.parked.swap(false, Ordering::AcqRel) {
                sem.reacquire(self.inner.weight);
            }
        }
    }
}

/// A token representing a parked reader, eligible for semaphore driven
/// eviction.
pub struct InactiveHandle {
    id: u64,
    sem: ReaderSemaphore,
}

impl fmt::Debug for InactiveHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InactiveHandle").field("id", &self.id).finish()
    }
}

impl InactiveHandle {
    /// Semaphore owning the parked reader.
    pub fn semaphore(&self) -> &ReaderSemaphore {
        &self.sem
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::test_util::{new_metadata, VecSource};

    fn reader(sem: &ReaderSemaphore) -> FragmentReader {
        let metadata = new_metadata();
        let permit = sem.make_permit().unwrap();
        FragmentReader::new(metadata, permit, Box::new(VecSource::empty()))
    }

    #[test]
    fn test_permit_returns_weight_on_drop() {
        let sem = ReaderSemaphore::new("test", 1024, 512);
        let permit = sem.make_permit().unwrap();
        assert_eq!(512, sem.used());
        drop(permit);
        assert_eq!(0, sem.used());
    }

    #[test]
    fn test_permit_denied_when_exhausted() {
        let sem = ReaderSemaphore::new("test", 1024, 512);
        let _a = sem.make_permit().unwrap();
        let _b = sem.make_permit().unwrap();
        assert!(sem.make_permit().is_err());
    }

    #[test]
    fn test_park_resume_round_trip() {
        let sem = ReaderSemaphore::new("test", 1024, 512);
        let reader = reader(&sem);
        assert_eq!(512, sem.used());

        let handle = sem.register_inactive(reader, None);
        // A parked reader holds no permit.
        assert_eq!(0, sem.used());
        assert_eq!(1, sem.inactive_count());

        let resumed = sem.try_resume(handle).unwrap();
        assert_eq!(512, sem.used());
        assert_eq!(0, sem.inactive_count());
        drop(resumed);
        assert_eq!(0, sem.used());
    }

    #[test]
    fn test_pressure_evicts_inactive() {
        let sem = ReaderSemaphore::new("test", 1024, 512);
        let evictions = Arc::new(AtomicUsize::new(0));

        let parked = reader(&sem);
        let count = evictions.clone();
        let handle = sem.register_inactive(
            parked,
            Some(Box::new(move || {
                count.fetch_add(1, Ordering::Relaxed);
            })),
        );

        // Two live permits fit; the third evicts the parked reader and
        // still fails because eviction does not lower `used`.
        let _a = sem.make_permit().unwrap();
        let _b = sem.make_permit().unwrap();
        assert!(sem.make_permit().is_err());
        assert_eq!(1, evictions.load(Ordering::Relaxed));
        assert!(sem.try_resume(handle).is_none());
    }

    #[test]
    fn test_unregister_skips_callback() {
        let sem = ReaderSemaphore::new("test", 1024, 512);
        let evictions = Arc::new(AtomicUsize::new(0));
        let count = evictions.clone();
        let handle = sem.register_inactive(
            reader(&sem),
            Some(Box::new(move || {
                count.fetch_add(1, Ordering::Relaxed);
            })),
        );
        sem.unregister_inactive_read(handle);
        assert_eq!(0, evictions.load(Ordering::Relaxed));
        assert_eq!(0, sem.inactive_count());
    }
}
