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

//! Configurations.

use std::time::Duration;

use common_telemetry::warn;
use serde::{Deserialize, Serialize};

/// Default TTL of a cached querier.
const DEFAULT_QUERIER_TTL: Duration = Duration::from_secs(10);
/// Default memory ceiling of the querier cache, per shard.
const DEFAULT_QUERIER_CACHE_MEMORY: usize = 1_000_000;
/// Default capacity of the reader admission semaphore, per shard.
const DEFAULT_SEMAPHORE_CAPACITY: usize = 64 * 1024 * 1024;
/// Default weight of one reader permit.
const DEFAULT_PERMIT_WEIGHT: usize = 128 * 1024;

/// Configuration for the engine.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct BasaltConfig {
    /// Number of shards (default: number of cpu cores).
    /// Sets to 0 to use the default value.
    pub num_shards: u32,

    /// TTL of cached queriers (default 10s).
    #[serde(with = "humantime_serde")]
    pub querier_cache_entry_ttl: Duration,
    /// Memory ceiling of the querier cache, per shard (default 1MB).
    pub querier_cache_memory_limit: usize,

    /// Capacity of the reader admission semaphore, per shard (default 64MB).
    pub reader_semaphore_capacity: usize,
    /// Weight of one reader permit (default 128KB).
    pub reader_permit_weight: usize,

    /// Initial size of the reverse read cache (default 4KB).
    pub reverse_read_initial_buffer_size: u64,
    /// Maximum size of the reverse read cache (default 128KB).
    pub reverse_read_max_buffer_size: u64,

    /// Units available for registering staging SSTables before
    /// registration starts to wait on the generator (default 16).
    pub staging_registration_units: usize,
}

impl Default for BasaltConfig {
    fn default() -> Self {
        BasaltConfig {
            num_shards: default_num_shards(),
            querier_cache_entry_ttl: DEFAULT_QUERIER_TTL,
            querier_cache_memory_limit: DEFAULT_QUERIER_CACHE_MEMORY,
            reader_semaphore_capacity: DEFAULT_SEMAPHORE_CAPACITY,
            reader_permit_weight: DEFAULT_PERMIT_WEIGHT,
            reverse_read_initial_buffer_size: 4 * 1024,
            reverse_read_max_buffer_size: 128 * 1024,
            staging_registration_units: 16,
        }
    }
}

impl BasaltConfig {
    /// Sanitize incorrect configurations.
    pub fn sanitize(&mut self) {
        if self.num_shards == 0 {
            self.num_shards = default_num_shards();
        }

        if self.reader_permit_weight > self.reader_semaphore_capacity {
            warn!(
                "Sanitize reader permit weight {} to semaphore capacity {}",
                self.reader_permit_weight, self.reader_semaphore_capacity
            );
            self.reader_permit_weight = self.reader_semaphore_capacity;
        }

        if self.reverse_read_initial_buffer_size == 0 {
            warn!("Sanitize reverse read initial buffer size 0 to 4096");
            self.reverse_read_initial_buffer_size = 4 * 1024;
        }

        if self.reverse_read_max_buffer_size < self.reverse_read_initial_buffer_size {
            self.reverse_read_max_buffer_size = self.reverse_read_initial_buffer_size;
        }

        if self.staging_registration_units == 0 {
            warn!("Sanitize staging registration units 0 to 1");
            self.staging_registration_units = 1;
        }
    }
}

fn default_num_shards() -> u32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize() {
        let mut config = BasaltConfig {
            num_shards: 0,
            reader_permit_weight: usize::MAX,
            reverse_read_initial_buffer_size: 0,
            reverse_read_max_buffer_size: 16,
            staging_registration_units: 0,
            ..Default::default()
        };
        config.sanitize();
        assert!(config.num_shards > 0);
        assert_eq!(config.reader_semaphore_capacity, config.reader_permit_weight);
        assert_eq!(4 * 1024, config.reverse_read_initial_buffer_size);
        assert_eq!(
            config.reverse_read_initial_buffer_size,
            config.reverse_read_max_buffer_size
        );
        assert_eq!(1, config.staging_registration_units);
    }
}
