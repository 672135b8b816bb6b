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

//! Basalt: the read path of a shard-partitioned wide-column storage engine.
//!
//! The engine executes paginated scans across shards, serves SSTable data in
//! forward and reverse clustering order, suspends readers between pages in a
//! querier cache and applies conditional (compare-and-set) mutations.

pub mod access;
pub mod cas;
pub mod config;
pub mod error;
pub mod memtable;
pub mod metrics;
pub mod multishard;
pub mod querier;
pub mod read;
pub mod semaphore;
pub mod shard;
pub mod sst;
#[cfg(test)]
pub(crate) mod test_util;
pub mod view;
