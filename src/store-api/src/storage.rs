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

//! Storage APIs.

mod keys;
mod range;
mod requests;
mod types;
mod value;

pub use self::keys::{ClusteringKey, DecoratedKey, PartitionKey, ShardId, Sharder, Token};
pub use self::range::{ClusteringBound, ClusteringRange, PartitionRange};
pub use self::requests::{PartitionSlice, ReadCommand, SliceOptions, PARTITION_MAX_ROWS};
pub use self::types::DeletionTime;
pub use self::value::{ColumnType, Value};
