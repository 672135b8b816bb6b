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

//! Partition and clustering keys, tokens and shard dispatch.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::mem;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use snafu::ensure;

use crate::error::{DecodeValueSnafu, Result};
use crate::storage::value::{ColumnType, Value};

/// Id of a shard inside the process.
pub type ShardId = u32;

/// A 64-bit token derived from a partition key. Tokens define the global
/// ordering of partitions and their shard assignment.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Token(pub u64);

/// Maps tokens to shards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sharder {
    shard_count: u32,
}

impl Sharder {
    /// Creates a sharder dispatching over `shard_count` shards.
    pub fn new(shard_count: u32) -> Sharder {
        assert!(shard_count > 0);
        Sharder { shard_count }
    }

    /// Shard owning `token`.
    pub fn shard_of(&self, token: Token) -> ShardId {
        (token.0 % u64::from(self.shard_count)) as ShardId
    }

    /// Number of shards.
    pub fn shard_count(&self) -> u32 {
        self.shard_count
    }
}

/// Encodes key components as length-prefixed canonical values.
fn encode_components(values: &[Value], buf: &mut Vec<u8>) {
    for value in values {
        let bytes = value.to_bytes();
        buf.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
        buf.extend_from_slice(&bytes);
    }
}

/// Decodes length-prefixed components typed by `types`. Trailing components
/// may be absent (the key is then a prefix).
fn decode_components(mut bytes: &[u8], types: &[ColumnType]) -> Result<SmallVec<[Value; 4]>> {
    let mut values = SmallVec::new();
    for column_type in types {
        if bytes.is_empty() {
            break;
        }
        ensure!(
            bytes.len() >= 2,
            DecodeValueSnafu {
                type_name: "key",
                reason: "truncated component length",
            }
        );
        let len = u16::from_be_bytes(bytes[..2].try_into().unwrap()) as usize;
        bytes = &bytes[2..];
        ensure!(
            bytes.len() >= len,
            DecodeValueSnafu {
                type_name: "key",
                reason: "truncated component",
            }
        );
        values.push(column_type.decode(&bytes[..len])?);
        bytes = &bytes[len..];
    }
    ensure!(
        bytes.is_empty(),
        DecodeValueSnafu {
            type_name: "key",
            reason: "trailing bytes after key components",
        }
    );
    Ok(values)
}

/// A partition key: the full tuple of partition key column values.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct PartitionKey {
    pub values: SmallVec<[Value; 2]>,
}

impl PartitionKey {
    pub fn new(values: impl IntoIterator<Item = Value>) -> PartitionKey {
        PartitionKey {
            values: values.into_iter().collect(),
        }
    }

    /// Canonical serialization of the key.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        encode_components(&self.values, &mut buf);
        buf
    }

    /// Decodes a key from its canonical serialization.
    pub fn decode(bytes: &[u8], types: &[ColumnType]) -> Result<PartitionKey> {
        let values = decode_components(bytes, types)?;
        ensure!(
            values.len() == types.len(),
            DecodeValueSnafu {
                type_name: "partition key",
                reason: "partition keys must not be prefixes",
            }
        );
        Ok(PartitionKey {
            values: values.into_iter().collect(),
        })
    }

    /// Token of the key.
    pub fn token(&self) -> Token {
        let mut hasher = DefaultHasher::new();
        self.to_bytes().hash(&mut hasher);
        Token(hasher.finish())
    }

    /// Decorates the key with its token.
    pub fn decorate(self) -> DecoratedKey {
        DecoratedKey {
            token: self.token(),
            key: self,
        }
    }

    /// Estimated memory used by the key.
    pub fn estimated_size(&self) -> usize {
        mem::size_of::<Self>() + self.values.iter().map(Value::estimated_size).sum::<usize>()
    }
}

/// A partition key decorated with its token. Ordered by token first, ties
/// broken by the full key serialization.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct DecoratedKey {
    pub token: Token,
    pub key: PartitionKey,
}

impl DecoratedKey {
    /// Estimated memory used by the key.
    pub fn estimated_size(&self) -> usize {
        mem::size_of::<Token>() + self.key.estimated_size()
    }
}

/// A clustering key, possibly a prefix of the clustering columns.
///
/// The derived ordering is component-wise with shorter prefixes sorting
/// first, which matches the position of a prefix used as a lower bound.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct ClusteringKey {
    pub values: SmallVec<[Value; 4]>,
}

impl ClusteringKey {
    pub fn new(values: impl IntoIterator<Item = Value>) -> ClusteringKey {
        ClusteringKey {
            values: values.into_iter().collect(),
        }
    }

    /// The empty prefix.
    pub fn empty() -> ClusteringKey {
        ClusteringKey {
            values: SmallVec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Canonical serialization of the key.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        encode_components(&self.values, &mut buf);
        buf
    }

    /// Decodes a key (or prefix) from its canonical serialization.
    pub fn decode(bytes: &[u8], types: &[ColumnType]) -> Result<ClusteringKey> {
        Ok(ClusteringKey {
            values: decode_components(bytes, types)?,
        })
    }

    /// Estimated memory used by the key.
    pub fn estimated_size(&self) -> usize {
        mem::size_of::<Self>() + self.values.iter().map(Value::estimated_size).sum::<usize>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pkey(v: i32) -> PartitionKey {
        PartitionKey::new([Value::Int32(v)])
    }

    #[test]
    fn test_token_is_stable() {
        assert_eq!(pkey(1).token(), pkey(1).token());
        assert_ne!(pkey(1).token(), pkey(2).token());
    }

    #[test]
    fn test_shard_dispatch() {
        let sharder = Sharder::new(2);
        let shard = sharder.shard_of(pkey(7).token());
        assert!(shard < 2);
        assert_eq!(shard, sharder.shard_of(pkey(7).token()));
    }

    #[test]
    fn test_partition_key_round_trip() {
        let key = PartitionKey::new([Value::Int32(42), Value::Text("x".into())]);
        let types = [ColumnType::Int32, ColumnType::Text];
        let decoded = PartitionKey::decode(&key.to_bytes(), &types).unwrap();
        assert_eq!(key, decoded);
    }

    #[test]
    fn test_partition_key_rejects_prefix() {
        let key = pkey(42);
        let types = [ColumnType::Int32, ColumnType::Text];
        assert!(PartitionKey::decode(&key.to_bytes(), &types).is_err());
    }

    #[test]
    fn test_clustering_prefix_ordering() {
        let full = ClusteringKey::new([Value::Int32(1), Value::Int32(2)]);
        let prefix = ClusteringKey::new([Value::Int32(1)]);
        assert!(prefix < full);
        assert!(ClusteringKey::empty() < prefix);
    }

    #[test]
    fn test_clustering_key_round_trip() {
        let types = [ColumnType::Int32, ColumnType::Int32];
        let key = ClusteringKey::new([Value::Int32(1)]);
        let decoded = ClusteringKey::decode(&key.to_bytes(), &types).unwrap();
        assert_eq!(key, decoded);
    }

    #[test]
    fn test_decorated_key_orders_by_token() {
        let mut keys: Vec<_> = (0..16).map(|v| pkey(v).decorate()).collect();
        keys.sort();
        for pair in keys.windows(2) {
            assert!(pair[0].token <= pair[1].token);
        }
    }
}
