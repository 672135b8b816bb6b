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

//! Table metadata: an immutable description of a wide-column table.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use snafu::ensure;

use crate::error::{InvalidMetaSnafu, Result};
use crate::storage::ColumnType;

/// Id of a table.
pub type TableId = u64;

/// Id of a column inside a table. Stable across schema changes.
pub type ColumnId = u32;

/// Role a column plays in the table layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColumnKind {
    /// Part of the partition key tuple.
    PartitionKey,
    /// Part of the clustering key tuple.
    ClusteringKey,
    /// A regular column, attached to clustering rows.
    Regular,
    /// A static column, attached to the partition.
    Static,
}

/// Metadata of a column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMetadata {
    /// Id of the column.
    pub column_id: ColumnId,
    /// Name of the column.
    pub name: String,
    /// Type of the column, with a canonical binary serialization.
    pub column_type: ColumnType,
    /// Role of the column.
    pub kind: ColumnKind,
}

/// Immutable metadata of a table.
///
/// Columns are kept in their declared order; key columns additionally keep
/// their tuple order. The `schema_version` advances monotonically on every
/// alteration, `table_id` is stable for the table's lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableMetadata {
    /// Name of the table.
    pub name: String,
    /// Columns of the table, in declared order.
    pub column_metadatas: Vec<ColumnMetadata>,
    /// Id of the table.
    pub table_id: TableId,
    /// Version of the schema; advances on every alteration.
    pub schema_version: u64,
    /// Ids of partition key columns, in tuple order.
    partition_key: Vec<ColumnId>,
    /// Ids of clustering key columns, in tuple order.
    clustering_key: Vec<ColumnId>,
}

pub type TableMetadataRef = Arc<TableMetadata>;

impl TableMetadata {
    /// Returns a builder for the metadata.
    pub fn builder(name: impl Into<String>, table_id: TableId) -> TableMetadataBuilder {
        TableMetadataBuilder::new(name.into(), table_id)
    }

    /// Columns of the partition key, in tuple order.
    pub fn partition_key_columns(&self) -> impl Iterator<Item = &ColumnMetadata> {
        self.partition_key.iter().map(|id| self.column_by_id(*id).unwrap())
    }

    /// Columns of the clustering key, in tuple order.
    pub fn clustering_key_columns(&self) -> impl Iterator<Item = &ColumnMetadata> {
        self.clustering_key.iter().map(|id| self.column_by_id(*id).unwrap())
    }

    /// Regular (non-key, non-static) columns.
    pub fn regular_columns(&self) -> impl Iterator<Item = &ColumnMetadata> {
        self.column_metadatas
            .iter()
            .filter(|c| c.kind == ColumnKind::Regular)
    }

    /// Static columns.
    pub fn static_columns(&self) -> impl Iterator<Item = &ColumnMetadata> {
        self.column_metadatas
            .iter()
            .filter(|c| c.kind == ColumnKind::Static)
    }

    /// Number of clustering key columns.
    pub fn clustering_key_len(&self) -> usize {
        self.clustering_key.len()
    }

    /// Types of the clustering key columns, in tuple order.
    pub fn clustering_key_types(&self) -> Vec<ColumnType> {
        self.clustering_key_columns()
            .map(|c| c.column_type)
            .collect()
    }

    /// Types of the partition key columns, in tuple order.
    pub fn partition_key_types(&self) -> Vec<ColumnType> {
        self.partition_key_columns()
            .map(|c| c.column_type)
            .collect()
    }

    /// Finds a column by id.
    pub fn column_by_id(&self, column_id: ColumnId) -> Option<&ColumnMetadata> {
        self.column_metadatas
            .iter()
            .find(|c| c.column_id == column_id)
    }

    /// Finds a column by name.
    pub fn column_by_name(&self, name: &str) -> Option<&ColumnMetadata> {
        self.column_metadatas.iter().find(|c| c.name == name)
    }

    /// Ids of all static columns.
    pub fn static_column_ids(&self) -> Vec<ColumnId> {
        self.static_columns().map(|c| c.column_id).collect()
    }

    /// Ids of all regular columns.
    pub fn regular_column_ids(&self) -> Vec<ColumnId> {
        self.regular_columns().map(|c| c.column_id).collect()
    }
}

/// Builder of [TableMetadata].
#[derive(Debug)]
pub struct TableMetadataBuilder {
    name: String,
    table_id: TableId,
    schema_version: u64,
    column_metadatas: Vec<ColumnMetadata>,
}

impl TableMetadataBuilder {
    /// Returns a new builder.
    pub fn new(name: String, table_id: TableId) -> Self {
        Self {
            name,
            table_id,
            schema_version: 0,
            column_metadatas: Vec::new(),
        }
    }

    /// Sets the schema version.
    pub fn schema_version(mut self, version: u64) -> Self {
        self.schema_version = version;
        self
    }

    /// Pushes a column.
    pub fn push_column(
        mut self,
        column_id: ColumnId,
        name: impl Into<String>,
        column_type: ColumnType,
        kind: ColumnKind,
    ) -> Self {
        self.column_metadatas.push(ColumnMetadata {
            column_id,
            name: name.into(),
            column_type,
            kind,
        });
        self
    }

    /// Consumes the builder and builds the metadata.
    pub fn build(self) -> Result<TableMetadata> {
        let partition_key: Vec<_> = self
            .column_metadatas
            .iter()
            .filter(|c| c.kind == ColumnKind::PartitionKey)
            .map(|c| c.column_id)
            .collect();
        ensure!(
            !partition_key.is_empty(),
            InvalidMetaSnafu {
                reason: format!("table {} has no partition key column", self.name),
            }
        );

        let clustering_key: Vec<_> = self
            .column_metadatas
            .iter()
            .filter(|c| c.kind == ColumnKind::ClusteringKey)
            .map(|c| c.column_id)
            .collect();

        for (i, column) in self.column_metadatas.iter().enumerate() {
            let duplicate = self.column_metadatas[..i]
                .iter()
                .any(|c| c.column_id == column.column_id || c.name == column.name);
            ensure!(
                !duplicate,
                InvalidMetaSnafu {
                    reason: format!(
                        "duplicate column {} (id {}) in table {}",
                        column.name, column.column_id, self.name
                    ),
                }
            );
        }

        Ok(TableMetadata {
            name: self.name,
            column_metadatas: self.column_metadatas,
            table_id: self.table_id,
            schema_version: self.schema_version,
            partition_key,
            clustering_key,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_metadata() -> TableMetadata {
        TableMetadata::builder("t", 1)
            .push_column(0, "p", ColumnType::Int32, ColumnKind::PartitionKey)
            .push_column(1, "c", ColumnType::Int32, ColumnKind::ClusteringKey)
            .push_column(2, "s", ColumnType::Int32, ColumnKind::Static)
            .push_column(3, "v", ColumnType::Text, ColumnKind::Regular)
            .build()
            .unwrap()
    }

    #[test]
    fn test_build_metadata() {
        let meta = sample_metadata();
        assert_eq!(1, meta.partition_key_columns().count());
        assert_eq!(1, meta.clustering_key_columns().count());
        assert_eq!(vec![2], meta.static_column_ids());
        assert_eq!(vec![3], meta.regular_column_ids());
        assert_eq!("v", meta.column_by_id(3).unwrap().name);
        assert!(meta.column_by_name("missing").is_none());
    }

    #[test]
    fn test_no_partition_key() {
        let err = TableMetadata::builder("t", 1)
            .push_column(0, "v", ColumnType::Int64, ColumnKind::Regular)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("no partition key"));
    }

    #[test]
    fn test_duplicate_column() {
        let err = TableMetadata::builder("t", 1)
            .push_column(0, "p", ColumnType::Int32, ColumnKind::PartitionKey)
            .push_column(0, "q", ColumnType::Int32, ColumnKind::Regular)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("duplicate column"));
    }
}
