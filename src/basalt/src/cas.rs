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

//! Conditional (compare-and-set) requests.
//!
//! A [CasRequest] collects the row updates of one partition, builds the
//! read command that prefetches the rows their conditions need, evaluates
//! the conditions against the prefetched state and, when they all hold,
//! folds the statements' updates into a single mutation.

use std::cell::Cell as StdCell;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use store_api::metadata::{ColumnId, ColumnKind, TableMetadataRef};
use store_api::storage::{
    ClusteringKey, ClusteringRange, DecoratedKey, PartitionSlice, ReadCommand, SliceOptions,
    Value, PARTITION_MAX_ROWS,
};

use crate::read::result::MutationResult;
use crate::read::Mutation;

/// Options a statement was bound with.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Time to live applied to the statement's writes, in seconds.
    pub time_to_live: Option<u32>,
}

/// One prefetched row, keyed by its clustering key. The static row is kept
/// under the empty clustering key; static columns are also visible through
/// every regular row.
#[derive(Debug, Default)]
pub struct PrefetchRow {
    pub cells: HashMap<ColumnId, Value>,
    /// Marked while evaluating conditions; rows in the CAS result set are
    /// returned to the client alongside the applied flag.
    pub is_in_cas_result_set: StdCell<bool>,
}

/// Per-partition materialisation of the rows needed to evaluate CAS
/// conditions and to apply read-before-write updates.
#[derive(Debug, Default)]
pub struct PrefetchData {
    rows: BTreeMap<ClusteringKey, PrefetchRow>,
}

impl PrefetchData {
    /// Builds prefetch data from the single-partition `result`.
    pub fn build(result: &MutationResult) -> PrefetchData {
        let mut rows = BTreeMap::new();
        let Some(partition) = result.partitions().first() else {
            return PrefetchData { rows };
        };

        let mut static_cells: HashMap<ColumnId, Value> = HashMap::new();
        if let Some(static_row) = &partition.static_row {
            for cell in &static_row.cells {
                if let Some(value) = &cell.value {
                    static_cells.insert(cell.column_id, value.clone());
                }
            }
            rows.insert(
                ClusteringKey::empty(),
                PrefetchRow {
                    cells: static_cells.clone(),
                    is_in_cas_result_set: StdCell::new(false),
                },
            );
        }

        for row in &partition.rows {
            let mut cells = static_cells.clone();
            for cell in &row.cells {
                if let Some(value) = &cell.value {
                    cells.insert(cell.column_id, value.clone());
                }
            }
            rows.insert(
                row.key.clone(),
                PrefetchRow {
                    cells,
                    is_in_cas_result_set: StdCell::new(false),
                },
            );
        }
        PrefetchData { rows }
    }

    /// Finds the row at `key`; the empty key addresses the static row.
    pub fn find_row(&self, key: &ClusteringKey) -> Option<&PrefetchRow> {
        self.rows.get(key)
    }

    /// Keys of the rows marked into the CAS result set.
    pub fn result_set_keys(&self) -> Vec<ClusteringKey> {
        self.rows
            .iter()
            .filter(|(_, row)| row.is_in_cas_result_set.get())
            .map(|(key, _)| key.clone())
            .collect()
    }
}

/// Parameters threaded into a statement's update application.
pub struct UpdateParams<'a> {
    pub metadata: &'a TableMetadataRef,
    pub timestamp: i64,
    pub time_to_live: Option<u32>,
    pub prefetch: &'a PrefetchData,
}

/// The statement-facing contract of the CAS path.
pub trait CasStatement: Send + Sync {
    /// Returns whether the statement has any conditions.
    fn has_conditions(&self) -> bool;

    /// Returns whether any condition references a static column.
    fn has_static_column_conditions(&self) -> bool;

    /// Returns whether every condition references static columns only.
    fn has_only_static_column_conditions(&self) -> bool;

    /// Returns whether applying the statement requires reading the old
    /// row even without conditions.
    fn requires_read(&self) -> bool;

    /// Columns the statement needs prefetched.
    fn columns_to_read(&self) -> Vec<ColumnId>;

    /// Evaluates the statement's conditions against `row`.
    fn applies_to(&self, row: Option<&PrefetchRow>, options: &QueryOptions) -> bool;

    /// Produces the statement's mutations.
    fn apply_updates(
        &self,
        key: &DecoratedKey,
        ranges: &[ClusteringRange],
        params: &UpdateParams<'_>,
        json_cache: &Option<serde_json::Value>,
    ) -> Vec<Mutation>;
}

/// One statement bound to its clustering ranges and options.
pub struct CasRowUpdate {
    pub statement: Arc<dyn CasStatement>,
    pub ranges: Vec<ClusteringRange>,
    pub json_cache: Option<serde_json::Value>,
    pub options: QueryOptions,
}

/// A conditional write against one partition.
pub struct CasRequest {
    metadata: TableMetadataRef,
    key: DecoratedKey,
    updates: Vec<CasRowUpdate>,
    rows: PrefetchData,
}

impl CasRequest {
    pub fn new(metadata: TableMetadataRef, key: DecoratedKey) -> CasRequest {
        CasRequest {
            metadata,
            key,
            updates: Vec::new(),
            rows: PrefetchData::default(),
        }
    }

    /// The partition the request targets.
    pub fn key(&self) -> &DecoratedKey {
        &self.key
    }

    /// Collects one per-statement row update.
    pub fn add_row_update(
        &mut self,
        statement: Arc<dyn CasStatement>,
        ranges: Vec<ClusteringRange>,
        json_cache: Option<serde_json::Value>,
        options: QueryOptions,
    ) {
        self.updates.push(CasRowUpdate {
            statement,
            ranges,
            json_cache,
            options,
        });
    }

    /// Builds the read command prefetching the rows the batch needs.
    ///
    /// Unions the columns of statements with conditions or read-before-
    /// write updates. When every contributing statement has only static
    /// column conditions the clustering ranges stay empty and one
    /// partition row is enough to tell a live partition from a missing
    /// one; otherwise the statements' ranges are unioned and deoverlapped.
    pub fn read_command(&self, query_time: u32, max_result_size: u64) -> ReadCommand {
        let mut columns: BTreeSet<ColumnId> = BTreeSet::new();
        let mut ranges: Vec<ClusteringRange> = Vec::new();

        for op in &self.updates {
            if !op.statement.has_conditions() && !op.statement.requires_read() {
                // No point in pre-fetching the old row if the statement
                // neither checks nor reads it.
                continue;
            }
            columns.extend(op.statement.columns_to_read());
            if op.statement.has_only_static_column_conditions() && !op.statement.requires_read() {
                // Any partition row will do for a static-only check.
                continue;
            }
            ranges.extend(op.ranges.iter().cloned());
        }

        let mut partition_row_limit = PARTITION_MAX_ROWS;
        if ranges.is_empty() {
            // With only static conditions we still want to distinguish a
            // missing partition from one that has live data but no static
            // content, so the first live row of the partition is read.
            ranges.push(ClusteringRange::full());
            partition_row_limit = 1;
        } else {
            ranges = ClusteringRange::deoverlap(ranges);
        }

        let mut static_columns = Vec::new();
        let mut regular_columns = Vec::new();
        for column_id in columns {
            match self.metadata.column_by_id(column_id).map(|c| c.kind) {
                Some(ColumnKind::Static) => static_columns.push(column_id),
                _ => regular_columns.push(column_id),
            }
        }

        let options = SliceOptions {
            always_return_static_content: true,
            ..SliceOptions::default()
        };
        let mut slice = PartitionSlice::new(static_columns, regular_columns, ranges, options);
        slice.set_partition_row_limit(partition_row_limit);

        ReadCommand {
            table_id: self.metadata.table_id,
            schema_version: self.metadata.schema_version,
            slice,
            row_limit: u64::MAX,
            partition_limit: 1,
            query_time,
            query_id: None,
            is_first_page: true,
            read_timestamp: i64::from(query_time) * 1_000_000,
            max_result_size,
        }
    }

    /// Evaluates the batch's conditions against the prefetched rows.
    ///
    /// Per statement, the row checked is (partition key, empty clustering
    /// key) for static-only conditions, otherwise the start of the
    /// statement's first range. Checked rows are marked into the CAS
    /// result set; evaluation short-circuits after the first failed
    /// condition but the scan continues so every statement's row is
    /// marked. If a static condition exists and no row was marked, the
    /// static row is marked so the result set reflects static state.
    pub fn applies_to(&self) -> bool {
        let empty_ckey = ClusteringKey::empty();
        let mut applies = true;
        let mut is_cas_result_set_empty = true;
        let mut has_static_column_conditions = false;

        for op in &self.updates {
            if !op.statement.has_conditions() {
                continue;
            }
            if op.statement.has_static_column_conditions() {
                has_static_column_conditions = true;
            }

            let ckey = if !op.statement.has_only_static_column_conditions() {
                op.ranges
                    .first()
                    .and_then(|range| range.start.as_ref())
                    .map(|bound| bound.key.clone())
                    .unwrap_or_else(ClusteringKey::empty)
            } else {
                empty_ckey.clone()
            };

            let row = self.rows.find_row(&ckey);
            if let Some(row) = row {
                row.is_in_cas_result_set.set(true);
                is_cas_result_set_empty = false;
            }
            if !applies {
                // A previous condition already failed; keep scanning only
                // to mark the rows of the remaining statements.
                continue;
            }
            applies = op.statement.applies_to(row, &op.options);
        }

        if has_static_column_conditions && is_cas_result_set_empty {
            if let Some(row) = self.rows.find_row(&empty_ckey) {
                row.is_in_cas_result_set.set(true);
            }
        }
        applies
    }

    /// Loads the prefetch data from `query_result`, evaluates the
    /// conditions and produces the batch's mutation if they hold.
    pub fn apply(
        &mut self,
        query_result: &MutationResult,
        _slice: &PartitionSlice,
        timestamp: i64,
    ) -> Option<Mutation> {
        self.rows = PrefetchData::build(query_result);
        if self.applies_to() {
            self.apply_updates(timestamp)
        } else {
            None
        }
    }

    /// Rows marked into the CAS result set by the last evaluation.
    pub fn result_set_keys(&self) -> Vec<ClusteringKey> {
        self.rows.result_set_keys()
    }

    /// Folds every statement's updates into one partition mutation.
    fn apply_updates(&self, timestamp: i64) -> Option<Mutation> {
        let mut mutation_set: Option<Mutation> = None;
        for op in &self.updates {
            let params = UpdateParams {
                metadata: &self.metadata,
                timestamp,
                time_to_live: op.options.time_to_live,
                prefetch: &self.rows,
            };
            let statement_mutations =
                op.statement
                    .apply_updates(&self.key, &op.ranges, &params, &op.json_cache);
            for mutation in statement_mutations {
                match &mut mutation_set {
                    None => mutation_set = Some(mutation),
                    Some(set) => set.apply(mutation),
                }
            }
        }
        mutation_set
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use store_api::storage::{ClusteringBound, PartitionKey, PartitionRange};

    use super::*;
    use crate::memtable::Memtable;
    use crate::querier::Querier;
    use crate::read::result::MutationResultBuilder;
    use crate::read::{Cell, ClusteringRow};
    use crate::semaphore::ReaderPermit;
    use crate::test_util::{insert_static, new_metadata, COL_S, COL_V};

    /// An equality-condition update statement: `SET <sets> WHERE c = ck
    /// IF <conditions>`.
    struct TestStatement {
        metadata: TableMetadataRef,
        conditions: Vec<(ColumnId, Value)>,
        sets: Vec<(ColumnId, Value)>,
        requires_read: bool,
    }

    impl TestStatement {
        fn is_static(&self, column_id: ColumnId) -> bool {
            self.metadata
                .column_by_id(column_id)
                .map(|c| c.kind == ColumnKind::Static)
                .unwrap_or(false)
        }
    }

    impl CasStatement for TestStatement {
        fn has_conditions(&self) -> bool {
            !self.conditions.is_empty()
        }

        fn has_static_column_conditions(&self) -> bool {
            self.conditions.iter().any(|(id, _)| self.is_static(*id))
        }

        fn has_only_static_column_conditions(&self) -> bool {
            self.has_conditions() && self.conditions.iter().all(|(id, _)| self.is_static(*id))
        }

        fn requires_read(&self) -> bool {
            self.requires_read
        }

        fn columns_to_read(&self) -> Vec<ColumnId> {
            let mut columns: Vec<_> = self.conditions.iter().map(|(id, _)| *id).collect();
            if self.requires_read {
                columns.extend(self.sets.iter().map(|(id, _)| *id));
            }
            columns
        }

        fn applies_to(&self, row: Option<&PrefetchRow>, _options: &QueryOptions) -> bool {
            self.conditions.iter().all(|(id, expected)| {
                row.and_then(|r| r.cells.get(id)).map(|v| v == expected) == Some(true)
            })
        }

        fn apply_updates(
            &self,
            key: &DecoratedKey,
            ranges: &[ClusteringRange],
            params: &UpdateParams<'_>,
            _json_cache: &Option<serde_json::Value>,
        ) -> Vec<Mutation> {
            let mut mutation = Mutation::new(key.clone());
            let ckey = ranges
                .first()
                .and_then(|range| range.start.as_ref())
                .map(|bound| bound.key.clone())
                .unwrap_or_else(ClusteringKey::empty);
            let mut row_cells = Vec::new();
            for (column_id, value) in &self.sets {
                let cell = Cell::live(*column_id, params.timestamp, value.clone());
                if self.is_static(*column_id) {
                    mutation.static_cells.push(cell);
                } else {
                    row_cells.push(cell);
                }
            }
            if !row_cells.is_empty() {
                mutation.rows.push(ClusteringRow::new(ckey, row_cells));
            }
            vec![mutation]
        }
    }

    fn singular_range(c: i32) -> Vec<ClusteringRange> {
        vec![ClusteringRange::new(
            Some(ClusteringBound::inclusive(ClusteringKey::new([
                Value::Int32(c),
            ]))),
            Some(ClusteringBound::inclusive(ClusteringKey::new([
                Value::Int32(c),
            ]))),
        )]
    }

    /// Runs the prefetch read of `request` against `memtable`.
    async fn prefetch(request: &CasRequest, memtable: &Memtable) -> (MutationResult, PartitionSlice) {
        let cmd = request.read_command(100, u64::MAX);
        let mut querier = Querier::new(
            memtable,
            new_metadata(),
            ReaderPermit::untracked(),
            PartitionRange::singular(request.key().clone()),
            cmd.slice.clone(),
            None,
            true,
        )
        .unwrap();
        let result = querier
            .consume_page(
                MutationResultBuilder::new(u64::MAX, false),
                cmd.row_limit,
                cmd.partition_limit,
                cmd.query_time,
                Instant::now() + Duration::from_secs(60),
            )
            .await
            .unwrap();
        (result, cmd.slice)
    }

    fn pkey(p: i32) -> DecoratedKey {
        PartitionKey::new([Value::Int32(p)]).decorate()
    }

    #[tokio::test]
    async fn test_static_only_condition_applies_without_rows() {
        // INSERT (p=1, s=1); UPDATE SET v='x' WHERE p=1 AND c=1 IF s=1.
        let metadata = new_metadata();
        let memtable = Memtable::new(0, metadata.clone());
        insert_static(&memtable, 1, 1, 1);

        let mut request = CasRequest::new(metadata.clone(), pkey(1));
        request.add_row_update(
            Arc::new(TestStatement {
                metadata: metadata.clone(),
                conditions: vec![(COL_S, Value::Int32(1))],
                sets: vec![(COL_V, Value::Text("x".into()))],
                requires_read: false,
            }),
            singular_range(1),
            None,
            QueryOptions::default(),
        );

        // Static-only conditions read one partition row over the full
        // clustering range.
        let cmd = request.read_command(100, u64::MAX);
        assert_eq!(1, cmd.slice.partition_row_limit);
        assert_eq!(vec![ClusteringRange::full()], cmd.slice.clustering_ranges);
        assert!(cmd.slice.options.always_return_static_content);

        let (result, slice) = prefetch(&request, &memtable).await;
        let mutation = request.apply(&result, &slice, 7).expect("must apply");
        assert_eq!(pkey(1), mutation.key);
        assert_eq!(ClusteringKey::new([Value::Int32(1)]), mutation.rows[0].key);
        assert_eq!(
            Some(Value::Text("x".into())),
            mutation.rows[0].cells[0].value
        );
        // The static row is part of the CAS result set.
        assert_eq!(vec![ClusteringKey::empty()], request.result_set_keys());
    }

    #[tokio::test]
    async fn test_failed_static_condition_marks_static_row() {
        // DELETE v WHERE p=1 AND c=1 IF v='x' AND s=1 against a partition
        // with only a static row: does not apply, but the static row must
        // be in the result set.
        let metadata = new_metadata();
        let memtable = Memtable::new(0, metadata.clone());
        insert_static(&memtable, 1, 1, 1);

        let mut request = CasRequest::new(metadata.clone(), pkey(1));
        request.add_row_update(
            Arc::new(TestStatement {
                metadata: metadata.clone(),
                conditions: vec![(COL_V, Value::Text("x".into())), (COL_S, Value::Int32(1))],
                sets: vec![(COL_V, Value::Text("y".into()))],
                requires_read: false,
            }),
            singular_range(1),
            None,
            QueryOptions::default(),
        );

        let (result, slice) = prefetch(&request, &memtable).await;
        assert!(request.apply(&result, &slice, 7).is_none());
        assert_eq!(vec![ClusteringKey::empty()], request.result_set_keys());
    }

    #[tokio::test]
    async fn test_condition_on_existing_row() {
        let metadata = new_metadata();
        let memtable = Memtable::new(0, metadata.clone());
        crate::test_util::insert_row(&memtable, 1, 1, "old", 1);

        let mut request = CasRequest::new(metadata.clone(), pkey(1));
        request.add_row_update(
            Arc::new(TestStatement {
                metadata: metadata.clone(),
                conditions: vec![(COL_V, Value::Text("old".into()))],
                sets: vec![(COL_V, Value::Text("new".into()))],
                requires_read: false,
            }),
            singular_range(1),
            None,
            QueryOptions::default(),
        );

        let (result, slice) = prefetch(&request, &memtable).await;
        let mutation = request.apply(&result, &slice, 9).expect("must apply");
        assert_eq!(
            Some(Value::Text("new".into())),
            mutation.rows[0].cells[0].value
        );
        assert_eq!(
            vec![ClusteringKey::new([Value::Int32(1)])],
            request.result_set_keys()
        );
    }

    #[tokio::test]
    async fn test_failing_condition_short_circuits_but_marks_all_rows() {
        let metadata = new_metadata();
        let memtable = Memtable::new(0, metadata.clone());
        crate::test_util::insert_row(&memtable, 1, 1, "a", 1);
        crate::test_util::insert_row(&memtable, 1, 2, "b", 1);

        let mut request = CasRequest::new(metadata.clone(), pkey(1));
        for (c, expected) in [(1, "wrong"), (2, "b")] {
            request.add_row_update(
                Arc::new(TestStatement {
                    metadata: metadata.clone(),
                    conditions: vec![(COL_V, Value::Text(expected.into()))],
                    sets: vec![(COL_V, Value::Text("z".into()))],
                    requires_read: false,
                }),
                singular_range(c),
                None,
                QueryOptions::default(),
            );
        }

        let (result, slice) = prefetch(&request, &memtable).await;
        assert!(request.apply(&result, &slice, 9).is_none());
        // Both statement rows were marked despite the early failure.
        assert_eq!(
            vec![
                ClusteringKey::new([Value::Int32(1)]),
                ClusteringKey::new([Value::Int32(2)]),
            ],
            request.result_set_keys()
        );
    }

    #[test]
    fn test_read_command_unions_and_deoverlaps_ranges() {
        let metadata = new_metadata();
        let mut request = CasRequest::new(metadata.clone(), pkey(1));
        for c in [1, 1, 2] {
            request.add_row_update(
                Arc::new(TestStatement {
                    metadata: metadata.clone(),
                    conditions: vec![(COL_V, Value::Text("x".into()))],
                    sets: vec![(COL_V, Value::Text("y".into()))],
                    requires_read: false,
                }),
                singular_range(c),
                None,
                QueryOptions::default(),
            );
        }
        let cmd = request.read_command(100, u64::MAX);
        // Singulars at 1, 1 and 2 deoverlap into two ranges.
        assert_eq!(2, cmd.slice.clustering_ranges.len());
        assert_eq!(PARTITION_MAX_ROWS, cmd.slice.partition_row_limit);
        assert_eq!(vec![COL_V], cmd.slice.regular_columns);
        assert!(cmd.slice.static_columns.is_empty());
    }

    #[test]
    fn test_statement_without_conditions_not_prefetched() {
        let metadata = new_metadata();
        let mut request = CasRequest::new(metadata.clone(), pkey(1));
        request.add_row_update(
            Arc::new(TestStatement {
                metadata: metadata.clone(),
                conditions: Vec::new(),
                sets: vec![(COL_V, Value::Text("y".into()))],
                requires_read: false,
            }),
            singular_range(1),
            None,
            QueryOptions::default(),
        );
        let cmd = request.read_command(100, u64::MAX);
        // No conditions and no read-before-write: nothing to prefetch
        // beyond the static-only shape.
        assert!(cmd.slice.regular_columns.is_empty());
        assert_eq!(1, cmd.slice.partition_row_limit);
    }
}
