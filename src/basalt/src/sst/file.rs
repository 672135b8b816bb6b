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

//! SSTable file handles.

use std::fmt;
use std::sync::Arc;

use store_api::metadata::TableMetadataRef;
use uuid::Uuid;

use crate::sst::index::SsTableIndex;

/// Id of an SSTable file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileId(Uuid);

impl FileId {
    /// Returns a new unique [FileId].
    pub fn random() -> FileId {
        FileId(Uuid::new_v4())
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An immutable SSTable: its data file path and in-memory index.
pub struct SsTable {
    /// Id of the SSTable.
    pub file_id: FileId,
    /// Path of the data file in the object store.
    pub data_path: String,
    /// Metadata of the table the SSTable belongs to.
    pub metadata: TableMetadataRef,
    /// Partition index of the data file.
    pub index: SsTableIndex,
    /// Size of the data file in bytes.
    pub file_size: u64,
}

pub type SsTableRef = Arc<SsTable>;

impl fmt::Debug for SsTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SsTable")
            .field("file_id", &self.file_id)
            .field("data_path", &self.data_path)
            .field("file_size", &self.file_size)
            .field("partitions", &self.index.entries.len())
            .finish()
    }
}

impl SsTable {
    /// Path of the data file for `file_id`.
    pub fn data_file_path(file_id: FileId) -> String {
        format!("{file_id}.data")
    }
}
