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

use std::any::Any;

use common_error::ext::ErrorExt;
use common_error::status_code::StatusCode;
use snafu::{Location, Snafu};
use store_api::metadata::TableId;
use store_api::storage::ShardId;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("OpenDAL operator failed"))]
    OpenDal {
        #[snafu(implicit)]
        location: Location,
        #[snafu(source)]
        error: opendal::Error,
    },

    #[snafu(display("Malformed SSTable {}, {}", path, reason))]
    MalformedSsTable {
        path: String,
        reason: String,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("Operation timed out, {}", operation))]
    Timeout {
        operation: String,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("Reader permit denied by semaphore {}", semaphore))]
    PermitDenied {
        semaphore: String,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display(
        "Schema version mismatch, expected {}, found {}",
        expected,
        actual
    ))]
    SchemaMismatch {
        expected: u64,
        actual: u64,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("Reader position is incompatible with the page start, {}", reason))]
    PositionMismatch {
        reason: String,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("Table {} not found", table_id))]
    TableNotFound {
        table_id: TableId,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("Operation aborted"))]
    AbortRequested {
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("Invariant violated, {}", reason))]
    InternalInvariant {
        reason: String,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("Shard {} worker is stopped", shard))]
    ShardStopped {
        shard: ShardId,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("Failed to join task"))]
    Join {
        #[snafu(source)]
        error: tokio::task::JoinError,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("Failed to recv result"))]
    Recv {
        #[snafu(source)]
        error: tokio::sync::oneshot::error::RecvError,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("Failed to decode key"))]
    DecodeKey {
        source: store_api::error::Error,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("Result exceeded max size {} and short reads are not allowed", max_size))]
    ResultSizeExceeded {
        max_size: u64,
        #[snafu(implicit)]
        location: Location,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

impl ErrorExt for Error {
    fn status_code(&self) -> StatusCode {
        use Error::*;

        match self {
            OpenDal { .. } => StatusCode::StorageUnavailable,
            MalformedSsTable { .. } | InternalInvariant { .. } | DecodeKey { .. } => {
                StatusCode::Unexpected
            }
            Timeout { .. } => StatusCode::DeadlineExceeded,
            PermitDenied { .. } => StatusCode::RuntimeResourcesExhausted,
            SchemaMismatch { .. } | PositionMismatch { .. } | ResultSizeExceeded { .. } => {
                StatusCode::InvalidArguments
            }
            TableNotFound { .. } => StatusCode::TableNotFound,
            AbortRequested { .. } => StatusCode::Cancelled,
            ShardStopped { .. } | Join { .. } | Recv { .. } => StatusCode::Internal,
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
