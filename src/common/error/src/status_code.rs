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

use std::fmt;

/// Common status codes for the workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    /// Success.
    Success = 0,
    /// Unknown error.
    Unknown = 1000,
    /// Unexpected error, usually a bug.
    Unexpected = 1001,
    /// Internal server error.
    Internal = 1002,
    /// Invalid arguments.
    InvalidArguments = 1003,
    /// The operation was cancelled or aborted.
    Cancelled = 1004,
    /// The operation exceeded its deadline.
    DeadlineExceeded = 1005,
    /// The underlying storage is unavailable.
    StorageUnavailable = 2000,
    /// Runtime resources exhausted, the operation may be retried later.
    RuntimeResourcesExhausted = 2001,
    /// The requested table does not exist.
    TableNotFound = 3000,
    /// The table schema does not match the request.
    TableColumnNotFound = 3001,
}

impl StatusCode {
    /// Returns whether a request failing with this code can be retried
    /// without modification.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StatusCode::StorageUnavailable
                | StatusCode::RuntimeResourcesExhausted
                | StatusCode::DeadlineExceeded
        )
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The current debug format is suitable for display.
        write!(f, "{self:?}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable() {
        assert!(StatusCode::StorageUnavailable.is_retryable());
        assert!(StatusCode::DeadlineExceeded.is_retryable());
        assert!(!StatusCode::Unexpected.is_retryable());
        assert!(!StatusCode::TableNotFound.is_retryable());
    }

    #[test]
    fn test_display() {
        assert_eq!("TableNotFound", StatusCode::TableNotFound.to_string());
    }
}
