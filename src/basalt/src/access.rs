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

//! Access layer for SSTable data files.

use std::sync::Arc;

use bytes::Bytes;
use opendal::Operator;
use snafu::ResultExt;

use crate::error::{OpenDalSnafu, Result};

/// Reads and writes SSTable data through an object store.
#[derive(Clone)]
pub struct AccessLayer {
    object_store: Operator,
}

pub type AccessLayerRef = Arc<AccessLayer>;

impl AccessLayer {
    pub fn new(object_store: Operator) -> AccessLayer {
        AccessLayer { object_store }
    }

    /// An access layer over an in-memory object store.
    pub fn memory() -> AccessLayer {
        let object_store = Operator::new(opendal::services::Memory::default())
            .unwrap()
            .finish();
        AccessLayer::new(object_store)
    }

    /// Reads the bytes of `path` in `[start, end)`.
    pub async fn read_range(&self, path: &str, start: u64, end: u64) -> Result<Bytes> {
        if start >= end {
            return Ok(Bytes::new());
        }
        let buffer = self
            .object_store
            .read_with(path)
            .range(start..end)
            .await
            .context(OpenDalSnafu)?;
        Ok(buffer.to_bytes())
    }

    /// Writes `data` to `path`, replacing any previous content.
    pub async fn write(&self, path: &str, data: Vec<u8>) -> Result<()> {
        self.object_store.write(path, data).await.context(OpenDalSnafu)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ranged_read() {
        let access = AccessLayer::memory();
        access.write("part", vec![0, 1, 2, 3, 4, 5]).await.unwrap();

        let bytes = access.read_range("part", 2, 5).await.unwrap();
        assert_eq!(Bytes::from_static(&[2, 3, 4]), bytes);
        assert!(access.read_range("part", 3, 3).await.unwrap().is_empty());
    }
}
