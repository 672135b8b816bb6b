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

//! Typed column values and their canonical binary serialization.

use std::mem;

use serde::{Deserialize, Serialize};
use snafu::ensure;

use crate::error::{DecodeValueSnafu, Result};

/// Type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColumnType {
    Int32,
    Int64,
    Text,
    Blob,
}

impl ColumnType {
    /// Decodes a value of this type from its canonical serialization.
    pub fn decode(&self, bytes: &[u8]) -> Result<Value> {
        match self {
            ColumnType::Int32 => {
                ensure!(
                    bytes.len() == 4,
                    DecodeValueSnafu {
                        type_name: "Int32",
                        reason: format!("expected 4 bytes, got {}", bytes.len()),
                    }
                );
                Ok(Value::Int32(i32::from_be_bytes(bytes.try_into().unwrap())))
            }
            ColumnType::Int64 => {
                ensure!(
                    bytes.len() == 8,
                    DecodeValueSnafu {
                        type_name: "Int64",
                        reason: format!("expected 8 bytes, got {}", bytes.len()),
                    }
                );
                Ok(Value::Int64(i64::from_be_bytes(bytes.try_into().unwrap())))
            }
            ColumnType::Text => {
                let text = std::str::from_utf8(bytes).map_err(|e| {
                    DecodeValueSnafu {
                        type_name: "Text",
                        reason: e.to_string(),
                    }
                    .build()
                })?;
                Ok(Value::Text(text.to_string()))
            }
            ColumnType::Blob => Ok(Value::Blob(bytes.to_vec())),
        }
    }
}

/// A typed value.
///
/// The derived ordering compares within one type; a well-formed key never
/// mixes types at one position.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Value {
    Int32(i32),
    Int64(i64),
    Text(String),
    Blob(Vec<u8>),
}

impl Value {
    /// Type of the value.
    pub fn column_type(&self) -> ColumnType {
        match self {
            Value::Int32(_) => ColumnType::Int32,
            Value::Int64(_) => ColumnType::Int64,
            Value::Text(_) => ColumnType::Text,
            Value::Blob(_) => ColumnType::Blob,
        }
    }

    /// Appends the canonical serialization of the value to `buf`.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        match self {
            Value::Int32(v) => buf.extend_from_slice(&v.to_be_bytes()),
            Value::Int64(v) => buf.extend_from_slice(&v.to_be_bytes()),
            Value::Text(v) => buf.extend_from_slice(v.as_bytes()),
            Value::Blob(v) => buf.extend_from_slice(v),
        }
    }

    /// Returns the canonical serialization of the value.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode_into(&mut buf);
        buf
    }

    /// Estimated memory used by the value.
    pub fn estimated_size(&self) -> usize {
        let heap = match self {
            Value::Int32(_) | Value::Int64(_) => 0,
            Value::Text(v) => v.len(),
            Value::Blob(v) => v.len(),
        };
        mem::size_of::<Value>() + heap
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Value {
        Value::Int32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Value {
        Value::Int64(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Value {
        Value::Text(v.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let values = [
            Value::Int32(-5),
            Value::Int64(1 << 40),
            Value::Text("hello".to_string()),
            Value::Blob(vec![0, 1, 2]),
        ];
        for value in values {
            let decoded = value.column_type().decode(&value.to_bytes()).unwrap();
            assert_eq!(value, decoded);
        }
    }

    #[test]
    fn test_decode_errors() {
        assert!(ColumnType::Int32.decode(&[0; 3]).is_err());
        assert!(ColumnType::Int64.decode(&[0; 9]).is_err());
        assert!(ColumnType::Text.decode(&[0xff, 0xfe]).is_err());
    }

    #[test]
    fn test_ordering() {
        assert!(Value::Int32(1) < Value::Int32(2));
        assert!(Value::Text("a".into()) < Value::Text("b".into()));
    }
}
