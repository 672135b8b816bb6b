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

use serde::{Deserialize, Serialize};

/// A deletion: the write timestamp it shadows and the wall-clock second it
/// was issued (used for purging).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeletionTime {
    /// Writes with a timestamp less than or equal to this are deleted.
    pub marked_for_delete_at: i64,
    /// Second the deletion was issued.
    pub local_deletion_time: u32,
}

impl DeletionTime {
    /// A deletion that shadows nothing.
    pub const LIVE: DeletionTime = DeletionTime {
        marked_for_delete_at: i64::MIN,
        local_deletion_time: u32::MAX,
    };

    /// Creates a deletion shadowing writes up to `timestamp`, issued at
    /// `local_deletion_time`.
    pub fn new(timestamp: i64, local_deletion_time: u32) -> DeletionTime {
        DeletionTime {
            marked_for_delete_at: timestamp,
            local_deletion_time,
        }
    }

    /// Returns whether this deletion shadows nothing.
    pub fn is_live(&self) -> bool {
        *self == DeletionTime::LIVE
    }

    /// Returns whether a write at `timestamp` is shadowed by this deletion.
    pub fn deletes(&self, timestamp: i64) -> bool {
        !self.is_live() && timestamp <= self.marked_for_delete_at
    }

    /// Merges two deletions, keeping the one shadowing more.
    pub fn merge(self, other: DeletionTime) -> DeletionTime {
        if other.marked_for_delete_at > self.marked_for_delete_at {
            other
        } else {
            self
        }
    }
}

impl Default for DeletionTime {
    fn default() -> DeletionTime {
        DeletionTime::LIVE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_live() {
        assert!(DeletionTime::LIVE.is_live());
        assert!(!DeletionTime::LIVE.deletes(i64::MIN));
        assert!(!DeletionTime::new(10, 1).is_live());
    }

    #[test]
    fn test_deletes_and_merge() {
        let t = DeletionTime::new(10, 1);
        assert!(t.deletes(9));
        assert!(t.deletes(10));
        assert!(!t.deletes(11));
        assert_eq!(DeletionTime::new(20, 2), t.merge(DeletionTime::new(20, 2)));
        assert_eq!(t, t.merge(DeletionTime::new(5, 9)));
        assert_eq!(t, DeletionTime::LIVE.merge(t));
    }
}
