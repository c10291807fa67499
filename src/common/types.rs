// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
use std::fmt;

/// 128-bit identifier of a query or fragment instance.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct UniqueId {
    pub hi: i64,
    pub lo: i64,
}

impl UniqueId {
    pub fn new(hi: i64, lo: i64) -> Self {
        Self { hi, lo }
    }

    /// Label used for memory trackers and spill sub-directories.
    pub fn to_label(self) -> String {
        format!("{:x}_{:x}", self.hi, self.lo)
    }
}

impl fmt::Display for UniqueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hi = self.hi as u64;
        let lo = self.lo as u64;
        write!(
            f,
            "{:08x}-{:04x}-{:04x}-{:04x}-{:012x}",
            (hi >> 32) as u32,
            (hi >> 16) as u16,
            hi as u16,
            (lo >> 48) as u16,
            lo & 0x0000_FFFF_FFFF_FFFF
        )
    }
}

#[cfg(test)]
mod tests {
    use super::UniqueId;

    #[test]
    fn unique_id_display_uses_uuid_layout() {
        let id = UniqueId::new(116135542886790518, -7531368976812794106);
        assert_eq!(id.to_string(), "019c98a9-3390-7576-977b-33d188ad1f06");
    }

    #[test]
    fn unique_id_label_is_hex_pair() {
        assert_eq!(UniqueId::new(255, 16).to_label(), "ff_10");
    }
}
