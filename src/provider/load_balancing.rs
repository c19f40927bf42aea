// Copyright Rouven Bauer
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use itertools::Itertools;

use super::RoutingControl;
use crate::address_::Address;

/// Least-connected server selection.
///
/// Orders candidates by their in-use connection count (fewest first).
/// Ties are broken round-robin with one rotating offset per access mode, so
/// equally loaded servers take turns being tried first.
/// The counts may be slightly stale while other acquisitions are in flight;
/// misplacement is self-correcting on the next acquire.
#[derive(Debug, Default)]
pub(crate) struct LeastConnected {
    read_rotation: AtomicUsize,
    write_rotation: AtomicUsize,
}

impl LeastConnected {
    /// Empty iff `addresses` is empty.
    pub(crate) fn order(
        &self,
        mode: RoutingControl,
        addresses: &[Arc<Address>],
        mut in_use: impl FnMut(&Address) -> usize,
    ) -> Vec<Arc<Address>> {
        match addresses.len() {
            0 => Vec::new(),
            1 => vec![Arc::clone(&addresses[0])],
            len => {
                let rotation = match mode {
                    RoutingControl::Read => &self.read_rotation,
                    RoutingControl::Write => &self.write_rotation,
                };
                let offset = rotation.fetch_add(1, Ordering::Relaxed) % len;
                (0..len)
                    .map(|i| &addresses[(offset + i) % len])
                    .map(|addr| (Arc::clone(addr), in_use(addr)))
                    // stable sort keeps the rotated order among ties
                    .sorted_by_key(|(_, usage)| *usage)
                    .map(|(addr, _)| addr)
                    .collect()
            }
        }
    }
}
