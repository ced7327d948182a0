// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use super::DRAIN_BUDGET;
use crate::error::Error;
use crate::mesh::MeshNetwork;
use crate::stats::StatsMap;
use crate::Cycle;

/// Binary-tree overlay in implicit heap layout: parent(i) = (i-1)/2,
/// children(i) = 2i+1, 2i+2.
///
/// Broadcast proceeds level by level; every node already holding the
/// payload injects to its children in the same round, so a full broadcast
/// takes ceil(log2 N) injection rounds plus mesh transport.
pub struct TreeCollective<'a> {
    network: &'a mut MeshNetwork,
    num_nodes: usize,
    positions: Vec<(usize, usize)>,
    drain_budget: Cycle,

    total_messages: u64,
    total_broadcasts: u64,
    /// Rounds executed by the most recent broadcast.
    last_levels: u64,
}

impl<'a> TreeCollective<'a> {
    pub fn new(network: &'a mut MeshNetwork, num_nodes: usize) -> Result<Self, Error> {
        if num_nodes == 0 {
            return Err(Error::InvalidConfig("tree requires at least one node".into()));
        }
        let capacity = network.width() * network.height();
        if num_nodes > capacity {
            return Err(Error::InvalidConfig(format!(
                "{} nodes exceed the {}x{} mesh",
                num_nodes,
                network.width(),
                network.height()
            )));
        }
        let height = network.height();
        let positions = (0..num_nodes).map(|i| (i / height, i % height)).collect();
        log::info!("tree topology initialized with {} nodes", num_nodes);
        Ok(Self {
            network,
            num_nodes,
            positions,
            drain_budget: DRAIN_BUDGET,
            total_messages: 0,
            total_broadcasts: 0,
            last_levels: 0,
        })
    }

    pub fn num_nodes(&self) -> usize {
        self.num_nodes
    }

    pub fn set_drain_budget(&mut self, budget: Cycle) {
        self.drain_budget = budget;
    }

    /// Map a heap index to a physical node for a broadcast rooted at
    /// `root`: indices 0 and `root` trade places, everything else stays.
    fn physical(&self, heap_index: usize, root: usize) -> usize {
        if heap_index == 0 {
            root
        } else if heap_index == root {
            0
        } else {
            heap_index
        }
    }

    /// Inject one round of parent-to-child packets, retrying injections
    /// that hit backpressure (a parent feeds two children through one Local
    /// slot), then drain the fabric. The whole round shares one budget.
    fn run_level(&mut self, sends: &[(usize, usize)], payload: &[u8]) -> Result<(), Error> {
        let mut pending = sends.to_vec();
        let mut budget = self.drain_budget;
        while !pending.is_empty() {
            let mut still_pending = Vec::new();
            for &(src, dst) in &pending {
                let (src_x, src_y) = self.positions[src];
                let (dst_x, dst_y) = self.positions[dst];
                match self
                    .network
                    .inject(src_x, src_y, dst_x, dst_y, payload.to_vec())
                {
                    Ok(_) => self.total_messages += 1,
                    Err(Error::Backpressure) => still_pending.push((src, dst)),
                    Err(other) => return Err(other),
                }
            }
            pending = still_pending;
            if pending.is_empty() {
                break;
            }
            if budget == 0 {
                return Err(Error::Timeout(self.drain_budget));
            }
            self.network.cycle();
            budget -= 1;
        }
        if !self.network.run_until_empty(budget) {
            return Err(Error::Timeout(self.drain_budget));
        }
        Ok(())
    }

    /// Broadcast `payload` from `root` to every node. Returns what each
    /// node holds afterwards, indexed by physical node id.
    pub fn broadcast(&mut self, root: usize, payload: &[u8]) -> Result<Vec<Vec<u8>>, Error> {
        if root >= self.num_nodes {
            return Err(Error::OutOfRange(format!(
                "root {} outside 0..{}",
                root, self.num_nodes
            )));
        }
        log::debug!(
            "tree broadcast from node {} over {} nodes",
            root,
            self.num_nodes
        );

        let mut holding: Vec<Option<Vec<u8>>> = vec![None; self.num_nodes];
        holding[root] = Some(payload.to_vec());
        let mut levels = 0u64;

        loop {
            // Every holder with an empty-handed child sends this round.
            let mut sends = Vec::new();
            for heap_index in 0..self.num_nodes {
                if holding[self.physical(heap_index, root)].is_none() {
                    continue;
                }
                for child in [2 * heap_index + 1, 2 * heap_index + 2] {
                    if child < self.num_nodes && holding[self.physical(child, root)].is_none() {
                        sends.push((
                            self.physical(heap_index, root),
                            self.physical(child, root),
                        ));
                    }
                }
            }
            if sends.is_empty() {
                break;
            }
            self.run_level(&sends, payload)?;
            for &(_, dst) in &sends {
                holding[dst] = Some(payload.to_vec());
            }
            levels += 1;
        }

        self.last_levels = levels;
        self.total_broadcasts += 1;
        log::debug!("tree broadcast complete after {} levels", levels);
        Ok(holding
            .into_iter()
            .map(|held| held.unwrap_or_default())
            .collect())
    }

    pub fn statistics(&self) -> StatsMap {
        let mut stats = StatsMap::new();
        stats.insert("num_nodes", self.num_nodes.into());
        stats.insert("total_messages", self.total_messages.into());
        stats.insert("total_broadcasts", self.total_broadcasts.into());
        stats.insert("levels", self.last_levels.into());
        stats.insert(
            "avg_messages_per_node",
            (self.total_messages as f64 / self.num_nodes as f64).into(),
        );
        let network = self.network.statistics();
        stats.insert("network_latency", network["avg_latency"]);
        stats.insert("network_throughput", network["throughput"]);
        stats
    }
}
