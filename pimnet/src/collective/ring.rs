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

use super::{apply_reduce, encode_int64, encode_int64_slice, ReduceOp, DRAIN_BUDGET};
use crate::error::Error;
use crate::mesh::MeshNetwork;
use crate::stats::StatsMap;
use crate::Cycle;

/// Ring overlay on the mesh: node i forwards to node (i + 1) mod N.
///
/// The collective borrows the mesh for its lifetime; it injects scheduled
/// traffic and drains it, but never touches the mesh topology. Each
/// operation runs rounds of "every node sends one packet to its successor",
/// waiting for the fabric to drain between rounds.
pub struct RingCollective<'a> {
    network: &'a mut MeshNetwork,
    num_nodes: usize,
    /// Mesh position of each ring index, using the canonical column-major
    /// DPU projection.
    positions: Vec<(usize, usize)>,
    drain_budget: Cycle,

    total_messages: u64,
    rounds: u64,
}

impl<'a> RingCollective<'a> {
    pub fn new(network: &'a mut MeshNetwork, num_nodes: usize) -> Result<Self, Error> {
        if num_nodes == 0 {
            return Err(Error::InvalidConfig("ring requires at least one node".into()));
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
        log::info!("ring topology initialized with {} nodes", num_nodes);
        Ok(Self {
            network,
            num_nodes,
            positions,
            drain_budget: DRAIN_BUDGET,
            total_messages: 0,
            rounds: 0,
        })
    }

    pub fn num_nodes(&self) -> usize {
        self.num_nodes
    }

    pub fn next_node(&self, node: usize) -> usize {
        (node + 1) % self.num_nodes
    }

    pub fn prev_node(&self, node: usize) -> usize {
        (node + self.num_nodes - 1) % self.num_nodes
    }

    /// Override the per-round drain budget (cycles).
    pub fn set_drain_budget(&mut self, budget: Cycle) {
        self.drain_budget = budget;
    }

    fn send_to_next(&mut self, node: usize, payload: Vec<u8>) -> Result<(), Error> {
        let (src_x, src_y) = self.positions[node];
        let (dst_x, dst_y) = self.positions[self.next_node(node)];
        self.network.inject(src_x, src_y, dst_x, dst_y, payload)?;
        self.total_messages += 1;
        Ok(())
    }

    /// One ring round: every node sends `payload(node)` to its successor,
    /// then the fabric drains.
    fn ring_round(&mut self, payload: impl Fn(usize) -> Vec<u8>) -> Result<(), Error> {
        for node in 0..self.num_nodes {
            self.send_to_next(node, payload(node))?;
        }
        if !self.network.run_until_empty(self.drain_budget) {
            return Err(Error::Timeout(self.drain_budget));
        }
        self.rounds += 1;
        Ok(())
    }

    /// Reduce `values` across all nodes; every node ends holding the same
    /// result.
    ///
    /// Phase 1 circulates each node's contribution around the ring, folding
    /// arrivals into a per-node accumulator (N-1 rounds). Phase 2 is N-1
    /// plain rotations that propagate the finished value. 2(N-1) injection
    /// rounds total.
    pub fn all_reduce(&mut self, values: &[i64], op: ReduceOp) -> Result<Vec<i64>, Error> {
        if values.len() != self.num_nodes {
            return Err(Error::InvalidConfig(format!(
                "{} initial values for {} nodes",
                values.len(),
                self.num_nodes
            )));
        }
        let n = self.num_nodes;
        log::debug!("ring all-reduce (op={}) over {} nodes", op, n);

        let mut accumulated = values.to_vec();
        let mut circulating = values.to_vec();
        for _ in 0..n - 1 {
            self.ring_round(|node| encode_int64(circulating[node]))?;
            let mut arrived = vec![0i64; n];
            for node in 0..n {
                arrived[node] = circulating[self.prev_node(node)];
            }
            circulating = arrived;
            for node in 0..n {
                accumulated[node] = apply_reduce(op, accumulated[node], circulating[node]);
            }
        }

        for _ in 0..n - 1 {
            self.ring_round(|node| encode_int64(accumulated[node]))?;
            let mut rotated = vec![0i64; n];
            for node in 0..n {
                rotated[node] = accumulated[self.prev_node(node)];
            }
            accumulated = rotated;
        }

        log::debug!("all-reduce complete: node values {:?}", accumulated);
        Ok(accumulated)
    }

    /// Column-wise reduction of an N-row matrix; entry i of the result is
    /// the fold of column i. Rows travel the ring for N-1 rounds.
    pub fn reduce_scatter(&mut self, rows: &[Vec<i64>], op: ReduceOp) -> Result<Vec<i64>, Error> {
        let n = self.num_nodes;
        if rows.len() != n {
            return Err(Error::InvalidConfig(format!(
                "{} rows for {} nodes",
                rows.len(),
                n
            )));
        }
        let width = rows[0].len();
        for (node, row) in rows.iter().enumerate() {
            if row.len() != width {
                return Err(Error::InvalidConfig(format!(
                    "node {} holds {} values, expected {}",
                    node,
                    row.len(),
                    width
                )));
            }
        }
        if width < n {
            return Err(Error::InvalidConfig(format!(
                "rows of {} values cannot scatter over {} nodes",
                width, n
            )));
        }

        let mut result = vec![0i64; n];
        for (column, slot) in result.iter_mut().enumerate() {
            let mut reduced = rows[0][column];
            for row in rows.iter().skip(1) {
                reduced = apply_reduce(op, reduced, row[column]);
            }
            *slot = reduced;
        }

        // The working rows rotate around the ring while each node folds its
        // assigned column.
        let mut circulating: Vec<Vec<i64>> = rows.to_vec();
        for _ in 0..n - 1 {
            self.ring_round(|node| encode_int64_slice(&circulating[node]))?;
            let mut arrived = Vec::with_capacity(n);
            for node in 0..n {
                arrived.push(circulating[self.prev_node(node)].clone());
            }
            circulating = arrived;
        }

        log::debug!("reduce-scatter complete: {:?}", result);
        Ok(result)
    }

    /// Every node contributes one value and ends holding all N, in index
    /// order. N-1 rotation rounds.
    pub fn all_gather(&mut self, values: &[i64]) -> Result<Vec<Vec<i64>>, Error> {
        let n = self.num_nodes;
        if values.len() != n {
            return Err(Error::InvalidConfig(format!(
                "{} initial values for {} nodes",
                values.len(),
                n
            )));
        }

        let mut gathered = vec![vec![0i64; n]; n];
        for (node, row) in gathered.iter_mut().enumerate() {
            row[node] = values[node];
        }
        // Each circulating entry keeps its original owner so arrivals land
        // at the right index.
        let mut circulating: Vec<(usize, i64)> =
            values.iter().copied().enumerate().collect();
        for _ in 0..n - 1 {
            self.ring_round(|node| encode_int64(circulating[node].1))?;
            let mut arrived = Vec::with_capacity(n);
            for node in 0..n {
                arrived.push(circulating[self.prev_node(node)]);
            }
            circulating = arrived;
            for node in 0..n {
                let (owner, value) = circulating[node];
                gathered[node][owner] = value;
            }
        }

        Ok(gathered)
    }

    pub fn statistics(&self) -> StatsMap {
        let mut stats = StatsMap::new();
        stats.insert("num_nodes", self.num_nodes.into());
        stats.insert("total_messages", self.total_messages.into());
        stats.insert("injection_rounds", self.rounds.into());
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MeshConfiguration;
    use crate::router::RoutingAlgorithm;

    fn mesh() -> MeshNetwork {
        MeshNetwork::new(&MeshConfiguration::default()).unwrap()
    }

    fn mesh_with(width: usize, height: usize) -> MeshNetwork {
        MeshNetwork::new(&MeshConfiguration {
            width,
            height,
            algorithm: RoutingAlgorithm::XY,
            mtu: None,
        })
        .unwrap()
    }

    #[test]
    fn all_reduce_sum_reaches_every_node() {
        let _logger = env_logger::builder().is_test(true).try_init();
        let mut net = mesh();
        let mut ring = RingCollective::new(&mut net, 4).unwrap();
        let result = ring.all_reduce(&[1, 2, 3, 4], ReduceOp::Sum).unwrap();
        assert_eq!(result, vec![10, 10, 10, 10]);
        // Two phases of N-1 rounds each.
        let stats = ring.statistics();
        assert_eq!(stats["injection_rounds"].as_i64(), 6);
        assert_eq!(stats["total_messages"].as_i64(), 24);
    }

    #[test]
    fn all_reduce_matches_a_direct_fold() {
        let inputs: Vec<i64> = vec![9, -4, 17, 0, 3, -11, 5, 2];
        for op in [ReduceOp::Sum, ReduceOp::Max, ReduceOp::Min, ReduceOp::Prod] {
            let mut net = mesh();
            let mut ring = RingCollective::new(&mut net, inputs.len()).unwrap();
            let expected = inputs
                .iter()
                .skip(1)
                .fold(inputs[0], |acc, &v| apply_reduce(op, acc, v));
            let result = ring.all_reduce(&inputs, op).unwrap();
            assert_eq!(result, vec![expected; inputs.len()], "op {}", op);
        }
    }

    #[test]
    fn all_reduce_handles_duplicate_inputs() {
        let mut net = mesh();
        let mut ring = RingCollective::new(&mut net, 5).unwrap();
        let result = ring.all_reduce(&[7, 7, 7, 7, 7], ReduceOp::Max).unwrap();
        assert_eq!(result, vec![7; 5]);
    }

    #[test]
    fn all_reduce_single_node_is_identity() {
        let mut net = mesh();
        let mut ring = RingCollective::new(&mut net, 1).unwrap();
        assert_eq!(ring.all_reduce(&[42], ReduceOp::Sum).unwrap(), vec![42]);
    }

    #[test]
    fn reduce_scatter_folds_columns() {
        let mut net = mesh();
        let mut ring = RingCollective::new(&mut net, 4).unwrap();
        let rows = vec![
            vec![10, 20, 30, 40],
            vec![1, 2, 3, 4],
            vec![5, 6, 7, 8],
            vec![9, 10, 11, 12],
        ];
        let result = ring.reduce_scatter(&rows, ReduceOp::Sum).unwrap();
        assert_eq!(result, vec![25, 38, 51, 64]);
    }

    #[test]
    fn reduce_scatter_rejects_ragged_or_narrow_rows() {
        let mut net = mesh();
        let mut ring = RingCollective::new(&mut net, 3).unwrap();
        let ragged = vec![vec![1, 2, 3], vec![4, 5], vec![6, 7, 8]];
        assert!(matches!(
            ring.reduce_scatter(&ragged, ReduceOp::Sum),
            Err(Error::InvalidConfig(_))
        ));
        let narrow = vec![vec![1, 2], vec![3, 4], vec![5, 6]];
        assert!(matches!(
            ring.reduce_scatter(&narrow, ReduceOp::Min),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn all_gather_distributes_every_value() {
        let mut net = mesh();
        let mut ring = RingCollective::new(&mut net, 4).unwrap();
        let values = vec![3, 1, 4, 1];
        let gathered = ring.all_gather(&values).unwrap();
        assert_eq!(gathered.len(), 4);
        for row in gathered {
            assert_eq!(row, values);
        }
    }

    #[test]
    fn node_count_must_fit_the_mesh() {
        let mut net = mesh_with(2, 2);
        assert!(matches!(
            RingCollective::new(&mut net, 5),
            Err(Error::InvalidConfig(_))
        ));
        assert!(matches!(
            RingCollective::new(&mut net, 0),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn exhausted_drain_budget_reports_timeout() {
        let mut net = mesh();
        let mut ring = RingCollective::new(&mut net, 8).unwrap();
        ring.set_drain_budget(1);
        let result = ring.all_reduce(&[1; 8], ReduceOp::Sum);
        assert_eq!(result, Err(Error::Timeout(1)));
        // The mesh is left intact for inspection.
        assert!(net.packets_in_flight() > 0);
        assert!(net.run_until_empty(1000));
    }

    #[test]
    fn ring_neighbors_wrap() {
        let mut net = mesh();
        let ring = RingCollective::new(&mut net, 4).unwrap();
        assert_eq!(ring.next_node(3), 0);
        assert_eq!(ring.prev_node(0), 3);
    }
}
