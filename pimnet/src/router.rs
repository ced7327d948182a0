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

use crate::packet::Packet;
use crate::Cycle;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Deterministic routing rule used by every router in a mesh.
///
/// The variants differ only in the next-hop computation; adding an algorithm
/// is a new variant plus a match arm in [`Router::route_port`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum RoutingAlgorithm {
    /// Exhaust the X offset, then the Y offset.
    XY,
    /// Exhaust the Y offset, then the X offset.
    YX,
    /// Any westward move happens first; afterwards the packet never turns
    /// west again, which breaks the cyclic turn dependency (turn model).
    WestFirst,
}

impl fmt::Display for RoutingAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::XY => write!(f, "xy"),
            Self::YX => write!(f, "yx"),
            Self::WestFirst => write!(f, "west-first"),
        }
    }
}

/// The five logical ports of a bufferless router.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RouterPort {
    North,
    South,
    East,
    West,
    Local,
}

/// One input and one output slot per port.
pub const PORT_COUNT: usize = 5;

impl RouterPort {
    /// The four neighbor-facing ports, in shuffle order.
    pub const DIRECTIONS: [RouterPort; 4] = [
        RouterPort::North,
        RouterPort::South,
        RouterPort::East,
        RouterPort::West,
    ];

    pub fn index(self) -> usize {
        match self {
            Self::North => 0,
            Self::South => 1,
            Self::East => 2,
            Self::West => 3,
            Self::Local => 4,
        }
    }

    /// The port a neighbor receives on when we emit in this direction.
    pub fn opposite(self) -> RouterPort {
        match self {
            Self::North => Self::South,
            Self::South => Self::North,
            Self::East => Self::West,
            Self::West => Self::East,
            Self::Local => Self::Local,
        }
    }

    /// Grid offset of the neighbor behind this port.
    pub fn offset(self) -> (isize, isize) {
        match self {
            Self::North => (0, 1),
            Self::South => (0, -1),
            Self::East => (1, 0),
            Self::West => (-1, 0),
            Self::Local => (0, 0),
        }
    }
}

impl fmt::Display for RouterPort {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::North => write!(f, "N"),
            Self::South => write!(f, "S"),
            Self::East => write!(f, "E"),
            Self::West => write!(f, "W"),
            Self::Local => write!(f, "L"),
        }
    }
}

/// A five-port bufferless switch at a fixed mesh position.
///
/// Each port has exactly one input slot and one output slot; a blocked
/// output exerts backpressure on the input holding the packet, it never
/// queues. The router itself never discards or duplicates a packet.
#[derive(Clone, Debug)]
pub struct Router {
    pos_x: usize,
    pos_y: usize,
    algorithm: RoutingAlgorithm,

    inputs: [Option<Packet>; PORT_COUNT],
    outputs: [Option<Packet>; PORT_COUNT],

    routed: u64,
    blocked: u64,
    total_hops: u64,
    cycles: Cycle,
}

impl Router {
    pub fn new(pos_x: usize, pos_y: usize, algorithm: RoutingAlgorithm) -> Self {
        Self {
            pos_x,
            pos_y,
            algorithm,
            inputs: Default::default(),
            outputs: Default::default(),
            routed: 0,
            blocked: 0,
            total_hops: 0,
            cycles: 0,
        }
    }

    pub fn position(&self) -> (usize, usize) {
        (self.pos_x, self.pos_y)
    }

    /// Place `packet` in the input slot of `port`. On backpressure the
    /// packet is handed back to the caller untouched.
    pub fn receive(&mut self, packet: Packet, port: RouterPort) -> Result<(), Packet> {
        let slot = &mut self.inputs[port.index()];
        if slot.is_some() {
            return Err(packet);
        }
        *slot = Some(packet);
        Ok(())
    }

    pub fn input_free(&self, port: RouterPort) -> bool {
        self.inputs[port.index()].is_none()
    }

    pub fn output_occupied(&self, port: RouterPort) -> bool {
        self.outputs[port.index()].is_some()
    }

    /// Clear and return the output slot of `port`; used by the mesh in the
    /// shuffle and delivery phases.
    pub fn take_output(&mut self, port: RouterPort) -> Option<Packet> {
        self.outputs[port.index()].take()
    }

    /// Packets currently held in any slot of this router.
    pub fn occupancy(&self) -> usize {
        self.inputs.iter().flatten().count() + self.outputs.iter().flatten().count()
    }

    /// Next-hop port for `packet` from this router's position.
    pub fn route_port(&self, packet: &Packet) -> RouterPort {
        let (dst_x, dst_y) = packet.destination();
        let dx = dst_x as isize - self.pos_x as isize;
        let dy = dst_y as isize - self.pos_y as isize;
        if dx == 0 && dy == 0 {
            return RouterPort::Local;
        }
        match self.algorithm {
            RoutingAlgorithm::XY => {
                if dx > 0 {
                    RouterPort::East
                } else if dx < 0 {
                    RouterPort::West
                } else if dy > 0 {
                    RouterPort::North
                } else {
                    RouterPort::South
                }
            }
            RoutingAlgorithm::YX => {
                if dy > 0 {
                    RouterPort::North
                } else if dy < 0 {
                    RouterPort::South
                } else if dx > 0 {
                    RouterPort::East
                } else {
                    RouterPort::West
                }
            }
            RoutingAlgorithm::WestFirst => {
                if dx < 0 {
                    RouterPort::West
                } else if dy > 0 {
                    RouterPort::North
                } else if dy < 0 {
                    RouterPort::South
                } else {
                    RouterPort::East
                }
            }
        }
    }

    /// Advance the router one cycle: move each input packet to its computed
    /// output slot when that slot is free.
    ///
    /// When several inputs target the same output, the oldest injection wins
    /// (ties broken by smaller id); losers stay in their input slots and
    /// each records one blocked event for the cycle.
    pub fn cycle(&mut self) {
        let mut targets: [Option<usize>; PORT_COUNT] = [None; PORT_COUNT];
        for (input, slot) in self.inputs.iter().enumerate() {
            if let Some(packet) = slot {
                targets[input] = Some(self.route_port(packet).index());
            }
        }

        for output in 0..PORT_COUNT {
            let mut winner: Option<usize> = None;
            let mut contenders = 0;
            for input in 0..PORT_COUNT {
                if targets[input] != Some(output) {
                    continue;
                }
                contenders += 1;
                winner = match winner {
                    None => Some(input),
                    Some(best) => {
                        let challenger = self.inputs[input].as_ref().expect("occupied input");
                        let incumbent = self.inputs[best].as_ref().expect("occupied input");
                        let challenger_key = (challenger.injected_at(), challenger.id());
                        let incumbent_key = (incumbent.injected_at(), incumbent.id());
                        if challenger_key < incumbent_key {
                            Some(input)
                        } else {
                            Some(best)
                        }
                    }
                };
            }
            let Some(winner) = winner else { continue };

            if self.outputs[output].is_some() {
                // The downstream slot did not drain; every contender stalls.
                self.blocked += contenders;
                continue;
            }
            self.blocked += contenders - 1;

            let mut packet = self.inputs[winner].take().expect("occupied input");
            if output != RouterPort::Local.index() {
                packet.hop_count += 1;
                self.total_hops += 1;
            }
            self.routed += 1;
            log::trace!(
                "router ({}, {}): packet {} -> output {}",
                self.pos_x,
                self.pos_y,
                packet.id(),
                output,
            );
            self.outputs[output] = Some(packet);
        }

        self.cycles += 1;
    }

    pub fn routed(&self) -> u64 {
        self.routed
    }

    pub fn blocked(&self) -> u64 {
        self.blocked
    }

    pub fn total_hops(&self) -> u64 {
        self.total_hops
    }

    pub fn cycles(&self) -> Cycle {
        self.cycles
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(id: u64, src: (usize, usize), dst: (usize, usize)) -> Packet {
        Packet::new(id, src, dst, vec![], 0)
    }

    fn packet_at(id: u64, injected_at: Cycle, dst: (usize, usize)) -> Packet {
        Packet::new(id, (0, 0), dst, vec![], injected_at)
    }

    #[test]
    fn xy_exhausts_x_before_y() {
        let router = Router::new(2, 2, RoutingAlgorithm::XY);
        assert_eq!(router.route_port(&packet(0, (0, 0), (4, 4))), RouterPort::East);
        assert_eq!(router.route_port(&packet(1, (0, 0), (0, 4))), RouterPort::West);
        assert_eq!(router.route_port(&packet(2, (0, 0), (2, 4))), RouterPort::North);
        assert_eq!(router.route_port(&packet(3, (0, 0), (2, 0))), RouterPort::South);
        assert_eq!(router.route_port(&packet(4, (0, 0), (2, 2))), RouterPort::Local);
    }

    #[test]
    fn yx_exhausts_y_before_x() {
        let router = Router::new(2, 2, RoutingAlgorithm::YX);
        assert_eq!(router.route_port(&packet(0, (0, 0), (4, 4))), RouterPort::North);
        assert_eq!(router.route_port(&packet(1, (0, 0), (4, 0))), RouterPort::South);
        assert_eq!(router.route_port(&packet(2, (0, 0), (4, 2))), RouterPort::East);
        assert_eq!(router.route_port(&packet(3, (0, 0), (0, 2))), RouterPort::West);
    }

    #[test]
    fn west_first_goes_west_before_anything_else() {
        let router = Router::new(2, 2, RoutingAlgorithm::WestFirst);
        // A westward component always wins.
        assert_eq!(router.route_port(&packet(0, (0, 0), (0, 4))), RouterPort::West);
        assert_eq!(router.route_port(&packet(1, (0, 0), (0, 0))), RouterPort::West);
        // Without one, vertical moves precede eastward moves.
        assert_eq!(router.route_port(&packet(2, (0, 0), (4, 4))), RouterPort::North);
        assert_eq!(router.route_port(&packet(3, (0, 0), (4, 0))), RouterPort::South);
        assert_eq!(router.route_port(&packet(4, (0, 0), (4, 2))), RouterPort::East);
    }

    #[test]
    fn forwards_input_to_free_output() {
        let mut router = Router::new(0, 0, RoutingAlgorithm::XY);
        router
            .receive(packet(7, (0, 0), (1, 0)), RouterPort::Local)
            .unwrap();
        router.cycle();
        assert!(router.input_free(RouterPort::Local));
        let forwarded = router.take_output(RouterPort::East).unwrap();
        assert_eq!(forwarded.id(), 7);
        assert_eq!(forwarded.hop_count(), 1);
        assert_eq!(router.routed(), 1);
        assert_eq!(router.blocked(), 0);
    }

    #[test]
    fn local_delivery_does_not_count_a_hop() {
        let mut router = Router::new(3, 4, RoutingAlgorithm::XY);
        router
            .receive(packet(1, (0, 0), (3, 4)), RouterPort::South)
            .unwrap();
        router.cycle();
        let delivered = router.take_output(RouterPort::Local).unwrap();
        assert_eq!(delivered.hop_count(), 0);
        assert_eq!(router.total_hops(), 0);
        assert_eq!(router.routed(), 1);
    }

    #[test]
    fn receive_backpressures_on_occupied_slot() {
        let mut router = Router::new(0, 0, RoutingAlgorithm::XY);
        router
            .receive(packet(1, (0, 0), (1, 0)), RouterPort::West)
            .unwrap();
        let rejected = router
            .receive(packet(2, (0, 0), (1, 0)), RouterPort::West)
            .unwrap_err();
        assert_eq!(rejected.id(), 2);
    }

    #[test]
    fn oldest_injection_wins_arbitration() {
        let mut router = Router::new(1, 1, RoutingAlgorithm::XY);
        // Both target East; the South-side packet was injected earlier.
        router
            .receive(packet_at(10, 5, (3, 1)), RouterPort::West)
            .unwrap();
        router
            .receive(packet_at(11, 2, (3, 1)), RouterPort::South)
            .unwrap();
        router.cycle();
        assert_eq!(router.take_output(RouterPort::East).unwrap().id(), 11);
        // The loser stays put and records one blocked cycle.
        assert!(!router.input_free(RouterPort::West));
        assert_eq!(router.blocked(), 1);
        assert_eq!(router.routed(), 1);
    }

    #[test]
    fn arbitration_ties_break_on_smaller_id() {
        let mut router = Router::new(1, 1, RoutingAlgorithm::XY);
        router
            .receive(packet_at(21, 5, (3, 1)), RouterPort::West)
            .unwrap();
        router
            .receive(packet_at(20, 5, (3, 1)), RouterPort::South)
            .unwrap();
        router.cycle();
        assert_eq!(router.take_output(RouterPort::East).unwrap().id(), 20);
    }

    #[test]
    fn occupied_output_blocks_without_losing_packets() {
        let mut router = Router::new(0, 0, RoutingAlgorithm::XY);
        router
            .receive(packet_at(1, 0, (2, 0)), RouterPort::Local)
            .unwrap();
        router.cycle();
        assert!(router.output_occupied(RouterPort::East));
        // The output never drained; a second packet stalls in its input.
        router
            .receive(packet_at(2, 1, (2, 0)), RouterPort::West)
            .unwrap();
        router.cycle();
        assert_eq!(router.blocked(), 1);
        assert!(!router.input_free(RouterPort::West));
        assert_eq!(router.occupancy(), 2);
        // Draining the output unblocks the follower on the next cycle.
        assert_eq!(router.take_output(RouterPort::East).unwrap().id(), 1);
        router.cycle();
        assert_eq!(router.take_output(RouterPort::East).unwrap().id(), 2);
    }
}
