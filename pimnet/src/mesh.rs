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

use crate::config::MeshConfiguration;
use crate::error::Error;
use crate::packet::{Packet, PacketId};
use crate::router::{Router, RouterPort, RoutingAlgorithm};
use crate::stats::{StatValue, StatsMap};
use crate::Cycle;
use itertools::iproduct;
use std::collections::HashMap;

/// A DPU endpoint named by its memory-hierarchy coordinates.
///
/// The fabric addresses routers by mesh position; this is the canonical
/// projection every component agrees on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DpuAddress {
    pub channel: usize,
    pub rank: usize,
    pub dpu: usize,
}

impl DpuAddress {
    /// Project onto the mesh: one column per (channel, rank), one row per
    /// DPU within the rank.
    pub fn mesh_position(&self, ranks_per_channel: usize) -> (usize, usize) {
        (self.channel * ranks_per_channel + self.rank, self.dpu)
    }
}

/// A W×H grid of bufferless routers advanced synchronously.
///
/// Each `cycle()` runs in three phases: every router forwards its inputs to
/// its output slots, the mesh shuffles neighbor-facing outputs into adjacent
/// input slots, and Local outputs drain into the delivered table. Keeping
/// the router phase separate from the shuffle phase is what limits every
/// packet to a single hop per tick.
///
/// Not thread-safe; the owner drives it from one thread.
#[derive(Debug)]
pub struct MeshNetwork {
    width: usize,
    height: usize,
    algorithm: RoutingAlgorithm,
    mtu: Option<usize>,

    /// Row-major: router (x, y) lives at index `y * width + x`.
    routers: Vec<Router>,

    /// Packets that reached their Local port, by id. Together with the
    /// router slots this holds every live packet exactly once.
    delivered: HashMap<PacketId, Packet>,

    next_packet_id: PacketId,
    in_flight: usize,
    injected: u64,
    cycles: Cycle,
}

impl MeshNetwork {
    pub fn new(config: &MeshConfiguration) -> Result<Self, Error> {
        config.validate()?;
        let routers = iproduct!(0..config.height, 0..config.width)
            .map(|(y, x)| Router::new(x, y, config.algorithm))
            .collect();
        log::info!(
            "mesh network initialized: {}x{} routers, {} routing",
            config.width,
            config.height,
            config.algorithm,
        );
        Ok(Self {
            width: config.width,
            height: config.height,
            algorithm: config.algorithm,
            mtu: config.mtu,
            routers,
            delivered: HashMap::new(),
            next_packet_id: 0,
            in_flight: 0,
            injected: 0,
            cycles: 0,
        })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn algorithm(&self) -> RoutingAlgorithm {
        self.algorithm
    }

    pub fn cycles(&self) -> Cycle {
        self.cycles
    }

    fn index(&self, x: usize, y: usize) -> usize {
        y * self.width + x
    }

    pub fn router(&self, x: usize, y: usize) -> &Router {
        &self.routers[self.index(x, y)]
    }

    fn check_position(&self, x: usize, y: usize, what: &str) -> Result<(), Error> {
        if x >= self.width || y >= self.height {
            return Err(Error::OutOfRange(format!(
                "{} ({}, {}) outside {}x{} mesh",
                what, x, y, self.width, self.height
            )));
        }
        Ok(())
    }

    /// Create a packet in the Local input slot of router (src_x, src_y).
    ///
    /// No id is allocated when the slot is occupied; the caller retries
    /// after the fabric has made progress.
    pub fn inject(
        &mut self,
        src_x: usize,
        src_y: usize,
        dst_x: usize,
        dst_y: usize,
        payload: Vec<u8>,
    ) -> Result<PacketId, Error> {
        self.check_position(src_x, src_y, "source")?;
        self.check_position(dst_x, dst_y, "destination")?;
        if let Some(mtu) = self.mtu {
            if payload.len() > mtu {
                return Err(Error::OutOfRange(format!(
                    "payload of {} bytes exceeds mtu {}",
                    payload.len(),
                    mtu
                )));
            }
        }

        let packet = Packet::new(
            self.next_packet_id,
            (src_x, src_y),
            (dst_x, dst_y),
            payload,
            self.cycles,
        );
        let index = self.index(src_x, src_y);
        match self.routers[index].receive(packet, RouterPort::Local) {
            Ok(()) => {
                let id = self.next_packet_id;
                self.next_packet_id += 1;
                self.in_flight += 1;
                self.injected += 1;
                log::trace!(
                    "inject packet {}: ({}, {}) -> ({}, {})",
                    id,
                    src_x,
                    src_y,
                    dst_x,
                    dst_y,
                );
                Ok(id)
            }
            Err(_rejected) => Err(Error::Backpressure),
        }
    }

    /// Advance the whole mesh one tick.
    pub fn cycle(&mut self) {
        self.cycles += 1;

        for router in &mut self.routers {
            router.cycle();
        }

        // Shuffle: emit every neighbor-facing output into the adjacent
        // input slot. Occupied inputs leave the packet in place; it retries
        // next tick.
        for (y, x) in iproduct!(0..self.height, 0..self.width) {
            for direction in RouterPort::DIRECTIONS {
                let from = self.index(x, y);
                if !self.routers[from].output_occupied(direction) {
                    continue;
                }
                let (dx, dy) = direction.offset();
                let nx = x as isize + dx;
                let ny = y as isize + dy;
                assert!(
                    nx >= 0 && ny >= 0 && (nx as usize) < self.width && (ny as usize) < self.height,
                    "router ({}, {}) routed a packet off-mesh towards {}",
                    x,
                    y,
                    direction,
                );
                let (nx, ny) = (nx as usize, ny as usize);
                let to = self.index(nx, ny);
                if !self.routers[to].input_free(direction.opposite()) {
                    continue;
                }
                let mut packet = self.routers[from]
                    .take_output(direction)
                    .expect("occupied output");
                packet.position = (nx, ny);
                if let Err(stale) = self.routers[to].receive(packet, direction.opposite()) {
                    panic!(
                        "packet {} lost the input slot it was checked into at ({}, {})",
                        stale.id(),
                        nx,
                        ny,
                    );
                }
            }
        }

        // Drain Local outputs into the delivered table.
        for index in 0..self.routers.len() {
            if let Some(mut packet) = self.routers[index].take_output(RouterPort::Local) {
                packet.delivered_at = Some(self.cycles);
                log::debug!(
                    "packet {} delivered at ({}, {}) after {} hops, latency {}",
                    packet.id(),
                    packet.position().0,
                    packet.position().1,
                    packet.hop_count(),
                    self.cycles - packet.injected_at(),
                );
                self.in_flight -= 1;
                let stale = self.delivered.insert(packet.id(), packet);
                assert!(stale.is_none(), "packet delivered twice");
            }
        }
    }

    /// Cycle until the fabric holds no packets, or give up after
    /// `max_cycles` additional ticks.
    pub fn run_until_empty(&mut self, max_cycles: Cycle) -> bool {
        for _ in 0..max_cycles {
            if self.in_flight == 0 {
                return true;
            }
            self.cycle();
        }
        self.in_flight == 0
    }

    pub fn is_delivered(&self, id: PacketId) -> bool {
        self.delivered.contains_key(&id)
    }

    /// Cycles the packet spent in the fabric, once delivered.
    pub fn latency(&self, id: PacketId) -> Option<Cycle> {
        self.delivered.get(&id).and_then(|packet| packet.latency())
    }

    pub fn delivered_packet(&self, id: PacketId) -> Option<&Packet> {
        self.delivered.get(&id)
    }

    pub fn packets_in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn packets_delivered(&self) -> usize {
        self.delivered.len()
    }

    /// Packets held in router slots right now; always equal to the
    /// injected-minus-delivered balance.
    pub fn occupancy(&self) -> usize {
        self.routers.iter().map(Router::occupancy).sum()
    }

    pub fn statistics(&self) -> StatsMap {
        let routed: u64 = self.routers.iter().map(Router::routed).sum();
        let blocked: u64 = self.routers.iter().map(Router::blocked).sum();
        let total_hops: u64 = self.routers.iter().map(Router::total_hops).sum();
        let delivered = self.delivered.len();

        let mut stats = StatsMap::new();
        stats.insert("packets_injected", self.injected.into());
        stats.insert("packets_delivered", delivered.into());
        stats.insert("packets_routed", routed.into());
        stats.insert("packets_blocked", blocked.into());
        stats.insert("total_hops", total_hops.into());
        stats.insert("cycles", self.cycles.into());
        if delivered > 0 {
            let latency_sum: usize = self
                .delivered
                .values()
                .filter_map(Packet::latency)
                .sum();
            stats.insert("avg_hops", (total_hops as f64 / delivered as f64).into());
            stats.insert(
                "avg_latency",
                (latency_sum as f64 / delivered as f64).into(),
            );
        } else {
            stats.insert("avg_hops", 0.0.into());
            stats.insert("avg_latency", 0.0.into());
        }
        if self.cycles > 0 {
            stats.insert(
                "throughput",
                (delivered as f64 / self.cycles as f64).into(),
            );
        } else {
            stats.insert("throughput", 0.0.into());
        }
        stats.insert(
            "avg_blocked_per_cycle",
            if self.cycles > 0 {
                StatValue::Float(blocked as f64 / self.cycles as f64)
            } else {
                StatValue::Float(0.0)
            },
        );
        stats
    }
}
