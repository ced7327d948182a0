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

use crate::Cycle;

/// Monotonically increasing per-mesh packet identifier.
pub type PacketId = u64;

/// A unit of traffic on the mesh: an immutable payload plus the routing
/// state the fabric mutates as the packet moves.
///
/// A packet is owned by exactly one router slot while in transit and by the
/// mesh's delivered table afterwards; it is never aliased.
#[derive(Clone, Debug)]
pub struct Packet {
    id: PacketId,
    src: (usize, usize),
    dst: (usize, usize),
    payload: Vec<u8>,

    /// Router boundaries crossed so far. Under dimension-ordered routing
    /// this equals the Manhattan distance from source to destination once
    /// the packet is delivered.
    pub(crate) hop_count: u32,

    pub(crate) injected_at: Cycle,
    pub(crate) delivered_at: Option<Cycle>,

    /// Position of the router currently holding the packet.
    pub(crate) position: (usize, usize),
}

impl Packet {
    pub(crate) fn new(
        id: PacketId,
        src: (usize, usize),
        dst: (usize, usize),
        payload: Vec<u8>,
        injected_at: Cycle,
    ) -> Self {
        Self {
            id,
            src,
            dst,
            payload,
            hop_count: 0,
            injected_at,
            delivered_at: None,
            position: src,
        }
    }

    pub fn id(&self) -> PacketId {
        self.id
    }

    pub fn source(&self) -> (usize, usize) {
        self.src
    }

    pub fn destination(&self) -> (usize, usize) {
        self.dst
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn hop_count(&self) -> u32 {
        self.hop_count
    }

    pub fn injected_at(&self) -> Cycle {
        self.injected_at
    }

    pub fn delivered_at(&self) -> Option<Cycle> {
        self.delivered_at
    }

    /// The router currently holding the packet (the destination once
    /// delivered).
    pub fn position(&self) -> (usize, usize) {
        self.position
    }

    /// Cycles spent in the fabric, available once delivered.
    pub fn latency(&self) -> Option<Cycle> {
        self.delivered_at.map(|at| at - self.injected_at)
    }
}
