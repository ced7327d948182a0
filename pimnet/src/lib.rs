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

//! Cycle-accurate core of the on-package interconnect of a
//! processing-in-memory device: a 2D mesh of bufferless routers, the ring
//! and tree collectives scheduled on top of it, and the chip-to-chip
//! crossbar and rank-to-rank broadcast fabrics beside it.

mod collective;
mod config;
mod error;
mod interchip;
mod interrank;
mod mesh;
mod packet;
mod router;
mod stats;

// Public types
// type to use for cycles
pub type Cycle = usize;

pub use crate::collective::ring::RingCollective;
pub use crate::collective::tree::TreeCollective;
pub use crate::collective::{
    apply_reduce, decode_int64, decode_int64_slice, encode_int64, encode_int64_slice,
};
pub use crate::collective::{ReduceOp, DRAIN_BUDGET};
pub use crate::config::{
    Config, InterChipConfiguration, MeshConfiguration, RankBusConfiguration,
    RANK_QUEUE_CAPACITY,
};
pub use crate::error::Error;
pub use crate::interchip::{CrossbarSwitch, DQPinPartition, InterChipSwitch, Transfer};
pub use crate::interrank::{InterRankBroadcastQueue, RankDestination, RankMessage};
pub use crate::mesh::{DpuAddress, MeshNetwork};
pub use crate::packet::{Packet, PacketId};
pub use crate::router::{Router, RouterPort, RoutingAlgorithm, PORT_COUNT};
pub use crate::stats::{StatValue, StatsMap};
