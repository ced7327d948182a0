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
use std::fmt;

/// Recoverable failures surfaced by the interconnect fabrics.
///
/// Invariant violations (a router producing an off-mesh target, a packet
/// referenced from two slots) are bugs in the simulator itself and panic
/// instead of being reported through this type.
#[derive(Debug, PartialEq, Eq)]
pub enum Error {
    /// Construction parameters are non-positive, non-divisible, or otherwise
    /// unusable. Fail loudly; there is no recovery.
    InvalidConfig(String),

    /// A channel/rank/chip/mesh coordinate is outside the declared bounds.
    OutOfRange(String),

    /// The receiving slot or crossbar output is busy; the caller may retry
    /// on a later cycle.
    Backpressure,

    /// The outbound FIFO is at capacity; the caller may retry.
    QueueFull,

    /// A drain loop exceeded its cycle budget. The fabric is left in its
    /// current state so the caller can inspect statistics.
    Timeout(Cycle),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::InvalidConfig(what) => write!(f, "invalid configuration: {}", what),
            Self::OutOfRange(what) => write!(f, "out of range: {}", what),
            Self::Backpressure => write!(f, "backpressure: receiving slot is occupied"),
            Self::QueueFull => write!(f, "message queue is full"),
            Self::Timeout(budget) => write!(f, "network timeout after {} cycles", budget),
        }
    }
}

// Implementing the std trait lets callers wrap us in `anyhow::Result`, which
// the test drivers do at their outermost layer.
impl std::error::Error for Error {}
