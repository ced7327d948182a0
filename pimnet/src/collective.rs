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

//! Collective-communication schedules expressed as packet injections over
//! the mesh: ring-based all-reduce / reduce-scatter / all-gather and a
//! binary-tree broadcast.

pub mod ring;
pub mod tree;

use crate::Cycle;
use std::fmt;

/// Cycles a collective step may spend draining the mesh before it reports a
/// timeout.
pub const DRAIN_BUDGET: Cycle = 1000;

/// Elementwise reduction operator over 64-bit signed integers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReduceOp {
    Sum,
    Max,
    Min,
    Prod,
}

impl fmt::Display for ReduceOp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Sum => write!(f, "sum"),
            Self::Max => write!(f, "max"),
            Self::Min => write!(f, "min"),
            Self::Prod => write!(f, "prod"),
        }
    }
}

/// Combine two values under `op`. Sum and Prod wrap on overflow
/// (two's-complement); property tests compare schedules against a direct
/// fold of this function.
pub fn apply_reduce(op: ReduceOp, a: i64, b: i64) -> i64 {
    match op {
        ReduceOp::Sum => a.wrapping_add(b),
        ReduceOp::Max => a.max(b),
        ReduceOp::Min => a.min(b),
        ReduceOp::Prod => a.wrapping_mul(b),
    }
}

/// Little-endian scalar payload encoding.
pub fn encode_int64(value: i64) -> Vec<u8> {
    value.to_le_bytes().to_vec()
}

/// Inverse of [`encode_int64`]; short buffers decode to zero.
pub fn decode_int64(data: &[u8]) -> i64 {
    if data.len() < 8 {
        return 0;
    }
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&data[..8]);
    i64::from_le_bytes(bytes)
}

pub fn encode_int64_slice(values: &[i64]) -> Vec<u8> {
    let mut data = Vec::with_capacity(values.len() * 8);
    for value in values {
        data.extend_from_slice(&value.to_le_bytes());
    }
    data
}

/// Inverse of [`encode_int64_slice`]; `None` when the buffer is not a whole
/// number of values.
pub fn decode_int64_slice(data: &[u8]) -> Option<Vec<i64>> {
    if data.len() % 8 != 0 {
        return None;
    }
    Some(data.chunks_exact(8).map(decode_int64).collect())
}
