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

use crate::error::Error;
use crate::router::RoutingAlgorithm;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

/// Default capacity of the inter-rank outbound FIFO.
pub const RANK_QUEUE_CAPACITY: usize = 128;

/// parameters for the router grid
///
/// constructed programmatically or read from a config file.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct MeshConfiguration {
    pub width: usize,
    pub height: usize,
    pub algorithm: RoutingAlgorithm,
    /// Maximum payload size accepted by `inject`; `None` leaves it
    /// unbounded.
    pub mtu: Option<usize>,
}

impl MeshConfiguration {
    pub fn validate(&self) -> Result<(), Error> {
        if self.width == 0 || self.height == 0 {
            return Err(Error::InvalidConfig(format!(
                "mesh dimensions must be positive, got {}x{}",
                self.width, self.height
            )));
        }
        Ok(())
    }
}

impl Default for MeshConfiguration {
    fn default() -> Self {
        Self {
            // One column per (channel, rank) pair, one row per DPU: the
            // 2-channel, 2-rank, 8-DPU device.
            width: 4,
            height: 8,
            algorithm: RoutingAlgorithm::XY,
            mtu: None,
        }
    }
}

// parameters for the chip-to-chip fabric
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct InterChipConfiguration {
    pub num_chips: usize,
    pub total_dq_pins: usize,
    pub num_channels: usize,
}

impl InterChipConfiguration {
    pub fn validate(&self) -> Result<(), Error> {
        if self.num_chips == 0 {
            return Err(Error::InvalidConfig("chip count must be positive".into()));
        }
        if self.total_dq_pins == 0 || self.num_channels == 0 {
            return Err(Error::InvalidConfig(format!(
                "pin partition must be positive, got {} pins / {} channels",
                self.total_dq_pins, self.num_channels
            )));
        }
        if self.total_dq_pins % self.num_channels != 0 {
            return Err(Error::InvalidConfig(format!(
                "{} pins not evenly divisible by {} channels",
                self.total_dq_pins, self.num_channels
            )));
        }
        Ok(())
    }
}

impl Default for InterChipConfiguration {
    fn default() -> Self {
        Self {
            num_chips: 8,
            total_dq_pins: 64,
            num_channels: 8,
        }
    }
}

// parameters for the shared command/address bus
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RankBusConfiguration {
    pub num_channels: usize,
    pub num_ranks: usize,
    /// Bus width in bytes.
    pub bus_width: usize,
    /// Drain budget in bytes per cycle.
    pub bandwidth: u64,
    pub queue_capacity: usize,
}

impl RankBusConfiguration {
    pub fn validate(&self) -> Result<(), Error> {
        if self.num_channels == 0 || self.num_ranks == 0 || self.bus_width == 0 {
            return Err(Error::InvalidConfig(format!(
                "rank bus dimensions must be positive, got {} channels, {} ranks, {} bytes wide",
                self.num_channels, self.num_ranks, self.bus_width
            )));
        }
        if self.bandwidth == 0 {
            return Err(Error::InvalidConfig(
                "rank bus bandwidth must be positive".into(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(Error::InvalidConfig(
                "rank bus queue capacity must be positive".into(),
            ));
        }
        Ok(())
    }
}

impl Default for RankBusConfiguration {
    fn default() -> Self {
        Self {
            num_channels: 2,
            num_ranks: 4,
            bus_width: 64,
            bandwidth: 128,
            queue_capacity: RANK_QUEUE_CAPACITY,
        }
    }
}

/// Top-level device description, deserializable from YAML.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct Config {
    pub mesh: MeshConfiguration,
    pub interchip: InterChipConfiguration,
    pub rank_bus: RankBusConfiguration,
}

impl Config {
    pub fn from_file(file_name: &str) -> Self {
        let file = File::open(Path::new(file_name))
            .unwrap_or_else(|e| panic!("File {} not found. {:?}", file_name, e));
        let reader = BufReader::new(file);
        serde_yaml::from_reader(reader).unwrap()
    }

    pub fn from_str(config: &str) -> Self {
        serde_yaml::from_str(config).unwrap()
    }
}
