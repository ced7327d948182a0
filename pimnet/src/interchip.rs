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

use crate::config::InterChipConfiguration;
use crate::error::Error;
use crate::stats::StatsMap;
use crate::Cycle;
use std::collections::HashMap;
use std::sync::RwLock;

#[derive(Debug, Default)]
struct CrossbarState {
    /// Per-input connection target.
    forward: Vec<Option<usize>>,
    /// Per-output connection source; kept consistent with `forward`.
    reverse: Vec<Option<usize>>,
    total_switches: u64,
    blocked_attempts: u64,
    cycles: Cycle,
}

/// An N×M any-to-any switching matrix. Bufferless: an output carries at most
/// one connection, and a connect against a busy output is refused rather
/// than queued.
///
/// Mutations serialize on a write lock so driver threads outside the
/// simulator loop may call in concurrently; reads share the lock.
#[derive(Debug)]
pub struct CrossbarSwitch {
    num_inputs: usize,
    num_outputs: usize,
    state: RwLock<CrossbarState>,
}

impl CrossbarSwitch {
    pub fn new(num_inputs: usize, num_outputs: usize) -> Result<Self, Error> {
        if num_inputs == 0 || num_outputs == 0 {
            return Err(Error::InvalidConfig(format!(
                "crossbar must have inputs and outputs, got {}x{}",
                num_inputs, num_outputs
            )));
        }
        log::info!("crossbar switch initialized: {}x{}", num_inputs, num_outputs);
        Ok(Self {
            num_inputs,
            num_outputs,
            state: RwLock::new(CrossbarState {
                forward: vec![None; num_inputs],
                reverse: vec![None; num_outputs],
                ..Default::default()
            }),
        })
    }

    fn check_input(&self, input: usize) -> Result<(), Error> {
        if input >= self.num_inputs {
            return Err(Error::OutOfRange(format!(
                "input {} outside 0..{}",
                input, self.num_inputs
            )));
        }
        Ok(())
    }

    fn check_output(&self, output: usize) -> Result<(), Error> {
        if output >= self.num_outputs {
            return Err(Error::OutOfRange(format!(
                "output {} outside 0..{}",
                output, self.num_outputs
            )));
        }
        Ok(())
    }

    /// Establish input -> output. An output held by another input refuses
    /// the connection; an input that already holds a connection has it torn
    /// down first and re-pointed.
    pub fn connect(&self, input: usize, output: usize) -> Result<(), Error> {
        self.check_input(input)?;
        self.check_output(output)?;
        let mut state = self.state.write().unwrap();
        match state.reverse[output] {
            Some(holder) if holder != input => {
                state.blocked_attempts += 1;
                return Err(Error::Backpressure);
            }
            Some(_) => return Ok(()), // already wired to us
            None => {}
        }
        if let Some(previous) = state.forward[input] {
            state.reverse[previous] = None;
        }
        state.forward[input] = Some(output);
        state.reverse[output] = Some(input);
        state.total_switches += 1;
        log::debug!("crossbar connect {} -> {}", input, output);
        Ok(())
    }

    pub fn disconnect(&self, input: usize) -> Result<(), Error> {
        self.check_input(input)?;
        let mut state = self.state.write().unwrap();
        if let Some(output) = state.forward[input].take() {
            state.reverse[output] = None;
            log::debug!("crossbar disconnect {} -> {}", input, output);
        }
        Ok(())
    }

    pub fn is_connected(&self, input: usize) -> bool {
        self.get_connection(input).is_some()
    }

    pub fn get_connection(&self, input: usize) -> Option<usize> {
        let state = self.state.read().unwrap();
        state.forward.get(input).copied().flatten()
    }

    pub fn disconnect_all(&self) {
        let mut state = self.state.write().unwrap();
        state.forward.iter_mut().for_each(|c| *c = None);
        state.reverse.iter_mut().for_each(|c| *c = None);
    }

    pub fn cycle(&self) {
        self.state.write().unwrap().cycles += 1;
    }

    pub fn active_connections(&self) -> usize {
        let state = self.state.read().unwrap();
        state.forward.iter().flatten().count()
    }

    pub fn statistics(&self) -> StatsMap {
        let state = self.state.read().unwrap();
        let mut stats = StatsMap::new();
        stats.insert("num_inputs", self.num_inputs.into());
        stats.insert("num_outputs", self.num_outputs.into());
        stats.insert("total_switches", state.total_switches.into());
        stats.insert("blocked_attempts", state.blocked_attempts.into());
        stats.insert("cycles", state.cycles.into());
        let attempts = state.total_switches + state.blocked_attempts;
        if attempts > 0 {
            stats.insert(
                "block_rate",
                (state.blocked_attempts as f64 / attempts as f64).into(),
            );
        }
        stats.insert(
            "active_connections",
            state.forward.iter().flatten().count().into(),
        );
        stats
    }
}

/// Partition of a wide data bus into equal contiguous sub-channels.
///
/// A pure configuration object: channel k owns pins [k*w, (k+1)*w).
#[derive(Clone, Debug)]
pub struct DQPinPartition {
    total_pins: usize,
    num_channels: usize,
    pins_per_channel: usize,
    channel_pins: Vec<Vec<usize>>,
}

impl DQPinPartition {
    pub fn new(total_pins: usize, num_channels: usize) -> Result<Self, Error> {
        if total_pins == 0 || num_channels == 0 {
            return Err(Error::InvalidConfig(format!(
                "pin partition must be positive, got {} pins / {} channels",
                total_pins, num_channels
            )));
        }
        if total_pins % num_channels != 0 {
            return Err(Error::InvalidConfig(format!(
                "{} pins not evenly divisible by {} channels",
                total_pins, num_channels
            )));
        }
        let pins_per_channel = total_pins / num_channels;
        let channel_pins = (0..num_channels)
            .map(|ch| (ch * pins_per_channel..(ch + 1) * pins_per_channel).collect())
            .collect();
        log::info!(
            "dq pin partition: {} pins -> {} channels x {} pins",
            total_pins,
            num_channels,
            pins_per_channel,
        );
        Ok(Self {
            total_pins,
            num_channels,
            pins_per_channel,
            channel_pins,
        })
    }

    pub fn total_pins(&self) -> usize {
        self.total_pins
    }

    pub fn num_channels(&self) -> usize {
        self.num_channels
    }

    pub fn channel_pins(&self, channel: usize) -> Option<&[usize]> {
        self.channel_pins.get(channel).map(Vec::as_slice)
    }

    /// Pins (and therefore relative bandwidth) of one sub-channel.
    pub fn channel_bandwidth(&self) -> usize {
        self.pins_per_channel
    }
}

/// One chip-to-chip transfer in flight over the crossbar.
#[derive(Clone, Debug)]
pub struct Transfer {
    pub id: u64,
    pub src_chip: usize,
    pub dst_chip: usize,
    pub channel: usize,
    pub payload: Vec<u8>,
    pub start_cycle: Cycle,
    pub end_cycle: Option<Cycle>,
}

/// The chip-to-chip fabric: a chips×chips crossbar plus a DQ pin partition.
///
/// The switch records transfer lifecycles but does not decide their length;
/// the caller completes a transfer when its payload has had time on the
/// wire.
#[derive(Debug)]
pub struct InterChipSwitch {
    num_chips: usize,
    dq_partition: DQPinPartition,
    crossbar: CrossbarSwitch,

    active: HashMap<u64, Transfer>,
    next_transfer_id: u64,
    total_transfers: u64,
    total_bytes: u64,
    cycles: Cycle,
}

impl InterChipSwitch {
    pub fn new(config: &InterChipConfiguration) -> Result<Self, Error> {
        config.validate()?;
        let dq_partition = DQPinPartition::new(config.total_dq_pins, config.num_channels)?;
        let crossbar = CrossbarSwitch::new(config.num_chips, config.num_chips)?;
        log::info!(
            "inter-chip switch initialized: {} chips, {} channels",
            config.num_chips,
            config.num_channels,
        );
        Ok(Self {
            num_chips: config.num_chips,
            dq_partition,
            crossbar,
            active: HashMap::new(),
            next_transfer_id: 0,
            total_transfers: 0,
            total_bytes: 0,
            cycles: 0,
        })
    }

    pub fn num_chips(&self) -> usize {
        self.num_chips
    }

    pub fn dq_partition(&self) -> &DQPinPartition {
        &self.dq_partition
    }

    pub fn crossbar(&self) -> &CrossbarSwitch {
        &self.crossbar
    }

    fn check_chip(&self, chip: usize, what: &str) -> Result<(), Error> {
        if chip >= self.num_chips {
            return Err(Error::OutOfRange(format!(
                "{} chip {} outside 0..{}",
                what, chip, self.num_chips
            )));
        }
        Ok(())
    }

    /// Claim the crossbar path src -> dst and open a transfer on `channel`.
    pub fn start_transfer(
        &mut self,
        src_chip: usize,
        dst_chip: usize,
        channel: usize,
        payload: Vec<u8>,
    ) -> Result<u64, Error> {
        self.check_chip(src_chip, "source")?;
        self.check_chip(dst_chip, "destination")?;
        if channel >= self.dq_partition.num_channels() {
            return Err(Error::OutOfRange(format!(
                "channel {} outside 0..{}",
                channel,
                self.dq_partition.num_channels()
            )));
        }
        self.crossbar.connect(src_chip, dst_chip)?;

        let id = self.next_transfer_id;
        self.next_transfer_id += 1;
        self.total_transfers += 1;
        self.total_bytes += payload.len() as u64;
        log::debug!(
            "transfer {}: chip {} -> chip {} on channel {} ({} bytes)",
            id,
            src_chip,
            dst_chip,
            channel,
            payload.len(),
        );
        self.active.insert(
            id,
            Transfer {
                id,
                src_chip,
                dst_chip,
                channel,
                payload,
                start_cycle: self.cycles,
                end_cycle: None,
            },
        );
        Ok(id)
    }

    /// Close a transfer and release its crossbar path. Returns the finished
    /// record, end cycle stamped.
    pub fn complete_transfer(&mut self, id: u64) -> Result<Transfer, Error> {
        let mut transfer = self
            .active
            .remove(&id)
            .ok_or_else(|| Error::OutOfRange(format!("transfer {} not found", id)))?;
        transfer.end_cycle = Some(self.cycles);
        self.crossbar.disconnect(transfer.src_chip)?;
        log::debug!(
            "transfer {} completed after {} cycles",
            id,
            self.cycles - transfer.start_cycle,
        );
        Ok(transfer)
    }

    pub fn transfer(&self, id: u64) -> Option<&Transfer> {
        self.active.get(&id)
    }

    pub fn active_transfers(&self) -> usize {
        self.active.len()
    }

    pub fn cycle(&mut self) {
        self.crossbar.cycle();
        self.cycles += 1;
    }

    pub fn statistics(&self) -> StatsMap {
        let mut stats = StatsMap::new();
        stats.insert("num_chips", self.num_chips.into());
        stats.insert("dq_pins", self.dq_partition.total_pins().into());
        stats.insert("num_channels", self.dq_partition.num_channels().into());
        stats.insert(
            "pins_per_channel",
            self.dq_partition.channel_bandwidth().into(),
        );
        stats.insert("total_transfers", self.total_transfers.into());
        stats.insert("total_bytes", self.total_bytes.into());
        stats.insert("active_transfers", self.active.len().into());
        stats.insert("cycles", self.cycles.into());
        if self.total_transfers > 0 {
            stats.insert(
                "avg_bytes_per_transfer",
                (self.total_bytes as f64 / self.total_transfers as f64).into(),
            );
        }
        let crossbar = self.crossbar.statistics();
        stats.insert("crossbar_switches", crossbar["total_switches"]);
        stats.insert("crossbar_blocks", crossbar["blocked_attempts"]);
        if let Some(rate) = crossbar.get("block_rate") {
            stats.insert("crossbar_block_rate", *rate);
        }
        stats
    }
}

#[cfg(test)]
mod crossbar_tests {
    use super::*;

    #[test]
    fn conflicting_output_is_refused_and_counted() {
        let xbar = CrossbarSwitch::new(8, 8).unwrap();
        assert!(xbar.connect(0, 5).is_ok());
        assert_eq!(xbar.connect(1, 5), Err(Error::Backpressure));
        let stats = xbar.statistics();
        assert_eq!(stats["blocked_attempts"].as_i64(), 1);
        assert_eq!(stats["total_switches"].as_i64(), 1);
        assert_eq!(stats["block_rate"].as_f64(), 0.5);
        assert_eq!(stats["active_connections"].as_i64(), 1);
    }

    #[test]
    fn reconnect_repoints_the_input() {
        let xbar = CrossbarSwitch::new(4, 4).unwrap();
        xbar.connect(0, 1).unwrap();
        xbar.connect(0, 2).unwrap();
        assert_eq!(xbar.get_connection(0), Some(2));
        // Output 1 was released by the re-point.
        assert!(xbar.connect(3, 1).is_ok());
    }

    #[test]
    fn disconnect_frees_the_output() {
        let xbar = CrossbarSwitch::new(4, 4).unwrap();
        xbar.connect(2, 3).unwrap();
        assert!(xbar.is_connected(2));
        xbar.disconnect(2).unwrap();
        assert!(!xbar.is_connected(2));
        assert!(xbar.connect(1, 3).is_ok());
    }

    #[test]
    fn disconnect_all_clears_every_path() {
        let xbar = CrossbarSwitch::new(4, 4).unwrap();
        for i in 0..4 {
            xbar.connect(i, (i + 1) % 4).unwrap();
        }
        assert_eq!(xbar.active_connections(), 4);
        xbar.disconnect_all();
        assert_eq!(xbar.active_connections(), 0);
    }

    #[test]
    fn indices_are_validated() {
        let xbar = CrossbarSwitch::new(2, 3).unwrap();
        assert!(matches!(xbar.connect(2, 0), Err(Error::OutOfRange(_))));
        assert!(matches!(xbar.connect(0, 3), Err(Error::OutOfRange(_))));
        assert!(!xbar.is_connected(9));
    }

    #[test]
    fn first_arriver_wins_across_threads() {
        let xbar = CrossbarSwitch::new(16, 16).unwrap();
        std::thread::scope(|scope| {
            for input in 0..16 {
                let xbar = &xbar;
                scope.spawn(move || {
                    // Every thread fights for output 0; exactly one wins.
                    let _ = xbar.connect(input, 0);
                });
            }
        });
        assert_eq!(xbar.active_connections(), 1);
        let stats = xbar.statistics();
        assert_eq!(
            stats["total_switches"].as_i64() + stats["blocked_attempts"].as_i64(),
            16
        );
        assert_eq!(stats["total_switches"].as_i64(), 1);
    }
}

#[cfg(test)]
mod partition_tests {
    use super::*;

    #[test]
    fn assigns_contiguous_ranges() {
        let dq = DQPinPartition::new(64, 8).unwrap();
        assert_eq!(dq.channel_bandwidth(), 8);
        assert_eq!(dq.channel_pins(0).unwrap(), (0..8).collect::<Vec<_>>());
        assert_eq!(dq.channel_pins(7).unwrap(), (56..64).collect::<Vec<_>>());
        assert!(dq.channel_pins(8).is_none());
    }

    #[test]
    fn rejects_uneven_partition() {
        assert!(matches!(
            DQPinPartition::new(64, 6),
            Err(Error::InvalidConfig(_))
        ));
        assert!(matches!(
            DQPinPartition::new(0, 4),
            Err(Error::InvalidConfig(_))
        ));
    }
}

#[cfg(test)]
mod switch_tests {
    use super::*;

    fn switch(num_chips: usize) -> InterChipSwitch {
        InterChipSwitch::new(&InterChipConfiguration {
            num_chips,
            total_dq_pins: 64,
            num_channels: 8,
        })
        .unwrap()
    }

    #[test]
    fn transfer_lifecycle() {
        let _logger = env_logger::builder().is_test(true).try_init();
        let mut ics = switch(4);
        let id = ics.start_transfer(0, 2, 3, vec![0xAB; 100]).unwrap();
        assert_eq!(ics.active_transfers(), 1);
        assert!(ics.crossbar().is_connected(0));

        ics.cycle();
        ics.cycle();
        let done = ics.complete_transfer(id).unwrap();
        assert_eq!(done.start_cycle, 0);
        assert_eq!(done.end_cycle, Some(2));
        assert_eq!(ics.active_transfers(), 0);
        assert!(!ics.crossbar().is_connected(0));

        let stats = ics.statistics();
        assert_eq!(stats["total_transfers"].as_i64(), 1);
        assert_eq!(stats["total_bytes"].as_i64(), 100);
        assert_eq!(stats["cycles"].as_i64(), 2);
    }

    #[test]
    fn busy_destination_blocks_second_transfer() {
        let mut ics = switch(4);
        ics.start_transfer(0, 3, 0, vec![1]).unwrap();
        assert_eq!(
            ics.start_transfer(1, 3, 0, vec![2]),
            Err(Error::Backpressure)
        );
        let stats = ics.statistics();
        assert_eq!(stats["crossbar_blocks"].as_i64(), 1);
        assert_eq!(stats["active_transfers"].as_i64(), 1);
    }

    #[test]
    fn rejects_bad_indices() {
        let mut ics = switch(2);
        assert!(matches!(
            ics.start_transfer(2, 0, 0, vec![]),
            Err(Error::OutOfRange(_))
        ));
        assert!(matches!(
            ics.start_transfer(0, 2, 0, vec![]),
            Err(Error::OutOfRange(_))
        ));
        assert!(matches!(
            ics.start_transfer(0, 1, 8, vec![]),
            Err(Error::OutOfRange(_))
        ));
        assert!(matches!(
            ics.complete_transfer(99),
            Err(Error::OutOfRange(_))
        ));
    }
}
