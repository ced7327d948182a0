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

use crate::config::RankBusConfiguration;
use crate::error::Error;
use crate::stats::StatsMap;
use crate::Cycle;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};

/// Addressing of one bus message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RankDestination {
    /// Every rank other than the sender, in every channel.
    AllRanks,
    /// One rank index, in every channel.
    Rank(usize),
}

/// A command/address-bus message. One drained message is shared by every
/// destination bucket it fans out to.
#[derive(Debug)]
pub struct RankMessage {
    pub id: u64,
    pub source_rank: usize,
    pub destination: RankDestination,
    pub payload: Vec<u8>,
    pub enqueued_at: Cycle,
}

#[derive(Debug, Default)]
struct QueueState {
    /// The outbound FIFO modeling the shared bus.
    queue: VecDeque<Arc<RankMessage>>,
    /// Delivered-but-unread messages per (channel, rank).
    buckets: HashMap<(usize, usize), Vec<Arc<RankMessage>>>,
    total_messages: u64,
    total_broadcasts: u64,
    total_bytes: u64,
    cycles: Cycle,
    next_message_id: u64,
}

/// The DDR command/address bus repurposed as a rank-to-rank broadcast
/// medium.
///
/// Messages drain head-first under a per-cycle byte budget; the first
/// message that does not fit stalls everything behind it (head-of-line
/// blocking, no reordering, no fragmentation). The outbound FIFO is bounded
/// and refuses enqueues at capacity rather than dropping.
///
/// Mutations serialize on a write lock so driver threads outside the
/// simulator loop may call in concurrently; reads share the lock.
#[derive(Debug)]
pub struct InterRankBroadcastQueue {
    num_channels: usize,
    num_ranks: usize,
    bus_width: usize,
    bandwidth: u64,
    capacity: usize,
    state: RwLock<QueueState>,
}

impl InterRankBroadcastQueue {
    pub fn new(config: &RankBusConfiguration) -> Result<Self, Error> {
        config.validate()?;
        let mut buckets = HashMap::new();
        for channel in 0..config.num_channels {
            for rank in 0..config.num_ranks {
                buckets.insert((channel, rank), Vec::new());
            }
        }
        log::info!(
            "inter-rank queue initialized: {} channels x {} ranks, {} bytes/cycle",
            config.num_channels,
            config.num_ranks,
            config.bandwidth,
        );
        Ok(Self {
            num_channels: config.num_channels,
            num_ranks: config.num_ranks,
            bus_width: config.bus_width,
            bandwidth: config.bandwidth,
            capacity: config.queue_capacity,
            state: RwLock::new(QueueState {
                buckets,
                ..Default::default()
            }),
        })
    }

    fn check_coordinates(&self, channel: usize, rank: usize) -> Result<(), Error> {
        if channel >= self.num_channels {
            return Err(Error::OutOfRange(format!(
                "channel {} outside 0..{}",
                channel, self.num_channels
            )));
        }
        if rank >= self.num_ranks {
            return Err(Error::OutOfRange(format!(
                "rank {} outside 0..{}",
                rank, self.num_ranks
            )));
        }
        Ok(())
    }

    fn enqueue(
        &self,
        state: &mut QueueState,
        source_rank: usize,
        destination: RankDestination,
        payload: Vec<u8>,
    ) -> Result<(), Error> {
        if state.queue.len() >= self.capacity {
            return Err(Error::QueueFull);
        }
        let message = RankMessage {
            id: state.next_message_id,
            source_rank,
            destination,
            payload,
            enqueued_at: state.cycles,
        };
        state.next_message_id += 1;
        state.total_messages += 1;
        state.total_bytes += message.payload.len() as u64;
        state.queue.push_back(Arc::new(message));
        Ok(())
    }

    /// Queue a message for every rank other than `source_rank`, across all
    /// channels.
    pub fn broadcast(
        &self,
        channel: usize,
        source_rank: usize,
        payload: Vec<u8>,
    ) -> Result<(), Error> {
        self.check_coordinates(channel, source_rank)?;
        let mut state = self.state.write().unwrap();
        self.enqueue(&mut state, source_rank, RankDestination::AllRanks, payload)?;
        state.total_broadcasts += 1;
        Ok(())
    }

    /// Queue a unicast for `dst_rank`. The bus spans channels, so delivery
    /// lands in that rank's bucket of every channel.
    pub fn send(
        &self,
        src_channel: usize,
        src_rank: usize,
        dst_channel: usize,
        dst_rank: usize,
        payload: Vec<u8>,
    ) -> Result<(), Error> {
        self.check_coordinates(src_channel, src_rank)
            .map_err(|e| Error::OutOfRange(format!("invalid source: {}", e)))?;
        self.check_coordinates(dst_channel, dst_rank)
            .map_err(|e| Error::OutOfRange(format!("invalid destination: {}", e)))?;
        let mut state = self.state.write().unwrap();
        self.enqueue(
            &mut state,
            src_rank,
            RankDestination::Rank(dst_rank),
            payload,
        )
    }

    /// One bus tick: drain head-first while the byte budget lasts.
    pub fn cycle(&self) {
        let mut state = self.state.write().unwrap();
        state.cycles += 1;

        let mut bytes_processed = 0u64;
        while let Some(message) = state.queue.front() {
            let size = message.payload.len() as u64;
            if bytes_processed + size > self.bandwidth {
                // Head of line does not fit; everything behind it waits.
                break;
            }
            let message = state.queue.pop_front().expect("non-empty queue");
            bytes_processed += size;
            log::trace!(
                "bus delivers message {} ({} bytes) from rank {}",
                message.id,
                size,
                message.source_rank,
            );
            match message.destination {
                RankDestination::AllRanks => {
                    for channel in 0..self.num_channels {
                        for rank in 0..self.num_ranks {
                            if rank != message.source_rank {
                                state
                                    .buckets
                                    .get_mut(&(channel, rank))
                                    .expect("bucket exists")
                                    .push(Arc::clone(&message));
                            }
                        }
                    }
                }
                RankDestination::Rank(dst_rank) => {
                    for channel in 0..self.num_channels {
                        state
                            .buckets
                            .get_mut(&(channel, dst_rank))
                            .expect("bucket exists")
                            .push(Arc::clone(&message));
                    }
                }
            }
        }
    }

    /// Take every pending message for (channel, rank).
    pub fn read(&self, channel: usize, rank: usize) -> Result<Vec<Arc<RankMessage>>, Error> {
        self.check_coordinates(channel, rank)?;
        let mut state = self.state.write().unwrap();
        Ok(std::mem::take(
            state.buckets.get_mut(&(channel, rank)).expect("bucket exists"),
        ))
    }

    pub fn pending_count(&self, channel: usize, rank: usize) -> Result<usize, Error> {
        self.check_coordinates(channel, rank)?;
        let state = self.state.read().unwrap();
        Ok(state.buckets[&(channel, rank)].len())
    }

    pub fn clear(&self, channel: usize, rank: usize) -> Result<(), Error> {
        self.check_coordinates(channel, rank)?;
        let mut state = self.state.write().unwrap();
        state.buckets.get_mut(&(channel, rank)).expect("bucket exists").clear();
        Ok(())
    }

    /// True when the outbound FIFO has fully drained.
    pub fn is_empty(&self) -> bool {
        self.state.read().unwrap().queue.is_empty()
    }

    pub fn queue_len(&self) -> usize {
        self.state.read().unwrap().queue.len()
    }

    pub fn statistics(&self) -> StatsMap {
        let state = self.state.read().unwrap();
        let mut stats = StatsMap::new();
        stats.insert("num_channels", self.num_channels.into());
        stats.insert("num_ranks", self.num_ranks.into());
        stats.insert("bus_width", self.bus_width.into());
        stats.insert("total_messages", state.total_messages.into());
        stats.insert("total_broadcasts", state.total_broadcasts.into());
        stats.insert("total_bytes_transferred", state.total_bytes.into());
        stats.insert("cycles", state.cycles.into());
        if state.total_messages > 0 {
            stats.insert(
                "avg_bytes_per_message",
                (state.total_bytes as f64 / state.total_messages as f64).into(),
            );
        }
        if state.cycles > 0 {
            stats.insert(
                "bandwidth_utilization",
                (state.total_bytes as f64 / (state.cycles as f64 * self.bandwidth as f64)).into(),
            );
        }
        stats
    }
}
