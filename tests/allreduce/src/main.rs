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

//! Drives the collectives and the auxiliary fabrics end to end and checks
//! their results against direct computation.

use anyhow::{bail, ensure, Result};
use structopt::StructOpt;

use pimnet::*;

#[derive(Debug, StructOpt)]
#[structopt(name = "allreduce", about = "Exercise the interconnect end to end.")]
struct Options {
    /// Mesh width.
    #[structopt(long, default_value = "4")]
    width: usize,

    /// Mesh height.
    #[structopt(long, default_value = "8")]
    height: usize,

    /// Number of collective nodes (<= width * height).
    #[structopt(long, default_value = "8")]
    nodes: usize,

    /// Routing algorithm: xy, yx, or west-first.
    #[structopt(long, default_value = "xy")]
    routing: String,
}

fn dump(label: &str, stats: &StatsMap) {
    log::info!("{} statistics:", label);
    for (key, value) in stats {
        log::info!("  {} = {}", key, value);
    }
}

fn run_collectives(options: &Options, algorithm: RoutingAlgorithm) -> Result<()> {
    let mut net = MeshNetwork::new(&MeshConfiguration {
        width: options.width,
        height: options.height,
        algorithm,
        mtu: None,
    })?;

    let values: Vec<i64> = (1..=options.nodes as i64).collect();
    let expected_sum: i64 = values.iter().sum();
    {
        let mut ring = RingCollective::new(&mut net, options.nodes)?;
        let reduced = ring.all_reduce(&values, ReduceOp::Sum)?;
        ensure!(
            reduced.iter().all(|&v| v == expected_sum),
            "all-reduce disagreed with the direct sum {}: {:?}",
            expected_sum,
            reduced,
        );

        let gathered = ring.all_gather(&values)?;
        ensure!(
            gathered.iter().all(|row| row == &values),
            "all-gather left nodes with partial vectors",
        );
        dump("ring", &ring.statistics());
    }

    {
        let mut tree = TreeCollective::new(&mut net, options.nodes)?;
        let held = tree.broadcast(0, b"broadcast")?;
        ensure!(
            held.iter().all(|payload| payload == b"broadcast"),
            "tree broadcast missed a node",
        );
        dump("tree", &tree.statistics());
    }

    dump("mesh", &net.statistics());
    Ok(())
}

fn run_fabrics() -> Result<()> {
    let mut interchip = InterChipSwitch::new(&InterChipConfiguration::default())?;
    let transfer = interchip.start_transfer(0, 1, 0, vec![0xA5; 256])?;
    interchip.cycle();
    interchip.complete_transfer(transfer)?;
    dump("inter-chip", &interchip.statistics());

    let bus = InterRankBroadcastQueue::new(&RankBusConfiguration::default())?;
    bus.broadcast(0, 0, vec![0x5A; 48])?;
    bus.cycle();
    ensure!(bus.is_empty(), "bus failed to drain one small broadcast");
    dump("inter-rank", &bus.statistics());
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();
    let options = Options::from_args();

    let algorithm = match options.routing.as_str() {
        "xy" => RoutingAlgorithm::XY,
        "yx" => RoutingAlgorithm::YX,
        "west-first" => RoutingAlgorithm::WestFirst,
        other => bail!("unknown routing algorithm: {}", other),
    };
    ensure!(
        options.nodes > 0 && options.nodes <= options.width * options.height,
        "{} nodes do not fit a {}x{} mesh",
        options.nodes,
        options.width,
        options.height,
    );

    run_collectives(&options, algorithm)?;
    run_fabrics()?;
    log::info!("all collectives and fabrics verified");
    Ok(())
}
