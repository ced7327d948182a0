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

use bencher::Bencher;
use bencher::{benchmark_group, benchmark_main};

use pimnet::*;

const PAYLOAD_SIZE: usize = 8;

fn mesh_forward(bench: &mut Bencher) {
    let config = MeshConfiguration::default();
    bench.iter(|| {
        let mut net = MeshNetwork::new(&config).expect("valid mesh");
        for y in 0..config.height {
            net.inject(0, y, config.width - 1, config.height - 1 - y, vec![0; PAYLOAD_SIZE])
                .expect("free injection slot");
        }
        assert!(net.run_until_empty(100));
    });
    bench.bytes = (MeshConfiguration::default().height * PAYLOAD_SIZE) as u64;
}

fn ring_all_reduce(bench: &mut Bencher) {
    let config = MeshConfiguration::default();
    let values: Vec<i64> = (1..=8).collect();
    bench.iter(|| {
        let mut net = MeshNetwork::new(&config).expect("valid mesh");
        let mut ring = RingCollective::new(&mut net, values.len()).expect("ring fits mesh");
        let result = ring.all_reduce(&values, ReduceOp::Sum).expect("drains");
        assert_eq!(result[0], 36);
    });
    bench.bytes = (2 * (values.len() - 1) * values.len() * PAYLOAD_SIZE) as u64;
}

benchmark_group!(benches, mesh_forward, ring_all_reduce);
benchmark_main!(benches);
