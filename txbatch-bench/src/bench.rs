/*
 * Created on Sat Jul 13 2024
 *
 * This file is a part of txbatch
 * txbatch is a free and open-source library of lock-free transactional
 * data structures written by Theo Hess ("the Author") with the vision
 * to make multi-operation atomicity practical on concurrent containers
 * without locks or software transactional memory.
 *
 * Copyright (c) 2024, Theo Hess <theo@nullpath.dev>
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 *
*/

use crate::{
    cli::{Cli, SetKind},
    error::{BResult, BenchError},
};
use rand::{rngs::SmallRng, Rng, SeedableRng};
use std::{
    sync::{Arc, Barrier},
    thread,
    time::Instant,
};
use txbatch::{list::TransList, map::TransMap, skip::TransSkip, TxnConfig, TxnOp};

/// Operation-mix percentages; whatever the writes leave of 100 is finds
#[derive(Debug, Clone, Copy)]
struct OpMix {
    insert: u32,
    delete: u32,
    update: u32,
}

impl OpMix {
    fn pick(self, dist: u32, key: u32) -> TxnOp {
        if dist <= self.insert {
            TxnOp::insert_kv(key, key)
        } else if dist <= self.insert + self.delete {
            TxnOp::delete(key)
        } else if dist <= self.insert + self.delete + self.update {
            TxnOp::update(key, key + 1)
        } else {
            TxnOp::find(key)
        }
    }
}

/// Size the arenas for the workload horizon: prefill plus every worker's
/// transactions, with slack for claim retries and helping
fn sizing(cli: &Cli) -> TxnConfig {
    let per_thread_txns = cli.test_size.max(cli.key_range as usize) + 1;
    let per_thread_ops = per_thread_txns * cli.tran_size as usize;
    TxnConfig {
        // one extra slot for the prefill pass on the main thread
        threads: cli.threads + 1,
        max_ops: cli.tran_size,
        desc_cap: per_thread_txns,
        ndesc_cap: per_thread_ops * 4,
        node_cap: per_thread_ops + 16,
        spine_cap: (per_thread_ops / 4) + 16,
    }
}

fn validate(cli: &Cli) -> BResult<OpMix> {
    if cli.threads == 0 || cli.test_size == 0 || cli.tran_size == 0 || cli.key_range == 0 {
        return Err(BenchError::ArgsErr(
            "threads, test-size, tran-size and key-range must be nonzero".into(),
        ));
    }
    let mix = OpMix {
        insert: cli.insert_pct,
        delete: cli.delete_pct,
        update: cli.update_pct.unwrap_or(0),
    };
    if mix.insert + mix.delete + mix.update > 100 {
        return Err(BenchError::ArgsErr("operation mix exceeds 100%".into()));
    }
    if mix.update > 0 && cli.set != SetKind::Map {
        return Err(BenchError::ArgsErr(
            "update operations are only supported by the map".into(),
        ));
    }
    Ok(mix)
}

/// The driver itself, identical across containers: prefill from the main
/// thread, release all workers at a barrier, join, fold counters.
macro_rules! drive {
    ($cont:expr, $cli:expr, $mix:expr) => {{
        let cli = $cli;
        let mix = $mix;
        let c = Arc::new($cont);
        {
            // prefill with ~key_range random single-op inserts
            let s = c.register_thread();
            let mut rng = SmallRng::seed_from_u64(0xbe7);
            for _ in 0..cli.key_range {
                let key = rng.gen_range(1..=cli.key_range);
                let d = c.allocate_desc(&s, &[TxnOp::insert_kv(key, key)]);
                c.execute_ops(d, &s);
            }
        }
        let barrier = Arc::new(Barrier::new(cli.threads + 1));
        let (test_size, tran_size, key_range) = (cli.test_size, cli.tran_size, cli.key_range);
        let workers: Vec<_> = (0..cli.threads)
            .map(|tid| {
                let c = Arc::clone(&c);
                let barrier = Arc::clone(&barrier);
                thread::Builder::new()
                    .name(format!("worker-{tid}"))
                    .spawn(move || {
                        let s = c.register_thread();
                        let mut rng = SmallRng::seed_from_u64(0x7ab + tid as u64);
                        barrier.wait();
                        let mut ops = Vec::with_capacity(tran_size as usize);
                        for _ in 0..test_size {
                            ops.clear();
                            for _ in 0..tran_size {
                                let key = rng.gen_range(1..=key_range);
                                let dist = rng.gen_range(1..=100u32);
                                ops.push(mix.pick(dist, key));
                            }
                            let d = c.allocate_desc(&s, &ops);
                            c.execute_ops(d, &s);
                        }
                    })
                    .unwrap()
            })
            .collect();
        barrier.wait();
        let start = Instant::now();
        workers.into_iter().for_each(|w| w.join().unwrap());
        info!(
            "{} workers × {} txns × {} ops finished in {:.3?}",
            cli.threads,
            cli.test_size,
            cli.tran_size,
            start.elapsed()
        );
        c.metrics()
    }};
}


pub fn run_bench(cli: &Cli) -> BResult<()> {
    let mix = validate(cli)?;
    let cfg = sizing(cli);
    info!("benching {:?} with mix {:?}", cli.set, mix);
    let report = match cli.set {
        SetKind::List => drive!(TransList::new(cfg), cli, mix),
        SetKind::Skip => drive!(TransSkip::new(cfg), cli, mix),
        SetKind::Map => {
            // top spine sized to the key domain
            let main_pow = (32 - cli.key_range.leading_zeros()).clamp(4, 20);
            drive!(TransMap::<txbatch::map::DefConfig>::new(cfg, main_pow), cli, mix)
        }
    };
    println!("{report}");
    Ok(())
}
