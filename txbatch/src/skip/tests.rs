/*
 * Created on Sat May 18 2024
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

use super::{TransSkip, NUM_LEVELS};
use crate::{TxnConfig, TxnOp};
use rand::{rngs::SmallRng, Rng, SeedableRng};
use std::{
    sync::{Arc, RwLock},
    thread::{self, JoinHandle},
};

fn cfg(threads: usize) -> TxnConfig {
    TxnConfig {
        threads,
        max_ops: 8,
        desc_cap: 1 << 12,
        ndesc_cap: 1 << 15,
        node_cap: 1 << 12,
        spine_cap: 1,
    }
}

fn run(l: &TransSkip, s: &super::SkipCtx<'_>, ops: &[TxnOp]) -> bool {
    let d = l.allocate_desc(s, ops);
    l.execute_ops(d, s)
}

#[test]
fn single_insert() {
    let l = TransSkip::new(cfg(1));
    let s = l.register_thread();
    assert!(run(&l, &s, &[TxnOp::insert(42)]));
    assert!(l.contains(42));
    assert!(!l.contains(7));
    assert!(run(&l, &s, &[TxnOp::find(42)]));
    assert!(!run(&l, &s, &[TxnOp::find(7)]));
}

#[test]
fn empty_skip_boundaries() {
    let l = TransSkip::new(cfg(1));
    let s = l.register_thread();
    assert!(!run(&l, &s, &[TxnOp::delete(1)]));
    assert!(!run(&l, &s, &[TxnOp::find(1)]));
    assert!(run(&l, &s, &[TxnOp::insert(1)]));
    assert!(run(&l, &s, &[TxnOp::delete(1)]));
    assert!(!l.contains(1));
}

#[test]
fn duplicate_insert_fails() {
    let l = TransSkip::new(cfg(1));
    let s = l.register_thread();
    assert!(run(&l, &s, &[TxnOp::insert(5)]));
    assert!(!run(&l, &s, &[TxnOp::insert(5)]));
    assert_eq!(l.snapshot(), vec![5]);
}

#[test]
fn atomic_swap() {
    let l = TransSkip::new(cfg(1));
    let s = l.register_thread();
    assert!(run(&l, &s, &[TxnOp::insert(1)]));
    assert!(run(&l, &s, &[TxnOp::insert(2)]));
    assert!(run(&l, &s, &[TxnOp::delete(1), TxnOp::insert(3)]));
    assert_eq!(l.snapshot(), vec![2, 3]);
}

#[test]
fn failing_batch_leaves_no_trace() {
    let l = TransSkip::new(cfg(1));
    let s = l.register_thread();
    assert!(run(&l, &s, &[TxnOp::insert(5)]));
    assert!(!run(&l, &s, &[TxnOp::insert(5), TxnOp::insert(6)]));
    assert!(!l.contains(6));
    assert_eq!(l.snapshot(), vec![5]);
}

#[test]
fn abort_rolls_back_applied_inserts() {
    let l = TransSkip::new(cfg(1));
    let s = l.register_thread();
    assert!(run(&l, &s, &[TxnOp::insert(5)]));
    assert!(!run(&l, &s, &[TxnOp::insert(6), TxnOp::insert(5)]));
    assert!(!l.contains(6));
    assert_eq!(l.snapshot(), vec![5]);
}

#[test]
fn insert_then_delete_in_one_txn() {
    let l = TransSkip::new(cfg(1));
    let s = l.register_thread();
    assert!(run(&l, &s, &[TxnOp::insert(8), TxnOp::delete(8)]));
    assert!(!l.contains(8));
}

#[test]
fn delete_then_insert_in_one_txn() {
    let l = TransSkip::new(cfg(1));
    let s = l.register_thread();
    assert!(run(&l, &s, &[TxnOp::insert(8)]));
    assert!(run(&l, &s, &[TxnOp::delete(8), TxnOp::insert(8)]));
    assert!(l.contains(8));
}

#[test]
fn level_draw_stays_in_bounds() {
    let l = TransSkip::new(cfg(1));
    let s = l.register_thread();
    let mut seen_tall = false;
    for _ in 0..4_096 {
        let level = l.random_level(&s);
        assert!((1..=NUM_LEVELS).contains(&level));
        seen_tall |= level > 1;
    }
    // a geometric draw that never leaves level 1 is broken
    assert!(seen_tall);
}

const SPAM_KEYS: u32 = 512;
const SPAM_TENANTS: usize = 8;

#[test]
fn multispam_disjoint_inserts() {
    let l = Arc::new(TransSkip::new(cfg(SPAM_TENANTS)));
    let token = Arc::new(RwLock::new(()));
    let hold = token.write();
    let threads: Vec<JoinHandle<_>> = (0..SPAM_TENANTS)
        .map(|tid| {
            let this_token = token.clone();
            let this_l = l.clone();
            thread::Builder::new()
                .name(tid.to_string())
                .spawn(move || {
                    let s = this_l.register_thread();
                    let _token = this_token.read();
                    let lo = tid as u32 * SPAM_KEYS + 1;
                    for key in lo..lo + SPAM_KEYS {
                        let d = this_l.allocate_desc(&s, &[TxnOp::insert(key)]);
                        assert!(this_l.execute_ops(d, &s));
                    }
                })
                .unwrap()
        })
        .collect();
    drop(hold);
    threads
        .into_iter()
        .for_each(|t| t.join().unwrap());
    let snap = l.snapshot();
    assert_eq!(snap.len(), SPAM_KEYS as usize * SPAM_TENANTS);
    assert!(snap.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn multispam_mixed_workload_keeps_order() {
    const TXNS: usize = 2_000;
    let l = Arc::new(TransSkip::new(TxnConfig {
        threads: SPAM_TENANTS,
        max_ops: 4,
        desc_cap: 1 << 13,
        ndesc_cap: 1 << 17,
        node_cap: 1 << 14,
        spine_cap: 1,
    }));
    let token = Arc::new(RwLock::new(()));
    let hold = token.write();
    let threads: Vec<JoinHandle<_>> = (0..SPAM_TENANTS)
        .map(|tid| {
            let this_token = token.clone();
            let this_l = l.clone();
            thread::Builder::new()
                .name(tid.to_string())
                .spawn(move || {
                    let s = this_l.register_thread();
                    let _token = this_token.read();
                    let mut rng = SmallRng::seed_from_u64(0x5c1 ^ tid as u64);
                    for _ in 0..TXNS {
                        let ops: Vec<TxnOp> = (0..2)
                            .map(|_| {
                                let key = rng.gen_range(1..=64u32);
                                match rng.gen_range(0..3u8) {
                                    0 => TxnOp::insert(key),
                                    1 => TxnOp::delete(key),
                                    _ => TxnOp::find(key),
                                }
                            })
                            .collect();
                        let d = this_l.allocate_desc(&s, &ops);
                        this_l.execute_ops(d, &s);
                    }
                })
                .unwrap()
        })
        .collect();
    drop(hold);
    threads
        .into_iter()
        .for_each(|t| t.join().unwrap());
    let m = l.metrics();
    assert_eq!(m.commits + m.aborts, (TXNS * SPAM_TENANTS) as u64);
    let snap = l.snapshot();
    assert!(snap.windows(2).all(|w| w[0] < w[1]));
}
