/*
 * Created on Sat Jun 22 2024
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

use super::{meta::MapConfig, DefConfig, MapCtx, TransMap};
use crate::{TxnConfig, TxnOp};
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
        spine_cap: 1 << 8,
    }
}

fn run<C: MapConfig>(m: &TransMap<C>, s: &MapCtx<'_>, ops: &[TxnOp]) -> bool {
    let d = m.allocate_desc(s, ops);
    m.execute_ops(d, s)
}

#[test]
fn update_of_absent_key_aborts() {
    let m: TransMap = TransMap::new(cfg(1), 4);
    let s = m.register_thread();
    assert!(!run(&m, &s, &[TxnOp::update(1, 9)]));
    assert_eq!(m.get(1), None);
}

#[test]
fn insert_get_update_delete() {
    let m: TransMap = TransMap::new(cfg(1), 4);
    let s = m.register_thread();
    assert!(run(&m, &s, &[TxnOp::insert_kv(7, 70)]));
    assert_eq!(m.get(7), Some(70));
    assert!(run(&m, &s, &[TxnOp::update(7, 71)]));
    assert_eq!(m.get(7), Some(71));
    assert!(run(&m, &s, &[TxnOp::delete(7)]));
    assert_eq!(m.get(7), None);
    assert!(!run(&m, &s, &[TxnOp::delete(7)]));
    assert!(!run(&m, &s, &[TxnOp::find(7)]));
}

#[test]
fn duplicate_insert_fails() {
    let m: TransMap = TransMap::new(cfg(1), 4);
    let s = m.register_thread();
    assert!(run(&m, &s, &[TxnOp::insert_kv(3, 1)]));
    assert!(!run(&m, &s, &[TxnOp::insert_kv(3, 2)]));
    assert_eq!(m.get(3), Some(1));
}

#[test]
fn insert_and_update_in_one_txn() {
    let m: TransMap = TransMap::new(cfg(1), 4);
    let s = m.register_thread();
    assert!(run(
        &m,
        &s,
        &[TxnOp::insert_kv(5, 50), TxnOp::update(5, 51)]
    ));
    assert_eq!(m.get(5), Some(51));
}

#[test]
fn aborted_update_preserves_value() {
    let m: TransMap = TransMap::new(cfg(1), 4);
    let s = m.register_thread();
    assert!(run(&m, &s, &[TxnOp::insert_kv(5, 50)]));
    // the delete of an absent key aborts the batch; the update that claimed
    // the node first must roll back to the logged value
    assert!(!run(&m, &s, &[TxnOp::update(5, 99), TxnOp::delete(6)]));
    assert_eq!(m.get(5), Some(50));
}

#[test]
fn failing_batch_leaves_no_trace() {
    let m: TransMap = TransMap::new(cfg(1), 4);
    let s = m.register_thread();
    assert!(run(&m, &s, &[TxnOp::insert_kv(5, 1)]));
    assert!(!run(
        &m,
        &s,
        &[TxnOp::insert_kv(5, 2), TxnOp::insert_kv(6, 3)]
    ));
    assert_eq!(m.get(6), None);
    assert_eq!(m.get(5), Some(1));
}

#[test]
fn abort_rolls_back_applied_inserts() {
    let m: TransMap = TransMap::new(cfg(1), 4);
    let s = m.register_thread();
    assert!(run(&m, &s, &[TxnOp::insert_kv(5, 1)]));
    // op 0 lands before op 1 hits the duplicate; the abort must unwind it
    assert!(!run(
        &m,
        &s,
        &[TxnOp::insert_kv(6, 3), TxnOp::insert_kv(5, 2)]
    ));
    assert_eq!(m.get(6), None);
    assert_eq!(m.get(5), Some(1));
}

#[test]
fn insert_then_delete_in_one_txn() {
    let m: TransMap = TransMap::new(cfg(1), 4);
    let s = m.register_thread();
    assert!(run(&m, &s, &[TxnOp::insert_kv(8, 1), TxnOp::delete(8)]));
    assert_eq!(m.get(8), None);
}

#[test]
fn phantom_keys_do_not_survive_abort() {
    let m: TransMap = TransMap::new(cfg(1), 4);
    let s = m.register_thread();
    assert!(run(&m, &s, &[TxnOp::insert_kv(5, 1)]));
    assert!(!run(
        &m,
        &s,
        &[
            TxnOp::insert_kv(6, 2),
            TxnOp::delete(6),
            TxnOp::insert_kv(5, 3)
        ]
    ));
    assert_eq!(m.get(6), None);
    assert_eq!(m.get(5), Some(1));
}

/// Identity hashing (still a bijection) plus a tiny top spine makes collision
/// chains deterministic: keys 1 and 257 share slot 1 of a 4-wide top spine
/// and the first sub-spine slice, diverging on the second.
struct ColConfig;
impl MapConfig for ColConfig {
    fn hash_key(k: u32) -> u32 {
        k
    }
}

const COL_A: u32 = 1;
const COL_B: u32 = 257;

#[test]
fn colliding_keys_expand_into_sub_spines() {
    let m: TransMap<ColConfig> = TransMap::new(cfg(1), 2);
    let s = m.register_thread();
    assert!(run(&m, &s, &[TxnOp::insert_kv(COL_A, 11)]));
    assert!(run(&m, &s, &[TxnOp::insert_kv(COL_B, 22)]));
    assert_eq!(m.get(COL_A), Some(11));
    assert_eq!(m.get(COL_B), Some(22));
    // and both survive one being deleted
    assert!(run(&m, &s, &[TxnOp::delete(COL_A)]));
    assert_eq!(m.get(COL_A), None);
    assert_eq!(m.get(COL_B), Some(22));
}

#[test]
fn cross_key_batch_is_atomic() {
    let m: TransMap = TransMap::new(cfg(1), 4);
    let s = m.register_thread();
    assert!(run(
        &m,
        &s,
        &[TxnOp::insert_kv(1, 10), TxnOp::insert_kv(2, 20)]
    ));
    assert!(run(
        &m,
        &s,
        &[TxnOp::delete(1), TxnOp::update(2, 21), TxnOp::insert_kv(3, 30)]
    ));
    assert_eq!(m.get(1), None);
    assert_eq!(m.get(2), Some(21));
    assert_eq!(m.get(3), Some(30));
}

const SPAM_TENANTS: usize = 8;

#[test]
fn multispam_colliding_hammer() {
    // the forced-expansion scenario: every thread hammers the same two keys
    // whose slot paths collide through the first sub-spine level
    const ROUNDS: usize = 1_000;
    // one extra slot for the verification pass on the main thread
    let m: Arc<TransMap<ColConfig>> = Arc::new(TransMap::new(
        TxnConfig {
            threads: SPAM_TENANTS + 1,
            max_ops: 4,
            desc_cap: 1 << 13,
            ndesc_cap: 1 << 17,
            node_cap: 1 << 14,
            spine_cap: 1 << 10,
        },
        2,
    ));
    let token = Arc::new(RwLock::new(()));
    let hold = token.write();
    let threads: Vec<JoinHandle<_>> = (0..SPAM_TENANTS)
        .map(|tid| {
            let this_token = token.clone();
            let this_m = m.clone();
            thread::Builder::new()
                .name(tid.to_string())
                .spawn(move || {
                    let s = this_m.register_thread();
                    let _token = this_token.read();
                    for i in 0..ROUNDS {
                        let key = if i % 2 == 0 { COL_A } else { COL_B };
                        let d = this_m.allocate_desc(
                            &s,
                            &[if i % 4 < 2 {
                                TxnOp::insert_kv(key, tid as u32)
                            } else {
                                TxnOp::delete(key)
                            }],
                        );
                        this_m.execute_ops(d, &s);
                    }
                })
                .unwrap()
        })
        .collect();
    drop(hold);
    threads
        .into_iter()
        .for_each(|t| t.join().unwrap());
    // the hammer terminated; now drive both keys to present
    let s = m.register_thread();
    for key in [COL_A, COL_B] {
        if m.get(key).is_none() {
            assert!(run(&m, &s, &[TxnOp::insert_kv(key, 7)]));
        }
        assert!(m.get(key).is_some());
    }
    let r = m.metrics();
    assert!(r.commits > 0);
}

#[test]
fn multispam_disjoint_inserts() {
    const KEYS: u32 = 512;
    let m: Arc<TransMap<DefConfig>> = Arc::new(TransMap::new(
        TxnConfig {
            threads: SPAM_TENANTS,
            max_ops: 4,
            desc_cap: 1 << 13,
            ndesc_cap: 1 << 16,
            node_cap: 1 << 13,
            spine_cap: 1 << 10,
        },
        4,
    ));
    let token = Arc::new(RwLock::new(()));
    let hold = token.write();
    let threads: Vec<JoinHandle<_>> = (0..SPAM_TENANTS)
        .map(|tid| {
            let this_token = token.clone();
            let this_m = m.clone();
            thread::Builder::new()
                .name(tid.to_string())
                .spawn(move || {
                    let s = this_m.register_thread();
                    let _token = this_token.read();
                    let lo = tid as u32 * KEYS + 1;
                    for key in lo..lo + KEYS {
                        let d = this_m.allocate_desc(&s, &[TxnOp::insert_kv(key, key + 1)]);
                        assert!(this_m.execute_ops(d, &s));
                    }
                })
                .unwrap()
        })
        .collect();
    drop(hold);
    threads
        .into_iter()
        .for_each(|t| t.join().unwrap());
    for key in 1..=KEYS * SPAM_TENANTS as u32 {
        assert_eq!(m.get(key), Some(key + 1));
    }
}
