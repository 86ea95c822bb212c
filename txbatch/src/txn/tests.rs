/*
 * Created on Sun Apr 07 2024
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

use super::{
    exec::HelpStack, is_key_present, metrics::TxnMetrics, resolved_value, DescPool, DescSlab,
    NodeDesc, TxnDesc, TxnOp, TxnStatus,
};

fn pool() -> DescPool {
    DescPool::new(8, 32, 1)
}

// a slab hands out one record per bump; it must be shared within a test or
// descriptors would alias
fn mk<'a>(slab: &DescSlab<'a>, ops: &[TxnOp]) -> &'a TxnDesc {
    unsafe { &*slab.alloc(ops).as_ptr() }
}

#[test]
fn desc_roundtrip() {
    let pool = pool();
    let slab = pool.slab(0);
    let ops = [TxnOp::insert(1), TxnOp::delete(2), TxnOp::find(3)];
    let d = mk(&slab, &ops);
    assert_eq!(d.status(), TxnStatus::Active);
    assert_eq!(d.size(), 3);
    assert_eq!(d.ops(), &ops[..]);
}

#[test]
fn desc_records_do_not_alias() {
    let pool = pool();
    let slab = pool.slab(0);
    let a = slab.alloc(&[TxnOp::insert(1)]);
    let b = slab.alloc(&[TxnOp::insert(2), TxnOp::insert(3)]);
    let (a, b) = unsafe { (a.as_ref(), b.as_ref()) };
    assert_eq!(a.ops()[0].key, 1);
    assert_eq!(b.ops()[1].key, 3);
    assert_eq!(a.size(), 1);
}

#[test]
#[should_panic(expected = "desc,opcount")]
fn desc_too_many_ops() {
    let pool = pool();
    let slab = pool.slab(0);
    let ops = [TxnOp::find(1); 9];
    slab.alloc(&ops);
}

#[test]
fn status_transitions_once() {
    let pool = pool();
    let slab = pool.slab(0);
    let d = mk(&slab, &[TxnOp::insert(1)]);
    assert!(d.try_commit());
    assert_eq!(d.status(), TxnStatus::Committed);
    // the second transition must lose, both ways
    assert!(!d.try_abort());
    assert!(!d.try_commit());
    assert_eq!(d.status(), TxnStatus::Committed);

    let d = mk(&slab, &[TxnOp::insert(1)]);
    assert!(d.try_abort());
    assert!(!d.try_commit());
    assert_eq!(d.status(), TxnStatus::Aborted);
}

/*
    the logical membership table: (op kind, status) → present?
*/

#[test]
fn presence_insert() {
    let pool = pool();
    let slab = pool.slab(0);
    // active insert: present for the owning transaction's later ops
    let d = mk(&slab, &[TxnOp::insert_kv(7, 1)]);
    let nd = NodeDesc::new(d, 0);
    assert!(is_key_present(&nd));
    assert!(d.try_commit());
    assert!(is_key_present(&nd));

    let d = mk(&slab, &[TxnOp::insert_kv(7, 1)]);
    let nd = NodeDesc::new(d, 0);
    assert!(d.try_abort());
    assert!(!is_key_present(&nd));
}

#[test]
fn presence_delete() {
    let pool = pool();
    let slab = pool.slab(0);
    let d = mk(&slab, &[TxnOp::delete(7)]);
    let nd = NodeDesc::with_value(d, 0, 5);
    // active delete: absent for the owning transaction's later ops
    assert!(!is_key_present(&nd));
    assert!(d.try_commit());
    assert!(!is_key_present(&nd));

    let d = mk(&slab, &[TxnOp::delete(7)]);
    let nd = NodeDesc::with_value(d, 0, 5);
    assert!(d.try_abort());
    // an aborted delete never happened
    assert!(is_key_present(&nd));
    assert_eq!(resolved_value(&nd), 5);
}

#[test]
fn presence_find_and_update_never_change_membership() {
    let pool = pool();
    let slab = pool.slab(0);
    let resolvers: [fn(&TxnDesc) -> bool; 2] = [TxnDesc::try_commit, TxnDesc::try_abort];
    for mk_op in [TxnOp::find(7), TxnOp::update(7, 9)] {
        for resolve in resolvers {
            let d = mk(&slab, &[mk_op]);
            let nd = NodeDesc::with_value(d, 0, 3);
            assert!(is_key_present(&nd));
            assert!(resolve(d));
            assert!(is_key_present(&nd));
        }
    }
}

#[test]
fn value_resolution() {
    let pool = pool();
    let slab = pool.slab(0);
    // committed update supplies its own value
    let d = mk(&slab, &[TxnOp::update(7, 9)]);
    let nd = NodeDesc::with_value(d, 0, 3);
    assert!(d.try_commit());
    assert_eq!(resolved_value(&nd), 9);
    // aborted update falls back to the logged value
    let d = mk(&slab, &[TxnOp::update(7, 9)]);
    let nd = NodeDesc::with_value(d, 0, 3);
    assert!(d.try_abort());
    assert_eq!(resolved_value(&nd), 3);
    // finds always report the log
    let d = mk(&slab, &[TxnOp::find(7)]);
    let nd = NodeDesc::with_value(d, 0, 3);
    assert!(d.try_commit());
    assert_eq!(resolved_value(&nd), 3);
}

// help stack

#[test]
fn help_stack_tracks_membership() {
    let pool = pool();
    let slab = pool.slab(0);
    let a = mk(&slab, &[TxnOp::find(1)]);
    let b = mk(&slab, &[TxnOp::find(2)]);
    let h = HelpStack::new();
    assert!(!h.contains(a));
    h.push(a);
    assert!(h.contains(a));
    assert!(!h.contains(b));
    h.push(b);
    assert!(h.contains(b));
    h.pop();
    assert!(!h.contains(b));
    assert!(h.contains(a));
    h.init();
    assert!(!h.contains(a));
}

// metrics

#[test]
fn metrics_fold_sums_thread_slots() {
    let m = TxnMetrics::new(3);
    m.slot(0).commit();
    m.slot(0).commit();
    m.slot(1).abort();
    m.slot(2).fake_abort();
    let r = m.fold();
    assert_eq!(r.commits, 2);
    // a fake abort is also an abort
    assert_eq!(r.aborts, 2);
    assert_eq!(r.fake_aborts, 1);
    assert_eq!(format!("{r}"), "commit 2 abort 2/1 fake");
}
