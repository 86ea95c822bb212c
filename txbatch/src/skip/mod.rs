/*
 * Created on Sun May 05 2024
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

#[cfg(test)]
mod tests;

/*
    transactional skip list
    ---
    A Fraser-style CAS skip list with the transactional annotation protocol
    layered onto the bottom level. Only level 0 carries logical state: a key is
    in the set iff its bottom-level node says so through its annotation. The
    index levels above are pure routing and may lag arbitrarily behind: an
    insert linearizes at the level-0 splice, and deletion marks the tower
    top-down before predecessors are swung.

    The two tag protocols of the list apply unchanged: link marks on `next[i]`
    (unlink pending, per level) and the delete-authority mark on `node_desc`.
*/

use crate::{
    mem::{Arena, ArenaSlab},
    sync::atm::{cpin, ensure_flag_align, Atomic, Guard, Shared},
    txn::{
        exec::{self, HelpStack, OpOutcome, TxnStore},
        is_key_present, is_same_op,
        metrics::{MetricSlot, MetricsReport, TxnMetrics},
        DescFlag, DescPool, DescRef, LinkFlag, NodeDesc, OpKind, Registry, TxnConfig, TxnCtx,
        TxnDesc, TxnOp, KEY_MAX, KEY_MIN,
    },
};
use core::{
    cell::RefCell,
    ptr::{self, NonNull},
};
use rand::{rngs::SmallRng, Rng, SeedableRng};

/// Tower height bound; levels are drawn geometrically with drop rate 0.5
const NUM_LEVELS: usize = 20;

pub(crate) struct SkipNode {
    key: u32,
    /// Live tower height; written before publication, constant afterwards
    level: usize,
    node_desc: Atomic<NodeDesc>,
    next: [Atomic<SkipNode>; NUM_LEVELS],
}

const _: () = ensure_flag_align::<SkipNode>(LinkFlag::bits());

impl SkipNode {
    const NULL: Atomic<SkipNode> = Atomic::null();
    const NULL_TOWER: [Atomic<SkipNode>; NUM_LEVELS] = [Self::NULL; NUM_LEVELS];
    fn sentinel(key: u32) -> Self {
        Self {
            key,
            level: NUM_LEVELS,
            node_desc: Atomic::null(),
            next: Self::NULL_TOWER,
        }
    }
}

#[derive(Clone, Copy)]
pub(crate) struct SkipTarget {
    node: *const SkipNode,
}

type Levels<'g> = [Shared<'g, SkipNode>; NUM_LEVELS];

/// Per-thread session for a [`TransSkip`]; obtain via
/// [`TransSkip::register_thread`]
pub struct SkipCtx<'c> {
    tx: TxnCtx<'c>,
    node: ArenaSlab<'c, SkipNode>,
    rng: RefCell<SmallRng>,
}

/// A lock-free skip list (set of u32 keys) executing descriptor batches
/// atomically. Keys must lie strictly between [`KEY_MIN`] and [`KEY_MAX`].
pub struct TransSkip {
    head: Box<SkipNode>,
    tail: Box<SkipNode>,
    desc_pool: DescPool,
    ndesc_pool: Arena<NodeDesc>,
    node_pool: Arena<SkipNode>,
    registry: Registry,
    metrics: TxnMetrics,
}

impl TransSkip {
    pub fn new(cfg: TxnConfig) -> Self {
        let tail = Box::new(SkipNode::sentinel(KEY_MAX));
        let head = Box::new(SkipNode::sentinel(KEY_MIN));
        for i in 0..NUM_LEVELS {
            head.next[i].st_rlx(Shared::from(&*tail as *const SkipNode));
        }
        Self {
            head,
            tail,
            desc_pool: DescPool::new(cfg.max_ops, cfg.desc_cap, cfg.threads),
            ndesc_pool: Arena::new(cfg.ndesc_cap, cfg.threads),
            node_pool: Arena::new(cfg.node_cap, cfg.threads),
            registry: Registry::new(cfg.threads),
            metrics: TxnMetrics::new(cfg.threads),
        }
    }

    /// Claim a thread slot. Call once per worker thread, on that thread.
    pub fn register_thread(&self) -> SkipCtx<'_> {
        let tid = self.registry.ticket();
        SkipCtx {
            tx: TxnCtx {
                desc: self.desc_pool.slab(tid),
                ndesc: self.ndesc_pool.slab(tid),
                help: HelpStack::new(),
                metric: self.metrics.slot(tid),
            },
            node: self.node_pool.slab(tid),
            rng: RefCell::new(SmallRng::seed_from_u64(0x736b_6970 ^ tid as u64)),
        }
    }

    /// Build a transaction descriptor from `ops` (`Update` is not a skip-list
    /// operation)
    pub fn allocate_desc<'c>(&'c self, s: &SkipCtx<'c>, ops: &[TxnOp]) -> DescRef<'c> {
        assert!(
            ops.iter().all(|op| op.kind != OpKind::Update),
            "skip,badop"
        );
        DescRef::new(s.tx.desc.alloc(ops))
    }

    /// Atomically apply the whole batch; true iff it committed
    pub fn execute_ops(&self, desc: DescRef<'_>, s: &SkipCtx<'_>) -> bool {
        let g = cpin();
        exec::execute_ops(self, desc.get(), s, &g)
    }

    /// Fold the per-thread outcome counters
    pub fn metrics(&self) -> MetricsReport {
        self.metrics.fold()
    }

    /// Read-only membership probe resolving logical presence (quiescent
    /// diagnostic)
    pub fn contains(&self, key: u32) -> bool {
        let g = cpin();
        let g = &g;
        let mut curr = self.head.next[0].ld_acq(g).with_tag(0);
        loop {
            let c = unsafe {
                // UNSAFE(@theo): chain pointers are arena- or sentinel-backed
                curr.deref()
            };
            if c.key >= key {
                break c.key == key && {
                    let nd = c.node_desc.ld_acq(g);
                    nd.tag() == 0
                        && is_key_present(unsafe {
                            // UNSAFE(@theo): real nodes always carry an annotation
                            nd.deref()
                        })
                };
            }
            curr = c.next[0].ld_acq(g).with_tag(0);
        }
    }

    /// The present keys in bottom-level order (quiescent diagnostic)
    pub fn snapshot(&self) -> Vec<u32> {
        let g = cpin();
        let g = &g;
        let mut out = Vec::new();
        let mut curr = self.head.next[0].ld_acq(g).with_tag(0);
        loop {
            let c = unsafe {
                // UNSAFE(@theo): as in contains()
                curr.deref()
            };
            if c.key == KEY_MAX {
                break out;
            }
            let nd = c.node_desc.ld_acq(g);
            let dead = c.next[0].ld_acq(g).tag() & LinkFlag::MARK.d() != 0;
            if !dead
                && nd.tag() == 0
                && is_key_present(unsafe {
                    // UNSAFE(@theo): as in contains()
                    nd.deref()
                })
            {
                out.push(c.key);
            }
            curr = c.next[0].ld_acq(g).with_tag(0);
        }
    }

    #[inline(always)]
    fn head_ref<'g>(&'g self, _: &'g Guard) -> Shared<'g, SkipNode> {
        Shared::from(&*self.head as *const SkipNode)
    }

    fn random_level(&self, s: &SkipCtx<'_>) -> usize {
        let r: u32 = s.rng.borrow_mut().gen();
        let mut r = (r >> 4) & ((1 << (NUM_LEVELS - 1)) - 1);
        let mut level = 1;
        while r & 1 == 1 {
            level += 1;
            r >>= 1;
        }
        level
    }

    /// Optimistic search: finds per-level predecessors/successors without
    /// removing marked nodes
    fn weak_search<'g>(&'g self, key: u32, g: &'g Guard) -> (Levels<'g>, Levels<'g>) {
        let mut pa = [Shared::null(); NUM_LEVELS];
        let mut na = [Shared::null(); NUM_LEVELS];
        let mut x = self.head_ref(g);
        for i in (0..NUM_LEVELS).rev() {
            loop {
                let x_next = unsafe {
                    // UNSAFE(@theo): routing pointers are arena/sentinel nodes
                    x.deref()
                }
                .next[i]
                    .ld_acq(g)
                    .with_tag(0);
                if unsafe { x_next.deref() }.key >= key {
                    pa[i] = x;
                    na[i] = x_next;
                    break;
                }
                x = x_next;
            }
        }
        (pa, na)
    }

    /// Cleaning search: swings predecessors over marked runs at every level,
    /// restarting whenever a CAS loses
    fn strong_search<'g>(&'g self, key: u32, g: &'g Guard) -> (Levels<'g>, Levels<'g>) {
        'retry: loop {
            let mut pa = [Shared::null(); NUM_LEVELS];
            let mut na = [Shared::null(); NUM_LEVELS];
            let mut x = self.head_ref(g);
            for i in (0..NUM_LEVELS).rev() {
                // start from the previous level's unmarked predecessor; if its
                // pointer is marked, so is the whole path: retry
                let mut x_next = unsafe { x.deref() }.next[i].ld_acq(g);
                if x_next.tag() & LinkFlag::MARK.d() != 0 {
                    continue 'retry;
                }
                let mut y = x_next;
                loop {
                    // shift over a run of marked nodes
                    let y_next = loop {
                        let y_next = unsafe { y.deref() }.next[i].ld_acq(g);
                        if y_next.tag() & LinkFlag::MARK.d() == 0 {
                            break y_next;
                        }
                        y = y_next.with_tag(0);
                    };
                    if unsafe { y.deref() }.key >= key {
                        break;
                    }
                    x = y;
                    x_next = y_next;
                }
                // swing the forward pointer over whatever we skipped
                if x_next != y
                    && unsafe { x.deref() }.next[i].cx_rel(x_next, y, g).is_err()
                {
                    continue 'retry;
                }
                pa[i] = x;
                na[i] = y;
            }
            return (pa, na);
        }
    }

    /// Mark `x`'s forward pointers from `level - 1` down to 0. Once level 0
    /// is marked the node is effectively gone; searches finish the unlink.
    fn mark_deleted(&self, x: &SkipNode, level: usize, g: &Guard) {
        for i in (0..level).rev() {
            x.next[i].or_tag(LinkFlag::MARK.d(), g);
        }
    }

    fn finish_pending_txn(
        &self,
        nd: Shared<'_, NodeDesc>,
        desc: &TxnDesc,
        s: &SkipCtx<'_>,
        g: &Guard,
    ) {
        let nd = unsafe {
            // UNSAFE(@theo): caller checked the mark bit
            nd.deref()
        };
        if ptr::eq(nd.desc, desc) {
            return;
        }
        exec::help_ops(self, nd.desc(), nd.opid + 1, s, g);
    }

    fn tx_insert<'g>(
        &'g self,
        key: u32,
        desc: &TxnDesc,
        opid: u8,
        s: &SkipCtx<'_>,
        g: &'g Guard,
    ) -> (OpOutcome, Option<SkipTarget>) {
        debug_assert!(key > KEY_MIN && key < KEY_MAX, "skip,keydomain");
        let nd = s.tx.ndesc.alloc(NodeDesc::new(desc, opid));
        let nd = Shared::from(nd.as_ptr() as *const NodeDesc);
        let (mut preds, mut succs) = self.weak_search(key, g);
        let mut succ = succs[0];
        let mut new_node: Option<NonNull<SkipNode>> = None;
        'retry: loop {
            let sc = unsafe { succ.deref() };
            if sc.key == key {
                let old_nd = sc.node_desc.ld_acq(g);
                if old_nd.tag() & DescFlag::MARK.d() != 0 {
                    // dying node: drive its tower marks, clean, retraverse
                    self.mark_deleted(sc, sc.level, g);
                    (preds, succs) = self.strong_search(key, g);
                    succ = succs[0];
                    continue 'retry;
                }
                self.finish_pending_txn(old_nd, desc, s, g);
                let old = unsafe { old_nd.deref() };
                if is_same_op(old, desc, opid) {
                    return (OpOutcome::Skip, None);
                }
                if is_key_present(old) {
                    return (OpOutcome::Fail, None);
                }
                if !desc.is_active() {
                    return (OpOutcome::Fail, None);
                }
                if sc.node_desc.cx_rel(old_nd, nd, g).is_ok() {
                    return (
                        OpOutcome::Ok,
                        Some(SkipTarget {
                            node: succ.as_raw(),
                        }),
                    );
                }
                continue 'retry;
            }
            // not in the list: splice in a fresh tower
            let nn = *new_node.get_or_insert_with(|| {
                let level = self.random_level(s);
                s.node.alloc(SkipNode {
                    key,
                    level,
                    node_desc: Atomic::from(nd),
                    next: SkipNode::NULL_TOWER,
                })
            });
            let nn_ref = unsafe {
                // UNSAFE(@theo): ours until the level-0 CAS lands
                nn.as_ref()
            };
            let level = nn_ref.level;
            for i in 0..level {
                nn_ref.next[i].st_rlx(succs[i]);
            }
            if !desc.is_active() {
                return (OpOutcome::Fail, None);
            }
            // level 0 is the splice that counts
            if unsafe { preds[0].deref() }
                .next[0]
                .cx_rel(succ, Shared::from(nn.as_ptr() as *const SkipNode), g)
                .is_err()
            {
                (preds, succs) = self.strong_search(key, g);
                succ = succs[0];
                continue 'retry;
            }
            // splice the index levels; a concurrent delete may beat us to the
            // node, in which case whatever is spliced so far is enough
            let mut i = 1;
            while i < level {
                let new_next = nn_ref.next[i].ld_acq(g);
                if new_next.tag() & LinkFlag::MARK.d() != 0 {
                    break;
                }
                if new_next != succs[i]
                    && match nn_ref.next[i].cx_rel(new_next, succs[i], g) {
                        Ok(_) => false,
                        Err(e) => {
                            if e.current.tag() & LinkFlag::MARK.d() != 0 {
                                break;
                            }
                            true
                        }
                    }
                {
                    // someone swung our forward pointer; re-read it
                    continue;
                }
                if unsafe { succs[i].deref() }.key == key {
                    // stale successor view at this level
                    (preds, succs) = self.strong_search(key, g);
                    continue;
                }
                if unsafe { preds[i].deref() }
                    .next[i]
                    .cx_rel(succs[i], Shared::from(nn.as_ptr() as *const SkipNode), g)
                    .is_ok()
                {
                    i += 1;
                } else {
                    (preds, succs) = self.strong_search(key, g);
                }
            }
            return (
                OpOutcome::Ok,
                Some(SkipTarget {
                    node: nn.as_ptr(),
                }),
            );
        }
    }

    fn tx_delete<'g>(
        &'g self,
        key: u32,
        desc: &TxnDesc,
        opid: u8,
        s: &SkipCtx<'_>,
        g: &'g Guard,
    ) -> (OpOutcome, Option<SkipTarget>) {
        debug_assert!(key > KEY_MIN && key < KEY_MAX, "skip,keydomain");
        let nd = s.tx.ndesc.alloc(NodeDesc::new(desc, opid));
        let nd = Shared::from(nd.as_ptr() as *const NodeDesc);
        let (_, succs) = self.weak_search(key, g);
        let succ = succs[0];
        loop {
            let sc = unsafe { succ.deref() };
            if sc.key != key {
                return (OpOutcome::Fail, None);
            }
            let old_nd = sc.node_desc.ld_acq(g);
            if old_nd.tag() & DescFlag::MARK.d() != 0 {
                return (OpOutcome::Fail, None);
            }
            self.finish_pending_txn(old_nd, desc, s, g);
            let old = unsafe { old_nd.deref() };
            if is_same_op(old, desc, opid) {
                return (OpOutcome::Skip, None);
            }
            if !is_key_present(old) {
                return (OpOutcome::Fail, None);
            }
            if !desc.is_active() {
                return (OpOutcome::Fail, None);
            }
            if sc.node_desc.cx_rel(old_nd, nd, g).is_ok() {
                return (
                    OpOutcome::Ok,
                    Some(SkipTarget {
                        node: succ.as_raw(),
                    }),
                );
            }
        }
    }

    fn tx_find<'g>(
        &'g self,
        key: u32,
        desc: &TxnDesc,
        opid: u8,
        s: &SkipCtx<'_>,
        g: &'g Guard,
    ) -> OpOutcome {
        debug_assert!(key > KEY_MIN && key < KEY_MAX, "skip,keydomain");
        let mut nd: Option<NonNull<NodeDesc>> = None;
        let (_, succs) = self.weak_search(key, g);
        let succ = succs[0];
        loop {
            let sc = unsafe { succ.deref() };
            if sc.key != key {
                return OpOutcome::Fail;
            }
            let old_nd = sc.node_desc.ld_acq(g);
            if old_nd.tag() & DescFlag::MARK.d() != 0 {
                return OpOutcome::Fail;
            }
            self.finish_pending_txn(old_nd, desc, s, g);
            let old = unsafe { old_nd.deref() };
            let ndp = *nd.get_or_insert_with(|| s.tx.ndesc.alloc(NodeDesc::new(desc, opid)));
            if is_same_op(old, desc, opid) {
                return OpOutcome::Skip;
            }
            if !is_key_present(old) {
                return OpOutcome::Fail;
            }
            if !desc.is_active() {
                return OpOutcome::Fail;
            }
            // publish the witness unconditionally: later writers must see us
            if sc
                .node_desc
                .cx_rel(old_nd, Shared::from(ndp.as_ptr() as *const NodeDesc), g)
                .is_ok()
            {
                return OpOutcome::Ok;
            }
        }
    }
}

impl<'c> TxnStore<SkipCtx<'c>> for TransSkip {
    type Target = SkipTarget;
    fn help_stack<'a>(&self, s: &'a SkipCtx<'c>) -> &'a HelpStack {
        &s.tx.help
    }
    fn metric<'a>(&self, s: &'a SkipCtx<'c>) -> &'a MetricSlot {
        s.tx.metric
    }
    fn tx_run(
        &self,
        op: &TxnOp,
        desc: &TxnDesc,
        opid: u8,
        s: &SkipCtx<'c>,
        g: &Guard,
    ) -> (OpOutcome, Option<SkipTarget>) {
        match op.kind {
            OpKind::Insert => self.tx_insert(op.key, desc, opid, s, g),
            OpKind::Delete => self.tx_delete(op.key, desc, opid, s, g),
            OpKind::Find => (self.tx_find(op.key, desc, opid, s, g), None),
            // not a skip-list operation
            OpKind::Update => (OpOutcome::Fail, None),
        }
    }
    fn tx_mark(&self, t: SkipTarget, desc: &TxnDesc, _s: &SkipCtx<'c>, g: &Guard) {
        let n = unsafe {
            // UNSAFE(@theo): targets recorded by tx_run are arena nodes
            &*t.node
        };
        let nd = n.node_desc.ld_acq(g);
        if nd.tag() != 0 {
            return;
        }
        let ndr = unsafe {
            // UNSAFE(@theo): unmarked annotations are never null here
            nd.deref()
        };
        // see the list: a later same-transaction insert may have re-claimed
        // this node, in which case the committed node lives
        let kill = ptr::eq(ndr.desc, desc) && (desc.is_aborted() || !is_key_present(ndr));
        if kill
            && n.node_desc
                .cx_rel(nd, nd.with_tag(DescFlag::MARK.d()), g)
                .is_ok()
        {
            self.mark_deleted(n, n.level, g);
            // swing predecessors off the dead tower
            let _ = self.strong_search(n.key, g);
        }
    }
}
