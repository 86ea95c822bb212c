/*
 * Created on Sun Apr 14 2024
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


/*
    transactional ordered list
    ---
    A sorted singly-linked list between two sentinels, with set semantics. Two
    independent tag protocols run over it:
    - a node's own `next` pointer carries the unlink-pending mark: once set,
      the node is physically dead and traversals snip it out of its
      predecessor in passing;
    - a node's annotation (`node_desc`) pointer carries the delete-authority
      mark, which ends the node's transactional life.
    Everything logical happens on the annotation word: inserting into a
    logically-absent-but-physically-present node, deleting a present one, or
    witnessing one with a find are all the same single CAS that swaps the
    annotation to a fresh (descriptor, op) pair.
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
use core::ptr::{self, NonNull};

pub(crate) struct Node {
    key: u32,
    next: Atomic<Node>,
    node_desc: Atomic<NodeDesc>,
}

const _: () = ensure_flag_align::<Node>(LinkFlag::bits());

impl Node {
    fn sentinel(key: u32) -> Self {
        Self {
            key,
            next: Atomic::null(),
            node_desc: Atomic::null(),
        }
    }
}

/// The node (and the predecessor that led to it) claimed by one effective
/// insert or delete; replayed by the status-CAS winner for physical cleanup
#[derive(Clone, Copy)]
pub(crate) struct ListTarget {
    node: *const Node,
    pred: *const Node,
}

/// Per-thread session for a [`TransList`]; obtain via
/// [`TransList::register_thread`]
pub struct ListCtx<'c> {
    tx: TxnCtx<'c>,
    node: ArenaSlab<'c, Node>,
}

/// A lock-free ordered list (set of u32 keys) executing descriptor batches
/// atomically. Keys must lie strictly between [`KEY_MIN`] and [`KEY_MAX`].
pub struct TransList {
    head: Box<Node>,
    tail: Box<Node>,
    desc_pool: DescPool,
    ndesc_pool: Arena<NodeDesc>,
    node_pool: Arena<Node>,
    registry: Registry,
    metrics: TxnMetrics,
}

impl TransList {
    pub fn new(cfg: TxnConfig) -> Self {
        let tail = Box::new(Node::sentinel(KEY_MAX));
        let head = Box::new(Node::sentinel(KEY_MIN));
        head.next
            .st_rlx(Shared::from(&*tail as *const Node));
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
    pub fn register_thread(&self) -> ListCtx<'_> {
        let tid = self.registry.ticket();
        ListCtx {
            tx: TxnCtx {
                desc: self.desc_pool.slab(tid),
                ndesc: self.ndesc_pool.slab(tid),
                help: HelpStack::new(),
                metric: self.metrics.slot(tid),
            },
            node: self.node_pool.slab(tid),
        }
    }

    /// Build a transaction descriptor from `ops` (1..=`max_ops` of them;
    /// `Update` is not a list operation)
    pub fn allocate_desc<'c>(&'c self, s: &ListCtx<'c>, ops: &[TxnOp]) -> DescRef<'c> {
        assert!(
            ops.iter().all(|op| op.kind != OpKind::Update),
            "list,badop"
        );
        DescRef::new(s.tx.desc.alloc(ops))
    }

    /// Atomically apply the whole batch; true iff it committed
    pub fn execute_ops(&self, desc: DescRef<'_>, s: &ListCtx<'_>) -> bool {
        let g = cpin();
        exec::execute_ops(self, desc.get(), s, &g)
    }

    /// Fold the per-thread outcome counters
    pub fn metrics(&self) -> MetricsReport {
        self.metrics.fold()
    }

    /// Read-only membership probe resolving logical presence. Diagnostic
    /// surface: exact only while no transaction is in flight on `key`.
    pub fn contains(&self, key: u32) -> bool {
        let g = cpin();
        let g = &g;
        let mut curr = self.head.next.ld_acq(g).with_tag(0);
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
                            // UNSAFE(@theo): non-sentinel nodes always carry an
                            // annotation
                            nd.deref()
                        })
                };
            }
            curr = c.next.ld_acq(g).with_tag(0);
        }
    }

    /// The present keys in chain order (quiescent diagnostic)
    pub fn snapshot(&self) -> Vec<u32> {
        let g = cpin();
        let g = &g;
        let mut out = Vec::new();
        let mut curr = self.head.next.ld_acq(g).with_tag(0);
        loop {
            let c = unsafe {
                // UNSAFE(@theo): as in contains()
                curr.deref()
            };
            if c.key == KEY_MAX {
                break out;
            }
            let nd = c.node_desc.ld_acq(g);
            let dead = c.next.ld_acq(g).tag() & LinkFlag::MARK.d() != 0;
            if !dead
                && nd.tag() == 0
                && is_key_present(unsafe {
                    // UNSAFE(@theo): as in contains()
                    nd.deref()
                })
            {
                out.push(c.key);
            }
            curr = c.next.ld_acq(g).with_tag(0);
        }
    }

    #[inline(always)]
    fn head_ref<'g>(&'g self, _: &'g Guard) -> Shared<'g, Node> {
        Shared::from(&*self.head as *const Node)
    }

    /*
        traversal
        ---
        Walk until the first node whose key is not strictly less than the
        search key, snipping runs of unlink-pending nodes out of the chain on
        the way. A failed snip means the predecessor moved under us; restart
        from the head.
    */
    fn locate_pred<'g>(
        &'g self,
        key: u32,
        mut curr: Shared<'g, Node>,
        g: &'g Guard,
    ) -> (Shared<'g, Node>, Shared<'g, Node>) {
        let mut pred = curr;
        loop {
            let c = unsafe {
                // UNSAFE(@theo): traversal only ever holds arena/sentinel nodes
                curr.deref()
            };
            if c.key >= key {
                break;
            }
            pred = curr;
            let pred_next = c.next.ld_acq(g).with_tag(0);
            curr = pred_next;
            loop {
                // a marked `next` means the node holding it is dead
                let succ = unsafe { curr.deref() }.next.ld_acq(g);
                if succ.tag() & LinkFlag::MARK.d() == 0 {
                    break;
                }
                curr = succ.with_tag(0);
            }
            if curr != pred_next {
                // swing the predecessor over the dead run
                if c.next.cx_rel(pred_next, curr, g).is_err() {
                    curr = self.head_ref(g);
                }
            }
        }
        (pred, curr)
    }

    /// Help whatever in-flight transaction owns this annotation to
    /// resolution. Nodes touched by our own descriptor need no help: the ops
    /// before `opid` have by definition already run.
    fn finish_pending_txn(
        &self,
        nd: Shared<'_, NodeDesc>,
        desc: &TxnDesc,
        s: &ListCtx<'_>,
        g: &Guard,
    ) {
        let nd = unsafe {
            // UNSAFE(@theo): caller checked the mark bit; annotation records
            // are immortal within the container
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
        s: &ListCtx<'_>,
        g: &'g Guard,
    ) -> (OpOutcome, Option<ListTarget>) {
        debug_assert!(key > KEY_MIN && key < KEY_MAX, "list,keydomain");
        let nd = s.tx.ndesc.alloc(NodeDesc::new(desc, opid));
        let nd = Shared::from(nd.as_ptr() as *const NodeDesc);
        let mut new_node: Option<NonNull<Node>> = None;
        let mut curr = self.head_ref(g);
        loop {
            let (pred, found) = self.locate_pred(key, curr, g);
            let c = unsafe { found.deref() };
            if c.key == key {
                let old_nd = c.node_desc.ld_acq(g);
                if old_nd.tag() & DescFlag::MARK.d() != 0 {
                    // the node is dying; make sure its link mark is up and
                    // retraverse so it gets snipped
                    if c.next.ld_acq(g).tag() & LinkFlag::MARK.d() == 0 {
                        c.next.or_tag(LinkFlag::MARK.d(), g);
                    }
                    curr = self.head_ref(g);
                    continue;
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
                if c.node_desc.cx_rel(old_nd, nd, g).is_ok() {
                    return (
                        OpOutcome::Ok,
                        Some(ListTarget {
                            node: found.as_raw(),
                            pred: pred.as_raw(),
                        }),
                    );
                }
                curr = found;
            } else {
                if !desc.is_active() {
                    return (OpOutcome::Fail, None);
                }
                let nn = *new_node.get_or_insert_with(|| {
                    s.node.alloc(Node {
                        key,
                        next: Atomic::null(),
                        node_desc: Atomic::from(nd),
                    })
                });
                let nn_ref = unsafe {
                    // UNSAFE(@theo): freshly bumped, unpublished
                    nn.as_ref()
                };
                nn_ref.next.st_rlx(found);
                match unsafe { pred.deref() }
                    .next
                    .cx_rel(found, Shared::from(nn.as_ptr() as *const Node), g)
                {
                    Ok(_) => {
                        return (
                            OpOutcome::Ok,
                            Some(ListTarget {
                                node: nn.as_ptr(),
                                pred: pred.as_raw(),
                            }),
                        )
                    }
                    Err(e) => {
                        curr = if e.current.tag() & LinkFlag::MARK.d() != 0 {
                            self.head_ref(g)
                        } else {
                            pred
                        };
                    }
                }
            }
        }
    }

    fn tx_delete<'g>(
        &'g self,
        key: u32,
        desc: &TxnDesc,
        opid: u8,
        s: &ListCtx<'_>,
        g: &'g Guard,
    ) -> (OpOutcome, Option<ListTarget>) {
        debug_assert!(key > KEY_MIN && key < KEY_MAX, "list,keydomain");
        let nd = s.tx.ndesc.alloc(NodeDesc::new(desc, opid));
        let nd = Shared::from(nd.as_ptr() as *const NodeDesc);
        let mut curr = self.head_ref(g);
        loop {
            let (pred, found) = self.locate_pred(key, curr, g);
            let c = unsafe { found.deref() };
            if c.key != key {
                return (OpOutcome::Fail, None);
            }
            let old_nd = c.node_desc.ld_acq(g);
            if old_nd.tag() & DescFlag::MARK.d() != 0 {
                // already marked dead by somebody's committed delete
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
            if c.node_desc.cx_rel(old_nd, nd, g).is_ok() {
                return (
                    OpOutcome::Ok,
                    Some(ListTarget {
                        node: found.as_raw(),
                        pred: pred.as_raw(),
                    }),
                );
            }
            curr = found;
        }
    }

    fn tx_find<'g>(
        &'g self,
        key: u32,
        desc: &TxnDesc,
        opid: u8,
        s: &ListCtx<'_>,
        g: &'g Guard,
    ) -> OpOutcome {
        debug_assert!(key > KEY_MIN && key < KEY_MAX, "list,keydomain");
        let mut nd: Option<NonNull<NodeDesc>> = None;
        let mut curr = self.head_ref(g);
        loop {
            let (_, found) = self.locate_pred(key, curr, g);
            let c = unsafe { found.deref() };
            if c.key != key {
                return OpOutcome::Fail;
            }
            let old_nd = c.node_desc.ld_acq(g);
            if old_nd.tag() & DescFlag::MARK.d() != 0 {
                if c.next.ld_acq(g).tag() & LinkFlag::MARK.d() == 0 {
                    c.next.or_tag(LinkFlag::MARK.d(), g);
                }
                curr = self.head_ref(g);
                continue;
            }
            self.finish_pending_txn(old_nd, desc, s, g);
            let old = unsafe { old_nd.deref() };
            if is_same_op(old, desc, opid) {
                return OpOutcome::Skip;
            }
            if !is_key_present(old) {
                return OpOutcome::Fail;
            }
            if !desc.is_active() {
                return OpOutcome::Fail;
            }
            // a find is not a pure read: it publishes its witness so that
            // later writers of this node help us before overtaking
            let ndp = *nd.get_or_insert_with(|| s.tx.ndesc.alloc(NodeDesc::new(desc, opid)));
            if c.node_desc
                .cx_rel(old_nd, Shared::from(ndp.as_ptr() as *const NodeDesc), g)
                .is_ok()
            {
                return OpOutcome::Ok;
            }
            curr = found;
        }
    }
}

impl<'c> TxnStore<ListCtx<'c>> for TransList {
    type Target = ListTarget;
    fn help_stack<'a>(&self, s: &'a ListCtx<'c>) -> &'a HelpStack {
        &s.tx.help
    }
    fn metric<'a>(&self, s: &'a ListCtx<'c>) -> &'a MetricSlot {
        s.tx.metric
    }
    fn tx_run(
        &self,
        op: &TxnOp,
        desc: &TxnDesc,
        opid: u8,
        s: &ListCtx<'c>,
        g: &Guard,
    ) -> (OpOutcome, Option<ListTarget>) {
        match op.kind {
            OpKind::Insert => self.tx_insert(op.key, desc, opid, s, g),
            OpKind::Delete => self.tx_delete(op.key, desc, opid, s, g),
            OpKind::Find => (self.tx_find(op.key, desc, opid, s, g), None),
            // not a list operation
            OpKind::Update => (OpOutcome::Fail, None),
        }
    }
    fn tx_mark(&self, t: ListTarget, desc: &TxnDesc, _s: &ListCtx<'c>, g: &Guard) {
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
        // only kill nodes this transaction still owns AND that its final
        // verdict leaves logically absent: a later same-transaction insert
        // can have re-claimed a node an earlier delete targeted, in which
        // case the committed node lives. On abort, everything this
        // transaction inserted dies unconditionally.
        let kill = ptr::eq(ndr.desc, desc) && (desc.is_aborted() || !is_key_present(ndr));
        if kill
            && n.node_desc
                .cx_rel(nd, nd.with_tag(DescFlag::MARK.d()), g)
                .is_ok()
        {
            // link-level death mark, then a best-effort snip; traversals
            // finish the job if the predecessor moved
            let succ = n.next.or_tag(LinkFlag::MARK.d(), g).with_tag(0);
            let _ = unsafe { &*t.pred }
                .next
                .cx_rel(Shared::from(t.node), succ, g);
        }
    }
}
