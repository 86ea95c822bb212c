/*
 * Created on Sat Jun 08 2024
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

pub mod meta;
#[cfg(test)]
mod tests;

/*
    transactional hash map
    ---
    A spine-structured table: a top array of 2^main_pow slots, each of which
    is either empty, a data node, or (tagged) a 64-wide sub-spine indexing the
    next six hash bits, recursively. Because the hash is a bijection on u32,
    two colliding slot paths always diverge within the key width, so the walk
    needs no key comparison beyond the hash itself.

    Slots evolve one way only: empty → data, data → sub-spine (when a second
    hash arrives, or when the forced-expansion mark says a slot is too hot),
    data → empty (physical delete). The transactional annotation protocol is
    the same one the ordered containers run, on the data node's node_desc
    word; additionally map nodes carry a value, whose logical reading is
    resolved through the annotation (the value log) so that one CAS publishes
    claim and value together.
*/

use self::meta::{hf, MapConfig, SlotFlag, SUB_POW, SUB_SIZE};
use crate::{
    mem::{Arena, ArenaSlab, CachePadded},
    sync::{
        atm::{cpin, ensure_flag_align, Atomic, Guard, Shared, ORD_RLX, ORD_SEQ},
        Backoff,
    },
    txn::{
        exec::{self, HelpStack, OpOutcome, TxnStore},
        is_key_present, is_same_op,
        metrics::{MetricSlot, MetricsReport, TxnMetrics},
        resolved_value, DescFlag, DescPool, DescRef, NodeDesc, OpKind, Registry, TxnConfig,
        TxnCtx, TxnDesc, TxnOp,
    },
};
use core::{
    cell::{Cell, RefCell},
    marker::PhantomData,
    ptr::{self, NonNull},
    sync::atomic::AtomicU32,
};

pub use self::meta::DefConfig;

/// Watch-slot value meaning "not operating on any hash"
const WATCH_IDLE: u32 = 0;

pub(crate) struct MapNode {
    /// Atomic because physically-deleted nodes may be recycled while stale
    /// traversals still hold them (they re-check through the slot CAS)
    hash: AtomicU32,
    key: AtomicU32,
    node_desc: Atomic<NodeDesc>,
}

const _: () = ensure_flag_align::<MapNode>(SlotFlag::bits());

pub(crate) struct MapSpine {
    slot: [Atomic<MapNode>; SUB_SIZE],
}

const _: () = ensure_flag_align::<MapSpine>(SlotFlag::bits());

impl MapSpine {
    const NULL: Atomic<MapNode> = Atomic::null();
    const NULL_SLOTS: [Atomic<MapNode>; SUB_SIZE] = [Self::NULL; SUB_SIZE];
    fn empty() -> Self {
        Self {
            slot: Self::NULL_SLOTS,
        }
    }
}

#[inline(always)]
fn read_spine<'g>(n: Shared<'g, MapNode>) -> &'g MapSpine {
    debug_assert!(hf(n.tag(), SlotFlag::SPINE));
    unsafe {
        // UNSAFE(@theo): flagck; spine pointers are arena-backed
        &*(n.with_tag(0).as_raw() as *const MapSpine)
    }
}

#[inline(always)]
fn spine_shared<'g>(s: NonNull<MapSpine>) -> Shared<'g, MapNode> {
    Shared::from(s.as_ptr() as *const MapNode).with_tag(SlotFlag::SPINE.d())
}

#[inline(always)]
fn node_shared<'g>(n: NonNull<MapNode>) -> Shared<'g, MapNode> {
    Shared::from(n.as_ptr() as *const MapNode)
}

/// The slot and node claimed by one effective insert or delete
#[derive(Clone, Copy)]
pub(crate) struct MapTarget {
    slot: *const Atomic<MapNode>,
    node: *const MapNode,
}

/// Outcome of one claim attempt on an existing data node
enum Claim {
    Done(OpOutcome),
    /// The node carries the delete-authority mark; physically remove it first
    Dying,
    /// Lost the annotation CAS; re-read and try again
    Retry,
}

/// Per-thread session for a [`TransMap`]; obtain via
/// [`TransMap::register_thread`]
pub struct MapCtx<'c> {
    tx: TxnCtx<'c>,
    node: ArenaSlab<'c, MapNode>,
    spine: ArenaSlab<'c, MapSpine>,
    /// Recycled data nodes (publish-failed or physically deleted); reuse is
    /// gated on the watch list
    pool: RefCell<Vec<NonNull<MapNode>>>,
    /// One pre-built sub-spine kept around so expansion races don't burn
    /// arena space on every retry
    reserve: Cell<Option<NonNull<MapSpine>>>,
    watch: &'c AtomicU32,
}

/// A lock-free hash map (u32 → u32) executing descriptor batches atomically.
/// Key 0 is reserved. Geometry and hashing come from the [`MapConfig`]
/// parameter.
pub struct TransMap<C: MapConfig = DefConfig> {
    head: Box<[Atomic<MapNode>]>,
    main_pow: u32,
    desc_pool: DescPool,
    ndesc_pool: Arena<NodeDesc>,
    node_pool: Arena<MapNode>,
    spine_pool: Arena<MapSpine>,
    /// One slot per thread naming the hash it is currently operating on;
    /// recycled nodes may only be reused when nobody watches their hash
    watch: Box<[CachePadded<AtomicU32>]>,
    registry: Registry,
    metrics: TxnMetrics,
    _m: PhantomData<C>,
}

impl<C: MapConfig> TransMap<C> {
    /// `main_pow`: log2 of the top spine width
    pub fn new(cfg: TxnConfig, main_pow: u32) -> Self {
        assert!(main_pow >= 1 && main_pow <= 26, "map,mainpow");
        Self {
            head: (0..1usize << main_pow).map(|_| Atomic::null()).collect(),
            main_pow,
            desc_pool: DescPool::new(cfg.max_ops, cfg.desc_cap, cfg.threads),
            ndesc_pool: Arena::new(cfg.ndesc_cap, cfg.threads),
            node_pool: Arena::new(cfg.node_cap, cfg.threads),
            spine_pool: Arena::new(cfg.spine_cap, cfg.threads),
            watch: (0..cfg.threads)
                .map(|_| CachePadded::new(AtomicU32::new(WATCH_IDLE)))
                .collect(),
            registry: Registry::new(cfg.threads),
            metrics: TxnMetrics::new(cfg.threads),
            _m: PhantomData,
        }
    }

    /// Claim a thread slot. Call once per worker thread, on that thread.
    pub fn register_thread(&self) -> MapCtx<'_> {
        let tid = self.registry.ticket();
        MapCtx {
            tx: TxnCtx {
                desc: self.desc_pool.slab(tid),
                ndesc: self.ndesc_pool.slab(tid),
                help: HelpStack::new(),
                metric: self.metrics.slot(tid),
            },
            node: self.node_pool.slab(tid),
            spine: self.spine_pool.slab(tid),
            pool: RefCell::new(Vec::new()),
            reserve: Cell::new(None),
            watch: &self.watch[tid],
        }
    }

    /// Build a transaction descriptor from `ops` (all four kinds allowed)
    pub fn allocate_desc<'c>(&'c self, s: &MapCtx<'c>, ops: &[TxnOp]) -> DescRef<'c> {
        DescRef::new(s.tx.desc.alloc(ops))
    }

    /// Atomically apply the whole batch; true iff it committed
    pub fn execute_ops(&self, desc: DescRef<'_>, s: &MapCtx<'_>) -> bool {
        let g = cpin();
        exec::execute_ops(self, desc.get(), s, &g)
    }

    /// Fold the per-thread outcome counters
    pub fn metrics(&self) -> MetricsReport {
        self.metrics.fold()
    }

    /// Read-only lookup resolving the logical value (quiescent diagnostic)
    pub fn get(&self, key: u32) -> Option<u32> {
        let g = cpin();
        let g = &g;
        let hash = C::hash_key(key);
        let mut local: &[Atomic<MapNode>] = &self.head;
        let mut right = 0u32;
        let mut bits = self.main_pow;
        loop {
            let pos = ((hash >> right) & ((1u32 << bits) - 1)) as usize;
            let node = local[pos].ld_acq(g);
            if node.is_null() {
                return None;
            }
            if hf(node.tag(), SlotFlag::SPINE) {
                local = &read_spine(node).slot;
                right += bits;
                bits = SUB_POW;
                continue;
            }
            // data node, possibly carrying the expansion mark
            let dn = unsafe {
                // UNSAFE(@theo): non-spine, non-null ⇒ data node
                node.with_tag(0).deref()
            };
            if dn.hash.load(ORD_RLX) != hash {
                return None;
            }
            let nd = dn.node_desc.ld_acq(g);
            if nd.tag() != 0 {
                return None;
            }
            let nd = unsafe {
                // UNSAFE(@theo): unmarked annotations are never null
                nd.deref()
            };
            return is_key_present(nd).then(|| resolved_value(nd));
        }
    }

    fn hash_watched(&self, hash: u32) -> bool {
        self.watch.iter().any(|w| w.load(ORD_SEQ) == hash)
    }

    /// Allocate (or recycle) a data node, unpublished
    fn alloc_node(
        &self,
        s: &MapCtx<'_>,
        hash: u32,
        key: u32,
        nd: Shared<'_, NodeDesc>,
    ) -> NonNull<MapNode> {
        if let Some(n) = s.pool.borrow_mut().pop() {
            let old_hash = unsafe {
                // UNSAFE(@theo): pooled nodes are arena-backed
                n.as_ref()
            }
            .hash
            .load(ORD_RLX);
            if !self.hash_watched(old_hash) {
                let r = unsafe { n.as_ref() };
                r.hash.store(hash, ORD_RLX);
                r.key.store(key, ORD_RLX);
                r.node_desc.st_rlx(nd);
                return n;
            }
            // someone may still be looking at it; put it back for later
            s.pool.borrow_mut().push(n);
        }
        s.node.alloc(MapNode {
            hash: AtomicU32::new(hash),
            key: AtomicU32::new(key),
            node_desc: Atomic::from(nd),
        })
    }

    fn alloc_spine(&self, s: &MapCtx<'_>) -> NonNull<MapSpine> {
        match s.reserve.take() {
            Some(sp) => sp,
            None => s.spine.alloc(MapSpine::empty()),
        }
    }

    /// Return a spine whose publish CAS lost; slots are re-nulled so the next
    /// expansion can use it as-is
    fn recycle_spine(&self, s: &MapCtx<'_>, sp: NonNull<MapSpine>) {
        let spine = unsafe {
            // UNSAFE(@theo): never published, still exclusively ours
            sp.as_ref()
        };
        for slot in spine.slot.iter() {
            slot.st_rlx(Shared::null());
        }
        s.reserve.set(Some(sp));
    }

    /// The claim protocol on an existing data node (the map's rendition of
    /// the ordered containers' annotation CAS). `want_present` is the
    /// operation's precondition polarity: false for insert, true for the
    /// rest.
    fn claim<'g>(
        &'g self,
        dn: &'g MapNode,
        desc: &TxnDesc,
        opid: u8,
        want_present: bool,
        s: &MapCtx<'_>,
        g: &'g Guard,
    ) -> Claim {
        let old_nd = dn.node_desc.ld_acq(g);
        if old_nd.tag() & DescFlag::MARK.d() != 0 {
            return Claim::Dying;
        }
        self.finish_pending_txn(old_nd, desc, s, g);
        let old = unsafe {
            // UNSAFE(@theo): unmarked ⇒ non-null
            old_nd.deref()
        };
        if is_same_op(old, desc, opid) {
            return Claim::Done(OpOutcome::Skip);
        }
        if is_key_present(old) != want_present {
            return Claim::Done(OpOutcome::Fail);
        }
        if !desc.is_active() {
            return Claim::Done(OpOutcome::Fail);
        }
        // log the pre-claim resolved value so the new annotation alone can
        // answer reads no matter how this transaction ends
        let base = resolved_value(old);
        let nd = s.tx.ndesc.alloc(NodeDesc::with_value(desc, opid, base));
        if dn
            .node_desc
            .cx_rel(old_nd, Shared::from(nd.as_ptr() as *const NodeDesc), g)
            .is_ok()
        {
            Claim::Done(OpOutcome::Ok)
        } else {
            Claim::Retry
        }
    }

    fn finish_pending_txn(
        &self,
        nd: Shared<'_, NodeDesc>,
        desc: &TxnDesc,
        s: &MapCtx<'_>,
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

    /// Build and publish a sub-spine replacing `expect` in `slotw`. `n1` (the
    /// current occupant) is re-homed at its slice position; `n2`, when
    /// present, is a new node published by the same CAS (the insert-collision
    /// path). `next_right` is the bit offset the new spine discriminates on.
    fn expand<'g>(
        &'g self,
        slotw: &Atomic<MapNode>,
        expect: Shared<'g, MapNode>,
        n2: Option<NonNull<MapNode>>,
        next_right: u32,
        s: &MapCtx<'_>,
        g: &'g Guard,
    ) -> bool {
        let n1 = expect.with_tag(0);
        let h1 = unsafe {
            // UNSAFE(@theo): occupant is a data node
            n1.deref()
        }
        .hash
        .load(ORD_RLX);
        let head = self.alloc_spine(s);
        let mut cur = head;
        let mut r = next_right;
        loop {
            let p1 = ((h1 >> r) & (SUB_SIZE as u32 - 1)) as usize;
            match n2 {
                Some(nn) => {
                    let h2 = unsafe { nn.as_ref() }.hash.load(ORD_RLX);
                    let p2 = ((h2 >> r) & (SUB_SIZE as u32 - 1)) as usize;
                    if p1 != p2 {
                        let c = unsafe { cur.as_ref() };
                        c.slot[p1].st_rlx(n1);
                        c.slot[p2].st_rlx(node_shared(nn));
                        break;
                    }
                    // both keys collide on this slice too: chain deeper (the
                    // bijective hash bounds this within the key width)
                    debug_assert!(r < u32::BITS, "map,divergence");
                    let nxt = self.alloc_spine(s);
                    unsafe { cur.as_ref() }.slot[p1].st_rlx(spine_shared(nxt));
                    cur = nxt;
                    r += SUB_POW;
                }
                None => {
                    unsafe { cur.as_ref() }.slot[p1].st_rlx(n1);
                    break;
                }
            }
        }
        match slotw.cx_rel(expect, spine_shared(head), g) {
            Ok(_) => {
                log::trace!("map: expanded slot at bit offset {next_right}");
                true
            }
            Err(_) => {
                // chain interiors are abandoned to the arena; the head is
                // worth keeping
                self.recycle_spine(s, head);
                false
            }
        }
    }

    /// Put the forced-expansion mark on a slot that keeps losing CAS races
    fn force_expand(&self, slotw: &Atomic<MapNode>, g: &Guard) {
        let n = slotw.ld_acq(g);
        if !n.is_null() && n.tag() == 0 {
            let _ = slotw.cx_rel(n, n.with_tag(SlotFlag::EXPAND.d()), g);
        }
    }

    /// One traversal serving all four operation kinds; they differ only at
    /// the leaves (what an empty slot or a foreign occupant means, and the
    /// claim polarity).
    fn tx_op<'g>(
        &'g self,
        kind: OpKind,
        key: u32,
        value: u32,
        desc: &TxnDesc,
        opid: u8,
        s: &MapCtx<'_>,
        g: &'g Guard,
    ) -> (OpOutcome, Option<MapTarget>) {
        debug_assert!(key != 0, "map,keyzero");
        let hash = C::hash_key(key);
        let backoff = Backoff::new();
        let mut fail = 0usize;
        let mut new_node: Option<NonNull<MapNode>> = None;
        let mut local: &[Atomic<MapNode>] = &self.head;
        let mut right = 0u32;
        let mut bits = self.main_pow;
        loop {
            let pos = ((hash >> right) & ((1u32 << bits) - 1)) as usize;
            let slotw = &local[pos];
            let node = slotw.ld_acq(g);
            let tag = node.tag();
            if node.is_null() {
                if kind != OpKind::Insert {
                    return (OpOutcome::Fail, None);
                }
                if !desc.is_active() {
                    self.unpublish(s, new_node);
                    return (OpOutcome::Fail, None);
                }
                let nn = *new_node.get_or_insert_with(|| {
                    let nd = s
                        .tx
                        .ndesc
                        .alloc(NodeDesc::with_value(desc, opid, value));
                    self.alloc_node(s, hash, key, Shared::from(nd.as_ptr() as *const NodeDesc))
                });
                match slotw.cx_rel(node, node_shared(nn), g) {
                    Ok(_) => {
                        return (
                            OpOutcome::Ok,
                            Some(MapTarget {
                                slot: slotw as *const Atomic<MapNode>,
                                node: nn.as_ptr(),
                            }),
                        )
                    }
                    Err(_) => {
                        fail += 1;
                        if fail > C::MAX_CAS_FAILURE {
                            self.force_expand(slotw, g);
                            fail = 0;
                        }
                        backoff.snooze();
                        continue;
                    }
                }
            } else if hf(tag, SlotFlag::SPINE) {
                local = &read_spine(node).slot;
                right += bits;
                bits = SUB_POW;
            } else if hf(tag, SlotFlag::EXPAND) {
                // cooperate: the slot must become a spine before anything
                // else proceeds
                self.expand(slotw, node, None, right + bits, s, g);
            } else {
                let dn = unsafe {
                    // UNSAFE(@theo): untagged non-null ⇒ data node
                    node.deref()
                };
                if dn.hash.load(ORD_RLX) == hash {
                    match self.claim(dn, desc, opid, kind != OpKind::Insert, s, g) {
                        Claim::Done(outcome) => {
                            // a claimed insert re-used this node; release the
                            // unpublished spare, if any
                            self.unpublish(s, new_node);
                            let target = (outcome == OpOutcome::Ok
                                && matches!(kind, OpKind::Insert | OpKind::Delete))
                            .then_some(MapTarget {
                                slot: slotw as *const Atomic<MapNode>,
                                node: node.as_raw(),
                            });
                            return (outcome, target);
                        }
                        Claim::Dying => {
                            // finish the physical delete, then re-evaluate
                            let _ = slotw.cx_rel(node, Shared::null(), g);
                            if kind != OpKind::Insert {
                                self.unpublish(s, new_node);
                                return (OpOutcome::Fail, None);
                            }
                        }
                        Claim::Retry => {}
                    }
                } else {
                    // a different key owns the slot prefix
                    if kind != OpKind::Insert {
                        return (OpOutcome::Fail, None);
                    }
                    if !desc.is_active() {
                        self.unpublish(s, new_node);
                        return (OpOutcome::Fail, None);
                    }
                    let nn = *new_node.get_or_insert_with(|| {
                        let nd = s
                            .tx
                            .ndesc
                            .alloc(NodeDesc::with_value(desc, opid, value));
                        self.alloc_node(s, hash, key, Shared::from(nd.as_ptr() as *const NodeDesc))
                    });
                    if self.expand(slotw, node, Some(nn), right + bits, s, g) {
                        // the publishing CAS put nn into the new spine; find
                        // its slot for the cleanup record
                        return (
                            OpOutcome::Ok,
                            Some(MapTarget {
                                slot: self.slot_of(hash, g),
                                node: nn.as_ptr(),
                            }),
                        );
                    }
                    fail += 1;
                    if fail > C::MAX_CAS_FAILURE {
                        self.force_expand(slotw, g);
                        fail = 0;
                    }
                    backoff.snooze();
                }
            }
        }
    }

    /// Drop a node that was allocated for this operation but never published
    fn unpublish(&self, s: &MapCtx<'_>, n: Option<NonNull<MapNode>>) {
        if let Some(n) = n {
            s.pool.borrow_mut().push(n);
        }
    }

    /// Walk to the slot currently responsible for `hash` (used to record
    /// where an expansion-published node ended up)
    fn slot_of<'g>(&'g self, hash: u32, g: &'g Guard) -> *const Atomic<MapNode> {
        let mut local: &[Atomic<MapNode>] = &self.head;
        let mut right = 0u32;
        let mut bits = self.main_pow;
        loop {
            let pos = ((hash >> right) & ((1u32 << bits) - 1)) as usize;
            let slotw = &local[pos];
            let node = slotw.ld_acq(g);
            if !node.is_null() && hf(node.tag(), SlotFlag::SPINE) {
                local = &read_spine(node).slot;
                right += bits;
                bits = SUB_POW;
                continue;
            }
            return slotw as *const Atomic<MapNode>;
        }
    }
}

impl<'c, C: MapConfig> TxnStore<MapCtx<'c>> for TransMap<C> {
    type Target = MapTarget;
    fn help_stack<'a>(&self, s: &'a MapCtx<'c>) -> &'a HelpStack {
        &s.tx.help
    }
    fn metric<'a>(&self, s: &'a MapCtx<'c>) -> &'a MetricSlot {
        s.tx.metric
    }
    fn tx_run(
        &self,
        op: &TxnOp,
        desc: &TxnDesc,
        opid: u8,
        s: &MapCtx<'c>,
        g: &Guard,
    ) -> (OpOutcome, Option<MapTarget>) {
        // publish the hash under operation so recycling stays clear of it.
        // Saved and restored, not cleared: helping recurses through here with
        // the outer operation still in flight.
        let prev = s.watch.load(ORD_RLX);
        s.watch.store(C::hash_key(op.key), ORD_SEQ);
        let r = self.tx_op(op.kind, op.key, op.value, desc, opid, s, g);
        s.watch.store(prev, ORD_SEQ);
        r
    }
    fn tx_mark(&self, t: MapTarget, desc: &TxnDesc, s: &MapCtx<'c>, g: &Guard) {
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
            // physical delete: clear the slot if it still holds the node
            // directly (expansion may have re-homed it; traversals handle
            // those through the dying-node path)
            let slot = unsafe {
                // UNSAFE(@theo): slots live in the top spine or arena spines
                &*t.slot
            };
            if slot
                .cx_rel(Shared::from(t.node), Shared::null(), g)
                .is_ok()
            {
                self.unpublish(
                    s,
                    NonNull::new(t.node as *mut MapNode),
                );
            }
        }
    }
}
