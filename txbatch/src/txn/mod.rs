/*
 * Created on Sat Mar 23 2024
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

//! The transaction descriptor model shared by every container.
//!
//! A [`TxnDesc`] is the unit of atomicity: a status word plus an inline run of
//! operations. It is built once by its owning thread and from then on only its
//! status ever changes, by exactly one successful CAS (active to committed, or
//! active to aborted). Containers annotate each node they own with a
//! [`NodeDesc`] naming the descriptor and operation that last touched it; the
//! node's *logical* membership is a pure function of that annotation and the
//! named descriptor's status, which is what makes the status CAS the
//! linearization point of the whole batch.

pub(crate) mod exec;
pub mod metrics;
#[cfg(test)]
mod tests;

use crate::{
    mem::{RawArena, RawSlab},
    sync::atm::{ensure_flag_align, ORD_ACQ, ORD_RLX, ORD_SEQ},
};
use core::{mem, ptr, ptr::NonNull, slice, sync::atomic::AtomicU8};

/// Reserved sentinel key: head of the ordered containers
pub const KEY_MIN: u32 = 0;
/// Reserved sentinel key: tail of the ordered containers
pub const KEY_MAX: u32 = u32::MAX;

/// Transaction status. Monotone: `Active` transitions at most once.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnStatus {
    Active = 0,
    Committed = 1,
    Aborted = 2,
}

/// Primitive operation selector. `Update` is honored by the map only; the set
/// containers fail it (and hence abort the enclosing transaction).
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Find = 0,
    Insert = 1,
    Delete = 2,
    Update = 3,
}

/// One primitive operation of a transaction. `value` is meaningful for map
/// insert/update and ignored everywhere else.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxnOp {
    pub kind: OpKind,
    pub key: u32,
    pub value: u32,
}

impl TxnOp {
    pub const fn find(key: u32) -> Self {
        Self {
            kind: OpKind::Find,
            key,
            value: 0,
        }
    }
    pub const fn insert(key: u32) -> Self {
        Self::insert_kv(key, 0)
    }
    pub const fn insert_kv(key: u32, value: u32) -> Self {
        Self {
            kind: OpKind::Insert,
            key,
            value,
        }
    }
    pub const fn delete(key: u32) -> Self {
        Self {
            kind: OpKind::Delete,
            key,
            value: 0,
        }
    }
    pub const fn update(key: u32, value: u32) -> Self {
        Self {
            kind: OpKind::Update,
            key,
            value,
        }
    }
}

/*
    descriptor record
    ---
    Header plus inline operations, exactly as the record is laid out in the
    descriptor arena: the ops start right after the (4-byte, 4-aligned) header
    in the same bump allocation. Writable exactly once (construction), except
    for the status byte.
*/

#[repr(C, align(4))]
pub struct TxnDesc {
    status: AtomicU8,
    size: u8,
}

impl TxnDesc {
    #[inline(always)]
    pub fn status(&self) -> TxnStatus {
        match self.status.load(ORD_ACQ) {
            0 => TxnStatus::Active,
            1 => TxnStatus::Committed,
            2 => TxnStatus::Aborted,
            _ => unreachable!("desc,badstatus"),
        }
    }
    #[inline(always)]
    pub fn is_active(&self) -> bool {
        self.status() == TxnStatus::Active
    }
    #[inline(always)]
    pub fn is_aborted(&self) -> bool {
        self.status() == TxnStatus::Aborted
    }
    /// Attempt the commit transition. The sequentially-consistent CAS is the
    /// transaction's linearization point; it must order every preceding node
    /// claim before the status becomes visible.
    pub(crate) fn try_commit(&self) -> bool {
        self.status
            .compare_exchange(
                TxnStatus::Active as u8,
                TxnStatus::Committed as u8,
                ORD_SEQ,
                ORD_RLX,
            )
            .is_ok()
    }
    /// Attempt the abort transition (same contract as [`Self::try_commit`])
    pub(crate) fn try_abort(&self) -> bool {
        self.status
            .compare_exchange(
                TxnStatus::Active as u8,
                TxnStatus::Aborted as u8,
                ORD_SEQ,
                ORD_RLX,
            )
            .is_ok()
    }
    #[inline(always)]
    pub fn size(&self) -> u8 {
        self.size
    }
    #[inline(always)]
    pub fn ops(&self) -> &[TxnOp] {
        unsafe {
            // UNSAFE(@theo): every descriptor is constructed by DescSlab with
            // `size` ops written directly after the header
            slice::from_raw_parts(
                (self as *const Self).add(1).cast::<TxnOp>(),
                self.size as usize,
            )
        }
    }
}

/// A handle to an arena-resident descriptor. Copyable; valid for as long as
/// the container that allocated it.
#[derive(Clone, Copy)]
pub struct DescRef<'a> {
    d: &'a TxnDesc,
}

impl<'a> DescRef<'a> {
    pub(crate) fn new(d: NonNull<TxnDesc>) -> Self {
        Self {
            d: unsafe {
                // UNSAFE(@theo): arena memory, container-bound lifetime
                d.as_ref()
            },
        }
    }
    #[inline(always)]
    pub(crate) fn get(&self) -> &'a TxnDesc {
        self.d
    }
    pub fn status(&self) -> TxnStatus {
        self.d.status()
    }
}

flags! {
    /// Tag bits carried by a node's annotation pointer. A marked annotation is
    /// the node's death warrant: the node is logically absent, no further
    /// transitions are admitted, and it is awaiting physical unlink.
    pub(crate) struct DescFlag: usize {
        MARK = 0b01,
    }
}

flags! {
    /// Tag bits carried by container link pointers (`next` in the ordered
    /// containers). Marking a node's outgoing link freezes it and schedules
    /// the node for physical unlink by a later traversal. Distinct from
    /// [`DescFlag`]: one is link-level, the other annotation-level.
    pub(crate) struct LinkFlag: usize {
        MARK = 0b01,
    }
}

/*
    node annotation
    ---
    `(desc, opid)` names the operation that most recently changed (or, for
    finds, witnessed) the node's logical membership. `value` is the value log:
    the node's resolved logical value captured at claim time, which is what a
    reader falls back to whenever the named operation does not itself supply
    one (non-committed writes, finds, deletes that aborted). Allocated fresh
    for every claim attempt and never reused, so an annotation pointer never
    ABAs.
*/
pub(crate) struct NodeDesc {
    pub desc: *const TxnDesc,
    pub opid: u8,
    pub value: u32,
}

const _: () = ensure_flag_align::<NodeDesc>(DescFlag::bits());

// safety: written in full before its pointer is published by CAS; read-only
// after; the descriptor it names is arena-bound like the annotation itself
unsafe impl Send for NodeDesc {}
unsafe impl Sync for NodeDesc {}

impl NodeDesc {
    pub fn new(desc: &TxnDesc, opid: u8) -> Self {
        Self::with_value(desc, opid, 0)
    }
    pub fn with_value(desc: &TxnDesc, opid: u8, value: u32) -> Self {
        Self {
            desc: desc as *const TxnDesc,
            opid,
            value,
        }
    }
    #[inline(always)]
    pub fn desc(&self) -> &TxnDesc {
        unsafe {
            // UNSAFE(@theo): arena-bound, outlives every observer
            &*self.desc
        }
    }
    #[inline(always)]
    pub fn op(&self) -> TxnOp {
        self.desc().ops()[self.opid as usize]
    }
}

#[inline(always)]
pub(crate) fn is_same_op(nd: &NodeDesc, desc: &TxnDesc, opid: u8) -> bool {
    ptr::eq(nd.desc, desc) && nd.opid == opid
}

/// The logical membership function. For a resolved descriptor this is the
/// status table (committed insert ⇒ present, committed delete ⇒ absent, and
/// the mirror images when aborted; finds and updates never change
/// membership). An `Active` status can only be observed here for the caller's
/// *own* descriptor (foreign in-flight descriptors are helped to resolution
/// before this question is asked), so it reads as "what will hold once the
/// prefix up to this operation has executed".
pub(crate) fn is_key_present(nd: &NodeDesc) -> bool {
    let status = nd.desc().status();
    match nd.op().kind {
        OpKind::Find | OpKind::Update => true,
        OpKind::Insert => status != TxnStatus::Aborted,
        OpKind::Delete => status == TxnStatus::Aborted,
    }
}

/// The logical value function (map): a non-aborted insert or update supplies
/// the operation's own value; everything else falls back to the value log.
/// Only meaningful when [`is_key_present`] holds.
pub(crate) fn resolved_value(nd: &NodeDesc) -> u32 {
    let op = nd.op();
    match op.kind {
        OpKind::Insert | OpKind::Update if nd.desc().status() != TxnStatus::Aborted => op.value,
        _ => nd.value,
    }
}

/*
    construction-time configuration
*/

/// Sizing knobs for a container. All capacities are *per registered thread*;
/// the arenas are carved once at construction and never grow, so these must
/// cover the intended workload horizon.
#[derive(Debug, Clone)]
pub struct TxnConfig {
    /// Thread slots ([`register_thread`](crate::list::TransList::register_thread) calls)
    pub threads: usize,
    /// Operations capacity per descriptor (1..=255)
    pub max_ops: u8,
    /// Descriptors per thread
    pub desc_cap: usize,
    /// Node annotations per thread (every claim attempt burns one)
    pub ndesc_cap: usize,
    /// Container nodes per thread
    pub node_cap: usize,
    /// Map sub-spines per thread (ignored by list and skip list)
    pub spine_cap: usize,
}

impl Default for TxnConfig {
    fn default() -> Self {
        Self {
            threads: 8,
            max_ops: 16,
            desc_cap: 1 << 14,
            ndesc_cap: 1 << 16,
            node_cap: 1 << 15,
            spine_cap: 1 << 10,
        }
    }
}

impl TxnConfig {
    pub fn with_threads(threads: usize) -> Self {
        Self {
            threads,
            ..Self::default()
        }
    }
}

/*
    descriptor arena
    ---
    A thin typed view over the raw (runtime-stride) arena: each record is the
    TxnDesc header immediately followed by `max_ops` operation slots.
*/

pub(crate) struct DescPool {
    raw: RawArena,
    max_ops: u8,
}

impl DescPool {
    pub fn new(max_ops: u8, per_slab: usize, slabs: usize) -> Self {
        assert!(max_ops >= 1, "desc,zeroops");
        let record =
            mem::size_of::<TxnDesc>() + usize::from(max_ops) * mem::size_of::<TxnOp>();
        Self {
            raw: RawArena::new(record, per_slab, slabs),
            max_ops,
        }
    }
    pub fn slab(&self, tid: usize) -> DescSlab<'_> {
        DescSlab {
            raw: self.raw.slab(tid),
            max_ops: self.max_ops,
        }
    }
}

pub(crate) struct DescSlab<'a> {
    raw: RawSlab<'a>,
    max_ops: u8,
}

impl DescSlab<'_> {
    /// Materialize a fresh descriptor: status active, ops copied inline
    pub fn alloc(&self, ops: &[TxnOp]) -> NonNull<TxnDesc> {
        assert!(
            !ops.is_empty() && ops.len() <= usize::from(self.max_ops),
            "desc,opcount"
        );
        let p = self.raw.bump();
        unsafe {
            // UNSAFE(@theo): the record spans header + max_ops operations by
            // construction of the pool; we are the slab's only writer
            let d = p.as_ptr().cast::<TxnDesc>();
            d.write(TxnDesc {
                status: AtomicU8::new(TxnStatus::Active as u8),
                size: ops.len() as u8,
            });
            let o = d.add(1).cast::<TxnOp>();
            ptr::copy_nonoverlapping(ops.as_ptr(), o, ops.len());
            NonNull::new_unchecked(d)
        }
    }
}

/// The transactional half of a container's per-thread session: the thread's
/// descriptor and annotation slabs, its help stack and its metric slot. Each
/// container embeds this next to whatever node allocation state it needs.
/// Sessions never leave their thread.
pub(crate) struct TxnCtx<'c> {
    pub desc: DescSlab<'c>,
    pub ndesc: crate::mem::ArenaSlab<'c, NodeDesc>,
    pub help: exec::HelpStack,
    pub metric: &'c metrics::MetricSlot,
}

/*
    thread registration
*/

/// Hands out thread slots, at most `cap` of them, each exactly once. Cold
/// path: runs once per worker at startup.
pub(crate) struct Registry {
    next: parking_lot::Mutex<usize>,
    cap: usize,
}

impl Registry {
    pub fn new(cap: usize) -> Self {
        Self {
            next: parking_lot::Mutex::new(0),
            cap,
        }
    }
    pub fn ticket(&self) -> usize {
        let mut next = self.next.lock();
        assert!(*next < self.cap, "threads,capof");
        let tid = *next;
        *next += 1;
        tid
    }
}
