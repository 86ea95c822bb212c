/*
 * Created on Sat Apr 06 2024
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

//! The transaction executor: one driver loop shared by every container.
//!
//! `help_ops` is deliberately runnable by *any* thread, not just the
//! descriptor's owner; that is the whole helping protocol. A thread that runs
//! into a foreign in-flight descriptor calls back into this loop to push that
//! transaction to resolution before retrying its own, and the thread-local
//! help stack breaks the cycles this can create: if a descriptor we are asked
//! to help is already somewhere below us on the stack, helping it would
//! recurse forever, so we abort it instead (counted as a "fake abort").

use super::{metrics::MetricSlot, OpKind, TxnDesc, TxnOp};
use crate::{mem::UArray, sync::atm::Guard};
use core::{cell::UnsafeCell, ptr};

/// Help-chain depth bound. Crossing it is a protocol violation, not a
/// workload property, hence fatal.
const HELP_CAP: usize = 256;
/// Operations bound per descriptor (`size` is a u8)
pub(crate) const TXN_MAX_OPS: usize = 255;

/// Per-operation verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OpOutcome {
    /// The operation took effect (or was a witnessed find)
    Ok,
    /// A helper already performed this exact `(desc, opid)`; nothing to do
    Skip,
    /// Precondition failed; the enclosing transaction must abort
    Fail,
}

/// The thread-local stack of descriptors currently being helped. Single
/// threaded by construction (sessions never cross threads), so plain interior
/// mutability is enough.
pub(crate) struct HelpStack {
    s: UnsafeCell<UArray<HELP_CAP, *const TxnDesc>>,
}

impl HelpStack {
    pub fn new() -> Self {
        Self {
            s: UnsafeCell::new(UArray::new()),
        }
    }
    #[inline(always)]
    fn with<R>(&self, f: impl FnOnce(&mut UArray<HELP_CAP, *const TxnDesc>) -> R) -> R {
        unsafe {
            // UNSAFE(@theo): the owning session is !Sync and stays on one
            // thread; no reentrancy within a single with() call
            f(&mut *self.s.get())
        }
    }
    pub fn init(&self) {
        self.with(|s| s.clear())
    }
    pub fn push(&self, d: &TxnDesc) {
        self.with(|s| {
            if s.len() == HELP_CAP {
                fatal!("helpstack,capof");
            }
            s.push(d as *const TxnDesc)
        })
    }
    pub fn pop(&self) {
        self.with(|s| {
            let _ = s.pop().expect("helpstack,underflow");
        })
    }
    pub fn contains(&self, d: &TxnDesc) -> bool {
        self.with(|s| s.as_slice().iter().any(|held| ptr::eq(*held, d)))
    }
}

/// What a container must provide for the shared driver loop to run its
/// transactions. `S` is the container's per-thread session type.
pub(crate) trait TxnStore<S> {
    /// Container node handle recorded for post-commit/post-abort marking
    type Target: Copy;
    fn help_stack<'a>(&self, s: &'a S) -> &'a HelpStack;
    fn metric<'a>(&self, s: &'a S) -> &'a MetricSlot;
    /// Run one primitive. Returns the verdict plus, for effective inserts and
    /// deletes, the claimed node (fed back through [`Self::tx_mark`] by
    /// whichever thread wins the status CAS).
    fn tx_run(
        &self,
        op: &TxnOp,
        desc: &TxnDesc,
        opid: u8,
        s: &S,
        g: &Guard,
    ) -> (OpOutcome, Option<Self::Target>);
    /// Post-resolution physical housekeeping for one claimed node: set the
    /// delete-authority mark on its annotation and best-effort unlink it.
    /// Logical absence already follows from the status; traversals finish
    /// whatever this leaves undone.
    fn tx_mark(&self, t: Self::Target, desc: &TxnDesc, s: &S, g: &Guard);
}

/// Transaction entry point: drive `desc` to resolution and report whether it
/// committed
pub(crate) fn execute_ops<S, T: TxnStore<S>>(
    store: &T,
    desc: &TxnDesc,
    s: &S,
    g: &Guard,
) -> bool {
    store.help_stack(s).init();
    help_ops(store, desc, 0, s, g);
    !desc.is_aborted()
}

/// Execute `desc`'s operations from `start` onward, on behalf of whoever
/// needs it resolved
pub(crate) fn help_ops<S, T: TxnStore<S>>(
    store: &T,
    desc: &TxnDesc,
    start: u8,
    s: &S,
    g: &Guard,
) {
    if !desc.is_active() {
        return;
    }
    let help = store.help_stack(s);
    // cyclic dependency check
    if help.contains(desc) {
        if desc.try_abort() {
            store.metric(s).fake_abort();
        }
        return;
    }

    let mut ins: UArray<TXN_MAX_OPS, T::Target> = UArray::new();
    let mut del: UArray<TXN_MAX_OPS, T::Target> = UArray::new();
    let mut outcome = OpOutcome::Ok;
    let mut opid = start;

    help.push(desc);
    while desc.is_active() && outcome != OpOutcome::Fail && opid < desc.size() {
        let op = desc.ops()[opid as usize];
        let (verdict, target) = store.tx_run(&op, desc, opid, s, g);
        if let Some(t) = target {
            match op.kind {
                OpKind::Insert => ins.push(t),
                OpKind::Delete => del.push(t),
                OpKind::Find | OpKind::Update => {}
            }
        }
        outcome = verdict;
        opid += 1;
    }
    help.pop();

    if outcome != OpOutcome::Fail {
        if desc.try_commit() {
            // the deletes took effect: schedule their nodes for unlink
            for t in del.as_slice() {
                store.tx_mark(*t, desc, s, g);
            }
            store.metric(s).commit();
        }
    } else if desc.try_abort() {
        // the inserts are being undone: schedule their nodes for unlink
        for t in ins.as_slice() {
            store.tx_mark(*t, desc, s, g);
        }
        store.metric(s).abort();
    }
}
