/*
 * Created on Sat Mar 02 2024
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

use core::{fmt, mem, sync::atomic::Ordering};
use crossbeam_epoch::{Atomic as CBAtomic, CompareExchangeError, Pointable, Pointer};
// re-exported so the containers speak one dialect
pub(crate) use crossbeam_epoch::{pin as cpin, Guard, Shared};

pub(crate) const ORD_RLX: Ordering = Ordering::Relaxed;
pub(crate) const ORD_ACQ: Ordering = Ordering::Acquire;
pub(crate) const ORD_REL: Ordering = Ordering::Release;
pub(crate) const ORD_ACR: Ordering = Ordering::AcqRel;
pub(crate) const ORD_SEQ: Ordering = Ordering::SeqCst;

type CxResult<'g, T, P> = Result<Shared<'g, T>, CompareExchangeError<'g, T, P>>;

/// Compile-time check that `T`'s alignment leaves `fsize` low pointer bits
/// free for tagging
pub(crate) const fn ensure_flag_align<T>(fsize: usize) {
    debug_assert!(mem::align_of::<T>().trailing_zeros() as usize >= fsize);
}

/*
    All pointer words the containers race on go through this wrapper: list and
    skip tower links, map spine slots and the per-node annotation pointers. The
    epoch layer is used purely as a typed tagged-pointer CAS substrate; nothing
    is ever handed to the collector, because record lifetime is the arena's
    concern (coarse, container-bound).
*/
pub(crate) struct Atomic<T> {
    a: CBAtomic<T>,
}

// the derive would put a bound on T
impl<T> fmt::Debug for Atomic<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.a)
    }
}

impl<T: Pointable> Atomic<T> {
    #[inline(always)]
    pub const fn null() -> Self {
        Self {
            a: CBAtomic::null(),
        }
    }
    #[inline(always)]
    pub fn cx<'g, P>(
        &self,
        o: Shared<'g, T>,
        n: P,
        s: Ordering,
        f: Ordering,
        g: &'g Guard,
    ) -> CxResult<'g, T, P>
    where
        P: Pointer<T>,
    {
        self.a.compare_exchange(o, n, s, f, g)
    }
    #[inline(always)]
    pub fn cx_rel<'g, P>(&self, o: Shared<'g, T>, n: P, g: &'g Guard) -> CxResult<'g, T, P>
    where
        P: Pointer<T>,
    {
        self.cx(o, n, ORD_REL, ORD_RLX, g)
    }
    #[inline(always)]
    pub fn ld<'g>(&self, o: Ordering, g: &'g Guard) -> Shared<'g, T> {
        self.a.load(o, g)
    }
    #[inline(always)]
    pub fn ld_acq<'g>(&self, g: &'g Guard) -> Shared<'g, T> {
        self.ld(ORD_ACQ, g)
    }
    /// Set `tag` bits on the stored pointer, returning the previous value
    #[inline(always)]
    pub fn or_tag<'g>(&self, tag: usize, g: &'g Guard) -> Shared<'g, T> {
        self.a.fetch_or(tag, ORD_ACR, g)
    }
    /// Plain store; only legal while the containing record is unpublished
    #[inline(always)]
    pub fn st_rlx<P>(&self, n: P)
    where
        P: Pointer<T>,
    {
        self.a.store(n, ORD_RLX)
    }
}

impl<T, A> From<A> for Atomic<T>
where
    A: Into<CBAtomic<T>>,
{
    fn from(t: A) -> Self {
        Self { a: Into::into(t) }
    }
}
