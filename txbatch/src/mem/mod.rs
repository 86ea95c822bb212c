/*
 * Created on Sat Mar 09 2024
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

pub(crate) mod ll;
mod uarray;
#[cfg(test)]
mod tests;

pub(crate) use self::{ll::CachePadded, uarray::UArray};

use core::{cell::Cell, marker::PhantomData, mem, ptr::NonNull};
use std::alloc::{alloc, dealloc, handle_alloc_error, Layout};

/*
    bump arena
    ---
    One contiguous region, split evenly into single-writer slabs, one per
    registered thread. Allocation is a bump of the slab cursor and nothing is
    ever handed back: a record stays addressable until the arena itself dies
    with its container. That coarse lifetime is what lets transaction
    descriptors and per-node annotations be chased by helper threads at
    arbitrary points in the future without any epoch or hazard bookkeeping.

    Running a slab dry is unrecoverable (the caller sized the arena for the
    workload horizon); `fatal!` takes the process down.
*/

/// A typed bump arena. `T` must not need `Drop`: records are abandoned in
/// place when the arena is torn down.
pub(crate) struct Arena<T> {
    pool: NonNull<T>,
    per_slab: usize,
    slabs: usize,
    _m: PhantomData<T>,
}

// safety: the pool is plain memory; slab handles enforce the single-writer rule
unsafe impl<T: Send + Sync> Send for Arena<T> {}
unsafe impl<T: Send + Sync> Sync for Arena<T> {}

impl<T> Arena<T> {
    const ENSURE_NO_DROP: () = assert!(!mem::needs_drop::<T>());
    pub fn new(per_slab: usize, slabs: usize) -> Self {
        let _ = Self::ENSURE_NO_DROP;
        assert!(per_slab != 0 && slabs != 0, "arena,zerocap");
        let layout = Layout::array::<T>(per_slab * slabs).expect("arena,layout");
        let pool = unsafe {
            // UNSAFE(@theo): non-zero layout; slab cursors guarantee every cell
            // is written before it is read
            alloc(layout)
        };
        let Some(pool) = NonNull::new(pool as *mut T) else {
            handle_alloc_error(layout)
        };
        Self {
            pool,
            per_slab,
            slabs,
            _m: PhantomData,
        }
    }
    /// Carve out thread `tid`'s slab. The registry hands every tid to exactly
    /// one thread, which makes the slab handle the slab's only writer.
    pub fn slab(&self, tid: usize) -> ArenaSlab<'_, T> {
        assert!(tid < self.slabs, "arena,badtid");
        ArenaSlab {
            base: unsafe {
                // UNSAFE(@theo): tid < slabs, so the offset stays in the pool
                NonNull::new_unchecked(self.pool.as_ptr().add(tid * self.per_slab))
            },
            cap: self.per_slab,
            at: Cell::new(0),
            _m: PhantomData,
        }
    }
}

impl<T> Drop for Arena<T> {
    fn drop(&mut self) {
        let layout = Layout::array::<T>(self.per_slab * self.slabs).unwrap();
        unsafe {
            // UNSAFE(@theo): same layout as the allocation; element drops are
            // statically ruled out
            dealloc(self.pool.as_ptr() as *mut u8, layout)
        }
    }
}

/// A thread's private window into an [`Arena`]. Not `Send`: it must stay on
/// the thread that registered for it.
pub(crate) struct ArenaSlab<'a, T> {
    base: NonNull<T>,
    cap: usize,
    at: Cell<usize>,
    _m: PhantomData<&'a Arena<T>>,
}

impl<T> ArenaSlab<'_, T> {
    pub fn alloc(&self, v: T) -> NonNull<T> {
        let at = self.at.get();
        if at == self.cap {
            fatal!("arena,capof");
        }
        self.at.set(at + 1);
        unsafe {
            // UNSAFE(@theo): at < cap and the cell is ours alone
            let p = self.base.as_ptr().add(at);
            p.write(v);
            NonNull::new_unchecked(p)
        }
    }
    #[cfg(test)]
    pub fn remaining(&self) -> usize {
        self.cap - self.at.get()
    }
}

/*
    raw arena
    ---
    Same scheme, but the record size is a runtime quantity (a transaction
    descriptor is a fixed header plus however many operations the workload
    packs per transaction, laid out inline). The stride is fixed per arena
    instance and rounded so every record starts 8-aligned.
*/

pub(crate) struct RawArena {
    pool: NonNull<u8>,
    stride: usize,
    per_slab: usize,
    slabs: usize,
}

// safety: as for Arena; record contents are published only via CAS downstream
unsafe impl Send for RawArena {}
unsafe impl Sync for RawArena {}

const RAW_ALIGN: usize = 8;

impl RawArena {
    pub fn new(record: usize, per_slab: usize, slabs: usize) -> Self {
        assert!(record != 0 && per_slab != 0 && slabs != 0, "arena,zerocap");
        let stride = (record + RAW_ALIGN - 1) & !(RAW_ALIGN - 1);
        let layout =
            Layout::from_size_align(stride * per_slab * slabs, RAW_ALIGN).expect("arena,layout");
        let pool = unsafe {
            // UNSAFE(@theo): non-zero layout
            alloc(layout)
        };
        let Some(pool) = NonNull::new(pool) else {
            handle_alloc_error(layout)
        };
        Self {
            pool,
            stride,
            per_slab,
            slabs,
        }
    }
    pub fn slab(&self, tid: usize) -> RawSlab<'_> {
        assert!(tid < self.slabs, "arena,badtid");
        RawSlab {
            base: unsafe {
                // UNSAFE(@theo): tid < slabs
                NonNull::new_unchecked(self.pool.as_ptr().add(tid * self.per_slab * self.stride))
            },
            stride: self.stride,
            cap: self.per_slab,
            at: Cell::new(0),
            _m: PhantomData,
        }
    }
}

impl Drop for RawArena {
    fn drop(&mut self) {
        let layout =
            Layout::from_size_align(self.stride * self.per_slab * self.slabs, RAW_ALIGN).unwrap();
        unsafe {
            // UNSAFE(@theo): same layout as the allocation
            dealloc(self.pool.as_ptr(), layout)
        }
    }
}

pub(crate) struct RawSlab<'a> {
    base: NonNull<u8>,
    stride: usize,
    cap: usize,
    at: Cell<usize>,
    _m: PhantomData<&'a RawArena>,
}

impl RawSlab<'_> {
    /// Hand out the next `stride`-sized record. The caller initializes it in
    /// full before sharing it.
    pub fn bump(&self) -> NonNull<u8> {
        let at = self.at.get();
        if at == self.cap {
            fatal!("arena,capof");
        }
        self.at.set(at + 1);
        unsafe {
            // UNSAFE(@theo): at < cap
            NonNull::new_unchecked(self.base.as_ptr().add(at * self.stride))
        }
    }
    #[cfg(test)]
    pub fn stride(&self) -> usize {
        self.stride
    }
}
