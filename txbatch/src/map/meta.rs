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

/// Width of every sub-spine: 2^6 = 64 slots. The top spine's width is a
/// construction parameter instead (`main_pow`).
pub(crate) const SUB_POW: u32 = 6;
pub(crate) const SUB_SIZE: usize = 1 << SUB_POW;

flags! {
    /// Tag bits on a map slot pointer. Untagged non-null means a data node.
    pub(crate) struct SlotFlag: usize {
        /// The pointer is a sub-spine, not a data node
        SPINE = 0b01,
        /// Forced-expansion mark on a data node: the slot saw too much CAS
        /// contention and must become a sub-spine before anything else
        /// happens to it
        EXPAND = 0b10,
    }
}

#[inline(always)]
pub(crate) const fn hf(tag: usize, f: SlotFlag) -> bool {
    tag & f.d() == f.d()
}

/// Compile-time geometry and hashing policy of a [`TransMap`](super::TransMap)
pub trait MapConfig: Sized + 'static {
    /// CAS losses tolerated on one slot before it is forcibly expanded
    const MAX_CAS_FAILURE: usize = 10;
    /// Key scrambling. Must be a *bijection* on u32: spine walks compare
    /// hashes, never keys, and rely on equal hash implying equal key. The
    /// default reverses the bit order, which spreads sequential keys across
    /// the top spine while staying trivially invertible.
    fn hash_key(k: u32) -> u32 {
        k.reverse_bits()
    }
}

/// Default map geometry
pub struct DefConfig;
impl MapConfig for DefConfig {}
