/*
 * Created on Sat Feb 24 2024
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

/// Declare a set of single-bit flags that live inside the unused low bits of an
/// aligned pointer. `bits()` reports how many low bits the set spans, which the
/// alignment checks in `sync::atm` consume.
macro_rules! flags {
    ($(#[$attr:meta])* $vis:vis struct $name:ident: $ty:ty { $($(#[$fattr:meta])* $flag:ident = $val:expr),* $(,)? }) => {
        $(#[$attr])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        $vis struct $name($ty);
        impl $name {
            $($(#[$fattr])* pub const $flag: Self = Self($val);)*
            const RAW_ALL: $ty = 0 $(| $val)*;
            #[inline(always)]
            pub const fn d(self) -> $ty {
                self.0
            }
            /// Number of low pointer bits this flag set occupies
            #[inline(always)]
            pub const fn bits() -> usize {
                (<$ty>::BITS - Self::RAW_ALL.leading_zeros()) as usize
            }
        }
    };
}

/// `fatal!(...)` logs the catastrophe and then takes the process down. Reserved
/// for the unrecoverable conditions: arena slab exhaustion and help-stack
/// overflow.
macro_rules! fatal {
    ($($arg:tt)*) => {{
        log::error!($($arg)*);
        panic!($($arg)*);
    }};
}
