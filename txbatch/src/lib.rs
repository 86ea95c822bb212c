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

//! # txbatch
//!
//! Batched, atomically-committed operations over lock-free containers. A client
//! fills a transaction descriptor with up to 255 primitive operations (insert,
//! delete, find and, on the map, update), then hands it to a container's
//! `execute_ops`, which either commits the whole batch or aborts it leaving no
//! trace. Threads that run into each other's in-flight descriptors help them to
//! completion instead of blocking, so every container stays lock-free and every
//! transaction resolves.
//!
//! Three container flavors share one transactional core:
//! - [`list::TransList`]: a sorted singly-linked list (set semantics)
//! - [`skip::TransSkip`]: a multi-level skip list (set semantics)
//! - [`map::TransMap`]: a spine-structured hash table (map semantics)

#![deny(unreachable_patterns)]

#[macro_use]
mod macros;
mod mem;
mod sync;

pub mod list;
pub mod map;
pub mod skip;
pub mod txn;

pub use txn::{metrics::MetricsReport, DescRef, OpKind, TxnConfig, TxnOp, TxnStatus};
