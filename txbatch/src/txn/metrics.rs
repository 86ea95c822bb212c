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

use crate::{mem::CachePadded, sync::atm::ORD_RLX};
use core::{fmt, sync::atomic::AtomicU64};

/*
    Outcome counters, one padded slot per registered thread. Each slot has a
    single writer (its thread), so bumps are load+store relaxed rather than
    RMWs, and folding is a read-side sum at whatever point the caller wants a
    report. This keeps the hot path free of a process-wide contended counter.
*/

pub(crate) struct MetricSlot {
    commit: AtomicU64,
    abort: AtomicU64,
    fake_abort: AtomicU64,
}

impl MetricSlot {
    const fn new() -> Self {
        Self {
            commit: AtomicU64::new(0),
            abort: AtomicU64::new(0),
            fake_abort: AtomicU64::new(0),
        }
    }
    #[inline(always)]
    fn bump(c: &AtomicU64) {
        // owner-only writer
        c.store(c.load(ORD_RLX) + 1, ORD_RLX);
    }
    pub fn commit(&self) {
        Self::bump(&self.commit);
    }
    pub fn abort(&self) {
        Self::bump(&self.abort);
    }
    /// An abort forced by helping-cycle detection rather than by a failed
    /// precondition; also counted in `abort`
    pub fn fake_abort(&self) {
        Self::bump(&self.abort);
        Self::bump(&self.fake_abort);
    }
}

pub(crate) struct TxnMetrics {
    slots: Box<[CachePadded<MetricSlot>]>,
}

impl TxnMetrics {
    pub fn new(threads: usize) -> Self {
        Self {
            slots: (0..threads)
                .map(|_| CachePadded::new(MetricSlot::new()))
                .collect(),
        }
    }
    pub fn slot(&self, tid: usize) -> &MetricSlot {
        &self.slots[tid]
    }
    pub fn fold(&self) -> MetricsReport {
        let mut r = MetricsReport {
            commits: 0,
            aborts: 0,
            fake_aborts: 0,
        };
        for slot in self.slots.iter() {
            r.commits += slot.commit.load(ORD_RLX);
            r.aborts += slot.abort.load(ORD_RLX);
            r.fake_aborts += slot.fake_abort.load(ORD_RLX);
        }
        log::debug!("metrics fold: {r}");
        r
    }
}

/// A point-in-time sum of every thread's outcome counters. Exact once the
/// workload has quiesced; approximate while it is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsReport {
    pub commits: u64,
    pub aborts: u64,
    pub fake_aborts: u64,
}

impl fmt::Display for MetricsReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "commit {} abort {}/{} fake",
            self.commits, self.aborts, self.fake_aborts
        )
    }
}
