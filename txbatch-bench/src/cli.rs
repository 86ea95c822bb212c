/*
 * Created on Sat Jul 06 2024
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

use clap::{Parser, ValueEnum};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SetKind {
    List,
    Skip,
    Map,
}

/// Random-workload driver for the txbatch transactional containers
#[derive(Debug, Parser)]
#[command(name = "txbatch-bench", version)]
pub struct Cli {
    /// Container under test
    #[arg(value_enum)]
    pub set: SetKind,
    /// Worker thread count
    pub threads: usize,
    /// Transactions executed per worker
    pub test_size: usize,
    /// Operations per transaction (1..=255)
    pub tran_size: u8,
    /// Keys are drawn uniformly from 1..=key-range
    pub key_range: u32,
    /// Percentage of insert operations in the mix
    pub insert_pct: u32,
    /// Percentage of delete operations in the mix
    pub delete_pct: u32,
    /// Percentage of update operations in the mix (map only); the remainder
    /// of the mix is finds
    pub update_pct: Option<u32>,
}
