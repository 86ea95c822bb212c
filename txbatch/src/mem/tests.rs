/*
 * Created on Sun Mar 17 2024
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

use super::{Arena, RawArena, UArray};

// uarray

#[test]
fn uarray_push_pop() {
    let mut a: UArray<4, u32> = UArray::new();
    assert!(a.is_empty());
    a.push(1);
    a.push(2);
    a.push(3);
    assert_eq!(a.as_slice(), [1, 2, 3]);
    assert_eq!(a.pop(), Some(3));
    assert_eq!(a.len(), 2);
    assert_eq!(a.pop(), Some(2));
    assert_eq!(a.pop(), Some(1));
    assert_eq!(a.pop(), None);
}

#[test]
fn uarray_clear() {
    let mut a: UArray<4, String> = UArray::new();
    a.push("x".into());
    a.push("y".into());
    a.clear();
    assert!(a.is_empty());
    a.push("z".into());
    assert_eq!(a.as_slice(), ["z"]);
}

#[test]
#[should_panic(expected = "stack,capof")]
fn uarray_capof() {
    let mut a: UArray<2, u8> = UArray::new();
    a.push(0);
    a.push(1);
    a.push(2);
}

// typed arena

#[test]
fn arena_slabs_are_disjoint() {
    let arena: Arena<u64> = Arena::new(4, 2);
    let s0 = arena.slab(0);
    let s1 = arena.slab(1);
    let a = s0.alloc(10);
    let b = s1.alloc(20);
    let c = s0.alloc(30);
    assert_ne!(a, b);
    assert_ne!(a, c);
    unsafe {
        assert_eq!(*a.as_ref(), 10);
        assert_eq!(*b.as_ref(), 20);
        assert_eq!(*c.as_ref(), 30);
    }
    assert_eq!(s0.remaining(), 2);
    assert_eq!(s1.remaining(), 3);
}

#[test]
fn arena_records_are_stable() {
    let arena: Arena<u64> = Arena::new(16, 1);
    let slab = arena.slab(0);
    let first = slab.alloc(0xfeed);
    for i in 0..15 {
        slab.alloc(i);
    }
    // the first record did not move while the slab filled up
    unsafe {
        assert_eq!(*first.as_ref(), 0xfeed);
    }
}

#[test]
#[should_panic(expected = "arena,capof")]
fn arena_capof() {
    let arena: Arena<u64> = Arena::new(1, 1);
    let slab = arena.slab(0);
    slab.alloc(1);
    slab.alloc(2);
}

#[test]
#[should_panic(expected = "arena,badtid")]
fn arena_bad_tid() {
    let arena: Arena<u64> = Arena::new(1, 1);
    let _ = arena.slab(1);
}

// raw arena

#[test]
fn raw_arena_stride_and_alignment() {
    let arena = RawArena::new(10, 4, 1);
    let slab = arena.slab(0);
    assert_eq!(slab.stride(), 16);
    let a = slab.bump().as_ptr() as usize;
    let b = slab.bump().as_ptr() as usize;
    assert_eq!(b - a, 16);
    assert_eq!(a % 8, 0);
    assert_eq!(b % 8, 0);
}

#[test]
#[should_panic(expected = "arena,capof")]
fn raw_arena_capof() {
    let arena = RawArena::new(8, 2, 1);
    let slab = arena.slab(0);
    slab.bump();
    slab.bump();
    slab.bump();
}
