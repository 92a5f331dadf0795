// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Concurrent building blocks of the sgraph engine.
//!
//! Everything here is sized at construction and allocation-stable: once an
//! element has an address, the address is valid for the structure's
//! lifetime, and detached memory is reclaimed through the epoch manager so
//! lock-free readers never dereference freed memory.
//!
//! - [`alloc::ChunkAllocator`]: bump-pointer allocation of small slots out
//!   of 1 MiB chunks, with per-chunk reference counting.
//! - [`extent::ExtentVec`] / [`extent::AtomicExtentVec`]: append-only
//!   segmented vectors with stable element addresses.
//! - [`list::AtomicOrderedList`]: per-row access list handing out
//!   monotonic position ids.
//! - [`map`]: open-bucket hash map, set and multi-map over chunk-allocated
//!   nodes.

pub mod alloc;
pub mod error;
pub mod extent;
pub mod hash;
pub mod list;
pub mod map;

#[cfg(test)]
mod unit_tests;

pub use alloc::{ChunkAllocator, SlotAlloc, StdSlotAlloc};
pub use error::CapacityExhausted;
pub use extent::{AtomicExtentVec, ExtentVec};
pub use list::AtomicOrderedList;
pub use map::{AtomicHashMap, AtomicHashMultiMap, AtomicHashSet};
