// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Serialization graph: one node per in-flight transaction, edges typed by
//! the access kind of the earlier (source) operation, cycle detection on
//! every admission.
//!
//! A node's address is the transaction id carried in ordering-list tokens,
//! so edge insertion dereferences token ids directly. That is sound because
//! a node is retired through the epoch manager only after the owning
//! transaction has detached all of its tokens, and every dereference
//! happens under an epoch guard taken before the token was read.
//!
//! Locking protocol: edge admission and reads take a node's lock shared;
//! `check_committed` and `cleanup` take it exclusively once as a barrier
//! after raising `checked` / `cleaned`, so in-flight admissions either
//! complete before the phase transition or observe the flag and back off.

use crate::error::TxnId;
use crossbeam::epoch::Guard;
use parking_lot::RwLock;
use sgraph_collections::{AtomicHashSet, ChunkAllocator, SlotAlloc};
use sgraph_epoch::EpochManager;
use std::{
    cell::RefCell,
    collections::{HashMap, HashSet},
    ptr,
    sync::{
        atomic::{AtomicBool, AtomicPtr, AtomicU64, Ordering},
        Arc,
    },
};

/// Kind of the source access an edge records. Write-sourced edges are the
/// propagating kind: they carry cascading aborts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    Write,
    Read,
}

const EDGE_READ_BIT: u64 = 1 << 63;
const EDGE_ADDR_MASK: u64 = EDGE_READ_BIT - 1;

#[inline]
fn encode_edge(addr: u64, kind: EdgeKind) -> u64 {
    match kind {
        EdgeKind::Read => addr | EDGE_READ_BIT,
        EdgeKind::Write => addr,
    }
}

#[inline]
fn edge_addr(edge: u64) -> u64 {
    edge & EDGE_ADDR_MASK
}

#[inline]
fn edge_kind(edge: u64) -> EdgeKind {
    if edge & EDGE_READ_BIT != 0 {
        EdgeKind::Read
    } else {
        EdgeKind::Write
    }
}

type EdgeSet = AtomicHashSet<u64, ChunkAllocator>;

pub(crate) struct Node {
    lock: RwLock<()>,
    incoming: AtomicPtr<EdgeSet>,
    outgoing: AtomicPtr<EdgeSet>,
    aborted: AtomicBool,
    cascading_abort: AtomicBool,
    committed: AtomicBool,
    checked: AtomicBool,
    cleaned: AtomicBool,
    abort_through: AtomicU64,
}

impl Node {
    /// # Safety: the node must not be cleaned (own node, or peer under its
    /// shared lock with `cleaned` checked).
    unsafe fn incoming(&self) -> &EdgeSet {
        &*self.incoming.load(Ordering::Acquire)
    }

    unsafe fn outgoing(&self) -> &EdgeSet {
        &*self.outgoing.load(Ordering::Acquire)
    }
}

/// Copyable reference to a live node; the wrapped address is the
/// transaction id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeRef(pub(crate) u64);

impl NodeRef {
    pub fn id(self) -> TxnId {
        self.0
    }
}

/// # Safety: `addr` must come from a live token or `NodeRef`, under an
/// epoch guard pinned before the address was read.
unsafe fn node<'a>(addr: u64) -> &'a Node {
    &*(addr as *const Node)
}

struct CycleScratch {
    visited: HashSet<u64>,
    path: HashSet<u64>,
}

thread_local! {
    static SCRATCH: RefCell<CycleScratch> = RefCell::new(CycleScratch {
        visited: HashSet::new(),
        path: HashSet::new(),
    });
    /// Emptied edge sets recycled across transactions of the same graph.
    static SET_POOL: RefCell<HashMap<u64, Vec<Box<EdgeSet>>>> = RefCell::new(HashMap::new());
}

static NEXT_GRAPH_ID: AtomicU64 = AtomicU64::new(1);

pub struct SerializationGraph {
    id: u64,
    edge_buckets: usize,
    alloc: Arc<ChunkAllocator>,
    em: Arc<EpochManager>,
}

impl SerializationGraph {
    pub fn new(alloc: Arc<ChunkAllocator>, em: Arc<EpochManager>) -> Self {
        let cpus = num_cpus::get();
        let edge_buckets = if cpus >= 32 { cpus >> 4 } else { cpus }.max(4);
        Self {
            id: NEXT_GRAPH_ID.fetch_add(1, Ordering::Relaxed),
            edge_buckets,
            alloc,
            em,
        }
    }

    fn fresh_edge_set(&self) -> Box<EdgeSet> {
        SET_POOL.with(|pool| {
            pool.borrow_mut()
                .entry(self.id)
                .or_default()
                .pop()
                .unwrap_or_else(|| {
                    Box::new(AtomicHashSet::new(
                        self.edge_buckets,
                        Arc::clone(&self.alloc),
                        Arc::clone(&self.em),
                    ))
                })
        })
    }

    /// Allocates the node for a starting transaction. The node lives until
    /// the transaction's cleanup retires it.
    pub fn create_node(&self) -> NodeRef {
        let incoming = Box::into_raw(self.fresh_edge_set());
        let outgoing = Box::into_raw(self.fresh_edge_set());
        let raw = self.alloc.allocate::<Node>();
        unsafe {
            ptr::write(
                raw,
                Node {
                    lock: RwLock::new(()),
                    incoming: AtomicPtr::new(incoming),
                    outgoing: AtomicPtr::new(outgoing),
                    aborted: AtomicBool::new(false),
                    cascading_abort: AtomicBool::new(false),
                    committed: AtomicBool::new(false),
                    checked: AtomicBool::new(false),
                    cleaned: AtomicBool::new(false),
                    abort_through: AtomicU64::new(0),
                },
            );
        }
        NodeRef(raw as u64)
    }

    pub fn needs_abort(&self, this: NodeRef) -> bool {
        let node = unsafe { node(this.0) };
        node.aborted.load(Ordering::Acquire) || node.cascading_abort.load(Ordering::Acquire)
    }

    pub fn is_cascading(&self, this: NodeRef) -> bool {
        unsafe { node(this.0) }.cascading_abort.load(Ordering::Acquire)
    }

    pub fn abort_through(&self, this: NodeRef) -> TxnId {
        unsafe { node(this.0) }.abort_through.load(Ordering::Acquire)
    }

    /// Whether the transaction behind a token id has committed. Must be
    /// called under a guard pinned before the token was read.
    pub fn is_committed(&self, from: TxnId) -> bool {
        if from == 0 {
            return false;
        }
        unsafe { node(from) }.committed.load(Ordering::Acquire)
    }

    /// Admits the edge `from -> this` typed by the source's access kind.
    /// Returns false when the transaction must abort: either the insertion
    /// closes a cycle, or the source is aborting and the edge kind
    /// propagates, which marks `this` as cascading.
    pub fn insert_and_check(&self, this: NodeRef, from: TxnId, kind: EdgeKind) -> bool {
        if from == 0 || from == this.0 {
            return true;
        }
        let this_node = unsafe { node(this.0) };
        let from_node = unsafe { node(from) };
        let edge_in = encode_edge(from, kind);
        let edge_out = encode_edge(this.0, kind);

        loop {
            if unsafe { this_node.incoming() }.contains(&edge_in) {
                return true;
            }

            if kind == EdgeKind::Write
                && (from_node.aborted.load(Ordering::Acquire)
                    || from_node.cascading_abort.load(Ordering::Acquire))
            {
                this_node.cascading_abort.store(true, Ordering::Release);
                this_node.abort_through.store(from, Ordering::Release);
                return false;
            }

            let shared = from_node.lock.read();
            if from_node.cleaned.load(Ordering::Acquire) {
                // The source finished and unlinked itself; the conflict is
                // already reflected in the data.
                return true;
            }
            if from_node.checked.load(Ordering::Acquire) {
                // Source is finalizing; wait for it to commit or back off.
                drop(shared);
                continue;
            }

            unsafe {
                this_node.incoming().insert(edge_in);
                from_node.outgoing().insert(edge_out);
            }
            drop(shared);

            return !self.cycle_check(this);
        }
    }

    /// Naive DFS from `this` over incoming edges; true when a cycle through
    /// `this` exists.
    fn cycle_check(&self, this: NodeRef) -> bool {
        SCRATCH.with(|scratch| {
            let mut scratch = scratch.borrow_mut();
            scratch.visited.clear();
            scratch.path.clear();
            let guard = self.em.pin();
            self.dfs(this.0, &mut scratch, &guard)
        })
    }

    fn dfs(&self, addr: u64, scratch: &mut CycleScratch, guard: &Guard) -> bool {
        scratch.visited.insert(addr);
        scratch.path.insert(addr);

        let current = unsafe { node(addr) };
        // read_recursive: a DFS holds several shared locks at once; the
        // fair `read` would deadlock against a queued barrier writer.
        let shared = current.lock.read_recursive();
        if !current.cleaned.load(Ordering::Acquire) {
            for edge in unsafe { current.incoming() }.iter(guard) {
                let peer = edge_addr(edge);
                if scratch.path.contains(&peer) {
                    return true;
                }
                if !scratch.visited.contains(&peer) && self.dfs(peer, scratch, guard) {
                    return true;
                }
            }
        }
        drop(shared);
        scratch.path.remove(&addr);
        false
    }

    /// Attempts to finalize: freezes the incoming set, verifies it has
    /// drained, runs a final cycle check, and on success marks the node
    /// committed and cleans it up. On failure `checked` is cleared and the
    /// caller retries or aborts.
    pub fn check_committed(&self, this: NodeRef) -> bool {
        if self.needs_abort(this) {
            return false;
        }
        let node_ref = unsafe { node(this.0) };
        {
            let _shared = node_ref.lock.read();
            node_ref.checked.store(true, Ordering::Release);
        }
        {
            // Barrier: in-flight edge admissions drain here.
            let _exclusive = node_ref.lock.write();
        }
        {
            let _shared = node_ref.lock.read();
            if !unsafe { node_ref.incoming() }.is_empty() {
                node_ref.checked.store(false, Ordering::Release);
                return false;
            }
        }
        if self.needs_abort(this) {
            return false;
        }
        if self.cycle_check(this) {
            node_ref.aborted.store(true, Ordering::Release);
            return false;
        }
        node_ref.committed.store(true, Ordering::Release);
        self.cleanup(this);
        true
    }

    /// Aborts the transaction: records the write-dependency sources it was
    /// linked to (plus the abort-through id), then cleans up, propagating
    /// cascading aborts to write-dependent successors.
    pub fn abort(&self, this: NodeRef) -> HashSet<TxnId> {
        let node_ref = unsafe { node(this.0) };
        node_ref.aborted.store(true, Ordering::Release);

        let mut peers = HashSet::new();
        {
            let pin = self.em.pin();
            for edge in unsafe { node_ref.incoming() }.iter(&pin) {
                if edge_kind(edge) == EdgeKind::Write {
                    peers.insert(edge_addr(edge));
                }
            }
        }

        self.cleanup(this);

        let through = node_ref.abort_through.load(Ordering::Acquire);
        if through != 0 {
            peers.insert(through);
        }
        peers
    }

    fn cleanup(&self, this: NodeRef) {
        let node_ref = unsafe { node(this.0) };
        {
            let _shared = node_ref.lock.read();
            node_ref.cleaned.store(true, Ordering::Release);
        }
        {
            // Barrier for edge admissions that missed the flag.
            let _exclusive = node_ref.lock.write();
        }

        let aborted = node_ref.aborted.load(Ordering::Acquire);
        let pin = self.em.pin();

        let outgoing_edges: Vec<u64> = unsafe { node_ref.outgoing() }.iter(&pin).collect();
        for edge in outgoing_edges {
            let peer_addr = edge_addr(edge);
            let peer = unsafe { node(peer_addr) };
            if aborted && edge_kind(edge) == EdgeKind::Write {
                peer.cascading_abort.store(true, Ordering::Release);
                peer.abort_through.store(this.0, Ordering::Release);
                log::trace!("cascading abort {:#x} -> {:#x}", this.0, peer_addr);
            }
            {
                // Always unlink the mirror edge: a live node must never
                // hold an edge naming a node that is about to be retired.
                let _shared = peer.lock.read();
                if !peer.cleaned.load(Ordering::Acquire) {
                    unsafe { peer.incoming() }.erase(&encode_edge(this.0, edge_kind(edge)));
                }
            }
            unsafe { node_ref.outgoing() }.erase(&edge);
        }

        if aborted {
            let incoming_edges: Vec<u64> = unsafe { node_ref.incoming() }.iter(&pin).collect();
            for edge in incoming_edges {
                unsafe { node_ref.incoming() }.erase(&edge);
            }
        }

        {
            let _exclusive = node_ref.lock.write();
            let incoming = node_ref.incoming.swap(ptr::null_mut(), Ordering::AcqRel);
            let outgoing = node_ref.outgoing.swap(ptr::null_mut(), Ordering::AcqRel);
            let incoming = unsafe { Box::from_raw(incoming) };
            let outgoing = unsafe { Box::from_raw(outgoing) };
            if !incoming.is_empty() || !outgoing.is_empty() {
                // Both sets must have drained above; anything left points at
                // a protocol violation. Drain before pooling either way.
                log::error!(
                    "edge sets not drained at cleanup of {:#x} ({} in, {} out)",
                    this.0,
                    incoming.len(),
                    outgoing.len()
                );
                for set in [&incoming, &outgoing] {
                    let leftover: Vec<u64> = set.iter(&pin).collect();
                    for edge in leftover {
                        set.erase(&edge);
                    }
                }
            }
            SET_POOL.with(|pool| {
                let mut pool = pool.borrow_mut();
                let sets = pool.entry(self.id).or_default();
                sets.push(incoming);
                sets.push(outgoing);
            });
        }
    }

    /// Retires a cleaned node. Must be called only after every token
    /// naming the node has been detached from the ordering lists, under
    /// the owning transaction's guard: any reader that still holds the
    /// node's address obtained it under a pin taken before this call.
    pub fn retire_node(&self, this: NodeRef, guard: &Guard) {
        debug_assert!(unsafe { node(this.0) }.cleaned.load(Ordering::Acquire));
        let alloc = Arc::clone(&self.alloc);
        let addr = this.0;
        unsafe {
            self.em.retire(guard, move || {
                alloc.deallocate(addr as *mut Node);
            });
        }
    }
}
