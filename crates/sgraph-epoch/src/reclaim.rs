// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use crossbeam::epoch::{Collector, Guard, LocalHandle};
use std::{
    cell::RefCell,
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
};

static NEXT_MANAGER_ID: AtomicU64 = AtomicU64::new(0);

thread_local! {
    /// One registered participant per (thread, manager) pair. Entries for a
    /// dropped manager keep its collector alive until the thread exits; the
    /// ids are unique for the process lifetime so entries never collide.
    static LOCALS: RefCell<HashMap<u64, LocalHandle>> = RefCell::new(HashMap::new());
}

/// Grace-period reclamation scoped to one engine instance.
///
/// Every structure of an engine shares the engine's manager, so a guard
/// taken anywhere in the engine protects pointers retired anywhere else in
/// it. Distinct engines (e.g. in tests) do not observe each other's epochs.
pub struct EpochManager {
    id: u64,
    collector: Collector,
}

impl EpochManager {
    pub fn new() -> Self {
        Self {
            id: NEXT_MANAGER_ID.fetch_add(1, Ordering::Relaxed),
            collector: Collector::new(),
        }
    }

    /// Enters the current epoch. The returned guard makes every pointer
    /// retired through this manager before the pin safe to dereference
    /// until the guard is dropped.
    pub fn pin(&self) -> Guard {
        LOCALS.with(|locals| {
            let mut locals = locals.borrow_mut();
            locals
                .entry(self.id)
                .or_insert_with(|| self.collector.register())
                .pin()
        })
    }

    /// Defers `f` until every guard live at the call site has been dropped.
    ///
    /// # Safety
    ///
    /// `f` runs on an arbitrary thread at an arbitrary later point; anything
    /// it captures must remain valid until then and must be safe to use from
    /// another thread. The guard must come from this manager.
    pub unsafe fn retire<F: FnOnce()>(&self, guard: &Guard, f: F) {
        guard.defer_unchecked(f);
    }
}

impl Default for EpochManager {
    fn default() -> Self {
        Self::new()
    }
}
