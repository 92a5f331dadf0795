// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use concurrent_queue::ConcurrentQueue;
use crossbeam::utils::CachePadded;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering::SeqCst};

/// Slot value announcing that no snapshot occupies the slot.
const IDLE: u64 = u64::MAX;

struct DeferredUnlink {
    epoch: u64,
    run: Box<dyn FnOnce() + Send>,
}

/// Commit-epoch tier on top of the base reclamation manager.
///
/// The counter advances on every transaction commit; a committed version is
/// stamped with the post-increment value. Read-only snapshots announce the
/// epoch they read at in one of a fixed number of slots; the minimum
/// announced epoch is the horizon behind which version-chain unlinks may
/// safely run.
pub struct CommitEpochs {
    counter: AtomicU64,
    slots: Box<[CachePadded<AtomicU64>]>,
    deferred: ConcurrentQueue<DeferredUnlink>,
    drain_lock: Mutex<()>,
    publish_lock: Mutex<()>,
}

impl CommitEpochs {
    /// `max_snapshots` bounds the number of concurrently live read-only
    /// snapshots; it is fixed at construction.
    pub fn new(max_snapshots: usize) -> Self {
        let slots = (0..max_snapshots)
            .map(|_| CachePadded::new(AtomicU64::new(IDLE)))
            .collect();
        Self {
            counter: AtomicU64::new(0),
            slots,
            deferred: ConcurrentQueue::unbounded(),
            drain_lock: Mutex::new(()),
            publish_lock: Mutex::new(()),
        }
    }

    /// The greatest commit epoch guaranteed visible to a snapshot taken now.
    pub fn safe_read_epoch(&self) -> u64 {
        self.counter.load(SeqCst)
    }

    /// Advances the commit counter and returns the new epoch.
    pub fn commit(&self) -> u64 {
        self.commit_with(|_| ())
    }

    /// Publishes one commit: `stamp` runs with the new epoch while the
    /// counter still reads the old one, and the counter advances only
    /// after `stamp` returns. A snapshot therefore observes either none
    /// or all of a transaction's version stamps, never a torn subset.
    pub fn commit_with(&self, stamp: impl FnOnce(u64)) -> u64 {
        let epoch = {
            let _serialized = self.publish_lock.lock();
            let epoch = self.counter.load(SeqCst) + 1;
            stamp(epoch);
            self.counter.store(epoch, SeqCst);
            epoch
        };
        self.drain();
        epoch
    }

    /// Claims a snapshot slot at the current safe-read epoch. Returns `None`
    /// when all slots are occupied.
    pub fn snapshot(&self) -> Option<SnapshotGuard<'_>> {
        for (index, slot) in self.slots.iter().enumerate() {
            if slot.load(SeqCst) != IDLE {
                continue;
            }
            if slot
                .compare_exchange(IDLE, self.counter.load(SeqCst), SeqCst, SeqCst)
                .is_err()
            {
                continue;
            }
            // Re-announce until the published epoch matches the counter so a
            // commit racing with the claim either sees the announcement or
            // is reflected in the snapshot's epoch, never neither.
            let mut epoch = slot.load(SeqCst);
            loop {
                let now = self.counter.load(SeqCst);
                if now == epoch {
                    break;
                }
                slot.store(now, SeqCst);
                epoch = now;
            }
            return Some(SnapshotGuard {
                epochs: self,
                slot: index,
                epoch,
            });
        }
        None
    }

    /// The epoch at or below which no live snapshot can still need a
    /// shadowed version.
    pub fn horizon(&self) -> u64 {
        self.slots
            .iter()
            .map(|slot| slot.load(SeqCst))
            .min()
            .map_or_else(|| self.counter.load(SeqCst), |m| m.min(self.counter.load(SeqCst)))
    }

    /// Queues `run` to execute once the horizon reaches `epoch`.
    pub fn defer_unlink(&self, epoch: u64, run: Box<dyn FnOnce() + Send>) {
        let _ = self.deferred.push(DeferredUnlink { epoch, run });
        self.drain();
    }

    fn drain(&self) {
        // A single drainer at a time; contenders skip, the queue is drained
        // again at the next commit or snapshot drop.
        let Some(_exclusive) = self.drain_lock.try_lock() else {
            return;
        };
        let horizon = self.horizon();
        for _ in 0..self.deferred.len() {
            let Ok(entry) = self.deferred.pop() else {
                break;
            };
            if entry.epoch <= horizon {
                (entry.run)();
            } else {
                let _ = self.deferred.push(entry);
                break;
            }
        }
    }
}

impl Drop for CommitEpochs {
    fn drop(&mut self) {
        // No snapshots can be live here; run whatever is still queued.
        let mut drained = 0usize;
        while let Ok(entry) = self.deferred.pop() {
            (entry.run)();
            drained += 1;
        }
        if drained > 0 {
            log::debug!("ran {} deferred unlink(s) at teardown", drained);
        }
    }
}

/// Occupation of a snapshot slot; releasing it re-opens the slot and gives
/// queued unlinks a chance to run.
pub struct SnapshotGuard<'a> {
    epochs: &'a CommitEpochs,
    slot: usize,
    epoch: u64,
}

impl<'a> std::fmt::Debug for SnapshotGuard<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotGuard")
            .field("slot", &self.slot)
            .field("epoch", &self.epoch)
            .finish()
    }
}

impl SnapshotGuard<'_> {
    pub fn epoch(&self) -> u64 {
        self.epoch
    }
}

impl Drop for SnapshotGuard<'_> {
    fn drop(&mut self) {
        self.epochs.slots[self.slot].store(IDLE, SeqCst);
        self.epochs.drain();
    }
}
