// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Two-tier epoch management for the sgraph engine.
//!
//! The [`reclaim`] tier provides grace-period reclamation: memory detached
//! from a lock-free structure is retired under an epoch guard and freed only
//! once every guard that was live at retirement has been dropped.
//!
//! The [`commit`] tier tracks the engine's monotonic commit epoch and the
//! safe-read epoch observed by read-only snapshots, and defers version-chain
//! unlinks until no snapshot that still needs the unlinked version is live.

pub mod commit;
pub mod reclaim;

pub use commit::{CommitEpochs, SnapshotGuard};
pub use reclaim::EpochManager;
