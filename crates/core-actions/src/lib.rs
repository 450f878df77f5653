//! Decision engine and action dispatch.
//!
//! [`DecisionEngine::process`] turns one classified [`ReadRecord`] into a
//! final [`Action`] under the owning condition's policy (control override,
//! chunk-bound overrides, dry-run substitution, redundant-send suppression)
//! and enqueues it on the [`ActionBatcher`]. The batcher flushes once per
//! loop iteration: all decisions of an iteration are computed before any RPC
//! for that iteration is dispatched.

pub mod dispatch;
pub mod engine;

pub use dispatch::{ActionBatcher, DispatchSummary};
pub use engine::{DecisionEngine, Resolution};
