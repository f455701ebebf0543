//! Ambient watchers (SPEC_FULL.md S2 item 10). Out of scope for the
//! engine's correctness invariants per spec.md S1 — the engine only
//! depends on their output shape (metadata upserts into the store), not
//! their internals.

pub mod local;
pub mod remote;
