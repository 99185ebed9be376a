//! Integration test suite for Tally.
//!
//! Drives a memory-backed wallet database against an in-memory chain
//! client through block connects, reorgs, rescans and spends, and checks
//! the ledger's balance invariants under randomized histories.

pub mod helpers;
