//! Property-based tests for the memory graph using proptest.
//!
//! These tests exercise graph invariants under arbitrary operation sequences:
//!
//! - Every edge endpoint refers to a live node
//! - Importance always stays within [0, 1]
//! - Retrieval is deterministic for a fixed clock
//! - Merging never leaves a reference to the removed node
//! - Repeated links between the same pair coalesce into one summed edge
