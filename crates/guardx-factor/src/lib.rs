//! # guardx-factor: Policy Rewrite Algorithms
//!
//! This crate provides the rewrite passes that turn a disjunctive
//! access-control expression into a guarded, cheaper-to-evaluate form.
//! All of them operate on the model from `guardx-core` and share its
//! catalog/cost configuration.
//!
//! ## Passes
//!
//! - **`merge`**: `PredicateMerger` coalesces overlapping same-attribute
//!   conditions into one wider range before factoring, trading a controlled
//!   precision loss for more factoring opportunities.
//! - **`exact`**: `ExactFactorizer` -- gain-maximizing factorization, either
//!   single-predicate greedy or bounded power-set exact.
//! - **`select`**: `CostGuidedSelector` -- greedy factorization driven by the
//!   explicit I/O + CPU cost model, with a flattened guard/partition view and
//!   empirical calibration against an execution collaborator.
//! - **`sequence`**: `GuardSequencer` -- a flat, utility-ordered list of guard
//!   terms for union-of-guarded-subqueries rendering.
//!
//! ## Shared Structure
//!
//! - **`tree`**: the `FactorTree` the tree-shaped passes produce:
//!   `Leaf(expression)` or `Factor { multiplier, quotient, remainder, cost }`,
//!   where quotient and remainder partition the parent's policy set.
//!
//! Every pass clones its input before mutating: policies carry identity
//! (their id) while also being rewritten in place by the merger, so
//! copy-on-write is a correctness contract, not an optimization.

pub mod exact;
pub mod merge;
pub mod select;
pub mod sequence;
pub mod tree;

pub use exact::{ExactConfig, ExactFactorizer};
pub use merge::{MergeGate, PredicateMerger};
pub use select::{CostGuidedSelector, GuardedPartition};
pub use sequence::{GuardSequencer, Term};
pub use tree::FactorTree;
