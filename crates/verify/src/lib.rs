//! Commitment verification
//!
//! Deterministic checks over executor output. Verification produces a
//! [`hive_core::Verdict`] and never touches the queue.

#![warn(missing_docs)]

pub mod parser;
pub mod verifier;

pub use parser::{evaluate_condition, Extracted};
pub use verifier::{CommitmentVerifier, Verifier};
