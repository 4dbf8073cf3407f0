//! Resource Bulkhead
//!
//! Per-agent token budgets backed by a shared pool budget, operation
//! timeouts and a circuit breaker.

#![warn(missing_docs)]

pub mod budget;
pub mod circuit;
pub mod bulkhead;

pub use budget::{TokenBudget, Reservation};
pub use circuit::{CircuitBreaker, CircuitChange};
pub use bulkhead::{Bulkhead, BulkheadError, Metered};
