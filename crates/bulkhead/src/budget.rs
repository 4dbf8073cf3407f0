//! Token budgets with atomic reservation.

use std::sync::atomic::{AtomicU64, Ordering};

/// A token allowance that is only ever changed by compare-and-swap.
///
/// `used` counts both settled consumption and outstanding reservations, so a
/// reservation can never push it past `limit` even under contention.
#[derive(Debug)]
pub struct TokenBudget {
    limit: u64,
    used: AtomicU64,
}

impl TokenBudget {
    /// Create a budget with nothing used.
    pub fn new(limit: u64) -> Self {
        Self {
            limit,
            used: AtomicU64::new(0),
        }
    }

    /// Total allowance.
    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Tokens consumed or reserved.
    pub fn used(&self) -> u64 {
        self.used.load(Ordering::Acquire)
    }

    /// Tokens still available.
    pub fn remaining(&self) -> u64 {
        self.limit.saturating_sub(self.used())
    }

    /// Reserve `tokens`, or report what remains.
    pub fn try_reserve(&self, tokens: u64) -> Result<(), u64> {
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(tokens).filter(|total| *total <= self.limit)
            })
            .map(|_| ())
            .map_err(|used| self.limit.saturating_sub(used))
    }

    /// Give tokens back.
    pub fn refund(&self, tokens: u64) {
        // fetch_update with a closure that always returns Some cannot fail
        let _ = self
            .used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| Some(used.saturating_sub(tokens)));
    }
}

/// Tokens held against an agent budget and the pool budget.
///
/// Dropping a reservation without settling keeps the whole amount charged.
#[derive(Debug)]
#[must_use = "settle the reservation with the actual consumption"]
pub struct Reservation<'a> {
    budgets: [&'a TokenBudget; 2],
    tokens: u64,
}

impl<'a> Reservation<'a> {
    /// Reserve from `agent` first, then `pool`. On refusal nothing stays reserved.
    pub fn acquire(
        agent: &'a TokenBudget,
        pool: &'a TokenBudget,
        tokens: u64,
    ) -> Result<Self, (hive_core::BudgetScope, u64)> {
        agent
            .try_reserve(tokens)
            .map_err(|remaining| (hive_core::BudgetScope::Agent, remaining))?;
        if let Err(remaining) = pool.try_reserve(tokens) {
            agent.refund(tokens);
            return Err((hive_core::BudgetScope::Pool, remaining));
        }
        Ok(Self {
            budgets: [agent, pool],
            tokens,
        })
    }

    /// Amount reserved.
    pub fn tokens(&self) -> u64 {
        self.tokens
    }

    /// Charge `actual` (clamped to the reservation) and refund the rest.
    /// Returns the amount charged.
    pub fn settle(self, actual: u64) -> u64 {
        let charged = actual.min(self.tokens);
        let refund = self.tokens - charged;
        if refund > 0 {
            for budget in self.budgets {
                budget.refund(refund);
            }
        }
        charged
    }
}
