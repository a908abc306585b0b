//! Reference counter for consumers attached to a single plugin handle.
//!
//! Independent of [`Pool`](crate::pool::Pool)'s own subscription map. Lock
//! free; the counter never goes below zero.

use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

/// Errors from [`SubscriptionCounter`].
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterError {
    /// `remove` was called with no subscriptions left.
    #[error("subscription count is already at zero")]
    AtZero,
}

/// Atomic subscription count.
#[derive(Debug, Default)]
pub struct SubscriptionCounter {
    count: AtomicU64,
}

impl SubscriptionCounter {
    /// Counter starting at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment; returns the new count.
    pub fn add(&self) -> u64 {
        self.count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Decrement; returns the new count.
    ///
    /// # Errors
    ///
    /// [`CounterError::AtZero`] if the count is already zero. The count is
    /// left unchanged.
    pub fn remove(&self) -> Result<u64, CounterError> {
        self.count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .map(|prev| prev - 1)
            .map_err(|_| CounterError::AtZero)
    }

    /// Current count.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Acquire)
    }
}
