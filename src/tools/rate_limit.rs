//! Sliding-window rate limiting for tool calls.
//!
//! Each tool has an independent call budget over a rolling 60-second window
//! (see the catalogue in [`crate::tools`]). Counters are updated atomically
//! under a single lock so concurrent calls to the same tool cannot exceed the
//! budget.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use super::{ToolName, spec};

/// Per-tool sliding-window limiter.
pub struct RateLimiter {
    window: Duration,
    calls: Mutex<FxHashMap<ToolName, VecDeque<Instant>>>,
}

impl RateLimiter {
    /// Width of the sliding window.
    pub const WINDOW: Duration = Duration::from_secs(60);

    pub fn new() -> Self {
        Self {
            window: Self::WINDOW,
            calls: Mutex::new(FxHashMap::default()),
        }
    }

    /// Try to consume one call from `tool`'s budget.
    ///
    /// Returns `false` when the budget for the current window is exhausted;
    /// the call must then fail fast without reaching the backend.
    pub fn try_acquire(&self, tool: ToolName) -> bool {
        let budget = spec(tool).per_minute_budget;
        let now = Instant::now();
        let mut calls = self.calls.lock();
        let history = calls.entry(tool).or_default();
        while let Some(oldest) = history.front() {
            if now.duration_since(*oldest) >= self.window {
                history.pop_front();
            } else {
                break;
            }
        }
        if history.len() as u32 >= budget {
            return false;
        }
        history.push_back(now);
        true
    }

    /// Calls left in the current window for `tool`.
    pub fn remaining(&self, tool: ToolName) -> u32 {
        let budget = spec(tool).per_minute_budget;
        let now = Instant::now();
        let calls = self.calls.lock();
        let used = calls
            .get(&tool)
            .map(|history| {
                history
                    .iter()
                    .filter(|at| now.duration_since(**at) < self.window)
                    .count() as u32
            })
            .unwrap_or(0);
        budget.saturating_sub(used)
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_is_enforced() {
        let limiter = RateLimiter::new();
        let budget = spec(ToolName::GetOrderStatus).per_minute_budget;
        for _ in 0..budget {
            assert!(limiter.try_acquire(ToolName::GetOrderStatus));
        }
        assert!(!limiter.try_acquire(ToolName::GetOrderStatus));
        assert_eq!(limiter.remaining(ToolName::GetOrderStatus), 0);
    }

    #[test]
    fn budgets_are_independent_per_tool() {
        let limiter = RateLimiter::new();
        let budget = spec(ToolName::GetContactInfo).per_minute_budget;
        for _ in 0..budget {
            assert!(limiter.try_acquire(ToolName::GetContactInfo));
        }
        assert!(!limiter.try_acquire(ToolName::GetContactInfo));
        assert!(limiter.try_acquire(ToolName::GetFaq));
    }
}
