// Copyright (C) 2026 The flowsync Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Adaptive page size and round backoff.

use std::time::Duration;

/// Page size of one mediator, adapted to upstream responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdaptivePageSize {
    current: usize,
    default: usize,
    min: usize,
    max: usize,
}

impl AdaptivePageSize {
    /// Create a page size starting at `default`, clamped into `[min, max]`.
    pub fn new(default: usize, min: usize, max: usize) -> Self {
        let min = min.max(1);
        let max = max.max(min);
        let default = default.clamp(min, max);
        Self {
            current: default,
            default,
            min,
            max,
        }
    }

    /// Current page size.
    pub fn current(&self) -> usize {
        self.current
    }

    /// Halve the page size after an oversized response.
    pub fn shrink(&mut self) {
        self.current = (self.current / 2).max(self.min);
    }

    /// Double the page size after an empty page, up to the maximum.
    pub fn grow(&mut self) {
        self.current = self.current.saturating_mul(2).min(self.max);
    }

    /// Move back towards the default after a page with data.
    ///
    /// A grown page size drops back to the default at once; a shrunk page size
    /// recovers by doubling.
    pub fn settle(&mut self) {
        if self.current > self.default {
            self.current = self.default;
        } else if self.current < self.default {
            self.current = self.current.saturating_mul(2).min(self.default);
        }
    }
}

/// Bounded exponential backoff between rounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    base: Duration,
    max: Duration,
}

impl BackoffPolicy {
    /// Create a policy doubling from `base` up to `max`.
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
        }
    }

    /// Delay following `current`.
    pub fn next(&self, current: Duration) -> Duration {
        if current.is_zero() {
            return self.base;
        }
        current.saturating_mul(2).min(self.max)
    }

    /// Delay after a round that made progress.
    pub fn reset(&self) -> Duration {
        Duration::ZERO
    }
}
