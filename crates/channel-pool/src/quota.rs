//! Quota ledger
//!
//! Per-channel counter of consumed units against a hard limit, with a reset
//! boundary and a soft safety ceiling used by selection. Admission reserves
//! the cost so concurrent admissions on one channel cannot jointly overspend;
//! the reservation turns into `used` only on `commit`, after the remote call
//! succeeded, and is handed back with `release` otherwise.
//!
//! Invariant: `used + reserved <= limit` after every admission, and
//! `used <= limit` always.

use channel_store::QuotaRecord;

/// Quota state of one channel for the current window.
#[derive(Debug, Clone)]
pub struct QuotaLedger {
    used: u64,
    reserved: u64,
    limit: u64,
    soft_limit: u64,
    reset_at: u64,
    window_millis: u64,
    flush_every: u64,
    unflushed: u64,
}

impl QuotaLedger {
    /// Build a ledger from persisted counters. `used` is clamped to `limit`
    /// in case the limit was lowered since the record was written.
    pub fn new(record: QuotaRecord, soft_limit: u64, window_millis: u64, flush_every: u64) -> Self {
        Self {
            used: record.used.min(record.limit),
            reserved: 0,
            limit: record.limit,
            soft_limit: soft_limit.min(record.limit),
            reset_at: record.reset_at,
            window_millis: window_millis.max(1),
            flush_every,
            unflushed: 0,
        }
    }

    /// Fresh ledger whose first window ends one window after `now`.
    pub fn fresh(limit: u64, soft_limit: u64, window_millis: u64, flush_every: u64, now: u64) -> Self {
        Self::new(
            QuotaRecord {
                used: 0,
                limit,
                reset_at: now.saturating_add(window_millis),
            },
            soft_limit,
            window_millis,
            flush_every,
        )
    }

    pub fn used(&self) -> u64 {
        self.used
    }

    pub fn reserved(&self) -> u64 {
        self.reserved
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn soft_limit(&self) -> u64 {
        self.soft_limit
    }

    pub fn reset_at(&self) -> u64 {
        self.reset_at
    }

    /// Units still admissible under the hard limit.
    pub fn remaining(&self) -> u64 {
        self.limit.saturating_sub(self.used + self.reserved)
    }

    /// Whether consumed quota has reached the hard limit, either locally or
    /// because the platform said so. Holds until the next window reset.
    pub fn is_exhausted(&self) -> bool {
        self.used >= self.limit
    }

    /// Whether `cost` fits under the soft ceiling (selection check).
    pub fn fits_soft(&self, cost: u64) -> bool {
        !self.is_exhausted() && self.used + self.reserved + cost <= self.soft_limit
    }

    /// Zero `used` once `now` has reached `reset_at`.
    ///
    /// `reset_at` advances by whole windows until it lies in the future:
    /// exactly one window in the normal case, more after a long downtime.
    /// Returns whether a reset happened; a second call before the next
    /// boundary is a no-op.
    pub fn maybe_reset(&mut self, now: u64) -> bool {
        if now < self.reset_at {
            return false;
        }
        let elapsed_windows = (now - self.reset_at) / self.window_millis + 1;
        self.reset_at = self
            .reset_at
            .saturating_add(elapsed_windows.saturating_mul(self.window_millis));
        self.used = 0;
        self.unflushed = 0;
        true
    }

    /// Reserve `cost` if it stays within the hard limit.
    pub fn admit(&mut self, cost: u64) -> bool {
        if self.is_exhausted() || self.used + self.reserved + cost > self.limit {
            return false;
        }
        self.reserved += cost;
        true
    }

    /// Convert a reservation of `cost` into consumed quota.
    ///
    /// Returns whether the counters should be flushed to storage: every
    /// `flush_every` committed units, or when this commit crossed the soft
    /// ceiling.
    pub fn commit(&mut self, cost: u64) -> bool {
        let before = self.used;
        self.reserved = self.reserved.saturating_sub(cost);
        self.used = (self.used + cost).min(self.limit);
        self.unflushed += self.used - before;

        let crossed_soft = before < self.soft_limit && self.used >= self.soft_limit;
        if crossed_soft || self.unflushed >= self.flush_every {
            self.unflushed = 0;
            true
        } else {
            false
        }
    }

    /// Hand back a reservation that was not consumed.
    pub fn release(&mut self, cost: u64) {
        self.reserved = self.reserved.saturating_sub(cost);
    }

    /// The platform reported quota exhaustion: trust it over the local estimate.
    pub fn mark_exhausted(&mut self) {
        self.used = self.limit;
        self.unflushed = 0;
    }

    /// Apply new limits from updated settings, keeping `used` within bounds.
    pub fn set_limits(&mut self, limit: u64, soft_limit: u64, flush_every: u64) {
        self.limit = limit;
        self.soft_limit = soft_limit.min(limit);
        self.used = self.used.min(limit);
        self.flush_every = flush_every;
    }

    pub fn record(&self) -> QuotaRecord {
        QuotaRecord {
            used: self.used,
            limit: self.limit,
            reset_at: self.reset_at,
        }
    }
}
