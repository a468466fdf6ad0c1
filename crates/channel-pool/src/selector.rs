//! Channel selection
//!
//! Candidates are the channels eligible for the requested cost. Among them,
//! the ones whose remaining quota lies within `tie_tolerance` of the best
//! form a band; inside the band the least recently used channel wins, so
//! load spreads across channels with similar headroom instead of always
//! draining the single fullest one.

use std::cmp::Ordering;
use std::sync::Arc;

use tracing::debug;

use crate::error::{Error, Result};
use crate::registry::Registry;
use crate::status::ChannelStatus;

/// Picks the best eligible channel for an operation.
pub struct Selector {
    registry: Arc<Registry>,
    tie_tolerance: u64,
}

impl Selector {
    pub fn new(registry: Arc<Registry>) -> Self {
        let tie_tolerance = registry.settings().tie_tolerance;
        Self {
            registry,
            tie_tolerance,
        }
    }

    /// The top-ranked eligible channel for `cost`.
    ///
    /// `NoEligibleChannel` is a normal "try later" signal; its summary says
    /// why each channel was excluded.
    pub async fn select_best(&self, cost: u64) -> Result<ChannelStatus> {
        let mut ranked = self.ranked(cost).await?;
        Ok(ranked.swap_remove(0))
    }

    /// Every eligible channel for `cost`, best first. Never empty.
    pub async fn ranked(&self, cost: u64) -> Result<Vec<ChannelStatus>> {
        let scan = self.registry.scan(cost).await;
        let summary = scan.summary();
        if scan.eligible.is_empty() {
            debug!(cost, %summary, "no eligible channel");
            return Err(Error::NoEligibleChannel { cost, summary });
        }
        let ranked = rank(scan.eligible, self.tie_tolerance);
        debug!(cost, channel_id = %ranked[0].id, %summary, "channel selected");
        Ok(ranked)
    }
}

/// Order eligible channels best first.
///
/// Channels within `tie_tolerance` of the largest remaining quota come
/// first, least recently used (never used first), then larger remaining,
/// then id. The rest follow by descending remaining quota.
pub fn rank(mut candidates: Vec<ChannelStatus>, tie_tolerance: u64) -> Vec<ChannelStatus> {
    let best = candidates
        .iter()
        .map(|c| c.quota_remaining)
        .max()
        .unwrap_or(0);
    let floor = best.saturating_sub(tie_tolerance);

    candidates.sort_by(|a, b| {
        let a_band = a.quota_remaining >= floor;
        let b_band = b.quota_remaining >= floor;
        b_band
            .cmp(&a_band)
            .then_with(|| {
                if a_band && b_band {
                    a.last_used_at.cmp(&b.last_used_at)
                } else {
                    Ordering::Equal
                }
            })
            .then_with(|| b.quota_remaining.cmp(&a.quota_remaining))
            .then_with(|| a.id.cmp(&b.id))
    });
    candidates
}
