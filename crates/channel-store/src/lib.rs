//! Durable storage for channel records
//!
//! The store is the system of record for credential values and quota
//! counters across process restarts. The pool keeps an in-memory cache and
//! writes to the store through the partial-update methods on `ChannelStore`,
//! so a credential refresh never clobbers a concurrent quota flush and vice
//! versa.

pub mod error;
pub mod json;
pub mod record;

pub use error::{Error, Result};
pub use json::JsonChannelStore;
pub use record::{ChannelRecord, HealthRecord, QuotaRecord};

use std::future::Future;
use std::pin::Pin;

use channel_auth::Credential;

/// Boxed future returned by `ChannelStore` methods.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Storage collaborator for channel records.
///
/// Every `update_*` method touches only its own field group and fails with
/// `NotFound` when the channel has never been saved.
pub trait ChannelStore: Send + Sync {
    /// Load a channel record, `None` if it was never saved.
    fn load_channel<'a>(&'a self, channel_id: &'a str) -> StoreFuture<'a, Option<ChannelRecord>>;

    /// Insert or replace a whole record.
    fn save_channel(&self, record: ChannelRecord) -> StoreFuture<'_, ()>;

    fn update_credential<'a>(
        &'a self,
        channel_id: &'a str,
        credential: Credential,
    ) -> StoreFuture<'a, ()>;

    fn update_quota<'a>(&'a self, channel_id: &'a str, quota: QuotaRecord) -> StoreFuture<'a, ()>;

    fn update_health<'a>(&'a self, channel_id: &'a str, health: HealthRecord)
    -> StoreFuture<'a, ()>;

    /// Soft delete / reactivate. Records are never removed.
    fn set_active<'a>(&'a self, channel_id: &'a str, active: bool) -> StoreFuture<'a, ()>;
}
