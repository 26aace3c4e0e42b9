//! Persistence collaborator for contact capability records.
//!
//! The polling core treats the store as externally synchronized: reads and
//! writes are individually atomic-enough, and the store owns row lifecycle
//! (creation on contact sync, deletion by the sync collaborator). The core
//! only reads staleness ordering and performs the three narrow writes below.

use async_trait::async_trait;

use crate::contact::{Capability, ContactRecord, PhoneNumber};
use crate::time::Timestamp;

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors surfaced by a [`CapabilityStore`] implementation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The backing store is not reachable right now.
    #[error("capability store is unavailable")]
    Unavailable,
    /// A staleness query failed.
    #[error("capability store query failed: {detail}")]
    Query { detail: String },
    /// A record update failed.
    #[error("capability store update failed: {detail}")]
    Update { detail: String },
}

impl StoreError {
    pub fn query(detail: impl Into<String>) -> Self {
        Self::Query {
            detail: detail.into(),
        }
    }

    pub fn update(detail: impl Into<String>) -> Self {
        Self::Update {
            detail: detail.into(),
        }
    }
}

/// Persistent per-contact record of last-known capability state.
#[async_trait]
pub trait CapabilityStore: Send + Sync + 'static {
    /// All pollable contacts, ordered by `last_update` ascending — the most
    /// stale record first. Never-polled records ([`Timestamp::ZERO`]) sort
    /// at the front.
    async fn stale_contacts(&self) -> StoreResult<Vec<ContactRecord>>;

    /// Refresh `last_update` on the given records so they are not
    /// immediately re-selected as most stale. Returns the affected count.
    async fn touch_last_update(
        &self,
        numbers: &[PhoneNumber],
        at: Timestamp,
    ) -> StoreResult<u64>;

    /// Downgrade one capability to unavailable without a network round-trip.
    /// Used when a cached entry outlives the configured expiration. Returns
    /// the affected count.
    async fn expire_capability(
        &self,
        number: &PhoneNumber,
        capability: Capability,
        at: Timestamp,
    ) -> StoreResult<u64>;

    /// Reset every record's capability fields to unknown. Runs on SIM or
    /// provisioning resets, where cached state belongs to the wrong
    /// subscription.
    async fn reset_all_to_unknown(&self) -> StoreResult<()>;
}
