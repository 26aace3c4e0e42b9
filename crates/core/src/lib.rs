//! # Presence Core
//!
//! Domain types and collaborator traits for the presence capability-polling
//! core. This crate defines everything the scheduler in `presence-polling`
//! consumes but does not own:
//!
//! - **Contacts**: [`PhoneNumber`] canonicalization, [`Capability`] kinds,
//!   [`ContactRecord`] / [`ContactSnapshot`] value types
//! - **Time**: [`Timestamp`] bookkeeping and the injectable [`Clock`]
//! - **Collaborators**: the [`CapabilityStore`] persistence trait and the
//!   [`CapabilityClient`] remote-query trait
//! - **Configuration**: [`PollingConfig`] with validation, production-floor
//!   profile detection, and the [`ConfigProvider`] trait
//!
//! The crate deliberately has no central error type: each concern carries its
//! own small `thiserror` enum ([`StoreError`], [`ClientError`],
//! [`ConfigError`], [`PhoneNumberError`]) and callers decide what is
//! recoverable.

pub mod client;
pub mod config;
pub mod contact;
pub mod store;
pub mod time;

pub use client::{
    BatchSignal, CapabilityClient, ClientError, ClientResult, PublishState, ReasonCode, RequestId,
};
pub use config::{
    ConfigError, ConfigProfile, ConfigProvider, ConfigResult, PollingConfig, ProvisioningState,
};
pub use contact::{
    Availability, Capability, CapabilityState, ContactId, ContactRecord, ContactSnapshot,
    PhoneNumber, PhoneNumberError,
};
pub use store::{CapabilityStore, StoreError, StoreResult};
pub use time::{Clock, SystemClock, Timestamp};

/// Common prelude for presence crates.
pub mod prelude {
    pub use crate::{
        Availability, BatchSignal, CapabilityClient, CapabilityStore, Capability, Clock,
        ConfigProvider, ContactRecord, ContactSnapshot, PhoneNumber, PollingConfig, PublishState,
        ReasonCode, RequestId, SystemClock, Timestamp,
    };
}
