//! # Presence Polling
//!
//! A retryable, rate-limited, de-duplicating batch scheduler for refreshing
//! remote presence/capability state about a contact list.
//!
//! ## Components
//!
//! - [`CapabilityPoller`]: top-level scheduler — readiness state machine,
//!   discovery passes over the capability store, one outstanding discovery
//!   alarm with jittered periodic re-arming
//! - [`PollQueue`]: priority-ordered task queue — de-duplicates in-flight
//!   contacts, splits oversized batches, serializes head-task execution,
//!   and tracks the verify-pass counter after incomplete drains
//! - [`PollTask`]: one unit of work with exponential-backoff retry state
//! - [`execute_batch`]: submits one task's batch to the remote service and
//!   awaits a terminal signal under a deadline
//!
//! ## Concurrency model
//!
//! A single actor task owns every piece of mutable scheduling state. External
//! signals, alarm firings, and batch outcomes all arrive through one
//! coalescing [`Mailbox`] and are processed in arrival order; the only
//! spawned workers are alarm sleeps and the head task's batch execution.
//!
//! ## Quick start
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use presence_polling::{PollerBuilder, PollKind};
//! # async fn example(
//! #     store: Arc<dyn presence_core::CapabilityStore>,
//! #     client: Arc<dyn presence_core::CapabilityClient>,
//! #     provider: Arc<dyn presence_core::ConfigProvider>,
//! # ) {
//! let poller = PollerBuilder::new(store, client, provider)
//!     .jitter_seed(0x5eed)
//!     .start()
//!     .await;
//!
//! poller.notify_service_available();
//! poller.enqueue_discovery(PollKind::Normal);
//! # }
//! ```

pub mod events;
pub mod executor;
pub mod jitter;
pub mod queue;
pub mod scheduler;
pub mod task;

pub use events::{EventSender, Mailbox, PollingEvent};
pub use executor::{BatchOutcome, execute_batch};
pub use jitter::Jitter;
pub use queue::{PollQueue, QueueEffect};
pub use scheduler::{CapabilityPoller, PollerBuilder, PollerHandle, Readiness};
pub use task::{PollKind, PollTask, RetryDecision, TaskId};
