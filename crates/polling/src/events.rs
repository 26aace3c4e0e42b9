//! Scheduler event mailbox.
//!
//! Every external signal, alarm firing, and batch outcome reaches the
//! scheduler through one ordered, single-consumer mailbox. Host-facing
//! events coalesce: posting an event whose kind is already pending merges
//! into the pending entry instead of queueing a duplicate, so a burst of
//! identical triggers produces one scheduling decision. Internal events
//! (alarm fires, batch outcomes) are never coalesced — each one is a
//! distinct fact the actor must see.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use presence_core::{PhoneNumber, PublishState};
use tokio::sync::Notify;
use tracing::trace;

use crate::executor::BatchOutcome;
use crate::task::{PollKind, TaskId};

/// Events processed by the scheduler actor, one at a time, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollingEvent {
    /// Host-requested discovery pass.
    Discovery { kind: PollKind },
    /// New contacts appeared in the store.
    NewContacts { numbers: Vec<PhoneNumber> },
    /// Provisioning values may have changed; reload configuration.
    SettingsChanged,
    /// Provisioning state of presence services changed.
    ProvisioningChanged,
    /// A new SIM finished loading; cached capability state is void.
    SimLoaded,
    /// The presence stack came up.
    ServiceAvailable,
    /// The presence stack went down.
    ServiceUnavailable,
    /// Own-presence publish state changed.
    PublishStateChanged { state: PublishState },
    /// A confirmation pass was requested after an incomplete drain.
    VerifyRequested { count: u32 },
    /// Internal: the discovery alarm fired.
    DiscoveryDue { kind: PollKind },
    /// Internal: a task's retry alarm fired.
    RetryDue { task: TaskId },
    /// Internal: a batch execution reached its terminal outcome.
    BatchDone { task: TaskId, outcome: BatchOutcome },
    /// Stop the actor.
    Shutdown,
}

/// Coalescing key; one pending entry per kind for host-facing events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EventKind {
    Discovery,
    NewContacts,
    SettingsChanged,
    ProvisioningChanged,
    SimLoaded,
    ServiceAvailable,
    ServiceUnavailable,
    PublishStateChanged,
    VerifyRequested,
    DiscoveryDue,
    RetryDue,
    BatchDone,
    Shutdown,
}

impl PollingEvent {
    fn kind(&self) -> EventKind {
        match self {
            Self::Discovery { .. } => EventKind::Discovery,
            Self::NewContacts { .. } => EventKind::NewContacts,
            Self::SettingsChanged => EventKind::SettingsChanged,
            Self::ProvisioningChanged => EventKind::ProvisioningChanged,
            Self::SimLoaded => EventKind::SimLoaded,
            Self::ServiceAvailable => EventKind::ServiceAvailable,
            Self::ServiceUnavailable => EventKind::ServiceUnavailable,
            Self::PublishStateChanged { .. } => EventKind::PublishStateChanged,
            Self::VerifyRequested { .. } => EventKind::VerifyRequested,
            Self::DiscoveryDue { .. } => EventKind::DiscoveryDue,
            Self::RetryDue { .. } => EventKind::RetryDue,
            Self::BatchDone { .. } => EventKind::BatchDone,
            Self::Shutdown => EventKind::Shutdown,
        }
    }

    /// Whether a pending event of the same kind absorbs this one.
    fn coalesces(&self) -> bool {
        !matches!(
            self.kind(),
            EventKind::DiscoveryDue | EventKind::RetryDue | EventKind::BatchDone
        )
    }

    /// Fold `newer` into an already-pending event of the same kind.
    fn absorb(&mut self, newer: PollingEvent) {
        match (self, newer) {
            // A burst of sync inserts must not lose contacts: union the lists.
            (Self::NewContacts { numbers }, Self::NewContacts { numbers: more }) => {
                for number in more {
                    if !numbers.contains(&number) {
                        numbers.push(number);
                    }
                }
            }
            // Payload-carrying kinds keep the latest payload.
            (slot, newer) => *slot = newer,
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    queue: VecDeque<PollingEvent>,
    closed: bool,
}

#[derive(Debug, Default)]
struct Shared {
    inner: Mutex<Inner>,
    notify: Notify,
}

/// Receiving half, owned by the scheduler actor.
#[derive(Debug)]
pub struct Mailbox {
    shared: Arc<Shared>,
}

/// Posting half. Cheap to clone; posts are fire-and-forget.
#[derive(Debug, Clone)]
pub struct EventSender {
    shared: Arc<Shared>,
}

/// Create a connected mailbox/sender pair.
#[must_use]
pub fn mailbox() -> (Mailbox, EventSender) {
    let shared = Arc::new(Shared::default());
    (
        Mailbox {
            shared: Arc::clone(&shared),
        },
        EventSender { shared },
    )
}

impl EventSender {
    /// Post an event. Dropped silently once the mailbox is closed.
    pub fn post(&self, event: PollingEvent) {
        {
            let mut inner = self.shared.inner.lock();
            if inner.closed {
                trace!(?event, "mailbox closed, dropping event");
                return;
            }
            if event.coalesces() {
                let kind = event.kind();
                if let Some(pending) = inner.queue.iter_mut().find(|e| e.kind() == kind) {
                    trace!(?kind, "coalescing into pending event");
                    pending.absorb(event);
                    return;
                }
            }
            inner.queue.push_back(event);
        }
        self.shared.notify.notify_one();
    }
}

impl Mailbox {
    /// Next event in arrival order; `None` once closed and drained.
    pub async fn recv(&self) -> Option<PollingEvent> {
        loop {
            {
                let mut inner = self.shared.inner.lock();
                if let Some(event) = inner.queue.pop_front() {
                    return Some(event);
                }
                if inner.closed {
                    return None;
                }
            }
            self.shared.notify.notified().await;
        }
    }

    /// Close the mailbox: pending events drain, new posts are dropped.
    pub fn close(&self) {
        self.shared.inner.lock().closed = true;
        self.shared.notify.notify_one();
    }
}

impl Drop for Mailbox {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn number(s: &str) -> PhoneNumber {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn events_arrive_in_post_order() {
        let (mailbox, sender) = mailbox();
        sender.post(PollingEvent::ServiceAvailable);
        sender.post(PollingEvent::SimLoaded);
        sender.post(PollingEvent::SettingsChanged);

        assert_eq!(mailbox.recv().await, Some(PollingEvent::ServiceAvailable));
        assert_eq!(mailbox.recv().await, Some(PollingEvent::SimLoaded));
        assert_eq!(mailbox.recv().await, Some(PollingEvent::SettingsChanged));
    }

    #[tokio::test]
    async fn identical_pending_events_coalesce() {
        let (mailbox, sender) = mailbox();
        sender.post(PollingEvent::SettingsChanged);
        sender.post(PollingEvent::SettingsChanged);
        sender.post(PollingEvent::SettingsChanged);
        mailbox.close();

        assert_eq!(mailbox.recv().await, Some(PollingEvent::SettingsChanged));
        assert_eq!(mailbox.recv().await, None);
    }

    #[tokio::test]
    async fn pending_verify_keeps_the_latest_count() {
        let (mailbox, sender) = mailbox();
        sender.post(PollingEvent::VerifyRequested { count: 1 });
        sender.post(PollingEvent::VerifyRequested { count: 3 });

        assert_eq!(
            mailbox.recv().await,
            Some(PollingEvent::VerifyRequested { count: 3 })
        );
    }

    #[tokio::test]
    async fn new_contact_bursts_union_their_numbers() {
        let (mailbox, sender) = mailbox();
        sender.post(PollingEvent::NewContacts {
            numbers: vec![number("+16505550100")],
        });
        sender.post(PollingEvent::NewContacts {
            numbers: vec![number("+16505550101"), number("+16505550100")],
        });

        assert_eq!(
            mailbox.recv().await,
            Some(PollingEvent::NewContacts {
                numbers: vec![number("+16505550100"), number("+16505550101")],
            })
        );
    }

    #[tokio::test]
    async fn internal_events_never_coalesce() {
        let (mailbox, sender) = mailbox();
        sender.post(PollingEvent::RetryDue { task: TaskId(1) });
        sender.post(PollingEvent::RetryDue { task: TaskId(1) });
        mailbox.close();

        assert_eq!(mailbox.recv().await, Some(PollingEvent::RetryDue { task: TaskId(1) }));
        assert_eq!(mailbox.recv().await, Some(PollingEvent::RetryDue { task: TaskId(1) }));
        assert_eq!(mailbox.recv().await, None);
    }

    #[tokio::test]
    async fn coalescing_preserves_the_pending_position() {
        let (mailbox, sender) = mailbox();
        sender.post(PollingEvent::SettingsChanged);
        sender.post(PollingEvent::SimLoaded);
        sender.post(PollingEvent::SettingsChanged);

        // The second SettingsChanged merged into the first slot; SimLoaded
        // still runs after it.
        assert_eq!(mailbox.recv().await, Some(PollingEvent::SettingsChanged));
        assert_eq!(mailbox.recv().await, Some(PollingEvent::SimLoaded));
    }

    #[tokio::test]
    async fn posts_after_close_are_dropped() {
        let (mailbox, sender) = mailbox();
        mailbox.close();
        sender.post(PollingEvent::SettingsChanged);
        assert_eq!(mailbox.recv().await, None);
    }

    #[tokio::test]
    async fn recv_wakes_on_late_post() {
        let (mailbox, sender) = mailbox();
        let waiter = tokio::spawn(async move { mailbox.recv().await });
        tokio::task::yield_now().await;
        sender.post(PollingEvent::SimLoaded);
        assert_eq!(waiter.await.unwrap(), Some(PollingEvent::SimLoaded));
    }
}
