//! Top-level capability-polling scheduler.
//!
//! [`CapabilityPoller`] decides *whether* and *when* a discovery pass runs.
//! It owns the readiness state machine (stack availability, publish state,
//! provisioning), the single outstanding discovery alarm, and the poll
//! queue. All of that state lives on one actor task fed by the coalescing
//! mailbox, so no scheduling decision ever races another.
//!
//! The poller is an explicitly constructed object: build it with
//! [`PollerBuilder`], inject the collaborators (and a clock/jitter seed for
//! deterministic tests), and keep the returned [`PollerHandle`] wherever the
//! host wires platform signals.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use presence_core::{
    Availability, Capability, CapabilityClient, CapabilityStore, Clock, ConfigProfile,
    ConfigProvider, ContactRecord, ContactSnapshot, PhoneNumber, PollingConfig, ProvisioningState,
    PublishState, SystemClock, Timestamp,
};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::events::{self, EventSender, Mailbox, PollingEvent};
use crate::executor::execute_batch;
use crate::jitter::Jitter;
use crate::queue::{PollQueue, QueueEffect};
use crate::task::{PollKind, TaskId};

/// Delay before a new-contact trigger runs discovery, giving a burst of
/// sync inserts time to land in the store.
const NEW_CONTACT_SETTLE_DELAY: Duration = Duration::from_secs(10);

/// Fixed re-try delay after a failed staleness query.
const STORE_FAILURE_RETRY_DELAY: Duration = Duration::from_secs(300);

/// Base delay of the verify-pass ladder: `30s × 2^(count−1)`.
const VERIFY_BASE_DELAY: Duration = Duration::from_secs(30);

/// Cap on the verify-delay exponent; the counter itself never resets while
/// confirmations keep failing, so the shift must stay bounded.
const VERIFY_DELAY_MAX_SHIFT: u32 = 20;

/// Contacts whose records have gone unmaintained for longer than this are
/// left alone by the local-expiry sweep.
const OBSOLETE_CONTACT_HORIZON: Duration = Duration::from_secs(3 * 365 * 24 * 3_600);

/// Conjunction of the three conditions that gate all polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    /// The presence stack is reachable at all.
    pub stack_available: bool,
    /// Own presence is published.
    pub publish: PublishState,
    /// Presence services are provisioned for this subscription.
    pub provisioning: ProvisioningState,
}

impl Readiness {
    #[must_use]
    pub fn unknown() -> Self {
        Self {
            stack_available: false,
            publish: PublishState::Unknown,
            provisioning: ProvisioningState::Unknown,
        }
    }

    /// Polling is permitted only when every flag answers yes.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.stack_available
            && self.publish == PublishState::Ok
            && self.provisioning == ProvisioningState::Provisioned
    }
}

impl Default for Readiness {
    fn default() -> Self {
        Self::unknown()
    }
}

impl fmt::Display for Readiness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "stack={} publish={} provisioning={}",
            self.stack_available, self.publish, self.provisioning
        )
    }
}

/// The single outstanding discovery alarm.
#[derive(Debug)]
struct DiscoveryAlarm {
    deadline: Instant,
    handle: AbortHandle,
}

/// Builder for [`CapabilityPoller`].
pub struct PollerBuilder {
    store: Arc<dyn CapabilityStore>,
    client: Arc<dyn CapabilityClient>,
    provider: Arc<dyn ConfigProvider>,
    clock: Arc<dyn Clock>,
    jitter: Jitter,
}

impl PollerBuilder {
    #[must_use]
    pub fn new(
        store: Arc<dyn CapabilityStore>,
        client: Arc<dyn CapabilityClient>,
        provider: Arc<dyn ConfigProvider>,
    ) -> Self {
        Self {
            store,
            client,
            provider,
            clock: Arc::new(SystemClock),
            jitter: Jitter::new(),
        }
    }

    /// Replace the wall clock (tests inject a manual clock).
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Seed the jitter source for a replayable schedule.
    #[must_use]
    pub fn jitter_seed(mut self, seed: u64) -> Self {
        self.jitter = Jitter::with_seed(seed);
        self
    }

    /// Load configuration, spawn the scheduler actor, and hand back the
    /// host-facing handle. Polling stays dormant until readiness signals
    /// arrive through the handle.
    pub async fn start(self) -> PollerHandle {
        let config = load_or_default(self.provider.as_ref()).await;
        let profile = config.profile();
        if profile == ConfigProfile::Test {
            warn!("configuration below production floors, running the test profile");
        }

        let (mailbox, sender) = events::mailbox();
        let queue = PollQueue::new(config.max_entries_per_request);
        let poller = CapabilityPoller {
            store: self.store,
            client: self.client,
            provider: self.provider,
            clock: self.clock,
            jitter: self.jitter,
            config,
            profile,
            readiness: Readiness::unknown(),
            queue,
            discovery_alarm: None,
            sender: sender.clone(),
            shutdown: CancellationToken::new(),
        };
        let join = tokio::spawn(poller.run(mailbox));
        PollerHandle { sender, join }
    }
}

impl fmt::Debug for PollerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PollerBuilder").finish_non_exhaustive()
    }
}

/// Host-facing handle to a running poller.
///
/// Every operation is a fire-and-forget event post; identically-kinded
/// pending events coalesce in the mailbox.
#[derive(Debug)]
pub struct PollerHandle {
    sender: EventSender,
    join: JoinHandle<()>,
}

impl PollerHandle {
    /// Request a discovery pass now.
    pub fn enqueue_discovery(&self, kind: PollKind) {
        self.sender.post(PollingEvent::Discovery { kind });
    }

    /// A contact-sync insert produced a new contact.
    pub fn enqueue_new_contact(&self, number: PhoneNumber) {
        self.sender.post(PollingEvent::NewContacts {
            numbers: vec![number],
        });
    }

    /// Provisioning values may have changed; reload configuration.
    pub fn enqueue_settings_changed(&self) {
        self.sender.post(PollingEvent::SettingsChanged);
    }

    /// Provisioning state of presence services changed.
    pub fn enqueue_provisioning_changed(&self) {
        self.sender.post(PollingEvent::ProvisioningChanged);
    }

    /// A new SIM finished loading.
    pub fn enqueue_sim_loaded(&self) {
        self.sender.post(PollingEvent::SimLoaded);
    }

    /// Request a confirmation pass with the verify ladder delay for `count`.
    pub fn enqueue_verify(&self, count: u32) {
        self.sender.post(PollingEvent::VerifyRequested { count });
    }

    /// The presence stack came up.
    pub fn notify_service_available(&self) {
        self.sender.post(PollingEvent::ServiceAvailable);
    }

    /// The presence stack went down.
    pub fn notify_service_unavailable(&self) {
        self.sender.post(PollingEvent::ServiceUnavailable);
    }

    /// Own-presence publish state changed.
    pub fn notify_publish_state(&self, state: PublishState) {
        self.sender.post(PollingEvent::PublishStateChanged { state });
    }

    /// Stop the actor. In-flight work is abandoned, not drained.
    pub async fn shutdown(self) {
        self.sender.post(PollingEvent::Shutdown);
        let _ = self.join.await;
    }
}

/// Top-level scheduler actor. See the module docs for the state it owns.
pub struct CapabilityPoller {
    store: Arc<dyn CapabilityStore>,
    client: Arc<dyn CapabilityClient>,
    provider: Arc<dyn ConfigProvider>,
    clock: Arc<dyn Clock>,
    jitter: Jitter,
    config: PollingConfig,
    profile: ConfigProfile,
    readiness: Readiness,
    queue: PollQueue,
    discovery_alarm: Option<DiscoveryAlarm>,
    sender: EventSender,
    shutdown: CancellationToken,
}

impl fmt::Debug for CapabilityPoller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilityPoller")
            .field("readiness", &self.readiness)
            .field("profile", &self.profile)
            .field("queued", &self.queue.len())
            .finish_non_exhaustive()
    }
}

impl CapabilityPoller {
    async fn run(mut self, mailbox: Mailbox) {
        info!(profile = ?self.profile, "capability poller started");
        while let Some(event) = mailbox.recv().await {
            if matches!(event, PollingEvent::Shutdown) {
                break;
            }
            self.handle(event).await;
        }
        self.shutdown.cancel();
        self.cancel_discovery_alarm();
        self.queue.clear();
        mailbox.close();
        info!("capability poller stopped");
    }

    async fn handle(&mut self, event: PollingEvent) {
        match event {
            PollingEvent::Discovery { kind } => {
                self.schedule_discovery(Duration::ZERO, kind);
            }
            PollingEvent::DiscoveryDue { kind } => {
                self.discovery_alarm = None;
                self.run_discovery(kind).await;
            }
            PollingEvent::NewContacts { numbers } => {
                info!(count = numbers.len(), "new contacts reported");
                self.schedule_discovery(NEW_CONTACT_SETTLE_DELAY, PollKind::NewContacts);
            }
            PollingEvent::SettingsChanged => self.reload_config().await,
            PollingEvent::ProvisioningChanged => {
                let was_ready = self.readiness.is_ready();
                self.readiness.provisioning = self.provider.provisioning_state().await;
                self.apply_readiness(was_ready);
            }
            PollingEvent::SimLoaded => {
                info!("sim loaded, resetting cached capabilities");
                if let Err(error) = self.store.reset_all_to_unknown().await {
                    warn!(%error, "capability reset failed");
                }
                self.schedule_discovery(Duration::ZERO, PollKind::Normal);
            }
            PollingEvent::ServiceAvailable => {
                let was_ready = self.readiness.is_ready();
                self.readiness.stack_available = true;
                self.readiness.publish = self.client.publish_state().await;
                self.apply_readiness(was_ready);
            }
            PollingEvent::ServiceUnavailable => {
                let was_ready = self.readiness.is_ready();
                self.readiness.stack_available = false;
                self.apply_readiness(was_ready);
            }
            PollingEvent::PublishStateChanged { state } => {
                let was_ready = self.readiness.is_ready();
                self.readiness.publish = state;
                self.apply_readiness(was_ready);
            }
            PollingEvent::VerifyRequested { count } => {
                self.schedule_discovery(verify_delay(count), PollKind::Normal);
            }
            PollingEvent::RetryDue { task } => {
                let effects = self.queue.retry_due(task);
                self.apply_effects(effects).await;
            }
            PollingEvent::BatchDone { task, outcome } => {
                let effects = self.queue.on_batch_outcome(task, outcome);
                self.apply_effects(effects).await;
            }
            PollingEvent::Shutdown => {}
        }
    }

    /// React to a readiness flag change.
    fn apply_readiness(&mut self, was_ready: bool) {
        let ready = self.readiness.is_ready();
        if !was_ready && ready {
            info!(readiness = %self.readiness, "polling readiness gained");
            self.schedule_discovery(Duration::ZERO, PollKind::Normal);
        } else if was_ready && !ready {
            info!(readiness = %self.readiness, "polling readiness lost, abandoning queued work");
            self.cancel_discovery_alarm();
            self.queue.clear();
        }
    }

    async fn reload_config(&mut self) {
        let config = load_or_default(self.provider.as_ref()).await;
        let profile = config.profile();
        if profile != self.profile {
            warn!(?profile, "configuration profile changed");
        }
        self.config = config;
        self.profile = profile;
        self.queue.set_max_entries(self.config.max_entries_per_request);

        if self.config.polling_enabled {
            self.schedule_discovery(Duration::ZERO, PollKind::Normal);
        } else {
            info!("polling disabled by configuration");
            self.cancel_discovery_alarm();
            self.queue.clear();
        }
    }

    /// Arm the discovery alarm.
    ///
    /// A new-contacts request replaces the periodic timer outright;
    /// otherwise an already-armed earlier deadline survives and a later one
    /// is ignored. Zero delay runs the pass on the next mailbox turn
    /// instead of arming a timer.
    fn schedule_discovery(&mut self, delay: Duration, kind: PollKind) {
        if !self.config.polling_enabled {
            debug!("polling disabled, discovery not scheduled");
            return;
        }
        if !self.readiness.is_ready() {
            debug!(readiness = %self.readiness, "not ready, discovery not scheduled");
            return;
        }
        if kind == PollKind::NewContacts {
            self.cancel_discovery_alarm();
        }

        let deadline = Instant::now() + delay;
        if let Some(alarm) = &self.discovery_alarm {
            if alarm.deadline <= deadline {
                debug!(%kind, "an earlier discovery is already armed");
                return;
            }
        }
        self.cancel_discovery_alarm();

        if delay.is_zero() {
            self.sender.post(PollingEvent::DiscoveryDue { kind });
            return;
        }
        debug!(?delay, %kind, "discovery armed");
        let sender = self.sender.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            sender.post(PollingEvent::DiscoveryDue { kind });
        })
        .abort_handle();
        self.discovery_alarm = Some(DiscoveryAlarm { deadline, handle });
    }

    fn cancel_discovery_alarm(&mut self) {
        if let Some(alarm) = self.discovery_alarm.take() {
            alarm.handle.abort();
        }
    }

    /// One discovery pass: scan the store for due records, expire obsolete
    /// cache entries locally, re-arm the periodic pass, and enqueue the due
    /// batch.
    async fn run_discovery(&mut self, kind: PollKind) {
        if !self.config.polling_enabled || !self.readiness.is_ready() {
            debug!("discovery pass skipped, polling gated off");
            return;
        }
        debug!(%kind, "discovery pass started");
        let now = self.clock.now();

        let records = match self.store.stale_contacts().await {
            Ok(records) => records,
            Err(error) => {
                warn!(%error, "staleness query failed, retrying later");
                self.schedule_discovery(STORE_FAILURE_RETRY_DELAY, kind);
                return;
            }
        };

        let (due, next_delay) = select_due(
            &records,
            now,
            self.config.due_threshold(),
            self.config.poll_interval,
            &mut self.jitter,
        );

        for (number, capability) in select_obsolete(&records, now, self.config.cache_expiration) {
            debug!(%number, %capability, "cached capability expired locally");
            if let Err(error) = self.store.expire_capability(&number, capability, now).await {
                warn!(%error, %number, "local capability expiry failed");
            }
        }

        let delay =
            next_delay.unwrap_or_else(|| self.jitter.interval(self.config.poll_interval));
        self.schedule_discovery(delay, PollKind::Normal);

        if due.is_empty() {
            debug!("no contacts due");
        } else {
            info!(count = due.len(), %kind, "contacts due for capability polling");
            let effects = self.queue.add(kind, due);
            self.apply_effects(effects).await;
        }
    }

    async fn apply_effects(&mut self, effects: Vec<QueueEffect>) {
        for effect in effects {
            match effect {
                QueueEffect::Execute(task) => self.spawn_execution(task),
                QueueEffect::ArmRetry { task, delay } => self.arm_retry(task, delay),
                QueueEffect::ScheduleVerify { count } => {
                    info!(count, "scheduling verify pass after incomplete drain");
                    self.schedule_discovery(verify_delay(count), PollKind::Normal);
                }
                QueueEffect::TouchRecords(numbers) => {
                    let now = self.clock.now();
                    if let Err(error) = self.store.touch_last_update(&numbers, now).await {
                        warn!(%error, "timestamp refresh failed");
                    }
                }
            }
        }
    }

    /// Run the head task's batch on its own task; the outcome comes back
    /// through the mailbox.
    fn spawn_execution(&self, id: TaskId) {
        let Some(task) = self.queue.task(id) else {
            return;
        };
        let numbers = task.numbers();
        let client = Arc::clone(&self.client);
        let expiry = self.config.list_subscription_expiry;
        let sender = self.sender.clone();
        let shutdown = self.shutdown.child_token();
        tokio::spawn(async move {
            let outcome = execute_batch(id, numbers, client, expiry, shutdown).await;
            sender.post(PollingEvent::BatchDone { task: id, outcome });
        });
    }

    fn arm_retry(&mut self, id: TaskId, delay: Duration) {
        let sender = self.sender.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            sender.post(PollingEvent::RetryDue { task: id });
        })
        .abort_handle();
        self.queue.set_retry_alarm(id, handle);
    }
}

async fn load_or_default(provider: &dyn ConfigProvider) -> PollingConfig {
    let loaded = match provider.load().await {
        Ok(config) => config,
        Err(error) => {
            warn!(%error, "configuration load failed, using defaults");
            return PollingConfig::default();
        }
    };
    match loaded.validate() {
        Ok(()) => loaded,
        Err(error) => {
            warn!(%error, "configuration rejected, using defaults");
            PollingConfig::default()
        }
    }
}

/// Delay of the verify ladder for the given counter value.
fn verify_delay(count: u32) -> Duration {
    let exponent = count.saturating_sub(1).min(VERIFY_DELAY_MAX_SHIFT);
    VERIFY_BASE_DELAY.saturating_mul(1u32 << exponent)
}

/// Walk records ordered by staleness: everything at or past the due
/// threshold (or behind a skewed clock) joins the batch; the first not-due
/// record fixes the delay until the next pass and ends the scan, since all
/// later records are fresher still.
fn select_due(
    records: &[ContactRecord],
    now: Timestamp,
    due_threshold: Duration,
    poll_interval: Duration,
    jitter: &mut Jitter,
) -> (Vec<ContactSnapshot>, Option<Duration>) {
    let threshold = due_threshold.as_millis() as i64;
    let mut due = Vec::new();
    for record in records {
        let elapsed = now.elapsed_since(record.last_update);
        if elapsed < 0 || elapsed >= threshold {
            due.push(record.snapshot());
        } else {
            let jittered = jitter.interval(poll_interval);
            let remaining = jittered.saturating_sub(Duration::from_millis(elapsed as u64));
            return (due, Some(remaining));
        }
    }
    (due, None)
}

/// Cached capability entries older than the expiration, on contacts still
/// maintained within the horizon, expire locally instead of waiting for a
/// failed poll.
fn select_obsolete(
    records: &[ContactRecord],
    now: Timestamp,
    cache_expiration: Duration,
) -> Vec<(PhoneNumber, Capability)> {
    let expiration = cache_expiration.as_millis() as i64;
    let horizon = OBSOLETE_CONTACT_HORIZON.as_millis() as i64;
    let mut expired = Vec::new();
    for record in records {
        let contact_age = now.elapsed_since(record.last_update);
        if !(0..=horizon).contains(&contact_age) {
            continue;
        }
        for (capability, state) in &record.capabilities {
            if state.availability == Availability::Available
                && !state.updated.is_zero()
                && now.elapsed_since(state.updated) >= expiration
            {
                expired.push((record.number.clone(), *capability));
            }
        }
    }
    expired
}
