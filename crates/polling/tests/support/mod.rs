//! Scenario fixtures: in-memory collaborators with scripted behavior.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use presence_core::{
    BatchSignal, Capability, CapabilityClient, CapabilityStore, ClientError, ClientResult, Clock,
    ConfigError, ConfigProvider, ConfigResult, ContactRecord, PhoneNumber, PollingConfig,
    ProvisioningState, PublishState, ReasonCode, RequestId, StoreError, StoreResult, Timestamp,
};
use tokio::sync::{Notify, mpsc};

/// A fixed "wall clock" base for record timestamps.
pub const NOW_MS: i64 = 1_700_000_000_000;

/// Manually driven wall clock.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<i64>,
}

impl ManualClock {
    pub fn at(millis: i64) -> Arc<Self> {
        Arc::new(Self {
            now: Mutex::new(millis),
        })
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        Timestamp::from_millis(*self.now.lock())
    }
}

/// In-memory capability store honoring the staleness-ordering contract.
#[derive(Default)]
pub struct FakeStore {
    pub records: Mutex<Vec<ContactRecord>>,
    pub touched: Mutex<Vec<(Vec<PhoneNumber>, Timestamp)>>,
    pub expired: Mutex<Vec<(PhoneNumber, Capability)>>,
    pub resets: Mutex<u32>,
    pub queries: Mutex<u32>,
    pub fail_queries: Mutex<bool>,
    notify: Notify,
}

impl FakeStore {
    pub fn with_records(records: Vec<ContactRecord>) -> Arc<Self> {
        let store = Self::default();
        *store.records.lock() = records;
        Arc::new(store)
    }

    pub fn insert(&self, record: ContactRecord) {
        self.records.lock().push(record);
    }

    pub fn query_count(&self) -> u32 {
        *self.queries.lock()
    }

    /// Wait until at least `n` staleness queries have run.
    pub async fn wait_queries(&self, n: u32) {
        loop {
            if *self.queries.lock() >= n {
                return;
            }
            self.notify.notified().await;
        }
    }

    /// Wait until at least `n` timestamp refreshes have run.
    pub async fn wait_touched(&self, n: usize) {
        loop {
            if self.touched.lock().len() >= n {
                return;
            }
            self.notify.notified().await;
        }
    }

    /// Wait until at least `n` local capability expiries have run.
    pub async fn wait_expired(&self, n: usize) {
        loop {
            if self.expired.lock().len() >= n {
                return;
            }
            self.notify.notified().await;
        }
    }
}

#[async_trait]
impl CapabilityStore for FakeStore {
    async fn stale_contacts(&self) -> StoreResult<Vec<ContactRecord>> {
        *self.queries.lock() += 1;
        self.notify.notify_one();
        if *self.fail_queries.lock() {
            return Err(StoreError::query("scripted failure"));
        }
        let mut records = self.records.lock().clone();
        records.sort_by_key(|r| r.last_update);
        Ok(records)
    }

    async fn touch_last_update(
        &self,
        numbers: &[PhoneNumber],
        at: Timestamp,
    ) -> StoreResult<u64> {
        let mut affected = 0;
        for record in self.records.lock().iter_mut() {
            if numbers.contains(&record.number) {
                record.last_update = at;
                affected += 1;
            }
        }
        self.touched.lock().push((numbers.to_vec(), at));
        self.notify.notify_one();
        Ok(affected)
    }

    async fn expire_capability(
        &self,
        number: &PhoneNumber,
        capability: Capability,
        at: Timestamp,
    ) -> StoreResult<u64> {
        let mut affected = 0;
        for record in self.records.lock().iter_mut() {
            if &record.number == number {
                if let Some(state) = record.capabilities.get_mut(&capability) {
                    state.availability = presence_core::Availability::Unavailable;
                    state.updated = at;
                    affected += 1;
                }
            }
        }
        self.expired.lock().push((number.clone(), capability));
        self.notify.notify_one();
        Ok(affected)
    }

    async fn reset_all_to_unknown(&self) -> StoreResult<()> {
        *self.resets.lock() += 1;
        for record in self.records.lock().iter_mut() {
            for state in record.capabilities.values_mut() {
                state.availability = presence_core::Availability::Unknown;
            }
        }
        self.notify.notify_one();
        Ok(())
    }
}

/// Per-request behavior of the fake remote service.
#[derive(Debug, Clone, Copy)]
pub enum ClientScript {
    /// Accept then complete the batch.
    Complete,
    /// Fail with a hard (non-retryable) code.
    FailHard,
    /// Fail with the transient subscribe code.
    FailTemporary,
    /// Reject the submission synchronously.
    RejectSubmit,
    /// Accept and never answer; the channel stays open.
    Silence,
}

/// Scripted remote capability service.
pub struct FakeClient {
    pub scripts: Mutex<VecDeque<ClientScript>>,
    pub requests: Mutex<Vec<Vec<String>>>,
    pub publish: Mutex<PublishState>,
    next_request: Mutex<u64>,
    /// Keeps silenced requests' signal channels open — field exists for its
    /// RAII effect and is never read.
    #[allow(dead_code)]
    held: Mutex<Vec<mpsc::Sender<BatchSignal>>>,
    notify: Notify,
}

impl Default for FakeClient {
    fn default() -> Self {
        Self {
            scripts: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            publish: Mutex::new(PublishState::Ok),
            next_request: Mutex::new(0),
            held: Mutex::new(Vec::new()),
            notify: Notify::new(),
        }
    }
}

impl FakeClient {
    pub fn scripted(scripts: impl IntoIterator<Item = ClientScript>) -> Arc<Self> {
        let client = Self::default();
        *client.scripts.lock() = scripts.into_iter().collect();
        Arc::new(client)
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn request(&self, index: usize) -> Vec<String> {
        self.requests.lock()[index].clone()
    }

    /// Wait until at least `n` batch requests have been submitted.
    pub async fn wait_requests(&self, n: usize) {
        loop {
            if self.requests.lock().len() >= n {
                return;
            }
            self.notify.notified().await;
        }
    }
}

#[async_trait]
impl CapabilityClient for FakeClient {
    async fn is_available(&self) -> bool {
        true
    }

    async fn publish_state(&self) -> PublishState {
        *self.publish.lock()
    }

    async fn request_batch(
        &self,
        addresses: Vec<String>,
        signals: mpsc::Sender<BatchSignal>,
    ) -> ClientResult<RequestId> {
        let script = self
            .scripts
            .lock()
            .pop_front()
            .unwrap_or(ClientScript::Complete);
        self.requests.lock().push(addresses);
        self.notify.notify_one();

        let request = {
            let mut next = self.next_request.lock();
            *next += 1;
            RequestId(*next)
        };
        match script {
            ClientScript::RejectSubmit => {
                return Err(ClientError::Rejected {
                    code: ReasonCode::BAD_REQUEST,
                });
            }
            ClientScript::Silence => {
                self.held.lock().push(signals);
            }
            ClientScript::Complete => {
                tokio::spawn(async move {
                    let _ = signals.send(BatchSignal::Accepted { request }).await;
                    let _ = signals.send(BatchSignal::Complete { request }).await;
                });
            }
            ClientScript::FailHard => {
                tokio::spawn(async move {
                    let _ = signals
                        .send(BatchSignal::Failed {
                            code: ReasonCode::FORBIDDEN,
                        })
                        .await;
                });
            }
            ClientScript::FailTemporary => {
                tokio::spawn(async move {
                    let _ = signals
                        .send(BatchSignal::Failed {
                            code: ReasonCode::SUBSCRIBE_TEMPORARY,
                        })
                        .await;
                });
            }
        }
        Ok(request)
    }
}

/// Scripted provisioning source.
pub struct FakeProvider {
    pub config: Mutex<PollingConfig>,
    pub provisioning: Mutex<ProvisioningState>,
    pub fail_load: Mutex<bool>,
}

impl FakeProvider {
    pub fn provisioned(config: PollingConfig) -> Arc<Self> {
        Arc::new(Self {
            config: Mutex::new(config),
            provisioning: Mutex::new(ProvisioningState::Provisioned),
            fail_load: Mutex::new(false),
        })
    }
}

#[async_trait]
impl ConfigProvider for FakeProvider {
    async fn load(&self) -> ConfigResult<PollingConfig> {
        if *self.fail_load.lock() {
            return Err(ConfigError::source("scripted failure"));
        }
        Ok(self.config.lock().clone())
    }

    async fn provisioning_state(&self) -> ProvisioningState {
        *self.provisioning.lock()
    }
}

/// A lab-profile configuration with short, test-friendly intervals.
pub fn lab_config() -> PollingConfig {
    PollingConfig {
        poll_interval: Duration::from_secs(600),
        min_poll_interval: Duration::from_secs(60),
        list_subscription_expiry: Duration::from_secs(30),
        ..PollingConfig::default()
    }
}

/// A record last polled `age` before [`NOW_MS`].
pub fn record_with_age(number: &str, age: Duration) -> ContactRecord {
    ContactRecord {
        id: presence_core::ContactId(0),
        number: number.parse().expect("valid number"),
        display_name: None,
        last_update: Timestamp::from_millis(NOW_MS - age.as_millis() as i64),
        capabilities: Default::default(),
    }
}

/// A record that has never been polled.
pub fn new_record(number: &str) -> ContactRecord {
    ContactRecord {
        id: presence_core::ContactId(0),
        number: number.parse().expect("valid number"),
        display_name: None,
        last_update: Timestamp::ZERO,
        capabilities: Default::default(),
    }
}
