//! Minimal end-to-end run against in-memory collaborators.
//!
//! ```sh
//! cargo run -p presence-polling --example discovery_demo
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use presence_core::{
    BatchSignal, CapabilityClient, CapabilityStore, ClientResult, ConfigProvider, ConfigResult,
    ContactId, ContactRecord, PhoneNumber, PollingConfig, ProvisioningState, PublishState,
    RequestId, StoreResult, SystemClock, Timestamp,
};
use presence_core::{Capability, Clock};
use presence_polling::PollerBuilder;
use tokio::sync::mpsc;

struct MemoryStore {
    records: Mutex<Vec<ContactRecord>>,
}

#[async_trait]
impl CapabilityStore for MemoryStore {
    async fn stale_contacts(&self) -> StoreResult<Vec<ContactRecord>> {
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
        Ok(affected)
    }

    async fn expire_capability(
        &self,
        _number: &PhoneNumber,
        _capability: Capability,
        _at: Timestamp,
    ) -> StoreResult<u64> {
        Ok(0)
    }

    async fn reset_all_to_unknown(&self) -> StoreResult<()> {
        Ok(())
    }
}

struct EchoClient {
    next: Mutex<u64>,
}

#[async_trait]
impl CapabilityClient for EchoClient {
    async fn is_available(&self) -> bool {
        true
    }

    async fn publish_state(&self) -> PublishState {
        PublishState::Ok
    }

    async fn request_batch(
        &self,
        addresses: Vec<String>,
        signals: mpsc::Sender<BatchSignal>,
    ) -> ClientResult<RequestId> {
        let request = {
            let mut next = self.next.lock();
            *next += 1;
            RequestId(*next)
        };
        println!("remote batch {request}: {addresses:?}");
        tokio::spawn(async move {
            let _ = signals.send(BatchSignal::Accepted { request }).await;
            tokio::time::sleep(Duration::from_millis(200)).await;
            let _ = signals.send(BatchSignal::Complete { request }).await;
        });
        Ok(request)
    }
}

struct DemoProvider;

#[async_trait]
impl ConfigProvider for DemoProvider {
    async fn load(&self) -> ConfigResult<PollingConfig> {
        // Lab intervals; the poller logs the test-profile switch.
        Ok(PollingConfig {
            poll_interval: Duration::from_secs(300),
            min_poll_interval: Duration::from_secs(30),
            ..PollingConfig::default()
        })
    }

    async fn provisioning_state(&self) -> ProvisioningState {
        ProvisioningState::Provisioned
    }
}

fn seed_records() -> Vec<ContactRecord> {
    let now = SystemClock.now();
    let ages = [
        ("+16505550100", Duration::from_secs(3_600)),
        ("+16505550101", Duration::from_secs(1_800)),
        ("+16505550102", Duration::from_secs(10)),
    ];
    ages.into_iter()
        .enumerate()
        .map(|(index, (number, age))| ContactRecord {
            id: ContactId(index as u64),
            number: number.parse().expect("valid number"),
            display_name: None,
            last_update: now.saturating_sub(age),
            capabilities: Default::default(),
        })
        .collect()
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "debug".into()),
        )
        .init();

    let store = Arc::new(MemoryStore {
        records: Mutex::new(seed_records()),
    });
    let client = Arc::new(EchoClient {
        next: Mutex::new(0),
    });

    let handle = PollerBuilder::new(store, client, Arc::new(DemoProvider))
        .jitter_seed(0x5eed)
        .start()
        .await;

    handle.notify_service_available();
    handle.enqueue_provisioning_changed();

    // Give the discovery pass and the remote round-trip time to play out.
    tokio::time::sleep(Duration::from_secs(2)).await;
    handle.shutdown().await;
}
