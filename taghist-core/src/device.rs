//! Device connection registry: one lazily-created client per source key,
//! serialized by a per-source lock, reused across poll cycles.

use async_trait::async_trait;
use dashmap::DashMap;
use std::{collections::HashMap, sync::Arc};
use taghist_error::{THError, THResult};
use taghist_models::SourceSpec;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Black-box connection to one controller. Implementations are not assumed
/// to be safe for concurrent reads; the registry serializes access.
#[async_trait]
pub trait DeviceClient: Send {
    async fn open(&mut self) -> THResult<()>;
    async fn read(&mut self, block: u16, offset: u32, length: u32) -> THResult<Vec<u8>>;
    async fn close(&mut self);
}

/// Creates a client for a source. Injected at construction so transports
/// stay out of the core (the binary wires the simulator, integrations wire
/// a real PLC transport).
pub type ClientFactory = Arc<dyn Fn(&SourceSpec) -> Box<dyn DeviceClient> + Send + Sync>;

struct SourceSlot {
    spec: SourceSpec,
    /// Exclusivity lock: at most one in-flight read per source.
    client: Mutex<Option<Box<dyn DeviceClient>>>,
}

/// Owns one logical connection per physical source and the configured
/// source table consulted by the address parser.
pub struct SourceRegistry {
    configured: DashMap<String, SourceSpec>,
    slots: DashMap<String, Arc<SourceSlot>>,
    factory: ClientFactory,
}

impl SourceRegistry {
    pub fn new(sources: HashMap<String, SourceSpec>, factory: ClientFactory) -> Self {
        let configured = DashMap::new();
        for (key, spec) in sources {
            configured.insert(key, spec);
        }
        Self {
            configured,
            slots: DashMap::new(),
            factory,
        }
    }

    /// Whether a source key is present in the configured table. Consulted
    /// at tag-name parse time; unknown keys exclude the tag from polling.
    pub fn contains(&self, key: &str) -> bool {
        self.configured.contains_key(key)
    }

    /// Replace the configured source table. Cached connections are dropped
    /// so the next poll reconnects with the fresh endpoints.
    pub fn update_sources(&self, sources: HashMap<String, SourceSpec>) {
        self.configured.clear();
        for (key, spec) in sources {
            self.configured.insert(key, spec);
        }
        self.slots.clear();
        info!(sources = self.configured.len(), "source table refreshed");
    }

    fn slot(&self, key: &str) -> Arc<SourceSlot> {
        self.slots
            .entry(key.to_string())
            .or_insert_with(|| {
                let spec = self
                    .configured
                    .get(key)
                    .map(|s| s.clone())
                    // Unconfigured key: treat the key itself as the address.
                    .unwrap_or_else(|| SourceSpec::synthesized(key));
                Arc::new(SourceSlot {
                    spec,
                    client: Mutex::new(None),
                })
            })
            .clone()
    }

    /// Run the given window reads against one source under its exclusivity
    /// lock, opening the connection first if needed.
    ///
    /// An open failure fails the whole call (the scheduler skips every
    /// window of that source for this cycle). Individual read failures are
    /// reported per window; retry policy lives with the caller — the next
    /// poll cycle is the retry.
    pub async fn read_windows(
        &self,
        key: &str,
        requests: &[(u16, u32, u32)],
    ) -> THResult<Vec<THResult<Vec<u8>>>> {
        let slot = self.slot(key);
        let mut guard = slot.client.lock().await;

        if guard.is_none() {
            debug!(source = %key, host = %slot.spec.host, "opening device connection");
            let mut client = (self.factory)(&slot.spec);
            if let Err(e) = client.open().await {
                return Err(THError::SourceUnreachable(format!("{key}: {e}")));
            }
            *guard = Some(client);
        }
        let client = match guard.as_mut() {
            Some(client) => client,
            None => return Err(THError::ServiceUnavailable),
        };

        let mut results = Vec::with_capacity(requests.len());
        for &(block, offset, length) in requests {
            results.push(client.read(block, offset, length).await);
        }
        Ok(results)
    }

    /// Close and drop the connection for one source.
    pub async fn close(&self, key: &str) {
        if let Some(slot) = self.slots.get(key).map(|s| s.clone()) {
            let mut guard = slot.client.lock().await;
            if let Some(mut client) = guard.take() {
                client.close().await;
            }
        }
    }

    /// Close every cached connection; used on shutdown.
    pub async fn close_all(&self) {
        let keys: Vec<String> = self.slots.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            self.close(&key).await;
        }
    }
}
