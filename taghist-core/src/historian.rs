//! Historian facade: wires the subscription registry, poll scheduler and
//! day-sharded store together and owns the historization path.
//!
//! One distinguished session subscribes to every known tag name; its
//! delivery callback feeds a buffer that flushes to a single writer task,
//! so store writes are strictly serialized.

use crate::{
    address::AddressCache,
    device::{ClientFactory, SourceRegistry},
    scheduler::{PollScheduler, PollerMetrics},
    subscription::{DeliverFn, SessionRegistry},
};
use chrono::{DateTime, Local};
use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
};
use taghist_error::{THError, THResult};
use taghist_models::{constants::HISTORY_SESSION_ID, Settings, SourceSpec, TagSample};
use taghist_storage::DayShardStore;
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Accumulates changed samples from the historization session and flushes
/// them in batches to the writer task.
///
/// Flushes cannot overlap: the buffer hands each snapshot to a bounded
/// channel whose single consumer owns the store connection. A batch that
/// was handed off is never re-queued (at-most-once persistence).
pub struct HistorySink {
    threshold: usize,
    queue: Mutex<Vec<TagSample>>,
    tx: Mutex<Option<mpsc::Sender<Vec<TagSample>>>>,
}

impl HistorySink {
    fn new(threshold: usize, tx: mpsc::Sender<Vec<TagSample>>) -> Self {
        Self {
            threshold,
            queue: Mutex::new(Vec::new()),
            tx: Mutex::new(Some(tx)),
        }
    }

    /// Append samples; when the queue reaches the threshold, snapshot and
    /// hand it to the writer.
    pub async fn accumulate(&self, samples: Vec<TagSample>) {
        let batch = {
            let mut queue = self.queue.lock().await;
            queue.extend(samples);
            if queue.len() >= self.threshold {
                Some(std::mem::take(&mut *queue))
            } else {
                None
            }
        };
        if let Some(batch) = batch {
            self.send(batch).await;
        }
    }

    /// Flush whatever is queued, regardless of the threshold.
    pub async fn flush(&self) {
        let batch = std::mem::take(&mut *self.queue.lock().await);
        if !batch.is_empty() {
            self.send(batch).await;
        }
    }

    /// Flush the remainder and drop the sender so the writer task drains
    /// and exits.
    async fn close(&self) {
        self.flush().await;
        self.tx.lock().await.take();
    }

    async fn send(&self, batch: Vec<TagSample>) {
        let sender = { self.tx.lock().await.clone() };
        let Some(sender) = sender else {
            warn!(dropped = batch.len(), "history sink closed; dropping batch");
            return;
        };
        let len = batch.len();
        if sender.send(batch).await.is_err() {
            error!(dropped = len, "history writer gone; dropping batch");
        }
    }

    /// Delivery callback registered for the historization session.
    fn deliver_fn(self: &Arc<Self>) -> DeliverFn {
        let sink = Arc::clone(self);
        Arc::new(move |samples| {
            let sink = Arc::clone(&sink);
            Box::pin(async move {
                sink.accumulate(samples).await;
                Ok(())
            })
        })
    }
}

/// The assembled historian. Constructed explicitly from `Settings` at
/// startup and passed by reference to the boundaries; there is no global
/// instance.
pub struct Historian {
    settings: Settings,
    registry: Arc<SessionRegistry>,
    cache: Arc<AddressCache>,
    sources: Arc<SourceRegistry>,
    store: Arc<DayShardStore>,
    sink: Arc<HistorySink>,
    scheduler: Arc<PollScheduler>,
    cancel: CancellationToken,
    writer_rx: Mutex<Option<mpsc::Receiver<Vec<TagSample>>>>,
    poll_task: Mutex<Option<JoinHandle<()>>>,
    writer_task: Mutex<Option<JoinHandle<()>>>,
    history_names: std::sync::Mutex<BTreeSet<String>>,
}

impl Historian {
    /// Open the store and assemble the pipeline. Nothing runs until
    /// `start` is called.
    #[instrument(name = "historian-new", skip_all)]
    pub async fn new(settings: Settings, factory: ClientFactory) -> THResult<Arc<Self>> {
        let store = Arc::new(
            DayShardStore::open(
                settings.general.data_dir.clone(),
                settings.history.tag_seed_lookback_days,
            )
            .await?,
        );
        let (tx, rx) = mpsc::channel(settings.history.queue_capacity.max(1));
        let sink = Arc::new(HistorySink::new(settings.history.flush_threshold.max(1), tx));

        let registry = Arc::new(SessionRegistry::new());
        let cache = Arc::new(AddressCache::new());
        let sources = Arc::new(SourceRegistry::new(settings.source_specs(), factory));
        let cancel = CancellationToken::new();
        let scheduler = Arc::new(PollScheduler::new(
            settings.poller,
            Arc::clone(&registry),
            Arc::clone(&cache),
            Arc::clone(&sources),
            cancel.child_token(),
        ));

        Ok(Arc::new(Self {
            settings,
            registry,
            cache,
            sources,
            store,
            sink,
            scheduler,
            cancel,
            writer_rx: Mutex::new(Some(rx)),
            poll_task: Mutex::new(None),
            writer_task: Mutex::new(None),
            history_names: std::sync::Mutex::new(BTreeSet::new()),
        }))
    }

    /// Subscribe the historization session to every tag known to the store
    /// and launch the writer and poll tasks.
    #[instrument(name = "historian-start", skip_all)]
    pub async fn start(&self) -> THResult<()> {
        let known = self
            .store
            .list_known_tags(self.settings.history.tag_seed_lookback_days)
            .await?;
        self.register_history_tags(known.into_keys());

        let rx = self
            .writer_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| THError::InitializationError("historian already started".into()))?;
        let store = Arc::clone(&self.store);
        let writer = tokio::spawn(async move {
            let mut rx = rx;
            while let Some(batch) = rx.recv().await {
                match store.append_batch(&batch).await {
                    Ok(written) => debug!(written, "history batch persisted"),
                    // The flushed batch is lost; at-most-once per batch.
                    Err(e) => error!(error = %e, "history flush failed; batch dropped"),
                }
            }
            debug!("history writer drained");
        });
        *self.writer_task.lock().await = Some(writer);

        let scheduler = Arc::clone(&self.scheduler);
        let poller = tokio::spawn(async move { scheduler.run().await });
        *self.poll_task.lock().await = Some(poller);

        info!("historian started");
        Ok(())
    }

    /// Subscribe boundary: create or replace a client session. The parse
    /// cache entries for the given names are invalidated so renamed or
    /// re-registered tags resolve fresh on the next cycle.
    pub fn subscribe(&self, id: &str, tag_names: Vec<String>, deliver: DeliverFn) -> THResult<()> {
        if id == HISTORY_SESSION_ID {
            return Err(THError::ConfigurationError(
                "session id is reserved for historization".into(),
            ));
        }
        self.cache.invalidate(tag_names.iter());
        self.registry.upsert(id, tag_names.clone(), deliver);
        self.register_history_tags(tag_names);
        Ok(())
    }

    pub fn unsubscribe(&self, id: &str) -> bool {
        self.registry.remove(id)
    }

    /// Query boundary: range-query the day-sharded history.
    pub async fn query(
        &self,
        tag_names: &[String],
        start: DateTime<Local>,
        end: DateTime<Local>,
    ) -> THResult<Vec<TagSample>> {
        self.store.query(tag_names, start, end).await
    }

    /// Query boundary: known tag names with comments.
    pub async fn known_tags(&self, lookback_days: u32) -> THResult<HashMap<String, String>> {
        self.store.list_known_tags(lookback_days).await
    }

    /// Admin boundary: replace the source table at runtime. Takes effect
    /// for a tag once its name is re-registered (parse cache contract).
    pub fn update_sources(&self, sources: HashMap<String, SourceSpec>) {
        self.sources.update_sources(sources);
    }

    pub async fn metrics(&self) -> PollerMetrics {
        self.scheduler.metrics().await
    }

    /// Stop polling, flush the partial history buffer, drain the writer
    /// and close the store.
    #[instrument(name = "historian-shutdown", skip_all)]
    pub async fn shutdown(&self) -> THResult<()> {
        info!("stopping historian");
        self.cancel.cancel();
        if let Some(task) = self.poll_task.lock().await.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "poll task ended abnormally");
            }
        }
        self.sink.close().await;
        if let Some(task) = self.writer_task.lock().await.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "writer task ended abnormally");
            }
        }
        self.sources.close_all().await;
        self.store.close().await?;
        info!("historian stopped");
        Ok(())
    }

    /// Union new names into the historization session's tag list. Already
    /// known names keep the session as-is; genuinely new names re-register
    /// the session, which restarts those tags from the null state.
    fn register_history_tags(&self, names: impl IntoIterator<Item = String>) {
        let (changed, all) = {
            let mut set = self.history_names.lock().unwrap();
            let before = set.len();
            set.extend(names);
            (
                set.len() != before || before == 0,
                set.iter().cloned().collect::<Vec<_>>(),
            )
        };
        if changed && !all.is_empty() {
            debug!(tags = all.len(), "historization session re-registered");
            self.cache.invalidate(all.iter());
            self.registry
                .upsert(HISTORY_SESSION_ID, all, self.sink.deliver_fn());
        }
    }
}
