use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::Utc;
use parking_lot::Mutex;
use tokio::{sync::watch, time::sleep};

use crate::{
    ai::{AnalysisGateway, AnalysisStatus},
    config::PipelineConfig,
    domain::{
        item::MAX_QUEUE_SIZE, AnalysisResult, BatchRun, BatchSummary, ItemState, QueueItem,
        QueueSnapshot, QueueStatus,
    },
    infrastructure::trigger::{Trigger, TriggerListener},
};

use super::{
    error::QueueError,
    polling::{poll_analysis, PollOutcome, PollPolicy},
    store::{count_status, QueueStore},
};

/// Owns the in-memory share queue and is its only writer.
///
/// Every transition is written through to the [`QueueStore`] before the next
/// gateway call. A failed write is logged and the in-memory state is kept.
pub struct QueueController {
    store: QueueStore,
    gateway: Arc<dyn AnalysisGateway>,
    pipeline: PipelineConfig,
    items: Mutex<Vec<QueueItem>>,
    is_processing: AtomicBool,
    progress: Mutex<BatchProgress>,
    cancel: Trigger,
    persist_lock: tokio::sync::Mutex<()>,
    last_error: Mutex<Option<String>>,
    snapshot_tx: watch::Sender<QueueSnapshot>,
}

#[derive(Debug, Clone, Copy, Default)]
struct BatchProgress {
    done: usize,
    total: usize,
}

enum Resolution {
    Completed(AnalysisResult),
    Failed(String),
    Requeue,
}

enum ItemOutcome {
    Completed,
    Failed,
    Requeued,
    Skipped,
}

/// Holds the single-flight flag for the duration of a batch.
struct BatchGuard<'a> {
    controller: &'a QueueController,
}

impl<'a> BatchGuard<'a> {
    fn acquire(controller: &'a QueueController) -> Option<Self> {
        controller
            .is_processing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        controller.publish();
        Some(Self { controller })
    }
}

impl Drop for BatchGuard<'_> {
    fn drop(&mut self) {
        *self.controller.progress.lock() = BatchProgress::default();
        self.controller.is_processing.store(false, Ordering::Release);
        self.controller.publish();
    }
}

impl QueueController {
    /// Loads the persisted queue. Items left `analyzing` by an interrupted run
    /// go back to `pending`.
    pub async fn initialize(
        store: QueueStore,
        gateway: Arc<dyn AnalysisGateway>,
        pipeline: PipelineConfig,
    ) -> Result<Self, QueueError> {
        let mut items = store.load().await?;

        let mut recovered = 0;
        for item in items.iter_mut() {
            if item.state == ItemState::Analyzing {
                item.state = ItemState::Pending;
                recovered += 1;
            }
        }
        if recovered > 0 {
            tracing::warn!(
                target: "controller",
                recovered,
                "items interrupted mid-analysis returned to pending"
            );
            store.save(&items).await?;
        }

        tracing::info!(target: "controller", items = items.len(), "share queue loaded");

        let (cancel, _) = Trigger::new();
        let (snapshot_tx, _) = watch::channel(QueueSnapshot::default());
        let controller = Self {
            store,
            gateway,
            pipeline,
            items: Mutex::new(items),
            is_processing: AtomicBool::new(false),
            progress: Mutex::new(BatchProgress::default()),
            cancel,
            persist_lock: tokio::sync::Mutex::new(()),
            last_error: Mutex::new(None),
            snapshot_tx,
        };
        controller.publish();
        Ok(controller)
    }

    pub async fn add_url(&self, url: &str, title: Option<String>) -> Result<QueueItem, QueueError> {
        let url = url.trim();
        if !QueueStore::is_supported_url(url) {
            let message = if url.is_empty() {
                "URL is empty".to_string()
            } else {
                format!("unsupported URL: {url}")
            };
            return Err(self.surface(QueueError::Validation(message)));
        }
        self.drop_expired_in_memory();

        {
            let items = self.items.lock();
            if items.iter().any(|item| item.url == url) {
                return Err(self.surface(QueueError::Duplicate(url.to_string())));
            }
            if items.len() >= MAX_QUEUE_SIZE {
                return Err(self.surface(QueueError::Capacity {
                    capacity: MAX_QUEUE_SIZE,
                }));
            }
        }

        let added = {
            let _guard = self.persist_lock.lock().await;
            let added = self.store.add_item(url, title).await;
            if let Ok(item) = &added {
                self.items.lock().push(item.clone());
            }
            added
        };

        match added {
            Ok(item) => {
                tracing::info!(
                    target: "controller",
                    id = %item.id,
                    url = %item.url,
                    platform = ?item.platform,
                    "url queued"
                );
                self.clear_error();
                self.publish();
                Ok(item)
            }
            Err(err) => Err(self.surface(err)),
        }
    }

    /// Analyzes every processable item in queue order, one at a time.
    ///
    /// Returns [`BatchRun::AlreadyRunning`] without touching the queue when
    /// another batch holds the processing flag.
    pub async fn process_batch(&self) -> BatchRun {
        let Some(_guard) = BatchGuard::acquire(self) else {
            tracing::debug!(target: "controller", "batch already running; request ignored");
            return BatchRun::AlreadyRunning;
        };
        self.cancel.reset();
        self.drop_expired_in_memory();

        let queue: Vec<String> = self
            .items
            .lock()
            .iter()
            .filter(|item| item.is_processable())
            .map(|item| item.id.clone())
            .collect();

        let total = queue.len();
        let mut summary = BatchSummary {
            total,
            ..BatchSummary::default()
        };
        if queue.is_empty() {
            return BatchRun::Finished(summary);
        }

        tracing::info!(target: "controller", total, "batch started");
        self.set_progress(0, total);
        let mut cancel = self.cancel.subscribe();

        for (index, id) in queue.iter().enumerate() {
            match self.process_item(id, &mut cancel).await {
                ItemOutcome::Completed => summary.completed += 1,
                ItemOutcome::Failed => summary.failed += 1,
                ItemOutcome::Requeued => summary.requeued += 1,
                ItemOutcome::Skipped => summary.skipped += 1,
            }
            summary.processed = summary.completed + summary.failed + summary.requeued;
            self.set_progress(index + 1, total);

            if index + 1 < total && !cancel.is_triggered() {
                tokio::select! {
                    _ = sleep(self.pipeline.item_delay) => {}
                    _ = cancel.notified() => {}
                }
            }
            if cancel.is_triggered() {
                summary.cancelled = true;
                tracing::info!(
                    target: "controller",
                    done = index + 1,
                    total,
                    "batch cancelled"
                );
                break;
            }
        }

        tracing::info!(
            target: "controller",
            total,
            completed = summary.completed,
            failed = summary.failed,
            requeued = summary.requeued,
            skipped = summary.skipped,
            "batch finished"
        );
        BatchRun::Finished(summary)
    }

    /// Resets failed items that still have retries left and runs a batch.
    pub async fn retry_failed(&self) -> BatchRun {
        let reset: Vec<String> = self
            .items
            .lock()
            .iter_mut()
            .filter(|item| item.is_retryable())
            .map(|item| {
                item.state = ItemState::Pending;
                item.id.clone()
            })
            .collect();

        for id in &reset {
            self.persist_item(id).await;
        }
        if !reset.is_empty() {
            tracing::info!(target: "controller", count = reset.len(), "failed items reset for retry");
            self.publish();
        }

        self.process_batch().await
    }

    /// Saves a completed item's place through the gateway and marks it saved.
    pub async fn save_item(&self, id: &str) -> Result<String, QueueError> {
        let (analysis_id, source_url) = match self.save_target(id) {
            Ok(target) => target,
            Err(err) => return Err(self.surface(err)),
        };

        let place_id = match self.gateway.save_place(&analysis_id, &source_url).await {
            Ok(place_id) => place_id,
            Err(err) => {
                tracing::warn!(target: "controller", id, error = %err, "saving place failed");
                return Err(self.surface(QueueError::Gateway(format!("{err:#}"))));
            }
        };

        let updated = {
            let mut items = self.items.lock();
            match items.iter_mut().find(|item| item.id == id) {
                Some(item) if item.status() == QueueStatus::Completed => {
                    item.state = ItemState::Saved {
                        place_id: Some(place_id.clone()),
                    };
                    true
                }
                _ => false,
            }
        };
        if updated {
            self.persist_item(id).await;
            self.publish();
        } else {
            tracing::warn!(target: "controller", id, "item changed while saving; place kept on server");
        }

        tracing::info!(target: "controller", id, place_id = %place_id, "item saved");
        Ok(place_id)
    }

    pub async fn ignore_item(&self, id: &str) -> Result<(), QueueError> {
        let changed = {
            let mut items = self.items.lock();
            let Some(item) = items.iter_mut().find(|item| item.id == id) else {
                return Err(self.surface(QueueError::NotFound(id.to_string())));
            };
            match item.status() {
                QueueStatus::Ignored => false,
                QueueStatus::Saved => {
                    return Err(self.surface(QueueError::InvalidState {
                        id: id.to_string(),
                        status: QueueStatus::Saved,
                        action: "ignore",
                    }));
                }
                _ => {
                    item.state = ItemState::Ignored;
                    true
                }
            }
        };

        if changed {
            tracing::debug!(target: "controller", id, "item ignored");
            self.persist_item(id).await;
            self.publish();
        }
        Ok(())
    }

    pub async fn remove_item(&self, id: &str) -> Result<(), QueueError> {
        let removed = {
            let mut items = self.items.lock();
            let before = items.len();
            items.retain(|item| item.id != id);
            items.len() < before
        };
        if !removed {
            return Err(self.surface(QueueError::NotFound(id.to_string())));
        }

        {
            let _guard = self.persist_lock.lock().await;
            if let Err(err) = self.store.remove_item(id).await {
                tracing::warn!(target: "store", id, error = %err, "failed to persist removal");
            }
        }
        self.publish();
        Ok(())
    }

    pub async fn clear_queue(&self) {
        self.items.lock().clear();
        {
            let _guard = self.persist_lock.lock().await;
            if let Err(err) = self.store.clear_queue().await {
                tracing::warn!(target: "store", error = %err, "failed to persist cleared queue");
            }
        }
        tracing::info!(target: "controller", "queue cleared");
        self.publish();
    }

    /// Drops saved and ignored items.
    pub async fn cleanup_completed_items(&self) -> usize {
        let removed = {
            let mut items = self.items.lock();
            let before = items.len();
            items.retain(|item| !item.status().is_terminal());
            before - items.len()
        };

        {
            let _guard = self.persist_lock.lock().await;
            if let Err(err) = self.store.cleanup_completed_items().await {
                tracing::warn!(target: "store", error = %err, "failed to persist cleanup");
            }
        }
        if removed > 0 {
            self.publish();
        }
        removed
    }

    /// Drops items past the TTL from memory and store. A result still in
    /// flight for an expired item is discarded.
    pub async fn prune_expired(&self) -> usize {
        let removed = self.drop_expired_in_memory();
        if removed == 0 {
            return 0;
        }

        let _guard = self.persist_lock.lock().await;
        let items = self.items.lock().clone();
        if let Err(err) = self.store.save(&items).await {
            tracing::warn!(target: "store", error = %err, "failed to persist pruned queue");
        }
        removed
    }

    /// Stops the running batch at the next item boundary. An in-flight
    /// gateway call is awaited, not aborted.
    pub fn cancel_processing(&self) {
        if self.is_processing() {
            tracing::info!(target: "controller", "batch cancellation requested");
        }
        self.cancel.trigger();
    }

    /// Waits until no batch is running. Returns `false` on timeout.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let mut rx = self.snapshot_tx.subscribe();
        let waited = tokio::time::timeout(timeout, rx.wait_for(|snapshot| !snapshot.is_processing));
        let idle = matches!(waited.await, Ok(Ok(_)));
        idle
    }

    pub fn items(&self) -> Vec<QueueItem> {
        self.items.lock().clone()
    }

    pub fn item(&self, id: &str) -> Option<QueueItem> {
        self.items.lock().iter().find(|item| item.id == id).cloned()
    }

    pub fn processable_items(&self) -> Vec<QueueItem> {
        self.items
            .lock()
            .iter()
            .filter(|item| item.is_processable())
            .cloned()
            .collect()
    }

    pub fn high_confidence_items(&self) -> Vec<QueueItem> {
        self.items
            .lock()
            .iter()
            .filter(|item| item.is_high_confidence())
            .cloned()
            .collect()
    }

    pub fn is_processing(&self) -> bool {
        self.is_processing.load(Ordering::Acquire)
    }

    pub fn progress(&self) -> f64 {
        let progress = *self.progress.lock();
        if progress.total == 0 {
            0.0
        } else {
            progress.done as f64 / progress.total as f64
        }
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    pub fn clear_error(&self) {
        *self.last_error.lock() = None;
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let progress = self.progress();
        let is_processing = self.is_processing();
        let items = self.items.lock();
        QueueSnapshot {
            total: items.len(),
            pending: count_status(&items, QueueStatus::Pending),
            analyzing: count_status(&items, QueueStatus::Analyzing),
            completed: count_status(&items, QueueStatus::Completed),
            failed: count_status(&items, QueueStatus::Failed),
            saved: count_status(&items, QueueStatus::Saved),
            ignored: count_status(&items, QueueStatus::Ignored),
            processable: items.iter().filter(|item| item.is_processable()).count(),
            high_confidence: items.iter().filter(|item| item.is_high_confidence()).count(),
            progress,
            is_processing,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<QueueSnapshot> {
        self.snapshot_tx.subscribe()
    }

    async fn process_item(&self, id: &str, cancel: &mut TriggerListener) -> ItemOutcome {
        let Some(item) = self.begin_analysis(id).await else {
            tracing::debug!(target: "controller", id, "item no longer processable; skipped");
            return ItemOutcome::Skipped;
        };

        let resolution = match self.gateway.analyze_link(&item.url).await {
            Err(err) => Resolution::Failed(QueueError::Gateway(format!("{err:#}")).to_string()),
            Ok(response) => match response.status {
                AnalysisStatus::Completed => match response.into_result() {
                    Some(result) => Resolution::Completed(result),
                    None => Resolution::Failed(
                        "analysis completed without place information".to_string(),
                    ),
                },
                AnalysisStatus::Failed => Resolution::Failed(
                    response
                        .error
                        .unwrap_or_else(|| "analysis failed".to_string()),
                ),
                AnalysisStatus::Pending | AnalysisStatus::InProgress => {
                    match response.analysis_id {
                        Some(analysis_id) => self.await_analysis(&analysis_id, cancel).await,
                        None => Resolution::Failed(
                            "analysis service returned no job id".to_string(),
                        ),
                    }
                }
            },
        };

        self.resolve(id, resolution).await
    }

    async fn await_analysis(&self, analysis_id: &str, cancel: &mut TriggerListener) -> Resolution {
        let policy = PollPolicy::from_config(&self.pipeline);
        match poll_analysis(self.gateway.as_ref(), analysis_id, policy, cancel).await {
            PollOutcome::Completed(result) => Resolution::Completed(result),
            PollOutcome::Failed(message) => Resolution::Failed(message),
            PollOutcome::TimedOut { attempts } => {
                Resolution::Failed(QueueError::Timeout { attempts }.to_string())
            }
            PollOutcome::Cancelled => {
                if let Err(err) = self.gateway.cancel_analysis(analysis_id).await {
                    tracing::warn!(
                        target: "controller",
                        analysis_id,
                        error = %err,
                        "server-side cancellation failed"
                    );
                }
                Resolution::Requeue
            }
        }
    }

    /// Moves a processable item to `analyzing`. A failed item passes through
    /// `pending` first.
    async fn begin_analysis(&self, id: &str) -> Option<QueueItem> {
        let was_failed = {
            let mut items = self.items.lock();
            let item = items
                .iter_mut()
                .find(|item| item.id == id && item.is_processable())?;
            let was_failed = item.status() == QueueStatus::Failed;
            if was_failed {
                item.state = ItemState::Pending;
            }
            was_failed
        };
        if was_failed && !self.persist_item(id).await {
            return None;
        }

        let item = {
            let mut items = self.items.lock();
            let item = items
                .iter_mut()
                .find(|item| item.id == id && item.state == ItemState::Pending)?;
            item.state = ItemState::Analyzing;
            item.clone()
        };
        if !self.persist_item(id).await {
            return None;
        }
        self.publish();

        tracing::debug!(
            target: "controller",
            id,
            url = %item.url,
            attempt = item.retry_count + 1,
            "analyzing"
        );
        Some(item)
    }

    /// Applies the outcome of an analysis unless the item was ignored or
    /// removed while the gateway call was in flight.
    async fn resolve(&self, id: &str, resolution: Resolution) -> ItemOutcome {
        let outcome = {
            let mut items = self.items.lock();
            let Some(item) = items.iter_mut().find(|item| item.id == id) else {
                tracing::debug!(target: "controller", id, "item removed during analysis; result discarded");
                return ItemOutcome::Skipped;
            };
            if item.state != ItemState::Analyzing {
                tracing::debug!(
                    target: "controller",
                    id,
                    status = %item.status(),
                    "item changed during analysis; result discarded"
                );
                return ItemOutcome::Skipped;
            }

            match resolution {
                Resolution::Completed(result) => {
                    tracing::info!(
                        target: "controller",
                        id,
                        place = %result.place_name,
                        confidence = result.confidence,
                        "analysis completed"
                    );
                    item.state = ItemState::Completed { result };
                    ItemOutcome::Completed
                }
                Resolution::Failed(message) => {
                    item.mark_failed(message.clone());
                    tracing::warn!(
                        target: "controller",
                        id,
                        retry_count = item.retry_count,
                        error = %message,
                        "analysis failed"
                    );
                    ItemOutcome::Failed
                }
                Resolution::Requeue => {
                    item.state = ItemState::Pending;
                    ItemOutcome::Requeued
                }
            }
        };

        self.persist_item(id).await;
        self.publish();
        outcome
    }

    fn save_target(&self, id: &str) -> Result<(String, String), QueueError> {
        let items = self.items.lock();
        let item = items
            .iter()
            .find(|item| item.id == id)
            .ok_or_else(|| QueueError::NotFound(id.to_string()))?;
        let invalid = |action| QueueError::InvalidState {
            id: id.to_string(),
            status: item.status(),
            action,
        };
        let ItemState::Completed { result } = &item.state else {
            return Err(invalid("save"));
        };
        let analysis_id = result
            .analysis_id
            .clone()
            .ok_or_else(|| invalid("save without an analysis id"))?;
        Ok((analysis_id, item.url.clone()))
    }

    /// Writes the current in-memory version of one item to the store.
    ///
    /// The store decides membership: an item it no longer holds (pruned past
    /// the TTL) is dropped from memory too. Returns whether the item is still
    /// queued.
    async fn persist_item(&self, id: &str) -> bool {
        let _guard = self.persist_lock.lock().await;
        let current = self.items.lock().iter().find(|item| item.id == id).cloned();
        let Some(item) = current else {
            if let Err(err) = self.store.remove_item(id).await {
                tracing::warn!(target: "store", id, error = %err, "failed to persist removal");
            }
            return false;
        };

        match self.store.update_item(&item).await {
            Ok(true) => true,
            Ok(false) => {
                self.items.lock().retain(|item| item.id != id);
                tracing::info!(
                    target: "controller",
                    id,
                    "item no longer stored; dropped from queue"
                );
                self.publish();
                false
            }
            Err(err) => {
                tracing::warn!(
                    target: "store",
                    id,
                    error = %err,
                    "failed to persist queue item; keeping in-memory state"
                );
                true
            }
        }
    }

    /// Drops items past the TTL from memory only; the store prunes itself on
    /// its next read.
    fn drop_expired_in_memory(&self) -> usize {
        let now = Utc::now();
        let removed = {
            let mut items = self.items.lock();
            let before = items.len();
            items.retain(|item| !item.is_expired(now));
            before - items.len()
        };
        if removed > 0 {
            tracing::info!(target: "controller", removed, "expired items dropped from queue");
            self.publish();
        }
        removed
    }

    fn set_progress(&self, done: usize, total: usize) {
        *self.progress.lock() = BatchProgress { done, total };
        self.publish();
    }

    fn publish(&self) {
        self.snapshot_tx.send_replace(self.snapshot());
    }

    fn surface(&self, err: QueueError) -> QueueError {
        tracing::debug!(target: "controller", error = %err, "queue operation rejected");
        *self.last_error.lock() = Some(err.to_string());
        err
    }
}

#[cfg(test)]
mod tests {
    use anyhow::anyhow;
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;

    use super::*;
    use crate::{
        ai::testing::{completed, failed, in_progress, ScriptedGateway},
        db::{KeyValueStore, MemoryKeyValueStore},
    };

    const URL: &str = "https://instagram.com/p/xxx";

    /// Memory store that keeps every written queue document.
    #[derive(Default)]
    struct RecordingStore {
        inner: MemoryKeyValueStore,
        writes: Mutex<Vec<Vec<QueueItem>>>,
    }

    impl RecordingStore {
        /// Persisted statuses of one item in write order, repeats collapsed.
        fn history(&self, id: &str) -> Vec<QueueStatus> {
            let mut statuses: Vec<QueueStatus> = self
                .writes
                .lock()
                .iter()
                .filter_map(|doc| doc.iter().find(|item| item.id == id))
                .map(|item| item.status())
                .collect();
            statuses.dedup();
            statuses
        }
    }

    #[async_trait]
    impl KeyValueStore for RecordingStore {
        async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
            self.inner.get(key).await
        }

        async fn put(&self, key: &str, value: &str) -> anyhow::Result<()> {
            self.writes.lock().push(serde_json::from_str(value)?);
            self.inner.put(key, value).await
        }

        async fn remove(&self, key: &str) -> anyhow::Result<()> {
            self.inner.remove(key).await
        }
    }

    struct Harness {
        controller: QueueController,
        gateway: Arc<ScriptedGateway>,
        kv: Arc<RecordingStore>,
    }

    impl Harness {
        async fn new() -> Self {
            Self::with_items(Vec::new()).await
        }

        async fn with_items(items: Vec<QueueItem>) -> Self {
            let kv = Arc::new(RecordingStore::default());
            if !items.is_empty() {
                QueueStore::new(kv.clone()).save(&items).await.unwrap();
            }
            let gateway = Arc::new(ScriptedGateway::new());
            let controller = QueueController::initialize(
                QueueStore::new(kv.clone()),
                gateway.clone(),
                PipelineConfig::default(),
            )
            .await
            .unwrap();
            Self {
                controller,
                gateway,
                kv,
            }
        }

        async fn persisted(&self) -> Vec<QueueItem> {
            QueueStore::new(self.kv.clone()).load().await.unwrap()
        }
    }

    fn summary(run: BatchRun) -> BatchSummary {
        *run.summary().expect("batch should have run")
    }

    #[tokio::test]
    async fn add_url_enqueues_pending_item() {
        let h = Harness::new().await;
        let item = h.controller.add_url(URL, None).await.unwrap();

        let items = h.controller.items();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].status(), QueueStatus::Pending);
        assert_eq!(h.persisted().await, vec![item]);
        assert_eq!(h.controller.snapshot().pending, 1);
    }

    #[tokio::test]
    async fn duplicate_url_is_rejected() {
        let h = Harness::new().await;
        h.controller.add_url(URL, None).await.unwrap();
        let err = h.controller.add_url(URL, None).await.unwrap_err();

        assert!(matches!(err, QueueError::Duplicate(_)));
        assert_eq!(h.controller.items().len(), 1);
        assert!(h.controller.last_error().is_some());
    }

    #[tokio::test]
    async fn unsupported_url_never_enters_queue() {
        let h = Harness::new().await;
        let err = h
            .controller
            .add_url("https://example.com/post/1", None)
            .await
            .unwrap_err();

        assert!(matches!(err, QueueError::Validation(_)));
        assert!(h.controller.items().is_empty());
        assert!(h.persisted().await.is_empty());
    }

    #[tokio::test]
    async fn full_queue_rejects_new_urls() {
        let h = Harness::new().await;
        for n in 0..MAX_QUEUE_SIZE {
            h.controller
                .add_url(&format!("https://youtu.be/{n}"), None)
                .await
                .unwrap();
        }
        let err = h
            .controller
            .add_url("https://youtu.be/one-more", None)
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Capacity { .. }));
        assert_eq!(h.controller.items().len(), MAX_QUEUE_SIZE);
    }

    #[tokio::test(start_paused = true)]
    async fn batch_completes_item_with_result() {
        let h = Harness::new().await;
        h.gateway.push_analyze(Ok(completed("an-1", 0.95)));
        let item = h.controller.add_url(URL, None).await.unwrap();

        let run = summary(h.controller.process_batch().await);
        assert_eq!(run.completed, 1);
        assert_eq!(run.processed, 1);

        let stored = h.controller.item(&item.id).unwrap();
        assert_eq!(stored.status(), QueueStatus::Completed);
        assert_eq!(stored.result().unwrap().confidence, 0.95);
        assert_eq!(h.controller.high_confidence_items().len(), 1);
        assert!(!h.controller.is_processing());
        assert_eq!(h.controller.progress(), 0.0);

        let persisted = h.persisted().await;
        assert_eq!(persisted[0].status(), QueueStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn in_progress_analysis_is_polled_to_completion() {
        let h = Harness::new().await;
        h.gateway.push_analyze(Ok(in_progress("job-1")));
        h.gateway
            .push_status(Ok(in_progress("job-1")))
            .push_status(Ok(completed("job-1", 0.6)));
        let item = h.controller.add_url(URL, None).await.unwrap();

        h.controller.process_batch().await;

        let stored = h.controller.item(&item.id).unwrap();
        assert_eq!(stored.status(), QueueStatus::Completed);
        assert!(!stored.is_high_confidence());
        assert_eq!(h.gateway.calls().polled, vec!["job-1", "job-1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn polling_timeout_fails_item() {
        let h = Harness::new().await;
        h.gateway.push_analyze(Ok(in_progress("slow")));
        let item = h.controller.add_url(URL, None).await.unwrap();

        let run = summary(h.controller.process_batch().await);

        assert_eq!(run.failed, 1);
        let stored = h.controller.item(&item.id).unwrap();
        assert_eq!(stored.retry_count, 1);
        assert!(stored.error_message().unwrap().contains("30 status checks"));
        assert_eq!(h.gateway.calls().polled.len(), 30);
    }

    #[tokio::test(start_paused = true)]
    async fn server_reported_failure_keeps_message() {
        let h = Harness::new().await;
        h.gateway.push_analyze(Ok(failed("no place found in post")));
        let item = h.controller.add_url(URL, None).await.unwrap();

        h.controller.process_batch().await;

        let stored = h.controller.item(&item.id).unwrap();
        assert_eq!(stored.error_message(), Some("no place found in post"));
        assert_eq!(stored.retry_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn gateway_error_then_retry_succeeds() {
        let h = Harness::new().await;
        h.gateway
            .push_analyze(Err(anyhow!("connection refused")))
            .push_analyze(Ok(completed("an-2", 0.9)));
        let item = h.controller.add_url(URL, None).await.unwrap();

        h.controller.process_batch().await;
        let stored = h.controller.item(&item.id).unwrap();
        assert_eq!(stored.status(), QueueStatus::Failed);
        assert_eq!(stored.retry_count, 1);
        assert!(stored.error_message().unwrap().contains("connection refused"));

        let run = summary(h.controller.retry_failed().await);
        assert_eq!(run.total, 1);
        assert_eq!(h.gateway.calls().analyzed.len(), 2);

        let stored = h.controller.item(&item.id).unwrap();
        assert_eq!(stored.status(), QueueStatus::Completed);
        assert_eq!(stored.retry_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_items_are_not_retried() {
        let mut exhausted = QueueItem::new("spent".into(), URL.into(), None, Utc::now());
        exhausted.state = ItemState::Failed {
            error_message: "timeout".into(),
        };
        exhausted.retry_count = 3;
        let h = Harness::with_items(vec![exhausted]).await;

        let run = summary(h.controller.retry_failed().await);

        assert_eq!(run.total, 0);
        assert!(h.gateway.calls().analyzed.is_empty());
        assert_eq!(h.controller.item("spent").unwrap().status(), QueueStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_count_caps_at_three() {
        let h = Harness::new().await;
        for _ in 0..5 {
            h.gateway.push_analyze(Err(anyhow!("down")));
        }
        let item = h.controller.add_url(URL, None).await.unwrap();

        h.controller.process_batch().await;
        for _ in 0..4 {
            h.controller.retry_failed().await;
        }

        assert_eq!(h.gateway.calls().analyzed.len(), 3);
        assert_eq!(h.controller.item(&item.id).unwrap().retry_count, 3);
        assert!(h.controller.processable_items().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_batch_is_a_no_op() {
        let h = Harness::new().await;
        h.gateway.push_analyze(Ok(in_progress("job")));
        h.gateway.push_status(Ok(completed("job", 0.9)));
        h.controller.add_url(URL, None).await.unwrap();

        let (first, second) = tokio::join!(h.controller.process_batch(), async {
            sleep(Duration::from_secs(1)).await;
            assert!(h.controller.is_processing());
            h.controller.process_batch().await
        });

        assert_eq!(second, BatchRun::AlreadyRunning);
        assert_eq!(summary(first).completed, 1);
        assert_eq!(h.gateway.calls().analyzed.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_at_item_boundary() {
        let h = Harness::new().await;
        h.gateway
            .push_analyze(Ok(completed("a", 0.9)))
            .push_analyze(Ok(completed("b", 0.9)));
        let first = h.controller.add_url("https://youtu.be/a", None).await.unwrap();
        let second = h.controller.add_url("https://youtu.be/b", None).await.unwrap();

        let (run, ()) = tokio::join!(h.controller.process_batch(), async {
            sleep(Duration::from_millis(100)).await;
            h.controller.cancel_processing();
        });

        let run = summary(run);
        assert!(run.cancelled);
        assert_eq!(run.processed, 1);
        assert_eq!(h.controller.item(&first.id).unwrap().status(), QueueStatus::Completed);
        assert_eq!(h.controller.item(&second.id).unwrap().status(), QueueStatus::Pending);
        assert!(!h.controller.is_processing());
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_during_polling_requeues_item() {
        let h = Harness::new().await;
        h.gateway.push_analyze(Ok(in_progress("job-9")));
        let item = h.controller.add_url(URL, None).await.unwrap();

        let (run, ()) = tokio::join!(h.controller.process_batch(), async {
            sleep(Duration::from_secs(3)).await;
            h.controller.cancel_processing();
        });

        let run = summary(run);
        assert!(run.cancelled);
        assert_eq!(run.requeued, 1);
        let stored = h.controller.item(&item.id).unwrap();
        assert_eq!(stored.status(), QueueStatus::Pending);
        assert_eq!(stored.retry_count, 0);
        assert_eq!(h.gateway.calls().cancelled, vec!["job-9"]);
    }

    #[tokio::test(start_paused = true)]
    async fn ignoring_an_item_mid_analysis_discards_result() {
        let h = Harness::new().await;
        h.gateway.push_analyze(Ok(in_progress("job")));
        h.gateway.push_status(Ok(completed("job", 0.9)));
        let item = h.controller.add_url(URL, None).await.unwrap();

        let (run, ignored) = tokio::join!(h.controller.process_batch(), async {
            sleep(Duration::from_secs(1)).await;
            h.controller.ignore_item(&item.id).await
        });

        ignored.unwrap();
        assert_eq!(summary(run).skipped, 1);
        assert_eq!(h.controller.item(&item.id).unwrap().status(), QueueStatus::Ignored);
        assert_eq!(h.persisted().await[0].status(), QueueStatus::Ignored);
    }

    #[tokio::test(start_paused = true)]
    async fn save_item_marks_saved() {
        let h = Harness::new().await;
        h.gateway.push_analyze(Ok(completed("an-7", 0.8)));
        h.gateway.push_save(Ok("place-7".into()));
        let item = h.controller.add_url(URL, None).await.unwrap();
        h.controller.process_batch().await;

        let place_id = h.controller.save_item(&item.id).await.unwrap();

        assert_eq!(place_id, "place-7");
        assert_eq!(
            h.controller.item(&item.id).unwrap().state,
            ItemState::Saved {
                place_id: Some("place-7".into())
            }
        );
        assert_eq!(
            h.gateway.calls().saved,
            vec![("an-7".to_string(), URL.to_string())]
        );
        assert_eq!(h.controller.cleanup_completed_items().await, 1);
        assert!(h.persisted().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failed_save_leaves_item_completed() {
        let h = Harness::new().await;
        h.gateway.push_analyze(Ok(completed("an-8", 0.8)));
        h.gateway.push_save(Err(anyhow!("503 service unavailable")));
        let item = h.controller.add_url(URL, None).await.unwrap();
        h.controller.process_batch().await;

        let err = h.controller.save_item(&item.id).await.unwrap_err();

        assert!(matches!(err, QueueError::Gateway(_)));
        assert_eq!(h.controller.item(&item.id).unwrap().status(), QueueStatus::Completed);
        assert!(h.controller.last_error().unwrap().contains("503"));
    }

    #[tokio::test]
    async fn save_requires_completed_item() {
        let h = Harness::new().await;
        let item = h.controller.add_url(URL, None).await.unwrap();

        let err = h.controller.save_item(&item.id).await.unwrap_err();
        assert!(matches!(
            err,
            QueueError::InvalidState {
                status: QueueStatus::Pending,
                ..
            }
        ));
        assert!(h.gateway.calls().saved.is_empty());
    }

    #[tokio::test]
    async fn ignore_rejects_saved_items_and_unknown_ids() {
        let mut saved = QueueItem::new("saved".into(), URL.into(), None, Utc::now());
        saved.state = ItemState::Saved { place_id: None };
        let h = Harness::with_items(vec![saved]).await;

        assert!(matches!(
            h.controller.ignore_item("saved").await,
            Err(QueueError::InvalidState { .. })
        ));
        assert!(matches!(
            h.controller.ignore_item("missing").await,
            Err(QueueError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn interrupted_analysis_is_recovered_on_startup() {
        let mut stuck = QueueItem::new("stuck".into(), URL.into(), None, Utc::now());
        stuck.state = ItemState::Analyzing;
        let h = Harness::with_items(vec![stuck]).await;

        assert_eq!(h.controller.item("stuck").unwrap().status(), QueueStatus::Pending);
        assert_eq!(h.persisted().await[0].status(), QueueStatus::Pending);
    }

    #[tokio::test]
    async fn remove_and_clear_update_store() {
        let h = Harness::new().await;
        let first = h.controller.add_url("https://youtu.be/1", None).await.unwrap();
        h.controller.add_url("https://youtu.be/2", None).await.unwrap();

        h.controller.remove_item(&first.id).await.unwrap();
        assert_eq!(h.persisted().await.len(), 1);
        assert!(matches!(
            h.controller.remove_item(&first.id).await,
            Err(QueueError::NotFound(_))
        ));

        h.controller.clear_queue().await;
        assert!(h.controller.items().is_empty());
        assert!(h.kv.get("share_queue.items").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn items_are_paced_between_analyses() {
        let h = Harness::new().await;
        for n in 0..3 {
            h.gateway.push_analyze(Ok(completed(&format!("an-{n}"), 0.8)));
            h.controller
                .add_url(&format!("https://youtu.be/{n}"), None)
                .await
                .unwrap();
        }

        let started = tokio::time::Instant::now();
        let run = summary(h.controller.process_batch().await);

        assert_eq!(run.completed, 3);
        // Two gaps of 500ms; none after the last item.
        assert!(started.elapsed() >= Duration::from_millis(1000));
        assert!(started.elapsed() < Duration::from_millis(1500));
    }

    #[tokio::test]
    async fn cleanup_drops_saved_and_ignored_items() {
        let mut saved = QueueItem::new("saved".into(), URL.into(), None, Utc::now());
        saved.state = ItemState::Saved {
            place_id: Some("p-1".into()),
        };
        let mut ignored =
            QueueItem::new("ignored".into(), "https://youtu.be/x".into(), None, Utc::now());
        ignored.state = ItemState::Ignored;
        let pending =
            QueueItem::new("pending".into(), "https://youtu.be/y".into(), None, Utc::now());
        let h = Harness::with_items(vec![saved, ignored, pending]).await;

        assert_eq!(h.controller.cleanup_completed_items().await, 2);
        let ids: Vec<_> = h.persisted().await.into_iter().map(|item| item.id).collect();
        assert_eq!(ids, vec!["pending"]);
        assert_eq!(h.controller.items().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn gateway_sees_items_in_queue_order() {
        let mut retryable = QueueItem::new("b".into(), "https://youtu.be/b".into(), None, Utc::now());
        retryable.state = ItemState::Failed {
            error_message: "timeout".into(),
        };
        retryable.retry_count = 1;
        let h = Harness::with_items(vec![
            QueueItem::new("a".into(), "https://youtu.be/a".into(), None, Utc::now()),
            retryable,
            QueueItem::new("c".into(), "https://youtu.be/c".into(), None, Utc::now()),
        ])
        .await;
        for n in 0..3 {
            h.gateway.push_analyze(Ok(completed(&format!("an-{n}"), 0.8)));
        }

        let run = summary(h.controller.process_batch().await);

        assert_eq!(run.completed, 3);
        assert_eq!(
            h.gateway.calls().analyzed,
            vec!["https://youtu.be/a", "https://youtu.be/b", "https://youtu.be/c"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn batch_picks_up_retryable_failed_item_through_pending() {
        let mut item = QueueItem::new("f".into(), URL.into(), None, Utc::now());
        item.state = ItemState::Failed {
            error_message: "connection refused".into(),
        };
        item.retry_count = 1;
        let h = Harness::with_items(vec![item]).await;
        h.gateway.push_analyze(Ok(completed("an-f", 0.9)));

        let run = summary(h.controller.process_batch().await);

        assert_eq!(run.completed, 1);
        assert_eq!(h.gateway.calls().analyzed, vec![URL]);
        assert_eq!(
            h.kv.history("f"),
            vec![
                QueueStatus::Failed,
                QueueStatus::Pending,
                QueueStatus::Analyzing,
                QueueStatus::Completed
            ]
        );
        assert_eq!(h.controller.item("f").unwrap().retry_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_failed_persists_pending_before_analyzing() {
        let h = Harness::new().await;
        h.gateway
            .push_analyze(Err(anyhow!("connection refused")))
            .push_analyze(Ok(completed("an-2", 0.9)));
        let item = h.controller.add_url(URL, None).await.unwrap();

        h.controller.process_batch().await;
        h.controller.retry_failed().await;

        assert_eq!(
            h.kv.history(&item.id),
            vec![
                QueueStatus::Pending,
                QueueStatus::Analyzing,
                QueueStatus::Failed,
                QueueStatus::Pending,
                QueueStatus::Analyzing,
                QueueStatus::Completed
            ]
        );
    }

    #[tokio::test]
    async fn items_expiring_while_running_leave_memory_with_the_store() {
        let aging = QueueItem::new(
            "aging".into(),
            URL.into(),
            None,
            Utc::now() - ChronoDuration::days(7) + ChronoDuration::milliseconds(300),
        );
        let h = Harness::with_items(vec![aging]).await;
        assert!(h.controller.item("aging").is_some());
        tokio::time::sleep(Duration::from_millis(600)).await;

        h.gateway.push_analyze(Ok(completed("an-new", 0.9)));
        let fresh = h
            .controller
            .add_url("https://youtu.be/fresh", None)
            .await
            .unwrap();
        let run = summary(h.controller.process_batch().await);

        assert_eq!(run.total, 1);
        assert_eq!(h.gateway.calls().analyzed, vec!["https://youtu.be/fresh"]);
        assert!(h.controller.item("aging").is_none());
        assert_eq!(h.controller.snapshot().total, 1);
        let stored: Vec<_> = h.persisted().await.into_iter().map(|item| item.id).collect();
        assert_eq!(stored, vec![fresh.id]);
    }

    #[tokio::test]
    async fn item_missing_from_store_is_dropped_instead_of_analyzed() {
        let h = Harness::with_items(vec![QueueItem::new(
            "gone".into(),
            URL.into(),
            None,
            Utc::now(),
        )])
        .await;
        QueueStore::new(h.kv.clone()).remove_item("gone").await.unwrap();
        h.gateway.push_analyze(Ok(completed("an", 0.9)));

        let run = summary(h.controller.process_batch().await);

        assert_eq!(run.skipped, 1);
        assert!(h.gateway.calls().analyzed.is_empty());
        assert!(h.controller.items().is_empty());
        assert_eq!(h.controller.snapshot().total, 0);
    }

    #[tokio::test]
    async fn prune_expired_drops_old_items() {
        let old = QueueItem::new(
            "old".into(),
            URL.into(),
            None,
            Utc::now() - ChronoDuration::days(6) - ChronoDuration::hours(23),
        );
        let h = Harness::with_items(vec![old]).await;
        assert_eq!(h.controller.prune_expired().await, 0);

        h.controller.items.lock()[0].shared_at = Utc::now() - ChronoDuration::days(9);
        assert_eq!(h.controller.prune_expired().await, 1);
        assert!(h.controller.items().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn observers_see_processing_state() {
        let h = Harness::new().await;
        h.gateway.push_analyze(Ok(completed("an", 0.9)));
        h.controller.add_url(URL, None).await.unwrap();
        let rx = h.controller.subscribe();

        h.controller.process_batch().await;

        let snapshot = *rx.borrow();
        assert!(!snapshot.is_processing);
        assert_eq!(snapshot.completed, 1);
        assert_eq!(snapshot.high_confidence, 1);
        assert!(h.controller.wait_idle(Duration::from_secs(1)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_idle_times_out_while_a_batch_runs() {
        let h = Harness::new().await;
        h.gateway.push_analyze(Ok(in_progress("slow")));
        h.controller.add_url(URL, None).await.unwrap();

        let (run, idle_in_time) = tokio::join!(h.controller.process_batch(), async {
            sleep(Duration::from_millis(100)).await;
            let idle = h.controller.wait_idle(Duration::from_secs(1)).await;
            h.controller.cancel_processing();
            idle
        });

        assert!(!idle_in_time);
        assert!(summary(run).cancelled);
        assert!(h.controller.wait_idle(Duration::from_secs(1)).await);
    }
}
