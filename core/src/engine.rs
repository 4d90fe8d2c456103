//! Controller-thread owner of the feed, cache, downloads, and applier.
//!
//! Fetches, thumbnail loads, download completions, and pressure samples all come back through
//! one channel, so the feed and the cache have a single mutator: whoever calls
//! [`Engine::pump`].

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::apply::{AppliedWallpaper, ApplyRequest, WallpaperApplier};
use crate::cache::{
    Cache, CacheStats, CacheValue, PressureMonitor, PressureOutcome, PressurePolicy, PressureSource,
};
use crate::catalog::CatalogClient;
use crate::codec::{DEFAULT_MAX_EDGE, Thumbnail, decode_thumbnail};
use crate::download::{
    DownloadConfig, DownloadEvent, DownloadManager, EnqueueError, EventSink, Sleeper, TaskHandle,
    TaskId, TaskStatus, ThreadSleeper,
};
use crate::error::CoreError;
use crate::feed::{FeedConfig, FeedController, FeedError, FeedIntent, FetchTicket, MergeOutcome};
use crate::net::{Transport, fetch_bytes};
use crate::store::{AssetStore, DEFAULT_THUMBNAIL_DISK_BUDGET, Settings};
use crate::types::{AssetKey, CacheBudget, CatalogEntry, EntryId, Page, Query, RequestToken};

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub feed: FeedConfig,
    pub cache_budget: CacheBudget,
    pub pressure: PressurePolicy,
    pub downloads: DownloadConfig,
    pub thumbnail_edge: u32,
    /// Bytes the on-disk thumbnail copies may occupy.
    pub thumbnail_disk_budget: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            feed: FeedConfig::default(),
            cache_budget: CacheBudget::default(),
            pressure: PressurePolicy::default(),
            downloads: DownloadConfig::default(),
            thumbnail_edge: DEFAULT_MAX_EDGE,
            thumbnail_disk_budget: DEFAULT_THUMBNAIL_DISK_BUDGET,
        }
    }
}

impl EngineConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            feed: FeedConfig { debounce: settings.debounce() },
            cache_budget: settings.cache_budget(),
            pressure: settings.pressure,
            downloads: DownloadConfig {
                concurrency: settings.download_concurrency,
                queue_depth: settings.download_queue_depth,
                retry: settings.retry,
            },
            thumbnail_edge: DEFAULT_MAX_EDGE,
            thumbnail_disk_budget: settings.thumbnail_disk_budget_bytes,
        }
    }
}

/// Message delivered to the controller thread.
#[derive(Debug)]
pub enum EngineEvent {
    PageLoaded { token: RequestToken, result: Result<Page, CoreError> },
    ThumbnailLoaded { entry: EntryId, result: Result<Arc<Thumbnail>, CoreError> },
    Download(DownloadEvent),
    Pressure(u8),
}

/// Something the UI may want to redraw for.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineUpdate {
    FeedUpdated(MergeOutcome),
    FeedFailed(FeedError),
    ThumbnailReady(EntryId),
    ThumbnailFailed { entry: EntryId, error: CoreError },
    DownloadFinished(DownloadEvent),
    Pressure(PressureOutcome),
}

#[derive(Debug)]
pub struct Engine {
    feed: FeedController,
    cache: Cache,
    store: AssetStore,
    /// Thumbnail copies, kept apart from downloads so they can be pruned.
    thumbs: AssetStore,
    catalog: Arc<dyn CatalogClient>,
    transport: Arc<dyn Transport>,
    applier: WallpaperApplier,
    thumbnails_pending: HashSet<EntryId>,
    thumbnail_edge: u32,
    thumbnail_disk_budget: u64,
    tx: Sender<EngineEvent>,
    rx: Receiver<EngineEvent>,
    downloads: DownloadManager,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        catalog: Arc<dyn CatalogClient>,
        transport: Arc<dyn Transport>,
        store: AssetStore,
        applier: WallpaperApplier,
    ) -> anyhow::Result<Self> {
        Self::with_sleeper(config, catalog, transport, store, applier, Arc::new(ThreadSleeper))
    }

    /// Like [`Engine::new`] with a custom wait between download retries.
    pub fn with_sleeper(
        config: EngineConfig,
        catalog: Arc<dyn CatalogClient>,
        transport: Arc<dyn Transport>,
        store: AssetStore,
        applier: WallpaperApplier,
        sleeper: Arc<dyn Sleeper>,
    ) -> anyhow::Result<Self> {
        let thumbs = AssetStore::open(store.root().join(THUMBNAIL_DIR))?;
        let (tx, rx) = mpsc::channel();
        let download_tx = tx.clone();
        let sink: EventSink = Box::new(move |event| {
            let _ = download_tx.send(EngineEvent::Download(event));
        });
        let downloads = DownloadManager::spawn_with(
            config.downloads,
            Arc::clone(&transport),
            store.clone(),
            sleeper,
            sink,
        )?;

        Ok(Self {
            feed: FeedController::new(config.feed),
            cache: Cache::with_policy(config.cache_budget, config.pressure),
            store,
            thumbs,
            catalog,
            transport,
            applier,
            thumbnails_pending: HashSet::new(),
            thumbnail_edge: config.thumbnail_edge,
            thumbnail_disk_budget: config.thumbnail_disk_budget,
            tx,
            rx,
            downloads,
        })
    }

    /// Replace the feed with one starting from `query`, e.g. the query restored from settings.
    pub fn restore_query(&mut self, query: Query, config: FeedConfig) {
        self.feed = FeedController::with_query(config, query);
    }

    pub fn feed(&self) -> &FeedController {
        &self.feed
    }

    pub fn store(&self) -> &AssetStore {
        &self.store
    }

    pub fn applier(&self) -> &WallpaperApplier {
        &self.applier
    }

    /// Handle for threads that report into this engine.
    pub fn sender(&self) -> Sender<EngineEvent> {
        self.tx.clone()
    }

    /// Poll `source` on a background thread and feed samples into this engine.
    pub fn monitor_pressure<S>(&self, source: S, interval: Duration) -> std::io::Result<PressureMonitor>
    where
        S: PressureSource + 'static,
    {
        let tx = self.tx.clone();
        PressureMonitor::spawn(source, interval, move |percent| tx.send(EngineEvent::Pressure(percent)).is_ok())
    }

    pub fn submit(&mut self, intent: FeedIntent, now: Instant) {
        if let Some(ticket) = self.feed.submit_intent(intent, now) {
            self.dispatch(ticket);
        }
    }

    /// Process events for up to `timeout`, returning as soon as at least one produced an update.
    /// Debounce deadlines that expire meanwhile are committed.
    pub fn pump(&mut self, timeout: Duration) -> Vec<EngineUpdate> {
        let until = Instant::now() + timeout;
        let mut updates = Vec::new();
        loop {
            let now = Instant::now();
            if let Some(ticket) = self.feed.poll(now) {
                self.dispatch(ticket);
            }

            let wake = self.feed.next_deadline().map_or(until, |deadline| deadline.min(until));
            match self.rx.recv_timeout(wake.saturating_duration_since(now)) {
                Ok(event) => {
                    self.handle(event, &mut updates);
                    while let Ok(event) = self.rx.try_recv() {
                        self.handle(event, &mut updates);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }

            if !updates.is_empty() || Instant::now() >= until {
                break;
            }
        }
        updates
    }

    /// Decoded thumbnail for an entry, if it is resident.
    pub fn thumbnail(&mut self, entry: &EntryId) -> Option<Arc<Thumbnail>> {
        match self.cache.get(&thumbnail_key(entry))?.value {
            CacheValue::Decoded(thumb) => Some(thumb),
            CacheValue::Asset(_) => None,
        }
    }

    /// Keep an entry's thumbnail resident regardless of pressure, e.g. while it is on screen.
    pub fn pin_thumbnail(&mut self, entry: &EntryId) -> bool {
        self.cache.pin(&thumbnail_key(entry))
    }

    pub fn unpin_thumbnail(&mut self, entry: &EntryId) -> Option<u32> {
        self.cache.unpin(&thumbnail_key(entry))
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn download(&self, entry: &CatalogEntry) -> Result<TaskHandle, EnqueueError> {
        self.downloads.enqueue(entry)
    }

    pub fn try_download(&self, entry: &CatalogEntry) -> Result<TaskHandle, EnqueueError> {
        self.downloads.try_enqueue(entry)
    }

    pub fn download_status(&self, id: TaskId) -> Option<TaskStatus> {
        self.downloads.status(id)
    }

    pub fn acknowledge(&self, id: TaskId) -> bool {
        self.downloads.acknowledge(id)
    }

    /// Apply a downloaded entry. The asset reference stays pinned in the cache for the call.
    pub fn apply(
        &mut self,
        entry: &CatalogEntry,
        mut request: ApplyRequest,
    ) -> crate::Result<AppliedWallpaper> {
        let key = AssetKey::full(entry);
        let path = self.store.path_for(&key);
        if !self.store.contains(&key) {
            return Err(CoreError::AssetMissing(path));
        }
        request.path = path;

        let cache_key = key.name().to_string();
        if !self.cache.contains(&cache_key) {
            self.cache.put(cache_key.clone(), CacheValue::Asset(key), Some(file_len(&request.path)));
        }
        let pinned = self.cache.pin(&cache_key);
        let result = self.applier.apply(&request);
        if pinned {
            self.cache.unpin(&cache_key);
        }
        result
    }

    fn dispatch(&mut self, ticket: FetchTicket) {
        let catalog = Arc::clone(&self.catalog);
        let tx = self.tx.clone();
        let FetchTicket { token, query } = ticket;
        let spawned = thread::Builder::new().name("wselector-fetch".into()).spawn(move || {
            let result = catalog.fetch_page(&query);
            let _ = tx.send(EngineEvent::PageLoaded { token, result });
        });
        if let Err(err) = spawned {
            let error = CoreError::Network {
                transient: true,
                status: None,
                message: format!("spawning fetch thread: {err}"),
            };
            let _ = self.tx.send(EngineEvent::PageLoaded { token, result: Err(error) });
        }
    }

    fn handle(&mut self, event: EngineEvent, updates: &mut Vec<EngineUpdate>) {
        match event {
            EngineEvent::PageLoaded { token, result } => match self.feed.on_page(token, result) {
                MergeOutcome::Stale => {}
                MergeOutcome::Failed => {
                    if let Some(error) = self.feed.last_error() {
                        updates.push(EngineUpdate::FeedFailed(error.clone()));
                    }
                }
                outcome @ MergeOutcome::Merged { added, .. } => {
                    let entries = self.feed.entries();
                    let fresh = entries[entries.len().saturating_sub(added)..].to_vec();
                    self.prefetch_thumbnails(fresh);
                    updates.push(EngineUpdate::FeedUpdated(outcome));
                }
            },
            EngineEvent::ThumbnailLoaded { entry, result } => {
                self.thumbnails_pending.remove(&entry);
                match result {
                    Ok(thumb) => {
                        self.cache.put(thumbnail_key(&entry), CacheValue::Decoded(thumb), None);
                        updates.push(EngineUpdate::ThumbnailReady(entry));
                    }
                    Err(error) => {
                        debug!(entry = %entry, %error, "thumbnail unavailable");
                        updates.push(EngineUpdate::ThumbnailFailed { entry, error });
                    }
                }
            }
            EngineEvent::Download(event) => {
                if let DownloadEvent::Succeeded { task, path, .. } = &event {
                    let name = format!("full::{}", task.entry);
                    let extension = path.extension().and_then(|ext| ext.to_str()).unwrap_or("jpg");
                    let key = AssetKey::new(name.clone(), extension);
                    self.cache.put(name, CacheValue::Asset(key), Some(file_len(path)));
                }
                updates.push(EngineUpdate::DownloadFinished(event));
            }
            EngineEvent::Pressure(percent) => {
                let outcome = self.cache.on_pressure(percent);
                if matches!(outcome, PressureOutcome::Unrelieved { .. }) {
                    warn!(percent, "memory pressure not relieved");
                }
                updates.push(EngineUpdate::Pressure(outcome));
            }
        }
    }

    /// Load thumbnails for new entries on one background thread, reusing stored copies.
    fn prefetch_thumbnails(&mut self, entries: Vec<CatalogEntry>) {
        let wanted: Vec<CatalogEntry> = entries
            .into_iter()
            .filter(|entry| {
                !self.cache.contains(&thumbnail_key(&entry.id))
                    && self.thumbnails_pending.insert(entry.id.clone())
            })
            .collect();
        if wanted.is_empty() {
            return;
        }

        let store = self.thumbs.clone();
        let transport = Arc::clone(&self.transport);
        let tx = self.tx.clone();
        let edge = self.thumbnail_edge;
        let disk_budget = self.thumbnail_disk_budget;
        let ids: Vec<EntryId> = wanted.iter().map(|entry| entry.id.clone()).collect();
        let spawned = thread::Builder::new().name("wselector-thumbs".into()).spawn(move || {
            for entry in wanted {
                let result = load_thumbnail(&store, transport.as_ref(), &entry, edge).map(Arc::new);
                if tx.send(EngineEvent::ThumbnailLoaded { entry: entry.id, result }).is_err() {
                    break;
                }
            }
            match store.prune_to(disk_budget) {
                Ok(report) if report.removed > 0 => {
                    debug!(removed = report.removed, freed = report.freed_bytes, "pruned stored thumbnails");
                }
                Ok(_) => {}
                Err(err) => warn!(%err, "thumbnail pruning failed"),
            }
        });
        if let Err(err) = spawned {
            warn!(%err, "could not start thumbnail prefetch");
            for id in ids {
                self.thumbnails_pending.remove(&id);
            }
        }
    }
}

/// Subdirectory of the asset store that holds thumbnail copies.
const THUMBNAIL_DIR: &str = "thumbs";

fn thumbnail_key(entry: &EntryId) -> String {
    format!("thumb::{entry}")
}

fn file_len(path: &std::path::Path) -> usize {
    std::fs::metadata(path).map(|meta| meta.len() as usize).unwrap_or(0)
}

fn load_thumbnail(
    store: &AssetStore,
    transport: &dyn Transport,
    entry: &CatalogEntry,
    edge: u32,
) -> Result<Thumbnail, CoreError> {
    let key = AssetKey::thumbnail(entry);
    let bytes = match store.read(&key)? {
        Some(bytes) => {
            if let Err(err) = store.touch(&key) {
                debug!(%err, "could not refresh thumbnail age");
            }
            bytes
        }
        None => {
            let bytes = fetch_bytes(transport, &entry.thumbnail_url)?;
            store.write(&key, &bytes)?;
            bytes
        }
    };
    decode_thumbnail(&bytes, Some(key.extension()), edge)
}
