//! Worker pool: a bounded keyed cache of live workers.
//!
//! Keys are app directories (not AppKeys, so two selectors resolving to
//! the same directory share one worker). One mutex guards the map and
//! the creation-in-flight set; critical sections are lookups and
//! transitions only, never worker I/O. Waits (another caller's creation,
//! capacity) poll on the configured delay granularity.

use crate::error::DispatchError;
use crate::launcher::WorkerLauncher;
use crate::metrics::{Counters, PoolMetrics, StatsSnapshot, WorkerStats};
use crate::worker_handle::{WorkerHandle, WorkerReply};
use polyserve_protocol::{
    defaults, ErrorKind, WireRequest, WireResponse, WorkerConfig, WorkerStatus,
};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{info, warn};

/// How often the reaper scans for idle/expired workers.
const REAP_INTERVAL_MS: u64 = 200;

type CreationResult = Result<Arc<WorkerEntry>, DispatchError>;

/// One live worker slot.
pub struct WorkerEntry {
    pub key: String,
    pub config: WorkerConfig,
    pub created_at: Instant,
    handle: WorkerHandle,
    state: Mutex<WorkerStatus>,
    last_active: Mutex<Instant>,
    request_count: AtomicU64,
    draining: AtomicBool,
    /// FIFO single-flight: one request at a time per worker.
    serve_lock: tokio::sync::Mutex<()>,
}

impl WorkerEntry {
    pub fn status(&self) -> WorkerStatus {
        if self.draining.load(Ordering::Acquire) {
            return WorkerStatus::Draining;
        }
        *lock(&self.state)
    }

    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::Relaxed)
    }

    pub fn last_active(&self) -> Instant {
        *lock(&self.last_active)
    }

    fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    fn mark_draining(&self) {
        self.draining.store(true, Ordering::Release);
    }

    /// Serve one request on this worker, FIFO-queued behind any request
    /// already in flight. A request that dequeues onto a worker that
    /// already went away fails the same way the request that observed
    /// the failure did; any retry policy is the caller's.
    async fn serve(&self, req: &WireRequest) -> Result<WireResponse, DispatchError> {
        let _permit = self.serve_lock.lock().await;

        if self.is_draining() || self.handle.is_closed() {
            return Err(DispatchError::new(
                ErrorKind::WorkerCrashed,
                "worker went away before the request was sent",
            ));
        }

        *lock(&self.state) = WorkerStatus::Busy;
        let result = self
            .handle
            .request(req, effective_timeout(self.config.timeout_ms))
            .await;
        *lock(&self.state) = WorkerStatus::Ready;
        *lock(&self.last_active) = Instant::now();

        match result {
            Ok(WorkerReply::Response(res)) => {
                self.request_count.fetch_add(1, Ordering::Relaxed);
                Ok(res)
            }
            Ok(WorkerReply::AppError(payload)) => {
                // The app ran and failed; that still consumed a request.
                self.request_count.fetch_add(1, Ordering::Relaxed);
                Err(DispatchError::new(payload.kind, payload.message))
            }
            Err(err) => Err(err),
        }
    }
}

struct PoolInner {
    workers: HashMap<String, Arc<WorkerEntry>>,
    creating: HashMap<String, watch::Receiver<Option<CreationResult>>>,
}

pub struct Pool {
    inner: Mutex<PoolInner>,
    launcher: Arc<dyn WorkerLauncher>,
    capacity: usize,
    delay: Duration,
    shutting_down: AtomicBool,
    draining_gauge: AtomicUsize,
    counters: Counters,
    started_at: Instant,
}

enum Plan {
    Use(Arc<WorkerEntry>),
    WaitCreation(watch::Receiver<Option<CreationResult>>),
    Evict(Arc<WorkerEntry>),
    Create(watch::Sender<Option<CreationResult>>),
    WaitCapacity,
}

impl Pool {
    pub fn new(launcher: Arc<dyn WorkerLauncher>, capacity: usize, delay_ms: u64) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(PoolInner {
                workers: HashMap::new(),
                creating: HashMap::new(),
            }),
            launcher,
            capacity: capacity.max(1),
            delay: Duration::from_millis(delay_ms.max(1)),
            shutting_down: AtomicBool::new(false),
            draining_gauge: AtomicUsize::new(0),
            counters: Counters::default(),
            started_at: Instant::now(),
        })
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Config cached with a live worker, if one exists for this key.
    pub fn cached_config(&self, app_dir: &Path) -> Option<WorkerConfig> {
        let inner = lock(&self.inner);
        inner
            .workers
            .get(&key_for(app_dir))
            .map(|entry| entry.config.clone())
    }

    /// The worker stage: obtain a worker for the key and serve the
    /// request on it. Timeouts terminate the worker; crashes remove it
    /// and fail every request bound to it, queued ones included.
    pub async fn serve(
        self: &Arc<Self>,
        app_dir: &Path,
        config: &WorkerConfig,
        req: &WireRequest,
    ) -> Result<WireResponse, DispatchError> {
        if self.is_shutting_down() {
            return Err(DispatchError::shutting_down());
        }

        self.counters.inc_total_requests();
        self.counters.inc_pending();
        let result = self.serve_inner(app_dir, config, req).await;
        self.counters.dec_pending();
        result
    }

    async fn serve_inner(
        self: &Arc<Self>,
        app_dir: &Path,
        config: &WorkerConfig,
        req: &WireRequest,
    ) -> Result<WireResponse, DispatchError> {
        let entry = self.get_or_create(app_dir, config).await?;
        match entry.serve(req).await {
            Ok(res) => {
                self.maybe_retire_after_request(&entry);
                Ok(res)
            }
            Err(err) if err.kind == ErrorKind::WorkerTimeout => {
                warn!(key = %entry.key, "worker timed out; terminating");
                self.remove_entry(&entry);
                let handle_entry = Arc::clone(&entry);
                tokio::spawn(async move { handle_entry.handle.kill_now().await });
                Err(err)
            }
            Err(err) if err.kind == ErrorKind::WorkerCrashed => {
                warn!(key = %entry.key, "worker crashed");
                self.remove_entry(&entry);
                Err(err)
            }
            Err(err) => {
                // App-level failure: the worker is healthy.
                self.maybe_retire_after_request(&entry);
                Err(err)
            }
        }
    }

    /// Return a Ready worker for the key, creating one if absent.
    /// Concurrent callers for the same key share one creation (and its
    /// error). At capacity the least-recently-used Ready worker is
    /// evicted; with none evictable the caller waits.
    pub async fn get_or_create(
        self: &Arc<Self>,
        app_dir: &Path,
        config: &WorkerConfig,
    ) -> Result<Arc<WorkerEntry>, DispatchError> {
        let key = key_for(app_dir);
        loop {
            if self.is_shutting_down() {
                return Err(DispatchError::shutting_down());
            }

            let plan = self.plan_for(&key);
            match plan {
                Plan::Use(entry) => return Ok(entry),
                Plan::WaitCreation(mut rx) => {
                    match rx.wait_for(|slot| slot.is_some()).await {
                        Ok(slot) => {
                            if let Some(result) = slot.as_ref() {
                                return result.clone();
                            }
                        }
                        Err(_) => {
                            // Creator vanished; retry from scratch.
                        }
                    }
                }
                Plan::Evict(victim) => {
                    info!(key = %victim.key, "evicting LRU worker for capacity");
                    self.counters.inc_workers_reaped();
                    self.retire_in_background(victim);
                }
                Plan::Create(tx) => {
                    let result = self.create_worker(&key, app_dir, config).await;
                    {
                        let mut inner = lock(&self.inner);
                        inner.creating.remove(&key);
                        if let Ok(entry) = &result {
                            inner.workers.insert(key.clone(), Arc::clone(entry));
                        }
                    }
                    let _ = tx.send(Some(result.clone()));

                    if self.is_shutting_down() {
                        if let Ok(entry) = &result {
                            self.remove_entry(entry);
                            self.retire_in_background(Arc::clone(entry));
                        }
                        return Err(DispatchError::shutting_down());
                    }
                    return result;
                }
                Plan::WaitCapacity => {
                    tokio::time::sleep(self.delay).await;
                }
            }
        }
    }

    fn plan_for(&self, key: &str) -> Plan {
        let mut inner = lock(&self.inner);

        let mut drop_stale = false;
        match inner.workers.get(key) {
            Some(entry) if !entry.is_draining() && !entry.handle.is_closed() => {
                return Plan::Use(Arc::clone(entry));
            }
            Some(entry) => {
                // A dead entry still mapped: clear it and fall through.
                entry.mark_draining();
                drop_stale = true;
            }
            None => {}
        }
        if drop_stale {
            inner.workers.remove(key);
        }

        match inner.creating.get(key) {
            // A dropped sender with no value means the creator was
            // cancelled mid-flight; clear the slot so creation can rerun.
            Some(rx) if rx.has_changed().is_err() && rx.borrow().is_none() => {
                inner.creating.remove(key);
            }
            Some(rx) => return Plan::WaitCreation(rx.clone()),
            None => {}
        }

        if inner.workers.len() + inner.creating.len() >= self.capacity {
            let victim = inner
                .workers
                .values()
                .filter(|e| e.status() == WorkerStatus::Ready && !e.handle.is_closed())
                .min_by_key(|e| e.last_active())
                .map(Arc::clone);
            return match victim {
                Some(victim) => {
                    victim.mark_draining();
                    inner.workers.remove(&victim.key);
                    Plan::Evict(victim)
                }
                None => Plan::WaitCapacity,
            };
        }

        let (tx, rx) = watch::channel(None);
        inner.creating.insert(key.to_string(), rx);
        Plan::Create(tx)
    }

    async fn create_worker(
        &self,
        key: &str,
        app_dir: &Path,
        config: &WorkerConfig,
    ) -> CreationResult {
        let launched = self.launcher.launch(app_dir, config).await?;
        let handle =
            WorkerHandle::establish(launched, effective_timeout(config.timeout_ms)).await?;

        self.counters.inc_workers_spawned();
        info!(%key, "worker ready");

        Ok(Arc::new(WorkerEntry {
            key: key.to_string(),
            config: config.clone(),
            created_at: Instant::now(),
            handle,
            state: Mutex::new(WorkerStatus::Ready),
            last_active: Mutex::new(Instant::now()),
            request_count: AtomicU64::new(0),
            draining: AtomicBool::new(false),
            serve_lock: tokio::sync::Mutex::new(()),
        }))
    }

    /// Remove the entry from the map if it is still the mapped worker
    /// for its key.
    fn remove_entry(&self, entry: &Arc<WorkerEntry>) {
        entry.mark_draining();
        let mut inner = lock(&self.inner);
        if let Some(current) = inner.workers.get(&entry.key) {
            if Arc::ptr_eq(current, entry) {
                inner.workers.remove(&entry.key);
            }
        }
    }

    /// Enforce `maxRequests` after the response that reached the limit.
    fn maybe_retire_after_request(self: &Arc<Self>, entry: &Arc<WorkerEntry>) {
        let max = entry.config.max_requests;
        if max > 0 && entry.request_count() >= max && !entry.is_draining() {
            info!(key = %entry.key, count = entry.request_count(), "request budget reached");
            self.remove_entry(entry);
            self.counters.inc_workers_reaped();
            self.retire_in_background(Arc::clone(entry));
        }
    }

    fn retire_in_background(self: &Arc<Self>, entry: Arc<WorkerEntry>) {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            pool.draining_gauge.fetch_add(1, Ordering::Relaxed);
            entry.handle.send_idle().await;
            entry
                .handle
                .shutdown(Duration::from_millis(defaults::TERMINATE_GRACE_MS))
                .await;
            pool.draining_gauge.fetch_sub(1, Ordering::Relaxed);
        });
    }

    /// Background reaper: idle, TTL, and broken-transport cleanup.
    pub fn spawn_reaper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_millis(REAP_INTERVAL_MS));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                if pool.is_shutting_down() {
                    break;
                }
                pool.reap_once();
            }
        })
    }

    fn reap_once(self: &Arc<Self>) {
        let now = Instant::now();
        let victims: Vec<Arc<WorkerEntry>> = {
            let mut inner = lock(&self.inner);
            let keys: Vec<String> = inner
                .workers
                .iter()
                .filter(|(_, e)| should_reap(e, now))
                .map(|(k, _)| k.clone())
                .collect();
            keys.iter()
                .filter_map(|k| inner.workers.remove(k))
                .collect()
        };

        for victim in victims {
            victim.mark_draining();
            info!(key = %victim.key, age_ms = victim.created_at.elapsed().as_millis() as u64, "reaping worker");
            self.counters.inc_workers_reaped();
            self.retire_in_background(victim);
        }
    }

    /// Snapshot of pool-level counters and gauges.
    pub fn metrics(&self) -> PoolMetrics {
        let (active, idle, spawning) = {
            let inner = lock(&self.inner);
            let active = inner
                .workers
                .values()
                .filter(|e| e.status() == WorkerStatus::Busy)
                .count();
            let idle = inner
                .workers
                .values()
                .filter(|e| e.status() == WorkerStatus::Ready)
                .count();
            (active, idle, inner.creating.len())
        };

        PoolMetrics {
            active_workers: active,
            idle_workers: idle,
            spawning_workers: spawning,
            draining_workers: self.draining_gauge.load(Ordering::Relaxed),
            pending_requests: self.counters.pending_requests.load(Ordering::Relaxed),
            total_requests: self.counters.total_requests.load(Ordering::Relaxed),
            total_errors: self.counters.total_errors.load(Ordering::Relaxed),
            proxied_requests: self.counters.proxied_requests.load(Ordering::Relaxed),
            workers_spawned: self.counters.workers_spawned.load(Ordering::Relaxed),
            workers_reaped: self.counters.workers_reaped.load(Ordering::Relaxed),
            uptime: self.started_at.elapsed().as_secs(),
        }
    }

    /// Pool metrics plus the per-worker table.
    pub fn stats(&self) -> StatsSnapshot {
        let workers: BTreeMap<String, WorkerStats> = {
            let inner = lock(&self.inner);
            inner
                .workers
                .iter()
                .map(|(key, entry)| {
                    (
                        key.clone(),
                        WorkerStats {
                            age: entry.created_at.elapsed().as_millis() as u64,
                            idle: entry.last_active().elapsed().as_millis() as u64,
                            request_count: entry.request_count(),
                            status: entry.status(),
                        },
                    )
                })
                .collect()
        };

        StatsSnapshot {
            pool: self.metrics(),
            workers,
        }
    }

    /// Drain every worker; new requests are refused from the first call.
    pub async fn shutdown(self: &Arc<Self>) {
        self.shutting_down.store(true, Ordering::Release);

        let entries: Vec<Arc<WorkerEntry>> = {
            let mut inner = lock(&self.inner);
            inner.workers.drain().map(|(_, entry)| entry).collect()
        };

        info!(workers = entries.len(), "draining pool");
        let grace = Duration::from_millis(defaults::TERMINATE_GRACE_MS);
        let drains = entries.into_iter().map(|entry| async move {
            entry.mark_draining();
            entry.handle.shutdown(grace).await;
        });
        futures::future::join_all(drains).await;
    }
}

fn should_reap(entry: &Arc<WorkerEntry>, now: Instant) -> bool {
    if entry.handle.is_closed() {
        return true;
    }
    let config = &entry.config;
    if config.ttl_ms > 0 && now.duration_since(entry.created_at).as_millis() as u64 >= config.ttl_ms
    {
        return true;
    }
    if config.idle_timeout_ms > 0
        && entry.status() == WorkerStatus::Ready
        && now.duration_since(entry.last_active()).as_millis() as u64 >= config.idle_timeout_ms
    {
        return true;
    }
    false
}

fn key_for(app_dir: &Path) -> String {
    app_dir.display().to_string()
}

/// Per-request timeout; 0 disables (bounded by an hour so a stuck
/// worker cannot pin a slot forever).
fn effective_timeout(timeout_ms: u64) -> Duration {
    if timeout_ms == 0 {
        Duration::from_secs(3600)
    } else {
        Duration::from_millis(timeout_ms)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // Lock poisoning cannot happen: holders never panic while holding it.
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
