//! Background job queue and refresh loops
//!
//! A small worker pool drains a keyed queue: one catalog refresh per
//! portal and one EPG sweep may be queued or running at a time; duplicate
//! requests collapse into the pending entry. Two interval loops feed the
//! queue on the configured cadence, and both survive panics in their
//! ticks by being respawned.

use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{error, info, warn};

use crate::catalog::CatalogService;
use crate::config::ConfigStore;
use crate::epg::EpgService;
use crate::models::RefreshStats;

const MAX_RETRIES: u32 = 2;
const WORKERS: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum JobKey {
    Portal(String),
    Epg,
}

#[derive(Debug, Clone)]
enum Job {
    RefreshPortal { portal_id: String, reason: String },
    RefreshEpg { source_ids: Option<Vec<String>> },
}

impl Job {
    fn key(&self) -> JobKey {
        match self {
            Job::RefreshPortal { portal_id, .. } => JobKey::Portal(portal_id.clone()),
            Job::RefreshEpg { .. } => JobKey::Epg,
        }
    }
}

/// Admin-visible refresh state for one portal
#[derive(Debug, Clone, Default, Serialize)]
pub struct PortalRefreshStatus {
    pub status: String,
    pub reason: String,
    pub queued_at: Option<String>,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub error: Option<String>,
    pub stats: Option<RefreshStats>,
}

struct JobState {
    queue: VecDeque<Job>,
    queued_keys: HashSet<JobKey>,
    in_flight: HashSet<JobKey>,
}

struct JobInner {
    catalog: Arc<CatalogService>,
    epg: Arc<EpgService>,
    config: ConfigStore,
    state: Mutex<JobState>,
    notify: Notify,
    portal_status: Mutex<std::collections::HashMap<String, PortalRefreshStatus>>,
}

#[derive(Clone)]
pub struct JobManager {
    inner: Arc<JobInner>,
}

impl JobManager {
    pub fn new(catalog: Arc<CatalogService>, epg: Arc<EpgService>, config: ConfigStore) -> Self {
        Self {
            inner: Arc::new(JobInner {
                catalog,
                epg,
                config,
                state: Mutex::new(JobState {
                    queue: VecDeque::new(),
                    queued_keys: HashSet::new(),
                    in_flight: HashSet::new(),
                }),
                notify: Notify::new(),
                portal_status: Mutex::new(std::collections::HashMap::new()),
            }),
        }
    }

    /// Spawn the worker pool. Call once at startup.
    pub fn start(&self) {
        for worker in 0..WORKERS {
            let inner = self.inner.clone();
            tokio::spawn(async move {
                loop {
                    let job = {
                        let mut state = inner.state.lock().expect("job state poisoned");
                        match state.queue.pop_front() {
                            Some(job) => {
                                let key = job.key();
                                state.queued_keys.remove(&key);
                                state.in_flight.insert(key);
                                Some(job)
                            }
                            None => None,
                        }
                    };

                    match job {
                        Some(job) => {
                            let key = job.key();
                            run_job(&inner, job, worker).await;
                            inner
                                .state
                                .lock()
                                .expect("job state poisoned")
                                .in_flight
                                .remove(&key);
                        }
                        None => inner.notify.notified().await,
                    }
                }
            });
        }
    }

    /// Returns "running" when the job is already executing, "queued" when
    /// it was (or already had been) enqueued.
    pub fn enqueue_portal_refresh(&self, portal_id: &str, reason: &str) -> &'static str {
        self.enqueue(Job::RefreshPortal {
            portal_id: portal_id.to_string(),
            reason: reason.to_string(),
        })
    }

    pub fn enqueue_epg_refresh(&self, source_ids: Option<Vec<String>>) -> &'static str {
        self.enqueue(Job::RefreshEpg { source_ids })
    }

    /// Queue every enabled portal; returns how many were accepted.
    pub fn enqueue_all_portals(&self, reason: &str) -> usize {
        let mut enqueued = 0usize;
        for (portal_id, portal) in self.inner.config.portals() {
            if portal.enabled {
                self.enqueue_portal_refresh(&portal_id, reason);
                enqueued += 1;
            }
        }
        enqueued
    }

    fn enqueue(&self, job: Job) -> &'static str {
        let key = job.key();
        let status = {
            let mut state = self.inner.state.lock().expect("job state poisoned");
            let running = state.in_flight.contains(&key);
            // One pending entry per key: a request while a run is in
            // flight queues exactly one follow-up, further requests
            // collapse into it.
            if !state.queued_keys.contains(&key) {
                state.queued_keys.insert(key.clone());
                state.queue.push_back(job.clone());
            }
            if running {
                "running"
            } else {
                "queued"
            }
        };

        if let Job::RefreshPortal { portal_id, reason } = &job {
            if status == "queued" {
                let mut statuses = self
                    .inner
                    .portal_status
                    .lock()
                    .expect("portal status poisoned");
                statuses.insert(
                    portal_id.clone(),
                    PortalRefreshStatus {
                        status: "queued".into(),
                        reason: reason.clone(),
                        queued_at: Some(now_iso()),
                        ..Default::default()
                    },
                );
            }
        }

        self.inner.notify.notify_one();
        status
    }

    pub fn portal_status(&self, portal_id: &str) -> Option<PortalRefreshStatus> {
        self.inner
            .portal_status
            .lock()
            .expect("portal status poisoned")
            .get(portal_id)
            .cloned()
    }
}

async fn run_job(inner: &Arc<JobInner>, job: Job, worker: usize) {
    match job {
        Job::RefreshPortal { portal_id, reason } => {
            info!("Worker {worker}: refresh_portal {portal_id} (reason: {reason})");
            mark_status(inner, &portal_id, |status| {
                status.status = "running".into();
                status.started_at = Some(now_iso());
            });

            let mut attempt = 0u32;
            loop {
                match inner.catalog.refresh_portal(&portal_id).await {
                    Ok(stats) => {
                        mark_status(inner, &portal_id, |status| {
                            status.status = "completed".into();
                            status.completed_at = Some(now_iso());
                            status.error = None;
                            status.stats = Some(stats.clone());
                        });
                        // A fresh catalog invalidates the portal's guide
                        let fetch_epg = inner
                            .config
                            .portal(&portal_id)
                            .map(|p| p.fetch_epg)
                            .unwrap_or(false);
                        if fetch_epg {
                            let mut state = inner.state.lock().expect("job state poisoned");
                            let key = JobKey::Epg;
                            if !state.in_flight.contains(&key) && !state.queued_keys.contains(&key)
                            {
                                state.queued_keys.insert(key);
                                state.queue.push_back(Job::RefreshEpg {
                                    source_ids: Some(vec![portal_id.clone()]),
                                });
                                inner.notify.notify_one();
                            }
                        }
                        break;
                    }
                    Err(err) if attempt < MAX_RETRIES => {
                        attempt += 1;
                        let backoff = Duration::from_secs(2u64.pow(attempt).min(60));
                        warn!(
                            "refresh_portal {portal_id} failed (retry {attempt}/{MAX_RETRIES} in {backoff:?}): {err}"
                        );
                        tokio::time::sleep(backoff).await;
                    }
                    Err(err) => {
                        error!("refresh_portal {portal_id} failed permanently: {err}");
                        mark_status(inner, &portal_id, |status| {
                            status.status = "error".into();
                            status.completed_at = Some(now_iso());
                            status.error = Some(err.to_string());
                        });
                        break;
                    }
                }
            }
        }
        Job::RefreshEpg { source_ids } => {
            info!("Worker {worker}: refresh_epg (scope: {source_ids:?})");
            match inner.epg.refresh_all(source_ids.as_deref()).await {
                Ok(count) => info!("EPG sweep refreshed {count} sources"),
                Err(err) => error!("EPG sweep failed: {err}"),
            }
        }
    }
}

fn mark_status<F>(inner: &Arc<JobInner>, portal_id: &str, mutate: F)
where
    F: FnOnce(&mut PortalRefreshStatus),
{
    let mut statuses = inner.portal_status.lock().expect("portal status poisoned");
    mutate(statuses.entry(portal_id.to_string()).or_default());
}

fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Respawn a loop task when it panics; background loops never take the
/// process down.
pub fn spawn_supervised<F, Fut>(name: &'static str, factory: F)
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            let handle = tokio::spawn(factory());
            match handle.await {
                Ok(()) => break,
                Err(err) if err.is_panic() => {
                    error!("{name} loop panicked, restarting: {err}");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
                Err(_) => break,
            }
        }
    });
}

/// Catalog loop: every `CHANNEL_REFRESH_INTERVAL` hours (0 disables),
/// enqueue a refresh for each enabled portal.
pub fn spawn_catalog_loop(
    manager: JobManager,
    config: ConfigStore,
    interval_override: Option<f64>,
) {
    spawn_supervised("catalog", move || {
        let manager = manager.clone();
        let config = config.clone();
        async move {
            loop {
                let hours =
                    interval_override.unwrap_or_else(|| config.settings().channel_refresh_interval);
                if hours <= 0.0 {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    continue;
                }
                let sleep_seconds = ((hours * 3600.0) as u64).max(60);
                info!("Catalog loop: next refresh in {sleep_seconds}s");
                tokio::time::sleep(Duration::from_secs(sleep_seconds)).await;
                let queued = manager.enqueue_all_portals("scheduled");
                info!("Catalog loop: queued {queued} portal refreshes");
            }
        }
    });
}

/// EPG loop: every `EPG_REFRESH_INTERVAL` hours, sweep all enabled
/// sources; failed sources are skipped until their next interval.
pub fn spawn_epg_loop(manager: JobManager, config: ConfigStore, interval_override: Option<f64>) {
    spawn_supervised("epg", move || {
        let manager = manager.clone();
        let config = config.clone();
        async move {
            loop {
                let hours =
                    interval_override.unwrap_or_else(|| config.settings().epg_refresh_interval);
                let sleep_seconds = ((hours.max(0.01) * 3600.0) as u64).max(60);
                info!("EPG loop: next refresh in {sleep_seconds}s");
                tokio::time::sleep(Duration::from_secs(sleep_seconds)).await;
                manager.enqueue_epg_refresh(None);
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::test_support::{raw_channel, test_config, StubConnector, StubPortal};
    use crate::database::test_database;
    use crate::matching::StationDirectory;

    async fn manager_with_stub(portal: Arc<StubPortal>) -> (JobManager, crate::database::Database) {
        let database = test_database().await;
        let config = test_config("p1", &["00:1A:79:AA"]);
        let connector = Arc::new(StubConnector(portal));
        let catalog = Arc::new(CatalogService::new(
            database.clone(),
            config.clone(),
            connector.clone(),
            Arc::new(StationDirectory::empty(0.65)),
        ));
        let epg = Arc::new(EpgService::new(
            database.clone(),
            config.clone(),
            connector,
            std::env::temp_dir().join("stalker-proxy-jobs-test"),
        ));
        (JobManager::new(catalog, epg, config), database)
    }

    #[tokio::test]
    async fn duplicate_enqueues_collapse() {
        let stub = Arc::new(StubPortal::default());
        let (manager, _db) = manager_with_stub(stub).await;

        assert_eq!(manager.enqueue_portal_refresh("p1", "manual"), "queued");
        assert_eq!(manager.enqueue_portal_refresh("p1", "manual"), "queued");
        let state = manager.inner.state.lock().unwrap();
        assert_eq!(state.queue.len(), 1, "second enqueue collapsed");
    }

    #[tokio::test]
    async fn worker_processes_queue_and_records_status() {
        let stub = Arc::new(StubPortal::default());
        stub.set_channels(
            "00:1A:79:AA",
            vec![raw_channel("1", "BBC One", "ffmpeg http://localhost/ch/1")],
        );
        let (manager, database) = manager_with_stub(stub).await;
        manager.start();

        manager.enqueue_portal_refresh("p1", "test");
        for _ in 0..100 {
            if let Some(status) = manager.portal_status("p1") {
                if status.status == "completed" {
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let status = manager.portal_status("p1").unwrap();
        assert_eq!(status.status, "completed");
        assert!(status.stats.is_some());
        assert!(database.get_channel("p1", "1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn failed_refresh_ends_in_error_status() {
        let stub = Arc::new(StubPortal::default());
        stub.fail_mac("00:1A:79:AA");
        let (manager, _db) = manager_with_stub(stub).await;
        manager.start();

        manager.enqueue_portal_refresh("p1", "test");
        for _ in 0..400 {
            if let Some(status) = manager.portal_status("p1") {
                if status.status == "error" {
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let status = manager.portal_status("p1").unwrap();
        assert_eq!(status.status, "error");
        assert!(status.error.is_some());
    }

    #[tokio::test]
    async fn supervised_loop_restarts_after_panic() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let runs = Arc::new(AtomicUsize::new(0));
        let runs_clone = runs.clone();
        spawn_supervised("test", move || {
            let runs = runs_clone.clone();
            async move {
                let n = runs.fetch_add(1, Ordering::SeqCst);
                if n == 0 {
                    panic!("first run dies");
                }
                // Second run exits cleanly
            }
        });
        // First run panics immediately; the supervisor waits 5s before the
        // restart, so pause the clock-free way: poll with generous budget.
        tokio::time::pause();
        for _ in 0..200 {
            tokio::time::advance(Duration::from_millis(100)).await;
            if runs.load(Ordering::SeqCst) >= 2 {
                break;
            }
        }
        assert!(
            runs.load(Ordering::SeqCst) >= 2,
            "loop restarted after panic"
        );
    }
}
