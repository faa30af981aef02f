use anyhow::{Result, Context};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::cli::config::DispatcherConfig;
use crate::dispatch::job::JobStatus;
use crate::dispatch::store::TaskStore;
use crate::dispatch::worker::{WorkerContext, WorkerPool};
use crate::proxy::{ProxyPool, ProxyStore};
use crate::session::CookieCache;
use crate::utils::metrics::DispatchMetrics;

/// Drives dispatch plus the proxy, cookie and reconciliation ticks.
///
/// Dispatch runs in the scheduling loop; each maintenance tick runs in its
/// own task so a slow sweep never holds up dispatch. The workers do the
/// fetching.
pub struct Scheduler {
    store: Arc<dyn TaskStore>,
    pool: WorkerPool,
    proxies: Option<Arc<ProxyPool>>,
    proxy_store: Arc<dyn ProxyStore>,
    cookies: Arc<CookieCache>,
    metrics: DispatchMetrics,

    batch_size: usize,
    stale_after: Duration,
    tick_interval: Duration,
    proxy_interval: Duration,
    cookie_interval: Duration,
    reconcile_interval: Duration,
}

impl Scheduler {
    /// Starts the worker pool right away
    pub fn new(
        config: &DispatcherConfig,
        context: Arc<WorkerContext>,
        proxies: Option<Arc<ProxyPool>>,
        proxy_store: Arc<dyn ProxyStore>,
        cookies: Arc<CookieCache>,
    ) -> Self {
        let store = context.store.clone();
        let metrics = context.metrics.clone();
        let pool = WorkerPool::start(config.scheduler.concurrent_tasks, context);

        Self {
            store,
            pool,
            proxies,
            proxy_store,
            cookies,
            metrics,
            batch_size: config.scheduler.batch_size.max(1),
            stale_after: Duration::from_secs(config.scheduler.stale_after_secs),
            tick_interval: config.scheduler.tick_interval(),
            proxy_interval: config.proxy.check_interval(),
            cookie_interval: config.cookies.maintenance_interval(),
            reconcile_interval: config.scheduler.reconcile_interval(),
        }
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Start and submit the jobs due at `now`, as many as there are free
    /// workers. Returns how many were dispatched.
    pub async fn dispatch_due(&self, now: DateTime<Utc>) -> Result<usize> {
        let capacity = self.pool.available().min(self.batch_size);
        if capacity == 0 {
            debug!("All workers busy, skipping dispatch");
            return Ok(0);
        }

        let jobs = self
            .store
            .list_eligible(now, 0, capacity)
            .await
            .context("Failed to list eligible jobs")?;

        let mut dispatched = 0;
        for mut job in jobs {
            match self.store.try_start(job.id).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!("Job {} was taken or changed before dispatch", job.id);
                    continue;
                }
                Err(e) => {
                    warn!("Failed to start job {}: {:#}", job.id, e);
                    continue;
                }
            }

            job.status = JobStatus::Running;
            let id = job.id;
            self.pool.submit(job).await?;
            self.metrics.record_dispatch().await;
            dispatched += 1;
            debug!("Dispatched job {}", id);
        }

        if dispatched > 0 {
            info!("Dispatched {} jobs", dispatched);
        }
        Ok(dispatched)
    }

    /// Spawn the maintenance loops, each stopping on `shutdown`
    fn spawn_maintenance(&self, shutdown: &watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut tasks = Vec::new();

        if let Some(proxies) = self.proxies.clone() {
            let proxy_store = self.proxy_store.clone();
            let metrics = self.metrics.clone();
            tasks.push(spawn_periodic("proxy sweep", self.proxy_interval, shutdown.clone(), move || {
                let (proxies, proxy_store, metrics) = (proxies.clone(), proxy_store.clone(), metrics.clone());
                async move { sweep_proxies(&proxies, proxy_store.as_ref(), &metrics).await }
            }));
        }

        let cookies = self.cookies.clone();
        tasks.push(spawn_periodic("cookie maintenance", self.cookie_interval, shutdown.clone(), move || {
            let cookies = cookies.clone();
            async move { maintain_cookies(&cookies).await }
        }));

        let store = self.store.clone();
        let stale_after = self.stale_after;
        tasks.push(spawn_periodic("reconciliation", self.reconcile_interval, shutdown.clone(), move || {
            let store = store.clone();
            async move {
                if let Err(e) = reconcile(store.as_ref(), stale_after, Utc::now()).await {
                    error!("Reconciliation failed: {:#}", e);
                }
            }
        }));

        tasks
    }

    /// Run every tick until `shutdown` flips to true, then drain the workers
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut dispatch_tick = interval(self.tick_interval);
        dispatch_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let maintenance = self.spawn_maintenance(&shutdown);

        info!(
            "Scheduler running: dispatch every {}s, proxy sweep every {}s, cookie maintenance every {}s",
            self.tick_interval.as_secs(),
            self.proxy_interval.as_secs(),
            self.cookie_interval.as_secs()
        );

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = dispatch_tick.tick() => {
                    if let Err(e) = self.dispatch_due(Utc::now()).await {
                        error!("Dispatch tick failed: {:#}", e);
                    }
                }
            }
        }

        info!("Shutting down, waiting for in-flight jobs");
        for task in maintenance {
            if let Err(e) = task.await {
                error!("Maintenance task failed: {}", e);
            }
        }
        let metrics = self.metrics.clone();
        self.pool.shutdown().await;
        info!("Final dispatch metrics: {}", metrics.snapshot().await);

        Ok(())
    }
}

/// Pick up proxy changes from the store, health-check, write metrics back
async fn sweep_proxies(proxies: &ProxyPool, proxy_store: &dyn ProxyStore, metrics: &DispatchMetrics) {
    if let Err(e) = proxies.sync_from(proxy_store).await {
        error!("{:#}", e);
    }

    let report = proxies.sweep().await;
    if report.checked > 0 {
        info!(
            "Proxy sweep: {} checked, {} healthy, {} restored, {} evicted",
            report.checked, report.healthy, report.restored, report.evicted
        );
    }

    if let Err(e) = proxies.persist(proxy_store).await {
        error!("{:#}", e);
    }

    let stats = proxies.stats().await;
    info!("Proxies: {}/{} active", stats.active, stats.total);
    info!("Dispatch: {}", metrics.snapshot().await);
}

async fn maintain_cookies(cookies: &CookieCache) {
    let sweep = cookies.sweep().await;
    if sweep.failed > 0 {
        warn!("{} session refreshes failed during cookie maintenance", sweep.failed);
    }
}

/// Hand RUNNING jobs that stopped making progress back to PENDING
async fn reconcile(store: &dyn TaskStore, stale_after: Duration, now: DateTime<Utc>) -> Result<u64> {
    let stale_after = chrono::Duration::from_std(stale_after)
        .context("Staleness threshold out of range")?;

    let reset = store
        .reset_stale(now - stale_after)
        .await
        .context("Failed to reset stale jobs")?;

    if reset > 0 {
        warn!("Reset {} stale running jobs to pending", reset);
    }
    Ok(reset)
}

/// Run `task` every `period` until `shutdown` flips; a run in progress is
/// abandoned on shutdown and runs never overlap
fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut task: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut tick = interval(period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = tick.tick() => {
                    tokio::select! {
                        _ = task() => {}
                        _ = shutdown.changed() => {
                            debug!("Abandoning {} for shutdown", name);
                            break;
                        }
                    }
                }
            }
        }

        debug!("Stopped {}", name);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::job::{Job, JobConfig, JobSubmission, Priority};
    use crate::dispatch::retry::RetryPolicy;
    use crate::dispatch::store::MemoryTaskStore;
    use crate::fetch::FetchExecutor;
    use crate::proxy::manager::tests::ScriptedProbe;
    use crate::proxy::{HealthProbe, MemoryProxyStore, Proxy, ProxyProtocol};
    use crate::session::MemoryBackend;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct Harness {
        scheduler: Scheduler,
        store: Arc<MemoryTaskStore>,
        proxy_store: Arc<MemoryProxyStore>,
    }

    fn harness(concurrent_tasks: usize, proxies: Option<Arc<ProxyPool>>, proxy_store: MemoryProxyStore) -> Harness {
        let mut config = DispatcherConfig::default();
        config.scheduler.concurrent_tasks = concurrent_tasks;
        harness_with(config, proxies, proxy_store)
    }

    fn harness_with(config: DispatcherConfig, proxies: Option<Arc<ProxyPool>>, proxy_store: MemoryProxyStore) -> Harness {
        let store = Arc::new(MemoryTaskStore::new());
        let proxy_store = Arc::new(proxy_store);
        let cookies = Arc::new(CookieCache::new(Arc::new(MemoryBackend::new()), &config.cookies).unwrap());
        let executor = Arc::new(FetchExecutor::new(&config.fetch, None, cookies.clone()).unwrap());

        let context = Arc::new(WorkerContext {
            store: store.clone(),
            executor,
            policy: RetryPolicy::from_settings(&config.retry),
            metrics: DispatchMetrics::new(),
            write_attempts: 3,
            write_delay: Duration::from_millis(1),
        });

        Harness {
            scheduler: Scheduler::new(&config, context, proxies, proxy_store.clone(), cookies),
            store,
            proxy_store,
        }
    }

    fn submission(name: &str, url: &str, priority: Priority) -> JobSubmission {
        JobSubmission {
            name: name.to_string(),
            url: url.to_string(),
            schedule: None,
            priority,
            config: JobConfig::default(),
            headers: None,
            cookies: None,
        }
    }

    #[tokio::test]
    async fn test_dispatch_runs_due_jobs_in_priority_order() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;

        let h = harness(1, None, MemoryProxyStore::default());
        let mut results = h.scheduler.pool().subscribe();
        let now = Utc::now();

        let low = h.store.insert(&submission("low", &server.uri(), Priority::Low)).await.unwrap();
        let high = h.store.insert(&submission("high", &server.uri(), Priority::High)).await.unwrap();
        let mut later: Job = h.store.insert(&submission("later", &server.uri(), Priority::High)).await.unwrap();
        later.next_run = Some(now + chrono::Duration::hours(1));
        h.store.put(later.clone()).await;

        // One worker: one job per pass, best first
        assert_eq!(h.scheduler.dispatch_due(now).await.unwrap(), 1);
        assert_eq!(results.recv().await.unwrap().task_id, high.id);

        // The slot is released right after the result is published
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.scheduler.dispatch_due(now).await.unwrap(), 1);
        assert_eq!(results.recv().await.unwrap().task_id, low.id);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.scheduler.dispatch_due(now).await.unwrap(), 0);

        let stored = h.store.get(later.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Pending);
        assert_eq!(h.scheduler.metrics.snapshot().await.dispatched, 2);
    }

    #[tokio::test]
    async fn test_running_jobs_are_not_dispatched_again() {
        let h = harness(2, None, MemoryProxyStore::default());
        let job = h.store.insert(&submission("busy", "http://127.0.0.1:1/", Priority::High)).await.unwrap();
        assert!(h.store.try_start(job.id).await.unwrap());

        assert_eq!(h.scheduler.dispatch_due(Utc::now()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_reconcile_resets_stale_running_jobs() {
        let h = harness(1, None, MemoryProxyStore::default());
        let job = h.store.insert(&submission("stuck", "http://127.0.0.1:1/", Priority::Medium)).await.unwrap();
        h.store.try_start(job.id).await.unwrap();

        assert_eq!(reconcile(h.store.as_ref(), h.scheduler.stale_after, Utc::now()).await.unwrap(), 0);

        let later = Utc::now() + chrono::Duration::hours(2);
        assert_eq!(reconcile(h.store.as_ref(), h.scheduler.stale_after, later).await.unwrap(), 1);
        assert_eq!(h.store.get(job.id).await.unwrap().unwrap().status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn test_proxy_sweep_writes_back_to_store() {
        let config = DispatcherConfig::default();
        let probe = ScriptedProbe::healthy(&[1]);
        let pool = Arc::new(ProxyPool::new(&config.proxy, probe));
        let proxy_store = MemoryProxyStore::new(vec![
            Proxy::new(1, "10.0.0.1", 8080, ProxyProtocol::Http),
            Proxy::new(2, "10.0.0.2", 8080, ProxyProtocol::Socks5),
        ]);

        let h = harness(1, Some(pool.clone()), proxy_store);
        sweep_proxies(&pool, h.proxy_store.as_ref(), &h.scheduler.metrics).await;

        let stats = pool.stats().await;
        assert_eq!((stats.total, stats.active), (2, 1));

        let stored = h.proxy_store.list().await.unwrap();
        assert!(stored[0].is_active);
        assert!(!stored[1].is_active);
        assert!(stored.iter().all(|p| p.last_checked.is_some()));
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let h = harness(1, None, MemoryProxyStore::default());
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(h.scheduler.run(rx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();

        let finished = tokio::time::timeout(Duration::from_secs(5), handle).await;
        assert!(finished.unwrap().unwrap().is_ok());
    }

    /// Health probe that takes its time answering
    struct SlowProbe(Duration);

    #[async_trait::async_trait]
    impl HealthProbe for SlowProbe {
        async fn check(&self, _proxy: &Proxy) -> bool {
            tokio::time::sleep(self.0).await;
            true
        }
    }

    #[tokio::test]
    async fn test_slow_proxy_sweep_does_not_hold_up_dispatch() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;

        let mut config = DispatcherConfig::default();
        config.scheduler.tick_interval_secs = 1;
        let pool = Arc::new(ProxyPool::new(&config.proxy, Arc::new(SlowProbe(Duration::from_secs(4)))));
        let proxy_store = MemoryProxyStore::new(vec![Proxy::new(1, "10.0.0.1", 8080, ProxyProtocol::Http)]);

        let h = harness_with(config, Some(pool), proxy_store);
        let mut results = h.scheduler.pool().subscribe();

        let mut job = h.store.insert(&submission("due-soon", &server.uri(), Priority::High)).await.unwrap();
        job.next_run = Some(Utc::now() + chrono::Duration::milliseconds(300));
        h.store.put(job.clone()).await;

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(h.scheduler.run(rx));

        let result = tokio::time::timeout(Duration::from_millis(2500), results.recv()).await;
        assert_eq!(result.expect("job waited for the proxy sweep").unwrap().task_id, job.id);

        // Shutdown abandons the sweep still in progress
        tx.send(true).unwrap();
        let finished = tokio::time::timeout(Duration::from_secs(2), handle).await;
        assert!(finished.unwrap().unwrap().is_ok());
    }
}
