use anyhow::{Result, Context};
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tracing::{debug, info, warn, error};

use crate::cli::config::DispatcherConfig;
use crate::dispatch::{
    create_task_store, ExecutionResult, Job, JobConfig, JobSubmission, Priority, RetryPolicy, Scheduler,
    TaskStore, WorkerContext,
};
use crate::fetch::{extract, FetchExecutor};
use crate::proxy::{HttpProbe, MemoryProxyStore, ProxyPool, ProxyStore};
use crate::session::{create_backend, CookieCache};
use crate::utils::metrics::DispatchMetrics;

fn load_config(profile: Option<&str>) -> Result<DispatcherConfig> {
    match profile {
        Some(profile) => DispatcherConfig::load_profile(profile)
            .context(format!("Failed to load profile: {}", profile)),
        None => DispatcherConfig::load_default(),
    }
}

/// Proxy store seeded from the configured list, plus the pool loaded from it
/// when proxies are enabled
async fn proxy_pool(config: &DispatcherConfig) -> Result<(Option<Arc<ProxyPool>>, Arc<dyn ProxyStore>)> {
    let store: Arc<dyn ProxyStore> = Arc::new(MemoryProxyStore::from_settings(&config.proxy));
    if !config.proxy.enabled {
        info!("Proxy pool disabled, fetching directly");
        return Ok((None, store));
    }

    let pool = ProxyPool::new(&config.proxy, Arc::new(HttpProbe::from_settings(&config.proxy)));
    let loaded = pool.sync_from(store.as_ref()).await?;
    info!("Loaded {} proxies", loaded);

    Ok((Some(Arc::new(pool)), store))
}

async fn cookie_cache(config: &DispatcherConfig) -> Result<Arc<CookieCache>> {
    let backend = create_backend(&config.storage).await?;
    Ok(Arc::new(CookieCache::new(backend, &config.cookies)?))
}

/// Insert every submission from a YAML list, skipping ones without a valid URL
async fn load_jobs(store: &dyn TaskStore, path: &Path) -> Result<usize> {
    let contents = fs::read_to_string(path)
        .context(format!("Failed to read jobs file: {}", path.display()))?;
    let submissions: Vec<JobSubmission> = serde_yaml::from_str(&contents)
        .context(format!("Failed to parse jobs file: {}", path.display()))?;

    let mut loaded = 0;
    for submission in submissions {
        if let Err(e) = url::Url::parse(&submission.url) {
            warn!("Skipping job '{}': invalid URL {}: {}", submission.name, submission.url, e);
            continue;
        }
        let job = store.insert(&submission).await?;
        info!("Queued job {} ({})", job.id, job.name);
        loaded += 1;
    }

    Ok(loaded)
}

/// Run the scheduler until Ctrl-C
pub async fn run(profile: Option<String>, jobs: Option<PathBuf>) -> Result<()> {
    let config = load_config(profile.as_deref())?;

    let store = create_task_store(&config.storage).await?;
    if let Some(path) = jobs {
        let loaded = load_jobs(store.as_ref(), &path).await?;
        info!("Loaded {} jobs from {}", loaded, path.display());
    }

    let (proxies, proxy_store) = proxy_pool(&config).await?;
    let cookies = cookie_cache(&config).await?;
    let executor = Arc::new(FetchExecutor::new(&config.fetch, proxies.clone(), cookies.clone())?);

    let context = Arc::new(WorkerContext {
        store,
        executor,
        policy: RetryPolicy::from_settings(&config.retry),
        metrics: DispatchMetrics::new(),
        write_attempts: config.scheduler.store_write_attempts,
        write_delay: Duration::from_millis(config.scheduler.store_write_delay_ms),
    });
    let scheduler = Scheduler::new(&config, context, proxies, proxy_store, cookies);

    let mut results = scheduler.pool().subscribe();
    tokio::spawn(async move {
        loop {
            match results.recv().await {
                Ok(result) => debug!("Execution result: {}", serde_json::to_string(&result).unwrap_or_default()),
                Err(RecvError::Lagged(skipped)) => warn!("Result log fell behind, skipped {}", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl-C"),
            Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
        }
        let _ = shutdown_tx.send(true);
    });

    scheduler.run(shutdown_rx).await
}

/// Fetch one URL the way a worker would and print the execution result
pub async fn fetch(
    url: String,
    selectors: Vec<(String, String)>,
    headers: Vec<(String, String)>,
    profile: Option<String>,
) -> Result<()> {
    url::Url::parse(&url).context(format!("Invalid URL: {}", url))?;
    let config = load_config(profile.as_deref())?;

    let (proxies, _) = proxy_pool(&config).await?;
    if let Some(pool) = &proxies {
        pool.sweep().await;
    }
    let cookies = cookie_cache(&config).await?;
    let executor = FetchExecutor::new(&config.fetch, proxies, cookies)?;

    let submission = JobSubmission {
        name: "fetch".to_string(),
        url,
        schedule: None,
        priority: Priority::default(),
        config: JobConfig {
            selectors: selectors.into_iter().collect::<BTreeMap<_, _>>(),
            ..JobConfig::default()
        },
        headers: Some(headers.into_iter().collect::<HashMap<_, _>>()),
        cookies: None,
    };
    let job = Job::from_submission(0, submission, Utc::now());

    let outcome = executor.fetch_job(&job).await;
    for degradation in &outcome.degradations {
        warn!("{}", degradation);
    }
    info!(
        "{} -> {} in {}ms",
        outcome.url,
        outcome.status.map_or("no response".to_string(), |s| s.to_string()),
        outcome.latency.as_millis()
    );

    let result = ExecutionResult {
        success: outcome.success,
        task_id: job.id,
        data: outcome
            .body
            .as_deref()
            .filter(|_| outcome.success)
            .map(|body| extract(body, &job.config.selectors)),
        error: (!outcome.success).then(|| outcome.error_message()),
    };

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

/// Health-check every configured proxy and print the pool
pub async fn proxies(profile: Option<String>) -> Result<()> {
    let mut config = load_config(profile.as_deref())?;
    config.proxy.enabled = true;

    let (pool, _) = proxy_pool(&config).await?;
    let pool = pool.context("Proxy pool unavailable")?;

    let report = pool.sweep().await;
    info!("Checked {} proxies, {} healthy", report.checked, report.healthy);

    for proxy in pool.snapshot().await {
        println!(
            "{:>4}  {:<8} {:<28} {}",
            proxy.id,
            proxy.protocol.scheme(),
            proxy.address(),
            if proxy.is_active { "active" } else { "inactive" }
        );
    }

    println!("{}", serde_json::to_string_pretty(&pool.stats().await)?);
    Ok(())
}

pub async fn list_cookies(profile: Option<String>) -> Result<()> {
    let config = load_config(profile.as_deref())?;
    let cookies = cookie_cache(&config).await?;

    let mut domains = cookies.list_domains().await?;
    domains.sort();

    println!("Cached session cookies:");
    for domain in domains {
        let Some(record) = cookies.record(&domain).await else {
            continue;
        };
        let expiry = record
            .expires_at
            .map_or("no expiry".to_string(), |at| at.to_rfc3339());
        let state = if record.is_past_expiry(Utc::now()) { " (expired)" } else { "" };
        println!("  - {}: {} cookies, {}{}", domain, record.cookies.len(), expiry, state);
    }

    Ok(())
}

pub async fn delete_cookies(domain: String, profile: Option<String>) -> Result<()> {
    let config = load_config(profile.as_deref())?;
    let cookies = cookie_cache(&config).await?;

    cookies.delete(&domain).await?;
    println!("Deleted cookies for {}", domain);
    Ok(())
}

pub async fn refresh_cookies(domain: String, profile: Option<String>) -> Result<()> {
    let config = load_config(profile.as_deref())?;
    let cookies = cookie_cache(&config).await?;

    match cookies.refresh_configured(&domain).await {
        Some(true) => {
            println!("Refreshed cookies for {}", domain);
            Ok(())
        }
        Some(false) => anyhow::bail!("Cookie refresh failed for {}", domain),
        None => anyhow::bail!("No refresh strategy configured for {}", domain),
    }
}

/// List all available configuration profiles
pub fn list_profiles() -> Result<()> {
    let profiles = DispatcherConfig::list_profiles()?;

    println!("Available configuration profiles:");
    for profile in profiles {
        println!("  - {}", profile);
    }

    Ok(())
}

/// Show a profile, creating it from defaults if it doesn't exist
pub fn manage_profile(profile_name: String) -> Result<()> {
    match DispatcherConfig::load_profile(&profile_name) {
        Ok(config) => {
            println!("Profile: {}", profile_name);
            println!("{}", serde_yaml::to_string(&config)?);
        }
        Err(_) => {
            warn!("Profile '{}' does not exist. Creating a default profile.", profile_name);
            let config = DispatcherConfig::default();
            config.save_as_profile(&profile_name)?;
            println!("Created default profile: {}", profile_name);
        }
    }

    Ok(())
}

/// Show the current configuration
pub fn show_config() -> Result<()> {
    let config = DispatcherConfig::load_default()?;
    println!("Current configuration:");
    println!("{}", serde_yaml::to_string(&config)?);

    Ok(())
}
