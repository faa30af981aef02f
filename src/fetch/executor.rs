use anyhow::{Result, Context};
use reqwest::header::{HeaderMap, COOKIE};
use reqwest::{Client, StatusCode};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::cli::config::FetchSettings;
use crate::dispatch::job::Job;
use crate::error::DispatchError;
use crate::fetch::headers::HeaderGenerator;
use crate::fetch::outcome::FetchOutcome;
use crate::proxy::{Proxy, ProxyOutcome, ProxyPool};
use crate::session::CookieCache;

/// Issues single HTTP requests through the proxy pool with session cookies
pub struct FetchExecutor {
    headers: HeaderGenerator,
    proxies: Option<Arc<ProxyPool>>,
    cookies: Arc<CookieCache>,
    direct: Client,
    default_timeout: Duration,
    /// One login at a time per domain
    refreshing: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl FetchExecutor {
    /// `proxies: None` sends everything directly without flagging degradation
    pub fn new(settings: &FetchSettings, proxies: Option<Arc<ProxyPool>>, cookies: Arc<CookieCache>) -> Result<Self> {
        let direct = Client::builder()
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            headers: HeaderGenerator::new(settings.fingerprints.clone()),
            proxies,
            cookies,
            direct,
            default_timeout: Duration::from_secs(settings.timeout_secs),
            refreshing: Mutex::new(HashMap::new()),
        })
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Fetch `url` once.
    ///
    /// A caller-supplied proxy wins and is left out of pool accounting;
    /// otherwise one is taken from the pool and the outcome reported back to it.
    /// Network errors come back inside the outcome.
    pub async fn fetch(
        &self,
        url: &str,
        headers: Option<&HashMap<String, String>>,
        cookies: Option<&HashMap<String, String>>,
        proxy: Option<&Proxy>,
        timeout: Duration,
    ) -> FetchOutcome {
        let mut degradations = Vec::new();

        let (proxy, pooled) = match (proxy, &self.proxies) {
            (Some(proxy), _) => (Some(proxy.clone()), false),
            (None, Some(pool)) => match pool.acquire().await {
                Some(proxy) => (Some(proxy), true),
                None => {
                    debug!("No active proxy, fetching {} directly", url);
                    degradations.push(DispatchError::ProxyExhausted);
                    (None, false)
                }
            },
            (None, None) => (None, false),
        };

        let started = Instant::now();
        let mut outcome = self.send(url, headers, cookies, proxy.as_ref(), timeout).await;
        outcome.latency = started.elapsed();
        outcome.proxy_id = proxy.as_ref().map(|p| p.id);
        outcome.degradations.extend(degradations);

        if let (true, Some(proxy), Some(pool)) = (pooled, &proxy, &self.proxies) {
            let result = if outcome.success { ProxyOutcome::Success } else { ProxyOutcome::Failure };
            pool.report(proxy.id, result, outcome.latency).await;
        }

        outcome
    }

    async fn send(
        &self,
        url: &str,
        headers: Option<&HashMap<String, String>>,
        cookies: Option<&HashMap<String, String>>,
        proxy: Option<&Proxy>,
        timeout: Duration,
    ) -> FetchOutcome {
        let client = match proxy {
            Some(proxy) => {
                let built = reqwest::Proxy::all(proxy.url())
                    .and_then(|upstream| Client::builder().proxy(upstream).build());
                match built {
                    Ok(client) => client,
                    // The proxy is at fault, not the job; counts against the proxy
                    Err(e) => {
                        warn!("Unusable proxy {}: {}", proxy.address(), e);
                        return FetchOutcome::failure(
                            url,
                            None,
                            DispatchError::Transport(format!("unusable proxy {}: {}", proxy.address(), e)),
                        );
                    }
                }
            }
            None => self.direct.clone(),
        };

        let mut request = client.get(url).timeout(timeout);
        for (name, value) in self.headers.headers(headers) {
            request = request.header(name, value);
        }
        if let Some(cookie) = cookies.and_then(cookie_header) {
            request = request.header(COOKIE, cookie);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                debug!("Error fetching {}: {}", url, e);
                return FetchOutcome::failure(url, None, e.into());
            }
        };

        let status = response.status();
        let effective_url = response.url().to_string();
        let response_headers = header_map(response.headers());

        if status != StatusCode::OK {
            let mut outcome = FetchOutcome::failure(
                effective_url,
                Some(status.as_u16()),
                DispatchError::HttpStatus(status.as_u16()),
            );
            outcome.headers = response_headers;
            return outcome;
        }

        match response.text().await {
            Ok(body) => FetchOutcome::success(effective_url, status.as_u16(), response_headers, body),
            Err(e) => {
                let mut outcome = FetchOutcome::failure(effective_url, Some(status.as_u16()), e.into());
                outcome.headers = response_headers;
                outcome
            }
        }
    }

    /// Fetch a job's target with its headers, its cookies layered over the
    /// domain's session cookies, and its timeout
    pub async fn fetch_job(&self, job: &Job) -> FetchOutcome {
        let timeout = job
            .config
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout);

        let mut cookies = HashMap::new();
        let mut degradation = None;

        if let Some(domain) = job.domain() {
            let (session, refresh_error) = self.session_cookies(&domain).await;
            cookies.extend(session.unwrap_or_default());
            degradation = refresh_error;
        }
        cookies.extend(job.cookies.iter().map(|(k, v)| (k.clone(), v.clone())));

        let mut outcome = self
            .fetch(&job.url, Some(&job.headers), Some(&cookies), None, timeout)
            .await;
        outcome.degradations.extend(degradation);
        outcome
    }

    /// Cached cookies for `domain`, refreshing through its login strategy when
    /// they are missing or expired. A failed refresh means no cookies.
    async fn session_cookies(&self, domain: &str) -> (Option<HashMap<String, String>>, Option<DispatchError>) {
        if let Some(cookies) = self.fresh_cookies(domain).await {
            return (Some(cookies), None);
        }

        let lock = self
            .refreshing
            .lock()
            .await
            .entry(domain.to_string())
            .or_default()
            .clone();
        let _guard = lock.lock().await;

        // Someone else may have logged in while we waited
        if let Some(cookies) = self.fresh_cookies(domain).await {
            return (Some(cookies), None);
        }
        let cached = self.cookies.get(domain).await;

        match self.cookies.refresh_configured(domain).await {
            Some(true) => (self.cookies.get(domain).await, None),
            Some(false) => {
                warn!("Session refresh failed for {}, fetching without cookies", domain);
                (None, Some(DispatchError::RefreshFailed { domain: domain.to_string() }))
            }
            None => (cached, None),
        }
    }

    async fn fresh_cookies(&self, domain: &str) -> Option<HashMap<String, String>> {
        let cached = self.cookies.get(domain).await?;
        if self.cookies.is_expired(domain).await {
            return None;
        }
        Some(cached)
    }
}

fn cookie_header(cookies: &HashMap<String, String>) -> Option<String> {
    if cookies.is_empty() {
        return None;
    }

    let ordered: BTreeMap<&String, &String> = cookies.iter().collect();
    Some(
        ordered
            .into_iter()
            .map(|(name, value)| format!("{}={}", name, value))
            .collect::<Vec<_>>()
            .join("; "),
    )
}

fn header_map(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.as_str().to_string(), v.to_string())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::config::{DispatcherConfig, RefreshStrategy};
    use crate::dispatch::job::{JobSubmission, JobConfig, Priority};
    use crate::dispatch::retry::{Decision, RetryPolicy};
    use crate::proxy::manager::tests::ScriptedProbe;
    use crate::proxy::{MemoryProxyStore, ProxyProtocol};
    use crate::session::MemoryBackend;
    use chrono::Utc;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn cookie_cache(strategies: Vec<RefreshStrategy>) -> Arc<CookieCache> {
        let mut settings = DispatcherConfig::default().cookies;
        settings.strategies = strategies;
        Arc::new(CookieCache::new(Arc::new(MemoryBackend::new()), &settings).unwrap())
    }

    fn executor(proxies: Option<Arc<ProxyPool>>, cookies: Arc<CookieCache>) -> FetchExecutor {
        FetchExecutor::new(&DispatcherConfig::default().fetch, proxies, cookies).unwrap()
    }

    /// Pool holding one proxy nobody listens on
    async fn dead_proxy_pool() -> Arc<ProxyPool> {
        let pool = ProxyPool::new(&DispatcherConfig::default().proxy, ScriptedProbe::healthy(&[]));
        let store = MemoryProxyStore::new(vec![Proxy::new(1, "127.0.0.1", 1, ProxyProtocol::Http)]);
        pool.sync_from(&store).await.unwrap();
        Arc::new(pool)
    }

    fn job(url: String) -> Job {
        let submission = JobSubmission {
            name: "test".to_string(),
            url,
            schedule: None,
            priority: Priority::Medium,
            config: JobConfig::default(),
            headers: None,
            cookies: None,
        };
        Job::from_submission(1, submission, Utc::now())
    }

    #[tokio::test]
    async fn test_success_carries_body_and_headers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/page"))
            .and(header("x-token", "abc"))
            .and(header("cookie", "a=1; b=2"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("x-served-by", "mock")
                    .set_body_string("<h1 class=\"title\">Hello</h1>"),
            )
            .mount(&server)
            .await;

        let executor = executor(None, cookie_cache(vec![]));
        let headers = HashMap::from([("X-Token".to_string(), "abc".to_string())]);
        let cookies = HashMap::from([
            ("b".to_string(), "2".to_string()),
            ("a".to_string(), "1".to_string()),
        ]);
        let url = format!("{}/page", server.uri());

        let outcome = executor
            .fetch(&url, Some(&headers), Some(&cookies), None, Duration::from_secs(5))
            .await;

        assert!(outcome.success, "{:?}", outcome.error);
        assert_eq!(outcome.status, Some(200));
        assert_eq!(outcome.url, url);
        assert_eq!(outcome.body.as_deref(), Some("<h1 class=\"title\">Hello</h1>"));
        assert_eq!(outcome.headers["x-served-by"], "mock");
        assert!(!outcome.is_degraded());
    }

    #[tokio::test]
    async fn test_non_200_is_failure_with_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let executor = executor(None, cookie_cache(vec![]));
        let outcome = executor
            .fetch(&format!("{}/missing", server.uri()), None, None, None, Duration::from_secs(5))
            .await;

        assert!(!outcome.success);
        assert_eq!(outcome.status, Some(404));
        assert_eq!(outcome.error, Some(DispatchError::HttpStatus(404)));
        assert_eq!(outcome.error_message(), "HTTP 404");
    }

    #[tokio::test]
    async fn test_slow_response_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&server)
            .await;

        let executor = executor(None, cookie_cache(vec![]));
        let outcome = executor
            .fetch(&server.uri(), None, None, None, Duration::from_millis(100))
            .await;

        assert!(!outcome.success);
        assert_eq!(outcome.error, Some(DispatchError::Timeout));
    }

    #[tokio::test]
    async fn test_connection_refused_is_transport_error() {
        let executor = executor(None, cookie_cache(vec![]));
        let outcome = executor
            .fetch("http://127.0.0.1:1/", None, None, None, Duration::from_secs(5))
            .await;

        assert!(!outcome.success);
        assert!(matches!(outcome.error, Some(DispatchError::Transport(_))));
        assert_eq!(outcome.status, None);
    }

    #[tokio::test]
    async fn test_empty_pool_degrades_to_direct() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;

        let pool = Arc::new(ProxyPool::new(&DispatcherConfig::default().proxy, ScriptedProbe::healthy(&[])));
        let executor = executor(Some(pool), cookie_cache(vec![]));

        let outcome = executor.fetch(&server.uri(), None, None, None, Duration::from_secs(5)).await;

        assert!(outcome.success);
        assert_eq!(outcome.degradations, vec![DispatchError::ProxyExhausted]);
        assert_eq!(outcome.proxy_id, None);
    }

    #[tokio::test]
    async fn test_pooled_proxy_failures_are_reported() {
        let pool = dead_proxy_pool().await;
        let executor = executor(Some(pool.clone()), cookie_cache(vec![]));

        for _ in 0..3 {
            let outcome = executor
                .fetch("http://example.com/", None, None, None, Duration::from_secs(5))
                .await;
            assert!(!outcome.success);
            assert_eq!(outcome.proxy_id, Some(1));
        }

        let proxy = pool.snapshot().await.remove(0);
        assert_eq!(proxy.failure_count, 3);
        assert!(!proxy.is_active);
        assert!(pool.acquire().await.is_none());
    }

    #[tokio::test]
    async fn test_supplied_proxy_skips_pool_accounting() {
        let pool = dead_proxy_pool().await;
        let executor = executor(Some(pool.clone()), cookie_cache(vec![]));
        let supplied = pool.snapshot().await.remove(0);

        let outcome = executor
            .fetch("http://example.com/", None, None, Some(&supplied), Duration::from_secs(5))
            .await;

        assert!(!outcome.success);
        assert_eq!(pool.snapshot().await[0].failure_count, 0);
    }

    #[tokio::test]
    async fn test_job_fetch_refreshes_session_and_job_cookies_win() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/login"))
            .respond_with(
                ResponseTemplate::new(200)
                    .append_header("Set-Cookie", "session=fresh; Path=/")
                    .append_header("Set-Cookie", "theme=dark; Path=/"),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/account"))
            .and(header("cookie", "session=fresh; theme=light"))
            .respond_with(ResponseTemplate::new(200).set_body_string("welcome"))
            .mount(&server)
            .await;

        let strategy = RefreshStrategy {
            domain: "127.0.0.1".to_string(),
            login_url: format!("{}/login", server.uri()),
            credentials: HashMap::new(),
        };
        let executor = executor(None, cookie_cache(vec![strategy]));

        let mut job = job(format!("{}/account", server.uri()));
        job.cookies.insert("theme".to_string(), "light".to_string());

        let outcome = executor.fetch_job(&job).await;

        assert!(outcome.success, "{:?}", outcome.error);
        assert!(!outcome.is_degraded());
    }

    #[tokio::test]
    async fn test_failed_refresh_degrades_but_fetches() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/login"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/public"))
            .respond_with(ResponseTemplate::new(200).set_body_string("anonymous"))
            .mount(&server)
            .await;

        let strategy = RefreshStrategy {
            domain: "127.0.0.1".to_string(),
            login_url: format!("{}/login", server.uri()),
            credentials: HashMap::new(),
        };
        let executor = executor(None, cookie_cache(vec![strategy]));

        let outcome = executor.fetch_job(&job(format!("{}/public", server.uri()))).await;

        assert!(outcome.success);
        assert_eq!(
            outcome.degradations,
            vec![DispatchError::RefreshFailed { domain: "127.0.0.1".to_string() }]
        );
    }

    #[tokio::test]
    async fn test_job_timeout_override() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
            .mount(&server)
            .await;

        let executor = executor(None, cookie_cache(vec![]));
        let mut job = job(server.uri());
        job.config.timeout_secs = Some(1);

        let outcome = executor.fetch_job(&job).await;
        assert_eq!(outcome.error, Some(DispatchError::Timeout));
    }

    #[tokio::test]
    async fn test_unusable_pooled_proxy_is_retryable_and_counted() {
        let pool = ProxyPool::new(&DispatcherConfig::default().proxy, ScriptedProbe::healthy(&[]));
        let store = MemoryProxyStore::new(vec![Proxy::new(1, "127.0.0.1", 1080, ProxyProtocol::Socks4)]);
        pool.sync_from(&store).await.unwrap();
        let pool = Arc::new(pool);
        let executor = executor(Some(pool.clone()), cookie_cache(vec![]));

        let job = job("http://example.com/".to_string());
        let outcome = executor.fetch_job(&job).await;

        assert!(!outcome.success);
        assert!(matches!(outcome.error, Some(DispatchError::Transport(_))), "{:?}", outcome.error);
        assert_eq!(pool.snapshot().await[0].failure_count, 1);

        let policy = RetryPolicy::from_settings(&DispatcherConfig::default().retry);
        let decision = policy.decide(&job, &outcome, Utc::now());
        assert!(matches!(decision, Decision::Reschedule { retry_count: 1, .. }), "{:?}", decision);
    }

    #[tokio::test]
    async fn test_concurrent_fetches_share_one_login() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/login"))
            .respond_with(
                ResponseTemplate::new(200)
                    .append_header("Set-Cookie", "session=shared; Path=/")
                    .set_delay(Duration::from_millis(200)),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/account"))
            .and(header("cookie", "session=shared"))
            .respond_with(ResponseTemplate::new(200).set_body_string("welcome"))
            .mount(&server)
            .await;

        let strategy = RefreshStrategy {
            domain: "127.0.0.1".to_string(),
            login_url: format!("{}/login", server.uri()),
            credentials: HashMap::new(),
        };
        let executor = executor(None, cookie_cache(vec![strategy]));
        let job = job(format!("{}/account", server.uri()));

        let outcomes = futures::future::join_all((0..5).map(|_| executor.fetch_job(&job))).await;

        assert!(outcomes.iter().all(|o| o.success && !o.is_degraded()));
        server.verify().await;
    }
}
