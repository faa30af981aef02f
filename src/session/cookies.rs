use anyhow::{Result, Context};
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::{Serialize, Deserialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::cli::config::{CookieSettings, RefreshStrategy};
use crate::session::backend::CookieBackend;

const KEY_PREFIX: &str = "cookies:";

/// Session cookies for one domain
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CookieRecord {
    pub domain: String,
    pub cookies: HashMap<String, String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl CookieRecord {
    /// Past a recorded expiry; such a record is treated as absent
    pub fn is_past_expiry(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(false, |expiry| now > expiry)
    }
}

/// What a maintenance pass did
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CookieSweep {
    pub removed: usize,
    pub refreshed: usize,
    pub failed: usize,
}

/// Per-domain session cookie cache with expiry and login-based refresh
pub struct CookieCache {
    backend: Arc<dyn CookieBackend>,
    client: Client,
    refresh_ttl: Duration,
    settings: CookieSettings,
}

fn key(domain: &str) -> String {
    format!("{}{}", KEY_PREFIX, domain.to_lowercase())
}

impl CookieCache {
    pub fn new(backend: Arc<dyn CookieBackend>, settings: &CookieSettings) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.login_timeout_secs))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            backend,
            client,
            refresh_ttl: Duration::from_secs(settings.refresh_ttl_hours * 3600),
            settings: settings.clone(),
        })
    }

    /// Stored record as-is, expired or not
    pub async fn record(&self, domain: &str) -> Option<CookieRecord> {
        let raw = match self.backend.get(&key(domain)).await {
            Ok(raw) => raw?,
            Err(e) => {
                error!("Error getting cookies for {}: {:#}", domain, e);
                return None;
            }
        };

        match serde_json::from_str(&raw) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!("Discarding unreadable cookie record for {}: {}", domain, e);
                None
            }
        }
    }

    /// Cookies for `domain`, unless absent or past expiry
    pub async fn get(&self, domain: &str) -> Option<HashMap<String, String>> {
        let record = self.record(domain).await?;
        if record.is_past_expiry(Utc::now()) {
            debug!("Cookies for {} have expired", domain);
            return None;
        }
        Some(record.cookies)
    }

    /// Overwrite the cookies for `domain`; `ttl` sets a fresh expiry, `None` records none
    pub async fn save(&self, domain: &str, cookies: HashMap<String, String>, ttl: Option<Duration>) -> Result<()> {
        let expires_at = match ttl {
            Some(ttl) => Some(Utc::now() + chrono::Duration::from_std(ttl).context("Cookie TTL out of range")?),
            None => None,
        };

        let record = CookieRecord {
            domain: domain.to_lowercase(),
            cookies,
            expires_at,
        };
        let value = serde_json::to_string(&record).context("Failed to serialize cookies")?;

        self.backend
            .set(&key(domain), &value, ttl)
            .await
            .context(format!("Failed to save cookies for {}", domain))
    }

    /// True when no expiry is recorded or it has passed
    pub async fn is_expired(&self, domain: &str) -> bool {
        match self.record(domain).await {
            Some(record) => record.expires_at.map_or(true, |expiry| Utc::now() > expiry),
            None => true,
        }
    }

    /// Log in and store the returned cookies for a day.
    /// Any failure leaves the stored cookies untouched.
    pub async fn refresh(&self, domain: &str, login_url: &str, credentials: &HashMap<String, String>) -> bool {
        let response = match self.client.post(login_url).json(credentials).send().await {
            Ok(response) => response,
            Err(e) => {
                warn!("Error refreshing cookies for {}: {}", domain, e);
                return false;
            }
        };

        if response.status() != StatusCode::OK {
            warn!("Cookie refresh for {} rejected with HTTP {}", domain, response.status().as_u16());
            return false;
        }

        let cookies: HashMap<String, String> = response
            .cookies()
            .map(|cookie| (cookie.name().to_string(), cookie.value().to_string()))
            .collect();

        match self.save(domain, cookies, Some(self.refresh_ttl)).await {
            Ok(()) => {
                info!("Refreshed session cookies for {}", domain);
                true
            }
            Err(e) => {
                error!("{:#}", e);
                false
            }
        }
    }

    pub async fn delete(&self, domain: &str) -> Result<()> {
        self.backend
            .delete(&key(domain))
            .await
            .context(format!("Failed to delete cookies for {}", domain))
    }

    pub async fn list_domains(&self) -> Result<Vec<String>> {
        let keys = self.backend.list_keys(KEY_PREFIX).await?;
        Ok(keys
            .into_iter()
            .filter_map(|k| k.strip_prefix(KEY_PREFIX).map(str::to_string))
            .collect())
    }

    pub fn strategy_for(&self, domain: &str) -> Option<&RefreshStrategy> {
        self.settings.strategy_for(domain)
    }

    /// Refresh `domain` with its configured strategy, if it has one
    pub async fn refresh_configured(&self, domain: &str) -> Option<bool> {
        let strategy = self.strategy_for(domain)?;
        Some(self.refresh(domain, &strategy.login_url, &strategy.credentials).await)
    }

    /// Drop records past expiry, then re-login every configured domain whose
    /// cookies are missing or expired
    pub async fn sweep(&self) -> CookieSweep {
        let mut report = CookieSweep::default();
        let now = Utc::now();

        match self.list_domains().await {
            Ok(domains) => {
                for domain in domains {
                    let stale = self.record(&domain).await.map_or(false, |r| r.is_past_expiry(now));
                    if stale {
                        match self.delete(&domain).await {
                            Ok(()) => report.removed += 1,
                            Err(e) => error!("{:#}", e),
                        }
                    }
                }
            }
            Err(e) => error!("Error getting cookie domains: {:#}", e),
        }

        for strategy in &self.settings.strategies {
            if !self.is_expired(&strategy.domain).await {
                continue;
            }
            if self.refresh(&strategy.domain, &strategy.login_url, &strategy.credentials).await {
                report.refreshed += 1;
            } else {
                report.failed += 1;
            }
        }

        debug!(
            "Cookie maintenance: {} removed, {} refreshed, {} failed",
            report.removed, report.refreshed, report.failed
        );
        report
    }
}
