use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::Mutex;
use tracing::warn;

use crate::cli::config::ProxySettings;
use crate::proxy::model::{Proxy, ProxyId};

/// Durable home of proxy records; creation and deletion happen outside the pool
#[async_trait]
pub trait ProxyStore: Send + Sync {
    /// All known proxies, active or not
    async fn list(&self) -> Result<Vec<Proxy>>;

    /// Write back status and metric fields
    async fn save(&self, proxy: &Proxy) -> Result<()>;
}

/// Proxy store kept in memory, seeded from the configured proxy list
#[derive(Default)]
pub struct MemoryProxyStore {
    proxies: Mutex<BTreeMap<ProxyId, Proxy>>,
}

impl MemoryProxyStore {
    pub fn new(proxies: Vec<Proxy>) -> Self {
        Self {
            proxies: Mutex::new(proxies.into_iter().map(|p| (p.id, p)).collect()),
        }
    }

    /// Entries with an unsupported protocol are skipped with a warning
    pub fn from_settings(settings: &ProxySettings) -> Self {
        let proxies = settings
            .proxy_list
            .iter()
            .enumerate()
            .filter_map(|(index, config)| match Proxy::from_config(index as ProxyId + 1, config) {
                Ok(proxy) => Some(proxy),
                Err(e) => {
                    warn!("Skipping proxy {}:{}: {}", config.host, config.port, e);
                    None
                }
            })
            .collect();

        Self::new(proxies)
    }

    pub async fn remove(&self, id: ProxyId) -> Option<Proxy> {
        self.proxies.lock().await.remove(&id)
    }
}

#[async_trait]
impl ProxyStore for MemoryProxyStore {
    async fn list(&self) -> Result<Vec<Proxy>> {
        Ok(self.proxies.lock().await.values().cloned().collect())
    }

    async fn save(&self, proxy: &Proxy) -> Result<()> {
        self.proxies.lock().await.insert(proxy.id, proxy.clone());
        Ok(())
    }
}
