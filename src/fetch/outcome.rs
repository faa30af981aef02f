use std::collections::HashMap;
use std::time::Duration;

use crate::error::DispatchError;
use crate::proxy::ProxyId;

/// Everything one fetch produced. Transient: consumed once to drive the job's
/// status transition, never stored as-is.
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    pub success: bool,
    pub status: Option<u16>,
    /// Effective URL after redirects, or the requested one if no response arrived
    pub url: String,
    pub body: Option<String>,
    pub headers: HashMap<String, String>,
    pub error: Option<DispatchError>,
    /// Non-fatal problems: no proxy available, session refresh failed
    pub degradations: Vec<DispatchError>,
    /// Proxy the request went through, pooled or supplied by the caller
    pub proxy_id: Option<ProxyId>,
    pub latency: Duration,
}

impl FetchOutcome {
    pub fn success(url: String, status: u16, headers: HashMap<String, String>, body: String) -> Self {
        Self {
            success: true,
            status: Some(status),
            url,
            body: Some(body),
            headers,
            error: None,
            degradations: Vec::new(),
            proxy_id: None,
            latency: Duration::ZERO,
        }
    }

    pub fn failure(url: impl Into<String>, status: Option<u16>, error: DispatchError) -> Self {
        Self {
            success: false,
            status,
            url: url.into(),
            body: None,
            headers: HashMap::new(),
            error: Some(error),
            degradations: Vec::new(),
            proxy_id: None,
            latency: Duration::ZERO,
        }
    }

    pub fn is_degraded(&self) -> bool {
        !self.degradations.is_empty()
    }

    /// Human-readable failure reason
    pub fn error_message(&self) -> String {
        self.error
            .as_ref()
            .map(|e| e.to_string())
            .unwrap_or_else(|| "Unknown error".to_string())
    }
}
