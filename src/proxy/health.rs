use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::debug;

use crate::cli::config::ProxySettings;
use crate::proxy::model::Proxy;

/// Decides whether a proxy can carry traffic right now
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn check(&self, proxy: &Proxy) -> bool;
}

/// Requests a known-good endpoint through the proxy; healthy only on HTTP 200
pub struct HttpProbe {
    check_url: String,
    timeout: Duration,
}

impl HttpProbe {
    pub fn new(check_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            check_url: check_url.into(),
            timeout,
        }
    }

    pub fn from_settings(settings: &ProxySettings) -> Self {
        Self::new(settings.check_url.clone(), Duration::from_secs(settings.check_timeout_secs))
    }
}

#[async_trait]
impl HealthProbe for HttpProbe {
    async fn check(&self, proxy: &Proxy) -> bool {
        let upstream = match reqwest::Proxy::all(proxy.url()) {
            Ok(upstream) => upstream,
            Err(e) => {
                debug!("Invalid proxy URL {}: {}", proxy.address(), e);
                return false;
            }
        };

        let client = match Client::builder().timeout(self.timeout).proxy(upstream).build() {
            Ok(client) => client,
            Err(e) => {
                debug!("Failed to create proxy client for {}: {}", proxy.address(), e);
                return false;
            }
        };

        match client.get(&self.check_url).send().await {
            Ok(response) => response.status() == StatusCode::OK,
            Err(e) => {
                debug!("Proxy check failed for {}: {}", proxy.address(), e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::model::ProxyProtocol;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const CHECK_URL: &str = "http://check.example.com/ip";

    /// Mock server standing in as an HTTP proxy answering with `response`
    async fn proxy_answering(response: ResponseTemplate) -> (MockServer, Proxy) {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(response)
            .mount(&server)
            .await;
        let proxy = Proxy::new(1, "127.0.0.1", server.address().port(), ProxyProtocol::Http);
        (server, proxy)
    }

    #[tokio::test]
    async fn test_healthy_on_200() {
        let (server, proxy) = proxy_answering(ResponseTemplate::new(200).set_body_string("1.2.3.4")).await;
        let probe = HttpProbe::new(CHECK_URL, Duration::from_secs(5));

        assert!(probe.check(&proxy).await);
        assert_eq!(server.received_requests().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unhealthy_on_other_status() {
        let (_server, proxy) = proxy_answering(ResponseTemplate::new(503)).await;
        let probe = HttpProbe::new(CHECK_URL, Duration::from_secs(5));

        assert!(!probe.check(&proxy).await);
    }

    #[tokio::test]
    async fn test_unhealthy_past_timeout() {
        let (_server, proxy) = proxy_answering(ResponseTemplate::new(200).set_delay(Duration::from_secs(2))).await;
        let probe = HttpProbe::new(CHECK_URL, Duration::from_millis(200));

        assert!(!probe.check(&proxy).await);
    }

    #[tokio::test]
    async fn test_unhealthy_when_unreachable() {
        let probe = HttpProbe::new(CHECK_URL, Duration::from_secs(5));
        let proxy = Proxy::new(1, "127.0.0.1", 1, ProxyProtocol::Http);

        assert!(!probe.check(&proxy).await);
    }
}
