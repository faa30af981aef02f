use std::collections::HashMap;
use rand::{thread_rng, Rng};
use tracing::debug;

use crate::cli::config::BrowserFingerprint;

const ACCEPT: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8";
const FALLBACK_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Builds browser-like request headers from a set of configured fingerprints
#[derive(Debug, Clone)]
pub struct HeaderGenerator {
    fingerprints: Vec<BrowserFingerprint>,
}

impl HeaderGenerator {
    pub fn new(fingerprints: Vec<BrowserFingerprint>) -> Self {
        Self { fingerprints }
    }

    /// Randomized base headers overlaid with `custom`; the caller wins on conflicts,
    /// compared case-insensitively.
    pub fn headers(&self, custom: Option<&HashMap<String, String>>) -> HashMap<String, String> {
        let mut headers = self.random_base();

        if let Some(custom) = custom {
            for (key, value) in custom {
                headers.retain(|existing, _| !existing.eq_ignore_ascii_case(key));
                headers.insert(key.clone(), value.clone());
            }
        }

        headers
    }

    fn random_base(&self) -> HashMap<String, String> {
        let mut headers = HashMap::new();

        let (user_agent, accept_language) = if self.fingerprints.is_empty() {
            (FALLBACK_USER_AGENT.to_string(), "en-US,en;q=0.5".to_string())
        } else {
            let mut rng = thread_rng();
            let fingerprint = &self.fingerprints[rng.gen_range(0..self.fingerprints.len())];
            debug!("Using header fingerprint: {}", fingerprint.name);

            for (key, value) in &fingerprint.extra_headers {
                headers.insert(key.clone(), value.clone());
            }
            (fingerprint.user_agent.clone(), fingerprint.accept_language.clone())
        };

        headers.insert("User-Agent".to_string(), user_agent);
        headers.insert("Accept-Language".to_string(), accept_language);
        headers.insert("Accept".to_string(), ACCEPT.to_string());
        headers.insert("Connection".to_string(), "keep-alive".to_string());
        headers.insert("Upgrade-Insecure-Requests".to_string(), "1".to_string());

        headers
    }
}
