//! Resilient text fetcher
//!
//! Remote parameter sources are flaky free-tier hosts: they time out, return
//! parameter text with non-200 status codes, or serve empty bodies. The
//! fetcher retries a bounded number of times and degrades to an empty string
//! instead of surfacing an error; callers always receive a value.

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, CACHE_CONTROL, PRAGMA};
use tracing::{debug, warn};

/// Options for a single fetch
#[derive(Debug, Clone)]
pub struct FetchOptions {
    /// Per-attempt request timeout
    pub timeout: Duration,
    /// Additional attempts after the first
    pub retries: u32,
    /// Fixed delay between attempts
    pub retry_delay: Duration,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            retries: 2,
            retry_delay: Duration::from_millis(1000),
        }
    }
}

impl FetchOptions {
    /// Short-timeout single-retry options used by the IP echo probes
    pub fn probe() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            retries: 1,
            retry_delay: Duration::from_millis(1000),
        }
    }
}

/// Shared HTTP fetcher with retry and browser-like headers
#[derive(Debug, Clone)]
pub struct Fetcher {
    client: reqwest::Client,
}

impl Fetcher {
    pub fn new() -> Result<Self, anyhow::Error> {
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static(
                "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
            ),
        );
        headers.insert(
            ACCEPT_LANGUAGE,
            HeaderValue::from_static("zh-CN,zh;q=0.9,en;q=0.8"),
        );
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        headers.insert(PRAGMA, HeaderValue::from_static("no-cache"));

        let client = reqwest::Client::builder()
            .user_agent(
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
            )
            .default_headers(headers)
            .build()?;

        Ok(Self { client })
    }

    /// Fetch `url` as text, retrying on failure.
    ///
    /// Any non-empty trimmed body counts as success regardless of HTTP status;
    /// the parameter sources serve their payload on non-200 responses too.
    /// Returns an empty string once all attempts are exhausted.
    pub async fn fetch(&self, url: &str, options: &FetchOptions) -> String {
        let mut last_error = String::new();

        for attempt in 0..=options.retries {
            let result = self
                .client
                .get(url)
                .timeout(options.timeout)
                .send()
                .await;

            match result {
                Ok(response) => match response.text().await {
                    Ok(body) => {
                        let body = body.trim().to_string();
                        if !body.is_empty() {
                            debug!("Fetched {} ({} bytes)", url, body.len());
                            return body;
                        }
                        last_error = "empty body".to_string();
                    }
                    Err(e) => last_error = e.to_string(),
                },
                Err(e) => last_error = e.to_string(),
            }

            if attempt < options.retries {
                debug!(
                    "Fetch failed for {} (attempt {}), retrying in {:?}: {}",
                    url,
                    attempt + 1,
                    options.retry_delay,
                    last_error
                );
                tokio::time::sleep(options.retry_delay).await;
            }
        }

        warn!("Giving up on {}: {}", url, last_error);
        String::new()
    }
}
