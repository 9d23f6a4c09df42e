//! HTTP/HTTPS target adapter
//!
//! Uses a pooled `reqwest` client created at connect time. GET requests
//! carry the payload as query parameters; every other method sends a JSON
//! body. A 5xx response drops the client so the next send starts from a
//! fresh session.

use crate::error::{Error, Result};
use crate::model::JsonMap;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

use super::{with_timestamp, TargetConnector};

const ALLOWED_METHODS: &[&str] = &["GET", "POST", "PUT", "PATCH", "DELETE"];

/// HTTP target configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpTargetConfig {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Total request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,
}

fn default_method() -> String {
    "POST".to_string()
}

fn default_timeout() -> u64 {
    30
}

impl HttpTargetConfig {
    /// Semantic validation beyond deserialization
    pub fn validate(&self) -> Result<()> {
        let parsed = url::Url::parse(&self.url)
            .map_err(|e| Error::invalid_config("url", format!("invalid URL: {}", e)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(Error::invalid_config(
                "url",
                "URL scheme must be http or https",
            ));
        }

        let method = self.method.to_ascii_uppercase();
        if !ALLOWED_METHODS.contains(&method.as_str()) {
            return Err(Error::invalid_config(
                "method",
                format!("unsupported HTTP method: {}", self.method),
            ));
        }

        if self.timeout == 0 || self.timeout > 300 {
            return Err(Error::invalid_config(
                "timeout",
                "timeout must be between 1 and 300 seconds",
            ));
        }

        for name in self.headers.keys() {
            HeaderName::try_from(name.as_str())
                .map_err(|_| Error::invalid_config("headers", format!("invalid header name: {}", name)))?;
        }

        Ok(())
    }
}

/// Connector for HTTP/HTTPS endpoints
pub struct HttpConnector {
    config: HttpTargetConfig,
    client: Option<reqwest::Client>,
}

impl std::fmt::Debug for HttpConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpConnector")
            .field("config", &self.config)
            .field("connected", &self.client.is_some())
            .finish()
    }
}

impl HttpConnector {
    pub fn new(config: HttpTargetConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            client: None,
        })
    }

    fn build_client(&self) -> Result<reqwest::Client> {
        let mut headers = HeaderMap::new();
        for (name, value) in &self.config.headers {
            let name = HeaderName::try_from(name.as_str())
                .map_err(|e| Error::connection_with_source("invalid header name", e))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| Error::connection_with_source("invalid header value", e))?;
            headers.insert(name, value);
        }

        reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(self.config.timeout))
            .build()
            .map_err(|e| Error::connection_with_source("failed to build HTTP client", e))
    }

    /// Stringify payload values for use as query parameters
    fn query_pairs(payload: &JsonMap) -> Vec<(String, String)> {
        payload
            .iter()
            .map(|(k, v)| {
                let value = match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (k.clone(), value)
            })
            .collect()
    }
}

#[async_trait]
impl TargetConnector for HttpConnector {
    fn kind(&self) -> &'static str {
        "http"
    }

    async fn connect(&mut self) -> Result<()> {
        if self.client.is_some() {
            return Ok(());
        }
        self.client = Some(self.build_client()?);
        debug!("HTTP session ready for {}", self.config.url);
        Ok(())
    }

    async fn send(&mut self, payload: &JsonMap) -> Result<()> {
        if self.client.is_none() {
            self.connect().await?;
        }
        let client = self.client.as_ref().expect("client present after connect");

        let stamped = with_timestamp(payload);
        let method = self.config.method.to_ascii_uppercase();

        let request = match method.as_str() {
            "GET" => client
                .get(&self.config.url)
                .query(&Self::query_pairs(&stamped)),
            "POST" => client.post(&self.config.url).json(&stamped),
            "PUT" => client.put(&self.config.url).json(&stamped),
            "PATCH" => client.patch(&self.config.url).json(&stamped),
            "DELETE" => client.delete(&self.config.url).json(&stamped),
            other => {
                return Err(Error::send(format!("unsupported HTTP method: {}", other)));
            }
        };

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                // Transport-level failure: force a fresh session next time
                self.client = None;
                return Err(e.into());
            }
        };

        let status = response.status();
        if status.as_u16() < 400 {
            return Ok(());
        }

        if status.is_server_error() {
            // 5xx: close the session so the next send reconnects
            self.client = None;
        }

        let body = response.text().await.unwrap_or_default();
        warn!(
            "HTTP {} to {} failed with status {}",
            method, self.config.url, status
        );
        Err(Error::send(format!(
            "HTTP {} failed with status {}: {}",
            method, status, body
        )))
    }

    async fn disconnect(&mut self) {
        self.client = None;
    }

    fn is_connected(&self) -> bool {
        self.client.is_some()
    }
}
