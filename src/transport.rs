use crate::config::Config;
use crate::error::TransportError;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{Client, Url};
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};

pub const JSON_CONTENT_TYPE: &str = "application/json";
/// JSON preferred, but any response (including an empty one) is acceptable.
pub const ACCEPT_JSON: &str = "application/json, */*;q=0.5";

/// A POST that came back with an HTTP response, whatever its status.
#[derive(Debug, Clone, PartialEq)]
pub struct SendResponse {
    pub result: Option<Value>,
    pub status_code: u16,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Hand the POST to a detached, no-response send. Returns whether it was
    /// scheduled, never whether the server received it.
    fn send_best_effort(&self, endpoint: &str, json_string: &str) -> bool;

    /// A normal request/response POST. An `Err` means no response was received
    /// and the submission should be retried later.
    async fn send_with_response(
        &self,
        endpoint: &str,
        json_string: &str,
    ) -> Result<SendResponse, TransportError>;
}

#[derive(Clone)]
pub struct HttpTransport {
    http: Client,
    base_url: Option<Url>,
}

impl fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpTransport")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl HttpTransport {
    pub fn new(user_agent: &str, timeout: Option<Duration>) -> Result<Self> {
        let mut builder = Client::builder().user_agent(user_agent);
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let http = builder.build().context("failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url: None,
        })
    }

    pub fn from_config(cfg: &Config) -> Result<Self> {
        let transport = Self::new(&cfg.transport.user_agent, cfg.request_timeout())?;
        Ok(match cfg.base_url() {
            Some(base) => transport.with_base_url(base),
            None => transport,
        })
    }

    /// Resolve relative endpoints such as `/api/comments` against `base_url`.
    pub fn with_base_url(mut self, base_url: Url) -> Self {
        self.base_url = Some(base_url);
        self
    }

    pub fn resolve(&self, endpoint: &str) -> Result<Url, TransportError> {
        let parsed = match &self.base_url {
            Some(base) => base.join(endpoint),
            None => Url::parse(endpoint),
        };
        parsed.map_err(|e| TransportError::InvalidEndpoint {
            endpoint: endpoint.to_string(),
            reason: e.to_string(),
        })
    }

    /// The body is sent verbatim; it is never re-serialized.
    pub fn build_request(
        &self,
        endpoint: &str,
        json_string: &str,
    ) -> Result<reqwest::Request, TransportError> {
        let url = self.resolve(endpoint)?;
        let request = self
            .http
            .post(url)
            .header(CONTENT_TYPE, JSON_CONTENT_TYPE)
            .header(ACCEPT, ACCEPT_JSON)
            .body(json_string.to_string())
            .build()?;
        Ok(request)
    }
}

/// Empty or unparseable bodies become `None`.
pub fn parse_response_body(body: &str) -> Option<Value> {
    if body.trim().is_empty() {
        return None;
    }
    match serde_json::from_str(body) {
        Ok(value) => Some(value),
        Err(err) => {
            debug!(?err, "response body is not JSON");
            None
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn send_best_effort(&self, endpoint: &str, json_string: &str) -> bool {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return false;
        };
        let request = match self.build_request(endpoint, json_string) {
            Ok(r) => r,
            Err(err) => {
                warn!(?err, endpoint, "cannot schedule best-effort send");
                return false;
            }
        };
        let http = self.http.clone();
        handle.spawn(async move {
            if let Err(err) = http.execute(request).await {
                debug!(?err, "best-effort send failed");
            }
        });
        true
    }

    async fn send_with_response(
        &self,
        endpoint: &str,
        json_string: &str,
    ) -> Result<SendResponse, TransportError> {
        let request = self.build_request(endpoint, json_string)?;
        debug!(url = %request.url(), "posting json");
        let res = self.http.execute(request).await?;
        let status_code = res.status().as_u16();
        // The server has answered; a body that cannot be read is just absent.
        let result = match res.text().await {
            Ok(body) => parse_response_body(&body),
            Err(err) => {
                debug!(?err, status_code, "cannot read response body");
                None
            }
        };
        Ok(SendResponse {
            result,
            status_code,
        })
    }
}
