use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::blocking::Client as HttpClient;
use serde_json::Value;

/// Status code and raw body of a completed HTTP exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpReply {
    pub status: u16,
    pub body: String,
}

impl HttpReply {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn ok_json(body: &Value) -> Self {
        Self::new(200, body.to_string())
    }

    pub fn is_ok(&self) -> bool {
        self.status == 200
    }

    pub fn json(&self) -> Result<Value> {
        serde_json::from_str(&self.body).context("response body is not valid JSON")
    }
}

/// Why an exchange produced no reply at all.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("backend unreachable: {0}")]
    Connect(String),
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Blocking HTTP seam under [`crate::ApiClient`].
///
/// `timeout: None` lets the call block for as long as the backend takes.
pub trait Transport: Send + Sync {
    fn get(&self, url: &str, timeout: Option<Duration>) -> Result<HttpReply, TransportError>;
    fn post_json(
        &self,
        url: &str,
        body: &Value,
        timeout: Option<Duration>,
    ) -> Result<HttpReply, TransportError>;
}

pub struct HttpTransport {
    http: HttpClient,
}

impl HttpTransport {
    pub fn new() -> Result<Self> {
        // reqwest's blocking client defaults to a 30s timeout; generation calls need none
        let http = HttpClient::builder()
            .timeout(None::<Duration>)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { http })
    }

    fn finish(
        request: reqwest::blocking::RequestBuilder,
        timeout: Option<Duration>,
    ) -> Result<HttpReply, TransportError> {
        let request = match timeout {
            Some(timeout) => request.timeout(timeout),
            None => request,
        };
        let response = request.send().map_err(classify)?;
        let status = response.status().as_u16();
        let body = response.text().map_err(classify)?;
        Ok(HttpReply { status, body })
    }
}

impl Transport for HttpTransport {
    fn get(&self, url: &str, timeout: Option<Duration>) -> Result<HttpReply, TransportError> {
        Self::finish(self.http.get(url), timeout)
    }

    fn post_json(
        &self,
        url: &str,
        body: &Value,
        timeout: Option<Duration>,
    ) -> Result<HttpReply, TransportError> {
        Self::finish(self.http.post(url).json(body), timeout)
    }
}

fn classify(err: reqwest::Error) -> TransportError {
    let message = err.to_string();
    if err.is_timeout() {
        TransportError::Timeout(message)
    } else if err.is_connect() {
        TransportError::Connect(message)
    } else {
        TransportError::Protocol(message)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::HttpReply;

    #[test]
    fn reply_json_rejects_garbage() {
        assert!(HttpReply::new(200, "<html>").json().is_err());
        let reply = HttpReply::ok_json(&json!({"caption": "smile"}));
        assert!(reply.is_ok());
        assert_eq!(reply.json().ok(), Some(json!({"caption": "smile"})));
    }
}
