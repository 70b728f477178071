use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::Result;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::{json, Value};
use storyloom_contracts::{
    AuxiliaryOptions, CancelToken, EventSink, GenerationRequest, GenerationResult, NullSink,
    StatusEvent,
};
use tracing::{debug, info, warn};

use crate::transport::{HttpReply, HttpTransport, Transport, TransportError};
use crate::wire;

pub const DEFAULT_API_URL: &str = "http://127.0.0.1:7860";

/// Intervals used by the retry and poll loops. Attempts are never capped.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Pause between failed generation attempts.
    pub backoff: Duration,
    /// Pause between active-model reads while a deployment is pending.
    pub deploy_poll: Duration,
    pub probe_timeout: Duration,
    pub switch_timeout: Duration,
    pub poll_timeout: Duration,
    pub lookup_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff: Duration::from_secs(3),
            deploy_poll: Duration::from_secs(3),
            probe_timeout: Duration::from_secs(3),
            switch_timeout: Duration::from_secs(5),
            poll_timeout: Duration::from_secs(10),
            lookup_timeout: Duration::from_secs(10),
        }
    }
}

/// Client for the generation backend that hides its flakiness.
///
/// Generation calls retry forever with a fixed backoff and only return early
/// through the [`CancelToken`]; deployment polls the same way. The auxiliary
/// model list is fetched once and then kept for the client's lifetime.
pub struct ApiClient {
    base_url: String,
    api_url: String,
    transport: Arc<dyn Transport>,
    policy: RetryPolicy,
    events: Arc<dyn EventSink>,
    auxiliary_models: OnceLock<Vec<String>>,
}

impl ApiClient {
    pub fn new(base_url: &str, transport: Arc<dyn Transport>) -> Self {
        let base_url = base_url.trim().trim_end_matches('/').to_string();
        Self {
            api_url: format!("{base_url}/sdapi/v1"),
            base_url,
            transport,
            policy: RetryPolicy::default(),
            events: Arc::new(NullSink),
            auxiliary_models: OnceLock::new(),
        }
    }

    /// Client over real HTTP.
    pub fn connect(base_url: &str) -> Result<Self> {
        Ok(Self::new(base_url, Arc::new(HttpTransport::new()?)))
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.api_url, path)
    }

    /// Single short status call; any failure reads as unreachable.
    pub fn probe(&self) -> bool {
        match self
            .transport
            .get(&self.endpoint("progress"), Some(self.policy.probe_timeout))
        {
            Ok(reply) => reply.is_ok(),
            Err(err) => {
                debug!("probe failed: {err}");
                false
            }
        }
    }

    /// Name of the checkpoint currently loaded, or an empty string when unknown.
    pub fn active_model(&self, timeout: Option<Duration>) -> String {
        self.transport
            .get(&self.endpoint("options"), timeout)
            .ok()
            .filter(HttpReply::is_ok)
            .and_then(|reply| reply.json().ok())
            .and_then(|options| {
                options
                    .get("sd_model_checkpoint")
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
            .unwrap_or_default()
    }

    /// Makes `model_name` the active checkpoint and waits until the backend
    /// reports it. Returns immediately when it is already active.
    ///
    /// The switch request is fire-and-forget; the poll loop runs until the
    /// model shows up or `cancel` fires.
    pub fn deploy(&self, model_name: &str, cancel: &CancelToken) -> Result<bool> {
        if self.active_model(None).contains(model_name) {
            debug!(model = model_name, "model already active");
            self.events.emit(&StatusEvent::ModelDeployed {
                model: model_name.to_string(),
                switched: false,
            });
            return Ok(true);
        }

        info!(model = model_name, "deploying model");
        let switch = json!({ "sd_model_checkpoint": model_name });
        if let Err(err) = self.transport.post_json(
            &self.endpoint("options"),
            &switch,
            Some(self.policy.switch_timeout),
        ) {
            debug!(model = model_name, "switch request not acknowledged: {err}");
        }

        loop {
            cancel.sleep(self.policy.deploy_poll)?;
            if self
                .active_model(Some(self.policy.poll_timeout))
                .contains(model_name)
            {
                info!(model = model_name, "model deployed");
                self.events.emit(&StatusEvent::ModelDeployed {
                    model: model_name.to_string(),
                    switched: true,
                });
                return Ok(true);
            }
        }
    }

    /// One tag-inference attempt. Failures of any kind yield an empty string.
    pub fn infer_tags(&self, image: &[u8], model: &str) -> String {
        let payload = json!({ "image": BASE64.encode(image), "model": model });
        let reply = match self
            .transport
            .post_json(&self.endpoint("interrogate"), &payload, None)
        {
            Ok(reply) => reply,
            Err(err) => {
                warn!("tag inference failed: {err}");
                return String::new();
            }
        };
        if !reply.is_ok() {
            warn!(status = reply.status, "tag inference rejected");
            return String::new();
        }
        reply
            .json()
            .ok()
            .and_then(|body| {
                body.get("caption")
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
            .unwrap_or_default()
    }

    /// Maps a loose keyword onto a full auxiliary model identifier.
    ///
    /// Bracketed identifiers (`name [hash]`) pass through untouched, and so
    /// does a keyword with no case-insensitive match.
    pub fn resolve_auxiliary_model(&self, keyword: &str) -> String {
        if keyword.contains('[') && keyword.contains(']') {
            return keyword.to_string();
        }
        let needle = keyword.to_lowercase();
        self.auxiliary_models()
            .and_then(|models| {
                models
                    .iter()
                    .find(|model| model.to_lowercase().contains(&needle))
                    .cloned()
            })
            .unwrap_or_else(|| keyword.to_string())
    }

    fn auxiliary_models(&self) -> Option<&[String]> {
        if let Some(models) = self.auxiliary_models.get() {
            return Some(models.as_slice());
        }
        let url = format!("{}/controlnet/model_list", self.base_url);
        let models = match self.transport.get(&url, Some(self.policy.lookup_timeout)) {
            Ok(reply) if reply.is_ok() => reply.json().ok().map(|body| {
                body.get("model_list")
                    .and_then(Value::as_array)
                    .map(|rows| {
                        rows.iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect::<Vec<_>>()
                    })
                    .unwrap_or_default()
            }),
            Ok(reply) => {
                debug!(status = reply.status, "auxiliary model list unavailable");
                None
            }
            Err(err) => {
                debug!("auxiliary model list unavailable: {err}");
                None
            }
        }?;
        // a failed fetch leaves the cell empty so the next lookup tries again
        Some(self.auxiliary_models.get_or_init(|| models).as_slice())
    }

    pub fn generate_from_text(
        &self,
        request: &GenerationRequest,
        cancel: &CancelToken,
    ) -> Result<GenerationResult> {
        let body = self.post_with_retry("txt2img", &wire::text_payload(request), cancel)?;
        Ok(wire::parse_generation_result(&body))
    }

    pub fn generate_from_image(
        &self,
        source: &[u8],
        request: &GenerationRequest,
        auxiliary: &AuxiliaryOptions,
        cancel: &CancelToken,
    ) -> Result<GenerationResult> {
        let pose_model = auxiliary
            .pose
            .as_ref()
            .map(|pose| pose.model.trim())
            .filter(|model| !model.is_empty())
            .map(|model| self.resolve_auxiliary_model(model));
        let payload = wire::image_payload(source, request, auxiliary, pose_model.as_deref());
        let body = self.post_with_retry("img2img", &payload, cancel)?;
        Ok(wire::parse_generation_result(&body))
    }

    /// POSTs until the backend answers 200 with a JSON body.
    ///
    /// Every other outcome (status, connection failure, malformed body) waits
    /// `policy.backoff` and tries again, with no attempt limit. The only early
    /// exit is [`storyloom_contracts::Cancelled`].
    pub fn post_with_retry(&self, path: &str, payload: &Value, cancel: &CancelToken) -> Result<Value> {
        let url = self.endpoint(path);
        let mut attempt: u64 = 0;
        loop {
            cancel.check()?;
            attempt += 1;
            let reason = match self.transport.post_json(&url, payload, None) {
                Ok(reply) if reply.is_ok() => match reply.json() {
                    Ok(body) => {
                        if attempt > 1 {
                            info!(endpoint = path, attempt, "backend recovered");
                        }
                        return Ok(body);
                    }
                    Err(err) => format!("malformed response: {err:#}"),
                },
                Ok(reply) => format!("server error {}", reply.status),
                Err(err @ TransportError::Connect(_)) => err.to_string(),
                Err(err) => format!("request failed: {err}"),
            };
            warn!(endpoint = path, attempt, "{reason}; retrying");
            self.events.emit(&StatusEvent::RetryScheduled {
                endpoint: path.to_string(),
                attempt,
                reason,
                backoff_ms: u64::try_from(self.policy.backoff.as_millis()).unwrap_or(u64::MAX),
            });
            cancel.sleep(self.policy.backoff)?;
        }
    }
}
