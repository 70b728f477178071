use std::collections::{HashMap, VecDeque};
use std::io::Cursor;
use std::sync::Mutex;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::{ImageFormat, Rgb, RgbImage};
use serde_json::{json, Value};

use crate::client::RetryPolicy;
use crate::transport::{HttpReply, Transport, TransportError};

type Reply = Result<HttpReply, TransportError>;

#[derive(Debug, Clone)]
pub(crate) struct Recorded {
    pub method: &'static str,
    pub url: String,
    pub body: Option<Value>,
}

/// In-memory backend. Each route replays its queued replies in order and
/// repeats the last one forever; unrouted calls fail as unreachable.
#[derive(Default)]
pub(crate) struct ScriptedTransport {
    routes: Mutex<HashMap<(&'static str, String), VecDeque<Reply>>>,
    requests: Mutex<Vec<Recorded>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_get(&self, suffix: &str, replies: Vec<Reply>) {
        self.route("GET", suffix, replies);
    }

    pub fn on_post(&self, suffix: &str, replies: Vec<Reply>) {
        self.route("POST", suffix, replies);
    }

    fn route(&self, method: &'static str, suffix: &str, replies: Vec<Reply>) {
        if let Ok(mut routes) = self.routes.lock() {
            routes.insert((method, suffix.to_string()), replies.into());
        }
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.requests
            .lock()
            .map(|rows| rows.clone())
            .unwrap_or_default()
    }

    pub fn count(&self, method: &str, suffix: &str) -> usize {
        self.requests()
            .iter()
            .filter(|row| row.method == method && row.url.ends_with(suffix))
            .count()
    }

    pub fn bodies(&self, method: &str, suffix: &str) -> Vec<Value> {
        self.requests()
            .into_iter()
            .filter(|row| row.method == method && row.url.ends_with(suffix))
            .filter_map(|row| row.body)
            .collect()
    }

    pub fn last_body(&self, method: &str, suffix: &str) -> Option<Value> {
        self.bodies(method, suffix).pop()
    }

    fn answer(&self, method: &'static str, url: &str, body: Option<&Value>) -> Reply {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(Recorded {
                method,
                url: url.to_string(),
                body: body.cloned(),
            });
        }
        let Ok(mut routes) = self.routes.lock() else {
            return Err(TransportError::Protocol("route table poisoned".to_string()));
        };
        let queue = routes
            .iter_mut()
            .filter(|((route_method, suffix), _)| *route_method == method && url.ends_with(suffix.as_str()))
            .max_by_key(|((_, suffix), _)| suffix.len())
            .map(|(_, queue)| queue);
        match queue {
            Some(queue) if queue.len() > 1 => queue
                .pop_front()
                .unwrap_or_else(|| Err(TransportError::Connect("empty route".to_string()))),
            Some(queue) => queue
                .front()
                .cloned()
                .unwrap_or_else(|| Err(TransportError::Connect("empty route".to_string()))),
            None => Err(TransportError::Connect(format!("no route for {method} {url}"))),
        }
    }
}

impl Transport for ScriptedTransport {
    fn get(&self, url: &str, _timeout: Option<Duration>) -> Reply {
        self.answer("GET", url, None)
    }

    fn post_json(&self, url: &str, body: &Value, _timeout: Option<Duration>) -> Reply {
        self.answer("POST", url, Some(body))
    }
}

pub(crate) fn fast_policy() -> RetryPolicy {
    let tick = Duration::from_millis(1);
    RetryPolicy {
        backoff: tick,
        deploy_poll: tick,
        probe_timeout: tick,
        switch_timeout: tick,
        poll_timeout: tick,
        lookup_timeout: tick,
    }
}

pub(crate) fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let image = RgbImage::from_pixel(width, height, Rgb([200, 40, 90]));
    let mut buf = Cursor::new(Vec::new());
    image
        .write_to(&mut buf, ImageFormat::Png)
        .expect("encode test png");
    buf.into_inner()
}

/// Successful generation response carrying `count` small PNGs.
pub(crate) fn generation_body(count: usize) -> Value {
    let images: Vec<String> = (0..count).map(|_| BASE64.encode(png_bytes(4, 4))).collect();
    json!({
        "images": images,
        "info": json!({"infotexts": ["seed: 1"]}).to_string(),
    })
}

pub(crate) fn options_body(model: &str) -> Value {
    json!({ "sd_model_checkpoint": model })
}
