use serde_json::Value;

use crate::presets::PoseStrength;
use crate::seeds::RANDOM_SEED;

/// One call's worth of generation parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub prompt: String,
    pub negative_prompt: String,
    pub width: u32,
    pub height: u32,
    pub steps: u32,
    pub cfg_scale: f64,
    pub sampler: String,
    pub seed: i64,
    pub batch_size: u32,
    pub denoising_strength: Option<f64>,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>, negative_prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            negative_prompt: negative_prompt.into(),
            width: 512,
            height: 512,
            steps: 20,
            cfg_scale: 7.0,
            sampler: "Euler a".to_string(),
            seed: RANDOM_SEED,
            batch_size: 1,
            denoising_strength: None,
        }
    }

    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn with_sampling(mut self, steps: u32, cfg_scale: f64, sampler: impl Into<String>) -> Self {
        self.steps = steps;
        self.cfg_scale = cfg_scale;
        self.sampler = sampler.into();
        self
    }

    pub fn with_seed(mut self, seed: i64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_denoising_strength(mut self, strength: f64) -> Self {
        self.denoising_strength = Some(strength);
        self
    }
}

/// Pose-guided conditioning pass.
#[derive(Debug, Clone, PartialEq)]
pub struct PoseConditioning {
    /// Keyword or fully qualified `name [hash]` of the conditioning model.
    pub model: String,
    pub strength: PoseStrength,
    /// Reference image; the generation source image is used when absent.
    pub image: Option<Vec<u8>>,
}

/// Optional post-processing passes attached to a generation call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuxiliaryOptions {
    pub detailers: Vec<Value>,
    pub pose: Option<PoseConditioning>,
    pub cfg_rescale: Option<Value>,
}

/// Images returned by one successful call, plus the backend's parameter text.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerationResult {
    pub images: Vec<Vec<u8>>,
    pub provenance: Option<String>,
}

impl GenerationResult {
    pub fn first_image(&self) -> Option<&[u8]> {
        self.images.first().map(Vec::as_slice)
    }
}

/// Human-readable parameters from a response's `info` field.
///
/// `info` is usually a JSON document encoded as a string; its first
/// `infotexts` entry wins. Anything else falls back to the raw text.
pub fn extract_provenance(info: &Value) -> Option<String> {
    match info {
        Value::Null => None,
        Value::String(raw) if raw.trim().is_empty() => None,
        Value::String(raw) => match serde_json::from_str::<Value>(raw) {
            Ok(parsed @ Value::Object(_)) => {
                first_infotext(&parsed).or_else(|| Some(raw.clone()))
            }
            _ => Some(raw.clone()),
        },
        Value::Object(_) => first_infotext(info).or_else(|| Some(info.to_string())),
        other => Some(other.to_string()),
    }
}

fn first_infotext(info: &Value) -> Option<String> {
    info.get("infotexts")
        .and_then(Value::as_array)
        .and_then(|rows| rows.first())
        .and_then(Value::as_str)
        .map(str::to_string)
}
