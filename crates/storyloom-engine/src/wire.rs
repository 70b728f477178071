//! JSON bodies exchanged with the generation backend.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::{json, Map, Value};
use storyloom_contracts::presets::POSE_MODULE;
use storyloom_contracts::request::extract_provenance;
use storyloom_contracts::{AuxiliaryOptions, GenerationRequest, GenerationResult};

pub const DETAILER_SCRIPT: &str = "ADetailer";
pub const POSE_SCRIPT: &str = "ControlNet";
pub const CFG_RESCALE_SCRIPT: &str = "Dynamic Thresholding (CFG Scale Fix)";

fn request_fields(request: &GenerationRequest) -> Map<String, Value> {
    let mut payload = Map::new();
    payload.insert("prompt".to_string(), json!(request.prompt));
    payload.insert("negative_prompt".to_string(), json!(request.negative_prompt));
    payload.insert("width".to_string(), json!(request.width));
    payload.insert("height".to_string(), json!(request.height));
    payload.insert("steps".to_string(), json!(request.steps));
    payload.insert("cfg_scale".to_string(), json!(request.cfg_scale));
    payload.insert("sampler_name".to_string(), json!(request.sampler));
    payload.insert("seed".to_string(), json!(request.seed));
    payload.insert("batch_size".to_string(), json!(request.batch_size));
    if let Some(strength) = request.denoising_strength {
        payload.insert("denoising_strength".to_string(), json!(strength));
    }
    payload
}

pub fn text_payload(request: &GenerationRequest) -> Value {
    let mut payload = request_fields(request);
    payload.insert("alwayson_scripts".to_string(), Value::Object(Map::new()));
    Value::Object(payload)
}

/// Image-to-image body. `pose_model` is the already-resolved conditioning
/// model name; the pose pass is left out when it is `None`.
pub fn image_payload(
    source: &[u8],
    request: &GenerationRequest,
    auxiliary: &AuxiliaryOptions,
    pose_model: Option<&str>,
) -> Value {
    let source_b64 = BASE64.encode(source);
    let mut payload = request_fields(request);
    payload.insert(
        "alwayson_scripts".to_string(),
        Value::Object(auxiliary_scripts(auxiliary, &source_b64, pose_model)),
    );
    payload.insert("init_images".to_string(), json!([source_b64]));
    Value::Object(payload)
}

pub fn auxiliary_scripts(
    auxiliary: &AuxiliaryOptions,
    source_b64: &str,
    pose_model: Option<&str>,
) -> Map<String, Value> {
    let mut scripts = Map::new();
    if !auxiliary.detailers.is_empty() {
        scripts.insert(
            DETAILER_SCRIPT.to_string(),
            json!({ "args": auxiliary.detailers }),
        );
    }
    if let (Some(pose), Some(model)) = (auxiliary.pose.as_ref(), pose_model) {
        let image = pose
            .image
            .as_deref()
            .map(|bytes| BASE64.encode(bytes))
            .unwrap_or_else(|| source_b64.to_string());
        scripts.insert(
            POSE_SCRIPT.to_string(),
            json!({
                "args": [{
                    "enabled": true,
                    "module": POSE_MODULE,
                    "model": model,
                    "weight": pose.strength.weight,
                    "guidance_end": pose.strength.guidance_end,
                    "image": image,
                    "resize_mode": "Crop and Resize",
                    "pixel_perfect": true,
                    "control_mode": "Balanced",
                }]
            }),
        );
    }
    if let Some(args) = auxiliary.cfg_rescale.as_ref() {
        scripts.insert(CFG_RESCALE_SCRIPT.to_string(), json!({ "args": args }));
    }
    scripts
}

/// Decodes `images` and `info` from a generation response.
///
/// Entries that are not valid base64 are dropped; a missing or malformed
/// `images` field yields an empty result.
pub fn parse_generation_result(body: &Value) -> GenerationResult {
    let images = body
        .get("images")
        .and_then(Value::as_array)
        .map(|rows| {
            rows.iter()
                .filter_map(Value::as_str)
                .filter_map(|encoded| match decode_image(encoded) {
                    Ok(bytes) => Some(bytes),
                    Err(err) => {
                        tracing::warn!("dropping undecodable image from response: {err}");
                        None
                    }
                })
                .collect()
        })
        .unwrap_or_default();
    let provenance = body.get("info").and_then(extract_provenance);
    GenerationResult { images, provenance }
}

fn decode_image(encoded: &str) -> Result<Vec<u8>, base64::DecodeError> {
    // some backends prefix a data URL header
    let raw = encoded
        .split_once(";base64,")
        .map(|(_, data)| data)
        .unwrap_or(encoded);
    BASE64.decode(raw.trim())
}

#[cfg(test)]
mod tests {
    use base64::Engine as _;
    use serde_json::{json, Value};
    use storyloom_contracts::presets::{cfg_rescale_args, POSE_STORY};
    use storyloom_contracts::{AuxiliaryOptions, GenerationRequest, PoseConditioning};

    use super::*;
    use super::BASE64;

    fn request() -> GenerationRequest {
        GenerationRequest::new("a cat", "blurry")
            .with_size(640, 960)
            .with_sampling(28, 6.5, "DPM++ 2M")
            .with_seed(42)
            .with_batch_size(2)
    }

    #[test]
    fn text_payload_flattens_request_fields() {
        let payload = text_payload(&request());
        assert_eq!(payload["prompt"], "a cat");
        assert_eq!(payload["negative_prompt"], "blurry");
        assert_eq!(payload["width"], 640);
        assert_eq!(payload["height"], 960);
        assert_eq!(payload["steps"], 28);
        assert_eq!(payload["cfg_scale"], 6.5);
        assert_eq!(payload["sampler_name"], "DPM++ 2M");
        assert_eq!(payload["seed"], 42);
        assert_eq!(payload["batch_size"], 2);
        assert!(payload.get("denoising_strength").is_none());
        assert!(payload.get("init_images").is_none());
        assert_eq!(payload["alwayson_scripts"], json!({}));
    }

    #[test]
    fn image_payload_carries_source_and_auxiliary_passes() {
        let auxiliary = AuxiliaryOptions {
            detailers: vec![json!({"ad_model": "face_yolov8n.pt"})],
            pose: Some(PoseConditioning {
                model: "openpose".to_string(),
                strength: POSE_STORY,
                image: None,
            }),
            cfg_rescale: Some(cfg_rescale_args()),
        };
        let request = request().with_denoising_strength(0.55);
        let payload = image_payload(b"src", &request, &auxiliary, Some("control_openpose [abc]"));

        let source_b64 = BASE64.encode(b"src");
        assert_eq!(payload["init_images"], json!([source_b64]));
        assert_eq!(payload["denoising_strength"], 0.55);
        let scripts = &payload["alwayson_scripts"];
        assert_eq!(scripts[DETAILER_SCRIPT]["args"][0]["ad_model"], "face_yolov8n.pt");
        let unit = &scripts[POSE_SCRIPT]["args"][0];
        assert_eq!(unit["model"], "control_openpose [abc]");
        assert_eq!(unit["module"], "dw_openpose_full");
        assert_eq!(unit["weight"], 0.8);
        assert_eq!(unit["image"], Value::String(source_b64));
        assert_eq!(scripts[CFG_RESCALE_SCRIPT]["args"][3], "Cosine Up");
    }

    #[test]
    fn pose_pass_needs_a_resolved_model() {
        let auxiliary = AuxiliaryOptions {
            pose: Some(PoseConditioning {
                model: "openpose".to_string(),
                strength: POSE_STORY,
                image: Some(b"ref".to_vec()),
            }),
            ..AuxiliaryOptions::default()
        };
        let payload = image_payload(b"src", &request(), &auxiliary, None);
        assert_eq!(payload["alwayson_scripts"], json!({}));

        let payload = image_payload(b"src", &request(), &auxiliary, Some("openpose"));
        assert_eq!(
            payload["alwayson_scripts"][POSE_SCRIPT]["args"][0]["image"],
            Value::String(BASE64.encode(b"ref"))
        );
    }

    #[test]
    fn parse_result_decodes_images_and_info() {
        let body = json!({
            "images": [BASE64.encode(b"one"), "%%%not-base64%%%", format!("data:image/png;base64,{}", BASE64.encode(b"two"))],
            "info": json!({"infotexts": ["seed: 9"]}).to_string(),
        });
        let result = parse_generation_result(&body);
        assert_eq!(result.images, vec![b"one".to_vec(), b"two".to_vec()]);
        assert_eq!(result.provenance.as_deref(), Some("seed: 9"));
    }

    #[test]
    fn parse_result_tolerates_unexpected_shape() {
        let result = parse_generation_result(&json!({"detail": "Not Found"}));
        assert!(result.images.is_empty());
        assert!(result.provenance.is_none());
    }
}
