//! Built-in defaults used when the manifest leaves a value out.

use serde_json::{json, Value};

pub const DRAFT_PREFIX: &str = "masterpiece, best quality, very aesthetic, newest, absurdres, highres, ultra-detailed, intricate details, official art, anime style, cinematic lighting, warm lighting, vibrant colors, (depth of field, subtle background blur:1.2),";
pub const DRAFT_NEGATIVE: &str =
    "score_4, score_3, score_2, score_1, source_furry, large breasts, thick thighs,";
pub const FINAL_PREFIX: &str = "masterpiece, best quality, very aesthetic, newest, absurdres, highres, ultra-detailed, intricate details, official art, anime style, cinematic lighting, warm lighting, vibrant colors, (depth of field, subtle background blur:1.2), very awa,";
pub const FINAL_NEGATIVE: &str = "large breasts, thick thighs, (worst quality, low quality:1.4), lowres, (bad), text, error, extra digits, extra limbs, missing limbs, bad hands, mutated hands, signature, watermark, username, old, early, jpeg artifacts, 3d, photorealistic, realistic, (dark:1.1), (shadow:1.1),";

/// Draft passes always run with these sampling values.
pub const DRAFT_STEPS: u32 = 20;
pub const DRAFT_CFG: f64 = 7.0;
pub const DRAFT_SAMPLER: &str = "Euler a";

pub const DEFAULT_TAGGER: &str = "deepdanbooru";

/// Composition tags that never survive a remix, whatever the user wrote.
pub const GLOBAL_TAG_BLACKLIST: &[&str] = &[
    "1girl",
    "solo",
    "simple background",
    "white background",
    "comic",
    "monochrome",
    "greyscale",
    "parody",
    "translated",
    "text",
    "speech bubble",
];

/// When the user text mentions the category keyword, inferred tags containing
/// any of the listed entries are dropped.
pub const TAG_CONFLICT_TABLE: &[(&str, &[&str])] = &[
    (
        "hair",
        &[
            "hair",
            "ponytail",
            "twintails",
            "braid",
            "ahoge",
            "bangs",
            "long hair",
            "short hair",
        ],
    ),
    (
        "eye",
        &["eye", "heterochromia", "blue eyes", "red eyes", "green eyes"],
    ),
    ("breast", &["breast", "chest", "cleavage"]),
    ("shirt", &["shirt", "blouse", "top", "camisole"]),
    ("skirt", &["skirt", "dress", "miniskirt"]),
    ("hat", &["hat", "cap", "headwear"]),
];

pub const POSE_MODULE: &str = "dw_openpose_full";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoseStrength {
    pub weight: f64,
    pub guidance_end: f64,
}

/// Remix keeps the pose loosely so body shape may change.
pub const POSE_REMIX: PoseStrength = PoseStrength {
    weight: 0.5,
    guidance_end: 0.5,
};

/// Refinement locks the draft's pose.
pub const POSE_STORY: PoseStrength = PoseStrength {
    weight: 0.8,
    guidance_end: 0.8,
};

pub fn cfg_rescale_args() -> Value {
    json!([true, 7.0, 99.5, "Cosine Up", 4, "Cosine Up", 4, 0, 100])
}

/// Argument block of a named detail-refinement pass; unknown names yield `None`.
pub fn detailer_preset(name: &str) -> Option<Value> {
    let preset = match name {
        "face" => json!({
            "ad_model": "face_yolov8n.pt",
            "ad_prompt": "beautiful detailed face, anime eyes, blush",
            "ad_denoising_strength": 0.4,
        }),
        "hand" => json!({
            "ad_model": "hand_yolov8n.pt",
            "ad_prompt": "perfect hands, 5 fingers",
            "ad_negative_prompt": "extra fingers, missing fingers, mutated hands",
            "ad_denoising_strength": 0.35,
        }),
        "person" => json!({
            "ad_model": "person_yolov8n-seg.pt",
            "ad_prompt": "highly detailed outfit, masterpiece body",
            "ad_denoising_strength": 0.3,
        }),
        _ => return None,
    };
    Some(preset)
}

pub fn detailer_presets(names: &[String]) -> Vec<Value> {
    names
        .iter()
        .filter_map(|name| detailer_preset(name.trim()))
        .collect()
}
