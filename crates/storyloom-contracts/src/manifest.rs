use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::presets::{DRAFT_NEGATIVE, DRAFT_PREFIX, FINAL_NEGATIVE, FINAL_PREFIX};
use crate::seeds::RANDOM_SEED;

/// Job manifest (`story.json`).
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Manifest {
    #[serde(default = "default_project_name")]
    pub project_name: String,
    pub models: ModelSet,
    #[serde(default)]
    pub seed_strategy: SeedStrategy,
    #[serde(default)]
    pub generation_settings: GenerationSettings,
    #[serde(default)]
    pub remix_settings: RemixSettings,
    #[serde(default)]
    pub character_header: String,
    #[serde(default)]
    pub draft_loras: Vec<String>,
    #[serde(default)]
    pub final_loras: Vec<String>,
    #[serde(default)]
    pub draft_prefix: Option<String>,
    #[serde(default)]
    pub draft_negative: Option<String>,
    #[serde(default)]
    pub final_prefix: Option<String>,
    #[serde(default)]
    pub final_negative: Option<String>,
    #[serde(default = "default_detailers", alias = "active_adetailers")]
    pub ad_modes: Vec<String>,
    #[serde(default = "default_true")]
    pub use_dt: bool,
    #[serde(default)]
    pub scenes: Vec<SceneJob>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ModelSet {
    pub draft_model: String,
    pub final_model: String,
    #[serde(default)]
    pub controlnet_openpose: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SeedStrategy {
    #[serde(default = "default_global_images")]
    pub global_num_images: usize,
    #[serde(default = "default_base_seed")]
    pub base_seed: i64,
}

impl Default for SeedStrategy {
    fn default() -> Self {
        Self {
            global_num_images: default_global_images(),
            base_seed: RANDOM_SEED,
        }
    }
}

/// Sampling defaults; a manifest may override any subset.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct GenerationSettings {
    pub draft_width: u32,
    pub draft_height: u32,
    pub final_width: u32,
    pub final_height: u32,
    pub final_denoise: f64,
    pub final_cfg: f64,
    pub steps: u32,
    pub sampler: String,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            draft_width: 832,
            draft_height: 1216,
            final_width: 1024,
            final_height: 1536,
            final_denoise: 0.55,
            final_cfg: 7.0,
            steps: 28,
            sampler: "Euler a".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RemixSettings {
    pub user_prompt_weight: f64,
    pub original_tags_weight: f64,
    pub denoising_strength: f64,
    pub conflict_keywords: Vec<String>,
}

impl Default for RemixSettings {
    fn default() -> Self {
        Self {
            user_prompt_weight: 1.5,
            original_tags_weight: 0.5,
            denoising_strength: 0.6,
            conflict_keywords: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SceneJob {
    pub scene_id: String,
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub num_images: Option<usize>,
}

impl SceneJob {
    pub fn image_count(&self, global: usize) -> usize {
        self.num_images.unwrap_or(global)
    }
}

impl Manifest {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed reading manifest {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("invalid manifest {}", path.display()))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let manifest: Manifest = serde_json::from_str(raw)?;
        manifest.validate()?;
        Ok(manifest)
    }

    fn validate(&self) -> Result<()> {
        if self.models.draft_model.trim().is_empty() {
            bail!("models.draft_model must not be empty");
        }
        if self.models.final_model.trim().is_empty() {
            bail!("models.final_model must not be empty");
        }
        for scene in &self.scenes {
            if scene.scene_id.trim().is_empty() {
                bail!("scene_id must not be empty");
            }
        }
        Ok(())
    }

    pub fn draft_prefix(&self) -> &str {
        self.draft_prefix.as_deref().unwrap_or(DRAFT_PREFIX)
    }

    pub fn draft_negative(&self) -> &str {
        self.draft_negative.as_deref().unwrap_or(DRAFT_NEGATIVE)
    }

    pub fn final_prefix(&self) -> &str {
        self.final_prefix.as_deref().unwrap_or(FINAL_PREFIX)
    }

    pub fn final_negative(&self) -> &str {
        self.final_negative.as_deref().unwrap_or(FINAL_NEGATIVE)
    }

    pub fn scene_image_count(&self, scene: &SceneJob) -> usize {
        scene.image_count(self.seed_strategy.global_num_images)
    }
}

/// Renders LoRA references as prompt tokens, each with a leading space.
///
/// Bare names become `<lora:NAME:1>`, `lora:` references get angle brackets,
/// anything already bracketed is passed through.
pub fn format_loras(items: &[String]) -> String {
    let mut out = String::new();
    for item in items.iter().map(|item| item.trim()).filter(|item| !item.is_empty()) {
        if item.starts_with('<') {
            out.push_str(&format!(" {item}"));
        } else if item.contains("lora:") {
            out.push_str(&format!(" <{item}>"));
        } else {
            out.push_str(&format!(" <lora:{item}:1>"));
        }
    }
    out
}

fn default_project_name() -> String {
    "Untitled_Project".to_string()
}

fn default_global_images() -> usize {
    2
}

fn default_base_seed() -> i64 {
    RANDOM_SEED
}

fn default_detailers() -> Vec<String> {
    vec!["face".to_string()]
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::{format_loras, Manifest};
    use crate::presets::DRAFT_PREFIX;

    #[test]
    fn minimal_manifest_takes_defaults() -> anyhow::Result<()> {
        let manifest = Manifest::parse(
            r#"{"models": {"draft_model": "draftXL", "final_model": "finalXL"},
                "scenes": [{"scene_id": "s1", "prompt": "beach"},
                           {"scene_id": "s2", "prompt": "city", "num_images": 5}]}"#,
        )?;
        assert_eq!(manifest.project_name, "Untitled_Project");
        assert_eq!(manifest.seed_strategy.base_seed, -1);
        assert_eq!(manifest.generation_settings.steps, 28);
        assert_eq!(manifest.remix_settings.user_prompt_weight, 1.5);
        assert_eq!(manifest.ad_modes, vec!["face".to_string()]);
        assert!(manifest.use_dt);
        assert_eq!(manifest.draft_prefix(), DRAFT_PREFIX);
        assert_eq!(manifest.scene_image_count(&manifest.scenes[0]), 2);
        assert_eq!(manifest.scene_image_count(&manifest.scenes[1]), 5);
        Ok(())
    }

    #[test]
    fn partial_generation_settings_merge_with_defaults() -> anyhow::Result<()> {
        let manifest = Manifest::parse(
            r#"{"models": {"draft_model": "a", "final_model": "b"},
                "generation_settings": {"steps": 40},
                "active_adetailers": ["hand"],
                "final_prefix": "custom,"}"#,
        )?;
        assert_eq!(manifest.generation_settings.steps, 40);
        assert_eq!(manifest.generation_settings.final_width, 1024);
        assert_eq!(manifest.ad_modes, vec!["hand".to_string()]);
        assert_eq!(manifest.final_prefix(), "custom,");
        Ok(())
    }

    #[test]
    fn missing_models_is_rejected() {
        assert!(Manifest::parse(r#"{"scenes": []}"#).is_err());
        assert!(
            Manifest::parse(r#"{"models": {"draft_model": " ", "final_model": "b"}}"#).is_err()
        );
    }

    #[test]
    fn load_reports_missing_file() {
        let err = Manifest::load(std::path::Path::new("/nonexistent/story.json"));
        assert!(err.is_err());
    }

    #[test]
    fn lora_formatting_matches_prompt_syntax() {
        let items = vec![
            "detail_slider".to_string(),
            "lora:style:0.6".to_string(),
            "<lora:raw:0.3>".to_string(),
            String::new(),
        ];
        assert_eq!(
            format_loras(&items),
            " <lora:detail_slider:1> <lora:style:0.6> <lora:raw:0.3>"
        );
    }
}
