use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use storyloom_contracts::presets::{
    cfg_rescale_args, detailer_presets, PoseStrength, DEFAULT_TAGGER, DRAFT_CFG, DRAFT_SAMPLER,
    DRAFT_STEPS, POSE_REMIX, POSE_STORY,
};
use storyloom_contracts::seeds;
use storyloom_contracts::tags::trim_float;
use storyloom_contracts::{
    format_loras, AuxiliaryOptions, CancelToken, Cancelled, EventSink, GenerationRequest,
    Manifest, NullSink, Phase, PoseConditioning, SceneJob, SkipReason, StatusEvent,
    TagConflictResolver,
};
use tracing::{info, warn};

use crate::client::ApiClient;
use crate::persistence::{ArtifactRecord, PersistenceQueue, PersistenceReport};

/// Largest batch ever sent in one text-to-image call.
pub const MAX_BATCH_SIZE: usize = 4;

const INPUT_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "PNG", "JPG", "JPEG"];

/// Output tree of one project: `<root>/<project>/{draft,example,remix}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLayout {
    project_root: PathBuf,
}

impl OutputLayout {
    pub fn new(output_root: &Path, project_name: &str) -> Self {
        Self {
            project_root: output_root.join(project_name),
        }
    }

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    pub fn draft_dir(&self) -> PathBuf {
        self.project_root.join("draft")
    }

    pub fn example_dir(&self) -> PathBuf {
        self.project_root.join("example")
    }

    pub fn remix_dir(&self) -> PathBuf {
        self.project_root.join("remix")
    }

    fn ensure(&self, mode: RunMode) -> Result<()> {
        let dirs = match mode {
            RunMode::Remix => vec![self.remix_dir()],
            RunMode::Story => vec![self.draft_dir(), self.example_dir()],
        };
        for dir in dirs {
            fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }
}

/// `{scene_id}_{index:03}.png`, with a 1-based index.
pub fn artifact_name(scene_id: &str, index: usize) -> String {
    format!("{scene_id}_{index:03}.png")
}

/// Output names for a remix run, one per input. A stem shared by several
/// inputs gets its extension appended (`x.jpg` -> `Remix_x_jpg.png`).
pub fn remix_names(inputs: &[PathBuf]) -> Vec<String> {
    let stem_of = |input: &PathBuf| {
        input
            .file_stem()
            .map(|stem| stem.to_string_lossy().to_string())
            .unwrap_or_default()
    };
    let mut seen: HashMap<String, usize> = HashMap::new();
    for input in inputs {
        *seen.entry(stem_of(input)).or_default() += 1;
    }
    inputs
        .iter()
        .map(|input| {
            let stem = stem_of(input);
            if seen.get(&stem).copied().unwrap_or(0) > 1 {
                let ext = input
                    .extension()
                    .map(|ext| ext.to_string_lossy().to_string())
                    .unwrap_or_default();
                format!("Remix_{stem}_{ext}.png")
            } else {
                format!("Remix_{stem}.png")
            }
        })
        .collect()
}

/// Raster files directly inside `dir`, sorted by path. A missing directory
/// holds no inputs.
pub fn discover_input_images(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut files = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("failed to list {}", dir.display()))? {
        let path = entry?.path();
        let matches = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| INPUT_EXTENSIONS.contains(&ext))
            .unwrap_or(false);
        if matches && path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineOptions {
    pub input_dir: PathBuf,
    pub output_root: PathBuf,
    pub batch_size: usize,
    pub save_workers: usize,
    pub tagger: String,
}

impl PipelineOptions {
    pub fn new(input_dir: impl Into<PathBuf>, output_root: impl Into<PathBuf>) -> Self {
        Self {
            input_dir: input_dir.into(),
            output_root: output_root.into(),
            batch_size: 1,
            save_workers: 2,
            tagger: DEFAULT_TAGGER.to_string(),
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.clamp(1, MAX_BATCH_SIZE);
        self
    }

    pub fn with_save_workers(mut self, save_workers: usize) -> Self {
        self.save_workers = save_workers.max(1);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Remix,
    Story,
}

impl RunMode {
    pub fn as_str(self) -> &'static str {
        match self {
            RunMode::Remix => "remix",
            RunMode::Story => "story",
        }
    }
}

/// Per-phase image counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PhaseTally {
    pub completed: usize,
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhaseReport {
    pub phase: Phase,
    pub model: String,
    #[serde(flatten)]
    pub tally: PhaseTally,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    Aborted { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub project: String,
    pub mode: RunMode,
    pub outcome: RunOutcome,
    pub started_at: String,
    pub finished_at: String,
    pub phases: Vec<PhaseReport>,
    pub persistence: PersistenceReport,
    pub elapsed_s: f64,
}

impl RunReport {
    pub fn is_completed(&self) -> bool {
        self.outcome == RunOutcome::Completed
    }
}

/// Drives one manifest to completion: remix when input images exist,
/// otherwise draft then refine.
///
/// Generation runs on the calling thread, one request at a time; writes
/// happen on the persistence pool. A unit that fails is logged, counted and
/// skipped. Only cancellation stops a phase early.
pub struct Pipeline {
    client: ApiClient,
    manifest: Manifest,
    options: PipelineOptions,
    layout: OutputLayout,
    resolver: TagConflictResolver,
    events: Arc<dyn EventSink>,
    cancel: CancelToken,
}

impl Pipeline {
    pub fn new(client: ApiClient, manifest: Manifest, options: PipelineOptions) -> Self {
        let layout = OutputLayout::new(&options.output_root, &manifest.project_name);
        Self {
            client,
            manifest,
            options,
            layout,
            resolver: TagConflictResolver::default(),
            events: Arc::new(NullSink),
            cancel: CancelToken::new(),
        }
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn layout(&self) -> &OutputLayout {
        &self.layout
    }

    pub fn run(&self) -> Result<RunReport> {
        let clock = Instant::now();
        let started_at = now_utc_iso();
        let inputs = discover_input_images(&self.options.input_dir)?;
        let mode = if inputs.is_empty() {
            RunMode::Story
        } else {
            RunMode::Remix
        };
        info!(
            project = %self.manifest.project_name,
            mode = mode.as_str(),
            inputs = inputs.len(),
            "run started"
        );
        self.events.emit(&StatusEvent::RunStarted {
            project: self.manifest.project_name.clone(),
            mode: mode.as_str().to_string(),
        });

        let mut report = RunReport {
            project: self.manifest.project_name.clone(),
            mode,
            outcome: RunOutcome::Completed,
            started_at,
            finished_at: String::new(),
            phases: Vec::new(),
            persistence: PersistenceReport::default(),
            elapsed_s: 0.0,
        };

        if !self.client.probe() {
            let reason = format!("backend unreachable at {}", self.client.base_url());
            report.outcome = RunOutcome::Aborted { reason };
            return Ok(self.finish(report, clock));
        }
        self.layout.ensure(mode)?;

        let queue = PersistenceQueue::new(self.options.save_workers, Arc::clone(&self.events))?;
        let result = match mode {
            RunMode::Remix => self
                .run_remix(&inputs, &queue)
                .map(|phase| report.phases.push(phase)),
            RunMode::Story => self.run_story(&queue, &mut report.phases),
        };
        report.persistence = queue.drain();

        match result {
            Ok(()) => {}
            Err(err) if err.is::<Cancelled>() => {
                report.outcome = RunOutcome::Aborted {
                    reason: err.to_string(),
                };
            }
            Err(err) => return Err(err),
        }
        Ok(self.finish(report, clock))
    }

    fn finish(&self, mut report: RunReport, clock: Instant) -> RunReport {
        report.elapsed_s = clock.elapsed().as_secs_f64();
        report.finished_at = now_utc_iso();
        match &report.outcome {
            RunOutcome::Completed => {
                info!(
                    written = report.persistence.written,
                    failed = report.persistence.failed,
                    elapsed_s = report.elapsed_s,
                    "run finished"
                );
                self.events.emit(&StatusEvent::RunFinished {
                    written: report.persistence.written,
                    failed: report.persistence.failed,
                    elapsed_s: report.elapsed_s,
                });
            }
            RunOutcome::Aborted { reason } => {
                warn!("run aborted: {reason}");
                self.events.emit(&StatusEvent::RunAborted {
                    reason: reason.clone(),
                });
            }
        }
        report
    }

    fn run_story(&self, queue: &PersistenceQueue, phases: &mut Vec<PhaseReport>) -> Result<()> {
        phases.push(self.run_draft(queue)?);
        // refine reads the drafts back from disk
        queue.wait_idle();
        phases.push(self.run_refine(queue)?);
        Ok(())
    }

    fn deploy(&self, model: &str) -> Result<()> {
        if !self.client.deploy(model, &self.cancel)? {
            bail!("model {model} did not become active");
        }
        Ok(())
    }

    fn start_phase(&self, phase: Phase, model: &str, units: usize) {
        info!(phase = phase.as_str(), model, units, "phase started");
        self.events.emit(&StatusEvent::PhaseStarted {
            phase,
            model: model.to_string(),
            units,
        });
    }

    fn skip_unit(&self, phase: Phase, unit: String, reason: SkipReason) {
        self.events.emit(&StatusEvent::UnitSkipped {
            phase,
            unit,
            reason,
        });
    }

    /// Records a unit failure, or hands cancellation back to the caller.
    fn fail_unit(&self, phase: Phase, unit: String, err: anyhow::Error) -> Result<()> {
        if err.is::<Cancelled>() {
            return Err(err);
        }
        warn!(phase = phase.as_str(), unit = %unit, "unit failed: {err:#}");
        self.events.emit(&StatusEvent::UnitFailed {
            phase,
            unit,
            error: format!("{err:#}"),
        });
        Ok(())
    }

    fn auxiliary(&self, strength: PoseStrength) -> AuxiliaryOptions {
        let pose = self
            .manifest
            .models
            .controlnet_openpose
            .as_deref()
            .map(str::trim)
            .filter(|model| !model.is_empty())
            .map(|model| PoseConditioning {
                model: model.to_string(),
                strength,
                image: None,
            });
        AuxiliaryOptions {
            detailers: detailer_presets(&self.manifest.ad_modes),
            pose,
            cfg_rescale: self.manifest.use_dt.then(cfg_rescale_args),
        }
    }

    /// Re-renders each input image under the character header, keeping the
    /// inferred tags that do not contradict it.
    pub fn run_remix(&self, inputs: &[PathBuf], queue: &PersistenceQueue) -> Result<PhaseReport> {
        let model = self.manifest.models.final_model.clone();
        self.deploy(&model)?;
        self.start_phase(Phase::Remix, &model, inputs.len());

        let auxiliary = self.auxiliary(POSE_REMIX);
        let mut tally = PhaseTally::default();
        for (input, name) in inputs.iter().zip(remix_names(inputs)) {
            let unit = input
                .file_name()
                .map(|name| name.to_string_lossy().to_string())
                .unwrap_or_default();
            let destination = self.layout.remix_dir().join(name);
            if destination.exists() {
                tally.skipped += 1;
                self.skip_unit(Phase::Remix, unit, SkipReason::AlreadyDone);
                continue;
            }
            match self.remix_one(input, &unit, &destination, &auxiliary, queue) {
                Ok(()) => {
                    tally.completed += 1;
                    self.events.emit(&StatusEvent::UnitCompleted {
                        phase: Phase::Remix,
                        unit,
                        images: 1,
                    });
                }
                Err(err) => {
                    tally.failed += 1;
                    self.fail_unit(Phase::Remix, unit, err)?;
                }
            }
        }
        Ok(PhaseReport {
            phase: Phase::Remix,
            model,
            tally,
        })
    }

    fn remix_one(
        &self,
        input: &Path,
        unit: &str,
        destination: &Path,
        auxiliary: &AuxiliaryOptions,
        queue: &PersistenceQueue,
    ) -> Result<()> {
        let source =
            fs::read(input).with_context(|| format!("failed to read {}", input.display()))?;
        let (width, height) = image::image_dimensions(input)
            .with_context(|| format!("unreadable input image {}", input.display()))?;

        let settings = &self.manifest.remix_settings;
        let header = self.manifest.character_header.as_str();
        let raw_tags = self.client.infer_tags(&source, &self.options.tagger);
        let tags = self.resolver.resolve(
            &raw_tags,
            header,
            settings.original_tags_weight,
            &settings.conflict_keywords,
        );
        let prompt = format!(
            "{} ({header}:{}), {tags} {}",
            self.manifest.final_prefix(),
            trim_float(settings.user_prompt_weight),
            format_loras(&self.manifest.final_loras),
        );

        let sampling = &self.manifest.generation_settings;
        let request = GenerationRequest::new(prompt, self.manifest.final_negative())
            .with_size(width, height)
            .with_sampling(sampling.steps, sampling.final_cfg, sampling.sampler.clone())
            .with_denoising_strength(settings.denoising_strength);
        let result = self
            .client
            .generate_from_image(&source, &request, auxiliary, &self.cancel)?;
        let Some(image) = result.first_image() else {
            bail!("backend returned no images");
        };
        queue.submit(ArtifactRecord {
            group: unit.to_string(),
            destination: destination.to_path_buf(),
            image: image.to_vec(),
            provenance: result.provenance.clone(),
        })
    }

    /// Text-to-image pass over every scene, in batches. A batch whose last
    /// file already exists is treated as done and never sent.
    pub fn run_draft(&self, queue: &PersistenceQueue) -> Result<PhaseReport> {
        let model = self.manifest.models.draft_model.clone();
        self.deploy(&model)?;
        self.start_phase(Phase::Draft, &model, self.total_images());

        let draft_dir = self.layout.draft_dir();
        let base_seed = self.manifest.seed_strategy.base_seed;
        let batch_size = self.options.batch_size.clamp(1, MAX_BATCH_SIZE);
        let mut tally = PhaseTally::default();

        for (scene_offset, scene) in self.manifest.scenes.iter().enumerate() {
            let count = self.manifest.scene_image_count(scene);
            let prompt = self.story_prompt(
                self.manifest.draft_prefix(),
                &self.manifest.draft_loras,
                scene,
            );
            let mut done = 0;
            while done < count {
                let batch = batch_size.min(count - done);
                let marker = artifact_name(&scene.scene_id, done + batch);
                if draft_dir.join(&marker).exists() {
                    tally.skipped += batch;
                    self.skip_unit(Phase::Draft, marker, SkipReason::AlreadyDone);
                    done += batch;
                    continue;
                }

                let request = GenerationRequest::new(prompt.clone(), self.manifest.draft_negative())
                    .with_size(
                        self.manifest.generation_settings.draft_width,
                        self.manifest.generation_settings.draft_height,
                    )
                    .with_sampling(DRAFT_STEPS, DRAFT_CFG, DRAFT_SAMPLER)
                    .with_seed(seeds::seed(base_seed, scene_offset, done))
                    .with_batch_size(u32::try_from(batch).unwrap_or(1));
                match self.draft_batch(scene, done, batch, &request, &draft_dir, queue) {
                    Ok(images) => {
                        tally.completed += images;
                        tally.failed += batch - images;
                        self.events.emit(&StatusEvent::UnitCompleted {
                            phase: Phase::Draft,
                            unit: marker,
                            images,
                        });
                    }
                    Err(err) => {
                        tally.failed += batch;
                        self.fail_unit(Phase::Draft, marker, err)?;
                    }
                }
                done += batch;
            }
        }
        Ok(PhaseReport {
            phase: Phase::Draft,
            model,
            tally,
        })
    }

    fn draft_batch(
        &self,
        scene: &SceneJob,
        done: usize,
        batch: usize,
        request: &GenerationRequest,
        draft_dir: &Path,
        queue: &PersistenceQueue,
    ) -> Result<usize> {
        let result = self.client.generate_from_text(request, &self.cancel)?;
        if result.images.is_empty() {
            bail!("backend returned no images");
        }
        let mut queued = 0;
        for (idx, image) in result.images.into_iter().take(batch).enumerate() {
            queue.submit(ArtifactRecord {
                group: scene.scene_id.clone(),
                destination: draft_dir.join(artifact_name(&scene.scene_id, done + idx + 1)),
                image,
                provenance: result.provenance.clone(),
            })?;
            queued += 1;
        }
        Ok(queued)
    }

    /// Image-to-image pass over existing drafts. An index is skipped when its
    /// draft is missing or its refined file already exists.
    pub fn run_refine(&self, queue: &PersistenceQueue) -> Result<PhaseReport> {
        let model = self.manifest.models.final_model.clone();
        self.deploy(&model)?;
        self.start_phase(Phase::Refine, &model, self.total_images());

        let draft_dir = self.layout.draft_dir();
        let example_dir = self.layout.example_dir();
        let base_seed = self.manifest.seed_strategy.base_seed;
        let auxiliary = self.auxiliary(POSE_STORY);
        let mut tally = PhaseTally::default();

        for (scene_offset, scene) in self.manifest.scenes.iter().enumerate() {
            let prompt = self.story_prompt(
                self.manifest.final_prefix(),
                &self.manifest.final_loras,
                scene,
            );
            for idx in 0..self.manifest.scene_image_count(scene) {
                let name = artifact_name(&scene.scene_id, idx + 1);
                let source = draft_dir.join(&name);
                let destination = example_dir.join(&name);
                if !source.exists() {
                    tally.skipped += 1;
                    self.skip_unit(Phase::Refine, name, SkipReason::DraftMissing);
                    continue;
                }
                if destination.exists() {
                    tally.skipped += 1;
                    self.skip_unit(Phase::Refine, name, SkipReason::AlreadyDone);
                    continue;
                }

                let sampling = &self.manifest.generation_settings;
                let request = GenerationRequest::new(prompt.clone(), self.manifest.final_negative())
                    .with_size(sampling.final_width, sampling.final_height)
                    .with_sampling(sampling.steps, sampling.final_cfg, sampling.sampler.clone())
                    .with_seed(seeds::seed(base_seed, scene_offset, idx))
                    .with_denoising_strength(sampling.final_denoise);
                let outcome =
                    self.refine_one(scene, &source, &destination, &request, &auxiliary, queue);
                match outcome {
                    Ok(()) => {
                        tally.completed += 1;
                        self.events.emit(&StatusEvent::UnitCompleted {
                            phase: Phase::Refine,
                            unit: name,
                            images: 1,
                        });
                    }
                    Err(err) => {
                        tally.failed += 1;
                        self.fail_unit(Phase::Refine, name, err)?;
                    }
                }
            }
        }
        Ok(PhaseReport {
            phase: Phase::Refine,
            model,
            tally,
        })
    }

    fn refine_one(
        &self,
        scene: &SceneJob,
        source: &Path,
        destination: &Path,
        request: &GenerationRequest,
        auxiliary: &AuxiliaryOptions,
        queue: &PersistenceQueue,
    ) -> Result<()> {
        let draft =
            fs::read(source).with_context(|| format!("failed to read {}", source.display()))?;
        let result = self
            .client
            .generate_from_image(&draft, request, auxiliary, &self.cancel)?;
        let Some(image) = result.first_image() else {
            bail!("backend returned no images");
        };
        queue.submit(ArtifactRecord {
            group: scene.scene_id.clone(),
            destination: destination.to_path_buf(),
            image: image.to_vec(),
            provenance: result.provenance.clone(),
        })
    }

    fn story_prompt(&self, prefix: &str, loras: &[String], scene: &SceneJob) -> String {
        format!(
            "{prefix} {} {}, {}",
            self.manifest.character_header,
            format_loras(loras),
            scene.prompt
        )
    }

    fn total_images(&self) -> usize {
        self.manifest
            .scenes
            .iter()
            .map(|scene| self.manifest.scene_image_count(scene))
            .sum()
    }
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}
