use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use anyhow::{bail, Context, Result};
use image::DynamicImage;
use serde::Serialize;
use storyloom_contracts::{EventSink, StatusEvent};
use tracing::{debug, error};

/// PNG text keyword the backend's own UI reads parameters from.
pub const PROVENANCE_KEY: &str = "parameters";

const QUEUE_SLOTS_PER_WORKER: usize = 4;

/// One image waiting to be written. Existence of `destination` marks the unit done.
#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactRecord {
    /// Records sharing a group are written one after another, in submission order.
    pub group: String,
    pub destination: PathBuf,
    pub image: Vec<u8>,
    pub provenance: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PersistenceReport {
    pub written: u64,
    pub failed: u64,
}

#[derive(Default)]
struct Counters {
    written: AtomicU64,
    failed: AtomicU64,
    pending: Mutex<u64>,
    idle: Condvar,
}

impl Counters {
    fn report(&self) -> PersistenceReport {
        PersistenceReport {
            written: self.written.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
        }
    }

    fn add_pending(&self) {
        if let Ok(mut pending) = self.pending.lock() {
            *pending += 1;
        }
    }

    fn finish_one(&self) {
        if let Ok(mut pending) = self.pending.lock() {
            *pending = pending.saturating_sub(1);
            if *pending == 0 {
                self.idle.notify_all();
            }
        }
    }
}

/// Fixed pool of writer threads, each fed through its own bounded lane.
///
/// A record's `group` picks the lane, so one scene's images land in the
/// order they were generated while different scenes write in parallel.
/// Write failures are logged and counted, never returned to the submitter.
/// `submit` blocks while the chosen lane is full.
pub struct PersistenceQueue {
    lanes: Vec<SyncSender<ArtifactRecord>>,
    workers: Vec<JoinHandle<()>>,
    counters: Arc<Counters>,
}

impl PersistenceQueue {
    pub fn new(workers: usize, events: Arc<dyn EventSink>) -> Result<Self> {
        let counters = Arc::new(Counters::default());
        let mut lanes = Vec::new();
        let mut handles = Vec::new();
        for idx in 0..workers.max(1) {
            let (sender, receiver) = mpsc::sync_channel(QUEUE_SLOTS_PER_WORKER);
            let counters = Arc::clone(&counters);
            let events = Arc::clone(&events);
            let handle = thread::Builder::new()
                .name(format!("storyloom-writer-{idx}"))
                .spawn(move || worker_loop(receiver, &counters, events.as_ref()))
                .context("failed to spawn persistence worker")?;
            lanes.push(sender);
            handles.push(handle);
        }

        Ok(Self {
            lanes,
            workers: handles,
            counters,
        })
    }

    pub fn submit(&self, record: ArtifactRecord) -> Result<()> {
        if self.lanes.is_empty() {
            bail!("persistence queue already drained");
        }
        let lane = &self.lanes[self.lane_for(&record.group)];
        self.counters.add_pending();
        if lane.send(record).is_err() {
            self.counters.finish_one();
            bail!("persistence worker is gone");
        }
        Ok(())
    }

    fn lane_for(&self, group: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        group.hash(&mut hasher);
        (hasher.finish() % self.lanes.len() as u64) as usize
    }

    /// Blocks until every task submitted so far has been written or has failed.
    pub fn wait_idle(&self) {
        let Ok(mut pending) = self.counters.pending.lock() else {
            return;
        };
        while *pending > 0 {
            pending = match self.counters.idle.wait(pending) {
                Ok(guard) => guard,
                Err(_) => return,
            };
        }
    }

    pub fn report(&self) -> PersistenceReport {
        self.counters.report()
    }

    /// Closes the queue and joins every worker.
    pub fn drain(mut self) -> PersistenceReport {
        self.shutdown();
        self.counters.report()
    }

    fn shutdown(&mut self) {
        self.lanes.clear();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                error!("persistence worker panicked");
            }
        }
    }
}

impl Drop for PersistenceQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(receiver: Receiver<ArtifactRecord>, counters: &Counters, events: &dyn EventSink) {
    while let Ok(record) = receiver.recv() {
        let path = record.destination.to_string_lossy().to_string();
        match persist_artifact(&record) {
            Ok(()) => {
                counters.written.fetch_add(1, Ordering::SeqCst);
                debug!(path = %path, "artifact written");
                events.emit(&StatusEvent::ArtifactWritten { path });
            }
            Err(err) => {
                counters.failed.fetch_add(1, Ordering::SeqCst);
                error!(path = %path, "failed to save artifact: {err:#}");
                events.emit(&StatusEvent::ArtifactFailed {
                    path,
                    error: format!("{err:#}"),
                });
            }
        }
        counters.finish_one();
    }
}

/// Decodes the image, re-encodes it as PNG with optional provenance text and
/// moves it into place through a temporary file in the same directory.
pub fn persist_artifact(record: &ArtifactRecord) -> Result<()> {
    let image = image::load_from_memory(&record.image).context("image bytes are not decodable")?;
    let png = encode_png(&image, record.provenance.as_deref())?;
    write_atomic(&record.destination, &png)
}

/// 8-bit PNG with a `parameters` text chunk: `tEXt` when the text is
/// Latin-1, `iTXt` otherwise.
fn encode_png(image: &DynamicImage, provenance: Option<&str>) -> Result<Vec<u8>> {
    let (color, pixels) = if image.color().has_alpha() {
        (png::ColorType::Rgba, image.to_rgba8().into_raw())
    } else {
        (png::ColorType::Rgb, image.to_rgb8().into_raw())
    };

    let mut out = Vec::new();
    {
        let mut encoder = png::Encoder::new(&mut out, image.width(), image.height());
        encoder.set_color(color);
        encoder.set_depth(png::BitDepth::Eight);
        if let Some(text) = provenance.filter(|text| !text.is_empty()) {
            if text.chars().all(|ch| u32::from(ch) <= 0xFF) {
                encoder.add_text_chunk(PROVENANCE_KEY.to_string(), text.to_string())?;
            } else {
                encoder.add_itxt_chunk(PROVENANCE_KEY.to_string(), text.to_string())?;
            }
        }
        let mut writer = encoder.write_header().context("failed to encode PNG")?;
        writer
            .write_image_data(&pixels)
            .context("failed to encode PNG")?;
        writer.finish().context("failed to encode PNG")?;
    }
    Ok(out)
}

fn write_atomic(destination: &Path, bytes: &[u8]) -> Result<()> {
    let parent = destination
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)
        .with_context(|| format!("failed to create {}", parent.display()))?;
    let mut staged = tempfile::NamedTempFile::new_in(parent)
        .with_context(|| format!("failed to stage file in {}", parent.display()))?;
    staged.write_all(bytes)?;
    staged.flush()?;
    // temp files start out owner-only
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        staged
            .as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o644))?;
    }
    staged
        .persist(destination)
        .map_err(|err| err.error)
        .with_context(|| format!("failed to move artifact to {}", destination.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::io::Cursor;
    use std::sync::Arc;

    use storyloom_contracts::{EventSink, MemorySink, StatusEvent};

    use super::*;
    use crate::testing::png_bytes;

    fn text_chunks(bytes: &[u8]) -> anyhow::Result<Vec<(String, String)>> {
        let reader = png::Decoder::new(Cursor::new(bytes)).read_info()?;
        let info = reader.info();
        let mut out = Vec::new();
        for chunk in &info.uncompressed_latin1_text {
            out.push((chunk.keyword.clone(), chunk.text.clone()));
        }
        for chunk in &info.utf8_text {
            out.push((chunk.keyword.clone(), chunk.get_text()?));
        }
        Ok(out)
    }

    fn record(group: &str, destination: PathBuf, image: Vec<u8>) -> ArtifactRecord {
        ArtifactRecord {
            group: group.to_string(),
            destination,
            image,
            provenance: None,
        }
    }

    fn written_names(events: &MemorySink) -> Vec<String> {
        events
            .events()
            .into_iter()
            .filter_map(|event| match event {
                StatusEvent::ArtifactWritten { path } => Path::new(&path)
                    .file_name()
                    .map(|name| name.to_string_lossy().to_string()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn provenance_is_embedded_and_image_still_decodes() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let destination = temp.path().join("draft").join("s1_001.png");
        persist_artifact(&ArtifactRecord {
            provenance: Some("Steps: 20, Seed: 42".to_string()),
            ..record("s1", destination.clone(), png_bytes(3, 2))
        })?;

        let written = fs::read(&destination)?;
        let decoded = image::load_from_memory(&written)?;
        assert_eq!((decoded.width(), decoded.height()), (3, 2));
        assert_eq!(
            text_chunks(&written)?,
            vec![("parameters".to_string(), "Steps: 20, Seed: 42".to_string())]
        );
        Ok(())
    }

    #[test]
    fn non_latin_provenance_uses_international_chunk() -> anyhow::Result<()> {
        let image = image::load_from_memory(&png_bytes(1, 1))?;
        let encoded = encode_png(&image, Some("猫, Steps: 20"))?;
        assert!(encoded.windows(4).any(|window| window == b"iTXt"));
        assert_eq!(
            text_chunks(&encoded)?,
            vec![("parameters".to_string(), "猫, Steps: 20".to_string())]
        );
        image::load_from_memory(&encoded)?;
        Ok(())
    }

    #[test]
    fn empty_provenance_writes_no_text_chunk() -> anyhow::Result<()> {
        let image = image::load_from_memory(&png_bytes(2, 2))?;
        assert!(text_chunks(&encode_png(&image, Some(""))?)?.is_empty());
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn written_files_are_world_readable() -> anyhow::Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let temp = tempfile::tempdir()?;
        let destination = temp.path().join("s1_001.png");
        persist_artifact(&record("s1", destination.clone(), png_bytes(2, 2)))?;
        let mode = fs::metadata(&destination)?.permissions().mode();
        assert_eq!(mode & 0o777, 0o644);
        Ok(())
    }

    #[test]
    fn undecodable_bytes_fail_without_creating_file() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let destination = temp.path().join("broken.png");
        let result = persist_artifact(&record(
            "broken",
            destination.clone(),
            b"definitely not an image".to_vec(),
        ));
        assert!(result.is_err());
        assert!(!destination.exists());
        Ok(())
    }

    #[test]
    fn queue_drains_all_tasks_and_counts_failures() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let events = Arc::new(MemorySink::new());
        let sink: Arc<dyn EventSink> = events.clone();
        let queue = PersistenceQueue::new(2, sink)?;

        for idx in 1..=5 {
            queue.submit(record(
                &format!("scene-{idx}"),
                temp.path().join(format!("s_{idx:03}.png")),
                png_bytes(2, 2),
            ))?;
        }
        queue.submit(record("bad", temp.path().join("bad.png"), vec![1, 2, 3]))?;

        let report = queue.drain();
        assert_eq!(report, PersistenceReport { written: 5, failed: 1 });
        for idx in 1..=5 {
            assert!(temp.path().join(format!("s_{idx:03}.png")).exists());
        }
        let types = events.types();
        assert_eq!(types.iter().filter(|kind| **kind == "artifact_written").count(), 5);
        assert_eq!(types.iter().filter(|kind| **kind == "artifact_failed").count(), 1);
        Ok(())
    }

    #[test]
    fn one_group_is_written_in_submission_order() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let events = Arc::new(MemorySink::new());
        let sink: Arc<dyn EventSink> = events.clone();
        let queue = PersistenceQueue::new(2, sink)?;

        // the first image is far slower to encode than the two after it
        queue.submit(record("s1", temp.path().join("s1_001.png"), png_bytes(1500, 1500)))?;
        queue.submit(record("s1", temp.path().join("s1_002.png"), png_bytes(2, 2)))?;
        queue.submit(record("s1", temp.path().join("s1_003.png"), png_bytes(2, 2)))?;
        assert_eq!(queue.drain().written, 3);

        assert_eq!(
            written_names(&events),
            vec!["s1_001.png", "s1_002.png", "s1_003.png"]
        );
        Ok(())
    }

    #[test]
    fn wait_idle_returns_once_pending_writes_land() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let sink: Arc<dyn EventSink> = Arc::new(MemorySink::new());
        let queue = PersistenceQueue::new(1, sink)?;
        let destination = temp.path().join("x_001.png");
        queue.submit(ArtifactRecord {
            provenance: Some("p".to_string()),
            ..record("x", destination.clone(), png_bytes(2, 2))
        })?;
        queue.wait_idle();
        assert!(destination.exists());
        assert_eq!(queue.report().written, 1);
        queue.submit(record("x", temp.path().join("x_002.png"), png_bytes(2, 2)))?;
        assert_eq!(queue.drain().written, 2);
        Ok(())
    }
}
