use std::process::Command;
use std::thread;

use storyloom_engine::MAX_BATCH_SIZE;
use tracing::debug;

const FALLBACK_VRAM_GB: f64 = 8.0;
const FALLBACK_GPU_NAME: &str = "Generic GPU (auto-detected)";
const RESERVED_VRAM_GB: f64 = 4.0;
const VRAM_PER_IMAGE_GB: f64 = 3.5;

/// What the local machine can afford: batch width for the backend and the
/// number of writer threads.
#[derive(Debug, Clone, PartialEq)]
pub struct HostProfile {
    pub gpu_name: String,
    pub vram_gb: f64,
    pub cpu_cores: usize,
}

impl HostProfile {
    pub fn detect() -> Self {
        let cpu_cores = thread::available_parallelism()
            .map(|count| count.get())
            .unwrap_or(4);
        let (vram_gb, gpu_name) = query_gpu().unwrap_or_else(|| {
            debug!("no GPU report available; assuming {FALLBACK_VRAM_GB} GB");
            (FALLBACK_VRAM_GB, FALLBACK_GPU_NAME.to_string())
        });
        Self {
            gpu_name,
            vram_gb,
            cpu_cores,
        }
    }

    pub fn batch_size(&self) -> usize {
        let spare = self.vram_gb - RESERVED_VRAM_GB;
        if spare <= 0.0 {
            return 1;
        }
        ((spare / VRAM_PER_IMAGE_GB).floor() as usize).clamp(1, MAX_BATCH_SIZE)
    }

    pub fn save_workers(&self) -> usize {
        self.cpu_cores.saturating_sub(2).clamp(2, 4)
    }
}

fn query_gpu() -> Option<(f64, String)> {
    let output = Command::new("nvidia-smi")
        .args([
            "--query-gpu=memory.total,name",
            "--format=csv,noheader,nounits",
        ])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    parse_gpu_report(&String::from_utf8_lossy(&output.stdout))
}

/// Parses the first line of `memory.total,name` output (MiB, name).
fn parse_gpu_report(raw: &str) -> Option<(f64, String)> {
    let line = raw.lines().next()?;
    let (memory, name) = line.split_once(',')?;
    let mib: f64 = memory.trim().parse().ok()?;
    Some((mib / 1024.0, name.trim().to_string()))
}
