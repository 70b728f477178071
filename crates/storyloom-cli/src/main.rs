mod host;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use storyloom_contracts::{new_run_id, EventSink, EventWriter, Manifest};
use storyloom_engine::{
    write_summary, ApiClient, Pipeline, PipelineOptions, RunOutcome, DEFAULT_API_URL,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::host::HostProfile;

const EXIT_COMPLETED: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_ABORTED: i32 = 2;

#[derive(Debug, Parser)]
#[command(name = "storyloom", version, about = "Batch draft/refine/remix image runs")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the manifest: remix when input images exist, otherwise draft and refine.
    Run(RunArgs),
    /// Check that the backend answers and print the host profile.
    Probe(ProbeArgs),
}

#[derive(Debug, Parser)]
struct RunArgs {
    #[arg(long, env = "STORYLOOM_MANIFEST", default_value = "data/story.json")]
    manifest: PathBuf,
    /// Images placed here switch the run to remix mode.
    #[arg(long, env = "STORYLOOM_INPUT_DIR", default_value = "inputs")]
    inputs: PathBuf,
    #[arg(long, env = "STORYLOOM_OUTPUT_DIR", default_value = "outputs")]
    outputs: PathBuf,
    #[arg(long, env = "STORYLOOM_API_URL", default_value = DEFAULT_API_URL)]
    api_url: String,
    /// Defaults to `<outputs>/<project>/events.jsonl`.
    #[arg(long)]
    events: Option<PathBuf>,
    /// Overrides the batch width derived from GPU memory.
    #[arg(long)]
    batch_size: Option<usize>,
    /// Overrides the writer count derived from CPU cores.
    #[arg(long)]
    save_workers: Option<usize>,
}

#[derive(Debug, Parser)]
struct ProbeArgs {
    #[arg(long, env = "STORYLOOM_API_URL", default_value = DEFAULT_API_URL)]
    api_url: String,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("storyloom error: {err:#}");
            std::process::exit(EXIT_ERROR);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => run_manifest(args),
        Command::Probe(args) => run_probe(args),
    }
}

fn run_manifest(args: RunArgs) -> Result<i32> {
    let manifest = match Manifest::load(&args.manifest) {
        Ok(manifest) => manifest,
        Err(err) => {
            error!("{err:#}");
            return Ok(EXIT_ABORTED);
        }
    };

    let host = HostProfile::detect();
    let batch_size = args.batch_size.unwrap_or_else(|| host.batch_size());
    let save_workers = args.save_workers.unwrap_or_else(|| host.save_workers());
    info!(
        gpu = %host.gpu_name,
        vram_gb = host.vram_gb,
        batch_size,
        save_workers,
        "host profile"
    );

    let project_root = args.outputs.join(&manifest.project_name);
    let events_path = args
        .events
        .clone()
        .unwrap_or_else(|| project_root.join("events.jsonl"));
    let run_id = new_run_id();
    let events: Arc<dyn EventSink> = Arc::new(EventWriter::new(&events_path, run_id.as_str()));

    let client = ApiClient::connect(&args.api_url)?.with_events(Arc::clone(&events));
    let options = PipelineOptions::new(&args.inputs, &args.outputs)
        .with_batch_size(batch_size)
        .with_save_workers(save_workers);
    let pipeline = Pipeline::new(client, manifest, options).with_events(events);

    let report = pipeline.run()?;
    let summary_path = summary_path_for(&events_path);
    if let Err(err) = write_summary(&summary_path, &run_id, &report) {
        warn!(path = %summary_path.display(), "failed to write run summary: {err:#}");
    }

    match report.outcome {
        RunOutcome::Completed => {
            info!(
                output = %pipeline.layout().project_root().display(),
                "run completed"
            );
            Ok(EXIT_COMPLETED)
        }
        RunOutcome::Aborted { reason } => {
            error!("run aborted: {reason}");
            Ok(EXIT_ABORTED)
        }
    }
}

fn run_probe(args: ProbeArgs) -> Result<i32> {
    let host = HostProfile::detect();
    println!(
        "host: {} ({:.1} GB VRAM, {} cores) -> batch {}, {} writers",
        host.gpu_name,
        host.vram_gb,
        host.cpu_cores,
        host.batch_size(),
        host.save_workers()
    );
    let client = ApiClient::connect(&args.api_url)?;
    if client.probe() {
        println!("backend: reachable at {}", client.base_url());
        Ok(EXIT_COMPLETED)
    } else {
        println!("backend: unreachable at {}", client.base_url());
        Ok(EXIT_ABORTED)
    }
}

fn summary_path_for(events_path: &Path) -> PathBuf {
    events_path
        .parent()
        .map(|parent| parent.join("summary.json"))
        .unwrap_or_else(|| PathBuf::from("summary.json"))
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};

    use clap::Parser;

    use super::{run_manifest, summary_path_for, Cli, Command, EXIT_ABORTED};

    #[test]
    fn run_args_take_defaults() {
        let cli = Cli::try_parse_from(["storyloom", "run", "--batch-size", "3"]);
        let Ok(Cli {
            command: Command::Run(args),
        }) = cli
        else {
            panic!("run subcommand did not parse");
        };
        assert_eq!(args.batch_size, Some(3));
        assert_eq!(args.save_workers, None);
        assert!(args.events.is_none());
    }

    #[test]
    fn summary_lands_next_to_events() {
        assert_eq!(
            summary_path_for(Path::new("out/demo/events.jsonl")),
            PathBuf::from("out/demo/summary.json")
        );
    }

    #[test]
    fn missing_manifest_aborts_without_work() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let cli = Cli::try_parse_from([
            "storyloom",
            "run",
            "--manifest",
            temp.path().join("missing.json").to_str().unwrap_or_default(),
            "--outputs",
            temp.path().join("outputs").to_str().unwrap_or_default(),
        ])?;
        let Command::Run(args) = cli.command else {
            panic!("run subcommand did not parse");
        };
        assert_eq!(run_manifest(args)?, EXIT_ABORTED);
        assert!(!temp.path().join("outputs").exists());
        Ok(())
    }
}
