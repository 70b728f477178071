//! Backend client, persistence pool and phase scheduler for storyloom runs.

pub mod client;
pub mod orchestrator;
pub mod persistence;
pub mod summary;
pub mod transport;
pub mod wire;

#[cfg(test)]
mod testing;

pub use client::{ApiClient, RetryPolicy, DEFAULT_API_URL};
pub use orchestrator::{
    discover_input_images, OutputLayout, PhaseReport, PhaseTally, Pipeline, PipelineOptions,
    RunMode, RunOutcome, RunReport, MAX_BATCH_SIZE,
};
pub use persistence::{ArtifactRecord, PersistenceQueue, PersistenceReport};
pub use summary::write_summary;
pub use transport::{HttpReply, HttpTransport, Transport, TransportError};
