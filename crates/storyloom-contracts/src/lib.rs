pub mod cancel;
pub mod events;
pub mod manifest;
pub mod presets;
pub mod request;
pub mod seeds;
pub mod tags;

pub use cancel::{CancelToken, Cancelled};
pub use events::{
    new_run_id, EventSink, EventWriter, MemorySink, NullSink, Phase, SkipReason,
    StatusEvent,
};
pub use manifest::{format_loras, Manifest, SceneJob};
pub use request::{AuxiliaryOptions, GenerationRequest, GenerationResult, PoseConditioning};
pub use tags::TagConflictResolver;
