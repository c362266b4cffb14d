// VELIN Core - Orchestration, persistance, caches, événements
// La machine à étapes et ses collaborateurs explicites

pub mod events;
pub mod pipeline;
pub mod raw_chunk_cache;
pub mod stage_machine;
pub mod storage;

pub use events::{DocumentEvents, EventBus, StageEvent, StageEventKind};
pub use pipeline::{IngestionPipeline, PipelineConfig, PipelineOutcome};
pub use raw_chunk_cache::{CachedRawChunks, RawChunkCache};
pub use stage_machine::{
    CancellationFlag, PhaseResult, StageMachine, StageMachineConfig, StagePhase, PHASES,
};
pub use storage::{
    canonical_json, check_manifest_version, CachedChunksFile, DocumentStore, FsStorage, Manifest,
    Storage, MANIFEST_VERSION,
};
