// VELIN - Coeur d'ingestion documentaire
// D'une source opaque (PDF, EPUB, markdown) vers des chunks alignés sur
// offsets, porteurs de provenance, prêts pour l'embedding

pub mod ingest;

pub use ingest::{
    Chunk, ChunkerKind, CleanedMarkdown, Document, EventBus, IngestError, IngestResult,
    IngestionPipeline, PipelineConfig, PipelineOutcome, ProcessingStage, RawChunk, ReviewGate,
    SourceKind, StageMachine, StageMachineConfig,
};
