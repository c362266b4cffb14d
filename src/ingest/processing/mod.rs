// VELIN Traitement - Du markdown canonique aux chunks enrichis
// Nettoyage, chunking, récupération de positions, transfert, enrichissement

pub mod chunker;
pub mod cleaner;
pub mod enricher;
pub mod matcher;
pub mod transfer;

pub use chunker::{
    chunk_markdown, paragraph_spans, sentence_spans, validate_chunks, ChunkerConfig,
    SemanticContext, TokenCounter,
};
pub use cleaner::{split_at_headings, Cleaner, CleanerConfig};
pub use enricher::{clamp_enrichment, Enricher, EnricherConfig, ENRICHMENT_SCHEMA};
pub use matcher::{merge_bbox_rectangles, BulletproofMatcher, MatcherConfig, ParagraphIndex};
pub use transfer::transfer_metadata;
