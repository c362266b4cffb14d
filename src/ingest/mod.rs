// VELIN Ingest - Modèle de données central du pipeline d'ingestion
// Architecture modulaire : extraction par lots → stitching → nettoyage →
// chunking → récupération de positions → transfert de métadonnées →
// enrichissement → embeddings

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

pub mod core;
pub mod embedder;
pub mod extract;
pub mod model;
pub mod processing;
pub mod text;

pub use self::core::events::{EventBus, StageEvent, StageEventKind};
pub use self::core::pipeline::{IngestionPipeline, PipelineConfig, PipelineOutcome};
pub use self::core::raw_chunk_cache::RawChunkCache;
pub use self::core::stage_machine::{StageMachine, StageMachineConfig, StagePhase};
pub use self::core::storage::{DocumentStore, FsStorage, Storage, MANIFEST_VERSION};
pub use embedder::{EmbedError, EmbedderConfig, LocalEmbedder, TextEmbedder};
pub use extract::batch_planner::{calculate_batch_ranges, BatchConfig};
pub use extract::extractor::{BatchResult, Extractor, ModelExtractor};
pub use extract::stitcher::{stitch, StitchConfig, StitchMethod, StitchReport, StitchedMarkdown};
pub use model::{GenerateOptions, LocalModelClient, ModelClient, ModelError, StructuredOutputError};
pub use processing::chunker::{ChunkerConfig, TokenCounter};
pub use processing::cleaner::{Cleaner, CleanerConfig};
pub use processing::enricher::{Enricher, EnricherConfig};
pub use processing::matcher::{BulletproofMatcher, MatcherConfig};

// === Types de base ===

/// Type de source acceptée par le pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Pdf,
    Epub,
    #[serde(rename = "md")]
    Markdown,
    Text,
}

impl SourceKind {
    /// Déduit le type de source depuis l'extension du fichier
    pub fn from_path(path: &std::path::Path) -> Option<Self> {
        match path.extension()?.to_str()?.to_ascii_lowercase().as_str() {
            "pdf" => Some(Self::Pdf),
            "epub" => Some(Self::Epub),
            "md" | "markdown" => Some(Self::Markdown),
            "txt" | "text" => Some(Self::Text),
            _ => None,
        }
    }

    /// Les pages n'ont de sens que pour les sources paginées
    pub fn is_paginated(&self) -> bool {
        matches!(self, Self::Pdf)
    }
}

/// Stratégie de chunking choisie par l'utilisateur pour un document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkerKind {
    Recursive,
    Semantic,
    Token,
    Sentence,
    Late,
    Code,
    Hybrid,
}

impl Default for ChunkerKind {
    fn default() -> Self {
        Self::Recursive
    }
}

impl std::str::FromStr for ChunkerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "recursive" => Ok(Self::Recursive),
            "semantic" => Ok(Self::Semantic),
            "token" => Ok(Self::Token),
            "sentence" => Ok(Self::Sentence),
            "late" => Ok(Self::Late),
            "code" => Ok(Self::Code),
            "hybrid" => Ok(Self::Hybrid),
            other => Err(format!("unknown chunker strategy: {other}")),
        }
    }
}

impl fmt::Display for ChunkerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            Self::Recursive => "recursive",
            Self::Semantic => "semantic",
            Self::Token => "token",
            Self::Sentence => "sentence",
            Self::Late => "late",
            Self::Code => "code",
            Self::Hybrid => "hybrid",
        };
        f.write_str(tag)
    }
}

/// États du cycle de vie d'un document dans la machine à étapes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStage {
    Queued,
    Extracting,
    Extracted,
    Cleaning,
    Cleaned,
    Chunking,
    Chunked,
    Matching,
    Matched,
    Enriching,
    Enriched,
    Embedding,
    Embedded,
    Completed,
    Failed,
}

impl fmt::Display for ProcessingStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            Self::Queued => "queued",
            Self::Extracting => "extracting",
            Self::Extracted => "extracted",
            Self::Cleaning => "cleaning",
            Self::Cleaned => "cleaned",
            Self::Chunking => "chunking",
            Self::Chunked => "chunked",
            Self::Matching => "matching",
            Self::Matched => "matched",
            Self::Enriching => "enriching",
            Self::Enriched => "enriched",
            Self::Embedding => "embedding",
            Self::Embedded => "embedded",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(tag)
    }
}

/// Points de revue où la machine se met en pause en attendant un signal externe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewGate {
    /// Revue du markdown extrait, avant nettoyage
    Extraction,
    /// Revue des chunks, avant récupération de positions
    Chunks,
}

impl fmt::Display for ReviewGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Extraction => f.write_str("extraction"),
            Self::Chunks => f.write_str("chunks"),
        }
    }
}

/// Normalisation Unicode appliquée au flux nettoyé (consignée au manifest)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum UnicodeForm {
    #[default]
    None,
    Nfc,
    Nfkc,
}

/// Document en cours d'ingestion
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub owner: String,
    pub source_kind: SourceKind,
    pub source_path: PathBuf,
    /// Chemin du markdown canonique ; renseigné dès la fin de l'extraction
    pub markdown_path: Option<String>,
    pub chunker_kind: ChunkerKind,
    pub processing_stage: ProcessingStage,
    /// Revue en attente d'un signal `continue` externe
    pub review_pending: Option<ReviewGate>,
    /// Revues déjà approuvées par l'acteur externe
    pub reviews_approved: Vec<ReviewGate>,
    /// Jeu de chunks courant ; remplacé atomiquement par un retraitement,
    /// jamais plus d'un jeu courant à la fois
    pub current_chunk_set: Option<String>,
    pub word_count: Option<usize>,
    pub unicode_normalization: UnicodeForm,
    pub paused_at: Option<chrono::DateTime<chrono::Utc>>,
    pub resumed_at: Option<chrono::DateTime<chrono::Utc>>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl Document {
    /// Crée un document en file d'attente pour une source donnée
    pub fn new(owner: &str, source_path: PathBuf, source_kind: SourceKind) -> Self {
        let now = chrono::Utc::now();
        Self {
            id: format!("doc_{}", uuid::Uuid::new_v4().simple()),
            owner: owner.to_string(),
            source_kind,
            source_path,
            markdown_path: None,
            chunker_kind: ChunkerKind::default(),
            processing_stage: ProcessingStage::Queued,
            review_pending: None,
            reviews_approved: Vec::new(),
            current_chunk_set: None,
            word_count: None,
            unicode_normalization: UnicodeForm::None,
            paused_at: None,
            resumed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Préfixe de stockage `<owner>/<document_id>/`
    pub fn storage_prefix(&self) -> String {
        format!("{}/{}", self.owner, self.id)
    }
}

// === Extraction ===

/// Fenêtre de pages d'un lot d'extraction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchRange {
    pub batch_index: usize,
    /// Première page (1-indexée, incluse)
    pub page_start: u32,
    /// Dernière page (incluse)
    pub page_end: u32,
}

/// Rectangle de provenance sur une page (points PDF, origine en haut à gauche)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub page: u32,
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn right(&self) -> f32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> f32 {
        self.y + self.height
    }
}

/// Chunk brut émis par l'extracteur, avec provenance structurelle.
/// Jamais muté : mis en cache tel quel pour les retraitements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawChunk {
    pub content: String,
    pub page_start: Option<u32>,
    pub page_end: Option<u32>,
    pub heading_path: Vec<String>,
    pub bboxes: Vec<BoundingBox>,
    /// Intervalle semi-ouvert `[start, end)` dans le flux extrait original
    pub char_span: (usize, usize),
}

impl RawChunk {
    pub fn span_len(&self) -> usize {
        self.char_span.1.saturating_sub(self.char_span.0)
    }
}

// === Flux nettoyé ===

/// Markdown nettoyé : texte de référence pour les offsets et les embeddings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanedMarkdown {
    pub text: String,
    /// SHA256 hex du texte, stable pour (markdown brut, config de nettoyage)
    pub sha256: String,
}

impl CleanedMarkdown {
    pub fn new(text: String) -> Self {
        let sha256 = sha256_hex(text.as_bytes());
        Self { text, sha256 }
    }
}

/// SHA256 hex d'un buffer (checkpoints, flux nettoyé)
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

// === Positions récupérées ===

/// Méthode ayant produit la position d'un chunk brut dans le flux nettoyé
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchMethod {
    /// Occurrence normalisée unique (couche 1)
    Exact,
    /// Meilleure fenêtre par similarité d'embeddings (couche 2)
    Embedding,
    /// Localisation par modèle à sortie structurée (couche 3)
    Llm,
    /// Interpolation linéaire depuis les voisins (couche 4)
    Interpolation,
    /// Marqueur zero-width de dernier recours (couche 5)
    Marker,
}

/// Confiance attachée à une position récupérée
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionConfidence {
    Synthetic,
    Medium,
    High,
    Exact,
}

/// Confiance des métadonnées structurelles transférées sur un chunk final
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetadataConfidence {
    Low,
    Medium,
    High,
}

/// Position d'un chunk brut dans le flux nettoyé, toujours émise
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchedSpan {
    pub start: usize,
    pub end: usize,
    pub method: MatchMethod,
    pub confidence: PositionConfidence,
    pub interpolated: bool,
}

impl MatchedSpan {
    pub fn center(&self) -> usize {
        self.start + (self.end - self.start) / 2
    }

    /// Recouvrement avec un intervalle `[start, end)`. Un span zero-width
    /// recouvre s'il tombe dans l'intervalle.
    pub fn overlaps(&self, start: usize, end: usize) -> bool {
        if self.start == self.end {
            self.start >= start && self.start < end
        } else {
            self.start < end && self.end > start
        }
    }
}

// === Enrichissement ===

/// Concept extrait d'un chunk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Concept {
    pub text: String,
    pub importance: f32,
}

/// Tonalité émotionnelle d'un chunk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmotionalTone {
    /// Polarité dans [-1, 1]
    pub polarity: f32,
    pub primary_emotion: String,
    /// Intensité dans [0, 1]
    pub intensity: f32,
}

/// Domaine de connaissance dominant d'un chunk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainTag {
    pub primary_domain: String,
    pub confidence: f32,
}

/// Métadonnées sémantiques produites par l'enricher
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkEnrichment {
    pub themes: Vec<String>,
    pub concepts: Vec<Concept>,
    pub importance: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emotional: Option<EmotionalTone>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<DomainTag>,
}

// === Chunk final ===

/// Chunk final : segment du flux nettoyé, enrichi de provenance structurelle,
/// de métadonnées sémantiques et d'un embedding
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub chunk_index: usize,
    pub content: String,
    /// Offsets byte semi-ouverts dans le flux nettoyé
    pub start_offset: usize,
    pub end_offset: usize,
    pub token_count: usize,
    pub chunker_type: ChunkerKind,
    pub heading_path: Vec<String>,
    pub page_start: Option<u32>,
    pub page_end: Option<u32>,
    pub section_marker: Option<String>,
    pub bboxes: Vec<BoundingBox>,
    pub position_method: MatchMethod,
    pub position_confidence: PositionConfidence,
    pub metadata_overlap_count: usize,
    pub metadata_interpolated: bool,
    pub metadata_confidence: MetadataConfidence,
    #[serde(flatten)]
    pub enrichment: ChunkEnrichment,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    /// Champs inconnus préservés à l'import pour compatibilité ascendante
    #[serde(flatten)]
    pub raw_extra: BTreeMap<String, serde_json::Value>,
}

impl Chunk {
    /// Crée un chunk nu depuis le chunker ; la provenance et l'enrichissement
    /// sont renseignés par les étapes suivantes
    pub fn bare(
        chunk_index: usize,
        content: String,
        start_offset: usize,
        end_offset: usize,
        token_count: usize,
        chunker_type: ChunkerKind,
    ) -> Self {
        Self {
            chunk_index,
            content,
            start_offset,
            end_offset,
            token_count,
            chunker_type,
            heading_path: Vec::new(),
            page_start: None,
            page_end: None,
            section_marker: None,
            bboxes: Vec::new(),
            position_method: MatchMethod::Exact,
            position_confidence: PositionConfidence::Exact,
            metadata_overlap_count: 0,
            metadata_interpolated: false,
            metadata_confidence: MetadataConfidence::Low,
            enrichment: ChunkEnrichment::default(),
            embedding: None,
            raw_extra: BTreeMap::new(),
        }
    }
}

// === Machine à étapes ===

/// Une tentative d'exécution d'une étape pour un document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRecord {
    pub document_id: String,
    pub stage: ProcessingStage,
    pub attempt: usize,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
    pub checkpoint_hash: Option<String>,
    pub error: Option<String>,
    pub retry_count: usize,
}

/// Référence d'unité de travail pour les rapports d'erreurs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitRef {
    Batch(usize),
    Chunk(usize),
}

impl fmt::Display for UnitRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Batch(i) => write!(f, "batch {i}"),
            Self::Chunk(i) => write!(f, "chunk {i}"),
        }
    }
}

/// Erreur par unité, collectée et rapportée en fin d'étape
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitError {
    pub unit: UnitRef,
    pub message: String,
}

/// Rapport d'étape : durée et erreurs d'unités non fatales
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageReport {
    pub stage: String,
    pub duration_ms: u64,
    pub unit_errors: Vec<UnitError>,
}

// === Erreurs ===

/// Erreur du pipeline d'ingestion. Les erreurs par unité (lot, chunk) sont
/// collectées dans les rapports d'étape ; celles-ci remontent à la machine.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("source unreadable: {0}")]
    SourceUnreadable(String),

    #[error("invalid page count: {0}")]
    PageCountInvalid(String),

    #[error("batch {batch_index} failed: {message}")]
    BatchFailed { batch_index: usize, message: String },

    #[error("insufficient content: {got} bytes (floor {floor})")]
    InsufficientContent { got: usize, floor: usize },

    #[error("cleanup failed: {0}")]
    CleanupFailed(String),

    #[error("chunk invariant violated: {0}")]
    ChunkInvariantViolated(String),

    #[error("match monotonicity violation for raw chunk {0}")]
    MatchMonotonicityViolation(usize),

    #[error("enrichment failed for chunk {chunk_index}: {message}")]
    EnrichmentFailed {
        chunk_index: usize,
        message: String,
    },

    #[error("embedding failed: {0}")]
    EmbeddingFailed(String),

    #[error("checkpoint mismatch at stage {0}")]
    CheckpointMismatch(String),

    #[error("review pending: {0}")]
    ReviewPending(ReviewGate),

    #[error("manifest version unsupported: {0}")]
    ManifestVersion(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("model error: {0}")]
    Model(#[from] model::ModelError),

    #[error("embedder error: {0}")]
    Embedder(#[from] embedder::EmbedError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type IngestResult<T> = Result<T, IngestError>;

// === Tests unitaires ===

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_kind_from_path() {
        use std::path::Path;
        assert_eq!(
            SourceKind::from_path(Path::new("livre.PDF")),
            Some(SourceKind::Pdf)
        );
        assert_eq!(
            SourceKind::from_path(Path::new("notes.md")),
            Some(SourceKind::Markdown)
        );
        assert_eq!(SourceKind::from_path(Path::new("archive.zip")), None);
    }

    #[test]
    fn test_chunker_kind_roundtrip() {
        for tag in ["recursive", "semantic", "token", "sentence", "late", "code", "hybrid"] {
            let kind: ChunkerKind = tag.parse().unwrap();
            assert_eq!(kind.to_string(), tag);
        }
        assert!("aleatoire".parse::<ChunkerKind>().is_err());
    }

    #[test]
    fn test_cleaned_markdown_sha_stable() {
        let a = CleanedMarkdown::new("contenu".to_string());
        let b = CleanedMarkdown::new("contenu".to_string());
        assert_eq!(a.sha256, b.sha256);
        assert_eq!(a.sha256.len(), 64);
    }

    #[test]
    fn test_matched_span_overlap() {
        let span = MatchedSpan {
            start: 10,
            end: 20,
            method: MatchMethod::Exact,
            confidence: PositionConfidence::Exact,
            interpolated: false,
        };
        assert!(span.overlaps(15, 25));
        assert!(span.overlaps(0, 11));
        assert!(!span.overlaps(20, 30));

        // Marqueur zero-width : recouvre s'il tombe dans l'intervalle
        let marker = MatchedSpan {
            start: 12,
            end: 12,
            method: MatchMethod::Marker,
            confidence: PositionConfidence::Synthetic,
            interpolated: true,
        };
        assert!(marker.overlaps(10, 20));
        assert!(!marker.overlaps(0, 12));
    }

    #[test]
    fn test_confidence_ordering() {
        assert!(PositionConfidence::Exact > PositionConfidence::High);
        assert!(PositionConfidence::High > PositionConfidence::Medium);
        assert!(PositionConfidence::Medium > PositionConfidence::Synthetic);
    }

    #[test]
    fn test_document_storage_prefix() {
        let doc = Document::new("user1", PathBuf::from("a.pdf"), SourceKind::Pdf);
        assert!(doc.storage_prefix().starts_with("user1/doc_"));
    }

    #[test]
    fn test_chunk_serde_preserves_unknown_fields() {
        let json = serde_json::json!({
            "chunk_index": 0,
            "content": "texte",
            "start_offset": 0,
            "end_offset": 5,
            "token_count": 2,
            "chunker_type": "recursive",
            "heading_path": [],
            "page_start": null,
            "page_end": null,
            "section_marker": null,
            "bboxes": [],
            "position_method": "exact",
            "position_confidence": "exact",
            "metadata_overlap_count": 1,
            "metadata_interpolated": false,
            "metadata_confidence": "high",
            "themes": [],
            "concepts": [],
            "importance": 0.5,
            "champ_futur": {"x": 1}
        });
        let chunk: Chunk = serde_json::from_value(json).unwrap();
        assert!(chunk.raw_extra.contains_key("champ_futur"));
        let back = serde_json::to_value(&chunk).unwrap();
        assert_eq!(back["champ_futur"]["x"], 1);
    }
}
