// VELIN Core - Pipeline d'ingestion d'un document
// Câble les huit étapes sous la machine : extraction → stitching → nettoyage →
// chunking → matching → transfert → enrichissement → embeddings

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::ingest::core::events::StageEventKind;
use crate::ingest::core::raw_chunk_cache::{CachedRawChunks, RawChunkCache};
use crate::ingest::core::stage_machine::{PhaseResult, StageMachine, StagePhase, PHASES};
use crate::ingest::core::storage::{DocumentStore, Manifest};
use crate::ingest::embedder::TextEmbedder;
use crate::ingest::extract::{
    rebase_raw_chunks, run_extraction, stitch, BatchConfig, Extractor, StitchConfig, StitchReport,
};
use crate::ingest::model::ModelClient;
use crate::ingest::processing::{
    chunk_markdown, sentence_spans, transfer_metadata, BulletproofMatcher, Cleaner, CleanerConfig,
    ChunkerConfig, Enricher, EnricherConfig, MatcherConfig, SemanticContext, TokenCounter,
};
use crate::ingest::{
    Chunk, ChunkerKind, CleanedMarkdown, Document, IngestError, IngestResult, MatchedSpan,
    ProcessingStage, ReviewGate, StageReport, UnitError, UnitRef,
};

/// Configuration d'ensemble du pipeline
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub batch: BatchConfig,
    pub stitch: StitchConfig,
    pub cleaner: CleanerConfig,
    pub chunker: ChunkerConfig,
    pub matcher: MatcherConfig,
    pub enricher: EnricherConfig,
    /// Taille des lots d'embedding
    pub embed_batch_size: usize,
    /// Budget du cache de chunks bruts (bytes)
    pub cache_bytes: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch: BatchConfig::default(),
            stitch: StitchConfig::default(),
            cleaner: CleanerConfig::default(),
            chunker: ChunkerConfig::default(),
            matcher: MatcherConfig::default(),
            enricher: EnricherConfig::default(),
            embed_batch_size: 32,
            cache_bytes: 256 * 1024 * 1024,
        }
    }
}

/// Issue du traitement d'un document
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineOutcome {
    Completed,
    /// En pause sur un point de revue, en attente du signal externe
    PausedForReview(ReviewGate),
    Paused,
    Cancelled,
    Failed(String),
}

/// Contexte explicite du pipeline : tous les collaborateurs sont injectés,
/// aucun singleton
pub struct IngestionPipeline {
    extractor: Arc<dyn Extractor>,
    model: Option<Arc<dyn ModelClient>>,
    embedder: Option<Arc<dyn TextEmbedder>>,
    token_counter: TokenCounter,
    store: DocumentStore,
    cache: Arc<RawChunkCache>,
    config: PipelineConfig,
}

impl IngestionPipeline {
    pub fn new(extractor: Arc<dyn Extractor>, store: DocumentStore, config: PipelineConfig) -> Self {
        let cache = Arc::new(RawChunkCache::new(config.cache_bytes));
        let token_counter = TokenCounter::heuristic(config.chunker.chars_per_token);
        Self {
            extractor,
            model: None,
            embedder: None,
            token_counter,
            store,
            cache,
            config,
        }
    }

    pub fn with_model(mut self, model: Arc<dyn ModelClient>) -> Self {
        self.model = Some(model);
        self
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn TextEmbedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    /// Impose le compteur de tokens (celui du tokenizer de l'embedder)
    pub fn with_token_counter(mut self, counter: TokenCounter) -> Self {
        self.token_counter = counter;
        self
    }

    pub fn store(&self) -> &DocumentStore {
        &self.store
    }

    /// Retraite un document terminé avec une nouvelle stratégie de chunking :
    /// l'extraction est sautée grâce au cache, l'ancien jeu de chunks est
    /// remplacé atomiquement à la complétion
    pub async fn reprocess(
        &self,
        document: &mut Document,
        machine: &mut StageMachine,
        chunker_kind: ChunkerKind,
    ) -> IngestResult<PipelineOutcome> {
        info!("♻️ reprocessing {} with {} chunker", document.id, chunker_kind);
        document.chunker_kind = chunker_kind;
        document.processing_stage = ProcessingStage::Cleaned;
        self.process(document, machine, true).await
    }

    /// Traite un document jusqu'à complétion, pause, revue ou échec.
    /// En reprise, les étapes dont le checkpoint correspond sont sautées
    /// et leurs artefacts rechargés depuis le stockage.
    pub async fn process(
        &self,
        document: &mut Document,
        machine: &mut StageMachine,
        resume: bool,
    ) -> IngestResult<PipelineOutcome> {
        let mut manifest = if resume && self.store.has_manifest(document).await {
            match self.store.read_manifest(document).await {
                Ok(manifest) => {
                    machine.load_checkpoints(&manifest.checkpoints);
                    manifest
                }
                Err(IngestError::ManifestVersion(version)) => {
                    return Err(IngestError::ManifestVersion(version));
                }
                Err(err) => {
                    warn!("manifest unreadable ({err}), starting from a clean manifest");
                    Manifest::new(self.extractor.version(), document.unicode_normalization)
                }
            }
        } else {
            Manifest::new(self.extractor.version(), document.unicode_normalization)
        };

        if document.paused_at.is_some() && document.resumed_at.is_none() {
            machine.resume(document);
        }

        // === Extraction + stitching ===
        let extract_hash = self.extract_input_hash(document).await;
        let (cached, mut raw_markdown, stitch_reports) = match self
            .extract_stage(document, machine, &mut manifest, &extract_hash, resume)
            .await?
        {
            StageFlow::Value(value) => value,
            StageFlow::Exit(outcome) => {
                return self.finish_early(document, machine, &mut manifest, outcome).await
            }
        };
        manifest.stitch_reports = stitch_reports;

        if let Some(gate) = machine.review_required(document, StagePhase::Extract) {
            machine.set_review_pending(document, gate);
            self.persist_state(document, machine, &mut manifest).await?;
            return Ok(PipelineOutcome::PausedForReview(gate));
        }

        // === Nettoyage ===
        let clean_hash = StageMachine::checkpoint_hash(&[raw_markdown.as_bytes()]);
        let cleaned = match self
            .clean_stage(document, machine, &clean_hash, &raw_markdown)
            .await?
        {
            StageFlow::Value(value) => value,
            StageFlow::Exit(outcome) => {
                return self.finish_early(document, machine, &mut manifest, outcome).await
            }
        };
        raw_markdown.clear();
        document.word_count = Some(cleaned.text.split_whitespace().count());

        // === Chunking ===
        let chunk_hash = StageMachine::checkpoint_hash(&[
            cleaned.sha256.as_bytes(),
            document.chunker_kind.to_string().as_bytes(),
        ]);
        let mut chunks = match self
            .chunk_stage(document, machine, &chunk_hash, &cleaned)
            .await?
        {
            StageFlow::Value(value) => value,
            StageFlow::Exit(outcome) => {
                return self.finish_early(document, machine, &mut manifest, outcome).await
            }
        };

        if let Some(gate) = machine.review_required(document, StagePhase::Chunk) {
            machine.set_review_pending(document, gate);
            self.persist_state(document, machine, &mut manifest).await?;
            return Ok(PipelineOutcome::PausedForReview(gate));
        }

        // === Matching + transfert de métadonnées ===
        let match_hash = StageMachine::checkpoint_hash(&[
            cleaned.sha256.as_bytes(),
            extract_hash.as_bytes(),
            chunk_hash.as_bytes(),
        ]);
        chunks = match self
            .match_stage(document, machine, &match_hash, &cleaned, &cached, chunks)
            .await?
        {
            StageFlow::Value(value) => value,
            StageFlow::Exit(outcome) => {
                return self.finish_early(document, machine, &mut manifest, outcome).await
            }
        };

        // === Enrichissement ===
        chunks = match self
            .enrich_stage(document, machine, &match_hash, chunks, &mut manifest)
            .await?
        {
            StageFlow::Value(value) => value,
            StageFlow::Exit(outcome) => {
                return self.finish_early(document, machine, &mut manifest, outcome).await
            }
        };

        // === Embeddings ===
        chunks = match self
            .embed_stage(document, machine, &match_hash, chunks)
            .await?
        {
            StageFlow::Value(value) => value,
            StageFlow::Exit(outcome) => {
                return self.finish_early(document, machine, &mut manifest, outcome).await
            }
        };

        // === Complétion : exports canoniques ===
        self.store.write_chunks(document, &chunks).await?;
        document.current_chunk_set = Some(format!("cs_{}", uuid::Uuid::new_v4().simple()));
        document.processing_stage = ProcessingStage::Completed;
        document.updated_at = chrono::Utc::now();
        self.persist_state(document, machine, &mut manifest).await?;
        machine.events().publish(
            &document.id,
            ProcessingStage::Completed,
            StageEventKind::Completed,
        );
        info!(
            "✅ {} completed: {} chunks, {} words",
            document.id,
            chunks.len(),
            document.word_count.unwrap_or(0)
        );
        Ok(PipelineOutcome::Completed)
    }

    // === Étapes ===

    async fn extract_stage(
        &self,
        document: &mut Document,
        machine: &mut StageMachine,
        manifest: &mut Manifest,
        input_hash: &str,
        resume: bool,
    ) -> IngestResult<StageFlow<(Arc<CachedRawChunks>, String, Vec<StitchReport>)>> {
        // Reprise : artefacts rechargés si le checkpoint correspond
        if resume
            && phase_done(document.processing_stage, StagePhase::Extract)
            && machine.checkpoint_matches(StagePhase::Extract, input_hash)
        {
            if let Some(loaded) = self.load_extract_artifacts(document).await {
                debug!("extract stage skipped (checkpoint match)");
                return Ok(StageFlow::Value((
                    loaded.0,
                    loaded.1,
                    manifest.stitch_reports.clone(),
                )));
            }
            warn!("extract artifacts missing, re-extracting");
        } else if resume && phase_done(document.processing_stage, StagePhase::Extract) {
            warn!("checkpoint mismatch at extract, resuming from extraction");
            document.processing_stage = ProcessingStage::Queued;
        }

        let extractor = Arc::clone(&self.extractor);
        let source = document.source_path.clone();
        let kind = document.source_kind;
        let batch_config = self.config.batch.clone();
        let stitch_config = self.config.stitch.clone();
        let version = self.extractor.version();

        let result = machine
            .execute(document, StagePhase::Extract, input_hash, || {
                let extractor = Arc::clone(&extractor);
                let source = source.clone();
                let batch_config = batch_config.clone();
                let stitch_config = stitch_config.clone();
                let version = version.clone();
                async move {
                    let outcome = run_extraction(extractor, &source, kind, &batch_config).await?;
                    let markdowns = outcome.ok_markdowns();
                    let stitched = stitch(&markdowns, &stitch_config);
                    let raw_chunks = rebase_raw_chunks(&outcome.batches, &stitched);
                    let unit_errors: Vec<UnitError> = outcome
                        .batches
                        .iter()
                        .filter(|b| !b.ok)
                        .map(|b| UnitError {
                            unit: UnitRef::Batch(b.batch_index),
                            message: b.error.clone().unwrap_or_default(),
                        })
                        .collect();
                    let cached = CachedRawChunks {
                        raw_chunks,
                        extractor_version: version,
                        total_pages: outcome.total_pages,
                        raw_stream_len: stitched.text.len(),
                    };
                    Ok((cached, stitched, unit_errors))
                }
            })
            .await;

        let (cached, stitched, unit_errors) = match result {
            PhaseResult::Done(value) => value,
            PhaseResult::Paused => return Ok(StageFlow::Exit(PipelineOutcome::Paused)),
            PhaseResult::Cancelled => return Ok(StageFlow::Exit(PipelineOutcome::Cancelled)),
            PhaseResult::Failed(message) => {
                return Ok(StageFlow::Exit(PipelineOutcome::Failed(message)));
            }
        };

        if !unit_errors.is_empty() {
            manifest.stage_reports.push(StageReport {
                stage: StagePhase::Extract.label().to_string(),
                duration_ms: 0,
                unit_errors,
            });
        }

        // Persistance : source, markdown provisoire, cache des chunks bruts
        let source_file = self.store.write_source(document).await?;
        let content_file = self.store.write_content(document, &stitched.text).await?;
        let cached_file = self.store.write_cached_chunks(document, &cached).await?;
        for file in [source_file, content_file, cached_file] {
            if !manifest.files.contains(&file) {
                manifest.files.push(file);
            }
        }
        document.markdown_path = Some("content.md".to_string());
        self.cache.insert(&document.id, cached.clone());

        Ok(StageFlow::Value((
            Arc::new(cached),
            stitched.text,
            stitched.reports,
        )))
    }

    async fn load_extract_artifacts(
        &self,
        document: &Document,
    ) -> Option<(Arc<CachedRawChunks>, String)> {
        let cached = match self.cache.get(&document.id) {
            Some(cached) => cached,
            None => Arc::new(self.store.read_cached_chunks(document).await.ok()?),
        };
        // Avant nettoyage, content.md porte encore le markdown stitché ;
        // après, il n'est plus nécessaire comme entrée du cleaner
        let raw_markdown = if phase_done(document.processing_stage, StagePhase::Clean) {
            String::new()
        } else {
            self.store.read_content(document).await.ok()?
        };
        Some((cached, raw_markdown))
    }

    async fn clean_stage(
        &self,
        document: &mut Document,
        machine: &mut StageMachine,
        input_hash: &str,
        raw_markdown: &str,
    ) -> IngestResult<StageFlow<CleanedMarkdown>> {
        if phase_done(document.processing_stage, StagePhase::Clean) {
            if machine.checkpoint_matches(StagePhase::Clean, input_hash)
                || raw_markdown.is_empty()
            {
                if let Ok(text) = self.store.read_content(document).await {
                    debug!("clean stage skipped, cleaned stream reloaded");
                    return Ok(StageFlow::Value(CleanedMarkdown::new(text)));
                }
            }
            warn!("checkpoint mismatch at clean, re-cleaning");
        }

        let cleaner = Cleaner::new(
            self.model.clone().filter(|_| self.config.cleaner.use_model),
            CleanerConfig {
                unicode_normalization: document.unicode_normalization,
                ..self.config.cleaner.clone()
            },
        );

        let result = machine
            .execute(document, StagePhase::Clean, input_hash, || {
                let cleaner = &cleaner;
                async move { cleaner.clean(raw_markdown).await }
            })
            .await;

        let cleaned = match result {
            PhaseResult::Done(value) => value,
            PhaseResult::Paused => return Ok(StageFlow::Exit(PipelineOutcome::Paused)),
            PhaseResult::Cancelled => return Ok(StageFlow::Exit(PipelineOutcome::Cancelled)),
            PhaseResult::Failed(message) => {
                return Ok(StageFlow::Exit(PipelineOutcome::Failed(message)))
            }
        };

        // Le flux nettoyé devient le content.md de référence
        self.store.write_content(document, &cleaned.text).await?;
        Ok(StageFlow::Value(cleaned))
    }

    async fn chunk_stage(
        &self,
        document: &mut Document,
        machine: &mut StageMachine,
        input_hash: &str,
        cleaned: &CleanedMarkdown,
    ) -> IngestResult<StageFlow<Vec<Chunk>>> {
        if phase_done(document.processing_stage, StagePhase::Chunk)
            && machine.checkpoint_matches(StagePhase::Chunk, input_hash)
        {
            if let Ok(chunks) = self.store.read_chunks(document).await {
                debug!("chunk stage skipped, {} chunks reloaded", chunks.len());
                return Ok(StageFlow::Value(chunks));
            }
        }

        let chunker_config = ChunkerConfig {
            strategy: document.chunker_kind,
            ..self.config.chunker.clone()
        };
        let counter = self.token_counter.clone();
        let embedder = self.embedder.clone();
        let text = cleaned.text.clone();

        let result = machine
            .execute(document, StagePhase::Chunk, input_hash, || {
                let chunker_config = chunker_config.clone();
                let counter = counter.clone();
                let embedder = embedder.clone();
                let text = text.clone();
                async move {
                    let semantic = match (&embedder, chunker_config.strategy) {
                        (Some(embedder), ChunkerKind::Semantic) => {
                            build_semantic_context(&text, embedder.as_ref())
                        }
                        _ => None,
                    };
                    chunk_markdown(&text, &chunker_config, &counter, semantic.as_ref())
                }
            })
            .await;

        let chunks = match result {
            PhaseResult::Done(value) => value,
            PhaseResult::Paused => return Ok(StageFlow::Exit(PipelineOutcome::Paused)),
            PhaseResult::Cancelled => return Ok(StageFlow::Exit(PipelineOutcome::Cancelled)),
            PhaseResult::Failed(message) => {
                return Ok(StageFlow::Exit(PipelineOutcome::Failed(message)))
            }
        };

        // Persisté dès maintenant pour la reprise et la revue des chunks
        self.store.write_chunks(document, &chunks).await?;
        Ok(StageFlow::Value(chunks))
    }

    async fn match_stage(
        &self,
        document: &mut Document,
        machine: &mut StageMachine,
        input_hash: &str,
        cleaned: &CleanedMarkdown,
        cached: &Arc<CachedRawChunks>,
        chunks: Vec<Chunk>,
    ) -> IngestResult<StageFlow<Vec<Chunk>>> {
        if phase_done(document.processing_stage, StagePhase::Match)
            && machine.checkpoint_matches(StagePhase::Match, input_hash)
        {
            if let Ok(chunks) = self.store.read_chunks(document).await {
                debug!("match stage skipped, metadata already transferred");
                return Ok(StageFlow::Value(chunks));
            }
        }

        let kind = document.source_kind;
        let matcher_config = self.config.matcher.clone();
        let embedder = self.embedder.clone();
        let model = self.model.clone();
        let cleaned_text = cleaned.text.clone();
        let cached = Arc::clone(cached);
        let chunks_in = chunks;

        let result = machine
            .execute(document, StagePhase::Match, input_hash, || {
                let matcher_config = matcher_config.clone();
                let embedder = embedder.clone();
                let model = model.clone();
                let cleaned_text = cleaned_text.clone();
                let cached = Arc::clone(&cached);
                let mut chunks = chunks_in.clone();
                async move {
                    let mut matcher = BulletproofMatcher::new(
                        &cleaned_text,
                        cached.raw_stream_len,
                        matcher_config.clone(),
                    );
                    if let Some(embedder) = embedder {
                        matcher = matcher.with_embedder(embedder)?;
                    }
                    if let Some(model) = model {
                        matcher = matcher.with_model(model);
                    }
                    let spans: Vec<MatchedSpan> = matcher.match_all(&cached.raw_chunks).await;
                    debug_assert_eq!(spans.len(), cached.raw_chunks.len());

                    transfer_metadata(
                        &mut chunks,
                        &cached.raw_chunks,
                        &spans,
                        kind,
                        &matcher_config,
                    );
                    Ok(chunks)
                }
            })
            .await;

        let chunks = match result {
            PhaseResult::Done(value) => value,
            PhaseResult::Paused => return Ok(StageFlow::Exit(PipelineOutcome::Paused)),
            PhaseResult::Cancelled => return Ok(StageFlow::Exit(PipelineOutcome::Cancelled)),
            PhaseResult::Failed(message) => {
                return Ok(StageFlow::Exit(PipelineOutcome::Failed(message)))
            }
        };

        self.store.write_chunks(document, &chunks).await?;
        Ok(StageFlow::Value(chunks))
    }

    async fn enrich_stage(
        &self,
        document: &mut Document,
        machine: &mut StageMachine,
        input_hash: &str,
        chunks: Vec<Chunk>,
        manifest: &mut Manifest,
    ) -> IngestResult<StageFlow<Vec<Chunk>>> {
        let Some(model) = self.model.clone() else {
            // Pas de modèle : métadonnées vides, l'étape reste traversée
            debug!("no model client, enrichment left empty");
            let mut doc_chunks = chunks;
            let result = machine
                .execute(document, StagePhase::Enrich, input_hash, || async { Ok(()) })
                .await;
            return Ok(match result {
                PhaseResult::Done(()) => StageFlow::Value(std::mem::take(&mut doc_chunks)),
                PhaseResult::Paused => StageFlow::Exit(PipelineOutcome::Paused),
                PhaseResult::Cancelled => StageFlow::Exit(PipelineOutcome::Cancelled),
                PhaseResult::Failed(message) => StageFlow::Exit(PipelineOutcome::Failed(message)),
            });
        };

        let enricher = Enricher::new(model, self.config.enricher.clone());
        let chunks_in = chunks;

        let result = machine
            .execute(document, StagePhase::Enrich, input_hash, || {
                let enricher = &enricher;
                let mut chunks = chunks_in.clone();
                async move {
                    let errors = enricher.enrich_all(&mut chunks).await;
                    Ok((chunks, errors))
                }
            })
            .await;

        let (chunks, errors) = match result {
            PhaseResult::Done(value) => value,
            PhaseResult::Paused => return Ok(StageFlow::Exit(PipelineOutcome::Paused)),
            PhaseResult::Cancelled => return Ok(StageFlow::Exit(PipelineOutcome::Cancelled)),
            PhaseResult::Failed(message) => {
                return Ok(StageFlow::Exit(PipelineOutcome::Failed(message)))
            }
        };

        if !errors.is_empty() {
            manifest.stage_reports.push(StageReport {
                stage: StagePhase::Enrich.label().to_string(),
                duration_ms: 0,
                unit_errors: errors,
            });
        }
        self.store.write_chunks(document, &chunks).await?;
        Ok(StageFlow::Value(chunks))
    }

    async fn embed_stage(
        &self,
        document: &mut Document,
        machine: &mut StageMachine,
        input_hash: &str,
        chunks: Vec<Chunk>,
    ) -> IngestResult<StageFlow<Vec<Chunk>>> {
        let Some(embedder) = self.embedder.clone() else {
            debug!("no embedder, embedding stage traversed empty");
            let result = machine
                .execute(document, StagePhase::Embed, input_hash, || async { Ok(()) })
                .await;
            return Ok(match result {
                PhaseResult::Done(()) => StageFlow::Value(chunks),
                PhaseResult::Paused => StageFlow::Exit(PipelineOutcome::Paused),
                PhaseResult::Cancelled => StageFlow::Exit(PipelineOutcome::Cancelled),
                PhaseResult::Failed(message) => StageFlow::Exit(PipelineOutcome::Failed(message)),
            });
        };

        let batch_size = self.config.embed_batch_size.max(1);
        let chunks_in = chunks;
        let cancel = machine.cancellation();
        let events = machine.events().clone();
        let document_id = document.id.clone();

        let result = machine
            .execute(document, StagePhase::Embed, input_hash, || {
                let embedder = Arc::clone(&embedder);
                let mut chunks = chunks_in.clone();
                let cancel = cancel.clone();
                let events = events.clone();
                let document_id = document_id.clone();
                async move {
                    let total = chunks.len().max(1);
                    let mut done = 0usize;
                    for group in chunks.chunks_mut(batch_size) {
                        if cancel.is_cancelled() {
                            return Err(IngestError::Cancelled);
                        }
                        let texts: Vec<String> =
                            group.iter().map(|c| c.content.clone()).collect();
                        let vectors = embedder
                            .embed_batch(&texts)
                            .map_err(|e| IngestError::EmbeddingFailed(e.to_string()))?;
                        for (chunk, vector) in group.iter_mut().zip(vectors) {
                            chunk.embedding = Some(vector);
                        }
                        done += group.len();
                        events.publish(
                            &document_id,
                            ProcessingStage::Embedding,
                            StageEventKind::Progress {
                                pct: done as f32 * 100.0 / total as f32,
                            },
                        );
                    }
                    Ok(chunks)
                }
            })
            .await;

        Ok(match result {
            PhaseResult::Done(value) => StageFlow::Value(value),
            PhaseResult::Paused => StageFlow::Exit(PipelineOutcome::Paused),
            PhaseResult::Cancelled => StageFlow::Exit(PipelineOutcome::Cancelled),
            PhaseResult::Failed(message) => StageFlow::Exit(PipelineOutcome::Failed(message)),
        })
    }

    // === Utilitaires ===

    async fn extract_input_hash(&self, document: &Document) -> String {
        let source_len = tokio::fs::metadata(&document.source_path)
            .await
            .map(|m| m.len())
            .unwrap_or(0);
        StageMachine::checkpoint_hash(&[
            document.source_path.to_string_lossy().as_bytes(),
            source_len.to_string().as_bytes(),
            self.extractor.version().as_bytes(),
            self.config.batch.pages_per_batch.to_string().as_bytes(),
            self.config.batch.overlap_pages.to_string().as_bytes(),
        ])
    }

    /// Sortie anticipée : l'état (checkpoints, enregistrements) est préservé
    /// pour la reprise, y compris après un échec d'étape
    async fn finish_early(
        &self,
        document: &mut Document,
        machine: &StageMachine,
        manifest: &mut Manifest,
        outcome: PipelineOutcome,
    ) -> IngestResult<PipelineOutcome> {
        if matches!(
            outcome,
            PipelineOutcome::Failed(_) | PipelineOutcome::Paused
        ) {
            self.persist_state(document, machine, manifest).await?;
        }
        Ok(outcome)
    }

    async fn persist_state(
        &self,
        document: &Document,
        machine: &StageMachine,
        manifest: &mut Manifest,
    ) -> IngestResult<()> {
        manifest.checkpoints = machine.export_checkpoints();
        manifest.stage_records = machine.records().to_vec();
        manifest.processing_ms = machine.timings_ms().clone();
        for file in ["metadata.json", "manifest.json", "chunks.json", "content.md"] {
            let path = format!("{}/{}", document.storage_prefix(), file);
            let listed = manifest.files.contains(&file.to_string());
            if !listed && (file == "metadata.json" || file == "manifest.json"
                || self.store.storage().exists(&path).await)
            {
                manifest.files.push(file.to_string());
            }
        }
        self.store.write_metadata(document).await?;
        self.store.write_manifest(document, manifest).await?;
        Ok(())
    }
}

/// Valeur produite par une étape, ou sortie anticipée du pipeline
enum StageFlow<T> {
    Value(T),
    Exit(PipelineOutcome),
}

/// Contexte sémantique : phrases du flux nettoyé embedées une fois
fn build_semantic_context(text: &str, embedder: &dyn TextEmbedder) -> Option<SemanticContext> {
    let spans = sentence_spans(text);
    let texts: Vec<String> = spans.iter().map(|r| text[r.clone()].to_string()).collect();
    match embedder.embed_batch(&texts) {
        Ok(embeddings) => Some(SemanticContext {
            sentence_spans: spans,
            embeddings,
        }),
        Err(err) => {
            warn!("semantic context unavailable ({err}), recursive fallback");
            None
        }
    }
}

/// La phase est-elle déjà complétée pour un document dans cet état ?
fn phase_done(stage: ProcessingStage, phase: StagePhase) -> bool {
    if stage == ProcessingStage::Failed {
        return false;
    }
    let phase_pos = PHASES.iter().position(|p| *p == phase).expect("known phase");
    match StagePhase::next_for(stage) {
        None => true,
        Some(next) => {
            let next_pos = PHASES.iter().position(|p| *p == next).expect("known phase");
            phase_pos < next_pos
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::path::Path;
    use tempfile::TempDir;

    use crate::ingest::core::stage_machine::StageMachineConfig;
    use crate::ingest::core::storage::FsStorage;
    use crate::ingest::embedder::EmbedError;
    use crate::ingest::extract::{derive_raw_chunks, BatchOutput};
    use crate::ingest::{BatchRange, EventBus, PositionConfidence, SourceKind};

    /// Extracteur de test : deux lots chevauchants, déterministes
    struct FakeExtractor;

    const BATCH_0: &str = "# Chapitre Un\n\nLe premier chapitre contient un texte initial assez long pour produire des chunks. Chaque phrase ajoute de la matière utile.\n\n## Transition\n\nzone de recouvrement partagée entre les deux lots du document";
    const BATCH_1: &str = "zone de recouvrement partagée entre les deux lots du document\n\n# Chapitre Deux\n\nLe second chapitre poursuit le texte avec d'autres paragraphes. La conclusion arrive après quelques phrases supplémentaires.";

    #[async_trait]
    impl Extractor for FakeExtractor {
        async fn probe_page_count(&self, _source: &Path, _kind: SourceKind) -> IngestResult<u32> {
            Ok(150)
        }

        async fn extract_batch(
            &self,
            _source: &Path,
            _kind: SourceKind,
            range: &BatchRange,
        ) -> IngestResult<BatchOutput> {
            let markdown = match range.batch_index {
                0 => BATCH_0.to_string(),
                _ => BATCH_1.to_string(),
            };
            let raw_chunks = derive_raw_chunks(&markdown, range, 6_000);
            Ok(BatchOutput {
                markdown,
                raw_chunks,
            })
        }

        fn version(&self) -> String {
            "fake-extractor/1".to_string()
        }
    }

    /// Embedder déterministe par histogramme de bytes
    struct HashEmbedder;

    impl TextEmbedder for HashEmbedder {
        fn embed_text(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
            let mut v = vec![0.0f32; 16];
            for byte in text.bytes() {
                v[(byte % 16) as usize] += 1.0;
            }
            crate::ingest::embedder::l2_normalize(&mut v);
            Ok(v)
        }

        fn dimension(&self) -> usize {
            16
        }
    }

    fn pipeline(dir: &TempDir) -> IngestionPipeline {
        let store = DocumentStore::new(Arc::new(FsStorage::new(dir.path().to_path_buf())));
        let config = PipelineConfig {
            cleaner: CleanerConfig {
                use_model: false,
                ..CleanerConfig::default()
            },
            ..PipelineConfig::default()
        };
        IngestionPipeline::new(Arc::new(FakeExtractor), store, config)
            .with_embedder(Arc::new(HashEmbedder))
    }

    fn machine(review: bool) -> StageMachine {
        StageMachine::new(
            StageMachineConfig {
                review_enabled: review,
                retry_base_delay: std::time::Duration::from_millis(1),
                ..StageMachineConfig::default()
            },
            EventBus::default(),
        )
    }

    async fn fixture_document(dir: &TempDir) -> Document {
        let source = dir.path().join("livre.pdf");
        tokio::fs::write(&source, b"%PDF-fixture").await.unwrap();
        Document::new("user1", source, SourceKind::Pdf)
    }

    #[tokio::test]
    async fn test_full_pipeline_without_reviews() {
        let dir = TempDir::new().unwrap();
        let pipeline = pipeline(&dir);
        let mut machine = machine(false);
        let mut doc = fixture_document(&dir).await;

        let outcome = pipeline.process(&mut doc, &mut machine, false).await.unwrap();
        assert_eq!(outcome, PipelineOutcome::Completed);
        assert_eq!(doc.processing_stage, ProcessingStage::Completed);
        assert!(doc.word_count.unwrap() > 10);
        assert_eq!(doc.markdown_path.as_deref(), Some("content.md"));

        // Invariants sur les chunks exportés
        let chunks = pipeline.store().read_chunks(&doc).await.unwrap();
        assert!(!chunks.is_empty());
        let cleaned = pipeline.store().read_content(&doc).await.unwrap();
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.chunk_index, i);
            assert_eq!(
                cleaned[chunk.start_offset..chunk.end_offset].trim(),
                chunk.content.trim()
            );
            // PDF : jamais de page nulle
            assert!(chunk.page_start.is_some());
            assert!(chunk.metadata_overlap_count > 0 || chunk.metadata_interpolated);
        }
        for pair in chunks.windows(2) {
            assert!(pair[0].end_offset <= pair[1].start_offset);
        }

        // Zone de recouvrement dédupliquée par le stitcher
        assert_eq!(cleaned.matches("zone de recouvrement partagée").count(), 1);

        // Manifest versionné avec checkpoints
        let manifest = pipeline.store().read_manifest(&doc).await.unwrap();
        assert_eq!(manifest.version, crate::ingest::MANIFEST_VERSION);
        assert!(!manifest.checkpoints.is_empty());
        assert!(!manifest.stitch_reports.is_empty());
    }

    #[tokio::test]
    async fn test_review_checkpoints_pause_then_resume() {
        let dir = TempDir::new().unwrap();
        let pipeline = pipeline(&dir);
        let mut machine = machine(true);
        let mut doc = fixture_document(&dir).await;

        // Premier passage : pause à la revue d'extraction
        let outcome = pipeline.process(&mut doc, &mut machine, false).await.unwrap();
        assert_eq!(outcome, PipelineOutcome::PausedForReview(ReviewGate::Extraction));
        assert_eq!(doc.review_pending, Some(ReviewGate::Extraction));
        assert_eq!(doc.processing_stage, ProcessingStage::Extracted);

        // Approbation puis reprise : pause à la revue des chunks
        machine.approve_review(&mut doc, ReviewGate::Extraction);
        let outcome = pipeline.process(&mut doc, &mut machine, true).await.unwrap();
        assert_eq!(outcome, PipelineOutcome::PausedForReview(ReviewGate::Chunks));

        // Approbation finale : complétion
        machine.approve_review(&mut doc, ReviewGate::Chunks);
        let outcome = pipeline.process(&mut doc, &mut machine, true).await.unwrap();
        assert_eq!(outcome, PipelineOutcome::Completed);
    }

    #[tokio::test]
    async fn test_embeddings_present_and_stripped_from_export() {
        let dir = TempDir::new().unwrap();
        let pipeline = pipeline(&dir);
        let mut machine = machine(false);
        let mut doc = fixture_document(&dir).await;
        pipeline.process(&mut doc, &mut machine, false).await.unwrap();

        // chunks.json ne contient pas d'embedding (régénérable)
        let bytes = pipeline
            .store()
            .storage()
            .download(&format!("{}/chunks.json", doc.storage_prefix()))
            .await
            .unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(!text.contains("\"embedding\""));
    }

    #[tokio::test]
    async fn test_export_byte_stable_on_reprocess_resume() {
        let dir = TempDir::new().unwrap();
        let pipeline = pipeline(&dir);
        let mut machine = machine(false);
        let mut doc = fixture_document(&dir).await;
        pipeline.process(&mut doc, &mut machine, false).await.unwrap();

        let path = format!("{}/chunks.json", doc.storage_prefix());
        let first = pipeline.store().storage().download(&path).await.unwrap();

        // Reprise complète : mêmes entrées, export byte-à-byte identique
        let mut machine2 = machine_like();
        let outcome = pipeline.process(&mut doc, &mut machine2, true).await.unwrap();
        assert_eq!(outcome, PipelineOutcome::Completed);
        let second = pipeline.store().storage().download(&path).await.unwrap();
        assert_eq!(first, second);
    }

    fn machine_like() -> StageMachine {
        machine(false)
    }

    #[tokio::test]
    async fn test_reprocess_with_other_chunker_skips_extraction() {
        let dir = TempDir::new().unwrap();
        let pipeline = pipeline(&dir);
        let mut machine = machine(false);
        let mut doc = fixture_document(&dir).await;
        pipeline.process(&mut doc, &mut machine, false).await.unwrap();

        let mut machine2 = machine_like();
        let outcome = pipeline
            .reprocess(&mut doc, &mut machine2, ChunkerKind::Sentence)
            .await
            .unwrap();
        assert_eq!(outcome, PipelineOutcome::Completed);

        let chunks = pipeline.store().read_chunks(&doc).await.unwrap();
        assert!(chunks.iter().all(|c| c.chunker_type == ChunkerKind::Sentence));
        // La provenance reste posée après retraitement
        assert!(chunks.iter().all(|c| c.page_start.is_some()));
    }

    #[tokio::test]
    async fn test_matcher_positions_confident_on_unchanged_text() {
        // Sans nettoyage modèle, le texte change peu : les spans exacts dominent
        let dir = TempDir::new().unwrap();
        let pipeline = pipeline(&dir);
        let mut machine = machine(false);
        let mut doc = fixture_document(&dir).await;
        pipeline.process(&mut doc, &mut machine, false).await.unwrap();

        let chunks = pipeline.store().read_chunks(&doc).await.unwrap();
        assert!(chunks
            .iter()
            .any(|c| c.position_confidence == PositionConfidence::Exact));
    }
}
