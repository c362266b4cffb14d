// VELIN Extraction - Contrat extracteur et extracteur par modèle
// Extraction par fenêtres de pages, en parallèle borné, provenance par section

use async_trait::async_trait;
use futures::future::join_all;
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::ingest::extract::batch_planner::{calculate_batch_ranges, BatchConfig};
use crate::ingest::extract::stitcher::StitchedMarkdown;
use crate::ingest::model::{unwrap_markdown_fences, GenerateOptions, ModelClient};
use crate::ingest::{BatchRange, IngestError, IngestResult, RawChunk, SourceKind};

/// Sortie d'un lot : markdown provisoire + chunks bruts avec spans relatifs
/// au markdown du lot
#[derive(Debug, Clone)]
pub struct BatchOutput {
    pub markdown: String,
    pub raw_chunks: Vec<RawChunk>,
}

/// Résultat complet d'un lot, échec compris
#[derive(Debug, Clone)]
pub struct BatchResult {
    pub batch_index: usize,
    pub page_start: u32,
    pub page_end: u32,
    pub markdown: String,
    pub raw_chunks: Vec<RawChunk>,
    pub extraction_ms: u64,
    pub ok: bool,
    pub error: Option<String>,
}

/// Contrat extracteur : toute implémentation produisant du markdown par
/// fenêtre de pages avec provenance convient au pipeline.
#[async_trait]
pub trait Extractor: Send + Sync {
    /// Nombre de pages de la source ; strictement positif
    async fn probe_page_count(&self, source: &Path, kind: SourceKind) -> IngestResult<u32>;

    /// Extrait le markdown et les chunks bruts pour une fenêtre de pages
    async fn extract_batch(
        &self,
        source: &Path,
        kind: SourceKind,
        range: &BatchRange,
    ) -> IngestResult<BatchOutput>;

    /// Version consignée dans `cached_chunks.json`
    fn version(&self) -> String;
}

/// Issue de l'étape d'extraction avant stitching
#[derive(Debug)]
pub struct ExtractionOutcome {
    pub total_pages: u32,
    pub batches: Vec<BatchResult>,
}

impl ExtractionOutcome {
    pub fn ok_markdowns(&self) -> Vec<String> {
        self.batches
            .iter()
            .filter(|b| b.ok)
            .map(|b| b.markdown.clone())
            .collect()
    }

    pub fn failed_count(&self) -> usize {
        self.batches.iter().filter(|b| !b.ok).count()
    }
}

/// Exécute l'extraction complète d'une source : sondage du nombre de pages,
/// fenêtres chevauchantes, lots en parallèle borné, résultats réordonnés par
/// `batch_index`. Un lot en échec n'arrête pas les autres.
pub async fn run_extraction(
    extractor: Arc<dyn Extractor>,
    source: &Path,
    kind: SourceKind,
    config: &BatchConfig,
) -> IngestResult<ExtractionOutcome> {
    let total_pages = extractor.probe_page_count(source, kind).await?;
    if total_pages == 0 {
        return Err(IngestError::PageCountInvalid(
            "probe returned zero pages".to_string(),
        ));
    }

    let ranges = calculate_batch_ranges(total_pages, config.pages_per_batch, config.overlap_pages);
    info!(
        "🚀 Extracting {:?}: {} pages in {} batches",
        source.file_name().unwrap_or_default(),
        total_pages,
        ranges.len()
    );

    let semaphore = Arc::new(Semaphore::new(config.max_concurrent_batches.max(1)));
    let source: PathBuf = source.to_path_buf();
    let floor = config.content_floor_bytes;

    let tasks = ranges.into_iter().map(|range| {
        let extractor = Arc::clone(&extractor);
        let semaphore = Arc::clone(&semaphore);
        let source = source.clone();
        tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
            let started = Instant::now();
            let outcome = extract_one(extractor.as_ref(), &source, kind, &range, floor).await;
            let extraction_ms = started.elapsed().as_millis() as u64;
            match outcome {
                Ok(output) => BatchResult {
                    batch_index: range.batch_index,
                    page_start: range.page_start,
                    page_end: range.page_end,
                    markdown: output.markdown,
                    raw_chunks: output.raw_chunks,
                    extraction_ms,
                    ok: true,
                    error: None,
                },
                Err(err) => {
                    warn!("batch {} failed: {}", range.batch_index, err);
                    BatchResult {
                        batch_index: range.batch_index,
                        page_start: range.page_start,
                        page_end: range.page_end,
                        markdown: String::new(),
                        raw_chunks: Vec::new(),
                        extraction_ms,
                        ok: false,
                        error: Some(err.to_string()),
                    }
                }
            }
        })
    });

    let mut batches: Vec<BatchResult> = join_all(tasks)
        .await
        .into_iter()
        .filter_map(|joined| joined.ok())
        .collect();
    batches.sort_by_key(|b| b.batch_index);

    if batches.iter().all(|b| !b.ok) {
        return Err(IngestError::SourceUnreadable(format!(
            "all {} extraction batches failed",
            batches.len()
        )));
    }

    Ok(ExtractionOutcome {
        total_pages,
        batches,
    })
}

async fn extract_one(
    extractor: &dyn Extractor,
    source: &Path,
    kind: SourceKind,
    range: &BatchRange,
    content_floor: usize,
) -> IngestResult<BatchOutput> {
    let output = extractor
        .extract_batch(source, kind, range)
        .await
        .map_err(|err| IngestError::BatchFailed {
            batch_index: range.batch_index,
            message: err.to_string(),
        })?;

    let got = output.markdown.trim().len();
    if got < content_floor {
        return Err(IngestError::InsufficientContent {
            got,
            floor: content_floor,
        });
    }
    Ok(output)
}

/// Re-base les spans des chunks bruts des lots sur le flux stitché.
/// Les chunks entièrement dédupliqués par le stitching sont écartés ;
/// ceux à cheval sur la coupe sont tronqués à une frontière de caractère.
pub fn rebase_raw_chunks(batches: &[BatchResult], stitched: &StitchedMarkdown) -> Vec<RawChunk> {
    let mut rebased = Vec::new();
    let mut offsets = stitched.batch_offsets.iter();

    for batch in batches.iter().filter(|b| b.ok) {
        let Some(&(kept_at, cut)) = offsets.next() else {
            break;
        };
        for chunk in &batch.raw_chunks {
            let (start, end) = chunk.char_span;
            if end <= cut {
                debug!(
                    "raw chunk [{}..{}) of batch {} absorbed by stitch overlap",
                    start, end, batch.batch_index
                );
                continue;
            }
            let mut chunk = chunk.clone();
            if start < cut {
                let trim = floor_char_boundary(&chunk.content, cut - start);
                chunk.content = chunk.content[trim..].to_string();
                chunk.char_span = (kept_at, kept_at + (end - cut));
            } else {
                chunk.char_span = (kept_at + (start - cut), kept_at + (end - cut));
            }
            rebased.push(chunk);
        }
    }

    rebased.sort_by_key(|c| c.char_span.0);
    rebased
}

fn floor_char_boundary(s: &str, mut idx: usize) -> usize {
    idx = idx.min(s.len());
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

// === Extracteur par modèle ===

/// Configuration de l'extracteur par modèle
#[derive(Debug, Clone)]
pub struct ModelExtractorConfig {
    pub model: String,
    pub temperature: f32,
    /// Taille maximale d'une section avant découpe paragraphe
    pub max_section_chars: usize,
}

impl Default for ModelExtractorConfig {
    fn default() -> Self {
        Self {
            model: "llama3.1:8b".to_string(),
            temperature: 0.0,
            max_section_chars: 6_000,
        }
    }
}

/// Extracteur adossé à un serveur de modèles ayant accès à la source.
/// Les réponses encadrées de fences sont déballées ; les sections du
/// markdown deviennent les chunks bruts avec attribution de pages
/// proportionnelle à la fenêtre du lot.
pub struct ModelExtractor {
    model: Arc<dyn ModelClient>,
    config: ModelExtractorConfig,
}

static HEADING_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^(#{1,6})\s+(.+)$").expect("heading regex"));

impl ModelExtractor {
    pub fn new(model: Arc<dyn ModelClient>, config: ModelExtractorConfig) -> Self {
        Self { model, config }
    }

    fn generate_options(&self) -> GenerateOptions {
        GenerateOptions {
            model: self.config.model.clone(),
            temperature: self.config.temperature,
            max_tokens: None,
        }
    }
}

#[async_trait]
impl Extractor for ModelExtractor {
    async fn probe_page_count(&self, source: &Path, kind: SourceKind) -> IngestResult<u32> {
        match kind {
            SourceKind::Markdown | SourceKind::Text => Ok(1),
            SourceKind::Pdf => {
                // Sondage local d'abord ; le modèle reste autoritaire pour
                // les PDF scannés que lopdf ne parse pas
                if let Ok(doc) = lopdf::Document::load(source) {
                    let pages = doc.get_pages().len() as u32;
                    if pages > 0 {
                        debug!("local page probe: {} pages", pages);
                        return Ok(pages);
                    }
                }
                self.probe_with_model(source).await
            }
            SourceKind::Epub => self.probe_with_model(source).await,
        }
    }

    async fn extract_batch(
        &self,
        source: &Path,
        kind: SourceKind,
        range: &BatchRange,
    ) -> IngestResult<BatchOutput> {
        let markdown = match kind {
            SourceKind::Markdown | SourceKind::Text => tokio::fs::read_to_string(source)
                .await
                .map_err(|e| IngestError::SourceUnreadable(e.to_string()))?,
            SourceKind::Pdf | SourceKind::Epub => {
                let prompt = format!(
                    "Extrais en markdown le contenu du document `{}`, uniquement \
                     pour les pages {} à {} incluses. N'ajoute aucun commentaire, \
                     aucune autre page.",
                    source.display(),
                    range.page_start,
                    range.page_end
                );
                let response = self.model.generate(&prompt, &self.generate_options()).await?;
                unwrap_markdown_fences(&response).to_string()
            }
        };

        let raw_chunks = derive_raw_chunks(&markdown, range, self.config.max_section_chars);
        Ok(BatchOutput {
            markdown,
            raw_chunks,
        })
    }

    fn version(&self) -> String {
        format!("velin-model-extractor/0.1.0 ({})", self.config.model)
    }
}

impl ModelExtractor {
    async fn probe_with_model(&self, source: &Path) -> IngestResult<u32> {
        let prompt = format!(
            "Combien de pages compte le document `{}` ? Réponds uniquement par un entier.",
            source.display()
        );
        let response = self.model.generate(&prompt, &self.generate_options()).await?;
        let digits: String = response.chars().filter(|c| c.is_ascii_digit()).collect();
        let pages: u32 = digits
            .parse()
            .map_err(|_| IngestError::PageCountInvalid(response.trim().to_string()))?;
        if pages == 0 {
            return Err(IngestError::PageCountInvalid("0".to_string()));
        }
        Ok(pages)
    }
}

/// Découpe un markdown de lot en chunks bruts : une section par titre, avec
/// chemin de titres hiérarchique et pages attribuées proportionnellement.
pub fn derive_raw_chunks(markdown: &str, range: &BatchRange, max_section_chars: usize) -> Vec<RawChunk> {
    if markdown.trim().is_empty() {
        return Vec::new();
    }

    // Bornes de sections aux lignes de titres
    let mut cuts: Vec<(usize, usize, String)> = Vec::new(); // (offset, niveau, titre)
    for caps in HEADING_LINE.captures_iter(markdown) {
        let whole = caps.get(0).expect("match 0");
        let level = caps[1].len();
        cuts.push((whole.start(), level, caps[2].trim().to_string()));
    }

    let mut sections: Vec<(usize, usize)> = Vec::new();
    if cuts.first().map_or(true, |(off, _, _)| *off > 0) {
        let end = cuts.first().map_or(markdown.len(), |(off, _, _)| *off);
        sections.push((0, end));
    }
    for (i, (off, _, _)) in cuts.iter().enumerate() {
        let end = cuts.get(i + 1).map_or(markdown.len(), |(next, _, _)| *next);
        sections.push((*off, end));
    }

    // Sections trop longues : découpe supplémentaire aux paragraphes
    let mut spans: Vec<(usize, usize)> = Vec::new();
    for (start, end) in sections {
        if end - start <= max_section_chars {
            spans.push((start, end));
            continue;
        }
        let mut cursor = start;
        while cursor < end {
            let target = (cursor + max_section_chars).min(end);
            let cut = markdown[cursor..target]
                .rfind("\n\n")
                .map(|i| cursor + i + 2)
                .filter(|&c| c > cursor)
                .unwrap_or(target);
            let cut = floor_char_boundary(markdown, cut.max(cursor + 1));
            spans.push((cursor, cut));
            cursor = cut;
        }
    }

    // Chemin de titres courant par niveau
    let mut heading_stack: Vec<(usize, String)> = Vec::new();
    let page_span = (range.page_end - range.page_start) as f64 + 1.0;
    let total = markdown.len().max(1) as f64;

    let mut chunks = Vec::new();
    for (start, end) in spans {
        let content = &markdown[start..end];
        if content.trim().is_empty() {
            continue;
        }

        if let Some(caps) = HEADING_LINE.captures(content) {
            if caps.get(0).map_or(false, |m| m.start() == 0) {
                let level = caps[1].len();
                let title = caps[2].trim().to_string();
                heading_stack.retain(|(l, _)| *l < level);
                heading_stack.push((level, title));
            }
        }

        let page_at = |offset: usize| -> u32 {
            let frac = offset as f64 / total;
            range.page_start + ((frac * page_span) as u32).min(page_span as u32 - 1)
        };

        chunks.push(RawChunk {
            content: content.to_string(),
            page_start: Some(page_at(start)),
            page_end: Some(page_at(end.saturating_sub(1))),
            heading_path: heading_stack.iter().map(|(_, t)| t.clone()).collect(),
            bboxes: Vec::new(),
            char_span: (start, end),
        });
    }

    chunks
}
