// VELIN Traitement - Chunking sémantique du flux nettoyé
// Sept stratégies, toutes fidèles aux offsets du markdown nettoyé

use once_cell::sync::Lazy;
use regex::Regex;
use std::ops::Range;
use std::sync::Arc;
use tokenizers::Tokenizer;
use tracing::{debug, warn};

use crate::ingest::text::cosine_similarity;
use crate::ingest::{Chunk, ChunkerKind, IngestError, IngestResult};

/// Configuration du chunker
#[derive(Debug, Clone)]
pub struct ChunkerConfig {
    pub strategy: ChunkerKind,
    /// Taille cible en tokens
    pub target_tokens: usize,
    /// Taille minimale avant fusion avec le voisin
    pub min_tokens: usize,
    /// Taille maximale avant découpe forcée
    pub max_tokens: usize,
    /// Facteur de conversion approximatif chars → tokens (heuristique)
    pub chars_per_token: f32,
    /// Seuil de rupture sémantique (cosinus) pour la stratégie `semantic`
    pub semantic_boundary_threshold: f32,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            strategy: ChunkerKind::Recursive,
            target_tokens: 500,
            min_tokens: 50,
            max_tokens: 800,
            chars_per_token: 4.0,
            semantic_boundary_threshold: 0.75,
        }
    }
}

/// Compteur de tokens : le tokenizer du modèle d'embedding quand il est
/// chargé, l'heuristique chars/token sinon. L'identité tokenizer/embedder
/// est imposée par le pipeline.
#[derive(Clone)]
pub enum TokenCounter {
    Heuristic { chars_per_token: f32 },
    Tokenizer(Arc<Tokenizer>),
}

impl TokenCounter {
    pub fn heuristic(chars_per_token: f32) -> Self {
        Self::Heuristic { chars_per_token }
    }

    pub fn count(&self, text: &str) -> usize {
        match self {
            Self::Heuristic { chars_per_token } => {
                (text.chars().count() as f32 / chars_per_token).ceil() as usize
            }
            Self::Tokenizer(tokenizer) => tokenizer
                .encode(text, false)
                .map(|enc| enc.get_ids().len())
                .unwrap_or_else(|_| (text.chars().count() as f32 / 4.0).ceil() as usize),
        }
    }
}

impl std::fmt::Debug for TokenCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Heuristic { chars_per_token } => {
                write!(f, "TokenCounter::Heuristic({chars_per_token})")
            }
            Self::Tokenizer(_) => write!(f, "TokenCounter::Tokenizer"),
        }
    }
}

/// Contexte pré-calculé pour la stratégie sémantique : embeddings des
/// phrases du flux nettoyé, dans l'ordre de `sentence_spans`
#[derive(Debug, Clone)]
pub struct SemanticContext {
    pub sentence_spans: Vec<Range<usize>>,
    pub embeddings: Vec<Vec<f32>>,
}

/// Segmente le flux nettoyé selon la stratégie configurée.
///
/// Invariants garantis : offsets semi-ouverts dans le flux nettoyé,
/// `content == cleaned[start..end]`, intervalles croissants sans
/// recouvrement, indices denses depuis 0. Entrée vide → zéro chunks.
pub fn chunk_markdown(
    cleaned: &str,
    config: &ChunkerConfig,
    counter: &TokenCounter,
    semantic: Option<&SemanticContext>,
) -> IngestResult<Vec<Chunk>> {
    if cleaned.trim().is_empty() {
        return Ok(Vec::new());
    }

    let (ranges, effective) = match config.strategy {
        ChunkerKind::Recursive => (recursive_ranges(cleaned, config, counter), ChunkerKind::Recursive),
        ChunkerKind::Token => (token_ranges(cleaned, config, counter), ChunkerKind::Token),
        ChunkerKind::Sentence => (sentence_ranges(cleaned, config, counter), ChunkerKind::Sentence),
        ChunkerKind::Late => (late_ranges(cleaned, config, counter), ChunkerKind::Late),
        ChunkerKind::Code => (code_ranges(cleaned, config, counter), ChunkerKind::Code),
        ChunkerKind::Hybrid => (hybrid_ranges(cleaned, config, counter), ChunkerKind::Hybrid),
        ChunkerKind::Semantic => match semantic {
            Some(ctx) => (semantic_ranges(cleaned, config, counter, ctx), ChunkerKind::Semantic),
            None => {
                warn!("semantic strategy without embedder, falling back to recursive");
                (recursive_ranges(cleaned, config, counter), ChunkerKind::Recursive)
            }
        },
    };

    let chunks = materialize(cleaned, ranges, counter, effective);
    validate_chunks(cleaned, &chunks)?;
    debug!(
        "chunked {} bytes into {} chunks ({})",
        cleaned.len(),
        chunks.len(),
        effective
    );
    Ok(chunks)
}

// === Découpes de base (fidèles aux offsets) ===

static BLANK_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\n[ \t]*\n+").expect("blank line regex"));
static SENTENCE_END: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[.!?]+[\s]").expect("sentence end regex"));
static ATX_HEADING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^#{1,6}\s+").expect("heading regex"));

/// Spans des paragraphes (séparés par lignes vides), séparateurs exclus
pub fn paragraph_spans(text: &str) -> Vec<Range<usize>> {
    let mut spans = Vec::new();
    let mut cursor = 0usize;
    for sep in BLANK_LINE.find_iter(text) {
        if sep.start() > cursor {
            spans.push(cursor..sep.start());
        }
        cursor = sep.end();
    }
    if cursor < text.len() {
        spans.push(cursor..text.len());
    }
    spans.retain(|r| !text[r.clone()].trim().is_empty());
    spans
}

/// Spans des phrases : coupe après `.`/`!`/`?` suivi d'un blanc.
/// Les sauts de paragraphes restent des frontières implicites.
pub fn sentence_spans(text: &str) -> Vec<Range<usize>> {
    let mut spans = Vec::new();
    for para in paragraph_spans(text) {
        let slice = &text[para.clone()];
        let mut cursor = 0usize;
        for m in SENTENCE_END.find_iter(slice) {
            let end = m.end();
            if end > cursor {
                spans.push(para.start + cursor..para.start + end);
            }
            cursor = end;
        }
        if cursor < slice.len() {
            spans.push(para.start + cursor..para.end);
        }
    }
    spans.retain(|r| !text[r.clone()].trim().is_empty());
    spans
}

/// Fusionne des spans adjacents sous le budget cible ; un span dépassant
/// `max_tokens` est découpé par `oversplit`
fn fill_to_budget(
    text: &str,
    spans: Vec<Range<usize>>,
    counter: &TokenCounter,
    target: usize,
    max: usize,
    oversplit: impl Fn(&str, Range<usize>) -> Vec<Range<usize>>,
) -> Vec<Range<usize>> {
    let mut pieces: Vec<Range<usize>> = Vec::new();
    for span in spans {
        if counter.count(&text[span.clone()]) > max {
            pieces.extend(oversplit(text, span));
        } else {
            pieces.push(span);
        }
    }

    let mut merged: Vec<Range<usize>> = Vec::new();
    let mut current: Option<Range<usize>> = None;
    let mut current_tokens = 0usize;
    for piece in pieces {
        let tokens = counter.count(&text[piece.clone()]);
        match current.take() {
            None => {
                current_tokens = tokens;
                current = Some(piece);
            }
            Some(range) => {
                if current_tokens + tokens <= target {
                    current_tokens += tokens;
                    current = Some(range.start..piece.end);
                } else {
                    merged.push(range);
                    current_tokens = tokens;
                    current = Some(piece);
                }
            }
        }
    }
    if let Some(range) = current {
        merged.push(range);
    }
    merged
}

/// Découpe un span en fenêtres de caractères aux frontières de mots
fn window_split(text: &str, span: Range<usize>, max_chars: usize) -> Vec<Range<usize>> {
    let mut out = Vec::new();
    let mut cursor = span.start;
    while cursor < span.end {
        let mut cut = (cursor + max_chars).min(span.end);
        if cut < span.end {
            // reculer à la dernière frontière de mot
            if let Some(ws) = text[cursor..cut].rfind(char::is_whitespace) {
                if ws > 0 {
                    cut = cursor + ws;
                }
            }
            while cut > cursor && !text.is_char_boundary(cut) {
                cut -= 1;
            }
            if cut == cursor {
                cut = (cursor + max_chars).min(span.end);
                while cut < span.end && !text.is_char_boundary(cut) {
                    cut += 1;
                }
            }
        }
        out.push(cursor..cut);
        // sauter le blanc de séparation
        cursor = cut;
        while cursor < span.end {
            let Some(ch) = text[cursor..].chars().next() else {
                break;
            };
            if ch.is_whitespace() {
                cursor += ch.len_utf8();
            } else {
                break;
            }
        }
    }
    out
}

// === Stratégies ===

fn recursive_ranges(text: &str, config: &ChunkerConfig, counter: &TokenCounter) -> Vec<Range<usize>> {
    let max_chars = (config.max_tokens as f32 * config.chars_per_token) as usize;
    fill_to_budget(
        text,
        paragraph_spans(text),
        counter,
        config.target_tokens,
        config.max_tokens,
        |t, span| {
            // paragraphe trop long : phrases, puis fenêtres de mots
            let sentences: Vec<Range<usize>> = sentence_spans(&t[span.clone()])
                .into_iter()
                .map(|r| span.start + r.start..span.start + r.end)
                .collect();
            let mut out = Vec::new();
            for sentence in sentences {
                if t[sentence.clone()].chars().count() > max_chars {
                    out.extend(window_split(t, sentence, max_chars));
                } else {
                    out.push(sentence);
                }
            }
            out
        },
    )
}

fn token_ranges(text: &str, config: &ChunkerConfig, counter: &TokenCounter) -> Vec<Range<usize>> {
    let max_chars = (config.max_tokens as f32 * config.chars_per_token) as usize;
    fill_to_budget(
        text,
        sentence_spans(text),
        counter,
        config.target_tokens,
        config.max_tokens,
        |t, span| window_split(t, span, max_chars),
    )
}

fn sentence_ranges(text: &str, config: &ChunkerConfig, counter: &TokenCounter) -> Vec<Range<usize>> {
    // Frontières strictement aux phrases ; une phrase hors budget reste entière
    fill_to_budget(
        text,
        sentence_spans(text),
        counter,
        config.target_tokens,
        usize::MAX,
        |_, span| vec![span],
    )
}

fn late_ranges(text: &str, config: &ChunkerConfig, counter: &TokenCounter) -> Vec<Range<usize>> {
    // Granularité fine pour late interaction : budget au quart
    let target = (config.target_tokens / 4).max(config.min_tokens.min(64)).max(16);
    let max_chars = (config.max_tokens as f32 * config.chars_per_token) as usize / 4;
    fill_to_budget(
        text,
        sentence_spans(text),
        counter,
        target,
        target * 2,
        move |t, span| window_split(t, span, max_chars.max(64)),
    )
}

fn code_ranges(text: &str, config: &ChunkerConfig, counter: &TokenCounter) -> Vec<Range<usize>> {
    // Blocs fencés atomiques : jamais coupés, même hors budget
    let mut segments: Vec<(Range<usize>, bool)> = Vec::new(); // (span, est_code)
    let mut cursor = 0usize;
    let mut fence_open: Option<usize> = None;
    for line_start in line_starts(text) {
        let line_end = text[line_start..]
            .find('\n')
            .map(|i| line_start + i + 1)
            .unwrap_or(text.len());
        let line = &text[line_start..line_end];
        if line.trim_start().starts_with("```") {
            match fence_open.take() {
                None => {
                    if line_start > cursor {
                        segments.push((cursor..line_start, false));
                    }
                    fence_open = Some(line_start);
                }
                Some(open) => {
                    segments.push((open..line_end, true));
                    cursor = line_end;
                }
            }
        }
        if fence_open.is_none() && line_end == text.len() && cursor < text.len() {
            segments.push((cursor..text.len(), false));
            cursor = text.len();
        }
    }
    if let Some(open) = fence_open {
        // fence jamais refermée : le reste est traité comme code
        segments.push((open..text.len(), true));
        cursor = text.len();
    }
    if cursor < text.len() {
        segments.push((cursor..text.len(), false));
    }

    let mut ranges = Vec::new();
    for (span, is_code) in segments {
        if text[span.clone()].trim().is_empty() {
            continue;
        }
        if is_code {
            ranges.push(span);
        } else {
            let sub: Vec<Range<usize>> = recursive_ranges(&text[span.clone()], config, counter)
                .into_iter()
                .map(|r| span.start + r.start..span.start + r.end)
                .collect();
            ranges.extend(sub);
        }
    }
    ranges
}

fn hybrid_ranges(text: &str, config: &ChunkerConfig, counter: &TokenCounter) -> Vec<Range<usize>> {
    // Sections de titres, puis récursif à l'intérieur de chaque section
    let mut boundaries: Vec<usize> = ATX_HEADING.find_iter(text).map(|m| m.start()).collect();
    if boundaries.first() != Some(&0) {
        boundaries.insert(0, 0);
    }
    boundaries.push(text.len());

    let mut ranges = Vec::new();
    for window in boundaries.windows(2) {
        let section = window[0]..window[1];
        if text[section.clone()].trim().is_empty() {
            continue;
        }
        let sub: Vec<Range<usize>> = recursive_ranges(&text[section.clone()], config, counter)
            .into_iter()
            .map(|r| section.start + r.start..section.start + r.end)
            .collect();
        ranges.extend(sub);
    }
    ranges
}

fn semantic_ranges(
    text: &str,
    config: &ChunkerConfig,
    counter: &TokenCounter,
    ctx: &SemanticContext,
) -> Vec<Range<usize>> {
    if ctx.sentence_spans.is_empty() || ctx.sentence_spans.len() != ctx.embeddings.len() {
        warn!("semantic context inconsistent, falling back to recursive");
        return recursive_ranges(text, config, counter);
    }

    let mut ranges: Vec<Range<usize>> = Vec::new();
    let mut group_start = 0usize; // index de phrase
    let mut centroid: Vec<f32> = ctx.embeddings[0].clone();
    let mut group_tokens = counter.count(&text[ctx.sentence_spans[0].clone()]);

    for i in 1..ctx.sentence_spans.len() {
        let span = &ctx.sentence_spans[i];
        let tokens = counter.count(&text[span.clone()]);
        let sim = cosine_similarity(&centroid, &ctx.embeddings[i]);
        let boundary = (sim < config.semantic_boundary_threshold
            && group_tokens >= config.min_tokens)
            || group_tokens + tokens > config.max_tokens;

        if boundary {
            ranges.push(ctx.sentence_spans[group_start].start..ctx.sentence_spans[i - 1].end);
            group_start = i;
            centroid = ctx.embeddings[i].clone();
            group_tokens = tokens;
        } else {
            // centroïde incrémental du groupe courant
            let n = (i - group_start) as f32;
            for (c, e) in centroid.iter_mut().zip(ctx.embeddings[i].iter()) {
                *c = (*c * n + e) / (n + 1.0);
            }
            group_tokens += tokens;
        }
    }
    ranges.push(ctx.sentence_spans[group_start].start..ctx.sentence_spans.last().unwrap().end);
    ranges
}

fn line_starts(text: &str) -> Vec<usize> {
    let mut starts = vec![0usize];
    for (i, b) in text.bytes().enumerate() {
        if b == b'\n' && i + 1 < text.len() {
            starts.push(i + 1);
        }
    }
    starts
}

// === Matérialisation et invariants ===

/// Rétrécit chaque span à son contenu non blanc puis construit les chunks
fn materialize(
    text: &str,
    ranges: Vec<Range<usize>>,
    counter: &TokenCounter,
    kind: ChunkerKind,
) -> Vec<Chunk> {
    let mut chunks = Vec::new();
    for range in ranges {
        let slice = &text[range.clone()];
        let trimmed = slice.trim();
        if trimmed.is_empty() {
            continue;
        }
        let lead = slice.len() - slice.trim_start().len();
        let trail = slice.len() - slice.trim_end().len();
        let start = range.start + lead;
        let end = range.end - trail;
        let content = text[start..end].to_string();
        let token_count = counter.count(&content).max(1);
        chunks.push(Chunk::bare(chunks.len(), content, start, end, token_count, kind));
    }
    chunks
}

/// Vérifie les invariants d'intervalle ; une violation est fatale
pub fn validate_chunks(cleaned: &str, chunks: &[Chunk]) -> IngestResult<()> {
    for (i, chunk) in chunks.iter().enumerate() {
        if chunk.chunk_index != i {
            return Err(IngestError::ChunkInvariantViolated(format!(
                "chunk index {} at position {}",
                chunk.chunk_index, i
            )));
        }
        if chunk.start_offset >= chunk.end_offset {
            return Err(IngestError::ChunkInvariantViolated(format!(
                "empty interval on chunk {i}"
            )));
        }
        if chunk.end_offset > cleaned.len() {
            return Err(IngestError::ChunkInvariantViolated(format!(
                "chunk {i} ends past the cleaned stream"
            )));
        }
        let slice = &cleaned[chunk.start_offset..chunk.end_offset];
        if slice.trim() != chunk.content.trim() {
            return Err(IngestError::ChunkInvariantViolated(format!(
                "chunk {i} content does not match its offsets"
            )));
        }
        if i + 1 < chunks.len() && chunk.end_offset > chunks[i + 1].start_offset {
            return Err(IngestError::ChunkInvariantViolated(format!(
                "chunks {i} and {} overlap",
                i + 1
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counter() -> TokenCounter {
        TokenCounter::heuristic(4.0)
    }

    fn config(strategy: ChunkerKind) -> ChunkerConfig {
        ChunkerConfig {
            strategy,
            target_tokens: 40,
            min_tokens: 5,
            max_tokens: 60,
            ..ChunkerConfig::default()
        }
    }

    fn sample_text() -> String {
        let mut text = String::new();
        for i in 0..12 {
            text.push_str(&format!(
                "Paragraphe numéro {i} avec assez de texte pour compter des tokens. \
                 Une seconde phrase complète le paragraphe.\n\n"
            ));
        }
        text
    }

    #[test]
    fn test_empty_input_yields_no_chunks() {
        let chunks = chunk_markdown("", &config(ChunkerKind::Recursive), &counter(), None).unwrap();
        assert!(chunks.is_empty());
        let chunks = chunk_markdown("  \n\n ", &config(ChunkerKind::Recursive), &counter(), None).unwrap();
        assert!(chunks.is_empty());
    }

    #[test]
    fn test_offsets_are_exact_for_all_strategies() {
        let text = sample_text();
        for strategy in [
            ChunkerKind::Recursive,
            ChunkerKind::Token,
            ChunkerKind::Sentence,
            ChunkerKind::Late,
            ChunkerKind::Code,
            ChunkerKind::Hybrid,
        ] {
            let chunks = chunk_markdown(&text, &config(strategy), &counter(), None).unwrap();
            assert!(!chunks.is_empty(), "{strategy} sans chunks");
            for chunk in &chunks {
                assert_eq!(
                    &text[chunk.start_offset..chunk.end_offset],
                    chunk.content,
                    "{strategy}: offsets inexacts"
                );
            }
            for pair in chunks.windows(2) {
                assert!(pair[0].end_offset <= pair[1].start_offset, "{strategy}: recouvrement");
            }
        }
    }

    #[test]
    fn test_recursive_respects_target() {
        let text = sample_text();
        let cfg = config(ChunkerKind::Recursive);
        let chunks = chunk_markdown(&text, &cfg, &counter(), None).unwrap();
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.token_count <= cfg.max_tokens + 8, "chunk trop gros");
        }
    }

    #[test]
    fn test_code_fences_are_atomic() {
        let text = "Intro avant le code.\n\n```rust\nfn main() {\n    println!(\"x\");\n}\n```\n\nSuite après le code avec du texte.";
        let chunks = chunk_markdown(text, &config(ChunkerKind::Code), &counter(), None).unwrap();
        let code_chunk = chunks
            .iter()
            .find(|c| c.content.contains("fn main"))
            .expect("chunk code");
        assert!(code_chunk.content.starts_with("```rust"));
        assert!(code_chunk.content.ends_with("```"));
    }

    #[test]
    fn test_sentence_boundaries() {
        let text = "Première phrase. Deuxième phrase ! Troisième phrase ?";
        let spans = sentence_spans(text);
        assert_eq!(spans.len(), 3);
        assert!(text[spans[0].clone()].starts_with("Première"));
        assert!(text[spans[2].clone()].starts_with("Troisième"));
    }

    #[test]
    fn test_long_sentence_window_split() {
        // Une "phrase" sans ponctuation bien plus longue que le budget
        let text = "mot ".repeat(2_000);
        let chunks = chunk_markdown(&text, &config(ChunkerKind::Token), &counter(), None).unwrap();
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert_eq!(&text[chunk.start_offset..chunk.end_offset], chunk.content);
        }
    }

    #[test]
    fn test_semantic_boundary_on_similarity_drop() {
        let text = "Phrase sujet un. Phrase sujet un encore. Phrase sujet deux maintenant.";
        let spans = sentence_spans(text);
        assert_eq!(spans.len(), 3);
        // Deux premières phrases similaires, la troisième orthogonale
        let ctx = SemanticContext {
            sentence_spans: spans,
            embeddings: vec![
                vec![1.0, 0.0, 0.0],
                vec![0.95, 0.05, 0.0],
                vec![0.0, 1.0, 0.0],
            ],
        };
        let mut cfg = config(ChunkerKind::Semantic);
        cfg.min_tokens = 1;
        let chunks = chunk_markdown(text, &cfg, &counter(), Some(&ctx)).unwrap();
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].content.contains("sujet un encore"));
        assert!(chunks[1].content.starts_with("Phrase sujet deux"));
        assert_eq!(chunks[0].chunker_type, ChunkerKind::Semantic);
    }

    #[test]
    fn test_semantic_without_context_falls_back() {
        let text = sample_text();
        let chunks = chunk_markdown(&text, &config(ChunkerKind::Semantic), &counter(), None).unwrap();
        assert!(!chunks.is_empty());
        assert_eq!(chunks[0].chunker_type, ChunkerKind::Recursive);
    }

    #[test]
    fn test_hybrid_does_not_cross_headings() {
        let text = "# Alpha\n\nContenu de la première section avec du texte.\n\n# Beta\n\nContenu de la seconde section.";
        let chunks = chunk_markdown(text, &config(ChunkerKind::Hybrid), &counter(), None).unwrap();
        for chunk in &chunks {
            let crosses = chunk.content.contains("# Alpha") && chunk.content.contains("# Beta");
            assert!(!crosses, "chunk traversant deux sections");
        }
    }

    #[test]
    fn test_indices_dense() {
        let chunks = chunk_markdown(&sample_text(), &config(ChunkerKind::Recursive), &counter(), None).unwrap();
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.chunk_index, i);
        }
    }

    #[test]
    fn test_validate_rejects_overlap() {
        let text = "abcdef";
        let mut chunks = vec![
            Chunk::bare(0, "abcd".to_string(), 0, 4, 1, ChunkerKind::Recursive),
            Chunk::bare(1, "cdef".to_string(), 2, 6, 1, ChunkerKind::Recursive),
        ];
        assert!(validate_chunks(text, &chunks).is_err());
        chunks[1].start_offset = 4;
        chunks[1].content = "ef".to_string();
        // contenu incohérent avec les offsets → rejet aussi
        assert!(validate_chunks(text, &chunks).is_err());
    }
}
