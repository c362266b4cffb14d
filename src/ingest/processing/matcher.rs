// VELIN Traitement - Récupération de positions "bulletproof"
// Cinq couches successives ; aucun chunk brut ne reste sans position

use serde_json::json;
use std::ops::Range;
use std::sync::Arc;
use tracing::{debug, trace, warn};

use crate::ingest::embedder::{EmbedError, TextEmbedder};
use crate::ingest::model::{GenerateOptions, ModelClient};
use crate::ingest::processing::chunker::paragraph_spans;
use crate::ingest::text::{
    cosine_similarity, exact_occurrences, find_best_window, normalize_for_matching,
    similarity_ratio, NormalizedView,
};
use crate::ingest::{
    BoundingBox, MatchMethod, MatchedSpan, PositionConfidence, RawChunk,
};

/// Configuration du matcher
#[derive(Debug, Clone)]
pub struct MatcherConfig {
    /// Similarité minimale pour la couche 1 (fuzzy-exact)
    pub sim_exact: f64,
    /// Cosinus minimal pour la couche 2 (embeddings)
    pub sim_hi: f32,
    /// Similarité de back-match pour la couche 3 (localisation LLM)
    pub sim_lo: f64,
    /// Facteur de taille de l'extrait présenté au modèle (× |contenu|)
    pub llm_window_factor: usize,
    pub model: String,
    /// Écart horizontal maximal pour fusionner deux bboxes d'une même ligne
    pub bbox_merge_gap: f32,
    /// Tolérance verticale d'appartenance à une même ligne
    pub bbox_line_tolerance: f32,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            sim_exact: 0.98,
            sim_hi: 0.85,
            sim_lo: 0.70,
            llm_window_factor: 4,
            model: "llama3.1:8b".to_string(),
            bbox_merge_gap: 5.0,
            bbox_line_tolerance: 2.0,
        }
    }
}

/// Index d'embeddings de paragraphes du flux nettoyé, pré-calculé une fois
/// et partagé en lecture seule par tous les chunks bruts
pub struct ParagraphIndex {
    spans: Vec<Range<usize>>,
    embeddings: Vec<Vec<f32>>,
}

impl ParagraphIndex {
    pub fn build(cleaned: &str, embedder: &dyn TextEmbedder) -> Result<Self, EmbedError> {
        let spans = paragraph_spans(cleaned);
        let texts: Vec<String> = spans.iter().map(|r| cleaned[r.clone()].to_string()).collect();
        let embeddings = embedder.embed_batch(&texts)?;
        debug!("paragraph index: {} paragraphs embedded", spans.len());
        Ok(Self { spans, embeddings })
    }

    fn best_match(&self, query: &[f32]) -> Option<(Range<usize>, f32)> {
        let mut best: Option<(usize, f32)> = None;
        for (i, embedding) in self.embeddings.iter().enumerate() {
            let sim = cosine_similarity(query, embedding);
            if best.map_or(true, |(_, b)| sim > b) {
                best = Some((i, sim));
            }
        }
        best.map(|(i, sim)| (self.spans[i].clone(), sim))
    }
}

/// Matcher de positions en cinq couches. Chaque chunk brut de l'extracteur
/// reçoit exactement une position `(start, end, méthode, confiance)` dans le
/// flux nettoyé ; la séquence des positions acceptées reste croissante, une
/// candidate qui violerait la monotonie est retentée à la couche suivante.
pub struct BulletproofMatcher<'a> {
    cleaned: &'a str,
    view: NormalizedView,
    /// Longueur du flux extrait original (mapping proportionnel)
    raw_total_len: usize,
    embedder: Option<Arc<dyn TextEmbedder>>,
    paragraph_index: Option<ParagraphIndex>,
    model: Option<Arc<dyn ModelClient>>,
    config: MatcherConfig,
}

impl<'a> BulletproofMatcher<'a> {
    pub fn new(cleaned: &'a str, raw_total_len: usize, config: MatcherConfig) -> Self {
        Self {
            cleaned,
            view: normalize_for_matching(cleaned),
            raw_total_len: raw_total_len.max(1),
            embedder: None,
            paragraph_index: None,
            model: None,
            config,
        }
    }

    /// Active la couche 2 (recherche par embeddings)
    pub fn with_embedder(mut self, embedder: Arc<dyn TextEmbedder>) -> Result<Self, EmbedError> {
        self.paragraph_index = Some(ParagraphIndex::build(self.cleaned, embedder.as_ref())?);
        self.embedder = Some(embedder);
        Ok(self)
    }

    /// Active la couche 3 (localisation par modèle)
    pub fn with_model(mut self, model: Arc<dyn ModelClient>) -> Self {
        self.model = Some(model);
        self
    }

    /// Positionne tous les chunks bruts. Totalité garantie : le résultat a
    /// exactement une entrée par chunk, dans l'ordre d'entrée.
    pub async fn match_all(&self, raw_chunks: &[RawChunk]) -> Vec<MatchedSpan> {
        // Traitement dans l'ordre du flux extrait pour la monotonie
        let mut order: Vec<usize> = (0..raw_chunks.len()).collect();
        order.sort_by_key(|&i| raw_chunks[i].char_span.0);

        let mut spans: Vec<Option<MatchedSpan>> = vec![None; raw_chunks.len()];
        let mut last_start = 0usize;
        let mut prev: Option<(usize, usize)> = None; // (fin span brut, fin span nettoyé)

        for &i in &order {
            let chunk = &raw_chunks[i];
            let span = self.match_one(chunk, last_start, prev).await;
            trace!(
                "raw chunk {} -> [{}..{}) via {:?}",
                i,
                span.start,
                span.end,
                span.method
            );
            last_start = span.start;
            prev = Some((chunk.char_span.1, span.end.max(span.start)));
            spans[i] = Some(span);
        }

        spans.into_iter().map(|s| s.expect("totality")).collect()
    }

    async fn match_one(
        &self,
        chunk: &RawChunk,
        last_start: usize,
        prev: Option<(usize, usize)>,
    ) -> MatchedSpan {
        // Couche 1 : occurrence normalisée quasi exacte, unique
        if let Some((start, end)) = self.layer1_fuzzy_exact(&chunk.content) {
            if start >= last_start {
                return MatchedSpan {
                    start,
                    end,
                    method: MatchMethod::Exact,
                    confidence: PositionConfidence::Exact,
                    interpolated: false,
                };
            }
            debug!("layer1 hit at {} violates monotonicity (last {}), retrying next layer", start, last_start);
        }

        // Couche 2 : meilleur paragraphe par similarité d'embeddings
        if let Some((start, end, sim)) = self.layer2_embedding(&chunk.content) {
            if start >= last_start {
                trace!("layer2 cosine {:.3}", sim);
                return MatchedSpan {
                    start,
                    end,
                    method: MatchMethod::Embedding,
                    confidence: PositionConfidence::High,
                    interpolated: false,
                };
            }
        }

        // Couche 3 : localisation par modèle à sortie structurée
        if let Some((start, end)) = self.layer3_llm(chunk).await {
            if start >= last_start {
                return MatchedSpan {
                    start,
                    end,
                    method: MatchMethod::Llm,
                    confidence: PositionConfidence::Medium,
                    interpolated: false,
                };
            }
        }

        // Couche 4 : interpolation linéaire depuis les voisins déjà placés
        let (start, end) = self.layer4_interpolate(chunk, last_start, prev);
        if end > start {
            return MatchedSpan {
                start,
                end,
                method: MatchMethod::Interpolation,
                confidence: PositionConfidence::Synthetic,
                interpolated: true,
            };
        }

        // Couche 5 : marqueur zero-width, jamais en échec
        let pos = self.floor_boundary(start.min(self.cleaned.len()).max(last_start));
        MatchedSpan {
            start: pos,
            end: pos,
            method: MatchMethod::Marker,
            confidence: PositionConfidence::Synthetic,
            interpolated: true,
        }
    }

    fn layer1_fuzzy_exact(&self, content: &str) -> Option<(usize, usize)> {
        let needle = normalize_for_matching(content);
        let needle_text = needle.text.trim();
        if needle_text.is_empty() {
            return None;
        }

        // Occurrence exacte du texte normalisé, unique
        let occurrences = exact_occurrences(&self.view.text, needle_text);
        match occurrences.len() {
            1 => {
                let start = self.view.raw_offset(occurrences[0]);
                let end = self.view.raw_offset(occurrences[0] + needle_text.len());
                return Some((start, end));
            }
            n if n > 1 => {
                debug!("layer1: {} occurrences, ambiguous", n);
                return None;
            }
            _ => {}
        }

        // Fenêtre floue unique au-dessus du seuil quasi exact
        let window = find_best_window(&self.view.text, needle_text, self.config.sim_exact)?;
        if !window.unique {
            return None;
        }
        let start = self.view.raw_offset(window.range.start);
        let end = self.view.raw_offset(window.range.end);
        Some((start, end))
    }

    fn layer2_embedding(&self, content: &str) -> Option<(usize, usize, f32)> {
        let embedder = self.embedder.as_ref()?;
        let index = self.paragraph_index.as_ref()?;
        let query = match embedder.embed_text(content) {
            Ok(vector) => vector,
            Err(err) => {
                warn!("layer2 embedding failed: {err}");
                return None;
            }
        };
        let (span, sim) = index.best_match(&query)?;
        if sim < self.config.sim_hi {
            return None;
        }
        Some((span.start, span.end, sim))
    }

    async fn layer3_llm(&self, chunk: &RawChunk) -> Option<(usize, usize)> {
        let model = self.model.as_ref()?;

        // Extrait borné centré sur la position proportionnelle
        let approx = self.proportional_position(chunk.char_span.0);
        let half = (chunk.content.len() * self.config.llm_window_factor / 2).max(1_000);
        let from = self.floor_boundary(approx.saturating_sub(half));
        let to = self.floor_boundary((approx + half).min(self.cleaned.len()));
        if from >= to {
            return None;
        }
        let excerpt = &self.cleaned[from..to];

        let schema = json!({
            "type": "object",
            "required": ["start", "end"],
            "properties": {
                "start": {"type": "integer", "minimum": 0},
                "end": {"type": "integer", "minimum": 0}
            }
        });
        let prompt = format!(
            "Voici un extrait d'un document nettoyé:\n---\n{excerpt}\n---\n\
             Localise le passage correspondant à ce contenu original:\n---\n{}\n---\n\
             Réponds avec les offsets byte `start` et `end` dans l'extrait.",
            chunk.content
        );
        let options = GenerateOptions {
            model: self.config.model.clone(),
            temperature: 0.0,
            max_tokens: None,
        };

        let value = match model.generate_structured(&prompt, &schema, &options).await {
            Ok(value) => value,
            Err(err) => {
                warn!("layer3 localization failed: {err}");
                return None;
            }
        };
        let rel_start = value.get("start")?.as_u64()? as usize;
        let rel_end = value.get("end")?.as_u64()? as usize;
        if rel_end <= rel_start || rel_start >= excerpt.len() {
            return None;
        }

        let start = self.floor_boundary(from + rel_start);
        let end = self.floor_boundary(from + rel_end.min(excerpt.len()));
        if end <= start {
            return None;
        }

        // Back-match : la tranche rendue doit ressembler au contenu original
        let slice_norm = normalize_for_matching(&self.cleaned[start..end]);
        let content_norm = normalize_for_matching(&chunk.content);
        let ratio = similarity_ratio(slice_norm.text.trim(), content_norm.text.trim());
        if ratio < self.config.sim_lo {
            debug!("layer3 back-match ratio {:.3} below floor", ratio);
            return None;
        }
        Some((start, end))
    }

    fn layer4_interpolate(
        &self,
        chunk: &RawChunk,
        last_start: usize,
        prev: Option<(usize, usize)>,
    ) -> (usize, usize) {
        let width = chunk.content.len();
        let start = match prev {
            Some((prev_raw_end, prev_clean_end)) => {
                // écart brut re-projeté à l'échelle du flux nettoyé
                let gap = chunk.char_span.0.saturating_sub(prev_raw_end);
                let scaled =
                    (gap as f64 * self.cleaned.len() as f64 / self.raw_total_len as f64) as usize;
                prev_clean_end + scaled
            }
            None => self.proportional_position(chunk.char_span.0),
        };
        let start = self.floor_boundary(start.max(last_start).min(self.cleaned.len()));
        let end = self.floor_boundary((start + width).min(self.cleaned.len()));
        (start, end)
    }

    fn proportional_position(&self, raw_offset: usize) -> usize {
        ((self.cleaned.len() as f64 * raw_offset as f64) / self.raw_total_len as f64).round()
            as usize
    }

    fn floor_boundary(&self, mut idx: usize) -> usize {
        idx = idx.min(self.cleaned.len());
        while idx > 0 && !self.cleaned.is_char_boundary(idx) {
            idx -= 1;
        }
        idx
    }
}

// === Fusion de rectangles pour le surlignage ===

/// Fusionne les bboxes adjacentes d'une même ligne (écart ≤ `merge_gap` px)
/// pour produire des rectangles de surlignage continus par page.
pub fn merge_bbox_rectangles(bboxes: &[BoundingBox], config: &MatcherConfig) -> Vec<BoundingBox> {
    if bboxes.is_empty() {
        return Vec::new();
    }
    let mut sorted: Vec<BoundingBox> = bboxes.to_vec();
    sorted.sort_by(|a, b| {
        (a.page, a.y, a.x)
            .partial_cmp(&(b.page, b.y, b.x))
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut merged: Vec<BoundingBox> = Vec::new();
    let mut current = sorted[0];
    for bbox in &sorted[1..] {
        let same_line = bbox.page == current.page
            && (bbox.y - current.y).abs() <= config.bbox_line_tolerance;
        let contiguous = bbox.x - current.right() <= config.bbox_merge_gap;
        if same_line && contiguous {
            let bottom = current.bottom().max(bbox.bottom());
            let y = current.y.min(bbox.y);
            current = BoundingBox {
                page: current.page,
                x: current.x,
                y,
                width: bbox.right().max(current.right()) - current.x,
                height: bottom - y,
            };
        } else {
            merged.push(current);
            current = *bbox;
        }
    }
    merged.push(current);
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(content: &str, span: (usize, usize)) -> RawChunk {
        RawChunk {
            content: content.to_string(),
            page_start: Some(1),
            page_end: Some(1),
            heading_path: vec!["Section".to_string()],
            bboxes: Vec::new(),
            char_span: span,
        }
    }

    #[tokio::test]
    async fn test_layer1_exact_verbatim() {
        let cleaned = "Préambule du document. Le passage cherché se trouve ici même. Conclusion.";
        let raw_stream_len = cleaned.len();
        let matcher = BulletproofMatcher::new(cleaned, raw_stream_len, MatcherConfig::default());

        let needle = "Le passage cherché se trouve ici même.";
        let chunk = raw(needle, (20, 20 + needle.len()));
        let spans = matcher.match_all(&[chunk]).await;

        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].method, MatchMethod::Exact);
        assert_eq!(spans[0].confidence, PositionConfidence::Exact);
        assert!(!spans[0].interpolated);
        assert_eq!(&cleaned[spans[0].start..spans[0].end], needle);
    }

    #[tokio::test]
    async fn test_layer1_whitespace_insensitive() {
        let cleaned = "Avant.  Le  texte   avec espaces multiples. Après.";
        let matcher = BulletproofMatcher::new(cleaned, cleaned.len(), MatcherConfig::default());
        // Le chunk brut porte un whitespace différent : le matching normalise
        let chunk = raw("Le texte avec espaces multiples.", (7, 43));
        let spans = matcher.match_all(&[chunk]).await;
        assert_eq!(spans[0].method, MatchMethod::Exact);
        assert!(cleaned[spans[0].start..spans[0].end].contains("espaces multiples"));
    }

    #[tokio::test]
    async fn test_rewritten_chunk_interpolates() {
        // Contenu fortement réécrit, sans embedder ni modèle : couche 4
        let cleaned = "Un paragraphe initial conservé.\n\nUn passage totalement reformulé par le nettoyage.\n\nLa fin conservée.";
        let raw_stream = "Un paragraphe initial conservé.\n\nC3 p4ss4ge 0r1g1n4l tr3s d1ff3r3nt du r3sult4t f1n4l.\n\nLa fin conservée.";
        let matcher = BulletproofMatcher::new(cleaned, raw_stream.len(), MatcherConfig::default());

        let original = "C3 p4ss4ge 0r1g1n4l tr3s d1ff3r3nt du r3sult4t f1n4l.";
        let offset = raw_stream.find(original).unwrap();
        let chunks = vec![
            raw("Un paragraphe initial conservé.", (0, 31)),
            raw(original, (offset, offset + original.len())),
        ];
        let spans = matcher.match_all(&chunks).await;

        assert_eq!(spans[0].method, MatchMethod::Exact);
        assert_eq!(spans[1].method, MatchMethod::Interpolation);
        assert_eq!(spans[1].confidence, PositionConfidence::Synthetic);
        assert!(spans[1].interpolated);
        // Largeur ≈ |contenu brut| (bornée par la fin du flux)
        let width = spans[1].end - spans[1].start;
        assert!(width <= original.len());
        assert!(width >= original.len().min(cleaned.len() - spans[1].start) - 3);
    }

    #[tokio::test]
    async fn test_totality_every_chunk_positioned() {
        let cleaned = "Seul un court flux nettoyé subsiste ici.";
        let matcher = BulletproofMatcher::new(cleaned, 4_000, MatcherConfig::default());
        let chunks: Vec<RawChunk> = (0..8)
            .map(|i| raw(&format!("contenu brut disparu numéro {i}"), (i * 500, i * 500 + 400)))
            .collect();
        let spans = matcher.match_all(&chunks).await;
        assert_eq!(spans.len(), chunks.len());
        for span in &spans {
            assert!(span.end <= cleaned.len());
            assert!(span.start <= span.end);
            assert_eq!(span.confidence, PositionConfidence::Synthetic);
        }
    }

    #[tokio::test]
    async fn test_monotonicity_enforced() {
        // Le second chunk n'apparaît qu'AVANT la position du premier :
        // l'accepter violerait la monotonie, il part en interpolation
        let cleaned = "zone unique bravo se trouve ici. zone unique alpha se trouve là.";
        let matcher = BulletproofMatcher::new(cleaned, cleaned.len(), MatcherConfig::default());
        let chunks = vec![
            raw("zone unique alpha se trouve là.", (0, 31)),
            raw("zone unique bravo se trouve ici.", (33, 64)),
        ];
        let spans = matcher.match_all(&chunks).await;
        assert_eq!(spans[0].method, MatchMethod::Exact);
        assert_ne!(spans[1].method, MatchMethod::Exact);
        assert!(spans[1].start >= spans[0].start, "ordre non décroissant");
    }

    #[tokio::test]
    async fn test_layer2_embedding_match() {
        struct DirectionEmbedder;
        impl TextEmbedder for DirectionEmbedder {
            fn embed_text(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
                // Direction portée par un mot-clé : déterministe et discriminant
                let mut v = vec![0.0f32; 4];
                if text.contains("félin") || text.contains("chat") {
                    v[0] = 1.0;
                } else if text.contains("navire") || text.contains("bateau") {
                    v[1] = 1.0;
                } else {
                    v[2] = 1.0;
                }
                Ok(v)
            }
            fn dimension(&self) -> usize {
                4
            }
        }

        let cleaned = "Le chat dort sur le tapis toute la journée.\n\nLe bateau quitte le port au matin.";
        let matcher = BulletproofMatcher::new(cleaned, 200, MatcherConfig::default())
            .with_embedder(Arc::new(DirectionEmbedder))
            .unwrap();

        // Réécrit : la couche 1 échoue, la couche 2 choisit le bon paragraphe
        let chunk = raw("Un navire appareille du quai à l'aube.", (100, 150));
        let spans = matcher.match_all(&[chunk]).await;
        assert_eq!(spans[0].method, MatchMethod::Embedding);
        assert_eq!(spans[0].confidence, PositionConfidence::High);
        assert!(cleaned[spans[0].start..spans[0].end].contains("bateau"));
    }

    #[test]
    fn test_bbox_merge_same_line() {
        let config = MatcherConfig::default();
        let boxes = vec![
            BoundingBox { page: 1, x: 10.0, y: 100.0, width: 40.0, height: 12.0 },
            BoundingBox { page: 1, x: 53.0, y: 100.5, width: 30.0, height: 12.0 },
            BoundingBox { page: 1, x: 10.0, y: 120.0, width: 60.0, height: 12.0 },
        ];
        let merged = merge_bbox_rectangles(&boxes, &config);
        assert_eq!(merged.len(), 2);
        // Les deux premières fusionnées : gap de 3px sur la même ligne
        assert_eq!(merged[0].x, 10.0);
        assert!((merged[0].width - 73.0).abs() < 0.1);
    }

    #[test]
    fn test_bbox_no_merge_across_pages() {
        let config = MatcherConfig::default();
        let boxes = vec![
            BoundingBox { page: 1, x: 10.0, y: 100.0, width: 40.0, height: 12.0 },
            BoundingBox { page: 2, x: 52.0, y: 100.0, width: 30.0, height: 12.0 },
        ];
        let merged = merge_bbox_rectangles(&boxes, &config);
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn test_bbox_gap_too_wide() {
        let config = MatcherConfig::default();
        let boxes = vec![
            BoundingBox { page: 1, x: 10.0, y: 100.0, width: 40.0, height: 12.0 },
            BoundingBox { page: 1, x: 70.0, y: 100.0, width: 30.0, height: 12.0 },
        ];
        // gap de 20px > 5px : pas de fusion
        let merged = merge_bbox_rectangles(&boxes, &config);
        assert_eq!(merged.len(), 2);
    }
}
