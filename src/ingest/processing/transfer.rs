// VELIN Traitement - Transfert de provenance structurelle
// Recouvrement d'intervalles chunks bruts → chunks finaux, interpolation sinon

use tracing::{debug, warn};

use crate::ingest::processing::matcher::{merge_bbox_rectangles, MatcherConfig};
use crate::ingest::{
    Chunk, MatchMethod, MatchedSpan, MetadataConfidence, PositionConfidence, RawChunk, SourceKind,
};

/// Superpose la provenance des chunks bruts positionnés sur les chunks finaux.
///
/// Invariant de sortie : chaque chunk final porte des métadonnées
/// structurelles. Pages jamais nulles pour un PDF ; les EPUB n'ont pas de
/// pages mais toujours un `section_marker`.
pub fn transfer_metadata(
    chunks: &mut [Chunk],
    raw_chunks: &[RawChunk],
    spans: &[MatchedSpan],
    source_kind: SourceKind,
    bbox_config: &MatcherConfig,
) {
    debug_assert_eq!(raw_chunks.len(), spans.len());

    let mut interpolated_count = 0usize;
    for chunk in chunks.iter_mut() {
        let overlapping: Vec<usize> = spans
            .iter()
            .enumerate()
            .filter(|(_, span)| span.overlaps(chunk.start_offset, chunk.end_offset))
            .map(|(i, _)| i)
            .collect();

        chunk.metadata_overlap_count = overlapping.len();

        if overlapping.is_empty() {
            interpolate_from_nearest(chunk, raw_chunks, spans);
            interpolated_count += 1;
        } else {
            apply_overlaps(chunk, raw_chunks, spans, &overlapping, bbox_config);
        }

        finalize_for_source(chunk, source_kind, raw_chunks);
    }

    if interpolated_count > 0 {
        warn!(
            "metadata transfer: {}/{} chunks without overlap, interpolated from neighbors",
            interpolated_count,
            chunks.len()
        );
    }
    debug!("metadata transferred onto {} chunks", chunks.len());
}

fn apply_overlaps(
    chunk: &mut Chunk,
    raw_chunks: &[RawChunk],
    spans: &[MatchedSpan],
    overlapping: &[usize],
    bbox_config: &MatcherConfig,
) {
    // Pages : enveloppe min/max des recouvrements
    chunk.page_start = overlapping
        .iter()
        .filter_map(|&i| raw_chunks[i].page_start)
        .min();
    chunk.page_end = overlapping
        .iter()
        .filter_map(|&i| raw_chunks[i].page_end)
        .max();

    // Chemin de titres : plus long préfixe commun
    let paths: Vec<&Vec<String>> = overlapping.iter().map(|&i| &raw_chunks[i].heading_path).collect();
    chunk.heading_path = longest_common_prefix(&paths);

    // Bboxes : union fusionnée en rectangles de surlignage
    let union: Vec<_> = overlapping
        .iter()
        .flat_map(|&i| raw_chunks[i].bboxes.iter().copied())
        .collect();
    chunk.bboxes = merge_bbox_rectangles(&union, bbox_config);

    // Marqueur de section : premier non vide
    chunk.section_marker = overlapping
        .iter()
        .find_map(|&i| raw_chunks[i].heading_path.last().cloned());

    // Position du chunk : héritée du meilleur recouvrement
    let best = overlapping
        .iter()
        .max_by_key(|&&i| spans[i].confidence)
        .copied()
        .expect("non-empty overlaps");
    chunk.position_method = spans[best].method;
    chunk.position_confidence = spans[best].confidence;
    chunk.metadata_interpolated = false;

    // Confiance des métadonnées selon la meilleure position contributrice
    let best_confidence = overlapping
        .iter()
        .map(|&i| spans[i].confidence)
        .max()
        .expect("non-empty overlaps");
    chunk.metadata_confidence = match best_confidence {
        PositionConfidence::Exact => MetadataConfidence::High,
        PositionConfidence::High => MetadataConfidence::Medium,
        _ => MetadataConfidence::Low,
    };
}

fn interpolate_from_nearest(chunk: &mut Chunk, raw_chunks: &[RawChunk], spans: &[MatchedSpan]) {
    let center = chunk.start_offset + (chunk.end_offset - chunk.start_offset) / 2;
    let nearest = spans
        .iter()
        .enumerate()
        .min_by_key(|(_, span)| span.center().abs_diff(center))
        .map(|(i, _)| i);

    if let Some(i) = nearest {
        let raw = &raw_chunks[i];
        chunk.page_start = raw.page_start;
        chunk.page_end = raw.page_end;
        chunk.heading_path = raw.heading_path.clone();
        chunk.section_marker = raw.heading_path.last().cloned();
        chunk.bboxes = Vec::new();
    }
    chunk.metadata_interpolated = true;
    chunk.metadata_confidence = MetadataConfidence::Low;
    chunk.position_method = MatchMethod::Interpolation;
    chunk.position_confidence = PositionConfidence::Synthetic;
}

fn finalize_for_source(chunk: &mut Chunk, source_kind: SourceKind, raw_chunks: &[RawChunk]) {
    match source_kind {
        SourceKind::Epub => {
            // Pas de pages pour un EPUB, mais un marqueur de section toujours
            chunk.page_start = None;
            chunk.page_end = None;
            if chunk.section_marker.is_none() {
                chunk.section_marker = Some(format!("section-{}", chunk.chunk_index));
            }
        }
        SourceKind::Pdf => {
            // Jamais de page nulle pour un PDF
            if chunk.page_start.is_none() {
                let fallback = raw_chunks.iter().find_map(|r| r.page_start).unwrap_or(1);
                chunk.page_start = Some(fallback);
            }
            if chunk.page_end.is_none() {
                chunk.page_end = chunk.page_start;
            }
        }
        SourceKind::Markdown | SourceKind::Text => {}
    }
}

/// Plus long préfixe commun d'un ensemble de chemins de titres
fn longest_common_prefix(paths: &[&Vec<String>]) -> Vec<String> {
    let Some(first) = paths.first() else {
        return Vec::new();
    };
    let mut prefix: Vec<String> = (*first).clone();
    for path in &paths[1..] {
        let common = prefix
            .iter()
            .zip(path.iter())
            .take_while(|(a, b)| a == b)
            .count();
        prefix.truncate(common);
        if prefix.is_empty() {
            break;
        }
    }
    prefix
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::{BoundingBox, ChunkerKind};

    fn span(start: usize, end: usize, confidence: PositionConfidence) -> MatchedSpan {
        let method = match confidence {
            PositionConfidence::Exact => MatchMethod::Exact,
            PositionConfidence::High => MatchMethod::Embedding,
            PositionConfidence::Medium => MatchMethod::Llm,
            PositionConfidence::Synthetic => MatchMethod::Interpolation,
        };
        MatchedSpan {
            start,
            end,
            method,
            confidence,
            interpolated: confidence == PositionConfidence::Synthetic,
        }
    }

    fn raw(pages: (u32, u32), path: &[&str], span: (usize, usize)) -> RawChunk {
        RawChunk {
            content: "contenu".to_string(),
            page_start: Some(pages.0),
            page_end: Some(pages.1),
            heading_path: path.iter().map(|s| s.to_string()).collect(),
            bboxes: vec![BoundingBox {
                page: pages.0,
                x: 10.0,
                y: 50.0,
                width: 100.0,
                height: 12.0,
            }],
            char_span: span,
        }
    }

    fn chunk(index: usize, start: usize, end: usize) -> Chunk {
        Chunk::bare(index, "x".repeat(end - start), start, end, 4, ChunkerKind::Recursive)
    }

    #[test]
    fn test_overlap_transfers_pages_and_confidence() {
        let raw_chunks = vec![
            raw((3, 4), &["Chapitre", "Section A"], (0, 100)),
            raw((4, 6), &["Chapitre", "Section B"], (100, 200)),
        ];
        let spans = vec![
            span(0, 120, PositionConfidence::Exact),
            span(120, 240, PositionConfidence::High),
        ];
        let mut chunks = vec![chunk(0, 50, 200)];

        transfer_metadata(
            &mut chunks,
            &raw_chunks,
            &spans,
            SourceKind::Pdf,
            &MatcherConfig::default(),
        );

        let c = &chunks[0];
        assert_eq!(c.metadata_overlap_count, 2);
        assert_eq!(c.page_start, Some(3));
        assert_eq!(c.page_end, Some(6));
        assert_eq!(c.heading_path, vec!["Chapitre".to_string()]);
        assert_eq!(c.metadata_confidence, MetadataConfidence::High);
        assert_eq!(c.position_confidence, PositionConfidence::Exact);
        assert!(!c.metadata_interpolated);
        assert!(!c.bboxes.is_empty());
    }

    #[test]
    fn test_no_overlap_interpolates_from_nearest() {
        let raw_chunks = vec![
            raw((1, 2), &["Intro"], (0, 50)),
            raw((8, 9), &["Annexe"], (900, 1000)),
        ];
        let spans = vec![
            span(0, 50, PositionConfidence::Exact),
            span(900, 1000, PositionConfidence::Exact),
        ];
        // Chunk loin des deux spans, plus proche du second
        let mut chunks = vec![chunk(0, 600, 700)];

        transfer_metadata(
            &mut chunks,
            &raw_chunks,
            &spans,
            SourceKind::Pdf,
            &MatcherConfig::default(),
        );

        let c = &chunks[0];
        assert_eq!(c.metadata_overlap_count, 0);
        assert!(c.metadata_interpolated);
        assert_eq!(c.metadata_confidence, MetadataConfidence::Low);
        assert_eq!(c.page_start, Some(8));
        assert_eq!(c.heading_path, vec!["Annexe".to_string()]);
    }

    #[test]
    fn test_epub_clears_pages_and_sets_marker() {
        let raw_chunks = vec![raw((1, 1), &[], (0, 100))];
        let spans = vec![span(0, 100, PositionConfidence::Exact)];
        let mut chunks = vec![chunk(0, 0, 80)];

        transfer_metadata(
            &mut chunks,
            &raw_chunks,
            &spans,
            SourceKind::Epub,
            &MatcherConfig::default(),
        );

        let c = &chunks[0];
        assert_eq!(c.page_start, None);
        assert_eq!(c.page_end, None);
        assert_eq!(c.section_marker.as_deref(), Some("section-0"));
    }

    #[test]
    fn test_pdf_never_has_null_pages() {
        let mut no_pages = raw((1, 1), &["X"], (0, 100));
        no_pages.page_start = None;
        no_pages.page_end = None;
        let raw_chunks = vec![no_pages];
        let spans = vec![span(0, 100, PositionConfidence::Exact)];
        let mut chunks = vec![chunk(0, 0, 80)];

        transfer_metadata(
            &mut chunks,
            &raw_chunks,
            &spans,
            SourceKind::Pdf,
            &MatcherConfig::default(),
        );

        assert!(chunks[0].page_start.is_some());
        assert!(chunks[0].page_end.is_some());
    }

    #[test]
    fn test_longest_common_prefix() {
        let a = vec!["Chapitre".to_string(), "Section".to_string(), "Sous".to_string()];
        let b = vec!["Chapitre".to_string(), "Section".to_string(), "Autre".to_string()];
        let c = vec!["Chapitre".to_string()];
        assert_eq!(
            longest_common_prefix(&[&a, &b]),
            vec!["Chapitre".to_string(), "Section".to_string()]
        );
        assert_eq!(longest_common_prefix(&[&a, &b, &c]), vec!["Chapitre".to_string()]);
        let d: Vec<String> = Vec::new();
        assert!(longest_common_prefix(&[&a, &d]).is_empty());
    }

    #[test]
    fn test_zero_width_marker_counts_as_overlap() {
        let raw_chunks = vec![raw((2, 2), &["Milieu"], (0, 50))];
        let spans = vec![MatchedSpan {
            start: 40,
            end: 40,
            method: MatchMethod::Marker,
            confidence: PositionConfidence::Synthetic,
            interpolated: true,
        }];
        let mut chunks = vec![chunk(0, 0, 80)];

        transfer_metadata(
            &mut chunks,
            &raw_chunks,
            &spans,
            SourceKind::Pdf,
            &MatcherConfig::default(),
        );

        assert_eq!(chunks[0].metadata_overlap_count, 1);
        assert_eq!(chunks[0].page_start, Some(2));
    }
}
