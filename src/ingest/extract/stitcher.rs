// VELIN Extraction - Stitching des lots chevauchants
// Concaténation avec élimination de la zone partagée : exact → flou → séparateur

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::ingest::text::{char_boundaries, normalize_for_matching, similarity_ratio};

/// Configuration de la recherche de chevauchement
#[derive(Debug, Clone)]
pub struct StitchConfig {
    /// Longueur minimale d'un chevauchement acceptable (caractères normalisés)
    pub min_overlap_chars: usize,
    /// Borne haute de la fenêtre de recherche (caractères normalisés)
    pub max_overlap_chars: usize,
    /// Fraction du plus petit des deux lots considérée pour la fenêtre
    pub max_overlap_percent: f64,
    /// Ratio Levenshtein minimal pour accepter un chevauchement flou
    pub fuzzy_threshold: f64,
    /// Pas d'échantillonnage des longueurs candidates en passe floue
    pub fuzzy_stride: usize,
    /// Séparateur inséré quand aucun chevauchement n'est trouvé
    pub separator: String,
}

impl Default for StitchConfig {
    fn default() -> Self {
        Self {
            min_overlap_chars: 10,
            max_overlap_chars: 2_000,
            max_overlap_percent: 0.8,
            fuzzy_threshold: 0.80,
            fuzzy_stride: 8,
            separator: "\n\n---\n\n".to_string(),
        }
    }
}

/// Méthode ayant résolu un couple de lots adjacents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StitchMethod {
    Exact,
    Fuzzy,
    None,
}

/// Rapport de stitching pour un couple `(lot i, lot i+1)`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StitchReport {
    pub pair_index: usize,
    pub method: StitchMethod,
    pub confidence: f64,
    /// Longueur du chevauchement retenu (caractères normalisés)
    pub overlap_chars: usize,
}

/// Markdown canonique issu du stitching, avec re-basage des lots
#[derive(Debug, Clone)]
pub struct StitchedMarkdown {
    pub text: String,
    pub reports: Vec<StitchReport>,
    /// Par lot : (offset du contenu conservé dans `text`, bytes tronqués en tête)
    pub batch_offsets: Vec<(usize, usize)>,
}

/// Concatène les markdowns de lots ordonnés en éliminant la zone partagée.
///
/// La normalisation ne s'applique qu'au scratch de matching : le texte stocké
/// reste celui des lots, coupé à des frontières brutes via la correspondance
/// inverse des offsets. L'ordre d'origine est préservé ; le contenu hors
/// fenêtre n'est jamais dédupliqué.
pub fn stitch(batches: &[String], config: &StitchConfig) -> StitchedMarkdown {
    let mut text = String::new();
    let mut reports = Vec::new();
    let mut batch_offsets = Vec::with_capacity(batches.len());

    let mut prev_norm: Option<Vec<usize>> = None; // frontières chars du lot précédent normalisé
    let mut prev_text = String::new();

    for (i, batch) in batches.iter().enumerate() {
        let view = normalize_for_matching(batch);
        let bounds = char_boundaries(&view.text);

        if i == 0 {
            batch_offsets.push((0, 0));
            text.push_str(batch);
            prev_norm = Some(bounds);
            prev_text = view.text;
            continue;
        }

        let prev_bounds = prev_norm.take().unwrap_or_else(|| char_boundaries(""));
        let outcome = find_overlap(&prev_text, &prev_bounds, &view.text, &bounds, config);

        let (skip_chars, method, confidence) = match outcome {
            Some((chars, method, confidence)) => (chars, method, confidence),
            None => (0, StitchMethod::None, 0.0),
        };

        let cut_raw = if skip_chars > 0 {
            view.raw_offset(bounds[skip_chars])
        } else {
            0
        };

        match method {
            StitchMethod::Exact => debug!(
                "stitch pair {}: exact overlap of {} chars",
                i - 1,
                skip_chars
            ),
            StitchMethod::Fuzzy => debug!(
                "stitch pair {}: fuzzy overlap of {} chars (ratio {:.3})",
                i - 1,
                skip_chars,
                confidence
            ),
            StitchMethod::None => warn!(
                "stitch pair {}: no overlap found, joining with separator",
                i - 1
            ),
        }

        if method == StitchMethod::None {
            text.push_str(&config.separator);
        }
        let kept_at = text.len();
        text.push_str(&batch[cut_raw..]);
        batch_offsets.push((kept_at, cut_raw));

        reports.push(StitchReport {
            pair_index: i - 1,
            method,
            confidence,
            overlap_chars: skip_chars,
        });

        prev_norm = Some(bounds);
        prev_text = view.text;
    }

    info!(
        "stitched {} batches into {} bytes ({} separator joins)",
        batches.len(),
        text.len(),
        reports
            .iter()
            .filter(|r| r.method == StitchMethod::None)
            .count()
    );

    StitchedMarkdown {
        text,
        reports,
        batch_offsets,
    }
}

/// Cherche le chevauchement entre la queue de A et la tête de B (normalisés).
/// Retourne (longueur en caractères, méthode, confiance).
fn find_overlap(
    a_text: &str,
    a_bounds: &[usize],
    b_text: &str,
    b_bounds: &[usize],
    config: &StitchConfig,
) -> Option<(usize, StitchMethod, f64)> {
    let a_len = a_bounds.len().saturating_sub(1);
    let b_len = b_bounds.len().saturating_sub(1);
    if a_len == 0 || b_len == 0 {
        return None;
    }

    let window = config
        .max_overlap_chars
        .min((config.max_overlap_percent * a_len.min(b_len) as f64).floor() as usize)
        .min(a_len)
        .min(b_len);
    if window < config.min_overlap_chars {
        return None;
    }

    // Passe exacte : plus long suffixe de A égal à un préfixe de B
    for k in (config.min_overlap_chars..=window).rev() {
        let a_slice = &a_text[a_bounds[a_len - k]..];
        let b_slice = &b_text[..b_bounds[k]];
        if a_slice == b_slice {
            return Some((k, StitchMethod::Exact, 1.0));
        }
    }

    // Passe floue : meilleure longueur candidate au ratio Levenshtein
    let mut best: Option<(usize, f64)> = None;
    let mut k = window;
    loop {
        let a_slice = &a_text[a_bounds[a_len - k]..];
        let b_slice = &b_text[..b_bounds[k]];
        let ratio = similarity_ratio(a_slice, b_slice);
        if best.map_or(true, |(_, b)| ratio > b) {
            best = Some((k, ratio));
        }
        if k <= config.min_overlap_chars {
            break;
        }
        k = k
            .saturating_sub(config.fuzzy_stride.max(1))
            .max(config.min_overlap_chars);
    }

    match best {
        Some((k, ratio)) if ratio >= config.fuzzy_threshold => {
            Some((k, StitchMethod::Fuzzy, ratio))
        }
        _ => None,
    }
}
