// VELIN Texte - Similarité caractère et recherche fenêtrée
// Ratio Levenshtein (strsim) + scan de fenêtres glissantes sur texte normalisé

use std::ops::Range;

/// Ratio de similarité caractère dans [0, 1] (1.0 = identiques).
pub fn similarity_ratio(a: &str, b: &str) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    strsim::normalized_levenshtein(a, b)
}

/// Similarité cosinus entre deux vecteurs d'embedding.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Résultat d'une recherche de fenêtre
#[derive(Debug, Clone)]
pub struct WindowMatch {
    /// Intervalle byte dans le haystack (borné aux frontières de caractères)
    pub range: Range<usize>,
    pub ratio: f64,
    /// La fenêtre gagnante est-elle la seule au-dessus du seuil ?
    pub unique: bool,
}

/// Occurrences exactes d'un motif dans un texte. Retourne les offsets byte.
pub fn exact_occurrences(haystack: &str, needle: &str) -> Vec<usize> {
    if needle.is_empty() {
        return Vec::new();
    }
    haystack.match_indices(needle).map(|(i, _)| i).collect()
}

/// Recherche la fenêtre la plus similaire au motif dans le haystack.
///
/// Le scan glisse une fenêtre de la taille du motif (en caractères) avec un
/// pas proportionnel, puis affine autour du meilleur candidat au pas de 1.
/// Les motifs très longs sont écartés : le coût Levenshtein est quadratique
/// et les couches suivantes du matcher prennent le relai.
pub fn find_best_window(haystack: &str, needle: &str, min_ratio: f64) -> Option<WindowMatch> {
    const MAX_NEEDLE_CHARS: usize = 2_000;

    let needle_chars: Vec<usize> = char_boundaries(needle);
    let needle_len = needle_chars.len().saturating_sub(1);
    if needle_len == 0 || needle_len > MAX_NEEDLE_CHARS {
        return None;
    }

    let bounds = char_boundaries(haystack);
    let hay_len = bounds.len().saturating_sub(1);
    if hay_len < needle_len {
        let ratio = similarity_ratio(haystack, needle);
        if ratio >= min_ratio {
            return Some(WindowMatch {
                range: 0..haystack.len(),
                ratio,
                unique: true,
            });
        }
        return None;
    }

    let stride = (needle_len / 10).max(1);
    let coarse = scan_windows(haystack, needle, &bounds, needle_len, 0, hay_len, stride);
    let (coarse_start, _) = coarse?;

    // Affinage au pas de 1 autour du meilleur candidat grossier
    let lo = coarse_start.saturating_sub(stride);
    let hi = (coarse_start + stride).min(hay_len - needle_len);
    let (best_start, best_ratio) = scan_windows(haystack, needle, &bounds, needle_len, lo, hi + needle_len, 1)?;

    if best_ratio < min_ratio {
        return None;
    }

    // Unicité : une seconde fenêtre disjointe au-dessus du seuil ?
    let mut unique = true;
    let mut pos = 0usize;
    while pos + needle_len <= hay_len {
        if pos + needle_len <= best_start || pos >= best_start + needle_len {
            let slice = &haystack[bounds[pos]..bounds[pos + needle_len]];
            if similarity_ratio(slice, needle) >= min_ratio {
                unique = false;
                break;
            }
        }
        pos += stride.max(needle_len / 2).max(1);
    }

    Some(WindowMatch {
        range: bounds[best_start]..bounds[best_start + needle_len],
        ratio: best_ratio,
        unique,
    })
}

fn scan_windows(
    haystack: &str,
    needle: &str,
    bounds: &[usize],
    needle_len: usize,
    from: usize,
    to: usize,
    stride: usize,
) -> Option<(usize, f64)> {
    let hay_len = bounds.len().saturating_sub(1);
    let last_start = to.min(hay_len).checked_sub(needle_len)?;
    let mut best: Option<(usize, f64)> = None;
    let mut pos = from.min(last_start);
    loop {
        let slice = &haystack[bounds[pos]..bounds[pos + needle_len]];
        let ratio = similarity_ratio(slice, needle);
        if best.map_or(true, |(_, b)| ratio > b) {
            best = Some((pos, ratio));
        }
        if pos >= last_start {
            break;
        }
        pos = (pos + stride).min(last_start);
    }
    best
}

/// Offsets byte de chaque frontière de caractère, avec sentinelle finale.
pub fn char_boundaries(s: &str) -> Vec<usize> {
    let mut bounds: Vec<usize> = s.char_indices().map(|(i, _)| i).collect();
    bounds.push(s.len());
    bounds
}
