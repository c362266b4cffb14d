// VELIN Texte - Normalisation pour matching et nettoyage OCR
// Règles uniques partagées par le stitcher, le matcher et le cleaner fallback

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, trace};
use unicode_normalization::UnicodeNormalization;

/// Vue normalisée d'un texte brut avec correspondance inverse des offsets.
///
/// La normalisation ne sert qu'au matching : le texte stocké n'est jamais
/// modifié. Chaque byte du texte normalisé connaît l'offset byte du caractère
/// source dans le texte brut.
#[derive(Debug, Clone)]
pub struct NormalizedView {
    /// Texte normalisé (scratch de matching)
    pub text: String,
    /// offsets[i] = offset byte dans le texte brut du caractère qui a produit
    /// le byte normalisé i
    offsets: Vec<usize>,
    /// Longueur byte du texte brut
    raw_len: usize,
}

impl NormalizedView {
    /// Offset brut correspondant à un offset du texte normalisé.
    /// Un offset de fin (== len) est projeté sur la fin du texte brut.
    pub fn raw_offset(&self, norm_offset: usize) -> usize {
        if norm_offset >= self.offsets.len() {
            self.raw_len
        } else {
            self.offsets[norm_offset]
        }
    }

    pub fn len(&self) -> usize {
        self.text.len()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

/// Normalise un texte pour le matching (jamais pour le stockage) :
/// - CRLF → LF (et CR isolé → LF)
/// - espaces en fin de ligne supprimés
/// - runs de 3+ newlines réduits à 2
/// - runs de 2+ espaces/tabs intra-ligne réduits à 1 espace
pub fn normalize_for_matching(raw: &str) -> NormalizedView {
    // 1. CRLF → LF avec conservation des offsets d'origine
    let mut chars: Vec<(char, usize)> = Vec::with_capacity(raw.len());
    let mut iter = raw.char_indices().peekable();
    while let Some((idx, ch)) = iter.next() {
        if ch == '\r' {
            if matches!(iter.peek(), Some((_, '\n'))) {
                continue; // le \n qui suit porte l'offset
            }
            chars.push(('\n', idx));
        } else {
            chars.push((ch, idx));
        }
    }

    // 2. Suppression des espaces/tabs en fin de ligne
    let mut stripped: Vec<(char, usize)> = Vec::with_capacity(chars.len());
    let mut pending_ws: Vec<(char, usize)> = Vec::new();
    for &(ch, idx) in &chars {
        match ch {
            ' ' | '\t' => pending_ws.push((ch, idx)),
            '\n' => {
                pending_ws.clear();
                stripped.push(('\n', idx));
            }
            _ => {
                stripped.append(&mut pending_ws);
                stripped.push((ch, idx));
            }
        }
    }
    // espaces en fin de texte : traités comme fin de ligne
    drop(pending_ws);

    // 3. Réduction des runs de newlines (3+ → 2) et d'espaces (2+ → 1)
    let mut text = String::with_capacity(stripped.len());
    let mut offsets = Vec::with_capacity(stripped.len());
    let mut newline_run = 0usize;
    let mut space_run = 0usize;
    for &(ch, idx) in &stripped {
        match ch {
            '\n' => {
                space_run = 0;
                newline_run += 1;
                if newline_run <= 2 {
                    push_char(&mut text, &mut offsets, '\n', idx);
                }
            }
            ' ' | '\t' => {
                newline_run = 0;
                space_run += 1;
                if space_run == 1 {
                    push_char(&mut text, &mut offsets, ' ', idx);
                }
            }
            _ => {
                newline_run = 0;
                space_run = 0;
                push_char(&mut text, &mut offsets, ch, idx);
            }
        }
    }

    trace!(
        "normalize_for_matching: {} bytes -> {} bytes",
        raw.len(),
        text.len()
    );

    NormalizedView {
        text,
        offsets,
        raw_len: raw.len(),
    }
}

fn push_char(text: &mut String, offsets: &mut Vec<usize>, ch: char, raw_idx: usize) {
    let before = text.len();
    text.push(ch);
    for _ in before..text.len() {
        offsets.push(raw_idx);
    }
}

// === Nettoyage règles (fallback du cleaner) ===

/// Table des ligatures typographiques rencontrées dans les PDF académiques
const LIGATURES: &[(&str, &str)] = &[
    ("ﬁ", "fi"),
    ("ﬂ", "fl"),
    ("ﬀ", "ff"),
    ("ﬃ", "ffi"),
    ("ﬄ", "ffl"),
    ("ﬆ", "st"),
];

static SOFT_HYPHEN_BREAK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\p{L})[-\u{00AD}]\n(\p{L})").expect("soft hyphen regex"));
static MULTI_BLANK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\n{3,}").expect("multi blank regex"));

/// Statistiques du nettoyage règles, exportées dans le manifest
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct CleanupStats {
    pub chars_before: usize,
    pub chars_after: usize,
    pub ligatures: usize,
    pub nbsp_removed: usize,
    pub zero_width_removed: usize,
    pub hyphen_joins: usize,
    pub nfc_applied: bool,
}

impl CleanupStats {
    pub fn total_changes(&self) -> usize {
        self.ligatures + self.nbsp_removed + self.zero_width_removed + self.hyphen_joins
    }
}

/// Nettoyage d'artefacts OCR préservant le texte : ligatures, césures,
/// NBSP, caractères zero-width, whitespace. Idempotent.
pub fn clean_ocr_artifacts(text: &str, apply_nfc: bool) -> (String, CleanupStats) {
    let mut stats = CleanupStats {
        chars_before: text.chars().count(),
        nfc_applied: apply_nfc,
        ..Default::default()
    };

    let mut cleaned = text.to_string();

    // Ligatures typographiques
    for (ligature, replacement) in LIGATURES {
        let count = cleaned.matches(ligature).count();
        if count > 0 {
            stats.ligatures += count;
            cleaned = cleaned.replace(ligature, replacement);
        }
    }

    // NBSP → espace simple
    let nbsp_count = cleaned.matches('\u{00A0}').count();
    if nbsp_count > 0 {
        stats.nbsp_removed = nbsp_count;
        cleaned = cleaned.replace('\u{00A0}', " ");
    }

    // Caractères zero-width (ZWSP, ZWNJ, ZWJ, BOM)
    for zw in ['\u{200B}', '\u{200C}', '\u{200D}', '\u{FEFF}'] {
        let count = cleaned.matches(zw).count();
        if count > 0 {
            stats.zero_width_removed += count;
            cleaned = cleaned.replace(zw, "");
        }
    }

    // Césures en fin de ligne : "infor-\nmation" → "information"
    let mut joins = 0usize;
    cleaned = SOFT_HYPHEN_BREAK
        .replace_all(&cleaned, |caps: &regex::Captures| {
            joins += 1;
            format!("{}{}", &caps[1], &caps[2])
        })
        .into_owned();
    stats.hyphen_joins = joins;

    // Whitespace : mêmes règles que le matching, appliquées au texte stocké
    // uniquement dans ce chemin de nettoyage
    let view = normalize_for_matching(&cleaned);
    cleaned = view.text;
    cleaned = MULTI_BLANK.replace_all(&cleaned, "\n\n").into_owned();

    // NFC optionnel pour les PDF OCR lourds (choix consigné au document)
    if apply_nfc {
        cleaned = cleaned.nfc().collect();
    }

    stats.chars_after = cleaned.chars().count();
    if stats.total_changes() > 0 {
        debug!(
            "clean_ocr_artifacts: {} changes (lig={}, nbsp={}, zw={}, hyph={})",
            stats.total_changes(),
            stats.ligatures,
            stats.nbsp_removed,
            stats.zero_width_removed,
            stats.hyphen_joins
        );
    }

    (cleaned, stats)
}
