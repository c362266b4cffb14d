// VELIN Texte - Outils texte partagés par le pipeline
// Normalisation de matching, nettoyage OCR, similarité

pub mod normalizer;
pub mod similarity;

pub use normalizer::{clean_ocr_artifacts, normalize_for_matching, CleanupStats, NormalizedView};
pub use similarity::{
    char_boundaries, cosine_similarity, exact_occurrences, find_best_window, similarity_ratio,
    WindowMatch,
};
