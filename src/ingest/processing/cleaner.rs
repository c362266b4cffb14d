// VELIN Traitement - Nettoyage du markdown extrait
// Passage par modèle local par parties, repli règles préservant le texte

use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::ingest::model::{unwrap_markdown_fences, GenerateOptions, ModelClient};
use crate::ingest::text::clean_ocr_artifacts;
use crate::ingest::{CleanedMarkdown, IngestResult, UnicodeForm};

/// Configuration du cleaner
#[derive(Debug, Clone)]
pub struct CleanerConfig {
    /// Nettoyage par modèle activé ; sinon repli règles directement
    pub use_model: bool,
    pub model: String,
    /// Taille maximale d'une partie envoyée au modèle
    pub max_part_chars: usize,
    /// NFC appliqué par le repli règles (PDF OCR lourds)
    pub unicode_normalization: UnicodeForm,
}

impl Default for CleanerConfig {
    fn default() -> Self {
        Self {
            use_model: true,
            model: "llama3.1:8b".to_string(),
            max_part_chars: 12_000,
            unicode_normalization: UnicodeForm::None,
        }
    }
}

const CLEANUP_PROMPT: &str = "Tu corriges un markdown extrait d'un document scanné. \
Corrige les artefacts OCR évidents, les césures et la ponctuation cassée sans \
reformuler, sans résumer, sans ajouter ni retirer de contenu. Conserve tous les \
titres markdown. Rends uniquement le markdown corrigé.";

static ATX_HEADING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^#{1,6}\s+").expect("heading regex"));

/// Cleaner : découpe aux frontières de titres, passe chaque partie au modèle,
/// reconcatène. Tout échec modèle bascule la partie sur le repli règles, qui
/// préserve le texte exactement (whitespace et artefacts OCR mis à part).
/// Idempotent à whitespace près.
pub struct Cleaner {
    model: Option<Arc<dyn ModelClient>>,
    config: CleanerConfig,
}

impl Cleaner {
    pub fn new(model: Option<Arc<dyn ModelClient>>, config: CleanerConfig) -> Self {
        Self { model, config }
    }

    /// Produit le flux nettoyé, référence des offsets pour toute la suite
    pub async fn clean(&self, markdown: &str) -> IngestResult<CleanedMarkdown> {
        if markdown.trim().is_empty() {
            return Ok(CleanedMarkdown::new(String::new()));
        }

        let parts = split_at_headings(markdown, self.config.max_part_chars);
        debug!("cleaner: {} parts of at most {} chars", parts.len(), self.config.max_part_chars);

        let mut cleaned_parts: Vec<String> = Vec::with_capacity(parts.len());
        let mut fallback_count = 0usize;

        for (i, part) in parts.iter().enumerate() {
            let cleaned = match (&self.model, self.config.use_model) {
                (Some(model), true) => {
                    match self.clean_part_with_model(model.as_ref(), part).await {
                        Ok(text) => text,
                        Err(err) => {
                            warn!("cleanup of part {} failed ({}), using rule-based fallback", i, err);
                            fallback_count += 1;
                            self.rule_based(part)
                        }
                    }
                }
                _ => self.rule_based(part),
            };
            cleaned_parts.push(cleaned);
        }

        let text = cleaned_parts.join("\n\n");
        // Le repli règles lisse la jointure pour garder l'idempotence
        let (text, _) = clean_ocr_artifacts(&text, false);

        if fallback_count > 0 {
            info!(
                "🧹 cleanup done with {}/{} parts on rule-based fallback",
                fallback_count,
                parts.len()
            );
        }
        Ok(CleanedMarkdown::new(text))
    }

    async fn clean_part_with_model(
        &self,
        model: &dyn ModelClient,
        part: &str,
    ) -> Result<String, crate::ingest::model::ModelError> {
        let options = GenerateOptions {
            model: self.config.model.clone(),
            temperature: 0.0,
            max_tokens: None,
        };
        let prompt = format!("{CLEANUP_PROMPT}\n\n---\n\n{part}");
        let response = model.generate(&prompt, &options).await?;
        let unwrapped = unwrap_markdown_fences(&response);

        // Garde-fou : une réponse vide ou effondrée signifie un modèle parti
        // en résumé ; la partie repart au repli règles
        if unwrapped.trim().len() * 2 < part.trim().len() {
            return Err(crate::ingest::model::ModelError::InvalidResponse(
                "cleaned part collapsed below half of input".to_string(),
            ));
        }
        Ok(unwrapped.to_string())
    }

    /// Repli règles : préserve le texte, normalise le whitespace, corrige
    /// les artefacts OCR évidents
    pub fn rule_based(&self, text: &str) -> String {
        let apply_nfc = !matches!(self.config.unicode_normalization, UnicodeForm::None);
        let (cleaned, _stats) = clean_ocr_artifacts(text, apply_nfc);
        cleaned
    }
}

/// Découpe un markdown en parties bornées, aux frontières de titres quand
/// c'est possible, aux paragraphes sinon. L'ordre et le contenu sont préservés.
pub fn split_at_headings(markdown: &str, max_part_chars: usize) -> Vec<String> {
    if markdown.len() <= max_part_chars {
        return vec![markdown.to_string()];
    }

    // Sections délimitées par les titres
    let mut boundaries: Vec<usize> = ATX_HEADING.find_iter(markdown).map(|m| m.start()).collect();
    if boundaries.first() != Some(&0) {
        boundaries.insert(0, 0);
    }
    boundaries.push(markdown.len());

    let mut parts = Vec::new();
    let mut current_start = boundaries[0];
    let mut current_end = boundaries[0];

    for window in boundaries.windows(2) {
        let (section_start, section_end) = (window[0], window[1]);
        let section_len = section_end - section_start;

        if section_len > max_part_chars {
            // Section seule trop grande : flush puis découpe aux paragraphes
            if current_end > current_start {
                parts.push(markdown[current_start..current_end].to_string());
            }
            split_oversized(&markdown[section_start..section_end], max_part_chars, &mut parts);
            current_start = section_end;
            current_end = section_end;
            continue;
        }

        if section_end - current_start > max_part_chars && current_end > current_start {
            parts.push(markdown[current_start..current_end].to_string());
            current_start = section_start;
        }
        current_end = section_end;
    }
    if current_end > current_start {
        parts.push(markdown[current_start..current_end].to_string());
    }

    parts.retain(|p| !p.trim().is_empty());
    parts
}

fn split_oversized(section: &str, max_part_chars: usize, parts: &mut Vec<String>) {
    let mut cursor = 0usize;
    while cursor < section.len() {
        let target = (cursor + max_part_chars).min(section.len());
        let mut cut = section[cursor..target]
            .rfind("\n\n")
            .map(|i| cursor + i + 2)
            .unwrap_or(target);
        if cut <= cursor {
            cut = target;
        }
        while cut < section.len() && !section.is_char_boundary(cut) {
            cut += 1;
        }
        parts.push(section[cursor..cut].to_string());
        cursor = cut;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::Value;

    use crate::ingest::model::ModelError;

    struct EchoModel;

    #[async_trait]
    impl ModelClient for EchoModel {
        async fn generate(
            &self,
            prompt: &str,
            _options: &GenerateOptions,
        ) -> Result<String, ModelError> {
            // Rend la partie telle quelle (après le cadre du prompt)
            let part = prompt.split("\n\n---\n\n").nth(1).unwrap_or("");
            Ok(format!("```markdown\n{part}\n```"))
        }

        async fn generate_structured(
            &self,
            _prompt: &str,
            _schema: &Value,
            _options: &GenerateOptions,
        ) -> Result<Value, ModelError> {
            Err(ModelError::InvalidResponse("unused".to_string()))
        }

        async fn embed(&self, _text: &str, _model: &str) -> Result<Vec<f32>, ModelError> {
            Err(ModelError::InvalidResponse("unused".to_string()))
        }
    }

    struct FailingModel;

    #[async_trait]
    impl ModelClient for FailingModel {
        async fn generate(
            &self,
            _prompt: &str,
            _options: &GenerateOptions,
        ) -> Result<String, ModelError> {
            Err(ModelError::Request("model server out of memory".to_string()))
        }

        async fn generate_structured(
            &self,
            _prompt: &str,
            _schema: &Value,
            _options: &GenerateOptions,
        ) -> Result<Value, ModelError> {
            Err(ModelError::InvalidResponse("unused".to_string()))
        }

        async fn embed(&self, _text: &str, _model: &str) -> Result<Vec<f32>, ModelError> {
            Err(ModelError::InvalidResponse("unused".to_string()))
        }
    }

    #[tokio::test]
    async fn test_clean_unwraps_fences_and_hashes() {
        let cleaner = Cleaner::new(Some(Arc::new(EchoModel)), CleanerConfig::default());
        let out = cleaner.clean("# Titre\n\ncontenu du document").await.unwrap();
        assert!(out.text.contains("# Titre"));
        assert!(!out.text.contains("```"));
        assert_eq!(out.sha256.len(), 64);
    }

    #[tokio::test]
    async fn test_model_failure_falls_back_to_rules() {
        let cleaner = Cleaner::new(Some(Arc::new(FailingModel)), CleanerConfig::default());
        let out = cleaner.clean("texte avec eﬃcacité et arte-\nfacts").await.unwrap();
        // Le repli règles a corrigé ligature et césure sans perdre le texte
        assert!(out.text.contains("efficacité"));
        assert!(out.text.contains("artefacts"));
    }

    #[tokio::test]
    async fn test_clean_idempotent() {
        let cleaner = Cleaner::new(None, CleanerConfig::default());
        let input = "para un  avec espaces\n\n\n\npara deux-\ncoupé et ﬁn";
        let once = cleaner.clean(input).await.unwrap();
        let twice = cleaner.clean(&once.text).await.unwrap();
        assert_eq!(once.text, twice.text);
        assert_eq!(once.sha256, twice.sha256);
    }

    #[tokio::test]
    async fn test_empty_input() {
        let cleaner = Cleaner::new(None, CleanerConfig::default());
        let out = cleaner.clean("   \n  ").await.unwrap();
        assert!(out.text.is_empty());
    }

    #[test]
    fn test_split_small_is_single_part() {
        let parts = split_at_headings("# A\ncourt", 1_000);
        assert_eq!(parts.len(), 1);
    }

    #[test]
    fn test_split_respects_heading_boundaries() {
        let mut doc = String::new();
        for i in 0..10 {
            doc.push_str(&format!("# Section {i}\n{}\n\n", "x".repeat(300)));
        }
        let parts = split_at_headings(&doc, 1_000);
        assert!(parts.len() > 1);
        // Chaque partie (sauf la première éventuelle) commence sur un titre
        for part in &parts {
            assert!(part.starts_with("# Section"), "part mal alignée: {:?}", &part[..20.min(part.len())]);
        }
        // Rien de perdu
        let rejoined: String = parts.concat();
        assert_eq!(rejoined.len(), doc.len());
    }

    #[test]
    fn test_split_oversized_section() {
        let doc = format!("# Grande\n{}", "mot ".repeat(2_000));
        let parts = split_at_headings(&doc, 1_000);
        assert!(parts.len() > 1);
        assert!(parts.iter().all(|p| p.len() <= 1_100));
    }
}
