// VELIN Traitement - Enrichissement sémantique par chunk
// Extraction structurée : thèmes, concepts, importance, tonalité, domaine

use futures::future::join_all;
use once_cell::sync::Lazy;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::ingest::model::{GenerateOptions, ModelClient, ModelError};
use crate::ingest::{Chunk, ChunkEnrichment, UnitError, UnitRef};

/// Configuration de l'enricher
#[derive(Debug, Clone)]
pub struct EnricherConfig {
    pub model: String,
    /// Chunks enrichis en parallèle
    pub max_concurrent: usize,
    /// Contenu tronqué au-delà (borne le prompt)
    pub max_chunk_chars: usize,
}

impl Default for EnricherConfig {
    fn default() -> Self {
        Self {
            model: "llama3.1:8b".to_string(),
            max_concurrent: 4,
            max_chunk_chars: 8_000,
        }
    }
}

/// Schéma déclaré de la sortie structurée d'enrichissement
pub static ENRICHMENT_SCHEMA: Lazy<Value> = Lazy::new(|| {
    json!({
        "type": "object",
        "required": ["themes", "concepts", "importance"],
        "properties": {
            "themes": {
                "type": "array",
                "minItems": 1,
                "maxItems": 5,
                "items": {"type": "string"}
            },
            "concepts": {
                "type": "array",
                "items": {
                    "type": "object",
                    "required": ["text", "importance"],
                    "properties": {
                        "text": {"type": "string"},
                        "importance": {"type": "number", "minimum": 0.0, "maximum": 1.0}
                    }
                }
            },
            "importance": {"type": "number", "minimum": 0.0, "maximum": 1.0},
            "summary": {"type": "string"},
            "emotional": {
                "type": "object",
                "required": ["polarity", "primary_emotion", "intensity"],
                "properties": {
                    "polarity": {"type": "number", "minimum": -1.0, "maximum": 1.0},
                    "primary_emotion": {"type": "string"},
                    "intensity": {"type": "number", "minimum": 0.0, "maximum": 1.0}
                }
            },
            "domain": {
                "type": "object",
                "required": ["primary_domain", "confidence"],
                "properties": {
                    "primary_domain": {"type": "string"},
                    "confidence": {"type": "number", "minimum": 0.0, "maximum": 1.0}
                }
            }
        }
    })
});

const ENRICH_PROMPT: &str = "Analyse ce passage et extrais : les thèmes (1 à 5), \
les concepts avec leur importance, l'importance globale du passage, un résumé \
court optionnel, la tonalité émotionnelle et le domaine de connaissance dominant.";

/// Enricher : extraction structurée par chunk, en parallèle borné. Un échec
/// sur un chunk laisse des métadonnées vides et n'arrête jamais le lot.
pub struct Enricher {
    model: Arc<dyn ModelClient>,
    config: EnricherConfig,
}

impl Enricher {
    pub fn new(model: Arc<dyn ModelClient>, config: EnricherConfig) -> Self {
        Self { model, config }
    }

    /// Enrichit tous les chunks en place ; retourne les erreurs par chunk
    pub async fn enrich_all(&self, chunks: &mut [Chunk]) -> Vec<UnitError> {
        if chunks.is_empty() {
            return Vec::new();
        }

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent.max(1)));
        let tasks = chunks.iter().enumerate().map(|(i, chunk)| {
            let semaphore = Arc::clone(&semaphore);
            let content = truncate_chars(&chunk.content, self.config.max_chunk_chars);
            async move {
                let _permit = semaphore.acquire().await.expect("semaphore closed");
                (i, self.enrich_one(&content).await)
            }
        });

        let mut errors = Vec::new();
        for (i, outcome) in join_all(tasks).await {
            match outcome {
                Ok(enrichment) => chunks[i].enrichment = enrichment,
                Err(err) => {
                    warn!("enrichment of chunk {} failed: {}", i, err);
                    chunks[i].enrichment = ChunkEnrichment::default();
                    errors.push(UnitError {
                        unit: UnitRef::Chunk(i),
                        message: err.to_string(),
                    });
                }
            }
        }

        info!(
            "🏷️ enriched {}/{} chunks",
            chunks.len() - errors.len(),
            chunks.len()
        );
        errors
    }

    async fn enrich_one(&self, content: &str) -> Result<ChunkEnrichment, ModelError> {
        let prompt = format!("{ENRICH_PROMPT}\n\n---\n\n{content}");
        let options = GenerateOptions {
            model: self.config.model.clone(),
            temperature: 0.2,
            max_tokens: None,
        };
        let value = self
            .model
            .generate_structured(&prompt, &ENRICHMENT_SCHEMA, &options)
            .await?;
        let mut enrichment: ChunkEnrichment = serde_json::from_value(value)
            .map_err(|e| ModelError::InvalidResponse(e.to_string()))?;
        clamp_enrichment(&mut enrichment);
        debug!("enriched chunk: {} themes", enrichment.themes.len());
        Ok(enrichment)
    }
}

/// Ramène toutes les grandeurs dans leurs bornes déclarées
pub fn clamp_enrichment(enrichment: &mut ChunkEnrichment) {
    enrichment.importance = enrichment.importance.clamp(0.0, 1.0);
    enrichment.themes.truncate(5);
    for concept in &mut enrichment.concepts {
        concept.importance = concept.importance.clamp(0.0, 1.0);
    }
    if let Some(emotional) = &mut enrichment.emotional {
        emotional.polarity = emotional.polarity.clamp(-1.0, 1.0);
        emotional.intensity = emotional.intensity.clamp(0.0, 1.0);
    }
    if let Some(domain) = &mut enrichment.domain {
        domain.confidence = domain.confidence.clamp(0.0, 1.0);
    }
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    text.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::model::validate_against_schema;
    use crate::ingest::ChunkerKind;
    use async_trait::async_trait;

    struct FixedModel {
        value: Value,
    }

    #[async_trait]
    impl ModelClient for FixedModel {
        async fn generate(
            &self,
            _prompt: &str,
            _options: &GenerateOptions,
        ) -> Result<String, ModelError> {
            Ok(String::new())
        }

        async fn generate_structured(
            &self,
            _prompt: &str,
            schema: &Value,
            _options: &GenerateOptions,
        ) -> Result<Value, ModelError> {
            validate_against_schema(&self.value, schema, "$")?;
            Ok(self.value.clone())
        }

        async fn embed(&self, _text: &str, _model: &str) -> Result<Vec<f32>, ModelError> {
            Err(ModelError::InvalidResponse("unused".to_string()))
        }
    }

    struct BrokenModel;

    #[async_trait]
    impl ModelClient for BrokenModel {
        async fn generate(
            &self,
            _prompt: &str,
            _options: &GenerateOptions,
        ) -> Result<String, ModelError> {
            Err(ModelError::Request("down".to_string()))
        }

        async fn generate_structured(
            &self,
            _prompt: &str,
            _schema: &Value,
            _options: &GenerateOptions,
        ) -> Result<Value, ModelError> {
            Err(ModelError::Request("down".to_string()))
        }

        async fn embed(&self, _text: &str, _model: &str) -> Result<Vec<f32>, ModelError> {
            Err(ModelError::Request("down".to_string()))
        }
    }

    fn chunks(n: usize) -> Vec<Chunk> {
        (0..n)
            .map(|i| {
                Chunk::bare(
                    i,
                    format!("Contenu du chunk numéro {i} avec du texte."),
                    i * 100,
                    i * 100 + 40,
                    10,
                    ChunkerKind::Recursive,
                )
            })
            .collect()
    }

    #[tokio::test]
    async fn test_enrich_all_fills_metadata() {
        let value = json!({
            "themes": ["mémoire", "identité"],
            "concepts": [{"text": "mémoire collective", "importance": 0.9}],
            "importance": 0.8,
            "summary": "Un passage sur la mémoire.",
            "emotional": {"polarity": 0.3, "primary_emotion": "curiosité", "intensity": 0.5},
            "domain": {"primary_domain": "philosophie", "confidence": 0.85}
        });
        let enricher = Enricher::new(Arc::new(FixedModel { value }), EnricherConfig::default());
        let mut batch = chunks(3);
        let errors = enricher.enrich_all(&mut batch).await;

        assert!(errors.is_empty());
        for chunk in &batch {
            assert_eq!(chunk.enrichment.themes.len(), 2);
            assert_eq!(chunk.enrichment.concepts[0].text, "mémoire collective");
            assert!((chunk.enrichment.importance - 0.8).abs() < 1e-6);
            assert_eq!(
                chunk.enrichment.domain.as_ref().unwrap().primary_domain,
                "philosophie"
            );
        }
    }

    #[tokio::test]
    async fn test_failures_are_per_chunk_not_fatal() {
        let enricher = Enricher::new(Arc::new(BrokenModel), EnricherConfig::default());
        let mut batch = chunks(4);
        let errors = enricher.enrich_all(&mut batch).await;

        assert_eq!(errors.len(), 4);
        for (i, error) in errors.iter().enumerate() {
            assert_eq!(error.unit, UnitRef::Chunk(i));
        }
        // Métadonnées vides, pas d'échec du lot
        for chunk in &batch {
            assert!(chunk.enrichment.themes.is_empty());
            assert_eq!(chunk.enrichment.importance, 0.0);
        }
    }

    #[tokio::test]
    async fn test_schema_rejects_invalid_payload() {
        // themes vide : violation minItems, l'erreur reste par chunk
        let value = json!({"themes": [], "concepts": [], "importance": 0.5});
        let enricher = Enricher::new(Arc::new(FixedModel { value }), EnricherConfig::default());
        let mut batch = chunks(1);
        let errors = enricher.enrich_all(&mut batch).await;
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn test_clamp_out_of_range() {
        let mut enrichment = ChunkEnrichment {
            themes: vec!["a".into(), "b".into(), "c".into(), "d".into(), "e".into(), "f".into()],
            importance: 1.7,
            ..ChunkEnrichment::default()
        };
        clamp_enrichment(&mut enrichment);
        assert_eq!(enrichment.themes.len(), 5);
        assert_eq!(enrichment.importance, 1.0);
    }
}
