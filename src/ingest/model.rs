// VELIN Modèles - Collaborateur modèle (texte, sortie structurée, embeddings)
// Client REST local compatible Ollama ; la validation de schéma borde la sortie

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info};

/// Échec de validation d'une sortie structurée contre son schéma déclaré
#[derive(Debug, thiserror::Error)]
#[error("structured output does not match schema at {path}: {message}")]
pub struct StructuredOutputError {
    pub path: String,
    pub message: String,
}

/// Erreurs du collaborateur modèle
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("model request failed: {0}")]
    Request(String),

    #[error("model returned an invalid response: {0}")]
    InvalidResponse(String),

    #[error(transparent)]
    Structured(#[from] StructuredOutputError),

    #[error("model timed out after {0:?}")]
    Timeout(Duration),
}

impl From<reqwest::Error> for ModelError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ModelError::Timeout(Duration::from_secs(0))
        } else {
            ModelError::Request(err.to_string())
        }
    }
}

/// Options de génération texte
#[derive(Debug, Clone)]
pub struct GenerateOptions {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: Option<usize>,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            model: "llama3.1:8b".to_string(),
            temperature: 0.1,
            max_tokens: None,
        }
    }
}

/// Collaborateur modèle : génération texte, sortie structurée validée,
/// embeddings. Les implémentations sérialisent ou poolent en interne.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn generate(&self, prompt: &str, options: &GenerateOptions) -> Result<String, ModelError>;

    /// Génère une valeur JSON validée contre `schema`. Une sortie non conforme
    /// lève `StructuredOutputError`.
    async fn generate_structured(
        &self,
        prompt: &str,
        schema: &Value,
        options: &GenerateOptions,
    ) -> Result<Value, ModelError>;

    async fn embed(&self, text: &str, model: &str) -> Result<Vec<f32>, ModelError>;
}

// === Client REST local (API Ollama) ===

/// Configuration du client modèle local
#[derive(Debug, Clone)]
pub struct LocalModelConfig {
    pub endpoint: String,
    pub request_timeout: Duration,
    pub embed_model: String,
}

impl Default for LocalModelConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:11434".to_string(),
            request_timeout: Duration::from_secs(300),
            embed_model: "nomic-embed-text".to_string(),
        }
    }
}

/// Client REST vers un serveur de modèles local compatible Ollama
pub struct LocalModelClient {
    client: reqwest::Client,
    config: LocalModelConfig,
}

#[derive(Serialize)]
struct OllamaGenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<&'a str>,
    options: OllamaOptions,
}

#[derive(Serialize)]
struct OllamaOptions {
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<usize>,
}

#[derive(Deserialize)]
struct OllamaGenerateResponse {
    response: String,
}

#[derive(Serialize)]
struct OllamaEmbedRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Deserialize)]
struct OllamaEmbedResponse {
    embedding: Vec<f32>,
}

impl LocalModelClient {
    pub fn new(config: LocalModelConfig) -> Result<Self, ModelError> {
        info!("🔌 Initializing local model client: {}", config.endpoint);
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ModelError::Request(e.to_string()))?;
        Ok(Self { client, config })
    }

    async fn generate_raw(
        &self,
        prompt: &str,
        options: &GenerateOptions,
        json_format: bool,
    ) -> Result<String, ModelError> {
        let request = OllamaGenerateRequest {
            model: &options.model,
            prompt,
            stream: false,
            format: json_format.then_some("json"),
            options: OllamaOptions {
                temperature: options.temperature,
                num_predict: options.max_tokens,
            },
        };

        let url = format!("{}/api/generate", self.config.endpoint);
        let response = self.client.post(&url).json(&request).send().await?;
        if !response.status().is_success() {
            return Err(ModelError::Request(format!(
                "{} returned HTTP {}",
                url,
                response.status()
            )));
        }

        let body: OllamaGenerateResponse = response
            .json()
            .await
            .map_err(|e| ModelError::InvalidResponse(e.to_string()))?;
        Ok(body.response)
    }
}

#[async_trait]
impl ModelClient for LocalModelClient {
    async fn generate(&self, prompt: &str, options: &GenerateOptions) -> Result<String, ModelError> {
        debug!("generate: {} chars prompt, model {}", prompt.len(), options.model);
        self.generate_raw(prompt, options, false).await
    }

    async fn generate_structured(
        &self,
        prompt: &str,
        schema: &Value,
        options: &GenerateOptions,
    ) -> Result<Value, ModelError> {
        let framed = format!(
            "{prompt}\n\nRéponds uniquement avec un objet JSON conforme à ce schéma:\n{}",
            serde_json::to_string_pretty(schema).unwrap_or_default()
        );
        let raw = self.generate_raw(&framed, options, true).await?;
        let value: Value = serde_json::from_str(raw.trim())
            .map_err(|e| ModelError::InvalidResponse(format!("not JSON: {e}")))?;
        validate_against_schema(&value, schema, "$")?;
        Ok(value)
    }

    async fn embed(&self, text: &str, model: &str) -> Result<Vec<f32>, ModelError> {
        let model = if model.is_empty() {
            &self.config.embed_model
        } else {
            model
        };
        let url = format!("{}/api/embeddings", self.config.endpoint);
        let request = OllamaEmbedRequest { model, prompt: text };
        let response = self.client.post(&url).json(&request).send().await?;
        if !response.status().is_success() {
            return Err(ModelError::Request(format!(
                "{} returned HTTP {}",
                url,
                response.status()
            )));
        }
        let body: OllamaEmbedResponse = response
            .json()
            .await
            .map_err(|e| ModelError::InvalidResponse(e.to_string()))?;
        if body.embedding.is_empty() {
            return Err(ModelError::InvalidResponse("empty embedding".to_string()));
        }
        Ok(body.embedding)
    }
}

// === Validation de schéma ===

/// Validation récursive minimale d'une valeur contre un schéma JSON déclaré.
/// Couvre type / required / properties / items / enum / minimum / maximum,
/// suffisant pour les sorties structurées du pipeline.
pub fn validate_against_schema(
    value: &Value,
    schema: &Value,
    path: &str,
) -> Result<(), StructuredOutputError> {
    let Some(schema_obj) = schema.as_object() else {
        return Ok(());
    };

    if let Some(expected) = schema_obj.get("type").and_then(Value::as_str) {
        let ok = match expected {
            "object" => value.is_object(),
            "array" => value.is_array(),
            "string" => value.is_string(),
            "number" => value.is_number(),
            "integer" => value.is_i64() || value.is_u64(),
            "boolean" => value.is_boolean(),
            "null" => value.is_null(),
            _ => true,
        };
        if !ok {
            return Err(StructuredOutputError {
                path: path.to_string(),
                message: format!("expected type {expected}"),
            });
        }
    }

    if let Some(allowed) = schema_obj.get("enum").and_then(Value::as_array) {
        if !allowed.contains(value) {
            return Err(StructuredOutputError {
                path: path.to_string(),
                message: "value not in enum".to_string(),
            });
        }
    }

    if let Some(number) = value.as_f64() {
        if let Some(min) = schema_obj.get("minimum").and_then(Value::as_f64) {
            if number < min {
                return Err(StructuredOutputError {
                    path: path.to_string(),
                    message: format!("{number} below minimum {min}"),
                });
            }
        }
        if let Some(max) = schema_obj.get("maximum").and_then(Value::as_f64) {
            if number > max {
                return Err(StructuredOutputError {
                    path: path.to_string(),
                    message: format!("{number} above maximum {max}"),
                });
            }
        }
    }

    if let Some(obj) = value.as_object() {
        if let Some(required) = schema_obj.get("required").and_then(Value::as_array) {
            for key in required.iter().filter_map(Value::as_str) {
                if !obj.contains_key(key) {
                    return Err(StructuredOutputError {
                        path: format!("{path}.{key}"),
                        message: "required field missing".to_string(),
                    });
                }
            }
        }
        if let Some(props) = schema_obj.get("properties").and_then(Value::as_object) {
            for (key, sub_schema) in props {
                if let Some(sub_value) = obj.get(key) {
                    validate_against_schema(sub_value, sub_schema, &format!("{path}.{key}"))?;
                }
            }
        }
    }

    if let Some(items) = value.as_array() {
        if let Some(min_items) = schema_obj.get("minItems").and_then(Value::as_u64) {
            if (items.len() as u64) < min_items {
                return Err(StructuredOutputError {
                    path: path.to_string(),
                    message: format!("fewer than {min_items} items"),
                });
            }
        }
        if let Some(max_items) = schema_obj.get("maxItems").and_then(Value::as_u64) {
            if (items.len() as u64) > max_items {
                return Err(StructuredOutputError {
                    path: path.to_string(),
                    message: format!("more than {max_items} items"),
                });
            }
        }
        if let Some(item_schema) = schema_obj.get("items") {
            for (i, item) in items.iter().enumerate() {
                validate_against_schema(item, item_schema, &format!("{path}[{i}]"))?;
            }
        }
    }

    Ok(())
}

/// Déballe une réponse markdown encadrée de triple backticks, avec ou sans
/// tag de langage (` ```markdown `)
pub fn unwrap_markdown_fences(response: &str) -> &str {
    let trimmed = response.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let Some(inner) = inner.strip_suffix("```") else {
        return trimmed;
    };
    // Tag de langage éventuel sur la première ligne
    match inner.split_once('\n') {
        Some((first_line, rest)) if first_line.len() <= 16 && !first_line.contains(' ') => {
            rest.trim_matches('\n')
        }
        _ => inner.trim_matches('\n'),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> Value {
        json!({
            "type": "object",
            "required": ["themes", "importance"],
            "properties": {
                "themes": {
                    "type": "array",
                    "minItems": 1,
                    "maxItems": 5,
                    "items": {"type": "string"}
                },
                "importance": {"type": "number", "minimum": 0.0, "maximum": 1.0},
                "domain": {
                    "type": "object",
                    "required": ["primary_domain"],
                    "properties": {"primary_domain": {"type": "string"}}
                }
            }
        })
    }

    #[test]
    fn test_schema_valid_value() {
        let value = json!({"themes": ["mémoire"], "importance": 0.7});
        assert!(validate_against_schema(&value, &schema(), "$").is_ok());
    }

    #[test]
    fn test_schema_missing_required() {
        let value = json!({"themes": ["mémoire"]});
        let err = validate_against_schema(&value, &schema(), "$").unwrap_err();
        assert!(err.path.contains("importance"));
    }

    #[test]
    fn test_schema_wrong_type() {
        let value = json!({"themes": "pas un tableau", "importance": 0.5});
        assert!(validate_against_schema(&value, &schema(), "$").is_err());
    }

    #[test]
    fn test_schema_range_violation() {
        let value = json!({"themes": ["x"], "importance": 1.5});
        assert!(validate_against_schema(&value, &schema(), "$").is_err());
    }

    #[test]
    fn test_schema_nested_object() {
        let value = json!({"themes": ["x"], "importance": 0.1, "domain": {"confidence": 0.9}});
        let err = validate_against_schema(&value, &schema(), "$").unwrap_err();
        assert!(err.path.contains("domain"));
    }

    #[test]
    fn test_schema_too_many_items() {
        let value = json!({"themes": ["a", "b", "c", "d", "e", "f"], "importance": 0.1});
        assert!(validate_against_schema(&value, &schema(), "$").is_err());
    }

    #[test]
    fn test_unwrap_fences_plain() {
        assert_eq!(unwrap_markdown_fences("# Titre\ncontenu"), "# Titre\ncontenu");
    }

    #[test]
    fn test_unwrap_fences_with_tag() {
        let wrapped = "```markdown\n# Titre\ncontenu\n```";
        assert_eq!(unwrap_markdown_fences(wrapped), "# Titre\ncontenu");
    }

    #[test]
    fn test_unwrap_fences_without_tag() {
        let wrapped = "```\n# Titre\n```";
        assert_eq!(unwrap_markdown_fences(wrapped), "# Titre");
    }
}
