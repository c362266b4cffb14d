// VELIN Embeddings - Modèle local Candle avec tokenizer partagé
// E5-Base-v2 768D, mean pooling + normalisation L2, cache Blake3

use candle_core::{Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::bert::{BertModel, Config as BertConfig, DTYPE};
use dashmap::DashMap;
use hf_hub::api::tokio::Api;
use std::path::PathBuf;
use std::sync::Arc;
use tokenizers::Tokenizer;
use tracing::{debug, info};

use crate::ingest::processing::chunker::TokenCounter;
use crate::ingest::Chunk;

/// Erreurs du sous-système d'embeddings
#[derive(Debug, thiserror::Error)]
pub enum EmbedError {
    #[error("model download failed: {0}")]
    Download(String),

    #[error("model load failed: {0}")]
    ModelLoad(String),

    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    #[error("inference failed: {0}")]
    Inference(String),
}

impl From<candle_core::Error> for EmbedError {
    fn from(err: candle_core::Error) -> Self {
        EmbedError::Inference(err.to_string())
    }
}

/// Abstraction d'embedding texte : le modèle local en production, des
/// implémentations déterministes dans les tests
pub trait TextEmbedder: Send + Sync {
    fn embed_text(&self, text: &str) -> Result<Vec<f32>, EmbedError>;

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
        texts.iter().map(|t| self.embed_text(t)).collect()
    }

    fn dimension(&self) -> usize;
}

/// Configuration de l'embedder local
#[derive(Debug, Clone)]
pub struct EmbedderConfig {
    pub model_id: String,
    pub revision: String,
    pub cache_dir: Option<PathBuf>,
    pub max_sequence_length: usize,
    /// Taille des lots d'embedding (amortit le warmup du modèle)
    pub batch_size: usize,
    /// Dimension attendue des vecteurs
    pub dimension: usize,
}

impl Default for EmbedderConfig {
    fn default() -> Self {
        Self {
            model_id: "intfloat/e5-base-v2".to_string(),
            revision: "main".to_string(),
            cache_dir: None,
            max_sequence_length: 512,
            batch_size: 32,
            dimension: 768,
        }
    }
}

type EmbeddingCache = DashMap<String, Vec<f32>>;

/// Embedder local : BERT E5 chargé une fois par process, partagé entre le
/// chunker (comptage de tokens) et les étapes d'embedding/matching
pub struct LocalEmbedder {
    model: BertModel,
    tokenizer: Arc<Tokenizer>,
    device: Device,
    cache: Arc<EmbeddingCache>,
    config: EmbedderConfig,
}

impl LocalEmbedder {
    /// Initialise l'embedder avec téléchargement automatique depuis HF Hub
    pub async fn new(config: EmbedderConfig) -> Result<Self, EmbedError> {
        info!("🔄 Initializing local embedder: {}", config.model_id);

        let api = Api::new().map_err(|e| EmbedError::Download(e.to_string()))?;
        let repo = api.model(config.model_id.clone());

        debug!("📥 Downloading tokenizer...");
        let tokenizer_path = repo
            .get("tokenizer.json")
            .await
            .map_err(|e| EmbedError::Download(e.to_string()))?;
        let tokenizer = Tokenizer::from_file(tokenizer_path)
            .map_err(|e| EmbedError::Tokenizer(e.to_string()))?;

        debug!("📥 Downloading model weights...");
        let weights_path = repo
            .get("model.safetensors")
            .await
            .map_err(|e| EmbedError::Download(e.to_string()))?;
        let config_path = repo
            .get("config.json")
            .await
            .map_err(|e| EmbedError::Download(e.to_string()))?;

        let config_content = std::fs::read_to_string(&config_path)
            .map_err(|e| EmbedError::ModelLoad(e.to_string()))?;
        let bert_config: BertConfig = serde_json::from_str(&config_content)
            .map_err(|e| EmbedError::ModelLoad(format!("config.json: {e}")))?;

        let device = Device::Cpu;
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[&weights_path], DTYPE, &device)
                .map_err(|e| EmbedError::ModelLoad(e.to_string()))?
        };
        let model =
            BertModel::load(vb, &bert_config).map_err(|e| EmbedError::ModelLoad(e.to_string()))?;

        info!("✅ Local embedder ready ({}D)", config.dimension);
        Ok(Self {
            model,
            tokenizer: Arc::new(tokenizer),
            device,
            cache: Arc::new(DashMap::new()),
            config,
        })
    }

    /// Compteur de tokens adossé au tokenizer du modèle : l'identité
    /// chunker/embedder est structurelle
    pub fn token_counter(&self) -> TokenCounter {
        TokenCounter::Tokenizer(Arc::clone(&self.tokenizer))
    }

    pub fn config(&self) -> &EmbedderConfig {
        &self.config
    }

    /// Embed les chunks en lots, en remplissant `chunk.embedding` en place.
    /// Le cache Blake3 rend les retraitements quasi gratuits.
    pub fn embed_chunks(&self, chunks: &mut [Chunk]) -> Result<(), EmbedError> {
        let batch = self.config.batch_size.max(1);
        let total = chunks.len();
        for group in chunks.chunks_mut(batch) {
            let texts: Vec<String> = group.iter().map(|c| c.content.clone()).collect();
            let vectors = self.embed_batch(&texts)?;
            for (chunk, vector) in group.iter_mut().zip(vectors) {
                chunk.embedding = Some(vector);
            }
        }
        debug!("embedded {} chunks in batches of {}", total, batch);
        Ok(())
    }

    fn forward(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        // Préfixe passage selon la convention E5
        let prefixed = format!("passage: {text}");
        let encoding = self
            .tokenizer
            .encode(prefixed, true)
            .map_err(|e| EmbedError::Tokenizer(e.to_string()))?;

        let mut ids: Vec<u32> = encoding.get_ids().to_vec();
        ids.truncate(self.config.max_sequence_length);
        if ids.is_empty() {
            return Err(EmbedError::Inference("empty encoding".to_string()));
        }

        let input_ids = Tensor::from_vec(ids.clone(), (1, ids.len()), &self.device)?;
        let token_type_ids = input_ids.zeros_like()?;

        let outputs = self.model.forward(&input_ids, &token_type_ids)?;

        // Mean pooling sur la dimension séquence puis normalisation L2
        let pooled = outputs.mean(1)?;
        let norm = pooled.sqr()?.sum_keepdim(1)?.sqrt()?;
        let normalized = pooled.broadcast_div(&norm)?;
        let vector = normalized.squeeze(0)?.to_vec1::<f32>()?;

        if vector.len() != self.config.dimension {
            return Err(EmbedError::Inference(format!(
                "expected {}D, model produced {}D",
                self.config.dimension,
                vector.len()
            )));
        }
        Ok(vector)
    }
}

impl TextEmbedder for LocalEmbedder {
    fn embed_text(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        let cache_key = blake3::hash(text.as_bytes()).to_hex().to_string();
        if let Some(cached) = self.cache.get(&cache_key) {
            return Ok(cached.clone());
        }
        let vector = self.forward(text)?;
        self.cache.insert(cache_key, vector.clone());
        Ok(vector)
    }

    fn dimension(&self) -> usize {
        self.config.dimension
    }
}

/// Normalisation L2 en place d'un vecteur (utilitaire partagé)
pub fn l2_normalize(vector: &mut [f32]) {
    let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in vector.iter_mut() {
            *x /= norm;
        }
    }
}
