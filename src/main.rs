// VELIN CLI - Surface opérateur du pipeline d'ingestion
// `velin ingest <path>` ; sortie 0 = completed, 2 = failed, 3 = revue en attente

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use velin::ingest::core::storage::{DocumentStore, FsStorage};
use velin::ingest::embedder::{EmbedderConfig, LocalEmbedder, TextEmbedder};
use velin::ingest::extract::{ModelExtractor, ModelExtractorConfig};
use velin::ingest::model::{LocalModelClient, LocalModelConfig, ModelClient};
use velin::ingest::{
    sha256_hex, ChunkerKind, Document, EventBus, IngestionPipeline, PipelineConfig,
    PipelineOutcome, SourceKind, StageMachine, StageMachineConfig,
};

#[derive(Parser)]
#[command(name = "velin", version, about = "Document ingestion core")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Ingère une source (PDF, EPUB, markdown, texte) jusqu'aux embeddings
    Ingest {
        /// Chemin de la source
        path: PathBuf,

        /// Stratégie de chunking
        #[arg(long, default_value = "recursive")]
        chunker: ChunkerKind,

        /// Désactive le nettoyage par modèle (repli règles uniquement)
        #[arg(long)]
        no_clean: bool,

        /// Reprend un document existant depuis sa première étape incomplète
        #[arg(long)]
        resume: bool,

        /// Propriétaire du document (préfixe de stockage)
        #[arg(long, default_value = "local")]
        owner: String,

        /// Répertoire de stockage
        #[arg(long, default_value = "velin-data")]
        base_dir: PathBuf,

        /// Endpoint du serveur de modèles local
        #[arg(long, default_value = "http://127.0.0.1:11434")]
        model_endpoint: String,

        /// Désactive les appels modèle (nettoyage, enrichissement, couche 3)
        #[arg(long)]
        no_model: bool,

        /// Désactive l'embedder local (pas d'embeddings, compteur heuristique)
        #[arg(long)]
        no_embeddings: bool,

        /// Désactive les points de revue (pipeline sans pause)
        #[arg(long)]
        no_review: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("velin: {err:#}");
            ExitCode::from(1)
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let Command::Ingest {
        path,
        chunker,
        no_clean,
        resume,
        owner,
        base_dir,
        model_endpoint,
        no_model,
        no_embeddings,
        no_review,
    } = cli.command;

    let source_path = path
        .canonicalize()
        .with_context(|| format!("source not found: {}", path.display()))?;
    let Some(source_kind) = SourceKind::from_path(&source_path) else {
        bail!("unsupported source type: {}", source_path.display());
    };

    let store = DocumentStore::new(Arc::new(FsStorage::new(base_dir)));

    // Identité stable par (owner, chemin) pour permettre la reprise
    let document_id = format!(
        "doc_{}",
        &sha256_hex(format!("{owner}:{}", source_path.display()).as_bytes())[..16]
    );

    let mut document = if resume {
        match store.read_metadata(&owner, &document_id).await {
            Ok(doc) => {
                info!("resuming {} from stage {}", doc.id, doc.processing_stage);
                doc
            }
            Err(_) => {
                warn!("no persisted state, starting fresh");
                new_document(&owner, &document_id, source_path.clone(), source_kind, chunker)
            }
        }
    } else {
        new_document(&owner, &document_id, source_path.clone(), source_kind, chunker)
    };
    if document.review_pending.is_some() && resume {
        // La reprise opérateur vaut signal `continue` pour la revue en attente
        let gate = document.review_pending.take().unwrap();
        if !document.reviews_approved.contains(&gate) {
            document.reviews_approved.push(gate);
        }
        info!("review '{gate}' approved by resume");
    }

    let model_client = LocalModelClient::new(LocalModelConfig {
        endpoint: model_endpoint,
        ..LocalModelConfig::default()
    })
    .context("model client init failed")?;
    let model_client: Arc<dyn ModelClient> = Arc::new(model_client);

    let extractor = Arc::new(ModelExtractor::new(
        Arc::clone(&model_client),
        ModelExtractorConfig::default(),
    ));

    let mut config = PipelineConfig::default();
    config.cleaner.use_model = !no_clean && !no_model;

    let mut pipeline = IngestionPipeline::new(extractor, store, config);
    if !no_model {
        pipeline = pipeline.with_model(Arc::clone(&model_client));
    }
    if !no_embeddings {
        match LocalEmbedder::new(EmbedderConfig::default()).await {
            Ok(embedder) => {
                let counter = embedder.token_counter();
                let embedder: Arc<dyn TextEmbedder> = Arc::new(embedder);
                pipeline = pipeline.with_embedder(embedder).with_token_counter(counter);
            }
            Err(err) => {
                warn!("embedder unavailable ({err}), continuing without embeddings");
            }
        }
    }

    let events = EventBus::default();
    let mut machine = StageMachine::new(
        StageMachineConfig {
            review_enabled: !no_review,
            ..StageMachineConfig::default()
        },
        events,
    );

    let outcome = pipeline
        .process(&mut document, &mut machine, resume)
        .await
        .context("pipeline error")?;

    match outcome {
        PipelineOutcome::Completed => {
            println!(
                "completed: {} ({} words, chunks in {}/chunks.json)",
                document.id,
                document.word_count.unwrap_or(0),
                document.storage_prefix()
            );
            Ok(ExitCode::SUCCESS)
        }
        PipelineOutcome::PausedForReview(gate) => {
            println!(
                "paused for review '{gate}': inspect {}/ then rerun with --resume",
                document.storage_prefix()
            );
            Ok(ExitCode::from(3))
        }
        PipelineOutcome::Paused => {
            println!("paused: rerun with --resume to continue");
            Ok(ExitCode::from(3))
        }
        PipelineOutcome::Cancelled => {
            println!("cancelled");
            Ok(ExitCode::from(2))
        }
        PipelineOutcome::Failed(message) => {
            eprintln!("failed: {message}");
            Ok(ExitCode::from(2))
        }
    }
}

fn new_document(
    owner: &str,
    document_id: &str,
    source_path: PathBuf,
    source_kind: SourceKind,
    chunker: ChunkerKind,
) -> Document {
    let mut document = Document::new(owner, source_path, source_kind);
    document.id = document_id.to_string();
    document.chunker_kind = chunker;
    document
}
