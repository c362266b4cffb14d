// VELIN Core - Machine à étapes résumable
// DAG d'étapes, checkpoints, retries exponentiels, pause/reprise, revues

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::ingest::core::events::{EventBus, StageEventKind};
use crate::ingest::{
    sha256_hex, Document, IngestError, ProcessingStage, ReviewGate, StageRecord,
};

/// Phases exécutables de la machine. Chaque phase relie un état `running`
/// à un état `completed` ; les revues s'intercalent entre deux phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StagePhase {
    Extract,
    Clean,
    Chunk,
    Match,
    Enrich,
    Embed,
}

/// Ordre d'exécution des phases
pub const PHASES: [StagePhase; 6] = [
    StagePhase::Extract,
    StagePhase::Clean,
    StagePhase::Chunk,
    StagePhase::Match,
    StagePhase::Enrich,
    StagePhase::Embed,
];

impl StagePhase {
    pub fn running_state(&self) -> ProcessingStage {
        match self {
            Self::Extract => ProcessingStage::Extracting,
            Self::Clean => ProcessingStage::Cleaning,
            Self::Chunk => ProcessingStage::Chunking,
            Self::Match => ProcessingStage::Matching,
            Self::Enrich => ProcessingStage::Enriching,
            Self::Embed => ProcessingStage::Embedding,
        }
    }

    pub fn completed_state(&self) -> ProcessingStage {
        match self {
            Self::Extract => ProcessingStage::Extracted,
            Self::Clean => ProcessingStage::Cleaned,
            Self::Chunk => ProcessingStage::Chunked,
            Self::Match => ProcessingStage::Matched,
            Self::Enrich => ProcessingStage::Enriched,
            Self::Embed => ProcessingStage::Embedded,
        }
    }

    /// Revue attendue après cette phase, le cas échéant
    pub fn review_gate(&self) -> Option<ReviewGate> {
        match self {
            Self::Extract => Some(ReviewGate::Extraction),
            Self::Chunk => Some(ReviewGate::Chunks),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Extract => "extract",
            Self::Clean => "clean",
            Self::Chunk => "chunk",
            Self::Match => "match",
            Self::Enrich => "enrich",
            Self::Embed => "embed",
        }
    }

    /// Première phase restant à exécuter pour un document dans l'état donné.
    /// Un document `failed` reprend à sa phase interrompue via les checkpoints.
    pub fn next_for(stage: ProcessingStage) -> Option<StagePhase> {
        match stage {
            ProcessingStage::Queued | ProcessingStage::Extracting => Some(Self::Extract),
            ProcessingStage::Extracted | ProcessingStage::Cleaning => Some(Self::Clean),
            ProcessingStage::Cleaned | ProcessingStage::Chunking => Some(Self::Chunk),
            ProcessingStage::Chunked | ProcessingStage::Matching => Some(Self::Match),
            ProcessingStage::Matched | ProcessingStage::Enriching => Some(Self::Enrich),
            ProcessingStage::Enriched | ProcessingStage::Embedding => Some(Self::Embed),
            ProcessingStage::Embedded
            | ProcessingStage::Completed
            | ProcessingStage::Failed => None,
        }
    }
}

/// Drapeau d'annulation partagé, consulté aux points de suspension
#[derive(Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Configuration de la machine à étapes
#[derive(Debug, Clone)]
pub struct StageMachineConfig {
    pub max_retries: usize,
    pub retry_base_delay: Duration,
    /// Points de revue activés (extraction et chunks)
    pub review_enabled: bool,
}

impl Default for StageMachineConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_base_delay: Duration::from_millis(200),
            review_enabled: true,
        }
    }
}

/// Issue d'une phase exécutée par la machine
#[derive(Debug)]
pub enum PhaseResult<T> {
    Done(T),
    Paused,
    Cancelled,
    Failed(String),
}

/// Machine à étapes : une par document en cours. Les transitions sont
/// mono-thread par document ; le parallélisme vit à l'intérieur des phases.
pub struct StageMachine {
    config: StageMachineConfig,
    events: EventBus,
    cancel: CancellationFlag,
    paused: Arc<AtomicBool>,
    records: Vec<StageRecord>,
    checkpoints: HashMap<StagePhase, String>,
    timings_ms: std::collections::BTreeMap<String, u64>,
}

impl StageMachine {
    pub fn new(config: StageMachineConfig, events: EventBus) -> Self {
        Self {
            config,
            events,
            cancel: CancellationFlag::default(),
            paused: Arc::new(AtomicBool::new(false)),
            records: Vec::new(),
            checkpoints: HashMap::new(),
            timings_ms: std::collections::BTreeMap::new(),
        }
    }

    pub fn cancellation(&self) -> CancellationFlag {
        self.cancel.clone()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn records(&self) -> &[StageRecord] {
        &self.records
    }

    pub fn timings_ms(&self) -> &std::collections::BTreeMap<String, u64> {
        &self.timings_ms
    }

    // === Pause / reprise ===

    /// Demande de pause : la phase en cours termine son unité atomique,
    /// la machine refuse ensuite d'avancer
    pub fn request_pause(&self) {
        info!("⏸️ pause requested");
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self, document: &mut Document) {
        self.paused.store(false, Ordering::SeqCst);
        document.resumed_at = Some(chrono::Utc::now());
        self.events.publish(
            &document.id,
            document.processing_stage,
            StageEventKind::Resumed,
        );
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    // === Checkpoints ===

    /// Empreinte de checkpoint couvrant les entrées d'une étape
    pub fn checkpoint_hash(inputs: &[&[u8]]) -> String {
        let mut all = Vec::new();
        for input in inputs {
            all.extend_from_slice(input);
            all.push(0);
        }
        sha256_hex(&all)
    }

    pub fn checkpoint_matches(&self, phase: StagePhase, input_hash: &str) -> bool {
        self.checkpoints.get(&phase).map(String::as_str) == Some(input_hash)
    }

    pub fn load_checkpoints(&mut self, saved: &std::collections::BTreeMap<String, String>) {
        for phase in PHASES {
            if let Some(hash) = saved.get(phase.label()) {
                self.checkpoints.insert(phase, hash.clone());
            }
        }
        debug!("loaded {} checkpoints", self.checkpoints.len());
    }

    pub fn export_checkpoints(&self) -> std::collections::BTreeMap<String, String> {
        self.checkpoints
            .iter()
            .map(|(phase, hash)| (phase.label().to_string(), hash.clone()))
            .collect()
    }

    // === Revues ===

    pub fn set_review_pending(&self, document: &mut Document, gate: ReviewGate) {
        document.review_pending = Some(gate);
        self.events.publish(
            &document.id,
            document.processing_stage,
            StageEventKind::ReviewPending { gate },
        );
    }

    pub fn approve_review(&self, document: &mut Document, gate: ReviewGate) {
        if !document.reviews_approved.contains(&gate) {
            document.reviews_approved.push(gate);
        }
        if document.review_pending == Some(gate) {
            document.review_pending = None;
        }
        self.events.publish(
            &document.id,
            document.processing_stage,
            StageEventKind::Resumed,
        );
    }

    /// Revue requise après cette phase et pas encore approuvée ?
    pub fn review_required(&self, document: &Document, phase: StagePhase) -> Option<ReviewGate> {
        if !self.config.review_enabled {
            return None;
        }
        phase
            .review_gate()
            .filter(|gate| !document.reviews_approved.contains(gate))
    }

    pub fn report_progress(&self, document: &Document, phase: StagePhase, pct: f32) {
        self.events.publish(
            &document.id,
            phase.running_state(),
            StageEventKind::Progress { pct },
        );
    }

    // === Exécution d'une phase ===

    /// Exécute une phase avec retries exponentiels. Le travail est relancé
    /// tel quel à chaque tentative ; les erreurs fatales court-circuitent.
    pub async fn execute<T, F, Fut>(
        &mut self,
        document: &mut Document,
        phase: StagePhase,
        input_hash: &str,
        mut work: F,
    ) -> PhaseResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = crate::ingest::IngestResult<T>>,
    {
        if self.cancel.is_cancelled() {
            return PhaseResult::Cancelled;
        }
        if self.is_paused() {
            document.paused_at = Some(chrono::Utc::now());
            self.events.publish(
                &document.id,
                document.processing_stage,
                StageEventKind::Paused,
            );
            return PhaseResult::Paused;
        }

        document.processing_stage = phase.running_state();
        document.updated_at = chrono::Utc::now();
        self.events
            .publish(&document.id, phase.running_state(), StageEventKind::Started);

        let mut attempt = 0usize;
        loop {
            let started_at = chrono::Utc::now();
            let timer = Instant::now();
            let outcome = work().await;
            let elapsed_ms = timer.elapsed().as_millis() as u64;

            match outcome {
                Ok(value) => {
                    document.processing_stage = phase.completed_state();
                    document.updated_at = chrono::Utc::now();
                    self.checkpoints.insert(phase, input_hash.to_string());
                    *self.timings_ms.entry(phase.label().to_string()).or_insert(0) += elapsed_ms;
                    self.records.push(StageRecord {
                        document_id: document.id.clone(),
                        stage: phase.completed_state(),
                        attempt,
                        started_at,
                        completed_at: Some(chrono::Utc::now()),
                        checkpoint_hash: Some(input_hash.to_string()),
                        error: None,
                        retry_count: attempt,
                    });
                    self.events.publish(
                        &document.id,
                        phase.completed_state(),
                        StageEventKind::Completed,
                    );
                    debug!("phase {} completed in {} ms", phase.label(), elapsed_ms);
                    return PhaseResult::Done(value);
                }
                Err(IngestError::Cancelled) => {
                    info!("phase {} cancelled, partial results discarded", phase.label());
                    return PhaseResult::Cancelled;
                }
                Err(err) if attempt < self.config.max_retries && is_retryable(&err) => {
                    warn!(
                        "phase {} attempt {} failed: {} (retrying)",
                        phase.label(),
                        attempt,
                        err
                    );
                    self.records.push(StageRecord {
                        document_id: document.id.clone(),
                        stage: phase.running_state(),
                        attempt,
                        started_at,
                        completed_at: None,
                        checkpoint_hash: None,
                        error: Some(err.to_string()),
                        retry_count: attempt,
                    });
                    attempt += 1;
                    let delay = self.config.retry_base_delay * 2u32.saturating_pow(attempt as u32);
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    warn!("phase {} failed permanently: {}", phase.label(), err);
                    document.processing_stage = ProcessingStage::Failed;
                    document.updated_at = chrono::Utc::now();
                    self.records.push(StageRecord {
                        document_id: document.id.clone(),
                        stage: ProcessingStage::Failed,
                        attempt,
                        started_at,
                        completed_at: None,
                        checkpoint_hash: None,
                        error: Some(err.to_string()),
                        retry_count: attempt,
                    });
                    self.events.publish(
                        &document.id,
                        ProcessingStage::Failed,
                        StageEventKind::Failed {
                            message: format!("{}: {}", phase.label(), err),
                        },
                    );
                    return PhaseResult::Failed(err.to_string());
                }
            }
        }
    }
}

/// Les violations d'invariants et d'autres erreurs structurelles ne se
/// retentent pas ; le reste part en backoff exponentiel
fn is_retryable(err: &IngestError) -> bool {
    !matches!(
        err,
        IngestError::ChunkInvariantViolated(_)
            | IngestError::ManifestVersion(_)
            | IngestError::Cancelled
            | IngestError::ReviewPending(_)
            | IngestError::PageCountInvalid(_)
    )
}
