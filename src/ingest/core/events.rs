// VELIN Core - Événements de la machine à étapes
// Publication broadcast, abonnement filtré par document

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

use crate::ingest::{ProcessingStage, ReviewGate};

/// Nature d'un événement d'étape
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum StageEventKind {
    Started,
    Progress { pct: f32 },
    Completed,
    Failed { message: String },
    ReviewPending { gate: ReviewGate },
    Paused,
    Resumed,
}

/// Événement publié par la machine à étapes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageEvent {
    pub document_id: String,
    pub stage: ProcessingStage,
    #[serde(flatten)]
    pub kind: StageEventKind,
    pub at: chrono::DateTime<chrono::Utc>,
}

/// Bus d'événements : les collaborateurs externes s'abonnent au flux d'un
/// document plutôt que de sonder l'état du job
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<StageEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(8));
        Self { tx }
    }

    pub fn publish(&self, document_id: &str, stage: ProcessingStage, kind: StageEventKind) {
        let event = StageEvent {
            document_id: document_id.to_string(),
            stage,
            kind,
            at: chrono::Utc::now(),
        };
        trace!("event: {} {} {:?}", event.document_id, event.stage, event.kind);
        // Aucun abonné n'est une situation normale
        let _ = self.tx.send(event);
    }

    /// Flux des événements d'un document donné
    pub fn subscribe(&self, document_id: &str) -> DocumentEvents {
        DocumentEvents {
            rx: self.tx.subscribe(),
            document_id: document_id.to_string(),
        }
    }

    /// Flux brut, tous documents confondus
    pub fn subscribe_all(&self) -> broadcast::Receiver<StageEvent> {
        self.tx.subscribe()
    }
}

/// Abonnement filtré sur un document
pub struct DocumentEvents {
    rx: broadcast::Receiver<StageEvent>,
    document_id: String,
}

impl DocumentEvents {
    /// Prochain événement du document ; `None` quand le bus est fermé.
    /// Les événements manqués par retard de lecture sont ignorés.
    pub async fn next(&mut self) -> Option<StageEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if event.document_id == self.document_id => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    trace!("event subscriber lagged, {} events skipped", skipped);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
