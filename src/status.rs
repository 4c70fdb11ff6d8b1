use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What kind of platform subject a training job belongs to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SubjectKind {
    #[serde(alias = "Agent")]
    Agent,
    #[serde(alias = "KnowledgeBase", alias = "kb")]
    KnowledgeBase,
}

impl SubjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubjectKind::Agent => "agent",
            SubjectKind::KnowledgeBase => "knowledge_base",
        }
    }
}

/// Canonical training states. The backend speaks several dialects
/// (`Active`, `Issues`, `in_progress`, ...); everything is normalized
/// into these four before anyone else sees it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TrainingStatus {
    #[serde(alias = "Pending")]
    Pending,
    #[serde(alias = "Training")]
    Training,
    #[serde(alias = "Completed", alias = "active")]
    Completed,
    #[serde(alias = "Failed", alias = "issues")]
    Failed,
}

impl TrainingStatus {
    /// Terminal states end the subscription: no further checks are
    /// scheduled once one has been observed.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TrainingStatus::Completed | TrainingStatus::Failed)
    }
}

/// One normalized status observation for a subject.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingStatusEvent {
    pub subject_id: String,
    pub subject_kind: SubjectKind,
    pub status: TrainingStatus,
    pub progress: Option<u8>,
    pub message: Option<String>,
    pub observed_at: DateTime<Utc>,
}

/// Normalize a backend status string, case-insensitively.
///
/// Unrecognized strings map to `Training`: an unknown vocabulary term is
/// far more likely a new spelling of "still working" than a terminal
/// state, and misreading it as terminal would strand a live job.
pub fn parse_status(raw: &str) -> TrainingStatus {
    match raw.trim().to_ascii_lowercase().as_str() {
        "pending" | "queued" => TrainingStatus::Pending,
        "training" | "in_progress" | "processing" => TrainingStatus::Training,
        "completed" | "active" | "ready" | "trained" => TrainingStatus::Completed,
        "failed" | "issues" | "error" => TrainingStatus::Failed,
        other => {
            tracing::debug!("Unrecognized training status {:?}; treating as in-progress", other);
            TrainingStatus::Training
        }
    }
}
