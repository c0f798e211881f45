use slate_core::errors::DomainError;
use slate_core::ids::SceneId;
use slate_core::roles::AgentRole;
use slate_store::StoreError;

/// Failure of a pipeline or render run. Business-rule failures carry their
/// `DomainError`; infrastructure failures are everything else. The retry
/// wrapper consults `is_retryable` so a run that would deterministically
/// re-fail (budget exceeded, bad diff) is not re-attempted.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Domain(DomainError),

    #[error("store error: {0}")]
    Store(StoreError),

    #[error("agent run failed: {role} on {scene_id}: {message}")]
    AgentRunFailed {
        scene_id: SceneId,
        role: AgentRole,
        message: String,
    },

    #[error("render failed for {scene_id}: {message}")]
    RenderFailed { scene_id: SceneId, message: String },

    #[error("cancelled")]
    Cancelled,
}

impl From<StoreError> for PipelineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Domain(d) => Self::Domain(d),
            other => Self::Store(other),
        }
    }
}

impl From<DomainError> for PipelineError {
    fn from(e: DomainError) -> Self {
        Self::Domain(e)
    }
}

impl PipelineError {
    /// Stable classification string for the job-status surface and logs.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Domain(d) => d.code(),
            Self::Store(_) => "store_error",
            Self::AgentRunFailed { .. } => "agent_run_failed",
            Self::RenderFailed { .. } => "render_failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Infrastructure failures and lock contention may clear on a rerun;
    /// other business-rule failures and cancellation are terminal.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Domain(d) => d.is_retryable(),
            Self::Store(_) => true,
            Self::AgentRunFailed { .. } => true,
            Self::RenderFailed { .. } => true,
            Self::Cancelled => false,
        }
    }
}
