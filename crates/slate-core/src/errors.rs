/// Business-rule failures. Non-retryable in principle: they describe a state
/// the caller can observe and react to, and are returned with a stable
/// `code()` string for UI branching.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum DomainError {
    #[error("scene is not editable: {0}")]
    SceneNotEditable(String),

    #[error("invalid status transition: {from} -> {to}")]
    InvalidStatusTransition { from: String, to: String },

    #[error("scene is not approved: {0}")]
    SceneNotApproved(String),

    #[error("budget exceeded: spend {spend_usd:.2} + estimate {estimated_usd:.2} > cap {cap_usd:.2}")]
    BudgetExceeded {
        spend_usd: f64,
        estimated_usd: f64,
        cap_usd: f64,
    },

    #[error("duplicate character name: {0}")]
    DuplicateCharacterName(String),

    #[error("scene is locked by {holder}")]
    ConcurrentModification { holder: String },

    #[error("proposal is not pending: {0}")]
    NotPending(String),

    #[error("not the lock holder: held by {holder}")]
    NotHolder { holder: String },

    #[error("budget cap must be non-negative, got {0}")]
    InvalidBudgetCap(f64),

    #[error("malformed diff: {0}")]
    MalformedDiff(String),
}

impl DomainError {
    /// Stable classification string, preserved through every retry layer so
    /// callers can branch on the reason (e.g. budget exceeded vs generic).
    pub fn code(&self) -> &'static str {
        match self {
            Self::SceneNotEditable(_) => "scene_not_editable",
            Self::InvalidStatusTransition { .. } => "invalid_status_transition",
            Self::SceneNotApproved(_) => "scene_not_approved",
            Self::BudgetExceeded { .. } => "budget_exceeded",
            Self::DuplicateCharacterName(_) => "duplicate_character_name",
            Self::ConcurrentModification { .. } => "concurrent_modification",
            Self::NotPending(_) => "not_pending",
            Self::NotHolder { .. } => "not_holder",
            Self::InvalidBudgetCap(_) => "invalid_budget_cap",
            Self::MalformedDiff(_) => "malformed_diff",
        }
    }

    /// A lock held by another holder clears itself once its TTL lapses, so a
    /// rerun can succeed. Every other business rule fails deterministically.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConcurrentModification { .. })
    }
}
