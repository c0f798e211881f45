use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use tracing::info;

use slate_store::scenes::SceneRow;

#[derive(Clone, Debug, thiserror::Error)]
#[error("{message}")]
pub struct RenderError {
    pub message: String,
}

impl RenderError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// External render collaborator. Render jobs ride the same durable queue and
/// backoff schedule as pipeline jobs; the actual video production is out of
/// core scope.
#[async_trait]
pub trait RenderInvoker: Send + Sync {
    async fn render(&self, scene: &SceneRow) -> Result<(), RenderError>;
}

/// Placeholder invoker for deployments without a render backend wired up.
pub struct NoopRenderer;

#[async_trait]
impl RenderInvoker for NoopRenderer {
    async fn render(&self, scene: &SceneRow) -> Result<(), RenderError> {
        info!(scene_id = %scene.id, "render requested; no render backend configured");
        Ok(())
    }
}

/// Test invoker that fails a set number of times before succeeding.
pub struct MockRenderer {
    failures_remaining: AtomicU32,
    calls: AtomicU32,
}

impl MockRenderer {
    pub fn new(failures_before_success: u32) -> Self {
        Self {
            failures_remaining: AtomicU32::new(failures_before_success),
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl RenderInvoker for MockRenderer {
    async fn render(&self, _scene: &SceneRow) -> Result<(), RenderError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if self
            .failures_remaining
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(RenderError::new("encoder unavailable"));
        }
        Ok(())
    }
}
