use serde::{Deserialize, Serialize};

use crate::ids::{JobId, ProjectId, ProposalId, SceneId};
use crate::roles::AgentRole;

/// Push notifications emitted as pipeline runs and scene edits progress.
/// Delivery transport is external; the engine only publishes to a broadcast
/// channel, keyed by the topics below.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    ProposalCreated {
        project_id: ProjectId,
        scene_id: SceneId,
        proposal_id: ProposalId,
        role: AgentRole,
    },
    SceneUpdated {
        project_id: ProjectId,
        scene_id: SceneId,
        version: i64,
    },
    SceneStatusChanged {
        project_id: ProjectId,
        scene_id: SceneId,
        status: String,
    },
    PipelineCompleted {
        project_id: ProjectId,
        scene_id: SceneId,
        job_id: JobId,
        proposals: usize,
    },
    PipelineFailed {
        project_id: ProjectId,
        scene_id: SceneId,
        job_id: JobId,
        code: String,
        reason: String,
    },
}

impl Notification {
    pub fn project_id(&self) -> &ProjectId {
        match self {
            Self::ProposalCreated { project_id, .. }
            | Self::SceneUpdated { project_id, .. }
            | Self::SceneStatusChanged { project_id, .. }
            | Self::PipelineCompleted { project_id, .. }
            | Self::PipelineFailed { project_id, .. } => project_id,
        }
    }

    pub fn scene_id(&self) -> &SceneId {
        match self {
            Self::ProposalCreated { scene_id, .. }
            | Self::SceneUpdated { scene_id, .. }
            | Self::SceneStatusChanged { scene_id, .. }
            | Self::PipelineCompleted { scene_id, .. }
            | Self::PipelineFailed { scene_id, .. } => scene_id,
        }
    }

    /// Subscription topics this notification is delivered under.
    pub fn topics(&self) -> [String; 2] {
        [
            format!("project-{}", self.project_id()),
            format!("scene-{}", self.scene_id()),
        ]
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::ProposalCreated { .. } => "proposal_created",
            Self::SceneUpdated { .. } => "scene_updated",
            Self::SceneStatusChanged { .. } => "scene_status_changed",
            Self::PipelineCompleted { .. } => "pipeline_completed",
            Self::PipelineFailed { .. } => "pipeline_failed",
        }
    }
}
