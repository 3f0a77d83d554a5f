use crate::orchestration::dispatcher::SignalValue;
use crate::orchestration::error::EngineError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Ready,
    Running,
    Succeeded,
    Failed,
    Skipped,
    Cancelled,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Skipped | Self::Cancelled
        )
    }

    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Ready)
                | (Self::Pending, Self::Skipped)
                | (Self::Ready, Self::Running)
                | (Self::Ready, Self::Skipped)
                | (Self::Ready, Self::Pending)
                | (Self::Ready, Self::Failed)
                | (Self::Running, Self::Succeeded)
                | (Self::Running, Self::Failed)
                | (Self::Running, Self::Skipped)
                | (Self::Running, Self::Cancelled)
                | (Self::Running, Self::Ready)
                | (Self::Succeeded, Self::Pending)
                | (Self::Failed, Self::Pending)
                | (Self::Skipped, Self::Pending)
        )
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{label}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Initialising,
    Running,
    Paused,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Initialising, Self::Running)
                | (Self::Initialising, Self::Failed)
                | (Self::Initialising, Self::Cancelled)
                | (Self::Running, Self::Paused)
                | (Self::Running, Self::Succeeded)
                | (Self::Running, Self::Failed)
                | (Self::Running, Self::Cancelled)
                | (Self::Paused, Self::Running)
                | (Self::Paused, Self::Failed)
                | (Self::Paused, Self::Cancelled)
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Initialising => "initialising",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{label}")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepError {
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl StepError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn from_engine_error(error: &EngineError) -> Self {
        Self::new(error.kind(), error.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactRecord {
    pub workflow_id: String,
    pub step_id: String,
    pub logical_name: String,
    pub iteration: u32,
    pub path: String,
    pub content_digest: String,
    pub size_bytes: u64,
    pub created_at: i64,
}

impl ArtifactRecord {
    pub fn reference(&self) -> String {
        format!("{}.{}", self.step_id, self.logical_name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepState {
    pub step_id: String,
    pub status: StepStatus,
    pub attempt: u32,
    pub iteration: u32,
    #[serde(default)]
    pub started_at: Option<i64>,
    #[serde(default)]
    pub ended_at: Option<i64>,
    #[serde(default)]
    pub produced_artifacts: Vec<ArtifactRecord>,
    #[serde(default)]
    pub error: Option<StepError>,
    #[serde(default)]
    pub score: Option<f64>,
}

impl StepState {
    pub fn new(step_id: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Pending,
            attempt: 0,
            iteration: 0,
            started_at: None,
            ended_at: None,
            produced_artifacts: Vec::new(),
            error: None,
            score: None,
        }
    }

    pub fn reset_for_loopback(&mut self) {
        self.status = StepStatus::Pending;
        self.attempt = 0;
        self.iteration = self.iteration.saturating_add(1);
        self.started_at = None;
        self.ended_at = None;
        self.produced_artifacts.clear();
        self.error = None;
        self.score = None;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticEntry {
    pub at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowState {
    pub workflow_id: String,
    pub definition_digest: String,
    pub correlation_id: String,
    pub status: RunStatus,
    pub created_at: i64,
    pub updated_at: i64,
    pub steps: Vec<StepState>,
    pub wave_cursor: usize,
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
    #[serde(default)]
    pub gate_iterations: BTreeMap<String, u32>,
    #[serde(default)]
    pub signals: BTreeMap<String, SignalValue>,
    #[serde(default)]
    pub diagnostics: Vec<DiagnosticEntry>,
    #[serde(default)]
    pub failure: Option<StepError>,
}

impl WorkflowState {
    pub fn new(
        workflow_id: impl Into<String>,
        definition_digest: impl Into<String>,
        correlation_id: impl Into<String>,
        step_ids: impl IntoIterator<Item = String>,
        variables: BTreeMap<String, String>,
        now: i64,
    ) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            definition_digest: definition_digest.into(),
            correlation_id: correlation_id.into(),
            status: RunStatus::Initialising,
            created_at: now,
            updated_at: now,
            steps: step_ids.into_iter().map(StepState::new).collect(),
            wave_cursor: 0,
            variables,
            gate_iterations: BTreeMap::new(),
            signals: BTreeMap::new(),
            diagnostics: Vec::new(),
            failure: None,
        }
    }

    pub fn step(&self, step_id: &str) -> Option<&StepState> {
        self.steps.iter().find(|step| step.step_id == step_id)
    }

    pub fn step_mut(&mut self, step_id: &str) -> Option<&mut StepState> {
        self.steps.iter_mut().find(|step| step.step_id == step_id)
    }

    pub fn transition_step(
        &mut self,
        step_id: &str,
        next: StepStatus,
        now: i64,
    ) -> Result<(), EngineError> {
        let step = self.step_mut(step_id).ok_or_else(|| {
            EngineError::Internal(format!("unknown step `{step_id}` in state transition"))
        })?;
        if !step.status.can_transition_to(next) {
            return Err(EngineError::Internal(format!(
                "step `{step_id}` cannot transition from {} to {next}",
                step.status
            )));
        }
        step.status = next;
        self.updated_at = now;
        Ok(())
    }

    pub fn transition(&mut self, next: RunStatus, now: i64) -> Result<(), EngineError> {
        if !self.status.can_transition_to(next) {
            return Err(EngineError::Internal(format!(
                "workflow `{}` cannot transition from {} to {next}",
                self.workflow_id, self.status
            )));
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    pub fn push_diagnostic(
        &mut self,
        now: i64,
        step_id: Option<&str>,
        message: impl Into<String>,
    ) {
        self.diagnostics.push(DiagnosticEntry {
            at: now,
            step_id: step_id.map(|v| v.to_string()),
            message: message.into(),
        });
    }

    pub fn current_artifacts(&self) -> Vec<&ArtifactRecord> {
        self.steps
            .iter()
            .flat_map(|step| step.produced_artifacts.iter())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_state_machine_permits_the_documented_edges() {
        use StepStatus::*;
        assert!(Pending.can_transition_to(Ready));
        assert!(Ready.can_transition_to(Running));
        assert!(Running.can_transition_to(Succeeded));
        assert!(Running.can_transition_to(Ready));
        assert!(Succeeded.can_transition_to(Pending));
        assert!(!Pending.can_transition_to(Running));
        assert!(!Succeeded.can_transition_to(Running));
        assert!(!Cancelled.can_transition_to(Pending));
    }

    #[test]
    fn run_status_terminality() {
        assert!(RunStatus::Succeeded.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(!RunStatus::Paused.is_terminal());
    }

    #[test]
    fn invalid_transitions_surface_as_internal_errors() {
        let mut state = WorkflowState::new(
            "wf-1",
            "digest",
            "corr-1",
            vec!["a".to_string()],
            BTreeMap::new(),
            10,
        );
        let err = state
            .transition_step("a", StepStatus::Running, 11)
            .expect_err("pending cannot run directly");
        assert_eq!(err.kind(), "internal");
        state
            .transition_step("a", StepStatus::Ready, 11)
            .expect("pending -> ready");
        assert_eq!(state.updated_at, 11);
    }

    #[test]
    fn loopback_reset_clears_results_and_bumps_iteration() {
        let mut step = StepState::new("review");
        step.status = StepStatus::Succeeded;
        step.attempt = 2;
        step.score = Some(5.0);
        step.started_at = Some(1);
        step.reset_for_loopback();
        assert_eq!(step.status, StepStatus::Pending);
        assert_eq!(step.attempt, 0);
        assert_eq!(step.iteration, 1);
        assert!(step.score.is_none());
        assert!(step.started_at.is_none());
    }
}
