use crate::definition::{
    definition_digest, parse_definition_file, DurationValue, ParseMode, ParsedDefinition,
};
use crate::orchestration::dispatcher::AgentDispatcher;
use crate::orchestration::error::EngineError;
use crate::orchestration::executor::WorkflowExecutor;
use crate::orchestration::resolver::resolve;
use crate::orchestration::state::{
    ArtifactRecord, RunStatus, StepError, StepStatus, WorkflowState,
};
use crate::orchestration::state_store::{PrunePolicy, StateStore, WorkflowSummary};
use crate::shared::clock::Clock;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct RunOverrides {
    pub variables: BTreeMap<String, String>,
    pub lenient: bool,
    pub max_parallelism: Option<usize>,
    pub step_timeout: Option<DurationValue>,
}

impl RunOverrides {
    fn parse_mode(&self) -> ParseMode {
        if self.lenient {
            ParseMode::Lenient
        } else {
            ParseMode::Strict
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StepReport {
    pub step_id: String,
    pub status: StepStatus,
    pub attempts: u32,
    pub iterations: u32,
    pub score: Option<f64>,
    pub error_kind: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub workflow_id: String,
    pub status: RunStatus,
    pub elapsed_seconds: i64,
    pub steps: Vec<StepReport>,
    pub artifacts: Vec<ArtifactRecord>,
    pub failure: Option<StepError>,
    pub warnings: Vec<String>,
}

impl RunReport {
    pub fn from_state(state: &WorkflowState, warnings: Vec<String>) -> Self {
        Self {
            workflow_id: state.workflow_id.clone(),
            status: state.status,
            elapsed_seconds: state.updated_at.saturating_sub(state.created_at),
            steps: state
                .steps
                .iter()
                .map(|step| StepReport {
                    step_id: step.step_id.clone(),
                    status: step.status,
                    attempts: step.attempt.saturating_add(1),
                    iterations: step.iteration,
                    score: step.score,
                    error_kind: step.error.as_ref().map(|error| error.kind.clone()),
                })
                .collect(),
            artifacts: state.current_artifacts().into_iter().cloned().collect(),
            failure: state.failure.clone(),
            warnings,
        }
    }

    pub fn render(&self) -> String {
        let mut lines = Vec::new();
        lines.push(format!(
            "workflow {} status={} elapsed={}s",
            self.workflow_id, self.status, self.elapsed_seconds
        ));
        for warning in &self.warnings {
            lines.push(format!("warning: {warning}"));
        }
        if let Some(failure) = &self.failure {
            lines.push(format!("failure: kind={} {}", failure.kind, failure.message));
        }
        if !self.steps.is_empty() {
            lines.push("steps:".to_string());
            for step in &self.steps {
                let mut line = format!(
                    "  {} {} attempts={} iterations={}",
                    step.step_id, step.status, step.attempts, step.iterations
                );
                if let Some(score) = step.score {
                    line.push_str(&format!(" score={score}"));
                }
                if let Some(kind) = &step.error_kind {
                    line.push_str(&format!(" error={kind}"));
                }
                lines.push(line);
            }
        }
        if !self.artifacts.is_empty() {
            lines.push("artifacts:".to_string());
            for artifact in &self.artifacts {
                lines.push(format!(
                    "  {} -> {} (sha256 {}, {} bytes)",
                    artifact.reference(),
                    artifact.path,
                    &artifact.content_digest[..12.min(artifact.content_digest.len())],
                    artifact.size_bytes
                ));
            }
        }
        lines.join("\n")
    }

    pub fn exit_code(&self) -> i32 {
        match self.status {
            RunStatus::Succeeded => 0,
            RunStatus::Cancelled => 3,
            RunStatus::Failed => {
                if self
                    .failure
                    .as_ref()
                    .map(|failure| failure.kind == "internal")
                    .unwrap_or(false)
                {
                    4
                } else {
                    2
                }
            }
            _ => 4,
        }
    }
}

pub fn exit_code_for_error(error: &EngineError) -> i32 {
    match error {
        EngineError::Definition(_)
        | EngineError::CyclicDependency { .. }
        | EngineError::DefinitionDrift { .. }
        | EngineError::NotFound { .. }
        | EngineError::ConcurrentModification { .. } => 1,
        EngineError::Cancelled { .. } => 3,
        EngineError::Internal(_)
        | EngineError::Io { .. }
        | EngineError::Json { .. }
        | EngineError::StateCorrupt { .. }
        | EngineError::IncompatibleVersion { .. } => 4,
        _ => 2,
    }
}

pub struct Orchestrator {
    store: StateStore,
    executor: WorkflowExecutor,
    clock: Arc<dyn Clock>,
}

impl Orchestrator {
    pub fn new(
        state_dir: impl Into<std::path::PathBuf>,
        project_root: impl Into<std::path::PathBuf>,
        dispatcher: Arc<dyn AgentDispatcher>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let store = StateStore::new(state_dir);
        let executor =
            WorkflowExecutor::new(store.clone(), dispatcher, clock.clone(), project_root);
        Self {
            store,
            executor,
            clock,
        }
    }

    pub fn run_file(
        &self,
        definition_path: &Path,
        prompt: Option<&str>,
        overrides: RunOverrides,
    ) -> Result<RunReport, EngineError> {
        let parsed = parse_definition_file(definition_path, overrides.parse_mode())?;
        self.run(parsed, prompt, overrides)
    }

    pub fn run(
        &self,
        mut parsed: ParsedDefinition,
        prompt: Option<&str>,
        overrides: RunOverrides,
    ) -> Result<RunReport, EngineError> {
        if let Some(max_parallelism) = overrides.max_parallelism {
            if max_parallelism == 0 {
                return Err(EngineError::Definition(
                    "max_parallelism override must be at least 1".to_string(),
                ));
            }
            parsed.definition.policy.max_parallelism = max_parallelism;
        }
        if let Some(step_timeout) = overrides.step_timeout {
            parsed.definition.policy.step_timeout = step_timeout;
        }
        // Overrides are part of the effective definition, so the digest follows them.
        parsed.digest = definition_digest(&parsed.definition)?;

        let mut variables = overrides.variables.clone();
        if let Some(prompt) = prompt {
            variables.insert("prompt".to_string(), prompt.to_string());
        }

        let warnings = parsed.warnings.clone();
        let state = self.executor.run(&parsed, variables)?;
        Ok(RunReport::from_state(&state, warnings))
    }

    pub fn resume(
        &self,
        workflow_id: &str,
        definition_path: Option<&Path>,
        overrides: RunOverrides,
    ) -> Result<RunReport, EngineError> {
        let supplied = match definition_path {
            Some(path) => Some(parse_definition_file(path, overrides.parse_mode())?),
            None => None,
        };
        let warnings = supplied
            .as_ref()
            .map(|parsed| parsed.warnings.clone())
            .unwrap_or_default();
        let state = self.executor.resume(workflow_id, supplied.as_ref())?;
        Ok(RunReport::from_state(&state, warnings))
    }

    pub fn cancel(&self, workflow_id: &str) -> Result<bool, EngineError> {
        self.executor.cancel(workflow_id)
    }

    pub fn list(&self) -> Result<Vec<WorkflowSummary>, EngineError> {
        self.store.list()
    }

    pub fn show(&self, workflow_id: &str) -> Result<WorkflowState, EngineError> {
        self.store.load(workflow_id).map(|(_, state)| state)
    }

    pub fn cleanup(&self, policy: PrunePolicy) -> Result<usize, EngineError> {
        self.store.prune(policy, self.clock.now())
    }

    pub fn validate_file(
        &self,
        definition_path: &Path,
        lenient: bool,
    ) -> Result<ParsedDefinition, EngineError> {
        let mode = if lenient {
            ParseMode::Lenient
        } else {
            ParseMode::Strict
        };
        let parsed = parse_definition_file(definition_path, mode)?;
        resolve(&parsed.definition)?;
        Ok(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_exit_codes_follow_the_cli_contract() {
        assert_eq!(
            exit_code_for_error(&EngineError::Definition("bad".into())),
            1
        );
        assert_eq!(
            exit_code_for_error(&EngineError::DefinitionDrift {
                workflow_id: "wf".into()
            }),
            1
        );
        assert_eq!(
            exit_code_for_error(&EngineError::Cancelled {
                workflow_id: "wf".into()
            }),
            3
        );
        assert_eq!(exit_code_for_error(&EngineError::Internal("bug".into())), 4);
        assert_eq!(
            exit_code_for_error(&EngineError::Timeout {
                step_id: "a".into(),
                timeout_seconds: 1
            }),
            2
        );
    }
}
