use crate::definition::WorkflowDefinition;
use crate::orchestration::error::{io_error, json_error, EngineError};
use crate::orchestration::state::{RunStatus, WorkflowState};
use crate::shared::fs_atomic::{
    acquire_pid_lock, atomic_write_file, release_pid_lock, LockAcquisition,
};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const SNAPSHOT_VERSION: u32 = 1;
pub const SNAPSHOT_SUFFIX: &str = ".state.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotEnvelope {
    version: u32,
    written_at: i64,
    workflow_id: String,
    status: RunStatus,
    created_at: i64,
    updated_at: i64,
    definition: WorkflowDefinition,
    state: WorkflowState,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VersionProbe {
    version: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowSummary {
    pub workflow_id: String,
    pub status: RunStatus,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrunePolicy {
    pub retention_days: Option<u32>,
    pub max_states: Option<usize>,
    pub terminal_only: bool,
}

impl Default for PrunePolicy {
    fn default() -> Self {
        Self {
            retention_days: None,
            max_states: None,
            terminal_only: true,
        }
    }
}

#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl Drop for RunLock {
    fn drop(&mut self) {
        release_pid_lock(&self.path);
    }
}

#[derive(Debug, Clone)]
pub struct StateStore {
    state_dir: PathBuf,
}

impl StateStore {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
        }
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub fn snapshot_path(&self, workflow_id: &str) -> PathBuf {
        self.state_dir
            .join(format!("{workflow_id}{SNAPSHOT_SUFFIX}"))
    }

    fn lock_path(&self, workflow_id: &str) -> PathBuf {
        self.state_dir.join(format!("{workflow_id}.lock"))
    }

    fn cancel_marker_path(&self, workflow_id: &str) -> PathBuf {
        self.state_dir.join(format!("{workflow_id}.cancel"))
    }

    pub fn save(
        &self,
        definition: &WorkflowDefinition,
        state: &WorkflowState,
        now: i64,
    ) -> Result<(), EngineError> {
        let envelope = SnapshotEnvelope {
            version: SNAPSHOT_VERSION,
            written_at: now,
            workflow_id: state.workflow_id.clone(),
            status: state.status,
            created_at: state.created_at,
            updated_at: state.updated_at,
            definition: definition.clone(),
            state: state.clone(),
        };
        let path = self.snapshot_path(&state.workflow_id);
        let body =
            serde_json::to_vec_pretty(&envelope).map_err(|err| json_error(&path, err))?;
        atomic_write_file(&path, &body).map_err(|err| io_error(&path, err))
    }

    pub fn load(
        &self,
        workflow_id: &str,
    ) -> Result<(WorkflowDefinition, WorkflowState), EngineError> {
        let path = self.snapshot_path(workflow_id);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(EngineError::NotFound {
                    resource: format!("workflow run `{workflow_id}`"),
                });
            }
            Err(err) => return Err(io_error(&path, err)),
        };

        let probe: VersionProbe =
            serde_json::from_str(&raw).map_err(|err| EngineError::StateCorrupt {
                path: path.display().to_string(),
                reason: err.to_string(),
            })?;
        if probe.version > SNAPSHOT_VERSION {
            return Err(EngineError::IncompatibleVersion {
                found: probe.version,
                supported: SNAPSHOT_VERSION,
            });
        }

        let envelope: SnapshotEnvelope =
            serde_json::from_str(&raw).map_err(|err| EngineError::StateCorrupt {
                path: path.display().to_string(),
                reason: err.to_string(),
            })?;
        Ok((envelope.definition, envelope.state))
    }

    pub fn list(&self) -> Result<Vec<WorkflowSummary>, EngineError> {
        let entries = match fs::read_dir(&self.state_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(io_error(&self.state_dir, err)),
        };

        let mut summaries = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| io_error(&self.state_dir, err))?;
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|v| v.to_str()) else {
                continue;
            };
            if !name.ends_with(SNAPSHOT_SUFFIX) {
                continue;
            }
            let Ok(raw) = fs::read_to_string(&path) else {
                continue;
            };
            let Ok(summary) = serde_json::from_str::<WorkflowSummary>(&raw) else {
                continue;
            };
            summaries.push(summary);
        }

        summaries.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.workflow_id.cmp(&b.workflow_id))
        });
        Ok(summaries)
    }

    pub fn prune(&self, policy: PrunePolicy, now: i64) -> Result<usize, EngineError> {
        let summaries = self.list()?;
        let mut to_remove: Vec<&WorkflowSummary> = Vec::new();

        if let Some(retention_days) = policy.retention_days {
            let cutoff = now.saturating_sub(i64::from(retention_days).saturating_mul(86_400));
            for summary in &summaries {
                if summary.updated_at < cutoff {
                    to_remove.push(summary);
                }
            }
        }

        if let Some(max_states) = policy.max_states {
            if summaries.len() > max_states {
                let mut by_recency: Vec<&WorkflowSummary> = summaries.iter().collect();
                by_recency.sort_by(|a, b| {
                    b.updated_at
                        .cmp(&a.updated_at)
                        .then_with(|| a.workflow_id.cmp(&b.workflow_id))
                });
                for summary in by_recency.into_iter().skip(max_states) {
                    to_remove.push(summary);
                }
            }
        }

        let mut removed = 0usize;
        let mut seen = std::collections::BTreeSet::new();
        for summary in to_remove {
            if !seen.insert(summary.workflow_id.clone()) {
                continue;
            }
            if policy.terminal_only && !summary.status.is_terminal() {
                continue;
            }
            let path = self.snapshot_path(&summary.workflow_id);
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(io_error(&path, err)),
            }
            let _ = fs::remove_file(self.lock_path(&summary.workflow_id));
            let _ = fs::remove_file(self.cancel_marker_path(&summary.workflow_id));
        }
        Ok(removed)
    }

    pub fn acquire_run_lock(&self, workflow_id: &str) -> Result<RunLock, EngineError> {
        let path = self.lock_path(workflow_id);
        match acquire_pid_lock(&path).map_err(|err| io_error(&path, err))? {
            LockAcquisition::Acquired => Ok(RunLock { path }),
            LockAcquisition::Held { pid } => Err(EngineError::ConcurrentModification {
                workflow_id: workflow_id.to_string(),
                pid,
            }),
        }
    }

    pub fn request_cancel(&self, workflow_id: &str, now: i64) -> Result<bool, EngineError> {
        if !self.snapshot_path(workflow_id).is_file() {
            return Ok(false);
        }
        let path = self.cancel_marker_path(workflow_id);
        atomic_write_file(&path, now.to_string().as_bytes())
            .map_err(|err| io_error(&path, err))?;
        Ok(true)
    }

    pub fn cancel_requested(&self, workflow_id: &str) -> bool {
        self.cancel_marker_path(workflow_id).is_file()
    }

    pub fn clear_cancel_marker(&self, workflow_id: &str) {
        let _ = fs::remove_file(self.cancel_marker_path(workflow_id));
    }
}
