use crate::orchestration::error::{io_error, EngineError};
use crate::orchestration::state::{ArtifactRecord, WorkflowState};
use crate::shared::fs_atomic::atomic_write_file;
use crate::shared::ids::validate_identifier_value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};

pub const STEP_OUTPUTS_DIR: &str = "step_outputs";

#[derive(Debug, Clone)]
pub struct ArtifactRegistry {
    project_root: PathBuf,
    allowlist: Vec<PathBuf>,
    view: BTreeMap<String, ArtifactRecord>,
}

impl ArtifactRegistry {
    pub fn new(project_root: impl Into<PathBuf>, state_dir: &Path, extra_roots: &[PathBuf]) -> Self {
        let project_root = project_root.into();
        let mut allowlist = vec![
            normalize_lexically(&project_root),
            normalize_lexically(state_dir),
        ];
        for root in extra_roots {
            let absolute = if root.is_absolute() {
                root.clone()
            } else {
                project_root.join(root)
            };
            allowlist.push(normalize_lexically(&absolute));
        }
        Self {
            project_root,
            allowlist,
            view: BTreeMap::new(),
        }
    }

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    pub fn write(
        &mut self,
        workflow_id: &str,
        step_id: &str,
        logical_name: &str,
        iteration: u32,
        bytes: &[u8],
        overwrite: bool,
        now: i64,
    ) -> Result<ArtifactRecord, EngineError> {
        validate_identifier_value("logical output name", logical_name)
            .map_err(|_| EngineError::PathViolation {
                path: logical_name.to_string(),
            })?;

        let key = artifact_key(step_id, logical_name);
        if !overwrite && self.view.contains_key(&key) {
            return Err(EngineError::Internal(format!(
                "artifact `{key}` is already recorded for workflow `{workflow_id}`"
            )));
        }

        let relative = PathBuf::from(STEP_OUTPUTS_DIR)
            .join(workflow_id)
            .join(step_id)
            .join(iteration.to_string())
            .join(logical_name);
        let absolute = self.project_root.join(&relative);
        self.ensure_allowlisted(&absolute)?;

        atomic_write_file(&absolute, bytes).map_err(|err| io_error(&absolute, err))?;

        let record = ArtifactRecord {
            workflow_id: workflow_id.to_string(),
            step_id: step_id.to_string(),
            logical_name: logical_name.to_string(),
            iteration,
            path: relative.display().to_string(),
            content_digest: content_digest(bytes),
            size_bytes: bytes.len() as u64,
            created_at: now,
        };
        self.view.insert(key, record.clone());
        Ok(record)
    }

    pub fn read(&self, record: &ArtifactRecord) -> Result<Vec<u8>, EngineError> {
        let path = self.project_root.join(&record.path);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(EngineError::NotFound {
                    resource: format!("artifact `{}`", record.reference()),
                });
            }
            Err(err) => return Err(io_error(&path, err)),
        };
        if content_digest(&bytes) != record.content_digest {
            return Err(EngineError::DigestMismatch {
                reference: record.reference(),
            });
        }
        Ok(bytes)
    }

    pub fn verify(&self, record: &ArtifactRecord) -> Result<(), EngineError> {
        self.read(record).map(|_| ())
    }

    pub fn resolve(&self, reference: &str) -> Option<&ArtifactRecord> {
        self.view.get(reference)
    }

    pub fn remove_step(&mut self, step_id: &str) {
        self.view
            .retain(|_, record| record.step_id != step_id);
    }

    pub fn rebuild_view(&mut self, state: &WorkflowState) {
        self.view.clear();
        for record in state.current_artifacts() {
            self.view.insert(
                artifact_key(&record.step_id, &record.logical_name),
                record.clone(),
            );
        }
    }

    fn ensure_allowlisted(&self, path: &Path) -> Result<(), EngineError> {
        if path
            .components()
            .any(|component| matches!(component, Component::ParentDir))
        {
            return Err(EngineError::PathViolation {
                path: path.display().to_string(),
            });
        }
        let normalized = normalize_lexically(path);
        if self
            .allowlist
            .iter()
            .any(|root| normalized.starts_with(root))
        {
            return Ok(());
        }
        Err(EngineError::PathViolation {
            path: path.display().to_string(),
        })
    }
}

pub fn artifact_key(step_id: &str, logical_name: &str) -> String {
    format!("{step_id}.{logical_name}")
}

pub fn content_digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

fn normalize_lexically(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other),
        }
    }
    normalized
}
