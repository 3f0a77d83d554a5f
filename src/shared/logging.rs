use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

pub const ENGINE_LOG_FILE: &str = "logs/engine.jsonl";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineEvent {
    pub at: i64,
    pub workflow_id: String,
    pub event: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub detail: BTreeMap<String, String>,
}

impl EngineEvent {
    pub fn new(at: i64, workflow_id: impl Into<String>, event: impl Into<String>) -> Self {
        Self {
            at,
            workflow_id: workflow_id.into(),
            event: event.into(),
            detail: BTreeMap::new(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.detail.insert(key.into(), value.into());
        self
    }
}

pub fn engine_log_path(state_dir: &Path) -> PathBuf {
    state_dir.join(ENGINE_LOG_FILE)
}

pub fn append_engine_event(state_dir: &Path, event: &EngineEvent) -> std::io::Result<()> {
    let path = engine_log_path(state_dir);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut line = serde_json::to_vec(event).map_err(std::io::Error::other)?;
    line.push(b'\n');
    fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)?
        .write_all(&line)
}

// Unparseable lines are dropped rather than failing the whole read; the log
// is diagnostic, not a source of truth.
pub fn read_engine_events(state_dir: &Path) -> std::io::Result<Vec<EngineEvent>> {
    let path = engine_log_path(state_dir);
    let raw = match fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err),
    };
    Ok(raw
        .lines()
        .filter_map(|line| serde_json::from_str::<EngineEvent>(line).ok())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn events_append_as_json_lines_and_read_back_in_order() {
        let dir = tempdir().expect("tempdir");
        let started = EngineEvent::new(1, "wf-a", "workflow_transition").with("status", "running");
        let finished =
            EngineEvent::new(2, "wf-a", "workflow_transition").with("status", "succeeded");
        append_engine_event(dir.path(), &started).expect("append");
        append_engine_event(dir.path(), &finished).expect("append");

        let events = read_engine_events(dir.path()).expect("read");
        assert_eq!(events, vec![started, finished]);

        let raw = fs::read_to_string(engine_log_path(dir.path())).expect("raw");
        for line in raw.lines() {
            assert!(line.starts_with('{') && line.ends_with('}'), "{line}");
        }
    }

    #[test]
    fn reading_an_absent_log_yields_no_events() {
        let dir = tempdir().expect("tempdir");
        assert!(read_engine_events(dir.path()).expect("read").is_empty());
    }

    #[test]
    fn malformed_lines_are_skipped_on_read() {
        let dir = tempdir().expect("tempdir");
        append_engine_event(dir.path(), &EngineEvent::new(1, "wf-a", "first")).expect("append");
        let path = engine_log_path(dir.path());
        let mut raw = fs::read_to_string(&path).expect("raw");
        raw.push_str("not json\n");
        fs::write(&path, raw).expect("rewrite");
        append_engine_event(dir.path(), &EngineEvent::new(2, "wf-a", "second")).expect("append");

        let events = read_engine_events(dir.path()).expect("read");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event, "first");
        assert_eq!(events[1].event, "second");
    }
}
