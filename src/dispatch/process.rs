use crate::definition::{AgentKind, Capability};
use crate::orchestration::dispatcher::{
    AgentDispatcher, OutcomeStatus, SignalValue, StepInvocation, StepOutcome,
};
use crate::shared::cancel::CancelToken;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Read;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;

const CHILD_POLL_MS: u64 = 10;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RunnerRequest<'a> {
    workflow_id: &'a str,
    correlation_id: &'a str,
    step_id: &'a str,
    agent: &'a str,
    capability: &'a str,
    iteration: u32,
    attempt: u32,
    inputs: BTreeMap<&'a str, String>,
    outputs: &'a [String],
    variables: &'a BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunnerResponse {
    status: OutcomeStatus,
    #[serde(default)]
    produced: BTreeMap<String, String>,
    #[serde(default)]
    score: Option<f64>,
    #[serde(default)]
    secondary_signals: BTreeMap<String, SignalValue>,
    #[serde(default)]
    diagnostic: Option<String>,
    #[serde(default)]
    retryable: bool,
}

#[derive(Debug, Clone)]
pub struct ProcessDispatcher {
    program: String,
    scratch_root: PathBuf,
}

impl ProcessDispatcher {
    pub fn new(program: impl Into<String>, scratch_root: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            scratch_root: scratch_root.into(),
        }
    }

    fn attempt_dir(&self, invocation: &StepInvocation) -> PathBuf {
        self.scratch_root
            .join(&invocation.workflow_id)
            .join(&invocation.attempt_label)
    }
}

impl AgentDispatcher for ProcessDispatcher {
    fn supports(&self, _agent: AgentKind, _capability: &Capability) -> bool {
        // The runner binary owns the capability table; unsupported work comes
        // back as a failed outcome with a diagnostic.
        true
    }

    fn invoke(&self, invocation: &StepInvocation, cancel: &CancelToken) -> StepOutcome {
        let attempt_dir = self.attempt_dir(invocation);
        if let Err(err) = fs::create_dir_all(&attempt_dir) {
            return StepOutcome::failed(
                format!("failed to create runner scratch dir: {err}"),
                false,
            );
        }

        let request_path = attempt_dir.join("request.json");
        let response_path = attempt_dir.join("response.json");
        let _ = fs::remove_file(&response_path);

        let request = RunnerRequest {
            workflow_id: &invocation.workflow_id,
            correlation_id: &invocation.correlation_id,
            step_id: &invocation.step_id,
            agent: invocation.agent.as_str(),
            capability: invocation.capability.as_str(),
            iteration: invocation.iteration,
            attempt: invocation.attempt,
            inputs: invocation
                .inputs
                .iter()
                .map(|(name, bytes)| {
                    (name.as_str(), String::from_utf8_lossy(bytes).to_string())
                })
                .collect(),
            outputs: &invocation.outputs,
            variables: &invocation.variables,
        };
        let body = match serde_json::to_vec_pretty(&request) {
            Ok(body) => body,
            Err(err) => {
                return StepOutcome::failed(format!("failed to encode runner request: {err}"), false)
            }
        };
        if let Err(err) = fs::write(&request_path, body) {
            return StepOutcome::failed(format!("failed to write runner request: {err}"), false);
        }

        let mut child = match Command::new(&self.program)
            .arg(&request_path)
            .arg(&response_path)
            .current_dir(&attempt_dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return StepOutcome::failed(
                    format!("agent runner binary `{}` not found", self.program),
                    false,
                );
            }
            Err(err) => {
                return StepOutcome::failed(format!("failed to spawn agent runner: {err}"), true)
            }
        };

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stdout_reader = thread::spawn(move || drain_pipe(stdout));
        let stderr_reader = thread::spawn(move || drain_pipe(stderr));

        let exit_status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {
                    if cancel.is_cancelled() {
                        let _ = child.kill();
                        let _ = child.wait();
                        let _ = stdout_reader.join();
                        let _ = stderr_reader.join();
                        return StepOutcome::failed("invocation cancelled", false);
                    }
                    thread::sleep(Duration::from_millis(CHILD_POLL_MS));
                }
                Err(err) => {
                    return StepOutcome::failed(
                        format!("failed to wait for agent runner: {err}"),
                        true,
                    );
                }
            }
        };

        let _stdout = stdout_reader.join().unwrap_or_default();
        let stderr = stderr_reader.join().unwrap_or_default();

        if !exit_status.success() {
            let detail = stderr.lines().next().unwrap_or("no stderr output");
            return StepOutcome::failed(
                format!(
                    "agent runner exited with status {}: {detail}",
                    exit_status.code().unwrap_or(-1)
                ),
                true,
            );
        }

        let raw = match fs::read_to_string(&response_path) {
            Ok(raw) => raw,
            Err(_) => {
                return StepOutcome::failed(
                    "agent runner exited without writing a response file",
                    false,
                );
            }
        };
        let response: RunnerResponse = match serde_json::from_str(&raw) {
            Ok(response) => response,
            Err(err) => {
                return StepOutcome::failed(
                    format!("agent runner response is not valid json: {err}"),
                    false,
                );
            }
        };

        StepOutcome {
            status: response.status,
            produced: response
                .produced
                .into_iter()
                .map(|(name, content)| (name, content.into_bytes()))
                .collect(),
            score: response.score,
            secondary_signals: response.secondary_signals,
            diagnostic: response.diagnostic,
            retryable: response.retryable,
        }
    }
}

fn drain_pipe<R: Read>(pipe: Option<R>) -> String {
    let mut buf = String::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_string(&mut buf);
    }
    buf
}
