use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tapps::definition::{parse_definition_str, AgentKind, Capability, ParseMode};
use tapps::orchestration::dispatcher::{AgentDispatcher, StepInvocation, StepOutcome};
use tapps::orchestration::facade::{Orchestrator, RunOverrides};
use tapps::orchestration::state::{RunStatus, StepStatus};
use tapps::shared::cancel::{sleep_with_cancel, CancelToken};
use tapps::shared::clock::SystemClock;
use tempfile::tempdir;

struct FailFor {
    failing_step: String,
    retryable: bool,
    failures_before_success: usize,
    calls: AtomicUsize,
}

impl FailFor {
    fn new(failing_step: &str, retryable: bool, failures_before_success: usize) -> Self {
        Self {
            failing_step: failing_step.to_string(),
            retryable,
            failures_before_success,
            calls: AtomicUsize::new(0),
        }
    }
}

impl AgentDispatcher for FailFor {
    fn supports(&self, _agent: AgentKind, _capability: &Capability) -> bool {
        true
    }

    fn invoke(&self, invocation: &StepInvocation, _cancel: &CancelToken) -> StepOutcome {
        if invocation.step_id == self.failing_step {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures_before_success {
                return StepOutcome::failed("agent reported a transient fault", self.retryable);
            }
        }
        StepOutcome::succeeded(
            invocation
                .outputs
                .iter()
                .map(|name| (name.clone(), invocation.step_id.clone().into_bytes()))
                .collect(),
        )
    }
}

fn orchestrator_with(dir: &tempfile::TempDir, dispatcher: Arc<dyn AgentDispatcher>) -> Orchestrator {
    Orchestrator::new(
        dir.path().join(".tapps"),
        dir.path(),
        dispatcher,
        Arc::new(SystemClock::new()),
    )
}

#[test]
fn single_step_abort_fails_the_workflow_with_one_snapshot() {
    let dir = tempdir().expect("tempdir");
    let orchestrator = orchestrator_with(&dir, Arc::new(FailFor::new("only", false, usize::MAX)));

    let parsed = parse_definition_str(
        r#"
name: abort_case
steps:
  - id: only
    agent: implementer
    capability: implement
    on_failure: abort
"#,
        ParseMode::Strict,
    )
    .expect("definition");
    let report = orchestrator
        .run(parsed, None, RunOverrides::default())
        .expect("run");

    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.exit_code(), 2);
    assert_eq!(report.steps[0].status, StepStatus::Failed);
    assert_eq!(report.steps[0].error_kind.as_deref(), Some("dispatch_failed"));

    let snapshots: Vec<_> = std::fs::read_dir(dir.path().join(".tapps"))
        .expect("state dir")
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            entry
                .file_name()
                .to_string_lossy()
                .ends_with(".state.json")
        })
        .collect();
    assert_eq!(snapshots.len(), 1);
}

#[test]
fn abort_prevents_later_waves_from_starting() {
    let dir = tempdir().expect("tempdir");
    let dispatcher = Arc::new(FailFor::new("first", false, usize::MAX));
    let orchestrator = orchestrator_with(&dir, dispatcher.clone());

    let parsed = parse_definition_str(
        r#"
name: abort_chain
steps:
  - id: first
    agent: implementer
    capability: implement
    outputs: [diff_out]
    on_failure: abort
  - id: second
    agent: reviewer
    capability: review
    inputs:
      diff: { artifact: first.diff_out }
"#,
        ParseMode::Strict,
    )
    .expect("definition");
    let report = orchestrator
        .run(parsed, None, RunOverrides::default())
        .expect("run");

    assert_eq!(report.status, RunStatus::Failed);
    let second = report
        .steps
        .iter()
        .find(|step| step.step_id == "second")
        .expect("second");
    assert_eq!(second.status, StepStatus::Pending);
}

#[test]
fn skip_policy_cascades_to_consumers_and_keeps_the_workflow_green() {
    let dir = tempdir().expect("tempdir");
    let orchestrator = orchestrator_with(&dir, Arc::new(FailFor::new("optional", false, usize::MAX)));

    let parsed = parse_definition_str(
        r#"
name: skip_case
steps:
  - id: optional
    agent: documenter
    capability: document
    outputs: [docs_out]
    on_failure: skip
  - id: publish
    agent: ops
    capability: deploy
    inputs:
      docs: { artifact: optional.docs_out }
  - id: core
    agent: implementer
    capability: implement
    outputs: [diff_out]
"#,
        ParseMode::Strict,
    )
    .expect("definition");
    let report = orchestrator
        .run(parsed, None, RunOverrides::default())
        .expect("run");

    assert_eq!(report.status, RunStatus::Succeeded);
    let status_of = |step_id: &str| {
        report
            .steps
            .iter()
            .find(|step| step.step_id == step_id)
            .map(|step| step.status)
            .expect("step")
    };
    assert_eq!(status_of("optional"), StepStatus::Skipped);
    assert_eq!(status_of("publish"), StepStatus::Skipped);
    assert_eq!(status_of("core"), StepStatus::Succeeded);
}

#[test]
fn retry_policy_reruns_retryable_failures_until_success() {
    let dir = tempdir().expect("tempdir");
    let dispatcher = Arc::new(FailFor::new("flaky", true, 1));
    let orchestrator = orchestrator_with(&dir, dispatcher.clone());

    let parsed = parse_definition_str(
        r#"
name: retry_case
steps:
  - id: flaky
    agent: tester
    capability: test
    outputs: [report_out]
    on_failure: { retry: 2 }
"#,
        ParseMode::Strict,
    )
    .expect("definition");
    let report = orchestrator
        .run(parsed, None, RunOverrides::default())
        .expect("run");

    assert_eq!(report.status, RunStatus::Succeeded);
    assert_eq!(report.steps[0].attempts, 2);
    assert_eq!(dispatcher.calls.load(Ordering::SeqCst), 2);
}

#[test]
fn exhausted_retries_fail_the_workflow() {
    let dir = tempdir().expect("tempdir");
    let dispatcher = Arc::new(FailFor::new("flaky", true, usize::MAX));
    let orchestrator = orchestrator_with(&dir, dispatcher.clone());

    let parsed = parse_definition_str(
        r#"
name: retry_exhausted
steps:
  - id: flaky
    agent: tester
    capability: test
    on_failure: { retry: 1 }
"#,
        ParseMode::Strict,
    )
    .expect("definition");
    let report = orchestrator
        .run(parsed, None, RunOverrides::default())
        .expect("run");

    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.steps[0].status, StepStatus::Failed);
    assert_eq!(report.steps[0].attempts, 2);
    assert_eq!(dispatcher.calls.load(Ordering::SeqCst), 2);
}

#[test]
fn non_retryable_failures_ignore_the_retry_budget() {
    let dir = tempdir().expect("tempdir");
    let dispatcher = Arc::new(FailFor::new("flaky", false, usize::MAX));
    let orchestrator = orchestrator_with(&dir, dispatcher.clone());

    let parsed = parse_definition_str(
        r#"
name: non_retryable
steps:
  - id: flaky
    agent: tester
    capability: test
    on_failure: { retry: 3 }
"#,
        ParseMode::Strict,
    )
    .expect("definition");
    let report = orchestrator
        .run(parsed, None, RunOverrides::default())
        .expect("run");

    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(dispatcher.calls.load(Ordering::SeqCst), 1);
}

struct SleepyDispatcher {
    hold: Duration,
}

impl AgentDispatcher for SleepyDispatcher {
    fn supports(&self, _agent: AgentKind, _capability: &Capability) -> bool {
        true
    }

    fn invoke(&self, invocation: &StepInvocation, cancel: &CancelToken) -> StepOutcome {
        if sleep_with_cancel(cancel, self.hold) {
            StepOutcome::succeeded(
                invocation
                    .outputs
                    .iter()
                    .map(|name| (name.clone(), b"done".to_vec()))
                    .collect(),
            )
        } else {
            StepOutcome::failed("invocation cancelled", false)
        }
    }
}

#[test]
fn deadline_overrun_fails_the_step_with_timeout_kind() {
    let dir = tempdir().expect("tempdir");
    let orchestrator = orchestrator_with(
        &dir,
        Arc::new(SleepyDispatcher {
            hold: Duration::from_secs(30),
        }),
    );

    let parsed = parse_definition_str(
        r#"
name: timeout_case
policy:
  step_timeout: 1s
steps:
  - id: slow
    agent: ops
    capability: deploy
    on_failure: abort
"#,
        ParseMode::Strict,
    )
    .expect("definition");
    let report = orchestrator
        .run(parsed, None, RunOverrides::default())
        .expect("run");

    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.exit_code(), 2);
    assert_eq!(report.steps[0].status, StepStatus::Failed);
    assert_eq!(report.steps[0].error_kind.as_deref(), Some("timeout"));
}

#[test]
fn timeout_is_retried_when_the_policy_allows_it() {
    let dir = tempdir().expect("tempdir");
    let orchestrator = orchestrator_with(
        &dir,
        Arc::new(SleepyDispatcher {
            hold: Duration::from_secs(30),
        }),
    );

    let parsed = parse_definition_str(
        r#"
name: timeout_retry
policy:
  step_timeout: 1s
steps:
  - id: slow
    agent: ops
    capability: deploy
    on_failure: { retry: 1 }
"#,
        ParseMode::Strict,
    )
    .expect("definition");
    let report = orchestrator
        .run(parsed, None, RunOverrides::default())
        .expect("run");

    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.steps[0].attempts, 2);
    assert_eq!(report.steps[0].error_kind.as_deref(), Some("timeout"));
}
