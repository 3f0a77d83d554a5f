use std::sync::Arc;
use std::time::{Duration, Instant};
use tapps::definition::{parse_definition_str, AgentKind, Capability, ParseMode};
use tapps::orchestration::dispatcher::{AgentDispatcher, StepInvocation, StepOutcome};
use tapps::orchestration::facade::{Orchestrator, RunOverrides};
use tapps::orchestration::state::{RunStatus, StepStatus};
use tapps::orchestration::state_store::StateStore;
use tapps::shared::cancel::{sleep_with_cancel, CancelToken};
use tapps::shared::clock::SystemClock;
use tempfile::tempdir;

const SLOW: &str = r#"
name: slow_workflow
steps:
  - id: long_running
    agent: ops
    capability: deploy
    outputs: [log_out]
  - id: after
    agent: documenter
    capability: document
    inputs:
      log: { artifact: long_running.log_out }
"#;

struct CooperativeSleeper {
    hold: Duration,
}

impl AgentDispatcher for CooperativeSleeper {
    fn supports(&self, _agent: AgentKind, _capability: &Capability) -> bool {
        true
    }

    fn invoke(&self, invocation: &StepInvocation, cancel: &CancelToken) -> StepOutcome {
        if sleep_with_cancel(cancel, self.hold) {
            StepOutcome::succeeded(
                invocation
                    .outputs
                    .iter()
                    .map(|name| (name.clone(), b"log".to_vec()))
                    .collect(),
            )
        } else {
            StepOutcome::failed("invocation cancelled", false)
        }
    }
}

#[test]
fn cancel_marker_stops_the_workflow_and_marks_running_steps_cancelled() {
    let dir = tempdir().expect("tempdir");
    let state_dir = dir.path().join(".tapps");
    let orchestrator = Orchestrator::new(
        state_dir.clone(),
        dir.path(),
        Arc::new(CooperativeSleeper {
            hold: Duration::from_secs(20),
        }),
        Arc::new(SystemClock::new()),
    );

    let parsed = parse_definition_str(SLOW, ParseMode::Strict).expect("definition");
    let runner = std::thread::spawn(move || {
        orchestrator.run(parsed, None, RunOverrides::default())
    });

    // Discover the workflow id from the snapshot the run writes at start.
    let store = StateStore::new(&state_dir);
    let deadline = Instant::now() + Duration::from_secs(5);
    let workflow_id = loop {
        if let Ok(summaries) = store.list() {
            if let Some(summary) = summaries.first() {
                break summary.workflow_id.clone();
            }
        }
        assert!(Instant::now() < deadline, "run never wrote a snapshot");
        std::thread::sleep(Duration::from_millis(20));
    };
    assert!(store.request_cancel(&workflow_id, 0).expect("marker"));

    let report = runner
        .join()
        .expect("runner thread")
        .expect("run returns a report");
    assert_eq!(report.status, RunStatus::Cancelled);
    assert_eq!(report.exit_code(), 3);

    let status_of = |step_id: &str| {
        report
            .steps
            .iter()
            .find(|step| step.step_id == step_id)
            .map(|step| step.status)
            .expect("step")
    };
    assert_eq!(status_of("long_running"), StepStatus::Cancelled);
    // Later waves never started.
    assert_eq!(status_of("after"), StepStatus::Pending);

    let state = store.load(&workflow_id).expect("load").1;
    assert!(state
        .diagnostics
        .iter()
        .any(|entry| entry.message.contains("cancellation requested")));
    // The marker is cleared once the terminal snapshot is written.
    assert!(!store.cancel_requested(&workflow_id));
}
