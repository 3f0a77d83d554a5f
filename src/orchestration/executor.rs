use crate::definition::{InputSource, OnFailure, ParsedDefinition, WorkflowDefinition};
use crate::orchestration::artifacts::ArtifactRegistry;
use crate::orchestration::dispatcher::{
    AgentDispatcher, OutcomeStatus, StepInvocation, StepOutcome,
};
use crate::orchestration::error::{io_error, EngineError};
use crate::orchestration::gate::{evaluate_gate, GateDecision, GateInputs};
use crate::orchestration::resolver::{resolve, ExecutionPlan};
use crate::orchestration::state::{RunStatus, StepError, StepStatus, WorkflowState};
use crate::orchestration::state_store::StateStore;
use crate::shared::cancel::CancelToken;
use crate::shared::clock::Clock;
use crate::shared::ids::{generate_correlation_id, generate_workflow_id, step_attempt_label};
use crate::shared::logging::{append_engine_event, engine_log_path, EngineEvent};
use std::collections::{BTreeMap, BTreeSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const COMPLETION_POLL_MS: u64 = 25;
const STALL_ROUND_LIMIT: u32 = 50;

#[derive(Debug)]
struct Completion {
    step_id: String,
    attempt_label: String,
    outcome: StepOutcome,
    panicked: bool,
}

#[derive(Debug)]
struct InFlight {
    token: CancelToken,
    attempt_label: String,
    launched_mono: Duration,
    timed_out: bool,
    signalled_at: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum WaveVerdict {
    Completed,
    Loopback { target: String },
    Aborted,
    Cancelled,
}

#[derive(Debug, Default)]
struct WaveFlags {
    aborting: bool,
    cancelling: bool,
    pending_loopback: Option<(String, String)>,
}

pub struct WorkflowExecutor {
    store: StateStore,
    dispatcher: Arc<dyn AgentDispatcher>,
    clock: Arc<dyn Clock>,
    project_root: PathBuf,
}

impl WorkflowExecutor {
    pub fn new(
        store: StateStore,
        dispatcher: Arc<dyn AgentDispatcher>,
        clock: Arc<dyn Clock>,
        project_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            dispatcher,
            clock,
            project_root: project_root.into(),
        }
    }

    pub fn run(
        &self,
        parsed: &ParsedDefinition,
        variables: BTreeMap<String, String>,
    ) -> Result<WorkflowState, EngineError> {
        // Parser and resolver failures surface before any snapshot exists.
        let plan = resolve(&parsed.definition)?;

        let now = self.clock.now();
        let workflow_id = generate_workflow_id(now);
        let correlation_id = generate_correlation_id();
        let mut state = WorkflowState::new(
            workflow_id.clone(),
            parsed.digest.clone(),
            correlation_id.clone(),
            parsed
                .definition
                .steps
                .iter()
                .map(|step| step.id.as_str().to_string()),
            variables,
            now,
        );

        let _lock = self.store.acquire_run_lock(&workflow_id)?;
        self.store.save(&parsed.definition, &state, now)?;
        self.log(
            self.event(&workflow_id, "workflow_initialising")
                .with("correlationId", &correlation_id),
        )?;

        state.transition(RunStatus::Running, self.clock.now())?;
        self.save(&parsed.definition, &state)?;

        let mut registry = ArtifactRegistry::new(
            self.project_root.clone(),
            self.store.state_dir(),
            &parsed.definition.policy.artifact_roots,
        );
        self.drive_to_terminal(&parsed.definition, &plan, &mut state, &mut registry)?;
        Ok(state)
    }

    pub fn resume(
        &self,
        workflow_id: &str,
        supplied: Option<&ParsedDefinition>,
    ) -> Result<WorkflowState, EngineError> {
        let (definition, mut state) = self.store.load(workflow_id)?;
        if let Some(parsed) = supplied {
            if parsed.digest != state.definition_digest {
                return Err(EngineError::DefinitionDrift {
                    workflow_id: workflow_id.to_string(),
                });
            }
        }
        if state.status.is_terminal() {
            return Ok(state);
        }

        let _lock = self.store.acquire_run_lock(workflow_id)?;
        let plan = resolve(&definition)?;
        let now = self.clock.now();

        // A step persisted as running belonged to a process that died mid-flight.
        let mut orphans = Vec::new();
        for step in &mut state.steps {
            if step.status == StepStatus::Running {
                step.status = StepStatus::Ready;
                step.attempt = step.attempt.saturating_add(1);
                step.started_at = None;
                orphans.push(step.step_id.clone());
            }
        }
        for step_id in orphans {
            state.push_diagnostic(
                now,
                Some(&step_id),
                "orphaned running step reset for re-dispatch",
            );
        }

        if matches!(state.status, RunStatus::Paused | RunStatus::Initialising) {
            state.transition(RunStatus::Running, now)?;
        }

        state.wave_cursor = state
            .steps
            .iter()
            .filter(|step| !step.status.is_terminal())
            .filter_map(|step| plan.wave_of(&step.step_id))
            .min()
            .unwrap_or(plan.waves.len());

        let mut registry = ArtifactRegistry::new(
            self.project_root.clone(),
            self.store.state_dir(),
            &definition.policy.artifact_roots,
        );
        registry.rebuild_view(&state);

        self.save(&definition, &state)?;
        self.log(self.event(workflow_id, "workflow_resumed"))?;
        self.drive_to_terminal(&definition, &plan, &mut state, &mut registry)?;
        Ok(state)
    }

    pub fn cancel(&self, workflow_id: &str) -> Result<bool, EngineError> {
        self.store.request_cancel(workflow_id, self.clock.now())
    }

    fn drive_to_terminal(
        &self,
        definition: &WorkflowDefinition,
        plan: &ExecutionPlan,
        state: &mut WorkflowState,
        registry: &mut ArtifactRegistry,
    ) -> Result<(), EngineError> {
        match self.drive(definition, plan, state, registry) {
            Ok(()) => Ok(()),
            Err(err) => {
                if !state.status.is_terminal() {
                    state.failure = Some(StepError::from_engine_error(&err));
                    let now = self.clock.now();
                    let _ = state.transition(RunStatus::Failed, now);
                    let _ = self.store.save(definition, state, now);
                    let _ = self.log(
                        self.event(&state.workflow_id, "workflow_failed")
                            .with("kind", err.kind()),
                    );
                }
                Err(err)
            }
        }
    }

    fn drive(
        &self,
        definition: &WorkflowDefinition,
        plan: &ExecutionPlan,
        state: &mut WorkflowState,
        registry: &mut ArtifactRegistry,
    ) -> Result<(), EngineError> {
        let workflow_token = CancelToken::new();

        while state.wave_cursor < plan.waves.len() {
            let verdict = self.run_wave(definition, plan, state, registry, &workflow_token)?;
            match verdict {
                WaveVerdict::Completed => {
                    state.wave_cursor += 1;
                    self.save(definition, state)?;
                }
                WaveVerdict::Loopback { target } => {
                    let wave = plan.wave_of(&target).ok_or_else(|| {
                        EngineError::Internal(format!(
                            "loopback target `{target}` has no wave assignment"
                        ))
                    })?;
                    state.wave_cursor = wave;
                    self.save(definition, state)?;
                }
                WaveVerdict::Aborted => return self.finalise(definition, state, RunStatus::Failed),
                WaveVerdict::Cancelled => {
                    return self.finalise(definition, state, RunStatus::Cancelled)
                }
            }
        }

        self.finalise(definition, state, RunStatus::Succeeded)
    }

    fn finalise(
        &self,
        definition: &WorkflowDefinition,
        state: &mut WorkflowState,
        status: RunStatus,
    ) -> Result<(), EngineError> {
        let now = self.clock.now();
        state.transition(status, now)?;
        self.store.save(definition, state, now)?;
        self.store.clear_cancel_marker(&state.workflow_id);
        self.log(
            self.event(&state.workflow_id, "workflow_transition")
                .with("status", status.to_string()),
        )?;
        Ok(())
    }

    fn run_wave(
        &self,
        definition: &WorkflowDefinition,
        plan: &ExecutionPlan,
        state: &mut WorkflowState,
        registry: &mut ArtifactRegistry,
        workflow_token: &CancelToken,
    ) -> Result<WaveVerdict, EngineError> {
        let wave_steps = plan.waves[state.wave_cursor].steps.clone();
        let step_timeout = definition.policy.step_timeout.as_duration();
        let cancel_grace = definition.policy.cancel_grace.as_duration();
        let max_parallelism = definition.policy.max_parallelism.max(1);

        let (tx, rx) = mpsc::channel::<Completion>();
        let mut in_flight: BTreeMap<String, InFlight> = BTreeMap::new();
        let mut flags = WaveFlags::default();
        let mut stall_rounds = 0u32;

        loop {
            let mut progressed = false;

            if !flags.cancelling
                && (workflow_token.is_cancelled()
                    || self.store.cancel_requested(&state.workflow_id))
            {
                flags.cancelling = true;
                let now = self.clock.now();
                state.push_diagnostic(now, None, "cancellation requested");
                let signalled = self.clock.monotonic();
                for running in in_flight.values_mut() {
                    running.token.cancel();
                    if running.signalled_at.is_none() {
                        running.signalled_at = Some(signalled);
                    }
                }
                self.save(definition, state)?;
                progressed = true;
            }

            let quiescing =
                flags.cancelling || flags.aborting || flags.pending_loopback.is_some();
            if !quiescing {
                progressed |=
                    self.mark_ready_steps(definition, plan, state, registry, &wave_steps)?;
                progressed |= self.launch_ready(
                    definition,
                    state,
                    registry,
                    &wave_steps,
                    &mut in_flight,
                    &tx,
                    workflow_token,
                    max_parallelism,
                    &mut flags,
                )?;
            }

            // Deadline race: signalling at exactly the deadline keeps timeouts deterministic.
            let mono = self.clock.monotonic();
            for (step_id, running) in in_flight.iter_mut() {
                if !running.timed_out
                    && mono.saturating_sub(running.launched_mono) >= step_timeout
                {
                    running.timed_out = true;
                    running.token.cancel();
                    if running.signalled_at.is_none() {
                        running.signalled_at = Some(mono);
                    }
                    self.log(
                        self.event(&state.workflow_id, "deadline_signalled")
                            .with("stepId", step_id.as_str()),
                    )?;
                }
            }

            let stuck: Vec<String> = in_flight
                .iter()
                .filter(|(_, running)| {
                    running
                        .signalled_at
                        .map(|at| mono.saturating_sub(at) >= cancel_grace)
                        .unwrap_or(false)
                })
                .map(|(step_id, _)| step_id.clone())
                .collect();
            for step_id in stuck {
                let Some(running) = in_flight.remove(&step_id) else {
                    continue;
                };
                progressed = true;
                let now = self.clock.now();
                if running.timed_out && !flags.cancelling {
                    self.apply_failure(
                        definition,
                        state,
                        &step_id,
                        StepError::new(
                            "timeout",
                            format!(
                                "step `{step_id}` exceeded its deadline of {}s",
                                step_timeout.as_secs()
                            ),
                        ),
                        true,
                        &mut flags,
                    )?;
                } else {
                    state.transition_step(&step_id, StepStatus::Cancelled, now)?;
                    if let Some(step) = state.step_mut(&step_id) {
                        step.ended_at = Some(now);
                        step.error = Some(StepError::new("cancelled", "workflow cancelled"));
                    }
                    state.push_diagnostic(now, Some(&step_id), "stuck_after_cancel");
                    self.save(definition, state)?;
                }
            }

            match rx.recv_timeout(Duration::from_millis(COMPLETION_POLL_MS)) {
                Ok(done) => {
                    progressed = true;
                    self.handle_completion(
                        definition,
                        state,
                        registry,
                        &mut in_flight,
                        done,
                        &mut flags,
                    )?;
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(EngineError::Internal(
                        "step completion channel disconnected".to_string(),
                    ));
                }
            }
            while let Ok(done) = rx.try_recv() {
                progressed = true;
                self.handle_completion(
                    definition,
                    state,
                    registry,
                    &mut in_flight,
                    done,
                    &mut flags,
                )?;
            }

            if in_flight.is_empty() {
                if flags.cancelling {
                    return Ok(WaveVerdict::Cancelled);
                }
                if let Some((gate_id, target)) = flags.pending_loopback.take() {
                    self.apply_loopback(definition, plan, state, registry, &gate_id, &target)?;
                    return Ok(WaveVerdict::Loopback { target });
                }
                if flags.aborting {
                    return Ok(WaveVerdict::Aborted);
                }
                let all_terminal = wave_steps.iter().all(|step_id| {
                    state
                        .step(step_id)
                        .map(|step| step.status.is_terminal())
                        .unwrap_or(false)
                });
                if all_terminal {
                    return Ok(WaveVerdict::Completed);
                }
                if !progressed {
                    stall_rounds += 1;
                    if stall_rounds > STALL_ROUND_LIMIT {
                        return Err(EngineError::Internal(format!(
                            "wave {} made no progress while steps remain non-terminal",
                            state.wave_cursor
                        )));
                    }
                } else {
                    stall_rounds = 0;
                }
            } else if progressed {
                stall_rounds = 0;
            }
        }
    }

    fn mark_ready_steps(
        &self,
        definition: &WorkflowDefinition,
        plan: &ExecutionPlan,
        state: &mut WorkflowState,
        registry: &ArtifactRegistry,
        wave_steps: &[String],
    ) -> Result<bool, EngineError> {
        let mut progressed = false;
        for step_id in wave_steps {
            let Some(step) = state.step(step_id) else {
                continue;
            };
            if step.status != StepStatus::Pending {
                continue;
            }

            let mut predecessors_done = true;
            let mut failed_producer = false;
            for predecessor in plan.predecessors_of(step_id) {
                match state.step(predecessor).map(|p| p.status) {
                    Some(StepStatus::Succeeded) | Some(StepStatus::Skipped) => {}
                    Some(status) if status.is_terminal() => {
                        predecessors_done = true;
                        failed_producer = true;
                    }
                    _ => {
                        predecessors_done = false;
                        break;
                    }
                }
            }
            if !predecessors_done {
                continue;
            }

            let step_def = definition.step(step_id).ok_or_else(|| {
                EngineError::Internal(format!("step `{step_id}` missing from definition"))
            })?;

            let mut missing_input: Option<String> = None;
            for (_, reference) in step_def.artifact_inputs() {
                if registry.resolve(&reference.reference()).is_none() {
                    missing_input = Some(reference.reference());
                    break;
                }
            }

            let now = self.clock.now();
            if missing_input.is_some() || failed_producer {
                // A skipped or failed producer leaves nothing to consume.
                state.transition_step(step_id, StepStatus::Skipped, now)?;
                if let Some(step) = state.step_mut(step_id) {
                    step.ended_at = Some(now);
                }
                let reason = missing_input
                    .map(|reference| format!("input `{reference}` is unavailable"))
                    .unwrap_or_else(|| "a predecessor did not succeed".to_string());
                state.push_diagnostic(now, Some(step_id), format!("skipped: {reason}"));
                self.save(definition, state)?;
                self.log(
                    self.event(&state.workflow_id, "step_transition")
                        .with("stepId", step_id.as_str())
                        .with("status", "skipped"),
                )?;
            } else {
                state.transition_step(step_id, StepStatus::Ready, now)?;
                self.save(definition, state)?;
            }
            progressed = true;
        }
        Ok(progressed)
    }

    #[allow(clippy::too_many_arguments)]
    fn launch_ready(
        &self,
        definition: &WorkflowDefinition,
        state: &mut WorkflowState,
        registry: &ArtifactRegistry,
        wave_steps: &[String],
        in_flight: &mut BTreeMap<String, InFlight>,
        tx: &Sender<Completion>,
        workflow_token: &CancelToken,
        max_parallelism: usize,
        flags: &mut WaveFlags,
    ) -> Result<bool, EngineError> {
        let mut progressed = false;
        loop {
            if in_flight.len() >= max_parallelism {
                break;
            }

            let running_groups: BTreeSet<Option<String>> = in_flight
                .keys()
                .map(|step_id| {
                    definition
                        .step(step_id)
                        .and_then(|step| step.parallel_group.clone())
                })
                .collect();

            let candidate = wave_steps.iter().find(|step_id| {
                let is_ready = state
                    .step(step_id.as_str())
                    .map(|step| step.status == StepStatus::Ready)
                    .unwrap_or(false);
                if !is_ready || in_flight.contains_key(step_id.as_str()) {
                    return false;
                }
                if in_flight.is_empty() {
                    return true;
                }
                // Concurrency is only permitted among steps sharing one tag.
                let group = definition
                    .step(step_id.as_str())
                    .and_then(|step| step.parallel_group.clone());
                group.is_some() && running_groups.len() == 1 && running_groups.contains(&group)
            });
            let Some(step_id) = candidate.cloned() else {
                break;
            };

            let step_def = definition.step(&step_id).ok_or_else(|| {
                EngineError::Internal(format!("step `{step_id}` missing from definition"))
            })?;

            if !self
                .dispatcher
                .supports(step_def.agent, &step_def.capability)
            {
                self.apply_failure(
                    definition,
                    state,
                    &step_id,
                    StepError::new(
                        "dispatch_failed",
                        format!(
                            "no dispatcher supports agent `{}` capability `{}`",
                            step_def.agent, step_def.capability
                        ),
                    ),
                    false,
                    flags,
                )?;
                progressed = true;
                continue;
            }

            let inputs = match self.resolve_inputs(definition, state, registry, &step_id) {
                Ok(inputs) => inputs,
                Err(err) => {
                    self.apply_failure(
                        definition,
                        state,
                        &step_id,
                        StepError::from_engine_error(&err),
                        false,
                        flags,
                    )?;
                    progressed = true;
                    continue;
                }
            };

            let now = self.clock.now();
            let (iteration, attempt) = state
                .step(&step_id)
                .map(|step| (step.iteration, step.attempt))
                .unwrap_or((0, 0));
            let attempt_label = step_attempt_label(&step_id, iteration, attempt);
            state.transition_step(&step_id, StepStatus::Running, now)?;
            if let Some(step) = state.step_mut(&step_id) {
                step.started_at = Some(now);
                step.ended_at = None;
            }
            self.save(definition, state)?;
            self.log(
                self.event(&state.workflow_id, "step_transition")
                    .with("stepId", &step_id)
                    .with("status", "running")
                    .with("attempt", &attempt_label),
            )?;

            let invocation = StepInvocation {
                workflow_id: state.workflow_id.clone(),
                correlation_id: state.correlation_id.clone(),
                step_id: step_id.clone(),
                agent: step_def.agent,
                capability: step_def.capability.clone(),
                iteration,
                attempt,
                attempt_label: attempt_label.clone(),
                inputs,
                outputs: step_def
                    .outputs
                    .iter()
                    .map(|logical| logical.as_str().to_string())
                    .collect(),
                variables: state.variables.clone(),
            };
            let token = workflow_token.child();
            let worker_token = token.clone();
            let dispatcher = self.dispatcher.clone();
            let worker_tx = tx.clone();
            let worker_step = step_id.clone();
            let worker_label = attempt_label.clone();
            thread::spawn(move || {
                let result = catch_unwind(AssertUnwindSafe(|| {
                    dispatcher.invoke(&invocation, &worker_token)
                }));
                let (outcome, panicked) = match result {
                    Ok(outcome) => (outcome, false),
                    Err(_) => (
                        StepOutcome::failed("agent dispatcher panicked", false),
                        true,
                    ),
                };
                let _ = worker_tx.send(Completion {
                    step_id: worker_step,
                    attempt_label: worker_label,
                    outcome,
                    panicked,
                });
            });

            in_flight.insert(
                step_id,
                InFlight {
                    token,
                    attempt_label,
                    launched_mono: self.clock.monotonic(),
                    timed_out: false,
                    signalled_at: None,
                },
            );
            progressed = true;
        }
        Ok(progressed)
    }

    fn resolve_inputs(
        &self,
        definition: &WorkflowDefinition,
        state: &WorkflowState,
        registry: &ArtifactRegistry,
        step_id: &str,
    ) -> Result<BTreeMap<String, Vec<u8>>, EngineError> {
        let step_def = definition.step(step_id).ok_or_else(|| {
            EngineError::Internal(format!("step `{step_id}` missing from definition"))
        })?;
        let mut inputs = BTreeMap::new();
        for (name, source) in &step_def.inputs {
            let bytes = match source {
                InputSource::Prompt => state
                    .variables
                    .get("prompt")
                    .cloned()
                    .unwrap_or_default()
                    .into_bytes(),
                InputSource::Literal(value) => value.clone().into_bytes(),
                InputSource::Artifact(reference) => {
                    let record = registry
                        .resolve(&reference.reference())
                        .ok_or_else(|| EngineError::NotFound {
                            resource: format!("artifact `{}`", reference.reference()),
                        })?;
                    registry.read(record)?
                }
            };
            inputs.insert(name.clone(), bytes);
        }
        Ok(inputs)
    }

    fn handle_completion(
        &self,
        definition: &WorkflowDefinition,
        state: &mut WorkflowState,
        registry: &mut ArtifactRegistry,
        in_flight: &mut BTreeMap<String, InFlight>,
        done: Completion,
        flags: &mut WaveFlags,
    ) -> Result<(), EngineError> {
        let matches_current = in_flight
            .get(&done.step_id)
            .map(|running| running.attempt_label == done.attempt_label)
            .unwrap_or(false);
        if !matches_current {
            // Late result from an attempt that was already force-completed.
            return Ok(());
        }
        let running = in_flight
            .remove(&done.step_id)
            .ok_or_else(|| EngineError::Internal("in-flight entry vanished".to_string()))?;
        let step_id = done.step_id;
        let now = self.clock.now();

        if done.panicked {
            // Escaped panics map to internal and abort the workflow outright.
            self.apply_failure(
                definition,
                state,
                &step_id,
                StepError::new("internal", "agent dispatcher panicked"),
                false,
                flags,
            )?;
            if state.failure.is_none() {
                state.failure = Some(StepError::new("internal", "agent dispatcher panicked"));
            }
            flags.aborting = true;
            return Ok(());
        }

        if running.timed_out {
            return self.apply_failure(
                definition,
                state,
                &step_id,
                StepError::new(
                    "timeout",
                    format!(
                        "step `{step_id}` exceeded its deadline of {}s",
                        definition.policy.step_timeout.as_secs()
                    ),
                ),
                true,
                flags,
            );
        }

        if flags.cancelling && running.token.is_cancelled() {
            state.transition_step(&step_id, StepStatus::Cancelled, now)?;
            if let Some(step) = state.step_mut(&step_id) {
                step.ended_at = Some(now);
                step.error = Some(StepError::new("cancelled", "workflow cancelled"));
            }
            self.save(definition, state)?;
            self.log(
                self.event(&state.workflow_id, "step_transition")
                    .with("stepId", &step_id)
                    .with("status", "cancelled"),
            )?;
            return Ok(());
        }

        match done.outcome.status {
            OutcomeStatus::Succeeded => self.apply_success(
                definition,
                state,
                registry,
                &step_id,
                done.outcome,
                flags,
            ),
            OutcomeStatus::Failed => {
                let reason = done
                    .outcome
                    .diagnostic
                    .unwrap_or_else(|| "agent reported failure".to_string());
                let retryable = done.outcome.retryable;
                self.apply_failure(
                    definition,
                    state,
                    &step_id,
                    StepError::new("dispatch_failed", reason),
                    retryable,
                    flags,
                )
            }
        }
    }

    fn apply_success(
        &self,
        definition: &WorkflowDefinition,
        state: &mut WorkflowState,
        registry: &mut ArtifactRegistry,
        step_id: &str,
        outcome: StepOutcome,
        flags: &mut WaveFlags,
    ) -> Result<(), EngineError> {
        let step_def = definition.step(step_id).ok_or_else(|| {
            EngineError::Internal(format!("step `{step_id}` missing from definition"))
        })?;
        let produced: BTreeMap<String, Vec<u8>> = outcome.produced.into_iter().collect();

        for declared in &step_def.outputs {
            if !produced.contains_key(declared.as_str()) {
                return self.apply_failure(
                    definition,
                    state,
                    step_id,
                    StepError::new(
                        "dispatch_failed",
                        format!("step promised output `{declared}` but did not produce it"),
                    ),
                    false,
                    flags,
                );
            }
        }

        let now = self.clock.now();
        let iteration = state
            .step(step_id)
            .map(|step| step.iteration)
            .unwrap_or(0);
        let mut records = Vec::new();
        for declared in &step_def.outputs {
            let bytes = &produced[declared.as_str()];
            match registry.write(
                &state.workflow_id,
                step_id,
                declared.as_str(),
                iteration,
                bytes,
                iteration > 0,
                now,
            ) {
                Ok(record) => records.push(record),
                Err(err) => {
                    let error = StepError::from_engine_error(&err);
                    return self.apply_failure(definition, state, step_id, error, false, flags);
                }
            }
        }
        for extra in produced.keys() {
            if !step_def
                .outputs
                .iter()
                .any(|declared| declared.as_str() == extra)
            {
                state.push_diagnostic(
                    now,
                    Some(step_id),
                    format!("ignoring undeclared output `{extra}`"),
                );
            }
        }

        state.transition_step(step_id, StepStatus::Succeeded, now)?;
        if let Some(step) = state.step_mut(step_id) {
            step.produced_artifacts = records;
            step.score = outcome.score;
            step.ended_at = Some(now);
            step.error = None;
        }
        for (name, value) in &outcome.secondary_signals {
            state.signals.insert(name.clone(), *value);
        }
        self.save(definition, state)?;
        let mut success_event = self
            .event(&state.workflow_id, "step_transition")
            .with("stepId", step_id)
            .with("status", "succeeded");
        if let Some(score) = outcome.score {
            success_event = success_event.with("score", score.to_string());
        }
        self.log(success_event)?;

        if let Some(gate_id) = &step_def.gate {
            let gate = definition.gate(gate_id.as_str()).ok_or_else(|| {
                EngineError::Internal(format!("gate `{gate_id}` missing from definition"))
            })?;
            let iterations = state
                .gate_iterations
                .get(gate_id.as_str())
                .copied()
                .unwrap_or(0);
            let decision = evaluate_gate(
                gate,
                GateInputs {
                    score: outcome.score,
                    signals: &state.signals,
                },
                iterations,
            );
            match decision {
                GateDecision::Pass => {}
                GateDecision::Warn { reason } => {
                    state.push_diagnostic(
                        now,
                        Some(step_id),
                        format!("gate `{gate_id}` warning: {reason}"),
                    );
                    self.save(definition, state)?;
                }
                GateDecision::Loopback { to } => {
                    if flags.pending_loopback.is_none() {
                        flags.pending_loopback = Some((gate_id.as_str().to_string(), to));
                    } else {
                        state.push_diagnostic(
                            now,
                            Some(step_id),
                            format!("gate `{gate_id}` loopback ignored; another is pending"),
                        );
                        self.save(definition, state)?;
                    }
                }
                GateDecision::Fail { reason } => {
                    let message = format!("gate `{gate_id}` failed: {reason}");
                    state.push_diagnostic(now, Some(step_id), message.clone());
                    if state.failure.is_none() {
                        state.failure = Some(StepError::new("gate_failed", message));
                    }
                    flags.aborting = true;
                    self.save(definition, state)?;
                    self.log(
                        self.event(&state.workflow_id, "gate_decision")
                            .with("stepId", step_id)
                            .with("gateId", gate_id.as_str())
                            .with("decision", "fail"),
                    )?;
                }
            }
        }
        Ok(())
    }

    fn apply_failure(
        &self,
        definition: &WorkflowDefinition,
        state: &mut WorkflowState,
        step_id: &str,
        error: StepError,
        outcome_retryable: bool,
        flags: &mut WaveFlags,
    ) -> Result<(), EngineError> {
        let step_def = definition.step(step_id).ok_or_else(|| {
            EngineError::Internal(format!("step `{step_id}` missing from definition"))
        })?;
        let attempt = state.step(step_id).map(|step| step.attempt).unwrap_or(0);
        let now = self.clock.now();

        let can_retry = match step_def.on_failure {
            OnFailure::Retry(limit) => outcome_retryable && attempt < limit,
            _ => false,
        };

        if can_retry {
            state.transition_step(step_id, StepStatus::Ready, now)?;
            if let Some(step) = state.step_mut(step_id) {
                step.attempt = step.attempt.saturating_add(1);
                step.error = Some(error.clone());
                step.started_at = None;
                step.ended_at = None;
            }
            state.push_diagnostic(
                now,
                Some(step_id),
                format!("retrying after {}: {}", error.kind, error.message),
            );
            self.save(definition, state)?;
            self.log(
                self.event(&state.workflow_id, "step_retry")
                    .with("stepId", step_id)
                    .with("attempt", (attempt + 1).to_string()),
            )?;
            return Ok(());
        }

        match step_def.on_failure {
            OnFailure::Skip => {
                state.transition_step(step_id, StepStatus::Skipped, now)?;
                if let Some(step) = state.step_mut(step_id) {
                    step.ended_at = Some(now);
                    step.error = Some(error.clone());
                }
                state.push_diagnostic(
                    now,
                    Some(step_id),
                    format!("skipped after {}: {}", error.kind, error.message),
                );
                self.save(definition, state)?;
                self.log(
                    self.event(&state.workflow_id, "step_transition")
                        .with("stepId", step_id)
                        .with("status", "skipped")
                        .with("kind", &error.kind),
                )?;
            }
            OnFailure::Abort | OnFailure::Retry(_) => {
                state.transition_step(step_id, StepStatus::Failed, now)?;
                if let Some(step) = state.step_mut(step_id) {
                    step.ended_at = Some(now);
                    step.error = Some(error.clone());
                }
                if state.failure.is_none() {
                    state.failure = Some(error.clone());
                }
                flags.aborting = true;
                self.save(definition, state)?;
                self.log(
                    self.event(&state.workflow_id, "step_transition")
                        .with("stepId", step_id)
                        .with("status", "failed")
                        .with("kind", &error.kind),
                )?;
            }
        }
        Ok(())
    }

    fn apply_loopback(
        &self,
        definition: &WorkflowDefinition,
        plan: &ExecutionPlan,
        state: &mut WorkflowState,
        registry: &mut ArtifactRegistry,
        gate_id: &str,
        target: &str,
    ) -> Result<(), EngineError> {
        let now = self.clock.now();
        let count = state
            .gate_iterations
            .entry(gate_id.to_string())
            .or_insert(0);
        *count += 1;
        let iteration_count = *count;

        let mut reset_set = plan.descendants_of(target);
        reset_set.insert(target.to_string());
        for step_id in &reset_set {
            if let Some(step) = state.step_mut(step_id) {
                if step.status == StepStatus::Pending {
                    continue;
                }
                step.reset_for_loopback();
            }
            registry.remove_step(step_id);
        }

        state.push_diagnostic(
            now,
            Some(target),
            format!("gate `{gate_id}` loopback to `{target}` (iteration {iteration_count})"),
        );
        state.updated_at = now;
        self.save(definition, state)?;
        self.log(
            self.event(&state.workflow_id, "gate_loopback")
                .with("gateId", gate_id)
                .with("target", target)
                .with("iteration", iteration_count.to_string()),
        )?;
        Ok(())
    }

    fn save(
        &self,
        definition: &WorkflowDefinition,
        state: &WorkflowState,
    ) -> Result<(), EngineError> {
        self.store.save(definition, state, self.clock.now())
    }

    fn event(&self, workflow_id: &str, name: &str) -> EngineEvent {
        EngineEvent::new(self.clock.now(), workflow_id, name)
    }

    fn log(&self, event: EngineEvent) -> Result<(), EngineError> {
        append_engine_event(self.store.state_dir(), &event)
            .map_err(|err| io_error(&engine_log_path(self.store.state_dir()), err))
    }
}

pub fn deadline_exceeded(elapsed: Duration, timeout: Duration) -> bool {
    elapsed >= timeout
}
