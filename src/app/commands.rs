use crate::definition::{parse_duration, DurationValue};
use crate::dispatch::ProcessDispatcher;
use crate::orchestration::facade::{exit_code_for_error, Orchestrator, RunOverrides};
use crate::orchestration::state_store::PrunePolicy;
use crate::shared::clock::SystemClock;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const STATE_DIR_ENV: &str = "TAPPS_STATE_DIR";
pub const AGENT_RUNNER_ENV: &str = "TAPPS_AGENT_RUNNER";
pub const DEFAULT_STATE_DIR: &str = ".tapps";
pub const DEFAULT_AGENT_RUNNER: &str = "tapps-agent";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CliOutcome {
    pub output: String,
    pub exit_code: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CliFailure {
    pub message: String,
    pub exit_code: i32,
}

impl CliFailure {
    fn usage(message: impl Into<String>) -> Self {
        Self {
            message: format!("{}\n\n{}", message.into(), usage()),
            exit_code: 1,
        }
    }
}

pub fn usage() -> String {
    [
        "usage: tapps <command> [args]",
        "",
        "commands:",
        "  run <definition.yaml> [--prompt <text>] [--var k=v]... [--lenient]",
        "      [--max-parallelism N] [--step-timeout <duration>]",
        "  resume <workflow_id> [--definition <path>]",
        "  cancel <workflow_id>",
        "  list",
        "  show <workflow_id>",
        "  cleanup [--retention-days N] [--max-states N] [--include-active]",
        "  validate <definition.yaml> [--lenient]",
    ]
    .join("\n")
}

pub fn resolve_state_dir(project_root: &Path) -> PathBuf {
    match std::env::var_os(STATE_DIR_ENV) {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => project_root.join(DEFAULT_STATE_DIR),
    }
}

pub fn resolve_agent_runner() -> String {
    std::env::var(AGENT_RUNNER_ENV).unwrap_or_else(|_| DEFAULT_AGENT_RUNNER.to_string())
}

pub fn build_orchestrator() -> Orchestrator {
    let project_root = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let state_dir = resolve_state_dir(&project_root);
    let dispatcher = Arc::new(ProcessDispatcher::new(
        resolve_agent_runner(),
        state_dir.join("dispatch"),
    ));
    Orchestrator::new(
        state_dir,
        project_root,
        dispatcher,
        Arc::new(SystemClock::new()),
    )
}

pub fn run_cli(args: Vec<String>) -> Result<CliOutcome, CliFailure> {
    let orchestrator = build_orchestrator();
    run_cli_with(args, &orchestrator)
}

pub fn run_cli_with(
    args: Vec<String>,
    orchestrator: &Orchestrator,
) -> Result<CliOutcome, CliFailure> {
    let mut args = args.into_iter();
    let Some(command) = args.next() else {
        return Err(CliFailure::usage("missing command"));
    };
    let rest: Vec<String> = args.collect();

    match command.as_str() {
        "run" => run_command(rest, orchestrator),
        "resume" => resume_command(rest, orchestrator),
        "cancel" => cancel_command(rest, orchestrator),
        "list" => list_command(rest, orchestrator),
        "show" => show_command(rest, orchestrator),
        "cleanup" => cleanup_command(rest, orchestrator),
        "validate" => validate_command(rest, orchestrator),
        "help" | "--help" | "-h" => Ok(CliOutcome {
            output: usage(),
            exit_code: 0,
        }),
        other => Err(CliFailure::usage(format!("unknown command `{other}`"))),
    }
}

fn run_command(args: Vec<String>, orchestrator: &Orchestrator) -> Result<CliOutcome, CliFailure> {
    let mut definition_path: Option<PathBuf> = None;
    let mut prompt: Option<String> = None;
    let mut overrides = RunOverrides::default();

    let mut iter = args.into_iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--prompt" => prompt = Some(required_value(&mut iter, "--prompt")?),
            "--var" => {
                let raw = required_value(&mut iter, "--var")?;
                let (key, value) = parse_var(&raw)?;
                overrides.variables.insert(key, value);
            }
            "--lenient" => overrides.lenient = true,
            "--max-parallelism" => {
                let raw = required_value(&mut iter, "--max-parallelism")?;
                let parsed = raw.parse::<usize>().map_err(|_| {
                    CliFailure::usage(format!("--max-parallelism `{raw}` is not an integer"))
                })?;
                overrides.max_parallelism = Some(parsed);
            }
            "--step-timeout" => {
                let raw = required_value(&mut iter, "--step-timeout")?;
                let parsed = parse_duration(&raw)
                    .map_err(|err| CliFailure::usage(format!("--step-timeout: {err}")))?;
                overrides.step_timeout = Some(DurationValue::from_secs(parsed.as_secs()));
            }
            other if other.starts_with("--") => {
                return Err(CliFailure::usage(format!("unknown flag `{other}`")));
            }
            positional => {
                if definition_path.is_some() {
                    return Err(CliFailure::usage("run accepts one definition path"));
                }
                definition_path = Some(PathBuf::from(positional));
            }
        }
    }

    let Some(definition_path) = definition_path else {
        return Err(CliFailure::usage("run requires a definition path"));
    };

    let report = orchestrator
        .run_file(&definition_path, prompt.as_deref(), overrides)
        .map_err(engine_failure)?;
    Ok(CliOutcome {
        exit_code: report.exit_code(),
        output: report.render(),
    })
}

fn resume_command(
    args: Vec<String>,
    orchestrator: &Orchestrator,
) -> Result<CliOutcome, CliFailure> {
    let mut workflow_id: Option<String> = None;
    let mut definition_path: Option<PathBuf> = None;
    let mut overrides = RunOverrides::default();

    let mut iter = args.into_iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--definition" => {
                definition_path = Some(PathBuf::from(required_value(&mut iter, "--definition")?));
            }
            "--lenient" => overrides.lenient = true,
            other if other.starts_with("--") => {
                return Err(CliFailure::usage(format!("unknown flag `{other}`")));
            }
            positional => {
                if workflow_id.is_some() {
                    return Err(CliFailure::usage("resume accepts one workflow id"));
                }
                workflow_id = Some(positional.to_string());
            }
        }
    }

    let Some(workflow_id) = workflow_id else {
        return Err(CliFailure::usage("resume requires a workflow id"));
    };

    let report = orchestrator
        .resume(&workflow_id, definition_path.as_deref(), overrides)
        .map_err(engine_failure)?;
    Ok(CliOutcome {
        exit_code: report.exit_code(),
        output: report.render(),
    })
}

fn cancel_command(
    args: Vec<String>,
    orchestrator: &Orchestrator,
) -> Result<CliOutcome, CliFailure> {
    let [workflow_id] = args.as_slice() else {
        return Err(CliFailure::usage("cancel requires exactly one workflow id"));
    };
    let cancelled = orchestrator.cancel(workflow_id).map_err(engine_failure)?;
    if !cancelled {
        return Err(CliFailure {
            message: format!("workflow run `{workflow_id}` not found"),
            exit_code: 1,
        });
    }
    Ok(CliOutcome {
        output: format!("cancellation requested for {workflow_id}"),
        exit_code: 0,
    })
}

fn list_command(args: Vec<String>, orchestrator: &Orchestrator) -> Result<CliOutcome, CliFailure> {
    if !args.is_empty() {
        return Err(CliFailure::usage("list takes no arguments"));
    }
    let summaries = orchestrator.list().map_err(engine_failure)?;
    if summaries.is_empty() {
        return Ok(CliOutcome {
            output: "no workflow runs".to_string(),
            exit_code: 0,
        });
    }
    let lines: Vec<String> = summaries
        .iter()
        .map(|summary| {
            format!(
                "{} {} created={} updated={}",
                summary.workflow_id, summary.status, summary.created_at, summary.updated_at
            )
        })
        .collect();
    Ok(CliOutcome {
        output: lines.join("\n"),
        exit_code: 0,
    })
}

fn show_command(args: Vec<String>, orchestrator: &Orchestrator) -> Result<CliOutcome, CliFailure> {
    let [workflow_id] = args.as_slice() else {
        return Err(CliFailure::usage("show requires exactly one workflow id"));
    };
    let state = orchestrator.show(workflow_id).map_err(engine_failure)?;
    let rendered = serde_json::to_string_pretty(&state).map_err(|err| CliFailure {
        message: format!("failed to render workflow state: {err}"),
        exit_code: 4,
    })?;
    Ok(CliOutcome {
        output: rendered,
        exit_code: 0,
    })
}

fn cleanup_command(
    args: Vec<String>,
    orchestrator: &Orchestrator,
) -> Result<CliOutcome, CliFailure> {
    let mut policy = PrunePolicy::default();

    let mut iter = args.into_iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--retention-days" => {
                let raw = required_value(&mut iter, "--retention-days")?;
                let parsed = raw.parse::<u32>().map_err(|_| {
                    CliFailure::usage(format!("--retention-days `{raw}` is not an integer"))
                })?;
                policy.retention_days = Some(parsed);
            }
            "--max-states" => {
                let raw = required_value(&mut iter, "--max-states")?;
                let parsed = raw.parse::<usize>().map_err(|_| {
                    CliFailure::usage(format!("--max-states `{raw}` is not an integer"))
                })?;
                policy.max_states = Some(parsed);
            }
            "--include-active" => policy.terminal_only = false,
            other => return Err(CliFailure::usage(format!("unknown flag `{other}`"))),
        }
    }

    if policy.retention_days.is_none() && policy.max_states.is_none() {
        return Err(CliFailure::usage(
            "cleanup requires --retention-days and/or --max-states",
        ));
    }

    let removed = orchestrator.cleanup(policy).map_err(engine_failure)?;
    Ok(CliOutcome {
        output: format!("removed {removed} state snapshot(s)"),
        exit_code: 0,
    })
}

fn validate_command(
    args: Vec<String>,
    orchestrator: &Orchestrator,
) -> Result<CliOutcome, CliFailure> {
    let mut definition_path: Option<PathBuf> = None;
    let mut lenient = false;
    for arg in args {
        match arg.as_str() {
            "--lenient" => lenient = true,
            other if other.starts_with("--") => {
                return Err(CliFailure::usage(format!("unknown flag `{other}`")));
            }
            positional => {
                if definition_path.is_some() {
                    return Err(CliFailure::usage("validate accepts one definition path"));
                }
                definition_path = Some(PathBuf::from(positional));
            }
        }
    }
    let Some(definition_path) = definition_path else {
        return Err(CliFailure::usage("validate requires a definition path"));
    };

    let parsed = orchestrator
        .validate_file(&definition_path, lenient)
        .map_err(engine_failure)?;
    let mut lines = vec![format!(
        "definition ok: name={} steps={} digest={}",
        parsed.definition.name,
        parsed.definition.steps.len(),
        &parsed.digest[..12.min(parsed.digest.len())]
    )];
    for warning in &parsed.warnings {
        lines.push(format!("warning: {warning}"));
    }
    Ok(CliOutcome {
        output: lines.join("\n"),
        exit_code: 0,
    })
}

fn required_value(
    iter: &mut impl Iterator<Item = String>,
    flag: &str,
) -> Result<String, CliFailure> {
    iter.next()
        .ok_or_else(|| CliFailure::usage(format!("{flag} requires a value")))
}

pub fn parse_var(raw: &str) -> Result<(String, String), CliFailure> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| CliFailure::usage(format!("--var `{raw}` must use the form key=value")))?;
    if key.trim().is_empty() {
        return Err(CliFailure::usage("--var key must be non-empty"));
    }
    Ok((key.trim().to_string(), value.to_string()))
}

fn engine_failure(error: crate::orchestration::error::EngineError) -> CliFailure {
    CliFailure {
        message: error.to_string(),
        exit_code: exit_code_for_error(&error),
    }
}
