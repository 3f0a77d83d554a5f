use crate::definition::error::DefinitionError;
use crate::definition::model::{
    GateOnFail, InputSource, StepDef, Threshold, WorkflowDefinition, MAX_RETRY_ATTEMPTS,
    OnFailure,
};
use crate::shared::ids::validate_identifier_value;
use std::collections::{BTreeMap, BTreeSet};

pub fn validate_definition(definition: &WorkflowDefinition) -> Result<(), DefinitionError> {
    if definition.name.trim().is_empty() {
        return Err(validation("workflow `name` must be non-empty"));
    }
    if definition.policy.max_parallelism == 0 {
        return Err(validation("policy.max_parallelism must be at least 1"));
    }
    if definition.policy.step_timeout.as_secs() == 0 {
        return Err(validation("policy.step_timeout must be greater than zero"));
    }
    if definition.policy.cancel_grace.as_secs() == 0 {
        return Err(validation("policy.cancel_grace must be greater than zero"));
    }

    let mut gate_ids = BTreeSet::new();
    for gate in &definition.gates {
        if !gate_ids.insert(gate.id.as_str().to_string()) {
            return Err(validation(format!("duplicate gate id `{}`", gate.id)));
        }
        if gate.metric.trim().is_empty() {
            return Err(validation(format!("gate `{}` has an empty metric", gate.id)));
        }
        if gate.max_iterations == 0 {
            return Err(validation(format!(
                "gate `{}` max_iterations must be a positive integer",
                gate.id
            )));
        }
        match (&gate.threshold, is_boolean_metric(&gate.metric)) {
            (Threshold::Bool(_), false) => {
                return Err(validation(format!(
                    "gate `{}` metric `{}` is numeric but its threshold is boolean",
                    gate.id, gate.metric
                )));
            }
            (Threshold::Number(_), true) => {
                return Err(validation(format!(
                    "gate `{}` metric `{}` is boolean but its threshold is numeric",
                    gate.id, gate.metric
                )));
            }
            _ => {}
        }
    }

    let mut declared_outputs: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    let mut step_ids = BTreeSet::new();
    for step in &definition.steps {
        if !step_ids.insert(step.id.as_str().to_string()) {
            return Err(validation(format!("duplicate step id `{}`", step.id)));
        }
        validate_step(step, &step_ids, &declared_outputs, definition)?;

        let outputs = declared_outputs.entry(step.id.as_str().to_string()).or_default();
        for logical in &step.outputs {
            if !outputs.insert(logical.as_str().to_string()) {
                return Err(validation(format!(
                    "step `{}` declares output `{}` more than once",
                    step.id, logical
                )));
            }
        }
    }

    for gate in &definition.gates {
        if let GateOnFail::LoopbackTo(target) = &gate.on_fail {
            if !step_ids.contains(target.as_str()) {
                return Err(validation(format!(
                    "gate `{}` loops back to unknown step `{}`",
                    gate.id, target
                )));
            }
        }
    }

    Ok(())
}

fn validate_step(
    step: &StepDef,
    known_steps: &BTreeSet<String>,
    declared_outputs: &BTreeMap<String, BTreeSet<String>>,
    definition: &WorkflowDefinition,
) -> Result<(), DefinitionError> {
    for (input_name, source) in &step.inputs {
        validate_identifier_value("input name", input_name)
            .map_err(|err| validation(format!("step `{}`: {err}", step.id)))?;
        if let InputSource::Artifact(reference) = source {
            if reference.step_id == step.id {
                return Err(validation(format!(
                    "step `{}` input `{input_name}` references its own output",
                    step.id
                )));
            }
            let producer_outputs = declared_outputs.get(reference.step_id.as_str());
            let declared = producer_outputs
                .map(|outputs| outputs.contains(reference.logical_name.as_str()))
                .unwrap_or(false);
            if !declared {
                return Err(validation(format!(
                    "step `{}` input `{input_name}` references `{}` which no earlier step declares",
                    step.id,
                    reference.reference()
                )));
            }
        }
    }

    for dependency in &step.depends_on {
        if dependency == &step.id {
            return Err(validation(format!(
                "step `{}` depends on itself",
                step.id
            )));
        }
        let exists = known_steps.contains(dependency.as_str())
            || definition.step(dependency.as_str()).is_some();
        if !exists {
            return Err(validation(format!(
                "step `{}` depends on unknown step `{}`",
                step.id, dependency
            )));
        }
    }

    if let OnFailure::Retry(count) = step.on_failure {
        if count > MAX_RETRY_ATTEMPTS {
            return Err(validation(format!(
                "step `{}` retry count {count} exceeds the maximum of {MAX_RETRY_ATTEMPTS}",
                step.id
            )));
        }
    }

    if let Some(group) = &step.parallel_group {
        if group.trim().is_empty() {
            return Err(validation(format!(
                "step `{}` parallel_group must be non-empty when present",
                step.id
            )));
        }
    }

    if let Some(gate_id) = &step.gate {
        if definition.gate(gate_id.as_str()).is_none() {
            return Err(validation(format!(
                "step `{}` references unknown gate `{}`",
                step.id, gate_id
            )));
        }
    }

    Ok(())
}

pub fn is_boolean_metric(metric: &str) -> bool {
    let metric = metric.trim();
    metric == "tests_passed" || metric.ends_with("_passed") || metric.ends_with("_ok")
}

fn validation(message: impl Into<String>) -> DefinitionError {
    DefinitionError::Validation(message.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::parse::{parse_definition_str, ParseMode};

    fn parse_err(raw: &str) -> String {
        parse_definition_str(raw, ParseMode::Strict)
            .expect_err("definition should be rejected")
            .to_string()
    }

    #[test]
    fn duplicate_step_ids_are_rejected() {
        let err = parse_err(
            r#"
name: wf
steps:
  - id: a
    agent: planner
    capability: plan
  - id: a
    agent: planner
    capability: plan
"#,
        );
        assert!(err.contains("duplicate step id"), "{err}");
    }

    #[test]
    fn artifact_reference_must_point_at_an_earlier_declared_output() {
        let err = parse_err(
            r#"
name: wf
steps:
  - id: first
    agent: analyst
    capability: analyse
  - id: second
    agent: implementer
    capability: implement
    inputs:
      spec: { artifact: first.spec_out }
"#,
        );
        assert!(err.contains("no earlier step declares"), "{err}");

        let err = parse_err(
            r#"
name: wf
steps:
  - id: second
    agent: implementer
    capability: implement
    inputs:
      spec: { artifact: later.spec_out }
  - id: later
    agent: analyst
    capability: analyse
    outputs: [spec_out]
"#,
        );
        assert!(err.contains("no earlier step declares"), "{err}");
    }

    #[test]
    fn retry_counts_above_five_are_rejected() {
        let err = parse_err(
            r#"
name: wf
steps:
  - id: flaky
    agent: tester
    capability: test
    on_failure: { retry: 6 }
"#,
        );
        assert!(err.contains("exceeds the maximum"), "{err}");
    }

    #[test]
    fn gate_references_and_bounds_are_checked() {
        let err = parse_err(
            r#"
name: wf
steps:
  - id: review
    agent: reviewer
    capability: review
    gate: missing
"#,
        );
        assert!(err.contains("unknown gate"), "{err}");

        let err = parse_err(
            r#"
name: wf
gates:
  - id: quality
    metric: overall_score
    threshold: 7
    on_fail: { loopback_to: ghost }
    max_iterations: 2
steps:
  - id: review
    agent: reviewer
    capability: review
    gate: quality
"#,
        );
        assert!(err.contains("loops back to unknown step"), "{err}");

        let err = parse_err(
            r#"
name: wf
gates:
  - id: quality
    metric: overall_score
    threshold: 7
    on_fail: warn
    max_iterations: 0
steps:
  - id: review
    agent: reviewer
    capability: review
    gate: quality
"#,
        );
        assert!(err.contains("max_iterations"), "{err}");
    }

    #[test]
    fn threshold_type_must_match_metric_type() {
        let err = parse_err(
            r#"
name: wf
gates:
  - id: quality
    metric: tests_passed
    threshold: 7
    on_fail: abort
steps:
  - id: test
    agent: tester
    capability: test
    gate: quality
"#,
        );
        assert!(err.contains("boolean"), "{err}");

        let err = parse_err(
            r#"
name: wf
gates:
  - id: quality
    metric: overall_score
    threshold: true
    on_fail: abort
steps:
  - id: review
    agent: reviewer
    capability: review
    gate: quality
"#,
        );
        assert!(err.contains("numeric"), "{err}");
    }

    #[test]
    fn self_dependency_and_unknown_dependency_are_rejected() {
        let err = parse_err(
            r#"
name: wf
steps:
  - id: a
    agent: planner
    capability: plan
    depends_on: [a]
"#,
        );
        assert!(err.contains("depends on itself"), "{err}");

        let err = parse_err(
            r#"
name: wf
steps:
  - id: a
    agent: planner
    capability: plan
    depends_on: [ghost]
"#,
        );
        assert!(err.contains("unknown step"), "{err}");
    }

    #[test]
    fn boolean_metric_name_family() {
        assert!(is_boolean_metric("tests_passed"));
        assert!(is_boolean_metric("lint_ok"));
        assert!(!is_boolean_metric("overall_score"));
        assert!(!is_boolean_metric("latency_ms"));
    }
}
