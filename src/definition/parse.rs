use crate::definition::error::DefinitionError;
use crate::definition::model::WorkflowDefinition;
use crate::definition::validate::validate_definition;
use serde_yaml::Value;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParseMode {
    #[default]
    Strict,
    Lenient,
}

#[derive(Debug, Clone)]
pub struct ParsedDefinition {
    pub definition: WorkflowDefinition,
    pub digest: String,
    pub warnings: Vec<String>,
}

pub fn parse_definition_file(
    path: &Path,
    mode: ParseMode,
) -> Result<ParsedDefinition, DefinitionError> {
    let raw = fs::read_to_string(path).map_err(|source| DefinitionError::Read {
        path: path.display().to_string(),
        source,
    })?;
    parse_definition_named(&raw, &path.display().to_string(), mode)
}

pub fn parse_definition_str(
    raw: &str,
    mode: ParseMode,
) -> Result<ParsedDefinition, DefinitionError> {
    parse_definition_named(raw, "<inline>", mode)
}

fn parse_definition_named(
    raw: &str,
    origin: &str,
    mode: ParseMode,
) -> Result<ParsedDefinition, DefinitionError> {
    let value: Value = serde_yaml::from_str(raw).map_err(|source| DefinitionError::Parse {
        path: origin.to_string(),
        source,
    })?;

    let unknown = collect_unknown_keys(&value);
    let warnings = if unknown.is_empty() {
        Vec::new()
    } else {
        match mode {
            ParseMode::Strict => {
                return Err(DefinitionError::UnknownKeys(unknown.join(", ")));
            }
            ParseMode::Lenient => unknown
                .into_iter()
                .map(|key| format!("ignoring unknown key {key}"))
                .collect(),
        }
    };

    let definition: WorkflowDefinition =
        serde_yaml::from_value(value).map_err(|source| DefinitionError::Parse {
            path: origin.to_string(),
            source,
        })?;
    validate_definition(&definition)?;
    let digest = definition_digest(&definition)?;

    Ok(ParsedDefinition {
        definition,
        digest,
        warnings,
    })
}

pub fn definition_digest(definition: &WorkflowDefinition) -> Result<String, DefinitionError> {
    let value = serde_json::to_value(definition)
        .map_err(|err| DefinitionError::Canonicalise(err.to_string()))?;
    let canonical = serde_json::to_string(&value)
        .map_err(|err| DefinitionError::Canonicalise(err.to_string()))?;
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    Ok(format!("{:x}", hasher.finalize()))
}

const TOP_LEVEL_KEYS: &[&str] = &["name", "description", "policy", "gates", "steps"];
const POLICY_KEYS: &[&str] = &[
    "max_parallelism",
    "step_timeout",
    "cancel_grace",
    "artifact_roots",
];
const GATE_KEYS: &[&str] = &["id", "metric", "threshold", "on_fail", "max_iterations"];
const GATE_ON_FAIL_KEYS: &[&str] = &["loopback_to"];
const STEP_KEYS: &[&str] = &[
    "id",
    "agent",
    "capability",
    "inputs",
    "outputs",
    "depends_on",
    "parallel_group",
    "on_failure",
    "gate",
];
const STEP_ON_FAILURE_KEYS: &[&str] = &["retry"];
const INPUT_SOURCE_KEYS: &[&str] = &["literal", "artifact"];

fn collect_unknown_keys(root: &Value) -> Vec<String> {
    let mut unknown = Vec::new();
    let Value::Mapping(top) = root else {
        return unknown;
    };

    record_unknown(top, TOP_LEVEL_KEYS, "", &mut unknown);

    if let Some(Value::Mapping(policy)) = top.get("policy") {
        record_unknown(policy, POLICY_KEYS, "policy.", &mut unknown);
    }

    if let Some(Value::Sequence(gates)) = top.get("gates") {
        for (index, gate) in gates.iter().enumerate() {
            let Value::Mapping(gate) = gate else {
                continue;
            };
            let location = format!("gates[{index}].");
            record_unknown(gate, GATE_KEYS, &location, &mut unknown);
            if let Some(Value::Mapping(on_fail)) = gate.get("on_fail") {
                record_unknown(
                    on_fail,
                    GATE_ON_FAIL_KEYS,
                    &format!("{location}on_fail."),
                    &mut unknown,
                );
            }
        }
    }

    if let Some(Value::Sequence(steps)) = top.get("steps") {
        for (index, step) in steps.iter().enumerate() {
            let Value::Mapping(step) = step else {
                continue;
            };
            let location = format!("steps[{index}].");
            record_unknown(step, STEP_KEYS, &location, &mut unknown);
            if let Some(Value::Mapping(on_failure)) = step.get("on_failure") {
                record_unknown(
                    on_failure,
                    STEP_ON_FAILURE_KEYS,
                    &format!("{location}on_failure."),
                    &mut unknown,
                );
            }
            if let Some(Value::Mapping(inputs)) = step.get("inputs") {
                for (input_name, source) in inputs {
                    let Value::Mapping(source) = source else {
                        continue;
                    };
                    let input_name = input_name.as_str().unwrap_or("?");
                    record_unknown(
                        source,
                        INPUT_SOURCE_KEYS,
                        &format!("{location}inputs.{input_name}."),
                        &mut unknown,
                    );
                }
            }
        }
    }

    unknown
}

fn record_unknown(
    mapping: &serde_yaml::Mapping,
    known: &[&str],
    location: &str,
    unknown: &mut Vec<String>,
) {
    for key in mapping.keys() {
        let Some(name) = key.as_str() else {
            unknown.push(format!("{location}<non-string key>"));
            continue;
        };
        if !known.contains(&name) {
            unknown.push(format!("{location}{name}"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
name: deliver_feature
steps:
  - id: analyse
    agent: analyst
    capability: analyse
    outputs: [spec_out]
  - id: implement
    agent: implementer
    capability: implement
    inputs:
      spec: { artifact: analyse.spec_out }
    outputs: [diff_out]
"#;

    #[test]
    fn minimal_definition_parses_with_defaults() {
        let parsed = parse_definition_str(MINIMAL, ParseMode::Strict).expect("parse");
        assert_eq!(parsed.definition.name, "deliver_feature");
        assert_eq!(parsed.definition.steps.len(), 2);
        assert_eq!(parsed.definition.policy.max_parallelism, 4);
        assert_eq!(parsed.definition.policy.step_timeout.as_secs(), 1800);
        assert_eq!(parsed.definition.policy.cancel_grace.as_secs(), 10);
        assert!(parsed.warnings.is_empty());
        assert_eq!(parsed.digest.len(), 64);
    }

    #[test]
    fn unknown_keys_fail_strict_and_warn_lenient() {
        let raw = format!("{MINIMAL}\nextra_knob: true\n");
        let err = parse_definition_str(&raw, ParseMode::Strict).expect_err("strict rejects");
        assert!(err.to_string().contains("extra_knob"), "{err}");

        let parsed = parse_definition_str(&raw, ParseMode::Lenient).expect("lenient parses");
        assert_eq!(parsed.warnings.len(), 1);
        assert!(parsed.warnings[0].contains("extra_knob"));
    }

    #[test]
    fn nested_unknown_keys_are_located() {
        let raw = r#"
name: wf
steps:
  - id: only
    agent: planner
    capability: plan
    surprise: yes
"#;
        let err = parse_definition_str(raw, ParseMode::Strict).expect_err("strict rejects");
        assert!(err.to_string().contains("steps[0].surprise"), "{err}");
    }

    #[test]
    fn digest_is_stable_across_reparses() {
        let first = parse_definition_str(MINIMAL, ParseMode::Strict).expect("parse");
        let second = parse_definition_str(MINIMAL, ParseMode::Strict).expect("parse");
        assert_eq!(first.digest, second.digest);
    }

    #[test]
    fn digest_changes_when_a_step_is_added() {
        let first = parse_definition_str(MINIMAL, ParseMode::Strict).expect("parse");
        let extended = format!(
            "{MINIMAL}  - id: review\n    agent: reviewer\n    capability: review\n    inputs:\n      diff: {{ artifact: implement.diff_out }}\n"
        );
        let second = parse_definition_str(&extended, ParseMode::Strict).expect("parse");
        assert_ne!(first.digest, second.digest);
    }

    #[test]
    fn parser_round_trips_through_serialisation() {
        let parsed = parse_definition_str(MINIMAL, ParseMode::Strict).expect("parse");
        let reserialised = serde_yaml::to_string(&parsed.definition).expect("serialise");
        let reparsed = parse_definition_str(&reserialised, ParseMode::Strict).expect("reparse");
        assert_eq!(parsed.definition, reparsed.definition);
        assert_eq!(parsed.digest, reparsed.digest);
    }
}
