use tapps::definition::{
    parse_definition_str, GateOnFail, InputSource, OnFailure, ParseMode, Threshold,
};

const FULL_FEATURED: &str = r#"
name: feature_delivery
description: end to end delivery with quality gates
policy:
  max_parallelism: 3
  step_timeout: PT10M
  cancel_grace: 5s
  artifact_roots: [shared_outputs]
gates:
  - id: quality
    metric: overall_score
    threshold: 7.5
    on_fail: { loopback_to: implement }
    max_iterations: 3
  - id: tests
    metric: tests_passed
    threshold: true
    on_fail: abort
steps:
  - id: analyse
    agent: analyst
    capability: analyse
    inputs:
      request: prompt
    outputs: [spec_out]
  - id: plan
    agent: planner
    capability: plan
    inputs:
      spec: { artifact: analyse.spec_out }
    outputs: [plan_out]
  - id: implement
    agent: implementer
    capability: implement
    inputs:
      plan: { artifact: plan.plan_out }
      style: { literal: "match existing conventions" }
    outputs: [diff_out]
    on_failure: { retry: 2 }
  - id: review
    agent: reviewer
    capability: review
    inputs:
      diff: { artifact: implement.diff_out }
    outputs: [review_out]
    gate: quality
  - id: unit_tests
    agent: tester
    capability: test
    inputs:
      diff: { artifact: implement.diff_out }
    outputs: [test_report]
    parallel_group: checks
    gate: tests
  - id: security_scan
    agent: evaluator
    capability: evaluate
    inputs:
      diff: { artifact: implement.diff_out }
    outputs: [scan_report]
    parallel_group: checks
  - id: document
    agent: documenter
    capability: document
    inputs:
      review: { artifact: review.review_out }
    outputs: [docs_out]
    on_failure: skip
"#;

#[test]
fn full_featured_definition_parses_with_typed_fields() {
    let parsed = parse_definition_str(FULL_FEATURED, ParseMode::Strict).expect("parse");
    let definition = &parsed.definition;

    assert_eq!(definition.name, "feature_delivery");
    assert_eq!(definition.policy.max_parallelism, 3);
    assert_eq!(definition.policy.step_timeout.as_secs(), 600);
    assert_eq!(definition.policy.cancel_grace.as_secs(), 5);
    assert_eq!(definition.policy.artifact_roots.len(), 1);

    let quality = definition.gate("quality").expect("quality gate");
    assert_eq!(quality.threshold, Threshold::Number(7.5));
    assert_eq!(quality.max_iterations, 3);
    assert!(matches!(&quality.on_fail, GateOnFail::LoopbackTo(step) if step.as_str() == "implement"));

    let tests = definition.gate("tests").expect("tests gate");
    assert_eq!(tests.threshold, Threshold::Bool(true));
    assert_eq!(tests.on_fail, GateOnFail::Abort);
    assert_eq!(tests.max_iterations, 1);

    let implement = definition.step("implement").expect("implement");
    assert_eq!(implement.on_failure, OnFailure::Retry(2));
    assert!(matches!(
        implement.inputs.get("style"),
        Some(InputSource::Literal(_))
    ));

    let unit_tests = definition.step("unit_tests").expect("unit_tests");
    assert_eq!(unit_tests.parallel_group.as_deref(), Some("checks"));
    assert_eq!(
        definition.step("document").expect("document").on_failure,
        OnFailure::Skip
    );
}

#[test]
fn digest_is_stable_and_sensitive_to_meaningful_change() {
    let first = parse_definition_str(FULL_FEATURED, ParseMode::Strict).expect("parse");
    let second = parse_definition_str(FULL_FEATURED, ParseMode::Strict).expect("parse");
    assert_eq!(first.digest, second.digest);

    let reordered_whitespace = FULL_FEATURED.replace("max_parallelism: 3", "max_parallelism:   3");
    let third = parse_definition_str(&reordered_whitespace, ParseMode::Strict).expect("parse");
    assert_eq!(first.digest, third.digest);

    let changed = FULL_FEATURED.replace("threshold: 7.5", "threshold: 8");
    let fourth = parse_definition_str(&changed, ParseMode::Strict).expect("parse");
    assert_ne!(first.digest, fourth.digest);
}

#[test]
fn serialised_definition_reparses_to_the_same_value() {
    let parsed = parse_definition_str(FULL_FEATURED, ParseMode::Strict).expect("parse");
    let reserialised = serde_yaml::to_string(&parsed.definition).expect("serialise");
    let reparsed = parse_definition_str(&reserialised, ParseMode::Strict).expect("reparse");
    assert_eq!(parsed.definition, reparsed.definition);
    assert_eq!(parsed.digest, reparsed.digest);
}
