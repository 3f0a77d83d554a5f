use crate::definition::{GateDef, GateOnFail, Threshold};
use crate::orchestration::dispatcher::SignalValue;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq)]
pub enum GateDecision {
    Pass,
    Warn { reason: String },
    Loopback { to: String },
    Fail { reason: String },
}

#[derive(Debug, Clone, Copy)]
pub struct GateInputs<'a> {
    pub score: Option<f64>,
    pub signals: &'a BTreeMap<String, SignalValue>,
}

pub fn evaluate_gate(gate: &GateDef, inputs: GateInputs<'_>, iterations_so_far: u32) -> GateDecision {
    let satisfied = match metric_value(&gate.metric, inputs) {
        Some(value) => metric_satisfies_threshold(&gate.metric, value, &gate.threshold),
        None => Err(format!(
            "metric `{}` was not reported by the gated step",
            gate.metric
        )),
    };

    let reason = match satisfied {
        Ok(true) => return GateDecision::Pass,
        Ok(false) => format!(
            "metric `{}` did not satisfy threshold {}",
            gate.metric,
            threshold_label(&gate.threshold)
        ),
        Err(reason) => reason,
    };

    match &gate.on_fail {
        GateOnFail::Warn => GateDecision::Warn { reason },
        GateOnFail::Abort => GateDecision::Fail { reason },
        GateOnFail::LoopbackTo(target) => {
            if iterations_so_far >= gate.max_iterations {
                GateDecision::Fail {
                    reason: format!(
                        "{reason} after {iterations_so_far} loopback iteration(s)"
                    ),
                }
            } else {
                GateDecision::Loopback {
                    to: target.as_str().to_string(),
                }
            }
        }
    }
}

fn metric_value(metric: &str, inputs: GateInputs<'_>) -> Option<SignalValue> {
    if let Some(value) = inputs.signals.get(metric) {
        return Some(*value);
    }
    if metric == "overall_score" || metric == "score" {
        return inputs.score.map(SignalValue::Number);
    }
    None
}

fn metric_satisfies_threshold(
    metric: &str,
    value: SignalValue,
    threshold: &Threshold,
) -> Result<bool, String> {
    match (value, threshold) {
        (SignalValue::Number(value), Threshold::Number(threshold)) => {
            if lower_is_better(metric) {
                Ok(value <= *threshold)
            } else {
                Ok(value >= *threshold)
            }
        }
        (SignalValue::Bool(value), Threshold::Bool(threshold)) => Ok(value == *threshold),
        (SignalValue::Number(_), Threshold::Bool(_)) => Err(format!(
            "metric `{metric}` reported a number but the gate expects a boolean"
        )),
        (SignalValue::Bool(_), Threshold::Number(_)) => Err(format!(
            "metric `{metric}` reported a boolean but the gate expects a number"
        )),
    }
}

pub fn lower_is_better(metric: &str) -> bool {
    let metric = metric.trim();
    metric.starts_with("latency")
        || metric.ends_with("_latency")
        || metric.ends_with("_latency_ms")
        || metric.starts_with("error")
        || metric.ends_with("_errors")
        || metric.ends_with("_error_count")
}

fn threshold_label(threshold: &Threshold) -> String {
    match threshold {
        Threshold::Number(value) => value.to_string(),
        Threshold::Bool(value) => value.to_string(),
    }
}
