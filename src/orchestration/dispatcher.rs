use crate::definition::{AgentKind, Capability};
use crate::shared::cancel::CancelToken;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SignalValue {
    Number(f64),
    Bool(bool),
}

impl std::fmt::Display for SignalValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(value) => write!(f, "{value}"),
            Self::Bool(value) => write!(f, "{value}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Succeeded,
    Failed,
}

#[derive(Debug, Clone)]
pub struct StepInvocation {
    pub workflow_id: String,
    pub correlation_id: String,
    pub step_id: String,
    pub agent: AgentKind,
    pub capability: Capability,
    pub iteration: u32,
    pub attempt: u32,
    pub attempt_label: String,
    pub inputs: BTreeMap<String, Vec<u8>>,
    pub outputs: Vec<String>,
    pub variables: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub status: OutcomeStatus,
    pub produced: Vec<(String, Vec<u8>)>,
    pub score: Option<f64>,
    pub secondary_signals: BTreeMap<String, SignalValue>,
    pub diagnostic: Option<String>,
    pub retryable: bool,
}

impl StepOutcome {
    pub fn succeeded(produced: Vec<(String, Vec<u8>)>) -> Self {
        Self {
            status: OutcomeStatus::Succeeded,
            produced,
            score: None,
            secondary_signals: BTreeMap::new(),
            diagnostic: None,
            retryable: false,
        }
    }

    pub fn failed(diagnostic: impl Into<String>, retryable: bool) -> Self {
        Self {
            status: OutcomeStatus::Failed,
            produced: Vec::new(),
            score: None,
            secondary_signals: BTreeMap::new(),
            diagnostic: Some(diagnostic.into()),
            retryable,
        }
    }

    pub fn with_score(mut self, score: f64) -> Self {
        self.score = Some(score);
        self
    }

    pub fn with_signal(mut self, name: impl Into<String>, value: SignalValue) -> Self {
        self.secondary_signals.insert(name.into(), value);
        self
    }
}

pub trait AgentDispatcher: Send + Sync {
    fn supports(&self, agent: AgentKind, capability: &Capability) -> bool;

    fn invoke(&self, invocation: &StepInvocation, cancel: &CancelToken) -> StepOutcome;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_values_round_trip_as_untagged_json() {
        let number: SignalValue = serde_json::from_str("7.5").expect("number");
        assert_eq!(number, SignalValue::Number(7.5));
        let flag: SignalValue = serde_json::from_str("true").expect("bool");
        assert_eq!(flag, SignalValue::Bool(true));
        assert_eq!(serde_json::to_string(&number).expect("ser"), "7.5");
        assert_eq!(serde_json::to_string(&flag).expect("ser"), "true");
    }

    #[test]
    fn outcome_builders_set_status_and_metadata() {
        let ok = StepOutcome::succeeded(vec![("out".to_string(), b"x".to_vec())])
            .with_score(8.0)
            .with_signal("security_score", SignalValue::Number(9.0));
        assert_eq!(ok.status, OutcomeStatus::Succeeded);
        assert_eq!(ok.score, Some(8.0));
        assert_eq!(ok.produced.len(), 1);

        let bad = StepOutcome::failed("provider unavailable", true);
        assert_eq!(bad.status, OutcomeStatus::Failed);
        assert!(bad.retryable);
        assert_eq!(bad.diagnostic.as_deref(), Some("provider unavailable"));
    }
}
