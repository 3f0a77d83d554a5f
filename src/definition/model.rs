use crate::shared::ids::{GateId, LogicalName, StepId};
use serde::de::Error as _;
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub policy: Policy,
    #[serde(default)]
    pub gates: Vec<GateDef>,
    #[serde(default)]
    pub steps: Vec<StepDef>,
}

impl WorkflowDefinition {
    pub fn step(&self, step_id: &str) -> Option<&StepDef> {
        self.steps.iter().find(|step| step.id.as_str() == step_id)
    }

    pub fn gate(&self, gate_id: &str) -> Option<&GateDef> {
        self.gates.iter().find(|gate| gate.id.as_str() == gate_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    #[serde(default = "default_max_parallelism")]
    pub max_parallelism: usize,
    #[serde(default = "default_step_timeout")]
    pub step_timeout: DurationValue,
    #[serde(default = "default_cancel_grace")]
    pub cancel_grace: DurationValue,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifact_roots: Vec<PathBuf>,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            max_parallelism: default_max_parallelism(),
            step_timeout: default_step_timeout(),
            cancel_grace: default_cancel_grace(),
            artifact_roots: Vec::new(),
        }
    }
}

fn default_max_parallelism() -> usize {
    4
}

fn default_step_timeout() -> DurationValue {
    DurationValue::from_secs(30 * 60)
}

fn default_cancel_grace() -> DurationValue {
    DurationValue::from_secs(10)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDef {
    pub id: StepId,
    pub agent: AgentKind,
    pub capability: Capability,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub inputs: BTreeMap<String, InputSource>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<LogicalName>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<StepId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel_group: Option<String>,
    #[serde(default)]
    pub on_failure: OnFailure,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate: Option<GateId>,
}

impl StepDef {
    pub fn artifact_inputs(&self) -> impl Iterator<Item = (&str, &ArtifactRef)> {
        self.inputs.iter().filter_map(|(name, source)| match source {
            InputSource::Artifact(reference) => Some((name.as_str(), reference)),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateDef {
    pub id: GateId,
    pub metric: String,
    pub threshold: Threshold,
    pub on_fail: GateOnFail,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
}

fn default_max_iterations() -> u32 {
    1
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    Analyst,
    Planner,
    Architect,
    Designer,
    Implementer,
    Reviewer,
    Tester,
    Debugger,
    Documenter,
    Improver,
    Ops,
    Orchestrator,
    Enhancer,
    Evaluator,
}

impl AgentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Analyst => "analyst",
            Self::Planner => "planner",
            Self::Architect => "architect",
            Self::Designer => "designer",
            Self::Implementer => "implementer",
            Self::Reviewer => "reviewer",
            Self::Tester => "tester",
            Self::Debugger => "debugger",
            Self::Documenter => "documenter",
            Self::Improver => "improver",
            Self::Ops => "ops",
            Self::Orchestrator => "orchestrator",
            Self::Enhancer => "enhancer",
            Self::Evaluator => "evaluator",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, String> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "analyst" => Ok(Self::Analyst),
            "planner" => Ok(Self::Planner),
            "architect" => Ok(Self::Architect),
            "designer" => Ok(Self::Designer),
            "implementer" => Ok(Self::Implementer),
            "reviewer" => Ok(Self::Reviewer),
            "tester" => Ok(Self::Tester),
            "debugger" => Ok(Self::Debugger),
            "documenter" => Ok(Self::Documenter),
            "improver" => Ok(Self::Improver),
            "ops" => Ok(Self::Ops),
            "orchestrator" => Ok(Self::Orchestrator),
            "enhancer" => Ok(Self::Enhancer),
            "evaluator" => Ok(Self::Evaluator),
            other => Err(format!("unknown agent `{other}`")),
        }
    }
}

impl std::fmt::Display for AgentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct Capability(String);

impl Capability {
    pub fn parse(raw: &str) -> Result<Self, String> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err("capability must be non-empty".to_string());
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl<'de> Deserialize<'de> for Capability {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(D::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ArtifactRef {
    pub step_id: StepId,
    pub logical_name: LogicalName,
}

impl ArtifactRef {
    pub fn parse(raw: &str) -> Result<Self, String> {
        let (step, logical) = raw.split_once('.').ok_or_else(|| {
            format!("artifact reference `{raw}` must use the form `step_id.logical_name`")
        })?;
        Ok(Self {
            step_id: StepId::parse(step)?,
            logical_name: LogicalName::parse(logical)?,
        })
    }

    pub fn reference(&self) -> String {
        format!("{}.{}", self.step_id, self.logical_name)
    }
}

impl std::fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.step_id, self.logical_name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum InputSource {
    Prompt,
    Literal(String),
    Artifact(ArtifactRef),
}

impl Serialize for InputSource {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Self::Prompt => serializer.serialize_str("prompt"),
            Self::Literal(value) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("literal", value)?;
                map.end()
            }
            Self::Artifact(reference) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("artifact", &reference.reference())?;
                map.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for InputSource {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = serde_yaml::Value::deserialize(deserializer)?;
        match value {
            serde_yaml::Value::String(raw) if raw.trim() == "prompt" => Ok(Self::Prompt),
            serde_yaml::Value::String(raw) => Err(D::Error::custom(format!(
                "input source `{raw}` must be `prompt`, `{{literal: ...}}` or `{{artifact: ...}}`"
            ))),
            serde_yaml::Value::Mapping(map) => {
                if map.len() != 1 {
                    return Err(D::Error::custom(
                        "input source mapping must have exactly one key",
                    ));
                }
                let (key, inner) = map.into_iter().next().expect("single entry");
                let key = key
                    .as_str()
                    .ok_or_else(|| D::Error::custom("input source key must be a string"))?
                    .to_string();
                let inner = inner
                    .as_str()
                    .ok_or_else(|| {
                        D::Error::custom(format!("input source `{key}` value must be a string"))
                    })?
                    .to_string();
                match key.as_str() {
                    "literal" => Ok(Self::Literal(inner)),
                    "artifact" => ArtifactRef::parse(&inner)
                        .map(Self::Artifact)
                        .map_err(D::Error::custom),
                    other => Err(D::Error::custom(format!(
                        "input source key must be `literal` or `artifact`, got `{other}`"
                    ))),
                }
            }
            _ => Err(D::Error::custom(
                "input source must be `prompt`, `{literal: ...}` or `{artifact: ...}`",
            )),
        }
    }
}

pub const MAX_RETRY_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OnFailure {
    #[default]
    Abort,
    Skip,
    Retry(u32),
}

impl OnFailure {
    pub fn as_label(&self) -> String {
        match self {
            Self::Abort => "abort".to_string(),
            Self::Skip => "skip".to_string(),
            Self::Retry(count) => format!("retry({count})"),
        }
    }
}

impl Serialize for OnFailure {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Self::Abort => serializer.serialize_str("abort"),
            Self::Skip => serializer.serialize_str("skip"),
            Self::Retry(count) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("retry", count)?;
                map.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for OnFailure {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = serde_yaml::Value::deserialize(deserializer)?;
        match value {
            serde_yaml::Value::String(raw) => match raw.trim() {
                "abort" => Ok(Self::Abort),
                "skip" => Ok(Self::Skip),
                other => Err(D::Error::custom(format!(
                    "on_failure must be `abort`, `skip` or `{{retry: N}}`, got `{other}`"
                ))),
            },
            serde_yaml::Value::Mapping(map) => {
                if map.len() != 1 {
                    return Err(D::Error::custom(
                        "on_failure mapping must have exactly one key",
                    ));
                }
                let (key, inner) = map.into_iter().next().expect("single entry");
                if key.as_str() != Some("retry") {
                    return Err(D::Error::custom(
                        "on_failure mapping key must be `retry`",
                    ));
                }
                let count = inner
                    .as_u64()
                    .ok_or_else(|| D::Error::custom("`retry` must be a non-negative integer"))?;
                let count = u32::try_from(count)
                    .map_err(|_| D::Error::custom("`retry` count is out of range"))?;
                Ok(Self::Retry(count))
            }
            _ => Err(D::Error::custom(
                "on_failure must be `abort`, `skip` or `{retry: N}`",
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Threshold {
    Number(f64),
    Bool(bool),
}

impl Serialize for Threshold {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Self::Number(value) => serializer.serialize_f64(*value),
            Self::Bool(value) => serializer.serialize_bool(*value),
        }
    }
}

impl<'de> Deserialize<'de> for Threshold {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = serde_yaml::Value::deserialize(deserializer)?;
        match value {
            serde_yaml::Value::Bool(flag) => Ok(Self::Bool(flag)),
            serde_yaml::Value::Number(number) => number
                .as_f64()
                .map(Self::Number)
                .ok_or_else(|| D::Error::custom("threshold number is out of range")),
            _ => Err(D::Error::custom("threshold must be a number or a boolean")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateOnFail {
    Abort,
    Warn,
    LoopbackTo(StepId),
}

impl Serialize for GateOnFail {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Self::Abort => serializer.serialize_str("abort"),
            Self::Warn => serializer.serialize_str("warn"),
            Self::LoopbackTo(step_id) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("loopback_to", step_id)?;
                map.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for GateOnFail {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = serde_yaml::Value::deserialize(deserializer)?;
        match value {
            serde_yaml::Value::String(raw) => match raw.trim() {
                "abort" => Ok(Self::Abort),
                "warn" => Ok(Self::Warn),
                other => Err(D::Error::custom(format!(
                    "on_fail must be `abort`, `warn` or `{{loopback_to: step_id}}`, got `{other}`"
                ))),
            },
            serde_yaml::Value::Mapping(map) => {
                if map.len() != 1 {
                    return Err(D::Error::custom(
                        "on_fail mapping must have exactly one key",
                    ));
                }
                let (key, inner) = map.into_iter().next().expect("single entry");
                if key.as_str() != Some("loopback_to") {
                    return Err(D::Error::custom("on_fail mapping key must be `loopback_to`"));
                }
                let raw = inner
                    .as_str()
                    .ok_or_else(|| D::Error::custom("`loopback_to` must name a step id"))?;
                StepId::parse(raw)
                    .map(Self::LoopbackTo)
                    .map_err(D::Error::custom)
            }
            _ => Err(D::Error::custom(
                "on_fail must be `abort`, `warn` or `{loopback_to: step_id}`",
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct DurationValue(Duration);

impl DurationValue {
    pub fn from_secs(secs: u64) -> Self {
        Self(Duration::from_secs(secs))
    }

    pub fn as_duration(&self) -> Duration {
        self.0
    }

    pub fn as_secs(&self) -> u64 {
        self.0.as_secs()
    }
}

impl Serialize for DurationValue {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{}s", self.0.as_secs()))
    }
}

impl<'de> Deserialize<'de> for DurationValue {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        parse_duration(&raw).map(DurationValue).map_err(D::Error::custom)
    }
}

pub fn parse_duration(raw: &str) -> Result<Duration, String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err("duration must be non-empty".to_string());
    }
    if trimmed.starts_with('P') || trimmed.starts_with('p') {
        return parse_iso8601_duration(trimmed);
    }
    let (unit_index, unit) = trimmed
        .char_indices()
        .last()
        .ok_or_else(|| "duration must be non-empty".to_string())?;
    let value = trimmed[..unit_index]
        .parse::<u64>()
        .map_err(|_| format!("duration `{trimmed}` must be `<int>{{s,m,h}}` or ISO-8601"))?;
    match unit {
        's' => Ok(Duration::from_secs(value)),
        'm' => Ok(Duration::from_secs(value * 60)),
        'h' => Ok(Duration::from_secs(value * 3600)),
        _ => Err(format!(
            "duration `{trimmed}` must end in `s`, `m` or `h`, or use ISO-8601"
        )),
    }
}

fn parse_iso8601_duration(raw: &str) -> Result<Duration, String> {
    let body = &raw[1..];
    let (date_part, time_part) = match body.split_once(['T', 't']) {
        Some((date, time)) => (date, time),
        None => (body, ""),
    };

    let mut total = 0u64;
    for (segment, multiplier) in iso_segments(date_part, &[('D', 86_400)])? {
        total = total.saturating_add(segment.saturating_mul(multiplier));
    }
    for (segment, multiplier) in iso_segments(time_part, &[('H', 3600), ('M', 60), ('S', 1)])? {
        total = total.saturating_add(segment.saturating_mul(multiplier));
    }
    if date_part.is_empty() && time_part.is_empty() {
        return Err(format!("duration `{raw}` has no components"));
    }
    Ok(Duration::from_secs(total))
}

fn iso_segments(part: &str, units: &[(char, u64)]) -> Result<Vec<(u64, u64)>, String> {
    let mut segments = Vec::new();
    let mut digits = String::new();
    for ch in part.chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
            continue;
        }
        let upper = ch.to_ascii_uppercase();
        let Some((_, multiplier)) = units.iter().find(|(unit, _)| *unit == upper) else {
            return Err(format!("unsupported ISO-8601 duration unit `{ch}`"));
        };
        if digits.is_empty() {
            return Err(format!("ISO-8601 duration unit `{ch}` has no value"));
        }
        let value = digits
            .parse::<u64>()
            .map_err(|_| format!("ISO-8601 duration value `{digits}` is out of range"))?;
        segments.push((value, *multiplier));
        digits.clear();
    }
    if !digits.is_empty() {
        return Err(format!(
            "ISO-8601 duration has trailing digits `{digits}` without a unit"
        ));
    }
    Ok(segments)
}
