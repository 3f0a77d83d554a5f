use chrono::{TimeZone, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::marker::PhantomData;
use std::time::{SystemTime, UNIX_EPOCH};

pub fn validate_identifier_value(kind: &str, value: &str) -> Result<(), String> {
    if value.is_empty() {
        return Err(format!("{kind} must be non-empty"));
    }
    let mut chars = value.chars();
    let first = chars.next().unwrap_or('0');
    if !(first.is_ascii_alphabetic() || first == '_') {
        return Err(format!(
            "{kind} must start with an ASCII letter or underscore"
        ));
    }
    if chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_') {
        return Ok(());
    }
    Err(format!(
        "{kind} must use only ASCII letters, digits, '-' or '_'"
    ))
}

pub trait IdentScope {
    const DESCRIBE: &'static str;
}

pub enum StepScope {}
pub enum GateScope {}
pub enum OutputScope {}

impl IdentScope for StepScope {
    const DESCRIBE: &'static str = "step id";
}

impl IdentScope for GateScope {
    const DESCRIBE: &'static str = "gate id";
}

impl IdentScope for OutputScope {
    const DESCRIBE: &'static str = "logical output name";
}

// One validated identifier type; the scope parameter keeps step, gate and
// output names from being used interchangeably.
pub struct Ident<S> {
    value: String,
    scope: PhantomData<S>,
}

pub type StepId = Ident<StepScope>;
pub type GateId = Ident<GateScope>;
pub type LogicalName = Ident<OutputScope>;

impl<S: IdentScope> Ident<S> {
    pub fn parse(raw: &str) -> Result<Self, String> {
        validate_identifier_value(S::DESCRIBE, raw)?;
        Ok(Self {
            value: raw.to_string(),
            scope: PhantomData,
        })
    }
}

impl<S> Ident<S> {
    pub fn as_str(&self) -> &str {
        &self.value
    }
}

impl<S> Clone for Ident<S> {
    fn clone(&self) -> Self {
        Self {
            value: self.value.clone(),
            scope: PhantomData,
        }
    }
}

impl<S> PartialEq for Ident<S> {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl<S> Eq for Ident<S> {}

impl<S> PartialOrd for Ident<S> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<S> Ord for Ident<S> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.value.cmp(&other.value)
    }
}

impl<S> std::hash::Hash for Ident<S> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.value.hash(state);
    }
}

impl<S> std::fmt::Debug for Ident<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.value.fmt(f)
    }
}

impl<S> std::fmt::Display for Ident<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.value)
    }
}

impl<S> Serialize for Ident<S> {
    fn serialize<Ser>(&self, serializer: Ser) -> Result<Ser::Ok, Ser::Error>
    where
        Ser: Serializer,
    {
        serializer.serialize_str(&self.value)
    }
}

impl<'de, S: IdentScope> Deserialize<'de> for Ident<S> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw)
            .map_err(|err| D::Error::custom(format!("invalid {} `{raw}`: {err}", S::DESCRIBE)))
    }
}

pub fn generate_workflow_id(now: i64) -> String {
    let stamp = Utc
        .timestamp_opt(now, 0)
        .single()
        .map(|t| t.format("%Y%m%d%H%M%S").to_string())
        .unwrap_or_else(|| "00000000000000".to_string());
    format!("wf-{stamp}-{}", random_hex(4))
}

pub fn generate_correlation_id() -> String {
    format!("corr-{}", random_hex(6))
}

pub fn step_attempt_label(step_id: &str, iteration: u32, attempt: u32) -> String {
    format!("{step_id}#{iteration}.{attempt}")
}

pub fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    if getrandom::getrandom(&mut buf).is_err() {
        // Degraded uniqueness is acceptable; id generation must not fail.
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        let seed = (nanos as u64) ^ (u64::from(std::process::id()) << 32);
        for (index, slot) in buf.iter_mut().enumerate() {
            *slot = (seed >> ((index % 8) * 8)) as u8;
        }
    }
    buf.iter().map(|b| format!("{b:02x}")).collect()
}

pub fn is_valid_workflow_id(raw: &str) -> bool {
    let Some(rest) = raw.strip_prefix("wf-") else {
        return false;
    };
    let mut parts = rest.splitn(2, '-');
    let stamp = parts.next().unwrap_or("");
    let suffix = parts.next().unwrap_or("");
    stamp.len() == 14
        && stamp.chars().all(|ch| ch.is_ascii_digit())
        && suffix.len() == 8
        && suffix.chars().all(|ch| ch.is_ascii_hexdigit())
}
