pub mod error;
pub mod model;
pub mod parse;
pub mod validate;

pub use error::DefinitionError;
pub use model::{
    parse_duration, AgentKind, ArtifactRef, Capability, DurationValue, GateDef, GateOnFail,
    InputSource, OnFailure, Policy, StepDef, Threshold, WorkflowDefinition,
};
pub use parse::{
    definition_digest, parse_definition_file, parse_definition_str, ParseMode, ParsedDefinition,
};
