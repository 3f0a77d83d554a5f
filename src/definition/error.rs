#[derive(Debug, thiserror::Error)]
pub enum DefinitionError {
    #[error("failed to read workflow definition {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse workflow definition {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("workflow definition has unknown keys: {0}")]
    UnknownKeys(String),
    #[error("workflow definition validation failed: {0}")]
    Validation(String),
    #[error("failed to canonicalise workflow definition: {0}")]
    Canonicalise(String),
}
