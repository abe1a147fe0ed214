use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScorerError {
    #[error("unknown builtin scorer_name `{0}`")]
    UnknownBuiltinScorer(String),

    #[error("regex scorer pattern rejected by ReDoS guard: {reason}")]
    RedosRejected { reason: String },

    #[error("invalid regex pattern: {0}")]
    InvalidRegex(#[from] regex::Error),

    #[error("scorer config missing required field `{0}`")]
    MissingField(&'static str),

    #[error("scorer config field `{field}` has wrong type, expected {expected}")]
    WrongFieldType {
        field: &'static str,
        expected: &'static str,
    },

    #[error("credential lookup failed: {0}")]
    CredentialLookup(String),

    #[error("LLM execution transport error: {0}")]
    Transport(String),
}
