use thiserror::Error;

/// Errors raised by the grade engine and the checks around it.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GradeError {
    #[error("invalid combination of unit, module and type: {unit}_{module}_{mark_type}")]
    InvalidCoordinate {
        unit: String,
        module: String,
        mark_type: String,
    },

    #[error("malformed mark id: {0}")]
    MalformedMarkId(String),

    #[error("mark value {0} is outside [0, 20]")]
    MarkOutOfRange(f64),

    #[error("goal {0} is outside [10, 20]")]
    GoalOutOfRange(f64),

    #[error("unknown unit: {0}")]
    UnknownUnit(String),

    #[error("`{0}` is not an email address")]
    InvalidEmail(String),

    #[error("{email} is not a {domain} address")]
    ForeignDomain { email: String, domain: String },

    #[error("{0} is not on the enrollment roster")]
    NotOnRoster(String),
}

/// Errors raised while loading a weight configuration document.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to parse weights document: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("{path} must be a JSON object")]
    NotAnObject { path: String },

    #[error("{path} is missing its `{key}` weight")]
    MissingWeight { path: String, key: &'static str },

    #[error("{path} has an invalid weight {weight}, weights must be finite and positive")]
    InvalidWeight { path: String, weight: f64 },

    #[error("invalid identifier `{id}`: ids must be non-empty, contain no `_` and not be a reserved key")]
    InvalidId { id: String },

    #[error("{path} has no children")]
    Empty { path: String },
}
