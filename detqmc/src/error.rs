use thiserror::Error;

/// Errors surfaced by the simulation engine.
#[derive(Debug, Error)]
pub enum QmcError {
    #[error("missing required parameter `{0}`")]
    ParameterMissing(&'static str),

    #[error("conflicting parameters: {0}")]
    ParameterConflict(String),

    #[error("invalid value for parameter `{name}`: {reason}")]
    ParameterInvalid { name: &'static str, reason: String },

    /// SVD / eigensolver convergence failure or a singular update
    /// matrix outside the single-proposal containment path.
    #[error("numerical failure: {0}")]
    NumericalFailure(String),

    #[error("state archive error: {0}")]
    State(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, QmcError>;
