use thiserror::Error;

/// Enum for the various rule evaluation errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RulesError {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("invalid rule: {0}")]
    InvalidRule(String),

    #[error("failed to execute query: {0}")]
    QueryExecution(String),

    #[error("unexpected query result type: {0}")]
    UnexpectedResultType(String),

    #[error("exceeded limit of {limit} with {actual} series")]
    SeriesLimitExceeded { limit: usize, actual: usize },

    #[error("duplicate series: {0}")]
    DuplicateSeries(String),

    #[error("failed to restore alert state: {0}")]
    RuleRestore(String),

    #[error("failed to append series: {0}")]
    Append(String),

    #[error("failed to notify: {0}")]
    Notify(String),

    #[error("rule manager is stopped")]
    ManagerStopped,

    #[error("{0}")]
    Generic(String),
}

pub type RulesResult<T> = Result<T, RulesError>;
