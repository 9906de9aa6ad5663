use thiserror::Error;

/// Why a raw stream payload could not become a `MetricRecord`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("payload is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("payload is not a JSON object")]
    NotAnObject,
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("field `{field}` is malformed: {reason}")]
    InvalidField { field: &'static str, reason: String },
    #[error("counter `{field}` must be non-negative, got {value}")]
    NegativeCounter { field: &'static str, value: i64 },
}

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("stored data could not be decoded: {0}")]
    Corrupt(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

/// Failures that must withhold the stream acknowledgement.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("aggregate store write failed: {0}")]
    StoreUnavailable(#[source] StoreError),
    #[error("dead-letter store write failed: {0}")]
    DeadLetterUnavailable(#[source] StoreError),
}

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("unknown interval `{0}`; expected hour, day, week or month")]
    InvalidInterval(String),
    #[error("unknown timezone `{0}`")]
    InvalidTimezone(String),
    #[error("requested range spans more than {limit} buckets")]
    TooManyBuckets { limit: usize },
    #[error(transparent)]
    Store(#[from] StoreError),
}
