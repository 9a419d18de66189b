use uuid::Uuid;

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum ValidationError {
    #[error("no student matches reference `{0}`")]
    UnknownStudent(String),
    #[error("subject must not be empty")]
    EmptySubject,
    #[error("select a student before entering marks")]
    NoStudentSelected,
    #[error("{field} must be between 0 and {max}, got {value}")]
    OutOfRange {
        field: &'static str,
        value: f64,
        max: f64,
    },
    #[error("{0} must not be empty")]
    MissingField(&'static str),
    #[error("roll `{0}` is already assigned to another student")]
    DuplicateRoll(String),
    #[error("unknown department `{0}`")]
    UnknownDepartment(String),
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error("record {0} not found")]
    NotFound(Uuid),
    #[error("atomic upsert is not supported by this store")]
    UpsertUnsupported,
    #[error("stored value is invalid: {0}")]
    Corrupt(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        Self::Backend(err.to_string())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),
    #[error("ingestion failed after {applied} applied rows: {source}")]
    Storage {
        applied: usize,
        #[source]
        source: StoreError,
    },
    #[error("could not parse input file: {0}")]
    Parse(String),
}

impl From<csv::Error> for IngestError {
    fn from(err: csv::Error) -> Self {
        Self::Parse(err.to_string())
    }
}
