use prism_types::Dtype;
use thiserror::Error;

/// Ways an input batch can fail the port's schema check.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum SchemaError {
    #[error("batch has {found} columns but the port schema has {expected}")]
    ArityMismatch { expected: usize, found: usize },
    #[error("column `{0}` is missing from the batch")]
    MissingColumn(String),
    #[error("batch carries unknown column `{0}`")]
    UnknownColumn(String),
    #[error("column `{column}` has dtype {found} but the port schema expects {expected}")]
    ColumnTypeMismatch {
        column: String,
        expected: Dtype,
        found: Dtype,
    },
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("schema mismatch: {0}")]
    SchemaMismatch(#[from] SchemaError),
    #[error("column `{0}` has a dtype the column processor cannot handle")]
    UnknownDtype(String),
    #[error("row {row} carries op code {op}, which is neither INSERT nor DELETE")]
    UnknownOp { row: usize, op: u8 },
    #[error("computed column `{column}` references an invalid function")]
    InvalidComputedFunction { column: String },
    #[error("cannot promote column `{column}` from {from} to {to}")]
    UnsupportedPromotion {
        column: String,
        from: Dtype,
        to: Dtype,
    },
    #[error("transition fell through the decision table at row {row}, column `{column}`")]
    UnexpectedTransition { row: usize, column: String },
    #[error("engine used before init")]
    EngineNotInitialized,
    #[error("no engine registered with id {0}")]
    UnknownEngine(usize),
    #[error("no column named `{0}`")]
    NoSuchColumn(String),
    #[error("table verification failed: {0}")]
    Verify(String),
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;
