//! Error types for the grid index and query engine

use thiserror::Error;

pub type Result<T> = std::result::Result<T, OsmGridError>;

#[derive(Error, Debug)]
pub enum OsmGridError {
    #[error("Malformed input: {0}")]
    InputMalformed(String),

    #[error("Parse error at byte {position}: expected {expected}, found {found}")]
    Parse {
        position: usize,
        expected: String,
        found: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cell file error at {path}: {source}")]
    CellIo {
        path: String,
        source: std::io::Error,
    },

    #[error("Invalid file format: {0}")]
    InvalidFormat(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Validity violation in cell ({x},{y}): {detail}")]
    ValidityViolation { x: i32, y: i32, detail: String },

    #[error("Key '{key}' has more than {} distinct values", (1 << 24) - 1)]
    TooManyValues { key: String },

    #[error("Unsupported operation: {0}")]
    Unsupported(String),
}

impl OsmGridError {
    /// Error code for the HTTP front end
    pub fn code(&self) -> &'static str {
        match self {
            OsmGridError::InputMalformed(_) => "INPUT_MALFORMED",
            OsmGridError::Parse { .. } => "PARSE_ERROR",
            OsmGridError::CellIo { .. } => "CELL_IO",
            OsmGridError::InvalidFormat(_) => "INVALID_FORMAT",
            OsmGridError::ValidityViolation { .. } => "VALIDITY_VIOLATION",
            OsmGridError::TooManyValues { .. } => "TOO_MANY_VALUES",
            OsmGridError::Unsupported(_) => "UNSUPPORTED",
            _ => "INTERNAL_ERROR",
        }
    }

    /// Byte position for parse errors, for front-end highlighting.
    pub fn position(&self) -> Option<usize> {
        match self {
            OsmGridError::Parse { position, .. } => Some(*position),
            _ => None,
        }
    }
}
