use thiserror::Error;

use crate::model::NodeKind;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Year {year} is outside the covered range {min}..={max}")]
    OutOfRangeYear { year: i32, min: i32, max: i32 },

    #[error("Invalid endpoints: {0}")]
    InvalidEndpoints(String),

    #[error("No route found from {origin} to {destination}")]
    Unreachable { origin: String, destination: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Data inconsistency: {0}")]
    DataInconsistency(String),

    #[error("Invalid kind transition for node {node}: {from:?} -> {to:?}")]
    InvalidTransition {
        node: String,
        from: NodeKind,
        to: NodeKind,
    },

    #[error("Snapshot already exists for year {0}")]
    SnapshotExists(i32),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
