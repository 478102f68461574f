//! Mesh error types.
//!
//! Every variant maps onto one of the harness error codes so a failed request
//! can be answered with an `error` body instead of a success reply.

use std::time::Duration;

use thiserror::Error;

pub type MeshResult<T> = Result<T, MeshError>;

/// Harness error codes carried in `error` replies.
pub mod codes {
    pub const TIMEOUT: u32 = 0;
    pub const NODE_NOT_FOUND: u32 = 1;
    pub const NOT_SUPPORTED: u32 = 10;
    pub const TEMPORARILY_UNAVAILABLE: u32 = 11;
    pub const MALFORMED_REQUEST: u32 = 12;
    pub const CRASH: u32 = 13;
    pub const PRECONDITION_FAILED: u32 = 22;
}

#[derive(Debug, Error)]
pub enum MeshError {
    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Unsupported message type: {0}")]
    NotSupported(String),

    #[error("Node identity already assigned: {0}")]
    AlreadyInitialized(String),

    #[error("Node identity not assigned yet")]
    NotInitialized,

    #[error("Topology already installed")]
    TopologyAlreadyInstalled,

    #[error("Ingestor has stopped accepting values")]
    IngestorClosed,

    #[error("Transport closed: {0}")]
    TransportClosed(String),

    #[error("Unknown destination: {0}")]
    UnknownDestination(String),

    #[error("No reply within {0:?}")]
    Timeout(Duration),

    #[error("Remote error {code}: {text}")]
    Remote { code: u32, text: String },

    #[error("Unexpected reply: {0}")]
    UnexpectedReply(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl MeshError {
    /// Error code reported to the requester.
    pub fn code(&self) -> u32 {
        match self {
            MeshError::Malformed(_) | MeshError::Json(_) => codes::MALFORMED_REQUEST,
            MeshError::NotSupported(_) => codes::NOT_SUPPORTED,
            MeshError::AlreadyInitialized(_) | MeshError::TopologyAlreadyInstalled => {
                codes::PRECONDITION_FAILED
            }
            MeshError::NotInitialized
            | MeshError::IngestorClosed
            | MeshError::TransportClosed(_) => codes::TEMPORARILY_UNAVAILABLE,
            MeshError::UnknownDestination(_) => codes::NODE_NOT_FOUND,
            MeshError::Timeout(_) => codes::TIMEOUT,
            MeshError::Remote { code, .. } => *code,
            MeshError::UnexpectedReply(_)
            | MeshError::Config(_)
            | MeshError::Yaml(_)
            | MeshError::Io(_) => codes::CRASH,
        }
    }
}
