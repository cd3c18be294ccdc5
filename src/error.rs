//! Error types for the wgmeshd daemon

use thiserror::Error;

/// Main error type for wgmeshd
#[derive(Error, Debug)]
pub enum WgMeshError {
    /// Mesh resolution and validation errors
    #[error("Mesh error: {0}")]
    Mesh(#[from] MeshError),

    /// Key material errors
    #[error("Key error: {0}")]
    Key(#[from] KeyError),

    /// State store errors
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Runtime adapter errors
    #[error("Runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    /// Provisioning service errors
    #[error("Service error: {0}")]
    Service(#[from] ServiceError),

    /// System I/O errors
    #[error("System error: {0}")]
    System(#[from] std::io::Error),
}

/// Mesh spec validation and resolution errors
#[derive(Error, Debug)]
pub enum MeshError {
    #[error("Invalid CIDR notation: {value}")]
    InvalidCidr { value: String },

    #[error("Network {cidr} cannot hold {needed} addresses at offset {offset}")]
    CapacityExceeded {
        cidr: String,
        offset: u32,
        needed: usize,
    },

    #[error("Gateway {name} is not a defined node")]
    UnknownGateway { name: String },

    #[error("Peer {peer} has no usable key material")]
    MissingKey { peer: String },

    #[error("Invalid field {field}: {message}")]
    Validation { field: String, message: String },
}

/// Key encoding and derivation errors
#[derive(Error, Debug)]
pub enum KeyError {
    #[error("Invalid base64 key: {0}")]
    InvalidEncoding(String),

    #[error("Invalid key length: expected {expected} bytes, got {got}")]
    InvalidLength { expected: usize, got: usize },
}

/// State store errors
#[derive(Error, Debug)]
pub enum StateError {
    #[error("Could not acquire state lock at {path} after {attempts} attempts")]
    LockTimeout { path: String, attempts: u32 },

    #[error("State file is corrupt: {reason}")]
    CorruptState { reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors surfaced by the WireGuard runtime adapter
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Command failed: {message}")]
    Command {
        message: String,
        code: Option<i32>,
        stderr: Option<String>,
    },

    #[error("Interface does not exist: {name}")]
    NotExists { name: String },

    #[error("Unparseable runtime output: {0}")]
    BadOutput(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RuntimeError {
    /// True when the error means the target interface is absent rather
    /// than the command itself having failed.
    pub fn is_not_exists(&self) -> bool {
        matches!(self, Self::NotExists { .. })
    }
}

/// Provisioning service errors
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Revision conflict: expected {expected}, received {received}")]
    RevisionConflict { expected: u64, received: u64 },

    #[error("Interface not found: {name}")]
    InterfaceNotFound { name: String },

    #[error("Apply failed: {message}")]
    ApplyFailed { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl WgMeshError {
    /// Stable error code used in API envelopes.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Mesh(_) | Self::Key(_) => "VALIDATION_ERROR",
            Self::Service(ServiceError::RevisionConflict { .. }) => "REVISION_CONFLICT",
            Self::Service(ServiceError::InterfaceNotFound { .. }) => "INTERFACE_NOT_FOUND",
            Self::Service(ServiceError::ApplyFailed { .. }) => "APPLY_FAILED",
            _ => "INTERNAL_ERROR",
        }
    }
}

/// Result type alias for wgmeshd operations
pub type Result<T> = std::result::Result<T, WgMeshError>;
