//! Error types for the CSI driver.
//!
//! `impl From<Error> for tonic::Status` is the single place where driver
//! errors are translated into CSI status codes. Errors that already carry a
//! code are passed through untouched; raw engine errors are classified by
//! their HTTP status.

use std::io;

use thiserror::Error;
use tonic::Status;

use crate::engine::EngineError;
use crate::validate::ValidationError;

pub type Result<T> = std::result::Result<T, Error>;

/// CSI driver errors with structured context.
#[derive(Debug, Error)]
pub enum Error {
    #[error("request check failed: {0}")]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    /// An error that was already classified with a gRPC code.
    ///
    /// No driver path builds one today. It is the pass-through arm of the
    /// translator: a `Status` lifted into `Error` with `?` comes back out
    /// unchanged instead of being re-wrapped as `INTERNAL`.
    #[error("{}", .0.message())]
    Rpc(#[from] Status),

    #[error("volume {name} is not ready yet")]
    VolumeNotReady { name: String },

    #[error(
        "volume with the same name, but different size already exists: {name} has {existing_bytes} bytes, requested {requested_bytes}"
    )]
    VolumeNameConflict {
        name: String,
        existing_bytes: i64,
        requested_bytes: i64,
    },

    #[error("volume {volume_id} failed to provision: {message}")]
    VolumeFailed { volume_id: String, message: String },

    #[error(
        "engine returned no IP address for storage server interface {identifier}, likely due to missing permissions on the token"
    )]
    StorageServerWithoutAddress { identifier: String },

    #[error("failed finding original volume named {name}: {message}")]
    DuplicateLookup { name: String, message: String },

    #[error("failed deleting duplicate volume {volume_id}: {source}")]
    DuplicateCleanup {
        volume_id: String,
        #[source]
        source: EngineError,
    },

    #[error("invalid endpoint: {endpoint}")]
    InvalidEndpoint { endpoint: String },

    #[error("invalid components {value:?}, expected one of 'controller', 'node' or 'combined'")]
    InvalidComponents { value: String },

    #[error("no engine token configured")]
    MissingEngineToken,

    #[error("error creating target directory {target}: {source}")]
    CreateTarget {
        target: String,
        #[source]
        source: io::Error,
    },

    #[error("error checking if target path {target} is a mount point: {source}")]
    MountPointProbe {
        target: String,
        #[source]
        source: io::Error,
    },

    #[error("error mounting {mount_source} on {target}: {source}")]
    Mount {
        mount_source: String,
        target: String,
        #[source]
        source: io::Error,
    },

    #[error("error cleaning up mount point {target}: {source}")]
    Unmount {
        target: String,
        #[source]
        source: io::Error,
    },

    #[error("too many mount options: {count} exceeds maximum of {max}")]
    TooManyMountOptions { count: usize, max: usize },

    #[error("server was cancelled")]
    Cancelled,

    #[error("gRPC transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Classify an engine error that carries no gRPC code of its own.
///
/// Only the HTTP status is inspected: 404 becomes `NOT_FOUND`, 500 becomes
/// `INTERNAL`, everything else stays `UNKNOWN`. The engine's message is kept
/// in the status message.
pub fn engine_error_to_status(err: &EngineError) -> Status {
    match err.status_code() {
        Some(404) => Status::not_found(format!("resource not found: {err}")),
        Some(500) => Status::internal(format!("internal server error: {err}")),
        _ => Status::unknown(err.to_string()),
    }
}

impl From<Error> for Status {
    fn from(err: Error) -> Self {
        match err {
            // Already classified: never re-wrap.
            Error::Rpc(status) => status,

            Error::Engine(ref engine) => engine_error_to_status(engine),

            // INVALID_ARGUMENT: Client provided invalid input
            Error::Validation(_)
            | Error::InvalidEndpoint { .. }
            | Error::InvalidComponents { .. }
            | Error::TooManyMountOptions { .. } => Status::invalid_argument(err.to_string()),

            // UNAVAILABLE: the engine keeps provisioning, the CO retries
            Error::VolumeNotReady { .. } => Status::unavailable(err.to_string()),

            // ALREADY_EXISTS: Volume exists but with incompatible parameters
            Error::VolumeNameConflict { .. } => Status::already_exists(err.to_string()),

            Error::Cancelled => Status::cancelled(err.to_string()),

            // INTERNAL: Infrastructure errors
            Error::VolumeFailed { .. }
            | Error::StorageServerWithoutAddress { .. }
            | Error::DuplicateLookup { .. }
            | Error::DuplicateCleanup { .. }
            | Error::MissingEngineToken
            | Error::CreateTarget { .. }
            | Error::MountPointProbe { .. }
            | Error::Mount { .. }
            | Error::Unmount { .. }
            | Error::Transport(_)
            | Error::Io(_) => Status::internal(err.to_string()),
        }
    }
}
