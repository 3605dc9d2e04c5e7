//! Engine collaborator: the remote service that provisions and tracks volumes.
//!
//! All durable volume state lives in the engine. This module defines the
//! resource shapes the driver reads and writes, the [`Engine`] trait the
//! controller is written against, and the completion-await poll loop.

mod http;

pub use http::{DEFAULT_ENGINE_URL, EngineConfig, HttpEngine};

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tracing::trace;

/// Suffix of the engine's error message when two volumes were accepted with
/// the same name.
pub const NAME_NOT_UNIQUE_SUFFIX: &str = "is not unique";

/// HTTP status the engine answers with when a create request is rejected
/// because the name is already taken.
pub const HTTP_UNPROCESSABLE_ENTITY: u16 = 422;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine returned HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("engine request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("invalid engine URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("deadline exceeded while waiting for volume {identifier} to leave the pending state")]
    DeadlineExceeded { identifier: String },
}

impl EngineError {
    /// HTTP status of the engine's response, if there was one.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            Self::Request(e) => e.status().map(|s| s.as_u16()),
            Self::Url(_) | Self::DeadlineExceeded { .. } => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status_code() == Some(404)
    }

    /// The engine refused the request structurally (used for duplicate names).
    pub fn is_unprocessable(&self) -> bool {
        self.status_code() == Some(HTTP_UNPROCESSABLE_ENTITY)
    }
}

/// Provisioning state of an engine resource.
///
/// Moves from `Pending` to either `Ready` or `Error` and never back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "WireState", into = "WireState")]
pub enum LifecycleState {
    #[default]
    Pending,
    Ready,
    Error,
}

/// The engine's `{"id", "text", "type"}` state object.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct WireState {
    #[serde(default)]
    id: String,
    #[serde(default)]
    text: String,
    #[serde(rename = "type", default = "WireState::pending_type")]
    kind: i32,
}

impl WireState {
    const OK: i32 = 0;
    const ERROR: i32 = 1;
    const PENDING: i32 = 2;

    fn pending_type() -> i32 {
        Self::PENDING
    }
}

impl From<WireState> for LifecycleState {
    fn from(state: WireState) -> Self {
        match state.kind {
            WireState::OK => Self::Ready,
            WireState::ERROR => Self::Error,
            _ => Self::Pending,
        }
    }
}

impl From<LifecycleState> for WireState {
    fn from(state: LifecycleState) -> Self {
        let (kind, text) = match state {
            LifecycleState::Ready => (Self::OK, "OK"),
            LifecycleState::Error => (Self::ERROR, "Error"),
            LifecycleState::Pending => (Self::PENDING, "Pending"),
        };
        Self {
            id: String::new(),
            text: text.to_string(),
            kind,
        }
    }
}

/// Reference to another engine resource by identifier.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRef {
    #[serde(default)]
    pub identifier: String,
    #[serde(default)]
    pub name: String,
}

/// A dynamic volume as stored by the engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Volume {
    /// Engine-assigned; empty until the create request is accepted.
    #[serde(default)]
    pub identifier: String,
    /// Client-assigned idempotency key.
    #[serde(default)]
    pub name: String,
    #[serde(rename = "size", default)]
    pub size_bytes: i64,
    #[serde(rename = "ads_class", default)]
    pub storage_class: String,
    #[serde(default)]
    pub storage_server_interfaces: Option<Vec<ResourceRef>>,
    /// Export path on the storage server, set once provisioning completes.
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub state: LifecycleState,
}

impl Volume {
    /// The engine's error message, only meaningful in the `Error` state.
    pub fn error_message(&self) -> Option<&str> {
        (self.state == LifecycleState::Error && !self.error.is_empty())
            .then_some(self.error.as_str())
    }

    /// Whether the engine rejected this volume because another one with the
    /// same name won the creation race.
    pub fn is_name_not_unique(&self) -> bool {
        self.error_message()
            .is_some_and(|msg| msg.ends_with(NAME_NOT_UNIQUE_SUFFIX))
    }
}

/// Create request body for a volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewVolume {
    pub name: String,
    #[serde(rename = "size")]
    pub size_bytes: i64,
    #[serde(rename = "ads_class")]
    pub storage_class: String,
    /// Comma-separated storage server interface identifiers.
    #[serde(rename = "storage_server_interfaces")]
    pub storage_server_ref: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpAddress {
    #[serde(default)]
    pub identifier: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    #[serde(default)]
    pub identifier: String,
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub name: String,
}

/// A network endpoint of a storage server that serves volume data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageServerInterface {
    #[serde(default)]
    pub identifier: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub ip_address: Option<IpAddress>,
    #[serde(default)]
    pub location: Option<Location>,
    #[serde(default)]
    pub state: LifecycleState,
}

impl StorageServerInterface {
    /// Hostname or IP used as the NFS mount source.
    ///
    /// `None` when the engine hides the address, which happens when the
    /// token lacks IPAM permissions.
    pub fn network_name(&self) -> Option<&str> {
        self.ip_address
            .as_ref()
            .map(|ip| ip.name.as_str())
            .filter(|name| !name.is_empty())
    }
}

/// Operations the driver needs from the engine.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Submit a create request. The returned volume is usually still pending.
    async fn create_volume(&self, volume: &NewVolume) -> Result<Volume, EngineError>;

    async fn get_volume(&self, identifier: &str) -> Result<Volume, EngineError>;

    async fn update_volume_size(&self, identifier: &str, size_bytes: i64)
    -> Result<(), EngineError>;

    async fn destroy_volume(&self, identifier: &str) -> Result<(), EngineError>;

    /// List volumes filtered by name. Entries may be partial; fetch each with
    /// [`Engine::get_volume`] for the full record.
    async fn list_volumes_by_name(&self, name: &str) -> Result<Vec<Volume>, EngineError>;

    async fn get_storage_server_interface(
        &self,
        identifier: &str,
    ) -> Result<StorageServerInterface, EngineError>;

    /// Poll a volume until it leaves `Pending` or `deadline` passes.
    ///
    /// Every iteration re-checks both the volume state and the deadline.
    /// Dropping the returned future cancels the wait.
    async fn await_volume(
        &self,
        identifier: &str,
        deadline: Instant,
        poll_interval: Duration,
    ) -> Result<Volume, EngineError> {
        let deadline_exceeded = || EngineError::DeadlineExceeded {
            identifier: identifier.to_string(),
        };

        loop {
            let volume = tokio::time::timeout_at(deadline, self.get_volume(identifier))
                .await
                .map_err(|_| deadline_exceeded())??;

            if volume.state != LifecycleState::Pending {
                return Ok(volume);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(deadline_exceeded());
            }
            trace!(identifier, "volume still pending");
            tokio::time::sleep_until(std::cmp::min(now + poll_interval, deadline)).await;
        }
    }
}
