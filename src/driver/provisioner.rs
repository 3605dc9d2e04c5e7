//! Controller-side volume lifecycle against the engine.
//!
//! Creation is idempotent by name without any local locking. Concurrent
//! creates of the same name may both be accepted by the engine; the loser
//! sees its volume fail with a "not unique" error, removes it, and adopts
//! the winner. All state lives in the engine.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::csi;
use crate::engine::{Engine, EngineError, LifecycleState, NewVolume, Volume};
use crate::error::{Error, Result};
use crate::types::MountUrl;
use crate::validate::check_volume_capabilities;

/// Create parameter selecting the storage tier.
pub const PARAM_ADS_CLASS: &str = "csi.anx.io/ads-class";
/// Create parameter selecting the storage server interface serving the volume.
pub const PARAM_STORAGE_SERVER_IDENTIFIER: &str = "csi.anx.io/storage-server-identifier";

/// Inputs of a create call after capacity resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateParams {
    pub name: String,
    pub size_bytes: i64,
    pub storage_class: String,
    pub storage_server_ref: String,
}

/// A ready volume together with the mount source nodes will use.
#[derive(Debug, Clone, PartialEq)]
pub struct ProvisionedVolume {
    pub volume: Volume,
    pub mount_url: MountUrl,
}

/// Terminal outcome of submitting a create request.
#[derive(Debug, Clone, PartialEq)]
pub enum CreateOutcome {
    /// Our own request produced the volume.
    Created(Volume),
    /// Another request already owns the name with a matching size.
    AdoptedExisting(Volume),
    /// Another volume owns the name with a different size.
    Conflict { existing: Volume, requested_bytes: i64 },
}

pub struct Provisioner {
    engine: Arc<dyn Engine>,
    poll_interval: Duration,
}

impl Provisioner {
    pub fn new(engine: Arc<dyn Engine>, poll_interval: Duration) -> Self {
        Self {
            engine,
            poll_interval,
        }
    }

    /// Create (or find) the volume named in `params` and build its mount URL.
    ///
    /// Waiting for the engine is bounded by `deadline`; running out of time
    /// is reported as [`Error::VolumeNotReady`] so the caller retries.
    pub async fn create_volume(
        &self,
        params: &CreateParams,
        deadline: Instant,
    ) -> Result<ProvisionedVolume> {
        let ssi = self
            .engine
            .get_storage_server_interface(&params.storage_server_ref)
            .await?;
        let network_name = ssi
            .network_name()
            .ok_or_else(|| Error::StorageServerWithoutAddress {
                identifier: params.storage_server_ref.clone(),
            })?
            .to_string();

        let volume = match self.provision(params, deadline).await? {
            CreateOutcome::Created(volume) => {
                info!(volume_id = %volume.identifier, "volume created");
                volume
            }
            CreateOutcome::AdoptedExisting(volume) => {
                info!(volume_id = %volume.identifier, "adopted existing volume with same name");
                volume
            }
            CreateOutcome::Conflict {
                existing,
                requested_bytes,
            } => {
                return Err(Error::VolumeNameConflict {
                    name: params.name.clone(),
                    existing_bytes: existing.size_bytes,
                    requested_bytes,
                });
            }
        };

        // The engine may report Ready before the export path is assigned.
        if volume.path.is_empty() {
            warn!(volume_id = %volume.identifier, "volume has no path yet");
            return Err(Error::VolumeNotReady {
                name: params.name.clone(),
            });
        }

        let mount_url = MountUrl::new(&network_name, &volume.path);
        Ok(ProvisionedVolume { volume, mount_url })
    }

    /// Submit the create request and settle it into one [`CreateOutcome`].
    pub async fn provision(&self, params: &CreateParams, deadline: Instant) -> Result<CreateOutcome> {
        let request = NewVolume {
            name: params.name.clone(),
            size_bytes: params.size_bytes,
            storage_class: params.storage_class.clone(),
            storage_server_ref: params.storage_server_ref.clone(),
        };

        let accepted = match self.engine.create_volume(&request).await {
            Ok(volume) => volume,
            Err(e) if e.is_unprocessable() => {
                debug!(error = %e, "engine refused create, name is taken");
                return self.reconcile_duplicate(params, None, deadline).await;
            }
            Err(e) => return Err(e.into()),
        };
        debug!(volume_id = %accepted.identifier, "create accepted, awaiting completion");

        let volume = self
            .await_ready(&accepted.identifier, &params.name, deadline)
            .await?;

        if volume.is_name_not_unique() {
            debug!(volume_id = %volume.identifier, "lost creation race");
            return self.reconcile_duplicate(params, Some(volume), deadline).await;
        }
        if volume.state == LifecycleState::Error {
            return Err(Error::VolumeFailed {
                volume_id: volume.identifier,
                message: volume.error,
            });
        }
        Ok(CreateOutcome::Created(volume))
    }

    /// Settle a create whose name is already taken.
    ///
    /// `own` is this call's half-created volume, if the engine accepted it.
    /// It is destroyed once the original has been found.
    pub async fn reconcile_duplicate(
        &self,
        params: &CreateParams,
        own: Option<Volume>,
        deadline: Instant,
    ) -> Result<CreateOutcome> {
        let except = own.as_ref().map(|v| v.identifier.as_str());
        let original = self.find_volume_by_name_except(&params.name, except).await?;

        if let Some(own) = own {
            match self.engine.destroy_volume(&own.identifier).await {
                Ok(()) => info!(volume_id = %own.identifier, "deleted duplicate volume"),
                Err(e) if e.is_not_found() => {}
                Err(source) => {
                    return Err(Error::DuplicateCleanup {
                        volume_id: own.identifier,
                        source,
                    });
                }
            }
        }

        if original.size_bytes != params.size_bytes {
            return Ok(CreateOutcome::Conflict {
                existing: original,
                requested_bytes: params.size_bytes,
            });
        }

        let original = match original.state {
            LifecycleState::Pending => {
                self.await_ready(&original.identifier, &params.name, deadline)
                    .await?
            }
            _ => original,
        };
        if original.state == LifecycleState::Error {
            return Err(Error::VolumeFailed {
                volume_id: original.identifier,
                message: original.error,
            });
        }
        Ok(CreateOutcome::AdoptedExisting(original))
    }

    async fn find_volume_by_name_except(&self, name: &str, except: Option<&str>) -> Result<Volume> {
        let lookup_failed = |message: String| Error::DuplicateLookup {
            name: name.to_string(),
            message,
        };

        let candidates = self
            .engine
            .list_volumes_by_name(name)
            .await
            .map_err(|e| lookup_failed(format!("failed listing volumes: {e}")))?;

        let original = candidates
            .into_iter()
            .find(|v| v.name == name && Some(v.identifier.as_str()) != except)
            .ok_or_else(|| lookup_failed("no other volume with this name".to_string()))?;

        self.engine
            .get_volume(&original.identifier)
            .await
            .map_err(|e| lookup_failed(format!("failed retrieving full volume object: {e}")))
    }

    async fn await_ready(&self, identifier: &str, name: &str, deadline: Instant) -> Result<Volume> {
        match self
            .engine
            .await_volume(identifier, deadline, self.poll_interval)
            .await
        {
            Err(EngineError::DeadlineExceeded { .. }) => Err(Error::VolumeNotReady {
                name: name.to_string(),
            }),
            other => Ok(other?),
        }
    }

    /// Destroy a volume. Unknown ids are already deleted.
    pub async fn delete_volume(&self, volume_id: &str) -> Result<()> {
        match self.engine.destroy_volume(volume_id).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => {
                debug!(volume_id, "volume already gone");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Grow a volume to `size_bytes` and return its resulting size. Volumes
    /// never shrink: a size at or below the current one leaves it unchanged.
    /// The network filesystem grows in place, so nodes do not need to act.
    pub async fn expand_volume(&self, volume_id: &str, size_bytes: i64) -> Result<i64> {
        let volume = self.engine.get_volume(volume_id).await?;
        if size_bytes <= volume.size_bytes {
            debug!(
                current_bytes = volume.size_bytes,
                requested_bytes = size_bytes,
                "volume already large enough"
            );
            return Ok(volume.size_bytes);
        }

        self.engine.update_volume_size(volume_id, size_bytes).await?;
        Ok(size_bytes)
    }

    /// Confirm `caps` for an existing volume.
    pub async fn validate_volume_capabilities(
        &self,
        volume_id: &str,
        caps: Vec<csi::VolumeCapability>,
    ) -> Result<Vec<csi::VolumeCapability>> {
        self.engine.get_volume(volume_id).await?;
        check_volume_capabilities(&caps)?;
        Ok(caps)
    }
}
