//! Structural validation of inbound CSI requests.
//!
//! Every check runs before any side effect. Missing fields map to a fixed
//! set of [`ValidationError`] kinds; unsupported capabilities are collected
//! into a single error so the caller sees all of them at once.

use std::fmt;

use thiserror::Error;

use crate::csi;

/// Volume context key carrying the NFS mount source from controller to node.
pub const MOUNT_URL_KEY: &str = "mountURL";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("volume id was not provided")]
    VolumeIdNotProvided,

    #[error("name was not provided")]
    NameNotProvided,

    #[error("capacity range was not provided")]
    CapacityRangeNotProvided,

    #[error("volume capabilities not set")]
    VolumeCapabilitiesNotProvided,

    #[error("target path was not provided")]
    TargetPathNotProvided,

    #[error("volume capability not provided")]
    VolumeCapabilityNotProvided,

    #[error("mountURL not present in volume context")]
    MountUrlNotProvided,

    #[error("unsupported volume capabilities: {0}")]
    UnsupportedCapabilities(UnsupportedCapabilities),
}

/// Every capability in a request that asked for block access.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsupportedCapabilities {
    /// Positions of the offending entries in the request's capability list.
    pub indices: Vec<usize>,
}

impl fmt::Display for UnsupportedCapabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reasons: Vec<String> = self
            .indices
            .iter()
            .map(|i| format!("capability {i}: block volumes are not supported"))
            .collect();
        write!(f, "{}", reasons.join("; "))
    }
}

/// Extension trait for validating required fields.
///
/// Returns the given error kind if the field is missing or empty.
pub trait Require<T> {
    fn require(self, missing: ValidationError) -> Result<T, ValidationError>;
}

impl Require<String> for String {
    fn require(self, missing: ValidationError) -> Result<String, ValidationError> {
        if self.is_empty() { Err(missing) } else { Ok(self) }
    }
}

impl<T> Require<T> for Option<T> {
    fn require(self, missing: ValidationError) -> Result<T, ValidationError> {
        self.ok_or(missing)
    }
}

/// Reject capabilities asking for block access; only filesystem mounts are supported.
pub fn check_volume_capabilities(caps: &[csi::VolumeCapability]) -> Result<(), ValidationError> {
    let indices: Vec<usize> = caps
        .iter()
        .enumerate()
        .filter(|(_, cap)| {
            matches!(
                cap.access_type,
                Some(csi::volume_capability::AccessType::Block(_))
            )
        })
        .map(|(i, _)| i)
        .collect();

    if indices.is_empty() {
        Ok(())
    } else {
        Err(ValidationError::UnsupportedCapabilities(
            UnsupportedCapabilities { indices },
        ))
    }
}

pub fn check_create_volume_request(req: &csi::CreateVolumeRequest) -> Result<(), ValidationError> {
    if req.name.is_empty() {
        return Err(ValidationError::NameNotProvided);
    }
    if req.capacity_range.is_none() {
        return Err(ValidationError::CapacityRangeNotProvided);
    }
    if req.volume_capabilities.is_empty() {
        return Err(ValidationError::VolumeCapabilitiesNotProvided);
    }
    check_volume_capabilities(&req.volume_capabilities)
}

/// Capability support is checked separately, after the volume lookup.
pub fn check_validate_volume_capabilities_request(
    req: &csi::ValidateVolumeCapabilitiesRequest,
) -> Result<(), ValidationError> {
    if req.volume_id.is_empty() {
        return Err(ValidationError::VolumeIdNotProvided);
    }
    if req.volume_capabilities.is_empty() {
        return Err(ValidationError::VolumeCapabilitiesNotProvided);
    }
    Ok(())
}

pub fn check_node_publish_volume_request(
    req: &csi::NodePublishVolumeRequest,
) -> Result<(), ValidationError> {
    if req.volume_id.is_empty() {
        return Err(ValidationError::VolumeIdNotProvided);
    }
    if req.target_path.is_empty() {
        return Err(ValidationError::TargetPathNotProvided);
    }
    if req.volume_capability.is_none() {
        return Err(ValidationError::VolumeCapabilityNotProvided);
    }
    if !req.volume_context.contains_key(MOUNT_URL_KEY) {
        return Err(ValidationError::MountUrlNotProvided);
    }
    Ok(())
}

pub fn check_node_unpublish_volume_request(
    req: &csi::NodeUnpublishVolumeRequest,
) -> Result<(), ValidationError> {
    if req.volume_id.is_empty() {
        return Err(ValidationError::VolumeIdNotProvided);
    }
    if req.target_path.is_empty() {
        return Err(ValidationError::TargetPathNotProvided);
    }
    Ok(())
}
