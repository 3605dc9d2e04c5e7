//! CSI Controller service implementation.
//!
//! Thin gRPC layer that validates requests and delegates to the
//! [`Provisioner`] for anything touching the engine.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;
use tonic::metadata::MetadataMap;
use tonic::{Request, Response, Status};
use tracing::{Instrument, Span, info, info_span, warn};

use crate::capacity;
use crate::csi;
use crate::driver::provisioner::{
    CreateParams, PARAM_ADS_CLASS, PARAM_STORAGE_SERVER_IDENTIFIER, Provisioner,
};
use crate::error::Result;
use crate::validate::{
    MOUNT_URL_KEY, Require, ValidationError, check_create_volume_request,
    check_validate_volume_capabilities_request,
};

const GRPC_TIMEOUT_HEADER: &str = "grpc-timeout";

/// Parse a `grpc-timeout` header value: up to eight digits and a unit.
fn parse_grpc_timeout(value: &str) -> Option<Duration> {
    if !value.is_ascii() || value.len() < 2 || value.len() > 9 {
        return None;
    }
    let (digits, unit) = value.split_at(value.len() - 1);
    let amount: u64 = digits.parse().ok()?;
    let timeout = match unit {
        "H" => Duration::from_secs(amount * 3600),
        "M" => Duration::from_secs(amount * 60),
        "S" => Duration::from_secs(amount),
        "m" => Duration::from_millis(amount),
        "u" => Duration::from_micros(amount),
        "n" => Duration::from_nanos(amount),
        _ => return None,
    };
    Some(timeout)
}

fn request_timeout(metadata: &MetadataMap) -> Option<Duration> {
    metadata
        .get(GRPC_TIMEOUT_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_grpc_timeout)
}

pub struct ControllerService {
    provisioner: Provisioner,
    create_timeout: Duration,
    span: Span,
}

impl ControllerService {
    pub fn new(provisioner: Provisioner, create_timeout: Duration) -> Self {
        Self {
            provisioner,
            create_timeout,
            span: info_span!("controller", component = "controller"),
        }
    }

    /// How long a create call may wait for the engine.
    fn create_budget(&self, metadata: &MetadataMap) -> Duration {
        request_timeout(metadata).map_or(self.create_timeout, |t| t.min(self.create_timeout))
    }

    async fn create(
        &self,
        req: csi::CreateVolumeRequest,
        deadline: Instant,
    ) -> Result<csi::CreateVolumeResponse> {
        info!("creating volume");
        check_create_volume_request(&req)?;

        let param = |key: &str| req.parameters.get(key).cloned().unwrap_or_default();
        let params = CreateParams {
            name: req.name.clone(),
            size_bytes: capacity::resolve(req.capacity_range.as_ref()),
            storage_class: param(PARAM_ADS_CLASS),
            storage_server_ref: param(PARAM_STORAGE_SERVER_IDENTIFIER),
        };

        let created = self
            .provisioner
            .create_volume(&params, deadline)
            .await
            .inspect_err(|e| warn!(error = %e, "volume creation failed"))?;

        Ok(csi::CreateVolumeResponse {
            volume: Some(csi::Volume {
                volume_id: created.volume.identifier,
                capacity_bytes: created.volume.size_bytes,
                volume_context: HashMap::from([(
                    MOUNT_URL_KEY.to_string(),
                    created.mount_url.into_string(),
                )]),
                ..Default::default()
            }),
        })
    }

    async fn delete(&self, req: csi::DeleteVolumeRequest) -> Result<()> {
        let volume_id = req
            .volume_id
            .require(ValidationError::VolumeIdNotProvided)?;
        self.provisioner
            .delete_volume(&volume_id)
            .await
            .inspect_err(|e| warn!(error = %e, "volume deletion failed"))?;
        info!("volume deleted");
        Ok(())
    }

    async fn validate(
        &self,
        req: csi::ValidateVolumeCapabilitiesRequest,
    ) -> Result<csi::ValidateVolumeCapabilitiesResponse> {
        check_validate_volume_capabilities_request(&req)?;
        let volume_capabilities = self
            .provisioner
            .validate_volume_capabilities(&req.volume_id, req.volume_capabilities)
            .await?;

        Ok(csi::ValidateVolumeCapabilitiesResponse {
            confirmed: Some(csi::validate_volume_capabilities_response::Confirmed {
                volume_capabilities,
                ..Default::default()
            }),
            message: String::new(),
        })
    }

    async fn expand(
        &self,
        req: csi::ControllerExpandVolumeRequest,
    ) -> Result<csi::ControllerExpandVolumeResponse> {
        let volume_id = req
            .volume_id
            .require(ValidationError::VolumeIdNotProvided)?;
        let capacity_range = req
            .capacity_range
            .require(ValidationError::CapacityRangeNotProvided)?;
        let size_bytes = capacity::resolve(Some(&capacity_range));

        let capacity_bytes = self
            .provisioner
            .expand_volume(&volume_id, size_bytes)
            .await
            .inspect_err(|e| warn!(error = %e, "volume could not be updated"))?;
        info!(capacity_bytes, "volume expanded");

        Ok(csi::ControllerExpandVolumeResponse {
            capacity_bytes,
            node_expansion_required: false,
        })
    }
}

#[tonic::async_trait]
impl csi::controller_server::Controller for ControllerService {
    async fn create_volume(
        &self,
        request: Request<csi::CreateVolumeRequest>,
    ) -> std::result::Result<Response<csi::CreateVolumeResponse>, Status> {
        let deadline = Instant::now() + self.create_budget(request.metadata());
        let req = request.into_inner();
        let span = info_span!(parent: &self.span, "create_volume", name = %req.name);

        let response = self.create(req, deadline).instrument(span).await?;
        Ok(Response::new(response))
    }

    async fn delete_volume(
        &self,
        request: Request<csi::DeleteVolumeRequest>,
    ) -> std::result::Result<Response<csi::DeleteVolumeResponse>, Status> {
        let req = request.into_inner();
        let span = info_span!(parent: &self.span, "delete_volume", volume_id = %req.volume_id);

        self.delete(req).instrument(span).await?;
        Ok(Response::new(csi::DeleteVolumeResponse {}))
    }

    async fn controller_publish_volume(
        &self,
        _request: Request<csi::ControllerPublishVolumeRequest>,
    ) -> std::result::Result<Response<csi::ControllerPublishVolumeResponse>, Status> {
        // Attachment happens on the node; accepted so it can be enabled later.
        Ok(Response::new(csi::ControllerPublishVolumeResponse {
            publish_context: HashMap::new(),
        }))
    }

    async fn controller_unpublish_volume(
        &self,
        _request: Request<csi::ControllerUnpublishVolumeRequest>,
    ) -> std::result::Result<Response<csi::ControllerUnpublishVolumeResponse>, Status> {
        Ok(Response::new(csi::ControllerUnpublishVolumeResponse {}))
    }

    async fn validate_volume_capabilities(
        &self,
        request: Request<csi::ValidateVolumeCapabilitiesRequest>,
    ) -> std::result::Result<Response<csi::ValidateVolumeCapabilitiesResponse>, Status> {
        let req = request.into_inner();
        let span = info_span!(
            parent: &self.span,
            "validate_volume_capabilities",
            volume_id = %req.volume_id
        );

        let response = self.validate(req).instrument(span).await?;
        Ok(Response::new(response))
    }

    async fn list_volumes(
        &self,
        _request: Request<csi::ListVolumesRequest>,
    ) -> std::result::Result<Response<csi::ListVolumesResponse>, Status> {
        Err(Status::unimplemented("listing volumes is not supported"))
    }

    async fn get_capacity(
        &self,
        _request: Request<csi::GetCapacityRequest>,
    ) -> std::result::Result<Response<csi::GetCapacityResponse>, Status> {
        Err(Status::unimplemented("capacity reporting is not supported"))
    }

    async fn controller_get_capabilities(
        &self,
        _request: Request<csi::ControllerGetCapabilitiesRequest>,
    ) -> std::result::Result<Response<csi::ControllerGetCapabilitiesResponse>, Status> {
        use csi::controller_service_capability::rpc::Type;

        let capabilities = [
            Type::CreateDeleteVolume,
            Type::SingleNodeMultiWriter,
            Type::ExpandVolume,
        ]
        .into_iter()
        .map(|t| csi::ControllerServiceCapability {
            r#type: Some(csi::controller_service_capability::Type::Rpc(
                csi::controller_service_capability::Rpc { r#type: t as i32 },
            )),
        })
        .collect();

        Ok(Response::new(csi::ControllerGetCapabilitiesResponse {
            capabilities,
        }))
    }

    async fn create_snapshot(
        &self,
        _request: Request<csi::CreateSnapshotRequest>,
    ) -> std::result::Result<Response<csi::CreateSnapshotResponse>, Status> {
        Err(Status::unimplemented("snapshots are not supported"))
    }

    async fn delete_snapshot(
        &self,
        _request: Request<csi::DeleteSnapshotRequest>,
    ) -> std::result::Result<Response<csi::DeleteSnapshotResponse>, Status> {
        Err(Status::unimplemented("snapshots are not supported"))
    }

    async fn list_snapshots(
        &self,
        _request: Request<csi::ListSnapshotsRequest>,
    ) -> std::result::Result<Response<csi::ListSnapshotsResponse>, Status> {
        Err(Status::unimplemented("snapshots are not supported"))
    }

    async fn get_snapshot(
        &self,
        _request: Request<csi::GetSnapshotRequest>,
    ) -> std::result::Result<Response<csi::GetSnapshotResponse>, Status> {
        Err(Status::unimplemented("snapshots are not supported"))
    }

    async fn controller_expand_volume(
        &self,
        request: Request<csi::ControllerExpandVolumeRequest>,
    ) -> std::result::Result<Response<csi::ControllerExpandVolumeResponse>, Status> {
        let req = request.into_inner();
        let span = info_span!(
            parent: &self.span,
            "controller_expand_volume",
            volume_id = %req.volume_id
        );

        let response = self.expand(req).instrument(span).await?;
        Ok(Response::new(response))
    }

    async fn controller_get_volume(
        &self,
        _request: Request<csi::ControllerGetVolumeRequest>,
    ) -> std::result::Result<Response<csi::ControllerGetVolumeResponse>, Status> {
        Err(Status::unimplemented("getting volumes is not supported"))
    }

    async fn controller_modify_volume(
        &self,
        _request: Request<csi::ControllerModifyVolumeRequest>,
    ) -> std::result::Result<Response<csi::ControllerModifyVolumeResponse>, Status> {
        Err(Status::unimplemented("volume modification is not supported"))
    }
}
