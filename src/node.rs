//! CSI Node service implementation.
//!
//! Thin gRPC layer that validates requests and delegates to the
//! [`MountManager`].

use std::path::Path;

use tonic::{Request, Response, Status};
use tracing::{Instrument, Span, info_span, warn};

use crate::csi;
use crate::driver::mount_manager::{MountManager, mount_options};
use crate::error::Result;
use crate::validate::{
    MOUNT_URL_KEY, check_node_publish_volume_request, check_node_unpublish_volume_request,
};

pub struct NodeService {
    node_id: String,
    mounts: MountManager,
    span: Span,
}

impl NodeService {
    pub fn new(node_id: impl Into<String>, mounts: MountManager) -> Self {
        let node_id = node_id.into();
        if node_id.is_empty() {
            warn!("node id is empty");
        }
        let span = info_span!("node", component = "node", node_id = %node_id);
        Self {
            node_id,
            mounts,
            span,
        }
    }

    async fn publish(&self, req: csi::NodePublishVolumeRequest) -> Result<()> {
        check_node_publish_volume_request(&req)?;

        let mount_flags = match req.volume_capability.and_then(|cap| cap.access_type) {
            Some(csi::volume_capability::AccessType::Mount(mount)) => mount.mount_flags,
            _ => vec![],
        };
        let options = mount_options(&mount_flags, req.readonly);
        let mount_url = req
            .volume_context
            .get(MOUNT_URL_KEY)
            .map(String::as_str)
            .unwrap_or_default();

        self.mounts
            .publish(mount_url, Path::new(&req.target_path), &options)
            .await
            .inspect_err(|e| warn!(error = %e, "publish failed"))
    }

    async fn unpublish(&self, req: csi::NodeUnpublishVolumeRequest) -> Result<()> {
        check_node_unpublish_volume_request(&req)?;
        self.mounts
            .unpublish(Path::new(&req.target_path))
            .await
            .inspect_err(|e| warn!(error = %e, "unpublish failed"))
    }
}

#[tonic::async_trait]
impl csi::node_server::Node for NodeService {
    async fn node_stage_volume(
        &self,
        _request: Request<csi::NodeStageVolumeRequest>,
    ) -> std::result::Result<Response<csi::NodeStageVolumeResponse>, Status> {
        Err(Status::unimplemented("staging is not supported"))
    }

    async fn node_unstage_volume(
        &self,
        _request: Request<csi::NodeUnstageVolumeRequest>,
    ) -> std::result::Result<Response<csi::NodeUnstageVolumeResponse>, Status> {
        Err(Status::unimplemented("staging is not supported"))
    }

    async fn node_publish_volume(
        &self,
        request: Request<csi::NodePublishVolumeRequest>,
    ) -> std::result::Result<Response<csi::NodePublishVolumeResponse>, Status> {
        let req = request.into_inner();
        let span = info_span!(
            parent: &self.span,
            "node_publish_volume",
            volume_id = %req.volume_id,
            target_path = %req.target_path
        );

        self.publish(req).instrument(span).await?;
        Ok(Response::new(csi::NodePublishVolumeResponse {}))
    }

    async fn node_unpublish_volume(
        &self,
        request: Request<csi::NodeUnpublishVolumeRequest>,
    ) -> std::result::Result<Response<csi::NodeUnpublishVolumeResponse>, Status> {
        let req = request.into_inner();
        let span = info_span!(
            parent: &self.span,
            "node_unpublish_volume",
            volume_id = %req.volume_id,
            target_path = %req.target_path
        );

        self.unpublish(req).instrument(span).await?;
        Ok(Response::new(csi::NodeUnpublishVolumeResponse {}))
    }

    async fn node_get_volume_stats(
        &self,
        _request: Request<csi::NodeGetVolumeStatsRequest>,
    ) -> std::result::Result<Response<csi::NodeGetVolumeStatsResponse>, Status> {
        Err(Status::unimplemented("volume stats are not supported"))
    }

    async fn node_expand_volume(
        &self,
        _request: Request<csi::NodeExpandVolumeRequest>,
    ) -> std::result::Result<Response<csi::NodeExpandVolumeResponse>, Status> {
        Err(Status::unimplemented(
            "volumes grow on the storage server, no node expansion needed",
        ))
    }

    async fn node_get_capabilities(
        &self,
        _request: Request<csi::NodeGetCapabilitiesRequest>,
    ) -> std::result::Result<Response<csi::NodeGetCapabilitiesResponse>, Status> {
        Ok(Response::new(csi::NodeGetCapabilitiesResponse {
            capabilities: vec![],
        }))
    }

    async fn node_get_info(
        &self,
        _request: Request<csi::NodeGetInfoRequest>,
    ) -> std::result::Result<Response<csi::NodeGetInfoResponse>, Status> {
        Ok(Response::new(csi::NodeGetInfoResponse {
            node_id: self.node_id.clone(),
            ..Default::default()
        }))
    }
}
