//! CSI Identity service implementation.

use tonic::{Request, Response, Status};
use tracing::{Span, debug, info_span};

use crate::csi;
use crate::types::Components;

pub struct IdentityService {
    name: String,
    version: String,
    components: Components,
    span: Span,
}

impl IdentityService {
    pub fn new(name: impl Into<String>, version: impl Into<String>, components: Components) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            components,
            span: info_span!("identity", component = "identity"),
        }
    }

    fn capabilities(&self) -> Vec<csi::PluginCapability> {
        use csi::plugin_capability::{Service, Type, VolumeExpansion, service, volume_expansion};

        if !self.components.contains(Components::CONTROLLER) {
            return vec![];
        }

        vec![
            csi::PluginCapability {
                r#type: Some(Type::Service(Service {
                    r#type: service::Type::ControllerService as i32,
                })),
            },
            csi::PluginCapability {
                r#type: Some(Type::VolumeExpansion(VolumeExpansion {
                    r#type: volume_expansion::Type::Online as i32,
                })),
            },
        ]
    }
}

#[tonic::async_trait]
impl csi::identity_server::Identity for IdentityService {
    async fn get_plugin_info(
        &self,
        _request: Request<csi::GetPluginInfoRequest>,
    ) -> Result<Response<csi::GetPluginInfoResponse>, Status> {
        Ok(Response::new(csi::GetPluginInfoResponse {
            name: self.name.clone(),
            vendor_version: self.version.clone(),
            manifest: Default::default(),
        }))
    }

    async fn get_plugin_capabilities(
        &self,
        _request: Request<csi::GetPluginCapabilitiesRequest>,
    ) -> Result<Response<csi::GetPluginCapabilitiesResponse>, Status> {
        Ok(Response::new(csi::GetPluginCapabilitiesResponse {
            capabilities: self.capabilities(),
        }))
    }

    async fn probe(
        &self,
        _request: Request<csi::ProbeRequest>,
    ) -> Result<Response<csi::ProbeResponse>, Status> {
        self.span.in_scope(|| debug!("probe"));
        Ok(Response::new(csi::ProbeResponse { ready: Some(true) }))
    }
}
