//! CSI driver implementation.
//!
//! This module contains the core driver components:
//! - `Config`: Driver configuration
//! - `Driver`: Wires the engine and mounter into the gRPC services and runs them
//! - `Provisioner`: Volume lifecycle against the engine (in `provisioner` submodule)
//! - `MountManager`: Node-side mount handling (in `mount_manager` submodule)

pub mod mount_manager;
pub mod provisioner;

pub use mount_manager::MountManager;
pub use provisioner::{CreateOutcome, CreateParams, ProvisionedVolume, Provisioner};

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::controller::ControllerService;
use crate::engine::{Engine, EngineConfig, HttpEngine};
use crate::error::{Error, Result};
use crate::identity::IdentityService;
use crate::mounter::{Mounter, SystemMounter};
use crate::node::NodeService;
use crate::server::{Server, Services};
use crate::types::Components;

pub const DRIVER_NAME: &str = "csi.anx.io";
pub const DRIVER_VERSION: &str = env!("CARGO_PKG_VERSION");
/// Lower bound for engine polling while a create waits for completion.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Driver configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub name: String,
    pub version: String,
    pub node_id: String,
    pub endpoint: String,
    pub components: Components,
    pub engine: EngineConfig,
    /// Completion deadline for creates when the caller sends none.
    pub create_timeout: Duration,
    pub poll_interval: Duration,
    /// How long a cancelled server may take to drain before it is aborted.
    pub shutdown_grace: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: DRIVER_NAME.to_string(),
            version: DRIVER_VERSION.to_string(),
            node_id: hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "unknown".to_string()),
            endpoint: "unix:///tmp/csi.sock".to_string(),
            components: Components::all(),
            engine: EngineConfig::default(),
            create_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_secs(1),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

/// The CSI driver.
pub struct Driver {
    config: Config,
    engine: Option<Arc<dyn Engine>>,
    mounter: Arc<dyn Mounter>,
}

impl Driver {
    /// Build a driver talking to the real engine and the host mount table.
    ///
    /// The engine client is only created (and a token only required) when
    /// the controller component is enabled.
    pub fn new(config: Config) -> Result<Self> {
        let engine: Option<Arc<dyn Engine>> = if config.components.contains(Components::CONTROLLER)
        {
            if config.engine.token.is_empty() {
                return Err(Error::MissingEngineToken);
            }
            Some(Arc::new(HttpEngine::new(&config.engine)?))
        } else {
            None
        };

        Ok(Self::with_collaborators(
            config,
            engine,
            Arc::new(SystemMounter::new()),
        ))
    }

    /// Build a driver from explicit collaborators.
    ///
    /// A poll interval below [`MIN_POLL_INTERVAL`] is raised to it.
    pub fn with_collaborators(
        mut config: Config,
        engine: Option<Arc<dyn Engine>>,
        mounter: Arc<dyn Mounter>,
    ) -> Self {
        if config.poll_interval < MIN_POLL_INTERVAL {
            warn!(
                requested = ?config.poll_interval,
                minimum = ?MIN_POLL_INTERVAL,
                "poll interval too short, using minimum"
            );
            config.poll_interval = MIN_POLL_INTERVAL;
        }
        Self {
            config,
            engine,
            mounter,
        }
    }

    /// Services for the configured component set. Identity is always present.
    pub fn services(&self) -> Services {
        let config = &self.config;

        let controller = match (&self.engine, config.components.contains(Components::CONTROLLER)) {
            (Some(engine), true) => Some(ControllerService::new(
                Provisioner::new(Arc::clone(engine), config.poll_interval),
                config.create_timeout,
            )),
            _ => None,
        };

        let node = config.components.contains(Components::NODE).then(|| {
            NodeService::new(
                config.node_id.clone(),
                MountManager::new(Arc::clone(&self.mounter)),
            )
        });

        Services {
            identity: IdentityService::new(&config.name, &config.version, config.components),
            controller,
            node,
        }
    }

    /// Run the CSI driver until `shutdown` is cancelled or serving fails.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        info!(
            name = %self.config.name,
            version = %self.config.version,
            endpoint = %self.config.endpoint,
            components = %self.config.components,
            "starting CSI driver"
        );

        let server = Server::new(&self.config.endpoint, self.services())
            .await?
            .with_shutdown_grace(self.config.shutdown_grace);
        server.run(shutdown).await
    }
}
