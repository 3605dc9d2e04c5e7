//! gRPC server lifecycle: bind the endpoint, serve, and stop on cancellation.

use std::io;
use std::path::Path;
use std::time::Duration;

use tokio::net::{TcpListener, UnixListener};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{TcpListenerStream, UnixListenerStream};
use tokio_util::sync::CancellationToken;
use tonic::transport::Server as TonicServer;
use tracing::{Instrument, Span, info, info_span, warn};

use crate::controller::ControllerService;
use crate::csi::{
    FILE_DESCRIPTOR_SET, controller_server::ControllerServer, identity_server::IdentityServer,
    node_server::NodeServer,
};
use crate::error::{Error, Result};
use crate::identity::IdentityService;
use crate::node::NodeService;
use crate::types::Endpoint;

const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// The services a server registers. Identity is mandatory; the others are
/// registered only when present.
pub struct Services {
    pub identity: IdentityService,
    pub controller: Option<ControllerService>,
    pub node: Option<NodeService>,
}

enum Listener {
    Unix(UnixListener),
    Tcp(TcpListener),
}

pub struct Server {
    listener: Listener,
    services: Services,
    shutdown_grace: Duration,
    span: Span,
}

/// Remove a socket file left behind by a previous run.
fn remove_stale_socket(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

impl Server {
    /// Parse `endpoint` and bind a listener on it.
    pub async fn new(endpoint: &str, services: Services) -> Result<Self> {
        let endpoint = Endpoint::parse(endpoint)?;
        let span = info_span!("server", component = "server", endpoint = %endpoint);

        let listener = match &endpoint {
            Endpoint::Unix(path) => {
                let path = Path::new(path);
                remove_stale_socket(path)?;
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                Listener::Unix(UnixListener::bind(path)?)
            }
            Endpoint::Tcp(addr) => Listener::Tcp(TcpListener::bind(addr.as_str()).await?),
        };

        span.in_scope(|| info!("listening"));
        Ok(Self {
            listener,
            services,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            span,
        })
    }

    pub fn with_shutdown_grace(mut self, shutdown_grace: Duration) -> Self {
        self.shutdown_grace = shutdown_grace;
        self
    }

    /// Address of a TCP listener, for callers that bound port 0.
    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        match &self.listener {
            Listener::Tcp(listener) => listener.local_addr().ok(),
            Listener::Unix(_) => None,
        }
    }

    /// Serve until the listener fails or `cancel` fires.
    ///
    /// If serving ends on its own first, its result is returned. On
    /// cancellation the server is stopped gracefully (aborted after the
    /// shutdown grace period) and [`Error::Cancelled`] is returned.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let span = self.span.clone();
        self.run_inner(cancel).instrument(span).await
    }

    async fn run_inner(self, cancel: CancellationToken) -> Result<()> {
        let reflection = tonic_reflection::server::Builder::configure()
            .register_encoded_file_descriptor_set(FILE_DESCRIPTOR_SET)
            .build_v1()
            .map_err(|e| io::Error::other(e.to_string()))?;

        let Services {
            identity,
            controller,
            node,
        } = self.services;

        let router = TonicServer::builder()
            .add_service(reflection)
            .add_service(IdentityServer::new(identity))
            .add_optional_service(controller.map(ControllerServer::new))
            .add_optional_service(node.map(NodeServer::new));

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let stopped = async move {
            let _ = stop_rx.await;
        };

        let mut serve: JoinHandle<std::result::Result<(), tonic::transport::Error>> =
            match self.listener {
                Listener::Unix(listener) => tokio::spawn(
                    router.serve_with_incoming_shutdown(UnixListenerStream::new(listener), stopped),
                ),
                Listener::Tcp(listener) => tokio::spawn(
                    router.serve_with_incoming_shutdown(TcpListenerStream::new(listener), stopped),
                ),
            };

        tokio::select! {
            result = &mut serve => return join_result(result),
            _ = cancel.cancelled() => {}
        }

        info!("cancellation requested, stopping server");
        // The sender is consumed, so the stop signal fires at most once.
        let _ = stop_tx.send(());

        match tokio::time::timeout(self.shutdown_grace, &mut serve).await {
            Ok(result) => {
                if let Err(e) = join_result(result) {
                    warn!(error = %e, "server failed while stopping");
                }
            }
            Err(_) => {
                warn!(grace = ?self.shutdown_grace, "graceful stop timed out, aborting");
                serve.abort();
            }
        }

        Err(Error::Cancelled)
    }
}

fn join_result(
    result: std::result::Result<
        std::result::Result<(), tonic::transport::Error>,
        tokio::task::JoinError,
    >,
) -> Result<()> {
    match result {
        Ok(served) => Ok(served?),
        Err(e) => Err(io::Error::other(format!("server task failed: {e}")).into()),
    }
}
