//! Type-safe wrappers for CSI driver domain types.

use std::fmt;
use std::str::FromStr;

use bitflags::bitflags;

use crate::error::Error;

bitflags! {
    /// Driver components enabled in this process.
    ///
    /// The Identity service is always served; these flags select which of
    /// the Controller and Node services are registered next to it.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Components: u8 {
        /// Manage volumes in the engine.
        const CONTROLLER = 0b01;
        /// Make volumes available on the node this process runs on.
        const NODE = 0b10;
    }
}

impl FromStr for Components {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "controller" => Ok(Self::CONTROLLER),
            "node" => Ok(Self::NODE),
            "combined" => Ok(Self::CONTROLLER | Self::NODE),
            other => Err(Error::InvalidComponents {
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for Components {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = if *self == Self::all() {
            "combined"
        } else if *self == Self::CONTROLLER {
            "controller"
        } else if *self == Self::NODE {
            "node"
        } else {
            ""
        };
        f.write_str(name)
    }
}

/// A parsed listen endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// Filesystem socket path.
    Unix(String),
    /// `host:port` address.
    Tcp(String),
}

impl Endpoint {
    /// Parse an endpoint URI of the form `unix://<path>` or `tcp://<host:port>`.
    ///
    /// The scheme is matched case-insensitively; the address must be non-empty.
    pub fn parse(endpoint: &str) -> Result<Self, Error> {
        let invalid = || Error::InvalidEndpoint {
            endpoint: endpoint.to_string(),
        };

        let (scheme, address) = endpoint.split_once("://").ok_or_else(invalid)?;
        if address.is_empty() {
            return Err(invalid());
        }

        match scheme.to_ascii_lowercase().as_str() {
            "unix" => Ok(Self::Unix(address.to_string())),
            "tcp" => Ok(Self::Tcp(address.to_string())),
            _ => Err(invalid()),
        }
    }

    pub fn scheme(&self) -> &'static str {
        match self {
            Self::Unix(_) => "unix",
            Self::Tcp(_) => "tcp",
        }
    }

    pub fn address(&self) -> &str {
        match self {
            Self::Unix(path) => path,
            Self::Tcp(addr) => addr,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme(), self.address())
    }
}

/// The NFS mount source handed from the controller to the node, in the form
/// `"<network-name>:<path>"`.
///
/// The node side treats it as opaque and passes it to `mount` unmodified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountUrl(String);

impl MountUrl {
    pub fn new(network_name: &str, path: &str) -> Self {
        Self(format!("{network_name}:{path}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for MountUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
