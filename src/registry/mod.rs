//! Service registration and discovery.
//!
//! The layout mirrors a ZooKeeper tree: a persistent root, one persistent
//! path per service key, and ephemeral-sequential `address-` children whose
//! data is the literal `host:port`. An address node lives exactly as long
//! as the session that created it, so a dead server unpublishes itself by
//! dying.

use crate::error::RpcError;
use log::*;
use rand::Rng;
use std::fmt;
use std::future::Future;

mod memory;
pub use memory::{MemoryNamingService, MemorySession};

pub const REGISTRY_ROOT: &str = "/rpc";
pub const ADDRESS_NODE_PREFIX: &str = "address-";

#[inline]
pub fn service_path(service_key: &str) -> String {
    format!("{}/{}", REGISTRY_ROOT, service_key)
}

#[derive(Clone, Debug, PartialEq)]
pub enum NamingError {
    /// create_persistent on a path that already exists.
    NodeExists(String),
    /// Operation on a path that does not exist.
    NoNode(String),
    /// The naming backend itself failed.
    Backend(String),
}

impl fmt::Display for NamingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NodeExists(p) => write!(f, "node exists: {}", p),
            Self::NoNode(p) => write!(f, "no node: {}", p),
            Self::Backend(s) => write!(f, "naming backend: {}", s),
        }
    }
}

impl std::error::Error for NamingError {}

/// Connection factory for a coordination service.
///
/// Implementations are cheap handles (`Clone`); each [`connect`](Self::connect)
/// opens an independent session. [`MemoryNamingService`] is the in-process
/// implementation; a networked one plugs in at the same seam.
pub trait NamingService: Clone + Send + Sync + 'static {
    type Session: NamingSession;

    fn connect(&self) -> impl Future<Output = Result<Self::Session, NamingError>> + Send;
}

/// One session against the coordination service. Ephemeral nodes created
/// through a session are removed when the session drops.
pub trait NamingSession: Send + Sync + 'static {
    fn exists(&self, path: &str) -> impl Future<Output = Result<bool, NamingError>> + Send;

    fn create_persistent(&self, path: &str)
    -> impl Future<Output = Result<(), NamingError>> + Send;

    /// Creates `path_prefix` + a zero-padded per-parent sequence number,
    /// owned by this session. Returns the full node path.
    fn create_ephemeral_sequential(
        &self, path_prefix: &str, data: &str,
    ) -> impl Future<Output = Result<String, NamingError>> + Send;

    /// Child node names (not full paths) under `path`.
    fn children(&self, path: &str) -> impl Future<Output = Result<Vec<String>, NamingError>> + Send;

    fn read_data(&self, path: &str) -> impl Future<Output = Result<String, NamingError>> + Send;
}

async fn ensure_path<S: NamingSession>(session: &S, path: &str) -> Result<(), NamingError> {
    if session.exists(path).await? {
        return Ok(());
    }
    match session.create_persistent(path).await {
        Ok(_) => Ok(()),
        // a racing registrar created it first, which is just as good
        Err(NamingError::NodeExists(_)) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Server-side publisher. Holds one long-lived session; every address node
/// registered through it disappears when the registry is dropped.
pub struct ServiceRegistry<N: NamingService> {
    session: N::Session,
}

impl<N: NamingService> ServiceRegistry<N> {
    pub async fn connect(naming: &N) -> Result<Self, NamingError> {
        let session = naming.connect().await?;
        Ok(Self { session })
    }

    /// Publishes `address` under `service_key`, returning the node path.
    pub async fn register(&self, service_key: &str, address: &str) -> Result<String, NamingError> {
        ensure_path(&self.session, REGISTRY_ROOT).await?;
        let service_path = service_path(service_key);
        ensure_path(&self.session, &service_path).await?;
        let prefix = format!("{}/{}", service_path, ADDRESS_NODE_PREFIX);
        let node = self.session.create_ephemeral_sequential(&prefix, address).await?;
        info!("registered {} -> {} as {}", service_key, address, node);
        Ok(node)
    }
}

/// Client-side resolver. Opens a short-lived session per lookup and picks
/// one address uniformly at random.
pub struct ServiceDiscovery<N: NamingService> {
    naming: N,
}

impl<N: NamingService> Clone for ServiceDiscovery<N> {
    fn clone(&self) -> Self {
        Self { naming: self.naming.clone() }
    }
}

impl<N: NamingService> ServiceDiscovery<N> {
    pub fn new(naming: N) -> Self {
        Self { naming }
    }

    pub async fn discover(&self, service_key: &str) -> Result<String, RpcError> {
        let session = self
            .naming
            .connect()
            .await
            .map_err(|e| unavailable(service_key, &e))?;
        let service_path = service_path(service_key);
        let children = match session.children(&service_path).await {
            Ok(c) => c,
            // an unregistered service looks the same as one with no servers
            Err(NamingError::NoNode(_)) => Vec::new(),
            Err(e) => return Err(unavailable(service_key, &e)),
        };
        if children.is_empty() {
            return Err(RpcError::ServiceUnavailable(service_key.to_string()));
        }
        let picked = if children.len() == 1 {
            &children[0]
        } else {
            let mut rng = rand::thread_rng();
            &children[rng.gen_range(0..children.len())]
        };
        let node_path = format!("{}/{}", service_path, picked);
        let address = match session.read_data(&node_path).await {
            Ok(d) => d,
            // the node vanished between listing and reading
            Err(e) => return Err(unavailable(service_key, &e)),
        };
        debug!("discovered {} -> {}", service_key, address);
        Ok(address)
    }
}

fn unavailable(service_key: &str, e: &NamingError) -> RpcError {
    RpcError::ServiceUnavailable(format!("{}: {}", service_key, e))
}
