//--------------------------------------------------------------------------------------------------
// MODULE OVERVIEW
//--------------------------------------------------------------------------------------------------
// The transport seam between a node and the peer discovery substrate.
//
// The synchronization service only ever talks to the `PeerTransport` trait: link
// lifecycle, periodic service announcement, inbound listening and a request/reply
// RPC with a per-call timeout. The production discovery network lives behind an
// implementation of this trait supplied by the embedding process; this module ships
// an in-process `MemoryTransport` so demos and integration tests can wire several
// complete nodes together without any network.
//--------------------------------------------------------------------------------------------------

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

/// Errors surfaced by a transport implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The link to the discovery substrate is not up.
    #[error("transport link is not connected")]
    NotConnected,
    /// No peer is currently serving the requested service name.
    #[error("no peer available for service {0}")]
    NoPeer(String),
    /// The peer did not reply within the per-call timeout.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    /// Any other transport-level failure.
    #[error("transport failure: {0}")]
    Other(String),
}

/// Server-side receiver for inbound peer requests.
#[async_trait]
pub trait InboundHandler: Send + Sync {
    /// Handles one inbound request payload and produces the reply payload.
    async fn handle(&self, payload: Value) -> Result<Value, TransportError>;
}

/// Contract of the peer discovery/RPC substrate consumed by the sync service.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Brings up the connection to the discovery substrate.
    async fn start_link(&self) -> Result<(), TransportError>;

    /// Tears down the connection; stops serving inbound requests.
    async fn stop_link(&self) -> Result<(), TransportError>;

    /// Advertises this node under `service_name` on `port`. Called repeatedly by
    /// the announce timer.
    async fn announce(&self, service_name: &str, port: u16) -> Result<(), TransportError>;

    /// Starts serving inbound requests on `port`, delivering each to `handler`.
    async fn listen(
        &self,
        port: u16,
        handler: Arc<dyn InboundHandler>,
    ) -> Result<(), TransportError>;

    /// Sends one request to a peer of `service_name` and awaits the reply, failing
    /// once `timeout` elapses.
    async fn request(
        &self,
        service_name: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value, TransportError>;
}

/// In-process rendezvous point shared by a set of [`MemoryTransport`] endpoints.
///
/// Maps a service name to the handler of the node currently listening under it,
/// mimicking a discovery network where the last announcer wins.
#[derive(Default)]
pub struct MemoryHub {
    services: RwLock<HashMap<String, Arc<dyn InboundHandler>>>,
}

impl MemoryHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Creates a transport endpoint that registers under `service_name` when it
    /// starts listening.
    pub fn endpoint(self: &Arc<Self>, service_name: impl Into<String>) -> MemoryTransport {
        MemoryTransport {
            hub: Arc::clone(self),
            service_name: service_name.into(),
            connected: AtomicBool::new(false),
        }
    }
}

/// Loopback transport backed by a [`MemoryHub`]; used by the demo binary and the
/// integration tests.
pub struct MemoryTransport {
    hub: Arc<MemoryHub>,
    service_name: String,
    connected: AtomicBool,
}

#[async_trait]
impl PeerTransport for MemoryTransport {
    async fn start_link(&self) -> Result<(), TransportError> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop_link(&self) -> Result<(), TransportError> {
        self.connected.store(false, Ordering::SeqCst);
        self.hub.services.write().remove(&self.service_name);
        Ok(())
    }

    async fn announce(&self, service_name: &str, port: u16) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        debug!(service = service_name, port, "announcing presence");
        Ok(())
    }

    async fn listen(
        &self,
        _port: u16,
        handler: Arc<dyn InboundHandler>,
    ) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        self.hub
            .services
            .write()
            .insert(self.service_name.clone(), handler);
        Ok(())
    }

    async fn request(
        &self,
        service_name: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value, TransportError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        let handler = self
            .hub
            .services
            .read()
            .get(service_name)
            .cloned()
            .ok_or_else(|| TransportError::NoPeer(service_name.to_string()))?;

        match tokio::time::timeout(timeout, handler.handle(payload)).await {
            Ok(reply) => reply,
            Err(_) => Err(TransportError::Timeout(timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoHandler;

    #[async_trait]
    impl InboundHandler for EchoHandler {
        async fn handle(&self, payload: Value) -> Result<Value, TransportError> {
            Ok(json!({"echo": payload}))
        }
    }

    #[tokio::test]
    async fn test_request_reaches_listener() {
        let hub = MemoryHub::new();
        let server = hub.endpoint("book_service");
        let client = hub.endpoint("book_service");

        match server.start_link().await {
            Ok(()) => {}
            Err(e) => panic!("start_link failed: {:?}", e),
        }
        match server.listen(1337, Arc::new(EchoHandler)).await {
            Ok(()) => {}
            Err(e) => panic!("listen failed: {:?}", e),
        }
        match client.start_link().await {
            Ok(()) => {}
            Err(e) => panic!("start_link failed: {:?}", e),
        }

        let reply = client
            .request("book_service", json!({"ping": 1}), Duration::from_secs(1))
            .await;
        assert_eq!(reply, Ok(json!({"echo": {"ping": 1}})));
    }

    #[tokio::test]
    async fn test_request_without_listener_fails() {
        let hub = MemoryHub::new();
        let client = hub.endpoint("book_service");
        match client.start_link().await {
            Ok(()) => {}
            Err(e) => panic!("start_link failed: {:?}", e),
        }

        let reply = client
            .request("book_service", json!({}), Duration::from_secs(1))
            .await;
        assert_eq!(reply, Err(TransportError::NoPeer("book_service".to_string())));
    }

    #[tokio::test]
    async fn test_stopped_link_rejects_calls() {
        let hub = MemoryHub::new();
        let node = hub.endpoint("book_service");
        assert_eq!(
            node.request("book_service", json!({}), Duration::from_secs(1))
                .await,
            Err(TransportError::NotConnected)
        );

        match node.start_link().await {
            Ok(()) => {}
            Err(e) => panic!("start_link failed: {:?}", e),
        }
        match node.listen(1337, Arc::new(EchoHandler)).await {
            Ok(()) => {}
            Err(e) => panic!("listen failed: {:?}", e),
        }
        match node.stop_link().await {
            Ok(()) => {}
            Err(e) => panic!("stop_link failed: {:?}", e),
        }

        // Stopping removed the service registration.
        let other = hub.endpoint("book_service");
        match other.start_link().await {
            Ok(()) => {}
            Err(e) => panic!("start_link failed: {:?}", e),
        }
        assert_eq!(
            other
                .request("book_service", json!({}), Duration::from_secs(1))
                .await,
            Err(TransportError::NoPeer("book_service".to_string()))
        );
    }
}
