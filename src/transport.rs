//! Transport abstraction (design note §9, "Signaling-library
//! coupling"): the narrow interface every namespace and session piece
//! of this crate is written against, so that none of the core logic
//! is coupled to a specific WebRTC wrapper. A real implementation
//! (backed by an actual signaling service and WebRTC data channels) is
//! an external collaborator; this crate ships only the trait and an
//! in-process [`LoopbackTransport`] test double used by the test
//! suite.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

#[derive(Debug, thiserror::Error, Clone)]
pub enum TransportError {
    #[error("endpoint id already claimed")]
    AddressTaken,
    #[error("endpoint unreachable")]
    AddressUnavailable,
    #[error("network is down")]
    NetworkDown,
    #[error("timed out waiting for transport")]
    TransportTimeout,
    #[error("signaling service rate-limited this request")]
    SignalingRateLimited,
}

/// A bidirectional byte-stream channel to a single remote endpoint.
#[async_trait::async_trait]
pub trait Channel: Send + Sync {
    async fn send(&self, bytes: Vec<u8>) -> Result<(), TransportError>;
    /// Returns `None` once the peer has closed the channel.
    async fn recv(&self) -> Option<Vec<u8>>;
    fn close(&self);
}

/// Creates signaling endpoints and opens channels to them. Every call
/// the overlay makes into the signaling service funnels through an
/// implementation of this trait (in practice, through the
/// [`crate::signaling`] gate in front of it).
#[async_trait::async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Attempt to claim `id` as an endpoint we own. Fails with
    /// `AddressTaken` if another peer already claimed it.
    async fn create_endpoint(&self, id: &str) -> Result<Arc<dyn EndpointHandle>, TransportError>;

    /// Open a reliable channel to whoever owns `id`.
    async fn connect(&self, id: &str) -> Result<Arc<dyn Channel>, TransportError>;
}

/// A claimed endpoint: other peers can `connect()` to its id and this
/// handle yields the resulting channels as they arrive.
#[async_trait::async_trait]
pub trait EndpointHandle: Send + Sync {
    async fn accept(&self) -> Option<Arc<dyn Channel>>;
    fn id(&self) -> &str;
    fn close(&self);
}

// ---------------------------------------------------------------------
// LoopbackTransport: in-process broker keyed by id string.
// ---------------------------------------------------------------------

struct LoopbackChannel {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
}

#[async_trait::async_trait]
impl Channel for LoopbackChannel {
    async fn send(&self, bytes: Vec<u8>) -> Result<(), TransportError> {
        self.tx.send(bytes).map_err(|_| TransportError::AddressUnavailable)
    }

    async fn recv(&self) -> Option<Vec<u8>> {
        self.rx.lock().await.recv().await
    }

    fn close(&self) {
        // Dropping the sender half would require interior mutability we
        // don't carry here; closing is modeled by the peer observing a
        // `None` from `recv` once both LoopbackTransport-side handles
        // are dropped. Explicit close is a no-op for the loopback double.
    }
}

struct LoopbackEndpoint {
    id: String,
    incoming: Mutex<mpsc::UnboundedReceiver<Arc<dyn Channel>>>,
    registry: Arc<Mutex<HashMap<String, mpsc::UnboundedSender<Arc<dyn Channel>>>>>,
}

#[async_trait::async_trait]
impl EndpointHandle for LoopbackEndpoint {
    async fn accept(&self) -> Option<Arc<dyn Channel>> {
        self.incoming.lock().await.recv().await
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn close(&self) {
        let registry = self.registry.clone();
        let id = self.id.clone();
        tokio::spawn(async move {
            registry.lock().await.remove(&id);
        });
    }
}

/// An in-process stand-in for a signaling service, used by tests.
/// `create_endpoint` claims a slot in a shared id->listener map;
/// `connect` looks the id up and wires a pair of channels together.
#[derive(Clone, Default)]
pub struct LoopbackTransport {
    listeners: Arc<Mutex<HashMap<String, mpsc::UnboundedSender<Arc<dyn Channel>>>>>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl SignalingTransport for LoopbackTransport {
    async fn create_endpoint(&self, id: &str) -> Result<Arc<dyn EndpointHandle>, TransportError> {
        let mut listeners = self.listeners.lock().await;
        if listeners.contains_key(id) {
            return Err(TransportError::AddressTaken);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        listeners.insert(id.to_string(), tx);
        Ok(Arc::new(LoopbackEndpoint {
            id: id.to_string(),
            incoming: Mutex::new(rx),
            registry: self.listeners.clone(),
        }))
    }

    async fn connect(&self, id: &str) -> Result<Arc<dyn Channel>, TransportError> {
        let listeners = self.listeners.lock().await;
        let listener = listeners.get(id).ok_or(TransportError::AddressUnavailable)?;

        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        let our_side: Arc<dyn Channel> = Arc::new(LoopbackChannel {
            tx: a_tx,
            rx: Mutex::new(a_rx),
        });
        let their_side: Arc<dyn Channel> = Arc::new(LoopbackChannel {
            tx: b_tx,
            rx: Mutex::new(b_rx),
        });
        listener
            .send(their_side)
            .map_err(|_| TransportError::AddressUnavailable)?;
        Ok(our_side)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connect_without_listener_fails() {
        let t = LoopbackTransport::new();
        assert!(matches!(
            t.connect("nobody-home").await,
            Err(TransportError::AddressUnavailable)
        ));
    }

    #[tokio::test]
    async fn create_endpoint_twice_conflicts() {
        let t = LoopbackTransport::new();
        let _ep = t.create_endpoint("room-1").await.unwrap();
        assert!(matches!(
            t.create_endpoint("room-1").await,
            Err(TransportError::AddressTaken)
        ));
    }

    #[tokio::test]
    async fn connect_and_exchange_bytes() {
        let t = LoopbackTransport::new();
        let ep = t.create_endpoint("room-1").await.unwrap();
        let client = t.connect("room-1").await.unwrap();
        client.send(b"hello".to_vec()).await.unwrap();

        let server_side = ep.accept().await.unwrap();
        let received = server_side.recv().await.unwrap();
        assert_eq!(received, b"hello");
    }
}
