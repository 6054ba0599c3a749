//! The narrow transport interface the core is written against: an
//! address type, a connection enum, and a registry used for outbound
//! lookup. Real sockets (UDP, TCP) and the in-memory channel transport
//! used by tests all satisfy the same contract.

use crate::{Error, Result};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub mod channel;
pub mod connection;
pub mod stream;
pub mod tcp;
pub mod udp;

pub use connection::{SipConnection, TransportEvent, TransportReceiver, TransportSender};

/// Transport protocol of a connection or destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TransportKind {
    #[default]
    Udp,
    Tcp,
}

impl TransportKind {
    pub fn is_reliable(&self) -> bool {
        matches!(self, TransportKind::Tcp)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Udp => "UDP",
            TransportKind::Tcp => "TCP",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A resolved transport address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SipAddr {
    pub kind: TransportKind,
    pub addr: SocketAddr,
}

impl SipAddr {
    pub fn udp(addr: SocketAddr) -> Self {
        SipAddr {
            kind: TransportKind::Udp,
            addr,
        }
    }

    pub fn tcp(addr: SocketAddr) -> Self {
        SipAddr {
            kind: TransportKind::Tcp,
            addr,
        }
    }
}

impl fmt::Display for SipAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.addr)
    }
}

struct TransportLayerInner {
    connections: RwLock<HashMap<SipAddr, SipConnection>>,
    /// Address of the first registered connection, used as the default
    /// outbound path and as the Via sent-by address.
    default_addr: RwLock<Option<SipAddr>>,
    cancel_token: CancellationToken,
}

/// Registry of live connections. Connections are added by the owner
/// before the endpoint starts serving; outbound sends look up a
/// connection by destination transport, falling back to the default.
#[derive(Clone)]
pub struct TransportLayer {
    inner: Arc<TransportLayerInner>,
}

impl TransportLayer {
    pub fn new(cancel_token: CancellationToken) -> Self {
        TransportLayer {
            inner: Arc::new(TransportLayerInner {
                connections: RwLock::new(HashMap::new()),
                default_addr: RwLock::new(None),
                cancel_token,
            }),
        }
    }

    pub fn add_connection(&self, connection: SipConnection) {
        let addr = connection.get_addr().clone();
        info!("transport added: {}", addr);
        self.inner
            .connections
            .write()
            .unwrap()
            .insert(addr.clone(), connection);
        let mut default_addr = self.inner.default_addr.write().unwrap();
        if default_addr.is_none() {
            default_addr.replace(addr);
        }
    }

    pub fn del_connection(&self, addr: &SipAddr) {
        self.inner.connections.write().unwrap().remove(addr);
        let mut default_addr = self.inner.default_addr.write().unwrap();
        if default_addr.as_ref() == Some(addr) {
            default_addr.take();
        }
    }

    /// Local address used for Via and Contact construction.
    pub fn default_addr(&self) -> Option<SipAddr> {
        self.inner.default_addr.read().unwrap().clone()
    }

    /// Finds a connection able to reach `target`: an exact peer match
    /// first (connected streams), then any connection of the same
    /// transport kind.
    pub fn lookup(&self, target: &SipAddr) -> Result<SipConnection> {
        let connections = self.inner.connections.read().unwrap();
        if let Some(connection) = connections.get(target) {
            return Ok(connection.clone());
        }
        connections
            .values()
            .find(|c| c.get_addr().kind == target.kind)
            .cloned()
            .ok_or_else(|| {
                Error::TransportLayerError("no connection for target".to_string(), target.clone())
            })
    }

    /// Spawns the serve loop of every registered connection.
    pub fn serve_connections(&self, sender: TransportSender) {
        let connections: Vec<SipConnection> = self
            .inner
            .connections
            .read()
            .unwrap()
            .values()
            .cloned()
            .collect();
        for connection in connections {
            let sender = sender.clone();
            let token = self.inner.cancel_token.child_token();
            tokio::spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => {}
                    result = connection.serve_loop(sender) => {
                        if let Err(e) = result {
                            debug!("transport serve loop ended: {:?}", e);
                        }
                    }
                }
            });
        }
    }

    pub fn len(&self) -> usize {
        self.inner.connections.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
