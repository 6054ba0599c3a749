use super::connection::{TransportEvent, TransportSender};
use super::SipAddr;
use crate::message::SipMessage;
use crate::{Error, Result};
use std::sync::Arc;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;
use tracing::debug;

struct ChannelInner {
    addr: SipAddr,
    reliable: bool,
    out_tx: UnboundedSender<(SipMessage, SipAddr)>,
    in_rx: Mutex<Option<UnboundedReceiver<(SipMessage, SipAddr)>>>,
}

/// In-memory transport used by tests and loopback setups. Outbound
/// messages appear on the peer's receiver together with their
/// destination; inbound messages are injected through the peer's sender
/// and delivered to the endpoint like any network traffic.
#[derive(Clone)]
pub struct ChannelConnection {
    inner: Arc<ChannelInner>,
}

/// The test side of a [`ChannelConnection`].
pub struct ChannelPeer {
    /// Messages the stack sent, with the destination it chose.
    pub outbound: UnboundedReceiver<(SipMessage, SipAddr)>,
    /// Inject a message as if it arrived from the given source address.
    pub inbound: UnboundedSender<(SipMessage, SipAddr)>,
}

impl ChannelConnection {
    pub fn create_connection(addr: SipAddr, reliable: bool) -> (Self, ChannelPeer) {
        let (out_tx, out_rx) = unbounded_channel();
        let (in_tx, in_rx) = unbounded_channel();
        let connection = ChannelConnection {
            inner: Arc::new(ChannelInner {
                addr,
                reliable,
                out_tx,
                in_rx: Mutex::new(Some(in_rx)),
            }),
        };
        let peer = ChannelPeer {
            outbound: out_rx,
            inbound: in_tx,
        };
        (connection, peer)
    }

    pub fn get_addr(&self) -> &SipAddr {
        &self.inner.addr
    }

    pub fn is_reliable(&self) -> bool {
        self.inner.reliable
    }

    pub async fn send(&self, msg: SipMessage, destination: Option<&SipAddr>) -> Result<()> {
        let destination = destination.cloned().unwrap_or_else(|| self.inner.addr.clone());
        self.inner
            .out_tx
            .send((msg, destination))
            .map_err(|_| {
                Error::TransportLayerError("channel peer gone".to_string(), self.inner.addr.clone())
            })
    }

    pub async fn serve_loop(&self, sender: TransportSender) -> Result<()> {
        let mut in_rx = match self.inner.in_rx.lock().await.take() {
            Some(rx) => rx,
            None => {
                debug!("channel connection already serving: {}", self.inner.addr);
                return Ok(());
            }
        };
        while let Some((msg, from)) = in_rx.recv().await {
            sender.send(TransportEvent::Incoming(msg, self.clone().into(), from))?;
        }
        Ok(())
    }
}
