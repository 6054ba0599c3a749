use super::connection::{KEEPALIVE_REQUEST, KEEPALIVE_RESPONSE, TransportEvent, TransportSender};
use super::stream::MAX_SIP_MESSAGE_SIZE;
use super::SipAddr;
use crate::message::SipMessage;
use crate::{Error, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

struct UdpInner {
    addr: SipAddr,
    socket: UdpSocket,
}

/// Datagram transport: one SIP message per datagram.
#[derive(Clone)]
pub struct UdpConnection {
    inner: Arc<UdpInner>,
}

impl UdpConnection {
    pub async fn create_connection(local: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(local).await?;
        let addr = SipAddr::udp(socket.local_addr()?);
        info!("UDP transport bound: {}", addr);
        Ok(UdpConnection {
            inner: Arc::new(UdpInner { addr, socket }),
        })
    }

    pub fn get_addr(&self) -> &SipAddr {
        &self.inner.addr
    }

    pub async fn send(&self, msg: SipMessage, destination: Option<&SipAddr>) -> Result<()> {
        let destination = destination.ok_or_else(|| {
            Error::TransportLayerError(
                "datagram send requires a destination".to_string(),
                self.inner.addr.clone(),
            )
        })?;
        let data = msg.to_bytes();
        self.inner
            .socket
            .send_to(&data, destination.addr)
            .await
            .map_err(|e| Error::TransportLayerError(e.to_string(), destination.clone()))?;
        Ok(())
    }

    pub async fn serve_loop(&self, sender: TransportSender) -> Result<()> {
        let mut buf = vec![0u8; MAX_SIP_MESSAGE_SIZE];
        loop {
            let (len, from) = self.inner.socket.recv_from(&mut buf).await?;
            let data = &buf[..len];
            if data == KEEPALIVE_REQUEST {
                self.inner.socket.send_to(KEEPALIVE_RESPONSE, from).await.ok();
                continue;
            }
            if data == KEEPALIVE_RESPONSE {
                continue;
            }
            match SipMessage::try_from(data) {
                Ok(msg) => {
                    debug!("received {} bytes from {}", len, from);
                    sender.send(TransportEvent::Incoming(
                        msg,
                        self.clone().into(),
                        SipAddr::udp(from),
                    ))?;
                }
                Err(e) => {
                    warn!("dropping unparseable datagram from {}: {:?}", from, e);
                }
            }
        }
    }
}
