use super::stream::{StreamConnection, StreamConnectionInner};
use super::{SipAddr, TransportSender};
use crate::message::SipMessage;
use crate::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{
    tcp::{OwnedReadHalf, OwnedWriteHalf},
    TcpStream,
};
use tracing::info;

/// A connected TCP transport.
#[derive(Clone)]
pub struct TcpConnection {
    inner: Arc<StreamConnectionInner<OwnedReadHalf, OwnedWriteHalf>>,
}

impl TcpConnection {
    pub async fn connect(remote: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(remote).await?;
        Self::from_stream(stream)
    }

    /// Wraps an accepted or connected stream.
    pub fn from_stream(stream: TcpStream) -> Result<Self> {
        let local_addr = SipAddr::tcp(stream.local_addr()?);
        let remote_addr = SipAddr::tcp(stream.peer_addr()?);
        info!("TCP transport connected: {} -> {}", local_addr, remote_addr);
        let (read_half, write_half) = stream.into_split();
        Ok(TcpConnection {
            inner: Arc::new(StreamConnectionInner::new(
                local_addr, remote_addr, read_half, write_half,
            )),
        })
    }

    pub fn remote_addr(&self) -> &SipAddr {
        &self.inner.remote_addr
    }
}

#[async_trait::async_trait]
impl StreamConnection for TcpConnection {
    fn get_addr(&self) -> &SipAddr {
        &self.inner.local_addr
    }

    async fn send_message(&self, msg: SipMessage) -> Result<()> {
        self.inner.send_message(msg).await
    }

    async fn send_raw(&self, data: &[u8]) -> Result<()> {
        self.inner.send_raw(data).await
    }

    async fn serve_loop(&self, sender: TransportSender) -> Result<()> {
        self.inner.serve_loop(sender, self.clone().into()).await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}
