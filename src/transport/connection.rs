use super::channel::ChannelConnection;
use super::stream::StreamConnection;
use super::tcp::TcpConnection;
use super::udp::UdpConnection;
use super::SipAddr;
use crate::message::SipMessage;
use crate::Result;
use std::fmt;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

/// Double CRLF keep-alive probe (RFC 5626 section 3.5.1).
pub const KEEPALIVE_REQUEST: &[u8] = b"\r\n\r\n";
/// Single CRLF keep-alive reply.
pub const KEEPALIVE_RESPONSE: &[u8] = b"\r\n";

/// Events delivered from the transports into the endpoint serve loop.
pub enum TransportEvent {
    Incoming(SipMessage, SipConnection, SipAddr),
    New(SipConnection),
    Closed(SipAddr),
}

pub type TransportSender = UnboundedSender<TransportEvent>;
pub type TransportReceiver = UnboundedReceiver<TransportEvent>;

/// A live transport connection.
#[derive(Clone)]
pub enum SipConnection {
    Udp(UdpConnection),
    Tcp(TcpConnection),
    Channel(ChannelConnection),
}

impl SipConnection {
    /// Reliable transports get their wait timers zeroed (Timers D/I/J/K).
    pub fn is_reliable(&self) -> bool {
        match self {
            SipConnection::Udp(_) => false,
            SipConnection::Tcp(_) => true,
            SipConnection::Channel(c) => c.is_reliable(),
        }
    }

    pub fn get_addr(&self) -> &SipAddr {
        match self {
            SipConnection::Udp(c) => c.get_addr(),
            SipConnection::Tcp(c) => c.get_addr(),
            SipConnection::Channel(c) => c.get_addr(),
        }
    }

    pub async fn send(&self, msg: SipMessage, destination: Option<&SipAddr>) -> Result<()> {
        match self {
            SipConnection::Udp(c) => c.send(msg, destination).await,
            SipConnection::Tcp(c) => c.send_message(msg).await,
            SipConnection::Channel(c) => c.send(msg, destination).await,
        }
    }

    pub async fn serve_loop(&self, sender: TransportSender) -> Result<()> {
        match self {
            SipConnection::Udp(c) => c.serve_loop(sender).await,
            SipConnection::Tcp(c) => c.serve_loop(sender).await,
            SipConnection::Channel(c) => c.serve_loop(sender).await,
        }
    }
}

impl From<UdpConnection> for SipConnection {
    fn from(c: UdpConnection) -> Self {
        SipConnection::Udp(c)
    }
}

impl From<TcpConnection> for SipConnection {
    fn from(c: TcpConnection) -> Self {
        SipConnection::Tcp(c)
    }
}

impl From<ChannelConnection> for SipConnection {
    fn from(c: ChannelConnection) -> Self {
        SipConnection::Channel(c)
    }
}

impl fmt::Display for SipConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.get_addr())
    }
}

impl fmt::Debug for SipConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SipConnection({})", self.get_addr())
    }
}
