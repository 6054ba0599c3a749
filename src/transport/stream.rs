use crate::{
    message::SipMessage,
    transport::{
        connection::{TransportSender, KEEPALIVE_REQUEST, KEEPALIVE_RESPONSE},
        SipAddr, SipConnection, TransportEvent,
    },
    Error, Result,
};
use bytes::{Buf, BytesMut};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    sync::Mutex,
};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, error, info};

pub(crate) const MAX_SIP_MESSAGE_SIZE: usize = 65535;

/// Frames SIP messages on a byte stream. The frame boundary is the blank
/// line terminating the header section plus `Content-Length` body bytes;
/// a message without `Content-Length` is framed as header-only, since a
/// stream offers no other way to find the body end.
pub struct SipCodec {}

impl SipCodec {
    pub fn new() -> Self {
        Self {}
    }
}

impl Default for SipCodec {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub enum SipCodecType {
    Message(SipMessage),
    KeepaliveRequest,
    KeepaliveResponse,
}

impl std::fmt::Display for SipCodecType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SipCodecType::Message(msg) => write!(f, "{}", msg),
            SipCodecType::KeepaliveRequest => write!(f, "Keepalive Request"),
            SipCodecType::KeepaliveResponse => write!(f, "Keepalive Response"),
        }
    }
}

fn header_section_end(src: &[u8]) -> Option<usize> {
    src.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|pos| pos + 4)
}

fn content_length(head: &[u8]) -> usize {
    let Ok(head) = std::str::from_utf8(head) else {
        return 0;
    };
    for line in head.split("\r\n") {
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("Content-Length") {
                return value.trim().parse().unwrap_or(0);
            }
        }
    }
    0
}

impl Decoder for SipCodec {
    type Item = SipCodecType;
    type Error = crate::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if src.len() >= 4 && &src[0..4] == KEEPALIVE_REQUEST {
            src.advance(4);
            return Ok(Some(SipCodecType::KeepaliveRequest));
        }

        if src.len() >= 2 && &src[0..2] == KEEPALIVE_RESPONSE && !src.starts_with(b"\r\n\r") {
            src.advance(2);
            return Ok(Some(SipCodecType::KeepaliveResponse));
        }

        let Some(head_end) = header_section_end(src) else {
            if src.len() > MAX_SIP_MESSAGE_SIZE {
                return Err(Error::SipMessageError("SIP message too large".to_string()));
            }
            return Ok(None);
        };

        let body_len = content_length(&src[..head_end]);
        let total = head_end + body_len;
        if total > MAX_SIP_MESSAGE_SIZE {
            return Err(Error::SipMessageError("SIP message too large".to_string()));
        }
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let frame = src.split_to(total);
        match SipMessage::try_from(&frame[..]) {
            Ok(msg) => Ok(Some(SipCodecType::Message(msg))),
            Err(e) => Err(Error::SipMessageError(format!(
                "failed to parse SIP message: {e}"
            ))),
        }
    }
}

impl Encoder<SipMessage> for SipCodec {
    type Error = crate::Error;

    fn encode(&mut self, item: SipMessage, dst: &mut BytesMut) -> Result<()> {
        dst.extend_from_slice(&item.to_bytes());
        Ok(())
    }
}

/// Shared read/write machinery for stream transports, generic over the
/// split halves.
pub struct StreamConnectionInner<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub local_addr: SipAddr,
    pub remote_addr: SipAddr,
    pub read_half: Mutex<Option<R>>,
    pub write_half: Mutex<W>,
}

impl<R, W> StreamConnectionInner<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(local_addr: SipAddr, remote_addr: SipAddr, read_half: R, write_half: W) -> Self {
        Self {
            local_addr,
            remote_addr,
            read_half: Mutex::new(Some(read_half)),
            write_half: Mutex::new(write_half),
        }
    }

    pub async fn send_message(&self, msg: SipMessage) -> Result<()> {
        send_to_stream(&self.write_half, msg).await
    }

    pub async fn send_raw(&self, data: &[u8]) -> Result<()> {
        send_raw_to_stream(&self.write_half, data).await
    }

    pub async fn serve_loop(
        &self,
        sender: TransportSender,
        connection: SipConnection,
    ) -> Result<()> {
        let mut read_half = match self.read_half.lock().await.take() {
            Some(read_half) => read_half,
            None => {
                error!("connection already serving: {}", self.local_addr);
                return Ok(());
            }
        };

        let remote_addr = self.remote_addr.clone();
        let mut codec = SipCodec::new();
        let mut buffer = BytesMut::with_capacity(4096);
        let mut read_buf = [0u8; 4096];

        loop {
            use tokio::io::AsyncReadExt;
            match read_half.read(&mut read_buf).await {
                Ok(0) => {
                    info!("connection closed: {}", self.local_addr);
                    sender
                        .send(TransportEvent::Closed(self.remote_addr.clone()))
                        .ok();
                    break;
                }
                Ok(n) => {
                    buffer.extend_from_slice(&read_buf[0..n]);
                    loop {
                        match codec.decode(&mut buffer) {
                            Ok(Some(SipCodecType::Message(msg))) => {
                                debug!("received message from {}", remote_addr);
                                if let Err(e) = sender.send(TransportEvent::Incoming(
                                    msg,
                                    connection.clone(),
                                    remote_addr.clone(),
                                )) {
                                    error!("error delivering incoming message: {:?}", e);
                                    return Err(e.into());
                                }
                            }
                            Ok(Some(SipCodecType::KeepaliveRequest)) => {
                                self.send_raw(KEEPALIVE_RESPONSE).await?;
                            }
                            Ok(Some(SipCodecType::KeepaliveResponse)) => {}
                            Ok(None) => break,
                            Err(e) => {
                                // The broken frame was already consumed;
                                // keep serving the stream.
                                error!("error decoding message from {}: {:?}", remote_addr, e);
                            }
                        }
                    }
                }
                Err(e) => {
                    error!("error reading from stream: {}", e);
                    break;
                }
            }
        }
        Ok(())
    }

    pub async fn close(&self) -> Result<()> {
        let mut write_half = self.write_half.lock().await;
        write_half.shutdown().await?;
        Ok(())
    }
}

#[async_trait::async_trait]
pub trait StreamConnection: Send + Sync + 'static {
    fn get_addr(&self) -> &SipAddr;
    async fn send_message(&self, msg: SipMessage) -> Result<()>;
    async fn send_raw(&self, data: &[u8]) -> Result<()>;
    async fn serve_loop(&self, sender: TransportSender) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

pub async fn send_to_stream<W>(write_half: &Mutex<W>, msg: SipMessage) -> Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    send_raw_to_stream(write_half, &msg.to_bytes()).await
}

pub async fn send_raw_to_stream<W>(write_half: &Mutex<W>, data: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    let mut lock = write_half.lock().await;
    lock.write_all(data).await?;
    lock.flush().await?;
    Ok(())
}
