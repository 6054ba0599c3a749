use crate::dialog::DialogId;
use crate::transaction::key::TransactionKey;
use crate::transport::SipAddr;

/// Errors produced by the SIP stack.
///
/// Variants carry the identifier of the failing entity where one exists so
/// that callers can correlate failures with a transaction or dialog without
/// keeping extra bookkeeping.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0}")]
    Error(String),

    #[error("sip message error: {0}")]
    SipMessageError(String),

    #[error("uri error: {0}")]
    UriError(String),

    #[error("sdp error: {0}")]
    SdpError(String),

    #[error("authentication error: {0}")]
    AuthError(String),

    #[error("transaction error: {0} ({1})")]
    TransactionError(String, TransactionKey),

    #[error("dialog error: {0} ({1})")]
    DialogError(String, DialogId),

    #[error("transport error: {0} ({1})")]
    TransportLayerError(String, SipAddr),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(e: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Error::Error(e.to_string())
    }
}
