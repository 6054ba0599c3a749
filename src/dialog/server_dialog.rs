use super::dialog::{DialogInner, DialogState, TerminatedReason};
use super::DialogId;
use crate::message::{Header, HeadersExt, Method, SipMessage, StatusCode};
use crate::transaction::transaction::Transaction;
use crate::{Error, Result};
use std::sync::Arc;
use tracing::{debug, info};

/// The UAS side of an INVITE dialog.
///
/// The owning task drives the server transaction itself: typically
/// 100 via [`Transaction::send_trying`], then [`ServerInviteDialog::ringing`],
/// then either [`ServerInviteDialog::accept`] followed by
/// [`ServerInviteDialog::wait_ack`], or [`ServerInviteDialog::reject`].
#[derive(Clone)]
pub struct ServerInviteDialog {
    pub inner: Arc<DialogInner>,
}

impl ServerInviteDialog {
    pub fn id(&self) -> DialogId {
        self.inner.id()
    }

    pub fn initial_request(&self) -> &crate::message::Request {
        &self.inner.initial_request
    }

    /// Sends 180 Ringing. The transaction attaches our To tag, which
    /// becomes the dialog's local tag; the dialog enters Early.
    pub async fn ringing(&self, tx: &mut Transaction) -> Result<()> {
        tx.reply(StatusCode::RINGING).await?;
        self.adopt_local_tag(tx);
        let resp = tx.last_response.clone().ok_or_else(|| {
            Error::DialogError("no ringing response recorded".to_string(), self.id())
        })?;
        self.inner
            .transition(DialogState::Early(self.inner.id(), resp))
    }

    /// Answers the INVITE with 200 OK carrying `body` (normally the SDP
    /// answer) and our Contact.
    pub async fn accept(
        &self,
        tx: &mut Transaction,
        body: Option<Vec<u8>>,
        content_type: Option<&str>,
    ) -> Result<()> {
        let mut headers = Vec::new();
        if let Some(contact) = &self.inner.local_contact {
            headers.push(Header::new("Contact", format!("<{contact}>")));
        }
        if let Some(content_type) = content_type {
            headers.push(Header::new("Content-Type", content_type));
        }
        if let Some(body) = &body {
            headers.push(Header::new("Content-Length", body.len().to_string()));
        }
        tx.reply_with(StatusCode::OK, headers, body).await?;
        self.adopt_local_tag(tx);
        Ok(())
    }

    /// Rejects the INVITE with a final status and terminates the dialog.
    pub async fn reject(&self, tx: &mut Transaction, status: StatusCode) -> Result<()> {
        tx.reply(status).await?;
        self.adopt_local_tag(tx);
        self.inner.transition(DialogState::Terminated(
            self.inner.id(),
            TerminatedReason::from_status(status),
        ))
    }

    /// Waits for the ACK confirming our 2xx. It may arrive inside the
    /// transaction (peers that reuse the INVITE branch) or through
    /// dialog-level routing (RFC-conformant fresh-branch ACKs). Returns
    /// false when Timer L fires without one.
    pub async fn wait_ack(&self, tx: &mut Transaction) -> Result<bool> {
        loop {
            if self.inner.is_confirmed() {
                return Ok(true);
            }
            tokio::select! {
                _ = self.inner.ack_notify.notified() => {
                    info!("server dialog confirmed: {}", self.inner.id());
                    return Ok(true);
                }
                msg = tx.receive() => match msg {
                    Some(SipMessage::Request(req)) if req.method == Method::Ack => {
                        self.inner.handle_ack(&req);
                        info!("server dialog confirmed: {}", self.inner.id());
                        return Ok(true);
                    }
                    Some(SipMessage::Request(req)) if req.method == Method::Cancel => {
                        debug!("CANCEL after final response, ignoring");
                    }
                    Some(_) => {}
                    None => {
                        if self.inner.is_confirmed() {
                            return Ok(true);
                        }
                        self.inner.transition(DialogState::Terminated(
                            self.inner.id(),
                            TerminatedReason::Timeout,
                        ))?;
                        return Ok(false);
                    }
                }
            }
        }
    }

    /// Hangs up a confirmed call.
    pub async fn bye(&self) -> Result<()> {
        self.inner.send_bye().await
    }

    fn adopt_local_tag(&self, tx: &Transaction) {
        if let Some(tag) = tx.original.to_tag() {
            self.inner.update_local_tag(&tag);
        }
    }
}

/// A dialog of either role, as stored in the dialog layer.
#[derive(Clone)]
pub enum Dialog {
    ClientInvite(super::client_dialog::ClientInviteDialog),
    ServerInvite(ServerInviteDialog),
}

impl Dialog {
    pub fn id(&self) -> DialogId {
        match self {
            Dialog::ClientInvite(d) => d.id(),
            Dialog::ServerInvite(d) => d.id(),
        }
    }

    pub fn inner(&self) -> &Arc<DialogInner> {
        match self {
            Dialog::ClientInvite(d) => &d.inner,
            Dialog::ServerInvite(d) => &d.inner,
        }
    }

    pub async fn bye(&self) -> Result<()> {
        self.inner().send_bye().await
    }
}
