use super::dialog::{DialogInner, DialogState, TerminatedReason};
use super::DialogId;
use crate::message::{HeadersExt, Response, SipMessage, StatusCode, StatusKind};
use crate::transaction::transaction::Transaction;
use crate::Result;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// The UAC side of an INVITE dialog.
///
/// Created by [`DialogLayer::do_invite`]; the returned handle stays
/// valid for the whole call and is used to hang up.
///
/// [`DialogLayer::do_invite`]: super::dialog_layer::DialogLayer
#[derive(Clone)]
pub struct ClientInviteDialog {
    pub inner: Arc<DialogInner>,
}

impl ClientInviteDialog {
    pub fn id(&self) -> DialogId {
        self.inner.id()
    }

    /// Drives the INVITE client transaction to its conclusion:
    /// provisional responses move the dialog to Early (learning the
    /// remote tag), a 401/407 is answered once through the shared
    /// authenticator, a 2xx is ACKed and confirms the dialog, and any
    /// other final response terminates it.
    ///
    /// Returns the confirmed dialog id and the final response.
    pub async fn process_invite(
        &self,
        mut tx: Transaction,
    ) -> Result<(DialogId, Option<Response>)> {
        tx.send().await?;
        self.inner.transition(DialogState::Trying(self.inner.id()))?;

        let mut auth_sent = false;
        let mut final_response = None;

        while let Some(msg) = tx.receive().await {
            let SipMessage::Response(resp) = msg else {
                continue;
            };
            match resp.status_code.kind() {
                StatusKind::Provisional => {
                    if let Some(tag) = resp.to_tag() {
                        self.inner.update_remote_tag(&tag);
                        if resp.status_code != StatusCode::TRYING {
                            self.inner
                                .transition(DialogState::Early(self.inner.id(), resp.clone()))?;
                        }
                    }
                }
                StatusKind::Successful => {
                    if let Some(tag) = resp.to_tag() {
                        self.inner.update_remote_tag(&tag);
                    }
                    self.inner.capture_from_response(&resp);
                    let invite_seq = tx.original.cseq().map(|(seq, _)| seq).unwrap_or(1);
                    let ack = self.inner.make_ack(invite_seq)?;
                    tx.last_ack = Some(ack.clone());
                    self.inner
                        .endpoint_inner
                        .send_request(ack, tx.connection.clone(), tx.destination.clone())
                        .await?;
                    self.inner
                        .transition(DialogState::Confirmed(self.inner.id()))?;
                    info!("client dialog confirmed: {}", self.inner.id());
                    final_response = Some(resp);
                    break;
                }
                _ => {
                    if matches!(
                        resp.status_code,
                        StatusCode::UNAUTHORIZED | StatusCode::PROXY_AUTHENTICATION_REQUIRED
                    ) && !auth_sent
                    {
                        if let Some(authenticator) = self.inner.authenticator.clone() {
                            auth_sent = true;
                            let new_seq = self.inner.increment_local_seq();
                            match super::authenticate::handle_client_authenticate(
                                new_seq,
                                tx,
                                &resp,
                                &authenticator,
                            )
                            .await
                            {
                                Ok(new_tx) => {
                                    tx = new_tx;
                                    tx.send().await?;
                                    continue;
                                }
                                Err(e) => {
                                    warn!("authentication failed: {:?}", e);
                                    self.inner.transition(DialogState::Terminated(
                                        self.inner.id(),
                                        TerminatedReason::AuthFailed,
                                    ))?;
                                    return Ok((self.inner.id(), Some(resp)));
                                }
                            }
                        }
                    }
                    debug!("invite rejected with {}", resp.status_code);
                    self.inner.transition(DialogState::Terminated(
                        self.inner.id(),
                        TerminatedReason::from_status(resp.status_code),
                    ))?;
                    final_response = Some(resp);
                    break;
                }
            }
        }

        if final_response.is_none() && !self.inner.is_terminated() {
            // The transaction went away without a final response.
            self.inner.transition(DialogState::Terminated(
                self.inner.id(),
                TerminatedReason::Timeout,
            ))?;
        }
        Ok((self.inner.id(), final_response))
    }

    /// Hangs up a confirmed call.
    pub async fn bye(&self) -> Result<()> {
        self.inner.send_bye().await
    }
}
