//! User-agent orchestrator: builds outgoing requests, answers incoming
//! ones, and ties the transaction, dialog, authentication and SDP layers
//! together behind one handle.

use crate::dialog::authenticate::{handle_client_authenticate, Credential, DigestAuthenticator};
use crate::dialog::client_dialog::ClientInviteDialog;
use crate::dialog::dialog::{self, DialogStateReceiver, DialogStateSender};
use crate::dialog::dialog_layer::DialogLayer;
use crate::dialog::invitation::InviteOption;
use crate::dialog::registration::{Registration, ALLOW_METHODS};
use crate::dialog::server_dialog::Dialog;
use crate::dialog::DialogId;
use crate::message::{
    Header, HeadersExt, Method, Request, Response, SipMessage, StatusCode, Uri,
};
use crate::sdp::{build_answer, build_offer, SdpSession, SessionCapability};
use crate::transaction::endpoint::{Endpoint, EndpointBuilder, EndpointOption};
use crate::transaction::key::{TransactionKey, TransactionRole};
use crate::transaction::make_tag;
use crate::transaction::transaction::Transaction;
use crate::transport::{TransportKind, TransportLayer};
use crate::{Error, Result};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::unbounded_channel;
use tracing::{info, warn};

#[cfg(test)]
mod tests;

/// User-agent configuration (spec-level knobs; everything else keeps
/// its RFC default).
#[derive(Clone)]
pub struct UaConfig {
    /// Our own SIP URI; From for outgoing requests and the REGISTER AoR.
    pub local_uri: Uri,
    pub user_agent: String,
    /// Default outbound transport; reliable transports zero the
    /// transaction wait timers.
    pub transport_kind: TransportKind,
    pub max_forwards: u32,
    /// T1/T2/T4 overrides, mostly for tests.
    pub timers: Option<(Duration, Duration, Duration)>,
    /// Seed credentials for the digest authenticator.
    pub credentials: Vec<Credential>,
    /// Local media capability used to answer incoming INVITEs. Without
    /// one, incoming calls are rejected with 488.
    pub capability: Option<SessionCapability>,
}

impl UaConfig {
    pub fn new(local_uri: Uri) -> Self {
        UaConfig {
            local_uri,
            user_agent: crate::USER_AGENT.to_string(),
            transport_kind: TransportKind::Udp,
            max_forwards: 70,
            timers: None,
            credentials: Vec::new(),
            capability: None,
        }
    }
}

/// A SIP user agent.
///
/// Owns the endpoint, the dialog layer and the credential store.
/// [`UserAgent::serve`] must be running for any traffic to flow; dialog
/// state changes arrive on the receiver returned by [`UserAgent::new`].
#[derive(Clone)]
pub struct UserAgent {
    pub config: UaConfig,
    pub endpoint: Endpoint,
    pub dialog_layer: DialogLayer,
    pub authenticator: Arc<Mutex<DigestAuthenticator>>,
    pub contact: Uri,
    state_sender: DialogStateSender,
    registration: Arc<tokio::sync::Mutex<Option<Registration>>>,
}

impl UserAgent {
    /// Builds the user agent on top of a transport layer that already
    /// carries its connections. Returns the agent and the dialog state
    /// event stream.
    pub fn new(
        config: UaConfig,
        transport_layer: TransportLayer,
    ) -> Result<(Self, DialogStateReceiver)> {
        let mut option = EndpointOption {
            max_forwards: config.max_forwards,
            callid_suffix: Some(config.local_uri.host.clone()),
            ..Default::default()
        };
        if let Some((t1, t2, t4)) = config.timers {
            option = option.with_timers(t1, t2, t4);
        }

        let contact = build_contact(&config.local_uri, &transport_layer, config.transport_kind);

        let endpoint = EndpointBuilder::new()
            .with_user_agent(&config.user_agent)
            .with_option(option)
            .with_transport_layer(transport_layer)
            .build();

        let mut authenticator = DigestAuthenticator::new();
        for credential in &config.credentials {
            authenticator.add_credential(credential.clone());
        }

        let dialog_layer = DialogLayer::new(endpoint.inner.clone());
        let (state_sender, state_receiver) = unbounded_channel();

        Ok((
            UserAgent {
                config,
                endpoint,
                dialog_layer,
                authenticator: Arc::new(Mutex::new(authenticator)),
                contact,
                state_sender,
                registration: Arc::new(tokio::sync::Mutex::new(None)),
            },
            state_receiver,
        ))
    }

    /// Runs the endpoint and answers incoming requests until shutdown.
    pub async fn serve(&self) -> Result<()> {
        let mut incoming = self.endpoint.incoming_transactions();
        let mut acks = self.endpoint.orphan_acks();
        let endpoint = self.endpoint.clone();
        let ua = self.clone();
        let ack_ua = self.clone();

        tokio::select! {
            result = endpoint.serve() => result,
            _ = async move {
                while let Some(tx) = incoming.recv().await {
                    let ua = ua.clone();
                    tokio::spawn(async move {
                        let key = tx.key.clone();
                        if let Err(e) = ua.handle_transaction(tx).await {
                            warn!("error handling {}: {:?}", key, e);
                        }
                    });
                }
            } => Ok(()),
            _ = async move {
                while let Some(ack) = acks.recv().await {
                    ack_ua.handle_orphan_ack(ack);
                }
            } => Ok(()),
        }
    }

    /// Routes an ACK that matched no transaction (the 2xx ACK) to its
    /// dialog. Unknown dialogs are dropped, as the spec asks.
    fn handle_orphan_ack(&self, ack: Request) {
        let Ok(id) = DialogId::try_from(&ack) else {
            return;
        };
        match self.dialog_layer.get_dialog(&id) {
            Some(dialog) => dialog.inner().handle_ack(&ack),
            None => info!("dropping ACK for unknown dialog {}", id),
        }
    }

    pub fn shutdown(&self) {
        self.endpoint.shutdown();
    }

    async fn handle_transaction(&self, mut tx: Transaction) -> Result<()> {
        match tx.original.method {
            Method::Invite => self.handle_invite(tx).await,
            Method::Bye => self.handle_bye(tx).await,
            Method::Options => {
                tx.reply_with(StatusCode::OK, vec![Header::new("Allow", ALLOW_METHODS)], None)
                    .await
            }
            // ACK and CANCEL are routed into the INVITE transaction by
            // the endpoint and never show up as fresh transactions.
            Method::Ack | Method::Cancel => Ok(()),
            _ => {
                tx.reply_with(
                    StatusCode::METHOD_NOT_ALLOWED,
                    vec![Header::new("Allow", ALLOW_METHODS)],
                    None,
                )
                .await
            }
        }
    }

    /// Answers an incoming INVITE: 100, 180, then 200 with an SDP answer
    /// computed from the configured capability, and waits for the ACK.
    async fn handle_invite(&self, mut tx: Transaction) -> Result<()> {
        if tx.original.to_tag().is_some() {
            let id = DialogId::try_from(&tx.original)?;
            if self.dialog_layer.get_dialog(&id).is_none() {
                return tx.reply(StatusCode::CALL_TRANSACTION_DOES_NOT_EXIST).await;
            }
            // Session modification is not supported.
            return tx.reply(StatusCode::NOT_ACCEPTABLE_HERE).await;
        }

        tx.send_trying().await?;

        let Some(capability) = self.config.capability.clone() else {
            info!("no media capability configured, rejecting call");
            return tx.reply(StatusCode::NOT_ACCEPTABLE_HERE).await;
        };

        let offer = if tx.original.body.is_empty() {
            None
        } else {
            match SdpSession::parse(&String::from_utf8_lossy(&tx.original.body)) {
                Ok(sdp) => Some(sdp),
                Err(e) => {
                    warn!("unparseable SDP offer: {:?}", e);
                    return tx.reply(StatusCode::BAD_REQUEST).await;
                }
            }
        };

        let dialog = self.dialog_layer.create_server_invite_dialog(
            &tx,
            self.state_sender.clone(),
            Some(self.authenticator.clone()),
            Some(self.contact.clone()),
        )?;
        let early_id = dialog.id();

        dialog.ringing(&mut tx).await?;
        // The 180 attached our tag; store the dialog under its full id.
        self.dialog_layer
            .reindex_dialog(&early_id, Dialog::ServerInvite(dialog.clone()));

        let body = match &offer {
            // An offerless INVITE gets our offer; the answer comes in the ACK.
            None => build_offer(&capability),
            Some(offer) => build_answer(&capability, offer),
        };
        dialog
            .accept(
                &mut tx,
                Some(body.to_string().into_bytes()),
                Some("application/sdp"),
            )
            .await?;

        if !dialog.wait_ack(&mut tx).await? {
            self.dialog_layer.remove_dialog(&dialog.id());
        }
        Ok(())
    }

    async fn handle_bye(&self, mut tx: Transaction) -> Result<()> {
        let id = DialogId::try_from(&tx.original)?;
        match self.dialog_layer.get_dialog(&id) {
            Some(found) => {
                dialog::handle_bye(found.inner(), tx).await?;
                // An out-of-order BYE gets a 500 and leaves the dialog up.
                if found.inner().is_terminated() {
                    self.dialog_layer.remove_dialog(&found.id());
                }
                Ok(())
            }
            None => tx.reply(StatusCode::CALL_TRANSACTION_DOES_NOT_EXIST).await,
        }
    }

    /// Sends an OPTIONS ping and returns the final response.
    pub async fn options(&self, target: &Uri) -> Result<Response> {
        let seq = self.dialog_layer.increment_last_seq();
        let from = Header::new(
            "From",
            format!("<{}>;tag={}", self.config.local_uri, make_tag()),
        );
        let to = Header::new("To", format!("<{target}>"));
        let via = self.endpoint.inner.get_via()?;
        let mut request =
            self.endpoint
                .inner
                .make_request(Method::Options, target.clone(), via, from, to, seq);
        request
            .headers
            .unique_push(Header::new("Accept", "application/sdp"));
        self.run_client_transaction(request).await
    }

    /// Registers the configured AoR with `registrar`. Registration state
    /// (Call-ID, From tag, CSeq) persists across refreshes.
    pub async fn register(&self, registrar: &Uri, expires: u32) -> Result<Response> {
        let mut guard = self.registration.lock().await;
        let registration = guard.get_or_insert_with(|| {
            Registration::new(
                self.endpoint.inner.clone(),
                Some(self.authenticator.clone()),
                Some(self.contact.clone()),
            )
        });
        registration
            .register(registrar, &self.config.local_uri, expires)
            .await
    }

    /// The SDP offer advertising the configured capability.
    pub fn build_local_offer(&self) -> Result<SdpSession> {
        let capability = self
            .config
            .capability
            .as_ref()
            .ok_or_else(|| Error::SdpError("no media capability configured".to_string()))?;
        Ok(build_offer(capability))
    }

    /// Places a call. The offer defaults to the configured capability.
    pub async fn invite(
        &self,
        callee: &Uri,
        offer: Option<SdpSession>,
    ) -> Result<(ClientInviteDialog, Option<Response>)> {
        let offer = match offer {
            Some(offer) => Some(offer),
            None => self.build_local_offer().ok(),
        };
        let opt = InviteOption {
            caller: self.config.local_uri.clone(),
            callee: callee.clone(),
            destination: None,
            content_type: None,
            offer: offer.map(|o| o.to_string().into_bytes()),
            contact: self.contact.clone(),
            authenticator: Some(self.authenticator.clone()),
            headers: None,
        };
        self.dialog_layer
            .do_invite(opt, self.state_sender.clone())
            .await
    }

    /// Hangs up the dialog with the given id.
    pub async fn bye(&self, id: &DialogId) -> Result<()> {
        let dialog = self
            .dialog_layer
            .get_dialog(id)
            .ok_or_else(|| Error::DialogError("unknown dialog".to_string(), id.clone()))?;
        dialog.bye().await?;
        self.dialog_layer.remove_dialog(&dialog.id());
        Ok(())
    }

    /// Runs a non-dialog client transaction to its final response,
    /// answering one digest challenge along the way.
    async fn run_client_transaction(&self, request: Request) -> Result<Response> {
        let key = TransactionKey::from_request(&request, TransactionRole::Client)?;
        let mut tx = Transaction::new_client(key, request, self.endpoint.inner.clone(), None);
        tx.send().await?;

        let mut auth_sent = false;
        while let Some(msg) = tx.receive().await {
            let SipMessage::Response(resp) = msg else {
                continue;
            };
            if resp.status_code.is_provisional() {
                continue;
            }
            if matches!(
                resp.status_code,
                StatusCode::UNAUTHORIZED | StatusCode::PROXY_AUTHENTICATION_REQUIRED
            ) && !auth_sent
            {
                auth_sent = true;
                let seq = tx.original.cseq().map(|(seq, _)| seq).unwrap_or(1);
                tx = handle_client_authenticate(seq + 1, tx, &resp, &self.authenticator).await?;
                tx.send().await?;
                continue;
            }
            return Ok(resp);
        }
        Err(Error::Error(
            "transaction terminated without final response".to_string(),
        ))
    }
}

fn build_contact(local_uri: &Uri, transport_layer: &TransportLayer, kind: TransportKind) -> Uri {
    match transport_layer.default_addr() {
        Some(addr) => {
            let mut contact = Uri {
                scheme: local_uri.scheme,
                user: local_uri.user.clone(),
                host: addr.addr.ip().to_string(),
                port: Some(addr.addr.port()),
                ..Default::default()
            };
            if kind == TransportKind::Tcp {
                contact
                    .params
                    .push(("transport".to_string(), Some("tcp".to_string())));
            }
            contact
        }
        None => local_uri.clone(),
    }
}
