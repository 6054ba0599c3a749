use super::authenticate::DigestAuthenticator;
use super::DialogId;
use crate::message::{
    Header, HeadersExt, Method, Request, Response, StatusCode, Uri, Version,
};
use crate::message::SipMessage;
use crate::transaction::endpoint::EndpointInnerRef;
use crate::transaction::key::{TransactionKey, TransactionRole};
use crate::transaction::transaction::Transaction;
use crate::{Error, Result};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tracing::{debug, info};

/// Why a dialog ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminatedReason {
    /// Transaction timeout (Timer B or no ACK).
    Timeout,
    /// We hung up.
    UacBye,
    /// The remote party hung up.
    UasBye,
    UacCancel,
    UasBusy,
    UasDecline,
    /// 401/407 that could not be answered.
    AuthFailed,
    /// Any other rejection of the initial INVITE.
    UasOther(StatusCode),
}

impl TerminatedReason {
    pub(crate) fn from_status(status: StatusCode) -> Self {
        match status {
            StatusCode::BUSY_HERE | StatusCode::BUSY_EVERYWHERE => TerminatedReason::UasBusy,
            StatusCode::DECLINE => TerminatedReason::UasDecline,
            StatusCode::REQUEST_TIMEOUT => TerminatedReason::Timeout,
            StatusCode::UNAUTHORIZED | StatusCode::PROXY_AUTHENTICATION_REQUIRED => {
                TerminatedReason::AuthFailed
            }
            other => TerminatedReason::UasOther(other),
        }
    }
}

/// Dialog lifecycle notifications delivered to the application.
#[derive(Debug, Clone)]
pub enum DialogState {
    /// Dialog created, initial request not yet sent.
    Calling(DialogId),
    /// Initial request sent, nothing heard yet.
    Trying(DialogId),
    /// Provisional response with a To tag arrived.
    Early(DialogId, Response),
    /// 2xx exchanged (and ACK sent/received).
    Confirmed(DialogId),
    Terminated(DialogId, TerminatedReason),
}

impl DialogState {
    pub fn id(&self) -> &DialogId {
        match self {
            DialogState::Calling(id)
            | DialogState::Trying(id)
            | DialogState::Early(id, _)
            | DialogState::Confirmed(id)
            | DialogState::Terminated(id, _) => id,
        }
    }

    pub fn is_confirmed(&self) -> bool {
        matches!(self, DialogState::Confirmed(_))
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self, DialogState::Terminated(_, _))
    }

    pub fn name(&self) -> &'static str {
        match self {
            DialogState::Calling(_) => "Calling",
            DialogState::Trying(_) => "Trying",
            DialogState::Early(_, _) => "Early",
            DialogState::Confirmed(_) => "Confirmed",
            DialogState::Terminated(_, _) => "Terminated",
        }
    }
}

pub type DialogStateSender = UnboundedSender<DialogState>;
pub type DialogStateReceiver = UnboundedReceiver<DialogState>;

/// Shared state of one dialog.
///
/// The id's `to_tag` is learned from the first tagged response (UAC) or
/// set when we tag our first response (UAS) and is frozen afterwards.
/// `local_seq` feeds CSeq for in-dialog requests we send; `remote_seq`
/// enforces that in-dialog requests from the peer arrive in order.
pub struct DialogInner {
    pub role: TransactionRole,
    pub id: Mutex<DialogId>,
    pub state: Mutex<DialogState>,
    pub local_seq: AtomicU32,
    pub remote_seq: AtomicU32,
    pub local_uri: Uri,
    pub remote_uri: Uri,
    pub local_contact: Option<Uri>,
    pub remote_target: Mutex<Option<Uri>>,
    /// Record-Route values: reversed for the UAC, as received for the UAS.
    pub route_set: Mutex<Vec<String>>,
    pub secure: bool,
    pub initial_request: Request,
    pub endpoint_inner: EndpointInnerRef,
    pub state_sender: DialogStateSender,
    pub authenticator: Option<Arc<Mutex<DigestAuthenticator>>>,
    /// Signalled when the 2xx ACK arrives through dialog-level routing.
    pub(crate) ack_notify: tokio::sync::Notify,
}

impl DialogInner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        role: TransactionRole,
        id: DialogId,
        initial_request: Request,
        endpoint_inner: EndpointInnerRef,
        state_sender: DialogStateSender,
        authenticator: Option<Arc<Mutex<DigestAuthenticator>>>,
        local_contact: Option<Uri>,
    ) -> Result<Self> {
        let from_uri = initial_request
            .from_header()
            .map(crate::message::uri_part)
            .map(Uri::try_from)
            .transpose()?
            .ok_or_else(|| Error::DialogError("request has no From".to_string(), id.clone()))?;
        let to_uri = initial_request
            .to_header()
            .map(crate::message::uri_part)
            .map(Uri::try_from)
            .transpose()?
            .ok_or_else(|| Error::DialogError("request has no To".to_string(), id.clone()))?;
        let (local_uri, remote_uri) = match role {
            TransactionRole::Client => (from_uri, to_uri),
            TransactionRole::Server => (to_uri, from_uri),
        };
        let local_seq = match role {
            TransactionRole::Client => initial_request.cseq().map(|(seq, _)| seq).unwrap_or(1),
            TransactionRole::Server => 0,
        };
        let remote_seq = match role {
            TransactionRole::Client => 0,
            TransactionRole::Server => initial_request.cseq().map(|(seq, _)| seq).unwrap_or(0),
        };
        let secure = initial_request.uri.is_secure();

        Ok(DialogInner {
            role,
            state: Mutex::new(DialogState::Calling(id.clone())),
            id: Mutex::new(id),
            local_seq: AtomicU32::new(local_seq),
            remote_seq: AtomicU32::new(remote_seq),
            local_uri,
            remote_uri,
            local_contact,
            remote_target: Mutex::new(None),
            route_set: Mutex::new(Vec::new()),
            secure,
            initial_request,
            endpoint_inner,
            state_sender,
            authenticator,
            ack_notify: tokio::sync::Notify::new(),
        })
    }

    pub fn id(&self) -> DialogId {
        self.id.lock().unwrap().clone()
    }

    pub fn get_local_seq(&self) -> u32 {
        self.local_seq.load(Ordering::Relaxed)
    }

    /// Next CSeq for an in-dialog request; strictly increasing.
    pub fn increment_local_seq(&self) -> u32 {
        self.local_seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn is_confirmed(&self) -> bool {
        self.state.lock().unwrap().is_confirmed()
    }

    pub fn is_terminated(&self) -> bool {
        self.state.lock().unwrap().is_terminated()
    }

    /// Moves the dialog to `state` and notifies the application.
    /// Terminated is absorbing: any transition out of it is dropped.
    pub fn transition(&self, state: DialogState) -> Result<()> {
        {
            let mut current = self.state.lock().unwrap();
            if current.is_terminated() {
                debug!("ignoring transition of terminated dialog {}", state.id());
                return Ok(());
            }
            info!("dialog {} -> {}", state.id(), state.name());
            *current = state.clone();
        }
        self.state_sender.send(state).ok();
        Ok(())
    }

    /// Learns the remote tag once; later values never overwrite it.
    pub fn update_remote_tag(&self, tag: &str) {
        let mut id = self.id.lock().unwrap();
        let call_id = id.call_id.clone();
        let slot = match self.role {
            TransactionRole::Client => &mut id.to_tag,
            TransactionRole::Server => &mut id.from_tag,
        };
        if slot.is_empty() {
            debug!("learned remote tag {} for {}", tag, call_id);
            *slot = tag.to_string();
        }
    }

    /// Sets the tag we generated for our side (UAS answers).
    pub fn update_local_tag(&self, tag: &str) {
        let mut id = self.id.lock().unwrap();
        let slot = match self.role {
            TransactionRole::Client => &mut id.from_tag,
            TransactionRole::Server => &mut id.to_tag,
        };
        if slot.is_empty() {
            *slot = tag.to_string();
        }
    }

    fn local_tag(&self) -> String {
        let id = self.id.lock().unwrap();
        match self.role {
            TransactionRole::Client => id.from_tag.clone(),
            TransactionRole::Server => id.to_tag.clone(),
        }
    }

    fn remote_tag(&self) -> String {
        let id = self.id.lock().unwrap();
        match self.role {
            TransactionRole::Client => id.to_tag.clone(),
            TransactionRole::Server => id.from_tag.clone(),
        }
    }

    /// In-dialog request ordering: the remote CSeq must increase.
    /// Returns false for out-of-order requests (the caller answers 500).
    pub fn validate_remote_seq(&self, seq: u32) -> bool {
        let current = self.remote_seq.load(Ordering::Relaxed);
        if seq > current {
            self.remote_seq.store(seq, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    /// Captures route set and remote target from the response confirming
    /// the dialog (UAC side): Record-Route reversed, target from Contact.
    pub fn capture_from_response(&self, resp: &Response) {
        let mut routes = resp.record_routes();
        routes.reverse();
        if !routes.is_empty() {
            *self.route_set.lock().unwrap() = routes;
        }
        if let Some(contact) = resp.contact_uri() {
            self.remote_target.lock().unwrap().replace(contact);
        }
    }

    /// Captures route set and remote target from the initial request
    /// (UAS side): Record-Route as received.
    pub fn capture_from_request(&self, req: &Request) {
        let routes = req.record_routes();
        if !routes.is_empty() {
            *self.route_set.lock().unwrap() = routes;
        }
        if let Some(contact) = req.contact_uri() {
            self.remote_target.lock().unwrap().replace(contact);
        }
    }

    /// Builds an in-dialog request: Request-URI from the remote target,
    /// Route headers from the captured set (loose routing), CSeq bumped,
    /// tags on both From and To.
    pub fn make_request(
        &self,
        method: Method,
        body: Option<Vec<u8>>,
        content_type: Option<&str>,
    ) -> Result<Request> {
        let id = self.id();
        let seq = self.increment_local_seq();
        let target = self
            .remote_target
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| self.remote_uri.clone());

        let via = self.endpoint_inner.get_via()?;
        let mut headers = vec![
            via,
            Header::new(
                "Max-Forwards",
                self.endpoint_inner.option.max_forwards.to_string(),
            ),
            Header::new(
                "From",
                format!("<{}>;tag={}", self.local_uri, self.local_tag()),
            ),
            Header::new("To", format!("<{}>;tag={}", self.remote_uri, self.remote_tag())),
            Header::new("Call-ID", id.call_id.clone()),
            Header::new("CSeq", format!("{seq} {method}")),
        ];
        for route in self.route_set.lock().unwrap().iter() {
            headers.push(Header::new("Route", route.clone()));
        }
        if let Some(contact) = &self.local_contact {
            headers.push(Header::new("Contact", format!("<{contact}>")));
        }
        if let Some(content_type) = content_type {
            headers.push(Header::new("Content-Type", content_type));
        }
        let body = body.unwrap_or_default();
        headers.push(Header::new("Content-Length", body.len().to_string()));

        Ok(Request {
            method,
            uri: target,
            version: Version::V2,
            headers: headers.into(),
            body,
        })
    }

    /// Builds the ACK for a 2xx response: a separate request on a fresh
    /// branch carrying the INVITE's CSeq number.
    pub fn make_ack(&self, invite_seq: u32) -> Result<Request> {
        let id = self.id();
        let target = self
            .remote_target
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| self.remote_uri.clone());

        let via = self.endpoint_inner.get_via()?;
        let mut headers = vec![
            via,
            Header::new(
                "Max-Forwards",
                self.endpoint_inner.option.max_forwards.to_string(),
            ),
            Header::new(
                "From",
                format!("<{}>;tag={}", self.local_uri, self.local_tag()),
            ),
            Header::new("To", format!("<{}>;tag={}", self.remote_uri, self.remote_tag())),
            Header::new("Call-ID", id.call_id.clone()),
            Header::new("CSeq", format!("{invite_seq} ACK")),
        ];
        for route in self.route_set.lock().unwrap().iter() {
            headers.push(Header::new("Route", route.clone()));
        }
        headers.push(Header::new("Content-Length", "0"));

        Ok(Request {
            method: Method::Ack,
            uri: target,
            version: Version::V2,
            headers: headers.into(),
            body: Vec::new(),
        })
    }

    /// Confirms a UAS dialog from an ACK routed by dialog id (the 2xx
    /// ACK arrives on a fresh branch and matches no transaction).
    pub fn handle_ack(&self, ack: &Request) {
        if let Some((seq, _)) = ack.cseq() {
            self.remote_seq.fetch_max(seq, Ordering::Relaxed);
        }
        self.transition(DialogState::Confirmed(self.id())).ok();
        self.ack_notify.notify_one();
    }

    /// The reason to report when the peer sends BYE.
    pub(crate) fn remote_bye_reason(&self) -> TerminatedReason {
        match self.role {
            TransactionRole::Client => TerminatedReason::UasBye,
            TransactionRole::Server => TerminatedReason::UacBye,
        }
    }

    /// The reason to report when we send the BYE.
    pub(crate) fn local_bye_reason(&self) -> TerminatedReason {
        match self.role {
            TransactionRole::Client => TerminatedReason::UacBye,
            TransactionRole::Server => TerminatedReason::UasBye,
        }
    }

    /// Runs an in-dialog request through a client transaction and waits
    /// for its final response. `None` means the transaction terminated
    /// without one.
    pub(crate) async fn do_request(&self, request: Request) -> Result<Option<Response>> {
        let key = TransactionKey::from_request(&request, TransactionRole::Client)?;
        let mut tx = Transaction::new_client(key, request, self.endpoint_inner.clone(), None);
        tx.send().await?;
        let mut final_response = None;
        while let Some(msg) = tx.receive().await {
            if let SipMessage::Response(resp) = msg {
                if resp.status_code.is_final() {
                    final_response = Some(resp);
                    break;
                }
            }
        }
        Ok(final_response)
    }

    /// Sends the in-dialog BYE and terminates the dialog.
    pub(crate) async fn send_bye(&self) -> Result<()> {
        let id = self.id();
        if !self.is_confirmed() {
            return Err(Error::DialogError("dialog is not confirmed".to_string(), id));
        }
        let request = self.make_request(Method::Bye, None, None)?;
        self.do_request(request).await?;
        self.transition(DialogState::Terminated(id, self.local_bye_reason()))
    }
}

/// Answers a BYE received inside a dialog: 500 for out-of-order CSeq,
/// 200 otherwise, then terminates the dialog.
pub(crate) async fn handle_bye(inner: &Arc<DialogInner>, mut tx: Transaction) -> Result<()> {
    let seq = tx
        .original
        .cseq()
        .map(|(seq, _)| seq)
        .ok_or_else(|| Error::DialogError("BYE without CSeq".to_string(), inner.id()))?;
    if !inner.validate_remote_seq(seq) {
        debug!("out of order BYE in {}", inner.id());
        tx.reply(StatusCode::SERVER_INTERNAL_ERROR).await?;
        return Ok(());
    }
    tx.reply(StatusCode::OK).await?;
    inner.transition(DialogState::Terminated(inner.id(), inner.remote_bye_reason()))
}
