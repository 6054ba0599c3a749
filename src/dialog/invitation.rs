use super::{
    authenticate::DigestAuthenticator,
    client_dialog::ClientInviteDialog,
    dialog::{DialogInner, DialogStateSender},
    dialog_layer::DialogLayer,
    DialogId,
};
use crate::{
    dialog::server_dialog::Dialog,
    message::{Header, Method, Request, Response, Uri},
    transaction::{
        key::{TransactionKey, TransactionRole},
        make_tag,
        transaction::Transaction,
    },
    transport::SipAddr,
    Result,
};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Parameters of an outgoing INVITE.
///
/// ```rust,no_run
/// use sipkit::dialog::invitation::InviteOption;
///
/// # fn example(offer: Vec<u8>) -> sipkit::Result<()> {
/// let opt = InviteOption {
///     caller: "sip:alice@example.com".try_into()?,
///     callee: "sip:bob@example.com".try_into()?,
///     destination: None,
///     content_type: None, // defaults to application/sdp
///     offer: Some(offer),
///     contact: "sip:alice@192.168.1.100:5060".try_into()?,
///     authenticator: None,
///     headers: None,
/// };
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct InviteOption {
    pub caller: Uri,
    pub callee: Uri,
    /// Overrides the destination derived from the callee URI.
    pub destination: Option<SipAddr>,
    pub content_type: Option<String>,
    /// Message body, normally a serialized SDP offer.
    pub offer: Option<Vec<u8>>,
    pub contact: Uri,
    /// Shared credential store answering 401/407 challenges.
    pub authenticator: Option<Arc<Mutex<DigestAuthenticator>>>,
    /// Extra headers, overriding generated ones on name collision.
    pub headers: Option<Vec<Header>>,
}

impl DialogLayer {
    /// Builds the initial INVITE for `opt`: fresh branch and From tag,
    /// Contact and Content-Type set, CSeq from the layer's sequence.
    pub fn make_invite_request(&self, opt: &InviteOption) -> Result<Request> {
        let last_seq = self.increment_last_seq();
        let to = Header::new("To", format!("<{}>", opt.callee));
        let from = Header::new("From", format!("<{}>;tag={}", opt.caller, make_tag()));
        let via = self.endpoint.get_via()?;
        let mut request = self.endpoint.make_request(
            Method::Invite,
            opt.callee.clone(),
            via,
            from,
            to,
            last_seq,
        );

        request
            .headers
            .unique_push(Header::new("Contact", format!("<{}>", opt.contact)));
        request.headers.unique_push(Header::new(
            "Content-Type",
            opt.content_type
                .clone()
                .unwrap_or_else(|| "application/sdp".to_string()),
        ));
        if let Some(headers) = opt.headers.as_ref() {
            for header in headers {
                request.headers.unique_push(header.clone());
            }
        }
        Ok(request)
    }

    /// Sends an INVITE and drives it to a final response, returning the
    /// dialog handle and that response. The dialog is re-indexed under
    /// its confirmed id once the remote tag is known, and dropped from
    /// the table if the call failed.
    pub async fn do_invite(
        &self,
        opt: InviteOption,
        state_sender: DialogStateSender,
    ) -> Result<(ClientInviteDialog, Option<Response>)> {
        let (dialog, tx) = self.create_client_invite_dialog(opt, state_sender)?;

        let id = dialog.id();
        self.insert_dialog(Dialog::ClientInvite(dialog.clone()));
        info!("client invite dialog created: {}", id);

        match dialog.process_invite(tx).await {
            Ok((new_id, resp)) => {
                if dialog.inner.is_confirmed() {
                    debug!("client invite dialog confirmed: {} => {}", id, new_id);
                    self.reindex_dialog(&id, Dialog::ClientInvite(dialog.clone()));
                } else {
                    self.remove_dialog(&id);
                }
                Ok((dialog, resp))
            }
            Err(e) => {
                self.remove_dialog(&id);
                Err(e)
            }
        }
    }

    /// Builds the INVITE, its client transaction and the dialog shell
    /// without sending anything.
    pub fn create_client_invite_dialog(
        &self,
        opt: InviteOption,
        state_sender: DialogStateSender,
    ) -> Result<(ClientInviteDialog, Transaction)> {
        let mut request = self.make_invite_request(&opt)?;
        request.body = opt.offer.unwrap_or_default();
        request.headers.unique_push(Header::new(
            "Content-Length",
            request.body.len().to_string(),
        ));

        let id = DialogId::try_from(&request)?;
        let dlg_inner = DialogInner::new(
            TransactionRole::Client,
            id,
            request.clone(),
            self.endpoint.clone(),
            state_sender,
            opt.authenticator,
            Some(opt.contact),
        )?;

        let key = TransactionKey::from_request(&request, TransactionRole::Client)?;
        let mut tx = Transaction::new_client(key, request, self.endpoint.clone(), None);
        tx.destination = opt.destination;
        let dialog = ClientInviteDialog {
            inner: Arc::new(dlg_inner),
        };
        Ok((dialog, tx))
    }
}
