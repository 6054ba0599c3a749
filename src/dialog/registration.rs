use super::authenticate::{handle_client_authenticate, DigestAuthenticator};
use crate::{
    message::{header_param, Header, HeadersExt, Method, Response, SipMessage, StatusCode, Uri},
    transaction::{
        endpoint::EndpointInnerRef,
        key::{TransactionKey, TransactionRole},
        make_call_id, make_tag,
        transaction::Transaction,
    },
    Error, Result,
};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// Methods advertised in the Allow header.
pub const ALLOW_METHODS: &str = "INVITE, ACK, CANCEL, BYE, OPTIONS, REGISTER, INFO, MESSAGE";

/// SIP registration client.
///
/// Builds REGISTER requests (To = From = address of record, an Expires
/// header and an `expires` Contact parameter), runs them through a
/// non-INVITE client transaction and answers one digest challenge per
/// attempt through the shared authenticator. Call-ID and From tag are
/// generated once and reused for every refresh, as RFC 3261 10.2 asks.
///
/// Refreshing is the caller's loop:
///
/// ```rust,no_run
/// # use sipkit::dialog::registration::Registration;
/// # use std::time::Duration;
/// # async fn example(mut registration: Registration,
/// #                  registrar: sipkit::message::Uri,
/// #                  aor: sipkit::message::Uri) -> sipkit::Result<()> {
/// loop {
///     let response = registration.register(&registrar, &aor, 3600).await?;
///     if response.status_code != sipkit::message::StatusCode::OK {
///         break;
///     }
///     let expires = registration.expires();
///     tokio::time::sleep(Duration::from_secs((expires * 3 / 4) as u64)).await;
/// }
/// # Ok(())
/// # }
/// ```
pub struct Registration {
    pub last_seq: u32,
    pub endpoint: EndpointInnerRef,
    pub authenticator: Option<Arc<Mutex<DigestAuthenticator>>>,
    pub contact: Option<Uri>,
    call_id: Option<String>,
    from_tag: String,
    last_response: Option<Response>,
}

impl Registration {
    pub fn new(
        endpoint: EndpointInnerRef,
        authenticator: Option<Arc<Mutex<DigestAuthenticator>>>,
        contact: Option<Uri>,
    ) -> Self {
        Self {
            last_seq: 0,
            endpoint,
            authenticator,
            contact,
            call_id: None,
            from_tag: make_tag(),
            last_response: None,
        }
    }

    /// Registration lifetime granted by the last 200 OK: the Contact
    /// `expires` parameter when present, the Expires header otherwise.
    pub fn expires(&self) -> u32 {
        let Some(resp) = &self.last_response else {
            return 0;
        };
        resp.contact_header()
            .and_then(|c| header_param(c, "expires"))
            .and_then(|v| v.parse().ok())
            .or_else(|| resp.expires())
            .unwrap_or(0)
    }

    /// Sends one REGISTER to `registrar` for the address of record,
    /// answering a single 401/407 challenge, and returns the final
    /// response.
    pub async fn register(&mut self, registrar: &Uri, aor: &Uri, expires: u32) -> Result<Response> {
        self.last_seq += 1;

        let contact = self.contact.clone().ok_or_else(|| {
            Error::Error("registration requires a contact".to_string())
        })?;

        let to = Header::new("To", format!("<{aor}>"));
        let from = Header::new("From", format!("<{aor}>;tag={}", self.from_tag));
        let via = self.endpoint.get_via()?;
        let mut request = self.endpoint.make_request(
            Method::Register,
            registrar.clone(),
            via,
            from,
            to,
            self.last_seq,
        );

        let call_id = self
            .call_id
            .get_or_insert_with(|| make_call_id(self.endpoint.option.callid_suffix.as_deref()))
            .clone();
        request.headers.unique_push(Header::new("Call-ID", call_id));
        request
            .headers
            .unique_push(Header::new("Contact", format!("<{contact}>;expires={expires}")));
        request
            .headers
            .unique_push(Header::new("Expires", expires.to_string()));
        request
            .headers
            .unique_push(Header::new("Allow", ALLOW_METHODS));

        let key = TransactionKey::from_request(&request, TransactionRole::Client)?;
        let mut tx = Transaction::new_client(key, request, self.endpoint.clone(), None);

        tx.send().await?;
        let mut auth_sent = false;

        while let Some(msg) = tx.receive().await {
            let SipMessage::Response(resp) = msg else {
                continue;
            };
            match resp.status_code {
                status if status.is_provisional() => continue,
                StatusCode::UNAUTHORIZED | StatusCode::PROXY_AUTHENTICATION_REQUIRED => {
                    if auth_sent {
                        debug!("challenge repeated after authentication");
                        self.last_response = Some(resp.clone());
                        return Ok(resp);
                    }
                    let Some(authenticator) = self.authenticator.clone() else {
                        debug!("{} without credentials", resp.status_code);
                        self.last_response = Some(resp.clone());
                        return Ok(resp);
                    };
                    self.last_seq += 1;
                    tx = handle_client_authenticate(self.last_seq, tx, &resp, &authenticator)
                        .await?;
                    tx.send().await?;
                    auth_sent = true;
                }
                _ => {
                    info!("registration finished: {}", resp.status_code);
                    self.last_response = Some(resp.clone());
                    return Ok(resp);
                }
            }
        }

        Err(Error::Error(
            "registration transaction terminated without response".to_string(),
        ))
    }
}
