use super::endpoint::EndpointInnerRef;
use super::key::TransactionKey;
use super::{make_tag, TransactionState, TransactionTimer, TransactionType};
use crate::message::{Header, HeadersExt, Method, Request, Response, SipMessage, StatusCode};
use crate::transport::{SipAddr, SipConnection};
use crate::{Error, Result};
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};

pub type TransactionEventReceiver = UnboundedReceiver<TransactionEvent>;
pub type TransactionEventSender = UnboundedSender<TransactionEvent>;

/// Events driving a transaction's state machine: a message matched to it
/// by the endpoint, one of its timers, or an instruction to terminate.
pub enum TransactionEvent {
    Received(SipMessage, Option<SipConnection>),
    Timer(TransactionTimer),
    Terminate,
}

/// A single RFC 3261 transaction.
///
/// One struct implements all four machines, discriminated by
/// [`TransactionType`]; the endpoint routes inbound messages and timer
/// events to it by branch and the owner task pumps them through
/// [`Transaction::receive`].
///
/// # Client transactions
///
/// Created with [`Transaction::new_client`], started with
/// [`Transaction::send`]. Responses come back from `receive()`; a
/// transaction timeout surfaces as a synthesized 408 response followed
/// by channel close. The ACK for a negative final response is generated
/// inside the transaction on the same branch, per RFC 3261 17.1.1.3;
/// the ACK for a 2xx is the dialog layer's, on a fresh branch.
///
/// # Server transactions
///
/// Surface from [`Endpoint::incoming_transactions`]
/// (the original request is in `tx.original`) and are driven with
/// [`Transaction::respond`] / [`Transaction::reply`]. Request
/// retransmissions are absorbed by replaying the last response.
///
/// [`Endpoint::incoming_transactions`]: super::endpoint::Endpoint::incoming_transactions
///
/// ```rust,no_run
/// use sipkit::message::SipMessage;
/// use sipkit::transaction::key::{TransactionKey, TransactionRole};
/// use sipkit::transaction::transaction::Transaction;
///
/// # async fn example(request: sipkit::message::Request,
/// #                  endpoint: sipkit::transaction::endpoint::Endpoint) -> sipkit::Result<()> {
/// let key = TransactionKey::from_request(&request, TransactionRole::Client)?;
/// let mut tx = Transaction::new_client(key, request, endpoint.inner.clone(), None);
/// tx.send().await?;
/// while let Some(msg) = tx.receive().await {
///     if let SipMessage::Response(resp) = msg {
///         if resp.status_code.is_final() {
///             break;
///         }
///     }
/// }
/// # Ok(())
/// # }
/// ```
pub struct Transaction {
    pub transaction_type: TransactionType,
    pub key: TransactionKey,
    pub original: Request,
    pub destination: Option<SipAddr>,
    pub state: TransactionState,
    pub endpoint_inner: EndpointInnerRef,
    pub connection: Option<SipConnection>,
    pub last_response: Option<Response>,
    pub last_ack: Option<Request>,
    pub tu_receiver: TransactionEventReceiver,
    pub tu_sender: TransactionEventSender,
    retransmit_timer: Option<u64>,
    timeout_timer: Option<u64>,
    linger_timer: Option<u64>,
    retransmits: u32,
    is_cleaned_up: bool,
}

impl Transaction {
    fn new(
        transaction_type: TransactionType,
        key: TransactionKey,
        original: Request,
        connection: Option<SipConnection>,
        endpoint_inner: EndpointInnerRef,
    ) -> Self {
        let state = match transaction_type {
            TransactionType::ClientInvite | TransactionType::ClientNonInvite => {
                TransactionState::Calling
            }
            TransactionType::ServerInvite => TransactionState::Proceeding,
            TransactionType::ServerNonInvite => TransactionState::Trying,
        };
        let (tu_sender, tu_receiver) = unbounded_channel();
        info!("transaction created {:?} {}", transaction_type, key);
        let tx = Self {
            transaction_type,
            endpoint_inner,
            connection,
            key,
            original,
            destination: None,
            state,
            last_response: None,
            last_ack: None,
            retransmit_timer: None,
            timeout_timer: None,
            linger_timer: None,
            retransmits: 0,
            tu_receiver,
            tu_sender,
            is_cleaned_up: false,
        };
        tx.endpoint_inner
            .attach_transaction(&tx.key, tx.tu_sender.clone());
        tx
    }

    pub fn new_client(
        key: TransactionKey,
        original: Request,
        endpoint_inner: EndpointInnerRef,
        connection: Option<SipConnection>,
    ) -> Self {
        let tx_type = match original.method {
            Method::Invite => TransactionType::ClientInvite,
            _ => TransactionType::ClientNonInvite,
        };
        Transaction::new(tx_type, key, original, connection, endpoint_inner)
    }

    pub fn new_server(
        key: TransactionKey,
        original: Request,
        endpoint_inner: EndpointInnerRef,
        connection: Option<SipConnection>,
    ) -> Self {
        let tx_type = match original.method {
            Method::Invite | Method::Ack | Method::Cancel => TransactionType::ServerInvite,
            _ => TransactionType::ServerNonInvite,
        };
        Transaction::new(tx_type, key, original, connection, endpoint_inner)
    }

    fn is_reliable(&self) -> bool {
        self.connection
            .as_ref()
            .map(|c| c.is_reliable())
            .unwrap_or(false)
    }

    /// Wait-timer value: zeroed on reliable transports.
    fn wait_duration(&self, unreliable: Duration) -> Duration {
        if self.is_reliable() {
            Duration::ZERO
        } else {
            unreliable
        }
    }

    /// Sends the original request; client transactions only. Starts the
    /// retransmission and timeout timers (A/B for INVITE, E/F otherwise).
    pub async fn send(&mut self) -> Result<()> {
        if !self.transaction_type.is_client() {
            return Err(Error::TransactionError(
                "send is only valid for client transactions".to_string(),
                self.key.clone(),
            ));
        }
        if self.connection.is_none() {
            let target = match &self.destination {
                Some(addr) => addr.clone(),
                None => self.endpoint_inner.resolve_uri(&self.original.uri).await?,
            };
            let connection = self.endpoint_inner.transport_layer.lookup(&target)?;
            // Datagram transports need the resolved destination on every send.
            if !connection.is_reliable() {
                self.destination.replace(target);
            }
            self.connection.replace(connection);
        }

        self.original.headers.unique_push(Header::new(
            "Content-Length",
            self.original.body.len().to_string(),
        ));
        self.send_original().await?;

        let option = &self.endpoint_inner.option;
        match self.transaction_type {
            TransactionType::ClientInvite => {
                if !self.is_reliable() {
                    self.retransmit_timer = Some(self.endpoint_inner.timers.schedule(
                        option.t1,
                        TransactionTimer::TimerA(self.key.clone(), option.t1),
                    ));
                }
                self.timeout_timer = Some(
                    self.endpoint_inner
                        .timers
                        .schedule(option.t1x64, TransactionTimer::TimerB(self.key.clone())),
                );
                Ok(())
            }
            _ => self.transition(TransactionState::Trying).map(|_| ()),
        }
    }

    /// Sends a response built from the stored request; server
    /// transactions only. A To tag is attached (and then reused for the
    /// rest of the transaction) for anything but 100 Trying.
    pub async fn reply_with(
        &mut self,
        status_code: StatusCode,
        headers: Vec<Header>,
        body: Option<Vec<u8>>,
    ) -> Result<()> {
        if status_code != StatusCode::TRYING && self.original.to_tag().is_none() {
            let to = self
                .original
                .to_header()
                .ok_or_else(|| {
                    Error::TransactionError("request has no To header".to_string(), self.key.clone())
                })?
                .to_string();
            self.original
                .headers
                .unique_push(Header::new("To", format!("{};tag={}", to, make_tag())));
        }
        let mut resp = self
            .endpoint_inner
            .make_response(&self.original, status_code, body);
        for header in headers {
            resp.headers.unique_push(header);
        }
        self.respond(resp).await
    }

    /// Quick reply with only a status code.
    pub async fn reply(&mut self, status_code: StatusCode) -> Result<()> {
        self.reply_with(status_code, vec![], None).await
    }

    pub async fn send_trying(&mut self) -> Result<()> {
        self.reply(StatusCode::TRYING).await
    }

    /// Sends a response; server transactions only. Drives the server
    /// state machines: provisionals keep the transaction alive, a 2xx
    /// moves an INVITE server to Accepted, other finals to Completed.
    pub async fn respond(&mut self, response: Response) -> Result<()> {
        if !self.transaction_type.is_server() {
            return Err(Error::TransactionError(
                "respond is only valid for server transactions".to_string(),
                self.key.clone(),
            ));
        }

        let new_state = if response.status_code.is_provisional() {
            TransactionState::Proceeding
        } else if response.status_code.is_success()
            && self.transaction_type == TransactionType::ServerInvite
        {
            TransactionState::Accepted
        } else {
            TransactionState::Completed
        };
        self.can_transition(new_state)?;

        let connection = self.connection.as_ref().ok_or_else(|| {
            Error::TransactionError("no connection found".to_string(), self.key.clone())
        })?;
        debug!("responding {} ({})", response.status_code, self.key);
        connection
            .send(response.clone().into(), self.destination.as_ref())
            .await?;
        self.last_response.replace(response);
        self.transition(new_state).map(|_| ())
    }

    /// Pumps the transaction until it yields a message for the
    /// transaction user or terminates. Yields provisional and final
    /// responses on the client side, and ACK/CANCEL on the INVITE server
    /// side; returns `None` once the transaction is terminated.
    pub async fn receive(&mut self) -> Option<SipMessage> {
        while let Some(event) = self.tu_receiver.recv().await {
            match event {
                TransactionEvent::Received(msg, connection) => {
                    if let Some(msg) = match msg {
                        SipMessage::Request(req) => self.on_received_request(req, connection).await,
                        SipMessage::Response(resp) => self.on_received_response(resp).await,
                    } {
                        return Some(msg);
                    }
                }
                TransactionEvent::Timer(timer) => match self.on_timer(timer).await {
                    Ok(Some(msg)) => return Some(msg),
                    Ok(None) => {}
                    Err(e) => {
                        // A failed retransmission is a transport error and
                        // ends the transaction.
                        warn!("timer handling error: {:?} ({})", e, self.key);
                        self.transition(TransactionState::Terminated).ok();
                        return None;
                    }
                },
                TransactionEvent::Terminate => {
                    debug!("received terminate event ({})", self.key);
                    return None;
                }
            }
        }
        None
    }

    pub fn is_terminated(&self) -> bool {
        self.state == TransactionState::Terminated
    }
}

impl Transaction {
    async fn send_original(&self) -> Result<()> {
        let connection = self.connection.as_ref().ok_or_else(|| {
            Error::TransactionError("no connection found".to_string(), self.key.clone())
        })?;
        connection
            .send(self.original.clone().into(), self.destination.as_ref())
            .await
    }

    async fn resend_response(&self, response: Response) -> Result<()> {
        let connection = self.connection.as_ref().ok_or_else(|| {
            Error::TransactionError("no connection found".to_string(), self.key.clone())
        })?;
        connection
            .send(response.into(), self.destination.as_ref())
            .await
    }

    async fn on_received_request(
        &mut self,
        req: Request,
        connection: Option<SipConnection>,
    ) -> Option<SipMessage> {
        if !self.transaction_type.is_server() {
            return None;
        }
        if self.connection.is_none() && connection.is_some() {
            self.connection = connection;
        }

        match req.method {
            Method::Cancel => {
                match self.state {
                    TransactionState::Trying | TransactionState::Proceeding => {
                        // 200 the CANCEL; the TU answers the INVITE with 487.
                        let resp = self.endpoint_inner.make_response(&req, StatusCode::OK, None);
                        if let Some(connection) = &self.connection {
                            connection
                                .send(resp.into(), self.destination.as_ref())
                                .await
                                .ok();
                        }
                        Some(req.into())
                    }
                    _ => {
                        let resp = self.endpoint_inner.make_response(
                            &req,
                            StatusCode::CALL_TRANSACTION_DOES_NOT_EXIST,
                            None,
                        );
                        if let Some(connection) = &self.connection {
                            connection
                                .send(resp.into(), self.destination.as_ref())
                                .await
                                .ok();
                        }
                        None
                    }
                }
            }
            Method::Ack => {
                if self.transaction_type != TransactionType::ServerInvite {
                    return None;
                }
                match self.state {
                    TransactionState::Accepted => {
                        // ACK for our 2xx: confirm and hand it to the dialog.
                        self.transition(TransactionState::Confirmed).ok();
                        Some(req.into())
                    }
                    TransactionState::Completed => {
                        // ACK for a negative final is transaction-level only.
                        self.transition(TransactionState::Confirmed).ok();
                        None
                    }
                    _ => None,
                }
            }
            _ => {
                // Retransmission of the original request.
                match self.state {
                    TransactionState::Trying
                    | TransactionState::Proceeding
                    | TransactionState::Completed
                    | TransactionState::Accepted => {
                        if let Some(last_response) = self.last_response.clone() {
                            self.resend_response(last_response).await.ok();
                        }
                    }
                    _ => {}
                }
                None
            }
        }
    }

    async fn on_received_response(&mut self, resp: Response) -> Option<SipMessage> {
        if !self.transaction_type.is_client() {
            return None;
        }

        let new_state = if resp.status_code.is_provisional() {
            if resp.status_code == StatusCode::TRYING
                && self.transaction_type == TransactionType::ClientInvite
            {
                TransactionState::Trying
            } else {
                TransactionState::Proceeding
            }
        } else if resp.status_code.is_success()
            && self.transaction_type == TransactionType::ClientInvite
        {
            TransactionState::Accepted
        } else {
            TransactionState::Completed
        };

        if self.state == new_state {
            return match (self.state, self.transaction_type) {
                // Retransmitted 2xx: the dialog layer must re-ACK.
                (TransactionState::Accepted, TransactionType::ClientInvite) => Some(resp.into()),
                // Retransmitted negative final: replay our ACK, absorb.
                (TransactionState::Completed, TransactionType::ClientInvite) => {
                    if let Some(ack) = self.last_ack.clone() {
                        self.send_request_raw(ack).await.ok();
                    }
                    None
                }
                _ => None,
            };
        }

        if self.can_transition(new_state).is_err() {
            debug!(
                "dropping {} in state {:?} ({})",
                resp.status_code, self.state, self.key
            );
            return None;
        }

        self.last_response.replace(resp.clone());
        self.transition(new_state).ok();

        if new_state == TransactionState::Completed
            && self.transaction_type == TransactionType::ClientInvite
        {
            match self.make_non2xx_ack(&resp) {
                Ok(ack) => {
                    self.send_request_raw(ack.clone()).await.ok();
                    self.last_ack.replace(ack);
                }
                Err(e) => warn!("cannot build ACK: {:?} ({})", e, self.key),
            }
        }

        Some(resp.into())
    }

    async fn send_request_raw(&self, request: Request) -> Result<()> {
        let connection = self.connection.as_ref().ok_or_else(|| {
            Error::TransactionError("no connection found".to_string(), self.key.clone())
        })?;
        connection
            .send(request.into(), self.destination.as_ref())
            .await
    }

    /// ACK for a non-2xx final response, sent within the transaction on
    /// the same branch (RFC 3261 17.1.1.3).
    fn make_non2xx_ack(&self, resp: &Response) -> Result<Request> {
        let via = self.original.top_via().ok_or_else(|| {
            Error::TransactionError("request has no Via".to_string(), self.key.clone())
        })?;
        let from = self.original.from_header().ok_or_else(|| {
            Error::TransactionError("request has no From".to_string(), self.key.clone())
        })?;
        let to = resp
            .to_header()
            .or_else(|| self.original.to_header())
            .ok_or_else(|| {
                Error::TransactionError("no To header for ACK".to_string(), self.key.clone())
            })?;
        let call_id = self.original.call_id().ok_or_else(|| {
            Error::TransactionError("request has no Call-ID".to_string(), self.key.clone())
        })?;
        let (seq, _) = self.original.cseq().ok_or_else(|| {
            Error::TransactionError("request has no CSeq".to_string(), self.key.clone())
        })?;

        let mut headers = vec![
            Header::new("Via", via),
            Header::new("Max-Forwards", self.endpoint_inner.option.max_forwards.to_string()),
            Header::new("From", from),
            Header::new("To", to),
            Header::new("Call-ID", call_id),
            Header::new("CSeq", format!("{seq} ACK")),
        ];
        for route in self.original.headers.get_all("Route") {
            headers.push(Header::new("Route", route));
        }
        headers.push(Header::new("Content-Length", "0"));

        Ok(Request {
            method: Method::Ack,
            uri: self.original.uri.clone(),
            version: Default::default(),
            headers: headers.into(),
            body: Vec::new(),
        })
    }

    async fn on_timer(&mut self, timer: TransactionTimer) -> Result<Option<SipMessage>> {
        let option = self.endpoint_inner.option.clone();
        match timer {
            TransactionTimer::TimerA(key, duration) => {
                if self.transaction_type == TransactionType::ClientInvite
                    && self.state == TransactionState::Calling
                {
                    self.retransmits += 1;
                    if self.retransmits >= option.max_invite_retransmits {
                        warn!("retransmission cap reached ({})", self.key);
                        return self.timeout();
                    }
                    self.send_original().await?;
                    let duration = (duration * 2).min(option.t2);
                    self.retransmit_timer = Some(
                        self.endpoint_inner
                            .timers
                            .schedule(duration, TransactionTimer::TimerA(key, duration)),
                    );
                }
            }
            TransactionTimer::TimerE(key, duration) => {
                if self.transaction_type == TransactionType::ClientNonInvite
                    && matches!(
                        self.state,
                        TransactionState::Trying | TransactionState::Proceeding
                    )
                {
                    self.retransmits += 1;
                    if self.retransmits >= option.max_retransmits {
                        warn!("retransmission cap reached ({})", self.key);
                        return self.timeout();
                    }
                    self.send_original().await?;
                    // Doubling stops once a provisional arrived; from
                    // Proceeding on, E fires at a flat T2.
                    let duration = if self.state == TransactionState::Trying {
                        (duration * 2).min(option.t2)
                    } else {
                        option.t2
                    };
                    self.retransmit_timer = Some(
                        self.endpoint_inner
                            .timers
                            .schedule(duration, TransactionTimer::TimerE(key, duration)),
                    );
                }
            }
            TransactionTimer::TimerB(_) | TransactionTimer::TimerF(_) => {
                if matches!(
                    self.state,
                    TransactionState::Calling
                        | TransactionState::Trying
                        | TransactionState::Proceeding
                ) {
                    return self.timeout();
                }
            }
            TransactionTimer::TimerG(key, duration) => {
                if self.transaction_type == TransactionType::ServerInvite
                    && self.state == TransactionState::Completed
                {
                    self.retransmits += 1;
                    if self.retransmits >= option.max_invite_retransmits {
                        self.transition(TransactionState::Terminated)?;
                        return Ok(None);
                    }
                    if let Some(last_response) = self.last_response.clone() {
                        self.resend_response(last_response).await?;
                    }
                    let duration = (duration * 2).min(option.t2);
                    self.retransmit_timer = Some(
                        self.endpoint_inner
                            .timers
                            .schedule(duration, TransactionTimer::TimerG(key, duration)),
                    );
                }
            }
            TransactionTimer::TimerH(_) => {
                if self.transaction_type == TransactionType::ServerInvite
                    && self.state == TransactionState::Completed
                {
                    // No ACK ever arrived; give up quietly.
                    debug!("Timer H fired without ACK ({})", self.key);
                    self.transition(TransactionState::Terminated)?;
                }
            }
            TransactionTimer::TimerD(_) | TransactionTimer::TimerK(_) | TransactionTimer::TimerJ(_) => {
                if self.state == TransactionState::Completed {
                    self.transition(TransactionState::Terminated)?;
                }
            }
            TransactionTimer::TimerL(_) | TransactionTimer::TimerM(_) => {
                if self.state == TransactionState::Accepted {
                    self.transition(TransactionState::Terminated)?;
                }
            }
            TransactionTimer::TimerI(_) => {
                if self.state == TransactionState::Confirmed {
                    self.transition(TransactionState::Terminated)?;
                }
            }
        }
        Ok(None)
    }

    /// Timer B/F expiry or an exceeded retransmission cap: surface a
    /// synthesized 408 to the transaction user and terminate.
    fn timeout(&mut self) -> Result<Option<SipMessage>> {
        let resp =
            self.endpoint_inner
                .make_response(&self.original, StatusCode::REQUEST_TIMEOUT, None);
        self.transition(TransactionState::Terminated)?;
        Ok(Some(resp.into()))
    }

    fn can_transition(&self, target: TransactionState) -> Result<()> {
        use TransactionState::*;
        match (self.state, target) {
            (Calling, Trying)
            | (Calling, Proceeding)
            | (Calling, Completed)
            | (Calling, Accepted)
            | (Calling, Terminated)
            | (Trying, Trying)
            | (Trying, Proceeding)
            | (Trying, Completed)
            | (Trying, Accepted)
            | (Trying, Terminated)
            | (Proceeding, Proceeding)
            | (Proceeding, Completed)
            | (Proceeding, Accepted)
            | (Proceeding, Terminated)
            | (Completed, Confirmed)
            | (Completed, Terminated)
            | (Accepted, Accepted)
            | (Accepted, Confirmed)
            | (Accepted, Terminated)
            | (Confirmed, Terminated) => Ok(()),
            _ => Err(Error::TransactionError(
                format!(
                    "invalid state transition from {:?} to {:?}",
                    self.state, target
                ),
                self.key.clone(),
            )),
        }
    }

    fn transition(&mut self, state: TransactionState) -> Result<TransactionState> {
        if self.state == state {
            return Ok(self.state);
        }
        let option = self.endpoint_inner.option.clone();
        match state {
            TransactionState::Calling => {
                // No state transitions into Calling.
            }
            TransactionState::Trying => match self.transaction_type {
                TransactionType::ClientNonInvite => {
                    if !self.is_reliable() {
                        self.retransmit_timer = Some(self.endpoint_inner.timers.schedule(
                            option.t1,
                            TransactionTimer::TimerE(self.key.clone(), option.t1),
                        ));
                    }
                    self.timeout_timer = Some(
                        self.endpoint_inner
                            .timers
                            .schedule(option.t1x64, TransactionTimer::TimerF(self.key.clone())),
                    );
                }
                TransactionType::ClientInvite => {
                    // 100 Trying stops INVITE retransmission.
                    self.cancel_retransmit();
                }
                _ => {}
            },
            TransactionState::Proceeding => {
                if self.transaction_type == TransactionType::ClientInvite {
                    self.cancel_retransmit();
                }
            }
            TransactionState::Completed => match self.transaction_type {
                TransactionType::ClientInvite => {
                    self.cancel_retransmit();
                    self.cancel_timeout();
                    let wait = self.wait_duration(option.timer_d);
                    self.schedule_linger(TransactionTimer::TimerD(self.key.clone()), wait);
                }
                TransactionType::ClientNonInvite => {
                    self.cancel_retransmit();
                    self.cancel_timeout();
                    let wait = self.wait_duration(option.t4);
                    self.schedule_linger(TransactionTimer::TimerK(self.key.clone()), wait);
                }
                TransactionType::ServerInvite => {
                    if !self.is_reliable() {
                        self.retransmit_timer = Some(self.endpoint_inner.timers.schedule(
                            option.t1,
                            TransactionTimer::TimerG(self.key.clone(), option.t1),
                        ));
                    }
                    self.timeout_timer = Some(
                        self.endpoint_inner
                            .timers
                            .schedule(option.t1x64, TransactionTimer::TimerH(self.key.clone())),
                    );
                }
                TransactionType::ServerNonInvite => {
                    let wait = self.wait_duration(option.t1x64);
                    self.schedule_linger(TransactionTimer::TimerJ(self.key.clone()), wait);
                }
            },
            TransactionState::Accepted => match self.transaction_type {
                TransactionType::ClientInvite => {
                    self.cancel_retransmit();
                    self.cancel_timeout();
                    self.schedule_linger(
                        TransactionTimer::TimerM(self.key.clone()),
                        option.t1x64,
                    );
                }
                TransactionType::ServerInvite => {
                    self.schedule_linger(TransactionTimer::TimerL(self.key.clone()), option.t1x64);
                }
                _ => {}
            },
            TransactionState::Confirmed => {
                self.cancel_retransmit();
                self.cancel_timeout();
                let wait = self.wait_duration(option.t4);
                self.schedule_linger(TransactionTimer::TimerI(self.key.clone()), wait);
            }
            TransactionState::Terminated => {
                self.cleanup();
                self.tu_sender.send(TransactionEvent::Terminate).ok();
            }
        }
        debug!("transition: {:?} -> {:?} ({})", self.state, state, self.key);
        self.state = state;
        Ok(self.state)
    }

    fn schedule_linger(&mut self, timer: TransactionTimer, duration: Duration) {
        if let Some(id) = self.linger_timer.take() {
            self.endpoint_inner.timers.cancel(id);
        }
        self.linger_timer = Some(self.endpoint_inner.timers.schedule(duration, timer));
    }

    fn cancel_retransmit(&mut self) {
        if let Some(id) = self.retransmit_timer.take() {
            self.endpoint_inner.timers.cancel(id);
        }
    }

    fn cancel_timeout(&mut self) {
        if let Some(id) = self.timeout_timer.take() {
            self.endpoint_inner.timers.cancel(id);
        }
    }

    fn cancel_all_timers(&mut self) {
        self.cancel_retransmit();
        self.cancel_timeout();
        if let Some(id) = self.linger_timer.take() {
            self.endpoint_inner.timers.cancel(id);
        }
    }

    fn cleanup(&mut self) {
        if self.is_cleaned_up {
            return;
        }
        self.is_cleaned_up = true;
        self.cancel_all_timers();
        let last_message = match self.transaction_type {
            TransactionType::ClientInvite => self.last_ack.take().map(SipMessage::Request),
            TransactionType::ServerNonInvite => self.last_response.take().map(SipMessage::Response),
            _ => None,
        };
        self.endpoint_inner
            .detach_transaction(&self.key, last_message);
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        self.cleanup();
        info!("transaction dropped: {}", self.key);
    }
}
