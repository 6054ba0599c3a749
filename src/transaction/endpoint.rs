use super::key::{TransactionKey, TransactionRole};
use super::timer::TimerQueue;
use super::transaction::{Transaction, TransactionEvent, TransactionEventSender};
use super::{make_branch, TransactionTimer};
use crate::message::{Header, Method, Request, SipMessage, StatusCode, Uri};
use crate::transport::{
    SipAddr, SipConnection, TransportEvent, TransportKind, TransportLayer,
};
use crate::{Error, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Timer constants and safety limits, all derived from T1/T2/T4
/// (RFC 3261 appendix A). Overriding T1 recomputes nothing implicitly;
/// use [`EndpointOption::with_timers`] to keep the derived values
/// consistent.
#[derive(Debug, Clone)]
pub struct EndpointOption {
    pub t1: Duration,
    pub t2: Duration,
    pub t4: Duration,
    /// 64*T1: Timers B, F, H, J, L and M.
    pub t1x64: Duration,
    /// Timer D wait in the INVITE client Completed state (unreliable).
    pub timer_d: Duration,
    /// Granularity of the endpoint timer pump.
    pub timer_interval: Duration,
    /// Absolute retransmission cap for INVITE transactions.
    pub max_invite_retransmits: u32,
    /// Absolute retransmission cap for non-INVITE transactions.
    pub max_retransmits: u32,
    pub max_forwards: u32,
    /// Host part appended to generated Call-IDs.
    pub callid_suffix: Option<String>,
}

impl Default for EndpointOption {
    fn default() -> Self {
        EndpointOption {
            t1: Duration::from_millis(500),
            t2: Duration::from_secs(4),
            t4: Duration::from_secs(5),
            t1x64: Duration::from_millis(500 * 64),
            timer_d: Duration::from_secs(32),
            timer_interval: Duration::from_millis(20),
            max_invite_retransmits: 7,
            max_retransmits: 10,
            max_forwards: 70,
            callid_suffix: None,
        }
    }
}

impl EndpointOption {
    /// Overrides the base timers and recomputes the derived values.
    pub fn with_timers(mut self, t1: Duration, t2: Duration, t4: Duration) -> Self {
        self.t1 = t1;
        self.t2 = t2;
        self.t4 = t4;
        self.t1x64 = t1 * 64;
        self
    }
}

/// Shared state of the endpoint: the transaction table, the timer queue
/// and the transport layer. Transactions hold an `Arc` of this and talk
/// to the tables through it.
pub struct EndpointInner {
    pub user_agent: String,
    pub option: EndpointOption,
    pub timers: TimerQueue<TransactionTimer>,
    pub transport_layer: TransportLayer,
    pub transactions: RwLock<HashMap<TransactionKey, TransactionEventSender>>,
    /// Last message of recently finished transactions, kept to absorb
    /// retransmissions that arrive after termination.
    pub finished_transactions: RwLock<HashMap<TransactionKey, Option<SipMessage>>>,
    incoming_sender: Mutex<Option<UnboundedSender<Transaction>>>,
    /// ACKs for 2xx responses arrive on a fresh branch and match no
    /// transaction; they are surfaced here for dialog-level routing.
    ack_sender: Mutex<Option<UnboundedSender<Request>>>,
    pub cancel_token: tokio_util::sync::CancellationToken,
}

pub type EndpointInnerRef = Arc<EndpointInner>;

const FINISHED_TABLE_LIMIT: usize = 1024;

impl EndpointInner {
    pub fn attach_transaction(&self, key: &TransactionKey, sender: TransactionEventSender) {
        self.transactions
            .write()
            .unwrap()
            .insert(key.clone(), sender);
    }

    /// Removes a terminated transaction from the table. `last_message`
    /// is retained so retransmissions matching the key can be answered
    /// without a live transaction.
    pub fn detach_transaction(&self, key: &TransactionKey, last_message: Option<SipMessage>) {
        self.transactions.write().unwrap().remove(key);
        let mut finished = self.finished_transactions.write().unwrap();
        if finished.len() >= FINISHED_TABLE_LIMIT {
            debug!("finished transaction table full, clearing");
            finished.clear();
        }
        finished.insert(key.clone(), last_message);
    }

    pub fn transaction_count(&self) -> usize {
        self.transactions.read().unwrap().len()
    }

    /// Builds a Via header for a new client transaction, with a fresh
    /// branch carrying the magic cookie.
    pub fn get_via(&self) -> Result<Header> {
        let addr = self.default_addr()?;
        Ok(Header::new(
            "Via",
            format!("SIP/2.0/{} {};branch={}", addr.kind, addr.addr, make_branch()),
        ))
    }

    pub fn default_addr(&self) -> Result<SipAddr> {
        self.transport_layer
            .default_addr()
            .ok_or_else(|| Error::Error("no transport bound".to_string()))
    }

    /// Resolves a Request-URI to a transport destination. The `transport`
    /// URI parameter wins over the default transport kind; SRV lookup is
    /// out of scope, names resolve through the system resolver.
    pub async fn resolve_uri(&self, uri: &Uri) -> Result<SipAddr> {
        let default_kind = self
            .transport_layer
            .default_addr()
            .map(|a| a.kind)
            .unwrap_or(TransportKind::Udp);
        let kind = match uri.param("transport").flatten() {
            Some(t) if t.eq_ignore_ascii_case("tcp") => TransportKind::Tcp,
            Some(t) if t.eq_ignore_ascii_case("udp") => TransportKind::Udp,
            _ => default_kind,
        };
        let port = uri.port.unwrap_or(5060);
        let mut addrs = tokio::net::lookup_host((uri.host.as_str(), port))
            .await
            .map_err(|e| Error::UriError(format!("cannot resolve {}: {e}", uri.host)))?;
        let addr = addrs
            .next()
            .ok_or_else(|| Error::UriError(format!("no address for {}", uri.host)))?;
        Ok(SipAddr { kind, addr })
    }

    /// Sends a request outside of any transaction, e.g. the ACK for a
    /// 2xx response.
    pub async fn send_request(
        &self,
        request: Request,
        connection: Option<SipConnection>,
        destination: Option<SipAddr>,
    ) -> Result<()> {
        let destination = match destination {
            Some(destination) => destination,
            None => self.resolve_uri(&request.uri).await?,
        };
        let connection = match connection {
            Some(connection) => connection,
            None => self.transport_layer.lookup(&destination)?,
        };
        connection.send(request.into(), Some(&destination)).await
    }

    fn on_timer(&self, timer: TransactionTimer) {
        let sender = self.transactions.read().unwrap().get(timer.key()).cloned();
        if let Some(sender) = sender {
            sender.send(TransactionEvent::Timer(timer)).ok();
        }
    }

    async fn on_transport_event(self: &Arc<Self>, event: TransportEvent) -> Result<()> {
        match event {
            TransportEvent::Incoming(msg, connection, from) => {
                self.on_incoming(msg, connection, from).await
            }
            TransportEvent::New(connection) => {
                self.transport_layer.add_connection(connection);
                Ok(())
            }
            TransportEvent::Closed(addr) => {
                debug!("transport closed: {}", addr);
                Ok(())
            }
        }
    }

    async fn on_incoming(
        self: &Arc<Self>,
        msg: SipMessage,
        connection: SipConnection,
        from: SipAddr,
    ) -> Result<()> {
        match msg {
            SipMessage::Response(resp) => {
                let key = TransactionKey::from_response(&resp)?;
                let sender = self.transactions.read().unwrap().get(&key).cloned();
                match sender {
                    Some(sender) => {
                        sender
                            .send(TransactionEvent::Received(resp.into(), Some(connection)))
                            .ok();
                    }
                    None => {
                        // A retransmitted 2xx after the transaction went
                        // away: replay the stored ACK.
                        let stored = self.finished_transactions.read().unwrap().get(&key).cloned();
                        if let Some(Some(SipMessage::Request(ack))) = stored {
                            connection.send(ack.into(), Some(&from)).await.ok();
                        } else {
                            debug!("dropping response without transaction: {}", key);
                        }
                    }
                }
            }
            SipMessage::Request(req) => {
                let key = TransactionKey::from_request(&req, TransactionRole::Server)?;
                let sender = self.transactions.read().unwrap().get(&key).cloned();
                if let Some(sender) = sender {
                    sender
                        .send(TransactionEvent::Received(req.into(), Some(connection)))
                        .ok();
                    return Ok(());
                }
                let stored = self.finished_transactions.read().unwrap().get(&key).cloned();
                match stored {
                    Some(Some(SipMessage::Response(resp))) => {
                        connection.send(resp.into(), Some(&from)).await.ok();
                        return Ok(());
                    }
                    Some(_) => {
                        // Retransmission of a transaction that kept no
                        // replayable message: absorb it.
                        debug!("dropping retransmission of finished transaction {}", key);
                        return Ok(());
                    }
                    None => {}
                }
                match req.method {
                    // ACK never creates a transaction; an ACK for a 2xx
                    // carries a fresh branch and belongs to a dialog.
                    Method::Ack => {
                        let ack = self.ack_sender.lock().unwrap().clone();
                        match ack {
                            Some(ack) => {
                                ack.send(req).ok();
                            }
                            None => debug!("dropping ACK without transaction"),
                        }
                    }
                    Method::Cancel => {
                        let resp = self.make_response(
                            &req,
                            StatusCode::CALL_TRANSACTION_DOES_NOT_EXIST,
                            None,
                        );
                        connection.send(resp.into(), Some(&from)).await.ok();
                    }
                    _ => {
                        let mut tx = Transaction::new_server(key, req, self.clone(), Some(connection));
                        tx.destination = Some(from);
                        let incoming = self.incoming_sender.lock().unwrap().clone();
                        match incoming {
                            Some(incoming) => {
                                incoming.send(tx).ok();
                            }
                            None => {
                                warn!("no transaction user attached, dropping {}", tx.key)
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

/// The transaction manager. Owns the serve loop that pumps timers and
/// routes inbound messages to their transactions by branch.
#[derive(Clone)]
pub struct Endpoint {
    pub inner: EndpointInnerRef,
}

impl Endpoint {
    /// Receiver of newly created server transactions. Requests that do
    /// not match an existing transaction surface here; each carries its
    /// original request in `tx.original`.
    pub fn incoming_transactions(&self) -> UnboundedReceiver<Transaction> {
        let (sender, receiver) = unbounded_channel();
        self.inner.incoming_sender.lock().unwrap().replace(sender);
        receiver
    }

    /// Receiver of ACK requests that matched no transaction (ACKs for
    /// 2xx responses). The dialog layer routes them by dialog id.
    pub fn orphan_acks(&self) -> UnboundedReceiver<Request> {
        let (sender, receiver) = unbounded_channel();
        self.inner.ack_sender.lock().unwrap().replace(sender);
        receiver
    }

    /// Runs the endpoint until cancelled: spawns the transport serve
    /// loops, pumps expired timers and dispatches inbound messages.
    pub async fn serve(&self) -> Result<()> {
        let inner = self.inner.clone();
        let (sender, mut receiver) = unbounded_channel();
        inner.transport_layer.serve_connections(sender);

        let mut ticker = tokio::time::interval(inner.option.timer_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = inner.cancel_token.cancelled() => {
                    info!("endpoint serve loop cancelled");
                    break;
                }
                _ = ticker.tick() => {
                    for timer in inner.timers.drain_expired(Instant::now()) {
                        inner.on_timer(timer);
                    }
                }
                event = receiver.recv() => match event {
                    Some(event) => {
                        if let Err(e) = inner.on_transport_event(event).await {
                            debug!("transport event error: {:?}", e);
                        }
                    }
                    None => break,
                }
            }
        }
        Ok(())
    }

    pub fn shutdown(&self) {
        self.inner.cancel_token.cancel();
    }
}

/// Builder for [`Endpoint`].
///
/// ```rust,no_run
/// use sipkit::transaction::endpoint::EndpointBuilder;
/// use sipkit::transport::TransportLayer;
/// use tokio_util::sync::CancellationToken;
///
/// let token = CancellationToken::new();
/// let transport_layer = TransportLayer::new(token.child_token());
/// let endpoint = EndpointBuilder::new()
///     .with_user_agent("my-app/1.0")
///     .with_transport_layer(transport_layer)
///     .with_cancel_token(token)
///     .build();
/// ```
pub struct EndpointBuilder {
    user_agent: String,
    option: EndpointOption,
    transport_layer: Option<TransportLayer>,
    cancel_token: Option<tokio_util::sync::CancellationToken>,
}

impl EndpointBuilder {
    pub fn new() -> Self {
        EndpointBuilder {
            user_agent: crate::USER_AGENT.to_string(),
            option: EndpointOption::default(),
            transport_layer: None,
            cancel_token: None,
        }
    }

    pub fn with_user_agent(mut self, user_agent: &str) -> Self {
        self.user_agent = user_agent.to_string();
        self
    }

    pub fn with_option(mut self, option: EndpointOption) -> Self {
        self.option = option;
        self
    }

    pub fn with_transport_layer(mut self, transport_layer: TransportLayer) -> Self {
        self.transport_layer = Some(transport_layer);
        self
    }

    pub fn with_cancel_token(mut self, cancel_token: tokio_util::sync::CancellationToken) -> Self {
        self.cancel_token = Some(cancel_token);
        self
    }

    pub fn build(self) -> Endpoint {
        let cancel_token = self.cancel_token.unwrap_or_default();
        let transport_layer = self
            .transport_layer
            .unwrap_or_else(|| TransportLayer::new(cancel_token.child_token()));
        Endpoint {
            inner: Arc::new(EndpointInner {
                user_agent: self.user_agent,
                option: self.option,
                timers: TimerQueue::new(),
                transport_layer,
                transactions: RwLock::new(HashMap::new()),
                finished_transactions: RwLock::new(HashMap::new()),
                incoming_sender: Mutex::new(None),
                ack_sender: Mutex::new(None),
                cancel_token,
            }),
        }
    }
}

impl Default for EndpointBuilder {
    fn default() -> Self {
        Self::new()
    }
}
