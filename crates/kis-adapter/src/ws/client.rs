/*
[INPUT]:  WebSocket URL, approval key source, record schemas, caller subscriptions
[OUTPUT]: Decoded real-time records delivered to subscription tickets
[POS]:    WebSocket layer - connection lifecycle, subscription protocol, dispatch
[UPDATE]: When adding control messages or changing connection/restore logic
*/

use std::borrow::Cow;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::auth::ApprovalKeySource;
use crate::http::client::DEFAULT_CUSTTYPE;
use crate::http::redact::truncate_for_log;
use crate::http::{ErrorClass, KisError, Result, RetryPolicy};
use crate::types::{ConnectionState, Domain, SubscriptionState, TrType, TransactionRequest};
use crate::ws::keyring::{EncryptionKeyring, is_plaintext};
use crate::ws::message::{
    ControlMessage, EventFrame, IncomingMessage, SubscriptionFrame, SubscriptionResult,
};
use crate::ws::registry::{ReleaseOutcome, SubscriptionRegistry};
use crate::ws::schema::{Record, SchemaRegistry};

/// Concurrent subscriptions the provider accepts per session.
pub const MAX_SUBSCRIPTIONS: usize = 40;

const PARSE_FAIL_LOG_LIMIT: usize = 3;
const RAW_LOG_MAX_BYTES: usize = 512;

/// Streaming client configuration
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub max_subscriptions: usize,
    /// Backoff between reconnect attempts
    pub reconnect: RetryPolicy,
    pub connect_timeout: Duration,
    pub custtype: String,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            max_subscriptions: MAX_SUBSCRIPTIONS,
            reconnect: RetryPolicy::reconnect(),
            connect_timeout: Duration::from_secs(10),
            custtype: DEFAULT_CUSTTYPE.to_string(),
        }
    }
}

/// One decoded record for one subscription.
#[derive(Debug, Clone)]
pub struct StreamEvent {
    pub tr: TransactionRequest,
    pub record: Arc<Record>,
}

type EventSender = mpsc::UnboundedSender<StreamEvent>;
type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// State shared by callers and the receive loop. Never held across an `.await`.
#[derive(Debug)]
struct Session {
    registry: SubscriptionRegistry<EventSender>,
    keyring: EncryptionKeyring,
    outbound: Option<mpsc::UnboundedSender<WsMessage>>,
    approval_key: Option<String>,
    generation: u64,
}

impl Session {
    /// Queue a registration frame on the live connection.
    fn send_frame(&self, custtype: &str, tr_type: TrType, tr: &TransactionRequest) -> bool {
        let (Some(outbound), Some(approval_key)) = (&self.outbound, &self.approval_key) else {
            return false;
        };

        let text = match SubscriptionFrame::new(approval_key, custtype, tr_type, tr).to_text() {
            Ok(text) => text,
            Err(err) => {
                warn!(%tr, error = %err, "failed to encode registration frame");
                return false;
            }
        };

        let sent = outbound.send(WsMessage::Text(text.into())).is_ok();
        if sent {
            debug!(%tr, tr_type = tr_type.as_str(), "ws registration queued");
        }
        sent
    }
}

struct Shared {
    domain: Domain,
    url: String,
    approval: Arc<dyn ApprovalKeySource>,
    schemas: Arc<SchemaRegistry>,
    config: StreamConfig,
    session: Mutex<Session>,
    state_tx: watch::Sender<ConnectionState>,
    connecting: tokio::sync::Mutex<()>,
    shutdown: CancellationToken,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    connection: Mutex<Option<JoinHandle<()>>>,
    /// Error that made the supervisor give up
    fatal: Mutex<Option<String>>,
    parse_failures: AtomicUsize,
}

impl Shared {
    fn session(&self) -> MutexGuard<'_, Session> {
        self.session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!(domain = %self.domain, ?previous, ?state, "ws connection state changed");
        }
    }

    fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Start a session on a fresh outbound channel: purge keys, install the
    /// sender and queue SUBSCRIBE for every desired TR under one lock.
    fn begin_session(
        &self,
        approval_key: String,
        outbound: mpsc::UnboundedSender<WsMessage>,
    ) -> (u64, usize) {
        let mut session = self.session();
        session.keyring.clear();
        session.approval_key = Some(approval_key);
        session.outbound = Some(outbound);
        session.generation += 1;

        let replay = session.registry.reset_session();
        for tr in &replay {
            session.send_frame(&self.config.custtype, TrType::Subscribe, tr);
        }
        (session.generation, replay.len())
    }

    /// Tear down session-scoped state if `generation` is still current.
    fn end_session(&self, generation: u64) {
        let mut session = self.session();
        if session.generation != generation {
            return;
        }
        session.outbound = None;
        session.keyring.clear();
        session.registry.on_disconnect();
    }

    fn release(&self, tr: &TransactionRequest, ticket_id: u64) -> bool {
        let mut session = self.session();
        match session.registry.release(tr, ticket_id) {
            ReleaseOutcome::NotFound => false,
            ReleaseOutcome::Decremented { remaining } => {
                debug!(%tr, remaining, "subscription reference released");
                true
            }
            ReleaseOutcome::LastReference => {
                session.keyring.remove(tr);
                let sent = session.send_frame(&self.config.custtype, TrType::Unsubscribe, tr);
                info!(%tr, sent, "last subscription reference released");
                true
            }
        }
    }

    fn handle_text(&self, text: &str) {
        match IncomingMessage::classify(text) {
            Ok(IncomingMessage::Control(message)) => self.handle_control(text, message),
            Ok(IncomingMessage::Event(frame)) => self.handle_event(frame),
            Err(err) => self.log_parse_failure(&err, text),
        }
    }

    /// First few failures per client at warn, every one at debug.
    fn log_parse_failure(&self, err: &KisError, raw: &str) {
        let count = self.parse_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if count <= PARSE_FAIL_LOG_LIMIT {
            warn!(
                domain = %self.domain,
                sample_index = count,
                sample_limit = PARSE_FAIL_LOG_LIMIT,
                error = %err,
                bytes = raw.len(),
                "ws message parse failed"
            );
        }
        debug!(
            domain = %self.domain,
            failures = count,
            error = %err,
            message = %truncate_for_log(raw, RAW_LOG_MAX_BYTES),
            "ws message dropped"
        );
    }

    fn handle_control(&self, raw: &str, message: ControlMessage) {
        if message.is_pingpong() {
            let session = self.session();
            let echoed = session
                .outbound
                .as_ref()
                .is_some_and(|outbound| outbound.send(WsMessage::Text(raw.to_string().into())).is_ok());
            trace!(echoed, "ws pingpong");
            return;
        }

        let Some(result) = message.subscription_result() else {
            debug!(tr_id = %message.header.tr_id, "ws control message without body");
            return;
        };

        let tr = message.tr();
        let mut session = self.session();
        match result {
            SubscriptionResult::Subscribed { key } => {
                if !session.registry.confirm_subscribed(&tr) {
                    return;
                }
                info!(%tr, "ws subscribed");
                if let Some(key) = key
                    && !is_plaintext(&tr.id)
                    && let Err(err) = session.keyring.set(tr.clone(), &key.iv, &key.key)
                {
                    warn!(%tr, error = %err, "discarding invalid channel key");
                }
            }
            SubscriptionResult::Unsubscribed => {
                if session.registry.confirm_unsubscribed(&tr) {
                    info!(%tr, "ws unsubscribed");
                }
            }
            SubscriptionResult::Rejected { msg_cd, message } => {
                session.registry.reject(&tr);
                warn!(%tr, %msg_cd, %message, "ws registration rejected");
            }
            SubscriptionResult::Other(message) => {
                debug!(%tr, %message, "ws control message ignored");
            }
        }
    }

    fn handle_event(&self, frame: EventFrame<'_>) {
        let Some(schema) = self.schemas.get(frame.tr_id) else {
            trace!(tr_id = frame.tr_id, "no schema registered, dropping frame");
            return;
        };

        let payload: Cow<'_, str> = if frame.encrypted && !is_plaintext(frame.tr_id) {
            let key = self.session().keyring.find_by_id(frame.tr_id).cloned();
            let Some(key) = key else {
                trace!(tr_id = frame.tr_id, "no channel key yet, dropping frame");
                return;
            };
            match key.decrypt(frame.payload) {
                Ok(plaintext) => Cow::Owned(plaintext),
                Err(err) => {
                    warn!(tr_id = frame.tr_id, error = %err, "dropping undecryptable frame");
                    return;
                }
            }
        } else {
            Cow::Borrowed(frame.payload)
        };

        let records = match schema.decode_payload(&payload, frame.count) {
            Ok(records) => records,
            Err(err) => {
                warn!(tr_id = frame.tr_id, error = %err, "dropping undecodable frame");
                return;
            }
        };

        let targets = self.session().registry.handlers_for_id(frame.tr_id);
        if targets.is_empty() {
            return;
        }

        for record in records {
            let record = Arc::new(record);
            let record_key = schema.key_of(&record);
            for (tr, sender) in &targets {
                if let Some(record_key) = record_key
                    && !tr.key.is_empty()
                    && tr.key != record_key
                {
                    continue;
                }
                let _ = sender.send(StreamEvent {
                    tr: tr.clone(),
                    record: Arc::clone(&record),
                });
            }
        }
    }
}

/// Streaming client for one domain's WebSocket endpoint.
///
/// Nothing connects until [`KisWebSocket::start`] (supervised, reconnecting)
/// or [`KisWebSocket::connect`] (single attempt) is called. Subscriptions made
/// before that are queued and sent once a session opens. The background tasks
/// run until [`KisWebSocket::stop`].
#[derive(Clone)]
pub struct KisWebSocket {
    shared: Arc<Shared>,
}

impl KisWebSocket {
    pub fn new(
        domain: Domain,
        url: impl Into<String>,
        approval: Arc<dyn ApprovalKeySource>,
        schemas: Arc<SchemaRegistry>,
        config: StreamConfig,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let session = Session {
            registry: SubscriptionRegistry::new(config.max_subscriptions),
            keyring: EncryptionKeyring::new(),
            outbound: None,
            approval_key: None,
            generation: 0,
        };

        Self {
            shared: Arc::new(Shared {
                domain,
                url: url.into(),
                approval,
                schemas,
                config,
                session: Mutex::new(session),
                state_tx,
                connecting: tokio::sync::Mutex::new(()),
                shutdown: CancellationToken::new(),
                supervisor: Mutex::new(None),
                connection: Mutex::new(None),
                fatal: Mutex::new(None),
                parse_failures: AtomicUsize::new(0),
            }),
        }
    }

    pub fn domain(&self) -> Domain {
        self.shared.domain
    }

    pub fn url(&self) -> &str {
        &self.shared.url
    }

    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.state() == ConnectionState::Connected
    }

    /// Spawn the supervisor that keeps a session open and reconnects with
    /// backoff. Returns false if already running or stopped. Configuration
    /// and authentication failures end the supervisor; see `fatal_error`.
    pub fn start(&self) -> bool {
        if self.shared.shutdown.is_cancelled() {
            return false;
        }
        let mut supervisor = lock(&self.shared.supervisor);
        if supervisor.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return false;
        }
        lock(&self.shared.fatal).take();
        *supervisor = Some(tokio::spawn(supervise(self.clone())));
        info!(domain = %self.shared.domain, url = %self.shared.url, "ws supervisor started");
        true
    }

    /// Error that stopped the supervisor from reconnecting, such as missing
    /// credentials or a rejected approval key. Cleared by the next `start`.
    pub fn fatal_error(&self) -> Option<String> {
        lock(&self.shared.fatal).clone()
    }

    /// Close the session and stop reconnecting. A stopped client stays stopped.
    pub async fn stop(&self) {
        self.shared.shutdown.cancel();
        {
            let mut session = self.shared.session();
            session.outbound = None;
            session.keyring.clear();
            session.registry.on_disconnect();
        }

        let supervisor = lock(&self.shared.supervisor).take();
        if let Some(handle) = supervisor {
            let _ = handle.await;
        }
        let connection = lock(&self.shared.connection).take();
        if let Some(handle) = connection {
            let _ = handle.await;
        }

        self.shared.set_state(ConnectionState::Disconnected);
        info!(domain = %self.shared.domain, "ws client stopped");
    }

    /// One connection attempt. `Ok(false)` when another attempt is in flight,
    /// a session is already open, or the client was stopped.
    pub async fn connect(&self) -> Result<bool> {
        let Ok(_attempt) = self.shared.connecting.try_lock() else {
            return Ok(false);
        };
        if self.is_connected() || self.shared.shutdown.is_cancelled() {
            return Ok(false);
        }

        self.shared.set_state(ConnectionState::Connecting);
        match self.open().await {
            Ok(()) => Ok(true),
            Err(err) => {
                self.shared.set_state(ConnectionState::Disconnected);
                Err(err)
            }
        }
    }

    async fn open(&self) -> Result<()> {
        let shared = &self.shared;
        let approval_key = shared.approval.approval_key(shared.domain).await?;

        let (stream, _response) =
            tokio::time::timeout(shared.config.connect_timeout, connect_async(shared.url.as_str()))
                .await
                .map_err(|_| KisError::WebSocket(format!("connect to {} timed out", shared.url)))?
                .map_err(|err| KisError::WebSocket(err.to_string()))?;
        if shared.shutdown.is_cancelled() {
            return Err(KisError::NotConnected);
        }

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (generation, replayed) = shared.begin_session(approval_key, outbound_tx);
        shared.set_state(ConnectionState::Connected);
        info!(domain = %shared.domain, url = %shared.url, replayed, "ws connected");

        let handle = tokio::spawn(run_connection(
            Arc::clone(shared),
            stream,
            outbound_rx,
            generation,
        ));
        if let Some(previous) = lock(&shared.connection).replace(handle) {
            previous.abort();
        }
        Ok(())
    }

    /// Add a reference to `(tr_id, tr_key)`. Only the first reference sends a
    /// SUBSCRIBE; fails with `SubscriptionLimit` when the cap is reached.
    pub fn subscribe(&self, tr_id: &str, tr_key: &str) -> Result<Ticket> {
        let tr = TransactionRequest::new(tr_id, tr_key);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let outcome = {
            let mut session = self.shared.session();
            let outcome = session.registry.subscribe(tr.clone(), events_tx)?;
            if outcome.send_subscribe {
                let sent = session.send_frame(&self.shared.config.custtype, TrType::Subscribe, &tr);
                debug!(%tr, sent, "subscription requested");
            }
            outcome
        };

        Ok(Ticket {
            id: outcome.ticket_id,
            tr,
            released: AtomicBool::new(false),
            client: Arc::downgrade(&self.shared),
            events: events_rx,
        })
    }

    pub fn unsubscribe(&self, ticket: &Ticket) -> bool {
        ticket.release()
    }

    /// Queue a raw registration frame. False when no session is open.
    pub fn send(&self, tr: &TransactionRequest, tr_type: TrType) -> bool {
        self.shared
            .session()
            .send_frame(&self.shared.config.custtype, tr_type, tr)
    }

    pub fn subscription_state(&self, tr: &TransactionRequest) -> SubscriptionState {
        self.shared.session().registry.state(tr)
    }

    pub fn refcount(&self, tr: &TransactionRequest) -> usize {
        self.shared.session().registry.refcount(tr)
    }

    pub fn subscriptions(&self) -> Vec<TransactionRequest> {
        self.shared.session().registry.desired()
    }

    #[cfg(test)]
    fn attach(&self, approval_key: &str) -> (u64, mpsc::UnboundedReceiver<WsMessage>) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (generation, _) = self.shared.begin_session(approval_key.to_string(), outbound_tx);
        self.shared.set_state(ConnectionState::Connected);
        (generation, outbound_rx)
    }
}

impl fmt::Debug for KisWebSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KisWebSocket")
            .field("domain", &self.shared.domain)
            .field("url", &self.shared.url)
            .field("state", &self.shared.state())
            .finish_non_exhaustive()
    }
}

/// Handle for one subscription reference. Events for the TR arrive on it
/// until it is released.
pub struct Ticket {
    id: u64,
    tr: TransactionRequest,
    released: AtomicBool,
    client: Weak<Shared>,
    events: mpsc::UnboundedReceiver<StreamEvent>,
}

impl Ticket {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn tr(&self) -> &TransactionRequest {
        &self.tr
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Next event. `None` once released and drained.
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.events.recv().await
    }

    pub fn try_recv(&mut self) -> Option<StreamEvent> {
        self.events.try_recv().ok()
    }

    /// Drop this reference. Returns false if it was already released.
    pub fn release(&self) -> bool {
        if self.released.swap(true, Ordering::AcqRel) {
            return false;
        }
        match self.client.upgrade() {
            Some(shared) => shared.release(&self.tr, self.id),
            None => false,
        }
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        if !self.is_released() {
            debug!(tr = %self.tr, ticket = self.id, "ticket dropped without release");
            self.release();
        }
    }
}

impl fmt::Debug for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ticket")
            .field("id", &self.id)
            .field("tr", &self.tr)
            .field("released", &self.is_released())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn run_connection(
    shared: Arc<Shared>,
    stream: WsStream,
    mut outbound_rx: mpsc::UnboundedReceiver<WsMessage>,
    generation: u64,
) {
    let (mut write, mut read) = stream.split();

    loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => {
                let _ = write.send(WsMessage::Close(None)).await;
                break;
            }
            outbound = outbound_rx.recv() => {
                match outbound {
                    Some(message) => {
                        if let Err(err) = write.send(message).await {
                            warn!(domain = %shared.domain, error = %err, "ws write failed");
                            break;
                        }
                    }
                    None => {
                        let _ = write.send(WsMessage::Close(None)).await;
                        break;
                    }
                }
            }
            incoming = read.next() => {
                match incoming {
                    Some(Ok(WsMessage::Text(text))) => shared.handle_text(text.as_str()),
                    Some(Ok(WsMessage::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                        Ok(text) => shared.handle_text(text),
                        Err(_) => debug!(bytes = bytes.len(), "ignoring non-UTF-8 binary frame"),
                    },
                    Some(Ok(WsMessage::Close(frame))) => {
                        info!(domain = %shared.domain, ?frame, "ws closed by server");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!(domain = %shared.domain, error = %err, "ws read failed");
                        break;
                    }
                    None => {
                        info!(domain = %shared.domain, "ws stream ended");
                        break;
                    }
                }
            }
        }
    }

    shared.end_session(generation);
    shared.set_state(ConnectionState::Disconnected);
}

async fn supervise(client: KisWebSocket) {
    let shared = Arc::clone(&client.shared);
    let mut state_rx = shared.state_tx.subscribe();
    let mut failures: u32 = 0;

    loop {
        if shared.shutdown.is_cancelled() {
            break;
        }

        match client.connect().await {
            Ok(true) => failures = 0,
            Ok(false) => {}
            Err(_) if shared.shutdown.is_cancelled() => break,
            Err(err) if RetryPolicy::classify(&err) == ErrorClass::Fatal => {
                error!(domain = %shared.domain, error = %err, "ws connect failed, not retrying");
                *lock(&shared.fatal) = Some(err.to_string());
                shared.set_state(ConnectionState::Disconnected);
                break;
            }
            Err(err) => {
                failures = failures.saturating_add(1);
                warn!(domain = %shared.domain, attempt = failures, error = %err, "ws connect failed");
            }
        }

        if client.is_connected() {
            tokio::select! {
                _ = shared.shutdown.cancelled() => break,
                _ = wait_disconnected(&mut state_rx) => {}
            }
            failures = failures.max(1);
        }

        if shared.shutdown.is_cancelled() {
            break;
        }
        if shared.config.reconnect.is_exhausted(failures) {
            warn!(domain = %shared.domain, attempts = failures, "ws reconnect attempts exhausted");
            break;
        }

        if shared.state() == ConnectionState::Disconnected {
            shared.set_state(ConnectionState::Reconnecting);
        }
        let delay = shared.config.reconnect.delay(failures.max(1));
        info!(domain = %shared.domain, ?delay, "ws reconnecting");
        tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

async fn wait_disconnected(state_rx: &mut watch::Receiver<ConnectionState>) {
    while *state_rx.borrow_and_update() == ConnectionState::Connected {
        if state_rx.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticApprovalKey;
    use crate::ws::keyring::tests::{TEST_IV, TEST_KEY, encrypt};
    use crate::ws::schema::{FieldSpec, FieldValue, RecordSchema};

    fn schemas() -> Arc<SchemaRegistry> {
        Arc::new(
            SchemaRegistry::new()
                .with(
                    RecordSchema::new(
                        "H0STCNT0",
                        vec![
                            FieldSpec::text("MKSC_SHRN_ISCD"),
                            FieldSpec::text("STCK_CNTG_HOUR"),
                            FieldSpec::integer("STCK_PRPR"),
                        ],
                    )
                    .with_key_field("MKSC_SHRN_ISCD"),
                )
                .with(RecordSchema::new(
                    "H0STCNI0",
                    vec![FieldSpec::text("CUST_ID"), FieldSpec::text("ODER_NO")],
                )),
        )
    }

    fn client() -> KisWebSocket {
        KisWebSocket::new(
            Domain::Real,
            "ws://127.0.0.1:1",
            Arc::new(StaticApprovalKey::new("approval")),
            schemas(),
            StreamConfig::default(),
        )
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<WsMessage>) -> Vec<serde_json::Value> {
        let mut frames = Vec::new();
        while let Ok(message) = rx.try_recv() {
            if let WsMessage::Text(text) = message {
                frames.push(serde_json::from_str(text.as_str()).unwrap());
            }
        }
        frames
    }

    fn frame_summary(frame: &serde_json::Value) -> (String, String, String) {
        (
            frame["header"]["tr_type"].as_str().unwrap().to_string(),
            frame["body"]["input"]["tr_id"].as_str().unwrap().to_string(),
            frame["body"]["input"]["tr_key"].as_str().unwrap().to_string(),
        )
    }

    fn subscribe_success(tr_id: &str, tr_key: &str, with_key: bool) -> String {
        let output = if with_key {
            format!(r#","output":{{"iv":"{TEST_IV}","key":"{TEST_KEY}"}}"#)
        } else {
            String::new()
        };
        format!(
            r#"{{"header":{{"tr_id":"{tr_id}","tr_key":"{tr_key}","encrypt":"N"}},"body":{{"rt_cd":"0","msg_cd":"OPSP0000","msg1":"SUBSCRIBE SUCCESS"{output}}}}}"#
        )
    }

    #[tokio::test]
    async fn test_refcounted_subscription_frames() {
        let ws = client();
        let (_, mut outbound) = ws.attach("approval");
        let tr = TransactionRequest::new("H0STCNT0", "005930");

        let first = ws.subscribe("H0STCNT0", "005930").unwrap();
        let second = ws.subscribe("H0STCNT0", "005930").unwrap();
        let frames = drain(&mut outbound);
        assert_eq!(frames.len(), 1);
        assert_eq!(
            frame_summary(&frames[0]),
            ("1".to_string(), "H0STCNT0".to_string(), "005930".to_string())
        );
        assert_eq!(frames[0]["header"]["approval_key"], "approval");

        assert!(first.release());
        assert!(drain(&mut outbound).is_empty());
        assert_eq!(ws.refcount(&tr), 1);
        assert_eq!(ws.subscriptions(), vec![tr.clone()]);

        assert!(ws.unsubscribe(&second));
        let frames = drain(&mut outbound);
        assert_eq!(frames.len(), 1);
        assert_eq!(frame_summary(&frames[0]).0, "2");
        assert!(ws.subscriptions().is_empty());

        assert!(!second.release());
        assert!(drain(&mut outbound).is_empty());
    }

    #[tokio::test]
    async fn test_pingpong_echoed_verbatim() {
        let ws = client();
        let (_, mut outbound) = ws.attach("approval");

        let ping = r#"{"header":{"tr_id":"PINGPONG"}}"#;
        ws.shared.handle_text(ping);

        match outbound.try_recv() {
            Ok(WsMessage::Text(text)) => assert_eq!(text.as_str(), ping),
            other => panic!("expected echoed frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_send_before_connect_returns_false() {
        let ws = client();
        let tr = TransactionRequest::new("H0STCNT0", "005930");
        assert!(!ws.send(&tr, TrType::Subscribe));
        assert!(!ws.is_connected());

        let ticket = ws.subscribe("H0STCNT0", "005930").unwrap();
        assert_eq!(ws.subscription_state(&tr), SubscriptionState::PendingSubscribe);

        let (_, mut outbound) = ws.attach("approval");
        let frames = drain(&mut outbound);
        assert_eq!(frames.len(), 1);
        assert!(ws.send(&tr, TrType::Subscribe));
        drop(ticket);
    }

    #[tokio::test]
    async fn test_plaintext_event_dispatch_filters_by_key() {
        let ws = client();
        let _session = ws.attach("approval");
        let mut samsung = ws.subscribe("H0STCNT0", "005930").unwrap();
        let mut hynix = ws.subscribe("H0STCNT0", "000660").unwrap();

        ws.shared
            .handle_text("0|H0STCNT0|002|005930^093000^71000^000660^093000^180000");

        let event = samsung.try_recv().unwrap();
        assert_eq!(event.tr, TransactionRequest::new("H0STCNT0", "005930"));
        assert_eq!(event.record.get("STCK_PRPR"), Some(&FieldValue::Integer(71000)));
        assert!(samsung.try_recv().is_none());

        let event = hynix.try_recv().unwrap();
        assert_eq!(event.record.text("MKSC_SHRN_ISCD"), Some("000660"));
    }

    #[tokio::test]
    async fn test_encrypted_frames_need_a_key() {
        let ws = client();
        let _session = ws.attach("approval");
        let mut ticket = ws.subscribe("H0STCNT0", "005930").unwrap();
        let ciphertext = encrypt(TEST_IV, TEST_KEY, "005930^093000^71000");
        let frame = format!("1|H0STCNT0|001|{ciphertext}");

        ws.shared.handle_text(&frame);
        assert!(ticket.try_recv().is_none());

        ws.shared.handle_text(&subscribe_success("H0STCNT0", "005930", true));
        assert_eq!(
            ws.subscription_state(ticket.tr()),
            SubscriptionState::Subscribed
        );

        ws.shared.handle_text(&frame);
        let event = ticket.try_recv().unwrap();
        assert_eq!(event.record.get("STCK_PRPR"), Some(&FieldValue::Integer(71000)));
    }

    #[tokio::test]
    async fn test_execution_notice_is_always_plaintext() {
        let ws = client();
        let _session = ws.attach("approval");
        let mut ticket = ws.subscribe("H0STCNI0", "hts01").unwrap();
        ws.shared.handle_text(&subscribe_success("H0STCNI0", "hts01", true));

        ws.shared.handle_text("1|H0STCNI0|001|hts01^0000012345");
        let event = ticket.try_recv().unwrap();
        assert_eq!(event.record.text("ODER_NO"), Some("0000012345"));
    }

    #[tokio::test]
    async fn test_malformed_and_unknown_frames_are_dropped() {
        let ws = client();
        let (_, mut outbound) = ws.attach("approval");
        let mut ticket = ws.subscribe("H0STCNT0", "005930").unwrap();
        drain(&mut outbound);

        ws.shared.handle_text("garbage");
        ws.shared.handle_text("{not json");
        ws.shared.handle_text("0|H0STCNT0|xyz|a^b");
        ws.shared.handle_text("0|H0STASP0|001|005930^1^2");
        ws.shared.handle_text(&subscribe_success("H0STASP0", "005930", false));

        assert!(ticket.try_recv().is_none());
        assert!(ws.is_connected());
        assert!(drain(&mut outbound).is_empty());
    }

    #[tokio::test]
    async fn test_reconnect_replays_desired_set_and_purges_keys() {
        let ws = client();
        let (generation, mut outbound) = ws.attach("approval");
        let samsung = ws.subscribe("H0STCNT0", "005930").unwrap();
        let _samsung_again = ws.subscribe("H0STCNT0", "005930").unwrap();
        let hynix = ws.subscribe("H0STCNT0", "000660").unwrap();
        let released = ws.subscribe("H0STASP0", "005930").unwrap();
        released.release();
        ws.shared.handle_text(&subscribe_success("H0STCNT0", "005930", true));
        assert_eq!(ws.shared.session().keyring.len(), 1);
        drain(&mut outbound);

        ws.shared.end_session(generation);
        ws.shared.set_state(ConnectionState::Disconnected);
        assert!(ws.shared.session().keyring.is_empty());
        assert_eq!(ws.subscription_state(samsung.tr()), SubscriptionState::Unsubscribed);

        let (_, mut outbound) = ws.attach("approval-2");
        assert!(ws.shared.session().keyring.is_empty());
        let mut replayed: Vec<_> = drain(&mut outbound).iter().map(frame_summary).collect();
        replayed.sort();
        assert_eq!(
            replayed,
            vec![
                ("1".to_string(), "H0STCNT0".to_string(), "000660".to_string()),
                ("1".to_string(), "H0STCNT0".to_string(), "005930".to_string()),
            ]
        );
        assert_eq!(ws.subscription_state(hynix.tr()), SubscriptionState::PendingSubscribe);
    }

    #[tokio::test]
    async fn test_stale_session_end_is_ignored() {
        let ws = client();
        let (old_generation, _old) = ws.attach("approval");
        let (_, _current) = ws.attach("approval");

        ws.shared.end_session(old_generation);
        assert!(ws.send(&TransactionRequest::new("H0STCNT0", "005930"), TrType::Subscribe));
    }

    #[tokio::test]
    async fn test_subscription_limit() {
        let ws = KisWebSocket::new(
            Domain::Virtual,
            "ws://127.0.0.1:1",
            Arc::new(StaticApprovalKey::new("approval")),
            schemas(),
            StreamConfig {
                max_subscriptions: 1,
                ..StreamConfig::default()
            },
        );

        let _first = ws.subscribe("H0STCNT0", "005930").unwrap();
        assert!(matches!(
            ws.subscribe("H0STCNT0", "000660"),
            Err(KisError::SubscriptionLimit { limit: 1 })
        ));
        assert_eq!(ws.subscriptions().len(), 1);
    }

    #[tokio::test]
    async fn test_dropped_ticket_releases_reference() {
        let ws = client();
        let tr = TransactionRequest::new("H0STCNT0", "005930");
        {
            let _ticket = ws.subscribe("H0STCNT0", "005930").unwrap();
            assert_eq!(ws.refcount(&tr), 1);
        }
        assert_eq!(ws.refcount(&tr), 0);
    }

    #[tokio::test]
    async fn test_released_ticket_stream_ends() {
        let ws = client();
        let mut ticket = ws.subscribe("H0STCNT0", "005930").unwrap();
        ticket.release();
        assert!(ticket.recv().await.is_none());
    }

    struct FailingApproval {
        calls: AtomicUsize,
        error: fn() -> KisError,
    }

    #[async_trait::async_trait]
    impl ApprovalKeySource for FailingApproval {
        async fn approval_key(&self, _domain: Domain) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err((self.error)())
        }
    }

    fn failing_client(error: fn() -> KisError) -> (KisWebSocket, Arc<FailingApproval>) {
        let approval = Arc::new(FailingApproval {
            calls: AtomicUsize::new(0),
            error,
        });
        let config = StreamConfig {
            reconnect: RetryPolicy::reconnect()
                .with_base_delay(Duration::from_millis(10))
                .with_max_delay(Duration::from_millis(10))
                .with_jitter(0.0),
            ..StreamConfig::default()
        };
        let ws = KisWebSocket::new(
            Domain::Real,
            "ws://127.0.0.1:1",
            approval.clone(),
            schemas(),
            config,
        );
        (ws, approval)
    }

    #[rstest::rstest]
    #[case::missing_credentials(|| KisError::Config("no app key for the real domain".into()))]
    #[case::approval_rejected(|| KisError::Authentication { message: "approval key rejected".into() })]
    #[tokio::test]
    async fn test_fatal_connect_error_stops_supervisor(#[case] error: fn() -> KisError) {
        let (ws, approval) = failing_client(error);
        assert!(ws.start());

        let supervisor = lock(&ws.shared.supervisor).take().unwrap();
        tokio::time::timeout(Duration::from_secs(2), supervisor)
            .await
            .expect("supervisor kept retrying")
            .unwrap();

        assert_eq!(approval.calls.load(Ordering::SeqCst), 1);
        assert_eq!(ws.state(), ConnectionState::Disconnected);
        assert_eq!(ws.fatal_error(), Some(error().to_string()));

        // A finished supervisor can be started again.
        assert!(ws.start());
        let supervisor = lock(&ws.shared.supervisor).take().unwrap();
        tokio::time::timeout(Duration::from_secs(2), supervisor)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(approval.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_transient_connect_error_keeps_retrying() {
        let (ws, approval) = failing_client(|| KisError::Server {
            status: 503,
            body: "Service Unavailable".into(),
        });
        assert!(ws.start());

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(approval.calls.load(Ordering::SeqCst) >= 3);
        assert!(ws.fatal_error().is_none());
        assert!(!ws.start());

        ws.stop().await;
        assert_eq!(ws.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_parse_failures_are_counted_per_client() {
        let first = client();
        let second = client();
        for _ in 0..5 {
            first.shared.handle_text("garbage");
        }
        second.shared.handle_text("garbage");

        assert_eq!(first.shared.parse_failures.load(Ordering::Relaxed), 5);
        assert_eq!(second.shared.parse_failures.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_stop_prevents_start() {
        let ws = client();
        ws.stop().await;
        assert!(!ws.start());
        assert!(!ws.connect().await.unwrap());
        assert_eq!(ws.state(), ConnectionState::Disconnected);
    }
}
