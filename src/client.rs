//! The client instance: construction, configuration, commands and dispatch.
//!
//! A [`Client`] owns one logical MQTT session. Command operations (publish,
//! subscribe, unsubscribe, disconnect) are cheap and thread-safe: they
//! validate, allocate a message id under the session lock and enqueue an
//! encoded request for the network loop, which is the only place that
//! touches the socket. That split is what makes a publish issued from
//! another thread - or re-entrantly from inside a hook - safe while the
//! loop is mid-step.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use rumqttc::mqttbytes::v4::{
    Connect, LastWill, Login, Packet, Publish, Subscribe, SubscribeFilter, Unsubscribe,
};
use rumqttc::mqttbytes::{Protocol, QoS};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backoff::ReconnectPolicy;
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::eventloop::{Driver, Request};
use crate::library::{self, InstanceGuard};
use crate::observer::{
    CallbackTable, ClientObserver, ConnectAck, DisconnectEvent, EventKind, IntoEventKind,
    LogLevel, Message,
};
use crate::options::{ConnectTarget, Credentials, ProtocolVersion, SessionOptions, TlsOptions};
use crate::session::{InFlight, Session};
use crate::state::{log_transition, ConnectionState};
use crate::topic;
use crate::transport::{Connector, SocketHandle, TcpConnector};

pub(crate) struct Core {
    pub(crate) opts: Mutex<SessionOptions>,
    pub(crate) session: Mutex<Session>,
    pub(crate) callbacks: CallbackTable,
    state_tx: watch::Sender<ConnectionState>,
    requests_tx: mpsc::UnboundedSender<Request>,
    pub(crate) queued: AtomicUsize,
    pub(crate) driver: tokio::sync::Mutex<Driver>,
    /// Connection established by `connect()`/`reconnect()`, waiting for the
    /// loop driver to adopt it.
    pub(crate) incoming: Mutex<Option<Connection>>,
    /// Target for a fully deferred (async-connect) dial.
    pub(crate) pending_dial: Mutex<Option<ConnectTarget>>,
    /// Last explicit connect target, reused by the reconnect family.
    pub(crate) target: Mutex<Option<ConnectTarget>>,
    pub(crate) reconnect: Mutex<ReconnectPolicy>,
    connector: Mutex<Arc<dyn Connector>>,
    pub(crate) shutdown_tx: watch::Sender<bool>,
    loop_task: Mutex<Option<JoinHandle<Result<()>>>>,
    pub(crate) socket_fd: Mutex<Option<SocketHandle>>,
    destroyed: AtomicBool,
    lib_guard: InstanceGuard,
}

impl Core {
    pub(crate) fn ensure_alive(&self) -> Result<()> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(Error::Destroyed);
        }
        Ok(())
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.state_tx.borrow().clone()
    }

    pub(crate) fn transition(&self, next: ConnectionState) {
        let previous = self.state_tx.send_replace(next.clone());
        if previous != next {
            log_transition(&previous, &next);
        }
    }

    fn enqueue_request(&self, request: Request) {
        // The receiver lives as long as the core, so this cannot fail.
        if self.requests_tx.send(request).is_ok() {
            self.queued.fetch_add(1, Ordering::SeqCst);
        }
    }

    // ---- commands ------------------------------------------------------

    pub(crate) fn publish(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        qos: QoS,
        retain: bool,
    ) -> Result<u16> {
        self.ensure_alive()?;
        topic::validate_topic(topic)?;
        let payload = payload.into();
        let limit = self.opts.lock().expect("options poisoned").max_packet_size;
        if payload.len() > limit {
            return Err(Error::PayloadTooLarge {
                size: payload.len(),
                limit,
            });
        }
        if !self.state().accepts_commands() {
            return Err(Error::NoConnection);
        }

        let in_flight = match qos {
            QoS::AtMostOnce => None,
            QoS::AtLeastOnce => Some(InFlight::PublishQos1),
            QoS::ExactlyOnce => Some(InFlight::PublishAwaitingRec),
        };
        let mid = self.session.lock().expect("session poisoned").alloc(in_flight)?;

        let packet = Publish {
            dup: false,
            qos,
            retain,
            topic: topic.to_string(),
            // QoS 0 packets carry no id on the wire; `mid` still correlates
            // the local publish-ack hook.
            pkid: if qos == QoS::AtMostOnce { 0 } else { mid },
            payload,
        };
        self.enqueue_request(Request::Publish { mid, packet });
        debug!(mid, topic, ?qos, retain, "queued publish");
        Ok(mid)
    }

    pub(crate) fn subscribe(&self, filter: &str, qos: QoS) -> Result<u16> {
        self.ensure_alive()?;
        topic::validate_filter(filter)?;
        if !self.state().accepts_commands() {
            return Err(Error::NoConnection);
        }
        let mid = self
            .session
            .lock()
            .expect("session poisoned")
            .alloc(Some(InFlight::Subscribe))?;
        let packet = Subscribe {
            pkid: mid,
            filters: vec![SubscribeFilter {
                path: filter.to_string(),
                qos,
            }],
        };
        self.enqueue_request(Request::Subscribe { packet });
        debug!(mid, filter, ?qos, "queued subscribe");
        Ok(mid)
    }

    pub(crate) fn unsubscribe(&self, filter: &str) -> Result<u16> {
        self.ensure_alive()?;
        topic::validate_filter(filter)?;
        if !self.state().accepts_commands() {
            return Err(Error::NoConnection);
        }
        let mid = self
            .session
            .lock()
            .expect("session poisoned")
            .alloc(Some(InFlight::Unsubscribe))?;
        let packet = Unsubscribe {
            pkid: mid,
            topics: vec![filter.to_string()],
        };
        self.enqueue_request(Request::Unsubscribe { packet });
        debug!(mid, filter, "queued unsubscribe");
        Ok(mid)
    }

    pub(crate) fn disconnect(&self) -> Result<()> {
        self.ensure_alive()?;
        match self.state() {
            ConnectionState::Disconnected | ConnectionState::Reconnecting(_) => {
                Err(Error::NoConnection)
            }
            ConnectionState::Disconnecting => Ok(()),
            ConnectionState::Connecting | ConnectionState::Connected => {
                self.transition(ConnectionState::Disconnecting);
                self.enqueue_request(Request::Disconnect);
                Ok(())
            }
        }
    }

    // ---- connection establishment --------------------------------------

    /// Open a stream to `target` and send CONNECT over it.
    pub(crate) async fn dial(&self, target: &ConnectTarget) -> Result<Connection> {
        let opts = self.opts.lock().expect("options poisoned").clone();
        if opts.protocol_version == ProtocolVersion::V31 {
            return Err(Error::NotSupported(
                "the wire codec speaks MQTT 3.1.1 only; select the mqttv311 protocol version",
            ));
        }

        let connector = self.connector.lock().expect("connector poisoned").clone();
        let stream = connector
            .connect(&target.host, target.port, opts.tls.as_ref())
            .await?;
        let mut conn = Connection::new(stream, target.keep_alive, opts.max_packet_size);

        let connect = Connect {
            protocol: Protocol::V4,
            keep_alive: target.keep_alive,
            client_id: opts.client_id.clone().unwrap_or_default(),
            clean_session: opts.clean_session,
            last_will: opts.will.as_ref().map(|will| LastWill {
                topic: will.topic.clone(),
                message: will.payload.clone(),
                qos: will.qos,
                retain: will.retain,
            }),
            login: opts.credentials.as_ref().map(|creds| Login {
                username: creds.username.clone(),
                password: creds.password.clone().unwrap_or_default(),
            }),
        };
        conn.enqueue(&Packet::Connect(connect))?;
        conn.flush().await?;
        self.emit_log(
            LogLevel::Info,
            &format!("sending CONNECT to {}:{}", target.host, target.port),
        );
        Ok(conn)
    }

    fn stage_connection(&self, conn: Connection) {
        *self.socket_fd.lock().expect("socket handle poisoned") = conn.socket_handle();
        *self.incoming.lock().expect("incoming slot poisoned") = Some(conn);
    }

    pub(crate) async fn connect(&self, host: &str, port: u16, keep_alive: u16) -> Result<()> {
        self.ensure_alive()?;
        let target = ConnectTarget::new(host, port, keep_alive)?;
        *self.target.lock().expect("target poisoned") = Some(target.clone());
        self.pending_dial.lock().expect("pending dial poisoned").take();

        self.transition(ConnectionState::Connecting);
        match self.dial(&target).await {
            Ok(conn) => {
                self.stage_connection(conn);
                Ok(())
            }
            Err(err) => {
                self.transition(ConnectionState::Disconnected);
                Err(err)
            }
        }
    }

    pub(crate) fn connect_async(&self, host: &str, port: u16, keep_alive: u16) -> Result<()> {
        self.ensure_alive()?;
        let target = ConnectTarget::new(host, port, keep_alive)?;
        *self.target.lock().expect("target poisoned") = Some(target.clone());
        *self.pending_dial.lock().expect("pending dial poisoned") = Some(target);
        self.transition(ConnectionState::Connecting);
        Ok(())
    }

    fn last_target(&self) -> Result<ConnectTarget> {
        self.target
            .lock()
            .expect("target poisoned")
            .clone()
            .ok_or_else(|| Error::invalid("reconnect requires a previous connect"))
    }

    pub(crate) async fn reconnect(&self) -> Result<()> {
        self.ensure_alive()?;
        let target = self.last_target()?;
        self.transition(ConnectionState::Connecting);
        match self.dial(&target).await {
            Ok(conn) => {
                self.stage_connection(conn);
                Ok(())
            }
            Err(err) => {
                self.transition(ConnectionState::Disconnected);
                Err(err)
            }
        }
    }

    pub(crate) fn reconnect_async(&self) -> Result<()> {
        self.ensure_alive()?;
        let target = self.last_target()?;
        *self.pending_dial.lock().expect("pending dial poisoned") = Some(target);
        self.transition(ConnectionState::Connecting);
        Ok(())
    }

    // ---- teardown ------------------------------------------------------

    fn halt_loop_task_handle(&self) -> Option<JoinHandle<Result<()>>> {
        self.shutdown_tx.send_replace(true);
        self.loop_task.lock().expect("loop task poisoned").take()
    }

    pub(crate) async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.halt_loop_task_handle() {
            handle.abort();
            let _ = handle.await;
        }
        {
            let mut driver = self.driver.lock().await;
            driver.conn = None;
            while driver.rx.try_recv().is_ok() {}
        }
        self.queued.store(0, Ordering::SeqCst);
        self.incoming.lock().expect("incoming slot poisoned").take();
        self.pending_dial.lock().expect("pending dial poisoned").take();
        self.callbacks.clear();
        self.session.lock().expect("session poisoned").reset();
        *self.socket_fd.lock().expect("socket handle poisoned") = None;
        self.transition(ConnectionState::Disconnected);
        self.lib_guard.release();
        info!("client instance destroyed");
    }

    pub(crate) async fn reinitialise(
        &self,
        client_id: Option<&str>,
        clean_session: bool,
    ) -> Result<()> {
        self.ensure_alive()?;
        // Validate before tearing anything down.
        let fresh = SessionOptions::new(client_id, clean_session)?;

        if let Some(handle) = self.halt_loop_task_handle() {
            handle.abort();
            let _ = handle.await;
        }
        {
            let mut driver = self.driver.lock().await;
            driver.conn = None;
            while driver.rx.try_recv().is_ok() {}
        }
        self.queued.store(0, Ordering::SeqCst);
        self.incoming.lock().expect("incoming slot poisoned").take();
        self.pending_dial.lock().expect("pending dial poisoned").take();
        *self.target.lock().expect("target poisoned") = None;
        self.callbacks.clear();
        self.session.lock().expect("session poisoned").reset();
        *self.opts.lock().expect("options poisoned") = fresh;
        *self.reconnect.lock().expect("reconnect policy poisoned") = ReconnectPolicy::default();
        *self.socket_fd.lock().expect("socket handle poisoned") = None;
        self.shutdown_tx.send_replace(false);
        self.transition(ConnectionState::Disconnected);
        Ok(())
    }

    pub(crate) fn loop_task_slot(&self) -> &Mutex<Option<JoinHandle<Result<()>>>> {
        &self.loop_task
    }

    pub(crate) fn has_connect_state(&self) -> bool {
        self.target.lock().expect("target poisoned").is_some()
            || self.incoming.lock().expect("incoming slot poisoned").is_some()
            || self.pending_dial.lock().expect("pending dial poisoned").is_some()
    }

    // ---- dispatch ------------------------------------------------------

    pub(crate) fn emit_log(&self, level: LogLevel, message: &str) {
        match level {
            LogLevel::Debug => debug!(target: "culex::engine", "{message}"),
            LogLevel::Info | LogLevel::Notice => info!(target: "culex::engine", "{message}"),
            LogLevel::Warning => warn!(target: "culex::engine", "{message}"),
            LogLevel::Error => error!(target: "culex::engine", "{message}"),
        }
        self.callbacks
            .dispatch(EventKind::Log, |observer| observer.on_log(level, message));
    }

    pub(crate) fn dispatch_connect(&self, ack: &ConnectAck) {
        let ctx = ClientContext { core: self };
        self.callbacks
            .dispatch(EventKind::Connect, |observer| observer.on_connect(&ctx, ack));
    }

    pub(crate) fn dispatch_disconnect(&self, event: &DisconnectEvent) {
        let ctx = ClientContext { core: self };
        self.callbacks.dispatch(EventKind::Disconnect, |observer| {
            observer.on_disconnect(&ctx, event)
        });
    }

    pub(crate) fn dispatch_publish(&self, mid: u16) {
        let ctx = ClientContext { core: self };
        self.callbacks
            .dispatch(EventKind::Publish, |observer| observer.on_publish(&ctx, mid));
    }

    pub(crate) fn dispatch_message(&self, message: &Message) {
        let ctx = ClientContext { core: self };
        self.callbacks.dispatch(EventKind::Message, |observer| {
            observer.on_message(&ctx, message)
        });
    }

    pub(crate) fn dispatch_subscribe(
        &self,
        mid: u16,
        granted: &[rumqttc::mqttbytes::v4::SubscribeReasonCode],
    ) {
        let ctx = ClientContext { core: self };
        self.callbacks.dispatch(EventKind::Subscribe, |observer| {
            observer.on_subscribe(&ctx, mid, granted)
        });
    }

    pub(crate) fn dispatch_unsubscribe(&self, mid: u16) {
        let ctx = ClientContext { core: self };
        self.callbacks.dispatch(EventKind::Unsubscribe, |observer| {
            observer.on_unsubscribe(&ctx, mid)
        });
    }
}

/// Handle passed to every hook invocation, valid for the duration of the
/// call.
///
/// It exposes the command surface so a hook can publish, subscribe or
/// request a reconnect re-entrantly. The lifetime bound prevents a hook
/// from smuggling the context out of the dispatch.
pub struct ClientContext<'a> {
    pub(crate) core: &'a Core,
}

impl ClientContext<'_> {
    pub fn publish(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        qos: QoS,
        retain: bool,
    ) -> Result<u16> {
        self.core.publish(topic, payload, qos, retain)
    }

    pub fn subscribe(&self, filter: &str, qos: QoS) -> Result<u16> {
        self.core.subscribe(filter, qos)
    }

    pub fn unsubscribe(&self, filter: &str) -> Result<u16> {
        self.core.unsubscribe(filter)
    }

    pub fn disconnect(&self) -> Result<()> {
        self.core.disconnect()
    }

    /// Schedule a reconnect to the last target; the dial happens on the
    /// next loop step, so this is safe to call from a disconnect hook.
    pub fn reconnect_async(&self) -> Result<()> {
        self.core.reconnect_async()
    }

    pub fn state(&self) -> ConnectionState {
        self.core.state()
    }

    pub fn want_write(&self) -> bool {
        self.core.queued.load(Ordering::SeqCst) > 0
    }
}

/// One logical MQTT session.
///
/// All methods take `&self`; share the instance across threads with
/// [`Arc`]. Exactly one task at a time drives the network loop, while
/// commands and configuration are safe from anywhere.
pub struct Client {
    pub(crate) core: Arc<Core>,
}

impl Client {
    /// Create a new client instance.
    ///
    /// `client_id` may be omitted only for a clean session: an anonymous
    /// client has no identity for the broker to resume. Fails if
    /// [`crate::library::init`] has not run.
    pub fn new(client_id: Option<&str>, clean_session: bool) -> Result<Self> {
        let opts = SessionOptions::new(client_id, clean_session)?;
        let lib_guard = library::register_instance()?;

        let (state_tx, _state_rx) = watch::channel(ConnectionState::Disconnected);
        let (shutdown_tx, _shutdown_rx) = watch::channel(false);
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();

        Ok(Self {
            core: Arc::new(Core {
                opts: Mutex::new(opts),
                session: Mutex::new(Session::default()),
                callbacks: CallbackTable::default(),
                state_tx,
                requests_tx,
                queued: AtomicUsize::new(0),
                driver: tokio::sync::Mutex::new(Driver {
                    rx: requests_rx,
                    conn: None,
                }),
                incoming: Mutex::new(None),
                pending_dial: Mutex::new(None),
                target: Mutex::new(None),
                reconnect: Mutex::new(ReconnectPolicy::default()),
                connector: Mutex::new(Arc::new(TcpConnector)),
                shutdown_tx,
                loop_task: Mutex::new(None),
                socket_fd: Mutex::new(None),
                destroyed: AtomicBool::new(false),
                lib_guard,
            }),
        })
    }

    /// Tear down the instance: stop the loop task, close the socket, drop
    /// every hook binding and in-flight record. Idempotent.
    pub async fn destroy(&self) {
        self.core.destroy().await;
    }

    /// Discard all session state and start a fresh logical session on the
    /// same instance.
    pub async fn reinitialise(&self, client_id: Option<&str>, clean_session: bool) -> Result<()> {
        self.core.reinitialise(client_id, clean_session).await
    }

    // ---- configuration -------------------------------------------------

    /// Set the will the broker publishes if this session drops without a
    /// DISCONNECT.
    pub fn will_set(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        qos: QoS,
        retain: bool,
    ) -> Result<()> {
        self.core.ensure_alive()?;
        self.core
            .opts
            .lock()
            .expect("options poisoned")
            .set_will(topic, payload, qos, retain)
    }

    pub fn will_clear(&self) -> Result<()> {
        self.core.ensure_alive()?;
        self.core.opts.lock().expect("options poisoned").will = None;
        Ok(())
    }

    /// Set the credentials sent in CONNECT.
    pub fn login_set(&self, username: &str, password: Option<&str>) -> Result<()> {
        self.core.ensure_alive()?;
        self.core.opts.lock().expect("options poisoned").credentials = Some(Credentials {
            username: username.to_string(),
            password: password.map(str::to_string),
        });
        Ok(())
    }

    pub fn login_clear(&self) -> Result<()> {
        self.core.ensure_alive()?;
        self.core.opts.lock().expect("options poisoned").credentials = None;
        Ok(())
    }

    /// Store opaque TLS configuration for the connector. The engine does
    /// not interpret it; the default TCP connector rejects it.
    pub fn tls_set(&self, tls: TlsOptions) -> Result<()> {
        self.core.ensure_alive()?;
        self.core.opts.lock().expect("options poisoned").tls = Some(tls);
        Ok(())
    }

    /// Toggle hostname verification in the stored TLS configuration.
    pub fn tls_insecure_set(&self, insecure: bool) -> Result<()> {
        self.core.ensure_alive()?;
        let mut opts = self.core.opts.lock().expect("options poisoned");
        opts.tls.get_or_insert_with(TlsOptions::default).insecure = insecure;
        Ok(())
    }

    /// Select the protocol revision by token (`mqttv31` or `mqttv311`).
    pub fn version_set(&self, token: &str) -> Result<()> {
        self.core.ensure_alive()?;
        let version = ProtocolVersion::parse(token)?;
        self.core.opts.lock().expect("options poisoned").protocol_version = version;
        Ok(())
    }

    /// Cap on a single wire packet, applied to reads and publish payloads.
    pub fn max_packet_size_set(&self, bytes: usize) -> Result<()> {
        self.core.ensure_alive()?;
        if bytes == 0 {
            return Err(Error::invalid("maximum packet size must be nonzero"));
        }
        self.core.opts.lock().expect("options poisoned").max_packet_size = bytes;
        Ok(())
    }

    /// Replace the stream connector (e.g. with a TLS-capable one).
    pub fn connector_set(&self, connector: Arc<dyn Connector>) -> Result<()> {
        self.core.ensure_alive()?;
        *self.core.connector.lock().expect("connector poisoned") = connector;
        Ok(())
    }

    /// Configure the delay schedule used by the persistent loop modes
    /// after an unexpected disconnect.
    pub fn reconnect_delay_set(&self, base: Duration, max: Duration, exponential: bool) -> Result<()> {
        self.core.ensure_alive()?;
        let policy = ReconnectPolicy::new(base, max, exponential)?;
        *self.core.reconnect.lock().expect("reconnect policy poisoned") = policy;
        Ok(())
    }

    // ---- event binding -------------------------------------------------

    /// Bind `observer` to one event kind, replacing any previous binding
    /// for that kind. `kind` accepts an [`EventKind`], a symbolic name
    /// (`"ON_MESSAGE"`) or a numeric code.
    pub fn callback_set<K>(&self, kind: K, observer: Arc<dyn ClientObserver>) -> Result<()>
    where
        K: IntoEventKind,
    {
        self.core.ensure_alive()?;
        let kind = kind.into_event_kind()?;
        self.core.callbacks.set(kind, observer);
        Ok(())
    }

    // ---- connection control --------------------------------------------

    /// Establish the transport and send CONNECT. The handshake completes
    /// when a loop step processes the broker's CONNACK and fires the
    /// connect hook.
    pub async fn connect(&self, host: &str, port: u16, keep_alive: u16) -> Result<()> {
        self.core.connect(host, port, keep_alive).await
    }

    /// Like [`Client::connect`], but defer even the transport dial into
    /// the next loop step.
    pub fn connect_async(&self, host: &str, port: u16, keep_alive: u16) -> Result<()> {
        self.core.connect_async(host, port, keep_alive)
    }

    /// Redial the last connect target.
    pub async fn reconnect(&self) -> Result<()> {
        self.core.reconnect().await
    }

    /// Schedule a redial of the last connect target for the next loop
    /// step.
    pub fn reconnect_async(&self) -> Result<()> {
        self.core.reconnect_async()
    }

    /// Request a clean disconnect. The loop writes DISCONNECT, closes the
    /// socket and fires the disconnect hook with `success == true`.
    pub fn disconnect(&self) -> Result<()> {
        self.core.disconnect()
    }

    // ---- messaging -----------------------------------------------------

    /// Queue a publish; returns the message id used for ack correlation.
    pub fn publish(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        qos: QoS,
        retain: bool,
    ) -> Result<u16> {
        self.core.publish(topic, payload, qos, retain)
    }

    /// Queue a subscription; returns the message id echoed by SUBACK.
    pub fn subscribe(&self, filter: &str, qos: QoS) -> Result<u16> {
        self.core.subscribe(filter, qos)
    }

    /// Queue an unsubscribe; returns the message id echoed by UNSUBACK.
    pub fn unsubscribe(&self, filter: &str) -> Result<u16> {
        self.core.unsubscribe(filter)
    }

    // ---- introspection -------------------------------------------------

    pub fn state(&self) -> ConnectionState {
        self.core.state()
    }

    pub fn is_connected(&self) -> bool {
        self.core.state().is_connected()
    }

    /// Whether outbound work is queued and a write would make progress.
    pub fn want_write(&self) -> bool {
        self.core.queued.load(Ordering::SeqCst) > 0
    }

    /// The raw descriptor of the current socket, for registration with an
    /// external multiplexer. `None` while no socket is set.
    pub fn socket(&self) -> Option<SocketHandle> {
        *self.core.socket_fd.lock().expect("socket handle poisoned")
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        // Cannot run async teardown here; stop the loop task and let the
        // core's drop release the rest. Callers wanting deterministic
        // cleanup use destroy().
        self.core.shutdown_tx.send_replace(true);
        if let Some(handle) = self
            .core
            .loop_task
            .lock()
            .expect("loop task poisoned")
            .take()
        {
            handle.abort();
        }
    }
}
