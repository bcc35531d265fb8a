//! The network I/O loop.
//!
//! Every driving mode is built on one primitive step: adopt any staged
//! connection, drain queued commands onto the wire, wait for inbound
//! packets (or the keep-alive deadline, or a stop signal) and dispatch
//! hooks. `loop_forever` repeats the step and supervises reconnection with
//! the backoff policy; `loop_start` runs that supervisor on a spawned
//! task. The driver mutex guarantees that at most one task steps a given
//! instance at a time, which is also what serializes hook dispatch.

use std::sync::atomic::Ordering;
use std::time::Duration;

use rumqttc::mqttbytes::v4::{ConnectReturnCode, Packet, PubAck, PubComp, PubRec, PubRel};
use rumqttc::mqttbytes::QoS;
use tokio::sync::mpsc;
use tokio::time::Instant as TokioInstant;
use tracing::{debug, warn};

use crate::client::{Client, Core};
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::observer::{ConnectAck, DisconnectEvent, LogLevel, Message};
use crate::session::InFlight;
use crate::state::{connack_reason, ConnectionState};

/// Wait applied by a step when the caller passes no timeout.
pub(crate) const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(1);
/// How long a cooperative `loop_stop` waits before aborting the task.
const STOP_GRACE: Duration = Duration::from_secs(2);

/// A command queued for the network loop.
pub(crate) enum Request {
    Publish {
        mid: u16,
        packet: rumqttc::mqttbytes::v4::Publish,
    },
    Subscribe {
        packet: rumqttc::mqttbytes::v4::Subscribe,
    },
    Unsubscribe {
        packet: rumqttc::mqttbytes::v4::Unsubscribe,
    },
    Disconnect,
}

/// Socket-side state owned exclusively by whichever task holds the driver
/// lock.
pub(crate) struct Driver {
    pub(crate) rx: mpsc::UnboundedReceiver<Request>,
    pub(crate) conn: Option<Connection>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StepOutcome {
    /// Normal step; connection still up (or still handshaking).
    Ran,
    /// Stop signal observed.
    Stopped,
    /// Clean client-initiated disconnect completed.
    Disconnected,
}

enum Wake {
    Packet(Result<Packet>),
    Request(Option<Request>),
    Deadline,
    Shutdown,
}

fn connack_code(code: ConnectReturnCode) -> u8 {
    match code {
        ConnectReturnCode::Success => 0,
        ConnectReturnCode::RefusedProtocolVersion => 1,
        ConnectReturnCode::BadClientId => 2,
        ConnectReturnCode::ServiceUnavailable => 3,
        ConnectReturnCode::BadUserNamePassword => 4,
        ConnectReturnCode::NotAuthorized => 5,
    }
}

impl Core {
    fn adopt_staged(&self, driver: &mut Driver) {
        if let Some(conn) = self.incoming.lock().expect("incoming slot poisoned").take() {
            *self.socket_fd.lock().expect("socket handle poisoned") = conn.socket_handle();
            driver.conn = Some(conn);
        }
    }

    /// Ensure `driver.conn` holds a live connection, dialing a deferred
    /// target when one is staged.
    async fn ensure_connection(&self, driver: &mut Driver) -> Result<()> {
        self.adopt_staged(driver);
        if driver.conn.is_some() {
            return Ok(());
        }
        let deferred = self.pending_dial.lock().expect("pending dial poisoned").take();
        let Some(target) = deferred else {
            return Err(Error::NoConnection);
        };
        match self.dial(&target).await {
            Ok(conn) => {
                *self.socket_fd.lock().expect("socket handle poisoned") = conn.socket_handle();
                driver.conn = Some(conn);
                Ok(())
            }
            Err(err) => {
                self.transition(ConnectionState::Disconnected);
                Err(err)
            }
        }
    }

    /// Tear down after an unexpected failure: drop the socket and every
    /// in-flight record, fire the disconnect hook, surface the error.
    fn fail_connection(&self, driver: &mut Driver, err: Error) -> Error {
        driver.conn = None;
        while driver.rx.try_recv().is_ok() {
            self.queued.fetch_sub(1, Ordering::SeqCst);
        }
        *self.socket_fd.lock().expect("socket handle poisoned") = None;
        self.session.lock().expect("session poisoned").reset();
        self.transition(ConnectionState::Disconnected);
        self.emit_log(LogLevel::Warning, &format!("connection failed: {err}"));
        self.dispatch_disconnect(&DisconnectEvent {
            success: false,
            code: err.os_code(),
            reason: "unexpected disconnect",
        });
        err
    }

    /// Tear down after a completed client-initiated DISCONNECT.
    fn close_clean(&self, driver: &mut Driver) {
        driver.conn = None;
        while driver.rx.try_recv().is_ok() {
            self.queued.fetch_sub(1, Ordering::SeqCst);
        }
        *self.socket_fd.lock().expect("socket handle poisoned") = None;
        self.session.lock().expect("session poisoned").reset();
        self.transition(ConnectionState::Disconnected);
        self.dispatch_disconnect(&DisconnectEvent {
            success: true,
            code: 0,
            reason: "client-initiated disconnect",
        });
    }

    /// Tear down without firing the disconnect hook (refused handshakes
    /// already reported through the connect hook).
    fn close_silent(&self, driver: &mut Driver) {
        driver.conn = None;
        while driver.rx.try_recv().is_ok() {
            self.queued.fetch_sub(1, Ordering::SeqCst);
        }
        *self.socket_fd.lock().expect("socket handle poisoned") = None;
        self.session.lock().expect("session poisoned").reset();
        self.transition(ConnectionState::Disconnected);
    }

    /// Serialize one queued request into the connection's write buffer.
    /// Returns the mid to acknowledge locally for a QoS 0 publish, and
    /// whether this request was a disconnect.
    fn encode_request(
        &self,
        conn: &mut Connection,
        request: Request,
    ) -> Result<(Option<u16>, bool)> {
        self.queued.fetch_sub(1, Ordering::SeqCst);
        match request {
            Request::Publish { mid, packet } => {
                let immediate = packet.qos == QoS::AtMostOnce;
                conn.enqueue(&Packet::Publish(packet))?;
                Ok((immediate.then_some(mid), false))
            }
            Request::Subscribe { packet } => {
                conn.enqueue(&Packet::Subscribe(packet))?;
                Ok((None, false))
            }
            Request::Unsubscribe { packet } => {
                conn.enqueue(&Packet::Unsubscribe(packet))?;
                Ok((None, false))
            }
            Request::Disconnect => {
                conn.enqueue(&Packet::Disconnect)?;
                Ok((None, true))
            }
        }
    }

    /// Drain queued commands onto the wire. Held back until the handshake
    /// completes so nothing precedes CONNACK.
    async fn write_phase(&self, driver: &mut Driver) -> Result<bool> {
        if !matches!(
            self.state(),
            ConnectionState::Connected | ConnectionState::Disconnecting
        ) {
            return Ok(false);
        }
        let Driver { rx, conn } = driver;
        let conn = conn.as_mut().expect("write phase requires a connection");

        let mut acked = Vec::new();
        let mut disconnect = false;
        while let Ok(request) = rx.try_recv() {
            let (qos0_mid, was_disconnect) = self.encode_request(conn, request)?;
            if let Some(mid) = qos0_mid {
                acked.push(mid);
            }
            if was_disconnect {
                disconnect = true;
                break;
            }
        }
        conn.flush().await?;
        for mid in acked {
            self.dispatch_publish(mid);
        }
        Ok(disconnect)
    }

    /// Process one inbound packet, replying and dispatching as needed.
    fn handle_packet(&self, conn: &mut Connection, packet: Packet) -> Result<()> {
        match packet {
            Packet::ConnAck(ack) => {
                let code = connack_code(ack.code);
                let reason = connack_reason(code);
                if ack.code == ConnectReturnCode::Success {
                    self.transition(ConnectionState::Connected);
                    self.reconnect
                        .lock()
                        .expect("reconnect policy poisoned")
                        .reset();
                    self.emit_log(LogLevel::Info, reason);
                    self.dispatch_connect(&ConnectAck {
                        success: true,
                        code,
                        reason,
                        session_present: ack.session_present,
                    });
                } else {
                    self.emit_log(LogLevel::Warning, reason);
                    self.dispatch_connect(&ConnectAck {
                        success: false,
                        code,
                        reason,
                        session_present: false,
                    });
                    return Err(Error::ConnectionRefused { code, reason });
                }
            }
            Packet::Publish(publish) => {
                let message = Message {
                    mid: publish.pkid,
                    topic: publish.topic,
                    payload: publish.payload,
                    qos: publish.qos,
                    retain: publish.retain,
                };
                match message.qos {
                    QoS::AtMostOnce => self.dispatch_message(&message),
                    QoS::AtLeastOnce => {
                        conn.enqueue(&Packet::PubAck(PubAck { pkid: message.mid }))?;
                        self.dispatch_message(&message);
                    }
                    QoS::ExactlyOnce => {
                        // Held until PUBREL for exactly-once delivery.
                        conn.enqueue(&Packet::PubRec(PubRec { pkid: message.mid }))?;
                        self.session
                            .lock()
                            .expect("session poisoned")
                            .store_inbound(message.mid, message);
                    }
                }
            }
            Packet::PubRel(rel) => {
                let released = self
                    .session
                    .lock()
                    .expect("session poisoned")
                    .release_inbound(rel.pkid);
                conn.enqueue(&Packet::PubComp(PubComp { pkid: rel.pkid }))?;
                if let Some(message) = released {
                    self.dispatch_message(&message);
                }
            }
            Packet::PubAck(ack) => {
                let resolved = self
                    .session
                    .lock()
                    .expect("session poisoned")
                    .acknowledge(ack.pkid, InFlight::PublishQos1);
                if resolved {
                    self.dispatch_publish(ack.pkid);
                } else {
                    warn!(mid = ack.pkid, "PUBACK for unknown message id");
                }
            }
            Packet::PubRec(rec) => {
                let advanced = self
                    .session
                    .lock()
                    .expect("session poisoned")
                    .publish_received(rec.pkid);
                if advanced {
                    conn.enqueue(&Packet::PubRel(PubRel { pkid: rec.pkid }))?;
                } else {
                    warn!(mid = rec.pkid, "PUBREC for unknown message id");
                }
            }
            Packet::PubComp(comp) => {
                let resolved = self
                    .session
                    .lock()
                    .expect("session poisoned")
                    .acknowledge(comp.pkid, InFlight::PublishAwaitingComp);
                if resolved {
                    self.dispatch_publish(comp.pkid);
                } else {
                    warn!(mid = comp.pkid, "PUBCOMP for unknown message id");
                }
            }
            Packet::SubAck(suback) => {
                let resolved = self
                    .session
                    .lock()
                    .expect("session poisoned")
                    .acknowledge(suback.pkid, InFlight::Subscribe);
                if resolved {
                    self.dispatch_subscribe(suback.pkid, &suback.return_codes);
                } else {
                    warn!(mid = suback.pkid, "SUBACK for unknown message id");
                }
            }
            Packet::UnsubAck(unsuback) => {
                let resolved = self
                    .session
                    .lock()
                    .expect("session poisoned")
                    .acknowledge(unsuback.pkid, InFlight::Unsubscribe);
                if resolved {
                    self.dispatch_unsubscribe(unsuback.pkid);
                } else {
                    warn!(mid = unsuback.pkid, "UNSUBACK for unknown message id");
                }
            }
            Packet::PingResp => {
                conn.pong_received();
                self.emit_log(LogLevel::Debug, "received PINGRESP");
            }
            Packet::PingReq => {
                conn.enqueue(&Packet::PingResp)?;
            }
            other => {
                // Brokers do not send these; log and carry on.
                warn!(?other, "ignoring unexpected packet from broker");
            }
        }
        Ok(())
    }

    /// One primitive loop step. See module docs for the phases.
    pub(crate) async fn step(&self, timeout: Duration, max_packets: usize) -> Result<StepOutcome> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        if *shutdown_rx.borrow() {
            return Ok(StepOutcome::Stopped);
        }

        let mut driver = self.driver.lock().await;
        self.ensure_connection(&mut driver).await?;

        match self.write_phase(&mut driver).await {
            Ok(false) => {}
            Ok(true) => {
                self.close_clean(&mut driver);
                return Ok(StepOutcome::Disconnected);
            }
            Err(err) => return Err(self.fail_connection(&mut driver, err)),
        }

        let step_deadline = TokioInstant::now() + timeout;
        let mut processed = 0;
        while processed < max_packets {
            let state = self.state();
            let wake = {
                let Driver { rx, conn } = &mut *driver;
                let conn = conn.as_mut().expect("step requires a connection");
                let wait_until = match conn.keep_alive_deadline() {
                    Some(deadline) => step_deadline.min(TokioInstant::from_std(deadline)),
                    None => step_deadline,
                };
                let commands_open = matches!(
                    state,
                    ConnectionState::Connected | ConnectionState::Disconnecting
                );
                tokio::select! {
                    result = conn.read_packet() => Wake::Packet(result),
                    request = rx.recv(), if commands_open => Wake::Request(request),
                    _ = tokio::time::sleep_until(wait_until) => Wake::Deadline,
                    _ = shutdown_rx.changed() => Wake::Shutdown,
                }
            };

            match wake {
                Wake::Packet(Ok(packet)) => {
                    processed += 1;
                    let handled = {
                        let conn = driver.conn.as_mut().expect("step requires a connection");
                        self.handle_packet(conn, packet)
                    };
                    let handled = match handled {
                        Ok(()) => {
                            // Push out any replies queued while handling.
                            let conn = driver.conn.as_mut().expect("step requires a connection");
                            conn.flush().await
                        }
                        Err(err) => Err(err),
                    };
                    match handled {
                        Ok(()) => {}
                        Err(err @ Error::ConnectionRefused { .. }) => {
                            self.close_silent(&mut driver);
                            return Err(err);
                        }
                        Err(err) => return Err(self.fail_connection(&mut driver, err)),
                    }
                }
                Wake::Packet(Err(err)) => {
                    return Err(self.fail_connection(&mut driver, err));
                }
                Wake::Request(Some(request)) => {
                    let result = {
                        let conn = driver.conn.as_mut().expect("step requires a connection");
                        self.encode_request(conn, request)
                    };
                    match result {
                        Ok((qos0_mid, was_disconnect)) => {
                            let flushed = {
                                let conn =
                                    driver.conn.as_mut().expect("step requires a connection");
                                conn.flush().await
                            };
                            if let Err(err) = flushed {
                                return Err(self.fail_connection(&mut driver, err));
                            }
                            if let Some(mid) = qos0_mid {
                                self.dispatch_publish(mid);
                            }
                            if was_disconnect {
                                self.close_clean(&mut driver);
                                return Ok(StepOutcome::Disconnected);
                            }
                        }
                        Err(err) => return Err(self.fail_connection(&mut driver, err)),
                    }
                }
                Wake::Request(None) => break,
                Wake::Deadline => {
                    if TokioInstant::now() >= step_deadline {
                        break;
                    }
                    // Keep-alive deadline fired inside the window.
                    if let Err(err) = self.misc_phase(&mut driver).await {
                        return Err(err);
                    }
                }
                Wake::Shutdown => {
                    if *shutdown_rx.borrow() {
                        return Ok(StepOutcome::Stopped);
                    }
                }
            }
        }

        self.misc_phase(&mut driver).await?;
        Ok(StepOutcome::Ran)
    }

    /// Keep-alive servicing shared by `step` and `loop_misc`.
    async fn misc_phase(&self, driver: &mut Driver) -> Result<()> {
        let serviced = {
            let conn = driver.conn.as_mut().expect("misc requires a connection");
            match conn.service_keep_alive() {
                Ok(true) => conn.flush().await.map(|()| true),
                Ok(false) => Ok(false),
                Err(err) => Err(err),
            }
        };
        match serviced {
            Ok(true) => {
                self.emit_log(LogLevel::Debug, "sending PINGREQ");
                Ok(())
            }
            Ok(false) => Ok(()),
            Err(err) => Err(self.fail_connection(driver, err)),
        }
    }

    async fn interruptible_sleep(&self, delay: Duration) -> bool {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        if *shutdown_rx.borrow() {
            return false;
        }
        tokio::select! {
            changed = shutdown_rx.changed() => match changed {
                Ok(()) => !*shutdown_rx.borrow(),
                Err(_) => true,
            },
            _ = tokio::time::sleep(delay) => true,
        }
    }

    /// Step until a clean disconnect, stop signal or fatal error, applying
    /// the reconnect policy after unexpected drops.
    pub(crate) async fn run_forever(&self, timeout: Duration, max_packets: usize) -> Result<()> {
        self.ensure_alive()?;
        let shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            if *shutdown_rx.borrow() {
                return Ok(());
            }
            match self.step(timeout, max_packets).await {
                Ok(StepOutcome::Ran) => {}
                Ok(StepOutcome::Stopped) | Ok(StepOutcome::Disconnected) => return Ok(()),
                Err(err) if err.is_misuse() => return Err(err),
                Err(Error::NoConnection) => return Err(Error::NoConnection),
                Err(err) => {
                    debug!("loop step failed: {err}");
                    let Some(target) = self.target.lock().expect("target poisoned").clone()
                    else {
                        return Err(err);
                    };
                    loop {
                        let (attempt, delay) = self
                            .reconnect
                            .lock()
                            .expect("reconnect policy poisoned")
                            .next_delay();
                        self.transition(ConnectionState::Reconnecting(attempt));
                        self.emit_log(
                            LogLevel::Notice,
                            &format!("waiting {delay:?} before reconnect attempt {attempt}"),
                        );
                        if !self.interruptible_sleep(delay).await {
                            return Ok(());
                        }
                        self.transition(ConnectionState::Connecting);
                        match self.dial(&target).await {
                            Ok(conn) => {
                                let mut driver = self.driver.lock().await;
                                *self.socket_fd.lock().expect("socket handle poisoned") =
                                    conn.socket_handle();
                                driver.conn = Some(conn);
                                // A redial scheduled by a hook is now moot.
                                self.pending_dial
                                    .lock()
                                    .expect("pending dial poisoned")
                                    .take();
                                break;
                            }
                            Err(dial_err) if dial_err.is_misuse() => return Err(dial_err),
                            Err(dial_err) => {
                                self.emit_log(
                                    LogLevel::Warning,
                                    &format!("reconnect attempt {attempt} failed: {dial_err}"),
                                );
                                self.transition(ConnectionState::Disconnected);
                            }
                        }
                    }
                }
            }
        }
    }
}

impl Client {
    /// Run one loop step: wait up to `timeout` (`None` for the 1 s
    /// default) for network activity, process at most `max_packets`
    /// inbound packets, service queued writes and keep-alive, return.
    ///
    /// Safe to call repeatedly from an external scheduler; never
    /// reconnects on its own.
    pub async fn loop_step(&self, timeout: Option<Duration>, max_packets: usize) -> Result<()> {
        self.core.ensure_alive()?;
        self.core
            .step(
                timeout.unwrap_or(DEFAULT_STEP_TIMEOUT),
                max_packets.max(1),
            )
            .await
            .map(|_| ())
    }

    /// Step continuously until a clean disconnect, an explicit stop or a
    /// fatal error, reconnecting with the configured backoff after
    /// unexpected drops.
    pub async fn loop_forever(&self, timeout: Option<Duration>, max_packets: usize) -> Result<()> {
        self.core
            .run_forever(
                timeout.unwrap_or(DEFAULT_STEP_TIMEOUT),
                max_packets.max(1),
            )
            .await
    }

    /// Run [`Client::loop_forever`] on a background task.
    pub fn loop_start(&self) -> Result<()> {
        self.core.ensure_alive()?;
        if !self.core.has_connect_state() {
            return Err(Error::NoConnection);
        }
        let slot = self.core.loop_task_slot();
        let mut task = slot.lock().expect("loop task poisoned");
        if let Some(handle) = task.as_ref() {
            if !handle.is_finished() {
                return Err(Error::LoopAlreadyRunning);
            }
        }
        self.core.shutdown_tx.send_replace(false);
        let core = self.core.clone();
        *task = Some(tokio::spawn(async move {
            core.run_forever(DEFAULT_STEP_TIMEOUT, 1).await
        }));
        Ok(())
    }

    /// Stop the background loop task.
    ///
    /// With `force == false` the task exits at its next safe point (a
    /// bounded grace period applies). With `force == true` the task is
    /// cancelled immediately; a partially written packet is abandoned and
    /// the connection is treated as failed, not clean.
    pub async fn loop_stop(&self, force: bool) -> Result<()> {
        self.core.ensure_alive()?;
        let Some(mut handle) = self.core.loop_task_slot().lock().expect("loop task poisoned").take()
        else {
            return Err(Error::invalid("network loop is not running"));
        };

        if force {
            handle.abort();
            let _ = handle.await;
            let mut driver = self.core.driver.lock().await;
            if driver.conn.is_some() {
                let _ = self
                    .core
                    .fail_connection(&mut driver, Error::ConnectionLost);
            }
            self.core.shutdown_tx.send_replace(false);
            return Ok(());
        }

        self.core.shutdown_tx.send_replace(true);
        match tokio::time::timeout(STOP_GRACE, &mut handle).await {
            Ok(_) => {}
            Err(_) => {
                warn!("loop task ignored the stop request; aborting");
                handle.abort();
                let _ = handle.await;
            }
        }
        // Leave the instance steppable again from the caller's thread.
        self.core.shutdown_tx.send_replace(false);
        Ok(())
    }

    /// Manually service readable data: process up to `max_packets`
    /// already-available inbound packets without blocking.
    pub async fn loop_read(&self, max_packets: usize) -> Result<()> {
        self.core.ensure_alive()?;
        let mut driver = self.core.driver.lock().await;
        self.core.adopt_staged(&mut driver);
        if driver.conn.is_none() {
            return Err(Error::NoConnection);
        }

        for _ in 0..max_packets.max(1) {
            let read = {
                let conn = driver.conn.as_mut().expect("loop_read requires a connection");
                tokio::time::timeout(Duration::ZERO, conn.read_packet()).await
            };
            match read {
                Err(_) => break, // nothing buffered or readable right now
                Ok(Ok(packet)) => {
                    let handled = {
                        let conn =
                            driver.conn.as_mut().expect("loop_read requires a connection");
                        self.core.handle_packet(conn, packet)
                    };
                    match handled {
                        Ok(()) => {}
                        Err(err @ Error::ConnectionRefused { .. }) => {
                            self.core.close_silent(&mut driver);
                            return Err(err);
                        }
                        Err(err) => return Err(self.core.fail_connection(&mut driver, err)),
                    }
                }
                Ok(Err(err)) => return Err(self.core.fail_connection(&mut driver, err)),
            }
        }

        // Push out any acks queued while handling.
        let flushed = {
            let conn = driver.conn.as_mut().expect("loop_read requires a connection");
            conn.flush().await
        };
        flushed.map_err(|err| self.core.fail_connection(&mut driver, err))
    }

    /// Manually drain queued outbound work onto the wire.
    pub async fn loop_write(&self) -> Result<()> {
        self.core.ensure_alive()?;
        let mut driver = self.core.driver.lock().await;
        self.core.adopt_staged(&mut driver);
        if driver.conn.is_none() {
            return Err(Error::NoConnection);
        }
        match self.core.write_phase(&mut driver).await {
            Ok(false) => Ok(()),
            Ok(true) => {
                self.core.close_clean(&mut driver);
                Ok(())
            }
            Err(err) => Err(self.core.fail_connection(&mut driver, err)),
        }
    }

    /// Manually service keep-alive timers (ping transmission and ping
    /// timeout detection).
    pub async fn loop_misc(&self) -> Result<()> {
        self.core.ensure_alive()?;
        let mut driver = self.core.driver.lock().await;
        self.core.adopt_staged(&mut driver);
        if driver.conn.is_none() {
            return Err(Error::NoConnection);
        }
        self.core.misc_phase(&mut driver).await
    }
}
