//! Event dispatch: hook kinds, the observer trait and the callback table.
//!
//! Each client instance holds at most one observer reference per event kind.
//! Binding a new observer for a kind replaces (and releases) the previous
//! one. Dispatch runs synchronously on whichever task currently drives the
//! instance's network loop; a panicking hook is caught at the dispatch
//! boundary and never unwinds into the loop.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use rumqttc::mqttbytes::v4::SubscribeReasonCode;
use rumqttc::mqttbytes::QoS;
use tracing::error;

use crate::client::ClientContext;
use crate::error::Error;

/// The seven hook points exposed by the engine.
///
/// Numeric codes reuse the MQTT control-packet type bytes for the packet
/// driven kinds, plus two private codes for message delivery and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Handshake resolved (accepted or refused).
    Connect,
    /// Connection closed, by either party.
    Disconnect,
    /// Broker acknowledged an outbound publish.
    Publish,
    /// Inbound message delivered.
    Message,
    /// Broker acknowledged a SUBSCRIBE.
    Subscribe,
    /// Broker acknowledged an UNSUBSCRIBE.
    Unsubscribe,
    /// Diagnostic trace from the engine.
    Log,
}

impl EventKind {
    pub(crate) const COUNT: usize = 7;

    const ALL: [EventKind; Self::COUNT] = [
        EventKind::Connect,
        EventKind::Disconnect,
        EventKind::Publish,
        EventKind::Message,
        EventKind::Subscribe,
        EventKind::Unsubscribe,
        EventKind::Log,
    ];

    /// Numeric code for this kind.
    pub fn code(self) -> u8 {
        match self {
            EventKind::Connect => 0x10,
            EventKind::Disconnect => 0xE0,
            EventKind::Publish => 0x30,
            EventKind::Message => 0x01,
            EventKind::Subscribe => 0x80,
            EventKind::Unsubscribe => 0xA0,
            EventKind::Log => 0x02,
        }
    }

    /// Symbolic name for this kind.
    pub fn name(self) -> &'static str {
        match self {
            EventKind::Connect => "ON_CONNECT",
            EventKind::Disconnect => "ON_DISCONNECT",
            EventKind::Publish => "ON_PUBLISH",
            EventKind::Message => "ON_MESSAGE",
            EventKind::Subscribe => "ON_SUBSCRIBE",
            EventKind::Unsubscribe => "ON_UNSUBSCRIBE",
            EventKind::Log => "ON_LOG",
        }
    }

    fn index(self) -> usize {
        match self {
            EventKind::Connect => 0,
            EventKind::Disconnect => 1,
            EventKind::Publish => 2,
            EventKind::Message => 3,
            EventKind::Subscribe => 4,
            EventKind::Unsubscribe => 5,
            EventKind::Log => 6,
        }
    }
}

impl TryFrom<u8> for EventKind {
    type Error = Error;

    fn try_from(code: u8) -> Result<Self, Error> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.code() == code)
            .ok_or_else(|| Error::invalid(format!("{code:#04x} is not a callback kind")))
    }
}

impl FromStr for EventKind {
    type Err = Error;

    fn from_str(name: &str) -> Result<Self, Error> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.name() == name)
            .ok_or_else(|| Error::invalid(format!("'{name}' is not a callback kind")))
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Accepted designators for a callback kind: an [`EventKind`], a symbolic
/// name such as `"ON_MESSAGE"`, or a numeric code.
pub trait IntoEventKind {
    fn into_event_kind(self) -> Result<EventKind, Error>;
}

impl IntoEventKind for EventKind {
    fn into_event_kind(self) -> Result<EventKind, Error> {
        Ok(self)
    }
}

impl IntoEventKind for &str {
    fn into_event_kind(self) -> Result<EventKind, Error> {
        self.parse()
    }
}

impl IntoEventKind for u8 {
    fn into_event_kind(self) -> Result<EventKind, Error> {
        EventKind::try_from(self)
    }
}

/// Severity of an engine diagnostic delivered to the log hook.
///
/// Values are bit flags so bindings can mask categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum LogLevel {
    Info = 0x01,
    Notice = 0x02,
    Warning = 0x04,
    Error = 0x08,
    Debug = 0x10,
}

/// Outcome of a resolved connect handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectAck {
    /// True only when the broker accepted the connection.
    pub success: bool,
    /// Raw CONNACK return code (0 on success).
    pub code: u8,
    /// Human-readable reason derived from the return code.
    pub reason: &'static str,
    /// Whether the broker resumed a persistent session.
    pub session_present: bool,
}

/// Details of a closed connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisconnectEvent {
    /// True for a client-initiated, cleanly completed disconnect.
    pub success: bool,
    /// Raw OS error code when one is known, 0 on clean disconnect, -1
    /// otherwise.
    pub code: i32,
    /// Human-readable reason.
    pub reason: &'static str,
}

/// An inbound application message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Message id (0 for QoS 0 deliveries).
    pub mid: u16,
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

/// Application-supplied logic invoked from the network loop.
///
/// Every method has a no-op default, so an implementation only overrides the
/// event kinds it is bound to. The [`ClientContext`] parameter allows
/// re-entrant commands (publishing from inside a message hook, reconnecting
/// from a disconnect hook) and is only valid for the duration of the call.
#[allow(unused_variables)]
pub trait ClientObserver: Send + Sync {
    fn on_connect(&self, client: &ClientContext<'_>, ack: &ConnectAck) {}

    fn on_disconnect(&self, client: &ClientContext<'_>, event: &DisconnectEvent) {}

    /// The broker acknowledged the publish identified by `mid` (fires
    /// immediately after the write for QoS 0).
    fn on_publish(&self, client: &ClientContext<'_>, mid: u16) {}

    fn on_message(&self, client: &ClientContext<'_>, message: &Message) {}

    /// `granted` holds one entry per requested filter.
    fn on_subscribe(&self, client: &ClientContext<'_>, mid: u16, granted: &[SubscribeReasonCode]) {
    }

    fn on_unsubscribe(&self, client: &ClientContext<'_>, mid: u16) {}

    fn on_log(&self, level: LogLevel, message: &str) {}
}

/// One observer slot per event kind, writable from any thread at any time.
///
/// Writes are visible to the next dispatch after the write completes; the
/// slot lock is never held across a hook invocation.
#[derive(Default)]
pub(crate) struct CallbackTable {
    slots: Mutex<[Option<Arc<dyn ClientObserver>>; EventKind::COUNT]>,
}

impl CallbackTable {
    /// Bind `observer` to `kind`, dropping any previous binding.
    pub(crate) fn set(&self, kind: EventKind, observer: Arc<dyn ClientObserver>) {
        let mut slots = self.slots.lock().expect("callback table poisoned");
        slots[kind.index()] = Some(observer);
    }

    /// Drop every binding.
    pub(crate) fn clear(&self) {
        let mut slots = self.slots.lock().expect("callback table poisoned");
        for slot in slots.iter_mut() {
            *slot = None;
        }
    }

    fn get(&self, kind: EventKind) -> Option<Arc<dyn ClientObserver>> {
        let slots = self.slots.lock().expect("callback table poisoned");
        slots[kind.index()].clone()
    }

    /// Invoke the observer bound to `kind`, if any, confining panics to the
    /// dispatch boundary.
    pub(crate) fn dispatch(&self, kind: EventKind, call: impl FnOnce(&dyn ClientObserver)) {
        let Some(observer) = self.get(kind) else {
            return;
        };
        if catch_unwind(AssertUnwindSafe(|| call(observer.as_ref()))).is_err() {
            error!(kind = %kind, "callback panicked; continuing network loop");
        }
    }
}
