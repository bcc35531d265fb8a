//! Connection lifecycle state.
//!
//! State changes are broadcast over a `tokio::sync::watch` channel owned by
//! the client instance, so observers and loop tasks always see the latest
//! value without polling the driver.

use tracing::{debug, info, warn};

/// Lifecycle state of a client's broker connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection and none being established.
    Disconnected,
    /// TCP established (or being established) and CONNECT sent; waiting for
    /// the broker's CONNACK.
    Connecting,
    /// Handshake accepted; publish/subscribe traffic may flow.
    Connected,
    /// A client-initiated DISCONNECT is queued or in flight.
    Disconnecting,
    /// An unexpected drop occurred and a persistent loop mode is waiting to
    /// retry (attempt counter).
    Reconnecting(u32),
}

impl ConnectionState {
    /// Whether commands that produce outbound traffic may be accepted.
    ///
    /// Traffic queued while `Connecting` is held back by the driver until
    /// the handshake completes.
    pub fn accepts_commands(&self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Connecting)
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

/// Log a state transition at an appropriate level.
pub(crate) fn log_transition(from: &ConnectionState, to: &ConnectionState) {
    match (from, to) {
        (ConnectionState::Connecting, ConnectionState::Connected) => {
            info!("connection established");
        }
        (ConnectionState::Connected, ConnectionState::Disconnected) => {
            warn!("connection closed");
        }
        (_, ConnectionState::Reconnecting(attempt)) => {
            info!(attempt, "scheduling reconnection");
        }
        (from, to) => {
            debug!(?from, ?to, "connection state change");
        }
    }
}

/// Human-readable rendering of a CONNACK return code.
///
/// Codes 0..=5 are defined by the protocol; 6 is the conventional TLS
/// failure code; everything else is reserved.
pub fn connack_reason(code: u8) -> &'static str {
    match code {
        0 => "connection accepted",
        1 => "connection refused - incorrect protocol version",
        2 => "connection refused - invalid client identifier",
        3 => "connection refused - server unavailable",
        4 => "connection refused - bad username or password",
        5 => "connection refused - not authorised",
        6 => "connection refused - TLS error",
        _ => "reserved for future use",
    }
}
