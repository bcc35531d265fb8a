//! Embeddable MQTT 3.1.1 client engine.
//!
//! `culex` is the core of an MQTT client: the connection/session state
//! machine, the network I/O loop, message-id lifecycle and typed event
//! dispatch. Wire-level packet encoding is delegated to the `mqttbytes`
//! codec shipped inside `rumqttc`; transport setup is delegated to a
//! pluggable [`transport::Connector`], so TLS stays an opaque concern of
//! the embedder.
//!
//! # Driving modes
//!
//! The loop can be driven three ways, all built on the same primitive
//! step:
//!
//! - **Single step**: [`Client::loop_step`] from your own scheduler.
//!   Errors are returned to you; nothing auto-reconnects.
//! - **Run forever**: [`Client::loop_forever`] blocks the calling task,
//!   applying the configured reconnect/backoff policy after unexpected
//!   drops.
//! - **Background task**: [`Client::loop_start`] and
//!   [`Client::loop_stop`] run the forever-loop on a spawned task.
//!
//! For integration with an external multiplexer there are manual
//! sub-steps ([`Client::loop_read`], [`Client::loop_write`],
//! [`Client::loop_misc`]) plus [`Client::want_write`] and
//! [`Client::socket`].
//!
//! # Events
//!
//! Protocol events are delivered through a [`ClientObserver`]
//! implementation bound per event kind with [`Client::callback_set`].
//! Hooks run synchronously inside the loop step and receive a
//! [`ClientContext`] for re-entrant commands; a panicking hook is caught
//! at the dispatch boundary and never takes down the transport.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use culex::{Client, ClientContext, ClientObserver, ConnectAck, EventKind, QoS};
//!
//! struct Greeter;
//!
//! impl ClientObserver for Greeter {
//!     fn on_connect(&self, client: &ClientContext<'_>, ack: &ConnectAck) {
//!         if ack.success {
//!             client.subscribe("greetings/#", QoS::AtLeastOnce).ok();
//!         }
//!     }
//! }
//!
//! # async fn run() -> culex::Result<()> {
//! culex::library::init();
//! let client = Client::new(Some("greeter-1"), true)?;
//! client.callback_set(EventKind::Connect, Arc::new(Greeter))?;
//! client.connect("localhost", 1883, 60).await?;
//! client.loop_forever(None, 1).await?;
//! # Ok(())
//! # }
//! ```

mod backoff;
mod client;
mod connection;
mod error;
mod eventloop;
mod observer;
mod options;
mod session;
mod state;
mod topic;

pub mod library;
pub mod transport;

pub use backoff::ReconnectPolicy;
pub use client::{Client, ClientContext};
pub use error::{Error, Result};
pub use observer::{
    ClientObserver, ConnectAck, DisconnectEvent, EventKind, IntoEventKind, LogLevel, Message,
};
pub use options::{
    ProtocolVersion, TlsOptions, Will, DEFAULT_KEEP_ALIVE, DEFAULT_MAX_PACKET_SIZE, DEFAULT_PORT,
};
pub use state::{connack_reason, ConnectionState};
pub use topic::topic_matches_sub;

// Wire-level vocabulary re-exported from the codec.
pub use rumqttc::mqttbytes::v4::SubscribeReasonCode;
pub use rumqttc::mqttbytes::QoS;
