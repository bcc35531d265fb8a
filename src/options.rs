//! Per-session configuration.
//!
//! Options are stored on the client instance and applied when the next
//! CONNECT packet is built, so setters may be called at any time before (or
//! between) connection attempts.

use bytes::Bytes;
use rumqttc::mqttbytes::QoS;

use crate::error::{Error, Result};
use crate::topic;

/// Conventional MQTT broker port.
pub const DEFAULT_PORT: u16 = 1883;
/// Conventional keep-alive interval in seconds.
pub const DEFAULT_KEEP_ALIVE: u16 = 60;
/// Default cap on a single wire packet. Large enough for bulky payloads
/// without letting a corrupt length prefix allocate without bound.
pub const DEFAULT_MAX_PACKET_SIZE: usize = 256 * 1024;

/// Smallest keep-alive interval the engine accepts (0 disables keep-alive).
const MIN_KEEP_ALIVE: u16 = 5;

/// MQTT protocol revision to announce in CONNECT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProtocolVersion {
    /// MQTT 3.1 (protocol name "MQIsdp").
    V31,
    /// MQTT 3.1.1, the revision the wire codec speaks.
    #[default]
    V311,
}

impl ProtocolVersion {
    /// Parse one of the recognized version tokens.
    ///
    /// Unrecognized tokens are an error, never a silent fallback.
    pub fn parse(token: &str) -> Result<Self> {
        match token {
            "mqttv31" => Ok(ProtocolVersion::V31),
            "mqttv311" => Ok(ProtocolVersion::V311),
            other => Err(Error::invalid(format!(
                "'{other}' is not a protocol version token (expected 'mqttv31' or 'mqttv311')"
            ))),
        }
    }
}

/// A message the broker publishes on the client's behalf if the connection
/// drops without a DISCONNECT.
#[derive(Debug, Clone)]
pub struct Will {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

/// Username/password credentials sent in CONNECT.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: Option<String>,
}

/// Opaque TLS configuration, passed through to the connector untouched.
///
/// The engine itself performs no TLS; a [`crate::transport::Connector`]
/// implementation interprets these fields when it sets up the stream.
#[derive(Debug, Clone, Default)]
pub struct TlsOptions {
    pub ca_file: Option<String>,
    pub ca_path: Option<String>,
    pub cert_file: Option<String>,
    pub key_file: Option<String>,
    /// Skip hostname verification. Dangerous outside of test setups.
    pub insecure: bool,
}

/// Broker endpoint plus the keep-alive negotiated for the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ConnectTarget {
    pub host: String,
    pub port: u16,
    pub keep_alive: u16,
}

impl ConnectTarget {
    pub(crate) fn new(host: &str, port: u16, keep_alive: u16) -> Result<Self> {
        if host.is_empty() {
            return Err(Error::invalid("host must not be empty"));
        }
        if port == 0 {
            return Err(Error::invalid("port must not be zero"));
        }
        if keep_alive != 0 && keep_alive < MIN_KEEP_ALIVE {
            return Err(Error::invalid(format!(
                "keep-alive must be 0 or at least {MIN_KEEP_ALIVE} seconds"
            )));
        }
        Ok(Self {
            host: host.to_string(),
            port,
            keep_alive,
        })
    }
}

/// Everything a session carries into its next CONNECT.
#[derive(Debug, Clone)]
pub(crate) struct SessionOptions {
    pub client_id: Option<String>,
    pub clean_session: bool,
    pub protocol_version: ProtocolVersion,
    pub will: Option<Will>,
    pub credentials: Option<Credentials>,
    pub tls: Option<TlsOptions>,
    pub max_packet_size: usize,
}

impl SessionOptions {
    /// Build session options, enforcing that an anonymous client cannot
    /// request a persistent session (there is no identity to resume).
    pub(crate) fn new(client_id: Option<&str>, clean_session: bool) -> Result<Self> {
        if client_id.is_none() && !clean_session {
            return Err(Error::invalid(
                "a client without an id must use a clean session",
            ));
        }
        if let Some(id) = client_id {
            if id.is_empty() {
                return Err(Error::invalid("client id must not be empty"));
            }
        }
        Ok(Self {
            client_id: client_id.map(str::to_string),
            clean_session,
            protocol_version: ProtocolVersion::default(),
            will: None,
            credentials: None,
            tls: None,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
        })
    }

    pub(crate) fn set_will(
        &mut self,
        topic: &str,
        payload: impl Into<Bytes>,
        qos: QoS,
        retain: bool,
    ) -> Result<()> {
        topic::validate_topic(topic)?;
        self.will = Some(Will {
            topic: topic.to_string(),
            payload: payload.into(),
            qos,
            retain,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anonymous_client_requires_clean_session() {
        assert!(SessionOptions::new(None, true).is_ok());
        let err = SessionOptions::new(None, false).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn named_client_may_persist() {
        let opts = SessionOptions::new(Some("meter-7"), false).unwrap();
        assert_eq!(opts.client_id.as_deref(), Some("meter-7"));
        assert!(!opts.clean_session);
    }

    #[test]
    fn empty_client_id_is_rejected() {
        assert!(SessionOptions::new(Some(""), true).is_err());
    }

    #[test]
    fn version_tokens() {
        assert_eq!(
            ProtocolVersion::parse("mqttv311").unwrap(),
            ProtocolVersion::V311
        );
        assert_eq!(
            ProtocolVersion::parse("mqttv31").unwrap(),
            ProtocolVersion::V31
        );
        assert!(ProtocolVersion::parse("mqttv5").is_err());
        assert!(ProtocolVersion::parse("").is_err());
    }

    #[test]
    fn connect_target_validation() {
        assert!(ConnectTarget::new("localhost", 1883, 60).is_ok());
        assert!(ConnectTarget::new("localhost", 1883, 0).is_ok());
        assert!(ConnectTarget::new("", 1883, 60).is_err());
        assert!(ConnectTarget::new("localhost", 0, 60).is_err());
        assert!(ConnectTarget::new("localhost", 1883, 3).is_err());
    }

    #[test]
    fn will_topic_must_be_literal() {
        let mut opts = SessionOptions::new(Some("c"), true).unwrap();
        assert!(opts.set_will("status/offline", "gone", QoS::AtLeastOnce, true).is_ok());
        assert!(opts.set_will("status/#", "gone", QoS::AtMostOnce, false).is_err());
    }
}
