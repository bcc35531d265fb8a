//! In-process broker stand-in for integration tests.
//!
//! Binds a real TCP listener on an ephemeral port and speaks just enough
//! MQTT 3.1.1 (via the same wire codec the engine drives) to exercise the
//! client: CONNACK, publish acknowledgment for every QoS, SUBACK followed
//! by one canned message per subscribed filter, UNSUBACK and PINGRESP.

// Each test binary uses a different slice of this harness.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use rumqttc::mqttbytes::v4::{
    self, ConnAck, ConnectReturnCode, Packet, PubAck, PubComp, PubRec, PubRel, Publish, SubAck,
    SubscribeReasonCode, UnsubAck,
};
use rumqttc::mqttbytes::{self, QoS};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

const MAX_PACKET_SIZE: usize = 1024 * 1024;
/// Payload of the canned message delivered after a SUBACK.
pub const CANNED_PAYLOAD: &[u8] = b"hello from broker";

/// Observer that records every dispatched event for later assertions.
#[derive(Debug, Clone, PartialEq)]
pub enum Recorded {
    Connect(culex::ConnectAck),
    Disconnect(culex::DisconnectEvent),
    Publish(u16),
    Message(culex::Message),
    Subscribe(u16, Vec<SubscribeReasonCode>),
    Unsubscribe(u16),
}

#[derive(Default)]
pub struct Recorder {
    events: std::sync::Mutex<Vec<Recorded>>,
}

impl Recorder {
    pub fn events(&self) -> Vec<Recorded> {
        self.events.lock().unwrap().clone()
    }

    pub fn connects(&self) -> Vec<culex::ConnectAck> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Recorded::Connect(ack) => Some(ack),
                _ => None,
            })
            .collect()
    }

    pub fn disconnects(&self) -> Vec<culex::DisconnectEvent> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Recorded::Disconnect(disconnect) => Some(disconnect),
                _ => None,
            })
            .collect()
    }

    pub fn published_mids(&self) -> Vec<u16> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Recorded::Publish(mid) => Some(mid),
                _ => None,
            })
            .collect()
    }

    pub fn messages(&self) -> Vec<culex::Message> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Recorded::Message(message) => Some(message),
                _ => None,
            })
            .collect()
    }

    fn push(&self, event: Recorded) {
        self.events.lock().unwrap().push(event);
    }
}

impl culex::ClientObserver for Recorder {
    fn on_connect(&self, _client: &culex::ClientContext<'_>, ack: &culex::ConnectAck) {
        self.push(Recorded::Connect(ack.clone()));
    }

    fn on_disconnect(&self, _client: &culex::ClientContext<'_>, event: &culex::DisconnectEvent) {
        self.push(Recorded::Disconnect(event.clone()));
    }

    fn on_publish(&self, _client: &culex::ClientContext<'_>, mid: u16) {
        self.push(Recorded::Publish(mid));
    }

    fn on_message(&self, _client: &culex::ClientContext<'_>, message: &culex::Message) {
        self.push(Recorded::Message(message.clone()));
    }

    fn on_subscribe(
        &self,
        _client: &culex::ClientContext<'_>,
        mid: u16,
        granted: &[SubscribeReasonCode],
    ) {
        self.push(Recorded::Subscribe(mid, granted.to_vec()));
    }

    fn on_unsubscribe(&self, _client: &culex::ClientContext<'_>, mid: u16) {
        self.push(Recorded::Unsubscribe(mid));
    }
}

#[derive(Debug, Clone, Copy)]
pub enum Behavior {
    /// Accept and acknowledge everything; deliver one canned message per
    /// subscribed filter.
    Normal,
    /// Refuse the handshake with the given CONNACK code.
    Refuse(ConnectReturnCode),
    /// Accept TCP, then close before sending CONNACK.
    DropBeforeConnack,
    /// Accept the handshake, then close the socket shortly afterwards.
    DropAfterConnack,
}

pub struct MockBroker {
    addr: SocketAddr,
    accepted: Arc<AtomicUsize>,
    accept_task: JoinHandle<()>,
}

impl MockBroker {
    pub async fn start(behavior: Behavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = accepted.clone();

        let accept_task = tokio::spawn(async move {
            loop {
                let Ok((stream, _peer)) = listener.accept().await else {
                    return;
                };
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(session(stream, behavior));
            }
        });

        Self {
            addr,
            accepted,
            accept_task,
        }
    }

    pub fn host(&self) -> String {
        self.addr.ip().to_string()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Number of TCP connections accepted so far (one per connect
    /// attempt).
    pub fn connections_accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }
}

impl Drop for MockBroker {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn read_packet(stream: &mut TcpStream, buf: &mut BytesMut) -> Option<Packet> {
    loop {
        match v4::read(buf, MAX_PACKET_SIZE) {
            Ok(packet) => return Some(packet),
            Err(mqttbytes::Error::InsufficientBytes(_)) => {}
            Err(_) => return None,
        }
        if stream.read_buf(buf).await.ok()? == 0 {
            return None;
        }
    }
}

async fn write_packet(stream: &mut TcpStream, packet: Packet) -> Option<()> {
    let mut out = BytesMut::new();
    match &packet {
        Packet::ConnAck(p) => p.write(&mut out),
        Packet::Publish(p) => p.write(&mut out),
        Packet::PubAck(p) => p.write(&mut out),
        Packet::PubRec(p) => p.write(&mut out),
        Packet::PubRel(p) => p.write(&mut out),
        Packet::PubComp(p) => p.write(&mut out),
        Packet::SubAck(p) => p.write(&mut out),
        Packet::UnsubAck(p) => p.write(&mut out),
        Packet::PingResp => v4::PingResp.write(&mut out),
        _ => return None,
    }
    .ok()?;
    stream.write_all(&out).await.ok()?;
    stream.flush().await.ok()
}

/// Topic a canned message is delivered on for a subscribed filter.
pub fn canned_topic(filter: &str) -> String {
    filter
        .replace("/#", "/wild")
        .replace('#', "wild")
        .replace('+', "level")
}

async fn session(mut stream: TcpStream, behavior: Behavior) {
    let mut buf = BytesMut::new();
    let Some(Packet::Connect(_connect)) = read_packet(&mut stream, &mut buf).await else {
        return;
    };

    match behavior {
        Behavior::DropBeforeConnack => return,
        Behavior::Refuse(code) => {
            write_packet(
                &mut stream,
                Packet::ConnAck(ConnAck {
                    session_present: false,
                    code,
                }),
            )
            .await;
            return;
        }
        Behavior::Normal | Behavior::DropAfterConnack => {
            write_packet(
                &mut stream,
                Packet::ConnAck(ConnAck {
                    session_present: false,
                    code: ConnectReturnCode::Success,
                }),
            )
            .await;
        }
    }

    if matches!(behavior, Behavior::DropAfterConnack) {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        return;
    }

    let mut next_delivery_pkid: u16 = 100;
    loop {
        let Some(packet) = read_packet(&mut stream, &mut buf).await else {
            return;
        };
        match packet {
            Packet::Publish(publish) => match publish.qos {
                QoS::AtMostOnce => {}
                QoS::AtLeastOnce => {
                    write_packet(&mut stream, Packet::PubAck(PubAck { pkid: publish.pkid }))
                        .await;
                }
                QoS::ExactlyOnce => {
                    write_packet(&mut stream, Packet::PubRec(PubRec { pkid: publish.pkid }))
                        .await;
                }
            },
            Packet::PubRel(rel) => {
                write_packet(&mut stream, Packet::PubComp(PubComp { pkid: rel.pkid })).await;
            }
            Packet::PubRec(rec) => {
                write_packet(&mut stream, Packet::PubRel(PubRel { pkid: rec.pkid })).await;
            }
            Packet::PubComp(_) => {}
            Packet::Subscribe(subscribe) => {
                let return_codes = subscribe
                    .filters
                    .iter()
                    .map(|filter| SubscribeReasonCode::Success(filter.qos))
                    .collect();
                write_packet(
                    &mut stream,
                    Packet::SubAck(SubAck {
                        pkid: subscribe.pkid,
                        return_codes,
                    }),
                )
                .await;
                for filter in &subscribe.filters {
                    let pkid = if filter.qos == QoS::AtMostOnce {
                        0
                    } else {
                        next_delivery_pkid += 1;
                        next_delivery_pkid
                    };
                    let delivery = Publish {
                        dup: false,
                        qos: filter.qos,
                        retain: false,
                        topic: canned_topic(&filter.path),
                        pkid,
                        payload: Bytes::from_static(CANNED_PAYLOAD),
                    };
                    write_packet(&mut stream, Packet::Publish(delivery)).await;
                }
            }
            Packet::Unsubscribe(unsubscribe) => {
                write_packet(
                    &mut stream,
                    Packet::UnsubAck(UnsubAck {
                        pkid: unsubscribe.pkid,
                    }),
                )
                .await;
            }
            Packet::PingReq => {
                write_packet(&mut stream, Packet::PingResp).await;
            }
            Packet::Disconnect => return,
            _ => {}
        }
    }
}
