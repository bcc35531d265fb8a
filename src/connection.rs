//! A live, framed broker connection.
//!
//! Wraps the network stream with the wire codec's framing: inbound bytes
//! accumulate in a buffer until a whole packet decodes; outbound packets
//! serialize into a write buffer flushed as one unit, so a packet is never
//! interleaved with another writer's bytes. Also owns the keep-alive
//! clocks.

use std::time::{Duration, Instant};

use bytes::BytesMut;
use rumqttc::mqttbytes;
use rumqttc::mqttbytes::v4::{self, Packet};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::trace;

use crate::error::{Error, Result};
use crate::transport::{NetworkStream, SocketHandle};

/// Grace multiplier: a ping response must arrive within 1.5 keep-alive
/// intervals of the last inbound traffic.
fn ping_deadline(last_incoming: Instant, keep_alive: Duration) -> Instant {
    last_incoming + keep_alive + keep_alive / 2
}

pub(crate) struct Connection {
    stream: Box<dyn NetworkStream>,
    read_buf: BytesMut,
    write_buf: BytesMut,
    max_packet_size: usize,
    keep_alive: Duration,
    last_incoming: Instant,
    last_outgoing: Instant,
    ping_outstanding: bool,
    handle: Option<SocketHandle>,
}

impl Connection {
    pub(crate) fn new(
        stream: Box<dyn NetworkStream>,
        keep_alive_secs: u16,
        max_packet_size: usize,
    ) -> Self {
        let now = Instant::now();
        let handle = stream.socket_handle();
        Self {
            stream,
            read_buf: BytesMut::with_capacity(4 * 1024),
            write_buf: BytesMut::with_capacity(4 * 1024),
            max_packet_size,
            keep_alive: Duration::from_secs(u64::from(keep_alive_secs)),
            last_incoming: now,
            last_outgoing: now,
            ping_outstanding: false,
            handle,
        }
    }

    pub(crate) fn socket_handle(&self) -> Option<SocketHandle> {
        self.handle
    }

    /// Decode the next packet, reading from the stream as needed.
    ///
    /// Cancel-safe: partially received bytes stay in the read buffer.
    pub(crate) async fn read_packet(&mut self) -> Result<Packet> {
        loop {
            match v4::read(&mut self.read_buf, self.max_packet_size) {
                Ok(packet) => {
                    self.last_incoming = Instant::now();
                    trace!(?packet, "received packet");
                    return Ok(packet);
                }
                Err(mqttbytes::Error::InsufficientBytes(_)) => {}
                Err(err) => return Err(Error::Protocol(err)),
            }
            let read = self.stream.read_buf(&mut self.read_buf).await?;
            if read == 0 {
                return Err(Error::ConnectionLost);
            }
        }
    }

    /// Serialize a packet into the write buffer (no I/O).
    pub(crate) fn enqueue(&mut self, packet: &Packet) -> Result<()> {
        use Packet::*;
        trace!(?packet, "queueing packet");
        let buf = &mut self.write_buf;
        match packet {
            Connect(p) => p.write(buf),
            ConnAck(p) => p.write(buf),
            Publish(p) => p.write(buf),
            PubAck(p) => p.write(buf),
            PubRec(p) => p.write(buf),
            PubRel(p) => p.write(buf),
            PubComp(p) => p.write(buf),
            Subscribe(p) => p.write(buf),
            SubAck(p) => p.write(buf),
            Unsubscribe(p) => p.write(buf),
            UnsubAck(p) => p.write(buf),
            PingReq => v4::PingReq.write(buf),
            PingResp => v4::PingResp.write(buf),
            Disconnect => v4::Disconnect.write(buf),
        }
        .map_err(Error::Protocol)?;
        Ok(())
    }

    pub(crate) fn has_pending_write(&self) -> bool {
        !self.write_buf.is_empty()
    }

    /// Push buffered packets onto the wire.
    pub(crate) async fn flush(&mut self) -> Result<()> {
        if self.write_buf.is_empty() {
            return Ok(());
        }
        self.stream.write_all(&self.write_buf).await?;
        self.stream.flush().await?;
        self.write_buf.clear();
        self.last_outgoing = Instant::now();
        Ok(())
    }

    pub(crate) fn pong_received(&mut self) {
        self.ping_outstanding = false;
    }

    /// Service the keep-alive timers: queue a PINGREQ when the interval
    /// elapsed, fail when an outstanding ping went unanswered.
    ///
    /// Returns whether a ping was queued (the caller flushes).
    pub(crate) fn service_keep_alive(&mut self) -> Result<bool> {
        if self.keep_alive.is_zero() {
            return Ok(false);
        }
        let now = Instant::now();
        if self.ping_outstanding {
            if now >= ping_deadline(self.last_incoming, self.keep_alive) {
                return Err(Error::ConnectionLost);
            }
            return Ok(false);
        }
        if now.duration_since(self.last_outgoing) >= self.keep_alive
            || now.duration_since(self.last_incoming) >= self.keep_alive
        {
            self.enqueue(&Packet::PingReq)?;
            self.ping_outstanding = true;
            return Ok(true);
        }
        Ok(false)
    }

    /// Next instant at which keep-alive needs servicing, if enabled.
    pub(crate) fn keep_alive_deadline(&self) -> Option<Instant> {
        if self.keep_alive.is_zero() {
            return None;
        }
        if self.ping_outstanding {
            return Some(ping_deadline(self.last_incoming, self.keep_alive));
        }
        let idle_since = self.last_incoming.min(self.last_outgoing);
        Some(idle_since + self.keep_alive)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use rumqttc::mqttbytes::v4::{ConnAck, ConnectReturnCode, Publish};
    use rumqttc::mqttbytes::QoS;
    use tokio::io::AsyncWriteExt as _;
    use tokio::net::{TcpListener, TcpStream};

    async fn pair() -> (Connection, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (Connection::new(Box::new(client), 60, 256 * 1024), server)
    }

    #[tokio::test]
    async fn round_trips_a_packet() {
        let (mut conn, mut server) = pair().await;

        let mut raw = BytesMut::new();
        ConnAck {
            session_present: false,
            code: ConnectReturnCode::Success,
        }
        .write(&mut raw)
        .unwrap();
        server.write_all(&raw).await.unwrap();

        match conn.read_packet().await.unwrap() {
            Packet::ConnAck(ack) => {
                assert_eq!(ack.code, ConnectReturnCode::Success);
                assert!(!ack.session_present);
            }
            other => panic!("expected CONNACK, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn partial_frames_wait_for_more_bytes() {
        let (mut conn, mut server) = pair().await;

        let mut raw = BytesMut::new();
        Publish {
            dup: false,
            qos: QoS::AtMostOnce,
            retain: false,
            topic: "alpha/beta".to_string(),
            pkid: 0,
            payload: Bytes::from_static(b"payload"),
        }
        .write(&mut raw)
        .unwrap();
        let split = raw.len() / 2;

        let write_half = raw.split_to(split);
        server.write_all(&write_half).await.unwrap();
        server.flush().await.unwrap();

        let remainder = raw;
        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            server.write_all(&remainder).await.unwrap();
            server
        });

        match conn.read_packet().await.unwrap() {
            Packet::Publish(publish) => assert_eq!(publish.topic, "alpha/beta"),
            other => panic!("expected PUBLISH, got {other:?}"),
        }
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn peer_close_reports_connection_lost() {
        let (mut conn, server) = pair().await;
        drop(server);
        assert!(matches!(
            conn.read_packet().await,
            Err(Error::ConnectionLost)
        ));
    }

    #[tokio::test]
    async fn keep_alive_pings_after_idle_interval() {
        let (mut conn, _server) = pair().await;
        conn.keep_alive = Duration::from_millis(10);
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(conn.service_keep_alive().unwrap());
        assert!(conn.has_pending_write());
        // A second ping is not queued while one is outstanding.
        assert!(!conn.service_keep_alive().unwrap());
    }

    #[tokio::test]
    async fn unanswered_ping_times_out() {
        let (mut conn, _server) = pair().await;
        conn.keep_alive = Duration::from_millis(10);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(conn.service_keep_alive().unwrap());

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(matches!(
            conn.service_keep_alive(),
            Err(Error::ConnectionLost)
        ));
    }

    #[tokio::test]
    async fn pong_clears_the_outstanding_ping() {
        let (mut conn, _server) = pair().await;
        conn.keep_alive = Duration::from_millis(10);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(conn.service_keep_alive().unwrap());

        // A PINGRESP counts as inbound traffic, then clears the flag.
        conn.last_incoming = Instant::now();
        conn.pong_received();
        conn.flush().await.unwrap();
        assert!(!conn.service_keep_alive().unwrap());
    }

    #[tokio::test]
    async fn keep_alive_zero_disables_the_timer() {
        let (mut conn, _server) = pair().await;
        conn.keep_alive = Duration::ZERO;
        assert!(!conn.service_keep_alive().unwrap());
        assert!(conn.keep_alive_deadline().is_none());
    }
}
