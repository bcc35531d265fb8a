//! Message-id allocation and in-flight operation records.
//!
//! One record exists per outstanding acknowledged operation (QoS > 0
//! publish, subscribe, unsubscribe). Records die on ack receipt, on
//! disconnect cleanup, or on instance teardown. The allocator never hands
//! out an id that is still outstanding.

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::observer::Message;

/// What an outstanding message id is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InFlight {
    /// QoS 1 publish awaiting PUBACK.
    PublishQos1,
    /// QoS 2 publish awaiting PUBREC.
    PublishAwaitingRec,
    /// QoS 2 publish acknowledged with PUBREC; PUBREL sent, awaiting
    /// PUBCOMP.
    PublishAwaitingComp,
    /// SUBSCRIBE awaiting SUBACK.
    Subscribe,
    /// UNSUBSCRIBE awaiting UNSUBACK.
    Unsubscribe,
}

/// Per-session id and in-flight state. Guarded by one mutex on the client
/// instance so command threads and the loop task cannot race.
#[derive(Debug, Default)]
pub(crate) struct Session {
    next_mid: u16,
    pending: HashMap<u16, InFlight>,
    /// Inbound QoS 2 messages held between PUBLISH and PUBREL for
    /// exactly-once delivery.
    inbound: HashMap<u16, Message>,
}

impl Session {
    /// Allocate the next free message id, registering it as `in_flight`
    /// when the operation expects an acknowledgment.
    pub(crate) fn alloc(&mut self, in_flight: Option<InFlight>) -> Result<u16> {
        if self.pending.len() >= usize::from(u16::MAX) - 1 {
            return Err(Error::invalid("no free message id"));
        }
        loop {
            self.next_mid = self.next_mid.wrapping_add(1);
            if self.next_mid == 0 || self.pending.contains_key(&self.next_mid) {
                continue;
            }
            let mid = self.next_mid;
            if let Some(kind) = in_flight {
                self.pending.insert(mid, kind);
            }
            return Ok(mid);
        }
    }

    /// Resolve `mid` if it is outstanding in state `expected`.
    pub(crate) fn acknowledge(&mut self, mid: u16, expected: InFlight) -> bool {
        match self.pending.get(&mid) {
            Some(kind) if *kind == expected => {
                self.pending.remove(&mid);
                true
            }
            _ => false,
        }
    }

    /// PUBREC received for a QoS 2 publish: advance to the PUBCOMP wait.
    pub(crate) fn publish_received(&mut self, mid: u16) -> bool {
        match self.pending.get_mut(&mid) {
            Some(kind) if *kind == InFlight::PublishAwaitingRec => {
                *kind = InFlight::PublishAwaitingComp;
                true
            }
            _ => false,
        }
    }

    /// Hold an inbound QoS 2 message until its PUBREL arrives.
    pub(crate) fn store_inbound(&mut self, mid: u16, message: Message) {
        // A duplicate PUBLISH for the same id replaces the held copy;
        // delivery still happens once, on PUBREL.
        self.inbound.insert(mid, message);
    }

    pub(crate) fn release_inbound(&mut self, mid: u16) -> Option<Message> {
        self.inbound.remove(&mid)
    }

    pub(crate) fn outstanding(&self) -> usize {
        self.pending.len()
    }

    /// Drop every record (disconnect with clean session, reinitialise,
    /// teardown).
    pub(crate) fn reset(&mut self) {
        self.pending.clear();
        self.inbound.clear();
    }
}
