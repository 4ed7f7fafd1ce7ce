//! Exchange slots and the per-run registry.
//!
//! A slot is one pending request/response exchange. Its identity combines
//! the caller-supplied target and queue ids with the transport and the
//! resolved endpoint, so two queues querying the same target stay distinct,
//! as do two targets resolving to different addresses of one hostname.

use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

//------------ Transport ------------------------------------------------------

/// Transport class of an exchange.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Transport {
    /// Datagrams over a pooled, shared channel socket.
    Udp,
    /// A dedicated TCP connection per slot.
    Tcp,
    /// A dedicated Unix stream connection per slot.
    Unix,
}

impl Transport {
    /// Short tag used when composing slot ids.
    pub(crate) fn tag(self) -> &'static str {
        match self {
            Transport::Udp => "udp",
            Transport::Tcp => "tcp",
            Transport::Unix => "unix",
        }
    }
}

//------------ Family ---------------------------------------------------------

/// Address family of a resolved endpoint.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub(crate) enum Family {
    /// IPv4.
    V4,
    /// IPv6.
    V6,
}

impl Family {
    /// The family of the given address.
    pub fn of(addr: IpAddr) -> Self {
        if addr.is_ipv4() {
            Family::V4
        } else {
            Family::V6
        }
    }

    /// Single-character tag used in slot ids and channel ids.
    pub fn tag(self) -> char {
        match self {
            Family::V4 => '4',
            Family::V6 => '6',
        }
    }

    /// The wildcard local address channel sockets bind to.
    pub fn wildcard(self) -> SocketAddr {
        match self {
            Family::V4 => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            Family::V6 => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
        }
    }
}

//------------ SlotId ---------------------------------------------------------

/// Opaque identity of one pending exchange.
///
/// Cheap to clone; composed from target, queue, transport, and resolved
/// endpoint. Allocating twice with the same composition replaces the
/// earlier pending exchange.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct SlotId(Arc<str>);

impl SlotId {
    /// Composes a slot id from its parts.
    pub(crate) fn compose(
        target: &str,
        queue: &str,
        transport: Transport,
        scope: &str,
    ) -> Self {
        SlotId(
            format!("{}:{}:{}:{}", target, queue, transport.tag(), scope)
                .into(),
        )
    }

    /// Returns the composed form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

//------------ ChannelId ------------------------------------------------------

/// Identity of a pooled UDP channel: address family plus the per-endpoint
/// ordinal of the slot it was first created for.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub(crate) struct ChannelId {
    /// Address family the channel socket is bound for.
    pub family: Family,

    /// Per-endpoint ordinal; the n-th concurrent slot to one endpoint uses
    /// channel n of its family.
    pub index: usize,
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.family.tag(), self.index)
    }
}

//------------ Binding --------------------------------------------------------

/// How a slot reaches the wire.
#[derive(Clone, Debug)]
pub(crate) enum Binding {
    /// Datagrams via a shared channel, addressed to `peer`.
    Udp {
        /// The channel carrying this slot.
        channel: ChannelId,
        /// Remote endpoint packets are sent to and accepted from.
        peer: SocketAddr,
    },
    /// A dedicated stream connection, looked up by slot id.
    Stream,
}

//------------ SlotState ------------------------------------------------------

/// Progress of one exchange through its lifetime.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum SlotState {
    /// Nothing has been sent yet.
    Unsent,

    /// Sent at least once, nothing received yet.
    AwaitingFirst,

    /// At least one response received, more may follow.
    AwaitingMore,

    /// The expected response count was reached, or silence after data
    /// signalled a normal end of the exchange.
    Satisfied,

    /// The retry budget ran out with nothing received.
    Expired,
}

//------------ Slot -----------------------------------------------------------

/// One pending exchange.
#[derive(Debug)]
pub(crate) struct Slot {
    /// Transport binding.
    pub binding: Binding,

    /// Outbound packets, sent in order on every attempt.
    pub packets: Vec<Bytes>,

    /// Whether unanswered sends are retried.
    pub retry: bool,

    /// Whether the slot is in the pending-send set.
    pub needs_send: bool,

    /// Lifecycle state.
    pub state: SlotState,

    /// Number of send attempts so far.
    pub attempts: u8,

    /// When the first attempt went out.
    pub first_sent: Option<Instant>,

    /// When the latest attempt went out.
    pub last_sent: Option<Instant>,

    /// When the latest response arrived.
    pub last_received: Option<Instant>,

    /// Received packets, in arrival order.
    pub responses: Vec<Bytes>,

    /// Time from first send to first received packet.
    pub first_response_latency: Option<Duration>,

    /// Upper bound on responses; `None` means unbounded until timeout.
    pub max_responses: Option<usize>,
}

impl Slot {
    /// Creates a fresh, unsent slot.
    pub fn new(
        binding: Binding,
        packets: Vec<Bytes>,
        retry: bool,
        max_responses: Option<usize>,
    ) -> Self {
        Self {
            binding,
            packets,
            retry,
            needs_send: true,
            state: SlotState::Unsent,
            attempts: 0,
            first_sent: None,
            last_sent: None,
            last_received: None,
            responses: Vec::new(),
            first_response_latency: None,
            max_responses,
        }
    }

    /// Records one send attempt.
    pub fn note_sent(&mut self, now: Instant) {
        self.attempts = self.attempts.saturating_add(1);
        self.last_sent = Some(now);
        if self.first_sent.is_none() {
            self.first_sent = Some(now);
        }
        if self.state == SlotState::Unsent {
            self.state = SlotState::AwaitingFirst;
        }
    }

    /// Appends a received packet. Returns whether the expected response
    /// count is now met.
    pub fn note_received(&mut self, packet: Bytes, now: Instant) -> bool {
        self.needs_send = false;
        self.last_received = Some(now);
        if self.first_response_latency.is_none() {
            if let Some(first) = self.first_sent {
                self.first_response_latency = Some(now.duration_since(first));
            }
        }
        self.responses.push(packet);
        let done = self
            .max_responses
            .map_or(false, |max| self.responses.len() >= max);
        self.state = if done {
            SlotState::Satisfied
        } else {
            SlotState::AwaitingMore
        };
        done
    }

    /// Whether the slot's current wait deadline has passed.
    ///
    /// Before any data arrives the deadline follows the two-tier send
    /// timeouts; afterwards the shorter inter-packet timeout applies.
    pub fn is_overdue(
        &self,
        now: Instant,
        read_timeout: Duration,
        read_retry_timeout: Duration,
        read_got_timeout: Duration,
    ) -> bool {
        if self.responses.is_empty() {
            let timeout = if self.attempts == 1 {
                read_timeout
            } else {
                read_retry_timeout
            };
            match self.last_sent {
                Some(sent) => now.duration_since(sent) >= timeout,
                None => false,
            }
        } else {
            match self.last_received {
                Some(received) => {
                    now.duration_since(received) >= read_got_timeout
                }
                None => false,
            }
        }
    }

    /// Settles the state when the slot leaves the waiting set without its
    /// expected count being met.
    pub fn finish_waiting(&mut self) {
        self.state = if !self.responses.is_empty() {
            // Silence after data is a normal end of the exchange.
            SlotState::Satisfied
        } else if self.needs_send {
            // A retry is still pending; not final yet.
            SlotState::AwaitingFirst
        } else {
            SlotState::Expired
        };
    }
}

//------------ ExchangeRegistry -----------------------------------------------

/// Table of pending exchanges, iterated in insertion order.
#[derive(Debug, Default)]
pub(crate) struct ExchangeRegistry {
    /// Slots by id.
    slots: HashMap<SlotId, Slot>,

    /// Insertion order of slot ids.
    order: Vec<SlotId>,
}

impl ExchangeRegistry {
    /// Adds a slot, replacing any earlier slot with the same id.
    pub fn insert(&mut self, id: SlotId, slot: Slot) {
        if self.slots.insert(id.clone(), slot).is_none() {
            self.order.push(id);
        }
    }

    /// Returns a slot.
    pub fn get(&self, id: &SlotId) -> Option<&Slot> {
        self.slots.get(id)
    }

    /// Returns a slot for updating.
    pub fn get_mut(&mut self, id: &SlotId) -> Option<&mut Slot> {
        self.slots.get_mut(id)
    }

    /// Snapshot of all ids in insertion order.
    pub fn ids(&self) -> Vec<SlotId> {
        self.order.clone()
    }

    /// Whether any slot still wants to be sent.
    pub fn any_pending_send(&self) -> bool {
        self.slots.values().any(|slot| slot.needs_send)
    }

    /// Whether the registry holds no slots.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Removes and returns all slots in insertion order.
    pub fn drain(&mut self) -> Vec<(SlotId, Slot)> {
        let order = std::mem::take(&mut self.order);
        order
            .into_iter()
            .filter_map(|id| self.slots.remove(&id).map(|slot| (id, slot)))
            .collect()
    }

    /// Drops everything.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.order.clear();
    }
}

//============ Tests =========================================================
