//! Allocation options and per-exchange results.

#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

use crate::slot::Transport;
use bytes::Bytes;
use std::path::PathBuf;
use std::time::Duration;

//------------ ExchangeRequest ------------------------------------------------

/// Options for allocating one exchange.
///
/// UDP and TCP require an address and a port; Unix requires a path. Every
/// transport requires at least one outbound packet. Packet contents are
/// opaque to the engine.
#[derive(Clone, Debug)]
pub struct ExchangeRequest {
    /// Transport class to use.
    pub(crate) transport: Transport,

    /// Remote address or hostname (UDP/TCP).
    pub(crate) address: Option<String>,

    /// Remote port (UDP/TCP).
    pub(crate) port: Option<u16>,

    /// Socket path (Unix).
    pub(crate) path: Option<PathBuf>,

    /// Packets to send, in order.
    pub(crate) packets: Vec<Bytes>,

    /// Disables retransmission; the exchange is sent exactly once.
    pub(crate) no_retry: bool,

    /// Upper bound on expected responses; `None` waits until timeout.
    pub(crate) response_count: Option<usize>,
}

impl ExchangeRequest {
    /// Creates an empty request for the given transport.
    pub fn new(transport: Transport) -> Self {
        Self {
            transport,
            address: None,
            port: None,
            path: None,
            packets: Vec::new(),
            no_retry: false,
            response_count: None,
        }
    }

    /// Sets the remote address or hostname.
    pub fn set_address(&mut self, address: impl Into<String>) {
        self.address = Some(address.into());
    }

    /// Sets the remote port. Zero counts as missing at allocation.
    pub fn set_port(&mut self, port: u16) {
        self.port = Some(port);
    }

    /// Sets the socket path for the Unix transport.
    pub fn set_path(&mut self, path: impl Into<PathBuf>) {
        self.path = Some(path.into());
    }

    /// Appends one outbound packet.
    pub fn add_packet(&mut self, packet: impl Into<Bytes>) {
        self.packets.push(packet.into());
    }

    /// Replaces the outbound packet sequence.
    pub fn set_packets(&mut self, packets: Vec<Bytes>) {
        self.packets = packets;
    }

    /// Disables or re-enables retransmission. Exchanges retry by default.
    pub fn set_no_retry(&mut self, no_retry: bool) {
        self.no_retry = no_retry;
    }

    /// Bounds the number of expected responses. Reaching the bound ends the
    /// exchange immediately instead of waiting for the silence timeout.
    pub fn set_response_count(&mut self, count: usize) {
        self.response_count = Some(count);
    }
}

//------------ ExchangeResult -------------------------------------------------

/// Final state of one exchange after a run.
///
/// An empty response list is not an error; an unresponsive target is a
/// normal outcome for this kind of transport.
#[derive(Clone, Debug, Default)]
pub struct ExchangeResult {
    /// Packets received, in arrival order.
    pub responses: Vec<Bytes>,

    /// Whether the underlying socket was recreated during the run. Treat
    /// the responses with suspicion when set.
    pub recreated: bool,

    /// Time from the first send to the first received packet.
    pub first_response_latency: Option<Duration>,
}

impl ExchangeResult {
    /// Number of packets received.
    pub fn response_count(&self) -> usize {
        self.responses.len()
    }
}
