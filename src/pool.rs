//! Socket ownership: pooled UDP channels and per-slot stream connections.
//!
//! All live handles are owned here and addressed by id, so recreating a
//! broken socket is replacing a table entry rather than handing new handles
//! around. Channels multiplex several slots over one UDP socket and carry
//! the sender-endpoint routing that makes demultiplexing possible; stream
//! connections are dedicated to a single slot and keep their dial
//! parameters for recreation.

use crate::error::Error;
use crate::slot::{ChannelId, Family, SlotId};
use bytes::Bytes;
#[cfg(unix)]
use mio::net::UnixStream;
use mio::net::{TcpStream, UdpSocket};
use mio::{Events, Interest, Poll, Token};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::collections::{HashMap, HashSet};
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, trace};

//------------ TokenOwner -----------------------------------------------------

/// What a readiness token refers to.
#[derive(Clone, Debug)]
pub(crate) enum TokenOwner {
    /// A pooled UDP channel.
    Channel(ChannelId),

    /// A per-slot stream connection.
    Stream(SlotId),
}

//------------ Dial -----------------------------------------------------------

/// Dial parameters for a stream connection, kept for recreation.
#[derive(Clone, Debug)]
pub(crate) enum Dial {
    /// TCP to a resolved endpoint.
    Tcp(SocketAddr),

    /// Unix stream socket at a path.
    Unix(PathBuf),
}

//------------ StreamSocket ---------------------------------------------------

/// A connected stream socket of either protocol.
enum StreamSocket {
    /// TCP connection.
    Tcp(TcpStream),

    /// Unix stream connection.
    #[cfg(unix)]
    Unix(UnixStream),
}

impl StreamSocket {
    /// Dials a non-blocking stream socket with a bounded connect timeout.
    fn dial(dial: &Dial, timeout: Duration) -> Result<Self, io::Error> {
        match dial {
            Dial::Tcp(addr) => {
                let domain = if addr.is_ipv4() {
                    Domain::IPV4
                } else {
                    Domain::IPV6
                };
                let socket =
                    Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
                socket.connect_timeout(&SockAddr::from(*addr), timeout)?;
                socket.set_nonblocking(true)?;
                Ok(StreamSocket::Tcp(TcpStream::from_std(socket.into())))
            }
            #[cfg(unix)]
            Dial::Unix(path) => {
                let socket = Socket::new(Domain::UNIX, Type::STREAM, None)?;
                socket.connect_timeout(&SockAddr::unix(path)?, timeout)?;
                socket.set_nonblocking(true)?;
                Ok(StreamSocket::Unix(UnixStream::from_std(socket.into())))
            }
            #[cfg(not(unix))]
            Dial::Unix(_) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "unix stream sockets are not available on this platform",
            )),
        }
    }

    /// Registers the socket for readability.
    fn register(
        &mut self,
        registry: &mio::Registry,
        token: Token,
    ) -> Result<(), io::Error> {
        match self {
            StreamSocket::Tcp(sock) => {
                registry.register(sock, token, Interest::READABLE)
            }
            #[cfg(unix)]
            StreamSocket::Unix(sock) => {
                registry.register(sock, token, Interest::READABLE)
            }
        }
    }

    /// Removes the socket from the poller.
    fn deregister(
        &mut self,
        registry: &mio::Registry,
    ) -> Result<(), io::Error> {
        match self {
            StreamSocket::Tcp(sock) => registry.deregister(sock),
            #[cfg(unix)]
            StreamSocket::Unix(sock) => registry.deregister(sock),
        }
    }

    /// Reads once into the buffer.
    fn recv(&mut self, buf: &mut [u8]) -> Result<usize, io::Error> {
        match self {
            StreamSocket::Tcp(sock) => sock.read(buf),
            #[cfg(unix)]
            StreamSocket::Unix(sock) => sock.read(buf),
        }
    }

    /// Writes the whole buffer.
    fn send_all(&mut self, buf: &[u8]) -> Result<(), io::Error> {
        match self {
            StreamSocket::Tcp(sock) => sock.write_all(buf),
            #[cfg(unix)]
            StreamSocket::Unix(sock) => sock.write_all(buf),
        }
    }
}

//------------ UdpChannel -----------------------------------------------------

/// A pooled UDP socket multiplexing one or more slots.
struct UdpChannel {
    /// The live socket; `None` after a failed (re)creation.
    socket: Option<UdpSocket>,

    /// Readiness token, stable across recreations.
    token: Token,

    /// Family the socket binds for; recreation must match it.
    family: Family,

    /// Sender endpoint to slot routing, refreshed on every (re)bind.
    routes: HashMap<SocketAddr, SlotId>,
}

//------------ StreamConn -----------------------------------------------------

/// A per-slot stream connection.
struct StreamConn {
    /// The live socket; `None` after a failed (re)creation.
    socket: Option<StreamSocket>,

    /// Readiness token, stable across recreations.
    token: Token,

    /// Dial parameters for recreation.
    dial: Dial,
}

//------------ SocketPool -----------------------------------------------------

/// Owner of every socket handle in the engine.
pub(crate) struct SocketPool {
    /// The readiness poller all sockets are registered with.
    poll: Poll,

    /// UDP channels by id.
    channels: HashMap<ChannelId, UdpChannel>,

    /// Channel assignment per remote endpoint. Each concurrent slot to one
    /// endpoint gets its own ordinal, and thereby its own channel, because
    /// a received datagram only identifies its sender endpoint.
    assignments: HashMap<SocketAddr, HashMap<SlotId, ChannelId>>,

    /// Stream connections by slot.
    streams: HashMap<SlotId, StreamConn>,

    /// Token to owner lookup for event dispatch.
    owners: HashMap<Token, TokenOwner>,

    /// Next readiness token to hand out.
    next_token: usize,

    /// Channels recreated since the last [`take_recreated`][Self::take_recreated].
    recreated_channels: HashSet<ChannelId>,

    /// Stream slots recreated since the last `take_recreated`.
    recreated_streams: HashSet<SlotId>,
}

impl SocketPool {
    /// Creates an empty pool with a fresh poller.
    pub fn new() -> Result<Self, Error> {
        let poll =
            Poll::new().map_err(|err| Error::PollRegistry(Arc::new(err)))?;
        Ok(Self {
            poll,
            channels: HashMap::new(),
            assignments: HashMap::new(),
            streams: HashMap::new(),
            owners: HashMap::new(),
            next_token: 0,
            recreated_channels: HashSet::new(),
            recreated_streams: HashSet::new(),
        })
    }

    /// Whether the pool holds no sockets at all.
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty() && self.streams.is_empty()
    }

    /// Hands out the next token and remembers its owner.
    fn alloc_token(&mut self, owner: TokenOwner) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        self.owners.insert(token, owner);
        token
    }

    /// Looks up what a readiness token refers to.
    pub fn owner(&self, token: Token) -> Option<&TokenOwner> {
        self.owners.get(&token)
    }

    //--- UDP channels

    /// Picks the channel for a UDP slot.
    ///
    /// The assignment is sticky per slot id; a new slot to an endpoint gets
    /// the channel matching the number of slots already bound there, so
    /// concurrent slots to the same endpoint never share a socket.
    pub fn assign_channel(
        &mut self,
        endpoint: SocketAddr,
        slot: &SlotId,
    ) -> ChannelId {
        let family = Family::of(endpoint.ip());
        let per_endpoint = self.assignments.entry(endpoint).or_default();
        match per_endpoint.get(slot) {
            Some(id) => *id,
            None => {
                let id = ChannelId {
                    family,
                    index: per_endpoint.len(),
                };
                per_endpoint.insert(slot.clone(), id);
                id
            }
        }
    }

    /// Opens the channel unless it already has a live socket.
    ///
    /// With `fatal` a creation failure is returned; otherwise it is logged
    /// and reported as `false`.
    pub fn open_channel(
        &mut self,
        id: ChannelId,
        fatal: bool,
    ) -> Result<bool, Error> {
        if !self.channels.contains_key(&id) {
            let token = self.alloc_token(TokenOwner::Channel(id));
            self.channels.insert(
                id,
                UdpChannel {
                    socket: None,
                    token,
                    family: id.family,
                    routes: HashMap::new(),
                },
            );
        }
        if self
            .channels
            .get(&id)
            .map_or(false, |chan| chan.socket.is_some())
        {
            return Ok(true);
        }
        match self.open_channel_socket(id) {
            Ok(()) => Ok(true),
            Err(err) if fatal => Err(Error::UdpCreate(Arc::new(err))),
            Err(err) => {
                debug!(channel = %id, %err, "cannot create udp socket");
                Ok(false)
            }
        }
    }

    /// Binds a fresh wildcard socket for the channel and registers it.
    fn open_channel_socket(&mut self, id: ChannelId) -> Result<(), io::Error> {
        let (token, family) = match self.channels.get(&id) {
            Some(chan) => (chan.token, chan.family),
            None => return Ok(()),
        };
        let mut socket = UdpSocket::bind(family.wildcard())?;
        self.poll
            .registry()
            .register(&mut socket, token, Interest::READABLE)?;
        if let Some(chan) = self.channels.get_mut(&id) {
            chan.socket = Some(socket);
        }
        Ok(())
    }

    /// Replaces the socket behind a channel. An existing handle is closed
    /// first and the channel is flagged as recreated for this run. Returns
    /// whether a live socket exists afterwards.
    pub fn recreate_channel(&mut self, id: ChannelId) -> bool {
        match self.channels.get_mut(&id) {
            Some(chan) => {
                if let Some(mut old) = chan.socket.take() {
                    self.recreated_channels.insert(id);
                    if let Err(err) =
                        self.poll.registry().deregister(&mut old)
                    {
                        trace!(channel = %id, %err, "deregister failed");
                    }
                }
            }
            None => return false,
        }
        match self.open_channel_socket(id) {
            Ok(()) => true,
            Err(err) => {
                debug!(channel = %id, %err, "cannot create udp socket");
                false
            }
        }
    }

    /// Routes a sender endpoint on a channel to a slot, replacing any
    /// earlier binding of that endpoint.
    pub fn bind_route(
        &mut self,
        id: ChannelId,
        endpoint: SocketAddr,
        slot: SlotId,
    ) {
        if let Some(chan) = self.channels.get_mut(&id) {
            chan.routes.insert(endpoint, slot);
        }
    }

    /// Looks up the slot a sender endpoint maps to on a channel.
    pub fn route(
        &self,
        id: ChannelId,
        endpoint: &SocketAddr,
    ) -> Option<&SlotId> {
        self.channels.get(&id).and_then(|chan| chan.routes.get(endpoint))
    }

    /// All slots currently routed over a channel.
    pub fn routed_slots(&self, id: ChannelId) -> Vec<SlotId> {
        self.channels
            .get(&id)
            .map(|chan| chan.routes.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Fire-and-forget UDP send: each packet is handed to the transport in
    /// order with a pacing pause in between. The return value means the
    /// channel socket is alive, not that any packet arrived anywhere.
    pub fn send_udp(
        &mut self,
        id: ChannelId,
        peer: SocketAddr,
        packets: &[Bytes],
        pacing: Duration,
    ) -> bool {
        let alive = match self.channels.get(&id) {
            Some(chan) => chan.socket.is_some(),
            None => return false,
        };
        if !alive && !self.recreate_channel(id) {
            return false;
        }
        let socket = match self
            .channels
            .get(&id)
            .and_then(|chan| chan.socket.as_ref())
        {
            Some(socket) => socket,
            None => return false,
        };
        for packet in packets {
            if let Err(err) = socket.send_to(packet.as_ref(), peer) {
                trace!(channel = %id, %peer, %err, "udp send failed");
            }
            if !pacing.is_zero() {
                thread::sleep(pacing);
            }
        }
        true
    }

    //--- Stream connections

    /// Dials the stream connection for a slot unless already connected.
    ///
    /// Same `fatal` semantics as [`open_channel`][Self::open_channel].
    pub fn open_stream(
        &mut self,
        slot: &SlotId,
        dial: Dial,
        connect_timeout: Duration,
        fatal: bool,
    ) -> Result<bool, Error> {
        if !self.streams.contains_key(slot) {
            let token = self.alloc_token(TokenOwner::Stream(slot.clone()));
            self.streams.insert(
                slot.clone(),
                StreamConn {
                    socket: None,
                    token,
                    dial,
                },
            );
        }
        if self
            .streams
            .get(slot)
            .map_or(false, |conn| conn.socket.is_some())
        {
            return Ok(true);
        }
        match self.open_stream_socket(slot, connect_timeout) {
            Ok(()) => Ok(true),
            Err(err) if fatal => Err(Error::StreamConnect(Arc::new(err))),
            Err(err) => {
                debug!(slot = %slot, %err, "cannot connect stream socket");
                Ok(false)
            }
        }
    }

    /// Dials and registers the socket for a known stream entry.
    fn open_stream_socket(
        &mut self,
        slot: &SlotId,
        connect_timeout: Duration,
    ) -> Result<(), io::Error> {
        let (token, dial) = match self.streams.get(slot) {
            Some(conn) => (conn.token, conn.dial.clone()),
            None => return Ok(()),
        };
        let mut socket = StreamSocket::dial(&dial, connect_timeout)?;
        socket.register(self.poll.registry(), token)?;
        if let Some(conn) = self.streams.get_mut(slot) {
            conn.socket = Some(socket);
        }
        Ok(())
    }

    /// Replaces a slot's stream socket; flags the slot as recreated when an
    /// old handle had to be closed. Returns whether a live socket exists
    /// afterwards.
    pub fn recreate_stream(
        &mut self,
        slot: &SlotId,
        connect_timeout: Duration,
    ) -> bool {
        match self.streams.get_mut(slot) {
            Some(conn) => {
                if let Some(mut old) = conn.socket.take() {
                    self.recreated_streams.insert(slot.clone());
                    if let Err(err) = old.deregister(self.poll.registry()) {
                        trace!(slot = %slot, %err, "deregister failed");
                    }
                }
            }
            None => return false,
        }
        match self.open_stream_socket(slot, connect_timeout) {
            Ok(()) => true,
            Err(err) => {
                debug!(slot = %slot, %err, "cannot connect stream socket");
                false
            }
        }
    }

    /// Writes packets to a slot's stream in order with pacing pauses.
    ///
    /// A write failure triggers exactly one recreate-and-resend of the
    /// remaining packets; a failure after that gives up. Returns whether
    /// the batch went out completely.
    pub fn send_stream(
        &mut self,
        slot: &SlotId,
        packets: &[Bytes],
        pacing: Duration,
        connect_timeout: Duration,
    ) -> bool {
        let alive = match self.streams.get(slot) {
            Some(conn) => conn.socket.is_some(),
            None => return false,
        };
        if !alive && !self.recreate_stream(slot, connect_timeout) {
            return false;
        }
        match self.write_stream_packets(slot, packets, pacing) {
            Ok(()) => true,
            Err(failed_at) => {
                if !self.recreate_stream(slot, connect_timeout) {
                    return false;
                }
                // One retry of the remainder, no second recursion.
                self.write_stream_packets(slot, &packets[failed_at..], pacing)
                    .is_ok()
            }
        }
    }

    /// Writes packets until one fails; `Err` carries the failing index.
    fn write_stream_packets(
        &mut self,
        slot: &SlotId,
        packets: &[Bytes],
        pacing: Duration,
    ) -> Result<(), usize> {
        let socket = match self
            .streams
            .get_mut(slot)
            .and_then(|conn| conn.socket.as_mut())
        {
            Some(socket) => socket,
            None => return Err(0),
        };
        for (index, packet) in packets.iter().enumerate() {
            if let Err(err) = socket.send_all(packet.as_ref()) {
                debug!(slot = %slot, %err, "stream write failed");
                return Err(index);
            }
            if !pacing.is_zero() {
                thread::sleep(pacing);
            }
        }
        Ok(())
    }

    //--- Receiving

    /// Reads one datagram from a channel, if it has a live socket.
    pub fn recv_udp(
        &self,
        id: ChannelId,
        buf: &mut [u8],
    ) -> Option<Result<(usize, SocketAddr), io::Error>> {
        let socket = self.channels.get(&id)?.socket.as_ref()?;
        Some(socket.recv_from(buf))
    }

    /// Reads once from a slot's stream, if it has a live socket.
    pub fn recv_stream(
        &mut self,
        slot: &SlotId,
        buf: &mut [u8],
    ) -> Option<Result<usize, io::Error>> {
        let socket = self.streams.get_mut(slot)?.socket.as_mut()?;
        Some(socket.recv(buf))
    }

    /// Bounded readiness poll over every pooled socket.
    pub fn poll(
        &mut self,
        events: &mut Events,
        timeout: Option<Duration>,
    ) -> Result<(), Error> {
        match self.poll.poll(events, timeout) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {
                events.clear();
                Ok(())
            }
            Err(err) => Err(Error::Poll(Arc::new(err))),
        }
    }

    //--- Lifecycle

    /// Recreated-socket flags accumulated since the last call.
    pub fn take_recreated(&mut self) -> (HashSet<ChannelId>, HashSet<SlotId>) {
        (
            std::mem::take(&mut self.recreated_channels),
            std::mem::take(&mut self.recreated_streams),
        )
    }

    /// Closes every pooled socket and clears pool state. Idempotent; close
    /// failures are logged, never surfaced.
    pub fn close_all(&mut self) {
        for (id, chan) in self.channels.iter_mut() {
            if let Some(mut socket) = chan.socket.take() {
                if let Err(err) = self.poll.registry().deregister(&mut socket)
                {
                    trace!(channel = %id, %err, "deregister failed on close");
                }
            }
        }
        for (slot, conn) in self.streams.iter_mut() {
            if let Some(mut socket) = conn.socket.take() {
                if let Err(err) = socket.deregister(self.poll.registry()) {
                    trace!(slot = %slot, %err, "deregister failed on close");
                }
            }
        }
        self.channels.clear();
        self.assignments.clear();
        self.streams.clear();
        self.owners.clear();
        self.recreated_channels.clear();
        self.recreated_streams.clear();
    }
}

//============ Tests =========================================================
