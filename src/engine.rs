//! The transport engine: allocation, the send scheduler, and the receive
//! loop.
//!
//! The run loop alternates two phases. A send tick walks the pending slots
//! in insertion order and issues at most a capped number of sends per
//! transport class; the caps keep file-descriptor and bandwidth pressure
//! bounded no matter how many slots are outstanding. A receive phase then
//! waits for readiness in short bounded slices and drains whatever arrived,
//! expiring slots whose deadline passed. Everything happens on the calling
//! thread; the only blocking is inside bounded readiness polls and the
//! tiny send pacing pauses.

use crate::config::{Config, SELECT_MAX_WAIT};
use crate::error::Error;
use crate::pool::{Dial, SocketPool, TokenOwner};
use crate::request::{ExchangeRequest, ExchangeResult};
use crate::resolver::AddressResolver;
use crate::slot::{
    Binding, ChannelId, ExchangeRegistry, Family, Slot, SlotId, SlotState,
    Transport,
};
use bytes::Bytes;
use mio::Events;
use std::collections::{HashMap, HashSet};
use std::io;
use std::net::SocketAddr;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Readiness event capacity per poll call.
const EVENTS_CAPACITY: usize = 64;

//------------ Engine ---------------------------------------------------------

/// A batch request/response transport engine.
///
/// Callers allocate one slot per exchange, then [`run`][Self::run] drives
/// every slot to completion and returns the aggregated results. Sockets
/// and resolved addresses are pooled across runs until
/// [`shutdown`][Self::shutdown].
pub struct Engine {
    /// Tunables.
    config: Config,

    /// Memoizing host resolver.
    resolver: AddressResolver,

    /// Owner of all socket handles.
    pool: SocketPool,

    /// Pending exchanges for the current run.
    registry: ExchangeRegistry,

    /// Slots awaiting data, with the channel carrying each.
    waiting_udp: HashMap<SlotId, ChannelId>,

    /// Reverse index: waiting slots per channel. A channel leaves the set
    /// once no slot waits on it.
    channel_waiting: HashMap<ChannelId, HashSet<SlotId>>,

    /// Stream slots awaiting data.
    waiting_stream: HashSet<SlotId>,
}

impl Engine {
    /// Creates an engine with the given tunables.
    pub fn new(config: Config) -> Result<Self, Error> {
        Ok(Self {
            config,
            resolver: AddressResolver::default(),
            pool: SocketPool::new()?,
            registry: ExchangeRegistry::default(),
            waiting_udp: HashMap::new(),
            channel_waiting: HashMap::new(),
            waiting_stream: HashSet::new(),
        })
    }

    /// Registers one exchange and prepares its socket.
    ///
    /// Validates the per-transport required fields, resolves the address,
    /// and binds or creates the channel or connection. Creation failure is
    /// fatal here: an exchange without any chance of a socket is a
    /// configuration problem, not a transient fault.
    pub fn allocate(
        &mut self,
        target_id: &str,
        queue_id: &str,
        request: ExchangeRequest,
    ) -> Result<SlotId, Error> {
        if request.packets.is_empty() {
            return Err(Error::MissingField("packets"));
        }
        match request.transport {
            Transport::Udp | Transport::Tcp => {
                let address = match request.address.as_deref() {
                    Some(addr) if !addr.is_empty() => addr,
                    _ => return Err(Error::MissingField("address")),
                };
                let port = match request.port {
                    Some(port) if port != 0 => port,
                    _ => return Err(Error::MissingField("port")),
                };
                let ip = self.resolver.resolve(address)?;
                let endpoint = SocketAddr::new(ip, port);
                let family = Family::of(ip);
                let scope = format!("{}:{}:{}", family.tag(), ip, port);
                let id = SlotId::compose(
                    target_id,
                    queue_id,
                    request.transport,
                    &scope,
                );
                if request.transport == Transport::Udp {
                    let channel = self.pool.assign_channel(endpoint, &id);
                    self.pool.open_channel(channel, true)?;
                    self.pool.bind_route(channel, endpoint, id.clone());
                    self.register_slot(
                        id.clone(),
                        Binding::Udp {
                            channel,
                            peer: endpoint,
                        },
                        request,
                    );
                } else {
                    self.pool.open_stream(
                        &id,
                        Dial::Tcp(endpoint),
                        self.config.connect_timeout(),
                        true,
                    )?;
                    self.register_slot(id.clone(), Binding::Stream, request);
                }
                Ok(id)
            }
            Transport::Unix => {
                let path = match request.path.clone() {
                    Some(path) if !path.as_os_str().is_empty() => path,
                    _ => return Err(Error::MissingField("path")),
                };
                let scope = format!("u:{}", path.display());
                let id = SlotId::compose(
                    target_id,
                    queue_id,
                    Transport::Unix,
                    &scope,
                );
                self.pool.open_stream(
                    &id,
                    Dial::Unix(path),
                    self.config.connect_timeout(),
                    true,
                )?;
                self.register_slot(id.clone(), Binding::Stream, request);
                Ok(id)
            }
        }
    }

    /// Puts the slot into the registry.
    fn register_slot(
        &mut self,
        id: SlotId,
        binding: Binding,
        request: ExchangeRequest,
    ) {
        let slot = Slot::new(
            binding,
            request.packets,
            // Retry by default unless explicitly disabled, for every
            // transport class alike.
            !request.no_retry,
            request.response_count,
        );
        self.registry.insert(id, slot);
    }

    /// Runs every pending exchange to completion.
    ///
    /// Returns the final per-slot results and clears all per-run state.
    /// Expiry is not an error; an unresponsive target simply yields an
    /// empty response list. The only errors surfaced here are
    /// unrecoverable readiness-poll faults.
    pub fn run(&mut self) -> Result<HashMap<SlotId, ExchangeResult>, Error> {
        if self.registry.is_empty() && self.pool.is_empty() {
            return Ok(HashMap::new());
        }

        let mut events = Events::with_capacity(EVENTS_CAPACITY);

        // Data that arrived between runs must not be mistaken for a reply.
        self.clean_sockets(&mut events)?;

        while self.registry.any_pending_send() {
            let (fully_drained, issued) = self.send_tick();

            if issued == 0
                && self.waiting_udp.is_empty()
                && self.waiting_stream.is_empty()
            {
                // Nothing in flight and nothing due yet.
                thread::sleep(self.config.loop_timeout());
                continue;
            }

            let budget = if fully_drained {
                self.config.read_timeout().max(self.config.read_retry_timeout())
            } else {
                // A capped tick trades wait time for send-burst smoothing.
                self.config.loop_timeout()
            };

            let started = Instant::now();
            loop {
                if self.waiting_udp.is_empty() && self.waiting_stream.is_empty()
                {
                    break;
                }
                self.mark_overdue();
                if !self.receive_phase(started, budget, &mut events)? {
                    break;
                }
            }
        }

        Ok(self.finish_run())
    }

    /// Closes every pooled socket and clears all cached state. Idempotent
    /// and safe to call without a prior run.
    pub fn shutdown(&mut self) {
        self.pool.close_all();
        self.resolver.clear();
        self.registry.clear();
        self.waiting_udp.clear();
        self.channel_waiting.clear();
        self.waiting_stream.clear();
    }

    //--- Send scheduling

    /// One scheduler tick: sends due slots up to the per-class caps.
    ///
    /// Returns whether every eligible slot actually went out (nothing held
    /// back by a cap) and how many sends were issued.
    fn send_tick(&mut self) -> (bool, usize) {
        let mut udp_sent = 0;
        let mut stream_sent = 0;
        let mut issued = 0;
        let mut fully_drained = true;

        for id in self.registry.ids() {
            let (binding, attempts, last_sent, retry, packets) =
                match self.registry.get(&id) {
                    Some(slot) if slot.needs_send => (
                        slot.binding.clone(),
                        slot.attempts,
                        slot.last_sent,
                        slot.retry,
                        slot.packets.clone(),
                    ),
                    _ => continue,
                };
            let is_udp = matches!(binding, Binding::Udp { .. });
            let udp_capped = udp_sent >= self.config.send_once_udp();
            let stream_capped =
                stream_sent >= self.config.send_once_stream();
            if (is_udp && udp_capped) || (!is_udp && stream_capped) {
                // Only a held-back pending slot makes the tick capped;
                // finished slots left in the registry do not count.
                fully_drained = false;
                if udp_capped && stream_capped {
                    break;
                }
                continue;
            }

            let now = Instant::now();
            if attempts > 0 {
                let timeout = if attempts == 1 {
                    self.config.read_timeout()
                } else {
                    self.config.read_retry_timeout()
                };
                let due = last_sent
                    .map_or(true, |sent| now.duration_since(sent) >= timeout);
                if !due {
                    continue;
                }
                if attempts > self.config.send_retry() {
                    debug!(slot = %id, "exchange timed out");
                    if let Some(slot) = self.registry.get_mut(&id) {
                        slot.needs_send = false;
                        if slot.responses.is_empty() {
                            slot.state = SlotState::Expired;
                        }
                    }
                    continue;
                }
            }

            // Fire-once: a no-retry slot leaves the pending-send set as
            // soon as its first send is issued, though it keeps waiting
            // for responses.
            if !retry {
                if let Some(slot) = self.registry.get_mut(&id) {
                    slot.needs_send = false;
                }
            }

            let sent_ok = match binding {
                Binding::Udp { channel, peer } => self.pool.send_udp(
                    channel,
                    peer,
                    &packets,
                    self.config.send_delay_udp(),
                ),
                Binding::Stream => self.pool.send_stream(
                    &id,
                    &packets,
                    self.config.send_delay_stream(),
                    self.config.connect_timeout(),
                ),
            };

            // The attempt counts even when the socket was unavailable, so
            // a permanently broken target still runs out of retries and
            // the run terminates.
            if let Some(slot) = self.registry.get_mut(&id) {
                slot.note_sent(now);
            }

            if !sent_ok {
                trace!(slot = %id, "send skipped, socket unavailable");
                continue;
            }

            issued += 1;
            if is_udp {
                udp_sent += 1;
            } else {
                stream_sent += 1;
            }

            match binding {
                Binding::Udp { channel, .. } => {
                    self.waiting_udp.insert(id.clone(), channel);
                    self.channel_waiting
                        .entry(channel)
                        .or_default()
                        .insert(id.clone());
                }
                Binding::Stream => {
                    self.waiting_stream.insert(id.clone());
                }
            }
        }

        (fully_drained, issued)
    }

    //--- Receiving

    /// One bounded-wait poll followed by a full drain of ready sockets.
    ///
    /// Returns `false` once the wait budget is exhausted, signalling the
    /// run loop to go back to sending.
    fn receive_phase(
        &mut self,
        started: Instant,
        budget: Duration,
        events: &mut Events,
    ) -> Result<bool, Error> {
        let elapsed = started.elapsed();
        if elapsed >= budget {
            return Ok(false);
        }
        let wait = (budget - elapsed).min(SELECT_MAX_WAIT);

        self.pool.poll(events, Some(wait))?;
        while !events.is_empty() {
            self.dispatch_events(events);
            // Re-poll without waiting to drain bursts completely before
            // yielding back to deadline checks.
            self.pool.poll(events, Some(Duration::ZERO))?;
        }
        Ok(true)
    }

    /// Routes one batch of readiness events, UDP channels first: datagram
    /// volume dominates and must not be starved by stream handling.
    fn dispatch_events(&mut self, events: &Events) {
        let mut udp_ready: Vec<(ChannelId, bool)> = Vec::new();
        let mut stream_ready: Vec<(SlotId, bool)> = Vec::new();
        for event in events.iter() {
            let faulted = event.is_error() || event.is_read_closed();
            match self.pool.owner(event.token()) {
                Some(TokenOwner::Channel(id)) => {
                    udp_ready.push((*id, faulted))
                }
                Some(TokenOwner::Stream(id)) => {
                    stream_ready.push((id.clone(), faulted))
                }
                None => {
                    trace!(token = ?event.token(), "event for unknown token")
                }
            }
        }
        for (channel, faulted) in udp_ready {
            let faulted = self.drain_channel(channel) || faulted;
            if faulted {
                self.recreate_or_drop_channel(channel);
            }
        }
        for (id, faulted) in stream_ready {
            let faulted = self.drain_stream(&id) || faulted;
            if faulted {
                self.recreate_or_drop_stream(&id);
            }
        }
    }

    /// Reads datagrams from a channel until it would block, routing each
    /// to its slot. Returns whether the socket faulted mid-drain.
    fn drain_channel(&mut self, channel: ChannelId) -> bool {
        let mut buf = vec![0u8; self.config.recv_buffer_size()];
        loop {
            let result = match self.pool.recv_udp(channel, &mut buf) {
                Some(result) => result,
                None => return false,
            };
            match result {
                Ok((len, sender)) => {
                    if len == 0 {
                        debug!(channel = %channel, "empty datagram");
                        return true;
                    }
                    let id = match self.pool.route(channel, &sender) {
                        Some(id) => id.clone(),
                        None => {
                            debug!(
                                channel = %channel,
                                %sender,
                                "datagram from unknown sender"
                            );
                            continue;
                        }
                    };
                    if !self.waiting_udp.contains_key(&id) {
                        debug!(slot = %id, "datagram for finished exchange");
                        continue;
                    }
                    let packet = Bytes::copy_from_slice(&buf[..len]);
                    self.deliver(&id, packet, true);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    return false
                }
                Err(err) => {
                    debug!(channel = %channel, %err, "udp receive failed");
                    return true;
                }
            }
        }
    }

    /// Reads from a slot's stream until it would block. Returns whether
    /// the socket faulted mid-drain; a clean close counts as a fault.
    fn drain_stream(&mut self, id: &SlotId) -> bool {
        let mut buf = vec![0u8; self.config.recv_buffer_size()];
        loop {
            let result = match self.pool.recv_stream(id, &mut buf) {
                Some(result) => result,
                None => return false,
            };
            match result {
                Ok(0) => {
                    debug!(slot = %id, "stream closed by peer");
                    return true;
                }
                Ok(len) => {
                    if !self.waiting_stream.contains(id) {
                        debug!(slot = %id, "data for finished exchange");
                        continue;
                    }
                    let packet = Bytes::copy_from_slice(&buf[..len]);
                    self.deliver(id, packet, false);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    return false
                }
                Err(err) => {
                    debug!(slot = %id, %err, "stream read failed");
                    return true;
                }
            }
        }
    }

    /// Appends a received packet to a slot and updates the waiting sets.
    fn deliver(&mut self, id: &SlotId, packet: Bytes, is_udp: bool) {
        let now = Instant::now();
        let done = match self.registry.get_mut(id) {
            Some(slot) => slot.note_received(packet, now),
            None => return,
        };
        trace!(slot = %id, "response delivered");
        if done {
            if is_udp {
                self.drop_waiting_udp(id);
            } else {
                self.waiting_stream.remove(id);
            }
        }
    }

    /// Recreates a channel socket after a fault. When recreation fails,
    /// every slot waiting on the channel gives up for this receive phase;
    /// recreation cannot restore in-flight exchanges either way, so
    /// surviving slots get re-sent by a later tick if they still may.
    fn recreate_or_drop_channel(&mut self, channel: ChannelId) {
        debug!(channel = %channel, "recreating udp socket");
        if self.pool.recreate_channel(channel) {
            return;
        }
        if let Some(slots) = self.channel_waiting.remove(&channel) {
            for id in slots {
                self.waiting_udp.remove(&id);
                if let Some(slot) = self.registry.get_mut(&id) {
                    slot.finish_waiting();
                }
            }
        }
    }

    /// Stream counterpart of [`recreate_or_drop_channel`][Self::recreate_or_drop_channel].
    fn recreate_or_drop_stream(&mut self, id: &SlotId) {
        debug!(slot = %id, "recreating stream socket");
        if self.pool.recreate_stream(id, self.config.connect_timeout()) {
            return;
        }
        self.waiting_stream.remove(id);
        if let Some(slot) = self.registry.get_mut(id) {
            slot.finish_waiting();
        }
    }

    /// Removes slots whose wait deadline passed from the waiting sets.
    fn mark_overdue(&mut self) {
        let now = Instant::now();
        let read_timeout = self.config.read_timeout();
        let retry_timeout = self.config.read_retry_timeout();
        let got_timeout = self.config.read_got_timeout();

        let overdue_udp: Vec<SlotId> = self
            .waiting_udp
            .keys()
            .filter(|id| {
                self.registry.get(id).map_or(true, |slot| {
                    slot.is_overdue(
                        now,
                        read_timeout,
                        retry_timeout,
                        got_timeout,
                    )
                })
            })
            .cloned()
            .collect();
        for id in overdue_udp {
            trace!(slot = %id, "wait deadline passed");
            self.drop_waiting_udp(&id);
            if let Some(slot) = self.registry.get_mut(&id) {
                slot.finish_waiting();
            }
        }

        let overdue_stream: Vec<SlotId> = self
            .waiting_stream
            .iter()
            .filter(|id| {
                self.registry.get(id).map_or(true, |slot| {
                    slot.is_overdue(
                        now,
                        read_timeout,
                        retry_timeout,
                        got_timeout,
                    )
                })
            })
            .cloned()
            .collect();
        for id in overdue_stream {
            trace!(slot = %id, "wait deadline passed");
            self.waiting_stream.remove(&id);
            if let Some(slot) = self.registry.get_mut(&id) {
                slot.finish_waiting();
            }
        }
    }

    /// Drops a slot from the UDP waiting sets, releasing its channel from
    /// the polled set once no other slot waits on it.
    fn drop_waiting_udp(&mut self, id: &SlotId) {
        if let Some(channel) = self.waiting_udp.remove(id) {
            if let Some(set) = self.channel_waiting.get_mut(&channel) {
                set.remove(id);
                if set.is_empty() {
                    self.channel_waiting.remove(&channel);
                }
            }
        }
    }

    //--- Run lifecycle

    /// Drains stale data left on pooled sockets and recreates sockets that
    /// report errors, using zero-wait polls only.
    fn clean_sockets(&mut self, events: &mut Events) -> Result<(), Error> {
        if self.pool.is_empty() {
            return Ok(());
        }
        loop {
            self.pool.poll(events, Some(Duration::ZERO))?;
            if events.is_empty() {
                return Ok(());
            }
            // The waiting sets are empty before a run, so every packet
            // drained here is discarded as stale.
            self.dispatch_events(events);
        }
    }

    /// Emits results for every allocated slot and clears per-run state.
    fn finish_run(&mut self) -> HashMap<SlotId, ExchangeResult> {
        let (recreated_channels, recreated_streams) =
            self.pool.take_recreated();
        let mut flagged: HashSet<SlotId> = recreated_streams;
        for channel in recreated_channels {
            // Every slot multiplexed over a recreated channel may have
            // lost data.
            flagged.extend(self.pool.routed_slots(channel));
        }

        let mut results = HashMap::new();
        for (id, slot) in self.registry.drain() {
            let recreated = flagged.contains(&id);
            results.insert(
                id,
                ExchangeResult {
                    responses: slot.responses,
                    recreated,
                    first_response_latency: slot.first_response_latency,
                },
            );
        }
        self.waiting_udp.clear();
        self.channel_waiting.clear();
        self.waiting_stream.clear();
        results
    }
}

//============ Tests =========================================================
