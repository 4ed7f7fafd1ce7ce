//! Engine tunables.

#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

use core::cmp;
use std::time::Duration;

//------------ Configuration Constants ----------------------------------------

/// Configuration limits for the stream connect timeout.
const CONNECT_TIMEOUT: DefMinMax<Duration> = DefMinMax::new(
    Duration::from_secs(1),
    Duration::from_millis(10),
    Duration::from_secs(60),
);

/// Configuration limits for the per-tick UDP send cap.
const SEND_ONCE_UDP: DefMinMax<usize> = DefMinMax::new(5, 1, 1000);

/// Configuration limits for the per-tick stream send cap.
const SEND_ONCE_STREAM: DefMinMax<usize> = DefMinMax::new(5, 1, 1000);

/// Configuration limits for the inter-packet send pacing delay.
const SEND_DELAY: DefMinMax<Duration> = DefMinMax::new(
    Duration::from_micros(100),
    Duration::ZERO,
    Duration::from_millis(10),
);

/// Configuration limits for the main read timeout.
const READ_TIMEOUT: DefMinMax<Duration> = DefMinMax::new(
    Duration::from_millis(600),
    Duration::from_millis(1),
    Duration::from_secs(60),
);

/// Configuration limits for the post-first-response inter-packet timeout.
const READ_GOT_TIMEOUT: DefMinMax<Duration> = DefMinMax::new(
    Duration::from_millis(20),
    Duration::from_millis(1),
    Duration::from_secs(10),
);

/// Configuration limits for the inter-retry read timeout.
const READ_RETRY_TIMEOUT: DefMinMax<Duration> = DefMinMax::new(
    Duration::from_millis(200),
    Duration::from_millis(1),
    Duration::from_secs(60),
);

/// Configuration limits for the inter-tick loop wait.
const LOOP_TIMEOUT: DefMinMax<Duration> = DefMinMax::new(
    Duration::from_millis(2),
    Duration::from_millis(1),
    Duration::from_secs(1),
);

/// Configuration limits for the receive buffer size.
const RECV_BUFFER_SIZE: DefMinMax<usize> = DefMinMax::new(8192, 512, 65536);

/// Configuration limits for the maximum number of retransmissions.
const SEND_RETRY: DefMinMax<u8> = DefMinMax::new(1, 0, 100);

/// Hard cap on a single readiness-poll wait. Keeping individual waits short
/// lets the receive loop re-evaluate slot deadlines frequently instead of
/// blocking for the full remaining budget in one call.
pub(crate) const SELECT_MAX_WAIT: Duration = Duration::from_millis(1);

//------------ Config ---------------------------------------------------------

/// Configuration for a transport engine.
#[derive(Clone, Debug)]
pub struct Config {
    /// Timeout for dialing a stream connection.
    connect_timeout: Duration,

    /// Maximum number of UDP slots sent per scheduler tick.
    send_once_udp: usize,

    /// Maximum number of stream slots sent per scheduler tick.
    send_once_stream: usize,

    /// Pause between consecutive outbound UDP packets of one slot.
    send_delay_udp: Duration,

    /// Pause between consecutive outbound stream packets of one slot.
    send_delay_stream: Duration,

    /// Wait for the first response after the initial send.
    read_timeout: Duration,

    /// Wait for further packets once at least one response arrived.
    read_got_timeout: Duration,

    /// Wait for a response after a retry send.
    read_retry_timeout: Duration,

    /// Receive wait when a send tick was cut short by a per-tick cap.
    loop_timeout: Duration,

    /// Size of the receive buffer, and thus the largest accepted packet.
    recv_buffer_size: usize,

    /// Maximum number of retransmissions per slot.
    send_retry: u8,
}

impl Config {
    /// Creates a new config with default values.
    pub fn new() -> Self {
        Default::default()
    }

    /// Returns the stream connect timeout.
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Sets the stream connect timeout.
    ///
    /// If this value is too small or too large, it will be capped.
    pub fn set_connect_timeout(&mut self, value: Duration) {
        self.connect_timeout = CONNECT_TIMEOUT.limit(value)
    }

    /// Returns the per-tick UDP send cap.
    pub fn send_once_udp(&self) -> usize {
        self.send_once_udp
    }

    /// Sets the per-tick UDP send cap.
    ///
    /// If this value is too small or too large, it will be capped.
    pub fn set_send_once_udp(&mut self, value: usize) {
        self.send_once_udp = SEND_ONCE_UDP.limit(value)
    }

    /// Returns the per-tick stream send cap.
    pub fn send_once_stream(&self) -> usize {
        self.send_once_stream
    }

    /// Sets the per-tick stream send cap.
    ///
    /// If this value is too small or too large, it will be capped.
    pub fn set_send_once_stream(&mut self, value: usize) {
        self.send_once_stream = SEND_ONCE_STREAM.limit(value)
    }

    /// Returns the UDP inter-packet pacing delay.
    pub fn send_delay_udp(&self) -> Duration {
        self.send_delay_udp
    }

    /// Sets the UDP inter-packet pacing delay.
    ///
    /// If this value is too large, it will be capped.
    pub fn set_send_delay_udp(&mut self, value: Duration) {
        self.send_delay_udp = SEND_DELAY.limit(value)
    }

    /// Returns the stream inter-packet pacing delay.
    pub fn send_delay_stream(&self) -> Duration {
        self.send_delay_stream
    }

    /// Sets the stream inter-packet pacing delay.
    ///
    /// If this value is too large, it will be capped.
    pub fn set_send_delay_stream(&mut self, value: Duration) {
        self.send_delay_stream = SEND_DELAY.limit(value)
    }

    /// Returns the main read timeout.
    ///
    /// The read timeout is the maximum amount of time to wait for the first
    /// response after the initial send of a slot.
    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    /// Sets the main read timeout.
    ///
    /// If this value is too small or too large, it will be capped.
    pub fn set_read_timeout(&mut self, value: Duration) {
        self.read_timeout = READ_TIMEOUT.limit(value)
    }

    /// Returns the post-first-response inter-packet timeout.
    ///
    /// Once a slot has received at least one response, this much silence
    /// ends the exchange as a normal end-of-data signal.
    pub fn read_got_timeout(&self) -> Duration {
        self.read_got_timeout
    }

    /// Sets the post-first-response inter-packet timeout.
    ///
    /// If this value is too small or too large, it will be capped.
    pub fn set_read_got_timeout(&mut self, value: Duration) {
        self.read_got_timeout = READ_GOT_TIMEOUT.limit(value)
    }

    /// Returns the inter-retry read timeout.
    pub fn read_retry_timeout(&self) -> Duration {
        self.read_retry_timeout
    }

    /// Sets the inter-retry read timeout.
    ///
    /// If this value is too small or too large, it will be capped.
    pub fn set_read_retry_timeout(&mut self, value: Duration) {
        self.read_retry_timeout = READ_RETRY_TIMEOUT.limit(value)
    }

    /// Returns the inter-tick loop wait.
    pub fn loop_timeout(&self) -> Duration {
        self.loop_timeout
    }

    /// Sets the inter-tick loop wait.
    ///
    /// If this value is too small or too large, it will be capped.
    pub fn set_loop_timeout(&mut self, value: Duration) {
        self.loop_timeout = LOOP_TIMEOUT.limit(value)
    }

    /// Returns the receive buffer size.
    pub fn recv_buffer_size(&self) -> usize {
        self.recv_buffer_size
    }

    /// Sets the receive buffer size.
    ///
    /// If this value is too small or too large, it will be capped.
    pub fn set_recv_buffer_size(&mut self, value: usize) {
        self.recv_buffer_size = RECV_BUFFER_SIZE.limit(value)
    }

    /// Returns the maximum number of retransmissions per slot.
    pub fn send_retry(&self) -> u8 {
        self.send_retry
    }

    /// Sets the maximum number of retransmissions per slot.
    ///
    /// If this value is too large, it will be capped.
    pub fn set_send_retry(&mut self, value: u8) {
        self.send_retry = SEND_RETRY.limit(value)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            connect_timeout: CONNECT_TIMEOUT.default(),
            send_once_udp: SEND_ONCE_UDP.default(),
            send_once_stream: SEND_ONCE_STREAM.default(),
            send_delay_udp: SEND_DELAY.default(),
            send_delay_stream: SEND_DELAY.default(),
            read_timeout: READ_TIMEOUT.default(),
            read_got_timeout: READ_GOT_TIMEOUT.default(),
            read_retry_timeout: READ_RETRY_TIMEOUT.default(),
            loop_timeout: LOOP_TIMEOUT.default(),
            recv_buffer_size: RECV_BUFFER_SIZE.default(),
            send_retry: SEND_RETRY.default(),
        }
    }
}

//------------ DefMinMax -----------------------------------------------------

/// The default, minimum, and maximum values for a config variable.
#[derive(Clone, Copy)]
struct DefMinMax<T> {
    /// The default value,
    def: T,

    /// The minimum value,
    min: T,

    /// The maximum value,
    max: T,
}

impl<T> DefMinMax<T> {
    /// Creates a new value.
    const fn new(def: T, min: T, max: T) -> Self {
        Self { def, min, max }
    }

    /// Returns the default value.
    fn default(self) -> T {
        self.def
    }

    /// Trims the given value to fit into the minimum/maximum range.
    fn limit(self, value: T) -> T
    where
        T: Ord,
    {
        cmp::max(self.min, cmp::min(self.max, value))
    }
}

//============ Tests =========================================================
