//! A batch request/response transport engine.
//!
//! This crate dispatches many independent request/response exchanges — one
//! per logical target — over UDP, TCP, or Unix stream sockets from a single
//! thread, multiplexed through readiness polling. It owns the hard part of
//! a query-dispatch library: address resolution and caching, socket
//! pooling and recovery, send-burst throttling, and the layered timeout
//! and retry policy that keeps a run terminating no matter how many
//! targets stay silent. What the packets mean is somebody else's problem;
//! payloads pass through as opaque bytes.
//!
//! # Example
//!
//! ```no_run
//! use querymux::{Config, Engine, ExchangeRequest, Transport};
//!
//! # fn main() -> Result<(), querymux::Error> {
//! let mut engine = Engine::new(Config::new())?;
//!
//! let mut request = ExchangeRequest::new(Transport::Udp);
//! request.set_address("192.0.2.1");
//! request.set_port(27015);
//! request.add_packet(&b"\xff\xff\xff\xffstatus"[..]);
//! request.set_response_count(1);
//! let slot = engine.allocate("server-1", "status", request)?;
//!
//! let results = engine.run()?;
//! let result = &results[&slot];
//! println!(
//!     "{} packets, latency {:?}",
//!     result.response_count(),
//!     result.first_response_latency,
//! );
//! engine.shutdown();
//! # Ok(())
//! # }
//! ```
//!
//! Exchanges to unresponsive targets come back with an empty response
//! list; for this kind of transport that is an ordinary outcome, not an
//! error. Sockets and resolved addresses persist across runs until
//! [`Engine::shutdown`].

#![warn(missing_docs)]

mod config;
mod engine;
mod error;
mod pool;
mod request;
mod resolver;
mod slot;

pub use self::config::Config;
pub use self::engine::Engine;
pub use self::error::Error;
pub use self::request::{ExchangeRequest, ExchangeResult};
pub use self::resolver::parse_host;
pub use self::slot::{SlotId, Transport};
