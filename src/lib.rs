//! # Chatstream
//!
//! Event-delivery backbone for a real-time chat service. Side effects of user
//! actions (removing an account, posting into a room, voting on a poll) are
//! appended to durable streams and applied asynchronously by consumer loops.
//!
//! ## Architecture
//!
//! ```text
//! Client -> HTTP API -> Producer -> Redis Stream -> Consumer -> Router -> Handler
//!                                                                      │
//!                                             Multiplexer <- fanout ◄──┘
//! ```
//!
//! ## Modules
//!
//! - [`store`]: stream and lease primitives (Redis and in-memory)
//! - [`event`]: event kinds, payloads and their wire encoding
//! - [`lock`]: token-owned leases with TTL
//! - [`producer`]: capped appends and per-user fanout
//! - [`registrar`]: consumer group registration at boot
//! - [`consumer`]: the read/dispatch/ack loop
//! - [`router`] and [`handlers`]: per-kind side effects
//! - [`repository`]: chat state the handlers mutate
//! - [`search`]: search index triggers
//! - [`multiplexer`]: user id to live connection channels
//! - [`dlq`]: dead-letter stream for failed entries

pub mod config;
pub mod consumer;
pub mod dlq;
pub mod event;
pub mod handlers;
pub mod lock;
pub mod multiplexer;
pub mod producer;
pub mod registrar;
pub mod repository;
pub mod router;
pub mod search;
pub mod shutdown;
pub mod store;

// Re-export commonly used types at crate root
pub use consumer::{BatchReport, Consumer};
pub use event::{Event, EventKind};
pub use handlers::{HandlerContext, HandlerError, HandlerOutcome};
pub use lock::LockManager;
pub use multiplexer::Multiplexer;
pub use producer::Producer;
pub use registrar::Registrar;
pub use router::Router;
