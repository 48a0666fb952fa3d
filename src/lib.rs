//! # gridmix
//!
//! A small multipoint video conferencing server. Clients publish RTP/H.264
//! over UDP; the server decodes every active publisher, composites them
//! into an adaptive grid, re-encodes the result, and fans the composite
//! back out to every client on the same 5-tuple it heard them on.
//!
//! ## Architecture
//!
//! - **Routing core** ([`server`]): a single-threaded calloop event loop
//!   owning both UDP sockets and all state. Clients are identified by the
//!   source address of their datagrams; no handshake, no control channel.
//! - **Grid layout** ([`layout`]): cells are handed out in a precomputed
//!   sequence that keeps the drawn region near a target aspect ratio at
//!   every population level.
//! - **Resource pools** ([`pools`]): LIFO stacks of grid slots and
//!   pre-bound pipeline inputs; slot compaction after evictions keeps the
//!   grid packed from the top-left.
//! - **Media pipeline** ([`pipeline`]): one GStreamer graph for the
//!   process lifetime with a fixed set of decode branches feeding a
//!   compositor, an autocropped H.264 encoder, and a loopback RTP sink.
//!   The event loop drives it through the [`pipeline::MixerControl`]
//!   trait, which is also the substitution point for tests.
//!
//! A publisher that stops sending disappears from the composite within one
//! sweep period plus the idle limit; its slot and pipeline input return to
//! the pools and the grid is compacted.

pub mod clients;
pub mod config;
pub mod layout;
pub mod pipeline;
pub mod pools;
pub mod server;

pub use config::{ServerConfig, DEFAULT_PORT};
pub use server::Server;
