//! # logrelay
//!
//! A syslog aggregation server with bounded per-application history, live
//! tailing, and leader/follower replication.
//!
//! ## Architecture
//!
//! ```text
//!   syslog conns          queries                followers
//!       │                    │                       ^
//!       v                    v                       │
//!  ┌─────────┐   feed   ┌────────────┐   tail   ┌────────────┐
//!  │ framing │ ───────> │ Aggregator │          │ Replicator │
//!  └─────────┘    │     │  run loop  │          └────────────┘
//!                 │     └─────┬──────┘                ^
//!                 │           │ add                   │
//!                 │           v                       │
//!                 │     ┌────────────┐                │
//!                 └───> │ app → ring │ ───────────────┘
//!        (replicator)   │  buffers   │   snapshot handshake
//!                       └────────────┘
//! ```
//!
//! Every ingested message lands in the ring buffer for its application and
//! is offered to the replicator's follower sinks. Queries dump recent
//! history, optionally continuing with the live tail. A new follower gets a
//! consistent snapshot of all buffers followed by everything after it; the
//! role controller decides when this server itself is the follower.

#![deny(clippy::all)]
#![deny(clippy::unwrap_used)]

pub mod aggregator;
pub mod api;
pub mod config;
pub mod controller;
pub mod filter;
pub mod logger;
pub mod message;
pub mod replication;
pub mod replicator;
pub mod ring;
pub mod server;
pub mod snapshot;
pub mod syslog;
