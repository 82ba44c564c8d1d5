#![deny(missing_debug_implementations)]
#![cfg_attr(test, deny(rust_2018_idioms))]

//! `exaproxy` is a forward HTTP/HTTPS proxy built around a single-threaded
//! reactor, an elastic pool of external classifier ("redirector") worker
//! processes, and an async DNS resolver with its own UDP/TCP transport.
//!
//! The crate is organized the way the proxy itself is organized at runtime:
//!
//! - [`config`] parses the on-disk configuration into a validated [`config::Config`].
//! - [`listener`] accepts client connections and applies admission control.
//! - [`classifier`] manages the pool of redirector subprocesses and the
//!   netstring-based protocol used to talk to them.
//! - [`resolver`] resolves hostnames over UDP with a TCP fallback, with its
//!   own response cache and timeout sweep.
//! - [`client`] holds the per-connection state machine that takes a request
//!   from "just accepted" through classification, resolution, and upstream
//!   connection, to relaying bytes in both directions — including the
//!   post-`CONNECT` tunnel, which stops being parsed as HTTP and becomes a
//!   raw byte pipe between the two [`client::Buffered`] halves.
//! - [`content`] owns the upstream ("download") side of a relay: the TCP
//!   socket to the origin server and the buffers feeding bytes back to the
//!   client.
//! - [`pages`] renders the canned HTML error pages returned to clients ahead
//!   of any successful connection.
//! - [`stats`] accumulates the periodic counters the supervisor reports on
//!   `SIGUSR1`/`SIGINFO`.
//! - [`reactor`] drives everything from one `tokio::select!` loop.
//! - [`supervisor`] owns process-level concerns: signal handling, the alarm
//!   tick, and orderly startup/shutdown of every other component.

pub use crate::error::{Error, Result};

mod error;

pub mod classifier;
pub mod client;
pub mod config;
pub mod content;
pub mod listener;
pub mod pages;
pub mod reactor;
pub mod resolver;
pub mod stats;
pub mod supervisor;
