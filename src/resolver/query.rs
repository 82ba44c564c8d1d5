//! A single outstanding DNS query.
//!
//! spec.md §3 describes the reference implementation's query record as
//! keyed by `(worker_id, transport_identifier)` with a separate `active`
//! age-ordered list used purely for timeout sweeping — REDESIGN FLAGS
//! calls this split bookkeeping error-prone and asks for "a single
//! per-query record with back-links" instead. Here `Query` is that single
//! record: the identity, the client it is answering, and a monotonic
//! `sequence` used (alongside `started_at`) so two queries issued within
//! the same clock tick still sweep in issue order.

use std::net::IpAddr;
use std::time::Instant;

/// Identifies one in-flight query: the ephemeral UDP socket it was sent
/// from (each query gets its own socket, following the DNS client
/// convention of not reusing source ports across queries) paired with the
/// 16-bit DNS transaction id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueryId {
    pub socket_id: u64,
    pub transaction_id: u16,
}

/// What to do once the query resolves (or times out).
#[derive(Debug, Clone)]
pub enum Command {
    /// Resolve, then open an upstream connection to the first address.
    Connect { port: u16 },
    /// Resolve, then hand the address back to the classifier as part of a
    /// `download` decision.
    Download,
}

#[derive(Debug, Clone)]
pub enum Decision {
    Pending,
    Resolved(Vec<IpAddr>),
    Failed,
}

/// The single source of truth for one outstanding query.
#[derive(Debug, Clone)]
pub struct Query {
    pub id: QueryId,
    pub client_id: u64,
    pub original_hostname: String,
    pub current_hostname: String,
    pub command: Command,
    pub decision: Decision,
    pub started_at: Instant,
    pub sequence: u64,
    /// Set once a TCP fallback has been issued for this query, so a late
    /// UDP reply doesn't re-trigger it.
    pub tcp_fallback_sent: bool,
}

impl Query {
    pub fn new(
        id: QueryId,
        client_id: u64,
        hostname: String,
        command: Command,
        sequence: u64,
    ) -> Self {
        Query {
            id,
            client_id,
            original_hostname: hostname.clone(),
            current_hostname: hostname,
            command,
            decision: Decision::Pending,
            started_at: Instant::now(),
            sequence,
            tcp_fallback_sent: false,
        }
    }

    pub fn age(&self) -> std::time::Duration {
        self.started_at.elapsed()
    }
}
