//! Asynchronous DNS resolution with its own UDP/TCP transport, cache, and
//! timeout wheel.
//!
//! Grounded on `original_source/.../resolver/manager.py`. The original's
//! two parallel bookkeeping structures (`resolving`/`sending` keyed by fd,
//! plus an `active` age-ordered list used only for the timeout sweep) are
//! collapsed into one per-query [`Query`] record (REDESIGN FLAGS item 1),
//! walked directly for both response matching and timeout sweeping.

pub mod cache;
pub mod query;
mod tcp;
mod udp;
mod wire;

pub use query::{Command, QueryId};

use cache::Cache;
use query::Query;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::config::ResolverConfig;

/// One raw transport event: a socket answered (or failed) for `id`. Carried
/// over [`Replies`] rather than returned from a method the reactor would
/// otherwise have to hold `Resolver` borrowed to await — see the module's
/// `Replies` doc for why.
type RawEvent = (QueryId, crate::Result<Vec<u8>>);

/// The receiving half of the resolver's transport-event channel, owned
/// directly by the reactor rather than behind the `Rc<RefCell<Resolver>>`.
///
/// `Resolver::poll_events` used to await a `FuturesUnordered` over every
/// outstanding query's socket directly, with the `&mut self` borrow held
/// for as long as nothing answered — in practice almost always, since the
/// reactor spends most of its time waiting on exactly this branch. Any
/// connection task calling `resolve_and_wait` concurrently (the ordinary
/// case: a second client asking to resolve a different hostname while the
/// first is still outstanding) would then try `RefCell::borrow_mut` on the
/// same `Resolver` and panic. Each outstanding query now gets its own
/// `tokio::spawn`ed one-shot read task (sockets are `Send`, so this needs
/// no `LocalSet`) that owns the transport and reports back over this
/// channel; the reactor awaits `Replies::recv` directly, and only takes
/// the resolver's borrow for the short, synchronous-ish span of actually
/// recording the answer. Mirrors [`crate::classifier::Replies`].
#[derive(Debug)]
pub struct Replies {
    rx: mpsc::UnboundedReceiver<RawEvent>,
}

impl Replies {
    pub async fn recv(&mut self) -> Option<RawEvent> {
        self.rx.recv().await
    }
}

/// The outcome of a resolution, delivered to whichever component asked
/// for it (classifier manager for `connect`/`download` decisions).
#[derive(Debug)]
pub struct Resolved {
    pub client_id: u64,
    pub command: Command,
    pub result: ResolveResult,
}

#[derive(Debug, Clone)]
pub enum ResolveResult {
    Addresses(Vec<IpAddr>),
    /// NXDOMAIN, empty answer set, or timeout: the client gets a
    /// `503 dns.html` rewrite (spec.md §4.5).
    Failed,
}

/// Either a query resolved synchronously (literal IP or cache hit) or it
/// was handed off to the network and will arrive later via
/// [`Resolver::handle_event`].
#[derive(Debug)]
pub enum Outcome {
    Immediate(Vec<IpAddr>),
    Pending,
}

/// Owns the cache, the outstanding-query table, and the sending side of
/// the transport-event channel. The sockets themselves live inside the
/// per-query read tasks spawned by [`Resolver::start_resolving`] and
/// [`Resolver::promote_to_tcp`], not here.
pub struct Resolver {
    config: ResolverConfig,
    cache: Cache,
    queries: HashMap<QueryId, Query>,
    by_client: HashMap<u64, QueryId>,
    /// Oneshot-per-client rendezvous, the same shape as
    /// [`crate::classifier::Manager::pending`]: a connection awaiting a
    /// hostname holds the receiver, [`Resolver::handle_event`] /
    /// [`Resolver::sweep`] fire the sender once an answer (or a timeout)
    /// arrives.
    pending: HashMap<u64, oneshot::Sender<ResolveResult>>,
    /// Cancels the read task currently listening for `id`'s answer.
    /// Dropping (or overwriting, on UDP→TCP promotion) the sender here is
    /// what actually stops that task's read loop — see
    /// [`spawn_udp_read`]/[`spawn_tcp_read`].
    cancels: HashMap<QueryId, oneshot::Sender<()>>,
    events_tx: mpsc::UnboundedSender<RawEvent>,
    next_socket_id: u64,
    next_sequence: u64,
}

impl std::fmt::Debug for Resolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolver")
            .field("config", &self.config)
            .field("cache_len", &self.cache.len())
            .field("outstanding", &self.queries.len())
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl Resolver {
    pub fn new(config: ResolverConfig) -> (Self, Replies) {
        let (events_tx, rx) = mpsc::unbounded_channel();
        let resolver = Resolver {
            config,
            cache: Cache::new(),
            queries: HashMap::new(),
            by_client: HashMap::new(),
            pending: HashMap::new(),
            cancels: HashMap::new(),
            events_tx,
            next_socket_id: 0,
            next_sequence: 0,
        };
        (resolver, Replies { rx })
    }

    fn nameserver(&self) -> crate::Result<SocketAddr> {
        self.config
            .nameservers
            .first()
            .copied()
            .ok_or_else(|| crate::Error::new_resolve(NoNameservers))
    }

    /// Starts resolving `hostname` for `client_id`. If the hostname is
    /// already a literal address or is cached and fresh, resolves
    /// synchronously with no network round trip (spec.md §4.5).
    pub async fn start_resolving(
        &mut self,
        client_id: u64,
        hostname: &str,
        command: Command,
    ) -> crate::Result<Outcome> {
        if let Ok(ip) = hostname.parse::<IpAddr>() {
            return Ok(Outcome::Immediate(vec![ip]));
        }
        if let Some(addrs) = self.cache.get(hostname) {
            return Ok(Outcome::Immediate(addrs.to_vec()));
        }

        let nameserver = self.nameserver()?;
        let socket = udp::UdpQuerySocket::connect(nameserver).await?;
        let socket_id = self.next_socket_id;
        self.next_socket_id += 1;
        let transaction_id = (self.next_socket_id & 0xFFFF) as u16;
        let query_bytes = wire::build_query(transaction_id, hostname)?;
        socket.send(&query_bytes).await?;

        let id = QueryId {
            socket_id,
            transaction_id,
        };
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        let query = Query::new(id, client_id, hostname.to_owned(), command, sequence);

        self.by_client.insert(client_id, id);
        self.queries.insert(id, query);
        let (cancel_tx, cancel_rx) = oneshot::channel();
        self.cancels.insert(id, cancel_tx);
        spawn_udp_read(id, socket, self.events_tx.clone(), cancel_rx);
        Ok(Outcome::Pending)
    }

    /// Starts resolving `hostname` for `client_id` and returns the
    /// receiver half of the oneshot that will carry the result — either
    /// fired immediately (literal IP, cache hit) or later from
    /// [`Resolver::handle_event`]/[`Resolver::sweep`]. Mirrors
    /// [`crate::classifier::Manager::request_and_wait`]: the caller just
    /// awaits the receiver instead of polling connection state from the
    /// outside.
    pub async fn resolve_and_wait(
        &mut self,
        client_id: u64,
        hostname: &str,
        command: Command,
    ) -> crate::Result<oneshot::Receiver<ResolveResult>> {
        let (tx, rx) = oneshot::channel();
        match self.start_resolving(client_id, hostname, command).await? {
            Outcome::Immediate(addrs) => {
                let _ = tx.send(ResolveResult::Addresses(addrs));
            }
            Outcome::Pending => {
                self.pending.insert(client_id, tx);
            }
        }
        Ok(rx)
    }

    fn complete(&mut self, client_id: u64, result: &ResolveResult) {
        if let Some(tx) = self.pending.remove(&client_id) {
            let _ = tx.send(result.clone());
        }
    }

    /// Drops any query outstanding for a client whose connection closed.
    /// Per spec.md §4.5, this leaves the entry to be garbage-collected by
    /// the timeout sweep rather than eagerly scanning `queries` for it —
    /// late responses are simply dropped on a `client_id` lookup miss.
    pub fn forget_client(&mut self, client_id: u64) {
        self.by_client.remove(&client_id);
        self.pending.remove(&client_id);
    }

    /// Processes one event delivered over [`Replies`]: a decoded response,
    /// a truncation requiring TCP fallback, or a malformed/stale reply to
    /// discard. Called by the reactor right after `Replies::recv` resolves
    /// — unlike the old `poll_events`, the wait itself never touches this
    /// struct, so the borrow this takes is only ever as long as decoding
    /// the answer and, on truncation, opening the TCP fallback socket.
    pub async fn handle_event(&mut self, id: QueryId, raw: crate::Result<Vec<u8>>) -> Option<Resolved> {
        let bytes = match raw {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "DNS transport read failed, discarding");
                return None;
            }
        };
        let answer = match wire::parse_response(&bytes) {
            Ok(answer) => answer,
            Err(e) => {
                warn!(error = %e, "malformed DNS response, discarding");
                return None;
            }
        };
        self.handle_answer(id, answer).await
    }

    async fn handle_answer(&mut self, id: QueryId, answer: wire::Answer) -> Option<Resolved> {
        let query = self.queries.get(&id)?;
        if answer.id != id.transaction_id {
            debug!("DNS reply transaction id mismatch, discarding");
            return None;
        }
        if let Some(ref forhost) = answer.question_name {
            let expected = query.current_hostname.trim_end_matches('.');
            if forhost.trim_end_matches('.') != expected {
                // The query stays outstanding and its read task's loop
                // (see `spawn_udp_read`/`spawn_tcp_read`) is still listening
                // on the same socket for the reply that actually answers
                // it, rather than exiting after this one mismatched datagram.
                debug!(%forhost, expected, "DNS reply for wrong hostname, ignoring");
                return None;
            }
        }

        if answer.truncated {
            return self.promote_to_tcp(id).await;
        }

        let query = self.queries.remove(&id)?;
        self.cancels.remove(&id);
        self.by_client.remove(&query.client_id);

        if answer.addresses.is_empty() {
            self.complete(query.client_id, &ResolveResult::Failed);
            return Some(Resolved {
                client_id: query.client_id,
                command: query.command,
                result: ResolveResult::Failed,
            });
        }

        self.cache.insert(query.original_hostname.clone(), answer.addresses.clone());

        let result = ResolveResult::Addresses(answer.addresses);
        self.complete(query.client_id, &result);
        Some(Resolved {
            client_id: query.client_id,
            command: query.command,
            result,
        })
    }

    async fn promote_to_tcp(&mut self, id: QueryId) -> Option<Resolved> {
        let nameserver = self.nameserver().ok()?;
        let query = self.queries.get_mut(&id)?;
        if query.tcp_fallback_sent {
            return None;
        }
        query.tcp_fallback_sent = true;
        let hostname = query.current_hostname.clone();

        let mut tcp_socket = match tcp::TcpQuerySocket::connect(nameserver).await {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "TCP fallback connect failed");
                let query = self.queries.remove(&id)?;
                self.cancels.remove(&id);
                self.complete(query.client_id, &ResolveResult::Failed);
                return Some(Resolved {
                    client_id: query.client_id,
                    command: query.command,
                    result: ResolveResult::Failed,
                });
            }
        };
        if let Ok(query_bytes) = wire::build_query(id.transaction_id, &hostname) {
            if tcp_socket.send(&query_bytes).await.is_ok() {
                // Replacing the cancel sender drops the old one, which stops
                // the UDP read loop still listening for this id — the TCP
                // read loop takes over from here.
                let (cancel_tx, cancel_rx) = oneshot::channel();
                self.cancels.insert(id, cancel_tx);
                spawn_tcp_read(id, tcp_socket, self.events_tx.clone(), cancel_rx);
            }
        }
        None
    }

    /// Periodic maintenance: timeout sweep then cache expiry, driven by
    /// the supervisor's 1-second alarm tick.
    pub fn sweep(&mut self) -> Vec<Resolved> {
        let timeout = self.config.timeout;
        let mut timed_out = Vec::new();
        let expired_ids: Vec<QueryId> = self
            .queries
            .iter()
            .filter(|(_, q)| q.age() >= timeout)
            .map(|(id, _)| *id)
            .collect();
        for id in expired_ids {
            if let Some(query) = self.queries.remove(&id) {
                self.cancels.remove(&id);
                self.by_client.remove(&query.client_id);
                self.complete(query.client_id, &ResolveResult::Failed);
                timed_out.push(Resolved {
                    client_id: query.client_id,
                    command: query.command,
                    result: ResolveResult::Failed,
                });
            }
        }

        let evicted = self.cache.expire(self.config.ttl, self.config.expire);
        if evicted > 0 {
            debug!(evicted, "swept expired DNS cache entries");
        }

        timed_out
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    pub fn outstanding(&self) -> usize {
        self.queries.len()
    }
}

/// Reads datagrams from `socket` and reports each one, looping so a
/// mismatched reply (wrong hostname, stale transaction) doesn't strand the
/// query with nothing left listening for the real answer. Stops once
/// `cancel`'s sender is dropped — [`Resolver`] does that the moment the
/// query is retired (resolved, timed out, or promoted to TCP) — or once
/// the socket itself errors.
fn spawn_udp_read(
    id: QueryId,
    socket: udp::UdpQuerySocket,
    tx: mpsc::UnboundedSender<RawEvent>,
    mut cancel: oneshot::Receiver<()>,
) {
    tokio::spawn(async move {
        let mut buf = [0u8; 4096];
        loop {
            tokio::select! {
                _ = &mut cancel => return,
                result = socket.recv(&mut buf) => {
                    let is_err = result.is_err();
                    let event = result.map(|n| buf[..n].to_vec());
                    if tx.send((id, event)).is_err() || is_err {
                        return;
                    }
                }
            }
        }
    });
}

/// TCP counterpart of [`spawn_udp_read`]: loops reading length-prefixed
/// messages off the same fallback connection until canceled or the stream
/// errors.
fn spawn_tcp_read(
    id: QueryId,
    mut socket: tcp::TcpQuerySocket,
    tx: mpsc::UnboundedSender<RawEvent>,
    mut cancel: oneshot::Receiver<()>,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut cancel => return,
                result = socket.recv() => {
                    let is_err = result.is_err();
                    if tx.send((id, result)).is_err() || is_err {
                        return;
                    }
                }
            }
        }
    });
}

#[derive(Debug)]
struct NoNameservers;

impl std::fmt::Display for NoNameservers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("no nameservers configured")
    }
}

impl std::error::Error for NoNameservers {}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn literal_ip_resolves_without_network() {
        let (mut resolver, _replies) = Resolver::new(ResolverConfig::default());
        let outcome = resolver
            .start_resolving(1, "93.184.216.34", Command::Connect { port: 80 })
            .await
            .unwrap();
        match outcome {
            Outcome::Immediate(addrs) => assert_eq!(addrs, vec!["93.184.216.34".parse().unwrap()]),
            Outcome::Pending => panic!("literal IPs must resolve synchronously"),
        }
    }

    #[tokio::test]
    async fn cached_hostname_resolves_without_network() {
        let (mut resolver, _replies) = Resolver::new(ResolverConfig::default());
        resolver
            .cache
            .insert("example.com".to_owned(), vec!["1.2.3.4".parse().unwrap()]);
        let outcome = resolver
            .start_resolving(1, "example.com", Command::Connect { port: 80 })
            .await
            .unwrap();
        assert!(matches!(outcome, Outcome::Immediate(_)));
    }

    #[tokio::test]
    async fn resolve_and_wait_fires_immediately_for_literal_ip() {
        let (mut resolver, _replies) = Resolver::new(ResolverConfig::default());
        let rx = resolver
            .resolve_and_wait(1, "93.184.216.34", Command::Connect { port: 80 })
            .await
            .unwrap();
        match rx.await.unwrap() {
            ResolveResult::Addresses(addrs) => assert_eq!(addrs, vec!["93.184.216.34".parse().unwrap()]),
            ResolveResult::Failed => panic!("literal IP must resolve"),
        }
    }

    #[test]
    fn forgetting_a_client_drops_its_index_entry() {
        let (mut resolver, _replies) = Resolver::new(ResolverConfig::default());
        resolver.by_client.insert(5, QueryId { socket_id: 0, transaction_id: 1 });
        resolver.forget_client(5);
        assert!(resolver.by_client.get(&5).is_none());
    }
}
