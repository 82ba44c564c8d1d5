//! Listening sockets and admission control.
//!
//! Grounded on `network/server.py`'s `Server` class: a set of listening
//! sockets sharing one `client_count`, deregistered from the poll set the
//! instant the count reaches `max_clients` and re-registered the instant it
//! drops below. Here "deregistered from the poll set" becomes "not polled
//! this tick" via [`AdmissionGate::is_open`], since tokio has no concept of
//! temporarily removing an fd from a reactor the caller doesn't control.

mod tcp;

pub use tcp::{AddrIncoming, AddrStream};

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// Tracks live client connections against the configured ceiling and
/// decides, at any instant, whether the listeners should be polled.
///
/// The admission invariant (spec.md §8.1): the listeners are polled
/// whenever `client_count < max_clients` and not polled when
/// `client_count >= max_clients`, re-evaluated on every transition rather
/// than unconditionally re-opened (see DESIGN.md, REDESIGN FLAGS item 2).
#[derive(Debug)]
pub struct AdmissionGate {
    client_count: AtomicUsize,
    max_clients: usize,
}

impl AdmissionGate {
    /// Creates a gate admitting up to `max_clients` simultaneous clients.
    pub fn new(max_clients: usize) -> Arc<Self> {
        Arc::new(AdmissionGate {
            client_count: AtomicUsize::new(0),
            max_clients,
        })
    }

    /// True if the listeners should currently be polled for new connections.
    pub fn is_open(&self) -> bool {
        self.client_count.load(Ordering::Acquire) < self.max_clients
    }

    /// Called by the client state machine once a connection is fully
    /// accepted. Returns whether this crossed the ceiling (the listeners
    /// should be deregistered this tick).
    pub fn admit(&self) -> bool {
        let previous = self.client_count.fetch_add(1, Ordering::AcqRel);
        previous + 1 >= self.max_clients
    }

    /// Called when a client connection closes. Returns whether this
    /// dropped the count strictly below the ceiling (the listeners should
    /// be re-registered this tick).
    pub fn release(&self) -> bool {
        let previous = self.client_count.fetch_sub(1, Ordering::AcqRel);
        previous == self.max_clients
    }

    /// Current live client count.
    pub fn client_count(&self) -> usize {
        self.client_count.load(Ordering::Acquire)
    }

    /// The configured ceiling.
    pub fn max_clients(&self) -> usize {
        self.max_clients
    }
}

/// The full set of listening sockets the proxy accepts clients on, gated
/// by a single shared [`AdmissionGate`].
pub struct Listener {
    proxy: Vec<AddrIncoming>,
    web: Option<AddrIncoming>,
    gate: Arc<AdmissionGate>,
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("proxy_count", &self.proxy.len())
            .field("web", &self.web.is_some())
            .field("gate", &self.gate)
            .finish()
    }
}

impl Listener {
    /// Binds every configured proxy endpoint plus the optional admin/web
    /// endpoint. Every socket this binds, admin included, shares the one
    /// `gate`: spec.md §3 deregisters *every* listening socket at the
    /// admission ceiling, not just the proxy ones.
    pub fn bind(
        addrs: &[SocketAddr],
        web_addr: Option<SocketAddr>,
        backlog: i32,
        gate: Arc<AdmissionGate>,
    ) -> crate::Result<Self> {
        let mut proxy = Vec::with_capacity(addrs.len());
        for addr in addrs {
            proxy.push(AddrIncoming::bind(addr, backlog)?);
            info!(%addr, "listening for proxy clients");
        }
        let web = match web_addr {
            Some(addr) => {
                info!(%addr, "listening for admin clients");
                Some(AddrIncoming::bind(&addr, backlog)?)
            }
            None => None,
        };
        Ok(Listener { proxy, web, gate })
    }

    /// Accepts the next client connection if admission control currently
    /// permits it. Resolves `Pending` forever while the gate is closed, so
    /// this is meant to be one arm of the reactor's `select!`. The gate
    /// check below runs before any socket — proxy or admin/web — is ever
    /// registered with `futs`, so every listening socket is deregistered
    /// uniformly at the ceiling (spec.md §3); none of them bypass it.
    pub async fn accept(&mut self) -> crate::Result<(AddrStream, bool)> {
        if !self.gate.is_open() {
            warn!(
                client_count = self.gate.client_count(),
                max_clients = self.gate.max_clients(),
                "listeners deregistered: at admission ceiling"
            );
            std::future::pending::<()>().await;
            unreachable!();
        }

        let mut futs: futures_util::stream::FuturesUnordered<_> = self
            .proxy
            .iter_mut()
            .map(|l| Box::pin(async move { (l.accept().await, false) }))
            .collect();
        if let Some(web) = self.web.as_mut() {
            futs.push(Box::pin(async move { (web.accept().await, true) }));
        }

        use futures_util::StreamExt;
        match futs.next().await {
            Some((Ok(stream), is_web)) => {
                drop(futs);
                Ok((stream, is_web))
            }
            Some((Err(e), _)) => {
                drop(futs);
                Err(crate::Error::new_accept(e))
            }
            None => unreachable!("at least one listener is always present"),
        }
    }

    /// Shared admission gate, handed to the client state machine so it can
    /// call [`AdmissionGate::admit`]/[`AdmissionGate::release`].
    pub fn gate(&self) -> Arc<AdmissionGate> {
        self.gate.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admission_gate_closes_at_ceiling() {
        let gate = AdmissionGate::new(2);
        assert!(gate.is_open());
        assert!(!gate.admit());
        assert!(gate.is_open());
        assert!(gate.admit());
        assert!(!gate.is_open());
    }

    #[test]
    fn admission_gate_reopens_below_ceiling() {
        let gate = AdmissionGate::new(1);
        assert!(gate.admit());
        assert!(!gate.is_open());
        assert!(gate.release());
        assert!(gate.is_open());
    }

    #[test]
    fn admission_gate_release_below_ceiling_is_not_an_edge() {
        let gate = AdmissionGate::new(4);
        assert!(!gate.admit());
        assert!(!gate.release());
    }
}
