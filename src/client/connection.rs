//! The per-client connection state machine.
//!
//! REDESIGN FLAGS calls for the implicit state carried across the
//! original's scattered dictionaries (`awaiting_classification`,
//! `awaiting_dns`, ...) to be made an explicit tagged union. `ConnectionState`
//! is that union: each variant owns exactly the data valid in that state,
//! so a connection can never be, say, `Relaying` while still holding an
//! unparsed request head.

use std::cell::RefCell;
use std::net::{IpAddr, SocketAddr};
use std::rc::Rc;
use std::sync::Arc;
use http::Method;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::classifier::{self, Job, Source};
use crate::content;
use crate::listener::{AddrStream, AdmissionGate};
use crate::pages;
use crate::resolver::{self, Command as ResolveCommand, Resolver};

use super::buffered::Buffered;
use super::request::{self, RequestHead};

/// Uniquely identifies a client connection for the lifetime of the
/// process; used as the `client_id` threaded through jobs and queries.
pub type ClientId = u64;

/// Each waiting state carries the receiver half of a oneshot rendezvous
/// (grounded on hyper's `client::dispatch` request/response channel, see
/// [`classifier::Manager::request_and_wait`] / [`Resolver::resolve_and_wait`]):
/// the connection's own `run()` task awaits its answer directly instead
/// of an external caller reaching back in to mutate a parked task's
/// state, which a `spawn_local`-owned future has no way to do.
#[allow(clippy::large_enum_variant)]
enum ConnectionState {
    /// Just accepted; nothing read yet.
    Accepted,
    /// Reading the request line/headers from `stream`'s buffer.
    RequestRead,
    /// Request parsed, enqueued with the classifier, waiting on a
    /// decision.
    AwaitingClassification {
        head: RequestHead,
        rx: oneshot::Receiver<classifier::Decision>,
    },
    /// Classifier allowed the request through; resolving its host.
    AwaitingDns {
        head: RequestHead,
        port: u16,
        rx: oneshot::Receiver<resolver::ResolveResult>,
    },
    /// Host resolved; opening the upstream TCP connection.
    ConnectingUpstream { head: RequestHead, addr: SocketAddr },
    /// Bidirectionally relaying HTTP bytes.
    Relaying,
    /// Post-`CONNECT`: a raw byte pipe with no further HTTP parsing.
    Tunneling,
    /// Terminal.
    Closed,
}

/// Shared, reactor-owned services a connection needs to progress through
/// its states. `Rc<RefCell<_>>` rather than `Arc<Mutex<_>>` because the
/// whole proxy runs on one `current_thread` runtime (spec.md §5: "one
/// reactor thread owns all sockets and all mutable state").
#[derive(Clone, Debug)]
pub struct Shared {
    pub classifier: Rc<RefCell<classifier::Manager>>,
    pub resolver: Rc<RefCell<Resolver>>,
    pub gate: Arc<AdmissionGate>,
}

/// One client connection being driven from accept through close.
pub struct Connection {
    id: ClientId,
    peer: IpAddr,
    stream: Buffered<AddrStream>,
    state: ConnectionState,
    shared: Shared,
    source: Source,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .finish()
    }
}

impl Connection {
    /// `source` distinguishes an ordinary proxy client from a connection
    /// accepted on the admin/web listener (spec.md §3); it is carried into
    /// every [`Job`] this connection enqueues with the classifier.
    pub fn new(id: ClientId, stream: AddrStream, shared: Shared, source: Source) -> Self {
        let peer = stream.remote_addr().ip();
        Connection {
            id,
            peer,
            stream: Buffered::new(stream),
            state: ConnectionState::Accepted,
            shared,
            source,
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Drives the connection to completion: request parsing, enqueueing
    /// with the classifier, DNS resolution if needed, connecting
    /// upstream, and relaying until either side closes.
    ///
    /// Any error after `RequestRead` that occurs before a response has
    /// been written back writes a canned error page first (spec.md
    /// §4.6's "On any error after request_read, if headers have not been
    /// sent to the client yet, write a canned error page; otherwise
    /// close.").
    pub async fn run(mut self) {
        loop {
            let result = self.step().await;
            if let Err(e) = result {
                warn!(client = self.id, error = %e, "client connection error");
                let _ = self.write_error_page(502, "internal_error.html").await;
                break;
            }
            if matches!(self.state, ConnectionState::Closed) {
                break;
            }
        }
        self.shared.resolver.borrow_mut().forget_client(self.id);
        if self.shared.gate.release() {
            info!("admission ceiling cleared, listeners re-registered");
        }
    }

    async fn step(&mut self) -> crate::Result<()> {
        match &self.state {
            ConnectionState::Accepted => self.read_request().await,
            ConnectionState::RequestRead => unreachable!("transient, resolved within read_request"),
            ConnectionState::AwaitingClassification { .. } => self.await_classification().await,
            ConnectionState::AwaitingDns { .. } => self.await_dns().await,
            ConnectionState::ConnectingUpstream { .. } => self.connect_upstream().await,
            ConnectionState::Relaying | ConnectionState::Tunneling => self.relay().await,
            ConnectionState::Closed => Ok(()),
        }
    }

    async fn read_request(&mut self) -> crate::Result<()> {
        loop {
            if let Some((head, consumed)) = request::parse(self.stream.read_buf())? {
                self.stream.consume_read(consumed);
                self.enqueue(head).await?;
                return Ok(());
            }
            let n = self.stream.poll_read_more().await.map_err(crate::Error::new_io)?;
            if n == 0 {
                self.state = ConnectionState::Closed;
                return Ok(());
            }
        }
    }

    /// Routes a freshly parsed request head by method before it ever
    /// reaches the classifier: only methods that can plausibly carry a
    /// redirectable URL go through `request_and_wait` (spec.md §4.3/§4.6).
    /// `CONNECT` and the bodyless `HEAD`/`OPTIONS`/`DELETE` go straight to
    /// DNS, `TRACE` and unrecognized methods get a canned page, and the
    /// classifier never sees any of them.
    async fn enqueue(&mut self, head: RequestHead) -> crate::Result<()> {
        match head.method {
            Method::CONNECT => {
                let port = head.port();
                let host = head.host().unwrap_or("").to_owned();
                self.start_dns(head, port, host).await
            }
            Method::HEAD | Method::OPTIONS | Method::DELETE => {
                let port = head.port();
                let host = head.host().unwrap_or("").to_owned();
                self.start_dns(head, port, host).await
            }
            Method::TRACE => self.respond_canned("501", "unsupported_method.html").await,
            Method::GET | Method::POST | Method::PUT | Method::PATCH => {
                let job = Job {
                    client_id: self.id,
                    peer: self.peer,
                    method: head.method.to_string(),
                    url: head.uri.to_string(),
                    sub_request: None,
                    source: self.source,
                    requeued: false,
                };
                let rx = self.shared.classifier.borrow_mut().request_and_wait(job);
                self.state = ConnectionState::AwaitingClassification { head, rx };
                Ok(())
            }
            _ => self.respond_canned("400", "bad_request.html").await,
        }
    }

    /// Awaits this client's classifier decision and advances state. The
    /// oneshot is fired by [`classifier::Manager::poll_reply`] running on
    /// the reactor; this task just awaits its own receiver rather than
    /// relying on an outside caller reaching back into a parked future.
    async fn await_classification(&mut self) -> crate::Result<()> {
        let (head, rx) = match std::mem::replace(&mut self.state, ConnectionState::Closed) {
            ConnectionState::AwaitingClassification { head, rx } => (head, rx),
            other => {
                self.state = other;
                return Ok(());
            }
        };
        let decision = match rx.await {
            Ok(decision) => decision,
            Err(_) => return Ok(()), // classifier pool dropped the job; stay Closed.
        };

        use classifier::Decision::*;
        match decision {
            Connect { ip, port, .. } => {
                if let Ok(addr) = format!("{ip}:{port}").parse() {
                    self.state = ConnectionState::ConnectingUpstream { head, addr };
                } else {
                    self.state = ConnectionState::Closed;
                }
            }
            Download { hostname, port, .. } => {
                let port: u16 = port.parse().unwrap_or(head.port());
                self.start_dns(head, port, hostname).await?;
            }
            Response { code, body, .. } => {
                self.respond_canned(&code, &body).await?;
            }
            Rewrite { hostname, .. } => {
                let port = head.port();
                self.start_dns(head, port, hostname).await?;
            }
            _ => {
                self.state = ConnectionState::Closed;
            }
        }
        Ok(())
    }

    async fn start_dns(&mut self, head: RequestHead, port: u16, hostname: String) -> crate::Result<()> {
        // Holds the `RefCell` borrow across this await; sound only because
        // `resolve_and_wait`'s own awaits (socket bind/connect/send) are
        // local non-blocking syscalls that resolve without yielding to
        // another task on this thread.
        let rx = self
            .shared
            .resolver
            .borrow_mut()
            .resolve_and_wait(self.id, &hostname, ResolveCommand::Connect { port })
            .await?;
        self.state = ConnectionState::AwaitingDns { head, port, rx };
        Ok(())
    }

    /// Awaits this client's DNS answer and advances state, mirroring
    /// [`Connection::await_classification`].
    async fn await_dns(&mut self) -> crate::Result<()> {
        let (head, port, rx) = match std::mem::replace(&mut self.state, ConnectionState::Closed) {
            ConnectionState::AwaitingDns { head, port, rx } => (head, port, rx),
            other => {
                self.state = other;
                return Ok(());
            }
        };
        let result = match rx.await {
            Ok(result) => result,
            Err(_) => resolver::ResolveResult::Failed,
        };
        match result {
            resolver::ResolveResult::Addresses(addrs) => {
                if let Some(ip) = addrs.into_iter().next() {
                    self.state = ConnectionState::ConnectingUpstream {
                        head,
                        addr: SocketAddr::new(ip, port),
                    };
                } else {
                    let host = head.host().unwrap_or("").to_string();
                    self.respond_canned_dns("503", &host).await?;
                }
            }
            resolver::ResolveResult::Failed => {
                let host = head.host().unwrap_or("").to_string();
                self.respond_canned_dns("503", &host).await?;
            }
        }
        Ok(())
    }

    async fn connect_upstream(&mut self) -> crate::Result<()> {
        let (head, addr) = match &self.state {
            ConnectionState::ConnectingUpstream { head, addr } => (head.clone(), *addr),
            _ => unreachable!(),
        };
        let upstream = TcpStream::connect(addr).await.map_err(crate::Error::new_connect)?;
        let mut upstream = Buffered::new(upstream);

        if head.is_connect() {
            self.stream
                .queue_write(b"HTTP/1.1 200 Connection established\r\n\r\n");
            self.stream.poll_flush().await.map_err(crate::Error::new_io)?;
            self.state = ConnectionState::Tunneling;
        } else {
            let forwarded = content::rewrite_connection_close(&head);
            upstream.queue_write(forwarded.as_bytes());
            upstream.poll_flush().await.map_err(crate::Error::new_io)?;
            self.state = ConnectionState::Relaying;
        }

        self.relay_loop(upstream).await
    }

    async fn relay(&mut self) -> crate::Result<()> {
        // Connections reach `Relaying`/`Tunneling` only via
        // `connect_upstream`, which already drives `relay_loop` to
        // completion before returning; this arm exists purely so `step`
        // is exhaustive if a future refactor re-enters `run` mid-relay.
        self.state = ConnectionState::Closed;
        Ok(())
    }

    async fn relay_loop(&mut self, mut upstream: Buffered<TcpStream>) -> crate::Result<()> {
        loop {
            tokio::select! {
                n = self.stream.poll_read_more(), if !upstream_over_high_water(&upstream) => {
                    let n = n.map_err(crate::Error::new_io)?;
                    if n == 0 {
                        break;
                    }
                    let buf = self.stream.read_buf().to_vec();
                    self.stream.consume_read(buf.len());
                    upstream.queue_write(&buf);
                }
                n = upstream.poll_read_more(), if !client_over_high_water(&self.stream) => {
                    let n = n.map_err(crate::Error::new_io)?;
                    if n == 0 {
                        break;
                    }
                    let buf = upstream.read_buf().to_vec();
                    upstream.consume_read(buf.len());
                    self.stream.queue_write(&buf);
                }
            }
            upstream.poll_flush().await.map_err(crate::Error::new_io)?;
            self.stream.poll_flush().await.map_err(crate::Error::new_io)?;
        }
        let _ = upstream.shutdown().await;
        let _ = self.stream.shutdown().await;
        self.state = ConnectionState::Closed;
        Ok(())
    }

    /// Writes a canned page straight to the client and closes, without
    /// going through `Relaying`/`relay_loop` — those only ever run once an
    /// upstream connection exists. Used for the classifier's own `response`
    /// decision and the DNS-failure paths in `await_dns`.
    async fn respond_canned(&mut self, code: &str, template: &str) -> crate::Result<()> {
        let page = pages::render(code, template);
        self.stream.queue_write(page.as_bytes());
        self.stream.poll_flush().await.map_err(crate::Error::new_io)?;
        self.state = ConnectionState::Closed;
        Ok(())
    }

    async fn respond_canned_dns(&mut self, code: &str, hostname: &str) -> crate::Result<()> {
        let page = pages::render_dns(code, hostname);
        self.stream.queue_write(page.as_bytes());
        self.stream.poll_flush().await.map_err(crate::Error::new_io)?;
        self.state = ConnectionState::Closed;
        Ok(())
    }

    async fn write_error_page(&mut self, code: u16, template: &str) -> crate::Result<()> {
        if matches!(self.state, ConnectionState::Accepted | ConnectionState::RequestRead) {
            // No request parsed yet, nothing coherent to reply to.
            return Ok(());
        }
        let page = pages::render(&code.to_string(), template);
        self.stream.queue_write(page.as_bytes());
        self.stream.poll_flush().await.map_err(crate::Error::new_io)?;
        debug!(client = self.id, template, "wrote canned error page");
        Ok(())
    }
}

/// When the upstream's write buffer (fed by the client) crosses the
/// high-water mark, the client side stops being read until it drains
/// below the low-water mark (spec.md §4.7).
fn upstream_over_high_water(upstream: &Buffered<TcpStream>) -> bool {
    upstream.has_pending_write() && !upstream.is_drained()
}

fn client_over_high_water(client: &Buffered<AddrStream>) -> bool {
    client.has_pending_write() && !client.is_drained()
}
