//! The reactor: the single `tokio::select!` loop that drives every other
//! component.
//!
//! Grounded on spec.md §4.8's fixed per-tick dispatch order — accepts,
//! then DNS, then classifier replies, then upstream/client I/O — and on
//! the observation that `tokio::select!`'s `biased;` modifier is the
//! direct generalization of "poll these named interest sets in this fixed
//! order" once each interest has become one `select!` arm instead of one
//! named fd set. Upstream/client I/O itself is driven per-connection
//! inside [`crate::client::Connection::run`] rather than centrally here,
//! since each connection is its own `spawn_local` task; this loop owns
//! only the three genuinely shared resources (the listeners, the
//! resolver, and the classifier pool) plus the maintenance tick.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::classifier::{self, Decision as ClassifierDecision};
use crate::client::{Connection, Shared};
use crate::config::Config;
use crate::listener::{AdmissionGate, Listener};
use crate::resolver::Resolver;
use crate::stats;

/// Owns every shared, reactor-private resource and runs the main loop.
pub struct Reactor {
    listener: Listener,
    classifier: Rc<RefCell<classifier::Manager>>,
    /// Owned directly rather than through the `Rc<RefCell<_>>`, so awaiting
    /// the next reply never holds a borrow the supervisor's signal loop
    /// could collide with. See [`classifier::Replies`].
    replies: classifier::Replies,
    /// Fired whenever a job joins the classifier's queue; awaited directly
    /// rather than through `classifier`'s `RefCell`, for the same reason
    /// `replies` is split out (see [`classifier::Replies`]).
    dispatch_notify: Rc<tokio::sync::Notify>,
    resolver: Rc<RefCell<Resolver>>,
    /// Owned directly rather than through the resolver's `RefCell`, so
    /// awaiting the next DNS transport event never holds a borrow a
    /// connection task's `resolve_and_wait` could collide with. See
    /// [`crate::resolver::Replies`].
    resolver_replies: crate::resolver::Replies,
    gate: Arc<AdmissionGate>,
    stats: stats::Recorder,
    next_client_id: u64,
    maintenance: tokio::time::Interval,
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor")
            .field("classifier", &self.classifier)
            .field("resolver", &self.resolver)
            .field("gate", &self.gate)
            .finish()
    }
}

impl Reactor {
    /// Binds the listeners and brings the classifier pool up to its `low`
    /// watermark. Does not start the loop; call [`Reactor::run`] for that.
    pub fn new(config: &Config) -> crate::Result<Self> {
        let gate = AdmissionGate::new(config.max_clients);
        let listener = Listener::bind(&config.listen, config.listen_web, config.backlog, gate.clone())?;

        let (mut classifier, replies) = classifier::Manager::new(config.pool.clone());
        classifier.start()?;
        let dispatch_notify = classifier.dispatch_notify();

        let (resolver, resolver_replies) = Resolver::new(config.resolver.clone());

        Ok(Reactor {
            listener,
            classifier: Rc::new(RefCell::new(classifier)),
            replies,
            dispatch_notify,
            resolver: Rc::new(RefCell::new(resolver)),
            resolver_replies,
            gate,
            stats: stats::Recorder::new(),
            next_client_id: 0,
            maintenance: tokio::time::interval(config.alarm_time),
        })
    }

    /// The shared admission gate, handed to the supervisor so signal
    /// handling can inspect live client counts without borrowing the
    /// reactor itself.
    pub fn gate(&self) -> Arc<AdmissionGate> {
        self.gate.clone()
    }

    /// A clone of the classifier pool handle, handed to the supervisor so
    /// `SIGHUP`/`SIGUSR1`/`SIGUSR2` can reach `respawn`/`decrease`/`increase`
    /// directly without routing through the reactor's own loop.
    pub fn classifier_handle(&self) -> Rc<RefCell<classifier::Manager>> {
        self.classifier.clone()
    }

    /// Runs until the supervisor asks it to stop by dropping `shutdown`.
    pub async fn run(mut self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        loop {
            tokio::select! {
                biased;

                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("reactor shutting down");
                        break;
                    }
                }

                accepted = self.listener.accept() => {
                    self.handle_accept(accepted);
                }

                event = self.resolver_replies.recv() => {
                    if let Some((id, raw)) = event {
                        let resolved = self.resolver.borrow_mut().handle_event(id, raw).await;
                        if let Some(resolved) = resolved {
                            debug!(client = resolved.client_id, "resolver event delivered");
                        }
                    }
                }

                reply = self.replies.recv() => {
                    if let Some((worker_id, decision)) = reply {
                        let reply = self.classifier.borrow_mut().route_reply(worker_id, decision);
                        self.handle_pool_reply(reply);
                        self.drain_dispatch().await;
                    }
                }

                _ = self.dispatch_notify.notified() => {
                    self.drain_dispatch().await;
                }

                _ = self.maintenance.tick() => {
                    self.run_maintenance();
                    self.drain_dispatch().await;
                }
            }
        }

        self.classifier.borrow_mut().stop().await;
    }

    fn handle_accept(&mut self, accepted: crate::Result<(crate::listener::AddrStream, bool)>) {
        let (stream, is_web) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "accept failed");
                return;
            }
        };

        if self.gate.admit() {
            warn!(
                client_count = self.gate.client_count(),
                max_clients = self.gate.max_clients(),
                "admission ceiling reached, listeners deregistered"
            );
        }

        let id = self.next_client_id;
        self.next_client_id += 1;
        let source = if is_web {
            classifier::Source::Web
        } else {
            classifier::Source::Proxy
        };
        let shared = Shared {
            classifier: self.classifier.clone(),
            resolver: self.resolver.clone(),
            gate: self.gate.clone(),
        };
        let connection = Connection::new(id, stream, shared, source);
        tokio::task::spawn_local(connection.run());
    }

    fn handle_pool_reply(&mut self, reply: classifier::Reply) {
        match reply.decision {
            ClassifierDecision::Hangup { worker_id } => {
                if let Ok(id) = worker_id.parse() {
                    self.classifier.borrow_mut().reap_hungup(id);
                }
            }
            ClassifierDecision::Stats { timestamp, stats, .. } => {
                self.stats.record(&timestamp, &stats);
            }
            // `requeue` is fully handled inside `Manager::route_reply`;
            // every other decision was already delivered to its waiting
            // connection's oneshot receiver there too.
            _ => {}
        }
    }

    /// Hands queued jobs to free workers until either runs out. Kept as its
    /// own loop since one worker coming free, or one job arriving, can
    /// often clear several queue entries at once (e.g. right after
    /// `provision` spawns new workers).
    async fn drain_dispatch(&mut self) {
        loop {
            match self.classifier.borrow_mut().dispatch_one().await {
                Ok(true) => continue,
                Ok(false) => break,
                Err(e) => {
                    warn!(error = %e, "failed to dispatch job to classifier worker");
                    break;
                }
            }
        }
    }

    fn run_maintenance(&mut self) {
        if let Err(e) = self.classifier.borrow_mut().provision() {
            warn!(error = %e, "classifier pool provisioning failed");
        }
        for resolved in self.resolver.borrow_mut().sweep() {
            debug!(client = resolved.client_id, "DNS query timed out");
        }
        self.stats.trim(3600);
    }
}
