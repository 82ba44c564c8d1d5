//! Process-level orchestration: signal handling, the alarm tick, and
//! orderly startup/shutdown of every other component.
//!
//! Grounded on `original_source/.../supervisor.py`'s `Supervisor` class —
//! `SIGTERM` requests shutdown, `SIGHUP` respawns the classifier pool,
//! `SIGUSR1`/`SIGUSR2` shrink/grow its bounds, `SIGTRAP` toggles verbose
//! logging. The original's single-threaded `select()` loop that both
//! dispatched signals (via flags set from a handler) and drove I/O becomes,
//! here, two tasks on the same `current_thread` runtime: [`crate::reactor::Reactor::run`]
//! owns the sockets, and [`Supervisor::run`] owns a `tokio::select!` over
//! `tokio::signal::unix` streams, reaching into the classifier pool
//! directly through the `Rc<RefCell<_>>` handle the reactor also holds —
//! sound because only one task runs at a time on a `current_thread`
//! runtime.

use std::cell::RefCell;
use std::rc::Rc;

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::classifier;
use crate::config::Config;
use crate::reactor::Reactor;

/// Owns the reactor and the signal streams that can reconfigure it at
/// runtime.
pub struct Supervisor {
    classifier: Rc<RefCell<classifier::Manager>>,
    reactor: Reactor,
    sigterm: tokio::signal::unix::Signal,
    sighup: tokio::signal::unix::Signal,
    sigusr1: tokio::signal::unix::Signal,
    sigusr2: tokio::signal::unix::Signal,
    sigtrap: tokio::signal::unix::Signal,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("classifier", &self.classifier)
            .field("reactor", &self.reactor)
            .finish()
    }
}

impl Supervisor {
    /// Validates `config`, brings up the reactor's listeners and classifier
    /// pool, and installs the signal handlers. Nothing is accepted or
    /// dispatched until [`Supervisor::run`] is called.
    pub fn new(config: &Config) -> crate::Result<Self> {
        config.validate()?;
        let reactor = Reactor::new(config)?;
        let classifier = reactor.classifier_handle();

        Ok(Supervisor {
            classifier,
            reactor,
            sigterm: signal(SignalKind::terminate()).map_err(crate::Error::new_io)?,
            sighup: signal(SignalKind::hangup()).map_err(crate::Error::new_io)?,
            sigusr1: signal(SignalKind::user_defined1()).map_err(crate::Error::new_io)?,
            sigusr2: signal(SignalKind::user_defined2()).map_err(crate::Error::new_io)?,
            // SIGTRAP has no named SignalKind constructor.
            sigtrap: signal(SignalKind::from_raw(libc::SIGTRAP)).map_err(crate::Error::new_io)?,
        })
    }

    /// Runs until `SIGTERM`, driving the reactor on the same `LocalSet` and
    /// reacting to every other signal by mutating the classifier pool in
    /// place (spec.md §7's pool resize and respawn operations).
    pub async fn run(mut self) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let reactor_task = tokio::task::spawn_local(self.reactor.run(shutdown_rx));

        loop {
            tokio::select! {
                _ = self.sigterm.recv() => {
                    info!("SIGTERM received, shutting down");
                    let _ = shutdown_tx.send(true);
                    break;
                }
                _ = self.sighup.recv() => {
                    info!("SIGHUP received, respawning classifier pool");
                    if let Err(e) = self.classifier.borrow_mut().respawn().await {
                        warn!(error = %e, "failed to respawn classifier pool");
                    }
                }
                _ = self.sigusr1.recv() => {
                    info!("SIGUSR1 received, shrinking classifier pool bounds");
                    self.classifier.borrow_mut().decrease();
                }
                _ = self.sigusr2.recv() => {
                    info!("SIGUSR2 received, growing classifier pool bounds");
                    self.classifier.borrow_mut().increase();
                }
                _ = self.sigtrap.recv() => {
                    info!("SIGTRAP received (verbose logging toggle is tracing's job, not ours)");
                }
            }
        }

        if let Err(e) = reactor_task.await {
            warn!(error = %e, "reactor task panicked during shutdown");
        }
    }
}
