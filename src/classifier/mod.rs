//! The classifier ("redirector") worker pool.
//!
//! Grounded on `original_source/.../redirector/manager.py`: an elastic
//! pool between `low` and `high` workers fed by a single bounded FIFO
//! queue, with provisioning/reaping decisions made once per maintenance
//! tick. The "oldest worker" tie-break for reaping uses a monotonic
//! sequence number alongside the creation timestamp (REDESIGN FLAGS item
//! 1: `active`/worker bookkeeping should not rely on timestamp alone,
//! since two workers can be spawned within the same clock tick).

pub mod job;
pub mod protocol;
pub mod worker;

pub use job::{Job, Source};
pub use protocol::Decision;
pub use worker::{Worker, WorkerId};

use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{info, warn};

use crate::config::PoolConfig;

/// A reply routed back from a worker to whichever job it answers.
#[derive(Debug)]
pub struct Reply {
    pub worker_id: WorkerId,
    pub decision: Decision,
}

/// Manages the worker pool: provisioning, dispatch, and reply routing.
pub struct Manager {
    config: PoolConfig,
    workers: Vec<Worker>,
    next_worker_id: WorkerId,
    next_sequence: u64,
    queue: VecDeque<Job>,
    /// Oneshot-per-job rendezvous: each client's `run()` task awaits the
    /// receiver half while the reactor (via [`Manager::poll_reply`] /
    /// [`Manager::complete`]) fires the sender once that client's decision
    /// arrives. The same shape as hyper's `client::dispatch` channel of
    /// `(request, oneshot-callback)` pairs, generalized from "one HTTP
    /// request" to "one classifier job".
    pending: HashMap<u64, oneshot::Sender<Decision>>,
    /// The job most recently handed to a worker for each client, kept
    /// around only so a `requeue` reply — which per spec.md §6 carries
    /// just `client_id\0peer\0source\0header\0subheader`, not the method —
    /// can be rebuilt into a full [`Job`] before re-entering the queue.
    in_flight: HashMap<u64, Job>,
    replies_tx: mpsc::UnboundedSender<(WorkerId, Decision)>,
    /// Fired every time a job joins the queue, so the reactor can attempt
    /// dispatch right away instead of waiting for the next maintenance
    /// tick. Plain `Rc`, not behind the manager's own `RefCell`: notifying
    /// and waiting are both safe to do without ever borrowing `Manager`
    /// itself (`Notify::notify_one`/`notified` take `&self`).
    dispatch_notify: Rc<Notify>,
}

/// The receiver half of a pool's reply channel, kept outside the
/// `Rc<RefCell<Manager>>` the reactor and supervisor both hold. Awaiting a
/// reply and mutating the manager are two separate steps for exactly this
/// reason: a `recv().await` that instead lived behind `Manager`'s own
/// `RefCell` borrow would stay borrowed for as long as the pool has nothing
/// to say, and a concurrent signal handler reaching for the same
/// `Rc<RefCell<Manager>>` (see [`crate::supervisor::Supervisor::run`])
/// would panic on the double borrow.
pub struct Replies {
    rx: mpsc::UnboundedReceiver<(WorkerId, Decision)>,
}

impl std::fmt::Debug for Replies {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replies").finish()
    }
}

impl Replies {
    /// Awaits the next reply from any worker. One arm of the reactor's
    /// `select!`; routing it into the manager ([`Manager::route_reply`])
    /// is a separate, synchronous step the reactor performs once this
    /// resolves.
    pub async fn recv(&mut self) -> Option<(WorkerId, Decision)> {
        self.rx.recv().await
    }
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("config", &self.config)
            .field("workers", &self.workers.len())
            .field("queue_len", &self.queue.len())
            .field("pending", &self.pending.len())
            .field("in_flight", &self.in_flight.len())
            .finish()
    }
}

impl Manager {
    /// Creates an empty pool, along with the [`Replies`] handle the reactor
    /// awaits independently of the `Rc<RefCell<Manager>>` itself. Call
    /// [`Manager::start`] to bring the pool up to `low` workers.
    pub fn new(config: PoolConfig) -> (Self, Replies) {
        let (tx, rx) = mpsc::unbounded_channel();
        let manager = Manager {
            config,
            workers: Vec::new(),
            next_worker_id: 0,
            next_sequence: 0,
            queue: VecDeque::new(),
            pending: HashMap::new(),
            in_flight: HashMap::new(),
            replies_tx: tx,
            dispatch_notify: Rc::new(Notify::new()),
        };
        (manager, Replies { rx })
    }

    /// A handle the reactor awaits directly (never through the manager's
    /// own `RefCell`) to learn a job was just enqueued.
    pub fn dispatch_notify(&self) -> Rc<Notify> {
        self.dispatch_notify.clone()
    }

    /// Spawns `low` workers. Idempotent: only spawns up to the deficit.
    pub fn start(&mut self) -> crate::Result<()> {
        let deficit = self.config.low.saturating_sub(self.workers.len());
        for _ in 0..deficit {
            self.spawn_one()?;
        }
        Ok(())
    }

    /// Signals every worker to exit and drains them. Called from the
    /// supervisor's shutdown sequence.
    pub async fn stop(&mut self) {
        for worker in self.workers.drain(..) {
            worker.shutdown().await;
        }
    }

    fn spawn_one(&mut self) -> crate::Result<()> {
        let id = self.next_worker_id;
        self.next_worker_id += 1;
        let worker = Worker::spawn(id, &self.config.program, &self.config.args, self.replies_tx.clone())?;
        info!(worker = id, "spawned classifier worker");
        self.workers.push(worker);
        Ok(())
    }

    /// Enqueues a job. Requeued jobs join the tail like any other job —
    /// FIFO is preserved for originals, requeues simply re-enter at the
    /// back of the same queue (spec.md §3).
    pub fn request(&mut self, job: Job) {
        self.queue.push_back(job);
        self.dispatch_notify.notify_one();
    }

    /// Enqueues a job and returns the receiver half of the oneshot that
    /// will carry its decision once a worker replies. The caller (a
    /// client connection's `run()` task) simply awaits the receiver.
    pub fn request_and_wait(&mut self, job: Job) -> oneshot::Receiver<Decision> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(job.client_id, tx);
        self.queue.push_back(job);
        self.dispatch_notify.notify_one();
        rx
    }

    /// Number of jobs waiting for a free worker.
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Number of live (including closing) workers.
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Hands the head of the queue to the least-recently-used
    /// non-closing worker, if both a job and a worker are available.
    pub async fn dispatch_one(&mut self) -> crate::Result<bool> {
        if self.queue.is_empty() {
            return Ok(false);
        }
        let worker_idx = match self
            .workers
            .iter()
            .enumerate()
            .filter(|(_, w)| !w.is_closing())
            .min_by_key(|(_, w)| w.created_at())
        {
            Some((idx, _)) => idx,
            None => return Ok(false),
        };
        let job = self.queue.pop_front().expect("checked non-empty above");
        self.workers[worker_idx].send(&job).await?;
        self.in_flight.insert(job.client_id, job);
        Ok(true)
    }

    /// Routes a reply already pulled off a [`Replies`] handle: `requeue`
    /// re-enters the queue without disturbing the client's still-pending
    /// oneshot (spec.md §4.6: `awaiting_classification` only leaves on a
    /// *terminal* reply); every other client-addressed decision fires that
    /// oneshot. Always returns the reply too so the caller can still act
    /// on pool-level bookkeeping (`hangup`, `stats`). Entirely synchronous,
    /// so the reactor never holds the manager's `RefCell` borrow across an
    /// await — see [`Replies`] for why that matters.
    pub fn route_reply(&mut self, worker_id: WorkerId, decision: Decision) -> Reply {
        if let Decision::Requeue {
            client_id,
            header,
            source,
            ..
        } = &decision
        {
            if let Ok(id) = client_id.parse::<u64>() {
                if let Some(mut job) = self.in_flight.remove(&id) {
                    job.url = header.clone();
                    job.requeued = true;
                    let _ = source;
                    self.queue.push_back(job);
                    self.dispatch_notify.notify_one();
                } else {
                    warn!(client = %client_id, "requeue for a client with no in-flight job, dropping");
                }
            }
            return Reply { worker_id, decision };
        }

        if let Some(client_id) = decision.client_id() {
            self.in_flight.remove(&client_id);
            if let Some(tx) = self.pending.remove(&client_id) {
                let _ = tx.send(decision.clone());
            }
        }
        Reply { worker_id, decision }
    }

    /// Periodic maintenance: provisioning and reaping, run from the
    /// supervisor's 1-second alarm tick.
    ///
    /// - if `workers < low`, spawn `low - workers`.
    /// - if `queue_size >= workers` and `workers < high`, spawn
    ///   `min(max(1, min(low, (high-low)/4)), high-workers)`.
    /// - if `queue_size < 2` and `workers > low`, reap the oldest
    ///   non-closing worker.
    pub fn provision(&mut self) -> crate::Result<()> {
        let workers = self.workers.len();
        let queue_size = self.queue.len();

        if workers < self.config.low {
            for _ in 0..(self.config.low - workers) {
                self.spawn_one()?;
            }
            return Ok(());
        }

        if queue_size >= workers && workers < self.config.high {
            let step = std::cmp::max(1, std::cmp::min(self.config.low, (self.config.high - self.config.low) / 4));
            let to_spawn = std::cmp::min(step, self.config.high - workers);
            for _ in 0..to_spawn {
                self.spawn_one()?;
            }
            return Ok(());
        }

        if queue_size < 2 && workers > self.config.low {
            self.reap_oldest();
        }

        Ok(())
    }

    /// Reaps the oldest non-closing worker: smallest creation timestamp,
    /// with `next_sequence` as a tiebreaker when two workers share a tick.
    fn reap_oldest(&mut self) {
        let oldest = self
            .workers
            .iter()
            .enumerate()
            .filter(|(_, w)| !w.is_closing())
            .min_by_key(|(idx, w)| (w.created_at(), *idx));
        if let Some((idx, _)) = oldest {
            self.workers[idx].mark_closing();
            let worker = self.workers.remove(idx);
            info!(worker = worker.id(), "reaping idle classifier worker");
            tokio::spawn(worker.shutdown());
        }
    }

    /// `SIGUSR1`: shrink the pool bounds.
    pub fn decrease(&mut self) {
        self.config.low = self.config.low.saturating_sub(1).max(1);
        self.config.high = self.config.high.saturating_sub(1).max(self.config.low);
    }

    /// `SIGUSR2`: grow the pool bounds.
    pub fn increase(&mut self) {
        self.config.low += 1;
        self.config.high += 1;
    }

    /// `SIGHUP`: respawn the whole pool with the current configuration.
    pub async fn respawn(&mut self) -> crate::Result<()> {
        let old = std::mem::take(&mut self.workers);
        for worker in old {
            worker.shutdown().await;
        }
        self.start()
    }

    /// Removes a worker that hung up unexpectedly; any job still in
    /// flight for it stays queued (spec.md: "a worker hangup cancels
    /// nothing at the client layer directly").
    pub fn reap_hungup(&mut self, worker_id: WorkerId) {
        if let Some(idx) = self.workers.iter().position(|w| w.id() == worker_id) {
            self.workers.remove(idx);
            warn!(worker = worker_id, "classifier worker hung up");
        }
    }

    /// Records a `stats` reply's parsed `k=v` pairs, tagged with a fresh
    /// monotonic sequence number so duplicate timestamps from different
    /// workers don't collide in `stats::Recorder`.
    pub fn next_sequence(&mut self) -> u64 {
        let seq = self.next_sequence;
        self.next_sequence += 1;
        seq
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;

    fn pool_config() -> PoolConfig {
        PoolConfig {
            low: 2,
            high: 8,
            program: "/bin/cat".to_owned(),
            args: Vec::new(),
        }
    }

    #[test]
    fn requeued_jobs_join_the_tail() {
        let (mut manager, _replies) = Manager::new(pool_config());
        let job = |id: u64| Job {
            client_id: id,
            peer: "127.0.0.1".parse().unwrap(),
            method: "GET".to_owned(),
            url: "http://a/".to_owned(),
            sub_request: None,
            source: Source::Proxy,
            requeued: false,
        };
        manager.request(job(1));
        manager.request(job(2));
        let mut requeue = job(1);
        requeue.requeued = true;
        manager.request(requeue);
        assert_eq!(manager.queue_len(), 3);
    }

    #[tokio::test]
    async fn requeue_reply_rebuilds_the_job_without_resolving_the_waiting_oneshot() {
        let (mut manager, mut replies) = Manager::new(pool_config());
        let job = Job {
            client_id: 7,
            peer: "127.0.0.1".parse().unwrap(),
            method: "GET".to_owned(),
            url: "http://a/".to_owned(),
            sub_request: None,
            source: Source::Proxy,
            requeued: false,
        };
        let rx = manager.request_and_wait(job.clone());
        manager.in_flight.insert(7, job);
        manager
            .replies_tx
            .send((
                0,
                Decision::Requeue {
                    client_id: "7".to_owned(),
                    peer: "127.0.0.1".to_owned(),
                    source: "proxy".to_owned(),
                    header: "http://b/".to_owned(),
                    subheader: String::new(),
                },
            ))
            .unwrap();

        let (worker_id, decision) = replies.recv().await.unwrap();
        manager.route_reply(worker_id, decision);

        assert_eq!(manager.queue_len(), 1);
        assert_eq!(manager.queue.front().unwrap().url, "http://b/");
        assert!(manager.queue.front().unwrap().requeued);
        assert!(rx.try_recv().is_err());
    }
}
