//! A single redirector subprocess.
//!
//! Grounded on the original's `worker.py`: spawn the configured program
//! with piped stdin/stdout, write one Squid-format line per job, and read
//! back exactly one plain line in reply — the subprocess never sees or
//! emits anything about this crate's own internal wire format. That
//! internal format (netstring-framed, NUL-separated `Decision`s, see
//! `protocol.rs`) belongs to a different pipe entirely in the original:
//! `worker.response_box_write`, the worker thread's own internal pipe back
//! to `redirector/manager.py`'s reactor, never the subprocess's stdout.
//!
//! Here that internal pipe is simply the typed `mpsc` channel back to
//! [`super::Manager`] — there is no byte-level framing to perform since the
//! channel already carries [`Decision`] values directly, the same
//! oneshot/channel-rendezvous shape hyper's `client::dispatch` uses to hand
//! a request to a connection task and get a response back. A dedicated
//! task owns the subprocess's stdin/stdout and runs the full
//! write-then-readline round trip for each job in turn, mirroring the
//! original's dedicated worker thread: the round trip never blocks
//! `Manager::dispatch_one`, which only ever does a cheap channel send.

use std::time::Instant;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::job::Job;
use super::protocol::Decision;

pub type WorkerId = u64;

#[derive(Debug)]
pub struct Worker {
    id: WorkerId,
    created_at: Instant,
    child: Child,
    jobs: mpsc::UnboundedSender<Job>,
    closing: bool,
}

impl Worker {
    pub fn spawn(
        id: WorkerId,
        program: &str,
        args: &[String],
        replies: mpsc::UnboundedSender<(WorkerId, Decision)>,
    ) -> crate::Result<Self> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(crate::Error::new_worker)?;

        let stdin = child.stdin.take().expect("piped stdin");
        let stdout = child.stdout.take().expect("piped stdout");

        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_subprocess(id, stdin, stdout, jobs_rx, replies));

        Ok(Worker {
            id,
            created_at: Instant::now(),
            child,
            jobs: jobs_tx,
            closing: false,
        })
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }
    pub fn created_at(&self) -> Instant {
        self.created_at
    }
    pub fn is_closing(&self) -> bool {
        self.closing
    }
    pub fn mark_closing(&mut self) {
        self.closing = true;
    }

    /// Hands `job` to this worker's subprocess task. Returns once the job
    /// is queued, not once it is answered — the answer arrives later over
    /// the `replies` channel passed to [`Worker::spawn`].
    pub async fn send(&mut self, job: &Job) -> crate::Result<()> {
        self.jobs.send(job.clone()).map_err(|_| crate::Error::new_worker(WorkerGone))?;
        Ok(())
    }

    pub async fn shutdown(mut self) {
        drop(self.jobs);
        match self.child.wait().await {
            Ok(status) => debug!(worker = self.id, ?status, "worker exited"),
            Err(e) => warn!(worker = self.id, error = %e, "error waiting on worker"),
        }
    }
}

#[derive(Debug)]
struct WorkerGone;

impl std::fmt::Display for WorkerGone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("redirector subprocess task is gone")
    }
}

impl std::error::Error for WorkerGone {}

/// Owns the subprocess's stdin/stdout for its whole lifetime, taking jobs
/// one at a time off `jobs` and running each through the Squid redirector
/// protocol: write the line, flush, read back one reply line. Serialized
/// the same way the real helper process is — one job in flight at a time —
/// since a Squid-style redirector line is meaningless to pipeline.
async fn run_subprocess(
    id: WorkerId,
    mut stdin: ChildStdin,
    stdout: ChildStdout,
    mut jobs: mpsc::UnboundedReceiver<Job>,
    replies: mpsc::UnboundedSender<(WorkerId, Decision)>,
) {
    let mut stdout = BufReader::new(stdout);
    while let Some(job) = jobs.recv().await {
        let line = job.to_redirector_line();
        match roundtrip(&mut stdin, &mut stdout, &line).await {
            Ok(reply_line) => {
                let decision = build_decision(&job, &reply_line);
                if replies.send((id, decision)).is_err() {
                    return;
                }
            }
            Err(e) => {
                warn!(worker = id, error = %e, "redirector subprocess failed, reaping");
                let _ = replies.send((
                    id,
                    Decision::Response {
                        client_id: job.client_id.to_string(),
                        code: "500".to_owned(),
                        title: "Internal Server Error".to_owned(),
                        body: "internal_error.html".to_owned(),
                    },
                ));
                let _ = replies.send((id, Decision::Hangup { worker_id: id.to_string() }));
                return;
            }
        }
    }
}

async fn roundtrip(stdin: &mut ChildStdin, stdout: &mut BufReader<ChildStdout>, line: &str) -> crate::Result<String> {
    stdin.write_all(line.as_bytes()).await.map_err(crate::Error::new_io)?;
    stdin.flush().await.map_err(crate::Error::new_io)?;

    let mut reply = String::new();
    let n = stdout.read_line(&mut reply).await.map_err(crate::Error::new_io)?;
    if n == 0 {
        return Err(crate::Error::new_io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "redirector subprocess closed its reply pipe",
        )));
    }
    Ok(reply)
}

/// Turns the subprocess's one-line reply into a [`Decision`]: per the Squid
/// URL-rewriter convention (spec.md §6), an empty line means "pass the
/// original request through unchanged", any other line is a replacement
/// URL. Either way the request still needs DNS, which this crate does
/// asynchronously in the `resolver` module rather than inline in the
/// worker, so both branches report a pre-DNS hostname/port, never a
/// resolved address.
fn build_decision(job: &Job, reply_line: &str) -> Decision {
    let client_id = job.client_id.to_string();
    let trimmed = reply_line.trim();

    if trimmed.is_empty() || trimmed == job.url {
        let (hostname, port) = host_port(&job.url);
        return Decision::Download { client_id, hostname, port };
    }

    match trimmed.parse::<http::Uri>() {
        Ok(uri) if uri.host().is_some() => Decision::Rewrite {
            client_id,
            code: "200".to_owned(),
            filename: uri.path().to_owned(),
            scheme: uri.scheme_str().unwrap_or("http").to_owned(),
            hostname: uri.host().unwrap_or_default().to_owned(),
            peer: job.peer.to_string(),
        },
        _ => {
            let (hostname, port) = host_port(&job.url);
            Decision::Download { client_id, hostname, port }
        }
    }
}

/// Extracts `(hostname, port)` from a job's absolute-form URL, defaulting
/// the port by scheme when the URL doesn't carry one explicitly.
fn host_port(url: &str) -> (String, String) {
    match url.parse::<http::Uri>() {
        Ok(uri) => {
            let hostname = uri.host().unwrap_or_default().to_owned();
            let port = uri
                .port_u16()
                .unwrap_or(if uri.scheme_str() == Some("https") { 443 } else { 80 })
                .to_string();
            (hostname, port)
        }
        Err(_) => (String::new(), "80".to_owned()),
    }
}

#[cfg(test)]
mod tests {
    use super::super::job::Source;
    use super::*;

    fn job(url: &str) -> Job {
        Job {
            client_id: 9,
            peer: "127.0.0.1".parse().unwrap(),
            method: "GET".to_owned(),
            url: url.to_owned(),
            sub_request: None,
            source: Source::Proxy,
            requeued: false,
        }
    }

    #[test]
    fn blank_reply_passes_the_original_request_through() {
        let decision = build_decision(&job("http://example.com/"), "\n");
        assert_eq!(
            decision,
            Decision::Download {
                client_id: "9".to_owned(),
                hostname: "example.com".to_owned(),
                port: "80".to_owned(),
            }
        );
    }

    #[test]
    fn unchanged_url_echoed_back_also_passes_through() {
        let decision = build_decision(&job("http://example.com/"), "http://example.com/\n");
        assert!(matches!(decision, Decision::Download { .. }));
    }

    #[test]
    fn replacement_url_becomes_a_rewrite_decision() {
        let decision = build_decision(&job("http://example.com/"), "http://mirror.example.net/page\n");
        assert_eq!(
            decision,
            Decision::Rewrite {
                client_id: "9".to_owned(),
                code: "200".to_owned(),
                filename: "/page".to_owned(),
                scheme: "http".to_owned(),
                hostname: "mirror.example.net".to_owned(),
                peer: "127.0.0.1".to_owned(),
            }
        );
    }

    #[test]
    fn https_url_keeps_the_default_port() {
        let (hostname, port) = host_port("https://example.com/secure");
        assert_eq!(hostname, "example.com");
        assert_eq!(port, "443");
    }
}
