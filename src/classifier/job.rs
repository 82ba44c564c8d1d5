//! The unit of work handed to a classifier worker.

use std::net::IpAddr;

/// Where a job originated. Distinguishes ordinary client requests from
/// admin/web-initiated re-classification requests, per spec.md §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// An ordinary client connection's request.
    Proxy,
    /// A request injected by the admin/web interface.
    Web,
}

/// A single redirector request: `(client_id, peer, request_headers,
/// sub_request, source, requeued)` from spec.md §3, generalized into a
/// struct. `requeued` jobs must re-enter the queue at the tail while
/// preserving FIFO order for everything else.
#[derive(Debug, Clone)]
pub struct Job {
    /// Identifies the client connection this job belongs to.
    pub client_id: u64,
    /// The client's peer address, passed to the redirector verbatim.
    pub peer: IpAddr,
    /// The request line's method, e.g. `GET`.
    pub method: String,
    /// The request line's URL, absolute-form for proxy requests.
    pub url: String,
    /// Extra request metadata the redirector protocol carries but does not
    /// interpret (reserved for future header forwarding).
    pub sub_request: Option<String>,
    pub source: Source,
    /// True if a worker asked for this job to be re-injected with an
    /// updated URL/headers rather than being a fresh accept.
    pub requeued: bool,
}

impl Job {
    /// Builds the Squid redirector protocol line for this job:
    /// `"<url> <peer> - <method> -\n"` (spec.md §6).
    pub fn to_redirector_line(&self) -> String {
        format!("{} {} - {} -\n", self.url, self.peer, self.method)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redirector_line_matches_squid_format() {
        let job = Job {
            client_id: 1,
            peer: "10.0.0.5".parse().unwrap(),
            method: "GET".to_owned(),
            url: "http://example.com/".to_owned(),
            sub_request: None,
            source: Source::Proxy,
            requeued: false,
        };
        assert_eq!(
            job.to_redirector_line(),
            "http://example.com/ 10.0.0.5 - GET -\n"
        );
    }
}
