//! The content/download manager: the upstream half of a relay.
//!
//! Grounded on `proto/h1/io.rs`'s buffering, generalized the same way
//! [`crate::client::buffered::Buffered`] is — one non-blocking
//! `tokio::net::TcpStream` to the origin, paced by the same high/low
//! water marks as the client side. The one piece of HTTP awareness this
//! module owns is forcing `Connection: close` on every forwarded request,
//! implementing the Non-goal "no persistent upstream connections": this
//! proxy opens a fresh upstream connection per request and never pools
//! them.

use http::header::{HeaderName, CONNECTION};

use crate::client::request::RequestHead;

/// Serializes `head` back into a request line + headers, with any
/// existing `Connection` header stripped and replaced by `Connection:
/// close`, ready to write to the upstream socket.
pub fn rewrite_connection_close(head: &RequestHead) -> String {
    let mut out = String::new();
    let path = head
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    out.push_str(head.method.as_str());
    out.push(' ');
    out.push_str(path);
    out.push_str(" HTTP/1.1\r\n");

    for (name, value) in head.headers.iter() {
        if name == CONNECTION {
            continue;
        }
        out.push_str(name.as_str());
        out.push_str(": ");
        out.push_str(value.to_str().unwrap_or(""));
        out.push_str("\r\n");
    }
    out.push_str("Connection: close\r\n\r\n");
    out
}

/// `true` if `name` is the hop-by-hop header this module rewrites;
/// exposed so callers building their own header list (e.g. the classifier
/// `rewrite` decision's forwarded request) can skip it the same way.
pub fn is_connection_header(name: &HeaderName) -> bool {
    name == CONNECTION
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::request;

    #[test]
    fn forces_connection_close_even_when_keep_alive_was_requested() {
        let raw = b"GET /path HTTP/1.1\r\nHost: example.com\r\nConnection: keep-alive\r\n\r\n";
        let (head, _) = request::parse(raw).unwrap().unwrap();
        let rewritten = rewrite_connection_close(&head);
        assert!(rewritten.contains("Connection: close\r\n"));
        assert!(!rewritten.to_lowercase().contains("keep-alive"));
    }

    #[test]
    fn preserves_other_headers_and_request_line() {
        let raw = b"GET /path?q=1 HTTP/1.1\r\nHost: example.com\r\nX-Custom: 1\r\n\r\n";
        let (head, _) = request::parse(raw).unwrap().unwrap();
        let rewritten = rewrite_connection_close(&head);
        assert!(rewritten.starts_with("GET /path?q=1 HTTP/1.1\r\n"));
        assert!(rewritten.contains("Host: example.com\r\n"));
        assert!(rewritten.contains("X-Custom: 1\r\n"));
    }
}
