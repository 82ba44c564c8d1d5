//! Request-line/header parsing.
//!
//! Uses `httparse` the way hyper's own `proto/h1` role/parse code does,
//! but produces an `http::request::Parts` instead of hyper's internal
//! `MessageHead` — this crate never builds a body-carrying `http::Request`
//! since it only ever needs the head to classify and relay.

use http::{HeaderMap, Method, Uri, Version};

const MAX_HEADERS: usize = 64;
/// Bound on a request head's size (spec.md §4.6: "bounded header size").
pub const MAX_HEAD_SIZE: usize = 64 * 1024;

/// A parsed request head, everything the classifier and relay need.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
}

impl RequestHead {
    pub fn is_connect(&self) -> bool {
        self.method == Method::CONNECT
    }

    pub fn host(&self) -> Option<&str> {
        self.uri
            .authority()
            .map(|a| a.host())
            .or_else(|| self.headers.get(http::header::HOST).and_then(|v| v.to_str().ok()))
    }

    pub fn port(&self) -> u16 {
        self.uri
            .port_u16()
            .unwrap_or_else(|| if self.uri.scheme_str() == Some("https") { 443 } else { 80 })
    }
}

/// Attempts to parse a complete request head out of `buf`.
///
/// Returns `Ok(Some((head, consumed)))` once a full head (terminated by
/// `\r\n\r\n`) is present, `Ok(None)` if more bytes are needed, and an
/// error if the head is malformed or exceeds [`MAX_HEAD_SIZE`].
pub fn parse(buf: &[u8]) -> crate::Result<Option<(RequestHead, usize)>> {
    if buf.len() > MAX_HEAD_SIZE {
        return Err(crate::Error::new_too_large());
    }

    let mut header_storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut header_storage);
    let status = req.parse(buf).map_err(crate::error::Parse::from)?;

    let consumed = match status {
        httparse::Status::Complete(n) => n,
        httparse::Status::Partial => return Ok(None),
    };

    let method: Method = req
        .method
        .ok_or_else(|| crate::Error::from(crate::error::Parse::Method))?
        .parse()
        .map_err(crate::error::Parse::from)?;
    let uri: Uri = req
        .path
        .ok_or_else(|| crate::Error::from(crate::error::Parse::Uri))?
        .parse()
        .map_err(crate::error::Parse::from)?;
    let version = if req.version == Some(1) {
        Version::HTTP_11
    } else {
        Version::HTTP_10
    };

    let mut headers = HeaderMap::with_capacity(req.headers.len());
    for header in req.headers.iter() {
        let name = http::header::HeaderName::from_bytes(header.name.as_bytes())
            .map_err(|_| crate::Error::from(crate::error::Parse::Header))?;
        let value = http::header::HeaderValue::from_bytes(header.value)
            .map_err(|_| crate::Error::from(crate::error::Parse::Header))?;
        headers.append(name, value);
    }

    Ok(Some((
        RequestHead {
            method,
            uri,
            version,
            headers,
        },
        consumed,
    )))
}
