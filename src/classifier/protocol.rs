//! Netstring reply framing and decision parsing for the redirector wire
//! protocol (spec.md §6).

use std::fmt;

/// One parsed command from a worker's reply stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Request {
        client_id: String,
        ip: String,
        port: String,
        raw_request: String,
    },
    Connect {
        client_id: String,
        ip: String,
        port: String,
    },
    Download {
        client_id: String,
        hostname: String,
        port: String,
    },
    Response {
        client_id: String,
        code: String,
        title: String,
        body: String,
    },
    File {
        client_id: String,
        code: String,
        filename: String,
    },
    Rewrite {
        client_id: String,
        code: String,
        filename: String,
        scheme: String,
        hostname: String,
        peer: String,
    },
    Requeue {
        client_id: String,
        peer: String,
        source: String,
        header: String,
        subheader: String,
    },
    Hangup {
        worker_id: String,
    },
    Stats {
        worker_id: String,
        timestamp: String,
        stats: Vec<(String, String)>,
    },
}

impl Decision {
    /// The client this decision answers, for every variant that answers a
    /// specific client rather than reporting on the pool itself
    /// (`Hangup`/`Stats` report a worker, not a client, and return `None`).
    pub fn client_id(&self) -> Option<u64> {
        let raw = match self {
            Decision::Request { client_id, .. }
            | Decision::Connect { client_id, .. }
            | Decision::Download { client_id, .. }
            | Decision::Response { client_id, .. }
            | Decision::File { client_id, .. }
            | Decision::Rewrite { client_id, .. }
            | Decision::Requeue { client_id, .. } => client_id,
            Decision::Hangup { .. } | Decision::Stats { .. } => return None,
        };
        raw.parse().ok()
    }
}

/// Reads netstring frames (`<decimal length>:<payload>,`) out of a byte
/// buffer accumulated from a worker's stdout pipe. Returns complete frames
/// and leaves any partial trailing frame in `buf` for the next read.
#[derive(Debug, Default)]
pub struct NetstringDecoder {
    buf: Vec<u8>,
}

impl NetstringDecoder {
    pub fn new() -> Self {
        NetstringDecoder { buf: Vec::new() }
    }

    /// Feeds newly-read bytes in and drains every complete frame currently
    /// available, in order.
    pub fn feed(&mut self, bytes: &[u8]) -> crate::Result<Vec<Vec<u8>>> {
        self.buf.extend_from_slice(bytes);
        let mut frames = Vec::new();
        loop {
            match self.try_decode_one()? {
                Some(frame) => frames.push(frame),
                None => break,
            }
        }
        Ok(frames)
    }

    fn try_decode_one(&mut self) -> crate::Result<Option<Vec<u8>>> {
        let colon = match self.buf.iter().position(|&b| b == b':') {
            Some(idx) => idx,
            None => {
                if self.buf.len() > 20 {
                    // A netstring length prefix this long is never valid.
                    return Err(crate::Error::new_netstring());
                }
                return Ok(None);
            }
        };
        let len: usize = std::str::from_utf8(&self.buf[..colon])
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(crate::Error::new_netstring)?;

        let payload_start = colon + 1;
        let payload_end = payload_start + len;
        if self.buf.len() < payload_end + 1 {
            return Ok(None);
        }
        if self.buf[payload_end] != b',' {
            return Err(crate::Error::new_netstring());
        }

        let payload = self.buf[payload_start..payload_end].to_vec();
        self.buf.drain(..=payload_end);
        Ok(Some(payload))
    }
}

/// Encodes a payload as a netstring frame, for tests and for the admin
/// interface's own replies to the reactor.
pub fn encode(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 8);
    out.extend_from_slice(payload.len().to_string().as_bytes());
    out.push(b':');
    out.extend_from_slice(payload);
    out.push(b',');
    out
}

/// Parses a decoded netstring payload (`client_id\0command\0decision`) into
/// a [`Decision`].
pub fn parse_decision(payload: &[u8]) -> crate::Result<Decision> {
    let text = std::str::from_utf8(payload).map_err(|_| crate::Error::new_netstring())?;
    let mut parts = text.split('\0');
    let client_id = parts.next().ok_or_else(crate::Error::new_netstring)?.to_owned();
    let command = parts.next().ok_or_else(crate::Error::new_netstring)?;
    let rest: Vec<&str> = parts.collect();

    let decision = match command {
        "request" => Decision::Request {
            client_id,
            ip: field(&rest, 0)?,
            port: field(&rest, 1)?,
            raw_request: rest.get(2..).map(|s| s.join("\0")).unwrap_or_default(),
        },
        "connect" => Decision::Connect {
            client_id,
            ip: field(&rest, 0)?,
            port: field(&rest, 1)?,
        },
        "download" => Decision::Download {
            client_id,
            hostname: field(&rest, 0)?,
            port: field(&rest, 1)?,
        },
        "response" => Decision::Response {
            client_id,
            code: field(&rest, 0)?,
            title: field(&rest, 1)?,
            body: rest.get(2..).map(|s| s.join("\0")).unwrap_or_default(),
        },
        "file" => Decision::File {
            client_id,
            code: field(&rest, 0)?,
            filename: field(&rest, 1)?,
        },
        "rewrite" => Decision::Rewrite {
            client_id,
            code: field(&rest, 0)?,
            filename: field(&rest, 1)?,
            scheme: field(&rest, 2)?,
            hostname: rest.get(rest.len().saturating_sub(2)).copied().unwrap_or("").to_owned(),
            peer: rest.last().copied().unwrap_or("").to_owned(),
        },
        "requeue" => Decision::Requeue {
            client_id,
            peer: field(&rest, 0)?,
            source: field(&rest, 1)?,
            header: field(&rest, 2)?,
            subheader: field(&rest, 3)?,
        },
        "hangup" => Decision::Hangup {
            // the worker id is carried in the decision slot, i.e. client_id
            worker_id: client_id,
        },
        "stats" => {
            let worker_id = client_id;
            let timestamp = field(&rest, 0)?;
            let raw = rest.get(1..).map(|s| s.join("\0")).unwrap_or_default();
            Decision::Stats {
                worker_id,
                timestamp,
                stats: parse_stats(&raw),
            }
        }
        _ => return Err(crate::Error::new_netstring()),
    };
    Ok(decision)
}

fn field(rest: &[&str], idx: usize) -> crate::Result<String> {
    rest.get(idx)
        .map(|s| s.to_string())
        .ok_or_else(crate::Error::new_netstring)
}

/// Parses a `k=v&k=v&...` stats blob.
///
/// The reference implementation's `storeStats` is broken: it calls
/// `stats.split('?', 1).split('&')`, which applies `.split('&')` to the
/// *list* `split('?', 1)` returned, not to a string — a `AttributeError` in
/// Python. REDESIGN FLAGS calls for the obviously-intended fix instead:
/// strip a single leading `?` if present, then split on `&`.
pub fn parse_stats(raw: &str) -> Vec<(String, String)> {
    let raw = raw.strip_prefix('?').unwrap_or(raw);
    raw.split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (k.to_owned(), v.to_owned()),
            None => (pair.to_owned(), String::new()),
        })
        .collect()
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn netstring_round_trip() {
        let mut decoder = NetstringDecoder::new();
        let framed = encode(b"42\0connect\0ip\0port");
        let frames = decoder.feed(&framed).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0], b"42\0connect\0ip\0port");
    }

    #[test]
    fn netstring_handles_split_reads() {
        let mut decoder = NetstringDecoder::new();
        let framed = encode(b"1\0hangup\0w3");
        let (first, second) = framed.split_at(framed.len() / 2);
        assert!(decoder.feed(first).unwrap().is_empty());
        let frames = decoder.feed(second).unwrap();
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn netstring_rejects_bad_terminator() {
        let mut decoder = NetstringDecoder::new();
        let bad = b"3:abc;".to_vec();
        assert!(decoder.feed(&bad).is_err());
    }

    #[test]
    fn connect_decision_parses() {
        let payload = b"7\0connect\093.184.216.34\0443";
        let decision = parse_decision(payload).unwrap();
        assert_eq!(
            decision,
            Decision::Connect {
                client_id: "7".to_owned(),
                ip: "93.184.216.34".to_owned(),
                port: "443".to_owned(),
            }
        );
    }

    #[test]
    fn hangup_decision_carries_worker_id() {
        let decision = parse_decision(b"w4\0hangup").unwrap();
        assert_eq!(
            decision,
            Decision::Hangup {
                worker_id: "w4".to_owned()
            }
        );
    }

    #[test]
    fn stats_parses_with_fixed_split() {
        let pairs = parse_stats("?jobs=12&queued=3&workers=4");
        assert_eq!(
            pairs,
            vec![
                ("jobs".to_owned(), "12".to_owned()),
                ("queued".to_owned(), "3".to_owned()),
                ("workers".to_owned(), "4".to_owned()),
            ]
        );
    }

    #[test]
    fn stats_parses_without_leading_question_mark() {
        let pairs = parse_stats("jobs=1");
        assert_eq!(pairs, vec![("jobs".to_owned(), "1".to_owned())]);
    }
}
