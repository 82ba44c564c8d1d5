//! DNS message encode/decode.
//!
//! Grounded on `other_examples/…hickory-dns…udp_client_stream.rs`: rather
//! than hand-rolling the DNS wire format, query and response messages are
//! built and parsed with `hickory-proto`'s `op::Message`/`op::Query` and
//! `rr::Name` types. Only the socket I/O, cache, and timeout bookkeeping
//! around these messages are this crate's own.

use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{DNSClass, Name, RecordType};
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use std::net::IpAddr;
use std::str::FromStr;

/// Builds a DNS query message for `hostname`, tagged with transaction id
/// `id` (spec.md §3: "`transport_identifier` is the DNS message id for
/// UDP").
pub fn build_query(id: u16, hostname: &str) -> crate::Result<Vec<u8>> {
    let name = Name::from_str(hostname).map_err(crate::Error::new_resolve)?;
    let mut message = Message::new();
    message
        .set_id(id)
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true);
    message.add_query(Query::query(name, RecordType::A));
    message.to_bytes().map_err(crate::Error::new_resolve)
}

/// The outcome of decoding a response datagram/stream chunk.
#[derive(Debug)]
pub struct Answer {
    pub id: u16,
    pub question_name: Option<String>,
    pub addresses: Vec<IpAddr>,
    pub truncated: bool,
}

/// Parses a raw response buffer into an [`Answer`], pulling every `A`/`AAAA`
/// record's address out of the answer section.
pub fn parse_response(buf: &[u8]) -> crate::Result<Answer> {
    let message = Message::from_bytes(buf).map_err(crate::Error::new_resolve)?;
    let id = message.id();
    let truncated = message.truncated();
    let question_name = message.queries().first().map(|q| q.name().to_string());
    let addresses = message
        .answers()
        .iter()
        .filter_map(|record| record.data())
        .filter_map(|data| data.ip_addr())
        .collect();
    Ok(Answer {
        id,
        question_name,
        addresses,
        truncated,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_query_sets_requested_id() {
        let bytes = build_query(0xBEEF, "example.com").unwrap();
        let message = Message::from_bytes(&bytes).unwrap();
        assert_eq!(message.id(), 0xBEEF);
        assert_eq!(message.queries().len(), 1);
    }
}
