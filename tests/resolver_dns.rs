//! `Resolver` tests against a real loopback UDP socket standing in for a
//! nameserver, built by hand with `hickory-proto` (a regular dependency,
//! not merely a dev one) rather than any mock transport.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use hickory_proto::op::{Message, MessageType, OpCode};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{Name, RData, Record, RecordType};
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use tokio::net::UdpSocket;

use exaproxy::config::ResolverConfig;
use exaproxy::resolver::{Command, Resolver};

async fn fake_nameserver() -> (UdpSocket, SocketAddr) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    (socket, addr)
}

fn build_answer(id: u16, query: &Message, ip: Ipv4Addr) -> Vec<u8> {
    let mut response = Message::new();
    response
        .set_id(id)
        .set_message_type(MessageType::Response)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true)
        .set_recursion_available(true);
    for q in query.queries() {
        response.add_query(q.clone());
    }
    let name = Name::from_str("example.test.").unwrap();
    let record = Record::from_rdata(name, 300, RData::A(A(ip)));
    response.add_answer(record);
    response.to_bytes().unwrap()
}

/// Same transaction id, but answering a different hostname than the one
/// queried — the mis-addressed-response case from the resolver's Testable
/// Property 5.
fn build_wrong_host_answer(id: u16, ip: Ipv4Addr) -> Vec<u8> {
    let mut response = Message::new();
    response
        .set_id(id)
        .set_message_type(MessageType::Response)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true)
        .set_recursion_available(true);
    let wrong_name = Name::from_str("attacker.test.").unwrap();
    response.add_query(hickory_proto::op::Query::query(wrong_name.clone(), RecordType::A));
    let record = Record::from_rdata(wrong_name, 300, RData::A(A(ip)));
    response.add_answer(record);
    response.to_bytes().unwrap()
}

#[tokio::test]
async fn resolve_and_wait_delivers_addresses_from_the_network() {
    let (fake_server, fake_addr) = fake_nameserver().await;

    let config = ResolverConfig {
        nameservers: vec![fake_addr],
        ..ResolverConfig::default()
    };
    let (mut resolver, mut replies) = Resolver::new(config);

    let rx = resolver
        .resolve_and_wait(1, "example.test", Command::Connect { port: 443 })
        .await
        .unwrap();

    let mut query_buf = [0u8; 512];
    let (n, query_peer) = fake_server.recv_from(&mut query_buf).await.unwrap();
    let query_message = Message::from_bytes(&query_buf[..n]).unwrap();

    let answer_bytes = build_answer(query_message.id(), &query_message, Ipv4Addr::new(93, 184, 216, 34));
    fake_server.send_to(&answer_bytes, query_peer).await.unwrap();

    let (id, raw) = tokio::time::timeout(Duration::from_secs(1), replies.recv())
        .await
        .unwrap()
        .unwrap();
    let resolved = resolver.handle_event(id, raw).await;
    assert!(resolved.is_none(), "handle_event only reports via the caller's oneshot");

    let result = tokio::time::timeout(Duration::from_secs(1), rx).await.unwrap().unwrap();
    match result {
        exaproxy::resolver::ResolveResult::Addresses(addrs) => {
            assert_eq!(addrs, vec![IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34))]);
        }
        other => panic!("expected addresses, got {other:?}"),
    }
}

#[tokio::test]
async fn literal_ip_resolves_without_touching_the_network() {
    let config = ResolverConfig::default();
    let (mut resolver, _replies) = Resolver::new(config);

    let rx = resolver
        .resolve_and_wait(7, "203.0.113.9", Command::Download)
        .await
        .unwrap();

    let result = tokio::time::timeout(Duration::from_millis(100), rx)
        .await
        .unwrap()
        .unwrap();
    match result {
        exaproxy::resolver::ResolveResult::Addresses(addrs) => {
            assert_eq!(addrs, vec![IpAddr::V4(Ipv4Addr::new(203, 0, 113, 9))]);
        }
        other => panic!("expected addresses, got {other:?}"),
    }
}

#[tokio::test]
async fn mismatched_reply_does_not_stall_the_real_answer() {
    let (fake_server, fake_addr) = fake_nameserver().await;

    let config = ResolverConfig {
        nameservers: vec![fake_addr],
        ..ResolverConfig::default()
    };
    let (mut resolver, mut replies) = Resolver::new(config);

    let mut rx = resolver
        .resolve_and_wait(1, "example.test", Command::Connect { port: 443 })
        .await
        .unwrap();

    let mut query_buf = [0u8; 512];
    let (n, query_peer) = fake_server.recv_from(&mut query_buf).await.unwrap();
    let query_message = Message::from_bytes(&query_buf[..n]).unwrap();

    // A reply for the wrong hostname, same transaction id, arrives first.
    let wrong_answer = build_wrong_host_answer(query_message.id(), Ipv4Addr::new(10, 0, 0, 1));
    fake_server.send_to(&wrong_answer, query_peer).await.unwrap();

    let (id, raw) = tokio::time::timeout(Duration::from_secs(1), replies.recv())
        .await
        .unwrap()
        .unwrap();
    let resolved = resolver.handle_event(id, raw).await;
    assert!(resolved.is_none(), "a mismatched reply must not resolve the query");
    assert!(rx.try_recv().is_err(), "the client must still be waiting after a mismatched reply");

    // The correct answer follows; the same read task must still be
    // listening for it.
    let right_answer = build_answer(query_message.id(), &query_message, Ipv4Addr::new(93, 184, 216, 34));
    fake_server.send_to(&right_answer, query_peer).await.unwrap();

    let (id, raw) = tokio::time::timeout(Duration::from_secs(1), replies.recv())
        .await
        .unwrap()
        .unwrap();
    let resolved = resolver.handle_event(id, raw).await;
    assert!(resolved.is_some(), "the correct reply must still resolve the query");

    let result = tokio::time::timeout(Duration::from_secs(1), rx).await.unwrap().unwrap();
    match result {
        exaproxy::resolver::ResolveResult::Addresses(addrs) => {
            assert_eq!(addrs, vec![IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34))]);
        }
        other => panic!("expected addresses, got {other:?}"),
    }
}

#[tokio::test]
async fn sweep_times_out_a_query_that_never_gets_an_answer() {
    let (_fake_server, fake_addr) = fake_nameserver().await;

    let config = ResolverConfig {
        nameservers: vec![fake_addr],
        timeout: Duration::from_millis(10),
        ..ResolverConfig::default()
    };
    let (mut resolver, _replies) = Resolver::new(config);

    let rx = resolver
        .resolve_and_wait(3, "never-answers.test", Command::Connect { port: 80 })
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;
    let timed_out = resolver.sweep();
    assert_eq!(timed_out.len(), 1);
    assert_eq!(timed_out[0].client_id, 3);
    assert!(matches!(timed_out[0].result, exaproxy::resolver::ResolveResult::Failed));

    let result = tokio::time::timeout(Duration::from_millis(100), rx)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, exaproxy::resolver::ResolveResult::Failed));
}

#[tokio::test]
async fn resolving_no_configured_nameservers_is_an_error() {
    let config = ResolverConfig::default();
    let (mut resolver, _replies) = Resolver::new(config);

    let outcome = resolver.resolve_and_wait(9, "example.test", Command::Download).await;
    assert!(outcome.is_err());
}
