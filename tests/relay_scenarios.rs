//! End-to-end tests of `client::Connection` against a real loopback TCP
//! socket, driven by a mock classifier (the `Manager`'s oneshot rendezvous
//! answered directly, bypassing any real redirector subprocess) the way
//! `hyperium-hyper`'s own `tests/server.rs` drives a server loop from a
//! background thread and blocking client sockets.

use std::cell::RefCell;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream as StdTcpStream};
use std::rc::Rc;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use exaproxy::classifier::{self, Decision, Source};
use exaproxy::client::{Connection, Shared};
use exaproxy::config::{PoolConfig, ResolverConfig};
use exaproxy::listener::{AddrIncoming, AdmissionGate};
use exaproxy::resolver::Resolver;

fn pool_config() -> PoolConfig {
    // `low: 0` so `Manager::new` alone never spawns a real redirector
    // subprocess; these tests answer jobs directly via `route_reply`.
    PoolConfig {
        low: 0,
        high: 0,
        program: "/bin/true".to_owned(),
        args: Vec::new(),
    }
}

fn connect(addr: &SocketAddr) -> StdTcpStream {
    let stream = StdTcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(1))).unwrap();
    stream.set_write_timeout(Some(Duration::from_secs(1))).unwrap();
    stream
}

/// Waits, without sleeping on a guess, for the connection's job to actually
/// reach the classifier's queue before answering it.
async fn wait_for_queued(classifier: &Rc<RefCell<classifier::Manager>>) {
    tokio::time::timeout(Duration::from_secs(1), async {
        loop {
            if classifier.borrow().queue_len() > 0 {
                return;
            }
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("job never reached the classifier queue")
}

/// A classifier `response` decision renders straight to the client and
/// closes the connection — the bug this regression-tests is that the
/// generic `Relaying` handler never flushed anything, so the client used to
/// see the socket close with zero bytes written instead of the canned page.
#[test]
fn classifier_response_decision_reaches_the_client() {
    let (addr_tx, addr_rx) = mpsc::channel();

    let server = thread::Builder::new()
        .name("response-decision-server".to_owned())
        .spawn(move || {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            let local = tokio::task::LocalSet::new();
            local.block_on(&rt, async move {
                let gate = AdmissionGate::new(4);
                let mut incoming = AddrIncoming::bind(&"127.0.0.1:0".parse().unwrap(), 16).unwrap();
                addr_tx.send(incoming.local_addr()).unwrap();

                let stream = incoming.accept().await.unwrap();
                gate.admit();

                let (manager, _replies) = classifier::Manager::new(pool_config());
                let classifier = Rc::new(RefCell::new(manager));
                let (resolver, _resolver_replies) = Resolver::new(ResolverConfig::default());
                let resolver = Rc::new(RefCell::new(resolver));
                let shared = Shared {
                    classifier: classifier.clone(),
                    resolver,
                    gate,
                };
                let connection = Connection::new(0, stream, shared, Source::Proxy);
                let handle = tokio::task::spawn_local(connection.run());

                wait_for_queued(&classifier).await;
                classifier.borrow_mut().route_reply(
                    0,
                    Decision::Response {
                        client_id: "0".to_owned(),
                        code: "400".to_owned(),
                        title: "Bad Request".to_owned(),
                        body: "bad_request.html".to_owned(),
                    },
                );

                handle.await.unwrap();
            });
        })
        .unwrap();

    let addr = addr_rx.recv().unwrap();
    let mut client = connect(&addr);
    client
        .write_all(b"GET http://example.invalid/ HTTP/1.1\r\nHost: example.invalid\r\n\r\n")
        .unwrap();

    let mut response = Vec::new();
    client.read_to_end(&mut response).unwrap();
    let response = String::from_utf8(response).unwrap();

    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "got: {response}");
    assert!(response.contains("400 Bad Request"), "got: {response}");

    server.join().unwrap();
}

/// `CONNECT` bypasses the classifier entirely (it goes straight to DNS/
/// connect-upstream) and drives the full tunnel: the proxy opens a real TCP
/// connection to the "origin", writes the `200 Connection established`
/// response, then relays bytes verbatim in both directions. The CONNECT
/// target is a literal loopback IP so `Resolver::resolve_and_wait` resolves
/// it synchronously, with no fake nameserver needed.
#[test]
fn connect_tunnel_relays_bytes_both_ways() {
    // The "origin": a plain TCP echo server on its own real loopback port.
    let origin_listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let origin_addr = origin_listener.local_addr().unwrap();
    thread::spawn(move || {
        let (mut stream, _) = origin_listener.accept().unwrap();
        let mut buf = [0u8; 1024];
        loop {
            match stream.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if stream.write_all(&buf[..n]).is_err() {
                        break;
                    }
                }
            }
        }
    });

    let (addr_tx, addr_rx) = mpsc::channel();
    let server = thread::Builder::new()
        .name("connect-tunnel-server".to_owned())
        .spawn(move || {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            let local = tokio::task::LocalSet::new();
            local.block_on(&rt, async move {
                let gate = AdmissionGate::new(4);
                let mut incoming = AddrIncoming::bind(&"127.0.0.1:0".parse().unwrap(), 16).unwrap();
                addr_tx.send(incoming.local_addr()).unwrap();

                let stream = incoming.accept().await.unwrap();
                gate.admit();

                let (manager, _replies) = classifier::Manager::new(pool_config());
                let classifier = Rc::new(RefCell::new(manager));
                let (resolver, _resolver_replies) = Resolver::new(ResolverConfig::default());
                let resolver = Rc::new(RefCell::new(resolver));
                let shared = Shared {
                    classifier: classifier.clone(),
                    resolver,
                    gate,
                };
                let connection = Connection::new(0, stream, shared, Source::Proxy);
                let handle = tokio::task::spawn_local(connection.run());

                // No wait_for_queued/route_reply: CONNECT never reaches the
                // classifier, so there is nothing to answer here. The
                // connection drives itself straight from DNS to
                // ConnectingUpstream once the literal IP below resolves.
                handle.await.unwrap();
            });
        })
        .unwrap();

    let addr = addr_rx.recv().unwrap();
    let mut client = connect(&addr);
    let connect_line = format!(
        "CONNECT {}:{} HTTP/1.1\r\nHost: {}:{}\r\n\r\n",
        origin_addr.ip(),
        origin_addr.port(),
        origin_addr.ip(),
        origin_addr.port()
    );
    client.write_all(connect_line.as_bytes()).unwrap();

    let mut established = [0u8; 39];
    client.read_exact(&mut established).unwrap();
    assert_eq!(&established, b"HTTP/1.1 200 Connection established\r\n\r\n");

    client.write_all(b"ping through the tunnel").unwrap();
    let mut echoed = [0u8; "ping through the tunnel".len()];
    client.read_exact(&mut echoed).unwrap();
    assert_eq!(&echoed, b"ping through the tunnel");

    drop(client);
    server.join().unwrap();
}
