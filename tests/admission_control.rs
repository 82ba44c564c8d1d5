//! The admission invariant (spec.md's admission-ceiling rule): the
//! listeners stop being polled the instant live clients reach the
//! ceiling, and resume the instant a slot frees up. Exercised against
//! [`AdmissionGate`] directly, plus a real loopback socket to confirm a
//! connection queued in the kernel backlog while the gate is closed is
//! still sitting there, untouched, once it reopens.

use std::net::TcpStream as StdTcpStream;
use std::time::Duration;

use exaproxy::listener::{AddrIncoming, AdmissionGate};

/// Waits on `incoming.accept()` only while `gate.is_open()`, the same
/// gating [`Listener::accept`] applies — reproduced here directly so the
/// test can observe a single listener's address without needing one added
/// to the real `Listener` type just for this.
async fn gated_accept(incoming: &mut AddrIncoming, gate: &AdmissionGate) -> std::io::Result<()> {
    if !gate.is_open() {
        std::future::pending::<()>().await;
        unreachable!();
    }
    incoming.accept().await.map(|_| ())
}

#[tokio::test]
async fn gate_closes_at_ceiling_and_reopens_on_release() {
    let gate = AdmissionGate::new(1);
    let mut incoming = AddrIncoming::bind(&"127.0.0.1:0".parse().unwrap(), 16).unwrap();
    let addr = incoming.local_addr();

    assert!(gate.admit());
    assert!(!gate.is_open());

    // Queued in the kernel backlog while the gate is closed; the listener
    // must not accept it yet.
    let _pending_client = StdTcpStream::connect(addr).unwrap();

    let timed_out = tokio::time::timeout(Duration::from_millis(200), gated_accept(&mut incoming, &gate)).await;
    assert!(timed_out.is_err(), "accepted a connection while the gate was closed");

    assert!(gate.release());
    assert!(gate.is_open());

    tokio::time::timeout(Duration::from_millis(500), gated_accept(&mut incoming, &gate))
        .await
        .expect("did not resume accepting once the gate reopened")
        .unwrap();
}
