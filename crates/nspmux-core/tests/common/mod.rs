#![allow(dead_code)]

use std::time::Duration;

use nspmux_core::{ClientHandle, Server};
use nspmux_transport::{pair, Frame, MemoryConfig, MemoryPeer};

pub const WAIT: Duration = Duration::from_secs(2);

/// Attach an in-memory connection and consume the `/` CONNECT reply.
pub async fn connect(server: &Server) -> (ClientHandle, MemoryPeer) {
    let (handle, mut peer) = attach(server);
    assert_eq!(recv_text(&mut peer).await, "0");
    (handle, peer)
}

/// Attach an in-memory connection without reading anything.
pub fn attach(server: &Server) -> (ClientHandle, MemoryPeer) {
    let (conn, peer) = pair(MemoryConfig::default());
    (server.attach(conn), peer)
}

pub async fn recv_frame(peer: &mut MemoryPeer) -> Frame {
    match tokio::time::timeout(WAIT, peer.recv()).await {
        Ok(Some(frame)) => frame,
        other => panic!("expected a frame, got {other:?}"),
    }
}

pub async fn recv_text(peer: &mut MemoryPeer) -> String {
    match recv_frame(peer).await {
        Frame::Text(text) => text,
        other => panic!("expected a text frame, got {other:?}"),
    }
}

/// Assert nothing else arrives for a short while.
pub async fn expect_silence(peer: &mut MemoryPeer) {
    if let Ok(frame) = tokio::time::timeout(Duration::from_millis(100), peer.recv()).await {
        panic!("expected silence, got {frame:?}");
    }
}

pub async fn recv_within<T>(rx: &mut tokio::sync::mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("value should arrive in time")
        .expect("sender should still be alive")
}

/// Poll `check` until it holds or the wait budget runs out.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
