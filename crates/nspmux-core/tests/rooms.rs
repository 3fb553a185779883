mod common;

use std::collections::HashSet;
use std::sync::Arc;

use nspmux_codec::Value;
use nspmux_core::{AdmissionError, Error, Server, Socket, SocketState};
use tokio::sync::mpsc;

use common::{connect, eventually, expect_silence, recv_text, recv_within};

fn socket_channel(server: &Server, nsp: &str) -> mpsc::UnboundedReceiver<Arc<Socket>> {
    let (tx, rx) = mpsc::unbounded_channel();
    server.of(nsp).on_connection(move |socket: &Arc<Socket>| {
        let _ = tx.send(Arc::clone(socket));
    });
    rx
}

fn set(items: &[&str]) -> HashSet<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[tokio::test]
async fn join_and_leave_are_idempotent() {
    let server = Server::default();
    let mut sockets = socket_channel(&server, "/");
    let (_handle, _peer) = connect(&server).await;
    let socket = recv_within(&mut sockets).await;
    let sid = socket.id().to_string();

    socket.join("a").unwrap();
    socket.join("a").unwrap();
    socket.join_all(["b", "c"]).unwrap();
    assert_eq!(socket.rooms(), set(&[sid.as_str(), "a", "b", "c"]));

    socket.leave("a").unwrap();
    socket.leave("a").unwrap();
    socket.leave("never-joined").unwrap();
    assert_eq!(socket.rooms(), set(&[sid.as_str(), "b", "c"]));

    socket.leave_all().unwrap();
    assert!(socket.rooms().is_empty());
}

#[tokio::test]
async fn disconnecting_handlers_still_see_rooms() {
    let server = Server::default();
    let (tx, mut rx) = mpsc::unbounded_channel();
    server.sockets().on_connection(move |socket| {
        socket.join_all(["a", "b"]).unwrap();
        let before = tx.clone();
        socket.on_disconnecting(move |socket, reason| {
            let _ = before.send(("disconnecting", reason.to_string(), socket.rooms()));
        });
        let after = tx.clone();
        socket.on_disconnect(move |socket, reason| {
            let _ = after.send(("disconnect", reason.to_string(), socket.rooms()));
        });
    });

    let (handle, peer) = connect(&server).await;
    let sid = handle.id().to_string();
    peer.send("1").await.unwrap();

    let (stage, reason, rooms) = recv_within(&mut rx).await;
    assert_eq!(stage, "disconnecting");
    assert_eq!(reason, "client namespace disconnect");
    assert_eq!(rooms, set(&[sid.as_str(), "a", "b"]));

    let (stage, reason, rooms) = recv_within(&mut rx).await;
    assert_eq!(stage, "disconnect");
    assert_eq!(reason, "client namespace disconnect");
    assert!(rooms.is_empty());

    let root = server.sockets();
    assert!(root.is_empty());
    assert!(root.adapter().sockets(&HashSet::new()).is_empty());
}

#[tokio::test]
async fn room_broadcast_reaches_only_members() {
    let server = Server::default();
    let mut sockets = socket_channel(&server, "/");
    let (_h1, mut member) = connect(&server).await;
    let first = recv_within(&mut sockets).await;
    let (_h2, mut outsider) = connect(&server).await;
    let _second = recv_within(&mut sockets).await;

    first.join("room").unwrap();
    server
        .sockets()
        .to("room")
        .emit("news", vec![Value::from("hi")])
        .unwrap();

    assert_eq!(recv_text(&mut member).await, r#"2["news","hi"]"#);
    expect_silence(&mut outsider).await;
}

#[tokio::test]
async fn socket_broadcast_skips_sender() {
    let server = Server::default();
    let mut sockets = socket_channel(&server, "/");
    let (_h1, mut sender_peer) = connect(&server).await;
    let sender = recv_within(&mut sockets).await;
    let (_h2, mut other_peer) = connect(&server).await;
    let other = recv_within(&mut sockets).await;

    sender.join("room").unwrap();
    other.join("room").unwrap();

    sender.to("room").emit("shout", Vec::new()).unwrap();
    assert_eq!(recv_text(&mut other_peer).await, r#"2["shout"]"#);
    expect_silence(&mut sender_peer).await;

    sender.broadcast().emit("all", Vec::new()).unwrap();
    assert_eq!(recv_text(&mut other_peer).await, r#"2["all"]"#);
    expect_silence(&mut sender_peer).await;
}

#[tokio::test]
async fn multi_room_broadcast_delivers_once() {
    let server = Server::default();
    let mut sockets = socket_channel(&server, "/");
    let (_handle, mut peer) = connect(&server).await;
    let socket = recv_within(&mut sockets).await;
    socket.join_all(["a", "b"]).unwrap();

    server
        .sockets()
        .to("a")
        .to("b")
        .emit("once", Vec::new())
        .unwrap();
    assert_eq!(recv_text(&mut peer).await, r#"2["once"]"#);
    expect_silence(&mut peer).await;
}

#[tokio::test]
async fn except_excludes_room_members() {
    let server = Server::default();
    let mut sockets = socket_channel(&server, "/");
    let (_h1, mut muted_peer) = connect(&server).await;
    let muted = recv_within(&mut sockets).await;
    let (_h2, mut heard_peer) = connect(&server).await;
    let _heard = recv_within(&mut sockets).await;

    muted.join("muted").unwrap();
    server.sockets().except("muted").emit("ping", Vec::new()).unwrap();
    assert_eq!(recv_text(&mut heard_peer).await, r#"2["ping"]"#);
    expect_silence(&mut muted_peer).await;
}

#[tokio::test]
async fn broadcasts_stay_within_their_namespace() {
    let server = Server::default();
    let mut chat_sockets = socket_channel(&server, "/chat");
    let (_h1, mut chat_peer) = connect(&server).await;
    chat_peer.send("0/chat,").await.unwrap();
    assert_eq!(recv_text(&mut chat_peer).await, "0/chat,");
    let chat_socket = recv_within(&mut chat_sockets).await;
    let (_h2, mut root_peer) = connect(&server).await;

    chat_socket.join("lobby").unwrap();
    server.of("/chat").emit("hello", Vec::new()).unwrap();
    assert_eq!(recv_text(&mut chat_peer).await, r#"2/chat,["hello"]"#);
    expect_silence(&mut root_peer).await;

    let clients = server.of("/chat").in_("lobby").clients();
    assert_eq!(clients, vec![chat_socket.id().to_string()]);
}

#[tokio::test]
async fn sockets_are_listed_per_namespace() {
    let server = Server::default();
    let (h1, _p1) = connect(&server).await;
    let (h2, _p2) = connect(&server).await;

    let root = server.sockets();
    eventually(|| root.len() == 2).await;
    let mut expected = vec![h1.id().to_string(), h2.id().to_string()];
    expected.sort();
    assert_eq!(root.clients(), expected);
    assert!(root.socket(h1.id()).is_some());
    assert!(root.socket("missing").is_none());
}

#[tokio::test]
async fn rejected_socket_leaves_rooms_joined_by_middleware() {
    let server = Server::default();
    let chat = server.of("/chat");
    chat.use_middleware(|socket| async move {
        socket.join("lobby").map_err(|err| AdmissionError::new(err.to_string()))?;
        Err(AdmissionError::new("no"))
    });

    let (_handle, mut peer) = connect(&server).await;
    peer.send("0/chat,").await.unwrap();
    assert_eq!(recv_text(&mut peer).await, r#"4/chat,"no""#);

    assert!(chat.is_empty());
    assert!(chat.clients().is_empty());
    assert!(chat.in_("lobby").clients().is_empty());
}

#[tokio::test]
async fn join_after_disconnect_is_refused() {
    let server = Server::default();
    let mut sockets = socket_channel(&server, "/chat");
    let (_handle, mut peer) = connect(&server).await;
    peer.send("0/chat,").await.unwrap();
    assert_eq!(recv_text(&mut peer).await, "0/chat,");
    let socket = recv_within(&mut sockets).await;

    peer.send("1/chat,").await.unwrap();
    eventually(|| socket.state() == SocketState::Disconnected).await;

    assert!(matches!(socket.join("late"), Err(Error::Disconnected(_))));
    assert!(socket.rooms().is_empty());
    assert!(server.of("/chat").clients().is_empty());
}
