mod common;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use nspmux_codec::Value;
use nspmux_core::{AckError, Error, Server, ServerConfig, Socket};
use nspmux_transport::Frame;
use tokio::sync::mpsc;

use common::{connect, expect_silence, recv_frame, recv_text, recv_within};

/// Forward each admitted root socket to the test.
fn socket_channel(server: &Server) -> mpsc::UnboundedReceiver<Arc<Socket>> {
    let (tx, rx) = mpsc::unbounded_channel();
    server.sockets().on_connection(move |socket: &Arc<Socket>| {
        let _ = tx.send(Arc::clone(socket));
    });
    rx
}

#[tokio::test]
async fn handlers_observe_packets_in_arrival_order() {
    let server = Server::default();
    let (tx, mut rx) = mpsc::unbounded_channel();
    server.sockets().on_connection(move |socket| {
        let tx = tx.clone();
        socket.on("n", move |_socket, args, _ack| {
            let _ = tx.send(args.first().and_then(Value::as_u64));
        });
    });

    let (_handle, peer) = connect(&server).await;
    for i in 0..100 {
        peer.send(format!(r#"2["n",{i}]"#)).await.unwrap();
    }
    for i in 0..100u64 {
        assert_eq!(recv_within(&mut rx).await, Some(i));
    }
}

#[tokio::test]
async fn any_handler_sees_event_names() {
    let server = Server::default();
    let (tx, mut rx) = mpsc::unbounded_channel();
    server.sockets().on_connection(move |socket| {
        let tx = tx.clone();
        socket.on_any(move |_socket, event, args, _ack| {
            let _ = tx.send((event.to_string(), args.len()));
        });
    });

    let (_handle, peer) = connect(&server).await;
    peer.send(r#"2["first",1,2]"#).await.unwrap();
    peer.send(r#"2["second"]"#).await.unwrap();
    assert_eq!(recv_within(&mut rx).await, ("first".to_string(), 2));
    assert_eq!(recv_within(&mut rx).await, ("second".to_string(), 0));
}

#[tokio::test]
async fn reserved_events_are_not_dispatched_or_emitted() {
    let server = Server::default();
    let mut sockets = socket_channel(&server);
    let (_handle, mut peer) = connect(&server).await;
    let socket = recv_within(&mut sockets).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    socket.on_any(move |_socket, event, _args, _ack| {
        let _ = tx.send(event.to_string());
    });
    peer.send(r#"2["disconnect"]"#).await.unwrap();
    peer.send(r#"2["ok"]"#).await.unwrap();
    assert_eq!(recv_within(&mut rx).await, "ok");
    assert!(socket.connected());

    assert!(matches!(
        socket.emit("connect", Vec::new()),
        Err(Error::ReservedEvent(name)) if name == "connect"
    ));
    expect_silence(&mut peer).await;
}

#[tokio::test]
async fn client_requested_ack_is_sent_once() {
    let server = Server::default();
    server.sockets().on_connection(|socket| {
        socket.on("echo", |_socket, args, ack| {
            let ack = ack.expect("event carried an ack id");
            ack.clone().send(args.clone()).unwrap();
            ack.send(vec![Value::from("late")]).unwrap();
        });
    });

    let (_handle, mut peer) = connect(&server).await;
    peer.send(r#"27["echo",5,"x"]"#).await.unwrap();
    assert_eq!(recv_text(&mut peer).await, r#"37[5,"x"]"#);
    expect_silence(&mut peer).await;
}

#[tokio::test]
async fn server_ack_callback_runs_exactly_once() {
    let server = Server::default();
    let mut sockets = socket_channel(&server);
    let (_handle, mut peer) = connect(&server).await;
    let socket = recv_within(&mut sockets).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let id = socket
        .emit_with_callback("ping", vec![Value::from(1)], move |args| {
            let _ = tx.send(args);
        })
        .unwrap();
    assert_eq!(id, 0);
    assert_eq!(recv_text(&mut peer).await, r#"20["ping",1]"#);
    assert_eq!(socket.pending_acks(), 1);

    peer.send(r#"30["pong",2]"#).await.unwrap();
    assert_eq!(
        recv_within(&mut rx).await,
        vec![Value::from("pong"), Value::from(2)]
    );

    // Duplicate and unknown ids are ignored.
    peer.send(r#"30["again"]"#).await.unwrap();
    peer.send("399[]").await.unwrap();
    peer.send(r#"2["still-here"]"#).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err());
    assert_eq!(socket.pending_acks(), 0);
    assert!(socket.connected());
    assert!(!peer.is_closed());
}

#[tokio::test]
async fn ack_ids_increase_per_socket() {
    let server = Server::default();
    let mut sockets = socket_channel(&server);
    let (_handle, mut peer) = connect(&server).await;
    let socket = recv_within(&mut sockets).await;

    let _first = socket.emit_with_ack("a", Vec::new()).unwrap();
    let _second = socket.emit_with_ack("b", Vec::new()).unwrap();
    assert_eq!(recv_text(&mut peer).await, r#"20["a"]"#);
    assert_eq!(recv_text(&mut peer).await, r#"21["b"]"#);
}

#[tokio::test]
async fn awaited_ack_resolves_with_reply() {
    let server = Server::default();
    let mut sockets = socket_channel(&server);
    let (_handle, mut peer) = connect(&server).await;
    let socket = recv_within(&mut sockets).await;

    let reply = socket.emit_with_ack("question", Vec::new()).unwrap();
    assert_eq!(recv_text(&mut peer).await, r#"20["question"]"#);
    peer.send("30[42]").await.unwrap();
    assert_eq!(reply.await.unwrap(), vec![Value::from(42)]);
}

#[tokio::test]
async fn awaited_ack_times_out_when_configured() {
    let server = Server::new(ServerConfig {
        ack_timeout: Some(Duration::from_millis(50)),
        ..ServerConfig::default()
    });
    let mut sockets = socket_channel(&server);
    let (_handle, mut peer) = connect(&server).await;
    let socket = recv_within(&mut sockets).await;

    let reply = socket.emit_with_ack("question", Vec::new()).unwrap();
    assert_eq!(recv_text(&mut peer).await, r#"20["question"]"#);
    assert_eq!(
        reply.await,
        Err(AckError::Timeout(Duration::from_millis(50)))
    );
    assert_eq!(socket.pending_acks(), 0);

    // A reply after expiry is an unknown id.
    peer.send("30[1]").await.unwrap();
    expect_silence(&mut peer).await;
    assert!(socket.connected());
}

#[tokio::test]
async fn awaited_ack_fails_on_disconnect() {
    let server = Server::default();
    let mut sockets = socket_channel(&server);
    let (_handle, mut peer) = connect(&server).await;
    let socket = recv_within(&mut sockets).await;

    let reply = socket.emit_with_ack("question", Vec::new()).unwrap();
    assert_eq!(recv_text(&mut peer).await, r#"20["question"]"#);
    peer.close("client gone").await;
    assert_eq!(reply.await, Err(AckError::Disconnected));
}

#[tokio::test]
async fn volatile_emit_is_dropped_while_congested() {
    let server = Server::default();
    server.sockets().on_connection(|socket| {
        socket.on("go", |socket, _args, _ack| {
            socket.volatile().emit("tick", vec![Value::from(1)]).unwrap();
            socket.emit("tick", vec![Value::from(2)]).unwrap();
        });
    });

    let (_handle, mut peer) = connect(&server).await;
    peer.set_congested(true);
    peer.send(r#"2["go"]"#).await.unwrap();
    assert_eq!(recv_text(&mut peer).await, r#"2["tick",2]"#);
    expect_silence(&mut peer).await;

    // Broadcasts honor the flag too.
    server.sockets().volatile().emit("tick", vec![Value::from(3)]).unwrap();
    expect_silence(&mut peer).await;

    peer.set_congested(false);
    server.sockets().volatile().emit("tick", vec![Value::from(4)]).unwrap();
    assert_eq!(recv_text(&mut peer).await, r#"2["tick",4]"#);
}

#[tokio::test]
async fn binary_event_is_reassembled_before_dispatch() {
    let server = Server::default();
    let (tx, mut rx) = mpsc::unbounded_channel();
    server.sockets().on_connection(move |socket| {
        let tx = tx.clone();
        socket.on("upload", move |_socket, args, _ack| {
            let _ = tx.send(args);
        });
    });

    let (_handle, peer) = connect(&server).await;
    peer.send(r#"52-["upload",{"_placeholder":true,"num":0},{"name":"a","data":{"_placeholder":true,"num":1}}]"#)
        .await
        .unwrap();
    peer.send(Bytes::from_static(b"one")).await.unwrap();
    peer.send(Bytes::from_static(b"two")).await.unwrap();

    let args = recv_within(&mut rx).await;
    assert_eq!(args[0], Value::Binary(Bytes::from_static(b"one")));
    assert_eq!(args[1].get("name"), Some(&Value::from("a")));
    assert_eq!(
        args[1].get("data"),
        Some(&Value::Binary(Bytes::from_static(b"two")))
    );
}

#[tokio::test]
async fn binary_emit_writes_attachments_after_packet() {
    let server = Server::default();
    let mut sockets = socket_channel(&server);
    let (_handle, mut peer) = connect(&server).await;
    let socket = recv_within(&mut sockets).await;

    socket
        .emit("blob", vec![Value::from(vec![1u8, 2, 3])])
        .unwrap();
    assert_eq!(
        recv_text(&mut peer).await,
        r#"51-["blob",{"_placeholder":true,"num":0}]"#
    );
    assert_eq!(
        recv_frame(&mut peer).await,
        Frame::Binary(Bytes::from_static(&[1, 2, 3]))
    );
}

#[tokio::test]
async fn send_and_write_emit_message() {
    let server = Server::default();
    let mut sockets = socket_channel(&server);
    let (_handle, mut peer) = connect(&server).await;
    let socket = recv_within(&mut sockets).await;

    socket.send(vec![Value::from("a")]).unwrap();
    socket.write(vec![Value::from("b")]).unwrap();
    assert_eq!(recv_text(&mut peer).await, r#"2["message","a"]"#);
    assert_eq!(recv_text(&mut peer).await, r#"2["message","b"]"#);
}

#[tokio::test]
async fn remote_error_packet_reaches_error_handlers() {
    let server = Server::default();
    let mut sockets = socket_channel(&server);
    let (_handle, peer) = connect(&server).await;
    let socket = recv_within(&mut sockets).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    socket.on_error(move |_socket, err| {
        let _ = tx.send(err.to_string());
    });
    peer.send(r#"4"bad things""#).await.unwrap();
    assert!(recv_within(&mut rx).await.contains("bad things"));
    assert!(socket.connected());
}
