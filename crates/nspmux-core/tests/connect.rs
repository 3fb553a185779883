mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use nspmux_core::{
    AdmissionError, Matcher, Query, Server, ServerConfig, Socket, MIDDLEWARE_FAILED,
};
use serde_json::json;
use tokio::sync::{mpsc, Notify};

use common::{attach, connect, eventually, expect_silence, recv_text, recv_within};

#[tokio::test]
async fn root_namespace_connects_on_attach() {
    let server = Server::default();
    let (handle, _peer) = connect(&server).await;

    assert_eq!(server.clients_count(), 1);
    let root = server.sockets();
    assert_eq!(root.len(), 1);
    let socket = root.socket(handle.id()).expect("root socket should be registered");
    assert!(socket.connected());
    assert!(socket.rooms().contains(handle.id()));
}

#[tokio::test]
async fn namespace_connect_uses_prefixed_id_and_query() {
    let server = Server::default();
    let (tx, mut rx) = mpsc::unbounded_channel();
    server.of("/chat").on_connection(move |socket: &Arc<Socket>| {
        let _ = tx.send((
            socket.id().to_string(),
            socket.handshake().query_param("token").map(str::to_string),
        ));
    });

    let (handle, mut peer) = connect(&server).await;
    peer.send("0/chat?token=abc,").await.unwrap();
    assert_eq!(recv_text(&mut peer).await, "0/chat,");

    let (sid, token) = recv_within(&mut rx).await;
    assert_eq!(sid, format!("/chat#{}", handle.id()));
    assert_eq!(token.as_deref(), Some("abc"));
}

#[tokio::test]
async fn non_root_connect_waits_for_root_admission() {
    let server = Server::default();
    let gate = Arc::new(Notify::new());
    let root_gate = Arc::clone(&gate);
    server.sockets().use_middleware(move |_socket| {
        let gate = Arc::clone(&root_gate);
        async move {
            gate.notified().await;
            Ok(())
        }
    });
    let chat = server.of("/chat");

    let (_handle, mut peer) = attach(&server);
    peer.send("0/chat,").await.unwrap();
    expect_silence(&mut peer).await;
    assert!(chat.is_empty());

    gate.notify_one();
    assert_eq!(recv_text(&mut peer).await, "0");
    assert_eq!(recv_text(&mut peer).await, "0/chat,");
    eventually(|| chat.len() == 1).await;
}

#[tokio::test]
async fn buffered_connects_replay_in_arrival_order() {
    let server = Server::default();
    let gate = Arc::new(Notify::new());
    let root_gate = Arc::clone(&gate);
    server.sockets().use_middleware(move |_socket| {
        let gate = Arc::clone(&root_gate);
        async move {
            gate.notified().await;
            Ok(())
        }
    });
    server.of("/a");
    server.of("/b");

    let (_handle, mut peer) = attach(&server);
    peer.send("0/b,").await.unwrap();
    peer.send("0/a,").await.unwrap();
    expect_silence(&mut peer).await;

    gate.notify_one();
    assert_eq!(recv_text(&mut peer).await, "0");
    assert_eq!(recv_text(&mut peer).await, "0/b,");
    assert_eq!(recv_text(&mut peer).await, "0/a,");
}

#[tokio::test]
async fn connect_buffer_overflow_is_namespace_scoped() {
    let config = ServerConfig {
        max_connect_buffer: 1,
        ..ServerConfig::default()
    };
    let server = Server::new(config);
    server
        .sockets()
        .use_middleware(|_socket| std::future::pending::<Result<(), AdmissionError>>());
    server.of("/a");
    server.of("/b");

    let (_handle, mut peer) = attach(&server);
    peer.send("0/a,").await.unwrap();
    peer.send("0/b,").await.unwrap();
    assert_eq!(recv_text(&mut peer).await, r#"4/b,"Connect buffer full""#);
    assert!(!peer.is_closed());
}

#[tokio::test]
async fn unknown_namespace_gets_error_and_connection_survives() {
    let server = Server::default();
    let (_handle, mut peer) = connect(&server).await;

    peer.send("0/nope,").await.unwrap();
    assert_eq!(recv_text(&mut peer).await, r#"4/nope,"Invalid namespace""#);
    assert!(!peer.is_closed());
    assert!(server.namespace("/nope").is_none());
}

#[tokio::test]
async fn middleware_error_rejects_without_registering() {
    let server = Server::default();
    let chat = server.of("/chat");
    let third_ran = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&third_ran);

    chat.use_middleware(|_socket| async { Ok(()) })
        .use_middleware(|_socket| async { Err(AdmissionError::new("boom")) })
        .use_middleware(move |_socket| {
            flag.store(true, Ordering::SeqCst);
            async { Ok(()) }
        });

    let (_handle, mut peer) = connect(&server).await;
    peer.send("0/chat,").await.unwrap();
    assert_eq!(recv_text(&mut peer).await, r#"4/chat,"boom""#);
    assert!(chat.is_empty());
    assert!(!third_ran.load(Ordering::SeqCst));
    assert!(!peer.is_closed());
}

#[tokio::test]
async fn middleware_error_data_is_sent_instead_of_message() {
    let server = Server::default();
    server.of("/admin").use_middleware(|_socket| async {
        Err(AdmissionError::new("denied").with_data(json!({"code": 3})))
    });

    let (_handle, mut peer) = connect(&server).await;
    peer.send("0/admin,").await.unwrap();
    assert_eq!(recv_text(&mut peer).await, r#"4/admin,{"code":3}"#);
}

#[tokio::test]
async fn panicking_middleware_rejects_and_allows_retry() {
    let server = Server::default();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let chat = server.of("/chat");
    chat.use_middleware(move |_socket| {
        let first = counter.fetch_add(1, Ordering::SeqCst) == 0;
        async move {
            if first {
                panic!("middleware bug");
            }
            Ok(())
        }
    });

    let (_handle, mut peer) = connect(&server).await;
    peer.send("0/chat,").await.unwrap();
    assert_eq!(
        recv_text(&mut peer).await,
        format!("4/chat,\"{MIDDLEWARE_FAILED}\"")
    );
    assert!(chat.is_empty());
    assert!(!peer.is_closed());

    peer.send("0/chat,").await.unwrap();
    assert_eq!(recv_text(&mut peer).await, "0/chat,");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    eventually(|| chat.len() == 1).await;
}

#[tokio::test]
async fn middleware_sees_handshake_query() {
    let server = Server::default();
    server.of("/secure").use_middleware(|socket| async move {
        match socket.handshake().query_param("token") {
            Some("letmein") => Ok(()),
            _ => Err(AdmissionError::new("Not authorized")),
        }
    });

    let (_handle, mut peer) = connect(&server).await;
    peer.send("0/secure?token=wrong,").await.unwrap();
    assert_eq!(recv_text(&mut peer).await, r#"4/secure,"Not authorized""#);
    peer.send("0/secure?token=letmein,").await.unwrap();
    assert_eq!(recv_text(&mut peer).await, "0/secure,");
}

#[tokio::test]
async fn admission_after_close_discards_socket() {
    let server = Server::default();
    let gate = Arc::new(Notify::new());
    let root_gate = Arc::clone(&gate);
    let connections = Arc::new(AtomicBool::new(false));
    let seen = Arc::clone(&connections);
    let root = server.sockets();
    root.use_middleware(move |_socket| {
        let gate = Arc::clone(&root_gate);
        async move {
            gate.notified().await;
            Ok(())
        }
    });
    root.on_connection(move |_socket| seen.store(true, Ordering::SeqCst));

    let (handle, peer) = attach(&server);
    peer.close("client gone").await;
    gate.notify_one();
    handle.closed().await;

    assert!(root.is_empty());
    assert!(!connections.load(Ordering::SeqCst));
    assert_eq!(server.clients_count(), 0);
}

#[tokio::test]
async fn dynamic_namespaces_are_created_on_demand() {
    let server = Server::default();
    let parent = server.of_dynamic(Matcher::regex(r"^/dyn-\d+$").unwrap());
    let (tx, mut rx) = mpsc::unbounded_channel();
    parent.on_connection(move |socket| {
        let _ = tx.send(socket.nsp().name().to_string());
    });

    let (_handle, mut peer) = connect(&server).await;
    peer.send("0/dyn-7,").await.unwrap();
    assert_eq!(recv_text(&mut peer).await, "0/dyn-7,");
    assert_eq!(recv_within(&mut rx).await, "/dyn-7");
    assert_eq!(parent.children().len(), 1);
    assert!(server.namespace("/dyn-7").is_some());

    peer.send("0/dyn-x,").await.unwrap();
    assert_eq!(recv_text(&mut peer).await, r#"4/dyn-x,"Invalid namespace""#);
}

#[tokio::test]
async fn dynamic_predicate_sees_connect_query() {
    let server = Server::default();
    server.of_dynamic(Matcher::predicate(|name: String, query: Query| async move {
        name.starts_with("/team-") && query.get("key").map(String::as_str) == Some("k")
    }));

    let (_handle, mut peer) = connect(&server).await;
    peer.send("0/team-1?key=k,").await.unwrap();
    assert_eq!(recv_text(&mut peer).await, "0/team-1,");
    peer.send("0/team-2,").await.unwrap();
    assert_eq!(recv_text(&mut peer).await, r#"4/team-2,"Invalid namespace""#);
}

#[tokio::test]
async fn duplicate_connect_is_ignored() {
    let server = Server::default();
    server.of("/chat");
    let (_handle, mut peer) = connect(&server).await;

    peer.send("0").await.unwrap();
    peer.send("0/chat,").await.unwrap();
    assert_eq!(recv_text(&mut peer).await, "0/chat,");
    peer.send("0/chat,").await.unwrap();
    expect_silence(&mut peer).await;
    assert_eq!(server.of("/chat").len(), 1);
}
