//! A chat namespace driven over the in-memory transport.
//!
//! Two peers connect to `/chat`, join a room, and one of them broadcasts to it.

use std::time::Duration;

use nspmux::codec::Value;
use nspmux::transport::{pair, Frame, MemoryConfig, MemoryPeer};
use nspmux::Server;

async fn next_text(peer: &mut MemoryPeer) -> Option<String> {
    match tokio::time::timeout(Duration::from_secs(1), peer.recv()).await {
        Ok(Some(Frame::Text(text))) => Some(text),
        _ => None,
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let server = Server::default();
    server.of("/chat").on_connection(|socket| {
        println!("server: {} joined {}", socket.id(), socket.nsp().name());
        socket.on("join", |socket, args, ack| {
            for room in args.iter().filter_map(Value::as_str) {
                let _ = socket.join(room);
            }
            if let Some(ack) = ack {
                let _ = ack.send(vec![Value::from("joined")]);
            }
        });
        socket.on("say", |socket, args, _ack| {
            let _ = socket.to("lobby").emit("said", args);
        });
    });

    let (conn_a, mut alice) = pair(MemoryConfig::default());
    let (conn_b, mut bob) = pair(MemoryConfig::default());
    let _alice_handle = server.attach(conn_a);
    let _bob_handle = server.attach(conn_b);

    for (name, peer) in [("alice", &mut alice), ("bob", &mut bob)] {
        peer.send("0/chat,").await?;
        peer.send(r#"2/chat,1["join","lobby"]"#).await?;
        while let Some(text) = next_text(peer).await {
            println!("{name} <- {text}");
            if text.starts_with("3/chat,1") {
                break;
            }
        }
    }

    alice.send(r#"2/chat,["say","hello from alice"]"#).await?;
    if let Some(text) = next_text(&mut bob).await {
        println!("bob <- {text}");
    }

    server.close();
    Ok(())
}
