use std::sync::Arc;

use nspmux_codec::Value;
use nspmux_core::{AdmissionError, Matcher, Server, ServerConfig, Socket};
use tracing::{debug, info, warn};

use crate::cmd::{parse_duration, ServeArgs};
use crate::exit::{CliError, CliResult, SUCCESS, USAGE};

pub async fn run(args: ServeArgs) -> CliResult<i32> {
    let server = build_server(&args)?;
    listen(server, &args).await
}

fn build_server(args: &ServeArgs) -> CliResult<Server> {
    let mut config = ServerConfig {
        max_connect_buffer: args.max_connect_buffer,
        ..ServerConfig::default()
    };
    if let Some(raw) = &args.ack_timeout {
        config.ack_timeout = Some(parse_duration(raw)?);
    }
    let server = Server::new(config);

    // `/` is connected implicitly on attach, so it stays open.
    server.sockets().on_connection(on_connection);
    for name in &args.namespace {
        let nsp = server.of(name);
        if let Some(token) = &args.token {
            nsp.use_middleware(token_gate(token.clone()));
        }
        nsp.on_connection(on_connection);
    }

    for pattern in &args.dynamic {
        let matcher = Matcher::regex(pattern).map_err(|err| {
            CliError::new(USAGE, format!("invalid --dynamic pattern {pattern:?}: {err}"))
        })?;
        let parent = server.of_dynamic(matcher);
        if let Some(token) = &args.token {
            parent.use_middleware(token_gate(token.clone()));
        }
        parent.on_connection(on_connection);
    }

    Ok(server)
}

#[cfg(unix)]
async fn listen(server: Server, args: &ServeArgs) -> CliResult<i32> {
    use nspmux_transport::UdsListener;

    use crate::exit::transport_error;

    let listener =
        UdsListener::bind(&args.path).map_err(|err| transport_error("bind failed", err))?;
    info!(path = %args.path.display(), namespaces = ?server.namespace_names(), "serving");

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(connection) => {
                    let handle = server.attach(connection);
                    info!(client = %handle.id(), "client attached");
                }
                Err(err) => {
                    server.close();
                    return Err(transport_error("accept failed", err));
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!(clients = server.clients_count(), "shutting down");
                break;
            }
        }
    }

    server.close();
    Ok(SUCCESS)
}

#[cfg(not(unix))]
async fn listen(_server: Server, _args: &ServeArgs) -> CliResult<i32> {
    Err(CliError::new(
        USAGE,
        "serve needs Unix domain sockets, which this platform lacks",
    ))
}

/// Admit only sockets whose CONNECT query carries `token`.
fn token_gate(
    token: String,
) -> impl Fn(Arc<Socket>) -> std::future::Ready<Result<(), AdmissionError>> + Send + Sync + 'static
{
    move |socket: Arc<Socket>| {
        let result = match socket.handshake().query_param("token") {
            Some(given) if given == token => Ok(()),
            Some(_) => Err(AdmissionError::new("invalid token")),
            None => Err(AdmissionError::new("missing token")),
        };
        std::future::ready(result)
    }
}

fn on_connection(socket: &Arc<Socket>) {
    info!(
        sid = %socket.id(),
        nsp = %socket.nsp().name(),
        address = %socket.handshake().address,
        "socket connected"
    );

    socket.on_any(|socket, event, args, ack| {
        let outcome = match event {
            "join" => socket.join_all(room_names(&args)),
            "leave" => room_names(&args)
                .into_iter()
                .try_for_each(|room| socket.leave(&room)),
            "shout" => shout(socket, args.clone()),
            _ => socket.emit(event, args.clone()),
        };
        if let Err(err) = outcome {
            warn!(sid = %socket.id(), event, error = %err, "handling event failed");
        }
        if let Some(ack) = ack {
            if let Err(err) = ack.send(args) {
                debug!(sid = %socket.id(), error = %err, "ack not sent");
            }
        }
    });

    socket.on_error(|socket, err| {
        warn!(sid = %socket.id(), error = %err, "socket error");
    });
    socket.on_disconnect(|socket, reason| {
        info!(sid = %socket.id(), reason, "socket disconnected");
    });
}

/// Rebroadcast to every room the sender joined, excluding the sender.
fn shout(socket: &Arc<Socket>, args: Vec<Value>) -> nspmux_core::Result<()> {
    let rooms: Vec<String> = socket
        .rooms()
        .into_iter()
        .filter(|room| room != socket.id())
        .collect();
    if rooms.is_empty() {
        debug!(sid = %socket.id(), "shout from a socket outside any room");
        return Ok(());
    }
    let mut operator = socket.broadcast();
    for room in rooms {
        operator = operator.to(room);
    }
    operator.emit("shout", args)
}

fn room_names(args: &[Value]) -> Vec<String> {
    args.iter()
        .flat_map(|arg| match arg {
            Value::Array(items) => items.iter().filter_map(Value::as_str).collect::<Vec<_>>(),
            other => other.as_str().into_iter().collect(),
        })
        .map(str::to_string)
        .collect()
}
