use nspmux_codec::{Packet, PacketType, Value, ROOT_NSP};

use crate::cmd::EmitArgs;
use crate::exit::{CliError, CliResult, USAGE};
use crate::output::OutputFormat;

/// Ack id used for the single event this command sends.
const ACK_ID: u64 = 0;

pub async fn run(args: EmitArgs, format: OutputFormat) -> CliResult<i32> {
    let timeout = super::parse_duration(&args.timeout)?;
    let payload = parse_payload(args.json.as_deref())?;
    if nspmux_core::RESERVED_EVENTS.contains(&args.event.as_str()) {
        return Err(CliError::new(
            USAGE,
            format!("\"{}\" is a reserved event name", args.event),
        ));
    }
    let (connect_nsp, nsp) = split_nsp(&args.nsp);
    session::run(&args, connect_nsp, nsp, payload, timeout, format).await
}

/// Split `--nsp` into the CONNECT form (with query) and the bare name.
fn split_nsp(raw: &str) -> (String, String) {
    let raw = if raw.starts_with('/') {
        raw.to_string()
    } else {
        format!("/{raw}")
    };
    let name = match raw.split_once('?') {
        Some((name, _)) => name.to_string(),
        None => raw.clone(),
    };
    let name = if name.is_empty() { ROOT_NSP.to_string() } else { name };
    (raw, name)
}

fn parse_payload(json: Option<&str>) -> CliResult<Vec<Value>> {
    let Some(json) = json else {
        return Ok(Vec::new());
    };
    let value: serde_json::Value = serde_json::from_str(json)
        .map_err(|err| CliError::new(USAGE, format!("--json is not valid JSON: {err}")))?;
    Ok(match value {
        serde_json::Value::Array(items) => items.into_iter().map(Value::from).collect(),
        other => vec![Value::from(other)],
    })
}

/// What the reply loop is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Expect {
    ack: bool,
    event: bool,
}

impl Expect {
    fn done(self) -> bool {
        !self.ack && !self.event
    }

    /// Update after `packet` arrived on `nsp`; returns true when it should be printed.
    fn observe(&mut self, packet: &Packet, nsp: &str) -> bool {
        if packet.nsp != nsp {
            return false;
        }
        match packet.packet_type {
            PacketType::Ack | PacketType::BinaryAck if packet.id == Some(ACK_ID) => {
                self.ack = false;
                true
            }
            PacketType::Event | PacketType::BinaryEvent => {
                self.event = false;
                true
            }
            PacketType::Error => true,
            _ => false,
        }
    }
}

#[cfg(unix)]
mod session {
    use std::sync::Arc;
    use std::time::Duration;

    use nspmux_codec::{encode_packet, Decoded, Decoder, Packet, PacketType, Value, ROOT_NSP};
    use nspmux_transport::{
        connect, Connection, EventReceiver, Transport, TransportEvent, WriteOptions,
    };
    use tokio::time::Instant;
    use tracing::debug;

    use super::{Expect, ACK_ID};
    use crate::cmd::EmitArgs;
    use crate::exit::{
        protocol_error, transport_error, CliError, CliResult, FAILURE, SUCCESS, TIMEOUT,
    };
    use crate::output::{display_value, print_packet, OutputFormat};

    struct Session {
        transport: Arc<dyn Transport>,
        events: EventReceiver,
        decoder: Decoder,
        deadline: Instant,
    }

    pub(super) async fn run(
        args: &EmitArgs,
        connect_nsp: String,
        nsp: String,
        payload: Vec<Value>,
        timeout: Duration,
        format: OutputFormat,
    ) -> CliResult<i32> {
        let Connection { transport, events } = connect(&args.path)
            .await
            .map_err(|err| transport_error("connect failed", err))?;
        let mut session = Session {
            transport,
            events,
            decoder: Decoder::new(),
            deadline: Instant::now() + timeout,
        };

        // The server connects `/` as soon as the transport is attached.
        session.await_connect(ROOT_NSP).await?;
        if nsp != ROOT_NSP {
            session.send(&Packet::connect(connect_nsp))?;
            session.await_connect(&nsp).await?;
        }

        let mut event = Packet::event(nsp.as_str(), &args.event, payload);
        if args.ack {
            event = event.with_id(ACK_ID);
        }
        session.send(&event)?;
        debug!(nsp = %nsp, event = %args.event, ack = args.ack, "event sent");

        let mut expect = Expect {
            ack: args.ack,
            event: args.wait,
        };
        while !expect.done() {
            let packet = session.next_packet().await?;
            if expect.observe(&packet, &nsp) {
                print_packet(&packet, format);
            }
        }

        session.transport.close();
        Ok(SUCCESS)
    }

    impl Session {
        fn send(&self, packet: &Packet) -> CliResult<()> {
            let frames = encode_packet(packet).map_err(|err| protocol_error("encode failed", err))?;
            for frame in frames {
                self.transport
                    .write(frame, WriteOptions::default())
                    .map_err(|err| transport_error("send failed", err))?;
            }
            Ok(())
        }

        async fn await_connect(&mut self, nsp: &str) -> CliResult<()> {
            loop {
                let packet = self.next_packet().await?;
                if packet.nsp != nsp {
                    continue;
                }
                match packet.packet_type {
                    PacketType::Connect => return Ok(()),
                    PacketType::Error => {
                        let reason = packet
                            .data
                            .first()
                            .map(display_value)
                            .unwrap_or_default();
                        return Err(CliError::new(
                            FAILURE,
                            format!("connect to {nsp} rejected: {reason}"),
                        ));
                    }
                    _ => continue,
                }
            }
        }

        async fn next_packet(&mut self) -> CliResult<Packet> {
            loop {
                let event = tokio::time::timeout_at(self.deadline, self.events.recv())
                    .await
                    .map_err(|_| CliError::new(TIMEOUT, "timed out waiting for the server"))?;
                match event {
                    Some(TransportEvent::Data(frame)) => {
                        match self
                            .decoder
                            .decode(frame)
                            .map_err(|err| protocol_error("decode failed", err))?
                        {
                            Decoded::Packet(packet) => return Ok(packet),
                            Decoded::Pending { .. } => continue,
                        }
                    }
                    Some(TransportEvent::Error(err)) => {
                        return Err(transport_error("receive failed", err));
                    }
                    Some(TransportEvent::Close(reason)) => {
                        return Err(CliError::new(
                            FAILURE,
                            format!("connection closed: {reason}"),
                        ));
                    }
                    None => return Err(CliError::new(FAILURE, "connection closed")),
                }
            }
        }
    }
}

#[cfg(not(unix))]
mod session {
    use std::time::Duration;

    use nspmux_codec::Value;

    use crate::cmd::EmitArgs;
    use crate::exit::{CliError, CliResult, USAGE};
    use crate::output::OutputFormat;

    pub(super) async fn run(
        _args: &EmitArgs,
        _connect_nsp: String,
        _nsp: String,
        _payload: Vec<Value>,
        _timeout: Duration,
        _format: OutputFormat,
    ) -> CliResult<i32> {
        Err(CliError::new(
            USAGE,
            "emit needs Unix domain sockets, which this platform lacks",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nsp_query_is_kept_for_connect_only() {
        assert_eq!(
            split_nsp("/chat?token=x"),
            ("/chat?token=x".to_string(), "/chat".to_string())
        );
        assert_eq!(split_nsp("chat"), ("/chat".to_string(), "/chat".to_string()));
        assert_eq!(split_nsp("/"), ("/".to_string(), "/".to_string()));
    }

    #[test]
    fn payload_accepts_array_or_single_value() {
        assert_eq!(
            parse_payload(Some(r#"[1,"a"]"#)).unwrap(),
            vec![Value::from(1), Value::from("a")]
        );
        assert_eq!(
            parse_payload(Some(r#"{"k":true}"#)).unwrap(),
            vec![Value::from(serde_json::json!({"k": true}))]
        );
        assert!(parse_payload(None).unwrap().is_empty());
        assert_eq!(parse_payload(Some("{")).unwrap_err().code, USAGE);
    }

    #[test]
    fn expect_tracks_ack_and_event() {
        let mut expect = Expect {
            ack: true,
            event: true,
        };
        let other_nsp = Packet::event("/other", "x", Vec::new());
        assert!(!expect.observe(&other_nsp, "/chat"));

        let wrong_ack = Packet::ack("/chat", 9, Vec::new());
        assert!(!expect.observe(&wrong_ack, "/chat"));
        assert!(expect.ack);

        let ack = Packet::ack("/chat", ACK_ID, vec![Value::from(1)]);
        assert!(expect.observe(&ack, "/chat"));
        assert!(!expect.done());

        let event = Packet::event("/chat", "hello", Vec::new());
        assert!(expect.observe(&event, "/chat"));
        assert!(expect.done());
    }
}
