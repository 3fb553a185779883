use std::io::IsTerminal;

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use nspmux_codec::{Packet, Value};
use serde::Serialize;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

#[derive(Serialize)]
struct PacketOutput<'a> {
    #[serde(rename = "type")]
    packet_type: &'static str,
    nsp: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    event: Option<&'a str>,
    data: Vec<serde_json::Value>,
    attachments: usize,
}

impl<'a> PacketOutput<'a> {
    fn new(packet: &'a Packet) -> Self {
        let event = packet.event_name();
        let data = if event.is_some() {
            packet.event_args()
        } else {
            &packet.data
        };
        Self {
            packet_type: packet.packet_type.name(),
            nsp: &packet.nsp,
            id: packet.id,
            event,
            data: data.iter().map(display_value).collect(),
            attachments: packet.data.iter().map(count_binary).sum(),
        }
    }
}

pub fn print_packet(packet: &Packet, format: OutputFormat) {
    let out = PacketOutput::new(packet);
    match format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string(&out).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["TYPE", "NSP", "ID", "EVENT", "DATA"])
                .add_row(vec![
                    out.packet_type.to_string(),
                    out.nsp.to_string(),
                    out.id.map(|id| id.to_string()).unwrap_or_default(),
                    out.event.unwrap_or_default().to_string(),
                    data_preview(&out.data),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            let mut line = format!("{} nsp={}", out.packet_type, out.nsp);
            if let Some(id) = out.id {
                line.push_str(&format!(" id={id}"));
            }
            if let Some(event) = out.event {
                line.push_str(&format!(" event={event}"));
            }
            line.push_str(&format!(" data={}", data_preview(&out.data)));
            println!("{line}");
        }
    }
}

fn data_preview(data: &[serde_json::Value]) -> String {
    serde_json::to_string(data).unwrap_or_else(|_| "[]".to_string())
}

/// JSON view of a payload value; binary blobs render as a size marker.
pub fn display_value(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Number(n) => serde_json::Value::Number(n.clone()),
        Value::String(s) => serde_json::Value::String(s.clone()),
        Value::Binary(bytes) => serde_json::Value::String(format!("<binary {} bytes>", bytes.len())),
        Value::Array(items) => serde_json::Value::Array(items.iter().map(display_value).collect()),
        Value::Object(map) => serde_json::Value::Object(
            map.iter()
                .map(|(key, value)| (key.clone(), display_value(value)))
                .collect(),
        ),
    }
}

fn count_binary(value: &Value) -> usize {
    match value {
        Value::Binary(_) => 1,
        Value::Array(items) => items.iter().map(count_binary).sum(),
        Value::Object(map) => map.values().map(count_binary).sum(),
        _ => 0,
    }
}
