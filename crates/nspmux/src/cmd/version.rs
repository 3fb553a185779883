use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use nspmux_codec::{DEFAULT_MAX_ATTACHMENTS, DEFAULT_MAX_FRAME_SIZE};
use nspmux_core::DEFAULT_MAX_CONNECT_BUFFER;
use serde::Serialize;

use crate::cmd::VersionArgs;
use crate::exit::{CliResult, SUCCESS};
use crate::output::OutputFormat;

#[derive(Debug, Serialize)]
struct BuildInfo {
    name: &'static str,
    version: &'static str,
    target: String,
    profile: &'static str,
    rustc: &'static str,
    git_hash: &'static str,
    transports: Vec<&'static str>,
    wire_magic: String,
    max_frame_size: usize,
    max_attachments: usize,
    max_connect_buffer: usize,
}

impl BuildInfo {
    fn collect() -> Self {
        let mut transports = vec!["memory"];
        if cfg!(unix) {
            transports.push("uds");
        }
        Self {
            name: env!("CARGO_PKG_NAME"),
            version: env!("CARGO_PKG_VERSION"),
            target: target_triple(),
            profile: option_env!("NSPMUX_BUILD_PROFILE").unwrap_or("unknown"),
            rustc: option_env!("RUSTC_VERSION").unwrap_or("unknown"),
            git_hash: option_env!("GIT_HASH").unwrap_or("unknown"),
            transports,
            wire_magic: String::from_utf8_lossy(&nspmux_transport::wire::MAGIC).into_owned(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_attachments: DEFAULT_MAX_ATTACHMENTS,
            max_connect_buffer: DEFAULT_MAX_CONNECT_BUFFER,
        }
    }

    fn rows(&self) -> Vec<(&'static str, String)> {
        vec![
            ("name", self.name.to_string()),
            ("version", self.version.to_string()),
            ("target", self.target.clone()),
            ("profile", self.profile.to_string()),
            ("rustc", self.rustc.to_string()),
            ("git_hash", self.git_hash.to_string()),
            ("transports", self.transports.join(", ")),
            ("wire_magic", self.wire_magic.clone()),
            ("max_frame_size", self.max_frame_size.to_string()),
            ("max_attachments", self.max_attachments.to_string()),
            ("max_connect_buffer", self.max_connect_buffer.to_string()),
        ]
    }
}

pub fn run(args: VersionArgs, format: OutputFormat) -> CliResult<i32> {
    if !args.extended {
        println!("nspmux {}", env!("CARGO_PKG_VERSION"));
        return Ok(SUCCESS);
    }

    let info = BuildInfo::collect();
    match format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string(&info).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["FIELD", "VALUE"]);
            for (field, value) in info.rows() {
                table.add_row(vec![field.to_string(), value]);
            }
            println!("{table}");
        }
        OutputFormat::Pretty => {
            for (field, value) in info.rows() {
                println!("{field}: {value}");
            }
        }
    }
    Ok(SUCCESS)
}

fn target_triple() -> String {
    if let Some(target) = option_env!("NSPMUX_BUILD_TARGET") {
        return target.to_string();
    }
    format!("{}-{}", std::env::consts::ARCH, std::env::consts::OS)
}
