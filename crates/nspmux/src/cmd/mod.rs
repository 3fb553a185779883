use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Subcommand};

use crate::exit::{CliError, CliResult, INTERNAL, USAGE};
use crate::output::OutputFormat;

pub mod decode;
pub mod emit;
pub mod serve;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve echoing namespaces on a Unix domain socket.
    Serve(ServeArgs),
    /// Connect, emit one event, and print the replies.
    Emit(EmitArgs),
    /// Decode one packet text frame.
    Decode(DecodeArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Serve(args) => block_on(serve::run(args)),
        Command::Emit(args) => block_on(emit::run(args, format)),
        Command::Decode(args) => decode::run(args, format),
        Command::Version(args) => version::run(args, format),
    }
}

fn block_on<F>(future: F) -> CliResult<i32>
where
    F: Future<Output = CliResult<i32>>,
{
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| CliError::new(INTERNAL, format!("runtime setup failed: {err}")))?;
    runtime.block_on(future)
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Socket path to bind.
    pub path: PathBuf,
    /// Extra namespace to serve besides `/` (repeatable).
    #[arg(long, value_name = "NAME")]
    pub namespace: Vec<String>,
    /// Accept any namespace whose name matches this regex (repeatable).
    #[arg(long, value_name = "REGEX")]
    pub dynamic: Vec<String>,
    /// Require `?token=<T>` in every CONNECT query.
    #[arg(long, env = "NSPMUX_TOKEN")]
    pub token: Option<String>,
    /// Expire unanswered server acks after this long (e.g. 5s, 500ms).
    #[arg(long, value_name = "DURATION")]
    pub ack_timeout: Option<String>,
    /// Namespace connects buffered while `/` is being admitted.
    #[arg(long, default_value_t = nspmux_core::DEFAULT_MAX_CONNECT_BUFFER)]
    pub max_connect_buffer: usize,
}

#[derive(Args, Debug)]
pub struct EmitArgs {
    /// Socket path to connect to.
    pub path: PathBuf,
    /// Namespace to connect to; may carry a `?query`.
    #[arg(long, default_value = "/")]
    pub nsp: String,
    /// Event name.
    #[arg(long, short = 'e')]
    pub event: String,
    /// Event arguments: a JSON array, or a single JSON value.
    #[arg(long)]
    pub json: Option<String>,
    /// Request an acknowledgement and print it.
    #[arg(long)]
    pub ack: bool,
    /// Wait for one event on the namespace and print it.
    #[arg(long)]
    pub wait: bool,
    /// Upper bound for connecting and waiting (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub timeout: String,
}

#[derive(Args, Debug)]
pub struct DecodeArgs {
    /// Packet text frame, e.g. `2/chat,["hello"]`.
    pub text: String,
    /// UTF-8 content of a binary attachment (repeatable, in order).
    #[arg(long, value_name = "TEXT")]
    pub attachment: Vec<String>,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Also show build provenance and protocol limits.
    #[arg(long)]
    pub extended: bool,
}

pub(crate) fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, unit) = if let Some(num) = input.strip_suffix("ms") {
        (num, "ms")
    } else if let Some(num) = input.strip_suffix('s') {
        (num, "s")
    } else {
        (input, "s")
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;

    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    Ok(match unit {
        "ms" => Duration::from_millis(value),
        _ => Duration::from_secs(value),
    })
}
