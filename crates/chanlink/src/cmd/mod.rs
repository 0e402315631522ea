use std::path::PathBuf;

use chanlink_channel::ChannelType;
use clap::{Args, Subcommand};

use crate::exit::CliResult;
use crate::output::OutputFormat;

pub mod send;
pub mod serve;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Host an echo service.
    Serve(ServeArgs),
    /// Open a client session, send one message and print the responses.
    Send(SendArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Serve(args) => serve::run(args),
        Command::Send(args) => send::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Socket path to bind.
    pub path: PathBuf,
    /// Follow every reply with END-STREAM.
    #[arg(long)]
    pub end_stream: bool,
    /// Exit once the last session is gone.
    #[arg(long, env = "CHANLINK_STOP_WHEN_IDLE")]
    pub stop_when_idle: bool,
    /// Identity in the secure socket certificate.
    #[arg(long, env = "CHANLINK_SERVER_IDENTITY", default_value = "chanlink.local")]
    pub identity: String,
    /// Ports scanned for secure socket listeners (e.g. 4001-5999).
    #[arg(long, env = "CHANLINK_PORT_RANGE", default_value = "4001-5999")]
    pub port_range: String,
}

#[derive(Args, Debug)]
pub struct SendArgs {
    /// Socket path of the service.
    pub path: PathBuf,
    /// Payload to send.
    #[arg(long)]
    pub data: String,
    /// Channel type to declare.
    #[arg(long, short = 'c', default_value = "baseline")]
    pub channel: ChannelType,
    /// Stop after N responses.
    #[arg(long)]
    pub count: Option<usize>,
    /// Give up waiting for the round to end (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub timeout: String,
    /// Identity the secure socket certificate must carry.
    #[arg(long)]
    pub expect_identity: Option<String>,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}
