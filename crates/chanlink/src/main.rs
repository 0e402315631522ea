mod cmd;
mod exit;
mod logging;
mod output;

use clap::Parser;

use crate::cmd::Command;
use crate::logging::{init_logging, LogFormat, LogLevel};
use crate::output::OutputFormat;

#[derive(Parser, Debug)]
#[command(name = "chanlink", version, about = "Channel sessions with negotiated transports")]
struct Cli {
    /// Output format.
    #[arg(long, value_name = "FORMAT", global = true)]
    format: Option<OutputFormat>,

    /// Log output format (stderr).
    #[arg(long, value_name = "FORMAT", default_value = "text", global = true)]
    log_format: LogFormat,

    /// Minimum log level (stderr).
    #[arg(long, value_name = "LEVEL", default_value = "info", global = true)]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Command,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_format, cli.log_level);

    let format = cli.format.unwrap_or_else(OutputFormat::default_for_stdout);
    match cmd::run(cli.command, format) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(err.code);
        }
    }
}

#[cfg(test)]
mod tests {
    use chanlink_channel::ChannelType;

    use super::*;

    #[test]
    fn parses_send_subcommand() {
        let cli = Cli::try_parse_from([
            "chanlink",
            "send",
            "/tmp/test.sock",
            "--channel",
            "secure-socket",
            "--data",
            "hello",
        ])
        .expect("send args should parse");

        match cli.command {
            Command::Send(args) => {
                assert_eq!(args.channel, ChannelType::SecureSocket);
                assert_eq!(args.data, "hello");
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_channel_type() {
        let err = Cli::try_parse_from([
            "chanlink",
            "send",
            "/tmp/test.sock",
            "--channel",
            "carrier-pigeon",
            "--data",
            "x",
        ])
        .expect_err("unknown channel should fail");
        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);
    }

    #[test]
    fn parses_serve_subcommand() {
        let cli = Cli::try_parse_from([
            "chanlink",
            "serve",
            "/tmp/test.sock",
            "--end-stream",
            "--port-range",
            "7000-7010",
        ])
        .expect("serve args should parse");
        match cli.command {
            Command::Serve(args) => {
                assert!(args.end_stream);
                assert_eq!(args.port_range, "7000-7010");
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
