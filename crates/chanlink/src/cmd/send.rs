use std::time::{Duration, Instant};

use chanlink_channel::{ClientConfig, ClientSession, SharedError, StreamEvent};
use tracing::debug;

use crate::cmd::SendArgs;
use crate::exit::{channel_error, CliError, CliResult, SUCCESS, TIMEOUT, USAGE};
use crate::output::{print_response, print_summary, OutputFormat, ResponseRecord, RoundSummary};

enum Outcome {
    Completed,
    CountReached,
    TimedOut,
    Failed(SharedError),
}

pub fn run(args: SendArgs, format: OutputFormat) -> CliResult<i32> {
    let timeout = parse_duration(&args.timeout)?;
    if args.count == Some(0) {
        return Err(CliError::new(USAGE, "--count must be greater than zero"));
    }

    let mut config = ClientConfig::new(&args.path, args.channel)
        .with_sender(format!("chanlink-cli-{}", std::process::id()));
    if let Some(identity) = args.expect_identity {
        config = config.with_expected_identity(identity);
    }
    let session = ClientSession::new(config);

    let mut stream = session.send_message(&args.data);
    let session_id = session.session_id();
    let deadline = Instant::now() + timeout;
    let mut responses = 0usize;

    let outcome = loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break Outcome::TimedOut;
        }
        match stream.recv_timeout(remaining) {
            Some(StreamEvent::Message(payload)) => {
                responses += 1;
                let record =
                    ResponseRecord::new(session_id.as_ref(), args.channel, responses, &payload);
                print_response(&record, format);
                if args.count.is_some_and(|count| responses >= count) {
                    break Outcome::CountReached;
                }
            }
            Some(StreamEvent::Completed) => break Outcome::Completed,
            Some(StreamEvent::Failed(err)) => break Outcome::Failed(err),
            None => break Outcome::TimedOut,
        }
    };

    let mut summary = RoundSummary {
        outcome: "completed",
        responses,
        upgraded: session.is_upgraded(),
        fell_back: session.has_fallen_back(),
        error: None,
    };
    session.close_connection();
    debug!(responses, "session closed");

    let result = match &outcome {
        Outcome::Completed => Ok(SUCCESS),
        Outcome::CountReached => {
            summary.outcome = "count_reached";
            Ok(SUCCESS)
        }
        Outcome::TimedOut => {
            summary.outcome = "timed_out";
            Err(CliError::new(
                TIMEOUT,
                format!("round still open after {}", args.timeout),
            ))
        }
        Outcome::Failed(err) => {
            summary.outcome = "failed";
            summary.error = Some(err.to_string());
            Err(channel_error("send failed", err))
        }
    };
    print_summary(&summary, format);
    result
}

fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, millis) = if let Some(num) = input.strip_suffix("ms") {
        (num, true)
    } else if let Some(num) = input.strip_suffix('s') {
        (num, false)
    } else {
        (input, false)
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;
    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    Ok(if millis {
        Duration::from_millis(value)
    } else {
        Duration::from_secs(value)
    })
}
