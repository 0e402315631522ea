use std::ops::RangeInclusive;
use std::sync::Arc;
use std::thread;

use chanlink_channel::{
    CallerIdentity, ChannelService, ClientListener, ServerSession, ServiceConfig, ServiceHandle,
    SessionId,
};
use tracing::{debug, info};

use crate::cmd::ServeArgs;
use crate::exit::{owned_channel_error, CliError, CliResult, INTERNAL, SUCCESS, USAGE};

pub fn run(args: ServeArgs) -> CliResult<i32> {
    let mut config = ServiceConfig {
        server_identity: args.identity.clone(),
        stop_when_idle: args.stop_when_idle,
        ..ServiceConfig::default()
    };
    config.secure_socket.port_range = parse_port_range(&args.port_range)?;

    let end_stream = args.end_stream;
    let service = ChannelService::bind(
        &args.path,
        config,
        move |session: Arc<ServerSession>, caller: &CallerIdentity| {
            info!(
                session = %session.id(),
                channel = %session.channel_type(),
                sender = %caller.sender,
                pid = ?caller.pid,
                "client admitted"
            );
            session.add_listener(Arc::new(LogListener));
            spawn_echo(session, end_stream);
        },
    )
    .map_err(|err| owned_channel_error("bind failed", err))?;

    install_ctrlc_handler(service.handle())?;
    info!(path = %args.path.display(), identity = %args.identity, "serving");

    service
        .run()
        .map_err(|err| owned_channel_error("service failed", err))?;
    Ok(SUCCESS)
}

fn spawn_echo(session: Arc<ServerSession>, end_stream: bool) {
    let messages = session.subscribe_to_messages();
    let name = format!("chanlink-echo-{}", session.id());
    let spawned = thread::Builder::new().name(name).spawn(move || {
        for message in messages {
            let Ok(payload) = message else { break };
            debug!(session = %session.id(), size = payload.len(), "echoing");
            if !session.send(&payload) {
                break;
            }
            if end_stream {
                session.send_end_stream();
                break;
            }
        }
    });
    if let Err(err) = spawned {
        tracing::warn!(error = %err, "echo worker did not start");
    }
}

struct LogListener;

impl ClientListener for LogListener {
    fn on_client_dispose(&self, session_id: &SessionId) {
        info!(session = %session_id, "client disposed");
    }

    fn on_client_closed(&self, session_id: &SessionId) {
        info!(session = %session_id, "client closed by service");
    }
}

fn install_ctrlc_handler(handle: ServiceHandle) -> CliResult<()> {
    ctrlc::set_handler(move || handle.shutdown())
        .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))
}

fn parse_port_range(input: &str) -> CliResult<RangeInclusive<u16>> {
    let invalid = || CliError::new(USAGE, format!("invalid port range: {input}"));
    let (start, end) = input.trim().split_once('-').ok_or_else(invalid)?;
    let start: u16 = start.trim().parse().map_err(|_| invalid())?;
    let end: u16 = end.trim().parse().map_err(|_| invalid())?;
    if start == 0 || start > end {
        return Err(invalid());
    }
    Ok(start..=end)
}
