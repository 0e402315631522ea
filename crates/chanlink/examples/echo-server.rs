//! Minimal echo service: every request comes back as a response, followed
//! by END-STREAM.
//!
//! Run with:
//!   cargo run --example echo-server
//!
//! In another terminal:
//!   cargo run --features cli -- send /tmp/chanlink-echo-<pid>/echo.sock \
//!     --channel framed-pipe --data hello

use std::fs;
use std::sync::Arc;
use std::thread;

use chanlink::{CallerIdentity, ChannelService, ServerSession, ServiceConfig};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let sock_dir = std::env::temp_dir().join(format!("chanlink-echo-{}", std::process::id()));
    fs::create_dir_all(&sock_dir)?;
    let sock_path = sock_dir.join("echo.sock");

    let service = ChannelService::bind(
        &sock_path,
        ServiceConfig::default(),
        |session: Arc<ServerSession>, caller: &CallerIdentity| {
            eprintln!(
                "Session {} ({}) from {}",
                session.id(),
                session.channel_type(),
                caller.sender
            );
            let messages = session.subscribe_to_messages();
            thread::spawn(move || {
                for payload in messages.flatten() {
                    session.send(&payload);
                    session.send_end_stream();
                }
            });
        },
    )?;
    eprintln!("Listening on {}", sock_path.display());

    service.run()?;
    let _ = fs::remove_dir_all(&sock_dir);
    Ok(())
}
