#![cfg(unix)]

use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use chanlink::{
    CallerIdentity, ChannelError, ChannelService, ChannelType, ClientConfig, ClientListener,
    ClientSession, RunningService, ServerSession, ServiceConfig, SessionId, SessionState,
    StreamEvent,
};

const WAIT: Duration = Duration::from_secs(5);

static NEXT_DIR: AtomicUsize = AtomicUsize::new(0);

fn unique_socket(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "chanlink-it-{tag}-{}-{}",
        std::process::id(),
        NEXT_DIR.fetch_add(1, Ordering::Relaxed)
    ));
    std::fs::create_dir_all(&dir).expect("temp dir should be creatable");
    dir.join("svc.sock")
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Seen {
    NewClient(SessionId, ChannelType),
    Disposed(SessionId),
    Closed(SessionId),
}

struct Recorder(Mutex<Sender<Seen>>);

impl ClientListener for Recorder {
    fn on_client_dispose(&self, session_id: &SessionId) {
        let _ = self.0.lock().unwrap().send(Seen::Disposed(session_id.clone()));
    }

    fn on_client_closed(&self, session_id: &SessionId) {
        let _ = self.0.lock().unwrap().send(Seen::Closed(session_id.clone()));
    }
}

/// Test service: `ping` gets `pong`, `end` ends the round, `fail` answers
/// with ERROR, anything else is echoed.
struct Harness {
    path: PathBuf,
    service: RunningService,
    seen: Receiver<Seen>,
}

impl Harness {
    fn start(tag: &str) -> Self {
        Self::start_with(tag, ServiceConfig::default())
    }

    fn start_with(tag: &str, config: ServiceConfig) -> Self {
        let path = unique_socket(tag);
        let (tx, seen) = mpsc::channel();
        let tx = Mutex::new(tx);
        let service = ChannelService::bind(
            &path,
            config,
            move |session: Arc<ServerSession>, _: &CallerIdentity| {
                let sender = tx.lock().unwrap().clone();
                let _ = sender.send(Seen::NewClient(session.id().clone(), session.channel_type()));
                session.add_listener(Arc::new(Recorder(Mutex::new(sender))));

                let messages = session.subscribe_to_messages();
                thread::spawn(move || {
                    for message in messages.flatten() {
                        match message.as_str() {
                            "ping" => session.send("pong"),
                            "end" => session.send_end_stream(),
                            "fail" => session.send_error("E_FAIL", "request failed"),
                            other => session.send(other),
                        };
                    }
                });
            },
        )
        .expect("service should bind");
        let service = service.spawn().expect("service should start");
        Self { path, service, seen }
    }

    fn client(&self, channel_type: ChannelType) -> ClientSession {
        ClientSession::new(ClientConfig::new(&self.path, channel_type).with_sender("it-client"))
    }

    fn next_seen(&self) -> Seen {
        self.seen.recv_timeout(WAIT).expect("expected a server event")
    }

    fn assert_quiet(&self) {
        if let Ok(event) = self.seen.recv_timeout(Duration::from_millis(200)) {
            panic!("unexpected server event {event:?}");
        }
    }
}

fn expect_message(stream: &mut chanlink::ResponseStream, expected: &str) {
    match stream.recv_timeout(WAIT) {
        Some(StreamEvent::Message(message)) => assert_eq!(message, expected),
        other => panic!("expected message {expected:?}, got {other:?}"),
    }
}

fn expect_completed(stream: &mut chanlink::ResponseStream) {
    match stream.recv_timeout(WAIT) {
        Some(StreamEvent::Completed) => {}
        other => panic!("expected completion, got {other:?}"),
    }
}

fn round_trip(channel_type: ChannelType, tag: &str) {
    let h = Harness::start(tag);
    let client = h.client(channel_type);

    client.connect().expect("connect should succeed");
    assert!(client.is_connected());
    assert_eq!(client.is_upgraded(), channel_type.is_upgraded());
    assert!(!client.has_fallen_back());
    let id = client.session_id().expect("session id after connect");

    let mut stream = client.send_message("ping");
    assert_eq!(h.next_seen(), Seen::NewClient(id.clone(), channel_type));
    expect_message(&mut stream, "pong");
    assert!(stream.try_recv().is_none(), "stream stays open after a response");
    assert_eq!(client.state(), SessionState::Streaming);

    let mut ending = client.send_message("end");
    expect_completed(&mut ending);
    expect_completed(&mut stream);
    assert_eq!(h.next_seen(), Seen::Closed(id.clone()));
    assert_eq!(client.state(), SessionState::Connected);

    // The same session id opens a fresh round, and a fresh server session.
    let mut next = client.send_message("again");
    assert_eq!(h.next_seen(), Seen::NewClient(id.clone(), channel_type));
    expect_message(&mut next, "again");
    assert_eq!(client.session_id(), Some(id.clone()));
    assert_eq!(client.is_upgraded(), channel_type.is_upgraded());

    client.close_connection();
    client.close_connection();
    expect_completed(&mut next);
    assert_eq!(client.state(), SessionState::Closed);
    assert_eq!(h.next_seen(), Seen::Disposed(id));
    h.assert_quiet();
}

#[test]
fn baseline_round_trip() {
    round_trip(ChannelType::Baseline, "baseline");
}

#[test]
fn framed_pipe_round_trip() {
    round_trip(ChannelType::FramedPipe, "pipe");
}

#[test]
fn secure_socket_round_trip() {
    round_trip(ChannelType::SecureSocket, "tls");
}

#[test]
fn payloads_survive_each_transport() {
    for (channel_type, tag) in [
        (ChannelType::Baseline, "payload-baseline"),
        (ChannelType::FramedPipe, "payload-pipe"),
        (ChannelType::SecureSocket, "payload-tls"),
    ] {
        let h = Harness::start(tag);
        let client = h.client(channel_type);
        let tricky = "line one\nline two\\n with backslash and ünïcødé";
        let mut stream = client.send_message(tricky);
        expect_message(&mut stream, tricky);
        let mut empty = client.send_message("");
        expect_message(&mut empty, "");
    }
}

#[test]
fn error_ends_the_session_without_listener_calls() {
    for (channel_type, tag) in [
        (ChannelType::Baseline, "error-baseline"),
        (ChannelType::SecureSocket, "error-tls"),
    ] {
        let h = Harness::start(tag);
        let client = h.client(channel_type);

        let mut stream = client.send_message("fail");
        let id = client.session_id().unwrap();
        assert_eq!(h.next_seen(), Seen::NewClient(id.clone(), channel_type));
        match stream.recv_timeout(WAIT) {
            Some(StreamEvent::Failed(err)) => match &*err {
                ChannelError::Application(error) => {
                    assert_eq!(error.code, "E_FAIL");
                    assert_eq!(error.description, "request failed");
                }
                other => panic!("expected application error, got {other:?}"),
            },
            other => panic!("expected failure, got {other:?}"),
        }
        assert!(client.session_id().is_none());
        assert_eq!(client.state(), SessionState::Unconnected);
        assert!(!client.is_upgraded());
        h.assert_quiet();

        // The next send binds a new session.
        let mut next = client.send_message("ping");
        let fresh = client.session_id().expect("a fresh session id");
        assert_ne!(fresh, id);
        assert_eq!(h.next_seen(), Seen::NewClient(fresh, channel_type));
        expect_message(&mut next, "pong");
    }
}

/// Greets every new server session over the baseline channel before the
/// client's first request is handled.
fn start_greeting_service(tag: &str) -> (PathBuf, RunningService) {
    let path = unique_socket(tag);
    let service = ChannelService::bind(
        &path,
        ServiceConfig::default(),
        |session: Arc<ServerSession>, _: &CallerIdentity| {
            session.send("welcome");
            let messages = session.subscribe_to_messages();
            thread::spawn(move || {
                for message in messages.flatten() {
                    match message.as_str() {
                        "end" => session.send_end_stream(),
                        _ => session.send("pong"),
                    };
                }
            });
        },
    )
    .expect("service should bind");
    (path, service.spawn().expect("service should start"))
}

#[test]
fn greeting_before_upgrade_reaches_the_round() {
    for (channel_type, tag) in [
        (ChannelType::FramedPipe, "greet-pipe"),
        (ChannelType::SecureSocket, "greet-tls"),
    ] {
        let (path, _service) = start_greeting_service(tag);
        let client = ClientSession::new(ClientConfig::new(&path, channel_type));

        // Nothing is subscribed while connecting, so this greeting is dropped.
        client.connect().expect("greeting must not break the upgrade");
        assert!(client.is_upgraded());
        assert!(!client.has_fallen_back());

        let mut stream = client.send_message("ping");
        expect_message(&mut stream, "pong");
        let mut ending = client.send_message("end");
        expect_completed(&mut ending);

        // The next round renegotiates; its greeting lands on the new stream.
        let mut next = client.send_message("ping");
        expect_message(&mut next, "welcome");
        expect_message(&mut next, "pong");
        assert!(client.is_upgraded());
        assert!(!client.has_fallen_back());
    }
}

#[test]
fn missing_service_is_reported_through_the_stream() {
    let path = unique_socket("missing");
    let client = ClientSession::new(ClientConfig::new(&path, ChannelType::SecureSocket));

    match client.send_message("ping").recv_timeout(WAIT) {
        Some(StreamEvent::Failed(err)) => {
            assert!(matches!(&*err, ChannelError::NoSuchService { path: p } if *p == path))
        }
        other => panic!("expected NoSuchService, got {other:?}"),
    }
    assert!(!client.is_connected());
    assert!(matches!(
        client.connect(),
        Err(ChannelError::NoSuchService { .. })
    ));
}

#[test]
fn untrusted_identity_is_fatal() {
    let h = Harness::start("untrusted");
    let client = ClientSession::new(
        ClientConfig::new(&h.path, ChannelType::SecureSocket).with_expected_identity("other.local"),
    );

    let err = client.connect().expect_err("identity mismatch must fail");
    assert!(err.is_protocol(), "unexpected error {err:?}");
    assert!(!client.has_fallen_back());
    assert_eq!(client.state(), SessionState::Unconnected);

    match client.send_message("ping").recv_timeout(WAIT) {
        Some(StreamEvent::Failed(err)) => assert!(err.is_protocol()),
        other => panic!("expected protocol failure, got {other:?}"),
    }
}

#[test]
fn declined_upgrade_falls_back_to_baseline() {
    let occupied = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = occupied.local_addr().unwrap().port();
    let mut config = ServiceConfig::default();
    config.secure_socket.port_range = port..=port;

    let h = Harness::start_with("declined", config);
    let client = h.client(ChannelType::SecureSocket);

    client.connect().expect("fallback is not an error");
    assert!(client.has_fallen_back());
    assert!(!client.is_upgraded());

    let mut stream = client.send_message("ping");
    expect_message(&mut stream, "pong");
    let mut ending = client.send_message("end");
    expect_completed(&mut ending);

    // Later rounds stay on the baseline channel.
    let mut next = client.send_message("ping");
    expect_message(&mut next, "pong");
    assert!(client.has_fallen_back());
}

#[test]
fn client_process_exit_disposes_session() {
    let h = Harness::start("drop");
    let client = h.client(ChannelType::FramedPipe);

    let mut stream = client.send_message("ping");
    expect_message(&mut stream, "pong");
    let id = client.session_id().unwrap();
    assert_eq!(h.next_seen(), Seen::NewClient(id.clone(), ChannelType::FramedPipe));

    drop(client);
    assert_eq!(h.next_seen(), Seen::Disposed(id));
    h.assert_quiet();
}

#[test]
fn service_stop_fails_open_rounds() {
    let h = Harness::start("stop");
    let client = h.client(ChannelType::Baseline);
    let mut stream = client.send_message("ping");
    expect_message(&mut stream, "pong");

    let Harness { service, .. } = h;
    service.stop().expect("service should stop");
    match stream.recv_timeout(WAIT) {
        Some(StreamEvent::Failed(_)) => {}
        other => panic!("expected failure after service stop, got {other:?}"),
    }
    assert_eq!(client.state(), SessionState::Unconnected);
    assert!(client.session_id().is_none());
}

#[test]
fn stop_when_idle_ends_service_after_last_session() {
    let config = ServiceConfig {
        stop_when_idle: true,
        ..ServiceConfig::default()
    };
    let h = Harness::start_with("idle", config);
    let client = h.client(ChannelType::Baseline);
    let mut stream = client.send_message("ping");
    expect_message(&mut stream, "pong");
    assert!(!h.service.is_finished());

    client.close_connection();
    let deadline = std::time::Instant::now() + WAIT;
    while !h.service.is_finished() {
        assert!(std::time::Instant::now() < deadline, "service did not stop");
        thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn sessions_are_independent() {
    let h = Harness::start("many");
    let clients: Vec<_> = (0..4)
        .map(|i| {
            let channel_type = match i % 3 {
                0 => ChannelType::Baseline,
                1 => ChannelType::FramedPipe,
                _ => ChannelType::SecureSocket,
            };
            h.client(channel_type)
        })
        .collect();

    let mut streams: Vec<_> = clients
        .iter()
        .enumerate()
        .map(|(i, client)| (i, client.send_message(&format!("client-{i}"))))
        .collect();
    for (i, stream) in &mut streams {
        expect_message(stream, &format!("client-{i}"));
    }

    let ids: std::collections::HashSet<_> =
        clients.iter().filter_map(ClientSession::session_id).collect();
    assert_eq!(ids.len(), clients.len());
    assert_eq!(h.service.registry().len(), clients.len());
}
