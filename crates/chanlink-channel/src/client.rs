//! Client side of a channel session.
//!
//! A [`ClientSession`] binds one session id over the baseline channel and,
//! for non-baseline channel types, negotiates an upgraded transport before
//! the first request. Each `send_message` belongs to the current round;
//! the round ends with END-STREAM (or the close sentinel over the upgraded
//! transport) or a local close. An ERROR ends the whole session.

use std::os::fd::OwnedFd;
use std::path::PathBuf;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chanlink_transport::IpcStream;
use tracing::{debug, info, trace, warn};

use crate::baseline::{BaselineConnection, BaselineEvents};
use crate::error::{ChannelError, Result};
use crate::handshake::HandshakeConfig;
use crate::link::{DisconnectReason, TransportEvents, UpgradedLink};
use crate::pipe::FramedPipe;
use crate::protocol::{ChannelType, Envelope, Message, SessionId, UpgradeOffer, UPGRADE_REQUEST};
use crate::secure::{SecureSocket, SecureSocketConfig};
use crate::stream::{ResponseStream, StreamHub};

/// Default bound on connecting and binding.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(2000);

/// Default bound on waiting for an upgrade offer.
pub const DEFAULT_UPGRADE_TIMEOUT: Duration = Duration::from_secs(5);

/// Client session configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Path of the service socket.
    pub address: PathBuf,
    pub channel_type: ChannelType,
    /// Name announced to the service.
    pub sender: String,
    pub connect_timeout: Duration,
    pub upgrade_timeout: Duration,
    /// Certificate identity required from a secure socket peer. Defaults
    /// to the identity the service announced when binding.
    pub expected_identity: Option<String>,
    pub handshake: HandshakeConfig,
    pub secure_socket: SecureSocketConfig,
}

impl ClientConfig {
    pub fn new(address: impl Into<PathBuf>, channel_type: ChannelType) -> Self {
        Self {
            address: address.into(),
            channel_type,
            sender: format!("chanlink-client-{}", std::process::id()),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            upgrade_timeout: DEFAULT_UPGRADE_TIMEOUT,
            expected_identity: None,
            handshake: HandshakeConfig::default(),
            secure_socket: SecureSocketConfig::default(),
        }
    }

    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = sender.into();
        self
    }

    pub fn with_expected_identity(mut self, identity: impl Into<String>) -> Self {
        self.expected_identity = Some(identity.into());
        self
    }
}

/// Where a client session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unconnected,
    Connecting,
    Connected,
    Streaming,
    AwaitingUpgrade,
    Closed,
}

enum UpgradeReply {
    Offer(UpgradeOffer, Option<OwnedFd>),
    Failed(ChannelError),
}

struct ClientState {
    phase: SessionState,
    session_id: Option<SessionId>,
    /// Bumped whenever the baseline connection is replaced or dropped;
    /// callbacks from an older generation are ignored.
    generation: u64,
    baseline: Option<Arc<BaselineConnection>>,
    link: Option<(u64, UpgradedLink)>,
    link_serial: u64,
    fallback: bool,
    round: Option<StreamHub>,
    pending_upgrade: Option<mpsc::Sender<UpgradeReply>>,
}

struct ClientInner {
    config: ClientConfig,
    ops: Mutex<()>,
    state: Mutex<ClientState>,
}

/// One client conversation with a channel service.
pub struct ClientSession {
    inner: Arc<ClientInner>,
}

impl ClientSession {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                config,
                ops: Mutex::new(()),
                state: Mutex::new(ClientState {
                    phase: SessionState::Unconnected,
                    session_id: None,
                    generation: 0,
                    baseline: None,
                    link: None,
                    link_serial: 0,
                    fallback: false,
                    round: None,
                    pending_upgrade: None,
                }),
            }),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Bind the baseline channel and, for upgraded channel types, negotiate
    /// the second transport. Idempotent.
    ///
    /// A failed upgrade leaves the session on the baseline channel unless
    /// the failure is a protocol error, which is returned.
    pub fn connect(&self) -> Result<()> {
        let _op = lock(&self.inner.ops);
        self.inner.ensure_ready().inspect_err(|err| {
            if err.is_protocol() {
                warn!(error = %err, "upgrade violated protocol; resetting session");
                self.inner.reset(SessionState::Unconnected, None);
            }
        })
    }

    pub fn is_connected(&self) -> bool {
        self.inner.state().is_connected()
    }

    pub fn state(&self) -> SessionState {
        self.inner.state().phase
    }

    /// Identifier of the current session, if bound.
    pub fn session_id(&self) -> Option<SessionId> {
        self.inner.state().session_id.clone()
    }

    /// Whether requests currently travel over an upgraded transport.
    pub fn is_upgraded(&self) -> bool {
        self.inner
            .state()
            .link
            .as_ref()
            .is_some_and(|(_, link)| link.is_connected())
    }

    /// Whether an upgrade failed and the session stays on the baseline.
    pub fn has_fallen_back(&self) -> bool {
        self.inner.state().fallback
    }

    /// Send `payload` in the current round, connecting first if needed.
    ///
    /// The returned stream also sees responses the service sends while this
    /// call is still connecting. Every failure, including a missing service,
    /// is delivered through the stream.
    pub fn send_message(&self, payload: &str) -> ResponseStream {
        let inner = &self.inner;
        let _op = lock(&inner.ops);
        let stream = inner.state().round.get_or_insert_with(StreamHub::new).subscribe();
        if let Err(err) = inner.ensure_ready() {
            if err.is_protocol() {
                warn!(error = %err, "upgrade violated protocol; resetting session");
                inner.reset(SessionState::Unconnected, Some(err));
            } else {
                inner.state().end_round(Some(err));
            }
            return stream;
        }

        let (link, baseline) = {
            let mut st = inner.state();
            let Some(baseline) = st.baseline.clone() else {
                st.end_round(Some(ChannelError::Closed));
                return stream;
            };
            st.phase = SessionState::Streaming;
            let link = st
                .link
                .as_ref()
                .filter(|(_, link)| link.is_connected())
                .map(|(_, link)| link.clone());
            (link, baseline)
        };

        let sent = match link {
            Some(link) if link.send(payload) => Ok(()),
            Some(_) => {
                debug!("upgraded send failed; using baseline channel");
                baseline.send_request(payload)
            }
            None => baseline.send_request(payload),
        };
        if let Err(err) = sent {
            warn!(error = %err, "request not sent");
            inner.state().end_round(Some(err));
        }
        stream
    }

    /// Tear the session down. Idempotent.
    ///
    /// Sends the close sentinel over an upgraded transport, unbinds the
    /// baseline channel, completes the in-flight stream and forgets the
    /// session id. A later `send_message` starts a new session.
    pub fn close_connection(&self) {
        if self.inner.reset(SessionState::Closed, None) {
            info!("client session closed");
        }
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        self.inner.reset(SessionState::Closed, None);
    }
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.inner.state();
        f.debug_struct("ClientSession")
            .field("address", &self.inner.config.address)
            .field("channel_type", &self.inner.config.channel_type)
            .field("state", &st.phase)
            .field("session_id", &st.session_id)
            .finish()
    }
}

impl ClientState {
    fn is_connected(&self) -> bool {
        self.baseline.is_some()
            && matches!(
                self.phase,
                SessionState::Connected | SessionState::Streaming | SessionState::AwaitingUpgrade
            )
    }

    fn end_round(&mut self, error: Option<ChannelError>) {
        if let Some(mut round) = self.round.take() {
            match error {
                Some(err) => round.fail(err),
                None => round.complete(),
            }
        }
        if self.phase == SessionState::Streaming {
            self.phase = SessionState::Connected;
        }
    }

    fn settle_phase(&mut self) {
        self.phase = if self.round.is_some() {
            SessionState::Streaming
        } else {
            SessionState::Connected
        };
    }

    /// Forget the session: a later send binds a fresh id. The round fails
    /// with `error`, or completes without one. Returns the transports for
    /// the caller to close outside the lock.
    fn evict(
        &mut self,
        phase: SessionState,
        error: Option<ChannelError>,
    ) -> (Option<Arc<BaselineConnection>>, Option<UpgradedLink>) {
        self.generation += 1;
        self.session_id = None;
        self.fallback = false;
        self.pending_upgrade = None;
        self.end_round(error);
        self.phase = phase;
        (self.baseline.take(), self.link.take().map(|(_, link)| link))
    }
}

impl ClientInner {
    fn state(&self) -> MutexGuard<'_, ClientState> {
        lock(&self.state)
    }

    /// Protocol errors are returned without resetting; the caller resets.
    fn ensure_ready(self: &Arc<Self>) -> Result<()> {
        if !self.state().is_connected() {
            self.open_baseline()?;
        }
        if !self.config.channel_type.is_upgraded() {
            return Ok(());
        }
        self.ensure_upgraded()
    }

    fn open_baseline(self: &Arc<Self>) -> Result<()> {
        let (session_id, generation) = {
            let mut st = self.state();
            st.generation += 1;
            st.phase = SessionState::Connecting;
            st.fallback = false;
            let session_id = SessionId::generate();
            st.session_id = Some(session_id.clone());
            (session_id, st.generation)
        };

        let handshake = HandshakeConfig {
            timeout: self.config.connect_timeout,
            ..self.config.handshake.clone()
        };
        let events = Arc::new(BaselineListener {
            client: Arc::downgrade(self),
            generation,
        });
        let opened = BaselineConnection::open(
            &self.config.address,
            &session_id,
            self.config.channel_type,
            &self.config.sender,
            &handshake,
            events,
        );

        let mut st = self.state();
        if st.generation != generation {
            if let Ok(conn) = opened {
                conn.close();
            }
            return Err(ChannelError::Closed);
        }
        match opened {
            Ok(conn) => {
                info!(
                    session = %session_id,
                    channel = %self.config.channel_type,
                    identity = conn.server_identity(),
                    "client session connected"
                );
                st.baseline = Some(Arc::new(conn));
                st.phase = SessionState::Connected;
                Ok(())
            }
            Err(err) => {
                debug!(error = %err, "connect failed");
                st.phase = SessionState::Unconnected;
                st.session_id = None;
                Err(err)
            }
        }
    }

    fn ensure_upgraded(self: &Arc<Self>) -> Result<()> {
        let (baseline, rx, generation, serial) = {
            let mut st = self.state();
            let live = st.link.as_ref().is_some_and(|(_, link)| link.is_connected());
            if st.fallback || live {
                return Ok(());
            }
            let Some(baseline) = st.baseline.clone() else {
                return Err(ChannelError::Closed);
            };
            if let Some((_, stale)) = st.link.take() {
                stale.close();
            }
            let (tx, rx) = mpsc::channel();
            st.pending_upgrade = Some(tx);
            st.phase = SessionState::AwaitingUpgrade;
            st.link_serial += 1;
            (baseline, rx, st.generation, st.link_serial)
        };

        debug!(channel = %self.config.channel_type, "requesting upgraded transport");
        let reply = baseline.send_request(UPGRADE_REQUEST).and_then(|()| {
            rx.recv_timeout(self.config.upgrade_timeout)
                .map_err(|err| match err {
                    RecvTimeoutError::Timeout => ChannelError::Timeout(self.config.upgrade_timeout),
                    RecvTimeoutError::Disconnected => ChannelError::Closed,
                })
        });
        let outcome = match reply {
            Ok(UpgradeReply::Offer(offer, fd)) => {
                self.build_link(offer, fd, &baseline, generation, serial)
            }
            Ok(UpgradeReply::Failed(err)) | Err(err) => Err(err),
        };

        let mut st = self.state();
        st.pending_upgrade = None;
        if st.generation != generation {
            return Err(match (outcome, st.phase) {
                (Err(err @ ChannelError::Application(_)), _) => err,
                (Ok(link), phase) => {
                    link.close();
                    stale_upgrade(phase)
                }
                (Err(_), phase) => stale_upgrade(phase),
            });
        }
        st.settle_phase();

        match outcome {
            Ok(link) => {
                info!(channel = %link.channel_type(), "upgraded transport connected");
                st.link = Some((serial, link));
                Ok(())
            }
            Err(err) if err.is_protocol() => Err(err),
            Err(err) => {
                // Silent degradation: callers keep working over the baseline.
                warn!(error = %err, "upgrade failed; continuing on baseline channel");
                st.fallback = true;
                Ok(())
            }
        }
    }

    fn build_link(
        self: &Arc<Self>,
        offer: UpgradeOffer,
        fd: Option<OwnedFd>,
        baseline: &BaselineConnection,
        generation: u64,
        serial: u64,
    ) -> Result<UpgradedLink> {
        let events: Arc<dyn TransportEvents> = Arc::new(LinkListener {
            client: Arc::downgrade(self),
            generation,
            serial,
        });

        match (self.config.channel_type, offer) {
            (_, UpgradeOffer::Declined { reason }) => Err(ChannelError::UpgradeDeclined(reason)),
            (ChannelType::FramedPipe, UpgradeOffer::FramedPipe) => {
                let fd = fd.ok_or_else(|| {
                    ChannelError::Protocol("framed pipe offer without a descriptor".to_string())
                })?;
                let pipe = FramedPipe::open(IpcStream::from_owned_fd(fd), events)?;
                Ok(UpgradedLink::FramedPipe(pipe))
            }
            (ChannelType::SecureSocket, UpgradeOffer::SecureSocket(params)) => {
                let expected = self
                    .config
                    .expected_identity
                    .as_deref()
                    .unwrap_or_else(|| baseline.server_identity());
                let config = SecureSocketConfig {
                    connect_timeout: self.config.connect_timeout,
                    ..self.config.secure_socket.clone()
                };
                let socket = SecureSocket::connect(&params, expected, &config, events)?;
                Ok(UpgradedLink::SecureSocket(socket))
            }
            (declared, offer) => Err(ChannelError::Protocol(format!(
                "{declared} session received offer {offer:?}"
            ))),
        }
    }

    /// Returns `false` if already closed and `phase` is `Closed`.
    fn reset(&self, phase: SessionState, error: Option<ChannelError>) -> bool {
        let (baseline, link) = {
            let mut st = self.state();
            if phase == SessionState::Closed && st.phase == SessionState::Closed {
                return false;
            }
            st.evict(phase, error)
        };

        if let Some(link) = link {
            link.close_gracefully();
        }
        if let Some(baseline) = baseline {
            baseline.close();
        }
        true
    }

    fn on_envelope(&self, generation: u64, envelope: Envelope, fds: &mut Vec<OwnedFd>) {
        let message = match envelope.into_message() {
            Ok((_, message)) => message,
            Err(err) => {
                warn!(error = %err, "malformed message from service");
                let mut st = self.state();
                if st.generation == generation {
                    if let Some(tx) = st.pending_upgrade.take() {
                        let _ = tx.send(UpgradeReply::Failed(err));
                    } else {
                        st.end_round(Some(err));
                    }
                }
                return;
            }
        };

        let mut st = self.state();
        if st.generation != generation {
            return;
        }
        match message {
            Message::Response(payload) => match st.round.as_mut() {
                Some(round) => {
                    round.publish(&payload);
                }
                None => trace!("response outside a round dropped"),
            },
            Message::Offer(offer) => match st.pending_upgrade.take() {
                Some(tx) => {
                    let fd = (!fds.is_empty()).then(|| fds.remove(0));
                    let _ = tx.send(UpgradeReply::Offer(offer, fd));
                }
                None => debug!(?offer, "upgrade offer without a pending upgrade dropped"),
            },
            Message::EndStream => {
                debug!("round ended by service");
                st.end_round(None);
            }
            Message::Error(err) => {
                info!(code = %err.code, "session ended with service error");
                if let Some(tx) = st.pending_upgrade.take() {
                    let _ = tx.send(UpgradeReply::Failed(ChannelError::Application(err.clone())));
                }
                let (baseline, link) =
                    st.evict(SessionState::Unconnected, Some(ChannelError::Application(err)));
                drop(st);
                if let Some(link) = link {
                    link.close();
                }
                if let Some(baseline) = baseline {
                    baseline.close();
                }
            }
            Message::Request(_) => warn!("unexpected request from service ignored"),
        }
    }

    fn on_baseline_lost(&self, generation: u64, error: ChannelError) {
        let link = {
            let mut st = self.state();
            if st.generation != generation {
                return;
            }
            st.evict(SessionState::Unconnected, Some(error)).1
        };
        if let Some(link) = link {
            link.close();
        }
    }

    fn on_link_message(&self, generation: u64, message: String) {
        let mut st = self.state();
        if st.generation != generation {
            return;
        }
        match st.round.as_mut() {
            Some(round) => {
                round.publish(&message);
            }
            None => trace!("upgraded message outside a round dropped"),
        }
    }

    fn on_link_lost(&self, generation: u64, serial: u64, reason: DisconnectReason) {
        let mut st = self.state();
        if st.generation != generation {
            return;
        }
        if !st.link.as_ref().is_some_and(|(current, _)| *current == serial) {
            return;
        }
        st.link = None;
        match reason {
            DisconnectReason::CloseSignal => {
                debug!("round ended over upgraded transport");
                st.end_round(None);
            }
            DisconnectReason::Failed(why) => {
                warn!(reason = %why, "upgraded transport lost; continuing on baseline channel");
                st.fallback = true;
            }
            DisconnectReason::LocalClose => {}
        }
    }
}

struct BaselineListener {
    client: Weak<ClientInner>,
    generation: u64,
}

impl BaselineEvents for BaselineListener {
    fn on_envelope(&self, envelope: Envelope, fds: &mut Vec<OwnedFd>) {
        if let Some(client) = self.client.upgrade() {
            client.on_envelope(self.generation, envelope, fds);
        }
    }

    fn on_closed(&self, error: ChannelError) {
        if let Some(client) = self.client.upgrade() {
            client.on_baseline_lost(self.generation, error);
        }
    }
}

struct LinkListener {
    client: Weak<ClientInner>,
    generation: u64,
    serial: u64,
}

impl TransportEvents for LinkListener {
    fn on_message(&self, message: String) {
        if let Some(client) = self.client.upgrade() {
            client.on_link_message(self.generation, message);
        }
    }

    fn on_disconnect(&self, reason: DisconnectReason) {
        if reason == DisconnectReason::LocalClose {
            return;
        }
        if let Some(client) = self.client.upgrade() {
            client.on_link_lost(self.generation, self.serial, reason);
        }
    }
}

fn stale_upgrade(phase: SessionState) -> ChannelError {
    match phase {
        SessionState::Closed => ChannelError::Closed,
        _ => ChannelError::Disconnected("session reset during upgrade".to_string()),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::server::{CallerIdentity, ChannelService, RunningService, ServerSession, ServiceConfig};
    use crate::stream::StreamEvent;

    const WAIT: Duration = Duration::from_secs(5);

    fn socket_path(name: &str) -> PathBuf {
        let dir =
            std::env::temp_dir().join(format!("chanlink-client-{}-{name}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir.join("svc.sock")
    }

    /// Replies `re:<msg>` to every message and ends the round on "bye".
    fn start_service(name: &str) -> (PathBuf, RunningService) {
        let path = socket_path(name);
        let service = ChannelService::bind(
            &path,
            ServiceConfig::default(),
            |session: Arc<ServerSession>, _: &CallerIdentity| {
                let messages = session.subscribe_to_messages();
                thread::spawn(move || {
                    for message in messages.flatten() {
                        if message == "bye" {
                            session.send_end_stream();
                        } else {
                            session.send(&format!("re:{message}"));
                        }
                    }
                });
            },
        )
        .unwrap();
        (path, service.spawn().unwrap())
    }

    #[test]
    fn missing_service_fails_stream() {
        let session = ClientSession::new(ClientConfig::new(
            socket_path("missing").with_file_name("absent.sock"),
            ChannelType::Baseline,
        ));
        let mut stream = session.send_message("hello");
        match stream.recv_timeout(WAIT) {
            Some(StreamEvent::Failed(err)) => {
                assert!(matches!(*err, ChannelError::NoSuchService { .. }))
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(session.state(), SessionState::Unconnected);
        assert!(session.session_id().is_none());
    }

    #[test]
    fn rounds_share_session_id() {
        let (path, _service) = start_service("rounds");
        let session = ClientSession::new(ClientConfig::new(&path, ChannelType::Baseline));

        session.connect().unwrap();
        session.connect().unwrap();
        assert!(session.is_connected());
        let id = session.session_id().unwrap();

        let mut first = session.send_message("one");
        assert!(matches!(first.recv_timeout(WAIT), Some(StreamEvent::Message(m)) if m == "re:one"));
        assert_eq!(session.state(), SessionState::Streaming);

        let mut end = session.send_message("bye");
        assert!(matches!(end.recv_timeout(WAIT), Some(StreamEvent::Completed)));
        assert!(matches!(first.recv_timeout(WAIT), Some(StreamEvent::Completed)));
        assert_eq!(session.state(), SessionState::Connected);

        let mut second = session.send_message("two");
        assert!(matches!(second.recv_timeout(WAIT), Some(StreamEvent::Message(m)) if m == "re:two"));
        assert_eq!(session.session_id().unwrap(), id);
    }

    #[test]
    fn close_completes_stream_and_forgets_id() {
        let (path, _service) = start_service("close");
        let session = ClientSession::new(ClientConfig::new(&path, ChannelType::Baseline));

        let mut stream = session.send_message("hi");
        assert!(matches!(stream.recv_timeout(WAIT), Some(StreamEvent::Message(_))));
        let id = session.session_id().unwrap();

        session.close_connection();
        session.close_connection();
        assert_eq!(session.state(), SessionState::Closed);
        assert!(!session.is_connected());
        assert!(session.session_id().is_none());
        assert!(matches!(stream.recv_timeout(WAIT), Some(StreamEvent::Completed)));

        let mut again = session.send_message("hi");
        assert!(matches!(again.recv_timeout(WAIT), Some(StreamEvent::Message(_))));
        assert_ne!(session.session_id().unwrap(), id);
    }

    /// Binds sessions by hand and offers a secure socket on a port nobody
    /// listens on. `ping` gets `pong`.
    fn start_unreachable_offer_service(name: &str) -> (PathBuf, thread::JoinHandle<()>) {
        use chanlink_frame::{FrameReader, FrameWriter};
        use chanlink_transport::UnixDomainSocket;

        use crate::handshake::bind_server;
        use crate::protocol::ConnectionParams;

        let closed_port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let path = socket_path(name);
        let listener = UnixDomainSocket::bind(&path).unwrap();
        let server = thread::spawn(move || {
            let stream = listener.accept().unwrap();
            let mut reader = FrameReader::new(stream.try_clone().unwrap());
            let mut writer = FrameWriter::new(stream);
            let bound =
                bind_server(&mut reader, &mut writer, "stub.local", &HandshakeConfig::default())
                    .unwrap();
            while let Ok(frame) = reader.read_frame() {
                let Ok((_, Message::Request(payload))) =
                    Envelope::decode(&frame.payload).and_then(Envelope::into_message)
                else {
                    break;
                };
                let reply = match payload.as_str() {
                    UPGRADE_REQUEST => Message::Offer(UpgradeOffer::SecureSocket(ConnectionParams {
                        host_address: "127.0.0.1".into(),
                        port: closed_port,
                    })),
                    "ping" => Message::Response("pong".into()),
                    other => Message::Response(other.to_string()),
                };
                let envelope = reply.into_envelope(bound.session_id.clone(), "stub");
                if writer.send(&envelope.encode().unwrap()).is_err() {
                    break;
                }
            }
        });
        (path, server)
    }

    #[test]
    fn unreachable_offer_falls_back_to_baseline() {
        let (path, server) = start_unreachable_offer_service("unreachable");
        let session = ClientSession::new(ClientConfig::new(&path, ChannelType::SecureSocket));

        session.connect().unwrap();
        assert!(session.has_fallen_back());
        assert!(!session.is_upgraded());
        assert_eq!(session.state(), SessionState::Connected);

        let mut stream = session.send_message("ping");
        assert!(matches!(stream.recv_timeout(WAIT), Some(StreamEvent::Message(m)) if m == "pong"));

        session.close_connection();
        server.join().unwrap();
    }

    #[test]
    fn close_before_connect_is_harmless() {
        let session = ClientSession::new(ClientConfig::new("/nonexistent.sock", ChannelType::FramedPipe));
        session.close_connection();
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn config_defaults() {
        let config = ClientConfig::new("/tmp/x.sock", ChannelType::SecureSocket)
            .with_sender("app")
            .with_expected_identity("svc.local");
        assert_eq!(config.connect_timeout, Duration::from_millis(2000));
        assert_eq!(config.upgrade_timeout, Duration::from_secs(5));
        assert_eq!(config.sender, "app");
        assert_eq!(config.expected_identity.as_deref(), Some("svc.local"));
    }
}
