//! Baseline control channel.
//!
//! Always-available local socket between a client session and the service.
//! After the bind handshake each frame carries one JSON [`Envelope`]. The
//! server keeps one reply handle per session id and routes outgoing
//! messages through it; a handle is dropped when its round ends or when a
//! write to it fails.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::os::fd::{BorrowedFd, OwnedFd};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use chanlink_frame::{FrameError, FrameReader, FrameWriter};
use chanlink_transport::{IpcStream, TransportError, UnixDomainSocket};
use tracing::{debug, trace, warn};

use crate::error::{ChannelError, Result};
use crate::handshake::{bind_client, HandshakeConfig};
use crate::protocol::{
    ChannelType, Envelope, Message, MessageError, MessageKind, SessionId, UpgradeOffer,
};

/// Write half of one client's baseline connection.
#[derive(Clone)]
pub struct ReplyHandle {
    writer: Arc<Mutex<FrameWriter<IpcStream>>>,
}

impl ReplyHandle {
    pub fn new(writer: FrameWriter<IpcStream>) -> Self {
        Self {
            writer: Arc::new(Mutex::new(writer)),
        }
    }

    fn deliver(&self, envelope: &Envelope, fd: Option<BorrowedFd<'_>>) -> Result<()> {
        let bytes = envelope.encode()?;
        let mut writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        match fd {
            Some(fd) => writer.send_with_fd(&bytes, fd)?,
            None => writer.send(&bytes)?,
        }
        Ok(())
    }

    pub(crate) fn same_as(&self, other: &ReplyHandle) -> bool {
        Arc::ptr_eq(&self.writer, &other.writer)
    }
}

/// Outcome of routing one message to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivery {
    Delivered,
    /// No reply handle is registered for the session.
    NoReplyHandle,
    /// The write failed; the handle has been evicted.
    Failed,
}

/// Server side of the baseline channel: reply handles keyed by session.
pub struct BaselineChannel {
    sender: String,
    replies: Mutex<HashMap<SessionId, ReplyHandle>>,
}

impl BaselineChannel {
    /// `sender` is stamped on every outgoing envelope.
    pub fn new(sender: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            replies: Mutex::new(HashMap::new()),
        }
    }

    /// Route replies for `session_id` through `reply`, replacing any
    /// previous handle.
    pub fn register(&self, session_id: &SessionId, reply: ReplyHandle) {
        self.replies().insert(session_id.clone(), reply);
    }

    /// Forget the reply handle for `session_id`.
    pub fn evict(&self, session_id: &SessionId) -> bool {
        let evicted = self.replies().remove(session_id).is_some();
        if evicted {
            trace!(session = %session_id, "reply handle evicted");
        }
        evicted
    }

    /// Evict only if the registered handle is still `reply`.
    pub(crate) fn evict_if(&self, session_id: &SessionId, reply: &ReplyHandle) -> bool {
        let mut replies = self.replies();
        match replies.get(session_id) {
            Some(current) if current.same_as(reply) => {
                replies.remove(session_id);
                true
            }
            _ => false,
        }
    }

    pub fn has_reply(&self, session_id: &SessionId) -> bool {
        self.replies().contains_key(session_id)
    }

    /// Send `message` to the session. A failed write evicts the handle.
    pub fn send(&self, session_id: &SessionId, message: Message) -> bool {
        self.deliver(session_id, message, None) == Delivery::Delivered
    }

    /// Send END-STREAM and evict the handle.
    pub fn send_end_stream(&self, session_id: &SessionId) -> bool {
        self.send_terminal(session_id, Message::EndStream)
    }

    /// Send ERROR and evict the handle.
    pub fn send_error(&self, session_id: &SessionId, error: MessageError) -> bool {
        self.send_terminal(session_id, Message::Error(error))
    }

    // The handle leaves the table before the write, so a handle the next
    // round registers in reaction to this message is never evicted.
    fn send_terminal(&self, session_id: &SessionId, message: Message) -> bool {
        let Some(reply) = self.replies().remove(session_id) else {
            debug!(session = %session_id, kind = ?message.kind(), "no reply handle; message dropped");
            return false;
        };
        let envelope = message.into_envelope(session_id.clone(), &self.sender);
        match reply.deliver(&envelope, None) {
            Ok(()) => true,
            Err(err) => {
                warn!(session = %session_id, error = %err, "baseline delivery failed");
                false
            }
        }
    }

    /// Answer an upgrade request, optionally passing a descriptor along.
    pub(crate) fn send_offer(
        &self,
        session_id: &SessionId,
        offer: &UpgradeOffer,
        fd: Option<BorrowedFd<'_>>,
    ) -> Delivery {
        self.deliver(session_id, Message::Offer(offer.clone()), fd)
    }

    pub(crate) fn deliver(
        &self,
        session_id: &SessionId,
        message: Message,
        fd: Option<BorrowedFd<'_>>,
    ) -> Delivery {
        let Some(reply) = self.replies().get(session_id).cloned() else {
            debug!(session = %session_id, kind = ?message.kind(), "no reply handle; message dropped");
            return Delivery::NoReplyHandle;
        };

        let envelope = message.into_envelope(session_id.clone(), &self.sender);
        match reply.deliver(&envelope, fd) {
            Ok(()) => Delivery::Delivered,
            Err(err) => {
                warn!(session = %session_id, error = %err, "baseline delivery failed");
                self.evict_if(session_id, &reply);
                Delivery::Failed
            }
        }
    }

    fn replies(&self) -> std::sync::MutexGuard<'_, HashMap<SessionId, ReplyHandle>> {
        self.replies.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Callbacks from a client's baseline reader thread.
pub(crate) trait BaselineEvents: Send + Sync + 'static {
    /// `fds` holds descriptors received and not yet claimed. Only an offer
    /// claims one; whatever is left after an offer is closed.
    fn on_envelope(&self, envelope: Envelope, fds: &mut Vec<OwnedFd>);
    /// The connection ended without a local close.
    fn on_closed(&self, error: ChannelError);
}

/// Client side of the baseline channel for one session.
pub(crate) struct BaselineConnection {
    writer: Mutex<FrameWriter<IpcStream>>,
    control: IpcStream,
    session_id: SessionId,
    sender: String,
    server_identity: String,
    closed: Arc<AtomicBool>,
}

impl BaselineConnection {
    /// Connect to the service at `path`, bind `session_id` and start
    /// reading envelopes.
    pub(crate) fn open(
        path: &Path,
        session_id: &SessionId,
        channel_type: ChannelType,
        sender: &str,
        handshake: &HandshakeConfig,
        events: Arc<dyn BaselineEvents>,
    ) -> Result<Self> {
        let stream = UnixDomainSocket::connect(path).map_err(|err| match err {
            TransportError::Connect { source, .. }
                if matches!(
                    source.kind(),
                    ErrorKind::NotFound | ErrorKind::ConnectionRefused
                ) =>
            {
                ChannelError::NoSuchService {
                    path: path.to_path_buf(),
                }
            }
            other => ChannelError::Connection(other.to_string()),
        })?;

        stream.set_read_timeout(Some(handshake.timeout))?;
        stream.set_write_timeout(Some(handshake.timeout))?;
        let control = stream.try_clone()?;
        let mut reader = FrameReader::new(stream.try_clone()?);
        let mut writer = FrameWriter::new(stream);

        let resp = bind_client(
            &mut reader,
            &mut writer,
            session_id,
            channel_type,
            sender,
            handshake,
        )
        .map_err(|e| ChannelError::Connection(format!("bind handshake failed: {e}")))?;

        control.set_read_timeout(None)?;
        control.set_write_timeout(None)?;

        let closed = Arc::new(AtomicBool::new(false));
        let reader_closed = Arc::clone(&closed);
        thread::Builder::new()
            .name("chanlink-baseline-reader".to_string())
            .spawn(move || read_loop(reader, events, reader_closed))
            .map_err(TransportError::Io)?;

        debug!(session = %session_id, identity = %resp.server_identity, "baseline bound");
        Ok(Self {
            writer: Mutex::new(writer),
            control,
            session_id: session_id.clone(),
            sender: sender.to_string(),
            server_identity: resp.server_identity,
            closed,
        })
    }

    pub(crate) fn send_request(&self, payload: &str) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ChannelError::Closed);
        }
        let envelope = Message::Request(payload.to_string())
            .into_envelope(self.session_id.clone(), &self.sender);
        let bytes = envelope.encode()?;
        let mut writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        writer.send(&bytes)?;
        Ok(())
    }

    pub(crate) fn server_identity(&self) -> &str {
        &self.server_identity
    }

    /// Unbind. Idempotent; the reader thread exits without reporting.
    pub(crate) fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(err) = self.control.shutdown() {
            debug!(error = %err, "baseline shutdown");
        }
    }
}

fn read_loop(
    mut reader: FrameReader<IpcStream>,
    events: Arc<dyn BaselineEvents>,
    closed: Arc<AtomicBool>,
) {
    let mut fds = Vec::new();
    let error = loop {
        match reader.read_frame_with_fds(&mut fds) {
            Ok(frame) => match Envelope::decode(&frame.payload) {
                Ok(envelope) => {
                    let kind = envelope.kind;
                    events.on_envelope(envelope, &mut fds);
                    // A descriptor can arrive with the bytes of an earlier
                    // frame; it stays pending until its offer is read.
                    if kind == MessageKind::Offer {
                        fds.clear();
                    }
                }
                Err(err) => break err,
            },
            Err(FrameError::ConnectionClosed) => {
                break ChannelError::Disconnected("service closed the connection".to_string())
            }
            Err(err) => break ChannelError::Frame(err),
        }
    };

    if !closed.swap(true, Ordering::AcqRel) {
        warn!(error = %error, "baseline connection lost");
        events.on_closed(error);
    }
}

#[cfg(test)]
mod tests {
    use std::os::fd::AsFd;

    use super::*;

    fn channel_with_peer(id: &SessionId) -> (BaselineChannel, FrameReader<IpcStream>) {
        let (server_end, client_end) = IpcStream::pair().unwrap();
        let channel = BaselineChannel::new("svc");
        channel.register(id, ReplyHandle::new(FrameWriter::new(server_end)));
        (channel, FrameReader::new(client_end))
    }

    fn read_message(reader: &mut FrameReader<IpcStream>) -> Message {
        let frame = reader.read_frame().unwrap();
        Envelope::decode(&frame.payload).unwrap().into_message().unwrap().1
    }

    #[test]
    fn routes_by_session_and_evicts_on_end_stream() {
        let id = SessionId::from("s-1");
        let (channel, mut reader) = channel_with_peer(&id);

        assert!(channel.send(&id, Message::Response("pong".into())));
        assert!(channel.send_end_stream(&id));
        assert_eq!(read_message(&mut reader), Message::Response("pong".into()));
        assert_eq!(read_message(&mut reader), Message::EndStream);

        assert!(!channel.has_reply(&id));
        assert!(!channel.send(&id, Message::Response("late".into())));
    }

    #[test]
    fn error_carries_code_and_evicts() {
        let id = SessionId::from("s-2");
        let (channel, mut reader) = channel_with_peer(&id);

        assert!(channel.send_error(&id, MessageError::new("E1", "nope")));
        assert_eq!(
            read_message(&mut reader),
            Message::Error(MessageError::new("E1", "nope"))
        );
        assert!(!channel.has_reply(&id));
    }

    #[test]
    fn unknown_session_is_not_delivered() {
        let channel = BaselineChannel::new("svc");
        let id = SessionId::from("ghost");
        assert_eq!(
            channel.deliver(&id, Message::EndStream, None),
            Delivery::NoReplyHandle
        );
        assert!(!channel.evict(&id));
    }

    #[test]
    fn failed_write_evicts_handle() {
        let id = SessionId::from("s-3");
        let (channel, reader) = channel_with_peer(&id);
        drop(reader);

        let mut outcome = Delivery::Delivered;
        for _ in 0..64 {
            outcome = channel.deliver(&id, Message::Response("x".repeat(4096)), None);
            if outcome != Delivery::Delivered {
                break;
            }
        }
        assert_eq!(outcome, Delivery::Failed);
        assert!(!channel.has_reply(&id));
    }

    #[test]
    fn evict_if_ignores_replaced_handle() {
        let id = SessionId::from("s-4");
        let (old_end, _old_peer) = IpcStream::pair().unwrap();
        let (new_end, _new_peer) = IpcStream::pair().unwrap();
        let old = ReplyHandle::new(FrameWriter::new(old_end));
        let channel = BaselineChannel::new("svc");

        channel.register(&id, old.clone());
        channel.register(&id, ReplyHandle::new(FrameWriter::new(new_end)));
        assert!(!channel.evict_if(&id, &old));
        assert!(channel.has_reply(&id));
    }

    #[test]
    fn offer_carries_descriptor() {
        let id = SessionId::from("s-5");
        let (channel, mut reader) = channel_with_peer(&id);
        let (_kept, handed) = IpcStream::pair().unwrap();

        assert_eq!(
            channel.send_offer(&id, &UpgradeOffer::FramedPipe, Some(handed.as_fd())),
            Delivery::Delivered
        );

        let mut fds = Vec::new();
        let frame = reader.read_frame_with_fds(&mut fds).unwrap();
        let (_, message) = Envelope::decode(&frame.payload)
            .unwrap()
            .into_message()
            .unwrap();
        assert_eq!(message, Message::Offer(UpgradeOffer::FramedPipe));
        assert_eq!(fds.len(), 1);
    }

    struct OfferRecorder(Mutex<std::sync::mpsc::Sender<(MessageKind, bool)>>);

    impl BaselineEvents for OfferRecorder {
        fn on_envelope(&self, envelope: Envelope, fds: &mut Vec<OwnedFd>) {
            let kind = envelope.kind;
            let claimed = kind == MessageKind::Offer && !fds.is_empty() && {
                fds.remove(0);
                true
            };
            let _ = self.0.lock().unwrap().send((kind, claimed));
        }

        fn on_closed(&self, _: ChannelError) {}
    }

    #[test]
    fn descriptor_waits_for_its_offer() {
        let (server_end, client_end) = IpcStream::pair().unwrap();
        let (_kept, handed) = IpcStream::pair().unwrap();
        let (tx, seen) = std::sync::mpsc::channel();
        let events: Arc<dyn BaselineEvents> = Arc::new(OfferRecorder(Mutex::new(tx)));
        let closed = Arc::new(AtomicBool::new(false));
        let reader_closed = Arc::clone(&closed);
        let reader = thread::spawn(move || {
            read_loop(FrameReader::new(client_end), events, reader_closed)
        });

        let id = SessionId::from("s-6");
        let greeting = Message::Response("welcome".into()).into_envelope(id.clone(), "svc");
        let offer = Message::Offer(UpgradeOffer::FramedPipe).into_envelope(id, "svc");
        let mut writer = FrameWriter::new(server_end);
        // The descriptor rides on the greeting's bytes, ahead of the offer.
        writer
            .send_with_fd(&greeting.encode().unwrap(), handed.as_fd())
            .unwrap();
        writer.send(&offer.encode().unwrap()).unwrap();

        let wait = std::time::Duration::from_secs(2);
        assert_eq!(seen.recv_timeout(wait).unwrap(), (MessageKind::Response, false));
        assert_eq!(seen.recv_timeout(wait).unwrap(), (MessageKind::Offer, true));

        closed.store(true, Ordering::Release);
        drop(writer);
        reader.join().unwrap();
    }

    #[test]
    fn missing_service_is_no_such_service() {
        struct Ignore;
        impl BaselineEvents for Ignore {
            fn on_envelope(&self, _: Envelope, _: &mut Vec<OwnedFd>) {}
            fn on_closed(&self, _: ChannelError) {}
        }

        let path = std::env::temp_dir().join(format!("chanlink-missing-{}.sock", std::process::id()));
        let result = BaselineConnection::open(
            &path,
            &SessionId::generate(),
            ChannelType::Baseline,
            "app",
            &HandshakeConfig::default(),
            Arc::new(Ignore),
        );
        assert!(matches!(result, Err(ChannelError::NoSuchService { .. })));
    }
}
