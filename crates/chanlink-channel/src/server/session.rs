use std::os::fd::AsFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use chanlink_transport::IpcStream;
use tracing::{debug, info, trace, warn};

use super::registry::SessionRegistry;
use super::SessionContext;
use crate::baseline::Delivery;
use crate::error::Result;
use crate::link::{DisconnectReason, TransportEvents, UpgradedLink};
use crate::pipe::FramedPipe;
use crate::protocol::{ChannelType, Message, MessageError, SessionId, UpgradeOffer, UPGRADE_REQUEST};
use crate::secure::SecureSocket;
use crate::stream::{MessageStream, StreamHub};

/// Who is on the other end of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerIdentity {
    /// Name the client announced in the bind handshake.
    pub sender: String,
    /// Peer process id, where the platform reports it.
    pub pid: Option<u32>,
    /// Peer user id, where the platform reports it.
    pub uid: Option<u32>,
}

/// Lifecycle notifications for one session.
///
/// At most one of the two fires per session, on the listener dispatcher
/// thread.
pub trait ClientListener: Send + Sync + 'static {
    /// The client went away before the round ended.
    fn on_client_dispose(&self, _session_id: &SessionId) {}

    /// The server ended the round with END-STREAM.
    fn on_client_closed(&self, _session_id: &SessionId) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Termination {
    Disposed,
    EndStream,
    Errored,
}

struct ActiveLink {
    serial: u64,
    link: UpgradedLink,
}

/// Server-side view of one client session for one round.
pub struct ServerSession {
    id: SessionId,
    channel_type: ChannelType,
    caller: CallerIdentity,
    ctx: Arc<SessionContext>,
    registry: Weak<SessionRegistry>,
    link: Mutex<Option<ActiveLink>>,
    link_serial: AtomicU64,
    listeners: Mutex<Vec<Arc<dyn ClientListener>>>,
    messages: Mutex<StreamHub>,
    last_message: Mutex<Option<String>>,
    last_message_cv: Condvar,
    termination: Mutex<Option<Termination>>,
    weak_self: Weak<ServerSession>,
}

impl ServerSession {
    pub(crate) fn new(
        id: SessionId,
        channel_type: ChannelType,
        caller: CallerIdentity,
        ctx: Arc<SessionContext>,
        registry: Weak<SessionRegistry>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            id,
            channel_type,
            caller,
            ctx,
            registry,
            link: Mutex::new(None),
            link_serial: AtomicU64::new(0),
            listeners: Mutex::new(Vec::new()),
            messages: Mutex::new(StreamHub::new()),
            last_message: Mutex::new(None),
            last_message_cv: Condvar::new(),
            termination: Mutex::new(None),
            weak_self: weak_self.clone(),
        })
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn channel_type(&self) -> ChannelType {
        self.channel_type
    }

    pub fn caller(&self) -> &CallerIdentity {
        &self.caller
    }

    /// Whether replies currently travel over an upgraded transport.
    pub fn is_upgraded(&self) -> bool {
        self.live_link().is_some()
    }

    /// Whether the round has ended, by END-STREAM, ERROR or disposal.
    pub fn is_terminated(&self) -> bool {
        lock(&self.termination).is_some()
    }

    /// Send one RESPONSE.
    ///
    /// Uses the upgraded transport while it is connected and the baseline
    /// channel otherwise. Returns `false` once the round has ended.
    pub fn send(&self, payload: &str) -> bool {
        if self.is_terminated() {
            return false;
        }
        if let Some(link) = self.live_link() {
            if link.send(payload) {
                return true;
            }
            debug!(session = %self.id, "upgraded send failed; using baseline");
        }
        match self
            .ctx
            .baseline
            .deliver(&self.id, Message::Response(payload.to_string()), None)
        {
            Delivery::Delivered => true,
            Delivery::NoReplyHandle => false,
            Delivery::Failed => {
                self.dispose();
                false
            }
        }
    }

    /// End the round and notify listeners with `on_client_closed`.
    pub fn send_end_stream(&self) -> bool {
        if !self.begin_termination(Termination::EndStream) {
            return false;
        }
        let sent = match self.take_link() {
            Some(link) if link.is_connected() => {
                self.ctx.baseline.evict(&self.id);
                link.close_gracefully()
            }
            other => {
                if let Some(link) = other {
                    link.close();
                }
                self.ctx.baseline.send_end_stream(&self.id)
            }
        };
        info!(session = %self.id, delivered = sent, "round ended by server");
        self.notify(|listener, id| listener.on_client_closed(id));
        self.finish();
        sent
    }

    /// End the session with an application error; the client forgets the
    /// session id. Listeners are not notified.
    pub fn send_error(&self, code: &str, description: &str) -> bool {
        if !self.begin_termination(Termination::Errored) {
            return false;
        }
        let sent = self
            .ctx
            .baseline
            .send_error(&self.id, MessageError::new(code, description));
        if let Some(link) = self.take_link() {
            link.close();
        }
        info!(session = %self.id, code, delivered = sent, "session ended with error");
        self.finish();
        sent
    }

    /// Stream of client messages from now until the round ends.
    pub fn subscribe_to_messages(&self) -> MessageStream {
        lock(&self.messages).subscribe()
    }

    pub fn add_listener(&self, listener: Arc<dyn ClientListener>) {
        lock(&self.listeners).push(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn ClientListener>) {
        lock(&self.listeners).retain(|l| !Arc::ptr_eq(l, listener));
    }

    /// Block until the session has seen a message and return the latest.
    ///
    /// `None` if the round ends without any message.
    pub fn last_message(&self) -> Option<String> {
        let mut last = lock(&self.last_message);
        loop {
            if let Some(message) = last.as_ref() {
                return Some(message.clone());
            }
            if self.is_terminated() {
                return None;
            }
            last = self
                .last_message_cv
                .wait(last)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Like [`ServerSession::last_message`], giving up after `timeout`.
    pub fn last_message_timeout(&self, timeout: Duration) -> Option<String> {
        let deadline = Instant::now() + timeout;
        let mut last = lock(&self.last_message);
        loop {
            if let Some(message) = last.as_ref() {
                return Some(message.clone());
            }
            let now = Instant::now();
            if self.is_terminated() || now >= deadline {
                return None;
            }
            last = self
                .last_message_cv
                .wait_timeout(last, deadline - now)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
    }

    /// Route one REQUEST received over the baseline channel.
    pub(crate) fn handle_request(&self, payload: String) {
        if self.channel_type.is_upgraded() && payload == UPGRADE_REQUEST {
            self.start_upgrade();
        } else {
            self.route_message(payload);
        }
    }

    /// The client is gone. Notifies listeners with `on_client_dispose`.
    pub(crate) fn dispose(&self) {
        if !self.begin_termination(Termination::Disposed) {
            return;
        }
        self.ctx.baseline.evict(&self.id);
        if let Some(link) = self.take_link() {
            link.close();
        }
        info!(session = %self.id, "client session disposed");
        self.notify(|listener, id| listener.on_client_dispose(id));
        self.finish();
    }

    fn route_message(&self, payload: String) {
        if self.is_terminated() {
            trace!(session = %self.id, "message after end of round dropped");
            return;
        }
        {
            let mut last = lock(&self.last_message);
            *last = Some(payload.clone());
            self.last_message_cv.notify_all();
        }
        lock(&self.messages).publish(&payload);
    }

    fn start_upgrade(&self) {
        let serial = self.link_serial.fetch_add(1, Ordering::AcqRel) + 1;
        if let Some(previous) = self.take_link() {
            debug!(session = %self.id, "renegotiating upgraded transport");
            previous.close();
        }

        let offered = match self.channel_type {
            ChannelType::FramedPipe => self.offer_pipe(serial),
            ChannelType::SecureSocket => self.offer_socket(serial),
            ChannelType::Baseline => return,
        };

        match offered {
            Ok(Delivery::Delivered) => {
                debug!(session = %self.id, channel = %self.channel_type, "upgrade offered");
            }
            Ok(Delivery::NoReplyHandle) => self.drop_link(serial),
            Ok(Delivery::Failed) => {
                self.drop_link(serial);
                self.dispose();
            }
            Err(err) => {
                warn!(session = %self.id, error = %err, "cannot offer upgraded transport");
                self.drop_link(serial);
                let declined = UpgradeOffer::Declined {
                    reason: err.to_string(),
                };
                if self.ctx.baseline.send_offer(&self.id, &declined, None) == Delivery::Failed {
                    self.dispose();
                }
            }
        }
    }

    fn offer_pipe(&self, serial: u64) -> Result<Delivery> {
        let (local, remote) = IpcStream::pair()?;
        let pipe = FramedPipe::open(local, self.link_events(serial))?;
        self.install(serial, UpgradedLink::FramedPipe(pipe));
        Ok(self
            .ctx
            .baseline
            .send_offer(&self.id, &UpgradeOffer::FramedPipe, Some(remote.as_fd())))
    }

    fn offer_socket(&self, serial: u64) -> Result<Delivery> {
        let (socket, params) =
            SecureSocket::listen(&self.ctx.identity, &self.ctx.secure, self.link_events(serial))?;
        self.install(serial, UpgradedLink::SecureSocket(socket));
        Ok(self
            .ctx
            .baseline
            .send_offer(&self.id, &UpgradeOffer::SecureSocket(params), None))
    }

    fn link_events(&self, serial: u64) -> Arc<dyn TransportEvents> {
        Arc::new(LinkEvents {
            session: self.weak_self.clone(),
            serial,
        })
    }

    fn on_link_lost(&self, serial: u64, reason: DisconnectReason) {
        if reason == DisconnectReason::LocalClose {
            return;
        }
        let current = {
            let mut slot = lock(&self.link);
            match slot.as_ref() {
                Some(active) if active.serial == serial => slot.take(),
                _ => None,
            }
        };
        if current.is_none() {
            return;
        }
        match reason {
            DisconnectReason::CloseSignal => {
                debug!(session = %self.id, "client closed upgraded transport")
            }
            DisconnectReason::Failed(why) => {
                warn!(session = %self.id, reason = %why, "upgraded transport failed")
            }
            DisconnectReason::LocalClose => {}
        }
        self.dispose();
    }

    fn install(&self, serial: u64, link: UpgradedLink) {
        let mut slot = lock(&self.link);
        if self.is_terminated() {
            link.close();
            return;
        }
        *slot = Some(ActiveLink { serial, link });
    }

    fn drop_link(&self, serial: u64) {
        let link = {
            let mut slot = lock(&self.link);
            match slot.as_ref() {
                Some(active) if active.serial == serial => slot.take(),
                _ => None,
            }
        };
        if let Some(active) = link {
            active.link.close();
        }
    }

    fn take_link(&self) -> Option<UpgradedLink> {
        lock(&self.link).take().map(|active| active.link)
    }

    fn live_link(&self) -> Option<UpgradedLink> {
        lock(&self.link)
            .as_ref()
            .filter(|active| active.link.is_connected())
            .map(|active| active.link.clone())
    }

    fn begin_termination(&self, kind: Termination) -> bool {
        let mut termination = lock(&self.termination);
        if termination.is_some() {
            return false;
        }
        *termination = Some(kind);
        true
    }

    fn finish(&self) {
        lock(&self.messages).complete();
        {
            let _last = lock(&self.last_message);
            self.last_message_cv.notify_all();
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self);
        }
    }

    fn notify(&self, event: impl Fn(&dyn ClientListener, &SessionId) + Send + 'static) {
        let listeners = lock(&self.listeners).clone();
        if listeners.is_empty() {
            return;
        }
        let id = self.id.clone();
        let posted = self.ctx.dispatcher.post(move || {
            for listener in &listeners {
                event(listener.as_ref(), &id);
            }
        });
        if !posted {
            warn!(session = %self.id, "listener dispatcher stopped; notification dropped");
        }
    }
}

impl std::fmt::Debug for ServerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerSession")
            .field("id", &self.id)
            .field("channel_type", &self.channel_type)
            .field("caller", &self.caller)
            .field("termination", &*lock(&self.termination))
            .finish()
    }
}

struct LinkEvents {
    session: Weak<ServerSession>,
    serial: u64,
}

impl TransportEvents for LinkEvents {
    fn on_message(&self, message: String) {
        if let Some(session) = self.session.upgrade() {
            session.route_message(message);
        }
    }

    fn on_disconnect(&self, reason: DisconnectReason) {
        if let Some(session) = self.session.upgrade() {
            session.on_link_lost(self.serial, reason);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
