use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tracing::{debug, info};

use super::session::{CallerIdentity, ServerSession};
use super::SessionContext;
use crate::protocol::{ChannelType, SessionId};

/// Host callback for sessions the registry has just admitted.
pub trait ChannelHandler: Send + Sync + 'static {
    /// Runs before the session's first message is routed, so anything
    /// subscribed here sees that message.
    fn on_new_client(&self, session: Arc<ServerSession>, caller: &CallerIdentity);
}

impl<F> ChannelHandler for F
where
    F: Fn(Arc<ServerSession>, &CallerIdentity) + Send + Sync + 'static,
{
    fn on_new_client(&self, session: Arc<ServerSession>, caller: &CallerIdentity) {
        self(session, caller)
    }
}

/// Live server sessions keyed by session id.
///
/// A session is admitted on the first request for an unseen id and removed
/// exactly once, when it is disposed or its round ends. A later request
/// with the same id admits a fresh session.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<SessionId, Arc<ServerSession>>>,
    ctx: Arc<SessionContext>,
    handler: Arc<dyn ChannelHandler>,
    stop_when_idle: bool,
    idle_stop: AtomicBool,
    weak_self: Weak<SessionRegistry>,
}

impl SessionRegistry {
    pub(crate) fn new(
        ctx: Arc<SessionContext>,
        handler: Arc<dyn ChannelHandler>,
        stop_when_idle: bool,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            sessions: Mutex::new(HashMap::new()),
            ctx,
            handler,
            stop_when_idle,
            idle_stop: AtomicBool::new(false),
            weak_self: weak_self.clone(),
        })
    }

    pub fn get(&self, session_id: &SessionId) -> Option<Arc<ServerSession>> {
        self.sessions().get(session_id).cloned()
    }

    /// Existing session for `session_id`, or a new one announced to the
    /// host before this call returns.
    pub fn get_or_create(
        &self,
        session_id: &SessionId,
        channel_type: ChannelType,
        caller: &CallerIdentity,
    ) -> Arc<ServerSession> {
        let (session, created) = {
            let mut sessions = self.sessions();
            match sessions.get(session_id) {
                Some(existing) if !existing.is_terminated() => (Arc::clone(existing), false),
                // A session whose round just ended may linger until it
                // removes itself; the next round gets a fresh one.
                _ => {
                    let session = ServerSession::new(
                        session_id.clone(),
                        channel_type,
                        caller.clone(),
                        Arc::clone(&self.ctx),
                        self.weak_self.clone(),
                    );
                    sessions.insert(session_id.clone(), Arc::clone(&session));
                    (session, true)
                }
            }
        };

        if created {
            info!(
                session = %session_id,
                %channel_type,
                sender = %caller.sender,
                "new client session"
            );
            self.handler.on_new_client(Arc::clone(&session), caller);
        }
        session
    }

    /// The client's baseline connection is gone: dispose its live session.
    pub fn on_unbind(&self, session_id: &SessionId) {
        let removed = self.sessions().remove(session_id);
        if let Some(session) = removed {
            debug!(session = %session_id, "client unbound");
            session.dispose();
            self.check_idle();
        }
    }

    /// Remove `session` if it is still the live one for its id.
    pub(crate) fn remove(&self, session: &ServerSession) -> bool {
        let removed = {
            let mut sessions = self.sessions();
            match sessions.get(session.id()) {
                Some(current) if std::ptr::eq(Arc::as_ptr(current), session) => {
                    sessions.remove(session.id());
                    true
                }
                _ => false,
            }
        };
        if removed {
            debug!(session = %session.id(), "session removed");
            self.check_idle();
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions().is_empty()
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        self.sessions().keys().cloned().collect()
    }

    /// Whether the registry emptied while configured to stop when idle.
    pub fn idle_stop_requested(&self) -> bool {
        self.idle_stop.load(Ordering::Acquire)
    }

    fn check_idle(&self) {
        if self.stop_when_idle && self.is_empty() && !self.idle_stop.swap(true, Ordering::AcqRel)
        {
            info!("no live sessions left; service will stop");
        }
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<SessionId, Arc<ServerSession>>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use chanlink_frame::FrameWriter;
    use chanlink_transport::IpcStream;

    use super::*;
    use crate::baseline::ReplyHandle;
    use crate::server::ServiceConfig;

    fn caller() -> CallerIdentity {
        CallerIdentity {
            sender: "test".into(),
            pid: None,
            uid: None,
        }
    }

    fn registry(stop_when_idle: bool) -> (Arc<SessionRegistry>, Arc<AtomicUsize>) {
        let config = ServiceConfig::default();
        let ctx = Arc::new(SessionContext::new(&config).unwrap());
        let admitted = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&admitted);
        let handler = move |_session: Arc<ServerSession>, _caller: &CallerIdentity| {
            counter.fetch_add(1, Ordering::SeqCst);
        };
        (
            SessionRegistry::new(ctx, Arc::new(handler), stop_when_idle),
            admitted,
        )
    }

    #[test]
    fn admits_each_id_once() {
        let (registry, admitted) = registry(false);
        let id = SessionId::from("a");

        let first = registry.get_or_create(&id, ChannelType::Baseline, &caller());
        let second = registry.get_or_create(&id, ChannelType::Baseline, &caller());
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(admitted.load(Ordering::SeqCst), 1);

        registry.get_or_create(&SessionId::from("b"), ChannelType::Baseline, &caller());
        assert_eq!(admitted.load(Ordering::SeqCst), 2);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn end_of_round_readmits_same_id() {
        let (registry, admitted) = registry(false);
        let id = SessionId::from("a");
        let (server_end, _client_end) = IpcStream::pair().unwrap();
        registry
            .ctx
            .baseline
            .register(&id, ReplyHandle::new(FrameWriter::new(server_end)));

        let first = registry.get_or_create(&id, ChannelType::Baseline, &caller());
        assert!(first.send_end_stream());
        assert!(registry.get(&id).is_none());

        let second = registry.get_or_create(&id, ChannelType::Baseline, &caller());
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(admitted.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn stale_session_cannot_remove_successor() {
        let (registry, _) = registry(false);
        let id = SessionId::from("a");
        let first = registry.get_or_create(&id, ChannelType::Baseline, &caller());
        registry.on_unbind(&id);
        let second = registry.get_or_create(&id, ChannelType::Baseline, &caller());

        assert!(!registry.remove(&first));
        assert!(Arc::ptr_eq(&registry.get(&id).unwrap(), &second));
    }

    #[test]
    fn unbind_of_unknown_id_is_noop() {
        let (registry, _) = registry(true);
        registry.on_unbind(&SessionId::from("ghost"));
        assert!(!registry.idle_stop_requested());
    }

    #[test]
    fn stops_when_last_session_leaves() {
        let (registry, _) = registry(true);
        registry.get_or_create(&SessionId::from("a"), ChannelType::Baseline, &caller());
        registry.get_or_create(&SessionId::from("b"), ChannelType::Baseline, &caller());

        registry.on_unbind(&SessionId::from("a"));
        assert!(!registry.idle_stop_requested());
        registry.on_unbind(&SessionId::from("b"));
        assert!(registry.idle_stop_requested());
    }
}
