use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chanlink_frame::{FrameError, FrameReader, FrameWriter};
use chanlink_transport::{IpcStream, TransportError, UnixDomainSocket};
use tracing::{debug, info, warn};

use super::registry::{ChannelHandler, SessionRegistry};
use super::session::CallerIdentity;
use super::SessionContext;
use crate::baseline::ReplyHandle;
use crate::error::Result;
use crate::handshake::{bind_server, HandshakeConfig};
use crate::protocol::{Envelope, Message};
use crate::secure::SecureSocketConfig;

/// Default identity presented by secure socket certificates.
pub const DEFAULT_SERVER_IDENTITY: &str = "chanlink.local";

/// Service configuration.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Name in the self-signed certificate and the bind response.
    pub server_identity: String,
    /// Stop accepting once the last live session is gone.
    pub stop_when_idle: bool,
    /// Permission bits for the service socket file.
    pub socket_mode: Option<u32>,
    pub secure_socket: SecureSocketConfig,
    pub handshake: HandshakeConfig,
    /// How often the accept loop checks for shutdown.
    pub poll_interval: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            server_identity: DEFAULT_SERVER_IDENTITY.to_string(),
            stop_when_idle: false,
            socket_mode: None,
            secure_socket: SecureSocketConfig::default(),
            handshake: HandshakeConfig::default(),
            poll_interval: Duration::from_millis(20),
        }
    }
}

/// Stops a running service from any thread.
#[derive(Debug, Clone)]
pub struct ServiceHandle {
    stop: Arc<AtomicBool>,
}

impl ServiceHandle {
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn is_shutdown(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }
}

/// Baseline endpoint hosting channel sessions on a Unix domain socket.
pub struct ChannelService {
    socket: UnixDomainSocket,
    ctx: Arc<SessionContext>,
    registry: Arc<SessionRegistry>,
    config: ServiceConfig,
    stop: Arc<AtomicBool>,
}

impl ChannelService {
    /// Bind `path` and generate the service's secure socket identity.
    pub fn bind(
        path: impl AsRef<Path>,
        config: ServiceConfig,
        handler: impl ChannelHandler,
    ) -> Result<Self> {
        let socket = match config.socket_mode {
            Some(mode) => UnixDomainSocket::bind_with_mode(path, mode)?,
            None => UnixDomainSocket::bind(path)?,
        };
        socket.set_nonblocking(true)?;

        let ctx = Arc::new(SessionContext::new(&config)?);
        let registry =
            SessionRegistry::new(Arc::clone(&ctx), Arc::new(handler), config.stop_when_idle);

        info!(
            path = %socket.path().display(),
            identity = %config.server_identity,
            "channel service bound"
        );
        Ok(Self {
            socket,
            ctx,
            registry,
            config,
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn handle(&self) -> ServiceHandle {
        ServiceHandle {
            stop: Arc::clone(&self.stop),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn path(&self) -> &Path {
        self.socket.path()
    }

    pub fn server_identity(&self) -> &str {
        self.ctx.identity.name()
    }

    /// Accept clients until shut down, or until idle when so configured.
    ///
    /// On return every client connection has been closed and every live
    /// session disposed.
    pub fn run(self) -> Result<()> {
        let connections: Arc<Mutex<HashMap<u64, IpcStream>>> = Arc::new(Mutex::new(HashMap::new()));
        let mut workers: Vec<JoinHandle<()>> = Vec::new();
        let mut next_connection_id = 1u64;

        loop {
            if self.stop.load(Ordering::Acquire) || self.registry.idle_stop_requested() {
                break;
            }

            match self.socket.try_accept() {
                Ok(Some(stream)) => {
                    let connection_id = next_connection_id;
                    next_connection_id += 1;
                    match self.spawn_connection(connection_id, stream, &connections) {
                        Ok(worker) => workers.push(worker),
                        Err(err) => warn!(error = %err, "cannot start connection worker"),
                    }
                }
                Ok(None) => thread::sleep(self.config.poll_interval),
                Err(err) => {
                    warn!(error = %err, "accept failed");
                    thread::sleep(self.config.poll_interval);
                }
            }
            workers.retain(|worker| !worker.is_finished());
        }

        info!("channel service stopping");
        let open: Vec<IpcStream> = lock_connections(&connections)
            .drain()
            .map(|(_, stream)| stream)
            .collect();
        for stream in open {
            let _ = stream.shutdown();
        }
        for worker in workers {
            let _ = worker.join();
        }
        self.ctx.dispatcher.shutdown();
        info!("channel service stopped");
        Ok(())
    }

    /// Run the accept loop on a background thread.
    pub fn spawn(self) -> Result<RunningService> {
        let handle = self.handle();
        let registry = Arc::clone(&self.registry);
        let path = self.path().to_path_buf();
        let thread = thread::Builder::new()
            .name("chanlink-service".to_string())
            .spawn(move || self.run())
            .map_err(TransportError::Io)?;
        Ok(RunningService {
            handle,
            registry,
            path,
            thread: Some(thread),
        })
    }

    fn spawn_connection(
        &self,
        connection_id: u64,
        stream: IpcStream,
        connections: &Arc<Mutex<HashMap<u64, IpcStream>>>,
    ) -> Result<JoinHandle<()>> {
        lock_connections(connections).insert(connection_id, stream.try_clone()?);

        let registry = Arc::clone(&self.registry);
        let ctx = Arc::clone(&self.ctx);
        let handshake = self.config.handshake.clone();
        let connections = Arc::clone(connections);
        let worker = thread::Builder::new()
            .name(format!("chanlink-conn-{connection_id}"))
            .spawn(move || {
                serve_connection(stream, &registry, &ctx, &handshake);
                lock_connections(&connections).remove(&connection_id);
            })
            .map_err(TransportError::Io)?;
        Ok(worker)
    }
}

/// A service running on its own thread. Dropping it stops the service.
pub struct RunningService {
    handle: ServiceHandle,
    registry: Arc<SessionRegistry>,
    path: PathBuf,
    thread: Option<JoinHandle<Result<()>>>,
}

impl RunningService {
    pub fn handle(&self) -> ServiceHandle {
        self.handle.clone()
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().is_none_or(|t| t.is_finished())
    }

    /// Request shutdown and wait for the accept loop to finish.
    pub fn stop(mut self) -> Result<()> {
        self.handle.shutdown();
        self.join_inner()
    }

    /// Wait for the service to stop on its own.
    pub fn join(mut self) -> Result<()> {
        self.join_inner()
    }

    fn join_inner(&mut self) -> Result<()> {
        match self.thread.take() {
            Some(thread) => thread.join().unwrap_or_else(|_| {
                Err(TransportError::Io(std::io::Error::other("service thread panicked")).into())
            }),
            None => Ok(()),
        }
    }
}

impl Drop for RunningService {
    fn drop(&mut self) {
        self.handle.shutdown();
        let _ = self.join_inner();
    }
}

fn serve_connection(
    stream: IpcStream,
    registry: &SessionRegistry,
    ctx: &SessionContext,
    handshake: &HandshakeConfig,
) {
    let creds = stream.peer_credentials();
    let prepared = stream
        .set_read_timeout(Some(handshake.timeout))
        .and_then(|()| stream.set_write_timeout(Some(handshake.timeout)))
        .and_then(|()| stream.try_clone());
    let writer_stream = match prepared {
        Ok(clone) => clone,
        Err(err) => {
            warn!(error = %err, "cannot prepare client connection");
            return;
        }
    };
    let mut reader = FrameReader::new(stream);
    let mut writer = FrameWriter::new(writer_stream);

    let request = match bind_server(&mut reader, &mut writer, ctx.identity.name(), handshake) {
        Ok(request) => request,
        Err(err) => {
            warn!(error = %err, "bind handshake failed");
            return;
        }
    };
    if let Err(err) = reader
        .get_ref()
        .set_read_timeout(None)
        .and_then(|()| writer.get_ref().set_write_timeout(None))
    {
        warn!(error = %err, "cannot clear handshake timeouts");
        return;
    }

    let session_id = request.session_id;
    let caller = CallerIdentity {
        sender: request.sender,
        uid: creds.map(|(uid, _, _)| uid),
        pid: creds.map(|(_, _, pid)| pid),
    };
    let reply = ReplyHandle::new(writer);
    ctx.baseline.register(&session_id, reply.clone());
    debug!(session = %session_id, channel = %request.channel_type, sender = %caller.sender, "client bound");

    loop {
        let frame = match reader.read_frame() {
            Ok(frame) => frame,
            Err(FrameError::ConnectionClosed) => break,
            Err(err) => {
                debug!(session = %session_id, error = %err, "baseline read ended");
                break;
            }
        };
        let message = Envelope::decode(&frame.payload).and_then(|envelope| {
            if envelope.session_id != session_id {
                warn!(
                    bound = %session_id,
                    got = %envelope.session_id,
                    "envelope for another session ignored"
                );
            }
            envelope.into_message()
        });

        match message {
            Ok((id, Message::Request(payload))) if id == session_id => {
                ctx.baseline.register(&session_id, reply.clone());
                let session = registry.get_or_create(&session_id, request.channel_type, &caller);
                session.handle_request(payload);
            }
            Ok((id, _)) if id != session_id => {}
            Ok((_, other)) => {
                warn!(session = %session_id, kind = ?other.kind(), "unexpected message from client");
            }
            Err(err) => {
                warn!(session = %session_id, error = %err, "protocol violation; dropping client");
                break;
            }
        }
    }

    registry.on_unbind(&session_id);
    ctx.baseline.evict_if(&session_id, &reply);
}

fn lock_connections(
    connections: &Mutex<HashMap<u64, IpcStream>>,
) -> std::sync::MutexGuard<'_, HashMap<u64, IpcStream>> {
    connections.lock().unwrap_or_else(|e| e.into_inner())
}
