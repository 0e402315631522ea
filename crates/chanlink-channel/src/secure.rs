//! Line-oriented TLS transport over a loopback TCP port.
//!
//! The server side binds the first free port in its range and waits for a
//! single peer. The client side dials the advertised address and only
//! trusts a certificate issued for the identity it expects.

use std::io::{self, ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use chanlink_frame::{encode_line, LineDecoder, DEFAULT_MAX_PAYLOAD};
use chanlink_transport::{
    bind_first_free, client_config, is_identity_mismatch, ServerIdentity, TransportError,
    DEFAULT_PORT_RANGE,
};
use rustls::pki_types::ServerName;
use rustls::{ClientConnection, ConnectionCommon, ServerConnection, SideData};
use tracing::{debug, info, trace, warn};

use crate::error::{ChannelError, Result};
use crate::link::{DisconnectReason, EventGate, TransportEvents};
use crate::protocol::{ConnectionParams, CLOSE_SENTINEL};

/// Secure socket settings shared by both ends.
#[derive(Debug, Clone)]
pub struct SecureSocketConfig {
    /// Host the server binds and advertises.
    pub bind_host: String,
    /// Ports scanned in order for a free one.
    pub port_range: RangeInclusive<u16>,
    /// How long a server waits for its peer to connect.
    pub accept_timeout: Duration,
    /// Client bound on TCP connect plus TLS handshake.
    pub connect_timeout: Duration,
    /// Granularity of the I/O loop.
    pub poll_interval: Duration,
    /// Longest accepted line, in bytes.
    pub max_line: usize,
}

impl Default for SecureSocketConfig {
    fn default() -> Self {
        Self {
            bind_host: "127.0.0.1".to_string(),
            port_range: DEFAULT_PORT_RANGE,
            accept_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_millis(2000),
            poll_interval: Duration::from_millis(10),
            max_line: DEFAULT_MAX_PAYLOAD,
        }
    }
}

/// One end of a secure socket connection. Cloning shares the connection.
#[derive(Clone)]
pub struct SecureSocket {
    shared: Arc<SocketShared>,
}

impl std::fmt::Debug for SecureSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureSocket").finish_non_exhaustive()
    }
}

struct SocketShared {
    outgoing: Mutex<Option<Sender<String>>>,
    connected: AtomicBool,
    closed: AtomicBool,
    gate: EventGate,
}

impl SecureSocket {
    /// Bind a listener and start waiting for one peer in the background.
    ///
    /// Returns as soon as the port is bound, with the parameters the peer
    /// should dial. The peer must connect within `accept_timeout`.
    pub fn listen(
        identity: &ServerIdentity,
        config: &SecureSocketConfig,
        events: Arc<dyn TransportEvents>,
    ) -> Result<(Self, ConnectionParams)> {
        let listener = bind_first_free(&config.bind_host, config.port_range.clone())?;
        let port = listener.local_addr().map_err(TransportError::Io)?.port();
        listener.set_nonblocking(true).map_err(TransportError::Io)?;

        let (tx, rx) = mpsc::channel();
        let shared = Arc::new(SocketShared::new(tx, events));
        let server_config = identity.server_config();
        let thread_shared = Arc::clone(&shared);
        let thread_config = config.clone();

        thread::Builder::new()
            .name("chanlink-tls-server".to_string())
            .spawn(move || {
                let reason = thread_shared.serve(listener, server_config, rx, &thread_config);
                thread_shared.finish(reason);
            })
            .map_err(TransportError::Io)?;

        info!(host = %config.bind_host, port, "secure socket listening");
        let params = ConnectionParams {
            host_address: config.bind_host.clone(),
            port,
        };
        Ok((Self { shared }, params))
    }

    /// Dial `params` and complete the TLS handshake before returning.
    ///
    /// A certificate for any identity other than `expected_identity` fails
    /// with [`ChannelError::UntrustedPeer`].
    pub fn connect(
        params: &ConnectionParams,
        expected_identity: &str,
        config: &SecureSocketConfig,
        events: Arc<dyn TransportEvents>,
    ) -> Result<Self> {
        let tls_config = client_config(expected_identity)?;
        let addr = resolve(params)?;
        let deadline = Instant::now() + config.connect_timeout;

        let mut tcp = TcpStream::connect_timeout(&addr, config.connect_timeout).map_err(|e| {
            ChannelError::Connection(format!(
                "secure socket {}:{}: {e}",
                params.host_address, params.port
            ))
        })?;
        let _ = tcp.set_nodelay(true);
        tcp.set_read_timeout(Some(config.poll_interval))
            .map_err(TransportError::Io)?;

        let name = ServerName::try_from(expected_identity.to_string())
            .map_err(|_| TransportError::InvalidIdentity(expected_identity.to_string()))?;
        let mut conn = ClientConnection::new(tls_config, name).map_err(TransportError::Tls)?;

        if let Err(err) = handshake(&mut *conn, &mut tcp, deadline) {
            if is_identity_mismatch(&err) {
                warn!(expected = expected_identity, "secure socket peer identity rejected");
                return Err(ChannelError::UntrustedPeer {
                    expected: expected_identity.to_string(),
                });
            }
            return Err(ChannelError::Connection(format!("tls handshake failed: {err}")));
        }

        let (tx, rx) = mpsc::channel();
        let shared = Arc::new(SocketShared::new(tx, events));
        shared.connected.store(true, Ordering::Release);

        let thread_shared = Arc::clone(&shared);
        let max_line = config.max_line;
        thread::Builder::new()
            .name("chanlink-tls-client".to_string())
            .spawn(move || {
                let reason = pump_loop(&mut *conn, &mut tcp, &rx, max_line, &thread_shared.gate);
                thread_shared.finish(reason);
            })
            .map_err(TransportError::Io)?;

        debug!(port = params.port, "secure socket connected");
        Ok(Self { shared })
    }

    /// Queue one line. Returns `false` unless a peer is connected.
    pub fn send(&self, message: &str) -> bool {
        if !self.is_connected() {
            return false;
        }
        let guard = self.shared.outgoing.lock().unwrap_or_else(|e| e.into_inner());
        match guard.as_ref() {
            Some(tx) => tx.send(message.to_string()).is_ok(),
            None => false,
        }
    }

    /// Send the close sentinel if connected, then close.
    pub fn close_gracefully(&self) -> bool {
        self.shutdown(true)
    }

    /// Close without signalling. Safe from any thread, idempotent.
    pub fn close(&self) {
        self.shutdown(false);
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    fn shutdown(&self, graceful: bool) -> bool {
        let sender = self
            .shared
            .outgoing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        self.shared.closed.store(true, Ordering::Release);
        let was_connected = self.shared.connected.swap(false, Ordering::AcqRel);

        // Queued lines are still written; the I/O thread closes once drained.
        let sent = match sender {
            Some(tx) if graceful && was_connected => {
                tx.send(CLOSE_SENTINEL.to_string()).is_ok()
            }
            _ => false,
        };
        self.shared.gate.disconnect(DisconnectReason::LocalClose);
        sent
    }
}

impl SocketShared {
    fn new(tx: Sender<String>, events: Arc<dyn TransportEvents>) -> Self {
        Self {
            outgoing: Mutex::new(Some(tx)),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            gate: EventGate::new(events),
        }
    }

    fn serve(
        &self,
        listener: TcpListener,
        server_config: Arc<rustls::ServerConfig>,
        rx: Receiver<String>,
        config: &SecureSocketConfig,
    ) -> DisconnectReason {
        let mut tcp = match self.accept_one(&listener, config) {
            Ok(Some(tcp)) => tcp,
            Ok(None) => return DisconnectReason::LocalClose,
            Err(reason) => return reason,
        };
        drop(listener);

        let mut conn = match ServerConnection::new(server_config) {
            Ok(conn) => conn,
            Err(err) => return DisconnectReason::Failed(err.to_string()),
        };
        let setup = tcp
            .set_read_timeout(Some(config.poll_interval))
            .and_then(|()| handshake(&mut *conn, &mut tcp, Instant::now() + config.connect_timeout));
        if let Err(err) = setup {
            warn!(error = %err, "secure socket handshake failed");
            return DisconnectReason::Failed(format!("tls handshake failed: {err}"));
        }

        if self.closed.load(Ordering::Acquire) {
            return DisconnectReason::LocalClose;
        }
        self.connected.store(true, Ordering::Release);
        debug!("secure socket peer connected");

        pump_loop(&mut *conn, &mut tcp, &rx, config.max_line, &self.gate)
    }

    fn accept_one(
        &self,
        listener: &TcpListener,
        config: &SecureSocketConfig,
    ) -> std::result::Result<Option<TcpStream>, DisconnectReason> {
        let deadline = Instant::now() + config.accept_timeout;
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Ok(None);
            }
            match listener.accept() {
                Ok((tcp, peer)) => {
                    trace!(%peer, "secure socket accepted");
                    tcp.set_nonblocking(false)
                        .map_err(|e| DisconnectReason::Failed(e.to_string()))?;
                    let _ = tcp.set_nodelay(true);
                    return Ok(Some(tcp));
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        warn!(timeout = ?config.accept_timeout, "no secure socket peer connected");
                        return Err(DisconnectReason::Failed(format!(
                            "no peer connected within {:?}",
                            config.accept_timeout
                        )));
                    }
                    thread::sleep(config.poll_interval);
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(DisconnectReason::Failed(err.to_string())),
            }
        }
    }

    fn finish(&self, reason: DisconnectReason) {
        self.connected.store(false, Ordering::Release);
        self.closed.store(true, Ordering::Release);
        self.outgoing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let DisconnectReason::Failed(why) = &reason {
            if !self.gate.is_disconnected() {
                debug!(reason = %why, "secure socket closed");
            }
        }
        self.gate.disconnect(reason);
    }
}

fn resolve(params: &ConnectionParams) -> Result<SocketAddr> {
    (params.host_address.as_str(), params.port)
        .to_socket_addrs()
        .map_err(TransportError::Io)?
        .next()
        .ok_or_else(|| {
            ChannelError::Connection(format!(
                "cannot resolve {}:{}",
                params.host_address, params.port
            ))
        })
}

fn handshake<S: SideData>(
    conn: &mut ConnectionCommon<S>,
    tcp: &mut TcpStream,
    deadline: Instant,
) -> io::Result<()> {
    while conn.is_handshaking() {
        if Instant::now() >= deadline {
            return Err(io::Error::new(ErrorKind::TimedOut, "tls handshake timed out"));
        }
        match conn.complete_io(tcp) {
            Ok(_) => {}
            Err(err) if is_transient(&err) => {}
            Err(err) => return Err(err),
        }
    }
    flush(conn, tcp)
}

fn pump_loop<S: SideData>(
    conn: &mut ConnectionCommon<S>,
    tcp: &mut TcpStream,
    rx: &Receiver<String>,
    max_line: usize,
    gate: &EventGate,
) -> DisconnectReason {
    let mut decoder = LineDecoder::new(max_line);
    loop {
        match pump(conn, tcp, rx, &mut decoder, gate) {
            Ok(None) => continue,
            Ok(Some(reason)) => return reason,
            Err(err) => return DisconnectReason::Failed(err.to_string()),
        }
    }
}

/// One turn of the I/O loop: write what is queued, then read what arrived.
fn pump<S: SideData>(
    conn: &mut ConnectionCommon<S>,
    tcp: &mut TcpStream,
    rx: &Receiver<String>,
    decoder: &mut LineDecoder,
    gate: &EventGate,
) -> io::Result<Option<DisconnectReason>> {
    let mut line_buf = BytesMut::new();
    loop {
        match rx.try_recv() {
            Ok(line) => {
                line_buf.clear();
                encode_line(&line, &mut line_buf);
                conn.writer().write_all(&line_buf)?;
            }
            Err(TryRecvError::Empty) => break,
            Err(TryRecvError::Disconnected) => {
                conn.send_close_notify();
                let _ = flush(conn, tcp);
                return Ok(Some(DisconnectReason::LocalClose));
            }
        }
    }
    flush(conn, tcp)?;

    let eof = match conn.read_tls(tcp) {
        Ok(0) => true,
        Ok(_) => false,
        Err(err) if is_transient(&err) => false,
        Err(err) => return Err(err),
    };
    let state = conn
        .process_new_packets()
        .map_err(|e| io::Error::new(ErrorKind::InvalidData, e))?;

    let available = state.plaintext_bytes_to_read();
    if available > 0 {
        let mut plain = vec![0u8; available];
        conn.reader().read_exact(&mut plain)?;
        decoder.push(&plain);
    }

    while let Some(line) = decoder
        .next_line()
        .map_err(|e| io::Error::new(ErrorKind::InvalidData, e))?
    {
        if line == CLOSE_SENTINEL {
            debug!("secure socket peer sent close");
            conn.send_close_notify();
            let _ = flush(conn, tcp);
            return Ok(Some(DisconnectReason::CloseSignal));
        }
        gate.message(line);
    }

    if eof || state.peer_has_closed() {
        return Ok(Some(DisconnectReason::Failed(
            "peer closed connection without close signal".to_string(),
        )));
    }
    Ok(None)
}

fn flush<S: SideData>(conn: &mut ConnectionCommon<S>, tcp: &mut TcpStream) -> io::Result<()> {
    while conn.wants_write() {
        conn.write_tls(tcp)?;
    }
    tcp.flush()
}

fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
    )
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc::RecvTimeoutError;

    use super::*;
    use crate::link::testing::{Recorder, Seen};

    const WAIT: Duration = Duration::from_secs(5);

    fn identity() -> ServerIdentity {
        ServerIdentity::generate("svc.chanlink.test").unwrap()
    }

    fn next_message(rx: &mpsc::Receiver<Seen>) -> String {
        match rx.recv_timeout(WAIT).unwrap() {
            Seen::Message(message) => message,
            other => panic!("expected message, got {other:?}"),
        }
    }

    #[test]
    fn exchanges_lines_both_ways() {
        let identity = identity();
        let config = SecureSocketConfig::default();
        let (server_events, server_rx) = Recorder::new();
        let (server, params) = SecureSocket::listen(&identity, &config, server_events).unwrap();
        assert!(!server.is_connected());
        assert!(config.port_range.contains(&params.port));

        let (client_events, client_rx) = Recorder::new();
        let client =
            SecureSocket::connect(&params, "svc.chanlink.test", &config, client_events).unwrap();
        assert!(client.send("ping"));
        assert!(client.send("two\nlines"));
        assert_eq!(next_message(&server_rx), "ping");
        assert_eq!(next_message(&server_rx), "two\nlines");

        assert!(server.is_connected());
        assert!(server.send("pong"));
        assert_eq!(next_message(&client_rx), "pong");

        assert!(server.close_gracefully());
        assert_eq!(
            client_rx.recv_timeout(WAIT).unwrap(),
            Seen::Disconnect(DisconnectReason::CloseSignal)
        );
        assert_eq!(
            server_rx.recv_timeout(WAIT).unwrap(),
            Seen::Disconnect(DisconnectReason::LocalClose)
        );
        assert!(!client.is_connected());
    }

    #[test]
    fn wrong_identity_is_untrusted() {
        let identity = identity();
        let config = SecureSocketConfig::default();
        let (server_events, _server_rx) = Recorder::new();
        let (server, params) = SecureSocket::listen(&identity, &config, server_events).unwrap();

        let (client_events, _client_rx) = Recorder::new();
        let result = SecureSocket::connect(&params, "other.chanlink.test", &config, client_events);
        assert!(matches!(
            result,
            Err(ChannelError::UntrustedPeer { ref expected }) if expected == "other.chanlink.test"
        ));
        assert!(result.unwrap_err().is_protocol());
        server.close();
    }

    #[test]
    fn accept_times_out_without_peer() {
        let identity = identity();
        let config = SecureSocketConfig {
            accept_timeout: Duration::from_millis(50),
            ..SecureSocketConfig::default()
        };
        let (events, rx) = Recorder::new();
        let (server, _params) = SecureSocket::listen(&identity, &config, events).unwrap();

        assert!(matches!(
            rx.recv_timeout(WAIT).unwrap(),
            Seen::Disconnect(DisconnectReason::Failed(_))
        ));
        assert!(!server.send("nobody"));
    }

    #[test]
    fn local_close_reported_once() {
        let identity = identity();
        let config = SecureSocketConfig::default();
        let (events, rx) = Recorder::new();
        let (server, _params) = SecureSocket::listen(&identity, &config, events).unwrap();

        server.close();
        server.close();
        assert_eq!(
            rx.recv_timeout(WAIT).unwrap(),
            Seen::Disconnect(DisconnectReason::LocalClose)
        );
        assert_eq!(
            rx.recv_timeout(Duration::from_millis(100)),
            Err(RecvTimeoutError::Timeout)
        );
    }

    #[test]
    fn peer_drop_without_signal_is_failure() {
        let identity = identity();
        let config = SecureSocketConfig::default();
        let (server_events, server_rx) = Recorder::new();
        let (_server, params) = SecureSocket::listen(&identity, &config, server_events).unwrap();

        let (client_events, _client_rx) = Recorder::new();
        let client =
            SecureSocket::connect(&params, "svc.chanlink.test", &config, client_events).unwrap();
        client.close();

        assert!(matches!(
            server_rx.recv_timeout(WAIT).unwrap(),
            Seen::Disconnect(DisconnectReason::Failed(_))
        ));
    }

    #[test]
    fn connect_to_closed_port_fails_fast() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let params = ConnectionParams {
            host_address: "127.0.0.1".into(),
            port,
        };
        let (events, _rx) = Recorder::new();
        let result = SecureSocket::connect(
            &params,
            "svc.chanlink.test",
            &SecureSocketConfig::default(),
            events,
        );
        assert!(matches!(result, Err(ChannelError::Connection(_))));
    }
}
