//! Length-prefixed message pipe over one end of a socket pair.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use chanlink_frame::{FrameConfig, FrameError, FrameReader, FrameWriter};
use chanlink_transport::IpcStream;
use tracing::{debug, trace, warn};

use crate::error::Result;
use crate::link::{DisconnectReason, EventGate, TransportEvents};
use crate::protocol::CLOSE_SENTINEL;

/// Bidirectional framed text pipe.
///
/// A background thread reads frames and hands them to the event sink in
/// arrival order. Writes are serialized so concurrent writers never
/// interleave partial frames. Cloning shares the same pipe.
#[derive(Clone)]
pub struct FramedPipe {
    inner: Arc<PipeInner>,
}

struct PipeInner {
    writer: Mutex<FrameWriter<IpcStream>>,
    control: IpcStream,
    closed: AtomicBool,
    gate: EventGate,
}

impl FramedPipe {
    /// Take ownership of `stream` and start reading from it.
    pub fn open(stream: IpcStream, events: Arc<dyn TransportEvents>) -> Result<Self> {
        Self::with_config(stream, FrameConfig::default(), events)
    }

    pub fn with_config(
        stream: IpcStream,
        config: FrameConfig,
        events: Arc<dyn TransportEvents>,
    ) -> Result<Self> {
        let reader = FrameReader::with_config(stream.try_clone()?, config.clone());
        let control = stream.try_clone()?;
        let writer = FrameWriter::with_config(stream, config);

        let inner = Arc::new(PipeInner {
            writer: Mutex::new(writer),
            control,
            closed: AtomicBool::new(false),
            gate: EventGate::new(events),
        });

        let reader_inner = Arc::clone(&inner);
        thread::Builder::new()
            .name("chanlink-pipe-reader".to_string())
            .spawn(move || reader_inner.read_loop(reader))
            .map_err(chanlink_transport::TransportError::Io)?;

        debug!("framed pipe opened");
        Ok(Self { inner })
    }

    /// Write one message. On failure the pipe is closed and `false` returned.
    pub fn write(&self, message: &str) -> bool {
        if self.inner.closed.load(Ordering::Acquire) {
            return false;
        }
        let result = {
            let mut writer = self.inner.writer.lock().unwrap_or_else(|e| e.into_inner());
            writer.send_text(message)
        };
        match result {
            Ok(()) => true,
            Err(err) => {
                warn!(error = %err, "framed pipe write failed");
                self.inner
                    .shutdown(DisconnectReason::Failed(format!("write failed: {err}")));
                false
            }
        }
    }

    /// Send the close sentinel and close.
    pub fn close_gracefully(&self) -> bool {
        let sent = self.write(CLOSE_SENTINEL);
        self.close();
        sent
    }

    /// Close both directions. Safe from any thread, idempotent.
    pub fn close(&self) {
        self.inner.shutdown(DisconnectReason::LocalClose);
    }

    pub fn is_open(&self) -> bool {
        !self.inner.closed.load(Ordering::Acquire)
    }
}

impl PipeInner {
    fn read_loop(&self, mut reader: FrameReader<IpcStream>) {
        loop {
            match reader.read_frame().and_then(|frame| frame.into_text()) {
                Ok(message) if message == CLOSE_SENTINEL => {
                    debug!("framed pipe peer sent close");
                    self.shutdown(DisconnectReason::CloseSignal);
                    return;
                }
                Ok(message) => {
                    trace!(len = message.len(), "framed pipe message");
                    self.gate.message(message);
                }
                Err(FrameError::ConnectionClosed) => {
                    self.shutdown(DisconnectReason::Failed(
                        "peer closed pipe without close signal".to_string(),
                    ));
                    return;
                }
                Err(err) => {
                    if !self.closed.load(Ordering::Acquire) {
                        warn!(error = %err, "framed pipe read failed");
                    }
                    self.shutdown(DisconnectReason::Failed(err.to_string()));
                    return;
                }
            }
        }
    }

    fn shutdown(&self, reason: DisconnectReason) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(err) = self.control.shutdown() {
            debug!(error = %err, "framed pipe shutdown");
        }
        self.gate.disconnect(reason);
    }
}
