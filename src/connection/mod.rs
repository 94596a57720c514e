//! Framed duplex channel between a client and a worker.
//!
//! [`Connection`] owns a transport plus an outgoing queue: frames sent before
//! the transport is attached are kept and written, in order, as soon as it is.
//! A connection can be split into a [`FrameSource`] and a [`FrameSink`] so a
//! reader task and a writer task can drive it independently; reading can be
//! paused and resumed through a [`Suspender`] without closing the transport.

pub mod backend;
mod error;
pub mod frame;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::watch;

pub use backend::{Address, BackendState, ChannelBackend, Transport, TransportKind};
pub use error::{ConnectionError, ConnectionResult};
pub use frame::{Frame, FrameReader, FrameWriter, HEADER_LEN, MAX_PAYLOAD};

type Reader = FrameReader<ReadHalf<Transport>>;
type Writer = FrameWriter<WriteHalf<Transport>>;

/// Pauses and resumes reading on a channel.
#[derive(Clone)]
pub struct Suspender {
    tx: Arc<watch::Sender<bool>>,
}

impl Suspender {
    fn new() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (Self { tx: Arc::new(tx) }, rx)
    }

    pub fn suspend(&self) {
        self.tx.send_replace(true);
    }

    pub fn resume(&self) {
        self.tx.send_replace(false);
    }

    pub fn is_suspended(&self) -> bool {
        *self.tx.borrow()
    }
}

async fn wait_resumed(gate: &mut watch::Receiver<bool>) {
    // A dropped suspender can never resume; treat it as resumed.
    let _ = gate.wait_for(|suspended| !*suspended).await;
}

/// A framed channel.
pub struct Connection {
    reader: Option<Reader>,
    writer: Option<Writer>,
    outgoing: VecDeque<Frame>,
    suspender: Suspender,
    gate: watch::Receiver<bool>,
    closed: bool,
}

impl Default for Connection {
    fn default() -> Self {
        Self::new()
    }
}

impl Connection {
    /// An unattached channel; sends are queued until [`attach`](Self::attach).
    pub fn new() -> Self {
        let (suspender, gate) = Suspender::new();
        Self {
            reader: None,
            writer: None,
            outgoing: VecDeque::new(),
            suspender,
            gate,
            closed: false,
        }
    }

    pub fn from_transport(transport: Transport) -> Self {
        let mut conn = Self::new();
        let (read, write) = tokio::io::split(transport);
        conn.reader = Some(FrameReader::new(read));
        conn.writer = Some(FrameWriter::new(write));
        conn
    }

    /// Connect to a listening peer.
    pub async fn connect(address: &Address, timeout: Duration) -> ConnectionResult<Self> {
        let mut backend = ChannelBackend::new(address.kind());
        let transport = backend.connect(address, timeout).await?;
        Ok(Self::from_transport(transport))
    }

    /// Attach a transport and flush every queued frame.
    pub async fn attach(&mut self, transport: Transport) -> ConnectionResult<()> {
        let (read, write) = tokio::io::split(transport);
        self.reader = Some(FrameReader::new(read));
        self.writer = Some(FrameWriter::new(write));
        self.closed = false;
        self.drain().await
    }

    pub fn is_connected(&self) -> bool {
        !self.closed && self.writer.is_some()
    }

    /// Number of frames waiting for a transport.
    pub fn queued(&self) -> usize {
        self.outgoing.len()
    }

    /// Send a frame, or queue it if no transport is attached yet.
    pub async fn send(&mut self, code: u8, payload: Vec<u8>) -> ConnectionResult<()> {
        self.send_frame(Frame::new(code, payload)).await
    }

    pub async fn send_frame(&mut self, frame: Frame) -> ConnectionResult<()> {
        if self.closed {
            return Err(ConnectionError::Closed);
        }
        if frame.payload.len() > MAX_PAYLOAD {
            return Err(ConnectionError::PayloadTooLarge(frame.payload.len()));
        }
        self.outgoing.push_back(frame);
        if self.writer.is_some() {
            self.drain().await?;
        }
        Ok(())
    }

    async fn drain(&mut self) -> ConnectionResult<()> {
        let Some(writer) = self.writer.as_mut() else {
            return Ok(());
        };
        while let Some(frame) = self.outgoing.front() {
            if let Err(err) = writer.write_frame(frame).await {
                tracing::debug!(error = %err, "channel write failed");
                self.mark_closed();
                return Err(err);
            }
            self.outgoing.pop_front();
        }
        Ok(())
    }

    /// Next frame, or `None` once the peer is gone. Waits while suspended.
    pub async fn receive(&mut self) -> ConnectionResult<Option<Frame>> {
        if self.closed {
            return Ok(None);
        }
        wait_resumed(&mut self.gate).await;
        let Some(reader) = self.reader.as_mut() else {
            return Err(ConnectionError::NotConnected);
        };
        match reader.read_frame().await {
            Ok(Some(frame)) => Ok(Some(frame)),
            Ok(None) => {
                self.mark_closed();
                Ok(None)
            }
            Err(err) if err.is_disconnect() => {
                self.mark_closed();
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    pub fn suspend(&self) {
        self.suspender.suspend();
    }

    pub fn resume(&self) {
        self.suspender.resume();
    }

    pub fn is_suspended(&self) -> bool {
        self.suspender.is_suspended()
    }

    /// Handle for pausing this channel from elsewhere.
    pub fn suspender(&self) -> Suspender {
        self.suspender.clone()
    }

    /// Shut the transport down. Calling this more than once is harmless.
    pub async fn close(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            let _ = writer.shutdown().await;
        }
        self.mark_closed();
    }

    fn mark_closed(&mut self) {
        self.closed = true;
        self.reader = None;
        self.writer = None;
        self.outgoing.clear();
    }

    /// Split into independent read and write sides. Queued frames stay with
    /// the sink and are written before anything sent later.
    pub fn into_split(mut self) -> ConnectionResult<(FrameSource, FrameSink)> {
        let reader = self.reader.take().ok_or(ConnectionError::NotConnected)?;
        let writer = self.writer.take().ok_or(ConnectionError::NotConnected)?;
        let source = FrameSource {
            reader,
            gate: self.gate.clone(),
        };
        let sink = FrameSink {
            writer,
            pending: std::mem::take(&mut self.outgoing),
        };
        Ok((source, sink))
    }
}

/// Read side of a split channel.
pub struct FrameSource {
    reader: Reader,
    gate: watch::Receiver<bool>,
}

impl FrameSource {
    /// Next frame, `None` at end of channel. A frame read while the channel
    /// is suspended is held back until it resumes; the end of the channel is
    /// reported at once.
    pub async fn next(&mut self) -> Option<Frame> {
        wait_resumed(&mut self.gate).await;
        match self.reader.read_frame().await {
            Ok(Some(frame)) => {
                wait_resumed(&mut self.gate).await;
                Some(frame)
            }
            Ok(None) => None,
            Err(err) => {
                tracing::debug!(error = %err, "channel read failed");
                None
            }
        }
    }
}

/// Write side of a split channel.
pub struct FrameSink {
    writer: Writer,
    pending: VecDeque<Frame>,
}

impl FrameSink {
    pub async fn send(&mut self, frame: Frame) -> ConnectionResult<()> {
        while let Some(queued) = self.pending.pop_front() {
            self.writer.write_frame(&queued).await?;
        }
        self.writer.write_frame(&frame).await
    }

    pub async fn close(&mut self) {
        let _ = self.writer.shutdown().await;
    }
}
