use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use civnet_core::constants::{INITIAL_STREAM_WINDOW, MAX_FRAME_PAYLOAD};
use civnet_core::types::Direction;
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::frame::{Frame, FrameKind, SESSION_STREAM_ID};
use super::{MuxError, MuxedSession};
use crate::config::MuxConfig;
use crate::secure::{SecureChannel, SecureReader, SecureWriter};

/// Room left in a secure-channel message for the frame header.
const MAX_DATA_CHUNK: usize = MAX_FRAME_PAYLOAD - 64;

struct StreamSlot {
    /// `None` once the remote side has closed its half.
    inbound: Option<mpsc::UnboundedSender<Vec<u8>>>,
    local_closed: bool,
    reset: Arc<AtomicBool>,
    /// Bytes we may still send before the remote grants more.
    send_window: u32,
    /// Bytes the remote may still send before we grant more.
    recv_window: u32,
    /// Wakes a writer waiting for credit.
    credit: Arc<Notify>,
}

impl StreamSlot {
    fn mark_reset(&self) {
        self.reset.store(true, Ordering::SeqCst);
        self.credit.notify_one();
    }
}

struct SessionState {
    streams: HashMap<u32, StreamSlot>,
    /// Next id this side will open; `None` once the id space is spent.
    next_local_id: Option<u32>,
    last_remote_id: u32,
    pings: HashMap<u64, oneshot::Sender<()>>,
    next_ping: u64,
    last_activity: Instant,
    closed: bool,
}

struct Shared {
    state: Mutex<SessionState>,
    outbound: mpsc::UnboundedSender<Frame>,
    shutdown: watch::Sender<bool>,
    direction: Direction,
    config: MuxConfig,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn touch(&self) {
        self.lock().last_activity = Instant::now();
    }

    /// Queue a frame unless the session is closing.
    fn send(&self, frame: Frame) -> Result<(), MuxError> {
        if self.lock().closed {
            return Err(MuxError::Closed);
        }
        self.outbound.send(frame).map_err(|_| MuxError::Closed)
    }

    fn is_remote_id(&self, id: u32) -> bool {
        let remote_is_odd = self.direction == Direction::Inbound;
        id != SESSION_STREAM_ID && (id % 2 == 1) == remote_is_odd
    }

    /// Credit granted on top of the initial window when a stream starts.
    fn window_growth(&self) -> u32 {
        self.config.stream_window.saturating_sub(INITIAL_STREAM_WINDOW)
    }

    /// Tear down every stream and wake both tasks. Idempotent.
    fn terminate(&self) {
        {
            let mut state = self.lock();
            state.closed = true;
            for (_, slot) in state.streams.drain() {
                slot.credit.notify_one();
            }
            state.pings.clear();
        }
        self.shutdown.send_replace(true);
    }

    /// Track a new stream. Both directions start at the initial window; the
    /// caller announces our larger receive window to the remote.
    fn register_stream(self: &Arc<Self>, state: &mut SessionState, id: u32) -> MuxStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let reset = Arc::new(AtomicBool::new(false));
        let credit = Arc::new(Notify::new());
        state.streams.insert(
            id,
            StreamSlot {
                inbound: Some(tx),
                local_closed: false,
                reset: reset.clone(),
                send_window: INITIAL_STREAM_WINDOW,
                recv_window: INITIAL_STREAM_WINDOW.saturating_add(self.window_growth()),
                credit: credit.clone(),
            },
        );
        MuxStream { id, shared: self.clone(), inbound: rx, reset, credit, unacked: 0, local_closed: false }
    }
}

/// A live multiplexed session over one secure channel.
pub struct MuxSession {
    shared: Arc<Shared>,
    inbound: tokio::sync::Mutex<mpsc::Receiver<MuxStream>>,
    writer: Mutex<Option<JoinHandle<Result<(), MuxError>>>>,
}

impl MuxSession {
    pub(super) fn spawn(channel: SecureChannel, direction: Direction, config: MuxConfig) -> Self {
        let remote = channel.remote_peer();
        let (reader, writer) = channel.into_split();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::channel(config.max_streams);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let first_id = match direction {
            Direction::Outbound => 1,
            Direction::Inbound => 2,
        };
        let shared = Arc::new(Shared {
            state: Mutex::new(SessionState {
                streams: HashMap::new(),
                next_local_id: Some(first_id),
                last_remote_id: 0,
                pings: HashMap::new(),
                next_ping: 0,
                last_activity: Instant::now(),
                closed: false,
            }),
            outbound: out_tx,
            shutdown,
            direction,
            config,
        });

        tokio::spawn(read_loop(reader, inbound_tx, shutdown_rx.clone(), shared.clone()));
        let writer = tokio::spawn(write_loop(writer, out_rx, shutdown_rx, shared.clone()));
        debug!(peer = %remote, %direction, "mux session started");

        Self {
            shared,
            inbound: tokio::sync::Mutex::new(inbound_rx),
            writer: Mutex::new(Some(writer)),
        }
    }

    /// Number of streams currently open in either direction.
    pub fn stream_count(&self) -> usize {
        self.shared.lock().streams.len()
    }
}

impl Drop for MuxSession {
    fn drop(&mut self) {
        self.shared.terminate();
    }
}

#[async_trait]
impl MuxedSession for MuxSession {
    async fn open_stream(&self) -> Result<MuxStream, MuxError> {
        let stream = {
            let mut state = self.shared.lock();
            if state.closed {
                return Err(MuxError::Closed);
            }
            if state.streams.len() >= self.shared.config.max_streams {
                return Err(MuxError::TooManyStreams(self.shared.config.max_streams));
            }
            let id = state.next_local_id.ok_or(MuxError::IdsExhausted)?;
            state.next_local_id = id.checked_add(2);
            self.shared.register_stream(&mut state, id)
        };
        self.shared.send(Frame::open(stream.id, self.shared.window_growth()))?;
        trace!(stream = stream.id, "opened outbound stream");
        Ok(stream)
    }

    async fn next_inbound(&self) -> Option<MuxStream> {
        self.inbound.lock().await.recv().await
    }

    async fn ping(&self) -> Result<Duration, MuxError> {
        let (tx, rx) = oneshot::channel();
        let nonce = {
            let mut state = self.shared.lock();
            if state.closed {
                return Err(MuxError::Closed);
            }
            let nonce = state.next_ping;
            state.next_ping = state.next_ping.wrapping_add(1);
            state.pings.insert(nonce, tx);
            nonce
        };
        let started = Instant::now();
        self.shared.send(Frame::ping(nonce))?;
        rx.await.map_err(|_| MuxError::Closed)?;
        Ok(started.elapsed())
    }

    async fn close(&self) -> Result<(), MuxError> {
        {
            let mut state = self.shared.lock();
            if !state.closed {
                state.closed = true;
                let _ = self.shared.outbound.send(Frame::go_away());
            }
            for slot in state.streams.values() {
                slot.credit.notify_one();
            }
        }
        self.shared.shutdown.send_replace(true);

        let writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner).take();
        match writer {
            Some(handle) => handle.await.map_err(|_| MuxError::Closed)?,
            None => Ok(()),
        }
    }

    fn last_activity(&self) -> Instant {
        self.shared.lock().last_activity
    }

    fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }
}

// ── Tasks ────────────────────────────────────────────────────────────────────

async fn write_loop(
    mut writer: SecureWriter,
    mut frames: mpsc::UnboundedReceiver<Frame>,
    mut shutdown: watch::Receiver<bool>,
    shared: Arc<Shared>,
) -> Result<(), MuxError> {
    let result: Result<(), MuxError> = async {
        loop {
            tokio::select! {
                frame = frames.recv() => match frame {
                    Some(frame) => write_one(&mut writer, &frame, &shared).await?,
                    None => return Ok(()),
                },
                _ = shutdown.changed() => {
                    // Flush whatever was queued before the shutdown, GoAway included.
                    while let Ok(frame) = frames.try_recv() {
                        write_one(&mut writer, &frame, &shared).await?;
                    }
                    return Ok(());
                }
            }
        }
    }
    .await;

    let _ = writer.shutdown().await;
    shared.terminate();
    if let Err(e) = &result {
        debug!(error = %e, "mux writer stopped");
    }
    result
}

async fn write_one(writer: &mut SecureWriter, frame: &Frame, shared: &Shared) -> Result<(), MuxError> {
    writer.send(&frame.encode()?).await?;
    shared.touch();
    Ok(())
}

async fn read_loop(
    mut reader: SecureReader,
    inbound: mpsc::Sender<MuxStream>,
    mut shutdown: watch::Receiver<bool>,
    shared: Arc<Shared>,
) {
    loop {
        let message = tokio::select! {
            message = reader.recv() => message,
            _ = shutdown.changed() => break,
        };
        let bytes = match message {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                debug!("mux channel closed by remote");
                break;
            }
            Err(e) => {
                debug!(error = %e, "mux channel failed");
                break;
            }
        };
        let frame = match Frame::decode(&bytes) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "dropping session on undecodable frame");
                break;
            }
        };
        shared.touch();
        if !dispatch(&shared, frame, &inbound) {
            break;
        }
    }
    shared.terminate();
}

/// Route one inbound frame. Returns `false` when the session must end.
fn dispatch(shared: &Arc<Shared>, frame: Frame, inbound: &mpsc::Sender<MuxStream>) -> bool {
    let id = frame.stream_id;
    let mut state = shared.lock();
    match frame.kind {
        FrameKind::GoAway => return false,
        FrameKind::Ping => {
            drop(state);
            let _ = shared.outbound.send(Frame::pong(frame.payload));
        }
        FrameKind::Pong => {
            if let Some(waiter) = frame.nonce().and_then(|n| state.pings.remove(&n)) {
                let _ = waiter.send(());
            }
        }
        FrameKind::Open => {
            let acceptable = shared.is_remote_id(id)
                && id > state.last_remote_id
                && state.streams.len() < shared.config.max_streams
                && !state.closed;
            if !acceptable {
                drop(state);
                trace!(stream = id, "refusing inbound stream");
                let _ = shared.outbound.send(Frame::new(id, FrameKind::Reset));
                return true;
            }
            state.last_remote_id = id;
            let stream = shared.register_stream(&mut state, id);
            if let Some(slot) = state.streams.get_mut(&id) {
                slot.send_window = slot.send_window.saturating_add(frame.credit());
            }
            drop(state);
            let growth = shared.window_growth();
            if growth > 0 {
                let _ = shared.outbound.send(Frame::window_update(id, growth));
            }
            // A full backlog drops the stream, which resets it.
            let _ = inbound.try_send(stream);
        }
        FrameKind::WindowUpdate => {
            if let Some(slot) = state.streams.get_mut(&id) {
                slot.send_window = slot.send_window.saturating_add(frame.credit());
                slot.credit.notify_one();
            }
        }
        FrameKind::Data => {
            let len = frame.payload.len();
            let overrun = match state.streams.get_mut(&id) {
                Some(slot) if len > slot.recv_window as usize => true,
                Some(slot) => {
                    slot.recv_window -= len as u32;
                    if let Some(tx) = &slot.inbound {
                        let _ = tx.send(frame.payload);
                    }
                    false
                }
                None => false,
            };
            if overrun {
                if let Some(slot) = state.streams.remove(&id) {
                    slot.mark_reset();
                }
                drop(state);
                warn!(stream = id, len, "data beyond the receive window, resetting stream");
                let _ = shared.outbound.send(Frame::new(id, FrameKind::Reset));
            }
        }
        FrameKind::Close => {
            let finished = match state.streams.get_mut(&id) {
                Some(slot) => {
                    slot.inbound = None;
                    slot.local_closed
                }
                None => false,
            };
            if finished {
                state.streams.remove(&id);
            }
        }
        FrameKind::Reset => {
            if let Some(slot) = state.streams.remove(&id) {
                slot.mark_reset();
            }
        }
    }
    true
}

// ── Streams ──────────────────────────────────────────────────────────────────

/// One logical stream within a session.
///
/// Message-oriented: each `read` returns the payload of one data frame as
/// the remote wrote it, possibly split into several chunks for large writes.
/// `write` waits while the remote's receive window is spent.
/// Dropping a stream that was not closed resets it.
pub struct MuxStream {
    id: u32,
    shared: Arc<Shared>,
    inbound: mpsc::UnboundedReceiver<Vec<u8>>,
    reset: Arc<AtomicBool>,
    credit: Arc<Notify>,
    /// Bytes read since the last window update.
    unacked: u32,
    local_closed: bool,
}

impl MuxStream {
    pub fn id(&self) -> u32 {
        self.id
    }

    fn was_reset(&self) -> bool {
        self.reset.load(Ordering::SeqCst)
    }

    /// Next chunk from the remote. `Ok(None)` after the remote closed its
    /// half or the session ended.
    pub async fn read(&mut self) -> Result<Option<Vec<u8>>, MuxError> {
        match self.inbound.recv().await {
            Some(bytes) => {
                self.consumed(bytes.len());
                Ok(Some(bytes))
            }
            None if self.was_reset() => Err(MuxError::StreamReset(self.id)),
            None => Ok(None),
        }
    }

    /// Read until the remote closes, concatenating every chunk.
    pub async fn read_to_end(&mut self) -> Result<Vec<u8>, MuxError> {
        let mut out = Vec::new();
        while let Some(chunk) = self.read().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }

    /// Return credit to the remote once half the window has been read.
    fn consumed(&mut self, len: usize) {
        self.unacked = self.unacked.saturating_add(len as u32);
        if self.unacked < self.shared.config.stream_window / 2 {
            return;
        }
        let credit = std::mem::take(&mut self.unacked);
        {
            let mut state = self.shared.lock();
            match state.streams.get_mut(&self.id) {
                Some(slot) if slot.inbound.is_some() => {
                    slot.recv_window = slot.recv_window.saturating_add(credit);
                }
                _ => return,
            }
        }
        let _ = self.shared.outbound.send(Frame::window_update(self.id, credit));
    }

    /// Wait for send credit and take up to `want` bytes of it.
    async fn reserve(&self, want: usize) -> Result<usize, MuxError> {
        loop {
            {
                let mut state = self.shared.lock();
                if state.closed {
                    return Err(MuxError::Closed);
                }
                match state.streams.get_mut(&self.id) {
                    Some(slot) if slot.send_window > 0 => {
                        let n = want.min(slot.send_window as usize);
                        slot.send_window -= n as u32;
                        return Ok(n);
                    }
                    Some(_) => {}
                    None if self.was_reset() => return Err(MuxError::StreamReset(self.id)),
                    None => return Err(MuxError::StreamClosed(self.id)),
                }
            }
            trace!(stream = self.id, "send window spent, waiting");
            self.credit.notified().await;
        }
    }

    pub async fn write(&mut self, data: &[u8]) -> Result<(), MuxError> {
        if self.was_reset() {
            return Err(MuxError::StreamReset(self.id));
        }
        if self.local_closed {
            return Err(MuxError::StreamClosed(self.id));
        }
        let mut rest = data;
        while !rest.is_empty() {
            let n = self.reserve(rest.len().min(MAX_DATA_CHUNK)).await?;
            let (chunk, tail) = rest.split_at(n);
            self.shared.send(Frame::data(self.id, chunk.to_vec()))?;
            rest = tail;
        }
        Ok(())
    }

    /// Close the local half. Reading continues until the remote closes too.
    pub async fn close(&mut self) -> Result<(), MuxError> {
        if self.local_closed {
            return Ok(());
        }
        self.local_closed = true;
        {
            let mut state = self.shared.lock();
            let finished = match state.streams.get_mut(&self.id) {
                Some(slot) => {
                    slot.local_closed = true;
                    slot.inbound.is_none()
                }
                None => false,
            };
            if finished {
                state.streams.remove(&self.id);
            }
        }
        self.shared.send(Frame::new(self.id, FrameKind::Close))
    }
}

impl Drop for MuxStream {
    fn drop(&mut self) {
        let removed = self.shared.lock().streams.remove(&self.id);
        if removed.is_some() && !self.local_closed {
            let _ = self.shared.send(Frame::new(self.id, FrameKind::Reset));
        }
    }
}

impl std::fmt::Debug for MuxStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxStream").field("id", &self.id).field("local_closed", &self.local_closed).finish()
    }
}
