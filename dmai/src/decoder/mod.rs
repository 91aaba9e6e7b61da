// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! The decoder engine.
//!
//! The pipeline thread frames the incoming byte stream with a
//! [`StreamParser`], copies each access unit into a buffer of the input pool
//! and queues it. A dedicated worker thread owns the codec instance: it pops
//! work items, decodes them into buffers of the output pool and pushes every
//! displayable frame downstream as a [`Transport`].
//!
//! ```text
//!  chain ──► parser ──► input pool ──► WorkQueue ──► worker ──► codec
//!                                                      │
//!  Downstream ◄────────── Transport(output pool) ◄─────┘
//! ```
//!
//! Flushing, end of stream and shutdown all go through the queue: the worker
//! discards items while the flushing flag is raised, and a [`WorkItem::Drain`]
//! sentinel makes it flush the codec and emit what the codec still holds.

mod worker;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use tracing::{debug, error, info, trace};

use crate::codec::{CodecKind, OpenCodec};
use crate::config::DecoderConfig;
use crate::fifo::WorkQueue;
use crate::memory::Region;
use crate::parser::{Accumulator, StreamConfig, StreamParser};
use crate::pool::{BufferPool, Owners};
use crate::registry::DecoderEntry;
use crate::sync::FlushFlag;
use crate::transport::{FrameMeta, Transport};
use crate::{Error, Result};

use worker::{StartedPools, Worker};

/// Receives what the worker thread produces.
///
/// Called from the worker thread only.
pub trait Downstream: Send + Sync {
    /// Hands one decoded frame to the pipeline. The frame goes back to the
    /// output pool when the transport is dropped.
    fn push(&self, frame: Transport) -> Result<()>;

    /// Every frame queued before end of stream has been pushed.
    fn eos(&self);

    /// The engine aborted; called once.
    fn error(&self, err: &Error);

    /// The codec reported the channel count of the decoded audio.
    fn audio_channels(&self, _channels: u32) {}
}

/// Lifecycle of a [`DecoderEngine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Starting,
    Running,
    Flushing,
    Draining,
    Stopped,
    /// A fatal error stopped the worker. Terminal.
    Aborted,
}

/// What a bit error reported by the codec means for the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitErrorAction {
    /// Keep going with whatever the codec produced.
    Continue,
    /// Drop the output of this call and keep decoding.
    DropFrame,
    /// The codec cannot resynchronize; abort.
    Fatal,
}

/// How bit errors are treated for a codec kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitErrorPolicy {
    /// Video: an error that consumed none or all of the input leaves no way
    /// to find the next frame and is fatal. Partial consumption continues.
    Resync,
    /// Audio: warn and drop the frame.
    Drop,
}

impl BitErrorPolicy {
    pub fn for_kind(kind: CodecKind) -> Self {
        match kind {
            CodecKind::Video => BitErrorPolicy::Resync,
            CodecKind::Audio => BitErrorPolicy::Drop,
        }
    }

    /// Decides what a bit error on a call that consumed `consumed` of
    /// `input_len` bytes means. Errors during the drain call are ignored.
    pub fn on_bit_error(self, consumed: usize, input_len: usize, draining: bool) -> BitErrorAction {
        if draining {
            return BitErrorAction::Continue;
        }
        match self {
            BitErrorPolicy::Drop => BitErrorAction::DropFrame,
            BitErrorPolicy::Resync if consumed == 0 || consumed == input_len => {
                BitErrorAction::Fatal
            }
            BitErrorPolicy::Resync => BitErrorAction::Continue,
        }
    }
}

/// An input buffer queued for the worker.
///
/// Usually a buffer of the input pool; a frame too large for those gets a
/// plain region. Dropping a pool frame hands the buffer back: the codec
/// owner bit is cleared here, the pipeline bit by the transport right after.
pub(crate) struct InputFrame {
    transport: Transport,
}

impl InputFrame {
    fn data(&self) -> &[u8] {
        self.transport.as_ref()
    }

    fn meta(&self) -> FrameMeta {
        *self.transport.meta()
    }
}

impl Drop for InputFrame {
    fn drop(&mut self) {
        if let Some(buffer) = self.transport.pool_buffer()
            && let Err(err) = buffer.release(Owners::CODEC)
        {
            error!("Failed to release input buffer: {}", err);
        }
    }
}

/// Entry of the work queue.
pub(crate) enum WorkItem {
    Frame(InputFrame),
    /// End of the input: flush the codec and emit what it holds.
    Drain,
}

impl fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkItem::Frame(frame) => write!(f, "Frame({} bytes)", frame.transport.len()),
            WorkItem::Drain => write!(f, "Drain"),
        }
    }
}

/// State shared between the engine handle and its worker thread.
pub(crate) struct Shared {
    fifo: WorkQueue<WorkItem>,
    flushing: FlushFlag,
    shutdown: AtomicBool,
    paused: AtomicBool,
    state: Mutex<EngineState>,
    abort: Mutex<Option<String>>,
}

impl Shared {
    fn state(&self) -> EngineState {
        self.state
            .lock()
            .map(|state| *state)
            .unwrap_or(EngineState::Aborted)
    }

    /// Moves to `next` unless the engine already aborted.
    fn set_state(&self, next: EngineState) {
        if let Ok(mut state) = self.state.lock()
            && *state != EngineState::Aborted
            && *state != next
        {
            debug!(from = ?*state, to = ?next, "decoder state change");
            *state = next;
        }
    }

    fn abort_error(&self) -> Option<Error> {
        self.abort
            .lock()
            .ok()
            .and_then(|abort| abort.clone())
            .map(|reason| Error::HardwareFatal(format!("decoder aborted: {reason}")))
    }

    /// Records the first fatal error; returns `false` if one was already recorded.
    fn record_abort(&self, err: &Error) -> bool {
        let first = match self.abort.lock() {
            Ok(mut abort) if abort.is_none() => {
                *abort = Some(err.to_string());
                true
            }
            _ => false,
        };
        if let Ok(mut state) = self.state.lock() {
            *state = EngineState::Aborted;
        }
        first
    }
}

struct StreamState {
    parser: Box<dyn StreamParser>,
    acc: Accumulator,
    /// Metadata of the most recent input buffer; applied to the frames parsed out of it.
    meta: FrameMeta,
}

/// Copies a frame too large for the input pool into a region of its own.
fn oversized_input(stream: &mut StreamState, frame: &[u8], needed: usize) -> Result<Transport> {
    let region = Region::allocate(needed)?;
    // SAFETY: the region was just allocated and is not shared yet.
    let dest = unsafe { region.slice_mut(0, needed) };
    let written = stream.parser.custom_memcpy(dest, frame)?;
    Transport::view(Arc::new(region), 0, written)
}

struct WorkerHandle {
    thread: JoinHandle<()>,
    input_pool: BufferPool,
    output_pool: BufferPool,
}

/// Drives one decode session from stream start to [`DecoderEngine::exit`].
///
/// Every method takes `&self`; the engine is meant to be shared between the
/// streaming thread (`chain`, `eos`) and the thread delivering flush and
/// state-change events.
///
/// # Examples
///
/// ```no_run
/// use std::sync::Arc;
/// use dmai::config::DecoderConfig;
/// use dmai::decoder::{DecoderEngine, Downstream};
/// use dmai::engine::EngineLibrary;
/// use dmai::parser::StreamConfig;
/// use dmai::registry::find_decoder;
/// use dmai::transport::{FrameMeta, Transport};
///
/// struct Sink;
///
/// impl Downstream for Sink {
///     fn push(&self, frame: Transport) -> dmai::Result<()> {
///         println!("decoded {} bytes", frame.len());
///         Ok(())
///     }
///     fn eos(&self) {}
///     fn error(&self, err: &dmai::Error) {
///         eprintln!("{err}");
///     }
/// }
///
/// let entry = find_decoder("video/x-h264", None).unwrap();
/// let config = DecoderConfig {
///     codec_name: entry.codec_name.to_string(),
///     ..Default::default()
/// };
/// let engine = DecoderEngine::new(
///     entry,
///     config,
///     &StreamConfig::new("video/x-h264"),
///     Arc::new(EngineLibrary::load("libdmai-engine.so").unwrap()),
///     Arc::new(Sink),
/// )
/// .unwrap();
///
/// engine.chain(&[0, 0, 0, 1, 0x65, 0x88], FrameMeta::default()).unwrap();
/// engine.eos().unwrap();
/// engine.exit().unwrap();
/// ```
pub struct DecoderEngine {
    config: DecoderConfig,
    kind: CodecKind,
    opener: Arc<dyn OpenCodec>,
    downstream: Arc<dyn Downstream>,
    shared: Arc<Shared>,
    stream: Mutex<StreamState>,
    worker: Mutex<Option<WorkerHandle>>,
}

impl DecoderEngine {
    /// Creates an idle engine for the stream described by `stream`.
    ///
    /// Nothing is opened until the first [`Self::chain`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `config` is unusable.
    pub fn new(
        entry: &DecoderEntry,
        mut config: DecoderConfig,
        stream: &StreamConfig,
        opener: Arc<dyn OpenCodec>,
        downstream: Arc<dyn Downstream>,
    ) -> Result<Self> {
        if config.codec_name.is_empty() {
            config.codec_name = entry.codec_name.to_string();
        }
        config.validate()?;

        let flushing = FlushFlag::new();
        let mut parser = entry.parser.build(flushing.clone());
        parser.init(stream)?;
        debug!(
            codec = %config.codec_name,
            parser = parser.name(),
            media_type = %stream.media_type,
            "created decoder engine"
        );

        Ok(Self {
            kind: entry.kind,
            opener,
            downstream,
            shared: Arc::new(Shared {
                fifo: WorkQueue::new(config.fifo_capacity),
                flushing,
                shutdown: AtomicBool::new(false),
                paused: AtomicBool::new(false),
                state: Mutex::new(EngineState::Idle),
                abort: Mutex::new(None),
            }),
            stream: Mutex::new(StreamState {
                parser,
                acc: Accumulator::new(),
                meta: FrameMeta::default(),
            }),
            worker: Mutex::new(None),
            config,
        })
    }

    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    pub fn state(&self) -> EngineState {
        self.shared.state()
    }

    pub fn is_flushing(&self) -> bool {
        self.shared.flushing.is_raised()
    }

    /// Tracks whether the pipeline is paused; a paused pipeline may leave the
    /// worker blocked downstream, so flushes do not wait for it.
    pub fn set_paused(&self, paused: bool) {
        trace!(paused, "decoder pause state");
        self.shared.paused.store(paused, Ordering::SeqCst);
    }

    /// Accepts one chunk of the compressed stream.
    ///
    /// Starts the engine on first use. Input arriving while flushing is
    /// dropped.
    ///
    /// # Errors
    ///
    /// Returns the stored abort once the worker failed, and start-up errors.
    pub fn chain(&self, data: &[u8], meta: FrameMeta) -> Result<()> {
        if let Some(err) = self.shared.abort_error() {
            return Err(err);
        }
        if self.state() == EngineState::Stopped {
            return Err(Error::Other("decoder engine is stopped".into()));
        }
        if self.shared.flushing.is_raised() {
            trace!(len = data.len(), "dropping input while flushing");
            return Ok(());
        }
        let input_pool = self.ensure_started()?;

        let mut stream = self.lock_stream()?;
        stream.meta = meta;
        stream.acc.push(data);
        loop {
            let StreamState { parser, acc, .. } = &mut *stream;
            let Some(len) = parser.parse(acc) else {
                break;
            };
            if len == 0 {
                break;
            }
            let frame = stream.acc.take(len);
            self.submit(&mut stream, &input_pool, &frame)?;
        }
        Ok(())
    }

    /// Copies one access unit into an input buffer and queues it.
    fn submit(&self, stream: &mut StreamState, pool: &BufferPool, frame: &[u8]) -> Result<()> {
        let buffer = match pool.wait_free(Some(&self.shared.flushing)) {
            Ok(buffer) => buffer,
            Err(Error::Interrupted) => {
                debug!(len = frame.len(), "dropping frame, input pool interrupted");
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        // SAFETY: the buffer was just claimed; nobody else touches it until
        // it is queued.
        let dest = unsafe { buffer.as_mut_slice() };
        let mut transport = match stream.parser.custom_memcpy(dest, frame) {
            Ok(written) => {
                buffer.set_bytes_used(written);
                match Transport::wrap(buffer.clone(), Some(pool.wait_handle())) {
                    Ok(transport) => transport,
                    Err(err) => {
                        buffer.release(Owners::ALL)?;
                        return Err(err);
                    }
                }
            }
            Err(Error::Capacity { needed, available }) => {
                buffer.release(Owners::ALL)?;
                debug!(needed, available, "frame exceeds input buffers, copying it aside");
                oversized_input(stream, frame, needed)?
            }
            Err(err) => {
                buffer.release(Owners::ALL)?;
                return Err(err);
            }
        };
        *transport.meta_mut() = stream.meta;
        trace!(len = transport.len(), "queueing frame");

        match self
            .shared
            .fifo
            .push(WorkItem::Frame(InputFrame { transport }))
        {
            Ok(()) => Ok(()),
            Err(Error::Interrupted) => {
                debug!("work queue closed, dropping frame");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Discards everything queued and makes the engine drop input until
    /// [`Self::flush_stop`].
    pub fn flush_start(&self) -> Result<()> {
        debug!("flush start");
        self.shared.flushing.raise();
        self.shared.set_state(EngineState::Flushing);

        let pools = self
            .lock_worker()?
            .as_ref()
            .map(|worker| (worker.input_pool.clone(), worker.output_pool.clone()));
        if let Some((input_pool, output_pool)) = &pools {
            // Unblock a chain waiting for input space and a worker waiting
            // for an output buffer.
            input_pool.interrupt()?;
            output_pool.wake_all();
        }

        {
            let mut stream = self.lock_stream()?;
            stream.parser.flush_start();
            stream.acc.clear();
        }

        let paused = self.shared.paused.load(Ordering::SeqCst);
        if pools.is_some() && !paused {
            trace!("waiting for the worker to drain the queue");
            self.shared.fifo.wait_drained()?;
        }
        let mut discarded = 0;
        while let Some(item) = self.shared.fifo.try_pop()? {
            drop(item);
            discarded += 1;
        }
        if discarded > 0 {
            debug!(discarded, "discarded queued work items");
        }
        Ok(())
    }

    /// Accepts input again after [`Self::flush_start`].
    pub fn flush_stop(&self) -> Result<()> {
        debug!("flush stop");
        self.shared.flushing.clear();
        self.lock_stream()?.parser.flush_stop();
        if let Some(worker) = self.lock_worker()?.as_ref() {
            worker.input_pool.resume()?;
            self.shared.set_state(EngineState::Running);
        } else {
            self.shared.set_state(EngineState::Idle);
        }
        Ok(())
    }

    /// Queues what the parser still holds followed by the drain sentinel.
    ///
    /// End of stream is signalled downstream once the worker has emitted the
    /// frames the codec was holding. If no data was ever decoded it is
    /// signalled right away.
    pub fn eos(&self) -> Result<()> {
        if let Some(err) = self.shared.abort_error() {
            return Err(err);
        }
        let input_pool = match self.lock_worker()?.as_ref() {
            Some(worker) => worker.input_pool.clone(),
            None => {
                debug!("end of stream before any input");
                self.downstream.eos();
                return Ok(());
            }
        };

        info!("draining decoder");
        self.shared.set_state(EngineState::Draining);
        {
            let mut stream = self.lock_stream()?;
            loop {
                let StreamState { parser, acc, .. } = &mut *stream;
                let len = parser.drain(acc);
                if len == 0 {
                    break;
                }
                let frame = stream.acc.take(len);
                self.submit(&mut stream, &input_pool, &frame)?;
            }
        }
        self.push_drain()
    }

    fn push_drain(&self) -> Result<()> {
        match self.shared.fifo.push(WorkItem::Drain) {
            Ok(()) => Ok(()),
            Err(Error::Interrupted) => {
                debug!("work queue closed, not queueing drain");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Shuts the engine down: flushes, lets the worker drain the codec, joins
    /// it and destroys both pools.
    pub fn exit(&self) -> Result<()> {
        if self.lock_worker()?.is_none() {
            self.shared.set_state(EngineState::Stopped);
            return Ok(());
        }
        info!("shutting down decoder");
        self.flush_start()?;
        self.flush_stop()?;
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.push_drain()?;

        let Some(worker) = self.lock_worker()?.take() else {
            return Ok(());
        };
        if worker.thread.join().is_err() {
            error!("Decode thread panicked");
        }
        while let Some(item) = self.shared.fifo.try_pop()? {
            drop(item);
        }

        worker.output_pool.destroy()?;
        worker.input_pool.destroy()?;
        {
            let mut stream = self.lock_stream()?;
            stream.parser.clean();
            stream.acc.clear();
        }
        self.shared.set_state(EngineState::Stopped);
        debug!("decoder stopped");
        Ok(())
    }

    /// Returns the input pool, starting the worker if needed.
    fn ensure_started(&self) -> Result<BufferPool> {
        let mut worker = self.lock_worker()?;
        if let Some(worker) = worker.as_ref() {
            return Ok(worker.input_pool.clone());
        }
        let started = self.start()?;
        let input_pool = started.input_pool.clone();
        *worker = Some(started);
        Ok(input_pool)
    }

    fn start(&self) -> Result<WorkerHandle> {
        info!(
            engine = %self.config.engine_name,
            codec = %self.config.codec_name,
            "starting decoder"
        );
        self.shared.set_state(EngineState::Starting);

        let (started_tx, started_rx) = mpsc::channel();
        let worker = Worker::new(
            self.shared.clone(),
            self.config.clone(),
            self.kind,
            self.opener.clone(),
            self.downstream.clone(),
        );
        let thread = thread::Builder::new()
            .name("dmai-decode".into())
            .spawn(move || worker.run(started_tx))
            .map_err(|err| {
                self.shared.set_state(EngineState::Stopped);
                Error::Allocation(format!("failed to spawn decode thread: {err}"))
            })?;

        let started = match started_rx.recv() {
            Ok(result) => result,
            Err(_) => Err(Error::Other("decode thread exited during start".into())),
        };
        match started {
            Ok(StartedPools {
                input_pool,
                output_pool,
            }) => {
                self.shared.set_state(EngineState::Running);
                Ok(WorkerHandle {
                    thread,
                    input_pool,
                    output_pool,
                })
            }
            Err(err) => {
                error!("Failed to start decoder: {}", err);
                if thread.join().is_err() {
                    error!("Decode thread panicked during start");
                }
                self.shared.set_state(EngineState::Stopped);
                Err(err)
            }
        }
    }

    fn lock_stream(&self) -> Result<MutexGuard<'_, StreamState>> {
        self.stream.lock().map_err(|_| Error::poisoned("decoder stream"))
    }

    fn lock_worker(&self) -> Result<MutexGuard<'_, Option<WorkerHandle>>> {
        self.worker.lock().map_err(|_| Error::poisoned("decoder worker"))
    }
}

impl Drop for DecoderEngine {
    fn drop(&mut self) {
        if matches!(self.worker.get_mut(), Ok(Some(_)))
            && let Err(err) = self.exit()
        {
            error!("Failed to shut down decoder: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn video_bit_error_is_fatal_only_without_progress() {
        let policy = BitErrorPolicy::for_kind(CodecKind::Video);
        assert_eq!(policy.on_bit_error(0, 100, false), BitErrorAction::Fatal);
        assert_eq!(policy.on_bit_error(100, 100, false), BitErrorAction::Fatal);
        assert_eq!(policy.on_bit_error(40, 100, false), BitErrorAction::Continue);
        assert_eq!(policy.on_bit_error(0, 0, true), BitErrorAction::Continue);
    }

    #[test]
    fn audio_bit_error_drops_the_frame() {
        let policy = BitErrorPolicy::for_kind(CodecKind::Audio);
        assert_eq!(policy.on_bit_error(0, 100, false), BitErrorAction::DropFrame);
        assert_eq!(policy.on_bit_error(50, 100, false), BitErrorAction::DropFrame);
        assert_eq!(policy.on_bit_error(0, 0, true), BitErrorAction::Continue);
    }

    #[test]
    fn aborted_state_is_terminal() {
        let shared = Shared {
            fifo: WorkQueue::new(2),
            flushing: FlushFlag::new(),
            shutdown: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            state: Mutex::new(EngineState::Running),
            abort: Mutex::new(None),
        };
        assert!(shared.record_abort(&Error::HardwareFatal("dsp".into())));
        assert!(!shared.record_abort(&Error::HardwareFatal("again".into())));
        shared.set_state(EngineState::Stopped);
        assert_eq!(shared.state(), EngineState::Aborted);
        let err = shared.abort_error().unwrap();
        assert!(err.to_string().contains("dsp"));
    }
}
