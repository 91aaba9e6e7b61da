// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! The decode thread. It is the only code that ever calls into the codec.

use std::io;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::sync::mpsc::Sender;
use std::time::Duration;

use tracing::{debug, error, info, trace, warn};

use super::{BitErrorAction, BitErrorPolicy, Downstream, EngineState, InputFrame, Shared, WorkItem};
use crate::codec::{Codec, CodecKind, CodecStatus, DecoderParams, OpenCodec};
use crate::config::DecoderConfig;
use crate::pool::{BufferAttrs, BufferPool, GraphicsAttrs, Owners, PoolBuffer};
use crate::transport::{FrameMeta, Transport};
use crate::{Error, Result};

/// Pools created by the worker, handed back to the engine once start-up succeeded.
pub(super) struct StartedPools {
    pub input_pool: BufferPool,
    pub output_pool: BufferPool,
}

/// Moves the calling thread to the FIFO real-time class at its highest
/// priority; returns that priority.
#[cfg(unix)]
fn raise_priority() -> io::Result<i32> {
    // SAFETY: only the calling thread's own scheduling is changed, from a
    // fully initialized parameter block.
    unsafe {
        let priority = libc::sched_get_priority_max(libc::SCHED_FIFO);
        if priority < 0 {
            return Err(io::Error::last_os_error());
        }
        let mut param: libc::sched_param = std::mem::zeroed();
        param.sched_priority = priority;
        match libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_FIFO, &param) {
            0 => Ok(priority),
            errno => Err(io::Error::from_raw_os_error(errno)),
        }
    }
}

#[cfg(not(unix))]
fn raise_priority() -> io::Result<i32> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "no real-time scheduling on this platform",
    ))
}

/// Whether the worker loop keeps going after an item.
enum Flow {
    Continue,
    Exit,
}

pub(super) struct Worker {
    shared: Arc<Shared>,
    config: DecoderConfig,
    kind: CodecKind,
    opener: Arc<dyn OpenCodec>,
    downstream: Arc<dyn Downstream>,
}

/// The worker once the codec is open.
struct Session {
    shared: Arc<Shared>,
    downstream: Arc<dyn Downstream>,
    codec: Box<dyn Codec>,
    kind: CodecKind,
    policy: BitErrorPolicy,
    input_pool: BufferPool,
    output_pool: BufferPool,
    gen_timestamps: bool,
    frame_duration: Duration,
    channels: Option<u32>,
}

impl Worker {
    pub(super) fn new(
        shared: Arc<Shared>,
        config: DecoderConfig,
        kind: CodecKind,
        opener: Arc<dyn OpenCodec>,
        downstream: Arc<dyn Downstream>,
    ) -> Self {
        Self {
            shared,
            config,
            kind,
            opener,
            downstream,
        }
    }

    /// Thread body: opens the codec, reports the outcome on `started` and
    /// then serves the work queue until shutdown or abort.
    pub(super) fn run(self, started: Sender<Result<StartedPools>>) {
        if self.config.realtime_priority {
            match raise_priority() {
                Ok(priority) => info!(priority, "decode thread runs SCHED_FIFO"),
                Err(err) => warn!("Could not raise decode thread priority: {}", err),
            }
        }
        let mut session = match self.open() {
            Ok(session) => session,
            Err(err) => {
                // The engine is waiting on the other end and reports the error.
                let _ = started.send(Err(err));
                return;
            }
        };
        let pools = StartedPools {
            input_pool: session.input_pool.clone(),
            output_pool: session.output_pool.clone(),
        };
        if started.send(Ok(pools)).is_err() {
            warn!("decoder went away during start");
            session.close();
            return;
        }
        session.serve();
        session.close();
    }

    fn open(&self) -> Result<Session> {
        let params = DecoderParams::from_config(&self.config, self.kind);
        let mut codec = self.opener.open_decoder(
            &self.config.engine_name,
            &self.config.codec_name,
            &params,
        )?;

        let (output_size, graphics) = match self.kind {
            CodecKind::Video => {
                let graphics = GraphicsAttrs::new(
                    self.config.effective_width(),
                    self.config.effective_height(),
                    params.color_space,
                );
                let size = codec.output_buffer_size().max(graphics.frame_size());
                (size, Some(graphics))
            }
            CodecKind::Audio => (codec.output_buffer_size(), None),
        };
        if output_size == 0 {
            return Err(Error::Allocation("codec reported a zero output buffer size".into()));
        }

        let output_pool = BufferPool::create(
            self.config.effective_output_buffers(),
            output_size,
            BufferAttrs {
                use_mask: Owners::ALL,
                graphics,
            },
        )?;
        codec.set_output_pool(&output_pool)?;

        let input_size = match self.config.input_buffer_size {
            0 => output_size,
            size => size,
        };
        let input_pool = BufferPool::create(
            self.config.num_input_buffers,
            input_size,
            BufferAttrs::default(),
        )?;
        info!(
            output_buffers = output_pool.len(),
            output_size,
            input_buffers = input_pool.len(),
            input_size,
            "decoder started"
        );

        Ok(Session {
            shared: self.shared.clone(),
            downstream: self.downstream.clone(),
            codec,
            kind: self.kind,
            policy: BitErrorPolicy::for_kind(self.kind),
            input_pool,
            output_pool,
            gen_timestamps: self.config.gen_timestamps,
            frame_duration: self.config.frame_duration(),
            channels: None,
        })
    }
}

impl Session {
    fn serve(&mut self) {
        loop {
            let item = match self.shared.fifo.pop() {
                Ok(Some(item)) => item,
                Ok(None) => {
                    debug!("work queue closed, leaving decode loop");
                    return;
                }
                Err(err) => {
                    self.abort(err);
                    return;
                }
            };
            trace!(?item, "decoding work item");
            let flow = self.handle(item);
            if let Err(err) = self.shared.fifo.notify_drained() {
                self.abort(err);
                return;
            }
            match flow {
                Ok(Flow::Continue) => {}
                Ok(Flow::Exit) => return,
                Err(err) => {
                    self.abort(err);
                    return;
                }
            }
        }
    }

    fn handle(&mut self, item: WorkItem) -> Result<Flow> {
        if self.shared.flushing.is_raised() {
            trace!("discarding work item while flushing");
            drop(item);
            return Ok(Flow::Continue);
        }

        let (input, draining) = match item {
            WorkItem::Frame(frame) if frame.data().is_empty() => {
                return Err(Error::ProtocolViolation(
                    "empty input frame outside of a drain".into(),
                ));
            }
            WorkItem::Frame(frame) => (Some(frame), false),
            WorkItem::Drain => {
                debug!("draining codec");
                self.codec.flush()?;
                (None, true)
            }
        };

        let dst = match self.output_pool.wait_free(Some(&self.shared.flushing)) {
            Ok(dst) => dst,
            Err(Error::Interrupted) => {
                debug!("flushing while waiting for an output buffer");
                return Ok(self.after_drain(draining));
            }
            Err(err) => return Err(err),
        };

        let data: &[u8] = input.as_ref().map_or(&[] as &[u8], InputFrame::data);
        let outcome = self.codec.process(data, &dst)?;
        let consumed = if draining { 0 } else { outcome.consumed };
        if let CodecStatus::Fatal(code) = outcome.status {
            dst.release(Owners::ALL)?;
            return Err(Error::HardwareFatal(format!(
                "codec process failed with status {code}"
            )));
        }
        if outcome.status == CodecStatus::BitError {
            match self.policy.on_bit_error(consumed, data.len(), draining) {
                BitErrorAction::Continue => {
                    debug!(consumed, len = data.len(), "codec recovered from bit error");
                }
                BitErrorAction::DropFrame => {
                    warn!(consumed, len = data.len(), "bit error, dropping frame");
                    dst.release(Owners::ALL)?;
                    drop(input);
                    self.release_free_buffers()?;
                    return Ok(Flow::Continue);
                }
                BitErrorAction::Fatal => {
                    dst.release(Owners::ALL)?;
                    return Err(Error::HardwareFatal(format!(
                        "bit error with {consumed} of {} bytes consumed, cannot resynchronize",
                        data.len()
                    )));
                }
            }
        }
        trace!(consumed, status = ?outcome.status, "codec processed frame");

        let meta = input.as_ref().map(InputFrame::meta).unwrap_or_default();
        drop(input);

        self.update_channels();
        self.emit_display_buffers(&dst, meta)?;
        self.release_free_buffers()?;
        Ok(self.after_drain(draining))
    }

    /// Pushes every buffer the codec has ready; only the first one carries
    /// the input's timestamp.
    fn emit_display_buffers(&mut self, dst: &PoolBuffer, meta: FrameMeta) -> Result<()> {
        let Some(mut next) = self.codec.display_buffer() else {
            trace!(index = dst.index(), "no frame ready, returning output buffer");
            dst.release(Owners::ALL)?;
            return Ok(());
        };
        let mut pending = Some(meta);
        loop {
            if self.shared.flushing.is_raised() {
                trace!(index = next.index(), "dropping decoded frame while flushing");
                next.release(Owners::ALL)?;
            } else {
                let mut transport = Transport::wrap(next, Some(self.output_pool.wait_handle()))?;
                if let Some(meta) = pending.take() {
                    *transport.meta_mut() = self.output_meta(meta);
                }
                trace!(len = transport.len(), pts = ?transport.meta().pts, "pushing frame");
                if let Err(err) = self.downstream.push(transport) {
                    debug!("Downstream refused frame: {}", err);
                }
            }
            match self.codec.display_buffer() {
                Some(buffer) => next = buffer,
                None => return Ok(()),
            }
        }
    }

    fn output_meta(&self, input: FrameMeta) -> FrameMeta {
        let mut meta = FrameMeta {
            delta_unit: input.delta_unit,
            discont: input.discont,
            ..Default::default()
        };
        if self.gen_timestamps && input.pts.is_some() {
            meta.pts = input.pts;
            meta.duration = match self.kind {
                CodecKind::Video => Some(self.frame_duration),
                CodecKind::Audio => input.duration,
            };
        }
        meta
    }

    fn release_free_buffers(&mut self) -> Result<()> {
        while let Some(buffer) = self.codec.free_buffer() {
            trace!(index = buffer.index(), "codec released buffer");
            buffer.release(Owners::CODEC)?;
        }
        Ok(())
    }

    fn update_channels(&mut self) {
        if self.kind != CodecKind::Audio {
            return;
        }
        let channels = self.codec.channels();
        if channels.is_some() && channels != self.channels {
            self.channels = channels;
            if let Some(channels) = channels {
                debug!(channels, "decoded audio channel count");
                self.downstream.audio_channels(channels);
            }
        }
    }

    /// Signals end of stream after a drain call and decides whether to exit.
    fn after_drain(&mut self, draining: bool) -> Flow {
        if !draining {
            return Flow::Continue;
        }
        debug!("codec drained");
        self.downstream.eos();
        if self.shared.shutdown.swap(false, Ordering::SeqCst) {
            debug!("shutdown after drain, leaving decode loop");
            return Flow::Exit;
        }
        self.shared.set_state(EngineState::Running);
        Flow::Continue
    }

    fn abort(&mut self, err: Error) {
        error!("Decoder aborted: {}", err);
        if self.shared.record_abort(&err) {
            self.downstream.error(&err);
        }
        if let Err(err) = self.shared.fifo.close() {
            error!("Failed to close work queue: {}", err);
        }
        if let Err(err) = self.input_pool.interrupt() {
            error!("Failed to interrupt input pool: {}", err);
        }
        // Queued frames still hold input buffers.
        while let Ok(Some(item)) = self.shared.fifo.try_pop() {
            drop(item);
        }
    }

    /// Drops the codec and clears every reference it still had.
    fn close(self) {
        let Session {
            codec,
            output_pool,
            input_pool,
            ..
        } = self;
        drop(codec);
        for pool in [&output_pool, &input_pool] {
            if let Err(err) = pool.release_all(Owners::CODEC) {
                error!("Failed to release codec references: {}", err);
            }
        }
        debug!("decode thread finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn priority_request_is_granted_or_refused_cleanly() {
        let outcome = thread::spawn(raise_priority).join().unwrap();
        match outcome {
            Ok(priority) => assert!(priority > 0),
            Err(err) => assert!(matches!(
                err.kind(),
                io::ErrorKind::PermissionDenied | io::ErrorKind::Unsupported
            )),
        }
    }
}
