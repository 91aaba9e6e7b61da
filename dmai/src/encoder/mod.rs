// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! The encoder engine.
//!
//! Encoding runs inline on the pipeline's delivery call. Raw input is
//! gathered until one whole frame is available, staged in the session's
//! codec-addressable input region, encoded straight into the
//! [`OutputRing`] and returned as [`Transport`]s whose release moves the
//! ring's tail. Input that already sits in a transport of exactly one frame
//! is handed to the codec where it lies.

pub mod ring;

use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info, trace, warn};

use crate::codec::{EncoderCodec, FrameType, OpenCodec};
use crate::config::EncoderConfig;
use crate::memory::Region;
use crate::parser::Accumulator;
use crate::parser::h264::{bytestream_to_packetized, generate_codec_data};
use crate::registry::EncoderEntry;
use crate::sync::FlushFlag;
use crate::transport::{FrameMeta, Transport};
use crate::{Error, Result};

pub use ring::{OutputRing, RingSlot};

struct EncodeSession {
    codec: Box<dyn EncoderCodec>,
    ring: OutputRing,
    /// One input frame the codec reads from when the caller's bytes are copied.
    input: Arc<Region>,
    in_size: usize,
    pending: Accumulator,
}

/// Encoder for one stream.
///
/// Like the decoder, every method takes `&self` so a flush can be delivered
/// while the streaming thread waits for ring space.
pub struct EncoderEngine {
    entry: EncoderEntry,
    config: EncoderConfig,
    opener: Arc<dyn OpenCodec>,
    flushing: FlushFlag,
    session: Mutex<Option<EncodeSession>>,
    /// Second handle on the session's ring, reachable without the session lock.
    ring: Mutex<Option<OutputRing>>,
    codec_data: Mutex<Option<Vec<u8>>>,
}

impl EncoderEngine {
    pub fn new(entry: &EncoderEntry, mut config: EncoderConfig, opener: Arc<dyn OpenCodec>) -> Self {
        if config.codec_name.is_empty() {
            config.codec_name = entry.codec_name.to_string();
        }
        Self {
            entry: *entry,
            config,
            opener,
            flushing: FlushFlag::new(),
            session: Mutex::new(None),
            ring: Mutex::new(None),
            codec_data: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &EncoderConfig {
        &self.config
    }

    pub fn is_configured(&self) -> bool {
        self.session.lock().is_ok_and(|session| session.is_some())
    }

    /// avcC header built from the first encoded H.264 frame.
    pub fn codec_data(&self) -> Option<Vec<u8>> {
        self.codec_data.lock().ok().and_then(|data| data.clone())
    }

    /// Opens the codec and allocates the ring.
    ///
    /// The input frame size comes from the configuration, the video
    /// geometry, or `first_size` (the size of the first input buffer), in
    /// that order.
    pub fn configure(&self, first_size: usize) -> Result<()> {
        let mut session = self.lock_session()?;
        if session.is_some() {
            return Ok(());
        }
        let in_size = match self.config.in_buffer_size {
            0 => self.config.video_frame_size().unwrap_or(first_size),
            size => size,
        };
        if in_size == 0 {
            return Err(Error::Config("input frame size is unknown".into()));
        }

        let mut config = self.config.clone();
        config.in_buffer_size = in_size;
        let codec = self.opener.open_encoder(
            &config.engine_name,
            &config.codec_name,
            &config,
        )?;
        let ring = OutputRing::new(config.ring_size(in_size))?;
        let input = Arc::new(Region::allocate(in_size)?);
        info!(
            codec = %config.codec_name,
            in_size,
            ring_size = ring.size(),
            "encoder configured"
        );

        *self.lock_ring()? = Some(ring.clone());
        *session = Some(EncodeSession {
            codec,
            ring,
            input,
            in_size,
            pending: Accumulator::new(),
        });
        Ok(())
    }

    /// Accepts raw input; returns the frames it completed, in order.
    ///
    /// The bytes are copied into the session's input region before the
    /// codec sees them.
    ///
    /// # Errors
    ///
    /// [`Error::Capacity`] if `data` is larger than one input frame.
    pub fn chain(&self, data: &[u8], meta: FrameMeta) -> Result<Vec<Transport>> {
        self.accept(data, meta, false)
    }

    /// Like [`Self::chain`] for input already held in a transport; a
    /// transport carrying exactly one frame is encoded without a copy.
    pub fn chain_transport(&self, input: &Transport) -> Result<Vec<Transport>> {
        self.accept(input.as_ref(), *input.meta(), true)
    }

    fn accept(&self, data: &[u8], meta: FrameMeta, in_place: bool) -> Result<Vec<Transport>> {
        if self.flushing.is_raised() {
            trace!(len = data.len(), "dropping input while flushing");
            return Ok(Vec::new());
        }
        self.configure(data.len())?;
        let mut guard = self.lock_session()?;
        let Some(session) = guard.as_mut() else {
            return Ok(Vec::new());
        };
        if data.len() > session.in_size {
            return Err(Error::Capacity {
                needed: data.len(),
                available: session.in_size,
            });
        }

        let mut frames = Vec::new();
        if session.pending.is_empty() && data.len() == session.in_size {
            let encoded = if in_place {
                trace!(len = data.len(), "encoding input in place");
                self.encode(session, data, meta)?
            } else {
                self.encode_staged(session, data, meta)?
            };
            frames.extend(encoded);
            return Ok(frames);
        }
        session.pending.push(data);
        while session.pending.len() >= session.in_size {
            let frame = session.pending.take(session.in_size);
            frames.extend(self.encode_staged(session, &frame, meta)?);
        }
        Ok(frames)
    }

    /// Copies one frame into the input region and encodes it from there.
    fn encode_staged(
        &self,
        session: &mut EncodeSession,
        data: &[u8],
        meta: FrameMeta,
    ) -> Result<Option<Transport>> {
        let input = session.input.clone();
        // SAFETY: the region belongs to the session, which the caller holds
        // locked; nothing else reads or writes it.
        let staged = unsafe { input.slice_mut(0, data.len()) };
        if staged.len() != data.len() {
            return Err(Error::Capacity {
                needed: data.len(),
                available: input.len(),
            });
        }
        staged.copy_from_slice(data);
        self.encode(session, staged, meta)
    }

    fn encode(
        &self,
        session: &mut EncodeSession,
        input: &[u8],
        meta: FrameMeta,
    ) -> Result<Option<Transport>> {
        let slot = match session.ring.acquire(session.in_size, &self.flushing) {
            Ok(slot) => slot,
            Err(Error::Interrupted) => {
                debug!("flushing while waiting for ring space, dropping frame");
                return Ok(None);
            }
            Err(err) => return Err(err),
        };

        // SAFETY: the slot is free ring space that is not committed until
        // the end of this call; no transport views it.
        let out = unsafe { session.ring.slot_mut(slot) };
        let mut produced = session.codec.process(input, out)?;
        if produced == 0 {
            warn!("encoder produced no data");
            return Ok(None);
        }

        if self.entry.h264 {
            let mut codec_data = self.lock_codec_data()?;
            if codec_data.is_none() {
                let generated = generate_codec_data(&out[..produced]);
                debug!(len = generated.len(), "generated codec data");
                *codec_data = Some(generated);
            }
            if self.config.packetized {
                let packetized = bytestream_to_packetized(&out[..produced]);
                if packetized.len() > out.len() {
                    return Err(Error::Capacity {
                        needed: packetized.len(),
                        available: out.len(),
                    });
                }
                out[..packetized.len()].copy_from_slice(&packetized);
                produced = packetized.len();
            }
        }

        let frame_type = session.codec.frame_type();
        let mut transport = session.ring.commit(slot.offset, produced)?;
        *transport.meta_mut() = FrameMeta {
            pts: meta.pts,
            duration: meta.duration,
            delta_unit: frame_type != FrameType::I,
            discont: meta.discont,
        };
        trace!(offset = slot.offset, len = produced, ?frame_type, "encoded frame");
        Ok(Some(transport))
    }

    /// Drops buffered input and stops a chain blocked on ring space.
    pub fn flush_start(&self) -> Result<()> {
        debug!("encoder flush start");
        self.flushing.raise();
        if let Some(ring) = self.lock_ring()?.as_ref() {
            ring.wake();
        }
        if let Some(session) = self.lock_session()?.as_mut() {
            session.pending.clear();
        }
        Ok(())
    }

    pub fn flush_stop(&self) -> Result<()> {
        debug!("encoder flush stop");
        self.flushing.clear();
        Ok(())
    }

    /// Closes the codec, then waits until downstream released every
    /// encoded frame before freeing the ring.
    pub fn deconfigure(&self) -> Result<()> {
        let Some(session) = self.lock_session()?.take() else {
            return Ok(());
        };
        let EncodeSession { codec, ring, .. } = session;
        drop(codec);
        debug!(outstanding = ring.outstanding()?, "waiting for downstream buffers");
        ring.wait_idle()?;
        *self.lock_ring()? = None;
        *self.lock_codec_data()? = None;
        info!("encoder deconfigured");
        Ok(())
    }

    fn lock_session(&self) -> Result<MutexGuard<'_, Option<EncodeSession>>> {
        self.session.lock().map_err(|_| Error::poisoned("encoder session"))
    }

    fn lock_ring(&self) -> Result<MutexGuard<'_, Option<OutputRing>>> {
        self.ring.lock().map_err(|_| Error::poisoned("encoder ring"))
    }

    fn lock_codec_data(&self) -> Result<MutexGuard<'_, Option<Vec<u8>>>> {
        self.codec_data
            .lock()
            .map_err(|_| Error::poisoned("encoder codec data"))
    }
}
