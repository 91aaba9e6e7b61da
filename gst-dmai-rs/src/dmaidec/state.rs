// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Settings and runtime state for dmaidec
//!
//! ## Key Types
//! - `Settings`: element properties
//! - `Context`: the loaded engine library and the running stream
//! - `PadDownstream`: the decoder engine's view of the source pad
//!
//! ## Negotiation
//! 1. The sink pad receives caps; the registry entry is chosen from them
//! 2. `Settings::decoder_config()` merges properties with the caps fields
//! 3. A `DecoderEngine` is created; it starts on the first buffer
//! 4. Source caps are sent with the first decoded frame, once the output
//!    geometry (video) or channel count (audio) is known

use std::sync::{Arc, Mutex, MutexGuard};

use dmai::codec::CodecKind;
use dmai::config::{DEFAULT_ENGINE_NAME, DecoderConfig, Fraction};
use dmai::decoder::{DecoderEngine, Downstream};
use dmai::engine::EngineLibrary;
use dmai::parser::StreamConfig;
use dmai::{GraphicsAttrs, Transport};
use gst::glib;
use gst::prelude::*;
use gstreamer as gst;
use gstreamer_audio as gst_audio;
use tracing::{debug, trace};

use crate::dmaidec::imp::CAT;
use crate::transport_buffer::into_buffer;

pub(crate) const DEFAULT_CODEC_NAME: &str = "";
pub(crate) const DEFAULT_ENGINE_LIBRARY: &str = "libdmai-engine.so";
pub(crate) const DEFAULT_NUM_OUTPUT_BUFFERS: u32 = 0;
pub(crate) const DEFAULT_GEN_TIMESTAMPS: bool = true;
pub(crate) const DEFAULT_DEVICE: &str = "dm6446";

/// Sample rate assumed when audio caps carry none.
const DEFAULT_AUDIO_RATE: i32 = 44100;

/// User-configurable settings, set through GObject properties.
#[derive(Debug, Clone)]
pub(crate) struct Settings {
    /// Codec engine holding the decoder
    pub engine_name: String,

    /// Codec to open; empty selects the one registered for the sink caps
    pub codec_name: String,

    /// Path of the vendor engine library
    pub engine_library: String,

    /// Output buffers to allocate; 0 selects the device default
    pub num_output_buffers: u32,

    /// Stamp decoded frames with the input timestamps
    pub gen_timestamps: bool,

    /// Target SoC, selects geometry limits and output layout
    pub device: String,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            engine_name: DEFAULT_ENGINE_NAME.to_owned(),
            codec_name: DEFAULT_CODEC_NAME.to_owned(),
            engine_library: DEFAULT_ENGINE_LIBRARY.to_owned(),
            num_output_buffers: DEFAULT_NUM_OUTPUT_BUFFERS,
            gen_timestamps: DEFAULT_GEN_TIMESTAMPS,
            device: DEFAULT_DEVICE.to_owned(),
        }
    }
}

impl Settings {
    /// Decoder configuration for a stream described by `structure`.
    pub(crate) fn decoder_config(
        &self,
        structure: &gst::StructureRef,
    ) -> Result<DecoderConfig, dmai::Error> {
        let mut config = DecoderConfig {
            engine_name: self.engine_name.clone(),
            codec_name: self.codec_name.clone(),
            device: self.device.parse()?,
            num_output_buffers: self.num_output_buffers as usize,
            gen_timestamps: self.gen_timestamps,
            ..Default::default()
        };
        if let Ok(width) = structure.get::<i32>("width") {
            config.width = width.max(0) as u32;
        }
        if let Ok(height) = structure.get::<i32>("height") {
            config.height = height.max(0) as u32;
        }
        if let Ok(framerate) = structure.get::<gst::Fraction>("framerate")
            && framerate.numer() > 0
            && framerate.denom() > 0
        {
            config.framerate = Some(Fraction::new(
                framerate.numer() as u32,
                framerate.denom() as u32,
            ));
        }
        Ok(config)
    }
}

/// Stream description handed to the parser.
pub(crate) fn stream_config(structure: &gst::StructureRef) -> StreamConfig {
    let mut stream = StreamConfig::new(structure.name().as_str())
        .with_parsed(structure.get::<bool>("parsed").unwrap_or(false))
        .with_framed(structure.get::<bool>("framed").unwrap_or(false));
    if let Ok(codec_data) = structure.get::<gst::Buffer>("codec_data") {
        match codec_data.map_readable() {
            Ok(map) => stream = stream.with_codec_data(map.as_slice()),
            Err(err) => debug!("Unreadable codec_data: {}", err),
        }
    }
    stream
}

/// A negotiated stream: the engine and the pad it pushes to.
pub(crate) struct Stream {
    pub caps: gst::Caps,
    pub engine: Arc<DecoderEngine>,
    pub downstream: Arc<PadDownstream>,
}

/// Mutable element state.
#[derive(Default)]
pub(crate) struct Context {
    /// Loaded at NULL to READY, dropped at READY to NULL
    pub library: Option<Arc<EngineLibrary>>,

    /// Present once caps were received
    pub stream: Option<Stream>,

    /// The pipeline is PAUSED after having played
    pub paused: bool,
}

struct OutputState {
    caps_sent: bool,
    /// Sticky events that must follow the caps.
    pending: Vec<gst::Event>,
    framerate: gst::Fraction,
    rate: i32,
    channels: u32,
    flow: Result<gst::FlowSuccess, gst::FlowError>,
    /// The engine is being replaced or shut down; its EOS is not forwarded.
    detached: bool,
}

/// Pushes decoded frames out of the source pad.
///
/// Called from the decode thread. Source caps are derived from the first
/// frame and sent ahead of it, followed by any sticky events held back
/// until then.
pub(crate) struct PadDownstream {
    element: glib::WeakRef<super::DmaiDec>,
    srcpad: gst::Pad,
    kind: CodecKind,
    output: Mutex<OutputState>,
}

impl PadDownstream {
    pub(crate) fn new(
        element: glib::WeakRef<super::DmaiDec>,
        srcpad: gst::Pad,
        kind: CodecKind,
        config: &DecoderConfig,
        structure: &gst::StructureRef,
    ) -> Self {
        let framerate = config.framerate.unwrap_or_default();
        Self {
            element,
            srcpad,
            kind,
            output: Mutex::new(OutputState {
                caps_sent: false,
                pending: Vec::new(),
                framerate: gst::Fraction::new(framerate.numerator as i32, framerate.denominator as i32),
                rate: structure.get::<i32>("rate").unwrap_or(DEFAULT_AUDIO_RATE),
                channels: structure.get::<i32>("channels").map_or(2, |c| c.max(1) as u32),
                flow: Ok(gst::FlowSuccess::Ok),
                detached: false,
            }),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, OutputState>, dmai::Error> {
        self.output
            .lock()
            .map_err(|_| dmai::Error::Other("downstream state poisoned".into()))
    }

    /// Result of the most recent push.
    pub(crate) fn flow(&self) -> Result<gst::FlowSuccess, gst::FlowError> {
        self.lock().map_err(|_| gst::FlowError::Error)?.flow
    }

    pub(crate) fn reset_flow(&self) {
        if let Ok(mut output) = self.lock() {
            output.flow = Ok(gst::FlowSuccess::Ok);
        }
    }

    pub(crate) fn detach(&self) {
        if let Ok(mut output) = self.lock() {
            output.detached = true;
        }
    }

    /// Forwards a sticky event, or holds it until the source caps are set.
    pub(crate) fn sticky_event(&self, event: gst::Event) -> bool {
        if let Ok(mut output) = self.lock()
            && !output.caps_sent
        {
            trace!(event = ?event.type_(), "holding event until caps are known");
            output.pending.push(event);
            return true;
        }
        self.srcpad.push_event(event)
    }

    fn video_caps(graphics: &GraphicsAttrs, framerate: gst::Fraction) -> gst::Caps {
        gst::Caps::builder("video/x-raw")
            .field("format", graphics.color_space.format_name())
            .field("width", graphics.width as i32)
            .field("height", graphics.height as i32)
            .field("framerate", framerate)
            .build()
    }

    fn audio_caps(rate: i32, channels: u32) -> Result<gst::Caps, dmai::Error> {
        gst_audio::AudioInfo::builder(gst_audio::AudioFormat::S16le, rate as u32, channels)
            .build()
            .and_then(|info| info.to_caps())
            .map_err(|err| dmai::Error::Other(format!("invalid audio caps: {err}")))
    }

    /// Caps to send before `frame`, if they were not sent yet, along with
    /// the events held back for them.
    fn take_caps(&self, frame: &Transport) -> Result<Option<(gst::Caps, Vec<gst::Event>)>, dmai::Error> {
        let mut output = self.lock()?;
        if output.caps_sent {
            return Ok(None);
        }
        let caps = match (self.kind, frame.pool_buffer().and_then(|b| b.graphics())) {
            (CodecKind::Video, Some(graphics)) => Self::video_caps(&graphics, output.framerate),
            (CodecKind::Video, None) => {
                return Err(dmai::Error::Other("decoded frame has no geometry".into()));
            }
            (CodecKind::Audio, _) => Self::audio_caps(output.rate, output.channels)?,
        };
        output.caps_sent = true;
        Ok(Some((caps, std::mem::take(&mut output.pending))))
    }

    fn push_pending(&self, events: Vec<gst::Event>) {
        for event in events {
            self.srcpad.push_event(event);
        }
    }
}

impl Downstream for PadDownstream {
    fn push(&self, frame: Transport) -> dmai::Result<()> {
        if let Some((caps, pending)) = self.take_caps(&frame)? {
            gst::info!(CAT, obj = &self.srcpad, "Output caps {}", caps);
            self.srcpad.push_event(gst::event::Caps::new(&caps));
            self.push_pending(pending);
        }

        let flow = self.srcpad.push(into_buffer(frame));
        if let Ok(mut output) = self.lock() {
            output.flow = flow;
        }
        match flow {
            Ok(_) => Ok(()),
            Err(err) => Err(dmai::Error::Other(format!("downstream returned {err:?}"))),
        }
    }

    fn eos(&self) {
        let pending = match self.lock() {
            Ok(output) if output.detached => {
                debug!("engine detached, not forwarding EOS");
                return;
            }
            Ok(mut output) => std::mem::take(&mut output.pending),
            Err(_) => Vec::new(),
        };
        self.push_pending(pending);
        gst::debug!(CAT, obj = &self.srcpad, "Pushing EOS");
        self.srcpad.push_event(gst::event::Eos::new());
    }

    fn error(&self, err: &dmai::Error) {
        if let Some(element) = self.element.upgrade() {
            gst::element_error!(element, gst::StreamError::Decode, ["Decoding failed: {}", err]);
        }
    }

    fn audio_channels(&self, channels: u32) {
        if let Ok(mut output) = self.lock() {
            output.channels = channels;
        }
    }
}
