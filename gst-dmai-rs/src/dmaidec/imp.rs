// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! dmaidec implementation
//!
//! A plain `gst::Element` with one sink and one source pad. The heavy
//! lifting happens in `dmai::decoder::DecoderEngine`:
//! - the sink pad's chain function hands buffers to `DecoderEngine::chain`
//! - flush events are forwarded downstream first, so a decode thread blocked
//!   on a push is released, then applied to the engine
//! - EOS drains the codec; the decode thread pushes EOS when it is done
//! - state changes track pause and shut the engine down at READY to NULL
//!
//! The engine is shared through an `Arc` so that no element lock is held
//! while the streaming thread is blocked inside the engine.

use std::sync::{Arc, LazyLock, Mutex, MutexGuard};

use dmai::codec::OpenCodec;
use dmai::decoder::DecoderEngine;
use dmai::engine::EngineLibrary;
use dmai::registry::{DECODERS, find_decoder};
use gst::glib;
use gst::prelude::*;
use gst::subclass::prelude::*;
use gstreamer as gst;
use tracing::trace;

use crate::dmaidec;
use crate::dmaidec::state::{
    Context, DEFAULT_CODEC_NAME, DEFAULT_DEVICE, DEFAULT_ENGINE_LIBRARY, DEFAULT_GEN_TIMESTAMPS,
    DEFAULT_NUM_OUTPUT_BUFFERS, PadDownstream, Settings, Stream, stream_config,
};
use crate::transport_buffer::frame_meta;

/// GStreamer debug category; `GST_DEBUG=dmaidec:5` shows everything.
pub(crate) static CAT: LazyLock<gst::DebugCategory> = LazyLock::new(|| {
    gst::DebugCategory::new(
        "dmaidec",
        gst::DebugColorFlags::empty(),
        Some("DMAI Decoder"),
    )
});

pub struct DmaiDec {
    sinkpad: gst::Pad,
    srcpad: gst::Pad,

    /// Element properties
    settings: Mutex<Settings>,

    /// Engine library and negotiated stream
    context: Mutex<Context>,
}

#[glib::object_subclass]
impl ObjectSubclass for DmaiDec {
    const NAME: &'static str = "GstRsDmaiDec";
    type Type = dmaidec::DmaiDec;
    type ParentType = gst::Element;

    fn with_class(klass: &Self::Class) -> Self {
        let sinkpad = match klass.pad_template("sink") {
            Some(templ) => gst::Pad::builder_from_template(&templ),
            None => gst::Pad::builder(gst::PadDirection::Sink).name("sink"),
        }
        .chain_function(|pad, parent, buffer| {
            DmaiDec::catch_panic_pad_function(
                parent,
                || Err(gst::FlowError::Error),
                |dec| dec.sink_chain(pad, buffer),
            )
        })
        .event_function(|pad, parent, event| {
            DmaiDec::catch_panic_pad_function(parent, || false, |dec| dec.sink_event(pad, event))
        })
        .build();

        let srcpad = match klass.pad_template("src") {
            Some(templ) => gst::Pad::builder_from_template(&templ),
            None => gst::Pad::builder(gst::PadDirection::Src).name("src"),
        }
        .build();

        Self {
            sinkpad,
            srcpad,
            settings: Mutex::new(Settings::default()),
            context: Mutex::new(Context::default()),
        }
    }
}

impl ObjectImpl for DmaiDec {
    fn properties() -> &'static [glib::ParamSpec] {
        static PROPERTIES: LazyLock<Vec<glib::ParamSpec>> = LazyLock::new(|| {
            vec![
                glib::ParamSpecString::builder("engine-name")
                    .nick("Engine name")
                    .blurb("Codec engine holding the decoder")
                    .default_value(Some(dmai::config::DEFAULT_ENGINE_NAME))
                    .mutable_ready()
                    .build(),
                glib::ParamSpecString::builder("codec-name")
                    .nick("Codec name")
                    .blurb("Codec to open, empty to pick it from the input caps")
                    .default_value(Some(DEFAULT_CODEC_NAME))
                    .mutable_ready()
                    .build(),
                glib::ParamSpecString::builder("engine-library")
                    .nick("Engine library")
                    .blurb("Path of the vendor codec engine library")
                    .default_value(Some(DEFAULT_ENGINE_LIBRARY))
                    .mutable_ready()
                    .build(),
                glib::ParamSpecUInt::builder("num-output-buffers")
                    .nick("Output buffers")
                    .blurb("Decoded frames to allocate, 0 for the device default")
                    .maximum(64)
                    .default_value(DEFAULT_NUM_OUTPUT_BUFFERS)
                    .mutable_ready()
                    .build(),
                glib::ParamSpecBoolean::builder("gen-timestamps")
                    .nick("Generate timestamps")
                    .blurb("Stamp decoded frames with the input timestamps")
                    .default_value(DEFAULT_GEN_TIMESTAMPS)
                    .mutable_ready()
                    .build(),
                glib::ParamSpecString::builder("device")
                    .nick("Device")
                    .blurb("Target SoC: dm6467, dm6446, dm355 or omap3530")
                    .default_value(Some(DEFAULT_DEVICE))
                    .mutable_ready()
                    .build(),
            ]
        });

        PROPERTIES.as_ref()
    }

    fn constructed(&self) {
        #[cfg(feature = "tracing")]
        {
            use tracing_subscriber::filter::LevelFilter;
            use tracing_subscriber::util::SubscriberInitExt;

            let _ = tracing_subscriber::fmt()
                .compact()
                .with_file(true)
                .with_line_number(true)
                .with_thread_ids(true)
                .with_target(false)
                .with_max_level(LevelFilter::TRACE)
                .with_ansi(true)
                .finish()
                .try_init();
        }

        self.parent_constructed();

        let obj = self.obj();
        for pad in [&self.sinkpad, &self.srcpad] {
            if let Err(err) = obj.add_pad(pad) {
                gst::error!(CAT, imp = self, "Failed to add pad {}: {}", pad.name(), err);
            }
        }
    }

    fn set_property(&self, _id: usize, value: &glib::Value, pspec: &glib::ParamSpec) {
        let Ok(mut settings) = self.settings.lock() else {
            gst::error!(CAT, imp = self, "Settings mutex poisoned, property change ignored");
            return;
        };
        match pspec.name() {
            "engine-name" => match value.get::<Option<String>>() {
                Ok(name) => settings.engine_name = name.unwrap_or_default(),
                Err(_) => gst::error!(CAT, imp = self, "Invalid type for engine-name property"),
            },
            "codec-name" => match value.get::<Option<String>>() {
                Ok(name) => settings.codec_name = name.unwrap_or_default(),
                Err(_) => gst::error!(CAT, imp = self, "Invalid type for codec-name property"),
            },
            "engine-library" => match value.get::<Option<String>>() {
                Ok(path) => settings.engine_library = path.unwrap_or_default(),
                Err(_) => gst::error!(CAT, imp = self, "Invalid type for engine-library property"),
            },
            "num-output-buffers" => match value.get::<u32>() {
                Ok(count) => settings.num_output_buffers = count,
                Err(_) => gst::error!(CAT, imp = self, "Invalid type for num-output-buffers property"),
            },
            "gen-timestamps" => match value.get::<bool>() {
                Ok(enabled) => settings.gen_timestamps = enabled,
                Err(_) => gst::error!(CAT, imp = self, "Invalid type for gen-timestamps property"),
            },
            "device" => match value.get::<Option<String>>() {
                Ok(device) => settings.device = device.unwrap_or_default(),
                Err(_) => gst::error!(CAT, imp = self, "Invalid type for device property"),
            },
            other => gst::error!(CAT, imp = self, "Unknown property '{}'", other),
        }
        gst::info!(CAT, imp = self, "Property {} set", pspec.name());
    }

    fn property(&self, _id: usize, pspec: &glib::ParamSpec) -> glib::Value {
        let Ok(settings) = self.settings.lock() else {
            gst::error!(CAT, imp = self, "Settings mutex poisoned");
            return pspec.default_value().clone();
        };
        match pspec.name() {
            "engine-name" => settings.engine_name.to_value(),
            "codec-name" => settings.codec_name.to_value(),
            "engine-library" => settings.engine_library.to_value(),
            "num-output-buffers" => settings.num_output_buffers.to_value(),
            "gen-timestamps" => settings.gen_timestamps.to_value(),
            "device" => settings.device.to_value(),
            other => {
                gst::error!(CAT, imp = self, "Unknown property {}", other);
                pspec.default_value().clone()
            }
        }
    }
}

impl GstObjectImpl for DmaiDec {}

impl ElementImpl for DmaiDec {
    fn metadata() -> Option<&'static gst::subclass::ElementMetadata> {
        static ELEMENT_METADATA: LazyLock<gst::subclass::ElementMetadata> = LazyLock::new(|| {
            gst::subclass::ElementMetadata::new(
                "DMAI Decoder",
                "Codec/Decoder/Video/Audio",
                "Decodes compressed streams on the DSP",
                "Contributors to the Media eXchange Layer project",
            )
        });

        Some(&*ELEMENT_METADATA)
    }

    /// Sink caps come from the decoder table; source caps cover every
    /// layout the DSP writes.
    fn pad_templates() -> &'static [gst::PadTemplate] {
        static PAD_TEMPLATES: LazyLock<Result<Vec<gst::PadTemplate>, glib::BoolError>> =
            LazyLock::new(|| {
                let mut sink_caps = gst::Caps::new_empty();
                {
                    let caps = sink_caps.make_mut();
                    for entry in DECODERS {
                        let mut builder = gst::Caps::builder(entry.media_type);
                        if let Some(version) = entry.mpeg_version {
                            builder = builder.field("mpegversion", version);
                        }
                        if entry.media_type == "video/mpeg" {
                            builder = builder.field("systemstream", false);
                        }
                        caps.append(builder.build());
                    }
                }

                let mut src_caps = gst::Caps::new_empty();
                {
                    let caps = src_caps.make_mut();
                    caps.append(
                        gst::Caps::builder("video/x-raw")
                            .field("format", gst::List::new(["UYVY", "NV12", "NV16"]))
                            .field("width", gst::IntRange::new(1, i32::MAX))
                            .field("height", gst::IntRange::new(1, i32::MAX))
                            .field("framerate", gst::FractionRange::new(
                                gst::Fraction::new(0, 1),
                                gst::Fraction::new(i32::MAX, 1),
                            ))
                            .build(),
                    );
                    caps.append(
                        gst::Caps::builder("audio/x-raw")
                            .field("format", "S16LE")
                            .field("layout", "interleaved")
                            .field("rate", gst::IntRange::new(1, i32::MAX))
                            .field("channels", gst::IntRange::new(1, 8))
                            .build(),
                    );
                }

                Ok(vec![
                    gst::PadTemplate::new(
                        "sink",
                        gst::PadDirection::Sink,
                        gst::PadPresence::Always,
                        &sink_caps,
                    )?,
                    gst::PadTemplate::new(
                        "src",
                        gst::PadDirection::Src,
                        gst::PadPresence::Always,
                        &src_caps,
                    )?,
                ])
            });

        match PAD_TEMPLATES.as_ref() {
            Ok(templates) => templates,
            Err(err) => {
                trace!("Failed to create pad templates: {:?}", err);
                &[]
            }
        }
    }

    fn change_state(
        &self,
        transition: gst::StateChange,
    ) -> Result<gst::StateChangeSuccess, gst::StateChangeError> {
        gst::debug!(CAT, imp = self, "Changing state {:?}", transition);
        match transition {
            gst::StateChange::NullToReady => self.load_library()?,
            gst::StateChange::ReadyToPaused | gst::StateChange::PausedToPlaying => {
                self.set_paused(false)
            }
            gst::StateChange::PlayingToPaused => self.set_paused(true),
            _ => {}
        }

        let success = self.parent_change_state(transition)?;

        if transition == gst::StateChange::ReadyToNull {
            self.shutdown();
            if let Ok(mut context) = self.context.lock() {
                context.library = None;
            }
        }
        Ok(success)
    }
}

impl DmaiDec {
    fn lock_context(&self) -> Result<MutexGuard<'_, Context>, gst::FlowError> {
        self.context.lock().map_err(|_| {
            gst::error!(CAT, imp = self, "Context mutex poisoned");
            gst::FlowError::Error
        })
    }

    /// Engine and downstream of the negotiated stream.
    fn stream(&self) -> Option<(Arc<DecoderEngine>, Arc<PadDownstream>)> {
        let context = self.context.lock().ok()?;
        context
            .stream
            .as_ref()
            .map(|stream| (stream.engine.clone(), stream.downstream.clone()))
    }

    fn load_library(&self) -> Result<(), gst::StateChangeError> {
        let path = self
            .settings
            .lock()
            .map_err(|_| gst::StateChangeError)?
            .engine_library
            .clone();
        let library = EngineLibrary::load(&path).map_err(|err| {
            gst::element_imp_error!(
                self,
                gst::LibraryError::Init,
                ["Failed to load codec engine library {}: {}", path, err]
            );
            gst::StateChangeError
        })?;
        gst::info!(CAT, imp = self, "Loaded codec engine library {}", path);
        self.context.lock().map_err(|_| gst::StateChangeError)?.library = Some(Arc::new(library));
        Ok(())
    }

    fn set_paused(&self, paused: bool) {
        if let Ok(mut context) = self.context.lock() {
            context.paused = paused;
            if let Some(stream) = &context.stream {
                stream.engine.set_paused(paused);
            }
        }
    }

    /// Stops the decode thread and frees the engine's buffers.
    fn shutdown(&self) {
        let stream = match self.context.lock() {
            Ok(mut context) => context.stream.take(),
            Err(_) => None,
        };
        if let Some(stream) = stream {
            stream.downstream.detach();
            match stream.engine.exit() {
                Ok(()) => gst::info!(CAT, imp = self, "Decoder stopped"),
                Err(err) => gst::warning!(CAT, imp = self, "Decoder shutdown failed: {}", err),
            }
        }
    }

    fn sink_chain(
        &self,
        _pad: &gst::Pad,
        buffer: gst::Buffer,
    ) -> Result<gst::FlowSuccess, gst::FlowError> {
        let Some((engine, downstream)) = self.stream() else {
            gst::element_imp_error!(self, gst::CoreError::Negotiation, ["No caps before data"]);
            return Err(gst::FlowError::NotNegotiated);
        };

        let map = buffer.map_readable().map_err(|_| {
            gst::element_imp_error!(self, gst::CoreError::Failed, ["Failed to map input buffer"]);
            gst::FlowError::Error
        })?;
        gst::trace!(CAT, imp = self, "Chain {} bytes, pts {:?}", map.size(), buffer.pts());

        match engine.chain(map.as_slice(), frame_meta(&buffer)) {
            Ok(()) if engine.is_flushing() => Err(gst::FlowError::Flushing),
            Ok(()) => downstream.flow(),
            // Already posted by the decode thread.
            Err(dmai::Error::HardwareFatal(err)) => {
                gst::debug!(CAT, imp = self, "Decoder aborted: {}", err);
                Err(gst::FlowError::Error)
            }
            Err(err) => {
                gst::element_imp_error!(self, gst::StreamError::Decode, ["{}", err]);
                Err(gst::FlowError::Error)
            }
        }
    }

    fn sink_event(&self, pad: &gst::Pad, event: gst::Event) -> bool {
        use gst::EventView;

        gst::log!(CAT, obj = pad, "Handling event {:?}", event);
        match event.view() {
            EventView::Caps(caps) => {
                let caps = caps.caps_owned();
                match self.set_caps(&caps) {
                    Ok(()) => true,
                    Err(err) => {
                        err.log_with_imp(self);
                        false
                    }
                }
            }
            EventView::FlushStart(_) => {
                let forwarded = self.srcpad.push_event(event);
                if let Some((engine, _)) = self.stream()
                    && let Err(err) = engine.flush_start()
                {
                    gst::warning!(CAT, imp = self, "Flush start failed: {}", err);
                }
                forwarded
            }
            EventView::FlushStop(_) => {
                if let Some((engine, downstream)) = self.stream() {
                    if let Err(err) = engine.flush_stop() {
                        gst::warning!(CAT, imp = self, "Flush stop failed: {}", err);
                    }
                    downstream.reset_flow();
                }
                self.srcpad.push_event(event)
            }
            EventView::Eos(_) => match self.stream() {
                Some((engine, _)) => match engine.eos() {
                    Ok(()) => true,
                    Err(err) => {
                        gst::warning!(CAT, imp = self, "Drain at EOS failed: {}", err);
                        self.srcpad.push_event(event)
                    }
                },
                None => self.srcpad.push_event(event),
            },
            EventView::Segment(_) => match self.stream() {
                Some((_, downstream)) => downstream.sticky_event(event),
                None => gst::Pad::event_default(pad, Some(&*self.obj()), event),
            },
            _ => gst::Pad::event_default(pad, Some(&*self.obj()), event),
        }
    }

    /// Creates the decoder engine for the new input format.
    ///
    /// A running engine for a previous format is drained and shut down first.
    fn set_caps(&self, caps: &gst::Caps) -> Result<(), gst::LoggableError> {
        if let Ok(context) = self.context.lock()
            && context.stream.as_ref().is_some_and(|stream| stream.caps == *caps)
        {
            gst::debug!(CAT, imp = self, "Caps unchanged, keeping the decoder");
            return Ok(());
        }
        gst::info!(CAT, imp = self, "Sink caps {}", caps);
        let structure = caps
            .structure(0)
            .ok_or_else(|| gst::loggable_error!(CAT, "No structure in caps {}", caps))?;
        let media_type = structure.name().as_str();
        let mpeg_version = structure.get::<i32>("mpegversion").ok();
        let entry = find_decoder(media_type, mpeg_version)
            .ok_or_else(|| gst::loggable_error!(CAT, "No decoder for {}", caps))?;

        let config = self
            .settings
            .lock()
            .map_err(|_| gst::loggable_error!(CAT, "Settings mutex poisoned"))?
            .decoder_config(structure)
            .map_err(|err| gst::loggable_error!(CAT, "Invalid decoder settings: {}", err))?;

        self.shutdown();

        let mut context = self
            .lock_context()
            .map_err(|_| gst::loggable_error!(CAT, "Context mutex poisoned"))?;
        let library: Arc<dyn OpenCodec> = context
            .library
            .clone()
            .ok_or_else(|| gst::loggable_error!(CAT, "Codec engine library is not loaded"))?;

        let downstream = Arc::new(PadDownstream::new(
            self.obj().downgrade(),
            self.srcpad.clone(),
            entry.kind,
            &config,
            structure,
        ));
        let engine = DecoderEngine::new(
            entry,
            config,
            &stream_config(structure),
            library,
            downstream.clone(),
        )
        .map_err(|err| gst::loggable_error!(CAT, "Failed to create decoder: {}", err))?;
        engine.set_paused(context.paused);
        gst::info!(
            CAT,
            imp = self,
            "Decoding {} with {}",
            media_type,
            engine.config().codec_name
        );

        context.stream = Some(Stream {
            caps: caps.clone(),
            engine: Arc::new(engine),
            downstream,
        });
        Ok(())
    }
}
