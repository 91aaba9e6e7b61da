// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! dmaienc implementation
//!
//! Encoding runs inline on the streaming thread: every input buffer is
//! handed to `dmai::encoder::EncoderEngine::chain` and the frames it
//! completes are pushed straight out of the output ring.

use std::sync::{Arc, LazyLock, Mutex};

use dmai::codec::{CodecKind, OpenCodec};
use dmai::encoder::EncoderEngine;
use dmai::engine::EngineLibrary;
use dmai::registry::{ENCODERS, find_encoder};
use gst::glib;
use gst::prelude::*;
use gst::subclass::prelude::*;
use gstreamer as gst;
use tracing::trace;

use crate::dmaienc;
use crate::dmaienc::state::{
    Context, DEFAULT_CODEC, DEFAULT_CODEC_NAME, DEFAULT_ENGINE_LIBRARY, DEFAULT_OUT_BUFFER_SIZE,
    Settings, Stream, output_caps,
};
use crate::transport_buffer::{frame_meta, into_buffer, into_transport};

pub(crate) static CAT: LazyLock<gst::DebugCategory> = LazyLock::new(|| {
    gst::DebugCategory::new(
        "dmaienc",
        gst::DebugColorFlags::empty(),
        Some("DMAI Encoder"),
    )
});

pub struct DmaiEnc {
    sinkpad: gst::Pad,
    srcpad: gst::Pad,
    settings: Mutex<Settings>,
    context: Mutex<Context>,
}

#[glib::object_subclass]
impl ObjectSubclass for DmaiEnc {
    const NAME: &'static str = "GstRsDmaiEnc";
    type Type = dmaienc::DmaiEnc;
    type ParentType = gst::Element;

    fn with_class(klass: &Self::Class) -> Self {
        let sinkpad = match klass.pad_template("sink") {
            Some(templ) => gst::Pad::builder_from_template(&templ),
            None => gst::Pad::builder(gst::PadDirection::Sink).name("sink"),
        }
        .chain_function(|pad, parent, buffer| {
            DmaiEnc::catch_panic_pad_function(
                parent,
                || Err(gst::FlowError::Error),
                |enc| enc.sink_chain(pad, buffer),
            )
        })
        .event_function(|pad, parent, event| {
            DmaiEnc::catch_panic_pad_function(parent, || false, |enc| enc.sink_event(pad, event))
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

impl ObjectImpl for DmaiEnc {
    fn properties() -> &'static [glib::ParamSpec] {
        static PROPERTIES: LazyLock<Vec<glib::ParamSpec>> = LazyLock::new(|| {
            vec![
                glib::ParamSpecString::builder("codec")
                    .nick("Codec")
                    .blurb("Encoder to use: h264, mpeg4, aac, wma or mp3")
                    .default_value(Some(DEFAULT_CODEC))
                    .mutable_ready()
                    .build(),
                glib::ParamSpecString::builder("engine-name")
                    .nick("Engine name")
                    .blurb("Codec engine holding the encoder")
                    .default_value(Some(dmai::config::DEFAULT_ENCODE_ENGINE_NAME))
                    .mutable_ready()
                    .build(),
                glib::ParamSpecString::builder("codec-name")
                    .nick("Codec name")
                    .blurb("Codec to open, empty for the one registered for codec")
                    .default_value(Some(DEFAULT_CODEC_NAME))
                    .mutable_ready()
                    .build(),
                glib::ParamSpecString::builder("engine-library")
                    .nick("Engine library")
                    .blurb("Path of the vendor codec engine library")
                    .default_value(Some(DEFAULT_ENGINE_LIBRARY))
                    .mutable_ready()
                    .build(),
                glib::ParamSpecUInt::builder("out-buffer-size")
                    .nick("Output buffer size")
                    .blurb("Bytes of encoded output kept in flight, 0 for three input frames")
                    .default_value(DEFAULT_OUT_BUFFER_SIZE)
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
            "codec" => match value.get::<Option<String>>() {
                Ok(Some(codec)) if find_encoder(&codec).is_some() => {
                    gst::info!(
                        CAT,
                        imp = self,
                        "Changing codec from {} to {}",
                        settings.codec,
                        codec
                    );
                    settings.codec = codec;
                }
                Ok(codec) => gst::error!(CAT, imp = self, "Unknown encoder {:?}", codec),
                Err(_) => gst::error!(CAT, imp = self, "Invalid type for codec property"),
            },
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
            "out-buffer-size" => match value.get::<u32>() {
                Ok(size) => settings.out_buffer_size = size,
                Err(_) => gst::error!(CAT, imp = self, "Invalid type for out-buffer-size property"),
            },
            other => gst::error!(CAT, imp = self, "Unknown property '{}'", other),
        }
    }

    fn property(&self, _id: usize, pspec: &glib::ParamSpec) -> glib::Value {
        let Ok(settings) = self.settings.lock() else {
            gst::error!(CAT, imp = self, "Settings mutex poisoned");
            return pspec.default_value().clone();
        };
        match pspec.name() {
            "codec" => settings.codec.to_value(),
            "engine-name" => settings.engine_name.to_value(),
            "codec-name" => settings.codec_name.to_value(),
            "engine-library" => settings.engine_library.to_value(),
            "out-buffer-size" => settings.out_buffer_size.to_value(),
            other => {
                gst::error!(CAT, imp = self, "Unknown property {}", other);
                pspec.default_value().clone()
            }
        }
    }
}

impl GstObjectImpl for DmaiEnc {}

impl ElementImpl for DmaiEnc {
    fn metadata() -> Option<&'static gst::subclass::ElementMetadata> {
        static ELEMENT_METADATA: LazyLock<gst::subclass::ElementMetadata> = LazyLock::new(|| {
            gst::subclass::ElementMetadata::new(
                "DMAI Encoder",
                "Codec/Encoder/Video/Audio",
                "Encodes raw video and audio on the DSP",
                "Contributors to the Media eXchange Layer project",
            )
        });

        Some(&*ELEMENT_METADATA)
    }

    fn pad_templates() -> &'static [gst::PadTemplate] {
        static PAD_TEMPLATES: LazyLock<Result<Vec<gst::PadTemplate>, glib::BoolError>> =
            LazyLock::new(|| {
                let mut sink_caps = gst::Caps::new_empty();
                {
                    let caps = sink_caps.make_mut();
                    caps.append(
                        gst::Caps::builder("video/x-raw")
                            .field("format", gst::List::new(["UYVY", "NV12", "NV16"]))
                            .field("width", gst::IntRange::new(1, i32::MAX))
                            .field("height", gst::IntRange::new(1, i32::MAX))
                            .build(),
                    );
                    caps.append(
                        gst::Caps::builder("audio/x-raw")
                            .field("format", "S16LE")
                            .field("layout", "interleaved")
                            .field("rate", gst::IntRange::new(1, i32::MAX))
                            .field("channels", gst::IntRange::new(1, 2))
                            .build(),
                    );
                }

                let mut src_caps = gst::Caps::new_empty();
                {
                    let caps = src_caps.make_mut();
                    for entry in ENCODERS {
                        let mut builder = gst::Caps::builder(entry.output_media_type);
                        if let Some(version) = entry.mpeg_version {
                            builder = builder.field("mpegversion", version);
                        }
                        if entry.h264 {
                            builder = builder
                                .field("stream-format", gst::List::new(["byte-stream", "avc"]))
                                .field("alignment", "au");
                        }
                        caps.append(builder.build());
                    }
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
        if transition == gst::StateChange::NullToReady {
            self.load_library()?;
        }

        let success = self.parent_change_state(transition)?;

        match transition {
            gst::StateChange::PausedToReady => self.shutdown(),
            gst::StateChange::ReadyToNull => {
                if let Ok(mut context) = self.context.lock() {
                    context.library = None;
                }
            }
            _ => {}
        }
        Ok(success)
    }
}

impl DmaiEnc {
    fn stream(&self) -> Option<(&'static dmai::registry::EncoderEntry, Arc<EncoderEngine>, bool)> {
        let context = self.context.lock().ok()?;
        context
            .stream
            .as_ref()
            .map(|stream| (stream.entry, stream.engine.clone(), stream.caps_sent))
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

    /// Closes the codec once downstream returned every encoded frame.
    fn shutdown(&self) {
        let stream = match self.context.lock() {
            Ok(mut context) => context.stream.take(),
            Err(_) => None,
        };
        if let Some(stream) = stream {
            match stream.engine.deconfigure() {
                Ok(()) => gst::info!(CAT, imp = self, "Encoder stopped"),
                Err(err) => gst::warning!(CAT, imp = self, "Encoder shutdown failed: {}", err),
            }
        }
    }

    fn mark_caps_sent(&self) {
        if let Ok(mut context) = self.context.lock()
            && let Some(stream) = context.stream.as_mut()
        {
            stream.caps_sent = true;
        }
    }

    /// Downstream prefers length-prefixed H.264 with codec_data.
    fn downstream_wants_avc(&self) -> bool {
        let Some(allowed) = self.srcpad.allowed_caps() else {
            return false;
        };
        if allowed.is_any() {
            return false;
        }
        allowed
            .iter()
            .filter(|s| s.name() == "video/x-h264")
            .find_map(|s| {
                s.get::<String>("stream-format")
                    .ok()
                    .or_else(|| s.get::<gst::List>("stream-format").ok().and_then(|list| {
                        list.iter().next().and_then(|v| v.get::<String>().ok())
                    }))
            })
            .is_some_and(|format| format == "avc")
    }

    fn sink_chain(
        &self,
        _pad: &gst::Pad,
        buffer: gst::Buffer,
    ) -> Result<gst::FlowSuccess, gst::FlowError> {
        let Some((entry, engine, caps_sent)) = self.stream() else {
            gst::element_imp_error!(self, gst::CoreError::Negotiation, ["No caps before data"]);
            return Err(gst::FlowError::NotNegotiated);
        };

        // Frames decoded by dmaidec are encoded straight from the codec buffer.
        let encoded = match into_transport(buffer) {
            Ok(transport) => engine.chain_transport(&transport),
            Err(buffer) => {
                let map = buffer.map_readable().map_err(|_| {
                    gst::element_imp_error!(self, gst::CoreError::Failed, ["Failed to map input buffer"]);
                    gst::FlowError::Error
                })?;
                engine.chain(map.as_slice(), frame_meta(&buffer))
            }
        };
        let frames = encoded.map_err(|err| {
            gst::element_imp_error!(self, gst::StreamError::Encode, ["{}", err]);
            gst::FlowError::Error
        })?;
        gst::trace!(CAT, imp = self, "Encoded {} frames", frames.len());

        if !caps_sent && !frames.is_empty() {
            let codec_data = engine.codec_data();
            let caps = output_caps(entry, engine.config(), codec_data.as_deref());
            gst::info!(CAT, imp = self, "Output caps {}", caps);
            if !self.srcpad.push_event(gst::event::Caps::new(&caps)) {
                return Err(gst::FlowError::NotNegotiated);
            }
            self.mark_caps_sent();
        }

        let mut flow = Ok(gst::FlowSuccess::Ok);
        for frame in frames {
            flow = self.srcpad.push(into_buffer(frame));
            if flow.is_err() {
                break;
            }
        }
        flow
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
                if let Some((_, engine, _)) = self.stream()
                    && let Err(err) = engine.flush_start()
                {
                    gst::warning!(CAT, imp = self, "Flush start failed: {}", err);
                }
                self.srcpad.push_event(event)
            }
            EventView::FlushStop(_) => {
                if let Some((_, engine, _)) = self.stream()
                    && let Err(err) = engine.flush_stop()
                {
                    gst::warning!(CAT, imp = self, "Flush stop failed: {}", err);
                }
                self.srcpad.push_event(event)
            }
            _ => gst::Pad::event_default(pad, Some(&*self.obj()), event),
        }
    }

    /// Configures the encoder for new raw input.
    ///
    /// For byte-stream output the source caps go out right away; packetized
    /// H.264 waits for the first frame, which supplies codec_data.
    fn set_caps(&self, caps: &gst::Caps) -> Result<(), gst::LoggableError> {
        gst::info!(CAT, imp = self, "Sink caps {}", caps);
        let settings = self
            .settings
            .lock()
            .map_err(|_| gst::loggable_error!(CAT, "Settings mutex poisoned"))?
            .clone();
        let entry = find_encoder(&settings.codec)
            .ok_or_else(|| gst::loggable_error!(CAT, "Unknown encoder {}", settings.codec))?;
        let packetized = entry.h264 && self.downstream_wants_avc();
        let config = settings
            .encoder_config(entry, caps, packetized)
            .map_err(|err| gst::loggable_error!(CAT, "Unusable input caps: {}", err))?;

        self.shutdown();

        let library: Arc<dyn OpenCodec> = self
            .context
            .lock()
            .map_err(|_| gst::loggable_error!(CAT, "Context mutex poisoned"))?
            .library
            .clone()
            .ok_or_else(|| gst::loggable_error!(CAT, "Codec engine library is not loaded"))?;
        let engine = Arc::new(EncoderEngine::new(entry, config, library));

        let caps_sent = !engine.config().packetized;
        if caps_sent {
            let caps = output_caps(entry, engine.config(), None);
            gst::info!(CAT, imp = self, "Output caps {}", caps);
            if !self.srcpad.push_event(gst::event::Caps::new(&caps)) {
                return Err(gst::loggable_error!(CAT, "Downstream refused {}", caps));
            }
        }
        gst::info!(
            CAT,
            imp = self,
            "Encoding {} with {}{}",
            if entry.kind == CodecKind::Video { "video" } else { "audio" },
            engine.config().codec_name,
            if packetized { " (avc)" } else { "" }
        );

        self.context
            .lock()
            .map_err(|_| gst::loggable_error!(CAT, "Context mutex poisoned"))?
            .stream = Some(Stream {
            entry,
            engine,
            caps_sent,
        });
        Ok(())
    }
}
