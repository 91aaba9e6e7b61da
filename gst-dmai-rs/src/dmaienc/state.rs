// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Settings and runtime state for dmaienc

use std::sync::Arc;

use dmai::codec::CodecKind;
use dmai::config::{DEFAULT_ENCODE_ENGINE_NAME, EncoderConfig, Fraction};
use dmai::encoder::EncoderEngine;
use dmai::engine::EngineLibrary;
use dmai::registry::EncoderEntry;
use gstreamer as gst;
use gstreamer_audio as gst_audio;

pub(crate) const DEFAULT_CODEC: &str = "h264";
pub(crate) const DEFAULT_CODEC_NAME: &str = "";
pub(crate) const DEFAULT_ENGINE_LIBRARY: &str = "libdmai-engine.so";
pub(crate) const DEFAULT_OUT_BUFFER_SIZE: u32 = 0;

/// User-configurable settings, set through GObject properties.
#[derive(Debug, Clone)]
pub(crate) struct Settings {
    /// Short registry name of the encoder: h264, mpeg4, aac, wma or mp3
    pub codec: String,

    pub engine_name: String,

    /// Overrides the registry's codec name when not empty
    pub codec_name: String,

    pub engine_library: String,

    /// Output ring size in bytes; 0 selects three input frames
    pub out_buffer_size: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            codec: DEFAULT_CODEC.to_owned(),
            engine_name: DEFAULT_ENCODE_ENGINE_NAME.to_owned(),
            codec_name: DEFAULT_CODEC_NAME.to_owned(),
            engine_library: DEFAULT_ENGINE_LIBRARY.to_owned(),
            out_buffer_size: DEFAULT_OUT_BUFFER_SIZE,
        }
    }
}

impl Settings {
    /// Encoder configuration for raw input described by `caps`.
    pub(crate) fn encoder_config(
        &self,
        entry: &EncoderEntry,
        caps: &gst::CapsRef,
        packetized: bool,
    ) -> Result<EncoderConfig, dmai::Error> {
        let structure = caps
            .structure(0)
            .ok_or_else(|| dmai::Error::Config("empty input caps".into()))?;
        let mut config = EncoderConfig {
            engine_name: self.engine_name.clone(),
            codec_name: self.codec_name.clone(),
            out_buffer_size: self.out_buffer_size as usize,
            packetized: packetized && entry.h264,
            ..Default::default()
        };

        match (entry.kind, structure.name().as_str()) {
            (CodecKind::Video, "video/x-raw") => {
                let format = structure
                    .get::<&str>("format")
                    .map_err(|_| dmai::Error::Config("raw video caps without format".into()))?;
                config.color_space = Some(format.parse()?);
                config.width = structure.get::<i32>("width").map_or(0, |w| w.max(0) as u32);
                config.height = structure.get::<i32>("height").map_or(0, |h| h.max(0) as u32);
                if let Ok(framerate) = structure.get::<gst::Fraction>("framerate")
                    && framerate.numer() > 0
                    && framerate.denom() > 0
                {
                    config.framerate = Some(Fraction::new(
                        framerate.numer() as u32,
                        framerate.denom() as u32,
                    ));
                }
            }
            (CodecKind::Audio, "audio/x-raw") => {
                let info = gst_audio::AudioInfo::from_caps(caps)
                    .map_err(|err| dmai::Error::Config(format!("invalid audio caps: {err}")))?;
                config.rate = info.rate();
                config.channels = info.channels();
                config.sample_width = info.width();
            }
            (kind, media_type) => {
                return Err(dmai::Error::Config(format!(
                    "{} encoder cannot take {media_type} ({kind:?} codec)",
                    entry.name
                )));
            }
        }
        Ok(config)
    }
}

/// Source caps for the encoded stream.
///
/// `codec_data` is only set for packetized H.264, once the first frame
/// was encoded.
pub(crate) fn output_caps(
    entry: &EncoderEntry,
    config: &EncoderConfig,
    codec_data: Option<&[u8]>,
) -> gst::Caps {
    let mut builder = gst::Caps::builder(entry.output_media_type);
    if let Some(version) = entry.mpeg_version {
        builder = builder.field("mpegversion", version);
    }
    match entry.kind {
        CodecKind::Video => {
            if entry.h264 {
                let format = if config.packetized { "avc" } else { "byte-stream" };
                builder = builder
                    .field("stream-format", format)
                    .field("alignment", "au");
            } else {
                builder = builder.field("systemstream", false);
            }
            if config.width > 0 && config.height > 0 {
                builder = builder
                    .field("width", config.width as i32)
                    .field("height", config.height as i32);
            }
            if let Some(framerate) = config.framerate {
                builder = builder.field(
                    "framerate",
                    gst::Fraction::new(framerate.numerator as i32, framerate.denominator as i32),
                );
            }
        }
        CodecKind::Audio => {
            if entry.mpeg_version == Some(1) {
                builder = builder.field("layer", 3);
            }
            if config.rate > 0 {
                builder = builder.field("rate", config.rate as i32);
            }
            if config.channels > 0 {
                builder = builder.field("channels", config.channels as i32);
            }
        }
    }
    if let Some(data) = codec_data {
        builder = builder.field("codec_data", gst::Buffer::from_slice(data.to_vec()));
    }
    builder.build()
}

/// A configured encoder and the registry entry it was built for.
pub(crate) struct Stream {
    pub entry: &'static EncoderEntry,
    pub engine: Arc<EncoderEngine>,
    /// Source caps were pushed
    pub caps_sent: bool,
}

/// Mutable element state.
#[derive(Default)]
pub(crate) struct Context {
    /// Loaded at NULL to READY, dropped at READY to NULL
    pub library: Option<Arc<EngineLibrary>>,

    /// Present once caps were received
    pub stream: Option<Stream>,
}
