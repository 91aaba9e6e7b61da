// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Stream configuration for the decoder and encoder engines.
//!
//! Both configurations deserialize from JSON with every field optional, so a
//! pipeline only needs to spell out what differs from the device defaults.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

pub const DEFAULT_ENGINE_NAME: &str = "decode";
pub const DEFAULT_ENCODE_ENGINE_NAME: &str = "encode";
pub const DEFAULT_NUM_INPUT_BUFFERS: usize = 3;
pub const DEFAULT_FIFO_CAPACITY: usize = 16;

/// Pixel layout of raw video buffers.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ColorSpace {
    /// Packed 4:2:2, two bytes per pixel.
    #[serde(rename = "UYVY")]
    Uyvy,
    /// 4:2:0 with a luma plane followed by an interleaved chroma plane.
    #[serde(rename = "NV12")]
    Yuv420PSemi,
    /// 4:2:2 with a luma plane followed by an interleaved chroma plane.
    #[serde(rename = "NV16")]
    Yuv422PSemi,
}

impl ColorSpace {
    /// Bytes per line for a frame `width` pixels wide.
    pub fn line_length(self, width: u32) -> u32 {
        match self {
            ColorSpace::Uyvy => width * 2,
            ColorSpace::Yuv420PSemi | ColorSpace::Yuv422PSemi => width,
        }
    }

    /// Bytes in one whole frame, chroma included.
    pub fn frame_size(self, width: u32, height: u32) -> usize {
        let luma = width as usize * height as usize;
        match self {
            ColorSpace::Uyvy | ColorSpace::Yuv422PSemi => luma * 2,
            ColorSpace::Yuv420PSemi => luma * 3 / 2,
        }
    }

    /// Raw video format name as used in media caps.
    pub fn format_name(self) -> &'static str {
        match self {
            ColorSpace::Uyvy => "UYVY",
            ColorSpace::Yuv420PSemi => "NV12",
            ColorSpace::Yuv422PSemi => "NV16",
        }
    }
}

impl FromStr for ColorSpace {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "UYVY" => Ok(Self::Uyvy),
            "NV12" => Ok(Self::Yuv420PSemi),
            "NV16" => Ok(Self::Yuv422PSemi),
            other => Err(Error::Config(format!("unsupported color space {other:?}"))),
        }
    }
}

/// Rational number used for frame rates.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct Fraction {
    pub numerator: u32,
    #[serde(default = "default_denominator")]
    pub denominator: u32,
}

fn default_denominator() -> u32 {
    1
}

impl Fraction {
    /// 29.97 frames per second.
    pub const NTSC: Fraction = Fraction {
        numerator: 30000,
        denominator: 1001,
    };

    pub fn new(numerator: u32, denominator: u32) -> Self {
        Self {
            numerator,
            denominator,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.numerator > 0 && self.denominator > 0
    }
}

impl Default for Fraction {
    fn default() -> Self {
        Self::NTSC
    }
}

/// Duration of one frame at `framerate`, falling back to 29.97 fps.
pub fn frame_duration(framerate: Option<Fraction>) -> Duration {
    let rate = framerate
        .filter(Fraction::is_valid)
        .unwrap_or(Fraction::NTSC);
    let nanos = 1_000_000_000u64 * u64::from(rate.denominator) / u64::from(rate.numerator);
    Duration::from_nanos(nanos)
}

/// Target SoC family; selects the codec's maximum geometry and output layout.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    Dm6467,
    #[default]
    Dm6446,
    Dm355,
    Omap3530,
}

impl FromStr for Device {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "dm6467" => Ok(Self::Dm6467),
            "dm6446" => Ok(Self::Dm6446),
            "dm355" => Ok(Self::Dm355),
            "omap3530" => Ok(Self::Omap3530),
            other => Err(Error::Config(format!("unknown device {other:?}"))),
        }
    }
}

/// Codec parameters that depend on the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceDefaults {
    pub max_width: u32,
    pub max_height: u32,
    pub color_space: ColorSpace,
    pub num_output_buffers: usize,
}

impl Device {
    pub fn defaults(self) -> DeviceDefaults {
        match self {
            // 1080i plus the 8 lines the decoder writes past the picture.
            Device::Dm6467 => DeviceDefaults {
                max_width: 1920,
                max_height: 1080 + 8,
                color_space: ColorSpace::Yuv420PSemi,
                num_output_buffers: 5,
            },
            _ => DeviceDefaults {
                max_width: 720,
                max_height: 576,
                color_space: ColorSpace::Uyvy,
                num_output_buffers: 3,
            },
        }
    }
}

/// Decoder stream configuration.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct DecoderConfig {
    /// Codec engine holding the decoder.
    pub engine_name: String,
    /// Codec to instantiate inside the engine.
    pub codec_name: String,
    pub device: Device,
    /// Picture width; 0 selects the device maximum.
    pub width: u32,
    /// Picture height; 0 selects the device maximum.
    pub height: u32,
    pub framerate: Option<Fraction>,
    /// Output buffers to allocate; 0 selects the device default.
    pub num_output_buffers: usize,
    pub num_input_buffers: usize,
    /// Input buffer size; 0 uses the output buffer size.
    pub input_buffer_size: usize,
    pub fifo_capacity: usize,
    /// Stamp decoded frames with the input timestamp and one frame duration.
    pub gen_timestamps: bool,
    /// Ask for SCHED_FIFO on the decode thread; a refusal is logged and
    /// decoding goes on at normal priority.
    pub realtime_priority: bool,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            engine_name: DEFAULT_ENGINE_NAME.to_string(),
            codec_name: String::new(),
            device: Device::default(),
            width: 0,
            height: 0,
            framerate: None,
            num_output_buffers: 0,
            num_input_buffers: DEFAULT_NUM_INPUT_BUFFERS,
            input_buffer_size: 0,
            fifo_capacity: DEFAULT_FIFO_CAPACITY,
            gen_timestamps: true,
            realtime_priority: true,
        }
    }
}

impl DecoderConfig {
    /// Parses a configuration document.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`] for malformed JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Picture width, defaulting to the device maximum.
    pub fn effective_width(&self) -> u32 {
        if self.width == 0 {
            self.device.defaults().max_width
        } else {
            self.width
        }
    }

    pub fn effective_height(&self) -> u32 {
        if self.height == 0 {
            self.device.defaults().max_height
        } else {
            self.height
        }
    }

    pub fn effective_output_buffers(&self) -> usize {
        if self.num_output_buffers == 0 {
            self.device.defaults().num_output_buffers
        } else {
            self.num_output_buffers
        }
    }

    /// Size of one decoded video frame: line length times height.
    pub fn video_output_size(&self) -> usize {
        let color_space = self.device.defaults().color_space;
        color_space.line_length(self.effective_width()) as usize * self.effective_height() as usize
    }

    pub fn frame_duration(&self) -> Duration {
        frame_duration(self.framerate)
    }

    /// Checks the fields that have no usable default.
    pub fn validate(&self) -> Result<()> {
        if self.codec_name.is_empty() {
            return Err(Error::Config("codec name is not set".into()));
        }
        if self.engine_name.is_empty() {
            return Err(Error::Config("engine name is not set".into()));
        }
        if self.num_input_buffers == 0 {
            return Err(Error::Config("at least one input buffer is needed".into()));
        }
        // Every queued frame holds an input buffer; the drain sentinel needs one more slot.
        if self.fifo_capacity <= self.num_input_buffers {
            return Err(Error::Config(format!(
                "fifo capacity {} must exceed the {} input buffers",
                self.fifo_capacity, self.num_input_buffers
            )));
        }
        Ok(())
    }
}

/// Encoder stream configuration.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct EncoderConfig {
    pub engine_name: String,
    pub codec_name: String,
    /// Bytes per raw input frame; 0 takes the size of the first input buffer.
    pub in_buffer_size: usize,
    /// Output ring size; 0 selects three input frames.
    pub out_buffer_size: usize,
    pub width: u32,
    pub height: u32,
    pub framerate: Option<Fraction>,
    pub color_space: Option<ColorSpace>,
    pub channels: u32,
    pub rate: u32,
    /// Bits per audio sample.
    pub sample_width: u32,
    /// Emit H.264 as length-prefixed NAL units instead of a byte stream.
    pub packetized: bool,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            engine_name: DEFAULT_ENCODE_ENGINE_NAME.to_string(),
            codec_name: String::new(),
            in_buffer_size: 0,
            out_buffer_size: 0,
            width: 0,
            height: 0,
            framerate: None,
            color_space: None,
            channels: 0,
            rate: 0,
            sample_width: 0,
            packetized: false,
        }
    }
}

impl EncoderConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Input frame size implied by the video geometry, if any.
    pub fn video_frame_size(&self) -> Option<usize> {
        let color_space = self.color_space?;
        (self.width > 0 && self.height > 0)
            .then(|| color_space.frame_size(self.width, self.height))
    }

    /// Output ring size for an input frame of `in_size` bytes.
    pub fn ring_size(&self, in_size: usize) -> usize {
        if self.out_buffer_size == 0 {
            in_size * 3
        } else {
            self.out_buffer_size
        }
    }

    pub fn frame_duration(&self) -> Duration {
        frame_duration(self.framerate)
    }
}
