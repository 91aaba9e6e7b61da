// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Contract between the engines and a hardware codec instance.
//!
//! The engines never talk to the DSP directly; they drive a [`Codec`] (or
//! [`EncoderCodec`]) obtained from an [`OpenCodec`] factory. The shipped
//! factory is [`crate::engine::EngineLibrary`], which reaches the vendor
//! engine through a runtime-loaded library; tests plug in scripted codecs.
//!
//! A codec instance is not thread-safe. The decoder opens, drives and drops
//! its instance on the worker thread and nowhere else.

use crate::config::{ColorSpace, DecoderConfig, EncoderConfig};
use crate::pool::{BufferPool, PoolBuffer};
use crate::Result;

/// Classification of a codec process status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecStatus {
    Ok,
    /// The access unit was corrupt; the codec may or may not have resynchronized.
    BitError,
    /// Only the first field of an interlaced frame was decoded.
    FirstField,
    Fatal(i32),
}

impl CodecStatus {
    pub const RAW_OK: i32 = 0;
    pub const RAW_BIT_ERROR: i32 = 1;
    pub const RAW_FIRST_FIELD: i32 = 2;

    /// Maps a raw status: 0 ok, 1 bit error, 2 first field, negative fatal.
    /// Other positive codes are informational and count as success.
    pub fn from_raw(code: i32) -> Self {
        match code {
            c if c < 0 => CodecStatus::Fatal(c),
            Self::RAW_BIT_ERROR => CodecStatus::BitError,
            Self::RAW_FIRST_FIELD => CodecStatus::FirstField,
            _ => CodecStatus::Ok,
        }
    }

    pub fn is_fatal(self) -> bool {
        matches!(self, CodecStatus::Fatal(_))
    }
}

/// Audio and video decoders differ in how bit errors are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecKind {
    Audio,
    Video,
}

/// Result of one decode call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessOutcome {
    pub status: CodecStatus,
    /// Input bytes the codec consumed.
    pub consumed: usize,
}

/// Creation parameters for a decoder instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecoderParams {
    pub kind: CodecKind,
    pub max_width: u32,
    pub max_height: u32,
    pub color_space: ColorSpace,
}

impl DecoderParams {
    pub fn from_config(config: &DecoderConfig, kind: CodecKind) -> Self {
        let defaults = config.device.defaults();
        Self {
            kind,
            max_width: defaults.max_width,
            max_height: defaults.max_height,
            color_space: defaults.color_space,
        }
    }
}

/// A decoder instance.
pub trait Codec: Send {
    /// Minimum size of each output buffer.
    fn output_buffer_size(&self) -> usize;

    /// Hands the codec the pool it decodes into; called once before the first
    /// [`Self::process`].
    fn set_output_pool(&mut self, pool: &BufferPool) -> Result<()>;

    /// Decodes `input` into `output`. An empty `input` after [`Self::flush`]
    /// retrieves the frames the codec still holds.
    fn process(&mut self, input: &[u8], output: &PoolBuffer) -> Result<ProcessOutcome>;

    /// Next buffer ready for display, if any.
    fn display_buffer(&mut self) -> Option<PoolBuffer>;

    /// Next buffer the codec no longer references, if any.
    fn free_buffer(&mut self) -> Option<PoolBuffer>;

    /// Makes the codec give up every frame it holds.
    fn flush(&mut self) -> Result<()>;

    /// Channel count of decoded audio.
    fn channels(&self) -> Option<u32> {
        None
    }
}

/// Picture coding type of an encoded frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameType {
    I,
    P,
    B,
    #[default]
    Unknown,
}

impl FrameType {
    pub fn from_raw(code: i32) -> Self {
        match code {
            0 => FrameType::I,
            1 => FrameType::P,
            2 => FrameType::B,
            _ => FrameType::Unknown,
        }
    }
}

/// An encoder instance.
pub trait EncoderCodec: Send {
    /// Encodes one raw frame into `output`; returns the bytes produced.
    fn process(&mut self, input: &[u8], output: &mut [u8]) -> Result<usize>;

    /// Coding type of the frame produced by the last [`Self::process`].
    fn frame_type(&self) -> FrameType;
}

/// Opens codec instances inside a named engine.
pub trait OpenCodec: Send + Sync {
    fn open_decoder(
        &self,
        engine: &str,
        codec: &str,
        params: &DecoderParams,
    ) -> Result<Box<dyn Codec>>;

    fn open_encoder(
        &self,
        engine: &str,
        codec: &str,
        config: &EncoderConfig,
    ) -> Result<Box<dyn EncoderCodec>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_status_classification() {
        assert_eq!(CodecStatus::from_raw(0), CodecStatus::Ok);
        assert_eq!(CodecStatus::from_raw(1), CodecStatus::BitError);
        assert_eq!(CodecStatus::from_raw(2), CodecStatus::FirstField);
        assert_eq!(CodecStatus::from_raw(7), CodecStatus::Ok);
        assert!(CodecStatus::from_raw(-1).is_fatal());
        assert!(!CodecStatus::BitError.is_fatal());
    }
}
