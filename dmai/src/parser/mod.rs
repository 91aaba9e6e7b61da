// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Elementary stream parsers.
//!
//! The pipeline pushes arbitrary chunks of a compressed stream; the hardware
//! codec wants exactly one access unit per call. A [`StreamParser`] looks at
//! the bytes gathered in an [`Accumulator`] and reports how many of them, from
//! the front, form the next complete access unit.
//!
//! Variants:
//!
//! - [`h264::H264Parser`] scans for NAL unit boundaries and rewrites
//!   packetized (avcC) input into a start-code byte stream.
//! - [`aac::AacParser`] trusts upstream framing and prefixes the first frame
//!   with a synthesized ADIF header.
//! - [`passthrough::PassthroughParser`] trusts upstream framing.

pub mod aac;
pub mod h264;
pub mod passthrough;

use crate::sync::FlushFlag;
use crate::{Error, Result};

/// Stream description taken from the negotiated input format.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamConfig {
    /// Media type of the input, e.g. `video/x-h264`.
    pub media_type: String,
    /// Out-of-band codec configuration (avcC box, AudioSpecificConfig).
    pub codec_data: Option<Vec<u8>>,
    /// Upstream already delivers one access unit per buffer.
    pub parsed: bool,
    /// Upstream delivers complete audio frames.
    pub framed: bool,
    pub rate: Option<u32>,
    pub channels: Option<u32>,
}

impl StreamConfig {
    pub fn new(media_type: impl Into<String>) -> Self {
        Self {
            media_type: media_type.into(),
            ..Default::default()
        }
    }

    pub fn with_codec_data(mut self, codec_data: impl Into<Vec<u8>>) -> Self {
        self.codec_data = Some(codec_data.into());
        self
    }

    pub fn with_parsed(mut self, parsed: bool) -> Self {
        self.parsed = parsed;
        self
    }

    pub fn with_framed(mut self, framed: bool) -> Self {
        self.framed = framed;
        self
    }
}

/// Compressed bytes waiting to be framed.
///
/// `marker` is the offset where the next scan resumes, so a partial scan is
/// not repeated when more data arrives.
#[derive(Debug, Default, Clone)]
pub struct Accumulator {
    data: Vec<u8>,
    marker: usize,
}

impl Accumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a chunk of input.
    pub fn push(&mut self, chunk: &[u8]) {
        self.data.extend_from_slice(chunk);
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn marker(&self) -> usize {
        self.marker
    }

    pub fn set_marker(&mut self, marker: usize) {
        self.marker = marker.min(self.data.len());
    }

    /// Removes and returns the first `n` bytes; the marker moves with the data.
    pub fn take(&mut self, n: usize) -> Vec<u8> {
        let n = n.min(self.data.len());
        let rest = self.data.split_off(n);
        self.marker = self.marker.saturating_sub(n);
        std::mem::replace(&mut self.data, rest)
    }

    /// Drops everything gathered so far.
    pub fn clear(&mut self) {
        self.data.clear();
        self.marker = 0;
    }
}

/// Frames a compressed byte stream into access units.
///
/// The engine calls [`Self::parse`] after every push until it returns
/// `None`, and [`Self::drain`] at end of stream until it returns 0, which
/// stands for the end-of-stream sentinel.
pub trait StreamParser: Send {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Picks up out-of-band configuration. A missing or malformed
    /// configuration is not an error; the parser falls back to scanning.
    fn init(&mut self, config: &StreamConfig) -> Result<()>;

    /// Length of the next complete access unit at the front of `acc`.
    fn parse(&mut self, acc: &mut Accumulator) -> Option<usize>;

    /// Length of whatever is left in `acc`; 0 once nothing remains.
    fn drain(&mut self, acc: &mut Accumulator) -> usize {
        acc.set_marker(0);
        acc.len()
    }

    fn flush_start(&mut self);

    fn flush_stop(&mut self);

    /// Releases any cached configuration.
    fn clean(&mut self);

    /// Copies one access unit into a codec input buffer, rewriting it on the
    /// way if the stream format requires it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Capacity`] if `dest` is too small; nothing usable is
    /// left in `dest` in that case.
    fn custom_memcpy(&mut self, dest: &mut [u8], frame: &[u8]) -> Result<usize> {
        copy_frame(dest, frame)
    }
}

/// Plain copy with a capacity check.
pub fn copy_frame(dest: &mut [u8], frame: &[u8]) -> Result<usize> {
    if frame.len() > dest.len() {
        return Err(Error::Capacity {
            needed: frame.len(),
            available: dest.len(),
        });
    }
    dest[..frame.len()].copy_from_slice(frame);
    Ok(frame.len())
}

/// Builds the parser a registry entry asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserKind {
    H264,
    Aac,
    Passthrough,
}

impl ParserKind {
    pub fn build(self, flushing: FlushFlag) -> Box<dyn StreamParser> {
        match self {
            ParserKind::H264 => Box::new(h264::H264Parser::new(flushing)),
            ParserKind::Aac => Box::new(aac::AacParser::new(flushing)),
            ParserKind::Passthrough => Box::new(passthrough::PassthroughParser::new(flushing)),
        }
    }
}
