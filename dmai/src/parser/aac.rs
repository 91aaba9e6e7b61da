// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! AAC framing.
//!
//! Raw AAC coming out of a container carries its configuration out of band
//! (an AudioSpecificConfig). The DSP decoder wants an ADIF header in front
//! of the first frame instead, so one is synthesized from the
//! configuration and prepended once.

use tracing::{debug, trace};

use super::{Accumulator, StreamConfig, StreamParser, copy_frame};
use crate::sync::FlushFlag;
use crate::{Error, Result};

pub const MAIN_PROFILE: u8 = 1;
pub const LC_PROFILE: u8 = 2;
pub const SSR_PROFILE: u8 = 3;
pub const LTP_PROFILE: u8 = 4;
pub const HEAAC_PROFILE: u8 = 5;

/// Maximum number of bytes in a synthesized ADIF header.
pub const MAX_AAC_HEADER_LENGTH: usize = 20;

const ADTS_HEADER_LEN: usize = 7;

/// Output channels for each codec channel mode.
const CHANNEL_MODES: [u32; 11] = [1, 2, 2, 3, 3, 4, 4, 5, 5, 6, 7];

/// Channels produced by the decoder for `mode`, or `None` for an unknown mode.
pub fn channels_for_mode(mode: usize) -> Option<u32> {
    CHANNEL_MODES.get(mode).copied()
}

/// Fields of an MPEG-4 AudioSpecificConfig the ADIF header needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioSpecificConfig {
    pub object_type: u8,
    pub frequency_index: u8,
    pub channel_config: u8,
}

impl AudioSpecificConfig {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let [b0, b1, ..] = data else {
            return Err(Error::Config(format!(
                "AudioSpecificConfig needs 2 bytes, got {}",
                data.len()
            )));
        };
        Ok(Self {
            object_type: b0 >> 3,
            frequency_index: ((b0 & 0x07) << 1) | (b1 >> 7),
            channel_config: (b1 >> 3) & 0x0f,
        })
    }
}

/// An ADIF header built field by field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdifHeader {
    bytes: [u8; MAX_AAC_HEADER_LENGTH],
}

impl Default for AdifHeader {
    fn default() -> Self {
        let mut bytes = [0u8; MAX_AAC_HEADER_LENGTH];
        bytes[..4].copy_from_slice(b"ADIF");
        // copyright_id_present
        bytes[4] &= !0x01;
        Self { bytes }
    }
}

impl AdifHeader {
    pub fn set_profile(&mut self, value: u8) -> &mut Self {
        self.bytes[10] |= value & 0x2;
        self.bytes[11] |= (value & 0x1) << 7;
        self
    }

    pub fn set_sampling_frequency_index(&mut self, value: u8) -> &mut Self {
        self.bytes[11] |= value << 3;
        self
    }

    pub fn set_front_channel_elements(&mut self, value: u8) -> &mut Self {
        self.bytes[11] |= value >> 1;
        self.bytes[12] |= (value & 0x1) << 7;
        self
    }

    pub fn set_comment_field(&mut self, value: u8) -> &mut Self {
        self.bytes[16] |= value;
        self
    }

    /// Header for a stream described by `asc`.
    pub fn from_config(asc: &AudioSpecificConfig) -> Self {
        let mut header = Self::default();
        header
            .set_profile(asc.object_type.saturating_sub(1))
            .set_sampling_frequency_index(asc.frequency_index)
            .set_front_channel_elements(asc.channel_config)
            .set_comment_field(0);
        header
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// What the front of the accumulated data looks like.
#[derive(Debug, PartialEq, Eq)]
enum Adts {
    /// No ADTS sync word; the data is taken as-is.
    Raw,
    /// A sync word but not the whole header yet.
    Incomplete,
    /// An ADTS frame of this many bytes, header included.
    Frame(usize),
}

fn adts_frame(data: &[u8]) -> Adts {
    match data {
        [0xff, b1, ..] if b1 & 0xf0 == 0xf0 => {}
        _ => return Adts::Raw,
    }
    if data.len() < ADTS_HEADER_LEN {
        return Adts::Incomplete;
    }
    let len = ((data[3] as usize & 0x03) << 11) | ((data[4] as usize) << 3) | (data[5] as usize >> 5);
    if len < ADTS_HEADER_LEN {
        Adts::Raw
    } else {
        Adts::Frame(len)
    }
}

/// Parser for AAC streams.
pub struct AacParser {
    flushing: FlushFlag,
    framed: bool,
    header: Option<AdifHeader>,
    header_sent: bool,
}

impl AacParser {
    pub fn new(flushing: FlushFlag) -> Self {
        Self {
            flushing,
            framed: false,
            header: None,
            header_sent: false,
        }
    }

    pub fn header(&self) -> Option<&AdifHeader> {
        self.header.as_ref()
    }
}

impl StreamParser for AacParser {
    fn name(&self) -> &'static str {
        "aac"
    }

    fn init(&mut self, config: &StreamConfig) -> Result<()> {
        self.framed = config.framed;
        self.header_sent = false;
        self.header = match config.codec_data.as_deref().map(AudioSpecificConfig::parse) {
            Some(Ok(asc)) => {
                debug!(
                    object_type = asc.object_type,
                    frequency_index = asc.frequency_index,
                    channels = asc.channel_config,
                    "synthesizing ADIF header"
                );
                Some(AdifHeader::from_config(&asc))
            }
            Some(Err(err)) => {
                debug!("Ignoring codec_data: {}", err);
                None
            }
            None => None,
        };
        Ok(())
    }

    fn parse(&mut self, acc: &mut Accumulator) -> Option<usize> {
        if self.flushing.is_raised() || acc.is_empty() {
            return None;
        }
        if self.framed {
            return Some(acc.len());
        }
        match adts_frame(acc.as_slice()) {
            Adts::Frame(len) if len <= acc.len() => {
                trace!(len, "found ADTS frame");
                Some(len)
            }
            Adts::Frame(_) | Adts::Incomplete => None,
            Adts::Raw => Some(acc.len()),
        }
    }

    fn flush_start(&mut self) {
        self.flushing.raise();
    }

    fn flush_stop(&mut self) {
        self.flushing.clear();
    }

    fn clean(&mut self) {
        self.header = None;
        self.header_sent = false;
    }

    fn custom_memcpy(&mut self, dest: &mut [u8], frame: &[u8]) -> Result<usize> {
        let header = match &self.header {
            Some(header) if !self.header_sent => header.as_bytes(),
            _ => return copy_frame(dest, frame),
        };
        let needed = header.len() + frame.len();
        if needed > dest.len() {
            return Err(Error::Capacity {
                needed,
                available: dest.len(),
            });
        }
        dest[..header.len()].copy_from_slice(header);
        dest[header.len()..needed].copy_from_slice(frame);
        self.header_sent = true;
        Ok(needed)
    }
}
