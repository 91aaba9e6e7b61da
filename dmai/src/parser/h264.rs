// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! H.264 access unit framing and avcC handling.
//!
//! Byte-stream input is split on NAL unit boundaries: by default an access
//! unit starts at each VCL slice NAL (types 1 to 5), but once an access unit
//! delimiter (type 9) has been seen the stream is framed on delimiters only.
//!
//! Packetized input (MP4 style, announced by an avcC `codec_data`) is
//! already framed. Each frame is rewritten to a byte stream on its way into
//! the codec: the cached SPS/PPS go first, then every length-prefixed NAL
//! unit gets a start code in place of its length field.

use tracing::{debug, trace, warn};

use super::{Accumulator, StreamConfig, StreamParser, copy_frame};
use crate::sync::FlushFlag;
use crate::{Error, Result};

/// Annex-B start code prefix.
pub const START_CODE: [u8; 4] = [0, 0, 0, 1];

pub const NAL_SPS: u8 = 7;
pub const NAL_PPS: u8 = 8;
pub const NAL_AUD: u8 = 9;

/// Smallest avcC box with a usable header.
const AVCC_MIN_LEN: usize = 7;
/// Length field size used for packetized output.
const PACKETIZED_LENGTH_SIZE: u8 = 4;

const DEFAULT_PROFILE: u8 = 66;
const DEFAULT_LEVEL: u8 = 30;

/// Decoded avcC (AVCDecoderConfigurationRecord) box.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvcConfig {
    pub version: u8,
    pub profile: u8,
    pub compatibility: u8,
    pub level: u8,
    /// Size in bytes (1 to 4) of the length field preceding every NAL unit.
    pub nal_length_size: u8,
    pub sps: Vec<Vec<u8>>,
    pub pps: Vec<Vec<u8>>,
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn u8(&mut self) -> Result<u8> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos + n;
        let slice = self
            .data
            .get(self.pos..end)
            .ok_or_else(|| Error::Config(format!("avcC truncated at byte {}", self.pos)))?;
        self.pos = end;
        Ok(slice)
    }

    fn units(&mut self, count: usize) -> Result<Vec<Vec<u8>>> {
        (0..count)
            .map(|_| {
                let len = self.u16()? as usize;
                Ok(self.bytes(len)?.to_vec())
            })
            .collect()
    }
}

impl AvcConfig {
    /// Parses an avcC box.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the box is shorter than its header or
    /// than the parameter sets it announces.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < AVCC_MIN_LEN {
            return Err(Error::Config(format!(
                "avcC needs at least {AVCC_MIN_LEN} bytes, got {}",
                data.len()
            )));
        }
        let mut reader = Reader { data, pos: 0 };
        let version = reader.u8()?;
        let profile = reader.u8()?;
        let compatibility = reader.u8()?;
        let level = reader.u8()?;
        let nal_length_size = (reader.u8()? & 0x03) + 1;
        let num_sps = (reader.u8()? & 0x1f) as usize;
        let sps = reader.units(num_sps)?;
        let num_pps = reader.u8()? as usize;
        let pps = reader.units(num_pps)?;
        Ok(Self {
            version,
            profile,
            compatibility,
            level,
            nal_length_size,
            sps,
            pps,
        })
    }

    /// Serializes the box.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![
            self.version,
            self.profile,
            self.compatibility,
            self.level,
            0xfc | (self.nal_length_size.clamp(1, 4) - 1),
            0xe0 | (self.sps.len() as u8 & 0x1f),
        ];
        for sps in &self.sps {
            out.extend_from_slice(&(sps.len() as u16).to_be_bytes());
            out.extend_from_slice(sps);
        }
        out.push(self.pps.len() as u8);
        for pps in &self.pps {
            out.extend_from_slice(&(pps.len() as u16).to_be_bytes());
            out.extend_from_slice(pps);
        }
        out
    }

    /// SPS then PPS units, each behind a start code.
    pub fn annex_b(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for unit in self.sps.iter().chain(self.pps.iter()) {
            out.extend_from_slice(&START_CODE);
            out.extend_from_slice(unit);
        }
        out
    }
}

/// Offsets of NAL units in a byte stream as `(header, end)` pairs, where
/// `header` is the index of the NAL header byte following the start code.
fn nal_units(data: &[u8]) -> Vec<(usize, usize)> {
    let mut starts = Vec::new();
    let mut i = 0;
    while i + 4 < data.len() {
        if data[i..i + 4] == START_CODE {
            starts.push(i);
            i += 4;
        } else {
            i += 1;
        }
    }
    starts
        .iter()
        .enumerate()
        .map(|(k, &start)| {
            let end = starts.get(k + 1).copied().unwrap_or(data.len());
            (start + 4, end)
        })
        .collect()
}

/// Returns the payload (header byte included) of the first NAL of `nal_type`.
pub fn fetch_nal(data: &[u8], nal_type: u8) -> Option<&[u8]> {
    let found = nal_units(data)
        .into_iter()
        .find(|&(header, _)| data[header] & 0x1f == nal_type)
        .map(|(header, end)| &data[header..end]);
    match found {
        Some(nal) => debug!(nal_type, len = nal.len(), "found NAL"),
        None => debug!(nal_type, "NAL not found"),
    }
    found
}

/// Builds an avcC box from the SPS/PPS found in an encoded byte-stream frame.
///
/// Without an SPS the header falls back to Baseline profile, level 3.0.
pub fn generate_codec_data(frame: &[u8]) -> Vec<u8> {
    let sps = fetch_nal(frame, NAL_SPS);
    let pps = fetch_nal(frame, NAL_PPS);
    let (profile, compatibility, level) = match sps {
        Some(sps) if sps.len() >= 4 => (sps[1], sps[2], sps[3]),
        _ => {
            warn!("No SPS found, using default profile and level");
            (DEFAULT_PROFILE, 0, DEFAULT_LEVEL)
        }
    };
    AvcConfig {
        version: 1,
        profile,
        compatibility,
        level,
        nal_length_size: PACKETIZED_LENGTH_SIZE,
        sps: sps.map(|s| vec![s.to_vec()]).unwrap_or_default(),
        pps: pps.map(|p| vec![p.to_vec()]).unwrap_or_default(),
    }
    .to_bytes()
}

/// Converts a byte-stream frame to 4-byte length-prefixed NAL units.
///
/// SPS and PPS units are dropped (they travel in `codec_data`), as is
/// anything before the first start code.
pub fn bytestream_to_packetized(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    for (header, end) in nal_units(data) {
        let nal_type = data[header] & 0x1f;
        if nal_type == NAL_SPS || nal_type == NAL_PPS {
            continue;
        }
        out.extend_from_slice(&((end - header) as u32).to_be_bytes());
        out.extend_from_slice(&data[header..end]);
    }
    out
}

fn read_length(field: &[u8]) -> usize {
    field
        .iter()
        .fold(0usize, |acc, &byte| (acc << 8) | byte as usize)
}

/// Rewrites one packetized frame into `dest` as a byte stream behind `prefix`.
fn rewrite_packetized(
    dest: &mut [u8],
    frame: &[u8],
    prefix: &[u8],
    nal_length_size: usize,
) -> Result<usize> {
    let mut units = Vec::new();
    let mut needed = prefix.len();
    let mut offset = 0;
    while offset < frame.len() {
        let field = frame.get(offset..offset + nal_length_size).ok_or_else(|| {
            Error::Bitstream(format!("length field truncated at byte {offset}"))
        })?;
        let size = read_length(field);
        offset += nal_length_size;
        let end = offset + size;
        if end > frame.len() {
            return Err(Error::Bitstream(format!(
                "NAL unit of {size} bytes overruns frame of {} bytes",
                frame.len()
            )));
        }
        units.push(offset..end);
        needed += START_CODE.len() + size;
        offset = end;
    }
    if needed > dest.len() {
        return Err(Error::Capacity {
            needed,
            available: dest.len(),
        });
    }

    dest[..prefix.len()].copy_from_slice(prefix);
    let mut written = prefix.len();
    for unit in units {
        dest[written..written + START_CODE.len()].copy_from_slice(&START_CODE);
        written += START_CODE.len();
        let len = unit.len();
        dest[written..written + len].copy_from_slice(&frame[unit]);
        written += len;
    }
    trace!(written, "rewrote packetized frame");
    Ok(written)
}

/// Parser for H.264 elementary streams.
pub struct H264Parser {
    flushing: FlushFlag,
    au_found: bool,
    au_delimiters: bool,
    /// Upstream delivers whole access units.
    parsed: bool,
    avc: Option<AvcConfig>,
    /// Annex-B SPS/PPS blob prepended to every packetized frame.
    sps_pps: Option<Vec<u8>>,
}

impl H264Parser {
    pub fn new(flushing: FlushFlag) -> Self {
        Self {
            flushing,
            au_found: false,
            au_delimiters: false,
            parsed: false,
            avc: None,
            sps_pps: None,
        }
    }

    /// The avcC configuration picked up at init, if any.
    pub fn avc_config(&self) -> Option<&AvcConfig> {
        self.avc.as_ref()
    }

    /// Scans `data` from `from`; returns the boundary found (if any) and
    /// where the next scan should resume.
    fn scan(&mut self, data: &[u8], from: usize) -> (Option<usize>, usize) {
        let mut i = from;
        while i + 5 <= data.len() {
            if self.flushing.is_raised() {
                self.au_delimiters = false;
                self.au_found = false;
                return (None, from);
            }
            if data[i..i + 4] == START_CODE {
                let nal_type = data[i + 4] & 0x1f;
                if nal_type == NAL_AUD {
                    self.au_delimiters = true;
                }
                let starts_unit = if self.au_delimiters {
                    nal_type == NAL_AUD
                } else {
                    (1..=5).contains(&nal_type)
                };
                if starts_unit {
                    if !self.au_found {
                        trace!(offset = i, nal_type, "found first NAL of access unit");
                        self.au_found = true;
                    } else {
                        trace!(offset = i, nal_type, "found next access unit");
                        self.au_found = false;
                        return (Some(i), i);
                    }
                }
            }
            i += 1;
        }
        (None, i)
    }
}

impl StreamParser for H264Parser {
    fn name(&self) -> &'static str {
        "h264"
    }

    fn init(&mut self, config: &StreamConfig) -> Result<()> {
        self.parsed = config.parsed;
        self.avc = None;
        self.sps_pps = None;

        if let Some(codec_data) = &config.codec_data {
            if codec_data.len() < AVCC_MIN_LEN {
                debug!("codec_data is not a valid avcC header");
            } else {
                match AvcConfig::parse(codec_data) {
                    Ok(avc) => {
                        debug!(
                            version = avc.version,
                            profile = avc.profile,
                            level = avc.level,
                            nal_length_size = avc.nal_length_size,
                            "using avcC codec_data"
                        );
                        self.parsed = true;
                        self.sps_pps = Some(avc.annex_b());
                        self.avc = Some(avc);
                    }
                    Err(err) => warn!("Ignoring codec_data: {}", err),
                }
            }
        }
        debug!(parsed = self.parsed, "parser initialized");
        Ok(())
    }

    fn parse(&mut self, acc: &mut Accumulator) -> Option<usize> {
        if self.parsed {
            return (!acc.is_empty()).then(|| acc.len());
        }
        let (boundary, resume) = self.scan(acc.as_slice(), acc.marker());
        acc.set_marker(resume);
        // A boundary at the very front means a lone NAL left over from a reset.
        boundary.filter(|&at| at > 0)
    }

    fn drain(&mut self, acc: &mut Accumulator) -> usize {
        self.au_found = false;
        acc.set_marker(0);
        acc.len()
    }

    fn flush_start(&mut self) {
        self.flushing.raise();
        debug!("parser flushing");
    }

    fn flush_stop(&mut self) {
        self.flushing.clear();
        self.au_delimiters = false;
        self.au_found = false;
        debug!("parser flush stopped");
    }

    fn clean(&mut self) {
        self.avc = None;
        self.sps_pps = None;
        self.parsed = false;
    }

    fn custom_memcpy(&mut self, dest: &mut [u8], frame: &[u8]) -> Result<usize> {
        match (&self.sps_pps, &self.avc) {
            (Some(prefix), Some(avc)) => {
                rewrite_packetized(dest, frame, prefix, avc.nal_length_size as usize)
            }
            _ => copy_frame(dest, frame),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    const SPS: &[u8] = &[0x67, 0x42, 0x00, 0x1e, 0xab, 0xcd];
    const PPS: &[u8] = &[0x68, 0xce, 0x3c, 0x80];

    fn nal(nal_type: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = START_CODE.to_vec();
        out.push(nal_type);
        out.extend_from_slice(payload);
        out
    }

    fn parser() -> H264Parser {
        let mut parser = H264Parser::new(FlushFlag::new());
        parser.init(&StreamConfig::new("video/x-h264")).unwrap();
        parser
    }

    fn avcc() -> Vec<u8> {
        AvcConfig {
            version: 1,
            profile: 0x42,
            compatibility: 0,
            level: 0x1e,
            nal_length_size: 4,
            sps: vec![SPS.to_vec()],
            pps: vec![PPS.to_vec()],
        }
        .to_bytes()
    }

    #[test]
    fn splits_on_second_slice_nal() {
        let first = nal(0x65, &[1, 2, 3, 4]);
        let second = nal(0x41, &[5, 6, 7, 8]);
        let mut acc = Accumulator::new();
        acc.push(&first);
        acc.push(&second);

        let mut parser = parser();
        assert_eq!(parser.parse(&mut acc), Some(first.len()));
        assert_eq!(acc.take(first.len()), first);

        assert_eq!(parser.parse(&mut acc), None);
        assert_eq!(parser.parse(&mut acc), None);

        acc.push(&nal(0x41, &[9, 9]));
        assert_eq!(parser.parse(&mut acc), Some(second.len()));
    }

    #[test]
    fn access_unit_delimiters_take_over_framing() {
        let mut stream = nal(NAL_AUD, &[0xf0]);
        stream.extend(nal(NAL_SPS, SPS));
        stream.extend(nal(0x65, &[1, 2, 3]));
        stream.extend(nal(0x41, &[4, 5, 6]));
        let second_au = stream.len();
        stream.extend(nal(NAL_AUD, &[0xf0]));
        stream.extend(nal(0x41, &[7, 8, 9]));

        let mut acc = Accumulator::new();
        acc.push(&stream);
        let mut parser = parser();
        assert_eq!(parser.parse(&mut acc), Some(second_au));
    }

    #[test]
    fn raised_flush_flag_aborts_scan() {
        let flushing = FlushFlag::new();
        let mut parser = H264Parser::new(flushing.clone());
        parser.init(&StreamConfig::new("video/x-h264")).unwrap();

        let mut acc = Accumulator::new();
        acc.push(&nal(NAL_AUD, &[0]));
        acc.push(&nal(0x65, &[1]));
        acc.push(&nal(NAL_AUD, &[0]));

        flushing.raise();
        assert_eq!(parser.parse(&mut acc), None);
        assert!(!parser.au_found);
        assert!(!parser.au_delimiters);

        parser.flush_stop();
        assert!(!flushing.is_raised());
        assert_eq!(parser.parse(&mut acc), Some(5 + 1 + 5 + 1));
    }

    #[test]
    fn parsed_streams_pass_whole_buffers() {
        let mut parser = H264Parser::new(FlushFlag::new());
        parser
            .init(&StreamConfig::new("video/x-h264").with_parsed(true))
            .unwrap();
        let mut acc = Accumulator::new();
        assert_eq!(parser.parse(&mut acc), None);
        acc.push(&[1, 2, 3]);
        assert_eq!(parser.parse(&mut acc), Some(3));
    }

    #[test]
    fn avcc_round_trip_preserves_parameter_sets() {
        let bytes = avcc();
        let parsed = AvcConfig::parse(&bytes).unwrap();
        assert_eq!(parsed.sps, vec![SPS.to_vec()]);
        assert_eq!(parsed.pps, vec![PPS.to_vec()]);
        assert_eq!(parsed.nal_length_size, 4);
        assert_eq!(parsed.to_bytes(), bytes);
    }

    #[test]
    fn truncated_avcc_is_rejected_and_ignored_by_init() {
        let bytes = avcc();
        assert!(matches!(
            AvcConfig::parse(&bytes[..bytes.len() - 2]),
            Err(Error::Config(_))
        ));

        let mut parser = H264Parser::new(FlushFlag::new());
        parser
            .init(&StreamConfig::new("video/x-h264").with_codec_data(&bytes[..bytes.len() - 2]))
            .unwrap();
        assert!(parser.avc_config().is_none());
        assert!(!parser.parsed);
    }

    #[test]
    fn packetized_frames_become_byte_stream() {
        let mut parser = H264Parser::new(FlushFlag::new());
        parser
            .init(&StreamConfig::new("video/x-h264").with_codec_data(avcc()))
            .unwrap();

        let units: [&[u8]; 3] = [&[0x65, 1, 2, 3, 4], &[0x41, 5, 6], &[0x41, 7]];
        let mut frame = Vec::new();
        for unit in units {
            frame.extend_from_slice(&(unit.len() as u32).to_be_bytes());
            frame.extend_from_slice(unit);
        }

        let mut dest = vec![0u8; 128];
        let written = parser.custom_memcpy(&mut dest, &frame).unwrap();
        let prefix = parser.sps_pps.clone().unwrap();
        assert_eq!(&dest[..prefix.len()], prefix.as_slice());

        let body = &dest[prefix.len()..written];
        assert_eq!(body.len(), frame.len() - 3 * 4 + 3 * 4);
        let found: Vec<&[u8]> = nal_units(body).iter().map(|&(h, e)| &body[h..e]).collect();
        assert_eq!(found, units.to_vec());
    }

    #[test]
    fn short_length_fields_change_output_size() {
        let mut config = AvcConfig::parse(&avcc()).unwrap();
        config.nal_length_size = 2;
        let mut parser = H264Parser::new(FlushFlag::new());
        parser
            .init(&StreamConfig::new("video/x-h264").with_codec_data(config.to_bytes()))
            .unwrap();

        let frame = [0, 3, 0x65, 1, 2, 0, 2, 0x41, 3];
        let mut dest = vec![0u8; 64];
        let written = parser.custom_memcpy(&mut dest, &frame).unwrap();
        let prefix_len = config.annex_b().len();
        assert_eq!(written - prefix_len, frame.len() - 2 * 2 + 2 * 4);
    }

    #[test]
    fn rewrite_reports_capacity_without_partial_output() {
        let mut parser = H264Parser::new(FlushFlag::new());
        parser
            .init(&StreamConfig::new("video/x-h264").with_codec_data(avcc()))
            .unwrap();
        let frame = [0, 0, 0, 4, 0x65, 1, 2, 3];
        let mut dest = vec![0xaau8; 20];
        assert!(matches!(
            parser.custom_memcpy(&mut dest, &frame),
            Err(Error::Capacity { .. })
        ));
        assert!(dest.iter().all(|&b| b == 0xaa));
    }

    #[test]
    fn codec_data_generated_from_encoded_frame() {
        let mut frame = nal(SPS[0], &SPS[1..]);
        frame.extend(nal(PPS[0], &PPS[1..]));
        frame.extend(nal(0x65, &[1, 2, 3]));

        let generated = AvcConfig::parse(&generate_codec_data(&frame)).unwrap();
        assert_eq!(generated.profile, 0x42);
        assert_eq!(generated.level, 0x1e);
        assert_eq!(generated.nal_length_size, 4);
        assert_eq!(generated.sps, vec![SPS.to_vec()]);
        assert_eq!(generated.pps, vec![PPS.to_vec()]);
    }

    #[test]
    #[traced_test]
    fn codec_data_without_sps_falls_back_to_baseline() {
        let fallback = AvcConfig::parse(&generate_codec_data(&nal(0x65, &[1, 2]))).unwrap();
        assert_eq!((fallback.profile, fallback.compatibility, fallback.level), (66, 0, 30));
        assert!(fallback.sps.is_empty());
        assert!(logs_contain("No SPS found"));
    }

    #[test]
    fn packetized_output_drops_parameter_sets() {
        let mut frame = vec![0xff];
        frame.extend(nal(SPS[0], &SPS[1..]));
        frame.extend(nal(PPS[0], &PPS[1..]));
        frame.extend(nal(0x65, &[1, 2, 3]));
        frame.extend(nal(0x41, &[4]));

        let out = bytestream_to_packetized(&frame);
        assert_eq!(out, vec![0, 0, 0, 4, 0x65, 1, 2, 3, 0, 0, 0, 2, 0x41, 4]);
    }
}
