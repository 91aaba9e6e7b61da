// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Static tables of the supported decoders and encoders.
//!
//! Each entry ties a stream type to the engine and codec names that handle
//! it, plus the parser (decode) or output media type (encode). Lookups are
//! plain table scans; nothing is registered at runtime.

use crate::codec::CodecKind;
use crate::config::{DEFAULT_ENCODE_ENGINE_NAME, DEFAULT_ENGINE_NAME};
use crate::parser::ParserKind;

/// A decoder known to the plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecoderEntry {
    /// Short name, used as element property value.
    pub name: &'static str,
    /// Input media type.
    pub media_type: &'static str,
    /// `mpegversion` caps field, for the `*/mpeg` media types.
    pub mpeg_version: Option<i32>,
    pub engine_name: &'static str,
    pub codec_name: &'static str,
    pub parser: ParserKind,
    pub kind: CodecKind,
}

/// An encoder known to the plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncoderEntry {
    pub name: &'static str,
    pub engine_name: &'static str,
    pub codec_name: &'static str,
    /// Media type of the encoded output.
    pub output_media_type: &'static str,
    pub mpeg_version: Option<i32>,
    pub kind: CodecKind,
    /// Output may need avcC codec_data and packetized conversion.
    pub h264: bool,
}

pub static DECODERS: &[DecoderEntry] = &[
    DecoderEntry {
        name: "h264",
        media_type: "video/x-h264",
        mpeg_version: None,
        engine_name: DEFAULT_ENGINE_NAME,
        codec_name: "h264dec",
        parser: ParserKind::H264,
        kind: CodecKind::Video,
    },
    DecoderEntry {
        name: "mpeg4",
        media_type: "video/mpeg",
        mpeg_version: Some(4),
        engine_name: DEFAULT_ENGINE_NAME,
        codec_name: "mpeg4dec",
        parser: ParserKind::Passthrough,
        kind: CodecKind::Video,
    },
    DecoderEntry {
        name: "mpeg2",
        media_type: "video/mpeg",
        mpeg_version: Some(2),
        engine_name: DEFAULT_ENGINE_NAME,
        codec_name: "mpeg2dec",
        parser: ParserKind::Passthrough,
        kind: CodecKind::Video,
    },
    DecoderEntry {
        name: "aac",
        media_type: "audio/mpeg",
        mpeg_version: Some(4),
        engine_name: DEFAULT_ENGINE_NAME,
        codec_name: "aachedec",
        parser: ParserKind::Aac,
        kind: CodecKind::Audio,
    },
];

pub static ENCODERS: &[EncoderEntry] = &[
    EncoderEntry {
        name: "h264",
        engine_name: DEFAULT_ENCODE_ENGINE_NAME,
        codec_name: "h264enc",
        output_media_type: "video/x-h264",
        mpeg_version: None,
        kind: CodecKind::Video,
        h264: true,
    },
    EncoderEntry {
        name: "mpeg4",
        engine_name: DEFAULT_ENCODE_ENGINE_NAME,
        codec_name: "mpeg4enc",
        output_media_type: "video/mpeg",
        mpeg_version: Some(4),
        kind: CodecKind::Video,
        h264: false,
    },
    EncoderEntry {
        name: "aac",
        engine_name: DEFAULT_ENCODE_ENGINE_NAME,
        codec_name: "aacenc",
        output_media_type: "audio/mpeg",
        mpeg_version: Some(4),
        kind: CodecKind::Audio,
        h264: false,
    },
    EncoderEntry {
        name: "wma",
        engine_name: DEFAULT_ENCODE_ENGINE_NAME,
        codec_name: "wmaenc",
        output_media_type: "audio/x-wma",
        mpeg_version: None,
        kind: CodecKind::Audio,
        h264: false,
    },
    EncoderEntry {
        name: "mp3",
        engine_name: DEFAULT_ENCODE_ENGINE_NAME,
        codec_name: "mp3enc",
        output_media_type: "audio/mpeg",
        mpeg_version: Some(1),
        kind: CodecKind::Audio,
        h264: false,
    },
];

/// Decoder for `media_type`. For the `*/mpeg` types `mpeg_version` picks
/// the entry; it is ignored otherwise.
pub fn find_decoder(media_type: &str, mpeg_version: Option<i32>) -> Option<&'static DecoderEntry> {
    DECODERS.iter().find(|entry| {
        entry.media_type == media_type
            && (entry.mpeg_version.is_none() || entry.mpeg_version == mpeg_version)
    })
}

/// Decoder by short name or codec name.
pub fn find_decoder_by_name(name: &str) -> Option<&'static DecoderEntry> {
    DECODERS
        .iter()
        .find(|entry| entry.name == name || entry.codec_name == name)
}

/// Encoder by short name or codec name.
pub fn find_encoder(name: &str) -> Option<&'static EncoderEntry> {
    ENCODERS
        .iter()
        .find(|entry| entry.name == name || entry.codec_name == name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decoder_lookup_by_media_type() {
        let h264 = find_decoder("video/x-h264", None).unwrap();
        assert_eq!(h264.codec_name, "h264dec");
        assert_eq!(h264.parser, ParserKind::H264);

        assert_eq!(find_decoder("video/mpeg", Some(2)).unwrap().codec_name, "mpeg2dec");
        assert_eq!(find_decoder("video/mpeg", Some(4)).unwrap().codec_name, "mpeg4dec");
        assert!(find_decoder("video/mpeg", Some(1)).is_none());

        let aac = find_decoder("audio/mpeg", Some(4)).unwrap();
        assert_eq!(aac.kind, CodecKind::Audio);
        assert!(find_decoder("video/x-vp8", None).is_none());
    }

    #[test]
    fn encoder_lookup_by_either_name() {
        assert_eq!(find_encoder("h264").unwrap().codec_name, "h264enc");
        assert!(find_encoder("h264enc").unwrap().h264);
        assert_eq!(find_encoder("mp3").unwrap().engine_name, "encode");
        assert!(find_encoder("vp8").is_none());
        assert_eq!(find_decoder_by_name("aachedec").unwrap().name, "aac");
    }
}
