// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Splits an H.264 Annex-B elementary stream into access units the way the
//! decoder feeds them to the DSP, reading the file in fixed-size chunks.
//!
//! ```text
//! cargo run --example h264_frames -- --input clip.264 --chunk-size 4096
//! ```

mod common;

use std::fs;
use std::path::PathBuf;

use clap::Parser;
use dmai::parser::h264::{H264Parser, bytestream_to_packetized, generate_codec_data};
use dmai::parser::{Accumulator, StreamConfig, StreamParser};
use dmai::sync::FlushFlag;
use tracing::info;

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// Annex-B H.264 file.
    #[arg(long)]
    input: PathBuf,

    /// Bytes handed to the parser per push, like an upstream element would.
    #[arg(long, default_value_t = 4096)]
    chunk_size: usize,

    /// Print the avcC header generated from the first access unit.
    #[arg(long, default_value_t = false)]
    codec_data: bool,

    /// Report the size of each access unit once length-prefixed.
    #[arg(long, default_value_t = false)]
    packetized: bool,
}

fn report(index: usize, unit: &[u8], args: &Args) {
    if args.packetized {
        let packetized = bytestream_to_packetized(unit);
        info!(index, len = unit.len(), packetized = packetized.len(), "access unit");
    } else {
        info!(index, len = unit.len(), "access unit");
    }
}

fn main() -> Result<(), dmai::Error> {
    common::setup_logging();
    let args = Args::parse();

    let data = fs::read(&args.input)
        .map_err(|err| dmai::Error::Other(format!("{}: {err}", args.input.display())))?;
    let mut parser = H264Parser::new(FlushFlag::new());
    parser.init(&StreamConfig::new("video/x-h264"))?;

    let mut acc = Accumulator::new();
    let mut units = 0;
    for chunk in data.chunks(args.chunk_size.max(1)) {
        acc.push(chunk);
        while let Some(len) = parser.parse(&mut acc) {
            let unit = acc.take(len);
            if units == 0 && args.codec_data {
                info!(avcc = ?generate_codec_data(&unit), "codec data");
            }
            report(units, &unit, &args);
            units += 1;
        }
    }
    let rest = parser.drain(&mut acc);
    if rest > 0 {
        report(units, &acc.take(rest), &args);
        units += 1;
    }

    info!(units, bytes = data.len(), "done");
    Ok(())
}
