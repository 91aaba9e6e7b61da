// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! # DMAI - buffer lifecycle and codec engines for DSP codecs
//!
//! Zero-copy plumbing between a streaming media pipeline and a fixed-function
//! hardware decoder/encoder reached through a vendor codec engine.
//!
//! ## Overview
//!
//! The hardware codec reads and writes buffers in place, keeps some of them
//! as references after a call and returns them later. This crate tracks who
//! holds each buffer, frames compressed streams into the access units the
//! codec expects, and runs decode on a dedicated worker thread.
//!
//! ### Key Concepts
//!
//! - **Pool**: a fixed set of identically sized buffers ([`BufferPool`]), each
//!   with a use-mask of its current [`Owners`]
//! - **Transport**: the pipeline-side handle on a buffer ([`Transport`]); dropping
//!   it returns the buffer to its pool or frees it
//! - **Parser**: splits a byte stream into access units ([`parser::StreamParser`])
//! - **Decoder engine**: parser, input pool, work queue and worker thread
//!   ([`decoder::DecoderEngine`])
//! - **Encoder engine**: inline encode into a circular output region
//!   ([`encoder::EncoderEngine`])
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌────────┐   ┌────────────┐   ┌────────┐   ┌───────┐
//! │  chain   │──►│ parser │──►│ input pool │──►│  FIFO  │──►│worker │
//! └──────────┘   └────────┘   └────────────┘   └────────┘   └───┬───┘
//!                                                               │ codec
//!                      ┌────────────┐   ┌─────────────┐         │
//!   downstream ◄───────│ Transport  │◄──│ output pool │◄────────┘
//!                      └────────────┘   └─────────────┘
//! ```
//!
//! ## Examples
//!
//! ### Framing an H.264 byte stream
//!
//! ```
//! use dmai::parser::{Accumulator, StreamConfig, StreamParser, h264::H264Parser};
//! use dmai::sync::FlushFlag;
//!
//! # fn main() -> Result<(), dmai::Error> {
//! let mut parser = H264Parser::new(FlushFlag::new());
//! parser.init(&StreamConfig::new("video/x-h264"))?;
//!
//! let mut acc = Accumulator::new();
//! acc.push(&[0, 0, 0, 1, 0x65, 0xaa, 0, 0, 0, 1, 0x41, 0xbb]);
//! let first = parser.parse(&mut acc).map(|len| acc.take(len));
//! assert_eq!(first, Some(vec![0, 0, 0, 1, 0x65, 0xaa]));
//! # Ok(())
//! # }
//! ```
//!
//! ### Loading the vendor engine
//!
//! ```no_run
//! use dmai::codec::{CodecKind, DecoderParams, OpenCodec};
//! use dmai::config::DecoderConfig;
//! use dmai::engine::EngineLibrary;
//!
//! # fn main() -> Result<(), dmai::Error> {
//! let library = EngineLibrary::load("libdmai-engine.so")?;
//! let config = DecoderConfig::default();
//! let params = DecoderParams::from_config(&config, CodecKind::Video);
//! let codec = library.open_decoder("decode", "h264dec", &params)?;
//! println!("output buffers of {} bytes", codec.output_buffer_size());
//! # Ok(())
//! # }
//! ```
//!
//! ## Thread Safety
//!
//! - Pools, transports and the work queue are `Send + Sync`
//! - A codec instance is only `Send`; the decoder confines it to its worker
//! - Engine methods take `&self` so flushes can be delivered from another
//!   thread while the streaming thread is blocked

mod error;
mod memory;

pub mod codec;
pub mod config;
pub mod decoder;
pub mod encoder;
pub mod engine;
pub mod fifo;
pub mod parser;
pub mod pool;
pub mod registry;
pub mod sync;
pub mod transport;

pub use error::{Error, Result};
pub use memory::Region;
pub use pool::{BufferAttrs, BufferPool, GraphicsAttrs, Owners, PoolBuffer, WaitHandle};
pub use transport::{BufferKind, FrameMeta, Transport};
