// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Runtime access to the vendor codec engine.
//!
//! The DSP codec server is reached through a shared library exposing a small
//! C ABI. The library is loaded with `libloading` and its entry points are
//! resolved once into an [`EngineApi`] table shared by every instance.
//!
//! ```text
//! dmai_engine_open(name)                  -> engine*
//! dmai_engine_close(engine)
//! dmai_codec_create(engine, name, params) -> codec*
//! dmai_codec_delete(codec)
//! dmai_codec_set_output_buffers(codec, descs, count) -> status
//! dmai_codec_process(codec, in, out)      -> status
//! dmai_codec_get_display(codec, out)      -> 1 buffer, 0 none, <0 error
//! dmai_codec_get_free(codec, out)         -> 1 buffer, 0 none, <0 error
//! dmai_codec_flush(codec)                 -> status
//! dmai_codec_output_size(codec)           -> bytes
//! dmai_codec_frame_type(codec)            -> 0 I, 1 P, 2 B
//! dmai_codec_channel_mode(codec)          -> mode, <0 unknown
//! ```

use std::ffi::{CString, c_char};
use std::path::Path;
use std::ptr::{NonNull, null_mut};
use std::sync::Arc;

use tracing::{debug, error, trace};

use crate::codec::{
    Codec, CodecKind, CodecStatus, DecoderParams, EncoderCodec, FrameType, OpenCodec,
    ProcessOutcome,
};
use crate::config::{ColorSpace, EncoderConfig};
use crate::parser::aac::channels_for_mode;
use crate::pool::{BufferPool, GraphicsAttrs, PoolBuffer};
use crate::{Error, Result};

#[repr(C)]
pub struct RawEngine {
    _private: [u8; 0],
}

#[repr(C)]
pub struct RawCodec {
    _private: [u8; 0],
}

/// Buffer descriptor exchanged with the engine.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct BufferDesc {
    /// Position in the output table, -1 for buffers outside it.
    pub index: i32,
    pub ptr: *mut u8,
    pub size: u32,
    pub bytes_used: u32,
    pub width: u32,
    pub height: u32,
    pub line_length: u32,
}

impl Default for BufferDesc {
    fn default() -> Self {
        Self {
            index: -1,
            ptr: null_mut(),
            size: 0,
            bytes_used: 0,
            width: 0,
            height: 0,
            line_length: 0,
        }
    }
}

pub const KIND_AUDIO: u32 = 0;
pub const KIND_VIDEO: u32 = 1;
pub const KIND_ENCODER: u32 = 2;

/// Codec creation parameters.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct CodecParams {
    pub kind: u32,
    pub max_width: u32,
    pub max_height: u32,
    /// 0 UYVY, 1 NV12, 2 NV16.
    pub color_space: u32,
    pub input_size: u32,
    pub channels: u32,
    pub rate: u32,
    pub sample_width: u32,
}

fn color_space_code(color_space: ColorSpace) -> u32 {
    match color_space {
        ColorSpace::Uyvy => 0,
        ColorSpace::Yuv420PSemi => 1,
        ColorSpace::Yuv422PSemi => 2,
    }
}

type EngineOpenFn = unsafe extern "C" fn(*const c_char) -> *mut RawEngine;
type EngineCloseFn = unsafe extern "C" fn(*mut RawEngine);
type CodecCreateFn =
    unsafe extern "C" fn(*mut RawEngine, *const c_char, *const CodecParams) -> *mut RawCodec;
type CodecDeleteFn = unsafe extern "C" fn(*mut RawCodec);
type SetOutputBuffersFn = unsafe extern "C" fn(*mut RawCodec, *const BufferDesc, u32) -> i32;
type ProcessFn = unsafe extern "C" fn(*mut RawCodec, *mut BufferDesc, *mut BufferDesc) -> i32;
type GetBufferFn = unsafe extern "C" fn(*mut RawCodec, *mut BufferDesc) -> i32;
type CodecStatusFn = unsafe extern "C" fn(*mut RawCodec) -> i32;
type OutputSizeFn = unsafe extern "C" fn(*mut RawCodec) -> u32;

/// Entry points resolved from the engine library.
pub struct EngineApi {
    _library: libloading::Library,
    engine_open: EngineOpenFn,
    engine_close: EngineCloseFn,
    codec_create: CodecCreateFn,
    codec_delete: CodecDeleteFn,
    set_output_buffers: SetOutputBuffersFn,
    process: ProcessFn,
    get_display: GetBufferFn,
    get_free: GetBufferFn,
    flush: CodecStatusFn,
    output_size: OutputSizeFn,
    frame_type: CodecStatusFn,
    channel_mode: CodecStatusFn,
}

/// Shared handle to the loaded engine library.
pub type EngineApiHandle = Arc<EngineApi>;

/// Loads the engine library at `path` and resolves its entry points.
///
/// # Errors
///
/// Returns [`Error::LibLoading`] if the library cannot be opened or a symbol
/// is missing.
pub fn load_engine(path: impl AsRef<Path>) -> Result<EngineApiHandle> {
    let path = path.as_ref();
    debug!(path = %path.display(), "loading codec engine library");
    // Safety: loading runs the library's initializers; the engine library is
    // a plain C library without load-time side effects on our state.
    let library = unsafe { libloading::Library::new(path)? };
    let api = unsafe {
        EngineApi {
            engine_open: *library.get::<EngineOpenFn>(b"dmai_engine_open\0")?,
            engine_close: *library.get::<EngineCloseFn>(b"dmai_engine_close\0")?,
            codec_create: *library.get::<CodecCreateFn>(b"dmai_codec_create\0")?,
            codec_delete: *library.get::<CodecDeleteFn>(b"dmai_codec_delete\0")?,
            set_output_buffers: *library
                .get::<SetOutputBuffersFn>(b"dmai_codec_set_output_buffers\0")?,
            process: *library.get::<ProcessFn>(b"dmai_codec_process\0")?,
            get_display: *library.get::<GetBufferFn>(b"dmai_codec_get_display\0")?,
            get_free: *library.get::<GetBufferFn>(b"dmai_codec_get_free\0")?,
            flush: *library.get::<CodecStatusFn>(b"dmai_codec_flush\0")?,
            output_size: *library.get::<OutputSizeFn>(b"dmai_codec_output_size\0")?,
            frame_type: *library.get::<CodecStatusFn>(b"dmai_codec_frame_type\0")?,
            channel_mode: *library.get::<CodecStatusFn>(b"dmai_codec_channel_mode\0")?,
            _library: library,
        }
    };
    Ok(Arc::new(api))
}

/// An open engine; closed when the last codec created from it is gone.
struct EngineHandle {
    api: EngineApiHandle,
    raw: NonNull<RawEngine>,
    name: String,
}

// Safety: the engine handle itself may be used from any thread; only codec
// instances are bound to a single caller.
unsafe impl Send for EngineHandle {}
unsafe impl Sync for EngineHandle {}

impl EngineHandle {
    fn open(api: &EngineApiHandle, name: &str) -> Result<Arc<Self>> {
        let c_name = CString::new(name)?;
        let raw = unsafe { (api.engine_open)(c_name.as_ptr()) };
        let raw = NonNull::new(raw)
            .ok_or_else(|| Error::Allocation(format!("failed to open codec engine \"{name}\"")))?;
        debug!(engine = name, "opened codec engine");
        Ok(Arc::new(Self {
            api: api.clone(),
            raw,
            name: name.to_string(),
        }))
    }

    fn create_codec(&self, codec: &str, params: &CodecParams) -> Result<NonNull<RawCodec>> {
        let c_name = CString::new(codec)?;
        let raw = unsafe { (self.api.codec_create)(self.raw.as_ptr(), c_name.as_ptr(), params) };
        NonNull::new(raw).ok_or_else(|| {
            Error::Allocation(format!(
                "failed to create codec \"{codec}\" in engine \"{}\"",
                self.name
            ))
        })
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        debug!(engine = %self.name, "closing codec engine");
        unsafe { (self.api.engine_close)(self.raw.as_ptr()) };
    }
}

/// A codec instance plus the engine keeping it alive.
struct CodecHandle {
    engine: Arc<EngineHandle>,
    raw: NonNull<RawCodec>,
}

impl CodecHandle {
    fn api(&self) -> &EngineApi {
        &self.engine.api
    }

    fn ptr(&self) -> *mut RawCodec {
        self.raw.as_ptr()
    }
}

impl Drop for CodecHandle {
    fn drop(&mut self) {
        unsafe { (self.engine.api.codec_delete)(self.raw.as_ptr()) };
    }
}

/// [`OpenCodec`] backed by the loaded engine library.
#[derive(Clone)]
pub struct EngineLibrary {
    api: EngineApiHandle,
}

impl EngineLibrary {
    pub fn new(api: EngineApiHandle) -> Self {
        Self { api }
    }

    /// Shorthand for [`load_engine`] followed by [`Self::new`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(load_engine(path)?))
    }
}

impl OpenCodec for EngineLibrary {
    fn open_decoder(
        &self,
        engine: &str,
        codec: &str,
        params: &DecoderParams,
    ) -> Result<Box<dyn Codec>> {
        let engine = EngineHandle::open(&self.api, engine)?;
        let raw = engine.create_codec(
            codec,
            &CodecParams {
                kind: match params.kind {
                    CodecKind::Audio => KIND_AUDIO,
                    CodecKind::Video => KIND_VIDEO,
                },
                max_width: params.max_width,
                max_height: params.max_height,
                color_space: color_space_code(params.color_space),
                ..Default::default()
            },
        )?;
        debug!(codec, "created decoder");
        Ok(Box::new(EngineDecoder {
            handle: CodecHandle { engine, raw },
            pool: None,
            color_space: params.color_space,
        }))
    }

    fn open_encoder(
        &self,
        engine: &str,
        codec: &str,
        config: &EncoderConfig,
    ) -> Result<Box<dyn EncoderCodec>> {
        let engine = EngineHandle::open(&self.api, engine)?;
        let raw = engine.create_codec(
            codec,
            &CodecParams {
                kind: KIND_ENCODER,
                max_width: config.width,
                max_height: config.height,
                color_space: config.color_space.map(color_space_code).unwrap_or_default(),
                input_size: config.in_buffer_size as u32,
                channels: config.channels,
                rate: config.rate,
                sample_width: config.sample_width,
            },
        )?;
        debug!(codec, "created encoder");
        Ok(Box::new(EngineEncoder {
            handle: CodecHandle { engine, raw },
        }))
    }
}

fn check(status: i32, what: &str) -> Result<()> {
    if status < 0 {
        Err(Error::HardwareFatal(format!("{what} failed with status {status}")))
    } else {
        Ok(())
    }
}

struct EngineDecoder {
    handle: CodecHandle,
    pool: Option<BufferPool>,
    color_space: ColorSpace,
}

// Safety: the instance is moved to, and then only used by, one worker thread.
unsafe impl Send for EngineDecoder {}

impl EngineDecoder {
    fn pool_buffer(&self, desc: &BufferDesc) -> Option<PoolBuffer> {
        let buffer = self.pool.as_ref()?.get(usize::try_from(desc.index).ok()?)?;
        buffer.set_bytes_used(desc.bytes_used as usize);
        if desc.width > 0
            && desc.height > 0
            && let Err(err) = buffer.set_graphics(GraphicsAttrs {
                width: desc.width,
                height: desc.height,
                line_length: desc.line_length,
                color_space: self.color_space,
            })
        {
            error!("Failed to record frame geometry: {}", err);
        }
        Some(buffer)
    }

    fn poll(&self, get: GetBufferFn, what: &str) -> Option<PoolBuffer> {
        let mut desc = BufferDesc::default();
        let found = unsafe { get(self.handle.ptr(), &mut desc) };
        if found < 0 {
            error!("{} failed with status {}", what, found);
            return None;
        }
        if found == 0 {
            return None;
        }
        trace!(index = desc.index, bytes = desc.bytes_used, "{}", what);
        self.pool_buffer(&desc)
    }
}

impl Codec for EngineDecoder {
    fn output_buffer_size(&self) -> usize {
        unsafe { (self.handle.api().output_size)(self.handle.ptr()) as usize }
    }

    fn set_output_pool(&mut self, pool: &BufferPool) -> Result<()> {
        let descs: Vec<BufferDesc> = (0..pool.len())
            .filter_map(|index| pool.get(index))
            .map(|buffer| BufferDesc {
                index: buffer.index() as i32,
                ptr: buffer.as_ptr().map_or(null_mut(), NonNull::as_ptr),
                size: buffer.size() as u32,
                ..Default::default()
            })
            .collect();
        let status = unsafe {
            (self.handle.api().set_output_buffers)(
                self.handle.ptr(),
                descs.as_ptr(),
                descs.len() as u32,
            )
        };
        check(status, "setting output buffers")?;
        self.pool = Some(pool.clone());
        Ok(())
    }

    fn process(&mut self, input: &[u8], output: &PoolBuffer) -> Result<ProcessOutcome> {
        let mut in_desc = BufferDesc {
            ptr: input.as_ptr() as *mut u8,
            size: input.len() as u32,
            bytes_used: input.len() as u32,
            ..Default::default()
        };
        let mut out_desc = BufferDesc {
            index: output.index() as i32,
            ptr: output.as_ptr().map_or(null_mut(), NonNull::as_ptr),
            size: output.size() as u32,
            ..Default::default()
        };
        let status =
            unsafe { (self.handle.api().process)(self.handle.ptr(), &mut in_desc, &mut out_desc) };
        output.set_bytes_used(out_desc.bytes_used as usize);
        Ok(ProcessOutcome {
            status: CodecStatus::from_raw(status),
            consumed: in_desc.bytes_used as usize,
        })
    }

    fn display_buffer(&mut self) -> Option<PoolBuffer> {
        self.poll(self.handle.api().get_display, "display buffer")
    }

    fn free_buffer(&mut self) -> Option<PoolBuffer> {
        self.poll(self.handle.api().get_free, "free buffer")
    }

    fn flush(&mut self) -> Result<()> {
        check(
            unsafe { (self.handle.api().flush)(self.handle.ptr()) },
            "codec flush",
        )
    }

    fn channels(&self) -> Option<u32> {
        let mode = unsafe { (self.handle.api().channel_mode)(self.handle.ptr()) };
        usize::try_from(mode).ok().and_then(channels_for_mode)
    }
}

struct EngineEncoder {
    handle: CodecHandle,
}

// Safety: the encoder runs on the streaming thread that owns the element.
unsafe impl Send for EngineEncoder {}

impl EncoderCodec for EngineEncoder {
    fn process(&mut self, input: &[u8], output: &mut [u8]) -> Result<usize> {
        let mut in_desc = BufferDesc {
            ptr: input.as_ptr() as *mut u8,
            size: input.len() as u32,
            bytes_used: input.len() as u32,
            ..Default::default()
        };
        let mut out_desc = BufferDesc {
            ptr: output.as_mut_ptr(),
            size: output.len() as u32,
            ..Default::default()
        };
        let status =
            unsafe { (self.handle.api().process)(self.handle.ptr(), &mut in_desc, &mut out_desc) };
        match CodecStatus::from_raw(status) {
            CodecStatus::Fatal(code) => Err(Error::HardwareFatal(format!(
                "encode failed with status {code}"
            ))),
            CodecStatus::BitError => Err(Error::Bitstream("encoder rejected input frame".into())),
            _ => Ok((out_desc.bytes_used as usize).min(output.len())),
        }
    }

    fn frame_type(&self) -> FrameType {
        FrameType::from_raw(unsafe { (self.handle.api().frame_type)(self.handle.ptr()) })
    }
}
