// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Shared fixtures for the engine integration tests: a scriptable codec, an
//! opener handing it out, and a downstream that records what it receives.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dmai::codec::{
    Codec, CodecStatus, DecoderParams, EncoderCodec, FrameType, OpenCodec, ProcessOutcome,
};
use dmai::config::EncoderConfig;
use dmai::decoder::Downstream;
use dmai::sync::Monitor;
use dmai::{BufferPool, Error, FrameMeta, GraphicsAttrs, PoolBuffer, Result, Transport};

/// Ensures logging is initialized only once across all tests.
static LOG_ONCE: std::sync::Once = std::sync::Once::new();

pub fn init_logging() {
    LOG_ONCE.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::builder()
                    .with_default_directive(tracing::level_filters::LevelFilter::INFO.into())
                    .from_env_lossy(),
            )
            .with_test_writer()
            .init();
    });
}

pub const TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Default)]
struct GateState {
    closed: bool,
    waiting: usize,
}

/// Blocks `process` calls until opened.
#[derive(Default)]
pub struct Gate {
    state: Monitor<GateState>,
}

impl Gate {
    pub fn close(&self) {
        self.state.update(|state| state.closed = true).unwrap();
    }

    pub fn open(&self) {
        self.state.update(|state| state.closed = false).unwrap();
    }

    /// Waits until a `process` call is blocked on the closed gate.
    pub fn wait_blocked(&self) -> bool {
        self.state
            .wait_for_timeout(TIMEOUT, |state| (state.waiting > 0).then_some(()))
            .unwrap()
            .is_some()
    }

    fn pass(&self) {
        self.state.update(|state| state.waiting += 1).unwrap();
        self.state
            .wait_for(|state| (!state.closed).then(|| state.waiting -= 1))
            .unwrap();
    }
}

/// One scripted result of a decode call.
#[derive(Debug, Clone, Copy)]
pub struct Step {
    pub status: i32,
    /// Bytes reported as consumed; `None` for the whole input.
    pub consumed: Option<usize>,
}

/// Behaviour of the mock decoder, shared with the test body.
#[derive(Default)]
pub struct Script {
    pub steps: Mutex<VecDeque<Step>>,
    /// Frames the codec still holds when it is drained.
    pub drain_frames: usize,
    /// Frames displayed per call on top of the decoded one.
    pub extra_per_call: usize,
    pub output_size: usize,
    pub channels: Option<u32>,
    pub fail_open: bool,
    pub gate: Gate,
    pub calls: AtomicUsize,
    pub flushes: AtomicUsize,
}

impl Script {
    pub fn new() -> Self {
        Self {
            output_size: 256,
            ..Default::default()
        }
    }

    pub fn with_steps(self, steps: impl IntoIterator<Item = Step>) -> Self {
        *self.steps.lock().unwrap() = steps.into_iter().collect();
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

/// Decoder that copies its input to the output buffer and displays it.
pub struct MockCodec {
    script: Arc<Script>,
    pool: Option<BufferPool>,
    display: VecDeque<PoolBuffer>,
    free: VecDeque<PoolBuffer>,
}

impl MockCodec {
    fn frame_into(&mut self, buffer: PoolBuffer, data: &[u8]) -> Result<()> {
        let len = data.len().min(buffer.size());
        buffer.fill(&data[..len])?;
        self.display.push_back(buffer);
        Ok(())
    }
}

impl Codec for MockCodec {
    fn output_buffer_size(&self) -> usize {
        self.script.output_size
    }

    fn set_output_pool(&mut self, pool: &BufferPool) -> Result<()> {
        self.pool = Some(pool.clone());
        Ok(())
    }

    fn process(&mut self, input: &[u8], output: &PoolBuffer) -> Result<ProcessOutcome> {
        self.script.gate.pass();
        self.script.calls.fetch_add(1, Ordering::SeqCst);
        let step = self.script.steps.lock().unwrap().pop_front();
        let consumed = step.and_then(|s| s.consumed).unwrap_or(input.len());
        if let Some(step) = step.filter(|s| s.status != 0) {
            return Ok(ProcessOutcome {
                status: CodecStatus::from_raw(step.status),
                consumed,
            });
        }

        if input.is_empty() {
            for n in 0..self.script.drain_frames {
                let buffer = if n == 0 {
                    Some(output.clone())
                } else {
                    self.pool.as_ref().and_then(|p| p.acquire_free().ok().flatten())
                };
                if let Some(buffer) = buffer {
                    self.frame_into(buffer, b"drained")?;
                }
            }
        } else {
            self.frame_into(output.clone(), input)?;
            for _ in 0..self.script.extra_per_call {
                if let Some(buffer) = self.pool.as_ref().and_then(|p| p.acquire_free().ok().flatten()) {
                    self.frame_into(buffer, input)?;
                }
            }
        }
        Ok(ProcessOutcome {
            status: CodecStatus::Ok,
            consumed,
        })
    }

    fn display_buffer(&mut self) -> Option<PoolBuffer> {
        let buffer = self.display.pop_front()?;
        self.free.push_back(buffer.clone());
        Some(buffer)
    }

    fn free_buffer(&mut self) -> Option<PoolBuffer> {
        self.free.pop_front()
    }

    fn flush(&mut self) -> Result<()> {
        self.script.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn channels(&self) -> Option<u32> {
        self.script.channels
    }
}

/// Behaviour of the mock encoder.
#[derive(Default)]
pub struct EncoderScript {
    /// Encoded frames returned in turn; empty to emit half of each input.
    pub frames: Vec<Vec<u8>>,
    /// Every `gop`-th frame is an I-frame.
    pub gop: usize,
    pub calls: AtomicUsize,
    /// Address of every input the encoder was handed.
    pub inputs: Mutex<Vec<usize>>,
}

pub struct MockEncoder {
    script: Arc<EncoderScript>,
    last: FrameType,
}

impl EncoderCodec for MockEncoder {
    fn process(&mut self, input: &[u8], output: &mut [u8]) -> Result<usize> {
        let n = self.script.calls.fetch_add(1, Ordering::SeqCst);
        self.script.inputs.lock().unwrap().push(input.as_ptr() as usize);
        let encoded: Vec<u8> = if self.script.frames.is_empty() {
            input[..input.len() / 2].to_vec()
        } else {
            self.script.frames[n % self.script.frames.len()].clone()
        };
        if encoded.len() > output.len() {
            return Err(Error::Capacity {
                needed: encoded.len(),
                available: output.len(),
            });
        }
        output[..encoded.len()].copy_from_slice(&encoded);
        self.last = if n % self.script.gop.max(1) == 0 {
            FrameType::I
        } else {
            FrameType::P
        };
        Ok(encoded.len())
    }

    fn frame_type(&self) -> FrameType {
        self.last
    }
}

/// Hands out mock codecs and records how it was asked.
#[derive(Default)]
pub struct MockOpener {
    pub script: Arc<Script>,
    pub encoder: Arc<EncoderScript>,
    pub opened: Mutex<Vec<(String, String)>>,
    pub params: Mutex<Option<DecoderParams>>,
}

impl MockOpener {
    pub fn new(script: Script) -> Self {
        Self {
            script: Arc::new(script),
            ..Default::default()
        }
    }

    pub fn encoding(encoder: EncoderScript) -> Self {
        Self {
            encoder: Arc::new(encoder),
            ..Default::default()
        }
    }
}

impl OpenCodec for MockOpener {
    fn open_decoder(
        &self,
        engine: &str,
        codec: &str,
        params: &DecoderParams,
    ) -> Result<Box<dyn Codec>> {
        if self.script.fail_open {
            return Err(Error::Allocation(format!("no codec {codec} in engine {engine}")));
        }
        self.opened
            .lock()
            .unwrap()
            .push((engine.to_string(), codec.to_string()));
        *self.params.lock().unwrap() = Some(*params);
        Ok(Box::new(MockCodec {
            script: self.script.clone(),
            pool: None,
            display: VecDeque::new(),
            free: VecDeque::new(),
        }))
    }

    fn open_encoder(
        &self,
        engine: &str,
        codec: &str,
        _config: &EncoderConfig,
    ) -> Result<Box<dyn EncoderCodec>> {
        self.opened
            .lock()
            .unwrap()
            .push((engine.to_string(), codec.to_string()));
        Ok(Box::new(MockEncoder {
            script: self.encoder.clone(),
            last: FrameType::Unknown,
        }))
    }
}

/// A frame as seen downstream.
#[derive(Debug, Clone)]
pub struct Received {
    pub data: Vec<u8>,
    pub meta: FrameMeta,
    pub graphics: Option<GraphicsAttrs>,
}

#[derive(Default)]
struct Record {
    frames: Vec<Received>,
    eos: usize,
    errors: Vec<String>,
    channels: Option<u32>,
}

/// Downstream that copies every frame and drops the transport right away.
#[derive(Default)]
pub struct Collector {
    record: Monitor<Record>,
}

impl Collector {
    pub fn frames(&self) -> Vec<Received> {
        self.record.lock().unwrap().frames.clone()
    }

    pub fn eos_count(&self) -> usize {
        self.record.lock().unwrap().eos
    }

    pub fn errors(&self) -> Vec<String> {
        self.record.lock().unwrap().errors.clone()
    }

    pub fn channels(&self) -> Option<u32> {
        self.record.lock().unwrap().channels
    }

    pub fn wait_eos(&self) -> bool {
        self.record
            .wait_for_timeout(TIMEOUT, |record| (record.eos > 0).then_some(()))
            .unwrap()
            .is_some()
    }

    pub fn wait_error(&self) -> bool {
        self.record
            .wait_for_timeout(TIMEOUT, |record| (!record.errors.is_empty()).then_some(()))
            .unwrap()
            .is_some()
    }

    pub fn wait_frames(&self, count: usize) -> bool {
        self.record
            .wait_for_timeout(TIMEOUT, |record| (record.frames.len() >= count).then_some(()))
            .unwrap()
            .is_some()
    }
}

impl Downstream for Collector {
    fn push(&self, frame: Transport) -> Result<()> {
        let received = Received {
            data: frame.as_ref().to_vec(),
            meta: *frame.meta(),
            graphics: frame.pool_buffer().and_then(PoolBuffer::graphics),
        };
        self.record.update(|record| record.frames.push(received))?;
        Ok(())
    }

    fn eos(&self) {
        self.record.update(|record| record.eos += 1).unwrap();
    }

    fn error(&self, err: &Error) {
        let message = err.to_string();
        self.record.update(|record| record.errors.push(message)).unwrap();
    }

    fn audio_channels(&self, channels: u32) {
        self.record
            .update(|record| record.channels = Some(channels))
            .unwrap();
    }
}
