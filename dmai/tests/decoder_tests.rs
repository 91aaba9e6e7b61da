// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Decoder engine integration tests
//!
//! These tests drive a [`DecoderEngine`] end to end against a scripted codec
//! running on the real worker thread.
//!
//! # Test Coverage
//!
//! - Flush: queued frames are discarded and decoding resumes afterwards
//! - End of stream: frames held by the codec are drained before EOS
//! - Timestamps: only the first frame of a decode call is stamped
//! - Bit errors: video resynchronizes or aborts, audio drops the frame
//! - Oversized input: a frame larger than the input buffers is still decoded
//! - Fatal codec status: the engine aborts once and reports it upstream
//! - Start-up failure leaves the engine stopped
//! - The decode thread keeps running at normal priority when SCHED_FIFO is refused

mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use common::{Collector, MockOpener, Script, Step, init_logging};
use dmai::config::{DecoderConfig, Fraction};
use dmai::decoder::{DecoderEngine, EngineState};
use dmai::parser::StreamConfig;
use dmai::parser::h264::AvcConfig;
use dmai::registry::find_decoder_by_name;
use dmai::{Error, FrameMeta};

/// Small video geometry keeps the output pool tiny.
fn video_config() -> DecoderConfig {
    DecoderConfig {
        width: 16,
        height: 16,
        framerate: Some(Fraction::new(25, 1)),
        num_input_buffers: 8,
        fifo_capacity: 16,
        input_buffer_size: 64,
        ..Default::default()
    }
}

/// Builds an engine for the registry entry `name` fed by `script`.
fn engine(
    name: &str,
    config: DecoderConfig,
    script: Script,
) -> (Arc<DecoderEngine>, Arc<Collector>, Arc<MockOpener>) {
    init_logging();
    let entry = find_decoder_by_name(name).unwrap();
    let stream = StreamConfig::new(entry.media_type).with_framed(true);
    let opener = Arc::new(MockOpener::new(script));
    let collector = Arc::new(Collector::default());
    let engine = DecoderEngine::new(entry, config, &stream, opener.clone(), collector.clone())
        .unwrap();
    (Arc::new(engine), collector, opener)
}

fn at(millis: u64) -> FrameMeta {
    FrameMeta {
        pts: Some(Duration::from_millis(millis)),
        ..Default::default()
    }
}

#[test]
fn flush_discards_queued_frames_and_resumes() {
    let script = Script::new();
    script.gate.close();
    let (engine, collector, opener) = engine("mpeg2", video_config(), script);

    for n in 0..5u8 {
        engine.chain(&[n; 10], at(u64::from(n) * 40)).unwrap();
    }

    // Let the codec finish its frame only once the flush is under way.
    let opener_thread = {
        let engine = engine.clone();
        let opener = opener.clone();
        thread::spawn(move || {
            while !engine.is_flushing() {
                thread::sleep(Duration::from_millis(1));
            }
            thread::sleep(Duration::from_millis(10));
            opener.script.gate.open();
        })
    };
    engine.flush_start().unwrap();
    opener_thread.join().unwrap();
    engine.flush_stop().unwrap();
    assert!(collector.frames().is_empty());
    assert_eq!(engine.state(), EngineState::Running);

    engine.chain(&[6; 10], at(1000)).unwrap();
    engine.eos().unwrap();
    assert!(collector.wait_eos());

    let frames = collector.frames();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].data, vec![6; 10]);
    assert_eq!(frames[0].meta.pts, Some(Duration::from_millis(1000)));
    assert_eq!(collector.eos_count(), 1);
    assert!(collector.errors().is_empty());

    engine.exit().unwrap();
    assert_eq!(engine.state(), EngineState::Stopped);
}

#[test]
fn eos_drains_frames_held_by_the_codec() {
    let script = Script {
        drain_frames: 1,
        ..Script::new()
    };
    let (engine, collector, opener) = engine("mpeg4", video_config(), script);

    for n in 0..3u8 {
        engine.chain(&[n + 1; 8], at(u64::from(n) * 40)).unwrap();
    }
    engine.eos().unwrap();
    assert!(collector.wait_eos());

    let frames = collector.frames();
    assert_eq!(frames.len(), 4);
    assert_eq!(frames[3].data, b"drained".to_vec());
    assert_eq!(frames[3].meta.pts, None);
    for (n, frame) in frames[..3].iter().enumerate() {
        assert_eq!(frame.meta.pts, Some(Duration::from_millis(n as u64 * 40)));
        assert_eq!(frame.meta.duration, Some(Duration::from_millis(40)));
        let graphics = frame.graphics.unwrap();
        assert_eq!((graphics.width, graphics.height), (16, 16));
    }
    assert_eq!(collector.eos_count(), 1);
    assert_eq!(opener.script.flushes.load(Ordering::SeqCst), 1);

    // Nothing trails the end of stream.
    thread::sleep(Duration::from_millis(20));
    assert_eq!(collector.frames().len(), 4);
    engine.exit().unwrap();
}

#[test]
fn eos_without_input_reaches_downstream() {
    let (engine, collector, opener) = engine("mpeg2", video_config(), Script::new());
    engine.eos().unwrap();
    assert_eq!(collector.eos_count(), 1);
    assert!(opener.opened.lock().unwrap().is_empty());
    assert_eq!(engine.state(), EngineState::Idle);
}

#[test]
fn only_first_frame_of_a_call_is_stamped() {
    let script = Script {
        extra_per_call: 1,
        ..Script::new()
    };
    let (engine, collector, _opener) = engine("mpeg2", video_config(), script);

    engine.chain(&[9; 12], at(80)).unwrap();
    assert!(collector.wait_frames(2));

    let frames = collector.frames();
    assert_eq!(frames[0].meta.pts, Some(Duration::from_millis(80)));
    assert_eq!(frames[1].meta.pts, None);
    assert_eq!(frames[1].meta.duration, None);
    engine.exit().unwrap();
}

#[test]
fn timestamps_are_left_alone_when_disabled() {
    let config = DecoderConfig {
        gen_timestamps: false,
        ..video_config()
    };
    let (engine, collector, _opener) = engine("mpeg2", config, Script::new());

    engine.chain(&[1; 4], at(40)).unwrap();
    assert!(collector.wait_frames(1));
    assert_eq!(collector.frames()[0].meta.pts, None);
    engine.exit().unwrap();
}

#[test]
fn decode_thread_runs_when_realtime_scheduling_is_refused() {
    let config = DecoderConfig {
        realtime_priority: true,
        ..video_config()
    };
    let (engine, collector, _opener) = engine("mpeg2", config, Script::new());

    engine.chain(&[5; 10], at(0)).unwrap();
    assert!(collector.wait_frames(1));
    assert_eq!(collector.frames()[0].data, vec![5; 10]);
    assert_eq!(engine.state(), EngineState::Running);
    engine.exit().unwrap();
}

#[test]
fn video_bit_error_with_progress_resynchronizes() {
    let script = Script::new().with_steps([Step {
        status: 1,
        consumed: Some(3),
    }]);
    let (engine, collector, opener) = engine("mpeg2", video_config(), script);

    engine.chain(&[1; 10], at(0)).unwrap();
    engine.chain(&[2; 10], at(40)).unwrap();
    assert!(collector.wait_frames(1));

    // The 7 bytes left after the error are discarded, not fed again.
    thread::sleep(Duration::from_millis(20));
    let frames = collector.frames();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].data, vec![2; 10]);
    assert_eq!(opener.script.calls(), 2);
    assert!(collector.errors().is_empty());
    assert_eq!(engine.state(), EngineState::Running);
    engine.exit().unwrap();
}

#[test]
fn video_bit_error_without_progress_aborts() {
    let script = Script::new().with_steps([Step {
        status: 1,
        consumed: None,
    }]);
    let (engine, collector, _opener) = engine("mpeg2", video_config(), script);

    engine.chain(&[1; 10], at(0)).unwrap();
    assert!(collector.wait_error());
    assert!(collector.errors()[0].contains("bit error"));
    assert_eq!(engine.state(), EngineState::Aborted);
    engine.exit().unwrap();
}

#[test]
fn audio_bit_error_drops_only_that_frame() {
    let script = Script {
        channels: Some(2),
        ..Script::new().with_steps([Step {
            status: 1,
            consumed: None,
        }])
    };
    let config = DecoderConfig {
        input_buffer_size: 64,
        ..Default::default()
    };
    let (engine, collector, opener) = engine("aac", config, script);

    engine.chain(&[1; 16], at(0)).unwrap();
    engine.chain(&[2; 16], at(23)).unwrap();
    assert!(collector.wait_frames(1));

    let frames = collector.frames();
    assert_eq!(frames[0].data, vec![2; 16]);
    assert_eq!(frames[0].graphics, None);
    assert_eq!(collector.channels(), Some(2));
    assert!(collector.errors().is_empty());
    assert_eq!(
        opener.opened.lock().unwrap()[0],
        ("decode".to_string(), "aachedec".to_string())
    );
    engine.exit().unwrap();
}

#[test]
fn oversized_packetized_frame_is_still_decoded() {
    init_logging();
    let avc = AvcConfig {
        version: 1,
        profile: 66,
        compatibility: 0,
        level: 30,
        nal_length_size: 4,
        sps: vec![vec![0x67, 0x42, 0x00, 0x1e]],
        pps: vec![vec![0x68, 0xce, 0x38, 0x80]],
    };
    let entry = find_decoder_by_name("h264").unwrap();
    let stream = StreamConfig::new(entry.media_type).with_codec_data(avc.to_bytes());
    let collector = Arc::new(Collector::default());
    let engine = DecoderEngine::new(
        entry,
        video_config(),
        &stream,
        Arc::new(MockOpener::new(Script::new())),
        collector.clone(),
    )
    .unwrap();

    // Fills a 64 byte input buffer exactly; the parameter sets put in
    // front of it do not fit.
    let mut frame = 60u32.to_be_bytes().to_vec();
    frame.push(0x65);
    frame.extend_from_slice(&[0xab; 59]);
    engine.chain(&frame, at(0)).unwrap();
    assert!(collector.wait_frames(1));

    let expected = [avc.annex_b(), vec![0, 0, 0, 1, 0x65], vec![0xab; 59]].concat();
    let frames = collector.frames();
    assert_eq!(frames[0].data, expected);
    assert_eq!(frames[0].meta.pts, Some(Duration::from_millis(0)));
    assert!(collector.errors().is_empty());
    engine.exit().unwrap();
}

#[test]
fn fatal_status_aborts_once() {
    let script = Script::new().with_steps([
        Step {
            status: -1,
            consumed: None,
        },
        Step {
            status: -1,
            consumed: None,
        },
    ]);
    let (engine, collector, _opener) = engine("mpeg2", video_config(), script);

    engine.chain(&[1; 10], at(0)).unwrap();
    assert!(collector.wait_error());

    assert!(matches!(
        engine.chain(&[2; 10], at(40)),
        Err(Error::HardwareFatal(_))
    ));
    assert!(matches!(engine.eos(), Err(Error::HardwareFatal(_))));
    assert_eq!(collector.errors().len(), 1);
    assert!(collector.frames().is_empty());

    engine.exit().unwrap();
    assert_eq!(engine.state(), EngineState::Aborted);
}

#[test]
fn failed_start_leaves_engine_stopped() {
    let script = Script {
        fail_open: true,
        ..Script::new()
    };
    let (engine, collector, _opener) = engine("mpeg2", video_config(), script);

    assert!(matches!(
        engine.chain(&[1; 10], at(0)),
        Err(Error::Allocation(_))
    ));
    assert_eq!(engine.state(), EngineState::Stopped);
    assert!(engine.chain(&[1; 10], at(0)).is_err());
    assert!(collector.frames().is_empty());
}

#[test]
fn paused_flush_does_not_wait_for_the_worker() {
    let script = Script::new();
    script.gate.close();
    let (engine, _collector, opener) = engine("mpeg2", video_config(), script);
    engine.set_paused(true);

    for n in 0..3u8 {
        engine.chain(&[n; 10], at(0)).unwrap();
    }
    assert!(opener.script.gate.wait_blocked());
    // Returns although the codec is still stuck on the first frame.
    engine.flush_start().unwrap();
    engine.flush_stop().unwrap();

    opener.script.gate.open();
    engine.exit().unwrap();
    // The first frame and the shutdown drain; the queued frames never
    // reached the codec.
    assert_eq!(opener.script.calls(), 2);
}

#[test]
fn invalid_configuration_is_rejected() {
    init_logging();
    let entry = find_decoder_by_name("h264").unwrap();
    let config = DecoderConfig {
        num_input_buffers: 16,
        fifo_capacity: 16,
        ..Default::default()
    };
    let result = DecoderEngine::new(
        entry,
        config,
        &StreamConfig::new(entry.media_type),
        Arc::new(MockOpener::default()),
        Arc::new(Collector::default()),
    );
    assert!(matches!(result, Err(Error::Config(_))));
}
