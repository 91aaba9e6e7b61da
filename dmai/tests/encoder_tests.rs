// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Encoder engine integration tests
//!
//! # Test Coverage
//!
//! - Input smaller than a frame is gathered until a whole frame is available
//! - Frame types map to delta units
//! - H.264 codec data is generated from the first frame, packetized output
//! - A flush releases a producer waiting for ring space
//! - Deconfiguring waits for downstream to return every encoded frame

mod common;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::{EncoderScript, MockOpener, init_logging};
use dmai::config::EncoderConfig;
use dmai::encoder::EncoderEngine;
use dmai::parser::h264::AvcConfig;
use dmai::registry::find_encoder;
use dmai::{Error, FrameMeta, Transport};

const SPS: [u8; 5] = [0x67, 0x42, 0x00, 0x1e, 0xaa];
const PPS: [u8; 4] = [0x68, 0xce, 0x38, 0x80];
const IDR: [u8; 3] = [0x65, 0x88, 0x84];

/// An encoded H.264 key frame carrying its parameter sets in band.
fn key_frame() -> Vec<u8> {
    [&[0, 0, 0, 1][..], &SPS, &[0, 0, 0, 1], &PPS, &[0, 0, 0, 1], &IDR].concat()
}

/// Builds an encoder for the registry entry `name`.
fn encoder(name: &str, config: EncoderConfig, script: EncoderScript) -> Arc<EncoderEngine> {
    init_logging();
    let entry = find_encoder(name).unwrap();
    let opener = Arc::new(MockOpener::encoding(script));
    Arc::new(EncoderEngine::new(entry, config, opener))
}

fn frame_config(in_size: usize, ring_size: usize) -> EncoderConfig {
    EncoderConfig {
        in_buffer_size: in_size,
        out_buffer_size: ring_size,
        ..Default::default()
    }
}

fn at(millis: u64) -> FrameMeta {
    FrameMeta {
        pts: Some(Duration::from_millis(millis)),
        ..Default::default()
    }
}

#[test]
fn partial_input_is_gathered_into_frames() {
    let engine = encoder(
        "mpeg4",
        frame_config(100, 300),
        EncoderScript {
            gop: 2,
            ..Default::default()
        },
    );

    assert!(engine.chain(&[1; 60], at(0)).unwrap().is_empty());
    assert!(engine.is_configured());
    let frames = engine.chain(&[2; 90], at(40)).unwrap();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].len(), 50);
    assert_eq!(&frames[0].as_ref()[..], &[1u8; 50][..]);
    assert!(!frames[0].meta().delta_unit);
    assert_eq!(frames[0].meta().pts, Some(Duration::from_millis(40)));
    drop(frames);

    // 50 bytes left over plus 50 more complete the second frame.
    let frames = engine.chain(&[3; 50], at(80)).unwrap();
    assert_eq!(frames.len(), 1);
    assert!(frames[0].meta().delta_unit);
    drop(frames);
    engine.deconfigure().unwrap();
}

#[test]
fn whole_frames_are_encoded_in_order() {
    let engine = encoder("mpeg4", frame_config(100, 300), EncoderScript::default());

    let mut held = Vec::new();
    for n in 0..3u8 {
        let frames = engine.chain(&[n; 100], at(u64::from(n) * 40)).unwrap();
        assert_eq!(frames.len(), 1);
        held.extend(frames);
    }
    let firsts: Vec<u8> = held.iter().map(|frame| frame.as_ref()[0]).collect();
    assert_eq!(firsts, vec![0, 1, 2]);
    drop(held);
    engine.deconfigure().unwrap();
    assert!(!engine.is_configured());
}

#[test]
fn oversized_input_is_rejected() {
    let engine = encoder("aac", frame_config(64, 0), EncoderScript::default());
    assert!(matches!(
        engine.chain(&[0; 65], at(0)),
        Err(Error::Capacity {
            needed: 65,
            available: 64
        })
    ));
}

/// An mpeg4 encoder whose mock codec the test can inspect.
fn inspected_encoder(config: EncoderConfig) -> (Arc<EncoderEngine>, Arc<MockOpener>) {
    init_logging();
    let opener = Arc::new(MockOpener::encoding(EncoderScript::default()));
    let engine = EncoderEngine::new(find_encoder("mpeg4").unwrap(), config, opener.clone());
    (Arc::new(engine), opener)
}

#[test]
fn copied_input_is_staged_in_one_region() {
    let (engine, opener) = inspected_encoder(frame_config(100, 300));
    let first = vec![1u8; 100];
    let second = vec![2u8; 100];

    let frames = engine.chain(&first, at(0)).unwrap();
    assert_eq!(&frames[0].as_ref()[..], &[1u8; 50][..]);
    drop(frames);
    drop(engine.chain(&second, at(40)).unwrap());
    assert!(engine.chain(&second[..30], at(80)).unwrap().is_empty());
    drop(engine.chain(&first[..70], at(80)).unwrap());

    let inputs = opener.encoder.inputs.lock().unwrap().clone();
    assert_eq!(inputs.len(), 3);
    assert!(inputs.iter().all(|addr| *addr == inputs[0]));
    assert_ne!(inputs[0], first.as_ptr() as usize);
    assert_ne!(inputs[0], second.as_ptr() as usize);
    engine.deconfigure().unwrap();
}

#[test]
fn whole_frame_transport_is_encoded_in_place() {
    let (engine, opener) = inspected_encoder(frame_config(100, 300));
    drop(engine.chain(&[1; 100], at(0)).unwrap());
    let staged = opener.encoder.inputs.lock().unwrap()[0];

    let mut whole = Transport::plain(&[5; 100]).unwrap();
    *whole.meta_mut() = at(40);
    let frames = engine.chain_transport(&whole).unwrap();
    assert_eq!(frames.len(), 1);
    assert_eq!(&frames[0].as_ref()[..], &[5u8; 50][..]);
    assert_eq!(frames[0].meta().pts, Some(Duration::from_millis(40)));
    assert_eq!(
        opener.encoder.inputs.lock().unwrap()[1],
        whole.as_ref().as_ptr() as usize
    );
    drop(frames);

    // A partial transport still goes through the input region.
    let head = Transport::plain(&[6; 60]).unwrap();
    let tail = Transport::plain(&[7; 40]).unwrap();
    assert!(engine.chain_transport(&head).unwrap().is_empty());
    assert_eq!(engine.chain_transport(&tail).unwrap().len(), 1);
    assert_eq!(opener.encoder.inputs.lock().unwrap()[2], staged);
    engine.deconfigure().unwrap();
}

#[test]
fn frame_size_falls_back_to_first_buffer() {
    let engine = encoder("mp3", EncoderConfig::default(), EncoderScript::default());
    assert!(matches!(engine.chain(&[], at(0)), Err(Error::Config(_))));

    let frames = engine.chain(&[7; 32], at(0)).unwrap();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].len(), 16);
}

#[test]
fn h264_codec_data_comes_from_the_first_frame() {
    let script = EncoderScript {
        frames: vec![key_frame()],
        ..Default::default()
    };
    let engine = encoder("h264", frame_config(64, 0), script);
    assert_eq!(engine.codec_data(), None);

    let frames = engine.chain(&[0; 64], at(0)).unwrap();
    assert_eq!(frames[0].as_ref(), &key_frame()[..]);

    let avc = AvcConfig::parse(&engine.codec_data().unwrap()).unwrap();
    assert_eq!(avc.profile, 0x42);
    assert_eq!(avc.level, 0x1e);
    assert_eq!(avc.sps, vec![SPS.to_vec()]);
    assert_eq!(avc.pps, vec![PPS.to_vec()]);
}

#[test]
fn packetized_h264_drops_parameter_sets() {
    let script = EncoderScript {
        frames: vec![key_frame()],
        ..Default::default()
    };
    let config = EncoderConfig {
        packetized: true,
        ..frame_config(64, 0)
    };
    let engine = encoder("h264enc", config, script);

    let frames = engine.chain(&[0; 64], at(0)).unwrap();
    assert_eq!(frames[0].as_ref(), &[0, 0, 0, 3, 0x65, 0x88, 0x84][..]);
    assert!(engine.codec_data().is_some());
}

#[test]
fn flush_releases_producer_waiting_for_ring_space() {
    let engine = encoder("mpeg4", frame_config(100, 100), EncoderScript::default());
    let held = engine.chain(&[1; 100], at(0)).unwrap();
    assert_eq!(held.len(), 1);

    let producer = {
        let engine = engine.clone();
        thread::spawn(move || engine.chain(&[2; 100], at(40)).map(|frames| frames.len()))
    };
    thread::sleep(Duration::from_millis(20));
    assert!(!producer.is_finished());

    engine.flush_start().unwrap();
    assert_eq!(producer.join().unwrap().unwrap(), 0);
    assert!(engine.chain(&[3; 100], at(80)).unwrap().is_empty());
    engine.flush_stop().unwrap();

    drop(held);
    assert_eq!(engine.chain(&[4; 100], at(120)).unwrap().len(), 1);
}

#[test]
fn deconfigure_waits_for_downstream() {
    let engine = encoder("mpeg4", frame_config(100, 300), EncoderScript::default());
    let held = engine.chain(&[1; 100], at(0)).unwrap();

    let closer = {
        let engine = engine.clone();
        thread::spawn(move || engine.deconfigure())
    };
    thread::sleep(Duration::from_millis(20));
    assert!(!closer.is_finished());

    drop(held);
    closer.join().unwrap().unwrap();
    assert!(!engine.is_configured());
    assert_eq!(engine.codec_data(), None);
}
