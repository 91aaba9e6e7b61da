//! DMAI Decoder Element
//!
//! This module implements `dmaidec`, a GStreamer element that decodes
//! compressed video and audio on the DSP of a TI DaVinci / OMAP3 SoC.
//!
//! ## Responsibilities
//! - Selects the codec from the sink caps (H.264, MPEG-4, MPEG-2, AAC)
//! - Frames the incoming byte stream into access units
//! - Runs the codec on a dedicated decode thread
//! - Pushes decoded frames without copying them out of DSP memory
//!
//! ## Properties (set in NULL or READY)
//! - `engine-name`: codec engine holding the decoder
//! - `codec-name`: codec to open, empty to pick it from the caps
//! - `engine-library`: vendor engine library to load
//! - `num-output-buffers`: decoded frames to allocate
//! - `gen-timestamps`: stamp decoded frames with the input timestamps
//! - `device`: target SoC
//!
//! ## Example Pipeline
//! ```bash
//! gst-launch-1.0 filesrc location=clip.264 ! video/x-h264 ! \
//!     dmaidec device=dm6467 ! fakesink
//! ```

// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

use gst::glib;
use gst::prelude::*;
use gstreamer as gst;

/// Core implementation (properties, pads, events, state changes)
mod imp;


/// Settings, negotiated stream and the source pad adapter
mod state;

/// GLib wrapper type for the DmaiDec element.
///
/// ## Inheritance Chain (GStreamer class hierarchy)
/// - `gst::Object` (base GStreamer object)
/// - `gst::Element` (has pads, state machine)
/// - `DmaiDec` (our custom implementation)
glib::wrapper! {
    pub struct DmaiDec(ObjectSubclass<imp::DmaiDec>) @extends gst::Element, gst::Object;
}

/// Registers the dmaidec element with GStreamer.
pub fn register(plugin: &gst::Plugin) -> Result<(), glib::BoolError> {
    gst::Element::register(
        Some(plugin),
        "dmaidec",
        gst::Rank::NONE,
        DmaiDec::static_type(),
    )
}
