//! DMAI Encoder Element
//!
//! This module implements `dmaienc`, a GStreamer element that encodes raw
//! video or audio on the DSP.
//!
//! ## Responsibilities
//! - Opens the encoder named by the `codec` property
//! - Gathers raw input into whole frames
//! - Pushes encoded frames straight from the codec's output ring
//! - Produces byte-stream or packetized (avc) H.264 as downstream prefers
//!
//! ## Properties (set in NULL or READY)
//! - `codec`: h264, mpeg4, aac, wma or mp3
//! - `engine-name`, `codec-name`: codec engine and codec to open
//! - `engine-library`: vendor engine library to load
//! - `out-buffer-size`: size of the output ring
//!
//! ## Example Pipeline
//! ```bash
//! gst-launch-1.0 videotestsrc ! video/x-raw,format=UYVY,width=720,height=480 ! \
//!     dmaienc codec=h264 ! filesink location=out.264
//! ```

// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

use gst::glib;
use gst::prelude::*;
use gstreamer as gst;

/// Core implementation (properties, pads, events, state changes)
mod imp;


/// Settings, caps translation and negotiated stream
mod state;

/// GLib wrapper type for the DmaiEnc element.
glib::wrapper! {
    pub struct DmaiEnc(ObjectSubclass<imp::DmaiEnc>) @extends gst::Element, gst::Object;
}

/// Registers the dmaienc element with GStreamer.
pub fn register(plugin: &gst::Plugin) -> Result<(), glib::BoolError> {
    gst::Element::register(
        Some(plugin),
        "dmaienc",
        gst::Rank::NONE,
        DmaiEnc::static_type(),
    )
}
