// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! GStreamer plugin for DSP accelerated codecs
//!
//! Two elements put the `dmai` engines behind GStreamer pads:
//!
//! - **dmaidec**: decodes H.264, MPEG-4, MPEG-2 and AAC on the DSP. The codec
//!   is picked from the sink caps; decoding runs on a dedicated thread and
//!   decoded frames are pushed without copying out of the codec's buffers.
//! - **dmaienc**: encodes raw video or audio with the codec named by its
//!   `codec` property, inline on the streaming thread.
//!
//! Both elements reach the hardware through the vendor codec engine library,
//! loaded at runtime from the `engine-library` property when the element
//! goes to READY.

// Allow non-Send fields in Send types (required for GStreamer's threading model)
// and unused doc comments (sometimes present in macro-generated code)
#![allow(clippy::non_send_fields_in_send_ty, unused_doc_comments)]

use gst::glib;
use gstreamer as gst;

/// Decoder element.
pub mod dmaidec;

/// Encoder element.
pub mod dmaienc;

/// Buffers handed downstream while still owned by a `dmai` transport.
mod transport_buffer;

/// Registers both elements with GStreamer.
fn plugin_init(plugin: &gst::Plugin) -> Result<(), glib::BoolError> {
    dmaidec::register(plugin)?;
    dmaienc::register(plugin)?;
    Ok(())
}

gst::plugin_define!(
    dmai,
    env!("CARGO_PKG_DESCRIPTION"),
    plugin_init,
    concat!(env!("CARGO_PKG_VERSION"), "-", env!("COMMIT_ID")),
    "Apache-2.0",
    env!("CARGO_PKG_NAME"),
    env!("CARGO_PKG_NAME"),
    env!("CARGO_PKG_REPOSITORY"),
    env!("BUILD_REL_DATE")
);
