// SPDX-FileCopyrightText: 2025 2025 Contributors to the Media eXchange Layer project.
// SPDX-License-Identifier: Apache-2.0

//! Conversion between `dmai` transports and `gst::Buffer`s.
//!
//! Decoded and encoded frames stay in the memory the codec wrote them to.
//! The transport is moved into the buffer's memory and dropped with it, which
//! hands the underlying pool buffer or ring region back to `dmai`.

use std::time::Duration;

use dmai::{FrameMeta, Transport};
use gstreamer as gst;

/// Owns a transport for the lifetime of a `gst::Memory`.
struct TransportMemory(Transport);

impl AsRef<[u8]> for TransportMemory {
    fn as_ref(&self) -> &[u8] {
        self.0.as_ref()
    }
}

impl AsMut<[u8]> for TransportMemory {
    fn as_mut(&mut self) -> &mut [u8] {
        self.0.as_mut()
    }
}

fn clock_time(duration: Option<Duration>) -> Option<gst::ClockTime> {
    duration.map(|d| gst::ClockTime::from_nseconds(d.as_nanos() as u64))
}

/// Moves `transport` into a buffer carrying its timestamps and flags.
pub(crate) fn into_buffer(transport: Transport) -> gst::Buffer {
    let meta = *transport.meta();
    let mut buffer = gst::Buffer::from_mut_slice(TransportMemory(transport));
    {
        let buffer = buffer.make_mut();
        buffer.set_pts(clock_time(meta.pts));
        buffer.set_duration(clock_time(meta.duration));
        if meta.delta_unit {
            buffer.set_flags(gst::BufferFlags::DELTA_UNIT);
        }
        if meta.discont {
            buffer.set_flags(gst::BufferFlags::DISCONT);
        }
    }
    buffer
}

/// Takes the transport back out of a buffer built by [`into_buffer`].
///
/// The buffer's current timestamps and flags replace the transport's. Any
/// other buffer, or one still shared, is handed back unchanged.
pub(crate) fn into_transport(buffer: gst::Buffer) -> Result<Transport, gst::Buffer> {
    let meta = frame_meta(&buffer);
    match buffer.try_into_inner::<TransportMemory>() {
        Ok(TransportMemory(mut transport)) => {
            *transport.meta_mut() = meta;
            Ok(transport)
        }
        Err((buffer, _)) => Err(buffer),
    }
}

/// Timestamps and flags of an upstream buffer.
pub(crate) fn frame_meta(buffer: &gst::BufferRef) -> FrameMeta {
    let flags = buffer.flags();
    FrameMeta {
        pts: buffer.pts().map(|t| Duration::from_nanos(t.nseconds())),
        duration: buffer.duration().map(|t| Duration::from_nanos(t.nseconds())),
        delta_unit: flags.contains(gst::BufferFlags::DELTA_UNIT),
        discont: flags.contains(gst::BufferFlags::DISCONT),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dmai::{BufferAttrs, BufferPool, Owners};

    #[test]
    fn buffer_keeps_pool_buffer_until_dropped() {
        gst::init().unwrap();
        let pool = BufferPool::create(1, 16, BufferAttrs::default()).unwrap();
        let frame = pool.acquire_free().unwrap().unwrap();
        frame.fill(&[7; 10]).unwrap();
        frame.release(Owners::CODEC).unwrap();

        let mut transport = Transport::wrap(frame, Some(pool.wait_handle())).unwrap();
        transport.meta_mut().pts = Some(Duration::from_millis(40));
        transport.meta_mut().delta_unit = true;

        let buffer = into_buffer(transport);
        assert_eq!(pool.free_count().unwrap(), 0);
        assert_eq!(buffer.size(), 10);
        assert_eq!(buffer.pts(), Some(gst::ClockTime::from_mseconds(40)));
        assert!(buffer.flags().contains(gst::BufferFlags::DELTA_UNIT));
        assert_eq!(&*buffer.map_readable().unwrap(), &[7; 10]);

        drop(buffer);
        assert_eq!(pool.free_count().unwrap(), 1);
    }

    #[test]
    fn upstream_flags_become_frame_meta() {
        gst::init().unwrap();
        let mut buffer = gst::Buffer::with_size(4).unwrap();
        {
            let buffer = buffer.get_mut().unwrap();
            buffer.set_pts(gst::ClockTime::from_mseconds(80));
            buffer.set_flags(gst::BufferFlags::DISCONT);
        }
        let meta = frame_meta(&buffer);
        assert_eq!(meta.pts, Some(Duration::from_millis(80)));
        assert_eq!(meta.duration, None);
        assert!(meta.discont);
        assert!(!meta.delta_unit);
    }

    #[test]
    fn transport_comes_back_out_of_its_buffer() {
        gst::init().unwrap();
        let transport = Transport::plain(&[3; 24]).unwrap();
        let data = transport.as_ref().as_ptr();

        let mut buffer = into_buffer(transport);
        buffer
            .get_mut()
            .unwrap()
            .set_pts(gst::ClockTime::from_mseconds(120));
        let transport = into_transport(buffer).unwrap();
        assert_eq!(transport.as_ref().as_ptr(), data);
        assert_eq!(transport.meta().pts, Some(Duration::from_millis(120)));

        let foreign = gst::Buffer::from_slice(vec![3u8; 24]);
        assert!(into_transport(foreign).is_err());
    }
}
