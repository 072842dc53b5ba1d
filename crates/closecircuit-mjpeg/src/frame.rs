//! Frame boundary detection over an accumulating byte buffer

use bytes::{Buf, Bytes, BytesMut};
use tracing::{trace, warn};

/// JPEG start-of-image marker
pub const SOI: [u8; 2] = [0xFF, 0xD8];

/// JPEG end-of-image marker
pub const EOI: [u8; 2] = [0xFF, 0xD9];

/// Accumulates stream bytes and cuts out SOI..EOI payloads.
///
/// After every push the buffer holds only bytes that follow the last
/// extracted frame, so delivered data is never retained.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: BytesMut,
    max_bytes: Option<usize>,
}

impl FrameBuffer {
    /// `max_bytes` caps how much is kept between pushes
    pub fn new(max_bytes: Option<usize>) -> Self {
        Self {
            buf: BytesMut::new(),
            max_bytes,
        }
    }

    /// Appends `chunk` and returns the newest complete frame, if any.
    ///
    /// Every complete frame is cut out of the buffer; older ones completed
    /// by the same push are superseded and dropped. The cap is checked
    /// against whatever remains.
    pub fn push(&mut self, chunk: &[u8]) -> Option<Bytes> {
        self.buf.extend_from_slice(chunk);

        let mut newest = None;
        let mut superseded = 0usize;
        while let Some(frame) = self.extract() {
            if newest.replace(frame).is_some() {
                superseded += 1;
            }
        }
        if superseded > 0 {
            trace!(superseded, "Dropped frames superseded within one chunk");
        }

        self.enforce_limit();
        newest
    }

    fn extract(&mut self) -> Option<Bytes> {
        let start = find_marker(&self.buf, &SOI)?;
        let end_rel = find_marker(&self.buf[start + SOI.len()..], &EOI)?;
        let end = start + SOI.len() + end_rel + EOI.len();

        // Leading garbage goes out with the frame
        let mut consumed = self.buf.split_to(end);
        consumed.advance(start);
        Some(consumed.freeze())
    }

    /// Drops data that can no longer become part of a frame within the cap.
    /// Returns the number of bytes discarded.
    fn enforce_limit(&mut self) -> usize {
        let Some(max) = self.max_bytes else {
            return 0;
        };
        if self.buf.len() <= max {
            return 0;
        }

        let before = self.buf.len();

        match find_marker(&self.buf, &SOI) {
            Some(start) if start > 0 => self.buf.advance(start),
            _ => {}
        }

        if self.buf.len() > max {
            // A trailing 0xFF may be the first half of a split marker
            let keep_ff = self.buf.last() == Some(&0xFF);
            self.buf.clear();
            if keep_ff {
                self.buf.extend_from_slice(&[0xFF]);
            }
        }

        let discarded = before - self.buf.len();
        warn!(
            discarded,
            max_buffer_bytes = max,
            "Frame buffer over limit, resynchronizing"
        );
        discarded
    }

    /// Bytes currently waiting for a frame boundary
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

fn find_marker(buffer: &[u8], marker: &[u8; 2]) -> Option<usize> {
    buffer.windows(2).position(|w| w == marker)
}
