//! Chained packet buffers with reader/writer cursors.
//!
//! Every layer of the stack fragments and reassembles differently, so packets
//! are kept as chains of segments instead of flat allocations. A cursor walks
//! the chain transparently; when a `header_size` is set, that many bytes at
//! the start of every segment are skipped, which is how the per-fragment
//! HCI/ACL headers stay out of the payload stream.

use crate::hci::error::Error;

/// One segment of a packet chain.
///
/// `len` is the number of valid bytes; `data.len()` is the allocated capacity.
struct Segment {
    len: u16,
    data: Box<[u8]>,
}

impl Segment {
    fn with_capacity(capacity: u16) -> Self {
        Segment {
            len: capacity,
            data: vec![0u8; capacity as usize].into_boxed_slice(),
        }
    }
}

/// A packet, as a chain of segments.
pub struct Buffer {
    total_size: u16,
    segments: Vec<Segment>,
}

impl Buffer {
    /// Allocate a chain holding `total` bytes, each segment capped at
    /// `per_segment`; the last segment may be shorter.
    pub fn alloc(total: u16, per_segment: u16) -> Buffer {
        let per_segment = per_segment.max(1);
        let mut segments = Vec::new();
        let mut remaining = total;
        loop {
            let size = remaining.min(per_segment);
            segments.push(Segment::with_capacity(size));
            remaining -= size;
            if remaining == 0 {
                break;
            }
        }
        Buffer {
            total_size: total,
            segments,
        }
    }

    /// Single-segment allocation, used for small packets such as HCI commands.
    pub fn alloc_contiguous(total: u16) -> Buffer {
        Buffer {
            total_size: total,
            segments: vec![Segment::with_capacity(total)],
        }
    }

    /// Build a contiguous buffer holding a copy of `data`.
    pub fn from_slice(data: &[u8]) -> Buffer {
        let mut buffer = Buffer::alloc_contiguous(data.len() as u16);
        buffer.segments[0].data.copy_from_slice(data);
        buffer
    }

    pub fn total_size(&self) -> u16 {
        self.total_size
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Truncate the chain to `size` bytes. Tail segments are kept with a
    /// zero length so the chain shape survives the shrink.
    pub fn shrink(&mut self, size: u16) {
        self.total_size = size;
        let mut remaining = size;
        for segment in self.segments.iter_mut() {
            if segment.len > remaining {
                segment.len = remaining;
            }
            remaining -= segment.len;
        }
    }

    /// Move the segments of `other` onto the end of this chain.
    pub fn append(&mut self, other: Buffer) {
        self.total_size += other.total_size;
        self.segments.extend(other.segments);
    }

    /// Borrow `size` contiguous bytes from the first segment, if it holds
    /// that many.
    pub fn contiguous_data(&self, size: u16) -> Option<&[u8]> {
        let segment = &self.segments[0];
        if segment.len >= size {
            Some(&segment.data[..segment.len as usize])
        } else {
            None
        }
    }

    /// Mutable form of [`contiguous_data`](Buffer::contiguous_data).
    pub fn contiguous_data_mut(&mut self, size: u16) -> Option<&mut [u8]> {
        let segment = &mut self.segments[0];
        if segment.len >= size {
            Some(&mut segment.data[..segment.len as usize])
        } else {
            None
        }
    }

    /// Iterate over the valid bytes of every segment, mutably. Used to
    /// pre-write per-fragment headers before handing the chain to a writer.
    pub(crate) fn segments_mut(&mut self) -> impl Iterator<Item = &mut [u8]> {
        self.segments
            .iter_mut()
            .map(|segment| &mut segment.data[..segment.len as usize])
    }

    /// Break the chain apart, one buffer per segment.
    pub(crate) fn into_fragments(self) -> Vec<Buffer> {
        self.segments
            .into_iter()
            .map(|segment| Buffer {
                total_size: segment.len,
                segments: vec![segment],
            })
            .collect()
    }

    /// Copy the whole chain into one flat vector.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.total_size as usize];
        let mut reader = BufferReader::new(self);
        let len = reader.read(&mut out);
        out.truncate(len);
        out
    }
}

/// Writing cursor over a [`Buffer`] chain.
pub struct BufferWriter {
    buffer: Buffer,
    segment: usize,
    pos_in_segment: u16,
    header_size: u16,
}

impl BufferWriter {
    pub fn new(buffer: Buffer) -> BufferWriter {
        BufferWriter {
            buffer,
            segment: 0,
            pos_in_segment: 0,
            header_size: 0,
        }
    }

    /// Skip `header_size` bytes at the start of every segment the cursor
    /// enters. Must be set before anything is written.
    pub fn set_header_size(&mut self, header_size: u16) {
        self.header_size = header_size;
        if self.segment == 0 && self.pos_in_segment < header_size {
            self.pos_in_segment = header_size.min(self.buffer.segments[0].len);
        }
    }

    fn available(&self) -> u16 {
        let mut available = 0;
        for (index, segment) in self.buffer.segments.iter().enumerate().skip(self.segment) {
            let start = if index == self.segment {
                self.pos_in_segment
            } else {
                self.header_size
            };
            available += segment.len.saturating_sub(start);
        }
        available
    }

    fn enter_next_segment(&mut self) {
        self.segment += 1;
        let len = self.buffer.segments[self.segment].len;
        self.pos_in_segment = self.header_size.min(len);
    }

    fn at_segment_end(&self) -> bool {
        self.pos_in_segment >= self.buffer.segments[self.segment].len
    }

    /// Copy `data` into the chain, crossing segment boundaries as needed.
    pub fn write(&mut self, data: &[u8]) -> Result<(), Error> {
        if data.len() as u16 > self.available() {
            return Err(Error::OutOfRoom);
        }
        let mut offset = 0;
        while offset < data.len() {
            while self.at_segment_end() {
                self.enter_next_segment();
            }
            let segment = &mut self.buffer.segments[self.segment];
            let space = (segment.len - self.pos_in_segment) as usize;
            let count = space.min(data.len() - offset);
            let start = self.pos_in_segment as usize;
            segment.data[start..start + count].copy_from_slice(&data[offset..offset + count]);
            self.pos_in_segment += count as u16;
            offset += count;
        }
        Ok(())
    }

    /// Borrow `size` contiguous bytes inside the current segment. Fails when
    /// the span would straddle a segment boundary; callers fall back to
    /// [`write`](BufferWriter::write).
    pub fn ptr_n(&mut self, size: u16) -> Option<&mut [u8]> {
        while self.segment + 1 < self.buffer.segments.len() && self.at_segment_end() {
            self.enter_next_segment();
        }
        let segment = &mut self.buffer.segments[self.segment];
        if self.pos_in_segment + size > segment.len {
            return None;
        }
        let start = self.pos_in_segment as usize;
        self.pos_in_segment += size;
        Some(&mut segment.data[start..start + size as usize])
    }

    /// Borrow the rest of the current segment.
    pub fn ptr_max(&mut self) -> &mut [u8] {
        let segment = &mut self.buffer.segments[self.segment];
        let start = self.pos_in_segment as usize;
        self.pos_in_segment = segment.len;
        &mut segment.data[start..segment.len as usize]
    }

    /// Move the cursor forward without writing.
    pub fn advance(&mut self, size: u16) -> Result<(), Error> {
        if size > self.available() {
            return Err(Error::OutOfRoom);
        }
        let mut remaining = size;
        while remaining > 0 {
            while self.at_segment_end() {
                self.enter_next_segment();
            }
            let segment_left = self.buffer.segments[self.segment].len - self.pos_in_segment;
            let count = segment_left.min(remaining);
            self.pos_in_segment += count;
            remaining -= count;
        }
        Ok(())
    }

    /// Finish writing and hand the chain back.
    pub fn end(self) -> Buffer {
        self.buffer
    }
}

/// Reading cursor over a [`Buffer`] chain.
#[derive(Clone, Copy)]
pub struct BufferReader<'a> {
    buffer: &'a Buffer,
    segment: usize,
    pos_in_segment: u16,
    header_size: u16,
}

impl<'a> BufferReader<'a> {
    pub fn new(buffer: &'a Buffer) -> BufferReader<'a> {
        BufferReader {
            buffer,
            segment: 0,
            pos_in_segment: 0,
            header_size: 0,
        }
    }

    /// See [`BufferWriter::set_header_size`].
    pub fn set_header_size(&mut self, header_size: u16) {
        self.header_size = header_size;
        if self.segment == 0 && self.pos_in_segment < header_size {
            self.pos_in_segment = header_size.min(self.buffer.segments[0].len);
        }
    }

    /// Payload bytes left under the cursor.
    pub fn remaining(&self) -> u16 {
        let mut remaining = 0;
        for (index, segment) in self.buffer.segments.iter().enumerate().skip(self.segment) {
            let start = if index == self.segment {
                self.pos_in_segment
            } else {
                self.header_size
            };
            remaining += segment.len.saturating_sub(start);
        }
        remaining
    }

    fn at_segment_end(&self) -> bool {
        self.pos_in_segment >= self.buffer.segments[self.segment].len
    }

    fn enter_next_segment(&mut self) {
        self.segment += 1;
        let len = self.buffer.segments[self.segment].len;
        self.pos_in_segment = self.header_size.min(len);
    }

    fn has_more(&self) -> bool {
        self.segment + 1 < self.buffer.segments.len() || !self.at_segment_end()
    }

    /// Copy up to `out.len()` bytes from the chain; returns the number read.
    pub fn read(&mut self, out: &mut [u8]) -> usize {
        let mut offset = 0;
        while offset < out.len() {
            while self.at_segment_end() {
                if self.segment + 1 >= self.buffer.segments.len() {
                    return offset;
                }
                self.enter_next_segment();
            }
            let segment = &self.buffer.segments[self.segment];
            let left = (segment.len - self.pos_in_segment) as usize;
            let count = left.min(out.len() - offset);
            let start = self.pos_in_segment as usize;
            out[offset..offset + count].copy_from_slice(&segment.data[start..start + count]);
            self.pos_in_segment += count as u16;
            offset += count;
        }
        offset
    }

    /// Borrow `size` contiguous bytes from the current segment, or fail if
    /// the span straddles a boundary.
    pub fn read_n(&mut self, size: u16) -> Option<&'a [u8]> {
        while self.at_segment_end() {
            if self.segment + 1 >= self.buffer.segments.len() {
                return None;
            }
            self.enter_next_segment();
        }
        let segment = &self.buffer.segments[self.segment];
        if self.pos_in_segment + size > segment.len {
            return None;
        }
        let start = self.pos_in_segment as usize;
        self.pos_in_segment += size;
        Some(&segment.data[start..start + size as usize])
    }

    /// Borrow whatever is left of the current segment.
    pub fn read_max(&mut self) -> &'a [u8] {
        while self.at_segment_end() {
            if self.segment + 1 >= self.buffer.segments.len() {
                return &[];
            }
            self.enter_next_segment();
        }
        let segment = &self.buffer.segments[self.segment];
        let start = self.pos_in_segment as usize;
        self.pos_in_segment = segment.len;
        &segment.data[start..segment.len as usize]
    }

    /// Skip `size` bytes; returns how many were actually skipped.
    pub fn advance(&mut self, size: u16) -> u16 {
        let mut skipped = 0;
        while skipped < size {
            while self.at_segment_end() {
                if self.segment + 1 >= self.buffer.segments.len() {
                    return skipped;
                }
                self.enter_next_segment();
            }
            let left = self.buffer.segments[self.segment].len - self.pos_in_segment;
            let count = left.min(size - skipped);
            self.pos_in_segment += count;
            skipped += count;
        }
        skipped
    }
}

impl core::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("Buffer")
            .field("total_size", &self.total_size)
            .field("segments", &self.segments.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 + 3) as u8).collect()
    }

    fn segment_sizes(buffer: &Buffer) -> u16 {
        buffer.segments.iter().map(|s| s.len).sum()
    }

    #[test]
    fn segment_sizes_sum_to_total() {
        let mut buffer = Buffer::alloc(100, 16);
        assert_eq!(segment_sizes(&buffer), buffer.total_size());
        assert_eq!(buffer.segment_count(), 7);

        buffer.shrink(37);
        assert_eq!(buffer.total_size(), 37);
        assert_eq!(segment_sizes(&buffer), 37);
        // Tail segments survive with zero length
        assert_eq!(buffer.segment_count(), 7);

        let mut head = Buffer::alloc(10, 4);
        head.append(Buffer::alloc(9, 2));
        assert_eq!(head.total_size(), 19);
        assert_eq!(segment_sizes(&head), 19);
    }

    #[test]
    fn round_trip_across_any_segmentation() {
        const N: u16 = 61;
        let data = pattern(N as usize);
        for per_segment in 1..=N {
            let buffer = Buffer::alloc(N, per_segment);
            let mut writer = BufferWriter::new(buffer);
            writer.write(&data).unwrap();
            let buffer = writer.end();

            let mut out = vec![0u8; N as usize];
            let mut reader = BufferReader::new(&buffer);
            assert_eq!(reader.read(&mut out), N as usize);
            assert_eq!(out, data, "per_segment = {}", per_segment);
        }
    }

    #[test]
    fn header_skipping_is_transparent() {
        const HDR: u16 = 4;
        const SEGMENT: u16 = 16;
        const PAYLOAD: u16 = 50;
        // Five segments of 16 carry 4 + 12 each; the last holds the remainder.
        let segments = (PAYLOAD + SEGMENT - HDR - 1) / (SEGMENT - HDR);
        let total = PAYLOAD + segments * HDR;
        let mut buffer = Buffer::alloc(total, SEGMENT);

        for segment in buffer.segments_mut() {
            segment[..HDR as usize].copy_from_slice(&[0xAA; HDR as usize]);
        }

        let data = pattern(PAYLOAD as usize);
        let mut writer = BufferWriter::new(buffer);
        writer.set_header_size(HDR);
        writer.write(&data).unwrap();
        let buffer = writer.end();

        let mut reader = BufferReader::new(&buffer);
        reader.set_header_size(HDR);
        let mut out = vec![0u8; PAYLOAD as usize];
        assert_eq!(reader.read(&mut out), PAYLOAD as usize);
        assert_eq!(out, data);

        // The pre-written headers were left alone
        let raw = buffer.to_vec();
        assert_eq!(&raw[..HDR as usize], &[0xAA; HDR as usize]);
    }

    #[test]
    fn writer_rejects_overflow() {
        let buffer = Buffer::alloc(8, 4);
        let mut writer = BufferWriter::new(buffer);
        assert!(writer.write(&[0u8; 9]).is_err());
        assert!(writer.write(&[1u8; 8]).is_ok());
        assert!(writer.write(&[2u8]).is_err());
    }

    #[test]
    fn ptr_n_fails_across_boundary() {
        let buffer = Buffer::alloc(8, 4);
        let mut writer = BufferWriter::new(buffer);
        assert!(writer.ptr_n(3).is_some());
        // One byte left in the first segment; four would straddle
        assert!(writer.ptr_n(4).is_none());
        assert_eq!(writer.ptr_max().len(), 1);
        assert!(writer.ptr_n(4).is_some());
    }

    #[test]
    fn reader_zero_copy_and_advance() {
        let mut data = Vec::new();
        for chunk in 0..3u8 {
            data.extend((0..5).map(|i| chunk * 10 + i));
        }
        let buffer = {
            let b = Buffer::alloc(15, 5);
            let mut w = BufferWriter::new(b);
            w.write(&data).unwrap();
            w.end()
        };

        let mut reader = BufferReader::new(&buffer);
        assert_eq!(reader.read_n(5).unwrap(), &data[..5]);
        // Straddling borrow fails, bulk read still works
        let mut copy = reader;
        assert!(copy.read_n(6).is_none());
        assert_eq!(reader.advance(6), 6);
        assert_eq!(reader.remaining(), 4);
        assert_eq!(reader.read_max(), &data[11..15]);
    }
}
