//! Bounded TCP reassembly buffer
//!
//! Works on absolute stream offsets so sequence wraparound is handled once,
//! by the caller.

use bytes::{Bytes, BytesMut};
use std::collections::BTreeMap;

/// Outcome of pushing a segment
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Accept {
    /// In-order bytes ready for delivery, including any drained buffered data
    Deliver(Bytes),
    /// Held until the gap before it is filled
    Buffered,
    /// Entirely before the delivery point
    Duplicate,
    /// Reaches beyond the window; the flow must be dropped
    Overflow,
}

/// Out-of-order segment buffer with a byte window
#[derive(Debug)]
pub struct Reassembly {
    window: usize,
    next: u64,
    segments: BTreeMap<u64, Bytes>,
    buffered: usize,
}

impl Reassembly {
    /// Create a buffer that accepts data up to `window` bytes past the
    /// delivery point
    pub fn new(window: usize) -> Self {
        Reassembly {
            window,
            next: 0,
            segments: BTreeMap::new(),
            buffered: 0,
        }
    }

    /// Offset of the next byte to deliver
    pub fn next(&self) -> u64 {
        self.next
    }

    /// Bytes held out of order
    pub fn buffered(&self) -> usize {
        self.buffered
    }

    /// Whether a gap is pending
    pub fn has_gap(&self) -> bool {
        !self.segments.is_empty()
    }

    /// Accept `data` starting at stream `offset`
    pub fn push(&mut self, offset: u64, mut data: Bytes) -> Accept {
        let end = offset + data.len() as u64;
        if data.is_empty() || end <= self.next {
            return Accept::Duplicate;
        }
        let mut offset = offset;
        if offset < self.next {
            data = data.slice((self.next - offset) as usize..);
            offset = self.next;
        }
        if end - self.next > self.window as u64 {
            return Accept::Overflow;
        }

        if offset > self.next {
            self.hold(offset, data);
            return Accept::Buffered;
        }

        self.next = end;
        if self.segments.is_empty() {
            return Accept::Deliver(data);
        }

        let mut out = BytesMut::from(&data[..]);
        while let Some((&start, _)) = self.segments.first_key_value() {
            if start > self.next {
                break;
            }
            let Some(seg) = self.segments.remove(&start) else {
                break;
            };
            self.buffered -= seg.len();
            let seg_end = start + seg.len() as u64;
            if seg_end > self.next {
                out.extend_from_slice(&seg[(self.next - start) as usize..]);
                self.next = seg_end;
            }
        }
        Accept::Deliver(out.freeze())
    }

    /// Store an out-of-order segment, keeping held segments disjoint so
    /// `buffered` counts each byte once
    fn hold(&mut self, mut offset: u64, mut data: Bytes) {
        let mut end = offset + data.len() as u64;

        if let Some((&start, prev)) = self.segments.range(..=offset).next_back() {
            let prev_end = start + prev.len() as u64;
            if prev_end >= end {
                return;
            }
            if prev_end > offset {
                data = data.slice((prev_end - offset) as usize..);
                offset = prev_end;
            }
        }

        let later: Vec<u64> = self.segments.range(offset + 1..end).map(|(&s, _)| s).collect();
        for start in later {
            let Some(seg) = self.segments.get(&start) else {
                continue;
            };
            let seg_end = start + seg.len() as u64;
            if seg_end <= end {
                if let Some(seg) = self.segments.remove(&start) {
                    self.buffered -= seg.len();
                }
            } else {
                data.truncate((start - offset) as usize);
                end = start;
                break;
            }
        }

        debug_assert_eq!(offset + data.len() as u64, end);
        self.buffered += data.len();
        self.segments.insert(offset, data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b(s: &'static str) -> Bytes {
        Bytes::from_static(s.as_bytes())
    }

    #[test]
    fn test_in_order_delivery() {
        let mut r = Reassembly::new(1024);
        assert_eq!(r.push(0, b("hello")), Accept::Deliver(b("hello")));
        assert_eq!(r.push(5, b(" world")), Accept::Deliver(b(" world")));
        assert_eq!(r.next(), 11);
    }

    #[test]
    fn test_out_of_order_reassembled() {
        let mut r = Reassembly::new(1024);
        assert_eq!(r.push(6, b("world")), Accept::Buffered);
        assert_eq!(r.push(11, b("!")), Accept::Buffered);
        assert_eq!(r.buffered(), 6);
        assert!(r.has_gap());
        assert_eq!(r.push(0, b("hello ")), Accept::Deliver(b("hello world!")));
        assert_eq!(r.buffered(), 0);
        assert!(!r.has_gap());
        assert_eq!(r.next(), 12);
    }

    #[test]
    fn test_duplicate_and_overlap() {
        let mut r = Reassembly::new(1024);
        r.push(0, b("abcd"));
        assert_eq!(r.push(0, b("ab")), Accept::Duplicate);
        assert_eq!(r.push(2, b("cdef")), Accept::Deliver(b("ef")));
        assert_eq!(r.push(6, Bytes::new()), Accept::Duplicate);
    }

    #[test]
    fn test_overlapping_buffered_segments() {
        let mut r = Reassembly::new(1024);
        assert_eq!(r.push(4, b("ef")), Accept::Buffered);
        assert_eq!(r.push(2, b("cdefgh")), Accept::Buffered);
        assert_eq!(r.push(0, b("ab")), Accept::Deliver(b("abcdefgh")));
        assert_eq!(r.buffered(), 0);
    }

    #[test]
    fn test_overlapping_held_bytes_counted_once() {
        let mut r = Reassembly::new(8);
        assert_eq!(r.push(2, b("cdefgh")), Accept::Buffered);
        assert_eq!(r.push(3, b("defgh")), Accept::Buffered);
        assert_eq!(r.buffered(), 6);
        assert_eq!(r.push(0, b("ab")), Accept::Deliver(b("abcdefgh")));
        assert_eq!(r.buffered(), 0);
    }

    #[test]
    fn test_segment_bridging_two_held_segments() {
        let mut r = Reassembly::new(16);
        assert_eq!(r.push(2, b("cd")), Accept::Buffered);
        assert_eq!(r.push(6, b("ghij")), Accept::Buffered);
        // Overlaps the tail of the first and the head of the second.
        assert_eq!(r.push(3, b("defgh")), Accept::Buffered);
        assert_eq!(r.buffered(), 8);
        assert_eq!(r.push(0, b("ab")), Accept::Deliver(b("abcdefghij")));
        assert_eq!(r.buffered(), 0);
        assert_eq!(r.next(), 10);
    }

    #[test]
    fn test_window_overflow() {
        let mut r = Reassembly::new(8);
        assert_eq!(r.push(0, b("1234")), Accept::Deliver(b("1234")));
        assert_eq!(r.push(6, b("78")), Accept::Buffered);
        assert_eq!(r.push(10, b("abcdef")), Accept::Overflow);
        assert_eq!(r.push(4, b("123456789")), Accept::Overflow);
    }
}
