// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The replay backlog: a fixed-capacity byte ring holding the most
//! recent pty output. While a client is attached it is a rolling copy
//! of recent output (drop-oldest); with no client it fills up and then
//! pauses pty reads entirely, which is the pod's one backpressure
//! mechanism. A new client drains the whole ring, gets a `backlog_end`
//! marker, and the ring starts over.

/// The ANSI erase-scrollback sequence. Seeing it (or a form feed) in
/// the output stream clears the ring so a reattach starts clean.
const ERASE_SCROLLBACK: &[u8] = b"\x1b[3J";

pub struct Backlog {
    buf: Vec<u8>,
    start: usize,
    len: usize,
}

impl Backlog {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "backlog capacity must be positive");
        Backlog { buf: vec![0; capacity], start: 0, len: 0 }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bytes that can still be absorbed without evicting anything.
    /// When this hits zero with no client attached, the pod stops
    /// reading the pty.
    pub fn free(&self) -> usize {
        self.buf.len() - self.len
    }

    pub fn clear(&mut self) {
        self.start = 0;
        self.len = 0;
    }

    /// Append bytes, evicting the oldest as needed (ring semantics,
    /// used while a client is attached).
    pub fn push_rolling(&mut self, mut bytes: &[u8]) {
        self.maybe_clear_for(bytes);
        let cap = self.buf.len();
        if bytes.len() >= cap {
            // only the tail can survive
            bytes = &bytes[bytes.len() - cap..];
            self.clear();
        }
        let overflow = (self.len + bytes.len()).saturating_sub(cap);
        if overflow > 0 {
            self.start = (self.start + overflow) % cap;
            self.len -= overflow;
        }
        let write_at = (self.start + self.len) % cap;
        let end = write_at + bytes.len();
        if end <= cap {
            self.buf[write_at..end].copy_from_slice(bytes);
        } else {
            let first = cap - write_at;
            self.buf[write_at..].copy_from_slice(&bytes[..first]);
            self.buf[..bytes.len() - first].copy_from_slice(&bytes[first..]);
        }
        self.len += bytes.len();
    }

    /// Append bytes without evicting (used with no client attached).
    /// The caller must size its pty reads with `free`, so a chunk that
    /// does not fit is a logic error.
    pub fn push_bounded(&mut self, bytes: &[u8]) {
        self.maybe_clear_for(bytes);
        assert!(bytes.len() <= self.free(), "bounded push larger than free space");
        let cap = self.buf.len();
        let write_at = (self.start + self.len) % cap;
        let end = write_at + bytes.len();
        if end <= cap {
            self.buf[write_at..end].copy_from_slice(bytes);
        } else {
            let first = cap - write_at;
            self.buf[write_at..].copy_from_slice(&bytes[..first]);
            self.buf[..bytes.len() - first].copy_from_slice(&bytes[first..]);
        }
        self.len += bytes.len();
    }

    /// Visit the buffered bytes oldest-first in chunks of at most
    /// `max_chunk`. Does not consume; pair with `clear`.
    pub fn for_chunks<F>(&self, max_chunk: usize, mut f: F)
    where
        F: FnMut(&[u8]),
    {
        let cap = self.buf.len();
        let mut off = 0;
        while off < self.len {
            let at = (self.start + off) % cap;
            let contiguous = (cap - at).min(self.len - off).min(max_chunk);
            f(&self.buf[at..at + contiguous]);
            off += contiguous;
        }
    }

    fn maybe_clear_for(&mut self, incoming: &[u8]) {
        if contains_clear_sequence(incoming) {
            self.clear();
        }
    }
}

/// True if the chunk asks for a clean slate: a form feed or the ANSI
/// erase-scrollback sequence.
fn contains_clear_sequence(bytes: &[u8]) -> bool {
    if bytes.contains(&0x0c) {
        return true;
    }
    bytes.windows(ERASE_SCROLLBACK.len()).any(|w| w == ERASE_SCROLLBACK)
}

#[cfg(test)]
mod test {
    use super::*;

    fn contents(b: &Backlog) -> Vec<u8> {
        let mut out = vec![];
        b.for_chunks(usize::MAX, |chunk| out.extend_from_slice(chunk));
        out
    }

    #[test]
    fn rolling_keeps_most_recent() {
        let mut b = Backlog::new(8);
        b.push_rolling(b"abcd");
        assert_eq!(contents(&b), b"abcd");
        b.push_rolling(b"efgh");
        assert_eq!(contents(&b), b"abcdefgh");
        b.push_rolling(b"XY");
        assert_eq!(contents(&b), b"cdefghXY");
    }

    #[test]
    fn rolling_giant_chunk_keeps_tail() {
        let mut b = Backlog::new(4);
        b.push_rolling(b"0123456789");
        assert_eq!(contents(&b), b"6789");
    }

    #[test]
    fn bounded_fills_to_capacity_exactly() {
        let mut b = Backlog::new(4);
        b.push_bounded(b"abc");
        assert_eq!(b.free(), 1);
        b.push_bounded(b"d");
        // last byte preserved, no eviction
        assert_eq!(contents(&b), b"abcd");
        assert_eq!(b.free(), 0);
    }

    #[test]
    fn wrapped_ring_drains_in_order() {
        let mut b = Backlog::new(6);
        b.push_rolling(b"abcdef");
        b.push_rolling(b"ghi");
        // drain in small chunks across the wrap point
        let mut chunks = vec![];
        b.for_chunks(2, |c| chunks.push(c.to_vec()));
        let flat: Vec<u8> = chunks.iter().flatten().copied().collect();
        assert_eq!(flat, b"defghi");
        for c in chunks {
            assert!(c.len() <= 2);
        }
    }

    #[test]
    fn form_feed_clears() {
        let mut b = Backlog::new(16);
        b.push_rolling(b"old stuff");
        b.push_rolling(b"\x0cnew");
        assert_eq!(contents(&b), b"\x0cnew");
    }

    #[test]
    fn erase_scrollback_clears() {
        let mut b = Backlog::new(32);
        b.push_rolling(b"old stuff");
        b.push_rolling(b"\x1b[3Jfresh");
        assert_eq!(contents(&b), b"\x1b[3Jfresh");
        // a lone CSI that is not the erase sequence does not clear
        b.push_rolling(b"\x1b[2J");
        assert_eq!(contents(&b), b"\x1b[3Jfresh\x1b[2J");
    }

    #[test]
    fn clear_resets_everything() {
        let mut b = Backlog::new(4);
        b.push_rolling(b"abcd");
        b.clear();
        assert!(b.is_empty());
        assert_eq!(b.free(), 4);
        b.push_bounded(b"xy");
        assert_eq!(contents(&b), b"xy");
    }
}
