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

//! Incremental frame decoders for the non-blocking event loops. Bytes
//! get appended as they arrive off the socket; complete frames pop out
//! once the whole payload is present. Frames are always surfaced whole
//! so the routers can re-frame them onto another socket without ever
//! interleaving two half-written frames.

use anyhow::Context;
use hexe_protocol::{
    ControlHeader, MuxVtHeader, PodVtHeader, CONTROL_HEADER_LEN, MUX_VT_HEADER_LEN,
    POD_VT_HEADER_LEN,
};

/// Decodes 5-byte-header VT frames (C3, the ses<->pod direction).
#[derive(Default)]
pub struct PodVtDecoder {
    buf: Vec<u8>,
}

impl PodVtDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pop the next complete frame, or None if more bytes are needed.
    /// An oversized or malformed header is an error and the connection
    /// it came from should be considered poisoned.
    pub fn next(&mut self) -> anyhow::Result<Option<(PodVtHeader, Vec<u8>)>> {
        if self.buf.len() < POD_VT_HEADER_LEN {
            return Ok(None);
        }
        let mut header_bytes = [0u8; POD_VT_HEADER_LEN];
        header_bytes.copy_from_slice(&self.buf[..POD_VT_HEADER_LEN]);
        let header = PodVtHeader::decode(&header_bytes).context("decoding pod vt header")?;
        let total = POD_VT_HEADER_LEN + header.len as usize;
        if self.buf.len() < total {
            return Ok(None);
        }
        let payload = self.buf[POD_VT_HEADER_LEN..total].to_vec();
        self.buf.drain(..total);
        Ok(Some((header, payload)))
    }
}

/// Decodes 7-byte-header VT frames (C2, the mux<->ses direction).
#[derive(Default)]
pub struct MuxVtDecoder {
    buf: Vec<u8>,
}

impl MuxVtDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn next(&mut self) -> anyhow::Result<Option<(MuxVtHeader, Vec<u8>)>> {
        if self.buf.len() < MUX_VT_HEADER_LEN {
            return Ok(None);
        }
        let mut header_bytes = [0u8; MUX_VT_HEADER_LEN];
        header_bytes.copy_from_slice(&self.buf[..MUX_VT_HEADER_LEN]);
        let header = MuxVtHeader::decode(&header_bytes).context("decoding mux vt header")?;
        let total = MUX_VT_HEADER_LEN + header.len as usize;
        if self.buf.len() < total {
            return Ok(None);
        }
        let payload = self.buf[MUX_VT_HEADER_LEN..total].to_vec();
        self.buf.drain(..total);
        Ok(Some((header, payload)))
    }
}

/// Decodes framed control messages. The message type is surfaced raw
/// so the dispatcher can answer unknown types with an `error` reply
/// instead of poisoning the connection.
#[derive(Default)]
pub struct CtlDecoder {
    buf: Vec<u8>,
}

impl CtlDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn next(&mut self) -> anyhow::Result<Option<(u16, Vec<u8>)>> {
        if self.buf.len() < CONTROL_HEADER_LEN {
            return Ok(None);
        }
        let mut header_bytes = [0u8; CONTROL_HEADER_LEN];
        header_bytes.copy_from_slice(&self.buf[..CONTROL_HEADER_LEN]);
        let header = ControlHeader::decode(&header_bytes).context("decoding control header")?;
        let total = CONTROL_HEADER_LEN + header.payload_len as usize;
        if self.buf.len() < total {
            return Ok(None);
        }
        let payload = self.buf[CONTROL_HEADER_LEN..total].to_vec();
        self.buf.drain(..total);
        Ok(Some((header.msg_type, payload)))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use hexe_protocol::{FrameKind, PAYLOAD_CAP};

    #[test]
    fn pod_frames_arrive_in_pieces() {
        let header = PodVtHeader { kind: FrameKind::Output, len: 6 };
        let mut wire = header.encode().to_vec();
        wire.extend_from_slice(b"abcdef");

        let mut dec = PodVtDecoder::new();
        for byte in &wire[..wire.len() - 1] {
            dec.extend(&[*byte]);
            assert!(dec.next().expect("no decode error").is_none());
        }
        dec.extend(&wire[wire.len() - 1..]);
        let (got_header, payload) = dec.next().expect("no decode error").expect("a frame");
        assert_eq!(got_header, header);
        assert_eq!(payload, b"abcdef");
        assert!(dec.next().expect("no decode error").is_none());
    }

    #[test]
    fn mux_frames_back_to_back() {
        let h1 = MuxVtHeader { pane_id: 1, kind: FrameKind::Input, len: 2 };
        let h2 = MuxVtHeader { pane_id: 2, kind: FrameKind::BacklogEnd, len: 0 };
        let mut wire = h1.encode().to_vec();
        wire.extend_from_slice(b"hi");
        wire.extend_from_slice(&h2.encode());

        let mut dec = MuxVtDecoder::new();
        dec.extend(&wire);
        let (got1, p1) = dec.next().expect("no decode error").expect("frame 1");
        assert_eq!((got1, p1.as_slice()), (h1, &b"hi"[..]));
        let (got2, p2) = dec.next().expect("no decode error").expect("frame 2");
        assert_eq!((got2, p2.len()), (h2, 0));
        assert!(dec.next().expect("no decode error").is_none());
    }

    #[test]
    fn oversized_frame_poisons() {
        let mut wire = vec![FrameKind::Output as u8];
        wire.extend_from_slice(&(PAYLOAD_CAP + 1).to_le_bytes());
        let mut dec = PodVtDecoder::new();
        dec.extend(&wire);
        assert!(dec.next().is_err());
    }

    #[test]
    fn ctl_surfaces_unknown_types() {
        let header = ControlHeader { msg_type: 0xBEEF, payload_len: 3 };
        let mut wire = header.encode().to_vec();
        wire.extend_from_slice(&[1, 2, 3]);
        let mut dec = CtlDecoder::new();
        dec.extend(&wire);
        let (msg_type, payload) = dec.next().expect("no decode error").expect("a frame");
        assert_eq!(msg_type, 0xBEEF);
        assert_eq!(payload, vec![1, 2, 3]);
    }
}
