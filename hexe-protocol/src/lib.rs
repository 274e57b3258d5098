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

//! The wire protocol spoken between the hexe processes.
//!
//! Five logical channels ride on the unix sockets:
//!
//! - C1: mux -> ses control (framed control messages, `0x01xx` types)
//! - C2: mux <-> ses VT bytes (7 byte pane-tagged frame headers)
//! - C3: ses <-> pod VT bytes (5 byte frame headers, the fd names the pane)
//! - C4: pod -> ses control (`0x04xx` types)
//! - C5: shp -> pod control (`0x05xx` types)
//!
//! Every control message is a 6 byte header (`msg_type: u16`,
//! `payload_len: u32`) followed by a packed payload: a fixed portion
//! whose named length fields describe the variable-length trailers that
//! follow it. All wire integers are little endian, including the VT
//! frame headers and the cols/rows sub-fields of resize payloads.

use std::{fmt, fs, io::Read};

use anyhow::{anyhow, Context};
use byteorder::{ByteOrder, LittleEndian};

mod messages;

pub use messages::*;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// The largest payload any peer will accept, checked before any
/// allocation is sized from a wire length.
pub const PAYLOAD_CAP: u32 = 4 * 1024 * 1024;

pub const CONTROL_HEADER_LEN: usize = 6;
pub const MUX_VT_HEADER_LEN: usize = 7;
pub const POD_VT_HEADER_LEN: usize = 5;

/// The first byte of every connection selects a channel.
pub mod handshake {
    // accepted by the ses socket
    pub const SES_MUX_CONTROL: u8 = 0x01;
    pub const SES_MUX_VT: u8 = 0x02;
    pub const SES_POD_CONTROL: u8 = 0x03;
    pub const SES_CLI: u8 = 0x04;

    // accepted by a pod socket
    pub const POD_VT: u8 = 0x01;
    pub const POD_SHP: u8 = 0x02;
    pub const POD_INJECT: u8 = 0x03;
}

/// A 16 byte identifier used for both pane uuids and session ids.
///
/// On the wire an id appears either as 16 raw bytes or as 32 lowercase
/// hex chars depending on the channel; both are just encodings of this
/// one type and get normalized at the decode boundary.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Uuid(pub [u8; 16]);

impl Uuid {
    pub fn generate() -> anyhow::Result<Self> {
        let mut bytes = [0u8; 16];
        fs::File::open("/dev/urandom")
            .context("opening /dev/urandom")?
            .read_exact(&mut bytes)
            .context("reading random id bytes")?;
        Ok(Uuid(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn from_bytes(bytes: &[u8]) -> anyhow::Result<Self> {
        let mut id = [0u8; 16];
        if bytes.len() != 16 {
            return Err(anyhow!("raw id must be 16 bytes, got {}", bytes.len()));
        }
        id.copy_from_slice(bytes);
        Ok(Uuid(id))
    }

    pub fn to_hex(&self) -> String {
        let mut s = String::with_capacity(32);
        for b in self.0.iter() {
            s.push(char::from_digit((*b >> 4) as u32, 16).unwrap_or('0'));
            s.push(char::from_digit((*b & 0xf) as u32, 16).unwrap_or('0'));
        }
        s
    }

    pub fn from_hex(s: &str) -> anyhow::Result<Self> {
        if s.len() != 32 {
            return Err(anyhow!("hex id must be 32 chars, got {}", s.len()));
        }
        let mut id = [0u8; 16];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let hi = hex_nibble(chunk[0])?;
            let lo = hex_nibble(chunk[1])?;
            id[i] = (hi << 4) | lo;
        }
        Ok(Uuid(id))
    }
}

fn hex_nibble(c: u8) -> anyhow::Result<u8> {
    match c {
        b'0'..=b'9' => Ok(c - b'0'),
        b'a'..=b'f' => Ok(c - b'a' + 10),
        _ => Err(anyhow!("invalid hex char '{}'", c as char)),
    }
}

impl fmt::Display for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Uuid({})", self.to_hex())
    }
}

/// The compact routing key for a pane on C2. Assigned by ses,
/// meaningless to anyone but the mux/ses pair that agreed on it.
pub type PaneId = u16;

/// VT frame kinds, shared by the C2 and C3 headers.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FrameKind {
    /// Shell output bytes, pod -> ses -> mux.
    Output = 0x01,
    /// Keystroke bytes, mux -> ses -> pod.
    Input = 0x02,
    /// A 4 byte `[cols: u16][rows: u16]` payload.
    Resize = 0x03,
    /// A zero length frame marking the end of a backlog replay.
    BacklogEnd = 0x04,
}

impl TryFrom<u8> for FrameKind {
    type Error = anyhow::Error;

    fn try_from(v: u8) -> anyhow::Result<Self> {
        match v {
            0x01 => Ok(FrameKind::Output),
            0x02 => Ok(FrameKind::Input),
            0x03 => Ok(FrameKind::Resize),
            0x04 => Ok(FrameKind::BacklogEnd),
            _ => Err(anyhow!("unknown FrameKind {}", v)),
        }
    }
}

/// The 7 byte C2 frame header. The pane id routes the frame since many
/// panes are multiplexed over the one mux<->ses VT socket.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MuxVtHeader {
    pub pane_id: PaneId,
    pub kind: FrameKind,
    pub len: u32,
}

impl MuxVtHeader {
    pub fn encode(&self) -> [u8; MUX_VT_HEADER_LEN] {
        let mut buf = [0u8; MUX_VT_HEADER_LEN];
        LittleEndian::write_u16(&mut buf[0..2], self.pane_id);
        buf[2] = self.kind as u8;
        LittleEndian::write_u32(&mut buf[3..7], self.len);
        buf
    }

    pub fn decode(buf: &[u8; MUX_VT_HEADER_LEN]) -> anyhow::Result<Self> {
        let len = LittleEndian::read_u32(&buf[3..7]);
        if len > PAYLOAD_CAP {
            return Err(anyhow!("frame of {} bytes exceeds payload cap", len));
        }
        Ok(MuxVtHeader {
            pane_id: LittleEndian::read_u16(&buf[0..2]),
            kind: FrameKind::try_from(buf[2])?,
            len,
        })
    }
}

/// The 5 byte C3 frame header. No pane tag since each pod has its own
/// socket.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PodVtHeader {
    pub kind: FrameKind,
    pub len: u32,
}

impl PodVtHeader {
    pub fn encode(&self) -> [u8; POD_VT_HEADER_LEN] {
        let mut buf = [0u8; POD_VT_HEADER_LEN];
        buf[0] = self.kind as u8;
        LittleEndian::write_u32(&mut buf[1..5], self.len);
        buf
    }

    pub fn decode(buf: &[u8; POD_VT_HEADER_LEN]) -> anyhow::Result<Self> {
        let len = LittleEndian::read_u32(&buf[1..5]);
        if len > PAYLOAD_CAP {
            return Err(anyhow!("frame of {} bytes exceeds payload cap", len));
        }
        Ok(PodVtHeader { kind: FrameKind::try_from(buf[0])?, len })
    }
}

/// Encode the 4 byte resize payload.
pub fn encode_resize(cols: u16, rows: u16) -> [u8; 4] {
    let mut buf = [0u8; 4];
    LittleEndian::write_u16(&mut buf[0..2], cols);
    LittleEndian::write_u16(&mut buf[2..4], rows);
    buf
}

/// Decode the 4 byte resize payload into (cols, rows).
pub fn decode_resize(buf: &[u8]) -> anyhow::Result<(u16, u16)> {
    if buf.len() != 4 {
        return Err(anyhow!("resize payload must be 4 bytes, got {}", buf.len()));
    }
    Ok((LittleEndian::read_u16(&buf[0..2]), LittleEndian::read_u16(&buf[2..4])))
}

/// The 6 byte header in front of every control message.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ControlHeader {
    pub msg_type: u16,
    pub payload_len: u32,
}

impl ControlHeader {
    pub fn encode(&self) -> [u8; CONTROL_HEADER_LEN] {
        let mut buf = [0u8; CONTROL_HEADER_LEN];
        LittleEndian::write_u16(&mut buf[0..2], self.msg_type);
        LittleEndian::write_u32(&mut buf[2..6], self.payload_len);
        buf
    }

    pub fn decode(buf: &[u8; CONTROL_HEADER_LEN]) -> anyhow::Result<Self> {
        let payload_len = LittleEndian::read_u32(&buf[2..6]);
        if payload_len > PAYLOAD_CAP {
            return Err(anyhow!("payload of {} bytes exceeds payload cap", payload_len));
        }
        Ok(ControlHeader { msg_type: LittleEndian::read_u16(&buf[0..2]), payload_len })
    }
}

/// A cursor over a control payload.
///
/// Decoders read the fixed portion field by field, then pull each
/// trailer with `take` using the lengths named in the fixed portion.
/// Every read is bounds checked so a lying length field fails closed
/// instead of slicing out of range.
pub struct TrailCursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> TrailCursor<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        TrailCursor { buf, pos: 0 }
    }

    pub fn take(&mut self, n: usize) -> anyhow::Result<&'a [u8]> {
        if self.buf.len() - self.pos < n {
            return Err(anyhow!(
                "payload truncated: wanted {} bytes, {} remain",
                n,
                self.buf.len() - self.pos
            ));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn take_u8(&mut self) -> anyhow::Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn take_u16(&mut self) -> anyhow::Result<u16> {
        Ok(LittleEndian::read_u16(self.take(2)?))
    }

    pub fn take_u32(&mut self) -> anyhow::Result<u32> {
        Ok(LittleEndian::read_u32(self.take(4)?))
    }

    pub fn take_u64(&mut self) -> anyhow::Result<u64> {
        Ok(LittleEndian::read_u64(self.take(8)?))
    }

    pub fn take_i32(&mut self) -> anyhow::Result<i32> {
        Ok(LittleEndian::read_i32(self.take(4)?))
    }

    pub fn take_i64(&mut self) -> anyhow::Result<i64> {
        Ok(LittleEndian::read_i64(self.take(8)?))
    }

    /// A 16 byte raw id.
    pub fn take_uuid(&mut self) -> anyhow::Result<Uuid> {
        Uuid::from_bytes(self.take(16)?)
    }

    /// A 32 char lowercase hex id.
    pub fn take_hex_uuid(&mut self) -> anyhow::Result<Uuid> {
        let hex = std::str::from_utf8(self.take(32)?).context("hex id is not utf8")?;
        Uuid::from_hex(hex)
    }

    pub fn take_string(&mut self, len: usize) -> anyhow::Result<String> {
        let bytes = self.take(len)?;
        Ok(String::from_utf8(bytes.to_vec()).context("string trailer is not utf8")?)
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn expect_end(&self) -> anyhow::Result<()> {
        if self.pos != self.buf.len() {
            return Err(anyhow!("{} unexpected trailing payload bytes", self.buf.len() - self.pos));
        }
        Ok(())
    }
}

// little endian append helpers used by the message encoders
pub(crate) fn put_u16(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_le_bytes());
}

pub(crate) fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

pub(crate) fn put_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

pub(crate) fn put_i32(buf: &mut Vec<u8>, v: i32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

pub(crate) fn put_i64(buf: &mut Vec<u8>, v: i64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

/// Implemented by every control message struct. Protocol structs are
/// bare data, the encode/decode logic lives in these methods.
pub trait ControlMessage: Sized {
    const MSG_TYPE: MsgType;

    /// Append the packed payload (fixed portion then trailers) to buf.
    fn encode_payload(&self, buf: &mut Vec<u8>);

    /// Decode a full payload. Rejects truncated and oversized trailers.
    fn decode_payload(payload: &[u8]) -> anyhow::Result<Self>;
}

/// Encode a complete framed control message, header included.
pub fn encode_control<M: ControlMessage>(msg: &M) -> Vec<u8> {
    let mut payload = Vec::new();
    msg.encode_payload(&mut payload);
    let header =
        ControlHeader { msg_type: M::MSG_TYPE as u16, payload_len: payload.len() as u32 };
    let mut frame = Vec::with_capacity(CONTROL_HEADER_LEN + payload.len());
    frame.extend_from_slice(&header.encode());
    frame.extend_from_slice(&payload);
    frame
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn uuid_hex_round_trip() {
        let id = Uuid([0x00, 0x01, 0x7f, 0x80, 0xff, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15]);
        let hex = id.to_hex();
        assert_eq!(hex.len(), 32);
        assert_eq!(hex, hex.to_lowercase());
        assert_eq!(Uuid::from_hex(&hex).expect("parse to succeed"), id);
    }

    #[test]
    fn uuid_hex_rejects_garbage() {
        assert!(Uuid::from_hex("abc").is_err());
        assert!(Uuid::from_hex(&"g".repeat(32)).is_err());
        assert!(Uuid::from_hex(&"A".repeat(32)).is_err());
    }

    #[test]
    fn vt_header_round_trip() {
        let cases = vec![
            MuxVtHeader { pane_id: 1, kind: FrameKind::Output, len: 17 },
            MuxVtHeader { pane_id: u16::MAX, kind: FrameKind::Input, len: 0 },
            MuxVtHeader { pane_id: 0, kind: FrameKind::BacklogEnd, len: 0 },
        ];
        for h in cases {
            let bytes = h.encode();
            assert_eq!(MuxVtHeader::decode(&bytes).expect("decode to succeed"), h);
        }

        let pod = PodVtHeader { kind: FrameKind::Resize, len: 4 };
        assert_eq!(PodVtHeader::decode(&pod.encode()).expect("decode to succeed"), pod);
    }

    #[test]
    fn header_len_cap() {
        let ok = ControlHeader { msg_type: 0x0100, payload_len: PAYLOAD_CAP };
        assert_eq!(ControlHeader::decode(&ok.encode()).expect("cap to be accepted"), ok);

        let over = ControlHeader { msg_type: 0x0100, payload_len: PAYLOAD_CAP + 1 };
        assert!(ControlHeader::decode(&over.encode()).is_err());

        let over_vt = MuxVtHeader { pane_id: 3, kind: FrameKind::Output, len: PAYLOAD_CAP + 1 };
        assert!(MuxVtHeader::decode(&over_vt.encode()).is_err());
    }

    #[test]
    fn resize_payload() {
        let buf = encode_resize(211, 57);
        assert_eq!(decode_resize(&buf).expect("decode to succeed"), (211, 57));
        assert!(decode_resize(&buf[..3]).is_err());
    }

    #[test]
    fn cursor_fails_closed() {
        let payload = [1u8, 2, 3, 4];
        let mut cur = TrailCursor::new(&payload);
        assert_eq!(cur.take_u16().expect("in bounds"), 0x0201);
        assert!(cur.take(3).is_err());
        // a failed take consumes nothing
        assert_eq!(cur.remaining(), 2);
        assert_eq!(cur.take_u16().expect("in bounds"), 0x0403);
        cur.expect_end().expect("all bytes consumed");
    }
}
