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

//! A minimal mux client for exercising the daemon: one control stream
//! (C1) and one VT stream (C2), both read through small buffering
//! decoders so partial reads can never desync the framing.

use std::{
    io::{ErrorKind, Read, Write},
    os::unix::net::UnixStream,
    path::Path,
    time,
};

use anyhow::{anyhow, Context};
use hexe_protocol::{
    encode_control, ControlHeader, ControlMessage, CreatePane, ErrorReply, FrameKind, MsgType,
    MuxVtHeader, PaneCreated, Register, Registered, Uuid, CONTROL_HEADER_LEN, MUX_VT_HEADER_LEN,
};

const READ_CHUNK: time::Duration = time::Duration::from_millis(100);

pub struct MuxClient {
    pub session_id: Uuid,
    ctl: UnixStream,
    ctl_buf: Vec<u8>,
    vt: Option<UnixStream>,
    vt_buf: Vec<u8>,
}

impl MuxClient {
    /// Open C1 and register.
    pub fn register<P: AsRef<Path>>(
        sock: P,
        name: &str,
        keepalive: bool,
    ) -> anyhow::Result<MuxClient> {
        let session_id = Uuid::generate()?;
        let mut ctl = UnixStream::connect(&sock).context("dialing ses")?;
        ctl.set_read_timeout(Some(READ_CHUNK)).context("setting read timeout")?;
        ctl.write_all(&[0x01]).context("writing C1 selector")?;
        ctl.write_all(&encode_control(&Register {
            session_id,
            keepalive,
            name: String::from(name),
        }))
        .context("writing register")?;

        let mut client = MuxClient { session_id, ctl, ctl_buf: vec![], vt: None, vt_buf: vec![] };
        let _: Registered = client.expect_ctl(time::Duration::from_secs(5))?;
        Ok(client)
    }

    /// Open C2 and pair it with this client's session.
    pub fn open_vt<P: AsRef<Path>>(&mut self, sock: P) -> anyhow::Result<()> {
        let mut vt = UnixStream::connect(&sock).context("dialing ses for vt")?;
        vt.set_read_timeout(Some(READ_CHUNK)).context("setting vt read timeout")?;
        vt.write_all(&[0x02]).context("writing C2 selector")?;
        vt.write_all(self.session_id.to_hex().as_bytes()).context("writing session hex")?;
        self.vt = Some(vt);
        self.vt_buf.clear();
        Ok(())
    }

    pub fn close_vt(&mut self) {
        self.vt = None;
        self.vt_buf.clear();
    }

    pub fn send_ctl<M: ControlMessage>(&mut self, msg: &M) -> anyhow::Result<()> {
        self.ctl.write_all(&encode_control(msg)).context("writing control message")
    }

    /// Read the next control frame off C1, waiting up to `timeout`.
    pub fn read_ctl(&mut self, timeout: time::Duration) -> anyhow::Result<(u16, Vec<u8>)> {
        let deadline = time::Instant::now() + timeout;
        loop {
            if let Some(frame) = parse_ctl(&mut self.ctl_buf)? {
                return Ok(frame);
            }
            if time::Instant::now() >= deadline {
                return Err(anyhow!("timed out waiting for a control frame"));
            }
            let mut buf = [0u8; 4096];
            match self.ctl.read(&mut buf) {
                Ok(0) => return Err(anyhow!("control stream closed")),
                Ok(n) => self.ctl_buf.extend_from_slice(&buf[..n]),
                Err(e)
                    if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {}
                Err(e) => return Err(e).context("reading control stream"),
            }
        }
    }

    /// Wait for a reply of the given type, consuming (and dropping)
    /// unsolicited async traffic that arrives first. An `error` reply
    /// is surfaced as an Err carrying the reason.
    pub fn expect_ctl<R: ControlMessage>(&mut self, timeout: time::Duration) -> anyhow::Result<R> {
        let deadline = time::Instant::now() + timeout;
        loop {
            let left = deadline.saturating_duration_since(time::Instant::now());
            if left.is_zero() {
                return Err(anyhow!("timed out waiting for {:?}", R::MSG_TYPE));
            }
            let (raw_type, payload) = self.read_ctl(left)?;
            if raw_type == R::MSG_TYPE as u16 {
                return R::decode_payload(&payload);
            }
            if raw_type == MsgType::Error as u16 {
                let err = ErrorReply::decode_payload(&payload)?;
                return Err(anyhow!("{}", err.reason));
            }
            // async chatter (cwd_changed and friends); skip it
        }
    }

    pub fn create_pane(&mut self, shell: &str) -> anyhow::Result<PaneCreated> {
        self.send_ctl(&CreatePane {
            cols: 80,
            rows: 24,
            shell: String::from(shell),
            cwd: String::new(),
        })?;
        self.expect_ctl(time::Duration::from_secs(10))
    }

    pub fn write_input(&mut self, pane_id: u16, bytes: &[u8]) -> anyhow::Result<()> {
        let vt = self.vt.as_mut().ok_or(anyhow!("vt stream not open"))?;
        let header =
            MuxVtHeader { pane_id, kind: FrameKind::Input, len: bytes.len() as u32 };
        let mut frame = header.encode().to_vec();
        frame.extend_from_slice(bytes);
        vt.write_all(&frame).context("writing input frame")
    }

    /// Read the next VT frame off C2.
    pub fn read_vt_frame(
        &mut self,
        timeout: time::Duration,
    ) -> anyhow::Result<(MuxVtHeader, Vec<u8>)> {
        let deadline = time::Instant::now() + timeout;
        loop {
            if let Some(frame) = parse_vt(&mut self.vt_buf)? {
                return Ok(frame);
            }
            if time::Instant::now() >= deadline {
                return Err(anyhow!("timed out waiting for a vt frame"));
            }
            let vt = self.vt.as_mut().ok_or(anyhow!("vt stream not open"))?;
            let mut buf = [0u8; 16 * 1024];
            match vt.read(&mut buf) {
                Ok(0) => return Err(anyhow!("vt stream closed")),
                Ok(n) => self.vt_buf.extend_from_slice(&buf[..n]),
                Err(e)
                    if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {}
                Err(e) => return Err(e).context("reading vt stream"),
            }
        }
    }

    /// Accumulate output payload bytes for one pane until `done` says
    /// enough (other panes' frames and non-output frames are ignored).
    pub fn read_output_until<F>(
        &mut self,
        pane_id: u16,
        timeout: time::Duration,
        mut done: F,
    ) -> anyhow::Result<Vec<u8>>
    where
        F: FnMut(&[u8]) -> bool,
    {
        let deadline = time::Instant::now() + timeout;
        let mut acc = vec![];
        while !done(&acc) {
            let left = deadline.saturating_duration_since(time::Instant::now());
            if left.is_zero() {
                return Err(anyhow!(
                    "timed out with {} bytes accumulated: {:?}",
                    acc.len(),
                    String::from_utf8_lossy(&acc)
                ));
            }
            let (header, payload) = self.read_vt_frame(left)?;
            if header.pane_id == pane_id && header.kind == FrameKind::Output {
                acc.extend_from_slice(&payload);
            }
        }
        Ok(acc)
    }

    /// Collect one pane's full backlog replay: every output payload up
    /// to the backlog_end marker.
    pub fn read_backlog(
        &mut self,
        pane_id: u16,
        timeout: time::Duration,
    ) -> anyhow::Result<Vec<u8>> {
        let deadline = time::Instant::now() + timeout;
        let mut acc = vec![];
        loop {
            let left = deadline.saturating_duration_since(time::Instant::now());
            if left.is_zero() {
                return Err(anyhow!("timed out waiting for backlog_end"));
            }
            let (header, payload) = self.read_vt_frame(left)?;
            if header.pane_id != pane_id {
                continue;
            }
            match header.kind {
                FrameKind::Output => acc.extend_from_slice(&payload),
                FrameKind::BacklogEnd => {
                    if header.len != 0 {
                        return Err(anyhow!("backlog_end with nonzero len"));
                    }
                    return Ok(acc);
                }
                _ => {}
            }
        }
    }
}

fn parse_ctl(buf: &mut Vec<u8>) -> anyhow::Result<Option<(u16, Vec<u8>)>> {
    if buf.len() < CONTROL_HEADER_LEN {
        return Ok(None);
    }
    let mut header_bytes = [0u8; CONTROL_HEADER_LEN];
    header_bytes.copy_from_slice(&buf[..CONTROL_HEADER_LEN]);
    let header = ControlHeader::decode(&header_bytes)?;
    let total = CONTROL_HEADER_LEN + header.payload_len as usize;
    if buf.len() < total {
        return Ok(None);
    }
    let payload = buf[CONTROL_HEADER_LEN..total].to_vec();
    buf.drain(..total);
    Ok(Some((header.msg_type, payload)))
}

fn parse_vt(buf: &mut Vec<u8>) -> anyhow::Result<Option<(MuxVtHeader, Vec<u8>)>> {
    if buf.len() < MUX_VT_HEADER_LEN {
        return Ok(None);
    }
    let mut header_bytes = [0u8; MUX_VT_HEADER_LEN];
    header_bytes.copy_from_slice(&buf[..MUX_VT_HEADER_LEN]);
    let header = MuxVtHeader::decode(&header_bytes)?;
    let total = MUX_VT_HEADER_LEN + header.len as usize;
    if buf.len() < total {
        return Ok(None);
    }
    let payload = buf[MUX_VT_HEADER_LEN..total].to_vec();
    buf.drain(..total);
    Ok(Some((header, payload)))
}
