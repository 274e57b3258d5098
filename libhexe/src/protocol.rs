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

//! Blocking client-side helpers for the control protocol. The ses
//! event loop has its own non-blocking codec; everything else (cli
//! one-shots, the shp hook, the pod uplink) talks through these.

use std::{
    io::{Read, Write},
    os::unix::net::UnixStream,
    path::Path,
};

use anyhow::{anyhow, Context};
use hexe_protocol::{
    encode_control, handshake, ControlHeader, ControlMessage, ErrorReply, MsgType,
    CONTROL_HEADER_LEN,
};
use tracing::debug;

/// Write one complete framed control message with a single write call
/// so frames never interleave on a shared stream.
pub fn write_control<M, W>(w: &mut W, msg: &M) -> anyhow::Result<()>
where
    M: ControlMessage,
    W: Write,
{
    w.write_all(&encode_control(msg)).context("writing control frame")?;
    Ok(())
}

/// Read the next control frame: header, type tag, raw payload.
pub fn read_control<R>(r: &mut R) -> anyhow::Result<(MsgType, Vec<u8>)>
where
    R: Read,
{
    let mut header_bytes = [0u8; CONTROL_HEADER_LEN];
    r.read_exact(&mut header_bytes).context("reading control header")?;
    let header = ControlHeader::decode(&header_bytes)?;
    let msg_type = MsgType::try_from(header.msg_type)?;
    let mut payload = vec![0u8; header.payload_len as usize];
    r.read_exact(&mut payload).context("reading control payload")?;
    Ok((msg_type, payload))
}

/// A one-shot cli connection to the ses daemon.
pub struct CliClient {
    stream: UnixStream,
}

impl CliClient {
    pub fn connect<P: AsRef<Path>>(sock: P) -> anyhow::Result<Self> {
        let mut stream = UnixStream::connect(&sock)
            .with_context(|| format!("connecting to ses at {:?} (is the daemon running?)",
                sock.as_ref()))?;
        stream.write_all(&[handshake::SES_CLI]).context("writing channel selector")?;
        Ok(CliClient { stream })
    }

    pub fn send<M: ControlMessage>(&mut self, msg: &M) -> anyhow::Result<()> {
        write_control(&mut self.stream, msg)
    }

    /// Read the next reply, expecting it to be an `R`. A semantic
    /// `error` reply is surfaced as an Err carrying the reason code.
    pub fn expect_reply<R>(&mut self) -> anyhow::Result<R>
    where
        R: ControlMessage,
    {
        let (msg_type, payload) = read_control(&mut self.stream)?;
        debug!("cli reply type={:?} len={}", msg_type, payload.len());
        if msg_type == R::MSG_TYPE {
            return R::decode_payload(&payload);
        }
        if msg_type == MsgType::Error {
            let err = ErrorReply::decode_payload(&payload)?;
            return Err(anyhow!("{}", err.reason));
        }
        Err(anyhow!("unexpected reply type {:?}", msg_type))
    }
}
