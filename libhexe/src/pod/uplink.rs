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

//! The C4 uplink: the pod's metadata push channel back to ses. Dialed
//! lazily, re-dialed lazily after any failure, and never allowed to
//! wedge the pod loop.

use std::{
    io::{Read, Write},
    os::unix::{io::AsRawFd, net::UnixStream},
    path::PathBuf,
};

use anyhow::Context;
use hexe_protocol::{encode_control, handshake, ControlMessage, PodRegister, Uuid};
use tracing::{info, warn};

use crate::{consts, framing::CtlDecoder};

pub struct Uplink {
    ses_socket: PathBuf,
    uuid: Uuid,
    /// Re-sent as the first message every time the link is dialed so a
    /// restarted ses can rebuild its pane record.
    register: PodRegister,
    stream: Option<UnixStream>,
    decoder: CtlDecoder,
}

impl Uplink {
    pub fn new(ses_socket: PathBuf, uuid: Uuid, register: PodRegister) -> Self {
        Uplink { ses_socket, uuid, register, stream: None, decoder: CtlDecoder::new() }
    }

    pub fn raw_fd(&self) -> Option<i32> {
        self.stream.as_ref().map(|s| s.as_raw_fd())
    }

    fn dial(&mut self) -> anyhow::Result<UnixStream> {
        let mut stream =
            UnixStream::connect(&self.ses_socket).context("dialing ses for uplink")?;
        stream
            .set_write_timeout(Some(consts::SOCK_STREAM_TIMEOUT))
            .context("setting uplink write timeout")?;
        let mut hello = Vec::with_capacity(17);
        hello.push(handshake::SES_POD_CONTROL);
        hello.extend_from_slice(self.uuid.as_bytes());
        stream.write_all(&hello).context("writing uplink handshake")?;
        stream.write_all(&encode_control(&self.register)).context("registering pod")?;
        info!("uplink established");
        Ok(stream)
    }

    fn ensure(&mut self) -> Option<&mut UnixStream> {
        if self.stream.is_none() {
            match self.dial() {
                Ok(s) => {
                    self.stream = Some(s);
                    self.decoder = CtlDecoder::new();
                }
                Err(e) => {
                    // ses may simply not be running right now; we will
                    // try again on the next push
                    info!("uplink unavailable: {:?}", e);
                    return None;
                }
            }
        }
        self.stream.as_mut()
    }

    /// Best-effort push. A failed write tears the link down so the
    /// next push re-dials.
    pub fn send<M: ControlMessage>(&mut self, msg: &M) {
        let frame = encode_control(msg);
        if let Some(stream) = self.ensure() {
            if let Err(e) = stream.write_all(&frame) {
                warn!("uplink write failed, will re-dial: {:?}", e);
                self.stream = None;
            }
        }
    }

    /// Drain whatever control traffic ses has written toward us
    /// (currently just `query_state`). Call after poll flags the
    /// uplink fd readable.
    pub fn read_ready(&mut self) -> Vec<(u16, Vec<u8>)> {
        let mut msgs = vec![];
        let mut buf = [0u8; consts::BUF_SIZE];
        let Some(stream) = self.stream.as_mut() else {
            return msgs;
        };
        match stream.read(&mut buf) {
            Ok(0) => {
                info!("uplink hup");
                self.stream = None;
            }
            Ok(n) => {
                self.decoder.extend(&buf[..n]);
                loop {
                    match self.decoder.next() {
                        Ok(Some(msg)) => msgs.push(msg),
                        Ok(None) => break,
                        Err(e) => {
                            warn!("malformed uplink traffic, re-dialing: {:?}", e);
                            self.stream = None;
                            break;
                        }
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => {
                warn!("uplink read failed, will re-dial: {:?}", e);
                self.stream = None;
            }
        }
        msgs
    }
}
