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

use std::{
    io::{Read, Write},
    os::unix::net::UnixStream,
    process::Command,
    time,
};

use anyhow::Context;
use hexe_protocol::{
    encode_control, ControlHeader, MsgType, Notify, Ping, CONTROL_HEADER_LEN,
};
use ntest::timeout;

mod support;

use support::{daemon, hexe_bin, mux::MuxClient};

#[test]
#[timeout(30000)]
fn ping_pong_over_cli_channel() -> anyhow::Result<()> {
    let daemon = daemon::Proc::new()?;

    let mut stream =
        UnixStream::connect(&daemon.socket_path).context("dialing daemon")?;
    stream.set_read_timeout(Some(time::Duration::from_secs(5)))?;
    stream.write_all(&[0x04]).context("writing cli selector")?;
    stream.write_all(&encode_control(&Ping {})).context("writing ping")?;

    let mut header_bytes = [0u8; CONTROL_HEADER_LEN];
    stream.read_exact(&mut header_bytes).context("reading pong header")?;
    let header = ControlHeader::decode(&header_bytes)?;
    assert_eq!(header.msg_type, MsgType::Pong as u16);
    assert_eq!(header.payload_len, 0);

    Ok(())
}

#[test]
#[timeout(30000)]
fn unknown_handshake_byte_is_closed() -> anyhow::Result<()> {
    let daemon = daemon::Proc::new()?;

    let mut stream = UnixStream::connect(&daemon.socket_path)?;
    stream.set_read_timeout(Some(time::Duration::from_secs(5)))?;
    stream.write_all(&[0x7f])?;

    // no response, just a close
    let mut buf = [0u8; 1];
    let n = stream.read(&mut buf).context("reading from rejected conn")?;
    assert_eq!(n, 0, "daemon must close without responding");

    Ok(())
}

#[test]
#[timeout(30000)]
fn status_cli_reports_sessions() -> anyhow::Result<()> {
    let daemon = daemon::Proc::new()?;
    let _mux = MuxClient::register(&daemon.socket_path, "statuser", false)?;

    let out = Command::new(hexe_bin())
        .arg("--socket")
        .arg(&daemon.socket_path)
        .arg("status")
        .arg("--full")
        .output()
        .context("running hexe status")?;
    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));

    let doc: serde_json::Value =
        serde_json::from_slice(&out.stdout).context("parsing status output")?;
    let sessions = doc["sessions"].as_array().context("sessions array")?;
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0]["name"], "statuser");
    assert_eq!(sessions[0]["attached"], true);

    Ok(())
}

#[test]
#[timeout(30000)]
fn notify_cli_reaches_the_mux() -> anyhow::Result<()> {
    let daemon = daemon::Proc::new()?;
    let mut mux = MuxClient::register(&daemon.socket_path, "notified", false)?;

    let out = Command::new(hexe_bin())
        .arg("--socket")
        .arg(&daemon.socket_path)
        .arg("notify")
        .arg("hello from the cli")
        .output()
        .context("running hexe notify")?;
    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));

    let notify: Notify = mux.expect_ctl(time::Duration::from_secs(5))?;
    assert_eq!(notify.text, "hello from the cli");

    Ok(())
}

#[test]
#[timeout(30000)]
fn exit_intent_without_mux_allows() -> anyhow::Result<()> {
    let daemon = daemon::Proc::new()?;

    let out = Command::new(hexe_bin())
        .arg("--socket")
        .arg(&daemon.socket_path)
        .arg("exit-intent")
        .output()
        .context("running hexe exit-intent")?;
    assert!(
        out.status.success(),
        "with no mux attached the daemon answers allow itself; stderr: {}",
        String::from_utf8_lossy(&out.stderr)
    );

    Ok(())
}
