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

//! The shp hook: a short-lived process shells run from their
//! precmd/preexec hooks to publish per-command metadata to the pane's
//! pod. Locates its pod through `HEXE_POD_SOCKET`.

use std::{env, io::Write, os::unix::net::UnixStream, time};

use anyhow::{anyhow, Context};
use hexe_protocol::{handshake, ShellEventBody, ShellPhase, ShpPromptReq, ShpShellEvent};

use crate::{consts, protocol};

pub struct EventArgs {
    pub phase: String,
    pub status: i32,
    pub duration_ms: u64,
    pub started_at: i64,
    pub jobs: u16,
    pub running: bool,
    pub cmd: String,
}

fn dial_pod() -> anyhow::Result<UnixStream> {
    let sock = env::var(consts::ENV_POD_SOCKET)
        .context("HEXE_POD_SOCKET not set (not inside a hexe pane?)")?;
    let stream = UnixStream::connect(&sock).context("dialing pod socket")?;
    stream
        .set_write_timeout(Some(consts::SOCK_STREAM_TIMEOUT))
        .context("setting write timeout")?;
    stream
        .set_read_timeout(Some(time::Duration::from_secs(2)))
        .context("setting read timeout")?;
    Ok(stream)
}

/// `hexe hook event ...`: fire one shell_event at the pod and get out
/// of the prompt's way.
pub fn run_event(args: EventArgs) -> anyhow::Result<()> {
    let phase = match args.phase.as_str() {
        "precmd" => ShellPhase::Precmd,
        "preexec" => ShellPhase::Preexec,
        other => return Err(anyhow!("unknown hook phase '{other}'")),
    };
    let cwd = env::current_dir()
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mut stream = dial_pod()?;
    stream.write_all(&[handshake::POD_SHP]).context("writing channel selector")?;
    protocol::write_control(
        &mut stream,
        &ShpShellEvent {
            event: ShellEventBody {
                phase,
                status: args.status,
                duration_ms: args.duration_ms,
                started_at: args.started_at,
                jobs: args.jobs,
                running: args.running,
                cmd: args.cmd,
                cwd,
            },
        },
    )?;
    Ok(())
}

/// `hexe hook prompt`: ask the pod for its prompt decoration string.
pub fn run_prompt() -> anyhow::Result<()> {
    let mut stream = dial_pod()?;
    stream.write_all(&[handshake::POD_SHP]).context("writing channel selector")?;
    protocol::write_control(&mut stream, &ShpPromptReq {})?;
    let (_, payload) = protocol::read_control(&mut stream)?;
    let resp = <hexe_protocol::ShpPromptResp as hexe_protocol::ControlMessage>::decode_payload(
        &payload,
    )?;
    println!("{}", resp.text);
    Ok(())
}
