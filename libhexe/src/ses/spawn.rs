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

//! Forking pods. Ses re-execs its own binary with the hidden `pod`
//! subcommand and waits (bounded) for the pod's ready line before
//! dialing the pod socket.

use std::{
    env, io,
    os::unix::io::AsRawFd,
    path::{Path, PathBuf},
    process, time,
};

use anyhow::{anyhow, Context};
use hexe_protocol::Uuid;
use nix::poll::PollFlags;
use tracing::{info, instrument, warn};

use crate::{consts, net, paths};

pub struct PodSpec<'a> {
    pub uuid: Uuid,
    pub shell: Option<&'a str>,
    pub cwd: Option<&'a str>,
    pub name: Option<&'a str>,
    pub cols: u16,
    pub rows: u16,
}

pub struct PodHandle {
    pub pid: i32,
    pub socket_path: PathBuf,
}

#[instrument(skip_all, fields(uuid = %spec.uuid))]
pub fn spawn_pod(ses_socket: &Path, spec: &PodSpec) -> anyhow::Result<PodHandle> {
    let socket_path = paths::pod_socket(&spec.uuid)?;
    let exe = env::current_exe().context("resolving own binary")?;

    let mut cmd = process::Command::new(exe);
    cmd.arg("pod")
        .arg("--uuid")
        .arg(spec.uuid.to_hex())
        .arg("--socket")
        .arg(&socket_path)
        .arg("--cols")
        .arg(spec.cols.to_string())
        .arg("--rows")
        .arg(spec.rows.to_string())
        .env(consts::ENV_SES_SOCKET, ses_socket)
        .env(consts::ENV_INSTANCE, paths::instance())
        .stdin(process::Stdio::null())
        .stdout(process::Stdio::piped())
        .stderr(process::Stdio::inherit());
    if let Some(shell) = spec.shell {
        cmd.arg("--shell").arg(shell);
    }
    if let Some(cwd) = spec.cwd {
        cmd.arg("--cwd").arg(cwd);
    }
    if let Some(name) = spec.name {
        cmd.arg("--name").arg(name);
    }

    let mut child = cmd.spawn().context("spawning pod process")?;
    let pid = child.id() as i32;

    match wait_for_ready(&mut child) {
        Ok(()) => {
            info!("pod {} ready on {:?}", pid, socket_path);
            Ok(PodHandle { pid, socket_path })
        }
        Err(e) => {
            warn!("pod {} never became ready: {:?}", pid, e);
            let _ = child.kill();
            let _ = child.wait();
            Err(e)
        }
    }
}

/// Block (bounded) until the pod prints its `ready <socket>` line.
fn wait_for_ready(child: &mut process::Child) -> anyhow::Result<()> {
    use std::io::Read;

    let stdout = child.stdout.take().ok_or(anyhow!("pod stdout not piped"))?;
    let fd = stdout.as_raw_fd();
    let deadline = time::Instant::now() + consts::POD_SPAWN_TIMEOUT;
    let mut line = Vec::new();
    let mut buf = [0u8; 256];
    let mut stdout = stdout;

    loop {
        let left = deadline.saturating_duration_since(time::Instant::now());
        if left.is_zero() {
            return Err(anyhow!("timed out waiting for pod ready line"));
        }
        let ready = net::wait_ready(&[(fd, PollFlags::POLLIN)], left.as_millis() as u16)?;
        if ready.is_empty() {
            continue;
        }
        match stdout.read(&mut buf) {
            Ok(0) => return Err(anyhow!("pod exited before reporting ready")),
            Ok(n) => {
                line.extend_from_slice(&buf[..n]);
                if line.contains(&b'\n') {
                    let text = String::from_utf8_lossy(&line);
                    if text.starts_with("ready ") {
                        return Ok(());
                    }
                    return Err(anyhow!("unexpected pod startup line: {:?}", text));
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e).context("reading pod stdout"),
        }
    }
}
