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
    os::unix::{net::UnixStream, process::CommandExt as _},
    path::PathBuf,
    process,
    process::{Command, Stdio},
    time,
};

use anyhow::{anyhow, Context};
use nix::{
    sys::signal::{killpg, Signal},
    unistd::Pid,
};
use tempfile::TempDir;

use super::hexe_bin;

/// Proc is a helper handle for a `hexe daemon` subprocess.
/// It kills the subprocess when it goes out of scope.
pub struct Proc {
    pub proc: process::Child,
    pub socket_path: PathBuf,
    pub log_file: PathBuf,
    // owns the dir holding every socket and state file for this test
    _tmp_dir: TempDir,
}

impl Proc {
    pub fn new() -> anyhow::Result<Proc> {
        let tmp_dir = tempfile::Builder::new()
            .prefix("hexe-test")
            .rand_bytes(20)
            .tempdir()
            .context("creating tmp dir")?;

        let socket_path = tmp_dir.path().join("ses.sock");
        let log_file = tmp_dir.path().join("daemon.log");
        let instance = tmp_dir
            .path()
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| String::from("test"));
        eprintln!("spawning daemon proc with log {:?}", &log_file);

        // pods inherit the daemon's stderr for their logs, so these
        // must not be pipes nobody drains
        let proc = Command::new(hexe_bin())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .arg("-vv")
            .arg("--log-file")
            .arg(&log_file)
            .arg("--socket")
            .arg(&socket_path)
            .arg("daemon")
            .env("XDG_RUNTIME_DIR", tmp_dir.path().join("run"))
            .env("XDG_STATE_HOME", tmp_dir.path().join("state"))
            .env("HEXE_INSTANCE", &instance)
            // pods land in the same process group so teardown can
            // sweep the whole tree
            .process_group(0)
            .spawn()
            .context("spawning daemon process")?;

        // spin until we can dial the socket successfully
        let mut sleep_dur = time::Duration::from_millis(5);
        for _ in 0..12 {
            if UnixStream::connect(&socket_path).is_ok() {
                break;
            }
            std::thread::sleep(sleep_dur);
            sleep_dur *= 2;
        }
        if UnixStream::connect(&socket_path).is_err() {
            return Err(anyhow!("daemon never came up on {:?}", socket_path));
        }

        Ok(Proc { proc, socket_path, log_file, _tmp_dir: tmp_dir })
    }

    pub fn dump_log(&self) {
        if let Ok(log) = std::fs::read_to_string(&self.log_file) {
            eprintln!("=== daemon log ===\n{log}");
        }
    }
}

impl std::ops::Drop for Proc {
    fn drop(&mut self) {
        // killing the process group takes the pods down with the
        // daemon; their shells then see a pty hangup and exit
        if let Err(e) = killpg(Pid::from_raw(self.proc.id() as i32), Signal::SIGKILL) {
            eprintln!("error killing daemon group: {:?}", e);
            let _ = self.proc.kill();
        }
        let _ = self.proc.wait();
    }
}
