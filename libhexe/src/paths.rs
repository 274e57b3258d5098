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

//! Filesystem layout: sockets under the per-user runtime dir, the
//! registry snapshot under the state dir. Everything is namespaced by
//! `HEXE_INSTANCE` so parallel instances don't stomp on one another.

use std::{env, fs, os::unix::fs::PermissionsExt as _, path::PathBuf};

use anyhow::Context;
use hexe_protocol::Uuid;

use crate::consts;

pub fn instance() -> String {
    env::var(consts::ENV_INSTANCE).unwrap_or_else(|_| String::from("default"))
}

/// The runtime dir holding every socket, created 0700.
pub fn runtime_dir() -> anyhow::Result<PathBuf> {
    let base = match env::var("XDG_RUNTIME_DIR") {
        Ok(d) => PathBuf::from(d),
        Err(_) => PathBuf::from("/tmp"),
    };
    let dir = base.join("hexe").join(instance());
    fs::create_dir_all(&dir).context("creating runtime dir")?;
    let meta = fs::metadata(&dir).context("stating runtime dir")?;
    let mut perm = meta.permissions();
    if perm.mode() & 0o777 != 0o700 {
        perm.set_mode(0o700);
        fs::set_permissions(&dir, perm).context("locking down runtime dir")?;
    }
    Ok(dir)
}

pub fn ses_socket() -> anyhow::Result<PathBuf> {
    Ok(runtime_dir()?.join("ses.sock"))
}

/// The ses socket as seen by a pod or shp process: the env var wins so
/// ses can point its children at an override socket.
pub fn ses_socket_from_env() -> anyhow::Result<PathBuf> {
    if let Ok(sock) = env::var(consts::ENV_SES_SOCKET) {
        return Ok(PathBuf::from(sock));
    }
    ses_socket()
}

pub fn pod_socket(uuid: &Uuid) -> anyhow::Result<PathBuf> {
    Ok(runtime_dir()?.join(format!("pod-{uuid}.sock")))
}

/// The friendly-name alias symlink for a pod socket.
pub fn pod_alias(name: &str) -> anyhow::Result<PathBuf> {
    Ok(runtime_dir()?.join(format!("pod@{name}.sock")))
}

/// Where the registry snapshot is persisted across daemon restarts.
pub fn state_file() -> anyhow::Result<PathBuf> {
    let base = match env::var("XDG_STATE_HOME") {
        Ok(d) => PathBuf::from(d),
        Err(_) => {
            PathBuf::from(env::var("HOME").context("no XDG_STATE_HOME or HOME")?)
                .join(".local")
                .join("state")
        }
    };
    let dir = base.join("hexe");
    fs::create_dir_all(&dir).context("creating state dir")?;
    Ok(dir.join(format!("registry-{}.json", instance())))
}
