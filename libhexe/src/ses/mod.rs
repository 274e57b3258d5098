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

use std::{env, fs, os::unix::net::{UnixListener, UnixStream}, path::PathBuf};

use anyhow::{anyhow, Context};
use tracing::{info, instrument, warn};

use crate::{config, consts, net, paths};

mod persist;
pub mod registry;
mod server;
mod signals;
mod slots;
mod spawn;

#[instrument(skip_all)]
pub fn run(config: config::Config, socket: PathBuf) -> anyhow::Result<()> {
    if let Ok(daemonize) = env::var(consts::AUTODAEMONIZE_VAR) {
        if daemonize == "true" {
            env::remove_var(consts::AUTODAEMONIZE_VAR); // avoid looping

            let pid_file = socket.with_file_name("daemonized-ses.pid");
            info!("daemonizing with pid_file={:?}", pid_file);
            daemonize::Daemonize::new().pid_file(pid_file).start().context("daemonizing")?;
        }
    }

    info!("\n\n======================== STARTING SES ============================\n\n");

    net::ignore_sigpipe()?;
    let stop = signals::register_shutdown_flag()?;

    let mut registry = registry::Registry::new();
    let state_file = paths::state_file()?;
    match persist::load(&state_file) {
        Ok(Some(snapshot)) => {
            persist::restore(&mut registry, snapshot);
            info!(
                "restored {} panes / {} detached sessions",
                registry.panes.len(),
                registry.detached.len()
            );
        }
        Ok(None) => {}
        Err(e) => warn!("could not restore registry, starting fresh: {:?}", e),
    }

    let listener = bind_socket(&socket)?;
    let mut server =
        server::Server::new(config, socket.clone(), state_file, registry, stop);
    let res = server.serve(listener);

    let _ = fs::remove_file(&socket);
    res
}

/// Bind the ses socket, displacing a stale socket file but refusing to
/// shoulder aside a live daemon.
fn bind_socket(socket: &PathBuf) -> anyhow::Result<UnixListener> {
    match UnixListener::bind(socket) {
        Ok(l) => Ok(l),
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
            if UnixStream::connect(socket).is_ok() {
                return Err(anyhow!("another ses daemon is already running on {socket:?}"));
            }
            info!("clearing stale socket file {:?}", socket);
            fs::remove_file(socket).context("removing stale socket")?;
            UnixListener::bind(socket).context("binding to socket")
        }
        Err(e) => Err(e).context("binding to socket"),
    }
}
