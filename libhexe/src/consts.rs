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

use std::time;

pub const SOCK_STREAM_TIMEOUT: time::Duration = time::Duration::from_millis(200);

/// Copy size for all the byte shuffling loops.
pub const BUF_SIZE: usize = 1024 * 16;

/// Default capacity of a pod's replay backlog.
pub const BACKLOG_BYTES: usize = 4 * 1024 * 1024;

/// Hard bound on concurrent mux control connections.
pub const MAX_CLIENTS: usize = 64;

/// The ses poll timeout, which doubles as the persistence tick.
pub const SES_TICK: time::Duration = time::Duration::from_millis(1000);

/// The pod poll timeout driving reaping and /proc scraping.
pub const POD_TICK: time::Duration = time::Duration::from_millis(500);

/// How long ses will wait for a freshly spawned pod to report ready.
pub const POD_SPAWN_TIMEOUT: time::Duration = time::Duration::from_secs(5);

/// Once a mux's VT write buffer grows past this, ses stops reading
/// from that mux's pods until the buffer drains. The pressure lands in
/// the pod rings instead of ses memory.
pub const VT_WRITE_HIGH_WATER: usize = 1024 * 1024;

pub const STDERR_FD: i32 = 2;

// Environment set for pod children (and forwarded into the shell).
pub const ENV_POD_SOCKET: &str = "HEXE_POD_SOCKET";
pub const ENV_PANE_UUID: &str = "HEXE_PANE_UUID";
pub const ENV_POD_NAME: &str = "HEXE_POD_NAME";
pub const ENV_SES_SOCKET: &str = "HEXE_SES_SOCKET";
pub const ENV_INSTANCE: &str = "HEXE_INSTANCE";

// If set to "true", the daemon will autodaemonize after launch.
pub const AUTODAEMONIZE_VAR: &str = "HEXE__INTERNAL__AUTODAEMONIZE";
