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

use anyhow::{anyhow, Context};
use nix::unistd;

#[derive(Debug)]
pub struct Info {
    pub default_shell: String,
    pub home_dir: String,
    pub user: String,
}

/// Resolve the current user's passwd entry. Pods use this to pick the
/// default shell and home dir for new panes.
pub fn info() -> anyhow::Result<Info> {
    let uid = unistd::getuid();
    let entry = unistd::User::from_uid(uid)
        .context("looking up current user")?
        .ok_or(anyhow!("no passwd entry for uid {}", uid))?;

    Ok(Info {
        default_shell: entry.shell.to_string_lossy().into_owned(),
        home_dir: entry.dir.to_string_lossy().into_owned(),
        user: entry.name,
    })
}
