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

//! Peeking at the shell subprocess to learn its cwd and foreground
//! process. The pod loop only depends on the `ProcInspector` trait so
//! the procfs scraping stays swappable per platform.

use std::path::PathBuf;

use anyhow::{anyhow, Context};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Foreground {
    pub pid: i32,
    pub name: String,
}

pub trait ProcInspector {
    /// The current working directory of the given process.
    fn cwd(&self, pid: i32) -> anyhow::Result<PathBuf>;

    /// The foreground process of the given process's controlling
    /// terminal.
    fn foreground(&self, pid: i32) -> anyhow::Result<Foreground>;
}

pub fn inspector() -> Box<dyn ProcInspector> {
    #[cfg(target_os = "linux")]
    {
        Box::new(ProcfsInspector {})
    }
    #[cfg(target_os = "macos")]
    {
        Box::new(LibprocInspector {})
    }
}

#[cfg(target_os = "linux")]
pub struct ProcfsInspector {}

#[cfg(target_os = "linux")]
impl ProcInspector for ProcfsInspector {
    fn cwd(&self, pid: i32) -> anyhow::Result<PathBuf> {
        std::fs::read_link(format!("/proc/{pid}/cwd")).context("reading cwd link")
    }

    fn foreground(&self, pid: i32) -> anyhow::Result<Foreground> {
        let stat = std::fs::read_to_string(format!("/proc/{pid}/stat"))
            .context("reading stat for shell")?;
        let tpgid = tpgid_from_stat(&stat)?;
        let name = std::fs::read_to_string(format!("/proc/{tpgid}/comm"))
            .context("reading comm for foreground proc")?;
        Ok(Foreground { pid: tpgid, name: String::from(name.trim_end()) })
    }
}

/// Pull field 8 (tpgid) out of a /proc/<pid>/stat line. The comm field
/// can contain spaces and parens, so fields are counted from the last
/// close paren, not the start of the line.
#[cfg(target_os = "linux")]
fn tpgid_from_stat(stat: &str) -> anyhow::Result<i32> {
    let after_comm =
        &stat[stat.rfind(')').ok_or(anyhow!("stat line has no comm field"))? + 1..];
    // after_comm starts at field 3 (state)
    let field = after_comm
        .split_whitespace()
        .nth(5)
        .ok_or(anyhow!("stat line too short for tpgid"))?;
    field.parse::<i32>().context("parsing tpgid")
}

#[cfg(target_os = "macos")]
pub struct LibprocInspector {}

#[cfg(target_os = "macos")]
impl ProcInspector for LibprocInspector {
    fn cwd(&self, pid: i32) -> anyhow::Result<PathBuf> {
        let cwd = libproc::libproc::proc_pid::pidcwd(pid)
            .map_err(|e| anyhow!("getting cwd for {}: {}", pid, e))?;
        Ok(cwd)
    }

    fn foreground(&self, pid: i32) -> anyhow::Result<Foreground> {
        // Without procfs we settle for the shell itself; the pod still
        // reports name changes when the shell execs something.
        let name = libproc::libproc::proc_pid::name(pid)
            .map_err(|e| anyhow!("getting name for {}: {}", pid, e))?;
        Ok(Foreground { pid, name })
    }
}

#[cfg(all(test, target_os = "linux"))]
mod test {
    use super::*;

    #[test]
    fn tpgid_parses_simple_stat() {
        let stat = "1234 (sh) S 1 1234 1234 34816 5678 4194304 1 0 0 0";
        assert_eq!(tpgid_from_stat(stat).expect("parse to succeed"), 5678);
    }

    #[test]
    fn tpgid_handles_hostile_comm() {
        // comm fields can contain anything, including spaces and parens
        let stat = "99 (a b) c) R 1 99 99 34816 4242 0 0 0 0 0";
        assert_eq!(tpgid_from_stat(stat).expect("parse to succeed"), 4242);
    }

    #[test]
    fn tpgid_rejects_truncated_stat() {
        assert!(tpgid_from_stat("1 (x) S 1 1").is_err());
        assert!(tpgid_from_stat("garbage").is_err());
    }

    #[test]
    fn own_process_is_inspectable() {
        let inspector = ProcfsInspector {};
        let me = std::process::id() as i32;
        let cwd = inspector.cwd(me).expect("cwd to resolve");
        assert!(cwd.is_absolute());
    }
}
