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

//! Registry persistence. Once a second, if anything changed, ses
//! serializes the registry to the state dir; on startup it reloads and
//! drops any pane whose pod is no longer alive. Writes are
//! write-temp-then-rename so a crash can never leave a torn file.

use std::{fs, path::Path};

use anyhow::Context;
use hexe_protocol::{PaneState, Uuid};
use nix::{sys::signal, unistd::Pid};
use serde_derive::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use super::registry::{DetachedSession, Pane, PaneAttrs, Registry};

#[derive(Serialize, Deserialize, Debug)]
pub struct PersistedPane {
    pub uuid: String,
    pub pane_id: u16,
    pub pod_pid: i32,
    pub child_pid: i32,
    pub socket_path: String,
    pub state: u8,
    #[serde(default)]
    pub session: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub cwd: String,
    #[serde(default)]
    pub sticky_pwd: Option<String>,
    #[serde(default)]
    pub sticky_key: Option<u8>,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct PersistedSession {
    pub session_id: String,
    #[serde(default)]
    pub name: Option<String>,
    /// The mux layout, opaque bytes as far as ses is concerned.
    #[serde(default)]
    pub layout: Vec<u8>,
    #[serde(default)]
    pub panes: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Default)]
pub struct PersistedRegistry {
    #[serde(default)]
    pub panes: Vec<PersistedPane>,
    #[serde(default)]
    pub detached: Vec<PersistedSession>,
}

/// Serialize the registry and atomically swap it into place.
#[instrument(skip_all)]
pub fn save(path: &Path, registry: &Registry) -> anyhow::Result<()> {
    let mut snapshot = PersistedRegistry::default();
    for pane in registry.panes.values() {
        snapshot.panes.push(PersistedPane {
            uuid: pane.uuid.to_hex(),
            pane_id: pane.pane_id,
            pod_pid: pane.pod_pid,
            child_pid: pane.child_pid,
            socket_path: pane.socket_path.to_string_lossy().into_owned(),
            state: pane.state as u8,
            session: pane.session.map(|s| s.to_hex()),
            name: pane.attrs.name.clone(),
            cwd: pane.attrs.cwd.clone(),
            sticky_pwd: pane.attrs.sticky_pwd.clone(),
            sticky_key: pane.attrs.sticky_key,
        });
    }
    for session in registry.detached.values() {
        snapshot.detached.push(PersistedSession {
            session_id: session.session_id.to_hex(),
            name: session.name.clone(),
            layout: session.layout.clone(),
            panes: session.panes.iter().map(|u| u.to_hex()).collect(),
        });
    }

    let dir = path.parent().context("state file has no parent dir")?;
    let tmp = tempfile::NamedTempFile::new_in(dir).context("creating temp state file")?;
    serde_json::to_writer(tmp.as_file(), &snapshot).context("serializing registry")?;
    tmp.persist(path).context("renaming state file into place")?;
    Ok(())
}

/// Load a previously persisted registry, if there is one.
pub fn load(path: &Path) -> anyhow::Result<Option<PersistedRegistry>> {
    let data = match fs::read(path) {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).context("reading state file"),
    };
    let snapshot = serde_json::from_slice(&data).context("parsing state file")?;
    Ok(Some(snapshot))
}

/// Fold persisted state into a fresh registry. Every recorded pod gets
/// a liveness probe (signal 0); dead ones are silently dropped. All
/// surviving panes come back unowned: attached panes from a previous
/// life are grouped into detached sessions their muxes can reattach.
#[instrument(skip_all)]
pub fn restore(registry: &mut Registry, snapshot: PersistedRegistry) {
    for p in snapshot.panes {
        let Ok(uuid) = Uuid::from_hex(&p.uuid) else {
            warn!("dropping pane with bad uuid {:?}", p.uuid);
            continue;
        };
        if signal::kill(Pid::from_raw(p.pod_pid), None).is_err() {
            info!("dropping pane {} (pod {} is gone)", uuid, p.pod_pid);
            continue;
        }
        let state = match PaneState::try_from(p.state) {
            // a previously attached pane has no owner anymore
            Ok(PaneState::Attached) | Ok(PaneState::Detached) => PaneState::Detached,
            Ok(s) => s,
            Err(_) => PaneState::Detached,
        };
        let session = p.session.as_deref().and_then(|s| Uuid::from_hex(s).ok());
        registry.panes.insert(
            uuid,
            Pane {
                uuid,
                pane_id: p.pane_id,
                pod_pid: p.pod_pid,
                child_pid: p.child_pid,
                socket_path: p.socket_path.into(),
                state,
                owner: None,
                session,
                vt_fd: None,
                ctl_fd: None,
                attrs: PaneAttrs {
                    cwd: p.cwd,
                    name: p.name,
                    sticky_pwd: p.sticky_pwd,
                    sticky_key: p.sticky_key,
                    ..Default::default()
                },
            },
        );
    }

    for s in snapshot.detached {
        let Ok(session_id) = Uuid::from_hex(&s.session_id) else {
            continue;
        };
        let panes: Vec<Uuid> = s
            .panes
            .iter()
            .filter_map(|hex| Uuid::from_hex(hex).ok())
            .filter(|u| registry.panes.contains_key(u))
            .collect();
        if panes.is_empty() && s.layout.is_empty() {
            continue;
        }
        registry.detached.insert(
            session_id,
            DetachedSession { session_id, name: s.name, layout: s.layout, panes },
        );
    }

    // panes that were attached but whose session record did not
    // survive get grouped back into detached sessions by session id
    let mut stray: Vec<(Uuid, Uuid)> = vec![];
    for pane in registry.panes.values() {
        if let (PaneState::Detached, Some(session)) = (pane.state, pane.session) {
            let listed = registry
                .detached
                .get(&session)
                .map(|d| d.panes.contains(&pane.uuid))
                .unwrap_or(false);
            if !listed {
                stray.push((session, pane.uuid));
            }
        }
    }
    for (session_id, pane_uuid) in stray {
        registry
            .detached
            .entry(session_id)
            .or_insert_with(|| DetachedSession {
                session_id,
                name: None,
                layout: vec![],
                panes: vec![],
            })
            .panes
            .push(pane_uuid);
    }

    registry.reserve_pane_ids();
}

#[cfg(test)]
mod test {
    use super::*;

    fn live_pane(uuid_hex: String, pane_id: u16) -> PersistedPane {
        PersistedPane {
            uuid: uuid_hex,
            pane_id,
            // our own pid is reliably alive
            pod_pid: std::process::id() as i32,
            child_pid: 1,
            socket_path: String::from("/tmp/pod.sock"),
            state: PaneState::Attached as u8,
            session: Some(Uuid([9; 16]).to_hex()),
            name: None,
            cwd: String::from("/tmp"),
            sticky_pwd: None,
            sticky_key: None,
        }
    }

    #[test]
    fn save_load_round_trip() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("registry.json");

        let mut registry = Registry::new();
        restore(
            &mut registry,
            PersistedRegistry {
                panes: vec![live_pane(Uuid([1; 16]).to_hex(), 4)],
                detached: vec![PersistedSession {
                    session_id: Uuid([9; 16]).to_hex(),
                    name: Some(String::from("pikachu")),
                    layout: b"{}".to_vec(),
                    panes: vec![Uuid([1; 16]).to_hex()],
                }],
            },
        );
        save(&path, &registry).expect("save to succeed");

        let reloaded = load(&path).expect("load to succeed").expect("a snapshot");
        assert_eq!(reloaded.panes.len(), 1);
        assert_eq!(reloaded.panes[0].pane_id, 4);
        assert_eq!(reloaded.detached.len(), 1);
        assert_eq!(reloaded.detached[0].layout, b"{}".to_vec());
    }

    #[test]
    fn load_missing_file_is_none() {
        let dir = tempfile::tempdir().expect("tmp dir");
        assert!(load(&dir.path().join("nope.json")).expect("no error").is_none());
    }

    #[test]
    fn dead_pods_are_dropped() {
        let mut pane = live_pane(Uuid([2; 16]).to_hex(), 1);
        // an impossible pid
        pane.pod_pid = i32::MAX - 1;
        let mut registry = Registry::new();
        restore(&mut registry, PersistedRegistry { panes: vec![pane], detached: vec![] });
        assert!(registry.panes.is_empty());
    }

    #[test]
    fn stray_attached_panes_regroup_into_detached_sessions() {
        let mut registry = Registry::new();
        restore(
            &mut registry,
            PersistedRegistry {
                panes: vec![live_pane(Uuid([3; 16]).to_hex(), 7)],
                detached: vec![],
            },
        );
        let session = registry.detached.get(&Uuid([9; 16])).expect("a regrouped session");
        assert_eq!(session.panes, vec![Uuid([3; 16])]);
        // restored ids are reserved
        assert_eq!(registry.panes[&Uuid([3; 16])].state, PaneState::Detached);
        assert!(registry.alloc_pane_id() > 7);
    }
}
