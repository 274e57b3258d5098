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

//! The ses-side data model: attached clients, panes, and detached
//! sessions, plus the lookup rules for reattach prefixes and targeted
//! messages. Pure bookkeeping; every fd in here is just a token owned
//! by the event loop's connection table.

use std::{collections::HashMap, os::unix::io::RawFd, path::PathBuf};

use hexe_protocol::{PaneSnapshot, PaneState, Uuid};

pub type ClientId = usize;

/// Last-known pane attributes. Ses only caches these; the pod is the
/// source of truth for anything scraped from /proc.
#[derive(Debug, Default, Clone)]
pub struct PaneAttrs {
    pub cwd: String,
    pub fg_name: String,
    pub fg_pid: i32,
    pub title: String,
    pub name: Option<String>,
    pub shell: Option<String>,
    pub last_cmd: String,
    pub last_status: i32,
    pub last_duration_ms: u64,
    pub job_count: u16,
    pub cols: u16,
    pub rows: u16,
    pub cursor_col: u16,
    pub cursor_row: u16,
    pub cursor_style: u8,
    pub cursor_visible: bool,
    pub alt_screen: bool,
    pub sticky_pwd: Option<String>,
    pub sticky_key: Option<u8>,
}

#[derive(Debug)]
pub struct Pane {
    pub uuid: Uuid,
    pub pane_id: u16,
    pub pod_pid: i32,
    pub child_pid: i32,
    pub socket_path: PathBuf,
    pub state: PaneState,
    pub owner: Option<ClientId>,
    pub session: Option<Uuid>,
    /// C3 connection token, present only while streaming to a mux.
    pub vt_fd: Option<RawFd>,
    /// C4 uplink token.
    pub ctl_fd: Option<RawFd>,
    pub attrs: PaneAttrs,
}

impl Pane {
    pub fn snapshot(&self) -> PaneSnapshot {
        PaneSnapshot {
            uuid: self.uuid,
            pane_id: self.pane_id,
            pod_pid: self.pod_pid,
            state: self.state,
            cwd: self.attrs.cwd.clone(),
            name: self.attrs.name.clone().unwrap_or_default(),
            fg: self.attrs.fg_name.clone(),
        }
    }
}

#[derive(Debug)]
pub struct Client {
    pub id: ClientId,
    pub session_id: Uuid,
    pub name: Option<String>,
    pub keepalive: bool,
    pub ctl_fd: RawFd,
    pub vt_fd: Option<RawFd>,
    pub panes: Vec<Uuid>,
    /// The most recent layout_sync blob, used if this client
    /// disconnects without an explicit detach.
    pub layout: Vec<u8>,
}

#[derive(Debug)]
pub struct DetachedSession {
    pub session_id: Uuid,
    pub name: Option<String>,
    pub layout: Vec<u8>,
    pub panes: Vec<Uuid>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum PrefixMatch {
    One(Uuid),
    NotFound,
    Ambiguous,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Target {
    Session(Uuid),
    Pane(Uuid),
}

#[derive(Default)]
pub struct Registry {
    pub clients: HashMap<ClientId, Client>,
    pub panes: HashMap<Uuid, Pane>,
    pub detached: HashMap<Uuid, DetachedSession>,
    next_client_id: ClientId,
    next_pane_id: u16,
    pub dirty: bool,
}

impl Registry {
    pub fn new() -> Self {
        Registry { next_pane_id: 1, ..Default::default() }
    }

    pub fn add_client(
        &mut self,
        session_id: Uuid,
        name: Option<String>,
        keepalive: bool,
        ctl_fd: RawFd,
    ) -> ClientId {
        let id = self.next_client_id;
        self.next_client_id += 1;
        self.clients.insert(
            id,
            Client {
                id,
                session_id,
                name,
                keepalive,
                ctl_fd,
                vt_fd: None,
                panes: vec![],
                layout: vec![],
            },
        );
        self.dirty = true;
        id
    }

    /// Allocate the next pane id. Ids are monotonic; wrapping all the
    /// way around a u16 means something upstream leaked panes, so we
    /// flag it loudly in debug builds and pick the next unused id.
    pub fn alloc_pane_id(&mut self) -> u16 {
        loop {
            let id = self.next_pane_id;
            let (next, wrapped) = id.overflowing_add(1);
            debug_assert!(!wrapped, "pane id space wrapped");
            self.next_pane_id = if next == 0 { 1 } else { next };
            if !self.panes.values().any(|p| p.pane_id == id) {
                return id;
            }
        }
    }

    /// Make sure freshly restored panes don't collide with future
    /// allocations.
    pub fn reserve_pane_ids(&mut self) {
        if let Some(max) = self.panes.values().map(|p| p.pane_id).max() {
            self.next_pane_id = self.next_pane_id.max(max.wrapping_add(1).max(1));
        }
    }

    pub fn client_by_session(&self, session_id: &Uuid) -> Option<&Client> {
        self.clients.values().find(|c| c.session_id == *session_id)
    }

    /// Reattach matching: session-id hex prefix, case-insensitive
    /// exact session name, or case-insensitive name prefix of length
    /// >= 3. Two or more matching records is ambiguous.
    pub fn match_detached(&self, prefix: &str) -> PrefixMatch {
        let needle = prefix.to_lowercase();
        if needle.is_empty() {
            return PrefixMatch::NotFound;
        }

        let mut matches: Vec<Uuid> = vec![];
        for session in self.detached.values() {
            let hex = session.session_id.to_hex();
            let name = session.name.as_deref().unwrap_or("").to_lowercase();
            let hit = hex.starts_with(&needle)
                || (!name.is_empty() && name == needle)
                || (!name.is_empty() && needle.len() >= 3 && name.starts_with(&needle));
            if hit {
                matches.push(session.session_id);
            }
        }

        match matches.len() {
            0 => PrefixMatch::NotFound,
            1 => PrefixMatch::One(matches[0]),
            _ => PrefixMatch::Ambiguous,
        }
    }

    /// Targeted-message resolution, in priority order: full 32-hex
    /// session id, full 32-hex pane uuid, then a 4-31 char
    /// case-insensitive prefix of a session name, session id, or pane
    /// uuid. A prefix that matches more than one thing in its tier
    /// resolves to nothing.
    pub fn resolve_target(&self, target: &str) -> Option<Target> {
        let needle = target.to_lowercase();

        if needle.len() == 32 {
            if let Ok(uuid) = Uuid::from_hex(&needle) {
                if self.session_ids().any(|sid| sid == uuid) {
                    return Some(Target::Session(uuid));
                }
                if self.panes.contains_key(&uuid) {
                    return Some(Target::Pane(uuid));
                }
            }
        }

        if !(4..32).contains(&needle.len()) {
            return None;
        }

        let name_hits: Vec<Uuid> = self
            .clients
            .values()
            .map(|c| (c.session_id, c.name.as_deref()))
            .chain(self.detached.values().map(|d| (d.session_id, d.name.as_deref())))
            .filter(|(_, name)| {
                name.map(|n| n.to_lowercase().starts_with(&needle)).unwrap_or(false)
            })
            .map(|(sid, _)| sid)
            .collect();
        if name_hits.len() == 1 {
            return Some(Target::Session(name_hits[0]));
        }
        if name_hits.len() > 1 {
            return None;
        }

        let session_hits: Vec<Uuid> =
            self.session_ids().filter(|sid| sid.to_hex().starts_with(&needle)).collect();
        if session_hits.len() == 1 {
            return Some(Target::Session(session_hits[0]));
        }
        if session_hits.len() > 1 {
            return None;
        }

        let pane_hits: Vec<Uuid> =
            self.panes.keys().filter(|uuid| uuid.to_hex().starts_with(&needle)).copied().collect();
        if pane_hits.len() == 1 {
            return Some(Target::Pane(pane_hits[0]));
        }
        None
    }

    fn session_ids(&self) -> impl Iterator<Item = Uuid> + '_ {
        self.clients
            .values()
            .map(|c| c.session_id)
            .chain(self.detached.values().map(|d| d.session_id))
    }

    /// The first pane of a session, for targets that name a session
    /// where a pane is needed.
    pub fn first_pane_of_session(&self, session_id: &Uuid) -> Option<Uuid> {
        if let Some(client) = self.client_by_session(session_id) {
            return client.panes.first().copied();
        }
        self.detached.get(session_id).and_then(|d| d.panes.first().copied())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn uuid(seed: u8) -> Uuid {
        Uuid([seed; 16])
    }

    fn registry_with_detached(entries: &[(u8, Option<&str>)]) -> Registry {
        let mut reg = Registry::new();
        for (seed, name) in entries {
            let session_id = uuid(*seed);
            reg.detached.insert(
                session_id,
                DetachedSession {
                    session_id,
                    name: name.map(String::from),
                    layout: vec![],
                    panes: vec![],
                },
            );
        }
        reg
    }

    fn pane(uuid: Uuid, pane_id: u16) -> Pane {
        Pane {
            uuid,
            pane_id,
            pod_pid: 1,
            child_pid: 2,
            socket_path: PathBuf::from("/tmp/x.sock"),
            state: PaneState::Detached,
            owner: None,
            session: None,
            vt_fd: None,
            ctl_fd: None,
            attrs: PaneAttrs::default(),
        }
    }

    #[test]
    fn match_by_name_exact_and_prefix() {
        let reg = registry_with_detached(&[(1, Some("pikachu")), (2, Some("raichu"))]);

        assert_eq!(reg.match_detached("PIKACHU"), PrefixMatch::One(uuid(1)));
        assert_eq!(reg.match_detached("pika"), PrefixMatch::One(uuid(1)));
        assert_eq!(reg.match_detached("rai"), PrefixMatch::One(uuid(2)));
        assert_eq!(reg.match_detached("bulbasaur"), PrefixMatch::NotFound);
        // name prefixes shorter than 3 chars don't count
        assert_eq!(reg.match_detached("pi"), PrefixMatch::NotFound);
    }

    #[test]
    fn match_by_hex_prefix() {
        let reg = registry_with_detached(&[(0x11, Some("one")), (0x22, Some("two"))]);

        assert_eq!(reg.match_detached("1111"), PrefixMatch::One(uuid(0x11)));
        // a single hex char is a valid prefix
        assert_eq!(reg.match_detached("2"), PrefixMatch::One(uuid(0x22)));
        assert_eq!(reg.match_detached(&uuid(0x22).to_hex()), PrefixMatch::One(uuid(0x22)));
    }

    #[test]
    fn short_prefix_with_two_matches_is_ambiguous() {
        // 0x1a and 0x1b hex-encode to "1a.." and "1b..", both matching "1"
        let reg = registry_with_detached(&[(0x1a, None), (0x1b, None)]);
        assert_eq!(reg.match_detached("1"), PrefixMatch::Ambiguous);
        assert_eq!(reg.match_detached("1a"), PrefixMatch::One(uuid(0x1a)));
    }

    #[test]
    fn ambiguous_names() {
        let reg = registry_with_detached(&[(1, Some("build-a")), (2, Some("build-b"))]);
        assert_eq!(reg.match_detached("build"), PrefixMatch::Ambiguous);
        assert_eq!(reg.match_detached("build-a"), PrefixMatch::One(uuid(1)));
    }

    #[test]
    fn target_resolution_priorities() {
        let mut reg = registry_with_detached(&[(0x33, Some("worker"))]);
        let pane_uuid = uuid(0x44);
        reg.panes.insert(pane_uuid, pane(pane_uuid, 1));

        // full hex forms resolve exactly
        assert_eq!(
            reg.resolve_target(&uuid(0x33).to_hex()),
            Some(Target::Session(uuid(0x33)))
        );
        assert_eq!(reg.resolve_target(&pane_uuid.to_hex()), Some(Target::Pane(pane_uuid)));

        // name prefix beats hex prefix
        assert_eq!(reg.resolve_target("work"), Some(Target::Session(uuid(0x33))));
        // pane hex prefix works when nothing shadows it
        assert_eq!(reg.resolve_target("4444"), Some(Target::Pane(pane_uuid)));

        // too-short prefixes resolve to nothing
        assert_eq!(reg.resolve_target("444"), None);
        assert_eq!(reg.resolve_target(""), None);
    }

    #[test]
    fn pane_ids_monotonic_and_skip_used() {
        let mut reg = Registry::new();
        let a = reg.alloc_pane_id();
        let b = reg.alloc_pane_id();
        assert_eq!((a, b), (1, 2));

        // simulate a restored pane occupying id 3
        let p = uuid(9);
        let mut restored = pane(p, 3);
        restored.state = PaneState::Detached;
        reg.panes.insert(p, restored);
        let c = reg.alloc_pane_id();
        assert_eq!(c, 4);
    }

    #[test]
    fn reserve_pane_ids_after_restore() {
        let mut reg = Registry::new();
        let p = uuid(9);
        reg.panes.insert(p, pane(p, 40));
        reg.reserve_pane_ids();
        assert_eq!(reg.alloc_pane_id(), 41);
    }
}
