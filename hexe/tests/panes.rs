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

use anyhow::Context;
use hexe_protocol::{
    AdoptPane, ControlMessage as _, FindSticky, ListOrphaned, MsgType, OkReply, OrphanPane,
    OrphanedPanes, PaneExited, PaneFound, SetSticky,
};
use ntest::timeout;

mod support;

use support::{daemon, mux::MuxClient};

#[test]
#[timeout(60000)]
fn orphan_and_adopt() -> anyhow::Result<()> {
    let daemon = daemon::Proc::new()?;

    let mut first = MuxClient::register(&daemon.socket_path, "orphaner", false)?;
    let pane = first.create_pane("/bin/sh").context("creating pane")?;

    first.send_ctl(&OrphanPane { uuid: pane.uuid })?;
    let _: OkReply = first.expect_ctl(time::Duration::from_secs(5))?;

    first.send_ctl(&ListOrphaned {})?;
    let orphaned: OrphanedPanes = first.expect_ctl(time::Duration::from_secs(5))?;
    assert!(orphaned.panes.iter().any(|p| p.uuid == pane.uuid));

    let mut second = MuxClient::register(&daemon.socket_path, "adopter", false)?;
    second.send_ctl(&AdoptPane { uuid: pane.uuid })?;
    let found: PaneFound = second.expect_ctl(time::Duration::from_secs(5)).map_err(|e| {
        daemon.dump_log();
        e
    })?;
    assert_eq!(found.pane.uuid, pane.uuid);

    // adopted panes no longer show up as orphaned, for anyone
    second.send_ctl(&ListOrphaned {})?;
    let after: OrphanedPanes = second.expect_ctl(time::Duration::from_secs(5))?;
    assert!(after.panes.is_empty());

    // adopting twice fails cleanly
    first.send_ctl(&AdoptPane { uuid: pane.uuid })?;
    let err = first
        .expect_ctl::<PaneFound>(time::Duration::from_secs(5))
        .expect_err("second adopt must fail");
    assert!(err.to_string().contains("not_orphaned"), "got: {err}");

    Ok(())
}

#[test]
#[timeout(60000)]
fn sticky_rebind() -> anyhow::Result<()> {
    let daemon = daemon::Proc::new()?;

    let (uuid, pod_pid) = {
        let mut mux = MuxClient::register(&daemon.socket_path, "sticky-a", true)?;
        let pane = mux.create_pane("/bin/sh").context("creating pane")?;
        mux.send_ctl(&SetSticky {
            uuid: pane.uuid,
            key: b'f',
            pwd: String::from("/tmp/a"),
        })?;
        let _: OkReply = mux.expect_ctl(time::Duration::from_secs(5))?;
        (pane.uuid, pane.pod_pid)
        // ungraceful disconnect: the sticky binding should park the
        // pane in the sticky state rather than killing it
    };

    let mut mux = MuxClient::register(&daemon.socket_path, "sticky-b", true)?;
    let deadline = time::Instant::now() + time::Duration::from_secs(10);
    let found = loop {
        mux.send_ctl(&FindSticky { key: b'f', pwd: String::from("/tmp/a") })?;
        let (raw_type, payload) = mux.read_ctl(time::Duration::from_secs(5))?;
        if raw_type == MsgType::PaneFound as u16 {
            break PaneFound::decode_payload(&payload)?;
        }
        // the daemon may not have processed the first client's hangup
        // yet; PaneNotFound until it does
        if time::Instant::now() >= deadline {
            daemon.dump_log();
            anyhow::bail!("sticky pane never became findable");
        }
        std::thread::sleep(time::Duration::from_millis(100));
    };

    assert_eq!(found.pane.uuid, uuid);
    assert_eq!(found.pane.pod_pid, pod_pid, "the original shell must survive the rebind");

    // a wrong key finds nothing
    mux.send_ctl(&FindSticky { key: b'g', pwd: String::from("/tmp/a") })?;
    let (raw_type, _) = mux.read_ctl(time::Duration::from_secs(5))?;
    assert_eq!(raw_type, MsgType::PaneNotFound as u16);

    Ok(())
}

#[test]
#[timeout(60000)]
fn pane_exit_notifies_owner() -> anyhow::Result<()> {
    let daemon = daemon::Proc::new()?;
    let mut mux = MuxClient::register(&daemon.socket_path, "exiter", false)?;

    let pane = mux.create_pane("/bin/sh -c 'exit 7'").context("creating pane")?;
    let exited: PaneExited = mux.expect_ctl(time::Duration::from_secs(15)).map_err(|e| {
        daemon.dump_log();
        e
    })?;
    assert_eq!(exited.uuid, pane.uuid);
    assert_eq!(exited.status, 7);

    Ok(())
}
