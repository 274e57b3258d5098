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

use std::{collections::HashSet, time};

use anyhow::Context;
use hexe_protocol::{Detach, FrameKind, Reattach, SessionDetached, SessionReattached};
use ntest::timeout;

mod support;

use support::{daemon, mux::MuxClient};

#[test]
#[timeout(60000)]
fn detach_and_reattach_by_name() -> anyhow::Result<()> {
    let daemon = daemon::Proc::new()?;
    let layout = br#"{"split":"h","panes":[0,1]}"#.to_vec();

    let pane_ids = {
        let mut mux = MuxClient::register(&daemon.socket_path, "pikachu", true)?;
        let first = mux.create_pane("/bin/sh").context("creating first pane")?;
        let second = mux.create_pane("/bin/sh").context("creating second pane")?;

        mux.send_ctl(&Detach { session_id: mux.session_id, layout: layout.clone() })?;
        let detached: SessionDetached = mux.expect_ctl(time::Duration::from_secs(5))?;
        assert_eq!(detached.session_id, mux.session_id);

        [first.pane_id, second.pane_id]
        // mux drops here, closing C1
    };

    let mut mux = MuxClient::register(&daemon.socket_path, "other", true)?;

    // a prefix that matches nothing is an error, not a panic
    mux.send_ctl(&Reattach { prefix: String::from("zzznope") })?;
    let err = mux
        .expect_ctl::<SessionReattached>(time::Duration::from_secs(5))
        .expect_err("bogus prefix must not match");
    assert!(err.to_string().contains("session_not_found"), "got: {err}");

    // a name prefix of the detached session's name claims it
    mux.send_ctl(&Reattach { prefix: String::from("pika") })?;
    let reattached: SessionReattached =
        mux.expect_ctl(time::Duration::from_secs(10)).map_err(|e| {
            daemon.dump_log();
            e
        })?;
    assert_eq!(reattached.layout, layout, "layout blob must round trip");
    assert_eq!(reattached.panes.len(), 2);

    // opening the VT stream triggers one replay per pane, each closed
    // out by a backlog_end, before any live output
    mux.open_vt(&daemon.socket_path)?;
    let mut ended: HashSet<u16> = HashSet::new();
    let deadline = time::Instant::now() + time::Duration::from_secs(20);
    while ended.len() < 2 {
        let left = deadline.saturating_duration_since(time::Instant::now());
        assert!(!left.is_zero(), "timed out waiting for backlog_end frames");
        let (header, _payload) = mux.read_vt_frame(left)?;
        if header.kind == FrameKind::BacklogEnd {
            assert_eq!(header.len, 0);
            assert!(ended.insert(header.pane_id), "duplicate backlog_end");
        }
    }
    for pane_id in pane_ids {
        assert!(ended.contains(&pane_id), "restored pane ids must be stable");
    }

    Ok(())
}

#[test]
#[timeout(30000)]
fn short_reattach_prefixes_are_ambiguous() -> anyhow::Result<()> {
    let daemon = daemon::Proc::new()?;

    // two detached sessions, no panes needed: a layout is enough to
    // keep a record
    for name in ["build-a", "build-b"] {
        let mut mux = MuxClient::register(&daemon.socket_path, name, true)?;
        mux.send_ctl(&Detach { session_id: mux.session_id, layout: b"{}".to_vec() })?;
        let _: SessionDetached = mux.expect_ctl(time::Duration::from_secs(5))?;
    }

    let mut mux = MuxClient::register(&daemon.socket_path, "claimer", true)?;
    mux.send_ctl(&Reattach { prefix: String::from("build") })?;
    let err = mux
        .expect_ctl::<SessionReattached>(time::Duration::from_secs(5))
        .expect_err("two matches must be ambiguous");
    assert!(err.to_string().contains("ambiguous_session_id"), "got: {err}");

    // the full name still resolves
    mux.send_ctl(&Reattach { prefix: String::from("build-a") })?;
    let reattached: SessionReattached = mux.expect_ctl(time::Duration::from_secs(5))?;
    assert_eq!(reattached.layout, b"{}".to_vec());
    assert!(reattached.panes.is_empty());

    Ok(())
}
