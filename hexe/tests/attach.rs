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
use hexe_protocol::{PaneFound, PaneInfo};
use ntest::timeout;

mod support;

use support::{daemon, mux::MuxClient};

#[test]
#[timeout(30000)]
fn create_and_echo() -> anyhow::Result<()> {
    let daemon = daemon::Proc::new()?;
    let mut mux = MuxClient::register(&daemon.socket_path, "smoke", false)?;
    mux.open_vt(&daemon.socket_path)?;

    let pane = mux.create_pane("/bin/sh").context("creating pane")?;
    assert_eq!(pane.pane_id, 1);
    assert!(pane.pod_pid > 0);
    assert!(pane.socket_path.contains(&pane.uuid.to_hex()));

    mux.write_input(pane.pane_id, b"echo hi\n")?;
    let out = mux
        .read_output_until(pane.pane_id, time::Duration::from_secs(10), |acc| {
            acc.windows(2).any(|w| w == b"hi")
        })
        .map_err(|e| {
            daemon.dump_log();
            e
        })?;
    assert!(!out.is_empty());

    Ok(())
}

#[test]
#[timeout(60000)]
fn backlog_replay_after_reconnect() -> anyhow::Result<()> {
    let daemon = daemon::Proc::new()?;
    let mut mux = MuxClient::register(&daemon.socket_path, "backlog", true)?;
    mux.open_vt(&daemon.socket_path)?;

    // a raw byte mirror so the output stream is fully deterministic
    let pane = mux
        .create_pane("/bin/sh -c 'stty raw -echo; echo READY; cat'")
        .context("creating cat pane")?;

    let banner = mux
        .read_output_until(pane.pane_id, time::Duration::from_secs(10), |acc| {
            acc.windows(5).any(|w| w == b"READY")
        })
        .map_err(|e| {
            daemon.dump_log();
            e
        })?;

    // deterministic payload, free of newlines and clear sequences
    let payload: Vec<u8> = (0..8192u32).map(|i| b'a' + (i % 26) as u8).collect();
    for chunk in payload.chunks(512) {
        mux.write_input(pane.pane_id, chunk)?;
    }
    let echoed = {
        let want = payload.clone();
        mux.read_output_until(pane.pane_id, time::Duration::from_secs(20), move |acc| {
            acc.len() >= want.len() && acc.ends_with(&want)
        })?
    };

    // drop the VT stream and come back; the pod must replay exactly
    // the bytes it has produced since the first attach, then mark the
    // end of the backlog
    mux.close_vt();
    mux.open_vt(&daemon.socket_path)?;
    let replay = mux.read_backlog(pane.pane_id, time::Duration::from_secs(20)).map_err(|e| {
        daemon.dump_log();
        e
    })?;

    let mut full_stream = banner.clone();
    full_stream.extend_from_slice(&echoed);
    assert_eq!(
        replay, full_stream,
        "replay must be byte-identical to the observed output stream"
    );

    Ok(())
}

// A stalled VT stream must not wedge the control channel: the daemon
// never blocks on writes, so C1 requests keep getting answered while
// C2 backs up.
#[test]
#[timeout(60000)]
fn control_survives_vt_stall() -> anyhow::Result<()> {
    let daemon = daemon::Proc::new()?;
    let mut mux = MuxClient::register(&daemon.socket_path, "stall", false)?;
    mux.open_vt(&daemon.socket_path)?;

    // a shell that floods its pty forever
    let pane = mux
        .create_pane("/bin/sh -c 'while true; do echo spam-spam-spam-spam; done'")
        .context("creating flood pane")?;

    // deliberately never read C2
    for _ in 0..20 {
        mux.send_ctl(&PaneInfo { uuid: pane.uuid })?;
        let found: PaneFound = mux.expect_ctl(time::Duration::from_secs(5)).map_err(|e| {
            daemon.dump_log();
            e
        })?;
        assert_eq!(found.pane.uuid, pane.uuid);
    }

    Ok(())
}
