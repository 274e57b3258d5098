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

use std::os::unix::{
    io::{BorrowedFd, RawFd},
    net::UnixStream,
};

use anyhow::{anyhow, Context};
use nix::{
    poll::{self, PollFd, PollFlags},
    unistd,
};

/// check_peer makes sure that a process dialing in on one of our
/// sockets has the same UID as the current user. Runs before the first
/// byte of any accepted connection is processed.
#[cfg(target_os = "linux")]
pub fn check_peer(sock: &UnixStream) -> anyhow::Result<()> {
    use nix::sys::socket;

    let peer_creds = socket::getsockopt(sock, socket::sockopt::PeerCredentials)
        .context("could not get peer creds from socket")?;
    let peer_uid = unistd::Uid::from_raw(peer_creds.uid());
    let self_uid = unistd::Uid::current();
    if peer_uid != self_uid {
        return Err(anyhow!("hexe prohibits connections across users"));
    }

    Ok(())
}

#[cfg(target_os = "macos")]
pub fn check_peer(sock: &UnixStream) -> anyhow::Result<()> {
    use std::{io, os::unix::io::AsRawFd};

    let mut peer_uid: libc::uid_t = 0;
    let mut peer_gid: libc::gid_t = 0;
    // Safety: getpeereid is standard BSD FFI, all pointers are valid
    unsafe {
        if libc::getpeereid(sock.as_raw_fd(), &mut peer_uid, &mut peer_gid) != 0 {
            return Err(anyhow!(
                "could not get peer uid from socket: {}",
                io::Error::last_os_error()
            ));
        }
    }
    let peer_uid = unistd::Uid::from_raw(peer_uid);
    let self_uid = unistd::Uid::current();
    if peer_uid != self_uid {
        return Err(anyhow!("hexe prohibits connections across users"));
    }

    Ok(())
}

/// One level-triggered readiness wait. Takes (fd, interest) pairs and
/// returns the (fd, revents) pairs that fired.
pub fn wait_ready(
    specs: &[(RawFd, PollFlags)],
    timeout_ms: u16,
) -> anyhow::Result<Vec<(RawFd, PollFlags)>> {
    let mut poll_fds: Vec<PollFd> = specs
        .iter()
        .map(|(fd, flags)| {
            // Safety: every fd in the pollset is owned by the calling
            //         event loop and stays open across the poll call.
            PollFd::new(unsafe { BorrowedFd::borrow_raw(*fd) }, *flags)
        })
        .collect();
    poll::poll(&mut poll_fds, timeout_ms).context("polling fds")?;

    Ok(specs
        .iter()
        .zip(poll_fds.iter())
        .filter_map(|((fd, _), poll_fd)| {
            poll_fd.revents().filter(|r| !r.is_empty()).map(|r| (*fd, r))
        })
        .collect())
}

/// Ignore SIGPIPE process-wide. A peer hanging up mid-write is a
/// routine state transition for every hexe process, never a reason to
/// die.
pub fn ignore_sigpipe() -> anyhow::Result<()> {
    use nix::sys::signal;

    // Safety: SigIgn for SIGPIPE does not involve a handler function,
    //         so there are no async-signal-safety concerns.
    unsafe {
        signal::signal(signal::Signal::SIGPIPE, signal::SigHandler::SigIgn)
            .context("ignoring SIGPIPE")?;
    }
    Ok(())
}
