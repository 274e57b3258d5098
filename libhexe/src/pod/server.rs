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

//! The pod process: owns one pty and the shell inside it, keeps the
//! replay backlog, scrapes shell metadata out of /proc on a timer, and
//! serves VT bytes to whichever single client ses currently has
//! attached.

use std::{
    ffi::OsString,
    fs,
    io::{self, Read, Write},
    os::unix::{
        io::{AsRawFd, RawFd},
        net::{UnixListener, UnixStream},
        process::CommandExt as _,
    },
    path::{Path, PathBuf},
    process,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time,
};

use anyhow::{anyhow, Context};
use hexe_protocol::{
    decode_resize, handshake, ControlMessage, CwdChanged, Exited, FgChanged, FrameKind, MsgType,
    PodRegister, PodShellEvent, PodVtHeader, ShpPromptResp, ShpShellEvent, Uuid,
};
use nix::{
    poll::PollFlags,
    sys::{
        signal::{self, Signal},
        wait::{self, WaitPidFlag, WaitStatus},
    },
    unistd::Pid,
};
use signal_hook::consts::TERM_SIGNALS;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::{
    config, consts,
    framing::{CtlDecoder, PodVtDecoder},
    net,
    pod::{backlog::Backlog, uplink::Uplink},
    proc_inspect::{self, Foreground, ProcInspector},
    protocol, tty, user,
};

const DEFAULT_PATH: &str = "/usr/bin:/bin:/usr/sbin:/sbin";

/// How long a half-finished handshake may sit around before we drop
/// it.
const PENDING_TIMEOUT: time::Duration = time::Duration::from_secs(5);

const CHILD_KILL_TIMEOUT: time::Duration = time::Duration::from_millis(500);

pub struct Args {
    pub uuid: Uuid,
    pub socket: PathBuf,
    pub shell: Option<String>,
    pub cwd: Option<String>,
    pub name: Option<String>,
    pub cols: u16,
    pub rows: u16,
}

/// The single VT client (the ses side of C3). At most one at a time; a
/// new handshake replaces the old one.
struct VtClient {
    stream: UnixStream,
    decoder: PodVtDecoder,
    outbuf: Vec<u8>,
    out_off: usize,
}

impl VtClient {
    fn new(stream: UnixStream) -> Self {
        VtClient { stream, decoder: PodVtDecoder::new(), outbuf: Vec::new(), out_off: 0 }
    }

    fn queue_frame(&mut self, kind: FrameKind, payload: &[u8]) {
        let header = PodVtHeader { kind, len: payload.len() as u32 };
        self.outbuf.extend_from_slice(&header.encode());
        self.outbuf.extend_from_slice(payload);
    }

    /// Push buffered bytes toward the socket. Ok(false) means the
    /// client is gone.
    fn flush(&mut self) -> anyhow::Result<bool> {
        while self.out_off < self.outbuf.len() {
            match self.stream.write(&self.outbuf[self.out_off..]) {
                Ok(0) => return Ok(false),
                Ok(n) => self.out_off += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::BrokenPipe => return Ok(false),
                Err(e) => return Err(e).context("flushing vt client"),
            }
        }
        if self.out_off == self.outbuf.len() {
            self.outbuf.clear();
            self.out_off = 0;
        }
        Ok(true)
    }

    fn has_pending_output(&self) -> bool {
        self.out_off < self.outbuf.len()
    }

    fn pending_out(&self) -> usize {
        self.outbuf.len() - self.out_off
    }
}

enum Pending {
    /// Waiting for the channel selector byte.
    Selector,
    /// A shp hook connection: one control message, then close.
    Shp(CtlDecoder),
}

struct PendingConn {
    stream: UnixStream,
    state: Pending,
    since: time::Instant,
}

/// An auxiliary input injector: frames in, nothing out, closed by the
/// peer.
struct Injector {
    stream: UnixStream,
    decoder: PodVtDecoder,
}

pub struct PodServer {
    uuid: Uuid,
    name: Option<String>,
    socket_path: PathBuf,
    alias_path: Option<PathBuf>,
    listener: UnixListener,
    master: shpool_pty::fork::Master,
    // keeps the master fd alive; only used via `master`
    _pty: shpool_pty::fork::Fork,
    child_pid: i32,
    size: tty::Size,
    backlog: Backlog,
    client: Option<VtClient>,
    pending: Vec<PendingConn>,
    injectors: Vec<Injector>,
    uplink: Uplink,
    inspector: Box<dyn ProcInspector>,
    last_cwd: Option<String>,
    last_fg: Option<Foreground>,
    term_flag: Arc<AtomicBool>,
}

#[instrument(skip_all, fields(uuid = %args.uuid))]
pub fn run(config: config::Config, args: Args) -> anyhow::Result<()> {
    net::ignore_sigpipe()?;

    let term_flag = Arc::new(AtomicBool::new(false));
    for sig in TERM_SIGNALS {
        signal_hook::flag::register(*sig, Arc::clone(&term_flag))
            .context("registering term signal flag")?;
    }

    // bind before forking the shell so the ready line is honest
    let _ = fs::remove_file(&args.socket);
    let listener = UnixListener::bind(&args.socket).context("binding pod socket")?;
    listener.set_nonblocking(true).context("marking listener nonblocking")?;

    let alias_path = match &args.name {
        Some(name) => {
            let alias = crate::paths::pod_alias(name)?;
            let _ = fs::remove_file(&alias);
            std::os::unix::fs::symlink(&args.socket, &alias)
                .context("linking pod alias socket")?;
            Some(alias)
        }
        None => None,
    };

    let user_info = user::info().context("resolving user info")?;
    let mut cmd = build_shell_cmd(&config, &args, &user_info)?;

    info!("about to fork shell");
    let fork = shpool_pty::fork::Fork::from_ptmx().context("forking pty")?;
    if fork.is_child().is_ok() {
        for fd in consts::STDERR_FD + 1..(nix::unistd::SysconfVar::OPEN_MAX as i32) {
            let _ = nix::unistd::close(fd);
        }
        let err = cmd.exec();
        eprintln!("shell exec err: {err:?}");
        std::process::exit(1);
    }

    let master = fork.is_parent().context("resolving pty master")?;
    let child_pid = fork.child_pid().ok_or(anyhow!("missing child pid"))?;
    info!("forked shell pid={}", child_pid);

    let size = tty::Size { cols: args.cols, rows: args.rows };
    if let Some(fd) = *master.raw_fd() {
        if let Err(e) = size.set_fd(fd) {
            warn!("could not set initial pty size: {:?}", e);
        }
    }

    let ses_socket = crate::paths::ses_socket_from_env()?;
    let uplink = Uplink::new(
        ses_socket,
        args.uuid,
        PodRegister {
            uuid: args.uuid,
            pod_pid: process::id() as i32,
            child_pid,
            cols: args.cols,
            rows: args.rows,
            socket_path: args.socket.to_string_lossy().into_owned(),
        },
    );

    let backlog_bytes = config.backlog_bytes.unwrap_or(consts::BACKLOG_BYTES);
    let mut server = PodServer {
        uuid: args.uuid,
        name: args.name,
        socket_path: args.socket,
        alias_path,
        listener,
        master,
        _pty: fork,
        child_pid,
        size,
        backlog: Backlog::new(backlog_bytes),
        client: None,
        pending: vec![],
        injectors: vec![],
        uplink,
        inspector: proc_inspect::inspector(),
        last_cwd: None,
        last_fg: None,
        term_flag,
    };

    // the structured ready line ses waits for before dialing C3
    println!("ready {}", server.socket_path.display());
    io::stdout().flush().context("flushing ready line")?;

    server.serve()
}

impl PodServer {
    fn serve(&mut self) -> anyhow::Result<()> {
        let mut next_tick = time::Instant::now() + consts::POD_TICK;
        loop {
            if self.term_flag.load(Ordering::Relaxed) {
                info!("term signal seen, hanging up the shell");
                let status = self.kill_child()?;
                return self.finish(status);
            }

            let specs = self.poll_specs();
            let timeout_ms = next_tick
                .saturating_duration_since(time::Instant::now())
                .as_millis()
                .min(consts::POD_TICK.as_millis()) as u16;
            let ready = match net::wait_ready(&specs, timeout_ms) {
                Ok(r) => r,
                Err(e) if is_eintr(&e) => continue,
                Err(e) => return Err(e),
            };

            let pty_fd = *self.master.raw_fd();
            for (fd, revents) in ready {
                if fd == self.listener.as_raw_fd() {
                    self.accept_ready();
                } else if Some(fd) == pty_fd {
                    if let Some(status) = self.pty_ready()? {
                        return self.finish(status);
                    }
                } else if self.client.as_ref().map(|c| c.stream.as_raw_fd()) == Some(fd) {
                    self.client_ready(revents);
                } else if self.uplink.raw_fd() == Some(fd) {
                    self.uplink_ready();
                } else if self.pending.iter().any(|p| p.stream.as_raw_fd() == fd) {
                    self.pending_ready(fd);
                } else if self.injectors.iter().any(|i| i.stream.as_raw_fd() == fd) {
                    self.injector_ready(fd);
                }
            }

            let now = time::Instant::now();
            if now >= next_tick {
                next_tick = now + consts::POD_TICK;
                if let Some(status) = self.reap()? {
                    return self.finish(status);
                }
                self.scrape_metadata(false);
                self.pending.retain(|p| now.duration_since(p.since) < PENDING_TIMEOUT);
            }
        }
    }

    fn poll_specs(&self) -> Vec<(RawFd, PollFlags)> {
        let mut specs = vec![(self.listener.as_raw_fd(), PollFlags::POLLIN)];

        // With no client the backlog is the only sink, so once it is
        // full we simply stop reading the pty. That is the whole
        // backpressure story.
        let budget = self.pty_read_budget();
        if budget > 0 {
            if let Some(fd) = *self.master.raw_fd() {
                specs.push((fd, PollFlags::POLLIN));
            }
        }

        if let Some(client) = self.client.as_ref() {
            let mut interest = PollFlags::POLLIN;
            if client.has_pending_output() {
                interest |= PollFlags::POLLOUT;
            }
            specs.push((client.stream.as_raw_fd(), interest));
        }
        if let Some(fd) = self.uplink.raw_fd() {
            specs.push((fd, PollFlags::POLLIN));
        }
        for p in self.pending.iter() {
            specs.push((p.stream.as_raw_fd(), PollFlags::POLLIN));
        }
        for i in self.injectors.iter() {
            specs.push((i.stream.as_raw_fd(), PollFlags::POLLIN));
        }
        specs
    }

    fn pty_read_budget(&self) -> usize {
        match self.client.as_ref() {
            // a client that is not draining pushes the pressure all
            // the way back into the shell's pty buffer
            Some(client) if client.pending_out() > consts::VT_WRITE_HIGH_WATER => 0,
            Some(_) => consts::BUF_SIZE,
            None => self.backlog.free().min(consts::BUF_SIZE),
        }
    }

    fn accept_ready(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, _)) => {
                    if let Err(e) = net::check_peer(&stream) {
                        warn!("rejecting connection: {:?}", e);
                        continue;
                    }
                    if let Err(e) = stream.set_nonblocking(true) {
                        warn!("could not mark conn nonblocking: {:?}", e);
                        continue;
                    }
                    self.pending.push(PendingConn {
                        stream,
                        state: Pending::Selector,
                        since: time::Instant::now(),
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    error!("accepting stream: {:?}", e);
                    break;
                }
            }
        }
    }

    /// Returns the child exit status when the pty read says the shell
    /// is gone.
    fn pty_ready(&mut self) -> anyhow::Result<Option<i32>> {
        let mut buf = [0u8; consts::BUF_SIZE];
        let budget = self.pty_read_budget();
        if budget == 0 {
            return Ok(None);
        }
        let mut master = self.master;
        let nread = match master.read(&mut buf[..budget]) {
            Ok(0) => return Ok(self.reap_blocking()?.into()),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
            Err(e) if e.raw_os_error() == Some(libc::EIO) => {
                // EIO from a pty master means the slave side is closed
                return Ok(self.reap_blocking()?.into());
            }
            Err(e) => return Err(e).context("reading pty master"),
        };
        let bytes = &buf[..nread];
        trace!("read pty len={}", nread);

        if let Some(client) = self.client.as_mut() {
            self.backlog.push_rolling(bytes);
            client.queue_frame(FrameKind::Output, bytes);
            if !client.flush().unwrap_or(false) {
                info!("client write failed, dropping client");
                self.client = None;
            }
        } else {
            self.backlog.push_bounded(bytes);
        }
        Ok(None)
    }

    fn client_ready(&mut self, revents: PollFlags) {
        let mut drop_client = false;
        if let Some(client) = self.client.as_mut() {
            if revents.intersects(PollFlags::POLLOUT) {
                drop_client = !client.flush().unwrap_or(false);
            }
            if revents.intersects(PollFlags::POLLIN | PollFlags::POLLHUP) && !drop_client {
                let mut buf = [0u8; consts::BUF_SIZE];
                match client.stream.read(&mut buf) {
                    Ok(0) => drop_client = true,
                    Ok(n) => client.decoder.extend(&buf[..n]),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                    Err(e) => {
                        info!("client read failed: {:?}", e);
                        drop_client = true;
                    }
                }
            }
        }
        if drop_client {
            info!("vt client disconnected");
            self.client = None;
            return;
        }

        loop {
            let next = match self.client.as_mut() {
                Some(client) => client.decoder.next(),
                None => break,
            };
            match next {
                Ok(Some(frame)) => self.handle_vt_frame(frame.0, &frame.1),
                Ok(None) => break,
                Err(e) => {
                    warn!("poisoned vt client stream: {:?}", e);
                    self.client = None;
                    break;
                }
            }
        }
    }

    fn handle_vt_frame(&mut self, header: PodVtHeader, payload: &[u8]) {
        match header.kind {
            FrameKind::Input => {
                let mut master = self.master;
                if let Err(e) = master.write_all(payload) {
                    warn!("writing input to pty: {:?}", e);
                }
            }
            FrameKind::Resize => match decode_resize(payload) {
                Ok((cols, rows)) => {
                    let size = tty::Size { cols, rows };
                    if let Some(fd) = *self.master.raw_fd() {
                        if let Err(e) = size.set_fd(fd) {
                            warn!("applying resize: {:?}", e);
                        }
                    }
                    self.size = size;
                    debug!("resized to cols={} rows={}", cols, rows);
                }
                Err(e) => warn!("bad resize payload: {:?}", e),
            },
            kind => {
                debug!("ignoring unexpected {:?} frame from client", kind);
            }
        }
    }

    /// Swap in a freshly handshaken VT client: drain the ring into it,
    /// mark the end of the replay, clear the ring, stream live bytes
    /// from then on. No byte is duplicated or skipped across the
    /// cutover because the ring holds exactly the bytes the new client
    /// has not seen the live stream deliver.
    fn attach_client(&mut self, stream: UnixStream, carryover: &[u8]) {
        if self.client.is_some() {
            info!("replacing existing vt client");
        }
        let mut client = VtClient::new(stream);
        client.decoder.extend(carryover);

        // a fresh seat gets the pty at the last size we were told
        if let Some(fd) = *self.master.raw_fd() {
            if let Err(e) = self.size.set_fd(fd) {
                warn!("re-asserting pty size: {:?}", e);
            }
        }

        self.backlog.for_chunks(consts::BUF_SIZE, |chunk| {
            client.queue_frame(FrameKind::Output, chunk);
        });
        client.queue_frame(FrameKind::BacklogEnd, &[]);
        self.backlog.clear();

        if client.flush().unwrap_or(false) {
            info!("vt client attached, replayed backlog");
            self.client = Some(client);
        } else {
            info!("vt client hung up during backlog replay");
            self.client = None;
        }
        self.scrape_metadata(true);
    }

    fn pending_ready(&mut self, fd: RawFd) {
        let Some(idx) = self.pending.iter().position(|p| p.stream.as_raw_fd() == fd) else {
            return;
        };
        let mut conn = self.pending.swap_remove(idx);

        let mut buf = [0u8; consts::BUF_SIZE];
        let nread = match conn.stream.read(&mut buf) {
            Ok(0) => return, // hup before handshake, drop
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.pending.push(conn);
                return;
            }
            Err(e) => {
                info!("pending conn read failed: {:?}", e);
                return;
            }
        };
        let bytes = &buf[..nread];

        match conn.state {
            Pending::Selector => {
                let selector = bytes[0];
                let rest = &bytes[1..];
                match selector {
                    handshake::POD_VT => self.attach_client(conn.stream, rest),
                    handshake::POD_SHP => {
                        let mut decoder = CtlDecoder::new();
                        decoder.extend(rest);
                        conn.state = Pending::Shp(decoder);
                        if !self.drive_shp(&mut conn) {
                            self.pending.push(conn);
                        }
                    }
                    handshake::POD_INJECT => {
                        let mut decoder = PodVtDecoder::new();
                        decoder.extend(rest);
                        let mut injector = Injector { stream: conn.stream, decoder };
                        if self.drive_injector(&mut injector) {
                            self.injectors.push(injector);
                        }
                    }
                    other => {
                        info!("unknown handshake byte {:#04x}, closing", other);
                    }
                }
            }
            Pending::Shp(ref mut decoder) => {
                decoder.extend(bytes);
                if !self.drive_shp(&mut conn) {
                    self.pending.push(conn);
                }
            }
        }
    }

    /// Process a shp connection. Returns true once the connection is
    /// finished with (one message, one optional reply, close).
    fn drive_shp(&mut self, conn: &mut PendingConn) -> bool {
        let Pending::Shp(decoder) = &mut conn.state else {
            return true;
        };
        let (msg_type, payload) = match decoder.next() {
            Ok(Some(msg)) => msg,
            Ok(None) => return false,
            Err(e) => {
                info!("malformed shp traffic: {:?}", e);
                return true;
            }
        };
        match MsgType::try_from(msg_type) {
            Ok(MsgType::ShpShellEvent) => match ShpShellEvent::decode_payload(&payload) {
                Ok(msg) => {
                    debug!("forwarding shell event phase={:?}", msg.event.phase);
                    self.uplink.send(&PodShellEvent { uuid: self.uuid, event: msg.event });
                }
                Err(e) => info!("bad shp_shell_event: {:?}", e),
            },
            Ok(MsgType::ShpPromptReq) => {
                let text = match &self.name {
                    Some(name) => format!("{} {}", name, self.uuid),
                    None => self.uuid.to_hex(),
                };
                let _ = conn.stream.set_nonblocking(false);
                let _ = conn.stream.set_write_timeout(Some(consts::SOCK_STREAM_TIMEOUT));
                if let Err(e) = protocol::write_control(&mut conn.stream, &ShpPromptResp { text })
                {
                    info!("writing prompt resp: {:?}", e);
                }
            }
            other => {
                info!("unexpected shp message {:?}", other);
            }
        }
        true
    }

    fn injector_ready(&mut self, fd: RawFd) {
        let Some(idx) = self.injectors.iter().position(|i| i.stream.as_raw_fd() == fd) else {
            return;
        };
        let mut injector = self.injectors.swap_remove(idx);
        let mut buf = [0u8; consts::BUF_SIZE];
        match injector.stream.read(&mut buf) {
            Ok(0) => return, // peer done
            Ok(n) => injector.decoder.extend(&buf[..n]),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => {
                info!("injector read failed: {:?}", e);
                return;
            }
        }
        if self.drive_injector(&mut injector) {
            self.injectors.push(injector);
        }
    }

    /// Feed decoded injector frames into the pty. Returns false if the
    /// stream turned out to be poisoned.
    fn drive_injector(&mut self, injector: &mut Injector) -> bool {
        loop {
            match injector.decoder.next() {
                Ok(Some((header, payload))) => {
                    if let FrameKind::Input = header.kind {
                        let mut master = self.master;
                        if let Err(e) = master.write_all(&payload) {
                            warn!("injecting input: {:?}", e);
                        }
                    }
                }
                Ok(None) => return true,
                Err(e) => {
                    info!("poisoned injector stream: {:?}", e);
                    return false;
                }
            }
        }
    }

    fn uplink_ready(&mut self) {
        for (msg_type, _payload) in self.uplink.read_ready() {
            match MsgType::try_from(msg_type) {
                Ok(MsgType::QueryState) => {
                    debug!("ses asked for a state push");
                    self.scrape_metadata(true);
                }
                other => debug!("ignoring uplink message {:?}", other),
            }
        }
    }

    /// The tick scraper: read the shell's cwd and foreground process
    /// out of /proc and push changes (or everything, when forced) up
    /// C4.
    fn scrape_metadata(&mut self, force: bool) {
        let cwd = match self.inspector.cwd(self.child_pid) {
            Ok(p) => Some(p.to_string_lossy().into_owned()),
            Err(e) => {
                trace!("cwd scrape failed: {:?}", e);
                None
            }
        };
        if let Some(cwd) = cwd {
            if force || self.last_cwd.as_deref() != Some(cwd.as_str()) {
                self.uplink.send(&CwdChanged { uuid: self.uuid, cwd: cwd.clone() });
                self.last_cwd = Some(cwd);
            }
        }

        let fg = match self.inspector.foreground(self.child_pid) {
            Ok(fg) => Some(fg),
            Err(e) => {
                trace!("fg scrape failed: {:?}", e);
                None
            }
        };
        if let Some(fg) = fg {
            if force || self.last_fg.as_ref() != Some(&fg) {
                self.uplink.send(&FgChanged {
                    uuid: self.uuid,
                    fg_pid: fg.pid,
                    name: fg.name.clone(),
                });
                self.last_fg = Some(fg);
            }
        }
    }

    /// Non-blocking reap. Some(status) once the child is gone.
    fn reap(&mut self) -> anyhow::Result<Option<i32>> {
        match wait::waitpid(Pid::from_raw(self.child_pid), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => Ok(None),
            Ok(WaitStatus::Exited(_, status)) => Ok(Some(status)),
            Ok(WaitStatus::Signaled(_, sig, _)) => Ok(Some(128 + sig as i32)),
            Ok(_) => Ok(None),
            Err(nix::errno::Errno::ECHILD) => Ok(Some(1)),
            Err(e) => Err(e).context("reaping child"),
        }
    }

    /// Wait for the child to go away after we saw the pty close.
    fn reap_blocking(&mut self) -> anyhow::Result<i32> {
        match wait::waitpid(Pid::from_raw(self.child_pid), None) {
            Ok(WaitStatus::Exited(_, status)) => Ok(status),
            Ok(WaitStatus::Signaled(_, sig, _)) => Ok(128 + sig as i32),
            Ok(_) => Ok(1),
            Err(nix::errno::Errno::ECHILD) => Ok(1),
            Err(e) => Err(e).context("waiting for child"),
        }
    }

    /// SIGHUP then SIGKILL. Shells treat SIGHUP as the terminal going
    /// away, which is exactly what is happening.
    fn kill_child(&mut self) -> anyhow::Result<i32> {
        let pid = Pid::from_raw(self.child_pid);
        let _ = signal::kill(pid, Signal::SIGHUP);
        let deadline = time::Instant::now() + CHILD_KILL_TIMEOUT;
        loop {
            if let Some(status) = self.reap()? {
                return Ok(status);
            }
            if time::Instant::now() >= deadline {
                info!("child ignored SIGHUP, no longer being polite");
                let _ = signal::kill(pid, Signal::SIGKILL);
                return self.reap_blocking();
            }
            std::thread::sleep(time::Duration::from_millis(20));
        }
    }

    /// The exit protocol: drain what we can to the client, tell ses,
    /// clean the socket files up, go away.
    fn finish(&mut self, status: i32) -> anyhow::Result<()> {
        info!("child exited with status {}", status);
        if let Some(client) = self.client.as_mut() {
            let deadline = time::Instant::now() + time::Duration::from_secs(1);
            while client.has_pending_output() && time::Instant::now() < deadline {
                match client.flush() {
                    Ok(true) => std::thread::sleep(time::Duration::from_millis(10)),
                    _ => break,
                }
            }
        }
        self.uplink.send(&Exited { uuid: self.uuid, status });
        let _ = fs::remove_file(&self.socket_path);
        if let Some(alias) = &self.alias_path {
            let _ = fs::remove_file(alias);
        }
        Ok(())
    }
}

fn is_eintr(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<nix::errno::Errno>(), Some(nix::errno::Errno::EINTR))
}

/// Build the command the shell child will exec, teacher-style: curated
/// environment, login-shell arg0 for the user's default shell, rc
/// loading suppressed on request.
fn build_shell_cmd(
    config: &config::Config,
    args: &Args,
    user_info: &user::Info,
) -> anyhow::Result<process::Command> {
    let shell = args
        .shell
        .clone()
        .or_else(|| config.shell.clone())
        .unwrap_or_else(|| user_info.default_shell.clone());

    let custom = args.shell.is_some() && shell.contains(char::is_whitespace);
    let mut cmd = if custom {
        let parts = shell_words::split(&shell).context("parsing shell command")?;
        if parts.is_empty() {
            return Err(anyhow!("no shell to run"));
        }
        let mut cmd = process::Command::new(&parts[0]);
        cmd.args(&parts[1..]);
        cmd
    } else {
        let mut cmd = process::Command::new(&shell);
        if config.norc.unwrap_or(false) {
            if shell.ends_with("bash") {
                cmd.arg("--norc").arg("--noprofile");
            } else if shell.ends_with("zsh") {
                cmd.arg("--no-rcs");
            } else if shell.ends_with("fish") {
                cmd.arg("--no-config");
            }
        }
        // spawn as a login shell by setting arg0 to "-<basename>",
        // the same trick sshd uses
        let shell_basename = Path::new(&shell)
            .file_name()
            .ok_or(anyhow!("error building login shell indicator"))?
            .to_str()
            .ok_or(anyhow!("error parsing shell name as utf8"))?;
        cmd.arg0(format!("-{shell_basename}"));
        cmd
    };

    let start_dir = match args.cwd.as_deref() {
        Some(dir) => String::from(dir),
        None => user_info.home_dir.clone(),
    };

    fn s(v: impl AsRef<std::ffi::OsStr>) -> OsString {
        v.as_ref().to_os_string()
    }
    let pane_uuid = args.uuid.to_hex();
    let pod_name = args.name.clone().unwrap_or_default();
    let instance = crate::paths::instance();
    let mut env: Vec<(OsString, OsString)> = vec![
        (s("HOME"), s(&user_info.home_dir)),
        (s("PATH"), s(DEFAULT_PATH)),
        (s("SHELL"), s(&user_info.default_shell)),
        (s("USER"), s(&user_info.user)),
        (s(consts::ENV_POD_SOCKET), args.socket.clone().into_os_string()),
        (s(consts::ENV_PANE_UUID), s(&pane_uuid)),
        (s(consts::ENV_POD_NAME), s(&pod_name)),
        (s(consts::ENV_INSTANCE), s(&instance)),
    ];
    if let Ok(term) = std::env::var("TERM") {
        env.push((s("TERM"), s(&term)));
    }
    if let Ok(ses_sock) = std::env::var(consts::ENV_SES_SOCKET) {
        env.push((s(consts::ENV_SES_SOCKET), s(&ses_sock)));
    }
    if let Some(extra) = config.env.as_ref() {
        env.extend(extra.iter().map(|(k, v)| (s(k), s(v))));
    }

    cmd.current_dir(start_dir)
        .stdin(process::Stdio::inherit())
        .stdout(process::Stdio::inherit())
        .stderr(process::Stdio::inherit())
        .env_clear()
        .envs(env);

    Ok(cmd)
}
