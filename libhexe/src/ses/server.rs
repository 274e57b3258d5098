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

//! The ses router: a single-threaded poll loop that owns every
//! connection, splices VT frames between muxes and pods by rewrapping
//! one frame header into the other, and runs the whole control surface
//! against the registry. Ses never parses VT payloads and never blocks
//! on a write; bytes that can't go out now sit in a per-connection
//! buffer until the fd is writable again.

use std::{
    collections::HashMap,
    fs, io,
    io::{Read, Write},
    os::unix::{
        io::{AsRawFd, RawFd},
        net::{UnixListener, UnixStream},
    },
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time,
};

use anyhow::{anyhow, Context};
use hexe_protocol::{
    encode_control, handshake, AdoptPane, ControlHeader, ControlMessage, CreatePane, Detach,
    DestroyPane, Disconnect, DisconnectMode, ErrorReply, ExitIntent, ExitIntentResult, FindSticky,
    FloatCreated, FloatRequest, FloatResult, FrameKind, GetPaneCwd, KillPane, LayoutSync,
    MsgType, MuxVtHeader, Notify, OkReply, OrphanPane, OrphanedPanes, PaneCreated, PaneExited,
    PaneFound, PaneId, PaneInfo, PaneNotFound, PaneState, PodRegister, PodVtHeader, Pong,
    PopChoose, PopConfirm, PopResponse, QueryState, Reattach, Register, Registered, SendKeys,
    SessionDetached, SessionEntry, SessionReattached, SessionState, SessionsList, SetSticky,
    Status, SyncState, TargetedNotify, UpdatePaneAux, UpdatePaneName, UpdatePaneShell, Uuid,
    CONTROL_HEADER_LEN,
};
use nix::{
    poll::PollFlags,
    sys::{
        signal::{self, Signal},
        wait::{self, WaitPidFlag, WaitStatus},
    },
    unistd::Pid,
};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::{
    config, consts,
    framing::{CtlDecoder, MuxVtDecoder, PodVtDecoder},
    net,
    ses::{
        persist,
        registry::{ClientId, DetachedSession, Pane, PaneAttrs, PrefixMatch, Registry, Target},
        slots::Slots,
        spawn::{self, PodSpec},
    },
};

/// How long a half-finished handshake may sit around.
const PENDING_TIMEOUT: time::Duration = time::Duration::from_secs(10);

const PERSIST_INTERVAL: time::Duration = time::Duration::from_secs(1);

#[derive(Debug)]
enum ConnKind {
    /// Waiting for the channel selector byte.
    PendingSelector,
    /// A C1 handshake waiting for its `register` frame.
    PendingRegister,
    /// A C2 handshake waiting for 32 hex chars of session id.
    PendingSessionHex { buf: Vec<u8> },
    /// A C4 handshake waiting for 16 raw uuid bytes.
    PendingPodUuid { buf: Vec<u8> },
    ClientCtl { client_id: ClientId },
    ClientVt { client_id: ClientId },
    PodVt { uuid: Uuid },
    PodCtl { uuid: Uuid },
    Cli,
}

#[derive(Copy, Clone, Debug)]
enum Source {
    Mux(ClientId),
    Cli,
    Pod(Uuid),
}

struct Conn {
    stream: UnixStream,
    kind: ConnKind,
    ctl: CtlDecoder,
    mux_vt: MuxVtDecoder,
    pod_vt: PodVtDecoder,
    outbuf: Vec<u8>,
    out_off: usize,
    close_after_flush: bool,
    since: time::Instant,
}

impl Conn {
    fn new(stream: UnixStream, kind: ConnKind) -> Self {
        Conn {
            stream,
            kind,
            ctl: CtlDecoder::new(),
            mux_vt: MuxVtDecoder::new(),
            pod_vt: PodVtDecoder::new(),
            outbuf: Vec::new(),
            out_off: 0,
            close_after_flush: false,
            since: time::Instant::now(),
        }
    }

    fn pending_out(&self) -> usize {
        self.outbuf.len() - self.out_off
    }
}

pub struct Server {
    config: config::Config,
    socket_path: PathBuf,
    state_file: PathBuf,
    registry: Registry,
    conns: HashMap<RawFd, Conn>,
    /// The routing fast path, kept mirrored: pane id to pod VT fd and
    /// back. Entries exist exactly while a pane is streaming.
    pane_routes: HashMap<PaneId, RawFd>,
    pod_vt_routes: HashMap<RawFd, PaneId>,
    slots: Slots,
    stop: Arc<AtomicBool>,
    last_persist: time::Instant,
}

impl Server {
    pub fn new(
        config: config::Config,
        socket_path: PathBuf,
        state_file: PathBuf,
        registry: Registry,
        stop: Arc<AtomicBool>,
    ) -> Self {
        Server {
            config,
            socket_path,
            state_file,
            registry,
            conns: HashMap::new(),
            pane_routes: HashMap::new(),
            pod_vt_routes: HashMap::new(),
            slots: Slots::default(),
            stop,
            last_persist: time::Instant::now(),
        }
    }

    #[instrument(skip_all)]
    pub fn serve(&mut self, listener: UnixListener) -> anyhow::Result<()> {
        listener.set_nonblocking(true).context("marking listener nonblocking")?;
        let listener_fd = listener.as_raw_fd();
        info!("serving on {:?}", self.socket_path);

        loop {
            if self.stop.load(Ordering::Relaxed) {
                info!("stop flag seen, shutting down");
                self.persist(true);
                let _ = fs::remove_file(&self.socket_path);
                return Ok(());
            }

            let specs = self.poll_specs(listener_fd);
            let ready =
                match net::wait_ready(&specs, consts::SES_TICK.as_millis() as u16) {
                    Ok(r) => r,
                    Err(e) if is_eintr(&e) => continue,
                    Err(e) => return Err(e),
                };

            for (fd, revents) in ready {
                if fd == listener_fd {
                    self.accept_ready(&listener);
                } else {
                    self.conn_ready(fd, revents);
                }
            }

            self.tick();
        }
    }

    fn poll_specs(&self, listener_fd: RawFd) -> Vec<(RawFd, PollFlags)> {
        let mut specs = vec![(listener_fd, PollFlags::POLLIN)];
        for (fd, conn) in self.conns.iter() {
            let mut interest = PollFlags::empty();
            if self.wants_reads(conn) {
                interest |= PollFlags::POLLIN;
            }
            if conn.pending_out() > 0 {
                interest |= PollFlags::POLLOUT;
            }
            if !interest.is_empty() {
                specs.push((*fd, interest));
            }
        }
        specs
    }

    /// Reads are always welcome except from a pod whose owning mux is
    /// too far behind: pausing those reads pushes the pressure into
    /// the pod's ring instead of growing our buffers without bound.
    fn wants_reads(&self, conn: &Conn) -> bool {
        let ConnKind::PodVt { uuid } = &conn.kind else {
            return true;
        };
        let Some(dest) = self.mux_vt_dest(uuid) else {
            // no attached client; keep reading and discard to keep the
            // pod unblocked
            return true;
        };
        self.conns.get(&dest).map(|c| c.pending_out() < consts::VT_WRITE_HIGH_WATER).unwrap_or(true)
    }

    /// Where output frames for this pane should go: the owning mux's
    /// C2 fd, if the owner is attached.
    fn mux_vt_dest(&self, uuid: &Uuid) -> Option<RawFd> {
        let pane = self.registry.panes.get(uuid)?;
        let owner = pane.owner?;
        self.registry.clients.get(&owner)?.vt_fd
    }

    fn accept_ready(&mut self, listener: &UnixListener) {
        loop {
            match listener.accept() {
                Ok((stream, _)) => {
                    if let Err(e) = net::check_peer(&stream) {
                        warn!("rejecting connection: {:?}", e);
                        continue;
                    }
                    if let Err(e) = stream.set_nonblocking(true) {
                        warn!("could not mark conn nonblocking: {:?}", e);
                        continue;
                    }
                    let fd = stream.as_raw_fd();
                    trace!("accepted fd={}", fd);
                    self.conns.insert(fd, Conn::new(stream, ConnKind::PendingSelector));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    error!("accepting stream: {:?}", e);
                    break;
                }
            }
        }
    }

    fn conn_ready(&mut self, fd: RawFd, revents: PollFlags) {
        if revents.intersects(PollFlags::POLLOUT) && !self.flush_conn(fd) {
            return;
        }
        if !revents.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR) {
            return;
        }

        let mut buf = [0u8; consts::BUF_SIZE];
        let read_res = {
            let Some(conn) = self.conns.get_mut(&fd) else {
                return;
            };
            conn.stream.read(&mut buf)
        };
        match read_res {
            Ok(0) => {
                trace!("fd={} hup", fd);
                self.close_conn(fd);
            }
            Ok(n) => self.conn_bytes(fd, &buf[..n]),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => {
                debug!("fd={} read error: {:?}", fd, e);
                self.close_conn(fd);
            }
        }
    }

    fn conn_bytes(&mut self, fd: RawFd, bytes: &[u8]) {
        enum Route {
            Pending,
            Ctl(Source),
            ClientVt(ClientId),
            PodVt(Uuid),
        }
        let route = {
            let Some(conn) = self.conns.get(&fd) else {
                return;
            };
            match &conn.kind {
                ConnKind::PendingSelector
                | ConnKind::PendingRegister
                | ConnKind::PendingSessionHex { .. }
                | ConnKind::PendingPodUuid { .. } => Route::Pending,
                ConnKind::ClientCtl { client_id } => Route::Ctl(Source::Mux(*client_id)),
                ConnKind::Cli => Route::Ctl(Source::Cli),
                ConnKind::PodCtl { uuid } => Route::Ctl(Source::Pod(*uuid)),
                ConnKind::ClientVt { client_id } => Route::ClientVt(*client_id),
                ConnKind::PodVt { uuid } => Route::PodVt(*uuid),
            }
        };
        match route {
            Route::Pending => self.pending_bytes(fd, bytes),
            Route::Ctl(source) => {
                if let Some(conn) = self.conns.get_mut(&fd) {
                    conn.ctl.extend(bytes);
                }
                self.drive_ctl(fd, source);
            }
            Route::ClientVt(client_id) => {
                if let Some(conn) = self.conns.get_mut(&fd) {
                    conn.mux_vt.extend(bytes);
                }
                self.drive_client_vt(fd, client_id);
            }
            Route::PodVt(uuid) => {
                if let Some(conn) = self.conns.get_mut(&fd) {
                    conn.pod_vt.extend(bytes);
                }
                self.drive_pod_vt(fd, uuid);
            }
        }
    }

    //
    // handshakes
    //

    fn pending_bytes(&mut self, fd: RawFd, bytes: &[u8]) {
        enum Next {
            Register,
            SessionHex,
            PodUuid,
            Cli,
            Drop,
            Wait,
        }
        let next = {
            let Some(conn) = self.conns.get_mut(&fd) else {
                return;
            };
            if matches!(conn.kind, ConnKind::PendingSelector) {
                let selector = bytes[0];
                let rest = &bytes[1..];
                match selector {
                    handshake::SES_MUX_CONTROL => {
                        conn.kind = ConnKind::PendingRegister;
                        conn.ctl.extend(rest);
                        Next::Register
                    }
                    handshake::SES_MUX_VT => {
                        conn.kind = ConnKind::PendingSessionHex { buf: rest.to_vec() };
                        Next::SessionHex
                    }
                    handshake::SES_POD_CONTROL => {
                        conn.kind = ConnKind::PendingPodUuid { buf: rest.to_vec() };
                        Next::PodUuid
                    }
                    handshake::SES_CLI => {
                        conn.kind = ConnKind::Cli;
                        conn.ctl.extend(rest);
                        Next::Cli
                    }
                    other => {
                        info!("unknown handshake byte {:#04x}, closing", other);
                        Next::Drop
                    }
                }
            } else {
                match &mut conn.kind {
                    ConnKind::PendingRegister => {
                        conn.ctl.extend(bytes);
                        Next::Register
                    }
                    ConnKind::PendingSessionHex { buf } => {
                        buf.extend_from_slice(bytes);
                        Next::SessionHex
                    }
                    ConnKind::PendingPodUuid { buf } => {
                        buf.extend_from_slice(bytes);
                        Next::PodUuid
                    }
                    _ => Next::Wait,
                }
            }
        };
        match next {
            Next::Register => self.drive_pending_register(fd),
            Next::SessionHex => self.drive_pending_session_hex(fd),
            Next::PodUuid => self.drive_pending_pod_uuid(fd),
            Next::Cli => self.drive_ctl(fd, Source::Cli),
            Next::Drop => {
                self.conns.remove(&fd);
            }
            Next::Wait => {}
        }
    }

    fn drive_pending_register(&mut self, fd: RawFd) {
        let next = {
            let Some(conn) = self.conns.get_mut(&fd) else {
                return;
            };
            conn.ctl.next()
        };
        let (raw_type, payload) = match next {
            Ok(Some(frame)) => frame,
            Ok(None) => return,
            Err(e) => {
                info!("bad register handshake: {:?}", e);
                self.conns.remove(&fd);
                return;
            }
        };
        let msg = match MsgType::try_from(raw_type) {
            Ok(MsgType::Register) => match Register::decode_payload(&payload) {
                Ok(msg) => msg,
                Err(e) => {
                    info!("malformed register: {:?}", e);
                    self.conns.remove(&fd);
                    return;
                }
            },
            other => {
                info!("expected register, got {:?}; closing", other);
                self.conns.remove(&fd);
                return;
            }
        };

        // further handshakes past the client cap are closed immediately
        if self.registry.clients.len() >= consts::MAX_CLIENTS {
            warn!("client cap reached, refusing mux");
            self.conns.remove(&fd);
            return;
        }

        let name = if msg.name.is_empty() { None } else { Some(msg.name.clone()) };
        let client_id = self.registry.add_client(msg.session_id, name, msg.keepalive, fd);
        if let Some(conn) = self.conns.get_mut(&fd) {
            conn.kind = ConnKind::ClientCtl { client_id };
        }
        info!("registered mux client={} session={}", client_id, msg.session_id);
        self.queue_control(fd, &Registered {});

        // the mux may have pipelined more control traffic behind the
        // register frame
        self.drive_ctl(fd, Source::Mux(client_id));
    }

    fn drive_pending_session_hex(&mut self, fd: RawFd) {
        let hex = {
            let Some(conn) = self.conns.get_mut(&fd) else {
                return;
            };
            let ConnKind::PendingSessionHex { buf } = &mut conn.kind else {
                return;
            };
            if buf.len() < 32 {
                return;
            }
            let rest = buf.split_off(32);
            let hex = std::mem::take(buf);
            conn.mux_vt.extend(&rest);
            hex
        };

        let session_id = match std::str::from_utf8(&hex).ok().and_then(|s| Uuid::from_hex(s).ok())
        {
            Some(id) => id,
            None => {
                info!("bad session hex on vt handshake");
                self.conns.remove(&fd);
                return;
            }
        };

        let (client_id, old_vt) = {
            let Some(client) =
                self.registry.clients.values_mut().find(|c| c.session_id == session_id)
            else {
                info!("vt handshake for unknown session {}", session_id);
                self.conns.remove(&fd);
                return;
            };
            let old = client.vt_fd.replace(fd);
            (client.id, old)
        };

        if let Some(old_fd) = old_vt {
            debug!("closing prior vt stream fd={}", old_fd);
            self.conns.remove(&old_fd);
        }
        if let Some(conn) = self.conns.get_mut(&fd) {
            conn.kind = ConnKind::ClientVt { client_id };
        }
        info!("paired vt stream for client={}", client_id);

        // re-dial C3 for every owned pane so each pod runs its
        // replay-then-backlog_end protocol into this fresh stream
        let panes: Vec<Uuid> = self
            .registry
            .clients
            .get(&client_id)
            .map(|c| c.panes.clone())
            .unwrap_or_default();
        for uuid in panes {
            self.close_pane_vt(uuid);
        }
        self.connect_client_panes(client_id);
        self.drive_client_vt(fd, client_id);
    }

    fn drive_pending_pod_uuid(&mut self, fd: RawFd) {
        let raw = {
            let Some(conn) = self.conns.get_mut(&fd) else {
                return;
            };
            let ConnKind::PendingPodUuid { buf } = &mut conn.kind else {
                return;
            };
            if buf.len() < 16 {
                return;
            }
            let rest = buf.split_off(16);
            let raw = std::mem::take(buf);
            conn.ctl.extend(&rest);
            raw
        };
        let Ok(uuid) = Uuid::from_bytes(&raw) else {
            self.conns.remove(&fd);
            return;
        };

        if let Some(conn) = self.conns.get_mut(&fd) {
            conn.kind = ConnKind::PodCtl { uuid };
        }
        if let Some(pane) = self.registry.panes.get_mut(&uuid) {
            if let Some(old) = pane.ctl_fd.replace(fd) {
                self.conns.remove(&old);
            }
        }
        debug!("pod uplink attached for {}", uuid);
        self.drive_ctl(fd, Source::Pod(uuid));
    }

    //
    // VT routing
    //

    fn drive_client_vt(&mut self, fd: RawFd, client_id: ClientId) {
        loop {
            let next = {
                let Some(conn) = self.conns.get_mut(&fd) else {
                    return;
                };
                conn.mux_vt.next()
            };
            match next {
                Ok(Some(frame)) => self.forward_mux_frame(client_id, frame.0, &frame.1),
                Ok(None) => return,
                Err(e) => {
                    // protocol error: the stream framing is gone
                    info!("poisoned mux vt stream: {:?}", e);
                    self.close_conn(fd);
                    return;
                }
            }
        }
    }

    /// mux -> pod: rewrap the 7 byte header as a 5 byte header and
    /// splice the payload through. Unknown pane ids are dropped; ses
    /// never buffers VT beyond the write queue of the destination.
    fn forward_mux_frame(&mut self, client_id: ClientId, header: MuxVtHeader, payload: &[u8]) {
        let Some(pod_fd) = self.pane_routes.get(&header.pane_id).copied() else {
            trace!("dropping frame for unknown pane_id={}", header.pane_id);
            return;
        };
        // frames only flow into panes the sending mux owns
        let owned = {
            let uuid = match self.conns.get(&pod_fd).map(|c| &c.kind) {
                Some(ConnKind::PodVt { uuid }) => *uuid,
                _ => return,
            };
            self.registry
                .panes
                .get(&uuid)
                .map(|p| p.owner == Some(client_id))
                .unwrap_or(false)
        };
        if !owned {
            trace!("dropping frame for unowned pane_id={}", header.pane_id);
            return;
        }

        let pod_header = PodVtHeader { kind: header.kind, len: header.len };
        let mut frame = Vec::with_capacity(5 + payload.len());
        frame.extend_from_slice(&pod_header.encode());
        frame.extend_from_slice(payload);
        self.conn_write(pod_fd, &frame);
    }

    fn drive_pod_vt(&mut self, fd: RawFd, uuid: Uuid) {
        loop {
            let next = {
                let Some(conn) = self.conns.get_mut(&fd) else {
                    return;
                };
                conn.pod_vt.next()
            };
            match next {
                Ok(Some(frame)) => self.forward_pod_frame(fd, uuid, frame.0, &frame.1),
                Ok(None) => return,
                Err(e) => {
                    info!("poisoned pod vt stream: {:?}", e);
                    self.close_conn(fd);
                    return;
                }
            }
        }
    }

    /// pod -> mux: stamp the pane id into the 7 byte header. With no
    /// attached client the payload is discarded, which keeps the pod
    /// reading side drained.
    fn forward_pod_frame(
        &mut self,
        pod_fd: RawFd,
        uuid: Uuid,
        header: PodVtHeader,
        payload: &[u8],
    ) {
        let Some(pane_id) = self.pod_vt_routes.get(&pod_fd).copied() else {
            return;
        };
        let Some(dest) = self.mux_vt_dest(&uuid) else {
            trace!("discarding {} byte frame for clientless pane {}", payload.len(), uuid);
            return;
        };

        let mux_header = MuxVtHeader { pane_id, kind: header.kind, len: header.len };
        let mut frame = Vec::with_capacity(7 + payload.len());
        frame.extend_from_slice(&mux_header.encode());
        frame.extend_from_slice(payload);
        self.conn_write(dest, &frame);
    }

    //
    // control dispatch
    //

    fn drive_ctl(&mut self, fd: RawFd, source: Source) {
        loop {
            let next = {
                let Some(conn) = self.conns.get_mut(&fd) else {
                    return;
                };
                conn.ctl.next()
            };
            match next {
                Ok(Some(frame)) => self.dispatch_ctl(fd, source, frame.0, &frame.1),
                Ok(None) => return,
                Err(e) => {
                    info!("poisoned control stream: {:?}", e);
                    self.close_conn(fd);
                    return;
                }
            }
        }
    }

    fn dispatch_ctl(&mut self, fd: RawFd, source: Source, raw_type: u16, payload: &[u8]) {
        let Ok(msg_type) = MsgType::try_from(raw_type) else {
            debug!("unknown msg type {:#06x}", raw_type);
            self.reply_err(fd, source, "unknown_msg_type");
            return;
        };
        trace!("dispatch {:?} from {:?}", msg_type, source);

        macro_rules! parse {
            ($ty:ty) => {
                match <$ty>::decode_payload(payload) {
                    Ok(msg) => msg,
                    Err(e) => {
                        info!("malformed {:?} payload: {:?}", msg_type, e);
                        self.reply_err(fd, source, "malformed_payload");
                        return;
                    }
                }
            };
        }

        match (msg_type, source) {
            (MsgType::Ping, _) => self.reply(fd, source, &Pong {}),

            // session ops
            (MsgType::CreatePane, Source::Mux(id)) => {
                let msg = parse!(CreatePane);
                self.handle_create_pane(fd, id, msg);
            }
            (MsgType::Detach, Source::Mux(id)) => {
                let msg = parse!(Detach);
                self.handle_detach(fd, id, msg);
            }
            (MsgType::Reattach, Source::Mux(id)) => {
                let msg = parse!(Reattach);
                self.handle_reattach(fd, id, msg);
            }
            (MsgType::Disconnect, Source::Mux(id)) => {
                let msg = parse!(Disconnect);
                self.handle_disconnect(fd, id, msg);
            }
            (MsgType::LayoutSync, Source::Mux(id)) => {
                let msg = parse!(LayoutSync);
                if let Some(client) = self.registry.clients.get_mut(&id) {
                    client.layout = msg.layout;
                }
            }
            (MsgType::ListSessions, _) => self.handle_list_sessions(fd, source),
            (MsgType::Status, _) => {
                let msg = parse!(Status);
                self.handle_status(fd, source, msg.full);
            }

            // pane ops
            (MsgType::PaneInfo, _) => {
                let msg = parse!(PaneInfo);
                match self.registry.panes.get(&msg.uuid) {
                    Some(pane) => {
                        let found = PaneFound { pane: pane.snapshot() };
                        self.reply(fd, source, &found);
                    }
                    None => self.reply(fd, source, &PaneNotFound {}),
                }
            }
            (MsgType::GetPaneCwd, _) => {
                let msg = parse!(GetPaneCwd);
                match self.registry.panes.get(&msg.uuid) {
                    Some(pane) => {
                        let cwd = pane.attrs.cwd.clone();
                        self.reply(fd, source, &OkReply { detail: cwd });
                    }
                    None => self.reply_err(fd, source, "unknown_pane"),
                }
            }
            (MsgType::DestroyPane, _) => {
                let msg = parse!(DestroyPane);
                self.handle_signal_pane(fd, source, msg.uuid, Signal::SIGTERM);
            }
            (MsgType::KillPane, _) => {
                let msg = parse!(KillPane);
                self.handle_signal_pane(fd, source, msg.uuid, Signal::SIGKILL);
            }
            (MsgType::OrphanPane, Source::Mux(id)) => {
                let msg = parse!(OrphanPane);
                self.handle_orphan_pane(fd, id, msg.uuid);
            }
            (MsgType::ListOrphaned, _) => {
                let panes = self
                    .registry
                    .panes
                    .values()
                    .filter(|p| p.state == PaneState::Orphaned)
                    .map(|p| p.snapshot())
                    .collect();
                self.reply(fd, source, &OrphanedPanes { panes });
            }
            (MsgType::AdoptPane, Source::Mux(id)) => {
                let msg = parse!(AdoptPane);
                self.handle_adopt_pane(fd, id, msg.uuid);
            }
            (MsgType::SetSticky, _) => {
                let msg = parse!(SetSticky);
                match self.registry.panes.get_mut(&msg.uuid) {
                    Some(pane) => {
                        pane.attrs.sticky_pwd = Some(msg.pwd);
                        pane.attrs.sticky_key = Some(msg.key);
                        self.registry.dirty = true;
                        self.reply(fd, source, &OkReply { detail: String::new() });
                    }
                    None => self.reply_err(fd, source, "unknown_pane"),
                }
            }
            (MsgType::FindSticky, Source::Mux(id)) => {
                let msg = parse!(FindSticky);
                self.handle_find_sticky(fd, id, msg);
            }
            (MsgType::UpdatePaneName, _) => {
                let msg = parse!(UpdatePaneName);
                self.update_pane(fd, source, msg.uuid, |attrs| {
                    let name = if msg.name.is_empty() { None } else { Some(msg.name.clone()) };
                    if attrs.name != name {
                        attrs.name = name;
                        true
                    } else {
                        false
                    }
                });
            }
            (MsgType::UpdatePaneShell, _) => {
                let msg = parse!(UpdatePaneShell);
                self.update_pane(fd, source, msg.uuid, |attrs| {
                    let shell = if msg.shell.is_empty() { None } else { Some(msg.shell.clone()) };
                    if attrs.shell != shell {
                        attrs.shell = shell;
                        true
                    } else {
                        false
                    }
                });
            }
            (MsgType::UpdatePaneAux, _) => {
                let msg = parse!(UpdatePaneAux);
                self.update_pane(fd, source, msg.uuid, |attrs| {
                    let changed = attrs.last_status != msg.last_status
                        || attrs.last_duration_ms != msg.last_duration_ms
                        || attrs.job_count != msg.job_count
                        || attrs.last_cmd != msg.cmd;
                    if changed {
                        attrs.last_status = msg.last_status;
                        attrs.last_duration_ms = msg.last_duration_ms;
                        attrs.job_count = msg.job_count;
                        attrs.last_cmd = msg.cmd.clone();
                    }
                    changed
                });
            }
            (MsgType::SyncState, Source::Mux(_)) => {
                let msg = parse!(SyncState);
                if let Some(pane) = self.registry.panes.get_mut(&msg.uuid) {
                    pane.attrs.cols = msg.cols;
                    pane.attrs.rows = msg.rows;
                    pane.attrs.cursor_col = msg.cursor_col;
                    pane.attrs.cursor_row = msg.cursor_row;
                    pane.attrs.cursor_style = msg.cursor_style;
                    pane.attrs.cursor_visible = msg.cursor_visible;
                    pane.attrs.alt_screen = msg.alt_screen;
                }
            }

            // ux relay
            (MsgType::Notify, _) | (MsgType::BroadcastNotify, _) => {
                let text = match msg_type {
                    MsgType::Notify => parse!(Notify).text,
                    _ => parse!(hexe_protocol::BroadcastNotify).text,
                };
                self.broadcast_to_muxes(&Notify { text });
                self.reply(fd, source, &OkReply { detail: String::new() });
            }
            (MsgType::TargetedNotify, _) => {
                let msg = parse!(TargetedNotify);
                match self.target_mux(&msg.target) {
                    Ok(ctl_fd) => {
                        self.queue_control(ctl_fd, &Notify { text: msg.text });
                        self.reply(fd, source, &OkReply { detail: String::new() });
                    }
                    Err(reason) => self.reply_err(fd, source, reason),
                }
            }
            (MsgType::PopConfirm, Source::Cli) => {
                let msg = parse!(PopConfirm);
                self.handle_pop(fd, &msg.target.clone(), &encode_control(&msg));
            }
            (MsgType::PopChoose, Source::Cli) => {
                let msg = parse!(PopChoose);
                self.handle_pop(fd, &msg.target.clone(), &encode_control(&msg));
            }
            (MsgType::PopResponse, Source::Mux(id)) => {
                let msg = parse!(PopResponse);
                if let Some(cli_fd) = self.slots.pops.take(id) {
                    self.queue_control(cli_fd, &msg);
                    self.finish_cli(cli_fd);
                }
            }
            (MsgType::SendKeys, _) => {
                let msg = parse!(SendKeys);
                self.handle_send_keys(fd, source, msg);
            }
            (MsgType::FocusMove, Source::Cli) => {
                let msg = parse!(hexe_protocol::FocusMove);
                match self.any_mux() {
                    Some(ctl_fd) => {
                        self.queue_control(ctl_fd, &msg);
                        self.reply(fd, source, &OkReply { detail: String::new() });
                    }
                    None => self.reply_err(fd, source, "no_mux"),
                }
            }
            (MsgType::ExitIntent, Source::Cli) => {
                match self.any_mux() {
                    Some(ctl_fd) => {
                        if let Some(stale) = self.slots.exit_intent.park(fd) {
                            // a newer intent displaces the old caller
                            self.queue_control(
                                stale,
                                &ExitIntentResult { allow: false },
                            );
                            self.finish_cli(stale);
                        }
                        self.queue_control(ctl_fd, &ExitIntent {});
                    }
                    None => {
                        // nobody to ask, so exiting is always fine
                        self.reply(fd, source, &ExitIntentResult { allow: true });
                    }
                }
            }
            (MsgType::ExitIntentResult, Source::Mux(_)) => {
                let msg = parse!(ExitIntentResult);
                if let Some(cli_fd) = self.slots.exit_intent.take() {
                    self.queue_control(cli_fd, &msg);
                    self.finish_cli(cli_fd);
                }
            }
            (MsgType::FloatRequest, Source::Cli) => {
                let msg = parse!(FloatRequest);
                match self.any_mux() {
                    Some(ctl_fd) => {
                        self.slots.floats.park(msg.request_id, fd);
                        self.queue_control(ctl_fd, &msg);
                    }
                    None => self.reply_err(fd, source, "no_mux"),
                }
            }
            (MsgType::FloatCreated, Source::Mux(_)) => {
                let msg = parse!(FloatCreated);
                debug!("float {} materialized as pane {}", msg.request_id, msg.pane_uuid);
            }
            (MsgType::FloatResult, Source::Mux(_)) => {
                let msg = parse!(FloatResult);
                if let Some(cli_fd) = self.slots.floats.take(&msg.request_id) {
                    self.queue_control(cli_fd, &msg);
                    self.finish_cli(cli_fd);
                }
            }

            // pod uplink
            (MsgType::PodRegister, Source::Pod(uuid)) => {
                let msg = parse!(PodRegister);
                self.handle_pod_register(fd, uuid, msg);
            }
            (MsgType::Exited, Source::Pod(uuid)) => {
                let msg = parse!(hexe_protocol::Exited);
                if msg.uuid == uuid {
                    self.pane_dead(uuid, msg.status);
                }
            }
            (MsgType::CwdChanged, Source::Pod(uuid)) => {
                let msg = parse!(hexe_protocol::CwdChanged);
                if let Some(pane) = self.registry.panes.get_mut(&uuid) {
                    pane.attrs.cwd = msg.cwd;
                    self.registry.dirty = true;
                }
                self.forward_to_owner(uuid, raw_type, payload);
            }
            (MsgType::FgChanged, Source::Pod(uuid)) => {
                let msg = parse!(hexe_protocol::FgChanged);
                if let Some(pane) = self.registry.panes.get_mut(&uuid) {
                    pane.attrs.fg_pid = msg.fg_pid;
                    pane.attrs.fg_name = msg.name;
                }
                self.forward_to_owner(uuid, raw_type, payload);
            }
            (MsgType::TitleChanged, Source::Pod(uuid)) => {
                let msg = parse!(hexe_protocol::TitleChanged);
                if let Some(pane) = self.registry.panes.get_mut(&uuid) {
                    pane.attrs.title = msg.title;
                }
                self.forward_to_owner(uuid, raw_type, payload);
            }
            (MsgType::Bell, Source::Pod(uuid)) => {
                self.forward_to_owner(uuid, raw_type, payload);
            }
            (MsgType::ShellEvent, Source::Pod(uuid)) => {
                let msg = parse!(hexe_protocol::PodShellEvent);
                if let Some(pane) = self.registry.panes.get_mut(&uuid) {
                    pane.attrs.last_cmd = msg.event.cmd.clone();
                    pane.attrs.last_status = msg.event.status;
                    pane.attrs.last_duration_ms = msg.event.duration_ms;
                    pane.attrs.job_count = msg.event.jobs;
                }
                self.forward_to_owner(uuid, raw_type, payload);
            }

            (MsgType::Ok, _) | (MsgType::Error, _) => {}

            (other, src) => {
                debug!("unsupported {:?} from {:?}", other, src);
                self.reply_err(fd, source, "unsupported");
            }
        }
    }

    //
    // session handlers
    //

    #[instrument(skip_all, fields(client = client_id))]
    fn handle_create_pane(&mut self, fd: RawFd, client_id: ClientId, msg: CreatePane) {
        let uuid = match Uuid::generate() {
            Ok(u) => u,
            Err(e) => {
                error!("generating pane uuid: {:?}", e);
                self.reply_err(fd, Source::Mux(client_id), "spawn_failed");
                return;
            }
        };
        let session_id = match self.registry.clients.get(&client_id) {
            Some(c) => c.session_id,
            None => return,
        };

        let spec = PodSpec {
            uuid,
            shell: if msg.shell.is_empty() {
                self.config.shell.as_deref()
            } else {
                Some(msg.shell.as_str())
            },
            cwd: if msg.cwd.is_empty() { None } else { Some(msg.cwd.as_str()) },
            name: None,
            cols: msg.cols.max(1),
            rows: msg.rows.max(1),
        };
        let handle = match spawn::spawn_pod(&self.socket_path, &spec) {
            Ok(h) => h,
            Err(e) => {
                warn!("pod spawn failed: {:?}", e);
                self.reply_err(fd, Source::Mux(client_id), "spawn_failed");
                return;
            }
        };

        let pane_id = self.registry.alloc_pane_id();
        let pane = Pane {
            uuid,
            pane_id,
            pod_pid: handle.pid,
            child_pid: 0,
            socket_path: handle.socket_path.clone(),
            state: PaneState::Attached,
            owner: Some(client_id),
            session: Some(session_id),
            vt_fd: None,
            ctl_fd: None,
            attrs: PaneAttrs {
                cols: msg.cols,
                rows: msg.rows,
                shell: if msg.shell.is_empty() { None } else { Some(msg.shell.clone()) },
                ..Default::default()
            },
        };
        self.registry.panes.insert(uuid, pane);
        if let Some(client) = self.registry.clients.get_mut(&client_id) {
            client.panes.push(uuid);
        }
        self.registry.dirty = true;

        // no half-registered state: a failed C3 dial undoes the pane
        let has_vt = self.registry.clients.get(&client_id).map(|c| c.vt_fd.is_some());
        if has_vt == Some(true) {
            if let Err(e) = self.connect_pane_vt(uuid) {
                warn!("dialing fresh pod failed: {:?}", e);
                let _ = signal::kill(Pid::from_raw(handle.pid), Signal::SIGKILL);
                self.pane_dead(uuid, 1);
                self.reply_err(fd, Source::Mux(client_id), "spawn_failed");
                return;
            }
        }

        info!("created pane {} id={} pod={}", uuid, pane_id, handle.pid);
        self.queue_control(
            fd,
            &PaneCreated {
                uuid,
                pane_id,
                pod_pid: handle.pid,
                socket_path: handle.socket_path.to_string_lossy().into_owned(),
            },
        );
    }

    #[instrument(skip_all, fields(client = client_id))]
    fn handle_detach(&mut self, fd: RawFd, client_id: ClientId, msg: Detach) {
        let matches = self
            .registry
            .clients
            .get(&client_id)
            .map(|c| c.session_id == msg.session_id)
            .unwrap_or(false);
        if !matches {
            self.reply_err(fd, Source::Mux(client_id), "session_not_found");
            return;
        }
        self.park_client_panes(client_id, Some(msg.layout));
        self.queue_control(fd, &SessionDetached { session_id: msg.session_id });
    }

    #[instrument(skip_all, fields(client = client_id))]
    fn handle_reattach(&mut self, fd: RawFd, client_id: ClientId, msg: Reattach) {
        let session_id = match self.registry.match_detached(&msg.prefix) {
            PrefixMatch::One(id) => id,
            PrefixMatch::NotFound => {
                self.reply_err(fd, Source::Mux(client_id), "session_not_found");
                return;
            }
            PrefixMatch::Ambiguous => {
                self.reply_err(fd, Source::Mux(client_id), "ambiguous_session_id");
                return;
            }
        };
        let Some(record) = self.registry.detached.remove(&session_id) else {
            self.reply_err(fd, Source::Mux(client_id), "session_not_found");
            return;
        };
        let new_session = match self.registry.clients.get(&client_id) {
            Some(c) => c.session_id,
            None => return,
        };

        for uuid in record.panes.iter() {
            if let Some(pane) = self.registry.panes.get_mut(uuid) {
                pane.owner = Some(client_id);
                pane.session = Some(new_session);
                pane.state = PaneState::Attached;
            }
        }
        if let Some(client) = self.registry.clients.get_mut(&client_id) {
            client.panes.extend(record.panes.iter().copied());
            if client.name.is_none() {
                client.name = record.name.clone();
            }
        }
        self.registry.dirty = true;
        info!("session {} reattached to client {}", session_id, client_id);

        self.queue_control(
            fd,
            &SessionReattached { layout: record.layout.clone(), panes: record.panes.clone() },
        );

        // if the vt stream is already paired, start the replays now;
        // otherwise the C2 handshake will
        let has_vt =
            self.registry.clients.get(&client_id).map(|c| c.vt_fd.is_some()).unwrap_or(false);
        if has_vt {
            self.connect_client_panes(client_id);
        }
    }

    fn handle_disconnect(&mut self, fd: RawFd, client_id: ClientId, msg: Disconnect) {
        info!("client {} disconnecting mode={:?}", client_id, msg.mode);
        match msg.mode {
            DisconnectMode::Detach => {
                self.park_client_panes(client_id, None);
            }
            DisconnectMode::Shutdown => {
                self.shutdown_client_panes(client_id, msg.preserve_sticky);
            }
        }
        self.queue_control(fd, &OkReply { detail: String::new() });
        if let Some(conn) = self.conns.get_mut(&fd) {
            conn.close_after_flush = true;
        }
        // the ClientCtl close path will see an empty pane list
        self.flush_conn(fd);
    }

    fn handle_list_sessions(&mut self, fd: RawFd, source: Source) {
        let mut sessions: Vec<SessionEntry> = self
            .registry
            .clients
            .values()
            .map(|c| SessionEntry {
                session_id: c.session_id,
                pane_count: c.panes.len() as u16,
                attached: true,
                name: c.name.clone().unwrap_or_default(),
            })
            .chain(self.registry.detached.values().map(|d| SessionEntry {
                session_id: d.session_id,
                pane_count: d.panes.len() as u16,
                attached: false,
                name: d.name.clone().unwrap_or_default(),
            }))
            .collect();
        sessions.sort_by_key(|s| s.session_id);
        self.reply(fd, source, &SessionsList { sessions });
    }

    fn handle_status(&mut self, fd: RawFd, source: Source, full: bool) {
        let sessions: Vec<serde_json::Value> = self
            .registry
            .clients
            .values()
            .map(|c| {
                serde_json::json!({
                    "session": c.session_id.to_hex(),
                    "name": c.name,
                    "attached": true,
                    "panes": c.panes.iter().map(|u| u.to_hex()).collect::<Vec<_>>(),
                })
            })
            .chain(self.registry.detached.values().map(|d| {
                serde_json::json!({
                    "session": d.session_id.to_hex(),
                    "name": d.name,
                    "attached": false,
                    "panes": d.panes.iter().map(|u| u.to_hex()).collect::<Vec<_>>(),
                })
            }))
            .collect();

        let panes: Vec<serde_json::Value> = self
            .registry
            .panes
            .values()
            .map(|p| {
                let mut v = serde_json::json!({
                    "uuid": p.uuid.to_hex(),
                    "pane_id": p.pane_id,
                    "state": format!("{:?}", p.state).to_lowercase(),
                    "pod_pid": p.pod_pid,
                    "cwd": p.attrs.cwd,
                    "fg": p.attrs.fg_name,
                });
                if full {
                    v["name"] = serde_json::json!(p.attrs.name);
                    v["title"] = serde_json::json!(p.attrs.title);
                    v["shell"] = serde_json::json!(p.attrs.shell);
                    v["fg_pid"] = serde_json::json!(p.attrs.fg_pid);
                    v["last_cmd"] = serde_json::json!(p.attrs.last_cmd);
                    v["last_status"] = serde_json::json!(p.attrs.last_status);
                    v["last_duration_ms"] = serde_json::json!(p.attrs.last_duration_ms);
                    v["jobs"] = serde_json::json!(p.attrs.job_count);
                    v["size"] = serde_json::json!([p.attrs.cols, p.attrs.rows]);
                    v["cursor"] = serde_json::json!([p.attrs.cursor_col, p.attrs.cursor_row]);
                    v["cursor_style"] = serde_json::json!(p.attrs.cursor_style);
                    v["cursor_visible"] = serde_json::json!(p.attrs.cursor_visible);
                    v["alt_screen"] = serde_json::json!(p.attrs.alt_screen);
                    v["sticky_pwd"] = serde_json::json!(p.attrs.sticky_pwd);
                }
                v
            })
            .collect();

        let doc = serde_json::json!({
            "instance": crate::paths::instance(),
            "sessions": sessions,
            "panes": panes,
        });
        let state = serde_json::to_vec(&doc).unwrap_or_default();
        self.reply(fd, source, &SessionState { state });
    }

    //
    // pane handlers
    //

    fn handle_signal_pane(&mut self, fd: RawFd, source: Source, uuid: Uuid, sig: Signal) {
        let Some(pane) = self.registry.panes.get(&uuid) else {
            self.reply_err(fd, source, "unknown_pane");
            return;
        };
        let pid = pane.pod_pid;
        info!("signaling pane {} pod={} with {:?}", uuid, pid, sig);
        if let Err(e) = signal::kill(Pid::from_raw(pid), sig) {
            warn!("signaling pod: {:?}", e);
            // the pod is already gone, reap the record ourselves
            self.pane_dead(uuid, 1);
        }
        self.reply(fd, source, &OkReply { detail: String::new() });
    }

    fn handle_orphan_pane(&mut self, fd: RawFd, client_id: ClientId, uuid: Uuid) {
        let owned = self
            .registry
            .panes
            .get(&uuid)
            .map(|p| p.owner == Some(client_id))
            .unwrap_or(false);
        if !owned {
            self.reply_err(fd, Source::Mux(client_id), "unknown_pane");
            return;
        }
        self.close_pane_vt(uuid);
        if let Some(pane) = self.registry.panes.get_mut(&uuid) {
            pane.owner = None;
            pane.session = None;
            pane.state = PaneState::Orphaned;
        }
        if let Some(client) = self.registry.clients.get_mut(&client_id) {
            client.panes.retain(|u| *u != uuid);
        }
        self.registry.dirty = true;
        info!("pane {} orphaned", uuid);
        self.reply(fd, Source::Mux(client_id), &OkReply { detail: String::new() });
    }

    fn handle_adopt_pane(&mut self, fd: RawFd, client_id: ClientId, uuid: Uuid) {
        let adoptable = self
            .registry
            .panes
            .get(&uuid)
            .map(|p| p.state == PaneState::Orphaned)
            .unwrap_or(false);
        if !adoptable {
            self.reply_err(fd, Source::Mux(client_id), "not_orphaned");
            return;
        }
        self.claim_pane(client_id, uuid);
        let snapshot = match self.registry.panes.get(&uuid) {
            Some(p) => p.snapshot(),
            None => {
                self.reply_err(fd, Source::Mux(client_id), "unknown_pane");
                return;
            }
        };
        info!("pane {} adopted by client {}", uuid, client_id);
        self.reply(fd, Source::Mux(client_id), &PaneFound { pane: snapshot });
    }

    fn handle_find_sticky(&mut self, fd: RawFd, client_id: ClientId, msg: FindSticky) {
        let found = self
            .registry
            .panes
            .values()
            .find(|p| {
                p.state == PaneState::Sticky
                    && p.attrs.sticky_pwd.as_deref() == Some(msg.pwd.as_str())
                    && p.attrs.sticky_key == Some(msg.key)
            })
            .map(|p| p.uuid);
        let Some(uuid) = found else {
            self.reply(fd, Source::Mux(client_id), &PaneNotFound {});
            return;
        };
        self.claim_pane(client_id, uuid);
        if let Some(pane) = self.registry.panes.get(&uuid) {
            let found = PaneFound { pane: pane.snapshot() };
            info!("sticky pane {} rebound to client {}", uuid, client_id);
            self.reply(fd, Source::Mux(client_id), &found);
        }
    }

    /// Attach an ownerless pane (orphaned, sticky, or stray detached)
    /// to the given client and start its replay if the vt stream is
    /// up.
    fn claim_pane(&mut self, client_id: ClientId, uuid: Uuid) {
        let session_id = self.registry.clients.get(&client_id).map(|c| c.session_id);
        if let Some(pane) = self.registry.panes.get_mut(&uuid) {
            pane.owner = Some(client_id);
            pane.session = session_id;
            pane.state = PaneState::Attached;
        }
        if let Some(client) = self.registry.clients.get_mut(&client_id) {
            if !client.panes.contains(&uuid) {
                client.panes.push(uuid);
            }
        }
        for d in self.registry.detached.values_mut() {
            d.panes.retain(|u| *u != uuid);
        }
        self.registry.detached.retain(|_, d| !d.panes.is_empty());
        self.registry.dirty = true;

        let has_vt = self
            .registry
            .clients
            .get(&client_id)
            .map(|c| c.vt_fd.is_some())
            .unwrap_or(false);
        if has_vt {
            if let Err(e) = self.connect_pane_vt(uuid) {
                warn!("dialing claimed pane {}: {:?}", uuid, e);
            }
        }
    }

    fn update_pane<F>(&mut self, fd: RawFd, source: Source, uuid: Uuid, apply: F)
    where
        F: FnOnce(&mut PaneAttrs) -> bool,
    {
        match self.registry.panes.get_mut(&uuid) {
            Some(pane) => {
                if apply(&mut pane.attrs) {
                    self.registry.dirty = true;
                }
                // identical updates ack without any further traffic
                self.reply(fd, source, &OkReply { detail: String::new() });
            }
            None => self.reply_err(fd, source, "unknown_pane"),
        }
    }

    fn handle_send_keys(&mut self, fd: RawFd, source: Source, msg: SendKeys) {
        let pane_uuid = match self.registry.resolve_target(&msg.target) {
            Some(Target::Pane(uuid)) => Some(uuid),
            Some(Target::Session(sid)) => self.registry.first_pane_of_session(&sid),
            None => None,
        };
        let Some(uuid) = pane_uuid else {
            self.reply_err(fd, source, "unknown_target");
            return;
        };

        let vt_fd = self.registry.panes.get(&uuid).and_then(|p| p.vt_fd);
        if let Some(pod_fd) = vt_fd {
            let header = PodVtHeader { kind: FrameKind::Input, len: msg.keys.len() as u32 };
            let mut frame = Vec::with_capacity(5 + msg.keys.len());
            frame.extend_from_slice(&header.encode());
            frame.extend_from_slice(&msg.keys);
            self.conn_write(pod_fd, &frame);
            self.reply(fd, source, &OkReply { detail: String::new() });
            return;
        }

        // detached pane: use the pod's one-shot injector channel
        let socket = self.registry.panes.get(&uuid).map(|p| p.socket_path.clone());
        match socket.map(|s| inject_keys(&s, &msg.keys)) {
            Some(Ok(())) => self.reply(fd, source, &OkReply { detail: String::new() }),
            Some(Err(e)) => {
                warn!("injecting keys into {}: {:?}", uuid, e);
                self.reply_err(fd, source, "inject_failed");
            }
            None => self.reply_err(fd, source, "unknown_pane"),
        }
    }

    fn handle_pop(&mut self, fd: RawFd, target: &str, frame: &[u8]) {
        match self.target_mux(target) {
            Ok(mux_ctl_fd) => {
                let mux_id = match self.conns.get(&mux_ctl_fd).map(|c| &c.kind) {
                    Some(ConnKind::ClientCtl { client_id }) => *client_id,
                    _ => {
                        self.reply_err(fd, Source::Cli, "no_mux");
                        return;
                    }
                };
                if let Some(stale) = self.slots.pops.park(mux_id, fd) {
                    // the previous popup for this mux can never be
                    // answered now
                    self.queue_err(stale, "superseded");
                    self.finish_cli(stale);
                }
                self.conn_write(mux_ctl_fd, frame);
            }
            Err(reason) => self.reply_err(fd, Source::Cli, reason),
        }
    }

    //
    // pod uplink handlers
    //

    fn handle_pod_register(&mut self, fd: RawFd, uuid: Uuid, msg: PodRegister) {
        if msg.uuid != uuid {
            warn!("pod register uuid mismatch");
            self.close_conn(fd);
            return;
        }
        if let Some(pane) = self.registry.panes.get_mut(&uuid) {
            pane.pod_pid = msg.pod_pid;
            pane.child_pid = msg.child_pid;
            pane.socket_path = PathBuf::from(&msg.socket_path);
            pane.attrs.cols = msg.cols;
            pane.attrs.rows = msg.rows;
            pane.ctl_fd = Some(fd);
            self.registry.dirty = true;
            return;
        }

        // a pod we have no record of: a survivor from a previous ses
        // life. Adoptable by any mux.
        info!("recovering unknown pod {} as orphaned pane", uuid);
        let pane_id = self.registry.alloc_pane_id();
        self.registry.panes.insert(
            uuid,
            Pane {
                uuid,
                pane_id,
                pod_pid: msg.pod_pid,
                child_pid: msg.child_pid,
                socket_path: PathBuf::from(&msg.socket_path),
                state: PaneState::Orphaned,
                owner: None,
                session: None,
                vt_fd: None,
                ctl_fd: Some(fd),
                attrs: PaneAttrs { cols: msg.cols, rows: msg.rows, ..Default::default() },
            },
        );
        self.registry.dirty = true;
    }

    /// Forward an uplink message to the owning mux's control stream
    /// verbatim (same type, same payload).
    fn forward_to_owner(&mut self, uuid: Uuid, raw_type: u16, payload: &[u8]) {
        let dest = self
            .registry
            .panes
            .get(&uuid)
            .and_then(|p| p.owner)
            .and_then(|owner| self.registry.clients.get(&owner))
            .map(|c| c.ctl_fd);
        if let Some(ctl_fd) = dest {
            let header =
                ControlHeader { msg_type: raw_type, payload_len: payload.len() as u32 };
            let mut frame = Vec::with_capacity(CONTROL_HEADER_LEN + payload.len());
            frame.extend_from_slice(&header.encode());
            frame.extend_from_slice(payload);
            self.conn_write(ctl_fd, &frame);
        }
    }

    //
    // lifecycle transitions
    //

    /// Dial a pane's pod socket and take the VT seat. The pod answers
    /// by replaying its ring terminated with a backlog_end frame.
    fn connect_pane_vt(&mut self, uuid: Uuid) -> anyhow::Result<()> {
        let (socket_path, pane_id, ctl_fd) = match self.registry.panes.get(&uuid) {
            Some(p) => (p.socket_path.clone(), p.pane_id, p.ctl_fd),
            None => return Err(anyhow!("no such pane")),
        };
        let mut stream =
            UnixStream::connect(&socket_path).context("dialing pod socket")?;
        stream
            .write_all(&[handshake::POD_VT])
            .context("writing pod vt handshake")?;
        stream.set_nonblocking(true).context("marking pod vt nonblocking")?;

        let fd = stream.as_raw_fd();
        self.conns.insert(fd, Conn::new(stream, ConnKind::PodVt { uuid }));
        self.pane_routes.insert(pane_id, fd);
        self.pod_vt_routes.insert(fd, pane_id);
        if let Some(pane) = self.registry.panes.get_mut(&uuid) {
            if let Some(old) = pane.vt_fd.replace(fd) {
                self.pod_vt_routes.remove(&old);
                self.conns.remove(&old);
            }
        }
        debug!("pane {} vt connected fd={}", uuid, fd);

        // nudge the pod for fresh metadata now that someone is looking
        if let Some(ctl_fd) = ctl_fd {
            self.queue_control(ctl_fd, &QueryState { uuid });
        }
        Ok(())
    }

    fn connect_client_panes(&mut self, client_id: ClientId) {
        let panes: Vec<Uuid> = self
            .registry
            .clients
            .get(&client_id)
            .map(|c| c.panes.clone())
            .unwrap_or_default();
        for uuid in panes {
            let connected =
                self.registry.panes.get(&uuid).map(|p| p.vt_fd.is_some()).unwrap_or(true);
            if !connected {
                if let Err(e) = self.connect_pane_vt(uuid) {
                    warn!("dialing pane {}: {:?}", uuid, e);
                }
            }
        }
    }

    /// Drop a pane's C3 connection and its routing entries. Both maps
    /// move together so the mirror invariant holds.
    fn close_pane_vt(&mut self, uuid: Uuid) {
        let Some(fd) = self.registry.panes.get_mut(&uuid).and_then(|p| p.vt_fd.take()) else {
            return;
        };
        if let Some(pane_id) = self.pod_vt_routes.remove(&fd) {
            self.pane_routes.remove(&pane_id);
        }
        self.conns.remove(&fd);
    }

    /// Move a client's panes into a detached session record. Panes
    /// with a sticky binding become sticky instead.
    fn park_client_panes(&mut self, client_id: ClientId, layout: Option<Vec<u8>>) {
        let Some(client) = self.registry.clients.get_mut(&client_id) else {
            return;
        };
        let session_id = client.session_id;
        let name = client.name.clone();
        let layout = layout.unwrap_or_else(|| std::mem::take(&mut client.layout));
        let panes = std::mem::take(&mut client.panes);

        let mut parked = vec![];
        for uuid in panes {
            self.close_pane_vt(uuid);
            if let Some(pane) = self.registry.panes.get_mut(&uuid) {
                pane.owner = None;
                pane.session = Some(session_id);
                if pane.attrs.sticky_pwd.is_some() {
                    pane.state = PaneState::Sticky;
                } else {
                    pane.state = PaneState::Detached;
                    parked.push(uuid);
                }
            }
        }
        if !parked.is_empty() || !layout.is_empty() {
            info!("session {} detached with {} panes", session_id, parked.len());
            let record =
                self.registry.detached.entry(session_id).or_insert_with(|| DetachedSession {
                    session_id,
                    name: name.clone(),
                    layout: vec![],
                    panes: vec![],
                });
            record.panes.extend(parked);
            if !layout.is_empty() {
                record.layout = layout;
            }
            if record.name.is_none() {
                record.name = name;
            }
        }
        self.registry.dirty = true;
    }

    /// Kill a client's panes (graceful shutdown). Sticky panes survive
    /// when asked to.
    fn shutdown_client_panes(&mut self, client_id: ClientId, preserve_sticky: bool) {
        let panes = self
            .registry
            .clients
            .get_mut(&client_id)
            .map(|c| std::mem::take(&mut c.panes))
            .unwrap_or_default();
        for uuid in panes {
            let sticky = self
                .registry
                .panes
                .get(&uuid)
                .map(|p| p.attrs.sticky_pwd.is_some())
                .unwrap_or(false);
            if preserve_sticky && sticky {
                self.close_pane_vt(uuid);
                if let Some(pane) = self.registry.panes.get_mut(&uuid) {
                    pane.owner = None;
                    pane.session = None;
                    pane.state = PaneState::Sticky;
                }
                continue;
            }
            self.close_pane_vt(uuid);
            if let Some(pane) = self.registry.panes.get_mut(&uuid) {
                pane.owner = None;
                let _ = signal::kill(Pid::from_raw(pane.pod_pid), Signal::SIGTERM);
            }
        }
        self.registry.dirty = true;
    }

    /// Terminal pane transition: routing entries removed, owner
    /// notified, record freed.
    fn pane_dead(&mut self, uuid: Uuid, status: i32) {
        let Some(pane) = self.registry.panes.remove(&uuid) else {
            return;
        };
        info!("pane {} exited with status {}", uuid, status);
        if let Some(fd) = pane.vt_fd {
            if let Some(pane_id) = self.pod_vt_routes.remove(&fd) {
                self.pane_routes.remove(&pane_id);
            }
            self.conns.remove(&fd);
        }
        if let Some(fd) = pane.ctl_fd {
            self.conns.remove(&fd);
        }

        let owner_ctl = pane.owner.and_then(|owner| {
            let client = self.registry.clients.get_mut(&owner)?;
            client.panes.retain(|u| *u != uuid);
            Some(client.ctl_fd)
        });
        if let Some(ctl_fd) = owner_ctl {
            self.queue_control(ctl_fd, &PaneExited { uuid, status });
        }

        for d in self.registry.detached.values_mut() {
            d.panes.retain(|u| *u != uuid);
        }
        self.registry.detached.retain(|_, d| !d.panes.is_empty());
        self.registry.dirty = true;
    }

    /// A mux's control stream went away without a graceful disconnect.
    fn client_gone(&mut self, client_id: ClientId) {
        let Some(client) = self.registry.clients.get(&client_id) else {
            return;
        };
        let keepalive = client.keepalive;
        let vt_fd = client.vt_fd;
        info!("client {} gone (keepalive={})", client_id, keepalive);

        if keepalive {
            self.park_client_panes(client_id, None);
        } else {
            self.shutdown_client_panes(client_id, true);
        }
        if let Some(fd) = vt_fd {
            self.conns.remove(&fd);
        }
        self.registry.clients.remove(&client_id);
        self.registry.dirty = true;

        // a popup shown by this mux can never be answered
        if let Some(cli_fd) = self.slots.pops.take(client_id) {
            self.queue_err(cli_fd, "mux_gone");
            self.finish_cli(cli_fd);
        }
        // same for a pending exit intent when no mux is left
        if self.registry.clients.is_empty() {
            if let Some(cli_fd) = self.slots.exit_intent.take() {
                self.queue_control(cli_fd, &ExitIntentResult { allow: true });
                self.finish_cli(cli_fd);
            }
        }
    }

    fn client_vt_gone(&mut self, client_id: ClientId, fd: RawFd) {
        let panes: Vec<Uuid> = {
            let Some(client) = self.registry.clients.get_mut(&client_id) else {
                return;
            };
            if client.vt_fd == Some(fd) {
                client.vt_fd = None;
            }
            client.panes.clone()
        };
        // with no vt stream, the pods go back to accumulating their
        // rings until the next replay
        for uuid in panes {
            self.close_pane_vt(uuid);
        }
        info!("client {} vt stream closed", client_id);
    }

    fn pod_ctl_gone(&mut self, uuid: Uuid, fd: RawFd) {
        let pod_pid = {
            let Some(pane) = self.registry.panes.get_mut(&uuid) else {
                return;
            };
            if pane.ctl_fd == Some(fd) {
                pane.ctl_fd = None;
            }
            pane.pod_pid
        };
        // a pod that is still alive will re-dial lazily; one that died
        // without an exited message is reaped here
        if signal::kill(Pid::from_raw(pod_pid), None).is_err() {
            self.pane_dead(uuid, 1);
        }
    }

    //
    // connection plumbing
    //

    fn close_conn(&mut self, fd: RawFd) {
        let Some(conn) = self.conns.remove(&fd) else {
            return;
        };
        trace!("closing fd={} kind={:?}", fd, conn.kind);
        match conn.kind {
            ConnKind::ClientCtl { client_id } => self.client_gone(client_id),
            ConnKind::ClientVt { client_id } => self.client_vt_gone(client_id, fd),
            ConnKind::PodVt { uuid } => {
                if let Some(pane_id) = self.pod_vt_routes.remove(&fd) {
                    self.pane_routes.remove(&pane_id);
                }
                if let Some(pane) = self.registry.panes.get_mut(&uuid) {
                    if pane.vt_fd == Some(fd) {
                        pane.vt_fd = None;
                    }
                }
            }
            ConnKind::PodCtl { uuid } => self.pod_ctl_gone(uuid, fd),
            ConnKind::Cli => self.slots.forget_fd(fd),
            ConnKind::PendingSelector
            | ConnKind::PendingRegister
            | ConnKind::PendingSessionHex { .. }
            | ConnKind::PendingPodUuid { .. } => {}
        }
        // conn.stream drops here, closing the fd
    }

    /// Queue bytes on a connection, writing through immediately when
    /// possible. Ses never blocks: leftovers wait for POLLOUT.
    fn conn_write(&mut self, fd: RawFd, bytes: &[u8]) {
        let dead = {
            let Some(conn) = self.conns.get_mut(&fd) else {
                return;
            };
            conn.outbuf.extend_from_slice(bytes);
            write_some(conn)
        };
        if dead {
            self.close_conn(fd);
        } else {
            self.maybe_finish_close(fd);
        }
    }

    /// Returns false if the connection died.
    fn flush_conn(&mut self, fd: RawFd) -> bool {
        let dead = {
            let Some(conn) = self.conns.get_mut(&fd) else {
                return false;
            };
            write_some(conn)
        };
        if dead {
            self.close_conn(fd);
            return false;
        }
        self.maybe_finish_close(fd)
    }

    /// Graceful close once a close_after_flush connection has fully
    /// drained. Returns false if the conn is gone.
    fn maybe_finish_close(&mut self, fd: RawFd) -> bool {
        let done = self
            .conns
            .get(&fd)
            .map(|c| c.close_after_flush && c.pending_out() == 0)
            .unwrap_or(false);
        if done {
            self.close_conn(fd);
            return false;
        }
        true
    }

    fn queue_control<M: ControlMessage>(&mut self, fd: RawFd, msg: &M) {
        self.conn_write(fd, &encode_control(msg));
    }

    fn broadcast_to_muxes<M: ControlMessage>(&mut self, msg: &M) {
        let fds: Vec<RawFd> = self.registry.clients.values().map(|c| c.ctl_fd).collect();
        let frame = encode_control(msg);
        for fd in fds {
            self.conn_write(fd, &frame);
        }
    }

    fn queue_err(&mut self, fd: RawFd, reason: &str) {
        self.queue_control(fd, &ErrorReply { reason: String::from(reason) });
    }

    /// Reply on a control stream. Cli connections are single-shot, so
    /// the reply also schedules the close.
    fn reply<M: ControlMessage>(&mut self, fd: RawFd, source: Source, msg: &M) {
        self.queue_control(fd, msg);
        if let Source::Cli = source {
            self.finish_cli(fd);
        }
    }

    fn reply_err(&mut self, fd: RawFd, source: Source, reason: &str) {
        match source {
            Source::Pod(_) => debug!("dropping bad pod traffic: {}", reason),
            _ => {
                self.queue_err(fd, reason);
                if let Source::Cli = source {
                    self.finish_cli(fd);
                }
            }
        }
    }

    fn finish_cli(&mut self, fd: RawFd) {
        if let Some(conn) = self.conns.get_mut(&fd) {
            conn.close_after_flush = true;
        }
        self.flush_conn(fd);
    }

    /// The control fd of some attached mux, for cli requests that just
    /// need "a" mux (focus moves, exit intents, floats).
    fn any_mux(&self) -> Option<RawFd> {
        self.registry.clients.values().min_by_key(|c| c.id).map(|c| c.ctl_fd)
    }

    /// Resolve a targeted-message target to a mux control fd. An empty
    /// target means "whichever mux there is".
    fn target_mux(&self, target: &str) -> Result<RawFd, &'static str> {
        if target.is_empty() {
            return self.any_mux().ok_or("no_mux");
        }
        let session = match self.registry.resolve_target(target) {
            Some(Target::Session(sid)) => Some(sid),
            Some(Target::Pane(uuid)) => {
                self.registry.panes.get(&uuid).and_then(|p| p.session)
            }
            None => None,
        };
        let Some(session) = session else {
            return Err("unknown_target");
        };
        self.registry.client_by_session(&session).map(|c| c.ctl_fd).ok_or("no_mux")
    }

    //
    // timers
    //

    fn tick(&mut self) {
        self.persist(false);
        self.reap_pods();

        let now = time::Instant::now();
        let stale: Vec<RawFd> = self
            .conns
            .iter()
            .filter(|(_, c)| {
                matches!(
                    c.kind,
                    ConnKind::PendingSelector
                        | ConnKind::PendingRegister
                        | ConnKind::PendingSessionHex { .. }
                        | ConnKind::PendingPodUuid { .. }
                ) && now.duration_since(c.since) > PENDING_TIMEOUT
            })
            .map(|(fd, _)| *fd)
            .collect();
        for fd in stale {
            debug!("dropping stalled handshake fd={}", fd);
            self.conns.remove(&fd);
        }
    }

    fn persist(&mut self, force: bool) {
        if !self.registry.dirty {
            return;
        }
        if !force && self.last_persist.elapsed() < PERSIST_INTERVAL {
            return;
        }
        if let Err(e) = persist::save(&self.state_file, &self.registry) {
            warn!("persisting registry: {:?}", e);
            return;
        }
        self.registry.dirty = false;
        self.last_persist = time::Instant::now();
    }

    /// Pods are our direct children; reap any that have exited so they
    /// don't linger as zombies. State cleanup rides on the C3/C4 hups.
    fn reap_pods(&mut self) {
        loop {
            match wait::waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => break,
                Ok(WaitStatus::Exited(pid, status)) => {
                    debug!("reaped pod {} status={}", pid, status);
                }
                Ok(WaitStatus::Signaled(pid, sig, _)) => {
                    debug!("reaped pod {} signal={:?}", pid, sig);
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }
    }
}

/// Write as much buffered output as the socket will take right now.
/// Returns true if the connection is dead.
fn write_some(conn: &mut Conn) -> bool {
    while conn.out_off < conn.outbuf.len() {
        match conn.stream.write(&conn.outbuf[conn.out_off..]) {
            Ok(0) => return true,
            Ok(n) => conn.out_off += n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => {
                debug!("write error: {:?}", e);
                return true;
            }
        }
    }
    if conn.out_off == conn.outbuf.len() {
        conn.outbuf.clear();
        conn.out_off = 0;
    }
    false
}

/// One-shot key injection into a pod that has no VT seat taken.
fn inject_keys(socket_path: &std::path::Path, keys: &[u8]) -> anyhow::Result<()> {
    let mut stream = UnixStream::connect(socket_path).context("dialing pod")?;
    stream
        .set_write_timeout(Some(consts::SOCK_STREAM_TIMEOUT))
        .context("setting write timeout")?;
    let header = PodVtHeader { kind: FrameKind::Input, len: keys.len() as u32 };
    let mut frame = Vec::with_capacity(6 + keys.len());
    frame.push(handshake::POD_INJECT);
    frame.extend_from_slice(&header.encode());
    frame.extend_from_slice(keys);
    stream.write_all(&frame).context("writing inject frame")?;
    Ok(())
}

fn is_eintr(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<nix::errno::Errno>(), Some(nix::errno::Errno::EINTR))
}
