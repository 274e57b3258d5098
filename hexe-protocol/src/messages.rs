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

use anyhow::anyhow;

use crate::{
    put_i32, put_i64, put_u16, put_u32, put_u64, ControlMessage, TrailCursor, Uuid,
};

/// Every control message type. The high byte encodes the channel:
/// `0x01xx` for C1 (mux -> ses), `0x04xx` for C4 (pod -> ses), `0x05xx`
/// for C5 (shp -> pod).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MsgType {
    Register = 0x0100,
    Registered = 0x0101,
    CreatePane = 0x0102,
    PaneCreated = 0x0103,
    DestroyPane = 0x0104,
    Detach = 0x0105,
    Reattach = 0x0106,
    SessionState = 0x0107,
    LayoutSync = 0x0108,
    Notify = 0x0109,
    PopConfirm = 0x010A,
    PopChoose = 0x010B,
    PopResponse = 0x010C,
    Disconnect = 0x010D,
    SyncState = 0x010E,
    OrphanPane = 0x010F,
    ListOrphaned = 0x0110,
    AdoptPane = 0x0111,
    KillPane = 0x0112,
    SetSticky = 0x0113,
    FindSticky = 0x0114,
    PaneInfo = 0x0115,
    UpdatePaneAux = 0x0116,
    UpdatePaneName = 0x0117,
    UpdatePaneShell = 0x0118,
    GetPaneCwd = 0x0119,
    ListSessions = 0x011A,
    Ping = 0x011B,
    Pong = 0x011C,
    Ok = 0x011D,
    Error = 0x011E,
    PaneFound = 0x011F,
    PaneNotFound = 0x0120,
    OrphanedPanes = 0x0121,
    SessionsList = 0x0122,
    SessionReattached = 0x0123,
    SessionDetached = 0x0124,
    SendKeys = 0x0125,
    BroadcastNotify = 0x0126,
    TargetedNotify = 0x0127,
    Status = 0x0128,
    FocusMove = 0x0129,
    ExitIntent = 0x012A,
    ExitIntentResult = 0x012B,
    FloatRequest = 0x012C,
    FloatCreated = 0x012D,
    FloatResult = 0x012E,
    PaneExited = 0x012F,

    CwdChanged = 0x0400,
    FgChanged = 0x0401,
    ShellEvent = 0x0402,
    TitleChanged = 0x0403,
    Bell = 0x0404,
    Exited = 0x0405,
    QueryState = 0x0406,
    PodRegister = 0x0407,

    ShpShellEvent = 0x0500,
    ShpPromptReq = 0x0501,
    ShpPromptResp = 0x0502,
}

impl TryFrom<u16> for MsgType {
    type Error = anyhow::Error;

    fn try_from(v: u16) -> anyhow::Result<Self> {
        use MsgType as M;
        Ok(match v {
            0x0100 => M::Register,
            0x0101 => M::Registered,
            0x0102 => M::CreatePane,
            0x0103 => M::PaneCreated,
            0x0104 => M::DestroyPane,
            0x0105 => M::Detach,
            0x0106 => M::Reattach,
            0x0107 => M::SessionState,
            0x0108 => M::LayoutSync,
            0x0109 => M::Notify,
            0x010A => M::PopConfirm,
            0x010B => M::PopChoose,
            0x010C => M::PopResponse,
            0x010D => M::Disconnect,
            0x010E => M::SyncState,
            0x010F => M::OrphanPane,
            0x0110 => M::ListOrphaned,
            0x0111 => M::AdoptPane,
            0x0112 => M::KillPane,
            0x0113 => M::SetSticky,
            0x0114 => M::FindSticky,
            0x0115 => M::PaneInfo,
            0x0116 => M::UpdatePaneAux,
            0x0117 => M::UpdatePaneName,
            0x0118 => M::UpdatePaneShell,
            0x0119 => M::GetPaneCwd,
            0x011A => M::ListSessions,
            0x011B => M::Ping,
            0x011C => M::Pong,
            0x011D => M::Ok,
            0x011E => M::Error,
            0x011F => M::PaneFound,
            0x0120 => M::PaneNotFound,
            0x0121 => M::OrphanedPanes,
            0x0122 => M::SessionsList,
            0x0123 => M::SessionReattached,
            0x0124 => M::SessionDetached,
            0x0125 => M::SendKeys,
            0x0126 => M::BroadcastNotify,
            0x0127 => M::TargetedNotify,
            0x0128 => M::Status,
            0x0129 => M::FocusMove,
            0x012A => M::ExitIntent,
            0x012B => M::ExitIntentResult,
            0x012C => M::FloatRequest,
            0x012D => M::FloatCreated,
            0x012E => M::FloatResult,
            0x012F => M::PaneExited,
            0x0400 => M::CwdChanged,
            0x0401 => M::FgChanged,
            0x0402 => M::ShellEvent,
            0x0403 => M::TitleChanged,
            0x0404 => M::Bell,
            0x0405 => M::Exited,
            0x0406 => M::QueryState,
            0x0407 => M::PodRegister,
            0x0500 => M::ShpShellEvent,
            0x0501 => M::ShpPromptReq,
            0x0502 => M::ShpPromptResp,
            _ => return Err(anyhow!("unknown MsgType {:#06x}", v)),
        })
    }
}

/// Where a pane currently sits in its lifecycle.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PaneState {
    Attached = 0,
    Detached = 1,
    Sticky = 2,
    Orphaned = 3,
}

impl TryFrom<u8> for PaneState {
    type Error = anyhow::Error;

    fn try_from(v: u8) -> anyhow::Result<Self> {
        match v {
            0 => Ok(PaneState::Attached),
            1 => Ok(PaneState::Detached),
            2 => Ok(PaneState::Sticky),
            3 => Ok(PaneState::Orphaned),
            _ => Err(anyhow!("unknown PaneState {}", v)),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DisconnectMode {
    /// Tear the session down, killing its panes.
    Shutdown = 0,
    /// Leave the panes behind as a detached session.
    Detach = 1,
}

impl TryFrom<u8> for DisconnectMode {
    type Error = anyhow::Error;

    fn try_from(v: u8) -> anyhow::Result<Self> {
        match v {
            0 => Ok(DisconnectMode::Shutdown),
            1 => Ok(DisconnectMode::Detach),
            _ => Err(anyhow!("unknown DisconnectMode {}", v)),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FocusDir {
    Left = 0,
    Right = 1,
    Up = 2,
    Down = 3,
}

impl TryFrom<u8> for FocusDir {
    type Error = anyhow::Error;

    fn try_from(v: u8) -> anyhow::Result<Self> {
        match v {
            0 => Ok(FocusDir::Left),
            1 => Ok(FocusDir::Right),
            2 => Ok(FocusDir::Up),
            3 => Ok(FocusDir::Down),
            _ => Err(anyhow!("unknown FocusDir {}", v)),
        }
    }
}

/// Which shell hook fired.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ShellPhase {
    /// Right before the prompt is drawn (a command just finished).
    Precmd = 0,
    /// Right before a command starts executing.
    Preexec = 1,
}

impl TryFrom<u8> for ShellPhase {
    type Error = anyhow::Error;

    fn try_from(v: u8) -> anyhow::Result<Self> {
        match v {
            0 => Ok(ShellPhase::Precmd),
            1 => Ok(ShellPhase::Preexec),
            _ => Err(anyhow!("unknown ShellPhase {}", v)),
        }
    }
}

macro_rules! empty_msg {
    ($(#[$meta:meta])* $name:ident, $msg_type:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Default)]
        pub struct $name {}

        impl ControlMessage for $name {
            const MSG_TYPE: MsgType = MsgType::$msg_type;

            fn encode_payload(&self, _buf: &mut Vec<u8>) {}

            fn decode_payload(payload: &[u8]) -> anyhow::Result<Self> {
                TrailCursor::new(payload).expect_end()?;
                Ok($name {})
            }
        }
    };
}

macro_rules! uuid_msg {
    ($(#[$meta:meta])* $name:ident, $msg_type:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq)]
        pub struct $name {
            pub uuid: Uuid,
        }

        impl ControlMessage for $name {
            const MSG_TYPE: MsgType = MsgType::$msg_type;

            fn encode_payload(&self, buf: &mut Vec<u8>) {
                buf.extend_from_slice(self.uuid.as_bytes());
            }

            fn decode_payload(payload: &[u8]) -> anyhow::Result<Self> {
                let mut cur = TrailCursor::new(payload);
                let uuid = cur.take_uuid()?;
                cur.expect_end()?;
                Ok($name { uuid })
            }
        }
    };
}

//
// C1: mux -> ses control
//

/// The first message on every C1 connection.
///
/// The session id is chosen by the mux at startup and rendered as 32
/// lowercase hex chars on the wire. `keepalive` asks ses to keep the
/// panes around as a detached session if this client goes away
/// ungracefully.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Register {
    pub session_id: Uuid,
    pub keepalive: bool,
    pub name: String,
}

impl ControlMessage for Register {
    const MSG_TYPE: MsgType = MsgType::Register;

    fn encode_payload(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(self.session_id.to_hex().as_bytes());
        buf.push(self.keepalive as u8);
        put_u16(buf, self.name.len() as u16);
        buf.extend_from_slice(self.name.as_bytes());
    }

    fn decode_payload(payload: &[u8]) -> anyhow::Result<Self> {
        let mut cur = TrailCursor::new(payload);
        let session_id = cur.take_hex_uuid()?;
        let keepalive = cur.take_u8()? != 0;
        let name_len = cur.take_u16()? as usize;
        let name = cur.take_string(name_len)?;
        cur.expect_end()?;
        Ok(Register { session_id, keepalive, name })
    }
}

empty_msg!(
    /// Ack for a `Register`.
    Registered,
    Registered
);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreatePane {
    pub cols: u16,
    pub rows: u16,
    /// Command to run instead of the user's default shell; empty for
    /// the default.
    pub shell: String,
    /// Initial working directory; empty for the user's home dir.
    pub cwd: String,
}

impl ControlMessage for CreatePane {
    const MSG_TYPE: MsgType = MsgType::CreatePane;

    fn encode_payload(&self, buf: &mut Vec<u8>) {
        put_u16(buf, self.cols);
        put_u16(buf, self.rows);
        put_u16(buf, self.shell.len() as u16);
        put_u16(buf, self.cwd.len() as u16);
        buf.extend_from_slice(self.shell.as_bytes());
        buf.extend_from_slice(self.cwd.as_bytes());
    }

    fn decode_payload(payload: &[u8]) -> anyhow::Result<Self> {
        let mut cur = TrailCursor::new(payload);
        let cols = cur.take_u16()?;
        let rows = cur.take_u16()?;
        let shell_len = cur.take_u16()? as usize;
        let cwd_len = cur.take_u16()? as usize;
        let shell = cur.take_string(shell_len)?;
        let cwd = cur.take_string(cwd_len)?;
        cur.expect_end()?;
        Ok(CreatePane { cols, rows, shell, cwd })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PaneCreated {
    pub uuid: Uuid,
    pub pane_id: u16,
    pub pod_pid: i32,
    pub socket_path: String,
}

impl ControlMessage for PaneCreated {
    const MSG_TYPE: MsgType = MsgType::PaneCreated;

    fn encode_payload(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(self.uuid.as_bytes());
        put_u16(buf, self.pane_id);
        put_i32(buf, self.pod_pid);
        put_u16(buf, self.socket_path.len() as u16);
        buf.extend_from_slice(self.socket_path.as_bytes());
    }

    fn decode_payload(payload: &[u8]) -> anyhow::Result<Self> {
        let mut cur = TrailCursor::new(payload);
        let uuid = cur.take_uuid()?;
        let pane_id = cur.take_u16()?;
        let pod_pid = cur.take_i32()?;
        let socket_len = cur.take_u16()? as usize;
        let socket_path = cur.take_string(socket_len)?;
        cur.expect_end()?;
        Ok(PaneCreated { uuid, pane_id, pod_pid, socket_path })
    }
}

uuid_msg!(
    /// Ask the pod to hang up its shell and exit (graceful kill).
    DestroyPane,
    DestroyPane
);
uuid_msg!(
    /// Forcefully kill the pod.
    KillPane,
    KillPane
);
uuid_msg!(OrphanPane, OrphanPane);
uuid_msg!(AdoptPane, AdoptPane);
uuid_msg!(PaneInfo, PaneInfo);
uuid_msg!(GetPaneCwd, GetPaneCwd);

/// Gracefully park this client's panes as a detached session,
/// remembering the mux's layout blob for the eventual reattach.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Detach {
    pub session_id: Uuid,
    pub layout: Vec<u8>,
}

impl ControlMessage for Detach {
    const MSG_TYPE: MsgType = MsgType::Detach;

    fn encode_payload(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(self.session_id.to_hex().as_bytes());
        put_u32(buf, self.layout.len() as u32);
        buf.extend_from_slice(&self.layout);
    }

    fn decode_payload(payload: &[u8]) -> anyhow::Result<Self> {
        let mut cur = TrailCursor::new(payload);
        let session_id = cur.take_hex_uuid()?;
        let layout_len = cur.take_u32()? as usize;
        let layout = cur.take(layout_len)?.to_vec();
        cur.expect_end()?;
        Ok(Detach { session_id, layout })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionDetached {
    pub session_id: Uuid,
}

impl ControlMessage for SessionDetached {
    const MSG_TYPE: MsgType = MsgType::SessionDetached;

    fn encode_payload(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(self.session_id.to_hex().as_bytes());
    }

    fn decode_payload(payload: &[u8]) -> anyhow::Result<Self> {
        let mut cur = TrailCursor::new(payload);
        let session_id = cur.take_hex_uuid()?;
        cur.expect_end()?;
        Ok(SessionDetached { session_id })
    }
}

/// Claim a detached session by session-id hex prefix or session name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reattach {
    pub prefix: String,
}

impl ControlMessage for Reattach {
    const MSG_TYPE: MsgType = MsgType::Reattach;

    fn encode_payload(&self, buf: &mut Vec<u8>) {
        put_u16(buf, self.prefix.len() as u16);
        buf.extend_from_slice(self.prefix.as_bytes());
    }

    fn decode_payload(payload: &[u8]) -> anyhow::Result<Self> {
        let mut cur = TrailCursor::new(payload);
        let prefix_len = cur.take_u16()? as usize;
        let prefix = cur.take_string(prefix_len)?;
        cur.expect_end()?;
        Ok(Reattach { prefix })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionReattached {
    pub layout: Vec<u8>,
    pub panes: Vec<Uuid>,
}

impl ControlMessage for SessionReattached {
    const MSG_TYPE: MsgType = MsgType::SessionReattached;

    fn encode_payload(&self, buf: &mut Vec<u8>) {
        put_u32(buf, self.layout.len() as u32);
        put_u16(buf, self.panes.len() as u16);
        buf.extend_from_slice(&self.layout);
        for uuid in self.panes.iter() {
            buf.extend_from_slice(uuid.as_bytes());
        }
    }

    fn decode_payload(payload: &[u8]) -> anyhow::Result<Self> {
        let mut cur = TrailCursor::new(payload);
        let layout_len = cur.take_u32()? as usize;
        let pane_count = cur.take_u16()? as usize;
        let layout = cur.take(layout_len)?.to_vec();
        let mut panes = Vec::with_capacity(pane_count);
        for _ in 0..pane_count {
            panes.push(cur.take_uuid()?);
        }
        cur.expect_end()?;
        Ok(SessionReattached { layout, panes })
    }
}

/// Fire-and-forget push of the mux's current layout. Ses keeps the
/// latest blob so an implicit detach (mux crash with keepalive) still
/// has a layout to store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LayoutSync {
    pub layout: Vec<u8>,
}

impl ControlMessage for LayoutSync {
    const MSG_TYPE: MsgType = MsgType::LayoutSync;

    fn encode_payload(&self, buf: &mut Vec<u8>) {
        put_u32(buf, self.layout.len() as u32);
        buf.extend_from_slice(&self.layout);
    }

    fn decode_payload(payload: &[u8]) -> anyhow::Result<Self> {
        let mut cur = TrailCursor::new(payload);
        let layout_len = cur.take_u32()? as usize;
        let layout = cur.take(layout_len)?.to_vec();
        cur.expect_end()?;
        Ok(LayoutSync { layout })
    }
}

/// Per-pane terminal state pushed by the mux so reattach snapshots and
/// `status --full` stay accurate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncState {
    pub uuid: Uuid,
    pub cols: u16,
    pub rows: u16,
    pub cursor_col: u16,
    pub cursor_row: u16,
    pub cursor_style: u8,
    pub cursor_visible: bool,
    pub alt_screen: bool,
}

impl ControlMessage for SyncState {
    const MSG_TYPE: MsgType = MsgType::SyncState;

    fn encode_payload(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(self.uuid.as_bytes());
        put_u16(buf, self.cols);
        put_u16(buf, self.rows);
        put_u16(buf, self.cursor_col);
        put_u16(buf, self.cursor_row);
        buf.push(self.cursor_style);
        buf.push(self.cursor_visible as u8);
        buf.push(self.alt_screen as u8);
    }

    fn decode_payload(payload: &[u8]) -> anyhow::Result<Self> {
        let mut cur = TrailCursor::new(payload);
        let uuid = cur.take_uuid()?;
        let cols = cur.take_u16()?;
        let rows = cur.take_u16()?;
        let cursor_col = cur.take_u16()?;
        let cursor_row = cur.take_u16()?;
        let cursor_style = cur.take_u8()?;
        let cursor_visible = cur.take_u8()? != 0;
        let alt_screen = cur.take_u8()? != 0;
        cur.expect_end()?;
        Ok(SyncState {
            uuid,
            cols,
            rows,
            cursor_col,
            cursor_row,
            cursor_style,
            cursor_visible,
            alt_screen,
        })
    }
}

/// The reply to a `Status` request: an opaque JSON document describing
/// the registry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionState {
    pub state: Vec<u8>,
}

impl ControlMessage for SessionState {
    const MSG_TYPE: MsgType = MsgType::SessionState;

    fn encode_payload(&self, buf: &mut Vec<u8>) {
        put_u32(buf, self.state.len() as u32);
        buf.extend_from_slice(&self.state);
    }

    fn decode_payload(payload: &[u8]) -> anyhow::Result<Self> {
        let mut cur = TrailCursor::new(payload);
        let state_len = cur.take_u32()? as usize;
        let state = cur.take(state_len)?.to_vec();
        cur.expect_end()?;
        Ok(SessionState { state })
    }
}

macro_rules! text_msg {
    ($(#[$meta:meta])* $name:ident, $msg_type:ident, $field:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq)]
        pub struct $name {
            pub $field: String,
        }

        impl ControlMessage for $name {
            const MSG_TYPE: MsgType = MsgType::$msg_type;

            fn encode_payload(&self, buf: &mut Vec<u8>) {
                put_u16(buf, self.$field.len() as u16);
                buf.extend_from_slice(self.$field.as_bytes());
            }

            fn decode_payload(payload: &[u8]) -> anyhow::Result<Self> {
                let mut cur = TrailCursor::new(payload);
                let len = cur.take_u16()? as usize;
                let $field = cur.take_string(len)?;
                cur.expect_end()?;
                Ok($name { $field })
            }
        }
    };
}

text_msg!(
    /// A notification for the client's own mux to render.
    Notify,
    Notify,
    text
);
text_msg!(
    /// A notification relayed to every attached mux.
    BroadcastNotify,
    BroadcastNotify,
    text
);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TargetedNotify {
    /// A session id, pane uuid, or 4-31 char case-insensitive prefix
    /// of either (or of a session name).
    pub target: String,
    pub text: String,
}

impl ControlMessage for TargetedNotify {
    const MSG_TYPE: MsgType = MsgType::TargetedNotify;

    fn encode_payload(&self, buf: &mut Vec<u8>) {
        put_u16(buf, self.target.len() as u16);
        put_u16(buf, self.text.len() as u16);
        buf.extend_from_slice(self.target.as_bytes());
        buf.extend_from_slice(self.text.as_bytes());
    }

    fn decode_payload(payload: &[u8]) -> anyhow::Result<Self> {
        let mut cur = TrailCursor::new(payload);
        let target_len = cur.take_u16()? as usize;
        let text_len = cur.take_u16()? as usize;
        let target = cur.take_string(target_len)?;
        let text = cur.take_string(text_len)?;
        cur.expect_end()?;
        Ok(TargetedNotify { target, text })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PopConfirm {
    pub target: String,
    pub title: String,
    pub body: String,
}

impl ControlMessage for PopConfirm {
    const MSG_TYPE: MsgType = MsgType::PopConfirm;

    fn encode_payload(&self, buf: &mut Vec<u8>) {
        put_u16(buf, self.target.len() as u16);
        put_u16(buf, self.title.len() as u16);
        put_u16(buf, self.body.len() as u16);
        buf.extend_from_slice(self.target.as_bytes());
        buf.extend_from_slice(self.title.as_bytes());
        buf.extend_from_slice(self.body.as_bytes());
    }

    fn decode_payload(payload: &[u8]) -> anyhow::Result<Self> {
        let mut cur = TrailCursor::new(payload);
        let target_len = cur.take_u16()? as usize;
        let title_len = cur.take_u16()? as usize;
        let body_len = cur.take_u16()? as usize;
        let target = cur.take_string(target_len)?;
        let title = cur.take_string(title_len)?;
        let body = cur.take_string(body_len)?;
        cur.expect_end()?;
        Ok(PopConfirm { target, title, body })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PopChoose {
    pub target: String,
    pub prompt: String,
    pub options: Vec<String>,
}

impl ControlMessage for PopChoose {
    const MSG_TYPE: MsgType = MsgType::PopChoose;

    fn encode_payload(&self, buf: &mut Vec<u8>) {
        put_u16(buf, self.target.len() as u16);
        put_u16(buf, self.prompt.len() as u16);
        put_u16(buf, self.options.len() as u16);
        buf.extend_from_slice(self.target.as_bytes());
        buf.extend_from_slice(self.prompt.as_bytes());
        for opt in self.options.iter() {
            put_u16(buf, opt.len() as u16);
            buf.extend_from_slice(opt.as_bytes());
        }
    }

    fn decode_payload(payload: &[u8]) -> anyhow::Result<Self> {
        let mut cur = TrailCursor::new(payload);
        let target_len = cur.take_u16()? as usize;
        let prompt_len = cur.take_u16()? as usize;
        let option_count = cur.take_u16()? as usize;
        let target = cur.take_string(target_len)?;
        let prompt = cur.take_string(prompt_len)?;
        let mut options = Vec::with_capacity(option_count);
        for _ in 0..option_count {
            let len = cur.take_u16()? as usize;
            options.push(cur.take_string(len)?);
        }
        cur.expect_end()?;
        Ok(PopChoose { target, prompt, options })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PopResponse {
    pub accepted: bool,
    pub choice: u16,
    pub text: String,
}

impl ControlMessage for PopResponse {
    const MSG_TYPE: MsgType = MsgType::PopResponse;

    fn encode_payload(&self, buf: &mut Vec<u8>) {
        buf.push(self.accepted as u8);
        put_u16(buf, self.choice);
        put_u16(buf, self.text.len() as u16);
        buf.extend_from_slice(self.text.as_bytes());
    }

    fn decode_payload(payload: &[u8]) -> anyhow::Result<Self> {
        let mut cur = TrailCursor::new(payload);
        let accepted = cur.take_u8()? != 0;
        let choice = cur.take_u16()?;
        let text_len = cur.take_u16()? as usize;
        let text = cur.take_string(text_len)?;
        cur.expect_end()?;
        Ok(PopResponse { accepted, choice, text })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Disconnect {
    pub mode: DisconnectMode,
    /// When shutting down, leave sticky panes behind for a later
    /// `find_sticky`.
    pub preserve_sticky: bool,
}

impl ControlMessage for Disconnect {
    const MSG_TYPE: MsgType = MsgType::Disconnect;

    fn encode_payload(&self, buf: &mut Vec<u8>) {
        buf.push(self.mode as u8);
        buf.push(self.preserve_sticky as u8);
    }

    fn decode_payload(payload: &[u8]) -> anyhow::Result<Self> {
        let mut cur = TrailCursor::new(payload);
        let mode = DisconnectMode::try_from(cur.take_u8()?)?;
        let preserve_sticky = cur.take_u8()? != 0;
        cur.expect_end()?;
        Ok(Disconnect { mode, preserve_sticky })
    }
}

empty_msg!(ListOrphaned, ListOrphaned);
empty_msg!(ListSessions, ListSessions);
empty_msg!(Ping, Ping);
empty_msg!(Pong, Pong);
empty_msg!(
    /// A cli tool is asking "is it ok to exit the terminal?". Ses
    /// forwards to the mux and parks the cli fd until the
    /// `ExitIntentResult` comes back.
    ExitIntent,
    ExitIntent
);
empty_msg!(PaneNotFound, PaneNotFound);

/// A pane described for `pane_found` / `orphaned_panes` replies.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PaneSnapshot {
    pub uuid: Uuid,
    pub pane_id: u16,
    pub pod_pid: i32,
    pub state: PaneState,
    pub cwd: String,
    pub name: String,
    pub fg: String,
}

impl PaneSnapshot {
    fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(self.uuid.as_bytes());
        put_u16(buf, self.pane_id);
        put_i32(buf, self.pod_pid);
        buf.push(self.state as u8);
        put_u16(buf, self.cwd.len() as u16);
        put_u16(buf, self.name.len() as u16);
        put_u16(buf, self.fg.len() as u16);
        buf.extend_from_slice(self.cwd.as_bytes());
        buf.extend_from_slice(self.name.as_bytes());
        buf.extend_from_slice(self.fg.as_bytes());
    }

    fn decode_from(cur: &mut TrailCursor) -> anyhow::Result<Self> {
        let uuid = cur.take_uuid()?;
        let pane_id = cur.take_u16()?;
        let pod_pid = cur.take_i32()?;
        let state = PaneState::try_from(cur.take_u8()?)?;
        let cwd_len = cur.take_u16()? as usize;
        let name_len = cur.take_u16()? as usize;
        let fg_len = cur.take_u16()? as usize;
        let cwd = cur.take_string(cwd_len)?;
        let name = cur.take_string(name_len)?;
        let fg = cur.take_string(fg_len)?;
        Ok(PaneSnapshot { uuid, pane_id, pod_pid, state, cwd, name, fg })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PaneFound {
    pub pane: PaneSnapshot,
}

impl ControlMessage for PaneFound {
    const MSG_TYPE: MsgType = MsgType::PaneFound;

    fn encode_payload(&self, buf: &mut Vec<u8>) {
        self.pane.encode_into(buf);
    }

    fn decode_payload(payload: &[u8]) -> anyhow::Result<Self> {
        let mut cur = TrailCursor::new(payload);
        let pane = PaneSnapshot::decode_from(&mut cur)?;
        cur.expect_end()?;
        Ok(PaneFound { pane })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OrphanedPanes {
    pub panes: Vec<PaneSnapshot>,
}

impl ControlMessage for OrphanedPanes {
    const MSG_TYPE: MsgType = MsgType::OrphanedPanes;

    fn encode_payload(&self, buf: &mut Vec<u8>) {
        put_u16(buf, self.panes.len() as u16);
        for pane in self.panes.iter() {
            pane.encode_into(buf);
        }
    }

    fn decode_payload(payload: &[u8]) -> anyhow::Result<Self> {
        let mut cur = TrailCursor::new(payload);
        let count = cur.take_u16()? as usize;
        let mut panes = Vec::with_capacity(count);
        for _ in 0..count {
            panes.push(PaneSnapshot::decode_from(&mut cur)?);
        }
        cur.expect_end()?;
        Ok(OrphanedPanes { panes })
    }
}

/// Bind a pane to (pwd, key) so a later mux can reclaim it with
/// `find_sticky` even after this client is gone.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SetSticky {
    pub uuid: Uuid,
    pub key: u8,
    pub pwd: String,
}

impl ControlMessage for SetSticky {
    const MSG_TYPE: MsgType = MsgType::SetSticky;

    fn encode_payload(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(self.uuid.as_bytes());
        buf.push(self.key);
        put_u16(buf, self.pwd.len() as u16);
        buf.extend_from_slice(self.pwd.as_bytes());
    }

    fn decode_payload(payload: &[u8]) -> anyhow::Result<Self> {
        let mut cur = TrailCursor::new(payload);
        let uuid = cur.take_uuid()?;
        let key = cur.take_u8()?;
        let pwd_len = cur.take_u16()? as usize;
        let pwd = cur.take_string(pwd_len)?;
        cur.expect_end()?;
        Ok(SetSticky { uuid, key, pwd })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FindSticky {
    pub key: u8,
    pub pwd: String,
}

impl ControlMessage for FindSticky {
    const MSG_TYPE: MsgType = MsgType::FindSticky;

    fn encode_payload(&self, buf: &mut Vec<u8>) {
        buf.push(self.key);
        put_u16(buf, self.pwd.len() as u16);
        buf.extend_from_slice(self.pwd.as_bytes());
    }

    fn decode_payload(payload: &[u8]) -> anyhow::Result<Self> {
        let mut cur = TrailCursor::new(payload);
        let key = cur.take_u8()?;
        let pwd_len = cur.take_u16()? as usize;
        let pwd = cur.take_string(pwd_len)?;
        cur.expect_end()?;
        Ok(FindSticky { key, pwd })
    }
}

/// Auxiliary pane attributes the mux learned from its own tracking
/// (last command, exit status, duration, job count).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpdatePaneAux {
    pub uuid: Uuid,
    pub last_status: i32,
    pub last_duration_ms: u64,
    pub job_count: u16,
    pub cmd: String,
}

impl ControlMessage for UpdatePaneAux {
    const MSG_TYPE: MsgType = MsgType::UpdatePaneAux;

    fn encode_payload(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(self.uuid.as_bytes());
        put_i32(buf, self.last_status);
        put_u64(buf, self.last_duration_ms);
        put_u16(buf, self.job_count);
        put_u16(buf, self.cmd.len() as u16);
        buf.extend_from_slice(self.cmd.as_bytes());
    }

    fn decode_payload(payload: &[u8]) -> anyhow::Result<Self> {
        let mut cur = TrailCursor::new(payload);
        let uuid = cur.take_uuid()?;
        let last_status = cur.take_i32()?;
        let last_duration_ms = cur.take_u64()?;
        let job_count = cur.take_u16()?;
        let cmd_len = cur.take_u16()? as usize;
        let cmd = cur.take_string(cmd_len)?;
        cur.expect_end()?;
        Ok(UpdatePaneAux { uuid, last_status, last_duration_ms, job_count, cmd })
    }
}

macro_rules! uuid_text_msg {
    ($(#[$meta:meta])* $name:ident, $msg_type:ident, $field:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq)]
        pub struct $name {
            pub uuid: Uuid,
            pub $field: String,
        }

        impl ControlMessage for $name {
            const MSG_TYPE: MsgType = MsgType::$msg_type;

            fn encode_payload(&self, buf: &mut Vec<u8>) {
                buf.extend_from_slice(self.uuid.as_bytes());
                put_u16(buf, self.$field.len() as u16);
                buf.extend_from_slice(self.$field.as_bytes());
            }

            fn decode_payload(payload: &[u8]) -> anyhow::Result<Self> {
                let mut cur = TrailCursor::new(payload);
                let uuid = cur.take_uuid()?;
                let len = cur.take_u16()? as usize;
                let $field = cur.take_string(len)?;
                cur.expect_end()?;
                Ok($name { uuid, $field })
            }
        }
    };
}

uuid_text_msg!(UpdatePaneName, UpdatePaneName, name);
uuid_text_msg!(UpdatePaneShell, UpdatePaneShell, shell);

text_msg!(
    /// A generic positive ack. `detail` carries the answer for simple
    /// queries like `get_pane_cwd`.
    OkReply,
    Ok,
    detail
);
text_msg!(
    /// A semantic error with a short reason code string, e.g.
    /// "session_not_found" or "ambiguous_session_id". The connection
    /// stays up.
    ErrorReply,
    Error,
    reason
);

/// One session described in a `sessions_list` reply.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionEntry {
    pub session_id: Uuid,
    pub pane_count: u16,
    pub attached: bool,
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionsList {
    pub sessions: Vec<SessionEntry>,
}

impl ControlMessage for SessionsList {
    const MSG_TYPE: MsgType = MsgType::SessionsList;

    fn encode_payload(&self, buf: &mut Vec<u8>) {
        put_u16(buf, self.sessions.len() as u16);
        for s in self.sessions.iter() {
            buf.extend_from_slice(s.session_id.to_hex().as_bytes());
            put_u16(buf, s.pane_count);
            buf.push(s.attached as u8);
            put_u16(buf, s.name.len() as u16);
            buf.extend_from_slice(s.name.as_bytes());
        }
    }

    fn decode_payload(payload: &[u8]) -> anyhow::Result<Self> {
        let mut cur = TrailCursor::new(payload);
        let count = cur.take_u16()? as usize;
        let mut sessions = Vec::with_capacity(count);
        for _ in 0..count {
            let session_id = cur.take_hex_uuid()?;
            let pane_count = cur.take_u16()?;
            let attached = cur.take_u8()? != 0;
            let name_len = cur.take_u16()? as usize;
            let name = cur.take_string(name_len)?;
            sessions.push(SessionEntry { session_id, pane_count, attached, name });
        }
        cur.expect_end()?;
        Ok(SessionsList { sessions })
    }
}

/// Inject raw key bytes into a target pane as if the user typed them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SendKeys {
    pub target: String,
    pub keys: Vec<u8>,
}

impl ControlMessage for SendKeys {
    const MSG_TYPE: MsgType = MsgType::SendKeys;

    fn encode_payload(&self, buf: &mut Vec<u8>) {
        put_u16(buf, self.target.len() as u16);
        put_u32(buf, self.keys.len() as u32);
        buf.extend_from_slice(self.target.as_bytes());
        buf.extend_from_slice(&self.keys);
    }

    fn decode_payload(payload: &[u8]) -> anyhow::Result<Self> {
        let mut cur = TrailCursor::new(payload);
        let target_len = cur.take_u16()? as usize;
        let keys_len = cur.take_u32()? as usize;
        let target = cur.take_string(target_len)?;
        let keys = cur.take(keys_len)?.to_vec();
        cur.expect_end()?;
        Ok(SendKeys { target, keys })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Status {
    pub full: bool,
}

impl ControlMessage for Status {
    const MSG_TYPE: MsgType = MsgType::Status;

    fn encode_payload(&self, buf: &mut Vec<u8>) {
        buf.push(self.full as u8);
    }

    fn decode_payload(payload: &[u8]) -> anyhow::Result<Self> {
        let mut cur = TrailCursor::new(payload);
        let full = cur.take_u8()? != 0;
        cur.expect_end()?;
        Ok(Status { full })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FocusMove {
    pub dir: FocusDir,
}

impl ControlMessage for FocusMove {
    const MSG_TYPE: MsgType = MsgType::FocusMove;

    fn encode_payload(&self, buf: &mut Vec<u8>) {
        buf.push(self.dir as u8);
    }

    fn decode_payload(payload: &[u8]) -> anyhow::Result<Self> {
        let mut cur = TrailCursor::new(payload);
        let dir = FocusDir::try_from(cur.take_u8()?)?;
        cur.expect_end()?;
        Ok(FocusMove { dir })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExitIntentResult {
    pub allow: bool,
}

impl ControlMessage for ExitIntentResult {
    const MSG_TYPE: MsgType = MsgType::ExitIntentResult;

    fn encode_payload(&self, buf: &mut Vec<u8>) {
        buf.push(self.allow as u8);
    }

    fn decode_payload(payload: &[u8]) -> anyhow::Result<Self> {
        let mut cur = TrailCursor::new(payload);
        let allow = cur.take_u8()? != 0;
        cur.expect_end()?;
        Ok(ExitIntentResult { allow })
    }
}

/// Ask the mux to open a floating pane running `cmd`. The request id
/// correlates the eventual `float_created`/`float_result` back to the
/// waiting cli connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FloatRequest {
    pub request_id: Uuid,
    pub cmd: String,
    pub cwd: String,
}

impl ControlMessage for FloatRequest {
    const MSG_TYPE: MsgType = MsgType::FloatRequest;

    fn encode_payload(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(self.request_id.as_bytes());
        put_u16(buf, self.cmd.len() as u16);
        put_u16(buf, self.cwd.len() as u16);
        buf.extend_from_slice(self.cmd.as_bytes());
        buf.extend_from_slice(self.cwd.as_bytes());
    }

    fn decode_payload(payload: &[u8]) -> anyhow::Result<Self> {
        let mut cur = TrailCursor::new(payload);
        let request_id = cur.take_uuid()?;
        let cmd_len = cur.take_u16()? as usize;
        let cwd_len = cur.take_u16()? as usize;
        let cmd = cur.take_string(cmd_len)?;
        let cwd = cur.take_string(cwd_len)?;
        cur.expect_end()?;
        Ok(FloatRequest { request_id, cmd, cwd })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FloatCreated {
    pub request_id: Uuid,
    pub pane_uuid: Uuid,
}

impl ControlMessage for FloatCreated {
    const MSG_TYPE: MsgType = MsgType::FloatCreated;

    fn encode_payload(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(self.request_id.as_bytes());
        buf.extend_from_slice(self.pane_uuid.as_bytes());
    }

    fn decode_payload(payload: &[u8]) -> anyhow::Result<Self> {
        let mut cur = TrailCursor::new(payload);
        let request_id = cur.take_uuid()?;
        let pane_uuid = cur.take_uuid()?;
        cur.expect_end()?;
        Ok(FloatCreated { request_id, pane_uuid })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FloatResult {
    pub request_id: Uuid,
    pub status: i32,
    pub detail: String,
}

impl ControlMessage for FloatResult {
    const MSG_TYPE: MsgType = MsgType::FloatResult;

    fn encode_payload(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(self.request_id.as_bytes());
        put_i32(buf, self.status);
        put_u16(buf, self.detail.len() as u16);
        buf.extend_from_slice(self.detail.as_bytes());
    }

    fn decode_payload(payload: &[u8]) -> anyhow::Result<Self> {
        let mut cur = TrailCursor::new(payload);
        let request_id = cur.take_uuid()?;
        let status = cur.take_i32()?;
        let detail_len = cur.take_u16()? as usize;
        let detail = cur.take_string(detail_len)?;
        cur.expect_end()?;
        Ok(FloatResult { request_id, status, detail })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PaneExited {
    pub uuid: Uuid,
    pub status: i32,
}

impl ControlMessage for PaneExited {
    const MSG_TYPE: MsgType = MsgType::PaneExited;

    fn encode_payload(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(self.uuid.as_bytes());
        put_i32(buf, self.status);
    }

    fn decode_payload(payload: &[u8]) -> anyhow::Result<Self> {
        let mut cur = TrailCursor::new(payload);
        let uuid = cur.take_uuid()?;
        let status = cur.take_i32()?;
        cur.expect_end()?;
        Ok(PaneExited { uuid, status })
    }
}

//
// C4: pod -> ses control
//

uuid_text_msg!(
    /// The pod's /proc scraper noticed the shell changed directory.
    CwdChanged,
    CwdChanged,
    cwd
);
uuid_text_msg!(TitleChanged, TitleChanged, title);
uuid_msg!(Bell, Bell);
uuid_msg!(
    /// Ses asking the pod for a fresh metadata push (sent toward the
    /// pod on the C4 socket after a reattach or adopt).
    QueryState,
    QueryState
);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FgChanged {
    pub uuid: Uuid,
    pub fg_pid: i32,
    pub name: String,
}

impl ControlMessage for FgChanged {
    const MSG_TYPE: MsgType = MsgType::FgChanged;

    fn encode_payload(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(self.uuid.as_bytes());
        put_i32(buf, self.fg_pid);
        put_u16(buf, self.name.len() as u16);
        buf.extend_from_slice(self.name.as_bytes());
    }

    fn decode_payload(payload: &[u8]) -> anyhow::Result<Self> {
        let mut cur = TrailCursor::new(payload);
        let uuid = cur.take_uuid()?;
        let fg_pid = cur.take_i32()?;
        let name_len = cur.take_u16()? as usize;
        let name = cur.take_string(name_len)?;
        cur.expect_end()?;
        Ok(FgChanged { uuid, fg_pid, name })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Exited {
    pub uuid: Uuid,
    pub status: i32,
}

impl ControlMessage for Exited {
    const MSG_TYPE: MsgType = MsgType::Exited;

    fn encode_payload(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(self.uuid.as_bytes());
        put_i32(buf, self.status);
    }

    fn decode_payload(payload: &[u8]) -> anyhow::Result<Self> {
        let mut cur = TrailCursor::new(payload);
        let uuid = cur.take_uuid()?;
        let status = cur.take_i32()?;
        cur.expect_end()?;
        Ok(Exited { uuid, status })
    }
}

/// The first message a pod sends after its C4 handshake. Lets a
/// freshly restarted ses verify or rebuild its pane record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PodRegister {
    pub uuid: Uuid,
    pub pod_pid: i32,
    pub child_pid: i32,
    pub cols: u16,
    pub rows: u16,
    pub socket_path: String,
}

impl ControlMessage for PodRegister {
    const MSG_TYPE: MsgType = MsgType::PodRegister;

    fn encode_payload(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(self.uuid.as_bytes());
        put_i32(buf, self.pod_pid);
        put_i32(buf, self.child_pid);
        put_u16(buf, self.cols);
        put_u16(buf, self.rows);
        put_u16(buf, self.socket_path.len() as u16);
        buf.extend_from_slice(self.socket_path.as_bytes());
    }

    fn decode_payload(payload: &[u8]) -> anyhow::Result<Self> {
        let mut cur = TrailCursor::new(payload);
        let uuid = cur.take_uuid()?;
        let pod_pid = cur.take_i32()?;
        let child_pid = cur.take_i32()?;
        let cols = cur.take_u16()?;
        let rows = cur.take_u16()?;
        let socket_len = cur.take_u16()? as usize;
        let socket_path = cur.take_string(socket_len)?;
        cur.expect_end()?;
        Ok(PodRegister { uuid, pod_pid, child_pid, cols, rows, socket_path })
    }
}

/// The per-command metadata a shell hook publishes: what ran, how it
/// went, and where the shell is now.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShellEventBody {
    pub phase: ShellPhase,
    pub status: i32,
    pub duration_ms: u64,
    pub started_at: i64,
    pub jobs: u16,
    pub running: bool,
    pub cmd: String,
    pub cwd: String,
}

impl ShellEventBody {
    fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.push(self.phase as u8);
        put_i32(buf, self.status);
        put_u64(buf, self.duration_ms);
        put_i64(buf, self.started_at);
        put_u16(buf, self.jobs);
        buf.push(self.running as u8);
        put_u16(buf, self.cmd.len() as u16);
        put_u16(buf, self.cwd.len() as u16);
        buf.extend_from_slice(self.cmd.as_bytes());
        buf.extend_from_slice(self.cwd.as_bytes());
    }

    fn decode_from(cur: &mut TrailCursor) -> anyhow::Result<Self> {
        let phase = ShellPhase::try_from(cur.take_u8()?)?;
        let status = cur.take_i32()?;
        let duration_ms = cur.take_u64()?;
        let started_at = cur.take_i64()?;
        let jobs = cur.take_u16()?;
        let running = cur.take_u8()? != 0;
        let cmd_len = cur.take_u16()? as usize;
        let cwd_len = cur.take_u16()? as usize;
        let cmd = cur.take_string(cmd_len)?;
        let cwd = cur.take_string(cwd_len)?;
        Ok(ShellEventBody { phase, status, duration_ms, started_at, jobs, running, cmd, cwd })
    }
}

/// A shell event forwarded up C4 with the pane uuid prepended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PodShellEvent {
    pub uuid: Uuid,
    pub event: ShellEventBody,
}

impl ControlMessage for PodShellEvent {
    const MSG_TYPE: MsgType = MsgType::ShellEvent;

    fn encode_payload(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(self.uuid.as_bytes());
        self.event.encode_into(buf);
    }

    fn decode_payload(payload: &[u8]) -> anyhow::Result<Self> {
        let mut cur = TrailCursor::new(payload);
        let uuid = cur.take_uuid()?;
        let event = ShellEventBody::decode_from(&mut cur)?;
        cur.expect_end()?;
        Ok(PodShellEvent { uuid, event })
    }
}

//
// C5: shp -> pod control
//

/// A shell event as the hook emits it (no uuid; the pod knows who it
/// is).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShpShellEvent {
    pub event: ShellEventBody,
}

impl ControlMessage for ShpShellEvent {
    const MSG_TYPE: MsgType = MsgType::ShpShellEvent;

    fn encode_payload(&self, buf: &mut Vec<u8>) {
        self.event.encode_into(buf);
    }

    fn decode_payload(payload: &[u8]) -> anyhow::Result<Self> {
        let mut cur = TrailCursor::new(payload);
        let event = ShellEventBody::decode_from(&mut cur)?;
        cur.expect_end()?;
        Ok(ShpShellEvent { event })
    }
}

empty_msg!(ShpPromptReq, ShpPromptReq);
text_msg!(ShpPromptResp, ShpPromptResp, text);

#[cfg(test)]
mod test {
    use super::*;
    use crate::{encode_control, ControlHeader, CONTROL_HEADER_LEN};

    fn round_trip<M: ControlMessage + PartialEq + std::fmt::Debug>(msg: M) {
        let frame = encode_control(&msg);
        let mut header_bytes = [0u8; CONTROL_HEADER_LEN];
        header_bytes.copy_from_slice(&frame[..CONTROL_HEADER_LEN]);
        let header = ControlHeader::decode(&header_bytes).expect("header to decode");
        assert_eq!(header.msg_type, M::MSG_TYPE as u16);
        assert_eq!(header.payload_len as usize, frame.len() - CONTROL_HEADER_LEN);
        let decoded = M::decode_payload(&frame[CONTROL_HEADER_LEN..]).expect("payload to decode");
        assert_eq!(decoded, msg);
        // byte-for-byte: re-encoding the decoded message reproduces the frame
        assert_eq!(encode_control(&decoded), frame);
    }

    fn test_uuid(seed: u8) -> Uuid {
        let mut bytes = [0u8; 16];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = seed.wrapping_add(i as u8);
        }
        Uuid(bytes)
    }

    #[test]
    fn control_round_trips() {
        round_trip(Register {
            session_id: test_uuid(1),
            keepalive: true,
            name: String::from("pikachu"),
        });
        round_trip(Registered {});
        round_trip(CreatePane {
            cols: 80,
            rows: 24,
            shell: String::from("/bin/sh"),
            cwd: String::new(),
        });
        round_trip(PaneCreated {
            uuid: test_uuid(2),
            pane_id: 7,
            pod_pid: 4242,
            socket_path: String::from("/run/hexe/pod-x.sock"),
        });
        round_trip(Detach { session_id: test_uuid(3), layout: vec![1, 2, 3, 0, 255] });
        round_trip(Reattach { prefix: String::from("pika") });
        round_trip(SessionReattached {
            layout: b"{\"panes\":[]}".to_vec(),
            panes: vec![test_uuid(4), test_uuid(5)],
        });
        round_trip(LayoutSync { layout: vec![] });
        round_trip(SyncState {
            uuid: test_uuid(6),
            cols: 120,
            rows: 40,
            cursor_col: 3,
            cursor_row: 9,
            cursor_style: 2,
            cursor_visible: true,
            alt_screen: false,
        });
        round_trip(Disconnect { mode: DisconnectMode::Detach, preserve_sticky: true });
        round_trip(SetSticky { uuid: test_uuid(7), key: b'f', pwd: String::from("/tmp/a") });
        round_trip(FindSticky { key: b'f', pwd: String::from("/tmp/a") });
        round_trip(UpdatePaneAux {
            uuid: test_uuid(8),
            last_status: -1,
            last_duration_ms: 1500,
            job_count: 2,
            cmd: String::from("cargo build"),
        });
        round_trip(ErrorReply { reason: String::from("session_not_found") });
        round_trip(SendKeys { target: String::from("pika"), keys: vec![0x0d, 0x0a] });
        round_trip(PaneExited { uuid: test_uuid(9), status: 130 });
    }

    #[test]
    fn snapshot_round_trips() {
        let pane = PaneSnapshot {
            uuid: test_uuid(10),
            pane_id: 3,
            pod_pid: 999,
            state: PaneState::Orphaned,
            cwd: String::from("/home/me"),
            name: String::from("build"),
            fg: String::from("vim"),
        };
        round_trip(PaneFound { pane: pane.clone() });
        round_trip(OrphanedPanes { panes: vec![pane.clone(), pane] });
        round_trip(SessionsList {
            sessions: vec![SessionEntry {
                session_id: test_uuid(11),
                pane_count: 2,
                attached: false,
                name: String::from("pikachu"),
            }],
        });
    }

    #[test]
    fn pop_round_trips() {
        round_trip(PopConfirm {
            target: String::from("aa"),
            title: String::from("really?"),
            body: String::from("it will be gone"),
        });
        round_trip(PopChoose {
            target: String::new(),
            prompt: String::from("pick one"),
            options: vec![String::from("a"), String::from("b"), String::new()],
        });
        round_trip(PopResponse { accepted: true, choice: 1, text: String::from("b") });
    }

    #[test]
    fn uplink_round_trips() {
        round_trip(CwdChanged { uuid: test_uuid(12), cwd: String::from("/tmp") });
        round_trip(FgChanged { uuid: test_uuid(13), fg_pid: 77, name: String::from("less") });
        round_trip(Exited { uuid: test_uuid(14), status: 0 });
        round_trip(PodRegister {
            uuid: test_uuid(15),
            pod_pid: 11,
            child_pid: 12,
            cols: 80,
            rows: 24,
            socket_path: String::from("/run/hexe/pod-y.sock"),
        });
        let event = ShellEventBody {
            phase: ShellPhase::Precmd,
            status: 1,
            duration_ms: 99,
            started_at: 1700000000,
            jobs: 0,
            running: false,
            cmd: String::from("ls -la"),
            cwd: String::from("/etc"),
        };
        round_trip(PodShellEvent { uuid: test_uuid(16), event: event.clone() });
        round_trip(ShpShellEvent { event });
    }

    #[test]
    fn lying_length_fields_fail_closed() {
        // name_len says 10 but only 3 bytes of trailer follow
        let mut payload = Vec::new();
        Register { session_id: test_uuid(1), keepalive: false, name: String::from("abc") }
            .encode_payload(&mut payload);
        let hex_and_flag = 32 + 1;
        payload[hex_and_flag] = 10; // name_len lives right after the fixed portion
        assert!(Register::decode_payload(&payload).is_err());
    }

    #[test]
    fn trailing_garbage_rejected() {
        let mut payload = Vec::new();
        Ping {}.encode_payload(&mut payload);
        payload.push(0);
        assert!(Ping::decode_payload(&payload).is_err());
    }

    #[test]
    fn msg_type_table() {
        // spot check the values pinned by the wire contract
        assert_eq!(MsgType::Register as u16, 0x0100);
        assert_eq!(MsgType::PaneExited as u16, 0x012F);
        assert_eq!(MsgType::SendKeys as u16, 0x0125);
        assert_eq!(MsgType::CwdChanged as u16, 0x0400);
        assert_eq!(MsgType::PodRegister as u16, 0x0407);
        assert_eq!(MsgType::ShpShellEvent as u16, 0x0500);
        for v in [0x0100u16, 0x012F, 0x0407, 0x0502] {
            assert_eq!(MsgType::try_from(v).expect("known type") as u16, v);
        }
        assert!(MsgType::try_from(0x0200).is_err());
        assert!(MsgType::try_from(0x0130).is_err());
    }
}
