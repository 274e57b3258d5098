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

//! The cli one-shots: each opens a 0x04 connection to ses, sends one
//! control message, prints the reply, and exits. Exit codes are 0 for
//! success and 1 with a message on stderr otherwise; `exit-intent`
//! uses its exit code to carry the mux's answer.

use std::path::Path;

use anyhow::{anyhow, Context};
use hexe_protocol::{
    ExitIntent, ExitIntentResult, FocusDir, FocusMove, ListSessions, Notify, OkReply, PopChoose,
    PopConfirm, PopResponse, SendKeys, SessionState, SessionsList, Status, TargetedNotify,
};

use crate::protocol::CliClient;

pub fn status(sock: &Path, full: bool) -> anyhow::Result<()> {
    let mut client = CliClient::connect(sock)?;
    client.send(&Status { full })?;
    let reply: SessionState = client.expect_reply()?;
    // pretty-print the json document for humans
    let doc: serde_json::Value =
        serde_json::from_slice(&reply.state).context("parsing status document")?;
    println!("{}", serde_json::to_string_pretty(&doc).context("formatting status")?);
    Ok(())
}

pub fn list(sock: &Path) -> anyhow::Result<()> {
    let mut client = CliClient::connect(sock)?;
    client.send(&ListSessions {})?;
    let reply: SessionsList = client.expect_reply()?;
    for s in reply.sessions.iter() {
        println!(
            "{}\t{}\t{}\t{}",
            s.session_id,
            if s.name.is_empty() { "-" } else { &s.name },
            s.pane_count,
            if s.attached { "attached" } else { "detached" },
        );
    }
    Ok(())
}

pub fn notify(sock: &Path, msg: String, target: Option<String>) -> anyhow::Result<()> {
    let mut client = CliClient::connect(sock)?;
    match target {
        Some(target) => {
            client.send(&TargetedNotify { target, text: msg })?;
        }
        None => {
            client.send(&Notify { text: msg })?;
        }
    }
    let _: OkReply = client.expect_reply()?;
    Ok(())
}

pub fn focus_move(sock: &Path, dir: &str) -> anyhow::Result<()> {
    let dir = match dir {
        "left" | "h" => FocusDir::Left,
        "right" | "l" => FocusDir::Right,
        "up" | "k" => FocusDir::Up,
        "down" | "j" => FocusDir::Down,
        other => return Err(anyhow!("unknown direction '{other}'")),
    };
    let mut client = CliClient::connect(sock)?;
    client.send(&FocusMove { dir })?;
    let _: OkReply = client.expect_reply()?;
    Ok(())
}

/// Returns true if exiting is allowed. The caller maps this to the
/// process exit code.
pub fn exit_intent(sock: &Path) -> anyhow::Result<bool> {
    let mut client = CliClient::connect(sock)?;
    client.send(&ExitIntent {})?;
    let reply: ExitIntentResult = client.expect_reply()?;
    Ok(reply.allow)
}

pub fn send_keys(sock: &Path, hex: &str, target: String) -> anyhow::Result<()> {
    let keys = decode_hex(hex)?;
    let mut client = CliClient::connect(sock)?;
    client.send(&SendKeys { target, keys })?;
    let _: OkReply = client.expect_reply()?;
    Ok(())
}

pub fn pop_confirm(
    sock: &Path,
    target: String,
    title: String,
    body: String,
) -> anyhow::Result<()> {
    let mut client = CliClient::connect(sock)?;
    client.send(&PopConfirm { target, title, body })?;
    let reply: PopResponse = client.expect_reply()?;
    if reply.accepted {
        println!("yes");
        Ok(())
    } else {
        println!("no");
        Err(anyhow!("declined"))
    }
}

pub fn pop_choose(
    sock: &Path,
    target: String,
    prompt: String,
    options: Vec<String>,
) -> anyhow::Result<()> {
    if options.is_empty() {
        return Err(anyhow!("no options to choose from"));
    }
    let mut client = CliClient::connect(sock)?;
    client.send(&PopChoose { target, prompt, options })?;
    let reply: PopResponse = client.expect_reply()?;
    if !reply.accepted {
        return Err(anyhow!("cancelled"));
    }
    println!("{}", reply.text);
    Ok(())
}

fn decode_hex(s: &str) -> anyhow::Result<Vec<u8>> {
    let s = s.trim();
    if s.len() % 2 != 0 {
        return Err(anyhow!("hex keys must have an even number of digits"));
    }
    s.as_bytes()
        .chunks(2)
        .map(|pair| {
            let text = std::str::from_utf8(pair).context("bad hex")?;
            u8::from_str_radix(text, 16).context("bad hex digit")
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn hex_decoding() {
        assert_eq!(decode_hex("0d0a").expect("valid hex"), vec![0x0d, 0x0a]);
        assert_eq!(decode_hex("6563686f").expect("valid hex"), b"echo".to_vec());
        assert!(decode_hex("abc").is_err());
        assert!(decode_hex("zz").is_err());
    }
}
