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

use std::{collections::HashMap, fs, path::PathBuf};

use anyhow::Context;
use serde_derive::Deserialize;
use tracing::{info, instrument};

use crate::user;

#[instrument(skip_all)]
pub fn read_config(config_file: &Option<String>) -> anyhow::Result<Config> {
    let mut config = Config::default();
    if let Some(config_path) = config_file {
        info!("parsing explicitly passed in config ({})", config_path);
        let config_str = fs::read_to_string(config_path).context("reading config toml (1)")?;
        config = toml::from_str(&config_str).context("parsing config file (1)")?;
    } else {
        let user_info = user::info()?;
        let mut config_path = PathBuf::from(user_info.home_dir);
        config_path.push(".config");
        config_path.push("hexe");
        config_path.push("config.toml");
        if config_path.exists() {
            let config_str = fs::read_to_string(config_path).context("reading config toml (2)")?;
            config = toml::from_str(&config_str).context("parsing config file (2)")?;
        }
    }

    Ok(config)
}

#[derive(Deserialize, Default, Debug, Clone)]
pub struct Config {
    /// shell overrides the user's default shell for new panes.
    pub shell: Option<String>,

    /// norc makes it so that new shells do not load rc files
    /// when they spawn. Only works with bash, zsh and fish.
    pub norc: Option<bool>,

    /// Capacity of the per-pane replay backlog in bytes.
    pub backlog_bytes: Option<usize>,

    /// a table of environment variables to inject into spawned shells
    pub env: Option<HashMap<String, String>>,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_empty_config() {
        let config: Config = toml::from_str("").expect("blank config to parse");
        assert!(config.shell.is_none());
        assert!(config.backlog_bytes.is_none());
    }

    #[test]
    fn parse_full_config() {
        let config: Config = toml::from_str(
            r#"
            shell = "/bin/zsh"
            norc = true
            backlog_bytes = 1048576

            [env]
            FOO = "bar"
            "#,
        )
        .expect("config to parse");
        assert_eq!(config.shell.as_deref(), Some("/bin/zsh"));
        assert_eq!(config.backlog_bytes, Some(1048576));
        assert_eq!(config.env.expect("env table").get("FOO").map(String::as_str), Some("bar"));
    }
}
