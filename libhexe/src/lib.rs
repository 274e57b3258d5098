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

use std::{fs, io, path::PathBuf, sync::Mutex};

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use hexe_protocol::Uuid;
use tracing::error;
use tracing_subscriber::fmt::format::FmtSpan;

mod cli;
mod config;
mod consts;
mod framing;
mod hook;
mod net;
mod paths;
mod pod;
mod proc_inspect;
mod protocol;
mod ses;
mod tty;
mod user;

/// The command line arguments that hexe expects.
/// These can be directly parsed with clap or manually
/// constructed in order to present some other user
/// interface.
///
/// NOTE: You must check `version()` and handle it yourself
/// if it is set. Clap won't do a good job with its
/// automatic version support for a library.
#[derive(Parser, Debug)]
#[clap(author, about)]
pub struct Args {
    #[clap(
        short,
        long,
        action,
        long_help = "The file to write logs to

In most modes logs are discarded by default, but if hexe is
running in daemon or pod mode, the logs will go to stderr by default."
    )]
    pub log_file: Option<String>,

    #[clap(
        short,
        long,
        action = clap::ArgAction::Count,
        help = "Show more in logs, may be provided multiple times",
    )]
    pub verbose: u8,

    #[clap(
        short,
        long,
        action,
        long_help = "The path for the unix socket to listen on

This defaults to $XDG_RUNTIME_DIR/hexe/<instance>/ses.sock. The
instance name comes from $HEXE_INSTANCE and lets parallel hexe
instances stay out of each other's way."
    )]
    pub socket: Option<String>,

    #[clap(short, long, action, help = "a toml file containing configuration")]
    pub config_file: Option<String>,

    #[clap(subcommand)]
    pub command: Commands,
}

/// The subcommands that hexe supports.
#[derive(Subcommand, Debug)]
pub enum Commands {
    #[clap(about = "Print version")]
    Version,

    #[clap(about = "Starts the session daemon that routes bytes between muxes and panes")]
    Daemon,

    #[clap(hide = true, about = "Run a single pane's pty owner (spawned by the daemon)")]
    Pod {
        #[clap(long, help = "The pane uuid, 32 hex chars")]
        uuid: String,
        #[clap(long, help = "The socket path to listen on")]
        socket: PathBuf,
        #[clap(long, help = "Command to run instead of the default shell")]
        shell: Option<String>,
        #[clap(long, help = "Initial working directory")]
        cwd: Option<String>,
        #[clap(long, help = "Friendly pane name")]
        name: Option<String>,
        #[clap(long, default_value_t = 80)]
        cols: u16,
        #[clap(long, default_value_t = 24)]
        rows: u16,
    },

    #[clap(about = "Publish shell hook metadata to this pane's pod")]
    Hook {
        #[clap(subcommand)]
        command: HookCommands,
    },

    #[clap(about = "Show the daemon's registry")]
    Status {
        #[clap(long, help = "Include per-pane details")]
        full: bool,
    },

    #[clap(about = "List sessions")]
    List,

    #[clap(about = "Send a notification to a mux")]
    Notify {
        #[clap(help = "The notification text")]
        msg: String,
        #[clap(long, help = "A session id, pane uuid, or name prefix to target")]
        uuid: Option<String>,
    },

    #[clap(name = "focus-move", about = "Ask the mux to move pane focus")]
    FocusMove {
        #[clap(help = "left, right, up or down")]
        dir: String,
    },

    #[clap(name = "exit-intent", about = "Ask the mux whether exiting the terminal is ok

Exits 0 when the mux allows it (or no mux is running), 1 otherwise.")]
    ExitIntent,

    #[clap(name = "send-keys", about = "Type hex-encoded bytes into a pane")]
    SendKeys {
        #[clap(help = "The bytes to send, hex encoded")]
        hex: String,
        #[clap(long, help = "A session id, pane uuid, or name prefix to target")]
        uuid: String,
    },

    #[clap(name = "pop-confirm", about = "Show a yes/no popup in a mux")]
    PopConfirm {
        #[clap(help = "Popup title")]
        title: String,
        #[clap(help = "Popup body")]
        body: String,
        #[clap(long, default_value = "", help = "Target session or pane")]
        uuid: String,
    },

    #[clap(name = "pop-choose", about = "Show a chooser popup in a mux")]
    PopChoose {
        #[clap(help = "Chooser prompt")]
        prompt: String,
        #[clap(help = "The options to choose between", required = true)]
        options: Vec<String>,
        #[clap(long, default_value = "", help = "Target session or pane")]
        uuid: String,
    },
}

#[derive(Subcommand, Debug)]
pub enum HookCommands {
    #[clap(about = "Publish one shell event")]
    Event {
        #[clap(help = "precmd or preexec")]
        phase: String,
        #[clap(long, default_value_t = 0)]
        status: i32,
        #[clap(long, default_value_t = 0)]
        duration_ms: u64,
        #[clap(long, default_value_t = 0)]
        started_at: i64,
        #[clap(long, default_value_t = 0)]
        jobs: u16,
        #[clap(long)]
        running: bool,
        #[clap(long, default_value = "")]
        cmd: String,
    },

    #[clap(about = "Print the pod's prompt decoration")]
    Prompt,
}

impl Args {
    /// Version indicates if the wrapping binary must display the
    /// version then exit.
    pub fn version(&self) -> bool {
        matches!(self.command, Commands::Version)
    }
}

/// Run the hexe tool with the given arguments.
pub fn run(args: Args) -> anyhow::Result<()> {
    let trace_level = if args.verbose == 0 {
        tracing::Level::INFO
    } else if args.verbose == 1 {
        tracing::Level::DEBUG
    } else {
        tracing::Level::TRACE
    };
    if let Some(log_file) = args.log_file.clone() {
        let file = fs::File::create(log_file)?;
        tracing_subscriber::fmt()
            .with_max_level(trace_level)
            .with_thread_ids(true)
            .with_target(false)
            .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
            .with_writer(Mutex::new(file))
            .init();
    } else if matches!(args.command, Commands::Daemon | Commands::Pod { .. }) {
        tracing_subscriber::fmt()
            .with_max_level(trace_level)
            .with_thread_ids(true)
            .with_target(false)
            .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
            .with_writer(io::stderr)
            .init();
    }

    let socket = match &args.socket {
        Some(s) => PathBuf::from(s),
        None => paths::ses_socket()?,
    };

    let config = config::read_config(&args.config_file).context("reading config")?;

    let res: anyhow::Result<()> = match args.command {
        Commands::Version => return Err(anyhow!("wrapper binary must handle version")),
        Commands::Daemon => ses::run(config, socket),
        Commands::Pod { uuid, socket: pod_socket, shell, cwd, name, cols, rows } => {
            let uuid = Uuid::from_hex(&uuid).context("parsing pane uuid")?;
            pod::run(
                config,
                pod::Args { uuid, socket: pod_socket, shell, cwd, name, cols, rows },
            )
        }
        Commands::Hook { command } => match command {
            HookCommands::Event { phase, status, duration_ms, started_at, jobs, running, cmd } => {
                hook::run_event(hook::EventArgs {
                    phase,
                    status,
                    duration_ms,
                    started_at,
                    jobs,
                    running,
                    cmd,
                })
            }
            HookCommands::Prompt => hook::run_prompt(),
        },
        Commands::Status { full } => cli::status(&socket, full),
        Commands::List => cli::list(&socket),
        Commands::Notify { msg, uuid } => cli::notify(&socket, msg, uuid),
        Commands::FocusMove { dir } => cli::focus_move(&socket, &dir),
        Commands::ExitIntent => match cli::exit_intent(&socket) {
            Ok(true) => Ok(()),
            Ok(false) => {
                eprintln!("mux declined");
                std::process::exit(1);
            }
            Err(e) => Err(e),
        },
        Commands::SendKeys { hex, uuid } => cli::send_keys(&socket, &hex, uuid),
        Commands::PopConfirm { title, body, uuid } => {
            cli::pop_confirm(&socket, uuid, title, body)
        }
        Commands::PopChoose { prompt, options, uuid } => {
            cli::pop_choose(&socket, uuid, prompt, options)
        }
    };

    if let Err(err) = res {
        error!("{:?}", err);
        eprintln!("hexe: {err:#}");
        std::process::exit(1);
    }

    Ok(())
}
