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

/// hexe is a terminal multiplexer core with a split process topology:
/// one persistent session daemon (`hexe daemon`), one pty-owning pod
/// per pane, and disposable mux clients that can crash or detach
/// without taking the shells down with them.
use clap::Parser;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    let args = libhexe::Args::parse();

    if args.version() {
        println!("hexe {}", VERSION);
        return Ok(());
    }

    libhexe::run(args)
}
