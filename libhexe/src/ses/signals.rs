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

use std::sync::{atomic::AtomicBool, Arc};

use anyhow::Context;
use signal_hook::{consts::TERM_SIGNALS, flag};

/// Arrange for TERM signals to post a stop flag the event loop checks
/// on its next wake. A second TERM signal hard-exits in case the loop
/// is wedged and someone is mashing ^C.
pub fn register_shutdown_flag() -> anyhow::Result<Arc<AtomicBool>> {
    let stop = Arc::new(AtomicBool::new(false));
    for sig in TERM_SIGNALS {
        // When terminated by a second term signal, exit with exit code 1.
        // This will do nothing the first time (because stop is false).
        flag::register_conditional_shutdown(*sig, 1, Arc::clone(&stop))
            .context("registering conditional shutdown")?;
        // But this will "arm" the above for the second time, by setting it to true.
        // The order of registering these is important, if you put this one first, it
        // will first arm and then terminate ‒ all in the first round.
        flag::register(*sig, Arc::clone(&stop)).context("registering term flag")?;
    }
    Ok(stop)
}
