// Copyright 2023 Google LLC
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

use std::{fs, path::PathBuf, process, thread};

use anyhow::Context;
use signal_hook::{consts, flag, iterator::Signals};
use tracing::{error, info};

/// Cleans up the pid file and exits when the listener is told to go
/// away. SIGHUP is included because that is the first signal a
/// replacement listener sends during takeover.
pub struct Handler {
    pid_file: PathBuf,
}

impl Handler {
    pub fn new(pid_file: PathBuf) -> Self {
        Handler { pid_file }
    }

    pub fn spawn(self) -> anyhow::Result<()> {
        use std::sync::{atomic::AtomicBool, Arc};

        info!("spawning signal handler thread");

        let sigs = [consts::SIGHUP, consts::SIGINT, consts::SIGTERM, consts::SIGQUIT];

        // This sets us up to shutdown immediately if someone
        // mashes ^C so we don't get stuck attempting a graceful
        // shutdown.
        let term_now = Arc::new(AtomicBool::new(false));
        for sig in sigs {
            // When terminated by a second term signal, exit with exit code 1.
            // This will do nothing the first time (because term_now is false).
            flag::register_conditional_shutdown(sig, 1, Arc::clone(&term_now))?;
            // But this will "arm" the above for the second time, by setting it to true.
            // The order of registering these is important, if you put this one first, it
            // will first arm and then terminate ‒ all in the first round.
            flag::register(sig, Arc::clone(&term_now))?;
        }

        let mut signals = Signals::new(sigs).context("creating signal iterator")?;
        thread::spawn(move || {
            // Signals are exposed via an iterator so this loop is just to consume
            // that by blocking until the first value is emitted. Clippy thinks we
            // are looping over a collection and is confused about why we always
            // exit in the loop body.
            #[allow(clippy::never_loop)]
            for signal in &mut signals {
                info!("term sig handler: got signal {}", signal);

                // only remove the pid file while it still names us;
                // a replacement listener may have rewritten it
                match fs::read_to_string(&self.pid_file) {
                    Ok(contents) if contents.trim() == process::id().to_string() => {
                        if let Err(e) = fs::remove_file(&self.pid_file) {
                            error!("error cleaning up pid file: {}", e);
                        }
                    }
                    Ok(_) => {
                        info!("pid file no longer ours, leaving it in place");
                    }
                    Err(e) => {
                        info!("could not read pid file during cleanup: {}", e);
                    }
                }

                info!("term sig handler: exiting");
                std::process::exit(0);
            }
        });

        Ok(())
    }
}
