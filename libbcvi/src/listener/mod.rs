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

use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher as _},
    net::TcpListener,
    process, thread, time,
};

use anyhow::{anyhow, Context};
use nix::{errno::Errno, sys::signal, unistd::Pid};
use rand::RngCore as _;
use tracing::{info, instrument, warn};

use crate::{config, consts, user};

pub mod handlers;
mod server;
mod signals;

const TAKEOVER_SIGNALS: [signal::Signal; 4] = [
    signal::Signal::SIGHUP,
    signal::Signal::SIGHUP,
    signal::Signal::SIGKILL,
    signal::Signal::SIGKILL,
];
const TAKEOVER_WAIT: time::Duration = time::Duration::from_secs(1);

/// The --listener mode: replace any prior listener, persist our
/// identity, then serve the accept loop forever.
#[instrument(skip_all)]
pub fn run(
    config_file: &Option<String>,
    port_override: Option<u16>,
    reuse_auth: bool,
    registry: Option<handlers::Registry>,
) -> anyhow::Result<()> {
    info!("\n\n======================== STARTING LISTENER ============================\n\n");

    let config = config::read_config(config_file)?;
    let user_info = user::info().context("resolving user info")?;
    let home = user_info.home_dir.clone();

    kill_prior_listener(&home)?;

    config::write_state_file(&home, consts::LISTENER_PID_FILE, &process::id().to_string())?;

    let port = port_override.unwrap_or_else(|| config::default_port(user_info.uid));
    let addr = config
        .listen_address
        .clone()
        .unwrap_or(String::from(consts::DEFAULT_LISTEN_ADDRESS));

    let auth_key = if reuse_auth {
        config::read_state_file(&home, consts::LISTENER_KEY_FILE)?
            .ok_or(anyhow!("--reuse-auth passed but there is no previous auth key on file"))?
    } else {
        generate_auth_key(&format!("{}:{}", addr, port))
    };
    config::write_state_file(&home, consts::LISTENER_KEY_FILE, &auth_key)?;

    // std's TcpListener sets SO_REUSEADDR on unix, so rebinding
    // right after killing the prior listener does not trip over
    // TIME_WAIT sockets
    let listener = TcpListener::bind((addr.as_str(), port))
        .with_context(|| format!("binding {}:{}", addr, port))?;
    let bound_port = listener.local_addr().context("resolving bound address")?.port();
    config::write_state_file(&home, consts::LISTENER_PORT_FILE, &bound_port.to_string())?;

    signals::Handler::new(config::state_dir(&home).join(consts::LISTENER_PID_FILE)).spawn()?;

    let mut registry = registry.unwrap_or_default();
    registry.load_config_commands(&config);

    info!("listening on {}:{}", addr, bound_port);
    let server = server::Server::new(config, registry, auth_key, home);
    server::Server::serve(server, listener)
}

/// Exactly one listener per user: walk any prior listener through
/// SIGHUP, SIGHUP, SIGKILL, SIGKILL with one second waits until it
/// is gone. A pid that no longer exists is success; one we are not
/// allowed to signal means the pid file is stale.
#[instrument(skip_all)]
fn kill_prior_listener(home: &str) -> anyhow::Result<()> {
    let pid_str = match config::read_state_file(home, consts::LISTENER_PID_FILE)? {
        Some(s) => s,
        None => return Ok(()),
    };
    let pid: i32 = match pid_str.parse() {
        Ok(pid) => pid,
        Err(_) => {
            warn!("ignoring malformed pid file contents '{}'", pid_str);
            return Ok(());
        }
    };
    let pid = Pid::from_raw(pid);

    for sig in TAKEOVER_SIGNALS {
        match signal::kill(pid, sig) {
            Ok(_) => {
                info!("sent {} to prior listener {}", sig, pid);
                thread::sleep(TAKEOVER_WAIT);
            }
            Err(Errno::ESRCH) => {
                info!("prior listener {} is gone", pid);
                return Ok(());
            }
            Err(Errno::EPERM) => {
                warn!("pid file names pid {} we cannot signal, treating it as stale", pid);
                return Ok(());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("signalling prior listener {}", pid));
            }
        }
    }

    match signal::kill(pid, None) {
        Err(Errno::ESRCH) => Ok(()),
        // pid could have been recycled by now; the bind below is
        // the real arbiter
        _ => {
            warn!("prior listener {} still present after SIGKILL", pid);
            Ok(())
        }
    }
}

/// A fresh shared secret for this listener instance: two rounds of
/// hashing over our address, pid, the wall clock, and OS entropy,
/// rendered as 32 hex digits.
fn generate_auth_key(self_address: &str) -> String {
    let now = time::SystemTime::now()
        .duration_since(time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);

    let mut key = String::with_capacity(32);
    for round in 0u8..2 {
        let mut hasher = DefaultHasher::new();
        self_address.hash(&mut hasher);
        process::id().hash(&mut hasher);
        now.hash(&mut hasher);
        rand::rngs::OsRng.next_u64().hash(&mut hasher);
        round.hash(&mut hasher);
        key.push_str(&format!("{:016x}", hasher.finish()));
    }
    key
}
