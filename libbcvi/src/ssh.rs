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

//! The ssh wrapper: `bcvi --wrap-ssh -- <ssh args>`.
//!
//! Scans the user's ssh command line for the target host, prepends a
//! reverse port forward for the back-channel, packs the connection
//! descriptor into TERM, and execs the real ssh.

use std::{env, os::unix::process::CommandExt as _, process};

use anyhow::{anyhow, Context};
use tracing::{info, warn};

use super::{config, consts, term, user};

// The ssh option letters that consume a following argument. Keep in
// sync with ssh(1); a letter missing here makes its value look like
// a host candidate.
const OPTS_WITH_ARG: &str = "bcDeFiLlmOopRS";

/// What to do with the user's ssh invocation.
#[derive(Debug, PartialEq, Eq)]
pub enum Rewrite {
    /// One target host was identified; run ssh with the given argv
    /// and TERM value.
    Tunneled { argv: Vec<String>, term: String },
    /// The host could not be identified unambiguously, so run ssh
    /// untouched rather than guess.
    Passthrough,
}

/// Scan an ssh argv for the login user (-l) and the host candidates
/// (every non-option token).
fn scan(args: &[String]) -> (Option<String>, Vec<usize>) {
    let mut login_user = None;
    let mut host_indexes = vec![];

    let mut i = 0;
    while i < args.len() {
        let tok = &args[i];
        if let Some(rest) = tok.strip_prefix('-') {
            let mut chars = rest.chars();
            match chars.next() {
                Some(flag) if OPTS_WITH_ARG.contains(flag) => {
                    let inline_value: String = chars.collect();
                    let value = if inline_value.is_empty() {
                        // the value is the next token
                        i += 1;
                        args.get(i).cloned()
                    } else {
                        Some(inline_value)
                    };
                    if flag == 'l' {
                        login_user = value;
                    }
                }
                _ => {
                    // a value-less option like -A or -v
                }
            }
        } else {
            host_indexes.push(i);
        }
        i += 1;
    }

    (login_user, host_indexes)
}

/// Rewrite an ssh argv to carry the back-channel. Pure so that the
/// port and TERM computation is testable without exec'ing anything.
pub fn rewrite(
    args: &[String],
    orig_term: &str,
    remote_port: u16,
    local_port: u16,
    auth_key: &str,
) -> Rewrite {
    let (login_user, host_indexes) = scan(args);
    if host_indexes.len() != 1 {
        return Rewrite::Passthrough;
    }

    let host = &args[host_indexes[0]];
    let alias = match &login_user {
        Some(user) if !host.contains('@') => format!("{}@{}", user, host),
        _ => host.clone(),
    };

    let conf = format!("{}:localhost:{}:{}", alias, remote_port, auth_key);
    let mut argv = vec![String::from("-R"), format!("{}:localhost:{}", remote_port, local_port)];
    argv.extend(args.iter().cloned());

    Rewrite::Tunneled { argv, term: term::pack(orig_term, &conf) }
}

/// The --wrap-ssh mode. Never returns on success: the process image
/// is replaced by ssh.
pub fn run(ssh_args: Vec<String>, port_override: Option<u16>) -> anyhow::Result<()> {
    let user_info = user::info().context("resolving user info")?;

    let remote_port = port_override.unwrap_or_else(|| config::default_port(user_info.uid));
    let local_port = match config::read_state_file(&user_info.home_dir, consts::LISTENER_PORT_FILE)?
    {
        Some(p) => p
            .parse()
            .with_context(|| format!("parsing {} file", consts::LISTENER_PORT_FILE))?,
        None => config::default_port(user_info.uid),
    };
    let auth_key = config::read_state_file(&user_info.home_dir, consts::LISTENER_KEY_FILE)?
        .ok_or(anyhow!("no listener auth key on file, run `bcvi --listener` first"))?;
    let orig_term = env::var(consts::TERM_VAR).unwrap_or_default();

    let mut cmd = process::Command::new("ssh");
    match rewrite(&ssh_args, &orig_term, remote_port, local_port, &auth_key) {
        Rewrite::Tunneled { argv, term } => {
            info!("exec ssh {:?}", argv);
            cmd.args(&argv).env(consts::TERM_VAR, term);
        }
        Rewrite::Passthrough => {
            warn!("could not identify the ssh target host");
            eprintln!("bcvi: cannot identify a unique target host, skipping tunnel setup");
            cmd.args(&ssh_args);
        }
    }

    let err = cmd.exec();
    Err(err).context("exec'ing ssh")
}
