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

//! Smuggling configuration through $TERM.
//!
//! Once ssh is running there is no clean way to hand new environment
//! variables to the remote session, but sshd does propagate TERM. So
//! the ssh wrapper appends "\nBCVI_CONF=..." to TERM before exec'ing
//! ssh, and the remote shell runs `eval "$(bcvi --unpack-term)"` at
//! login to split the real terminal type back out. The format is
//! byte-exact by contract: already deployed remote shells depend on
//! it.

use std::env;

use super::consts;

/// Build the TERM value the ssh wrapper exports: the original
/// terminal type, a newline, then the connection descriptor.
pub fn pack(term: &str, conf: &str) -> String {
    format!("{}\nBCVI_CONF={}", term, conf)
}

/// Turn an overloaded TERM value back into shell code for `eval`.
///
/// The first line is the real terminal type; each later NAME=VALUE
/// line becomes an export. A TERM with no embedded payload yields
/// nothing, so the login hook is a no-op on direct logins. Values
/// come from the originating workstation, so plain double quoting
/// is safe.
pub fn unpack(term_value: &str) -> String {
    let mut lines = term_value.split('\n').map(|l| l.strip_suffix('\r').unwrap_or(l));
    let real_term = match lines.next() {
        Some(t) => t,
        None => return String::new(),
    };

    let mut out = String::new();
    for line in lines {
        if let Some((name, value)) = line.split_once('=') {
            out.push_str(&format!("export {}=\"{}\"\n", name, value));
        }
    }
    if out.is_empty() {
        return out;
    }

    format!("TERM={}\n{}", real_term, out)
}

/// The --unpack-term mode: emit the shell code for the current TERM.
pub fn run_unpack() -> anyhow::Result<()> {
    let term = env::var(consts::TERM_VAR).unwrap_or_default();
    print!("{}", unpack(&term));
    Ok(())
}
