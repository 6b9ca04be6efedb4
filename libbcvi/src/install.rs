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

//! Shell integration: the alias block in rc files and the remote
//! installer.

use std::{env, fs, path::PathBuf, process};

use anyhow::{anyhow, Context};
use tracing::info;

use super::{config, consts, user};

/// The alias block --add-aliases maintains. The aliases only take
/// effect when BCVI_CONF is present, i.e. when the login came in
/// through `bcvi --wrap-ssh`, so sourcing this on the workstation
/// itself is harmless.
fn aliases_block() -> String {
    let lines = [
        consts::ALIASES_START,
        "if [ -n \"$BCVI_CONF\" ]; then",
        "    alias vi='bcvi'",
        "    alias suedit='EDITOR=\"bcvi --command viwait\" sudoedit'",
        "    alias bcp='bcvi --command scpd'",
        "fi",
        consts::ALIASES_END,
    ];
    let mut block = String::new();
    for line in lines {
        block.push_str(line);
        block.push('\n');
    }
    block
}

/// Replace the existing alias block in place, or append one. Pure,
/// and idempotent: applying it twice is the same as applying it
/// once.
pub fn apply_aliases(rc_contents: &str) -> String {
    let block = aliases_block();

    let mut out = String::with_capacity(rc_contents.len() + block.len());
    let mut in_block = false;
    let mut replaced = false;
    for line in rc_contents.lines() {
        if line.trim_end() == consts::ALIASES_START && !replaced {
            in_block = true;
            out.push_str(&block);
            replaced = true;
            continue;
        }
        if in_block {
            if line.trim_end() == consts::ALIASES_END {
                in_block = false;
            }
            continue;
        }
        out.push_str(line);
        out.push('\n');
    }

    if !replaced {
        if !out.is_empty() && !out.ends_with("\n\n") {
            out.push('\n');
        }
        out.push_str(&block);
    }
    out
}

fn rc_file(config: &config::Config, home_dir: &str) -> PathBuf {
    if let Some(rc) = &config.shell_rc {
        return PathBuf::from(rc);
    }
    let bashrc = PathBuf::from(home_dir).join(".bashrc");
    if bashrc.exists() {
        bashrc
    } else {
        PathBuf::from(home_dir).join(".profile")
    }
}

/// The --add-aliases mode.
pub fn run_add_aliases(config_file: &Option<String>) -> anyhow::Result<()> {
    let config = config::read_config(config_file)?;
    let user_info = user::info().context("resolving user info")?;
    let rc = rc_file(&config, &user_info.home_dir);

    let contents = match fs::read_to_string(&rc) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e).with_context(|| format!("reading {:?}", rc)),
    };

    fs::write(&rc, apply_aliases(&contents)).with_context(|| format!("writing {:?}", rc))?;
    println!("updated bcvi aliases in {}", rc.display());
    Ok(())
}

/// The --install mode: put this executable and its aliases on each
/// named host. ssh and scp do the transport; this is just plumbing
/// around them.
pub fn run_install(hosts: &[String]) -> anyhow::Result<()> {
    let exe = env::current_exe().context("resolving our own executable")?;

    for host in hosts {
        info!("installing on {}", host);

        let status = process::Command::new("ssh")
            .arg(host)
            .arg("mkdir -p bin")
            .status()
            .context("running ssh")?;
        if !status.success() {
            return Err(anyhow!("could not create bin directory on {}", host));
        }

        let status = process::Command::new("scp")
            .arg("-q")
            .arg(&exe)
            .arg(format!("{}:bin/bcvi", host))
            .status()
            .context("running scp")?;
        if !status.success() {
            return Err(anyhow!("could not copy bcvi to {}", host));
        }

        let status = process::Command::new("ssh")
            .arg(host)
            .arg("./bin/bcvi --add-aliases")
            .status()
            .context("running ssh")?;
        if !status.success() {
            return Err(anyhow!("could not install aliases on {}", host));
        }

        println!("installed bcvi on {}", host);
    }
    Ok(())
}
